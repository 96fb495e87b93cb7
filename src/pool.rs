//! Client pool
//!
//! Upstream handles are pooled per [`PoolKey`] (upstream model id plus
//! workspace root). A handle is owned either by the pool (available) or by
//! exactly one request (checked out). Bookkeeping lives behind a synchronous
//! mutex that is never held across an `.await`.
//!
//! When a key is saturated, `acquire` mints a temporary overflow handle
//! instead of waiting. Overflow handles are closed after use and never enter
//! the available list.
//!
//! Every pooled checkout carries a revocation token. Shutdown fires the
//! tokens so owning requests give their handles back, then waits for them.

use crate::agent::{AgentConnector, AgentHandle, CreateOptions, UpdateSink, UpstreamFailure};
use crate::config::ModelConfig;
use crate::credentials::CredentialStore;
use crate::error::{AppError, AppResult};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Workspace component used when a request carries no workspace root
pub const DEFAULT_WORKSPACE: &str = "__default__";

/// How long shutdown waits for revoked handles to come back
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pool partition: `(upstream model id, workspace root)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    upstream_model: String,
    workspace: Option<PathBuf>,
}

impl PoolKey {
    pub fn new(upstream_model: impl Into<String>, workspace: Option<&Path>) -> Self {
        Self {
            upstream_model: upstream_model.into(),
            workspace: workspace.map(Path::to_path_buf),
        }
    }

    pub fn upstream_model(&self) -> &str {
        &self.upstream_model
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.workspace {
            Some(workspace) => write!(f, "{}::{}", self.upstream_model, workspace.display()),
            None => write!(f, "{}::{}", self.upstream_model, DEFAULT_WORKSPACE),
        }
    }
}

/// Point-in-time counters for one pool key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub key: String,
    pub available: usize,
    pub in_use: usize,
    pub creating: usize,
    pub capacity: usize,
}

struct IdleHandle {
    id: u64,
    handle: Box<dyn AgentHandle>,
}

#[derive(Default)]
struct PoolEntry {
    available: Vec<IdleHandle>,
    in_use: HashMap<u64, CancellationToken>,
    creating: usize,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<PoolKey, PoolEntry>,
    shut_down: bool,
}

struct PoolInner {
    connector: Arc<dyn AgentConnector>,
    credentials: Arc<CredentialStore>,
    capacity: usize,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    returned: Notify,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Forget a checked-out handle that will not come back
    fn forget(&self, key: &PoolKey, id: u64) {
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.in_use.remove(&id);
        }
        drop(state);
        self.returned.notify_waiters();
    }

    fn checked_out_count(&self) -> usize {
        let state = self.lock_state();
        state.entries.values().map(|e| e.in_use.len()).sum()
    }
}

/// Reservation of one creation slot
///
/// Dropping an uncommitted slot gives the slot back, so a creation future
/// that is cancelled or fails never leaks the `creating` counter.
struct CreationSlot {
    inner: Arc<PoolInner>,
    key: PoolKey,
    pending: bool,
}

impl CreationSlot {
    /// Convert the reservation into a checked-out handle in one step
    fn commit(mut self, id: u64, revoke: CancellationToken) {
        self.pending = false;
        let mut state = self.inner.lock_state();
        if state.shut_down {
            revoke.cancel();
        }
        if let Some(entry) = state.entries.get_mut(&self.key) {
            entry.creating = entry.creating.saturating_sub(1);
            entry.in_use.insert(id, revoke);
        }
    }
}

impl Drop for CreationSlot {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        let mut state = self.inner.lock_state();
        if let Some(entry) = state.entries.get_mut(&self.key) {
            entry.creating = entry.creating.saturating_sub(1);
        }
    }
}

/// A handle checked out of the pool
///
/// Must be given back with [`ClientPool::release`] or [`ClientPool::discard`].
/// A handle dropped without either is forgotten by the pool and closed in the
/// background.
pub struct PooledHandle {
    id: u64,
    key: PoolKey,
    overflow: bool,
    reused: bool,
    handle: Option<Box<dyn AgentHandle>>,
    revoke: CancellationToken,
    inner: Arc<PoolInner>,
}

impl PooledHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// True for temporary handles minted above capacity
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// True when the handle came from the available list
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Resolves once the pool wants this handle back (shutdown)
    pub fn revoked(&self) -> WaitForCancellationFuture<'_> {
        self.revoke.cancelled()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoke.is_cancelled()
    }

    pub async fn prompt(&self, text: &str) -> Result<String, UpstreamFailure> {
        match &self.handle {
            Some(handle) => handle.prompt(text).await,
            None => Err(UpstreamFailure::new("handle already returned to the pool")),
        }
    }

    pub fn set_update_sink(&self, sink: Option<UpdateSink>) {
        if let Some(handle) = &self.handle {
            handle.set_update_sink(sink);
        }
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("overflow", &self.overflow)
            .field("reused", &self.reused)
            .finish()
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !self.overflow {
            self.inner.forget(&self.key, self.id);
        }
        tracing::warn!(
            pool_key = %self.key,
            handle_id = self.id,
            "Pooled handle dropped without release, closing in background"
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                handle.close().await;
            });
        }
    }
}

/// Per-(model, workspace) bounded pool of upstream handles
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    pub fn new(
        connector: Arc<dyn AgentConnector>,
        credentials: Arc<CredentialStore>,
        capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                credentials,
                capacity: capacity.max(1),
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
                returned: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.inner.credentials
    }

    /// Check out a handle for `model` in `workspace`
    ///
    /// Order of preference: an available handle, a newly created pooled
    /// handle if `in_use + creating < capacity`, otherwise an overflow handle.
    pub async fn acquire(
        &self,
        model: &ModelConfig,
        workspace: Option<&Path>,
    ) -> AppResult<PooledHandle> {
        let key = PoolKey::new(model.upstream_id(), workspace);

        let slot = {
            let mut state = self.inner.lock_state();
            if state.shut_down {
                return Err(AppError::Internal("client pool is shut down".to_string()));
            }
            let entry = state.entries.entry(key.clone()).or_default();

            if let Some(idle) = entry.available.pop() {
                let revoke = CancellationToken::new();
                entry.in_use.insert(idle.id, revoke.clone());
                tracing::debug!(pool_key = %key, handle_id = idle.id, "Reusing pooled handle");
                return Ok(self.checked_out(idle.id, key, idle.handle, revoke, false, true));
            }

            if entry.in_use.len() + entry.creating < self.inner.capacity {
                entry.creating += 1;
                Some(CreationSlot {
                    inner: self.inner.clone(),
                    key: key.clone(),
                    pending: true,
                })
            } else {
                None
            }
        };

        let credentials = self.inner.credentials.get().await?;
        let options = CreateOptions {
            model: model.upstream_id().to_string(),
            api_key: credentials.access_token().to_string(),
            api_url: credentials.endpoint_url().to_string(),
            workspace_root: workspace.map(Path::to_path_buf),
        };

        let handle = self.inner.connector.create(options).await.map_err(|failure| {
            tracing::warn!(pool_key = %key, error = %failure, "Failed to create upstream handle");
            AppError::from(failure)
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let revoke = CancellationToken::new();
        match slot {
            Some(slot) => {
                slot.commit(id, revoke.clone());
                tracing::debug!(pool_key = %key, handle_id = id, "Created pooled handle");
                Ok(self.checked_out(id, key, handle, revoke, false, false))
            }
            None => {
                tracing::info!(
                    pool_key = %key,
                    handle_id = id,
                    capacity = self.inner.capacity,
                    "Pool saturated, created overflow handle"
                );
                Ok(self.checked_out(id, key, handle, revoke, true, false))
            }
        }
    }

    fn checked_out(
        &self,
        id: u64,
        key: PoolKey,
        handle: Box<dyn AgentHandle>,
        revoke: CancellationToken,
        overflow: bool,
        reused: bool,
    ) -> PooledHandle {
        PooledHandle {
            id,
            key,
            overflow,
            reused,
            handle: Some(handle),
            revoke,
            inner: self.inner.clone(),
        }
    }

    /// Return a healthy handle to the pool
    ///
    /// The handle is closed instead when it is an overflow handle, when the
    /// available list is full, when it is unknown to the pool, or after
    /// shutdown.
    pub async fn release(&self, mut pooled: PooledHandle) {
        let Some(handle) = pooled.handle.take() else {
            return;
        };
        handle.set_update_sink(None);

        // A handle being closed stays in `in_use` until the close finishes.
        let to_close = {
            let mut state = self.inner.lock_state();
            let shut_down = state.shut_down;
            match state.entries.get_mut(&pooled.key) {
                Some(entry)
                    if !pooled.overflow
                        && !shut_down
                        && entry.available.len() < self.inner.capacity
                        && entry.in_use.contains_key(&pooled.id) =>
                {
                    entry.in_use.remove(&pooled.id);
                    entry.available.push(IdleHandle {
                        id: pooled.id,
                        handle,
                    });
                    None
                }
                _ => Some(handle),
            }
        };

        match to_close {
            Some(handle) => {
                tracing::debug!(
                    pool_key = %pooled.key,
                    handle_id = pooled.id,
                    overflow = pooled.overflow,
                    "Closing released handle"
                );
                handle.close().await;
                if !pooled.overflow {
                    self.inner.forget(&pooled.key, pooled.id);
                }
            }
            None => {
                tracing::debug!(pool_key = %pooled.key, handle_id = pooled.id, "Handle returned to pool");
            }
        }
    }

    /// Remove a handle from the pool unconditionally and close it
    pub async fn discard(&self, mut pooled: PooledHandle, reason: &str) {
        let Some(handle) = pooled.handle.take() else {
            return;
        };
        handle.set_update_sink(None);
        tracing::warn!(
            pool_key = %pooled.key,
            handle_id = pooled.id,
            reason = %reason,
            "Discarding upstream handle"
        );
        handle.close().await;
        if !pooled.overflow {
            self.inner.forget(&pooled.key, pooled.id);
        }
    }

    /// Close every handle and refuse further acquisitions
    ///
    /// Available handles are closed here. Checked-out handles are revoked:
    /// their owners observe [`PooledHandle::revoked`] and hand them back,
    /// which closes them. Waits up to `grace` for that to happen.
    pub async fn shutdown(&self) {
        self.shutdown_within(SHUTDOWN_GRACE).await;
    }

    pub async fn shutdown_within(&self, grace: Duration) {
        let (idle, checked_out) = {
            let mut state = self.inner.lock_state();
            state.shut_down = true;
            let mut idle = Vec::new();
            let mut checked_out = 0;
            for entry in state.entries.values_mut() {
                idle.append(&mut entry.available);
                for revoke in entry.in_use.values() {
                    revoke.cancel();
                }
                checked_out += entry.in_use.len();
            }
            (idle, checked_out)
        };

        tracing::info!(
            idle_handles = idle.len(),
            checked_out_handles = checked_out,
            "Shutting down client pool"
        );
        for IdleHandle { handle, .. } in idle {
            handle.close().await;
        }

        let drained = tokio::time::timeout(grace, async {
            loop {
                let returned = self.inner.returned.notified();
                tokio::pin!(returned);
                returned.as_mut().enable();
                if self.inner.checked_out_count() == 0 {
                    break;
                }
                returned.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                checked_out_handles = self.inner.checked_out_count(),
                "Checked-out handles not returned before shutdown grace expired"
            );
        }

        self.inner.lock_state().entries.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock_state().shut_down
    }

    /// Counters for every known key, sorted by key
    pub fn stats(&self) -> Vec<PoolStats> {
        let state = self.inner.lock_state();
        let mut stats: Vec<PoolStats> = state
            .entries
            .iter()
            .map(|(key, entry)| PoolStats {
                key: key.to_string(),
                available: entry.available.len(),
                in_use: entry.in_use.len(),
                creating: entry.creating,
                capacity: self.inner.capacity,
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Counters for one key, if it has been used
    pub fn stats_for(&self, key: &PoolKey) -> Option<PoolStats> {
        let state = self.inner.lock_state();
        state.entries.get(key).map(|entry| PoolStats {
            key: key.to_string(),
            available: entry.available.len(),
            in_use: entry.in_use.len(),
            creating: entry.creating,
            capacity: self.inner.capacity,
        })
    }
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
