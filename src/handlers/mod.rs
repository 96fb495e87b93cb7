//! HTTP request handlers for the gateway

use crate::agent::AgentConnector;
use crate::config::{Config, ModelsConfig};
use crate::credentials::CredentialStore;
use crate::error::{AppError, AppResult};
use crate::metrics::Metrics;
use crate::middleware::request_id_middleware;
use crate::orchestrator::Orchestrator;
use crate::pool::ClientPool;
use crate::retry::RetryPolicy;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

pub mod health;
pub mod metrics;
pub mod openai;

/// Application state shared across all handlers
///
/// Cloning is cheap: every component is reference counted.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    orchestrator: Orchestrator,
    started: Instant,
}

impl AppState {
    /// Wire the pool, retry policy, metrics and orchestrator from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if metrics registration fails.
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn AgentConnector>,
        credentials: Arc<CredentialStore>,
    ) -> AppResult<Self> {
        let metrics = Metrics::new().map_err(|e| {
            AppError::Internal(format!("Failed to initialize metrics: {}", e))
        })?;
        let pool = ClientPool::new(connector, credentials, config.pool.capacity);
        let retry = RetryPolicy::from_config(&config.retry);
        let models = Arc::new(config.models.clone());
        let timeout = Duration::from_secs(config.server.request_timeout_seconds);

        tracing::debug!(
            pool_capacity = config.pool.capacity,
            max_retries = retry.max_retries(),
            models = models.catalog.len(),
            request_timeout_seconds = config.server.request_timeout_seconds,
            "Application state initialized"
        );

        Ok(Self {
            orchestrator: Orchestrator::new(pool, models, retry, metrics, timeout),
            config,
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn pool(&self) -> &ClientPool {
        self.orchestrator.pool()
    }

    pub fn metrics(&self) -> &Metrics {
        self.orchestrator.metrics()
    }

    pub fn models(&self) -> &ModelsConfig {
        self.orchestrator.models()
    }

    /// Time since the state was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Build the full HTTP router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(openai::completions::handler),
        )
        .route("/v1/models", get(openai::models::list_handler))
        .route("/v1/models/{id}", get(openai::models::get_handler))
        .route("/health", get(health::handler))
        .route("/version", get(health::version_handler))
        .route("/metrics", get(metrics::handler))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}
