//! Configuration management for the gateway
//!
//! Parses TOML configuration files and provides typed access to settings.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Upper bound for `server.request_timeout_seconds`
pub const MAX_REQUEST_TIMEOUT_SECONDS: u64 = 3_600;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub agent: AgentConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deadline for one request, including retries
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_request_timeout() -> u64 {
    600
}

/// Client pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Target number of handles per (model, workspace) key
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_pool_capacity(),
        }
    }
}

fn default_pool_capacity() -> usize {
    2
}

/// Retry policy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

fn default_max_retries() -> u32 {
    crate::retry::DEFAULT_MAX_RETRIES
}

fn default_initial_delay_ms() -> u64 {
    crate::retry::DEFAULT_INITIAL_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    crate::retry::DEFAULT_MAX_DELAY_MS
}

fn default_backoff_multiplier() -> f64 {
    crate::retry::DEFAULT_BACKOFF_MULTIPLIER
}

/// Replace a leading `~` or `~/` with the home directory
///
/// Paths are returned unchanged when there is no home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn deserialize_home_path<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let path: Option<PathBuf> = Option::deserialize(deserializer)?;
    Ok(path.map(|p| expand_home(&p)))
}

fn default_jitter_factor() -> f64 {
    crate::retry::DEFAULT_JITTER_FACTOR
}

/// Upstream agent process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Executable speaking ACP on stdio
    pub command: String,
    /// Arguments; `{model}` is replaced with the upstream model id
    #[serde(default)]
    pub args: Vec<String>,
    /// Credential file; defaults to `~/.acp-gateway/session.json`
    ///
    /// A leading `~/` is expanded to the home directory when parsed.
    #[serde(default, deserialize_with = "deserialize_home_path")]
    pub credentials_path: Option<PathBuf>,
    /// Environment variable carrying the access token to the agent
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Environment variable carrying the endpoint URL to the agent
    #[serde(default = "default_endpoint_env")]
    pub endpoint_env: String,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
}

fn default_token_env() -> String {
    "ACP_ACCESS_TOKEN".to_string()
}

fn default_endpoint_env() -> String {
    "ACP_ENDPOINT_URL".to_string()
}

fn default_startup_timeout() -> u64 {
    30
}

/// Static model catalog
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    /// Public id used when a request names no model or an unknown one
    pub default: String,
    pub catalog: Vec<ModelConfig>,
}

/// One catalog entry
///
/// Fields are private; the catalog is immutable after validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    id: String,
    upstream_id: String,
    display_name: String,
    context_tokens: u64,
    max_output_tokens: u64,
}

impl ModelConfig {
    pub fn new(
        id: impl Into<String>,
        upstream_id: impl Into<String>,
        display_name: impl Into<String>,
        context_tokens: u64,
        max_output_tokens: u64,
    ) -> Self {
        Self {
            id: id.into(),
            upstream_id: upstream_id.into(),
            display_name: display_name.into(),
            context_tokens,
            max_output_tokens,
        }
    }

    /// Public model identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier passed to the upstream agent
    pub fn upstream_id(&self) -> &str {
        &self.upstream_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn context_tokens(&self) -> u64 {
        self.context_tokens
    }

    pub fn max_output_tokens(&self) -> u64 {
        self.max_output_tokens
    }
}

impl ModelsConfig {
    /// Look up a catalog entry by public id
    pub fn find(&self, id: &str) -> Option<&ModelConfig> {
        self.catalog.iter().find(|m| m.id == id)
    }

    /// Look up a catalog entry by public id, then by upstream id
    pub fn lookup(&self, name: &str) -> Option<&ModelConfig> {
        self.find(name)
            .or_else(|| self.catalog.iter().find(|m| m.upstream_id == name))
    }

    /// The configured default entry
    ///
    /// Validation guarantees it exists; an unvalidated config falls back to
    /// the first entry.
    pub fn default_model(&self) -> Option<&ModelConfig> {
        self.find(&self.default).or_else(|| self.catalog.first())
    }

    /// Resolve a requested model, falling back to the default for unknown ids
    pub fn resolve(&self, requested: Option<&str>) -> Option<&ModelConfig> {
        match requested {
            Some(name) => match self.lookup(name) {
                Some(model) => Some(model),
                None => {
                    tracing::warn!(
                        requested_model = %name,
                        default_model = %self.default,
                        "Unknown model requested, falling back to default"
                    );
                    self.default_model()
                }
            },
            None => self.default_model(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        // Phase 1: read
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|source| AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            })?;

        // Phase 2: parse
        let config: Self = toml::from_str(&content).map_err(|source| {
            AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            }
        })?;

        // Phase 3: validate
        config
            .validate()
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Validate configuration after parsing
    ///
    /// Called by `from_file()` and `from_str()`; call it explicitly when
    /// building a `Config` by hand.
    pub fn validate(&self) -> AppResult<()> {
        let timeout = self.server.request_timeout_seconds;
        if timeout == 0 || timeout > MAX_REQUEST_TIMEOUT_SECONDS {
            return Err(AppError::Config(format!(
                "server.request_timeout_seconds must be in (0, {}], got {}",
                MAX_REQUEST_TIMEOUT_SECONDS, timeout
            )));
        }

        if self.pool.capacity == 0 {
            return Err(AppError::Config(
                "pool.capacity must be at least 1".to_string(),
            ));
        }

        let retry = &self.retry;
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            return Err(AppError::Config(format!(
                "retry.backoff_multiplier must be a finite number >= 1.0, got {}",
                retry.backoff_multiplier
            )));
        }
        if !(0.0..1.0).contains(&retry.jitter_factor) {
            return Err(AppError::Config(format!(
                "retry.jitter_factor must be in [0.0, 1.0), got {}",
                retry.jitter_factor
            )));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(AppError::Config(format!(
                "retry.initial_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
                retry.initial_delay_ms, retry.max_delay_ms
            )));
        }

        if self.agent.command.trim().is_empty() {
            return Err(AppError::Config(
                "agent.command must not be empty".to_string(),
            ));
        }
        if let Some(path) = &self.agent.credentials_path
            && path.starts_with("~")
        {
            return Err(AppError::Config(format!(
                "agent.credentials_path '{}' starts with '~' but no home directory is known",
                path.display()
            )));
        }
        if self.agent.startup_timeout_seconds == 0 {
            return Err(AppError::Config(
                "agent.startup_timeout_seconds must be at least 1".to_string(),
            ));
        }

        self.validate_models()?;

        if !LOG_LEVELS.contains(&self.observability.log_level.as_str()) {
            return Err(AppError::Config(format!(
                "observability.log_level must be one of {:?}, got '{}'",
                LOG_LEVELS, self.observability.log_level
            )));
        }

        Ok(())
    }

    fn validate_models(&self) -> AppResult<()> {
        let models = &self.models;
        if models.catalog.is_empty() {
            return Err(AppError::Config(
                "models.catalog must contain at least one model".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut upstream_ids = HashSet::new();
        for model in &models.catalog {
            if model.id.trim().is_empty() || model.upstream_id.trim().is_empty() {
                return Err(AppError::Config(
                    "models.catalog entries need a non-empty id and upstream_id".to_string(),
                ));
            }
            if model.context_tokens == 0 {
                return Err(AppError::Config(format!(
                    "Model '{}' has context_tokens = 0",
                    model.id
                )));
            }
            if model.max_output_tokens > model.context_tokens {
                return Err(AppError::Config(format!(
                    "Model '{}' has max_output_tokens ({}) greater than context_tokens ({})",
                    model.id, model.max_output_tokens, model.context_tokens
                )));
            }
            if !ids.insert(model.id.as_str()) {
                return Err(AppError::Config(format!(
                    "Duplicate model id '{}' in models.catalog",
                    model.id
                )));
            }
            if !upstream_ids.insert(model.upstream_id.as_str()) {
                return Err(AppError::Config(format!(
                    "Duplicate upstream_id '{}' in models.catalog",
                    model.upstream_id
                )));
            }
        }

        if models.find(&models.default).is_none() {
            return Err(AppError::Config(format!(
                "models.default '{}' does not name a catalog entry",
                models.default
            )));
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(toml_str).map_err(|source| AppError::ConfigParseFailed {
                path: "<string>".to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 9000
request_timeout_seconds = 120

[pool]
capacity = 3

[retry]
max_retries = 2
initial_delay_ms = 50
max_delay_ms = 500
backoff_multiplier = 2.0
jitter_factor = 0.2

[agent]
command = "agent-cli"
args = ["--acp", "--model", "{model}"]

[models]
default = "sonnet"

[[models.catalog]]
id = "sonnet"
upstream_id = "claude-sonnet-4"
display_name = "Sonnet"
context_tokens = 200000
max_output_tokens = 64000

[[models.catalog]]
id = "haiku"
upstream_id = "claude-haiku-4"
display_name = "Haiku"
context_tokens = 200000
max_output_tokens = 8192

[observability]
log_level = "debug"
"#;

    fn parse(toml_str: &str) -> AppResult<Config> {
        Config::from_str(toml_str)
    }

    #[test]
    fn test_config_from_str_parses_successfully() {
        let config = parse(TEST_CONFIG).expect("should parse config");
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.request_timeout_seconds, 120);
        assert_eq!(config.pool.capacity, 3);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.agent.args, vec!["--acp", "--model", "{model}"]);
        assert_eq!(config.models.catalog.len(), 2);
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn test_optional_sections_use_defaults() {
        let minimal = r#"
[server]

[agent]
command = "agent-cli"

[models]
default = "sonnet"

[[models.catalog]]
id = "sonnet"
upstream_id = "claude-sonnet-4"
display_name = "Sonnet"
context_tokens = 200000
max_output_tokens = 64000
"#;
        let config = parse(minimal).expect("should parse minimal config");
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.server.request_timeout_seconds, 600);
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.agent.token_env, "ACP_ACCESS_TOKEN");
        assert_eq!(config.agent.startup_timeout_seconds, 30);
        assert!(config.agent.credentials_path.is_none());
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_credentials_path_expands_home() {
        let config = parse(&TEST_CONFIG.replace(
            "command = \"agent-cli\"",
            "command = \"agent-cli\"\ncredentials_path = \"~/.acp-gateway/session.json\"",
        ))
        .expect("should parse config");

        let home = dirs::home_dir().expect("test environment has a home directory");
        assert_eq!(
            config.agent.credentials_path,
            Some(home.join(".acp-gateway/session.json"))
        );
    }

    #[test]
    fn test_expand_home_leaves_other_paths_alone() {
        assert_eq!(
            expand_home(Path::new("/etc/acp/session.json")),
            PathBuf::from("/etc/acp/session.json")
        );
        assert_eq!(
            expand_home(Path::new("relative/~/session.json")),
            PathBuf::from("relative/~/session.json")
        );
        // Only a bare `~` component is the home directory.
        assert_eq!(expand_home(Path::new("~user/x")), PathBuf::from("~user/x"));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let toml_str = TEST_CONFIG.replace("request_timeout_seconds = 120", "request_timeout_seconds = 0");
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("request_timeout_seconds"));
    }

    #[test]
    fn test_rejects_timeout_above_maximum() {
        let toml_str =
            TEST_CONFIG.replace("request_timeout_seconds = 120", "request_timeout_seconds = 3601");
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn test_rejects_zero_pool_capacity() {
        let toml_str = TEST_CONFIG.replace("capacity = 3", "capacity = 0");
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("pool.capacity"));
    }

    #[test]
    fn test_rejects_bad_jitter() {
        let toml_str = TEST_CONFIG.replace("jitter_factor = 0.2", "jitter_factor = 1.0");
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("jitter_factor"));
    }

    #[test]
    fn test_rejects_output_larger_than_context() {
        let toml_str = TEST_CONFIG.replace("max_output_tokens = 8192", "max_output_tokens = 300000");
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("haiku"));
    }

    #[test]
    fn test_rejects_duplicate_upstream_id() {
        let toml_str = TEST_CONFIG.replace("claude-haiku-4", "claude-sonnet-4");
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("Duplicate upstream_id"));
    }

    #[test]
    fn test_rejects_unknown_default() {
        let toml_str = TEST_CONFIG.replace("default = \"sonnet\"", "default = \"opus\"");
        let err = parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("opus"));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let toml_str = TEST_CONFIG.replace("log_level = \"debug\"", "log_level = \"loud\"");
        assert!(parse(&toml_str).is_err());
    }

    #[test]
    fn test_resolve_known_and_unknown_models() {
        let config = parse(TEST_CONFIG).expect("should parse config");
        let models = &config.models;

        assert_eq!(models.resolve(Some("haiku")).unwrap().upstream_id(), "claude-haiku-4");
        assert_eq!(models.resolve(Some("claude-haiku-4")).unwrap().id(), "haiku");
        assert_eq!(models.resolve(Some("gpt-4o")).unwrap().id(), "sonnet");
        assert_eq!(models.resolve(None).unwrap().id(), "sonnet");
    }

    #[test]
    fn test_from_file_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, AppError::ConfigParseFailed { .. }));
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_from_file_reports_missing_file() {
        let err = Config::from_file("/nonexistent/acp-gateway.toml").unwrap_err();
        assert!(matches!(err, AppError::ConfigFileRead { .. }));
    }

    #[test]
    fn test_from_file_wraps_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, TEST_CONFIG.replace("capacity = 3", "capacity = 0")).unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, AppError::ConfigValidationFailed { .. }));
    }
}
