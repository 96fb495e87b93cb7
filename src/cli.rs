//! Command-line interface for the gateway
//!
//! Provides argument parsing and subcommand handling for the `acp-gateway`
//! binary.

use clap::{Parser, Subcommand};

/// OpenAI-compatible chat completions gateway for ACP agents
#[derive(Parser)]
#[command(name = "acp-gateway")]
#[command(version)]
#[command(about = "OpenAI-compatible chat completions gateway for ACP agents")]
#[command(
    long_about = "acp-gateway accepts OpenAI chat completion requests and runs them \
    against pooled ACP agent sessions, streaming the agent's output back as \
    Server-Sent Events."
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    /// Access token, overriding the credentials file
    #[arg(long, env = "ACP_GATEWAY_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Tenant endpoint URL, overriding the credentials file
    #[arg(long, env = "ACP_GATEWAY_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# acp-gateway Configuration
# ==========================
#
# This file configures the HTTP server, the upstream ACP agent, the client
# pool, retry behaviour, the model catalog and observability settings.

# ─────────────────────────────────────────────────────────────────────────────
# SERVER CONFIGURATION
# ─────────────────────────────────────────────────────────────────────────────

[server]
# IP address to bind to (0.0.0.0 for all interfaces, 127.0.0.1 for localhost only)
host = "127.0.0.1"

# Port to listen on
port = 8787

# Deadline for a single request, retries included (1-3600)
request_timeout_seconds = 600

# ─────────────────────────────────────────────────────────────────────────────
# UPSTREAM AGENT
# ─────────────────────────────────────────────────────────────────────────────
#
# The agent is started as a child process speaking ACP (JSON-RPC over stdio).
# "{model}" in args is replaced with the upstream model id.

[agent]
command = "your-agent"
args = ["--acp", "--model", "{model}"]

# Credentials file with accessToken and endpointURL
# (defaults to ~/.acp-gateway/session.json)
# credentials_path = "/path/to/session.json"

# Environment variables used to pass credentials to the agent process
token_env = "ACP_ACCESS_TOKEN"
endpoint_env = "ACP_ENDPOINT_URL"

# Seconds to wait for the agent to initialize a session
startup_timeout_seconds = 30

# ─────────────────────────────────────────────────────────────────────────────
# CLIENT POOL
# ─────────────────────────────────────────────────────────────────────────────

[pool]
# Idle sessions kept per (model, workspace); bursts beyond this get
# short-lived overflow sessions
capacity = 2

# ─────────────────────────────────────────────────────────────────────────────
# RETRY POLICY
# ─────────────────────────────────────────────────────────────────────────────
#
# delay = min(initial_delay_ms * backoff_multiplier^attempt, max_delay_ms)
# plus or minus jitter_factor * delay

[retry]
max_retries = 3
initial_delay_ms = 1000
max_delay_ms = 10000
backoff_multiplier = 2.0
jitter_factor = 0.1

# ─────────────────────────────────────────────────────────────────────────────
# MODEL CATALOG
# ─────────────────────────────────────────────────────────────────────────────
#
# Requests may name a model by id or by upstream_id. Unknown or missing
# models use the default.

[models]
default = "sonnet"

[[models.catalog]]
id = "sonnet"
upstream_id = "your-upstream-sonnet-id"
display_name = "Sonnet"
context_tokens = 200000
max_output_tokens = 64000

[[models.catalog]]
id = "haiku"
upstream_id = "your-upstream-haiku-id"
display_name = "Haiku"
context_tokens = 200000
max_output_tokens = 8192

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error"
log_level = "info"

# Prometheus metrics are always available at /metrics on the server port
"#
}
