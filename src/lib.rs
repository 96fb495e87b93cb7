//! acp-gateway - OpenAI-compatible chat completions over ACP agent sessions
//!
//! This library accepts OpenAI chat completion requests and runs them against
//! pooled upstream agent sessions, translating the agent's session updates
//! into OpenAI responses or Server-Sent Events chunks.

pub mod agent;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod orchestrator;
pub mod pool;
pub mod retry;
pub mod telemetry;
pub mod translator;
