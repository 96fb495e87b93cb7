//! acp-gateway HTTP server
//!
//! Starts an Axum web server that serves OpenAI chat completions from pooled
//! ACP agent sessions.

use acp_gateway::{
    agent::acp::AcpProcessConnector,
    cli::{Cli, Command, generate_config_template},
    config::Config,
    credentials::{CredentialStore, Credentials, default_credentials_path},
    handlers::{self, AppState},
    telemetry,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Command::Config { output }) = cli.command {
        match output {
            Some(path) => {
                std::fs::write(&path, generate_config_template())?;
                println!("Wrote configuration template to {}", path);
            }
            None => print!("{}", generate_config_template()),
        }
        return Ok(());
    }

    let config = Config::from_file(&cli.config)?;
    telemetry::init(&config.observability.log_level);

    let credentials_path = config
        .agent
        .credentials_path
        .clone()
        .or_else(default_credentials_path);
    let credentials = Arc::new(CredentialStore::from_path(credentials_path));
    match (cli.access_token, cli.endpoint_url) {
        (Some(token), Some(url)) => credentials.override_with(Credentials::new(token, url))?,
        (None, None) => {}
        _ => {
            return Err(
                "--access-token and --endpoint-url must be given together".into(),
            );
        }
    }

    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0])),
        config.server.port,
    ));

    let config = Arc::new(config);
    let connector = Arc::new(AcpProcessConnector::new(config.agent.clone()));
    let state = AppState::new(config.clone(), connector, credentials)?;
    let pool = state.pool().clone();
    let app = handlers::build_router(state);

    tracing::info!(
        address = %addr,
        agent_command = %config.agent.command,
        models = config.models.catalog.len(),
        default_model = %config.models.default,
        pool_capacity = config.pool.capacity,
        "Starting acp-gateway"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    pool.shutdown().await;
    tracing::info!("Client pool closed, exiting");

    Ok(())
}
