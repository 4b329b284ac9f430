use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use eventcast_relay::{
    app,
    auth::{AnonymousAuthenticator, Authenticator, JwtAuthenticator},
    config::{Cli, Config},
    serve,
    telemetry::Telemetry,
    SignalingState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let config = Config::try_from(Cli::parse())?;
    info!(
        listen_addr = %config.listen_addr,
        auth_enabled = config.jwt_secret.is_some(),
        idle_timeout_secs = config.relay.idle_timeout.as_secs(),
        outbound_buffer = config.relay.outbound_buffer,
        "starting eventcast relay"
    );

    let authenticator: Arc<dyn Authenticator> = match &config.jwt_secret {
        Some(secret) => Arc::new(JwtAuthenticator::new(secret.as_bytes())),
        None => {
            warn!("JWT_SECRET not set; accepting unauthenticated signaling clients");
            Arc::new(AnonymousAuthenticator)
        }
    };

    let signaling = SignalingState::new(config.relay.clone(), authenticator);
    let router = app(signaling.clone(), Some(telemetry.metrics_handle()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("eventcast relay listening on {}", config.listen_addr);

    let drain = signaling.clone();
    serve(listener, router, async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        drain.close_all();
    })
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "waiting for connection tasks to finish"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}
