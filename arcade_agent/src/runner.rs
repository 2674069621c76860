//! Entry points behind the CLI subcommands.

use anyhow::Result;
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

use crate::agent::LearningAgent;
use crate::channel::{Connector, WebSocketConnector};
use crate::estimator::load_estimator;
use crate::settings::Settings;
use crate::supervisor::{ConnectionSupervisor, SupervisorReport};

/// Connect to the configured game server and learn until `shutdown` resolves.
pub async fn run<F>(settings: &Settings, shutdown: F) -> Result<SupervisorReport>
where
    F: Future<Output = ()>,
{
    let connector = Arc::new(WebSocketConnector::new(
        settings.connection.url.clone(),
        settings.connection.connect_timeout(),
    ));
    run_with(settings, connector, shutdown).await
}

/// Like [`run`], over an arbitrary connector.
pub async fn run_with<F>(
    settings: &Settings,
    connector: Arc<dyn Connector>,
    shutdown: F,
) -> Result<SupervisorReport>
where
    F: Future<Output = ()>,
{
    let agent = LearningAgent::from_settings(settings)?;
    info!(
        "Agent ready: estimator={}, epsilon={:.4}, epoch_size={}",
        settings.learning.estimator,
        agent.epsilon(),
        settings.learning.epoch_size
    );

    let mut supervisor =
        ConnectionSupervisor::new(connector, agent, settings.connection.reconnect_delay());
    Ok(supervisor.run(shutdown).await)
}

/// Human-readable description of the configured checkpoint.
pub fn inspect(settings: &Settings) -> Result<String> {
    let (estimator, store) = load_estimator(settings)?;
    let mut out = String::new();
    writeln!(out, "estimator:  {}", estimator.kind())?;
    writeln!(
        out,
        "checkpoint: {} ({})",
        store.path().display(),
        if store.exists() { "present" } else { "absent" }
    )?;
    writeln!(out, "summary:    {}", estimator.summary())?;
    Ok(out)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return ctrl_c().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully");
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await
        }
    }
}
