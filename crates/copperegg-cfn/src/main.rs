// CopperEgg stack handler entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Build handlers and the dispatcher
// 4. Create mpsc channels
// 5. Spawn WebSocket server task
// 6. Spawn dispatch loop task
// 7. Log job outcomes until Ctrl+C
// 8. Cleanup on exit

use std::sync::Arc;
use std::time::Duration;

use copperegg_cfn::app;
use copperegg_cfn::config;
use copperegg_cfn::handlers;
use copperegg_cfn::protocol::JobStatus;
use copperegg_cfn::ws_server;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("copperegg-cfn starting up");

    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: revealcloud={}, revealuptime={}, listener port {}",
        config.copperegg.revealcloud_url, config.copperegg.revealuptime_url, config.listener_port
    );
    if config.credentials.revealuptime_username.is_none() {
        warn!("No RevealUptime credentials configured; probe requests will be unauthenticated");
    }
    if config.credentials.revealcloud_username.is_none() {
        warn!("No RevealCloud credentials configured; server cleanup will be unauthenticated");
    }

    let dispatcher = Arc::new(app::Dispatcher::new(
        handlers::from_config(&config).context("failed to build handlers")?,
    ));

    let (ws_tx, ws_rx) = mpsc::channel(256);
    let (outcome_tx, mut outcome_rx) = mpsc::channel(256);

    let listener = ws_server::bind(config.listener_port)
        .await
        .with_context(|| {
            format!(
                "failed to bind WebSocket server on port {}",
                config.listener_port
            )
        })?;
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(listener, ws_tx).await {
            error!("WebSocket server error: {}", e);
        }
    });

    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(ws_rx, outcome_tx, dispatcher).await {
            error!("Dispatch loop error: {}", e);
        }
    });

    info!("Ready. Waiting for jobs on 127.0.0.1:{}", config.listener_port);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            outcome = outcome_rx.recv() => {
                let Some(outcome) = outcome else { break };
                match &outcome.status {
                    JobStatus::Completed => info!(
                        job_id = ?outcome.job_id,
                        handler = outcome.handler,
                        finished_at = %outcome.finished_at,
                        "Job completed"
                    ),
                    JobStatus::Failed { reason } => error!(
                        job_id = ?outcome.job_id,
                        handler = outcome.handler,
                        finished_at = %outcome.finished_at,
                        "Job failed: {reason}"
                    ),
                }
            }
            _ = &mut shutdown => {
                info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    // Stop accepting jobs; the dispatch loop drains in-flight work once the
    // ingress channel closes.
    ws_handle.abort();
    drop(outcome_rx);
    if app::drain(app_handle, SHUTDOWN_GRACE).await {
        info!("copperegg-cfn shut down cleanly");
    }
    Ok(())
}

/// Initialize tracing to log to `logs/copperegg-cfn.log`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("copperegg-cfn.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("copperegg_cfn=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
