// Scheduler binary entry point

use anyhow::{Context, Result};
use common::bootstrap::{build_licensing_client, build_runner};
use common::clock::{Clock, IntervalTickSource, SystemClock};
use common::config::Settings;
use common::events::{EventSink, TracingEventSink};
use common::executor::{JobExecutor, LoggingExecutor};
use common::telemetry::{init_logging, init_metrics, shutdown_tracer};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;

    init_logging(&settings.observability)?;

    info!("Starting stream scheduler");

    if let Err(e) = settings.validate() {
        error!(error = %e, "Invalid configuration");
        anyhow::bail!("Invalid configuration: {}", e);
    }

    info!(
        runner_id = %settings.runner.runner_id,
        tick_interval_seconds = settings.runner.tick_interval_seconds,
        lock_backend = ?settings.lock.backend,
        storage_backend = ?settings.storage.backend,
        licensing_endpoint = %settings.licensing.endpoint,
        "Configuration loaded"
    );

    init_metrics(&settings.observability)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);

    // Licensing: a failed first acquisition is retried by the renewal loop
    let licensing = build_licensing_client(&settings, clock.clone(), events.clone())?;
    if let Err(e) = licensing.acquire(settings.licensing.credentials()).await {
        warn!(error = %e, "Initial lease acquisition failed, licensed features disabled until it succeeds");
    }
    let renewal_task = licensing.start();

    let executor: Arc<dyn JobExecutor> = Arc::new(LoggingExecutor);
    let runner = build_runner(&settings, clock.clone(), licensing.clone(), executor, events).await?;

    match runner.recover(clock.now()).await {
        Ok(recovered) => info!(recovered, "Startup recovery finished"),
        Err(e) => warn!(error = %e, "Startup recovery failed, retrying on the next cycle"),
    }

    // Set up graceful shutdown
    let runner_for_shutdown = runner.clone();
    let licensing_for_shutdown = licensing.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        runner_for_shutdown.stop();
        licensing_for_shutdown.stop();
    });

    let ticks = IntervalTickSource::new(settings.runner.tick_interval_seconds, clock);
    let runner_task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.start(ticks).await })
    };

    if let Err(e) = runner_task.await {
        error!(error = %e, "Scheduler runner task failed");
    }
    licensing.stop();
    if let Err(e) = renewal_task.await {
        error!(error = %e, "Lease renewal task failed");
    }

    shutdown_tracer();
    info!("Stream scheduler stopped");
    Ok(())
}
