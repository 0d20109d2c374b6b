// Telemetry: structured logs, optional OTLP trace export, Prometheus metrics

use crate::config::{LogFormat, ObservabilityConfig};
use crate::events::EventKind;
use crate::models::LeaseStatus;
use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::Resource;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

const SERVICE_NAME: &str = "stream-scheduler";

pub const EVENTS_TOTAL: &str = "stream_scheduler_events_total";
pub const CYCLES_TOTAL: &str = "stream_scheduler_cycles_total";
pub const JOB_DURATION_SECONDS: &str = "stream_job_duration_seconds";
pub const LEASE_STATUS: &str = "license_lease_status";

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. Spans are exported over OTLP when an endpoint is set.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("Invalid log level {:?}", config.log_level))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    let otel_layer = match config.tracing_endpoint.as_deref() {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(init_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .with(otel_layer)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::info!(
        log_level = %config.log_level,
        log_format = ?config.log_format,
        tracing_endpoint = config.tracing_endpoint.as_deref(),
        "Logging initialized"
    );
    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .with_context(|| format!("Failed to build OTLP span exporter for {}", endpoint))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(SERVICE_NAME))
}

/// Flush buffered spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Serve `/metrics` for Prometheus and register metric descriptions
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_counter!(EVENTS_TOTAL, "Job and lease transition events by kind");
    describe_counter!(CYCLES_TOTAL, "Dispatch cycles by outcome");
    describe_histogram!(
        JOB_DURATION_SECONDS,
        Unit::Seconds,
        "Execution callback duration by resulting job status"
    );
    describe_gauge!(
        LEASE_STATUS,
        "Current lease status: 0 unacquired, 1 valid, 2 grace, 3 expired"
    );

    tracing::info!(%addr, "Prometheus metrics exporter listening");
    Ok(())
}

pub fn record_event(kind: EventKind) {
    counter!(EVENTS_TOTAL, "event" => kind.as_str()).increment(1);
}

/// Outcome is one of `completed`, `interrupted`, `skipped`, `aborted`
pub fn record_cycle(outcome: &'static str) {
    counter!(CYCLES_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_job_duration(status: &'static str, duration_seconds: f64) {
    histogram!(JOB_DURATION_SECONDS, "status" => status).record(duration_seconds);
}

pub fn set_lease_status(status: LeaseStatus) {
    gauge!(LEASE_STATUS).set(status.as_gauge());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_rejects_bad_level() {
        let config = ObservabilityConfig {
            log_level: "scheduler=loud".to_string(),
            ..Default::default()
        };
        // RUST_LOG, when set, overrides the configured level
        if std::env::var("RUST_LOG").is_err() {
            assert!(init_logging(&config).is_err());
        }
    }

    #[test]
    fn test_init_logging_compact_format() {
        let config = ObservabilityConfig {
            log_format: LogFormat::Compact,
            ..Default::default()
        };
        // Only the first subscriber installed in the test binary wins
        let _ = init_logging(&config);
        tracing::info!("compact logging smoke test");
    }

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        record_event(EventKind::JobStarted);
        record_cycle("completed");
        record_job_duration("succeeded", 1.5);
        set_lease_status(LeaseStatus::Grace);
    }
}
