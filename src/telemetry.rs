//! OpenTelemetry trace export over OTLP.
//!
//! Export is enabled by setting `OTEL_EXPORTER_OTLP_ENDPOINT`. Reconcile spans
//! are then shipped through a batch exporter on the tokio runtime, next to the
//! regular log output.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

use crate::error::{Error, Result};

pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
pub const SERVICE_NAME: &str = "azure-lb-reconciler";

/// The configured collector endpoint, if trace export is enabled.
pub fn otlp_endpoint() -> Option<String> {
    endpoint_from(std::env::var(OTLP_ENDPOINT_ENV).ok())
}

fn endpoint_from(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resource() -> Resource {
    Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ])
}

/// Install the OTLP batch pipeline and return the layer feeding it.
///
/// Must be called from within the tokio runtime.
pub fn init_telemetry<S>(endpoint: &str) -> Result<OpenTelemetryLayer<S, Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config().with_resource(resource()))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("OTLP trace pipeline for {endpoint}: {e}")))?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush pending spans and stop the exporter.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
