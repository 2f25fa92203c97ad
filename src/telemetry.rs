//! Telemetry and structured logging for the conversion service.

use crate::engine::SweepReport;
use crate::job::{ConversionJob, JobStatus};
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

const TRACER_NAME: &str = "pdfer";

/// Conversions slower than this are reported as a performance warning.
const SLOW_CONVERSION_MS: i64 = 30_000;

/// Records telemetry for a job that reached a terminal state.
///
/// Emits a `conversion_job` span (job id, status, retry count, duration and
/// the internal error when the job failed) plus a matching structured log
/// line. The internal error only ever goes to telemetry, never to callers.
///
/// # Arguments
///
/// * `job` - A job that completed or failed for good
pub fn record_job_telemetry(job: &ConversionJob) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("conversion_job");

    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("status", job.status.to_string()));
    span.set_attribute(KeyValue::new("retry_count", job.retry_count as i64));
    span.set_attribute(KeyValue::new(
        "source",
        job.source_path.display().to_string(),
    ));

    if let Some(duration_ms) = job.processing_duration_ms() {
        span.set_attribute(KeyValue::new("duration_ms", duration_ms));

        info!(
            job_id = %job.job_id,
            duration_ms = duration_ms,
            status = %job.status,
            retry_count = job.retry_count,
            "Conversion job finished"
        );

        if duration_ms > SLOW_CONVERSION_MS {
            warn!(
                job_id = %job.job_id,
                duration_ms = duration_ms,
                "Conversion exceeded performance threshold ({}ms)",
                SLOW_CONVERSION_MS
            );
        }
    }

    if job.status == JobStatus::Failed {
        if let Some(ref error) = job.error {
            span.set_attribute(KeyValue::new("error", error.clone()));
        }
    }

    span.end();
}

/// Records one kill-and-relaunch cycle of the engine.
///
/// # Arguments
///
/// * `port` - Engine listener port that was swept
/// * `report` - Outcome of the orphan sweep
pub fn record_engine_restart(port: u16, report: &SweepReport) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("engine_restart");

    span.set_attribute(KeyValue::new("port", port as i64));
    span.set_attribute(KeyValue::new("killed", report.killed.len() as i64));
    span.set_attribute(KeyValue::new("survivors", report.failed.len() as i64));
    span.end();

    info!(
        port = port,
        killed = report.killed.len(),
        survivors = report.failed.len(),
        "Engine sweep finished"
    );
}

/// Records the current queue length for status monitoring.
pub fn record_queue_heartbeat(queue_length: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("queue_heartbeat");

    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(queue_length = queue_length, "Status request");
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Call once at startup from inside the Tokio runtime. Reads:
/// - `OTEL_EXPORTER_OTLP_ENDPOINT` - Collector endpoint (default: http://localhost:4317)
/// - `OTEL_SERVICE_NAME` - Service name (default: pdfer)
///
/// # Returns
///
/// An error if the batch exporter could not be installed; the service keeps
/// running without spans in that case.
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = env_or("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317");
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint.as_str());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::config().with_resource(service_resource()),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}

/// Resource attributes attached to every exported span.
fn service_resource() -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::new(vec![
        KeyValue::new("service.name", env_or("OTEL_SERVICE_NAME", TRACER_NAME)),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("service.component", "conversion-engine"),
    ])
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Flushes pending spans on shutdown.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global tracer is a no-op until `init_telemetry` runs, which keeps
    // these tests free of a collector.

    #[test]
    fn test_record_completed_job() {
        let mut job = ConversionJob::new("/tmp/in.docx", "/tmp/out.pdf");
        job.mark_complete();

        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_failed_job() {
        let mut job = ConversionJob::new("/tmp/in.docx", "/tmp/out.pdf");
        job.requeue("listener closed".to_string());
        job.mark_failed("listener closed".to_string());

        record_job_telemetry(&job);
    }

    #[test]
    fn test_record_engine_restart() {
        let report = SweepReport {
            killed: vec![101, 102],
            failed: vec![103],
        };

        record_engine_restart(8085, &report);
        record_queue_heartbeat(3);
    }

    #[test]
    fn test_env_or_falls_back_when_unset() {
        assert_eq!(env_or("PDFER_TEST_UNSET_TELEMETRY_VAR", "pdfer"), "pdfer");
    }
}
