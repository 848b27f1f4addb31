//! OTLP metrics for the write path.
//!
//! Key metrics:
//! - greener_batch_commits_total: Counter for committed batches
//! - greener_batch_aborts_total: Counter for rolled back batches
//! - greener_batch_size: Histogram of units per committed batch
//! - greener_batch_open_seconds: Histogram of time from BEGIN to COMMIT
//! - greener_write_latency_seconds: Histogram of unit latency from submit to outcome
//!
//! Recording is a no-op until [`init_metrics`] or
//! [`init_metrics_with_endpoint`] has been called, so library users that do
//! not care about metrics pay nothing.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::global;
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Store metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Batches committed.
    pub batch_commits: Counter<u64>,
    /// Batches rolled back, by a failing unit or a failed commit.
    pub batch_aborts: Counter<u64>,
    /// Units per committed batch.
    pub batch_size: Histogram<u64>,
    /// Seconds a batch stayed open.
    pub batch_open: Histogram<f64>,
    /// Seconds from submitting a unit to receiving its outcome.
    pub write_latency: Histogram<f64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            batch_commits: meter
                .u64_counter("greener_batch_commits_total")
                .with_description("Total number of committed write batches")
                .with_unit("1")
                .init(),
            batch_aborts: meter
                .u64_counter("greener_batch_aborts_total")
                .with_description("Total number of rolled back write batches")
                .with_unit("1")
                .init(),
            batch_size: meter
                .u64_histogram("greener_batch_size")
                .with_description("Write units per committed batch")
                .with_unit("1")
                .init(),
            batch_open: meter
                .f64_histogram("greener_batch_open_seconds")
                .with_description("Time from BEGIN to COMMIT of a batch")
                .with_unit("s")
                .init(),
            write_latency: meter
                .f64_histogram("greener_write_latency_seconds")
                .with_description("Write unit latency from submit to outcome")
                .with_unit("s")
                .init(),
        }
    }
}

fn manual_provider() -> SdkMeterProvider {
    let reader = ManualReader::builder().build();
    SdkMeterProvider::builder().with_reader(reader).build()
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, metrics stay local");
                    global::set_meter_provider(manual_provider());
                }
            }
        } else {
            // Recorded but never exported.
            global::set_meter_provider(manual_provider());
        }

        let meter = global::meter("greener");
        Metrics::new(&meter)
    });
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record a committed batch.
pub fn record_commit(batch_size: usize, open_seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.batch_commits.add(1, &[]);
        m.batch_size.record(batch_size as u64, &[]);
        m.batch_open.record(open_seconds, &[]);
    }
}

/// Record a rolled back batch.
pub fn record_abort() {
    if let Some(m) = METRICS.get() {
        m.batch_aborts.add(1, &[]);
    }
}

/// Record the latency one unit observed.
pub fn record_write_latency(latency_seconds: f64) {
    if let Some(m) = METRICS.get() {
        m.write_latency.record(latency_seconds, &[]);
    }
}
