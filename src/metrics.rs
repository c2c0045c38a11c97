use opentelemetry::metrics::MeterProvider;
use opentelemetry::metrics::{Counter, Histogram, ObservableGauge};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::metrics::periodic_reader_with_async_runtime::PeriodicReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::Resource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Metrics {
    pub requests: Counter<u64>,
    pub errors: Counter<u64>,
    pub latency_ms: Histogram<f64>,
    _inflight: ObservableGauge<i64>,
}

pub fn init_metrics(
    service_name: String,
    endpoint: String,
    timeout_ms: u64,
    inflight_count: Arc<AtomicU64>,
) -> Result<Metrics, String> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| format!("metrics exporter init error: {}", e))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();

    let meter = provider.meter("glm-proxy");
    opentelemetry::global::set_meter_provider(provider);

    Ok(build_instruments(meter, inflight_count))
}

pub fn init_metrics_noop(inflight_count: Arc<AtomicU64>) -> Metrics {
    let meter = opentelemetry::global::meter("glm-proxy");
    build_instruments(meter, inflight_count)
}

fn build_instruments(meter: opentelemetry::metrics::Meter, inflight_count: Arc<AtomicU64>) -> Metrics {
    let requests = meter
        .u64_counter("proxy.requests")
        .with_description("Total requests")
        .build();
    let errors = meter
        .u64_counter("proxy.errors")
        .with_description("Total errors")
        .build();
    let latency_ms = meter
        .f64_histogram("proxy.latency_ms")
        .with_unit("ms")
        .with_description("Request latency in ms")
        .build();
    let inflight = meter
        .i64_observable_gauge("proxy.inflight")
        .with_description("In-flight requests")
        .with_callback(move |observer| {
            let value = inflight_count.load(Ordering::Relaxed) as i64;
            observer.observe(value, &[]);
        })
        .build();

    Metrics {
        requests,
        errors,
        latency_ms,
        _inflight: inflight,
    }
}

/// In-process totals behind `GET /metrics`; the OTLP export above runs
/// alongside and does not feed this.
pub struct ServiceStats {
    started_at: Instant,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn errors_total(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }
}
