use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::metrics::{Metrics, ServiceStats};
use crate::models::OpenAiModelsResponse;
use crate::upstream::UpstreamClient;

/// Process-scoped services, created once at startup and injected everywhere;
/// nothing here is looked up through globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: UpstreamClient,
    pub inflight: Arc<Semaphore>,
    pub inflight_count: Arc<AtomicU64>,
    pub metrics: Metrics,
    pub stats: Arc<ServiceStats>,
    pub models_cache: Arc<TtlCache<OpenAiModelsResponse>>,
    pub token_cache: Arc<TtlCache<String>>,
    pub content_cache: Arc<TtlCache<String>>,
    pub _tracer_provider: opentelemetry_sdk::trace::SdkTracerProvider,
}

pub struct InflightGuard {
    _permit: OwnedSemaphorePermit,
    counter: Arc<AtomicU64>,
}

impl InflightGuard {
    pub fn new(permit: OwnedSemaphorePermit, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self {
            _permit: permit,
            counter,
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
