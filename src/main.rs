mod anthropic;
mod auth;
mod cache;
mod config;
mod engine;
mod error;
mod finalize;
mod handlers;
mod metrics;
mod models;
mod openai;
mod reasoning;
mod sse;
mod state;
mod streaming;
mod toolcall;
mod tracing_otlp;
mod transform;
mod upstream;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::metrics::{init_metrics, init_metrics_noop, ServiceStats};
use crate::state::AppState;
use crate::tracing_otlp::{init_tracer_grpc, init_tracer_noop, spawn_tracer_watchdog};
use crate::upstream::UpstreamClient;

fn parse_level(level: &str) -> LevelFilter {
    match level {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("config error: {}", err);
            std::process::exit(1);
        }
    };
    let config = Arc::new(config);

    let inflight_count = Arc::new(AtomicU64::new(0));
    let metrics = if config.observability.perf_monitoring_enabled {
        match init_metrics(
            config.observability.service_name.clone(),
            config.observability.otlp_endpoint.clone(),
            config.observability.otlp_timeout_ms,
            inflight_count.clone(),
        ) {
            Ok(m) => m,
            Err(err) => {
                eprintln!("metrics init error (fallback to noop): {}", err);
                init_metrics_noop(inflight_count.clone())
            }
        }
    } else {
        init_metrics_noop(inflight_count.clone())
    };

    let tracer_provider = match init_tracer_grpc(
        config.observability.otlp_endpoint.clone(),
        config.observability.service_name.clone(),
        config.observability.otlp_timeout_ms,
    ) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("tracing init error (fallback to noop): {}", err);
            init_tracer_noop(config.observability.service_name.clone())
        }
    };

    let log_level = if config.observability.debug {
        LevelFilter::DEBUG
    } else {
        parse_level(config.observability.log_level.as_str())
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(log_level);
    let telemetry = tracing_opentelemetry::layer();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(telemetry)
        .init();

    let _tracer_watchdog = spawn_tracer_watchdog(tracer_provider.clone());

    let token_cache = Arc::new(TtlCache::new(
        Duration::from_secs(config.cache.token_ttl_secs),
        config.cache.max_size,
    ));
    let upstream = match UpstreamClient::new(config.clone(), token_cache.clone()) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("upstream client error: {}", err);
            std::process::exit(1);
        }
    };

    let state = AppState {
        config: config.clone(),
        upstream,
        inflight: Arc::new(tokio::sync::Semaphore::new(
            config.limits.max_concurrent_requests,
        )),
        inflight_count,
        metrics,
        stats: Arc::new(ServiceStats::new()),
        models_cache: Arc::new(TtlCache::new(
            Duration::from_secs(config.cache.models_ttl_secs),
            config.cache.max_size,
        )),
        token_cache,
        content_cache: Arc::new(TtlCache::new(
            Duration::from_secs(config.cache.content_ttl_secs),
            config.cache.max_size,
        )),
        _tracer_provider: tracer_provider,
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::get_models))
        .route("/v1/chat/completions", post(handlers::post_chat_completions))
        .route("/v1/messages", post(handlers::post_messages))
        .route("/metrics", get(handlers::get_metrics))
        .with_state(state);

    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("bind error: {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!(
        port = config.server.port,
        default_model = %config.upstream.default_model,
        reasoning_mode = %config.reasoning_mode,
        cors_origins = %config.observability.cors_origins,
        "proxy listening"
    );
    if let Err(err) = axum::serve(listener, app).await {
        eprintln!("server error: {}", err);
        std::process::exit(1);
    }
}
