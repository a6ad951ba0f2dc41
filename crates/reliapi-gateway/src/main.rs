use metrics_exporter_prometheus::PrometheusBuilder;
use reliapi_gateway::config::load_config;
use reliapi_gateway::routes::build_router;
use reliapi_gateway::state::AppState;
use reliapi_store::{KvStore, MemoryStore, RedisStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELIAPI_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(config = %config_path, error = %err, "configuration invalid");
            std::process::exit(1);
        }
    };
    tracing::info!(
        config = %config_path,
        targets = config.targets.len(),
        tenants = config.tenants.len(),
        "configuration loaded"
    );

    let (store, store_degraded): (Arc<dyn KvStore>, bool) = match std::env::var("REDIS_URL") {
        Ok(url) => match RedisStore::connect(&url).await {
            Ok(store) => (Arc::new(store), false),
            Err(err) => {
                tracing::warn!(error = %err, "redis unreachable, falling back to in-memory store");
                (Arc::new(MemoryStore::new()), true)
            }
        },
        Err(_) => {
            tracing::info!("REDIS_URL not set, using in-memory store");
            (Arc::new(MemoryStore::new()), false)
        }
    };

    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "failed to install metrics recorder");
            None
        }
    };

    let state = match AppState::new(config, store, store_degraded, metrics_handle) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            tracing::error!(error = %err, "failed to build application state");
            std::process::exit(1);
        }
    };
    state.start_background();

    let listen = std::env::var("RELIAPI_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = match listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(listen = %listen, error = %err, "invalid listen address");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "reliapi listening");

    let router = build_router(Arc::clone(&state));
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });

    if let Err(err) = serve.await {
        tracing::error!(error = %err, "server error");
    }
    state.shutdown().await;
    tracing::info!("shutdown complete");
}
