use anyhow::{Context, Result};
use common::config::Config;
use common::store::KvStore;
use pointstore::api;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(Config::default_config_path);
    let config = Config::load(&config_path)?;

    let otlp_endpoint = config.otlp_endpoint();
    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "pointstore",
        &config.general.log_level,
        config.general.log_format,
        otlp_endpoint.as_deref(),
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;
    info!(path = %config_path, "pointstore starting");

    let store = KvStore::open(&config.server.path, config.series.schema_version)
        .await
        .with_context(|| format!("failed to open store at {}", config.server.path))?;
    let state = Arc::new(api::AppState::new(store, config.series.capacity));

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!(addr = %bind_addr, "starting pointstore HTTP server");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
