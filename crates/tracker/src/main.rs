use anyhow::{Context, Result};
use common::config::Config;
use common::pointstore::PointStoreClient;
use common::store::KvStore;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracker::session::{Input, Session};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(Config::default_config_path);
    let config = Config::load(&config_path)?;

    let otlp_endpoint = config.otlp_endpoint();
    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "tracker",
        &config.general.log_level,
        config.general.log_format,
        otlp_endpoint.as_deref(),
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;
    tracing::info!(path = %config_path, "tracker starting");

    if let Some(port) = config.observability.prometheus_port {
        tracker::metrics::install_prometheus(port)?;
        tracing::info!(port, "prometheus exporter listening");
    }
    tracker::metrics::describe();

    let store = KvStore::open(&config.storage.path, config.series.schema_version)
        .await
        .with_context(|| format!("failed to open store at {}", config.storage.path))?;

    let remote = if config.remote.enabled {
        Some(PointStoreClient::new(&config.remote.base_url)?)
    } else {
        tracing::info!("remote sync disabled");
        None
    };

    let session = Session::new(config, store, remote);
    let mut dashboard = session.dashboard();

    let (input_tx, input_rx) = mpsc::channel::<Input>(256);

    let feed_tx = input_tx.clone();
    let feed = tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = tracker::feed::pump(stdin, feed_tx).await {
            tracing::error!(error = %e, "feed reader failed");
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = input_tx.send(Input::Shutdown).await;
        }
    });

    // Dashboard snapshots go to stdout, one JSON object per line.
    let render = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while dashboard.changed().await.is_ok() {
            let line = match serde_json::to_string(&*dashboard.borrow_and_update()) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode dashboard");
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Connectivity is assumed until the feed says otherwise.
    session.run(input_rx, true).await;

    feed.abort();
    render.abort();
    tracing::info!("tracker stopped");
    Ok(())
}
