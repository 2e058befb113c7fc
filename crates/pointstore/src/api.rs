use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use common::pointstore::{AckResponse, PointResponse, PushBody, RemoteSeries};
use common::series::Series;
use common::store::{KvStore, StoreError};
use common::types::{now_ms, Identity, Metric};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Slot holding the merged payload of one identity.
const REMOTE_SLOT: &str = "remote";

/// Shared application state available to all handlers.
pub struct AppState {
    pub store: KvStore,
    /// Per-metric point cap applied after every merge.
    pub capacity: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Serializes read-merge-write cycles.
    pub write_lock: Mutex<()>,
}

impl AppState {
    pub fn new(store: KvStore, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            started_at: chrono::Utc::now(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self, identity: &Identity) -> Result<Option<RemoteSeries>, StoreError> {
        self.store.get_json(REMOTE_SLOT, identity.as_str()).await
    }

    /// Union `incoming` into the stored payload. Returns how many points were new.
    pub async fn merge(
        &self,
        identity: &Identity,
        incoming: &RemoteSeries,
    ) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load(identity).await?.unwrap_or_default();
        let mut added = 0;
        for metric in Metric::SYNCED {
            let Some(points) = stored.points_mut(metric) else {
                continue;
            };
            let mut series = Series::with_points(
                identity.clone(),
                metric,
                self.capacity,
                std::mem::take(points),
            );
            added += series.merge(incoming.points(metric).iter().copied());
            *points = series.points().to_vec();
        }
        self.store
            .put_json(REMOTE_SLOT, identity.as_str(), &stored, now_ms())
            .await?;
        Ok(added)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/point", get(get_point).post(post_point))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct PointQuery {
    pub address: Option<String>,
}

fn parse_address(query: &PointQuery) -> Option<Identity> {
    query
        .address
        .as_deref()
        .and_then(|raw| Identity::parse(raw).ok())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
    })
}

fn error_ack(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<AckResponse>) {
    (
        status,
        Json(AckResponse {
            ok: Some(false),
            error: Some(message.into()),
        }),
    )
}

async fn get_point(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PointQuery>,
) -> Result<Json<PointResponse>, (StatusCode, Json<AckResponse>)> {
    let Some(identity) = parse_address(&query) else {
        return Err(error_ack(StatusCode::BAD_REQUEST, "missing address"));
    };
    metrics::counter!("pointstore_requests_total", "route" => "get_point").increment(1);

    let data = state.load(&identity).await.map_err(|e| {
        warn!(identity = %identity.short(), error = %e, "failed to load payload");
        error_ack(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
    })?;
    Ok(Json(PointResponse {
        ok: Some(true),
        data,
    }))
}

async fn post_point(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PointQuery>,
    Json(body): Json<PushBody>,
) -> Result<Json<AckResponse>, (StatusCode, Json<AckResponse>)> {
    let Some(identity) = parse_address(&query) else {
        return Err(error_ack(StatusCode::BAD_REQUEST, "missing address"));
    };
    metrics::counter!("pointstore_requests_total", "route" => "post_point").increment(1);

    let expected = state.store.schema_version();
    if body.v != expected {
        return Err(error_ack(
            StatusCode::CONFLICT,
            format!("schema version {} does not match {expected}", body.v),
        ));
    }

    let added = state.merge(&identity, &body.series).await.map_err(|e| {
        warn!(identity = %identity.short(), error = %e, "failed to merge payload");
        error_ack(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
    })?;
    metrics::counter!("pointstore_points_merged_total").increment(added as u64);
    info!(
        identity = %identity.short(),
        received = body.series.total_points(),
        added,
        "payload merged"
    );

    Ok(Json(AckResponse {
        ok: Some(true),
        error: None,
    }))
}
