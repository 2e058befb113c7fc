use crate::types::{Identity, Metric, TimePoint};
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PointStoreError {
    #[error("point store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("point store returned HTTP {0}")]
    Status(u16),
    #[error("failed to decode point store response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("point store did not acknowledge the write")]
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSeriesBody {
    #[serde(default)]
    pub points: Vec<TimePoint>,
}

/// The synced series of one identity as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteSeries {
    #[serde(default)]
    pub stake: RemoteSeriesBody,
    #[serde(default)]
    pub wd: RemoteSeriesBody,
    #[serde(default)]
    pub nw: RemoteSeriesBody,
}

impl RemoteSeries {
    /// Points for a synced metric; always empty for local-only metrics.
    pub fn points(&self, metric: Metric) -> &[TimePoint] {
        match metric {
            Metric::Stake => &self.stake.points,
            Metric::Withdrawal => &self.wd.points,
            Metric::NetWorth => &self.nw.points,
            Metric::Price => &[],
        }
    }

    pub fn points_mut(&mut self, metric: Metric) -> Option<&mut Vec<TimePoint>> {
        match metric {
            Metric::Stake => Some(&mut self.stake.points),
            Metric::Withdrawal => Some(&mut self.wd.points),
            Metric::NetWorth => Some(&mut self.nw.points),
            Metric::Price => None,
        }
    }

    pub fn total_points(&self) -> usize {
        self.stake.points.len() + self.wd.points.len() + self.nw.points.len()
    }
}

/// `GET /api/point` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PointResponse {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RemoteSeries>,
}

/// `POST /api/point` body: `{v, t, stake, wd, nw}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushBody {
    pub v: u32,
    pub t: i64,
    #[serde(flatten)]
    pub series: RemoteSeries,
}

/// `POST /api/point` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AckResponse {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Remote point store as seen by the sync engine.
pub trait PointStore: Send + Sync + 'static {
    /// `Ok(None)` when the store has nothing (or answers without `ok: true`).
    fn fetch(
        &self,
        identity: &Identity,
    ) -> impl Future<Output = Result<Option<RemoteSeries>, PointStoreError>> + Send;

    fn push(
        &self,
        identity: &Identity,
        body: &PushBody,
    ) -> impl Future<Output = Result<(), PointStoreError>> + Send;
}

/// HTTP client for the remote point-store endpoint.
///
/// No request timeout is set: a stalled call only delays the next scheduled attempt.
pub struct PointStoreClient {
    base_url: String,
    client: reqwest::Client,
}

impl PointStoreClient {
    pub fn new(base_url: &str) -> Result<Self, PointStoreError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn point_url(&self, identity: &Identity) -> String {
        format!(
            "{}/api/point?address={}",
            self.base_url,
            urlencoding::encode(identity.as_str())
        )
    }
}

impl PointStore for PointStoreClient {
    async fn fetch(&self, identity: &Identity) -> Result<Option<RemoteSeries>, PointStoreError> {
        let url = self.point_url(identity);
        debug!(url = %url, "fetching remote points");

        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PointStoreError::Status(status.as_u16()));
        }
        let body = resp.bytes().await?;
        let parsed: PointResponse = serde_json::from_slice(&body)?;
        if parsed.ok != Some(true) {
            return Ok(None);
        }
        Ok(parsed.data)
    }

    async fn push(&self, identity: &Identity, body: &PushBody) -> Result<(), PointStoreError> {
        let url = self.point_url(identity);
        debug!(url = %url, points = body.series.total_points(), "pushing points");

        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PointStoreError::Status(status.as_u16()));
        }
        let bytes = resp.bytes().await?;
        let ack: AckResponse = serde_json::from_slice(&bytes)?;
        if ack.ok == Some(true) {
            Ok(())
        } else {
            Err(PointStoreError::Rejected)
        }
    }
}
