use crate::series::{Series, SeriesRecord};
use crate::types::{ClassifiedEvent, Identity, Metric, SyncMeta};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    schema_version INTEGER NOT NULL,
    metric         TEXT    NOT NULL,
    identity       TEXT    NOT NULL,
    saved_at       INTEGER NOT NULL,
    payload        TEXT    NOT NULL,
    PRIMARY KEY (schema_version, metric, identity)
);
";

/// Slot names that are not series metrics.
const EVENTS_SLOT: &str = "events";
const SYNC_META_SLOT: &str = "sync_meta";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("failed to create store directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store connection: {0}")]
    Connection(String),
}

/// One record write inside a snapshot transaction.
struct PendingWrite {
    slot: String,
    identity: String,
    payload: String,
}

/// Local key-value persistence keyed by `(schema_version, slot, identity)`.
///
/// All SQLite work runs on the `tokio_rusqlite` background thread. Clone is
/// cheap (shared sender to that thread).
#[derive(Clone)]
pub struct KvStore {
    conn: tokio_rusqlite::Connection,
    schema_version: u32,
}

impl KvStore {
    pub async fn open(path: &str, schema_version: u32) -> Result<Self, StoreError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| StoreError::Connection(format!("failed to open {path}: {e}")))?;
        let store = Self {
            conn,
            schema_version,
        };
        store
            .call_named("store.init", |conn| {
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        info!(path, schema_version, "local store ready");
        Ok(store)
    }

    /// In-memory store (tests and throwaway sessions).
    pub async fn open_memory(schema_version: u32) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open(":memory:")
            .await
            .map_err(|e| StoreError::Connection(format!("failed to open in-memory store: {e}")))?;
        let store = Self {
            conn,
            schema_version,
        };
        store
            .call_named("store.init", |conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Run `function` on the SQLite thread, recording latency and errors.
    async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self
            .conn
            .call(move |conn| function(conn))
            .await
            .map_err(|e: tokio_rusqlite::Error<StoreError>| match e {
                tokio_rusqlite::Error::Error(err) => err,
                tokio_rusqlite::Error::ConnectionClosed => {
                    StoreError::Connection("connection closed".to_string())
                }
                other => StoreError::Connection(other.to_string()),
            });
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("tracker_store_latency_ms", "op" => op, "status" => status).record(ms);
        res
    }

    /// Write every record in one transaction: either all land or none do.
    async fn write_all(&self, op: &'static str, writes: Vec<PendingWrite>, saved_at: i64) -> Result<(), StoreError> {
        let version = self.schema_version;
        self.call_named(op, move |conn| {
            let tx = conn.transaction()?;
            for w in &writes {
                tx.execute(
                    "INSERT INTO records (schema_version, metric, identity, saved_at, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(schema_version, metric, identity)
                     DO UPDATE SET saved_at = excluded.saved_at, payload = excluded.payload",
                    params![version, w.slot, w.identity, saved_at, w.payload],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn read(&self, slot: String, identity: String) -> Result<Option<String>, StoreError> {
        let version = self.schema_version;
        self.call_named("store.read", move |conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM records
                     WHERE schema_version = ?1 AND metric = ?2 AND identity = ?3",
                    params![version, slot, identity],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(payload)
        })
        .await
    }

    /// Store any serializable value under `(slot, identity)`.
    pub async fn put_json<T: Serialize>(
        &self,
        slot: &str,
        identity: &str,
        value: &T,
        saved_at: i64,
    ) -> Result<(), StoreError> {
        let write = PendingWrite {
            slot: slot.to_string(),
            identity: identity.to_string(),
            payload: serde_json::to_string(value)?,
        };
        self.write_all("store.put", vec![write], saved_at).await
    }

    /// Read a value stored with [`Self::put_json`]. Undecodable payloads read as absent.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        slot: &str,
        identity: &str,
    ) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.read(slot.to_string(), identity.to_string()).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                debug!(slot, error = %e, "discarding undecodable record");
                Ok(None)
            }
        }
    }

    fn series_write(&self, series: &Series, now_ms: i64) -> Result<PendingWrite, StoreError> {
        Ok(PendingWrite {
            slot: series.metric().as_str().to_string(),
            identity: series.identity().as_str().to_string(),
            payload: serde_json::to_string(&series.to_record(self.schema_version, now_ms))?,
        })
    }

    pub async fn persist_series(&self, series: &Series, now_ms: i64) -> Result<(), StoreError> {
        let write = self.series_write(series, now_ms)?;
        self.write_all("store.persist_series", vec![write], now_ms).await
    }

    /// Load one series. Missing or stale-version records yield an empty series.
    pub async fn load_series(
        &self,
        identity: &Identity,
        metric: Metric,
        capacity: usize,
    ) -> Result<Series, StoreError> {
        let record: Option<SeriesRecord> = self.get_json(metric.as_str(), identity.as_str()).await?;
        let loaded = record.and_then(|r| {
            let version = r.version;
            let series =
                Series::from_record(identity.clone(), metric, capacity, r, self.schema_version);
            if series.is_none() {
                debug!(
                    identity = %identity.short(),
                    %metric,
                    stored = version,
                    current = self.schema_version,
                    "discarding stale-version series record"
                );
            }
            series
        });
        Ok(loaded.unwrap_or_else(|| Series::new(identity.clone(), metric, capacity)))
    }

    pub async fn persist_events(
        &self,
        identity: &Identity,
        events: &[ClassifiedEvent],
        now_ms: i64,
    ) -> Result<(), StoreError> {
        self.put_json(EVENTS_SLOT, identity.as_str(), &events, now_ms)
            .await
    }

    /// Journal events, most recent first.
    pub async fn load_events(&self, identity: &Identity) -> Result<Vec<ClassifiedEvent>, StoreError> {
        Ok(self
            .get_json(EVENTS_SLOT, identity.as_str())
            .await?
            .unwrap_or_default())
    }

    /// Persist a whole identity (every series plus the journal) atomically.
    pub async fn persist_snapshot<'a>(
        &self,
        identity: &Identity,
        series: impl IntoIterator<Item = &'a Series>,
        events: &[ClassifiedEvent],
        now_ms: i64,
    ) -> Result<(), StoreError> {
        let mut writes = series
            .into_iter()
            .map(|s| self.series_write(s, now_ms))
            .collect::<Result<Vec<_>, _>>()?;
        writes.push(PendingWrite {
            slot: EVENTS_SLOT.to_string(),
            identity: identity.as_str().to_string(),
            payload: serde_json::to_string(events)?,
        });
        self.write_all("store.persist_snapshot", writes, now_ms).await
    }

    pub async fn persist_sync_meta(&self, meta: &SyncMeta, now_ms: i64) -> Result<(), StoreError> {
        self.put_json(SYNC_META_SLOT, "", meta, now_ms).await
    }

    pub async fn load_sync_meta(&self) -> Result<SyncMeta, StoreError> {
        Ok(self.get_json(SYNC_META_SLOT, "").await?.unwrap_or_default())
    }
}
