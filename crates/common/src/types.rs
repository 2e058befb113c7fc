use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

/// Schema tag written into every persisted series record and every push body.
pub const SCHEMA_VERSION: u32 = 1;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One sample of a series: integer-ms timestamp and value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimePoint {
    pub t: i64,
    pub v: f64,
}

impl TimePoint {
    pub fn new(t: i64, v: f64) -> Self {
        Self { t, v }
    }

    /// A point is storable only with a positive timestamp and a finite value.
    pub fn is_valid(&self) -> bool {
        self.t > 0 && self.v.is_finite()
    }
}

/// The tracked metrics. `Price` is local-only; the other three travel to the point store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "stake")]
    Stake,
    #[serde(rename = "wd")]
    Withdrawal,
    #[serde(rename = "nw")]
    NetWorth,
    #[serde(rename = "px")]
    Price,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::Stake,
        Metric::Withdrawal,
        Metric::NetWorth,
        Metric::Price,
    ];

    /// Metrics carried by the remote point-store payload.
    pub const SYNCED: [Metric; 3] = [Metric::Stake, Metric::Withdrawal, Metric::NetWorth];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stake => "stake",
            Self::Withdrawal => "wd",
            Self::NetWorth => "nw",
            Self::Price => "px",
        }
    }

    pub fn is_synced(&self) -> bool {
        !matches!(self, Self::Price)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("identity must be a non-empty string")]
    Empty,
}

/// Opaque account key (wallet address) namespacing every series and the journal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short display form for logs, e.g. `inj1qyz…x7k9p0`.
    pub fn short(&self) -> String {
        crate::format::short_identity(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Tx,
    Price,
    Info,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tx => "tx",
            Self::Price => "price",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Ok,
    Err,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ok => write!(f, "ok"),
            Self::Err => write!(f, "err"),
        }
    }
}

/// Event id sequence. Each run counts up from its start time in microseconds,
/// past every id a previous run could have written to the journal.
static EVENT_SEQ_BASE: OnceLock<u64> = OnceLock::new();
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_event_seq() -> u64 {
    let base = *EVENT_SEQ_BASE.get_or_init(|| {
        u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or_default()
    });
    base.wrapping_add(EVENT_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// A domain event shown in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedEvent {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub kind: EventKind,
    pub title: String,
    pub detail: String,
    pub direction: Direction,
    pub status: EventStatus,
}

impl ClassifiedEvent {
    /// Transactional events start `pending`; everything else is final on creation.
    pub fn new(
        kind: EventKind,
        title: impl Into<String>,
        detail: impl Into<String>,
        direction: Direction,
        timestamp: i64,
    ) -> Self {
        let seq = next_event_seq();
        let status = match kind {
            EventKind::Tx => EventStatus::Pending,
            EventKind::Price | EventKind::Info => EventStatus::Ok,
        };
        Self {
            id: format!("{timestamp}_{seq:x}"),
            timestamp,
            kind,
            title: title.into(),
            detail: detail.into(),
            direction,
            status,
        }
    }

    pub fn info(title: impl Into<String>, detail: impl Into<String>, timestamp: i64) -> Self {
        Self::new(EventKind::Info, title, detail, Direction::None, timestamp)
    }

    pub fn is_pending(&self) -> bool {
        self.status == EventStatus::Pending
    }
}

/// Process-wide sync counters. Display only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub points_synced: u64,
    pub last_sync_ms: Option<i64>,
}

/// Price feed tick. `at` overrides the observation time when the feed supplies one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
}

/// Account balance snapshot, all balances in INJ.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub available: f64,
    pub staked: f64,
    pub rewards: f64,
    #[serde(default)]
    pub apr: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
}

impl AccountSnapshot {
    /// All balances finite and non-negative.
    pub fn is_well_formed(&self) -> bool {
        [self.available, self.staked, self.rewards]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }

    pub fn total_inj(&self) -> f64 {
        self.available + self.staked + self.rewards
    }
}
