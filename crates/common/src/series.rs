//! Bounded, timestamp-ordered series and the union merge used for sync.
//!
//! A [`Series`] never holds two points with the same `t` and never grows past
//! its capacity; the oldest points are dropped first. [`Series::merge`] is a
//! union keyed by timestamp where the local value wins on collision, so
//! applying the same remote payload any number of times converges.

use crate::pointstore::{RemoteSeries, RemoteSeriesBody};
use crate::types::{Identity, Metric, TimePoint};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CAPACITY: usize = 20_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    identity: Identity,
    metric: Metric,
    capacity: usize,
    points: Vec<TimePoint>,
}

/// Persisted form of a series: `{version, timestamp, points}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub version: u32,
    pub timestamp: i64,
    pub points: Vec<TimePoint>,
}

impl Series {
    pub fn new(identity: Identity, metric: Metric, capacity: usize) -> Self {
        Self {
            identity,
            metric,
            capacity: capacity.max(1),
            points: Vec::new(),
        }
    }

    pub fn with_points(
        identity: Identity,
        metric: Metric,
        capacity: usize,
        points: impl IntoIterator<Item = TimePoint>,
    ) -> Self {
        let mut series = Self::new(identity, metric, capacity);
        series.merge(points);
        series
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn points(&self) -> &[TimePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn oldest(&self) -> Option<&TimePoint> {
        self.points.first()
    }

    pub fn latest(&self) -> Option<&TimePoint> {
        self.points.last()
    }

    pub fn contains(&self, t: i64) -> bool {
        self.points.binary_search_by_key(&t, |p| p.t).is_ok()
    }

    /// Whether `append` would keep a valid point stamped `t`.
    pub fn admits(&self, t: i64) -> bool {
        if t <= 0 || self.contains(t) {
            return false;
        }
        self.points.len() < self.capacity || self.oldest().is_some_and(|o| t > o.t)
    }

    /// Insert `point` in timestamp order.
    ///
    /// Returns `false` (no mutation) for invalid points and for timestamps already
    /// present. Also returns `false` when the point was older than everything in
    /// a full series and was evicted straight away.
    pub fn append(&mut self, point: TimePoint) -> bool {
        if !point.is_valid() {
            return false;
        }
        match self.points.binary_search_by_key(&point.t, |p| p.t) {
            Ok(_) => false,
            Err(idx) => {
                self.points.insert(idx, point);
                let evicted = self.enforce_capacity();
                idx >= evicted
            }
        }
    }

    /// Union `other` into this series by timestamp; the existing value wins on
    /// collision. Returns how many timestamps were new to this series (before
    /// capacity eviction).
    pub fn merge(&mut self, other: impl IntoIterator<Item = TimePoint>) -> usize {
        let mut incoming: Vec<TimePoint> = other.into_iter().filter(TimePoint::is_valid).collect();
        if incoming.is_empty() {
            return 0;
        }
        incoming.sort_by_key(|p| p.t);
        incoming.dedup_by_key(|p| p.t);

        let local = std::mem::take(&mut self.points);
        let mut merged = Vec::with_capacity(local.len() + incoming.len());
        let mut added = 0;
        let (mut i, mut j) = (0, 0);
        while i < local.len() && j < incoming.len() {
            let (a, b) = (local[i], incoming[j]);
            if a.t < b.t {
                merged.push(a);
                i += 1;
            } else if b.t < a.t {
                merged.push(b);
                added += 1;
                j += 1;
            } else {
                merged.push(a);
                i += 1;
                j += 1;
            }
        }
        merged.extend_from_slice(&local[i..]);
        added += incoming.len() - j;
        merged.extend_from_slice(&incoming[j..]);

        self.points = merged;
        self.enforce_capacity();
        added
    }

    /// Drop from the front until `len <= capacity`. Returns the number dropped.
    fn enforce_capacity(&mut self) -> usize {
        let overflow = self.points.len().saturating_sub(self.capacity);
        if overflow > 0 {
            self.points.drain(..overflow);
        }
        overflow
    }

    pub fn to_record(&self, version: u32, now_ms: i64) -> SeriesRecord {
        SeriesRecord {
            version,
            timestamp: now_ms,
            points: self.points.clone(),
        }
    }

    /// Rebuild from a stored record. `None` when the record's version is not `version`.
    pub fn from_record(
        identity: Identity,
        metric: Metric,
        capacity: usize,
        record: SeriesRecord,
        version: u32,
    ) -> Option<Self> {
        if record.version != version {
            return None;
        }
        Some(Self::with_points(identity, metric, capacity, record.points))
    }
}

/// The per-identity set of series, one slot per [`Metric`].
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSet {
    stake: Series,
    withdrawal: Series,
    net_worth: Series,
    price: Series,
}

impl SeriesSet {
    pub fn empty(identity: &Identity, capacity: usize) -> Self {
        Self {
            stake: Series::new(identity.clone(), Metric::Stake, capacity),
            withdrawal: Series::new(identity.clone(), Metric::Withdrawal, capacity),
            net_worth: Series::new(identity.clone(), Metric::NetWorth, capacity),
            price: Series::new(identity.clone(), Metric::Price, capacity),
        }
    }

    /// Build from already-loaded series; each lands in the slot of its metric.
    pub fn from_series(identity: &Identity, capacity: usize, series: Vec<Series>) -> Self {
        let mut set = Self::empty(identity, capacity);
        for s in series {
            let metric = s.metric();
            *set.get_mut(metric) = s;
        }
        set
    }

    pub fn get(&self, metric: Metric) -> &Series {
        match metric {
            Metric::Stake => &self.stake,
            Metric::Withdrawal => &self.withdrawal,
            Metric::NetWorth => &self.net_worth,
            Metric::Price => &self.price,
        }
    }

    pub fn get_mut(&mut self, metric: Metric) -> &mut Series {
        match metric {
            Metric::Stake => &mut self.stake,
            Metric::Withdrawal => &mut self.withdrawal,
            Metric::NetWorth => &mut self.net_worth,
            Metric::Price => &mut self.price,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Series> {
        Metric::ALL.into_iter().map(|m| self.get(m))
    }

    /// The synced series in wire form.
    pub fn to_remote(&self) -> RemoteSeries {
        let body = |m: Metric| RemoteSeriesBody {
            points: self.get(m).points().to_vec(),
        };
        RemoteSeries {
            stake: body(Metric::Stake),
            wd: body(Metric::Withdrawal),
            nw: body(Metric::NetWorth),
        }
    }

    /// Merge every remote series into its local slot. Returns the metrics that
    /// gained points and how many.
    pub fn merge_remote(&mut self, remote: &RemoteSeries) -> Vec<(Metric, usize)> {
        Metric::SYNCED
            .into_iter()
            .filter_map(|m| {
                let added = self.get_mut(m).merge(remote.points(m).iter().copied());
                (added > 0).then_some((m, added))
            })
            .collect()
    }

    pub fn synced_point_count(&self) -> usize {
        Metric::SYNCED.iter().map(|m| self.get(*m).len()).sum()
    }
}
