//! Push/pull bookkeeping for one identity.
//!
//! The engine decides when a push or pull is due and what to do with its
//! result; the session performs the calls. Every call gets a number, and a
//! completion is applied only while its number is still the one in flight:
//! a newer pull, or a push issued after the previous one stalled, replaces
//! the older call, whose late answer is then ignored.

use common::pointstore::{PointStoreError, PushBody, RemoteSeries};
use common::series::SeriesSet;
use common::types::{Identity, Metric, SyncMeta};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Saving,
    Synced,
    Error,
    Offline,
}

/// A push ready to be sent. `revision` ties the completion back to the local
/// state it was built from.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub call: u64,
    pub body: PushBody,
    pub revision: u64,
    pub points: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullOutcome {
    /// Metrics that gained points, and how many.
    pub merged: Vec<(Metric, usize)>,
    /// The caller should arm the push debounce.
    pub schedule_push: bool,
}

/// Per-identity push/pull state machine. It never performs I/O: the session
/// sends the requests it builds and feeds the results back.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    identity: Identity,
    schema_version: u32,
    dirty: bool,
    push_scheduled: bool,
    push_in_flight: Option<InFlight>,
    pull_in_flight: Option<InFlight>,
    next_call: u64,
    /// A push unanswered for this long no longer blocks the next one.
    push_stall_ms: i64,
    /// Bumped on every local mutation; a push only clears `dirty` if nothing
    /// changed while it was in flight.
    revision: u64,
    status: SyncStatus,
}

impl SyncEngine {
    pub fn new(identity: Identity, schema_version: u32, push_stall_ms: i64) -> Self {
        Self {
            identity,
            schema_version,
            dirty: false,
            push_scheduled: false,
            push_in_flight: None,
            pull_in_flight: None,
            next_call: 0,
            push_stall_ms,
            revision: 0,
            status: SyncStatus::Idle,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn push_scheduled(&self) -> bool {
        self.push_scheduled
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Whether a completion of `call` should still be applied.
    pub fn owns_pull(&self, call: u64) -> bool {
        self.pull_in_flight.is_some_and(|f| f.call == call)
    }

    pub fn owns_push(&self, call: u64) -> bool {
        self.push_in_flight.is_some_and(|f| f.call == call)
    }

    pub fn pull_call(&self) -> Option<u64> {
        self.pull_in_flight.map(|f| f.call)
    }

    fn issue(&mut self, now_ms: i64) -> InFlight {
        self.next_call += 1;
        InFlight {
            call: self.next_call,
            started_ms: now_ms,
        }
    }

    /// Record a local mutation. Returns `true` when the caller should (re)arm
    /// the push debounce.
    pub fn mark_dirty(&mut self, online: bool) -> bool {
        self.dirty = true;
        self.revision += 1;
        if online {
            self.push_scheduled = true;
        } else {
            self.status = SyncStatus::Offline;
        }
        online
    }

    pub fn set_online(&mut self, online: bool) {
        if online {
            if self.status == SyncStatus::Offline {
                self.status = SyncStatus::Idle;
            }
        } else {
            self.push_scheduled = false;
            self.abandon_in_flight();
            self.status = SyncStatus::Offline;
        }
    }

    /// Debounce elapsed: build the payload if a push is warranted.
    pub fn begin_push(
        &mut self,
        series: &SeriesSet,
        online: bool,
        now_ms: i64,
    ) -> Option<PushRequest> {
        self.push_scheduled = false;
        if !self.dirty || !online {
            return None;
        }
        if let Some(previous) = self.push_in_flight {
            if now_ms - previous.started_ms < self.push_stall_ms {
                // Picked up again when the in-flight push completes.
                return None;
            }
            warn!(
                identity = %self.identity.short(),
                call = previous.call,
                "push unanswered, sending a fresh one"
            );
        }
        let remote = series.to_remote();
        let points = remote.total_points();
        let flight = self.issue(now_ms);
        self.push_in_flight = Some(flight);
        self.status = SyncStatus::Saving;
        Some(PushRequest {
            call: flight.call,
            body: PushBody {
                v: self.schema_version,
                t: now_ms,
                series: remote,
            },
            revision: self.revision,
            points,
        })
    }

    /// Apply a push completion. Returns `true` when local state changed while
    /// the push was in flight and another push should be armed.
    pub fn finish_push(
        &mut self,
        revision: u64,
        points: usize,
        result: Result<(), PointStoreError>,
        meta: &mut SyncMeta,
        now_ms: i64,
    ) -> bool {
        self.push_in_flight = None;
        match result {
            Ok(()) => {
                meta.points_synced += points as u64;
                meta.last_sync_ms = Some(now_ms);
                if self.revision == revision {
                    self.dirty = false;
                }
                self.status = SyncStatus::Synced;
                debug!(
                    identity = %self.identity.short(),
                    points,
                    still_dirty = self.dirty,
                    "push acknowledged"
                );
                if self.dirty {
                    self.push_scheduled = true;
                }
                self.dirty
            }
            Err(e) => {
                // Stays dirty; retried on the next mutation or pull.
                self.status = SyncStatus::Error;
                warn!(identity = %self.identity.short(), error = %e, "push failed");
                false
            }
        }
    }

    /// Start a pull. An unanswered earlier pull is replaced: pulls are only
    /// triggered by the interval or by a reconnect, both of which mean the
    /// previous one is overdue.
    pub fn begin_pull(&mut self, online: bool, now_ms: i64) -> Option<u64> {
        if !online {
            return None;
        }
        if let Some(previous) = self.pull_in_flight {
            debug!(
                identity = %self.identity.short(),
                call = previous.call,
                "replacing unanswered pull"
            );
        }
        let flight = self.issue(now_ms);
        self.pull_in_flight = Some(flight);
        Some(flight.call)
    }

    /// Merge a pull result into `series`. Local points are never removed.
    pub fn finish_pull(
        &mut self,
        series: &mut SeriesSet,
        result: Result<Option<RemoteSeries>, PointStoreError>,
        online: bool,
    ) -> PullOutcome {
        self.pull_in_flight = None;
        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                self.status = SyncStatus::Error;
                warn!(identity = %self.identity.short(), error = %e, "pull failed");
                return PullOutcome::default();
            }
        };

        let remote_points = remote.as_ref().map_or(0, RemoteSeries::total_points);
        let merged = remote
            .as_ref()
            .map(|r| series.merge_remote(r))
            .unwrap_or_default();
        if !merged.is_empty() {
            self.revision += 1;
        }
        // The remote is missing some of our points: send them.
        if series.synced_point_count() > remote_points {
            self.dirty = true;
        }
        if self.status == SyncStatus::Error || self.status == SyncStatus::Idle {
            self.status = if self.dirty {
                SyncStatus::Idle
            } else {
                SyncStatus::Synced
            };
        }

        let schedule_push = self.dirty && online;
        if schedule_push {
            self.push_scheduled = true;
        }
        debug!(
            identity = %self.identity.short(),
            remote_points,
            merged = merged.len(),
            schedule_push,
            "pull applied"
        );
        PullOutcome {
            merged,
            schedule_push,
        }
    }

    /// Connectivity lost: nothing on the wire will be applied any more.
    /// `dirty` is kept, so the data goes out again after reconnecting.
    pub fn abandon_in_flight(&mut self) {
        self.pull_in_flight = None;
        self.push_in_flight = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    call: u64,
    started_ms: i64,
}
