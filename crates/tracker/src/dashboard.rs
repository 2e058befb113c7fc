//! Read-only snapshot published to the rendering side after every change.

use common::format::fmt_inj;
use common::series::SeriesSet;
use common::types::{ClassifiedEvent, Identity, Metric, SyncMeta, TimePoint};
use serde::Serialize;

use crate::sync::SyncStatus;
use crate::window::{self, Pnl, RangeStats, SeriesView, Timeframe, TimeframeAvailability};

/// Everything the rendering side needs, derived fresh on each publish.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Dashboard {
    pub identity: Option<Identity>,
    pub timeframe: Timeframe,
    pub online: bool,
    pub status: SyncStatus,
    pub sync: SyncMeta,
    pub stake: SeriesView,
    /// Most recent staked amount, e.g. `6.250000 INJ`, regardless of timeframe.
    pub stake_label: Option<String>,
    pub withdrawals: SeriesView,
    pub net_worth: SeriesView,
    pub price: SeriesView,
    pub availability: Vec<TimeframeAvailability>,
    pub price_range: Option<RangeStats>,
    pub pnl: Option<Pnl>,
    pub events: Vec<ClassifiedEvent>,
    pub updated_at: i64,
}

/// Oldest point across every series of the set.
pub fn oldest_point(series: &SeriesSet) -> Option<TimePoint> {
    series
        .iter()
        .filter_map(|s| s.oldest())
        .min_by_key(|p| p.t)
        .copied()
}

/// Per-identity inputs to a dashboard snapshot.
pub struct DashboardSource<'a> {
    pub identity: &'a Identity,
    pub series: &'a SeriesSet,
    pub status: SyncStatus,
    pub events: &'a [ClassifiedEvent],
}

impl Dashboard {
    pub fn build(
        source: Option<DashboardSource<'_>>,
        timeframe: Timeframe,
        online: bool,
        sync: SyncMeta,
        now_ms: i64,
    ) -> Self {
        let Some(source) = source else {
            return Self {
                timeframe,
                online,
                status: if online {
                    SyncStatus::Idle
                } else {
                    SyncStatus::Offline
                },
                sync,
                availability: window::availability(None, now_ms),
                updated_at: now_ms,
                ..Self::default()
            };
        };

        let view = |m: Metric| window::select_view(source.series.get(m).points(), timeframe, now_ms);
        let net_worth = view(Metric::NetWorth);
        let oldest = oldest_point(source.series);
        Self {
            identity: Some(source.identity.clone()),
            timeframe,
            online,
            status: source.status,
            sync,
            stake: view(Metric::Stake),
            stake_label: source
                .series
                .get(Metric::Stake)
                .latest()
                .map(|p| format!("{} INJ", fmt_inj(p.v, 6))),
            withdrawals: view(Metric::Withdrawal),
            pnl: window::pnl(&net_worth),
            net_worth,
            price: view(Metric::Price),
            availability: window::availability(oldest.as_ref(), now_ms),
            price_range: window::range_stats(
                source.series.get(Metric::Price).points(),
                timeframe,
                now_ms,
            ),
            events: source.events.to_vec(),
            updated_at: now_ms,
        }
    }

    pub fn is_available(&self, timeframe: Timeframe) -> bool {
        self.availability
            .iter()
            .any(|a| a.timeframe == timeframe && a.enabled)
    }
}
