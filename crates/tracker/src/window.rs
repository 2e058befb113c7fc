//! Display windows over a series. Everything here is pure: callers pass the
//! points and `now`, nothing is cached.

use chrono::{DateTime, Utc};
use common::types::TimePoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DAY_MS: i64 = 86_400_000;

/// Sliding window of the `live` timeframe.
pub const LIVE_WINDOW_MS: i64 = 120_000;

/// A timeframe is offered only once the oldest point is this old, relative to
/// the timeframe's duration.
pub const AVAILABILITY_RATIO: f64 = 0.8;

/// Absolute PnL below this is reported as flat.
pub const FLAT_EPSILON: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[default]
    #[serde(rename = "live")]
    Live,
    #[serde(rename = "1d")]
    Day,
    #[serde(rename = "1w")]
    Week,
    #[serde(rename = "1m")]
    Month,
    #[serde(rename = "1y")]
    Year,
    #[serde(rename = "all")]
    All,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::Live,
        Timeframe::Day,
        Timeframe::Week,
        Timeframe::Month,
        Timeframe::Year,
        Timeframe::All,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Day => "1d",
            Self::Week => "1w",
            Self::Month => "1m",
            Self::Year => "1y",
            Self::All => "all",
        }
    }

    /// Lookback in milliseconds; `None` for the full history.
    pub fn duration_ms(&self) -> Option<i64> {
        match self {
            Self::Live => Some(LIVE_WINDOW_MS),
            Self::Day => Some(DAY_MS),
            Self::Week => Some(7 * DAY_MS),
            Self::Month => Some(30 * DAY_MS),
            Self::Year => Some(365 * DAY_MS),
            Self::All => None,
        }
    }

    /// Earliest timestamp included at `now`.
    pub fn lower_bound(&self, now_ms: i64) -> i64 {
        self.duration_ms().map_or(0, |d| now_ms - d)
    }

    fn label_format(&self) -> &'static str {
        match self {
            Self::Live => "%H:%M:%S",
            Self::Day => "%H:%M",
            Self::Week => "%a %H:%M",
            Self::Month | Self::Year => "%b %d",
            Self::All => "%Y-%m-%d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("unknown timeframe: {s}"))
    }
}

/// Chart-ready slice of one series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesView {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
    pub times: Vec<i64>,
}

impl SeriesView {
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

fn window(points: &[TimePoint], timeframe: Timeframe, now_ms: i64) -> &[TimePoint] {
    let lower = timeframe.lower_bound(now_ms);
    let start = points.partition_point(|p| p.t < lower);
    &points[start..]
}

fn label(t: i64, timeframe: Timeframe) -> String {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.format(timeframe.label_format()).to_string())
        .unwrap_or_default()
}

/// Points of `points` (ascending by `t`) inside the timeframe ending at `now`.
pub fn select_view(points: &[TimePoint], timeframe: Timeframe, now_ms: i64) -> SeriesView {
    let selected = window(points, timeframe, now_ms);
    SeriesView {
        labels: selected.iter().map(|p| label(p.t, timeframe)).collect(),
        values: selected.iter().map(|p| p.v).collect(),
        times: selected.iter().map(|p| p.t).collect(),
    }
}

/// Whether `timeframe` may be selected for a series whose oldest point is `oldest`.
pub fn is_available(timeframe: Timeframe, oldest: Option<&TimePoint>, now_ms: i64) -> bool {
    match timeframe {
        Timeframe::Live | Timeframe::Day => true,
        Timeframe::All => oldest.is_some(),
        tf => match (oldest, tf.duration_ms()) {
            (Some(p), Some(d)) => (now_ms - p.t) as f64 > d as f64 * AVAILABILITY_RATIO,
            _ => false,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeframeAvailability {
    pub timeframe: Timeframe,
    pub enabled: bool,
}

pub fn availability(oldest: Option<&TimePoint>, now_ms: i64) -> Vec<TimeframeAvailability> {
    Timeframe::ALL
        .into_iter()
        .map(|timeframe| TimeframeAvailability {
            timeframe,
            enabled: is_available(timeframe, oldest, now_ms),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RangeStats {
    pub open: f64,
    pub low: f64,
    pub high: f64,
    pub last: f64,
}

pub fn range_stats(points: &[TimePoint], timeframe: Timeframe, now_ms: i64) -> Option<RangeStats> {
    let selected = window(points, timeframe, now_ms);
    let first = selected.first()?;
    let last = selected.last()?;
    let (low, high) = selected
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.v), hi.max(p.v))
        });
    Some(RangeStats {
        open: first.v,
        low,
        high,
        last: last.v,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Pnl {
    pub diff: f64,
    pub pct: f64,
    pub trend: Trend,
}

/// Change from the first to the last value of a view.
pub fn pnl(view: &SeriesView) -> Option<Pnl> {
    let first = *view.values.first()?;
    let last = *view.values.last()?;
    let diff = last - first;
    let pct = if first == 0.0 { 0.0 } else { diff / first * 100.0 };
    let trend = if diff.abs() <= FLAT_EPSILON {
        Trend::Flat
    } else if diff > 0.0 {
        Trend::Up
    } else {
        Trend::Down
    };
    Some(Pnl { diff, pct, trend })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn pts(ts: &[i64]) -> Vec<TimePoint> {
        ts.iter()
            .enumerate()
            .map(|(i, t)| TimePoint::new(*t, i as f64))
            .collect()
    }

    #[test]
    fn test_gating_ten_day_old_series() {
        let oldest = TimePoint::new(NOW - 10 * DAY_MS, 1.0);
        assert!(!is_available(Timeframe::Year, Some(&oldest), NOW));
        assert!(is_available(Timeframe::Week, Some(&oldest), NOW));
        assert!(!is_available(Timeframe::Month, Some(&oldest), NOW));
        assert!(is_available(Timeframe::Live, Some(&oldest), NOW));
        assert!(is_available(Timeframe::Day, None, NOW));
        assert!(is_available(Timeframe::All, Some(&oldest), NOW));
        assert!(!is_available(Timeframe::All, None, NOW));
    }

    #[test]
    fn test_gate_is_strictly_greater_than_ratio() {
        let week = 7 * DAY_MS;
        let at_gate = TimePoint::new(NOW - (week as f64 * 0.8) as i64, 1.0);
        assert!(!is_available(Timeframe::Week, Some(&at_gate), NOW));
        let past_gate = TimePoint::new(at_gate.t - 1, 1.0);
        assert!(is_available(Timeframe::Week, Some(&past_gate), NOW));
    }

    #[test]
    fn test_live_window_slides_without_new_data() {
        let points = pts(&[NOW - 130_000, NOW - 60_000, NOW - 1_000]);
        assert_eq!(select_view(&points, Timeframe::Live, NOW).times.len(), 2);
        // Same data, one minute later.
        let later = select_view(&points, Timeframe::Live, NOW + 61_000);
        assert_eq!(later.times, vec![NOW - 1_000]);
    }

    #[test]
    fn test_all_keeps_full_history() {
        let points = pts(&[1, NOW - 400 * DAY_MS, NOW]);
        let view = select_view(&points, Timeframe::All, NOW);
        assert_eq!(view.values, vec![0.0, 1.0, 2.0]);
        assert_eq!(view.labels[0], "1970-01-01");
        assert_eq!(select_view(&points, Timeframe::Year, NOW).times, vec![NOW]);
    }

    #[test]
    fn test_view_columns_align() {
        let points = pts(&[NOW - 3 * DAY_MS, NOW - DAY_MS / 2, NOW]);
        let view = select_view(&points, Timeframe::Week, NOW);
        assert_eq!(view.labels.len(), view.values.len());
        assert_eq!(view.times.len(), view.values.len());
        assert!(select_view(&[], Timeframe::Day, NOW).is_empty());
    }

    #[test]
    fn test_range_stats() {
        let points = vec![
            TimePoint::new(NOW - 5_000, 25.0),
            TimePoint::new(NOW - 4_000, 24.0),
            TimePoint::new(NOW - 3_000, 26.5),
            TimePoint::new(NOW - 2_000, 25.5),
        ];
        let stats = range_stats(&points, Timeframe::Live, NOW).unwrap();
        assert_eq!(
            stats,
            RangeStats {
                open: 25.0,
                low: 24.0,
                high: 26.5,
                last: 25.5
            }
        );
        assert!(range_stats(&points, Timeframe::Live, NOW + 1_000_000).is_none());
    }

    #[test]
    fn test_pnl_trend() {
        let up = SeriesView {
            values: vec![100.0, 110.0],
            ..Default::default()
        };
        let p = pnl(&up).unwrap();
        assert_eq!(p.trend, Trend::Up);
        assert!((p.pct - 10.0).abs() < 1e-9);

        let flat = SeriesView {
            values: vec![100.0, 100.00005],
            ..Default::default()
        };
        assert_eq!(pnl(&flat).unwrap().trend, Trend::Flat);

        let from_zero = SeriesView {
            values: vec![0.0, 5.0],
            ..Default::default()
        };
        assert_eq!(pnl(&from_zero).unwrap().pct, 0.0);
        assert!(pnl(&SeriesView::default()).is_none());
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("1w".parse::<Timeframe>().unwrap(), Timeframe::Week);
        assert!("2w".parse::<Timeframe>().is_err());
        assert_eq!(
            serde_json::from_str::<Timeframe>("\"all\"").unwrap(),
            Timeframe::All
        );
    }
}
