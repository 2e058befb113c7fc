//! Turns raw polled balances into discrete series points and journal events.
//!
//! Detectors are pure state machines: they never touch the store or the
//! network. The caller appends the returned points to its series and pushes
//! the returned events to the journal.

use common::config::DetectorConfig;
use common::format::{fmt_pct, fmt_signed_inj, fmt_usd};
use common::series::SeriesSet;
use common::types::{AccountSnapshot, ClassifiedEvent, Direction, EventKind, Metric, TimePoint};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

/// A recorded point plus the event it produced, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub point: TimePoint,
    pub direction: Direction,
    pub event: Option<ClassifiedEvent>,
}

/// Stake-delta detector: records a point only when the rounded stake changes.
#[derive(Debug, Clone)]
pub struct StakeTracker {
    decimals: u32,
    last_recorded: Option<Decimal>,
}

impl StakeTracker {
    pub fn new(decimals: u32) -> Self {
        Self {
            decimals,
            last_recorded: None,
        }
    }

    /// Continue from a previously recorded stake value; the next poll is
    /// compared against it instead of becoming a new baseline.
    pub fn resume(decimals: u32, last_recorded: Option<f64>) -> Self {
        let mut tracker = Self::new(decimals);
        tracker.last_recorded = last_recorded.and_then(|v| round_dp(v, decimals));
        tracker
    }

    pub fn has_baseline(&self) -> bool {
        self.last_recorded.is_some()
    }

    /// Adopt `value` as the baseline unless one exists already.
    pub fn seed(&mut self, value: f64) {
        if self.last_recorded.is_none() && value.is_finite() {
            self.last_recorded = round_dp(value, self.decimals);
        }
    }

    pub fn observe(&mut self, staked: f64, now_ms: i64) -> Option<Detection> {
        if !staked.is_finite() || staked < 0.0 {
            return None;
        }
        let rounded = round_dp(staked, self.decimals)?;
        let value = rounded.to_f64()?;

        let Some(last) = self.last_recorded else {
            self.last_recorded = Some(rounded);
            return Some(Detection {
                point: TimePoint::new(now_ms, value),
                direction: Direction::None,
                event: None,
            });
        };
        if rounded == last {
            return None;
        }

        let delta = (rounded - last).to_f64()?;
        self.last_recorded = Some(rounded);
        let (direction, title) = if delta > 0.0 {
            (Direction::Up, "Stake increased")
        } else {
            (Direction::Down, "Stake decreased")
        };
        let detail = fmt_signed_inj(delta, self.decimals as usize);
        Some(Detection {
            point: TimePoint::new(now_ms, value),
            direction,
            event: Some(ClassifiedEvent::new(
                EventKind::Tx,
                title,
                detail,
                direction,
                now_ms,
            )),
        })
    }
}

fn round_dp(v: f64, decimals: u32) -> Option<Decimal> {
    Decimal::from_f64(v)
        .map(|d| d.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero))
}

/// Reward-withdrawal detector. Rewards only grow between withdrawals, so a
/// drop larger than `epsilon` is read as a withdrawal of that size.
#[derive(Debug, Clone)]
pub struct RewardTracker {
    epsilon: f64,
    last_seen: Option<f64>,
}

impl RewardTracker {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            last_seen: None,
        }
    }

    pub fn observe(&mut self, rewards: f64, now_ms: i64) -> Option<Detection> {
        if !rewards.is_finite() || rewards < 0.0 {
            return None;
        }
        let last = self.last_seen.replace(rewards)?;
        let diff = last - rewards;
        if diff < self.epsilon || diff <= 0.0 {
            return None;
        }
        Some(Detection {
            point: TimePoint::new(now_ms, diff),
            direction: Direction::Down,
            event: Some(ClassifiedEvent::new(
                EventKind::Tx,
                "Rewards withdrawn",
                fmt_signed_inj(diff, 6),
                Direction::Down,
                now_ms,
            )),
        })
    }
}

/// Net-worth density control: a new sample is skipped only when the last one
/// is both recent and close in value.
#[derive(Debug, Clone, Copy)]
pub struct NetWorthSampler {
    min_interval_ms: i64,
    min_usd_delta: f64,
}

impl NetWorthSampler {
    pub fn new(min_interval_ms: i64, min_usd_delta: f64) -> Self {
        Self {
            min_interval_ms,
            min_usd_delta,
        }
    }

    pub fn sample(
        &self,
        snapshot: &AccountSnapshot,
        price: f64,
        last: Option<&TimePoint>,
        now_ms: i64,
    ) -> Option<TimePoint> {
        if !snapshot.is_well_formed() || !price.is_finite() || price < 0.0 {
            return None;
        }
        let usd = snapshot.total_inj() * price;
        if !usd.is_finite() {
            return None;
        }
        if let Some(last) = last {
            let young = now_ms - last.t < self.min_interval_ms;
            let small = (usd - last.v).abs() < self.min_usd_delta;
            if young && small {
                return None;
            }
        }
        Some(TimePoint::new(now_ms, usd))
    }
}

/// Emits a `price` event whenever the price moves `threshold_pct` away from
/// the last anchor, then re-anchors.
#[derive(Debug, Clone)]
pub struct PriceWatch {
    threshold_pct: f64,
    anchor: Option<f64>,
}

impl PriceWatch {
    pub fn new(threshold_pct: f64) -> Self {
        Self {
            threshold_pct,
            anchor: None,
        }
    }

    pub fn observe(&mut self, price: f64, now_ms: i64) -> Option<ClassifiedEvent> {
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let Some(anchor) = self.anchor else {
            self.anchor = Some(price);
            return None;
        };
        let pct = (price - anchor) / anchor * 100.0;
        if pct.abs() < self.threshold_pct {
            return None;
        }
        self.anchor = Some(price);
        let (direction, title) = if pct > 0.0 {
            (Direction::Up, "Price up")
        } else {
            (Direction::Down, "Price down")
        };
        Some(ClassifiedEvent::new(
            EventKind::Price,
            title,
            format!("{} ({})", fmt_pct(pct), fmt_usd(price)),
            direction,
            now_ms,
        ))
    }
}

/// Everything one account poll produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub stake: Option<Detection>,
    pub withdrawal: Option<Detection>,
    pub net_worth: Option<TimePoint>,
}

impl Observation {
    pub fn events(&self) -> impl Iterator<Item = &ClassifiedEvent> {
        self.stake
            .iter()
            .chain(self.withdrawal.iter())
            .filter_map(|d| d.event.as_ref())
    }
}

/// Per-identity bundle of detectors.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    stake: StakeTracker,
    rewards: RewardTracker,
    net_worth: NetWorthSampler,
    price: PriceWatch,
}

impl ChangeDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self::resume(config, None)
    }

    pub fn resume(config: &DetectorConfig, last_stake: Option<f64>) -> Self {
        Self {
            stake: StakeTracker::resume(config.stake_decimals, last_stake),
            rewards: RewardTracker::new(config.withdrawal_epsilon),
            net_worth: NetWorthSampler::new(
                config.networth_min_interval_ms,
                config.networth_min_usd_delta,
            ),
            price: PriceWatch::new(config.price_move_pct),
        }
    }

    /// Run one account poll through every detector. A detector only runs
    /// when its series would accept a point at `now_ms`, so a rejected
    /// timestamp leaves its state untouched. A malformed snapshot changes
    /// nothing and yields an empty observation. Net worth is sampled only
    /// once a price is known.
    pub fn observe_account(
        &mut self,
        snapshot: &AccountSnapshot,
        price: Option<f64>,
        series: &SeriesSet,
        now_ms: i64,
    ) -> Observation {
        if !snapshot.is_well_formed() || now_ms <= 0 {
            return Observation::default();
        }
        let admits = |metric: Metric| series.get(metric).admits(now_ms);

        let stake = if admits(Metric::Stake) {
            self.stake.observe(snapshot.staked, now_ms)
        } else {
            None
        };
        let withdrawal = if admits(Metric::Withdrawal) {
            self.rewards.observe(snapshot.rewards, now_ms)
        } else {
            None
        };
        let net_worth = if admits(Metric::NetWorth) {
            let last = series.get(Metric::NetWorth).latest();
            price.and_then(|p| self.net_worth.sample(snapshot, p, last, now_ms))
        } else {
            None
        };
        Observation {
            stake,
            withdrawal,
            net_worth,
        }
    }

    pub fn observe_price(&mut self, price: f64, now_ms: i64) -> Option<ClassifiedEvent> {
        self.price.observe(price, now_ms)
    }

    /// Points merged from elsewhere can supply the stake baseline.
    pub fn seed_stake(&mut self, latest: Option<f64>) {
        if let Some(v) = latest {
            self.stake.seed(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{EventStatus, Identity};

    fn empty_set() -> SeriesSet {
        SeriesSet::empty(&Identity::parse("inj1abc").unwrap(), 100)
    }

    fn snapshot(available: f64, staked: f64, rewards: f64) -> AccountSnapshot {
        AccountSnapshot {
            available,
            staked,
            rewards,
            apr: 0.0,
            at: None,
        }
    }

    #[test]
    fn test_stake_baseline_then_suppression_then_increase() {
        let mut t = StakeTracker::new(6);

        let first = t.observe(5.000000, 1_000).unwrap();
        assert_eq!(first.point, TimePoint::new(1_000, 5.0));
        assert!(first.event.is_none());

        assert!(t.observe(5.000000, 2_000).is_none());

        let third = t.observe(6.250000, 3_000).unwrap();
        assert_eq!(third.point, TimePoint::new(3_000, 6.25));
        assert_eq!(third.direction, Direction::Up);
        let ev = third.event.unwrap();
        assert_eq!(ev.kind, EventKind::Tx);
        assert_eq!(ev.title, "Stake increased");
        assert_eq!(ev.detail, "+1.250000 INJ");
        assert_eq!(ev.status, EventStatus::Pending);
    }

    #[test]
    fn test_stake_noise_below_rounding_is_suppressed() {
        let mut t = StakeTracker::new(6);
        t.observe(5.0000001, 1).unwrap();
        assert!(t.observe(5.0000004, 2).is_none());
    }

    #[test]
    fn test_stake_decrease() {
        let mut t = StakeTracker::resume(6, Some(6.25));
        assert!(t.has_baseline());
        let d = t.observe(5.75, 10).unwrap();
        assert_eq!(d.direction, Direction::Down);
        let ev = d.event.unwrap();
        assert_eq!(ev.title, "Stake decreased");
        assert_eq!(ev.detail, "-0.500000 INJ");
    }

    #[test]
    fn test_seed_only_fills_missing_baseline() {
        let mut t = StakeTracker::new(6);
        t.seed(6.0);
        assert!(t.observe(6.0, 1).is_none());
        t.seed(9.0);
        let d = t.observe(7.0, 2).unwrap();
        assert_eq!(d.event.unwrap().detail, "+1.000000 INJ");
    }

    #[test]
    fn test_stake_rejects_non_finite_without_mutation() {
        let mut t = StakeTracker::new(6);
        assert!(t.observe(f64::NAN, 1).is_none());
        assert!(!t.has_baseline());
    }

    #[test]
    fn test_withdrawal_below_threshold_is_ignored() {
        let mut r = RewardTracker::new(0.0002);
        assert!(r.observe(0.0100, 1).is_none());
        assert!(r.observe(0.0099, 2).is_none());
    }

    #[test]
    fn test_withdrawal_above_threshold_emits_once() {
        let mut r = RewardTracker::new(0.0002);
        assert!(r.observe(0.0100, 1).is_none());
        let d = r.observe(0.0090, 2).unwrap();
        assert!((d.point.v - 0.0010).abs() < 1e-12);
        let ev = d.event.unwrap();
        assert_eq!(ev.title, "Rewards withdrawn");
        assert!(ev.detail.starts_with("+0.0010"), "{}", ev.detail);
        assert!(ev.detail.ends_with(" INJ"));

        // Baseline moved to 0.0090; accrual afterwards emits nothing.
        assert!(r.observe(0.0095, 3).is_none());
        assert!(r.observe(0.0120, 4).is_none());
    }

    #[test]
    fn test_reward_accrual_updates_baseline() {
        let mut r = RewardTracker::new(0.0002);
        r.observe(0.010, 1);
        r.observe(0.020, 2);
        // A drop relative to the raised baseline is a withdrawal of 0.011.
        let d = r.observe(0.009, 3).unwrap();
        assert!((d.point.v - 0.011).abs() < 1e-12);
    }

    #[test]
    fn test_net_worth_density_control() {
        let s = NetWorthSampler::new(5_000, 0.25);
        let snap = snapshot(1.0, 5.0, 0.0);
        let first = s.sample(&snap, 25.0, None, 10_000).unwrap();
        assert!((first.v - 150.0).abs() < 1e-9);

        // Young and small: skipped.
        assert!(s.sample(&snap, 25.01, Some(&first), 12_000).is_none());
        // Young but large move: kept.
        assert!(s.sample(&snap, 26.0, Some(&first), 12_000).is_some());
        // Small but old enough: kept.
        assert!(s.sample(&snap, 25.01, Some(&first), 15_000).is_some());
    }

    #[test]
    fn test_net_worth_rejects_bad_price() {
        let s = NetWorthSampler::new(5_000, 0.25);
        let snap = snapshot(1.0, 5.0, 0.0);
        assert!(s.sample(&snap, f64::NAN, None, 1).is_none());
        assert!(s.sample(&snap, -1.0, None, 1).is_none());
    }

    #[test]
    fn test_malformed_snapshot_leaves_detectors_untouched() {
        let mut d = ChangeDetector::new(&DetectorConfig::default());
        let set = empty_set();
        let bad = snapshot(1.0, f64::NAN, 0.01);
        assert_eq!(d.observe_account(&bad, Some(25.0), &set, 1), Observation::default());
        let good = snapshot(1.0, 5.0, 0.01);
        assert_eq!(d.observe_account(&good, Some(25.0), &set, 0), Observation::default());

        // Next good poll still becomes the stake baseline.
        let obs = d.observe_account(&good, Some(25.0), &set, 2);
        assert_eq!(obs.stake.unwrap().point, TimePoint::new(2, 5.0));
        assert!(obs.withdrawal.is_none());
        assert!(obs.net_worth.is_some());
    }

    #[test]
    fn test_no_net_worth_without_price() {
        let mut d = ChangeDetector::new(&DetectorConfig::default());
        let obs = d.observe_account(&snapshot(1.0, 5.0, 0.01), None, &empty_set(), 2);
        assert!(obs.net_worth.is_none());
        assert!(obs.stake.is_some());
    }

    #[test]
    fn test_taken_timestamp_leaves_trackers_untouched() {
        let mut d = ChangeDetector::new(&DetectorConfig::default());
        let mut set = empty_set();
        let first = d.observe_account(&snapshot(1.0, 5.0, 0.0100), None, &set, 1_000);
        set.get_mut(Metric::Stake).append(first.stake.unwrap().point);

        // Same timestamp again: the stake series already holds t=1000.
        let dup = d.observe_account(&snapshot(1.0, 6.25, 0.0100), None, &set, 1_000);
        assert!(dup.stake.is_none());
        assert_eq!(dup.events().count(), 0);

        let next = d.observe_account(&snapshot(1.0, 6.25, 0.0100), None, &set, 2_000);
        let stake = next.stake.unwrap();
        assert_eq!(stake.point, TimePoint::new(2_000, 6.25));
        assert_eq!(stake.event.unwrap().detail, "+1.250000 INJ");
        assert!(next.withdrawal.is_none());
    }

    #[test]
    fn test_reward_baseline_holds_when_withdrawal_slot_is_taken() {
        let mut d = ChangeDetector::new(&DetectorConfig::default());
        let mut set = empty_set();
        set.get_mut(Metric::Withdrawal).append(TimePoint::new(3_000, 0.002));
        d.observe_account(&snapshot(1.0, 5.0, 0.0100), None, &set, 1_000);

        let taken = d.observe_account(&snapshot(1.0, 5.0, 0.0050), None, &set, 3_000);
        assert!(taken.withdrawal.is_none());

        // Still measured against 0.0100.
        let later = d.observe_account(&snapshot(1.0, 5.0, 0.0050), None, &set, 4_000);
        assert!((later.withdrawal.unwrap().point.v - 0.0050).abs() < 1e-12);
    }

    #[test]
    fn test_price_watch_threshold() {
        let mut p = PriceWatch::new(2.0);
        assert!(p.observe(25.0, 1).is_none());
        assert!(p.observe(25.4, 2).is_none());
        let ev = p.observe(25.6, 3).unwrap();
        assert_eq!(ev.kind, EventKind::Price);
        assert_eq!(ev.status, EventStatus::Ok);
        assert_eq!(ev.title, "Price up");
        assert_eq!(ev.detail, "+2.40% ($25.60)");
        // Re-anchored at 25.6.
        assert!(p.observe(25.2, 4).is_none());
        assert_eq!(p.observe(25.0, 5).unwrap().direction, Direction::Down);
    }
}
