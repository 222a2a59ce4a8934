use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::analysis::classify_structure;
use crate::indicators::ema;
use crate::types::{CandleSeries, Regime};

/// Outcome of one regime evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeUpdate {
    pub previous: Regime,
    pub current: Regime,
    pub candidate: Regime,
    pub confirm_count: u32,
    /// True only when a transition was applied this evaluation.
    pub applied: bool,
}

/// Reference-asset regime with confirm-count and minimum-hold hysteresis.
/// The trading loop is the only writer.
pub struct RegimeEngine {
    confirm_count: u32,
    min_hold: Duration,
    check_interval: Duration,

    current: Regime,
    tracked_candidate: Option<Regime>,
    candidate_count: u32,
    last_transition: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
}

impl RegimeEngine {
    pub fn new(confirm_count: u32, min_hold_minutes: i64, check_minutes: i64) -> Self {
        Self {
            confirm_count: confirm_count.max(1),
            min_hold: Duration::minutes(min_hold_minutes),
            check_interval: Duration::minutes(check_minutes),
            current: Regime::Range,
            tracked_candidate: None,
            candidate_count: 0,
            last_transition: None,
            last_check: None,
        }
    }

    pub fn current(&self) -> Regime {
        self.current
    }

    /// Classifies the reference asset's last closed bar. `None` when the
    /// series is too short for the long EMA.
    pub fn detect(series: &CandleSeries) -> Option<Regime> {
        let closes = series.closes();
        let close = *closes.last()?;
        let ema50 = ema(&closes, 50)?;
        let ema200 = ema(&closes, 200)?;
        Some(classify_structure(close, ema50, ema200))
    }

    /// Evaluates against the reference series. Returns `None` when the
    /// check is throttled or the data is short; either way the current
    /// regime stands.
    pub fn update(
        &mut self,
        reference: Option<&CandleSeries>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Option<RegimeUpdate> {
        if !force {
            if let Some(last) = self.last_check {
                if now - last < self.check_interval {
                    return None;
                }
            }
        }

        let candidate = reference.and_then(Self::detect)?;
        self.last_check = Some(now);
        Some(self.apply_candidate(candidate, now))
    }

    /// Core hysteresis step, time injected for tests.
    pub fn apply_candidate(&mut self, candidate: Regime, now: DateTime<Utc>) -> RegimeUpdate {
        let previous = self.current;

        if candidate == self.current {
            // Re-confirmation of the standing regime clears any pending
            // candidate streak.
            self.tracked_candidate = None;
            self.candidate_count = 0;
            debug!("regime {} re-confirmed", self.current);
            return RegimeUpdate {
                previous,
                current: self.current,
                candidate,
                confirm_count: 0,
                applied: false,
            };
        }

        if self.tracked_candidate == Some(candidate) {
            self.candidate_count += 1;
        } else {
            self.tracked_candidate = Some(candidate);
            self.candidate_count = 1;
        }

        let hold_satisfied = match self.last_transition {
            Some(at) => now - at >= self.min_hold,
            None => true,
        };

        let applied = self.candidate_count >= self.confirm_count && hold_satisfied;
        if applied {
            info!(
                "regime transition {} -> {} after {} confirmations",
                previous, candidate, self.candidate_count
            );
            self.current = candidate;
            self.last_transition = Some(now);
            self.tracked_candidate = None;
            self.candidate_count = 0;
        }

        RegimeUpdate {
            previous,
            current: self.current,
            candidate,
            confirm_count: if applied { self.confirm_count } else { self.candidate_count },
            applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(minutes * 60, 0).unwrap()
    }

    #[test]
    fn intervening_candidate_resets_the_streak() {
        // Candidates BULL, BULL, RANGE, BULL, BULL with confirm=3: the
        // RANGE evaluation clears the streak, so no transition yet.
        let mut engine = RegimeEngine::new(3, 0, 20);
        let seq = [Regime::Bull, Regime::Bull, Regime::Range, Regime::Bull, Regime::Bull];
        for (i, c) in seq.iter().enumerate() {
            let update = engine.apply_candidate(*c, at(i as i64 * 20));
            assert!(!update.applied);
        }
        assert_eq!(engine.current(), Regime::Range);

        // A third consecutive BULL applies the transition exactly once.
        let update = engine.apply_candidate(Regime::Bull, at(100));
        assert!(update.applied);
        assert_eq!(update.previous, Regime::Range);
        assert_eq!(engine.current(), Regime::Bull);
    }

    #[test]
    fn min_hold_blocks_rapid_flip() {
        let mut engine = RegimeEngine::new(1, 60, 20);
        let update = engine.apply_candidate(Regime::Bull, at(0));
        assert!(update.applied);

        // Enough confirmations but inside the hold window
        let update = engine.apply_candidate(Regime::Bear, at(30));
        assert!(!update.applied);
        assert_eq!(engine.current(), Regime::Bull);

        let update = engine.apply_candidate(Regime::Bear, at(61));
        assert!(update.applied);
        assert_eq!(engine.current(), Regime::Bear);
    }

    #[test]
    fn first_transition_needs_no_hold() {
        let mut engine = RegimeEngine::new(2, 240, 20);
        engine.apply_candidate(Regime::Bull, at(0));
        let update = engine.apply_candidate(Regime::Bull, at(20));
        assert!(update.applied);
        assert_eq!(engine.current(), Regime::Bull);
    }

    #[test]
    fn update_is_throttled_between_checks() {
        let mut engine = RegimeEngine::new(1, 0, 20);
        let series = rising_series(260);
        assert!(engine.update(Some(&series), false, at(0)).is_some());
        assert!(engine.update(Some(&series), false, at(10)).is_none());
        assert!(engine.update(Some(&series), false, at(21)).is_some());
        // Forced checks bypass the throttle
        assert!(engine.update(Some(&series), true, at(22)).is_some());
    }

    #[test]
    fn short_reference_data_is_skipped() {
        let mut engine = RegimeEngine::new(1, 0, 20);
        let series = rising_series(30);
        assert!(engine.update(Some(&series), true, at(0)).is_none());
        assert!(engine.update(None, true, at(0)).is_none());
        assert_eq!(engine.current(), Regime::Range);
    }

    fn rising_series(n: usize) -> CandleSeries {
        use crate::types::Candle;
        use rust_decimal::Decimal;
        use rust_decimal_macros::dec;
        CandleSeries::new(
            (0..n as i64)
                .map(|i| {
                    let p = Decimal::from(100 + i);
                    Candle {
                        timestamp: DateTime::from_timestamp(i * 1200, 0).unwrap(),
                        open: p,
                        high: p + dec!(1),
                        low: p - dec!(1),
                        close: p,
                        volume: dec!(1),
                        quote_volume: p,
                    }
                })
                .collect(),
        )
    }
}
