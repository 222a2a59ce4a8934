use rust_decimal::Decimal;

use super::{sma, Indicator};

/// Current volume relative to its rolling mean.
#[derive(Debug, Clone)]
pub struct RelativeVolume {
    period: usize,
    volumes: Vec<Decimal>,
}

impl RelativeVolume {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            volumes: Vec::with_capacity(period + 1),
        }
    }

    pub fn update(&mut self, volume: Decimal) -> Option<Decimal> {
        self.volumes.push(volume);
        if self.volumes.len() > self.period + 1 {
            self.volumes.remove(0);
        }
        self.ratio()
    }

    /// Last volume over the mean of the `period` volumes preceding it.
    pub fn ratio(&self) -> Option<Decimal> {
        if self.volumes.len() < self.period + 1 {
            return None;
        }
        let last = *self.volumes.last()?;
        let baseline = sma(&self.volumes[..self.volumes.len() - 1], self.period)?;
        if baseline.is_zero() {
            return Some(Decimal::ONE);
        }
        Some(last / baseline)
    }
}

impl Indicator for RelativeVolume {
    fn name(&self) -> &'static str {
        "RelativeVolume"
    }

    fn is_ready(&self) -> bool {
        self.volumes.len() >= self.period + 1
    }

    fn reset(&mut self) {
        self.volumes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ratio_compares_last_against_preceding_mean() {
        let mut rv = RelativeVolume::new(3);
        assert_eq!(rv.update(dec!(10)), None);
        rv.update(dec!(10));
        rv.update(dec!(10));
        // Spike: 30 vs mean(10,10,10)
        assert_eq!(rv.update(dec!(30)), Some(dec!(3)));
    }

    #[test]
    fn zero_baseline_reports_neutral() {
        let mut rv = RelativeVolume::new(2);
        rv.update(dec!(0));
        rv.update(dec!(0));
        assert_eq!(rv.update(dec!(5)), Some(dec!(1)));
    }
}
