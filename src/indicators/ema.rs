use rust_decimal::Decimal;

use super::Indicator;

/// Exponential moving average seeded with an SMA over the first `period`
/// values.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: Decimal,
    value: Option<Decimal>,
    count: usize,
    sum: Decimal,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let multiplier = Decimal::TWO / Decimal::from(period as u32 + 1);
        Self {
            period,
            multiplier,
            value: None,
            count: 0,
            sum: Decimal::ZERO,
        }
    }

    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        self.count += 1;

        if self.count < self.period {
            self.sum += price;
            return None;
        }
        if self.count == self.period {
            self.sum += price;
            self.value = Some(self.sum / Decimal::from(self.period as u32));
            return self.value;
        }

        if let Some(prev) = self.value {
            self.value = Some((price - prev) * self.multiplier + prev);
        }
        self.value
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

impl Indicator for Ema {
    fn name(&self) -> &'static str {
        "EMA"
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.value = None;
        self.count = 0;
        self.sum = Decimal::ZERO;
    }
}

/// Final EMA over a full series; None when the series is shorter than the
/// period.
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    let mut ema = Ema::new(period);
    let mut last = None;
    for v in values {
        last = ema.update(*v);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn seeds_with_sma_then_smooths() {
        let mut e = Ema::new(3);
        assert_eq!(e.update(dec!(1)), None);
        assert_eq!(e.update(dec!(2)), None);
        assert_eq!(e.update(dec!(3)), Some(dec!(2)));
        // multiplier = 2/4 = 0.5; next = (4-2)*0.5 + 2 = 3
        assert_eq!(e.update(dec!(4)), Some(dec!(3)));
    }

    #[test]
    fn series_helper_matches_streaming() {
        let values = vec![dec!(1), dec!(2), dec!(3), dec!(4)];
        assert_eq!(ema(&values, 3), Some(dec!(3)));
        assert_eq!(ema(&values[..2], 3), None);
    }
}
