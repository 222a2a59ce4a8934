use rust_decimal::Decimal;

use super::Indicator;

/// ATR as the rolling mean of true range over the period.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<Decimal>,
    true_ranges: Vec<Decimal>,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            true_ranges: Vec::with_capacity(period + 1),
        }
    }

    pub fn update(&mut self, high: Decimal, low: Decimal, close: Decimal) -> Option<Decimal> {
        let hl = high - low;
        let tr = match self.prev_close {
            Some(pc) => hl.max((high - pc).abs()).max((low - pc).abs()),
            None => hl,
        };
        self.prev_close = Some(close);

        self.true_ranges.push(tr);
        if self.true_ranges.len() > self.period {
            self.true_ranges.remove(0);
        }
        self.value()
    }

    pub fn value(&self) -> Option<Decimal> {
        if self.true_ranges.len() < self.period {
            return None;
        }
        let sum: Decimal = self.true_ranges.iter().sum();
        Some(sum / Decimal::from(self.period as u32))
    }

    /// True range of the most recent update.
    pub fn last_true_range(&self) -> Option<Decimal> {
        self.true_ranges.last().copied()
    }
}

impl Indicator for Atr {
    fn name(&self) -> &'static str {
        "ATR"
    }

    fn is_ready(&self) -> bool {
        self.true_ranges.len() >= self.period
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.true_ranges.clear();
    }
}
