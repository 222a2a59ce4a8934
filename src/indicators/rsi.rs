use rust_decimal::Decimal;

use super::Indicator;

/// RSI with Wilder smoothing after an initial simple average.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    avg_gain: Option<Decimal>,
    avg_loss: Option<Decimal>,
    prev_price: Option<Decimal>,
    gains: Vec<Decimal>,
    losses: Vec<Decimal>,
    value: Option<Decimal>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            avg_gain: None,
            avg_loss: None,
            prev_price: None,
            gains: Vec::with_capacity(period),
            losses: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        if let Some(prev) = self.prev_price {
            let change = price - prev;
            let gain = change.max(Decimal::ZERO);
            let loss = (-change).max(Decimal::ZERO);

            if self.gains.len() < self.period {
                self.gains.push(gain);
                self.losses.push(loss);
                if self.gains.len() == self.period {
                    let n = Decimal::from(self.period as u32);
                    self.avg_gain = Some(self.gains.iter().sum::<Decimal>() / n);
                    self.avg_loss = Some(self.losses.iter().sum::<Decimal>() / n);
                    self.value = self.compute();
                }
            } else if let (Some(ag), Some(al)) = (self.avg_gain, self.avg_loss) {
                let n = Decimal::from(self.period as u32);
                self.avg_gain = Some((ag * (n - Decimal::ONE) + gain) / n);
                self.avg_loss = Some((al * (n - Decimal::ONE) + loss) / n);
                self.value = self.compute();
            }
        }
        self.prev_price = Some(price);
        self.value
    }

    fn compute(&self) -> Option<Decimal> {
        match (self.avg_gain, self.avg_loss) {
            (Some(gain), Some(loss)) => {
                if loss.is_zero() {
                    Some(Decimal::ONE_HUNDRED)
                } else {
                    let rs = gain / loss;
                    Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
                }
            }
            _ => None,
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "RSI"
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.avg_gain = None;
        self.avg_loss = None;
        self.prev_price = None;
        self.gains.clear();
        self.losses.clear();
        self.value = None;
    }
}

/// Final RSI over a full series.
pub fn rsi(values: &[Decimal], period: usize) -> Option<Decimal> {
    let mut rsi = Rsi::new(period);
    let mut last = None;
    for v in values {
        last = rsi.update(*v);
    }
    last
}
