#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar. `timestamp` is the bar's open time (UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

impl Candle {
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// True range against the previous close.
    pub fn true_range(&self, prev_close: Option<Decimal>) -> Decimal {
        let hl = self.high - self.low;
        match prev_close {
            Some(pc) => hl.max((self.high - pc).abs()).max((self.low - pc).abs()),
            None => hl,
        }
    }
}

/// An ordered run of candles, oldest first. The last element is the most
/// recently closed bar; in-progress bars are dropped before construction.
#[derive(Debug, Clone, Default)]
pub struct CandleSeries {
    pub candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn prev(&self) -> Option<&Candle> {
        let len = self.candles.len();
        if len >= 2 {
            self.candles.get(len - 2)
        } else {
            None
        }
    }

    pub fn last_n(&self, n: usize) -> &[Candle] {
        let len = self.candles.len();
        if n >= len {
            &self.candles
        } else {
            &self.candles[len - n..]
        }
    }

    pub fn closes(&self) -> Vec<Decimal> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn highs(&self) -> Vec<Decimal> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<Decimal> {
        self.candles.iter().map(|c| c.low).collect()
    }

    pub fn volumes(&self) -> Vec<Decimal> {
        self.candles.iter().map(|c| c.volume).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(ts: i64, o: Decimal, h: Decimal, l: Decimal, c: Decimal) -> Candle {
        Candle {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: dec!(1),
            quote_volume: dec!(1),
        }
    }

    #[test]
    fn true_range_uses_previous_close_gap() {
        let c = candle(0, dec!(100), dec!(105), dec!(99), dec!(104));
        assert_eq!(c.true_range(None), dec!(6));
        // Gap down: previous close above today's high widens the range
        assert_eq!(c.true_range(Some(dec!(110))), dec!(11));
        // Gap up: previous close below today's low
        assert_eq!(c.true_range(Some(dec!(95))), dec!(10));
    }

    #[test]
    fn series_last_and_prev() {
        let s = CandleSeries::new(vec![
            candle(0, dec!(1), dec!(2), dec!(1), dec!(2)),
            candle(60, dec!(2), dec!(3), dec!(2), dec!(3)),
            candle(120, dec!(3), dec!(4), dec!(3), dec!(4)),
        ]);
        assert_eq!(s.last().unwrap().close, dec!(4));
        assert_eq!(s.prev().unwrap().close, dec!(3));
        assert_eq!(s.last_n(2).len(), 2);
        assert_eq!(s.last_n(10).len(), 3);
    }
}
