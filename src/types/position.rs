use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Symbol;

/// Strategy context captured at entry; drives the exit rules for the life
/// of the position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyMeta {
    pub strategy: String,
    pub stop_price: Decimal,
    #[serde(default)]
    pub take_profit_price: Option<Decimal>,
    #[serde(default)]
    pub target_r: Option<Decimal>,
    #[serde(default)]
    pub time_stop_candles: Option<u32>,
    #[serde(default)]
    pub trailing_activated: bool,
    #[serde(default)]
    pub trailing_stop_price: Option<Decimal>,
    #[serde(default)]
    pub tp1_done: bool,
    /// Entry minus initial stop; the denominator of realized R.
    pub risk_unit: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// VWAP of fills; amended by reconciliation when the exchange's
    /// average differs.
    pub buy_price: Decimal,
    /// Remaining amount, net of partial sells and reconcile adoptions.
    pub amount: Decimal,
    pub original_amount: Decimal,
    pub timestamp: DateTime<Utc>,
    highest_price_seen: Decimal,
    #[serde(default)]
    pub order_uuid: Option<String>,
    pub buy_meta: BuyMeta,
}

impl Position {
    pub fn open(
        symbol: Symbol,
        buy_price: Decimal,
        amount: Decimal,
        order_uuid: Option<String>,
        buy_meta: BuyMeta,
    ) -> Self {
        Self {
            symbol,
            buy_price,
            amount,
            original_amount: amount,
            timestamp: Utc::now(),
            highest_price_seen: buy_price,
            order_uuid,
            buy_meta,
        }
    }

    pub fn highest_price_seen(&self) -> Decimal {
        self.highest_price_seen
    }

    /// Ratchets only upward.
    pub fn observe_price(&mut self, price: Decimal) -> bool {
        if price > self.highest_price_seen {
            self.highest_price_seen = price;
            true
        } else {
            false
        }
    }

    pub fn invested_krw(&self) -> Decimal {
        self.buy_price * self.amount
    }

    pub fn value_at(&self, price: Decimal) -> Decimal {
        price * self.amount
    }

    pub fn profit_rate(&self, price: Decimal) -> Decimal {
        if self.buy_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.buy_price) / self.buy_price
    }

    /// Fraction of the original amount already sold off.
    pub fn sold_ratio(&self) -> Decimal {
        if self.original_amount.is_zero() {
            return Decimal::ZERO;
        }
        Decimal::ONE - self.amount / self.original_amount
    }

    pub fn hold_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_minutes()
    }

    /// Price move expressed in multiples of the initial risk unit.
    pub fn r_multiple(&self, price: Decimal) -> Option<Decimal> {
        if self.buy_meta.risk_unit > Decimal::ZERO {
            Some((price - self.buy_price) / self.buy_meta.risk_unit)
        } else {
            None
        }
    }

    /// The stop currently in force: the trailing stop once activated,
    /// otherwise the structural stop from entry.
    pub fn effective_stop(&self) -> Decimal {
        match self.buy_meta.trailing_stop_price {
            Some(trail) if self.buy_meta.trailing_activated => {
                trail.max(self.buy_meta.stop_price)
            }
            _ => self.buy_meta.stop_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn meta(stop: Decimal) -> BuyMeta {
        BuyMeta {
            strategy: "trend_breakout".into(),
            stop_price: stop,
            take_profit_price: None,
            target_r: None,
            time_stop_candles: None,
            trailing_activated: false,
            trailing_stop_price: None,
            tp1_done: false,
            risk_unit: dec!(100) - stop,
        }
    }

    #[test]
    fn highest_price_is_monotonic() {
        let mut p = Position::open(Symbol::new("KRW-SOL"), dec!(100), dec!(2), None, meta(dec!(95)));
        assert!(p.observe_price(dec!(110)));
        assert!(!p.observe_price(dec!(105)));
        assert_eq!(p.highest_price_seen(), dec!(110));
        assert!(p.observe_price(dec!(111)));
        assert_eq!(p.highest_price_seen(), dec!(111));
    }

    #[test]
    fn r_multiple_from_risk_unit() {
        let p = Position::open(Symbol::new("KRW-SOL"), dec!(100), dec!(2), None, meta(dec!(95)));
        assert_eq!(p.r_multiple(dec!(110)), Some(dec!(2)));
        assert_eq!(p.r_multiple(dec!(95)), Some(dec!(-1)));
    }

    #[test]
    fn effective_stop_prefers_activated_trailing() {
        let mut p = Position::open(Symbol::new("KRW-SOL"), dec!(100), dec!(2), None, meta(dec!(95)));
        assert_eq!(p.effective_stop(), dec!(95));
        p.buy_meta.trailing_stop_price = Some(dec!(104));
        // Not yet activated: structural stop still rules
        assert_eq!(p.effective_stop(), dec!(95));
        p.buy_meta.trailing_activated = true;
        assert_eq!(p.effective_stop(), dec!(104));
    }

    #[test]
    fn sold_ratio_tracks_partial_exits() {
        let mut p = Position::open(Symbol::new("KRW-ADA"), dec!(100), dec!(10), None, meta(dec!(95)));
        assert_eq!(p.sold_ratio(), dec!(0));
        p.amount = dec!(7);
        assert_eq!(p.sold_ratio(), dec!(0.3));
    }

    #[test]
    fn snapshot_roundtrip_preserves_fields() {
        let mut p = Position::open(Symbol::new("KRW-DOGE"), dec!(512.3), dec!(19.5), Some("u1".into()), meta(dec!(500)));
        p.observe_price(dec!(520));
        let json = serde_json::to_string(&p).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.symbol, p.symbol);
        assert_eq!(back.buy_price, p.buy_price);
        assert_eq!(back.amount, p.amount);
        assert_eq!(back.highest_price_seen(), dec!(520));
        assert_eq!(back.order_uuid.as_deref(), Some("u1"));
    }
}
