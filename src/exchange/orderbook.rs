use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderBookUnit, Symbol};

/// Top-of-book snapshot, best five levels per side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: Symbol,
    pub units: Vec<OrderBookUnit>,
}

impl OrderBook {
    pub fn best(&self) -> Option<&OrderBookUnit> {
        self.units.first()
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.best().map(|u| u.bid_price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.best().map(|u| u.ask_price)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let top = self.best()?;
        Some((top.bid_price + top.ask_price) / Decimal::TWO)
    }

    pub fn spread_pct(&self) -> Option<Decimal> {
        let top = self.best()?;
        if top.bid_price.is_zero() {
            return None;
        }
        Some((top.ask_price - top.bid_price) / top.bid_price * Decimal::ONE_HUNDRED)
    }

    /// Aggregated KRW notional over the best five bid levels.
    pub fn bid_depth_krw(&self) -> Decimal {
        self.units.iter().take(5).map(|u| u.bid_price * u.bid_size).sum()
    }

    /// Aggregated KRW notional over the best five ask levels.
    pub fn ask_depth_krw(&self) -> Decimal {
        self.units.iter().take(5).map(|u| u.ask_price * u.ask_size).sum()
    }
}

/// Why an order book failed the pre-trade gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookRejection {
    Empty,
    WideSpread,
    LowLiquidity,
}

/// Pre-trade safety check: spread within bounds and enough depth on both
/// sides. Must pass before any order is placed.
pub fn check_book_safety(
    book: &OrderBook,
    max_spread_pct: Decimal,
    min_depth_krw: Decimal,
) -> Result<(), BookRejection> {
    let spread = book.spread_pct().ok_or(BookRejection::Empty)?;
    if spread > max_spread_pct {
        return Err(BookRejection::WideSpread);
    }
    if book.bid_depth_krw() < min_depth_krw || book.ask_depth_krw() < min_depth_krw {
        return Err(BookRejection::LowLiquidity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(levels: usize, bid: Decimal, ask: Decimal, size: Decimal) -> OrderBook {
        OrderBook {
            symbol: Symbol::new("KRW-SOL"),
            units: (0..levels)
                .map(|i| OrderBookUnit {
                    bid_price: bid - Decimal::from(i as u32),
                    bid_size: size,
                    ask_price: ask + Decimal::from(i as u32),
                    ask_size: size,
                })
                .collect(),
        }
    }

    #[test]
    fn depth_sums_top_five_levels() {
        let b = book(7, dec!(1000), dec!(1001), dec!(1));
        // 1000 + 999 + 998 + 997 + 996
        assert_eq!(b.bid_depth_krw(), dec!(4990));
        assert_eq!(b.ask_depth_krw(), dec!(5015));
    }

    #[test]
    fn safety_gate_rejects_wide_spread_and_thin_books() {
        let ok = book(5, dec!(1000), dec!(1001), dec!(10));
        assert!(check_book_safety(&ok, dec!(0.25), dec!(5000)).is_ok());

        let wide = book(5, dec!(1000), dec!(1010), dec!(10));
        assert_eq!(
            check_book_safety(&wide, dec!(0.25), dec!(5000)),
            Err(BookRejection::WideSpread)
        );

        let thin = book(5, dec!(1000), dec!(1001), dec!(0.5));
        assert_eq!(
            check_book_safety(&thin, dec!(0.25), dec!(5000)),
            Err(BookRejection::LowLiquidity)
        );

        let empty = OrderBook { symbol: Symbol::new("KRW-SOL"), units: vec![] };
        assert_eq!(
            check_book_safety(&empty, dec!(0.25), dec!(5000)),
            Err(BookRejection::Empty)
        );
    }
}
