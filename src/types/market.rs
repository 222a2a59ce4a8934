#![allow(dead_code)]
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A KRW-quoted market code, e.g. "KRW-BTC".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim().to_uppercase();
        let mut parts = code.splitn(2, '-');
        match (parts.next(), parts.next()) {
            (Some("KRW"), Some(base)) if !base.is_empty() => Some(Self(code.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The coin portion of the market code ("BTC" for "KRW-BTC").
    pub fn base_asset(&self) -> &str {
        self.0.split('-').nth(1).unwrap_or(&self.0)
    }

    pub fn quote_asset(&self) -> &'static str {
        "KRW"
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "bid",
            Side::Sell => "ask",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Macro market classification derived from the reference asset's EMA
/// alignment on the signal timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Regime {
    Bull,
    Bear,
    Range,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Bull => "BULL",
            Regime::Bear => "BEAR",
            Regime::Range => "RANGE",
        }
    }

    /// BEAR blocks all new entries; positions may still be exited.
    pub fn allows_entries(&self) -> bool {
        !matches!(self, Regime::Bear)
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for Regime {
    fn default() -> Self {
        Regime::Range
    }
}

/// Why a position was closed. Stop variants trigger the per-symbol
/// re-entry cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StructuralStop,
    TrailingStop,
    TakeProfit1,
    TakeProfit,
    RangeTarget,
    TimeStop,
    MaxHold,
    DustCleanup,
    Liquidation,
    Manual,
}

impl CloseReason {
    pub fn is_stop_loss(&self) -> bool {
        matches!(self, CloseReason::StructuralStop | CloseReason::TrailingStop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StructuralStop => "structural_stop",
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::TakeProfit1 => "take_profit_1",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::RangeTarget => "range_target",
            CloseReason::TimeStop => "time_stop",
            CloseReason::MaxHold => "max_hold",
            CloseReason::DustCleanup => "dust_cleanup",
            CloseReason::Liquidation => "liquidation",
            CloseReason::Manual => "manual",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Top-of-book level pair as returned by the exchange order book endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderBookUnit {
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_parses_krw_markets_only() {
        assert_eq!(Symbol::parse("KRW-BTC"), Some(Symbol::new("KRW-BTC")));
        assert_eq!(Symbol::parse("krw-sol").unwrap().base_asset(), "SOL");
        assert!(Symbol::parse("BTC-ETH").is_none());
        assert!(Symbol::parse("KRW-").is_none());
    }

    #[test]
    fn stop_reasons_trigger_cooldown() {
        assert!(CloseReason::StructuralStop.is_stop_loss());
        assert!(CloseReason::TrailingStop.is_stop_loss());
        assert!(!CloseReason::TakeProfit.is_stop_loss());
        assert!(!CloseReason::MaxHold.is_stop_loss());
    }

    #[test]
    fn bear_blocks_entries() {
        assert!(!Regime::Bear.allows_entries());
        assert!(Regime::Bull.allows_entries());
        assert!(Regime::Range.allows_entries());
    }
}
