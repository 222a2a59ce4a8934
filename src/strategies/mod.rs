pub mod momentum_pullback;
pub mod range_reversion;
pub mod trend_breakout;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::analysis::SymbolState;
use crate::config::{RiskSettings, StrategySettings};
use crate::types::{CloseReason, Position, Regime, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    TrendBreakout,
    MomentumPullback,
    RangeReversion,
}

impl StrategyId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyId::TrendBreakout => "trend_breakout",
            StrategyId::MomentumPullback => "momentum_pullback",
            StrategyId::RangeReversion => "range_reversion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trend_breakout" => Some(StrategyId::TrendBreakout),
            "momentum_pullback" => Some(StrategyId::MomentumPullback),
            "range_reversion" => Some(StrategyId::RangeReversion),
            _ => None,
        }
    }

    /// Regimes the strategy trades in when the config does not restrict it.
    pub fn default_regimes(&self) -> &'static [Regime] {
        match self {
            StrategyId::TrendBreakout => &[Regime::Bull],
            StrategyId::MomentumPullback => &[Regime::Bull, Regime::Range],
            StrategyId::RangeReversion => &[Regime::Range],
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry contract produced by a strategy: stop/target levels anchored to
/// the signal close. The executor fills at the live top of book.
#[derive(Debug, Clone, Serialize)]
pub struct EntryPlan {
    pub strategy: StrategyId,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub take_profit_price: Option<Decimal>,
    pub target_r: Option<Decimal>,
    pub time_stop_candles: Option<u32>,
    pub risk_unit: Decimal,
    pub reasons: Vec<String>,
}

/// A sell instruction: how much of the position and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDecision {
    pub reason: CloseReason,
    /// Fraction of the current amount to liquidate, in (0, 1].
    pub ratio_pct: u32,
}

impl ExitDecision {
    pub fn full(reason: CloseReason) -> Self {
        Self { reason, ratio_pct: 100 }
    }

    pub fn partial(reason: CloseReason, ratio_pct: u32) -> Self {
        Self { reason, ratio_pct }
    }

    pub fn ratio(&self) -> Decimal {
        Decimal::from(self.ratio_pct) / Decimal::ONE_HUNDRED
    }

    pub fn is_full(&self) -> bool {
        self.ratio_pct >= 100
    }
}

/// Pure (symbol, regime) → strategy mapping. Config entries win; the
/// regime table is the fallback.
pub fn select_strategy(
    symbol: &Symbol,
    regime: Regime,
    settings: &StrategySettings,
) -> Option<StrategyId> {
    if let Some(entry) = settings.symbol_strategy_map.get(symbol.as_str()) {
        let id = StrategyId::parse(&entry.strategy)?;
        let allowed: &[Regime] = if entry.regimes.is_empty() {
            id.default_regimes()
        } else {
            &entry.regimes
        };
        return allowed.contains(&regime).then_some(id);
    }

    if settings.mode == "regime" {
        return match regime {
            Regime::Bull => Some(StrategyId::TrendBreakout),
            Regime::Range => Some(StrategyId::RangeReversion),
            Regime::Bear => None,
        };
    }
    None
}

/// Entry dispatch. The state is already gated for regime, macro trend,
/// time and volatility by the loop; strategies check their own triggers.
pub fn evaluate_entry(
    id: StrategyId,
    state: &SymbolState,
    settings: &StrategySettings,
) -> Option<EntryPlan> {
    match id {
        StrategyId::TrendBreakout => trend_breakout::evaluate_entry(state, settings),
        StrategyId::MomentumPullback => momentum_pullback::evaluate_entry(state, settings),
        StrategyId::RangeReversion => range_reversion::evaluate_entry(state, settings),
    }
}

/// Exit evaluation shared by all strategies. Stops and trailing always
/// apply; strategy-specific profit logic and time exits respect the
/// minimum-hold guard. May mutate trailing state on the position.
pub fn evaluate_exit(
    position: &mut Position,
    state: &SymbolState,
    current_price: Decimal,
    now: DateTime<Utc>,
    strategy_settings: &StrategySettings,
    risk: &RiskSettings,
) -> Option<ExitDecision> {
    let strategy = StrategyId::parse(&position.buy_meta.strategy)
        .unwrap_or(StrategyId::MomentumPullback);

    // Trailing management first so a fresh ratchet is honored this tick.
    if strategy == StrategyId::TrendBreakout {
        trend_breakout::manage_trailing(position, strategy_settings);
    }

    let stop = position.effective_stop();
    if current_price <= stop {
        let trailing_ruled = position.buy_meta.trailing_activated
            && position
                .buy_meta
                .trailing_stop_price
                .map(|t| t > position.buy_meta.stop_price)
                .unwrap_or(false);
        let reason = if trailing_ruled {
            CloseReason::TrailingStop
        } else {
            CloseReason::StructuralStop
        };
        return Some(ExitDecision::full(reason));
    }

    let hold_minutes = position.hold_minutes(now);
    if hold_minutes < risk.min_hold_minutes {
        // Only the hard stop and trailing may fire this early.
        return None;
    }

    let decision = match strategy {
        StrategyId::TrendBreakout => {
            trend_breakout::evaluate_exit(position, current_price, strategy_settings)
        }
        StrategyId::MomentumPullback => momentum_pullback::evaluate_exit(
            position,
            current_price,
            hold_minutes,
            strategy_settings,
        ),
        StrategyId::RangeReversion => {
            range_reversion::evaluate_exit(position, state, current_price)
        }
    };
    if decision.is_some() {
        return decision;
    }

    if hold_minutes >= risk.max_hold_minutes {
        return Some(ExitDecision::full(CloseReason::MaxHold));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SymbolStrategyEntry;
    use rust_decimal_macros::dec;

    fn settings_with_map() -> StrategySettings {
        let mut settings = StrategySettings::default();
        settings.symbol_strategy_map.insert(
            "KRW-SOL".to_string(),
            SymbolStrategyEntry {
                strategy: "trend_breakout".to_string(),
                regimes: vec![Regime::Bull],
            },
        );
        settings.symbol_strategy_map.insert(
            "KRW-DOGE".to_string(),
            SymbolStrategyEntry {
                strategy: "momentum_pullback".to_string(),
                regimes: vec![],
            },
        );
        settings
    }

    #[test]
    fn mapped_symbol_honors_allowed_regimes() {
        let settings = settings_with_map();
        let sol = Symbol::new("KRW-SOL");
        assert_eq!(
            select_strategy(&sol, Regime::Bull, &settings),
            Some(StrategyId::TrendBreakout)
        );
        assert_eq!(select_strategy(&sol, Regime::Range, &settings), None);
        assert_eq!(select_strategy(&sol, Regime::Bear, &settings), None);
    }

    #[test]
    fn empty_regime_list_falls_back_to_strategy_defaults() {
        let settings = settings_with_map();
        let doge = Symbol::new("KRW-DOGE");
        assert_eq!(
            select_strategy(&doge, Regime::Range, &settings),
            Some(StrategyId::MomentumPullback)
        );
        assert_eq!(select_strategy(&doge, Regime::Bear, &settings), None);
    }

    #[test]
    fn unmapped_symbol_uses_regime_table() {
        let settings = StrategySettings::default();
        let xrp = Symbol::new("KRW-XRP");
        assert_eq!(
            select_strategy(&xrp, Regime::Bull, &settings),
            Some(StrategyId::TrendBreakout)
        );
        assert_eq!(
            select_strategy(&xrp, Regime::Range, &settings),
            Some(StrategyId::RangeReversion)
        );
        assert_eq!(select_strategy(&xrp, Regime::Bear, &settings), None);
    }

    #[test]
    fn exit_ratio_conversion() {
        let d = ExitDecision::partial(CloseReason::TakeProfit1, 30);
        assert_eq!(d.ratio(), dec!(0.3));
        assert!(!d.is_full());
        assert!(ExitDecision::full(CloseReason::MaxHold).is_full());
    }
}
