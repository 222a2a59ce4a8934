use rust_decimal::Decimal;

use super::{EntryPlan, ExitDecision, StrategyId};
use crate::analysis::SymbolState;
use crate::config::StrategySettings;
use crate::types::{CloseReason, Position};

/// Oversold entries near the bottom of the recent range, targeting the
/// upper portion of the same range. Range-regime only.
pub fn evaluate_entry(state: &SymbolState, settings: &StrategySettings) -> Option<EntryPlan> {
    if state.rsi > settings.ada_rsi_max {
        return None;
    }
    if state.range_position > settings.ada_entry_lower_pct {
        return None;
    }

    let entry = state.close;
    let stop = entry * (Decimal::ONE - settings.ada_stop_pct);
    let risk_unit = entry - stop;
    if risk_unit <= Decimal::ZERO {
        return None;
    }

    let range_width = state.swing_high - state.swing_low;
    let take_profit = state.swing_low + range_width * settings.ada_take_profit_upper_pct;
    if take_profit <= entry {
        return None;
    }

    Some(EntryPlan {
        strategy: StrategyId::RangeReversion,
        entry_price: entry,
        stop_price: stop,
        take_profit_price: Some(take_profit),
        target_r: None,
        time_stop_candles: None,
        risk_unit,
        reasons: vec![
            format!("rsi_oversold({})", state.rsi.round_dp(1)),
            format!("range_low({})", state.range_position.round_dp(2)),
        ],
    })
}

/// Full close at the range target captured at entry.
pub fn evaluate_exit(
    position: &Position,
    _state: &SymbolState,
    current_price: Decimal,
) -> Option<ExitDecision> {
    let target = position.buy_meta.take_profit_price?;
    if current_price >= target {
        return Some(ExitDecision::full(CloseReason::RangeTarget));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuyMeta, Regime, Symbol};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn state(rsi: Decimal, range_position: Decimal) -> SymbolState {
        SymbolState {
            candle_timestamp: Utc::now(),
            close: dec!(100),
            rsi,
            atr: dec!(2),
            atr_pct: dec!(2),
            tr_atr_ratio: dec!(1),
            volume_ratio: dec!(1),
            ema20: dec!(101),
            ema50: dec!(102),
            ema200: dec!(101),
            structure: Regime::Range,
            swing_high: dec!(110),
            swing_low: dec!(98),
            range_position,
            in_middle_zone: false,
            breakout_level: dec!(111),
            retest_ok: false,
            volatility_ok: true,
            quality_score: dec!(30),
        }
    }

    #[test]
    fn entry_needs_oversold_rsi_near_range_low() {
        let settings = StrategySettings::default();
        let plan = evaluate_entry(&state(dec!(30), dec!(0.15)), &settings).unwrap();
        assert_eq!(plan.stop_price, dec!(99.00)); // 100 * (1 - 0.01)
        // 98 + 12 * 0.75
        assert_eq!(plan.take_profit_price, Some(dec!(107.00)));

        assert!(evaluate_entry(&state(dec!(50), dec!(0.15)), &settings).is_none());
        assert!(evaluate_entry(&state(dec!(30), dec!(0.60)), &settings).is_none());
    }

    #[test]
    fn exit_at_range_target() {
        let pos = Position::open(
            Symbol::new("KRW-ADA"),
            dec!(100),
            dec!(10),
            None,
            BuyMeta {
                strategy: "range_reversion".to_string(),
                stop_price: dec!(99),
                take_profit_price: Some(dec!(107)),
                target_r: None,
                time_stop_candles: None,
                trailing_activated: false,
                trailing_stop_price: None,
                tp1_done: false,
                risk_unit: dec!(1),
            },
        );
        let s = state(dec!(40), dec!(0.7));
        assert!(evaluate_exit(&pos, &s, dec!(106)).is_none());
        let exit = evaluate_exit(&pos, &s, dec!(107)).unwrap();
        assert_eq!(exit.reason, CloseReason::RangeTarget);
        assert!(exit.is_full());
    }
}
