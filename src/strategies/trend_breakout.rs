use rust_decimal::Decimal;

use super::{EntryPlan, ExitDecision, StrategyId};
use crate::analysis::SymbolState;
use crate::config::StrategySettings;
use crate::types::{CloseReason, Position};

/// Breakout over the lookback high with a confirmed retest. Bull-regime
/// entries only; risk is ATR-anchored and winners are handed to the
/// trailing stop.
pub fn evaluate_entry(state: &SymbolState, settings: &StrategySettings) -> Option<EntryPlan> {
    if state.close <= state.breakout_level {
        return None;
    }
    if !state.retest_ok {
        return None;
    }
    if !state.volatility_ok {
        return None;
    }

    let entry = state.close;
    let stop = entry - settings.sol_stop_atr * state.atr;
    let risk_unit = entry - stop;
    if risk_unit <= Decimal::ZERO {
        return None;
    }

    Some(EntryPlan {
        strategy: StrategyId::TrendBreakout,
        entry_price: entry,
        stop_price: stop,
        take_profit_price: None,
        target_r: None,
        time_stop_candles: None,
        risk_unit,
        reasons: vec![
            format!("breakout>{}", state.breakout_level),
            "retest_confirmed".to_string(),
        ],
    })
}

/// Activates and ratchets the trailing stop off the highest price seen.
/// The trail may only move up.
pub fn manage_trailing(position: &mut Position, settings: &StrategySettings) {
    let highest = position.highest_price_seen();
    let buy_price = position.buy_price;
    let meta = &mut position.buy_meta;
    if meta.risk_unit <= Decimal::ZERO {
        return;
    }

    if !meta.trailing_activated {
        let activate_at = buy_price + settings.sol_trail_activate_r * meta.risk_unit;
        if highest >= activate_at {
            meta.trailing_activated = true;
        }
    }

    if meta.trailing_activated {
        let candidate = highest * (Decimal::ONE - settings.sol_trailing_stop_pct);
        match meta.trailing_stop_price {
            Some(current) if candidate <= current => {}
            _ => meta.trailing_stop_price = Some(candidate),
        }
    }
}

/// One-shot partial profit at +tp1_r·R. The trailing stop itself fires
/// through the shared stop check.
pub fn evaluate_exit(
    position: &Position,
    current_price: Decimal,
    settings: &StrategySettings,
) -> Option<ExitDecision> {
    let r = position.r_multiple(current_price)?;
    if !position.buy_meta.tp1_done && r >= settings.sol_tp1_r {
        return Some(ExitDecision::partial(CloseReason::TakeProfit1, 30));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuyMeta, Symbol};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn state(close: Decimal, breakout: Decimal, retest: bool, vol_ok: bool) -> SymbolState {
        SymbolState {
            candle_timestamp: Utc::now(),
            close,
            rsi: dec!(55),
            atr: dec!(2),
            atr_pct: dec!(2),
            tr_atr_ratio: dec!(1),
            volume_ratio: dec!(1.2),
            ema20: close,
            ema50: close - dec!(1),
            ema200: close - dec!(2),
            structure: crate::types::Regime::Bull,
            swing_high: close + dec!(5),
            swing_low: close - dec!(5),
            range_position: dec!(0.8),
            in_middle_zone: false,
            breakout_level: breakout,
            retest_ok: retest,
            volatility_ok: vol_ok,
            quality_score: dec!(40),
        }
    }

    fn open_position(entry: Decimal, stop: Decimal) -> Position {
        Position::open(
            Symbol::new("KRW-SOL"),
            entry,
            dec!(1),
            None,
            BuyMeta {
                strategy: "trend_breakout".to_string(),
                stop_price: stop,
                take_profit_price: None,
                target_r: None,
                time_stop_candles: None,
                trailing_activated: false,
                trailing_stop_price: None,
                tp1_done: false,
                risk_unit: entry - stop,
            },
        )
    }

    #[test]
    fn entry_requires_breakout_retest_and_calm_volatility() {
        let settings = StrategySettings::default();
        let plan = evaluate_entry(&state(dec!(102), dec!(101), true, true), &settings).unwrap();
        assert_eq!(plan.stop_price, dec!(99)); // 102 - 1.5 * 2
        assert_eq!(plan.risk_unit, dec!(3));
        assert!(plan.take_profit_price.is_none());

        assert!(evaluate_entry(&state(dec!(100), dec!(101), true, true), &settings).is_none());
        assert!(evaluate_entry(&state(dec!(102), dec!(101), false, true), &settings).is_none());
        assert!(evaluate_entry(&state(dec!(102), dec!(101), true, false), &settings).is_none());
    }

    #[test]
    fn trailing_activates_then_only_ratchets_up() {
        let settings = StrategySettings::default();
        let mut pos = open_position(dec!(100), dec!(97));
        // +1.5R = 104.5 activates
        pos.observe_price(dec!(103));
        manage_trailing(&mut pos, &settings);
        assert!(!pos.buy_meta.trailing_activated);

        pos.observe_price(dec!(105));
        manage_trailing(&mut pos, &settings);
        assert!(pos.buy_meta.trailing_activated);
        assert_eq!(pos.buy_meta.trailing_stop_price, Some(dec!(102.90)));

        // New high lifts the trail
        pos.observe_price(dec!(110));
        manage_trailing(&mut pos, &settings);
        assert_eq!(pos.buy_meta.trailing_stop_price, Some(dec!(107.80)));

        // Price falling back never lowers it
        manage_trailing(&mut pos, &settings);
        assert_eq!(pos.buy_meta.trailing_stop_price, Some(dec!(107.80)));
    }

    #[test]
    fn tp1_fires_once_at_target_r() {
        let settings = StrategySettings::default();
        let pos = open_position(dec!(100), dec!(97));
        // +1R = 103
        let exit = evaluate_exit(&pos, dec!(103), &settings).unwrap();
        assert_eq!(exit.reason, CloseReason::TakeProfit1);
        assert_eq!(exit.ratio_pct, 30);

        let mut done = open_position(dec!(100), dec!(97));
        done.buy_meta.tp1_done = true;
        assert!(evaluate_exit(&done, dec!(105), &settings).is_none());
    }
}
