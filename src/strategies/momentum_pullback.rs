use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{EntryPlan, ExitDecision, StrategyId};
use crate::analysis::SymbolState;
use crate::config::StrategySettings;
use crate::types::{CloseReason, Position};

/// Volume-spike momentum with a pullback to the 20-EMA. A percent stop,
/// a fixed R target and a time stop keep the trade short-lived.
pub fn evaluate_entry(state: &SymbolState, settings: &StrategySettings) -> Option<EntryPlan> {
    if state.volume_ratio < settings.doge_volume_spike_min {
        return None;
    }
    if state.rsi <= settings.doge_rsi_min {
        return None;
    }
    let tolerance =
        (state.atr * settings.doge_pullback_atr_tolerance).max(state.close * dec!(0.0025));
    if (state.close - state.ema20).abs() > tolerance {
        return None;
    }

    let entry = state.close;
    let stop = entry * (Decimal::ONE - settings.doge_stop_pct);
    let risk_unit = entry - stop;
    if risk_unit <= Decimal::ZERO {
        return None;
    }

    Some(EntryPlan {
        strategy: StrategyId::MomentumPullback,
        entry_price: entry,
        stop_price: stop,
        take_profit_price: Some(entry + settings.doge_target_r * risk_unit),
        target_r: Some(settings.doge_target_r),
        time_stop_candles: Some(settings.doge_time_stop_candles),
        risk_unit,
        reasons: vec![
            format!("volume_spike({})", state.volume_ratio.round_dp(2)),
            format!("rsi({})", state.rsi.round_dp(1)),
            "ema20_pullback".to_string(),
        ],
    })
}

/// Target at +target_r·R, else a time stop once the allotted closed bars
/// elapse without reaching it.
pub fn evaluate_exit(
    position: &Position,
    current_price: Decimal,
    hold_minutes: i64,
    settings: &StrategySettings,
) -> Option<ExitDecision> {
    let r = position.r_multiple(current_price)?;
    let target = position
        .buy_meta
        .target_r
        .unwrap_or(settings.doge_target_r);

    if r >= target {
        return Some(ExitDecision::full(CloseReason::TakeProfit));
    }

    let time_stop_candles = position
        .buy_meta
        .time_stop_candles
        .unwrap_or(settings.doge_time_stop_candles) as i64;
    let candle_minutes = settings.signal_candle_minutes as i64;
    if candle_minutes > 0 && hold_minutes >= time_stop_candles * candle_minutes {
        return Some(ExitDecision::full(CloseReason::TimeStop));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BuyMeta, Regime, Symbol};
    use chrono::Utc;

    fn state(volume_ratio: Decimal, rsi: Decimal, close: Decimal, ema20: Decimal) -> SymbolState {
        SymbolState {
            candle_timestamp: Utc::now(),
            close,
            rsi,
            atr: dec!(2),
            atr_pct: dec!(2),
            tr_atr_ratio: dec!(1),
            volume_ratio,
            ema20,
            ema50: close - dec!(1),
            ema200: close - dec!(2),
            structure: Regime::Bull,
            swing_high: close + dec!(5),
            swing_low: close - dec!(5),
            range_position: dec!(0.5),
            in_middle_zone: true,
            breakout_level: close + dec!(1),
            retest_ok: false,
            volatility_ok: true,
            quality_score: dec!(30),
        }
    }

    fn open_position(entry: Decimal, stop: Decimal, target_r: Decimal, time_stop: u32) -> Position {
        Position::open(
            Symbol::new("KRW-DOGE"),
            entry,
            dec!(100),
            None,
            BuyMeta {
                strategy: "momentum_pullback".to_string(),
                stop_price: stop,
                take_profit_price: Some(entry + target_r * (entry - stop)),
                target_r: Some(target_r),
                time_stop_candles: Some(time_stop),
                trailing_activated: false,
                trailing_stop_price: None,
                tp1_done: false,
                risk_unit: entry - stop,
            },
        )
    }

    #[test]
    fn entry_needs_spike_rsi_and_pullback() {
        let settings = StrategySettings::default();
        // tolerance = max(2 * 0.5, 100 * 0.0025) = 1
        let plan = evaluate_entry(&state(dec!(2.0), dec!(60), dec!(100), dec!(100.5)), &settings)
            .unwrap();
        assert_eq!(plan.stop_price, dec!(99.2000)); // 100 * (1 - 0.008)
        assert_eq!(plan.time_stop_candles, Some(6));

        assert!(evaluate_entry(&state(dec!(1.2), dec!(60), dec!(100), dec!(100)), &settings).is_none());
        assert!(evaluate_entry(&state(dec!(2.0), dec!(45), dec!(100), dec!(100)), &settings).is_none());
        assert!(evaluate_entry(&state(dec!(2.0), dec!(60), dec!(100), dec!(97)), &settings).is_none());
    }

    #[test]
    fn target_hit_closes_in_full() {
        let settings = StrategySettings::default();
        let pos = open_position(dec!(100), dec!(99), dec!(1.5), 6);
        // +1.5R = 101.5
        let exit = evaluate_exit(&pos, dec!(101.5), 10, &settings).unwrap();
        assert_eq!(exit.reason, CloseReason::TakeProfit);
        assert!(exit.is_full());
    }

    #[test]
    fn time_stop_fires_after_allotted_candles() {
        let settings = StrategySettings::default();
        let pos = open_position(dec!(100), dec!(99), dec!(1.5), 6);
        // 6 candles * 20 minutes = 120 minutes
        assert!(evaluate_exit(&pos, dec!(100.2), 119, &settings).is_none());
        let exit = evaluate_exit(&pos, dec!(100.2), 120, &settings).unwrap();
        assert_eq!(exit.reason, CloseReason::TimeStop);
    }
}
