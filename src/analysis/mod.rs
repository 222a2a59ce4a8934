use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::config::StrategySettings;
use crate::indicators::{ema, highest, lowest, Atr, RelativeVolume, Rsi};
use crate::types::{CandleSeries, Regime};

/// Per-symbol snapshot computed from the signal-timeframe series. Built on
/// demand each evaluation, never stored across ticks.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolState {
    pub candle_timestamp: DateTime<Utc>,
    pub close: Decimal,
    pub rsi: Decimal,
    pub atr: Decimal,
    pub atr_pct: Decimal,
    pub tr_atr_ratio: Decimal,
    pub volume_ratio: Decimal,
    pub ema20: Decimal,
    pub ema50: Decimal,
    pub ema200: Decimal,
    pub structure: Regime,
    pub swing_high: Decimal,
    pub swing_low: Decimal,
    pub range_position: Decimal,
    pub in_middle_zone: bool,
    pub breakout_level: Decimal,
    pub retest_ok: bool,
    pub volatility_ok: bool,
    pub quality_score: Decimal,
}

impl SymbolState {
    /// Band within which a retest close counts as "back at the level".
    pub fn retest_band(&self) -> Decimal {
        (self.atr * dec!(0.2)).max(self.close * dec!(0.0015))
    }
}

/// EMA-alignment structure rule shared by the analyzer and the regime
/// engine.
pub fn classify_structure(close: Decimal, ema50: Decimal, ema200: Decimal) -> Regime {
    if close > ema50 && ema50 > ema200 {
        Regime::Bull
    } else if close < ema50 && ema50 < ema200 {
        Regime::Bear
    } else {
        Regime::Range
    }
}

/// Computes `SymbolState` from a closed-bar series on the signal timeframe.
pub struct SymbolAnalyzer {
    settings: StrategySettings,
}

impl SymbolAnalyzer {
    pub fn new(settings: StrategySettings) -> Self {
        Self { settings }
    }

    /// All reads come from the last closed bar; the in-progress bar never
    /// reaches this function. Returns `None` on short data or a
    /// non-positive close.
    pub fn analyze(&self, series: &CandleSeries) -> Option<SymbolState> {
        if series.len() < crate::market::MIN_RESAMPLED_BARS {
            return None;
        }
        let current = series.last()?;
        if current.close <= Decimal::ZERO {
            return None;
        }

        let closes = series.closes();
        let highs = series.highs();
        let lows = series.lows();

        let ema20 = ema(&closes, 20)?;
        let ema50 = ema(&closes, 50)?;
        let ema200 = ema(&closes, 200)?;

        let mut rsi_ind = Rsi::new(14);
        let mut atr_ind = Atr::new(14);
        let mut vol_ind = RelativeVolume::new(20);
        for c in &series.candles {
            rsi_ind.update(c.close);
            atr_ind.update(c.high, c.low, c.close);
            vol_ind.update(c.volume);
        }
        let rsi = rsi_ind.value()?;
        let atr = atr_ind.value()?;
        let tr = atr_ind.last_true_range()?;
        let volume_ratio = vol_ind.ratio()?;

        if atr <= Decimal::ZERO {
            return None;
        }
        let atr_pct = atr / current.close * Decimal::ONE_HUNDRED;
        let tr_atr_ratio = tr / atr;
        let volatility_ok = tr_atr_ratio <= self.settings.volatility_tr_atr_max;

        // Breakout level over the lookback preceding the current bar.
        let breakout_lookback = self.settings.sol_breakout_lookback;
        let breakout_level = highest(&highs[..highs.len() - 1], breakout_lookback)?;
        let band = (atr * dec!(0.2)).max(current.close * dec!(0.0015));
        let retest_ok = current.low <= breakout_level
            && (current.close - breakout_level).abs() <= band;

        // Range geometry over the reversion lookback, current bar included.
        let range_lookback = self.settings.ada_range_lookback.min(series.len());
        let swing_high = highest(&highs, range_lookback)?;
        let swing_low = lowest(&lows, range_lookback)?;
        let range_width = swing_high - swing_low;
        let range_position = if range_width > Decimal::ZERO {
            ((current.close - swing_low) / range_width)
                .clamp(Decimal::ZERO, Decimal::ONE)
        } else {
            dec!(0.5)
        };
        let in_middle_zone = range_position >= dec!(0.40) && range_position <= dec!(0.60);

        let structure = classify_structure(current.close, ema50, ema200);

        let mut quality_score = Decimal::ZERO;
        if volatility_ok {
            quality_score += dec!(20);
        }
        quality_score += (volume_ratio * dec!(9)).min(dec!(18));
        if current.close > breakout_level {
            quality_score += dec!(10);
        }
        if retest_ok {
            quality_score += dec!(8);
        }
        let pullback_band =
            (atr * self.settings.doge_pullback_atr_tolerance).max(current.close * dec!(0.0025));
        if (current.close - ema20).abs() <= pullback_band {
            quality_score += dec!(8);
        }
        if range_position <= dec!(0.15) {
            quality_score += dec!(10);
        }
        if range_position <= self.settings.ada_entry_lower_pct && current.is_bullish() {
            quality_score += dec!(8);
        }

        Some(SymbolState {
            candle_timestamp: current.timestamp,
            close: current.close,
            rsi,
            atr,
            atr_pct,
            tr_atr_ratio,
            volume_ratio,
            ema20,
            ema50,
            ema200,
            structure,
            swing_high,
            swing_low,
            range_position,
            in_middle_zone,
            breakout_level,
            retest_ok,
            volatility_ok,
            quality_score,
        })
    }
}

/// Macro-trend gate: reference close above its EMA(period).
pub fn macro_trend_ok(series: &CandleSeries, period: usize) -> Option<bool> {
    let closes = series.closes();
    let reference_ema = ema(&closes, period)?;
    let close = *closes.last()?;
    Some(close > reference_ema)
}
