use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::types::Regime;

/// Full bot configuration. Every field has a default so a partial
/// `config.toml` is enough to run; unknown keys are reported as warnings,
/// not errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub trading: TradingSettings,
    pub strategy: StrategySettings,
    pub risk_management: RiskSettings,
    pub coin_selection: CoinSelection,
    pub api: ApiCredentials,
    pub storage: StorageSettings,
}

impl Settings {
    /// Loads `config.toml` (if present) merged with `KRWBOT_*` environment
    /// overrides; `.env` is honored for credentials.
    pub fn load(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::from(Path::new(path)));
        } else {
            warn!("config file {} not found, using defaults", path);
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KRWBOT")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder.build().context("failed to read configuration")?;
        Self::warn_unknown_keys(&raw);
        let mut settings: Settings = raw
            .try_deserialize()
            .context("failed to parse configuration")?;

        if settings.api.access_key.is_empty() {
            settings.api.access_key = std::env::var("UPBIT_ACCESS_KEY").unwrap_or_default();
        }
        if settings.api.secret_key.is_empty() {
            settings.api.secret_key = std::env::var("UPBIT_SECRET_KEY").unwrap_or_default();
        }

        Ok(settings)
    }

    fn warn_unknown_keys(raw: &config::Config) {
        const KNOWN: &[&str] = &[
            "trading",
            "strategy",
            "risk_management",
            "coin_selection",
            "api",
            "storage",
        ];
        if let Ok(table) = raw.clone().try_deserialize::<HashMap<String, config::Value>>() {
            for key in table.keys() {
                if !KNOWN.contains(&key.as_str()) {
                    warn!("unrecognized config section '{}' ignored", key);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let t = &self.trading;

        if t.max_total_investment <= Decimal::ZERO {
            errors.push("trading.max_total_investment must be > 0".to_string());
        }
        if t.min_trade_amount <= Decimal::ZERO {
            errors.push("trading.min_trade_amount must be > 0".to_string());
        }
        if t.check_interval_seconds == 0 {
            errors.push("trading.check_interval_seconds must be > 0".to_string());
        }
        if t.position_reconcile_interval_seconds < 30 {
            errors.push("trading.position_reconcile_interval_seconds must be >= 30".to_string());
        }
        if t.daily_loss_limit_percent >= Decimal::ZERO {
            errors.push("trading.daily_loss_limit_percent must be negative".to_string());
        }
        if t.fee_pct < Decimal::ZERO || t.fee_pct > dec!(0.01) {
            errors.push("trading.fee_pct must be within [0, 0.01]".to_string());
        }

        let s = &self.strategy;
        if s.max_positions == 0 {
            errors.push("strategy.max_positions must be > 0".to_string());
        }
        if s.regime_confirm_count == 0 {
            errors.push("strategy.regime_confirm_count must be > 0".to_string());
        }
        if s.volatility_tr_atr_max <= Decimal::ZERO {
            errors.push("strategy.volatility_tr_atr_max must be > 0".to_string());
        }

        let r = &self.risk_management;
        if r.risk_per_trade_pct <= Decimal::ZERO || r.risk_per_trade_pct > dec!(10) {
            errors.push("risk_management.risk_per_trade_pct must be between 0 and 10".to_string());
        }
        if r.min_hold_minutes > r.max_hold_minutes {
            errors.push("risk_management.min_hold_minutes must be <= max_hold_minutes".to_string());
        }

        if self.coin_selection.fixed_tickers.is_empty() {
            errors.push("coin_selection.fixed_tickers must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    Market,
    LimitWithFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UntrackedAction {
    Ignore,
    Attach,
    CleanupSmall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingHoursSettings {
    pub enabled: bool,
    pub sessions: Vec<TradingSession>,
}

impl Default for TradingHoursSettings {
    fn default() -> Self {
        Self { enabled: false, sessions: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradingSession {
    pub start_hour: u32,
    pub end_hour: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UntrackedBalanceSettings {
    pub action: UntrackedAction,
    pub cleanup_max_krw: Decimal,
}

impl Default for UntrackedBalanceSettings {
    fn default() -> Self {
        Self { action: UntrackedAction::Ignore, cleanup_max_krw: dec!(20000) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    pub max_total_investment: Decimal,
    pub min_trade_amount: Decimal,
    pub max_spread_percent: Decimal,
    pub min_orderbook_depth_krw: Decimal,
    pub order_type: OrderMode,
    pub limit_order_wait_seconds: u64,
    /// Taker fee fraction used when the exchange omits paid_fee.
    pub fee_pct: Decimal,
    pub check_interval_seconds: u64,
    pub daily_loss_limit_percent: Decimal,
    pub cooldown_after_loss_minutes: i64,
    pub reentry_cooldown_after_stoploss_minutes: i64,
    pub cooldown_on_partial_stop: bool,
    pub analysis_heartbeat_minutes: i64,
    pub position_reconcile_interval_seconds: u64,
    pub trading_hours: TradingHoursSettings,
    pub untracked_balance: UntrackedBalanceSettings,
    pub liquidate_on_stop: bool,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            max_total_investment: dec!(1000000),
            min_trade_amount: dec!(5500),
            max_spread_percent: dec!(0.25),
            min_orderbook_depth_krw: dec!(500000),
            order_type: OrderMode::LimitWithFallback,
            limit_order_wait_seconds: 5,
            fee_pct: dec!(0.0005),
            check_interval_seconds: 30,
            daily_loss_limit_percent: dec!(-5.0),
            cooldown_after_loss_minutes: 360,
            reentry_cooldown_after_stoploss_minutes: 30,
            cooldown_on_partial_stop: false,
            analysis_heartbeat_minutes: 10,
            position_reconcile_interval_seconds: 60,
            trading_hours: TradingHoursSettings::default(),
            untracked_balance: UntrackedBalanceSettings::default(),
            liquidate_on_stop: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryTimeFilter {
    pub enabled: bool,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for EntryTimeFilter {
    fn default() -> Self {
        Self { enabled: false, start_hour: 0, end_hour: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroTrendFilter {
    pub enabled: bool,
    pub ticker: String,
    pub ema_period: usize,
}

impl Default for MacroTrendFilter {
    fn default() -> Self {
        Self { enabled: true, ticker: "KRW-BTC".to_string(), ema_period: 50 }
    }
}

/// Per-symbol strategy assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolStrategyEntry {
    pub strategy: String,
    #[serde(default)]
    pub regimes: Vec<Regime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    /// "regime" selects by the regime table; "fixed" uses the map only.
    pub mode: String,
    pub symbol_strategy_map: HashMap<String, SymbolStrategyEntry>,
    pub regime_reference: String,
    pub regime_check_minutes: i64,
    pub regime_confirm_count: u32,
    pub regime_min_hold_minutes: i64,
    pub signal_candle_minutes: u32,
    pub max_positions: usize,
    pub entry_time_filter: EntryTimeFilter,
    pub btc_filter: MacroTrendFilter,
    pub volatility_tr_atr_max: Decimal,

    // Trend-breakout knobs
    pub sol_breakout_lookback: usize,
    pub sol_stop_atr: Decimal,
    pub sol_trailing_stop_pct: Decimal,
    pub sol_tp1_r: Decimal,
    pub sol_trail_activate_r: Decimal,

    // Momentum-pullback knobs
    pub doge_volume_spike_min: Decimal,
    pub doge_rsi_min: Decimal,
    pub doge_pullback_atr_tolerance: Decimal,
    pub doge_stop_pct: Decimal,
    pub doge_target_r: Decimal,
    pub doge_time_stop_candles: u32,

    // Range-reversion knobs
    pub ada_range_lookback: usize,
    pub ada_rsi_max: Decimal,
    pub ada_entry_lower_pct: Decimal,
    pub ada_stop_pct: Decimal,
    pub ada_take_profit_upper_pct: Decimal,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            mode: "regime".to_string(),
            symbol_strategy_map: HashMap::new(),
            regime_reference: "KRW-BTC".to_string(),
            regime_check_minutes: 20,
            regime_confirm_count: 3,
            regime_min_hold_minutes: 60,
            signal_candle_minutes: 20,
            max_positions: 3,
            entry_time_filter: EntryTimeFilter::default(),
            btc_filter: MacroTrendFilter::default(),
            volatility_tr_atr_max: dec!(3.0),

            sol_breakout_lookback: 20,
            sol_stop_atr: dec!(1.5),
            sol_trailing_stop_pct: dec!(0.02),
            sol_tp1_r: dec!(1.0),
            sol_trail_activate_r: dec!(1.5),

            doge_volume_spike_min: dec!(1.8),
            doge_rsi_min: dec!(50),
            doge_pullback_atr_tolerance: dec!(0.5),
            doge_stop_pct: dec!(0.008),
            doge_target_r: dec!(1.5),
            doge_time_stop_candles: 6,

            ada_range_lookback: 48,
            ada_rsi_max: dec!(35),
            ada_entry_lower_pct: dec!(0.25),
            ada_stop_pct: dec!(0.01),
            ada_take_profit_upper_pct: dec!(0.75),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// Default per-trade equity risk, percent.
    pub risk_per_trade_pct: Decimal,
    /// Per-symbol overrides, percent, keyed by market code.
    pub symbol_risk_pct: HashMap<String, Decimal>,
    /// Max weight of any single symbol as a fraction of equity.
    pub symbol_weight_cap: Decimal,
    pub min_hold_minutes: i64,
    pub max_hold_minutes: i64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: dec!(0.5),
            symbol_risk_pct: HashMap::new(),
            symbol_weight_cap: dec!(0.4),
            min_hold_minutes: 20,
            max_hold_minutes: 360,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoinSelection {
    pub fixed_tickers: Vec<String>,
    pub excluded_coins: Vec<String>,
}

impl Default for CoinSelection {
    fn default() -> Self {
        Self {
            fixed_tickers: vec![
                "KRW-SOL".to_string(),
                "KRW-DOGE".to_string(),
                "KRW-ADA".to_string(),
            ],
            excluded_coins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl ApiCredentials {
    pub fn is_complete(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub position_snapshot_file: String,
    pub trade_history_dir: String,
    pub decision_log_file: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            position_snapshot_file: "positions_snapshot.json".to_string(),
            trade_history_dir: "trade_history".to_string(),
            decision_log_file: "decisions.jsonl".to_string(),
        }
    }
}
