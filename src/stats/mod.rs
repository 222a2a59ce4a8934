#![allow(dead_code)]
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::types::{CloseReason, Symbol};

/// One closed (or partially closed) trade, appended to the per-day
/// history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub amount: Decimal,
    pub buy_fee_krw: Decimal,
    pub sell_fee_krw: Decimal,
    pub gross_pnl_krw: Decimal,
    pub net_pnl_krw: Decimal,
    pub reason: CloseReason,
    pub strategy: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolStats {
    pub trades: u64,
    pub wins: u64,
    pub losses: u64,
    pub profit_krw: Decimal,
}

/// Process-lifetime session bookkeeping: balances, fees, drawdown and the
/// daily P&L window behind the circuit breaker. Owned by the trading loop.
pub struct SessionStats {
    pub initial_cash: Decimal,
    pub initial_total_value: Decimal,
    pub current_cash: Decimal,
    pub current_total_value: Decimal,
    pub peak_value: Decimal,
    pub cumulative_fees: Decimal,
    pub total_trades: u64,
    pub wins: u64,
    pub losses: u64,
    symbol_stats: HashMap<Symbol, SymbolStats>,

    daily_date: NaiveDate,
    pub daily_start_balance: Decimal,
    daily_profit_krw: Decimal,
    daily_trades: u64,

    history_dir: PathBuf,
}

impl SessionStats {
    pub fn new(history_dir: impl Into<PathBuf>) -> Self {
        Self {
            initial_cash: Decimal::ZERO,
            initial_total_value: Decimal::ZERO,
            current_cash: Decimal::ZERO,
            current_total_value: Decimal::ZERO,
            peak_value: Decimal::ZERO,
            cumulative_fees: Decimal::ZERO,
            total_trades: 0,
            wins: 0,
            losses: 0,
            symbol_stats: HashMap::new(),
            daily_date: Utc::now().date_naive(),
            daily_start_balance: Decimal::ZERO,
            daily_profit_krw: Decimal::ZERO,
            daily_trades: 0,
            history_dir: history_dir.into(),
        }
    }

    pub fn start(&mut self, initial_cash: Decimal, initial_total_value: Decimal) {
        self.initial_cash = initial_cash;
        self.initial_total_value = initial_total_value;
        self.current_cash = initial_cash;
        self.current_total_value = initial_total_value;
        self.peak_value = initial_total_value;
        self.daily_start_balance = initial_total_value;
        info!(
            "session started: cash {} KRW, total value {} KRW",
            initial_cash, initial_total_value
        );
    }

    fn rollover_if_new_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.daily_date {
            self.daily_date = today;
            self.daily_start_balance = self.current_total_value;
            self.daily_profit_krw = Decimal::ZERO;
            self.daily_trades = 0;
            info!("daily stats rolled over to {}", today);
        }
    }

    pub fn update_balance(&mut self, cash: Decimal, total_value: Decimal) {
        self.current_cash = cash;
        self.current_total_value = total_value;
        if total_value > self.peak_value {
            self.peak_value = total_value;
        }
    }

    pub fn drawdown_pct(&self) -> Decimal {
        if self.peak_value.is_zero() {
            return Decimal::ZERO;
        }
        (self.peak_value - self.current_total_value) / self.peak_value * Decimal::ONE_HUNDRED
    }

    pub fn add_fee(&mut self, fee: Decimal) {
        self.cumulative_fees += fee;
    }

    /// Records a close, updates win/loss tallies and appends the per-day
    /// history file.
    pub fn record_close(&mut self, record: TradeRecord, now: DateTime<Utc>) {
        self.rollover_if_new_day(now);
        self.total_trades += 1;
        self.daily_trades += 1;
        self.daily_profit_krw += record.net_pnl_krw;

        let entry = self.symbol_stats.entry(record.symbol.clone()).or_default();
        entry.trades += 1;
        entry.profit_krw += record.net_pnl_krw;
        if record.net_pnl_krw >= Decimal::ZERO {
            self.wins += 1;
            entry.wins += 1;
        } else {
            self.losses += 1;
            entry.losses += 1;
        }

        self.append_history(&record);
    }

    /// One JSON array per calendar day.
    fn append_history(&self, record: &TradeRecord) {
        if let Err(e) = self.try_append_history(record) {
            warn!("trade history write failed: {}", e);
        }
    }

    fn try_append_history(&self, record: &TradeRecord) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.history_dir)?;
        let file = self
            .history_dir
            .join(format!("trades_{}.json", record.timestamp.format("%Y-%m-%d")));
        let mut records: Vec<TradeRecord> = match std::fs::read_to_string(&file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        records.push(record.clone());
        std::fs::write(&file, serde_json::to_string_pretty(&records)?)?;
        Ok(())
    }

    /// Realized profit and trade count for the current day window.
    pub fn daily_profit(&mut self, now: DateTime<Utc>) -> (Decimal, u64) {
        self.rollover_if_new_day(now);
        (self.daily_profit_krw, self.daily_trades)
    }

    /// Daily P&L as a percent of the day's starting balance; feeds the
    /// circuit breaker.
    pub fn daily_pnl_pct(&mut self, now: DateTime<Utc>) -> Decimal {
        let (profit, _) = self.daily_profit(now);
        if self.daily_start_balance.is_zero() {
            return Decimal::ZERO;
        }
        profit / self.daily_start_balance * Decimal::ONE_HUNDRED
    }

    pub fn symbol_stats(&self) -> &HashMap<Symbol, SymbolStats> {
        &self.symbol_stats
    }

    pub fn win_rate_pct(&self) -> Decimal {
        if self.total_trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.total_trades) * Decimal::ONE_HUNDRED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn record(symbol: &str, net: Decimal, ts: DateTime<Utc>) -> TradeRecord {
        TradeRecord {
            timestamp: ts,
            symbol: Symbol::new(symbol),
            buy_price: dec!(100),
            sell_price: dec!(100) + net / dec!(10),
            amount: dec!(10),
            buy_fee_krw: dec!(5),
            sell_fee_krw: dec!(5),
            gross_pnl_krw: net + dec!(10),
            net_pnl_krw: net,
            reason: CloseReason::TakeProfit,
            strategy: "momentum_pullback".to_string(),
        }
    }

    #[test]
    fn daily_pnl_accumulates_and_rolls_over() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = SessionStats::new(dir.path());
        stats.start(dec!(1000000), dec!(1000000));

        let now = Utc::now();
        stats.record_close(record("KRW-SOL", dec!(-30000), now), now);
        stats.record_close(record("KRW-ADA", dec!(-21000), now), now);
        assert_eq!(stats.daily_profit(now), (dec!(-51000), 2));
        assert_eq!(stats.daily_pnl_pct(now), dec!(-5.1));

        // Next day: window resets against the new start balance
        let tomorrow = now + Duration::days(1);
        let (profit, trades) = stats.daily_profit(tomorrow);
        assert_eq!(profit, Decimal::ZERO);
        assert_eq!(trades, 0);
    }

    #[test]
    fn win_loss_tallies_per_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = SessionStats::new(dir.path());
        stats.start(dec!(1000000), dec!(1000000));
        let now = Utc::now();

        stats.record_close(record("KRW-SOL", dec!(5000), now), now);
        stats.record_close(record("KRW-SOL", dec!(-2000), now), now);
        stats.record_close(record("KRW-ADA", dec!(1000), now), now);

        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.wins, 2);
        assert_eq!(stats.losses, 1);
        let sol = &stats.symbol_stats()[&Symbol::new("KRW-SOL")];
        assert_eq!(sol.trades, 2);
        assert_eq!(sol.profit_krw, dec!(3000));
    }

    #[test]
    fn history_file_is_a_daily_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = SessionStats::new(dir.path());
        stats.start(dec!(1000000), dec!(1000000));
        let now = Utc::now();

        stats.record_close(record("KRW-SOL", dec!(100), now), now);
        stats.record_close(record("KRW-ADA", dec!(200), now), now);

        let file = dir
            .path()
            .join(format!("trades_{}.json", now.format("%Y-%m-%d")));
        let content = std::fs::read_to_string(file).unwrap();
        let records: Vec<TradeRecord> = serde_json::from_str(&content).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].symbol, Symbol::new("KRW-ADA"));
    }

    #[test]
    fn drawdown_tracks_peak() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = SessionStats::new(dir.path());
        stats.start(dec!(1000000), dec!(1000000));
        stats.update_balance(dec!(500000), dec!(1200000));
        stats.update_balance(dec!(500000), dec!(1080000));
        assert_eq!(stats.peak_value, dec!(1200000));
        assert_eq!(stats.drawdown_pct(), dec!(10));
    }
}
