#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::types::{CloseReason, Regime, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Operator-facing alerts. The chat surface subscribes to these; the core
/// only pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AlertType {
    BotStarted,
    BotStopped,
    BuyExecuted {
        symbol: Symbol,
        price: String,
        amount: String,
        invested_krw: String,
        strategy: String,
    },
    SellExecuted {
        symbol: Symbol,
        price: String,
        profit_krw: String,
        profit_rate_pct: String,
        reason: CloseReason,
    },
    RegimeChanged {
        previous: Regime,
        current: Regime,
        confirm_count: u32,
    },
    CooldownActivated {
        reason: String,
        minutes: i64,
    },
    DailySummary {
        date: String,
        trades: u64,
        profit_krw: String,
        profit_pct: String,
    },
    Error {
        component: String,
        message: String,
    },
}

impl AlertType {
    pub fn severity(&self) -> Severity {
        match self {
            AlertType::CooldownActivated { .. } => Severity::Warning,
            AlertType::Error { .. } => Severity::Critical,
            AlertType::SellExecuted { reason, .. } if reason.is_stop_loss() => Severity::Warning,
            _ => Severity::Info,
        }
    }

    pub fn title(&self) -> String {
        match self {
            AlertType::BotStarted => "Bot started".to_string(),
            AlertType::BotStopped => "Bot stopped".to_string(),
            AlertType::BuyExecuted { symbol, .. } => format!("Buy executed: {}", symbol),
            AlertType::SellExecuted { symbol, reason, .. } => {
                format!("Sell executed: {} ({})", symbol, reason)
            }
            AlertType::RegimeChanged { previous, current, .. } => {
                format!("Market regime {} -> {}", previous, current)
            }
            AlertType::CooldownActivated { .. } => "Trading cooldown activated".to_string(),
            AlertType::DailySummary { date, .. } => format!("Daily summary {}", date),
            AlertType::Error { component, .. } => format!("Error in {}", component),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub alert: AlertType,
}

/// In-memory alert fan-out with a bounded backlog. Delivery beyond the
/// process (chat bot) is an external surface reading this queue.
pub struct NotificationManager {
    notifications: Mutex<Vec<Notification>>,
    max_notifications: usize,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            notifications: Mutex::new(Vec::new()),
            max_notifications: 500,
        }
    }

    pub fn notify(&self, alert: AlertType) {
        let notification = Notification {
            timestamp: Utc::now(),
            severity: alert.severity(),
            alert,
        };

        match notification.severity {
            Severity::Critical => error!("{}", notification.alert.title()),
            Severity::Warning => warn!("{}", notification.alert.title()),
            Severity::Info => info!("{}", notification.alert.title()),
        }

        let mut notifications = self.notifications.lock().expect("notifications lock");
        notifications.insert(0, notification);
        if notifications.len() > self.max_notifications {
            notifications.truncate(self.max_notifications);
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        let notifications = self.notifications.lock().expect("notifications lock");
        notifications.iter().take(limit).cloned().collect()
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn buy_executed(
    symbol: Symbol,
    price: Decimal,
    amount: Decimal,
    invested_krw: Decimal,
    strategy: &str,
) -> AlertType {
    AlertType::BuyExecuted {
        symbol,
        price: price.to_string(),
        amount: amount.to_string(),
        invested_krw: invested_krw.to_string(),
        strategy: strategy.to_string(),
    }
}

pub fn sell_executed(
    symbol: Symbol,
    price: Decimal,
    profit_krw: Decimal,
    profit_rate_pct: Decimal,
    reason: CloseReason,
) -> AlertType {
    AlertType::SellExecuted {
        symbol,
        price: price.to_string(),
        profit_krw: profit_krw.to_string(),
        profit_rate_pct: profit_rate_pct.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stop_loss_sells_are_warnings() {
        let alert = sell_executed(
            Symbol::new("KRW-SOL"),
            dec!(95),
            dec!(-5000),
            dec!(-5),
            CloseReason::StructuralStop,
        );
        assert_eq!(alert.severity(), Severity::Warning);

        let win = sell_executed(
            Symbol::new("KRW-SOL"),
            dec!(110),
            dec!(10000),
            dec!(10),
            CloseReason::TakeProfit,
        );
        assert_eq!(win.severity(), Severity::Info);
    }

    #[test]
    fn backlog_is_newest_first_and_bounded() {
        let manager = NotificationManager::new();
        manager.notify(AlertType::BotStarted);
        manager.notify(AlertType::RegimeChanged {
            previous: Regime::Range,
            current: Regime::Bull,
            confirm_count: 3,
        });
        let recent = manager.recent(10);
        assert_eq!(recent.len(), 2);
        assert!(matches!(recent[0].alert, AlertType::RegimeChanged { .. }));
    }
}
