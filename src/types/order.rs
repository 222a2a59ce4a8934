#![allow(dead_code)]
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exchange-side lifecycle state of an order, as reported by the order
/// status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Resting, no fill yet.
    Wait,
    /// Stop order waiting for trigger.
    Watch,
    /// Fully filled.
    Done,
    /// Cancelled (possibly after partial fills).
    Cancel,
}

impl OrderState {
    pub fn from_exchange(s: &str) -> Option<Self> {
        match s {
            "wait" => Some(OrderState::Wait),
            "watch" => Some(OrderState::Watch),
            "done" => Some(OrderState::Done),
            "cancel" => Some(OrderState::Cancel),
            _ => None,
        }
    }
}

/// A single execution within an order, as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTrade {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Snapshot of an order from the status endpoint.
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub uuid: String,
    pub state: OrderState,
    pub executed_volume: Decimal,
    pub remaining_volume: Decimal,
    /// Volume-weighted fill price when the exchange reports one.
    pub avg_price: Option<Decimal>,
    pub paid_fee: Decimal,
    pub trades: Vec<OrderTrade>,
}

impl OrderStatus {
    pub fn is_filled(&self) -> bool {
        self.state == OrderState::Done
            || (self.remaining_volume.is_zero() && self.executed_volume > Decimal::ZERO)
    }

    /// Gross KRW executed, preferring per-trade sums over the reported
    /// average price.
    pub fn executed_funds(&self, fallback_price: Decimal) -> Decimal {
        let from_trades: Decimal = self.trades.iter().map(|t| t.price * t.volume).sum();
        if from_trades > Decimal::ZERO {
            return from_trades;
        }
        match self.avg_price {
            Some(p) if p > Decimal::ZERO => p * self.executed_volume,
            _ => fallback_price * self.executed_volume,
        }
    }
}

/// Outcome of a completed buy/sell protocol run. Fees may be estimated
/// when the exchange omits `paid_fee`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub uuid: Option<String>,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub paid_fee: Decimal,
    pub fee_estimated: bool,
    /// Net KRW moved: spend for buys, proceeds after fees for sells.
    pub net_krw: Decimal,
    /// Tradable balance left on the exchange after settlement (sell side).
    pub remaining_qty: Decimal,
    pub completed_at: DateTime<Utc>,
}

impl OrderResult {
    /// Combine a limit fill with its market top-up: volume-weighted price,
    /// summed fees and funds.
    pub fn combine(&self, other: &OrderResult) -> OrderResult {
        let total_qty = self.filled_qty + other.filled_qty;
        let avg_price = if total_qty > Decimal::ZERO {
            (self.avg_price * self.filled_qty + other.avg_price * other.filled_qty) / total_qty
        } else {
            self.avg_price
        };
        OrderResult {
            uuid: self.uuid.clone().or_else(|| other.uuid.clone()),
            filled_qty: total_qty,
            avg_price,
            paid_fee: self.paid_fee + other.paid_fee,
            fee_estimated: self.fee_estimated || other.fee_estimated,
            net_krw: self.net_krw + other.net_krw,
            remaining_qty: other.remaining_qty,
            completed_at: other.completed_at.max(self.completed_at),
        }
    }
}
