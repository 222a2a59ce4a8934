pub mod orderbook;
pub mod upbit;

pub use orderbook::*;
pub use upbit::*;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Candle, OrderStatus, Symbol};

/// Errors from the exchange surface. Transient kinds are retried by
/// callers; nothing here ever aborts the trading loop.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited,
    #[error("api error: {0}")]
    Api(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_) | ExchangeError::Timeout(_) | ExchangeError::RateLimited
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(Duration::from_secs(10))
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// One exchange asset balance row.
#[derive(Debug, Clone)]
pub struct Balance {
    pub currency: String,
    pub balance: Decimal,
    pub locked: Decimal,
    pub avg_buy_price: Decimal,
    pub unit_currency: String,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.balance + self.locked
    }

    /// Amount that can be placed in a new order right now.
    pub fn tradable(&self) -> Decimal {
        self.balance
    }
}

/// Typed operations the trading core requires from the exchange. The REST
/// client implements this; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn current_price(&self, symbol: &Symbol) -> ExchangeResult<Decimal>;

    /// Top-5 levels on both sides.
    async fn order_book(&self, symbol: &Symbol) -> ExchangeResult<OrderBook>;

    /// Minute candles, newest last, at the given unit. `to` bounds the page
    /// exclusively; `None` means "up to now".
    async fn minute_candles(
        &self,
        symbol: &Symbol,
        unit: u32,
        count: u32,
        to: Option<chrono::DateTime<chrono::Utc>>,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn place_limit_buy(
        &self,
        symbol: &Symbol,
        price: Decimal,
        quantity: Decimal,
    ) -> ExchangeResult<String>;

    async fn place_limit_sell(
        &self,
        symbol: &Symbol,
        price: Decimal,
        quantity: Decimal,
    ) -> ExchangeResult<String>;

    /// Market buy by KRW notional (price order).
    async fn place_market_buy(&self, symbol: &Symbol, notional: Decimal)
        -> ExchangeResult<String>;

    /// Market sell by quantity.
    async fn place_market_sell(
        &self,
        symbol: &Symbol,
        quantity: Decimal,
    ) -> ExchangeResult<String>;

    async fn order_status(&self, uuid: &str) -> ExchangeResult<OrderStatus>;

    /// Returns true only when the exchange acknowledged the cancel.
    async fn cancel_order(&self, uuid: &str) -> ExchangeResult<bool>;

    async fn balance(&self, currency: &str) -> ExchangeResult<Decimal>;

    async fn balances(&self) -> ExchangeResult<Vec<Balance>>;

    async fn avg_buy_price(&self, currency: &str) -> ExchangeResult<Decimal>;
}

/// Retries transient failures with a short fixed backoff: up to 5
/// attempts spaced ~0.7 s apart.
pub async fn with_retry<T, F, Fut>(label: &str, mut op: F) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
{
    const ATTEMPTS: usize = 5;
    const SPACING: Duration = Duration::from_millis(700);

    let mut last_err = None;
    for attempt in 1..=ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < ATTEMPTS => {
                tracing::debug!("{} attempt {}/{} failed: {}", label, attempt, ATTEMPTS, err);
                tokio::time::sleep(SPACING).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| ExchangeError::Transport("retries exhausted".to_string())))
}
