use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{OrderMode, TradingSettings};
use crate::events::{DecisionKind, DecisionLog};
use crate::exchange::{check_book_safety, with_retry, BookRejection, ExchangeApi, OrderBook};
use crate::types::{OrderResult, OrderState, OrderStatus, Position, Side, Symbol};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CANCEL_RETRIES: u32 = 3;
const CANCEL_RETRY_SPACING: Duration = Duration::from_millis(300);
const SETTLE_POLLS: u32 = 6;

/// Where a resting limit order stood when polling ended.
#[derive(Debug)]
enum PollOutcome {
    Filled(OrderStatus),
    /// Timed out with fills on the book.
    Partial(OrderStatus),
    /// Timed out untouched.
    Unfilled,
    /// A poll failed mid-flight; the order's true state is unknown.
    Unknown,
    /// The exchange reports the order cancelled already.
    CancelledExternally(OrderStatus),
}

/// Result of the cancel-with-confirmation protocol.
#[derive(Debug)]
enum CancelOutcome {
    Confirmed,
    /// The cancel raced a complete fill.
    AlreadyFilled(OrderStatus),
    Failed,
}

/// Executes buys and sells with a limit-first protocol. The market
/// fallback is only ever placed after a positively confirmed cancel of
/// the limit order; any ambiguity fails closed.
pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    decisions: Arc<DecisionLog>,
    order_mode: OrderMode,
    limit_wait: Duration,
    fee_pct: Decimal,
    min_trade_amount: Decimal,
    max_spread_pct: Decimal,
    min_depth_krw: Decimal,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        decisions: Arc<DecisionLog>,
        trading: &TradingSettings,
    ) -> Self {
        Self {
            exchange,
            decisions,
            order_mode: trading.order_type,
            limit_wait: Duration::from_secs(trading.limit_order_wait_seconds),
            fee_pct: trading.fee_pct,
            min_trade_amount: trading.min_trade_amount,
            max_spread_pct: trading.max_spread_percent,
            min_depth_krw: trading.min_orderbook_depth_krw,
        }
    }

    /// Fetches the book and applies the spread/depth gates. No order is
    /// placed when this fails.
    pub async fn pretrade_book(&self, symbol: &Symbol) -> Result<OrderBook, BookRejection> {
        let book = with_retry("order_book", || self.exchange.order_book(symbol))
            .await
            .map_err(|_| BookRejection::Empty)?;
        check_book_safety(&book, self.max_spread_pct, self.min_depth_krw)?;
        Ok(book)
    }

    /// Buys `notional` KRW of `symbol`. Returns `None` when nothing was
    /// filled; a partial fill is a success for the filled part.
    pub async fn execute_buy(&self, symbol: &Symbol, notional: Decimal) -> Option<OrderResult> {
        let book = match self.pretrade_book(symbol).await {
            Ok(book) => book,
            Err(rejection) => {
                warn!("{} buy blocked at the book gate: {:?}", symbol, rejection);
                return None;
            }
        };
        let bid_price = book.best_bid()?;
        if bid_price <= Decimal::ZERO {
            return None;
        }

        if self.order_mode == OrderMode::Market {
            return self.market_buy(symbol, notional, bid_price).await;
        }

        let quantity =
            (notional / bid_price).round_dp_with_strategy(8, RoundingStrategy::ToZero);
        if quantity <= Decimal::ZERO {
            return None;
        }

        let uuid = match self.exchange.place_limit_buy(symbol, bid_price, quantity).await {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!("{} limit buy placement failed: {}", symbol, e);
                return None;
            }
        };
        debug!("{} limit buy {} @ {} placed ({})", symbol, quantity, bid_price, uuid);

        match self.poll_until_deadline(&uuid).await {
            PollOutcome::Filled(status) => {
                Some(self.result_from_status(&status, bid_price, Side::Buy))
            }
            PollOutcome::CancelledExternally(status) => {
                if status.executed_volume > Decimal::ZERO {
                    Some(self.result_from_status(&status, bid_price, Side::Buy))
                } else {
                    None
                }
            }
            PollOutcome::Partial(status) => {
                self.buy_partial_after_timeout(symbol, &uuid, status, bid_price, notional)
                    .await
            }
            PollOutcome::Unfilled => {
                self.buy_unfilled_after_timeout(symbol, &uuid, bid_price, notional)
                    .await
            }
            PollOutcome::Unknown => self.abort_on_unknown(symbol, &uuid, bid_price, Side::Buy).await,
        }
    }

    /// Partial fill at timeout: cancel the remainder, and only a confirmed
    /// cancel may be topped up at market.
    async fn buy_partial_after_timeout(
        &self,
        symbol: &Symbol,
        uuid: &str,
        last_status: OrderStatus,
        bid_price: Decimal,
        notional: Decimal,
    ) -> Option<OrderResult> {
        warn!(
            "{} limit buy partial: {} filled, cancelling remainder",
            symbol, last_status.executed_volume
        );
        match self.cancel_with_confirmation(uuid).await {
            CancelOutcome::Confirmed => {
                // Late fills may have landed before the cancel took hold.
                let status = self
                    .exchange
                    .order_status(uuid)
                    .await
                    .unwrap_or(last_status);
                let partial = self.result_from_status(&status, bid_price, Side::Buy);
                let remaining = notional - status.executed_funds(bid_price);
                if remaining >= self.min_trade_amount {
                    info!("{} topping up {} KRW at market", symbol, remaining);
                    match self.market_buy(symbol, remaining, bid_price).await {
                        Some(market) => Some(partial.combine(&market)),
                        None => Some(partial),
                    }
                } else {
                    Some(partial)
                }
            }
            CancelOutcome::AlreadyFilled(status) => {
                Some(self.result_from_status(&status, bid_price, Side::Buy))
            }
            CancelOutcome::Failed => {
                // The partial fill is real; report it and stop. No market
                // order on top of an unconfirmed book state.
                self.record_cancel_failed(symbol, uuid);
                Some(self.result_from_status(&last_status, bid_price, Side::Buy))
            }
        }
    }

    /// Unfilled at timeout: market fallback strictly behind a confirmed
    /// cancel.
    async fn buy_unfilled_after_timeout(
        &self,
        symbol: &Symbol,
        uuid: &str,
        bid_price: Decimal,
        notional: Decimal,
    ) -> Option<OrderResult> {
        debug!("{} limit buy unfilled, cancelling before fallback", symbol);
        match self.cancel_with_confirmation(uuid).await {
            CancelOutcome::Confirmed => self.market_buy(symbol, notional, bid_price).await,
            CancelOutcome::AlreadyFilled(status) => {
                Some(self.result_from_status(&status, bid_price, Side::Buy))
            }
            CancelOutcome::Failed => {
                self.record_cancel_failed(symbol, uuid);
                self.record_fallback_aborted(symbol, uuid, "cancel_unconfirmed");
                None
            }
        }
    }

    /// Sells `ratio` of the position, sized off the live tradable balance.
    pub async fn execute_sell(
        &self,
        symbol: &Symbol,
        position: &Position,
        ratio: Decimal,
    ) -> Option<OrderResult> {
        let tradable = with_retry("balance", || self.exchange.balance(symbol.base_asset()))
            .await
            .ok()?;
        if tradable <= Decimal::ZERO {
            warn!("{} sell skipped: no tradable balance", symbol);
            return None;
        }

        // Drift beyond 5% means our book is stale; trade what is there.
        if position.amount > Decimal::ZERO {
            let drift = (tradable - position.amount).abs() / position.amount;
            if drift > dec!(0.05) {
                warn!(
                    "{} amount mismatch: tracked {} vs exchange {} ({:.1}%)",
                    symbol,
                    position.amount,
                    tradable,
                    drift * Decimal::ONE_HUNDRED
                );
            }
        }

        let full_liquidation = ratio >= dec!(0.999);
        let sell_amount = if full_liquidation {
            tradable.round_dp_with_strategy(8, RoundingStrategy::ToZero)
        } else {
            (tradable * ratio).round_dp_with_strategy(8, RoundingStrategy::ToZero)
        };
        if sell_amount <= Decimal::ZERO {
            return None;
        }

        let book = match self.pretrade_book(symbol).await {
            Ok(book) => book,
            Err(rejection) => {
                warn!("{} sell blocked at the book gate: {:?}", symbol, rejection);
                return None;
            }
        };
        let ask_price = book.best_ask()?;
        if sell_amount * ask_price < self.min_trade_amount {
            warn!(
                "{} sell value {} below the minimum order amount",
                symbol,
                sell_amount * ask_price
            );
            return None;
        }

        if self.order_mode == OrderMode::Market {
            return self.market_sell(symbol, sell_amount, ask_price).await;
        }

        let uuid = match self
            .exchange
            .place_limit_sell(symbol, ask_price, sell_amount)
            .await
        {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!("{} limit sell placement failed: {}", symbol, e);
                return None;
            }
        };
        debug!("{} limit sell {} @ {} placed ({})", symbol, sell_amount, ask_price, uuid);

        match self.poll_until_deadline(&uuid).await {
            PollOutcome::Filled(status) => {
                let mut result = self.result_from_status(&status, ask_price, Side::Sell);
                result.remaining_qty = self.settled_balance(symbol).await;
                Some(result)
            }
            PollOutcome::CancelledExternally(status) => {
                if status.executed_volume > Decimal::ZERO {
                    let mut result = self.result_from_status(&status, ask_price, Side::Sell);
                    result.remaining_qty = self.settled_balance(symbol).await;
                    Some(result)
                } else {
                    None
                }
            }
            PollOutcome::Partial(status) => {
                self.sell_partial_after_timeout(symbol, &uuid, status, ask_price)
                    .await
            }
            PollOutcome::Unfilled => {
                self.sell_unfilled_after_timeout(symbol, &uuid, sell_amount, ask_price)
                    .await
            }
            PollOutcome::Unknown => {
                self.abort_on_unknown(symbol, &uuid, ask_price, Side::Sell).await
            }
        }
    }

    async fn sell_partial_after_timeout(
        &self,
        symbol: &Symbol,
        uuid: &str,
        last_status: OrderStatus,
        ask_price: Decimal,
    ) -> Option<OrderResult> {
        warn!(
            "{} limit sell partial: {} filled, cancelling remainder",
            symbol, last_status.executed_volume
        );
        match self.cancel_with_confirmation(uuid).await {
            CancelOutcome::Confirmed => {
                let status = self
                    .exchange
                    .order_status(uuid)
                    .await
                    .unwrap_or(last_status);
                let mut partial = self.result_from_status(&status, ask_price, Side::Sell);
                let remaining = self.settled_balance(symbol).await;
                partial.remaining_qty = remaining;
                if remaining > Decimal::ZERO && remaining * ask_price >= self.min_trade_amount {
                    info!("{} selling remaining {} at market", symbol, remaining);
                    match self.market_sell(symbol, remaining, ask_price).await {
                        Some(market) => Some(partial.combine(&market)),
                        None => Some(partial),
                    }
                } else {
                    Some(partial)
                }
            }
            CancelOutcome::AlreadyFilled(status) => {
                let mut result = self.result_from_status(&status, ask_price, Side::Sell);
                result.remaining_qty = self.settled_balance(symbol).await;
                Some(result)
            }
            CancelOutcome::Failed => {
                self.record_cancel_failed(symbol, uuid);
                let mut partial = self.result_from_status(&last_status, ask_price, Side::Sell);
                partial.remaining_qty = self.settled_balance(symbol).await;
                Some(partial)
            }
        }
    }

    async fn sell_unfilled_after_timeout(
        &self,
        symbol: &Symbol,
        uuid: &str,
        sell_amount: Decimal,
        ask_price: Decimal,
    ) -> Option<OrderResult> {
        debug!("{} limit sell unfilled, cancelling before fallback", symbol);
        match self.cancel_with_confirmation(uuid).await {
            CancelOutcome::Confirmed => self.market_sell(symbol, sell_amount, ask_price).await,
            CancelOutcome::AlreadyFilled(status) => {
                let mut result = self.result_from_status(&status, ask_price, Side::Sell);
                result.remaining_qty = self.settled_balance(symbol).await;
                Some(result)
            }
            CancelOutcome::Failed => {
                self.record_cancel_failed(symbol, uuid);
                self.record_fallback_aborted(symbol, uuid, "cancel_unconfirmed");
                None
            }
        }
    }

    /// Unknown order state: never trade on top of it. A confirmed cancel
    /// still aborts the fallback; fills discovered on the way out are
    /// honored.
    async fn abort_on_unknown(
        &self,
        symbol: &Symbol,
        uuid: &str,
        reference_price: Decimal,
        side: Side,
    ) -> Option<OrderResult> {
        warn!("{} {} order state unknown mid-poll, failing closed", symbol, side);
        match self.cancel_with_confirmation(uuid).await {
            CancelOutcome::Confirmed => {
                self.record_fallback_aborted(symbol, uuid, "unknown_status");
                None
            }
            CancelOutcome::AlreadyFilled(status) => {
                Some(self.result_from_status(&status, reference_price, side))
            }
            CancelOutcome::Failed => {
                self.record_cancel_failed(symbol, uuid);
                self.record_fallback_aborted(symbol, uuid, "unknown_status_cancel_failed");
                None
            }
        }
    }

    /// Polls until the wait window elapses. The first failed poll turns
    /// the order Unknown; there is no retry inside the window.
    async fn poll_until_deadline(&self, uuid: &str) -> PollOutcome {
        let deadline = Instant::now() + self.limit_wait;
        let mut last_status: Option<OrderStatus> = None;

        loop {
            match self.exchange.order_status(uuid).await {
                Ok(status) => {
                    if status.is_filled() {
                        return PollOutcome::Filled(status);
                    }
                    if status.state == OrderState::Cancel {
                        return PollOutcome::CancelledExternally(status);
                    }
                    last_status = Some(status);
                }
                Err(e) => {
                    warn!("order {} poll failed: {}", uuid, e);
                    return PollOutcome::Unknown;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        match last_status {
            Some(status) if status.executed_volume > Decimal::ZERO => {
                PollOutcome::Partial(status)
            }
            _ => PollOutcome::Unfilled,
        }
    }

    /// A cancel counts as confirmed only on an exchange acknowledgment or
    /// a directly observed `cancel` state.
    async fn cancel_with_confirmation(&self, uuid: &str) -> CancelOutcome {
        for attempt in 1..=CANCEL_RETRIES {
            match self.exchange.cancel_order(uuid).await {
                Ok(true) => {
                    debug!("order {} cancel confirmed (attempt {})", uuid, attempt);
                    return CancelOutcome::Confirmed;
                }
                Ok(false) => {}
                Err(e) => debug!("order {} cancel attempt {} failed: {}", uuid, attempt, e),
            }
            // The cancel may have raced a fill; look at the order itself.
            if let Ok(status) = self.exchange.order_status(uuid).await {
                match status.state {
                    OrderState::Cancel => return CancelOutcome::Confirmed,
                    OrderState::Done => return CancelOutcome::AlreadyFilled(status),
                    _ => {}
                }
            }
            if attempt < CANCEL_RETRIES {
                tokio::time::sleep(CANCEL_RETRY_SPACING).await;
            }
        }
        CancelOutcome::Failed
    }

    async fn market_buy(
        &self,
        symbol: &Symbol,
        notional: Decimal,
        reference_price: Decimal,
    ) -> Option<OrderResult> {
        let uuid = match self.exchange.place_market_buy(symbol, notional).await {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!("{} market buy failed: {}", symbol, e);
                return None;
            }
        };
        let status = self.settle(&uuid).await?;
        if status.executed_volume <= Decimal::ZERO {
            warn!("{} market buy reported no fills", symbol);
            return None;
        }
        Some(self.result_from_status(&status, reference_price, Side::Buy))
    }

    async fn market_sell(
        &self,
        symbol: &Symbol,
        quantity: Decimal,
        reference_price: Decimal,
    ) -> Option<OrderResult> {
        let uuid = match self.exchange.place_market_sell(symbol, quantity).await {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!("{} market sell failed: {}", symbol, e);
                return None;
            }
        };
        let status = self.settle(&uuid).await?;
        if status.executed_volume <= Decimal::ZERO {
            warn!("{} market sell reported no fills", symbol);
            return None;
        }
        let mut result = self.result_from_status(&status, reference_price, Side::Sell);
        result.remaining_qty = self.settled_balance(symbol).await;
        Some(result)
    }

    /// Brief settlement polling for market orders.
    async fn settle(&self, uuid: &str) -> Option<OrderStatus> {
        let mut last = None;
        for _ in 0..SETTLE_POLLS {
            match self.exchange.order_status(uuid).await {
                Ok(status) => {
                    if status.is_filled() {
                        return Some(status);
                    }
                    last = Some(status);
                }
                Err(e) => debug!("market order {} settle poll failed: {}", uuid, e),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        last
    }

    async fn settled_balance(&self, symbol: &Symbol) -> Decimal {
        self.exchange
            .balance(symbol.base_asset())
            .await
            .unwrap_or(Decimal::ZERO)
    }

    fn result_from_status(
        &self,
        status: &OrderStatus,
        fallback_price: Decimal,
        side: Side,
    ) -> OrderResult {
        let gross = status.executed_funds(fallback_price);
        let avg_price = match status.avg_price {
            Some(p) if p > Decimal::ZERO => p,
            _ => {
                if status.executed_volume > Decimal::ZERO {
                    warn!(
                        "order {} missing average price, using reference {}",
                        status.uuid, fallback_price
                    );
                }
                fallback_price
            }
        };
        let (paid_fee, fee_estimated) = if status.paid_fee > Decimal::ZERO {
            (status.paid_fee, false)
        } else {
            (gross * self.fee_pct, true)
        };
        let net_krw = match side {
            Side::Buy => gross,
            Side::Sell => gross - paid_fee,
        };

        OrderResult {
            uuid: Some(status.uuid.clone()),
            filled_qty: status.executed_volume,
            avg_price,
            paid_fee,
            fee_estimated,
            net_krw,
            remaining_qty: Decimal::ZERO,
            completed_at: Utc::now(),
        }
    }

    fn record_cancel_failed(&self, symbol: &Symbol, uuid: &str) {
        warn!("{} cancel of {} unconfirmed after retries", symbol, uuid);
        self.decisions.record(
            DecisionKind::CancelFailedUnknownState,
            json!({ "symbol": symbol, "uuid": uuid }),
        );
    }

    fn record_fallback_aborted(&self, symbol: &Symbol, uuid: &str, reason: &str) {
        warn!("{} market fallback aborted: {}", symbol, reason);
        self.decisions.record(
            DecisionKind::FallbackAborted,
            json!({ "symbol": symbol, "uuid": uuid, "reason": reason }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeError, MockExchangeApi};
    use crate::types::{BuyMeta, OrderBookUnit, OrderTrade};
    use mockall::Sequence;

    fn trading_settings() -> TradingSettings {
        let mut t = TradingSettings::default();
        t.min_trade_amount = dec!(3000);
        t.limit_order_wait_seconds = 1;
        t
    }

    fn healthy_book() -> OrderBook {
        OrderBook {
            symbol: Symbol::new("KRW-SOL"),
            units: (0..5)
                .map(|i| OrderBookUnit {
                    bid_price: dec!(1000) - Decimal::from(i),
                    bid_size: dec!(1000),
                    ask_price: dec!(1001) + Decimal::from(i),
                    ask_size: dec!(1000),
                })
                .collect(),
        }
    }

    fn status(
        uuid: &str,
        state: OrderState,
        executed: Decimal,
        remaining: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> OrderStatus {
        OrderStatus {
            uuid: uuid.to_string(),
            state,
            executed_volume: executed,
            remaining_volume: remaining,
            avg_price: (executed > Decimal::ZERO).then_some(price),
            paid_fee: fee,
            trades: if executed > Decimal::ZERO {
                vec![OrderTrade { price, volume: executed }]
            } else {
                vec![]
            },
        }
    }

    fn executor(mock: MockExchangeApi) -> (OrderExecutor, Arc<DecisionLog>) {
        let decisions = Arc::new(DecisionLog::in_memory());
        let executor = OrderExecutor::new(
            Arc::new(mock),
            Arc::clone(&decisions),
            &trading_settings(),
        );
        (executor, decisions)
    }

    #[tokio::test(start_paused = true)]
    async fn buy_fills_on_first_poll() {
        let mut mock = MockExchangeApi::new();
        mock.expect_order_book().returning(|_| Ok(healthy_book()));
        mock.expect_place_limit_buy()
            .returning(|_, _, _| Ok("u1".to_string()));
        mock.expect_order_status().returning(|_| {
            Ok(status("u1", OrderState::Done, dec!(10), dec!(0), dec!(1000), dec!(5)))
        });

        let (executor, decisions) = executor(mock);
        let result = executor
            .execute_buy(&Symbol::new("KRW-SOL"), dec!(10000))
            .await
            .unwrap();
        assert_eq!(result.filled_qty, dec!(10));
        assert_eq!(result.avg_price, dec!(1000));
        assert_eq!(result.paid_fee, dec!(5));
        assert!(!result.fee_estimated);
        assert_eq!(decisions.count_of(DecisionKind::FallbackAborted), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fill_with_confirmed_cancel_tops_up_at_market() {
        // 10,000 KRW intended; 6,000 fills on the limit; cancel confirms;
        // the 4,000 shortfall goes to market and the fills combine.
        let mut mock = MockExchangeApi::new();
        mock.expect_order_book().returning(|_| Ok(healthy_book()));
        mock.expect_place_limit_buy()
            .returning(|_, _, _| Ok("limit-1".to_string()));

        let mut seq = Sequence::new();
        // Polls inside the wait window: resting with a partial fill.
        mock.expect_order_status()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("limit-1", OrderState::Wait, dec!(6), dec!(4), dec!(1000), dec!(3)))
            });
        mock.expect_cancel_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        // Refresh after the confirmed cancel.
        mock.expect_order_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("limit-1", OrderState::Cancel, dec!(6), dec!(4), dec!(1000), dec!(3)))
            });
        mock.expect_place_market_buy()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, notional| *notional == dec!(4000))
            .returning(|_, _| Ok("market-1".to_string()));
        mock.expect_order_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("market-1", OrderState::Done, dec!(4), dec!(0), dec!(1002), dec!(2)))
            });

        let (executor, decisions) = executor(mock);
        let result = executor
            .execute_buy(&Symbol::new("KRW-SOL"), dec!(10000))
            .await
            .unwrap();

        assert_eq!(result.filled_qty, dec!(10));
        // VWAP of 6 @ 1000 and 4 @ 1002
        assert_eq!(result.avg_price, dec!(1000.8));
        assert_eq!(result.paid_fee, dec!(5));
        assert_eq!(decisions.count_of(DecisionKind::FallbackAborted), 0);
        assert_eq!(decisions.count_of(DecisionKind::CancelFailedUnknownState), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fill_with_failed_cancel_returns_partial_only() {
        let mut mock = MockExchangeApi::new();
        mock.expect_order_book().returning(|_| Ok(healthy_book()));
        mock.expect_place_limit_buy()
            .returning(|_, _, _| Ok("limit-2".to_string()));
        // Every status read shows the same live partial order.
        mock.expect_order_status().returning(|_| {
            Ok(status("limit-2", OrderState::Wait, dec!(6), dec!(4), dec!(1000), dec!(3)))
        });
        // All three cancel attempts are rejected.
        mock.expect_cancel_order().times(3).returning(|_| Ok(false));
        // The unconfirmed state must never produce a market order.
        mock.expect_place_market_buy().times(0);

        let (executor, decisions) = executor(mock);
        let result = executor
            .execute_buy(&Symbol::new("KRW-SOL"), dec!(10000))
            .await
            .unwrap();

        assert_eq!(result.filled_qty, dec!(6));
        assert_eq!(result.avg_price, dec!(1000));
        assert_eq!(decisions.count_of(DecisionKind::CancelFailedUnknownState), 1);
        // The partial is real, so this is not an aborted fallback.
        assert_eq!(decisions.count_of(DecisionKind::FallbackAborted), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_status_with_failed_cancel_aborts() {
        let mut mock = MockExchangeApi::new();
        mock.expect_order_book().returning(|_| Ok(healthy_book()));
        mock.expect_place_limit_buy()
            .returning(|_, _, _| Ok("limit-3".to_string()));
        // First poll dies; the cancel path then cannot read state either.
        mock.expect_order_status()
            .returning(|_| Err(ExchangeError::Transport("boom".to_string())));
        mock.expect_cancel_order().times(3).returning(|_| Ok(false));
        mock.expect_place_market_buy().times(0);

        let (executor, decisions) = executor(mock);
        let result = executor
            .execute_buy(&Symbol::new("KRW-SOL"), dec!(10000))
            .await;

        assert!(result.is_none());
        assert_eq!(decisions.count_of(DecisionKind::FallbackAborted), 1);
        assert_eq!(decisions.count_of(DecisionKind::CancelFailedUnknownState), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unfilled_timeout_with_confirmed_cancel_goes_to_market() {
        let mut mock = MockExchangeApi::new();
        mock.expect_order_book().returning(|_| Ok(healthy_book()));
        mock.expect_place_limit_buy()
            .returning(|_, _, _| Ok("limit-4".to_string()));

        let mut seq = Sequence::new();
        mock.expect_order_status()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("limit-4", OrderState::Wait, dec!(0), dec!(10), dec!(1000), dec!(0)))
            });
        mock.expect_cancel_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        mock.expect_place_market_buy()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, notional| *notional == dec!(10000))
            .returning(|_, _| Ok("market-4".to_string()));
        mock.expect_order_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("market-4", OrderState::Done, dec!(9.97), dec!(0), dec!(1003), dec!(5)))
            });

        let (executor, decisions) = executor(mock);
        let result = executor
            .execute_buy(&Symbol::new("KRW-SOL"), dec!(10000))
            .await
            .unwrap();
        assert_eq!(result.avg_price, dec!(1003));
        assert_eq!(decisions.count_of(DecisionKind::FallbackAborted), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn thin_book_blocks_before_any_order() {
        let mut mock = MockExchangeApi::new();
        mock.expect_order_book().returning(|_| {
            Ok(OrderBook {
                symbol: Symbol::new("KRW-SOL"),
                units: vec![OrderBookUnit {
                    bid_price: dec!(1000),
                    bid_size: dec!(0.01),
                    ask_price: dec!(1001),
                    ask_size: dec!(0.01),
                }],
            })
        });
        mock.expect_place_limit_buy().times(0);
        mock.expect_place_market_buy().times(0);

        let (executor, _) = executor(mock);
        let result = executor
            .execute_buy(&Symbol::new("KRW-SOL"), dec!(10000))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sell_partial_with_confirmed_cancel_sells_remainder() {
        let position = Position::open(
            Symbol::new("KRW-SOL"),
            dec!(900),
            dec!(10),
            None,
            BuyMeta {
                strategy: "trend_breakout".to_string(),
                stop_price: dec!(880),
                take_profit_price: None,
                target_r: None,
                time_stop_candles: None,
                trailing_activated: false,
                trailing_stop_price: None,
                tp1_done: false,
                risk_unit: dec!(20),
            },
        );

        let mut mock = MockExchangeApi::new();
        let mut seq = Sequence::new();
        // Tradable balance read before sizing the sell.
        mock.expect_balance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(dec!(10)));
        mock.expect_order_book()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(healthy_book()));
        mock.expect_place_limit_sell()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok("sell-1".to_string()));
        mock.expect_order_status()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("sell-1", OrderState::Wait, dec!(4), dec!(6), dec!(1001), dec!(2)))
            });
        mock.expect_cancel_order()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        mock.expect_order_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("sell-1", OrderState::Cancel, dec!(4), dec!(6), dec!(1001), dec!(2)))
            });
        // Remaining tradable balance after the cancel.
        mock.expect_balance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(dec!(6)));
        mock.expect_place_market_sell()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, qty| *qty == dec!(6))
            .returning(|_, _| Ok("sell-2".to_string()));
        mock.expect_order_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(status("sell-2", OrderState::Done, dec!(6), dec!(0), dec!(999), dec!(3)))
            });
        // Final settled balance after the market leg.
        mock.expect_balance().returning(|_| Ok(dec!(0)));

        let (executor, decisions) = executor(mock);
        let result = executor
            .execute_sell(&Symbol::new("KRW-SOL"), &position, dec!(1.0))
            .await
            .unwrap();

        assert_eq!(result.filled_qty, dec!(10));
        // VWAP of 4 @ 1001 and 6 @ 999
        assert_eq!(result.avg_price, dec!(999.8));
        assert_eq!(result.remaining_qty, dec!(0));
        assert_eq!(decisions.count_of(DecisionKind::FallbackAborted), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_avg_price_falls_back_to_reference() {
        let mut mock = MockExchangeApi::new();
        mock.expect_order_book().returning(|_| Ok(healthy_book()));
        mock.expect_place_limit_buy()
            .returning(|_, _, _| Ok("u9".to_string()));
        mock.expect_order_status().returning(|_| {
            Ok(OrderStatus {
                uuid: "u9".to_string(),
                state: OrderState::Done,
                executed_volume: dec!(10),
                remaining_volume: dec!(0),
                avg_price: None,
                paid_fee: dec!(0),
                trades: vec![],
            })
        });

        let (executor, _) = executor(mock);
        let result = executor
            .execute_buy(&Symbol::new("KRW-SOL"), dec!(10000))
            .await
            .unwrap();
        // Reference bid price stands in, and the fee is estimated.
        assert_eq!(result.avg_price, dec!(1000));
        assert!(result.fee_estimated);
        assert_eq!(result.paid_fee, dec!(10000) * dec!(0.0005));
    }
}
