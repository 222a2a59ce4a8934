use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{BotController, OrderExecutor};
use crate::analysis::{macro_trend_ok, SymbolAnalyzer};
use crate::config::{Settings, TradingSession, UntrackedAction};
use crate::events::{DecisionKind, DecisionLog};
use crate::exchange::{with_retry, ExchangeApi};
use crate::market::MarketData;
use crate::notifications::{buy_executed, sell_executed, AlertType, NotificationManager};
use crate::positions::{PositionBook, Reconciler};
use crate::risk::{RiskSizer, SizingRejection};
use crate::stats::{SessionStats, TradeRecord};
use crate::strategies::{evaluate_entry, evaluate_exit, select_strategy, ExitDecision};
use crate::types::{BuyMeta, CloseReason, Position, Symbol};

/// How many resampled bars the analyzer is fed per evaluation.
const ANALYSIS_BARS: usize = 240;

/// True when `hour` falls inside any configured session.
pub fn in_session(hour: u32, sessions: &[TradingSession]) -> bool {
    sessions
        .iter()
        .any(|s| s.start_hour <= hour && hour < s.end_hour)
}

/// Entry lockout window; start == end disables it.
pub fn entry_hour_blocked(hour: u32, start_hour: u32, end_hour: u32) -> bool {
    if start_hour == end_hour {
        return false;
    }
    if start_hour < end_hour {
        start_hour <= hour && hour < end_hour
    } else {
        // Window wraps midnight
        hour >= start_hour || hour < end_hour
    }
}

/// Per-symbol re-entry lockouts after stop-loss closes. Expired entries
/// are dropped on lookup.
#[derive(Default)]
pub struct CooldownMap {
    until: HashMap<Symbol, DateTime<Utc>>,
}

impl CooldownMap {
    pub fn set(&mut self, symbol: Symbol, until: DateTime<Utc>) {
        info!("re-entry cooldown for {} until {}", symbol, until);
        self.until.insert(symbol, until);
    }

    pub fn is_active(&mut self, symbol: &Symbol, now: DateTime<Utc>) -> bool {
        match self.until.get(symbol) {
            Some(until) if now < *until => true,
            Some(_) => {
                self.until.remove(symbol);
                false
            }
            None => false,
        }
    }

    pub fn expiry(&self, symbol: &Symbol) -> Option<DateTime<Utc>> {
        self.until.get(symbol).copied()
    }
}

/// The single trading task: one tick evaluates regime, reconciles, and
/// walks the symbol universe for exits then entries. All order submission
/// happens serially here.
pub struct TradingLoop {
    settings: Settings,
    controller: Arc<BotController>,
    exchange: Arc<dyn ExchangeApi>,
    market: MarketData,
    analyzer: SymbolAnalyzer,
    regime: crate::regime::RegimeEngine,
    sizer: RiskSizer,
    executor: OrderExecutor,
    book: Arc<PositionBook>,
    reconciler: Reconciler,
    stats: SessionStats,
    decisions: Arc<DecisionLog>,
    notifications: Arc<NotificationManager>,

    universe: Vec<Symbol>,
    excluded: HashSet<String>,
    reentry_cooldowns: CooldownMap,
    last_attempt_candle: HashMap<Symbol, DateTime<Utc>>,
    buying_in_progress: HashSet<Symbol>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl TradingLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        controller: Arc<BotController>,
        exchange: Arc<dyn ExchangeApi>,
        book: Arc<PositionBook>,
        decisions: Arc<DecisionLog>,
        notifications: Arc<NotificationManager>,
    ) -> Self {
        let market = MarketData::new(Arc::clone(&exchange));
        let analyzer = SymbolAnalyzer::new(settings.strategy.clone());
        let regime = crate::regime::RegimeEngine::new(
            settings.strategy.regime_confirm_count,
            settings.strategy.regime_min_hold_minutes,
            settings.strategy.regime_check_minutes,
        );
        let sizer = RiskSizer::new(
            settings.risk_management.clone(),
            settings.trading.max_total_investment,
            settings.trading.min_trade_amount,
        );
        let executor = OrderExecutor::new(
            Arc::clone(&exchange),
            Arc::clone(&decisions),
            &settings.trading,
        );
        let reconciler = Reconciler::new(settings.trading.position_reconcile_interval_seconds);
        let stats = SessionStats::new(&settings.storage.trade_history_dir);

        let excluded: HashSet<String> = settings
            .coin_selection
            .excluded_coins
            .iter()
            .map(|c| c.to_uppercase())
            .collect();
        let universe: Vec<Symbol> = settings
            .coin_selection
            .fixed_tickers
            .iter()
            .filter_map(|t| Symbol::parse(t))
            .filter(|s| !excluded.contains(s.as_str()) && !excluded.contains(s.base_asset()))
            .collect();

        Self {
            settings,
            controller,
            exchange,
            market,
            analyzer,
            regime,
            sizer,
            executor,
            book,
            reconciler,
            stats,
            decisions,
            notifications,
            universe,
            excluded,
            reentry_cooldowns: CooldownMap::default(),
            last_attempt_candle: HashMap::new(),
            buying_in_progress: HashSet::new(),
            last_heartbeat: None,
        }
    }

    /// Startup, then the tick loop until a stop is requested. Fails only
    /// before the first tick (credentials, unreadable balances).
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.startup().await?;

        while self.controller.is_running() {
            let now = Utc::now();
            if let Err(e) = self.tick(now).await {
                error!("tick failed: {}", e);
            }
            tokio::time::sleep(Duration::from_secs(
                self.settings.trading.check_interval_seconds,
            ))
            .await;
        }

        if self.controller.should_liquidate_on_stop() {
            self.liquidate_all().await;
        }
        self.notifications.notify(AlertType::BotStopped);
        info!("trading loop stopped");
        Ok(())
    }

    async fn startup(&mut self) -> anyhow::Result<()> {
        let restored = self.book.load();
        if restored > 0 {
            info!("resuming with {} tracked position(s)", restored);
        }

        let cash = with_retry("startup balance", || self.exchange.balance("KRW"))
            .await
            .map_err(|e| anyhow::anyhow!("startup balance read failed: {}", e))?;
        let total = self.estimate_total_value(cash).await;
        self.stats.start(cash, total);

        let now = Utc::now();
        self.reconciler
            .reconcile(&self.book, &self.exchange, true, "startup", now)
            .await;
        self.sync_untracked_balances().await;
        self.update_regime(true, now).await;

        self.decisions.record(
            DecisionKind::Start,
            json!({
                "universe": self.universe.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                "cash_krw": cash,
                "total_value_krw": total,
                "regime": self.regime.current().as_str(),
            }),
        );
        self.notifications.notify(AlertType::BotStarted);
        Ok(())
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        if self.controller.in_cooldown(now) {
            debug!("in cooldown, sleeping");
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }

        if self.check_daily_loss_breaker(now) {
            return Ok(());
        }

        if !self.check_trading_hours(now) {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }

        self.update_regime(false, now).await;
        self.reconciler
            .reconcile(&self.book, &self.exchange, false, "loop", now)
            .await;
        self.emit_heartbeat(now).await;

        // Universe order first, then held-only symbols appended: the scan
        // order is deterministic within a tick.
        let mut symbols = self.universe.clone();
        for held in self.book.symbols() {
            if !symbols.contains(&held) {
                symbols.push(held);
            }
        }

        for symbol in symbols {
            if !self.controller.is_running() {
                break;
            }
            if self.book.contains(&symbol) {
                self.evaluate_sell(&symbol, now).await;
            } else {
                self.evaluate_buy(&symbol, now).await;
            }
        }
        Ok(())
    }

    /// Daily loss circuit breaker: trips once per window, arms a cooldown.
    fn check_daily_loss_breaker(&mut self, now: DateTime<Utc>) -> bool {
        let pnl_pct = self.stats.daily_pnl_pct(now);
        if pnl_pct > self.settings.trading.daily_loss_limit_percent {
            return false;
        }
        let minutes = self.settings.trading.cooldown_after_loss_minutes;
        warn!(
            "daily loss limit hit: {:.2}% <= {}%, cooling down {} minutes",
            pnl_pct, self.settings.trading.daily_loss_limit_percent, minutes
        );
        self.controller
            .set_cooldown_until(Some(now + ChronoDuration::minutes(minutes)));
        self.notifications.notify(AlertType::CooldownActivated {
            reason: format!("daily loss {:.2}%", pnl_pct),
            minutes,
        });
        true
    }

    /// Returns false when trading is paused for the session schedule.
    fn check_trading_hours(&mut self, now: DateTime<Utc>) -> bool {
        let hours = &self.settings.trading.trading_hours;
        if !hours.enabled {
            return true;
        }
        let inside = in_session(now.hour(), &hours.sessions);
        if !inside && !self.controller.is_paused() {
            info!("outside trading hours, pausing");
            self.controller.set_paused(true);
        } else if inside && self.controller.is_paused() {
            info!("trading hours resumed");
            self.controller.set_paused(false);
        }
        !self.controller.is_paused()
    }

    async fn update_regime(&mut self, force: bool, now: DateTime<Utc>) {
        let reference = Symbol::new(&self.settings.strategy.regime_reference);
        let series = self
            .market
            .resampled(
                &reference,
                self.settings.strategy.signal_candle_minutes,
                ANALYSIS_BARS,
            )
            .await;
        let update = self.regime.update(series.as_ref(), force, now);

        if let Some(update) = update {
            self.decisions.record(
                DecisionKind::RegimeUpdate,
                json!({
                    "reference": reference.as_str(),
                    "previous": update.previous.as_str(),
                    "current": update.current.as_str(),
                    "candidate": update.candidate.as_str(),
                    "confirm_count": update.confirm_count,
                    "applied": update.applied,
                }),
            );
            if update.applied {
                self.notifications.notify(AlertType::RegimeChanged {
                    previous: update.previous,
                    current: update.current,
                    confirm_count: update.confirm_count,
                });
            }
        }
    }

    async fn emit_heartbeat(&mut self, now: DateTime<Utc>) {
        let interval = ChronoDuration::minutes(self.settings.trading.analysis_heartbeat_minutes);
        if let Some(last) = self.last_heartbeat {
            if now - last < interval {
                return;
            }
        }
        self.last_heartbeat = Some(now);

        let cash = with_retry("balance", || self.exchange.balance("KRW"))
            .await
            .unwrap_or(Decimal::ZERO);
        let total = self.estimate_total_value(cash).await;
        self.stats.update_balance(cash, total);
        let (daily_profit, daily_trades) = self.stats.daily_profit(now);

        let positions: Vec<_> = self
            .book
            .all()
            .into_iter()
            .map(|p| {
                json!({
                    "symbol": p.symbol.as_str(),
                    "buy_price": p.buy_price,
                    "amount": p.amount,
                    "strategy": p.buy_meta.strategy,
                    "highest": p.highest_price_seen(),
                })
            })
            .collect();

        self.decisions.record(
            DecisionKind::LoopHeartbeat,
            json!({
                "regime": self.regime.current().as_str(),
                "cash_krw": cash,
                "total_value_krw": total,
                "daily_profit_krw": daily_profit,
                "daily_trades": daily_trades,
                "positions": positions,
                "drawdown_pct": self.stats.drawdown_pct(),
            }),
        );
    }

    /// Marked value of everything held, plus cash. Price lookups fall
    /// back to entry price on failure.
    async fn estimate_total_value(&self, cash: Decimal) -> Decimal {
        let mut total = cash;
        for position in self.book.all() {
            let price = self
                .exchange
                .current_price(&position.symbol)
                .await
                .unwrap_or(position.buy_price);
            total += position.value_at(price);
        }
        total
    }

    /// Exposure at cost for one symbol (zero unless held).
    fn symbol_exposure(&self, symbol: &Symbol) -> Decimal {
        self.book
            .get(symbol)
            .map(|p| p.invested_krw())
            .unwrap_or(Decimal::ZERO)
    }

    // ------------------------------------------------------------------
    // Buy side
    // ------------------------------------------------------------------

    async fn evaluate_buy(&mut self, symbol: &Symbol, now: DateTime<Utc>) {
        if self.buying_in_progress.contains(symbol) {
            debug!("{} buy already in flight", symbol);
            return;
        }
        if self.excluded.contains(symbol.as_str()) || self.excluded.contains(symbol.base_asset()) {
            return;
        }

        // A live exchange balance means this symbol is not actually flat.
        if self.handle_untracked_balance(symbol).await {
            return;
        }

        if self.settings.trading.reentry_cooldown_after_stoploss_minutes > 0
            && self.reentry_cooldowns.is_active(symbol, now)
        {
            debug!(
                "{} in re-entry cooldown until {:?}",
                symbol,
                self.reentry_cooldowns.expiry(symbol)
            );
            return;
        }

        if self.book.len() >= self.settings.strategy.max_positions {
            debug!("position cap reached, skipping {}", symbol);
            return;
        }

        let series = match self
            .market
            .resampled(symbol, self.settings.strategy.signal_candle_minutes, ANALYSIS_BARS)
            .await
        {
            Some(series) => series,
            None => {
                debug!("{} data short, skipping this tick", symbol);
                return;
            }
        };
        let state = match self.analyzer.analyze(&series) {
            Some(state) => state,
            None => {
                debug!("{} analyzer produced no state", symbol);
                return;
            }
        };

        let regime = self.regime.current();
        let mut blocked_by: Vec<String> = Vec::new();
        if !regime.allows_entries() {
            blocked_by.push("regime_bear".to_string());
        }
        if !self.macro_trend_allows().await {
            blocked_by.push("macro_trend".to_string());
        }
        let etf = &self.settings.strategy.entry_time_filter;
        if etf.enabled && entry_hour_blocked(now.hour(), etf.start_hour, etf.end_hour) {
            blocked_by.push("entry_time".to_string());
        }
        if !state.volatility_ok {
            blocked_by.push("volatility".to_string());
        }

        let strategy = select_strategy(symbol, regime, &self.settings.strategy);
        if strategy.is_none() && blocked_by.is_empty() {
            blocked_by.push("no_strategy_for_regime".to_string());
        }

        if !blocked_by.is_empty() {
            self.decisions.record_buy_blocked(
                symbol,
                &state.candle_timestamp.to_rfc3339(),
                &blocked_by,
                regime.as_str(),
                json!({
                    "symbol": symbol.as_str(),
                    "regime": regime.as_str(),
                    "blocked_by": blocked_by,
                    "quality_score": state.quality_score,
                    "candle_ts": state.candle_timestamp.to_rfc3339(),
                }),
            );
            return;
        }

        let plan = match strategy.and_then(|id| evaluate_entry(id, &state, &self.settings.strategy))
        {
            Some(plan) => plan,
            None => return,
        };

        // One attempt per closed candle per symbol.
        if self.last_attempt_candle.get(symbol) == Some(&state.candle_timestamp) {
            debug!("{} already attempted on candle {}", symbol, state.candle_timestamp);
            return;
        }
        self.last_attempt_candle
            .insert(symbol.clone(), state.candle_timestamp);

        self.decisions.record(
            DecisionKind::BuySignal,
            json!({
                "symbol": symbol.as_str(),
                "strategy": plan.strategy.as_str(),
                "close": state.close,
                "stop_price": plan.stop_price,
                "quality_score": state.quality_score,
                "reasons": plan.reasons,
                "candle_ts": state.candle_timestamp.to_rfc3339(),
            }),
        );

        let book_check = self.executor.pretrade_book(symbol).await;
        let order_book = match book_check {
            Ok(book) => book,
            Err(rejection) => {
                self.decisions.record(
                    DecisionKind::BuyCancelled,
                    json!({
                        "symbol": symbol.as_str(),
                        "reason": rejection,
                    }),
                );
                return;
            }
        };

        let cash = match with_retry("balance", || self.exchange.balance("KRW")).await {
            Ok(cash) => cash,
            Err(e) => {
                warn!("{} balance read failed before sizing: {}", symbol, e);
                return;
            }
        };
        let equity = self.estimate_total_value(cash).await;
        let sizing = self.sizer.size(
            symbol,
            plan.entry_price,
            plan.stop_price,
            equity,
            self.symbol_exposure(symbol),
            self.book.total_invested_krw(),
        );

        self.decisions.record(
            DecisionKind::BuySizing,
            json!({
                "symbol": symbol.as_str(),
                "sizing": sizing,
                "available_krw": cash,
                "spread_pct": order_book.spread_pct(),
            }),
        );

        match sizing.rejection {
            Some(SizingRejection::StopNotBelowEntry) => {
                self.decisions.record_buy_blocked(
                    symbol,
                    &state.candle_timestamp.to_rfc3339(),
                    &["stop_not_below_entry".to_string()],
                    regime.as_str(),
                    json!({ "symbol": symbol.as_str(), "blocked_by": ["stop_not_below_entry"] }),
                );
                return;
            }
            Some(SizingRejection::BelowMinTrade) => {
                self.decisions.record(
                    DecisionKind::BuySkipped,
                    json!({ "symbol": symbol.as_str(), "reason": "below_min_trade" }),
                );
                return;
            }
            None => {}
        }

        let invest = sizing.recommended_invest_krw.min(cash);
        if invest < self.settings.trading.min_trade_amount {
            self.decisions.record(
                DecisionKind::BuySkipped,
                json!({
                    "symbol": symbol.as_str(),
                    "reason": "insufficient_krw",
                    "available_krw": cash,
                    "required_krw": sizing.recommended_invest_krw,
                }),
            );
            return;
        }

        self.buying_in_progress.insert(symbol.clone());
        let result = self.executor.execute_buy(symbol, invest).await;
        self.buying_in_progress.remove(symbol);

        match result {
            Some(result) if result.filled_qty > Decimal::ZERO => {
                let meta = BuyMeta {
                    strategy: plan.strategy.as_str().to_string(),
                    stop_price: plan.stop_price,
                    take_profit_price: plan.take_profit_price,
                    target_r: plan.target_r,
                    time_stop_candles: plan.time_stop_candles,
                    trailing_activated: false,
                    trailing_stop_price: None,
                    tp1_done: false,
                    risk_unit: plan.risk_unit,
                };
                let position = Position::open(
                    symbol.clone(),
                    result.avg_price,
                    result.filled_qty,
                    result.uuid.clone(),
                    meta,
                );
                self.book.open(position);
                self.stats.add_fee(result.paid_fee);

                let new_cash = with_retry("balance", || self.exchange.balance("KRW"))
                    .await
                    .unwrap_or(cash - invest);
                let total = self.estimate_total_value(new_cash).await;
                self.stats.update_balance(new_cash, total);

                self.decisions.record(
                    DecisionKind::BuyExecuted,
                    json!({
                        "symbol": symbol.as_str(),
                        "strategy": plan.strategy.as_str(),
                        "invest_krw": invest,
                        "price": result.avg_price,
                        "amount": result.filled_qty,
                        "fee_krw": result.paid_fee,
                        "fee_estimated": result.fee_estimated,
                        "mid_price": order_book.mid_price(),
                    }),
                );
                self.notifications.notify(buy_executed(
                    symbol.clone(),
                    result.avg_price,
                    result.filled_qty,
                    invest,
                    plan.strategy.as_str(),
                ));
                info!(
                    "buy complete: {} {} @ {} ({})",
                    symbol, result.filled_qty, result.avg_price, plan.strategy
                );
            }
            _ => {
                self.decisions.record(
                    DecisionKind::BuyFailed,
                    json!({ "symbol": symbol.as_str(), "invest_krw": invest }),
                );
                warn!("{} buy failed", symbol);
            }
        }
    }

    async fn macro_trend_allows(&self) -> bool {
        let filter = &self.settings.strategy.btc_filter;
        if !filter.enabled {
            return true;
        }
        let reference = Symbol::new(&filter.ticker);
        let series = match self
            .market
            .resampled(&reference, self.settings.strategy.signal_candle_minutes, ANALYSIS_BARS)
            .await
        {
            Some(series) => series,
            // Short reference data blocks entries rather than waving them
            // through.
            None => return false,
        };
        macro_trend_ok(&series, filter.ema_period).unwrap_or(false)
    }

    /// Deals with an exchange balance for a symbol we do not track.
    /// Returns true when the buy evaluation must stop here.
    async fn handle_untracked_balance(&mut self, symbol: &Symbol) -> bool {
        let amount = match self.exchange.balance(symbol.base_asset()).await {
            Ok(amount) => amount,
            Err(_) => return false,
        };
        if amount <= Decimal::ZERO {
            return false;
        }
        let price = match self.exchange.current_price(symbol).await {
            Ok(p) => p,
            Err(_) => return true,
        };
        let value = amount * price;
        if value < self.settings.trading.min_trade_amount {
            // Dust never blocks a new entry.
            return false;
        }

        match self.settings.trading.untracked_balance.action {
            UntrackedAction::Ignore => {
                warn!(
                    "{} has an untracked balance worth {} KRW, skipping",
                    symbol, value
                );
                true
            }
            UntrackedAction::Attach => {
                let avg = self
                    .exchange
                    .avg_buy_price(symbol.base_asset())
                    .await
                    .unwrap_or(price);
                info!("adopting untracked balance as a position: {} {}", symbol, amount);
                let meta = BuyMeta {
                    strategy: "momentum_pullback".to_string(),
                    stop_price: avg * rust_decimal_macros::dec!(0.99),
                    take_profit_price: None,
                    target_r: None,
                    time_stop_candles: None,
                    trailing_activated: false,
                    trailing_stop_price: None,
                    tp1_done: false,
                    risk_unit: avg * rust_decimal_macros::dec!(0.01),
                };
                self.book
                    .open(Position::open(symbol.clone(), avg, amount, None, meta));
                true
            }
            UntrackedAction::CleanupSmall => {
                if value <= self.settings.trading.untracked_balance.cleanup_max_krw {
                    info!("cleaning up small untracked balance: {} ({} KRW)", symbol, value);
                    let position = Position::open(
                        symbol.clone(),
                        price,
                        amount,
                        None,
                        BuyMeta {
                            strategy: "momentum_pullback".to_string(),
                            stop_price: Decimal::ZERO,
                            take_profit_price: None,
                            target_r: None,
                            time_stop_candles: None,
                            trailing_activated: false,
                            trailing_stop_price: None,
                            tp1_done: false,
                            risk_unit: Decimal::ZERO,
                        },
                    );
                    self.executor
                        .execute_sell(symbol, &position, Decimal::ONE)
                        .await;
                } else {
                    warn!(
                        "{} untracked balance {} KRW above the cleanup limit, keeping",
                        symbol, value
                    );
                }
                true
            }
        }
    }

    /// Startup sweep over every exchange balance without a tracked
    /// position.
    async fn sync_untracked_balances(&mut self) {
        let balances = match self.exchange.balances().await {
            Ok(b) => b,
            Err(e) => {
                warn!("untracked balance sync skipped: {}", e);
                return;
            }
        };
        for balance in balances {
            if balance.currency == "KRW" || balance.total() <= Decimal::ZERO {
                continue;
            }
            let symbol = Symbol::new(format!("KRW-{}", balance.currency));
            if self.book.contains(&symbol) {
                continue;
            }
            if self.excluded.contains(symbol.as_str())
                || self.excluded.contains(symbol.base_asset())
            {
                continue;
            }
            self.handle_untracked_balance(&symbol).await;
        }
    }

    // ------------------------------------------------------------------
    // Sell side
    // ------------------------------------------------------------------

    async fn evaluate_sell(&mut self, symbol: &Symbol, now: DateTime<Utc>) {
        let price = match with_retry("current_price", || self.exchange.current_price(symbol)).await
        {
            Ok(price) => price,
            Err(e) => {
                debug!("{} price unavailable, skipping sell check: {}", symbol, e);
                return;
            }
        };

        let series = match self
            .market
            .resampled(symbol, self.settings.strategy.signal_candle_minutes, ANALYSIS_BARS)
            .await
        {
            Some(series) => series,
            None => {
                debug!("{} data short, skipping sell check", symbol);
                return;
            }
        };
        let state = match self.analyzer.analyze(&series) {
            Some(state) => state,
            None => return,
        };

        // Highest-price ratcheting, trailing management and the exit
        // decision run under the book lock in one pass.
        let mut decision: Option<ExitDecision> = None;
        let strategy_settings = self.settings.strategy.clone();
        let risk_settings = self.settings.risk_management.clone();
        self.book.update(symbol, |position| {
            let mut changed = position.observe_price(price);
            let trailing_before = (
                position.buy_meta.trailing_activated,
                position.buy_meta.trailing_stop_price,
            );
            decision = evaluate_exit(
                position,
                &state,
                price,
                now,
                &strategy_settings,
                &risk_settings,
            );
            changed |= trailing_before
                != (
                    position.buy_meta.trailing_activated,
                    position.buy_meta.trailing_stop_price,
                );
            changed
        });

        let decision = match decision {
            Some(d) => d,
            None => return,
        };
        let position = match self.book.get(symbol) {
            Some(p) => p,
            None => return,
        };

        self.decisions.record(
            DecisionKind::SellSignal,
            json!({
                "symbol": symbol.as_str(),
                "reason": decision.reason.as_str(),
                "ratio": decision.ratio(),
                "price": price,
                "buy_price": position.buy_price,
                "r_multiple": position.r_multiple(price),
                "hold_minutes": position.hold_minutes(now),
            }),
        );

        let result = match self
            .executor
            .execute_sell(symbol, &position, decision.ratio())
            .await
        {
            Some(result) if result.filled_qty > Decimal::ZERO => result,
            _ => {
                warn!("{} sell failed ({})", symbol, decision.reason);
                return;
            }
        };

        self.stats.add_fee(result.paid_fee);
        let buy_cost = position.buy_price * result.filled_qty;
        let profit_krw = result.net_krw - buy_cost;
        let profit_rate = if position.buy_price > Decimal::ZERO {
            (result.avg_price - position.buy_price) / position.buy_price * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        let record = TradeRecord {
            timestamp: now,
            symbol: symbol.clone(),
            buy_price: position.buy_price,
            sell_price: result.avg_price,
            amount: result.filled_qty,
            buy_fee_krw: Decimal::ZERO,
            sell_fee_krw: result.paid_fee,
            gross_pnl_krw: (result.avg_price - position.buy_price) * result.filled_qty,
            net_pnl_krw: profit_krw,
            reason: decision.reason,
            strategy: position.buy_meta.strategy.clone(),
        };

        if decision.is_full() {
            self.finalize_close(symbol, &result, record, decision.reason, now)
                .await;
        } else {
            self.apply_partial_close(symbol, &result, record, decision.reason, now)
                .await;
        }

        self.decisions.record(
            DecisionKind::SellExecuted,
            json!({
                "symbol": symbol.as_str(),
                "reason": decision.reason.as_str(),
                "ratio": decision.ratio(),
                "price": result.avg_price,
                "amount": result.filled_qty,
                "net_krw": result.net_krw,
                "fee_krw": result.paid_fee,
                "profit_krw": profit_krw,
                "profit_rate_pct": profit_rate,
            }),
        );
        self.notifications.notify(sell_executed(
            symbol.clone(),
            result.avg_price,
            profit_krw,
            profit_rate,
            decision.reason,
        ));

        let new_cash = with_retry("balance", || self.exchange.balance("KRW"))
            .await
            .unwrap_or(self.stats.current_cash);
        let total = self.estimate_total_value(new_cash).await;
        self.stats.update_balance(new_cash, total);
    }

    /// Full liquidation: the position goes away unless the exchange still
    /// reports a tradable remainder worth at least the minimum order.
    async fn finalize_close(
        &mut self,
        symbol: &Symbol,
        result: &crate::types::OrderResult,
        record: TradeRecord,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) {
        let remaining = result.remaining_qty;
        if remaining > Decimal::ZERO {
            let ref_price = self
                .exchange
                .current_price(symbol)
                .await
                .unwrap_or(result.avg_price);
            let remaining_value = remaining * ref_price;
            if remaining_value >= self.settings.trading.min_trade_amount {
                warn!(
                    "{} full close left {} ({} KRW) on the book, keeping position",
                    symbol, remaining, remaining_value
                );
                self.book.update(symbol, |p| {
                    p.amount = remaining;
                    true
                });
                self.stats.record_close(record, now);
                return;
            }
            debug!("{} residual {} is dust, closing out", symbol, remaining);
        }

        self.book.remove(symbol);
        self.stats.record_close(record, now);

        if reason.is_stop_loss() {
            let minutes = self.settings.trading.reentry_cooldown_after_stoploss_minutes;
            if minutes > 0 {
                self.reentry_cooldowns
                    .set(symbol.clone(), now + ChronoDuration::minutes(minutes));
            }
        }
    }

    /// Partial exit: shrink the position, mark one-shot flags, and sweep
    /// dust remainders.
    async fn apply_partial_close(
        &mut self,
        symbol: &Symbol,
        result: &crate::types::OrderResult,
        record: TradeRecord,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) {
        self.book.update(symbol, |p| {
            p.amount = (p.amount - result.filled_qty).max(Decimal::ZERO);
            if reason == CloseReason::TakeProfit1 {
                p.buy_meta.tp1_done = true;
            }
            true
        });
        self.stats.record_close(record, now);

        // Cooldown on partial stops is configurable; the default applies
        // it only to full liquidations.
        if reason.is_stop_loss() && self.settings.trading.cooldown_on_partial_stop {
            let minutes = self.settings.trading.reentry_cooldown_after_stoploss_minutes;
            if minutes > 0 {
                self.reentry_cooldowns
                    .set(symbol.clone(), now + ChronoDuration::minutes(minutes));
            }
        }

        if let Some(position) = self.book.get(symbol) {
            let price = self
                .exchange
                .current_price(symbol)
                .await
                .unwrap_or(result.avg_price);
            if position.amount * price < self.settings.trading.min_trade_amount {
                info!("{} remainder below the minimum order, clearing out", symbol);
                if let Some(final_result) = self
                    .executor
                    .execute_sell(symbol, &position, Decimal::ONE)
                    .await
                {
                    self.stats.add_fee(final_result.paid_fee);
                    let final_record = TradeRecord {
                        timestamp: now,
                        symbol: symbol.clone(),
                        buy_price: position.buy_price,
                        sell_price: final_result.avg_price,
                        amount: final_result.filled_qty,
                        buy_fee_krw: Decimal::ZERO,
                        sell_fee_krw: final_result.paid_fee,
                        gross_pnl_krw: (final_result.avg_price - position.buy_price)
                            * final_result.filled_qty,
                        net_pnl_krw: final_result.net_krw
                            - position.buy_price * final_result.filled_qty,
                        reason: CloseReason::DustCleanup,
                        strategy: position.buy_meta.strategy.clone(),
                    };
                    self.book.remove(symbol);
                    self.stats.record_close(final_record, now);
                }
            }
        }
    }

    /// Best-effort close of everything, used on stop when configured.
    async fn liquidate_all(&mut self) {
        info!("liquidating all positions on stop");
        let now = Utc::now();
        for symbol in self.book.symbols() {
            if let Some(position) = self.book.get(&symbol) {
                if let Some(result) = self
                    .executor
                    .execute_sell(&symbol, &position, Decimal::ONE)
                    .await
                {
                    let record = TradeRecord {
                        timestamp: now,
                        symbol: symbol.clone(),
                        buy_price: position.buy_price,
                        sell_price: result.avg_price,
                        amount: result.filled_qty,
                        buy_fee_krw: Decimal::ZERO,
                        sell_fee_krw: result.paid_fee,
                        gross_pnl_krw: (result.avg_price - position.buy_price) * result.filled_qty,
                        net_pnl_krw: result.net_krw - position.buy_price * result.filled_qty,
                        reason: CloseReason::Liquidation,
                        strategy: position.buy_meta.strategy.clone(),
                    };
                    self.book.remove(&symbol);
                    self.stats.record_close(record, now);
                } else {
                    warn!("{} liquidation failed, position left tracked", symbol);
                }
            }
        }
    }
}
