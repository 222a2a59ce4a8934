use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::PositionBook;
use crate::exchange::{with_retry, Balance, ExchangeApi};
use crate::types::Symbol;

/// Misses before a tracked position with no exchange balance is declared
/// a ghost and dropped.
const GHOST_STRIKES: u32 = 3;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub adjusted: usize,
    pub removed: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.adjusted == 0 && self.removed == 0
    }
}

/// Periodically folds the exchange's authoritative balances back into the
/// position book. The exchange always wins; drift is logged, never fought.
pub struct Reconciler {
    interval: Duration,
    last_run: Option<DateTime<Utc>>,
    ghost_misses: HashMap<Symbol, u32>,
}

impl Reconciler {
    pub fn new(interval_seconds: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_seconds.max(30)),
            last_run: None,
            ghost_misses: HashMap::new(),
        }
    }

    /// Throttled unless forced. `None` means the pass was skipped
    /// (throttle or unreadable balances).
    pub async fn reconcile(
        &mut self,
        book: &PositionBook,
        exchange: &Arc<dyn ExchangeApi>,
        force: bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<ReconcileSummary> {
        if !force {
            if let Some(last) = self.last_run {
                if (now - last).to_std().ok()? < self.interval {
                    return None;
                }
            }
        }
        self.last_run = Some(now);

        let balances = match with_retry("balances", || exchange.balances()).await {
            Ok(b) => b,
            Err(e) => {
                warn!("reconcile skipped, balance read failed: {}", e);
                return None;
            }
        };
        if !book.is_empty() && balances.is_empty() {
            warn!("reconcile skipped: exchange returned an empty balance snapshot");
            return None;
        }

        let summary = self.apply(book, &balances, reason);
        if !summary.is_noop() {
            info!(
                "reconciled positions: {} adjusted, {} removed ({})",
                summary.adjusted, summary.removed, reason
            );
        }
        Some(summary)
    }

    /// Pure application of a balance snapshot; separated for tests.
    pub fn apply(
        &mut self,
        book: &PositionBook,
        balances: &[Balance],
        reason: &str,
    ) -> ReconcileSummary {
        let by_currency: HashMap<&str, &Balance> =
            balances.iter().map(|b| (b.currency.as_str(), b)).collect();
        let mut summary = ReconcileSummary::default();

        for symbol in book.symbols() {
            let live = by_currency.get(symbol.base_asset());
            let live_amount = live.map(|b| b.total()).unwrap_or(Decimal::ZERO);

            if live_amount <= Decimal::ZERO {
                let misses = self.ghost_misses.entry(symbol.clone()).or_insert(0);
                *misses += 1;
                if *misses >= GHOST_STRIKES {
                    warn!(
                        "ghost position removed: {} ({} consecutive empty readings, {})",
                        symbol, misses, reason
                    );
                    book.remove(&symbol);
                    self.ghost_misses.remove(&symbol);
                    summary.removed += 1;
                }
                continue;
            }
            self.ghost_misses.remove(&symbol);

            let live_avg = live.map(|b| b.avg_buy_price).unwrap_or(Decimal::ZERO);
            let changed = book.update(&symbol, |position| {
                let mut changed = false;

                let tracked = position.amount;
                let drift = if tracked > Decimal::ZERO {
                    (live_amount - tracked).abs() / tracked
                } else {
                    Decimal::ONE
                };
                if drift > dec!(0.001) {
                    warn!(
                        "{} amount drift {:.4}%: tracked {} -> exchange {}",
                        position.symbol,
                        drift * Decimal::ONE_HUNDRED,
                        tracked,
                        live_amount
                    );
                    position.amount = live_amount;
                    changed = true;
                }

                if live_avg > Decimal::ZERO {
                    let tracked_price = position.buy_price;
                    let price_drift = if tracked_price > Decimal::ZERO {
                        (live_avg - tracked_price).abs() / tracked_price
                    } else {
                        Decimal::ONE
                    };
                    if price_drift > dec!(0.0001) {
                        position.buy_price = live_avg;
                        changed = true;
                    }
                }
                changed
            });
            if changed {
                summary.adjusted += 1;
            }
        }
        summary
    }

    /// Current miss streak for a symbol, for heartbeat introspection.
    pub fn ghost_misses(&self, symbol: &Symbol) -> u32 {
        self.ghost_misses.get(symbol).copied().unwrap_or(0)
    }
}
