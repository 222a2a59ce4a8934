use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::RiskSettings;
use crate::types::Symbol;

/// Why sizing came back zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingRejection {
    StopNotBelowEntry,
    BelowMinTrade,
}

/// Every intermediate of the sizing computation, surfaced for the
/// BUY_SIZING audit event.
#[derive(Debug, Clone, Serialize)]
pub struct SizingBundle {
    pub equity_krw: Decimal,
    pub risk_krw: Decimal,
    pub risk_pct: Decimal,
    pub qty_by_risk: Decimal,
    pub weight_cap_krw: Decimal,
    pub weight_remaining_krw: Decimal,
    pub global_cap_remaining_krw: Decimal,
    pub recommended_invest_krw: Decimal,
    pub rejection: Option<SizingRejection>,
}

impl SizingBundle {
    pub fn is_zero(&self) -> bool {
        self.rejection.is_some() || self.recommended_invest_krw <= Decimal::ZERO
    }

    fn zero(
        equity_krw: Decimal,
        risk_krw: Decimal,
        risk_pct: Decimal,
        rejection: SizingRejection,
    ) -> Self {
        Self {
            equity_krw,
            risk_krw,
            risk_pct,
            qty_by_risk: Decimal::ZERO,
            weight_cap_krw: Decimal::ZERO,
            weight_remaining_krw: Decimal::ZERO,
            global_cap_remaining_krw: Decimal::ZERO,
            recommended_invest_krw: Decimal::ZERO,
            rejection: Some(rejection),
        }
    }
}

/// Sizes an order under the three caps: per-trade equity risk, per-symbol
/// weight, and the global investment ceiling.
pub struct RiskSizer {
    settings: RiskSettings,
    max_total_investment: Decimal,
    min_trade_amount: Decimal,
}

impl RiskSizer {
    pub fn new(
        settings: RiskSettings,
        max_total_investment: Decimal,
        min_trade_amount: Decimal,
    ) -> Self {
        Self {
            settings,
            max_total_investment,
            min_trade_amount,
        }
    }

    fn risk_pct_for(&self, symbol: &Symbol) -> Decimal {
        self.settings
            .symbol_risk_pct
            .get(symbol.as_str())
            .copied()
            .unwrap_or(self.settings.risk_per_trade_pct)
    }

    /// `equity_krw` is cash plus mark-to-market of open positions;
    /// `symbol_exposure_krw` and `total_invested_krw` are at cost.
    pub fn size(
        &self,
        symbol: &Symbol,
        entry_price: Decimal,
        stop_price: Decimal,
        equity_krw: Decimal,
        symbol_exposure_krw: Decimal,
        total_invested_krw: Decimal,
    ) -> SizingBundle {
        let risk_pct = self.risk_pct_for(symbol);
        let risk_krw = equity_krw * risk_pct / Decimal::ONE_HUNDRED;

        let risk_unit = entry_price - stop_price;
        if risk_unit <= Decimal::ZERO {
            return SizingBundle::zero(
                equity_krw,
                risk_krw,
                risk_pct,
                SizingRejection::StopNotBelowEntry,
            );
        }

        let qty_by_risk = risk_krw / risk_unit;

        let weight_cap_krw = equity_krw * self.settings.symbol_weight_cap;
        let weight_remaining_krw =
            (weight_cap_krw - symbol_exposure_krw).max(Decimal::ZERO);
        let global_cap_remaining_krw =
            (self.max_total_investment - total_invested_krw).max(Decimal::ZERO);

        let recommended_invest_krw = (qty_by_risk * entry_price)
            .min(weight_remaining_krw)
            .min(global_cap_remaining_krw);

        let rejection = if recommended_invest_krw < self.min_trade_amount {
            Some(SizingRejection::BelowMinTrade)
        } else {
            None
        };

        SizingBundle {
            equity_krw,
            risk_krw,
            risk_pct,
            qty_by_risk,
            weight_cap_krw,
            weight_remaining_krw,
            global_cap_remaining_krw,
            recommended_invest_krw: if rejection.is_some() {
                Decimal::ZERO
            } else {
                recommended_invest_krw
            },
            rejection,
        }
    }
}
