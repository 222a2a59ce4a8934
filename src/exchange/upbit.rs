use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::{Balance, ExchangeApi, ExchangeError, ExchangeResult, OrderBook};
use crate::types::{Candle, OrderBookUnit, OrderState, OrderStatus, OrderTrade, Symbol};

const UPBIT_API: &str = "https://api.upbit.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

/// REST client for the Upbit exchange. The only component that performs
/// I/O against the venue.
#[derive(Debug, Clone)]
pub struct UpbitClient {
    client: Client,
    access_key: String,
    secret_key: String,
    base_url: String,
}

impl UpbitClient {
    pub fn new(access_key: String, secret_key: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            client,
            access_key,
            secret_key,
            base_url: UPBIT_API.to_string(),
        }
    }

    /// Upbit auth: a JWT (HS256) whose payload carries the access key, a
    /// nonce, and the SHA-512 hash of the query string when one is present.
    fn auth_token(&self, query: Option<&str>) -> ExchangeResult<String> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);

        let mut payload = serde_json::json!({
            "access_key": self.access_key,
            "nonce": uuid::Uuid::new_v4().to_string(),
        });
        if let Some(q) = query {
            let mut hasher = Sha512::new();
            hasher.update(q.as_bytes());
            payload["query_hash"] = Value::String(hex::encode(hasher.finalize()));
            payload["query_hash_alg"] = Value::String("SHA512".to_string());
        }
        let payload = URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header, payload);
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("Bearer {}.{}", signing_input, signature))
    }

    async fn get_public(&self, path: &str, query: &str) -> ExchangeResult<Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self.client.get(&url).send().await?;
        Self::decode(resp).await
    }

    async fn get_private(&self, path: &str, query: &str) -> ExchangeResult<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };
        let token = self.auth_token(if query.is_empty() { None } else { Some(query) })?;
        let resp = self
            .client
            .get(&url)
            .header("Authorization", token)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn post_private(&self, path: &str, query: &str) -> ExchangeResult<Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let token = self.auth_token(Some(query))?;
        let resp = self
            .client
            .post(&url)
            .header("Authorization", token)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn delete_private(&self, path: &str, query: &str) -> ExchangeResult<Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let token = self.auth_token(Some(query))?;
        let resp = self
            .client
            .delete(&url)
            .header("Authorization", token)
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode(resp: reqwest::Response) -> ExchangeResult<Value> {
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }
        let body = resp.text().await?;
        if !status.is_success() {
            if status.as_u16() == 401 {
                return Err(ExchangeError::Auth(body));
            }
            return Err(ExchangeError::Api(format!("{}: {}", status, body)));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::InvalidResponse(format!("{}: {}", e, body)))
    }
}

/// Upbit mixes numeric and string encodings for decimal fields.
fn dec_field(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).unwrap_or(Decimal::ZERO),
        Value::Number(n) => n
            .as_f64()
            .and_then(Decimal::from_f64_retain)
            .unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    candle_date_time_utc: String,
    opening_price: Value,
    high_price: Value,
    low_price: Value,
    trade_price: Value,
    candle_acc_trade_volume: Value,
    candle_acc_trade_price: Value,
}

#[async_trait::async_trait]
impl ExchangeApi for UpbitClient {
    async fn current_price(&self, symbol: &Symbol) -> ExchangeResult<Decimal> {
        let body = self
            .get_public("/v1/ticker", &format!("markets={}", symbol))
            .await?;
        let row = body
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| ExchangeError::InvalidResponse("empty ticker".to_string()))?;
        let price = dec_field(&row["trade_price"]);
        if price <= Decimal::ZERO {
            return Err(ExchangeError::InvalidResponse("non-positive price".to_string()));
        }
        Ok(price)
    }

    async fn order_book(&self, symbol: &Symbol) -> ExchangeResult<OrderBook> {
        let body = self
            .get_public("/v1/orderbook", &format!("markets={}", symbol))
            .await?;
        let row = body
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| ExchangeError::InvalidResponse("empty orderbook".to_string()))?;
        let units = row["orderbook_units"]
            .as_array()
            .ok_or_else(|| ExchangeError::InvalidResponse("missing orderbook_units".to_string()))?
            .iter()
            .take(5)
            .map(|u| OrderBookUnit {
                bid_price: dec_field(&u["bid_price"]),
                bid_size: dec_field(&u["bid_size"]),
                ask_price: dec_field(&u["ask_price"]),
                ask_size: dec_field(&u["ask_size"]),
            })
            .collect();
        Ok(OrderBook { symbol: symbol.clone(), units })
    }

    async fn minute_candles(
        &self,
        symbol: &Symbol,
        unit: u32,
        count: u32,
        to: Option<DateTime<Utc>>,
    ) -> ExchangeResult<Vec<Candle>> {
        let mut query = format!("market={}&count={}", symbol, count.min(200));
        if let Some(to) = to {
            query.push_str(&format!("&to={}", to.format("%Y-%m-%dT%H:%M:%SZ")));
        }
        let body = self
            .get_public(&format!("/v1/candles/minutes/{}", unit), &query)
            .await?;
        let rows: Vec<CandleRow> = serde_json::from_value(body)
            .map_err(|e| ExchangeError::InvalidResponse(e.to_string()))?;

        // Upbit returns newest first; the series is kept oldest first.
        let mut candles: Vec<Candle> = rows
            .into_iter()
            .filter_map(|r| {
                Some(Candle {
                    timestamp: parse_utc(&r.candle_date_time_utc)?,
                    open: dec_field(&r.opening_price),
                    high: dec_field(&r.high_price),
                    low: dec_field(&r.low_price),
                    close: dec_field(&r.trade_price),
                    volume: dec_field(&r.candle_acc_trade_volume),
                    quote_volume: dec_field(&r.candle_acc_trade_price),
                })
            })
            .collect();
        candles.reverse();
        Ok(candles)
    }

    async fn place_limit_buy(
        &self,
        symbol: &Symbol,
        price: Decimal,
        quantity: Decimal,
    ) -> ExchangeResult<String> {
        let query = format!(
            "market={}&side=bid&volume={}&price={}&ord_type=limit",
            symbol, quantity, price
        );
        let body = self.post_private("/v1/orders", &query).await?;
        extract_uuid(&body)
    }

    async fn place_limit_sell(
        &self,
        symbol: &Symbol,
        price: Decimal,
        quantity: Decimal,
    ) -> ExchangeResult<String> {
        let query = format!(
            "market={}&side=ask&volume={}&price={}&ord_type=limit",
            symbol, quantity, price
        );
        let body = self.post_private("/v1/orders", &query).await?;
        extract_uuid(&body)
    }

    async fn place_market_buy(
        &self,
        symbol: &Symbol,
        notional: Decimal,
    ) -> ExchangeResult<String> {
        // A "price" order spends a KRW notional at market.
        let query = format!("market={}&side=bid&price={}&ord_type=price", symbol, notional);
        let body = self.post_private("/v1/orders", &query).await?;
        extract_uuid(&body)
    }

    async fn place_market_sell(
        &self,
        symbol: &Symbol,
        quantity: Decimal,
    ) -> ExchangeResult<String> {
        let query = format!("market={}&side=ask&volume={}&ord_type=market", symbol, quantity);
        let body = self.post_private("/v1/orders", &query).await?;
        extract_uuid(&body)
    }

    async fn order_status(&self, uuid: &str) -> ExchangeResult<OrderStatus> {
        let body = self
            .get_private("/v1/order", &format!("uuid={}", uuid))
            .await?;
        let state_str = body["state"].as_str().unwrap_or_default();
        let state = OrderState::from_exchange(state_str).ok_or_else(|| {
            ExchangeError::InvalidResponse(format!("unknown order state '{}'", state_str))
        })?;
        let executed_volume = dec_field(&body["executed_volume"]);
        let trades: Vec<OrderTrade> = body["trades"]
            .as_array()
            .map(|ts| {
                ts.iter()
                    .map(|t| OrderTrade {
                        price: dec_field(&t["price"]),
                        volume: dec_field(&t["volume"]),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let traded_funds: Decimal = trades.iter().map(|t| t.price * t.volume).sum();
        let avg_price = if executed_volume > Decimal::ZERO && traded_funds > Decimal::ZERO {
            Some(traded_funds / executed_volume)
        } else {
            None
        };

        Ok(OrderStatus {
            uuid: body["uuid"].as_str().unwrap_or(uuid).to_string(),
            state,
            executed_volume,
            remaining_volume: dec_field(&body["remaining_volume"]),
            avg_price,
            paid_fee: dec_field(&body["paid_fee"]),
            trades,
        })
    }

    async fn cancel_order(&self, uuid: &str) -> ExchangeResult<bool> {
        let body = self
            .delete_private("/v1/order", &format!("uuid={}", uuid))
            .await?;
        let acked = body["uuid"].as_str() == Some(uuid);
        debug!("cancel {} acknowledged={}", uuid, acked);
        Ok(acked)
    }

    async fn balance(&self, currency: &str) -> ExchangeResult<Decimal> {
        let balances = self.balances().await?;
        Ok(balances
            .into_iter()
            .find(|b| b.currency == currency)
            .map(|b| b.tradable())
            .unwrap_or(Decimal::ZERO))
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        let body = self.get_private("/v1/accounts", "").await?;
        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::InvalidResponse("accounts not a list".to_string()))?;
        Ok(rows
            .iter()
            .map(|r| Balance {
                currency: r["currency"].as_str().unwrap_or_default().to_string(),
                balance: dec_field(&r["balance"]),
                locked: dec_field(&r["locked"]),
                avg_buy_price: dec_field(&r["avg_buy_price"]),
                unit_currency: r["unit_currency"].as_str().unwrap_or("KRW").to_string(),
            })
            .collect())
    }

    async fn avg_buy_price(&self, currency: &str) -> ExchangeResult<Decimal> {
        let balances = self.balances().await?;
        Ok(balances
            .into_iter()
            .find(|b| b.currency == currency)
            .map(|b| b.avg_buy_price)
            .unwrap_or(Decimal::ZERO))
    }
}

fn extract_uuid(body: &Value) -> ExchangeResult<String> {
    body["uuid"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| ExchangeError::InvalidResponse("order response missing uuid".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn dec_field_accepts_both_encodings() {
        assert_eq!(dec_field(&serde_json::json!("123.45")), dec!(123.45));
        assert_eq!(dec_field(&serde_json::json!(67.5)), dec!(67.5));
        assert_eq!(dec_field(&serde_json::json!(null)), Decimal::ZERO);
        assert_eq!(dec_field(&serde_json::json!("garbage")), Decimal::ZERO);
    }

    #[test]
    fn auth_token_is_three_part_jwt() {
        let client = UpbitClient::new("ak".to_string(), "sk".to_string());
        let token = client.auth_token(Some("market=KRW-BTC")).unwrap();
        let token = token.strip_prefix("Bearer ").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let payload = URL_SAFE_NO_PAD.decode(parts[1]).unwrap();
        let payload: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(payload["access_key"], "ak");
        assert_eq!(payload["query_hash_alg"], "SHA512");
        // SHA-512 hex digest length
        assert_eq!(payload["query_hash"].as_str().unwrap().len(), 128);
    }

    #[test]
    fn candle_rows_parse_and_reverse() {
        let rows = serde_json::json!([
            {
                "candle_date_time_utc": "2025-11-02T04:20:00",
                "opening_price": 100.0, "high_price": 110.0,
                "low_price": 99.0, "trade_price": 105.0,
                "candle_acc_trade_volume": 12.5,
                "candle_acc_trade_price": 1300.0
            },
            {
                "candle_date_time_utc": "2025-11-02T04:15:00",
                "opening_price": 98.0, "high_price": 101.0,
                "low_price": 97.0, "trade_price": 100.0,
                "candle_acc_trade_volume": 9.0,
                "candle_acc_trade_price": 900.0
            }
        ]);
        let rows: Vec<CandleRow> = serde_json::from_value(rows).unwrap();
        let mut candles: Vec<Candle> = rows
            .into_iter()
            .filter_map(|r| {
                Some(Candle {
                    timestamp: parse_utc(&r.candle_date_time_utc)?,
                    open: dec_field(&r.opening_price),
                    high: dec_field(&r.high_price),
                    low: dec_field(&r.low_price),
                    close: dec_field(&r.trade_price),
                    volume: dec_field(&r.candle_acc_trade_volume),
                    quote_volume: dec_field(&r.candle_acc_trade_price),
                })
            })
            .collect();
        candles.reverse();
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[1].close, dec!(105.0));
    }
}
