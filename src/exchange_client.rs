//! Exchange REST boundary: an `ExchangeClient` trait over a Bitvavo-shaped
//! EUR spot contract — place/cancel orders, read balance, and the
//! order-response shape the executor and exit guard depend on. Ships a
//! `BitvavoClient` (HMAC-signed `reqwest` calls) and an in-memory
//! `SimExchange` test double, mirroring the `LiveExchange`/`SimExchange`
//! split pattern for exchange boundaries.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PipelineError;
use crate::signing::BitvavoSigner;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub price: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub market: String,
    pub side: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
    pub status: String,
    #[serde(default)]
    pub fills: Vec<OrderFill>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One request to place an order, shaped after §4.E's request-body rules:
/// market buys against EUR spend in quote (`amount_quote`), everything else
/// in base (`amount`).
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub market: String,
    pub side: String,       // "buy" | "sell"
    pub order_type: String, // "market" | "limit" | "stopLoss"
    pub amount: Option<Decimal>,
    pub amount_quote: Option<Decimal>,
    pub price: Option<Decimal>,
    pub time_in_force: Option<String>,
    pub post_only: bool,
    pub trigger_price: Option<Decimal>,
    pub trigger_amount: Option<Decimal>,
    pub operator_id: Option<i64>,
}

impl OrderRequest {
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "market": self.market,
            "side": self.side,
            "orderType": self.order_type,
        });
        let obj = body.as_object_mut().expect("constructed as object");
        if let Some(a) = &self.amount {
            obj.insert("amount".into(), serde_json::Value::String(a.to_string()));
        }
        if let Some(aq) = &self.amount_quote {
            obj.insert("amountQuote".into(), serde_json::Value::String(aq.to_string()));
        }
        if let Some(p) = &self.price {
            obj.insert("price".into(), serde_json::Value::String(p.to_string()));
        }
        if let Some(tif) = &self.time_in_force {
            obj.insert("timeInForce".into(), serde_json::Value::String(tif.clone()));
        }
        if self.post_only {
            obj.insert("postOnly".into(), serde_json::Value::Bool(true));
        }
        if let Some(tp) = &self.trigger_price {
            obj.insert("triggerType".into(), serde_json::Value::String("price".into()));
            obj.insert("triggerReference".into(), serde_json::Value::String("lastTrade".into()));
            obj.insert("triggerPrice".into(), serde_json::Value::String(tp.to_string()));
        }
        if let Some(ta) = &self.trigger_amount {
            obj.insert("triggerAmount".into(), serde_json::Value::String(ta.to_string()));
        }
        if let Some(op) = self.operator_id {
            obj.insert("operatorId".into(), serde_json::Value::Number(op.into()));
        }
        body
    }

    /// Returns a copy with `amount` truncated to `decimals` (floor), used by
    /// the decimal-precision fallback in §4.E.4 / §4.F.4.
    pub fn with_amount_decimals(&self, decimals: u32) -> Self {
        let mut clone = self.clone();
        if let Some(a) = self.amount {
            clone.amount = Some(crate::precision::truncate_floor(a, decimals));
        }
        if let Some(ta) = self.trigger_amount {
            clone.trigger_amount = Some(crate::precision::truncate_floor(ta, decimals));
        }
        clone
    }
}

impl Clone for OrderRequest {
    fn clone(&self) -> Self {
        Self {
            market: self.market.clone(),
            side: self.side.clone(),
            order_type: self.order_type.clone(),
            amount: self.amount,
            amount_quote: self.amount_quote,
            price: self.price,
            time_in_force: self.time_in_force.clone(),
            post_only: self.post_only,
            trigger_price: self.trigger_price,
            trigger_amount: self.trigger_amount,
            operator_id: self.operator_id,
        }
    }
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_balance_eur(&mut self) -> Result<Decimal, PipelineError>;
    async fn get_last_price(&mut self, market: &str) -> Result<Decimal, PipelineError>;
    async fn place_order(&mut self, req: &OrderRequest) -> Result<OrderResponse, PipelineError>;
    async fn cancel_order(&mut self, market: &str, order_id: &str) -> Result<(), PipelineError>;

    /// Downcast hook for tests that need to inspect simulated state directly,
    /// test-only escape hatch to reach into the simulated exchange state.
    fn as_sim_mut(&mut self) -> Option<&mut SimExchange> {
        None
    }
}

pub struct BitvavoClient {
    base_url: String,
    signer: BitvavoSigner,
    client: reqwest::Client,
}

impl BitvavoClient {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.bitvavo.com/v2".to_string(),
            signer: BitvavoSigner::new(api_key, api_secret),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    fn headers(&self, method: &str, endpoint: &str, body: &str) -> reqwest::header::HeaderMap {
        let signed = self.signer.sign(method, endpoint, body);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("Content-Type", "application/json".parse().unwrap());
        headers.insert("Bitvavo-Access-Key", signed.key.parse().unwrap());
        headers.insert("Bitvavo-Access-Signature", signed.signature.parse().unwrap());
        headers.insert("Bitvavo-Access-Timestamp", signed.timestamp.parse().unwrap());
        headers.insert("Bitvavo-Access-Window", signed.window.parse().unwrap());
        headers
    }
}

#[async_trait]
impl ExchangeClient for BitvavoClient {
    async fn get_balance_eur(&mut self) -> Result<Decimal, PipelineError> {
        let endpoint = "/balance";
        let headers = self.headers("GET", endpoint, "");
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, endpoint))
            .headers(headers)
            .send()
            .await?;
        let entries: Vec<HashMap<String, String>> = resp.json().await?;
        let eur = entries
            .into_iter()
            .find(|e| e.get("symbol").map(|s| s == "EUR").unwrap_or(false))
            .and_then(|e| e.get("available").cloned())
            .and_then(|v| v.parse::<Decimal>().ok())
            .unwrap_or_default();
        Ok(eur)
    }

    async fn get_last_price(&mut self, market: &str) -> Result<Decimal, PipelineError> {
        let endpoint = format!("/ticker/price?market={}", market);
        let resp = self.client.get(format!("{}{}", self.base_url, endpoint)).send().await?;
        let body: HashMap<String, String> = resp.json().await?;
        body.get("price")
            .and_then(|v| v.parse::<Decimal>().ok())
            .ok_or_else(|| PipelineError::TransientIo(format!("no price for {}", market)))
    }

    async fn place_order(&mut self, req: &OrderRequest) -> Result<OrderResponse, PipelineError> {
        let endpoint = "/order";
        let body = req.to_body().to_string();
        let headers = self.headers("POST", endpoint, &body);
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let parsed: OrderResponse = resp.json().await?;
        Ok(parsed)
    }

    async fn cancel_order(&mut self, market: &str, order_id: &str) -> Result<(), PipelineError> {
        let endpoint = format!("/order?market={}&orderId={}", market, order_id);
        let headers = self.headers("DELETE", &endpoint, "");
        self.client
            .delete(format!("{}{}", self.base_url, endpoint))
            .headers(headers)
            .send()
            .await?;
        Ok(())
    }
}

/// In-memory test double for dry-run/unit-test use: accepts any order, and
/// can be configured to reject on a given decimal count to exercise the
/// precision-fallback path deterministically.
#[derive(Default)]
pub struct SimExchange {
    pub balance_eur: Decimal,
    pub last_prices: HashMap<String, Decimal>,
    pub orders_placed: Vec<OrderRequest>,
    pub reject_until_decimals: Option<u32>,
    next_order_id: u64,
}

impl SimExchange {
    pub fn new(balance_eur: Decimal) -> Self {
        Self {
            balance_eur,
            ..Default::default()
        }
    }

    pub fn set_price(&mut self, market: &str, price: Decimal) {
        self.last_prices.insert(market.to_string(), price);
    }
}

#[async_trait]
impl ExchangeClient for SimExchange {
    async fn get_balance_eur(&mut self) -> Result<Decimal, PipelineError> {
        Ok(self.balance_eur)
    }

    async fn get_last_price(&mut self, market: &str) -> Result<Decimal, PipelineError> {
        self.last_prices
            .get(market)
            .copied()
            .ok_or_else(|| PipelineError::TransientIo(format!("no simulated price for {}", market)))
    }

    async fn place_order(&mut self, req: &OrderRequest) -> Result<OrderResponse, PipelineError> {
        if let Some(min_decimals) = self.reject_until_decimals {
            let amount_decimals = req
                .amount
                .map(|a| a.scale())
                .unwrap_or(0);
            if amount_decimals > min_decimals {
                return Ok(OrderResponse {
                    order_id: String::new(),
                    market: req.market.clone(),
                    side: req.side.clone(),
                    order_type: req.order_type.clone(),
                    status: "rejected".to_string(),
                    fills: vec![],
                    error_code: Some(217),
                    error: Some(format!(
                        "Amount must be with {} decimal digits or less",
                        min_decimals
                    )),
                });
            }
        }
        self.next_order_id += 1;
        self.orders_placed.push(req.clone());
        let price = req
            .price
            .or_else(|| self.last_prices.get(&req.market).copied())
            .unwrap_or_default();
        let amount = req.amount.unwrap_or_default();
        Ok(OrderResponse {
            order_id: self.next_order_id.to_string(),
            market: req.market.clone(),
            side: req.side.clone(),
            order_type: req.order_type.clone(),
            status: "filled".to_string(),
            fills: vec![OrderFill { price, amount }],
            error_code: None,
            error: None,
        })
    }

    async fn cancel_order(&mut self, _market: &str, _order_id: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    fn as_sim_mut(&mut self) -> Option<&mut SimExchange> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn sim_exchange_fills_orders_at_the_simulated_price() {
        let mut sim = SimExchange::new(Decimal::from_str("1000").unwrap());
        sim.set_price("BTC-EUR", Decimal::from_str("50000").unwrap());
        let req = OrderRequest {
            market: "BTC-EUR".into(),
            side: "buy".into(),
            order_type: "market".into(),
            amount: Some(Decimal::from_str("0.01").unwrap()),
            amount_quote: None,
            price: None,
            time_in_force: None,
            post_only: false,
            trigger_price: None,
            trigger_amount: None,
            operator_id: None,
        };
        let resp = sim.place_order(&req).await.unwrap();
        assert_eq!(resp.status, "filled");
        assert_eq!(resp.fills[0].price, Decimal::from_str("50000").unwrap());
    }

    #[tokio::test]
    async fn sim_exchange_rejects_over_precise_amounts_until_truncated() {
        let mut sim = SimExchange::new(Decimal::from_str("1000").unwrap());
        sim.reject_until_decimals = Some(2);
        let req = OrderRequest {
            market: "BTC-EUR".into(),
            side: "sell".into(),
            order_type: "market".into(),
            amount: Some(Decimal::from_str("0.123456").unwrap()),
            amount_quote: None,
            price: None,
            time_in_force: None,
            post_only: false,
            trigger_price: None,
            trigger_amount: None,
            operator_id: None,
        };
        let rejected = sim.place_order(&req).await.unwrap();
        assert_eq!(rejected.status, "rejected");

        let retried = req.with_amount_decimals(2);
        let accepted = sim.place_order(&retried).await.unwrap();
        assert_eq!(accepted.status, "filled");
    }

    #[test]
    fn order_request_body_uses_amount_quote_for_market_buys() {
        let req = OrderRequest {
            market: "BTC-EUR".into(),
            side: "buy".into(),
            order_type: "market".into(),
            amount: None,
            amount_quote: Some(Decimal::from_str("50").unwrap()),
            price: None,
            time_in_force: None,
            post_only: false,
            trigger_price: None,
            trigger_amount: None,
            operator_id: Some(1702),
        };
        let body = req.to_body();
        assert_eq!(body["amountQuote"], "50");
        assert_eq!(body["operatorId"], 1702);
        assert!(body.get("amount").is_none());
    }
}
