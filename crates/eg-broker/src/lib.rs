//! Alpaca REST client for paper (and, with an explicit opt-in, live) trading.
//!
//! Thin wrapper over `reqwest::blocking`, used from inside the executor's
//! async runtime via `tokio::task::block_in_place` so a brokerage round trip
//! never needs its own tokio handle threaded through every call site.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://paper-api.alpaca.markets";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AlpacaClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl AlpacaClient {
    /// Builds a client against `base_url` (or the paper default). Refuses to
    /// construct against a non-paper URL unless `allow_live` is set, matching
    /// the original client's safety guard.
    pub fn new(
        api_key: &str,
        secret_key: &str,
        base_url: Option<&str>,
        allow_live: bool,
    ) -> Result<Self> {
        let base_url = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string();
        if !base_url.contains("paper") && !allow_live {
            bail!("non-paper URL requires explicit allow_live opt-in: {base_url}");
        }

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            reqwest::header::HeaderValue::from_str(api_key).context("invalid api key header")?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            reqwest::header::HeaderValue::from_str(secret_key).context("invalid secret key header")?,
        );

        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .context("failed to build alpaca http client")?;

        Ok(Self { base_url, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        json: Option<&serde_json::Value>,
        query: Option<&[(&str, &str)]>,
    ) -> Result<Option<serde_json::Value>> {
        let url = self.url(path);
        tokio::task::block_in_place(|| {
            let mut req = self.client.request(method, &url);
            if let Some(body) = json {
                req = req.json(body);
            }
            if let Some(q) = query {
                req = req.query(q);
            }
            let resp = req.send().with_context(|| format!("request failed: {url}"))?;
            let status = resp.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if status == reqwest::StatusCode::NO_CONTENT {
                return Ok(Some(serde_json::json!({})));
            }
            if !status.is_success() {
                let body = resp.text().unwrap_or_default();
                return Err(AlpacaApiError { status: status.as_u16(), body }.into());
            }
            let value = resp.json::<serde_json::Value>().context("invalid json response")?;
            Ok(Some(value))
        })
    }

    pub fn get_account(&self) -> Result<Account> {
        let value = self
            .request(reqwest::Method::GET, "/v2/account", None, None)?
            .context("account response missing")?;
        serde_json::from_value(value).context("invalid account payload")
    }

    pub fn get_positions(&self) -> Result<Vec<AlpacaPosition>> {
        let value = self
            .request(reqwest::Method::GET, "/v2/positions", None, None)?
            .context("positions response missing")?;
        serde_json::from_value(value).context("invalid positions payload")
    }

    pub fn get_clock(&self) -> Result<Clock> {
        let value = self
            .request(reqwest::Method::GET, "/v2/clock", None, None)?
            .context("clock response missing")?;
        serde_json::from_value(value).context("invalid clock payload")
    }

    #[allow(clippy::too_many_arguments)]
    pub fn place_order(&self, req: PlaceOrderRequest) -> Result<AlpacaOrder> {
        let mut payload = serde_json::json!({
            "symbol": req.symbol,
            "qty": req.qty.to_string(),
            "side": req.side,
            "type": req.order_type,
            "time_in_force": req.time_in_force,
        });
        let obj = payload.as_object_mut().expect("object literal");
        if let Some(id) = &req.client_order_id {
            obj.insert("client_order_id".into(), serde_json::json!(id));
        }
        if let Some(stop) = req.stop_price {
            obj.insert("stop_price".into(), serde_json::json!(stop.to_string()));
        }
        if let Some(class) = &req.order_class {
            obj.insert("order_class".into(), serde_json::json!(class));
        }
        if let Some(stop_loss_price) = req.stop_loss_price {
            obj.insert(
                "stop_loss".into(),
                serde_json::json!({ "stop_price": stop_loss_price.to_string() }),
            );
        }

        let value = self
            .request(reqwest::Method::POST, "/v2/orders", Some(&payload), None)?
            .context("order response missing")?;
        serde_json::from_value(value).context("invalid order payload")
    }

    /// OTO bracket: market buy/sell parent plus a stop-loss leg. Callers
    /// should fall back to a plain `place_order` if this fails.
    pub fn place_bracket_order(
        &self,
        symbol: &str,
        qty: u64,
        side: Side,
        time_in_force: &str,
        stop_price: f64,
        client_order_id: Option<&str>,
    ) -> Result<AlpacaOrder> {
        self.place_order(PlaceOrderRequest {
            symbol: symbol.to_string(),
            qty,
            side,
            order_type: OrderType::Market,
            time_in_force: time_in_force.to_string(),
            client_order_id: client_order_id.map(str::to_string),
            stop_price: None,
            order_class: Some("bracket".to_string()),
            stop_loss_price: Some(stop_price),
        })
    }

    pub fn get_order(&self, order_id: &str) -> Result<AlpacaOrder> {
        let value = self
            .request(reqwest::Method::GET, &format!("/v2/orders/{order_id}"), None, None)?
            .with_context(|| format!("order {order_id} not found"))?;
        serde_json::from_value(value).context("invalid order payload")
    }

    /// Returns `None` on a 404, matching the original client's behaviour
    /// instead of propagating a not-found error.
    pub fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<AlpacaOrder>> {
        let value = self.request(
            reqwest::Method::GET,
            "/v2/orders:by_client_order_id",
            None,
            Some(&[("client_order_id", client_order_id)]),
        )?;
        value.map(serde_json::from_value).transpose().context("invalid order payload")
    }

    /// Cancels a working order. Alpaca answers an already-filled order with a
    /// 422 rather than a clean cancel, which this surfaces as
    /// `CancelOutcome::AlreadyFilled` instead of an error so callers can fall
    /// through to treating the fill as authoritative.
    pub fn cancel_order(&self, order_id: &str) -> Result<CancelOutcome> {
        match self.request(reqwest::Method::DELETE, &format!("/v2/orders/{order_id}"), None, None) {
            Ok(_) => Ok(CancelOutcome::Cancelled),
            Err(err) => match err.downcast_ref::<AlpacaApiError>() {
                Some(api_err) if api_err.already_filled() => Ok(CancelOutcome::AlreadyFilled),
                _ => Err(err),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFilled,
}

/// A non-2xx Alpaca response, with the body preserved so callers can inspect
/// it for conditions the status code alone doesn't distinguish (e.g. an
/// already-filled order rejecting a cancel with 422).
#[derive(Debug)]
pub struct AlpacaApiError {
    pub status: u16,
    pub body: String,
}

impl AlpacaApiError {
    pub fn already_filled(&self) -> bool {
        self.status == 422 && self.body.to_lowercase().contains("filled")
    }
}

impl std::fmt::Display for AlpacaApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "alpaca api error {}: {}", self.status, self.body)
    }
}

impl std::error::Error for AlpacaApiError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Stop,
}

pub struct PlaceOrderRequest {
    pub symbol: String,
    pub qty: u64,
    pub side: Side,
    pub order_type: OrderType,
    pub time_in_force: String,
    pub client_order_id: Option<String>,
    pub stop_price: Option<f64>,
    pub order_class: Option<String>,
    pub stop_loss_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    #[serde(deserialize_with = "deserialize_str_f64")]
    pub buying_power: f64,
    #[serde(deserialize_with = "deserialize_str_f64")]
    pub cash: f64,
    #[serde(deserialize_with = "deserialize_str_f64")]
    pub equity: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaPosition {
    pub symbol: String,
    #[serde(deserialize_with = "deserialize_str_f64")]
    pub qty: f64,
    #[serde(deserialize_with = "deserialize_str_f64")]
    pub avg_entry_price: f64,
    #[serde(deserialize_with = "deserialize_str_f64")]
    pub unrealized_pl: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Clock {
    pub is_open: bool,
    pub timestamp: DateTime<Utc>,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaOrderLeg {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaOrder {
    pub id: String,
    pub client_order_id: Option<String>,
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_opt_str_f64")]
    pub filled_avg_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_str_u64")]
    pub filled_qty: u64,
    #[serde(default, deserialize_with = "deserialize_opt_str_u64")]
    pub qty: Option<u64>,
    #[serde(default)]
    pub legs: Option<Vec<AlpacaOrderLeg>>,
    #[serde(default)]
    pub reject_reason: Option<String>,
}

impl AlpacaOrder {
    pub fn is_filled(&self) -> bool {
        self.status == "filled"
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "filled" | "canceled" | "expired" | "rejected" | "done_for_day" | "suspended"
        )
    }
}

fn deserialize_str_f64<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn deserialize_opt_str_f64<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(d)?;
    s.map(|v| v.parse().map_err(serde::de::Error::custom)).transpose()
}

fn deserialize_str_u64<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(d)?;
    Ok(s.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn deserialize_opt_str_u64<'de, D>(d: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(d)?;
    Ok(s.and_then(|v| v.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_non_paper_url_without_allow_live() {
        let err = AlpacaClient::new("key", "secret", Some("https://api.alpaca.markets"), false)
            .unwrap_err();
        assert!(err.to_string().contains("allow_live"));
    }

    #[test]
    fn accepts_non_paper_url_with_allow_live() {
        AlpacaClient::new("key", "secret", Some("https://api.alpaca.markets"), true).unwrap();
    }

    #[test]
    fn accepts_default_paper_url() {
        AlpacaClient::new("key", "secret", None, false).unwrap();
    }

    #[test]
    fn order_terminal_status_classification() {
        let mut order = AlpacaOrder {
            id: "1".into(),
            client_order_id: None,
            status: "accepted".into(),
            filled_avg_price: None,
            filled_qty: 0,
            qty: Some(10),
            legs: None,
            reject_reason: None,
        };
        assert!(!order.is_terminal());
        order.status = "filled".into();
        assert!(order.is_terminal());
        assert!(order.is_filled());
    }

    #[test]
    fn already_filled_detects_422_with_filled_in_body() {
        let err = AlpacaApiError { status: 422, body: r#"{"message":"order already in filled state"}"#.into() };
        assert!(err.already_filled());
    }

    #[test]
    fn already_filled_false_for_other_422_bodies() {
        let err = AlpacaApiError { status: 422, body: r#"{"message":"insufficient qty available"}"#.into() };
        assert!(!err.already_filled());
    }

    #[test]
    fn already_filled_false_for_non_422_status() {
        let err = AlpacaApiError { status: 404, body: "filled".into() };
        assert!(!err.already_filled());
    }
}
