// =============================================================================
// REST API Client — HMAC-SHA256 signed requests to the futures exchange
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the gateway and exchange servers.
//
// No retries happen here — callers choose their own retry policy per error
// code. Error bodies are mapped to the structured taxonomy before returning.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::errors::{GatewayError, GatewayResult};
use crate::exchange::errors::parse_exchange_error;
use crate::exchange::rate_limit::UsageMeter;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Native batch order cap per request.
pub const BATCH_ORDER_LIMIT: usize = 5;
/// Native batch cancel cap per request.
pub const BATCH_CANCEL_LIMIT: usize = 10;

/// Parameters for one new order (single or batch member).
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Exchange-raw symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// "BUY" or "SELL".
    pub side: String,
    /// "LIMIT" or "MARKET".
    pub order_type: String,
    pub quantity: f64,
    /// Required for LIMIT orders.
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    fn query_params(&self) -> String {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            self.symbol, self.side, self.order_type, self.quantity
        );
        if let Some(p) = self.price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if self.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if let Some(id) = &self.client_order_id {
            params.push_str(&format!("&newClientOrderId={id}"));
        }
        params
    }

    fn batch_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "symbol": self.symbol,
            "side": self.side,
            "type": self.order_type,
            "quantity": self.quantity.to_string(),
        });
        if let Some(p) = self.price {
            obj["price"] = serde_json::Value::String(p.to_string());
            obj["timeInForce"] = serde_json::Value::String("GTC".to_string());
        }
        if self.reduce_only {
            obj["reduceOnly"] = serde_json::Value::String("true".to_string());
        }
        if let Some(id) = &self.client_order_id {
            obj["newClientOrderId"] = serde_json::Value::String(id.clone());
        }
        obj
    }
}

/// Futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct RestClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    pub usage: Arc<UsageMeter>,
}

impl RestClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "RestClient initialised");

        Self {
            secret,
            base_url,
            client,
            usage: Arc::new(UsageMeter::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> GatewayResult<serde_json::Value> {
        if !self.usage.weight_allows(1) {
            return Err(GatewayError::ExchangeRejected(
                "request weight budget exhausted".into(),
            ));
        }
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .map_err(|e| GatewayError::ExchangeRejected(format!("{method} {path}: {e}")))?;

        self.usage.observe_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::ExchangeRejected(format!("{method} {path} body: {e}")))?;

        if !status.is_success() {
            let err = parse_exchange_error(&body);
            warn!(%status, path, code = err.code(), "exchange request rejected");
            return Err(err);
        }
        Ok(body)
    }

    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> GatewayResult<serde_json::Value> {
        let qs = self.signed_query(params);
        self.send(method, path, &qs).await
    }

    // -------------------------------------------------------------------------
    // Orders (signed)
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order — submit a new order.
    pub async fn place_order(&self, req: &OrderRequest) -> GatewayResult<serde_json::Value> {
        if !self.usage.order_allows() {
            return Err(GatewayError::ExchangeRejected(
                "local order rate limit reached".into(),
            ));
        }
        debug!(
            symbol = %req.symbol,
            side = %req.side,
            order_type = %req.order_type,
            quantity = req.quantity,
            price = ?req.price,
            reduce_only = req.reduce_only,
            "placing order"
        );
        self.usage.note_order_sent();
        let body = self
            .signed(reqwest::Method::POST, "/fapi/v1/order", &req.query_params())
            .await?;
        debug!(symbol = %req.symbol, order_id = body["orderId"].as_u64().unwrap_or(0), "order placed");
        Ok(body)
    }

    /// POST /fapi/v1/batchOrders — submit up to [`BATCH_ORDER_LIMIT`] orders
    /// in one request. Per-order outcomes come back positionally: an entry is
    /// either an order payload or an error body.
    pub async fn place_batch_orders(
        &self,
        requests: &[OrderRequest],
    ) -> GatewayResult<Vec<GatewayResult<serde_json::Value>>> {
        if requests.is_empty() || requests.len() > BATCH_ORDER_LIMIT {
            return Err(GatewayError::InvalidInput(format!(
                "batch size {} outside 1..={BATCH_ORDER_LIMIT}",
                requests.len()
            )));
        }
        if !self.usage.order_allows() {
            return Err(GatewayError::ExchangeRejected(
                "local order rate limit reached".into(),
            ));
        }

        let payload: Vec<serde_json::Value> = requests.iter().map(|r| r.batch_json()).collect();
        let json = serde_json::to_string(&payload)
            .map_err(|e| GatewayError::ExchangeRejected(format!("batch encode: {e}")))?;
        let params = format!("batchOrders={}", url_encode(&json));

        for _ in requests {
            self.usage.note_order_sent();
        }
        let body = self
            .signed(reqwest::Method::POST, "/fapi/v1/batchOrders", &params)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| GatewayError::ExchangeRejected("batch response not an array".into()))?;

        let results = entries
            .iter()
            .map(|entry| {
                if entry.get("code").and_then(|c| c.as_i64()).unwrap_or(0) < 0 {
                    Err(parse_exchange_error(entry))
                } else {
                    Ok(entry.clone())
                }
            })
            .collect();
        Ok(results)
    }

    /// DELETE /fapi/v1/order — cancel an existing order.
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> GatewayResult<serde_json::Value> {
        debug!(symbol, order_id, "cancelling order");
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await
    }

    /// DELETE /fapi/v1/batchOrders — cancel up to [`BATCH_CANCEL_LIMIT`]
    /// orders on one symbol. Per-order outcomes are positional.
    pub async fn cancel_batch_orders(
        &self,
        symbol: &str,
        order_ids: &[u64],
    ) -> GatewayResult<Vec<GatewayResult<serde_json::Value>>> {
        if order_ids.is_empty() || order_ids.len() > BATCH_CANCEL_LIMIT {
            return Err(GatewayError::InvalidInput(format!(
                "batch cancel size {} outside 1..={BATCH_CANCEL_LIMIT}",
                order_ids.len()
            )));
        }
        let list = serde_json::to_string(order_ids)
            .map_err(|e| GatewayError::ExchangeRejected(format!("batch cancel encode: {e}")))?;
        let params = format!("symbol={symbol}&orderIdList={}", url_encode(&list));

        debug!(symbol, count = order_ids.len(), "cancelling order batch");
        let body = self
            .signed(reqwest::Method::DELETE, "/fapi/v1/batchOrders", &params)
            .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| GatewayError::ExchangeRejected("batch cancel response not an array".into()))?;
        Ok(entries
            .iter()
            .map(|entry| {
                if entry.get("code").and_then(|c| c.as_i64()).unwrap_or(0) < 0 {
                    Err(parse_exchange_error(entry))
                } else {
                    Ok(entry.clone())
                }
            })
            .collect())
    }

    /// GET /fapi/v1/order — fetch one order's current state.
    pub async fn query_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> GatewayResult<serde_json::Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed(reqwest::Method::GET, "/fapi/v1/order", &params)
            .await
    }

    /// GET /fapi/v1/openOrders.
    pub async fn open_orders(&self, symbol: Option<&str>) -> GatewayResult<Vec<serde_json::Value>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// GET /fapi/v1/allOrders — every order for `symbol` since `since_ms`.
    pub async fn all_orders_since(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> GatewayResult<Vec<serde_json::Value>> {
        let params = format!("symbol={symbol}&startTime={since_ms}");
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v1/allOrders", &params)
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// GET /fapi/v1/userTrades.
    pub async fn user_trades(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> GatewayResult<Vec<serde_json::Value>> {
        let params = format!("symbol={symbol}&startTime={since_ms}");
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v1/userTrades", &params)
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Account (signed)
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/positionRisk — live exchange positions.
    pub async fn position_risk(&self) -> GatewayResult<Vec<serde_json::Value>> {
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    /// GET /fapi/v2/balance.
    pub async fn balance(&self) -> GatewayResult<Vec<serde_json::Value>> {
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v2/balance", "")
            .await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/ticker/24hr.
    pub async fn ticker_24h(&self, symbol: Option<&str>) -> GatewayResult<serde_json::Value> {
        let query = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        self.send(reqwest::Method::GET, "/fapi/v1/ticker/24hr", &query)
            .await
    }

    /// GET /fapi/v1/premiumIndex — mark price for `symbol`.
    pub async fn premium_index(&self, symbol: &str) -> GatewayResult<serde_json::Value> {
        let query = format!("symbol={symbol}");
        self.send(reqwest::Method::GET, "/fapi/v1/premiumIndex", &query)
            .await
    }

    /// GET /fapi/v1/exchangeInfo — full market metadata.
    pub async fn exchange_info(&self) -> GatewayResult<serde_json::Value> {
        self.send(reqwest::Method::GET, "/fapi/v1/exchangeInfo", "")
            .await
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Query-string encoding
// ---------------------------------------------------------------------------

/// Percent-encode a query value (RFC 3986 unreserved characters pass through).
/// The signature is computed over the encoded string, so encoding must happen
/// before signing.
pub fn url_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = RestClient::new("key", "secret", "https://example.invalid");
        let sig1 = client.sign("symbol=BTCUSDT&timestamp=1");
        let sig2 = client.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
        assert!(sig1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn order_request_builds_expected_query() {
        let req = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: "BUY".into(),
            order_type: "LIMIT".into(),
            quantity: 0.01,
            price: Some(50000.1),
            reduce_only: true,
            client_order_id: Some("helios-1".into()),
        };
        let q = req.query_params();
        assert!(q.contains("symbol=BTCUSDT"));
        assert!(q.contains("side=BUY"));
        assert!(q.contains("type=LIMIT"));
        assert!(q.contains("price=50000.1&timeInForce=GTC"));
        assert!(q.contains("reduceOnly=true"));
        assert!(q.contains("newClientOrderId=helios-1"));
    }

    #[test]
    fn market_order_query_omits_price_fields() {
        let req = OrderRequest {
            symbol: "ETHUSDT".into(),
            side: "SELL".into(),
            order_type: "MARKET".into(),
            quantity: 1.5,
            price: None,
            reduce_only: false,
            client_order_id: None,
        };
        let q = req.query_params();
        assert!(!q.contains("price"));
        assert!(!q.contains("timeInForce"));
        assert!(!q.contains("reduceOnly"));
    }

    #[test]
    fn url_encoding_covers_json_payloads() {
        assert_eq!(url_encode("abc-_.~"), "abc-_.~");
        assert_eq!(url_encode(r#"[{"a":1}]"#), "%5B%7B%22a%22%3A1%7D%5D");
    }

    #[tokio::test]
    async fn batch_cancel_enforces_the_ten_order_cap() {
        let client = RestClient::new("key", "secret", "https://localhost.invalid");
        let too_many: Vec<u64> = (0..11).collect();
        let err = client
            .cancel_batch_orders("BTCUSDT", &too_many)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        let err = client.cancel_batch_orders("BTCUSDT", &[]).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn batch_json_stringifies_numeric_fields() {
        let req = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: "BUY".into(),
            order_type: "LIMIT".into(),
            quantity: 0.01,
            price: Some(50000.0),
            reduce_only: false,
            client_order_id: None,
        };
        let json = req.batch_json();
        assert_eq!(json["quantity"], "0.01");
        assert_eq!(json["price"], "50000");
        assert_eq!(json["timeInForce"], "GTC");
    }
}
