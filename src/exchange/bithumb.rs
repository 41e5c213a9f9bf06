//! Bithumb adapter
//!
//! Exposes two signed request paths against the same venue:
//! - legacy: HMAC-SHA512 over `endpoint \x00 body \x00 nonce`, hex digest
//!   Base64-wrapped into the `Api-Sign` header, underscore-joined symbols
//! - REST: HS256 JWT bearer auth with an optional SHA512 query hash,
//!   dash-separated market ids
//!
//! `prefer_rest` picks the primary path; on a transient failure with
//! failover enabled the same logical operation is retried exactly once on
//! the alternate path. Nonces are adjusted by an amortized clock-skew
//! offset sampled from the venue's public ticker timestamp.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256, Sha512};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BithumbSettings, BotSettings};

use super::{
    error_from_status, Balance, ExchangeAdapter, ExchangeError, ExchangeResult, OpenOrder,
    OrderResult, Quote, Side,
};

type HmacSha512 = Hmac<Sha512>;
type HmacSha256 = Hmac<Sha256>;

/// Re-sync the clock offset at most this often
const CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// The venue starts rejecting nonces around this much drift
const DRIFT_WARN_MS: i64 = 5_000;

/// Throttle for repeated drift warnings
const DRIFT_WARN_EVERY: Duration = Duration::from_secs(60);

const QUOTE_TIMEOUT: Duration = Duration::from_secs(5);
const ORDER_TIMEOUT: Duration = Duration::from_secs(7);

/// Which of the two signed request paths to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiPath {
    Legacy,
    Rest,
}

impl ApiPath {
    fn alternate(self) -> Self {
        match self {
            ApiPath::Legacy => ApiPath::Rest,
            ApiPath::Rest => ApiPath::Legacy,
        }
    }
}

/// Retry plan for one logical operation: TryPrimary -> TryAlternate -> Fail
#[derive(Debug, Clone, Copy)]
struct FailoverPlan {
    primary: ApiPath,
    enabled: bool,
    on_alternate: bool,
}

impl FailoverPlan {
    fn new(primary: ApiPath, enabled: bool) -> Self {
        Self {
            primary,
            enabled,
            on_alternate: false,
        }
    }

    fn path(&self) -> ApiPath {
        if self.on_alternate {
            self.primary.alternate()
        } else {
            self.primary
        }
    }

    /// Move to the alternate path if this failure allows it. Returns false
    /// when the operation must surface the error instead.
    fn advance(&mut self, err: &ExchangeError) -> bool {
        if self.on_alternate || !self.enabled || !err.is_failover_eligible() {
            return false;
        }
        self.on_alternate = true;
        true
    }
}

/// Bithumb venue adapter with dual-path failover
pub struct BithumbAdapter {
    client: reqwest::Client,
    settings: BithumbSettings,
    bot: BotSettings,
    clock_offset_ms: i64,
    last_clock_sync: Option<Instant>,
    last_drift_warning: Option<Instant>,
}

impl BithumbAdapter {
    pub fn new(settings: BithumbSettings, bot: BotSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            bot,
            clock_offset_ms: 0,
            last_clock_sync: None,
            last_drift_warning: None,
        }
    }

    fn primary_path(&self) -> ApiPath {
        if self.settings.prefer_rest {
            ApiPath::Rest
        } else {
            ApiPath::Legacy
        }
    }

    fn plan(&self) -> FailoverPlan {
        FailoverPlan::new(self.primary_path(), self.settings.enable_failover)
    }

    fn base_url(&self, path: ApiPath) -> &str {
        match path {
            ApiPath::Legacy => self.settings.base_url.trim_end_matches('/'),
            ApiPath::Rest => self.settings.rest_base_url.trim_end_matches('/'),
        }
    }

    /// Legacy ticker symbol: `USDT_KRW`
    fn legacy_symbol(&self) -> String {
        self.bot.symbol_ticker()
    }

    /// REST market id: `KRW-USDT` (separator and case per config)
    fn rest_market_id(&self) -> String {
        let sep = if self.settings.rest_symbol_dash { "-" } else { "" };
        let market = format!(
            "{}{}{}",
            self.bot.payment_currency, sep, self.bot.order_currency
        );
        if self.settings.rest_symbol_upper {
            market.to_uppercase()
        } else {
            market.to_lowercase()
        }
    }

    /// Clock-adjusted nonce in milliseconds
    fn nonce_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_offset_ms
    }

    // ------------------------------------------------------------------
    // Clock-skew compensation
    // ------------------------------------------------------------------

    /// Lazily re-sync the clock offset inside the polling step. Failures
    /// keep the previous offset; the quote itself is unaffected.
    async fn maybe_sync_clock(&mut self) {
        let due = match self.last_clock_sync {
            None => true,
            Some(at) => at.elapsed() >= CLOCK_SYNC_INTERVAL,
        };
        if !due {
            return;
        }
        match self.fetch_server_time_ms().await {
            Ok(remote_ms) => {
                let local_ms = Utc::now().timestamp_millis();
                self.clock_offset_ms = remote_ms - local_ms;
                self.last_clock_sync = Some(Instant::now());
                debug!(offset_ms = self.clock_offset_ms, "clock synced");
                self.warn_on_drift();
            }
            Err(err) => {
                warn!(error = %err, "clock sync failed, keeping previous offset");
                // back off the retry so a flapping endpoint is not hammered
                self.last_clock_sync = Some(Instant::now());
            }
        }
    }

    fn warn_on_drift(&mut self) {
        if self.clock_offset_ms.abs() < DRIFT_WARN_MS {
            return;
        }
        let throttled = self
            .last_drift_warning
            .is_some_and(|at| at.elapsed() < DRIFT_WARN_EVERY);
        if throttled {
            return;
        }
        warn!(
            offset_ms = self.clock_offset_ms,
            "system clock drifts beyond the venue's nonce tolerance; check NTP"
        );
        self.last_drift_warning = Some(Instant::now());
    }

    /// Unauthenticated server time from the public ticker
    async fn fetch_server_time_ms(&self) -> ExchangeResult<i64> {
        let url = format!(
            "{}/public/ticker/{}",
            self.base_url(ApiPath::Legacy),
            self.legacy_symbol()
        );
        let payload = self.get_json(&url, QUOTE_TIMEOUT).await?;
        as_i64(&payload["data"]["date"])
            .ok_or_else(|| ExchangeError::Unknown("ticker has no server timestamp".into()))
    }

    // ------------------------------------------------------------------
    // Signing
    // ------------------------------------------------------------------

    /// v1-style HMAC headers: signature is the hex digest of
    /// HMAC-SHA512(secret, endpoint \x00 query \x00 nonce), Base64-wrapped
    fn legacy_headers(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<Vec<(&'static str, String)>> {
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let nonce = self.nonce_ms().to_string();
        let payload = format!("{endpoint}\x00{query}\x00{nonce}");

        let mut mac = HmacSha512::new_from_slice(self.settings.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("invalid API secret: {e}")))?;
        mac.update(payload.as_bytes());
        let signature = STANDARD.encode(hex::encode(mac.finalize().into_bytes()));

        Ok(vec![
            ("Api-Key", self.settings.api_key.clone()),
            ("Api-Nonce", nonce),
            ("Api-Sign", signature),
        ])
    }

    /// v2-style HS256 JWT bearer header; params are hashed into the claim
    /// set with SHA512 when present
    fn jwt_header(&self, params: &[(&str, String)]) -> ExchangeResult<String> {
        let mut claims = json!({
            "access_key": self.settings.api_key,
            "nonce": Uuid::new_v4().to_string(),
            "timestamp": self.nonce_ms(),
        });
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&");
            let mut hasher = Sha512::new();
            hasher.update(query.as_bytes());
            claims["query_hash"] = json!(hex::encode(hasher.finalize()));
            claims["query_hash_alg"] = json!("SHA512");
        }

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let signing_input = format!("{header}.{body}");

        let mut mac = HmacSha256::new_from_slice(self.settings.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(format!("invalid API secret: {e}")))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("Bearer {signing_input}.{signature}"))
    }

    // ------------------------------------------------------------------
    // HTTP helpers
    // ------------------------------------------------------------------

    async fn get_json(&self, url: &str, timeout: Duration) -> ExchangeResult<Value> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        Self::read_json(response).await
    }

    async fn read_json(response: reqwest::Response) -> ExchangeResult<Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_status(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Unknown(format!("invalid JSON response: {e}")))
    }

    /// Signed form POST on the legacy path
    async fn legacy_post(
        &self,
        endpoint: &str,
        params: Vec<(&str, String)>,
    ) -> ExchangeResult<Value> {
        let headers = self.legacy_headers(endpoint, &params)?;
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url(ApiPath::Legacy), endpoint))
            .timeout(ORDER_TIMEOUT)
            .form(&params);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let payload = Self::read_json(request.send().await?).await?;
        check_legacy_status(&payload)?;
        Ok(payload)
    }

    async fn rest_request(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> ExchangeResult<Value> {
        // the JWT hash covers whichever parameter set is sent
        let hashed: Vec<(&str, String)> = if let Some(body) = body {
            body.as_object()
                .map(|map| {
                    map.iter()
                        .map(|(k, v)| (k.as_str(), value_as_param(v)))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            query.to_vec()
        };
        // serde_json object iteration is key-sorted, matching the hash the
        // venue computes over the canonical query string
        let auth = self.jwt_header(&hashed)?;

        let mut request = self
            .client
            .request(
                method,
                format!("{}{}", self.base_url(ApiPath::Rest), endpoint),
            )
            .timeout(ORDER_TIMEOUT)
            .header("Authorization", auth);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Self::read_json(request.send().await?).await
    }

    // ------------------------------------------------------------------
    // Per-path operations
    // ------------------------------------------------------------------

    async fn quote_on(&self, path: ApiPath) -> ExchangeResult<Quote> {
        match path {
            ApiPath::Legacy => {
                let url = format!(
                    "{}/public/ticker/{}",
                    self.base_url(ApiPath::Legacy),
                    self.legacy_symbol()
                );
                let payload = self.get_json(&url, QUOTE_TIMEOUT).await?;
                let data = &payload["data"];
                Ok(Quote {
                    price: as_f64(&data["closing_price"]),
                    volume_24h: as_f64(&data["units_traded_24H"]),
                    timestamp: Utc::now(),
                })
            }
            ApiPath::Rest => {
                let url = format!(
                    "{}/v1/ticker?markets={}",
                    self.base_url(ApiPath::Rest),
                    self.rest_market_id()
                );
                let payload = self.get_json(&url, QUOTE_TIMEOUT).await?;
                let item = payload
                    .as_array()
                    .and_then(|rows| rows.first())
                    .ok_or_else(|| ExchangeError::Unknown("empty ticker response".into()))?;
                Ok(Quote {
                    price: as_f64(&item["trade_price"]),
                    volume_24h: as_f64(&item["acc_trade_volume_24h"]),
                    timestamp: Utc::now(),
                })
            }
        }
    }

    async fn place_on(
        &self,
        path: ApiPath,
        side: Side,
        qty: f64,
        price: f64,
    ) -> ExchangeResult<OrderResult> {
        let order_type = match side {
            Side::Buy => "bid",
            Side::Sell => "ask",
        };
        match path {
            ApiPath::Legacy => {
                let params = vec![
                    ("order_currency", self.bot.order_currency.clone()),
                    ("payment_currency", self.bot.payment_currency.clone()),
                    ("units", format!("{qty:.8}")),
                    ("price", format!("{}", price.round() as i64)),
                    ("type", order_type.to_string()),
                ];
                let payload = self.legacy_post("/trade/place", params).await?;
                let order_id = payload["order_id"].as_str().unwrap_or_default().to_string();
                if order_id.is_empty() {
                    return Err(ExchangeError::Unknown("order accepted without id".into()));
                }
                Ok(OrderResult { order_id })
            }
            ApiPath::Rest => {
                let body = json!({
                    "market": self.rest_market_id(),
                    "side": order_type,
                    "volume": format!("{qty:.8}"),
                    "price": format!("{}", price.round() as i64),
                    "ord_type": "limit",
                });
                let payload = self
                    .rest_request(reqwest::Method::POST, "/v1/orders", &[], Some(&body))
                    .await?;
                match payload["uuid"].as_str() {
                    Some(uuid) => Ok(OrderResult {
                        order_id: uuid.to_string(),
                    }),
                    None => Err(ExchangeError::Rejected(payload.to_string())),
                }
            }
        }
    }

    async fn cancel_on(&self, path: ApiPath, order_id: &str, side: Side) -> ExchangeResult<()> {
        match path {
            ApiPath::Legacy => {
                let params = vec![
                    ("order_currency", self.bot.order_currency.clone()),
                    ("payment_currency", self.bot.payment_currency.clone()),
                    ("order_id", order_id.to_string()),
                    (
                        "type",
                        match side {
                            Side::Buy => "bid".to_string(),
                            Side::Sell => "ask".to_string(),
                        },
                    ),
                ];
                self.legacy_post("/trade/cancel", params).await?;
                Ok(())
            }
            ApiPath::Rest => {
                let body = json!({ "uuid": order_id });
                let payload = self
                    .rest_request(reqwest::Method::DELETE, "/v1/order", &[], Some(&body))
                    .await?;
                if payload["uuid"].as_str().is_some() {
                    Ok(())
                } else {
                    Err(ExchangeError::Rejected(payload.to_string()))
                }
            }
        }
    }

    async fn balance_on(&self, path: ApiPath) -> ExchangeResult<Balance> {
        match path {
            ApiPath::Legacy => {
                let params = vec![("currency", self.bot.order_currency.clone())];
                let payload = self.legacy_post("/info/balance", params).await?;
                let data = &payload["data"];
                let cash_key = format!("available_{}", self.bot.payment_currency.to_lowercase());
                let asset_key = format!("available_{}", self.bot.order_currency.to_lowercase());
                Ok(Balance {
                    cash: as_f64(&data[cash_key.as_str()]),
                    asset: as_f64(&data[asset_key.as_str()]),
                })
            }
            ApiPath::Rest => {
                let payload = self
                    .rest_request(reqwest::Method::GET, "/v1/accounts", &[], None)
                    .await?;
                let rows = payload
                    .as_array()
                    .ok_or_else(|| ExchangeError::Unknown("accounts response not a list".into()))?;
                let mut balance = Balance {
                    cash: 0.0,
                    asset: 0.0,
                };
                for row in rows {
                    let currency = row["currency"].as_str().unwrap_or_default();
                    if currency.eq_ignore_ascii_case(&self.bot.payment_currency) {
                        balance.cash = as_f64(&row["balance"]);
                    } else if currency.eq_ignore_ascii_case(&self.bot.order_currency) {
                        balance.asset = as_f64(&row["balance"]);
                    }
                }
                Ok(balance)
            }
        }
    }

    async fn open_orders_on(&self, path: ApiPath) -> ExchangeResult<Vec<OpenOrder>> {
        match path {
            ApiPath::Legacy => {
                let params = vec![
                    ("order_currency", self.bot.order_currency.clone()),
                    ("payment_currency", self.bot.payment_currency.clone()),
                ];
                let payload = match self.legacy_post("/info/orders", params).await {
                    Ok(payload) => payload,
                    // the venue answers "no orders" as a non-zero status
                    Err(ExchangeError::Rejected(_)) => return Ok(Vec::new()),
                    Err(err) => return Err(err),
                };
                let rows = payload["data"].as_array().cloned().unwrap_or_default();
                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        Some(OpenOrder {
                            order_id: row["order_id"].as_str()?.to_string(),
                            side: side_from_order_type(row["type"].as_str().unwrap_or("bid")),
                        })
                    })
                    .collect())
            }
            ApiPath::Rest => {
                let query = vec![
                    ("market", self.rest_market_id()),
                    ("state", "wait".to_string()),
                    ("limit", "100".to_string()),
                ];
                let payload = self
                    .rest_request(reqwest::Method::GET, "/v1/orders", &query, None)
                    .await?;
                let rows = payload.as_array().cloned().unwrap_or_default();
                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        Some(OpenOrder {
                            order_id: row["uuid"].as_str()?.to_string(),
                            side: side_from_order_type(row["side"].as_str().unwrap_or("bid")),
                        })
                    })
                    .collect())
            }
        }
    }
}

fn side_from_order_type(order_type: &str) -> Side {
    if order_type.eq_ignore_ascii_case("bid") {
        Side::Buy
    } else {
        Side::Sell
    }
}

/// Legacy responses carry success/failure in a `status` field
fn check_legacy_status(payload: &Value) -> ExchangeResult<()> {
    let status = payload["status"].as_str().unwrap_or_default();
    if status == "0000" {
        return Ok(());
    }
    let message = payload["message"]
        .as_str()
        .map(|m| format!("{status}: {m}"))
        .unwrap_or_else(|| format!("status {status}"));
    match status {
        // invalid key / signature / nonce family
        "5100" | "5200" | "5300" | "5302" => Err(ExchangeError::Auth(message)),
        _ => Err(ExchangeError::Rejected(message)),
    }
}

/// Numeric fields arrive as strings on the legacy path
fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ExchangeAdapter for BithumbAdapter {
    fn venue(&self) -> &'static str {
        "bithumb"
    }

    async fn get_quote(&mut self) -> ExchangeResult<Quote> {
        // amortized clock sync rides along with quote polling
        self.maybe_sync_clock().await;

        let mut plan = self.plan();
        loop {
            match self.quote_on(plan.path()).await {
                Ok(quote) => return Ok(quote),
                Err(err) if plan.advance(&err) => {
                    warn!(error = %err, retry_path = ?plan.path(), "quote failed, trying alternate path");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn place_order(
        &mut self,
        side: Side,
        qty: f64,
        price: f64,
    ) -> ExchangeResult<OrderResult> {
        if self.bot.dry_run {
            let order_id = format!("dry-{}", Uuid::new_v4().simple());
            info!(side = side.as_str(), qty, price, order_id, "dry-run order");
            return Ok(OrderResult { order_id });
        }

        let mut plan = self.plan();
        loop {
            match self.place_on(plan.path(), side, qty, price).await {
                Ok(result) => return Ok(result),
                Err(err) if plan.advance(&err) => {
                    warn!(error = %err, retry_path = ?plan.path(), "order failed, trying alternate path");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn cancel_order(&mut self, order_id: &str, side: Side) -> ExchangeResult<()> {
        if self.bot.dry_run {
            return Ok(());
        }

        let mut plan = self.plan();
        loop {
            match self.cancel_on(plan.path(), order_id, side).await {
                Ok(()) => return Ok(()),
                Err(err) if plan.advance(&err) => {
                    warn!(error = %err, retry_path = ?plan.path(), "cancel failed, trying alternate path");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_balance(&mut self) -> ExchangeResult<Balance> {
        if self.bot.dry_run {
            // a simulated account never runs out of funds
            return Ok(Balance {
                cash: f64::INFINITY,
                asset: 0.0,
            });
        }

        let mut plan = self.plan();
        loop {
            match self.balance_on(plan.path()).await {
                Ok(balance) => return Ok(balance),
                Err(err) if plan.advance(&err) => {
                    warn!(error = %err, retry_path = ?plan.path(), "balance failed, trying alternate path");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_open_orders(&mut self) -> ExchangeResult<Vec<OpenOrder>> {
        if self.bot.dry_run {
            return Ok(Vec::new());
        }

        let mut plan = self.plan();
        loop {
            match self.open_orders_on(plan.path()).await {
                Ok(orders) => return Ok(orders),
                Err(err) if plan.advance(&err) => {
                    warn!(error = %err, retry_path = ?plan.path(), "open-orders failed, trying alternate path");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn round_price(&self, price: f64) -> f64 {
        // KRW quotes trade in whole won
        price.round()
    }

    fn round_quantity(&self, qty: f64) -> f64 {
        (qty * 1e8).floor() / 1e8
    }

    fn min_notional(&self) -> f64 {
        5_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(prefer_rest: bool, enable_failover: bool) -> BithumbAdapter {
        BithumbAdapter::new(
            BithumbSettings {
                api_key: "key".into(),
                api_secret: "secret".into(),
                prefer_rest,
                enable_failover,
                ..BithumbSettings::default()
            },
            BotSettings::default(),
        )
    }

    #[test]
    fn test_failover_plan_advances_once() {
        let mut plan = FailoverPlan::new(ApiPath::Legacy, true);
        assert_eq!(plan.path(), ApiPath::Legacy);

        let err = ExchangeError::Network("500".into());
        assert!(plan.advance(&err));
        assert_eq!(plan.path(), ApiPath::Rest);

        // exactly one retry
        assert!(!plan.advance(&err));
    }

    #[test]
    fn test_failover_disabled_never_advances() {
        let mut plan = FailoverPlan::new(ApiPath::Legacy, false);
        assert!(!plan.advance(&ExchangeError::Network("500".into())));
        assert_eq!(plan.path(), ApiPath::Legacy);
    }

    #[test]
    fn test_failover_skips_non_transient_errors() {
        let mut plan = FailoverPlan::new(ApiPath::Rest, true);
        assert!(!plan.advance(&ExchangeError::Auth("bad key".into())));
        assert!(!plan.advance(&ExchangeError::Rejected("min notional".into())));
        assert!(plan.advance(&ExchangeError::Unknown("???".into())));
    }

    #[test]
    fn test_primary_path_follows_prefer_rest() {
        assert_eq!(adapter(false, true).primary_path(), ApiPath::Legacy);
        assert_eq!(adapter(true, true).primary_path(), ApiPath::Rest);
    }

    #[test]
    fn test_symbol_formats_per_path() {
        let adapter = adapter(false, true);
        assert_eq!(adapter.legacy_symbol(), "USDT_KRW");
        assert_eq!(adapter.rest_market_id(), "KRW-USDT");
    }

    #[test]
    fn test_legacy_headers_shape() {
        let adapter = adapter(false, true);
        let headers = adapter
            .legacy_headers("/trade/place", &[("units", "1.0".to_string())])
            .unwrap();
        let names: Vec<&str> = headers.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["Api-Key", "Api-Nonce", "Api-Sign"]);

        // signature is Base64 over a hex digest; hex of SHA-512 is 128 chars
        let sign = &headers[2].1;
        let decoded = STANDARD.decode(sign).unwrap();
        assert_eq!(decoded.len(), 128);
        assert!(decoded.iter().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_jwt_header_is_three_segments() {
        let adapter = adapter(true, true);
        let auth = adapter
            .jwt_header(&[("market", "KRW-USDT".to_string())])
            .unwrap();
        let token = auth.strip_prefix("Bearer ").unwrap();
        let segments: Vec<&str> = token.split('.').collect();
        assert_eq!(segments.len(), 3);

        let claims: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[1]).unwrap()).unwrap();
        assert_eq!(claims["access_key"], "key");
        assert_eq!(claims["query_hash_alg"], "SHA512");
        assert_eq!(claims["query_hash"].as_str().unwrap().len(), 128);
    }

    #[test]
    fn test_nonce_uses_clock_offset() {
        let mut adapter = adapter(false, true);
        adapter.clock_offset_ms = 7_500;
        let skewed = adapter.nonce_ms();
        let local = Utc::now().timestamp_millis();
        assert!((skewed - local - 7_500).abs() < 1_000);
    }

    #[test]
    fn test_legacy_status_mapping() {
        assert!(check_legacy_status(&json!({"status": "0000"})).is_ok());
        let auth = check_legacy_status(&json!({"status": "5300", "message": "Invalid Apikey"}));
        assert!(matches!(auth, Err(ExchangeError::Auth(_))));
        let rejected = check_legacy_status(&json!({"status": "5600", "message": "insufficient"}));
        assert!(matches!(rejected, Err(ExchangeError::Rejected(_))));
    }

    #[test]
    fn test_string_numbers_parse() {
        assert_eq!(as_f64(&json!("1500.5")), 1500.5);
        assert_eq!(as_f64(&json!(1500.5)), 1500.5);
        assert_eq!(as_f64(&json!(null)), 0.0);
        assert_eq!(as_i64(&json!("1700000000000")), Some(1_700_000_000_000));
    }

    #[test]
    fn test_quantity_rounds_down() {
        let adapter = adapter(false, true);
        assert_eq!(adapter.round_quantity(1.234567899), 1.23456789);
        assert_eq!(adapter.round_price(1499.6), 1500.0);
    }

    #[tokio::test]
    async fn test_dry_run_short_circuits_orders() {
        let mut adapter = adapter(false, true);
        adapter.bot.dry_run = true;
        let result = adapter.place_order(Side::Buy, 1.0, 1500.0).await.unwrap();
        assert!(result.order_id.starts_with("dry-"));
        assert!(adapter.get_open_orders().await.unwrap().is_empty());
        assert!(adapter.cancel_order("dry-x", Side::Buy).await.is_ok());
    }

    /// Loopback responder answering every request with one fixed response
    async fn serve_json(status_line: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\n\
                         content-type: application/json\r\n\
                         content-length: {}\r\n\
                         connection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_quote_fails_over_to_alternate_path() {
        let legacy = serve_json("500 Internal Server Error", r#"{"status":"5500"}"#).await;
        let rest = serve_json(
            "200 OK",
            r#"[{"market":"KRW-USDT","trade_price":1500.5,"acc_trade_volume_24h":987.5,"timestamp":1700000000000}]"#,
        )
        .await;

        let mut adapter = adapter(false, true);
        adapter.settings.base_url = legacy;
        adapter.settings.rest_base_url = rest;

        // primary (legacy) answers 500, the same operation succeeds on REST
        let quote = adapter.get_quote().await.unwrap();
        assert_eq!(quote.price, 1500.5);
        assert_eq!(quote.volume_24h, 987.5);
    }

    #[tokio::test]
    async fn test_quote_failure_surfaces_when_failover_disabled() {
        let legacy = serve_json("500 Internal Server Error", "{}").await;

        let mut adapter = adapter(false, false);
        adapter.settings.base_url = legacy.clone();
        adapter.settings.rest_base_url = legacy;

        let err = adapter.get_quote().await.unwrap_err();
        assert!(matches!(err, ExchangeError::Network(_)));
    }
}
