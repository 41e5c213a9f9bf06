//! KIS overseas-equity adapter
//!
//! Korea Investment & Securities exposes one REST surface for paper and
//! live trading; the two differ only in base URL and transaction id
//! (`tr_id`) codes. Requests carry an OAuth2 bearer token that is fetched
//! lazily and refreshed shortly before expiry, and order bodies are
//! integrity-stamped with a venue-issued hashkey.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::KisSettings;

use super::{
    error_from_status, Balance, ExchangeAdapter, ExchangeError, ExchangeResult, OpenOrder,
    OrderResult, Quote, Side,
};

/// Refresh the token this long before the venue expires it
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(7);

/// Per-environment transaction id codes
struct TrIds {
    buy: &'static str,
    sell: &'static str,
    cancel: &'static str,
    balance: &'static str,
    open_orders: &'static str,
}

const LIVE_TR_IDS: TrIds = TrIds {
    buy: "TTTT1002U",
    sell: "TTTT1006U",
    cancel: "TTTT1004U",
    balance: "TTTS3012R",
    open_orders: "TTTS3018R",
};

const PAPER_TR_IDS: TrIds = TrIds {
    buy: "VTTT1002U",
    sell: "VTTT1001U",
    cancel: "VTTT1004U",
    balance: "VTTS3012R",
    open_orders: "VTTS3018R",
};

/// Quotes use the same code in both environments
const QUOTE_TR_ID: &str = "HHDFS00000300";

pub struct KisAdapter {
    client: reqwest::Client,
    settings: KisSettings,
    dry_run: bool,
    access_token: Option<String>,
    token_expires_at: Option<Instant>,
}

impl KisAdapter {
    pub fn new(settings: KisSettings, dry_run: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            dry_run,
            access_token: None,
            token_expires_at: None,
        }
    }

    fn tr_ids(&self) -> &'static TrIds {
        if self.settings.is_live() {
            &LIVE_TR_IDS
        } else {
            &PAPER_TR_IDS
        }
    }

    /// Account number split into CANO and product code, "12345678-01" style
    fn account_parts(&self) -> ExchangeResult<(String, String)> {
        match self.settings.account_no.split_once('-') {
            Some((cano, prdt)) => Ok((cano.to_string(), prdt.to_string())),
            None => Err(ExchangeError::Auth(format!(
                "account_no '{}' is not in CANO-PRDT form",
                self.settings.account_no
            ))),
        }
    }

    /// Market code for the quotation API; trading uses the full code
    fn quote_exchange_code(&self) -> &str {
        match self.settings.exchange_code.as_str() {
            "NASD" => "NAS",
            "NYSE" => "NYS",
            "AMEX" => "AMS",
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Token lifecycle
    // ------------------------------------------------------------------

    /// Fetch or reuse the OAuth2 access token
    async fn ensure_token(&mut self) -> ExchangeResult<String> {
        let fresh = match (&self.access_token, self.token_expires_at) {
            (Some(_), Some(expires_at)) => {
                Instant::now() + TOKEN_REFRESH_MARGIN < expires_at
            }
            _ => false,
        };
        if fresh {
            if let Some(token) = &self.access_token {
                return Ok(token.clone());
            }
        }

        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.settings.app_key,
            "appsecret": self.settings.app_secret,
        });
        let response = self
            .client
            .post(format!("{}/oauth2/tokenP", self.settings.base_url()))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        let payload = Self::read_json(response).await?;

        let token = payload["access_token"]
            .as_str()
            .ok_or_else(|| ExchangeError::Auth(format!("token grant refused: {payload}")))?
            .to_string();
        let expires_in = payload["expires_in"].as_u64().unwrap_or(86_400);

        self.token_expires_at = Some(Instant::now() + Duration::from_secs(expires_in));
        self.access_token = Some(token.clone());
        info!(expires_in, mode = %self.settings.mode, "access token issued");
        Ok(token)
    }

    /// Integrity hash the venue requires on order bodies
    async fn hashkey(&self, body: &Value) -> ExchangeResult<String> {
        let response = self
            .client
            .post(format!("{}/uapi/hashkey", self.settings.base_url()))
            .timeout(REQUEST_TIMEOUT)
            .header("appkey", &self.settings.app_key)
            .header("appsecret", &self.settings.app_secret)
            .json(body)
            .send()
            .await?;
        let payload = Self::read_json(response).await?;
        payload["HASH"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Unknown(format!("hashkey missing: {payload}")))
    }

    // ------------------------------------------------------------------
    // HTTP helpers
    // ------------------------------------------------------------------

    async fn read_json(response: reqwest::Response) -> ExchangeResult<Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_status(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Unknown(format!("invalid JSON response: {e}")))
    }

    fn invalidate_token(&mut self) {
        self.access_token = None;
        self.token_expires_at = None;
    }

    /// One refresh-and-retry on an auth rejection; a second rejection
    /// surfaces to the engine and parks trading
    async fn signed_get(
        &mut self,
        endpoint: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> ExchangeResult<Value> {
        match self.signed_get_once(endpoint, tr_id, query).await {
            Err(ExchangeError::Auth(msg)) => {
                debug!(error = %msg, "auth rejected, refreshing token and retrying");
                self.invalidate_token();
                self.signed_get_once(endpoint, tr_id, query).await
            }
            other => other,
        }
    }

    async fn signed_post(
        &mut self,
        endpoint: &str,
        tr_id: &str,
        body: &Value,
    ) -> ExchangeResult<Value> {
        match self.signed_post_once(endpoint, tr_id, body).await {
            Err(ExchangeError::Auth(msg)) => {
                debug!(error = %msg, "auth rejected, refreshing token and retrying");
                self.invalidate_token();
                self.signed_post_once(endpoint, tr_id, body).await
            }
            other => other,
        }
    }

    async fn signed_get_once(
        &mut self,
        endpoint: &str,
        tr_id: &str,
        query: &[(&str, String)],
    ) -> ExchangeResult<Value> {
        let token = self.ensure_token().await?;
        let response = self
            .client
            .get(format!("{}{}", self.settings.base_url(), endpoint))
            .timeout(REQUEST_TIMEOUT)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.settings.app_key)
            .header("appsecret", &self.settings.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P")
            .query(query)
            .send()
            .await?;
        let payload = Self::read_json(response).await?;
        check_rt_cd(&payload)?;
        Ok(payload)
    }

    async fn signed_post_once(
        &mut self,
        endpoint: &str,
        tr_id: &str,
        body: &Value,
    ) -> ExchangeResult<Value> {
        let token = self.ensure_token().await?;
        let hash = self.hashkey(body).await?;
        let response = self
            .client
            .post(format!("{}{}", self.settings.base_url(), endpoint))
            .timeout(REQUEST_TIMEOUT)
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", &self.settings.app_key)
            .header("appsecret", &self.settings.app_secret)
            .header("tr_id", tr_id)
            .header("custtype", "P")
            .header("hashkey", hash)
            .json(body)
            .send()
            .await?;
        let payload = Self::read_json(response).await?;
        check_rt_cd(&payload)?;
        Ok(payload)
    }
}

/// Application-level success is `rt_cd == "0"` regardless of HTTP status
fn check_rt_cd(payload: &Value) -> ExchangeResult<()> {
    let rt_cd = payload["rt_cd"].as_str().unwrap_or("0");
    if rt_cd == "0" {
        return Ok(());
    }
    let msg_cd = payload["msg_cd"].as_str().unwrap_or_default();
    let msg = payload["msg1"].as_str().unwrap_or_default().trim();
    let message = format!("{msg_cd}: {msg}");
    // EGW00121/EGW00123 are the invalid/expired token codes
    if msg_cd.starts_with("EGW001") || msg.to_lowercase().contains("token") {
        Err(ExchangeError::Auth(message))
    } else {
        Err(ExchangeError::Rejected(message))
    }
}

fn field_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[async_trait]
impl ExchangeAdapter for KisAdapter {
    fn venue(&self) -> &'static str {
        "kis"
    }

    async fn get_quote(&mut self) -> ExchangeResult<Quote> {
        let query = vec![
            ("AUTH", String::new()),
            ("EXCD", self.quote_exchange_code().to_string()),
            ("SYMB", self.settings.symbol.clone()),
        ];
        let payload = self
            .signed_get(
                "/uapi/overseas-price/v1/quotations/price",
                QUOTE_TR_ID,
                &query,
            )
            .await?;
        let output = &payload["output"];
        let price = field_f64(&output["last"]);
        if price <= 0.0 {
            return Err(ExchangeError::Unknown(format!(
                "quote without a usable price: {output}"
            )));
        }
        Ok(Quote {
            price,
            volume_24h: field_f64(&output["tvol"]),
            timestamp: Utc::now(),
        })
    }

    async fn place_order(
        &mut self,
        side: Side,
        qty: f64,
        price: f64,
    ) -> ExchangeResult<OrderResult> {
        if qty <= 0.0 {
            return Err(ExchangeError::Rejected(
                "order quantity rounds to zero lots".to_string(),
            ));
        }

        if self.dry_run {
            let order_id = format!("dry-{}", Uuid::new_v4().simple());
            info!(side = side.as_str(), qty, price, order_id, "dry-run order");
            return Ok(OrderResult { order_id });
        }

        let (cano, prdt) = self.account_parts()?;
        let tr_id = match side {
            Side::Buy => self.tr_ids().buy,
            Side::Sell => self.tr_ids().sell,
        };
        let body = json!({
            "CANO": cano,
            "ACNT_PRDT_CD": prdt,
            "OVRS_EXCG_CD": self.settings.exchange_code,
            "PDNO": self.settings.symbol,
            "ORD_QTY": format!("{}", qty.floor() as u64),
            "OVRS_ORD_UNPR": format!("{price:.2}"),
            "ORD_SVR_DVSN_CD": "0",
            "ORD_DVSN": "00",
        });
        let payload = self
            .signed_post("/uapi/overseas-stock/v1/trading/order", tr_id, &body)
            .await?;
        let order_id = payload["output"]["ODNO"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ExchangeError::Unknown(format!("order accepted without id: {payload}")))?;
        debug!(order_id, side = side.as_str(), "order placed");
        Ok(OrderResult { order_id })
    }

    async fn cancel_order(&mut self, order_id: &str, _side: Side) -> ExchangeResult<()> {
        if self.dry_run {
            return Ok(());
        }

        let (cano, prdt) = self.account_parts()?;
        let body = json!({
            "CANO": cano,
            "ACNT_PRDT_CD": prdt,
            "OVRS_EXCG_CD": self.settings.exchange_code,
            "PDNO": self.settings.symbol,
            "ORGN_ODNO": order_id,
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": "0",
            "OVRS_ORD_UNPR": "0",
        });
        self.signed_post(
            "/uapi/overseas-stock/v1/trading/order-rvsecncl",
            self.tr_ids().cancel,
            &body,
        )
        .await?;
        Ok(())
    }

    async fn get_balance(&mut self) -> ExchangeResult<Balance> {
        if self.dry_run {
            return Ok(Balance {
                cash: f64::INFINITY,
                asset: 0.0,
            });
        }

        let (cano, prdt) = self.account_parts()?;
        let tr_id = self.tr_ids().balance;
        let query = vec![
            ("CANO", cano),
            ("ACNT_PRDT_CD", prdt),
            ("OVRS_EXCG_CD", self.settings.exchange_code.clone()),
            ("TR_CRCY_CD", "USD".to_string()),
            ("CTX_AREA_FK200", String::new()),
            ("CTX_AREA_NK200", String::new()),
        ];
        let payload = self
            .signed_get("/uapi/overseas-stock/v1/trading/inquire-balance", tr_id, &query)
            .await?;

        let mut asset = 0.0;
        if let Some(rows) = payload["output1"].as_array() {
            for row in rows {
                if row["ovrs_pdno"].as_str() == Some(self.settings.symbol.as_str()) {
                    asset = field_f64(&row["ord_psbl_qty"]);
                }
            }
        }
        let cash = field_f64(&payload["output2"]["frcr_dncl_amt_2"]);
        Ok(Balance { cash, asset })
    }

    async fn get_open_orders(&mut self) -> ExchangeResult<Vec<OpenOrder>> {
        if self.dry_run {
            return Ok(Vec::new());
        }

        let (cano, prdt) = self.account_parts()?;
        let tr_id = self.tr_ids().open_orders;
        let query = vec![
            ("CANO", cano),
            ("ACNT_PRDT_CD", prdt),
            ("OVRS_EXCG_CD", self.settings.exchange_code.clone()),
            ("SORT_SQN", "DS".to_string()),
            ("CTX_AREA_FK200", String::new()),
            ("CTX_AREA_NK200", String::new()),
        ];
        let payload = self
            .signed_get("/uapi/overseas-stock/v1/trading/inquire-nccs", tr_id, &query)
            .await?;

        let rows = payload["output"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let order_id = row["odno"].as_str()?.to_string();
                let side = if row["sll_buy_dvsn_cd"].as_str() == Some("02") {
                    Side::Buy
                } else {
                    Side::Sell
                };
                Some(OpenOrder { order_id, side })
            })
            .collect())
    }

    fn round_price(&self, price: f64) -> f64 {
        // overseas equities quote in cents
        (price * 100.0).round() / 100.0
    }

    /// Equities trade in whole lots; fractional remainders are dropped, and
    /// a result of zero means the order is not submittable
    fn round_quantity(&self, qty: f64) -> f64 {
        let lot = self.settings.order_lot_size.max(1.0);
        (qty / lot).floor() * lot
    }

    fn min_notional(&self) -> f64 {
        // one lot at the current price is the effective minimum; the venue
        // itself imposes no notional floor
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(mode: &str) -> KisAdapter {
        KisAdapter::new(
            KisSettings {
                app_key: "key".into(),
                app_secret: "secret".into(),
                account_no: "12345678-01".into(),
                mode: mode.into(),
                ..KisSettings::default()
            },
            false,
        )
    }

    #[test]
    fn test_tr_ids_follow_mode() {
        assert_eq!(adapter("live").tr_ids().buy, "TTTT1002U");
        assert_eq!(adapter("paper").tr_ids().buy, "VTTT1002U");
        assert_eq!(adapter("LIVE").tr_ids().sell, "TTTT1006U");
    }

    #[test]
    fn test_base_url_follows_mode() {
        assert!(adapter("paper").settings.base_url().contains("openapivts"));
        assert!(!adapter("live").settings.base_url().contains("openapivts"));
    }

    #[test]
    fn test_account_parts_split() {
        let (cano, prdt) = adapter("paper").account_parts().unwrap();
        assert_eq!(cano, "12345678");
        assert_eq!(prdt, "01");

        let mut bad = adapter("paper");
        bad.settings.account_no = "1234567801".into();
        assert!(matches!(bad.account_parts(), Err(ExchangeError::Auth(_))));
    }

    #[test]
    fn test_quote_exchange_code_mapping() {
        assert_eq!(adapter("paper").quote_exchange_code(), "NAS");
        let mut nyse = adapter("paper");
        nyse.settings.exchange_code = "NYSE".into();
        assert_eq!(nyse.quote_exchange_code(), "NYS");
    }

    #[test]
    fn test_lot_rounding_floors() {
        let mut adapter = adapter("paper");
        adapter.settings.order_lot_size = 1.0;
        assert_eq!(adapter.round_quantity(3.9), 3.0);
        assert_eq!(adapter.round_quantity(0.9), 0.0);

        adapter.settings.order_lot_size = 2.0;
        assert_eq!(adapter.round_quantity(7.0), 6.0);
        assert_eq!(adapter.round_quantity(1.0), 0.0);

        adapter.settings.order_lot_size = 10.0;
        assert_eq!(adapter.round_quantity(27.0), 20.0);
    }

    #[test]
    fn test_price_rounds_to_cents() {
        assert_eq!(adapter("paper").round_price(54.12749), 54.13);
    }

    #[test]
    fn test_rt_cd_mapping() {
        assert!(check_rt_cd(&json!({"rt_cd": "0"})).is_ok());
        // payloads without rt_cd (token grant, hashkey) pass through
        assert!(check_rt_cd(&json!({"access_token": "x"})).is_ok());

        let auth = check_rt_cd(&json!({
            "rt_cd": "1", "msg_cd": "EGW00123", "msg1": "token expired"
        }));
        assert!(matches!(auth, Err(ExchangeError::Auth(_))));

        let rejected = check_rt_cd(&json!({
            "rt_cd": "1", "msg_cd": "APBK0013", "msg1": "insufficient balance"
        }));
        assert!(matches!(rejected, Err(ExchangeError::Rejected(_))));
    }

    #[test]
    fn test_field_f64_handles_strings() {
        assert_eq!(field_f64(&json!("54.12")), 54.12);
        assert_eq!(field_f64(&json!(" 54.12 ")), 54.12);
        assert_eq!(field_f64(&json!(54.12)), 54.12);
        assert_eq!(field_f64(&json!(null)), 0.0);
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected_before_any_request() {
        let mut adapter = adapter("paper");
        let result = adapter.place_order(Side::Buy, 0.0, 54.0).await;
        assert!(matches!(result, Err(ExchangeError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_dry_run_order_id_prefix() {
        let mut adapter = KisAdapter::new(KisSettings::default(), true);
        let result = adapter.place_order(Side::Sell, 3.0, 54.0).await.unwrap();
        assert!(result.order_id.starts_with("dry-"));
        assert!(adapter.get_balance().await.unwrap().cash.is_infinite());
    }
}
