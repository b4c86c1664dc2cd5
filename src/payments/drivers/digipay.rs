//! Digipay UPG. Every call needs an OAuth access token obtained with the
//! password grant; tokens are cached per driver instance and refreshed once
//! when the gateway answers 401.

use crate::payments::callback::CallbackRequest;
use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::{gateway_amount, require_setting, BuiltinDriver};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::settings::{lenient, CommonSettings, Settings};
use crate::payments::utils::{
    code_to_string, endpoint, AccessTokenCache, GatewayHttpClient, GatewayReply, GatewayStage,
    RequestAuth,
};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::{info, warn};

const API_URL: &str = "https://api.mydigipay.com";
const SANDBOX_URL: &str = "https://uat.mydigipay.info";
const API_VERSION: &str = "2022-02-02";
const REDIRECT_DETAIL: &str = "redirect_url";

#[derive(Debug, Clone, Deserialize)]
pub struct DigipayConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default, deserialize_with = "lenient::string")]
    pub username: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub password: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub client_id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub client_secret: String,
    /// Ticket type; 11 is the plain IPG purchase.
    #[serde(default = "default_ticket_type", deserialize_with = "lenient::string")]
    pub ticket_type: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_url: Option<String>,
}

fn default_ticket_type() -> String {
    "11".to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

pub struct DigipayDriver {
    name: String,
    config: DigipayConfig,
    http: GatewayHttpClient,
    tokens: AccessTokenCache,
}

impl DigipayDriver {
    pub fn new(name: impl Into<String>, config: DigipayConfig) -> PaymentResult<Self> {
        let name = name.into();
        require_setting(&name, "username", &config.username)?;
        require_setting(&name, "password", &config.password)?;
        require_setting(&name, "client_id", &config.client_id)?;
        require_setting(&name, "client_secret", &config.client_secret)?;
        let http = GatewayHttpClient::new(config.common.timeout())?;
        Ok(Self {
            name,
            config,
            http,
            tokens: AccessTokenCache::default(),
        })
    }

    pub fn from_context(context: DriverContext) -> PaymentResult<Self> {
        let config = context.settings.parse(&context.name)?;
        Self::new(context.name, config)
    }

    pub fn default_settings() -> Settings {
        Settings::new()
            .with("username", "")
            .with("password", "")
            .with("client_id", "")
            .with("client_secret", "")
            .with("ticket_type", "11")
            .with("callback_url", "http://127.0.0.1:8000/payments/digipay/callback")
            .with("description", "payment using digipay")
            .with("currency", "T")
            .with("sandbox", false)
            .with("timeout_secs", 30)
    }

    fn url(&self, path: &str) -> String {
        let base = match &self.config.base_url {
            Some(url) => url.as_str(),
            None if self.config.common.sandbox => SANDBOX_URL,
            None => API_URL,
        };
        endpoint(base, path)
    }

    /// Tracking code as an escaped path segment, ticket type as a query pair.
    fn verify_url(&self, tracking_code: &str, ticket_type: &str) -> PaymentResult<Url> {
        let invalid_base = || {
            PaymentError::validation("digipay base_url is not a valid URL", Some("base_url"))
        };
        let mut url = Url::parse(&self.url("/digipay/api/purchases/verify"))
            .map_err(|_| invalid_base())?;
        url.path_segments_mut()
            .map_err(|()| invalid_base())?
            .push(tracking_code);
        url.query_pairs_mut().append_pair("type", ticket_type);
        Ok(url)
    }

    async fn fetch_token(&self, stage: GatewayStage) -> PaymentResult<(String, Duration)> {
        let form = [
            ("username", self.config.username.clone()),
            ("password", self.config.password.clone()),
            ("grant_type", "password".to_string()),
        ];
        let reply = self
            .http
            .post_form(
                &self.url("/digipay/api/oauth/token"),
                RequestAuth::Basic(&self.config.client_id, &self.config.client_secret),
                &form,
            )
            .await
            .map_err(|e| e.into_payment_error(&self.name, stage))?;
        if !reply.is_success() {
            warn!(driver = %self.name, status = %reply.status, "Digipay refused the token request");
            return Err(stage.error(
                &self.name,
                "دریافت توکن دسترسی از دیجی پی ناموفق بود.",
                Some(reply.status.as_u16().to_string()),
            ));
        }

        let token: TokenResponse = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, stage))?;
        info!(driver = %self.name, expires_in = token.expires_in, "Digipay access token issued");
        Ok((token.access_token, Duration::from_secs(token.expires_in)))
    }

    async fn access_token(&self, force_refresh: bool, stage: GatewayStage) -> PaymentResult<String> {
        self.tokens
            .get_or_fetch(force_refresh, || self.fetch_token(stage))
            .await
    }

    /// Sends an authorized POST, refreshing the token and retrying once if
    /// the gateway rejects the cached one.
    async fn authorized_post(
        &self,
        url: &str,
        body: Option<&JsonValue>,
        stage: GatewayStage,
    ) -> PaymentResult<GatewayReply> {
        let headers = [("Agent", "WEB"), ("Digipay-Version", API_VERSION)];

        let token = self.access_token(false, stage).await?;
        let reply = self
            .http
            .request_json(Method::POST, url, RequestAuth::Bearer(&token), body, &headers)
            .await
            .map_err(|e| e.into_payment_error(&self.name, stage))?;
        if reply.status != StatusCode::UNAUTHORIZED {
            return Ok(reply);
        }

        warn!(driver = %self.name, "Digipay rejected the access token, refreshing");
        let token = self.access_token(true, stage).await?;
        self.http
            .request_json(Method::POST, url, RequestAuth::Bearer(&token), body, &headers)
            .await
            .map_err(|e| e.into_payment_error(&self.name, stage))
    }

    fn check_result(&self, reply: &GatewayReply, stage: GatewayStage) -> PaymentResult<JsonValue> {
        let body: JsonValue = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, stage))?;
        let status = body
            .pointer("/result/status")
            .and_then(code_to_string)
            .unwrap_or_else(|| reply.status.as_u16().to_string());
        if reply.is_success() && status == "0" {
            return Ok(body);
        }

        let message = body
            .pointer("/result/message")
            .and_then(JsonValue::as_str)
            .unwrap_or("خطای ناشناخته از سمت دیجی پی.")
            .to_string();
        warn!(driver = %self.name, status = %status, "Digipay rejected the request");
        Err(stage.error(&self.name, message, Some(status)))
    }
}

#[async_trait]
impl Driver for DigipayDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        let amount = gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Digipay.native_unit(),
        )?;
        let callback_url = self.config.common.require_callback_url(&self.name)?;

        let payload = json!({
            "amount": amount,
            "cellNumber": invoice.detail_str("mobile"),
            "providerId": invoice.uuid().to_string(),
            "callbackUrl": callback_url,
        });
        let url = format!(
            "{}?type={}",
            self.url("/digipay/api/tickets/business"),
            self.config.ticket_type
        );

        let reply = self
            .authorized_post(&url, Some(&payload), GatewayStage::Purchase)
            .await?;
        let body = self.check_result(&reply, GatewayStage::Purchase)?;

        let ticket = body
            .get("ticket")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::purchase_failed(&self.name, "ticket missing", None))?;
        let redirect_url = body
            .get("redirectUrl")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| PaymentError::purchase_failed(&self.name, "redirectUrl missing", None))?;

        invoice
            .set_transaction_id(ticket.clone())
            .set_detail(REDIRECT_DETAIL, redirect_url);
        info!(driver = %self.name, transaction_id = %ticket, "Digipay ticket issued");
        Ok(ticket)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        let redirect_url = invoice
            .detail_str(REDIRECT_DETAIL)
            .ok_or_else(|| PaymentError::InvoiceNotFound {
                reason: "digipay invoice has no redirect url; purchase first".to_string(),
            })?;
        Ok(RedirectionForm::get(redirect_url))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        let result = callback.input("result").unwrap_or("FAILED");
        if !result.eq_ignore_ascii_case("SUCCESS") {
            return Err(PaymentError::invalid_payment(
                &self.name,
                "پرداخت توسط کاربر لغو شد یا ناموفق بود.",
                Some(result.to_string()),
            ));
        }

        let tracking_code = callback
            .input("trackingCode")
            .filter(|code| is_callback_token(code))
            .ok_or_else(|| {
                PaymentError::invalid_payment(&self.name, "trackingCode is missing or malformed", None)
            })?;
        let ticket_type = match callback.input("type") {
            Some(kind) if is_callback_token(kind) => kind,
            Some(_) => {
                return Err(PaymentError::invalid_payment(
                    &self.name,
                    "ticket type is malformed",
                    None,
                ))
            }
            None => self.config.ticket_type.as_str(),
        };

        let url = self.verify_url(tracking_code, ticket_type)?;
        let reply = self
            .authorized_post(url.as_str(), None, GatewayStage::Verify)
            .await?;
        let body = self.check_result(&reply, GatewayStage::Verify)?;

        let reference = body
            .get("trackingCode")
            .and_then(code_to_string)
            .unwrap_or_else(|| tracking_code.to_string());

        info!(driver = %self.name, invoice_id = %invoice.uuid(), reference_id = %reference, "Digipay payment verified");
        Ok(Receipt::new(&self.name, reference)
            .with_optional_detail("ticket", invoice.transaction_id())
            .with_optional_detail("amount", body.get("amount").cloned())
            .with_optional_detail("fp_name", body.get("fpName").cloned())
            .with_optional_detail("masked_pan", body.get("pspMaskedPan").cloned()))
    }
}

/// Callback values that end up in a gateway URL: letters, digits, `-`, `_`.
fn is_callback_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
