use crate::payments::callback::CallbackRequest;
use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::{gateway_amount, require_setting, transaction_id_or, BuiltinDriver};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::settings::{lenient, CommonSettings, Settings};
use crate::payments::utils::{
    code_to_string, endpoint, lookup_message, GatewayHttpClient, GatewayStage, HttpError,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

const API_URL: &str = "https://gateway.zibal.ir";
const SANDBOX_MERCHANT: &str = "zibal";

const RESULTS: &[(&str, &str)] = &[
    ("102", "merchant یافت نشد."),
    ("103", "merchant غیرفعال"),
    ("104", "merchant نامعتبر"),
    ("105", "amount بایستی بزرگتر از 1,000 ریال باشد."),
    ("106", "callbackUrl نامعتبر می‌باشد."),
    ("113", "amount مبلغ تراکنش از سقف میزان تراکنش بیشتر است."),
    ("201", "قبلا تایید شده."),
    ("202", "سفارش پرداخت نشده یا ناموفق بوده است."),
    ("203", "trackId نامعتبر می‌باشد."),
];

/// Payment `status` values reported on the callback and by inquiry.
const STATUSES: &[(&str, &str)] = &[
    ("-1", "در انتظار پردخت"),
    ("-2", "خطای داخلی"),
    ("1", "پرداخت شده - تاییدشده"),
    ("2", "پرداخت شده - تاییدنشده"),
    ("3", "لغوشده توسط کاربر"),
    ("4", "‌شماره کارت نامعتبر می‌باشد."),
    ("5", "‌موجودی حساب کافی نمی‌باشد."),
    ("6", "رمز واردشده اشتباه می‌باشد."),
    ("7", "‌تعداد درخواست‌ها بیش از حد مجاز می‌باشد."),
    ("8", "‌تعداد پرداخت اینترنتی روزانه بیش از حد مجاز می‌باشد."),
    ("9", "مبلغ پرداخت اینترنتی روزانه بیش از حد مجاز می‌باشد."),
    ("10", "‌صادرکننده‌ی کارت نامعتبر می‌باشد."),
    ("11", "خطای سوییچ"),
    ("12", "کارت قابل دسترسی نمی‌باشد."),
];

const VERIFIED: &[&str] = &["100", "201"];

#[derive(Debug, Clone, Deserialize)]
pub struct ZibalConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default, deserialize_with = "lenient::string")]
    pub merchant_id: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_url: Option<String>,
}

pub struct ZibalDriver {
    name: String,
    config: ZibalConfig,
    http: GatewayHttpClient,
}

impl ZibalDriver {
    pub fn new(name: impl Into<String>, config: ZibalConfig) -> PaymentResult<Self> {
        let name = name.into();
        if !config.common.sandbox {
            require_setting(&name, "merchant_id", &config.merchant_id)?;
        }
        let http = GatewayHttpClient::new(config.common.timeout())?;
        Ok(Self { name, config, http })
    }

    pub fn from_context(context: DriverContext) -> PaymentResult<Self> {
        let config = context.settings.parse(&context.name)?;
        Self::new(context.name, config)
    }

    pub fn default_settings() -> Settings {
        Settings::new()
            .with("merchant_id", "")
            .with("callback_url", "http://127.0.0.1:8000/payments/zibal/callback")
            .with("description", "payment using zibal")
            .with("currency", "T")
            .with("sandbox", false)
            .with("timeout_secs", 30)
    }

    fn merchant(&self) -> &str {
        if self.config.common.sandbox {
            SANDBOX_MERCHANT
        } else {
            self.config.merchant_id.as_str()
        }
    }

    fn url(&self, path: &str) -> String {
        endpoint(self.config.base_url.as_deref().unwrap_or(API_URL), path)
    }

    async fn call(&self, path: &str, payload: &JsonValue) -> Result<JsonValue, HttpError> {
        self.http.post_json(&self.url(path), payload, &[]).await?.json()
    }

    fn receipt(&self, track_id: &str, body: &JsonValue) -> PaymentResult<Receipt> {
        let reference = body
            .get("refNumber")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "refNumber missing", None))?;
        Ok(Receipt::new(&self.name, reference)
            .with_detail("track_id", track_id)
            .with_optional_detail("card_number", body.get("cardNumber").cloned())
            .with_optional_detail("paid_at", body.get("paidAt").cloned())
            .with_optional_detail("order_id", body.get("orderId").cloned()))
    }

    /// Asks zibal for the transaction state after a verify call timed out.
    /// The verify may have gone through on the gateway side.
    async fn inquire(&self, track_id: &str) -> PaymentResult<Receipt> {
        let body = self
            .call(
                "/v1/inquiry",
                &json!({ "merchant": self.merchant(), "trackId": track_id }),
            )
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;

        let result = body.get("result").and_then(code_to_string).unwrap_or_default();
        let status = body.get("status").and_then(code_to_string).unwrap_or_default();
        if result != "100" || status != "1" {
            warn!(driver = %self.name, track_id = track_id, result = %result, status = %status, "Zibal inquiry did not confirm payment");
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(STATUSES, &status),
                Some(status),
            ));
        }

        info!(driver = %self.name, track_id = track_id, "Zibal payment confirmed by inquiry");
        self.receipt(track_id, &body)
    }
}

#[async_trait]
impl Driver for ZibalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        let amount = gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Zibal.native_unit(),
        )?;
        let callback_url = self.config.common.require_callback_url(&self.name)?;

        let payload = json!({
            "merchant": self.merchant(),
            "amount": amount,
            "callbackUrl": callback_url,
            "description": invoice
                .detail_str("description")
                .or_else(|| self.config.common.description.clone()),
            "orderId": invoice.uuid().to_string(),
            "mobile": invoice.detail_str("mobile"),
        });

        let body = self
            .call("/v1/request", &payload)
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;
        let result = body.get("result").and_then(code_to_string).unwrap_or_default();
        if result != "100" {
            warn!(driver = %self.name, result = %result, "Zibal rejected the payment request");
            return Err(PaymentError::purchase_failed(
                &self.name,
                lookup_message(RESULTS, &result),
                Some(result),
            ));
        }

        let track_id = body
            .get("trackId")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::purchase_failed(&self.name, "trackId missing", None))?;
        invoice.set_transaction_id(track_id.clone());
        info!(driver = %self.name, transaction_id = %track_id, "Zibal payment registered");
        Ok(track_id)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        Ok(RedirectionForm::get(self.url(&format!(
            "/start/{}",
            invoice.transaction_id().unwrap_or_default()
        ))))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        if callback.input("success") != Some("1") {
            let status = callback.input("status").unwrap_or("3");
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(STATUSES, status),
                Some(status.to_string()),
            ));
        }

        let track_id = transaction_id_or(invoice, callback.input("trackId"))
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "trackId is missing", None))?;

        let body = match self
            .call(
                "/v1/verify",
                &json!({ "merchant": self.merchant(), "trackId": track_id }),
            )
            .await
        {
            Ok(body) => body,
            Err(e) if e.is_timeout() => {
                warn!(driver = %self.name, track_id = %track_id, "Zibal verify timed out, falling back to inquiry");
                return self.inquire(&track_id).await;
            }
            Err(e) => return Err(e.into_payment_error(&self.name, GatewayStage::Verify)),
        };

        let result = body.get("result").and_then(code_to_string).unwrap_or_default();
        if !VERIFIED.contains(&result.as_str()) {
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(RESULTS, &result),
                Some(result),
            ));
        }

        info!(driver = %self.name, transaction_id = %track_id, "Zibal payment verified");
        self.receipt(&track_id, &body)
    }
}
