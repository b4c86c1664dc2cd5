//! Saman Electronic Payment (SEP) gateway.
//!
//! Unlike the JSON-redirect gateways, SEP expects the payer's browser to
//! POST the token to its payment page, and reports the outcome on the
//! callback as a `State` string.

use crate::payments::callback::CallbackRequest;
use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::{gateway_amount, require_setting, BuiltinDriver};
use crate::payments::error::{PaymentError, PaymentResult, UNKNOWN_ERROR_MESSAGE};
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::settings::{lenient, CommonSettings, Settings};
use crate::payments::utils::{
    code_to_string, endpoint, lookup_message, GatewayHttpClient, GatewayStage,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

const API_URL: &str = "https://sep.shaparak.ir";

const STATES: &[(&str, &str)] = &[
    ("CanceledByUser", "تراکنش توسط خریدار کنسل شده است."),
    ("Failed", "پرداخت انجام نشد."),
    ("SessionIsNull", "کاربر در بازه زمانی تعیین شده پاسخی ارسال نکرده است."),
    ("InvalidParameters", "پارامترهای ارسالی نامعتبر است."),
    ("MerchantIpAddressIsInvalid", "آدرس سرور پذیرنده نامعتبر است."),
    ("TokenNotFound", "توکن ارسال شده یافت نشد."),
    ("TokenRequired", "با این شماره ترمینال فقط تراکنش های توکنی قابل پرداخت هستند."),
    ("TerminalNotFound", "شماره ترمینال ارسال شده یافت نشد."),
];

const VERIFY_RESULTS: &[(&str, &str)] = &[
    ("-2", "تراکنش یافت نشد."),
    ("-6", "بیش از نیم ساعت از زمان اجرای تراکنش گذشته است."),
    ("2", "درخواست تکراری می باشد."),
    ("5", "تراکنش برگشت خورده می باشد."),
    ("-18", "IP Address فروشنده نامعتبر است."),
    ("-104", "ترمینال ارسالی غیرفعال می باشد."),
    ("-105", "ترمینال ارسالی در سیستم موجود نمی باشد."),
    ("-106", "آدرس آی پی درخواستی غیر مجاز می باشد."),
];

const VERIFIED: &[&str] = &["0", "2"];
const AMOUNT_MISMATCH: &str = "مبلغ تایید شده با مبلغ فاکتور مطابقت ندارد.";

#[derive(Debug, Clone, Deserialize)]
pub struct SepConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default, deserialize_with = "lenient::string")]
    pub terminal_id: String,
    /// Asks SEP to call back with GET instead of POST.
    #[serde(default, deserialize_with = "lenient::bool")]
    pub get_method: bool,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_url: Option<String>,
}

pub struct SepDriver {
    name: String,
    config: SepConfig,
    http: GatewayHttpClient,
}

impl SepDriver {
    pub fn new(name: impl Into<String>, config: SepConfig) -> PaymentResult<Self> {
        let name = name.into();
        require_setting(&name, "terminal_id", &config.terminal_id)?;
        let http = GatewayHttpClient::new(config.common.timeout())?;
        Ok(Self { name, config, http })
    }

    pub fn from_context(context: DriverContext) -> PaymentResult<Self> {
        let config = context.settings.parse(&context.name)?;
        Self::new(context.name, config)
    }

    pub fn default_settings() -> Settings {
        Settings::new()
            .with("terminal_id", "")
            .with("callback_url", "http://127.0.0.1:8000/payments/sep/callback")
            .with("description", "payment using sep")
            .with("currency", "T")
            .with("get_method", false)
            .with("timeout_secs", 30)
    }

    fn url(&self, path: &str) -> String {
        endpoint(self.config.base_url.as_deref().unwrap_or(API_URL), path)
    }

    fn amount(&self, invoice: &Invoice) -> PaymentResult<u64> {
        gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Sep.native_unit(),
        )
    }
}

#[async_trait]
impl Driver for SepDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        let amount = self.amount(invoice)?;
        let callback_url = self.config.common.require_callback_url(&self.name)?;

        let payload = json!({
            "action": "token",
            "TerminalId": self.config.terminal_id,
            "Amount": amount,
            "ResNum": invoice.uuid().to_string(),
            "RedirectUrl": callback_url,
            "CellNumber": invoice.detail_str("mobile").unwrap_or_default(),
        });

        let body: JsonValue = self
            .http
            .post_json(&self.url("/onlinepg/onlinepg"), &payload, &[])
            .await
            .and_then(|reply| reply.json())
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;

        if body.get("status").and_then(code_to_string).as_deref() != Some("1") {
            let code = body
                .get("errorCode")
                .and_then(code_to_string)
                .unwrap_or_else(|| "unknown".to_string());
            let message = body
                .get("errorDesc")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_string());
            warn!(driver = %self.name, code = %code, "SEP rejected the token request");
            return Err(PaymentError::purchase_failed(&self.name, message, Some(code)));
        }

        let token = body
            .get("token")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::purchase_failed(&self.name, "token missing", None))?;
        invoice.set_transaction_id(token.clone());
        info!(driver = %self.name, transaction_id = %token, "SEP payment registered");
        Ok(token)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        Ok(RedirectionForm::post(self.url("/OnlinePG/OnlinePG"))
            .with_field("Token", invoice.transaction_id().unwrap_or_default())
            .with_field("GetMethod", self.config.get_method.to_string()))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        let state = callback.input("State").unwrap_or_default();
        if state != "OK" {
            let code = if state.is_empty() { "Failed" } else { state };
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(STATES, code),
                Some(code.to_string()),
            ));
        }

        let ref_num = callback
            .input("RefNum")
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "RefNum is missing", None))?
            .to_string();
        let expected = self.amount(invoice)?;

        let body: JsonValue = self
            .http
            .post_json(
                &self.url("/verifyTxnRandomSessionkey/ipg/VerifyTransaction"),
                &json!({ "RefNum": ref_num, "TerminalNumber": self.config.terminal_id }),
                &[],
            )
            .await
            .and_then(|reply| reply.json())
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;

        let result = body
            .get("ResultCode")
            .and_then(code_to_string)
            .unwrap_or_default();
        if !VERIFIED.contains(&result.as_str()) {
            warn!(driver = %self.name, result = %result, "SEP verification failed");
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(VERIFY_RESULTS, &result),
                Some(result),
            ));
        }

        let detail = body.get("TransactionDetail").cloned().unwrap_or(JsonValue::Null);
        let original = detail.get("OrginalAmount").and_then(code_to_string);
        if original.as_deref() != Some(expected.to_string().as_str()) {
            warn!(driver = %self.name, expected = expected, paid = ?original, "SEP amount mismatch");
            return Err(PaymentError::invalid_payment(
                &self.name,
                AMOUNT_MISMATCH,
                Some("amount_mismatch".to_string()),
            ));
        }

        let rrn = detail
            .get("RRN")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "RRN missing", None))?;

        info!(driver = %self.name, ref_num = %ref_num, reference_id = %rrn, "SEP payment verified");
        Ok(Receipt::new(&self.name, rrn)
            .with_detail("ref_num", ref_num)
            .with_optional_detail("masked_pan", detail.get("MaskedPan").cloned())
            .with_optional_detail("trace_no", detail.get("StraceNo").cloned())
            .with_optional_detail("trace_date", detail.get("StraceDate").cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::redirection::FormMethod;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn driver(base_url: &str) -> SepDriver {
        SepDriver::from_context(DriverContext {
            name: "sep".to_string(),
            settings: SepDriver::default_settings()
                .with("terminal_id", 13100555)
                .with("base_url", base_url),
        })
        .expect("driver should build")
    }

    fn invoice(amount: u64) -> Invoice {
        let mut invoice = Invoice::new();
        invoice.set_amount(amount).unwrap();
        invoice.set_transaction_id("sep-token");
        invoice
    }

    fn verify_body(amount: u64) -> JsonValue {
        json!({
            "TransactionDetail": {
                "RRN": "14226761817",
                "RefNum": "50",
                "MaskedPan": "621986****8080",
                "HashedPan": "a7b8...",
                "TerminalNumber": 13100555,
                "OrginalAmount": amount,
                "AffectiveAmount": amount,
                "StraceDate": "2019-10-29 14:03:08",
                "StraceNo": "100428"
            },
            "ResultCode": 0,
            "ResultDescription": "عملیات با موفقیت انجام شد",
            "Success": true
        })
    }

    #[tokio::test]
    async fn pay_posts_token_to_gateway_page() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/onlinepg/onlinepg"))
            .and(body_partial_json(json!({"action": "token", "TerminalId": "13100555", "Amount": 50000})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": 1, "token": "sep-token"})),
            )
            .mount(&server)
            .await;

        let driver = driver(&server.uri());
        let mut invoice = Invoice::new();
        invoice.set_amount(5000_u64).unwrap();
        driver.purchase(&mut invoice).await.unwrap();

        let form = driver.pay(&invoice).await.unwrap();
        assert_eq!(form.method(), FormMethod::Post);
        assert_eq!(form.field("Token"), Some("sep-token"));
        assert_eq!(form.field("GetMethod"), Some("false"));
        assert_eq!(form.redirect_url(), None);
    }

    #[tokio::test]
    async fn token_error_keeps_gateway_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/onlinepg/onlinepg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": -1,
                "errorCode": "5",
                "errorDesc": "پارامترهای ارسالی نامعتبر است."
            })))
            .mount(&server)
            .await;

        let mut invoice = Invoice::new();
        invoice.set_amount(5000_u64).unwrap();
        let err = driver(&server.uri())
            .purchase(&mut invoice)
            .await
            .unwrap_err();
        assert_eq!(err.gateway_code(), Some("5"));
        assert_eq!(err.user_message(), "پارامترهای ارسالی نامعتبر است.");
    }

    #[tokio::test]
    async fn verify_checks_original_amount() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verifyTxnRandomSessionkey/ipg/VerifyTransaction"))
            .and(body_partial_json(json!({"RefNum": "50"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(verify_body(50000)))
            .mount(&server)
            .await;

        let driver = driver(&server.uri());
        let callback = CallbackRequest::from_form([("State", "OK"), ("RefNum", "50")]);

        let receipt = driver.verify(&invoice(5000), &callback).await.unwrap();
        assert_eq!(receipt.reference_id(), "14226761817");
        assert_eq!(receipt.detail("masked_pan"), Some(&json!("621986****8080")));

        let err = driver.verify(&invoice(6000), &callback).await.unwrap_err();
        assert_eq!(err.gateway_code(), Some("amount_mismatch"));
    }

    #[tokio::test]
    async fn cancelled_state_is_translated() {
        let server = MockServer::start().await;
        let err = driver(&server.uri())
            .verify(
                &invoice(5000),
                &CallbackRequest::from_form([("State", "CanceledByUser")]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.gateway_code(), Some("CanceledByUser"));
        assert_eq!(err.user_message(), "تراکنش توسط خریدار کنسل شده است.");
    }
}
