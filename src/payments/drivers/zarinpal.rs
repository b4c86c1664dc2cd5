use crate::payments::callback::CallbackRequest;
use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::{gateway_amount, require_setting, transaction_id_or, BuiltinDriver};
use crate::payments::error::{PaymentError, PaymentResult};
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

const LIVE_URL: &str = "https://payment.zarinpal.com";
const SANDBOX_URL: &str = "https://sandbox.zarinpal.com";

const MESSAGES: &[(&str, &str)] = &[
    ("-9", "خطای اعتبار سنجی"),
    ("-10", "ای پی یا مرچنت كد پذیرنده صحیح نیست"),
    ("-11", "مرچنت کد فعال نیست"),
    ("-12", "تلاش بیش از حد در یک بازه زمانی کوتاه"),
    ("-15", "ترمینال شما به حالت تعلیق در آمده است"),
    ("-16", "سطح تایید پذیرنده پایین تر از سطح نقره ای است"),
    ("-30", "اجازه دسترسی به تسویه اشتراکی شناور ندارید"),
    ("-31", "حساب بانکی تسویه را به پنل اضافه کنید"),
    ("-33", "درصد های وارد شده صحیح نیست"),
    ("-34", "مبلغ از کل تراکنش بیشتر است"),
    ("-35", "تعداد افراد دریافت کننده تسهیم بیش از حد مجاز است"),
    ("-40", "پارامترهای اضافی نامعتبر است"),
    ("-50", "مبلغ پرداخت شده با مقدار مبلغ در وریفای متفاوت است"),
    ("-51", "پرداخت ناموفق"),
    ("-52", "خطای غیر منتظره"),
    ("-53", "اتوریتی برای این مرچنت کد نیست"),
    ("-54", "اتوریتی نامعتبر است"),
    ("101", "تراکنش وریفای شده است"),
    ("NOK", "پرداخت توسط کاربر لغو شد یا ناموفق بود"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct ZarinpalConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default, deserialize_with = "lenient::string")]
    pub merchant_id: String,
    /// Overrides the live/sandbox host.
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_url: Option<String>,
}

pub struct ZarinpalDriver {
    name: String,
    config: ZarinpalConfig,
    http: GatewayHttpClient,
}

impl ZarinpalDriver {
    pub fn new(name: impl Into<String>, config: ZarinpalConfig) -> PaymentResult<Self> {
        let name = name.into();
        require_setting(&name, "merchant_id", &config.merchant_id)?;
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
            .with("callback_url", "http://127.0.0.1:8000/payments/zarinpal/callback")
            .with("description", "payment using zarinpal")
            .with("currency", "T")
            .with("sandbox", false)
            .with("timeout_secs", 30)
    }

    fn base_url(&self) -> &str {
        match &self.config.base_url {
            Some(url) => url,
            None if self.config.common.sandbox => SANDBOX_URL,
            None => LIVE_URL,
        }
    }

    fn amount(&self, invoice: &Invoice) -> PaymentResult<u64> {
        gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Zarinpal.native_unit(),
        )
    }

    /// Zarinpal answers `{"data": {...}, "errors": {...}}`; exactly one of
    /// the two is populated. Returns the data block on success codes.
    fn read_reply(
        &self,
        body: &JsonValue,
        success: &[&str],
        stage: GatewayStage,
    ) -> PaymentResult<JsonValue> {
        let data_code = body.pointer("/data/code").and_then(code_to_string);
        if let Some(code) = data_code {
            if success.contains(&code.as_str()) {
                return Ok(body["data"].clone());
            }
            return Err(stage.error(&self.name, lookup_message(MESSAGES, &code), Some(code)));
        }

        let code = body
            .pointer("/errors/code")
            .and_then(code_to_string)
            .unwrap_or_else(|| "unknown".to_string());
        warn!(driver = %self.name, code = %code, "Zarinpal rejected the request");
        Err(stage.error(&self.name, lookup_message(MESSAGES, &code), Some(code)))
    }
}

#[async_trait]
impl Driver for ZarinpalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        let amount = self.amount(invoice)?;
        let callback_url = self.config.common.require_callback_url(&self.name)?;
        let description = invoice
            .detail_str("description")
            .or_else(|| self.config.common.description.clone())
            .unwrap_or_default();

        let payload = json!({
            "merchant_id": self.config.merchant_id,
            "amount": amount,
            "currency": BuiltinDriver::Zarinpal.native_unit().code(),
            "callback_url": callback_url,
            "description": description,
            "metadata": {
                "mobile": invoice.detail_str("mobile"),
                "email": invoice.detail_str("email"),
                "order_id": invoice.uuid().to_string(),
            },
        });

        let reply = self
            .http
            .post_json(
                &endpoint(self.base_url(), "/pg/v4/payment/request.json"),
                &payload,
                &[],
            )
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;
        let body: JsonValue = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;

        let data = self.read_reply(&body, &["100"], GatewayStage::Purchase)?;
        let authority = data
            .get("authority")
            .and_then(JsonValue::as_str)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                PaymentError::purchase_failed(&self.name, "authority missing from response", None)
            })?
            .to_string();

        invoice.set_transaction_id(authority.clone());
        info!(driver = %self.name, transaction_id = %authority, "Zarinpal payment registered");
        Ok(authority)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        let authority = invoice.transaction_id().unwrap_or_default();
        Ok(RedirectionForm::get(endpoint(
            self.base_url(),
            &format!("/pg/StartPay/{}", authority),
        )))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        if callback.input("Status") != Some("OK") {
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(MESSAGES, "NOK"),
                Some("NOK".to_string()),
            ));
        }

        let authority = transaction_id_or(invoice, callback.input("Authority")).ok_or_else(|| {
            PaymentError::invalid_payment(&self.name, "authority is missing", None)
        })?;
        let amount = self.amount(invoice)?;

        let payload = json!({
            "merchant_id": self.config.merchant_id,
            "amount": amount,
            "authority": authority,
        });
        let reply = self
            .http
            .post_json(
                &endpoint(self.base_url(), "/pg/v4/payment/verify.json"),
                &payload,
                &[],
            )
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;
        let body: JsonValue = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;

        let data = self.read_reply(&body, &["100", "101"], GatewayStage::Verify)?;
        let reference_id = data
            .get("ref_id")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "ref_id missing", None))?;

        info!(driver = %self.name, transaction_id = %authority, reference_id = %reference_id, "Zarinpal payment verified");
        Ok(Receipt::new(&self.name, reference_id)
            .with_optional_detail("card_pan", data.get("card_pan").cloned())
            .with_optional_detail("card_hash", data.get("card_hash").cloned())
            .with_optional_detail("fee", data.get("fee").cloned())
            .with_detail("authority", authority))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn driver(base_url: &str) -> ZarinpalDriver {
        let settings = ZarinpalDriver::default_settings()
            .with("merchant_id", "00000000-0000-0000-0000-000000000000")
            .with("base_url", base_url)
            .with("currency", "R");
        ZarinpalDriver::from_context(DriverContext {
            name: "zarinpal".to_string(),
            settings,
        })
        .expect("driver should build")
    }

    fn invoice(amount: u64) -> Invoice {
        let mut invoice = Invoice::new();
        invoice.set_amount(amount).unwrap();
        invoice
    }

    #[test]
    fn missing_merchant_id_is_rejected() {
        let result = ZarinpalDriver::from_context(DriverContext {
            name: "zarinpal".to_string(),
            settings: ZarinpalDriver::default_settings(),
        });
        assert!(matches!(
            result,
            Err(PaymentError::ValidationError { field: Some(ref f), .. }) if f == "merchant_id"
        ));
    }

    #[tokio::test]
    async fn purchase_stores_authority() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pg/v4/payment/request.json"))
            .and(body_partial_json(json!({"amount": 10000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"code": 100, "message": "Success", "authority": "A00000000000000000000000000217885159", "fee_type": "Merchant", "fee": 100},
                "errors": []
            })))
            .mount(&server)
            .await;

        let driver = driver(&server.uri());
        let mut invoice = invoice(10000);
        let authority = driver.purchase(&mut invoice).await.unwrap();

        assert_eq!(authority, "A00000000000000000000000000217885159");
        assert_eq!(invoice.transaction_id(), Some(authority.as_str()));
        let form = driver.pay(&invoice).await.unwrap();
        assert_eq!(
            form.action(),
            format!("{}/pg/StartPay/{}", server.uri(), authority)
        );
    }

    #[tokio::test]
    async fn purchase_error_maps_code_to_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pg/v4/payment/request.json"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "data": [],
                "errors": {"code": -11, "message": "The merchant is not active", "validations": []}
            })))
            .mount(&server)
            .await;

        let mut invoice = invoice(10000);
        let err = driver(&server.uri())
            .purchase(&mut invoice)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::PurchaseFailed { .. }));
        assert_eq!(err.gateway_code(), Some("-11"));
        assert_eq!(err.user_message(), "مرچنت کد فعال نیست");
        assert!(invoice.transaction_id().is_none());
    }

    #[tokio::test]
    async fn verify_builds_receipt_and_is_repeatable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pg/v4/payment/verify.json"))
            .and(body_partial_json(json!({"authority": "A1", "amount": 10000})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"code": 100, "ref_id": 201, "card_pan": "502229******5995", "card_hash": "1EBE3EBEBE35C7EC0F8D6EE4F2F859107A87822CA179BC9528767EA7B5489B69", "fee": 0},
                "errors": []
            })))
            .mount(&server)
            .await;

        let driver = driver(&server.uri());
        let mut invoice = invoice(10000);
        invoice.set_transaction_id("A1");
        let callback = CallbackRequest::from_query([("Authority", "A1"), ("Status", "OK")]);

        let first = driver.verify(&invoice, &callback).await.unwrap();
        let second = driver.verify(&invoice, &callback).await.unwrap();
        assert_eq!(first.reference_id(), "201");
        assert_eq!(first.reference_id(), second.reference_id());
        assert_eq!(first.details(), second.details());
        assert_eq!(
            first.detail("card_pan"),
            Some(&json!("502229******5995"))
        );
    }

    #[tokio::test]
    async fn cancelled_callback_does_not_call_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut invoice = invoice(10000);
        invoice.set_transaction_id("A1");
        let err = driver(&server.uri())
            .verify(
                &invoice,
                &CallbackRequest::from_query([("Authority", "A1"), ("Status", "NOK")]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.gateway_code(), Some("NOK"));
    }
}
