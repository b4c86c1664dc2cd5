use crate::payments::callback::CallbackRequest;
use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::{gateway_amount, require_setting, transaction_id_or, BuiltinDriver};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::settings::{lenient, CommonSettings, Settings};
use crate::payments::utils::{
    code_to_string, endpoint, lookup_message, GatewayHttpClient, GatewayReply, GatewayStage,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

const API_URL: &str = "https://api.idpay.ir";
const PAYMENT_URL: &str = "https://idpay.ir/p/ws";
const SANDBOX_PAYMENT_URL: &str = "https://idpay.ir/p/ws-sandbox";

/// Callback status meaning "paid, waiting for verification".
const READY_TO_VERIFY: &str = "10";
const VERIFIED_STATUSES: &[&str] = &["100", "101", "200"];

/// `error_code` values of 4xx responses.
const ERRORS: &[(&str, &str)] = &[
    ("11", "کاربر مسدود شده است."),
    ("12", "API Key یافت نشد."),
    ("13", "درخواست شما از IP ثبت شده در وب سرویس ارسال نشده است."),
    ("14", "وب سرویس تایید نشده است."),
    ("21", "حساب بانکی متصل به وب سرویس تایید نشده است."),
    ("31", "کد تراکنش id نباید خالی باشد."),
    ("32", "شماره سفارش order_id نباید خالی باشد."),
    ("33", "مبلغ amount نباید خالی باشد."),
    ("34", "مبلغ amount باید بیشتر از حداقل مجاز باشد."),
    ("35", "مبلغ amount باید کمتر از حداکثر مجاز باشد."),
    ("36", "مبلغ amount بیشتر از حد مجاز است."),
    ("37", "آدرس بازگشت callback نباید خالی باشد."),
    ("38", "درخواست شما از دامنه ثبت شده در وب سرویس ارسال نشده است."),
    ("51", "تراکنش ایجاد نشد."),
    ("52", "استعلام نتیجه ای نداشت."),
    ("53", "تایید پرداخت امکان پذیر نیست."),
    ("54", "مدت زمان تایید پرداخت سپری شده است."),
];

/// Transaction `status` values, reported on the callback and by verify.
const STATUSES: &[(&str, &str)] = &[
    ("1", "پرداخت انجام نشده است."),
    ("2", "پرداخت ناموفق بوده است."),
    ("3", "خطا رخ داده است."),
    ("4", "بلوکه شده."),
    ("5", "برگشت به پرداخت کننده."),
    ("6", "برگشت خورده سیستمی."),
    ("7", "انصراف از پرداخت."),
    ("8", "به درگاه پرداخت منتقل شد."),
    ("10", "در انتظار تایید پرداخت."),
    ("100", "پرداخت تایید شده است."),
    ("101", "پرداخت قبلا تایید شده است."),
    ("200", "به دریافت کننده واریز شد."),
];

#[derive(Debug, Clone, Deserialize)]
pub struct IdpayConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default, deserialize_with = "lenient::string")]
    pub api_key: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub payment_url: Option<String>,
}

pub struct IdpayDriver {
    name: String,
    config: IdpayConfig,
    http: GatewayHttpClient,
}

impl IdpayDriver {
    pub fn new(name: impl Into<String>, config: IdpayConfig) -> PaymentResult<Self> {
        let name = name.into();
        require_setting(&name, "api_key", &config.api_key)?;
        let http = GatewayHttpClient::new(config.common.timeout())?;
        Ok(Self { name, config, http })
    }

    pub fn from_context(context: DriverContext) -> PaymentResult<Self> {
        let config = context.settings.parse(&context.name)?;
        Self::new(context.name, config)
    }

    pub fn default_settings() -> Settings {
        Settings::new()
            .with("api_key", "")
            .with("callback_url", "http://127.0.0.1:8000/payments/idpay/callback")
            .with("description", "payment using idpay")
            .with("currency", "T")
            .with("sandbox", false)
            .with("timeout_secs", 30)
    }

    fn api_url(&self, path: &str) -> String {
        endpoint(self.config.base_url.as_deref().unwrap_or(API_URL), path)
    }

    fn headers(&self) -> [(&str, &str); 2] {
        [
            ("X-API-KEY", self.config.api_key.as_str()),
            ("X-SANDBOX", if self.config.common.sandbox { "1" } else { "0" }),
        ]
    }

    fn amount(&self, invoice: &Invoice) -> PaymentResult<u64> {
        gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Idpay.native_unit(),
        )
    }

    fn rejection(&self, reply: &GatewayReply, stage: GatewayStage) -> PaymentError {
        let code = reply
            .json::<JsonValue>()
            .ok()
            .and_then(|body| body.get("error_code").and_then(code_to_string))
            .unwrap_or_else(|| reply.status.as_u16().to_string());
        warn!(driver = %self.name, code = %code, status = %reply.status, "IDPay rejected the request");
        stage.error(&self.name, lookup_message(ERRORS, &code), Some(code))
    }
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[allow(dead_code)]
    link: String,
}

#[async_trait]
impl Driver for IdpayDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        let amount = self.amount(invoice)?;
        let callback_url = self.config.common.require_callback_url(&self.name)?;

        let payload = json!({
            "order_id": invoice.uuid().to_string(),
            "amount": amount,
            "name": invoice.detail_str("name"),
            "phone": invoice.detail_str("mobile").or_else(|| invoice.detail_str("phone")),
            "mail": invoice.detail_str("email"),
            "desc": invoice
                .detail_str("description")
                .or_else(|| self.config.common.description.clone()),
            "callback": callback_url,
        });

        let reply = self
            .http
            .post_json(&self.api_url("/v1.1/payment"), &payload, &self.headers())
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;
        if !reply.is_success() {
            return Err(self.rejection(&reply, GatewayStage::Purchase));
        }

        let created: CreateResponse = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;
        invoice.set_transaction_id(created.id.clone());
        info!(driver = %self.name, transaction_id = %created.id, "IDPay payment registered");
        Ok(created.id)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        let base = match &self.config.payment_url {
            Some(url) => url.as_str(),
            None if self.config.common.sandbox => SANDBOX_PAYMENT_URL,
            None => PAYMENT_URL,
        };
        Ok(RedirectionForm::get(endpoint(
            base,
            invoice.transaction_id().unwrap_or_default(),
        )))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        let status = callback.input("status").unwrap_or_default();
        if status != READY_TO_VERIFY {
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(STATUSES, status),
                Some(status.to_string()),
            ));
        }

        let id = transaction_id_or(invoice, callback.input("id"))
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "id is missing", None))?;
        let order_id = callback
            .input("order_id")
            .map(str::to_string)
            .unwrap_or_else(|| invoice.uuid().to_string());

        let reply = self
            .http
            .post_json(
                &self.api_url("/v1.1/payment/verify"),
                &json!({ "id": id, "order_id": order_id }),
                &self.headers(),
            )
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;
        if !reply.is_success() {
            return Err(self.rejection(&reply, GatewayStage::Verify));
        }

        let body: JsonValue = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;
        let status = body
            .get("status")
            .and_then(code_to_string)
            .unwrap_or_default();
        if !VERIFIED_STATUSES.contains(&status.as_str()) {
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(STATUSES, &status),
                Some(status),
            ));
        }

        let track_id = body
            .pointer("/payment/track_id")
            .or_else(|| body.get("track_id"))
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "track_id missing", None))?;

        info!(driver = %self.name, transaction_id = %id, reference_id = %track_id, "IDPay payment verified");
        Ok(Receipt::new(&self.name, track_id)
            .with_detail("order_id", order_id)
            .with_optional_detail("card_no", body.pointer("/payment/card_no").cloned())
            .with_optional_detail(
                "hashed_card_no",
                body.pointer("/payment/hashed_card_no").cloned(),
            )
            .with_optional_detail("paid_at", body.pointer("/payment/date").cloned()))
    }
}
