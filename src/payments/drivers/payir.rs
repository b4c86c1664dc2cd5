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

const API_URL: &str = "https://pay.ir";
/// Merchant key pay.ir accepts on its test terminal.
const SANDBOX_API_KEY: &str = "test";

const ERRORS: &[(&str, &str)] = &[
    ("0", "درحال حاضر درگاه بانکی قطع شده و مشکل بزودی برطرف می شود"),
    ("-1", "API Key ارسال نمی شود"),
    ("-2", "Token ارسال نمی شود"),
    ("-3", "API Key ارسال شده اشتباه است"),
    ("-4", "امکان انجام تراکنش برای این پذیرنده وجود ندارد"),
    ("-5", "تراکنش با خطا مواجه شده است"),
    ("-6", "تراکنش تکراریست یا قبلا انجام شده"),
    ("-7", "مقدار Token ارسالی اشتباه است"),
    ("-8", "شماره تراکنش ارسالی اشتباه است"),
    ("-9", "زمان مجاز برای انجام تراکنش تمام شده"),
    ("-10", "مبلغ تراکنش ارسال نمی شود"),
    ("-11", "مبلغ تراکنش باید به صورت عددی و با کاراکترهای لاتین باشد"),
    ("-12", "مبلغ تراکنش می بایست عددی بین 10,000 و 500,000,000 ریال باشد"),
    ("-13", "مقدار آدرس بازگشتی ارسال نمی شود"),
    ("-14", "آدرس بازگشتی ارسالی با آدرس درگاه ثبت شده در شبکه پرداخت پی یکسان نیست"),
    ("-15", "امکان وریفای وجود ندارد. این تراکنش پرداخت نشده است"),
    ("-16", "یک یا چند شماره موبایل از اطلاعات پذیرندگان ارسال شده اشتباه است"),
    ("-17", "میزان سهم ارسالی باید بصورت عددی و بین 1 تا 100 باشد"),
    ("-18", "فرمت پذیرندگان صحیح نمی باشد"),
    ("-19", "هر پذیرنده فقط یک سهم میتواند داشته باشد"),
    ("-20", "مجموع سهم پذیرنده ها باید 100 درصد باشد"),
    ("-21", "Reseller ID ارسالی اشتباه است"),
    ("-22", "فرمت یا طول مقادیر ارسالی به درگاه اشتباه است"),
    ("-23", "سوییچ PSP ( درگاه بانک ) قادر به پردازش درخواست نیست"),
    ("-24", "شماره کارت باید بصورت 16 رقمی، لاتین و چسبیده بهم باشد"),
    ("-25", "امکان استفاده از سرویس در کشور مبدا شما وجود نداره"),
    ("-26", "امکان انجام تراکنش برای این درگاه وجود ندارد"),
    ("-27", "در انتظار تایید درگاه توسط شاپرک"),
    ("-28", "امکان تسهیم تراکنش برای این درگاه وجود ندارد"),
];

const CANCELLED_MESSAGE: &str = "پرداخت توسط کاربر لغو شد یا ناموفق بود";

#[derive(Debug, Clone, Deserialize)]
pub struct PayirConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default, deserialize_with = "lenient::string")]
    pub merchant_id: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_url: Option<String>,
}

pub struct PayirDriver {
    name: String,
    config: PayirConfig,
    http: GatewayHttpClient,
}

impl PayirDriver {
    pub fn new(name: impl Into<String>, config: PayirConfig) -> PaymentResult<Self> {
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
            .with("callback_url", "http://127.0.0.1:8000/payments/payir/callback")
            .with("description", "payment using pay.ir")
            .with("currency", "T")
            .with("sandbox", false)
            .with("timeout_secs", 30)
    }

    fn api_key(&self) -> &str {
        if self.config.common.sandbox {
            SANDBOX_API_KEY
        } else {
            self.config.merchant_id.as_str()
        }
    }

    fn url(&self, path: &str) -> String {
        endpoint(self.config.base_url.as_deref().unwrap_or(API_URL), path)
    }

    fn amount(&self, invoice: &Invoice) -> PaymentResult<u64> {
        gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Payir.native_unit(),
        )
    }

    /// pay.ir reports `status: 1` on success and `errorCode` otherwise,
    /// sometimes with a 4xx status.
    fn check_status(&self, body: &JsonValue, stage: GatewayStage) -> PaymentResult<()> {
        let status = body.get("status").and_then(code_to_string);
        if status.as_deref() == Some("1") {
            return Ok(());
        }
        let code = body
            .get("errorCode")
            .and_then(code_to_string)
            .or(status)
            .unwrap_or_else(|| "0".to_string());
        warn!(driver = %self.name, code = %code, "pay.ir rejected the request");
        Err(stage.error(&self.name, lookup_message(ERRORS, &code), Some(code)))
    }
}

#[async_trait]
impl Driver for PayirDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        let amount = self.amount(invoice)?;
        let callback_url = self.config.common.require_callback_url(&self.name)?;

        let payload = json!({
            "api": self.api_key(),
            "amount": amount,
            "redirect": callback_url,
            "mobile": invoice.detail_str("mobile"),
            "factorNumber": invoice.uuid().to_string(),
            "description": invoice
                .detail_str("description")
                .or_else(|| self.config.common.description.clone()),
        });

        let reply = self
            .http
            .post_json(&self.url("/pg/send"), &payload, &[])
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;
        let body: JsonValue = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Purchase))?;
        self.check_status(&body, GatewayStage::Purchase)?;

        let token = body
            .get("token")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::purchase_failed(&self.name, "token missing", None))?;
        invoice.set_transaction_id(token.clone());
        info!(driver = %self.name, transaction_id = %token, "pay.ir payment registered");
        Ok(token)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        Ok(RedirectionForm::get(self.url(&format!(
            "/pg/{}",
            invoice.transaction_id().unwrap_or_default()
        ))))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        if callback.input("status") != Some("1") {
            return Err(PaymentError::invalid_payment(
                &self.name,
                CANCELLED_MESSAGE,
                callback.input("status").map(str::to_string),
            ));
        }

        let token = transaction_id_or(invoice, callback.input("token"))
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "token is missing", None))?;
        let expected = self.amount(invoice)?;

        let reply = self
            .http
            .post_json(
                &self.url("/pg/verify"),
                &json!({ "api": self.api_key(), "token": token }),
                &[],
            )
            .await
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;
        let body: JsonValue = reply
            .json()
            .map_err(|e| e.into_payment_error(&self.name, GatewayStage::Verify))?;
        self.check_status(&body, GatewayStage::Verify)?;

        let paid = body.get("amount").and_then(code_to_string);
        if paid.as_deref() != Some(expected.to_string().as_str()) {
            warn!(driver = %self.name, expected = expected, paid = ?paid, "pay.ir amount mismatch");
            return Err(PaymentError::invalid_payment(
                &self.name,
                "مبلغ پرداخت شده با مبلغ فاکتور مطابقت ندارد",
                Some("amount_mismatch".to_string()),
            ));
        }

        let trans_id = body
            .get("transId")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::invalid_payment(&self.name, "transId missing", None))?;

        info!(driver = %self.name, transaction_id = %token, reference_id = %trans_id, "pay.ir payment verified");
        Ok(Receipt::new(&self.name, trans_id)
            .with_optional_detail("card_number", body.get("cardNumber").cloned())
            .with_optional_detail("factor_number", body.get("factorNumber").cloned())
            .with_optional_detail("mobile", body.get("mobile").cloned())
            .with_detail("token", token))
    }
}
