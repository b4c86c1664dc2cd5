use crate::payments::callback::CallbackRequest;
use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::{gateway_amount, require_setting, transaction_id_or, BuiltinDriver};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::settings::{lenient, CommonSettings, Settings};
use crate::payments::utils::{
    code_to_string, endpoint, lookup_message, GatewayHttpClient, GatewayStage, RequestAuth,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

const API_URL: &str = "https://nextpay.org";

const TOKEN_ISSUED: &str = "-1";
const PAID: &str = "0";

const MESSAGES: &[(&str, &str)] = &[
    ("0", "پرداخت تکمیل و با موفقیت انجام شده است"),
    ("-1", "منتظر ارسال تراکنش و ادامه پرداخت"),
    ("-2", "پرداخت رد شده توسط کاربر یا بانک"),
    ("-3", "پرداخت در حال انتظار جواب بانک"),
    ("-4", "پرداخت لغو شده است"),
    ("-20", "کد api_key ارسال نشده است"),
    ("-21", "کد trans_id ارسال نشده است"),
    ("-22", "مبلغ ارسال نشده"),
    ("-23", "لینک ارسال نشده"),
    ("-24", "مبلغ صحیح نیست"),
    ("-25", "تراکنش قبلا انجام و قابل ارسال نیست"),
    ("-26", "مقدار توکن ارسال نشده است"),
    ("-27", "شماره سفارش صحیح نیست"),
    ("-28", "مقدار فیلد سفارشی [custom_json_fields] از نوع json نیست"),
    ("-29", "کد بازگشت مبلغ صحیح نیست"),
    ("-30", "مبلغ کمتر از حداقل پرداختی است"),
    ("-31", "صندوق کاربری موجود نیست"),
    ("-32", "مسیر بازگشت صحیح نیست"),
    ("-33", "کلید مجوز دهی صحیح نیست"),
    ("-34", "کد تراکنش صحیح نیست"),
    ("-35", "ساختار کلید مجوز دهی صحیح نیست"),
    ("-36", "شماره سفارش ارسال نشد است"),
    ("-37", "شماره تراکنش یافت نشد"),
    ("-38", "توکن ارسالی موجود نیست"),
    ("-39", "کلید مجوز دهی موجود نیست"),
    ("-40", "کلید مجوزدهی مسدود شده است"),
    ("-41", "خطا در دریافت پارامتر، شماره شناسایی صحت اعتبار که از بانک ارسال شده موجود نیست"),
    ("-42", "سیستم پرداخت دچار مشکل شده است"),
    ("-43", "درگاه پرداختی برای انجام درخواست یافت نشد"),
    ("-44", "پاسخ دریاف شده از بانک نامعتبر است"),
    ("-45", "سیستم پرداخت غیر فعال است"),
    ("-46", "درخواست نامعتبر"),
    ("-47", "کلید مجوز دهی یافت نشد [حذف شده]"),
    ("-48", "نرخ کمیسیون تعیین نشده است"),
    ("-49", "تراکنش مورد نظر تکراریست"),
    ("-50", "حساب کاربری برای صندوق مالی یافت نشد"),
    ("-51", "شناسه کاربری یافت نشد"),
    ("-52", "حساب کاربری تایید نشده است"),
    ("-60", "ایمیل صحیح نیست"),
    ("-61", "کد ملی صحیح نیست"),
    ("-62", "کد پستی صحیح نیست"),
    ("-63", "آدرس پستی صحیح نیست و یا بیش از ۱۵۰ کارکتر است"),
    ("-64", "توضیحات صحیح نیست و یا بیش از ۱۵۰ کارکتر است"),
    ("-65", "نام و نام خانوادگی صحیح نیست و یا بیش از ۳۵ کاکتر است"),
    ("-66", "تلفن صحیح نیست"),
    ("-67", "نام کاربری صحیح نیست یا بیش از ۳۰ کارکتر است"),
    ("-68", "نام محصول صحیح نیست و یا بیش از ۳۰ کارکتر است"),
    ("-69", "آدرس ارسالی برای بازگشت موفق صحیح نیست و یا بیش از ۱۰۰ کارکتر است"),
    ("-70", "آدرس ارسالی برای بازگشت ناموفق صحیح نیست و یا بیش از ۱۰۰ کارکتر است"),
    ("-71", "موبایل صحیح نیست"),
    ("-72", "بانک پاسخگو نبوده است لطفا با نکست پی تماس بگیرید"),
    ("-73", "مسیر بازگشت دارای خطا میباشد یا بسیار طولانیست"),
    ("-90", "بازگشت مبلغ بدرستی انجام شد"),
    ("-91", "عملیات ناموفق در بازگشت مبلغ"),
    ("-92", "در عملیات بازگشت مبلغ خطا رخ داده است"),
    ("-93", "موجودی صندوق کاربری برای بازگشت مبلغ کافی نیست"),
    ("-94", "کلید بازگشت مبلغ یافت نشد"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct NextpayConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    #[serde(default, deserialize_with = "lenient::string")]
    pub api_key: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub base_url: Option<String>,
}

pub struct NextpayDriver {
    name: String,
    config: NextpayConfig,
    http: GatewayHttpClient,
}

impl NextpayDriver {
    pub fn new(name: impl Into<String>, config: NextpayConfig) -> PaymentResult<Self> {
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
            .with("callback_url", "http://127.0.0.1:8000/payments/nextpay/callback")
            .with("description", "payment using nextpay")
            .with("currency", "T")
            .with("timeout_secs", 30)
    }

    fn url(&self, path: &str) -> String {
        endpoint(self.config.base_url.as_deref().unwrap_or(API_URL), path)
    }

    /// Nextpay takes Toman.
    fn amount(&self, invoice: &Invoice) -> PaymentResult<u64> {
        gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Nextpay.native_unit(),
        )
    }

    async fn post(
        &self,
        path: &str,
        form: &[(&str, String)],
        stage: GatewayStage,
    ) -> PaymentResult<JsonValue> {
        self.http
            .post_form(&self.url(path), RequestAuth::None, form)
            .await
            .and_then(|reply| reply.json())
            .map_err(|e| e.into_payment_error(&self.name, stage))
    }
}

#[async_trait]
impl Driver for NextpayDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        let amount = self.amount(invoice)?;
        let callback_url = self.config.common.require_callback_url(&self.name)?;

        let mut form = vec![
            ("api_key", self.config.api_key.clone()),
            ("order_id", invoice.uuid().to_string()),
            ("amount", amount.to_string()),
            ("callback_uri", callback_url.to_string()),
        ];
        if let Some(mobile) = invoice.detail_str("mobile") {
            form.push(("customer_phone", mobile));
        }
        if let Some(description) = invoice
            .detail_str("description")
            .or_else(|| self.config.common.description.clone())
        {
            form.push(("payer_desc", description));
        }

        let body = self
            .post("/nx/gateway/token", &form, GatewayStage::Purchase)
            .await?;
        let code = body.get("code").and_then(code_to_string).unwrap_or_default();
        if code != TOKEN_ISSUED {
            warn!(driver = %self.name, code = %code, "Nextpay rejected the token request");
            return Err(PaymentError::purchase_failed(
                &self.name,
                lookup_message(MESSAGES, &code),
                Some(code),
            ));
        }

        let trans_id = body
            .get("trans_id")
            .and_then(code_to_string)
            .ok_or_else(|| PaymentError::purchase_failed(&self.name, "trans_id missing", None))?;
        invoice.set_transaction_id(trans_id.clone());
        info!(driver = %self.name, transaction_id = %trans_id, "Nextpay payment registered");
        Ok(trans_id)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        Ok(RedirectionForm::get(self.url(&format!(
            "/nx/gateway/payment/{}",
            invoice.transaction_id().unwrap_or_default()
        ))))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        let trans_id = transaction_id_or(invoice, callback.input("trans_id")).ok_or_else(|| {
            PaymentError::invalid_payment(&self.name, "trans_id is missing", None)
        })?;
        let amount = self.amount(invoice)?;

        let form = [
            ("api_key", self.config.api_key.clone()),
            ("trans_id", trans_id.clone()),
            ("amount", amount.to_string()),
        ];
        let body = self
            .post("/nx/gateway/verify", &form, GatewayStage::Verify)
            .await?;
        let code = body.get("code").and_then(code_to_string).unwrap_or_default();
        if code != PAID {
            return Err(PaymentError::invalid_payment(
                &self.name,
                lookup_message(MESSAGES, &code),
                Some(code),
            ));
        }

        let reference = body
            .get("Shaparak_Ref_Id")
            .and_then(code_to_string)
            .ok_or_else(|| {
                PaymentError::invalid_payment(&self.name, "Shaparak_Ref_Id missing", None)
            })?;

        info!(driver = %self.name, transaction_id = %trans_id, reference_id = %reference, "Nextpay payment verified");
        Ok(Receipt::new(&self.name, reference)
            .with_detail("trans_id", trans_id)
            .with_optional_detail("card_holder", body.get("card_holder").cloned())
            .with_optional_detail("order_id", body.get("order_id").cloned()))
    }
}
