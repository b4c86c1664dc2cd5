//! In-process gateway for development and tests. Purchase and verify never
//! leave the process; `pay` sends the payer straight back to the callback
//! URL as if the bank had approved the payment.

use crate::payments::callback::CallbackRequest;
use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::{gateway_amount, transaction_id_or, BuiltinDriver};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::settings::{lenient, CommonSettings, Settings};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

const CANCELLED_MESSAGE: &str = "تراکنش توسط کاربر لغو شد.";
const MISMATCH_MESSAGE: &str = "شناسه تراکنش بازگشتی با فاکتور مطابقت ندارد.";

#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Masked card number reported on receipts.
    #[serde(default = "default_card", deserialize_with = "lenient::string")]
    pub card_number: String,
}

fn default_card() -> String {
    "6037-99**-****-0000".to_string()
}

pub struct LocalDriver {
    name: String,
    config: LocalConfig,
}

impl LocalDriver {
    pub fn new(name: impl Into<String>, config: LocalConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn from_context(context: DriverContext) -> PaymentResult<Self> {
        let config = context.settings.parse(&context.name)?;
        Ok(Self::new(context.name, config))
    }

    pub fn default_settings() -> Settings {
        Settings::new()
            .with("callback_url", "http://127.0.0.1:8000/payments/local/callback")
            .with("description", "local test payment")
            .with("currency", "T")
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
        // validates the amount the same way a real gateway call would
        gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Local.native_unit(),
        )?;

        let transaction_id = Uuid::new_v4().simple().to_string();
        invoice.set_transaction_id(transaction_id.clone());
        info!(
            driver = %self.name,
            invoice_id = %invoice.uuid(),
            transaction_id = %transaction_id,
            "Local payment registered"
        );
        Ok(transaction_id)
    }

    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
        let callback_url = self.config.common.require_callback_url(&self.name)?;
        let amount = gateway_amount(
            invoice,
            self.config.common.currency,
            BuiltinDriver::Local.native_unit(),
        )?;

        Ok(RedirectionForm::get(callback_url)
            .with_field("transaction_id", invoice.transaction_id().unwrap_or_default())
            .with_field("amount", amount.to_string()))
    }

    async fn verify(
        &self,
        invoice: &Invoice,
        callback: &CallbackRequest,
    ) -> PaymentResult<Receipt> {
        if callback.input("cancel").is_some() {
            return Err(PaymentError::invalid_payment(
                &self.name,
                CANCELLED_MESSAGE,
                Some("cancelled".to_string()),
            ));
        }

        let transaction_id = transaction_id_or(invoice, callback.input("transaction_id"))
            .ok_or_else(|| PaymentError::InvoiceNotFound {
                reason: "no transaction id to verify".to_string(),
            })?;
        if let Some(echoed) = callback.input("transaction_id") {
            if echoed != transaction_id {
                return Err(PaymentError::invalid_payment(
                    &self.name,
                    MISMATCH_MESSAGE,
                    Some("mismatch".to_string()),
                ));
            }
        }

        Ok(Receipt::new(&self.name, format!("LOCAL-{}", transaction_id))
            .with_detail("card_number", self.config.card_number.clone())
            .with_detail("invoice_id", invoice.uuid().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> LocalDriver {
        LocalDriver::from_context(DriverContext {
            name: "local".to_string(),
            settings: LocalDriver::default_settings(),
        })
        .expect("local driver should build from defaults")
    }

    #[tokio::test]
    async fn full_local_flow() {
        let driver = driver();
        let mut invoice = Invoice::new();
        invoice.set_amount(1500_u64).unwrap();

        let transaction_id = driver.purchase(&mut invoice).await.unwrap();
        assert_eq!(invoice.transaction_id(), Some(transaction_id.as_str()));

        let form = driver.pay(&invoice).await.unwrap();
        assert_eq!(form.field("amount"), Some("15000"));
        assert_eq!(form.field("transaction_id"), Some(transaction_id.as_str()));

        let callback = CallbackRequest::from_query([("transaction_id", transaction_id.clone())]);
        let receipt = driver.verify(&invoice, &callback).await.unwrap();
        assert_eq!(receipt.reference_id(), format!("LOCAL-{}", transaction_id));
    }

    #[tokio::test]
    async fn cancelled_callback_is_invalid_payment() {
        let driver = driver();
        let mut invoice = Invoice::new();
        invoice.set_amount(1000_u64).unwrap();
        invoice.set_transaction_id("abc");

        let err = driver
            .verify(&invoice, &CallbackRequest::from_query([("cancel", "1")]))
            .await
            .unwrap_err();
        assert_eq!(err.user_message(), CANCELLED_MESSAGE);

        let err = driver
            .verify(
                &invoice,
                &CallbackRequest::from_query([("transaction_id", "other")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidPayment { .. }));
    }

    #[tokio::test]
    async fn purchase_without_amount_fails_validation() {
        let mut invoice = Invoice::new();
        let err = driver().purchase(&mut invoice).await.unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError { .. }));
        assert!(invoice.transaction_id().is_none());
    }
}
