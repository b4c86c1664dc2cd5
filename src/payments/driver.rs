use crate::payments::callback::CallbackRequest;
use crate::payments::error::PaymentResult;
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::settings::Settings;
use async_trait::async_trait;

/// One payment gateway integration.
///
/// A gateway payment always runs in three steps: register the intent with
/// the gateway (`purchase`), send the payer to the hosted page (`pay`), and
/// once the payer is back, confirm server-to-server (`verify`). The callback
/// data is never trusted on its own; `verify` must ask the gateway.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Registry name this instance was built under.
    fn name(&self) -> &str;

    /// Registers the payment and stores the gateway's transaction id on the
    /// invoice before returning it.
    async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String>;

    /// Builds the hand-off to the gateway's hosted page.
    async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm>;

    /// Confirms the payment with the gateway using the callback data.
    async fn verify(&self, invoice: &Invoice, callback: &CallbackRequest)
        -> PaymentResult<Receipt>;
}

/// What a driver constructor receives: the name it is registered under and
/// the merged settings for this invocation.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub name: String,
    pub settings: Settings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::PaymentError;

    struct FixedDriver {
        name: String,
    }

    #[async_trait]
    impl Driver for FixedDriver {
        fn name(&self) -> &str {
            &self.name
        }

        async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
            invoice.set_transaction_id("T-100");
            Ok("T-100".to_string())
        }

        async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
            let transaction_id = invoice.transaction_id().unwrap_or_default();
            Ok(RedirectionForm::get(format!(
                "https://gateway.test/start/{}",
                transaction_id
            )))
        }

        async fn verify(
            &self,
            invoice: &Invoice,
            callback: &CallbackRequest,
        ) -> PaymentResult<Receipt> {
            if callback.input("status") != Some("OK") {
                return Err(PaymentError::invalid_payment(
                    self.name(),
                    "payment was cancelled",
                    None,
                ));
            }
            Ok(Receipt::new(
                self.name(),
                invoice.transaction_id().unwrap_or_default(),
            ))
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_and_boxed() {
        let driver: Box<dyn Driver> = Box::new(FixedDriver {
            name: "fixed".to_string(),
        });
        let mut invoice = Invoice::new();

        let transaction_id = driver.purchase(&mut invoice).await.unwrap();
        assert_eq!(invoice.transaction_id(), Some(transaction_id.as_str()));

        let form = driver.pay(&invoice).await.unwrap();
        assert_eq!(form.action(), "https://gateway.test/start/T-100");

        let cancelled = driver
            .verify(&invoice, &CallbackRequest::from_query([("status", "NOK")]))
            .await;
        assert!(matches!(cancelled, Err(PaymentError::InvalidPayment { .. })));

        let receipt = driver
            .verify(&invoice, &CallbackRequest::from_query([("status", "OK")]))
            .await
            .unwrap();
        assert_eq!(receipt.reference_id(), "T-100");
    }
}
