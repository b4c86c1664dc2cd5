use crate::payments::callback::CallbackRequest;
use crate::payments::driver::Driver;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::events::{EventBus, PaymentEvent};
use crate::payments::invoice::{IntoAmount, Invoice};
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use crate::payments::registry::DriverRegistry;
use crate::payments::settings::Settings;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a [`Payment`] is in the purchase → pay → verify protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unconfigured,
    Configured,
    Purchased,
    Redirected,
    Verified,
    Failed,
}

/// Result of a successful purchase, for the caller to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseOutcome {
    pub driver: String,
    pub transaction_id: String,
    pub invoice: Invoice,
}

/// Runs one invoice through a gateway.
///
/// Meant to be created per request. The registry and event bus are shared;
/// everything else (selected driver, setting overrides, invoice) belongs to
/// this instance.
pub struct Payment {
    registry: Arc<DriverRegistry>,
    events: Arc<EventBus>,
    driver_name: Option<String>,
    overrides: Settings,
    invoice: Option<Invoice>,
    stage: Stage,
    /// Instance built by the last stage; reused until the driver or its
    /// settings change.
    driver: Option<Box<dyn Driver>>,
}

impl Payment {
    pub fn new(registry: Arc<DriverRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            events,
            driver_name: None,
            overrides: Settings::new(),
            invoice: None,
            stage: Stage::Unconfigured,
            driver: None,
        }
    }

    /// Selects the driver. Overrides set for another driver are dropped;
    /// overrides set before any `via` belong to the registry default.
    pub fn via(&mut self, name: &str) -> PaymentResult<&mut Self> {
        self.registry.resolve(name)?;

        if self.active_driver() != name {
            self.overrides.clear();
        }
        self.driver_name = Some(name.to_string());
        self.driver = None;
        if let Some(invoice) = self.invoice.as_mut() {
            invoice.via(name);
        }
        self.stage = Stage::Configured;
        Ok(self)
    }

    /// Overrides one setting of the selected driver for this payment only.
    pub fn config(&mut self, key: &str, value: impl Into<JsonValue>) -> &mut Self {
        self.overrides.set(key, value);
        self.driver = None;
        self
    }

    pub fn callback_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.config("callback_url", url.into())
    }

    pub fn amount(&mut self, amount: impl IntoAmount) -> PaymentResult<&mut Self> {
        self.invoice_mut().set_amount(amount)?;
        Ok(self)
    }

    pub fn detail(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> &mut Self {
        self.invoice_mut().set_detail(key, value);
        self
    }

    pub fn details<K, V, I>(&mut self, details: I) -> &mut Self
    where
        K: Into<String>,
        V: Into<JsonValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.invoice_mut().set_details(details);
        self
    }

    /// Sets a transaction id known from elsewhere, typically when a callback
    /// is handled by a different process than the purchase.
    pub fn transaction_id(&mut self, transaction_id: impl Into<String>) -> &mut Self {
        self.invoice_mut().set_transaction_id(transaction_id);
        self
    }

    pub fn with_invoice(&mut self, mut invoice: Invoice) -> &mut Self {
        if let Some(name) = &self.driver_name {
            invoice.via(name.as_str());
        }
        self.invoice = Some(invoice);
        self
    }

    pub fn driver_name(&self) -> Option<&str> {
        self.driver_name.as_deref()
    }

    pub fn invoice(&self) -> Option<&Invoice> {
        self.invoice.as_ref()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Effective settings: registry defaults of the active driver with this
    /// payment's overrides on top.
    pub fn settings(&self) -> PaymentResult<Settings> {
        let defaults = self.registry.resolve(self.active_driver())?;
        Ok(defaults.merged_with(&self.overrides))
    }

    pub async fn purchase_with(&mut self, invoice: Invoice) -> PaymentResult<PurchaseOutcome> {
        self.with_invoice(invoice);
        self.purchase().await
    }

    /// Registers the invoice with the gateway. Uses the registry's default
    /// driver when none was selected, and always builds a fresh driver.
    pub async fn purchase(&mut self) -> PaymentResult<PurchaseOutcome> {
        if self.driver_name.is_none() {
            let default = self.registry.default_driver().to_string();
            self.via(&default)?;
        }
        let name = self.active_driver().to_string();

        if self.invoice.as_ref().and_then(Invoice::amount).is_none() {
            self.stage = Stage::Failed;
            return Err(PaymentError::validation(
                "invoice amount is required before purchase",
                Some("amount"),
            ));
        }

        let driver = match self.registry.instantiate(&name, &self.overrides) {
            Ok(driver) => driver,
            Err(e) => return Err(self.fail("purchase", e)),
        };
        let invoice = self.invoice.get_or_insert_with(Invoice::new);
        invoice.via(name.as_str());

        let result = driver.purchase(invoice).await;
        let transaction_id = match result {
            Ok(transaction_id) => transaction_id,
            Err(e) => {
                self.driver = Some(driver);
                return Err(self.fail("purchase", e));
            }
        };
        if invoice.transaction_id() != Some(transaction_id.as_str()) {
            invoice.set_transaction_id(transaction_id.clone());
        }
        info!(
            driver = %name,
            invoice_id = %invoice.uuid(),
            transaction_id = %transaction_id,
            "Payment purchased"
        );

        let dispatched = self.events.dispatch(&PaymentEvent::Purchase {
            driver: driver.as_ref(),
            invoice,
        });
        let outcome = PurchaseOutcome {
            driver: name,
            transaction_id,
            invoice: invoice.clone(),
        };
        self.driver = Some(driver);
        if let Err(e) = dispatched {
            return Err(self.fail("purchase", e));
        }

        self.stage = Stage::Purchased;
        Ok(outcome)
    }

    /// Builds the hand-off to the gateway page for a purchased invoice.
    pub async fn pay(&mut self) -> PaymentResult<RedirectionForm> {
        if self
            .invoice
            .as_ref()
            .and_then(Invoice::transaction_id)
            .is_none()
        {
            return Err(PaymentError::InvoiceNotFound {
                reason: "pay requires a purchased invoice with a transaction id".to_string(),
            });
        }
        if let Err(e) = self.ensure_driver() {
            return Err(self.fail("pay", e));
        }

        let (Some(driver), Some(invoice)) = (self.driver.as_deref(), self.invoice.as_ref()) else {
            return Err(PaymentError::InvoiceNotFound {
                reason: "no invoice to pay".to_string(),
            });
        };

        let result = match driver.pay(invoice).await {
            Ok(form) => {
                let dispatched = self.events.dispatch(&PaymentEvent::Pay {
                    driver,
                    invoice,
                    form: &form,
                });
                dispatched.map(|()| form)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(form) => {
                info!(
                    driver = %driver.name(),
                    invoice_id = %invoice.uuid(),
                    method = %form.method(),
                    "Payment redirection prepared"
                );
                self.stage = Stage::Redirected;
                Ok(form)
            }
            Err(e) => Err(self.fail("pay", e)),
        }
    }

    /// Confirms the payment with the gateway using the callback data.
    pub async fn verify(&mut self, callback: &CallbackRequest) -> PaymentResult<Receipt> {
        if self.invoice.is_none() {
            return Err(PaymentError::InvoiceNotFound {
                reason: "verify requires an invoice".to_string(),
            });
        }
        if let Err(e) = self.ensure_driver() {
            return Err(self.fail("verify", e));
        }

        let (Some(driver), Some(invoice)) = (self.driver.as_deref(), self.invoice.as_ref()) else {
            return Err(PaymentError::InvoiceNotFound {
                reason: "no invoice to verify".to_string(),
            });
        };

        let result = match driver.verify(invoice, callback).await {
            Ok(receipt) => {
                let dispatched = self.events.dispatch(&PaymentEvent::Verify {
                    receipt: &receipt,
                    driver,
                    invoice,
                });
                dispatched.map(|()| receipt)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(receipt) => {
                info!(
                    driver = %driver.name(),
                    invoice_id = %invoice.uuid(),
                    reference_id = %receipt.reference_id(),
                    "Payment verified"
                );
                self.stage = Stage::Verified;
                Ok(receipt)
            }
            Err(e) => Err(self.fail("verify", e)),
        }
    }

    fn active_driver(&self) -> &str {
        self.driver_name
            .as_deref()
            .unwrap_or_else(|| self.registry.default_driver())
    }

    fn invoice_mut(&mut self) -> &mut Invoice {
        let driver_name = self.driver_name.as_deref();
        self.invoice.get_or_insert_with(|| {
            let mut invoice = Invoice::new();
            if let Some(name) = driver_name {
                invoice.via(name);
            }
            invoice
        })
    }

    /// Builds the driver for pay/verify unless the last stage left one.
    fn ensure_driver(&mut self) -> PaymentResult<()> {
        if self.driver.is_some() {
            return Ok(());
        }
        if self.driver_name.is_none() {
            let default = self.registry.default_driver().to_string();
            self.via(&default)?;
        }
        let driver = self
            .registry
            .instantiate(self.active_driver(), &self.overrides)?;
        self.driver = Some(driver);
        Ok(())
    }

    fn fail(&mut self, stage: &str, error: PaymentError) -> PaymentError {
        warn!(
            driver = %self.active_driver(),
            stage = stage,
            error = %error,
            "Payment stage failed"
        );
        self.stage = Stage::Failed;
        error
    }
}

impl std::fmt::Debug for Payment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payment")
            .field("driver_name", &self.driver_name)
            .field("overrides", &self.overrides)
            .field("invoice", &self.invoice)
            .field("stage", &self.stage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::driver::DriverContext;
    use crate::payments::events::EventKind;
    use crate::payments::redirection::FormMethod;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoDriver {
        name: String,
        settings: Settings,
    }

    #[async_trait]
    impl Driver for EchoDriver {
        fn name(&self) -> &str {
            &self.name
        }

        async fn purchase(&self, invoice: &mut Invoice) -> PaymentResult<String> {
            if self.settings.get("reject") == Some(&json!(true)) {
                return Err(PaymentError::purchase_failed(&self.name, "rejected", Some("-1".into())));
            }
            if self.settings.get("skip_invoice_update") != Some(&json!(true)) {
                invoice.set_transaction_id("ECHO-1");
            }
            Ok("ECHO-1".to_string())
        }

        async fn pay(&self, invoice: &Invoice) -> PaymentResult<RedirectionForm> {
            let callback = self
                .settings
                .get("callback_url")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            Ok(RedirectionForm::post(callback)
                .with_field("id", invoice.transaction_id().unwrap_or_default()))
        }

        async fn verify(
            &self,
            invoice: &Invoice,
            _callback: &CallbackRequest,
        ) -> PaymentResult<Receipt> {
            Ok(Receipt::new(
                &self.name,
                format!("REF-{}", invoice.transaction_id().unwrap_or_default()),
            ))
        }
    }

    fn registry(constructions: Arc<AtomicUsize>) -> Arc<DriverRegistry> {
        let mut registry = DriverRegistry::new("echo");
        registry.register_kind("echo", move |context: DriverContext| {
            constructions.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EchoDriver {
                name: context.name,
                settings: context.settings,
            }) as Box<dyn Driver>)
        });
        registry
            .register_driver(
                "echo",
                Settings::new().with("callback_url", "https://shop.test/default"),
                "echo",
            )
            .unwrap();
        registry
            .register_driver(
                "echo-2",
                Settings::new().with("callback_url", "https://shop.test/second"),
                "echo",
            )
            .unwrap();
        Arc::new(registry)
    }

    fn payment() -> Payment {
        Payment::new(registry(Arc::default()), Arc::new(EventBus::new()))
    }

    #[test]
    fn new_payment_is_unconfigured() {
        let payment = payment();
        assert_eq!(payment.stage(), Stage::Unconfigured);
        assert!(payment.driver_name().is_none());
        assert!(payment.invoice().is_none());
    }

    #[test]
    fn overrides_do_not_leak_across_drivers() {
        let mut payment = payment();
        payment.via("echo").unwrap().callback_url("https://shop.test/override");
        assert_eq!(
            payment.settings().unwrap().get("callback_url"),
            Some(&json!("https://shop.test/override"))
        );

        payment.via("echo-2").unwrap();
        assert_eq!(
            payment.settings().unwrap().get("callback_url"),
            Some(&json!("https://shop.test/second"))
        );
    }

    #[test]
    fn unknown_driver_leaves_state_untouched() {
        let mut payment = payment();
        payment.via("echo").unwrap().config("key", "value");
        assert!(matches!(
            payment.via("nope"),
            Err(PaymentError::DriverNotFound { .. })
        ));
        assert_eq!(payment.driver_name(), Some("echo"));
        assert_eq!(payment.settings().unwrap().get("key"), Some(&json!("value")));
    }

    #[tokio::test]
    async fn purchase_defaults_driver_and_requires_amount() {
        let mut payment = payment();
        let err = payment.purchase().await.unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError { .. }));
        assert_eq!(payment.stage(), Stage::Failed);

        payment.amount(1000).unwrap();
        let outcome = payment.purchase().await.unwrap();
        assert_eq!(outcome.driver, "echo");
        assert_eq!(outcome.transaction_id, "ECHO-1");
        assert_eq!(outcome.invoice.driver(), Some("echo"));
        assert_eq!(payment.stage(), Stage::Purchased);
    }

    #[tokio::test]
    async fn chained_stages_reuse_the_driver_until_settings_change() {
        let constructions = Arc::new(AtomicUsize::new(0));
        let mut payment = Payment::new(registry(constructions.clone()), Arc::new(EventBus::new()));
        payment.via("echo").unwrap().amount(500).unwrap();

        payment.purchase().await.unwrap();
        let form = payment.pay().await.unwrap();
        assert_eq!(form.method(), FormMethod::Post);
        assert_eq!(form.action(), "https://shop.test/default");
        let receipt = payment.verify(&CallbackRequest::default()).await.unwrap();
        assert_eq!(receipt.reference_id(), "REF-ECHO-1");
        assert_eq!(payment.stage(), Stage::Verified);
        assert_eq!(constructions.load(Ordering::SeqCst), 1);

        payment.callback_url("https://shop.test/changed");
        let form = payment.pay().await.unwrap();
        assert_eq!(form.action(), "https://shop.test/changed");
        assert_eq!(constructions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn driver_errors_propagate_unchanged() {
        let mut payment = payment();
        payment.via("echo").unwrap().config("reject", true);
        payment.amount(1000).unwrap();

        let err = payment.purchase().await.unwrap_err();
        assert!(matches!(err, PaymentError::PurchaseFailed { ref code, .. } if code.as_deref() == Some("-1")));
        assert_eq!(payment.stage(), Stage::Failed);
        assert!(payment.invoice().unwrap().transaction_id().is_none());
    }

    #[tokio::test]
    async fn overrides_before_via_apply_to_the_default_driver() {
        let mut payment = payment();
        payment.callback_url("https://shop.test/mine");
        payment.amount(1000).unwrap();

        payment.purchase().await.unwrap();
        assert_eq!(payment.driver_name(), Some("echo"));
        assert_eq!(
            payment.settings().unwrap().get("callback_url"),
            Some(&json!("https://shop.test/mine"))
        );
        let form = payment.pay().await.unwrap();
        assert_eq!(form.action(), "https://shop.test/mine");
    }

    #[test]
    fn reselecting_the_same_driver_keeps_overrides() {
        let mut payment = payment();
        payment.via("echo").unwrap().config("key", "value");
        payment.via("echo").unwrap();
        assert_eq!(payment.settings().unwrap().get("key"), Some(&json!("value")));

        payment.via("echo-2").unwrap();
        assert_eq!(payment.settings().unwrap().get("key"), None);
    }

    #[tokio::test]
    async fn purchase_records_the_returned_transaction_id() {
        let mut payment = payment();
        payment.via("echo").unwrap().config("skip_invoice_update", true);
        payment.amount(1000).unwrap();

        let outcome = payment.purchase().await.unwrap();
        assert_eq!(outcome.invoice.transaction_id(), Some("ECHO-1"));
        assert_eq!(payment.invoice().unwrap().transaction_id(), Some("ECHO-1"));
        assert!(payment.pay().await.is_ok());
    }

    #[tokio::test]
    async fn verify_without_invoice_is_invoice_not_found() {
        let mut payment = payment();
        payment.via("echo").unwrap();
        let err = payment.verify(&CallbackRequest::default()).await.unwrap_err();
        assert!(matches!(err, PaymentError::InvoiceNotFound { .. }));
    }

    #[tokio::test]
    async fn failing_listener_fails_the_stage() {
        let mut events = EventBus::new();
        events.add_listener(EventKind::Pay, |_| anyhow::bail!("audit log unavailable"));
        let mut payment = Payment::new(registry(Arc::default()), Arc::new(events));
        payment.via("echo").unwrap().amount(1000).unwrap();
        payment.purchase().await.unwrap();

        let err = payment.pay().await.unwrap_err();
        assert!(matches!(err, PaymentError::ListenerFailed { ref event, .. } if event == "pay"));
        assert_eq!(payment.stage(), Stage::Failed);
    }
}
