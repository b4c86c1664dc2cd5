pub mod digipay;
pub mod idpay;
pub mod local;
pub mod nextpay;
pub mod payir;
pub mod sep;
pub mod zarinpal;
pub mod zibal;

pub use digipay::DigipayDriver;
pub use idpay::IdpayDriver;
pub use local::LocalDriver;
pub use nextpay::NextpayDriver;
pub use payir::PayirDriver;
pub use sep::SepDriver;
pub use zarinpal::ZarinpalDriver;
pub use zibal::ZibalDriver;

use crate::payments::driver::{Driver, DriverContext};
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::invoice::Invoice;
use crate::payments::settings::{CurrencyUnit, Settings};
use std::str::FromStr;

/// Gateways shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinDriver {
    Local,
    Zarinpal,
    Idpay,
    Payir,
    Zibal,
    Nextpay,
    Sep,
    Digipay,
}

impl BuiltinDriver {
    pub const ALL: [BuiltinDriver; 8] = [
        BuiltinDriver::Local,
        BuiltinDriver::Zarinpal,
        BuiltinDriver::Idpay,
        BuiltinDriver::Payir,
        BuiltinDriver::Zibal,
        BuiltinDriver::Nextpay,
        BuiltinDriver::Sep,
        BuiltinDriver::Digipay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinDriver::Local => "local",
            BuiltinDriver::Zarinpal => "zarinpal",
            BuiltinDriver::Idpay => "idpay",
            BuiltinDriver::Payir => "payir",
            BuiltinDriver::Zibal => "zibal",
            BuiltinDriver::Nextpay => "nextpay",
            BuiltinDriver::Sep => "sep",
            BuiltinDriver::Digipay => "digipay",
        }
    }

    /// Unit the gateway's API expects amounts in.
    pub fn native_unit(&self) -> CurrencyUnit {
        match self {
            BuiltinDriver::Nextpay => CurrencyUnit::Toman,
            _ => CurrencyUnit::Rial,
        }
    }

    pub fn default_settings(&self) -> Settings {
        match self {
            BuiltinDriver::Local => LocalDriver::default_settings(),
            BuiltinDriver::Zarinpal => ZarinpalDriver::default_settings(),
            BuiltinDriver::Idpay => IdpayDriver::default_settings(),
            BuiltinDriver::Payir => PayirDriver::default_settings(),
            BuiltinDriver::Zibal => ZibalDriver::default_settings(),
            BuiltinDriver::Nextpay => NextpayDriver::default_settings(),
            BuiltinDriver::Sep => SepDriver::default_settings(),
            BuiltinDriver::Digipay => DigipayDriver::default_settings(),
        }
    }

    pub fn build(&self, context: DriverContext) -> PaymentResult<Box<dyn Driver>> {
        Ok(match self {
            BuiltinDriver::Local => Box::new(LocalDriver::from_context(context)?),
            BuiltinDriver::Zarinpal => Box::new(ZarinpalDriver::from_context(context)?),
            BuiltinDriver::Idpay => Box::new(IdpayDriver::from_context(context)?),
            BuiltinDriver::Payir => Box::new(PayirDriver::from_context(context)?),
            BuiltinDriver::Zibal => Box::new(ZibalDriver::from_context(context)?),
            BuiltinDriver::Nextpay => Box::new(NextpayDriver::from_context(context)?),
            BuiltinDriver::Sep => Box::new(SepDriver::from_context(context)?),
            BuiltinDriver::Digipay => Box::new(DigipayDriver::from_context(context)?),
        })
    }
}

impl std::fmt::Display for BuiltinDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BuiltinDriver {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        BuiltinDriver::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .or(match normalized.as_str() {
                "pay.ir" => Some(BuiltinDriver::Payir),
                "saman" => Some(BuiltinDriver::Sep),
                _ => None,
            })
            .ok_or_else(|| PaymentError::driver_not_found(value, "unknown driver kind"))
    }
}

/// Invoice amount converted to the gateway's unit, as a whole number.
pub(crate) fn gateway_amount(
    invoice: &Invoice,
    invoice_unit: CurrencyUnit,
    gateway_unit: CurrencyUnit,
) -> PaymentResult<u64> {
    let amount = invoice
        .amount()
        .ok_or_else(|| PaymentError::validation("invoice amount is required", Some("amount")))?;
    invoice_unit.convert(amount, gateway_unit)
}

/// Transaction id for the verify stage: the one stored on the invoice, or
/// the one the gateway echoed on the callback.
pub(crate) fn transaction_id_or(invoice: &Invoice, callback_value: Option<&str>) -> Option<String> {
    invoice
        .transaction_id()
        .or(callback_value)
        .filter(|v| !v.trim().is_empty())
        .map(str::to_string)
}

pub(crate) fn require_setting(driver: &str, key: &str, value: &str) -> PaymentResult<()> {
    if value.trim().is_empty() {
        return Err(PaymentError::ValidationError {
            message: format!("{} is required for driver {}", key, driver),
            field: Some(key.to_string()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_round_trip() {
        for kind in BuiltinDriver::ALL {
            assert_eq!(BuiltinDriver::from_str(kind.as_str()).unwrap(), kind);
        }
        assert_eq!(BuiltinDriver::from_str("Saman").unwrap(), BuiltinDriver::Sep);
        assert!(matches!(
            BuiltinDriver::from_str("paypal"),
            Err(PaymentError::DriverNotFound { .. })
        ));
    }

    #[test]
    fn gateway_amount_respects_units() {
        let mut invoice = Invoice::new();
        assert!(gateway_amount(&invoice, CurrencyUnit::Toman, CurrencyUnit::Rial).is_err());

        invoice.set_amount(1000_u64).unwrap();
        assert_eq!(
            gateway_amount(&invoice, CurrencyUnit::Toman, CurrencyUnit::Rial).unwrap(),
            10000
        );
        assert_eq!(
            gateway_amount(&invoice, CurrencyUnit::Rial, BuiltinDriver::Nextpay.native_unit())
                .unwrap(),
            100
        );
    }

    #[test]
    fn every_builtin_has_defaults_with_currency() {
        for kind in BuiltinDriver::ALL {
            let settings = kind.default_settings();
            assert!(settings.contains_key("currency"), "{}", kind);
        }
    }
}
