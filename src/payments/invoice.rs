use crate::payments::error::{PaymentError, PaymentResult};
use bigdecimal::{BigDecimal, FromPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::str::FromStr;
use uuid::Uuid;

/// Values accepted as an invoice amount.
///
/// Integers always convert; floats must be finite and strings must parse as
/// a decimal number. Anything else is a [`PaymentError::ValidationError`].
pub trait IntoAmount {
    fn into_amount(self) -> PaymentResult<BigDecimal>;
}

macro_rules! impl_into_amount_for_int {
    ($($t:ty),*) => {
        $(
            impl IntoAmount for $t {
                fn into_amount(self) -> PaymentResult<BigDecimal> {
                    Ok(BigDecimal::from(self))
                }
            }
        )*
    };
}

impl_into_amount_for_int!(u32, u64, i32, i64);

impl IntoAmount for f64 {
    fn into_amount(self) -> PaymentResult<BigDecimal> {
        BigDecimal::from_f64(self).ok_or_else(|| {
            PaymentError::validation(format!("amount must be numeric, got {}", self), Some("amount"))
        })
    }
}

impl IntoAmount for &str {
    fn into_amount(self) -> PaymentResult<BigDecimal> {
        BigDecimal::from_str(self.trim()).map_err(|_| {
            PaymentError::validation(format!("amount must be numeric, got '{}'", self), Some("amount"))
        })
    }
}

impl IntoAmount for String {
    fn into_amount(self) -> PaymentResult<BigDecimal> {
        self.as_str().into_amount()
    }
}

impl IntoAmount for BigDecimal {
    fn into_amount(self) -> PaymentResult<BigDecimal> {
        Ok(self)
    }
}

impl IntoAmount for &JsonValue {
    fn into_amount(self) -> PaymentResult<BigDecimal> {
        match self {
            JsonValue::Number(n) => n.to_string().as_str().into_amount(),
            JsonValue::String(s) => s.as_str().into_amount(),
            other => Err(PaymentError::validation(
                format!("amount must be numeric, got {}", other),
                Some("amount"),
            )),
        }
    }
}

/// A pending or completed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
    uuid: Uuid,
    amount: Option<BigDecimal>,
    details: Map<String, JsonValue>,
    transaction_id: Option<String>,
    driver: Option<String>,
}

impl Default for Invoice {
    fn default() -> Self {
        Self::new()
    }
}

impl Invoice {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            amount: None,
            details: Map::new(),
            transaction_id: None,
            driver: None,
        }
    }

    /// Correlation id, also used by gateways as the order key.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn set_uuid(&mut self, uuid: Uuid) -> &mut Self {
        self.uuid = uuid;
        self
    }

    pub fn reset_uuid(&mut self) -> &mut Self {
        self.uuid = Uuid::new_v4();
        self
    }

    pub fn set_amount(&mut self, amount: impl IntoAmount) -> PaymentResult<&mut Self> {
        self.amount = Some(amount.into_amount()?);
        Ok(self)
    }

    pub fn amount(&self) -> Option<&BigDecimal> {
        self.amount.as_ref()
    }

    /// Sets one detail; a later call with the same key replaces the value.
    pub fn set_detail(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> &mut Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn set_details<K, V, I>(&mut self, details: I) -> &mut Self
    where
        K: Into<String>,
        V: Into<JsonValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in details {
            self.details.insert(key.into(), value.into());
        }
        self
    }

    pub fn detail(&self, key: &str) -> Option<&JsonValue> {
        self.details.get(key)
    }

    /// String view of a detail, for gateway fields such as `mobile`.
    pub fn detail_str(&self, key: &str) -> Option<String> {
        match self.details.get(key)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn details(&self) -> &Map<String, JsonValue> {
        &self.details
    }

    pub fn set_transaction_id(&mut self, transaction_id: impl Into<String>) -> &mut Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn via(&mut self, driver: impl Into<String>) -> &mut Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }
}
