use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Result of a successful verification.
///
/// Built once by a driver's `verify` and never mutated afterwards: details
/// can only be attached through the consuming `with_detail` builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    driver: String,
    reference_id: String,
    date: DateTime<Utc>,
    details: Map<String, JsonValue>,
}

impl Receipt {
    pub fn new(driver: impl Into<String>, reference_id: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            reference_id: reference_id.into(),
            date: Utc::now(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attaches a detail only when the gateway actually returned it.
    pub fn with_optional_detail<V: Into<JsonValue>>(
        self,
        key: impl Into<String>,
        value: Option<V>,
    ) -> Self {
        match value {
            Some(value) => self.with_detail(key, value),
            None => self,
        }
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// The gateway's canonical reference, the value reconciliation relies on.
    pub fn reference_id(&self) -> &str {
        &self.reference_id
    }

    /// Verification time, not payment time.
    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn detail(&self, key: &str) -> Option<&JsonValue> {
        self.details.get(key)
    }

    pub fn details(&self) -> &Map<String, JsonValue> {
        &self.details
    }
}
