use crate::payments::error::{PaymentError, PaymentResult};
use bigdecimal::{BigDecimal, ToPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Per-driver configuration bag.
///
/// Registry defaults and caller overrides are merged key by key (last write
/// wins, no deep merge). Drivers read it through [`Settings::parse`] into
/// their own typed config struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Settings(Map<String, JsonValue>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Returns `self ∪ overrides`, the override winning on every shared key.
    pub fn merged_with(&self, overrides: &Settings) -> Settings {
        let mut merged = self.0.clone();
        for (key, value) in &overrides.0 {
            merged.insert(key.clone(), value.clone());
        }
        Settings(merged)
    }

    pub fn parse<T: DeserializeOwned>(&self, driver: &str) -> PaymentResult<T> {
        serde_json::from_value(JsonValue::Object(self.0.clone())).map_err(|e| {
            PaymentError::ValidationError {
                message: format!("invalid settings for driver {}: {}", driver, e),
                field: Some(driver.to_string()),
            }
        })
    }
}

impl<K: Into<String>, V: Into<JsonValue>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Settings(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Keys every built-in driver understands, flattened into each driver's
/// typed config.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonSettings {
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub callback_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub description: Option<String>,
    /// Unit the invoice amount is expressed in.
    #[serde(default)]
    pub currency: CurrencyUnit,
    #[serde(default = "default_timeout_secs", deserialize_with = "lenient::u64")]
    pub timeout_secs: u64,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub sandbox: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

impl CommonSettings {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn require_callback_url(&self, driver: &str) -> PaymentResult<&str> {
        self.callback_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| PaymentError::ValidationError {
                message: format!("callback_url is required for driver {}", driver),
                field: Some("callback_url".to_string()),
            })
    }
}

/// Deserializers that accept the stringly-typed values environment
/// variables produce as well as native JSON/TOML types.
pub(crate) mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
        Text(String),
    }

    impl Scalar {
        fn into_text(self) -> String {
            match self {
                Scalar::Bool(b) => b.to_string(),
                Scalar::Unsigned(n) => n.to_string(),
                Scalar::Signed(n) => n.to_string(),
                Scalar::Float(n) => n.to_string(),
                Scalar::Text(s) => s,
            }
        }
    }

    pub fn u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Scalar::deserialize(deserializer)? {
            Scalar::Unsigned(n) => Ok(n),
            Scalar::Text(s) => s.trim().parse().map_err(D::Error::custom),
            _ => Err(D::Error::custom("expected an unsigned integer")),
        }
    }

    pub fn bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Scalar::deserialize(deserializer)? {
            Scalar::Bool(b) => Ok(b),
            Scalar::Unsigned(n) => Ok(n != 0),
            Scalar::Text(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" | "" => Ok(false),
                other => Err(D::Error::custom(format!("invalid boolean: {}", other))),
            },
            _ => Err(D::Error::custom("expected a boolean")),
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(Scalar::deserialize(deserializer)?.into_text())
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_text))
    }
}

/// Iranian currency units. Gateways disagree on which one their API takes,
/// so every driver declares its native unit and conversion happens here.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum CurrencyUnit {
    #[default]
    #[serde(rename = "R", alias = "IRR", alias = "rial")]
    Rial,
    #[serde(rename = "T", alias = "IRT", alias = "toman")]
    Toman,
}

impl CurrencyUnit {
    /// One Toman is ten Rials.
    pub const RIALS_PER_TOMAN: u32 = 10;

    pub fn code(&self) -> &'static str {
        match self {
            CurrencyUnit::Rial => "IRR",
            CurrencyUnit::Toman => "IRT",
        }
    }

    /// Converts an amount expressed in `self` into a whole number of `target`
    /// units, the form every gateway API accepts.
    pub fn convert(&self, amount: &BigDecimal, target: CurrencyUnit) -> PaymentResult<u64> {
        let factor = BigDecimal::from(Self::RIALS_PER_TOMAN);
        let converted = match (self, target) {
            (CurrencyUnit::Toman, CurrencyUnit::Rial) => amount * &factor,
            (CurrencyUnit::Rial, CurrencyUnit::Toman) => amount / &factor,
            _ => amount.clone(),
        };

        if !converted.is_integer() {
            return Err(PaymentError::validation(
                format!(
                    "amount {} {} is not a whole number of {}",
                    amount,
                    self.code(),
                    target.code()
                ),
                Some("amount"),
            ));
        }

        converted.to_u64().ok_or_else(|| {
            PaymentError::validation(
                format!("amount {} is out of range for the gateway", amount),
                Some("amount"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn overrides_win_key_by_key() {
        let defaults = Settings::new()
            .with("merchant_id", "xxxx")
            .with("callback_url", "https://shop.test/default")
            .with("sandbox", false);
        let overrides = Settings::new().with("callback_url", "https://shop.test/override");

        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.get("merchant_id"), Some(&json!("xxxx")));
        assert_eq!(
            merged.get("callback_url"),
            Some(&json!("https://shop.test/override"))
        );
        assert_eq!(merged.get("sandbox"), Some(&json!(false)));
        // defaults are untouched
        assert_eq!(
            defaults.get("callback_url"),
            Some(&json!("https://shop.test/default"))
        );
    }

    #[test]
    fn nested_values_are_replaced_not_merged() {
        let defaults = Settings::new().with("headers", json!({"a": 1, "b": 2}));
        let overrides = Settings::new().with("headers", json!({"a": 3}));
        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.get("headers"), Some(&json!({"a": 3})));
    }

    #[test]
    fn currency_conversion() {
        let amount = BigDecimal::from(1500);
        assert_eq!(
            CurrencyUnit::Toman.convert(&amount, CurrencyUnit::Rial).unwrap(),
            15000
        );
        assert_eq!(
            CurrencyUnit::Rial.convert(&amount, CurrencyUnit::Toman).unwrap(),
            150
        );
        assert_eq!(
            CurrencyUnit::Rial.convert(&amount, CurrencyUnit::Rial).unwrap(),
            1500
        );

        let odd = BigDecimal::from(1505);
        assert!(CurrencyUnit::Rial.convert(&odd, CurrencyUnit::Toman).is_err());
        let fractional = BigDecimal::from_str("10.5").unwrap();
        assert!(CurrencyUnit::Rial.convert(&fractional, CurrencyUnit::Rial).is_err());
        let negative = BigDecimal::from(-10);
        assert!(CurrencyUnit::Rial.convert(&negative, CurrencyUnit::Rial).is_err());
    }

    #[test]
    fn common_settings_accept_env_style_strings() {
        let settings = Settings::new()
            .with("callback_url", "https://shop.test/callback")
            .with("timeout_secs", "45")
            .with("sandbox", "true")
            .with("currency", "T");
        let common: CommonSettings = settings.parse("zarinpal").unwrap();
        assert_eq!(common.timeout_secs, 45);
        assert!(common.sandbox);
        assert_eq!(common.currency, CurrencyUnit::Toman);
        assert_eq!(
            common.require_callback_url("zarinpal").unwrap(),
            "https://shop.test/callback"
        );

        let defaults: CommonSettings = Settings::new().parse("zarinpal").unwrap();
        assert_eq!(defaults.timeout_secs, 30);
        assert!(!defaults.sandbox);
        assert!(defaults.require_callback_url("zarinpal").is_err());
    }

    #[test]
    fn malformed_settings_are_validation_errors() {
        let err = Settings::new()
            .with("timeout_secs", "soon")
            .parse::<CommonSettings>("idpay")
            .unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError { field: Some(ref f), .. } if f == "idpay"));
    }

    #[test]
    fn currency_unit_deserializes_from_setting_codes() {
        let unit: CurrencyUnit = serde_json::from_value(json!("T")).unwrap();
        assert_eq!(unit, CurrencyUnit::Toman);
        let unit: CurrencyUnit = serde_json::from_value(json!("IRR")).unwrap();
        assert_eq!(unit, CurrencyUnit::Rial);
    }
}
