use crate::payments::driver::{Driver, DriverContext};
use crate::payments::drivers::BuiltinDriver;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::settings::Settings;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds a driver instance from its registry name and merged settings.
pub type DriverConstructor =
    Arc<dyn Fn(DriverContext) -> PaymentResult<Box<dyn Driver>> + Send + Sync>;

/// `{ default, drivers: {name: settings}, map: {name: kind} }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentConfig {
    pub default: String,
    #[serde(default)]
    pub drivers: IndexMap<String, Settings>,
    #[serde(default)]
    pub map: IndexMap<String, String>,
}

impl Default for PaymentConfig {
    /// Every built-in driver registered under its own name.
    fn default() -> Self {
        let mut drivers = IndexMap::new();
        let mut map = IndexMap::new();
        for kind in BuiltinDriver::ALL {
            drivers.insert(kind.as_str().to_string(), kind.default_settings());
            map.insert(kind.as_str().to_string(), kind.as_str().to_string());
        }
        Self {
            default: BuiltinDriver::Local.as_str().to_string(),
            drivers,
            map,
        }
    }
}

impl PaymentConfig {
    /// Layers the bundled defaults, an optional config file and
    /// `MULTIPAY__`-prefixed environment variables, in that order.
    ///
    /// `MULTIPAY__DRIVERS__ZARINPAL__MERCHANT_ID=...` sets
    /// `drivers.zarinpal.merchant_id`.
    pub fn load(path: Option<&str>) -> PaymentResult<Self> {
        let defaults = config::Config::try_from(&PaymentConfig::default()).map_err(config_error)?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let loaded: PaymentConfig = builder
            .add_source(
                config::Environment::with_prefix("MULTIPAY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        debug!(
            default = %loaded.default,
            drivers = loaded.drivers.len(),
            "Payment configuration loaded"
        );
        Ok(loaded)
    }
}

fn config_error(e: config::ConfigError) -> PaymentError {
    PaymentError::ValidationError {
        message: format!("invalid payment configuration: {}", e),
        field: Some("payments".to_string()),
    }
}

/// Name → {settings defaults, driver kind} registry, plus the constructors
/// for every known kind.
pub struct DriverRegistry {
    default_driver: String,
    drivers: IndexMap<String, Settings>,
    map: IndexMap<String, String>,
    kinds: HashMap<String, DriverConstructor>,
}

impl DriverRegistry {
    /// Empty registry without any kinds.
    pub fn new(default_driver: impl Into<String>) -> Self {
        Self {
            default_driver: default_driver.into(),
            drivers: IndexMap::new(),
            map: IndexMap::new(),
            kinds: HashMap::new(),
        }
    }

    /// Registry with every built-in kind available and the drivers the
    /// configuration declares. Mappings to unknown kinds surface on
    /// [`resolve`](Self::resolve).
    pub fn from_config(config: PaymentConfig) -> Self {
        let mut registry = Self::new(config.default);
        for kind in BuiltinDriver::ALL {
            registry.register_kind(kind.as_str(), move |context| kind.build(context));
        }
        registry.drivers = config.drivers;
        registry.map = config.map;
        info!(
            default = %registry.default_driver,
            drivers = registry.drivers.len(),
            "Driver registry initialized"
        );
        registry
    }

    pub fn register_kind<F>(&mut self, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(DriverContext) -> PaymentResult<Box<dyn Driver>> + Send + Sync + 'static,
    {
        self.kinds.insert(kind.into(), Arc::new(constructor));
        self
    }

    /// Declares a driver name. Fails right away when `kind` has no
    /// constructor.
    pub fn register_driver(
        &mut self,
        name: impl Into<String>,
        defaults: Settings,
        kind: impl Into<String>,
    ) -> PaymentResult<&mut Self> {
        let name = name.into();
        let kind = kind.into();
        if !self.kinds.contains_key(&kind) {
            return Err(PaymentError::driver_not_found(
                name,
                format!("driver kind '{}' is not registered", kind),
            ));
        }
        self.drivers.insert(name.clone(), defaults);
        self.map.insert(name, kind);
        Ok(self)
    }

    pub fn set_default_driver(&mut self, name: impl Into<String>) -> &mut Self {
        self.default_driver = name.into();
        self
    }

    pub fn default_driver(&self) -> &str {
        &self.default_driver
    }

    /// Driver names that have both settings and a kind mapping.
    pub fn names(&self) -> Vec<&str> {
        self.drivers
            .keys()
            .filter(|name| self.map.contains_key(*name))
            .map(String::as_str)
            .collect()
    }

    /// Checks that `name` is fully registered and returns its default
    /// settings.
    pub fn resolve(&self, name: &str) -> PaymentResult<&Settings> {
        let settings = self.drivers.get(name);
        let kind = self.map.get(name);
        match (settings, kind) {
            (None, None) => Err(PaymentError::driver_not_found(
                name,
                "driver is not registered",
            )),
            (None, Some(_)) => Err(PaymentError::driver_not_found(
                name,
                "driver has no settings entry",
            )),
            (Some(_), None) => Err(PaymentError::driver_not_found(
                name,
                "driver has no kind mapping",
            )),
            (Some(settings), Some(kind)) => {
                if !self.kinds.contains_key(kind) {
                    return Err(PaymentError::driver_not_found(
                        name,
                        format!("driver kind '{}' has no constructor", kind),
                    ));
                }
                Ok(settings)
            }
        }
    }

    /// Builds a fresh driver for `name` with `defaults ∪ overrides`.
    pub fn instantiate(&self, name: &str, overrides: &Settings) -> PaymentResult<Box<dyn Driver>> {
        let defaults = self.resolve(name)?;
        let constructor = self
            .map
            .get(name)
            .and_then(|kind| self.kinds.get(kind))
            .ok_or_else(|| PaymentError::driver_not_found(name, "driver kind disappeared"))?;

        let settings = defaults.merged_with(overrides);
        debug!(
            driver = name,
            overrides = %overrides.keys().collect::<Vec<_>>().join(","),
            "Instantiating driver"
        );
        constructor(DriverContext {
            name: name.to_string(),
            settings,
        })
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::from_config(PaymentConfig::default())
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("DriverRegistry")
            .field("default_driver", &self.default_driver)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("map", &self.map)
            .field("kinds", &kinds)
            .finish()
    }
}
