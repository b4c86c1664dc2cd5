pub mod payments;

#[cfg(feature = "server")]
pub mod api;
#[cfg(feature = "server")]
pub mod config;
#[cfg(feature = "server")]
pub mod logging;
#[cfg(feature = "server")]
pub mod middleware;

pub use payments::{
    CallbackRequest, Driver, DriverRegistry, EventBus, Invoice, Payment, PaymentConfig,
    PaymentError, PaymentResult, Receipt, RedirectionForm,
};
