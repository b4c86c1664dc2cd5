//! Driver-based payment gateway core.
//!
//! A [`Payment`] carries one [`Invoice`] through a gateway in three
//! stages: `purchase` registers it, `pay` produces the [`RedirectionForm`]
//! that sends the payer to the gateway, and `verify` turns the gateway's
//! callback into a [`Receipt`]. Gateways are pluggable [`Driver`]s looked
//! up by name in a [`DriverRegistry`].

pub mod callback;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod events;
pub mod invoice;
pub mod payment;
pub mod receipt;
pub mod redirection;
pub mod registry;
pub mod settings;
pub mod utils;

pub use callback::CallbackRequest;
pub use driver::{Driver, DriverContext};
pub use drivers::BuiltinDriver;
pub use error::{PaymentError, PaymentResult};
pub use events::{EventBus, EventKind, ListenerId, PaymentEvent};
pub use invoice::{IntoAmount, Invoice};
pub use payment::{Payment, PurchaseOutcome, Stage};
pub use receipt::Receipt;
pub use redirection::{FormMethod, RedirectionForm};
pub use registry::{DriverConstructor, DriverRegistry, PaymentConfig};
pub use settings::{CommonSettings, CurrencyUnit, Settings};
