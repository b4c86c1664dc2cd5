//! Lifecycle notifications for the purchase, pay and verify stages.
//!
//! An [`EventBus`] is built once, populated with listeners, and then shared
//! behind an `Arc` by every [`Payment`](crate::payments::payment::Payment)
//! that should report to it. Registration takes `&mut self`, so listeners
//! are fixed before the bus is shared and dispatch needs no locking.
//!
//! Listeners run synchronously in registration order. The first listener
//! that returns an error stops the dispatch and the error reaches the caller
//! of the stage that emitted the event.

use crate::payments::driver::Driver;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::invoice::Invoice;
use crate::payments::receipt::Receipt;
use crate::payments::redirection::RedirectionForm;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Purchase,
    Pay,
    Verify,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Purchase => "purchase",
            EventKind::Pay => "pay",
            EventKind::Verify => "verify",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub enum PaymentEvent<'a> {
    Purchase {
        driver: &'a dyn Driver,
        invoice: &'a Invoice,
    },
    Pay {
        driver: &'a dyn Driver,
        invoice: &'a Invoice,
        form: &'a RedirectionForm,
    },
    Verify {
        receipt: &'a Receipt,
        driver: &'a dyn Driver,
        invoice: &'a Invoice,
    },
}

impl PaymentEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            PaymentEvent::Purchase { .. } => EventKind::Purchase,
            PaymentEvent::Pay { .. } => EventKind::Pay,
            PaymentEvent::Verify { .. } => EventKind::Verify,
        }
    }

    pub fn driver(&self) -> &dyn Driver {
        match self {
            PaymentEvent::Purchase { driver, .. }
            | PaymentEvent::Pay { driver, .. }
            | PaymentEvent::Verify { driver, .. } => *driver,
        }
    }

    pub fn invoice(&self) -> &Invoice {
        match self {
            PaymentEvent::Purchase { invoice, .. }
            | PaymentEvent::Pay { invoice, .. }
            | PaymentEvent::Verify { invoice, .. } => invoice,
        }
    }
}

pub type Listener = Arc<dyn for<'a> Fn(&PaymentEvent<'a>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F>(&mut self, kind: EventKind, listener: F) -> ListenerId
    where
        F: for<'a> Fn(&PaymentEvent<'a>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Removes one listener, or every listener of `kind` when `id` is `None`.
    /// Returns how many were removed.
    pub fn remove_listener(&mut self, kind: EventKind, id: Option<ListenerId>) -> usize {
        let Some(registered) = self.listeners.get_mut(&kind) else {
            return 0;
        };
        let before = registered.len();
        match id {
            Some(id) => registered.retain(|(existing, _)| *existing != id),
            None => registered.clear(),
        }
        before - registered.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event: &PaymentEvent<'_>) -> PaymentResult<()> {
        let kind = event.kind();
        let Some(registered) = self.listeners.get(&kind) else {
            return Ok(());
        };

        debug!(event = %kind, listeners = registered.len(), "Dispatching payment event");
        for (_, listener) in registered {
            listener(event).map_err(|e| PaymentError::ListenerFailed {
                event: kind.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .listeners
            .iter()
            .map(|(kind, listeners)| (kind.as_str(), listeners.len()))
            .collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}
