//! Per-feature bridge from the shared bus to a local event stream.
//!
//! An [`EventBridge`] subscribes to an [`EventBus`], runs every posted
//! envelope through a feature-supplied mapper, and forwards the mapped local
//! events to its own consumer. While no consumer is attached (the feature's
//! view is gone) mapped events are buffered and replayed in order on the next
//! [`subscribe`](EventBridge::subscribe).
//!
//! The mapper sees every post, whatever the bridge's attach state. It returns
//! `None` for events the feature does not care about; those are dropped.
//!
//! # Example
//!
//! ```ignore
//! let bridge = EventBridge::typed(&bus, |changed: &SubmissionChanged| {
//!     (changed.assignment_id == assignment_id).then_some(DetailsEvent::Reload)
//! });
//!
//! // View attached:
//! bridge.subscribe(move |event| handle.dispatch(event));
//!
//! // View destroyed; posts keep being mapped and buffered.
//! bridge.unsubscribe();
//!
//! // Feature torn down:
//! bridge.dispose();
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::bus::{Event, EventBus, EventEnvelope, SubscriptionId, Subscriber};
use crate::config::RelayConfig;
use crate::connection::{Connection, ConnectionState, Consumer};
use crate::error::RelayError;
use crate::relay::Relay;

type Mapper<L> = dyn Fn(&EventEnvelope) -> Option<L> + Send + Sync;

struct BridgeInner<L> {
    mapper: Box<Mapper<L>>,
    relay: Relay<L>,
}

impl<L: Send + 'static> Subscriber for BridgeInner<L> {
    fn on_event(&self, envelope: &EventEnvelope) {
        // A post already in flight may still reach a disposed bridge.
        if self.relay.state().is_disposed() {
            return;
        }
        if let Some(local) = (self.mapper)(envelope) {
            self.relay.deliver(local);
        }
    }

    fn name(&self) -> &str {
        std::any::type_name::<L>()
    }

    fn is_closed(&self) -> bool {
        self.relay.state().is_disposed()
    }
}

/// Bus subscriber that maps global events into a feature's local events.
///
/// Dropping the bridge unregisters it from the bus.
pub struct EventBridge<L: Send + 'static> {
    inner: Arc<BridgeInner<L>>,
    bus: EventBus,
    subscription: SubscriptionId,
}

impl<L: Send + 'static> EventBridge<L> {
    /// Register a bridge on `bus` with the default buffer policy.
    pub fn new<M>(bus: &EventBus, mapper: M) -> Self
    where
        M: Fn(&EventEnvelope) -> Option<L> + Send + Sync + 'static,
    {
        Self::with_config(bus, RelayConfig::default(), mapper)
    }

    /// Register a bridge on `bus` with the given buffer policy.
    pub fn with_config<M>(bus: &EventBus, config: RelayConfig, mapper: M) -> Self
    where
        M: Fn(&EventEnvelope) -> Option<L> + Send + Sync + 'static,
    {
        let inner = Arc::new(BridgeInner {
            mapper: Box::new(mapper),
            relay: Relay::with_config("event_bridge", config),
        });
        let subscription = bus.subscribe(&inner);
        Self {
            inner,
            bus: bus.clone(),
            subscription,
        }
    }

    /// Register a bridge whose mapper only sees payloads of type `G`.
    ///
    /// Envelopes carrying any other type map to nothing.
    pub fn typed<G, M>(bus: &EventBus, mapper: M) -> Self
    where
        G: Event,
        M: Fn(&G) -> Option<L> + Send + Sync + 'static,
    {
        Self::new(bus, move |envelope: &EventEnvelope| {
            envelope.downcast_ref::<G>().and_then(&mapper)
        })
    }

    /// Map one global event and forward or buffer the result.
    ///
    /// This is what the bus calls on every post; it can also be fed directly.
    /// Does nothing once disposed.
    pub fn on_global_event(&self, envelope: &EventEnvelope) {
        self.inner.on_event(envelope);
    }

    /// Attach the local consumer, flushing buffered events to it first.
    ///
    /// Replaces any previous consumer. Silent no-op after `dispose`.
    pub fn subscribe<C>(&self, consumer: C)
    where
        C: Consumer<L> + 'static,
    {
        self.inner.relay.attach(Arc::new(consumer));
    }

    /// Like [`subscribe`](Self::subscribe), but reports a disposed bridge.
    pub fn try_subscribe<C>(&self, consumer: C) -> Result<(), RelayError>
    where
        C: Consumer<L> + 'static,
    {
        match self.inner.relay.attach(Arc::new(consumer)) {
            Some(_) => Ok(()),
            None => Err(RelayError::IllegalReconnect {
                target: "EventBridge",
            }),
        }
    }

    /// Detach the local consumer. Mapped events are buffered until the next
    /// `subscribe`.
    pub fn unsubscribe(&self) {
        self.inner.relay.detach();
    }

    /// Permanently stop the bridge and unregister it from the bus.
    ///
    /// Idempotent. No event reaches the consumer after this returns.
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        self.inner.relay.dispose();
        self.bus.unsubscribe(self.subscription);
        debug!(subscription = %self.subscription, "event bridge disposed");
    }

    /// Returns true once disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.relay.state().is_disposed()
    }

    /// Current state of the local side.
    pub fn state(&self) -> ConnectionState {
        self.inner.relay.state()
    }

    /// Number of mapped events waiting for a consumer.
    pub fn pending(&self) -> usize {
        self.inner.relay.pending()
    }

    /// This bridge's registration on the bus.
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription
    }
}

/// Inject local events directly, bypassing the mapper.
impl<L: Send + 'static> Connection<L> for EventBridge<L> {
    fn accept(&self, value: L) {
        self.inner.relay.deliver(value);
    }

    fn dispose(&self) {
        EventBridge::dispose(self);
    }
}

impl<L: Send + 'static> Drop for EventBridge<L> {
    fn drop(&mut self) {
        self.inner.relay.dispose();
        self.bus.unsubscribe(self.subscription);
    }
}

impl<L: Send + 'static> std::fmt::Debug for EventBridge<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge")
            .field("subscription", &self.subscription)
            .field("relay", &self.inner.relay)
            .finish()
    }
}
