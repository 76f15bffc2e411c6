//! Type-erased, weakly-referenced event bus.
//!
//! # Guarantees
//!
//! - **Synchronous fan-out**: `post` returns after every live subscriber has
//!   seen the event, in registration order
//! - **Weak membership**: the bus never keeps a subscriber alive; dropped
//!   subscribers are pruned on the next `post` or `subscriber_count`
//! - **Failure isolation**: a subscriber that panics is reported in the
//!   [`PostOutcome`] and does not stop delivery to the others
//! - **No replay at the bus level**: buffering for detached consumers lives in
//!   each [`EventBridge`](crate::EventBridge)
//!
//! Explicit `dispose()`/`unsubscribe()` on teardown is the primary cleanup
//! path. Weak pruning only catches subscribers that were dropped without it.

use std::any::{Any, TypeId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{panic_message, RelayError};

/// Marker trait for values that can travel over the bus.
///
/// Blanket-implemented for every `Send + Sync + 'static` type.
pub trait Event: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Event for T {}

/// A posted event with its metadata.
///
/// Cheap to clone: the payload is shared.
#[derive(Clone)]
pub struct EventEnvelope {
    /// Unique id of this post.
    pub id: Uuid,
    /// When the event was posted.
    pub posted_at: DateTime<Utc>,
    /// `TypeId` of the concrete payload.
    pub type_id: TypeId,
    /// Human-readable payload type name.
    pub type_name: &'static str,
    /// The event itself.
    pub payload: Arc<dyn Any + Send + Sync>,
}

impl EventEnvelope {
    /// Wrap an event.
    pub fn new<T: Event>(event: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            posted_at: Utc::now(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            payload: Arc::new(event),
        }
    }

    /// Borrow the payload as `T`, if that is its type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Returns true if the payload is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl std::fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("posted_at", &self.posted_at)
            .finish_non_exhaustive()
    }
}

/// Something that receives every event posted on a bus.
pub trait Subscriber: Send + Sync {
    /// Called synchronously from `post`.
    fn on_event(&self, envelope: &EventEnvelope);

    /// Name used in logs and failure reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// A closed subscriber is pruned instead of being called.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Identifies one registration on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened during one `post`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostOutcome {
    /// Id of the posted envelope.
    pub event_id: Uuid,
    /// Subscribers that handled the event without failing.
    pub delivered: usize,
    /// Dead or closed entries removed during this post.
    pub pruned: usize,
    /// One `MapperFailure` per subscriber that panicked.
    pub failures: Vec<RelayError>,
}

impl PostOutcome {
    /// Returns true if no subscriber failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Entry {
    id: SubscriptionId,
    subscriber: Weak<dyn Subscriber>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
}

/// Shared publish/subscribe registry holding weak subscriber references.
///
/// Cloning shares the same registry.
///
/// # Example
///
/// ```ignore
/// let bus = EventBus::new();
///
/// let bridge = EventBridge::typed(&bus, |changed: &CourseChanged| {
///     Some(SyllabusEvent::Refresh(changed.course_id))
/// });
/// bridge.subscribe(|event| loop_handle.dispatch(event));
///
/// // From a background completion:
/// bus.post(CourseChanged { course_id: 42 });
/// ```
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Create an empty, independent bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus.
    ///
    /// Prefer passing an explicitly constructed bus; this exists for hosts
    /// that need one shared instance. Call [`clear`](Self::clear) between
    /// tests that use it.
    pub fn global() -> &'static EventBus {
        static GLOBAL: OnceLock<EventBus> = OnceLock::new();
        GLOBAL.get_or_init(EventBus::new)
    }

    /// Acquire the registry lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a weak reference to `subscriber`.
    ///
    /// The bus never extends the subscriber's lifetime.
    pub fn subscribe<S: Subscriber + 'static>(&self, subscriber: &Arc<S>) -> SubscriptionId {
        let weak: Weak<S> = Arc::downgrade(subscriber);
        let weak: Weak<dyn Subscriber> = weak;
        let id = SubscriptionId::new();
        let mut registry = self.lock();
        registry.entries.push(Entry {
            id,
            subscriber: weak,
        });
        debug!(
            subscription = %id,
            subscriber = subscriber.name(),
            subscribers = registry.entries.len(),
            "subscriber registered"
        );
        id
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|entry| entry.id != id);
        let removed = registry.entries.len() != before;
        if removed {
            debug!(subscription = %id, "subscriber removed");
        }
        removed
    }

    /// Post an event to every live subscriber.
    pub fn post<T: Event>(&self, event: T) -> PostOutcome {
        self.post_envelope(EventEnvelope::new(event))
    }

    /// Post an already-built envelope to every live subscriber.
    ///
    /// Subscribers are collected under the registry lock and invoked after it
    /// is released, so a subscriber may itself subscribe or post.
    pub fn post_envelope(&self, envelope: EventEnvelope) -> PostOutcome {
        let (live, pruned) = self.live_subscribers();

        trace!(
            event_id = %envelope.id,
            event_type = envelope.type_name,
            subscribers = live.len(),
            pruned,
            "posting event"
        );

        let mut delivered = 0;
        let mut failures = Vec::new();
        for subscriber in live {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&envelope))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let failure = RelayError::MapperFailure {
                        subscriber: subscriber.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    };
                    warn!(
                        event_id = %envelope.id,
                        error = %failure,
                        "subscriber failed during post"
                    );
                    failures.push(failure);
                }
            }
        }

        PostOutcome {
            event_id: envelope.id,
            delivered,
            pruned,
            failures,
        }
    }

    /// Number of live registrations. Prunes dead entries.
    pub fn subscriber_count(&self) -> usize {
        self.live_subscribers().0.len()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut registry = self.lock();
        let removed = registry.entries.len();
        registry.entries.clear();
        debug!(removed, "event bus cleared");
    }

    /// Upgrade live entries and prune dead or closed ones in one pass.
    fn live_subscribers(&self) -> (Vec<Arc<dyn Subscriber>>, usize) {
        let mut registry = self.lock();
        let before = registry.entries.len();
        let mut live = Vec::with_capacity(before);
        // Closed subscribers are released after the lock, their drop may post.
        let mut closed = Vec::new();
        registry.entries.retain(|entry| match entry.subscriber.upgrade() {
            Some(subscriber) if !subscriber.is_closed() => {
                live.push(subscriber);
                true
            }
            Some(subscriber) => {
                closed.push(subscriber);
                false
            }
            None => false,
        });
        let pruned = before - registry.entries.len();
        if pruned > 0 {
            debug!(pruned, remaining = registry.entries.len(), "pruned subscribers");
        }
        drop(registry);
        drop(closed);
        (live, pruned)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("registrations", &self.lock().entries.len())
            .finish()
    }
}
