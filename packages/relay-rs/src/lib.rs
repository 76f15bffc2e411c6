//! # Relay
//!
//! Connection plumbing for features built as pure Init/Update state machines:
//! effect runners that execute side effects and emit follow-up events, event
//! bridges that carry globally posted events into one feature, and a
//! process-wide event bus that fans events out to the bridges.
//!
//! ## Core Concepts
//!
//! - [`StateMachine`] = pure logic (`init` and `update` over an immutable model)
//! - [`EffectRunner`] = performs effects, emits events back
//! - [`EventBridge`] = maps global events into local ones
//! - [`EventBus`] = global fan-out holding bridges weakly
//!
//! Every producer side is backed by a [`Relay`]: values arriving while nobody
//! is attached are buffered and replayed in order on the next attach.
//!
//! ## Architecture
//!
//! ```text
//! Other feature
//!     │
//!     ▼ post()
//! EventBus ─────► EventBridge.mapper(&envelope) ─► Some(local) ─┐
//!  (weak refs)                                                  │
//!                                                               ▼
//! FeatureLoop.dispatch() ──────────────────────────────────► inbox
//!                                                               │
//!                                                               ▼
//!                                              StateMachine.update(&model, event)
//!                                                   │                 │
//!                                              new model           effects
//!                                                   │                 │
//!                                                   ▼                 ▼
//!                                                 view          EffectRunner
//!                                                                     │
//!                                 inbox ◄─── emitter.emit(event) ─────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Per-source FIFO** - events from one runner or bridge reach the
//!    consumer in emission order, across detach and reattach
//! 2. **Buffer while detached** - nothing emitted before `dispose` is lost
//! 3. **Dispose is terminal** - no delivery after `dispose` returns, and
//!    reconnecting afterwards is a silent no-op
//! 4. **Mapper always runs** - a live bridge maps every post, attached or not
//! 5. **Weak registration** - the bus never keeps a bridge alive
//! 6. **Idempotent init** - an initialized model restarts with no effects
//!
//! ## Example
//!
//! ```ignore
//! use relay::{EffectRunner, EventBridge, EventBus, FeatureLoop};
//!
//! let runner = EffectRunner::new(SyllabusHandler::new(api));
//! let bridge = EventBridge::typed(EventBus::global(), |_: &CourseChanged| {
//!     Some(SyllabusEvent::PullToRefresh)
//! });
//!
//! let feature = FeatureLoop::new(Syllabus { course_id }, runner.clone()).with_bridge(bridge);
//! feature.connect_view(move |model| view.render(model));
//! feature.start(saved.unwrap_or_default());
//!
//! // Elsewhere in the app:
//! EventBus::global().post(CourseChanged { course_id });
//! ```

// Core modules
mod bridge;
mod bus;
mod cell;
mod config;
mod connection;
mod error;
mod feature_loop;
mod machine;
mod relay;
mod runner;

// Testing utilities (feature-gated)
#[cfg(feature = "testing")]
pub mod testing;


// Re-export error types
pub use crate::error::RelayError;

// Re-export connection contracts
pub use connection::{Connection, ConnectionState, Consumer};

// Re-export relay core
pub use cell::SingleShotCell;
pub use config::{RelayConfig, DEFAULT_WARN_THRESHOLD};
pub use relay::{Attachment, Relay};

// Re-export effect types
pub use runner::{
    AsyncEffectHandler, AsyncHandler, EffectHandler, EffectRunner, Emitter, RunnerConnection,
};

// Re-export bus and bridge types
pub use bridge::EventBridge;
pub use bus::{Event, EventBus, EventEnvelope, PostOutcome, Subscriber, SubscriptionId};

// Re-export machine types
pub use feature_loop::FeatureLoop;
pub use machine::{Effects, First, Initialized, Next, StateMachine};

// Re-export commonly used external types
pub use async_trait::async_trait;
