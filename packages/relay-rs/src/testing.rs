//! Testing utilities for state machines and connections.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! relay = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ## Init
//!
//! ```ignore
//! use relay::testing::InitSpec;
//!
//! InitSpec::new(Syllabus { course_id: 7 })
//!     .given(SyllabusModel::default())
//!     .expect_model(|m| m.loading)
//!     .expect_effects(&[SyllabusEffect::Load { course_id: 7 }])
//!     .expect_idempotent();
//! ```
//!
//! ## Update
//!
//! ```ignore
//! use relay::testing::UpdateSpec;
//!
//! UpdateSpec::new(Syllabus { course_id: 7 })
//!     .given(loaded_model())
//!     .when(SyllabusEvent::PullToRefresh)
//!     .expect_model(|m| m.loading)
//!     .expect_effects(&[SyllabusEffect::Load { course_id: 7 }])
//!     .when(SyllabusEvent::PullToRefresh)
//!     .expect_noop();
//! ```
//!
//! ## Recording a Connection
//!
//! ```ignore
//! let events = RecordingConsumer::new();
//! let _connection = runner.connect(events.clone());
//!
//! runner.accept(SyllabusEffect::Load { course_id: 7 });
//! assert_eq!(events.values(), vec![SyllabusEvent::Loaded(body)]);
//! ```

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::connection::Consumer;
use crate::machine::{Effects, First, Next, StateMachine};

/// Install a test-friendly tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `relay=debug`. Safe to call from every
/// test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Fluent assertions over [`StateMachine::init`].
pub struct InitSpec<S: StateMachine> {
    machine: S,
    first: Option<First<S::Model, S::Effect>>,
}

impl<S> InitSpec<S>
where
    S: StateMachine,
    S::Model: Debug + PartialEq,
    S::Effect: Debug + PartialEq,
{
    /// Create a spec for `machine`.
    pub fn new(machine: S) -> Self {
        Self {
            machine,
            first: None,
        }
    }

    /// Run `init` on `model` and capture the result.
    pub fn given(mut self, model: S::Model) -> Self {
        self.first = Some(self.machine.init(model));
        self
    }

    fn first(&self) -> &First<S::Model, S::Effect> {
        match &self.first {
            Some(first) => first,
            None => panic!("InitSpec: call given() before asserting"),
        }
    }

    /// Assert the starting model matches a predicate.
    pub fn expect_model<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&S::Model) -> bool,
    {
        let model = &self.first().model;
        assert!(predicate(model), "Model predicate failed for {:?}", model);
        self
    }

    /// Assert the startup effects, in order.
    pub fn expect_effects(self, expected: &[S::Effect]) -> Self {
        let actual = self.first().effects.as_slice();
        assert_eq!(
            actual, expected,
            "Effect mismatch\n  expected: {:?}\n  actual: {:?}",
            expected, actual
        );
        self
    }

    /// Assert there are no startup effects.
    pub fn expect_no_effects(self) -> Self {
        assert!(
            self.first().effects.is_empty(),
            "Expected no effects, got {:?}",
            self.first().effects
        );
        self
    }

    /// Assert that running `init` again on the result changes nothing.
    pub fn expect_idempotent(self) -> Self {
        let model = self.first().model.clone();
        let again = self.machine.init(model.clone());
        assert_eq!(again.model, model, "Second init replaced the model");
        assert!(
            again.effects.is_empty(),
            "Second init produced effects: {:?}",
            again.effects
        );
        self
    }

    /// Consume the spec and return what `init` produced.
    pub fn into_first(mut self) -> First<S::Model, S::Effect> {
        match self.first.take() {
            Some(first) => first,
            None => panic!("InitSpec: call given() before into_first()"),
        }
    }
}

/// Fluent assertions over a sequence of [`StateMachine::update`] calls.
///
/// Each `when` feeds one event to the current model and keeps the resulting
/// model (the replacement, or the unchanged one) for the next step.
pub struct UpdateSpec<S: StateMachine> {
    machine: S,
    model: Option<S::Model>,
    previous: Option<S::Model>,
    effects: Effects<S::Effect>,
    replaced: bool,
}

impl<S> UpdateSpec<S>
where
    S: StateMachine,
    S::Model: Debug + PartialEq,
    S::Effect: Debug + PartialEq,
{
    /// Create a spec for `machine`.
    pub fn new(machine: S) -> Self {
        Self {
            machine,
            model: None,
            previous: None,
            effects: Effects::new(),
            replaced: false,
        }
    }

    /// Set the current model.
    pub fn given(mut self, model: S::Model) -> Self {
        self.model = Some(model);
        self
    }

    fn model(&self) -> &S::Model {
        match &self.model {
            Some(model) => model,
            None => panic!("UpdateSpec: call given() before when()"),
        }
    }

    /// Feed `event` to `update` and capture the transition.
    pub fn when(mut self, event: S::Event) -> Self {
        let current = self.model().clone();
        let next: Next<S::Model, S::Effect> = self.machine.update(&current, event);
        let (replacement, effects) = next.into_parts();

        self.replaced = replacement.is_some();
        self.model = Some(replacement.unwrap_or_else(|| current.clone()));
        self.previous = Some(current);
        self.effects = effects;
        self
    }

    /// Assert the model after the last transition matches a predicate.
    pub fn expect_model<F>(self, predicate: F) -> Self
    where
        F: FnOnce(&S::Model) -> bool,
    {
        let model = self.model();
        assert!(predicate(model), "Model predicate failed for {:?}", model);
        self
    }

    /// Assert the last transition kept the model.
    pub fn expect_unchanged(self) -> Self {
        assert!(
            !self.replaced,
            "Expected unchanged model, got {:?} (was {:?})",
            self.model, self.previous
        );
        self
    }

    /// Assert the effects of the last transition, in order.
    pub fn expect_effects(self, expected: &[S::Effect]) -> Self {
        assert_eq!(
            self.effects.as_slice(),
            expected,
            "Effect mismatch\n  expected: {:?}\n  actual: {:?}",
            expected,
            self.effects
        );
        self
    }

    /// Assert the last transition produced no effects.
    pub fn expect_no_effects(self) -> Self {
        assert!(
            self.effects.is_empty(),
            "Expected no effects, got {:?}",
            self.effects
        );
        self
    }

    /// Assert the last transition changed nothing at all.
    pub fn expect_noop(self) -> Self {
        self.expect_unchanged().expect_no_effects()
    }

    /// Effects of the last transition.
    pub fn effects(&self) -> &[S::Effect] {
        &self.effects
    }

    /// Consume the spec and return the current model.
    pub fn into_model(self) -> Option<S::Model> {
        self.model
    }
}

/// A [`Consumer`] that records every value it accepts.
///
/// Clones share the same record, so one clone can be handed to a connection
/// while the test keeps the other.
pub struct RecordingConsumer<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> RecordingConsumer<T> {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of values recorded.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<T: Clone> RecordingConsumer<T> {
    /// Snapshot of the recorded values, in arrival order.
    pub fn values(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// The most recent value.
    pub fn last(&self) -> Option<T> {
        self.lock().last().cloned()
    }
}

impl<T> Clone for RecordingConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
        }
    }
}

impl<T> Default for RecordingConsumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Consumer<T> for RecordingConsumer<T> {
    fn accept(&self, value: T) {
        self.lock().push(value);
    }
}

impl<T> Debug for RecordingConsumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingConsumer")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Initialized;
    use crate::relay::Relay;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct DoorModel {
        initialized: bool,
        open: bool,
        locked: bool,
    }

    impl Initialized for DoorModel {
        fn is_initialized(&self) -> bool {
            self.initialized
        }
    }

    #[derive(Debug)]
    enum DoorEvent {
        Open,
        Close,
        Lock,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum DoorEffect {
        ReadSensor,
        Chime,
    }

    struct Door;

    impl StateMachine for Door {
        type Model = DoorModel;
        type Event = DoorEvent;
        type Effect = DoorEffect;

        fn start(&self, model: DoorModel) -> First<DoorModel, DoorEffect> {
            First::with_effects(
                DoorModel {
                    initialized: true,
                    ..model
                },
                [DoorEffect::ReadSensor],
            )
        }

        fn update(&self, model: &DoorModel, event: DoorEvent) -> Next<DoorModel, DoorEffect> {
            match event {
                DoorEvent::Open if model.locked || model.open => Next::noop(),
                DoorEvent::Open => Next::next_with(
                    DoorModel {
                        open: true,
                        ..model.clone()
                    },
                    [DoorEffect::Chime],
                ),
                DoorEvent::Close => Next::next(DoorModel {
                    open: false,
                    ..model.clone()
                }),
                DoorEvent::Lock if model.open => Next::noop(),
                DoorEvent::Lock => Next::next(DoorModel {
                    locked: true,
                    ..model.clone()
                }),
            }
        }
    }

    #[test]
    fn test_init_spec() {
        let first = InitSpec::new(Door)
            .given(DoorModel::default())
            .expect_model(|m| m.initialized && !m.open)
            .expect_effects(&[DoorEffect::ReadSensor])
            .expect_idempotent()
            .into_first();
        assert!(first.model.initialized);

        InitSpec::new(Door)
            .given(first.model)
            .expect_no_effects();
    }

    #[test]
    fn test_update_spec_chains_models() {
        let model = UpdateSpec::new(Door)
            .given(DoorModel {
                initialized: true,
                ..DoorModel::default()
            })
            .when(DoorEvent::Open)
            .expect_model(|m| m.open)
            .expect_effects(&[DoorEffect::Chime])
            .when(DoorEvent::Open)
            .expect_noop()
            .when(DoorEvent::Lock)
            .expect_noop()
            .when(DoorEvent::Close)
            .expect_no_effects()
            .when(DoorEvent::Lock)
            .expect_model(|m| m.locked)
            .into_model()
            .unwrap();

        assert!(model.locked && !model.open);
    }

    #[test]
    #[should_panic(expected = "Effect mismatch")]
    fn test_update_spec_reports_effect_mismatch() {
        UpdateSpec::new(Door)
            .given(DoorModel::default())
            .when(DoorEvent::Open)
            .expect_effects(&[DoorEffect::ReadSensor]);
    }

    #[test]
    fn test_recording_consumer_shares_record() {
        init_tracing();
        let recorder = RecordingConsumer::new();
        let relay = Relay::new("recording");
        relay.deliver("a");
        relay.attach(Arc::new(recorder.clone()));
        relay.deliver("b");

        assert_eq!(recorder.values(), vec!["a", "b"]);
        assert_eq!(recorder.last(), Some("b"));
        recorder.clear();
        assert!(recorder.is_empty());
    }
}
