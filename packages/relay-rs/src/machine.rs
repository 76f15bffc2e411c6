//! Init/Update state machine contract.
//!
//! A feature's control logic is two pure functions over an immutable model:
//!
//! - `init(model) -> First`: runs once per logical session and yields the
//!   starting model plus startup effects
//! - `update(&model, event) -> Next`: yields an optional replacement model
//!   plus effects
//!
//! # Key Properties
//!
//! - **Models are replaced, never mutated**: `update` borrows the current
//!   model and returns a new one (or none, meaning unchanged)
//! - **Pure decisions**: no IO, no hidden state; identical inputs give equal
//!   outputs
//! - **Idempotent init**: a model already flagged as initialized passes
//!   through `init` unchanged with no effects, so a host that recreates its
//!   view can call `init` again without re-running startup work
//! - **Undefined transitions are the feature's business**: return
//!   [`Next::noop`], not a panic

use smallvec::SmallVec;

/// Effects produced by one transition.
pub type Effects<F> = SmallVec<[F; 4]>;

/// Models that know whether startup already ran for them.
pub trait Initialized {
    /// Returns true once the model has been through `start`.
    fn is_initialized(&self) -> bool;
}

/// Result of `init`: the starting model and startup effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct First<M, F> {
    /// The starting model.
    pub model: M,
    /// Startup effects.
    pub effects: Effects<F>,
}

impl<M, F> First<M, F> {
    /// Start with `model` and no effects.
    pub fn new(model: M) -> Self {
        Self {
            model,
            effects: Effects::new(),
        }
    }

    /// Start with `model` and the given effects.
    pub fn with_effects(model: M, effects: impl IntoIterator<Item = F>) -> Self {
        Self {
            model,
            effects: effects.into_iter().collect(),
        }
    }

    /// Returns true if there are startup effects.
    pub fn has_effects(&self) -> bool {
        !self.effects.is_empty()
    }
}

/// Result of `update`: an optional new model and effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Next<M, F> {
    model: Option<M>,
    effects: Effects<F>,
}

impl<M, F> Next<M, F> {
    /// Replace the model, no effects.
    pub fn next(model: M) -> Self {
        Self {
            model: Some(model),
            effects: Effects::new(),
        }
    }

    /// Replace the model and dispatch effects.
    pub fn next_with(model: M, effects: impl IntoIterator<Item = F>) -> Self {
        Self {
            model: Some(model),
            effects: effects.into_iter().collect(),
        }
    }

    /// Keep the model, dispatch effects.
    pub fn dispatch(effects: impl IntoIterator<Item = F>) -> Self {
        Self {
            model: None,
            effects: effects.into_iter().collect(),
        }
    }

    /// Keep the model, no effects.
    pub fn noop() -> Self {
        Self {
            model: None,
            effects: Effects::new(),
        }
    }

    /// The replacement model, if any.
    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }

    /// Returns true if the transition replaced the model.
    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Effects to dispatch.
    pub fn effects(&self) -> &[F] {
        &self.effects
    }

    /// Returns true if the transition changes nothing.
    pub fn is_noop(&self) -> bool {
        self.model.is_none() && self.effects.is_empty()
    }

    /// Split into the optional model and the effects.
    pub fn into_parts(self) -> (Option<M>, Effects<F>) {
        (self.model, self.effects)
    }
}

impl<M: Clone, F> Next<M, F> {
    /// The model after this transition: the replacement, or `current`.
    pub fn model_or(&self, current: &M) -> M {
        self.model.clone().unwrap_or_else(|| current.clone())
    }
}

/// A feature's pure Init/Update logic.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, PartialEq)]
/// struct SyllabusModel { initialized: bool, loading: bool, body: Option<String> }
///
/// impl Initialized for SyllabusModel {
///     fn is_initialized(&self) -> bool { self.initialized }
/// }
///
/// struct Syllabus { course_id: u64 }
///
/// impl StateMachine for Syllabus {
///     type Model = SyllabusModel;
///     type Event = SyllabusEvent;
///     type Effect = SyllabusEffect;
///
///     fn start(&self, model: SyllabusModel) -> First<SyllabusModel, SyllabusEffect> {
///         First::with_effects(
///             SyllabusModel { initialized: true, loading: true, ..model },
///             [SyllabusEffect::Load { course_id: self.course_id }],
///         )
///     }
///
///     fn update(&self, model: &SyllabusModel, event: SyllabusEvent) -> Next<SyllabusModel, SyllabusEffect> {
///         match event {
///             SyllabusEvent::Loaded(body) => Next::next(SyllabusModel {
///                 loading: false,
///                 body: Some(body),
///                 ..model.clone()
///             }),
///             SyllabusEvent::PullToRefresh if model.loading => Next::noop(),
///             SyllabusEvent::PullToRefresh => Next::next_with(
///                 SyllabusModel { loading: true, ..model.clone() },
///                 [SyllabusEffect::Load { course_id: self.course_id }],
///             ),
///         }
///     }
/// }
/// ```
pub trait StateMachine: Send + Sync + 'static {
    /// Immutable state snapshot.
    type Model: Initialized + Clone + Send + 'static;

    /// Inputs.
    type Event: Send + 'static;

    /// Work to perform outside the transition.
    type Effect: Send + 'static;

    /// First-time startup for a model that is not yet initialized.
    ///
    /// The returned model should report `is_initialized() == true`.
    fn start(&self, model: Self::Model) -> First<Self::Model, Self::Effect>;

    /// Idempotent init.
    ///
    /// An initialized model is returned unchanged with no effects; otherwise
    /// this defers to [`start`](Self::start).
    fn init(&self, model: Self::Model) -> First<Self::Model, Self::Effect> {
        if model.is_initialized() {
            First::new(model)
        } else {
            self.start(model)
        }
    }

    /// Pure transition.
    fn update(&self, model: &Self::Model, event: Self::Event) -> Next<Self::Model, Self::Effect>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    struct CounterModel {
        initialized: bool,
        count: i32,
    }

    impl Initialized for CounterModel {
        fn is_initialized(&self) -> bool {
            self.initialized
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum CounterEvent {
        Increment,
        Decrement,
        Reset,
        Ignored,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum CounterEffect {
        LoadSaved,
        UpdateDisplay { value: i32 },
        PlaySound { sound: String },
    }

    struct Counter;

    impl StateMachine for Counter {
        type Model = CounterModel;
        type Event = CounterEvent;
        type Effect = CounterEffect;

        fn start(&self, model: CounterModel) -> First<CounterModel, CounterEffect> {
            First::with_effects(
                CounterModel {
                    initialized: true,
                    ..model
                },
                [CounterEffect::LoadSaved],
            )
        }

        fn update(&self, model: &CounterModel, event: CounterEvent) -> Next<CounterModel, CounterEffect> {
            match event {
                CounterEvent::Increment => {
                    let count = model.count + 1;
                    Next::next_with(
                        CounterModel {
                            count,
                            ..model.clone()
                        },
                        [CounterEffect::UpdateDisplay { value: count }],
                    )
                }
                CounterEvent::Decrement if model.count == 0 => Next::noop(),
                CounterEvent::Decrement => Next::next(CounterModel {
                    count: model.count - 1,
                    ..model.clone()
                }),
                CounterEvent::Reset => Next::dispatch([CounterEffect::PlaySound {
                    sound: "reset".to_string(),
                }]),
                CounterEvent::Ignored => Next::noop(),
            }
        }
    }

    #[test]
    fn test_init_runs_start_for_fresh_model() {
        let first = Counter.init(CounterModel::default());
        assert!(first.model.initialized);
        assert!(first.has_effects());
        assert_eq!(first.effects.as_slice(), &[CounterEffect::LoadSaved]);
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = Counter.init(CounterModel::default());
        let second = Counter.init(first.model.clone());

        assert_eq!(second.model, first.model);
        assert!(second.effects.is_empty());
    }

    #[test]
    fn test_update_is_pure() {
        let model = CounterModel {
            initialized: true,
            count: 3,
        };
        let a = Counter.update(&model, CounterEvent::Increment);
        let b = Counter.update(&model, CounterEvent::Increment);

        assert_eq!(a, b);
        // The input model is untouched.
        assert_eq!(model.count, 3);
        assert_eq!(a.model().unwrap().count, 4);
        assert_eq!(a.effects(), &[CounterEffect::UpdateDisplay { value: 4 }]);
    }

    #[test]
    fn test_undefined_transition_is_noop() {
        let model = CounterModel::default();
        assert!(Counter.update(&model, CounterEvent::Decrement).is_noop());
        assert!(Counter.update(&model, CounterEvent::Ignored).is_noop());
    }

    #[test]
    fn test_dispatch_keeps_model() {
        let model = CounterModel {
            initialized: true,
            count: 9,
        };
        let next = Counter.update(&model, CounterEvent::Reset);

        assert!(!next.has_model());
        assert_eq!(next.model_or(&model), model);
        let (new_model, effects) = next.into_parts();
        assert!(new_model.is_none());
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn test_model_or_prefers_replacement() {
        let model = CounterModel::default();
        let next: Next<CounterModel, CounterEffect> = Next::next(CounterModel {
            initialized: true,
            count: 1,
        });
        assert_eq!(next.model_or(&model).count, 1);
    }
}
