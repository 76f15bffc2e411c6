//! Feature control loop.
//!
//! A [`FeatureLoop`] composes a [`StateMachine`] with an [`EffectRunner`] and
//! optionally an [`EventBridge`]:
//!
//! ```text
//! dispatch(event) ─┐
//! bridge event ────┼─► inbox ─► update(&model, event) ─► new model ─► view
//! runner event ────┘                     │
//!                                        └─► effects ─► EffectRunner
//!                                                           │
//!                                   emitter.emit(event) ◄───┘
//! ```
//!
//! Every event enters through one inbox relay, so events emitted re-entrantly
//! by an effect handler are processed after the transition that caused them,
//! in order, never nested inside it.
//!
//! The runner may outlive the loop. When a host recreates its view, it stops
//! the old loop, builds a new one over the same runner with the saved model,
//! and any events the runner buffered in between are replayed into the new
//! loop. Because `init` is idempotent, startup effects do not run twice.
//!
//! Views are fed through a second relay carrying render requests. Each
//! request reads the model at delivery time, so a view only ever moves
//! forward, even when `connect_view` races with `dispatch`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, trace, warn};

use crate::bridge::EventBridge;
use crate::config::RelayConfig;
use crate::connection::{Connection, Consumer};
use crate::error::panic_message;
use crate::machine::StateMachine;
use crate::relay::Relay;
use crate::runner::{EffectRunner, RunnerConnection};

type EffectConnection<S> =
    RunnerConnection<<S as StateMachine>::Effect, <S as StateMachine>::Event>;

/// The model plus a version bumped on every replacement.
struct ModelSlot<M> {
    version: u64,
    model: Option<M>,
}

/// Runner connection and bridge. Wiring and teardown both hold this lock,
/// so a `stop` racing `start` never leaves the runner attached.
struct Sources<S: StateMachine> {
    connection: Option<EffectConnection<S>>,
    bridge: Option<EventBridge<S::Event>>,
}

struct LoopInner<S: StateMachine> {
    machine: S,
    model: Mutex<ModelSlot<S::Model>>,
    inbox: Relay<S::Event>,
    views: Relay<()>,
    runner: EffectRunner<S::Effect, S::Event>,
    sources: Mutex<Sources<S>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Lock helper recovering from poison, as the loop prefers availability.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: StateMachine> LoopInner<S> {
    fn process(&self, event: S::Event) {
        let (changed, effects) = {
            let mut slot = lock(&self.model);
            let Some(current) = slot.model.as_ref() else {
                warn!("event processed before start, dropped");
                return;
            };

            let machine = &self.machine;
            let next = match catch_unwind(AssertUnwindSafe(|| machine.update(current, event))) {
                Ok(next) => next,
                Err(payload) => {
                    error!(
                        machine = std::any::type_name::<S>(),
                        panic = %panic_message(payload.as_ref()),
                        "machine panicked in update()"
                    );
                    return;
                }
            };

            let (new_model, effects) = next.into_parts();
            let changed = new_model.is_some();
            if let Some(model) = new_model {
                slot.version += 1;
                slot.model = Some(model);
            }
            (changed, effects)
        };

        trace!(
            model_changed = changed,
            effects = effects.len(),
            "event processed"
        );

        if changed {
            self.views.deliver(());
        }
        self.run_effects(effects);
    }

    /// Effects go straight to the runner. With no loop attached, the events
    /// they emit stay buffered in the runner for the next one.
    fn run_effects(&self, effects: impl IntoIterator<Item = S::Effect>) {
        for effect in effects {
            self.runner.accept(effect);
        }
    }

    fn snapshot(&self) -> (u64, Option<S::Model>) {
        let slot = lock(&self.model);
        (slot.version, slot.model.clone())
    }
}

impl<S: StateMachine> Drop for LoopInner<S> {
    fn drop(&mut self) {
        let connection = self
            .sources
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .connection
            .take();
        if let Some(connection) = connection {
            connection.dispose();
        }
    }
}

/// Renders the loop's current model into one view, skipping versions the
/// view has already seen.
struct ViewRenderer<S: StateMachine> {
    inner: Weak<LoopInner<S>>,
    view: Box<dyn Consumer<S::Model>>,
    shown: AtomicU64,
}

impl<S: StateMachine> Consumer<()> for ViewRenderer<S> {
    fn accept(&self, _: ()) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let (version, model) = inner.snapshot();
        let Some(model) = model else {
            return;
        };
        // Render requests are delivered one at a time.
        if version > self.shown.load(Ordering::SeqCst) {
            self.shown.store(version, Ordering::SeqCst);
            self.view.accept(model);
        }
    }
}

/// A running feature: model, update loop and effect wiring.
///
/// Cloning shares the same loop.
///
/// # Example
///
/// ```ignore
/// let runner = EffectRunner::new(SyllabusHandler::new(api));
/// let bridge = EventBridge::typed(&bus, |c: &CourseChanged| Some(SyllabusEvent::Refresh));
///
/// let feature = FeatureLoop::new(Syllabus { course_id }, runner.clone()).with_bridge(bridge);
/// feature.connect_view(move |model| view.render(model));
/// feature.start(saved_model.unwrap_or_default());
///
/// // On teardown:
/// feature.stop();
/// ```
pub struct FeatureLoop<S: StateMachine> {
    inner: Arc<LoopInner<S>>,
}

impl<S: StateMachine> Clone for FeatureLoop<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: StateMachine> FeatureLoop<S> {
    /// Create a loop over `machine`, executing effects on `runner`.
    ///
    /// Nothing runs until [`start`](Self::start).
    pub fn new(machine: S, runner: EffectRunner<S::Effect, S::Event>) -> Self {
        Self {
            inner: Arc::new(LoopInner {
                machine,
                model: Mutex::new(ModelSlot {
                    version: 0,
                    model: None,
                }),
                inbox: Relay::new("feature_loop"),
                views: Relay::with_config("feature_view", RelayConfig::unbounded().with_capacity(1)),
                runner,
                sources: Mutex::new(Sources {
                    connection: None,
                    bridge: None,
                }),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Feed events from `bridge` into this loop once started.
    pub fn with_bridge(self, bridge: EventBridge<S::Event>) -> Self {
        lock(&self.inner.sources).bridge = Some(bridge);
        self
    }

    /// Run `init` on `model`, then wire the runner and bridge.
    ///
    /// Events buffered before start are processed first, then startup effects
    /// are dispatched. Calling `start` again, or after `stop`, does
    /// nothing. `stop` may be called from anywhere during `start`, including
    /// from the view's first render.
    pub fn start(&self, model: S::Model) {
        if self.inner.stopped.load(Ordering::SeqCst)
            || self.inner.started.swap(true, Ordering::SeqCst)
        {
            debug!("start ignored: loop already started or stopped");
            return;
        }

        let first = self.inner.machine.init(model);
        {
            let mut slot = lock(&self.inner.model);
            slot.version += 1;
            slot.model = Some(first.model);
        }
        self.inner.views.deliver(());

        let wired = self.wire_sources();

        // Attached even when stopped meanwhile, so events queued by
        // `dispatch` still fold into the model handed to the next loop.
        let weak = Arc::downgrade(&self.inner);
        self.inner.inbox.attach(Arc::new(move |event: S::Event| {
            if let Some(inner) = weak.upgrade() {
                inner.process(event);
            }
        }));

        debug!(
            machine = std::any::type_name::<S>(),
            effects = first.effects.len(),
            wired,
            "feature loop started"
        );
        self.inner.run_effects(first.effects);
    }

    /// Connect the runner and subscribe the bridge, unless already stopped.
    ///
    /// The inbox is still detached here, so anything the sources flush is
    /// only queued, behind events sent by `dispatch` before start.
    fn wire_sources(&self) -> bool {
        let mut sources = lock(&self.inner.sources);
        if self.inner.stopped.load(Ordering::SeqCst) {
            return false;
        }
        sources.connection = Some(self.inner.runner.connect(inbox_feeder(&self.inner)));
        if let Some(bridge) = sources.bridge.as_ref() {
            bridge.subscribe(inbox_feeder(&self.inner));
        }
        true
    }

    /// Queue an event for processing.
    ///
    /// Before `start` the event waits in the inbox; after `stop` it is dropped.
    pub fn dispatch(&self, event: S::Event) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            trace!("dispatch ignored: loop stopped");
            return;
        }
        self.inner.inbox.deliver(event);
    }

    /// Attach a view, replacing any previous one. It receives the current
    /// model, if any, and then every replaced model, never an older one
    /// than it has already rendered.
    pub fn connect_view<C>(&self, view: C)
    where
        C: Consumer<S::Model> + 'static,
    {
        let renderer = ViewRenderer {
            inner: Arc::downgrade(&self.inner),
            view: Box::new(view),
            shown: AtomicU64::new(0),
        };
        if self.inner.views.attach(Arc::new(renderer)).is_none() {
            debug!("view ignored: loop stopped");
            return;
        }
        self.inner.views.deliver(());
    }

    /// Detach the view. Models are not buffered; the next view gets the
    /// latest one on connect.
    pub fn disconnect_view(&self) {
        self.inner.views.detach();
    }

    /// Current model, `None` before `start`.
    pub fn model(&self) -> Option<S::Model> {
        lock(&self.inner.model).model.clone()
    }

    /// Returns true after `start` and before `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Tear the loop down. Terminal.
    ///
    /// Detaches from the runner (which keeps buffering for a later loop),
    /// disposes the bridge and drops the view. Events already queued are
    /// still folded into the model, which stays readable through
    /// [`model`](Self::model) so it can seed the next loop.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let (connection, bridge) = {
            let mut sources = lock(&self.inner.sources);
            (sources.connection.take(), sources.bridge.take())
        };
        if let Some(connection) = connection {
            connection.dispose();
        }
        if let Some(bridge) = bridge {
            bridge.dispose();
        }

        self.inner.views.dispose();
        debug!(machine = std::any::type_name::<S>(), "feature loop stopped");
    }
}

/// A consumer that forwards events into the loop's inbox without keeping
/// the loop alive.
fn inbox_feeder<S: StateMachine>(inner: &Arc<LoopInner<S>>) -> impl Consumer<S::Event> + 'static {
    let weak: Weak<LoopInner<S>> = Arc::downgrade(inner);
    move |event: S::Event| {
        if let Some(inner) = weak.upgrade() {
            inner.inbox.deliver(event);
        }
    }
}

impl<S: StateMachine> std::fmt::Debug for FeatureLoop<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureLoop")
            .field("machine", &std::any::type_name::<S>())
            .field("running", &self.is_running())
            .field("inbox", &self.inner.inbox)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::connection::ConnectionState;
    use crate::machine::{First, Initialized, Next};
    use crate::runner::{EffectHandler, Emitter};
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct SyllabusModel {
        initialized: bool,
        loading: bool,
        body: Option<String>,
        refreshes: u32,
    }

    impl Initialized for SyllabusModel {
        fn is_initialized(&self) -> bool {
            self.initialized
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum SyllabusEvent {
        Loaded(String),
        Refresh,
        Explode,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum SyllabusEffect {
        Load,
        ShowToast(String),
    }

    struct Syllabus;

    impl StateMachine for Syllabus {
        type Model = SyllabusModel;
        type Event = SyllabusEvent;
        type Effect = SyllabusEffect;

        fn start(&self, model: SyllabusModel) -> First<SyllabusModel, SyllabusEffect> {
            First::with_effects(
                SyllabusModel {
                    initialized: true,
                    loading: true,
                    ..model
                },
                [SyllabusEffect::Load],
            )
        }

        fn update(
            &self,
            model: &SyllabusModel,
            event: SyllabusEvent,
        ) -> Next<SyllabusModel, SyllabusEffect> {
            match event {
                SyllabusEvent::Loaded(body) => Next::next_with(
                    SyllabusModel {
                        loading: false,
                        body: Some(body.clone()),
                        ..model.clone()
                    },
                    [SyllabusEffect::ShowToast(body)],
                ),
                SyllabusEvent::Refresh if model.loading => Next::noop(),
                SyllabusEvent::Refresh => Next::next_with(
                    SyllabusModel {
                        loading: true,
                        refreshes: model.refreshes + 1,
                        ..model.clone()
                    },
                    [SyllabusEffect::Load],
                ),
                SyllabusEvent::Explode => panic!("update exploded"),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        loads: AtomicUsize,
        toasts: Mutex<Vec<String>>,
    }

    struct SyllabusHandler {
        recorder: Arc<Recorder>,
        /// When false, loads complete later through the runner's emitter.
        complete_inline: bool,
    }

    impl EffectHandler<SyllabusEffect, SyllabusEvent> for SyllabusHandler {
        fn handle(
            &self,
            effect: SyllabusEffect,
            emitter: &Emitter<SyllabusEvent>,
        ) -> anyhow::Result<()> {
            match effect {
                SyllabusEffect::Load => {
                    let n = self.recorder.loads.fetch_add(1, Ordering::SeqCst) + 1;
                    if self.complete_inline {
                        emitter.emit(SyllabusEvent::Loaded(format!("body-{n}")));
                    }
                }
                SyllabusEffect::ShowToast(text) => self.recorder.toasts.lock().unwrap().push(text),
            }
            Ok(())
        }
    }

    fn runner(complete_inline: bool) -> (Arc<Recorder>, EffectRunner<SyllabusEffect, SyllabusEvent>) {
        let recorder = Arc::new(Recorder::default());
        let runner = EffectRunner::new(SyllabusHandler {
            recorder: recorder.clone(),
            complete_inline,
        });
        (recorder, runner)
    }

    #[test]
    fn test_start_runs_init_effects_and_follow_up_events() {
        let (recorder, runner) = runner(true);
        let feature = FeatureLoop::new(Syllabus, runner);
        feature.start(SyllabusModel::default());

        let model = feature.model().unwrap();
        assert!(model.initialized);
        assert!(!model.loading);
        assert_eq!(model.body.as_deref(), Some("body-1"));
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.toasts.lock().unwrap(), vec!["body-1".to_string()]);
        assert!(feature.is_running());
    }

    #[test]
    fn test_view_receives_current_then_changed_models() {
        let (_recorder, runner) = runner(false);
        let feature = FeatureLoop::new(Syllabus, runner);
        feature.start(SyllabusModel::default());

        let rendered = Arc::new(Mutex::new(Vec::new()));
        let sink = rendered.clone();
        feature.connect_view(move |m: SyllabusModel| sink.lock().unwrap().push(m));

        feature.dispatch(SyllabusEvent::Loaded("hello".to_string()));
        // Refresh while not loading changes the model; a second one is a noop.
        feature.dispatch(SyllabusEvent::Refresh);
        feature.dispatch(SyllabusEvent::Refresh);

        let rendered = rendered.lock().unwrap();
        assert_eq!(rendered.len(), 3);
        assert!(rendered[0].loading);
        assert_eq!(rendered[1].body.as_deref(), Some("hello"));
        assert_eq!(rendered[2].refreshes, 1);
    }

    #[test]
    fn test_dispatch_before_start_is_processed_after_start() {
        let (_recorder, runner) = runner(false);
        let feature = FeatureLoop::new(Syllabus, runner);
        feature.dispatch(SyllabusEvent::Loaded("early".to_string()));
        assert!(feature.model().is_none());

        feature.start(SyllabusModel::default());
        assert_eq!(feature.model().unwrap().body.as_deref(), Some("early"));
    }

    #[test]
    fn test_bridge_events_reach_update() {
        #[derive(Debug)]
        struct CourseChanged;

        let bus = EventBus::new();
        let (recorder, runner) = runner(true);
        let bridge = EventBridge::typed(&bus, |_: &CourseChanged| Some(SyllabusEvent::Refresh));
        let feature = FeatureLoop::new(Syllabus, runner).with_bridge(bridge);
        feature.start(SyllabusModel::default());

        bus.post(CourseChanged);

        let model = feature.model().unwrap();
        assert_eq!(model.refreshes, 1);
        assert_eq!(model.body.as_deref(), Some("body-2"));
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_is_terminal() {
        let bus = EventBus::new();
        let (_recorder, runner) = runner(false);
        let bridge = EventBridge::new(&bus, |_envelope: &crate::bus::EventEnvelope| {
            Some(SyllabusEvent::Refresh)
        });
        let feature = FeatureLoop::new(Syllabus, runner.clone()).with_bridge(bridge);
        feature.start(SyllabusModel::default());
        let before = feature.model();

        feature.stop();
        feature.stop();
        feature.dispatch(SyllabusEvent::Loaded("late".to_string()));
        bus.post(());
        feature.start(SyllabusModel::default());

        assert_eq!(feature.model(), before);
        assert!(!feature.is_running());
        assert_eq!(bus.subscriber_count(), 0);
        // The runner survives the loop.
        assert!(!runner.is_canceled());
    }

    #[test]
    fn test_recreated_loop_replays_buffered_events_without_rerunning_init() {
        let (recorder, runner) = runner(false);
        let first = FeatureLoop::new(Syllabus, runner.clone());
        first.start(SyllabusModel::default());
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);

        // View destroyed while the load is in flight.
        let saved = first.model().unwrap();
        first.stop();
        drop(first);

        // The load completes with nobody listening.
        runner.emitter().emit(SyllabusEvent::Loaded("late body".to_string()));
        assert_eq!(runner.pending(), 1);

        let second = FeatureLoop::new(Syllabus, runner.clone());
        second.start(saved);

        let model = second.model().unwrap();
        assert_eq!(model.body.as_deref(), Some("late body"));
        assert!(!model.loading);
        // Init did not run startup effects again.
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_update_is_contained() {
        let (_recorder, runner) = runner(false);
        let feature = FeatureLoop::new(Syllabus, runner);
        feature.start(SyllabusModel::default());

        feature.dispatch(SyllabusEvent::Explode);
        feature.dispatch(SyllabusEvent::Loaded("after".to_string()));

        assert_eq!(feature.model().unwrap().body.as_deref(), Some("after"));
    }

    #[test]
    fn test_dropping_loop_without_stop_detaches_runner() {
        let (_recorder, runner) = runner(false);
        {
            let feature = FeatureLoop::new(Syllabus, runner.clone());
            feature.start(SyllabusModel::default());
        }
        runner.emitter().emit(SyllabusEvent::Refresh);
        assert_eq!(runner.pending(), 1);
    }

    #[test]
    fn test_stop_from_first_render_leaves_runner_detached() {
        let (recorder, runner) = runner(true);
        let first = FeatureLoop::new(Syllabus, runner.clone());
        let handle = first.clone();
        first.connect_view(move |_: SyllabusModel| handle.stop());

        first.start(SyllabusModel::default());
        assert!(!first.is_running());

        // The startup load and a later completion both wait in the runner.
        runner.emitter().emit(SyllabusEvent::Loaded("late".to_string()));
        assert_eq!(runner.state(), ConnectionState::Detached);
        assert_eq!(runner.pending(), 2);

        let second = FeatureLoop::new(Syllabus, runner.clone());
        second.start(first.model().unwrap());

        let model = second.model().unwrap();
        assert_eq!(model.body.as_deref(), Some("late"));
        assert_eq!(recorder.loads.load(Ordering::SeqCst), 1);
        assert_eq!(
            *recorder.toasts.lock().unwrap(),
            vec!["body-1".to_string(), "late".to_string()]
        );
    }

    #[test]
    fn test_stop_racing_start_never_leaves_runner_attached() {
        for _ in 0..200 {
            let (_recorder, runner) = runner(false);
            let feature = FeatureLoop::new(Syllabus, runner.clone());
            let stopper = {
                let feature = feature.clone();
                std::thread::spawn(move || feature.stop())
            };
            feature.start(SyllabusModel::default());
            stopper.join().unwrap();

            assert!(!feature.is_running());
            assert_ne!(runner.state(), ConnectionState::Attached);
            runner.emitter().emit(SyllabusEvent::Refresh);
            assert_eq!(runner.pending(), 1);
        }
    }

    #[test]
    fn test_connect_view_after_stop_renders_nothing() {
        let (_recorder, runner) = runner(false);
        let feature = FeatureLoop::new(Syllabus, runner);
        feature.start(SyllabusModel::default());
        feature.stop();

        let rendered = Arc::new(AtomicUsize::new(0));
        let count = rendered.clone();
        feature.connect_view(move |_: SyllabusModel| {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(rendered.load(Ordering::SeqCst), 0);
    }
}
