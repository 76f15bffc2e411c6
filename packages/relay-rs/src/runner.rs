//! Effect runner: executes effects and emits follow-up events.
//!
//! An [`EffectRunner`] turns incoming effects into zero or more events by
//! running a feature-supplied [`EffectHandler`]. Emitted events flow through a
//! [`Relay`], so events produced while no consumer is connected are queued
//! and replayed in order on the next [`connect`](EffectRunner::connect).
//!
//! # Lifecycle
//!
//! ```text
//!            connect()                 connection.dispose()
//! Detached ───────────► Attached ─────────────────────────► Detached
//!     │                    │
//!     └──── cancel() ──────┴──────────────────────────────► Canceled (terminal)
//! ```
//!
//! Disposing a connection only detaches its consumer; the runner keeps
//! executing effects and buffering their events. `cancel()` is the terminal
//! state: the handler is never run again and `connect` hands back a connection
//! that is already disposed.
//!
//! # Example
//!
//! ```ignore
//! struct ModuleListHandler { api: ModuleApi }
//!
//! impl EffectHandler<ModuleListEffect, ModuleListEvent> for ModuleListHandler {
//!     fn handle(&self, effect: ModuleListEffect, emitter: &Emitter<ModuleListEvent>) -> Result<()> {
//!         match effect {
//!             ModuleListEffect::LoadNextPage { course_id } => {
//!                 let page = self.api.first_page(course_id)?;
//!                 emitter.emit(ModuleListEvent::PageLoaded(page));
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let runner = EffectRunner::new(ModuleListHandler { api });
//! let connection = runner.connect(|event| loop_handle.dispatch(event));
//! connection.accept(ModuleListEffect::LoadNextPage { course_id: 1 });
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn};

use crate::config::RelayConfig;
use crate::connection::{Connection, ConnectionState, Consumer};
use crate::error::{panic_message, RelayError};
use crate::relay::{Attachment, Relay};

/// Executes one effect, emitting follow-up events through `emitter`.
///
/// Errors are logged and contained by the runner; they never reach the
/// caller of `accept`.
pub trait EffectHandler<F, E>: Send + Sync + 'static {
    /// Perform the effect.
    fn handle(&self, effect: F, emitter: &Emitter<E>) -> Result<()>;
}

/// Asynchronous effect handler, run on a tokio runtime via [`AsyncHandler`].
#[async_trait]
pub trait AsyncEffectHandler<F, E>: Send + Sync + 'static {
    /// Perform the effect. The emitter may be used after awaits.
    async fn handle(&self, effect: F, emitter: Emitter<E>) -> Result<()>;
}

/// Cloneable handle for emitting events from a runner.
///
/// Safe to move to other threads or tasks. Once the runner is canceled,
/// emitted events are dropped.
pub struct Emitter<E> {
    relay: Arc<Relay<E>>,
}

impl<E: Send + 'static> Emitter<E> {
    /// Emit one event: delivered live when connected, buffered otherwise.
    pub fn emit(&self, event: E) {
        self.relay.deliver(event);
    }

    /// Returns true once the owning runner has been canceled.
    pub fn is_closed(&self) -> bool {
        self.relay.state().is_disposed()
    }
}

impl<E> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            relay: self.relay.clone(),
        }
    }
}

struct RunnerInner<F, E> {
    handler: Box<dyn EffectHandler<F, E>>,
    relay: Arc<Relay<E>>,
    canceled: AtomicBool,
}

/// Connection-based effect executor with buffered event emission.
///
/// Cloning shares the same runner.
pub struct EffectRunner<F, E> {
    inner: Arc<RunnerInner<F, E>>,
}

impl<F, E> Clone for EffectRunner<F, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: Send + 'static, E: Send + 'static> EffectRunner<F, E> {
    /// Create a detached runner with the default buffer policy.
    pub fn new<H: EffectHandler<F, E>>(handler: H) -> Self {
        Self::with_config(handler, RelayConfig::default())
    }

    /// Create a detached runner with the given buffer policy.
    pub fn with_config<H: EffectHandler<F, E>>(handler: H, config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                handler: Box::new(handler),
                relay: Arc::new(Relay::with_config("effect_runner", config)),
                canceled: AtomicBool::new(false),
            }),
        }
    }

    /// Attach `consumer` as the event sink and return an effect connection.
    ///
    /// Any events buffered while detached are flushed to `consumer` before
    /// this returns. A previous consumer is replaced. On a canceled runner
    /// the returned connection is already disposed and nothing is attached.
    pub fn connect<C>(&self, consumer: C) -> RunnerConnection<F, E>
    where
        C: Consumer<E> + 'static,
    {
        let attachment = if self.is_canceled() {
            debug!(runner = self.inner.relay.name(), "connect ignored: runner canceled");
            None
        } else {
            self.inner.relay.attach(Arc::new(consumer))
        };

        RunnerConnection {
            runner: self.clone(),
            disposed: AtomicBool::new(attachment.is_none()),
            attachment,
        }
    }

    /// Like [`connect`](Self::connect), but reports a canceled runner.
    pub fn try_connect<C>(&self, consumer: C) -> Result<RunnerConnection<F, E>, RelayError>
    where
        C: Consumer<E> + 'static,
    {
        let connection = self.connect(consumer);
        if connection.attachment.is_none() {
            return Err(RelayError::IllegalReconnect {
                target: "EffectRunner",
            });
        }
        Ok(connection)
    }

    /// Execute one effect.
    ///
    /// Runs the handler whether or not a consumer is attached; emitted events
    /// are buffered until the next `connect`. No-op once canceled.
    pub fn accept(&self, effect: F) {
        if self.is_canceled() {
            trace!("effect dropped: runner canceled");
            return;
        }

        let emitter = self.emitter();
        let handler = &self.inner.handler;
        match catch_unwind(AssertUnwindSafe(|| handler.handle(effect, &emitter))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let err = RelayError::effect_failed::<F>(&e);
                warn!(error = %err, "effect handler failed");
            }
            Err(payload) => {
                error!(
                    effect = std::any::type_name::<F>(),
                    panic = %panic_message(payload.as_ref()),
                    "effect handler panicked"
                );
            }
        }
    }

    /// A handle for emitting events from outside the handler.
    pub fn emitter(&self) -> Emitter<E> {
        Emitter {
            relay: self.inner.relay.clone(),
        }
    }

    /// Permanently stop the runner.
    ///
    /// Sticky: later `accept` calls do nothing, later `connect` calls attach
    /// nothing, and buffered events are discarded.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.relay.dispose();
        debug!("effect runner canceled");
    }

    /// Returns true once `cancel` has been called.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Current state of the event side.
    pub fn state(&self) -> ConnectionState {
        self.inner.relay.state()
    }

    /// Number of events waiting for a consumer.
    pub fn pending(&self) -> usize {
        self.inner.relay.pending()
    }
}

impl<F, E> std::fmt::Debug for EffectRunner<F, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectRunner")
            .field("relay", &self.inner.relay)
            .field("canceled", &self.inner.canceled.load(Ordering::SeqCst))
            .finish()
    }
}

/// Effect-side connection returned by [`EffectRunner::connect`].
pub struct RunnerConnection<F, E> {
    runner: EffectRunner<F, E>,
    attachment: Option<Attachment>,
    disposed: AtomicBool,
}

impl<F: Send + 'static, E: Send + 'static> RunnerConnection<F, E> {
    /// Returns true once disposed (or if the runner was canceled at connect).
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl<F: Send + 'static, E: Send + 'static> Connection<F> for RunnerConnection<F, E> {
    fn accept(&self, effect: F) {
        if self.is_disposed() {
            trace!("effect dropped: connection disposed");
            return;
        }
        self.runner.accept(effect);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(attachment) = self.attachment {
            self.runner.inner.relay.detach_if(attachment);
        }
    }
}

/// Adapter running an [`AsyncEffectHandler`] on a tokio runtime.
///
/// Each effect is spawned as its own task, so effects may complete out of
/// order relative to each other. Events emitted by one task keep their order.
pub struct AsyncHandler<H> {
    handler: Arc<H>,
    runtime: Handle,
}

impl<H> AsyncHandler<H> {
    /// Wrap `handler`, spawning effects onto `runtime`.
    pub fn new(handler: H, runtime: Handle) -> Self {
        Self {
            handler: Arc::new(handler),
            runtime,
        }
    }
}

impl<F, E, H> EffectHandler<F, E> for AsyncHandler<H>
where
    F: Send + 'static,
    E: Send + 'static,
    H: AsyncEffectHandler<F, E>,
{
    fn handle(&self, effect: F, emitter: &Emitter<E>) -> Result<()> {
        let handler = self.handler.clone();
        let emitter = emitter.clone();
        self.runtime.spawn(async move {
            if let Err(e) = handler.handle(effect, emitter).await {
                let err = RelayError::effect_failed::<F>(&e);
                warn!(error = %err, "async effect handler failed");
            }
        });
        Ok(())
    }
}
