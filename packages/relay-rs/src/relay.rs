//! Buffer-and-flush core shared by effect runners and event bridges.
//!
//! A [`Relay`] owns at most one downstream consumer. Values delivered while
//! no consumer is attached are queued; attaching a consumer flushes the queue
//! in arrival order before anything newer is forwarded.
//!
//! # Delivery discipline
//!
//! Every value goes through the queue. Exactly one caller at a time is the
//! *drainer*: it pops values one by one and hands them to the consumer with
//! the state lock released. Values arriving meanwhile (from other threads, or
//! re-entrantly from inside the consumer itself) are appended and picked up
//! by the active drainer, so per-relay FIFO holds without ever calling a
//! consumer under the state lock.
//!
//! `detach` and `dispose` wait for an in-flight delivery on another thread to
//! finish before returning. Once either returns, the previous consumer is
//! never called again.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use tracing::{debug, error, trace, warn};

use crate::config::RelayConfig;
use crate::connection::{ConnectionState, Consumer};
use crate::error::{panic_message, RelayError};

/// Token identifying one attachment, used to detach only if still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment(u64);

struct Inner<T> {
    state: ConnectionState,
    consumer: Option<Arc<dyn Consumer<T>>>,
    buffer: VecDeque<T>,
    /// Thread currently flushing the buffer, if any.
    drainer: Option<ThreadId>,
    generation: u64,
    warned: bool,
}

/// Single-consumer buffer with ordered flush on attach.
pub struct Relay<T> {
    name: &'static str,
    config: RelayConfig,
    inner: Mutex<Inner<T>>,
    /// Held for the duration of each consumer call.
    delivery: Mutex<()>,
}

impl<T: Send + 'static> Relay<T> {
    /// Create a detached relay with the default buffer policy.
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, RelayConfig::default())
    }

    /// Create a detached relay with the given buffer policy.
    pub fn with_config(name: &'static str, config: RelayConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Detached,
                consumer: None,
                buffer: VecDeque::new(),
                drainer: None,
                generation: 0,
                warned: false,
            }),
            delivery: Mutex::new(()),
        }
    }

    /// Acquire the state lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a consumer, replacing any previous one, and flush the buffer.
    ///
    /// Returns `None` without attaching if the relay is disposed.
    pub fn attach(&self, consumer: Arc<dyn Consumer<T>>) -> Option<Attachment> {
        let (attachment, previous_drainer) = {
            let mut inner = self.lock();
            if inner.state.is_disposed() {
                debug!(relay = self.name, "attach ignored: relay disposed");
                return None;
            }
            let replaced = inner.consumer.replace(consumer).is_some();
            inner.state = ConnectionState::Attached;
            inner.generation += 1;
            debug!(
                relay = self.name,
                replaced,
                pending = inner.buffer.len(),
                "consumer attached"
            );
            (Attachment(inner.generation), inner.drainer)
        };
        if draining_elsewhere(previous_drainer) {
            self.wait_for_inflight();
        }
        self.drain();
        Some(attachment)
    }

    /// Detach the current consumer. Later values are buffered.
    pub fn detach(&self) {
        let drainer = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Attached {
                return;
            }
            inner.consumer = None;
            inner.state = ConnectionState::Detached;
            debug!(relay = self.name, "consumer detached");
            inner.drainer
        };
        if draining_elsewhere(drainer) {
            self.wait_for_inflight();
        }
    }

    /// Detach only if `attachment` is still the current consumer.
    pub fn detach_if(&self, attachment: Attachment) {
        let drainer = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Attached || inner.generation != attachment.0 {
                return;
            }
            inner.consumer = None;
            inner.state = ConnectionState::Detached;
            debug!(relay = self.name, "consumer detached");
            inner.drainer
        };
        if draining_elsewhere(drainer) {
            self.wait_for_inflight();
        }
    }

    /// Deliver a value: forwarded in order when attached, queued otherwise.
    ///
    /// Silently dropped once the relay is disposed.
    pub fn deliver(&self, value: T) {
        {
            let mut inner = self.lock();
            if inner.state.is_disposed() {
                trace!(relay = self.name, "value dropped: relay disposed");
                return;
            }
            self.enqueue(&mut inner, value);
            if inner.state != ConnectionState::Attached || inner.drainer.is_some() {
                return;
            }
        }
        self.drain();
    }

    /// Permanently close the relay, discarding buffered values.
    ///
    /// Idempotent. No consumer is called after this returns.
    pub fn dispose(&self) {
        let drainer = {
            let mut inner = self.lock();
            if inner.state.is_disposed() {
                return;
            }
            let discarded = inner.buffer.len();
            inner.state = ConnectionState::Disposed;
            inner.consumer = None;
            inner.buffer.clear();
            debug!(relay = self.name, discarded, "relay disposed");
            inner.drainer
        };
        if draining_elsewhere(drainer) {
            self.wait_for_inflight();
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Number of values waiting for a consumer.
    pub fn pending(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Name used in log output.
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn enqueue(&self, inner: &mut Inner<T>, value: T) {
        if let Some(capacity) = self.config.capacity {
            if inner.buffer.len() >= capacity {
                inner.buffer.pop_front();
                debug!(
                    relay = self.name,
                    capacity, "buffer full, dropped oldest value"
                );
            }
        }
        inner.buffer.push_back(value);

        let len = inner.buffer.len();
        if let Some(threshold) = self.config.warn_threshold {
            if len >= threshold && !inner.warned {
                inner.warned = true;
                warn!(
                    relay = self.name,
                    pending = len,
                    threshold,
                    "buffer growing with no consumer draining it"
                );
            }
        }
        trace!(relay = self.name, pending = len, "value queued");
    }

    /// Flush queued values to the consumer until the queue is empty or the
    /// consumer goes away. Returns immediately if another caller is draining.
    fn drain(&self) {
        {
            let mut inner = self.lock();
            if inner.drainer.is_some() {
                return;
            }
            inner.drainer = Some(thread::current().id());
        }

        loop {
            let _delivering = self
                .delivery
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let (consumer, value) = {
                let mut inner = self.lock();
                let next = match inner.consumer.clone() {
                    Some(consumer) => inner.buffer.pop_front().map(|v| (consumer, v)),
                    None => None,
                };
                match next {
                    Some(next) => {
                        if let Some(threshold) = self.config.warn_threshold {
                            if inner.buffer.len() < threshold {
                                inner.warned = false;
                            }
                        }
                        next
                    }
                    None => {
                        inner.drainer = None;
                        return;
                    }
                }
            };

            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| consumer.accept(value))) {
                let err = RelayError::ConsumerPanicked {
                    message: panic_message(payload.as_ref()),
                };
                error!(relay = self.name, error = %err, "consumer panicked in accept()");
            }
        }
    }

    fn wait_for_inflight(&self) {
        drop(
            self.delivery
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
    }
}

/// True when a drain is running on a thread other than the caller's.
fn draining_elsewhere(drainer: Option<ThreadId>) -> bool {
    matches!(drainer, Some(id) if id != thread::current().id())
}

impl<T> std::fmt::Debug for Relay<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("Relay")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("pending", &inner.buffer.len())
            .finish()
    }
}
