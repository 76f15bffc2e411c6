//! Consumer and connection contracts.
//!
//! - [`Consumer`] is the single-method sink implemented by whatever is
//!   attached downstream (a feature's event handler, a view).
//! - [`Connection`] is a disposable duplex channel: values go in through
//!   `accept`, and `dispose` permanently closes it.

/// Downstream sink for values of type `T`.
///
/// Any `Fn(T) + Send + Sync` closure is a consumer.
pub trait Consumer<T>: Send + Sync {
    /// Deliver one value.
    fn accept(&self, value: T);
}

impl<T, F> Consumer<T> for F
where
    F: Fn(T) + Send + Sync,
{
    fn accept(&self, value: T) {
        self(value)
    }
}

/// A disposable channel accepting values of type `T`.
///
/// # Guarantees
///
/// - `dispose` is idempotent and terminal
/// - `accept` after `dispose` is a silent no-op, never an error
pub trait Connection<T>: Send + Sync {
    /// Deliver one value into the connection.
    fn accept(&self, value: T);

    /// Permanently close the connection.
    fn dispose(&self);
}

/// Lifecycle state of a connection or relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No consumer attached; values are buffered.
    Detached,
    /// A consumer is attached; values are delivered live.
    Attached,
    /// Terminal; nothing is buffered or delivered.
    Disposed,
}

impl ConnectionState {
    /// Returns true for the terminal state.
    pub fn is_disposed(self) -> bool {
        self == ConnectionState::Disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_is_consumer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer = move |v: i32| sink.lock().unwrap().push(v);

        consumer.accept(1);
        Consumer::accept(&consumer, 2);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_boxed_consumer_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let consumer: Arc<dyn Consumer<&'static str>> =
            Arc::new(move |v: &'static str| sink.lock().unwrap().push(v));

        consumer.accept("a");
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_state_is_disposed() {
        assert!(ConnectionState::Disposed.is_disposed());
        assert!(!ConnectionState::Attached.is_disposed());
        assert!(!ConnectionState::Detached.is_disposed());
    }
}
