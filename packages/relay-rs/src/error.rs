//! Structured error types for relay.
//!
//! `RelayError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the EventBus boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for effect handlers)
//! - `RelayError` is the only externalized error (structured, loggable)
//!
//! Failures raised by feature-supplied code (mappers, effect handlers,
//! consumers) are contained where that code runs. A single failing feature
//! never aborts a bus-wide broadcast.
//!
//! # Example
//!
//! ```ignore
//! use relay::{RelayError, SingleShotCell};
//!
//! let cell: SingleShotCell<String> = SingleShotCell::new(|s| s.to_uppercase());
//! match cell.get() {
//!     Ok(value) => println!("{value}"),
//!     Err(RelayError::UninitializedAccess { type_name }) => {
//!         eprintln!("{type_name} read before first write");
//!     }
//!     Err(other) => eprintln!("unexpected: {other}"),
//! }
//! ```

use std::any::Any;

use thiserror::Error;

/// Structured errors for relay operations.
///
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// A single-shot cell was read before its first write.
    #[error("single-shot cell of {type_name} read before first write")]
    UninitializedAccess {
        /// Human-readable type name of the stored value.
        type_name: &'static str,
    },

    /// A canceled runner or disposed bridge was asked to attach a consumer.
    #[error("cannot reconnect {target}: it has been disposed")]
    IllegalReconnect {
        /// What was being reconnected (runner or bridge).
        target: &'static str,
    },

    /// A subscriber's mapper panicked while handling a posted event.
    #[error("mapper for subscriber {subscriber} failed: {message}")]
    MapperFailure {
        /// Name of the failing subscriber.
        subscriber: String,
        /// The extracted panic message.
        message: String,
    },

    /// An effect handler returned an error or panicked.
    #[error("effect {effect} failed: {message}")]
    EffectFailed {
        /// Type name of the effect being executed.
        effect: &'static str,
        /// Rendered error chain or panic message.
        message: String,
    },

    /// A downstream consumer panicked while accepting a value.
    #[error("consumer panicked: {message}")]
    ConsumerPanicked {
        /// The extracted panic message.
        message: String,
    },
}

impl RelayError {
    /// Build an `EffectFailed` from an `anyhow` error, keeping the full chain.
    pub fn effect_failed<F>(error: &anyhow::Error) -> Self {
        RelayError::EffectFailed {
            effect: std::any::type_name::<F>(),
            message: format!("{error:#}"),
        }
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
