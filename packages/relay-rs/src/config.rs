//! Buffer configuration for relays.
//!
//! Buffers are unbounded by default: values produced while no consumer is
//! attached are never dropped. Crossing the warn threshold logs a warning so
//! a feature that is posted to for a long time without ever attaching shows
//! up in the logs. A hard capacity can be opted into; when it is reached the
//! oldest buffered value is dropped.

/// Default number of buffered values before a warning is logged.
pub const DEFAULT_WARN_THRESHOLD: usize = 1000;

/// Buffering policy for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Buffered length at which a warning is logged (once per crossing).
    pub warn_threshold: Option<usize>,
    /// Hard cap on buffered values; `None` means unbounded.
    pub capacity: Option<usize>,
}

impl RelayConfig {
    /// Unbounded buffer with the default warn threshold.
    pub fn new() -> Self {
        Self {
            warn_threshold: Some(DEFAULT_WARN_THRESHOLD),
            capacity: None,
        }
    }

    /// Unbounded buffer with no warning at all.
    pub fn unbounded() -> Self {
        Self {
            warn_threshold: None,
            capacity: None,
        }
    }

    /// Set the buffered length at which a warning is logged.
    pub fn with_warn_threshold(mut self, n: usize) -> Self {
        self.warn_threshold = Some(n);
        self
    }

    /// Cap the buffer, dropping the oldest value when full.
    ///
    /// A capacity of zero is treated as one.
    pub fn with_capacity(mut self, n: usize) -> Self {
        self.capacity = Some(n.max(1));
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new()
    }
}
