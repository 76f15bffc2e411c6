//! Single-shot property cell.
//!
//! A [`SingleShotCell`] applies a transform to the first value written to it
//! and stores every later value unchanged. It is used for properties that
//! need one-time normalization when they are first populated (for example
//! wrapping the first injected collaborator), while still allowing plain
//! replacement afterwards.
//!
//! Reads before the first write fail with [`RelayError::UninitializedAccess`]
//! rather than returning a default.

use std::fmt;

use crate::error::RelayError;

type Transform<T> = Box<dyn FnOnce(T) -> T + Send>;

enum Slot<T> {
    Uninitialized,
    Initialized(T),
}

/// A cell whose transform runs exactly once, on first write.
///
/// # Example
///
/// ```ignore
/// let mut cell = SingleShotCell::new(|s: String| s.chars().rev().collect());
///
/// cell.set("test".to_string());
/// assert_eq!(cell.get()?, "tset");
///
/// cell.set("abc123".to_string());
/// assert_eq!(cell.get()?, "abc123"); // not reversed
/// ```
pub struct SingleShotCell<T> {
    slot: Slot<T>,
    transform: Option<Transform<T>>,
}

impl<T> SingleShotCell<T> {
    /// Create an empty cell with the transform applied to the first write.
    pub fn new(transform: impl FnOnce(T) -> T + Send + 'static) -> Self {
        Self {
            slot: Slot::Uninitialized,
            transform: Some(Box::new(transform)),
        }
    }

    /// Write a value.
    ///
    /// The first write stores `transform(value)`. Every later write stores
    /// `value` as given.
    pub fn set(&mut self, value: T) {
        let value = match self.transform.take() {
            Some(transform) => transform(value),
            None => value,
        };
        self.slot = Slot::Initialized(value);
    }

    /// Read the current value.
    pub fn get(&self) -> Result<&T, RelayError> {
        match &self.slot {
            Slot::Initialized(value) => Ok(value),
            Slot::Uninitialized => Err(self.uninitialized()),
        }
    }

    /// Mutable access to the current value.
    pub fn get_mut(&mut self) -> Result<&mut T, RelayError> {
        match self.slot {
            Slot::Initialized(ref mut value) => Ok(value),
            Slot::Uninitialized => Err(RelayError::UninitializedAccess {
                type_name: std::any::type_name::<T>(),
            }),
        }
    }

    /// Returns true once the first write has happened.
    pub fn is_initialized(&self) -> bool {
        matches!(self.slot, Slot::Initialized(_))
    }

    /// Consume the cell, returning the stored value.
    pub fn into_inner(self) -> Result<T, RelayError> {
        match self.slot {
            Slot::Initialized(value) => Ok(value),
            Slot::Uninitialized => Err(RelayError::UninitializedAccess {
                type_name: std::any::type_name::<T>(),
            }),
        }
    }

    fn uninitialized(&self) -> RelayError {
        RelayError::UninitializedAccess {
            type_name: std::any::type_name::<T>(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SingleShotCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Slot::Initialized(value) => f
                .debug_struct("SingleShotCell")
                .field("value", value)
                .finish(),
            Slot::Uninitialized => f
                .debug_struct("SingleShotCell")
                .field("value", &"<uninitialized>")
                .finish(),
        }
    }
}
