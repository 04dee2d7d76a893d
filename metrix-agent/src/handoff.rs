use std::sync::{Mutex, PoisonError};

/// Single-capacity buffer between the sample and report cadences.
///
/// Publishing never blocks: a value that has not been taken yet is replaced
/// and handed back to the caller.
#[derive(Debug)]
pub struct HandoffSlot<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for HandoffSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffSlot<T> {
    pub fn new() -> Self {
        HandoffSlot {
            slot: Mutex::new(None),
        }
    }

    /// Stores `value`, returning the unconsumed value it replaced.
    pub fn publish(&self, value: T) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
    }

    /// Empties the slot.
    pub fn take(&self) -> Option<T> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
