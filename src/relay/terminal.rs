use std::sync::{Mutex, PoisonError};
use tracing::warn;

use super::RelayError;

/// Holds the error that ended a relay session
///
/// The first recorded error wins. Anything recorded afterwards is usually a
/// consequence of the teardown it triggered, so it is logged and dropped.
#[derive(Debug, Default)]
pub struct TerminalError {
    slot: Mutex<Option<RelayError>>,
}

impl TerminalError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, returning `true` if it became the terminal error
    pub fn record(&self, err: RelayError) -> bool {
        debug_assert!(err.is_fatal(), "only session errors are terminal");
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(first) = slot.as_ref() {
            warn!(
                error = &err as &(dyn std::error::Error + 'static),
                first = %first,
                "Ignoring error after session already failed"
            );
            return false;
        }
        *slot = Some(err);
        true
    }

    pub fn is_set(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Convert into the session's final outcome
    pub fn into_result(self) -> Result<(), RelayError> {
        match self.slot.into_inner().unwrap_or_else(PoisonError::into_inner) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
