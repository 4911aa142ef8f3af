//! Cancellation-aware error plumbing shared by every fan-out layer.

use std::sync::Mutex;

use thiserror::Error;

/// Marker for cooperative cancellation. Carried inside `anyhow::Error` chains
/// so callers can tell a user-initiated stop apart from a real failure;
/// cancellation never invalidates checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Whether `err` is (or wraps) a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}

/// Write-once error latch shared by a fan-out of tasks.
///
/// The first error sticks; later ones are logged and dropped. The single
/// owner of the fan-out takes the latched value after joining.
#[derive(Default)]
pub struct OnceError {
    inner: Mutex<Option<anyhow::Error>>,
}

impl OnceError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `err` under `tag` if no error has been recorded yet.
    pub fn set(&self, tag: &str, err: anyhow::Error) {
        let mut guard = self.inner.lock().expect("error latch poisoned");
        if guard.is_none() {
            *guard = Some(err.context(tag.to_string()));
        } else {
            tracing::warn!(tag, error = ?err, "dropping error, another one is already latched");
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().expect("error latch poisoned").is_some()
    }

    /// Take the latched error, leaving the latch empty.
    pub fn take(&self) -> Option<anyhow::Error> {
        self.inner.lock().expect("error latch poisoned").take()
    }
}
