#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use tchap_kernel_contracts::utd::DecryptionFailure;

/// Receiver of tracked decryption failures.
///
/// Called at most once per event id. Implementations must not block; the
/// tracker calls this from its sweep and decryption paths.
pub trait E2eAnalytics: Send {
    fn track_e2ee_error(&mut self, failure: &DecryptionFailure);
}

impl<F> E2eAnalytics for F
where
    F: FnMut(&DecryptionFailure) + Send,
{
    fn track_e2ee_error(&mut self, failure: &DecryptionFailure) {
        self(failure)
    }
}

/// Keeps every reported failure in memory; the shared log can be read
/// through [`RecordingAnalytics::recorded`] after the sink was handed over.
#[derive(Debug, Clone, Default)]
pub struct RecordingAnalytics {
    recorded: Arc<Mutex<Vec<DecryptionFailure>>>,
}

impl RecordingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<DecryptionFailure> {
        match self.recorded.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.recorded.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl E2eAnalytics for RecordingAnalytics {
    fn track_e2ee_error(&mut self, failure: &DecryptionFailure) {
        match self.recorded.lock() {
            Ok(mut guard) => guard.push(failure.clone()),
            Err(poisoned) => poisoned.into_inner().push(failure.clone()),
        }
    }
}
