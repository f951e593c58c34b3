//! Terminal-state signalling for the run loop

use crate::error::Error;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

/// One-shot terminal state: the first outcome recorded wins, and `done` fires
/// once cleanup has finished.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    outcome: OnceLock<Option<Error>>,
    done: CancellationToken,
}

impl Completion {
    /// Record how the run ended; later calls are ignored
    pub fn record(&self, outcome: Option<Error>) -> bool {
        self.outcome.set(outcome).is_ok()
    }

    /// Signal that no further state mutation will happen
    pub fn finish(&self) {
        // A run that ends without an explicit outcome ended cleanly
        let _ = self.outcome.set(None);
        self.done.cancel();
    }

    /// Whether a fatal error has been recorded, done or not
    pub fn err_recorded(&self) -> bool {
        matches!(self.outcome.get(), Some(Some(_)))
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn wait(&self) {
        self.done.cancelled().await;
    }

    /// The fatal error, only once done
    pub fn err(&self) -> Option<Error> {
        if !self.is_done() {
            return None;
        }
        self.outcome.get().cloned().flatten()
    }
}
