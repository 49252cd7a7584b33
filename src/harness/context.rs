use super::{ProcessorError, ProcessorResult};
use std::time::Duration;
use tokio::sync::watch;

/// Handle passed to every processor to observe shutdown requests
#[derive(Clone)]
pub struct ProcessingContext {
    termination: watch::Receiver<bool>,
}

impl ProcessingContext {
    /// Creates a context that observes the given termination channel
    pub fn new(termination: watch::Receiver<bool>) -> Self {
        Self { termination }
    }

    /// Creates a standalone context along with the sender used to stop it
    pub fn detached() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    /// Whether a shutdown has been requested
    pub fn is_stopping(&self) -> bool {
        *self.termination.borrow()
    }

    /// Returns [`ProcessorError::Stopping`] if a shutdown has been requested
    pub fn throw_if_stopping(&self) -> ProcessorResult {
        if self.is_stopping() {
            Err(ProcessorError::Stopping)
        } else {
            Ok(())
        }
    }

    /// Completes once a shutdown has been requested or the scheduler went away
    pub async fn stopping(&self) {
        let mut rx = self.termination.clone();

        loop {
            let stopping = *rx.borrow();
            if stopping || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for the given duration, cutting it short with [`ProcessorError::Stopping`] on shutdown
    pub async fn wait(&self, duration: Duration) -> ProcessorResult {
        tokio::select! {
            _ = self.stopping() => Err(ProcessorError::Stopping),
            _ = tokio::time::sleep(duration) => self.throw_if_stopping(),
        }
    }
}
