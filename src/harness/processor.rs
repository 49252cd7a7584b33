use super::ProcessingContext;
use crate::library::communication::GatewayError;
use crate::library::BoxedError;
use async_trait::async_trait;
use thiserror::Error;

/// Reasons for a processor to return early
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Shutdown has been requested while the processor was waiting
    #[error("processor is stopping")]
    Stopping,
    /// Processor encountered an error it can not recover from
    #[error("processor failed")]
    Failed(#[source] BoxedError),
}

impl From<BoxedError> for ProcessorError {
    fn from(error: BoxedError) -> Self {
        ProcessorError::Failed(error)
    }
}

impl From<GatewayError> for ProcessorError {
    fn from(error: GatewayError) -> Self {
        ProcessorError::Failed(Box::new(error))
    }
}

/// Outcome of a processor run
pub type ProcessorResult = Result<(), ProcessorError>;

/// Long running unit of background work
///
/// Implementations loop until the context signals a shutdown. Returning [`ProcessorError::Stopping`]
/// or `Ok(())` is considered a clean exit while [`ProcessorError::Failed`] marks the processor as
/// failed. Failed processors are not restarted.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name of the processor displayed in log messages
    const NAME: &'static str;

    /// Name of this instance, override when multiple instances run side by side
    fn name(&self) -> String {
        Self::NAME.to_owned()
    }

    /// Runs the processor until it is stopped or fails
    async fn run(&self, ctx: ProcessingContext) -> ProcessorResult;
}
