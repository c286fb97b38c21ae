use std::time::Duration;

use crate::services::analyzer::AnalysisError;
use crate::services::queue::QueueError;
use crate::services::state::StateError;
use crate::services::storage::StorageError;

/// Failure classes of the per-message protocol.
///
/// The class decides what happens to the message: transient and callback
/// failures are recorded and handed back to the queue, lost races and lost
/// leases leave the message to its current owner.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Conditional write rejected; another worker owns the job")]
    ConditionFailed,

    #[error("Analysis failed: {0}")]
    CallbackFailure(String),

    #[error("Poison message: {0}")]
    PoisonMessage(String),

    #[error("Lease expired before commit")]
    LeaseLost,

    #[error("Processing exceeded {0:?}")]
    Timeout(Duration),
}

impl PipelineError {
    /// Stable identifier stored in `errorInfo.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TransientIo(_) => "transient_io",
            PipelineError::ConditionFailed => "condition_failed",
            PipelineError::CallbackFailure(_) => "callback_failure",
            PipelineError::PoisonMessage(_) => "poison_message",
            PipelineError::LeaseLost => "lease_lost",
            PipelineError::Timeout(_) => "timeout",
        }
    }

    /// Whether this worker gave up ownership rather than failing the job.
    pub fn is_abandonment(&self) -> bool {
        matches!(self, PipelineError::ConditionFailed | PipelineError::LeaseLost)
    }
}

impl From<StateError> for PipelineError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::ConditionFailed => PipelineError::ConditionFailed,
            other => PipelineError::TransientIo(format!("state store: {}", other)),
        }
    }
}

impl From<StorageError> for PipelineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => {
                PipelineError::PoisonMessage(format!("source object {} does not exist", key))
            }
            other => PipelineError::TransientIo(format!("object store: {}", other)),
        }
    }
}

impl From<QueueError> for PipelineError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::LeaseLost(_) => PipelineError::LeaseLost,
            other => PipelineError::TransientIo(format!("queue: {}", other)),
        }
    }
}

impl From<AnalysisError> for PipelineError {
    fn from(e: AnalysisError) -> Self {
        PipelineError::CallbackFailure(e.to_string())
    }
}
