use crate::core::{
    domain::{CaseId, ConfigId},
    result_set::IncompleteResultSet,
};

/// Failures that abort a whole run. Per-case findings (compile errors,
/// timeouts, crashes) are never reported through this type.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("invalid build matrix: {0}")]
    InvalidMatrix(String),

    #[error("test case {0} appears more than once in the corpus")]
    DuplicateCase(CaseId),

    #[error("toolchain unavailable for configuration {config} ({compiler}): {msg}")]
    ToolchainUnavailable {
        config: ConfigId,
        compiler: String,
        msg: String,
    },

    #[error("infrastructure failure while evaluating {case} under {config}: {msg}")]
    Infrastructure {
        case: CaseId,
        config: ConfigId,
        msg: String,
    },

    #[error(transparent)]
    Incomplete(#[from] IncompleteResultSet),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("run cancelled")]
    Cancelled,
}
