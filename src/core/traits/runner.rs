use std::path::PathBuf;

use crate::core::domain::{Artifact, ExecutionLimits, ExecutionOutcome};

/// Failures of the harness itself. A program that hangs or crashes is an
/// `ExecutionOutcome`, not a `RunError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    #[error("failed to launch {}: {msg}", path.display())]
    Launch { path: PathBuf, msg: String },
    #[error("internal run error: {msg}")]
    Internal { msg: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Runner: std::fmt::Debug + Send + Sync {
    /// Runs the artifact once. Only `Completed`, `TimedOut` and `Crashed`
    /// outcomes are produced here.
    async fn run(
        &self,
        artifact: &Artifact,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutcome, RunError>;
}
