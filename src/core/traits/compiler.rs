use crate::core::domain::{Artifact, BuildConfig, CompilationLimits, TestCase};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("compilation failed")]
    CompilationFailed { diagnostics: String },
    #[error("compilation exceeded {time_ms} ms")]
    TimedOut { time_ms: u64 },
    #[error("compiler {compiler} is unavailable: {msg}")]
    ToolchainUnavailable { compiler: String, msg: String },
    #[error("internal build error: {msg}")]
    Internal { msg: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Compiler: std::fmt::Debug + Send + Sync {
    /// Checks that `compiler` can be invoked at all. Returns its version line.
    async fn probe(&self, compiler: &str) -> Result<String, CompileError>;

    async fn compile(
        &self,
        case: &TestCase,
        config: &BuildConfig,
        limits: &CompilationLimits,
    ) -> Result<Artifact, CompileError>;
}
