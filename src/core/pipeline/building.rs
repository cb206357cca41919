use crate::core::{
    domain::{BuildArtifact, BuildConfig, BuildFailureKind, CompilationLimits, TestCase},
    errors::HarnessError,
    traits::compiler::{CompileError, Compiler},
};

/// Compiles one (case, config) unit. Rejected input and unavailable
/// toolchains come back as `BuildFailed` data; only internal failures of the
/// build machinery are errors.
#[tracing::instrument(skip_all, fields(case = %case.id, config = %config.name))]
pub async fn build(
    compiler: &dyn Compiler,
    case: &TestCase,
    config: &BuildConfig,
    limits: &CompilationLimits,
) -> Result<BuildArtifact, HarnessError> {
    tracing::debug!("Start compiling");
    let result = compiler.compile(case, config, limits).await;
    tracing::debug!("Compilation result: {:?}", result);

    match result {
        Ok(artifact) => Ok(BuildArtifact::Runnable(artifact)),
        Err(CompileError::CompilationFailed { diagnostics }) => Ok(BuildArtifact::BuildFailed {
            kind: BuildFailureKind::CompileError,
            diagnostics,
        }),
        Err(CompileError::TimedOut { time_ms }) => Ok(BuildArtifact::BuildFailed {
            kind: BuildFailureKind::CompileTimeout,
            diagnostics: format!("compiler did not finish within {} ms", time_ms),
        }),
        Err(CompileError::ToolchainUnavailable { compiler, msg }) => {
            tracing::warn!(compiler = %compiler, "Toolchain unavailable: {}", msg);
            Ok(BuildArtifact::BuildFailed {
                kind: BuildFailureKind::ToolchainUnavailable,
                diagnostics: msg,
            })
        }
        Err(CompileError::Internal { msg }) => {
            tracing::error!("Internal error while compiling: {}", msg);
            Err(HarnessError::Infrastructure {
                case: case.id.clone(),
                config: config.name.clone(),
                msg,
            })
        }
    }
}
