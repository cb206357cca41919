use std::time::Duration;

use crate::core::{
    domain::{Artifact, BuildConfig, CompilationLimits, TestCase},
    traits::compiler::{CompileError, Compiler},
};

/// Succeeds for every unit after `delay`, pointing at a path that is never
/// created.
#[derive(Debug, Clone)]
pub struct CompilerStub {
    delay: Duration,
}

impl CompilerStub {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait::async_trait]
impl Compiler for CompilerStub {
    async fn probe(&self, compiler: &str) -> Result<String, CompileError> {
        Ok(format!("{} (stub)", compiler))
    }

    #[tracing::instrument]
    async fn compile(
        &self,
        case: &TestCase,
        config: &BuildConfig,
        limits: &CompilationLimits,
    ) -> Result<Artifact, CompileError> {
        tokio::time::sleep(self.delay).await;
        let artifact = Artifact {
            case_id: case.id.clone(),
            config_id: config.name.clone(),
            path: format!("/nonexistent/{}/{}/a.out", case.id, config.name).into(),
        };
        tracing::debug!("Compilation result: {:?}", artifact);
        Ok(artifact)
    }
}
