use crate::core::{
    analyzer,
    domain::{BuildArtifact, ExecutionOutcome, Limits},
    errors::HarnessError,
    result_set::ConfigRecord,
    traits::runner::{RunError, Runner},
};

/// Runs a built artifact `limits.repetitions` times and records the first
/// outcome. Failed builds short-circuit into a `BuildFailed` outcome.
pub async fn execute(
    runner: &dyn Runner,
    artifact: &BuildArtifact,
    limits: &Limits,
) -> Result<ConfigRecord, HarnessError> {
    let artifact = match artifact {
        BuildArtifact::Runnable(artifact) => artifact,
        BuildArtifact::BuildFailed { kind, diagnostics } => {
            return Ok(ConfigRecord::new(ExecutionOutcome::BuildFailed {
                failure: *kind,
                diagnostics: diagnostics.clone(),
            }));
        }
    };

    let infrastructure = |err: RunError| {
        tracing::error!("Internal error after running: {}", err);
        HarnessError::Infrastructure {
            case: artifact.case_id.clone(),
            config: artifact.config_id.clone(),
            msg: err.to_string(),
        }
    };

    let first = runner
        .run(artifact, &limits.execution)
        .await
        .map_err(infrastructure)?;
    tracing::debug!(
        case = %artifact.case_id,
        config = %artifact.config_id,
        "Execution result: {}",
        first.kind()
    );

    let mut record = ConfigRecord::new(first);
    for attempt in 1..limits.repetitions.max(1) {
        let again = runner
            .run(artifact, &limits.execution)
            .await
            .map_err(infrastructure)?;

        if let Some(kind) = analyzer::compare(&record.outcome, &again) {
            tracing::warn!(
                case = %artifact.case_id,
                config = %artifact.config_id,
                attempt,
                "Repeated execution disagrees with the first: {}",
                kind.tag()
            );
            record.unstable = true;
            break;
        }
    }

    Ok(record)
}
