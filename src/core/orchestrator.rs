use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::Utc;
use itertools::Itertools;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::core::{
    analyzer::analyze,
    cancel::CancelSignal,
    domain::{BuildConfig, CaseId, RunPlan, TestCase},
    errors::HarnessError,
    pipeline::{building::build, running::execute},
    report::{CaseReport, Report, ReportBuilder},
    result_set::{ConfigRecord, PendingCase},
    traits::{
        compiler::{CompileError, Compiler},
        runner::Runner,
    },
};

/// Outcome of one (case, config) unit as returned by a worker.
#[derive(Debug)]
struct UnitResult {
    case_id: CaseId,
    config: BuildConfig,
    record: ConfigRecord,
}

/// Drives the whole (case × config) matrix through build and run under a
/// bounded worker pool, and folds completed cases into a report.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    compiler: Arc<dyn Compiler>,
    runner: Arc<dyn Runner>,
    plan: Arc<RunPlan>,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(compiler: Arc<dyn Compiler>, runner: Arc<dyn Runner>, plan: RunPlan) -> Self {
        Orchestrator {
            compiler,
            runner,
            plan: Arc::new(plan),
            run_id: Uuid::new_v4(),
        }
    }

    /// Reuses an id chosen by the caller, e.g. one already used to name the
    /// run's workspace.
    pub fn with_run_id(self, run_id: Uuid) -> Self {
        Orchestrator { run_id, ..self }
    }

    #[tracing::instrument(skip_all, fields(cases = cases.len(), configs = self.plan.matrix.len()))]
    pub async fn run_corpus(
        &self,
        cases: Vec<TestCase>,
        mut cancel: CancelSignal,
    ) -> Result<Report, HarnessError> {
        let run_id = self.run_id;
        let started_at = Utc::now();
        let matrix = &self.plan.matrix;

        if let Some(duplicate) = cases.iter().map(|c| &c.id).duplicates().next() {
            return Err(HarnessError::DuplicateCase(duplicate.clone()));
        }

        self.preflight().await?;

        let mut units: VecDeque<(TestCase, BuildConfig)> = cases
            .iter()
            .cartesian_product(matrix.configs())
            .map(|(case, config)| (case.clone(), config.clone()))
            .collect();
        let mut pending: HashMap<CaseId, PendingCase> = cases
            .into_iter()
            .map(|case| (case.id.clone(), PendingCase::new(case, matrix)))
            .collect();

        tracing::info!(%run_id, units = units.len(), "Starting run");

        let width = self.plan.limits.parallelism.max(1);
        let mut workers: JoinSet<Result<UnitResult, HarnessError>> = JoinSet::new();
        let mut builder = ReportBuilder::new(run_id, started_at, &self.plan);

        loop {
            while workers.len() < width && !cancel.is_cancelled() {
                let Some((case, config)) = units.pop_front() else {
                    break;
                };
                workers.spawn(run_unit(
                    self.compiler.clone(),
                    self.runner.clone(),
                    self.plan.clone(),
                    case,
                    config,
                ));
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!("Run cancelled, terminating {} in-flight units", workers.len());
                    shutdown(&mut workers).await;
                    return Err(HarnessError::Cancelled);
                }
                joined = workers.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let unit = match joined {
                Ok(Ok(unit)) => unit,
                Ok(Err(err)) => {
                    shutdown(&mut workers).await;
                    return Err(err);
                }
                Err(err) => {
                    shutdown(&mut workers).await;
                    return Err(err.into());
                }
            };

            if unit.record.outcome.is_toolchain_unavailable() && !self.plan.policy.keep_going {
                shutdown(&mut workers).await;
                return Err(HarnessError::ToolchainUnavailable {
                    config: unit.config.name.clone(),
                    compiler: unit.config.compiler.clone(),
                    msg: format!("could not build {}", unit.case_id),
                });
            }

            let Some(case) = pending.get_mut(&unit.case_id) else {
                tracing::error!(case = %unit.case_id, "Outcome for unknown case");
                continue;
            };
            if !case.record(unit.config.name.clone(), unit.record) {
                tracing::error!(case = %unit.case_id, config = %unit.config.name, "Duplicate outcome");
            }

            if case.is_complete() {
                if let Some(case) = pending.remove(&unit.case_id) {
                    let (case, results) = case.finish(matrix)?;
                    let verdict = analyze(&case, &results);
                    tracing::info!(
                        case = %case.id,
                        divergent = verdict.is_divergent(),
                        baseline = ?verdict.baseline(),
                        "Case analysed ({}/{})",
                        builder.len() + 1,
                        builder.len() + 1 + pending.len()
                    );
                    builder.push(CaseReport::new(case, &results, verdict));
                }
            }
        }

        for case in pending.into_values() {
            case.finish(matrix)?;
        }

        let report = builder.finish(Utc::now());
        tracing::info!(
            %run_id,
            total = report.summary.total_cases,
            divergent = report.summary.divergent_cases,
            "Run finished"
        );
        Ok(report)
    }

    /// Invokes every distinct compiler once before any unit is scheduled.
    async fn preflight(&self) -> Result<(), HarnessError> {
        let probes = self
            .plan
            .matrix
            .compilers()
            .into_iter()
            .map(|(compiler, config)| async move {
                (compiler, config, self.compiler.probe(compiler).await)
            });

        for (compiler, config, result) in futures::future::join_all(probes).await {
            match result {
                Ok(version) => tracing::info!(compiler, "Using {}", version),
                Err(err) => {
                    let msg = match err {
                        CompileError::ToolchainUnavailable { msg, .. } => msg,
                        other => other.to_string(),
                    };
                    if !self.plan.policy.keep_going {
                        return Err(HarnessError::ToolchainUnavailable {
                            config: config.clone(),
                            compiler: compiler.to_string(),
                            msg,
                        });
                    }
                    tracing::warn!(compiler, "Compiler unavailable, continuing: {}", msg);
                }
            }
        }
        Ok(())
    }
}

async fn run_unit(
    compiler: Arc<dyn Compiler>,
    runner: Arc<dyn Runner>,
    plan: Arc<RunPlan>,
    case: TestCase,
    config: BuildConfig,
) -> Result<UnitResult, HarnessError> {
    let artifact = build(&*compiler, &case, &config, &plan.limits.compilation).await?;
    let record = execute(&*runner, &artifact, &plan.limits).await?;
    Ok(UnitResult {
        case_id: case.id,
        config,
        record,
    })
}

/// Aborts every worker and waits until each has been dropped. Dropping a
/// worker kills the process group it was waiting on.
async fn shutdown(workers: &mut JoinSet<Result<UnitResult, HarnessError>>) {
    workers.abort_all();
    while workers.join_next().await.is_some() {}
}
