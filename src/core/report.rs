use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::{
    analyzer::{DivergenceKind, DivergenceTag, DivergenceVerdict, Judgment},
    domain::{ConfigId, ConfigMatrix, ExecutionOutcome, Limits, OptLevel, RunPlan, TestCase},
    result_set::CaseResultSet,
};

/// Stderr markers emitted by UBSan and ASan.
const SANITIZER_MARKERS: [&str; 3] = [
    "runtime error:",
    "ERROR: AddressSanitizer",
    "ERROR: UndefinedBehaviorSanitizer",
];

#[derive(Clone, Debug, Serialize)]
pub struct ConfigReport {
    pub config: ConfigId,
    pub optimization: OptLevel,
    pub baseline: bool,
    pub outcome: ExecutionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence: Option<DivergenceKind>,
    pub unstable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sanitizer_findings: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CaseReport {
    pub case: TestCase,
    pub verdict: DivergenceVerdict,
    pub configs: Vec<ConfigReport>,
}

impl CaseReport {
    pub fn new(case: TestCase, results: &CaseResultSet, verdict: DivergenceVerdict) -> Self {
        let configs = results
            .entries()
            .map(|(config, record)| ConfigReport {
                config: config.name.clone(),
                optimization: config.optimization_level(),
                baseline: verdict.baseline() == Some(&config.name),
                outcome: record.outcome.clone(),
                divergence: verdict.divergence_for(&config.name).cloned(),
                unstable: record.unstable,
                sanitizer_findings: sanitizer_findings(&record.outcome),
            })
            .collect();

        CaseReport {
            case,
            verdict,
            configs,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total_cases: usize,
    pub divergent_cases: usize,
    pub build_only_cases: usize,
    pub unevaluated_cases: usize,
    pub divergences_by_kind: BTreeMap<DivergenceTag, usize>,
    /// Configurations (across all cases) whose compiler could not be invoked.
    pub toolchain_unavailable: usize,
    pub unstable_configs: usize,
}

impl ReportSummary {
    fn add(&mut self, verdict: &DivergenceVerdict) {
        self.total_cases += 1;
        match &verdict.judgment {
            Judgment::Diverged { divergences, .. } => {
                self.divergent_cases += 1;
                for divergence in divergences {
                    *self
                        .divergences_by_kind
                        .entry(divergence.kind.tag())
                        .or_default() += 1;
                }
            }
            Judgment::BuildOnly => self.build_only_cases += 1,
            Judgment::Unevaluated => self.unevaluated_cases += 1,
            Judgment::NoDivergence { .. } => {}
        }
        self.toolchain_unavailable += verdict.unevaluated.len();
        self.unstable_configs += verdict.unstable.len();
    }
}

/// How a finished run should be read by automation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunClass {
    NoDivergence,
    DivergenceFound,
    InfrastructureFailure,
}

impl RunClass {
    pub fn exit_code(self) -> u8 {
        match self {
            RunClass::NoDivergence => 0,
            RunClass::DivergenceFound => 1,
            RunClass::InfrastructureFailure => 2,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub matrix: ConfigMatrix,
    pub limits: Limits,
    pub cases: Vec<CaseReport>,
    pub summary: ReportSummary,
}

impl Report {
    /// A configuration that never ran makes the run inconclusive, even if
    /// other configurations diverged.
    pub fn class(&self) -> RunClass {
        if self.summary.toolchain_unavailable > 0 {
            RunClass::InfrastructureFailure
        } else if self.summary.divergent_cases > 0 {
            RunClass::DivergenceFound
        } else {
            RunClass::NoDivergence
        }
    }
}

/// Folds verdicts as they arrive. Owned by the orchestrator loop, so no
/// synchronisation is needed.
#[derive(Debug)]
pub struct ReportBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    matrix: ConfigMatrix,
    limits: Limits,
    cases: Vec<CaseReport>,
}

impl ReportBuilder {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, plan: &RunPlan) -> Self {
        ReportBuilder {
            run_id,
            started_at,
            matrix: plan.matrix.clone(),
            limits: plan.limits.clone(),
            cases: Vec::new(),
        }
    }

    pub fn push(&mut self, case: CaseReport) {
        self.cases.push(case);
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn finish(self, finished_at: DateTime<Utc>) -> Report {
        let mut cases = self.cases;
        cases.sort_by(|a, b| a.case.id.cmp(&b.case.id));

        let mut summary = ReportSummary::default();
        for case in &cases {
            summary.add(&case.verdict);
        }

        Report {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            matrix: self.matrix,
            limits: self.limits,
            cases,
            summary,
        }
    }
}

fn sanitizer_findings(outcome: &ExecutionOutcome) -> Vec<String> {
    let Some(stderr) = outcome.stderr() else {
        return Vec::new();
    };

    stderr
        .text()
        .lines()
        .filter(|line| SANITIZER_MARKERS.iter().any(|marker| line.contains(marker)))
        .map(|line| line.trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        analyzer::analyze,
        domain::{BuildConfig, BuildFailureKind, CapturedOutput, RunPolicy},
        result_set::ConfigRecord,
    };

    fn plan() -> RunPlan {
        RunPlan {
            matrix: ConfigMatrix::new(vec![
                BuildConfig::new("clang_o0", "clang++", &["-O0"]),
                BuildConfig::new("clang_o2", "clang++", &["-O2"]),
            ])
            .unwrap(),
            limits: Limits::default(),
            policy: RunPolicy::default(),
        }
    }

    fn completed(stdout: &str, stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome::Completed {
            stdout: CapturedOutput::complete(stdout.as_bytes()),
            stderr: CapturedOutput::complete(stderr.as_bytes()),
            exit_code: 0,
            elapsed_ms: 1,
        }
    }

    fn case_report(plan: &RunPlan, id: &str, o0: ExecutionOutcome, o2: ExecutionOutcome) -> CaseReport {
        let case = TestCase::new(id, format!("{}.cpp", id));
        let results = CaseResultSet::assemble(
            case.id.clone(),
            &plan.matrix,
            vec![
                ("clang_o0".into(), ConfigRecord::new(o0)),
                ("clang_o2".into(), ConfigRecord::new(o2)),
            ],
        )
        .unwrap();
        let verdict = analyze(&case, &results);
        CaseReport::new(case, &results, verdict)
    }

    #[test]
    fn test_report_sorts_cases_and_counts() {
        let plan = plan();
        let mut builder = ReportBuilder::new(Uuid::new_v4(), Utc::now(), &plan);

        builder.push(case_report(
            &plan,
            "test_shift",
            completed("Result: -400\n", ""),
            completed("Result: -400\n", ""),
        ));
        builder.push(case_report(
            &plan,
            "test_loop_overflow",
            completed("Result: 2147\n", ""),
            ExecutionOutcome::TimedOut {
                elapsed_ms: 5000,
                escalated: true,
            },
        ));
        builder.push(case_report(
            &plan,
            "test_broken",
            ExecutionOutcome::BuildFailed {
                failure: BuildFailureKind::CompileError,
                diagnostics: "error".to_string(),
            },
            ExecutionOutcome::BuildFailed {
                failure: BuildFailureKind::CompileError,
                diagnostics: "error".to_string(),
            },
        ));
        assert_eq!(builder.len(), 3);

        let report = builder.finish(Utc::now());
        let ids: Vec<_> = report.cases.iter().map(|c| c.case.id.0.as_str()).collect();
        assert_eq!(ids, vec!["test_broken", "test_loop_overflow", "test_shift"]);

        assert_eq!(report.summary.total_cases, 3);
        assert_eq!(report.summary.divergent_cases, 1);
        assert_eq!(report.summary.build_only_cases, 1);
        assert_eq!(
            report.summary.divergences_by_kind.get(&DivergenceTag::TimeoutVsCompleted),
            Some(&1)
        );
        assert_eq!(report.class(), RunClass::DivergenceFound);
    }

    #[test]
    fn test_config_reports_mark_baseline_and_divergence() {
        let plan = plan();
        let report = case_report(
            &plan,
            "test_dereference",
            completed("Result: p is null\n", ""),
            ExecutionOutcome::Crashed {
                signal: 11,
                signal_name: "SIGSEGV".to_string(),
                core_dumped: false,
                stderr: CapturedOutput::empty(64),
                elapsed_ms: 1,
            },
        );

        assert!(report.configs[0].baseline);
        assert!(report.configs[0].divergence.is_none());
        assert!(!report.configs[1].baseline);
        assert_eq!(
            report.configs[1].divergence,
            Some(DivergenceKind::CrashVsCompleted)
        );
        assert_eq!(report.configs[1].optimization, OptLevel::O2);
    }

    #[test]
    fn test_sanitizer_findings_are_extracted() {
        let plan = plan();
        let report = case_report(
            &plan,
            "test_shift",
            completed(
                "Result: -400\n",
                "test_shift.cpp:11:33: runtime error: left shift of negative value -100\n",
            ),
            completed("Result: -400\n", "unrelated noise\n"),
        );

        assert_eq!(
            report.configs[0].sanitizer_findings,
            vec!["test_shift.cpp:11:33: runtime error: left shift of negative value -100"]
        );
        assert!(report.configs[1].sanitizer_findings.is_empty());
    }

    #[test]
    fn test_unavailable_toolchain_makes_run_inconclusive() {
        let plan = plan();
        let mut builder = ReportBuilder::new(Uuid::new_v4(), Utc::now(), &plan);
        builder.push(case_report(
            &plan,
            "test_shift",
            completed("Result: -400\n", ""),
            ExecutionOutcome::BuildFailed {
                failure: BuildFailureKind::ToolchainUnavailable,
                diagnostics: "clang++: not found".to_string(),
            },
        ));

        let report = builder.finish(Utc::now());
        assert_eq!(report.summary.toolchain_unavailable, 1);
        assert_eq!(report.summary.divergent_cases, 0);
        assert_eq!(report.class(), RunClass::InfrastructureFailure);
        assert_eq!(report.class().exit_code(), 2);
    }

    #[test]
    fn test_report_json_shape() {
        let plan = plan();
        let mut builder = ReportBuilder::new(Uuid::new_v4(), Utc::now(), &plan);
        builder.push(case_report(
            &plan,
            "test_accumulate",
            completed("Result: -2147483648\n", ""),
            completed("Result: 2147483648\n", ""),
        ));
        let report = builder.finish(Utc::now());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["matrix"][0]["name"], "clang_o0");
        assert_eq!(json["cases"][0]["verdict"]["status"], "diverged");
        assert_eq!(json["cases"][0]["configs"][1]["divergence"]["kind"], "output_mismatch");
        assert_eq!(
            json["cases"][0]["configs"][1]["outcome"]["stdout"]["text"],
            "Result: 2147483648\n"
        );
        assert_eq!(json["summary"]["divergences_by_kind"]["output_mismatch"], 1);
    }
}
