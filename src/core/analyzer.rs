//! Turns one case's complete result set into a divergence verdict.
//!
//! The comparison is category-first: two non-completing outcomes of the same
//! kind agree regardless of signal or timing, and only two completed runs are
//! compared byte-for-byte.

use std::fmt;

use serde::Serialize;

use crate::core::{
    domain::{CapturedOutput, CaseId, ConfigId, ExecutionOutcome, TestCase},
    result_set::CaseResultSet,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DivergenceKind {
    OutputMismatch {
        /// First byte offset at which the captured outputs differ.
        first_difference: usize,
        baseline_len: usize,
        other_len: usize,
    },
    ExitStatusMismatch {
        baseline: i32,
        other: i32,
    },
    TimeoutVsCompleted,
    CrashVsCompleted,
    /// One side timed out, the other crashed.
    OutcomeCategoryMismatch,
    BuildFailureAsymmetry,
}

impl DivergenceKind {
    pub fn tag(&self) -> DivergenceTag {
        match self {
            DivergenceKind::OutputMismatch { .. } => DivergenceTag::OutputMismatch,
            DivergenceKind::ExitStatusMismatch { .. } => DivergenceTag::ExitStatusMismatch,
            DivergenceKind::TimeoutVsCompleted => DivergenceTag::TimeoutVsCompleted,
            DivergenceKind::CrashVsCompleted => DivergenceTag::CrashVsCompleted,
            DivergenceKind::OutcomeCategoryMismatch => DivergenceTag::OutcomeCategoryMismatch,
            DivergenceKind::BuildFailureAsymmetry => DivergenceTag::BuildFailureAsymmetry,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceTag {
    OutputMismatch,
    ExitStatusMismatch,
    TimeoutVsCompleted,
    CrashVsCompleted,
    OutcomeCategoryMismatch,
    BuildFailureAsymmetry,
}

impl fmt::Display for DivergenceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DivergenceTag::OutputMismatch => "output mismatch",
            DivergenceTag::ExitStatusMismatch => "exit status mismatch",
            DivergenceTag::TimeoutVsCompleted => "timeout vs completed",
            DivergenceTag::CrashVsCompleted => "crash vs completed",
            DivergenceTag::OutcomeCategoryMismatch => "timeout vs crash",
            DivergenceTag::BuildFailureAsymmetry => "build failure asymmetry",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub config: ConfigId,
    #[serde(flatten)]
    pub kind: DivergenceKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Judgment {
    NoDivergence {
        baseline: ConfigId,
    },
    Diverged {
        baseline: ConfigId,
        divergences: Vec<Divergence>,
    },
    /// Nothing built; there is no baseline to judge against.
    BuildOnly,
    /// Every configuration was skipped because its toolchain was unavailable.
    Unevaluated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DivergenceVerdict {
    pub case_id: CaseId,
    #[serde(flatten)]
    pub judgment: Judgment,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unevaluated: Vec<ConfigId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unstable: Vec<ConfigId>,
}

impl DivergenceVerdict {
    pub fn baseline(&self) -> Option<&ConfigId> {
        match &self.judgment {
            Judgment::NoDivergence { baseline } | Judgment::Diverged { baseline, .. } => {
                Some(baseline)
            }
            Judgment::BuildOnly | Judgment::Unevaluated => None,
        }
    }

    pub fn divergences(&self) -> &[Divergence] {
        match &self.judgment {
            Judgment::Diverged { divergences, .. } => divergences,
            _ => &[],
        }
    }

    pub fn divergence_for(&self, config: &ConfigId) -> Option<&DivergenceKind> {
        self.divergences()
            .iter()
            .find(|d| &d.config == config)
            .map(|d| &d.kind)
    }

    pub fn is_divergent(&self) -> bool {
        matches!(self.judgment, Judgment::Diverged { .. })
    }
}

/// Judges one case. The result set is complete by construction.
pub fn analyze(case: &TestCase, results: &CaseResultSet) -> DivergenceVerdict {
    debug_assert_eq!(&case.id, results.case_id());

    let unevaluated: Vec<ConfigId> = results
        .entries()
        .filter(|(_, record)| record.outcome.is_toolchain_unavailable())
        .map(|(config, _)| config.name.clone())
        .collect();
    let unstable: Vec<ConfigId> = results
        .entries()
        .filter(|(_, record)| record.unstable)
        .map(|(config, _)| config.name.clone())
        .collect();

    let evaluated = || {
        results
            .entries()
            .filter(|(_, record)| !record.outcome.is_toolchain_unavailable())
    };

    // Lowest optimization level among configurations that built; declaration
    // order breaks ties because min_by_key keeps the first minimum.
    let baseline = evaluated()
        .filter(|(_, record)| !matches!(record.outcome, ExecutionOutcome::BuildFailed { .. }))
        .min_by_key(|(config, _)| config.optimization_level());

    let judgment = match baseline {
        None if evaluated().next().is_none() => Judgment::Unevaluated,
        None => Judgment::BuildOnly,
        Some((baseline_config, baseline_record)) => {
            let divergences: Vec<Divergence> = evaluated()
                .filter(|(config, _)| config.name != baseline_config.name)
                .filter_map(|(config, record)| {
                    compare(&baseline_record.outcome, &record.outcome).map(|kind| Divergence {
                        config: config.name.clone(),
                        kind,
                    })
                })
                .collect();

            if divergences.is_empty() {
                Judgment::NoDivergence {
                    baseline: baseline_config.name.clone(),
                }
            } else {
                Judgment::Diverged {
                    baseline: baseline_config.name.clone(),
                    divergences,
                }
            }
        }
    };

    DivergenceVerdict {
        case_id: case.id.clone(),
        judgment,
        unevaluated,
        unstable,
    }
}

/// Compares two outcomes. `None` means they agree.
pub fn compare(baseline: &ExecutionOutcome, other: &ExecutionOutcome) -> Option<DivergenceKind> {
    use ExecutionOutcome::*;

    match (baseline, other) {
        (
            Completed {
                stdout: a,
                exit_code: code_a,
                ..
            },
            Completed {
                stdout: b,
                exit_code: code_b,
                ..
            },
        ) => {
            if let Some(first_difference) = output_difference(a, b) {
                Some(DivergenceKind::OutputMismatch {
                    first_difference,
                    baseline_len: a.bytes.len(),
                    other_len: b.bytes.len(),
                })
            } else if code_a != code_b {
                Some(DivergenceKind::ExitStatusMismatch {
                    baseline: *code_a,
                    other: *code_b,
                })
            } else {
                None
            }
        }
        (Completed { .. }, TimedOut { .. }) | (TimedOut { .. }, Completed { .. }) => {
            Some(DivergenceKind::TimeoutVsCompleted)
        }
        (Completed { .. }, Crashed { .. }) | (Crashed { .. }, Completed { .. }) => {
            Some(DivergenceKind::CrashVsCompleted)
        }
        (TimedOut { .. }, TimedOut { .. }) | (Crashed { .. }, Crashed { .. }) => None,
        (TimedOut { .. }, Crashed { .. }) | (Crashed { .. }, TimedOut { .. }) => {
            Some(DivergenceKind::OutcomeCategoryMismatch)
        }
        (BuildFailed { .. }, BuildFailed { .. }) => None,
        (BuildFailed { .. }, _) | (_, BuildFailed { .. }) => {
            Some(DivergenceKind::BuildFailureAsymmetry)
        }
    }
}

/// Offset of the first differing byte, after truncation normalization.
///
/// Two truncated captures are compared on their common prefix up to the
/// smaller limit. A truncated capture never equals a complete one.
fn output_difference(a: &CapturedOutput, b: &CapturedOutput) -> Option<usize> {
    let (lhs, rhs) = if a.truncated && b.truncated {
        let limit = a.limit.min(b.limit);
        (
            &a.bytes[..a.bytes.len().min(limit)],
            &b.bytes[..b.bytes.len().min(limit)],
        )
    } else {
        (a.bytes.as_slice(), b.bytes.as_slice())
    };

    let differs = first_difference(lhs, rhs);
    if a.truncated != b.truncated {
        return Some(differs.unwrap_or_else(|| lhs.len().min(rhs.len())));
    }
    differs
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}
