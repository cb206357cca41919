use std::{fmt::Write as _, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use uuid::Uuid;

use crate::{
    config::{FileConfig, Overrides},
    core::{
        analyzer::Judgment,
        cancel::CancelSignal,
        orchestrator::Orchestrator,
        report::{CaseReport, Report},
    },
    corpus::load_corpus,
    native::{compiler::NativeCompiler, runner::NativeRunner, workspace::RunWorkspace},
};

/// Compile UB fixtures across a compiler/flag matrix and report where
/// observable behaviour diverges.
#[derive(Debug, Parser)]
#[command(name = "ubdiff")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// TOML file with [limits], [policy] and [[config]] sections
    #[arg(short, long, env = "UBDIFF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of .c/.cc/.cpp/.cxx fixtures
    #[arg(long, default_value = "corpus")]
    pub corpus: PathBuf,

    /// Where to write the JSON report
    #[arg(short, long, default_value = "ubdiff-report.json")]
    pub output: PathBuf,

    #[arg(long)]
    pub compile_timeout_ms: Option<u64>,

    #[arg(long)]
    pub run_timeout_ms: Option<u64>,

    /// Number of (case, config) units evaluated at once
    #[arg(short = 'j', long)]
    pub parallelism: Option<usize>,

    /// Run every artifact this many times and flag unstable outcomes
    #[arg(long)]
    pub repetitions: Option<u32>,

    /// Record configurations with a missing compiler as unevaluated instead of aborting
    #[arg(long)]
    pub keep_going: bool,

    /// Leave the build directories in place after the run
    #[arg(long)]
    pub keep_artifacts: bool,

    /// Parent directory for the per-run workspace
    #[arg(long, env = "UBDIFF_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            compile_timeout_ms: self.compile_timeout_ms,
            run_timeout_ms: self.run_timeout_ms,
            parallelism: self.parallelism,
            repetitions: self.repetitions,
            keep_going: self.keep_going,
            keep_artifacts: self.keep_artifacts,
        }
    }
}

/// Loads configuration and corpus, evaluates the whole matrix and writes
/// the report file.
pub async fn run(args: &Args, cancel: CancelSignal) -> Result<Report> {
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let plan = file.into_plan(&args.overrides())?;
    let cases = load_corpus(&args.corpus)?;

    let run_id = Uuid::new_v4();
    let base = args.work_dir.clone().unwrap_or_else(std::env::temp_dir);
    let workspace = Arc::new(
        RunWorkspace::create(&base, run_id, plan.policy.keep_artifacts)
            .with_context(|| format!("creating workspace under {}", base.display()))?,
    );
    if plan.policy.keep_artifacts {
        tracing::info!(dir = %workspace.root().display(), "Keeping build artifacts");
    }

    let orchestrator = Orchestrator::new(
        Arc::new(NativeCompiler::new(workspace.clone())),
        Arc::new(NativeRunner::new()),
        plan,
    )
    .with_run_id(run_id);
    let result = orchestrator.run_corpus(cases, cancel).await;
    drop(orchestrator);

    if let Ok(workspace) = Arc::try_unwrap(workspace) {
        if let Err(err) = workspace.close() {
            tracing::warn!("Failed to remove workspace: {}", err);
        }
    }

    let report = result?;
    let json = serde_json::to_string_pretty(&report)?;
    std::fs::write(&args.output, json)
        .with_context(|| format!("writing report to {}", args.output.display()))?;
    tracing::info!(path = %args.output.display(), "Report written");

    Ok(report)
}

/// One line per case followed by a totals line.
pub fn render_summary(report: &Report) -> String {
    let mut out = String::new();
    let width = report
        .cases
        .iter()
        .map(|c| c.case.id.0.len())
        .max()
        .unwrap_or(0);

    for case in &report.cases {
        let _ = writeln!(out, "{:width$}  {}", case.case.id, case_line(case), width = width);
    }

    let summary = &report.summary;
    let _ = write!(
        out,
        "{} cases: {} divergent, {} build-only",
        summary.total_cases, summary.divergent_cases, summary.build_only_cases
    );
    if summary.toolchain_unavailable > 0 {
        let _ = write!(
            out,
            ", {} configurations unevaluated",
            summary.toolchain_unavailable
        );
    }
    if summary.unstable_configs > 0 {
        let _ = write!(out, ", {} unstable", summary.unstable_configs);
    }
    out.push('\n');
    out
}

fn case_line(case: &CaseReport) -> String {
    let verdict = &case.verdict;
    let mut line = match &verdict.judgment {
        Judgment::NoDivergence { baseline } => format!("no divergence (baseline {})", baseline),
        Judgment::Diverged {
            baseline,
            divergences,
        } => format!(
            "DIVERGED vs {}: {}",
            baseline,
            divergences
                .iter()
                .map(|d| format!("{} {}", d.config, d.kind.tag()))
                .join(", ")
        ),
        Judgment::BuildOnly => "build only (no configuration produced a program)".to_string(),
        Judgment::Unevaluated => "unevaluated".to_string(),
    };
    if !verdict.unevaluated.is_empty() {
        let _ = write!(line, " [unevaluated: {}]", verdict.unevaluated.iter().join(", "));
    }
    if !verdict.unstable.is_empty() {
        let _ = write!(line, " [unstable: {}]", verdict.unstable.iter().join(", "));
    }
    line
}
