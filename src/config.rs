use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::core::domain::{BuildConfig, ConfigId, ConfigMatrix, Limits, RunPlan, RunPolicy};

/// On-disk run configuration. Every field is optional; anything missing
/// falls back to the built-in defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default, rename = "config")]
    pub configs: Vec<ConfigEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    pub compile_timeout_ms: Option<u64>,
    pub diagnostics_limit_bytes: Option<usize>,
    pub run_timeout_ms: Option<u64>,
    pub kill_grace_ms: Option<u64>,
    pub output_limit_bytes: Option<usize>,
    pub stderr_limit_bytes: Option<usize>,
    pub memory_limit_bytes: Option<u64>,
    pub repetitions: Option<u32>,
    pub parallelism: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    pub keep_going: Option<bool>,
    pub keep_artifacts: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigEntry {
    pub name: String,
    pub compiler: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub compile_timeout_ms: Option<u64>,
    pub run_timeout_ms: Option<u64>,
    pub parallelism: Option<usize>,
    pub repetitions: Option<u32>,
    pub keep_going: bool,
    pub keep_artifacts: bool,
}

/// The matrix used when no `[[config]]` entries are given.
pub fn default_matrix() -> Vec<BuildConfig> {
    vec![
        BuildConfig::new("gcc_o0", "g++", &["-O0"]),
        BuildConfig::new("gcc_o2", "g++", &["-O2"]),
        BuildConfig::new("gcc_o3", "g++", &["-O3"]),
        BuildConfig::new("clang_o0", "clang++", &["-O0"]),
        BuildConfig::new("clang_o2", "clang++", &["-O2"]),
        BuildConfig::new("clang_o3", "clang++", &["-O3"]),
        BuildConfig::new("clang_ubsan", "clang++", &["-O0", "-fsanitize=undefined"]),
    ]
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn into_plan(self, overrides: &Overrides) -> Result<RunPlan> {
        let mut limits = Limits::default();
        let section = self.limits;

        let compilation = &mut limits.compilation;
        compilation.time_ms = overrides
            .compile_timeout_ms
            .or(section.compile_timeout_ms)
            .unwrap_or(compilation.time_ms);
        if let Some(bytes) = section.diagnostics_limit_bytes {
            compilation.diagnostics_limit_bytes = bytes;
        }

        let execution = &mut limits.execution;
        execution.time_ms = overrides
            .run_timeout_ms
            .or(section.run_timeout_ms)
            .unwrap_or(execution.time_ms);
        if let Some(grace) = section.kill_grace_ms {
            execution.kill_grace_ms = grace;
        }
        if let Some(bytes) = section.output_limit_bytes {
            execution.stdout_limit_bytes = bytes;
        }
        if let Some(bytes) = section.stderr_limit_bytes {
            execution.stderr_limit_bytes = bytes;
        }
        execution.memory_bytes = section.memory_limit_bytes.or(execution.memory_bytes);

        limits.repetitions = overrides
            .repetitions
            .or(section.repetitions)
            .unwrap_or(limits.repetitions);
        limits.parallelism = overrides
            .parallelism
            .or(section.parallelism)
            .unwrap_or(limits.parallelism);

        ensure!(limits.compilation.time_ms > 0, "compile timeout must be positive");
        ensure!(limits.execution.time_ms > 0, "run timeout must be positive");
        ensure!(limits.repetitions > 0, "repetitions must be at least 1");
        ensure!(limits.parallelism > 0, "parallelism must be at least 1");

        let policy = RunPolicy {
            keep_going: overrides.keep_going || self.policy.keep_going.unwrap_or(false),
            keep_artifacts: overrides.keep_artifacts
                || self.policy.keep_artifacts.unwrap_or(false),
        };

        let configs = if self.configs.is_empty() {
            default_matrix()
        } else {
            self.configs
                .into_iter()
                .map(|entry| BuildConfig {
                    name: ConfigId(entry.name),
                    compiler: entry.compiler,
                    flags: entry.flags,
                })
                .collect()
        };
        let matrix = ConfigMatrix::new(configs)?;

        Ok(RunPlan {
            matrix,
            limits,
            policy,
        })
    }
}
