use std::{
    borrow::Cow,
    collections::HashSet,
    fmt,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize, Serializer, ser::SerializeStruct};
use sha2::{Digest, Sha256};

use crate::core::errors::HarnessError;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub String);

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for CaseId {
    fn from(value: &str) -> Self {
        CaseId(value.to_string())
    }
}

/// A single fixture program. The source is opaque to the harness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TestCase {
    pub id: CaseId,
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TestCase {
    pub fn new<P: AsRef<Path>>(id: &str, source: P) -> Self {
        TestCase {
            id: id.into(),
            source: source.as_ref().into(),
            category: None,
            description: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(pub String);

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ConfigId {
    fn from(value: &str) -> Self {
        ConfigId(value.to_string())
    }
}

/// Optimization level as the compiler driver would resolve it from the flags.
/// Variant order is the baseline preference order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum OptLevel {
    O0,
    Og,
    O1,
    Os,
    Oz,
    O2,
    O3,
    Ofast,
}

impl OptLevel {
    /// Last `-O*` flag wins, like gcc and clang. Unrecognised spellings are ignored.
    pub fn from_flags<S: AsRef<str>>(flags: &[S]) -> Self {
        flags
            .iter()
            .filter_map(|flag| Self::parse(flag.as_ref()))
            .last()
            .unwrap_or(OptLevel::O0)
    }

    fn parse(flag: &str) -> Option<Self> {
        let level = flag.strip_prefix("-O")?;
        match level {
            "0" => Some(OptLevel::O0),
            "" | "1" => Some(OptLevel::O1),
            "2" => Some(OptLevel::O2),
            "s" => Some(OptLevel::Os),
            "z" => Some(OptLevel::Oz),
            "g" => Some(OptLevel::Og),
            "fast" => Some(OptLevel::Ofast),
            n if n.parse::<u32>().is_ok_and(|n| n >= 3) => Some(OptLevel::O3),
            _ => None,
        }
    }
}

/// One cell of the build matrix. Equality and hashing only look at the
/// compiler and the flags; the name is a label.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    pub name: ConfigId,
    pub compiler: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl BuildConfig {
    pub fn new(name: &str, compiler: &str, flags: &[&str]) -> Self {
        BuildConfig {
            name: name.into(),
            compiler: compiler.to_string(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn optimization_level(&self) -> OptLevel {
        OptLevel::from_flags(&self.flags)
    }

    /// Hex sha256 over the compiler and the NUL-separated flags.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.compiler.as_bytes());
        for flag in &self.flags {
            hasher.update([0u8]);
            hasher.update(flag.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl PartialEq for BuildConfig {
    fn eq(&self, other: &Self) -> bool {
        (&self.compiler, &self.flags) == (&other.compiler, &other.flags)
    }
}

impl Eq for BuildConfig {}

impl Hash for BuildConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.compiler.hash(state);
        self.flags.hash(state);
    }
}

impl fmt::Display for BuildConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.name, self.compiler)?;
        for flag in &self.flags {
            write!(f, " {}", flag)?;
        }
        f.write_str(")")
    }
}

/// Validated, ordered set of build configurations. Declaration order is
/// significant: it breaks baseline ties.
#[derive(Clone, Debug, Serialize)]
#[serde(transparent)]
pub struct ConfigMatrix {
    configs: Vec<BuildConfig>,
}

impl ConfigMatrix {
    pub fn new(configs: Vec<BuildConfig>) -> Result<Self, HarnessError> {
        if configs.is_empty() {
            return Err(HarnessError::InvalidMatrix(
                "matrix must contain at least one configuration".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut contents: HashSet<&BuildConfig> = HashSet::new();
        for config in &configs {
            if config.name.0.trim().is_empty() {
                return Err(HarnessError::InvalidMatrix(
                    "configuration name must not be empty".to_string(),
                ));
            }
            if config.compiler.trim().is_empty() {
                return Err(HarnessError::InvalidMatrix(format!(
                    "configuration {} has no compiler",
                    config.name
                )));
            }
            if !names.insert(&config.name) {
                return Err(HarnessError::InvalidMatrix(format!(
                    "duplicate configuration name {}",
                    config.name
                )));
            }
            if let Some(existing) = contents.get(config) {
                return Err(HarnessError::InvalidMatrix(format!(
                    "configurations {} and {} build with identical compiler and flags",
                    existing.name, config.name
                )));
            }
            contents.insert(config);
        }

        Ok(ConfigMatrix { configs })
    }

    pub fn configs(&self) -> &[BuildConfig] {
        &self.configs
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn get(&self, id: &ConfigId) -> Option<&BuildConfig> {
        self.configs.iter().find(|c| &c.name == id)
    }

    /// Distinct compilers in declaration order, each with the first
    /// configuration that uses it.
    pub fn compilers(&self) -> Vec<(&str, &ConfigId)> {
        let mut seen = HashSet::new();
        self.configs
            .iter()
            .filter(|c| seen.insert(c.compiler.as_str()))
            .map(|c| (c.compiler.as_str(), &c.name))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationLimits {
    pub time_ms: u64,
    pub diagnostics_limit_bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub time_ms: u64,
    /// Time between SIGTERM and SIGKILL on deadline expiry.
    pub kill_grace_ms: u64,
    pub stdout_limit_bytes: usize,
    pub stderr_limit_bytes: usize,
    pub memory_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub compilation: CompilationLimits,
    pub execution: ExecutionLimits,
    pub repetitions: u32,
    pub parallelism: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            compilation: CompilationLimits {
                time_ms: 10_000,
                diagnostics_limit_bytes: 64 * 1024,
            },
            execution: ExecutionLimits {
                time_ms: 5_000,
                kill_grace_ms: 200,
                stdout_limit_bytes: 64 * 1024,
                stderr_limit_bytes: 64 * 1024,
                memory_bytes: None,
            },
            repetitions: 1,
            parallelism: 4,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPolicy {
    /// Record unavailable toolchains as unevaluated instead of aborting.
    pub keep_going: bool,
    pub keep_artifacts: bool,
}

/// Everything a run needs besides the corpus. Passed by value into the
/// orchestrator and never mutated.
#[derive(Clone, Debug)]
pub struct RunPlan {
    pub matrix: ConfigMatrix,
    pub limits: Limits,
    pub policy: RunPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub case_id: CaseId,
    pub config_id: ConfigId,
    pub path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFailureKind {
    CompileError,
    CompileTimeout,
    ToolchainUnavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildArtifact {
    Runnable(Artifact),
    BuildFailed {
        kind: BuildFailureKind,
        diagnostics: String,
    },
}

/// Serialized as `text` (lossy UTF-8) plus, when the bytes are not valid
/// UTF-8, a `hex` field holding them exactly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    /// The program wrote more than `limit` bytes; `bytes` holds the first `limit`.
    pub truncated: bool,
    pub limit: usize,
}

impl CapturedOutput {
    pub fn new(bytes: Vec<u8>, truncated: bool, limit: usize) -> Self {
        CapturedOutput {
            bytes,
            truncated,
            limit,
        }
    }

    pub fn complete(bytes: &[u8]) -> Self {
        CapturedOutput::new(bytes.to_vec(), false, usize::MAX)
    }

    pub fn empty(limit: usize) -> Self {
        CapturedOutput::new(Vec::new(), false, limit)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

impl Serialize for CapturedOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let exact = std::str::from_utf8(&self.bytes).is_ok();
        let mut state =
            serializer.serialize_struct("CapturedOutput", if exact { 3 } else { 4 })?;
        state.serialize_field("text", &self.text())?;
        if exact {
            state.skip_field("hex")?;
        } else {
            state.serialize_field("hex", &hex::encode(&self.bytes))?;
        }
        state.serialize_field("truncated", &self.truncated)?;
        state.serialize_field("limit", &self.limit)?;
        state.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    TimedOut,
    Crashed,
    BuildFailed,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeKind::Completed => "completed",
            OutcomeKind::TimedOut => "timed out",
            OutcomeKind::Crashed => "crashed",
            OutcomeKind::BuildFailed => "build failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed {
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        exit_code: i32,
        elapsed_ms: u64,
    },
    TimedOut {
        elapsed_ms: u64,
        /// SIGTERM was not enough and the group had to be SIGKILLed.
        escalated: bool,
    },
    Crashed {
        signal: i32,
        signal_name: String,
        core_dumped: bool,
        stderr: CapturedOutput,
        elapsed_ms: u64,
    },
    BuildFailed {
        failure: BuildFailureKind,
        diagnostics: String,
    },
}

impl ExecutionOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            ExecutionOutcome::Completed { .. } => OutcomeKind::Completed,
            ExecutionOutcome::TimedOut { .. } => OutcomeKind::TimedOut,
            ExecutionOutcome::Crashed { .. } => OutcomeKind::Crashed,
            ExecutionOutcome::BuildFailed { .. } => OutcomeKind::BuildFailed,
        }
    }

    pub fn stderr(&self) -> Option<&CapturedOutput> {
        match self {
            ExecutionOutcome::Completed { stderr, .. } | ExecutionOutcome::Crashed { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }

    pub fn is_toolchain_unavailable(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::BuildFailed {
                failure: BuildFailureKind::ToolchainUnavailable,
                ..
            }
        )
    }
}
