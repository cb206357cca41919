use std::{
    os::unix::process::ExitStatusExt,
    process::Stdio,
    time::{Duration, Instant},
};

use tokio::process::Command;

use crate::{
    core::{
        domain::{Artifact, CapturedOutput, ExecutionLimits, ExecutionOutcome},
        traits::runner::{RunError, Runner},
    },
    native::process::{self, Capture, ProcessGroup, ResourceLimits},
};

/// Environment variables passed through to test programs. Everything else
/// is cleared so that outcomes depend only on the build.
fn inherited_var(name: &str) -> bool {
    name == "PATH" || name.ends_with("SAN_OPTIONS")
}

/// Runs built artifacts as confined child processes: own process group,
/// no stdin, scrubbed environment, wall-clock deadline and rlimits.
#[derive(Clone, Debug)]
pub struct NativeRunner {
    env: Vec<(String, String)>,
}

impl NativeRunner {
    pub fn new() -> Self {
        NativeRunner {
            env: std::env::vars().filter(|(k, _)| inherited_var(k)).collect(),
        }
    }
}

impl Default for NativeRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// RLIMIT_CPU counts CPU time across all threads, so the backstop is scaled
/// by the core count to stay behind the wall-clock deadline.
fn cpu_backstop_seconds(time_ms: u64) -> u64 {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get() as u64);
    (time_ms.div_ceil(1000) + 1) * cores
}

fn internal(msg: impl ToString) -> RunError {
    RunError::Internal {
        msg: msg.to_string(),
    }
}

#[async_trait::async_trait]
impl Runner for NativeRunner {
    #[tracing::instrument(skip(self, artifact), fields(case = %artifact.case_id, config = %artifact.config_id))]
    async fn run(
        &self,
        artifact: &Artifact,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutcome, RunError> {
        let mut cmd = Command::new(&artifact.path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .kill_on_drop(true);
        if let Some(dir) = artifact.path.parent() {
            cmd.current_dir(dir);
        }
        process::confine(
            &mut cmd,
            ResourceLimits {
                cpu_seconds: Some(cpu_backstop_seconds(limits.time_ms)),
                address_space_bytes: limits.memory_bytes,
            },
        );

        let started = Instant::now();
        let mut child = process::spawn(&mut cmd)
            .await
            .map_err(|err| RunError::Launch {
                path: artifact.path.clone(),
                msg: err.to_string(),
            })?;
        let group = ProcessGroup::of(&child);

        let stdout = child
            .stdout
            .take()
            .map(|pipe| Capture::spawn(pipe, limits.stdout_limit_bytes))
            .ok_or_else(|| internal("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .map(|pipe| Capture::spawn(pipe, limits.stderr_limit_bytes))
            .ok_or_else(|| internal("stderr not captured"))?;

        let deadline = Duration::from_millis(limits.time_ms);
        let grace = Duration::from_millis(limits.kill_grace_ms);
        let (status, mut timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => (status.map_err(internal)?, None),
            Err(_) => {
                let (status, escalated) = process::terminate(&mut child, &group, grace)
                    .await
                    .map_err(internal)?;
                (status, Some(escalated))
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        group.sweep();

        let (out, out_truncated) = stdout.finish(grace).await.map_err(internal)?;
        let (err, err_truncated) = stderr.finish(grace).await.map_err(internal)?;
        let stderr = CapturedOutput::new(err, err_truncated, limits.stderr_limit_bytes);

        // SIGXCPU only comes from the CPU backstop, which is a time limit.
        if status.signal() == Some(libc::SIGXCPU) {
            timed_out.get_or_insert(false);
        }

        let outcome = if let Some(escalated) = timed_out {
            ExecutionOutcome::TimedOut {
                elapsed_ms: elapsed_ms.max(limits.time_ms),
                escalated,
            }
        } else if let Some(signal) = status.signal() {
            ExecutionOutcome::Crashed {
                signal,
                signal_name: process::signal_name(signal),
                core_dumped: status.core_dumped(),
                stderr,
                elapsed_ms,
            }
        } else {
            ExecutionOutcome::Completed {
                stdout: CapturedOutput::new(out, out_truncated, limits.stdout_limit_bytes),
                stderr,
                exit_code: status.code().unwrap_or(-1),
                elapsed_ms,
            }
        };

        tracing::debug!(elapsed_ms, "Execution result: {}", outcome.kind());
        Ok(outcome)
    }
}
