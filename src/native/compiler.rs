use std::{io, process::Stdio, sync::Arc, time::Duration};

use tokio::process::Command;

use crate::{
    core::{
        domain::{Artifact, BuildConfig, CompilationLimits, TestCase},
        traits::compiler::{CompileError, Compiler},
    },
    native::{
        process::{self, Capture, ProcessGroup, ResourceLimits},
        workspace::RunWorkspace,
    },
};

const ARTIFACT_NAME: &str = "a.out";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const KILL_GRACE: Duration = Duration::from_millis(200);
const TRUNCATION_MARKER: &str = "\n[diagnostics truncated]";

/// Builds each unit with an external compiler process into its own
/// workspace directory.
#[derive(Clone, Debug)]
pub struct NativeCompiler {
    workspace: Arc<RunWorkspace>,
}

impl NativeCompiler {
    pub fn new(workspace: Arc<RunWorkspace>) -> Self {
        NativeCompiler { workspace }
    }
}

fn spawn_error(compiler: &str, err: io::Error) -> CompileError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            CompileError::ToolchainUnavailable {
                compiler: compiler.to_string(),
                msg: err.to_string(),
            }
        }
        _ => CompileError::Internal {
            msg: format!("failed to start {}: {}", compiler, err),
        },
    }
}

fn internal(err: io::Error) -> CompileError {
    CompileError::Internal {
        msg: err.to_string(),
    }
}

#[async_trait::async_trait]
impl Compiler for NativeCompiler {
    #[tracing::instrument(skip(self))]
    async fn probe(&self, compiler: &str) -> Result<String, CompileError> {
        let mut cmd = Command::new(compiler);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = process::spawn(&mut cmd)
            .await
            .map_err(|err| spawn_error(compiler, err))?;
        let output = tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| CompileError::ToolchainUnavailable {
                compiler: compiler.to_string(),
                msg: format!("--version did not finish within {:?}", PROBE_TIMEOUT),
            })?
            .map_err(internal)?;

        if !output.status.success() {
            return Err(CompileError::ToolchainUnavailable {
                compiler: compiler.to_string(),
                msg: format!(
                    "--version exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    #[tracing::instrument(skip(self, case, config), fields(case = %case.id, config = %config.name))]
    async fn compile(
        &self,
        case: &TestCase,
        config: &BuildConfig,
        limits: &CompilationLimits,
    ) -> Result<Artifact, CompileError> {
        let dir = self
            .workspace
            .prepare_unit(&case.id, config)
            .await
            .map_err(internal)?;
        let output_path = dir.join(ARTIFACT_NAME);
        match tokio::fs::remove_file(&output_path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(internal(err)),
            _ => {}
        }

        let mut cmd = Command::new(&config.compiler);
        cmd.args(&config.flags)
            .arg(&case.source)
            .arg("-o")
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        process::confine(&mut cmd, ResourceLimits::default());

        tracing::debug!("Start compilation: {:?}", cmd.as_std());
        let mut child = process::spawn(&mut cmd)
            .await
            .map_err(|err| spawn_error(&config.compiler, err))?;
        let group = ProcessGroup::of(&child);

        let cap = limits.diagnostics_limit_bytes;
        let stdout = child
            .stdout
            .take()
            .map(|pipe| Capture::spawn(pipe, cap))
            .ok_or_else(|| CompileError::Internal {
                msg: "compiler stdout not captured".to_string(),
            })?;
        let stderr = child
            .stderr
            .take()
            .map(|pipe| Capture::spawn(pipe, cap))
            .ok_or_else(|| CompileError::Internal {
                msg: "compiler stderr not captured".to_string(),
            })?;

        let deadline = Duration::from_millis(limits.time_ms);
        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(status) => status.map_err(internal)?,
            Err(_) => {
                tracing::debug!("Compiler exceeded {} ms, terminating", limits.time_ms);
                process::terminate(&mut child, &group, KILL_GRACE)
                    .await
                    .map_err(internal)?;
                return Err(CompileError::TimedOut {
                    time_ms: limits.time_ms,
                });
            }
        };
        group.sweep();

        let (err_bytes, err_truncated) = stderr.finish(KILL_GRACE).await.map_err(internal)?;
        let (out_bytes, out_truncated) = stdout.finish(KILL_GRACE).await.map_err(internal)?;
        let mut diagnostics = String::from_utf8_lossy(&err_bytes).into_owned();
        if !out_bytes.is_empty() {
            diagnostics.push_str(&String::from_utf8_lossy(&out_bytes));
        }
        if err_truncated || out_truncated {
            diagnostics.push_str(TRUNCATION_MARKER);
        }

        if !status.success() {
            tracing::debug!("Compiler exited with {}", status);
            return Err(CompileError::CompilationFailed { diagnostics });
        }

        if !tokio::fs::try_exists(&output_path).await.map_err(internal)? {
            return Err(CompileError::CompilationFailed {
                diagnostics: format!(
                    "compiler exited successfully without producing {}\n{}",
                    output_path.display(),
                    diagnostics
                ),
            });
        }

        Ok(Artifact {
            case_id: case.id.clone(),
            config_id: config.name.clone(),
            path: output_path,
        })
    }
}
