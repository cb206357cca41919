use std::{io, process::ExitStatus, time::Duration};

use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::oneshot,
    task::JoinHandle,
};

const SPAWN_ATTEMPTS: u32 = 5;
const SPAWN_BACKOFF: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 8 * 1024;

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

/// Kernel-enforced ceilings applied in the child between fork and exec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_seconds: Option<u64>,
    pub address_space_bytes: Option<u64>,
}

/// Puts the spawned process into a fresh process group with core dumps
/// disabled and the given resource limits.
pub fn confine(cmd: &mut Command, limits: ResourceLimits) {
    cmd.process_group(0);
    // SAFETY: only async-signal-safe calls (setrlimit) run in the child.
    unsafe {
        cmd.pre_exec(move || apply_rlimits(&limits));
    }
}

fn apply_rlimits(limits: &ResourceLimits) -> io::Result<()> {
    set_rlimit(libc::RLIMIT_CORE, 0)?;
    if let Some(seconds) = limits.cpu_seconds {
        set_rlimit(libc::RLIMIT_CPU, seconds)?;
    }
    if let Some(bytes) = limits.address_space_bytes {
        set_rlimit(libc::RLIMIT_AS, bytes)?;
    }
    Ok(())
}

fn set_rlimit(resource: Resource, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialised rlimit.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Spawns `cmd`, retrying while the executable is still held open for
/// writing by a concurrently forked process.
pub async fn spawn(cmd: &mut Command) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        match cmd.spawn() {
            Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                tracing::debug!(attempt, "Executable busy, retrying spawn");
                attempt += 1;
                tokio::time::sleep(SPAWN_BACKOFF * attempt).await;
            }
            result => return result,
        }
    }
}

/// Handle on the process group led by a spawned child. Dropping it kills
/// every process still in the group.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Option<libc::pid_t>,
}

impl ProcessGroup {
    /// Must be called on a child spawned through [`confine`], whose pid is
    /// also its group id.
    pub fn of(child: &Child) -> Self {
        ProcessGroup {
            pgid: child.id().map(|pid| pid as libc::pid_t),
        }
    }

    pub fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        // SAFETY: plain syscall on a group id we created.
        if unsafe { libc::killpg(pgid, signal) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Kills whatever is left in the group (orphaned grandchildren).
    pub fn sweep(&self) {
        if let Err(err) = self.signal(libc::SIGKILL) {
            tracing::warn!(pgid = ?self.pgid, "Failed to sweep process group: {}", err);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.sweep();
    }
}

/// Sends SIGTERM to the group, waits `grace`, then SIGKILLs it. Returns the
/// child's status and whether SIGKILL was needed.
pub async fn terminate(
    child: &mut Child,
    group: &ProcessGroup,
    grace: Duration,
) -> io::Result<(ExitStatus, bool)> {
    group.signal(libc::SIGTERM)?;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            group.sweep();
            Ok((status?, false))
        }
        Err(_) => {
            group.signal(libc::SIGKILL)?;
            Ok((child.wait().await?, true))
        }
    }
}

pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGSYS => "SIGSYS",
        other => return format!("signal {}", other),
    };
    name.to_string()
}

/// Background reader that keeps at most `cap` bytes of a pipe and discards
/// the rest, so the writer never blocks on a full pipe.
#[derive(Debug)]
pub struct Capture {
    handle: JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stop: oneshot::Sender<()>,
}

impl Capture {
    pub fn spawn<R>(reader: R, cap: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (stop, stopped) = oneshot::channel();
        Capture {
            handle: tokio::spawn(read_to_end_capped(reader, cap, stopped)),
            stop,
        }
    }

    /// Waits up to `grace` for EOF, then keeps whatever was read so far.
    /// Returns the captured bytes and whether the cap was exceeded.
    pub async fn finish(self, grace: Duration) -> io::Result<(Vec<u8>, bool)> {
        let Capture { mut handle, stop } = self;
        let joined = match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::debug!("Pipe still open after exit, abandoning reader");
                let _ = stop.send(());
                handle.await
            }
        };
        joined.map_err(io::Error::other)?
    }
}

async fn read_to_end_capped<R>(
    mut reader: R,
    cap: usize,
    mut stopped: oneshot::Receiver<()>,
) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut truncated = false;

    loop {
        let n = tokio::select! {
            biased;
            _ = &mut stopped => {
                // Keep what is already sitting in the pipe.
                while let Some(n) = reader.read(&mut chunk).now_or_never() {
                    let n = n?;
                    if n == 0 {
                        break;
                    }
                    keep(&mut buf, &chunk[..n], cap, &mut truncated);
                }
                break;
            }
            n = reader.read(&mut chunk) => n?,
        };
        if n == 0 {
            break;
        }
        keep(&mut buf, &chunk[..n], cap, &mut truncated);
    }

    Ok((buf, truncated))
}

fn keep(buf: &mut Vec<u8>, data: &[u8], cap: usize, truncated: &mut bool) {
    if *truncated {
        return;
    }
    let room = cap.saturating_sub(buf.len());
    if data.len() > room {
        buf.extend_from_slice(&data[..room]);
        *truncated = true;
    } else {
        buf.extend_from_slice(data);
    }
}
