//! External process supervision.
//!
//! Every managed process runs in its own process group so that termination
//! reaches any helpers it forks. Termination is SIGTERM to the group, a grace
//! period, then SIGKILL to the group; the child is always reaped.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};

/// Program, arguments and working directory of a managed process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map_or_else(|| self.program.to_string_lossy().to_string(), |n| n.to_string_lossy().to_string())
    }

    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }
}

/// How a process ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited before we signalled it
    AlreadyExited,
    /// It exited within the grace period after SIGTERM
    Graceful,
    /// It had to be SIGKILLed
    Forced,
}

/// A spawned child process that is its own process group leader.
pub struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
    name: String,
}

impl ManagedProcess {
    /// Spawn the process with stdin closed, stdout discarded and stderr
    /// forwarded to the log.
    pub fn spawn(spec: &ProcessSpec) -> StreamResult<Self> {
        let name = spec.program_name();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            StreamError::ProcessDied(format!("failed to spawn {name}: {e}"))
        })?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            let log_name = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(process = %log_name, pid = ?pid, "{}", line);
                }
            });
        }

        info!(process = %name, pid = ?pid, "Spawned managed process");
        Ok(Self { child, pid, name })
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> StreamResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Stop the whole process group and reap the child.
    pub async fn terminate(&mut self, grace: Duration) -> StreamResult<Termination> {
        if self.child.try_wait()?.is_some() {
            return Ok(Termination::AlreadyExited);
        }

        let Some(pgid) = self.pgid() else {
            // no pid means the child was already reaped
            self.child.wait().await?;
            return Ok(Termination::AlreadyExited);
        };

        signal_group(pgid, Signal::SIGTERM);

        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        let outcome = if let Ok(status) = waited {
            let status = status?;
            debug!(process = %self.name, pid = ?self.pid, %status, "Process exited after SIGTERM");
            Termination::Graceful
        } else {
            warn!(
                process = %self.name,
                pid = ?self.pid,
                "Process ignored SIGTERM for {:?}, sending SIGKILL",
                grace
            );
            signal_group(pgid, Signal::SIGKILL);
            if let Err(e) = self.child.start_kill() {
                debug!(process = %self.name, "start_kill after SIGKILL: {}", e);
            }
            self.child.wait().await?;
            Termination::Forced
        };

        // sweep group members that outlived the leader
        signal_group(pgid, Signal::SIGKILL);

        info!(process = %self.name, pid = ?self.pid, ?outcome, "Managed process terminated");
        Ok(outcome)
    }

    fn pgid(&self) -> Option<Pid> {
        self.pid
            .and_then(|pid| i32::try_from(pid).ok())
            .map(Pid::from_raw)
    }
}

fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pgid.as_raw(), ?signal, "Failed to signal process group: {}", e),
    }
}
