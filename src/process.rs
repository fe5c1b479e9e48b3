//! Child Process Handle
//!
//! Owns one external child process. The child is placed in a fresh process
//! group at spawn time so termination can signal the whole subtree (ssh and
//! dnstt-client both fork helpers). The handle is the unique owner of the OS
//! process; `terminate` consumes it, so a group can never be signalled twice.

use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Bound on how much buffered stderr a snapshot drains
const STDERR_SNAPSHOT_LIMIT: u64 = 4096;
const STDERR_SNAPSHOT_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

/// Handle to a supervised child process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Child,
    stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    /// Spawn `argv` with piped stdout/stderr in its own process group.
    pub fn spawn(argv: &[String]) -> Result<Self, ProcessError> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        // The child becomes a session/group leader; terminate() signals the
        // whole group.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                return Err(ProcessError::Spawn {
                    program: program.clone(),
                    source: std::io::Error::other("child exited before its pid could be read"),
                })
            }
        };
        let stderr = child.stderr.take();

        Ok(Self { pid, child, stderr })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True while the child has not been observed to exit.
    pub fn alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                debug!("try_wait failed for pid {}: {}", self.pid, e);
                false
            }
        }
    }

    /// SIGTERM the process group, wait up to the grace period, then SIGKILL
    /// the group and wait unconditionally. A group that is already gone is
    /// treated as success.
    pub async fn terminate(mut self) {
        let pgid = Pid::from_raw(self.pid as i32);
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                // Already gone; just reap.
                let _ = self.child.wait().await;
                return;
            }
            Err(e) => warn!("SIGTERM to process group {} failed: {}", self.pid, e),
        }

        match tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("pid {} exited: {}", self.pid, status);
                return;
            }
            Ok(Err(e)) => {
                warn!("wait for pid {} failed: {}", self.pid, e);
                return;
            }
            Err(_) => {}
        }

        warn!(
            "pid {} still alive after {:?}, sending SIGKILL to its group",
            self.pid, TERM_GRACE
        );
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            if e != Errno::ESRCH {
                warn!("SIGKILL to process group {} failed: {}", self.pid, e);
            }
        }
        if let Err(e) = self.child.wait().await {
            warn!("wait after SIGKILL for pid {} failed: {}", self.pid, e);
        }
    }

    /// Drain whatever stderr the child has produced so far, bounded in both
    /// size and time. Used for diagnostics when a child dies during settle.
    pub async fn stderr_snapshot(&mut self) -> String {
        let Some(stderr) = self.stderr.as_mut() else {
            return String::new();
        };
        let mut buf = Vec::new();
        let mut limited = stderr.take(STDERR_SNAPSHOT_LIMIT);
        let _ = tokio::time::timeout(STDERR_SNAPSHOT_TIMEOUT, limited.read_to_end(&mut buf)).await;
        String::from_utf8_lossy(&buf).trim_end().to_string()
    }
}
