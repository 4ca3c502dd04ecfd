//! Process-tree signalling
//!
//! Runners are spawned as process-group leaders, so signalling the negative
//! pid reaches every descendant. Platforms without process groups fall back
//! to `taskkill /T`.

use std::io;

/// Delivers terminate/kill to a runner and all of its descendants.
pub trait SubtreeSignaler: Send + Sync {
    /// Polite stop (SIGTERM on unix).
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forced stop (SIGKILL on unix).
    fn kill(&self, pid: u32) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessGroupSignaler;

#[cfg(unix)]
impl ProcessGroupSignaler {
    fn send(pid: u32, signal: libc::c_int) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

        // SAFETY: kill(2) has no memory-safety preconditions. A negative pid
        // addresses the process group led by `pid`.
        if unsafe { libc::kill(-pid, signal) } == 0 {
            return Ok(());
        }
        let group_err = io::Error::last_os_error();

        // Group already gone or never formed; try the leader alone.
        // SAFETY: as above, with a positive pid.
        if unsafe { libc::kill(pid, signal) } == 0 {
            return Ok(());
        }
        tracing::debug!(pid, signal, error = %group_err, "Group signal failed");
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
impl SubtreeSignaler for ProcessGroupSignaler {
    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, libc::SIGTERM)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, libc::SIGKILL)
    }
}

#[cfg(windows)]
impl ProcessGroupSignaler {
    fn taskkill(pid: u32, force: bool) -> io::Result<()> {
        let pid = pid.to_string();
        let mut args = vec!["/PID", pid.as_str(), "/T"];
        if force {
            args.push("/F");
        }
        let status = std::process::Command::new("taskkill").args(&args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}

#[cfg(windows)]
impl SubtreeSignaler for ProcessGroupSignaler {
    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, false)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::taskkill(pid, true)
    }
}
