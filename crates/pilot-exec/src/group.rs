//! Whole-tree termination.
//!
//! Every spawned command leads its own process group (Unix) or console
//! process group (Windows), so the command and everything it forked can be
//! signalled as one unit. The platform mechanism is picked at compile time;
//! callers only see [`ProcessGroup::terminate`].

use std::io;

use tracing::debug;

/// The process tree rooted at one spawned command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    leader: u32,
}

impl ProcessGroup {
    /// Group led by `pid`. The process must have been spawned as a group
    /// leader (see `ProcessHandle::start`).
    pub fn new(leader: u32) -> Self {
        Self { leader }
    }

    pub fn leader(&self) -> u32 {
        self.leader
    }

    /// Signal every process in the group: a kill when `force_kill`, otherwise
    /// a graceful termination request. A group with no live members is not an
    /// error.
    pub async fn terminate(&self, force_kill: bool) -> io::Result<()> {
        debug!(leader = self.leader, force_kill, "terminating process group");
        imp::terminate(self.leader, force_kill).await
    }

    /// `true` while any member of the group still exists.
    pub async fn is_alive(&self) -> bool {
        imp::is_alive(self.leader).await
    }

    /// Kill the group without waiting, for use where nothing can be awaited.
    ///
    /// `leader_reaped` means the leader's exit status has already been
    /// collected, so its id is free for reuse once the group empties; the
    /// group is then only signalled while it still has members.
    pub fn kill_detached(&self, leader_reaped: bool) {
        imp::kill_detached(self.leader, leader_reaped);
    }
}

#[cfg(unix)]
mod imp {
    use std::io;

    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    fn pgid(leader: u32) -> io::Result<Pid> {
        i32::try_from(leader)
            .map(Pid::from_raw)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))
    }

    pub(super) async fn terminate(leader: u32, force_kill: bool) -> io::Result<()> {
        let signal = if force_kill {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        match killpg(pgid(leader)?, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn alive(pid: Pid) -> bool {
        // EPERM means the group exists but belongs to someone else.
        !matches!(killpg(pid, None), Err(Errno::ESRCH))
    }

    pub(super) async fn is_alive(leader: u32) -> bool {
        pgid(leader).is_ok_and(alive)
    }

    pub(super) fn kill_detached(leader: u32, leader_reaped: bool) {
        let Ok(pid) = pgid(leader) else {
            return;
        };
        if leader_reaped && !alive(pid) {
            return;
        }
        let _ = killpg(pid, Signal::SIGKILL);
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::process::Stdio;

    use tokio::process::Command;

    pub(super) async fn terminate(leader: u32, force_kill: bool) -> io::Result<()> {
        let mut cmd = Command::new("taskkill");
        cmd.arg("/T");
        if force_kill {
            cmd.arg("/F");
        }
        cmd.arg("/PID")
            .arg(leader.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // taskkill exits non-zero when the tree is already gone.
        cmd.status().await.map(|_| ())
    }

    pub(super) async fn is_alive(leader: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {leader}"), "/NH"])
            .output()
            .await
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&leader.to_string()))
            .unwrap_or(false)
    }

    // Without the leader, taskkill has no tree to walk.
    pub(super) fn kill_detached(leader: u32, leader_reaped: bool) {
        if leader_reaped {
            return;
        }
        let _ = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &leader.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}
