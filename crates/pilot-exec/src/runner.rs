//! Checkpointed command execution.
//!
//! [`CommandRunner::run`] is the one entry point agent logic uses to execute
//! a shell command. Work that the checkpoint history already holds at the
//! current position is replayed instead of re-run; everything else runs
//! through the supervisor and is recorded as the next command step.
//!
//! Asking the user for permission is the caller's business and has happened
//! before `run` is called.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pilot_core::checkpoint::CheckpointSession;
use pilot_core::config::ExecutionConfig;
use tracing::{debug, info, instrument};

use crate::supervisor::{CommandOutcome, ProcessSupervisor};
use crate::Result;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    /// Relative paths resolve against the supervisor root.
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Clamped into the configured bounds; `None` means the maximum.
    pub timeout: Option<Duration>,
    /// The caller skipped its confirmation prompt for this command.
    pub force_no_confirm: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            env: HashMap::new(),
            timeout: None,
            force_no_confirm: false,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn force_no_confirm(mut self, force: bool) -> Self {
        self.force_no_confirm = force;
        self
    }
}

pub struct CommandRunner {
    supervisor: Arc<ProcessSupervisor>,
    session: CheckpointSession,
    limits: ExecutionConfig,
}

impl CommandRunner {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        session: CheckpointSession,
        limits: ExecutionConfig,
    ) -> Self {
        Self {
            supervisor,
            session,
            limits,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn session(&self) -> &CheckpointSession {
        &self.session
    }

    /// The session, e.g. to record user answers or roll back between tries.
    pub fn session_mut(&mut self) -> &mut CheckpointSession {
        &mut self.session
    }

    pub fn into_session(self) -> CheckpointSession {
        self.session
    }

    /// Run a command, or replay its recorded result.
    ///
    /// Spawn failures are returned as errors and never recorded. Timeouts and
    /// non-zero exits are ordinary outcomes and are recorded like any other.
    #[instrument(skip_all, fields(command = %req.command))]
    pub async fn run(&mut self, req: CommandRequest) -> Result<CommandOutcome> {
        let timeout = self.limits.clamp_timeout(req.timeout);
        if req.force_no_confirm {
            debug!("running without confirmation");
        }

        if let Some((exit, stdout, stderr)) = self.session.replay_command(&req.command)? {
            info!(?exit, "replayed command from checkpoint");
            return Ok(CommandOutcome {
                exit,
                stdout,
                stderr,
                replayed: true,
            });
        }

        let outcome = self
            .supervisor
            .run_command(&req.command, &req.cwd, &req.env, timeout, false)
            .await?;
        let stdout = truncate_output(&outcome.stdout, self.limits.max_output_bytes);
        let stderr = truncate_output(&outcome.stderr, self.limits.max_output_bytes);

        let cwd = self.supervisor.root().join(&req.cwd);
        let step = self.session.record_command(
            &req.command,
            &cwd.to_string_lossy(),
            outcome.exit,
            stdout.clone(),
            stderr.clone(),
        )?;
        debug!(%step, exit = ?outcome.exit, "recorded command step");

        Ok(CommandOutcome {
            exit: outcome.exit,
            stdout,
            stderr,
            replayed: false,
        })
    }
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Cut `text` down to about `max_bytes`, keeping the head and the tail
/// (where errors usually are) around a marker naming the dropped size.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let head_end = floor_boundary(text, max_bytes / 2);
    let tail_start = ceil_boundary(text, text.len() - (max_bytes - max_bytes / 2));
    format!(
        "{}\n... [{} bytes truncated] ...\n{}",
        &text[..head_end],
        tail_start - head_end,
        &text[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_untouched() {
        assert_eq!(truncate_output("ok\n", 10), "ok\n");
    }

    #[test]
    fn long_output_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(100), "b".repeat(100));
        let cut = truncate_output(&text, 20);
        assert!(cut.starts_with("aaaaaaaaaa\n"));
        assert!(cut.ends_with("\nbbbbbbbbbb"));
        assert!(cut.contains("[180 bytes truncated]"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "é".repeat(50);
        let cut = truncate_output(&text, 11);
        assert!(cut.starts_with("éé\n"));
        assert!(cut.ends_with("\nééé"));
        assert!(cut.contains("[90 bytes truncated]"));
    }
}
