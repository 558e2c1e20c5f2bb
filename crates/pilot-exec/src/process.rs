use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::group::ProcessGroup;
use crate::{ExecError, Result};

const READ_CHUNK: usize = 8 * 1024;
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ProcessId
// ---------------------------------------------------------------------------

/// Local identifier of a spawned process, unrelated to the OS pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProcessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Output plumbing
// ---------------------------------------------------------------------------

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Turns a byte stream into text without splitting multi-byte characters
/// across reads. Invalid sequences become U+FFFD.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8], out: &mut String) {
        self.pending.extend_from_slice(bytes);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        // Incomplete character at the end; wait for more.
                        None => {
                            self.pending.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }
}

fn spawn_reader<R>(mut reader: R, tx: mpsc::UnboundedSender<Chunk>, wrap: fn(Vec<u8>) -> Chunk)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    });
}

/// Exit code of a finished process: the real code, `-N` for a Unix process
/// killed by signal N, `-1` when the platform reports neither.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.process_group(0);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    cmd
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

/// One spawned shell command and the process tree under it.
///
/// Output is pumped off the pipes by background tasks as soon as it is
/// written; [`read_output`](Self::read_output) moves whatever has arrived into
/// the accumulators without waiting for the process.
pub struct ProcessHandle {
    id: ProcessId,
    pid: Option<u32>,
    command: String,
    cwd: PathBuf,
    env: HashMap<String, String>,
    started_at: DateTime<Utc>,
    child: Child,
    group: Option<ProcessGroup>,
    stdin: Option<ChildStdin>,
    output_rx: mpsc::UnboundedReceiver<Chunk>,
    stdout_decoder: Utf8Decoder,
    stderr_decoder: Utf8Decoder,
    output_closed: bool,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    terminate_grace: Duration,
}

impl ProcessHandle {
    /// Spawn `command` through the platform shell as the leader of a new
    /// process group.
    ///
    /// `env` is applied on top of the inherited environment. Background
    /// processes get a closed stdin; foreground ones keep a pipe open, see
    /// [`stdin`](Self::stdin).
    #[instrument(skip(cwd, env), fields(cwd = %cwd.display()))]
    pub fn start(
        command: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        background: bool,
    ) -> Result<Self> {
        let mut cmd = shell_command(command);
        cmd.current_dir(cwd)
            .envs(env)
            .stdin(if background {
                Stdio::null()
            } else {
                Stdio::piped()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            source,
        })?;

        let pid = child.id();
        let (tx, output_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone(), Chunk::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx, Chunk::Stderr);
        }
        let stdin = child.stdin.take();

        let id = ProcessId::new();
        debug!(%id, ?pid, background, "process started");
        Ok(Self {
            id,
            pid,
            command: command.to_string(),
            cwd: cwd.to_path_buf(),
            env: env.clone(),
            started_at: Utc::now(),
            child,
            group: pid.map(ProcessGroup::new),
            stdin,
            output_rx,
            stdout_decoder: Utf8Decoder::default(),
            stderr_decoder: Utf8Decoder::default(),
            output_closed: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// OS pid, also the process group id on Unix.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Everything read from stdout so far.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Everything read from stderr so far.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Exit code, once the process has been seen to exit.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// `true` once both pipes have reached end of file.
    pub fn output_closed(&self) -> bool {
        self.output_closed
    }

    /// Open stdin of a foreground process.
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// How long [`terminate`](Self::terminate) waits for the tree to die.
    pub fn set_terminate_grace(&mut self, grace: Duration) {
        self.terminate_grace = grace;
    }

    fn accept(&mut self, chunk: Chunk, out: &mut String, err: &mut String) {
        match chunk {
            Chunk::Stdout(bytes) => self.stdout_decoder.push(&bytes, out),
            Chunk::Stderr(bytes) => self.stderr_decoder.push(&bytes, err),
        }
    }

    fn close_output(&mut self, out: &mut String, err: &mut String) {
        self.stdout_decoder.finish(out);
        self.stderr_decoder.finish(err);
        self.output_closed = true;
    }

    /// Drain output that has arrived since the last call, waiting at most
    /// `timeout` for the first chunk. Returns the new `(stdout, stderr)`
    /// text, which is also appended to the accumulators.
    pub async fn read_output(&mut self, timeout: Duration) -> (String, String) {
        let mut out = String::new();
        let mut err = String::new();
        if self.output_closed {
            return (out, err);
        }

        match tokio::time::timeout(timeout, self.output_rx.recv()).await {
            Ok(Some(chunk)) => self.accept(chunk, &mut out, &mut err),
            Ok(None) => self.close_output(&mut out, &mut err),
            Err(_) => {}
        }
        while !self.output_closed {
            match self.output_rx.try_recv() {
                Ok(chunk) => self.accept(chunk, &mut out, &mut err),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.close_output(&mut out, &mut err),
            }
        }

        self.stdout.push_str(&out);
        self.stderr.push_str(&err);
        (out, err)
    }

    /// Keep draining until both pipes close or `limit` elapses. Used after
    /// exit so output written just before it is not lost.
    pub async fn finish_output(&mut self, limit: Duration) -> (String, String) {
        let deadline = Instant::now() + limit;
        let mut out = String::new();
        let mut err = String::new();
        while !self.output_closed {
            let now = Instant::now();
            if now >= deadline {
                debug!(id = %self.id, "output still open after exit, giving up on the rest");
                break;
            }
            let (o, e) = self.read_output(deadline - now).await;
            out.push_str(&o);
            err.push_str(&e);
        }
        (out, err)
    }

    fn record_exit(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code(status);
        if self.exit_code.is_none() {
            debug!(id = %self.id, code, "process exited");
        }
        self.exit_code = Some(code);
        code
    }

    /// Liveness of the direct child, checked with the OS on every call. A
    /// process the OS no longer knows about counts as not running.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                debug!(id = %self.id, error = %e, "liveness check failed, treating as exited");
                false
            }
        }
    }

    /// Wait up to `timeout` for the process to exit. If it is still running
    /// afterwards the whole tree is killed and the resulting code returned.
    pub async fn wait(&mut self, timeout: Duration) -> Result<i32> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => Ok(self.record_exit(status?)),
            Err(_) => {
                debug!(id = %self.id, ?timeout, "wait timed out, killing process tree");
                self.terminate(true).await?;
                Ok(self.exit_code.unwrap_or(-1))
            }
        }
    }

    /// Signal the whole process tree and wait up to the termination grace
    /// period for it to go away. A graceful request that is ignored is
    /// followed by a kill. Terminating an exited process whose tree is empty
    /// is a no-op.
    #[instrument(skip(self), fields(id = %self.id, pid = ?self.pid))]
    pub async fn terminate(&mut self, force_kill: bool) -> Result<()> {
        self.stdin.take();
        if !self.has_tree().await {
            debug!("process tree already gone");
            return Ok(());
        }
        let grace = self.terminate_grace;

        self.signal(force_kill).await;
        let mut exited = self.reap_within(grace).await;

        let group_alive = match self.group {
            Some(group) => group.is_alive().await,
            None => false,
        };
        if !force_kill && (!exited || group_alive) {
            debug!("graceful termination ignored, killing process tree");
            self.signal(true).await;
            exited = self.reap_within(grace).await;
        }
        if !exited {
            warn!("process did not exit after being killed");
        }
        Ok(())
    }

    /// Whether anything is left to signal. An unreaped leader keeps the group
    /// id reserved; once it is reaped the id may be reused as soon as the
    /// group empties, so an empty group must not be signalled.
    async fn has_tree(&self) -> bool {
        if self.exit_code.is_none() {
            return true;
        }
        match self.group {
            Some(group) => group.is_alive().await,
            None => false,
        }
    }

    async fn signal(&mut self, force_kill: bool) {
        let result = match self.group {
            Some(group) => group.terminate(force_kill).await,
            None => self.child.start_kill(),
        };
        if let Err(e) = result {
            warn!(error = %e, force_kill, "failed to signal process tree");
        }
    }

    async fn reap_within(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.record_exit(status);
                true
            }
            Ok(Err(e)) => {
                debug!(error = %e, "wait after signal failed");
                true
            }
            Err(_) => false,
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let Some(group) = self.group else {
            return;
        };
        if self.exit_code.is_none() {
            debug!(id = %self.id, "handle dropped before exit, killing process tree");
        }
        group.kill_detached(self.exit_code.is_some());
    }
}
