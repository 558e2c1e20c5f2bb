//! Registry of background processes plus the watcher loop that drains them.
//!
//! The registry is owned by one [`ProcessSupervisor`] and only touched by its
//! methods and its watcher task, so independent supervisors never see each
//! other's processes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pilot_core::checkpoint::CommandExit;
use pilot_core::config::SupervisorConfig;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::process::{ProcessHandle, ProcessId};
use crate::{ExecError, Result};

/// Error type callbacks may return; it is logged and otherwise ignored.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Hooks invoked by the watcher loop for registered background processes.
///
/// A callback that errors or panics is logged and skipped; draining of the
/// other processes carries on.
pub trait ProcessObserver: Send + Sync {
    fn on_output(
        &self,
        _id: ProcessId,
        _stdout: &str,
        _stderr: &str,
    ) -> std::result::Result<(), ObserverError> {
        Ok(())
    }

    /// Called exactly once per process, the first time it is seen exited.
    fn on_exit(&self, _id: ProcessId, _exit_code: i32) -> std::result::Result<(), ObserverError> {
        Ok(())
    }
}

fn dispatch<F>(id: ProcessId, hook: &str, f: F)
where
    F: FnOnce() -> std::result::Result<(), ObserverError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%id, hook, error = %e, "process observer failed"),
        Err(_) => warn!(%id, hook, "process observer panicked"),
    }
}

/// Result of running a command to completion (or to its timeout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub exit: CommandExit,
    pub stdout: String,
    pub stderr: String,
    /// `true` when the outcome came from the checkpoint history instead of a
    /// live run.
    pub replayed: bool,
}

/// Point-in-time view of a registered process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub pid: Option<u32>,
    pub command: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    /// Exit has been observed by the watcher.
    pub complete: bool,
    pub stdout: String,
    pub stderr: String,
}

struct Tracked {
    handle: ProcessHandle,
    complete: bool,
    /// When the watcher first saw the leader gone.
    exited_at: Option<Instant>,
}

impl Tracked {
    fn snapshot(&self) -> ProcessSnapshot {
        let h = &self.handle;
        ProcessSnapshot {
            id: h.id(),
            pid: h.pid(),
            command: h.command().to_string(),
            cwd: h.cwd().to_path_buf(),
            started_at: h.started_at(),
            exit_code: h.exit_code(),
            complete: self.complete,
            stdout: h.stdout().to_string(),
            stderr: h.stderr().to_string(),
        }
    }
}

type Registry = Arc<Mutex<HashMap<ProcessId, Tracked>>>;

struct Watcher {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

pub struct ProcessSupervisor {
    root: PathBuf,
    default_env: HashMap<String, String>,
    config: SupervisorConfig,
    observer: Option<Arc<dyn ProcessObserver>>,
    registry: Registry,
    watcher: Mutex<Option<Watcher>>,
}

impl ProcessSupervisor {
    /// Supervisor resolving relative working directories against `root`.
    pub fn new(root: impl Into<PathBuf>, config: SupervisorConfig) -> Self {
        Self {
            root: root.into(),
            default_env: HashMap::new(),
            config,
            observer: None,
            registry: Arc::new(Mutex::new(HashMap::new())),
            watcher: Mutex::new(None),
        }
    }

    /// Variables set for every command unless the call overrides them.
    pub fn with_default_env(mut self, env: HashMap<String, String>) -> Self {
        self.default_env = env;
        self
    }

    /// Observer for background processes. Must be set before
    /// [`start_watcher`](Self::start_watcher).
    pub fn with_observer(mut self, observer: Arc<dyn ProcessObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn spawn(
        &self,
        command: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        background: bool,
    ) -> Result<ProcessHandle> {
        let cwd = self.root.join(cwd);
        let mut merged = self.default_env.clone();
        merged.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let mut handle = ProcessHandle::start(command, &cwd, &merged, background)?;
        handle.set_terminate_grace(self.config.terminate_grace());
        Ok(handle)
    }

    /// Start a foreground process. The caller owns the handle; it is not
    /// tracked by the registry or the watcher.
    pub fn start_process(
        &self,
        command: &str,
        cwd: impl AsRef<Path>,
        env: &HashMap<String, String>,
    ) -> Result<ProcessHandle> {
        self.spawn(command, cwd.as_ref(), env, false)
    }

    /// Start a background process and register it with the watcher.
    pub async fn start_background(
        &self,
        command: &str,
        cwd: impl AsRef<Path>,
        env: &HashMap<String, String>,
    ) -> Result<ProcessId> {
        let handle = self.spawn(command, cwd.as_ref(), env, true)?;
        let id = handle.id();
        info!(%id, command, "background process started");
        self.registry.lock().await.insert(
            id,
            Tracked {
                handle,
                complete: false,
                exited_at: None,
            },
        );
        Ok(id)
    }

    /// Run `command` until it exits or `timeout` elapses.
    ///
    /// On timeout the process tree is killed before returning and the exit is
    /// [`CommandExit::TimedOut`]; output captured up to then is kept. With
    /// `show_output`, output is logged as it arrives.
    #[instrument(skip(self, cwd, env), fields(cwd = %cwd.as_ref().display()))]
    pub async fn run_command(
        &self,
        command: &str,
        cwd: impl AsRef<Path>,
        env: &HashMap<String, String>,
        timeout: Duration,
        show_output: bool,
    ) -> Result<CommandOutcome> {
        let mut handle = self.spawn(command, cwd.as_ref(), env, false)?;
        let deadline = Instant::now() + timeout;
        let read_timeout = self.config.read_timeout();

        let timed_out = loop {
            let (out, err) = handle.read_output(read_timeout).await;
            if show_output {
                echo(handle.id(), &out, &err);
            }
            if !handle.is_running() {
                break false;
            }
            if Instant::now() >= deadline {
                info!(id = %handle.id(), ?timeout, "command timed out, killing process tree");
                handle.terminate(true).await?;
                break true;
            }
            tokio::time::sleep(self.config.busy_interval()).await;
        };

        let (out, err) = handle.finish_output(self.config.terminate_grace()).await;
        if show_output {
            echo(handle.id(), &out, &err);
        }

        let exit = match (timed_out, handle.exit_code()) {
            (false, Some(code)) => CommandExit::Exited { code },
            (false, None) => CommandExit::Exited { code: -1 },
            (true, _) => CommandExit::TimedOut,
        };
        debug!(?exit, "command finished");
        Ok(CommandOutcome {
            exit,
            stdout: handle.stdout().to_string(),
            stderr: handle.stderr().to_string(),
            replayed: false,
        })
    }

    /// Registered processes that are still alive.
    pub async fn list_running_processes(&self) -> Vec<ProcessSnapshot> {
        let mut registry = self.registry.lock().await;
        let mut running: Vec<ProcessSnapshot> = registry
            .values_mut()
            .filter_map(|t| t.handle.is_running().then(|| t.snapshot()))
            .collect();
        running.sort_by_key(|s| s.started_at);
        running
    }

    /// Current state and accumulated output of a registered process, running
    /// or not.
    pub async fn process(&self, id: ProcessId) -> Result<ProcessSnapshot> {
        let registry = self.registry.lock().await;
        registry
            .get(&id)
            .map(Tracked::snapshot)
            .ok_or(ExecError::ProcessNotFound(id))
    }

    /// Terminate a registered process tree and forget it.
    pub async fn terminate_process(&self, id: ProcessId) -> Result<()> {
        let tracked = self.registry.lock().await.remove(&id);
        let Some(mut tracked) = tracked else {
            return Err(ExecError::ProcessNotFound(id));
        };
        info!(%id, "terminating process");
        tracked.handle.terminate(false).await
    }

    // -----------------------------------------------------------------------
    // Watcher loop
    // -----------------------------------------------------------------------

    /// Start the background watcher. Does nothing if it is already running.
    pub async fn start_watcher(&self) {
        let mut slot = self.watcher.lock().await;
        if slot.is_some() {
            return;
        }
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(watch_loop(
            Arc::clone(&self.registry),
            self.observer.clone(),
            self.config.clone(),
            stopped,
        ));
        *slot = Some(Watcher { stop, task });
        debug!("watcher started");
    }

    /// Stop the watcher and wait for it to finish. No polling happens after
    /// this returns.
    pub async fn stop_watcher(&self) {
        let watcher = self.watcher.lock().await.take();
        let Some(watcher) = watcher else {
            return;
        };
        let _ = watcher.stop.send(true);
        if let Err(e) = watcher.task.await {
            warn!(error = %e, "watcher task ended abnormally");
        }
        debug!("watcher stopped");
    }

    pub async fn watcher_running(&self) -> bool {
        self.watcher.lock().await.is_some()
    }

    /// Stop the watcher, then terminate and forget every registered process.
    pub async fn shutdown(&self) {
        self.stop_watcher().await;
        let drained: Vec<Tracked> = self.registry.lock().await.drain().map(|(_, t)| t).collect();
        info!(count = drained.len(), "shutting down supervisor");
        for mut tracked in drained {
            if let Err(e) = tracked.handle.terminate(false).await {
                warn!(id = %tracked.handle.id(), error = %e, "failed to terminate process");
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.task.abort();
        }
    }
}

fn echo(id: ProcessId, stdout: &str, stderr: &str) {
    for line in stdout.lines() {
        info!(%id, "{line}");
    }
    for line in stderr.lines() {
        warn!(%id, "{line}");
    }
}

async fn watch_loop(
    registry: Registry,
    observer: Option<Arc<dyn ProcessObserver>>,
    config: SupervisorConfig,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let pending = poll_once(&registry, observer.as_deref(), config.read_timeout() * 10).await;
        let interval = if pending > 0 {
            config.busy_interval()
        } else {
            config.idle_interval()
        };
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

/// Drain every process whose output is still open and detect exits.
/// Returns how many processes have not yet been reported exited.
///
/// Reads never wait, so the registry lock is only held for as long as it
/// takes to move already-buffered output. A process is reported exited once
/// its pipes close or `drain_grace` has passed since its leader went away;
/// descendants that keep writing after that are still drained into the
/// accumulators until the pipes close.
async fn poll_once(
    registry: &Mutex<HashMap<ProcessId, Tracked>>,
    observer: Option<&dyn ProcessObserver>,
    drain_grace: Duration,
) -> usize {
    let mut registry = registry.lock().await;
    let mut pending = 0;
    for (id, tracked) in registry.iter_mut() {
        let handle = &mut tracked.handle;
        if tracked.complete && handle.output_closed() {
            continue;
        }
        let (out, err) = handle.read_output(Duration::ZERO).await;
        notify_output(observer, *id, &out, &err);
        if tracked.complete {
            continue;
        }

        if handle.is_running() {
            pending += 1;
            continue;
        }
        let exited_at = *tracked.exited_at.get_or_insert_with(Instant::now);
        if !handle.output_closed() && exited_at.elapsed() < drain_grace {
            pending += 1;
            continue;
        }

        let code = handle.exit_code().unwrap_or(-1);
        tracked.complete = true;
        debug!(%id, code, "background process exited");
        if let Some(observer) = observer {
            dispatch(*id, "on_exit", || observer.on_exit(*id, code));
        }
    }
    pending
}

fn notify_output(observer: Option<&dyn ProcessObserver>, id: ProcessId, out: &str, err: &str) {
    if out.is_empty() && err.is_empty() {
        return;
    }
    if let Some(observer) = observer {
        dispatch(id, "on_output", || observer.on_output(id, out, err));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            read_timeout_ms: 10,
            busy_interval_ms: 20,
            idle_interval_ms: 50,
            terminate_grace_ms: 500,
        }
    }

    fn supervisor(dir: &TempDir) -> ProcessSupervisor {
        ProcessSupervisor::new(dir.path(), fast_config())
    }

    #[derive(Default)]
    struct Recorder {
        output: StdMutex<HashMap<ProcessId, String>>,
        exits: StdMutex<Vec<(ProcessId, i32)>>,
    }

    impl ProcessObserver for Recorder {
        fn on_output(&self, id: ProcessId, stdout: &str, _: &str) -> std::result::Result<(), ObserverError> {
            self.output.lock().unwrap().entry(id).or_default().push_str(stdout);
            Ok(())
        }

        fn on_exit(&self, id: ProcessId, code: i32) -> std::result::Result<(), ObserverError> {
            self.exits.lock().unwrap().push((id, code));
            Ok(())
        }
    }

    /// Panics on output from one process and errors on every exit.
    struct Faulty {
        victim: StdMutex<Option<ProcessId>>,
        inner: Recorder,
    }

    impl ProcessObserver for Faulty {
        fn on_output(&self, id: ProcessId, stdout: &str, stderr: &str) -> std::result::Result<(), ObserverError> {
            if *self.victim.lock().unwrap() == Some(id) {
                panic!("observer bug");
            }
            self.inner.on_output(id, stdout, stderr)
        }

        fn on_exit(&self, id: ProcessId, code: i32) -> std::result::Result<(), ObserverError> {
            self.inner.on_exit(id, code)?;
            Err("exit hook failed".into())
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn run_command_captures_output_and_code() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let outcome = sup
            .run_command("echo hello; echo oops >&2; exit 3", ".", &HashMap::new(), Duration::from_secs(5), false)
            .await
            .unwrap();
        assert_eq!(outcome.exit, CommandExit::Exited { code: 3 });
        assert_eq!(outcome.stdout, "hello\n");
        assert_eq!(outcome.stderr, "oops\n");
        assert!(!outcome.replayed);
    }

    #[tokio::test]
    async fn run_command_merges_env_over_defaults() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir).with_default_env(HashMap::from([
            ("A".to_string(), "default".to_string()),
            ("B".to_string(), "default".to_string()),
        ]));
        let env = HashMap::from([("B".to_string(), "override".to_string())]);
        let outcome = sup
            .run_command("echo $A $B", ".", &env, Duration::from_secs(5), true)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "default override\n");
    }

    #[tokio::test]
    async fn relative_cwd_resolves_against_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/marker.txt"), "found").unwrap();
        let sup = supervisor(&dir);
        let outcome = sup
            .run_command("cat marker.txt", "sub", &HashMap::new(), Duration::from_secs(5), false)
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "found");
    }

    #[tokio::test]
    async fn watcher_reports_exit_once_and_keeps_output() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(&dir).with_observer(recorder.clone());
        sup.start_watcher().await;

        let id = sup
            .start_background("echo background; exit 4", ".", &HashMap::new())
            .await
            .unwrap();
        wait_for(|| !recorder.exits.lock().unwrap().is_empty()).await;
        // Let a few more polls run; the exit must not be reported twice.
        tokio::time::sleep(Duration::from_millis(150)).await;
        sup.stop_watcher().await;

        assert_eq!(*recorder.exits.lock().unwrap(), vec![(id, 4)]);
        assert_eq!(recorder.output.lock().unwrap().get(&id).map(String::as_str), Some("background\n"));

        assert!(sup.list_running_processes().await.is_empty());
        let snapshot = sup.process(id).await.unwrap();
        assert!(snapshot.complete);
        assert_eq!(snapshot.exit_code, Some(4));
        assert_eq!(snapshot.stdout, "background\n");
    }

    #[tokio::test]
    async fn faulty_observer_does_not_stop_the_watcher() {
        let dir = TempDir::new().unwrap();
        let observer = Arc::new(Faulty {
            victim: StdMutex::new(None),
            inner: Recorder::default(),
        });
        let sup = supervisor(&dir).with_observer(observer.clone());

        let noisy = sup
            .start_background("echo crash-me; sleep 0.2", ".", &HashMap::new())
            .await
            .unwrap();
        *observer.victim.lock().unwrap() = Some(noisy);
        let quiet = sup
            .start_background("sleep 0.2; echo fine", ".", &HashMap::new())
            .await
            .unwrap();
        sup.start_watcher().await;

        wait_for(|| observer.inner.exits.lock().unwrap().len() == 2).await;
        sup.stop_watcher().await;

        let output = observer.inner.output.lock().unwrap();
        assert_eq!(output.get(&quiet).map(String::as_str), Some("fine\n"));
        assert!(!output.contains_key(&noisy));
    }

    #[tokio::test]
    async fn stop_watcher_is_awaited_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.stop_watcher().await;
        sup.start_watcher().await;
        sup.start_watcher().await;
        assert!(sup.watcher_running().await);
        sup.stop_watcher().await;
        assert!(!sup.watcher_running().await);
        sup.stop_watcher().await;
    }

    #[tokio::test]
    async fn list_running_and_terminate() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let id = sup.start_background("sleep 30", ".", &HashMap::new()).await.unwrap();

        let running = sup.list_running_processes().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, id);
        assert_eq!(running[0].command, "sleep 30");

        sup.terminate_process(id).await.unwrap();
        assert!(sup.list_running_processes().await.is_empty());
        assert!(matches!(
            sup.terminate_process(id).await,
            Err(ExecError::ProcessNotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn output_after_leader_exit_is_still_drained() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let sup = supervisor(&dir).with_observer(recorder.clone());
        sup.start_watcher().await;

        let id = sup
            .start_background("(sleep 0.3; echo late) & echo early", ".", &HashMap::new())
            .await
            .unwrap();
        wait_for(|| {
            recorder.output.lock().unwrap().get(&id).is_some_and(|out| out.contains("late"))
        })
        .await;
        sup.stop_watcher().await;

        assert_eq!(*recorder.exits.lock().unwrap(), vec![(id, 0)]);
        let snapshot = sup.process(id).await.unwrap();
        assert!(snapshot.complete);
        assert_eq!(snapshot.stdout, "early\nlate\n");
    }

    #[tokio::test]
    async fn watcher_does_not_hold_registry_while_waiting_for_output() {
        let dir = TempDir::new().unwrap();
        let config = SupervisorConfig {
            read_timeout_ms: 200,
            ..fast_config()
        };
        let sup = ProcessSupervisor::new(dir.path(), config);
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(sup.start_background("sleep 30", ".", &HashMap::new()).await.unwrap());
        }
        sup.start_watcher().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        for id in &ids {
            let started = Instant::now();
            sup.process(*id).await.unwrap();
            assert!(started.elapsed() < Duration::from_millis(150));
        }
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_clears_registry() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.start_watcher().await;
        let a = sup.start_background("sleep 30", ".", &HashMap::new()).await.unwrap();
        let b = sup.start_background("sleep 30", ".", &HashMap::new()).await.unwrap();

        sup.shutdown().await;
        assert!(!sup.watcher_running().await);
        assert!(sup.list_running_processes().await.is_empty());
        assert!(sup.process(a).await.is_err());
        assert!(sup.process(b).await.is_err());
    }
}
