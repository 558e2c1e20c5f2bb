/// End-to-end scenarios: real `sh` processes, a real checkpoint database and
/// the retry loop driving both.
#[cfg(unix)]
mod scenarios {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use pilot_core::checkpoint::{CheckpointSession, CheckpointStore, CommandExit, StreamTag};
    use pilot_core::config::{Config, ExecutionConfig};
    use pilot_core::conversation::{ConversationBranch, Role};
    use pilot_core::retry::{Attempt, AttemptOutcome, RetryContext, RetryLoop};
    use pilot_core::PilotError;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    use crate::{CommandRequest, CommandRunner, ExecError, ProcessSupervisor};

    fn open_store(dir: &TempDir) -> Arc<CheckpointStore> {
        let path = Config::default().checkpoint_db_path(dir.path()).unwrap();
        Arc::new(CheckpointStore::open(&path).unwrap())
    }

    fn supervisor(dir: &TempDir) -> Arc<ProcessSupervisor> {
        let mut config = Config::default().supervisor;
        config.busy_interval_ms = 20;
        config.terminate_grace_ms = 500;
        Arc::new(ProcessSupervisor::new(dir.path(), config))
    }

    fn runner(dir: &TempDir, store: Arc<CheckpointStore>, limits: ExecutionConfig) -> CommandRunner {
        CommandRunner::new(
            supervisor(dir),
            CheckpointSession::new(store, "app", true),
            limits,
        )
    }

    fn short_limits() -> ExecutionConfig {
        ExecutionConfig {
            min_timeout_ms: 50,
            max_timeout_ms: 2_000,
            max_output_bytes: 50_000,
        }
    }

    /// Gone, or a zombie waiting for its new parent to reap it.
    #[cfg(target_os = "linux")]
    fn pid_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
        }
    }

    #[cfg(target_os = "linux")]
    async fn assert_gone_soon(pid: u32) {
        for _ in 0..100 {
            if pid_gone(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {pid} still running");
    }

    #[tokio::test]
    async fn echo_hello() {
        let dir = TempDir::new().unwrap();
        let outcome = supervisor(&dir)
            .run_command("echo hello", ".", &HashMap::new(), Duration::from_millis(5_000), false)
            .await
            .unwrap();
        assert_eq!(outcome.exit, CommandExit::Exited { code: 0 });
        assert!(outcome.stdout.contains("hello"));
        assert_eq!(outcome.stderr, "");
    }

    #[tokio::test]
    async fn sleep_past_timeout_is_killed() {
        let dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();
        let outcome = supervisor(&dir)
            .run_command("echo $$; exec sleep 5", ".", &HashMap::new(), Duration::from_millis(100), false)
            .await
            .unwrap();
        assert_eq!(outcome.exit, CommandExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));

        #[cfg(target_os = "linux")]
        {
            let pid: u32 = outcome.stdout.trim().parse().unwrap();
            assert!(pid_gone(pid));
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_descendants() {
        let dir = TempDir::new().unwrap();
        let outcome = supervisor(&dir)
            .run_command("sleep 30 & echo $!; wait", ".", &HashMap::new(), Duration::from_millis(300), false)
            .await
            .unwrap();
        assert_eq!(outcome.exit, CommandExit::TimedOut);
        let child: u32 = outcome.stdout.trim().parse().unwrap();
        assert_gone_soon(child).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_process_kills_descendants() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let id = sup
            .start_background("sleep 30 & echo $!; wait", ".", &HashMap::new())
            .await
            .unwrap();

        sup.start_watcher().await;
        let mut child = String::new();
        for _ in 0..250 {
            child = sup.process(id).await.unwrap().stdout;
            if child.ends_with('\n') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sup.stop_watcher().await;

        sup.terminate_process(id).await.unwrap();
        assert_gone_soon(child.trim().parse().unwrap()).await;
    }

    #[cfg(target_os = "linux")]
    async fn read_pid_file(path: &std::path::Path) -> u32 {
        for _ in 0..250 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancelled_run_command_kills_descendants() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let cancelled = tokio::time::timeout(
            Duration::from_millis(500),
            sup.run_command(
                "sleep 30 & echo $! > child.pid; wait",
                ".",
                &HashMap::new(),
                Duration::from_secs(10),
                false,
            ),
        )
        .await;
        assert!(cancelled.is_err());

        let child = read_pid_file(&dir.path().join("child.pid")).await;
        assert_gone_soon(child).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_supervisor_kills_background_trees() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        sup.start_background("sleep 30 & echo $! > child.pid; wait", ".", &HashMap::new())
            .await
            .unwrap();
        let child = read_pid_file(&dir.path().join("child.pid")).await;

        drop(sup);
        assert_gone_soon(child).await;
    }

    #[tokio::test]
    async fn terminate_twice_is_not_found() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let id = sup
            .start_background("sleep 30", ".", &HashMap::new())
            .await
            .unwrap();
        sup.terminate_process(id).await.unwrap();
        let err = sup.terminate_process(id).await.unwrap_err();
        assert!(matches!(err, ExecError::ProcessNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn foreground_handle_keeps_stdin_open() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let mut handle = sup
            .start_process("read line; echo got $line", ".", &HashMap::new())
            .unwrap();
        let stdin = handle.stdin().unwrap();
        stdin.write_all(b"yes\n").await.unwrap();
        stdin.flush().await.unwrap();

        assert_eq!(handle.wait(Duration::from_secs(5)).await.unwrap(), 0);
        handle.finish_output(Duration::from_secs(1)).await;
        assert_eq!(handle.stdout(), "got yes\n");
        assert!(sup.list_running_processes().await.is_empty());
    }

    #[tokio::test]
    async fn foreground_wait_timeout_leaves_nothing_running() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir);
        let mut handle = sup.start_process("sleep 5", ".", &HashMap::new()).unwrap();
        handle.wait(Duration::from_millis(100)).await.unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn runner_replays_instead_of_rerunning() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let count = "echo run >> runs.txt; wc -l < runs.txt";

        let mut first = runner(&dir, store.clone(), short_limits());
        let live = first.run(CommandRequest::new(count, ".")).await.unwrap();
        assert!(!live.replayed);
        assert_eq!(live.stdout.trim(), "1");

        let mut resumed = runner(&dir, store.clone(), short_limits());
        let replayed = resumed.run(CommandRequest::new(count, ".")).await.unwrap();
        assert!(replayed.replayed);
        assert_eq!(replayed.stdout, live.stdout);
        assert_eq!(replayed.exit, live.exit);

        // Past the recorded history the command runs for real again.
        let again = resumed.run(CommandRequest::new(count, ".")).await.unwrap();
        assert!(!again.replayed);
        assert_eq!(again.stdout.trim(), "2");

        let runs = std::fs::read_to_string(dir.path().join("runs.txt")).unwrap();
        assert_eq!(runs.lines().count(), 2);
        assert_eq!(store.list_stream("app", StreamTag::Command).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn runner_records_timeouts_and_replays_them() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let req = || CommandRequest::new("sleep 5", ".").timeout(Duration::from_millis(100));

        let mut first = runner(&dir, store.clone(), short_limits());
        assert_eq!(first.run(req()).await.unwrap().exit, CommandExit::TimedOut);

        let mut resumed = runner(&dir, store, short_limits());
        let replayed = resumed.run(req()).await.unwrap();
        assert!(replayed.replayed);
        assert_eq!(replayed.exit, CommandExit::TimedOut);
    }

    #[tokio::test]
    async fn runner_clamps_short_timeouts_up() {
        let dir = TempDir::new().unwrap();
        let limits = ExecutionConfig {
            min_timeout_ms: 2_000,
            ..short_limits()
        };
        let mut runner = runner(&dir, open_store(&dir), limits);
        let outcome = runner
            .run(
                CommandRequest::new("sleep 0.3; echo done", ".")
                    .timeout(Duration::from_millis(10))
                    .force_no_confirm(true),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit, CommandExit::Exited { code: 0 });
        assert_eq!(outcome.stdout, "done\n");
    }

    #[tokio::test]
    async fn runner_truncates_recorded_output() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let limits = ExecutionConfig {
            max_output_bytes: 100,
            ..short_limits()
        };
        let mut runner = runner(&dir, store.clone(), limits);
        let outcome = runner
            .run(CommandRequest::new("seq 1 1000", "."))
            .await
            .unwrap();
        assert!(outcome.stdout.starts_with("1\n2\n"));
        assert!(outcome.stdout.ends_with("999\n1000\n"));
        assert!(outcome.stdout.contains("bytes truncated"));

        let steps = store.list_stream("app", StreamTag::Command).unwrap();
        let pilot_core::checkpoint::StepPayload::CommandResult { stdout, .. } = &steps[0].payload
        else {
            panic!("expected a command step");
        };
        assert_eq!(stdout, &outcome.stdout);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_and_not_recorded() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let mut runner = runner(&dir, store.clone(), short_limits());
        let err = runner
            .run(CommandRequest::new("true", "missing-dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
        assert!(store.list_stream("app", StreamTag::Command).unwrap().is_empty());
    }

    // -----------------------------------------------------------------------
    // Retry loop driving real commands
    // -----------------------------------------------------------------------

    /// Checks for `fixed.txt`; each failed check "repairs" one more step.
    struct FixMissingFile<'r> {
        runner: &'r mut CommandRunner,
        root: PathBuf,
        repairs_needed: u32,
        calls: u32,
    }

    impl Attempt for FixMissingFile<'_> {
        type Error = ExecError;

        async fn attempt(&mut self, ctx: &mut RetryContext<'_>) -> Result<AttemptOutcome, ExecError> {
            self.calls += 1;
            let check = self
                .runner
                .run(CommandRequest::new("test -f fixed.txt || { echo missing >&2; exit 1; }", "."))
                .await?;
            if check.exit.success() {
                return Ok(AttemptOutcome::Resolved);
            }

            ctx.conversation
                .append_message(Role::Assistant, format!("attempt {}: {}", ctx.attempt(), check.stderr));
            if self.calls >= self.repairs_needed {
                std::fs::write(self.root.join("fixed.txt"), "ok").map_err(ExecError::Io)?;
            }
            Ok(AttemptOutcome::Failed {
                detail: check.stderr,
            })
        }
    }

    #[tokio::test]
    async fn retry_loop_resolves_with_commands() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner(&dir, open_store(&dir), short_limits());
        let mut convo = ConversationBranch::new();
        convo.append_message(Role::User, "make the check pass");

        let mut attempt = FixMissingFile {
            runner: &mut runner,
            root: dir.path().to_path_buf(),
            repairs_needed: 1,
            calls: 0,
        };
        let mut ctx = RetryContext::new(&mut convo, 3);
        let report = RetryLoop::new(3).run(&mut ctx, &mut attempt).await.unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(attempt.calls, 2);
        // The failed attempt's message was rolled back.
        assert_eq!(convo.messages().len(), 1);
        assert_eq!(runner.session().ordinal(StreamTag::Command), 2);
    }

    #[tokio::test]
    async fn retry_loop_exhausts_and_escalates_with_output() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner(&dir, open_store(&dir), short_limits());
        let mut convo = ConversationBranch::new();

        let mut attempt = FixMissingFile {
            runner: &mut runner,
            root: dir.path().to_path_buf(),
            repairs_needed: u32::MAX,
            calls: 0,
        };
        let mut ctx = RetryContext::new(&mut convo, 3);
        let err = RetryLoop::new(3).run(&mut ctx, &mut attempt).await.unwrap_err();

        assert_eq!(attempt.calls, 3);
        let ExecError::Checkpoint(PilotError::RetryExhausted(escalation)) = err else {
            panic!("expected RetryExhausted, got {err:?}");
        };
        assert_eq!(escalation.tries, 3);
        assert_eq!(escalation.last_failure.as_deref(), Some("missing\n"));
        assert!(convo.messages().is_empty());
    }
}
