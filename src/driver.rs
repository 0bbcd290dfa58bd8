//! External Program Driver.

use std::fs::{self, File};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ProgramSpec, StdinSource, StdoutSink};
use crate::TmcError;

/// Lines of captured stderr kept in failure diagnostics.
const DIAGNOSTIC_LINES: usize = 20;

/// Campaign-wide cancellation flag, cheap to clone into every worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancels `token` when `trigger` resolves to `true`. The trigger runs on
/// its own thread inside a single-threaded runtime.
pub fn cancel_when<F>(token: CancelToken, trigger: F) -> Result<JoinHandle<()>, TmcError>
where
    F: Future<Output = bool> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(TmcError::Signal)?;
    thread::Builder::new()
        .name("tmc-shutdown".to_string())
        .spawn(move || {
            if runtime.block_on(trigger) {
                token.cancel();
            }
        })
        .map_err(TmcError::Signal)
}

/// Cancels `token` on Ctrl-C, or on SIGTERM where available. Running
/// programs are then terminated and the partial container is still written.
pub fn cancel_on_shutdown_signal(token: CancelToken) -> Result<JoinHandle<()>, TmcError> {
    cancel_when(token, shutdown_signal())
}

#[cfg(unix)]
async fn shutdown_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            return false;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => interrupted(result),
        _ = sigterm.recv() => {
            info!("received SIGTERM, cancelling campaign");
            true
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> bool {
    interrupted(tokio::signal::ctrl_c().await)
}

fn interrupted(result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => {
            info!("received Ctrl-C, cancelling campaign");
            true
        }
        Err(err) => {
            warn!(error = %err, "failed to listen for Ctrl-C");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub output_paths: Vec<PathBuf>,
}

impl ExecutionResult {
    /// Turns a result into the record kept with its instance, rejecting runs
    /// a runner reported as unsuccessful.
    pub fn into_record(self, program: &str) -> Result<ProgramRun, TmcError> {
        if !self.success {
            return Err(TmcError::ExternalProgramFailure {
                program: program.to_string(),
                exit: self
                    .exit_code
                    .map_or_else(|| "no exit code".to_string(), |code| format!("exit code {code}")),
                diagnostics: "runner reported an unsuccessful run".to_string(),
            });
        }
        Ok(ProgramRun {
            program: program.to_string(),
            exit_code: self.exit_code,
            elapsed_secs: self.elapsed.as_secs_f64(),
        })
    }
}

/// One finished program run as stored with its instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramRun {
    pub program: String,
    pub exit_code: Option<i32>,
    pub elapsed_secs: f64,
}

/// Runs one external program to completion inside `working_dir`.
///
/// Implementations must only touch files inside `working_dir` and must
/// return `OutputMissing` when a successful run leaves one of
/// `expected_outputs` absent.
pub trait ProgramRunner: Send + Sync {
    fn run(
        &self,
        program: &ProgramSpec,
        working_dir: &Path,
        expected_outputs: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TmcError>;
}

/// Blocking subprocess runner with optional wall-clock limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessRunner;

impl SubprocessRunner {
    fn spawn(&self, program: &ProgramSpec, working_dir: &Path) -> Result<Child, TmcError> {
        let stderr_path = working_dir.join(format!("{}.stderr", program.name));
        let stderr = File::create(&stderr_path).map_err(TmcError::io(&stderr_path))?;

        let stdin = match &program.stdin {
            StdinSource::Null => Stdio::null(),
            StdinSource::Text(_) => Stdio::piped(),
            StdinSource::File(name) => {
                let path = working_dir.join(name);
                Stdio::from(File::open(&path).map_err(TmcError::io(&path))?)
            }
        };
        let stdout = match &program.stdout {
            StdoutSink::Discard => Stdio::null(),
            StdoutSink::File(name) => {
                let path = working_dir.join(name);
                Stdio::from(File::create(&path).map_err(TmcError::io(&path))?)
            }
        };

        let mut child = Command::new(&program.command)
            .args(&program.args)
            .current_dir(working_dir)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| TmcError::ExternalProgramFailure {
                program: program.name.clone(),
                exit: "not started".to_string(),
                diagnostics: format!("{}: {err}", program.command.display()),
            })?;

        if let (StdinSource::Text(text), Some(mut pipe)) = (&program.stdin, child.stdin.take()) {
            if let Err(err) = pipe.write_all(text.as_bytes()) {
                if err.kind() != ErrorKind::BrokenPipe {
                    terminate(&mut child);
                    return Err(TmcError::Io {
                        path: working_dir.to_path_buf(),
                        source: err,
                    });
                }
            }
        }

        Ok(child)
    }

    fn wait(
        &self,
        child: &mut Child,
        program: &ProgramSpec,
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<ExitStatus, TmcError> {
        let poll = Duration::from_millis(program.poll_interval_ms);
        let limit = program.timeout();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    terminate(child);
                    return Err(TmcError::Io {
                        path: program.command.clone(),
                        source,
                    });
                }
            }

            if cancel.is_cancelled() {
                terminate(child);
                return Err(TmcError::Cancelled);
            }

            if let Some(limit) = limit {
                if started.elapsed() >= limit {
                    terminate(child);
                    return Err(TmcError::Timeout {
                        program: program.name.clone(),
                        limit,
                    });
                }
            }

            thread::sleep(poll);
        }
    }
}

impl ProgramRunner for SubprocessRunner {
    fn run(
        &self,
        program: &ProgramSpec,
        working_dir: &Path,
        expected_outputs: &[PathBuf],
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, TmcError> {
        if cancel.is_cancelled() {
            return Err(TmcError::Cancelled);
        }

        let started = Instant::now();
        let mut child = self.spawn(program, working_dir)?;
        debug!(program = %program.name, pid = child.id(), dir = %working_dir.display(), "started");

        let status = self.wait(&mut child, program, cancel, started)?;
        let elapsed = started.elapsed();

        if !status.success() {
            let stderr_path = working_dir.join(format!("{}.stderr", program.name));
            return Err(TmcError::ExternalProgramFailure {
                program: program.name.clone(),
                exit: status.to_string(),
                diagnostics: stderr_tail(&stderr_path),
            });
        }

        if let Some(missing) = expected_outputs.iter().find(|path| !path.is_file()) {
            return Err(TmcError::OutputMissing {
                program: program.name.clone(),
                path: missing.clone(),
            });
        }

        debug!(program = %program.name, elapsed_ms = elapsed.as_millis() as u64, "finished");
        Ok(ExecutionResult {
            success: true,
            exit_code: status.code(),
            elapsed,
            output_paths: expected_outputs.to_vec(),
        })
    }
}

fn terminate(child: &mut Child) {
    if let Err(err) = child.kill() {
        if err.kind() != ErrorKind::InvalidInput {
            warn!(pid = child.id(), error = %err, "failed to kill external program");
        }
    }
    if let Err(err) = child.wait() {
        warn!(pid = child.id(), error = %err, "failed to reap external program");
    }
}

fn stderr_tail(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => {
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
            let tail = lines[start..].join("\n");
            if tail.trim().is_empty() {
                "no diagnostic output".to_string()
            } else {
                tail
            }
        }
        Err(err) => format!("stderr unavailable: {err}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> ProgramSpec {
        ProgramSpec {
            name: "sh".to_string(),
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn completed_trigger_cancels_the_token() {
        let token = CancelToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let watcher = cancel_when(token.clone(), async move { rx.await.is_ok() }).expect("watcher");
        assert!(!token.is_cancelled());

        tx.send(()).expect("send");
        watcher.join().expect("join");
        assert!(token.is_cancelled());
    }

    #[test]
    fn declined_trigger_leaves_the_token_alone() {
        let token = CancelToken::new();
        let watcher = cancel_when(token.clone(), async { false }).expect("watcher");
        watcher.join().expect("join");
        assert!(!token.is_cancelled());
    }

    #[test]
    fn execution_results_become_program_records() {
        let result = ExecutionResult {
            success: true,
            exit_code: Some(0),
            elapsed: Duration::from_millis(1500),
            output_paths: Vec::new(),
        };
        let record = result.clone().into_record("gef").expect("record");
        assert_eq!(record.program, "gef");
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.elapsed_secs, 1.5);

        let failed = ExecutionResult {
            success: false,
            exit_code: Some(3),
            ..result
        };
        match failed.into_record("gef") {
            Err(TmcError::ExternalProgramFailure { exit, .. }) => assert_eq!(exit, "exit code 3"),
            other => panic!("expected program failure, got {other:?}"),
        }
    }

    #[test]
    fn successful_run_reports_outputs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let output = tmp.path().join("out.dat");
        let result = SubprocessRunner
            .run(
                &shell("echo 1 > out.dat"),
                tmp.path(),
                &[output.clone()],
                &CancelToken::new(),
            )
            .expect("run");

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output_paths, vec![output]);
    }

    #[test]
    fn stdin_and_stdout_are_wired_to_the_working_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("TMC_0_input.in"), "energy 1.0\n").expect("write");

        let program = ProgramSpec {
            stdin: StdinSource::File("{label}_input.in".to_string()),
            stdout: StdoutSink::File("{label}_output.out".to_string()),
            ..shell("cat")
        }
        .for_run("TMC_0");
        let out = tmp.path().join("TMC_0_output.out");
        SubprocessRunner
            .run(&program, tmp.path(), &[out.clone()], &CancelToken::new())
            .expect("run");
        assert_eq!(fs::read_to_string(out).expect("read"), "energy 1.0\n");

        let piped = ProgramSpec {
            stdin: StdinSource::Text("\n".to_string()),
            ..shell("cat > got.txt")
        };
        SubprocessRunner
            .run(&piped, tmp.path(), &[], &CancelToken::new())
            .expect("run");
        assert_eq!(fs::read_to_string(tmp.path().join("got.txt")).expect("read"), "\n");
    }

    #[test]
    fn non_zero_exit_carries_diagnostics() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = SubprocessRunner
            .run(
                &shell("echo 'fatal: no nucleus' >&2; exit 3"),
                tmp.path(),
                &[],
                &CancelToken::new(),
            )
            .unwrap_err();

        match err {
            TmcError::ExternalProgramFailure { diagnostics, .. } => {
                assert!(diagnostics.contains("fatal: no nucleus"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_output_after_success_is_reported() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = SubprocessRunner
            .run(
                &shell("true"),
                tmp.path(),
                &[tmp.path().join("never.lmd")],
                &CancelToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TmcError::OutputMissing { .. }));
    }

    #[test]
    fn timeout_terminates_the_process() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let program = ProgramSpec {
            timeout_ms: Some(100),
            ..shell("sleep 5; echo late > late.txt")
        };

        let started = Instant::now();
        let err = SubprocessRunner
            .run(&program, tmp.path(), &[], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TmcError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!tmp.path().join("late.txt").exists());
    }

    #[test]
    fn cancellation_stops_a_running_program() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let err = SubprocessRunner
            .run(&shell("sleep 5"), tmp.path(), &[], &cancel)
            .unwrap_err();
        handle.join().expect("join");
        assert!(matches!(err, TmcError::Cancelled));
    }

    #[test]
    fn unknown_command_is_an_external_failure() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let program = ProgramSpec {
            name: "ghost".to_string(),
            command: PathBuf::from("/nonexistent/fission-generator"),
            ..Default::default()
        };
        let err = SubprocessRunner
            .run(&program, tmp.path(), &[], &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, TmcError::ExternalProgramFailure { .. }));
    }
}
