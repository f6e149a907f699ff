//! External process supervision.
//!
//! All scientific binaries (CHARMM, FoXS, MultiFoXS, Pepsi-SANS, PyMOL,
//! ffmpeg, Python stage scripts) run through this module:
//!
//! - stdout/stderr are streamed line-by-line to sinks, never buffered whole
//! - a bounded tail of stderr is retained for error messages
//! - a hard timeout escalates SIGTERM -> grace period -> SIGKILL
//! - spawn failures are reported distinctly from non-zero exits
//!
//! The runner resolves only after the child has actually exited, so a
//! caller never races a zombie for its output files.

use std::collections::VecDeque;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Number of stderr lines retained for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Default grace period between SIGTERM and SIGKILL.
const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Errors that can occur while running an external tool.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be started at all.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The program ran but exited unsuccessfully.
    #[error("{program} failed ({status}): {stderr_tail}")]
    ToolExit {
        /// Program that failed.
        program: String,
        /// Human-readable exit description, e.g. "exit code 1".
        status: String,
        /// Numeric exit code if the process exited normally.
        code: Option<i32>,
        /// Last stderr lines, joined with newlines.
        stderr_tail: String,
    },

    /// The program exceeded its hard timeout and was killed.
    #[error("{program} timed out after {after:?}")]
    Timeout {
        /// Program that was killed.
        program: String,
        /// The timeout that was exceeded.
        after: Duration,
    },

    /// I/O error while supervising the process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Specification of a single external tool invocation.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Program to execute.
    pub program: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub cwd: PathBuf,
    /// Extra environment variables.
    pub envs: Vec<(String, String)>,
    /// Hard wall-clock timeout; `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace: Duration,
}

impl RunSpec {
    /// Creates a run spec for a program in the given working directory.
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            envs: Vec::new(),
            timeout: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Appends a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Sets the hard timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the SIGTERM-to-SIGKILL grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

/// Destination for a child's output stream.
#[derive(Debug, Clone)]
pub enum OutputSink {
    /// Discard the stream.
    Null,
    /// Append lines to a file, creating it if needed.
    File(PathBuf),
}

enum SinkWriter {
    Null,
    File(tokio::fs::File),
}

impl OutputSink {
    async fn open(&self) -> std::io::Result<SinkWriter> {
        match self {
            OutputSink::Null => Ok(SinkWriter::Null),
            OutputSink::File(path) => {
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                Ok(SinkWriter::File(file))
            }
        }
    }
}

impl SinkWriter {
    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let SinkWriter::File(file) = self {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        Ok(())
    }
}

/// How a supervised process exited.
#[derive(Debug, Clone)]
pub struct ExitOutcome {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
    /// Last stderr lines, joined with newlines.
    pub stderr_tail: String,
}

impl ExitOutcome {
    /// Returns whether the process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable description of the exit, e.g. "exit code 1".
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(sig)) => format!("killed by signal {}", sig),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// Runs a tool to completion, streaming its output to the given sinks.
///
/// # Errors
///
/// Returns `ExecError::Spawn` if the program cannot be started and
/// `ExecError::Timeout` if it exceeds its hard timeout. A non-zero exit
/// is *not* an error here; see [`run_checked`].
pub async fn run(
    spec: &RunSpec,
    stdout: OutputSink,
    stderr: OutputSink,
) -> Result<ExitOutcome, ExecError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.envs {
        command.env(key, value);
    }

    debug!(program = %spec.program, args = ?spec.args, cwd = %spec.cwd.display(), "spawning tool");

    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stdout_task = stdout_pipe.map(|pipe| tokio::spawn(pump(pipe, stdout, None)));
    let stderr_task =
        stderr_pipe.map(|pipe| tokio::spawn(pump(pipe, stderr, Some(STDERR_TAIL_LINES))));

    let status = match spec.timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(program = %spec.program, timeout = ?limit, "tool timed out, terminating");
                terminate(&mut child, spec.grace).await;
                drain(stdout_task).await;
                drain(stderr_task).await;
                return Err(ExecError::Timeout {
                    program: spec.program.clone(),
                    after: limit,
                });
            }
        },
        None => child.wait().await?,
    };

    drain(stdout_task).await;
    let tail = drain(stderr_task).await;

    Ok(ExitOutcome {
        code: status.code(),
        signal: status.signal(),
        stderr_tail: tail.join("\n"),
    })
}

/// Runs a tool and maps a non-zero exit to `ExecError::ToolExit`.
pub async fn run_checked(
    spec: &RunSpec,
    stdout: OutputSink,
    stderr: OutputSink,
) -> Result<ExitOutcome, ExecError> {
    let outcome = run(spec, stdout, stderr).await?;
    if outcome.success() {
        Ok(outcome)
    } else {
        Err(ExecError::ToolExit {
            program: spec.program.clone(),
            status: outcome.describe(),
            code: outcome.code,
            stderr_tail: outcome.stderr_tail,
        })
    }
}

/// Streams lines from a pipe into a sink, optionally retaining a tail.
async fn pump<R>(reader: R, sink: OutputSink, tail_cap: Option<usize>) -> Vec<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut writer = match sink.open().await {
        Ok(writer) => writer,
        Err(e) => {
            warn!(error = %e, "failed to open output sink, discarding stream");
            SinkWriter::Null
        }
    };

    let mut tail: VecDeque<String> = VecDeque::new();
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = writer.write_line(&line).await {
                    warn!(error = %e, "failed to write tool output line");
                }
                if let Some(cap) = tail_cap {
                    if tail.len() == cap {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read tool output");
                break;
            }
        }
    }

    tail.into_iter().collect()
}

async fn drain(task: Option<tokio::task::JoinHandle<Vec<String>>>) -> Vec<String> {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "child ignored SIGTERM, sending SIGKILL");
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str, cwd: &std::path::Path) -> RunSpec {
        RunSpec::new("/bin/sh", cwd).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let outcome = run(&sh("exit 3", dir.path()), OutputSink::Null, OutputSink::Null)
            .await
            .unwrap();

        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.success());
        assert_eq!(outcome.describe(), "exit code 3");
    }

    #[tokio::test]
    async fn test_run_success() {
        let dir = TempDir::new().unwrap();
        let outcome = run(&sh("true", dir.path()), OutputSink::Null, OutputSink::Null)
            .await
            .unwrap();

        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_distinct() {
        let dir = TempDir::new().unwrap();
        let spec = RunSpec::new("/nonexistent/binary", dir.path());
        let err = run(&spec, OutputSink::Null, OutputSink::Null)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_stdout_streams_to_file_sink() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("stage.log");
        let spec = sh("echo line1; echo line2", dir.path());

        run(&spec, OutputSink::File(log.clone()), OutputSink::Null)
            .await
            .unwrap();

        let body = tokio::fs::read_to_string(&log).await.unwrap();
        assert_eq!(body, "line1\nline2\n");
    }

    #[tokio::test]
    async fn test_stderr_tail_is_captured() {
        let dir = TempDir::new().unwrap();
        let spec = sh("echo oops >&2; echo worse >&2; exit 1", dir.path());

        let err = run_checked(&spec, OutputSink::Null, OutputSink::Null)
            .await
            .unwrap_err();

        match err {
            ExecError::ToolExit {
                status,
                code,
                stderr_tail,
                ..
            } => {
                assert_eq!(code, Some(1));
                assert!(status.contains('1'));
                assert!(stderr_tail.contains("oops"));
                assert!(stderr_tail.contains("worse"));
            }
            other => panic!("expected ToolExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_checked_passes_on_success() {
        let dir = TempDir::new().unwrap();
        let outcome = run_checked(&sh("true", dir.path()), OutputSink::Null, OutputSink::Null)
            .await
            .unwrap();

        assert!(outcome.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let spec = sh("sleep 30", dir.path())
            .with_timeout(Duration::from_millis(200))
            .with_grace(Duration::from_millis(100));

        let start = std::time::Instant::now();
        let err = run(&spec, OutputSink::Null, OutputSink::Null)
            .await
            .unwrap_err();

        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_spec_builder() {
        let spec = RunSpec::new("charmm", "/work")
            .arg("-i")
            .arg("minimize.inp")
            .env("CHARMM_LIB_DIR", "/opt/charmm")
            .with_timeout(Duration::from_secs(60));

        assert_eq!(spec.program, "charmm");
        assert_eq!(spec.args, vec!["-i", "minimize.inp"]);
        assert_eq!(spec.envs.len(), 1);
        assert_eq!(spec.timeout, Some(Duration::from_secs(60)));
        assert_eq!(spec.grace, DEFAULT_GRACE);
    }
}
