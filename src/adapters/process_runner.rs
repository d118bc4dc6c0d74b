//! Runs the research engine as a child process.
//!
//! stdout and stderr are read by two independent tasks. Each line is pushed
//! to the caller's channel as soon as it arrives and also kept in a buffer.
//! Readers get a short grace period after the child exits. Processes left
//! behind by the child can hold the pipes open, so readers still running after
//! that are aborted and the output captured so far is kept.
//!
//! On unix the child leads its own process group, and a timeout kills the
//! whole group.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::event::LogStream;
use crate::domain::settings::BusSettings;
use crate::domain::task::RunOutcome;
use crate::ports::command_runner::{CommandRunner, LogLine};

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    entrypoint: Option<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            entrypoint: None,
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    /// Script passed as the first argument, e.g. `main.py`.
    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_settings(settings: &BusSettings) -> Self {
        Self::new(&settings.interpreter, &settings.repo_root)
            .with_entrypoint(settings.entrypoint.clone())
            .with_timeout(settings.timeout)
    }
}

/// Longer lines are split into pieces of this size.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How long readers may keep draining once the child is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

type Captured = Arc<Mutex<String>>;

fn take_captured(captured: &Captured) -> String {
    let mut text = captured.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *text)
}

/// Copies `reader` into `captured` line by line, forwarding every line.
async fn pump<R>(reader: R, stream: LogStream, logs: UnboundedSender<LogLine>, captured: Captured)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut raw)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&raw);
                let line = text.trim_end_matches(['\n', '\r']);
                {
                    let mut buffer = captured
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    buffer.push_str(line);
                    buffer.push('\n');
                }
                // The consumer may have gone away; the buffer is still kept.
                let _ = logs.send(LogLine {
                    stream,
                    line: line.to_string(),
                });
            }
            Err(e) => {
                warn!(%stream, error = %e, "stopped reading child output");
                break;
            }
        }
    }
}

fn spawn_reader<R>(
    reader: Option<R>,
    stream: LogStream,
    logs: &UnboundedSender<LogLine>,
) -> (Captured, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured = Captured::default();
    let handle = reader.map(|r| tokio::spawn(pump(r, stream, logs.clone(), captured.clone())));
    (captured, handle)
}

/// Waits for the readers, aborting any still running after the grace period.
async fn join_readers(handles: Vec<JoinHandle<()>>) {
    let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
    if tokio::time::timeout(READER_GRACE, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!("child output still open after exit; abandoning readers");
        for abort in aborts {
            abort.abort();
        }
    }
}

/// Kills the child and, on unix, every process in its group.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg only sends a signal; the group id is the child's pid.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill timed out child");
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, args: Vec<String>, logs: UnboundedSender<LogLine>) -> RunOutcome {
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        if let Some(entrypoint) = &self.entrypoint {
            cmd.arg(entrypoint);
        }
        cmd.args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(program = %self.program.display(), ?args, "spawning child");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome {
                    duration_ms: elapsed_ms(start),
                    ..RunOutcome::rejected(format!(
                        "failed to start {}: {e}",
                        self.program.display()
                    ))
                };
            }
        };

        let (stdout_buf, stdout_task) = spawn_reader(child.stdout.take(), LogStream::Stdout, &logs);
        let (stderr_buf, stderr_task) = spawn_reader(child.stderr.take(), LogStream::Stderr, &logs);
        drop(logs);

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status.map_err(|e| e.to_string()),
                Err(_) => {
                    kill_tree(&mut child).await;
                    Err(format!("timed out after {}s", limit.as_secs_f64()))
                }
            },
            None => child.wait().await.map_err(|e| e.to_string()),
        };

        join_readers(stdout_task.into_iter().chain(stderr_task).collect()).await;
        let stdout = take_captured(&stdout_buf);
        let stderr = take_captured(&stderr_buf);
        let duration_ms = elapsed_ms(start);

        match waited {
            Ok(status) if status.success() => RunOutcome {
                ok: true,
                exit_code: 0,
                stdout,
                stderr,
                duration_ms,
                error: None,
            },
            Ok(status) => {
                let exit_code = status.code().unwrap_or(-1);
                let error = match status.code() {
                    Some(code) => format!("exit status {code}"),
                    None => format!("terminated: {status}"),
                };
                RunOutcome {
                    ok: false,
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    error: Some(error),
                }
            }
            Err(error) => RunOutcome {
                ok: false,
                exit_code: -1,
                stdout,
                stderr,
                duration_ms,
                error: Some(error),
            },
        }
    }
}
