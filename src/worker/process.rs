//! Worker subprocess lifecycle management.
//!
//! Handles spawning the worker binary (or its fallback script), piping
//! stdin/stdout/stderr, and publishing everything the process writes as
//! [`WorkerEvent`]s on a broadcast channel. Background readers log every
//! event before publishing it, so observability never competes with the
//! correlator for the bytes.

use crate::config::WorkerSpec;
use crate::error::WorkerError;
use crate::worker::protocol::{CorrelationMode, FIXED_REQUEST_ID};

use futures::FutureExt as _;
use futures::future::BoxFuture;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder as _};
use tokio_util::sync::CancellationToken;

/// Events buffered per subscriber before it starts lagging.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long the exit watcher waits for the output pipes to reach EOF after
/// the process exits. Grandchildren that inherited a pipe can keep it open
/// forever.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

const STDERR_CHUNK_BYTES: usize = 4096;

/// Longest stdout line accepted from a worker. Longer lines are dropped and
/// reported as [`WorkerEvent::OversizedLine`].
pub(crate) const MAX_LINE_BYTES: usize = 1024 * 1024;

const TASK_JOIN_GRACE: Duration = Duration::from_secs(3);

/// Something a worker process did, in the order the bridge observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One complete stdout line, without its terminator.
    Stdout(String),
    /// A stdout line longer than the line limit was discarded.
    OversizedLine,
    /// A chunk of bytes from stderr, lossily decoded.
    Stderr(String),
    /// The process is gone. Always the last event.
    Exited(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Exited(Option<i32>),
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running worker with piped I/O handles.
pub struct WorkerHandle {
    name: String,
    pid: Option<u32>,
    correlation: CorrelationMode,
    /// Request stream. The guard is held for a whole call, which is what
    /// keeps at most one request in flight per worker.
    stdin: Mutex<BoxedWriter>,
    events: broadcast::Sender<WorkerEvent>,
    state: watch::Receiver<WorkerState>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    exit_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("correlation", &self.correlation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Launch the worker described by `spec`.
    ///
    /// When the primary command cannot be started and the spec names a
    /// fallback script, the script is launched with the same directory
    /// argument instead.
    pub fn spawn(spec: &WorkerSpec) -> Result<Self, WorkerError> {
        let primary = LaunchPlan::primary(spec);
        let primary_error = match primary.start() {
            Ok(child) => return Self::from_child(spec, child),
            Err(error) => error,
        };

        let Some(fallback) = LaunchPlan::fallback(spec) else {
            return Err(WorkerError::Launch {
                worker: spec.name.clone(),
                message: format!("{}: {primary_error}", primary.program),
            });
        };

        tracing::warn!(
            worker = %spec.name,
            program = %primary.program,
            error = %primary_error,
            fallback = %fallback.describe(),
            "primary launch failed, trying fallback script"
        );

        match fallback.start() {
            Ok(child) => Self::from_child(spec, child),
            Err(fallback_error) => Err(WorkerError::Launch {
                worker: spec.name.clone(),
                message: format!(
                    "{}: {primary_error}; fallback {}: {fallback_error}",
                    primary.program,
                    fallback.describe()
                ),
            }),
        }
    }

    /// Attach a handle to arbitrary streams. `exit` resolves with the exit
    /// code once the peer is gone.
    pub fn from_io<W, R, E, X>(
        name: impl Into<String>,
        correlation: CorrelationMode,
        stdin: W,
        stdout: R,
        stderr: E,
        exit: X,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
        X: Future<Output = Option<i32>> + Send + 'static,
    {
        Self::assemble(
            name.into(),
            correlation,
            None,
            Box::new(stdin),
            stdout,
            stderr,
            exit.boxed(),
        )
    }

    fn from_child(spec: &WorkerSpec, mut child: Child) -> Result<Self, WorkerError> {
        let missing_pipe = |pipe: &str| WorkerError::Launch {
            worker: spec.name.clone(),
            message: format!("child process has no {pipe} pipe"),
        };

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let pid = child.id();

        // Dropping the child on shutdown kills it (kill_on_drop).
        let exit = async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(error) => {
                    tracing::warn!(%error, "failed to wait on worker process");
                    None
                }
            }
        };

        Ok(Self::assemble(
            spec.name.clone(),
            spec.correlation,
            pid,
            Box::new(stdin),
            stdout,
            stderr,
            exit.boxed(),
        ))
    }

    fn assemble<R, E>(
        name: String,
        correlation: CorrelationMode,
        pid: Option<u32>,
        stdin: BoxedWriter,
        stdout: R,
        stderr: E,
        exit: BoxFuture<'static, Option<i32>>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(WorkerState::Running);
        let shutdown = CancellationToken::new();

        let stdout_task = tokio::spawn(read_stdout(name.clone(), stdout, events.clone()));
        let stderr_task = tokio::spawn(read_stderr(name.clone(), stderr, events.clone()));
        let exit_task = tokio::spawn(watch_exit(
            name.clone(),
            exit,
            [stdout_task, stderr_task],
            events.clone(),
            state_tx,
            shutdown.clone(),
        ));

        tracing::info!(worker = %name, pid, ?correlation, "worker started");

        Self {
            name,
            pid,
            correlation,
            stdin: Mutex::new(stdin),
            events,
            state: state_rx,
            next_id: AtomicU64::new(1),
            shutdown,
            exit_task: Mutex::new(Some(exit_task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn correlation(&self) -> CorrelationMode {
        self.correlation
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn lock_stdin(&self) -> MutexGuard<'_, BoxedWriter> {
        self.stdin.lock().await
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        match self.correlation {
            CorrelationMode::Fixed => FIXED_REQUEST_ID,
            CorrelationMode::Sequential => self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Wait up to `grace` for the exit to be observed. Returns the exit code
    /// if it was.
    pub(crate) async fn exited_within(&self, grace: Duration) -> Option<Option<i32>> {
        let mut state = self.state.clone();
        let waited = tokio::time::timeout(
            grace,
            state.wait_for(|state| matches!(state, WorkerState::Exited(_))),
        )
        .await;

        match waited {
            Ok(Ok(state)) => match *state {
                WorkerState::Exited(code) => Some(code),
                WorkerState::Running => None,
            },
            _ => None,
        }
    }

    /// Kill the process if it is still running and wait until its exit has
    /// been published.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let Some(exit_task) = self.exit_task.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(TASK_JOIN_GRACE, exit_task).await.is_err() {
            tracing::warn!(worker = %self.name, "worker did not stop in time");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_stdout<R>(name: String, mut stdout: R, events: broadcast::Sender<WorkerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut codec =
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES);
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut at_eof = false;

    loop {
        let decoded = if at_eof {
            codec.decode_eof(&mut buffer)
        } else {
            codec.decode(&mut buffer)
        };

        match decoded {
            Ok(Some(chunk)) => {
                let decoded = String::from_utf8_lossy(&chunk);
                let line = decoded.trim_end_matches('\r');
                tracing::info!(worker = %name, "{line}");
                // No receivers just means no call is in flight.
                let _ = events.send(WorkerEvent::Stdout(line.to_owned()));
                continue;
            }
            Ok(None) if at_eof => break,
            Ok(None) => {}
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                // The codec skips ahead to the next newline on its own.
                tracing::warn!(
                    worker = %name,
                    limit = MAX_LINE_BYTES,
                    "worker stdout line too long, discarding it"
                );
                let _ = events.send(WorkerEvent::OversizedLine);
                continue;
            }
            Err(AnyDelimiterCodecError::Io(error)) => {
                tracing::warn!(worker = %name, %error, "failed to decode worker stdout");
                break;
            }
        }

        match stdout.read_buf(&mut buffer).await {
            Ok(0) => at_eof = true,
            Ok(_) => {}
            Err(error) => {
                tracing::warn!(worker = %name, %error, "failed to read worker stdout");
                break;
            }
        }
    }
}

async fn read_stderr<E>(name: String, stderr: E, events: broadcast::Sender<WorkerEvent>)
where
    E: AsyncRead + Unpin,
{
    let mut stderr = stderr;
    let mut chunk = [0u8; STDERR_CHUNK_BYTES];

    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => {
                let text = String::from_utf8_lossy(&chunk[..read]).into_owned();
                tracing::warn!(worker = %name, "{}", text.trim_end());
                let _ = events.send(WorkerEvent::Stderr(text));
            }
            Err(error) => {
                tracing::warn!(worker = %name, %error, "failed to read worker stderr");
                break;
            }
        }
    }
}

async fn watch_exit(
    name: String,
    exit: BoxFuture<'static, Option<i32>>,
    readers: [JoinHandle<()>; 2],
    events: broadcast::Sender<WorkerEvent>,
    state: watch::Sender<WorkerState>,
    shutdown: CancellationToken,
) {
    let code = tokio::select! {
        code = exit => code,
        _ = shutdown.cancelled() => {
            tracing::info!(worker = %name, "stopping worker");
            None
        }
    };

    // Publish anything written just before exit ahead of the exit itself.
    let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_GRACE;
    for mut reader in readers {
        if tokio::time::timeout_at(drain_deadline, &mut reader)
            .await
            .is_err()
        {
            reader.abort();
        }
    }

    match code {
        Some(0) | None => tracing::info!(worker = %name, code, "worker exited"),
        Some(code) => tracing::warn!(worker = %name, code, "worker exited with failure"),
    }

    state.send_replace(WorkerState::Exited(code));
    let _ = events.send(WorkerEvent::Exited(code));
}

/// Resolved program, arguments and environment for one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LaunchPlan {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl LaunchPlan {
    fn primary(spec: &WorkerSpec) -> Self {
        let directory = directory_argument(spec);
        let mut args = Vec::new();

        let program = match &spec.command {
            Some(command) => interpolate_env_placeholders(command),
            None => {
                args.push(format!("@modelcontextprotocol/server-{}", spec.name));
                "npx".to_string()
            }
        };

        args.extend(spec.args.iter().map(|arg| interpolate_env_placeholders(arg)));

        match directory {
            Some(directory) => args.push(directory),
            None if spec.command.is_none() => args.push("./".to_string()),
            None => {}
        }

        Self {
            program,
            args,
            env: resolved_env(spec),
        }
    }

    fn fallback(spec: &WorkerSpec) -> Option<Self> {
        let script = interpolate_env_placeholders(spec.fallback_script.as_deref()?);
        if script.trim().is_empty() {
            return None;
        }

        let (program, mut args) = if script.ends_with(".js") {
            ("node".to_string(), vec![script])
        } else {
            (script, Vec::new())
        };
        args.extend(directory_argument(spec));

        Some(Self {
            program,
            args,
            env: resolved_env(spec),
        })
    }

    fn start(&self) -> std::io::Result<Child> {
        tokio::process::Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn directory_argument(spec: &WorkerSpec) -> Option<String> {
    spec.allowed_directory
        .as_deref()
        .map(interpolate_env_placeholders)
}

fn resolved_env(spec: &WorkerSpec) -> Vec<(String, String)> {
    let mut env = spec
        .env
        .iter()
        .map(|(key, value)| (key.clone(), interpolate_env_placeholders(value)))
        .collect::<Vec<_>>();
    env.sort();
    env
}

/// Expand `${VAR}` from the process environment. Unset variables expand to
/// nothing; an unterminated `${` is kept literally.
fn interpolate_env_placeholders(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let var_name = &after_open[..end];
        if !var_name.is_empty() {
            output.push_str(&std::env::var(var_name).unwrap_or_default());
        }
        rest = &after_open[end + 1..];
    }

    output.push_str(rest);
    output
}
