//! In-process stand-in for a worker process, wired to a [`WorkerHandle`]
//! through duplex pipes.

use crate::worker::{CorrelationMode, WorkerHandle};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::oneshot;

const PIPE_CAPACITY: usize = 64 * 1024;

/// The worker's side of the pipes.
pub(crate) struct FakeWorker {
    requests: Lines<BufReader<DuplexStream>>,
    stdout: DuplexStream,
    stderr: DuplexStream,
    exit: oneshot::Sender<Option<i32>>,
}

impl FakeWorker {
    pub(crate) fn spawn(name: &str, correlation: CorrelationMode) -> (WorkerHandle, FakeWorker) {
        let (handle_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, handle_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stderr, handle_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let handle = WorkerHandle::from_io(
            name,
            correlation,
            handle_stdin,
            handle_stdout,
            handle_stderr,
            async move { exit_rx.await.ok().flatten() },
        );

        let worker = FakeWorker {
            requests: BufReader::new(worker_stdin).lines(),
            stdout: worker_stdout,
            stderr: worker_stderr,
            exit: exit_tx,
        };

        (handle, worker)
    }

    /// Next request line written by the bridge, parsed.
    pub(crate) async fn next_request(&mut self) -> Value {
        let line = self
            .requests
            .next_line()
            .await
            .expect("read request")
            .expect("bridge closed stdin");
        serde_json::from_str(&line).expect("request is json")
    }

    pub(crate) async fn write_stdout(&mut self, text: &str) {
        self.stdout
            .write_all(text.as_bytes())
            .await
            .expect("write stdout");
    }

    pub(crate) async fn write_stderr(&mut self, text: &str) {
        self.stderr
            .write_all(text.as_bytes())
            .await
            .expect("write stderr");
    }

    /// Answer a request with `{"id": id, "result": result}`.
    pub(crate) async fn respond(&mut self, id: &Value, result: Value) {
        let line = serde_json::json!({ "id": id, "result": result });
        self.write_stdout(&format!("{line}\n")).await;
    }

    /// Close every pipe and report the exit code.
    pub(crate) fn exit(self, code: Option<i32>) {
        let FakeWorker {
            requests,
            stdout,
            stderr,
            exit,
        } = self;
        drop((requests, stdout, stderr));
        let _ = exit.send(code);
    }
}
