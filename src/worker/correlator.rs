//! One request/response cycle against a worker.
//!
//! The call holds the worker's stdin lock from before the request is written
//! until the call settles, and subscribes to the worker's events before
//! writing so nothing the worker says in reply can be missed. The first of
//! {response line, stderr bytes, exit, deadline} settles the call; returning
//! drops the subscription, so later events are never seen by this call.

use crate::error::WorkerError;
use crate::worker::process::{MAX_LINE_BYTES, WorkerEvent, WorkerHandle, WorkerState};
use crate::worker::protocol::{Decoded, Reply, WorkerRequest, decode_line};

use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncWriteExt as _;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

/// How long a failed write waits for the exit watcher before reporting a
/// plain I/O error. A broken pipe usually means the process just died.
const EXIT_SETTLE_GRACE: Duration = Duration::from_millis(250);

/// Send `method(params)` to the worker and wait for its answer.
///
/// Resolves to the response's `result` (or the whole response object when it
/// has none). Calls to the same worker queue behind each other.
pub async fn call(
    handle: &WorkerHandle,
    method: &str,
    params: &Value,
    timeout: Duration,
) -> Result<Value, WorkerError> {
    let worker = handle.name();
    let mut stdin = handle.lock_stdin().await;

    let mut events = handle.subscribe();
    if let WorkerState::Exited(code) = handle.state() {
        return Err(WorkerError::Exited {
            worker: worker.to_owned(),
            code,
        });
    }

    let id = handle.next_request_id();
    let line = WorkerRequest { method, params, id }
        .encode_line()
        .map_err(|error| WorkerError::Write {
            worker: worker.to_owned(),
            source: error.into(),
        })?;

    let deadline = Instant::now() + timeout;
    let timed_out = || WorkerError::Timeout {
        worker: worker.to_owned(),
        after: timeout,
    };

    tracing::debug!(worker, method, id, "sending worker request");

    let write = async {
        stdin.write_all(&line).await?;
        stdin.flush().await
    };
    match tokio::time::timeout_at(deadline, write).await {
        Ok(Ok(())) => {}
        Ok(Err(source)) => {
            if let Some(code) = handle.exited_within(EXIT_SETTLE_GRACE).await {
                return Err(WorkerError::Exited {
                    worker: worker.to_owned(),
                    code,
                });
            }
            return Err(WorkerError::Write {
                worker: worker.to_owned(),
                source,
            });
        }
        Err(_) => {
            tracing::warn!(worker, method, id, "timed out writing worker request");
            return Err(timed_out());
        }
    }

    match tokio::time::timeout_at(deadline, await_reply(handle, &mut events, id)).await {
        Ok(outcome) => {
            if let Err(error) = &outcome {
                tracing::warn!(worker, method, id, %error, "worker call failed");
            }
            outcome
        }
        Err(_) => {
            tracing::warn!(worker, method, id, ?timeout, "worker call timed out");
            Err(timed_out())
        }
    }
}

async fn await_reply(
    handle: &WorkerHandle,
    events: &mut broadcast::Receiver<WorkerEvent>,
    id: u64,
) -> Result<Value, WorkerError> {
    let worker = handle.name();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(worker, skipped, "call fell behind worker output");
                continue;
            }
            Err(RecvError::Closed) => {
                let code = match handle.state() {
                    WorkerState::Exited(code) => code,
                    WorkerState::Running => None,
                };
                return Err(WorkerError::Exited {
                    worker: worker.to_owned(),
                    code,
                });
            }
        };

        match event {
            WorkerEvent::Stdout(line) => match decode_line(&line) {
                Decoded::Blank => continue,
                Decoded::Malformed => {
                    return Err(WorkerError::Protocol {
                        worker: worker.to_owned(),
                        line,
                    });
                }
                Decoded::Response {
                    id: response_id,
                    reply,
                } => {
                    if !handle.correlation().accepts(id, response_id.as_ref()) {
                        tracing::debug!(
                            worker,
                            expected = id,
                            received = ?response_id,
                            "discarding stale worker response"
                        );
                        continue;
                    }

                    return match reply {
                        Reply::Result(value) => Ok(value),
                        Reply::Error(message) => Err(WorkerError::Reported {
                            worker: worker.to_owned(),
                            message,
                        }),
                    };
                }
            },
            WorkerEvent::OversizedLine => {
                return Err(WorkerError::Protocol {
                    worker: worker.to_owned(),
                    line: format!("<line longer than {MAX_LINE_BYTES} bytes>"),
                });
            }
            WorkerEvent::Stderr(text) => {
                return Err(WorkerError::Reported {
                    worker: worker.to_owned(),
                    message: text.trim_end().to_owned(),
                });
            }
            WorkerEvent::Exited(code) => {
                return Err(WorkerError::Exited {
                    worker: worker.to_owned(),
                    code,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::CorrelationMode;
    use crate::worker::test_support::FakeWorker;
    use serde_json::json;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn resolves_to_result_field() {
        let (handle, mut worker) = FakeWorker::spawn("filesystem", CorrelationMode::Sequential);

        let responder = tokio::spawn(async move {
            let request = worker.next_request().await;
            assert_eq!(request["method"], "writeFile");
            assert_eq!(request["params"], json!({"filename": "a.txt", "content": "hi"}));
            worker
                .respond(&request["id"], json!("File written successfully"))
                .await;
            worker
        });

        let result = call(
            &handle,
            "writeFile",
            &json!({"filename": "a.txt", "content": "hi"}),
            TIMEOUT,
        )
        .await
        .expect("call succeeds");

        assert_eq!(result, json!("File written successfully"));
        responder.await.expect("responder");
    }

    #[tokio::test(start_paused = true)]
    async fn extra_output_is_not_attributed_to_the_next_call() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Fixed);

        let responder = tokio::spawn(async move {
            let first = worker.next_request().await;
            worker.respond(&first["id"], json!("first")).await;
            // A second, unsolicited line for the same request.
            worker.respond(&first["id"], json!("duplicate")).await;

            let second = worker.next_request().await;
            worker.respond(&second["id"], json!("second")).await;
            worker
        });

        let first = call(&handle, "a", &json!({}), TIMEOUT).await.expect("first");
        // Let the duplicate be published while no call is listening.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = call(&handle, "b", &json!({}), TIMEOUT).await.expect("second");

        assert_eq!(first, json!("first"));
        assert_eq!(second, json!("second"));
        responder.await.expect("responder");
    }

    #[tokio::test(start_paused = true)]
    async fn response_without_result_resolves_to_whole_object() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);

        tokio::spawn(async move {
            worker.next_request().await;
            worker.write_stdout("{\"files\":[\"a.txt\"]}\n").await;
            worker
        });

        let result = call(&handle, "list", &json!({}), TIMEOUT).await.expect("call");
        assert_eq!(result, json!({"files": ["a.txt"]}));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_line_is_a_protocol_error() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);

        tokio::spawn(async move {
            worker.next_request().await;
            worker.write_stdout("\n").await;
            worker.write_stdout("not json at all\n").await;
            worker
        });

        let error = call(&handle, "x", &json!({}), TIMEOUT)
            .await
            .expect_err("protocol error");

        match error {
            WorkerError::Protocol { worker, line } => {
                assert_eq!(worker, "fs");
                assert_eq!(line, "not json at all");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_line_is_a_protocol_error() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);

        let flooder = tokio::spawn(async move {
            worker.next_request().await;
            let flood = "x".repeat(MAX_LINE_BYTES + 1);
            worker.write_stdout(&flood).await;
            worker.write_stdout("\n").await;
            worker
        });

        let error = call(&handle, "x", &json!({}), TIMEOUT)
            .await
            .expect_err("protocol error");

        assert_eq!(error.kind(), "protocol_error");
        assert!(error.to_string().contains("longer than"), "{error}");
        assert!(handle.is_alive());
        let _worker = flooder.await.expect("worker task");
    }

    #[tokio::test(start_paused = true)]
    async fn stderr_output_fails_the_call() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);

        tokio::spawn(async move {
            worker.next_request().await;
            worker.write_stderr("EACCES: permission denied\n").await;
            worker
        });

        let error = call(&handle, "writeFile", &json!({}), TIMEOUT)
            .await
            .expect_err("worker error");

        assert_eq!(error.kind(), "worker_reported_error");
        assert_eq!(
            error.to_string(),
            "worker 'fs' error: EACCES: permission denied"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn error_response_fails_the_call() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);

        tokio::spawn(async move {
            let request = worker.next_request().await;
            let line = json!({"id": request["id"], "error": "Unknown method: rm"});
            worker.write_stdout(&format!("{line}\n")).await;
            worker
        });

        let error = call(&handle, "rm", &json!({}), TIMEOUT)
            .await
            .expect_err("error response");

        match error {
            WorkerError::Reported { message, .. } => assert_eq!(message, "Unknown method: rm"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_leaves_worker_running() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);

        let silent = tokio::spawn(async move {
            worker.next_request().await;
            worker
        });

        let error = call(&handle, "slow", &json!({}), Duration::from_millis(200))
            .await
            .expect_err("timeout");

        match error {
            WorkerError::Timeout { worker, after } => {
                assert_eq!(worker, "fs");
                assert_eq!(after, Duration::from_millis(200));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(handle.is_alive());
        let _worker = silent.await.expect("worker task");
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_does_not_leak_into_next_call() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);
        let (first_seen_tx, first_seen_rx) = tokio::sync::oneshot::channel();

        let responder = tokio::spawn(async move {
            let a = worker.next_request().await;
            let _ = first_seen_tx.send(());

            let b = worker.next_request().await;
            // A's answer finally shows up, after B was sent.
            worker.respond(&a["id"], json!("answer for A")).await;
            worker.respond(&b["id"], json!("answer for B")).await;
            worker
        });

        let a = call(&handle, "a", &json!({}), Duration::from_millis(100)).await;
        assert!(matches!(a, Err(WorkerError::Timeout { .. })));
        first_seen_rx.await.expect("A was written");

        let b = call(&handle, "b", &json!({}), TIMEOUT).await.expect("B resolves");
        assert_eq!(b, json!("answer for B"));
        responder.await.expect("responder");
    }

    #[tokio::test(start_paused = true)]
    async fn exit_before_response_resolves_to_worker_exited() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);

        tokio::spawn(async move {
            worker.next_request().await;
            worker.exit(Some(1));
        });

        let error = call(&handle, "crash", &json!({}), TIMEOUT)
            .await
            .expect_err("exited");

        match error {
            WorkerError::Exited { worker, code } => {
                assert_eq!(worker, "fs");
                assert_eq!(code, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!handle.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn call_on_dead_worker_fails_without_hanging() {
        let (handle, worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);
        let mut events = handle.subscribe();
        worker.exit(Some(0));
        while !matches!(events.recv().await, Ok(WorkerEvent::Exited(_))) {}

        let error = call(&handle, "x", &json!({}), TIMEOUT)
            .await
            .expect_err("dead worker");
        assert_eq!(error.kind(), "worker_exited");
    }

    #[tokio::test(start_paused = true)]
    async fn calls_to_the_same_worker_are_serialized() {
        let (handle, mut worker) = FakeWorker::spawn("fs", CorrelationMode::Sequential);
        let handle = Arc::new(handle);

        let responder = tokio::spawn(async move {
            let first = worker.next_request().await;

            // The second caller is queued: nothing else may be written yet.
            let early = tokio::time::timeout(Duration::from_millis(500), worker.next_request()).await;
            assert!(early.is_err(), "second request written while first pending");

            worker.respond(&first["id"], json!(first["method"])).await;

            let second = worker.next_request().await;
            worker.respond(&second["id"], json!(second["method"])).await;
            worker
        });

        let one = tokio::spawn({
            let handle = handle.clone();
            async move { call(&handle, "one", &json!({}), TIMEOUT).await }
        });
        tokio::task::yield_now().await;
        let two = tokio::spawn({
            let handle = handle.clone();
            async move { call(&handle, "two", &json!({}), TIMEOUT).await }
        });

        let one = one.await.expect("join").expect("first call");
        let two = two.await.expect("join").expect("second call");
        assert_eq!(one, json!("one"));
        assert_eq!(two, json!("two"));
        responder.await.expect("responder");
    }

    #[tokio::test(start_paused = true)]
    async fn calls_to_different_workers_do_not_block_each_other() {
        let (slow, mut slow_worker) = FakeWorker::spawn("slow", CorrelationMode::Sequential);
        let (fast, mut fast_worker) = FakeWorker::spawn("fast", CorrelationMode::Sequential);

        let slow_io = tokio::spawn(async move {
            slow_worker.next_request().await;
            slow_worker
        });
        tokio::spawn(async move {
            let request = fast_worker.next_request().await;
            fast_worker.respond(&request["id"], json!("fast")).await;
            fast_worker
        });

        let pending = tokio::spawn(async move { call(&slow, "wait", &json!({}), TIMEOUT).await });
        tokio::task::yield_now().await;

        let result = call(&fast, "go", &json!({}), TIMEOUT).await.expect("fast call");
        assert_eq!(result, json!("fast"));
        assert!(!pending.is_finished(), "slow call should still be pending");

        let slow_result = pending.await.expect("join");
        assert!(matches!(slow_result, Err(WorkerError::Timeout { .. })));
        let _slow_worker = slow_io.await.expect("slow worker");
    }
}
