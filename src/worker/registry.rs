//! Name to worker mapping and tool-call dispatch.

use crate::config::WorkerSpec;
use crate::error::WorkerError;
use crate::worker::correlator;
use crate::worker::process::{WorkerHandle, WorkerState};

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub exit_code: Option<i32>,
}

/// Owns every running worker. Built once at startup and only read after
/// that; handles are borrowed out for the length of one call.
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerHandle>,
    call_timeout: Duration,
}

impl WorkerRegistry {
    /// Launch every enabled spec. Workers that fail to launch are logged and
    /// left out; they are not retried.
    pub fn start(specs: &[WorkerSpec], call_timeout: Duration) -> Self {
        let mut workers = HashMap::new();

        for spec in specs {
            if !spec.enabled {
                tracing::info!(worker = %spec.name, "worker disabled, skipping");
                continue;
            }
            if workers.contains_key(&spec.name) {
                tracing::warn!(worker = %spec.name, "duplicate worker name, keeping the first");
                continue;
            }

            match WorkerHandle::spawn(spec) {
                Ok(handle) => {
                    workers.insert(spec.name.clone(), handle);
                }
                Err(error) => {
                    tracing::warn!(worker = %spec.name, %error, "worker unavailable");
                }
            }
        }

        if workers.is_empty() && !specs.is_empty() {
            tracing::warn!("no workers could be launched, tool calls will fail");
        }

        Self {
            workers,
            call_timeout,
        }
    }

    /// Registry over already-running handles.
    pub fn from_handles(
        handles: impl IntoIterator<Item = WorkerHandle>,
        call_timeout: Duration,
    ) -> Self {
        let mut workers = HashMap::new();
        for handle in handles {
            if workers.contains_key(handle.name()) {
                tracing::warn!(worker = %handle.name(), "duplicate worker name, keeping the first");
                continue;
            }
            workers.insert(handle.name().to_owned(), handle);
        }

        Self {
            workers,
            call_timeout,
        }
    }

    pub fn lookup(&self, name: &str) -> Result<&WorkerHandle, WorkerError> {
        self.workers
            .get(name)
            .filter(|handle| handle.is_alive())
            .ok_or_else(|| WorkerError::NotFound {
                worker: name.to_owned(),
            })
    }

    /// Run `method(args)` on the named worker, queued behind any call
    /// already in flight on it.
    pub async fn call_tool(
        &self,
        name: &str,
        method: &str,
        args: &Value,
    ) -> Result<Value, WorkerError> {
        let handle = self.lookup(name)?;
        tracing::info!(worker = name, method, "calling worker");
        correlator::call(handle, method, args, self.call_timeout).await
    }

    /// Registered worker names, sorted.
    pub fn worker_names(&self) -> Vec<String> {
        let mut names = self.workers.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        let mut statuses = self
            .workers
            .values()
            .map(|handle| {
                let (alive, exit_code) = match handle.state() {
                    WorkerState::Running => (true, None),
                    WorkerState::Exited(code) => (false, code),
                };
                WorkerStatus {
                    name: handle.name().to_owned(),
                    pid: handle.pid(),
                    alive,
                    exit_code,
                }
            })
            .collect::<Vec<_>>();
        statuses.sort_by(|left, right| left.name.cmp(&right.name));
        statuses
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop every worker.
    pub async fn shutdown(&self) {
        futures::future::join_all(self.workers.values().map(|handle| handle.shutdown())).await;
        tracing::info!(workers = self.workers.len(), "all workers stopped");
    }
}
