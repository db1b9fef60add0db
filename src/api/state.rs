//! Shared state for API handlers.

use crate::bridge::Bridge;
use crate::worker::WorkerRegistry;

use std::sync::Arc;
use std::time::Instant;

pub struct ApiState {
    pub bridge: Bridge,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            started_at: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.bridge.registry()
    }
}
