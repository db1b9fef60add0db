//! Process-backed RPC layer.
//!
//! Each configured worker runs as one long-lived child process speaking
//! newline-delimited JSON over stdio. [`WorkerHandle`] owns the process and
//! fans its output out to the log and to whichever call is in flight,
//! [`call`] performs one request/response cycle, and [`WorkerRegistry`] owns
//! the handles by name.

mod correlator;
mod process;
mod protocol;
mod registry;
#[cfg(test)]
pub(crate) mod test_support;

pub use correlator::call;
pub use process::{WorkerEvent, WorkerHandle, WorkerState};
pub use protocol::{CorrelationMode, FIXED_REQUEST_ID, WorkerRequest};
pub use registry::{WorkerRegistry, WorkerStatus};
