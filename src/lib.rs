//! Toolbridge: lets a locally hosted language model drive long-lived stdio
//! worker processes through function tools.

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod llm;
pub mod worker;

pub use error::{Error, Result};
