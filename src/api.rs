//! HTTP front door for the bridge.
//!
//! `POST /api/chat` runs one prompt through the [`Bridge`](crate::bridge::Bridge);
//! the remaining routes report health and worker status.

mod server;
mod state;

pub use server::{api_router, start_http_server};
pub use state::ApiState;
