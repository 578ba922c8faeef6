//! REST API module for operational endpoints
//!
//! Serves liveness, leadership and Prometheus metrics over HTTP.

mod handlers;
mod server;

pub use handlers::HealthResponse;
pub use server::{router, run_server};
