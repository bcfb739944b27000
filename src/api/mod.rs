//! HTTP API for the gateway.

mod routes;
mod servers;
pub mod types;

pub use routes::{router, serve, AppState};
