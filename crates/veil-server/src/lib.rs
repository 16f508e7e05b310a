//! # veil-server
//!
//! The Veil relay server binary, exposed as a library so integration tests
//! can drive a real server on an ephemeral port.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_app, run_server, AppState};
