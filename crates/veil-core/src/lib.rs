//! # veil-core
//!
//! The routing and presence engine of the Veil zero-knowledge relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Who is connected, keyed by logical identity
//! - **RateLimiter** - Fixed-window throttling per (event kind, actor)
//! - **RouteCache** - Short-lived rescue routes for acknowledgements
//! - **Relay** - Per-event dispatch, resolution, and forwarding
//! - **Switchboard** - In-process implementation of the transport seam
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│    Wire     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │   │   │
//!              ┌─────────┘   │   └─────────┐
//!              ▼             ▼             ▼
//!       ┌──────────┐  ┌───────────┐  ┌───────────┐
//!       │ Registry │  │  Limiter  │  │RouteCache │
//!       └──────────┘  └───────────┘  └───────────┘
//! ```
//!
//! The relay never reads message plaintext: every payload it forwards is an
//! opaque blob, and the only state it keeps is who is connected right now
//! plus a short-lived cache of in-flight routes. Losing all of it on restart
//! is part of the contract.

pub mod limiter;
pub mod registry;
pub mod route_cache;
pub mod router;
pub mod switchboard;
pub mod wire;

pub use limiter::{EventKind, RateLimiter};
pub use registry::{Registry, User};
pub use route_cache::{MessageRoute, RouteCache};
pub use router::Relay;
pub use switchboard::Switchboard;
pub use wire::{ConnectionId, Target, Wire};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
