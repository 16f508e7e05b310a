//! Fixed-window rate limiting per (event kind, actor).
//!
//! Fixed windows, not sliding or leaky-bucket: O(1) memory and check cost
//! per event, at the price of permitting brief bursts exactly at window
//! boundaries. Windows for different kinds never interact: an actor
//! exceeding one kind's limit is unaffected on every other kind.

use crate::now_ms;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

/// The throttled event families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Register,
    MessageSend,
    Ack,
    Discovery,
    KeyExchange,
    CallSignal,
    Typing,
    GroupCreate,
    FileChunk,
    /// Anything without a dedicated budget.
    Other,
}

impl EventKind {
    /// Kind identifier for logs and metric labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::MessageSend => "message_send",
            Self::Ack => "ack",
            Self::Discovery => "discovery",
            Self::KeyExchange => "key_exchange",
            Self::CallSignal => "call_signal",
            Self::Typing => "typing",
            Self::GroupCreate => "group_create",
            Self::FileChunk => "file_chunk",
            Self::Other => "other",
        }
    }

    /// Static limit table: (max events, window).
    #[must_use]
    pub fn limit(&self) -> (u32, Duration) {
        match self {
            Self::Register => (5, Duration::from_secs(300)),
            Self::MessageSend => (100, Duration::from_secs(60)),
            Self::Ack => (300, Duration::from_secs(60)),
            Self::Discovery => (20, Duration::from_secs(60)),
            Self::KeyExchange => (10, Duration::from_secs(60)),
            Self::CallSignal => (300, Duration::from_secs(60)),
            Self::Typing => (50, Duration::from_secs(60)),
            Self::GroupCreate => (5, Duration::from_secs(300)),
            Self::FileChunk => (20, Duration::from_secs(60)),
            Self::Other => (100, Duration::from_secs(60)),
        }
    }
}

/// One counting window. Replaced wholesale when it expires.
#[derive(Debug, Clone)]
struct Window {
    count: u32,
    reset_at: u64,
}

/// Fixed-window event counter keyed by (kind, actor).
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<(EventKind, String), Window>,
}

impl RateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one event. Returns `true` if the event is within budget.
    ///
    /// The check-then-increment is atomic per key; a rejected event does not
    /// advance the counter, so rejection never extends the throttled period.
    pub fn check(&self, kind: EventKind, actor: &str) -> bool {
        self.check_at(kind, actor, now_ms())
    }

    fn check_at(&self, kind: EventKind, actor: &str, now: u64) -> bool {
        let (max, window) = kind.limit();
        let window_ms = window.as_millis() as u64;

        match self.windows.entry((kind, actor.to_string())) {
            Entry::Vacant(slot) => {
                slot.insert(Window {
                    count: 1,
                    reset_at: now + window_ms,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let state = slot.get_mut();
                if now >= state.reset_at {
                    *state = Window {
                        count: 1,
                        reset_at: now + window_ms,
                    };
                    true
                } else if state.count < max {
                    state.count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Number of live windows (diagnostics only).
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}
