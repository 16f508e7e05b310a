//! Ephemeral memory of in-flight message routes.
//!
//! Used only to rescue acknowledgement delivery when the registry is
//! momentarily stale around a reconnect. Losing an entry degrades one
//! acknowledgement to a best-effort miss; the primary message path never
//! depends on this cache.

use crate::now_ms;
use crate::wire::ConnectionId;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

/// How long a route stays resolvable.
pub const ROUTE_TTL: Duration = Duration::from_secs(600);

/// Entry count past which the insert path prunes expired routes.
pub const MAX_ENTRIES: usize = 5_000;

/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One in-flight message route.
///
/// `sender_id` and `recipient_id` reference identities by value only; a
/// route may outlive the registry entry it points at.
#[derive(Debug, Clone)]
pub struct MessageRoute {
    pub message_id: String,
    pub sender_id: String,
    pub sender_connection: ConnectionId,
    pub recipient_id: String,
    pub created_at: u64,
}

/// Keyed store of recent message routes.
#[derive(Debug, Default)]
pub struct RouteCache {
    routes: DashMap<String, MessageRoute>,
}

impl RouteCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) the route of an accepted message.
    pub fn remember(
        &self,
        message_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_connection: ConnectionId,
        recipient_id: impl Into<String>,
    ) {
        self.remember_at(
            message_id.into(),
            sender_id.into(),
            sender_connection,
            recipient_id.into(),
            now_ms(),
        );
    }

    fn remember_at(
        &self,
        message_id: String,
        sender_id: String,
        sender_connection: ConnectionId,
        recipient_id: String,
        now: u64,
    ) {
        self.routes.insert(
            message_id.clone(),
            MessageRoute {
                message_id,
                sender_id,
                sender_connection,
                recipient_id,
                created_at: now,
            },
        );

        if self.routes.len() > MAX_ENTRIES {
            let dropped = self.sweep_at(now);
            debug!(dropped, size = self.routes.len(), "RouteCache: size-triggered prune");
        }
    }

    /// Rescue lookup: the sender connection of a recent message.
    ///
    /// An entry past its TTL is never returned, even if no sweep has run
    /// yet.
    #[must_use]
    pub fn resolve_sender_handle(&self, message_id: &str) -> Option<ConnectionId> {
        self.resolve_at(message_id, now_ms())
    }

    fn resolve_at(&self, message_id: &str, now: u64) -> Option<ConnectionId> {
        self.routes
            .get(message_id)
            .filter(|route| !expired(route, now))
            .map(|route| route.sender_connection.clone())
    }

    /// Drop every expired route. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(now_ms())
    }

    fn sweep_at(&self, now: u64) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, route| !expired(route, now));
        before - self.routes.len()
    }

    /// Number of cached routes, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the cache holds no routes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn expired(route: &MessageRoute, now: u64) -> bool {
    now.saturating_sub(route.created_at) >= ROUTE_TTL.as_millis() as u64
}
