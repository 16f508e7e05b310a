//! The transport seam consumed by the relay.
//!
//! The relay needs exactly four operations from the transport layer: emit an
//! event to a target, broadcast to everyone but one connection, attach a
//! connection to a named channel, and (as a call into the relay rather than
//! out of it) a disconnect notification. Everything else about the transport
//! (handshakes, framing, sockets) stays on the other side of this trait.

use std::fmt;
use veil_protocol::ServerEvent;

/// Unique identifier for a transport connection.
///
/// Replaced on every reconnect; never shown to other clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        Self(format!("conn_{:x}", timestamp))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where an event should be delivered.
///
/// Channel targets reach every connection attached to the named channel;
/// connection targets reach one specific transport connection. The relay
/// prefers channels (stable across reconnects, multi-device capable) and
/// falls back to direct handles when a channel is momentarily unoccupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A named delivery channel, one per registered identity.
    Channel(String),
    /// A specific transport connection.
    Connection(ConnectionId),
}

/// Fire-and-forget event emission.
///
/// All methods enqueue and return; no implementation may block the caller on
/// another identity's I/O. A send to a vanished connection is dropped; the
/// relay is best-effort and callers never observe delivery.
pub trait Wire: Send + Sync {
    /// Emit an event to a channel or a single connection.
    fn emit_to(&self, target: &Target, event: ServerEvent);

    /// Emit an event to every attached connection except one.
    fn broadcast_except(&self, except: &ConnectionId, event: ServerEvent);

    /// Attach a connection to a named channel.
    fn join(&self, conn: &ConnectionId, channel: &str);

    /// Whether a channel currently has at least one attached connection.
    fn channel_occupied(&self, channel: &str) -> bool;
}
