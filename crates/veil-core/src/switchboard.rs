//! In-process switchboard implementing the transport seam.
//!
//! Each attached connection owns an unbounded receiver the connection task
//! drains; channels are plain membership sets. Empty channels are dropped so
//! the channel map tracks live identities, not history.

use crate::wire::{ConnectionId, Target, Wire};
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use veil_protocol::ServerEvent;

/// Connection and channel bookkeeping for a single relay process.
#[derive(Debug, Default)]
pub struct Switchboard {
    /// Outbound queue per attached connection.
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
    /// Channel name to attached connections.
    channels: DashMap<String, DashSet<ConnectionId>>,
    /// Reverse index: connection to the channels it joined.
    memberships: DashMap<ConnectionId, DashSet<String>>,
}

impl Switchboard {
    /// Create an empty switchboard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection, returning the receiver its task should drain.
    pub fn attach(&self, conn: ConnectionId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(conn.clone(), tx);
        debug!(connection = %conn, "Switchboard: attached");
        rx
    }

    /// Detach a connection and remove it from every channel it joined.
    pub fn detach(&self, conn: &ConnectionId) {
        self.connections.remove(conn);

        if let Some((_, channels)) = self.memberships.remove(conn) {
            for channel in channels.iter() {
                if let Some(members) = self.channels.get_mut(channel.as_str()) {
                    members.remove(conn);
                    if members.is_empty() {
                        let name = channel.clone();
                        drop(members);
                        self.channels.remove(&name);
                    }
                }
            }
        }

        debug!(connection = %conn, "Switchboard: detached");
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn send(&self, conn: &ConnectionId, event: ServerEvent) {
        if let Some(tx) = self.connections.get(conn) {
            // A closed receiver means the connection task is mid-teardown.
            let _ = tx.send(event);
        }
    }
}

impl Wire for Switchboard {
    fn emit_to(&self, target: &Target, event: ServerEvent) {
        match target {
            Target::Channel(name) => {
                if let Some(members) = self.channels.get(name) {
                    trace!(channel = %name, members = members.len(), "Switchboard: channel emit");
                    for member in members.iter() {
                        self.send(&member, event.clone());
                    }
                }
            }
            Target::Connection(conn) => self.send(conn, event),
        }
    }

    fn broadcast_except(&self, except: &ConnectionId, event: ServerEvent) {
        for entry in self.connections.iter() {
            if entry.key() != except {
                let _ = entry.value().send(event.clone());
            }
        }
    }

    fn join(&self, conn: &ConnectionId, channel: &str) {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn.clone());
        self.memberships
            .entry(conn.clone())
            .or_default()
            .insert(channel.to_string());
        debug!(connection = %conn, channel = %channel, "Switchboard: joined");
    }

    fn channel_occupied(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .map(|members| !members.is_empty())
            .unwrap_or(false)
    }
}
