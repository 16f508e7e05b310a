//! The presence registry.
//!
//! Authoritative mapping from logical identity to the connection currently
//! carrying it. Registration is an idempotent re-announcement: a second
//! register under the same identity overwrites the connection handle,
//! last writer wins. The registry trusts the claimed identifier; identity
//! authentication is out of scope for a zero-knowledge relay.

use crate::now_ms;
use crate::wire::ConnectionId;
use dashmap::DashMap;
use tracing::debug;
use veil_protocol::PresenceEntry;

/// One currently-connected logical identity.
#[derive(Debug, Clone)]
pub struct User {
    /// Stable client-chosen identity, unique key.
    pub id: String,
    /// The connection currently carrying this identity.
    pub connection: ConnectionId,
    /// Routing-only credential, never interpreted.
    pub public_key: String,
    /// Last registration or activity, ms since epoch.
    pub last_seen: u64,
}

/// Registry of connected identities.
#[derive(Debug, Default)]
pub struct Registry {
    users: DashMap<String, User>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an identity. Always succeeds; re-registration replaces the
    /// connection handle and public key and refreshes `last_seen`.
    pub fn register(
        &self,
        id: impl Into<String>,
        public_key: impl Into<String>,
        connection: ConnectionId,
    ) {
        let id = id.into();
        let user = User {
            id: id.clone(),
            connection,
            public_key: public_key.into(),
            last_seen: now_ms(),
        };
        self.users.insert(id.clone(), user);
        debug!(user = %id, "Registry: registered");
    }

    /// Look up an identity.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|u| u.clone())
    }

    /// Resolve which identity a closing connection was carrying.
    ///
    /// Linear scan over live users: connection handles are not an index,
    /// and the registry only ever holds the current connection count. A
    /// handle already replaced by a reconnect finds nothing, which is what
    /// keeps a stale disconnect from evicting the fresh registration.
    #[must_use]
    pub fn find_by_connection(&self, connection: &ConnectionId) -> Option<User> {
        self.users
            .iter()
            .find(|u| &u.connection == connection)
            .map(|u| u.clone())
    }

    /// Reverse lookup by public key (discovery view).
    #[must_use]
    pub fn find_by_public_key(&self, public_key: &str) -> Option<User> {
        self.users
            .iter()
            .find(|u| u.public_key == public_key)
            .map(|u| u.clone())
    }

    /// Remove an identity, returning the evicted entry.
    pub fn remove(&self, id: &str) -> Option<User> {
        let removed = self.users.remove(id).map(|(_, u)| u);
        if removed.is_some() {
            debug!(user = %id, "Registry: removed");
        }
        removed
    }

    /// Refresh an identity's `last_seen` timestamp.
    pub fn touch(&self, id: &str) {
        if let Some(mut user) = self.users.get_mut(id) {
            user.last_seen = now_ms();
        }
    }

    /// Number of connected identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no identity is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Presence snapshot for discovery and health views.
    ///
    /// Optionally excludes one identity (the requester). With `include_keys`
    /// false (privacy mode) the `publicKey` field is omitted entirely.
    #[must_use]
    pub fn snapshot(&self, filter_out: Option<&str>, include_keys: bool) -> Vec<PresenceEntry> {
        self.users
            .iter()
            .filter(|u| filter_out != Some(u.id.as_str()))
            .map(|u| PresenceEntry {
                id: u.id.clone(),
                public_key: include_keys.then(|| u.public_key.clone()),
                last_seen: u.last_seen,
            })
            .collect()
    }
}
