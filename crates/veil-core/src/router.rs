//! The relay router.
//!
//! Central dispatch: one operation per inbound event kind. Every operation
//! is fire-and-forget: there is no request/response contract across
//! identities, only one-way emission plus optional immediate replies to the
//! sender. Once an event passes the rate limiter it runs to completion; no
//! operation waits on another identity.

use crate::limiter::{EventKind, RateLimiter};
use crate::now_ms;
use crate::registry::{Registry, User};
use crate::route_cache::RouteCache;
use crate::wire::{ConnectionId, Target, Wire};
use std::sync::Arc;
use tracing::{debug, info, warn};
use veil_protocol::{
    Ack, AckPayload, ClientEvent, Envelope, GroupBody, GroupCreate, RelayBlob, ServerEvent,
};

/// The presence-and-relay engine.
///
/// Owns the registry, limiter, and route cache; emits through the [`Wire`]
/// seam. One instance per process, constructed at startup and shared by all
/// connection tasks.
pub struct Relay {
    registry: Registry,
    limiter: RateLimiter,
    routes: RouteCache,
    wire: Arc<dyn Wire>,
    privacy_mode: bool,
}

impl Relay {
    /// Create a relay emitting through the given wire.
    #[must_use]
    pub fn new(wire: Arc<dyn Wire>, privacy_mode: bool) -> Self {
        info!(privacy_mode, "Creating relay");
        Self {
            registry: Registry::new(),
            limiter: RateLimiter::new(),
            routes: RouteCache::new(),
            wire,
            privacy_mode,
        }
    }

    /// The presence registry (read views and tests).
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The route cache (periodic sweep and tests).
    #[must_use]
    pub fn routes(&self) -> &RouteCache {
        &self.routes
    }

    /// Dispatch one inbound event from a connection.
    pub fn handle_event(&self, conn: &ConnectionId, event: ClientEvent) {
        match event {
            ClientEvent::Register {
                user_id,
                public_key,
            } => self.on_register(conn, user_id, public_key),
            ClientEvent::MessageSend(envelope) => self.on_message_send(conn, envelope),
            ClientEvent::MessageAck(payload) => self.on_ack(payload),
            ClientEvent::TypingStart { to } => self.on_typing(conn, &to, true),
            ClientEvent::TypingStop { to } => self.on_typing(conn, &to, false),
            ClientEvent::PresenceQuery => self.on_presence_query(conn),
            ClientEvent::PeerDiscover {
                user_id,
                public_key,
                timestamp,
            } => self.on_peer_discover(conn, user_id, public_key, timestamp),
            ClientEvent::KeyExchange {
                to,
                public_key,
                qr_data,
            } => self.on_key_exchange(conn, &to, public_key, qr_data),
            ClientEvent::CallOffer { to, offer } => {
                self.relay_call(conn, &to, |from| ServerEvent::CallOffer { from, offer });
            }
            ClientEvent::CallAnswer { to, answer } => {
                self.relay_call(conn, &to, |from| ServerEvent::CallAnswer { from, answer });
            }
            ClientEvent::CallIce { to, candidate } => {
                self.relay_call(conn, &to, |from| ServerEvent::CallIce { from, candidate });
            }
            ClientEvent::CallHangup { to } => {
                self.relay_call(conn, &to, |from| ServerEvent::CallHangup { from });
            }
            ClientEvent::GroupCreate(group) => self.on_group_create(conn, group),
            ClientEvent::GroupInvite {
                group_id,
                user_id,
                added_by,
            } => self.on_group_invite(conn, group_id, user_id, added_by),
            ClientEvent::GroupMessage(body) => self.on_group_message(conn, body),
            ClientEvent::GroupLeave { group_id, user_id } => {
                self.on_group_leave(conn, group_id, user_id);
            }
            ClientEvent::FileChunk(blob) => {
                self.relay_blob(conn, EventKind::FileChunk, blob, ServerEvent::FileReceive);
            }
            ClientEvent::FileComplete(blob) => {
                self.relay_blob(conn, EventKind::Other, blob, ServerEvent::FileTransferComplete);
            }
            ClientEvent::VoiceClip(blob) => {
                self.relay_blob(conn, EventKind::Other, blob, ServerEvent::VoiceReceive);
            }
            ClientEvent::SelfDestruct {
                contact_id,
                message_id,
                user_id,
            } => self.on_self_destruct(conn, contact_id, message_id, user_id),
            ClientEvent::SyncRequest { .. } => self.on_sync_request(conn),
        }
    }

    /// A connection closed; drop the identity it was carrying, if any.
    ///
    /// Only the *current* handle evicts the entry; a stale disconnect
    /// racing a reconnect resolves to no identity and does nothing.
    pub fn handle_disconnect(&self, conn: &ConnectionId) {
        let Some(user) = self.registry.find_by_connection(conn) else {
            debug!(connection = %conn, "Disconnect of unregistered connection");
            return;
        };

        self.registry.remove(&user.id);
        self.wire
            .broadcast_except(conn, ServerEvent::UserOffline { user_id: user.id.clone() });
        info!(user = %user.id, "User disconnected");
    }

    fn on_register(&self, conn: &ConnectionId, user_id: String, public_key: String) {
        if !self.limiter.check(EventKind::Register, &user_id) {
            warn!(user = %user_id, "Registration rate-limited");
            self.reply(conn, ServerEvent::rate_limited("register"));
            return;
        }

        self.registry
            .register(user_id.clone(), public_key.clone(), conn.clone());
        // The identity channel outlives handle churn; routing prefers it.
        self.wire.join(conn, &user_id);

        self.reply(
            conn,
            ServerEvent::Registered {
                success: true,
                user_id: user_id.clone(),
                timestamp: now_ms(),
            },
        );
        self.wire.broadcast_except(
            conn,
            ServerEvent::UserOnline {
                user_id: user_id.clone(),
                public_key,
            },
        );
        info!(user = %user_id, "User registered");
    }

    fn on_message_send(&self, conn: &ConnectionId, envelope: Envelope) {
        if !self.limiter.check(EventKind::MessageSend, &envelope.from) {
            self.reply(conn, ServerEvent::rate_limited("message:send"));
            return;
        }

        self.registry.touch(&envelope.from);

        let Some(recipient) = self.registry.get(&envelope.to) else {
            debug!(from = %envelope.from, to = %envelope.to, "Recipient not found");
            self.reply(conn, ServerEvent::recipient_not_found(envelope.to));
            return;
        };

        let message_id = envelope.idempotency_key();
        self.routes.remember(
            message_id.clone(),
            envelope.from.clone(),
            conn.clone(),
            envelope.to.clone(),
        );

        let target = self.resolve_target(&recipient);
        let to = envelope.to.clone();
        debug!(from = %envelope.from, to = %to, ?target, "Relaying message");

        self.wire
            .emit_to(&target, ServerEvent::MessageReceive(envelope.into()));
        self.reply(
            conn,
            ServerEvent::MessageDelivered {
                message_id,
                to,
                timestamp: now_ms(),
            },
        );
    }

    fn on_ack(&self, payload: AckPayload) {
        let Some(ack) = payload.normalize() else {
            debug!("Dropping acknowledgement with missing routing fields");
            return;
        };

        // Silent on rejection: throttling acks must not become a side
        // channel, and their loss only affects optimistic UI state.
        if !self.limiter.check(EventKind::Ack, &ack.from) {
            return;
        }

        let Some(target) = self.resolve_ack_target(&ack) else {
            debug!(message = %ack.message_id, to = %ack.to, "Acknowledgement unroutable, dropped");
            return;
        };

        self.wire.emit_to(&target, ServerEvent::AckRelay(ack));
    }

    fn on_typing(&self, conn: &ConnectionId, to: &str, is_typing: bool) {
        let Some(sender) = self.registry.find_by_connection(conn) else {
            return;
        };
        if !self.limiter.check(EventKind::Typing, &sender.id) {
            return;
        }
        let Some(recipient) = self.registry.get(to) else {
            return;
        };

        self.wire.emit_to(
            &self.resolve_target(&recipient),
            ServerEvent::TypingIndicator {
                from: sender.id,
                is_typing,
            },
        );
    }

    fn on_presence_query(&self, conn: &ConnectionId) {
        if !self.limiter.check(EventKind::Other, &self.actor_for(conn)) {
            return;
        }

        let requester = self.registry.find_by_connection(conn).map(|u| u.id);
        let users = self
            .registry
            .snapshot(requester.as_deref(), !self.privacy_mode);
        self.reply(conn, ServerEvent::PresenceList { users });
    }

    fn on_peer_discover(
        &self,
        conn: &ConnectionId,
        user_id: String,
        public_key: String,
        timestamp: u64,
    ) {
        if !self.limiter.check(EventKind::Discovery, &user_id) {
            self.reply(conn, ServerEvent::rate_limited("peer:discover"));
            return;
        }

        self.wire.broadcast_except(
            conn,
            ServerEvent::PeerFound {
                user_id,
                public_key,
                timestamp,
            },
        );
    }

    fn on_key_exchange(&self, conn: &ConnectionId, to: &str, public_key: String, qr_data: String) {
        let Some(sender) = self.registry.find_by_connection(conn) else {
            return;
        };
        if !self.limiter.check(EventKind::KeyExchange, &sender.id) {
            self.reply(conn, ServerEvent::rate_limited("key:exchange"));
            return;
        }
        let Some(recipient) = self.registry.get(to) else {
            return;
        };

        self.wire.emit_to(
            &self.resolve_target(&recipient),
            ServerEvent::KeyReceived {
                from: sender.id,
                public_key,
                qr_data,
                timestamp: now_ms(),
            },
        );
    }

    fn relay_call(
        &self,
        conn: &ConnectionId,
        to: &str,
        make_event: impl FnOnce(String) -> ServerEvent,
    ) {
        let Some(sender) = self.registry.find_by_connection(conn) else {
            return;
        };
        if !self.limiter.check(EventKind::CallSignal, &sender.id) {
            return;
        }
        let Some(recipient) = self.registry.get(to) else {
            return;
        };

        self.wire
            .emit_to(&self.resolve_target(&recipient), make_event(sender.id));
    }

    fn on_group_create(&self, conn: &ConnectionId, group: GroupCreate) {
        if !self.limiter.check(EventKind::GroupCreate, &self.actor_for(conn)) {
            self.reply(conn, ServerEvent::rate_limited("group:create"));
            return;
        }

        // No server-side roster: the named members are notified one by one
        // and the relay forgets the list immediately.
        for member in &group.members {
            if let Some(user) = self.registry.get(member) {
                self.wire.emit_to(
                    &self.resolve_target(&user),
                    ServerEvent::GroupCreated(group.clone()),
                );
            }
        }
    }

    fn on_group_invite(
        &self,
        conn: &ConnectionId,
        group_id: String,
        user_id: String,
        added_by: String,
    ) {
        if !self.limiter.check(EventKind::Other, &self.actor_for(conn)) {
            return;
        }
        let Some(member) = self.registry.get(&user_id) else {
            return;
        };

        self.wire.emit_to(
            &self.resolve_target(&member),
            ServerEvent::GroupInvitation {
                group_id,
                user_id,
                added_by,
            },
        );
    }

    fn on_group_message(&self, conn: &ConnectionId, body: GroupBody) {
        if !self.limiter.check(EventKind::Other, &self.actor_for(conn)) {
            return;
        }

        // Fan out to everyone except the sender; recipients filter by
        // groupId locally. The relay holds no social graph to consult.
        self.wire
            .broadcast_except(conn, ServerEvent::GroupMessage(body));
    }

    fn on_group_leave(&self, conn: &ConnectionId, group_id: String, user_id: String) {
        if !self.limiter.check(EventKind::Other, &self.actor_for(conn)) {
            return;
        }

        self.wire
            .broadcast_except(conn, ServerEvent::GroupMemberLeft { group_id, user_id });
    }

    fn relay_blob(
        &self,
        conn: &ConnectionId,
        kind: EventKind,
        blob: RelayBlob,
        make_event: impl FnOnce(RelayBlob) -> ServerEvent,
    ) {
        if !self.limiter.check(kind, &self.actor_for(conn)) {
            return;
        }
        let Some(recipient) = self.registry.get(&blob.to) else {
            return;
        };

        self.wire
            .emit_to(&self.resolve_target(&recipient), make_event(blob));
    }

    fn on_self_destruct(
        &self,
        conn: &ConnectionId,
        contact_id: String,
        message_id: String,
        user_id: String,
    ) {
        if !self.limiter.check(EventKind::Other, &self.actor_for(conn)) {
            return;
        }

        if let Some(contact) = self.registry.get(&contact_id) {
            self.wire.emit_to(
                &self.resolve_target(&contact),
                ServerEvent::MessageDelete {
                    message_id: message_id.clone(),
                    from: user_id,
                },
            );
        }

        // Destruction is authoritative on the requester's own device;
        // confirm whether or not the contact was reachable.
        self.reply(conn, ServerEvent::MessageDeleted { message_id });
    }

    fn on_sync_request(&self, conn: &ConnectionId) {
        if !self.limiter.check(EventKind::Other, &self.actor_for(conn)) {
            return;
        }

        self.reply(
            conn,
            ServerEvent::SyncResponse {
                timestamp: now_ms(),
                message: "Sync completed (messages stored locally only)".to_string(),
            },
        );
    }

    /// Channel-first, direct-handle fallback.
    ///
    /// A channel can briefly lag a reconnect (old handle detaching, new one
    /// attaching); the direct handle bridges that gap. Channel-first avoids
    /// double delivery to multiple devices sharing one identity.
    fn resolve_target(&self, user: &User) -> Target {
        if self.wire.channel_occupied(&user.id) {
            Target::Channel(user.id.clone())
        } else {
            Target::Connection(user.connection.clone())
        }
    }

    /// Acknowledgement routing: registry first, route-cache rescue second.
    fn resolve_ack_target(&self, ack: &Ack) -> Option<Target> {
        if self.wire.channel_occupied(&ack.to) {
            return Some(Target::Channel(ack.to.clone()));
        }
        if let Some(user) = self.registry.get(&ack.to) {
            return Some(Target::Connection(user.connection));
        }
        self.routes
            .resolve_sender_handle(&ack.message_id)
            .map(Target::Connection)
    }

    /// Rate-limit key for events that carry no sender field: the resolved
    /// identity when the connection is registered, else the handle itself.
    fn actor_for(&self, conn: &ConnectionId) -> String {
        self.registry
            .find_by_connection(conn)
            .map(|u| u.id)
            .unwrap_or_else(|| conn.as_str().to_string())
    }

    fn reply(&self, conn: &ConnectionId, event: ServerEvent) {
        self.wire.emit_to(&Target::Connection(conn.clone()), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// A wire that records everything and lets tests control channel
    /// occupancy directly.
    #[derive(Default)]
    struct RecordingWire {
        emitted: Mutex<Vec<(Target, ServerEvent)>>,
        broadcasts: Mutex<Vec<(ConnectionId, ServerEvent)>>,
        joined: Mutex<Vec<(ConnectionId, String)>>,
        occupied: Mutex<HashSet<String>>,
    }

    impl RecordingWire {
        fn occupy(&self, channel: &str) {
            self.occupied.lock().unwrap().insert(channel.to_string());
        }

        fn emitted(&self) -> Vec<(Target, ServerEvent)> {
            self.emitted.lock().unwrap().clone()
        }

        fn broadcasts(&self) -> Vec<(ConnectionId, ServerEvent)> {
            self.broadcasts.lock().unwrap().clone()
        }

        fn emitted_to(&self, conn: &ConnectionId) -> Vec<ServerEvent> {
            self.emitted()
                .into_iter()
                .filter(|(t, _)| t == &Target::Connection(conn.clone()))
                .map(|(_, e)| e)
                .collect()
        }
    }

    impl Wire for RecordingWire {
        fn emit_to(&self, target: &Target, event: ServerEvent) {
            self.emitted.lock().unwrap().push((target.clone(), event));
        }

        fn broadcast_except(&self, except: &ConnectionId, event: ServerEvent) {
            self.broadcasts.lock().unwrap().push((except.clone(), event));
        }

        fn join(&self, conn: &ConnectionId, channel: &str) {
            self.joined
                .lock()
                .unwrap()
                .push((conn.clone(), channel.to_string()));
        }

        fn channel_occupied(&self, channel: &str) -> bool {
            self.occupied.lock().unwrap().contains(channel)
        }
    }

    fn setup() -> (Arc<RecordingWire>, Relay) {
        let wire = Arc::new(RecordingWire::default());
        let relay = Relay::new(wire.clone(), false);
        (wire, relay)
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn register(relay: &Relay, conn: &ConnectionId, user: &str) {
        relay.handle_event(
            conn,
            ClientEvent::Register {
                user_id: user.to_string(),
                public_key: format!("pk-{user}"),
            },
        );
    }

    fn envelope(from: &str, to: &str, message_id: Option<&str>) -> Envelope {
        Envelope {
            from: from.to_string(),
            to: to.to_string(),
            cipher: "x".to_string(),
            kri_key: "k".to_string(),
            harmony: 34,
            timestamp: 1_700_000_000_000,
            nonce: "n".to_string(),
            message_id: message_id.map(String::from),
            group_id: None,
        }
    }

    fn deliveries(wire: &RecordingWire) -> Vec<(Target, ServerEvent)> {
        wire.emitted()
            .into_iter()
            .filter(|(_, e)| matches!(e, ServerEvent::MessageReceive(_)))
            .collect()
    }

    #[test]
    fn test_register_joins_channel_and_announces() {
        let (wire, relay) = setup();
        let c1 = conn("c1");

        register(&relay, &c1, "alice");

        let joined = wire.joined.lock().unwrap().clone();
        assert_eq!(joined, vec![(c1.clone(), "alice".to_string())]);
        assert!(matches!(
            wire.emitted_to(&c1).as_slice(),
            [ServerEvent::Registered { success: true, .. }]
        ));
        assert!(matches!(
            wire.broadcasts().as_slice(),
            [(_, ServerEvent::UserOnline { .. })]
        ));
        assert_eq!(relay.registry().len(), 1);
    }

    #[test]
    fn test_reregistration_overwrites_handle() {
        let (_, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "alice");

        assert_eq!(relay.registry().len(), 1);
        let user = relay.registry().get("alice").unwrap();
        assert_eq!(user.connection, conn("c2"));
        assert_eq!(user.public_key, "pk-alice");
    }

    #[test]
    fn test_message_delivered_to_direct_handle_exactly_once() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::MessageSend(envelope("alice", "bob", Some("m1"))),
        );

        let delivered = deliveries(&wire);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, Target::Connection(conn("c2")));
        let ServerEvent::MessageReceive(delivery) = &delivered[0].1 else {
            unreachable!();
        };
        assert_eq!(delivery.from, "alice");
        assert_eq!(delivery.cipher, "x");
        assert_eq!(delivery.message_id.as_deref(), Some("m1"));

        // The sender got a confirmation carrying the same message id.
        assert!(wire.emitted_to(&conn("c1")).iter().any(|e| matches!(
            e,
            ServerEvent::MessageDelivered { message_id, .. } if message_id == "m1"
        )));
    }

    #[test]
    fn test_message_prefers_occupied_channel() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");
        wire.occupy("bob");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::MessageSend(envelope("alice", "bob", Some("m1"))),
        );

        let delivered = deliveries(&wire);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, Target::Channel("bob".to_string()));
    }

    #[test]
    fn test_message_to_unknown_recipient_errors_sender_only() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::MessageSend(envelope("alice", "carol", Some("m1"))),
        );

        assert!(deliveries(&wire).is_empty());
        assert!(wire.emitted_to(&conn("c1")).iter().any(|e| matches!(
            e,
            ServerEvent::MessageError { to, .. } if to == "carol"
        )));
        // Nothing was recorded for rescue either.
        assert!(relay.routes().is_empty());
    }

    #[test]
    fn test_message_id_falls_back_to_timestamp() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::MessageSend(envelope("alice", "bob", None)),
        );

        assert!(wire.emitted_to(&conn("c1")).iter().any(|e| matches!(
            e,
            ServerEvent::MessageDelivered { message_id, .. } if message_id == "1700000000000"
        )));
    }

    #[test]
    fn test_register_rate_limit_surfaced() {
        let (wire, relay) = setup();
        let (max, _) = EventKind::Register.limit();

        for _ in 0..max {
            register(&relay, &conn("c1"), "alice");
        }
        let before = wire.emitted_to(&conn("c1")).len();
        register(&relay, &conn("c1"), "alice");

        let after = wire.emitted_to(&conn("c1"));
        assert_eq!(after.len(), before + 1);
        assert!(matches!(
            after.last().unwrap(),
            ServerEvent::RateLimited { event } if event == "register"
        ));
    }

    #[test]
    fn test_ack_relayed_with_legacy_field_names() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        let payload: AckPayload = serde_json::from_value(serde_json::json!({
            "id": "m1", "fromId": "bob", "toId": "alice",
        }))
        .unwrap();
        relay.handle_event(&conn("c2"), ClientEvent::MessageAck(payload));

        let acks: Vec<_> = wire
            .emitted()
            .into_iter()
            .filter(|(_, e)| matches!(e, ServerEvent::AckRelay(_)))
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, Target::Connection(conn("c1")));
    }

    #[test]
    fn test_ack_with_empty_fields_produces_nothing() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");

        let before = wire.emitted().len();
        relay.handle_event(&conn("c1"), ClientEvent::MessageAck(AckPayload::default()));
        assert_eq!(wire.emitted().len(), before);
    }

    #[test]
    fn test_ack_rescued_through_route_cache() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::MessageSend(envelope("alice", "bob", Some("m1"))),
        );
        // Alice's registry entry vanishes (registry momentarily stale).
        relay.registry().remove("alice");

        relay.handle_event(
            &conn("c2"),
            ClientEvent::MessageAck(AckPayload {
                message_id: Some("m1".to_string()),
                from: Some("bob".to_string()),
                to: Some("alice".to_string()),
                timestamp: None,
            }),
        );

        let acks: Vec<_> = wire
            .emitted()
            .into_iter()
            .filter(|(_, e)| matches!(e, ServerEvent::AckRelay(_)))
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, Target::Connection(conn("c1")));
    }

    #[test]
    fn test_unroutable_ack_dropped_silently() {
        let (wire, relay) = setup();
        register(&relay, &conn("c2"), "bob");

        relay.handle_event(
            &conn("c2"),
            ClientEvent::MessageAck(AckPayload {
                message_id: Some("never-sent".to_string()),
                from: Some("bob".to_string()),
                to: Some("alice".to_string()),
                timestamp: None,
            }),
        );

        assert!(!wire
            .emitted()
            .iter()
            .any(|(_, e)| matches!(e, ServerEvent::AckRelay(_))));
    }

    #[test]
    fn test_typing_dropped_when_recipient_offline() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");

        let before = wire.emitted().len();
        relay.handle_event(
            &conn("c1"),
            ClientEvent::TypingStart {
                to: "ghost".to_string(),
            },
        );
        assert_eq!(wire.emitted().len(), before);
    }

    #[test]
    fn test_typing_resolved_by_identity() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::TypingStart {
                to: "bob".to_string(),
            },
        );

        assert!(wire.emitted().iter().any(|(t, e)| {
            t == &Target::Connection(conn("c2"))
                && matches!(e, ServerEvent::TypingIndicator { from, is_typing: true } if from == "alice")
        }));
    }

    #[test]
    fn test_disconnect_removes_owner_and_broadcasts_once() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        relay.handle_disconnect(&conn("c1"));

        assert!(relay.registry().get("alice").is_none());
        assert!(relay.registry().get("bob").is_some());
        let offline: Vec<_> = wire
            .broadcasts()
            .into_iter()
            .filter(|(_, e)| matches!(e, ServerEvent::UserOffline { .. }))
            .collect();
        assert_eq!(offline.len(), 1);

        // A second disconnect of the same handle resolves to nothing.
        relay.handle_disconnect(&conn("c1"));
        assert_eq!(
            wire.broadcasts()
                .iter()
                .filter(|(_, e)| matches!(e, ServerEvent::UserOffline { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_stale_disconnect_keeps_fresh_registration() {
        let (_, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "alice"); // reconnect

        // The old connection finally times out.
        relay.handle_disconnect(&conn("c1"));

        assert!(relay.registry().get("alice").is_some());
    }

    #[test]
    fn test_presence_query_excludes_requester_and_redacts() {
        let wire = Arc::new(RecordingWire::default());
        let relay = Relay::new(wire.clone(), true);
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        relay.handle_event(&conn("c2"), ClientEvent::PresenceQuery);

        let lists: Vec<_> = wire
            .emitted_to(&conn("c2"))
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::PresenceList { users } => Some(users),
                _ => None,
            })
            .collect();
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].len(), 1);
        assert_eq!(lists[0][0].id, "alice");
        assert!(lists[0][0].public_key.is_none());
    }

    #[test]
    fn test_self_destruct_confirms_even_when_contact_offline() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::SelfDestruct {
                contact_id: "ghost".to_string(),
                message_id: "m9".to_string(),
                user_id: "alice".to_string(),
            },
        );

        let to_sender = wire.emitted_to(&conn("c1"));
        assert!(to_sender.iter().any(|e| matches!(
            e,
            ServerEvent::MessageDeleted { message_id } if message_id == "m9"
        )));
        assert!(!wire
            .emitted()
            .iter()
            .any(|(_, e)| matches!(e, ServerEvent::MessageDelete { .. })));
    }

    #[test]
    fn test_group_message_broadcast_excludes_sender() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");

        let body: GroupBody = serde_json::from_value(serde_json::json!({
            "groupId": "g1",
            "cipher": "opaque",
        }))
        .unwrap();
        relay.handle_event(&conn("c1"), ClientEvent::GroupMessage(body));

        let broadcasts = wire.broadcasts();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].0, conn("c1"));
        assert!(matches!(&broadcasts[0].1, ServerEvent::GroupMessage(b) if b.group_id == "g1"));
    }

    #[test]
    fn test_group_create_notifies_registered_members_only() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        let group: GroupCreate = serde_json::from_value(serde_json::json!({
            "groupId": "g1",
            "name": "encrypted",
            "members": ["bob", "ghost"],
        }))
        .unwrap();
        relay.handle_event(&conn("c1"), ClientEvent::GroupCreate(group));

        let created: Vec<_> = wire
            .emitted()
            .into_iter()
            .filter(|(_, e)| matches!(e, ServerEvent::GroupCreated(_)))
            .collect();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, Target::Connection(conn("c2")));
    }

    #[test]
    fn test_call_signal_carries_sender_identity() {
        let (wire, relay) = setup();
        register(&relay, &conn("c1"), "alice");
        register(&relay, &conn("c2"), "bob");

        relay.handle_event(
            &conn("c1"),
            ClientEvent::CallOffer {
                to: "bob".to_string(),
                offer: serde_json::json!({"sdp": "opaque"}),
            },
        );

        assert!(wire.emitted().iter().any(|(t, e)| {
            t == &Target::Connection(conn("c2"))
                && matches!(e, ServerEvent::CallOffer { from, .. } if from == "alice")
        }));
    }
}
