//! Event types for the Veil relay protocol.
//!
//! Every frame on the wire is a named event. Inbound events come from
//! clients ([`ClientEvent`]), outbound events are emitted by the relay
//! ([`ServerEvent`]). Payload field names are camelCase on the wire and are
//! part of the contract; the relay reads routing fields only and forwards
//! everything else verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque passthrough map for payload fields the relay never interprets.
pub type OpaqueBody = serde_json::Map<String, Value>;

/// An encrypted envelope submitted for relay.
///
/// The relay reads `from`, `to`, `messageId` and `groupId`. `cipher` and
/// `kriKey` are ciphertext and a wrapped key the server cannot open;
/// `harmony` is a client-side integrity value forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub cipher: String,
    #[serde(rename = "kriKey")]
    pub kri_key: String,
    pub harmony: i64,
    pub timestamp: u64,
    pub nonce: String,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl Envelope {
    /// The caller-supplied idempotency key, falling back to the message
    /// timestamp when the client sent none.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match &self.message_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.timestamp.to_string(),
        }
    }
}

/// An envelope as delivered to the recipient (`to` is dropped on forward).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub from: String,
    pub cipher: String,
    #[serde(rename = "kriKey")]
    pub kri_key: String,
    pub harmony: i64,
    pub timestamp: u64,
    pub nonce: String,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl From<Envelope> for Delivery {
    fn from(env: Envelope) -> Self {
        Self {
            from: env.from,
            cipher: env.cipher,
            kri_key: env.kri_key,
            harmony: env.harmony,
            timestamp: env.timestamp,
            nonce: env.nonce,
            message_id: env.message_id,
            group_id: env.group_id,
        }
    }
}

/// Raw acknowledgement payload as received from the wire.
///
/// Two historical field-naming conventions are in the wild
/// (`messageId`/`from`/`to` and `id`/`fromId`/`toId`); both are accepted
/// here and folded into [`Ack`] exactly once at the boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(rename = "messageId", alias = "id", default)]
    pub message_id: Option<String>,
    #[serde(alias = "fromId", default)]
    pub from: Option<String>,
    #[serde(alias = "toId", default)]
    pub to: Option<String>,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl AckPayload {
    /// Normalize into the canonical [`Ack`].
    ///
    /// Returns `None` if `messageId`, `from` or `to` is missing or empty
    /// after trimming; such an acknowledgement produces no emission.
    #[must_use]
    pub fn normalize(self) -> Option<Ack> {
        let field = |v: Option<String>| {
            let v = v?.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        };

        Some(Ack {
            message_id: field(self.message_id)?,
            from: field(self.from)?,
            to: field(self.to)?,
            timestamp: self.timestamp,
        })
    }
}

/// A normalized acknowledgement, relayed to the original sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// One entry of a presence snapshot.
///
/// `publicKey` is omitted entirely when the relay runs in privacy mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: String,
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(rename = "lastSeen")]
    pub last_seen: u64,
}

/// A group-creation announcement; `members` is the only field the relay
/// reads, the rest is forwarded to each member verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupCreate {
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(flatten)]
    pub body: OpaqueBody,
}

/// A group-scoped broadcast body (message or similar). The relay holds no
/// roster; recipients filter by `groupId` locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupBody {
    #[serde(rename = "groupId", default)]
    pub group_id: String,
    #[serde(flatten)]
    pub body: OpaqueBody,
}

/// A recipient-addressed opaque blob (file chunk, transfer notice, voice
/// clip). Only `to` is read; the whole payload is forwarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayBlob {
    #[serde(default)]
    pub to: String,
    #[serde(flatten)]
    pub body: OpaqueBody,
}

/// Events received from clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    /// Announce (or re-announce) a logical identity on this connection.
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    /// Relay an encrypted envelope to another identity.
    #[serde(rename = "message:send")]
    MessageSend(Envelope),

    /// Acknowledge receipt of a message to its original sender.
    #[serde(rename = "message:ack")]
    MessageAck(AckPayload),

    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(alias = "recipientId")]
        to: String,
    },

    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(alias = "recipientId")]
        to: String,
    },

    /// Request the current presence snapshot.
    #[serde(rename = "presence:query")]
    PresenceQuery,

    /// Announce this identity to all other connected peers.
    #[serde(rename = "peer:discover")]
    PeerDiscover {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        timestamp: u64,
    },

    #[serde(rename = "key:exchange")]
    KeyExchange {
        to: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(rename = "qrData", default)]
        qr_data: String,
    },

    #[serde(rename = "webrtc:offer")]
    CallOffer { to: String, offer: Value },

    #[serde(rename = "webrtc:answer")]
    CallAnswer { to: String, answer: Value },

    #[serde(rename = "webrtc:ice")]
    CallIce { to: String, candidate: Value },

    #[serde(rename = "webrtc:hangup")]
    CallHangup { to: String },

    #[serde(rename = "group:create")]
    GroupCreate(GroupCreate),

    #[serde(rename = "group:add_member")]
    GroupInvite {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "addedBy")]
        added_by: String,
    },

    #[serde(rename = "group:message")]
    GroupMessage(GroupBody),

    #[serde(rename = "group:leave")]
    GroupLeave {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    #[serde(rename = "file:send")]
    FileChunk(RelayBlob),

    #[serde(rename = "file:complete")]
    FileComplete(RelayBlob),

    #[serde(rename = "voice:send")]
    VoiceClip(RelayBlob),

    /// Instruct a contact to destroy a message on their device.
    #[serde(rename = "message:self_destruct")]
    SelfDestruct {
        #[serde(rename = "contactId")]
        contact_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Legacy sync probe; the relay stores nothing, so the answer is
    /// immediate.
    #[serde(rename = "sync:request")]
    SyncRequest {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "lastSync", default)]
        last_sync: u64,
    },
}

/// Events emitted by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "registered")]
    Registered {
        success: bool,
        #[serde(rename = "userId")]
        user_id: String,
        timestamp: u64,
    },

    #[serde(rename = "user:online")]
    UserOnline {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    #[serde(rename = "user:offline")]
    UserOffline {
        #[serde(rename = "userId")]
        user_id: String,
    },

    #[serde(rename = "message:receive")]
    MessageReceive(Delivery),

    #[serde(rename = "message:delivered")]
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: String,
        to: String,
        timestamp: u64,
    },

    #[serde(rename = "message:error")]
    MessageError { error: String, to: String },

    /// A relayed acknowledgement, delivered to the original sender.
    #[serde(rename = "message:ack")]
    AckRelay(Ack),

    #[serde(rename = "typing:indicator")]
    TypingIndicator {
        from: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },

    #[serde(rename = "presence:list")]
    PresenceList { users: Vec<PresenceEntry> },

    #[serde(rename = "peer:found")]
    PeerFound {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        timestamp: u64,
    },

    #[serde(rename = "key:received")]
    KeyReceived {
        from: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(rename = "qrData")]
        qr_data: String,
        timestamp: u64,
    },

    #[serde(rename = "webrtc:offer")]
    CallOffer { from: String, offer: Value },

    #[serde(rename = "webrtc:answer")]
    CallAnswer { from: String, answer: Value },

    #[serde(rename = "webrtc:ice")]
    CallIce { from: String, candidate: Value },

    #[serde(rename = "webrtc:hangup")]
    CallHangup { from: String },

    #[serde(rename = "group:created")]
    GroupCreated(GroupCreate),

    #[serde(rename = "group:invitation")]
    GroupInvitation {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "addedBy")]
        added_by: String,
    },

    #[serde(rename = "group:message_received")]
    GroupMessage(GroupBody),

    #[serde(rename = "group:member_left")]
    GroupMemberLeft {
        #[serde(rename = "groupId")]
        group_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    #[serde(rename = "file:receive")]
    FileReceive(RelayBlob),

    #[serde(rename = "file:transfer_complete")]
    FileTransferComplete(RelayBlob),

    #[serde(rename = "voice:receive")]
    VoiceReceive(RelayBlob),

    #[serde(rename = "message:delete")]
    MessageDelete {
        #[serde(rename = "messageId")]
        message_id: String,
        from: String,
    },

    #[serde(rename = "message:deleted")]
    MessageDeleted {
        #[serde(rename = "messageId")]
        message_id: String,
    },

    #[serde(rename = "sync:response")]
    SyncResponse { timestamp: u64, message: String },

    /// Throttling rejection, surfaced only for user-visible actions.
    #[serde(rename = "rate:limited")]
    RateLimited {
        #[serde(rename = "limitedEvent")]
        event: String,
    },
}

impl ServerEvent {
    /// Create a rate-limit rejection for the named wire event.
    #[must_use]
    pub fn rate_limited(event: impl Into<String>) -> Self {
        ServerEvent::RateLimited {
            event: event.into(),
        }
    }

    /// Create a recipient-not-found error for a message send.
    #[must_use]
    pub fn recipient_not_found(to: impl Into<String>) -> Self {
        ServerEvent::MessageError {
            error: "Recipient not found".to_string(),
            to: to.into(),
        }
    }
}
