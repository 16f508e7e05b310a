//! # veil-protocol
//!
//! Wire protocol definitions for the Veil zero-knowledge relay.
//!
//! This crate defines the binary protocol used between Veil clients and the
//! relay: named events, payload shapes, and the length-prefixed MessagePack
//! codec. The relay reads routing fields only (`from`, `to`, `messageId`,
//! `groupId`); ciphertext, wrapped keys, and call/file/voice bodies are
//! opaque and forwarded verbatim.
//!
//! ## Event families
//!
//! - `register` / `registered` / `user:online` / `user:offline` - presence
//! - `message:send` / `message:receive` / `message:delivered` / `message:ack`
//! - `typing:*`, `webrtc:*`, `key:exchange`, `peer:discover`
//! - `group:*`, `file:*`, `voice:send`, `message:self_destruct`
//!
//! ## Example
//!
//! ```rust
//! use veil_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::Register {
//!     user_id: "alice".to_string(),
//!     public_key: "pk-alice".to_string(),
//! };
//!
//! // Encode and decode
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError};
pub use events::{
    Ack, AckPayload, ClientEvent, Delivery, Envelope, GroupBody, GroupCreate, OpaqueBody,
    PresenceEntry, RelayBlob, ServerEvent,
};
