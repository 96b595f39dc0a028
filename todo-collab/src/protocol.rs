//! Binary sync protocol spoken between replicas and the host.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Handshake:
//! ```text
//! client                         host
//!   │── Hello(PeerInfo) ──────────►│
//!   │── SyncStep1(client sv) ─────►│
//!   │◄──────── SyncStep2(diff) ────│
//!   │◄──────── SyncStep1(host sv) ─│
//!   │── SyncStep2(diff) ──────────►│  (fanned out as Update)
//!   │── Update ... ───────────────►│
//! ```
//!
//! The relay never looks inside these frames; only the host and the sync
//! client decode them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer introduces itself; also relayed to other peers as "joined"
    Hello = 1,
    /// Yrs state vector
    SyncStep1 = 2,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 3,
    /// Incremental Yrs update
    Update = 4,
    PeerLeft = 5,
    Ping = 6,
    Pong = 7,
}

/// Peer identity announced in `Hello`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    /// User id (e.g. `anon3f`)
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Peer id the host signs its own messages with.
pub const HOST_PEER_ID: Uuid = Uuid::nil();

/// One wire frame. Bincode-encoded; the payload meaning depends on
/// `msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Sender-local sequence number, for diagnostics
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            clock,
            payload,
        }
    }

    /// `Hello` carrying the bincode-encoded [`PeerInfo`].
    pub fn hello(info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Hello, info.peer_id, 0, payload))
    }

    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, 0, diff)
    }

    pub fn update(peer_id: Uuid, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, clock, yrs_update)
    }

    pub fn peer_left(peer_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the `Hello` payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Hello {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Wire and connection errors shared by the client, host and relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::update(peer, 42, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_hello_carries_peer_info() {
        let info = PeerInfo::new("anon1a");
        let msg = SyncMessage::hello(&info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Hello);
        assert_eq!(decoded.peer_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_peer_info_wrong_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.peer_info(),
            Err(ProtocolError::InvalidMessageType(MessageType::Ping))
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_update_header_is_small() {
        let msg = SyncMessage::update(Uuid::new_v4(), 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 100,
            "encoded size {} too large for 50-byte update",
            encoded.len()
        );
    }

    #[test]
    fn test_large_update() {
        let payload = vec![42u8; 65536];
        let msg = SyncMessage::update(HOST_PEER_ID, 999, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.peer_id, HOST_PEER_ID);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Hello as u8, 1);
        assert_eq!(MessageType::SyncStep1 as u8, 2);
        assert_eq!(MessageType::SyncStep2 as u8, 3);
        assert_eq!(MessageType::Update as u8, 4);
        assert_eq!(MessageType::PeerLeft as u8, 5);
        assert_eq!(MessageType::Ping as u8, 6);
        assert_eq!(MessageType::Pong as u8, 7);
    }
}
