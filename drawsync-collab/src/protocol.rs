//! Binary wire protocol for room traffic.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ opcode   │ payload                                      │
//! │ 1 byte   │ variable (may be empty)                      │
//! └──────────┴──────────────────────────────────────────────┘
//!
//! 0x00 FULL_SYNC        IV(12) || AES-GCM(full state | sync request JSON)
//! 0x01 POINTER          plaintext UTF-8 JSON presence update
//! 0x02 ELEMENTS_UPDATE  IV(12) || AES-GCM(yrs update v1)
//! ```
//!
//! Text frames are reserved for out-of-band control JSON, currently only
//! `{"type":"user_count","count":N}`.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// One-byte message tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Full document state, or a request for it
    FullSync = 0x00,
    /// Ephemeral cursor position
    Pointer = 0x01,
    /// Incremental CRDT delta
    ElementsUpdate = 0x02,
}

impl Opcode {
    pub const ALL: [Opcode; 3] = [Opcode::FullSync, Opcode::Pointer, Opcode::ElementsUpdate];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::FullSync => "FULL_SYNC",
            Opcode::Pointer => "POINTER",
            Opcode::ElementsUpdate => "ELEMENTS_UPDATE",
        }
    }

    /// Whether the payload travels encrypted.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, Opcode::Pointer)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(Opcode::FullSync),
            0x01 => Ok(Opcode::Pointer),
            0x02 => Ok(Opcode::ElementsUpdate),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded frame. Exists only on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Serialize to the binary wire format.
    pub fn pack(&self) -> Vec<u8> {
        pack(self.opcode, &self.payload)
    }
}

/// Frame `payload` behind its opcode byte.
pub fn pack(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(opcode.as_u8());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into opcode and payload.
pub fn unpack(bytes: &[u8]) -> Result<ProtocolMessage, ProtocolError> {
    let (&first, payload) = bytes.split_first().ok_or(ProtocolError::Empty)?;
    let opcode = Opcode::try_from(first)?;
    Ok(ProtocolMessage {
        opcode,
        payload: payload.to_vec(),
    })
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

/// JSON carried (encrypted) inside a `FULL_SYNC` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SyncEnvelope {
    SyncRequest {
        #[serde(
            rename = "stateVector",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        state_vector: Option<String>,
    },
}

/// Request for the document state, sent by a client whose replica is empty.
///
/// The optional state vector lets the responder send only missing history.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncRequest {
    pub state_vector: Option<Vec<u8>>,
}

impl SyncRequest {
    pub fn new(state_vector: Option<Vec<u8>>) -> Self {
        Self { state_vector }
    }

    /// JSON bytes, ready to be encrypted.
    pub fn encode(&self) -> Vec<u8> {
        let envelope = SyncEnvelope::SyncRequest {
            state_vector: self
                .state_vector
                .as_ref()
                .map(|sv| base64::engine::general_purpose::STANDARD.encode(sv)),
        };
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    /// Recognise a decrypted `FULL_SYNC` body as a sync request.
    ///
    /// Returns `None` for anything else (a CRDT state payload).
    pub fn parse(plaintext: &[u8]) -> Option<Self> {
        if plaintext.first() != Some(&b'{') {
            return None;
        }
        let SyncEnvelope::SyncRequest { state_vector } = serde_json::from_slice(plaintext).ok()?;
        let state_vector = match state_vector {
            Some(encoded) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .ok()?,
            ),
            None => None,
        };
        Some(Self { state_vector })
    }
}

/// Out-of-band JSON delivered in text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    UserCount { count: usize },
}

impl ControlMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
            kind: "control",
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let frame = pack(Opcode::ElementsUpdate, &[9, 8, 7]);
        assert_eq!(frame, vec![0x02, 9, 8, 7]);
        assert_eq!(pack(Opcode::FullSync, &[]), vec![0x00]);
    }

    #[test]
    fn test_pack_unpack_roundtrip_all_opcodes() {
        let payloads: [&[u8]; 3] = [b"", b"{\"type\":\"pointer\"}", &[0u8, 255, 1, 2]];
        for opcode in Opcode::ALL {
            for payload in payloads {
                let decoded = unpack(&pack(opcode, payload)).unwrap();
                assert_eq!(decoded.opcode, opcode);
                assert_eq!(decoded.payload, payload);
            }
        }
    }

    #[test]
    fn test_message_pack() {
        let msg = ProtocolMessage::new(Opcode::Pointer, b"{}".to_vec());
        assert_eq!(unpack(&msg.pack()).unwrap(), msg);
    }

    #[test]
    fn test_unpack_empty_frame() {
        assert_eq!(unpack(&[]), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_unpack_unknown_opcode() {
        assert_eq!(unpack(&[0x03, 1, 2]), Err(ProtocolError::UnknownOpcode(0x03)));
        assert_eq!(unpack(&[0xFF]), Err(ProtocolError::UnknownOpcode(0xFF)));
    }

    #[test]
    fn test_zero_length_full_sync_is_valid() {
        let msg = unpack(&[0x00]).unwrap();
        assert_eq!(msg.opcode, Opcode::FullSync);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::FullSync.as_u8(), 0x00);
        assert_eq!(Opcode::Pointer.as_u8(), 0x01);
        assert_eq!(Opcode::ElementsUpdate.as_u8(), 0x02);
        assert!(Opcode::FullSync.is_encrypted());
        assert!(!Opcode::Pointer.is_encrypted());
        assert_eq!(Opcode::ElementsUpdate.to_string(), "ELEMENTS_UPDATE");
    }

    #[test]
    fn test_sync_request_roundtrip() {
        let request = SyncRequest::new(Some(vec![1, 2, 3]));
        let encoded = request.encode();
        assert!(encoded.starts_with(b"{"));
        assert_eq!(SyncRequest::parse(&encoded), Some(request));

        let bare = SyncRequest::default();
        let json = String::from_utf8(bare.encode()).unwrap();
        assert_eq!(json, r#"{"type":"sync_request"}"#);
        assert_eq!(SyncRequest::parse(json.as_bytes()), Some(bare));
    }

    #[test]
    fn test_sync_request_ignores_crdt_payload() {
        assert_eq!(SyncRequest::parse(&[1, 0, 5, 9]), None);
        assert_eq!(SyncRequest::parse(b"{\"type\":\"other\"}"), None);
        assert_eq!(SyncRequest::parse(b""), None);
    }

    #[test]
    fn test_control_message_parse() {
        let msg = ControlMessage::parse(r#"{"type":"user_count","count":3}"#).unwrap();
        assert_eq!(msg, ControlMessage::UserCount { count: 3 });
        assert_eq!(msg.to_json(), r#"{"type":"user_count","count":3}"#);
    }

    #[test]
    fn test_control_message_unknown_type() {
        let err = ControlMessage::parse(r#"{"type":"kick"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { kind: "control", .. }));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ProtocolError::UnknownOpcode(7).to_string(), "unknown opcode 0x07");
        assert_eq!(ProtocolError::Empty.to_string(), "empty frame");
    }
}
