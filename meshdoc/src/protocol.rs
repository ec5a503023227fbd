//! Binary wire protocol for signaling and peer sync channels.
//!
//! Two pinned frame layouts share one varint codec:
//!
//! ```text
//! broadcast topic   [sender: varstring][kind: 1 byte][kind payload]
//!                   kinds: 0=Announce  1=Acknowledge(recipient)
//!                          2=Signal(recipient + opaque bytes)
//!
//! peer channel      [sender: varstring][type: 1 byte][body]
//!                   types: 0=Sync(frame)  1=Awareness(varbytes delta)
//!                   sync frames: tag varint + varbytes
//!                          0=Step1  1=Step2  2=Update
//! ```
//!
//! Integers are unsigned LEB128 (7 bits per byte, high bit = continuation),
//! strings are varint-length-prefixed UTF-8. Payloads are opaque: update
//! blobs and signal data are never inspected here.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque peer identity. Lexicographic ordering is load-bearing: the
/// smaller id always initiates the direct connection (tie-break).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh process-unique id. Never reused across sessions.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one replicated document. Doubles as the broadcast topic name
/// and the durable-log key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Signaling kind bytes.
const KIND_ANNOUNCE: u8 = 0;
const KIND_ACKNOWLEDGE: u8 = 1;
const KIND_SIGNAL: u8 = 2;

// Peer channel message type bytes.
const MSG_SYNC: u8 = 0;
const MSG_AWARENESS: u8 = 1;

// Sync frame tags (y-protocols values).
const SYNC_STEP1: u64 = 0;
const SYNC_STEP2: u64 = 1;
const SYNC_UPDATE: u64 = 2;

/// Protocol errors. Signaling callers drop these silently; peer-channel
/// callers treat them as a corrupt-peer signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    UnexpectedEof,
    VarIntTooLarge,
    InvalidUtf8,
    UnknownKind(u8),
    UnknownMessageType(u8),
    UnknownSyncTag(u64),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "frame truncated"),
            Self::VarIntTooLarge => write!(f, "varint exceeds 64 bits"),
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Self::UnknownKind(k) => write!(f, "unknown signaling kind {k}"),
            Self::UnknownMessageType(t) => write!(f, "unknown peer message type {t}"),
            Self::UnknownSyncTag(t) => write!(f, "unknown sync frame tag {t}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Append an unsigned LEB128 varint.
pub fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Append a varint-length-prefixed byte slice.
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Append a varint-length-prefixed UTF-8 string.
pub fn write_var_string(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

/// Positional reader over one frame.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(ProtocolError::VarIntTooLarge);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_var_u64()? as usize;
        let end = self.pos.checked_add(len).ok_or(ProtocolError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_string(&mut self) -> Result<&'a str, ProtocolError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Everything after the current position, consumed.
    pub fn take_remaining(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// A message on the per-document broadcast topic.
///
/// Unicast kinds (Acknowledge, Signal) carry a recipient and are ignored by
/// every other receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Announce {
        sender: PeerId,
    },
    Acknowledge {
        sender: PeerId,
        recipient: PeerId,
    },
    Signal {
        sender: PeerId,
        recipient: PeerId,
        payload: Vec<u8>,
    },
}

impl SignalingMessage {
    pub fn sender(&self) -> &PeerId {
        match self {
            Self::Announce { sender }
            | Self::Acknowledge { sender, .. }
            | Self::Signal { sender, .. } => sender,
        }
    }

    /// Recipient of a unicast kind, `None` for Announce.
    pub fn recipient(&self) -> Option<&PeerId> {
        match self {
            Self::Announce { .. } => None,
            Self::Acknowledge { recipient, .. } | Self::Signal { recipient, .. } => {
                Some(recipient)
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Self::Announce { sender } => {
                write_var_string(&mut buf, sender.as_str());
                buf.push(KIND_ANNOUNCE);
            }
            Self::Acknowledge { sender, recipient } => {
                write_var_string(&mut buf, sender.as_str());
                buf.push(KIND_ACKNOWLEDGE);
                write_var_string(&mut buf, recipient.as_str());
            }
            Self::Signal {
                sender,
                recipient,
                payload,
            } => {
                write_var_string(&mut buf, sender.as_str());
                buf.push(KIND_SIGNAL);
                write_var_string(&mut buf, recipient.as_str());
                buf.extend_from_slice(payload);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        let sender = PeerId::new(r.read_var_string()?);
        match r.read_u8()? {
            KIND_ANNOUNCE => Ok(Self::Announce { sender }),
            KIND_ACKNOWLEDGE => {
                let recipient = PeerId::new(r.read_var_string()?);
                Ok(Self::Acknowledge { sender, recipient })
            }
            KIND_SIGNAL => {
                let recipient = PeerId::new(r.read_var_string()?);
                let payload = r.take_remaining().to_vec();
                Ok(Self::Signal {
                    sender,
                    recipient,
                    payload,
                })
            }
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One frame of the two-step sync protocol, or a live update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    /// Compact summary of locally known state (state vector).
    Step1(Vec<u8>),
    /// Reply carrying the updates the step-1 sender is missing.
    Step2(Vec<u8>),
    /// Exactly one update blob, sent after the handshake.
    Update(Vec<u8>),
}

impl SyncFrame {
    fn write(&self, buf: &mut Vec<u8>) {
        let (tag, body) = match self {
            Self::Step1(b) => (SYNC_STEP1, b),
            Self::Step2(b) => (SYNC_STEP2, b),
            Self::Update(b) => (SYNC_UPDATE, b),
        };
        write_var_u64(buf, tag);
        write_var_bytes(buf, body);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let tag = r.read_var_u64()?;
        let body = r.read_var_bytes()?.to_vec();
        match tag {
            SYNC_STEP1 => Ok(Self::Step1(body)),
            SYNC_STEP2 => Ok(Self::Step2(body)),
            SYNC_UPDATE => Ok(Self::Update(body)),
            other => Err(ProtocolError::UnknownSyncTag(other)),
        }
    }
}

/// A message on a direct peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Sync { sender: PeerId, frame: SyncFrame },
    Awareness { sender: PeerId, delta: Vec<u8> },
}

impl PeerMessage {
    pub fn sender(&self) -> &PeerId {
        match self {
            Self::Sync { sender, .. } | Self::Awareness { sender, .. } => sender,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Self::Sync { sender, frame } => {
                write_var_string(&mut buf, sender.as_str());
                buf.push(MSG_SYNC);
                frame.write(&mut buf);
            }
            Self::Awareness { sender, delta } => {
                write_var_string(&mut buf, sender.as_str());
                buf.push(MSG_AWARENESS);
                write_var_bytes(&mut buf, delta);
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        let sender = PeerId::new(r.read_var_string()?);
        match r.read_u8()? {
            MSG_SYNC => Ok(Self::Sync {
                sender,
                frame: SyncFrame::read(&mut r)?,
            }),
            MSG_AWARENESS => Ok(Self::Awareness {
                sender,
                delta: r.read_var_bytes()?.to_vec(),
            }),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_u64_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            let mut r = Reader::new(&buf);
            assert_eq!(r.read_var_u64().unwrap(), value);
        }
    }

    #[test]
    fn test_var_u64_single_byte_boundary() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 127);
        assert_eq!(buf.len(), 1);
        buf.clear();
        write_var_u64(&mut buf, 128);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_var_string_roundtrip() {
        let mut buf = Vec::new();
        write_var_string(&mut buf, "doc/α-β");
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_var_string().unwrap(), "doc/α-β");
    }

    #[test]
    fn test_truncated_frame_errors() {
        let mut buf = Vec::new();
        write_var_string(&mut buf, "peer-1");
        buf.push(KIND_SIGNAL);
        // recipient length says 200 bytes but nothing follows
        write_var_u64(&mut buf, 200);
        assert_eq!(
            SignalingMessage::decode(&buf),
            Err(ProtocolError::UnexpectedEof)
        );
    }

    #[test]
    fn test_announce_roundtrip() {
        let msg = SignalingMessage::Announce {
            sender: PeerId::new("aaa"),
        };
        let decoded = SignalingMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.recipient(), None);
    }

    #[test]
    fn test_acknowledge_roundtrip() {
        let msg = SignalingMessage::Acknowledge {
            sender: PeerId::new("aaa"),
            recipient: PeerId::new("bbb"),
        };
        let decoded = SignalingMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.recipient().unwrap().as_str(), "bbb");
    }

    #[test]
    fn test_signal_payload_is_opaque_tail() {
        let msg = SignalingMessage::Signal {
            sender: PeerId::new("aaa"),
            recipient: PeerId::new("bbb"),
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let decoded = SignalingMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_signaling_kind() {
        let mut buf = Vec::new();
        write_var_string(&mut buf, "peer");
        buf.push(9);
        assert_eq!(
            SignalingMessage::decode(&buf),
            Err(ProtocolError::UnknownKind(9))
        );
    }

    #[test]
    fn test_sync_frame_tags() {
        for (frame, tag) in [
            (SyncFrame::Step1(vec![1]), 0u8),
            (SyncFrame::Step2(vec![2]), 1),
            (SyncFrame::Update(vec![3]), 2),
        ] {
            let msg = PeerMessage::Sync {
                sender: PeerId::new("p"),
                frame,
            };
            let bytes = msg.encode();
            // sender varstring is 2 bytes ("p"), then type byte, then tag
            assert_eq!(bytes[2], MSG_SYNC);
            assert_eq!(bytes[3], tag);
            assert_eq!(PeerMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_awareness_message_roundtrip() {
        let msg = PeerMessage::Awareness {
            sender: PeerId::new("peer-x"),
            delta: vec![7; 40],
        };
        assert_eq!(PeerMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_peer_message_garbage() {
        assert!(PeerMessage::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(PeerMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        assert!(PeerId::new("aaa") < PeerId::new("bbb"));
        assert!(PeerId::new("abc") < PeerId::new("abd"));
        assert!(!(PeerId::new("b") < PeerId::new("aaaa")));
    }

    #[test]
    fn test_generated_peer_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }
}
