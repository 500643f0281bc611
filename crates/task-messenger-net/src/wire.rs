//! Wire framing: the fixed task header and the owned task message.
//!
//! Every message on the wire is `[header | payload]`. The header is three
//! little-endian `u32`s (`task_id`, `body_size`, `skill_id`) followed by
//! `body_size` opaque payload bytes. Requests carry a nonzero `task_id`;
//! responses echo it. A zero `task_id` on the wire is a protocol violation.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::{Result, TransportError};

/// Size of the encoded [`TaskHeader`] in bytes.
pub const HEADER_SIZE: usize = 12;

/// Default cap on `body_size` (16 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// The fixed message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskHeader {
    /// Monotonic nonzero identifier minted by the producer; `0` is the
    /// invalid sentinel.
    pub task_id: u32,
    /// Payload length in bytes.
    pub body_size: u32,
    /// Opaque dispatch tag.
    pub skill_id: u32,
}

impl TaskHeader {
    /// Create a header.
    pub fn new(task_id: u32, body_size: u32, skill_id: u32) -> Self {
        Self {
            task_id,
            body_size,
            skill_id,
        }
    }

    /// Encode as 12 little-endian bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.task_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.body_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.skill_id.to_le_bytes());
        out
    }

    /// Decode from exactly [`HEADER_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(TransportError::Protocol(format!(
                "header must be {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let word = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[range]);
            u32::from_le_bytes(buf)
        };
        Ok(Self {
            task_id: word(0..4),
            body_size: word(4..8),
            skill_id: word(8..12),
        })
    }
}

/// Protocol-level validation limits applied to every received header.
#[derive(Clone, Copy, Debug)]
pub struct ProtocolLimits {
    /// Maximum accepted `body_size` in bytes.
    pub max_body_size: u32,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ProtocolLimits {
    /// Validate a received header against the framing rules.
    pub fn check(&self, header: &TaskHeader) -> Result<()> {
        if header.task_id == 0 {
            return Err(TransportError::Protocol("task id 0 on the wire".into()));
        }
        if header.body_size > self.max_body_size {
            return Err(TransportError::Protocol(format!(
                "body size {} exceeds limit {}",
                header.body_size, self.max_body_size
            )));
        }
        Ok(())
    }
}

/// An owned task message: header, payload, and creation timestamp.
///
/// Messages are move-only; they travel from a producer through the pool to
/// exactly one session. `wire_bytes` exposes the header and payload as two
/// spans for scatter-gather sending.
#[derive(Debug)]
pub struct TaskMessage {
    header: TaskHeader,
    payload: Bytes,
    created_at: Instant,
}

impl TaskMessage {
    /// Create a message with `skill_id` routing. Fails if the payload does
    /// not fit in a `u32` length.
    pub fn new(task_id: u32, skill_id: u32, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        let body_size = u32::try_from(payload.len()).map_err(|_| {
            TransportError::Protocol(format!("payload of {} bytes exceeds u32", payload.len()))
        })?;
        Ok(Self {
            header: TaskHeader::new(task_id, body_size, skill_id),
            payload,
            created_at: Instant::now(),
        })
    }

    /// The invalid sentinel: `task_id == 0`, empty payload. Handed to
    /// waiters woken by pool shutdown.
    pub fn invalid() -> Self {
        Self {
            header: TaskHeader::new(0, 0, 0),
            payload: Bytes::new(),
            created_at: Instant::now(),
        }
    }

    /// The message header.
    pub fn header(&self) -> &TaskHeader {
        &self.header
    }

    /// The payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message, keeping only the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Header and payload spans for a scatter-gather send.
    pub fn wire_bytes(&self) -> ([u8; HEADER_SIZE], Bytes) {
        (self.header.encode(), self.payload.clone())
    }

    /// Elapsed time since the message was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether this is a real message rather than the shutdown sentinel.
    pub fn is_valid(&self) -> bool {
        self.header.task_id != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = TaskHeader::new(42, 1337, 7);
        let decoded = TaskHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_is_little_endian() {
        let header = TaskHeader::new(1, 0x0102_0304, u32::MAX);
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[4, 3, 2, 1]);
        assert_eq!(&bytes[8..12], &[255, 255, 255, 255]);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(TaskHeader::decode(&[0u8; 11]).is_err());
    }

    #[test]
    fn message_tracks_payload_length() {
        let msg = TaskMessage::new(5, 2, &b"hello"[..]).unwrap();
        assert_eq!(msg.header().body_size, 5);
        assert_eq!(msg.payload().as_ref(), b"hello");
        assert!(msg.is_valid());

        let (header, payload) = msg.wire_bytes();
        assert_eq!(TaskHeader::decode(&header).unwrap(), *msg.header());
        assert_eq!(payload.len() as u32, msg.header().body_size);
    }

    #[test]
    fn sentinel_is_invalid() {
        let sentinel = TaskMessage::invalid();
        assert!(!sentinel.is_valid());
        assert_eq!(sentinel.header().task_id, 0);
        assert!(sentinel.payload().is_empty());
    }

    #[test]
    fn limits_reject_violations() {
        let limits = ProtocolLimits { max_body_size: 64 };
        assert!(limits.check(&TaskHeader::new(1, 64, 0)).is_ok());
        assert!(limits.check(&TaskHeader::new(0, 8, 0)).is_err());
        assert!(limits.check(&TaskHeader::new(1, 65, 0)).is_err());
    }
}
