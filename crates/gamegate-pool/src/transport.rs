//! Ingress framing
//!
//! ```text
//! +----------------+------------------+-----------------+
//! | length: u32 BE | message_id: u32  | payload ...     |
//! +----------------+------------------+-----------------+
//! ```
//!
//! `length` counts the message id and payload. Business payloads carry a small
//! header in front of the opaque body:
//!
//! ```text
//! +-----------+----------------+-----------------+---------+--------+
//! | flags: u8 | sequence: u32  | key_len: u16 BE | key ... | body   |
//! +-----------+----------------+-----------------+---------+--------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gamegate_core::error::{GatewayError, Result, TransportError};
use gamegate_core::types::{Envelope, Priority};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

const LENGTH_BYTES: usize = 4;
const ID_BYTES: usize = 4;

/// Codec for `{message_id, payload}` envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_bytes: usize,
}

impl EnvelopeCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        if src.len() < LENGTH_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            }
            .into());
        }
        if len < ID_BYTES {
            return Err(TransportError::malformed(format!("frame length {} below header size", len)).into());
        }
        if src.len() < LENGTH_BYTES + len {
            src.reserve(LENGTH_BYTES + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_BYTES);
        let message_id = src.get_u32();
        let payload = src.split_to(len - ID_BYTES).freeze();
        Ok(Some(Envelope::new(message_id, payload)))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let len = ID_BYTES + item.payload.len();
        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_bytes,
            }
            .into());
        }
        dst.reserve(LENGTH_BYTES + len);
        dst.put_u32(len as u32);
        dst.put_u32(item.message_id);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

/// Frames an ingress byte stream, starting from a (possibly recycled) read buffer.
pub fn framed<T>(io: T, max_frame_bytes: usize, buffer: BytesMut) -> Framed<T, EnvelopeCodec>
where
    T: AsyncRead + AsyncWrite,
{
    let mut parts = tokio_util::codec::FramedParts::new::<Envelope>(io, EnvelopeCodec::new(max_frame_bytes));
    parts.read_buf = buffer;
    Framed::from_parts(parts)
}

/// Business header flag: client wants an immediate forward-ack
pub const FLAG_ACK: u8 = 0b0000_0001;
/// Business header flag: raise to CRITICAL
pub const FLAG_CRITICAL: u8 = 0b0000_0010;

const HEADER_BYTES: usize = 1 + 4 + 2;

/// Decoded business payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessPayload {
    pub flags: u8,
    /// Client sequence number; 0 disables deduplication
    pub sequence: u32,
    /// Routing key; empty means "route by identity"
    pub routing_key: String,
    pub body: Bytes,
}

impl BusinessPayload {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            flags: 0,
            sequence: 0,
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn wants_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_critical(&self) -> bool {
        self.flags & FLAG_CRITICAL != 0
    }

    pub fn parse(payload: &Bytes) -> Result<Self> {
        if payload.len() < HEADER_BYTES {
            return Err(TransportError::malformed("business payload shorter than header").into());
        }
        let mut buf = payload.clone();
        let flags = buf.get_u8();
        let sequence = buf.get_u32();
        let key_len = buf.get_u16() as usize;
        if buf.len() < key_len {
            return Err(TransportError::malformed(format!(
                "routing key length {} exceeds payload",
                key_len
            ))
            .into());
        }
        let key = buf.split_to(key_len);
        let routing_key = std::str::from_utf8(&key)
            .map_err(|_| TransportError::malformed("routing key is not UTF-8"))?
            .to_string();

        Ok(Self {
            flags,
            sequence,
            routing_key,
            body: buf,
        })
    }

    /// # Errors
    ///
    /// `MalformedFrame` if the routing key does not fit the u16 length field.
    pub fn encode(&self) -> Result<Bytes> {
        let key = self.routing_key.as_bytes();
        let key_len = u16::try_from(key.len()).map_err(|_| {
            TransportError::malformed(format!("routing key of {} bytes exceeds {}", key.len(), u16::MAX))
        })?;
        let mut buf = BytesMut::with_capacity(HEADER_BYTES + key.len() + self.body.len());
        buf.put_u8(self.flags);
        buf.put_u32(self.sequence);
        buf.put_u16(key_len);
        buf.extend_from_slice(key);
        buf.extend_from_slice(&self.body);
        Ok(buf.freeze())
    }
}

/// Priority of a business message: 3000..=4999 are HIGH, the critical flag
/// raises anything to CRITICAL, everything else is NORMAL.
pub fn priority_for(message_id: u32, flags: u8) -> Priority {
    if flags & FLAG_CRITICAL != 0 {
        Priority::Critical
    } else if (3000..=4999).contains(&message_id) {
        Priority::High
    } else {
        Priority::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::new(1001, Bytes::from_static(b"abc")), &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 4 + 4 + 3);

        let mut partial = buf.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let env = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(env.message_id, 1001);
        assert_eq!(env.payload, Bytes::from_static(b"abc"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = EnvelopeCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_u32(7);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Transport(TransportError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn test_short_length_is_malformed() {
        let mut codec = EnvelopeCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u16(0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_business_payload_layout() {
        let payload = BusinessPayload::new("room-7", Bytes::from_static(b"hi"))
            .with_sequence(42)
            .with_flags(FLAG_ACK);
        let bytes = payload.encode().unwrap();
        assert_eq!(&bytes[..7], &[FLAG_ACK, 0, 0, 0, 42, 0, 6]);

        let parsed = BusinessPayload::parse(&bytes).unwrap();
        assert_eq!(parsed, payload);
        assert!(parsed.wants_ack());
        assert!(!parsed.is_critical());
    }

    #[test]
    fn test_business_payload_rejects_bad_key_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u32(1);
        buf.put_u16(50);
        buf.extend_from_slice(b"short");
        assert!(BusinessPayload::parse(&buf.freeze()).is_err());
    }

    #[test]
    fn test_oversized_routing_key_is_rejected() {
        let key = "k".repeat(u16::MAX as usize + 1);
        let err = BusinessPayload::new(key, Bytes::new()).encode().unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Transport(TransportError::MalformedFrame { .. })
        ));

        let key = "k".repeat(u16::MAX as usize);
        let bytes = BusinessPayload::new(key, Bytes::new()).encode().unwrap();
        assert_eq!(BusinessPayload::parse(&bytes).unwrap().routing_key.len(), u16::MAX as usize);
    }

    #[test]
    fn test_priority_ranges() {
        assert_eq!(priority_for(1500, 0), Priority::Normal);
        assert_eq!(priority_for(3000, 0), Priority::High);
        assert_eq!(priority_for(4999, 0), Priority::High);
        assert_eq!(priority_for(5000, 0), Priority::Normal);
        assert_eq!(priority_for(1500, FLAG_CRITICAL), Priority::Critical);
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = framed(a, 1024, BytesMut::new());
        let mut server = framed(b, 1024, BytesMut::with_capacity(256));

        client
            .send(Envelope::new(2001, Bytes::from_static(b"chat")))
            .await
            .unwrap();
        let env = server.next().await.unwrap().unwrap();
        assert_eq!(env.message_id, 2001);
        assert_eq!(env.payload, Bytes::from_static(b"chat"));
    }
}
