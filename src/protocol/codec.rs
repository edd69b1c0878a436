//! Frame codec for the server/client wire.
//!
//! ```text
//! [u32 BE body length] [b'P'] [b'Y'] [body: length bytes]
//! ```
//!
//! The body is the JSON encoding of a [`Message`]. A framing error on a
//! live stream implies desync; the owning connection must be closed, there
//! is no in-stream recovery.

use crate::error::ProtocolError;

use super::Message;

/// Prefix: 4-byte length plus the two magic bytes.
pub const PREFIX_LEN: usize = 6;

/// Magic bytes following the length.
pub const MAGIC: [u8; 2] = [b'P', b'Y'];

/// Hard cap on a single frame body. The chunker keeps messages well under
/// this; anything larger on the receive side is a protocol violation.
const MAX_FRAME_BODY: usize = 1024 * 1024;

/// Encode a message into a complete wire frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(msg).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let mut buf = Vec::with_capacity(PREFIX_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Byte length of `msg` once framed, without allocating the frame.
pub fn encoded_len(msg: &Message) -> Result<usize, ProtocolError> {
    let body = serde_json::to_vec(msg).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    Ok(PREFIX_LEN + body.len())
}

/// Decode one complete frame. The input must contain the whole frame.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.len() < PREFIX_LEN {
        return Err(ProtocolError::TooShort(data.len()));
    }
    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let magic = [data[4], data[5]];
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let body = &data[PREFIX_LEN..];
    if body.len() < length {
        return Err(ProtocolError::IncompleteBody {
            expected: length,
            got: body.len(),
        });
    }
    serde_json::from_slice(&body[..length]).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Incremental frame decoder for TCP-style partial reads.
///
/// Feed raw bytes, collect complete messages; incomplete tails stay
/// buffered for the next feed. Any error poisons the stream and the
/// caller must drop the connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and extract every complete message.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < PREFIX_LEN {
                break;
            }

            let length =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            let magic = [self.buf[4], self.buf[5]];
            if magic != MAGIC {
                return Err(ProtocolError::BadMagic(magic));
            }
            if length > MAX_FRAME_BODY {
                return Err(ProtocolError::Oversized(length));
            }

            let total = PREFIX_LEN + length;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more bytes
            }

            let msg = serde_json::from_slice(&self.buf[PREFIX_LEN..total])
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
            messages.push(msg);
            self.buf.drain(..total);
        }

        Ok(messages)
    }

    /// True when a partial frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{KeyboardEvent, MessageBuilder};

    fn sample() -> Message {
        MessageBuilder::new("server").keyboard("left", &KeyboardEvent::press("a"))
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = sample();
        let framed = encode(&msg).unwrap();
        assert_eq!(&framed[4..6], b"PY");
        let decoded = decode(&framed).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let framed = encode(&sample()).unwrap();
        let length = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(length, framed.len() - PREFIX_LEN);
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(decode(&[0, 0]), Err(ProtocolError::TooShort(2))));
    }

    #[test]
    fn test_bad_magic() {
        let mut framed = encode(&sample()).unwrap();
        framed[4] = b'X';
        assert!(matches!(decode(&framed), Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn test_incomplete_body() {
        let mut framed = encode(&sample()).unwrap();
        // Lie about the length: claim more body bytes than present.
        let body_len = (framed.len() - PREFIX_LEN + 50) as u32;
        framed[..4].copy_from_slice(&body_len.to_be_bytes());
        assert!(matches!(
            decode(&framed),
            Err(ProtocolError::IncompleteBody { .. })
        ));
    }

    #[test]
    fn test_decoder_multiple_frames() {
        let m1 = sample();
        let m2 = sample();
        let mut wire = encode(&m1).unwrap();
        wire.extend_from_slice(&encode(&m2).unwrap());

        let mut decoder = FrameDecoder::new();
        let msgs = decoder.feed(&wire).unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_decoder_byte_at_a_time() {
        let msg = sample();
        let wire = encode(&msg).unwrap();
        let mut decoder = FrameDecoder::new();
        for (i, b) in wire.iter().enumerate() {
            let out = decoder.feed(std::slice::from_ref(b)).unwrap();
            if i < wire.len() - 1 {
                assert!(out.is_empty());
            } else {
                assert_eq!(out, vec![msg.clone()]);
            }
        }
    }

    #[test]
    fn test_decoder_rejects_bad_magic_midstream() {
        let mut wire = encode(&sample()).unwrap();
        wire[5] = b'Z';
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&wire).is_err());
    }

    #[test]
    fn test_decoder_rejects_oversized() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_BODY as u32 + 1).to_be_bytes());
        wire.extend_from_slice(&MAGIC);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.feed(&wire),
            Err(ProtocolError::Oversized(_))
        ));
    }

    #[test]
    fn test_decoder_garbage_body_is_decode_failure() {
        let body = b"not json at all";
        let mut wire = Vec::new();
        wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
        wire.extend_from_slice(&MAGIC);
        wire.extend_from_slice(body);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.feed(&wire),
            Err(ProtocolError::Decode(_))
        ));
    }
}
