//! Chunking for messages that exceed the per-link frame cap.
//!
//! The original payload is JSON-encoded, base64'd, and split across `N`
//! chunk messages that share a `message_id` and carry a dense
//! `chunk_index`. Each chunk embeds its slice under `_chunk_data` together
//! with `_original_type`, so a reassembled message restores the exact
//! payload and type of the original. Peers that pre-date this codebase
//! use the same encoding, so the text embedding is kept as-is and parsed
//! strictly.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ProtocolError;

use super::{codec, Message, MessageType};

/// Payload key holding the original message type of a chunked message.
const KEY_ORIGINAL_TYPE: &str = "_original_type";

/// Payload key holding one base64 slice of the original payload.
const KEY_CHUNK_DATA: &str = "_chunk_data";

/// Smallest slice we will ever put in a chunk, no matter the overhead.
const MIN_SLICE: usize = 256;

/// Split `msg` into chunk messages if its framed size exceeds `max_size`.
///
/// Small messages come back unchanged as a single-element vec.
pub fn split(msg: Message, max_size: usize) -> Result<Vec<Message>, ProtocolError> {
    if codec::encoded_len(&msg)? <= max_size {
        return Ok(vec![msg]);
    }

    let payload_json =
        serde_json::to_vec(&msg.payload).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let encoded = BASE64.encode(payload_json);
    let message_id = Uuid::new_v4().simple().to_string();

    // Measure the per-chunk overhead with an empty slice, then size the
    // slices so each chunk frame stays under the cap.
    let template = chunk_template(&msg, &message_id, 0, 1, String::new());
    // A few bytes of headroom cover wider index/total digits than the
    // probe template carried.
    let overhead = codec::encoded_len(&template)? + 16;
    let slice_len = max_size.saturating_sub(overhead).max(MIN_SLICE);

    let total = encoded.len().div_ceil(slice_len) as u32;
    let chunks = encoded
        .as_bytes()
        .chunks(slice_len)
        .enumerate()
        .map(|(i, slice)| {
            // Slices land on base64 character boundaries; always valid UTF-8.
            let data = String::from_utf8_lossy(slice).into_owned();
            chunk_template(&msg, &message_id, i as u32, total, data)
        })
        .collect();

    Ok(chunks)
}

fn chunk_template(
    original: &Message,
    message_id: &str,
    index: u32,
    total: u32,
    data: String,
) -> Message {
    let mut payload = Map::new();
    payload.insert(
        KEY_ORIGINAL_TYPE.into(),
        Value::from(u8::from(original.message_type)),
    );
    payload.insert(KEY_CHUNK_DATA.into(), Value::String(data));

    Message {
        message_type: original.message_type,
        timestamp: original.timestamp,
        sequence_id: original.sequence_id,
        source: original.source.clone(),
        target: original.target.clone(),
        payload,
        message_id: Some(message_id.to_string()),
        chunk_index: Some(index),
        total_chunks: Some(total),
        is_chunk: true,
    }
}

/// Reassemble a complete chunk set back into the original message.
///
/// Order does not matter, but the set must be complete and consistent:
/// one shared `message_id`, one agreed total, dense indices.
pub fn reassemble(chunks: &[Message]) -> Result<Message, ProtocolError> {
    let first = chunks.first().ok_or(ProtocolError::MissingChunks {
        got: 0,
        expected: 1,
    })?;
    let message_id = first.message_id.as_deref().unwrap_or_default();
    let total = first.total_chunks.unwrap_or(0) as usize;

    if chunks.iter().any(|c| c.message_id.as_deref() != Some(message_id)) {
        return Err(ProtocolError::MixedChunkIds);
    }
    if chunks.iter().any(|c| c.total_chunks != first.total_chunks) {
        return Err(ProtocolError::MixedChunkTotals);
    }
    if chunks.len() != total {
        return Err(ProtocolError::MissingChunks {
            got: chunks.len(),
            expected: total,
        });
    }

    let mut ordered: Vec<&Message> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.chunk_index.unwrap_or(u32::MAX));
    for (i, c) in ordered.iter().enumerate() {
        if c.chunk_index != Some(i as u32) {
            return Err(ProtocolError::MissingChunks {
                got: chunks.len(),
                expected: total,
            });
        }
    }

    let mut encoded = String::new();
    for c in &ordered {
        let slice = c
            .payload
            .get(KEY_CHUNK_DATA)
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Decode("chunk without data".into()))?;
        encoded.push_str(slice);
    }

    let payload_json = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| ProtocolError::Decode(format!("chunk base64: {e}")))?;
    let payload: Map<String, Value> = serde_json::from_slice(&payload_json)
        .map_err(|e| ProtocolError::Decode(format!("chunk payload: {e}")))?;

    let original_type = first
        .payload
        .get(KEY_ORIGINAL_TYPE)
        .and_then(Value::as_u64)
        .and_then(|v| MessageType::try_from(v as u8).ok())
        .unwrap_or(first.message_type);

    Ok(Message {
        message_type: original_type,
        timestamp: first.timestamp,
        sequence_id: first.sequence_id,
        source: first.source.clone(),
        target: first.target.clone(),
        payload,
        message_id: None,
        chunk_index: None,
        total_chunks: None,
        is_chunk: false,
    })
}

/// Collects chunks arriving on one connection and yields the reassembled
/// message once a set completes.
///
/// Partial sets die with the connection: a stream that closes with chunks
/// outstanding is a failed reassembly by definition.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<String, Vec<Message>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one incoming message.
    ///
    /// Non-chunks pass through. A chunk is buffered until its set is
    /// complete, then the original message is returned.
    pub fn push(&mut self, msg: Message) -> Result<Option<Message>, ProtocolError> {
        if !msg.is_chunk {
            return Ok(Some(msg));
        }

        let id = msg
            .message_id
            .clone()
            .ok_or_else(|| ProtocolError::Decode("chunk without message id".into()))?;
        let total = msg.total_chunks.unwrap_or(0) as usize;
        let set = self.pending.entry(id.clone()).or_default();
        set.push(msg);

        if set.len() >= total {
            let set = self.pending.remove(&id).unwrap_or_default();
            return reassemble(&set).map(Some);
        }
        Ok(None)
    }

    /// Number of incomplete chunk sets currently buffered.
    pub fn pending_sets(&self) -> usize {
        self.pending.len()
    }
}
