//! Wire message model.
//!
//! Every unit exchanged between server and clients is a [`Message`]: a
//! typed map with routing metadata, carried on the wire as a
//! length-prefixed JSON frame (see [`codec`]). Oversized messages are
//! split into chunk messages sharing one id (see [`chunk`]).
//!
//! Payload shapes for the individual streams (mouse, keyboard, clipboard,
//! commands) live here too, with lossless conversion to and from the
//! payload map so handlers never poke at raw JSON keys.

pub mod chunk;
pub mod codec;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Reserved target meaning "every connected client".
pub const TARGET_ALL: &str = "all";

/// Reserved source/target naming the server itself.
pub const TARGET_SERVER: &str = "server";

/// Message kinds carried on the wire, encoded as integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    Exchange,
    Command,
    Mouse,
    Keyboard,
    Clipboard,
    File,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        match t {
            MessageType::Exchange => 0,
            MessageType::Command => 1,
            MessageType::Mouse => 2,
            MessageType::Keyboard => 3,
            MessageType::Clipboard => 4,
            MessageType::File => 5,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Exchange),
            1 => Ok(Self::Command),
            2 => Ok(Self::Mouse),
            3 => Ok(Self::Keyboard),
            4 => Ok(Self::Clipboard),
            5 => Ok(Self::File),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One logical wire unit.
///
/// Chunk invariant: `is_chunk` implies `message_id`, `chunk_index` and
/// `total_chunks` are all present and `chunk_index < total_chunks`;
/// non-chunk messages carry none of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_type: MessageType,
    /// Seconds since epoch at build time.
    pub timestamp: f64,
    /// Monotonic per sender.
    pub sequence_id: u64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_chunk: bool,
}

impl Message {
    /// Command name for COMMAND messages, if present.
    pub fn command(&self) -> Option<&str> {
        self.payload.get("command").and_then(Value::as_str)
    }

    /// `params` object of a COMMAND message (empty map when absent).
    pub fn command_params(&self) -> Map<String, Value> {
        self.payload
            .get("params")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

/// Current wall-clock time as fractional epoch seconds.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Builds outgoing messages with a monotonically increasing sequence id.
///
/// One builder per sending endpoint; the per-source ordering guarantee of
/// the message bus is keyed on these sequence ids.
#[derive(Debug)]
pub struct MessageBuilder {
    source: String,
    sequence: AtomicU64,
}

impl MessageBuilder {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sequence: AtomicU64::new(0),
        }
    }

    fn next_message(&self, message_type: MessageType, target: &str, payload: Map<String, Value>) -> Message {
        Message {
            message_type,
            timestamp: now_timestamp(),
            sequence_id: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            source: self.source.clone(),
            target: target.to_string(),
            payload,
            message_id: None,
            chunk_index: None,
            total_chunks: None,
            is_chunk: false,
        }
    }

    pub fn mouse(&self, target: &str, event: &MouseEvent) -> Message {
        self.next_message(MessageType::Mouse, target, event.to_payload())
    }

    /// Coalesced batch: the payload is the ordered event list.
    pub fn mouse_batch(&self, target: &str, events: &[MouseEvent]) -> Message {
        let mut payload = Map::new();
        payload.insert(
            "events".into(),
            Value::Array(events.iter().map(|e| Value::Object(e.to_payload())).collect()),
        );
        self.next_message(MessageType::Mouse, target, payload)
    }

    pub fn keyboard(&self, target: &str, event: &KeyboardEvent) -> Message {
        self.next_message(MessageType::Keyboard, target, event.to_payload())
    }

    pub fn keyboard_batch(&self, target: &str, events: &[KeyboardEvent]) -> Message {
        let mut payload = Map::new();
        payload.insert(
            "events".into(),
            Value::Array(events.iter().map(|e| Value::Object(e.to_payload())).collect()),
        );
        self.next_message(MessageType::Keyboard, target, payload)
    }

    pub fn clipboard(&self, target: &str, event: &ClipboardEvent) -> Message {
        self.next_message(MessageType::Clipboard, target, event.to_payload())
    }

    pub fn command(&self, target: &str, command: &str, params: Map<String, Value>) -> Message {
        let mut payload = Map::new();
        payload.insert("command".into(), Value::String(command.to_string()));
        payload.insert("params".into(), Value::Object(params));
        self.next_message(MessageType::Command, target, payload)
    }

    pub fn file(&self, target: &str, payload: Map<String, Value>) -> Message {
        self.next_message(MessageType::File, target, payload)
    }

    /// Handshake request sent by the server right after accept.
    pub fn screen_size_request(&self, target: &str) -> Message {
        let mut payload = Map::new();
        payload.insert("request".into(), Value::String("screen_size".into()));
        self.next_message(MessageType::Exchange, target, payload)
    }

    /// Handshake reply carrying a `WxH` screen size.
    pub fn screen_size_reply(&self, target: &str, width: u32, height: u32) -> Message {
        let mut payload = Map::new();
        payload.insert("screen_size".into(), Value::String(format!("{width}x{height}")));
        self.next_message(MessageType::Exchange, target, payload)
    }

    /// In-band liveness probe; receivers discard it.
    pub fn heartbeat(&self, target: &str) -> Message {
        let mut payload = Map::new();
        payload.insert("heartbeat".into(), Value::Bool(true));
        self.next_message(MessageType::Exchange, target, payload)
    }
}

/// Parses a `WxH` screen-size string from an EXCHANGE payload.
pub fn parse_screen_size(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

// ============================================================================
// Stream payloads
// ============================================================================

/// Mouse actions carried in the `event` payload key.
pub const MOUSE_MOVE: &str = "move";
pub const MOUSE_POSITION: &str = "position";
pub const MOUSE_CLICK: &str = "click";
pub const MOUSE_RCLICK: &str = "rclick";
pub const MOUSE_SCROLL: &str = "scroll";

/// One mouse event. `x`/`y` are normalized to `[0,1]` on the wire; the
/// receiver denormalizes with its own screen size.
#[derive(Debug, Clone, PartialEq)]
pub struct MouseEvent {
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
    pub button: Option<i64>,
    pub event: String,
    pub is_pressed: bool,
}

impl MouseEvent {
    pub fn motion(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            dx: 0.0,
            dy: 0.0,
            button: None,
            event: MOUSE_MOVE.into(),
            is_pressed: false,
        }
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("x".into(), json!(self.x));
        m.insert("y".into(), json!(self.y));
        m.insert("dx".into(), json!(self.dx));
        m.insert("dy".into(), json!(self.dy));
        m.insert("button".into(), self.button.map_or(Value::Null, Value::from));
        m.insert("event".into(), Value::String(self.event.clone()));
        m.insert("is_pressed".into(), Value::Bool(self.is_pressed));
        m
    }

    pub fn from_payload(p: &Map<String, Value>) -> Self {
        Self {
            x: p.get("x").and_then(Value::as_f64).unwrap_or(-1.0),
            y: p.get("y").and_then(Value::as_f64).unwrap_or(-1.0),
            dx: p.get("dx").and_then(Value::as_f64).unwrap_or(0.0),
            dy: p.get("dy").and_then(Value::as_f64).unwrap_or(0.0),
            button: p.get("button").and_then(Value::as_i64),
            event: p
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or(MOUSE_MOVE)
                .to_string(),
            is_pressed: p.get("is_pressed").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// Keyboard actions carried in the `event` payload key.
pub const KEY_PRESS: &str = "press";
pub const KEY_RELEASE: &str = "release";

#[derive(Debug, Clone, PartialEq)]
pub struct KeyboardEvent {
    pub key: String,
    pub event: String,
}

impl KeyboardEvent {
    pub fn press(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            event: KEY_PRESS.into(),
        }
    }

    pub fn release(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            event: KEY_RELEASE.into(),
        }
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("key".into(), Value::String(self.key.clone()));
        m.insert("event".into(), Value::String(self.event.clone()));
        m
    }

    pub fn from_payload(p: &Map<String, Value>) -> Self {
        Self {
            key: p.get("key").and_then(Value::as_str).unwrap_or_default().to_string(),
            event: p
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or(KEY_PRESS)
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClipboardEvent {
    pub content: String,
    pub content_type: String,
}

impl ClipboardEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: "text".into(),
        }
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("content".into(), Value::String(self.content.clone()));
        m.insert("content_type".into(), Value::String(self.content_type.clone()));
        m
    }

    pub fn from_payload(p: &Map<String, Value>) -> Self {
        Self {
            content: p.get("content").and_then(Value::as_str).unwrap_or_default().to_string(),
            content_type: p
                .get("content_type")
                .and_then(Value::as_str)
                .unwrap_or("text")
                .to_string(),
        }
    }
}

// ============================================================================
// Command names
// ============================================================================

pub const CMD_CROSS_SCREEN: &str = "cross_screen";
pub const CMD_RETURN: &str = "return";
pub const CMD_DISCONNECT: &str = "disconnect";
pub const CMD_FILE_REQUEST: &str = "file_request";
pub const CMD_FILE_COPIED: &str = "file_copied";
pub const CMD_FILE_START: &str = "file_start";
pub const CMD_FILE_CHUNK: &str = "file_chunk";
pub const CMD_FILE_END: &str = "file_end";

/// True for COMMAND messages that belong to the file stream.
pub fn is_file_command(command: &str) -> bool {
    matches!(
        command,
        CMD_FILE_REQUEST | CMD_FILE_COPIED | CMD_FILE_START | CMD_FILE_CHUNK | CMD_FILE_END
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for t in [
            MessageType::Exchange,
            MessageType::Command,
            MessageType::Mouse,
            MessageType::Keyboard,
            MessageType::Clipboard,
            MessageType::File,
        ] {
            let v: u8 = t.into();
            assert_eq!(MessageType::try_from(v).unwrap(), t);
        }
        assert!(MessageType::try_from(42).is_err());
    }

    #[test]
    fn test_builder_sequence_increments() {
        let b = MessageBuilder::new("server");
        let m1 = b.keyboard("left", &KeyboardEvent::press("space"));
        let m2 = b.keyboard("left", &KeyboardEvent::release("space"));
        assert_eq!(m1.sequence_id, 1);
        assert_eq!(m2.sequence_id, 2);
        assert_eq!(m1.source, "server");
    }

    #[test]
    fn test_mouse_payload_roundtrip() {
        let e = MouseEvent {
            x: 0.25,
            y: 0.75,
            dx: 0.0,
            dy: -1.0,
            button: Some(1),
            event: MOUSE_SCROLL.into(),
            is_pressed: false,
        };
        assert_eq!(MouseEvent::from_payload(&e.to_payload()), e);
    }

    #[test]
    fn test_command_accessors() {
        let b = MessageBuilder::new("client-left");
        let mut params = Map::new();
        params.insert("direction".into(), Value::String("left".into()));
        let m = b.command(TARGET_SERVER, CMD_RETURN, params);
        assert_eq!(m.command(), Some(CMD_RETURN));
        assert_eq!(
            m.command_params().get("direction").and_then(Value::as_str),
            Some("left")
        );
    }

    #[test]
    fn test_parse_screen_size() {
        assert_eq!(parse_screen_size("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_screen_size("800 x 600"), Some((800, 600)));
        assert_eq!(parse_screen_size("garbage"), None);
    }

    #[test]
    fn test_file_command_classification() {
        assert!(is_file_command(CMD_FILE_CHUNK));
        assert!(!is_file_command(CMD_CROSS_SCREEN));
    }
}
