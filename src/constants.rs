//! Application-wide constants for perpetua.
//!
//! This module centralizes magic numbers and protocol constants so every
//! component agrees on timings, priorities and wire limits. Constants are
//! grouped by domain.
//!
//! # Categories
//!
//! - **Identity**: application and service names
//! - **Wire**: frame limits and chunking
//! - **Timing**: heartbeats, guards, batching, reconnection
//! - **Priorities**: send-queue ordering

use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

/// Application name, used for the mDNS service type, the daemon socket
/// path and the configuration directory.
pub const APP_NAME: &str = "perpetua";

/// Crate version, surfaced by `status` and the CLI `--version` flag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// mDNS service type advertised by servers and browsed by clients.
pub const MDNS_SERVICE_TYPE: &str = "_perpetua._tcp.local.";

/// Length of the discovery UID (hex chars of the bind-IP hash).
pub const DISCOVERY_UID_LEN: usize = 48;

// ============================================================================
// Wire
// ============================================================================

/// Per-link cap on an encoded message body; larger messages are chunked.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Raw bytes read from a file per `file_chunk` before compression.
pub const FILE_CHUNK_SIZE: usize = 8 * 1024;

/// Default server listen port.
pub const DEFAULT_SERVER_PORT: u16 = 5001;

/// Send-queue capacity; excess messages are dropped with a warning
/// rather than letting a dead link grow the heap without bound.
pub const SEND_QUEUE_LIMIT: usize = 4096;

// ============================================================================
// Timing
// ============================================================================

/// Idle interval after which a connection gets a heartbeat probe.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Upper bound on a screen transition; the securer force-clears the
/// blocked flag if the warp has not completed by then.
pub const TRANSITION_GUARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between client reconnection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How long a client browses mDNS before reporting the result set.
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(5);

/// Mouse batch flush: at this many buffered events, or on the interval.
pub const MOUSE_BATCH_MAX: usize = 10;
pub const MOUSE_BATCH_INTERVAL: Duration = Duration::from_millis(20);

/// Keyboard batch flush: at this many buffered events, or on the interval.
pub const KEYBOARD_BATCH_MAX: usize = 7;
pub const KEYBOARD_BATCH_INTERVAL: Duration = Duration::from_millis(10);

/// File-size stall detection: the writer polls the on-disk size this many
/// times, once per interval, after `file_end` before giving up.
pub const FILE_STALL_POLLS: u32 = 20;
pub const FILE_STALL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between acknowledging `shutdown` and actually stopping, so the
/// response has time to flush.
pub const SHUTDOWN_ACK_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Priorities (lower = more urgent)
// ============================================================================

pub const PRIORITY_SCREEN_NOTIFICATION: u8 = 1;
pub const PRIORITY_CLIPBOARD: u8 = 2;
pub const PRIORITY_KEYBOARD: u8 = 3;
pub const PRIORITY_MOUSE: u8 = 4;
pub const PRIORITY_FILE: u8 = 5;

// ============================================================================
// Geometry
// ============================================================================

/// Edge threshold (px) inside which cursor motion counts as an edge hit.
pub const DEFAULT_SCREEN_THRESHOLD: i32 = 10;

/// Safe inset (px) past the threshold used when warping the cursor back
/// from an edge, so the warp itself cannot re-trigger the edge.
pub const WARP_SAFE_INSET: i32 = 10;
