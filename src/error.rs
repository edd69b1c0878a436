//! Error taxonomy for the routing core.
//!
//! Each kind maps to one propagation policy:
//!
//! - transient I/O errors let the owning loop retry its next iteration;
//! - peer-closed and protocol errors end the affected connection;
//! - configuration errors fail the lifecycle command with no state change;
//! - resource errors abort the transfer and reset coordinator state;
//! - timeouts clear the blocking state and continue.

use std::io;

/// Errors produced while encoding, decoding or reassembling wire messages.
///
/// Any `ProtocolError` on a live connection is fatal for that connection:
/// framing errors imply desync and there is no in-stream recovery.
#[derive(Debug)]
pub enum ProtocolError {
    /// Fewer bytes than a complete frame prefix.
    TooShort(usize),
    /// Prefix magic bytes were not `P`,`Y`.
    BadMagic([u8; 2]),
    /// The body was shorter than the length prefix promised.
    IncompleteBody { expected: usize, got: usize },
    /// The frame body could not be decoded into a message.
    Decode(String),
    /// A frame exceeded the per-link size cap.
    Oversized(usize),
    /// Chunk reassembly found gaps in the index sequence.
    MissingChunks { got: usize, expected: usize },
    /// Chunks carried more than one message id.
    MixedChunkIds,
    /// Chunks disagreed on the total chunk count.
    MixedChunkTotals,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(n) => write!(f, "frame too short: {n} bytes"),
            Self::BadMagic(m) => write!(f, "not a protocol message: magic {:02x}{:02x}", m[0], m[1]),
            Self::IncompleteBody { expected, got } => {
                write!(f, "incomplete message: expected {expected} body bytes, got {got}")
            }
            Self::Decode(msg) => write!(f, "decode failure: {msg}"),
            Self::Oversized(n) => write!(f, "frame too large: {n} bytes"),
            Self::MissingChunks { got, expected } => {
                write!(f, "missing chunks: got {got} of {expected}")
            }
            Self::MixedChunkIds => write!(f, "chunks have different message ids"),
            Self::MixedChunkTotals => write!(f, "chunks disagree on total count"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Errors raised by the file-transfer coordinator.
#[derive(Debug)]
pub enum TransferError {
    /// No ownership record is registered cluster-wide.
    NoFileRegistered,
    /// A transfer is already in progress on this host.
    TransferInProgress,
    /// The advertised owner is not currently connected.
    OwnerUnavailable(String),
    /// Chunk payload could not be decoded (base64/gzip).
    BadChunk(String),
    /// Disk I/O failed; the partial file is unlinked.
    Disk(io::Error),
    /// The on-disk size never reached the advertised size.
    SizeStall { expected: u64, got: u64 },
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoFileRegistered => write!(f, "no file registered for transfer"),
            Self::TransferInProgress => write!(f, "a transfer is already in progress"),
            Self::OwnerUnavailable(s) => write!(f, "file owner {s} is not connected"),
            Self::BadChunk(msg) => write!(f, "bad file chunk: {msg}"),
            Self::Disk(e) => write!(f, "disk error during transfer: {e}"),
            Self::SizeStall { expected, got } => {
                write!(f, "transfer stalled: {got} of {expected} bytes on disk")
            }
        }
    }
}

impl std::error::Error for TransferError {}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        Self::Disk(e)
    }
}

/// Errors surfaced on the daemon socket for lifecycle commands.
///
/// These never change service state: the command fails, the daemon and any
/// running role stay as they were.
#[derive(Debug)]
pub enum LifecycleError {
    /// Server and client roles are mutually exclusive in one daemon.
    MutualExclusion(&'static str),
    /// The requested role is already in the requested state.
    AlreadyRunning(&'static str),
    NotRunning(&'static str),
    /// Configuration problem (port in use, missing certificate, ...).
    Config(String),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MutualExclusion(role) => {
                let other = if *role == "server" { "client" } else { "server" };
                write!(f, "Cannot start {role} while {other} is running")
            }
            Self::AlreadyRunning(role) => {
                let cap = capitalize(role);
                write!(f, "{cap} already running")
            }
            Self::NotRunning(role) => {
                let cap = capitalize(role);
                write!(f, "{cap} not running")
            }
            Self::Config(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for LifecycleError {}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Classifies an I/O error as transient (retry the loop) or terminal.
///
/// Terminal errors end the owning connection; transient ones let the next
/// iteration try again.
pub fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
