//! Capability traits the routing core consumes.
//!
//! Platform-specific input capture and synthesis live outside this crate;
//! the core only sees these traits plus a channel of captured events. The
//! daemon wires in real bindings where available and falls back to
//! [`HeadlessInput`], which satisfies every trait without touching the OS
//! (used by tests and server-only deployments).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::protocol::{ClipboardEvent, KeyboardEvent, MouseEvent};

/// Synthesizes mouse actions on the local desktop.
#[async_trait]
pub trait MouseController: Send + Sync {
    /// Move the cursor to an absolute position.
    async fn set_position(&self, x: f64, y: f64);

    /// Apply a received mouse event (move, click, scroll).
    async fn apply(&self, event: &MouseEvent);

    /// Current cursor position.
    async fn position(&self) -> (f64, f64);
}

/// Synthesizes key presses and releases.
#[async_trait]
pub trait KeyboardController: Send + Sync {
    async fn apply(&self, event: &KeyboardEvent);
}

/// Reads and writes the local clipboard.
#[async_trait]
pub trait ClipboardController: Send + Sync {
    async fn get(&self) -> Option<String>;
    async fn set(&self, event: &ClipboardEvent);
}

/// Controls the server-side capture surface: cursor warps and the
/// fullscreen overlay window that hides the local cursor while a remote
/// screen is active.
#[async_trait]
pub trait ScreenController: Send + Sync {
    /// Warp the cursor to an absolute position and wait for it to land.
    async fn warp(&self, x: f64, y: f64);

    /// Raise (`true`) or drop (`false`) the capture overlay.
    async fn set_overlay(&self, active: bool);

    /// Local screen size in pixels.
    fn screen_size(&self) -> (i32, i32);
}

/// Everything the platform capture layer can report to the core.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedEvent {
    Mouse(MouseEvent),
    Keyboard(KeyboardEvent),
    Clipboard(ClipboardEvent),
    /// The user copied a file; registers ownership cluster-wide.
    FileCopied {
        name: String,
        size: u64,
        path: String,
    },
    /// The user pasted a file; requests the registered file into `save_dir`.
    FilePasted { save_dir: String },
}

/// Channel pair linking a platform capture implementation to the core.
///
/// Suppression contract: while `suppressed` is set the listener must not
/// emit clicks, scrolls or key events (they are routed remotely), but must
/// keep emitting motion so the core can still see edge activity.
pub struct CaptureChannel {
    tx: UnboundedSender<CapturedEvent>,
    suppressed: Arc<AtomicBool>,
}

impl CaptureChannel {
    pub fn new() -> (Self, UnboundedReceiver<CapturedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                suppressed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Emit a captured event into the core. Returns `false` once the core
    /// has shut down.
    pub fn emit(&self, event: CapturedEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Flag read by the platform listener to honor the suppression
    /// contract.
    pub fn suppression_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.suppressed)
    }

    pub fn set_suppressed(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::Relaxed);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::Relaxed)
    }
}

/// No-op capability provider.
///
/// Logs what it would do and tracks the cursor position it was last told,
/// which is exactly enough for the server core, tests, and machines with
/// no input bindings compiled in.
#[derive(Debug)]
pub struct HeadlessInput {
    width: i32,
    height: i32,
    position: std::sync::Mutex<(f64, f64)>,
    clipboard: std::sync::Mutex<Option<ClipboardEvent>>,
}

impl HeadlessInput {
    pub fn new(width: i32, height: i32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            position: std::sync::Mutex::new((0.0, 0.0)),
            clipboard: std::sync::Mutex::new(None),
        })
    }
}

#[async_trait]
impl MouseController for HeadlessInput {
    async fn set_position(&self, x: f64, y: f64) {
        *self.position.lock().expect("position lock") = (x, y);
    }

    async fn apply(&self, event: &MouseEvent) {
        log::trace!("[Input] mouse {} at ({:.3},{:.3})", event.event, event.x, event.y);
        if event.x >= 0.0 && event.y >= 0.0 {
            *self.position.lock().expect("position lock") = (event.x, event.y);
        }
    }

    async fn position(&self) -> (f64, f64) {
        *self.position.lock().expect("position lock")
    }
}

#[async_trait]
impl KeyboardController for HeadlessInput {
    async fn apply(&self, event: &KeyboardEvent) {
        log::trace!("[Input] key {} {}", event.key, event.event);
    }
}

#[async_trait]
impl ClipboardController for HeadlessInput {
    async fn get(&self) -> Option<String> {
        self.clipboard
            .lock()
            .expect("clipboard lock")
            .as_ref()
            .map(|e| e.content.clone())
    }

    async fn set(&self, event: &ClipboardEvent) {
        *self.clipboard.lock().expect("clipboard lock") = Some(event.clone());
    }
}

#[async_trait]
impl ScreenController for HeadlessInput {
    async fn warp(&self, x: f64, y: f64) {
        log::debug!("[Input] warp to ({x:.1},{y:.1})");
        *self.position.lock().expect("position lock") = (x, y);
    }

    async fn set_overlay(&self, active: bool) {
        log::debug!("[Input] overlay {}", if active { "raised" } else { "dropped" });
    }

    fn screen_size(&self) -> (i32, i32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_channel_delivers_in_order() {
        let (chan, mut rx) = CaptureChannel::new();
        chan.emit(CapturedEvent::Keyboard(KeyboardEvent::press("a")));
        chan.emit(CapturedEvent::Keyboard(KeyboardEvent::release("a")));
        assert_eq!(
            rx.try_recv().unwrap(),
            CapturedEvent::Keyboard(KeyboardEvent::press("a"))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            CapturedEvent::Keyboard(KeyboardEvent::release("a"))
        );
    }

    #[test]
    fn test_suppression_flag_shared() {
        let (chan, _rx) = CaptureChannel::new();
        let flag = chan.suppression_flag();
        assert!(!chan.is_suppressed());
        chan.set_suppressed(true);
        assert!(flag.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_headless_tracks_position() {
        let input = HeadlessInput::new(1920, 1080);
        input.warp(20.0, 500.0).await;
        assert_eq!(input.position().await, (20.0, 500.0));
        assert_eq!(input.screen_size(), (1920, 1080));
    }
}
