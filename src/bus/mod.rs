//! Message bus: prioritized sending and per-stream receive demux.
//!
//! **Send side** — one bounded-priority queue per role (multi-producer,
//! single consumer task). Lower priority values dequeue first; ties keep
//! FIFO order via a monotonic sequence, so equal-priority messages are
//! never reordered. The consumer hands each message to a routing closure
//! that resolves the target to connection frame queues.
//!
//! **Receive side** — decoded messages demux by stream type into four
//! consumer queues (mouse, keyboard, clipboard, file) plus a control
//! queue for non-file commands. Each queue is drained by one dedicated
//! role task, which preserves per-stream-type, per-source ordering;
//! nothing is promised across stream types.

pub mod batch;

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::constants::SEND_QUEUE_LIMIT;
use crate::protocol::{is_file_command, Message, MessageType};

/// Heap entry; min-ordered by `(priority, seq)`.
struct QueueItem {
    priority: u8,
    seq: u64,
    msg: Message,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest tuple pops first.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct SendQueueInner {
    heap: Mutex<BinaryHeap<QueueItem>>,
    notify: Notify,
    seq: std::sync::atomic::AtomicU64,
}

/// Prioritized outbound queue with a single consumer task.
pub struct MessageSender {
    inner: Arc<SendQueueInner>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender").finish_non_exhaustive()
    }
}

impl MessageSender {
    /// Spawn the consumer. `route` receives `(target, message)` in
    /// priority order and is expected to be cheap (it pushes onto
    /// connection frame queues).
    pub fn spawn(route: impl Fn(&str, &Message) + Send + 'static) -> Self {
        let inner = Arc::new(SendQueueInner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: std::sync::atomic::AtomicU64::new(0),
        });

        let consumer = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                let item = {
                    let mut heap = consumer.heap.lock().expect("send queue lock");
                    heap.pop()
                };
                match item {
                    Some(item) => route(&item.msg.target.clone(), &item.msg),
                    None => consumer.notify.notified().await,
                }
            }
        });

        Self { inner, task }
    }

    /// Enqueue with an explicit priority (lower = sooner).
    ///
    /// The queue is bounded; once full, new messages are dropped and
    /// logged instead of growing the heap behind a stalled link.
    pub fn send(&self, priority: u8, msg: Message) {
        let seq = self
            .inner
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let mut heap = self.inner.heap.lock().expect("send queue lock");
            if heap.len() >= SEND_QUEUE_LIMIT {
                log::warn!("[Bus] Send queue full, dropping priority-{priority} message");
                return;
            }
            heap.push(QueueItem { priority, seq, msg });
        }
        self.inner.notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Stream lanes on the receive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Mouse,
    Keyboard,
    Clipboard,
    File,
    Control,
}

/// Classify a decoded message into its consumer lane.
///
/// COMMAND messages carrying `file_*` commands belong to the file lane so
/// transfer ordering survives; every other command is control traffic.
pub fn lane_for(msg: &Message) -> Lane {
    match msg.message_type {
        MessageType::Mouse => Lane::Mouse,
        MessageType::Keyboard => Lane::Keyboard,
        MessageType::Clipboard => Lane::Clipboard,
        MessageType::File => Lane::File,
        MessageType::Command => {
            if msg.command().is_some_and(is_file_command) {
                Lane::File
            } else {
                Lane::Control
            }
        }
        MessageType::Exchange => Lane::Control,
    }
}

/// Receive-side fan-out: one FIFO queue per lane.
pub struct ReceiveDemux {
    mouse: UnboundedSender<(String, Message)>,
    keyboard: UnboundedSender<(String, Message)>,
    clipboard: UnboundedSender<(String, Message)>,
    file: UnboundedSender<(String, Message)>,
    control: UnboundedSender<(String, Message)>,
}

impl std::fmt::Debug for ReceiveDemux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveDemux").finish_non_exhaustive()
    }
}

/// The receivers; each is drained by one dedicated role task.
pub struct DemuxQueues {
    pub mouse: UnboundedReceiver<(String, Message)>,
    pub keyboard: UnboundedReceiver<(String, Message)>,
    pub clipboard: UnboundedReceiver<(String, Message)>,
    pub file: UnboundedReceiver<(String, Message)>,
    pub control: UnboundedReceiver<(String, Message)>,
}

impl ReceiveDemux {
    pub fn new() -> (Self, DemuxQueues) {
        let (mouse_tx, mouse_rx) = mpsc::unbounded_channel();
        let (keyboard_tx, keyboard_rx) = mpsc::unbounded_channel();
        let (clipboard_tx, clipboard_rx) = mpsc::unbounded_channel();
        let (file_tx, file_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        (
            Self {
                mouse: mouse_tx,
                keyboard: keyboard_tx,
                clipboard: clipboard_tx,
                file: file_tx,
                control: control_tx,
            },
            DemuxQueues {
                mouse: mouse_rx,
                keyboard: keyboard_rx,
                clipboard: clipboard_rx,
                file: file_rx,
                control: control_rx,
            },
        )
    }

    /// Route one decoded message onto its lane, tagged with its source.
    pub fn push(&self, from: String, msg: Message) {
        let lane = lane_for(&msg);
        let tx = match lane {
            Lane::Mouse => &self.mouse,
            Lane::Keyboard => &self.keyboard,
            Lane::Clipboard => &self.clipboard,
            Lane::File => &self.file,
            Lane::Control => &self.control,
        };
        if tx.send((from, msg)).is_err() {
            log::debug!("[Bus] {lane:?} consumer gone, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{PRIORITY_CLIPBOARD, PRIORITY_MOUSE, PRIORITY_SCREEN_NOTIFICATION};
    use crate::protocol::{ClipboardEvent, KeyboardEvent, MessageBuilder, MouseEvent};
    use std::time::Duration;

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let sender = MessageSender::spawn(move |_target, msg| {
            let _ = out_tx.send(msg.sequence_id);
        });

        let b = MessageBuilder::new("server");
        // Stuff the queue before the consumer drains: mixed priorities.
        let m1 = b.mouse("left", &MouseEvent::motion(0.1, 0.1)); // seq 1
        let m2 = b.mouse("left", &MouseEvent::motion(0.2, 0.2)); // seq 2
        let urgent = b.command("left", "cross_screen", Default::default()); // seq 3

        {
            // Pre-load atomically so the consumer sees all three at once.
            sender.inner.heap.lock().unwrap().extend([
                QueueItem { priority: PRIORITY_MOUSE, seq: 0, msg: m1 },
                QueueItem { priority: PRIORITY_MOUSE, seq: 1, msg: m2 },
                QueueItem { priority: PRIORITY_SCREEN_NOTIFICATION, seq: 2, msg: urgent },
            ]);
        }
        sender.inner.notify.notify_one();

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(
                tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        // The screen notification (seq 3) jumps the two mouse messages,
        // which keep their relative order.
        assert_eq!(order, vec![3, 1, 2]);
        sender.shutdown();
    }

    #[tokio::test]
    async fn test_send_routes_to_target() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let sender = MessageSender::spawn(move |target, msg| {
            let _ = out_tx.send((target.to_string(), msg.message_type));
        });

        let b = MessageBuilder::new("server");
        sender.send(PRIORITY_CLIPBOARD, b.clipboard("right", &ClipboardEvent::text("hi")));

        let (target, ty) = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(target, "right");
        assert_eq!(ty, MessageType::Clipboard);
        sender.shutdown();
    }

    #[test]
    fn test_lane_classification() {
        let b = MessageBuilder::new("x");
        assert_eq!(lane_for(&b.mouse("l", &MouseEvent::motion(0.0, 0.0))), Lane::Mouse);
        assert_eq!(lane_for(&b.keyboard("l", &KeyboardEvent::press("a"))), Lane::Keyboard);
        assert_eq!(lane_for(&b.clipboard("l", &ClipboardEvent::text("c"))), Lane::Clipboard);
        assert_eq!(lane_for(&b.file("l", Default::default())), Lane::File);
        assert_eq!(
            lane_for(&b.command("l", "file_chunk", Default::default())),
            Lane::File
        );
        assert_eq!(
            lane_for(&b.command("l", "return", Default::default())),
            Lane::Control
        );
    }

    #[tokio::test]
    async fn test_demux_preserves_per_lane_order() {
        let (demux, mut queues) = ReceiveDemux::new();
        let b = MessageBuilder::new("left");

        demux.push("left".into(), b.keyboard("server", &KeyboardEvent::press("a")));
        demux.push("left".into(), b.mouse("server", &MouseEvent::motion(0.5, 0.5)));
        demux.push("left".into(), b.keyboard("server", &KeyboardEvent::release("a")));

        let (_, k1) = queues.keyboard.recv().await.unwrap();
        let (_, k2) = queues.keyboard.recv().await.unwrap();
        assert_eq!(k1.payload["event"].as_str(), Some("press"));
        assert_eq!(k2.payload["event"].as_str(), Some("release"));

        let (_, m) = queues.mouse.recv().await.unwrap();
        assert_eq!(m.message_type, MessageType::Mouse);
    }
}
