//! Size/interval batching for the high-frequency input streams.
//!
//! Mouse events flush at 10 buffered events or every 20 ms; keyboard at
//! 7 events or 10 ms. A flush coalesces the buffered events per target
//! into one message whose payload is the ordered event list, preserving
//! per-source order, then hands it to the prioritized sender.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::constants::{
    KEYBOARD_BATCH_INTERVAL, KEYBOARD_BATCH_MAX, MOUSE_BATCH_INTERVAL, MOUSE_BATCH_MAX,
    PRIORITY_KEYBOARD, PRIORITY_MOUSE,
};
use crate::protocol::{KeyboardEvent, Message, MessageBuilder, MouseEvent};

use super::MessageSender;

/// Batching parameters plus the message constructor for one stream.
struct BatchSpec<E> {
    max_events: usize,
    interval: Duration,
    priority: u8,
    build: fn(&MessageBuilder, &str, &[E]) -> Message,
}

/// Buffers `(target, event)` pairs and flushes them as coalesced batches.
pub struct Batcher<E> {
    tx: UnboundedSender<(String, E)>,
    task: JoinHandle<()>,
}

impl<E> std::fmt::Debug for Batcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher").finish_non_exhaustive()
    }
}

impl<E: Send + 'static> Batcher<E> {
    fn spawn(builder: Arc<MessageBuilder>, sender: Arc<MessageSender>, spec: BatchSpec<E>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, E)>();

        let task = tokio::spawn(async move {
            let mut buffer: Vec<(String, E)> = Vec::with_capacity(spec.max_events);
            let mut last_flush = Instant::now();

            loop {
                match timeout(spec.interval, rx.recv()).await {
                    Ok(Some(item)) => {
                        buffer.push(item);
                        if buffer.len() >= spec.max_events
                            || last_flush.elapsed() >= spec.interval
                        {
                            flush(&builder, &sender, &spec, &mut buffer);
                            last_flush = Instant::now();
                        }
                    }
                    Ok(None) => {
                        flush(&builder, &sender, &spec, &mut buffer);
                        break;
                    }
                    Err(_) => {
                        if !buffer.is_empty() {
                            flush(&builder, &sender, &spec, &mut buffer);
                            last_flush = Instant::now();
                        }
                    }
                }
            }
        });

        Self { tx, task }
    }

    /// Queue one event for the next flush. Returns `false` after
    /// shutdown.
    pub fn push(&self, target: &str, event: E) -> bool {
        self.tx.send((target.to_string(), event)).is_ok()
    }

    /// Clonable handle for producers that outlive the borrow.
    pub fn sender(&self) -> UnboundedSender<(String, E)> {
        self.tx.clone()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Coalesce the buffer into one message per target, in first-seen order.
fn flush<E>(
    builder: &MessageBuilder,
    sender: &MessageSender,
    spec: &BatchSpec<E>,
    buffer: &mut Vec<(String, E)>,
) {
    if buffer.is_empty() {
        return;
    }

    let mut targets: Vec<String> = Vec::new();
    for (target, _) in buffer.iter() {
        if !targets.contains(target) {
            targets.push(target.clone());
        }
    }

    for target in targets {
        let events: Vec<E> = {
            let mut kept = Vec::new();
            let mut rest = Vec::new();
            for item in buffer.drain(..) {
                if item.0 == target {
                    kept.push(item.1);
                } else {
                    rest.push(item);
                }
            }
            *buffer = rest;
            kept
        };
        let msg = (spec.build)(builder, &target, &events);
        sender.send(spec.priority, msg);
    }
}

/// Mouse batcher: 10 events / 20 ms.
pub fn mouse_batcher(builder: Arc<MessageBuilder>, sender: Arc<MessageSender>) -> Batcher<MouseEvent> {
    Batcher::spawn(
        builder,
        sender,
        BatchSpec {
            max_events: MOUSE_BATCH_MAX,
            interval: MOUSE_BATCH_INTERVAL,
            priority: PRIORITY_MOUSE,
            build: |b, target, events| b.mouse_batch(target, events),
        },
    )
}

/// Keyboard batcher: 7 events / 10 ms.
pub fn keyboard_batcher(
    builder: Arc<MessageBuilder>,
    sender: Arc<MessageSender>,
) -> Batcher<KeyboardEvent> {
    Batcher::spawn(
        builder,
        sender,
        BatchSpec {
            max_events: KEYBOARD_BATCH_MAX,
            interval: KEYBOARD_BATCH_INTERVAL,
            priority: PRIORITY_KEYBOARD,
            build: |b, target, events| b.keyboard_batch(target, events),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn collector() -> (Arc<MessageSender>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        let sender = Arc::new(MessageSender::spawn(move |_t, m| {
            let _ = tx.send(m.clone());
        }));
        (sender, rx)
    }

    #[tokio::test]
    async fn test_flush_on_max_events() {
        let builder = Arc::new(MessageBuilder::new("server"));
        let (sender, mut rx) = collector();
        let batcher = mouse_batcher(builder, Arc::clone(&sender));

        for i in 0..MOUSE_BATCH_MAX {
            batcher.push("left", MouseEvent::motion(i as f64 / 100.0, 0.5));
        }

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let events = msg.payload["events"].as_array().unwrap();
        assert_eq!(events.len(), MOUSE_BATCH_MAX);
        // Per-source order preserved inside the batch.
        assert_eq!(events[0]["x"].as_f64().unwrap(), 0.0);
        assert_eq!(events[9]["x"].as_f64().unwrap(), 0.09);

        batcher.shutdown();
        sender.shutdown();
    }

    #[tokio::test]
    async fn test_flush_on_interval_with_few_events() {
        let builder = Arc::new(MessageBuilder::new("server"));
        let (sender, mut rx) = collector();
        let batcher = keyboard_batcher(builder, Arc::clone(&sender));

        batcher.push("left", KeyboardEvent::press("a"));
        batcher.push("left", KeyboardEvent::release("a"));

        // Far fewer than 7 events: the interval flush must deliver them.
        let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("interval flush")
            .unwrap();
        let events = msg.payload["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"].as_str(), Some("press"));
        assert_eq!(events[1]["event"].as_str(), Some("release"));

        batcher.shutdown();
        sender.shutdown();
    }

    #[tokio::test]
    async fn test_mixed_targets_split_into_separate_messages() {
        let builder = Arc::new(MessageBuilder::new("server"));
        let (sender, mut rx) = collector();
        let batcher = keyboard_batcher(builder, Arc::clone(&sender));

        batcher.push("left", KeyboardEvent::press("a"));
        batcher.push("right", KeyboardEvent::press("b"));

        let first = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.target, "left");
        assert_eq!(second.target, "right");
        assert_eq!(first.payload["events"].as_array().unwrap().len(), 1);

        batcher.shutdown();
        sender.shutdown();
    }
}
