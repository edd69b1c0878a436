//! In-process event bus.
//!
//! Components publish [`BusEvent`]s; subscribers register per
//! [`EventKind`]. Dispatch happens on one dedicated task draining an
//! unbounded queue, so every subscriber observes events in publish order.
//! Handlers are synchronous and must be cheap — typically they forward
//! into a channel owned by the interested task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::screen::state::ScreenPosition;

/// Discriminant used for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ActiveScreenChanged,
    ClientConnected,
    ClientDisconnected,
    ClientActive,
    ClientInactive,
}

/// Events dispatched on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// The server's active screen changed (after the guard committed it).
    ActiveScreenChanged {
        active: Option<ScreenPosition>,
        /// Screen the change originated from ("" when server-initiated).
        source: String,
        x: f64,
        y: f64,
    },
    ClientConnected {
        screen: ScreenPosition,
    },
    ClientDisconnected {
        screen: ScreenPosition,
    },
    /// This client became the controlled screen.
    ClientActive,
    /// This client stopped being the controlled screen.
    ClientInactive,
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ActiveScreenChanged { .. } => EventKind::ActiveScreenChanged,
            Self::ClientConnected { .. } => EventKind::ClientConnected,
            Self::ClientDisconnected { .. } => EventKind::ClientDisconnected,
            Self::ClientActive => EventKind::ClientActive,
            Self::ClientInactive => EventKind::ClientInactive,
        }
    }
}

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Ordered pub/sub bus, one dispatcher task per instance.
pub struct EventBus {
    tx: UnboundedSender<BusEvent>,
    subscribers: Arc<RwLock<HashMap<EventKind, Vec<Handler>>>>,
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create the bus and spawn its dispatcher task.
    pub fn new() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusEvent>();
        let subscribers: Arc<RwLock<HashMap<EventKind, Vec<Handler>>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let subs = Arc::clone(&subscribers);
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let handlers: Vec<Handler> = {
                    let map = subs.read().expect("subscriber map poisoned");
                    map.get(&event.kind()).cloned().unwrap_or_default()
                };
                for handler in handlers {
                    handler(&event);
                }
            }
        });

        Arc::new(Self {
            tx,
            subscribers,
            dispatcher,
        })
    }

    /// Register a handler for one event kind.
    ///
    /// Handlers for the same kind run in registration order; all handlers
    /// observe events in publish order.
    pub fn subscribe(&self, kind: EventKind, handler: impl Fn(&BusEvent) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .expect("subscriber map poisoned")
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Enqueue an event for ordered dispatch. Cheap, never blocks.
    pub fn publish(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            log::warn!("[EventBus] dispatcher gone, event dropped");
        }
    }

    /// Stop the dispatcher. Queued events are discarded.
    pub fn shutdown(&self) {
        self.dispatcher.abort();
    }
}
