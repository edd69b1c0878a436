//! Server role: owns every service and wires the data flow.
//!
//! ```text
//! capture ──► edge detect / forward ──► batchers ──► priority sender ──► connections
//!                    │ decide()                                            │
//!                    ▼                                                     ▼
//!             TransitionController                                  client transports
//!                    │ warp/overlay                                        │
//! event bus ◄────────┘                     demux lanes ◄── decoded messages┘
//!   │                                        │
//!   └── cross_screen notifications           └── return / clipboard / file handlers
//! ```
//!
//! Everything is explicitly constructed here and handed down as handles;
//! the daemon holds at most one running `Server`.

pub mod clients;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::bus::batch::{keyboard_batcher, mouse_batcher, Batcher};
use crate::bus::{MessageSender, ReceiveDemux};
use crate::config::{ServerConfig, StreamSettings};
use crate::constants::{PRIORITY_CLIPBOARD, PRIORITY_SCREEN_NOTIFICATION};
use crate::event::{BusEvent, EventBus, EventKind};
use crate::input::{
    CaptureChannel, CapturedEvent, ClipboardController, HeadlessInput, ScreenController,
};
use crate::net::server::{ServerNetEvent, ServerTransport};
use crate::protocol::{
    ClipboardEvent, KeyboardEvent, Message, MessageBuilder, MouseEvent, CMD_CROSS_SCREEN,
    CMD_DISCONNECT, CMD_RETURN, TARGET_SERVER,
};
use crate::screen::{ScreenPosition, Transition, TransitionController};
use crate::transfer::{CoordinatorRole, FileCoordinator};

use clients::ClientRegistry;

/// Platform capabilities injected into the server role.
pub struct ServerCapabilities {
    pub screen: Arc<dyn ScreenController>,
    pub clipboard: Arc<dyn ClipboardController>,
    pub capture: Arc<CaptureChannel>,
    pub capture_rx: UnboundedReceiver<CapturedEvent>,
}

impl ServerCapabilities {
    /// Headless bundle for tests and display-less deployments.
    pub fn headless(width: i32, height: i32) -> Self {
        let input = HeadlessInput::new(width, height);
        let (capture, capture_rx) = CaptureChannel::new();
        Self {
            screen: input.clone(),
            clipboard: input,
            capture: Arc::new(capture),
            capture_rx,
        }
    }
}

/// The running server role.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    events: Arc<EventBus>,
    guard: Arc<TransitionController>,
    sender: Arc<MessageSender>,
    mouse_batch: Batcher<MouseEvent>,
    keyboard_batch: Batcher<KeyboardEvent>,
    coordinator: Arc<FileCoordinator>,
    transport: Option<ServerTransport>,
    capture: Arc<CaptureChannel>,
    streams: Arc<Mutex<StreamSettings>>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    port: u16,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.port)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Build and start every service of the server role.
    pub async fn start(
        config: ServerConfig,
        caps: ServerCapabilities,
        advertise: bool,
    ) -> Result<Self> {
        let ServerCapabilities {
            screen,
            clipboard: clipboard_ctl,
            capture,
            mut capture_rx,
        } = caps;

        let builder = Arc::new(MessageBuilder::new(TARGET_SERVER));
        let registry = ClientRegistry::from_entries(&config.clients);
        let events = EventBus::new();
        let streams = Arc::new(Mutex::new(config.streams));
        let running = Arc::new(AtomicBool::new(true));

        let guard = Arc::new(TransitionController::new(
            Arc::clone(&screen),
            Arc::clone(&events),
            config.screen_threshold,
        ));

        // Priority sender routes by target label; "all" broadcasts.
        let route_registry = Arc::clone(&registry);
        let sender = Arc::new(MessageSender::spawn(move |target, msg| {
            if target == crate::protocol::TARGET_ALL {
                for (_, conn) in route_registry.connections() {
                    conn.send_message(msg);
                }
            } else if let Some(pos) = ScreenPosition::parse(target) {
                if let Some(conn) = route_registry.connection(pos) {
                    if !conn.send_message(msg) {
                        log::debug!("[Server] Send to {pos} failed; writer gone");
                    }
                }
            }
        }));

        let mouse_batch = mouse_batcher(Arc::clone(&builder), Arc::clone(&sender));
        let keyboard_batch = keyboard_batcher(Arc::clone(&builder), Arc::clone(&sender));

        let coord_targets = Arc::clone(&registry);
        let coord_send = Arc::clone(&sender);
        let coordinator = FileCoordinator::new(
            CoordinatorRole::Server,
            Arc::clone(&builder),
            Arc::new(move |priority, msg| coord_send.send(priority, msg)),
            Arc::new(move || {
                coord_targets
                    .connected_positions()
                    .into_iter()
                    .map(|p| p.to_string())
                    .collect()
            }),
            dirs::download_dir().unwrap_or_else(std::env::temp_dir),
        );

        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let transport = ServerTransport::start(
            &config,
            Arc::clone(&registry),
            Arc::clone(&builder),
            screen_size_u32(screen.screen_size()),
            net_tx,
            advertise,
        )
        .await?;
        let port = transport.port();

        let (demux, queues) = ReceiveDemux::new();
        let crate::bus::DemuxQueues {
            mut mouse,
            mut keyboard,
            mut clipboard,
            mut file,
            mut control,
        } = queues;
        let mut tasks = Vec::new();

        // Cross-screen notification on every committed transition, and
        // the capture suppression contract.
        {
            let sender = Arc::clone(&sender);
            let builder = Arc::clone(&builder);
            let capture = Arc::clone(&capture);
            events.subscribe(EventKind::ActiveScreenChanged, move |event| {
                let BusEvent::ActiveScreenChanged { active, .. } = event else {
                    return;
                };
                capture.set_suppressed(active.is_some());
                if let Some(target) = active {
                    let mut params = Map::new();
                    let (x, y) = client_entry_point(*target);
                    params.insert("x".into(), Value::from(x));
                    params.insert("y".into(), Value::from(y));
                    params.insert("screen".into(), Value::String(target.to_string()));
                    let msg = builder.command(target.as_str(), CMD_CROSS_SCREEN, params);
                    sender.send(PRIORITY_SCREEN_NOTIFICATION, msg);
                }
            });
        }

        // Transport events: connection lifecycle + message demux.
        {
            let events_bus = Arc::clone(&events);
            let guard = Arc::clone(&guard);
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = net_rx.recv().await {
                    match event {
                        ServerNetEvent::Connected { screen, .. } => {
                            events_bus.publish(BusEvent::ClientConnected { screen });
                        }
                        ServerNetEvent::Disconnected { screen } => {
                            guard.client_disconnected(screen);
                            coordinator.peer_disconnected(screen.as_str());
                            events_bus.publish(BusEvent::ClientDisconnected { screen });
                        }
                        ServerNetEvent::Message { from, msg } => {
                            demux.push(from.to_string(), msg);
                        }
                    }
                }
            }));
        }

        // Captured local input: edge detection and remote forwarding.
        {
            let guard = Arc::clone(&guard);
            let registry = Arc::clone(&registry);
            let screen_ctl = Arc::clone(&screen);
            let mouse_tx = mouse_batch.sender();
            let keyboard_tx = keyboard_batch.sender();
            let sender = Arc::clone(&sender);
            let builder = Arc::clone(&builder);
            let coordinator = Arc::clone(&coordinator);
            let streams = Arc::clone(&streams);
            let threshold = config.screen_threshold;
            tasks.push(tokio::spawn(async move {
                while let Some(event) = capture_rx.recv().await {
                    handle_capture(CaptureCtx {
                        event,
                        guard: &guard,
                        registry: &registry,
                        screen_size: screen_ctl.screen_size(),
                        threshold,
                        streams: &streams,
                        mouse_tx: &mouse_tx,
                        keyboard_tx: &keyboard_tx,
                        sender: &sender,
                        builder: &builder,
                        coordinator: &coordinator,
                    });
                }
            }));
        }

        // Control lane: return edges and disconnect requests.
        {
            let guard = Arc::clone(&guard);
            let registry = Arc::clone(&registry);
            let screen_ctl = Arc::clone(&screen);
            tasks.push(tokio::spawn(async move {
                while let Some((from, msg)) = control.recv().await {
                    handle_control(&from, &msg, &guard, &registry, screen_ctl.screen_size());
                }
            }));
        }

        // Clipboard lane: apply locally, relay to the other clients.
        {
            let clipboard_ctl = Arc::clone(&clipboard_ctl);
            let sender = Arc::clone(&sender);
            let builder = Arc::clone(&builder);
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                while let Some((from, msg)) = clipboard.recv().await {
                    let event = ClipboardEvent::from_payload(&msg.payload);
                    clipboard_ctl.set(&event).await;
                    for pos in registry.connected_positions() {
                        if pos.as_str() == from {
                            continue;
                        }
                        let relay = builder.clipboard(pos.as_str(), &event);
                        sender.send(PRIORITY_CLIPBOARD, relay);
                    }
                }
            }));
        }

        // File lane: the coordinator owns all of it.
        {
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                while let Some((from, msg)) = file.recv().await {
                    coordinator.handle_message(&from, &msg).await;
                }
            }));
        }

        // Mouse/keyboard lanes from clients: only the server emits input
        // streams, so anything here is a confused peer.
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = mouse.recv() => {
                        if item.is_none() { break; }
                        log::trace!("[Server] Dropping unexpected mouse stream from client");
                    }
                    item = keyboard.recv() => {
                        if item.is_none() { break; }
                        log::trace!("[Server] Dropping unexpected keyboard stream from client");
                    }
                }
            }
        }));

        log::info!("[Server] Started on port {port}");
        Ok(Self {
            config,
            registry,
            events,
            guard,
            sender,
            mouse_batch,
            keyboard_batch,
            coordinator,
            transport: Some(transport),
            capture,
            streams,
            running,
            tasks,
            port,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn active_screen(&self) -> Option<ScreenPosition> {
        self.guard.active()
    }

    /// Toggle one stream at runtime (daemon `enable_stream`/`disable_stream`).
    pub fn set_stream(&self, stream: &str, enabled: bool) -> bool {
        self.streams.lock().expect("streams lock").set(stream, enabled)
    }

    pub fn streams(&self) -> StreamSettings {
        *self.streams.lock().expect("streams lock")
    }

    /// Status block for the daemon.
    pub fn status(&self) -> Value {
        serde_json::json!({
            "running": self.is_running(),
            "host": self.config.host,
            "port": self.port,
            "connected_clients": self.registry.connected_count(),
            "registered_clients": self.registry.entries().len(),
            "active_screen": self.active_screen().map(|p| p.to_string()),
            "enabled_streams": Value::Object(self.streams().as_map()),
            "ssl_enabled": self.config.ssl_enabled,
            "transfer": self.coordinator.status(),
        })
    }

    /// Stop every task and release every socket.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("[Server] Stopping");

        if let Some(transport) = self.transport.take() {
            transport.shutdown();
        }
        for (pos, conn) in self.registry.connections() {
            conn.disconnect();
            self.registry.detach(pos);
        }
        for task in &self.tasks {
            task.abort();
        }
        self.mouse_batch.shutdown();
        self.keyboard_batch.shutdown();
        self.sender.shutdown();
        self.guard.shutdown();
        self.events.shutdown();
        self.capture.set_suppressed(false);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn screen_size_u32(size: (i32, i32)) -> (u32, u32) {
    (size.0.max(0) as u32, size.1.max(0) as u32)
}

/// Where the client's cursor should appear when control crosses over,
/// normalized to the client's own screen: entering the left client means
/// appearing at its right edge, and so on.
fn client_entry_point(target: ScreenPosition) -> (f64, f64) {
    match target {
        ScreenPosition::Left => (1.0, 0.5),
        ScreenPosition::Right => (0.0, 0.5),
        ScreenPosition::Up => (0.5, 1.0),
        ScreenPosition::Down => (0.5, 0.0),
    }
}

/// Which edge, if any, the cursor position is inside.
fn edge_for(x: f64, y: f64, width: i32, height: i32, threshold: i32) -> Option<ScreenPosition> {
    let t = f64::from(threshold);
    if x <= t {
        Some(ScreenPosition::Left)
    } else if x >= f64::from(width) - t {
        Some(ScreenPosition::Right)
    } else if y <= t {
        Some(ScreenPosition::Up)
    } else if y >= f64::from(height) - t {
        Some(ScreenPosition::Down)
    } else {
        None
    }
}

struct CaptureCtx<'a> {
    event: CapturedEvent,
    guard: &'a TransitionController,
    registry: &'a Arc<ClientRegistry>,
    screen_size: (i32, i32),
    threshold: i32,
    streams: &'a Arc<Mutex<StreamSettings>>,
    mouse_tx: &'a tokio::sync::mpsc::UnboundedSender<(String, MouseEvent)>,
    keyboard_tx: &'a tokio::sync::mpsc::UnboundedSender<(String, KeyboardEvent)>,
    sender: &'a Arc<MessageSender>,
    builder: &'a Arc<MessageBuilder>,
    coordinator: &'a Arc<FileCoordinator>,
}

fn handle_capture(ctx: CaptureCtx<'_>) {
    let streams = *ctx.streams.lock().expect("streams lock");
    let (width, height) = ctx.screen_size;

    match ctx.event {
        CapturedEvent::Mouse(mut mouse) => {
            if !streams.mouse {
                return;
            }
            match ctx.guard.active() {
                None => {
                    // Local ownership: motion may cross an edge.
                    ctx.guard.update_mouse_position(mouse.x, mouse.y);
                    if mouse.event == crate::protocol::MOUSE_MOVE {
                        if let Some(edge) = edge_for(mouse.x, mouse.y, width, height, ctx.threshold)
                        {
                            let decision =
                                ctx.guard.change_screen(ctx.registry.as_ref(), Some(edge));
                            if decision != Transition::NoTransition {
                                log::debug!("[Server] Edge {edge} crossed: {decision:?}");
                            }
                        }
                    }
                }
                Some(active) => {
                    // Remote ownership: forward, normalized to [0,1].
                    if mouse.x >= 0.0 {
                        ctx.guard.update_mouse_position(mouse.x, mouse.y);
                        mouse.x /= f64::from(width.max(1));
                        mouse.y /= f64::from(height.max(1));
                    }
                    let _ = ctx.mouse_tx.send((active.to_string(), mouse));
                }
            }
        }
        CapturedEvent::Keyboard(key) => {
            if !streams.keyboard {
                return;
            }
            let Some(active) = ctx.guard.active() else { return };
            let key_map = ctx.registry.key_map(active);
            let mapped = key_map.get(&key.key).cloned().unwrap_or(key.key);
            let _ = ctx.keyboard_tx.send((
                active.to_string(),
                KeyboardEvent {
                    key: mapped,
                    event: key.event,
                },
            ));
        }
        CapturedEvent::Clipboard(clip) => {
            if !streams.clipboard {
                return;
            }
            for pos in ctx.registry.connected_positions() {
                let msg = ctx.builder.clipboard(pos.as_str(), &clip);
                ctx.sender.send(PRIORITY_CLIPBOARD, msg);
            }
        }
        CapturedEvent::FileCopied { name, size, path } => {
            if !streams.file {
                return;
            }
            ctx.coordinator.handle_local_copy(&name, size, &path);
        }
        CapturedEvent::FilePasted { save_dir } => {
            if !streams.file {
                return;
            }
            ctx.coordinator.handle_local_paste(Some(save_dir.into()));
        }
    }
}

fn handle_control(
    from: &str,
    msg: &Message,
    guard: &TransitionController,
    registry: &Arc<ClientRegistry>,
    screen_size: (i32, i32),
) {
    match msg.command() {
        Some(CMD_RETURN) => {
            let params = msg.command_params();
            let Some(direction) = params
                .get("direction")
                .and_then(Value::as_str)
                .and_then(ScreenPosition::parse)
            else {
                log::warn!("[Server] return without direction from {from}");
                return;
            };
            if guard.active() != Some(direction) {
                log::debug!("[Server] Ignoring return from {from}: {direction} is not active");
                return;
            }
            // The client reports the free coordinate normalized; map it
            // back into server pixels on the relevant axis.
            let coord = params.get("coord").and_then(Value::as_f64).unwrap_or(0.5);
            let coordinate = match direction {
                ScreenPosition::Left | ScreenPosition::Right => coord * f64::from(screen_size.1),
                ScreenPosition::Up | ScreenPosition::Down => coord * f64::from(screen_size.0),
            };
            guard.handle_return(registry.as_ref(), direction, coordinate);
        }
        Some(CMD_DISCONNECT) => {
            if let Some(pos) = ScreenPosition::parse(from) {
                if let Some(conn) = registry.detach(pos) {
                    conn.disconnect();
                }
                guard.client_disconnected(pos);
            }
        }
        other => {
            log::debug!("[Server] Unhandled control command {other:?} from {from}");
        }
    }
}
