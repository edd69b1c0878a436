//! Client role: receives the server's input streams and injects them.
//!
//! The client never decides screen topology; it learns that it is the
//! active screen from a `cross_screen` command (which also tells it its
//! own position), injects mouse/keyboard/clipboard streams while
//! controlled, and reports the return edge when the cursor reaches the
//! side facing the server. Files flow through the same coordinator as on
//! the server, in the client role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

use crate::bus::{MessageSender, ReceiveDemux};
use crate::config::{ClientConfig, StreamSettings};
use crate::constants::{PRIORITY_CLIPBOARD, PRIORITY_SCREEN_NOTIFICATION};
use crate::discovery::DiscoveredServer;
use crate::event::{BusEvent, EventBus};
use crate::input::{
    CaptureChannel, CapturedEvent, ClipboardController, HeadlessInput, KeyboardController,
    MouseController, ScreenController,
};
use crate::net::client::{ClientNetEvent, ClientTransport};
use crate::protocol::{
    ClipboardEvent, KeyboardEvent, Message, MessageBuilder, MouseEvent, CMD_CROSS_SCREEN,
    CMD_DISCONNECT, CMD_RETURN, MOUSE_MOVE, TARGET_SERVER,
};
use crate::screen::ScreenPosition;
use crate::transfer::{CoordinatorRole, FileCoordinator};

/// Platform capabilities injected into the client role.
pub struct ClientCapabilities {
    pub mouse: Arc<dyn MouseController>,
    pub keyboard: Arc<dyn KeyboardController>,
    pub clipboard: Arc<dyn ClipboardController>,
    pub screen: Arc<dyn ScreenController>,
    pub capture: Arc<CaptureChannel>,
    pub capture_rx: UnboundedReceiver<CapturedEvent>,
}

impl ClientCapabilities {
    /// Headless bundle for tests and display-less deployments.
    pub fn headless(width: i32, height: i32) -> Self {
        let input = HeadlessInput::new(width, height);
        let (capture, capture_rx) = CaptureChannel::new();
        Self {
            mouse: input.clone(),
            keyboard: input.clone(),
            clipboard: input.clone(),
            screen: input,
            capture: Arc::new(capture),
            capture_rx,
        }
    }
}

/// The running client role.
pub struct Client {
    config: ClientConfig,
    transport: Arc<ClientTransport>,
    events: Arc<EventBus>,
    sender: Arc<MessageSender>,
    coordinator: Arc<FileCoordinator>,
    /// Our screen position while the server routes input to us.
    controlled: Arc<Mutex<Option<ScreenPosition>>>,
    server_size: Arc<Mutex<Option<(u32, u32)>>>,
    found_servers: Arc<Mutex<Vec<DiscoveredServer>>>,
    choice_needed: Arc<AtomicBool>,
    streams: Arc<Mutex<StreamSettings>>,
    running: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("running", &self.is_running())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn start(config: ClientConfig, caps: ClientCapabilities) -> Result<Self> {
        let ClientCapabilities {
            mouse: mouse_ctl,
            keyboard: keyboard_ctl,
            clipboard: clipboard_ctl,
            screen,
            capture: _capture,
            mut capture_rx,
        } = caps;

        let builder = Arc::new(MessageBuilder::new("client"));
        let events = EventBus::new();
        let streams = Arc::new(Mutex::new(config.streams));
        let running = Arc::new(AtomicBool::new(true));
        let controlled = Arc::new(Mutex::new(None::<ScreenPosition>));
        let server_size = Arc::new(Mutex::new(None));
        let found_servers = Arc::new(Mutex::new(Vec::new()));
        let choice_needed = Arc::new(AtomicBool::new(false));

        let (width, height) = screen.screen_size();
        let (net_tx, mut net_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ClientTransport::start(
            config.clone(),
            Arc::clone(&builder),
            (width.max(0) as u32, height.max(0) as u32),
            net_tx,
        )?);

        // All outgoing traffic funnels through the priority queue into
        // the single server connection.
        let route_transport = Arc::clone(&transport);
        let sender = Arc::new(MessageSender::spawn(move |_target, msg| {
            if !route_transport.send(msg) {
                log::debug!("[Client] Dropped message while disconnected");
            }
        }));

        let coord_send = Arc::clone(&sender);
        let coordinator = FileCoordinator::new(
            CoordinatorRole::Client,
            Arc::clone(&builder),
            Arc::new(move |priority, msg| coord_send.send(priority, msg)),
            Arc::new(|| vec![TARGET_SERVER.to_string()]),
            config
                .save_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        );

        let (demux, queues) = ReceiveDemux::new();
        let crate::bus::DemuxQueues {
            mut mouse,
            mut keyboard,
            mut clipboard,
            mut file,
            mut control,
        } = queues;
        let mut tasks = Vec::new();

        // Transport events.
        {
            let events_bus = Arc::clone(&events);
            let controlled = Arc::clone(&controlled);
            let server_size = Arc::clone(&server_size);
            let found = Arc::clone(&found_servers);
            let choice = Arc::clone(&choice_needed);
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = net_rx.recv().await {
                    match event {
                        ClientNetEvent::Connected { server_size: size } => {
                            *server_size.lock().expect("size lock") = Some(size);
                            choice.store(false, Ordering::SeqCst);
                            log::info!("[Client] Connected (server screen {size:?})");
                        }
                        ClientNetEvent::Disconnected => {
                            controlled.lock().expect("controlled lock").take();
                            coordinator.peer_disconnected(TARGET_SERVER);
                            events_bus.publish(BusEvent::ClientInactive);
                        }
                        ClientNetEvent::ServersFound(list) => {
                            log::info!("[Client] Discovery found {} servers", list.len());
                            *found.lock().expect("found lock") = list;
                            choice.store(true, Ordering::SeqCst);
                        }
                        ClientNetEvent::Message(msg) => {
                            demux.push(TARGET_SERVER.to_string(), msg);
                        }
                    }
                }
            }));
        }

        // Mouse lane: denormalize against our own screen and inject.
        {
            let mouse_ctl = Arc::clone(&mouse_ctl);
            tasks.push(tokio::spawn(async move {
                while let Some((_, msg)) = mouse.recv().await {
                    for mut event in unpack_mouse(&msg) {
                        if event.x >= 0.0 {
                            event.x *= f64::from(width.max(1));
                            event.y *= f64::from(height.max(1));
                        }
                        mouse_ctl.apply(&event).await;
                    }
                }
            }));
        }

        // Keyboard lane.
        {
            let keyboard_ctl = Arc::clone(&keyboard_ctl);
            tasks.push(tokio::spawn(async move {
                while let Some((_, msg)) = keyboard.recv().await {
                    for event in unpack_keyboard(&msg) {
                        keyboard_ctl.apply(&event).await;
                    }
                }
            }));
        }

        // Clipboard lane.
        {
            let clipboard_ctl = Arc::clone(&clipboard_ctl);
            tasks.push(tokio::spawn(async move {
                while let Some((_, msg)) = clipboard.recv().await {
                    clipboard_ctl.set(&ClipboardEvent::from_payload(&msg.payload)).await;
                }
            }));
        }

        // File lane.
        {
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                while let Some((from, msg)) = file.recv().await {
                    coordinator.handle_message(&from, &msg).await;
                }
            }));
        }

        // Control lane: activation and disconnect.
        {
            let mouse_ctl = Arc::clone(&mouse_ctl);
            let events_bus = Arc::clone(&events);
            let controlled = Arc::clone(&controlled);
            tasks.push(tokio::spawn(async move {
                while let Some((_, msg)) = control.recv().await {
                    handle_control(&msg, &mouse_ctl, &events_bus, &controlled, (width, height)).await;
                }
            }));
        }

        // Local capture: return-edge detection plus clipboard/file sync.
        {
            let builder = Arc::clone(&builder);
            let sender = Arc::clone(&sender);
            let events_bus = Arc::clone(&events);
            let controlled = Arc::clone(&controlled);
            let coordinator = Arc::clone(&coordinator);
            let streams = Arc::clone(&streams);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = capture_rx.recv().await {
                    handle_capture(CaptureCtx {
                        event,
                        builder: &builder,
                        sender: &sender,
                        events: &events_bus,
                        controlled: &controlled,
                        coordinator: &coordinator,
                        streams: &streams,
                        screen_size: (width, height),
                        threshold: crate::constants::DEFAULT_SCREEN_THRESHOLD,
                    });
                }
            }));
        }

        log::info!("[Client] Started");
        Ok(Self {
            config,
            transport,
            events,
            sender,
            coordinator,
            controlled,
            server_size,
            found_servers,
            choice_needed,
            streams,
            running,
            tasks,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_controlled(&self) -> bool {
        self.controlled.lock().expect("controlled lock").is_some()
    }

    /// Discovery results pending an operator decision.
    pub fn found_servers(&self) -> Vec<DiscoveredServer> {
        self.found_servers.lock().expect("found lock").clone()
    }

    pub fn server_choice_needed(&self) -> bool {
        self.choice_needed.load(Ordering::SeqCst)
    }

    /// Resolve a pending discovery choice (daemon `choose_server`).
    pub fn choose_server(&self, host: String, port: u16) {
        self.choice_needed.store(false, Ordering::SeqCst);
        self.transport.choose_server(host, port);
    }

    pub fn set_stream(&self, stream: &str, enabled: bool) -> bool {
        self.streams.lock().expect("streams lock").set(stream, enabled)
    }

    pub fn streams(&self) -> StreamSettings {
        *self.streams.lock().expect("streams lock")
    }

    pub fn status(&self) -> Value {
        serde_json::json!({
            "running": self.is_running(),
            "server_host": self.config.server_host,
            "server_port": self.config.server_port,
            "connected": self.is_connected(),
            "controlled": self.is_controlled(),
            "server_screen": self.server_size.lock().expect("size lock")
                .map(|(w, h)| format!("{w}x{h}")),
            "enabled_streams": Value::Object(self.streams().as_map()),
            "ssl_enabled": self.config.ssl_enabled,
            "transfer": self.coordinator.status(),
        })
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("[Client] Stopping");
        self.transport.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        self.sender.shutdown();
        self.events.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Expand a mouse message into its events (batch or single form).
fn unpack_mouse(msg: &Message) -> Vec<MouseEvent> {
    if let Some(events) = msg.payload.get("events").and_then(Value::as_array) {
        events
            .iter()
            .filter_map(Value::as_object)
            .map(MouseEvent::from_payload)
            .collect()
    } else {
        vec![MouseEvent::from_payload(&msg.payload)]
    }
}

fn unpack_keyboard(msg: &Message) -> Vec<KeyboardEvent> {
    if let Some(events) = msg.payload.get("events").and_then(Value::as_array) {
        events
            .iter()
            .filter_map(Value::as_object)
            .map(KeyboardEvent::from_payload)
            .collect()
    } else {
        vec![KeyboardEvent::from_payload(&msg.payload)]
    }
}

async fn handle_control(
    msg: &Message,
    mouse: &Arc<dyn MouseController>,
    events: &Arc<EventBus>,
    controlled: &Arc<Mutex<Option<ScreenPosition>>>,
    screen_size: (i32, i32),
) {
    match msg.command() {
        Some(CMD_CROSS_SCREEN) => {
            let params = msg.command_params();
            let position = params
                .get("screen")
                .and_then(Value::as_str)
                .and_then(ScreenPosition::parse);
            let x = params.get("x").and_then(Value::as_f64).unwrap_or(0.5)
                * f64::from(screen_size.0.max(1));
            let y = params.get("y").and_then(Value::as_f64).unwrap_or(0.5)
                * f64::from(screen_size.1.max(1));

            mouse.set_position(x, y).await;
            *controlled.lock().expect("controlled lock") = position;
            events.publish(BusEvent::ClientActive);
            log::info!("[Client] Controlled as {position:?}, cursor at ({x:.0},{y:.0})");
        }
        Some(CMD_DISCONNECT) => {
            log::info!("[Client] Server requested disconnect");
            controlled.lock().expect("controlled lock").take();
            events.publish(BusEvent::ClientInactive);
        }
        other => log::debug!("[Client] Unhandled control command {other:?}"),
    }
}

struct CaptureCtx<'a> {
    event: CapturedEvent,
    builder: &'a Arc<MessageBuilder>,
    sender: &'a Arc<MessageSender>,
    events: &'a Arc<EventBus>,
    controlled: &'a Arc<Mutex<Option<ScreenPosition>>>,
    coordinator: &'a Arc<FileCoordinator>,
    streams: &'a Arc<Mutex<StreamSettings>>,
    screen_size: (i32, i32),
    threshold: i32,
}

fn handle_capture(ctx: CaptureCtx<'_>) {
    let streams = *ctx.streams.lock().expect("streams lock");
    let (width, height) = ctx.screen_size;

    match ctx.event {
        CapturedEvent::Mouse(mouse) => {
            if mouse.event != MOUSE_MOVE {
                return;
            }
            let Some(position) = *ctx.controlled.lock().expect("controlled lock") else {
                return;
            };
            // The edge facing the server is the opposite of our own
            // position: a left client returns over its right edge.
            let t = f64::from(ctx.threshold);
            let at_return_edge = match position.opposite() {
                ScreenPosition::Left => mouse.x <= t,
                ScreenPosition::Right => mouse.x >= f64::from(width) - t,
                ScreenPosition::Up => mouse.y <= t,
                ScreenPosition::Down => mouse.y >= f64::from(height) - t,
            };
            if !at_return_edge {
                return;
            }

            let coord = match position {
                ScreenPosition::Left | ScreenPosition::Right => {
                    mouse.y / f64::from(height.max(1))
                }
                ScreenPosition::Up | ScreenPosition::Down => mouse.x / f64::from(width.max(1)),
            };
            let mut params = serde_json::Map::new();
            params.insert("direction".into(), Value::String(position.to_string()));
            params.insert("coord".into(), Value::from(coord));
            let msg = ctx.builder.command(TARGET_SERVER, CMD_RETURN, params);
            ctx.sender.send(PRIORITY_SCREEN_NOTIFICATION, msg);

            ctx.controlled.lock().expect("controlled lock").take();
            ctx.events.publish(BusEvent::ClientInactive);
            log::info!("[Client] Return edge hit; control goes back to the server");
        }
        CapturedEvent::Clipboard(clip) => {
            if !streams.clipboard {
                return;
            }
            let msg = ctx.builder.clipboard(TARGET_SERVER, &clip);
            ctx.sender.send(PRIORITY_CLIPBOARD, msg);
        }
        CapturedEvent::Keyboard(_) => {
            // Local typing on a client stays local.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBuilder as MB;

    #[test]
    fn test_unpack_single_and_batch_mouse() {
        let b = MB::new("server");
        let single = b.mouse("left", &MouseEvent::motion(0.5, 0.25));
        assert_eq!(unpack_mouse(&single).len(), 1);

        let batch = b.mouse_batch(
            "left",
            &[MouseEvent::motion(0.1, 0.1), MouseEvent::motion(0.2, 0.2)],
        );
        let events = unpack_mouse(&batch);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].x, 0.1);
        assert_eq!(events[1].x, 0.2);
    }

    #[test]
    fn test_unpack_keyboard_batch_order() {
        let b = MB::new("server");
        let batch = b.keyboard_batch(
            "left",
            &[KeyboardEvent::press("a"), KeyboardEvent::release("a")],
        );
        let events = unpack_keyboard(&batch);
        assert_eq!(events[0].event, "press");
        assert_eq!(events[1].event, "release");
    }

    #[tokio::test]
    async fn test_cross_screen_marks_controlled() {
        let input = HeadlessInput::new(1280, 720);
        let events = EventBus::new();
        let controlled = Arc::new(Mutex::new(None));
        let b = MB::new("server");

        let mut params = serde_json::Map::new();
        params.insert("x".into(), Value::from(1.0));
        params.insert("y".into(), Value::from(0.5));
        params.insert("screen".into(), Value::String("left".into()));
        let msg = b.command("left", CMD_CROSS_SCREEN, params);

        let mouse: Arc<dyn MouseController> = input.clone();
        handle_control(&msg, &mouse, &events, &controlled, (1280, 720)).await;

        assert_eq!(*controlled.lock().unwrap(), Some(ScreenPosition::Left));
        assert_eq!(input.position().await, (1280.0, 360.0));
    }

    #[tokio::test]
    async fn test_return_edge_sends_return_and_deactivates() {
        let (capture, _rx) = CaptureChannel::new();
        let _ = capture; // capture channel itself not needed below

        let builder = Arc::new(MB::new("client"));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let sender = Arc::new(MessageSender::spawn(move |_t, m| {
            let _ = out_tx.send(m.clone());
        }));
        let events = EventBus::new();
        let controlled = Arc::new(Mutex::new(Some(ScreenPosition::Left)));
        let coordinator = FileCoordinator::new(
            CoordinatorRole::Client,
            Arc::clone(&builder),
            Arc::new(|_, _| {}),
            Arc::new(|| vec![]),
            std::env::temp_dir(),
        );
        let streams = Arc::new(Mutex::new(StreamSettings::default()));

        // Left client: the return edge is its right side.
        handle_capture(CaptureCtx {
            event: CapturedEvent::Mouse(MouseEvent::motion(1275.0, 400.0)),
            builder: &builder,
            sender: &sender,
            events: &events,
            controlled: &controlled,
            coordinator: &coordinator,
            streams: &streams,
            screen_size: (1280, 720),
            threshold: 10,
        });

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.command(), Some(CMD_RETURN));
        let params = msg.command_params();
        assert_eq!(params.get("direction").and_then(Value::as_str), Some("left"));
        let coord = params.get("coord").and_then(Value::as_f64).unwrap();
        assert!((coord - 400.0 / 720.0).abs() < 1e-9);
        assert!(controlled.lock().unwrap().is_none());

        sender.shutdown();
    }
}
