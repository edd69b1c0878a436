//! Daemon: lifecycle owner and IPC command dispatcher.
//!
//! The daemon holds at most one server role and one client role, never
//! both at once, and exposes every management surface over the local
//! control socket. Lifecycle failures surface as `{success:false,
//! error}`; runtime failures only reach the logs.

pub mod certshare;
pub mod commands;
pub mod ipc;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::Notify;

use crate::client::{Client, ClientCapabilities};
use crate::config::{AppConfig, ClientConfig, ClientEntry, ServerConfig};
use crate::constants::{DISCOVERY_WINDOW, SHUTDOWN_ACK_DELAY, VERSION};
use crate::error::LifecycleError;
use crate::net::tls;
use crate::screen::ScreenPosition;
use crate::server::{Server, ServerCapabilities};

use commands::{CommandRequest, DaemonResponse};
use ipc::{CommandHandler, IpcServer};

/// Local screen size for the routing core.
///
/// Real probing is a platform concern; deployments set
/// `PERPETUA_SCREEN_SIZE=WxH`, everything else gets a common default.
fn local_screen_size() -> (i32, i32) {
    std::env::var("PERPETUA_SCREEN_SIZE")
        .ok()
        .and_then(|s| crate::protocol::parse_screen_size(&s))
        .map_or((1920, 1080), |(w, h)| (w as i32, h as i32))
}

/// Shared daemon state behind the IPC handler.
pub struct DaemonState {
    server: tokio::sync::Mutex<Option<Server>>,
    client: tokio::sync::Mutex<Option<Client>>,
    server_config: Mutex<ServerConfig>,
    client_config: Mutex<ClientConfig>,
    share_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    pending_otp: Mutex<Option<String>>,
    otp_required: AtomicBool,
    shutdown: Notify,
    shutting_down: AtomicBool,
    advertise: bool,
    socket_path: PathBuf,
}

impl std::fmt::Debug for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonState")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl DaemonState {
    pub fn new(
        server_config: ServerConfig,
        client_config: ClientConfig,
        socket_path: PathBuf,
        advertise: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            server: tokio::sync::Mutex::new(None),
            client: tokio::sync::Mutex::new(None),
            server_config: Mutex::new(server_config),
            client_config: Mutex::new(client_config),
            share_task: Mutex::new(None),
            pending_otp: Mutex::new(None),
            otp_required: AtomicBool::new(false),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
            advertise,
            socket_path,
        })
    }

    /// Completes once a `shutdown` command or signal lands.
    pub async fn wait_for_shutdown(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        self.shutdown.notified().await;
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Stop whatever role is running.
    pub async fn stop_roles(&self) {
        if let Some(mut server) = self.server.lock().await.take() {
            server.stop();
        }
        if let Some(mut client) = self.client.lock().await.take() {
            client.stop();
        }
        if let Some(task) = self.share_task.lock().expect("share lock").take() {
            task.abort();
        }
    }

    // ==================== Lifecycle ====================

    async fn start_server(&self) -> DaemonResponse {
        let mut server_slot = self.server.lock().await;
        if server_slot.as_ref().is_some_and(Server::is_running) {
            return DaemonResponse::err(LifecycleError::AlreadyRunning("server"));
        }
        if self.client.lock().await.as_ref().is_some_and(Client::is_running) {
            return DaemonResponse::err(LifecycleError::MutualExclusion("server"));
        }

        let config = self.server_config.lock().expect("config lock").clone();
        let (width, height) = local_screen_size();
        match Server::start(
            config,
            ServerCapabilities::headless(width, height),
            self.advertise,
        )
        .await
        {
            Ok(server) => {
                let data = json!({
                    "message": "Server started successfully",
                    "host": "0.0.0.0",
                    "port": server.port(),
                    "enabled_streams": Value::Object(server.streams().as_map()),
                });
                *server_slot = Some(server);
                DaemonResponse::ok(data)
            }
            Err(e) => DaemonResponse::err(format!("Error starting server: {e:#}")),
        }
    }

    async fn stop_server(&self) -> DaemonResponse {
        let mut server_slot = self.server.lock().await;
        match server_slot.take() {
            Some(mut server) if server.is_running() => {
                server.stop();
                DaemonResponse::ok(json!({"message": "Server stopped successfully"}))
            }
            _ => DaemonResponse::err(LifecycleError::NotRunning("server")),
        }
    }

    async fn start_client(&self) -> DaemonResponse {
        // Lock order is always server before client, matching the other
        // handlers, so concurrent lifecycle commands cannot deadlock.
        let server_slot = self.server.lock().await;
        let mut client_slot = self.client.lock().await;
        if client_slot.as_ref().is_some_and(Client::is_running) {
            return DaemonResponse::err(LifecycleError::AlreadyRunning("client"));
        }
        if server_slot.as_ref().is_some_and(Server::is_running) {
            return DaemonResponse::err(LifecycleError::MutualExclusion("client"));
        }
        drop(server_slot);

        let config = self.client_config.lock().expect("config lock").clone();
        let (width, height) = local_screen_size();
        match Client::start(config.clone(), ClientCapabilities::headless(width, height)) {
            Ok(client) => {
                let data = json!({
                    "message": "Client started successfully",
                    "server_host": config.server_host,
                    "server_port": config.server_port,
                    "enabled_streams": Value::Object(client.streams().as_map()),
                });
                *client_slot = Some(client);
                DaemonResponse::ok(data)
            }
            Err(e) => DaemonResponse::err(format!("Error starting client: {e:#}")),
        }
    }

    async fn stop_client(&self) -> DaemonResponse {
        let mut client_slot = self.client.lock().await;
        match client_slot.take() {
            Some(mut client) if client.is_running() => {
                client.stop();
                DaemonResponse::ok(json!({"message": "Client stopped successfully"}))
            }
            _ => DaemonResponse::err(LifecycleError::NotRunning("client")),
        }
    }

    // ==================== Status ====================

    async fn status(&self) -> DaemonResponse {
        let server = self.server.lock().await;
        let client = self.client.lock().await;
        let server_running = server.as_ref().is_some_and(Server::is_running);
        let client_running = client.as_ref().is_some_and(Client::is_running);

        let mut data = json!({
            "daemon_running": true,
            "version": VERSION,
            "server_running": server_running,
            "client_running": client_running,
            "platform": if cfg!(windows) { "windows" } else { "unix" },
            "socket_path": self.socket_path.to_string_lossy(),
        });
        if let Some(server) = server.as_ref().filter(|s| s.is_running()) {
            data["server_info"] = server.status();
        }
        if let Some(client) = client.as_ref().filter(|c| c.is_running()) {
            data["client_info"] = client.status();
        }
        DaemonResponse::ok(data)
    }

    async fn server_status(&self) -> DaemonResponse {
        match self.server.lock().await.as_ref() {
            Some(server) if server.is_running() => DaemonResponse::ok(server.status()),
            _ => DaemonResponse::ok(json!({"running": false})),
        }
    }

    async fn client_status(&self) -> DaemonResponse {
        match self.client.lock().await.as_ref() {
            Some(client) if client.is_running() => DaemonResponse::ok(client.status()),
            _ => DaemonResponse::ok(json!({"running": false})),
        }
    }

    // ==================== Configuration ====================

    fn get_server_config(&self) -> DaemonResponse {
        let config = self.server_config.lock().expect("config lock").clone();
        match serde_json::to_value(&config) {
            Ok(v) => DaemonResponse::ok(v),
            Err(e) => DaemonResponse::err(e),
        }
    }

    fn set_server_config(&self, params: &Map<String, Value>) -> DaemonResponse {
        let mut config = self.server_config.lock().expect("config lock");
        match merge_config(&*config, params) {
            Ok(updated) => {
                *config = updated;
                DaemonResponse::ok(json!({"message": "Server config updated"}))
            }
            Err(e) => DaemonResponse::err(format!("Invalid server config: {e}")),
        }
    }

    fn get_client_config(&self) -> DaemonResponse {
        let config = self.client_config.lock().expect("config lock").clone();
        match serde_json::to_value(&config) {
            Ok(v) => DaemonResponse::ok(v),
            Err(e) => DaemonResponse::err(e),
        }
    }

    fn set_client_config(&self, params: &Map<String, Value>) -> DaemonResponse {
        let mut config = self.client_config.lock().expect("config lock");
        match merge_config(&*config, params) {
            Ok(updated) => {
                *config = updated;
                DaemonResponse::ok(json!({"message": "Client config updated"}))
            }
            Err(e) => DaemonResponse::err(format!("Invalid client config: {e}")),
        }
    }

    fn save_config(&self) -> DaemonResponse {
        let server = self.server_config.lock().expect("config lock").clone();
        let client = self.client_config.lock().expect("config lock").clone();
        if let Err(e) = server.save().and_then(|()| client.save()) {
            return DaemonResponse::err(format!("Failed to save config: {e:#}"));
        }
        DaemonResponse::ok(json!({"message": "Configuration saved"}))
    }

    fn reload_config(&self) -> DaemonResponse {
        match (ServerConfig::load(), ClientConfig::load()) {
            (Ok(server), Ok(client)) => {
                *self.server_config.lock().expect("config lock") = server;
                *self.client_config.lock().expect("config lock") = client;
                DaemonResponse::ok(json!({
                    "message": "Configuration reloaded; restart roles to apply"
                }))
            }
            (Err(e), _) | (_, Err(e)) => {
                DaemonResponse::err(format!("Failed to reload config: {e:#}"))
            }
        }
    }

    // ==================== Streams ====================

    async fn set_stream(&self, params: &Map<String, Value>, enabled: bool) -> DaemonResponse {
        let Some(stream) = params.get("stream").and_then(Value::as_str) else {
            return DaemonResponse::err("Missing 'stream' parameter");
        };

        let mut applied = false;
        if let Some(server) = self.server.lock().await.as_ref() {
            applied |= server.set_stream(stream, enabled);
        }
        if let Some(client) = self.client.lock().await.as_ref() {
            applied |= client.set_stream(stream, enabled);
        }
        applied |= self
            .server_config
            .lock()
            .expect("config lock")
            .streams
            .set(stream, enabled);
        self.client_config
            .lock()
            .expect("config lock")
            .streams
            .set(stream, enabled);

        if applied {
            DaemonResponse::ok(json!({"stream": stream, "enabled": enabled}))
        } else {
            DaemonResponse::err(format!("Unknown stream: {stream}"))
        }
    }

    async fn get_streams(&self) -> DaemonResponse {
        if let Some(server) = self.server.lock().await.as_ref() {
            return DaemonResponse::ok(Value::Object(server.streams().as_map()));
        }
        if let Some(client) = self.client.lock().await.as_ref() {
            return DaemonResponse::ok(Value::Object(client.streams().as_map()));
        }
        let streams = self.server_config.lock().expect("config lock").streams;
        DaemonResponse::ok(Value::Object(streams.as_map()))
    }

    // ==================== Registered clients ====================

    fn add_client(&self, params: &Map<String, Value>) -> DaemonResponse {
        let entry = match parse_client_entry(params) {
            Ok(entry) => entry,
            Err(e) => return DaemonResponse::err(e),
        };
        let mut config = self.server_config.lock().expect("config lock");
        if config.client_at(entry.position).is_some() {
            return DaemonResponse::err(format!(
                "A client is already registered at {}",
                entry.position
            ));
        }
        config.clients.push(entry.clone());
        DaemonResponse::ok(json!({"message": "Client added", "position": entry.position}))
    }

    fn remove_client(&self, params: &Map<String, Value>) -> DaemonResponse {
        let Some(position) = params
            .get("position")
            .and_then(Value::as_str)
            .and_then(ScreenPosition::parse)
        else {
            return DaemonResponse::err("Missing or invalid 'position' parameter");
        };
        let mut config = self.server_config.lock().expect("config lock");
        let before = config.clients.len();
        config.clients.retain(|c| c.position != position);
        if config.clients.len() == before {
            return DaemonResponse::err(format!("No client registered at {position}"));
        }
        DaemonResponse::ok(json!({"message": "Client removed"}))
    }

    fn edit_client(&self, params: &Map<String, Value>) -> DaemonResponse {
        let entry = match parse_client_entry(params) {
            Ok(entry) => entry,
            Err(e) => return DaemonResponse::err(e),
        };
        let mut config = self.server_config.lock().expect("config lock");
        match config.clients.iter_mut().find(|c| c.position == entry.position) {
            Some(slot) => {
                *slot = entry;
                DaemonResponse::ok(json!({"message": "Client updated"}))
            }
            None => DaemonResponse::err(format!("No client registered at {}", entry.position)),
        }
    }

    fn list_clients(&self) -> DaemonResponse {
        let config = self.server_config.lock().expect("config lock");
        match serde_json::to_value(&config.clients) {
            Ok(v) => DaemonResponse::ok(v),
            Err(e) => DaemonResponse::err(e),
        }
    }

    // ==================== TLS ====================

    async fn enable_ssl(&self) -> DaemonResponse {
        if self.server.lock().await.as_ref().is_some_and(Server::is_running) {
            return DaemonResponse::err("Stop the server before changing SSL settings");
        }

        let (certfile, keyfile) = match (AppConfig::default_certfile(), AppConfig::default_keyfile())
        {
            (Ok(c), Ok(k)) => (c, k),
            (Err(e), _) | (_, Err(e)) => return DaemonResponse::err(format!("{e:#}")),
        };
        if !certfile.exists() || !keyfile.exists() {
            if let Err(e) = tls::generate_identity(&certfile, &keyfile) {
                return DaemonResponse::err(format!("Certificate generation failed: {e:#}"));
            }
        }

        {
            let mut config = self.server_config.lock().expect("config lock");
            config.ssl_enabled = true;
            config.certfile = Some(certfile.clone());
            config.keyfile = Some(keyfile);
        }
        self.client_config.lock().expect("config lock").ssl_enabled = true;
        DaemonResponse::ok(json!({
            "message": "SSL enabled",
            "certfile": certfile.to_string_lossy(),
        }))
    }

    async fn disable_ssl(&self) -> DaemonResponse {
        if self.server.lock().await.as_ref().is_some_and(Server::is_running) {
            return DaemonResponse::err("Stop the server before changing SSL settings");
        }
        self.server_config.lock().expect("config lock").ssl_enabled = false;
        self.client_config.lock().expect("config lock").ssl_enabled = false;
        DaemonResponse::ok(json!({"message": "SSL disabled"}))
    }

    async fn share_certificate(&self) -> DaemonResponse {
        let certfile = {
            let config = self.server_config.lock().expect("config lock");
            match &config.certfile {
                Some(path) if path.exists() => path.clone(),
                _ => {
                    return DaemonResponse::err(
                        "No certificate available to share; run enable_ssl first",
                    )
                }
            }
        };

        let otp = certshare::generate_otp();
        match certshare::share(certfile, otp.clone()).await {
            Ok((port, task)) => {
                if let Some(previous) = self
                    .share_task
                    .lock()
                    .expect("share lock")
                    .replace(task)
                {
                    previous.abort();
                }
                DaemonResponse::ok(json!({"otp": otp, "port": port}))
            }
            Err(e) => DaemonResponse::err(format!("Failed to share certificate: {e:#}")),
        }
    }

    async fn receive_certificate(&self, params: &Map<String, Value>) -> DaemonResponse {
        let Some(host) = params.get("host").and_then(Value::as_str) else {
            return DaemonResponse::err("Missing 'host' parameter");
        };
        let Some(port) = params.get("port").and_then(Value::as_u64) else {
            return DaemonResponse::err("Missing 'port' parameter");
        };
        let otp = params
            .get("otp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.pending_otp.lock().expect("otp lock").clone());
        let Some(otp) = otp else {
            self.otp_required.store(true, Ordering::SeqCst);
            return DaemonResponse::err("OTP required; provide it via set_otp");
        };
        self.otp_required.store(false, Ordering::SeqCst);

        let pem = match certshare::receive(host, port as u16, &otp).await {
            Ok(pem) => pem,
            Err(e) => return DaemonResponse::err(format!("Certificate transfer failed: {e:#}")),
        };

        let certfile = match AppConfig::default_certfile() {
            Ok(path) => path,
            Err(e) => return DaemonResponse::err(format!("{e:#}")),
        };
        if let Err(e) = std::fs::write(&certfile, &pem) {
            return DaemonResponse::err(format!("Failed to store certificate: {e}"));
        }

        {
            let mut config = self.client_config.lock().expect("config lock");
            config.ssl_enabled = true;
            config.certfile = Some(certfile.clone());
        }
        self.pending_otp.lock().expect("otp lock").take();
        DaemonResponse::ok(json!({
            "message": "Certificate received",
            "certfile": certfile.to_string_lossy(),
        }))
    }

    fn set_otp(&self, params: &Map<String, Value>) -> DaemonResponse {
        let Some(otp) = params.get("otp").and_then(Value::as_str) else {
            return DaemonResponse::err("Missing 'otp' parameter");
        };
        *self.pending_otp.lock().expect("otp lock") = Some(otp.to_string());
        self.otp_required.store(false, Ordering::SeqCst);
        DaemonResponse::ok(json!({"message": "OTP stored"}))
    }

    fn check_otp_needed(&self) -> DaemonResponse {
        DaemonResponse::ok(json!({"needed": self.otp_required.load(Ordering::SeqCst)}))
    }

    // ==================== Discovery ====================

    async fn discover_services(&self) -> DaemonResponse {
        match crate::discovery::discover_servers(DISCOVERY_WINDOW).await {
            Ok(found) => DaemonResponse::ok(Value::Array(
                found.iter().map(crate::discovery::DiscoveredServer::as_json).collect(),
            )),
            Err(e) => DaemonResponse::err(format!("Discovery failed: {e:#}")),
        }
    }

    async fn get_found_servers(&self) -> DaemonResponse {
        if let Some(client) = self.client.lock().await.as_ref() {
            let found = client.found_servers();
            return DaemonResponse::ok(Value::Array(
                found.iter().map(crate::discovery::DiscoveredServer::as_json).collect(),
            ));
        }
        self.discover_services().await
    }

    async fn check_server_choice_needed(&self) -> DaemonResponse {
        let needed = self
            .client
            .lock()
            .await
            .as_ref()
            .is_some_and(Client::server_choice_needed);
        DaemonResponse::ok(json!({"needed": needed}))
    }

    async fn choose_server(&self, params: &Map<String, Value>) -> DaemonResponse {
        let Some(host) = params.get("host").and_then(Value::as_str) else {
            return DaemonResponse::err("Missing 'host' parameter");
        };
        let port = params
            .get("port")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(crate::constants::DEFAULT_SERVER_PORT)) as u16;

        match self.client.lock().await.as_ref() {
            Some(client) => {
                client.choose_server(host.to_string(), port);
                DaemonResponse::ok(json!({"message": format!("Selected {host}:{port}")}))
            }
            None => DaemonResponse::err(LifecycleError::NotRunning("client")),
        }
    }

    // ==================== Shutdown ====================

    fn schedule_shutdown(state: Arc<Self>) -> DaemonResponse {
        tokio::spawn(async move {
            // Let the acknowledging response flush first.
            tokio::time::sleep(SHUTDOWN_ACK_DELAY).await;
            state.request_shutdown();
        });
        DaemonResponse::ok(json!({"message": "Daemon shutting down"}))
    }
}

/// Shallow-merge `params` over the JSON form of `config`.
fn merge_config<T: serde::Serialize + for<'de> serde::Deserialize<'de>>(
    config: &T,
    params: &Map<String, Value>,
) -> Result<T, serde_json::Error> {
    let mut value = serde_json::to_value(config)?;
    if let Value::Object(map) = &mut value {
        for (k, v) in params {
            map.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(value)
}

fn parse_client_entry(params: &Map<String, Value>) -> Result<ClientEntry, String> {
    let position = params
        .get("position")
        .and_then(Value::as_str)
        .and_then(ScreenPosition::parse)
        .ok_or("Missing or invalid 'position' parameter")?;
    let address = params
        .get("address")
        .and_then(Value::as_str)
        .ok_or("Missing 'address' parameter")?
        .to_string();
    let hostname = params
        .get("hostname")
        .and_then(Value::as_str)
        .map(str::to_string);
    let key_map = params
        .get("key_map")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(ClientEntry {
        position,
        address,
        hostname,
        key_map,
    })
}

#[async_trait]
impl CommandHandler for DaemonState {
    async fn handle(&self, request: CommandRequest) -> DaemonResponse {
        let params = &request.params;

        match request.command.as_str() {
            commands::PING => DaemonResponse::ok(json!({"message": "pong", "version": VERSION})),
            commands::START_SERVER => self.start_server().await,
            commands::STOP_SERVER => self.stop_server().await,
            commands::START_CLIENT => self.start_client().await,
            commands::STOP_CLIENT => self.stop_client().await,
            commands::STATUS => self.status().await,
            commands::SERVER_STATUS => self.server_status().await,
            commands::CLIENT_STATUS => self.client_status().await,
            commands::GET_SERVER_CONFIG => self.get_server_config(),
            commands::SET_SERVER_CONFIG => self.set_server_config(params),
            commands::GET_CLIENT_CONFIG => self.get_client_config(),
            commands::SET_CLIENT_CONFIG => self.set_client_config(params),
            commands::SAVE_CONFIG => self.save_config(),
            commands::RELOAD_CONFIG => self.reload_config(),
            commands::ENABLE_STREAM => self.set_stream(params, true).await,
            commands::DISABLE_STREAM => self.set_stream(params, false).await,
            commands::GET_STREAMS => self.get_streams().await,
            commands::ADD_CLIENT => self.add_client(params),
            commands::REMOVE_CLIENT => self.remove_client(params),
            commands::EDIT_CLIENT => self.edit_client(params),
            commands::LIST_CLIENTS => self.list_clients(),
            commands::ENABLE_SSL => self.enable_ssl().await,
            commands::DISABLE_SSL => self.disable_ssl().await,
            commands::SHARE_CERTIFICATE => self.share_certificate().await,
            commands::RECEIVE_CERTIFICATE => self.receive_certificate(params).await,
            commands::SET_OTP => self.set_otp(params),
            commands::CHECK_OTP_NEEDED => self.check_otp_needed(),
            commands::DISCOVER_SERVICES => self.discover_services().await,
            commands::GET_FOUND_SERVERS => self.get_found_servers().await,
            commands::CHOOSE_SERVER => self.choose_server(params).await,
            commands::CHECK_SERVER_CHOICE_NEEDED => self.check_server_choice_needed().await,
            commands::SHUTDOWN => DaemonResponse::err("shutdown requires the daemon wrapper"),
            other => DaemonResponse::err(format!("Unknown command: {other}")),
        }
    }
}

/// Wrapper that owns the Arc so `shutdown` can schedule the stop.
struct DaemonHandler(Arc<DaemonState>);

#[async_trait]
impl CommandHandler for DaemonHandler {
    async fn handle(&self, request: CommandRequest) -> DaemonResponse {
        if request.command == commands::SHUTDOWN {
            return DaemonState::schedule_shutdown(Arc::clone(&self.0));
        }
        self.0.handle(request).await
    }
}

/// The daemon process: control socket + role lifecycle + PID file.
pub struct Daemon {
    state: Arc<DaemonState>,
    ipc: Option<IpcServer>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Load configuration, bind the control socket, write the PID file.
    pub fn start(socket_path: Option<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.unwrap_or_else(ipc::default_socket_path);
        let server_config = ServerConfig::load().context("Failed to load server config")?;
        let client_config = ClientConfig::load().context("Failed to load client config")?;

        let state = DaemonState::new(server_config, client_config, socket_path.clone(), true);
        let ipc = IpcServer::start(socket_path, Arc::new(DaemonHandler(Arc::clone(&state))))?;

        let pid_path = AppConfig::pid_file_path()?;
        std::fs::write(&pid_path, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", pid_path.display()))?;
        log::info!("[Daemon] Started (pid {})", std::process::id());

        Ok(Self {
            state,
            ipc: Some(ipc),
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Park until a shutdown is requested.
    pub async fn wait_for_shutdown(&self) {
        self.state.wait_for_shutdown().await;
    }

    /// Stop roles, close the control socket, remove the PID file.
    pub async fn stop(&mut self) {
        log::info!("[Daemon] Stopping");
        self.state.stop_roles().await;
        if let Some(ipc) = self.ipc.take() {
            ipc.shutdown();
        }
        if let Ok(path) = AppConfig::pid_file_path() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> Arc<DaemonState> {
        let server_config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        let client_config = ClientConfig {
            server_host: "127.0.0.1".into(),
            server_port: 1, // nothing listens; the client just retries
            reconnect_interval: 60,
            ..ClientConfig::default()
        };
        DaemonState::new(
            server_config,
            client_config,
            PathBuf::from("/tmp/perpetua_test.sock"),
            false,
        )
    }

    fn request(command: &str) -> CommandRequest {
        CommandRequest {
            command: command.into(),
            params: Map::new(),
        }
    }

    fn request_with(command: &str, params: Value) -> CommandRequest {
        CommandRequest {
            command: command.into(),
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let state = test_state();
        let response = state.handle(request(commands::PING)).await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["message"], "pong");
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let state = test_state();
        let response = state.handle(request("frobnicate")).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap(), "Unknown command: frobnicate");
    }

    #[tokio::test]
    async fn test_mutual_exclusion_server_then_client() {
        let state = test_state();

        let response = state.handle(request(commands::START_SERVER)).await;
        assert!(response.success, "server should start: {:?}", response.error);

        let response = state.handle(request(commands::START_CLIENT)).await;
        assert!(!response.success);
        assert_eq!(
            response.error.unwrap(),
            "Cannot start client while server is running"
        );
        // Neither service changed state.
        let status = state.handle(request(commands::STATUS)).await.data.unwrap();
        assert_eq!(status["server_running"], true);
        assert_eq!(status["client_running"], false);

        state.stop_roles().await;
    }

    #[tokio::test]
    async fn test_mutual_exclusion_client_then_server() {
        let state = test_state();

        let response = state.handle(request(commands::START_CLIENT)).await;
        assert!(response.success, "client should start: {:?}", response.error);

        let response = state.handle(request(commands::START_SERVER)).await;
        assert!(!response.success);
        assert_eq!(
            response.error.unwrap(),
            "Cannot start server while client is running"
        );

        state.stop_roles().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_fails_cleanly() {
        let state = test_state();
        let response = state.handle(request(commands::STOP_SERVER)).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap(), "Server not running");

        let response = state.handle(request(commands::STOP_CLIENT)).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap(), "Client not running");
    }

    #[tokio::test]
    async fn test_server_lifecycle_roundtrip() {
        let state = test_state();

        assert!(state.handle(request(commands::START_SERVER)).await.success);
        let again = state.handle(request(commands::START_SERVER)).await;
        assert!(!again.success);
        assert_eq!(again.error.unwrap(), "Server already running");

        assert!(state.handle(request(commands::STOP_SERVER)).await.success);
        // After stop, the client may start.
        assert!(state.handle(request(commands::START_CLIENT)).await.success);
        state.stop_roles().await;
    }

    #[tokio::test]
    async fn test_client_crud() {
        let state = test_state();

        let response = state
            .handle(request_with(
                commands::ADD_CLIENT,
                json!({"position": "left", "address": "10.0.0.2"}),
            ))
            .await;
        assert!(response.success);

        // Duplicate position is rejected.
        let response = state
            .handle(request_with(
                commands::ADD_CLIENT,
                json!({"position": "left", "address": "10.0.0.3"}),
            ))
            .await;
        assert!(!response.success);

        let response = state
            .handle(request_with(
                commands::EDIT_CLIENT,
                json!({"position": "left", "address": "10.0.0.9", "key_map": {"cmd": "ctrl"}}),
            ))
            .await;
        assert!(response.success);

        let list = state.handle(request(commands::LIST_CLIENTS)).await.data.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["address"], "10.0.0.9");

        assert!(
            state
                .handle(request_with(commands::REMOVE_CLIENT, json!({"position": "left"})))
                .await
                .success
        );
        let list = state.handle(request(commands::LIST_CLIENTS)).await.data.unwrap();
        assert!(list.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_toggle_updates_config() {
        let state = test_state();
        let response = state
            .handle(request_with(commands::DISABLE_STREAM, json!({"stream": "clipboard"})))
            .await;
        assert!(response.success);

        let streams = state.handle(request(commands::GET_STREAMS)).await.data.unwrap();
        assert_eq!(streams["clipboard"], false);
        assert_eq!(streams["mouse"], true);

        let response = state
            .handle(request_with(commands::ENABLE_STREAM, json!({"stream": "nope"})))
            .await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_set_server_config_merges() {
        let state = test_state();
        let response = state
            .handle(request_with(
                commands::SET_SERVER_CONFIG,
                json!({"port": 6010, "screen_threshold": 25}),
            ))
            .await;
        assert!(response.success);

        let config = state.handle(request(commands::GET_SERVER_CONFIG)).await.data.unwrap();
        assert_eq!(config["port"], 6010);
        assert_eq!(config["screen_threshold"], 25);
        assert_eq!(config["host"], "127.0.0.1");
    }

    #[tokio::test]
    async fn test_otp_flow() {
        let state = test_state();
        let response = state.handle(request(commands::CHECK_OTP_NEEDED)).await;
        assert_eq!(response.data.unwrap()["needed"], false);

        // A receive without an OTP flags the prompt.
        let response = state
            .handle(request_with(
                commands::RECEIVE_CERTIFICATE,
                json!({"host": "127.0.0.1", "port": 1}),
            ))
            .await;
        assert!(!response.success);
        let response = state.handle(request(commands::CHECK_OTP_NEEDED)).await;
        assert_eq!(response.data.unwrap()["needed"], true);

        assert!(
            state
                .handle(request_with(commands::SET_OTP, json!({"otp": "123456"})))
                .await
                .success
        );
        let response = state.handle(request(commands::CHECK_OTP_NEEDED)).await;
        assert_eq!(response.data.unwrap()["needed"], false);
    }
}
