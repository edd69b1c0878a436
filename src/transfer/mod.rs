//! File-transfer coordinator.
//!
//! Tracks the cluster-wide ownership record (exactly one at a time),
//! answers paste requests, streams file bodies out, and — on the server —
//! bridges a transfer between two clients by forwarding `file_start`,
//! `file_chunk` and `file_end` to the requester with the payload left
//! untouched.
//!
//! Chunk bodies travel gzip-compressed and base64-encoded inside command
//! params, the same text embedding older peers speak.

pub mod writer;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;

use crate::constants::{FILE_CHUNK_SIZE, PRIORITY_FILE};
use crate::error::TransferError;
use crate::protocol::{
    Message, MessageBuilder, CMD_FILE_CHUNK, CMD_FILE_COPIED, CMD_FILE_END, CMD_FILE_REQUEST,
    CMD_FILE_START,
};
use crate::screen::ScreenPosition;

use writer::FileWriter;

/// Who currently owns the registered clipboard file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    /// This process, running the server role.
    LocalServer,
    /// This process, running the client role.
    LocalClient,
    /// Some other host (client-side view of any remote owner).
    External,
    /// A specific client screen (server-side view).
    Client(ScreenPosition),
}

impl Owner {
    pub fn label(&self) -> String {
        match self {
            Self::LocalServer => "local_server".into(),
            Self::LocalClient => "local_client".into(),
            Self::External => "external".into(),
            Self::Client(pos) => pos.to_string(),
        }
    }
}

/// The single active ownership record.
#[derive(Debug, Clone)]
pub struct OwnershipRecord {
    pub owner: Owner,
    pub file_name: String,
    pub file_size: u64,
    /// Source path; opaque to remote peers, used only by the owner.
    pub file_path: String,
}

/// Server-side bridge between two clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bridge {
    owner: ScreenPosition,
    requester: ScreenPosition,
}

/// Which role this coordinator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorRole {
    Server,
    Client,
}

/// Outgoing hook: `(priority, message)` into the role's send queue.
pub type SendFn = Arc<dyn Fn(u8, Message) + Send + Sync>;

/// Broadcast targets currently reachable (connected client labels on the
/// server, `["server"]` on a client).
pub type TargetsFn = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

struct CoordState {
    record: Option<OwnershipRecord>,
    bridge: Option<Bridge>,
    writer: Option<FileWriter>,
}

/// One coordinator per process, owned by the running role.
pub struct FileCoordinator {
    role: CoordinatorRole,
    builder: Arc<MessageBuilder>,
    send: SendFn,
    targets: TargetsFn,
    state: Mutex<CoordState>,
    /// An inbound transfer is active (request issued or writer running).
    processing: Arc<AtomicBool>,
    /// An outbound stream is active.
    uploading: Arc<AtomicBool>,
    save_dir: Mutex<PathBuf>,
}

impl std::fmt::Debug for FileCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCoordinator")
            .field("role", &self.role)
            .field("processing", &self.processing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl FileCoordinator {
    pub fn new(
        role: CoordinatorRole,
        builder: Arc<MessageBuilder>,
        send: SendFn,
        targets: TargetsFn,
        save_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            builder,
            send,
            targets,
            state: Mutex::new(CoordState {
                record: None,
                bridge: None,
                writer: None,
            }),
            processing: Arc::new(AtomicBool::new(false)),
            uploading: Arc::new(AtomicBool::new(false)),
            save_dir: Mutex::new(save_dir),
        })
    }

    pub fn set_save_dir(&self, dir: PathBuf) {
        *self.save_dir.lock().expect("save dir lock") = dir;
    }

    /// Current record, for status reporting.
    pub fn record(&self) -> Option<OwnershipRecord> {
        self.state.lock().expect("state lock").record.clone()
    }

    fn bridge(&self) -> Option<Bridge> {
        self.state.lock().expect("state lock").bridge
    }

    /// The local user copied a file: register and advertise ownership.
    pub fn handle_local_copy(&self, name: &str, size: u64, path: &str) {
        let owner = match self.role {
            CoordinatorRole::Server => Owner::LocalServer,
            CoordinatorRole::Client => Owner::LocalClient,
        };
        {
            let mut state = self.state.lock().expect("state lock");
            state.record = Some(OwnershipRecord {
                owner,
                file_name: name.to_string(),
                file_size: size,
                file_path: path.to_string(),
            });
        }
        log::info!("[Transfer] Registered local copy: {name} ({size} bytes)");

        for target in (self.targets)() {
            let msg = self
                .builder
                .command(&target, CMD_FILE_COPIED, copied_params(name, size, path));
            (self.send)(PRIORITY_FILE, msg);
        }
    }

    /// The local user pasted: request the registered file.
    pub fn handle_local_paste(&self, save_dir: Option<PathBuf>) {
        if let Some(dir) = save_dir {
            self.set_save_dir(dir);
        }

        let Some(record) = self.record() else {
            log::warn!("[Transfer] Paste with no file registered");
            return;
        };

        match (&record.owner, self.role) {
            (Owner::LocalServer | Owner::LocalClient, _) => {
                // The OS paste already has the bytes; nothing to fetch.
            }
            (Owner::Client(owner), CoordinatorRole::Server) => {
                if self.processing.swap(true, Ordering::SeqCst) {
                    log::warn!("[Transfer] Paste ignored: transfer already in progress");
                    return;
                }
                let msg = self.builder.command(
                    owner.as_str(),
                    CMD_FILE_REQUEST,
                    request_params(&record.file_path),
                );
                (self.send)(PRIORITY_FILE, msg);
            }
            (Owner::External, CoordinatorRole::Client) => {
                if self.processing.swap(true, Ordering::SeqCst) {
                    log::warn!("[Transfer] Paste ignored: transfer already in progress");
                    return;
                }
                let msg = self.builder.command(
                    "server",
                    CMD_FILE_REQUEST,
                    request_params(&record.file_path),
                );
                (self.send)(PRIORITY_FILE, msg);
            }
            (owner, role) => {
                log::warn!(
                    "[Transfer] Paste with inconsistent ownership {owner:?} for role {role:?}"
                );
            }
        }
    }

    /// Dispatch one file-lane message from `from`.
    pub async fn handle_message(&self, from: &str, msg: &Message) {
        let Some(command) = msg.command() else { return };
        let params = msg.command_params();

        match command {
            CMD_FILE_COPIED => self.on_file_copied(from, &params),
            CMD_FILE_REQUEST => self.on_file_request(from),
            CMD_FILE_START => self.on_file_start(from, msg, &params).await,
            CMD_FILE_CHUNK => self.on_file_chunk(from, msg, &params),
            CMD_FILE_END => self.on_file_end(from, msg),
            other => log::debug!("[Transfer] Ignoring non-file command {other}"),
        }
    }

    fn on_file_copied(&self, from: &str, params: &Map<String, Value>) {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let size = params.get("size").and_then(Value::as_u64).unwrap_or(0);
        let path = params.get("path").and_then(Value::as_str).unwrap_or_default();

        let owner = match self.role {
            CoordinatorRole::Server => match ScreenPosition::parse(from) {
                Some(pos) => Owner::Client(pos),
                None => {
                    log::warn!("[Transfer] file_copied from unknown screen {from}");
                    return;
                }
            },
            CoordinatorRole::Client => Owner::External,
        };

        {
            let mut state = self.state.lock().expect("state lock");
            state.record = Some(OwnershipRecord {
                owner: owner.clone(),
                file_name: name.to_string(),
                file_size: size,
                file_path: path.to_string(),
            });
        }
        log::info!("[Transfer] Ownership now {}: {name}", owner.label());

        // The server relays the advertisement to everyone else.
        if self.role == CoordinatorRole::Server {
            for target in (self.targets)() {
                if target == from {
                    continue;
                }
                let msg =
                    self.builder
                        .command(&target, CMD_FILE_COPIED, copied_params(name, size, path));
                (self.send)(PRIORITY_FILE, msg);
            }
        }
    }

    fn on_file_request(&self, from: &str) {
        let Some(record) = self.record() else {
            log::warn!("[Transfer] file_request from {from} with no file registered");
            return;
        };
        if record.owner.label() == from {
            log::warn!("[Transfer] Owner {from} requested its own file");
            return;
        }

        match (&record.owner, self.role) {
            (Owner::LocalServer, CoordinatorRole::Server)
            | (Owner::LocalClient, CoordinatorRole::Client) => {
                // We own the bytes: stream them straight to the requester.
                self.upload(record.file_path.clone(), record.file_name.clone(), from.to_string());
            }
            (Owner::Client(owner), CoordinatorRole::Server) => {
                let owner_pos = *owner;
                let Some(requester_pos) = ScreenPosition::parse(from) else {
                    log::warn!("[Transfer] file_request from unexpected source {from}");
                    return;
                };
                let reachable = (self.targets)();
                if !reachable.contains(&owner_pos.to_string()) {
                    log::warn!("[Transfer] Bridge refused: owner {owner_pos} not connected");
                    return;
                }
                {
                    let mut state = self.state.lock().expect("state lock");
                    if state.bridge.is_some() {
                        log::warn!("[Transfer] file_request rejected: bridge already active");
                        return;
                    }
                    state.bridge = Some(Bridge {
                        owner: owner_pos,
                        requester: requester_pos,
                    });
                }
                log::info!("[Transfer] Bridge {owner_pos} -> {requester_pos} opened");
                let msg = self.builder.command(
                    owner_pos.as_str(),
                    CMD_FILE_REQUEST,
                    request_params(&record.file_path),
                );
                (self.send)(PRIORITY_FILE, msg);
            }
            (owner, role) => {
                log::warn!("[Transfer] file_request with ownership {owner:?} on {role:?}");
            }
        }
    }

    async fn on_file_start(&self, from: &str, msg: &Message, params: &Map<String, Value>) {
        if let Some(bridge) = self.bridge() {
            if bridge.owner.as_str() == from {
                self.forward(bridge.requester, msg);
                return;
            }
        }

        let name = params.get("name").and_then(Value::as_str).unwrap_or("incoming");
        let size = params.get("size").and_then(Value::as_u64).unwrap_or(0);
        self.processing.store(true, Ordering::SeqCst);

        let target = self.save_dir.lock().expect("save dir lock").join(name);
        match FileWriter::create(&target, size, Arc::clone(&self.processing)).await {
            Ok(writer) => {
                self.state.lock().expect("state lock").writer = Some(writer);
            }
            Err(e) => {
                log::error!("[Transfer] Cannot open {}: {e}", target.display());
                self.processing.store(false, Ordering::SeqCst);
            }
        }
    }

    fn on_file_chunk(&self, from: &str, msg: &Message, params: &Map<String, Value>) {
        if let Some(bridge) = self.bridge() {
            if bridge.owner.as_str() == from {
                self.forward(bridge.requester, msg);
                return;
            }
        }

        let index = params.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
        let Some(encoded) = params.get("data").and_then(Value::as_str) else {
            log::warn!("[Transfer] file_chunk without data");
            return;
        };

        let data = match decode_chunk(encoded) {
            Ok(data) => data,
            Err(e) => {
                log::error!("[Transfer] Bad chunk {index}: {e}");
                self.fail_inbound();
                return;
            }
        };

        let state = self.state.lock().expect("state lock");
        if let Some(writer) = &state.writer {
            writer.push_chunk(index, data);
        }
    }

    fn on_file_end(&self, from: &str, msg: &Message) {
        if let Some(bridge) = self.bridge() {
            if bridge.owner.as_str() == from {
                self.forward(bridge.requester, msg);
                self.state.lock().expect("state lock").bridge = None;
                log::info!("[Transfer] Bridge closed after file_end");
                return;
            }
        }

        let mut state = self.state.lock().expect("state lock");
        if let Some(writer) = state.writer.take() {
            writer.finish();
        }
    }

    /// Re-target a message to `to` with the payload left untouched.
    fn forward(&self, to: ScreenPosition, msg: &Message) {
        let mut fwd = msg.clone();
        fwd.target = to.to_string();
        (self.send)(PRIORITY_FILE, fwd);
    }

    /// A peer vanished; tear down whatever involved it.
    pub fn peer_disconnected(&self, label: &str) {
        let mut state = self.state.lock().expect("state lock");

        if let Some(bridge) = state.bridge {
            if bridge.owner.as_str() == label {
                // Best-effort failure notice to the requester.
                let mut params = Map::new();
                params.insert("failed".into(), Value::Bool(true));
                let msg = self
                    .builder
                    .command(bridge.requester.as_str(), CMD_FILE_END, params);
                (self.send)(PRIORITY_FILE, msg);
                state.bridge = None;
                log::warn!("[Transfer] Bridge owner {label} disconnected mid-transfer");
            } else if bridge.requester.as_str() == label {
                state.bridge = None;
                log::warn!("[Transfer] Bridge requester {label} disconnected");
            }
        }

        if let Some(writer) = state.writer.take() {
            writer.abort();
        }
        self.processing.store(false, Ordering::SeqCst);
    }

    fn fail_inbound(&self) {
        let mut state = self.state.lock().expect("state lock");
        if let Some(writer) = state.writer.take() {
            writer.abort();
        }
    }

    /// Stream a local file to `target` as start/chunk*/end.
    fn upload(&self, path: String, name: String, target: String) {
        if self.uploading.swap(true, Ordering::SeqCst) {
            log::warn!("[Transfer] Upload rejected: one already running");
            return;
        }

        let builder = Arc::clone(&self.builder);
        let send = Arc::clone(&self.send);
        let uploading = Arc::clone(&self.uploading);
        tokio::spawn(async move {
            if let Err(e) = upload_file(&builder, &send, &path, &name, &target).await {
                log::error!("[Transfer] Upload of {path} failed: {e}");
            }
            uploading.store(false, Ordering::SeqCst);
        });
    }

    /// Status block for the daemon.
    pub fn status(&self) -> Value {
        let state = self.state.lock().expect("state lock");
        serde_json::json!({
            "registered_file": state.record.as_ref().map(|r| serde_json::json!({
                "owner": r.owner.label(),
                "name": r.file_name,
                "size": r.file_size,
            })),
            "bridge_active": state.bridge.is_some(),
            "receiving": self.processing.load(Ordering::SeqCst),
            "sending": self.uploading.load(Ordering::SeqCst),
        })
    }
}

async fn upload_file(
    builder: &MessageBuilder,
    send: &SendFn,
    path: &str,
    name: &str,
    target: &str,
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();

    let mut params = Map::new();
    params.insert("name".into(), Value::String(name.to_string()));
    params.insert("size".into(), Value::from(size));
    params.insert("path".into(), Value::String(path.to_string()));
    send(PRIORITY_FILE, builder.command(target, CMD_FILE_START, params));
    log::info!("[Transfer] Uploading {name} ({size} bytes) to {target}");

    let mut index: u32 = 0;
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut params = Map::new();
        params.insert("index".into(), Value::from(index));
        params.insert("data".into(), Value::String(encode_chunk(&buf[..n])?));
        send(PRIORITY_FILE, builder.command(target, CMD_FILE_CHUNK, params));
        index += 1;
    }

    send(PRIORITY_FILE, builder.command(target, CMD_FILE_END, Map::new()));
    Ok(())
}

fn copied_params(name: &str, size: u64, path: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("name".into(), Value::String(name.to_string()));
    params.insert("size".into(), Value::from(size));
    params.insert("path".into(), Value::String(path.to_string()));
    params
}

fn request_params(path: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("path".into(), Value::String(path.to_string()));
    params
}

/// Gzip then base64 one raw chunk for text embedding.
pub fn encode_chunk(data: &[u8]) -> Result<String, TransferError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(data)
        .map_err(|e| TransferError::BadChunk(format!("gzip write: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| TransferError::BadChunk(format!("gzip finish: {e}")))?;
    Ok(BASE64.encode(compressed))
}

/// Strict inverse of [`encode_chunk`].
pub fn decode_chunk(encoded: &str) -> Result<Vec<u8>, TransferError> {
    let compressed = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| TransferError::BadChunk(format!("base64: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|e| TransferError::BadChunk(format!("gzip: {e}")))?;
    Ok(data)
}
