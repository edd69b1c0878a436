//! Socket transport shared by both roles.
//!
//! A [`Socket`] unifies plain TCP and TLS streams. An attached
//! [`Connection`] owns a reader task (frame decode + chunk reassembly)
//! and a writer task (drains the outgoing frame queue); both report
//! through channels so no caller ever blocks on the peer.
//!
//! ```text
//! accept/connect → configuration exchange → Connection::spawn
//!                     reader task ──► incoming (label, Message) channel
//!                     writer task ◄── frame queue (encoded bytes)
//! ```

pub mod client;
pub mod server;
pub mod tls;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::protocol::chunk::{self, Reassembler};
use crate::protocol::codec::{encode, FrameDecoder};
use crate::protocol::{parse_screen_size, Message, MessageBuilder, MessageType};

/// How long each side of the configuration exchange may take.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain or TLS-wrapped stream, one type for the rest of the transport.
pub enum Socket {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Socket {
    pub fn is_tls(&self) -> bool {
        !matches!(self, Socket::Plain(_))
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Socket::Plain(_) => "plain",
            Socket::ServerTls(_) => "tls(server)",
            Socket::ClientTls(_) => "tls(client)",
        };
        write!(f, "Socket({kind})")
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Socket::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Socket::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A live, attached connection to one peer.
///
/// Owned by the transport session of its role; dropping it (via
/// [`Connection::disconnect`]) releases the socket on every exit path.
pub struct Connection {
    peer: SocketAddr,
    label: String,
    tls: bool,
    frame_tx: UnboundedSender<Vec<u8>>,
    last_activity: Arc<Mutex<Instant>>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("label", &self.label)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Attach a socket: spawn the reader/writer pair.
    ///
    /// Decoded messages (after chunk reassembly, heartbeats filtered)
    /// arrive on `incoming` as `(label, message)`. When either task ends
    /// — EOF, I/O error or protocol error — `(label, peer)` is sent on
    /// `closed`; the peer address lets the owner ignore stale closes from
    /// a connection that has already been replaced.
    pub fn spawn(
        socket: Socket,
        peer: SocketAddr,
        label: impl Into<String>,
        incoming: UnboundedSender<(String, Message)>,
        closed: UnboundedSender<(String, SocketAddr)>,
    ) -> Arc<Self> {
        let label = label.into();
        let tls = socket.is_tls();
        let (read_half, write_half) = tokio::io::split(socket);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let read_task = tokio::spawn(read_loop(
            read_half,
            label.clone(),
            peer,
            incoming,
            closed.clone(),
            Arc::clone(&last_activity),
        ));
        let write_task = tokio::spawn(write_loop(
            write_half,
            label.clone(),
            peer,
            frame_rx,
            closed,
            Arc::clone(&last_activity),
        ));

        Arc::new(Self {
            peer,
            label,
            tls,
            frame_tx,
            last_activity,
            read_task,
            write_task,
        })
    }

    /// Queue a message for sending, chunking it if oversized.
    ///
    /// Returns `false` once the writer is gone (peer disconnected).
    pub fn send_message(&self, msg: &Message) -> bool {
        let chunks = match chunk::split(msg.clone(), MAX_MESSAGE_SIZE) {
            Ok(chunks) => chunks,
            Err(e) => {
                log::error!("[Net] Failed to chunk message for {}: {e}", self.label);
                return false;
            }
        };
        for part in &chunks {
            match encode(part) {
                Ok(frame) => {
                    if self.frame_tx.send(frame).is_err() {
                        return false;
                    }
                }
                Err(e) => {
                    log::error!("[Net] Failed to encode message for {}: {e}", self.label);
                    return false;
                }
            }
        }
        true
    }

    /// Forward pre-encoded frame bytes untouched (bridge mode).
    pub fn send_raw(&self, frame: Vec<u8>) -> bool {
        self.frame_tx.send(frame).is_ok()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Time since the last read or write on this connection.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    /// True while the writer task is still accepting frames.
    pub fn is_open(&self) -> bool {
        !self.frame_tx.is_closed()
    }

    /// Tear down both tasks and release the socket.
    pub fn disconnect(&self) {
        self.read_task.abort();
        self.write_task.abort();
    }
}

async fn read_loop(
    mut reader: tokio::io::ReadHalf<Socket>,
    label: String,
    peer: SocketAddr,
    incoming: UnboundedSender<(String, Message)>,
    closed: UnboundedSender<(String, SocketAddr)>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let mut decoder = FrameDecoder::new();
    let mut reassembler = Reassembler::new();
    let mut buf = [0u8; 64 * 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::info!("[Net] Peer {label} closed the connection");
                break;
            }
            Ok(n) => {
                *last_activity.lock().expect("activity lock") = Instant::now();
                let frames = match decoder.feed(&buf[..n]) {
                    Ok(frames) => frames,
                    Err(e) => {
                        log::error!("[Net] Frame error from {label}: {e}");
                        break;
                    }
                };
                for frame in frames {
                    let complete = match reassembler.push(frame) {
                        Ok(m) => m,
                        Err(e) => {
                            log::error!("[Net] Chunk error from {label}: {e}");
                            let _ = closed.send((label.clone(), peer));
                            return;
                        }
                    };
                    let Some(msg) = complete else { continue };
                    if is_heartbeat(&msg) {
                        continue;
                    }
                    if incoming.send((label.clone(), msg)).is_err() {
                        return; // role shut down
                    }
                }
            }
            Err(e) if crate::error::is_transient_io(&e) => continue,
            Err(e) => {
                log::error!("[Net] Read error from {label}: {e}");
                break;
            }
        }
    }
    let _ = closed.send((label, peer));
}

async fn write_loop(
    mut writer: tokio::io::WriteHalf<Socket>,
    label: String,
    peer: SocketAddr,
    mut frame_rx: UnboundedReceiver<Vec<u8>>,
    closed: UnboundedSender<(String, SocketAddr)>,
    last_activity: Arc<Mutex<Instant>>,
) {
    while let Some(frame) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            log::error!("[Net] Write error to {label}: {e}");
            let _ = closed.send((label, peer));
            return;
        }
        *last_activity.lock().expect("activity lock") = Instant::now();
    }
    let _ = writer.shutdown().await;
}

fn is_heartbeat(msg: &Message) -> bool {
    msg.message_type == MessageType::Exchange
        && msg
            .payload
            .get("heartbeat")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
}

/// Read exactly one complete frame off a raw socket (handshake only).
async fn read_one_message(socket: &mut Socket) -> Result<Message> {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = timeout(EXCHANGE_TIMEOUT, socket.read(&mut buf))
            .await
            .context("configuration exchange timed out")??;
        if n == 0 {
            bail!("peer closed during configuration exchange");
        }
        let mut frames = decoder.feed(&buf[..n])?;
        if let Some(msg) = frames.pop() {
            return Ok(msg);
        }
    }
}

/// Server side of the configuration exchange.
///
/// Sends the screen-size request, reads the client's `WxH`, replies with
/// the server's own size. Returns the client's screen size.
pub async fn exchange_as_server(
    socket: &mut Socket,
    builder: &MessageBuilder,
    width: u32,
    height: u32,
) -> Result<(u32, u32)> {
    let request = builder.screen_size_request("");
    socket.write_all(&encode(&request)?).await?;

    let reply = read_one_message(socket).await?;
    if reply.message_type != MessageType::Exchange {
        bail!("expected EXCHANGE reply, got {:?}", reply.message_type);
    }
    let size = reply
        .payload
        .get("screen_size")
        .and_then(serde_json::Value::as_str)
        .and_then(parse_screen_size)
        .context("client sent no usable screen size")?;

    let own = builder.screen_size_reply("", width, height);
    socket.write_all(&encode(&own)?).await?;
    Ok(size)
}

/// Client side of the configuration exchange.
///
/// Waits for the server's request, answers with the local `WxH`, then
/// reads the server's size back.
pub async fn exchange_as_client(
    socket: &mut Socket,
    builder: &MessageBuilder,
    width: u32,
    height: u32,
) -> Result<(u32, u32)> {
    let request = read_one_message(socket).await?;
    let wants_size = request.message_type == MessageType::Exchange
        && request
            .payload
            .get("request")
            .and_then(serde_json::Value::as_str)
            == Some("screen_size");
    if !wants_size {
        bail!("unexpected handshake opener from server");
    }

    let reply = builder.screen_size_reply("", width, height);
    socket.write_all(&encode(&reply)?).await?;

    let server_size = read_one_message(socket).await?;
    server_size
        .payload
        .get("screen_size")
        .and_then(serde_json::Value::as_str)
        .and_then(parse_screen_size)
        .context("server sent no usable screen size")
}
