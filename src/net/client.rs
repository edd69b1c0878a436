//! Client-side transport: resolve, connect, reconnect.
//!
//! One outer loop drives the whole lifetime: resolve the server (directly
//! configured, or via mDNS discovery with operator choice when several
//! are found), connect, optionally TLS-wrap against the trusted
//! certificate, run the configuration exchange, then hand the socket to a
//! [`Connection`]. On any close the loop sleeps `reconnect_interval` and
//! starts over; every state change is reported to the role.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::config::ClientConfig;
use crate::constants::DISCOVERY_WINDOW;
use crate::discovery::{discover_servers, DiscoveredServer};
use crate::net::{exchange_as_client, Connection, Socket};
use crate::protocol::{Message, MessageBuilder};

/// Transport-level notifications consumed by the client role.
#[derive(Debug)]
pub enum ClientNetEvent {
    /// Connected and exchanged: the server's screen size.
    Connected { server_size: (u32, u32) },
    Disconnected,
    /// Discovery found several servers; the daemon must pick one.
    ServersFound(Vec<DiscoveredServer>),
    Message(Message),
}

/// Where the next connection attempt should go.
#[derive(Debug, Clone, Default)]
struct Target {
    host: Option<String>,
    port: u16,
}

/// Connecting transport of the client role.
pub struct ClientTransport {
    run_task: JoinHandle<()>,
    conn: Arc<Mutex<Option<Arc<Connection>>>>,
    chosen_tx: watch::Sender<Target>,
    stop_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ClientTransport {
    pub fn start(
        config: ClientConfig,
        builder: Arc<MessageBuilder>,
        screen_size: (u32, u32),
        events: UnboundedSender<ClientNetEvent>,
    ) -> Result<Self> {
        let connector = if config.ssl_enabled {
            let certfile = config
                .certfile
                .as_ref()
                .context("SSL enabled but no trusted certificate configured")?;
            Some((super::tls::load_connector(certfile)?, certfile.clone()))
        } else {
            None
        };

        let conn = Arc::new(Mutex::new(None));
        let (chosen_tx, chosen_rx) = watch::channel(Target::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let run_task = tokio::spawn(run_loop(
            config,
            connector.map(|(c, _)| c),
            builder,
            screen_size,
            events,
            Arc::clone(&conn),
            chosen_rx,
            stop_rx,
        ));

        Ok(Self {
            run_task,
            conn,
            chosen_tx,
            stop_tx,
        })
    }

    /// Resolve a pending multi-server discovery (daemon `choose_server`).
    pub fn choose_server(&self, host: String, port: u16) {
        let _ = self.chosen_tx.send(Target {
            host: Some(host),
            port,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .expect("conn lock")
            .as_ref()
            .is_some_and(|c| c.is_open())
    }

    /// Send to the server; drops silently while disconnected.
    pub fn send(&self, msg: &Message) -> bool {
        let conn = self.conn.lock().expect("conn lock").clone();
        conn.is_some_and(|c| c.send_message(msg))
    }

    /// Forward pre-encoded bytes (file bridging on the client is not a
    /// thing, but symmetric APIs keep the roles honest).
    pub fn send_raw(&self, frame: Vec<u8>) -> bool {
        let conn = self.conn.lock().expect("conn lock").clone();
        conn.is_some_and(|c| c.send_raw(frame))
    }

    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.run_task.abort();
        if let Some(conn) = self.conn.lock().expect("conn lock").take() {
            conn.disconnect();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: ClientConfig,
    connector: Option<TlsConnector>,
    builder: Arc<MessageBuilder>,
    screen_size: (u32, u32),
    events: UnboundedSender<ClientNetEvent>,
    shared_conn: Arc<Mutex<Option<Arc<Connection>>>>,
    mut chosen_rx: watch::Receiver<Target>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let reconnect = Duration::from_secs(config.reconnect_interval.max(1));

    loop {
        if *stop_rx.borrow() {
            break;
        }

        let target = match resolve_target(&config, &events, &mut chosen_rx, &mut stop_rx).await {
            Some(t) => t,
            None => break, // stopping
        };

        match attempt(&target, connector.as_ref(), &builder, screen_size).await {
            Ok((socket, peer, server_size)) => {
                let (in_tx, mut in_rx) = mpsc::unbounded_channel();
                let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
                let conn = Connection::spawn(socket, peer, "server", in_tx, closed_tx);
                *shared_conn.lock().expect("conn lock") = Some(Arc::clone(&conn));
                let _ = events.send(ClientNetEvent::Connected { server_size });
                log::info!("[Client] Connected to {peer} (server {server_size:?})");

                // Pump messages until the connection dies or we stop.
                loop {
                    tokio::select! {
                        Some((_, msg)) = in_rx.recv() => {
                            if events.send(ClientNetEvent::Message(msg)).is_err() {
                                conn.disconnect();
                                return;
                            }
                        }
                        Some(_) = closed_rx.recv() => break,
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                conn.disconnect();
                                return;
                            }
                        }
                        else => break,
                    }
                }

                conn.disconnect();
                shared_conn.lock().expect("conn lock").take();
                let _ = events.send(ClientNetEvent::Disconnected);
                log::info!("[Client] Disconnected from server");
            }
            Err(e) => {
                log::warn!("[Client] Connection attempt failed: {e}");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(reconnect) => {}
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Figure out where to connect.
///
/// Preconfigured hosts win. Otherwise browse mDNS for the discovery
/// window: exactly one hit auto-selects; several are surfaced via
/// `ServersFound` and we wait for `choose_server`.
async fn resolve_target(
    config: &ClientConfig,
    events: &UnboundedSender<ClientNetEvent>,
    chosen_rx: &mut watch::Receiver<Target>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Option<Target> {
    if !config.use_discovery() {
        return Some(Target {
            host: Some(config.server_host.clone()),
            port: config.server_port,
        });
    }

    if let Some(host) = chosen_rx.borrow().host.clone() {
        let port = chosen_rx.borrow().port;
        return Some(Target {
            host: Some(host),
            port,
        });
    }

    let found = match discover_servers(DISCOVERY_WINDOW).await {
        Ok(found) => found,
        Err(e) => {
            log::warn!("[Client] Discovery failed: {e}");
            Vec::new()
        }
    };

    match found.len() {
        0 => {
            log::info!("[Client] No servers found, will retry");
            // Empty target: the attempt fails fast and the outer loop
            // sleeps before browsing again.
            Some(Target::default())
        }
        1 => {
            let s = &found[0];
            log::info!("[Client] Auto-selected server {}:{}", s.address, s.port);
            return Some(Target {
                host: Some(s.address.to_string()),
                port: s.port,
            });
        }
        _ => {
            let _ = events.send(ClientNetEvent::ServersFound(found));
            // Wait for the daemon to choose, or for shutdown.
            loop {
                tokio::select! {
                    res = chosen_rx.changed() => {
                        if res.is_err() {
                            return None;
                        }
                        if let Some(host) = chosen_rx.borrow().host.clone() {
                            let port = chosen_rx.borrow().port;
                            return Some(Target { host: Some(host), port });
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            return None;
                        }
                    }
                }
            }
        }
    }
}

/// One connection attempt against a resolved target.
async fn attempt(
    target: &Target,
    connector: Option<&TlsConnector>,
    builder: &MessageBuilder,
    screen_size: (u32, u32),
) -> Result<(Socket, SocketAddr, (u32, u32))> {
    let host = target.host.clone().context("no server resolved")?;
    let port = target.port;

    let stream = tokio::time::timeout(
        Duration::from_secs(5),
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    .context("connect timed out")?
    .with_context(|| format!("connect to {host}:{port} failed"))?;
    let peer = stream.peer_addr()?;

    let mut socket = match connector {
        Some(connector) => {
            let name = super::tls::server_name(&host);
            let tls = connector
                .connect(name, stream)
                .await
                .context("TLS handshake failed")?;
            Socket::ClientTls(Box::new(tls))
        }
        None => Socket::Plain(stream),
    };

    let server_size =
        exchange_as_client(&mut socket, builder, screen_size.0, screen_size.1).await?;
    Ok((socket, peer, server_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::exchange_as_server;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn direct_config(port: u16) -> ClientConfig {
        ClientConfig {
            server_host: "127.0.0.1".into(),
            server_port: port,
            reconnect_interval: 1,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_exchange_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Fake server: exchange then push one keyboard message.
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut socket = Socket::Plain(stream);
            let sb = MessageBuilder::new("server");
            let client_size = exchange_as_server(&mut socket, &sb, 1920, 1080).await.unwrap();
            assert_eq!(client_size, (1280, 720));

            let (in_tx, _in_rx) = mpsc::unbounded_channel();
            let (cl_tx, _cl_rx) = mpsc::unbounded_channel();
            let conn = Connection::spawn(socket, peer, "left", in_tx, cl_tx);
            conn.send_message(&sb.keyboard("left", &crate::protocol::KeyboardEvent::press("q")));
            tokio::time::sleep(Duration::from_millis(300)).await;
            conn.disconnect();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let builder = Arc::new(MessageBuilder::new("left"));
        let transport =
            ClientTransport::start(direct_config(port), builder, (1280, 720), tx).unwrap();

        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            ClientNetEvent::Connected { server_size } => assert_eq!(server_size, (1920, 1080)),
            other => panic!("Expected Connected, got {other:?}"),
        }
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap() {
            ClientNetEvent::Message(msg) => {
                assert_eq!(msg.payload["key"].as_str(), Some("q"));
            }
            other => panic!("Expected Message, got {other:?}"),
        }

        server.await.unwrap();
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Server accepts, exchanges, drops, then accepts again.
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (stream, _peer) = listener.accept().await.unwrap();
                let mut socket = Socket::Plain(stream);
                let sb = MessageBuilder::new("server");
                let _ = exchange_as_server(&mut socket, &sb, 1920, 1080).await.unwrap();
                drop(socket);
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let builder = Arc::new(MessageBuilder::new("left"));
        let transport =
            ClientTransport::start(direct_config(port), builder, (1280, 720), tx).unwrap();

        let mut connects = 0;
        let mut disconnects = 0;
        while connects < 2 {
            match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
                ClientNetEvent::Connected { .. } => connects += 1,
                ClientNetEvent::Disconnected => disconnects += 1,
                _ => {}
            }
        }
        assert!(disconnects >= 1, "expected a disconnect between connects");

        server.await.unwrap();
        transport.shutdown();
    }
}
