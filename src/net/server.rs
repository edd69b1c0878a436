//! Server-side transport: accept loop, per-connection attachment, health
//! checking.
//!
//! Accepted sockets are TLS-wrapped when enabled, run the configuration
//! exchange, then attach to the client record whose configured address
//! matches the peer IP. Unmatched peers are rejected and closed. A
//! health task probes idle connections every 3 s; any close (EOF, I/O or
//! protocol error, failed probe) funnels through one handler that detaches
//! the record and reports the disconnect.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::constants::HEALTH_CHECK_INTERVAL;
use crate::discovery::Advertiser;
use crate::net::{exchange_as_server, Connection, Socket};
use crate::protocol::{Message, MessageBuilder};
use crate::screen::ScreenPosition;
use crate::server::clients::ClientRegistry;

/// Transport-level notifications consumed by the server role.
#[derive(Debug)]
pub enum ServerNetEvent {
    Connected {
        screen: ScreenPosition,
        size: (u32, u32),
    },
    Disconnected {
        screen: ScreenPosition,
    },
    Message {
        from: ScreenPosition,
        msg: Message,
    },
}

/// Listening transport of the server role.
pub struct ServerTransport {
    port: u16,
    advertiser: Option<Advertiser>,
    accept_task: JoinHandle<()>,
    closed_task: JoinHandle<()>,
    health_task: JoinHandle<()>,
}

impl std::fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransport")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// How many ports past the configured one we try before giving up.
const MAX_PORT_ATTEMPTS: u16 = 16;

impl ServerTransport {
    /// Bind, advertise and start accepting.
    ///
    /// Port selection: the mDNS probe advances past ports other
    /// instances advertise, then `bind()` decides for real; on
    /// `AddrInUse` the advertisement is withdrawn and the next port is
    /// tried. `advertise=false` skips mDNS entirely (tests, closed
    /// networks).
    pub async fn start(
        config: &ServerConfig,
        registry: Arc<ClientRegistry>,
        builder: Arc<MessageBuilder>,
        screen_size: (u32, u32),
        events: UnboundedSender<ServerNetEvent>,
        advertise: bool,
    ) -> Result<Self> {
        let acceptor = if config.ssl_enabled {
            let certfile = config
                .certfile
                .as_ref()
                .context("SSL enabled but no certificate configured")?;
            let keyfile = config
                .keyfile
                .as_ref()
                .context("SSL enabled but no key configured")?;
            Some(super::tls::load_acceptor(certfile, keyfile)?)
        } else {
            None
        };

        let advertised_ip = crate::discovery::local_ip();
        let mut port = config.port;
        let (advertiser, listener) = loop {
            if port - config.port >= MAX_PORT_ATTEMPTS {
                bail!("No free port found in {}..{}", config.port, port);
            }

            let adv = if advertise {
                let adv = Advertiser::register(advertised_ip, port).await?;
                port = adv.port();
                Some(adv)
            } else {
                None
            };

            match TcpListener::bind((config.host.as_str(), port)).await {
                Ok(listener) => break (adv, listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    log::warn!("[Server] Port {port} in use at bind time, trying next");
                    if let Some(adv) = adv {
                        adv.shutdown();
                    }
                    port += 1;
                }
                Err(e) => {
                    if let Some(adv) = adv {
                        adv.shutdown();
                    }
                    return Err(e).context("Failed to bind server socket");
                }
            }
        };

        let port = listener.local_addr()?.port();
        log::info!("[Server] Listening on {}:{port}", config.host);

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::clone(&registry),
            Arc::clone(&builder),
            screen_size,
            incoming_tx,
            closed_tx,
            events.clone(),
        ));
        let closed_task = tokio::spawn(closed_loop(
            closed_rx,
            incoming_rx,
            Arc::clone(&registry),
            events,
        ));
        let health_task = tokio::spawn(health_loop(registry, builder));

        Ok(Self {
            port,
            advertiser,
            accept_task,
            closed_task,
            health_task,
        })
    }

    /// Port actually bound (after conflict resolution).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and withdraw the advertisement. Existing
    /// connections are torn down by the role via the registry.
    pub fn shutdown(mut self) {
        self.accept_task.abort();
        self.closed_task.abort();
        self.health_task.abort();
        if let Some(adv) = self.advertiser.take() {
            adv.shutdown();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<ClientRegistry>,
    builder: Arc<MessageBuilder>,
    screen_size: (u32, u32),
    incoming_tx: UnboundedSender<(String, Message)>,
    closed_tx: UnboundedSender<(String, std::net::SocketAddr)>,
    events: UnboundedSender<ServerNetEvent>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::info!("[Server] Connection from {peer}");
                let acceptor = acceptor.clone();
                let registry = Arc::clone(&registry);
                let builder = Arc::clone(&builder);
                let incoming_tx = incoming_tx.clone();
                let closed_tx = closed_tx.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_accept(
                        stream,
                        peer,
                        acceptor,
                        registry,
                        builder,
                        screen_size,
                        incoming_tx,
                        closed_tx,
                        events,
                    )
                    .await
                    {
                        log::warn!("[Server] Handshake with {peer} failed: {e}");
                    }
                });
            }
            Err(e) => {
                log::error!("[Server] Accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_accept(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<ClientRegistry>,
    builder: Arc<MessageBuilder>,
    screen_size: (u32, u32),
    incoming_tx: UnboundedSender<(String, Message)>,
    closed_tx: UnboundedSender<(String, std::net::SocketAddr)>,
    events: UnboundedSender<ServerNetEvent>,
) -> Result<()> {
    let mut socket = match acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?;
            Socket::ServerTls(Box::new(tls))
        }
        None => Socket::Plain(stream),
    };

    let client_size =
        exchange_as_server(&mut socket, &builder, screen_size.0, screen_size.1).await?;

    let Some(position) = registry.position_for_address(normalize_ip(peer.ip())) else {
        log::warn!("[Server] Rejected {peer}: no client registered at this address");
        return Ok(()); // socket drops here
    };

    let conn = Connection::spawn(socket, peer, position.as_str(), incoming_tx, closed_tx);
    registry.attach(position, conn, client_size);
    log::info!(
        "[Server] Client {position} attached ({}x{} at {peer})",
        client_size.0,
        client_size.1
    );
    let _ = events.send(ServerNetEvent::Connected {
        screen: position,
        size: client_size,
    });
    Ok(())
}

/// IPv4-mapped IPv6 peers match their registered IPv4 form.
fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        v4 => v4,
    }
}

/// Funnels reader messages and close notifications to the role.
async fn closed_loop(
    mut closed_rx: UnboundedReceiver<(String, std::net::SocketAddr)>,
    mut incoming_rx: UnboundedReceiver<(String, Message)>,
    registry: Arc<ClientRegistry>,
    events: UnboundedSender<ServerNetEvent>,
) {
    loop {
        tokio::select! {
            Some((label, msg)) = incoming_rx.recv() => {
                let Some(from) = ScreenPosition::parse(&label) else { continue };
                if events.send(ServerNetEvent::Message { from, msg }).is_err() {
                    break;
                }
            }
            Some((label, peer)) = closed_rx.recv() => {
                let Some(screen) = ScreenPosition::parse(&label) else { continue };
                // Ignore stale closes from a connection that has already
                // been replaced by a reconnect.
                let current = registry.connection(screen);
                if current.as_ref().is_none_or(|c| c.peer() != peer) {
                    continue;
                }
                if let Some(conn) = registry.detach(screen) {
                    conn.disconnect();
                    log::info!("[Server] Client {screen} disconnected");
                    if events.send(ServerNetEvent::Disconnected { screen }).is_err() {
                        break;
                    }
                }
            }
            else => break,
        }
    }
}

/// Probes idle connections; a dead writer surfaces on the closed channel.
async fn health_loop(registry: Arc<ClientRegistry>, builder: Arc<MessageBuilder>) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for (screen, conn) in registry.connections() {
            if conn.idle_for() >= HEALTH_CHECK_INTERVAL {
                let probe = builder.heartbeat(screen.as_str());
                if !conn.send_message(&probe) {
                    log::debug!("[Server] Heartbeat to {screen} failed; writer gone");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientEntry;
    use crate::net::exchange_as_client;
    use crate::screen::state::ClientView;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config(port: u16) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port,
            clients: vec![ClientEntry {
                position: ScreenPosition::Left,
                address: "127.0.0.1".into(),
                hostname: None,
                key_map: HashMap::new(),
            }],
            ..ServerConfig::default()
        }
    }

    async fn connect_client(port: u16) -> (crate::net::Socket, (u32, u32)) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut socket = Socket::Plain(stream);
        let builder = MessageBuilder::new("left");
        let server_size = exchange_as_client(&mut socket, &builder, 1280, 720)
            .await
            .unwrap();
        (socket, server_size)
    }

    #[tokio::test]
    async fn test_accept_exchange_attach() {
        let config = test_config(0);
        let registry = ClientRegistry::from_entries(&config.clients);
        let builder = Arc::new(MessageBuilder::new("server"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transport = ServerTransport::start(
            &config,
            Arc::clone(&registry),
            builder,
            (1920, 1080),
            tx,
            false,
        )
        .await
        .unwrap();

        let (_socket, server_size) = connect_client(transport.port()).await;
        assert_eq!(server_size, (1920, 1080));

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match event {
            ServerNetEvent::Connected { screen, size } => {
                assert_eq!(screen, ScreenPosition::Left);
                assert_eq!(size, (1280, 720));
            }
            other => panic!("Expected Connected, got {other:?}"),
        }
        assert!(registry.is_connected(ScreenPosition::Left));
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_detaches_record() {
        let config = test_config(0);
        let registry = ClientRegistry::from_entries(&config.clients);
        let builder = Arc::new(MessageBuilder::new("server"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transport = ServerTransport::start(
            &config,
            Arc::clone(&registry),
            builder,
            (1920, 1080),
            tx,
            false,
        )
        .await
        .unwrap();

        let (socket, _) = connect_client(transport.port()).await;
        let _ = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();

        drop(socket);
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match event {
            ServerNetEvent::Disconnected { screen } => assert_eq!(screen, ScreenPosition::Left),
            other => panic!("Expected Disconnected, got {other:?}"),
        }
        assert!(!registry.is_connected(ScreenPosition::Left));
        transport.shutdown();
    }

    #[tokio::test]
    async fn test_messages_flow_to_events() {
        let config = test_config(0);
        let registry = ClientRegistry::from_entries(&config.clients);
        let builder = Arc::new(MessageBuilder::new("server"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let transport = ServerTransport::start(
            &config,
            Arc::clone(&registry),
            builder,
            (1920, 1080),
            tx,
            false,
        )
        .await
        .unwrap();

        let (socket, _) = connect_client(transport.port()).await;
        let _ = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();

        // Keep the socket alive in a Connection to reuse its writer.
        let (in_tx, _in_rx) = mpsc::unbounded_channel();
        let (cl_tx, _cl_rx) = mpsc::unbounded_channel();
        let peer = "127.0.0.1:1".parse().unwrap();
        let client_conn = Connection::spawn(socket, peer, "server", in_tx, cl_tx);

        let cb = MessageBuilder::new("left");
        let mut params = serde_json::Map::new();
        params.insert("direction".into(), "left".into());
        client_conn.send_message(&cb.command("server", crate::protocol::CMD_RETURN, params));

        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        match event {
            ServerNetEvent::Message { from, msg } => {
                assert_eq!(from, ScreenPosition::Left);
                assert_eq!(msg.command(), Some(crate::protocol::CMD_RETURN));
            }
            other => panic!("Expected Message, got {other:?}"),
        }

        client_conn.disconnect();
        transport.shutdown();
    }
}
