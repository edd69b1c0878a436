//! mDNS service discovery.
//!
//! Servers advertise `_perpetua._tcp.local.` with the instance name
//! `<uid>.<type>` and a `hostname` TXT record; clients browse the same
//! type and collect `(uid, address, port, hostname)` tuples. The uid is a
//! stable hash of the bind IP so re-registrations keep their identity.
//!
//! Port conflicts observed via mDNS are advisory: the advertiser bumps
//! its port past other instances before registering, but the `bind()`
//! call stays authoritative and is retried by the transport on failure.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use sha2::{Digest, Sha256};
use tokio::time::timeout;

use crate::constants::{APP_NAME, DISCOVERY_UID_LEN, MDNS_SERVICE_TYPE};

/// One server found on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub uid: String,
    pub address: IpAddr,
    pub port: u16,
    pub hostname: Option<String>,
}

impl DiscoveredServer {
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uid": self.uid,
            "address": self.address.to_string(),
            "port": self.port,
            "hostname": self.hostname,
        })
    }
}

/// Best-effort local LAN address.
///
/// Routes a throwaway UDP socket at a public address to learn which
/// interface the OS would use; nothing is actually sent. Falls back to
/// loopback on machines with no route.
pub fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::from([127, 0, 0, 1]))
}

/// Stable uid for a bind address: SHA-256 of the IP, hex, truncated.
pub fn generate_uid(host: &str) -> String {
    let digest = Sha256::digest(host.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..DISCOVERY_UID_LEN.min(hex.len())].to_string()
}

/// Registered mDNS advertisement; unregisters on [`Advertiser::shutdown`].
pub struct Advertiser {
    daemon: ServiceDaemon,
    fullname: String,
    uid: String,
    port: u16,
}

impl std::fmt::Debug for Advertiser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advertiser")
            .field("fullname", &self.fullname)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Advertiser {
    /// Advertise a server at `ip`, starting from `port`.
    ///
    /// Existing advertisements of the same type and port push the port up
    /// before registering. Returns the advertiser and the chosen port.
    pub async fn register(ip: IpAddr, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("Failed to start mDNS daemon")?;

        let mut chosen = port;
        while port_in_use(&daemon, chosen).await? {
            log::warn!("[mDNS] Port {chosen} already advertised, trying next");
            chosen += 1;
        }

        let uid = generate_uid(&ip.to_string());
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| APP_NAME.to_string());

        let properties = HashMap::from([("hostname".to_string(), host.clone())]);
        let info = ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            &uid,
            &format!("{host}.local."),
            ip,
            chosen,
            properties,
        )
        .context("Invalid mDNS service info")?;
        let fullname = info.get_fullname().to_string();

        daemon
            .register(info)
            .context("Failed to register mDNS service")?;
        log::info!("[mDNS] Registered {fullname} on port {chosen}");

        Ok(Self {
            daemon,
            fullname,
            uid,
            port: chosen,
        })
    }

    /// Port actually advertised after conflict resolution.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Withdraw the advertisement and stop the daemon.
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            log::debug!("[mDNS] Unregister failed: {e}");
        }
        let _ = self.daemon.shutdown();
        log::info!("[mDNS] Service {} unregistered", self.fullname);
    }
}

/// True when another instance of this app already advertises `port`.
async fn port_in_use(daemon: &ServiceDaemon, port: u16) -> Result<bool> {
    let receiver = daemon
        .browse(MDNS_SERVICE_TYPE)
        .context("Failed to browse mDNS")?;

    let probe = Duration::from_secs(1);
    let conflict = timeout(probe, async {
        while let Ok(event) = receiver.recv_async().await {
            if let ServiceEvent::ServiceResolved(info) = event {
                if info.get_port() == port {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    let _ = daemon.stop_browse(MDNS_SERVICE_TYPE);
    Ok(conflict)
}

/// Browse for servers for up to `window`, returning the result set.
///
/// Each resolved instance yields one entry; duplicate uids keep the first
/// sighting.
pub async fn discover_servers(window: Duration) -> Result<Vec<DiscoveredServer>> {
    let daemon = ServiceDaemon::new().context("Failed to start mDNS daemon")?;
    let receiver = daemon
        .browse(MDNS_SERVICE_TYPE)
        .context("Failed to browse mDNS")?;

    log::debug!("[mDNS] Browsing for servers ({}s window)", window.as_secs());
    let mut found: Vec<DiscoveredServer> = Vec::new();

    let _ = timeout(window, async {
        while let Ok(event) = receiver.recv_async().await {
            if let ServiceEvent::ServiceResolved(info) = event {
                let uid = info
                    .get_fullname()
                    .split('.')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let Some(address) = info.get_addresses().iter().next().copied() else {
                    continue;
                };
                if found.iter().any(|s| s.uid == uid) {
                    continue;
                }
                let server = DiscoveredServer {
                    uid,
                    address,
                    port: info.get_port(),
                    hostname: info.get_property_val_str("hostname").map(str::to_string),
                };
                log::info!("[mDNS] Found server {}:{}", server.address, server.port);
                found.push(server);
            }
        }
    })
    .await;

    let _ = daemon.stop_browse(MDNS_SERVICE_TYPE);
    let _ = daemon.shutdown();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_is_stable_and_truncated() {
        let a = generate_uid("192.168.1.10");
        let b = generate_uid("192.168.1.10");
        assert_eq!(a, b);
        assert_eq!(a.len(), DISCOVERY_UID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_uid_differs_per_host() {
        assert_ne!(generate_uid("192.168.1.10"), generate_uid("192.168.1.11"));
    }

    #[test]
    fn test_discovered_server_json_shape() {
        let s = DiscoveredServer {
            uid: "abc".into(),
            address: "10.0.0.2".parse().unwrap(),
            port: 5001,
            hostname: Some("studio".into()),
        };
        let v = s.as_json();
        assert_eq!(v["address"], "10.0.0.2");
        assert_eq!(v["port"], 5001);
        assert_eq!(v["hostname"], "studio");
    }
}
