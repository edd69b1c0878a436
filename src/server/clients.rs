//! Registry of the server's configured clients.
//!
//! Records are created from configuration and persist across reconnects;
//! only the connection handle and the exchanged screen size come and go.
//! Single writer (the transport accept path and the daemon CRUD
//! commands), many readers, under one `RwLock` held only for map access.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use crate::config::ClientEntry;
use crate::net::Connection;
use crate::screen::state::ClientView;
use crate::screen::ScreenPosition;

/// One configured client and its live state.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub entry: ClientEntry,
    /// Remote screen size from the configuration exchange.
    pub screen_size: Option<(u32, u32)>,
    /// Live connection; `None` while disconnected.
    pub connection: Option<Arc<Connection>>,
}

/// Thread-safe client registry keyed by screen position.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: RwLock<HashMap<ScreenPosition, ClientRecord>>,
}

impl ClientRegistry {
    pub fn from_entries(entries: &[ClientEntry]) -> Arc<Self> {
        let mut map = HashMap::new();
        for entry in entries {
            map.insert(
                entry.position,
                ClientRecord {
                    entry: entry.clone(),
                    screen_size: None,
                    connection: None,
                },
            );
        }
        Arc::new(Self {
            inner: RwLock::new(map),
        })
    }

    /// Position registered for a peer IP, used to match accepted sockets.
    pub fn position_for_address(&self, addr: IpAddr) -> Option<ScreenPosition> {
        let addr = addr.to_string();
        self.inner
            .read()
            .expect("registry lock")
            .iter()
            .find(|(_, rec)| rec.entry.address == addr)
            .map(|(pos, _)| *pos)
    }

    /// Attach a live connection after a successful exchange.
    pub fn attach(&self, position: ScreenPosition, conn: Arc<Connection>, size: (u32, u32)) {
        if let Some(rec) = self
            .inner
            .write()
            .expect("registry lock")
            .get_mut(&position)
        {
            if let Some(old) = rec.connection.take() {
                old.disconnect();
            }
            rec.connection = Some(conn);
            rec.screen_size = Some(size);
        }
    }

    /// Drop the connection handle; the record itself persists.
    ///
    /// Returns the handle so the caller can finish tearing it down.
    pub fn detach(&self, position: ScreenPosition) -> Option<Arc<Connection>> {
        self.inner
            .write()
            .expect("registry lock")
            .get_mut(&position)
            .and_then(|rec| {
                rec.screen_size = None;
                rec.connection.take()
            })
    }

    pub fn connection(&self, position: ScreenPosition) -> Option<Arc<Connection>> {
        self.inner
            .read()
            .expect("registry lock")
            .get(&position)
            .and_then(|rec| rec.connection.clone())
    }

    pub fn screen_size(&self, position: ScreenPosition) -> Option<(u32, u32)> {
        self.inner
            .read()
            .expect("registry lock")
            .get(&position)
            .and_then(|rec| rec.screen_size)
    }

    pub fn key_map(&self, position: ScreenPosition) -> HashMap<String, String> {
        self.inner
            .read()
            .expect("registry lock")
            .get(&position)
            .map(|rec| rec.entry.key_map.clone())
            .unwrap_or_default()
    }

    pub fn connected_positions(&self) -> Vec<ScreenPosition> {
        self.inner
            .read()
            .expect("registry lock")
            .iter()
            .filter(|(_, rec)| rec.connection.as_ref().is_some_and(|c| c.is_open()))
            .map(|(pos, _)| *pos)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connected_positions().len()
    }

    /// All live connections, for broadcast and health checking.
    pub fn connections(&self) -> Vec<(ScreenPosition, Arc<Connection>)> {
        self.inner
            .read()
            .expect("registry lock")
            .iter()
            .filter_map(|(pos, rec)| rec.connection.clone().map(|c| (*pos, c)))
            .collect()
    }

    /// Registered entries (for `list_clients` and status reporting).
    pub fn entries(&self) -> Vec<ClientEntry> {
        self.inner
            .read()
            .expect("registry lock")
            .values()
            .map(|rec| rec.entry.clone())
            .collect()
    }
}

impl ClientView for ClientRegistry {
    fn has_position(&self, pos: ScreenPosition) -> bool {
        self.inner.read().expect("registry lock").contains_key(&pos)
    }

    fn is_connected(&self, pos: ScreenPosition) -> bool {
        self.inner
            .read()
            .expect("registry lock")
            .get(&pos)
            .and_then(|rec| rec.connection.as_ref())
            .is_some_and(|c| c.is_open())
    }
}
