//! Configuration loading and persistence.
//!
//! Both roles read from one configuration directory: `server.json`,
//! `client.json`, optional TLS material (`cert.pem`, `key.pem`) and the
//! daemon PID file. Values can be overridden through `PERPETUA_*`
//! environment variables; the `--config-dir` CLI flag sets
//! `PERPETUA_CONFIG_DIR` before anything reads it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

use crate::constants::{APP_NAME, DEFAULT_SCREEN_THRESHOLD, DEFAULT_SERVER_PORT};
use crate::screen::ScreenPosition;

/// Which input streams a role participates in.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    pub mouse: bool,
    pub keyboard: bool,
    pub clipboard: bool,
    pub file: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            mouse: true,
            keyboard: true,
            clipboard: true,
            file: true,
        }
    }
}

impl StreamSettings {
    pub fn set(&mut self, stream: &str, enabled: bool) -> bool {
        match stream {
            "mouse" => self.mouse = enabled,
            "keyboard" => self.keyboard = enabled,
            "clipboard" => self.clipboard = enabled,
            "file" => self.file = enabled,
            _ => return false,
        }
        true
    }

    pub fn as_map(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("mouse".into(), self.mouse.into());
        m.insert("keyboard".into(), self.keyboard.into());
        m.insert("clipboard".into(), self.clipboard.into());
        m.insert("file".into(), self.file.into());
        m
    }
}

/// One registered client of the server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClientEntry {
    /// Edge of the server screen this client sits on.
    pub position: ScreenPosition,
    /// IP address (or resolvable hostname) the client connects from.
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Key remap table applied before events are sent to this client.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub key_map: HashMap<String, String>,
}

/// Server-role configuration (`server.json`).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Edge threshold in pixels for crossing detection.
    pub screen_threshold: i32,
    pub ssl_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
    #[serde(default)]
    pub streams: StreamSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_SERVER_PORT,
            screen_threshold: DEFAULT_SCREEN_THRESHOLD,
            ssl_enabled: false,
            certfile: None,
            keyfile: None,
            clients: Vec::new(),
            streams: StreamSettings::default(),
        }
    }
}

/// Client-role configuration (`client.json`).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClientConfig {
    /// Server address; empty string means "use mDNS discovery".
    pub server_host: String,
    pub server_port: u16,
    pub ssl_enabled: bool,
    /// Trusted server certificate for TLS connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,
    /// Directory pasted files are written into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub streams: StreamSettings,
    /// Seconds between reconnection attempts.
    pub reconnect_interval: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: DEFAULT_SERVER_PORT,
            ssl_enabled: false,
            certfile: None,
            save_dir: dirs::download_dir(),
            streams: StreamSettings::default(),
            reconnect_interval: 5,
        }
    }
}

/// Paths and persistence for the shared configuration directory.
#[derive(Debug, Clone)]
pub struct AppConfig;

impl AppConfig {
    /// Returns the configuration directory path, creating it if needed.
    ///
    /// Priority: `PERPETUA_CONFIG_DIR` env var, then the platform config
    /// dir (`~/.config/perpetua` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom) = std::env::var("PERPETUA_CONFIG_DIR") {
            PathBuf::from(custom)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join(APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn server_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("server.json"))
    }

    pub fn client_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("client.json"))
    }

    pub fn pid_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("daemon.pid"))
    }

    pub fn default_certfile() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("cert.pem"))
    }

    pub fn default_keyfile() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("key.pem"))
    }
}

fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<T> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    } else {
        Ok(T::default())
    }
}

fn save_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

impl ServerConfig {
    /// Load from disk (or defaults), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config: Self = load_json(&AppConfig::server_config_path()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        save_json(&AppConfig::server_config_path()?, self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PERPETUA_SERVER_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PERPETUA_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }

    /// Entry for a position, if one is registered.
    pub fn client_at(&self, position: ScreenPosition) -> Option<&ClientEntry> {
        self.clients.iter().find(|c| c.position == position)
    }
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let mut config: Self = load_json(&AppConfig::client_config_path()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        save_json(&AppConfig::client_config_path()?, self)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PERPETUA_CLIENT_SERVER_HOST") {
            self.server_host = host;
        }
        if let Ok(port) = std::env::var("PERPETUA_CLIENT_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server_port = port;
            }
        }
    }

    /// True when the client should browse mDNS instead of dialing a
    /// preconfigured host.
    pub fn use_discovery(&self) -> bool {
        self.server_host.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; serialize the tests touching them.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_temp_config_dir<F: FnOnce()>(f: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        let tmp = tempfile::TempDir::new().unwrap();
        std::env::set_var("PERPETUA_CONFIG_DIR", tmp.path());
        f();
        std::env::remove_var("PERPETUA_CONFIG_DIR");
    }

    #[test]
    fn test_server_config_roundtrip() {
        with_temp_config_dir(|| {
            let mut config = ServerConfig::default();
            config.port = 6001;
            config.clients.push(ClientEntry {
                position: ScreenPosition::Left,
                address: "192.168.1.20".into(),
                hostname: None,
                key_map: HashMap::from([("cmd".into(), "ctrl".into())]),
            });
            config.save().unwrap();

            let loaded = ServerConfig::load().unwrap();
            assert_eq!(loaded.port, 6001);
            assert_eq!(loaded.clients.len(), 1);
            assert_eq!(
                loaded.client_at(ScreenPosition::Left).unwrap().address,
                "192.168.1.20"
            );
            assert!(loaded.client_at(ScreenPosition::Right).is_none());
        });
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        with_temp_config_dir(|| {
            let server = ServerConfig::load().unwrap();
            assert_eq!(server.port, DEFAULT_SERVER_PORT);
            assert!(server.clients.is_empty());

            let client = ClientConfig::load().unwrap();
            assert!(client.use_discovery());
            assert!(client.streams.mouse);
        });
    }

    #[test]
    fn test_stream_settings_set() {
        let mut streams = StreamSettings::default();
        assert!(streams.set("mouse", false));
        assert!(!streams.mouse);
        assert!(!streams.set("video", true));
    }
}
