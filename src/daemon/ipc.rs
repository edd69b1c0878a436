//! Local control socket for the daemon.
//!
//! POSIX: a Unix domain socket at `/tmp/perpetua_daemon.sock`, mode 0600.
//! Windows: the named pipe `\\.\pipe\perpetua_daemon`.
//!
//! Connections are single-shot: read one JSON command, write one JSON
//! response, close. Malformed requests still get a well-formed error
//! response when possible.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::constants::APP_NAME;

use super::commands::{CommandRequest, DaemonResponse};

/// Largest accepted request (matches the response buffer of older CLIs).
const MAX_REQUEST: usize = 64 * 1024;

/// Implemented by the daemon; one call per connection.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: CommandRequest) -> DaemonResponse;
}

/// Platform-default control socket path.
pub fn default_socket_path() -> PathBuf {
    #[cfg(unix)]
    {
        PathBuf::from(format!("/tmp/{APP_NAME}_daemon.sock"))
    }
    #[cfg(windows)]
    {
        PathBuf::from(format!(r"\\.\pipe\{APP_NAME}_daemon"))
    }
}

/// Listening IPC server.
pub struct IpcServer {
    path: PathBuf,
    accept_task: JoinHandle<()>,
}

impl std::fmt::Debug for IpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServer").field("path", &self.path).finish_non_exhaustive()
    }
}

impl IpcServer {
    /// Bind the control socket and start serving.
    #[cfg(unix)]
    pub fn start(path: PathBuf, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        log::info!("[Daemon] Control socket at {}", path.display());

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            serve_connection(stream, handler).await;
                        });
                    }
                    Err(e) => {
                        log::error!("[Daemon] Control accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self { path, accept_task })
    }

    /// Bind the named pipe and start serving.
    #[cfg(windows)]
    pub fn start(path: PathBuf, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        let pipe_name = path.to_string_lossy().into_owned();
        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)
            .with_context(|| format!("Failed to create named pipe {pipe_name}"))?;
        log::info!("[Daemon] Control pipe at {pipe_name}");

        let accept_task = tokio::spawn(async move {
            loop {
                if server.connect().await.is_err() {
                    break;
                }
                // Queue the next instance before serving this one.
                let connected = match ServerOptions::new().create(&pipe_name) {
                    Ok(next) => std::mem::replace(&mut server, next),
                    Err(e) => {
                        log::error!("[Daemon] Pipe re-create failed: {e}");
                        break;
                    }
                };
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    serve_connection(connected, handler).await;
                });
            }
        });

        Ok(Self { path, accept_task })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Stop accepting and remove the socket file.
    pub fn shutdown(self) {
        self.accept_task.abort();
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Read one JSON request, dispatch it, write one JSON response.
async fn serve_connection<S>(mut stream: S, handler: Arc<dyn CommandHandler>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    let request = loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break None,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_REQUEST {
                    break None;
                }
                // A full JSON object may arrive across several reads.
                match serde_json::from_slice::<CommandRequest>(&buf) {
                    Ok(request) => break Some(request),
                    Err(e) if e.is_eof() => continue,
                    Err(_) => break None,
                }
            }
            Err(e) => {
                log::warn!("[Daemon] Control read error: {e}");
                return;
            }
        }
    };

    let response = match request {
        Some(request) => {
            log::debug!("[Daemon] Command: {}", request.command);
            handler.handle(request).await
        }
        None => DaemonResponse::err("Invalid command payload"),
    };

    match serde_json::to_vec(&response) {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes).await {
                log::warn!("[Daemon] Control write error: {e}");
            }
            let _ = stream.flush().await;
            let _ = stream.shutdown().await;
        }
        Err(e) => log::error!("[Daemon] Response serialization failed: {e}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, request: CommandRequest) -> DaemonResponse {
            match request.command.as_str() {
                "ping" => DaemonResponse::ok(json!({"message": "pong"})),
                other => DaemonResponse::err(format!("Unknown command: {other}")),
            }
        }
    }

    async fn roundtrip(path: &std::path::Path, payload: &[u8]) -> DaemonResponse {
        let mut stream = tokio::net::UnixStream::connect(path).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        serde_json::from_slice(&out).unwrap()
    }

    #[tokio::test]
    async fn test_single_shot_request_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctl.sock");
        let server = IpcServer::start(path.clone(), Arc::new(EchoHandler)).unwrap();

        let response = roundtrip(&path, br#"{"command":"ping"}"#).await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["message"], "pong");

        server.shutdown();
        assert!(!path.exists(), "socket file removed on shutdown");
    }

    #[tokio::test]
    async fn test_unknown_command_is_error_not_close() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctl.sock");
        let server = IpcServer::start(path.clone(), Arc::new(EchoHandler)).unwrap();

        let response = roundtrip(&path, br#"{"command":"frobnicate"}"#).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("Unknown command"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_json_gets_error_response() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctl.sock");
        let server = IpcServer::start(path.clone(), Arc::new(EchoHandler)).unwrap();

        let response = roundtrip(&path, b"this is not json").await;
        assert!(!response.success);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_socket_permissions_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ctl.sock");
        let server = IpcServer::start(path.clone(), Arc::new(EchoHandler)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        server.shutdown();
    }
}
