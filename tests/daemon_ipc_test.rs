//! Daemon control-socket tests: one JSON in, one JSON out, per
//! connection, against the real command dispatcher.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use perpetua::config::{ClientConfig, ServerConfig};
use perpetua::daemon::commands::DaemonResponse;
use perpetua::daemon::ipc::{CommandHandler, IpcServer};
use perpetua::daemon::DaemonState;

fn test_state(socket: &Path) -> Arc<DaemonState> {
    let server_config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    };
    let client_config = ClientConfig {
        server_host: "127.0.0.1".into(),
        server_port: 1,
        reconnect_interval: 60,
        ..ClientConfig::default()
    };
    DaemonState::new(server_config, client_config, socket.to_path_buf(), false)
}

async fn send_command(path: &Path, payload: Value) -> DaemonResponse {
    let mut stream = UnixStream::connect(path).await.unwrap();
    stream
        .write_all(payload.to_string().as_bytes())
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    serde_json::from_slice(&out).unwrap()
}

#[tokio::test]
async fn test_ping_over_socket() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("daemon.sock");
    let state = test_state(&path);
    let handler: Arc<dyn CommandHandler> = state;
    let ipc = IpcServer::start(path.clone(), handler).unwrap();

    let response = send_command(&path, json!({"command": "ping"})).await;
    assert!(response.success);
    assert_eq!(response.data.unwrap()["message"], "pong");

    ipc.shutdown();
}

#[tokio::test]
async fn test_mutual_exclusion_over_socket() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("daemon.sock");
    let state = test_state(&path);
    let handler: Arc<dyn CommandHandler> = Arc::clone(&state) as Arc<dyn CommandHandler>;
    let ipc = IpcServer::start(path.clone(), handler).unwrap();

    let response = send_command(&path, json!({"command": "start_client"})).await;
    assert!(response.success, "start_client failed: {:?}", response.error);

    let response = send_command(&path, json!({"command": "start_server"})).await;
    assert!(!response.success);
    assert_eq!(
        response.error.unwrap(),
        "Cannot start server while client is running"
    );

    // Connections are single-shot: a fresh one still works afterwards.
    let response = send_command(&path, json!({"command": "status"})).await;
    let data = response.data.unwrap();
    assert_eq!(data["server_running"], false);
    assert_eq!(data["client_running"], true);

    state.stop_roles().await;
    ipc.shutdown();
}

#[tokio::test]
async fn test_config_commands_over_socket() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("daemon.sock");
    let state = test_state(&path);
    let handler: Arc<dyn CommandHandler> = state;
    let ipc = IpcServer::start(path.clone(), handler).unwrap();

    let response = send_command(
        &path,
        json!({"command": "add_client", "params": {"position": "right", "address": "10.1.1.7"}}),
    )
    .await;
    assert!(response.success);

    let response = send_command(&path, json!({"command": "list_clients"})).await;
    let clients = response.data.unwrap();
    assert_eq!(clients[0]["position"], "right");
    assert_eq!(clients[0]["address"], "10.1.1.7");

    ipc.shutdown();
}
