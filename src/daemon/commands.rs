//! Daemon IPC command and response types.
//!
//! One JSON object in, one JSON object out, per connection:
//!
//! ```json
//! { "command": "start_server", "params": { ... } }
//! { "success": true, "data": { ... }, "error": null }
//! ```
//!
//! Errors travel as strings; callers branch on `success`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Service lifecycle.
pub const START_SERVER: &str = "start_server";
pub const STOP_SERVER: &str = "stop_server";
pub const START_CLIENT: &str = "start_client";
pub const STOP_CLIENT: &str = "stop_client";
pub const SHUTDOWN: &str = "shutdown";
pub const PING: &str = "ping";

/// Status queries.
pub const STATUS: &str = "status";
pub const SERVER_STATUS: &str = "server_status";
pub const CLIENT_STATUS: &str = "client_status";

/// Configuration.
pub const GET_SERVER_CONFIG: &str = "get_server_config";
pub const SET_SERVER_CONFIG: &str = "set_server_config";
pub const GET_CLIENT_CONFIG: &str = "get_client_config";
pub const SET_CLIENT_CONFIG: &str = "set_client_config";
pub const SAVE_CONFIG: &str = "save_config";
pub const RELOAD_CONFIG: &str = "reload_config";

/// Stream toggles.
pub const ENABLE_STREAM: &str = "enable_stream";
pub const DISABLE_STREAM: &str = "disable_stream";
pub const GET_STREAMS: &str = "get_streams";

/// Registered-client CRUD.
pub const ADD_CLIENT: &str = "add_client";
pub const REMOVE_CLIENT: &str = "remove_client";
pub const EDIT_CLIENT: &str = "edit_client";
pub const LIST_CLIENTS: &str = "list_clients";

/// TLS management.
pub const ENABLE_SSL: &str = "enable_ssl";
pub const DISABLE_SSL: &str = "disable_ssl";
pub const SHARE_CERTIFICATE: &str = "share_certificate";
pub const RECEIVE_CERTIFICATE: &str = "receive_certificate";
pub const SET_OTP: &str = "set_otp";
pub const CHECK_OTP_NEEDED: &str = "check_otp_needed";

/// Discovery.
pub const DISCOVER_SERVICES: &str = "discover_services";
pub const GET_FOUND_SERVERS: &str = "get_found_servers";
pub const CHOOSE_SERVER: &str = "choose_server";
pub const CHECK_SERVER_CHOICE_NEEDED: &str = "check_server_choice_needed";

/// Incoming request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Standardized response envelope. All three keys are always present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_with_and_without_params() {
        let r: CommandRequest = serde_json::from_str(r#"{"command":"ping"}"#).unwrap();
        assert_eq!(r.command, "ping");
        assert!(r.params.is_empty());

        let r: CommandRequest =
            serde_json::from_str(r#"{"command":"enable_stream","params":{"stream":"mouse"}}"#)
                .unwrap();
        assert_eq!(r.params["stream"], "mouse");
    }

    #[test]
    fn test_response_always_carries_all_keys() {
        let json = serde_json::to_string(&DaemonResponse::ok_empty()).unwrap();
        assert!(json.contains("\"success\":true"));
        assert!(json.contains("\"data\":null"));
        assert!(json.contains("\"error\":null"));

        let json = serde_json::to_string(&DaemonResponse::err("boom")).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"error\":\"boom\""));
    }
}
