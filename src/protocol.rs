//! Peer wire protocol types.
//!
//! Every message exchanged with a backend control server is a single JSON
//! document of the shape
//!
//! ```text
//! { "cmd": <string>, "dir": "request"|"response",
//!   "params": <object>, "err"?: <int>, "err_msg"?: <string> }
//! ```
//!
//! Messages are transient: one is built per I/O event and discarded once
//! forwarded. The fixed set of backend identities lives here too, as the
//! closed [`Role`] enum, so role-specific mapping logic gets exhaustiveness
//! checking instead of runtime lookups.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one backend control server.
///
/// The collection is fixed at build time: the hub talks to exactly these
/// three backends and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Camera capture backend.
    Capture,
    /// Vision/processing backend (also hosts the player commands).
    Process,
    /// Streaming/recording backend.
    VStream,
}

impl Role {
    /// Number of backend roles.
    pub const COUNT: usize = 3;

    /// All roles, in registry order.
    pub const ALL: [Role; Role::COUNT] = [Role::Capture, Role::Process, Role::VStream];

    /// Canonical (mixed-case) role name.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Capture => "Capture",
            Role::Process => "Process",
            Role::VStream => "VStream",
        }
    }

    /// Lower-cased name used to derive the peer's socket address.
    pub fn socket_suffix(self) -> &'static str {
        match self {
            Role::Capture => "capture",
            Role::Process => "process",
            Role::VStream => "vstream",
        }
    }

    /// Position in the fixed link registry.
    pub fn index(self) -> usize {
        match self {
            Role::Capture => 0,
            Role::Process => 1,
            Role::VStream => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message direction marker. Carried on the wire for log readability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Hub → backend.
    Request,
    /// Backend → hub. The default when a peer omits the field.
    #[default]
    Response,
}

/// One flat command document on a peer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    /// Command name.
    pub cmd: String,
    /// Direction marker; defaults to `response` when a peer omits it.
    #[serde(default)]
    pub dir: Direction,
    /// Command parameters. Present on success replies and most requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Error code. Present only on error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<i64>,
    /// Error text accompanying `err`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

impl ControlMessage {
    /// Build a hub → backend request.
    pub fn request(cmd: impl Into<String>, params: Value) -> Self {
        Self {
            cmd: cmd.into(),
            dir: Direction::Request,
            params: Some(params),
            err: None,
            err_msg: None,
        }
    }

    /// Build a backend → hub success reply (used by tests and fixtures).
    pub fn response(cmd: impl Into<String>, params: Value) -> Self {
        Self {
            cmd: cmd.into(),
            dir: Direction::Response,
            params: Some(params),
            err: None,
            err_msg: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_without_error_fields() {
        let msg = ControlMessage::request("config", json!({"x": 1}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"cmd": "config", "dir": "request", "params": {"x": 1}})
        );
    }

    #[test]
    fn test_error_reply_parses() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"cmd":"config","dir":"response","err":5,"err_msg":"bad value"}"#,
        )
        .unwrap();
        assert_eq!(msg.cmd, "config");
        assert_eq!(msg.err, Some(5));
        assert_eq!(msg.err_msg.as_deref(), Some("bad value"));
        assert!(msg.params.is_none());
    }

    #[test]
    fn test_missing_dir_defaults_to_response() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"cmd":"signature","params":{}}"#).unwrap();
        assert_eq!(msg.dir, Direction::Response);
    }

    #[test]
    fn test_role_registry_order_matches_index() {
        for (i, role) in Role::ALL.iter().enumerate() {
            assert_eq!(role.index(), i);
        }
    }

    #[test]
    fn test_socket_suffix_is_lowercased_name() {
        for role in Role::ALL {
            assert_eq!(role.socket_suffix(), role.as_str().to_lowercase());
        }
    }
}
