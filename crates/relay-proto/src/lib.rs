//! Wire protocol shared by the relay and the peers it drives.
//! Kept in a dedicated crate so peer tooling can depend on the envelope
//! shapes without pulling in the server runtime.
//!
//! Outbound frames carry a `method`/`path`/`data` envelope. Inbound frames
//! have no discriminant tag, so they are matched against an ordered list of
//! candidate shapes: role announcement first, execution result second.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Verb sent to every freshly accepted connection to confirm the handshake.
pub const INITIAL_PATH: &str = "initial";

/// Logical category of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The client driving the application UI.
    UiDriver,
    /// The swizzling client patching system APIs inside the app.
    Instrumentation,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::UiDriver, Role::Instrumentation];

    /// Name the peer sends in its `{"message": ...}` announcement.
    pub fn announcement(self) -> &'static str {
        match self {
            Role::UiDriver => "ui_connect",
            Role::Instrumentation => "swizzling_connect",
        }
    }

    pub fn from_announcement(message: &str) -> Option<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.announcement() == message)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::UiDriver => "ui_driver",
            Role::Instrumentation => "instrumentation",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Server to peer command.
    #[serde(rename = "POST")]
    Post,
    /// Peer to server informational message. Never emitted by the relay.
    #[serde(rename = "GET")]
    Get,
}

/// Envelope wrapping every command the relay sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub method: Method,
    pub path: String,
    pub data: Option<Value>,
}

impl OutboundEnvelope {
    pub fn post(path: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            data,
        }
    }

    pub fn initial() -> Self {
        Self::post(INITIAL_PATH, None)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Sent by a peer right after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAnnouncement {
    pub message: String,
}

impl RoleAnnouncement {
    pub fn new(role: Role) -> Self {
        Self {
            message: role.announcement().to_string(),
        }
    }
}

/// Outcome a peer reports after executing a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: i64,
    pub summary: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Announcement(Role),
    Result(ExecutionResult),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("announcement names unknown role {0:?}")]
    UnknownRole(String),
    #[error("frame matches no known inbound shape")]
    Unrecognized,
}

impl DecodeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::UnknownRole(_) => "unknown_role",
            DecodeError::Unrecognized => "unrecognized",
        }
    }
}

/// Classify a raw frame. Text and binary frames are both handed in as bytes.
pub fn decode_inbound(bytes: &[u8]) -> Result<Inbound, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;

    let mut unknown_role = None;
    if let Ok(announcement) = RoleAnnouncement::deserialize(&value) {
        match Role::from_announcement(&announcement.message) {
            Some(role) => return Ok(Inbound::Announcement(role)),
            None => unknown_role = Some(announcement.message),
        }
    }

    if let Ok(result) = ExecutionResult::deserialize(&value) {
        return Ok(Inbound::Result(result));
    }

    Err(match unknown_role {
        Some(message) => DecodeError::UnknownRole(message),
        None => DecodeError::Unrecognized,
    })
}
