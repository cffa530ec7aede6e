//! Core types used throughout Quiver.

use serde::{Deserialize, Serialize};

/// Cluster-wide unique identifier (collections, partitions, segments, builds).
pub type UniqueId = i64;

/// Hybrid logical timestamp: 46-bit physical milliseconds, 18-bit logical counter.
pub type Timestamp = u64;

/// Field identifier within a collection schema.
pub type FieldId = i64;

/// Role a registered process plays in the cluster.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    RootCoord,
    DataCoord,
    IndexCoord,
    Proxy,
    DataNode,
    IndexNode,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::RootCoord => "rootcoord",
            Role::DataCoord => "datacoord",
            Role::IndexCoord => "indexcoord",
            Role::Proxy => "proxy",
            Role::DataNode => "datanode",
            Role::IndexNode => "indexnode",
        }
    }

    /// Coordinator roles admit at most one live session at a time.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Role::RootCoord | Role::DataCoord | Role::IndexCoord)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health state a coordinator reports through `get_component_states`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum StateCode {
    Initializing,
    Healthy,
    Abnormal,
}

impl std::fmt::Display for StateCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StateCode::Initializing => "Initializing",
            StateCode::Healthy => "Healthy",
            StateCode::Abnormal => "Abnormal",
        };
        f.write_str(s)
    }
}

/// Uniform error code carried by every RPC status.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    UnexpectedError = 1,
    Unavailable = 2,
    NotReady = 3,
    InvalidInput = 4,
    NotFound = 5,
    AlreadyExists = 6,
}

/// Uniform `{error-code, reason}` status returned by every RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcStatus {
    pub error_code: ErrorCode,
    pub reason: String,
}

impl RpcStatus {
    pub fn success() -> Self {
        Self { error_code: ErrorCode::Success, reason: String::new() }
    }

    pub fn error(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self { error_code: code, reason: reason.into() }
    }

    pub fn is_success(&self) -> bool {
        self.error_code == ErrorCode::Success
    }
}

impl From<&crate::Error> for RpcStatus {
    fn from(e: &crate::Error) -> Self {
        let code = match e {
            crate::Error::Unavailable(_) | crate::Error::Timeout(_) => ErrorCode::Unavailable,
            crate::Error::InvalidInput(_) => ErrorCode::InvalidInput,
            crate::Error::NotFound(_) => ErrorCode::NotFound,
            crate::Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            _ => ErrorCode::UnexpectedError,
        };
        RpcStatus::error(code, e.to_string())
    }
}

/// Component health report, one per coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStates {
    pub node_id: UniqueId,
    pub role: Role,
    pub state_code: StateCode,
    pub status: RpcStatus,
}

/// A position in a message stream: the channel, the last message id applied,
/// and the timestamp carried by that message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgPosition {
    pub channel: String,
    pub msg_id: UniqueId,
    pub timestamp: Timestamp,
}
