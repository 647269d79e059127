use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_RESET_MESSAGE: &str = "State reset in node";

/// Errors surfaced to RPC clients.
///
/// Every variant maps to a `status` string that is sent in the error
/// response, see [`RpcError::status`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("No such action: {0}")]
    NoSuchAction(String),

    #[error("No such node: {0}")]
    NoSuchNode(String),

    #[error("{message}")]
    StateReset { message: String, path: Vec<String> },

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Device error: {0}")]
    Device(String),

    /// The transport to the device went away. Device-bounded nodes turn
    /// this into [`RpcError::NoSuchNode`] and forget their open child.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// Raised by a node whose open child no longer reflects device state.
    /// The node closes the child and reports [`RpcError::StateReset`].
    #[error("{0}")]
    ChildReset(String),

    #[error("{0}")]
    Exception(String),
}

pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    pub fn state_reset(message: impl Into<String>, path: Vec<String>) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            DEFAULT_RESET_MESSAGE.to_string()
        } else {
            message
        };
        Self::StateReset { message, path }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn status(&self) -> &'static str {
        match self {
            RpcError::NoSuchAction(_) | RpcError::NoSuchNode(_) => "invalid-command",
            RpcError::StateReset { .. } => "state-reset",
            RpcError::InvalidParams(_) => "invalid-params",
            RpcError::NotSupported(_) => "not-supported",
            RpcError::Device(_) | RpcError::ConnectionLost(_) => "device-error",
            RpcError::Cancelled => "cancelled",
            RpcError::ChildReset(_) | RpcError::Exception(_) => "exception",
        }
    }

    pub fn body(&self) -> Map<String, Value> {
        match self {
            RpcError::StateReset { path, .. } => match json!({ "path": path }) {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Exception(err.to_string())
    }
}

impl From<hex::FromHexError> for RpcError {
    fn from(err: hex::FromHexError) -> Self {
        RpcError::InvalidParams(format!("invalid hex value: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(RpcError::NoSuchAction("x".into()).status(), "invalid-command");
        assert_eq!(RpcError::NoSuchNode("x".into()).status(), "invalid-command");
        assert_eq!(
            RpcError::state_reset("", vec![]).status(),
            "state-reset"
        );
        assert_eq!(RpcError::Cancelled.status(), "cancelled");
        assert_eq!(RpcError::Exception("boom".into()).status(), "exception");
        assert_eq!(RpcError::ConnectionLost("gone".into()).status(), "device-error");
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            RpcError::NoSuchAction("frobnicate".into()).to_string(),
            "No such action: frobnicate"
        );
        assert_eq!(
            RpcError::NoSuchNode("ccid".into()).to_string(),
            "No such node: ccid"
        );
    }

    #[test]
    fn test_state_reset_defaults_message_and_carries_path() {
        let err = RpcError::state_reset("", vec!["usb".into(), "123".into()]);
        assert_eq!(err.to_string(), DEFAULT_RESET_MESSAGE);
        assert_eq!(err.body()["path"], json!(["usb", "123"]));

        let err = RpcError::state_reset("OATH application reset", vec![]);
        assert_eq!(err.to_string(), "OATH application reset");
    }

    #[test]
    fn test_body_is_empty_for_plain_errors() {
        assert!(RpcError::NotSupported("x".into()).body().is_empty());
    }
}
