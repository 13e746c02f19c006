//! Unified error types for the operation runtime.

use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Errors that fail a single operation. Never propagated past the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The model supplied input the handler could not accept.
    InvalidInput(String),
    /// The handler ran but encountered a failure.
    HandlerFailed(String),
    /// No handler is registered for the operation kind.
    UnknownKind(String),
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::HandlerFailed(msg) => write!(f, "{msg}"),
            Self::UnknownKind(kind) => write!(f, "unknown operation kind `{kind}`"),
        }
    }
}

impl std::error::Error for OperationError {}

impl From<std::io::Error> for OperationError {
    fn from(e: std::io::Error) -> Self {
        Self::HandlerFailed(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

/// Errors from the model streaming boundary.
#[derive(Debug)]
pub enum ModelError {
    /// Network / reqwest-level error.
    Http(reqwest::Error),
    /// Non-2xx status from the provider.
    Status(u16, String),
    /// The provider sent a payload we could not interpret.
    InvalidResponse(String),
    /// The event stream ended without a completion marker.
    StreamClosed,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "http: {e}"),
            Self::Status(code, body) => write!(f, "status {code}: {body}"),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
            Self::StreamClosed => write!(f, "model stream closed before completion"),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors from the chat transcript store.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
    /// Chat ids are used as file names and must be filesystem-safe.
    InvalidChatId(String),
    /// The on-disk file was written by an incompatible version.
    UnsupportedVersion(u32),
    /// No message with the given `created` key exists in the chat.
    MessageNotFound(u64),
    /// Another process kept the chat's lock file past the wait limit.
    LockTimeout(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Serde(e) => write!(f, "serde: {e}"),
            Self::InvalidChatId(msg) => write!(f, "invalid chat id: {msg}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported chat file version {v}"),
            Self::MessageNotFound(created) => write!(f, "no message with created={created}"),
            Self::LockTimeout(chat_id) => write!(f, "timed out waiting for the lock on chat `{chat_id}`"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// TurnError
// ---------------------------------------------------------------------------

/// Turn-level failures. Each one ends the turn and is reported once.
#[derive(Debug)]
pub enum TurnError {
    /// The whole exchange ran past the wall-clock ceiling.
    Timeout(Duration),
    Model(ModelError),
    Store(StoreError),
    /// The orchestrator state machine was driven through an illegal edge.
    InvalidTransition { from: &'static str, to: &'static str },
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(limit) => {
                write!(f, "turn timed out after {}s", limit.as_secs_f64())
            }
            Self::Model(e) => write!(f, "model: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid turn transition {from} -> {to}")
            }
        }
    }
}

impl std::error::Error for TurnError {}

impl From<ModelError> for TurnError {
    fn from(e: ModelError) -> Self {
        Self::Model(e)
    }
}

impl From<StoreError> for TurnError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_error_display() {
        assert_eq!(
            OperationError::InvalidInput("missing path".into()).to_string(),
            "invalid input: missing path"
        );
        assert_eq!(
            OperationError::HandlerFailed("disk full".into()).to_string(),
            "disk full"
        );
        assert_eq!(
            OperationError::UnknownKind("mystery".into()).to_string(),
            "unknown operation kind `mystery`"
        );
    }

    #[test]
    fn operation_error_from_io_keeps_message() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let e = OperationError::from(io_err);
        assert!(e.to_string().contains("file not found"), "got: {e}");
    }

    #[test]
    fn config_error_from_toml() {
        let toml_err: toml::de::Error = toml::from_str::<toml::Value>("x = [unclosed").unwrap_err();
        let e = ConfigError::from(toml_err);
        assert!(e.to_string().starts_with("toml:"));
    }

    #[test]
    fn config_error_invalid_message() {
        let e = ConfigError::Invalid("bad mode".into());
        assert_eq!(e.to_string(), "invalid config: bad mode");
    }

    #[test]
    fn turn_error_timeout_mentions_timed_out() {
        let e = TurnError::Timeout(Duration::from_millis(1500));
        assert_eq!(e.to_string(), "turn timed out after 1.5s");
    }

    #[test]
    fn turn_error_wraps_store_and_model_errors() {
        let e = TurnError::from(StoreError::MessageNotFound(42));
        assert_eq!(e.to_string(), "store: no message with created=42");
        let e = TurnError::from(ModelError::StreamClosed);
        assert!(e.to_string().starts_with("model:"), "got: {e}");
    }
}
