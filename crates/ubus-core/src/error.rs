//! Error types for the bus client.
//!
//! Every public entry point returns either a value or one of these kinds, with
//! enough context (object, method, path, transport text) to diagnose a failure
//! without inspecting internals.

use crate::reactor::Status;
use thiserror::Error;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    // Lifecycle errors
    #[error("You are not connected to ubus.")]
    NotConnected,

    #[error("You are already connected to ubus.")]
    AlreadyConnected,

    #[error("Failed to connect to the ubus socket '{path}': {reason}")]
    ConnectionFailed { path: String, reason: String },

    // Registry errors
    #[error("Failed to register object '{object}': {reason}")]
    RegistrationFailed { object: String, reason: String },

    #[error("Object '{object}' was not found.")]
    ObjectNotFound { object: String },

    #[error("Method '{method}' was not found on object '{object}'")]
    UnknownMethod { object: String, method: String },

    // Validation errors
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // Codec errors
    #[error("Failed to encode message: {message}")]
    EncodingFailed { message: String },

    #[error("Failed to decode message: {message}")]
    DecodingFailed { message: String },

    // Invocation errors
    #[error("Call to {object}.{method} failed: {status}")]
    InvocationFailed {
        object: String,
        method: String,
        status: Status,
    },

    #[error("Internal error: {message}")]
    InternalError { message: String },

    #[error("{message}")]
    UsageError { message: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Transport {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BusError {
    /// Create a usage error from any message.
    pub fn usage(message: impl Into<String>) -> Self {
        BusError::UsageError {
            message: message.into(),
        }
    }

    /// Build the error reported to the caller of an invocation that completed
    /// with a non-ok status.
    pub fn from_call_status(object: &str, method: &str, status: Status) -> Self {
        match status {
            Status::MethodNotFound => BusError::UnknownMethod {
                object: object.to_string(),
                method: method.to_string(),
            },
            Status::InvalidArgument => BusError::InvalidArgument {
                message: format!("{}.{} rejected the supplied arguments", object, method),
            },
            Status::NotFound => BusError::ObjectNotFound {
                object: object.to_string(),
            },
            status => BusError::InvocationFailed {
                object: object.to_string(),
                method: method.to_string(),
                status,
            },
        }
    }

    /// Wrap a failed reactor operation that has no more specific kind.
    pub fn transport(operation: &str, status: Status) -> Self {
        BusError::Transport {
            message: format!("{}: ubus error occurred: {}", operation, status),
            source: None,
        }
    }

    /// Map the error onto a wire status code.
    ///
    /// Used as the process exit code by the command line client, in the same
    /// spirit as a JSON-RPC error code.
    pub fn status(&self) -> Status {
        match self {
            BusError::NotConnected
            | BusError::ConnectionFailed { .. }
            | BusError::Transport { .. } => Status::ConnectionFailed,

            BusError::AlreadyConnected | BusError::UsageError { .. } => Status::InvalidCommand,

            BusError::RegistrationFailed { .. }
            | BusError::InvalidArgument { .. }
            | BusError::EncodingFailed { .. } => Status::InvalidArgument,

            BusError::ObjectNotFound { .. } => Status::NotFound,
            BusError::UnknownMethod { .. } => Status::MethodNotFound,
            BusError::DecodingFailed { .. } => Status::NoData,
            BusError::InvocationFailed { status, .. } => *status,

            BusError::InternalError { .. } | BusError::Json { .. } => Status::UnknownError,
        }
    }

    /// Check whether the error came from a lost or unreachable transport.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BusError::ConnectionFailed { .. } | BusError::Transport { .. }
        )
    }
}
