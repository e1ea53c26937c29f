// Error utilities for qbus_common

// Use standard error utilities from third-party libraries
pub use anyhow::{anyhow, Result};
pub use thiserror::Error;

/// Errors raised by the routing and request/response engine.
///
/// These travel in-band: a reply frame carries the wire code and the bare
/// message next to (or in place of) the payload data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QbusError {
    /// A required field was absent in a user call.
    #[error("missing parameter: {0}")]
    MissingParam(String),

    /// Method unregistered on the target node, or no route to it.
    #[error("{0}")]
    NotFound(String),

    /// A handler failed.
    #[error("{0}")]
    Runtime(String),

    /// Payload serialisation failed; the frame is dropped.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Frame deserialisation failed; the connection is dropped.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl QbusError {
    /// Stable wire code carried in the `err_code` payload field.
    pub fn code(&self) -> i64 {
        match self {
            QbusError::MissingParam(_) => 1,
            QbusError::NotFound(_) => 2,
            QbusError::Runtime(_) => 3,
            QbusError::Encode(_) => 4,
            QbusError::Malformed(_) => 5,
        }
    }

    /// The bare message, without the kind prefix `Display` may add.
    pub fn message(&self) -> &str {
        match self {
            QbusError::MissingParam(m)
            | QbusError::NotFound(m)
            | QbusError::Runtime(m)
            | QbusError::Encode(m)
            | QbusError::Malformed(m) => m,
        }
    }

    /// Rebuild an error from the wire code and message of a reply frame.
    /// Unknown codes collapse to `Runtime`.
    pub fn from_wire(code: i64, message: String) -> Self {
        match code {
            1 => QbusError::MissingParam(message),
            2 => QbusError::NotFound(message),
            4 => QbusError::Encode(message),
            5 => QbusError::Malformed(message),
            _ => QbusError::Runtime(message),
        }
    }
}
