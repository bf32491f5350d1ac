//! Error types for the studio link and playback engine.
//!
//! All errors implement the `std::error::Error` trait and carry enough context
//! to decide between retrying, dropping a message, or reporting misuse.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: connect refused, socket reset, premature end-of-stream
//! - **Protocol Errors**: unknown opcodes or malformed payloads
//! - **Cancellation**: the link was shut down on purpose
//! - **Timeline Errors**: a cursor could not be resolved during a tick
//! - **Caller Misuse**: sending while disconnected, starting twice
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use taslink::LinkError;
//!
//! let error = LinkError::transport("connect", std::io::ErrorKind::ConnectionRefused.into());
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Result type alias for link and playback operations.
pub type Result<T, E = LinkError> = std::result::Result<T, E>;

/// Main error type for link and playback operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LinkError {
    #[error("Transport error during {context}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection closed prematurely: expected {expected} bytes, received {received}")]
    ConnectionClosed { expected: usize, received: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Attempted to use the studio link while not connected")]
    NotConnected,

    #[error("Protocol error (opcode {opcode}): {details}")]
    Protocol { opcode: u8, details: String },

    #[error("Payload of {len} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Timeline error in {context}: {details}")]
    Timeline { context: String, details: String },

    #[error("Cannot {operation} while {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("Invalid configuration: {details}")]
    Config { details: String },
}

impl LinkError {
    /// Returns whether the supervisor should reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Transport { .. } => true,
            LinkError::ConnectionClosed { .. } => true,
            LinkError::NotConnected => true,
            LinkError::Cancelled => false,
            LinkError::Protocol { .. } => false,
            LinkError::PayloadTooLarge { .. } => false,
            LinkError::Timeline { .. } => false,
            LinkError::InvalidState { .. } => false,
            LinkError::Config { .. } => false,
        }
    }

    /// Returns whether this error is the result of an explicit cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LinkError::Cancelled)
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            LinkError::Transport { .. } | LinkError::ConnectionClosed { .. } => vec![
                "Ensure the studio is running and listening",
                "Check that nothing else is bound to the studio port",
                "Wait for the automatic reconnect",
            ],
            LinkError::NotConnected => {
                vec!["Wait for the link to report Connected", "Call start() on the client"]
            }
            LinkError::Cancelled => vec!["Create a new client after cancelling the old one"],
            LinkError::Protocol { .. } | LinkError::PayloadTooLarge { .. } => vec![
                "Check that the studio and the player speak the same protocol version",
                "Inspect the studio logs for the offending message",
            ],
            LinkError::Timeline { .. } => vec![
                "Check the timeline file for malformed lines",
                "Re-send the path from the studio after fixing the file",
            ],
            LinkError::InvalidState { .. } => {
                vec!["Check the playback state before issuing the command"]
            }
            LinkError::Config { .. } => vec!["Check the configuration values and units"],
        }
    }

    /// Helper constructor for transport errors with context.
    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        LinkError::Transport { context: context.into(), source }
    }

    /// Helper constructor for protocol errors.
    pub fn protocol(opcode: u8, details: impl Into<String>) -> Self {
        LinkError::Protocol { opcode, details: details.into() }
    }

    /// Helper constructor for timeline resolution errors.
    pub fn timeline(context: impl Into<String>, details: impl Into<String>) -> Self {
        LinkError::Timeline { context: context.into(), details: details.into() }
    }

    /// Helper constructor for caller misuse.
    pub fn invalid_state(operation: &'static str, state: impl Into<String>) -> Self {
        LinkError::InvalidState { operation, state: state.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(details: impl Into<String>) -> Self {
        LinkError::Config { details: details.into() }
    }
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        LinkError::Transport { context: "<unknown>".to_string(), source: err }
    }
}
