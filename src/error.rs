//! Error types and result handling for pg-stream.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_stream::{Error, Result};
//!
//! fn subscribe_again() -> Result<()> {
//!     Err(Error::AlreadyRunning)
//! }
//!
//! match subscribe_again() {
//!     Ok(()) => println!("Subscribed"),
//!     Err(Error::AlreadyRunning) => eprintln!("Consumer is already running"),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for pg-stream operations.
///
/// This enum represents all possible errors that can occur while
/// subscribing to replication slots, reading the stream, acknowledging
/// positions, and decoding change sets.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid file or environment variable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error from the catalog connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON error when parsing a change set or slot definitions.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the replication socket or a definitions file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Malformed framing on the replication connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an `ErrorResponse` frame.
    #[error("Server error: {0}")]
    Server(ServerError),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// A read deadline expired before a frame arrived.
    ///
    /// The polling loop treats this as a liveness tick, not a failure.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// `subscribe` was called while the consumer is running.
    #[error("Consumer is already running")]
    AlreadyRunning,

    /// The consumer has been closed, or failed to start.
    #[error("Consumer has been disposed")]
    Disposed,

    /// A requested replication slot does not exist.
    #[error("Replication slot '{0}' does not exist")]
    SlotNotFound(String),

    /// Slot creation hit an existing slot of the same name.
    #[error("Replication slot '{0}' already exists")]
    SlotAlreadyExists(String),

    /// An LSN string is not of the form `X/Y`.
    #[error("Invalid LSN: '{0}'")]
    InvalidLsn(String),

    /// A change set is structurally inconsistent.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the inconsistency
        message: String,
    },

    /// A field value could not be coerced into its destination.
    #[error("Cannot bind field '{field}': {message}")]
    Bind {
        /// Column name
        field: String,
        /// Reason the coercion failed
        message: String,
    },
}

impl Error {
    /// Returns `true` for an expired read deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns the SQLSTATE code carried by a server error, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(err.code.as_str()),
            Error::Postgres(err) => err.code().map(|code| code.code()),
            _ => None,
        }
    }
}

/// Fields of a PostgreSQL `ErrorResponse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// A convenient Result type alias for pg-stream operations.
///
/// This is equivalent to `std::result::Result<T, pg_stream::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
