//! Error types for imgxfer.
//!
//! The transfer taxonomy (session creation, readiness, connection, chunk
//! aborts, early EOF, pause/resume timeouts, integrity mismatch) has one
//! variant each. The remaining variants cover the ambient failure modes of
//! the control plane, TLS, configuration and host commands.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for imgxfer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for imgxfer.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing image or snapshot could not be resolved into a session (X001)
    #[error("failed to create transfer session: {0}")]
    SessionCreation(String),

    /// The session stayed in the initializing phase too long (X002)
    #[error("session did not leave initializing phase within {0} seconds")]
    InitializationTimeout(u64),

    /// The proxy could not be reached or the handshake failed (X003)
    #[error("failed to connect to proxy: {0}")]
    Connection(String),

    /// A chunk failed with an HTTP error status or the proxy disconnected (X004)
    #[error("transfer aborted at offset {offset}: {reason}")]
    TransferAborted {
        /// Byte offset of the chunk that failed
        offset: u64,
        /// What went wrong
        reason: String,
    },

    /// The upload source ran out of data before the declared size (X005)
    #[error("upload source ended at {position} of {expected} bytes")]
    UnexpectedEof {
        /// Bytes read before the source was exhausted
        position: u64,
        /// Bytes the transfer declared
        expected: u64,
    },

    /// The session did not reach `paused_user` in time (X006)
    #[error("session was not paused within {0} seconds")]
    PauseTimeout(u64),

    /// The session did not return to `transferring` in time (X007)
    #[error("session did not resume within {0} seconds")]
    ResumeTimeout(u64),

    /// Source and destination digests differ (X008)
    #[error("checksum mismatch: source {source_digest}, destination {destination_digest}")]
    IntegrityMismatch {
        /// Digest taken before the transfer
        source_digest: String,
        /// Digest taken after the transfer
        destination_digest: String,
    },

    /// The control plane rejected or failed a request
    #[error("control plane error: {0}")]
    ControlPlane(String),

    /// TLS configuration or handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// The peer sent something we could not interpret
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transfer was cancelled by the caller
    #[error("transfer cancelled")]
    Cancelled,

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// A command on the storage host failed
    #[error("host command failed: {0}")]
    HostCommand(String),

    /// Invalid input from the caller
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the short code associated with this error, if any.
    ///
    /// Codes follow the pattern XNNN and are stable across releases.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::SessionCreation(_) => Some("X001"),
            Self::InitializationTimeout(_) => Some("X002"),
            Self::Connection(_) => Some("X003"),
            Self::TransferAborted { .. } => Some("X004"),
            Self::UnexpectedEof { .. } => Some("X005"),
            Self::PauseTimeout(_) => Some("X006"),
            Self::ResumeTimeout(_) => Some("X007"),
            Self::IntegrityMismatch { .. } => Some("X008"),
            _ => None,
        }
    }

    /// Returns whether the failure came from the bulk data path rather than
    /// the control plane.
    #[must_use]
    pub const fn is_data_plane(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::TransferAborted { .. }
                | Self::UnexpectedEof { .. }
                | Self::Tls(_)
        )
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::SessionCreation(_) => Some(
                "Check that the disk or snapshot id exists and is not locked\n\
                 by another operation.",
            ),
            Self::InitializationTimeout(_) => Some(
                "The storage host may be busy. Raise [transfer] ready_timeout\n\
                 or retry later.",
            ),
            Self::Connection(_) | Self::Tls(_) => Some(
                "Check that the proxy is reachable and that [control_plane] ca_file\n\
                 points at the CA that signed its certificate.",
            ),
            Self::UnexpectedEof { .. } => Some(
                "The local file is shorter than the declared size. Drop --size\n\
                 to use the file length.",
            ),
            _ => None,
        }
    }
}
