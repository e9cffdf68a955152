//! Error types for the handoff engine.

use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors returned by address validation, registration, listener
/// acquisition and reload.
#[derive(Debug, Error)]
pub enum GraceError {
    /// Unix-family address without a socket path, or another family with port 0.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Network kind outside tcp/tcp4/tcp6/unix/unixpacket.
    #[error("Network {0} is not supported")]
    UnsupportedNetwork(String),

    /// The canonical address was already registered by another adapter.
    #[error("Address {0} is already registered")]
    AlreadyRegistered(String),

    /// A listener was requested for an address that was never registered.
    #[error("Address {0} is not registered")]
    NotRegistered(String),

    /// Binding or listening failed.
    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// An inherited fd offset does not refer to a usable listening socket.
    #[error("Inherited fd {fd} is unusable: {reason}")]
    InheritedFd { fd: RawFd, reason: String },

    /// Re-executing the current binary failed.
    #[error("Failed to spawn new process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Self re-exec is only defined for single-process roles.
    #[error("Reload by re-exec is only supported in single-process mode")]
    NotSingleProcess,

    /// Registering an OS signal handler failed.
    #[error("Failed to register signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl GraceError {
    /// Create a new invalid address error.
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a new inherited fd error.
    pub fn inherited_fd(fd: RawFd, reason: impl Into<String>) -> Self {
        Self::InheritedFd {
            fd,
            reason: reason.into(),
        }
    }
}

/// A specialized Result type for handoff operations.
pub type Result<T> = std::result::Result<T, GraceError>;
