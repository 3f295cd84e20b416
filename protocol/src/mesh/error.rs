//! Error types for the mesh engine.
//!
//! Routing outcomes (duplicate drops, skipped non-ready peers, disconnecting
//! an unknown connection) are deliberately absent here: they are normal
//! behaviour of a flood on a cyclic topology and are only counted and logged.

use thiserror::Error;

/// Errors surfaced by mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// An inbound frame could not be decoded into an envelope (missing id or
    /// event name, invalid JSON, ...).
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An application payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An operation referenced a connection the registry does not know.
    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    /// A handshake event arrived in a phase that cannot accept it.
    #[error("connection {connection} in phase {phase} cannot handle {event}")]
    InvalidPhase {
        /// Remote connection id.
        connection: String,
        /// Phase the connection was in.
        phase: &'static str,
        /// The event that was rejected.
        event: &'static str,
    },

    /// The peer transport reported an error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The signaling collaborator failed or went away.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The remote side reported that the handshake did not complete.
    #[error("handshake with {0} failed")]
    HandshakeFailed(String),

    /// The handshake did not complete within the signaling timeout.
    #[error("handshake with {connection} timed out after {timeout_ms}ms")]
    HandshakeTimeout {
        /// Remote connection id.
        connection: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The node was shut down and no longer accepts operations.
    #[error("node has been shut down")]
    ShutDown,
}

/// Errors reported by a peer transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel exists but cannot carry bytes yet.
    #[error("transport is not writable")]
    NotWritable,

    /// The channel has been torn down.
    #[error("transport is closed")]
    Closed,

    /// The remote description could not be applied.
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Convenience alias used throughout the mesh module.
pub type MeshResult<T> = Result<T, MeshError>;
