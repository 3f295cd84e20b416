//! # Peer Transport Seam
//!
//! The direct point-to-point channel between two nodes (a browser data
//! channel, a QUIC stream, an in-memory pipe in tests) is an external
//! collaborator. The mesh only needs the narrow surface described here:
//!
//! ```text
//! core -> transport : create_initiator / create_responder,
//!                     accept_remote_description, send, destroy
//! transport -> core : LocalDescription, Writable, Data, Failed
//! ```
//!
//! Transport-to-core signals are plain messages pushed through a
//! [`TransportEvents`] handle into the owning node's queue. The node drains
//! that queue on its own control flow, so a transport never calls back into
//! mesh state directly and events that arrive out of order are handled by
//! the connection state machine rather than by re-entrant callbacks.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::connection::ConnectionId;
use super::error::TransportError;

// ---------------------------------------------------------------------------
// Session Descriptions
// ---------------------------------------------------------------------------

/// Opaque connection-setup blob (offer or answer).
///
/// The mesh never inspects it; it is produced by one transport, carried by
/// the signaling collaborator, and fed into the remote transport.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionDescription(Bytes);

impl SessionDescription {
    /// Wraps raw description bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw description bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionDescription({} bytes)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// Roles & Events
// ---------------------------------------------------------------------------

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the offer and completes the handshake.
    Initiator,
    /// Answers an incoming offer.
    Responder,
}

/// Signals a transport reports back to its node.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport produced its local description (offer or answer).
    LocalDescription(SessionDescription),
    /// The channel is open and can carry application bytes.
    Writable,
    /// Raw bytes arrived from the remote side.
    Data(Bytes),
    /// Unrecoverable fault; the channel will never become writable.
    Failed(String),
}

impl TransportEvent {
    /// Short event name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::LocalDescription(_) => "local-description",
            TransportEvent::Writable => "writable",
            TransportEvent::Data(_) => "data",
            TransportEvent::Failed(_) => "failed",
        }
    }
}

/// A transport event tagged with the connection and transport epoch it
/// belongs to. The epoch lets the node discard events from a transport that
/// was torn down and replaced under the same connection id.
#[derive(Debug, Clone)]
pub struct TransportSignal {
    /// Connection the emitting transport is attached to.
    pub connection: ConnectionId,
    /// Epoch of the emitting transport.
    pub epoch: u64,
    /// The event itself.
    pub event: TransportEvent,
}

/// Handle a transport uses to report events to its node.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    connection: ConnectionId,
    epoch: u64,
    tx: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportEvents {
    /// Creates a handle for `connection` at `epoch` feeding `tx`.
    pub fn new(
        connection: ConnectionId,
        epoch: u64,
        tx: mpsc::UnboundedSender<TransportSignal>,
    ) -> Self {
        Self {
            connection,
            epoch,
            tx,
        }
    }

    /// The connection this handle reports for.
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// The transport epoch this handle reports for.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queues an event for the node. Returns `false` if the node is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportSignal {
                connection: self.connection.clone(),
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }

    /// Reports the local description.
    pub fn local_description(&self, description: SessionDescription) -> bool {
        self.emit(TransportEvent::LocalDescription(description))
    }

    /// Reports that the channel became writable.
    pub fn writable(&self) -> bool {
        self.emit(TransportEvent::Writable)
    }

    /// Delivers received bytes.
    pub fn data(&self, bytes: impl Into<Bytes>) -> bool {
        self.emit(TransportEvent::Data(bytes.into()))
    }

    /// Reports an unrecoverable fault.
    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Failed(reason.into()))
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A direct channel to one remote node.
///
/// Owned exclusively by its [`Connection`](super::connection::Connection)
/// and destroyed exactly once: `destroy` consumes the box.
pub trait PeerTransport: Send {
    /// Feeds the remote offer (responder) or answer (initiator).
    fn accept_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Whether the channel can carry bytes right now.
    fn is_writable(&self) -> bool;

    /// Sends one frame. Callers only send when the channel is writable.
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError>;

    /// Tears the channel down.
    fn destroy(self: Box<Self>);
}

/// Creates transports for new connections.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport for `role`, reporting through `events`.
    ///
    /// An initiator is expected to emit its offer as a
    /// [`TransportEvent::LocalDescription`] on its own; a responder emits its
    /// answer after [`PeerTransport::accept_remote_description`].
    fn create(
        &self,
        role: Role,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;

    /// Creates an initiator transport.
    fn create_initiator(
        &self,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        self.create(Role::Initiator, events)
    }

    /// Creates a responder transport.
    fn create_responder(
        &self,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        self.create(Role::Responder, events)
    }
}
