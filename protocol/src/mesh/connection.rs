//! # Connections
//!
//! A [`Connection`] is the local record of one remote node: its handshake
//! phase and the transport that carries bytes to it. The lifecycle is an
//! explicit state machine:
//!
//! ```text
//!            InitConnection                 LocalDescription        FinishConnection      Writable
//! Requested ───────────────> AwaitingLocalDescription(initiator) ──> AwaitingRemoteAnswer ──> AwaitingReady ──> Ready
//!     │      AnswerConnection                LocalDescription                         Writable
//!     └────────────────────> AwaitingLocalDescription(responder) ──> AwaitingCompletion ──────────────────────> Ready
//!
//! any phase ── Failed ──> Failed        any phase ── DisconnectFrom ──> Closed (entry removed)
//! ```
//!
//! Only a `Ready` connection whose transport reports itself writable takes
//! part in fan-out. A `Writable` signal that arrives before the phase that
//! expects it is remembered, so the connection is promoted as soon as the
//! handshake catches up.

use std::collections::HashMap;
use std::fmt;
use std::mem;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::{MeshError, MeshResult, TransportError};
use super::signaling::{resolve, CompletionReply, DescriptionReply};
use super::transport::{PeerTransport, Role, SessionDescription};

// ---------------------------------------------------------------------------
// Connection Identity
// ---------------------------------------------------------------------------

/// Identifier of a remote node as assigned by the signaling collaborator.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Handshake phase, carrying any signaling reply still owed to the remote.
#[derive(Debug)]
pub enum ConnectionPhase {
    /// Entry exists, no transport yet.
    Requested,
    /// Transport created; waiting for it to produce its local description.
    AwaitingLocalDescription {
        role: Role,
        reply: Option<DescriptionReply>,
    },
    /// Initiator sent its offer and waits for `FinishConnection`.
    AwaitingRemoteAnswer,
    /// Responder sent its answer and waits for the channel to open.
    AwaitingCompletion,
    /// Initiator applied the answer and waits for the channel to open.
    AwaitingReady { reply: Option<CompletionReply> },
    /// Handshake complete.
    Ready,
    /// The transport failed; never becomes ready again.
    Failed { reason: String },
    /// Torn down.
    Closed,
}

/// Copyable summary of a [`ConnectionPhase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Requested,
    AwaitingLocalDescription,
    AwaitingRemoteAnswer,
    AwaitingCompletion,
    AwaitingReady,
    Ready,
    Failed,
    Closed,
}

impl PhaseKind {
    /// Short name for logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            PhaseKind::Requested => "requested",
            PhaseKind::AwaitingLocalDescription => "awaiting-local-description",
            PhaseKind::AwaitingRemoteAnswer => "awaiting-remote-answer",
            PhaseKind::AwaitingCompletion => "awaiting-completion",
            PhaseKind::AwaitingReady => "awaiting-ready",
            PhaseKind::Ready => "ready",
            PhaseKind::Failed => "failed",
            PhaseKind::Closed => "closed",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ConnectionPhase {
    /// The copyable kind of this phase.
    pub fn kind(&self) -> PhaseKind {
        match self {
            ConnectionPhase::Requested => PhaseKind::Requested,
            ConnectionPhase::AwaitingLocalDescription { .. } => PhaseKind::AwaitingLocalDescription,
            ConnectionPhase::AwaitingRemoteAnswer => PhaseKind::AwaitingRemoteAnswer,
            ConnectionPhase::AwaitingCompletion => PhaseKind::AwaitingCompletion,
            ConnectionPhase::AwaitingReady { .. } => PhaseKind::AwaitingReady,
            ConnectionPhase::Ready => PhaseKind::Ready,
            ConnectionPhase::Failed { .. } => PhaseKind::Failed,
            ConnectionPhase::Closed => PhaseKind::Closed,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Local record of one remote node.
pub struct Connection {
    id: ConnectionId,
    role: Option<Role>,
    phase: ConnectionPhase,
    transport: Option<Box<dyn PeerTransport>>,
    epoch: u64,
    early_writable: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("phase", &self.phase.kind())
            .field("has_transport", &self.transport.is_some())
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl Connection {
    /// Creates a fresh record in the `Requested` phase.
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            role: None,
            phase: ConnectionPhase::Requested,
            transport: None,
            epoch: 0,
            early_writable: false,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Handshake role, once a transport has been attached.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn kind(&self) -> PhaseKind {
        self.phase.kind()
    }

    /// Epoch of the attached transport. Events tagged with any other epoch
    /// are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Whether the handshake has completed.
    pub fn is_ready(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Ready)
    }

    /// Whether fan-out may use this connection right now: handshake complete
    /// and the transport itself reports writable.
    pub fn is_sendable(&self) -> bool {
        self.is_ready()
            && self
                .transport
                .as_ref()
                .map_or(false, |transport| transport.is_writable())
    }

    /// Whether inbound data on this connection is routed into the receive
    /// pipeline. Responders accept data from the moment they answer;
    /// initiators only once the answer has been applied.
    pub fn accepts_data(&self) -> bool {
        match &self.phase {
            ConnectionPhase::AwaitingLocalDescription { role, .. } => *role == Role::Responder,
            ConnectionPhase::AwaitingCompletion
            | ConnectionPhase::AwaitingReady { .. }
            | ConnectionPhase::Ready => true,
            _ => false,
        }
    }

    /// Whether a new transport may be attached.
    pub fn can_start(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Requested) && self.transport.is_none()
    }

    fn invalid(&self, event: &'static str) -> MeshError {
        MeshError::InvalidPhase {
            connection: self.id.to_string(),
            phase: self.kind().name(),
            event,
        }
    }

    fn attach(&mut self, role: Role, transport: Box<dyn PeerTransport>, epoch: u64) {
        self.role = Some(role);
        self.transport = Some(transport);
        self.epoch = epoch;
        self.early_writable = false;
    }

    // -- Signaling-driven transitions -----------------------------------------

    /// Attaches an initiator transport. The offer is returned through `reply`
    /// once the transport reports its local description.
    pub fn start_initiator(
        &mut self,
        transport: Box<dyn PeerTransport>,
        epoch: u64,
        reply: DescriptionReply,
    ) -> MeshResult<PhaseKind> {
        if !self.can_start() {
            transport.destroy();
            return Err(self.invalid("init-connection"));
        }

        self.attach(Role::Initiator, transport, epoch);
        self.phase = ConnectionPhase::AwaitingLocalDescription {
            role: Role::Initiator,
            reply: Some(reply),
        };
        Ok(self.kind())
    }

    /// Attaches a responder transport and feeds it the remote offer.
    ///
    /// If the offer is rejected the transport is destroyed and the connection
    /// moves to `Failed`.
    pub fn start_responder(
        &mut self,
        transport: Box<dyn PeerTransport>,
        epoch: u64,
        offer: SessionDescription,
        reply: DescriptionReply,
    ) -> MeshResult<PhaseKind> {
        if !self.can_start() {
            transport.destroy();
            return Err(self.invalid("answer-connection"));
        }

        self.attach(Role::Responder, transport, epoch);
        self.phase = ConnectionPhase::AwaitingLocalDescription {
            role: Role::Responder,
            reply: Some(reply),
        };

        if let Err(e) = self.feed_remote(offer) {
            self.fail(e.to_string());
            return Err(e.into());
        }
        Ok(self.kind())
    }

    /// Applies the remote answer on an initiator.
    ///
    /// Resolves `reply` with `true` as soon as the channel is writable, or
    /// with `false` if the answer is rejected or the transport later fails.
    pub fn finish(
        &mut self,
        answer: SessionDescription,
        reply: CompletionReply,
    ) -> MeshResult<PhaseKind> {
        let accepted = match &self.phase {
            ConnectionPhase::AwaitingRemoteAnswer => true,
            // The answer overtook our own offer report; the remote evidently
            // already has the offer, so the pending description reply is moot.
            ConnectionPhase::AwaitingLocalDescription { role, .. } => *role == Role::Initiator,
            _ => false,
        };
        if !accepted {
            resolve(Some(reply), false, &self.id);
            return Err(self.invalid("finish-connection"));
        }

        if let Err(e) = self.feed_remote(answer) {
            resolve(Some(reply), false, &self.id);
            self.fail(e.to_string());
            return Err(e.into());
        }

        self.phase = ConnectionPhase::AwaitingReady { reply: Some(reply) };
        self.promote_if_writable();
        Ok(self.kind())
    }

    fn feed_remote(&mut self, description: SessionDescription) -> Result<(), TransportError> {
        match self.transport.as_mut() {
            Some(transport) => transport.accept_remote_description(description),
            None => Err(TransportError::Closed),
        }
    }

    // -- Transport-driven transitions -----------------------------------------

    /// Handles the transport's local description, forwarding it through the
    /// pending signaling reply.
    pub fn on_local_description(
        &mut self,
        description: SessionDescription,
    ) -> MeshResult<PhaseKind> {
        let phase = mem::replace(&mut self.phase, ConnectionPhase::Requested);
        match phase {
            ConnectionPhase::AwaitingLocalDescription { role, reply } => {
                resolve(reply, description, &self.id);
                self.phase = match role {
                    Role::Initiator => ConnectionPhase::AwaitingRemoteAnswer,
                    Role::Responder => ConnectionPhase::AwaitingCompletion,
                };
                self.promote_if_writable();
                Ok(self.kind())
            }
            other => {
                self.phase = other;
                Err(self.invalid("local-description"))
            }
        }
    }

    /// Handles the transport becoming writable.
    ///
    /// Returns `true` if this call moved the connection to `Ready`.
    pub fn on_writable(&mut self) -> bool {
        match self.phase {
            ConnectionPhase::AwaitingCompletion | ConnectionPhase::AwaitingReady { .. } => {
                self.early_writable = true;
                self.promote_if_writable()
            }
            ConnectionPhase::AwaitingLocalDescription { .. }
            | ConnectionPhase::AwaitingRemoteAnswer => {
                self.early_writable = true;
                false
            }
            _ => false,
        }
    }

    fn promote_if_writable(&mut self) -> bool {
        if !self.early_writable {
            return false;
        }
        let phase = mem::replace(&mut self.phase, ConnectionPhase::Ready);
        match phase {
            ConnectionPhase::AwaitingReady { reply } => {
                resolve(reply, true, &self.id);
                true
            }
            ConnectionPhase::AwaitingCompletion => true,
            other => {
                self.phase = other;
                false
            }
        }
    }

    /// Moves the connection to `Failed`, refusing any pending completion.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let phase = mem::replace(
            &mut self.phase,
            ConnectionPhase::Failed {
                reason: reason.into(),
            },
        );
        if let ConnectionPhase::AwaitingReady { reply } = phase {
            resolve(reply, false, &self.id);
        }
        // A pending description reply is simply dropped; the remote sees
        // the channel close.
    }

    /// Tears the connection down, destroying its transport exactly once.
    /// Returns `true` if a transport was destroyed.
    pub fn close(&mut self) -> bool {
        let phase = mem::replace(&mut self.phase, ConnectionPhase::Closed);
        if let ConnectionPhase::AwaitingReady { reply } = phase {
            resolve(reply, false, &self.id);
        }
        match self.transport.take() {
            Some(transport) => {
                transport.destroy();
                true
            }
            None => false,
        }
    }

    /// Sends one frame over the transport.
    pub fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_sendable() {
            return Err(TransportError::NotWritable);
        }
        match self.transport.as_mut() {
            Some(transport) => transport.send(frame),
            None => Err(TransportError::Closed),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Map from remote connection id to its [`Connection`].
///
/// At most one record per id. Not internally synchronized; owned by the
/// node's state lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    next_epoch: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `id`, creating a `Requested` one if absent.
    /// Never replaces an existing record.
    pub fn get_or_create(&mut self, id: &ConnectionId) -> &mut Connection {
        self.connections
            .entry(id.clone())
            .or_insert_with(|| Connection::new(id.clone()))
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Removes and returns the record for `id`.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<Connection> {
        self.connections.remove(id)
    }

    /// Iterates over every record.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Iterates mutably over every record.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Ids of every `Ready` connection, sorted.
    pub fn ready_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.is_ready())
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Removes every record.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.connections.drain().map(|(_, c)| c).collect()
    }

    /// Allocates a fresh transport epoch.
    pub fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
