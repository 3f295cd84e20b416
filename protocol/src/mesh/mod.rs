//! # Mesh Module
//!
//! Flood-broadcast messaging over direct peer links. Every node forwards
//! every novel message to all of its ready neighbours except the one it came
//! from; a time-bounded cache of seen message ids stops cycles.
//!
//! ## Architecture
//!
//! ```text
//! envelope.rs    — Message identity, wire codec
//! cache.rs       — Seen-message cache with time-based eviction
//! connection.rs  — Per-peer handshake state machine and registry
//! transport.rs   — Peer transport seam (offer/answer, writable, data)
//! signaling.rs   — Signaling seam (init/answer/finish/disconnect)
//! flood.rs       — Fan-out to every ready peer except the origin
//! dispatcher.rs  — Local event-name to callback dispatch
//! node.rs        — The node aggregate: publish, receive pipeline, run loop
//! loopback.rs    — In-process transport fabric and signaling hub
//! ```
//!
//! ## Design Decisions
//!
//! - Registry and cache live under one `parking_lot::Mutex`, so dedup and
//!   relay for a message are a single critical section. Subscriber callbacks
//!   run after it is released.
//! - Transports and signaling talk to the node through channels rather than
//!   callbacks. Out-of-order events are resolved by the connection state
//!   machine; events from replaced transports are fenced by epoch.
//! - There is no hop counter. Termination relies entirely on the seen cache.

pub mod cache;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod flood;
pub mod loopback;
pub mod node;
pub mod signaling;
pub mod transport;

pub use cache::{CacheEntry, Origin, SeenCache};
pub use connection::{Connection, ConnectionId, ConnectionPhase, ConnectionRegistry, PhaseKind};
pub use dispatcher::{EventDispatcher, Subscriber};
pub use envelope::{Envelope, MessageId};
pub use error::{MeshError, MeshResult, TransportError};
pub use flood::{broadcast, FloodReport};
pub use loopback::{LoopbackFabric, LoopbackHub, LoopbackSignaling, LoopbackTransport};
pub use node::{ConnectionInfo, Delivery, MeshConfig, MeshNode, MeshStats};
pub use signaling::{
    CompletionReply, DescriptionReply, Reply, SignalingClient, SignalingEvent, SignalingStream,
};
pub use transport::{
    PeerTransport, Role, SessionDescription, TransportEvent, TransportEvents, TransportFactory,
    TransportSignal,
};
