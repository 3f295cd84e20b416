//! # Mesh Configuration & Constants
//!
//! Every tunable of the mesh lives here. Runtime configuration
//! ([`MeshConfig`](crate::mesh::MeshConfig)) takes its defaults from these
//! values; the node binary lets operators override them per run.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate version, reported by the `version` subcommand.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the envelope wire format. Bump when the JSON keys change.
pub const WIRE_PROTOCOL_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

/// How long a seen message id is remembered. Long enough to outlive any
/// realistic flood over the mesh; a message replayed after this window is
/// treated as new.
pub const DEFAULT_CACHE_RETENTION: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Namespace appended to the signaling host on connect.
pub const SIGNALING_NAMESPACE: &str = "/mesh";

/// How long the in-process signaling hub waits for each handshake reply.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Default number of nodes in a simulated mesh.
pub const DEFAULT_SIMULATION_NODES: usize = 8;

/// Default number of messages each simulation publishes.
pub const DEFAULT_SIMULATION_MESSAGES: usize = 10;

/// How long a simulation waits for the flood to settle.
pub const DEFAULT_SIMULATION_SETTLE: Duration = Duration::from_secs(10);
