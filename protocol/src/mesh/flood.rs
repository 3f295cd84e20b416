//! # Flood Dissemination
//!
//! Every node forwards every novel message to every ready neighbour except
//! the one it came from. There is no fanout limit and no hop counter: on a
//! cyclic topology the seen-message cache is what stops a message from
//! circulating, so a relay must only ever happen after a successful dedup
//! check.
//!
//! The envelope is encoded once per flood and the same frame is handed to
//! every eligible transport. Failures on individual links are counted and
//! logged; they never abort the rest of the fan-out.

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::connection::{ConnectionId, ConnectionRegistry};
use super::envelope::Envelope;
use super::error::MeshResult;

/// Outcome of one flood over the registry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodReport {
    /// Frames handed to a transport.
    pub sent: usize,
    /// Connections skipped because the arrival link was excluded.
    pub excluded: usize,
    /// Connections skipped because they are not ready or not writable.
    pub skipped_not_ready: usize,
    /// Sends the transport rejected.
    pub failed: usize,
}

/// Sends `envelope` over every sendable connection in `registry`, skipping
/// `exclude` (the arrival connection, if relaying).
pub fn broadcast(
    registry: &mut ConnectionRegistry,
    envelope: &Envelope,
    exclude: Option<&ConnectionId>,
) -> MeshResult<FloodReport> {
    let frame = envelope.encode()?;
    let mut report = FloodReport::default();

    for peer in registry.iter_mut() {
        if exclude.is_some_and(|origin| origin == peer.id()) {
            report.excluded += 1;
            continue;
        }

        if !peer.is_sendable() {
            trace!(connection = %peer.id(), phase = %peer.kind(), "skipping peer that is not ready");
            report.skipped_not_ready += 1;
            continue;
        }

        match peer.send(frame.clone()) {
            Ok(()) => {
                trace!(connection = %peer.id(), message = %envelope.id(), "frame sent");
                report.sent += 1;
            }
            Err(e) => {
                warn!(connection = %peer.id(), message = %envelope.id(), error = %e, "send failed");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
