//! # Seen-Message Cache
//!
//! The deduplication gate of the flood. Every envelope a node originates or
//! accepts is recorded here; a second arrival of the same id (over another
//! link of a cyclic topology, typically) is recognized and dropped before it
//! can be relayed or delivered again.
//!
//! ## Retention
//!
//! Entries are kept for a fixed window (60 s by default). There is no
//! background timer: expired entries are swept on every dedup check, so the
//! sweep cost scales with traffic rather than with idle time. A message that
//! reappears after its entry was evicted is treated as novel again.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use super::connection::ConnectionId;
use super::envelope::{Envelope, MessageId};

// ---------------------------------------------------------------------------
// Cache Entries
// ---------------------------------------------------------------------------

/// Where a recorded message came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Published by this node.
    Local,
    /// Received over the given peer connection.
    Connection(ConnectionId),
}

impl Origin {
    /// The arrival connection, or `None` for locally published messages.
    pub fn connection(&self) -> Option<&ConnectionId> {
        match self {
            Origin::Local => None,
            Origin::Connection(id) => Some(id),
        }
    }
}

/// One record in the seen-message cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The recorded envelope, shared with the receive pipeline.
    pub envelope: Arc<Envelope>,
    /// Arrival connection or local origin.
    pub origin: Origin,
    /// When the entry was recorded; drives eviction.
    pub recorded_at: Instant,
}

// ---------------------------------------------------------------------------
// Seen Cache
// ---------------------------------------------------------------------------

/// Time-bounded record of message ids already processed by this node.
///
/// Holds at most one entry per [`MessageId`]. Not internally synchronized:
/// the owning [`MeshNode`](super::node::MeshNode) keeps it in the same lock
/// as the connection registry so that dedup and relay form one critical
/// section.
#[derive(Debug)]
pub struct SeenCache {
    entries: HashMap<MessageId, CacheEntry>,
    retention: Duration,
}

impl SeenCache {
    /// Creates an empty cache with the given retention window.
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            retention,
        }
    }

    /// Records `envelope` if its id has not been seen. Returns `true` when
    /// the message is novel and was inserted, `false` for a duplicate.
    ///
    /// Sweeps expired entries first.
    pub fn record_if_new(&mut self, envelope: Arc<Envelope>, origin: Origin) -> bool {
        self.record_if_new_at(envelope, origin, Instant::now())
    }

    /// [`record_if_new`](Self::record_if_new) against an explicit clock.
    pub fn record_if_new_at(
        &mut self,
        envelope: Arc<Envelope>,
        origin: Origin,
        now: Instant,
    ) -> bool {
        self.sweep_expired(now);

        match self.entries.entry(envelope.id()) {
            Entry::Occupied(_) => {
                trace!(message = %envelope.id(), "message already seen");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    envelope,
                    origin,
                    recorded_at: now,
                });
                true
            }
        }
    }

    /// Records a locally published envelope unconditionally.
    pub fn record_local(&mut self, envelope: Arc<Envelope>) {
        self.record_local_at(envelope, Instant::now());
    }

    /// [`record_local`](Self::record_local) against an explicit clock.
    /// Sweeps expired entries first, like every other insert.
    pub fn record_local_at(&mut self, envelope: Arc<Envelope>, now: Instant) {
        self.sweep_expired(now);
        self.entries.insert(
            envelope.id(),
            CacheEntry {
                envelope,
                origin: Origin::Local,
                recorded_at: now,
            },
        );
    }

    /// Removes every entry older than the retention window. Returns the
    /// number of evicted entries.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let retention = self.retention;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.recorded_at) <= retention);

        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!(evicted, remaining = self.entries.len(), "swept seen cache");
        }
        evicted
    }

    /// Whether `id` is currently recorded.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    /// The origin recorded for `id`, if present.
    pub fn origin_of(&self, id: &MessageId) -> Option<&Origin> {
        self.entries.get(id).map(|entry| &entry.origin)
    }

    /// Looks up the full entry for `id`.
    pub fn get(&self, id: &MessageId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    /// Number of recorded messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
