//! # Mesh Node
//!
//! The `MeshNode` is the runtime entity for one mesh participant. It owns
//! the connection registry, the seen-message cache and the local event
//! dispatcher, and it is driven by two inbound streams:
//!
//! - **signaling events** (`InitConnection`, `AnswerConnection`,
//!   `FinishConnection`, `DisconnectFrom`) that build and tear down links;
//! - **transport signals** (local description, writable, data, failure)
//!   that its transports push into its queue.
//!
//! ```text
//! new() -> connect(client, host) -> [run loop] -> shutdown()
//! ```
//!
//! Either stream can also be fed by hand (`handle_signaling`,
//! `handle_transport`, `pump`), which is how deterministic tests drive a node
//! without a runtime.
//!
//! ## Concurrency
//!
//! Registry and cache share a single lock. The dedup check and the relay
//! fan-out for one message happen inside that lock, so two threads receiving
//! the same id over different links can never both relay it. Subscriber
//! callbacks run after the lock is released; a callback may publish.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config;

use super::cache::{Origin, SeenCache};
use super::connection::{Connection, ConnectionId, ConnectionRegistry, PhaseKind};
use super::dispatcher::EventDispatcher;
use super::envelope::{Envelope, MessageId};
use super::error::{MeshError, MeshResult};
use super::flood::{self, FloodReport};
use super::signaling::{
    resolve, CompletionReply, DescriptionReply, SignalingClient, SignalingEvent, SignalingStream,
};
use super::transport::{
    Role, SessionDescription, TransportEvent, TransportEvents, TransportFactory, TransportSignal,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration of a mesh node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// How long seen message ids are remembered, in milliseconds.
    pub cache_retention_ms: u64,
    /// Namespace appended to the signaling host on connect.
    pub signaling_namespace: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            cache_retention_ms: config::DEFAULT_CACHE_RETENTION.as_millis() as u64,
            signaling_namespace: config::SIGNALING_NAMESPACE.to_string(),
        }
    }
}

impl MeshConfig {
    /// Retention window as a [`Duration`].
    pub fn cache_retention(&self) -> Duration {
        Duration::from_millis(self.cache_retention_ms)
    }

    /// Full signaling endpoint for `host`.
    pub fn endpoint(&self, host: &str) -> String {
        format!(
            "{}{}",
            host.trim_end_matches('/'),
            self.signaling_namespace
        )
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// Running counters for one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    /// Messages published locally.
    pub published: u64,
    /// Frames accepted into the receive pipeline.
    pub received: u64,
    /// Novel messages handed to the local dispatcher.
    pub delivered: u64,
    /// Frames dropped as already seen.
    pub duplicates: u64,
    /// Frames dropped as undecodable.
    pub malformed: u64,
    /// Frames dropped because their connection was unknown, stale, or not
    /// yet accepting data.
    pub ignored: u64,
    /// Frames handed to transports (publish and relay).
    pub frames_sent: u64,
    /// Of `frames_sent`, those sent while relaying.
    pub relayed_frames: u64,
    /// Fan-out targets skipped because they were not ready or not writable.
    pub skipped_not_ready: u64,
    /// Sends rejected by a transport.
    pub send_failures: u64,
}

impl MeshStats {
    fn absorb(&mut self, report: &FloodReport, relay: bool) {
        self.frames_sent += report.sent as u64;
        if relay {
            self.relayed_frames += report.sent as u64;
        }
        self.skipped_not_ready += report.skipped_not_ready as u64;
        self.send_failures += report.failed as u64;
    }
}

/// Snapshot of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: Option<Role>,
    pub phase: PhaseKind,
    /// Ready and currently writable.
    pub sendable: bool,
}

/// What the receive pipeline did with one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Novel message: relayed to `relayed` neighbours, then handed to
    /// `subscribers` local callbacks.
    Delivered {
        message: MessageId,
        subscribers: usize,
        relayed: usize,
    },
    /// Already seen; dropped.
    Duplicate(MessageId),
    /// Could not be decoded; dropped.
    Malformed,
    /// Arrived on an unknown, stale or not-yet-wired connection, or after
    /// shutdown; dropped.
    Ignored,
}

// ---------------------------------------------------------------------------
// Mesh Node
// ---------------------------------------------------------------------------

struct MeshState {
    registry: ConnectionRegistry,
    cache: SeenCache,
    stats: MeshStats,
    shut_down: bool,
}

/// One participant in the flood mesh.
pub struct MeshNode {
    name: String,
    config: MeshConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<MeshState>,
    dispatcher: EventDispatcher,
    events_tx: mpsc::UnboundedSender<TransportSignal>,
    /// Taken by the run loop while it is active; drained by `pump` otherwise.
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportSignal>>>,
    shutdown: watch::Sender<bool>,
}

impl MeshNode {
    /// Creates a node with the default configuration.
    pub fn new(name: impl Into<String>, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_config(name, MeshConfig::default(), factory)
    }

    /// Creates a node with an explicit configuration.
    pub fn with_config(
        name: impl Into<String>,
        config: MeshConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let name = name.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        info!(node = %name, retention_ms = config.cache_retention_ms, "creating mesh node");

        Self {
            state: Mutex::new(MeshState {
                registry: ConnectionRegistry::new(),
                cache: SeenCache::new(config.cache_retention()),
                stats: MeshStats::default(),
                shut_down: false,
            }),
            name,
            config,
            factory,
            dispatcher: EventDispatcher::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
        }
    }

    /// Local label used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    // -- Application surface ---------------------------------------------------

    /// Floods `payload` under `event` to every ready neighbour.
    ///
    /// The message is recorded as seen first, so echoes coming back over a
    /// cycle are dropped. Local subscribers are not invoked. Having no ready
    /// neighbours is not an error.
    pub fn publish(&self, event: &str, payload: Value) -> MeshResult<MessageId> {
        self.publish_envelope(Envelope::wrap(event, payload))
    }

    /// Serializes `payload` to JSON and publishes it.
    pub fn publish_serialize<T: Serialize + ?Sized>(
        &self,
        event: &str,
        payload: &T,
    ) -> MeshResult<MessageId> {
        self.publish_envelope(Envelope::wrap_serialize(event, payload)?)
    }

    fn publish_envelope(&self, envelope: Envelope) -> MeshResult<MessageId> {
        let envelope = Arc::new(envelope);
        let id = envelope.id();

        let mut state = self.state.lock();
        if state.shut_down {
            return Err(MeshError::ShutDown);
        }
        let MeshState {
            registry,
            cache,
            stats,
            ..
        } = &mut *state;

        cache.record_local(Arc::clone(&envelope));
        let report = flood::broadcast(registry, &envelope, None)?;
        stats.published += 1;
        stats.absorb(&report, false);

        debug!(
            node = %self.name,
            message = %id,
            event = envelope.event(),
            sent = report.sent,
            skipped = report.skipped_not_ready,
            "published message"
        );
        Ok(id)
    }

    /// Registers `callback` for messages named `event` arriving from the mesh.
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(event, callback);
    }

    /// Registers a callback receiving payloads deserialized as `T`.
    pub fn subscribe_as<T, F>(&self, event: impl Into<String>, callback: F)
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_as(event, callback);
    }

    // -- Receive pipeline ------------------------------------------------------

    /// Runs raw bytes received on `connection` through the pipeline:
    /// decode, dedup, relay to every other ready neighbour, then dispatch
    /// locally.
    pub fn receive(&self, connection: &ConnectionId, bytes: &[u8]) -> Delivery {
        self.ingest(connection, None, bytes)
    }

    fn ingest(&self, connection: &ConnectionId, epoch: Option<u64>, bytes: &[u8]) -> Delivery {
        let (envelope, relayed) = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Delivery::Ignored;
            }
            let MeshState {
                registry,
                cache,
                stats,
                ..
            } = &mut *state;

            let accepted = registry.get(connection).map_or(false, |conn| {
                conn.accepts_data() && epoch.map_or(true, |e| e == conn.epoch())
            });
            if !accepted {
                stats.ignored += 1;
                debug!(node = %self.name, %connection, "dropping data on connection that is not wired");
                return Delivery::Ignored;
            }
            stats.received += 1;

            let envelope = match Envelope::decode(bytes) {
                Ok(envelope) => Arc::new(envelope),
                Err(e) => {
                    stats.malformed += 1;
                    warn!(node = %self.name, %connection, len = bytes.len(), error = %e, "dropping malformed frame");
                    return Delivery::Malformed;
                }
            };

            let origin = Origin::Connection(connection.clone());
            if !cache.record_if_new(Arc::clone(&envelope), origin) {
                stats.duplicates += 1;
                trace!(node = %self.name, %connection, message = %envelope.id(), "dropping duplicate");
                return Delivery::Duplicate(envelope.id());
            }

            let report = match flood::broadcast(registry, &envelope, Some(connection)) {
                Ok(report) => report,
                Err(e) => {
                    warn!(node = %self.name, message = %envelope.id(), error = %e, "relay failed");
                    FloodReport::default()
                }
            };
            stats.absorb(&report, true);
            stats.delivered += 1;

            debug!(
                node = %self.name,
                %connection,
                message = %envelope.id(),
                event = envelope.event(),
                relayed = report.sent,
                "relayed message"
            );
            (envelope, report.sent)
        };

        let subscribers = self.dispatcher.dispatch(envelope.event(), envelope.payload());
        Delivery::Delivered {
            message: envelope.id(),
            subscribers,
            relayed,
        }
    }

    // -- Signaling -------------------------------------------------------------

    /// Applies one signaling event to the registry.
    pub fn handle_signaling(&self, event: SignalingEvent) {
        let mut state = self.state.lock();
        if state.shut_down {
            debug!(node = %self.name, event = event.name(), "ignoring signaling after shutdown");
            return;
        }
        let registry = &mut state.registry;

        let result = match event {
            SignalingEvent::InitConnection { connection, reply } => {
                self.init_connection(registry, &connection, reply)
            }
            SignalingEvent::AnswerConnection {
                connection,
                offer,
                reply,
            } => self.answer_connection(registry, &connection, offer, reply),
            SignalingEvent::FinishConnection {
                connection,
                answer,
                reply,
            } => self.finish_connection(registry, &connection, answer, reply),
            SignalingEvent::DisconnectFrom { connection } => {
                self.close_connection(registry, &connection);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(node = %self.name, error = %e, "signaling event rejected");
        }
    }

    fn transport_events(&self, connection: &ConnectionId, epoch: u64) -> TransportEvents {
        TransportEvents::new(connection.clone(), epoch, self.events_tx.clone())
    }

    fn refuse_start(conn: &Connection, event: &'static str) -> MeshError {
        MeshError::InvalidPhase {
            connection: conn.id().to_string(),
            phase: conn.kind().name(),
            event,
        }
    }

    fn init_connection(
        &self,
        registry: &mut ConnectionRegistry,
        connection: &ConnectionId,
        reply: DescriptionReply,
    ) -> MeshResult<()> {
        let epoch = registry.next_epoch();
        let conn = registry.get_or_create(connection);
        if !conn.can_start() {
            return Err(Self::refuse_start(conn, "init-connection"));
        }

        let transport = self
            .factory
            .create_initiator(self.transport_events(connection, epoch))?;
        conn.start_initiator(transport, epoch, reply)?;

        debug!(node = %self.name, %connection, epoch, "initiating connection");
        Ok(())
    }

    fn answer_connection(
        &self,
        registry: &mut ConnectionRegistry,
        connection: &ConnectionId,
        offer: SessionDescription,
        reply: DescriptionReply,
    ) -> MeshResult<()> {
        let epoch = registry.next_epoch();
        let conn = registry.get_or_create(connection);
        if !conn.can_start() {
            return Err(Self::refuse_start(conn, "answer-connection"));
        }

        let transport = self
            .factory
            .create_responder(self.transport_events(connection, epoch))?;
        conn.start_responder(transport, epoch, offer, reply)?;

        debug!(node = %self.name, %connection, epoch, "answering connection");
        Ok(())
    }

    fn finish_connection(
        &self,
        registry: &mut ConnectionRegistry,
        connection: &ConnectionId,
        answer: SessionDescription,
        reply: CompletionReply,
    ) -> MeshResult<()> {
        let Some(conn) = registry.get_mut(connection) else {
            resolve(Some(reply), false, connection);
            return Err(MeshError::UnknownConnection(connection.to_string()));
        };

        let phase = conn.finish(answer, reply)?;
        debug!(node = %self.name, %connection, %phase, "applied remote answer");
        if phase == PhaseKind::Ready {
            info!(node = %self.name, %connection, role = "initiator", "connection ready");
        }
        Ok(())
    }

    fn close_connection(&self, registry: &mut ConnectionRegistry, connection: &ConnectionId) -> bool {
        match registry.remove(connection) {
            Some(mut conn) => {
                conn.close();
                info!(node = %self.name, %connection, "connection closed");
                true
            }
            None => {
                debug!(node = %self.name, %connection, "disconnect for unknown connection ignored");
                false
            }
        }
    }

    /// Tears down the link to `connection`. Returns `false` if there was none.
    pub fn disconnect(&self, connection: &ConnectionId) -> bool {
        let mut state = self.state.lock();
        self.close_connection(&mut state.registry, connection)
    }

    // -- Transport signals -----------------------------------------------------

    /// Applies one transport signal. Signals from a transport that is no
    /// longer attached (closed, or replaced by a newer epoch) are discarded.
    pub fn handle_transport(&self, signal: TransportSignal) {
        let TransportSignal {
            connection,
            epoch,
            event,
        } = signal;

        match event {
            TransportEvent::Data(bytes) => {
                self.ingest(&connection, Some(epoch), &bytes);
            }
            TransportEvent::LocalDescription(description) => {
                self.with_current(&connection, epoch, |conn| {
                    match conn.on_local_description(description) {
                        Ok(phase) => {
                            debug!(node = %self.name, %connection, %phase, "local description forwarded");
                            if phase == PhaseKind::Ready {
                                info!(node = %self.name, %connection, role = ?conn.role(), "connection ready");
                            }
                        }
                        Err(e) => warn!(node = %self.name, error = %e, "unexpected local description"),
                    }
                });
            }
            TransportEvent::Writable => {
                self.with_current(&connection, epoch, |conn| {
                    if conn.on_writable() {
                        info!(node = %self.name, %connection, role = ?conn.role(), "connection ready");
                    } else {
                        trace!(node = %self.name, %connection, phase = %conn.kind(), "writable noted");
                    }
                });
            }
            TransportEvent::Failed(reason) => {
                self.with_current(&connection, epoch, |conn| {
                    warn!(node = %self.name, %connection, phase = %conn.kind(), %reason, "transport failed");
                    conn.fail(reason);
                });
            }
        }
    }

    fn with_current<R>(
        &self,
        connection: &ConnectionId,
        epoch: u64,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        if state.shut_down {
            return None;
        }
        match state
            .registry
            .get_mut(connection)
            .filter(|conn| conn.epoch() == epoch)
        {
            Some(conn) => Some(f(conn)),
            None => {
                trace!(node = %self.name, %connection, epoch, "discarding stale transport signal");
                None
            }
        }
    }

    /// Handles every transport signal queued so far. Returns how many were
    /// handled. While the run loop is active it owns the queue and this
    /// returns zero.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        loop {
            let signal = match self.events_rx.lock().as_mut() {
                Some(rx) => rx.try_recv().ok(),
                None => None,
            };
            match signal {
                Some(signal) => {
                    self.handle_transport(signal);
                    handled += 1;
                }
                None => return handled,
            }
        }
    }

    // -- Lifecycle -------------------------------------------------------------

    /// Subscribes to `host` + namespace on `client` and spawns the run loop.
    pub async fn connect(
        self: &Arc<Self>,
        client: &dyn SignalingClient,
        host: &str,
    ) -> MeshResult<JoinHandle<()>> {
        let endpoint = self.config.endpoint(host);
        let stream = client.subscribe(&endpoint).await?;
        info!(node = %self.name, %endpoint, "subscribed to signaling");

        let node = Arc::clone(self);
        Ok(tokio::spawn(async move {
            if let Err(e) = node.run(stream).await {
                warn!(node = %node.name, error = %e, "run loop exited with error");
            }
        }))
    }

    /// Services signaling events and transport signals until shutdown.
    ///
    /// If the signaling stream ends, existing links keep working; only new
    /// links can no longer be set up.
    pub async fn run(&self, mut signaling: SignalingStream) -> MeshResult<()> {
        let mut transport_rx = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| MeshError::Signaling("run loop already active".into()))?;
        let mut shutdown = self.shutdown.subscribe();
        let mut signaling_open = true;

        debug!(node = %self.name, "run loop started");

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(signal) = transport_rx.recv() => self.handle_transport(signal),
                event = signaling.recv(), if signaling_open => match event {
                    Some(event) => self.handle_signaling(event),
                    None => {
                        warn!(node = %self.name, "signaling stream closed; no new links can be set up");
                        signaling_open = false;
                    }
                },
            }
        }

        *self.events_rx.lock() = Some(transport_rx);
        debug!(node = %self.name, "run loop stopped");
        Ok(())
    }

    /// Closes every connection, clears the cache and stops the run loop.
    /// Publishing afterwards fails with [`MeshError::ShutDown`].
    pub fn shutdown(&self) {
        let closed = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.cache.clear();
            let mut connections = state.registry.drain();
            for conn in &mut connections {
                conn.close();
            }
            connections.len()
        };

        self.shutdown.send_replace(true);
        info!(node = %self.name, closed, "mesh node shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    // -- Introspection ---------------------------------------------------------

    /// Snapshot of every connection, sorted by id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.state.lock();
        let mut infos: Vec<_> = state
            .registry
            .iter()
            .map(|conn| ConnectionInfo {
                id: conn.id().clone(),
                role: conn.role(),
                phase: conn.kind(),
                sendable: conn.is_sendable(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Ids of every ready connection, sorted.
    pub fn ready_connections(&self) -> Vec<ConnectionId> {
        self.state.lock().registry.ready_ids()
    }

    /// Phase of `connection`, or `None` if there is no such connection.
    pub fn connection_phase(&self, connection: &ConnectionId) -> Option<PhaseKind> {
        self.state.lock().registry.get(connection).map(Connection::kind)
    }

    /// Whether the handshake with `connection` has completed.
    pub fn is_ready(&self, connection: &ConnectionId) -> bool {
        self.state
            .lock()
            .registry
            .get(connection)
            .map_or(false, Connection::is_ready)
    }

    pub fn stats(&self) -> MeshStats {
        self.state.lock().stats
    }

    /// Number of message ids currently remembered.
    pub fn seen_count(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn has_seen(&self, message: &MessageId) -> bool {
        self.state.lock().cache.contains(message)
    }

    /// Where `message` first came from, while it is still remembered.
    pub fn origin_of(&self, message: &MessageId) -> Option<Origin> {
        self.state.lock().cache.origin_of(message).cloned()
    }

    /// Evicts expired cache entries now. Returns how many were evicted.
    pub fn sweep_cache(&self) -> usize {
        self.state
            .lock()
            .cache
            .sweep_expired(std::time::Instant::now())
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
