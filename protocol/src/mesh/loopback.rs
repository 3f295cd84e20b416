//! # Loopback Fabric
//!
//! In-process implementations of both external collaborators, so a whole
//! mesh can run inside one process (integration tests, the node simulator):
//!
//! - [`LoopbackFabric`] is a [`TransportFactory`] whose transports are
//!   paired through offer/answer tokens and deliver frames straight into the
//!   remote node's transport queue.
//! - [`LoopbackHub`] is a signaling relay. Each node subscribes through its
//!   own [`LoopbackSignaling`] client; [`LoopbackHub::link`] then plays the
//!   server's part of the three-step handshake between two members.
//!
//! ```text
//! hub ── InitConnection(B) ──────────> A   A ── offer ──> hub
//! hub ── AnswerConnection(A, offer) ─> B   B ── answer ─> hub
//! hub ── FinishConnection(B, answer) > A   A ── true ───> hub
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config;

use super::connection::ConnectionId;
use super::error::{MeshError, MeshResult, TransportError};
use super::signaling::{SignalingClient, SignalingEvent, SignalingStream};
use super::transport::{
    PeerTransport, Role, SessionDescription, TransportEvents, TransportFactory,
};

const OFFER_PREFIX: &str = "loopback-offer:";
const ANSWER_PREFIX: &str = "loopback-answer:";

// ---------------------------------------------------------------------------
// Fabric
// ---------------------------------------------------------------------------

struct Endpoint {
    events: TransportEvents,
    open: AtomicBool,
    writable: AtomicBool,
    peer: Mutex<Option<Arc<Endpoint>>>,
}

impl Endpoint {
    fn new(events: TransportEvents) -> Arc<Self> {
        Arc::new(Self {
            events,
            open: AtomicBool::new(true),
            writable: AtomicBool::new(false),
            peer: Mutex::new(None),
        })
    }
}

#[derive(Default)]
struct FabricState {
    /// Offers waiting for a responder, keyed by token.
    offers: Mutex<HashMap<Uuid, Arc<Endpoint>>>,
    /// Answered offers waiting for the initiator: (initiator, responder).
    answers: Mutex<HashMap<Uuid, (Arc<Endpoint>, Arc<Endpoint>)>>,
    frames: AtomicU64,
    links: AtomicU64,
}

/// Transport factory pairing in-process transports.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    inner: Arc<FabricState>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames delivered across the fabric so far.
    pub fn frames_delivered(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }

    /// Links that completed pairing so far.
    pub fn links_opened(&self) -> u64 {
        self.inner.links.load(Ordering::Relaxed)
    }

    /// Offers or answers still waiting for their counterpart.
    pub fn pending_handshakes(&self) -> usize {
        self.inner.offers.lock().len() + self.inner.answers.lock().len()
    }
}

fn parse_token(description: &SessionDescription, prefix: &str) -> Result<Uuid, TransportError> {
    let text = std::str::from_utf8(description.as_bytes())
        .map_err(|_| TransportError::InvalidDescription("not utf-8".into()))?;
    let token = text
        .strip_prefix(prefix)
        .ok_or_else(|| TransportError::InvalidDescription(format!("expected {prefix} token")))?;
    Uuid::parse_str(token).map_err(|e| TransportError::InvalidDescription(e.to_string()))
}

impl TransportFactory for LoopbackFabric {
    fn create(
        &self,
        role: Role,
        events: TransportEvents,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let endpoint = Endpoint::new(events);
        let mut token = None;

        if role == Role::Initiator {
            let offer = Uuid::new_v4();
            self.inner.offers.lock().insert(offer, Arc::clone(&endpoint));
            endpoint
                .events
                .local_description(SessionDescription::new(format!("{OFFER_PREFIX}{offer}")));
            token = Some(offer);
        }

        trace!(connection = %endpoint.events.connection(), ?role, "loopback transport created");
        Ok(Box::new(LoopbackTransport {
            fabric: self.clone(),
            endpoint,
            role,
            token,
        }))
    }
}

/// One end of an in-process link.
pub struct LoopbackTransport {
    fabric: LoopbackFabric,
    endpoint: Arc<Endpoint>,
    role: Role,
    token: Option<Uuid>,
}

impl LoopbackTransport {
    fn accept_offer(&mut self, description: &SessionDescription) -> Result<(), TransportError> {
        let token = parse_token(description, OFFER_PREFIX)?;
        let initiator = self
            .fabric
            .inner
            .offers
            .lock()
            .remove(&token)
            .ok_or_else(|| TransportError::InvalidDescription("unknown or stale offer".into()))?;
        if !initiator.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        *self.endpoint.peer.lock() = Some(Arc::clone(&initiator));
        self.fabric
            .inner
            .answers
            .lock()
            .insert(token, (initiator, Arc::clone(&self.endpoint)));
        self.token = Some(token);

        self.endpoint
            .events
            .local_description(SessionDescription::new(format!("{ANSWER_PREFIX}{token}")));
        Ok(())
    }

    fn accept_answer(&mut self, description: &SessionDescription) -> Result<(), TransportError> {
        let token = parse_token(description, ANSWER_PREFIX)?;
        let (initiator, responder) = self
            .fabric
            .inner
            .answers
            .lock()
            .remove(&token)
            .ok_or_else(|| TransportError::InvalidDescription("unknown or stale answer".into()))?;
        if !Arc::ptr_eq(&initiator, &self.endpoint) {
            return Err(TransportError::InvalidDescription(
                "answer belongs to another offer".into(),
            ));
        }
        if !responder.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        *self.endpoint.peer.lock() = Some(Arc::clone(&responder));
        self.endpoint.writable.store(true, Ordering::SeqCst);
        responder.writable.store(true, Ordering::SeqCst);
        self.fabric.inner.links.fetch_add(1, Ordering::Relaxed);

        responder.events.writable();
        self.endpoint.events.writable();
        Ok(())
    }
}

impl PeerTransport for LoopbackTransport {
    fn accept_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        match self.role {
            Role::Responder => self.accept_offer(&description),
            Role::Initiator => self.accept_answer(&description),
        }
    }

    fn is_writable(&self) -> bool {
        self.endpoint.writable.load(Ordering::SeqCst)
            && self
                .endpoint
                .peer
                .lock()
                .as_ref()
                .map_or(false, |peer| peer.open.load(Ordering::SeqCst))
    }

    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        if !self.endpoint.writable.load(Ordering::SeqCst) {
            return Err(TransportError::NotWritable);
        }
        let peer = self
            .endpoint
            .peer
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;
        if !peer.open.load(Ordering::SeqCst) || !peer.events.data(bytes) {
            return Err(TransportError::Closed);
        }
        self.fabric.inner.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn destroy(self: Box<Self>) {
        self.endpoint.open.store(false, Ordering::SeqCst);
        self.endpoint.writable.store(false, Ordering::SeqCst);
        if let Some(peer) = self.endpoint.peer.lock().take() {
            peer.writable.store(false, Ordering::SeqCst);
        }
        if let Some(token) = self.token {
            self.fabric.inner.offers.lock().remove(&token);
            self.fabric.inner.answers.lock().remove(&token);
        }
        trace!(connection = %self.endpoint.events.connection(), "loopback transport destroyed");
    }
}

// ---------------------------------------------------------------------------
// Signaling Hub
// ---------------------------------------------------------------------------

struct Member {
    endpoint: String,
    tx: mpsc::UnboundedSender<SignalingEvent>,
}

struct HubState {
    members: Mutex<HashMap<String, Member>>,
    timeout: Duration,
}

/// In-process signaling relay.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubState>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    /// Creates a hub with the default handshake timeout.
    pub fn new() -> Self {
        Self::with_timeout(config::DEFAULT_HANDSHAKE_TIMEOUT)
    }

    /// Creates a hub that gives up on each handshake step after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HubState {
                members: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// A signaling client that registers as `name` on subscribe.
    pub fn client(&self, name: impl Into<String>) -> LoopbackSignaling {
        LoopbackSignaling {
            hub: self.clone(),
            name: name.into(),
        }
    }

    /// Names of every subscribed member, sorted.
    pub fn members(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.members.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// The endpoint `name` subscribed with.
    pub fn endpoint_of(&self, name: &str) -> Option<String> {
        self.inner
            .members
            .lock()
            .get(name)
            .map(|member| member.endpoint.clone())
    }

    fn sender(&self, name: &str) -> MeshResult<mpsc::UnboundedSender<SignalingEvent>> {
        self.inner
            .members
            .lock()
            .get(name)
            .map(|member| member.tx.clone())
            .ok_or_else(|| MeshError::Signaling(format!("{name} is not subscribed")))
    }

    fn deliver(&self, name: &str, event: SignalingEvent) -> MeshResult<()> {
        self.sender(name)?
            .send(event)
            .map_err(|_| MeshError::Signaling(format!("{name} stopped listening")))
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>, peer: &str) -> MeshResult<T> {
        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(MeshError::HandshakeFailed(peer.to_string())),
            Err(_) => Err(MeshError::HandshakeTimeout {
                connection: peer.to_string(),
                timeout_ms: self.inner.timeout.as_millis() as u64,
            }),
        }
    }

    /// Runs the three-step handshake with `initiator` offering to
    /// `responder`. Returns once the initiator reports the link writable.
    ///
    /// Both members must be subscribed. If a step fails or times out after
    /// the offer was requested, both members are told to disconnect so the
    /// half-built link does not block a later attempt.
    pub async fn link(&self, initiator: &str, responder: &str) -> MeshResult<()> {
        if initiator == responder {
            return Err(MeshError::Signaling(format!("{initiator} cannot link to itself")));
        }
        self.sender(initiator)?;
        self.sender(responder)?;

        match self.handshake(initiator, responder).await {
            Ok(()) => {
                info!(initiator, responder, "link established");
                Ok(())
            }
            Err(e) => {
                warn!(initiator, responder, error = %e, "handshake abandoned");
                self.abandon(initiator, responder);
                Err(e)
            }
        }
    }

    async fn handshake(&self, initiator: &str, responder: &str) -> MeshResult<()> {
        let (reply, rx) = oneshot::channel();
        self.deliver(
            initiator,
            SignalingEvent::InitConnection {
                connection: ConnectionId::from(responder),
                reply,
            },
        )?;
        let offer = self.await_reply(rx, responder).await?;
        debug!(initiator, responder, "offer relayed");

        let (reply, rx) = oneshot::channel();
        self.deliver(
            responder,
            SignalingEvent::AnswerConnection {
                connection: ConnectionId::from(initiator),
                offer,
                reply,
            },
        )?;
        let answer = self.await_reply(rx, responder).await?;
        debug!(initiator, responder, "answer relayed");

        let (reply, rx) = oneshot::channel();
        self.deliver(
            initiator,
            SignalingEvent::FinishConnection {
                connection: ConnectionId::from(responder),
                answer,
                reply,
            },
        )?;
        if !self.await_reply(rx, responder).await? {
            return Err(MeshError::HandshakeFailed(responder.to_string()));
        }
        Ok(())
    }

    /// Best-effort teardown of a half-built link. A member that is gone has
    /// nothing to clean up.
    fn abandon(&self, initiator: &str, responder: &str) {
        for (member, peer) in [(initiator, responder), (responder, initiator)] {
            let event = SignalingEvent::DisconnectFrom {
                connection: ConnectionId::from(peer),
            };
            if let Err(e) = self.deliver(member, event) {
                debug!(member, error = %e, "could not deliver disconnect");
            }
        }
    }

    /// Tells both members to drop their link to each other.
    pub fn disconnect(&self, a: &str, b: &str) -> MeshResult<()> {
        self.deliver(
            a,
            SignalingEvent::DisconnectFrom {
                connection: ConnectionId::from(b),
            },
        )?;
        self.deliver(
            b,
            SignalingEvent::DisconnectFrom {
                connection: ConnectionId::from(a),
            },
        )?;
        info!(a, b, "link torn down");
        Ok(())
    }

    /// Drops `name` from the hub; its signaling stream ends.
    pub fn leave(&self, name: &str) -> bool {
        self.inner.members.lock().remove(name).is_some()
    }
}

/// A member's connection to a [`LoopbackHub`].
#[derive(Clone)]
pub struct LoopbackSignaling {
    hub: LoopbackHub,
    name: String,
}

#[async_trait]
impl SignalingClient for LoopbackSignaling {
    async fn subscribe(&self, endpoint: &str) -> MeshResult<SignalingStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.hub.inner.members.lock().insert(
            self.name.clone(),
            Member {
                endpoint: endpoint.to_string(),
                tx,
            },
        );
        if previous.is_some() {
            debug!(member = %self.name, "replaced existing hub subscription");
        }
        debug!(member = %self.name, endpoint, "joined signaling hub");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::node::MeshNode;
    use crate::mesh::transport::{TransportEvent, TransportSignal};
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;

    fn events(name: &str) -> (TransportEvents, mpsc::UnboundedReceiver<TransportSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportEvents::new(ConnectionId::from(name), 1, tx), rx)
    }

    fn next_description(rx: &mut mpsc::UnboundedReceiver<TransportSignal>) -> SessionDescription {
        match rx.try_recv().unwrap().event {
            TransportEvent::LocalDescription(description) => description,
            other => panic!("expected local description, got {}", other.name()),
        }
    }

    #[test]
    fn transports_pair_through_offer_and_answer() {
        let fabric = LoopbackFabric::new();
        let (a_events, mut a_rx) = events("b");
        let (b_events, mut b_rx) = events("a");

        let mut a = fabric.create_initiator(a_events).unwrap();
        let offer = next_description(&mut a_rx);

        let mut b = fabric.create_responder(b_events).unwrap();
        b.accept_remote_description(offer).unwrap();
        let answer = next_description(&mut b_rx);
        assert!(!a.is_writable());

        a.accept_remote_description(answer).unwrap();
        assert!(a.is_writable());
        assert!(b.is_writable());
        assert_eq!(fabric.pending_handshakes(), 0);
        assert_eq!(fabric.links_opened(), 1);

        a.send(Bytes::from_static(b"hello")).unwrap();
        // b saw writable, then data.
        assert!(matches!(b_rx.try_recv().unwrap().event, TransportEvent::Writable));
        match b_rx.try_recv().unwrap().event {
            TransportEvent::Data(bytes) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("expected data, got {}", other.name()),
        }
        assert_eq!(fabric.frames_delivered(), 1);
    }

    #[test]
    fn unknown_offer_is_rejected() {
        let fabric = LoopbackFabric::new();
        let (events, _rx) = events("a");
        let mut responder = fabric.create_responder(events).unwrap();

        let bogus = SessionDescription::new(format!("{OFFER_PREFIX}{}", Uuid::new_v4()));
        assert!(matches!(
            responder.accept_remote_description(bogus),
            Err(TransportError::InvalidDescription(_))
        ));
        assert!(responder
            .accept_remote_description(SessionDescription::new(&b"v=0"[..]))
            .is_err());
    }

    #[test]
    fn destroying_one_end_silences_the_other() {
        let fabric = LoopbackFabric::new();
        let (a_events, mut a_rx) = events("b");
        let (b_events, mut b_rx) = events("a");
        let mut a = fabric.create_initiator(a_events).unwrap();
        let mut b = fabric.create_responder(b_events).unwrap();
        b.accept_remote_description(next_description(&mut a_rx)).unwrap();
        a.accept_remote_description(next_description(&mut b_rx)).unwrap();

        a.destroy();
        assert!(!b.is_writable());
        assert!(b.send(Bytes::from_static(b"late")).is_err());
    }

    #[test]
    fn destroyed_initiator_withdraws_its_offer() {
        let fabric = LoopbackFabric::new();
        let (events, _rx) = events("b");
        let initiator = fabric.create_initiator(events).unwrap();
        assert_eq!(fabric.pending_handshakes(), 1);

        initiator.destroy();
        assert_eq!(fabric.pending_handshakes(), 0);
    }

    #[test]
    fn two_nodes_link_by_hand_and_exchange_a_message() {
        let fabric = Arc::new(LoopbackFabric::new());
        let a = MeshNode::new("a", fabric.clone());
        let b = MeshNode::new("b", fabric.clone());

        let (tx, mut offer_rx) = oneshot::channel();
        a.handle_signaling(SignalingEvent::InitConnection {
            connection: ConnectionId::from("b"),
            reply: tx,
        });
        a.pump();
        let offer = offer_rx.try_recv().unwrap();

        let (tx, mut answer_rx) = oneshot::channel();
        b.handle_signaling(SignalingEvent::AnswerConnection {
            connection: ConnectionId::from("a"),
            offer,
            reply: tx,
        });
        b.pump();
        let answer = answer_rx.try_recv().unwrap();

        let (tx, mut done_rx) = oneshot::channel();
        a.handle_signaling(SignalingEvent::FinishConnection {
            connection: ConnectionId::from("b"),
            answer,
            reply: tx,
        });
        a.pump();
        b.pump();

        assert_eq!(done_rx.try_recv(), Ok(true));
        assert!(a.is_ready(&ConnectionId::from("b")));
        assert!(b.is_ready(&ConnectionId::from("a")));

        let got = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        b.subscribe("chat", move |payload| sink.lock().push(payload.clone()));

        a.publish("chat", json!("hi")).unwrap();
        b.pump();
        assert_eq!(*got.lock(), vec![json!("hi")]);
    }

    #[tokio::test]
    async fn hub_link_fails_for_unknown_member() {
        let hub = LoopbackHub::new();
        let mut a = hub.client("a").subscribe("loopback/mesh").await.unwrap();

        assert!(matches!(
            hub.link("a", "nobody").await,
            Err(MeshError::Signaling(_))
        ));
        assert!(hub.link("a", "a").await.is_err());
        assert_eq!(hub.members(), vec!["a".to_string()]);
        assert_eq!(hub.endpoint_of("a").as_deref(), Some("loopback/mesh"));

        // Nothing was sent to the member that is subscribed.
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn hub_link_fails_after_member_leaves() {
        let hub = LoopbackHub::new();
        let _a = hub.client("a").subscribe("loopback/mesh").await.unwrap();
        let _b = hub.client("b").subscribe("loopback/mesh").await.unwrap();

        assert!(hub.leave("b"));
        assert!(!hub.leave("b"));
        assert_eq!(hub.members(), vec!["a".to_string()]);
        assert!(matches!(
            hub.link("a", "b").await,
            Err(MeshError::Signaling(_))
        ));
    }

    #[tokio::test]
    async fn hub_link_times_out_when_member_is_silent() {
        let hub = LoopbackHub::with_timeout(Duration::from_millis(50));
        let _a = hub.client("a").subscribe("loopback/mesh").await.unwrap();
        let _b = hub.client("b").subscribe("loopback/mesh").await.unwrap();

        assert!(matches!(
            hub.link("a", "b").await,
            Err(MeshError::HandshakeTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn timed_out_link_tells_both_members_to_disconnect() {
        let hub = LoopbackHub::with_timeout(Duration::from_millis(50));
        let mut a = hub.client("a").subscribe("loopback/mesh").await.unwrap();
        let mut b = hub.client("b").subscribe("loopback/mesh").await.unwrap();

        assert!(hub.link("a", "b").await.is_err());

        // a got the unanswered offer request, then the teardown.
        assert_eq!(a.recv().await.unwrap().name(), "init-connection");
        match a.recv().await.unwrap() {
            SignalingEvent::DisconnectFrom { connection } => {
                assert_eq!(connection, ConnectionId::from("b"))
            }
            other => panic!("expected disconnect, got {}", other.name()),
        }
        match b.recv().await.unwrap() {
            SignalingEvent::DisconnectFrom { connection } => {
                assert_eq!(connection, ConnectionId::from("a"))
            }
            other => panic!("expected disconnect, got {}", other.name()),
        }
    }

    #[tokio::test]
    async fn hub_link_fails_when_reply_is_dropped() {
        let hub = LoopbackHub::new();
        let mut a = hub.client("a").subscribe("loopback/mesh").await.unwrap();
        let _b = hub.client("b").subscribe("loopback/mesh").await.unwrap();

        let refuse = tokio::spawn(async move {
            // Drop the InitConnection reply unanswered.
            let _ = a.recv().await;
        });

        assert!(matches!(
            hub.link("a", "b").await,
            Err(MeshError::HandshakeFailed(_))
        ));
        refuse.await.unwrap();
    }
}
