//! End-to-end integration tests for the mesh.
//!
//! Each test builds a small mesh in-process: every node runs its own run
//! loop, links are set up through the loopback signaling hub, and frames
//! travel over the loopback fabric. Assertions are made on what subscribers
//! observe and on per-node counters.
//!
//! Each test stands alone with its own hub and fabric.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use p2pmesh_protocol::mesh::{
    ConnectionId, Delivery, LoopbackFabric, LoopbackHub, MeshError, MeshNode, Origin, PhaseKind,
    SignalingClient,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const HOST: &str = "loopback://hub";

type Inbox = Arc<Mutex<Vec<Value>>>;

struct TestMesh {
    hub: LoopbackHub,
    fabric: Arc<LoopbackFabric>,
    nodes: HashMap<String, Arc<MeshNode>>,
    runners: Vec<JoinHandle<()>>,
}

impl TestMesh {
    async fn new(names: &[&str]) -> Self {
        Self::with_hub(LoopbackHub::new(), names).await
    }

    async fn with_hub(hub: LoopbackHub, names: &[&str]) -> Self {
        let mut mesh = Self {
            hub,
            fabric: Arc::new(LoopbackFabric::new()),
            nodes: HashMap::new(),
            runners: Vec::new(),
        };
        for name in names {
            mesh.join(name).await;
        }
        mesh
    }

    async fn join(&mut self, name: &str) {
        let node = Arc::new(MeshNode::new(name, self.fabric.clone()));
        let runner = node
            .connect(&self.hub.client(name), HOST)
            .await
            .expect("connect to hub");
        self.nodes.insert(name.to_string(), node);
        self.runners.push(runner);
    }

    fn node(&self, name: &str) -> &Arc<MeshNode> {
        &self.nodes[name]
    }

    async fn link(&self, a: &str, b: &str) {
        self.hub.link(a, b).await.expect("link");
        // The responder turns ready when its own run loop sees `Writable`.
        let node = Arc::clone(self.node(b));
        let peer = ConnectionId::from(a);
        assert!(eventually(|| node.is_ready(&peer)).await, "{b} never saw {a} ready");
    }

    fn inbox(&self, name: &str, event: &str) -> Inbox {
        let inbox: Inbox = Arc::default();
        let sink = Arc::clone(&inbox);
        self.node(name)
            .subscribe(event, move |payload| sink.lock().push(payload.clone()));
        inbox
    }

    async fn shutdown(self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
        for runner in self.runners {
            runner.await.expect("run loop panicked");
        }
    }
}

/// Polls `condition` until it holds or two seconds pass.
async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Gives in-flight frames time to land.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn len(inbox: &Inbox) -> usize {
    inbox.lock().len()
}

// ---------------------------------------------------------------------------
// Handshake & Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_makes_both_sides_ready() {
    let mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;

    let a_side = mesh.node("a").connections();
    let b_side = mesh.node("b").connections();
    assert_eq!(a_side.len(), 1);
    assert_eq!(a_side[0].id, ConnectionId::from("b"));
    assert_eq!(a_side[0].phase, PhaseKind::Ready);
    assert!(a_side[0].sendable);
    assert_eq!(b_side[0].id, ConnectionId::from("a"));
    assert!(b_side[0].sendable);

    mesh.shutdown().await;
}

#[tokio::test]
async fn connect_subscribes_under_the_mesh_namespace() {
    let mesh = TestMesh::new(&["a"]).await;
    assert_eq!(
        mesh.hub.endpoint_of("a").as_deref(),
        Some("loopback://hub/mesh")
    );
    mesh.shutdown().await;
}

#[tokio::test]
async fn disconnect_tears_down_both_ends() {
    let mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;
    let inbox = mesh.inbox("b", "ping");

    mesh.hub.disconnect("a", "b").unwrap();
    let (a, b) = (Arc::clone(mesh.node("a")), Arc::clone(mesh.node("b")));
    assert!(eventually(|| a.connections().is_empty() && b.connections().is_empty()).await);

    a.publish("ping", json!(1)).unwrap();
    settle().await;
    assert_eq!(len(&inbox), 0);
    assert_eq!(a.stats().frames_sent, 0);

    mesh.shutdown().await;
}

#[tokio::test]
async fn links_can_be_rebuilt_after_disconnect() {
    let mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;
    mesh.hub.disconnect("a", "b").unwrap();
    let (a, b) = (Arc::clone(mesh.node("a")), Arc::clone(mesh.node("b")));
    assert!(eventually(|| a.connections().is_empty() && b.connections().is_empty()).await);

    mesh.link("b", "a").await;
    let inbox = mesh.inbox("b", "ping");
    a.publish("ping", json!("again")).unwrap();

    assert!(eventually(|| len(&inbox) == 1).await);
    mesh.shutdown().await;
}

#[tokio::test]
async fn link_to_absent_member_can_be_retried_once_it_joins() {
    let mut mesh = TestMesh::new(&["a"]).await;

    assert!(matches!(
        mesh.hub.link("a", "late").await,
        Err(MeshError::Signaling(_))
    ));
    assert!(mesh.node("a").connections().is_empty());

    mesh.join("late").await;
    mesh.link("a", "late").await;
    assert!(mesh.node("a").is_ready(&ConnectionId::from("late")));

    mesh.shutdown().await;
}

#[tokio::test]
async fn timed_out_link_is_cleaned_up_and_can_be_retried() {
    let hub = LoopbackHub::with_timeout(Duration::from_millis(100));
    let mut mesh = TestMesh::with_hub(hub, &["a"]).await;

    // "b" is subscribed but nobody answers for it.
    let silent = mesh.hub.client("b").subscribe(HOST).await.unwrap();
    assert!(matches!(
        mesh.hub.link("a", "b").await,
        Err(MeshError::HandshakeTimeout { .. })
    ));

    let a = Arc::clone(mesh.node("a"));
    assert!(eventually(|| a.connections().is_empty()).await);
    assert_eq!(mesh.fabric.pending_handshakes(), 0);
    drop(silent);

    mesh.join("b").await;
    mesh.link("a", "b").await;
    let inbox = mesh.inbox("b", "ping");
    a.publish("ping", json!("retried")).unwrap();
    assert!(eventually(|| len(&inbox) == 1).await);

    mesh.shutdown().await;
}

#[tokio::test]
async fn shut_down_neighbour_is_skipped() {
    let mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;
    let inbox = mesh.inbox("b", "ping");

    mesh.node("b").shutdown();
    let a = mesh.node("a");
    assert!(!a.connections()[0].sendable);

    a.publish("ping", json!(1)).unwrap();
    settle().await;
    assert_eq!(len(&inbox), 0);
    assert_eq!(a.stats().skipped_not_ready, 1);
    assert!(mesh.node("b").publish("ping", json!(2)).is_err());

    mesh.shutdown().await;
}

// ---------------------------------------------------------------------------
// Flooding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ring_of_three_delivers_exactly_once_each() {
    let mesh = TestMesh::new(&["a", "b", "c"]).await;
    mesh.link("a", "b").await;
    mesh.link("b", "c").await;
    mesh.link("c", "a").await;

    let at_a = mesh.inbox("a", "ping");
    let at_b = mesh.inbox("b", "ping");
    let at_c = mesh.inbox("c", "ping");

    let message = mesh.node("a").publish("ping", json!({ "n": 1 })).unwrap();

    assert!(eventually(|| len(&at_b) == 1 && len(&at_c) == 1).await);
    settle().await;

    assert_eq!(*at_b.lock(), vec![json!({ "n": 1 })]);
    assert_eq!(*at_c.lock(), vec![json!({ "n": 1 })]);
    assert_eq!(len(&at_a), 0, "publisher must not hear its own message");

    // a -> b, a -> c, then b and c each relay once to the other.
    assert_eq!(mesh.fabric.frames_delivered(), 4);
    let duplicates: u64 = ["a", "b", "c"]
        .iter()
        .map(|name| mesh.node(name).stats().duplicates)
        .sum();
    assert_eq!(duplicates, 2);

    assert_eq!(mesh.node("a").origin_of(&message), Some(Origin::Local));
    assert_eq!(
        mesh.node("b").origin_of(&message),
        Some(Origin::Connection(ConnectionId::from("a")))
    );

    mesh.shutdown().await;
}

#[tokio::test]
async fn line_topology_reaches_the_far_end() {
    let names = ["a", "b", "c", "d", "e"];
    let mesh = TestMesh::new(&names).await;
    for pair in names.windows(2) {
        mesh.link(pair[0], pair[1]).await;
    }
    let far = mesh.inbox("e", "chat");

    mesh.node("a").publish("chat", json!("hello")).unwrap();

    assert!(eventually(|| len(&far) == 1).await);
    settle().await;
    assert_eq!(*far.lock(), vec![json!("hello")]);
    // A line has no cycles: one frame per edge.
    assert_eq!(mesh.fabric.frames_delivered(), 4);

    mesh.shutdown().await;
}

#[tokio::test]
async fn full_mesh_delivers_exactly_once_everywhere() {
    let names = ["n0", "n1", "n2", "n3", "n4"];
    let mesh = TestMesh::new(&names).await;
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            mesh.link(a, b).await;
        }
    }
    let inboxes: Vec<_> = names[1..]
        .iter()
        .map(|name| mesh.inbox(name, "tick"))
        .collect();

    for n in 0..3 {
        mesh.node("n0").publish("tick", json!(n)).unwrap();
    }

    assert!(eventually(|| inboxes.iter().all(|inbox| len(inbox) == 3)).await);
    settle().await;
    for inbox in &inboxes {
        assert_eq!(len(inbox), 3);
    }

    mesh.shutdown().await;
}

#[tokio::test]
async fn events_only_reach_matching_subscribers() {
    let mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;
    let chat = mesh.inbox("b", "chat");
    let ping = mesh.inbox("b", "ping");

    mesh.node("a").publish("chat", json!("hi")).unwrap();
    assert!(eventually(|| len(&chat) == 1).await);
    settle().await;
    assert_eq!(len(&ping), 0);

    mesh.shutdown().await;
}

#[tokio::test]
async fn typed_payloads_survive_the_flood() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
    }

    let mesh = TestMesh::new(&["a", "b", "c"]).await;
    mesh.link("a", "b").await;
    mesh.link("b", "c").await;

    let seen: Arc<Mutex<Vec<Position>>> = Arc::default();
    let sink = Arc::clone(&seen);
    mesh.node("c")
        .subscribe_as("move", move |pos: Position| sink.lock().push(pos));

    mesh.node("a")
        .publish_serialize("move", &Position { x: 3, y: -4 })
        .unwrap();

    assert!(eventually(|| seen.lock().len() == 1).await);
    assert_eq!(seen.lock()[0], Position { x: 3, y: -4 });

    mesh.shutdown().await;
}

#[tokio::test]
async fn late_joiner_only_sees_messages_after_linking() {
    let mut mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;
    let at_b = mesh.inbox("b", "news");

    mesh.node("a").publish("news", json!("before")).unwrap();
    assert!(eventually(|| len(&at_b) == 1).await);

    mesh.join("c").await;
    mesh.link("b", "c").await;
    let at_c = mesh.inbox("c", "news");

    mesh.node("a").publish("news", json!("after")).unwrap();
    assert!(eventually(|| len(&at_c) == 1 && len(&at_b) == 2).await);
    settle().await;
    assert_eq!(*at_c.lock(), vec![json!("after")]);

    mesh.shutdown().await;
}

#[tokio::test]
async fn subscriber_may_reply_from_inside_its_callback() {
    let mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;

    let b = Arc::downgrade(mesh.node("b"));
    mesh.node("b").subscribe("ping", move |payload| {
        if let Some(b) = b.upgrade() {
            b.publish("pong", payload.clone()).unwrap();
        }
    });
    let pongs = mesh.inbox("a", "pong");

    mesh.node("a").publish("ping", json!(7)).unwrap();
    assert!(eventually(|| len(&pongs) == 1).await);
    assert_eq!(*pongs.lock(), vec![json!(7)]);

    mesh.shutdown().await;
}

// ---------------------------------------------------------------------------
// Receive Pipeline Robustness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_frames_do_not_disturb_the_link() {
    let mesh = TestMesh::new(&["a", "b"]).await;
    mesh.link("a", "b").await;
    let inbox = mesh.inbox("b", "ping");
    let b = mesh.node("b");
    let from_a = ConnectionId::from("a");

    assert_eq!(b.receive(&from_a, b"not json"), Delivery::Malformed);
    assert_eq!(b.receive(&from_a, br#"{"e":"ping","d":1}"#), Delivery::Malformed);
    assert_eq!(b.stats().malformed, 2);

    mesh.node("a").publish("ping", json!(1)).unwrap();
    assert!(eventually(|| len(&inbox) == 1).await);
    assert!(b.is_ready(&from_a));

    mesh.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_arrivals_of_one_message_deliver_once() {
    let peers: Vec<String> = (0..8).map(|i| format!("p{i}")).collect();
    let mut names = vec!["hub-node"];
    names.extend(peers.iter().map(String::as_str));
    let mesh = TestMesh::new(&names).await;
    for peer in &peers {
        mesh.link(peer, "hub-node").await;
    }

    let inbox = mesh.inbox("hub-node", "burst");
    let frame = {
        let envelope = p2pmesh_protocol::mesh::Envelope::wrap("burst", json!("x"));
        envelope.encode().unwrap()
    };

    let node = Arc::clone(mesh.node("hub-node"));
    let outcomes: Vec<Delivery> = std::thread::scope(|scope| {
        let handles: Vec<_> = peers
            .iter()
            .map(|peer| {
                let node = Arc::clone(&node);
                let frame = frame.clone();
                scope.spawn(move || node.receive(&ConnectionId::from(peer.as_str()), &frame))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let delivered = outcomes
        .iter()
        .filter(|o| matches!(o, Delivery::Delivered { .. }))
        .count();
    assert_eq!(delivered, 1);
    assert_eq!(len(&inbox), 1);
    assert_eq!(node.stats().duplicates, 7);

    mesh.shutdown().await;
}
