//! # Signaling Seam
//!
//! Before two nodes share a direct link they exchange three setup messages
//! through a side channel (typically a relay server):
//!
//! ```text
//! server -> A : InitConnection(B, reply)            A replies with its offer
//! server -> B : AnswerConnection(A, offer, reply)   B replies with its answer
//! server -> A : FinishConnection(B, answer, reply)  A replies `true` once writable
//! server -> * : DisconnectFrom(peer)
//! ```
//!
//! Replies are one-shot channels: the node resolves them whenever the
//! transport gets around to producing the requested value, which may be long
//! after the event itself was handled.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::connection::ConnectionId;
use super::error::MeshResult;
use super::transport::SessionDescription;

/// One-shot reply handed to the node with a signaling event.
pub type Reply<T> = oneshot::Sender<T>;

/// Reply carrying a local session description back to the remote node.
pub type DescriptionReply = Reply<SessionDescription>;

/// Reply confirming (or refusing) handshake completion.
pub type CompletionReply = Reply<bool>;

/// Stream of signaling events addressed to one node.
pub type SignalingStream = mpsc::UnboundedReceiver<SignalingEvent>;

/// Events the signaling collaborator delivers to a node.
#[derive(Debug)]
pub enum SignalingEvent {
    /// Start a link to `connection` as the initiator.
    InitConnection {
        /// Remote node to link with.
        connection: ConnectionId,
        /// Resolved with this node's offer.
        reply: DescriptionReply,
    },
    /// Answer an incoming link request from `connection`.
    AnswerConnection {
        /// Remote node that initiated.
        connection: ConnectionId,
        /// The initiator's offer.
        offer: SessionDescription,
        /// Resolved with this node's answer.
        reply: DescriptionReply,
    },
    /// Complete a link this node initiated.
    FinishConnection {
        /// Remote node that answered.
        connection: ConnectionId,
        /// The responder's answer.
        answer: SessionDescription,
        /// Resolved with `true` once the link is writable, `false` on failure.
        reply: CompletionReply,
    },
    /// Drop the link to `connection`.
    DisconnectFrom {
        /// Remote node to disconnect from.
        connection: ConnectionId,
    },
}

impl SignalingEvent {
    /// The remote connection this event concerns.
    pub fn connection(&self) -> &ConnectionId {
        match self {
            SignalingEvent::InitConnection { connection, .. }
            | SignalingEvent::AnswerConnection { connection, .. }
            | SignalingEvent::FinishConnection { connection, .. }
            | SignalingEvent::DisconnectFrom { connection } => connection,
        }
    }

    /// Short event name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            SignalingEvent::InitConnection { .. } => "init-connection",
            SignalingEvent::AnswerConnection { .. } => "answer-connection",
            SignalingEvent::FinishConnection { .. } => "finish-connection",
            SignalingEvent::DisconnectFrom { .. } => "disconnect-from",
        }
    }
}

/// Client side of the signaling collaborator.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Subscribes to signaling events at `endpoint`.
    async fn subscribe(&self, endpoint: &str) -> MeshResult<SignalingStream>;
}

/// Resolves a pending reply, if any. A receiver that already went away just
/// means the signaling side stopped waiting.
pub(crate) fn resolve<T>(reply: Option<Reply<T>>, value: T, connection: &ConnectionId) {
    if let Some(reply) = reply {
        if reply.send(value).is_err() {
            trace!(%connection, "signaling reply dropped by receiver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_accessors() {
        let (reply, _rx) = oneshot::channel();
        let event = SignalingEvent::FinishConnection {
            connection: ConnectionId::from("b"),
            answer: SessionDescription::new(&b"answer"[..]),
            reply,
        };

        assert_eq!(event.connection(), &ConnectionId::from("b"));
        assert_eq!(event.name(), "finish-connection");
    }

    #[test]
    fn resolve_delivers_value() {
        let (reply, mut rx) = oneshot::channel();
        resolve(Some(reply), true, &ConnectionId::from("b"));
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[test]
    fn resolve_tolerates_dropped_receiver() {
        let (reply, rx) = oneshot::channel::<bool>();
        drop(rx);
        resolve(Some(reply), true, &ConnectionId::from("b"));
        resolve::<bool>(None, true, &ConnectionId::from("b"));
    }
}
