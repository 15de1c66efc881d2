// ============================
// duet-backend-lib/src/relay.rs
// ============================
//! Peer fan-out and the negotiation relay.
//!
//! [`Outbox`] is the publish side of the transport: per-peer unicast plus fan-out to a
//! member list. [`PeerHub`] implements it with one unbounded FIFO channel per connected
//! peer, which gives a single ordered lane per directed pair as long as senders are
//! serialized (the coordinator loop is the only sender of relay traffic).
use crate::metrics::{RELAY_DROPPED, RELAY_FORWARDED};
use dashmap::DashMap;
use duet_common::{NegotiationKind, PeerId, ServerMessage};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Delivery side of the message channel
pub trait Outbox: Send + Sync {
    /// Deliver to one peer. Returns `false` if the peer is not connected.
    fn unicast(&self, to: PeerId, msg: ServerMessage) -> bool;

    /// Deliver to every listed peer, returning how many were reached
    fn broadcast(&self, to: &[PeerId], msg: &ServerMessage) -> usize {
        to.iter()
            .filter(|peer| self.unicast(**peer, msg.clone()))
            .count()
    }
}

/// Connected peers and their outbound channels
#[derive(Default)]
pub struct PeerHub {
    peers: DashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>,
}

impl PeerHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer; messages for it arrive on the returned receiver
    pub fn subscribe(&self, peer_id: PeerId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.insert(peer_id, tx);
        rx
    }

    pub fn unsubscribe(&self, peer_id: PeerId) {
        self.peers.remove(&peer_id);
    }

    pub fn is_connected(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Outbox for PeerHub {
    fn unicast(&self, to: PeerId, msg: ServerMessage) -> bool {
        match self.peers.get(&to) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }
}

/// Result of a relay attempt. Neither variant is reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    /// Target not connected; the message was dropped
    TargetUnavailable,
}

/// Point-to-point forwarding of opaque negotiation payloads
#[derive(Clone)]
pub struct NegotiationRelay {
    outbox: Arc<dyn Outbox>,
}

impl NegotiationRelay {
    pub fn new(outbox: Arc<dyn Outbox>) -> Self {
        Self { outbox }
    }

    /// Forward `payload` from `from` to `to` without inspecting it.
    ///
    /// A target that is gone is dropped silently: the sender gets no error, matching the
    /// behaviour clients were built against.
    pub fn relay(
        &self,
        kind: NegotiationKind,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
    ) -> RelayOutcome {
        if self
            .outbox
            .unicast(to, ServerMessage::negotiation(kind, from, payload))
        {
            counter!(RELAY_FORWARDED, "kind" => kind.as_str()).increment(1);
            tracing::trace!(%from, %to, kind = kind.as_str(), "relayed negotiation message");
            RelayOutcome::Delivered
        } else {
            counter!(RELAY_DROPPED, "kind" => kind.as_str()).increment(1);
            tracing::debug!(%from, %to, kind = kind.as_str(), "relay target unavailable, dropped");
            RelayOutcome::TargetUnavailable
        }
    }
}
