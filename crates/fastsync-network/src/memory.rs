//! In-process transport connecting sync reactors without sockets.
//!
//! A [`MemoryNetwork`] is a hub of named nodes. Each node gets a
//! [`MemoryTransport`] for sending and a stream of [`NetworkEvent`]s for
//! receiving. Every directed link has its own bounded send queue drained by a
//! small pump task, so a slow receiver fills the queue and
//! [`Transport::try_send`] starts returning `false`, just as with a real
//! socket.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use fastsync_core::constants::CHANNEL_CAPACITY;
use fastsync_core::traits::Transport;
use fastsync_core::types::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::reactor::SyncReactor;

/// Events delivered to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A link to this peer was established.
    PeerConnected(PeerId),
    /// The link to this peer is gone.
    PeerDisconnected(PeerId),
    /// A message arrived from `peer`.
    Message {
        peer: PeerId,
        channel: u8,
        payload: Bytes,
    },
}

struct Link {
    id: u64,
    tx: mpsc::Sender<(u8, Bytes)>,
    pump: AbortHandle,
}

#[derive(Default)]
struct Hub {
    nodes: BTreeMap<PeerId, mpsc::UnboundedSender<NetworkEvent>>,
    /// Directed links keyed by `(from, to)`.
    links: HashMap<(PeerId, PeerId), Link>,
    next_link_id: u64,
}

impl Hub {
    fn notify(&self, node: &PeerId, event: NetworkEvent) {
        if let Some(events) = self.nodes.get(node) {
            let _ = events.send(event);
        }
    }

    fn drop_link(&mut self, from: &PeerId, to: &PeerId) -> bool {
        match self.links.remove(&(from.clone(), to.clone())) {
            Some(link) => {
                link.pump.abort();
                true
            }
            None => false,
        }
    }

    fn peers_of(&self, node: &PeerId) -> Vec<PeerId> {
        self.links
            .keys()
            .filter(|(from, _)| from == node)
            .map(|(_, to)| to.clone())
            .collect()
    }
}

/// Hub connecting in-memory nodes.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    queue_capacity: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_queue_capacity(CHANNEL_CAPACITY)
    }

    /// Network whose per-link send queues hold `queue_capacity` messages.
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            queue_capacity,
        }
    }

    /// Register a node. Joining again under the same id replaces the old
    /// event stream.
    pub fn join(
        &self,
        id: impl Into<PeerId>,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<NetworkEvent>) {
        let id = id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.hub.lock().nodes.insert(id.clone(), events_tx);
        debug!(node = %id, "node joined memory network");
        let transport = MemoryTransport {
            local: id,
            network: self.clone(),
        };
        (transport, events_rx)
    }

    /// Link two joined nodes in both directions and announce each to the
    /// other. Returns `false` if either node is unknown or the link exists.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, a: &PeerId, b: &PeerId) -> bool {
        let mut hub = self.hub.lock();
        if a == b
            || !hub.nodes.contains_key(a)
            || !hub.nodes.contains_key(b)
            || hub.links.contains_key(&(a.clone(), b.clone()))
        {
            return false;
        }
        // Announce first so no message can overtake the connect event.
        hub.notify(a, NetworkEvent::PeerConnected(b.clone()));
        hub.notify(b, NetworkEvent::PeerConnected(a.clone()));
        self.open_link(&mut hub, a, b);
        self.open_link(&mut hub, b, a);
        info!(%a, %b, "memory link up");
        true
    }

    fn open_link(&self, hub: &mut Hub, from: &PeerId, to: &PeerId) {
        hub.next_link_id += 1;
        let id = hub.next_link_id;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let pump = tokio::spawn(pump(
            Arc::downgrade(&self.hub),
            from.clone(),
            to.clone(),
            id,
            rx,
        ));
        hub.links.insert(
            (from.clone(), to.clone()),
            Link {
                id,
                tx,
                pump: pump.abort_handle(),
            },
        );
    }

    /// Tear down the link between `a` and `b`; both sides are told.
    /// Messages still queued on the link are lost.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId, reason: &str) -> bool {
        let mut hub = self.hub.lock();
        let had_ab = hub.drop_link(a, b);
        let had_ba = hub.drop_link(b, a);
        if !(had_ab || had_ba) {
            return false;
        }
        hub.notify(a, NetworkEvent::PeerDisconnected(b.clone()));
        hub.notify(b, NetworkEvent::PeerDisconnected(a.clone()));
        info!(%a, %b, reason, "memory link down");
        true
    }

    /// Disconnect `node` from everyone and close its event stream.
    pub fn leave(&self, node: &PeerId) {
        let peers = self.hub.lock().peers_of(node);
        for peer in &peers {
            self.disconnect(node, peer, "left network");
        }
        self.hub.lock().nodes.remove(node);
    }

    /// Peers `node` currently has a link to.
    pub fn peers_of(&self, node: &PeerId) -> Vec<PeerId> {
        self.hub.lock().peers_of(node)
    }
}

/// Move messages from one link's queue into the receiving node's event
/// stream until the link is torn down.
async fn pump(
    hub: Weak<Mutex<Hub>>,
    from: PeerId,
    to: PeerId,
    link_id: u64,
    mut rx: mpsc::Receiver<(u8, Bytes)>,
) {
    let key = (from, to);
    while let Some((channel, payload)) = rx.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        let hub = hub.lock();
        // Checked under the hub lock so nothing lands after the disconnect
        // event.
        if hub.links.get(&key).map(|link| link.id) != Some(link_id) {
            break;
        }
        hub.notify(
            &key.1,
            NetworkEvent::Message {
                peer: key.0.clone(),
                channel,
                payload,
            },
        );
    }
}

/// A node's handle for sending on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn try_send(&self, peer: &PeerId, channel: u8, msg: Bytes) -> bool {
        let hub = self.network.hub.lock();
        match hub.links.get(&(self.local.clone(), peer.clone())) {
            Some(link) => link.tx.try_send((channel, msg)).is_ok(),
            None => false,
        }
    }

    fn broadcast(&self, channel: u8, msg: Bytes) {
        let hub = self.network.hub.lock();
        for ((from, _), link) in &hub.links {
            if *from == self.local {
                let _ = link.tx.try_send((channel, msg.clone()));
            }
        }
    }

    fn disconnect(&self, peer: &PeerId, reason: &str) {
        self.network.disconnect(&self.local, peer, reason);
    }

    fn num_peers(&self) -> usize {
        let hub = self.network.hub.lock();
        hub.links.keys().filter(|(from, _)| *from == self.local).count()
    }
}

/// Feed a node's network events into its reactor until the stream closes.
pub async fn drive(reactor: Arc<SyncReactor>, mut events: mpsc::UnboundedReceiver<NetworkEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::PeerConnected(peer) => reactor.add_peer(&peer),
            NetworkEvent::PeerDisconnected(peer) => reactor.remove_peer(&peer),
            NetworkEvent::Message {
                peer,
                channel,
                payload,
            } => reactor.receive(channel, &peer, &payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connect_announces_both_sides() {
        let net = MemoryNetwork::new();
        let (_ta, mut ea) = net.join("a");
        let (_tb, mut eb) = net.join("b");
        assert!(net.connect(&PeerId::from("a"), &PeerId::from("b")));
        assert!(!net.connect(&PeerId::from("a"), &PeerId::from("b")));
        assert_eq!(
            ea.recv().await,
            Some(NetworkEvent::PeerConnected(PeerId::from("b")))
        );
        assert_eq!(
            eb.recv().await,
            Some(NetworkEvent::PeerConnected(PeerId::from("a")))
        );
    }

    #[tokio::test]
    async fn messages_flow_over_links() {
        let net = MemoryNetwork::new();
        let (ta, _ea) = net.join("a");
        let (_tb, mut eb) = net.join("b");
        net.connect(&PeerId::from("a"), &PeerId::from("b"));
        assert_eq!(ta.num_peers(), 1);

        assert!(ta.try_send(&PeerId::from("b"), 0x40, Bytes::from_static(b"hi")));
        assert!(!ta.try_send(&PeerId::from("c"), 0x40, Bytes::from_static(b"hi")));

        assert!(matches!(eb.recv().await, Some(NetworkEvent::PeerConnected(_))));
        assert_eq!(
            eb.recv().await,
            Some(NetworkEvent::Message {
                peer: PeerId::from("a"),
                channel: 0x40,
                payload: Bytes::from_static(b"hi"),
            })
        );
    }

    #[tokio::test]
    async fn full_queue_rejects_sends() {
        let net = MemoryNetwork::with_queue_capacity(2);
        let (ta, _ea) = net.join("a");
        let (_tb, _eb) = net.join("b");
        net.connect(&PeerId::from("a"), &PeerId::from("b"));
        let b = PeerId::from("b");
        // The pump has not run yet, so the queue fills up.
        assert!(ta.try_send(&b, 0x40, Bytes::from_static(b"1")));
        assert!(ta.try_send(&b, 0x40, Bytes::from_static(b"2")));
        assert!(!ta.try_send(&b, 0x40, Bytes::from_static(b"3")));
        settle().await;
        assert!(ta.try_send(&b, 0x40, Bytes::from_static(b"4")));
    }

    #[tokio::test]
    async fn disconnect_tells_both_sides_and_closes_link() {
        let net = MemoryNetwork::new();
        let (ta, mut ea) = net.join("a");
        let (tb, mut eb) = net.join("b");
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        net.connect(&a, &b);
        ea.recv().await;
        eb.recv().await;

        tb.disconnect(&a, "test");
        assert_eq!(ea.recv().await, Some(NetworkEvent::PeerDisconnected(b.clone())));
        assert_eq!(eb.recv().await, Some(NetworkEvent::PeerDisconnected(a.clone())));
        assert!(!ta.try_send(&b, 0x40, Bytes::from_static(b"x")));
        assert_eq!(ta.num_peers(), 0);
        assert!(!net.disconnect(&a, &b, "again"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_linked_peer() {
        let net = MemoryNetwork::new();
        let (ta, _ea) = net.join("a");
        let (_tb, mut eb) = net.join("b");
        let (_tc, mut ec) = net.join("c");
        let a = PeerId::from("a");
        net.connect(&a, &PeerId::from("b"));
        net.connect(&a, &PeerId::from("c"));
        ta.broadcast(0x40, Bytes::from_static(b"all"));
        for events in [&mut eb, &mut ec] {
            assert!(matches!(events.recv().await, Some(NetworkEvent::PeerConnected(_))));
            assert!(matches!(
                events.recv().await,
                Some(NetworkEvent::Message { channel: 0x40, .. })
            ));
        }
    }

    #[tokio::test]
    async fn leave_disconnects_everyone() {
        let net = MemoryNetwork::new();
        let (_ta, _ea) = net.join("a");
        let (tb, _eb) = net.join("b");
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        net.connect(&a, &b);
        net.leave(&a);
        assert_eq!(tb.num_peers(), 0);
        assert!(net.peers_of(&b).is_empty());
        assert!(!net.connect(&a, &b));
    }
}
