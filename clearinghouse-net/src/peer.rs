use std::collections::HashMap;
use std::sync::mpsc::{self, SyncSender};
use std::sync::RwLock;

use clearinghouse_base::{err, Result};

use crate::wire::Packet;

/// Bounded queue depth for every peer's outgoing link.
pub const QUEUE_CAPACITY: usize = 100;

/// Receives fully decoded packets and peer lifecycle events. The net layer
/// knows nothing about transaction semantics; it only demultiplexes bytes
/// into [`Packet`]s and peer connect/disconnect notifications, and hands
/// them to whatever implements this trait (the branch FSM, in practice).
pub trait Dispatch: Send + Sync + 'static {
    fn on_packet(&self, packet: Packet);
    fn on_peer_connected(&self, peer_id: &str, is_client: bool) {
        let _ = (peer_id, is_client);
    }
    fn on_peer_disconnected(&self, peer_id: &str) {
        let _ = peer_id;
    }
}

/// A handle to one peer's outgoing link. Cloning and sharing this is how
/// every other component ("send to branch X") reaches a peer without caring
/// whether X is a remote socket or the local loopback.
#[derive(Clone)]
pub struct PeerHandle {
    id: String,
    is_client: bool,
    sender: SyncSender<Packet>,
}

impl PeerHandle {
    pub(crate) fn new(id: String, is_client: bool, sender: SyncSender<Packet>) -> Self {
        PeerHandle { id, is_client, sender }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Enqueues a packet for delivery. Blocks if the outgoing queue is full,
    /// providing link-level backpressure, and fails if the peer's
    /// writer/loopback thread has already torn down.
    pub fn send(&self, packet: Packet) -> Result<()> {
        self.sender
            .send(packet)
            .map_err(|_| err(format!("peer {} is no longer reachable", self.id)))
    }
}

/// Branch-scoped registry of every known peer, passed to task handlers by
/// shared reference rather than through a hidden global. Reads dominate
/// (routing lookups); writes only happen on connect/disconnect.
#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: PeerHandle) {
        self.peers.write().unwrap().insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, id: &str) {
        self.peers.write().unwrap().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<PeerHandle> {
        self.peers.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.read().unwrap().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates a bounded outgoing channel of the standard queue depth, as used
/// by every kind of link (remote writer threads and the loopback
/// short-circuit alike).
pub fn bounded_channel() -> (SyncSender<Packet>, mpsc::Receiver<Packet>) {
    mpsc::sync_channel(QUEUE_CAPACITY)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn peer_set_tracks_membership() {
        let (tx, _rx) = bounded_channel();
        let peers = PeerSet::new();
        assert!(!peers.contains("A"));
        peers.insert(PeerHandle::new("A".to_string(), false, tx));
        assert!(peers.contains("A"));
        assert_eq!(peers.ids(), vec!["A".to_string()]);
        peers.remove("A");
        assert!(!peers.contains("A"));
    }
}
