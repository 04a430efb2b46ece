//! Peer selection for one service.

use std::{collections::HashMap, sync::Arc};

use muxwire_core::{CallError, Environment, PeerHeap};
use parking_lot::Mutex;
use tracing::debug;

use crate::peer::{Peer, PeerContext, SharedHeap};

/// The peers serving one service, ordered by load and health.
///
/// Selection never blocks on I/O: it only takes the heap lock. Lock order is
/// always `peers` then `heap`.
pub struct PeerSelector<E> {
    service: String,
    context: Arc<PeerContext<E>>,
    peers: Mutex<HashMap<String, Arc<Peer<E>>>>,
    heap: SharedHeap,
}

impl<E: Environment> PeerSelector<E> {
    pub(crate) fn new(service: String, context: Arc<PeerContext<E>>) -> Self {
        Self {
            service,
            context,
            peers: Mutex::new(HashMap::new()),
            heap: Arc::new(Mutex::new(PeerHeap::new())),
        }
    }

    /// Service these peers serve.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// True when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Known peers in no particular order.
    pub fn peers(&self) -> Vec<Arc<Peer<E>>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Peer for `host_port`, if known.
    pub fn get(&self, host_port: &str) -> Option<Arc<Peer<E>>> {
        self.peers.lock().get(host_port).cloned()
    }

    /// Add a peer. Returns the existing one if already known.
    pub fn add(&self, host_port: impl Into<String>) -> Arc<Peer<E>> {
        let host_port = host_port.into();
        let mut peers = self.peers.lock();
        if let Some(peer) = peers.get(&host_port) {
            return Arc::clone(peer);
        }
        debug!(service = %self.service, peer = %host_port, "adding peer");
        let peer = Peer::new(host_port.clone(), Arc::clone(&self.context), &self.heap);
        self.heap.lock().insert(host_port.clone());
        peers.insert(host_port, Arc::clone(&peer));
        peer
    }

    /// Remove a peer from selection.
    ///
    /// Calls already bound to it complete normally; it is no longer chosen
    /// and its scores are no longer tracked.
    pub fn remove(&self, host_port: &str) -> Option<Arc<Peer<E>>> {
        let mut peers = self.peers.lock();
        let peer = peers.remove(host_port)?;
        self.heap.lock().remove(&host_port.to_string());
        debug!(service = %self.service, peer = %host_port, "removed peer");
        Some(peer)
    }

    /// Best peer: fewest outstanding calls, then fewest consecutive
    /// failures, then least recently chosen.
    ///
    /// # Errors
    ///
    /// `NoPeersAvailable` when the set is empty.
    pub fn choose(&self) -> Result<Arc<Peer<E>>, CallError> {
        let peers = self.peers.lock();
        let chosen = self.heap.lock().choose();
        self.resolve(&peers, chosen)
    }

    /// [`Self::choose`] and record a call start on the chosen peer in one
    /// step, so concurrent callers see each other's load.
    ///
    /// # Errors
    ///
    /// `NoPeersAvailable` when the set is empty.
    pub fn acquire(&self) -> Result<Arc<Peer<E>>, CallError> {
        let peers = self.peers.lock();
        let chosen = {
            let mut heap = self.heap.lock();
            let chosen = heap.choose();
            if let Some(key) = &chosen {
                heap.record_start(key);
            }
            chosen
        };
        self.resolve(&peers, chosen)
    }

    /// Close every peer's connection.
    pub async fn close(&self) {
        for peer in self.peers() {
            peer.close().await;
        }
    }

    fn resolve(
        &self,
        peers: &HashMap<String, Arc<Peer<E>>>,
        chosen: Option<String>,
    ) -> Result<Arc<Peer<E>>, CallError> {
        chosen
            .and_then(|key| peers.get(&key).cloned())
            .ok_or_else(|| CallError::NoPeersAvailable(self.service.clone()))
    }
}
