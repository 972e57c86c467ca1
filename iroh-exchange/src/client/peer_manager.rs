use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use libp2p_identity::PeerId;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::message::{BitswapMessage, Entry};
use crate::metrics::Metrics;
use crate::network::Network;

use super::message_queue::{Config as MessageQueueConfig, MessageQueue};
use super::wantlist::SessionTrackedWantlist;

/// Owns one [`MessageQueue`] per peer and fans messages out to them.
#[derive(Debug, Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

struct Inner {
    peers: Mutex<AHashMap<PeerId, PeerQueue>>,
    network: Arc<dyn Network>,
    config: MessageQueueConfig,
    metrics: Arc<Metrics>,
    ctx: CancellationToken,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("peers", &self.peers)
            .field("network", &self.network)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct PeerQueue {
    /// Number of open connections, zero for queues created by a targeted send.
    refcnt: usize,
    queue: MessageQueue,
}

impl PeerManager {
    pub fn new(
        network: Arc<dyn Network>,
        config: MessageQueueConfig,
        metrics: Arc<Metrics>,
        ctx: CancellationToken,
    ) -> Self {
        PeerManager {
            inner: Arc::new(Inner {
                peers: Default::default(),
                network,
                config,
                metrics,
                ctx,
            }),
        }
    }

    /// Returns the peers that currently have a queue.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.lock().keys().copied().collect()
    }

    /// Registers a connection to `peer`. The first connection seeds the queue with `initial_wants`.
    pub fn connected(&self, peer: PeerId, initial_wants: &SessionTrackedWantlist) {
        let mut peers = self.inner.lock();
        let peer_queue = peers
            .entry(peer)
            .or_insert_with(|| self.inner.new_queue(peer));
        if peer_queue.refcnt == 0 {
            peer_queue.queue.add_wantlist(initial_wants);
        }
        peer_queue.refcnt += 1;
    }

    /// Drops a connection to `peer`, shutting its queue down after the last one.
    pub async fn disconnected(&self, peer: PeerId) {
        let queue = {
            let mut peers = self.inner.lock();
            let Some(peer_queue) = peers.get_mut(&peer) else {
                return;
            };
            peer_queue.refcnt = peer_queue.refcnt.saturating_sub(1);
            if peer_queue.refcnt > 0 {
                return;
            }
            match peers.remove(&peer) {
                Some(peer_queue) => peer_queue.queue,
                None => return,
            }
        };
        debug!("peer_manager: {} disconnected", peer);
        if let Err(err) = queue.shutdown().await {
            warn!("peer_manager: failed to stop queue for {}: {:?}", peer, err);
        }
    }

    /// Sends `entries` to every queue.
    pub fn broadcast(&self, entries: &[Entry], session: u64) {
        let peers = self.inner.lock();
        for peer_queue in peers.values() {
            peer_queue.queue.add_message(entries, session);
        }
    }

    /// Passes `entries` to the queue for `peer`, creating it if needed.
    pub fn send_want_block(&self, peer: PeerId, entries: &[Entry], session: u64) {
        let mut peers = self.inner.lock();
        peers
            .entry(peer)
            .or_insert_with(|| self.inner.new_queue(peer))
            .queue
            .add_message(entries, session);
    }

    /// Sends `entries` to `targets`, or to everyone if `targets` is empty.
    pub fn send_message(&self, entries: &[Entry], targets: &[PeerId], session: u64) {
        self.reap_unconnected();
        if targets.is_empty() {
            self.broadcast(entries, session);
        } else {
            for peer in targets {
                self.send_want_block(*peer, entries, session);
            }
        }
    }

    /// Drops queues that were only created for targeted sends once they have nothing left to do.
    fn reap_unconnected(&self) {
        let mut peers = self.inner.lock();
        peers.retain(|peer, peer_queue| {
            let keep = peer_queue.refcnt > 0 || !peer_queue.queue.is_drained();
            if !keep {
                trace!("peer_manager: dropping idle queue for unconnected {}", peer);
            }
            keep
        });
    }

    /// Queues a server response for a connected peer.
    ///
    /// Without a queue the response is dropped, which `ack` observes as closed.
    pub fn send_response(&self, peer: &PeerId, response: BitswapMessage, ack: oneshot::Sender<bool>) {
        let peers = self.inner.lock();
        match peers.get(peer) {
            Some(peer_queue) => peer_queue.queue.add_response(response, ack),
            None => debug!("peer_manager: no queue for {}, dropping response", peer),
        }
    }

    /// Stops every queue and waits for them to finish.
    pub async fn shutdown(&self) {
        let queues: Vec<_> = self.inner.lock().drain().collect();
        for (peer, peer_queue) in queues {
            if let Err(err) = peer_queue.queue.shutdown().await {
                warn!("peer_manager: failed to stop queue for {}: {:?}", peer, err);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_wants(&self, peer: &PeerId) -> Vec<super::wantlist::Entry> {
        self.inner
            .lock()
            .get(peer)
            .map(|p| p.queue.wants())
            .unwrap_or_default()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, AHashMap<PeerId, PeerQueue>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_queue(&self, peer: PeerId) -> PeerQueue {
        PeerQueue {
            refcnt: 0,
            queue: MessageQueue::new(
                peer,
                self.network.clone(),
                self.config.clone(),
                self.metrics.clone(),
                self.ctx.child_token(),
            ),
        }
    }
}
