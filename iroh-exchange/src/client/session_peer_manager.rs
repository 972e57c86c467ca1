use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap;
use libp2p_identity::PeerId;
use rand::seq::SliceRandom;

const LATENCY_ALPHA: f64 = 0.5;

/// Candidate peers of a single session, ranked by how well they served it.
#[derive(Debug, Clone)]
pub struct SessionPeerManager {
    inner: Arc<Mutex<Peers>>,
    max_optimized_peers: usize,
    reserve_peers: usize,
}

#[derive(Debug, Default)]
struct Peers {
    peers: AHashMap<PeerId, PeerStats>,
    discovered: bool,
}

#[derive(Debug, Default)]
struct PeerStats {
    /// Number of blocks this peer delivered to the session first.
    responses: usize,
    latency: LatencyEwma,
    /// Productive peers are targeted directly.
    optimized: bool,
}

/// Tracks the EWMA of a response latency.
#[derive(Debug, Default)]
struct LatencyEwma {
    samples: u64,
    latency: Duration,
}

impl LatencyEwma {
    fn update(&mut self, elapsed: Duration) {
        self.samples += 1;
        // 1 / samples until enough samples were seen
        let alpha = (1.0 / self.samples as f64).max(LATENCY_ALPHA);
        self.latency = Duration::from_secs_f64(
            elapsed.as_secs_f64() * alpha + (1. - alpha) * self.latency.as_secs_f64(),
        );
    }
}

impl SessionPeerManager {
    pub fn new(max_optimized_peers: usize, reserve_peers: usize) -> Self {
        SessionPeerManager {
            inner: Default::default(),
            max_optimized_peers,
            reserve_peers,
        }
    }

    /// Adds a candidate, returns `true` if it was not known before.
    pub fn add_peer(&self, peer: PeerId) -> bool {
        let mut peers = self.lock();
        if peers.peers.contains_key(&peer) {
            return false;
        }
        peers.peers.insert(peer, PeerStats::default());
        peers.discovered = true;
        true
    }

    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        self.lock().peers.remove(peer).is_some()
    }

    /// Records that `peer` delivered a wanted block, after `latency` if known.
    pub fn record_peer_response(&self, peer: PeerId, latency: Option<Duration>) {
        let mut peers = self.lock();
        peers.discovered = true;
        let stats = peers.peers.entry(peer).or_default();
        stats.responses += 1;
        stats.optimized = true;
        if let Some(latency) = latency {
            stats.latency.update(latency);
        }
    }

    /// Demotes a peer that told us it lacks a block we asked it for.
    pub fn record_dont_have(&self, peer: &PeerId) {
        if let Some(stats) = self.lock().peers.get_mut(peer) {
            stats.optimized = false;
        }
    }

    pub fn has_peers(&self) -> bool {
        !self.lock().peers.is_empty()
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.lock().peers.contains_key(peer)
    }

    /// Whether any peer was ever added to the session.
    pub fn peers_discovered(&self) -> bool {
        self.lock().discovered
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.lock().peers.keys().copied().collect()
    }

    /// Best peers first: productive peers by latency and response count,
    /// followed by a few random unproven ones.
    pub fn get_optimized_peers(&self) -> Vec<PeerId> {
        let peers = self.lock();
        let mut optimized: Vec<_> = peers.peers.iter().filter(|(_, s)| s.optimized).collect();
        optimized.sort_by(|(_, a), (_, b)| rank(a, b));

        let mut out: Vec<_> = optimized
            .into_iter()
            .take(self.max_optimized_peers)
            .map(|(p, _)| *p)
            .collect();

        let unoptimized: Vec<_> = peers
            .peers
            .iter()
            .filter(|(_, s)| !s.optimized)
            .map(|(p, _)| *p)
            .collect();
        let reserve = if out.is_empty() {
            unoptimized.len()
        } else {
            self.reserve_peers
        };
        out.extend(unoptimized.choose_multiple(&mut rand::thread_rng(), reserve));
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Peers> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn rank(a: &PeerStats, b: &PeerStats) -> Ordering {
    a.latency
        .latency
        .cmp(&b.latency.latency)
        .then(b.responses.cmp(&a.responses))
}
