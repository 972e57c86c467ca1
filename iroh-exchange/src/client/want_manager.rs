use std::sync::{Arc, Mutex};

use cid::Cid;
use libp2p_identity::PeerId;
use tracing::trace;

use crate::message::{Entry, Priority, WantType};

use super::peer_manager::PeerManager;
use super::wantlist::{self, SessionTrackedWantlist};

/// Aggregates the wants of all sessions and hands them to the [`PeerManager`].
///
/// Never touches the network itself, it only enqueues.
#[derive(Debug, Clone)]
pub struct WantManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    wants: Mutex<WantSet>,
    peer_manager: PeerManager,
}

#[derive(Debug, Default)]
struct WantSet {
    /// Everything any session wants.
    wantlist: SessionTrackedWantlist,
    /// The subset that was broadcast rather than targeted.
    broadcast: SessionTrackedWantlist,
}

impl WantManager {
    pub fn new(peer_manager: PeerManager) -> Self {
        WantManager {
            inner: Arc::new(Inner {
                wants: Default::default(),
                peer_manager,
            }),
        }
    }

    pub fn peer_manager(&self) -> &PeerManager {
        &self.inner.peer_manager
    }

    /// Adds want-blocks for `cids` on behalf of `session`.
    ///
    /// An empty `peers` broadcasts, otherwise only `peers` are asked.
    pub fn want_blocks(&self, cids: &[Cid], peers: &[PeerId], session: u64) {
        self.add(cids, peers, WantType::Block, session);
    }

    /// Adds want-haves for `cids` on behalf of `session`.
    pub fn want_haves(&self, cids: &[Cid], peers: &[PeerId], session: u64) {
        self.add(cids, peers, WantType::Have, session);
    }

    fn add(&self, cids: &[Cid], peers: &[PeerId], want_type: WantType, session: u64) {
        if cids.is_empty() {
            return;
        }
        trace!(
            "want_manager: session {} wants {} {:?} from {:?}",
            session,
            cids.len(),
            want_type,
            peers
        );
        // only peers we picked are asked to answer negatively
        let send_dont_have = !peers.is_empty();
        let entries: Vec<_> = cids
            .iter()
            .enumerate()
            .map(|(i, cid)| {
                Entry::want(*cid, priority_for(i), want_type).with_send_dont_have(send_dont_have)
            })
            .collect();
        self.handle(&entries, peers, session);
    }

    /// Retracts the wants of `session` for `cids`.
    ///
    /// Peers only see a cancel once no other session wants the `Cid`.
    pub fn cancel_wants(&self, cids: &[Cid], peers: &[PeerId], session: u64) {
        if cids.is_empty() {
            return;
        }
        let entries: Vec<_> = cids.iter().map(|cid| Entry::cancel(*cid)).collect();
        self.handle(&entries, peers, session);
    }

    fn handle(&self, entries: &[Entry], peers: &[PeerId], session: u64) {
        let broadcast = peers.is_empty();
        let mut wants = self.inner.lock();
        for entry in entries {
            if entry.is_cancel() {
                if broadcast {
                    wants.broadcast.remove(&entry.cid, session);
                }
                wants.wantlist.remove(&entry.cid, session);
            } else {
                let tracked = wantlist::Entry::new(entry.cid, entry.priority, entry.want_type);
                if broadcast {
                    wants.broadcast.add(tracked, session);
                }
                wants.wantlist.add(tracked, session);
            }
        }
        // still under the lock, keeps per peer ordering across callers
        self.inner
            .peer_manager
            .send_message(entries, peers, session);
    }

    /// Hands the complete current wantlist to a newly connected peer.
    pub fn peer_connected(&self, peer: PeerId) {
        let wants = self.inner.lock();
        self.inner.peer_manager.connected(peer, &wants.wantlist);
    }

    pub async fn peer_disconnected(&self, peer: PeerId) {
        self.inner.peer_manager.disconnected(peer).await;
    }

    pub fn is_wanted(&self, cid: &Cid) -> bool {
        self.inner.lock().wantlist.contains(cid)
    }

    pub fn current_wants(&self) -> Vec<wantlist::Entry> {
        self.inner.lock().wantlist.entries()
    }

    pub fn current_broadcast_wants(&self) -> Vec<wantlist::Entry> {
        self.inner.lock().broadcast.entries()
    }

    pub fn want_count(&self) -> usize {
        self.inner.lock().wantlist.len()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, WantSet> {
        self.wants.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// First requested gets the highest priority.
fn priority_for(index: usize) -> Priority {
    Priority::MAX - index.min(Priority::MAX as usize) as Priority
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::block::test_utils::create_blocks;
    use crate::client::message_queue::Config as MessageQueueConfig;
    use crate::metrics::Metrics;
    use crate::test_utils::{wait_until, RecordingNetwork};

    fn setup() -> (Arc<RecordingNetwork>, WantManager) {
        let network = Arc::new(RecordingNetwork::default());
        let pm = PeerManager::new(
            network.clone(),
            MessageQueueConfig {
                send_error_backoff: Duration::from_millis(5),
                ..Default::default()
            },
            Arc::new(Metrics::default()),
            CancellationToken::new(),
        );
        (network, WantManager::new(pm))
    }

    fn cids(n: usize) -> Vec<Cid> {
        create_blocks(n).iter().map(|b| *b.cid()).collect()
    }

    #[test]
    fn test_priorities_decrease() {
        assert_eq!(priority_for(0), i32::MAX);
        assert!(priority_for(1) < priority_for(0));
        assert_eq!(priority_for(usize::MAX), 0);
    }

    #[tokio::test]
    async fn test_cancel_needs_every_session() {
        let (network, wm) = setup();
        let peer = PeerId::random();
        wm.peer_connected(peer);
        let cids = cids(2);

        wm.want_blocks(&cids, &[], 1);
        wm.want_blocks(&cids[..1], &[], 2);
        assert_eq!(wm.want_count(), 2);

        wm.cancel_wants(&cids, &[], 1);
        assert!(wm.is_wanted(&cids[0]));
        assert!(!wm.is_wanted(&cids[1]));
        wait_until(|| network.cancels_sent_to(&peer) == vec![cids[1]]).await;

        wm.cancel_wants(&cids[..1], &[], 2);
        assert_eq!(wm.want_count(), 0);
        assert!(wm.current_broadcast_wants().is_empty());
        wait_until(|| network.cancels_sent_to(&peer).len() == 2).await;
    }

    #[tokio::test]
    async fn test_new_peer_gets_current_wants() {
        let (network, wm) = setup();
        let early = PeerId::random();
        wm.peer_connected(early);
        let cids = cids(3);

        wm.want_blocks(&cids[..2], &[], 1);
        wm.want_blocks(&cids[2..], &[early], 2);
        assert_eq!(wm.current_broadcast_wants().len(), 2);
        assert_eq!(wm.current_wants().len(), 3);

        let late = PeerId::random();
        wm.peer_connected(late);
        wait_until(|| !network.messages_to(&late).is_empty()).await;
        let msg = network.messages_to(&late).remove(0);
        assert!(msg.full());
        assert_eq!(msg.wantlist_len(), 3);
    }

    #[tokio::test]
    async fn test_targeted_wants_skip_other_peers() {
        let (network, wm) = setup();
        let (a, b) = (PeerId::random(), PeerId::random());
        wm.peer_connected(a);
        wm.peer_connected(b);
        let cids = cids(1);

        wm.want_blocks(&cids, &[a], 1);
        wait_until(|| network.wants_sent_to(&a) == cids).await;
        assert!(network.messages_to(&b).is_empty());
        assert!(wm.current_broadcast_wants().is_empty());
    }
}
