use std::sync::Mutex;

use ahash::{AHashMap, AHashSet};
use cid::Cid;
use tokio::sync::mpsc;

use crate::block::Block;

/// Routes received blocks to the `get_blocks` calls waiting for them.
#[derive(Debug, Default)]
pub struct Notifier {
    inner: Mutex<Subscriptions>,
}

#[derive(Debug, Default)]
struct Subscriptions {
    next_id: u64,
    subscribers: AHashMap<u64, Subscriber>,
    by_cid: AHashMap<Cid, AHashSet<u64>>,
}

#[derive(Debug)]
struct Subscriber {
    sender: mpsc::UnboundedSender<Block>,
    pending: AHashSet<Cid>,
}

impl Notifier {
    pub fn subscribe(&self, cids: &[Cid]) -> (u64, mpsc::UnboundedReceiver<Block>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subs = self.lock();
        let id = subs.next_id;
        subs.next_id += 1;

        let pending: AHashSet<Cid> = cids.iter().copied().collect();
        for cid in &pending {
            subs.by_cid.entry(*cid).or_default().insert(id);
        }
        subs.subscribers.insert(id, Subscriber { sender, pending });
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.lock();
        if let Some(sub) = subs.subscribers.remove(&id) {
            for cid in sub.pending {
                subs.detach(&cid, id);
            }
        }
    }

    /// Hands `block` to every subscriber still waiting for it, at most once each.
    pub fn publish(&self, block: &Block) -> usize {
        let mut subs = self.lock();
        let Some(ids) = subs.by_cid.remove(block.cid()) else {
            return 0;
        };
        let mut delivered = 0;
        for id in ids {
            if let Some(sub) = subs.subscribers.get_mut(&id) {
                sub.pending.remove(block.cid());
                if sub.sender.send(block.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn has_subscribers(&self, cid: &Cid) -> bool {
        self.lock().by_cid.contains_key(cid)
    }

    /// Drops every subscription, their receivers observe the end of the stream.
    pub fn shutdown(&self) {
        let mut subs = self.lock();
        subs.subscribers.clear();
        subs.by_cid.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Subscriptions {
    fn detach(&mut self, cid: &Cid, id: u64) {
        if let Some(ids) = self.by_cid.get_mut(cid) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_cid.remove(cid);
            }
        }
    }
}
