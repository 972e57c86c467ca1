use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::block::Block;
use crate::client::wantlist;
use crate::message::{BitswapMessage, BlockPresenceType, Entry, WantType};
use crate::peer_task_queue::{self, PeerTaskQueue, Task};
use crate::Store;

use super::ledger::{Ledger, Receipt};
use super::task_merger::{TaskData, TaskMerger};

/// How often idle workers look at the queue even without being signalled.
const WORK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Config {
    /// Work popped per envelope, in bytes.
    pub target_message_size: usize,
    /// Bytes that may be in flight to a single peer, 0 for no limit.
    pub max_outstanding_bytes_per_peer: usize,
    /// Blocks up to this size are sent in reply to a want-have.
    pub max_replace_size: usize,
    /// Reply DONT_HAVE to wants that ask for it.
    pub send_dont_haves: bool,
    /// Peers with a higher debt ratio are served after everyone else.
    pub max_debt_ratio: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_message_size: 16 * 1024,
            max_outstanding_bytes_per_peer: 1 << 20,
            max_replace_size: 1024,
            send_dont_haves: true,
            max_debt_ratio: None,
        }
    }
}

pub type TaskQueue = PeerTaskQueue<Cid, TaskData, TaskMerger>;

/// Decides which blocks to send to which peers, and in what order.
#[derive(Debug)]
pub struct Engine<S: Store> {
    peer_task_queue: TaskQueue,
    ledgers: RwLock<AHashMap<PeerId, Arc<Mutex<Ledger>>>>,
    /// Which peers want a cid, used to wake them up once we get it.
    wanted_by: Mutex<AHashMap<Cid, AHashSet<PeerId>>>,
    store: S,
    config: Config,
    work_signal: Notify,
}

/// A response, ready to be sent to `peer`.
#[derive(Debug)]
pub struct Envelope {
    pub peer: PeerId,
    pub message: BitswapMessage,
    pub tasks: Vec<Task<Cid, TaskData>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, config: Config) -> Self {
        let peer_task_queue = PeerTaskQueue::new(
            TaskMerger,
            peer_task_queue::Config {
                max_outstanding_work_per_peer: config.max_outstanding_bytes_per_peer,
            },
        );
        Engine {
            peer_task_queue,
            ledgers: Default::default(),
            wanted_by: Default::default(),
            store,
            config,
            work_signal: Notify::new(),
        }
    }

    pub fn stats(&self) -> peer_task_queue::Stats {
        self.peer_task_queue.stats()
    }

    pub fn ledger_for_peer(&self, peer: &PeerId) -> Option<Receipt> {
        self.ledger(peer).map(|l| lock(&l).receipt())
    }

    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<wantlist::Entry> {
        self.ledger(peer)
            .map(|l| lock(&l).wantlist().entries())
            .unwrap_or_default()
    }

    /// Peers we currently keep a ledger for.
    pub fn peers(&self) -> Vec<PeerId> {
        self.ledgers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Applies the wantlist of an inbound message and queues the responses.
    pub async fn message_received(&self, peer: &PeerId, message: &BitswapMessage) {
        if message.is_empty() && !message.full() {
            debug!("received empty message from {}", peer);
        }

        let (cancels, wants): (Vec<&Entry>, Vec<&Entry>) =
            message.wantlist().partition(|e| e.is_cancel());

        // look up sizes before taking any locks
        let mut block_sizes = AHashMap::new();
        for entry in &wants {
            if block_sizes.contains_key(&entry.cid) {
                continue;
            }
            if let Some(size) = self.block_size(&entry.cid).await {
                block_sizes.insert(entry.cid, size);
            }
        }

        let ledger = self.find_or_create(peer);
        let mut ledger = lock(&ledger);
        ledger.record_received(message.blocks_size());

        if message.full() {
            let wanted: AHashSet<Cid> = wants.iter().map(|e| e.cid).collect();
            let stale: Vec<Cid> = ledger
                .wantlist()
                .cids()
                .filter(|c| !wanted.contains(c))
                .copied()
                .collect();
            for cid in &stale {
                ledger.cancel_want(cid);
            }
            self.unregister_wants(peer, &stale);
            self.peer_task_queue
                .retain_pending(peer, |cid| wanted.contains(cid));
        }

        let mut cancelled = Vec::new();
        for entry in &cancels {
            if ledger.cancel_want(&entry.cid).is_some() {
                self.peer_task_queue.remove(&entry.cid, peer);
                cancelled.push(entry.cid);
            }
        }
        self.unregister_wants(peer, &cancelled);

        let mut tasks = Vec::new();
        for entry in &wants {
            ledger.wants(entry.cid, entry.priority, entry.want_type);
            if let Some(size) = block_sizes.get(&entry.cid) {
                tasks.push(self.block_task(entry, *size));
            } else if self.config.send_dont_haves && entry.send_dont_have {
                trace!("{} wants {}, which we do not have", peer, entry.cid);
                tasks.push(Task {
                    topic: entry.cid,
                    priority: entry.priority,
                    work: entry.cid.encoded_len(),
                    data: TaskData {
                        is_want_block: entry.want_type == WantType::Block,
                        send_dont_have: true,
                        block_size: 0,
                        have_block: false,
                    },
                });
            }
        }
        {
            let mut wanted_by = lock(&self.wanted_by);
            for entry in &wants {
                wanted_by.entry(entry.cid).or_default().insert(*peer);
            }
        }

        if !tasks.is_empty() {
            self.peer_task_queue.push_tasks(*peer, tasks);
            self.work_signal.notify_one();
        }
        self.update_priority(&ledger);
    }

    /// Wakes up the peers waiting for any of `blocks`.
    pub fn notify_new_blocks(&self, blocks: &[Block]) {
        let mut woke = false;
        for block in blocks {
            let peers: Vec<PeerId> = lock(&self.wanted_by)
                .get(block.cid())
                .map(|p| p.iter().copied().collect())
                .unwrap_or_default();
            for peer in peers {
                let Some(ledger) = self.ledger(&peer) else {
                    continue;
                };
                let ledger = lock(&ledger);
                let Some(entry) = ledger.wantlist_get(block.cid()).copied() else {
                    continue;
                };
                let want = Entry::want(entry.cid, entry.priority, entry.want_type);
                self.peer_task_queue
                    .push_tasks(peer, vec![self.block_task(&want, block.len())]);
                // the tracker may be new and not know about the peer's debt yet
                self.update_priority(&ledger);
                woke = true;
            }
        }
        if woke {
            self.work_signal.notify_one();
        }
    }

    /// Books a message that reached `peer`.
    pub fn message_sent(&self, peer: &PeerId, message: &BitswapMessage) {
        let Some(ledger) = self.ledger(peer) else {
            return;
        };
        let mut ledger = lock(&ledger);
        ledger.record_sent(message.blocks_size());

        let mut done = Vec::new();
        for block in message.blocks() {
            if ledger.cancel_want(block.cid()).is_some() {
                done.push(*block.cid());
            }
        }
        for presence in message.block_presences() {
            // keep wants we answered DONT_HAVE to, we may get the block later
            if presence.typ == BlockPresenceType::Have
                && ledger
                    .wantlist_mut()
                    .remove_type(&presence.cid, WantType::Have)
                    .is_some()
            {
                done.push(presence.cid);
            }
        }
        self.unregister_wants(peer, &done);
        self.update_priority(&ledger);
    }

    pub fn tasks_done(&self, peer: &PeerId, tasks: &[Task<Cid, TaskData>]) {
        self.peer_task_queue.tasks_done(peer, tasks);
        self.work_signal.notify_one();
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        lock(&self.find_or_create(peer)).connected();
    }

    /// Drops the ledger of `peer` once its last connection is gone.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        let Some(ledger) = self.ledger(peer) else {
            return;
        };
        let wants: Vec<Cid> = {
            let mut ledger = lock(&ledger);
            if !ledger.disconnected() {
                return;
            }
            ledger.wantlist().cids().copied().collect()
        };
        self.ledgers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer);
        self.unregister_wants(peer, &wants);
        self.peer_task_queue.remove_peer(peer);
        debug!("dropped ledger for {}", peer);
    }

    /// Waits for work and packs it into a message, `None` once `shutdown` fires.
    pub async fn next_envelope(&self, shutdown: &CancellationToken) -> Option<Envelope> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }
            let Some((peer, tasks, pending)) = self
                .peer_task_queue
                .pop_tasks(self.config.target_message_size)
            else {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => return None,
                    _ = self.work_signal.notified() => {}
                    _ = tokio::time::sleep(WORK_POLL_INTERVAL) => {}
                }
                continue;
            };

            let mut message = BitswapMessage::new(false);
            for task in &tasks {
                if !task.data.have_block {
                    message.add_dont_have(task.topic);
                } else if !task.data.is_want_block {
                    message.add_have(task.topic);
                } else {
                    match self.store.get(&task.topic).await {
                        Ok(block) => message.add_block(block),
                        Err(err) => {
                            warn!("failed to load block {}: {:?}", task.topic, err);
                            if task.data.send_dont_have {
                                message.add_dont_have(task.topic);
                            }
                        }
                    }
                }
            }

            if message.is_empty() {
                self.peer_task_queue.tasks_done(&peer, &tasks);
                continue;
            }
            if pending > 0 {
                // more for other workers
                self.work_signal.notify_one();
            }
            trace!(
                "envelope for {}: {} blocks, {} presences, {} bytes pending",
                peer,
                message.blocks_len(),
                message.block_presences().count(),
                pending
            );
            return Some(Envelope {
                peer,
                message,
                tasks,
            });
        }
    }

    async fn block_size(&self, cid: &Cid) -> Option<usize> {
        match self.store.has(cid).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                warn!("failed to check for block {}: {:?}", cid, err);
                return None;
            }
        }
        match self.store.get_size(cid).await {
            Ok(size) => Some(size),
            Err(err) => {
                warn!("failed to get size of block {}: {:?}", cid, err);
                None
            }
        }
    }

    fn block_task(&self, entry: &Entry, block_size: usize) -> Task<Cid, TaskData> {
        let is_want_block =
            entry.want_type == WantType::Block || block_size <= self.config.max_replace_size;
        Task {
            topic: entry.cid,
            priority: entry.priority,
            work: if is_want_block {
                block_size
            } else {
                entry.cid.encoded_len()
            },
            data: TaskData {
                is_want_block,
                send_dont_have: entry.send_dont_have,
                block_size,
                have_block: true,
            },
        }
    }

    fn update_priority(&self, ledger: &Ledger) {
        if let Some(max) = self.config.max_debt_ratio {
            self.peer_task_queue
                .set_deprioritized(ledger.partner(), ledger.debt_ratio() > max);
        }
    }

    fn unregister_wants(&self, peer: &PeerId, cids: &[Cid]) {
        if cids.is_empty() {
            return;
        }
        let mut wanted_by = lock(&self.wanted_by);
        for cid in cids {
            if let Some(peers) = wanted_by.get_mut(cid) {
                peers.remove(peer);
                if peers.is_empty() {
                    wanted_by.remove(cid);
                }
            }
        }
    }

    fn ledger(&self, peer: &PeerId) -> Option<Arc<Mutex<Ledger>>> {
        self.ledgers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }

    fn find_or_create(&self, peer: &PeerId) -> Arc<Mutex<Ledger>> {
        if let Some(ledger) = self.ledger(peer) {
            return ledger;
        }
        self.ledgers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(*peer)
            .or_insert_with(|| Arc::new(Mutex::new(Ledger::new(*peer))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_utils::create_block;
    use crate::test_utils::MemoryStore;

    fn engine(store: &MemoryStore) -> Engine<MemoryStore> {
        Engine::new(
            store.clone(),
            Config {
                max_replace_size: 0,
                ..Default::default()
            },
        )
    }

    fn want_message(entries: &[Entry]) -> BitswapMessage {
        let mut message = BitswapMessage::new(false);
        for entry in entries {
            message.push_entry(*entry);
        }
        message
    }

    async fn next(engine: &Engine<MemoryStore>) -> Envelope {
        let shutdown = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), engine.next_envelope(&shutdown))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_want_block_is_answered() {
        let store = MemoryStore::default();
        let block = create_block(&b"hello"[..]);
        store.put(block.clone()).await.unwrap();
        let engine = engine(&store);
        let peer = PeerId::random();
        engine.peer_connected(&peer);

        let message = want_message(&[Entry::want(*block.cid(), 10, WantType::Block)]);
        engine.message_received(&peer, &message).await;
        assert_eq!(engine.wantlist_for_peer(&peer).len(), 1);

        let envelope = next(&engine).await;
        assert_eq!(envelope.peer, peer);
        assert_eq!(envelope.message.blocks().next(), Some(&block));

        engine.message_sent(&peer, &envelope.message);
        engine.tasks_done(&peer, &envelope.tasks);
        assert!(engine.wantlist_for_peer(&peer).is_empty());
        let receipt = engine.ledger_for_peer(&peer).unwrap();
        assert_eq!(receipt.sent, 5);
        assert_eq!(receipt.exchanged, 2);
    }

    #[tokio::test]
    async fn test_new_block_keeps_debtor_behind() {
        let store = MemoryStore::default();
        let engine = Engine::new(
            store.clone(),
            Config {
                max_replace_size: 0,
                max_debt_ratio: Some(1.0),
                ..Default::default()
            },
        );
        let (debtor, creditor) = (PeerId::random(), PeerId::random());
        engine.peer_connected(&debtor);
        engine.peer_connected(&creditor);

        // both want a block we do not have yet, nothing gets queued
        let late = create_block(&b"late"[..]);
        let message = want_message(&[Entry::want(*late.cid(), 10, WantType::Block)]);
        engine.message_received(&debtor, &message).await;
        engine.message_received(&creditor, &message).await;

        // the debtor took a lot and gave nothing
        let mut served = BitswapMessage::new(false);
        served.add_block(create_block(&b"twenty bytes of data"[..]));
        engine.message_sent(&debtor, &served);
        assert!(engine.ledger_for_peer(&debtor).unwrap().value > 1.0);

        store.put(late.clone()).await.unwrap();
        engine.notify_new_blocks(&[late.clone()]);

        let first = next(&engine).await;
        assert_eq!(first.peer, creditor);
        engine.message_sent(&creditor, &first.message);
        engine.tasks_done(&creditor, &first.tasks);
        let second = next(&engine).await;
        assert_eq!(second.peer, debtor);
        assert_eq!(second.message.blocks().next(), Some(&late));
    }

    #[tokio::test]
    async fn test_want_have_and_dont_have() {
        let store = MemoryStore::default();
        let present = create_block(&b"present"[..]);
        let missing = create_block(&b"missing"[..]);
        store.put(present.clone()).await.unwrap();
        let engine = engine(&store);
        let peer = PeerId::random();

        let message = want_message(&[
            Entry::want(*present.cid(), 10, WantType::Have),
            Entry::want(*missing.cid(), 5, WantType::Block).with_send_dont_have(true),
        ]);
        engine.message_received(&peer, &message).await;

        let envelope = next(&engine).await;
        assert_eq!(envelope.message.blocks_len(), 0);
        assert_eq!(
            envelope.message.haves().collect::<Vec<_>>(),
            vec![present.cid()]
        );
        assert_eq!(
            envelope.message.dont_haves().collect::<Vec<_>>(),
            vec![missing.cid()]
        );

        engine.message_sent(&peer, &envelope.message);
        engine.tasks_done(&peer, &envelope.tasks);
        // the DONT_HAVE want is kept and answered once the block shows up
        assert_eq!(engine.wantlist_for_peer(&peer).len(), 1);
        store.put(missing.clone()).await.unwrap();
        engine.notify_new_blocks(&[missing.clone()]);
        let envelope = next(&engine).await;
        assert_eq!(envelope.message.blocks().next(), Some(&missing));
    }

    #[tokio::test]
    async fn test_cancel_removes_task() {
        let store = MemoryStore::default();
        let block = create_block(&b"hello"[..]);
        store.put(block.clone()).await.unwrap();
        let engine = engine(&store);
        let peer = PeerId::random();

        let want = want_message(&[Entry::want(*block.cid(), 10, WantType::Block)]);
        engine.message_received(&peer, &want).await;
        assert_eq!(engine.stats().num_pending, 1);

        let cancel = want_message(&[Entry::cancel(*block.cid())]);
        engine.message_received(&peer, &cancel).await;
        assert_eq!(engine.stats().num_pending, 0);
        assert!(engine.wantlist_for_peer(&peer).is_empty());
    }

    #[tokio::test]
    async fn test_full_wantlist_replaces() {
        let store = MemoryStore::default();
        let a = create_block(&b"a"[..]);
        let b = create_block(&b"b"[..]);
        store.put(a.clone()).await.unwrap();
        store.put(b.clone()).await.unwrap();
        let engine = engine(&store);
        let peer = PeerId::random();

        let first = want_message(&[Entry::want(*a.cid(), 10, WantType::Block)]);
        engine.message_received(&peer, &first).await;

        let mut full = want_message(&[Entry::want(*b.cid(), 10, WantType::Block)]);
        full.set_full(true);
        engine.message_received(&peer, &full).await;

        let wants: Vec<_> = engine
            .wantlist_for_peer(&peer)
            .into_iter()
            .map(|e| e.cid)
            .collect();
        assert_eq!(wants, vec![*b.cid()]);
        let envelope = next(&engine).await;
        assert_eq!(envelope.message.blocks().next(), Some(&b));
        assert_eq!(envelope.message.blocks_len(), 1);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let store = MemoryStore::default();
        let blocks: Vec<_> = (0..3u8).map(|i| create_block(vec![i; 10])).collect();
        for block in &blocks {
            store.put(block.clone()).await.unwrap();
        }
        let engine = Engine::new(
            store.clone(),
            Config {
                target_message_size: 1,
                ..Default::default()
            },
        );
        let peer = PeerId::random();
        let message = want_message(&[
            Entry::want(*blocks[0].cid(), 1, WantType::Block),
            Entry::want(*blocks[1].cid(), 3, WantType::Block),
            Entry::want(*blocks[2].cid(), 2, WantType::Block),
        ]);
        engine.message_received(&peer, &message).await;

        let mut order = Vec::new();
        for _ in 0..3 {
            let envelope = next(&engine).await;
            order.push(*envelope.message.blocks().next().unwrap().cid());
            engine.tasks_done(&peer, &envelope.tasks);
        }
        assert_eq!(
            order,
            vec![*blocks[1].cid(), *blocks[2].cid(), *blocks[0].cid()]
        );
    }

    #[tokio::test]
    async fn test_debtor_served_last() {
        let store = MemoryStore::default();
        let blocks: Vec<_> = (0..2u8).map(|i| create_block(vec![i; 100])).collect();
        for block in &blocks {
            store.put(block.clone()).await.unwrap();
        }
        let engine = Engine::new(
            store.clone(),
            Config {
                target_message_size: 1,
                max_debt_ratio: Some(1.0),
                ..Default::default()
            },
        );
        let (debtor, fair) = (PeerId::random(), PeerId::random());

        // the debtor already got a block and gave nothing back
        engine.message_received(&debtor, &BitswapMessage::new(true)).await;
        let mut sent = BitswapMessage::new(false);
        sent.add_block(blocks[0].clone());
        engine.message_sent(&debtor, &sent);

        let want = want_message(&[Entry::want(*blocks[1].cid(), 1, WantType::Block)]);
        engine.message_received(&debtor, &want).await;
        engine.message_received(&fair, &want).await;

        let envelope = next(&engine).await;
        assert_eq!(envelope.peer, fair);
    }

    #[tokio::test]
    async fn test_disconnect_drops_ledger() {
        let store = MemoryStore::default();
        let block = create_block(&b"hello"[..]);
        let engine = engine(&store);
        let peer = PeerId::random();
        engine.peer_connected(&peer);
        engine.peer_connected(&peer);

        let want = want_message(&[Entry::want(*block.cid(), 1, WantType::Block)]);
        engine.message_received(&peer, &want).await;

        engine.peer_disconnected(&peer);
        assert!(engine.ledger_for_peer(&peer).is_some());
        engine.peer_disconnected(&peer);
        assert!(engine.ledger_for_peer(&peer).is_none());
        assert!(engine.peers().is_empty());

        // a block arriving now wakes nobody
        engine.notify_new_blocks(&[block]);
        assert_eq!(engine.stats().num_pending, 0);
    }
}
