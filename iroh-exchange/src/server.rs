use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use self::decision::{Config as DecisionConfig, Engine, Envelope};
pub use self::ledger::Receipt;
use crate::block::Block;
use crate::client::peer_manager::PeerManager;
use crate::message::BitswapMessage;
use crate::metrics::Metrics;
use crate::network::ContentRouting;
use crate::Store;

mod decision;
mod ledger;
mod task_merger;

#[derive(Debug, Clone)]
pub struct Config {
    /// Workers turning queued tasks into messages.
    pub task_worker_count: usize,
    /// Responses that may be in flight at once, across all peers.
    pub max_outstanding_sends: usize,
    /// Whether or not to announce new blocks to content routing.
    pub provide_enabled: bool,
    pub has_block_buffer_size: usize,
    pub provide_keys_buffer_size: usize,
    /// Concurrent provide calls.
    pub provide_worker_max: usize,
    pub provide_timeout: Duration,
    pub decision: DecisionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            task_worker_count: 8,
            max_outstanding_sends: 256,
            provide_enabled: true,
            has_block_buffer_size: 256,
            provide_keys_buffer_size: 2048,
            provide_worker_max: 512,
            provide_timeout: Duration::from_secs(15),
            decision: DecisionConfig::default(),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub peers: Vec<PeerId>,
    pub provide_buf_len: usize,
    pub blocks_sent: u64,
    pub data_sent: u64,
}

/// Answers the wants of other peers.
#[derive(Debug)]
pub struct Server<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for Server<S> {
    fn clone(&self) -> Self {
        Server {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<S: Store> {
    /// Decision engine for which who to send which blocks to.
    engine: Arc<Engine<S>>,
    metrics: Arc<Metrics>,
    /// Newly added blocks, to be announced. `None` when providing is disabled.
    new_blocks: Option<mpsc::Sender<Cid>>,
    /// Keys buffered between the collector and the provide workers.
    provide_buffered: Arc<AtomicUsize>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl<S: Store> Server<S> {
    pub fn new(
        peer_manager: PeerManager,
        routing: Arc<dyn ContentRouting>,
        store: S,
        config: Config,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let engine = Arc::new(Engine::new(store, config.decision.clone()));
        let tasks = TaskTracker::new();
        let provide_buffered = Arc::new(AtomicUsize::new(0));

        // start up workers to handle requests from other nodes for the data on this node
        let sends = Arc::new(Semaphore::new(config.max_outstanding_sends));
        for _ in 0..config.task_worker_count {
            tasks.spawn(task_worker(
                engine.clone(),
                peer_manager.clone(),
                sends.clone(),
                metrics.clone(),
                tasks.clone(),
                shutdown.clone(),
            ));
        }

        let new_blocks = if config.provide_enabled {
            let (new_blocks, new_blocks_receiver) = mpsc::channel(config.has_block_buffer_size);
            let (provide_keys, provide_keys_receiver) =
                mpsc::channel(config.provide_keys_buffer_size);
            tasks.spawn(provide_collector(
                new_blocks_receiver,
                provide_keys,
                provide_buffered.clone(),
                shutdown.clone(),
            ));
            tasks.spawn(provide_worker(
                provide_keys_receiver,
                routing,
                Arc::new(Semaphore::new(config.provide_worker_max)),
                config.provide_timeout,
                metrics.clone(),
                tasks.clone(),
                shutdown.clone(),
            ));
            Some(new_blocks)
        } else {
            None
        };

        Server {
            inner: Arc::new(Inner {
                engine,
                metrics,
                new_blocks,
                provide_buffered,
                tasks,
                shutdown,
            }),
        }
    }

    pub fn ledger_for_peer(&self, peer: &PeerId) -> Option<Receipt> {
        self.inner.engine.ledger_for_peer(peer)
    }

    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        self.inner
            .engine
            .wantlist_for_peer(peer)
            .into_iter()
            .map(|e| e.cid)
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.engine.peers()
    }

    pub fn stat(&self) -> Stat {
        let provide_buf_len = self.inner.provide_buffered.load(Ordering::Relaxed);
        Stat {
            peers: self.peers(),
            provide_buf_len,
            blocks_sent: self.inner.metrics.blocks_sent.get(),
            data_sent: self.inner.metrics.data_sent.get(),
        }
    }

    pub async fn receive_message(&self, peer: &PeerId, message: &BitswapMessage) {
        self.inner.engine.message_received(peer, message).await;
    }

    /// Serves the new blocks to peers waiting for them and announces them.
    pub async fn notify_new_blocks(&self, blocks: &[Block]) {
        self.inner.engine.notify_new_blocks(blocks);

        let Some(ref new_blocks) = self.inner.new_blocks else {
            return;
        };
        for block in blocks {
            tokio::select! {
                biased;

                _ = self.inner.shutdown.cancelled() => return,
                res = new_blocks.send(*block.cid()) => {
                    if res.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        self.inner.engine.peer_connected(peer);
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.engine.peer_disconnected(peer);
    }

    /// Waits for all workers, the shutdown token must be cancelled first.
    pub async fn stop(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

async fn task_worker<S: Store>(
    engine: Arc<Engine<S>>,
    peer_manager: PeerManager,
    sends: Arc<Semaphore>,
    metrics: Arc<Metrics>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            permit = sends.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let Some(Envelope {
            peer,
            message,
            tasks: sent_tasks,
        }) = engine.next_envelope(&shutdown).await
        else {
            break;
        };

        let (ack, ack_receiver) = oneshot::channel();
        peer_manager.send_response(&peer, message.clone(), ack);

        // the permit is held until the queue reports back
        let engine = engine.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let sent = tokio::select! {
                biased;

                _ = shutdown.cancelled() => false,
                sent = ack_receiver => sent.unwrap_or(false),
            };
            if sent {
                engine.message_sent(&peer, &message);
                metrics.blocks_sent.inc_by(message.blocks_len() as u64);
                metrics.data_sent.inc_by(message.blocks_size() as u64);
            } else {
                trace!("response to {} was not delivered", peer);
            }
            engine.tasks_done(&peer, &sent_tasks);
            drop(permit);
        });
    }
}

/// Buffers new keys without bound so `notify_new_blocks` never waits on slow providing.
async fn provide_collector(
    mut new_blocks: mpsc::Receiver<Cid>,
    provide_keys: mpsc::Sender<Cid>,
    buffered: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    let mut queue = VecDeque::new();
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            permit = provide_keys.reserve(), if !queue.is_empty() => {
                let Ok(permit) = permit else {
                    break;
                };
                if let Some(cid) = queue.pop_front() {
                    permit.send(cid);
                }
            }
            cid = new_blocks.recv() => match cid {
                Some(cid) => queue.push_back(cid),
                None => break,
            },
        }
        buffered.store(queue.len(), Ordering::Relaxed);
    }
    debug!("provide collector stopped");
}

async fn provide_worker(
    mut provide_keys: mpsc::Receiver<Cid>,
    routing: Arc<dyn ContentRouting>,
    limit: Arc<Semaphore>,
    provide_timeout: Duration,
    metrics: Arc<Metrics>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let cid = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            cid = provide_keys.recv() => match cid {
                Some(cid) => cid,
                None => break,
            },
        };
        let permit = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let routing = routing.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {}
                res = tokio::time::timeout(provide_timeout, routing.provide(cid)) => match res {
                    Ok(Ok(())) => {
                        metrics.provides.inc();
                        debug!("provided {}", cid);
                    }
                    Ok(Err(err)) => warn!("failed to provide {}: {:?}", cid, err),
                    Err(_) => warn!("providing {} timed out", cid),
                },
            }
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_utils::create_block;
    use crate::client::message_queue::Config as MessageQueueConfig;
    use crate::message::{Entry, WantType};
    use crate::test_utils::{wait_until, MemoryStore, RecordingNetwork, StaticRouting};

    struct Harness {
        network: Arc<RecordingNetwork>,
        routing: Arc<StaticRouting>,
        peer_manager: PeerManager,
        store: MemoryStore,
        server: Server<MemoryStore>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    }

    fn harness(config: Config) -> Harness {
        let network = Arc::new(RecordingNetwork::default());
        let routing = Arc::new(StaticRouting::default());
        let metrics = Arc::new(Metrics::default());
        let shutdown = CancellationToken::new();
        let peer_manager = PeerManager::new(
            network.clone(),
            MessageQueueConfig::default(),
            metrics.clone(),
            shutdown.child_token(),
        );
        let store = MemoryStore::default();
        let server = Server::new(
            peer_manager.clone(),
            routing.clone(),
            store.clone(),
            config,
            metrics.clone(),
            shutdown.clone(),
        );
        Harness {
            network,
            routing,
            peer_manager,
            store,
            server,
            metrics,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_serves_wanted_block() {
        let h = harness(Config::default());
        let peer = PeerId::random();
        h.peer_manager
            .connected(peer, &Default::default());
        h.server.peer_connected(&peer);

        let block = create_block(&b"hello"[..]);
        h.store.put(block.clone()).await.unwrap();
        let mut want = BitswapMessage::new(false);
        want.push_entry(Entry::want(*block.cid(), 1, WantType::Block));
        h.server.receive_message(&peer, &want).await;

        wait_until(|| h.metrics.blocks_sent.get() == 1).await;
        let sent = h.network.messages_to(&peer);
        assert_eq!(sent.last().unwrap().blocks().next(), Some(&block));
        assert_eq!(h.server.stat().data_sent, 5);
        assert_eq!(h.server.ledger_for_peer(&peer).unwrap().sent, 5);
        assert!(h.server.wantlist_for_peer(&peer).is_empty());

        h.shutdown.cancel();
        h.server.stop().await;
    }

    #[tokio::test]
    async fn test_new_block_wakes_waiting_peer_and_is_provided() {
        let h = harness(Config::default());
        let peer = PeerId::random();
        h.peer_manager.connected(peer, &Default::default());
        h.server.peer_connected(&peer);

        let block = create_block(&b"later"[..]);
        let mut want = BitswapMessage::new(false);
        want.push_entry(Entry::want(*block.cid(), 1, WantType::Block));
        h.server.receive_message(&peer, &want).await;
        assert_eq!(h.server.wantlist_for_peer(&peer), vec![*block.cid()]);

        h.store.put(block.clone()).await.unwrap();
        h.server.notify_new_blocks(&[block.clone()]).await;

        wait_until(|| h.metrics.blocks_sent.get() == 1).await;
        wait_until(|| h.metrics.provides.get() == 1).await;
        assert_eq!(h.routing.provided(), vec![*block.cid()]);

        h.shutdown.cancel();
        h.server.stop().await;
    }

    #[tokio::test]
    async fn test_unconnected_peer_gets_nothing() {
        let h = harness(Config {
            provide_enabled: false,
            ..Default::default()
        });
        let peer = PeerId::random();

        let block = create_block(&b"hello"[..]);
        h.store.put(block.clone()).await.unwrap();
        let mut want = BitswapMessage::new(false);
        want.push_entry(Entry::want(*block.cid(), 1, WantType::Block));
        h.server.receive_message(&peer, &want).await;

        // the response has no queue to go to, the want stays
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.metrics.blocks_sent.get(), 0);
        assert_eq!(h.server.wantlist_for_peer(&peer), vec![*block.cid()]);

        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), h.server.stop())
            .await
            .unwrap();
    }
}
