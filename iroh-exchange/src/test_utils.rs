//! In-memory doubles for the transport, content routing and the block store.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use libp2p_identity::PeerId;

use crate::message::BitswapMessage;
use crate::network::{ContentRouting, Delegate, MessageSender, Network};
use crate::{Bitswap, Block, Config, Store};

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met in time");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blocks: Arc<RwLock<AHashMap<Cid, Block>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.blocks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_size(&self, cid: &Cid) -> Result<usize> {
        self.get(cid).await.map(|b| b.len())
    }

    async fn get(&self, cid: &Cid) -> Result<Block> {
        self.blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .cloned()
            .ok_or_else(|| anyhow!("block {} not found", cid))
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(cid))
    }

    async fn put(&self, block: Block) -> Result<()> {
        self.blocks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(*block.cid(), block);
        Ok(())
    }
}

/// Content routing with a fixed set of providers for every key.
#[derive(Debug, Default)]
pub struct StaticRouting {
    providers: Vec<PeerId>,
    provided: Mutex<Vec<Cid>>,
}

impl StaticRouting {
    pub fn new(providers: Vec<PeerId>) -> Self {
        StaticRouting {
            providers,
            provided: Default::default(),
        }
    }

    /// Keys announced so far, in order.
    pub fn provided(&self) -> Vec<Cid> {
        lock(&self.provided).clone()
    }
}

#[async_trait]
impl ContentRouting for StaticRouting {
    async fn find_providers(
        &self,
        _cid: Cid,
        max_results: usize,
        _timeout: Duration,
    ) -> Result<BoxStream<'static, PeerId>> {
        let providers: Vec<_> = self.providers.iter().take(max_results).copied().collect();
        Ok(stream::iter(providers).boxed())
    }

    async fn provide(&self, cid: Cid) -> Result<()> {
        lock(&self.provided).push(cid);
        Ok(())
    }
}

/// A transport that records everything sent through it and never answers.
#[derive(Debug)]
pub struct RecordingNetwork {
    self_id: PeerId,
    state: Arc<Mutex<Recorded>>,
}

#[derive(Debug, Default)]
struct Recorded {
    messages: AHashMap<PeerId, Vec<BitswapMessage>>,
    failing: AHashSet<PeerId>,
    closed: usize,
    resets: usize,
}

impl Default for RecordingNetwork {
    fn default() -> Self {
        RecordingNetwork {
            self_id: PeerId::random(),
            state: Default::default(),
        }
    }
}

impl RecordingNetwork {
    /// Makes dialing and sending to `peer` fail until reset.
    pub fn set_failing(&self, peer: PeerId, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing.insert(peer);
        } else {
            state.failing.remove(&peer);
        }
    }

    pub fn messages_to(&self, peer: &PeerId) -> Vec<BitswapMessage> {
        lock(&self.state)
            .messages
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// Distinct keys wanted from `peer` across all messages, sorted.
    pub fn wants_sent_to(&self, peer: &PeerId) -> Vec<Cid> {
        self.entries_sent_to(peer, false)
    }

    /// Distinct keys cancelled at `peer` across all messages, sorted.
    pub fn cancels_sent_to(&self, peer: &PeerId) -> Vec<Cid> {
        self.entries_sent_to(peer, true)
    }

    fn entries_sent_to(&self, peer: &PeerId, cancels: bool) -> Vec<Cid> {
        let mut cids: Vec<_> = self
            .messages_to(peer)
            .iter()
            .flat_map(|m| m.wantlist().filter(|e| e.is_cancel() == cancels).map(|e| e.cid))
            .collect::<AHashSet<_>>()
            .into_iter()
            .collect();
        cids.sort();
        cids
    }

    /// Number of senders closed gracefully.
    pub fn closed(&self) -> usize {
        lock(&self.state).closed
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }
}

#[async_trait]
impl Network for RecordingNetwork {
    fn self_id(&self) -> PeerId {
        self.self_id
    }

    async fn connect(&self, peer: PeerId, _timeout: Duration) -> Result<()> {
        if lock(&self.state).failing.contains(&peer) {
            bail!("failed to dial {}", peer);
        }
        Ok(())
    }

    async fn open_sender(&self, peer: PeerId) -> Result<Box<dyn MessageSender>> {
        if lock(&self.state).failing.contains(&peer) {
            bail!("failed to open stream to {}", peer);
        }
        Ok(Box::new(RecordingSender {
            peer,
            state: self.state.clone(),
        }))
    }
}

#[derive(Debug)]
struct RecordingSender {
    peer: PeerId,
    state: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&mut self, message: BitswapMessage) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failing.contains(&self.peer) {
            bail!("stream to {} broke", self.peer);
        }
        state.messages.entry(self.peer).or_default().push(message);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        lock(&self.state).closed += 1;
        Ok(())
    }

    fn reset(&mut self) {
        lock(&self.state).resets += 1;
    }
}

/// A running node attached to a [`VirtualNetwork`].
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: PeerId,
    pub bitswap: Bitswap<MemoryStore>,
    pub store: MemoryStore,
}

/// An in-process network connecting any number of [`Bitswap`] nodes.
///
/// Doubles as the content routing system, provider records are shared by all
/// nodes.
#[derive(Debug, Clone, Default)]
pub struct VirtualNetwork {
    hub: Arc<Mutex<Hub>>,
}

#[derive(Debug, Default)]
struct Hub {
    nodes: AHashMap<PeerId, Bitswap<MemoryStore>>,
    connections: AHashSet<(PeerId, PeerId)>,
    failing: AHashSet<PeerId>,
    providers: AHashMap<Cid, Vec<PeerId>>,
    delivered: AHashMap<PeerId, usize>,
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl VirtualNetwork {
    /// Starts a node that is not connected to anyone.
    pub fn instance(&self, config: Config) -> Instance {
        let id = PeerId::random();
        let node = Arc::new(NodeNetwork {
            id,
            hub: self.hub.clone(),
        });
        let store = MemoryStore::default();
        let bitswap = Bitswap::new(node.clone(), node, store.clone(), config);
        lock(&self.hub).nodes.insert(id, bitswap.clone());
        Instance { id, bitswap, store }
    }

    /// Starts `n` nodes, all connected to each other.
    pub async fn instances(&self, n: usize, config: Config) -> Vec<Instance> {
        let instances: Vec<_> = (0..n).map(|_| self.instance(config.clone())).collect();
        for (i, a) in instances.iter().enumerate() {
            for b in &instances[i + 1..] {
                self.connect(a.id, b.id)
                    .expect("fresh nodes can always connect");
            }
        }
        for instance in &instances {
            wait_until(|| instance.bitswap.peers().len() == n - 1).await;
        }
        instances
    }

    /// Connects two nodes, notifying both sides on the first connection.
    pub fn connect(&self, a: PeerId, b: PeerId) -> Result<()> {
        let nodes = {
            let mut hub = lock(&self.hub);
            if hub.failing.contains(&a) || hub.failing.contains(&b) {
                bail!("failed to connect {} and {}", a, b);
            }
            let (Some(node_a), Some(node_b)) = (hub.nodes.get(&a), hub.nodes.get(&b)) else {
                bail!("unknown peer");
            };
            let (node_a, node_b) = (node_a.clone(), node_b.clone());
            hub.connections.insert(link(a, b)).then_some((node_a, node_b))
        };
        if let Some((node_a, node_b)) = nodes {
            node_a.on_peer_connected(b);
            node_b.on_peer_connected(a);
        }
        Ok(())
    }

    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let nodes = {
            let mut hub = lock(&self.hub);
            if !hub.connections.remove(&link(a, b)) {
                return;
            }
            (hub.nodes.get(&a).cloned(), hub.nodes.get(&b).cloned())
        };
        if let (Some(node_a), Some(node_b)) = nodes {
            node_a.on_peer_disconnected(b);
            node_b.on_peer_disconnected(a);
        }
    }

    /// Makes every dial and send involving `peer` fail.
    pub fn set_failing(&self, peer: PeerId, failing: bool) {
        let mut hub = lock(&self.hub);
        if failing {
            hub.failing.insert(peer);
        } else {
            hub.failing.remove(&peer);
        }
    }

    /// Number of messages delivered to `peer` so far.
    pub fn messages_delivered_to(&self, peer: &PeerId) -> usize {
        lock(&self.hub).delivered.get(peer).copied().unwrap_or_default()
    }

    pub fn providers_of(&self, cid: &Cid) -> Vec<PeerId> {
        lock(&self.hub)
            .providers
            .get(cid)
            .cloned()
            .unwrap_or_default()
    }
}

/// The view a single node has of the [`VirtualNetwork`].
#[derive(Debug)]
struct NodeNetwork {
    id: PeerId,
    hub: Arc<Mutex<Hub>>,
}

impl NodeNetwork {
    fn network(&self) -> VirtualNetwork {
        VirtualNetwork {
            hub: self.hub.clone(),
        }
    }
}

#[async_trait]
impl Network for NodeNetwork {
    fn self_id(&self) -> PeerId {
        self.id
    }

    async fn connect(&self, peer: PeerId, _timeout: Duration) -> Result<()> {
        self.network().connect(self.id, peer)
    }

    async fn open_sender(&self, peer: PeerId) -> Result<Box<dyn MessageSender>> {
        let hub = lock(&self.hub);
        if hub.failing.contains(&peer) || !hub.connections.contains(&link(self.id, peer)) {
            bail!("no connection to {}", peer);
        }
        Ok(Box::new(NodeSender {
            from: self.id,
            to: peer,
            hub: self.hub.clone(),
        }))
    }
}

#[async_trait]
impl ContentRouting for NodeNetwork {
    async fn find_providers(
        &self,
        cid: Cid,
        max_results: usize,
        _timeout: Duration,
    ) -> Result<BoxStream<'static, PeerId>> {
        let providers: Vec<_> = self
            .network()
            .providers_of(&cid)
            .into_iter()
            .filter(|p| *p != self.id)
            .take(max_results)
            .collect();
        Ok(stream::iter(providers).boxed())
    }

    async fn provide(&self, cid: Cid) -> Result<()> {
        let mut hub = lock(&self.hub);
        let providers = hub.providers.entry(cid).or_default();
        if !providers.contains(&self.id) {
            providers.push(self.id);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct NodeSender {
    from: PeerId,
    to: PeerId,
    hub: Arc<Mutex<Hub>>,
}

#[async_trait]
impl MessageSender for NodeSender {
    async fn send(&mut self, message: BitswapMessage) -> Result<()> {
        let target = {
            let mut hub = lock(&self.hub);
            if hub.failing.contains(&self.to)
                || hub.failing.contains(&self.from)
                || !hub.connections.contains(&link(self.from, self.to))
            {
                bail!("stream to {} broke", self.to);
            }
            *hub.delivered.entry(self.to).or_default() += 1;
            hub.nodes.get(&self.to).cloned()
        };
        match target {
            Some(target) => {
                target.on_message(self.from, message);
                Ok(())
            }
            None => bail!("unknown peer {}", self.to),
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::test_utils::create_block;

    #[tokio::test]
    async fn test_virtual_network_delivers() {
        let net = VirtualNetwork::default();
        let instances = net.instances(2, Config::default()).await;
        let (a, b) = (&instances[0], &instances[1]);

        let block = create_block(&b"ping"[..]);
        let mut message = BitswapMessage::new(false);
        message.add_have(*block.cid());
        let mut sender = NodeNetwork {
            id: a.id,
            hub: net.hub.clone(),
        }
        .open_sender(b.id)
        .await
        .unwrap();
        sender.send(message).await.unwrap();

        assert_eq!(net.messages_delivered_to(&b.id), 1);
        wait_until(|| b.bitswap.stat().messages_received == 1).await;

        net.set_failing(b.id, true);
        assert!(sender.send(BitswapMessage::new(true)).await.is_err());
        assert!(net.connect(a.id, PeerId::random()).is_err());

        for instance in &instances {
            instance.bitswap.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::default();
        let block = create_block(&b"stored"[..]);
        assert!(!store.has(block.cid()).await.unwrap());
        assert!(store.get(block.cid()).await.is_err());

        store.put(block.clone()).await.unwrap();
        assert!(store.has(block.cid()).await.unwrap());
        assert_eq!(store.get_size(block.cid()).await.unwrap(), 6);
        assert_eq!(store.len(), 1);
    }
}
