//! A bitswap style block exchange engine.
//!
//! Fetches content addressed blocks from peers that have them, and serves the
//! blocks we hold to peers that want them. The transport, the block store and
//! content routing are supplied by the caller through [`Network`], [`Store`]
//! and [`ContentRouting`].

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::client::{Client, Config as ClientConfig};
use self::server::{Config as ServerConfig, Server};

mod block;
pub mod client;
mod error;
mod message;
mod metrics;
mod network;
pub mod peer_task_queue;
pub mod server;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use self::block::Block;
pub use self::client::{BlockReceiver, Session, SessionState};
pub use self::error::{Error, MalformedReason};
pub use self::message::{
    Action, BitswapMessage, BlockPresence, BlockPresenceType, Entry, Priority, WantType,
};
pub use self::metrics::Metrics;
pub use self::network::{ContentRouting, Delegate, MessageSender, Network};
pub use self::server::Receipt;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
}

/// The local block store.
#[async_trait]
pub trait Store: Debug + Clone + Send + Sync + 'static {
    async fn get_size(&self, cid: &Cid) -> Result<usize>;
    async fn get(&self, cid: &Cid) -> Result<Block>;
    async fn has(&self, cid: &Cid) -> Result<bool>;
    async fn put(&self, block: Block) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub wantlist: Vec<Cid>,
    pub peers: Vec<PeerId>,
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub messages_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
    pub provide_buf_len: usize,
}

#[derive(Debug)]
enum InboundEvent {
    Message(PeerId, BitswapMessage),
    Error(PeerId, anyhow::Error),
    Connected(PeerId),
    Disconnected(PeerId),
}

#[derive(Debug)]
pub struct Bitswap<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for Bitswap<S> {
    fn clone(&self) -> Self {
        Bitswap {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<S: Store> {
    self_id: PeerId,
    client: Client<S>,
    server: Server<S>,
    store: S,
    metrics: Arc<Metrics>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    inbound_loop: Mutex<Option<JoinHandle<()>>>,
    /// Signals all workers to stop, always cancelled before `ctx`.
    shutdown: CancellationToken,
    ctx: CancellationToken,
}

impl<S: Store> Bitswap<S> {
    /// Starts the engine, must be called from within a tokio runtime.
    pub fn new(
        network: Arc<dyn Network>,
        routing: Arc<dyn ContentRouting>,
        store: S,
        config: Config,
    ) -> Self {
        let self_id = network.self_id();
        let metrics = Arc::new(Metrics::default());
        let shutdown = CancellationToken::new();
        let ctx = CancellationToken::new();

        let client = Client::new(
            network,
            routing.clone(),
            store.clone(),
            config.client,
            metrics.clone(),
            shutdown.clone(),
            &ctx,
        );
        let server = Server::new(
            client.peer_manager().clone(),
            routing,
            store.clone(),
            config.server,
            metrics.clone(),
            shutdown.clone(),
        );

        let (inbound, inbound_receiver) = mpsc::unbounded_channel();
        let inbound_loop = tokio::task::spawn(inbound_loop(
            inbound_receiver,
            client.clone(),
            server.clone(),
            metrics.clone(),
            shutdown.clone(),
        ));
        debug!("bitswap {} started", self_id);

        Bitswap {
            inner: Arc::new(Inner {
                self_id,
                client,
                server,
                store,
                metrics,
                inbound,
                inbound_loop: Mutex::new(Some(inbound_loop)),
                shutdown,
                ctx,
            }),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    pub fn client(&self) -> &Client<S> {
        &self.inner.client
    }

    pub fn server(&self) -> &Server<S> {
        &self.inner.server
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed.into());
        }
        Ok(())
    }

    /// Fetches a single block, waiting until it arrives or `ctx` is cancelled.
    pub async fn get_block(&self, ctx: &CancellationToken, cid: &Cid) -> Result<Block> {
        self.inner.client.get_block(ctx, cid).await
    }

    /// Fetches `keys`, yielding blocks in the order they arrive.
    pub async fn get_blocks(&self, ctx: &CancellationToken, keys: &[Cid]) -> Result<BlockReceiver> {
        self.inner.client.get_blocks(ctx, keys).await
    }

    /// Starts a session for related requests, closed when `ctx` is cancelled.
    pub fn new_session(&self, ctx: &CancellationToken) -> Result<Session> {
        self.inner.client.new_session(ctx)
    }

    /// Adds a locally produced block, serving and announcing it.
    pub async fn has_block(&self, block: Block) -> Result<()> {
        self.ensure_open()?;
        self.inner.store.put(block.clone()).await?;
        self.notify_new_blocks(&[block]).await
    }

    /// Announces blocks that already are in the store.
    pub async fn notify_new_blocks(&self, blocks: &[Block]) -> Result<()> {
        self.ensure_open()?;
        self.inner.client.notify_new_blocks(blocks);
        self.inner.server.notify_new_blocks(blocks).await;
        Ok(())
    }

    /// The wants `peer` sent us, or our own wantlist when `peer` is us.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        if *peer == self.inner.self_id {
            return self.get_wantlist();
        }
        self.inner.server.wantlist_for_peer(peer)
    }

    pub fn ledger_for_peer(&self, peer: &PeerId) -> Option<Receipt> {
        self.inner.server.ledger_for_peer(peer)
    }

    pub fn get_wantlist(&self) -> Vec<Cid> {
        self.inner.client.get_wantlist()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.server.peers()
    }

    pub fn stat(&self) -> Stat {
        let client = self.inner.client.stat();
        let server = self.inner.server.stat();
        Stat {
            wantlist: client.wantlist,
            peers: server.peers,
            blocks_received: client.blocks_received,
            data_received: client.data_received,
            dup_blks_received: client.dup_blks_received,
            dup_data_received: client.dup_data_received,
            messages_received: client.messages_received,
            blocks_sent: server.blocks_sent,
            data_sent: server.data_sent,
            provide_buf_len: server.provide_buf_len,
        }
    }

    pub fn is_online(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Shuts everything down and waits for it, later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let inbound_loop = self
            .inner
            .inbound_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(inbound_loop) = inbound_loop {
            inbound_loop.await?;
        }
        let client = self.inner.client.stop();
        let server = self.inner.server.stop();
        futures::future::join(client, server).await;

        self.inner.ctx.cancel();
        debug!("bitswap {} closed", self.inner.self_id);
        Ok(())
    }
}

impl<S: Store> Delegate for Bitswap<S> {
    fn on_message(&self, peer: PeerId, message: BitswapMessage) {
        let _ = self.inner.inbound.send(InboundEvent::Message(peer, message));
    }

    fn on_error(&self, peer: PeerId, error: anyhow::Error) {
        let _ = self.inner.inbound.send(InboundEvent::Error(peer, error));
    }

    fn on_peer_connected(&self, peer: PeerId) {
        let _ = self.inner.inbound.send(InboundEvent::Connected(peer));
    }

    fn on_peer_disconnected(&self, peer: PeerId) {
        let _ = self.inner.inbound.send(InboundEvent::Disconnected(peer));
    }
}

/// Applies inbound events one at a time, in the order they were delivered.
async fn inbound_loop<S: Store>(
    mut events: mpsc::UnboundedReceiver<InboundEvent>,
    client: Client<S>,
    server: Server<S>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            InboundEvent::Message(peer, message) => {
                metrics.messages_received.inc();
                if let Err(err) = message.validate() {
                    warn!("discarding message from {}: {}", peer, err);
                    metrics.messages_malformed.inc();
                    continue;
                }
                server.receive_message(&peer, &message).await;
                let new_blocks = client.receive_message(&peer, &message).await;
                if !new_blocks.is_empty() {
                    server.notify_new_blocks(&new_blocks).await;
                }
            }
            InboundEvent::Error(peer, err) => {
                warn!("failed to read message from {}: {:?}", peer, err);
                metrics.messages_malformed.inc();
            }
            InboundEvent::Connected(peer) => {
                client.peer_connected(&peer);
                server.peer_connected(&peer);
            }
            InboundEvent::Disconnected(peer) => {
                client.peer_disconnected(&peer).await;
                server.peer_disconnected(&peer);
            }
        }
    }
    debug!("inbound loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use super::*;
    use crate::block::test_utils::{create_block, create_blocks};
    use crate::test_utils::{Instance, VirtualNetwork};

    fn assert_send<T: Send>() {}

    #[test]
    fn test_traits() {
        assert_send::<Bitswap<crate::test_utils::MemoryStore>>();
        assert_send::<&Bitswap<crate::test_utils::MemoryStore>>();
    }

    fn timeout_ctx(duration: Duration) -> CancellationToken {
        let ctx = CancellationToken::new();
        let child = ctx.clone();
        tokio::task::spawn(async move {
            tokio::time::sleep(duration).await;
            child.cancel();
        });
        ctx
    }

    async fn collect(mut receiver: BlockReceiver) -> Vec<Block> {
        let mut blocks = Vec::new();
        while let Some(block) = receiver.recv().await {
            blocks.push(block);
        }
        blocks
    }

    async fn close_all(instances: &[Instance]) {
        for instance in instances {
            instance.bitswap.close().await.unwrap();
        }
    }

    fn sorted_cids(blocks: &[Block]) -> Vec<Cid> {
        let mut cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();
        cids.sort();
        cids
    }

    #[tokio::test]
    #[traced_test]
    async fn test_get_block_from_peer() {
        let net = VirtualNetwork::default();
        let instances = net.instances(2, Config::default()).await;
        let (a, b) = (&instances[0], &instances[1]);

        let block = create_block(Bytes::from_static(b"hello"));
        a.bitswap.has_block(block.clone()).await.unwrap();

        let ctx = timeout_ctx(Duration::from_secs(5));
        let received = b.bitswap.get_block(&ctx, block.cid()).await.unwrap();
        assert_eq!(received, block);
        assert_eq!(received.data().as_ref(), b"hello");

        crate::test_utils::wait_until(|| a.bitswap.stat().data_sent == 5).await;
        assert_eq!(a.bitswap.stat().blocks_sent, 1);
        assert_eq!(b.bitswap.stat().blocks_received, 1);
        assert!(a.bitswap.ledger_for_peer(&b.id).unwrap().sent >= 5);

        close_all(&instances).await;
    }

    #[tokio::test]
    async fn test_get_blocks_stream_every_block_once() {
        let net = VirtualNetwork::default();
        let instances = net.instances(2, Config::default()).await;
        let (a, b) = (&instances[0], &instances[1]);

        let blocks = create_blocks(20);
        for block in &blocks {
            a.bitswap.has_block(block.clone()).await.unwrap();
        }
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();

        let ctx = timeout_ctx(Duration::from_secs(10));
        let received = collect(b.bitswap.get_blocks(&ctx, &cids).await.unwrap()).await;
        assert_eq!(sorted_cids(&received), sorted_cids(&blocks));

        close_all(&instances).await;
    }

    #[tokio::test]
    async fn test_get_blocks_prefers_local_store() {
        let net = VirtualNetwork::default();
        let instances = net.instances(1, Config::default()).await;
        let a = &instances[0];

        let block = create_block(&b"local"[..]);
        a.bitswap.has_block(block.clone()).await.unwrap();
        let ctx = CancellationToken::new();
        let received = collect(a.bitswap.get_blocks(&ctx, &[*block.cid()]).await.unwrap()).await;
        assert_eq!(received, vec![block]);
        assert!(a.bitswap.get_wantlist().is_empty());

        close_all(&instances).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_session_between_peers() {
        let net = VirtualNetwork::default();
        let instances = net.instances(10, Config::default()).await;
        let blocks = create_blocks(101);

        // the first peer has everything
        for block in &blocks {
            instances[0].bitswap.has_block(block.clone()).await.unwrap();
        }
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();

        let ctx = timeout_ctx(Duration::from_secs(10));
        let session = instances[1].bitswap.new_session(&ctx).unwrap();

        let first = session.get_block(&ctx, &cids[0]).await.unwrap();
        assert_eq!(first, blocks[0]);
        let mut received = vec![first];
        for chunk in cids[1..].chunks(10) {
            received.extend(collect(session.get_blocks(&ctx, chunk).unwrap()).await);
        }
        assert_eq!(sorted_cids(&received), sorted_cids(&blocks));

        // once the session learned who has the blocks, the others only saw
        // the initial broadcast and its cancel
        for instance in &instances[2..] {
            assert!(
                net.messages_delivered_to(&instance.id) <= 2,
                "{} got too many messages",
                instance.id
            );
        }

        close_all(&instances).await;
    }

    #[tokio::test]
    async fn test_split_fetch_from_two_peers() {
        let net = VirtualNetwork::default();
        let instances = net.instances(3, Config::default()).await;
        let blocks = create_blocks(10);
        for (i, block) in blocks.iter().enumerate() {
            instances[i % 2].bitswap.has_block(block.clone()).await.unwrap();
        }
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();

        let ctx = timeout_ctx(Duration::from_secs(10));
        let session = instances[2].bitswap.new_session(&ctx).unwrap();
        let received = collect(session.get_blocks(&ctx, &cids).unwrap()).await;
        assert_eq!(sorted_cids(&received), sorted_cids(&blocks));

        close_all(&instances).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fetch_not_connected_provider() {
        let net = VirtualNetwork::default();
        let mut config = Config::default();
        config.client.session.provider_search_delay = Duration::from_millis(10);
        let provider = net.instance(config.clone());
        let requester = net.instance(config);

        let blocks = create_blocks(5);
        for block in &blocks {
            provider.bitswap.has_block(block.clone()).await.unwrap();
        }
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();
        crate::test_utils::wait_until(|| {
            cids.iter().all(|c| net.providers_of(c).contains(&provider.id))
        })
        .await;

        // not connected, the provider is only found through content routing
        let ctx = timeout_ctx(Duration::from_secs(10));
        let session = requester.bitswap.new_session(&ctx).unwrap();
        let received = collect(session.get_blocks(&ctx, &cids).unwrap()).await;
        assert_eq!(sorted_cids(&received), sorted_cids(&blocks));
        assert!(session.peers().contains(&provider.id));

        close_all(&[provider, requester]).await;
    }

    #[tokio::test]
    async fn test_put_after_interest_cache_evict() {
        let net = VirtualNetwork::default();
        let instances = net.instances(2, Config::default()).await;
        let (a, b) = (&instances[0], &instances[1]);

        let blocks = create_blocks(2049);
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();

        let ctx = timeout_ctx(Duration::from_secs(20));
        let session = b.bitswap.new_session(&ctx).unwrap();
        let receiver = session.get_blocks(&ctx, &cids).unwrap();

        // the first want is live and survives the overflow
        crate::test_utils::wait_until(|| session.live_wants().contains(&cids[0])).await;
        assert!(session.interested_in(&cids[0]));
        assert!(session.interest_len() <= 2048);

        for block in &blocks {
            a.bitswap.has_block(block.clone()).await.unwrap();
        }
        let received = collect(receiver).await;
        assert_eq!(received.len(), 2049);
        assert_eq!(sorted_cids(&received), sorted_cids(&blocks));

        close_all(&instances).await;
    }

    #[tokio::test]
    async fn test_put_after_session_cancelled() {
        let net = VirtualNetwork::default();
        let instances = net.instances(2, Config::default()).await;
        let (a, b) = (&instances[0], &instances[1]);
        let blocks = create_blocks(3);
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();

        let ctx = CancellationToken::new();
        let session = b.bitswap.new_session(&ctx).unwrap();
        let mut receiver = session.get_blocks(&ctx, &cids).unwrap();
        crate::test_utils::wait_until(|| a.bitswap.wantlist_for_peer(&b.id).len() == 3).await;

        ctx.cancel();
        assert!(receiver.recv().await.is_none());
        crate::test_utils::wait_until(|| b.bitswap.get_wantlist().is_empty()).await;
        crate::test_utils::wait_until(|| a.bitswap.wantlist_for_peer(&b.id).is_empty()).await;

        // blocks arriving now are stored by nobody and delivered to nobody
        for block in &blocks {
            a.bitswap.has_block(block.clone()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(b.bitswap.stat().blocks_received, 0);
        assert!(session.is_closed());

        close_all(&instances).await;
    }

    #[tokio::test]
    async fn test_multiple_sessions_overlapping() {
        let net = VirtualNetwork::default();
        let instances = net.instances(3, Config::default()).await;
        let (a, b) = (&instances[0], &instances[1]);
        let blocks = create_blocks(12);
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();

        let ctx = timeout_ctx(Duration::from_secs(10));
        let first = b.bitswap.new_session(&ctx).unwrap();
        let second = b.bitswap.new_session(&ctx).unwrap();
        let r1 = first.get_blocks(&ctx, &cids[..8]).unwrap();
        let r2 = second.get_blocks(&ctx, &cids[4..]).unwrap();

        for block in &blocks {
            a.bitswap.has_block(block.clone()).await.unwrap();
        }
        let (got1, got2) = tokio::join!(collect(r1), collect(r2));
        assert_eq!(sorted_cids(&got1), sorted_cids(&blocks[..8]));
        assert_eq!(sorted_cids(&got2), sorted_cids(&blocks[4..]));

        // broadcast wants were retracted at the uninvolved peer
        crate::test_utils::wait_until(|| {
            instances[2].bitswap.wantlist_for_peer(&b.id).is_empty()
        })
        .await;
        assert!(net.messages_delivered_to(&instances[2].id) <= 4 * blocks.len());

        close_all(&instances).await;
    }

    #[tokio::test]
    async fn test_wantlist_clears_only_when_unused() {
        let net = VirtualNetwork::default();
        let instances = net.instances(2, Config::default()).await;
        let b = &instances[1];
        let blocks = create_blocks(2);
        let cids: Vec<_> = blocks.iter().map(|b| *b.cid()).collect();

        let ctx1 = CancellationToken::new();
        let ctx2 = CancellationToken::new();
        let s1 = b.bitswap.new_session(&ctx1).unwrap();
        let s2 = b.bitswap.new_session(&ctx2).unwrap();
        let _r1 = s1.get_blocks(&ctx1, &cids).unwrap();
        let _r2 = s2.get_blocks(&ctx2, &cids[..1]).unwrap();
        crate::test_utils::wait_until(|| b.bitswap.get_wantlist().len() == 2).await;
        crate::test_utils::wait_until(|| {
            instances[0].bitswap.wantlist_for_peer(&b.id).len() == 2
        })
        .await;

        ctx1.cancel();
        crate::test_utils::wait_until(|| b.bitswap.get_wantlist() == vec![cids[0]]).await;
        // the remote peer sees the cancel too
        crate::test_utils::wait_until(|| {
            instances[0].bitswap.wantlist_for_peer(&b.id) == vec![cids[0]]
        })
        .await;

        ctx2.cancel();
        crate::test_utils::wait_until(|| b.bitswap.get_wantlist().is_empty()).await;

        close_all(&instances).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unreachable_peer_does_not_block() {
        let net = VirtualNetwork::default();
        let mut config = Config::default();
        config.client.message_queue.send_error_backoff = Duration::from_millis(1);
        config.client.session.provider_search_delay = Duration::from_millis(20);
        config.client.session.base_tick_delay = Duration::from_millis(20);

        // the requester only knows a peer that fails every send
        let instances = net.instances(2, config.clone()).await;
        let (broken, requester) = (&instances[0], &instances[1]);
        net.set_failing(broken.id, true);

        let good = net.instance(config);
        let block = create_block(&b"resilient"[..]);
        good.bitswap.has_block(block.clone()).await.unwrap();
        crate::test_utils::wait_until(|| net.providers_of(block.cid()).contains(&good.id)).await;

        let ctx = timeout_ctx(Duration::from_secs(10));
        let received = requester.bitswap.get_block(&ctx, block.cid()).await.unwrap();
        assert_eq!(received, block);
        crate::test_utils::wait_until(|| requester.bitswap.metrics().messages_dropped.get() >= 1)
            .await;

        close_all(&instances).await;
        good.bitswap.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_message_is_discarded() {
        let net = VirtualNetwork::default();
        let instances = net.instances(1, Config::default()).await;
        let a = &instances[0];

        let block = create_block(&b"x"[..]);
        let mut message = BitswapMessage::new(false);
        message.add_block(block.clone());
        message.cancel(*block.cid());
        a.bitswap.on_message(PeerId::random(), message);
        a.bitswap.on_message(PeerId::random(), BitswapMessage::new(false));

        crate::test_utils::wait_until(|| a.bitswap.metrics().messages_malformed.get() == 2).await;
        assert_eq!(a.bitswap.stat().messages_received, 2);
        assert_eq!(a.bitswap.stat().blocks_received, 0);

        close_all(&instances).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_close() {
        let net = VirtualNetwork::default();
        let instances = net.instances(2, Config::default()).await;
        let b = &instances[1];
        let block = create_block(&b"never"[..]);

        let ctx = CancellationToken::new();
        let pending = {
            let bitswap = b.bitswap.clone();
            let cid = *block.cid();
            let ctx = ctx.clone();
            tokio::task::spawn(async move { bitswap.get_block(&ctx, &cid).await })
        };
        crate::test_utils::wait_until(|| b.bitswap.get_wantlist().len() == 1).await;

        b.bitswap.close().await.unwrap();
        assert!(!b.bitswap.is_online());
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Closed));

        let err = b.bitswap.get_block(&ctx, block.cid()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Closed));
        let err = b.bitswap.has_block(block.clone()).await.unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::Closed));
        assert!(b.bitswap.new_session(&ctx).is_err());
        assert_eq!(b.bitswap.client().session_count(), 0);
        b.bitswap.close().await.unwrap();

        close_all(&instances[..1]).await;
    }
}
