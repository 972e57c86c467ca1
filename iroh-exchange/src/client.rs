use std::sync::Arc;

use ahash::AHashSet;
use anyhow::Result;
use cid::Cid;
use libp2p_identity::PeerId;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use self::message_queue::Config as MessageQueueConfig;
use self::peer_manager::PeerManager;
use self::provider_query_manager::{Config as ProviderQueryConfig, ProviderQueryManager};
pub use self::session::{BlockReceiver, Config as SessionConfig, Session, SessionState};
use self::session_manager::SessionManager;
use self::want_manager::WantManager;
use crate::block::Block;
use crate::error::Error;
use crate::message::BitswapMessage;
use crate::metrics::Metrics;
use crate::network::{ContentRouting, Network};
use crate::Store;

pub mod message_queue;
pub mod peer_manager;
pub mod provider_query_manager;
mod session;
mod session_manager;
mod session_peer_manager;
pub mod want_manager;
pub mod wantlist;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub message_queue: MessageQueueConfig,
    pub session: SessionConfig,
    pub provider_query: ProviderQueryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub wantlist: Vec<Cid>,
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub messages_received: u64,
}

/// Fetches blocks from other peers.
#[derive(Debug)]
pub struct Client<S: Store> {
    inner: Arc<Inner<S>>,
}

impl<S: Store> Clone for Client<S> {
    fn clone(&self) -> Self {
        Client {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<S: Store> {
    self_id: PeerId,
    peer_manager: PeerManager,
    want_manager: WantManager,
    session_manager: SessionManager,
    store: S,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl<S: Store> Client<S> {
    /// `shutdown` stops the client, `ctx` is the root context everything else derives from.
    pub fn new(
        network: Arc<dyn Network>,
        routing: Arc<dyn ContentRouting>,
        store: S,
        config: Config,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
        ctx: &CancellationToken,
    ) -> Self {
        let self_id = network.self_id();
        let peer_manager = PeerManager::new(
            network.clone(),
            config.message_queue,
            metrics.clone(),
            ctx.child_token(),
        );
        let want_manager = WantManager::new(peer_manager.clone());
        let provider_query_manager = ProviderQueryManager::new(
            routing,
            network,
            config.provider_query,
            metrics.clone(),
            ctx.child_token(),
        );
        let session_manager = SessionManager::new(
            config.session,
            want_manager.clone(),
            provider_query_manager,
            metrics.clone(),
            shutdown.clone(),
        );

        Client {
            inner: Arc::new(Inner {
                self_id,
                peer_manager,
                want_manager,
                session_manager,
                store,
                metrics,
                shutdown,
            }),
        }
    }

    pub(crate) fn peer_manager(&self) -> &PeerManager {
        &self.inner.peer_manager
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Closed.into());
        }
        Ok(())
    }

    /// Returns the block for `cid`, from the local store or the network.
    pub async fn get_block(&self, ctx: &CancellationToken, cid: &Cid) -> Result<Block> {
        self.ensure_open()?;
        if self.inner.store.has(cid).await? {
            return self.inner.store.get(cid).await;
        }
        let session = self.inner.session_manager.new_session(ctx, true);
        session.get_block(ctx, cid).await
    }

    /// Streams the blocks for `keys` as they become available, local ones first.
    pub async fn get_blocks(&self, ctx: &CancellationToken, keys: &[Cid]) -> Result<BlockReceiver> {
        self.ensure_open()?;
        let mut seen = AHashSet::with_capacity(keys.len());
        let mut local = Vec::new();
        let mut missing = Vec::new();
        for cid in keys {
            if !seen.insert(*cid) {
                continue;
            }
            if self.inner.store.has(cid).await? {
                local.push(self.inner.store.get(cid).await?);
            } else {
                missing.push(*cid);
            }
        }
        trace!(
            "get_blocks: {} local, {} from the network",
            local.len(),
            missing.len()
        );
        let session = self.inner.session_manager.new_session(ctx, true);
        session.fetch(ctx, &missing, local)
    }

    pub fn new_session(&self, ctx: &CancellationToken) -> Result<Session> {
        self.ensure_open()?;
        Ok(self.inner.session_manager.new_session(ctx, false))
    }

    /// Hands blocks that were added locally to the sessions waiting for them.
    pub fn notify_new_blocks(&self, blocks: &[Block]) {
        for block in blocks {
            self.inner.session_manager.receive_block_from(None, block);
        }
    }

    /// Processes the blocks and presences of an inbound message.
    ///
    /// Returns the blocks that were wanted and have been stored.
    pub async fn receive_message(&self, peer: &PeerId, message: &BitswapMessage) -> Vec<Block> {
        let haves: Vec<Cid> = message.haves().copied().collect();
        let dont_haves: Vec<Cid> = message.dont_haves().copied().collect();
        if !haves.is_empty() || !dont_haves.is_empty() {
            self.inner
                .session_manager
                .receive_presences(*peer, &haves, &dont_haves);
        }

        let mut wanted = Vec::new();
        for block in message.blocks() {
            let cid = block.cid();
            let have = match self.inner.store.has(cid).await {
                Ok(have) => have,
                Err(err) => {
                    warn!("failed to check for block {}: {:?}", cid, err);
                    false
                }
            };
            if have {
                self.inner.metrics.dup_blocks_received.inc();
                self.inner
                    .metrics
                    .dup_data_received
                    .inc_by(block.len() as u64);
            } else {
                self.inner.metrics.blocks_received.inc();
                self.inner.metrics.data_received.inc_by(block.len() as u64);
            }
            self.inner.session_manager.update_receive_counters(cid);

            if !self.inner.want_manager.is_wanted(cid) {
                trace!("received unwanted block {} from {}", cid, peer);
                continue;
            }
            if let Err(err) = self.inner.store.put(block.clone()).await {
                warn!("failed to store block {}: {:?}", cid, err);
                continue;
            }
            self.inner
                .session_manager
                .receive_block_from(Some(*peer), block);
            wanted.push(block.clone());
        }
        wanted
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        if *peer == self.inner.self_id {
            return;
        }
        self.inner.want_manager.peer_connected(*peer);
    }

    pub async fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.want_manager.peer_disconnected(*peer).await;
    }

    pub fn get_wantlist(&self) -> Vec<Cid> {
        self.inner
            .want_manager
            .current_wants()
            .into_iter()
            .map(|e| e.cid)
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.session_manager.session_count()
    }

    pub fn stat(&self) -> Stat {
        let metrics = &self.inner.metrics;
        Stat {
            wantlist: self.get_wantlist(),
            blocks_received: metrics.blocks_received.get(),
            data_received: metrics.data_received.get(),
            dup_blks_received: metrics.dup_blocks_received.get(),
            dup_data_received: metrics.dup_data_received.get(),
            messages_received: metrics.messages_received.get(),
        }
    }

    /// Stops all sessions and message queues, the shutdown token must be cancelled first.
    pub async fn stop(&self) {
        self.inner.session_manager.shutdown().await;
        self.inner.peer_manager.shutdown().await;
    }
}
