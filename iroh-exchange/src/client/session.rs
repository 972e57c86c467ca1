use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use cid::Cid;
use libp2p_identity::PeerId;
use lru::LruCache;
use rand::seq::IteratorRandom;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::block::Block;
use crate::error::Error;
use crate::metrics::Metrics;

use super::provider_query_manager::ProviderQueryManager;
use super::session_peer_manager::SessionPeerManager;
use super::want_manager::WantManager;

mod notifier;
mod request_splitter;

use self::notifier::Notifier;
use self::request_splitter::RequestSplitter;

#[derive(Debug, Clone)]
pub struct Config {
    /// Delay before the first provider search, gives broadcast wants a chance.
    pub provider_search_delay: Duration,
    /// Base delay between rebroadcasts of unanswered wants.
    pub base_tick_delay: Duration,
    /// Interval for periodic provider searches while wants are outstanding.
    pub rebroadcast_delay: Duration,
    /// Number of `Cid`s a session remembers being interested in.
    pub interest_cache_size: usize,
    /// Live wants while no peers are known.
    pub broadcast_live_wants_limit: usize,
    /// Live wants once peers are known.
    pub targeted_live_wants_limit: usize,
    pub max_optimized_peers: usize,
    /// Unproven peers mixed into every split request.
    pub reserve_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider_search_delay: Duration::from_secs(1),
            base_tick_delay: Duration::from_millis(500),
            rebroadcast_delay: Duration::from_secs(60),
            interest_cache_size: 2048,
            broadcast_live_wants_limit: 4,
            targeted_live_wants_limit: 32,
            max_optimized_peers: 32,
            reserve_peers: 2,
        }
    }
}

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    /// Wants outstanding, no peers known yet.
    Discovering,
    /// Wants outstanding, peers known.
    Requesting,
    /// Everything received.
    Draining,
    Closed,
}

/// Blocks of a `get_blocks` call, in the order they arrive.
pub type BlockReceiver = mpsc::Receiver<Block>;

/// A scoped, cancellable retrieval context.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: u64,
    ops: mpsc::UnboundedSender<Op>,
    wants: Mutex<SessionWants>,
    notifier: Notifier,
    peers: SessionPeerManager,
    /// Cancelled by the caller, or by the session itself once it is done.
    ctx: CancellationToken,
    /// Engine wide shutdown.
    shutdown: CancellationToken,
    /// Close once the first `get_blocks` call completed.
    one_shot: bool,
}

#[derive(Debug)]
enum Op {
    Want(Vec<Cid>),
    Cancel(Vec<Cid>),
    Receive {
        from: Option<PeerId>,
        block: Block,
    },
    Presences {
        from: PeerId,
        haves: Vec<Cid>,
        dont_haves: Vec<Cid>,
    },
}

#[derive(Debug)]
struct SessionWants {
    interest: LruCache<Cid, ()>,
    /// Sent wants and when they were (re)sent.
    live: AHashMap<Cid, Instant>,
    to_fetch: VecDeque<Cid>,
    queued: AHashSet<Cid>,
    /// Received blocks, later copies are duplicates.
    past: LruCache<Cid, ()>,
    splitter: RequestSplitter,
    total_latency: Duration,
    fetch_count: u32,
    closed: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        config: Config,
        want_manager: WantManager,
        provider_query_manager: ProviderQueryManager,
        metrics: Arc<Metrics>,
        ctx: &CancellationToken,
        shutdown: CancellationToken,
        one_shot: bool,
    ) -> (Self, SessionActor) {
        let (ops_sender, ops_receiver) = mpsc::unbounded_channel();
        let capacity = NonZeroUsize::new(config.interest_cache_size).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(Inner {
            id,
            ops: ops_sender,
            wants: Mutex::new(SessionWants {
                interest: LruCache::new(capacity),
                live: Default::default(),
                to_fetch: Default::default(),
                queued: Default::default(),
                past: LruCache::new(capacity),
                splitter: RequestSplitter::default(),
                total_latency: Duration::ZERO,
                fetch_count: 0,
                closed: false,
            }),
            notifier: Notifier::default(),
            peers: SessionPeerManager::new(config.max_optimized_peers, config.reserve_peers),
            ctx: ctx.child_token(),
            shutdown,
            one_shot,
        });
        metrics.sessions_created.inc();

        let actor = SessionActor {
            session: inner.clone(),
            ops: ops_receiver,
            config,
            want_manager,
            provider_query_manager,
            metrics,
        };
        (Session { inner }, actor)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        let wants = self.inner.lock();
        if wants.closed {
            SessionState::Closed
        } else if wants.live.is_empty() && wants.queued.is_empty() {
            if wants.fetch_count > 0 {
                SessionState::Draining
            } else {
                SessionState::Created
            }
        } else if self.inner.peers.has_peers() {
            SessionState::Requesting
        } else {
            SessionState::Discovering
        }
    }

    /// Fetches a single block through this session.
    pub async fn get_block(&self, ctx: &CancellationToken, cid: &Cid) -> Result<Block> {
        let mut blocks = self.get_blocks(ctx, &[*cid])?;
        match blocks.recv().await {
            Some(block) => Ok(block),
            None => Err(self.inner.stop_reason().into()),
        }
    }

    /// Requests `keys`, the returned channel yields the blocks in completion order.
    ///
    /// Cancelling `ctx` ends the stream and retracts the wants no one else in
    /// this session is waiting for.
    pub fn get_blocks(&self, ctx: &CancellationToken, keys: &[Cid]) -> Result<BlockReceiver> {
        self.fetch(ctx, keys, Vec::new())
    }

    /// Like [`Session::get_blocks`], with `preloaded` blocks handed out first.
    pub(crate) fn fetch(
        &self,
        ctx: &CancellationToken,
        keys: &[Cid],
        preloaded: Vec<Block>,
    ) -> Result<BlockReceiver> {
        if self.inner.ctx.is_cancelled() {
            return Err(self.inner.stop_reason().into());
        }

        // request order decides want order and priority
        let mut remaining = AHashSet::with_capacity(keys.len());
        let wanted: Vec<Cid> = keys
            .iter()
            .copied()
            .filter(|cid| remaining.insert(*cid))
            .collect();
        let (sender, receiver) = mpsc::channel((remaining.len() + preloaded.len()).max(1));
        for block in preloaded {
            // capacity covers every preloaded block
            let _ = sender.try_send(block);
        }
        if remaining.is_empty() {
            if self.inner.one_shot {
                self.inner.ctx.cancel();
            }
            return Ok(receiver);
        }

        let (sub_id, subscription) = self.inner.notifier.subscribe(&wanted);
        if self.inner.ops.send(Op::Want(wanted)).is_err() {
            self.inner.notifier.unsubscribe(sub_id);
            return Err(self.inner.stop_reason().into());
        }

        tokio::task::spawn(forward_blocks(
            self.inner.clone(),
            ctx.clone(),
            sub_id,
            subscription,
            remaining,
            sender,
        ));
        Ok(receiver)
    }

    /// Whether blocks for `cid` should be routed to this session.
    pub fn interested_in(&self, cid: &Cid) -> bool {
        let wants = self.inner.lock();
        !wants.closed && (wants.interest.contains(cid) || wants.is_wanted(cid))
    }

    pub fn receive_block_from(&self, from: Option<PeerId>, block: Block) {
        let _ = self.inner.ops.send(Op::Receive { from, block });
    }

    pub fn receive_presences(&self, from: PeerId, haves: Vec<Cid>, dont_haves: Vec<Cid>) {
        let _ = self.inner.ops.send(Op::Presences {
            from,
            haves,
            dont_haves,
        });
    }

    /// Accounts for a block that arrived from the network, before it is routed.
    pub fn update_receive_counters(&self, cid: &Cid) {
        let mut wants = self.inner.lock();
        if wants.past.contains(cid) {
            wants.splitter.record_duplicate_block();
        }
    }

    /// Wants that were sent and not yet answered.
    pub fn live_wants(&self) -> Vec<Cid> {
        self.inner.lock().live.keys().copied().collect()
    }

    pub fn interest_len(&self) -> usize {
        self.inner.lock().interest.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.peers()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes the session, retracting all of its wants.
    pub fn close(&self) {
        self.inner.ctx.cancel();
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionWants> {
        self.wants.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop_reason(&self) -> Error {
        if self.shutdown.is_cancelled() {
            Error::Closed
        } else {
            Error::Cancelled
        }
    }
}

/// Moves blocks from the session's notifier to a single caller.
async fn forward_blocks(
    session: Arc<Inner>,
    ctx: CancellationToken,
    sub_id: u64,
    mut subscription: mpsc::UnboundedReceiver<Block>,
    mut remaining: AHashSet<Cid>,
    sender: mpsc::Sender<Block>,
) {
    while !remaining.is_empty() {
        tokio::select! {
            biased;

            _ = ctx.cancelled() => break,
            _ = session.ctx.cancelled() => break,
            _ = sender.closed() => break,
            block = subscription.recv() => {
                let Some(block) = block else {
                    break;
                };
                if remaining.remove(block.cid()) && sender.try_send(block).is_err() {
                    break;
                }
            }
        }
    }

    session.notifier.unsubscribe(sub_id);
    if !remaining.is_empty() {
        trace!(
            "session {}: request ended with {} blocks missing",
            session.id,
            remaining.len()
        );
        let _ = session.ops.send(Op::Cancel(remaining.into_iter().collect()));
    }
    if session.one_shot {
        session.ctx.cancel();
    }
}

impl SessionWants {
    fn is_wanted(&self, cid: &Cid) -> bool {
        self.live.contains_key(cid) || self.queued.contains(cid)
    }

    /// Adds `cid` to the interest cache, evicting the oldest entry that is not a live want.
    fn record_interest(&mut self, cid: Cid) {
        if self.interest.contains(&cid) {
            return;
        }
        let mut skips = self.interest.len();
        while self.interest.len() >= self.interest.cap().get() {
            let Some((oldest, ())) = self.interest.pop_lru() else {
                break;
            };
            if skips > 0 && self.live.contains_key(&oldest) {
                skips -= 1;
                self.interest.push(oldest, ());
            }
        }
        self.interest.push(cid, ());
    }

    fn enqueue(&mut self, cid: Cid) {
        self.past.pop(&cid);
        if self.is_wanted(&cid) {
            return;
        }
        self.queued.insert(cid);
        self.to_fetch.push_back(cid);
    }

    fn pop_batch(&mut self, n: usize) -> Vec<Cid> {
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n {
            let Some(cid) = self.to_fetch.pop_front() else {
                break;
            };
            // cancelled entries are left behind in `to_fetch`
            if self.queued.remove(&cid) {
                batch.push(cid);
            }
        }
        batch
    }

    fn average_latency(&self) -> Option<Duration> {
        if self.fetch_count == 0 || self.total_latency.is_zero() {
            return None;
        }
        Some(self.total_latency / self.fetch_count)
    }
}

/// Drives a [`Session`]: turns requests into wants, delivers blocks and rebroadcasts.
#[derive(Debug)]
pub(crate) struct SessionActor {
    session: Arc<Inner>,
    ops: mpsc::UnboundedReceiver<Op>,
    config: Config,
    want_manager: WantManager,
    provider_query_manager: ProviderQueryManager,
    metrics: Arc<Metrics>,
}

impl SessionActor {
    pub(crate) async fn run(mut self) {
        debug!("session {}: started", self.session.id);
        let tick = tokio::time::sleep(self.config.provider_search_delay);
        tokio::pin!(tick);
        let mut rebroadcast = tokio::time::interval_at(
            Instant::now() + self.config.rebroadcast_delay,
            self.config.rebroadcast_delay,
        );

        loop {
            tokio::select! {
                biased;

                _ = self.session.shutdown.cancelled() => break,
                _ = self.session.ctx.cancelled() => break,
                op = self.ops.recv() => {
                    match op {
                        Some(Op::Receive { from, block }) => {
                            self.receive_block(from, block);
                            tick.as_mut().reset(Instant::now() + self.tick_delay());
                        }
                        Some(op) => self.handle(op),
                        None => break,
                    }
                }
                _ = &mut tick => {
                    self.handle_tick();
                    tick.as_mut().reset(Instant::now() + self.tick_delay());
                }
                _ = rebroadcast.tick() => self.handle_rebroadcast(),
            }
        }

        self.close();
    }

    fn id(&self) -> u64 {
        self.session.id
    }

    fn handle(&mut self, op: Op) {
        match op {
            Op::Want(keys) => {
                {
                    let mut wants = self.session.lock();
                    for cid in keys {
                        wants.record_interest(cid);
                        wants.enqueue(cid);
                    }
                }
                self.fill_live_wants();
            }
            Op::Cancel(keys) => {
                let mut cancelled = Vec::new();
                {
                    let mut wants = self.session.lock();
                    for cid in keys {
                        // another request in this session still waits for it
                        if self.session.notifier.has_subscribers(&cid) {
                            continue;
                        }
                        wants.queued.remove(&cid);
                        wants.interest.pop(&cid);
                        if wants.live.remove(&cid).is_some() {
                            cancelled.push(cid);
                        }
                    }
                }
                self.want_manager.cancel_wants(&cancelled, &[], self.id());
                self.fill_live_wants();
            }
            Op::Presences {
                from,
                haves,
                dont_haves,
            } => {
                let (wanted_have, wanted_dont_have) = {
                    let wants = self.session.lock();
                    (
                        haves.iter().any(|c| wants.is_wanted(c)),
                        dont_haves.iter().any(|c| wants.is_wanted(c)),
                    )
                };
                if wanted_have {
                    self.session.peers.add_peer(from);
                }
                if wanted_dont_have {
                    self.session.peers.record_dont_have(&from);
                }
            }
            Op::Receive { from, block } => self.receive_block(from, block),
        }
    }

    fn receive_block(&mut self, from: Option<PeerId>, block: Block) {
        let cid = *block.cid();
        let latency = {
            let mut wants = self.session.lock();
            if !wants.is_wanted(&cid) {
                return;
            }
            wants.splitter.record_unique_block();
            let latency = match wants.live.remove(&cid) {
                Some(sent_at) => {
                    let latency = sent_at.elapsed();
                    wants.total_latency += latency;
                    Some(latency)
                }
                None => {
                    wants.queued.remove(&cid);
                    None
                }
            };
            wants.fetch_count += 1;
            wants.past.push(cid, ());
            latency
        };

        trace!("session {}: received {} from {:?}", self.id(), cid, from);
        if let Some(from) = from {
            self.session.peers.record_peer_response(from, latency);
        }
        self.session.notifier.publish(&block);
        self.want_manager.cancel_wants(&[cid], &[], self.id());
        self.fill_live_wants();
    }

    fn fill_live_wants(&mut self) {
        let limit = if self.session.peers.has_peers() {
            self.config.targeted_live_wants_limit
        } else {
            self.config.broadcast_live_wants_limit
        };
        let batch = {
            let mut wants = self.session.lock();
            let free = limit.saturating_sub(wants.live.len());
            wants.pop_batch(free)
        };
        self.want_blocks(batch);
    }

    fn want_blocks(&mut self, batch: Vec<Cid>) {
        if batch.is_empty() {
            return;
        }
        {
            let mut wants = self.session.lock();
            let now = Instant::now();
            for cid in &batch {
                wants.live.insert(*cid, now);
                wants.record_interest(*cid);
            }
        }

        let peers = self.session.peers.get_optimized_peers();
        if peers.is_empty() {
            self.want_manager.want_blocks(&batch, &[], self.id());
            return;
        }

        let parts = self.session.lock().splitter.split_request(&peers, &batch);
        for part in parts {
            self.want_manager
                .want_blocks(&part.keys, &part.peers, self.id());
            let others: Vec<_> = peers
                .iter()
                .filter(|p| !part.peers.contains(p))
                .copied()
                .collect();
            if !others.is_empty() {
                self.want_manager.want_haves(&part.keys, &others, self.id());
            }
        }
    }

    /// Nothing arrived in time: ask everyone again and look for more providers.
    fn handle_tick(&mut self) {
        let live: Vec<Cid> = {
            let mut wants = self.session.lock();
            let now = Instant::now();
            for sent_at in wants.live.values_mut() {
                *sent_at = now;
            }
            wants.live.keys().copied().collect()
        };
        let Some(first) = live.first().copied() else {
            return;
        };
        debug!(
            "session {}: tick, rebroadcasting {} wants",
            self.id(),
            live.len()
        );
        self.want_manager.want_blocks(&live, &[], self.id());
        self.find_more_peers(first);
    }

    fn handle_rebroadcast(&mut self) {
        let cid = {
            let wants = self.session.lock();
            wants.live.keys().choose(&mut rand::thread_rng()).copied()
        };
        if let Some(cid) = cid {
            self.find_more_peers(cid);
        }
    }

    fn find_more_peers(&self, cid: Cid) {
        let mut providers = self
            .provider_query_manager
            .find_providers_async(cid, &self.session.ctx);
        let peers = self.session.peers.clone();
        let id = self.id();
        tokio::task::spawn(async move {
            while let Some(provider) = providers.recv().await {
                if peers.add_peer(provider) {
                    debug!("session {}: found provider {}", id, provider);
                }
            }
        });
    }

    fn tick_delay(&self) -> Duration {
        let average = self.session.lock().average_latency();
        match average {
            Some(latency) => self.config.base_tick_delay + 3 * latency,
            None => self.config.provider_search_delay,
        }
    }

    fn close(&mut self) {
        let leftovers: Vec<Cid> = {
            let mut wants = self.session.lock();
            wants.closed = true;
            wants.to_fetch.clear();
            wants.queued.clear();
            wants.interest.clear();
            wants.live.drain().map(|(cid, _)| cid).collect()
        };
        self.want_manager.cancel_wants(&leftovers, &[], self.id());
        self.session.ctx.cancel();
        self.session.notifier.shutdown();
        self.metrics.sessions_closed.inc();
        debug!("session {}: closed", self.id());
    }
}
