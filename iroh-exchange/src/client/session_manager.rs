use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use ahash::AHashMap;
use cid::Cid;
use libp2p_identity::PeerId;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::block::Block;
use crate::metrics::Metrics;

use super::provider_query_manager::ProviderQueryManager;
use super::session::{Config, Session};
use super::want_manager::WantManager;

/// Creates sessions and routes incoming blocks and presences to them.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    want_manager: WantManager,
    provider_query_manager: ProviderQueryManager,
    metrics: Arc<Metrics>,
    sessions: RwLock<AHashMap<u64, Session>>,
    session_index: AtomicU64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: Config,
        want_manager: WantManager,
        provider_query_manager: ProviderQueryManager,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        SessionManager {
            inner: Arc::new(Inner {
                config,
                want_manager,
                provider_query_manager,
                metrics,
                sessions: Default::default(),
                session_index: AtomicU64::new(1),
                tasks: TaskTracker::new(),
                shutdown,
            }),
        }
    }

    /// Starts a session bound to `ctx`.
    ///
    /// A `one_shot` session closes itself after its first request completed.
    pub fn new_session(&self, ctx: &CancellationToken, one_shot: bool) -> Session {
        let id = self.inner.session_index.fetch_add(1, Ordering::SeqCst);
        let (session, actor) = Session::new(
            id,
            self.inner.config.clone(),
            self.inner.want_manager.clone(),
            self.inner.provider_query_manager.clone(),
            self.inner.metrics.clone(),
            ctx,
            self.inner.shutdown.clone(),
            one_shot,
        );
        self.inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, session.clone());

        let this = self.clone();
        self.inner.tasks.spawn(async move {
            actor.run().await;
            this.remove_session(id);
        });
        session
    }

    fn remove_session(&self, id: u64) {
        let removed = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        if removed.is_some() {
            debug!("session {} removed", id);
        }
    }

    fn interested_sessions(&self, cid: &Cid) -> Vec<Session> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.interested_in(cid))
            .cloned()
            .collect()
    }

    /// Hands `block` to every session interested in it, returns how many there were.
    pub fn receive_block_from(&self, from: Option<PeerId>, block: &Block) -> usize {
        let sessions = self.interested_sessions(block.cid());
        for session in &sessions {
            session.receive_block_from(from, block.clone());
        }
        sessions.len()
    }

    /// Lets interested sessions account for a block that may be a duplicate.
    pub fn update_receive_counters(&self, cid: &Cid) {
        for session in self.interested_sessions(cid) {
            session.update_receive_counters(cid);
        }
    }

    pub fn receive_presences(&self, from: PeerId, haves: &[Cid], dont_haves: &[Cid]) {
        let sessions = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for session in sessions {
            let haves: Vec<_> = haves
                .iter()
                .filter(|c| session.interested_in(c))
                .copied()
                .collect();
            let dont_haves: Vec<_> = dont_haves
                .iter()
                .filter(|c| session.interested_in(c))
                .copied()
                .collect();
            if !haves.is_empty() || !dont_haves.is_empty() {
                session.receive_presences(from, haves, dont_haves);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Waits for all session actors to finish, the shutdown token must be cancelled first.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}
