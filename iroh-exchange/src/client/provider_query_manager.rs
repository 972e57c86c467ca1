use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use cid::Cid;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::network::{ContentRouting, Network};

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of providers requested per query.
    pub max_providers: usize,
    /// Upper bound for a single query, including dialing the providers.
    pub find_provider_timeout: Duration,
    /// Maximum number of queries running concurrently.
    pub max_in_process_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_providers: 3,
            find_provider_timeout: Duration::from_secs(10),
            max_in_process_requests: 6,
        }
    }
}

/// Manages requests to find more providers for blocks for bitswap sessions.
///
/// Concurrent requests for the same `Cid` share a single query.
#[derive(Debug, Clone)]
pub struct ProviderQueryManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    in_progress: Mutex<AHashMap<Cid, InProgress>>,
    routing: Arc<dyn ContentRouting>,
    network: Arc<dyn Network>,
    config: Config,
    limiter: Arc<Semaphore>,
    metrics: Arc<Metrics>,
    next_id: AtomicU64,
    ctx: CancellationToken,
}

#[derive(Debug)]
struct InProgress {
    query_id: u64,
    /// Providers found so far, replayed to late listeners.
    providers: Vec<PeerId>,
    listeners: AHashMap<u64, mpsc::UnboundedSender<PeerId>>,
    /// Cancelled when the query ends, for whatever reason.
    done: CancellationToken,
}

impl ProviderQueryManager {
    pub fn new(
        routing: Arc<dyn ContentRouting>,
        network: Arc<dyn Network>,
        config: Config,
        metrics: Arc<Metrics>,
        ctx: CancellationToken,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_in_process_requests.max(1)));
        ProviderQueryManager {
            inner: Arc::new(Inner {
                in_progress: Default::default(),
                routing,
                network,
                config,
                limiter,
                metrics,
                next_id: AtomicU64::new(0),
                ctx,
            }),
        }
    }

    /// Streams connected providers for `cid` until the query ends or `ctx` is cancelled.
    pub fn find_providers_async(
        &self,
        cid: Cid,
        ctx: &CancellationToken,
    ) -> mpsc::UnboundedReceiver<PeerId> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listener_id = self.inner.next_id();

        let done = {
            let mut in_progress = self.inner.lock();
            match in_progress.get_mut(&cid) {
                Some(query) => {
                    for provider in &query.providers {
                        let _ = sender.send(*provider);
                    }
                    query.listeners.insert(listener_id, sender.clone());
                    query.done.clone()
                }
                None => {
                    let query_id = self.inner.next_id();
                    let done = self.inner.ctx.child_token();
                    in_progress.insert(
                        cid,
                        InProgress {
                            query_id,
                            providers: Vec::new(),
                            listeners: std::iter::once((listener_id, sender.clone())).collect(),
                            done: done.clone(),
                        },
                    );
                    tokio::task::spawn(self.clone().run_query(cid, query_id, done.clone()));
                    done
                }
            }
        };

        let this = self.clone();
        let ctx = ctx.clone();
        tokio::task::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = sender.closed() => {}
                _ = done.cancelled() => {}
            }
            this.remove_listener(&cid, listener_id);
        });

        receiver
    }

    fn remove_listener(&self, cid: &Cid, listener_id: u64) {
        let mut in_progress = self.inner.lock();
        let Some(query) = in_progress.get_mut(cid) else {
            return;
        };
        if query.listeners.remove(&listener_id).is_none() {
            return;
        }
        if query.listeners.is_empty() {
            debug!("provider_query_manager: no listeners left for {}", cid);
            query.done.cancel();
            in_progress.remove(cid);
        }
    }

    async fn run_query(self, cid: Cid, query_id: u64, done: CancellationToken) {
        let _permit = tokio::select! {
            _ = done.cancelled() => return self.finish(&cid, query_id, &done),
            permit = self.inner.limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.finish(&cid, query_id, &done),
            },
        };

        let timeout = self.inner.config.find_provider_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        self.inner.metrics.provider_queries.inc();
        let found = tokio::select! {
            _ = done.cancelled() => return self.finish(&cid, query_id, &done),
            _ = &mut deadline => return self.finish(&cid, query_id, &done),
            found = self.inner.routing.find_providers(cid, self.inner.config.max_providers, timeout) => found,
        };
        let mut providers = match found {
            Ok(providers) => providers,
            Err(err) => {
                warn!("provider_query_manager: failed to find providers for {}: {:?}", cid, err);
                return self.finish(&cid, query_id, &done);
            }
        };

        let mut seen = AHashSet::new();
        let mut connecting = FuturesUnordered::new();
        let mut stream_done = false;
        loop {
            if stream_done && connecting.is_empty() {
                break;
            }
            tokio::select! {
                biased;

                _ = done.cancelled() => break,
                _ = &mut deadline => {
                    debug!("provider_query_manager: query for {} timed out", cid);
                    break;
                }
                Some((provider, res)) = connecting.next(), if !connecting.is_empty() => {
                    match res {
                        Ok(()) => self.publish(&cid, provider),
                        Err(err) => debug!("provider_query_manager: failed to connect to {}: {:?}", provider, err),
                    }
                }
                provider = providers.next(), if !stream_done => {
                    match provider {
                        Some(provider) => {
                            if provider == self.inner.network.self_id() || !seen.insert(provider) {
                                continue;
                            }
                            let network = self.inner.network.clone();
                            connecting.push(async move {
                                (provider, network.connect(provider, timeout).await)
                            });
                        }
                        None => stream_done = true,
                    }
                }
            }
        }

        self.finish(&cid, query_id, &done);
    }

    fn publish(&self, cid: &Cid, provider: PeerId) {
        let mut in_progress = self.inner.lock();
        if let Some(query) = in_progress.get_mut(cid) {
            query.providers.push(provider);
            for listener in query.listeners.values() {
                let _ = listener.send(provider);
            }
        }
    }

    /// Forgets the query, later requests start a fresh one.
    fn finish(&self, cid: &Cid, query_id: u64, done: &CancellationToken) {
        let mut in_progress = self.inner.lock();
        if matches!(in_progress.get(cid), Some(q) if q.query_id == query_id) {
            in_progress.remove(cid);
        }
        done.cancel();
    }

    #[cfg(test)]
    fn in_progress_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, AHashMap<Cid, InProgress>> {
        self.in_progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
