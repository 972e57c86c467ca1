use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use libp2p_identity::PeerId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::wantlist::{self, SessionTrackedWantlist};
use crate::message::{Action, BitswapMessage, Entry};
use crate::metrics::Metrics;
use crate::network::{MessageSender, Network};

#[derive(Debug, Clone)]
pub struct Config {
    /// How often a single message is attempted before it is dropped.
    pub max_retries: usize,
    /// Pause between two send attempts, gives disconnect notifications time to propagate.
    pub send_error_backoff: Duration,
    /// Timeout for dialing the peer before opening a sender.
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_retries: 10,
            send_error_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Observable state of a [`MessageQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing to send.
    Idle,
    /// Work was signalled but not yet picked up.
    Pending,
    /// A message is in flight, including retries.
    Sending,
    /// Shut down or cancelled, nothing will be sent anymore.
    Closed,
}

/// Outbound message scheduling for a single peer.
///
/// Wants are merged into a session tracked wantlist, only net changes end up
/// in the next message. Rapid updates collapse into a single flush.
#[derive(Debug)]
pub struct MessageQueue {
    peer: PeerId,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<Pending>,
    work: mpsc::Sender<()>,
}

#[derive(Debug)]
struct Pending {
    state: QueueState,
    /// Everything the peer should currently consider wanted by us.
    wantlist: SessionTrackedWantlist,
    /// Changes not yet sent, plus any server payload.
    delta: BitswapMessage,
    /// Send the complete wantlist on the next flush.
    full: bool,
    acks: Vec<oneshot::Sender<bool>>,
}

impl MessageQueue {
    pub fn new(
        peer: PeerId,
        network: Arc<dyn Network>,
        config: Config,
        metrics: Arc<Metrics>,
        ctx: CancellationToken,
    ) -> Self {
        let (work_sender, work_receiver) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                state: QueueState::Idle,
                wantlist: Default::default(),
                delta: BitswapMessage::default(),
                full: false,
                acks: Vec::new(),
            }),
            work: work_sender,
        });
        let shutdown = CancellationToken::new();
        metrics.message_queues_created.inc();

        let actor = MessageQueueActor {
            peer,
            config,
            network,
            metrics,
            shared: shared.clone(),
            sender: None,
            work: work_receiver,
            shutdown: shutdown.clone(),
            ctx,
        };
        let worker = tokio::task::spawn(actor.run());

        MessageQueue {
            peer,
            shared,
            shutdown,
            worker: Some(worker),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> QueueState {
        self.shared.lock().state
    }

    /// Merges `entries` on behalf of `session` into the pending message.
    ///
    /// Never blocks on the network.
    pub fn add_message(&self, entries: &[Entry], session: u64) {
        if entries.is_empty() {
            return;
        }
        let mut pending = self.shared.lock();
        if pending.state == QueueState::Closed {
            return;
        }

        let mut changed = false;
        for entry in entries {
            match entry.action {
                Action::Add => {
                    let tracked = wantlist::Entry::new(entry.cid, entry.priority, entry.want_type);
                    if pending.wantlist.add(tracked, session) {
                        pending.delta.add_entry(
                            entry.cid,
                            entry.priority,
                            entry.want_type,
                            entry.send_dont_have,
                        );
                        changed = true;
                    }
                }
                Action::Cancel => {
                    if pending.wantlist.remove(&entry.cid, session) {
                        pending.delta.cancel(entry.cid);
                        changed = true;
                    }
                }
            }
        }

        // a previous message was lost, any activity is a reason to resend
        if changed || pending.full {
            self.shared.signal_work(&mut pending);
        }
    }

    /// Seeds the queue with a complete wantlist, sent as a full message.
    pub fn add_wantlist(&self, initial: &SessionTrackedWantlist) {
        if initial.is_empty() {
            return;
        }
        let mut pending = self.shared.lock();
        if pending.state == QueueState::Closed {
            return;
        }
        pending.wantlist.absorb(initial);
        pending.full = true;
        self.shared.signal_work(&mut pending);
    }

    /// Queues blocks and presences for the peer.
    ///
    /// `ack` receives `true` once the payload was transmitted and `false` if it was dropped.
    pub fn add_response(&self, response: BitswapMessage, ack: oneshot::Sender<bool>) {
        let mut pending = self.shared.lock();
        if pending.state == QueueState::Closed {
            let _ = ack.send(false);
            return;
        }
        pending.delta.merge_payload(response);
        pending.acks.push(ack);
        self.shared.signal_work(&mut pending);
    }

    /// Closes the sender gracefully and waits for the queue's task to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            worker
                .await
                .with_context(|| format!("message queue for {} panicked", self.peer))?;
        }
        Ok(())
    }

    /// Nothing wanted from the peer and nothing left to send.
    pub fn is_drained(&self) -> bool {
        let pending = self.shared.lock();
        matches!(pending.state, QueueState::Idle | QueueState::Closed)
            && pending.wantlist.is_empty()
            && pending.delta.is_empty()
            && pending.acks.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn wants(&self) -> Vec<wantlist::Entry> {
        self.shared.lock().wantlist.entries()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn signal_work(&self, pending: &mut Pending) {
        if pending.state == QueueState::Idle {
            pending.state = QueueState::Pending;
        }
        // a single outstanding signal is enough
        let _ = self.work.try_send(());
    }
}

impl Pending {
    /// Takes the next message, leaving nothing pending.
    fn take(&mut self) -> Option<(BitswapMessage, Vec<oneshot::Sender<bool>>)> {
        let delta = std::mem::take(&mut self.delta);
        let mut message = if self.full {
            self.full = false;
            let mut message = BitswapMessage::new(true);
            for entry in self.wantlist.entries() {
                message.add_entry(entry.cid, entry.priority, entry.want_type, false);
            }
            message.merge_payload(delta);
            message
        } else {
            if delta.is_empty() {
                return None;
            }
            delta
        };
        // a block and a cancel for the same cid never share a message
        for cid in message.take_cancels_for_blocks() {
            self.delta.cancel(cid);
        }
        Some((message, std::mem::take(&mut self.acks)))
    }
}

struct MessageQueueActor {
    peer: PeerId,
    config: Config,
    network: Arc<dyn Network>,
    metrics: Arc<Metrics>,
    shared: Arc<Shared>,
    sender: Option<Box<dyn MessageSender>>,
    work: mpsc::Receiver<()>,
    shutdown: CancellationToken,
    ctx: CancellationToken,
}

enum SendOutcome {
    Sent,
    Dropped,
    Interrupted,
}

impl MessageQueueActor {
    async fn run(mut self) {
        debug!("message_queue:{}: started", self.peer);
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    if let Some(mut sender) = self.sender.take() {
                        if let Err(err) = sender.close().await {
                            debug!("message_queue:{}: failed to close sender: {:?}", self.peer, err);
                        }
                    }
                    break;
                }
                _ = self.ctx.cancelled() => {
                    if let Some(mut sender) = self.sender.take() {
                        sender.reset();
                    }
                    break;
                }
                Some(()) = self.work.recv() => {
                    self.send_pending().await;
                }
            }
        }

        {
            let mut pending = self.shared.lock();
            pending.state = QueueState::Closed;
            for ack in pending.acks.drain(..) {
                let _ = ack.send(false);
            }
        }
        self.metrics.message_queues_stopped.inc();
        debug!("message_queue:{}: stopped", self.peer);
    }

    async fn send_pending(&mut self) {
        let next = {
            let mut pending = self.shared.lock();
            let next = pending.take();
            pending.state = if next.is_some() {
                QueueState::Sending
            } else {
                QueueState::Idle
            };
            next
        };
        let Some((message, acks)) = next else {
            return;
        };

        let outcome = self.send_with_retries(&message).await;
        let sent = matches!(outcome, SendOutcome::Sent);
        for ack in acks {
            let _ = ack.send(sent);
        }

        let mut pending = self.shared.lock();
        if let SendOutcome::Dropped = outcome {
            self.metrics.messages_dropped.inc();
            warn!(
                "message_queue:{}: dropping message after {} attempts",
                self.peer, self.config.max_retries
            );
            // the peer lost track of our wants, resend all of them next time
            pending.full = true;
        }
        if pending.state == QueueState::Sending {
            pending.state = if pending.delta.is_empty() {
                QueueState::Idle
            } else {
                QueueState::Pending
            };
        }
        if !pending.delta.is_empty() {
            // deferred cancels, or work that arrived while sending
            let _ = self.shared.work.try_send(());
        }
    }

    async fn send_with_retries(&mut self, message: &BitswapMessage) -> SendOutcome {
        for attempt in 1..=self.config.max_retries {
            match self.try_send(message).await {
                Ok(()) => {
                    self.metrics.messages_sent.inc();
                    trace!("message_queue:{}: sent {:?}", self.peer, message);
                    return SendOutcome::Sent;
                }
                Err(err) => {
                    self.metrics.send_errors.inc();
                    debug!(
                        "message_queue:{}: send attempt {}/{} failed: {:?}",
                        self.peer, attempt, self.config.max_retries, err
                    );
                    if let Some(mut sender) = self.sender.take() {
                        sender.reset();
                    }
                }
            }

            if attempt == self.config.max_retries {
                break;
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SendOutcome::Interrupted,
                _ = self.ctx.cancelled() => return SendOutcome::Interrupted,
                _ = tokio::time::sleep(self.config.send_error_backoff) => {}
            }
        }
        SendOutcome::Dropped
    }

    async fn try_send(&mut self, message: &BitswapMessage) -> Result<()> {
        let mut sender = match self.sender.take() {
            Some(sender) => sender,
            None => self.open_sender().await?,
        };
        let res = sender.send(message.clone()).await;
        self.sender = Some(sender);
        res
    }

    async fn open_sender(&self) -> Result<Box<dyn MessageSender>> {
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, self.network.connect(self.peer, timeout))
            .await
            .context("connect timeout")??;
        self.network.open_sender(self.peer).await
    }
}
