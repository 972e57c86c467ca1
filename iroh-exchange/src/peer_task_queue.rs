//! Prioritized, per peer task queues. Based on https://github.com/ipfs/go-peertaskqueue.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use libp2p_identity::PeerId;

use crate::message::Priority;

use self::peer_tracker::PeerTracker;
pub use self::peer_tracker::Topics;

mod peer_tracker;

pub trait Topic: Sized + Debug + Clone + PartialEq + Eq + Hash + Ord + Send + Sync + 'static {}
impl<T: Sized + Debug + Clone + PartialEq + Eq + Hash + Ord + Send + Sync + 'static> Topic for T {}

pub trait Data: Sized + Debug + Clone + PartialEq + Eq + Send + Sync + 'static {}
impl<D: Sized + Debug + Clone + PartialEq + Eq + Send + Sync + 'static> Data for D {}

/// Decides how a task is folded into tasks with the same topic.
pub trait TaskMerger<T: Topic, D: Data>: Debug + Clone + PartialEq + Eq + Send + Sync + 'static {
    /// Whether `task` is worth queueing even though `existing` tasks with its
    /// topic are already in flight.
    fn has_new_info(&self, task: &Task<T, D>, existing: &[Task<T, D>]) -> bool;

    /// Merges `task` into the pending `existing` task with the same topic.
    fn merge(&self, task: &Task<T, D>, existing: &mut Task<T, D>);
}

/// Merger that never merges anything.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DefaultTaskMerger;

impl<T: Topic, D: Data> TaskMerger<T, D> for DefaultTaskMerger {
    fn has_new_info(&self, _task: &Task<T, D>, _existing: &[Task<T, D>]) -> bool {
        false
    }

    fn merge(&self, _task: &Task<T, D>, _existing: &mut Task<T, D>) {}
}

/// A single unit of work for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<T: Topic, D: Data> {
    pub topic: T,
    pub priority: Priority,
    /// Cost of the task, e.g. the number of bytes it will put on the wire.
    pub work: usize,
    pub data: D,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Work a single peer may have in flight, 0 disables the limit.
    pub max_outstanding_work_per_peer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_outstanding_work_per_peer: 1024 * 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub num_peers: usize,
    pub num_active: usize,
    pub num_pending: usize,
}

/// Shared handle to the queues of all peers.
#[derive(Debug, Clone)]
pub struct PeerTaskQueue<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    inner: Arc<Mutex<Inner<T, D, TM>>>,
}

#[derive(Debug)]
struct Inner<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    peer_trackers: AHashMap<PeerId, PeerTracker<T, D, TM>>,
    task_merger: TM,
    config: Config,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> PeerTaskQueue<T, D, TM> {
    pub fn new(task_merger: TM, config: Config) -> Self {
        PeerTaskQueue {
            inner: Arc::new(Mutex::new(Inner {
                peer_trackers: Default::default(),
                task_merger,
                config,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T, D, TM>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> Stats {
        let this = self.lock();
        let mut stats = Stats {
            num_peers: this.peer_trackers.len(),
            ..Default::default()
        };
        for tracker in this.peer_trackers.values() {
            let s = tracker.stats();
            stats.num_active += s.num_active;
            stats.num_pending += s.num_pending;
        }
        stats
    }

    /// Topics queued and in flight for `peer`.
    pub fn peer_topics(&self, peer: &PeerId) -> Option<Topics<T>> {
        self.lock().peer_trackers.get(peer).map(|t| t.topics())
    }

    /// Adds tasks for `peer`, merging them with pending tasks of the same topic.
    pub fn push_tasks(&self, peer: PeerId, tasks: Vec<Task<T, D>>) {
        let mut guard = self.lock();
        let this = &mut *guard;
        let tracker = this.peer_trackers.entry(peer).or_insert_with(|| {
            PeerTracker::new(
                peer,
                this.task_merger.clone(),
                this.config.max_outstanding_work_per_peer,
            )
        });
        tracker.push_tasks(tasks);
    }

    /// Pops tasks of the most deserving peer, covering at least `target_min_work`
    /// if enough is queued.
    ///
    /// Returns the peer, its tasks and the work still pending for it.
    pub fn pop_tasks(&self, target_min_work: usize) -> Option<(PeerId, Vec<Task<T, D>>, usize)> {
        let mut this = self.lock();
        let tracker = this
            .peer_trackers
            .values_mut()
            .filter(|t| t.is_ready())
            .max()?;
        let tasks = tracker.pop_tasks(target_min_work);
        if tasks.is_empty() {
            return None;
        }
        Some((*tracker.target(), tasks, tracker.pending_work()))
    }

    /// Marks the tasks as finished, freeing up the peer's active work.
    pub fn tasks_done(&self, peer: &PeerId, tasks: &[Task<T, D>]) {
        let mut this = self.lock();
        if let Some(tracker) = this.peer_trackers.get_mut(peer) {
            for task in tasks {
                tracker.task_done(task);
            }
            if tracker.is_idle() && !tracker.is_deprioritized() {
                this.peer_trackers.remove(peer);
            }
        }
    }

    /// Removes the pending task for `topic` of `peer`.
    pub fn remove(&self, topic: &T, peer: &PeerId) -> bool {
        let mut this = self.lock();
        let Some(tracker) = this.peer_trackers.get_mut(peer) else {
            return false;
        };
        let removed = tracker.remove(topic);
        if tracker.is_idle() && !tracker.is_deprioritized() {
            this.peer_trackers.remove(peer);
        }
        removed
    }

    /// Drops all pending tasks for `peer`, except the ones matching `keep`.
    pub fn retain_pending(&self, peer: &PeerId, keep: impl Fn(&T) -> bool) {
        if let Some(tracker) = self.lock().peer_trackers.get_mut(peer) {
            tracker.retain_pending(keep);
        }
    }

    /// Forgets `peer` and everything queued for it.
    pub fn remove_peer(&self, peer: &PeerId) {
        self.lock().peer_trackers.remove(peer);
    }

    /// Moves `peer` behind every other peer until reset.
    pub fn set_deprioritized(&self, peer: &PeerId, deprioritized: bool) {
        if let Some(tracker) = self.lock().peer_trackers.get_mut(peer) {
            tracker.set_deprioritized(deprioritized);
        }
    }
}
