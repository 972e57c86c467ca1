use std::cmp::Ordering;

use ahash::AHashMap;
use keyed_priority_queue::KeyedPriorityQueue;
use libp2p_identity::PeerId;

use super::{Data, Task, TaskMerger, Topic};

/// A pending task, ordered by priority and then by insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueTask<T: Topic, D: Data> {
    task: Task<T, D>,
    seq: u64,
}

impl<T: Topic, D: Data> Ord for QueueTask<T, D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T: Topic, D: Data> PartialOrd for QueueTask<T, D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Tracks pending and active tasks for a single peer.
#[derive(Debug)]
pub(super) struct PeerTracker<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    target: PeerId,
    pending_tasks: KeyedPriorityQueue<T, QueueTask<T, D>>,
    active_tasks: AHashMap<T, Vec<Task<T, D>>>,
    active_work: usize,
    max_active_work: usize,
    next_seq: u64,
    /// Served only when no other peer has work.
    deprioritized: bool,
    task_merger: TM,
}

#[derive(Debug)]
pub(super) struct Stats {
    pub num_pending: usize,
    pub num_active: usize,
}

/// Sorted topics of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics<T: Topic> {
    pub pending: Vec<T>,
    pub active: Vec<T>,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> PeerTracker<T, D, TM> {
    pub fn new(target: PeerId, task_merger: TM, max_active_work: usize) -> Self {
        PeerTracker {
            target,
            pending_tasks: KeyedPriorityQueue::new(),
            active_tasks: Default::default(),
            active_work: 0,
            max_active_work,
            next_seq: 0,
            deprioritized: false,
            task_merger,
        }
    }

    pub fn target(&self) -> &PeerId {
        &self.target
    }

    /// No pending and no active tasks.
    pub fn is_idle(&self) -> bool {
        self.pending_tasks.is_empty() && self.active_tasks.is_empty()
    }

    /// Has pending tasks and room to start them.
    pub fn is_ready(&self) -> bool {
        !self.pending_tasks.is_empty() && !self.is_saturated()
    }

    fn is_saturated(&self) -> bool {
        self.max_active_work > 0 && self.active_work >= self.max_active_work
    }

    pub fn stats(&self) -> Stats {
        Stats {
            num_pending: self.pending_tasks.len(),
            num_active: self.active_tasks.values().map(Vec::len).sum(),
        }
    }

    pub fn topics(&self) -> Topics<T> {
        let mut pending: Vec<_> = self.pending_tasks.iter().map(|(t, _)| t.clone()).collect();
        pending.sort();
        let mut active: Vec<_> = self.active_tasks.keys().cloned().collect();
        active.sort();
        Topics { pending, active }
    }

    pub fn push_tasks(&mut self, tasks: Vec<Task<T, D>>) {
        for task in tasks {
            // in flight already, with at least as much information
            if let Some(active) = self.active_tasks.get(&task.topic) {
                if !active.is_empty() && !self.task_merger.has_new_info(&task, active) {
                    continue;
                }
            }

            if let Some(mut existing) = self.pending_tasks.remove(&task.topic) {
                existing.task.priority = existing.task.priority.max(task.priority);
                self.task_merger.merge(&task, &mut existing.task);
                self.pending_tasks.push(task.topic.clone(), existing);
                continue;
            }

            let seq = self.next_seq;
            self.next_seq += 1;
            self.pending_tasks
                .push(task.topic.clone(), QueueTask { task, seq });
        }
    }

    /// Pops tasks in priority order until `target_min_work` is covered.
    ///
    /// The first task is always handed out, even if it exceeds the target.
    pub fn pop_tasks(&mut self, target_min_work: usize) -> Vec<Task<T, D>> {
        let mut out = Vec::new();
        let mut work = 0;
        while work < target_min_work && !self.is_saturated() {
            let Some((_, queued)) = self.pending_tasks.pop() else {
                break;
            };
            let task = queued.task;
            work += task.work;
            self.start_task(task.clone());
            out.push(task);
        }
        out
    }

    fn start_task(&mut self, task: Task<T, D>) {
        self.active_work += task.work;
        self.active_tasks
            .entry(task.topic.clone())
            .or_default()
            .push(task);
    }

    pub fn pending_work(&self) -> usize {
        self.pending_tasks.iter().map(|(_, q)| q.task.work).sum()
    }

    pub fn task_done(&mut self, task: &Task<T, D>) {
        let Some(active) = self.active_tasks.get_mut(&task.topic) else {
            return;
        };
        if let Some(pos) = active.iter().position(|t| t == task) {
            active.swap_remove(pos);
            self.active_work = self.active_work.saturating_sub(task.work);
        }
        if active.is_empty() {
            self.active_tasks.remove(&task.topic);
        }
    }

    pub fn remove(&mut self, topic: &T) -> bool {
        self.pending_tasks.remove(topic).is_some()
    }

    pub fn retain_pending(&mut self, keep: impl Fn(&T) -> bool) {
        let stale: Vec<T> = self
            .pending_tasks
            .iter()
            .filter(|(t, _)| !keep(t))
            .map(|(t, _)| t.clone())
            .collect();
        for topic in stale {
            self.pending_tasks.remove(&topic);
        }
    }

    pub fn set_deprioritized(&mut self, deprioritized: bool) {
        self.deprioritized = deprioritized;
    }

    pub fn is_deprioritized(&self) -> bool {
        self.deprioritized
    }
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> PartialEq for PeerTracker<T, D, TM> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> Eq for PeerTracker<T, D, TM> {}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> PartialOrd for PeerTracker<T, D, TM> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Greater means more deserving of being served next.
impl<T: Topic, D: Data, TM: TaskMerger<T, D>> Ord for PeerTracker<T, D, TM> {
    fn cmp(&self, other: &Self) -> Ordering {
        // no pending tasks means lowest priority
        match (self.pending_tasks.is_empty(), other.pending_tasks.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        if self.deprioritized != other.deprioritized {
            return if self.deprioritized {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }

        // With equal active work, pick the peer with the most pending,
        // otherwise the one with the least active work.
        if self.active_work == other.active_work {
            return self.pending_tasks.len().cmp(&other.pending_tasks.len());
        }
        other.active_work.cmp(&self.active_work)
    }
}

#[cfg(test)]
mod tests {
    use crate::peer_task_queue::DefaultTaskMerger;

    use super::*;

    const MAX_ACTIVE_WORK: usize = 100;

    fn tracker() -> PeerTracker<usize, (), DefaultTaskMerger> {
        PeerTracker::new(PeerId::random(), DefaultTaskMerger, MAX_ACTIVE_WORK)
    }

    fn task(topic: usize, priority: i32, work: usize) -> Task<usize, ()> {
        Task {
            topic,
            priority,
            work,
            data: (),
        }
    }

    #[test]
    fn test_empty() {
        let mut tracker = tracker();
        assert!(tracker.pop_tasks(100).is_empty());
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_pop_zero_size() {
        let mut tracker = tracker();
        tracker.push_tasks(vec![task(1, 1, 10)]);
        assert!(tracker.pop_tasks(0).is_empty());
    }

    #[test]
    fn test_pop_size_order() {
        let mut tracker = tracker();
        tracker.push_tasks(vec![task(1, 10, 10), task(2, 20, 10), task(3, 15, 10)]);

        let popped = tracker.pop_tasks(10);
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].topic, 2);
        assert_eq!(tracker.pending_work(), 20);

        let topics = tracker.topics();
        assert_eq!(topics.active, vec![2]);
        assert_eq!(topics.pending, vec![1, 3]);

        let popped = tracker.pop_tasks(100);
        assert_eq!(
            popped.iter().map(|t| t.topic).collect::<Vec<_>>(),
            vec![3, 1]
        );
        assert_eq!(tracker.topics().active, vec![1, 2, 3]);
        assert!(tracker.pop_tasks(100).is_empty());
    }

    #[test]
    fn test_pop_first_item_always() {
        let mut tracker = tracker();
        tracker.push_tasks(vec![task(1, 20, 10), task(2, 10, 5)]);

        let popped = tracker.pop_tasks(7);
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].topic, 1);
    }

    #[test]
    fn test_merge_keeps_higher_priority() {
        let mut tracker = tracker();
        tracker.push_tasks(vec![task(1, 5, 10), task(2, 10, 10)]);
        tracker.push_tasks(vec![task(1, 20, 10)]);

        assert_eq!(tracker.stats().num_pending, 2);
        let popped = tracker.pop_tasks(1);
        assert_eq!(popped[0].topic, 1);
        assert_eq!(popped[0].priority, 20);
    }

    #[test]
    fn test_skip_task_already_active() {
        let mut tracker = tracker();
        tracker.push_tasks(vec![task(1, 1, 10)]);
        let popped = tracker.pop_tasks(10);

        // the default merger never sees new information
        tracker.push_tasks(vec![task(1, 1, 10)]);
        assert_eq!(tracker.stats().num_pending, 0);

        tracker.task_done(&popped[0]);
        assert!(tracker.is_idle());
        tracker.push_tasks(vec![task(1, 1, 10)]);
        assert_eq!(tracker.stats().num_pending, 1);
    }

    #[test]
    fn test_retain_pending() {
        let mut tracker = tracker();
        tracker.push_tasks((0..6).map(|i| task(i, 1, 1)).collect());
        tracker.retain_pending(|t| t % 2 == 0);
        assert_eq!(tracker.topics().pending, vec![0, 2, 4]);
    }
}
