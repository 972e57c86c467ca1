use cid::Cid;

use crate::peer_task_queue::{Task, TaskMerger as Merger};

/// What a queued response to a want needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskData {
    /// Send the block itself, rather than a HAVE.
    pub is_want_block: bool,
    /// Reply with DONT_HAVE when the block turns out to be missing.
    pub send_dont_have: bool,
    pub block_size: usize,
    /// Whether the block was in the store when the task was created.
    pub have_block: bool,
}

/// Folds wants for the same block into a single response.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct TaskMerger;

impl Merger<Cid, TaskData> for TaskMerger {
    fn has_new_info(&self, task: &Task<Cid, TaskData>, existing: &[Task<Cid, TaskData>]) -> bool {
        let have_size = existing.iter().any(|t| t.data.have_block);
        let is_want_block = existing.iter().any(|t| t.data.is_want_block);

        (!is_want_block && task.data.is_want_block) || (!have_size && task.data.have_block)
    }

    fn merge(&self, task: &Task<Cid, TaskData>, existing: &mut Task<Cid, TaskData>) {
        let new = &task.data;
        let data = &mut existing.data;

        if !data.have_block && new.have_block {
            data.have_block = true;
            data.block_size = new.block_size;
        }

        // a want-block upgrades a want-have
        if !data.is_want_block && new.is_want_block {
            data.is_want_block = true;
            if !data.have_block || new.have_block {
                data.have_block = new.have_block;
                existing.work = task.work;
            }
        }
        data.send_dont_have |= new.send_dont_have;

        if data.is_want_block && data.have_block {
            existing.work = data.block_size;
        }
    }
}
