//! Task queues behind the shared-scan scheduler.
//!
//! [`ChunkTasksQueue`] packs tasks reading the same chunk together so its
//! tables are read from disk once; [`FifoTaskQueue`] is the plain
//! arrival-order variant kept behind the same contract as a configuration
//! knob.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use smq_common::ChunkId;
use tracing::debug;

use crate::memman::{LockResult, MemMan, HANDLE_INVALID};
use crate::task::Task;

/// Queue contract the scheduler drives.
///
/// `ready` attempts the memory lock for the next task's file set (stashing
/// the granted handle on the task); a refusal leaves the queue state
/// untouched so the scheduler retries later.
pub trait TaskQueue: Send {
    fn queue_task(&mut self, task: Arc<Task>);

    /// Evict a queued task; false if it was not queued here.
    fn remove_task(&mut self, task: &Arc<Task>) -> bool;

    /// Account a dispatched task as complete.
    fn task_complete(&mut self, task: &Arc<Task>);

    /// Whether the next task can be dispatched now (memory lockable).
    fn ready(&mut self, use_flexible_lock: bool) -> bool;

    /// Pop the next task if ready.
    fn get_task(&mut self, use_flexible_lock: bool) -> Option<Arc<Task>>;

    /// Queued (not in-flight) task count.
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Chunk id the next dispatch would serve.
    fn next_chunk_id(&self) -> Option<ChunkId>;

    /// Whether the next dispatch would serve a different chunk id than the
    /// last one handed out.
    fn next_task_different_chunk_id(&self) -> bool;
}

struct ChunkBucket {
    tasks: VecDeque<Arc<Task>>,
    in_flight: usize,
    /// Enqueue sequence of the oldest queued task; drives pointer advance.
    first_seq: u64,
}

/// Chunk-bucketed queue with an active pointer.
///
/// Tasks bucket by chunk id. The active pointer names the bucket being
/// drained; when it has no queued tasks left the pointer advances to the
/// non-empty bucket that has waited longest (earliest enqueue sequence,
/// ties broken on ascending chunk id).
pub struct ChunkTasksQueue {
    memman: Arc<dyn MemMan>,
    buckets: BTreeMap<ChunkId, ChunkBucket>,
    active: Option<ChunkId>,
    last_dispatched: Option<ChunkId>,
    seq: u64,
    queued: usize,
}

impl ChunkTasksQueue {
    pub fn new(memman: Arc<dyn MemMan>) -> Self {
        Self {
            memman,
            buckets: BTreeMap::new(),
            active: None,
            last_dispatched: None,
            seq: 0,
            queued: 0,
        }
    }

    /// Bucket the next dispatch would come from, without moving the
    /// pointer.
    fn candidate_chunk(&self) -> Option<ChunkId> {
        if let Some(active) = self.active {
            if let Some(bucket) = self.buckets.get(&active) {
                if !bucket.tasks.is_empty() {
                    return Some(active);
                }
            }
        }
        self.buckets
            .iter()
            .filter(|(_, b)| !b.tasks.is_empty())
            .min_by_key(|(chunk, b)| (b.first_seq, **chunk))
            .map(|(chunk, _)| *chunk)
    }

    /// Move the pointer to the candidate bucket and return it.
    fn advance(&mut self) -> Option<ChunkId> {
        let chunk = self.candidate_chunk()?;
        if self.active != Some(chunk) {
            debug!(chunk, "active chunk pointer advanced");
            self.active = Some(chunk);
        }
        Some(chunk)
    }

    fn drop_bucket_if_done(&mut self, chunk: ChunkId) {
        if let Some(bucket) = self.buckets.get(&chunk) {
            if bucket.tasks.is_empty() && bucket.in_flight == 0 {
                self.buckets.remove(&chunk);
                if self.active == Some(chunk) {
                    self.active = None;
                }
            }
        }
    }
}

impl TaskQueue for ChunkTasksQueue {
    fn queue_task(&mut self, task: Arc<Task>) {
        self.seq += 1;
        let seq = self.seq;
        let bucket = self
            .buckets
            .entry(task.chunk_id())
            .or_insert_with(|| ChunkBucket {
                tasks: VecDeque::new(),
                in_flight: 0,
                first_seq: seq,
            });
        if bucket.tasks.is_empty() {
            bucket.first_seq = seq;
        }
        bucket.tasks.push_back(task);
        self.queued += 1;
    }

    fn remove_task(&mut self, task: &Arc<Task>) -> bool {
        let chunk = task.chunk_id();
        let removed = match self.buckets.get_mut(&chunk) {
            Some(bucket) => {
                let before = bucket.tasks.len();
                bucket.tasks.retain(|t| !Arc::ptr_eq(t, task));
                before != bucket.tasks.len()
            }
            None => false,
        };
        if removed {
            self.queued -= 1;
            // An evicted task may already hold a lock granted by `ready`.
            let handle = task.take_mem_handle();
            if handle != HANDLE_INVALID {
                self.memman.unlock(handle);
            }
            self.drop_bucket_if_done(chunk);
        }
        removed
    }

    fn task_complete(&mut self, task: &Arc<Task>) {
        let chunk = task.chunk_id();
        if let Some(bucket) = self.buckets.get_mut(&chunk) {
            bucket.in_flight = bucket.in_flight.saturating_sub(1);
        }
        self.drop_bucket_if_done(chunk);
    }

    fn ready(&mut self, use_flexible_lock: bool) -> bool {
        let chunk = match self.advance() {
            Some(chunk) => chunk,
            None => return false,
        };
        let task = match self.buckets.get(&chunk).and_then(|b| b.tasks.front()) {
            Some(task) => Arc::clone(task),
            None => return false,
        };
        if task.mem_handle() != HANDLE_INVALID {
            return true;
        }
        match self.memman.lock(&task.files(), use_flexible_lock) {
            LockResult::Locked { handle, .. } => {
                task.set_mem_handle(handle);
                true
            }
            LockResult::Reserved | LockResult::Insufficient => false,
        }
    }

    fn get_task(&mut self, use_flexible_lock: bool) -> Option<Arc<Task>> {
        if !self.ready(use_flexible_lock) {
            return None;
        }
        let chunk = self.active?;
        let bucket = self.buckets.get_mut(&chunk)?;
        let task = bucket.tasks.pop_front()?;
        bucket.in_flight += 1;
        self.queued -= 1;
        self.last_dispatched = Some(chunk);
        Some(task)
    }

    fn size(&self) -> usize {
        self.queued
    }

    fn next_chunk_id(&self) -> Option<ChunkId> {
        self.candidate_chunk()
    }

    fn next_task_different_chunk_id(&self) -> bool {
        match (self.candidate_chunk(), self.last_dispatched) {
            (Some(next), Some(last)) => next != last,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Plain FIFO variant of the queue contract.
pub struct FifoTaskQueue {
    memman: Arc<dyn MemMan>,
    tasks: VecDeque<Arc<Task>>,
    last_dispatched: Option<ChunkId>,
}

impl FifoTaskQueue {
    pub fn new(memman: Arc<dyn MemMan>) -> Self {
        Self {
            memman,
            tasks: VecDeque::new(),
            last_dispatched: None,
        }
    }
}

impl TaskQueue for FifoTaskQueue {
    fn queue_task(&mut self, task: Arc<Task>) {
        self.tasks.push_back(task);
    }

    fn remove_task(&mut self, task: &Arc<Task>) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| !Arc::ptr_eq(t, task));
        let removed = before != self.tasks.len();
        if removed {
            let handle = task.take_mem_handle();
            if handle != HANDLE_INVALID {
                self.memman.unlock(handle);
            }
        }
        removed
    }

    fn task_complete(&mut self, _task: &Arc<Task>) {}

    fn ready(&mut self, use_flexible_lock: bool) -> bool {
        let task = match self.tasks.front() {
            Some(task) => Arc::clone(task),
            None => return false,
        };
        if task.mem_handle() != HANDLE_INVALID {
            return true;
        }
        match self.memman.lock(&task.files(), use_flexible_lock) {
            LockResult::Locked { handle, .. } => {
                task.set_mem_handle(handle);
                true
            }
            LockResult::Reserved | LockResult::Insufficient => false,
        }
    }

    fn get_task(&mut self, use_flexible_lock: bool) -> Option<Arc<Task>> {
        if !self.ready(use_flexible_lock) {
            return None;
        }
        let task = self.tasks.pop_front()?;
        self.last_dispatched = Some(task.chunk_id());
        Some(task)
    }

    fn size(&self) -> usize {
        self.tasks.len()
    }

    fn next_chunk_id(&self) -> Option<ChunkId> {
        self.tasks.front().map(|t| t.chunk_id())
    }

    fn next_task_different_chunk_id(&self) -> bool {
        match (self.next_chunk_id(), self.last_dispatched) {
            (Some(next), Some(last)) => next != last,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Build the queue variant selected by configuration.
pub fn make_queue(
    variant: smq_common::TaskQueueVariant,
    memman: Arc<dyn MemMan>,
) -> Box<dyn TaskQueue> {
    match variant {
        smq_common::TaskQueueVariant::ChunkTasks => Box::new(ChunkTasksQueue::new(memman)),
        smq_common::TaskQueueVariant::Fifo => Box::new(FifoTaskQueue::new(memman)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memman::{BudgetMemMan, MemManNone};
    use crate::task::tests::test_msg;

    fn enqueue_chunks(queue: &mut dyn TaskQueue, chunks: &[i32]) -> Vec<Arc<Task>> {
        let mut tasks = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let task = Task::from_msg(test_msg(1, i as u32, *chunk, 16));
            queue.queue_task(Arc::clone(&task));
            tasks.push(task);
        }
        tasks
    }

    fn drain_chunks(queue: &mut dyn TaskQueue) -> Vec<i32> {
        let mut order = Vec::new();
        while let Some(task) = queue.get_task(false) {
            order.push(task.chunk_id());
            queue.task_complete(&task);
        }
        order
    }

    #[test]
    fn groups_by_chunk_id() {
        let mut queue = ChunkTasksQueue::new(Arc::new(MemManNone::new()));
        enqueue_chunks(&mut queue, &[10, 20, 10, 20, 10, 30]);
        assert_eq!(queue.size(), 6);
        assert_eq!(drain_chunks(&mut queue), vec![10, 10, 10, 20, 20, 30]);
        assert!(queue.is_empty());
    }

    #[test]
    fn pointer_prefers_longest_waiting_bucket() {
        let mut queue = ChunkTasksQueue::new(Arc::new(MemManNone::new()));
        enqueue_chunks(&mut queue, &[20, 10, 20]);
        assert_eq!(queue.next_chunk_id(), Some(20));
        assert_eq!(drain_chunks(&mut queue), vec![20, 20, 10]);
    }

    #[test]
    fn within_one_chunk_dispatch_is_enqueue_order() {
        let mut queue = ChunkTasksQueue::new(Arc::new(MemManNone::new()));
        let tasks = enqueue_chunks(&mut queue, &[10, 10, 10]);
        let first = queue.get_task(false).unwrap();
        assert!(Arc::ptr_eq(&first, &tasks[0]));
        let second = queue.get_task(false).unwrap();
        assert!(Arc::ptr_eq(&second, &tasks[1]));
    }

    #[test]
    fn memory_refusal_leaves_pointer_and_queue_untouched() {
        let memman = Arc::new(BudgetMemMan::new(0, 64));
        let mut queue = ChunkTasksQueue::new(memman);
        enqueue_chunks(&mut queue, &[10, 20]);
        assert!(!queue.ready(false));
        assert!(queue.get_task(false).is_none());
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.next_chunk_id(), Some(10));
    }

    #[test]
    fn evicting_a_locked_task_releases_its_handle() {
        let memman = Arc::new(BudgetMemMan::new(1024, 64));
        let mut queue = ChunkTasksQueue::new(Arc::clone(&memman) as Arc<dyn MemMan>);
        let tasks = enqueue_chunks(&mut queue, &[10]);
        assert!(queue.ready(false));
        assert_eq!(memman.locked_bytes(), 64);
        assert!(queue.remove_task(&tasks[0]));
        assert_eq!(memman.locked_bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn head_change_is_visible() {
        let mut queue = ChunkTasksQueue::new(Arc::new(MemManNone::new()));
        enqueue_chunks(&mut queue, &[10, 20]);
        assert!(queue.next_task_different_chunk_id());
        let t = queue.get_task(false).unwrap();
        assert_eq!(t.chunk_id(), 10);
        assert!(queue.next_task_different_chunk_id());
        queue.task_complete(&t);
    }

    #[test]
    fn fifo_keeps_arrival_order() {
        let mut queue = FifoTaskQueue::new(Arc::new(MemManNone::new()));
        enqueue_chunks(&mut queue, &[10, 20, 10]);
        assert_eq!(drain_chunks(&mut queue), vec![10, 20, 10]);
    }
}
