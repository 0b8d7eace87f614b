//! Shared-scan scheduler.
//!
//! Wraps one task queue and enforces the admission limits: `max_threads`
//! (hard in-flight ceiling), `max_threads_adj` (dynamic ceiling lowered by
//! higher-priority schedulers), `max_active_chunks` (distinct chunk ids in
//! flight), and the memory manager's refusal. One mutex guards the queue
//! and counters; `get_cmd(true)` blocks on the condition variable until a
//! task is admissible.
//!
//! Memory unlock is deferred by one step: the finishing task's handle is
//! held until the next dispatch or completion (released immediately when
//! the queue is empty), so a back-to-back task on the same chunk never sees
//! its tables evicted in the gap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use smq_common::metrics::global_metrics;
use smq_common::{ChunkId, Result, SchedulerConfig, SmqError};
use tracing::{debug, info};

use crate::memman::{HandleId, MemMan, HANDLE_INVALID};
use crate::queue::{make_queue, TaskQueue};
use crate::task::{Task, TaskScheduler};

/// Callbacks into the layer above (the blend scheduler).
pub trait SchedulerEvents: Send + Sync {
    /// The head-of-queue chunk id changed on `scheduler`; priorities may
    /// need re-evaluation.
    fn head_chunk_changed(&self, scheduler: &str);

    /// Work may have become available for pool threads.
    fn wake_workers(&self);
}

struct Core {
    queue: Box<dyn TaskQueue>,
    in_flight: usize,
    max_threads_adj: usize,
    active_chunks: HashMap<ChunkId, usize>,
    /// Deferred unlock handle; at most one outstanding.
    handle_to_unlock: HandleId,
}

/// One shared-scan scheduler instance.
pub struct ScanScheduler {
    config: SchedulerConfig,
    memman: Arc<dyn MemMan>,
    core: Mutex<Core>,
    cond: Condvar,
    events: Mutex<Weak<dyn SchedulerEvents>>,
    stopping: AtomicBool,
}

impl ScanScheduler {
    pub fn new(config: SchedulerConfig, memman: Arc<dyn MemMan>) -> Result<Arc<ScanScheduler>> {
        config.validate()?;
        let queue = make_queue(config.queue_variant, Arc::clone(&memman));
        let max_threads = config.max_threads;
        Ok(Arc::new(ScanScheduler {
            config,
            memman,
            core: Mutex::new(Core {
                queue,
                in_flight: 0,
                max_threads_adj: max_threads,
                active_chunks: HashMap::new(),
                handle_to_unlock: HANDLE_INVALID,
            }),
            cond: Condvar::new(),
            events: Mutex::new(Weak::<NoEvents>::new() as Weak<dyn SchedulerEvents>),
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn max_threads(&self) -> usize {
        self.config.max_threads
    }

    pub fn max_reserve(&self) -> usize {
        self.config.max_reserve
    }

    /// Whether this scheduler's rating band covers `rating`.
    pub fn handles_rating(&self, rating: i32) -> bool {
        self.config.min_rating <= rating && rating <= self.config.max_rating
    }

    /// Register the event sink of the layer above.
    pub fn set_events(&self, events: Weak<dyn SchedulerEvents>) {
        *self.events.lock().expect("scheduler events lock") = events;
    }

    /// Enqueue a task. Fails if the task is already owned by a scheduler.
    pub fn queue_cmd(self: &Arc<Self>, task: Arc<Task>) -> Result<()> {
        if !task.try_hold() {
            return Err(SmqError::Internal(format!(
                "{} is already owned by a scheduler",
                task.id_str()
            )));
        }
        task.reset_scheduler_state();
        task.set_scheduler(Arc::downgrade(self) as Weak<dyn TaskScheduler>);
        task.set_queued();
        {
            let mut core = self.lock_core();
            core.queue.queue_task(Arc::clone(&task));
            self.update_metrics(&core);
        }
        debug!(scheduler = %self.config.name, task = %task.id_str(), chunk = task.chunk_id(),
               "task queued");
        self.cond.notify_all();
        self.with_events(|ev| ev.wake_workers());
        Ok(())
    }

    /// Blocking (`wait = true`) or polling dispatch.
    pub fn get_cmd(&self, wait: bool) -> Option<Arc<Task>> {
        let mut core = self.lock_core();
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = self.try_dispatch(&mut core) {
                return Some(task);
            }
            if !wait {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(core, Duration::from_millis(100))
                .expect("scheduler lock");
            core = guard;
        }
    }

    /// Non-destructive admission probe.
    pub fn ready(&self) -> bool {
        let mut core = self.lock_core();
        self.check_ready(&mut core)
    }

    fn check_ready(&self, core: &mut Core) -> bool {
        if core.in_flight >= core.max_threads_adj {
            return false;
        }
        let next_chunk = match core.queue.next_chunk_id() {
            Some(chunk) => chunk,
            None => return false,
        };
        let new_chunk = !core.active_chunks.contains_key(&next_chunk);
        if new_chunk && core.active_chunks.len() >= self.config.max_active_chunks {
            return false;
        }
        // An idle scheduler may let the memory manager reserve speculatively.
        let flexible = core.in_flight == 0;
        if core.queue.ready(flexible) {
            return true;
        }
        // The deferred handle itself may be holding the budget the next
        // task needs; give it up and retry once.
        if core.handle_to_unlock != HANDLE_INVALID {
            self.release_deferred(core);
            return core.queue.ready(flexible);
        }
        false
    }

    fn try_dispatch(&self, core: &mut Core) -> Option<Arc<Task>> {
        if !self.check_ready(core) {
            return None;
        }
        let flexible = core.in_flight == 0;
        let task = core.queue.get_task(flexible)?;
        core.in_flight += 1;
        *core.active_chunks.entry(task.chunk_id()).or_insert(0) += 1;
        // The new task's tables are locked; now the previous task's handle
        // can go.
        self.release_deferred(core);
        self.update_metrics(core);
        debug!(scheduler = %self.config.name, task = %task.id_str(), chunk = task.chunk_id(),
               in_flight = core.in_flight, "task dispatched");
        Some(task)
    }

    /// Record that a pool thread started running `task`.
    pub fn command_start(&self, task: &Arc<Task>) {
        task.set_started();
        debug!(scheduler = %self.config.name, task = %task.id_str(), "task started");
    }

    /// Release protocol on completion.
    pub fn command_finish(&self, task: &Arc<Task>) {
        if task.mark_scheduler_done() {
            // Already accounted (booted or cancelled mid-run).
            self.cond.notify_all();
            return;
        }
        let head_changed;
        {
            let mut core = self.lock_core();
            self.release_deferred(&mut core);
            core.in_flight = core.in_flight.saturating_sub(1);
            core.queue.task_complete(task);
            release_active_chunk(&mut core, task.chunk_id());
            let handle = task.take_mem_handle();
            if handle != HANDLE_INVALID {
                core.handle_to_unlock = handle;
            }
            if core.queue.is_empty() {
                self.release_deferred(&mut core);
            }
            head_changed = core.queue.next_task_different_chunk_id();
            self.update_metrics(&core);
        }
        task.release_hold();
        debug!(scheduler = %self.config.name, task = %task.id_str(), "task finished");
        self.cond.notify_all();
        self.with_events(|ev| {
            ev.wake_workers();
            if head_changed {
                ev.head_chunk_changed(&self.config.name);
            }
        });
    }

    /// Remove a task for cancellation or booting.
    ///
    /// A queued task is evicted and returned for the caller to fail. An
    /// in-flight task is cancelled in place: its thread is asked to leave
    /// the pool after the task unwinds, its memory handle is released, and
    /// nothing is returned (it must not be re-scheduled).
    pub fn remove_task(&self, task: &Arc<Task>) -> Option<Arc<Task>> {
        {
            let mut core = self.lock_core();
            if core.queue.remove_task(task) {
                task.release_hold();
                self.update_metrics(&core);
                info!(scheduler = %self.config.name, task = %task.id_str(), "task evicted");
                return Some(Arc::clone(task));
            }
        }
        if !task.is_held() || !self.owns(task) {
            return None;
        }
        if task.mark_scheduler_done() {
            return None;
        }
        task.cancel();
        task.set_leave_pool();
        {
            let mut core = self.lock_core();
            core.in_flight = core.in_flight.saturating_sub(1);
            core.queue.task_complete(task);
            release_active_chunk(&mut core, task.chunk_id());
            let handle = task.take_mem_handle();
            if handle != HANDLE_INVALID {
                self.memman.unlock(handle);
            }
            self.update_metrics(&core);
        }
        info!(scheduler = %self.config.name, task = %task.id_str(),
              "in-flight task removed; thread will leave the pool");
        self.cond.notify_all();
        self.with_events(|ev| ev.wake_workers());
        None
    }

    pub fn queued_size(&self) -> usize {
        self.lock_core().queue.size()
    }

    pub fn in_flight(&self) -> usize {
        self.lock_core().in_flight
    }

    pub fn active_chunk_count(&self) -> usize {
        self.lock_core().active_chunks.len()
    }

    pub fn max_threads_adj(&self) -> usize {
        self.lock_core().max_threads_adj
    }

    /// Adjust the dynamic thread ceiling; clamped to
    /// `max_reserve ..= max_threads`.
    pub fn set_max_threads_adj(&self, value: usize) {
        let clamped = value
            .max(self.config.max_reserve)
            .min(self.config.max_threads);
        let mut core = self.lock_core();
        if core.max_threads_adj != clamped {
            debug!(scheduler = %self.config.name, from = core.max_threads_adj, to = clamped,
                   "thread ceiling adjusted");
            core.max_threads_adj = clamped;
        }
        drop(core);
        self.cond.notify_all();
    }

    /// Stop blocking dispatchers; queued tasks stay queued.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Outstanding deferred handle, for tests and integrity checks.
    pub fn deferred_handle(&self) -> HandleId {
        self.lock_core().handle_to_unlock
    }

    fn release_deferred(&self, core: &mut Core) {
        if core.handle_to_unlock != HANDLE_INVALID {
            self.memman.unlock(core.handle_to_unlock);
            core.handle_to_unlock = HANDLE_INVALID;
        }
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().expect("scheduler lock")
    }

    fn owns(&self, task: &Arc<Task>) -> bool {
        match task.scheduler() {
            Some(sched) => {
                Arc::as_ptr(&sched) as *const () == self as *const ScanScheduler as *const ()
            }
            None => false,
        }
    }

    fn with_events(&self, f: impl FnOnce(&dyn SchedulerEvents)) {
        let events = self.events.lock().expect("scheduler events lock").upgrade();
        if let Some(events) = events {
            f(events.as_ref());
        }
    }

    fn update_metrics(&self, core: &Core) {
        let metrics = global_metrics();
        metrics.set_scheduler_queued_tasks(&self.config.name, core.queue.size() as u64);
        metrics.set_scheduler_inflight_tasks(&self.config.name, core.in_flight as u64);
        metrics.set_scheduler_active_chunks(&self.config.name, core.active_chunks.len() as u64);
    }
}

impl TaskScheduler for ScanScheduler {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn remove_task(&self, task: &Arc<Task>) -> Option<Arc<Task>> {
        ScanScheduler::remove_task(self, task)
    }

    fn max_time_minutes(&self) -> f64 {
        self.config.max_time_minutes
    }
}

fn release_active_chunk(core: &mut Core, chunk: ChunkId) {
    if let Some(count) = core.active_chunks.get_mut(&chunk) {
        *count -= 1;
        if *count == 0 {
            core.active_chunks.remove(&chunk);
        }
    }
}

struct NoEvents;

impl SchedulerEvents for NoEvents {
    fn head_chunk_changed(&self, _scheduler: &str) {}
    fn wake_workers(&self) {}
}
