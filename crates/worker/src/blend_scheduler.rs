//! Blend scheduler: a fixed roster of shared-scan schedulers partitioned by
//! scan rating.
//!
//! Tasks route to the first scheduler whose rating band covers them and
//! fall through to the last entry — the "snail" — otherwise. Pool threads
//! pull through [`BlendScheduler::get_cmd`], which polls the roster in
//! priority order. Whenever occupancy or a head-of-queue chunk changes,
//! `apply_priority` recomputes each scheduler's dynamic thread ceiling so
//! the sum of adjusted caps stays within the pool size while every
//! scheduler keeps its reserve.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use smq_common::{Result, SmqError};
use tracing::{debug, info};

use crate::scan_scheduler::{ScanScheduler, SchedulerEvents};
use crate::task::Task;

struct BlendInner {
    pool_size: usize,
    /// Roster in descending priority order.
    schedulers: Vec<Arc<ScanScheduler>>,
    wake: Mutex<bool>,
    cond: Condvar,
    stopping: AtomicBool,
}

impl BlendInner {
    /// One pass in descending priority: a scheduler with work wants
    /// `max_threads`, an idle one only its reserve; each grant is capped so
    /// lower-priority schedulers keep their reserves, and never drops below
    /// the scheduler's own reserve.
    fn apply_priority(&self) {
        let mut remaining = self.pool_size;
        for (i, sched) in self.schedulers.iter().enumerate() {
            let lower_reserve: usize = self.schedulers[i + 1..]
                .iter()
                .map(|s| s.max_reserve())
                .sum();
            let busy = sched.queued_size() > 0 || sched.in_flight() > 0;
            let want = if busy {
                sched.max_threads()
            } else {
                sched.max_reserve()
            };
            let cap = remaining.saturating_sub(lower_reserve);
            let grant = want.min(cap).max(sched.max_reserve());
            sched.set_max_threads_adj(grant);
            remaining = remaining.saturating_sub(grant);
        }
    }

    fn notify(&self) {
        let mut woken = self.wake.lock().expect("blend lock");
        *woken = true;
        drop(woken);
        self.cond.notify_all();
    }
}

impl SchedulerEvents for BlendInner {
    fn head_chunk_changed(&self, scheduler: &str) {
        debug!(scheduler, "head chunk changed; re-evaluating priorities");
        self.apply_priority();
        self.notify();
    }

    fn wake_workers(&self) {
        self.notify();
    }
}

/// Roster scheduler pool threads pull from.
pub struct BlendScheduler {
    inner: Arc<BlendInner>,
}

impl BlendScheduler {
    /// Build a blend over `schedulers` (any order; sorted by descending
    /// priority here). The last entry after sorting — lowest priority — is
    /// the snail scan, which also catches tasks no rating band covers.
    pub fn new(pool_size: usize, mut schedulers: Vec<Arc<ScanScheduler>>) -> Result<BlendScheduler> {
        if schedulers.is_empty() {
            return Err(SmqError::InvalidConfig(
                "blend scheduler needs at least one scheduler".to_string(),
            ));
        }
        if pool_size == 0 {
            return Err(SmqError::InvalidConfig(
                "pool_size must be positive".to_string(),
            ));
        }
        schedulers.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        let inner = Arc::new(BlendInner {
            pool_size,
            schedulers,
            wake: Mutex::new(false),
            cond: Condvar::new(),
            stopping: AtomicBool::new(false),
        });
        for sched in &inner.schedulers {
            sched.set_events(Arc::downgrade(&inner) as Weak<dyn SchedulerEvents>);
        }
        inner.apply_priority();
        Ok(BlendScheduler { inner })
    }

    /// Scheduler whose rating band covers `rating`, falling through to the
    /// snail.
    pub fn scheduler_for_rating(&self, rating: i32) -> Arc<ScanScheduler> {
        for sched in &self.inner.schedulers {
            if sched.handles_rating(rating) {
                return Arc::clone(sched);
            }
        }
        self.snail()
    }

    /// Lowest-priority scheduler in the roster.
    pub fn snail(&self) -> Arc<ScanScheduler> {
        Arc::clone(
            self.inner
                .schedulers
                .last()
                .expect("roster is never empty"),
        )
    }

    /// Whether `sched` is the snail scan.
    pub fn is_snail(&self, sched: &Arc<ScanScheduler>) -> bool {
        Arc::ptr_eq(sched, self.inner.schedulers.last().expect("roster is never empty"))
    }

    pub fn schedulers(&self) -> &[Arc<ScanScheduler>] {
        &self.inner.schedulers
    }

    /// Route a task by its scan rating and enqueue it.
    pub fn queue_cmd(&self, task: Arc<Task>) -> Result<()> {
        let sched = self.scheduler_for_rating(task.rating());
        debug!(task = %task.id_str(), rating = task.rating(), scheduler = sched.name(),
               "task routed");
        sched.queue_cmd(task)?;
        self.inner.apply_priority();
        Ok(())
    }

    /// Pull the next admissible task across the roster, highest priority
    /// first. Blocks when `wait` until work arrives or shutdown.
    pub fn get_cmd(&self, wait: bool) -> Option<Arc<Task>> {
        loop {
            if self.inner.stopping.load(Ordering::Acquire) {
                return None;
            }
            for sched in &self.inner.schedulers {
                if let Some(task) = sched.get_cmd(false) {
                    return Some(task);
                }
            }
            if !wait {
                return None;
            }
            let woken = self.inner.wake.lock().expect("blend lock");
            let (mut woken, _) = self
                .inner
                .cond
                .wait_timeout(woken, Duration::from_millis(100))
                .expect("blend lock");
            *woken = false;
        }
    }

    /// Route completion back to the owning scheduler and re-evaluate
    /// priorities.
    pub fn command_finish(&self, task: &Arc<Task>) {
        match task.scheduler() {
            Some(sched) => {
                // The trait object is one of ours; finish via the roster so
                // the concrete release protocol runs.
                for candidate in &self.inner.schedulers {
                    if Arc::as_ptr(candidate) as *const ()
                        == Arc::as_ptr(&sched) as *const ()
                    {
                        candidate.command_finish(task);
                        self.inner.apply_priority();
                        return;
                    }
                }
                info!(task = %task.id_str(), "finished task's scheduler is not in this roster");
            }
            None => {
                info!(task = %task.id_str(), "finished task has no scheduler");
            }
        }
    }

    /// Move every still-queued task of the listed set onto the snail scan.
    /// Used when a user query keeps getting booted from faster scans.
    pub fn move_tasks_to_snail(&self, tasks: Vec<Arc<Task>>) -> Result<()> {
        let snail = self.snail();
        for task in tasks {
            info!(task = %task.id_str(), "re-admitting on the snail scan");
            snail.queue_cmd(task)?;
        }
        self.inner.apply_priority();
        Ok(())
    }

    /// Recompute every scheduler's dynamic thread ceiling.
    pub fn apply_priority(&self) {
        self.inner.apply_priority();
    }

    /// Stop all dispatchers.
    pub fn shutdown(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        for sched in &self.inner.schedulers {
            sched.shutdown();
        }
        self.inner.notify();
    }
}
