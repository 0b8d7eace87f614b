//! Worker thread pool.
//!
//! Each thread repeatedly pulls from the blend scheduler, runs the task
//! through the [`TaskRunner`] seam (the SQL engine lives behind it), and
//! drives the scheduler's start/finish protocol. Runner failures become a
//! typed result recorded on the task and in the statistics registry; the
//! process never aborts on a task failure.
//!
//! A thread whose task was removed mid-run observes the task's leave-pool
//! flag after the task unwinds, spawns its replacement, and exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use smq_common::Result;
use tracing::{debug, info, warn};

use crate::blend_scheduler::BlendScheduler;
use crate::queries_and_chunks::QueriesAndChunks;
use crate::task::{Task, TaskScheduler};

/// Seam to the SQL execution engine.
pub trait TaskRunner: Send + Sync {
    /// Execute every fragment of `task`. Returning an error fails the task
    /// without affecting the worker.
    fn run(&self, task: &Arc<Task>) -> Result<()>;
}

/// Bounded pool of scheduler-driven worker threads.
pub struct ThreadPool {
    blend: Arc<BlendScheduler>,
    runner: Arc<dyn TaskRunner>,
    stats: Arc<QueriesAndChunks>,
    stopping: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Start `size` worker threads.
    pub fn new(
        size: usize,
        blend: Arc<BlendScheduler>,
        runner: Arc<dyn TaskRunner>,
        stats: Arc<QueriesAndChunks>,
    ) -> Arc<ThreadPool> {
        let pool = Arc::new(ThreadPool {
            blend,
            runner,
            stats,
            stopping: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::with_capacity(size)),
        });
        for _ in 0..size {
            ThreadPool::spawn_worker(&pool);
        }
        pool
    }

    fn spawn_worker(pool: &Arc<ThreadPool>) {
        let weak: Weak<ThreadPool> = Arc::downgrade(pool);
        let handle = std::thread::spawn(move || worker_loop(weak));
        pool.threads.lock().expect("pool lock").push(handle);
    }

    /// Submit a task: registers statistics and routes through the blend.
    pub fn submit(&self, task: Arc<Task>) -> Result<()> {
        self.stats.add_task(&task);
        self.blend.queue_cmd(Arc::clone(&task))?;
        self.stats.queued_task(&task);
        Ok(())
    }

    /// Stop dispatch and join every thread.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.blend.shutdown();
        let threads: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.threads.lock().expect("pool lock"));
        for handle in threads {
            let _ = handle.join();
        }
    }
}

fn worker_loop(pool: Weak<ThreadPool>) {
    loop {
        let Some(pool_ref) = pool.upgrade() else {
            return;
        };
        if pool_ref.stopping.load(Ordering::Acquire) {
            return;
        }
        let task = pool_ref.blend.get_cmd(true);
        let Some(task) = task else {
            // Shutdown or spurious wake; re-check the flags.
            if pool_ref.stopping.load(Ordering::Acquire) {
                return;
            }
            drop(pool_ref);
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };

        let sched = task.scheduler();
        if let Some(sched) = &sched {
            debug!(task = %task.id_str(), scheduler = sched.name(), "running task");
        }
        if let Some(concrete) = pool_ref
            .blend
            .schedulers()
            .iter()
            .find(|s| Some(s.name()) == sched.as_ref().map(|x| x.name()))
        {
            concrete.command_start(&task);
        }
        pool_ref.stats.started_task(&task);

        let outcome = if task.is_cancelled() {
            Ok(())
        } else {
            pool_ref.runner.run(&task)
        };
        let error = outcome.err().map(|e| e.to_string());
        if let Some(err) = &error {
            warn!(task = %task.id_str(), %err, "task failed");
        }
        task.set_finished(error);

        pool_ref.blend.command_finish(&task);
        pool_ref.stats.finished_task(&task);

        if task.leave_pool() {
            info!(task = %task.id_str(), "thread leaving the pool after removed task");
            if !pool_ref.stopping.load(Ordering::Acquire) {
                ThreadPool::spawn_worker(&pool_ref);
            }
            return;
        }
    }
}
