//! Worker-side task model.
//!
//! A task is one chunk's worth of one user query: the SQL fragments to run,
//! the chunk files to lock, and the scan metadata that routed it. Tasks are
//! shared (`Arc`) between the scheduler that owns them and the thread
//! running them; interior state sits behind one mutex plus a few flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use smq_common::{query_id_str, ChunkId, JobId, QueryId};
use smq_planner::{ScanInfoMsg, TaskFragmentMsg, TaskMsg};

/// Lifecycle of a task on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Queued,
    Running,
    Finished,
}

/// Scheduler surface a task keeps a back-reference to, so statistics and
/// cancellation can reach the owning scheduler without knowing its concrete
/// type.
pub trait TaskScheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Remove `task`; returns it only if it was still queued (the caller
    /// then fails it). In-flight tasks are cancelled in place.
    fn remove_task(&self, task: &Arc<Task>) -> Option<Arc<Task>>;

    /// Wall-clock budget for tasks on this scheduler.
    fn max_time_minutes(&self) -> f64;
}

#[derive(Debug)]
struct TaskTimes {
    state: TaskState,
    queued_at: Option<Instant>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    error: Option<String>,
    mem_handle: crate::memman::HandleId,
}

/// One dispatchable unit of work.
pub struct Task {
    query_id: QueryId,
    job_id: JobId,
    chunk_id: ChunkId,
    db: String,
    fragments: Vec<TaskFragmentMsg>,
    scan: ScanInfoMsg,
    fingerprint: u64,

    inner: Mutex<TaskTimes>,
    scheduler: Mutex<Weak<dyn TaskScheduler>>,
    cancelled: AtomicBool,
    leave_pool: AtomicBool,
    /// True while a scheduler queue or thread owns the task.
    scheduler_held: AtomicBool,
    /// Set once the owning scheduler has accounted the task as finished
    /// (normal completion or boot); guards against double release.
    scheduler_done: AtomicBool,
}

impl Task {
    /// Build a task from its wire message.
    pub fn from_msg(msg: TaskMsg) -> Arc<Task> {
        Arc::new(Task {
            query_id: msg.query_id,
            job_id: msg.job_id,
            chunk_id: msg.chunk_id,
            db: msg.db,
            fragments: msg.fragments,
            scan: msg.scan,
            fingerprint: msg.fingerprint,
            inner: Mutex::new(TaskTimes {
                state: TaskState::Created,
                queued_at: None,
                started_at: None,
                finished_at: None,
                error: None,
                mem_handle: crate::memman::HANDLE_INVALID,
            }),
            scheduler: Mutex::new(
                Weak::<crate::scan_scheduler::ScanScheduler>::new() as Weak<dyn TaskScheduler>
            ),
            cancelled: AtomicBool::new(false),
            leave_pool: AtomicBool::new(false),
            scheduler_held: AtomicBool::new(false),
            scheduler_done: AtomicBool::new(false),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn fragments(&self) -> &[TaskFragmentMsg] {
        &self.fragments
    }

    pub fn scan_info(&self) -> &ScanInfoMsg {
        &self.scan
    }

    pub fn rating(&self) -> i32 {
        self.scan.rating
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// `QI=<query>:<job>` prefix for log lines.
    pub fn id_str(&self) -> String {
        query_id_str(self.query_id, Some(self.job_id))
    }

    /// Distinct chunk files this task needs locked, in first-seen order.
    pub fn files(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for fragment in &self.fragments {
            for file in &fragment.files {
                if !out.contains(file) {
                    out.push(file.clone());
                }
            }
        }
        out
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().expect("task lock").state
    }

    pub(crate) fn set_queued(&self) {
        let mut inner = self.inner.lock().expect("task lock");
        inner.state = TaskState::Queued;
        inner.queued_at = Some(Instant::now());
    }

    pub(crate) fn set_started(&self) {
        let mut inner = self.inner.lock().expect("task lock");
        inner.state = TaskState::Running;
        inner.started_at = Some(Instant::now());
    }

    /// Record completion with an optional runner error; returns the run
    /// duration.
    pub(crate) fn set_finished(&self, error: Option<String>) -> Duration {
        let mut inner = self.inner.lock().expect("task lock");
        let now = Instant::now();
        inner.state = TaskState::Finished;
        inner.finished_at = Some(now);
        inner.error = error;
        match inner.started_at {
            Some(started) => now.duration_since(started),
            None => Duration::ZERO,
        }
    }

    /// Runner error recorded at completion, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.lock().expect("task lock").error.clone()
    }

    /// Time spent running so far (or total, once finished).
    pub fn run_time(&self) -> Option<Duration> {
        let inner = self.inner.lock().expect("task lock");
        let started = inner.started_at?;
        Some(match inner.finished_at {
            Some(finished) => finished.duration_since(started),
            None => started.elapsed(),
        })
    }

    pub(crate) fn set_mem_handle(&self, handle: crate::memman::HandleId) {
        self.inner.lock().expect("task lock").mem_handle = handle;
    }

    pub fn mem_handle(&self) -> crate::memman::HandleId {
        self.inner.lock().expect("task lock").mem_handle
    }

    /// Take the memory handle, leaving the task without one.
    pub(crate) fn take_mem_handle(&self) -> crate::memman::HandleId {
        let mut inner = self.inner.lock().expect("task lock");
        std::mem::replace(&mut inner.mem_handle, crate::memman::HANDLE_INVALID)
    }

    pub(crate) fn set_scheduler(&self, scheduler: Weak<dyn TaskScheduler>) {
        *self.scheduler.lock().expect("task lock") = scheduler;
    }

    /// Scheduler currently responsible for this task, if still alive.
    pub fn scheduler(&self) -> Option<Arc<dyn TaskScheduler>> {
        self.scheduler.lock().expect("task lock").upgrade()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Ask the thread running this task to leave the pool once the task
    /// unwinds.
    pub(crate) fn set_leave_pool(&self) {
        self.leave_pool.store(true, Ordering::Release);
    }

    pub fn leave_pool(&self) -> bool {
        self.leave_pool.load(Ordering::Acquire)
    }

    /// Claim queue/flight ownership; returns false if already owned.
    pub(crate) fn try_hold(&self) -> bool {
        !self.scheduler_held.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_hold(&self) {
        self.scheduler_held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.scheduler_held.load(Ordering::Acquire)
    }

    /// Mark the scheduler-side accounting as done; returns true if it
    /// already was (caller must then skip the release protocol).
    pub(crate) fn mark_scheduler_done(&self) -> bool {
        self.scheduler_done.swap(true, Ordering::AcqRel)
    }

    /// Re-arm scheduler accounting for re-admission (after a boot).
    pub(crate) fn reset_scheduler_state(&self) {
        self.scheduler_done.store(false, Ordering::Release);
        self.leave_pool.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("query_id", &self.query_id)
            .field("job_id", &self.job_id)
            .field("chunk_id", &self.chunk_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use smq_common::{JobId, QueryId};
    use smq_planner::TaskFragmentMsg;

    pub(crate) fn test_msg(query: u64, job: u32, chunk: i32, rating: i32) -> TaskMsg {
        TaskMsg {
            query_id: QueryId(query),
            job_id: JobId(job),
            chunk_id: chunk,
            db: "LSST".to_string(),
            fragments: vec![TaskFragmentMsg {
                queries: vec![format!("SELECT ra FROM LSST.Object_{chunk}")],
                subchunk_ids: vec![],
                subchunk_tables: vec![],
                files: vec![format!("LSST/Object_{chunk}.MYD")],
            }],
            scan: ScanInfoMsg {
                tables: vec![],
                rating,
            },
            fingerprint: 0,
        }
    }

    #[test]
    fn lifecycle_and_run_time() {
        let task = Task::from_msg(test_msg(1, 0, 10, 16));
        assert_eq!(task.state(), TaskState::Created);
        task.set_queued();
        assert_eq!(task.state(), TaskState::Queued);
        task.set_started();
        assert!(task.run_time().is_some());
        let elapsed = task.set_finished(None);
        assert_eq!(task.state(), TaskState::Finished);
        assert!(task.run_time().unwrap() >= elapsed);
        assert!(task.error().is_none());
    }

    #[test]
    fn hold_is_exclusive() {
        let task = Task::from_msg(test_msg(1, 0, 10, 16));
        assert!(task.try_hold());
        assert!(!task.try_hold());
        task.release_hold();
        assert!(task.try_hold());
    }

    #[test]
    fn files_are_deduplicated() {
        let mut msg = test_msg(1, 0, 10, 16);
        msg.fragments.push(msg.fragments[0].clone());
        let task = Task::from_msg(msg);
        assert_eq!(task.files(), vec!["LSST/Object_10.MYD"]);
    }
}
