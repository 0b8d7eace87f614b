use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use smq_common::{JobId, QueryId, SchedulerConfig, TaskQueueVariant};
use smq_planner::{ScanInfoMsg, ScanTableMsg, TaskFragmentMsg, TaskMsg};
use smq_worker::{
    BlendScheduler, BudgetMemMan, HandleId, LockResult, MemMan, MemManNone, QueriesAndChunks,
    ScanScheduler, Task, TaskRunner, ThreadPool, HANDLE_INVALID,
};

fn sched_config(name: &str) -> SchedulerConfig {
    SchedulerConfig {
        name: name.to_string(),
        max_threads: 2,
        max_reserve: 1,
        priority: 10,
        max_active_chunks: 2,
        min_rating: 0,
        max_rating: 100,
        max_time_minutes: 30.0,
        queue_variant: TaskQueueVariant::ChunkTasks,
    }
}

fn task_msg(query: u64, job: u32, chunk: i32, rating: i32) -> TaskMsg {
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
            tables: vec![ScanTableMsg {
                db: "LSST".to_string(),
                table: "Object".to_string(),
                lock_in_memory: true,
                rating,
            }],
            rating,
        },
        fingerprint: 0,
    }
}

fn make_task(query: u64, job: u32, chunk: i32, rating: i32) -> Arc<Task> {
    Task::from_msg(task_msg(query, job, chunk, rating))
}

/// Memory manager that grants everything and records unlock calls.
#[derive(Default)]
struct TrackingMemMan {
    next: AtomicUsize,
    unlocks: Mutex<Vec<HandleId>>,
    outstanding: AtomicUsize,
}

impl TrackingMemMan {
    fn new() -> Arc<TrackingMemMan> {
        Arc::new(TrackingMemMan {
            next: AtomicUsize::new(2),
            ..TrackingMemMan::default()
        })
    }

    fn unlock_count(&self) -> usize {
        self.unlocks.lock().unwrap().len()
    }
}

impl MemMan for TrackingMemMan {
    fn lock(&self, files: &[String], _flexible: bool) -> LockResult {
        if files.is_empty() {
            return LockResult::Locked {
                handle: smq_worker::HANDLE_EMPTY,
                bytes: 0,
            };
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        LockResult::Locked {
            handle: self.next.fetch_add(1, Ordering::SeqCst) as HandleId,
            bytes: 0,
        }
    }

    fn unlock(&self, handle: HandleId) {
        if handle <= smq_worker::HANDLE_EMPTY {
            return;
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.unlocks.lock().unwrap().push(handle);
    }

    fn locked_bytes(&self) -> u64 {
        0
    }

    fn handle_count(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[test]
fn tasks_build_from_the_wire_format() {
    let text = r#"{
        "query_id": 11, "job_id": 3, "chunk_id": 42, "db": "LSST",
        "fragments": [{
            "queries": ["SELECT ra FROM LSST.Object_42 WHERE objectId = 1"],
            "subchunk_ids": [], "subchunk_tables": [],
            "files": ["LSST/Object_42.MYD"]
        }],
        "scan": {
            "tables": [{"db": "LSST", "table": "Object",
                        "lock_in_memory": true, "rating": 16}],
            "rating": 16
        },
        "fingerprint": 7
    }"#;
    let msg: TaskMsg = serde_json::from_str(text).unwrap();
    let task = Task::from_msg(msg);
    assert_eq!(task.query_id(), QueryId(11));
    assert_eq!(task.chunk_id(), 42);
    assert_eq!(task.rating(), 16);
    assert_eq!(task.files(), ["LSST/Object_42.MYD"]);
    assert_eq!(task.id_str(), "QI=11:3");
}

#[test]
fn dispatch_groups_by_chunk_affinity() {
    let sched = ScanScheduler::new(sched_config("Affinity"), Arc::new(MemManNone::new())).unwrap();
    let chunks = [10, 20, 10, 20, 10, 30];
    for (job, chunk) in chunks.iter().enumerate() {
        sched
            .queue_cmd(make_task(1, job as u32, *chunk, 16))
            .unwrap();
    }
    let mut order = Vec::new();
    while let Some(task) = sched.get_cmd(false) {
        order.push(task.chunk_id());
        sched.command_start(&task);
        sched.command_finish(&task);
    }
    assert_eq!(order, vec![10, 10, 10, 20, 20, 30]);
}

#[test]
fn in_flight_never_exceeds_adjusted_ceiling() {
    let sched = ScanScheduler::new(sched_config("Caps"), Arc::new(MemManNone::new())).unwrap();
    for job in 0..4 {
        sched.queue_cmd(make_task(1, job, 10, 16)).unwrap();
    }
    let t1 = sched.get_cmd(false).unwrap();
    let t2 = sched.get_cmd(false).unwrap();
    assert!(sched.get_cmd(false).is_none(), "max_threads is 2");
    assert_eq!(sched.in_flight(), 2);
    assert!(sched.in_flight() <= sched.max_threads_adj());
    assert!(sched.max_threads_adj() <= sched.max_threads());
    assert!(sched.active_chunk_count() <= sched.in_flight());

    sched.command_finish(&t1);
    assert!(sched.get_cmd(false).is_some());
    sched.command_finish(&t2);
}

#[test]
fn new_chunks_are_capped_by_max_active_chunks() {
    let mut config = sched_config("ActiveChunks");
    config.max_threads = 4;
    config.max_reserve = 1;
    config.max_active_chunks = 1;
    let sched = ScanScheduler::new(config, Arc::new(MemManNone::new())).unwrap();
    sched.queue_cmd(make_task(1, 0, 10, 16)).unwrap();
    sched.queue_cmd(make_task(1, 1, 20, 16)).unwrap();

    let t10 = sched.get_cmd(false).unwrap();
    assert_eq!(t10.chunk_id(), 10);
    assert!(
        sched.get_cmd(false).is_none(),
        "chunk 20 must wait for the active-chunk slot"
    );
    sched.command_finish(&t10);
    let t20 = sched.get_cmd(false).unwrap();
    assert_eq!(t20.chunk_id(), 20);
    sched.command_finish(&t20);
}

#[test]
fn deferred_unlock_spans_back_to_back_tasks() {
    let memman = TrackingMemMan::new();
    let sched = ScanScheduler::new(
        sched_config("Deferred"),
        Arc::clone(&memman) as Arc<dyn MemMan>,
    )
    .unwrap();

    let t1 = make_task(1, 0, 5, 16);
    sched.queue_cmd(Arc::clone(&t1)).unwrap();
    let t1 = sched.get_cmd(false).unwrap();
    sched.command_start(&t1);

    // The follow-up on the same chunk arrives before completion.
    let t2 = make_task(1, 1, 5, 16);
    sched.queue_cmd(Arc::clone(&t2)).unwrap();
    sched.command_finish(&t1);
    assert_eq!(
        memman.unlock_count(),
        0,
        "handle must stay locked across the gap"
    );

    let t2 = sched.get_cmd(false).unwrap();
    sched.command_start(&t2);
    sched.command_finish(&t2);
    assert_eq!(memman.unlock_count(), 2);
    assert_eq!(memman.handle_count(), 0);
    assert_eq!(sched.deferred_handle(), HANDLE_INVALID);
}

#[test]
fn idle_empty_scheduler_holds_no_memory() {
    let memman = Arc::new(BudgetMemMan::new(1024, 64));
    let sched = ScanScheduler::new(
        sched_config("Liveness"),
        Arc::clone(&memman) as Arc<dyn MemMan>,
    )
    .unwrap();
    for (job, chunk) in [10, 20].iter().enumerate() {
        sched.queue_cmd(make_task(1, job as u32, *chunk, 16)).unwrap();
    }
    while let Some(task) = sched.get_cmd(false) {
        sched.command_start(&task);
        sched.command_finish(&task);
    }
    assert_eq!(sched.queued_size(), 0);
    assert_eq!(sched.in_flight(), 0);
    assert_eq!(memman.handle_count(), 0);
    assert_eq!(memman.locked_bytes(), 0);
    assert_eq!(sched.deferred_handle(), HANDLE_INVALID);
}

#[test]
fn memory_refusal_defers_dispatch() {
    // Budget fits one task's file at a time.
    let memman = Arc::new(BudgetMemMan::new(64, 64));
    let sched = ScanScheduler::new(
        sched_config("Budget"),
        Arc::clone(&memman) as Arc<dyn MemMan>,
    )
    .unwrap();
    sched.queue_cmd(make_task(1, 0, 10, 16)).unwrap();
    sched.queue_cmd(make_task(1, 1, 20, 16)).unwrap();

    let t10 = sched.get_cmd(false).unwrap();
    // Chunk 20 cannot lock its file yet; the scheduler treats it as not
    // ready rather than failing anything.
    assert!(sched.get_cmd(false).is_none());
    assert_eq!(sched.queued_size(), 1);
    sched.command_finish(&t10);
    let t20 = sched.get_cmd(false).unwrap();
    assert_eq!(t20.chunk_id(), 20);
    sched.command_finish(&t20);
    assert_eq!(memman.handle_count(), 0);
}

#[test]
fn removed_queued_task_is_returned_and_never_dispatched() {
    let sched = ScanScheduler::new(sched_config("Cancel"), Arc::new(MemManNone::new())).unwrap();
    let t1 = make_task(1, 0, 10, 16);
    let t2 = make_task(1, 1, 11, 16);
    sched.queue_cmd(Arc::clone(&t1)).unwrap();
    sched.queue_cmd(Arc::clone(&t2)).unwrap();

    let removed = sched.remove_task(&t1).expect("queued task is returned");
    assert!(Arc::ptr_eq(&removed, &t1));
    let dispatched = sched.get_cmd(false).unwrap();
    assert!(Arc::ptr_eq(&dispatched, &t2));
    assert!(sched.get_cmd(false).is_none());
    sched.command_finish(&dispatched);
}

#[test]
fn removed_inflight_task_is_cancelled_in_place() {
    let memman = TrackingMemMan::new();
    let sched = ScanScheduler::new(
        sched_config("Boot"),
        Arc::clone(&memman) as Arc<dyn MemMan>,
    )
    .unwrap();
    let task = make_task(1, 0, 10, 16);
    sched.queue_cmd(Arc::clone(&task)).unwrap();
    let task = sched.get_cmd(false).unwrap();
    sched.command_start(&task);

    assert!(sched.remove_task(&task).is_none(), "in flight: not returned");
    assert!(task.is_cancelled());
    assert!(task.leave_pool());
    assert_eq!(sched.in_flight(), 0);
    assert_eq!(sched.active_chunk_count(), 0);
    assert_eq!(memman.handle_count(), 0, "its memory handle is released");

    // The thread's normal completion path must not double-release.
    sched.command_finish(&task);
    assert_eq!(sched.in_flight(), 0);
    assert_eq!(memman.unlock_count(), 1);
}

#[test]
fn blend_routes_by_rating_band_and_adjusts_ceilings() {
    let memman: Arc<dyn MemMan> = Arc::new(MemManNone::new());
    let mut fast_cfg = sched_config("Fast");
    fast_cfg.priority = 30;
    fast_cfg.max_threads = 8;
    fast_cfg.max_reserve = 2;
    fast_cfg.min_rating = 0;
    fast_cfg.max_rating = 33;
    let mut med_cfg = sched_config("Med");
    med_cfg.priority = 20;
    med_cfg.max_threads = 8;
    med_cfg.max_reserve = 2;
    med_cfg.min_rating = 34;
    med_cfg.max_rating = 66;
    let mut slow_cfg = sched_config("Slow");
    slow_cfg.priority = 10;
    slow_cfg.max_threads = 8;
    slow_cfg.max_reserve = 2;
    slow_cfg.min_rating = 67;
    slow_cfg.max_rating = 100;

    let fast = ScanScheduler::new(fast_cfg, Arc::clone(&memman)).unwrap();
    let med = ScanScheduler::new(med_cfg, Arc::clone(&memman)).unwrap();
    let slow = ScanScheduler::new(slow_cfg, Arc::clone(&memman)).unwrap();
    let blend = BlendScheduler::new(
        10,
        vec![Arc::clone(&slow), Arc::clone(&fast), Arc::clone(&med)],
    )
    .unwrap();

    assert_eq!(blend.scheduler_for_rating(16).name(), "Fast");
    assert_eq!(blend.scheduler_for_rating(50).name(), "Med");
    assert_eq!(blend.scheduler_for_rating(90).name(), "Slow");
    // Out-of-band ratings fall through to the snail.
    assert_eq!(blend.scheduler_for_rating(1000).name(), "Slow");
    assert!(blend.is_snail(&slow));

    // Idle roster: everyone sits at reserve.
    assert_eq!(fast.max_threads_adj(), 2);
    assert_eq!(med.max_threads_adj(), 2);
    assert_eq!(slow.max_threads_adj(), 2);

    // A busy high-priority scheduler claims threads; the rest keep their
    // reserves.
    blend.queue_cmd(make_task(1, 0, 10, 16)).unwrap();
    assert_eq!(fast.max_threads_adj(), 6, "10 - reserves of Med and Slow");
    assert_eq!(med.max_threads_adj(), 2);
    assert_eq!(slow.max_threads_adj(), 2);

    let task = blend.get_cmd(false).unwrap();
    assert_eq!(task.chunk_id(), 10);
    blend.command_finish(&task);
    assert_eq!(fast.max_threads_adj(), 2, "idle again after completion");
    blend.shutdown();
}

#[test]
fn statistics_track_lifecycle_and_cancellation() {
    let stats = QueriesAndChunks::new(Duration::from_secs(3600), 2);
    let sched = ScanScheduler::new(sched_config("Stats"), Arc::new(MemManNone::new())).unwrap();

    let t1 = make_task(9, 0, 10, 16);
    let t2 = make_task(9, 1, 20, 16);
    for task in [&t1, &t2] {
        stats.add_task(task);
        sched.queue_cmd(Arc::clone(task)).unwrap();
        stats.queued_task(task);
    }

    let running = sched.get_cmd(false).unwrap();
    sched.command_start(&running);
    stats.started_task(&running);
    let snapshot = stats.get_stats(QueryId(9)).unwrap().snapshot();
    assert_eq!(snapshot.size, 2);
    assert_eq!(snapshot.tasks_running, 1);

    // Cancel the query: the queued task comes back for failing, the
    // running one is cancelled in place.
    let evicted = stats.cancel_query(QueryId(9));
    assert_eq!(evicted.len(), 1);
    assert!(running.is_cancelled());

    sched.command_finish(&running);
    stats.finished_task(&running);
    let snapshot = stats.get_stats(QueryId(9)).unwrap().snapshot();
    assert_eq!(snapshot.tasks_completed, 1);
    assert_eq!(snapshot.tasks_running, 0);
}

#[test]
fn overlong_tasks_are_booted_and_escalate_to_the_snail() {
    let memman: Arc<dyn MemMan> = Arc::new(MemManNone::new());
    let mut fast_cfg = sched_config("Fast");
    fast_cfg.priority = 20;
    fast_cfg.max_time_minutes = 0.0;
    let mut snail_cfg = sched_config("Snail");
    snail_cfg.priority = 1;
    snail_cfg.max_time_minutes = 480.0;
    let fast = ScanScheduler::new(fast_cfg, Arc::clone(&memman)).unwrap();
    let snail = ScanScheduler::new(snail_cfg, Arc::clone(&memman)).unwrap();
    let blend = Arc::new(
        BlendScheduler::new(4, vec![Arc::clone(&fast), Arc::clone(&snail)]).unwrap(),
    );

    // Boot threshold of zero: the first boot moves the query over.
    let stats = QueriesAndChunks::new(Duration::from_secs(3600), 0);
    stats.set_blend_scheduler(&blend);

    let running = make_task(5, 0, 10, 16);
    let queued = make_task(5, 1, 11, 16);
    for task in [&running, &queued] {
        stats.add_task(task);
        fast.queue_cmd(Arc::clone(task)).unwrap();
        stats.queued_task(task);
    }
    let running = fast.get_cmd(false).unwrap();
    fast.command_start(&running);
    stats.started_task(&running);
    std::thread::sleep(Duration::from_millis(5));

    stats.examine_all();

    let snapshot = stats.get_stats(QueryId(5)).unwrap().snapshot();
    assert_eq!(snapshot.tasks_booted, 1);
    assert!(running.is_cancelled());
    assert_eq!(fast.in_flight(), 0);
    assert_eq!(fast.queued_size(), 0, "remaining task moved off the fast scan");
    assert_eq!(snail.queued_size(), 1, "remaining task re-admitted on the snail");
    blend.shutdown();
}

struct CountingRunner {
    completed: AtomicUsize,
}

impl TaskRunner for CountingRunner {
    fn run(&self, task: &Arc<Task>) -> smq_common::Result<()> {
        std::thread::sleep(Duration::from_millis(2));
        if task.is_cancelled() {
            return Ok(());
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn thread_pool_drains_submissions() {
    let memman: Arc<dyn MemMan> = Arc::new(MemManNone::new());
    let mut config = sched_config("Pool");
    config.max_threads = 4;
    config.max_active_chunks = 4;
    let sched = ScanScheduler::new(config, Arc::clone(&memman)).unwrap();
    let blend = Arc::new(BlendScheduler::new(4, vec![sched]).unwrap());
    let stats = QueriesAndChunks::new(Duration::from_secs(3600), 2);
    let runner = Arc::new(CountingRunner {
        completed: AtomicUsize::new(0),
    });
    let pool = ThreadPool::new(
        3,
        Arc::clone(&blend),
        Arc::clone(&runner) as Arc<dyn TaskRunner>,
        Arc::clone(&stats),
    );

    for job in 0..8 {
        pool.submit(make_task(3, job, (job % 3) as i32 * 10, 16))
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let done = stats
            .get_stats(QueryId(3))
            .map(|s| s.snapshot().tasks_completed)
            .unwrap_or(0);
        if done == 8 {
            break;
        }
        assert!(Instant::now() < deadline, "pool failed to drain in time");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(runner.completed.load(Ordering::SeqCst), 8);
    pool.shutdown();

    let snapshot = stats.get_stats(QueryId(3)).unwrap().snapshot();
    assert_eq!(snapshot.tasks_completed, 8);
    assert_eq!(snapshot.tasks_running, 0);
    assert_eq!(memman.handle_count(), 0);
}
