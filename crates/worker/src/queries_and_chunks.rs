//! Per-query and per-chunk statistics, slow-task booting, and cancellation.
//!
//! Every task is registered here; queue/start/finish transitions update the
//! owning query's counters under that query's own mutex. Completion times
//! feed per-chunk per-table rolling averages, which `examine_all` uses to
//! boot running tasks consuming more than their share of a scheduler's
//! time budget. Queries booted too often move wholesale to the snail scan.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use smq_common::metrics::global_metrics;
use smq_common::{query_id_str, ChunkId, JobId, QueryId};
use tracing::{debug, info, warn};

use crate::blend_scheduler::BlendScheduler;
use crate::task::{Task, TaskScheduler, TaskState};

const WEIGHT_AVG: f64 = 9.0;
const WEIGHT_NEW: f64 = 1.0;

/// Completion record mirrored back to the dispatch layer alongside the
/// result stream.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueryStatsSnapshot {
    pub size: usize,
    pub tasks_running: usize,
    pub tasks_completed: usize,
    pub tasks_booted: usize,
    pub total_time_minutes: f64,
}

#[derive(Debug)]
struct QueryStatsInner {
    touched: Instant,
    size: usize,
    tasks_running: usize,
    tasks_completed: usize,
    tasks_booted: usize,
    total_time_minutes: f64,
    task_map: HashMap<JobId, Arc<Task>>,
}

/// Statistics for one user query, guarded by its own mutex.
pub struct QueryStatistics {
    query_id: QueryId,
    inner: Mutex<QueryStatsInner>,
}

impl QueryStatistics {
    fn new(query_id: QueryId) -> Arc<QueryStatistics> {
        Arc::new(QueryStatistics {
            query_id,
            inner: Mutex::new(QueryStatsInner {
                touched: Instant::now(),
                size: 0,
                tasks_running: 0,
                tasks_completed: 0,
                tasks_booted: 0,
                total_time_minutes: 0.0,
                task_map: HashMap::new(),
            }),
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    fn add_task(&self, task: Arc<Task>) {
        let mut inner = self.lock();
        inner.task_map.insert(task.job_id(), task);
    }

    pub fn tasks_booted(&self) -> usize {
        self.lock().tasks_booted
    }

    pub fn snapshot(&self) -> QueryStatsSnapshot {
        let inner = self.lock();
        QueryStatsSnapshot {
            size: inner.size,
            tasks_running: inner.tasks_running,
            tasks_completed: inner.tasks_completed,
            tasks_booted: inner.tasks_booted,
            total_time_minutes: inner.total_time_minutes,
        }
    }

    /// True when all tasks completed and nothing touched the query for
    /// `dead_after`.
    pub fn is_dead(&self, dead_after: Duration, now: Instant) -> bool {
        let inner = self.lock();
        inner.tasks_completed >= inner.size && now.duration_since(inner.touched) > dead_after
    }

    fn running_tasks(&self) -> Vec<Arc<Task>> {
        self.lock()
            .task_map
            .values()
            .filter(|t| t.state() == TaskState::Running)
            .cloned()
            .collect()
    }

    fn all_tasks(&self) -> Vec<Arc<Task>> {
        self.lock().task_map.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueryStatsInner> {
        self.inner.lock().expect("query stats lock")
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChunkTableData {
    pub tasks_completed: usize,
    pub tasks_booted: usize,
    pub avg_completion_minutes: f64,
}

/// Rolling completion-time average for one table on one chunk.
pub struct ChunkTableStats {
    chunk_id: ChunkId,
    table: String,
    data: Mutex<ChunkTableData>,
}

impl ChunkTableStats {
    fn new(chunk_id: ChunkId, table: &str) -> Arc<ChunkTableStats> {
        Arc::new(ChunkTableStats {
            chunk_id,
            table: table.to_string(),
            data: Mutex::new(ChunkTableData::default()),
        })
    }

    /// `db:table` key used across chunk statistics.
    pub fn table_name(db: &str, table: &str) -> String {
        format!("{db}:{table}")
    }

    fn add_task_finished(&self, minutes: f64) {
        let mut data = self.data.lock().expect("chunk table stats lock");
        data.tasks_completed += 1;
        if data.tasks_completed > 1 {
            data.avg_completion_minutes = (data.avg_completion_minutes * WEIGHT_AVG
                + minutes * WEIGHT_NEW)
                / (WEIGHT_AVG + WEIGHT_NEW);
        } else {
            data.avg_completion_minutes = minutes;
        }
        debug!(chunk = self.chunk_id, table = %self.table,
               completed = data.tasks_completed, avg = data.avg_completion_minutes,
               "chunk table stats updated");
    }

    pub fn data(&self) -> ChunkTableData {
        *self.data.lock().expect("chunk table stats lock")
    }
}

/// Per-chunk statistics: one [`ChunkTableStats`] per scanned table.
pub struct ChunkStatistics {
    chunk_id: ChunkId,
    tables: Mutex<HashMap<String, Arc<ChunkTableStats>>>,
}

impl ChunkStatistics {
    fn new(chunk_id: ChunkId) -> Arc<ChunkStatistics> {
        Arc::new(ChunkStatistics {
            chunk_id,
            tables: Mutex::new(HashMap::new()),
        })
    }

    fn add(&self, table_name: &str, minutes: f64) -> Arc<ChunkTableStats> {
        let stats = {
            let mut tables = self.tables.lock().expect("chunk stats lock");
            Arc::clone(
                tables
                    .entry(table_name.to_string())
                    .or_insert_with(|| ChunkTableStats::new(self.chunk_id, table_name)),
            )
        };
        stats.add_task_finished(minutes);
        stats
    }

    pub fn table_stats(&self, table_name: &str) -> Option<Arc<ChunkTableStats>> {
        self.tables
            .lock()
            .expect("chunk stats lock")
            .get(table_name)
            .cloned()
    }
}

struct ScanTableSums {
    total_time: f64,
    chunk_percentages: HashMap<ChunkId, ChunkTimePercent>,
}

struct ChunkTimePercent {
    shard_time: f64,
    percent: f64,
    valid: bool,
}

/// Registry of all user queries and chunks seen by this worker.
pub struct QueriesAndChunks {
    query_stats: Mutex<HashMap<QueryId, Arc<QueryStatistics>>>,
    chunk_stats: Mutex<BTreeMap<ChunkId, Arc<ChunkStatistics>>>,
    dead: Mutex<Vec<Arc<QueryStatistics>>>,
    dead_after: Duration,
    /// Completions needed on a chunk-table before its percent is trusted.
    required_tasks_completed: AtomicU32,
    max_tasks_booted: usize,
    blend: Mutex<Weak<BlendScheduler>>,
}

impl QueriesAndChunks {
    pub fn new(dead_after: Duration, max_tasks_booted: usize) -> Arc<QueriesAndChunks> {
        Arc::new(QueriesAndChunks {
            query_stats: Mutex::new(HashMap::new()),
            chunk_stats: Mutex::new(BTreeMap::new()),
            dead: Mutex::new(Vec::new()),
            dead_after,
            required_tasks_completed: AtomicU32::new(50),
            max_tasks_booted,
            blend: Mutex::new(Weak::new()),
        })
    }

    pub fn set_blend_scheduler(&self, blend: &Arc<BlendScheduler>) {
        *self.blend.lock().expect("stats lock") = Arc::downgrade(blend);
    }

    pub fn set_required_tasks_completed(&self, value: u32) {
        self.required_tasks_completed.store(value, Ordering::Relaxed);
    }

    /// Register a task, creating the query's statistics if needed.
    pub fn add_task(&self, task: &Arc<Task>) {
        let stats = {
            let mut queries = self.query_stats.lock().expect("stats lock");
            Arc::clone(
                queries
                    .entry(task.query_id())
                    .or_insert_with(|| QueryStatistics::new(task.query_id())),
            )
        };
        stats.add_task(Arc::clone(task));
    }

    /// Update statistics for a task that was just queued.
    pub fn queued_task(&self, task: &Arc<Task>) {
        if let Some(stats) = self.get_stats(task.query_id()) {
            let mut inner = stats.lock();
            inner.touched = Instant::now();
            inner.size += 1;
        }
    }

    /// Update statistics for a task that just started running.
    pub fn started_task(&self, task: &Arc<Task>) {
        if let Some(stats) = self.get_stats(task.query_id()) {
            let mut inner = stats.lock();
            inner.touched = Instant::now();
            inner.tasks_running += 1;
        }
    }

    /// Update statistics for a finished task and the chunk it scanned.
    pub fn finished_task(&self, task: &Arc<Task>) {
        let minutes = task
            .run_time()
            .map(|d| d.as_secs_f64() / 60.0)
            .unwrap_or(0.0);
        if let Some(stats) = self.get_stats(task.query_id()) {
            let mostly_dead = {
                let mut inner = stats.lock();
                inner.touched = Instant::now();
                inner.tasks_running = inner.tasks_running.saturating_sub(1);
                inner.tasks_completed += 1;
                inner.total_time_minutes += minutes;
                inner.tasks_completed >= inner.size
            };
            if mostly_dead {
                self.dead.lock().expect("stats lock").push(stats);
            }
        }
        self.finished_task_for_chunk(task, minutes);
    }

    fn finished_task_for_chunk(&self, task: &Arc<Task>, minutes: f64) {
        let table_name = match task.scan_info().tables.first() {
            Some(t) => ChunkTableStats::table_name(&t.db, &t.table),
            None => return,
        };
        let chunk = {
            let mut chunks = self.chunk_stats.lock().expect("stats lock");
            Arc::clone(
                chunks
                    .entry(task.chunk_id())
                    .or_insert_with(|| ChunkStatistics::new(task.chunk_id())),
            )
        };
        chunk.add(&table_name, minutes);
    }

    pub fn get_stats(&self, query_id: QueryId) -> Option<Arc<QueryStatistics>> {
        self.query_stats
            .lock()
            .expect("stats lock")
            .get(&query_id)
            .cloned()
    }

    pub fn chunk_statistics(&self, chunk_id: ChunkId) -> Option<Arc<ChunkStatistics>> {
        self.chunk_stats
            .lock()
            .expect("stats lock")
            .get(&chunk_id)
            .cloned()
    }

    /// Reap statistics for queries that finished long ago.
    pub fn remove_dead(&self) {
        let now = Instant::now();
        let mut reap = Vec::new();
        {
            let mut dead = self.dead.lock().expect("stats lock");
            dead.retain(|stats| {
                if stats.is_dead(self.dead_after, now) {
                    reap.push(Arc::clone(stats));
                    false
                } else {
                    true
                }
            });
        }
        if reap.is_empty() {
            return;
        }
        let mut queries = self.query_stats.lock().expect("stats lock");
        for stats in reap {
            debug!("{} reaping query statistics", query_id_str(stats.query_id(), None));
            queries.remove(&stats.query_id());
        }
    }

    /// Examine all running tasks; boot the ones exceeding their share of
    /// their scheduler's time budget. Expected to run every few minutes.
    pub fn examine_all(&self) {
        let scan_table_sums = self.calc_scan_table_sums();
        let queries: Vec<Arc<QueryStatistics>> = self
            .query_stats
            .lock()
            .expect("stats lock")
            .values()
            .cloned()
            .collect();

        for query in &queries {
            for task in query.running_tasks() {
                let sched = match task.scheduler() {
                    Some(sched) => sched,
                    None => continue,
                };
                let sched_max_minutes = sched.max_time_minutes();
                let run_minutes = task
                    .run_time()
                    .map(|d| d.as_secs_f64() / 60.0)
                    .unwrap_or(0.0);

                // Absolute budget first; the per-chunk share refines it
                // once enough completions make the percentage trustworthy.
                let mut booting = run_minutes > sched_max_minutes;
                if !booting {
                    if let Some(first) = task.scan_info().tables.first() {
                        let table_name = ChunkTableStats::table_name(&first.db, &first.table);
                        if let Some(sums) = scan_table_sums.get(&table_name) {
                            if let Some(percent) = sums.chunk_percentages.get(&task.chunk_id()) {
                                if percent.valid {
                                    booting =
                                        run_minutes > percent.percent * sched_max_minutes;
                                }
                            }
                        }
                    }
                }
                if booting {
                    self.boot_task(query, &task);
                }
            }
        }
    }

    /// Per-table time totals across chunks, with each chunk's share of the
    /// whole. Shares are valid only after enough completions.
    fn calc_scan_table_sums(&self) -> HashMap<String, ScanTableSums> {
        let required = self.required_tasks_completed.load(Ordering::Relaxed) as usize;
        let chunks: Vec<Arc<ChunkStatistics>> = self
            .chunk_stats
            .lock()
            .expect("stats lock")
            .values()
            .cloned()
            .collect();

        let mut sums: HashMap<String, ScanTableSums> = HashMap::new();
        for chunk in &chunks {
            let tables = chunk.tables.lock().expect("chunk stats lock");
            for (table_name, stats) in tables.iter() {
                let data = stats.data();
                let entry = sums.entry(table_name.clone()).or_insert(ScanTableSums {
                    total_time: 0.0,
                    chunk_percentages: HashMap::new(),
                });
                entry.total_time += data.avg_completion_minutes;
                entry.chunk_percentages.insert(
                    chunk.chunk_id,
                    ChunkTimePercent {
                        shard_time: data.avg_completion_minutes,
                        percent: 0.0,
                        valid: data.tasks_completed >= required,
                    },
                );
            }
        }
        for sums_entry in sums.values_mut() {
            let total = sums_entry.total_time;
            if total <= 0.0 {
                continue;
            }
            for percent in sums_entry.chunk_percentages.values_mut() {
                percent.percent = percent.shard_time / total;
            }
        }
        sums
    }

    /// Boot one running task. If its query has been booted too often, the
    /// query's remaining tasks move to the snail scan.
    fn boot_task(&self, query: &Arc<QueryStatistics>, task: &Arc<Task>) {
        let sched = match task.scheduler() {
            Some(sched) => sched,
            None => return,
        };
        info!(task = %task.id_str(), scheduler = sched.name(),
              "taking too long, booting");
        sched.remove_task(task);
        global_metrics().inc_tasks_booted(sched.name());
        let booted = {
            let mut inner = query.lock();
            inner.tasks_booted += 1;
            inner.tasks_booted
        };

        let blend = match self.blend.lock().expect("stats lock").upgrade() {
            Some(blend) => blend,
            None => {
                warn!(task = %task.id_str(), "no blend scheduler; cannot escalate");
                return;
            }
        };
        let on_snail = blend
            .schedulers()
            .last()
            .map(|snail| snail.name() == sched.name())
            .unwrap_or(false);
        if on_snail {
            if booted > self.max_tasks_booted + 1 {
                warn!("{} excessive time on the snail scan; the query should be cancelled",
                      query_id_str(query.query_id(), None));
            }
            return;
        }
        if booted > self.max_tasks_booted {
            info!("{} booted too often; moving whole query to the snail scan",
                  query_id_str(query.query_id(), None));
            let removed = self.remove_query_tasks(query.query_id(), Some(sched.name()));
            if let Err(err) = blend.move_tasks_to_snail(removed) {
                warn!(%err, "snail re-admission failed");
            }
        }
    }

    /// Remove all still-queued tasks of `query_id` from their schedulers
    /// (or only from the named scheduler) and return them. Running tasks
    /// continue but are marked complete on their scheduler.
    pub fn remove_query_tasks(
        &self,
        query_id: QueryId,
        scheduler_name: Option<&str>,
    ) -> Vec<Arc<Task>> {
        let stats = match self.get_stats(query_id) {
            Some(stats) => stats,
            None => {
                debug!("{} not found for removal", query_id_str(query_id, None));
                return Vec::new();
            }
        };
        let mut removed = Vec::new();
        for task in stats.all_tasks() {
            let sched = match task.scheduler() {
                Some(sched) => sched,
                None => continue,
            };
            if let Some(name) = scheduler_name {
                if sched.name() != name {
                    continue;
                }
            }
            if let Some(evicted) = sched.remove_task(&task) {
                removed.push(evicted);
            }
        }
        removed
    }

    /// Cancel a user query: evict queued tasks and cancel running ones.
    /// Returns the evicted (never-run) tasks so the caller can fail them.
    pub fn cancel_query(&self, query_id: QueryId) -> Vec<Arc<Task>> {
        info!("{} cancelling user query", query_id_str(query_id, None));
        self.remove_query_tasks(query_id, None)
    }
}

/// Periodic examine/reap thread with clean shutdown.
pub struct Examiner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Examiner {
    /// Spawn a thread running `examine_all` + `remove_dead` every
    /// `interval`. Dropping the handle stops the thread.
    pub fn spawn(queries: &Arc<QueriesAndChunks>, interval: Duration) -> Examiner {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let weak = Arc::downgrade(queries);
        let handle = std::thread::spawn(move || {
            let mut last = Instant::now();
            while !stop_flag.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(50));
                if last.elapsed() < interval {
                    continue;
                }
                last = Instant::now();
                match weak.upgrade() {
                    Some(queries) => {
                        queries.examine_all();
                        queries.remove_dead();
                    }
                    None => break,
                }
            }
        });
        Examiner {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Examiner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::test_msg;

    #[test]
    fn rolling_average_blends_new_samples() {
        let stats = ChunkTableStats::new(7, "LSST:Object");
        stats.add_task_finished(10.0);
        assert!((stats.data().avg_completion_minutes - 10.0).abs() < 1e-9);
        stats.add_task_finished(20.0);
        // (10 * 9 + 20 * 1) / 10
        assert!((stats.data().avg_completion_minutes - 11.0).abs() < 1e-9);
        assert_eq!(stats.data().tasks_completed, 2);
    }

    #[test]
    fn finished_queries_are_reaped_after_the_idle_period() {
        let queries = QueriesAndChunks::new(Duration::ZERO, 2);
        let task = Task::from_msg(test_msg(4, 0, 10, 16));
        queries.add_task(&task);
        queries.queued_task(&task);
        queries.started_task(&task);
        queries.finished_task(&task);
        assert!(queries.get_stats(QueryId(4)).is_some());

        std::thread::sleep(Duration::from_millis(2));
        queries.remove_dead();
        assert!(queries.get_stats(QueryId(4)).is_none());
    }

    #[test]
    fn examiner_thread_stops_on_drop() {
        let queries = QueriesAndChunks::new(Duration::from_secs(60), 2);
        let examiner = Examiner::spawn(&queries, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        drop(examiner);
    }
}
