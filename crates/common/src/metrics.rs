use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

/// Process-wide metrics registry shared by schedulers and the memory manager.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    scheduler_queued_tasks: GaugeVec,
    scheduler_inflight_tasks: GaugeVec,
    scheduler_active_chunks: GaugeVec,
    tasks_booted: CounterVec,
    memman_locks_granted: CounterVec,
    memman_locks_denied: CounterVec,
    memman_bytes_locked: GaugeVec,
}

impl MetricsRegistry {
    /// Create an empty registry with all metric families registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record the queued-task gauge for one scheduler.
    pub fn set_scheduler_queued_tasks(&self, scheduler: &str, queued: u64) {
        self.inner
            .scheduler_queued_tasks
            .with_label_values(&[scheduler])
            .set(queued as f64);
    }

    /// Record the in-flight-task gauge for one scheduler.
    pub fn set_scheduler_inflight_tasks(&self, scheduler: &str, inflight: u64) {
        self.inner
            .scheduler_inflight_tasks
            .with_label_values(&[scheduler])
            .set(inflight as f64);
    }

    /// Record the active-chunk gauge for one scheduler.
    pub fn set_scheduler_active_chunks(&self, scheduler: &str, chunks: u64) {
        self.inner
            .scheduler_active_chunks
            .with_label_values(&[scheduler])
            .set(chunks as f64);
    }

    /// Count a task booted for exceeding its time budget.
    pub fn inc_tasks_booted(&self, scheduler: &str) {
        self.inner
            .tasks_booted
            .with_label_values(&[scheduler])
            .inc();
    }

    /// Count a memory-manager lock outcome.
    pub fn inc_memman_lock(&self, granted: bool) {
        let vec = if granted {
            &self.inner.memman_locks_granted
        } else {
            &self.inner.memman_locks_denied
        };
        vec.with_label_values(&[]).inc();
    }

    /// Record the bytes currently locked by the memory manager.
    pub fn set_memman_bytes_locked(&self, bytes: u64) {
        self.inner
            .memman_bytes_locked
            .with_label_values(&[])
            .set(bytes as f64);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let scheduler_queued_tasks = gauge_vec(
            &registry,
            "smq_scheduler_queued_tasks",
            "Currently queued tasks per scheduler",
            &["scheduler"],
        );
        let scheduler_inflight_tasks = gauge_vec(
            &registry,
            "smq_scheduler_inflight_tasks",
            "Currently in-flight tasks per scheduler",
            &["scheduler"],
        );
        let scheduler_active_chunks = gauge_vec(
            &registry,
            "smq_scheduler_active_chunks",
            "Distinct chunk ids in flight per scheduler",
            &["scheduler"],
        );
        let tasks_booted = counter_vec(
            &registry,
            "smq_tasks_booted_total",
            "Tasks removed mid-run for exceeding their time budget",
            &["scheduler"],
        );
        let memman_locks_granted = counter_vec(
            &registry,
            "smq_memman_locks_granted_total",
            "Memory-manager lock requests granted",
            &[],
        );
        let memman_locks_denied = counter_vec(
            &registry,
            "smq_memman_locks_denied_total",
            "Memory-manager lock requests denied or deferred",
            &[],
        );
        let memman_bytes_locked = gauge_vec(
            &registry,
            "smq_memman_bytes_locked",
            "Bytes currently locked in memory",
            &[],
        );

        Self {
            registry,
            scheduler_queued_tasks,
            scheduler_inflight_tasks,
            scheduler_active_chunks,
            tasks_booted,
            memman_locks_granted,
            memman_locks_denied,
            memman_bytes_locked,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let vec = CounterVec::new(Opts::new(name, help), labels).expect("valid counter opts");
    registry
        .register(Box::new(vec.clone()))
        .expect("unique metric name");
    vec
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let vec = GaugeVec::new(Opts::new(name, help), labels).expect("valid gauge opts");
    registry
        .register(Box::new(vec.clone()))
        .expect("unique metric name");
    vec
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Shared registry for components that are not handed one explicitly.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
