use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SmqError};

/// Behavior when two table references claim the same munged spatial name.
///
/// Rejecting is the only option that cannot silently change query semantics,
/// so it is the default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpatialConflictPolicy {
    /// Fail the query with an internal error.
    Reject,
    /// Keep the first mapping seen and log a warning.
    First,
    /// Keep the last mapping seen and log a warning.
    Last,
}

impl Default for SpatialConflictPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

/// Task-queue implementation selected per scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskQueueVariant {
    /// Chunk-bucketed queue with an active pointer (shared-scan ordering).
    ChunkTasks,
    /// Plain arrival-order queue behind the same contract.
    Fifo,
}

impl Default for TaskQueueVariant {
    fn default() -> Self {
        Self::ChunkTasks
    }
}

fn default_max_subchunks_per_fragment() -> usize {
    32
}

/// Planner/session configuration shared by every query session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Default database for unqualified table references. Empty means the
    /// submitter selected no database.
    #[serde(default)]
    pub default_db: String,
    /// Databases queries may reference. An empty list falls back to the
    /// legacy `LSST`-only allow-list (with a warning).
    #[serde(default)]
    pub allowed_dbs: Vec<String>,
    /// Raw spatial restrictor hints, semicolon-separated tuples such as
    /// `box,ra,decl,w,h;circle,ra,decl,r`.
    #[serde(default)]
    pub hints: String,
    /// Resolution policy for conflicting munged spatial mappings.
    #[serde(default)]
    pub spatial_conflict_policy: SpatialConflictPolicy,
    /// Upper bound on sub-chunk ids packed into one dispatch fragment.
    #[serde(default = "default_max_subchunks_per_fragment")]
    pub max_subchunks_per_fragment: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_db: String::new(),
            allowed_dbs: Vec::new(),
            hints: String::new(),
            spatial_conflict_policy: SpatialConflictPolicy::default(),
            max_subchunks_per_fragment: default_max_subchunks_per_fragment(),
        }
    }
}

impl PlannerConfig {
    /// Build a config from the literal option map handed over by the
    /// front-end proxy.
    ///
    /// Recognized keys: `table.defaultdb`, `table.alloweddbs` (comma
    /// separated), `query.hints`.
    pub fn from_map(options: &HashMap<String, String>) -> Self {
        let default_db = options
            .get("table.defaultdb")
            .cloned()
            .unwrap_or_default();
        let allowed_dbs: Vec<String> = options
            .get("table.alloweddbs")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let hints = options.get("query.hints").cloned().unwrap_or_default();
        Self {
            default_db,
            allowed_dbs,
            hints,
            ..Self::default()
        }
    }

    /// Effective allow-list: configured databases, or the legacy `LSST`
    /// fallback when none were configured.
    pub fn effective_allowed_dbs(&self) -> Vec<String> {
        if self.allowed_dbs.is_empty() {
            warn!("no dbs in allow-list, falling back to LSST");
            vec!["LSST".to_string()]
        } else {
            self.allowed_dbs.clone()
        }
    }
}

/// Parameters for one shared-scan scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler name used in logs and metrics labels.
    pub name: String,
    /// Hard ceiling on in-flight tasks.
    pub max_threads: usize,
    /// Threads this scheduler is guaranteed under contention.
    pub max_reserve: usize,
    /// Priority for blend adjustment; higher wins threads first.
    pub priority: i32,
    /// Ceiling on distinct chunk ids concurrently in flight.
    pub max_active_chunks: usize,
    /// Inclusive lower bound of the scan-rating band this scheduler serves.
    pub min_rating: i32,
    /// Inclusive upper bound of the scan-rating band.
    pub max_rating: i32,
    /// Wall-clock budget in minutes before a running task is booted.
    pub max_time_minutes: f64,
    /// Queue implementation behind the scheduler.
    #[serde(default)]
    pub queue_variant: TaskQueueVariant,
}

impl SchedulerConfig {
    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SmqError::InvalidConfig(
                "scheduler name must not be empty".to_string(),
            ));
        }
        if self.max_threads == 0 {
            return Err(SmqError::InvalidConfig(format!(
                "scheduler '{}': max_threads must be positive",
                self.name
            )));
        }
        if self.max_reserve > self.max_threads {
            return Err(SmqError::InvalidConfig(format!(
                "scheduler '{}': max_reserve {} exceeds max_threads {}",
                self.name, self.max_reserve, self.max_threads
            )));
        }
        if self.max_active_chunks == 0 {
            return Err(SmqError::InvalidConfig(format!(
                "scheduler '{}': max_active_chunks must be positive",
                self.name
            )));
        }
        if self.min_rating > self.max_rating {
            return Err(SmqError::InvalidConfig(format!(
                "scheduler '{}': min_rating {} exceeds max_rating {}",
                self.name, self.min_rating, self.max_rating
            )));
        }
        Ok(())
    }
}

/// Worker-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Total threads shared by all schedulers on this worker.
    pub pool_size: usize,
    /// Memory budget handed to the memory manager, in bytes. Zero disables
    /// budget enforcement.
    pub memory_budget_bytes: u64,
    /// Assumed size of one chunk table file when the real size is unknown.
    pub bytes_per_chunk_file: u64,
    /// Scheduler roster, highest priority first after sorting.
    pub schedulers: Vec<SchedulerConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            memory_budget_bytes: 0,
            bytes_per_chunk_file: 64 * 1024 * 1024,
            schedulers: Vec::new(),
        }
    }
}

impl WorkerConfig {
    /// Validate the pool and every scheduler entry.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(SmqError::InvalidConfig(
                "pool_size must be positive".to_string(),
            ));
        }
        for sched in &self.schedulers {
            sched.validate()?;
        }
        Ok(())
    }

    /// Load a worker configuration from a TOML file.
    pub fn load_toml(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&text)
            .map_err(|e| SmqError::InvalidConfig(format!("worker config decode failed: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planner_config_reads_literal_keys() {
        let mut m = HashMap::new();
        m.insert("table.defaultdb".to_string(), "LSST".to_string());
        m.insert("table.alloweddbs".to_string(), "LSST, Winter2013".to_string());
        m.insert("query.hints".to_string(), "box,0,0,5,1".to_string());
        let cfg = PlannerConfig::from_map(&m);
        assert_eq!(cfg.default_db, "LSST");
        assert_eq!(cfg.allowed_dbs, vec!["LSST", "Winter2013"]);
        assert_eq!(cfg.hints, "box,0,0,5,1");
    }

    #[test]
    fn empty_allow_list_falls_back_to_lsst() {
        let cfg = PlannerConfig::default();
        assert_eq!(cfg.effective_allowed_dbs(), vec!["LSST"]);
    }

    #[test]
    fn scheduler_invariants_are_enforced() {
        let mut cfg = SchedulerConfig {
            name: "Fast".to_string(),
            max_threads: 4,
            max_reserve: 2,
            priority: 10,
            max_active_chunks: 2,
            min_rating: 0,
            max_rating: 100,
            max_time_minutes: 30.0,
            queue_variant: TaskQueueVariant::ChunkTasks,
        };
        assert!(cfg.validate().is_ok());
        cfg.max_reserve = 5;
        assert!(cfg.validate().is_err());
        cfg.max_reserve = 2;
        cfg.min_rating = 200;
        assert!(cfg.validate().is_err());
    }
}
