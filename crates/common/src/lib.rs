#![deny(missing_docs)]

//! Shared configuration, error types, ids, and observability primitives for
//! smq crates.
//!
//! Architecture role:
//! - defines planner/worker configuration passed across layers
//! - provides common [`SmqError`] / [`Result`] contracts
//! - hosts the metrics registry shared by schedulers and the memory manager
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Shared planner/worker configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{
    PlannerConfig, SchedulerConfig, SpatialConflictPolicy, TaskQueueVariant, WorkerConfig,
};
pub use error::{Result, SmqError};
pub use ids::*;
pub use metrics::MetricsRegistry;
