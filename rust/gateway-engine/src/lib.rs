//! Per-worker shared-memory layouts of the gateway engine.
//!
//! Every worker gets an inbound ring (`data{n}`), a buffer pool
//! (`buffers{n}`), a budget table (`budgets{n}`) and three metrics files
//! under `metrics/`. The [`Engine`] creates and owns them; [`observe`],
//! [`diagnose`] and [`metrics_reader`] map them read-only from another
//! process, and [`metrics_table`] prints the metrics under their label names.

#[macro_use]
mod macros;

pub mod config;
pub mod diagnostic;
mod engine;
pub mod error;
pub mod worker;

pub use config::EngineConfig;
pub use diagnostic::{EngineDiagnostics, PoolStats, RingStats, WorkerStats};
pub use engine::{Engine, diagnose, metrics_labels, metrics_reader, metrics_table, observe};
pub use error::EngineError;
pub use worker::{Worker, WorkerMetrics, WorkerObserver};
