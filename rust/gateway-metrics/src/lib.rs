//! Shared-memory metrics for gateway workers.
//!
//! Each worker owns one [`MetricsLayout`] file per [`MetricKind`]. Workers
//! write their cells without locks; exporters map the same files read-only
//! and aggregate across workers with a [`MetricsReader`], naming ids through
//! the shared [`Labels`] table.

#[macro_use]
mod macros;

pub mod histogram;
pub mod id;
pub mod labels;
pub mod layout;
pub mod reader;

pub use gateway_shm::LayoutError;
pub use histogram::{HISTOGRAM_BUCKETS, HistogramStats};
pub use id::{local_id, namespace_id, namespaced_id};
pub use labels::{LABELS_FILE_NAME, Labels};
pub use layout::{METRICS_VERSION, MetricKind, MetricReader, MetricWriter, MetricsLayout, Mode};
pub use reader::{
    MetricFilter, MetricNames, MetricRecord, MetricValue, MetricsReader, format_records,
};
