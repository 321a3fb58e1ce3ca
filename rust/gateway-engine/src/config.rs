//! Engine sizing.

use std::path::{Path, PathBuf};

use gateway_metrics::{LABELS_FILE_NAME, MetricKind};
use gateway_shm::budget::MAX_WATCHERS;
use gateway_shm::is_zero_or_power_of_two;

const DEFAULT_WORKER_CAPACITY: usize = 64;
const DEFAULT_BUFFER_SLOT_CAPACITY: usize = 64 * 1024;

/// Sizes and location of every worker's shared-memory files.
///
/// Capacities derived from `worker_capacity` are computed once by
/// [`Default`]; changing `worker_capacity` afterwards does not rescale them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the per-worker files.
    pub directory: PathBuf,
    /// Number of workers. Each worker is also a budget watcher, so at most 64.
    pub workers: usize,
    /// Concurrent streams a worker is sized for.
    pub worker_capacity: usize,
    /// Bytes per buffer pool slot.
    pub buffer_slot_capacity: usize,
    /// Bytes across all slots of one worker's pool.
    pub buffer_pool_capacity: usize,
    /// Data capacity of one worker's inbound ring, excluding the trailer.
    pub streams_buffer_capacity: usize,
    /// Budget table entries per worker.
    pub budgets_entries: usize,
    /// Label bytes per metrics file.
    pub metrics_labels_capacity: usize,
    /// Value bytes per metrics file.
    pub metrics_values_capacity: usize,
    /// Upper bound on messages handled by one poll of a worker's ring.
    pub maximum_messages_per_read: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_capacity = DEFAULT_WORKER_CAPACITY;
        let buffer_slot_capacity = DEFAULT_BUFFER_SLOT_CAPACITY;
        Self {
            directory: PathBuf::from("."),
            workers: 1,
            worker_capacity,
            buffer_slot_capacity,
            buffer_pool_capacity: buffer_slot_capacity * worker_capacity,
            streams_buffer_capacity: buffer_slot_capacity * worker_capacity,
            budgets_entries: 512 * worker_capacity,
            metrics_labels_capacity: 64 * 1024,
            metrics_values_capacity: 1024 * 1024,
            maximum_messages_per_read: usize::MAX,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.workers == 0 || self.workers > MAX_WATCHERS as usize {
            return Err("workers must be 1-64");
        }
        if self.worker_capacity == 0 {
            return Err("worker_capacity must be > 0");
        }
        if self.buffer_slot_capacity == 0 || !is_zero_or_power_of_two(self.buffer_slot_capacity) {
            return Err("buffer_slot_capacity must be a power of two");
        }
        if !is_zero_or_power_of_two(self.buffer_pool_capacity) {
            return Err("buffer_pool_capacity must be a power of two");
        }
        if self.buffer_pool_capacity < self.buffer_slot_capacity {
            return Err("buffer_pool_capacity must hold at least one slot");
        }
        if self.streams_buffer_capacity == 0 || !is_zero_or_power_of_two(self.streams_buffer_capacity)
        {
            return Err("streams_buffer_capacity must be a power of two");
        }
        if self.budgets_entries == 0 || !is_zero_or_power_of_two(self.budgets_entries) {
            return Err("budgets_entries must be a power of two");
        }
        if self.metrics_labels_capacity == 0 || self.metrics_values_capacity == 0 {
            return Err("metrics capacities must be > 0");
        }
        if self.maximum_messages_per_read == 0 {
            return Err("maximum_messages_per_read must be > 0");
        }
        Ok(())
    }

    /// Slots in one worker's buffer pool.
    pub fn buffer_slots(&self) -> usize {
        self.buffer_pool_capacity / self.buffer_slot_capacity
    }

    /// Inbound ring of worker `index`.
    pub fn streams_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!("data{index}"))
    }

    pub fn buffers_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!("buffers{index}"))
    }

    pub fn budgets_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!("budgets{index}"))
    }

    /// `metrics/counters{n}`, `metrics/gauges{n}` or `metrics/histograms{n}`.
    pub fn metrics_path(&self, kind: MetricKind, index: usize) -> PathBuf {
        self.metrics_directory()
            .join(format!("{}s{index}", kind.as_str()))
    }

    pub fn metrics_directory(&self) -> PathBuf {
        self.directory.join("metrics")
    }

    /// `metrics/labels`, naming the ids inside the metrics files.
    pub fn labels_path(&self) -> PathBuf {
        self.metrics_directory().join(LABELS_FILE_NAME)
    }

    pub fn with_directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.directory = directory.as_ref().to_path_buf();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scale_with_worker_capacity() {
        let config = EngineConfig::default();
        assert_eq!(config.directory, PathBuf::from("."));
        assert_eq!(config.workers, 1);
        assert_eq!(config.buffer_pool_capacity, 4 * 1024 * 1024);
        assert_eq!(config.streams_buffer_capacity, 4 * 1024 * 1024);
        assert_eq!(config.budgets_entries, 32 * 1024);
        assert_eq!(config.buffer_slots(), 64);
        assert_eq!(config.maximum_messages_per_read, usize::MAX);
        config.validate().unwrap();
    }

    #[test]
    fn per_worker_paths() {
        let config = EngineConfig::default().with_directory("/run/gateway");
        assert_eq!(config.streams_path(3), Path::new("/run/gateway/data3"));
        assert_eq!(config.buffers_path(0), Path::new("/run/gateway/buffers0"));
        assert_eq!(config.budgets_path(1), Path::new("/run/gateway/budgets1"));
        assert_eq!(
            config.metrics_path(MetricKind::Histogram, 2),
            Path::new("/run/gateway/metrics/histograms2")
        );
        assert_eq!(
            config.metrics_path(MetricKind::Counter, 0),
            Path::new("/run/gateway/metrics/counters0")
        );
        assert_eq!(config.labels_path(), Path::new("/run/gateway/metrics/labels"));
    }

    #[test]
    fn rejects_bad_shapes() {
        let base = EngineConfig::default();

        let cases: [(EngineConfig, &str); 7] = [
            (EngineConfig { workers: 0, ..base.clone() }, "workers"),
            (EngineConfig { workers: 65, ..base.clone() }, "workers"),
            (
                EngineConfig {
                    buffer_slot_capacity: 3000,
                    ..base.clone()
                },
                "buffer_slot_capacity",
            ),
            (
                EngineConfig {
                    buffer_pool_capacity: 0,
                    ..base.clone()
                },
                "buffer_pool_capacity",
            ),
            (
                EngineConfig {
                    streams_buffer_capacity: 1000,
                    ..base.clone()
                },
                "streams_buffer_capacity",
            ),
            (
                EngineConfig {
                    budgets_entries: 0,
                    ..base.clone()
                },
                "budgets_entries",
            ),
            (
                EngineConfig {
                    maximum_messages_per_read: 0,
                    ..base.clone()
                },
                "maximum_messages_per_read",
            ),
        ];

        for (config, field) in cases {
            let err = config.validate().unwrap_err();
            assert!(err.starts_with(field), "{err}");
        }
    }
}
