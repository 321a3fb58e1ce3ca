use std::ops::ControlFlow;

use gateway_metrics::{Labels, MetricsReader, format_records};

use crate::config::EngineConfig;
use crate::diagnostic::{EngineDiagnostics, WorkerStats};
use crate::error::EngineError;
use crate::worker::{Worker, WorkerObserver};

/// Owner of every worker's shared-memory files.
///
/// Dropping the engine unmaps and removes the files.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    workers: Vec<Worker>,
    labels: Labels,
}

impl Engine {
    /// Validate `config` and create the files of every worker.
    pub fn start(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Config)?;

        let workers = (0..config.workers)
            .map(|index| Worker::create(&config, index))
            .collect::<Result<Vec<_>, _>>()?;
        let labels = Labels::open(&config.metrics_directory())
            .map_err(EngineError::labels(config.labels_path()))?;

        info!(
            directory = %config.directory.display(),
            workers = workers.len(),
            "engine layouts ready"
        );

        Ok(Self {
            config,
            workers,
            labels,
        })
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index)
    }

    /// Id of the namespace, binding or metric `name`, assigned on first use.
    ///
    /// The label file outlives the engine, so ids stay stable across restarts
    /// over the same directory.
    pub fn supply_label_id(&mut self, name: &str) -> Result<u32, EngineError> {
        self.labels
            .supply_label_id(name)
            .map_err(EngineError::labels(self.labels.path()))
    }

    #[inline]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Write a message to the inbound ring of worker `target`.
    ///
    /// Returns false when that ring is full.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not a worker index.
    pub fn send(&self, target: usize, type_id: i32, payload: &[u8]) -> bool {
        self.workers[target].streams().write(type_id, payload)
    }

    /// Drain worker `index`, handling at most `maximum_messages_per_read`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a worker index.
    pub fn poll<F>(&self, index: usize, handler: F) -> usize
    where
        F: FnMut(i32, &[u8]) -> ControlFlow<()>,
    {
        self.workers[index].poll(handler, self.config.maximum_messages_per_read)
    }

    pub fn diagnostics(&self) -> EngineDiagnostics {
        EngineDiagnostics {
            workers: self.workers.iter().map(WorkerStats::of_worker).collect(),
        }
    }
}

/// Attach read-only to every worker of an engine running elsewhere.
pub fn observe(config: &EngineConfig) -> Result<Vec<WorkerObserver>, EngineError> {
    config.validate().map_err(EngineError::Config)?;
    (0..config.workers)
        .map(|index| WorkerObserver::attach(config, index))
        .collect()
}

/// Diagnostics of an engine running elsewhere.
pub fn diagnose(config: &EngineConfig) -> Result<EngineDiagnostics, EngineError> {
    let workers = observe(config)?
        .iter_mut()
        .map(WorkerStats::of_observer)
        .collect();
    Ok(EngineDiagnostics { workers })
}

/// Metrics of every worker, summed per key.
pub fn metrics_reader(config: &EngineConfig) -> Result<MetricsReader, EngineError> {
    let layouts = observe(config)?
        .into_iter()
        .flat_map(|observer| observer.into_metrics().into_layouts());
    Ok(MetricsReader::new(layouts))
}

/// The label table of an engine running elsewhere.
pub fn metrics_labels(config: &EngineConfig) -> Result<Labels, EngineError> {
    Labels::open(&config.metrics_directory()).map_err(EngineError::labels(config.labels_path()))
}

/// Metrics of every worker as a `namespace binding metric value` table,
/// optionally narrowed to a namespace and binding name.
pub fn metrics_table(
    config: &EngineConfig,
    namespace: Option<&str>,
    binding: Option<&str>,
) -> Result<String, EngineError> {
    let reader = metrics_reader(config)?;
    let labels = metrics_labels(config)?;
    let records = reader.filtered_by_name(&labels, namespace, binding);
    Ok(format_records(&records, &labels))
}
