//! One worker's shared-memory files.
//!
//! The engine creates a [`Worker`] per worker thread and owns its files. Out
//! of process, a [`WorkerObserver`] maps the same files read-only.

use std::ops::ControlFlow;
use std::path::Path;

use gateway_metrics::{MetricKind, MetricsLayout};
use gateway_shm::{
    BudgetDebitor, BudgetTable, BufferPool, MmapRegion, RingBuffer, RingBufferSpy, SharedRegion,
    budget, buffer_pool, ring,
};

use crate::config::EngineConfig;
use crate::error::EngineError;

fn create_region(path: &Path, size: usize) -> Result<SharedRegion, EngineError> {
    MmapRegion::create(path, size)
        .map(SharedRegion::from)
        .map_err(|e| EngineError::layout(path)(e.into()))
}

fn attach_readonly(path: &Path) -> Result<SharedRegion, EngineError> {
    MmapRegion::attach_readonly(path)
        .map(SharedRegion::from)
        .map_err(|e| EngineError::layout(path)(e.into()))
}

/// Metrics layouts of one worker, one per kind.
#[derive(Debug)]
pub struct WorkerMetrics {
    pub counters: MetricsLayout,
    pub gauges: MetricsLayout,
    pub histograms: MetricsLayout,
}

impl WorkerMetrics {
    fn create(config: &EngineConfig, index: usize) -> Result<Self, EngineError> {
        let create = |kind| {
            let path = config.metrics_path(kind, index);
            MetricsLayout::create(
                &path,
                kind,
                config.metrics_labels_capacity,
                config.metrics_values_capacity,
            )
            .map_err(EngineError::layout(path))
        };
        Ok(Self {
            counters: create(MetricKind::Counter)?,
            gauges: create(MetricKind::Gauge)?,
            histograms: create(MetricKind::Histogram)?,
        })
    }

    fn attach_readonly(config: &EngineConfig, index: usize) -> Result<Self, EngineError> {
        let open = |kind| {
            let path = config.metrics_path(kind, index);
            MetricsLayout::open_readonly(&path, kind).map_err(EngineError::layout(path))
        };
        Ok(Self {
            counters: open(MetricKind::Counter)?,
            gauges: open(MetricKind::Gauge)?,
            histograms: open(MetricKind::Histogram)?,
        })
    }

    pub fn layout(&self, kind: MetricKind) -> &MetricsLayout {
        match kind {
            MetricKind::Counter => &self.counters,
            MetricKind::Gauge => &self.gauges,
            MetricKind::Histogram => &self.histograms,
        }
    }

    pub fn into_layouts(self) -> [MetricsLayout; 3] {
        [self.counters, self.gauges, self.histograms]
    }
}

/// A worker's writable layouts.
///
/// `streams` is the worker's inbound ring: any worker may write to it, only
/// this worker reads it.
pub struct Worker {
    index: usize,
    streams: RingBuffer,
    buffers: BufferPool,
    budgets: BudgetTable,
    metrics: WorkerMetrics,
}

impl Worker {
    /// Create every file of worker `index`, truncating leftovers.
    pub fn create(config: &EngineConfig, index: usize) -> Result<Self, EngineError> {
        let path = config.streams_path(index);
        let region = create_region(&path, ring::descriptor::region_length(config.streams_buffer_capacity))?;
        let streams = RingBuffer::build(region).map_err(EngineError::layout(path))?;

        let path = config.buffers_path(index);
        let slots = config.buffer_slots();
        let region = create_region(
            &path,
            buffer_pool::region_length(config.buffer_slot_capacity, slots),
        )?;
        let buffers = BufferPool::build(config.buffer_slot_capacity, slots, region)
            .map_err(EngineError::layout(path))?;

        let path = config.budgets_path(index);
        let region = create_region(&path, budget::region_length(config.budgets_entries))?;
        let budgets =
            BudgetTable::build(config.budgets_entries, region).map_err(EngineError::layout(path))?;

        let metrics = WorkerMetrics::create(config, index)?;

        debug!(
            index,
            directory = %config.directory.display(),
            streams = streams.capacity(),
            slots,
            budgets = config.budgets_entries,
            "created worker layouts"
        );

        Ok(Self {
            index,
            streams,
            buffers,
            budgets,
            metrics,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn streams(&self) -> &RingBuffer {
        &self.streams
    }

    #[inline]
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// A pool handle for a stream to write its slot through.
    pub fn buffer_pool(&self) -> BufferPool {
        self.buffers.duplicate()
    }

    #[inline]
    pub fn budgets(&self) -> &BudgetTable {
        &self.budgets
    }

    /// A debitor watching this worker's budgets under the worker's own index.
    pub fn debitor(&self) -> BudgetDebitor {
        BudgetDebitor::new(self.budgets.clone(), self.index as u32)
    }

    #[inline]
    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Handle up to `limit` inbound messages.
    pub fn poll<F>(&self, handler: F, limit: usize) -> usize
    where
        F: FnMut(i32, &[u8]) -> ControlFlow<()>,
    {
        self.streams.read(handler, limit)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("streams", &self.streams.capacity())
            .field("slots", &self.buffers.slot_count())
            .field("budgets", &self.budgets.entries())
            .finish()
    }
}

/// Read-only view of another process's worker files.
pub struct WorkerObserver {
    index: usize,
    streams: RingBufferSpy,
    buffers: SharedRegion,
    slot_capacity: usize,
    slot_count: usize,
    metrics: WorkerMetrics,
}

impl WorkerObserver {
    pub fn attach(config: &EngineConfig, index: usize) -> Result<Self, EngineError> {
        let path = config.streams_path(index);
        let streams =
            RingBufferSpy::attach(attach_readonly(&path)?).map_err(EngineError::layout(path))?;

        let path = config.buffers_path(index);
        let buffers = attach_readonly(&path)?;
        // Validates the shape once so later trailer reads cannot fail.
        buffer_pool::held_slots(config.buffer_slot_capacity, config.buffer_slots(), &buffers)
            .map_err(EngineError::layout(path))?;

        let metrics = WorkerMetrics::attach_readonly(config, index)?;

        debug!(index, "attached worker observer");

        Ok(Self {
            index,
            streams,
            buffers,
            slot_capacity: config.buffer_slot_capacity,
            slot_count: config.buffer_slots(),
            metrics,
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Spy on the worker's inbound ring.
    #[inline]
    pub fn streams(&mut self) -> &mut RingBufferSpy {
        &mut self.streams
    }

    /// `(slot, stream_id)` of every slot currently held.
    pub fn held_slots(&self) -> Vec<(usize, i64)> {
        buffer_pool::held_slots(self.slot_capacity, self.slot_count, &self.buffers)
            .unwrap_or_default()
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    #[inline]
    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub fn into_metrics(self) -> WorkerMetrics {
        self.metrics
    }
}

impl std::fmt::Debug for WorkerObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerObserver")
            .field("index", &self.index)
            .field("streams", &self.streams)
            .field("slots", &self.slot_count)
            .finish()
    }
}
