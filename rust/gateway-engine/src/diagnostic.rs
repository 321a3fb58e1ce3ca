//! Diagnostic snapshots of worker layouts.

use std::fmt::Write as _;

use crate::worker::{Worker, WorkerObserver};

/// Diagnostic stats for a worker's inbound ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub producer_position: i64,
    pub consumer_position: i64,
    pub used: usize,
    pub free: usize,
}

impl RingStats {
    fn new(capacity: usize, producer_position: i64, consumer_position: i64) -> Self {
        let used = (producer_position - consumer_position).clamp(0, capacity as i64) as usize;
        Self {
            capacity,
            producer_position,
            consumer_position,
            used,
            free: capacity - used,
        }
    }
}

/// Diagnostic stats for a worker's buffer pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_slots: usize,
    /// `(slot, stream_id)` from the pool trailer.
    pub held: Vec<(usize, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub index: usize,
    pub ring: RingStats,
    pub pool: PoolStats,
    pub counters: usize,
    pub gauges: usize,
    pub histograms: usize,
}

impl WorkerStats {
    pub fn of_worker(worker: &Worker) -> Self {
        let streams = worker.streams();
        let buffers = worker.buffers();
        let held = (0..buffers.slot_count())
            .filter_map(|slot| {
                let stream_id = buffers.stream_id(slot);
                (stream_id != 0).then_some((slot, stream_id))
            })
            .collect();
        let metrics = worker.metrics();
        Self {
            index: worker.index(),
            ring: RingStats::new(
                streams.capacity(),
                streams.producer_position(),
                streams.consumer_position(),
            ),
            pool: PoolStats {
                total_slots: buffers.slot_count(),
                held,
            },
            counters: metrics.counters.ids().len(),
            gauges: metrics.gauges.ids().len(),
            histograms: metrics.histograms.ids().len(),
        }
    }

    pub fn of_observer(observer: &mut WorkerObserver) -> Self {
        let held = observer.held_slots();
        let total_slots = observer.slot_count();
        let index = observer.index();
        let spy = observer.streams();
        let ring = RingStats::new(
            spy.capacity(),
            spy.producer_position(),
            spy.consumer_position(),
        );
        let metrics = observer.metrics();
        Self {
            index,
            ring,
            pool: PoolStats { total_slots, held },
            counters: metrics.counters.ids().len(),
            gauges: metrics.gauges.ids().len(),
            histograms: metrics.histograms.ids().len(),
        }
    }
}

/// Snapshot of every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDiagnostics {
    pub workers: Vec<WorkerStats>,
}

impl EngineDiagnostics {
    /// Format the diagnostics as a compact human-readable string.
    ///
    /// One line per worker: ring occupancy, held slots and metric counts.
    pub fn format(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "[SHM] {} workers", self.workers.len());

        for worker in &self.workers {
            let ring = &worker.ring;
            let _ = write!(
                output,
                "  [worker#{}] ring:{}/{} slots:{}/{} metrics:{}c/{}g/{}h",
                worker.index,
                format_bytes(ring.used as u64),
                format_bytes(ring.capacity as u64),
                worker.pool.held.len(),
                worker.pool.total_slots,
                worker.counters,
                worker.gauges,
                worker.histograms,
            );
            if ring.used > 0 {
                let _ = write!(output, " PENDING");
            }
            let _ = writeln!(output);
        }

        output
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}K", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
