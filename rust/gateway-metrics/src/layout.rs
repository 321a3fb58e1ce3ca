//! Versioned metrics file.
//!
//! ```text
//! [version:i32 | labels_length:i32 | values_length:i32 | reserved]  64 bytes
//! [label record; labels_length / 24]
//! [value cell; values_length / cell_size]
//! ```
//!
//! A label record is `[binding_id:i64 | metric_id:i64 | value_offset:i64]`.
//! The owning worker is the only writer. It fills `metric_id` and
//! `value_offset` first and release-stores `binding_id` last, so a reader that
//! acquire-loads a non-zero `binding_id` sees a complete record. Records are
//! appended in order and never removed; the first empty record ends the table.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use gateway_shm::{LayoutError, MmapRegion, Region, SharedRegion};

use crate::histogram::{HISTOGRAM_BUCKETS, HistogramStats, bucket_index};

pub const METRICS_VERSION: i32 = 1;

pub const HEADER_LENGTH: usize = 64;
const VERSION_OFFSET: usize = 0;
const LABELS_LENGTH_OFFSET: usize = 4;
const VALUES_LENGTH_OFFSET: usize = 8;

pub const LABEL_RECORD_LENGTH: usize = 24;
const LABEL_BINDING_ID_OFFSET: usize = 0;
const LABEL_METRIC_ID_OFFSET: usize = 8;
const LABEL_VALUE_OFFSET_OFFSET: usize = 16;

/// What a layout's cells hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    /// Bytes per value cell.
    pub const fn cell_size(self) -> usize {
        match self {
            MetricKind::Counter | MetricKind::Gauge => 8,
            MetricKind::Histogram => HISTOGRAM_BUCKETS * 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How [`MetricsLayout::build`] opens the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Create (or truncate) the file and write a fresh header. The layout
    /// owns the file and removes it on drop.
    Create,
    /// Map an existing file read-only and validate its header.
    ReadOnly,
}

/// One worker's metrics of a single [`MetricKind`].
pub struct MetricsLayout {
    region: SharedRegion,
    kind: MetricKind,
    labels_length: usize,
    values_length: usize,
}

impl MetricsLayout {
    /// Open the layout at `path`.
    ///
    /// With [`Mode::Create`], `labels_capacity` and `values_capacity` are byte
    /// budgets, rounded down to whole records and cells. With
    /// [`Mode::ReadOnly`] they are ignored and the stored lengths are used.
    pub fn build(
        path: &Path,
        kind: MetricKind,
        labels_capacity: usize,
        values_capacity: usize,
        mode: Mode,
    ) -> Result<Self, LayoutError> {
        match mode {
            Mode::Create => Self::create(path, kind, labels_capacity, values_capacity),
            Mode::ReadOnly => Self::open_readonly(path, kind),
        }
    }

    pub fn create(
        path: &Path,
        kind: MetricKind,
        labels_capacity: usize,
        values_capacity: usize,
    ) -> Result<Self, LayoutError> {
        let labels_length = rounded("metrics labels", labels_capacity, LABEL_RECORD_LENGTH)?;
        let values_length = rounded("metrics values", values_capacity, kind.cell_size())?;
        let labels_field = header_field("metrics labels", labels_length)?;
        let values_field = header_field("metrics values", values_length)?;

        let mmap = MmapRegion::create(path, HEADER_LENGTH + labels_length + values_length)?;
        let region = SharedRegion::from(mmap);
        let raw = region.region();
        raw.atomic_i32(LABELS_LENGTH_OFFSET)
            .store(labels_field, Ordering::Relaxed);
        raw.atomic_i32(VALUES_LENGTH_OFFSET)
            .store(values_field, Ordering::Relaxed);
        raw.atomic_i32(VERSION_OFFSET)
            .store(METRICS_VERSION, Ordering::Release);

        debug!(
            path = %path.display(),
            %kind,
            labels_length,
            values_length,
            "created metrics layout"
        );

        Ok(Self {
            region,
            kind,
            labels_length,
            values_length,
        })
    }

    pub fn open_readonly(path: &Path, kind: MetricKind) -> Result<Self, LayoutError> {
        let region = SharedRegion::from(MmapRegion::attach_readonly(path)?);
        if region.len() < HEADER_LENGTH {
            return Err(LayoutError::Undersized {
                what: "metrics file",
                capacity: region.len(),
                minimum: HEADER_LENGTH,
            });
        }

        let raw = region.region();
        let version = raw.atomic_i32(VERSION_OFFSET).load(Ordering::Acquire);
        if version != METRICS_VERSION {
            return Err(LayoutError::VersionMismatch {
                expected: METRICS_VERSION,
                found: version,
            });
        }

        let labels_length = stored_length(raw, LABELS_LENGTH_OFFSET)?;
        let values_length = stored_length(raw, VALUES_LENGTH_OFFSET)?;
        if labels_length % LABEL_RECORD_LENGTH != 0 {
            return Err(LayoutError::Corrupt("labels length is not a whole number of records"));
        }
        if values_length % kind.cell_size() != 0 {
            return Err(LayoutError::Corrupt("values length is not a whole number of cells"));
        }
        let expected = HEADER_LENGTH + labels_length + values_length;
        if region.len() != expected {
            return Err(LayoutError::LengthMismatch {
                expected,
                actual: region.len(),
            });
        }

        debug!(
            path = %path.display(),
            %kind,
            labels_length,
            values_length,
            "attached metrics layout"
        );

        Ok(Self {
            region,
            kind,
            labels_length,
            values_length,
        })
    }

    #[inline]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.region.path().map(Path::to_path_buf)
    }

    #[inline]
    pub fn labels_length(&self) -> usize {
        self.labels_length
    }

    #[inline]
    pub fn values_length(&self) -> usize {
        self.values_length
    }

    /// Number of distinct metrics this layout can hold.
    pub fn capacity(&self) -> usize {
        (self.labels_length / LABEL_RECORD_LENGTH).min(self.values_length / self.kind.cell_size())
    }

    #[inline]
    fn label_offset(&self, index: usize) -> usize {
        HEADER_LENGTH + index * LABEL_RECORD_LENGTH
    }

    #[inline]
    fn values_offset(&self) -> usize {
        HEADER_LENGTH + self.labels_length
    }

    /// Published records, in insertion order.
    fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        let raw = self.region.region();
        (0..self.capacity()).map_while(move |index| {
            let offset = self.label_offset(index);
            let binding_id = raw
                .atomic_i64(offset + LABEL_BINDING_ID_OFFSET)
                .load(Ordering::Acquire);
            if binding_id == 0 {
                return None;
            }
            Some(Label {
                index,
                binding_id,
                metric_id: raw
                    .atomic_i64(offset + LABEL_METRIC_ID_OFFSET)
                    .load(Ordering::Relaxed),
                value_offset: raw
                    .atomic_i64(offset + LABEL_VALUE_OFFSET_OFFSET)
                    .load(Ordering::Relaxed) as usize,
            })
        })
    }

    fn find(&self, binding_id: i64, metric_id: i64) -> Option<Label> {
        self.labels()
            .find(|label| label.binding_id == binding_id && label.metric_id == metric_id)
    }

    /// Every `(binding_id, metric_id)` published so far, in insertion order.
    pub fn ids(&self) -> Vec<(i64, i64)> {
        self.labels()
            .map(|label| (label.binding_id, label.metric_id))
            .collect()
    }

    /// Returns the writer for a metric, allocating its cell on first use.
    ///
    /// Only the owning worker may call this: allocation is not synchronised
    /// between writers.
    ///
    /// # Panics
    ///
    /// Panics if `binding_id` is 0, which marks an empty label record.
    pub fn supply_writer(
        &self,
        binding_id: i64,
        metric_id: i64,
    ) -> Result<MetricWriter, LayoutError> {
        assert!(binding_id != 0, "binding id 0 is reserved");
        if !self.region.is_writable() {
            return Err(LayoutError::ReadOnly);
        }

        let mut next = 0;
        for label in self.labels() {
            if label.binding_id == binding_id && label.metric_id == metric_id {
                return Ok(self.writer_at(label.value_offset));
            }
            next = label.index + 1;
        }

        if next == self.capacity() {
            return Err(LayoutError::CapacityExceeded {
                what: "metrics layout",
                capacity: self.capacity(),
            });
        }

        let value_offset = next * self.kind.cell_size();
        let raw = self.region.region();
        let offset = self.label_offset(next);
        raw.atomic_i64(offset + LABEL_METRIC_ID_OFFSET)
            .store(metric_id, Ordering::Relaxed);
        raw.atomic_i64(offset + LABEL_VALUE_OFFSET_OFFSET)
            .store(value_offset as i64, Ordering::Relaxed);
        raw.atomic_i64(offset + LABEL_BINDING_ID_OFFSET)
            .store(binding_id, Ordering::Release);

        trace!(kind = %self.kind, binding_id, metric_id, index = next, "allocated metric");
        Ok(self.writer_at(value_offset))
    }

    /// Returns a reader for a metric, or `None` if it was never written.
    pub fn supply_reader(&self, binding_id: i64, metric_id: i64) -> Option<MetricReader> {
        self.find(binding_id, metric_id)
            .map(|label| self.reader_at(label.value_offset))
    }

    fn writer_at(&self, value_offset: usize) -> MetricWriter {
        MetricWriter {
            cell: Cell {
                region: self.region.clone(),
                offset: self.values_offset() + value_offset,
            },
            kind: self.kind,
        }
    }

    fn reader_at(&self, value_offset: usize) -> MetricReader {
        MetricReader {
            cell: Cell {
                region: self.region.clone(),
                offset: self.values_offset() + value_offset,
            },
            kind: self.kind,
        }
    }
}

impl std::fmt::Debug for MetricsLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsLayout")
            .field("kind", &self.kind)
            .field("path", &self.region.path())
            .field("labels_length", &self.labels_length)
            .field("values_length", &self.values_length)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct Label {
    index: usize,
    binding_id: i64,
    metric_id: i64,
    value_offset: usize,
}

fn rounded(what: &'static str, capacity: usize, unit: usize) -> Result<usize, LayoutError> {
    let length = capacity - capacity % unit;
    if length == 0 {
        return Err(LayoutError::Undersized {
            what,
            capacity,
            minimum: unit,
        });
    }
    Ok(length)
}

fn header_field(what: &'static str, length: usize) -> Result<i32, LayoutError> {
    i32::try_from(length).map_err(|_| LayoutError::CapacityExceeded {
        what,
        capacity: i32::MAX as usize,
    })
}

fn stored_length(raw: &Region, offset: usize) -> Result<usize, LayoutError> {
    let value = raw.atomic_i32(offset).load(Ordering::Relaxed);
    usize::try_from(value).map_err(|_| LayoutError::Corrupt("negative region length"))
}

/// An 8-byte-aligned cell inside a mapped layout.
#[derive(Clone)]
struct Cell {
    region: SharedRegion,
    offset: usize,
}

impl Cell {
    #[inline]
    fn word(&self, index: usize) -> &AtomicI64 {
        self.region.region().atomic_i64(self.offset + index * 8)
    }

    /// Single-writer increment: an ordered store, no read-modify-write.
    #[inline]
    fn bump(&self, index: usize, delta: i64) {
        let word = self.word(index);
        let value = word.load(Ordering::Relaxed);
        word.store(value.saturating_add(delta), Ordering::Release);
    }
}

/// Writes one metric cell.
#[derive(Clone)]
pub struct MetricWriter {
    cell: Cell,
    kind: MetricKind,
}

impl MetricWriter {
    #[inline]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Adds `delta` to a counter or gauge.
    ///
    /// # Panics
    ///
    /// Panics on a histogram, or on a negative counter delta.
    pub fn add(&self, delta: i64) {
        match self.kind {
            MetricKind::Counter => assert!(delta >= 0, "counters only go up"),
            MetricKind::Gauge => {}
            MetricKind::Histogram => panic!("add on a histogram, use record"),
        }
        self.cell.bump(0, delta);
    }

    /// Counts `value` in its histogram bucket.
    ///
    /// # Panics
    ///
    /// Panics unless this is a histogram.
    pub fn record(&self, value: i64) {
        assert_eq!(self.kind, MetricKind::Histogram, "record on a {}", self.kind);
        self.cell.bump(bucket_index(value), 1);
    }
}

impl std::fmt::Debug for MetricWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricWriter")
            .field("kind", &self.kind)
            .field("offset", &self.cell.offset)
            .finish()
    }
}

/// Reads one metric cell, possibly from another process.
#[derive(Clone)]
pub struct MetricReader {
    cell: Cell,
    kind: MetricKind,
}

impl MetricReader {
    #[inline]
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Current value of a counter or gauge; the total count of a histogram.
    pub fn value(&self) -> i64 {
        match self.kind {
            MetricKind::Histogram => self
                .buckets()
                .iter()
                .fold(0i64, |total, &count| total.saturating_add(count)),
            _ => self.cell.word(0).load(Ordering::Acquire),
        }
    }

    /// Bucket counts of a histogram. Counters and gauges return all zeros.
    pub fn buckets(&self) -> [i64; HISTOGRAM_BUCKETS] {
        let mut buckets = [0; HISTOGRAM_BUCKETS];
        if self.kind == MetricKind::Histogram {
            for (index, bucket) in buckets.iter_mut().enumerate() {
                *bucket = self.cell.word(index).load(Ordering::Acquire);
            }
        }
        buckets
    }

    pub fn stats(&self) -> HistogramStats {
        HistogramStats::from_buckets(&self.buckets())
    }
}

impl std::fmt::Debug for MetricReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricReader")
            .field("kind", &self.kind)
            .field("offset", &self.cell.offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::namespaced_id;

    fn layout(dir: &Path, kind: MetricKind) -> MetricsLayout {
        MetricsLayout::create(&dir.join(kind.as_str()), kind, 1024, 8192).unwrap()
    }

    #[test]
    fn counter_round_trip_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), MetricKind::Counter);
        let binding = namespaced_id(1, 11);

        let writer = layout.supply_writer(binding, 42).unwrap();
        writer.add(5);
        writer.add(2);

        let reader = layout.supply_reader(binding, 42).unwrap();
        assert_eq!(reader.value(), 7);
        assert!(layout.supply_reader(binding, 43).is_none());
    }

    #[test]
    fn same_key_shares_cell() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), MetricKind::Counter);

        layout.supply_writer(1, 2).unwrap().add(1);
        layout.supply_writer(1, 2).unwrap().add(1);
        layout.supply_writer(1, 3).unwrap().add(10);

        assert_eq!(layout.ids(), vec![(1, 2), (1, 3)]);
        assert_eq!(layout.supply_reader(1, 2).unwrap().value(), 2);
        assert_eq!(layout.supply_reader(1, 3).unwrap().value(), 10);
    }

    #[test]
    fn gauge_goes_down() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), MetricKind::Gauge);

        let writer = layout.supply_writer(7, 8).unwrap();
        writer.add(3);
        writer.add(-5);
        assert_eq!(layout.supply_reader(7, 8).unwrap().value(), -2);
    }

    #[test]
    fn counter_saturates_at_max() {
        let dir = tempfile::tempdir().unwrap();
        let counters = layout(dir.path(), MetricKind::Counter);
        let gauges = layout(dir.path(), MetricKind::Gauge);

        let writer = counters.supply_writer(1, 1).unwrap();
        writer.add(i64::MAX - 1);
        writer.add(10);
        assert_eq!(counters.supply_reader(1, 1).unwrap().value(), i64::MAX);

        let gauge = gauges.supply_writer(1, 1).unwrap();
        gauge.add(i64::MIN + 1);
        gauge.add(-10);
        assert_eq!(gauges.supply_reader(1, 1).unwrap().value(), i64::MIN);
    }

    #[test]
    #[should_panic(expected = "counters only go up")]
    fn counter_rejects_negative_delta() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), MetricKind::Counter);
        layout.supply_writer(1, 1).unwrap().add(-1);
    }

    #[test]
    fn histogram_records_into_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(dir.path(), MetricKind::Histogram);

        let writer = layout.supply_writer(3, 4).unwrap();
        writer.record(1);
        writer.record(32);
        writer.record(63);

        let reader = layout.supply_reader(3, 4).unwrap();
        let buckets = reader.buckets();
        assert_eq!(buckets[0], 1);
        assert_eq!(buckets[5], 2);
        assert_eq!(reader.value(), 3);
        assert_eq!(reader.stats().to_array(), [1, 63, 127, 3, 42]);
    }

    #[test]
    fn full_table_is_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small");
        let layout = MetricsLayout::create(&path, MetricKind::Counter, 48, 1024).unwrap();
        assert_eq!(layout.capacity(), 2);

        layout.supply_writer(1, 1).unwrap();
        layout.supply_writer(1, 2).unwrap();
        assert!(matches!(
            layout.supply_writer(1, 3),
            Err(LayoutError::CapacityExceeded { capacity: 2, .. })
        ));
        // Existing keys still resolve.
        assert!(layout.supply_writer(1, 1).is_ok());
    }

    #[test]
    fn undersized_capacities_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny");

        assert!(matches!(
            MetricsLayout::create(&path, MetricKind::Counter, 16, 1024),
            Err(LayoutError::Undersized { minimum: 24, .. })
        ));
        assert!(matches!(
            MetricsLayout::create(&path, MetricKind::Histogram, 1024, 256),
            Err(LayoutError::Undersized { minimum: 504, .. })
        ));
    }

    #[test]
    fn readonly_reads_stored_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gauges0");
        let owner = MetricsLayout::create(&path, MetricKind::Gauge, 100, 100).unwrap();
        assert_eq!(owner.labels_length(), 96);
        assert_eq!(owner.values_length(), 96);
        owner.supply_writer(5, 6).unwrap().add(9);

        let reader =
            MetricsLayout::build(&path, MetricKind::Gauge, 0, 0, Mode::ReadOnly).unwrap();
        assert_eq!(reader.labels_length(), 96);
        assert_eq!(reader.values_length(), 96);
        assert_eq!(reader.ids(), vec![(5, 6)]);
        assert_eq!(reader.supply_reader(5, 6).unwrap().value(), 9);
        assert!(matches!(
            reader.supply_writer(5, 6),
            Err(LayoutError::ReadOnly)
        ));
    }

    #[test]
    fn version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters0");
        let owner = MetricsLayout::create(&path, MetricKind::Counter, 240, 80).unwrap();

        let raw = MmapRegion::attach(&path).unwrap();
        raw.region()
            .atomic_i32(VERSION_OFFSET)
            .store(METRICS_VERSION + 1, Ordering::Release);

        assert!(matches!(
            MetricsLayout::open_readonly(&path, MetricKind::Counter),
            Err(LayoutError::VersionMismatch { expected: 1, found: 2 })
        ));
        drop(owner);
    }

    #[test]
    fn truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short");
        let _owner = MetricsLayout::create(&path, MetricKind::Counter, 240, 80).unwrap();

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((HEADER_LENGTH + 240) as u64).unwrap();

        assert!(matches!(
            MetricsLayout::open_readonly(&path, MetricKind::Counter),
            Err(LayoutError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn wrong_kind_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters");
        let _owner = MetricsLayout::create(&path, MetricKind::Counter, 240, 80).unwrap();

        assert!(matches!(
            MetricsLayout::open_readonly(&path, MetricKind::Histogram),
            Err(LayoutError::Corrupt(_))
        ));
    }
}
