//! Aggregation across per-worker metrics layouts.

use std::collections::HashMap;
use std::fmt;

use crate::histogram::{HISTOGRAM_BUCKETS, HistogramStats};
use crate::id::{local_id, namespace_id};
use crate::labels::Labels;
use crate::layout::{MetricKind, MetricsLayout};

/// Aggregated value of one metric across workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricValue {
    Counter(i64),
    Gauge(i64),
    Histogram(Box<[i64; HISTOGRAM_BUCKETS]>),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Histogram(_) => MetricKind::Histogram,
        }
    }

    pub fn stats(&self) -> Option<HistogramStats> {
        match self {
            MetricValue::Histogram(buckets) => Some(HistogramStats::from_buckets(buckets)),
            _ => None,
        }
    }
}

/// Counters and gauges print their value; histograms print
/// `[min, max, sum, count, avg]`.
impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Counter(value) | MetricValue::Gauge(value) => write!(f, "{value}"),
            MetricValue::Histogram(buckets) => {
                let [min, max, sum, count, avg] = HistogramStats::from_buckets(buckets).to_array();
                write!(f, "[{min}, {max}, {sum}, {count}, {avg}]")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    pub binding_id: i64,
    pub metric_id: i64,
    pub value: MetricValue,
}

impl MetricRecord {
    #[inline]
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    #[inline]
    pub fn namespace_id(&self) -> u32 {
        namespace_id(self.binding_id)
    }

    /// Resolve the namespace, binding and metric ids through `labels`.
    pub fn names<'a>(&self, labels: &'a Labels) -> MetricNames<'a> {
        MetricNames {
            namespace: labels.lookup_label(self.namespace_id()),
            binding: labels.lookup_label(local_id(self.binding_id)),
            metric: labels.lookup_label(local_id(self.metric_id)),
        }
    }
}

/// Label names of a record. `None` where the id has no label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricNames<'a> {
    pub namespace: Option<&'a str>,
    pub binding: Option<&'a str>,
    pub metric: Option<&'a str>,
}

/// Selects records by the namespace and local part of their binding id.
/// `None` matches anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricFilter {
    pub namespace: Option<u32>,
    pub binding: Option<u32>,
}

impl MetricFilter {
    /// Filter on namespace and binding names. Returns `None` when a given
    /// name has no label, since no record can match it.
    pub fn named(labels: &Labels, namespace: Option<&str>, binding: Option<&str>) -> Option<Self> {
        let resolve = |name: Option<&str>| match name {
            Some(name) => labels.lookup_label_id(name).map(Some),
            None => Some(None),
        };
        Some(Self {
            namespace: resolve(namespace)?,
            binding: resolve(binding)?,
        })
    }

    pub fn matches(&self, binding_id: i64) -> bool {
        self.namespace.is_none_or(|ns| ns == namespace_id(binding_id))
            && self.binding.is_none_or(|local| local == local_id(binding_id))
    }
}

/// Reads the metrics of every worker and sums them per key.
pub struct MetricsReader {
    layouts: Vec<MetricsLayout>,
}

impl MetricsReader {
    /// Layouts may be given in any order; within a kind, worker order is
    /// kept and decides the order keys are first reported in.
    pub fn new(layouts: impl IntoIterator<Item = MetricsLayout>) -> Self {
        let mut layouts: Vec<_> = layouts.into_iter().collect();
        layouts.sort_by_key(MetricsLayout::kind);
        Self { layouts }
    }

    pub fn layouts(&self) -> &[MetricsLayout] {
        &self.layouts
    }

    /// All metrics: counters, then gauges, then histograms.
    pub fn records(&self) -> Vec<MetricRecord> {
        self.filtered(&MetricFilter::default())
    }

    /// Records whose namespace and binding carry the given names.
    pub fn filtered_by_name(
        &self,
        labels: &Labels,
        namespace: Option<&str>,
        binding: Option<&str>,
    ) -> Vec<MetricRecord> {
        match MetricFilter::named(labels, namespace, binding) {
            Some(filter) => self.filtered(&filter),
            None => Vec::new(),
        }
    }

    pub fn filtered(&self, filter: &MetricFilter) -> Vec<MetricRecord> {
        let mut records: Vec<MetricRecord> = Vec::new();
        let mut index: HashMap<(MetricKind, i64, i64), usize> = HashMap::new();

        for layout in &self.layouts {
            let kind = layout.kind();
            for (binding_id, metric_id) in layout.ids() {
                if !filter.matches(binding_id) {
                    continue;
                }
                let Some(reader) = layout.supply_reader(binding_id, metric_id) else {
                    continue;
                };

                let slot = *index.entry((kind, binding_id, metric_id)).or_insert_with(|| {
                    records.push(MetricRecord {
                        binding_id,
                        metric_id,
                        value: match kind {
                            MetricKind::Counter => MetricValue::Counter(0),
                            MetricKind::Gauge => MetricValue::Gauge(0),
                            MetricKind::Histogram => {
                                MetricValue::Histogram(Box::new([0; HISTOGRAM_BUCKETS]))
                            }
                        },
                    });
                    records.len() - 1
                });

                match &mut records[slot].value {
                    MetricValue::Counter(total) | MetricValue::Gauge(total) => {
                        *total = total.saturating_add(reader.value());
                    }
                    MetricValue::Histogram(total) => {
                        for (sum, count) in total.iter_mut().zip(reader.buckets()) {
                            *sum = sum.saturating_add(count);
                        }
                    }
                }
            }
        }

        trace!(records = records.len(), "read metrics");
        records
    }
}

/// Render `records` as a table of `namespace binding metric value`.
///
/// Name columns are left-aligned and padded four past their widest entry;
/// values are right-aligned. Ids without a label print as numbers.
/// Histograms print `[min: .. | max: .. | cnt: .. | avg: ..]`.
pub fn format_records(records: &[MetricRecord], labels: &Labels) -> String {
    const HEADER: [&str; 4] = ["namespace", "binding", "metric", "value"];
    const GAP: usize = 4;

    let rows: Vec<[String; 4]> = records
        .iter()
        .map(|record| {
            let names = record.names(labels);
            let name = |label: Option<&str>, id: u32| label.map_or_else(|| id.to_string(), str::to_owned);
            let value = match record.value.stats() {
                Some(stats) => format!(
                    "[min: {} | max: {} | cnt: {} | avg: {}]",
                    stats.min, stats.max, stats.count, stats.avg
                ),
                None => record.value.to_string(),
            };
            [
                name(names.namespace, record.namespace_id()),
                name(names.binding, local_id(record.binding_id)),
                name(names.metric, local_id(record.metric_id)),
                value,
            ]
        })
        .collect();

    let mut widths = HEADER.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let header = HEADER.map(str::to_owned);
    for row in std::iter::once(&header).chain(&rows) {
        let [namespace, binding, metric, value] = row;
        out.push_str(&format!(
            "{namespace:<w0$}{binding:<w1$}{metric:<w2$}{value:>w3$}\n",
            w0 = widths[0] + GAP,
            w1 = widths[1] + GAP,
            w2 = widths[2] + GAP,
            w3 = widths[3],
        ));
    }
    out.push('\n');
    out
}

impl fmt::Debug for MetricsReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsReader")
            .field("layouts", &self.layouts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::namespaced_id;

    #[test]
    fn filter_by_namespace_and_binding() {
        let any = MetricFilter::default();
        let ns = MetricFilter {
            namespace: Some(1),
            binding: None,
        };
        let both = MetricFilter {
            namespace: Some(1),
            binding: Some(11),
        };

        let id = namespaced_id(1, 11);
        assert!(any.matches(id));
        assert!(ns.matches(id));
        assert!(both.matches(id));
        assert!(!ns.matches(namespaced_id(2, 11)));
        assert!(!both.matches(namespaced_id(1, 12)));
    }

    fn labels(dir: &std::path::Path) -> Labels {
        let mut labels = Labels::open(dir).unwrap();
        // ids 1..=8 in order
        for name in [
            "ns1", "ns2", "binding1", "binding2", "counter1", "counter2", "gauge1", "histogram1",
        ] {
            labels.supply_label_id(name).unwrap();
        }
        labels
    }

    #[test]
    fn names_resolve_through_labels() {
        let dir = tempfile::tempdir().unwrap();
        let labels = labels(dir.path());
        let record = MetricRecord {
            binding_id: namespaced_id(1, 4),
            metric_id: namespaced_id(1, 5),
            value: MetricValue::Counter(43),
        };
        assert_eq!(
            record.names(&labels),
            MetricNames {
                namespace: Some("ns1"),
                binding: Some("binding2"),
                metric: Some("counter1"),
            }
        );

        let unknown = MetricRecord {
            binding_id: namespaced_id(9, 3),
            ..record
        };
        assert_eq!(unknown.names(&labels).namespace, None);
        assert_eq!(unknown.names(&labels).binding, Some("binding1"));
    }

    #[test]
    fn named_filter_resolves_ids() {
        let dir = tempfile::tempdir().unwrap();
        let labels = labels(dir.path());

        assert_eq!(
            MetricFilter::named(&labels, Some("ns2"), None),
            Some(MetricFilter {
                namespace: Some(2),
                binding: None,
            })
        );
        assert_eq!(
            MetricFilter::named(&labels, Some("ns1"), Some("binding2")),
            Some(MetricFilter {
                namespace: Some(1),
                binding: Some(4),
            })
        );
        assert_eq!(MetricFilter::named(&labels, None, None), Some(MetricFilter::default()));
        assert_eq!(MetricFilter::named(&labels, Some("ns3"), None), None);
    }

    #[test]
    fn table_aligns_columns() {
        let dir = tempfile::tempdir().unwrap();
        let labels = labels(dir.path());
        let mut buckets = Box::new([0; HISTOGRAM_BUCKETS]);
        buckets[0] = 1;
        buckets[5] = 1;
        let records = [
            MetricRecord {
                binding_id: namespaced_id(1, 3),
                metric_id: namespaced_id(1, 5),
                value: MetricValue::Counter(42),
            },
            MetricRecord {
                binding_id: namespaced_id(2, 3),
                metric_id: namespaced_id(2, 5),
                value: MetricValue::Counter(44),
            },
            MetricRecord {
                binding_id: namespaced_id(1, 3),
                metric_id: namespaced_id(1, 7),
                value: MetricValue::Gauge(88),
            },
            MetricRecord {
                binding_id: namespaced_id(1, 3),
                metric_id: namespaced_id(1, 8),
                value: MetricValue::Histogram(buckets),
            },
        ];

        let expected = concat!(
            "namespace    binding     metric                                        value\n",
            "ns1          binding1    counter1                                         42\n",
            "ns2          binding1    counter1                                         44\n",
            "ns1          binding1    gauge1                                           88\n",
            "ns1          binding1    histogram1    [min: 1 | max: 63 | cnt: 2 | avg: 32]\n",
            "\n",
        );
        assert_eq!(format_records(&records, &labels), expected);

        let short = format_records(&records[1..2], &labels);
        assert_eq!(
            short,
            "namespace    binding     metric      value\nns2          binding1    counter1       44\n\n"
        );
    }

    #[test]
    fn unlabelled_ids_print_as_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let labels = Labels::open(dir.path()).unwrap();
        let record = MetricRecord {
            binding_id: namespaced_id(1, 11),
            metric_id: namespaced_id(1, 21),
            value: MetricValue::Gauge(-3),
        };
        assert_eq!(
            format_records(&[record], &labels),
            "namespace    binding    metric    value\n1            11         21           -3\n\n"
        );
    }

    #[test]
    fn histogram_value_prints_stats() {
        let mut buckets = Box::new([0; HISTOGRAM_BUCKETS]);
        buckets[0] = 1;
        buckets[5] = 1;
        let value = MetricValue::Histogram(buckets);
        assert_eq!(value.to_string(), "[1, 63, 64, 2, 32]");
        assert_eq!(MetricValue::Gauge(-3).to_string(), "-3");
    }
}
