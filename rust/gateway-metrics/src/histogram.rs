//! Exponential histogram buckets.
//!
//! Bucket `i` counts values `v` with `2^i <= v < 2^(i+1)`. Values below 1
//! land in bucket 0; 63 buckets cover every positive `i64`.

pub const HISTOGRAM_BUCKETS: usize = 63;

/// Bucket that counts `value`.
#[inline]
pub fn bucket_index(value: i64) -> usize {
    if value < 1 {
        0
    } else {
        (63 - value.leading_zeros()) as usize
    }
}

/// Value that stands in for every observation in bucket `index`: its
/// largest member, `2^(index+1) - 1`.
#[inline]
pub fn bucket_value(index: usize) -> i64 {
    debug_assert!(index < HISTOGRAM_BUCKETS);
    ((1u64 << (index + 1)) - 1) as i64
}

/// Summary of a histogram, each bucket counted at its [`bucket_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistogramStats {
    pub min: i64,
    pub max: i64,
    pub sum: i64,
    pub count: i64,
    pub avg: i64,
}

impl HistogramStats {
    pub fn from_buckets(buckets: &[i64; HISTOGRAM_BUCKETS]) -> Self {
        let mut stats = HistogramStats::default();
        let mut seen = false;
        for (index, &count) in buckets.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let value = bucket_value(index);
            if !seen {
                stats.min = value;
                seen = true;
            }
            stats.max = value;
            stats.sum = stats.sum.saturating_add(value.saturating_mul(count));
            stats.count = stats.count.saturating_add(count);
        }
        if stats.count != 0 {
            stats.avg = stats.sum / stats.count;
        }
        stats
    }

    /// `[min, max, sum, count, avg]`
    pub fn to_array(self) -> [i64; 5] {
        [self.min, self.max, self.sum, self.count, self.avg]
    }
}
