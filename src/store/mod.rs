pub mod memory;
pub mod shared;

pub use memory::MemoryCache;
pub use shared::{SharedCache, SharedCacheInfo};

use anyhow::Result;

use crate::core::{SignalCachePart, TimeRange};

/// Store contract implemented identically by the plain in-process cache and
/// the shared-memory cache.
///
/// Exactly one store is active per processor instance, selected at setup and
/// never swapped. `insert_signals` must be safe to call from the fetch driver
/// while a consumer concurrently reads the coverage bounds.
pub trait SignalStore: Send + Sync {
    /// Current contiguous coverage bounds in cache time; `[0, 0)` when empty
    fn output_range(&self) -> TimeRange;

    /// Per-channel observed coverage bounds
    fn signal_ranges(&self) -> Vec<TimeRange>;

    fn sampling_rates(&self) -> Vec<f64>;

    /// Tightest coverage common to every channel with a nonzero sampling
    /// rate: the highest start and lowest end across channels. Channels can
    /// be filled at different granularities, so this is the usable
    /// intersection.
    fn common_coverage(&self) -> Option<TimeRange>;

    /// True when every channel holds contiguous data for the whole range
    fn is_covered(&self, range: TimeRange) -> bool;

    /// The contiguous covered interval containing `t`, common to all
    /// channels, if any
    fn covered_interval_containing(&self, t: f64) -> Option<TimeRange>;

    /// Sub-ranges of `range` not yet covered on every channel
    fn uncovered_within(&self, range: TimeRange) -> Vec<TimeRange>;

    /// Merge new per-channel sample data, extending or overwriting coverage
    fn insert_signals(&self, part: &SignalCachePart) -> Result<()>;

    /// Materialize the current common coverage for response assembly
    fn as_cache_part(&self) -> Result<SignalCachePart>;

    /// Drop cached data outside `range` (window eviction)
    fn trim_to(&self, range: TimeRange) -> Result<()>;

    /// Release underlying storage; idempotent
    fn release(&self);

    fn is_released(&self) -> bool;
}

/// Adjacency tolerance when merging covered spans; inserts are sample
/// aligned, so anything closer than this is the same boundary.
const MERGE_EPSILON: f64 = 1e-9;

/// Sorted, merged set of covered cache-time intervals
#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    spans: Vec<TimeRange>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: TimeRange) {
        if range.is_empty() {
            return;
        }
        self.spans.push(range);
        self.spans.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut merged: Vec<TimeRange> = Vec::with_capacity(self.spans.len());
        for span in self.spans.drain(..) {
            match merged.last_mut() {
                Some(last) if span.start <= last.end + MERGE_EPSILON => {
                    last.end = last.end.max(span.end);
                }
                _ => merged.push(span),
            }
        }
        self.spans = merged;
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn spans(&self) -> &[TimeRange] {
        &self.spans
    }

    /// Overall bounds, ignoring interior holes
    pub fn bounds(&self) -> Option<TimeRange> {
        match (self.spans.first(), self.spans.last()) {
            (Some(first), Some(last)) => Some(TimeRange::new(first.start, last.end)),
            _ => None,
        }
    }

    pub fn covers(&self, range: TimeRange) -> bool {
        self.spans
            .iter()
            .any(|span| span.start <= range.start + MERGE_EPSILON && span.end + MERGE_EPSILON >= range.end)
    }

    pub fn containing(&self, t: f64) -> Option<TimeRange> {
        self.spans
            .iter()
            .find(|span| t + MERGE_EPSILON >= span.start && t <= span.end + MERGE_EPSILON)
            .copied()
    }

    /// Sub-ranges of `range` not covered by any span
    pub fn holes_within(&self, range: TimeRange) -> Vec<TimeRange> {
        let mut holes = Vec::new();
        let mut cursor = range.start;
        for span in &self.spans {
            if span.end <= cursor {
                continue;
            }
            if span.start >= range.end {
                break;
            }
            if span.start > cursor + MERGE_EPSILON {
                holes.push(TimeRange::new(cursor, span.start.min(range.end)));
            }
            cursor = cursor.max(span.end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor + MERGE_EPSILON < range.end {
            holes.push(TimeRange::new(cursor, range.end));
        }
        holes
    }

    /// Clip every span to `range`, dropping what falls outside
    pub fn clip_to(&mut self, range: TimeRange) {
        self.spans = self
            .spans
            .iter()
            .filter_map(|span| span.intersect(&range))
            .collect();
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }
}
