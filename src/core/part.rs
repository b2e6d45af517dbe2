use serde::{Deserialize, Serialize};

use super::Annotation;

/// Half-open time window `[start, end)` in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// True when `other` lies fully within this range
    pub fn contains(&self, other: &TimeRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    pub fn contains_time(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection of two ranges, None when they do not overlap
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if end > start {
            Some(TimeRange::new(start, end))
        } else {
            None
        }
    }
}

/// A span of recording time with no acquired samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    /// Cache-time or recording-time position depending on query mode
    pub start: f64,
    pub duration: f64,
}

impl Gap {
    pub fn new(start: f64, duration: f64) -> Self {
        Self { start, duration }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Sample data for a single channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSignal {
    pub data: Vec<f32>,
    pub sampling_rate: f64,
}

impl CacheSignal {
    pub fn new(sampling_rate: f64) -> Self {
        Self {
            data: Vec::new(),
            sampling_rate,
        }
    }
}

/// Contiguous window of cached per-channel sample data.
///
/// All channel buffers represent the same `[start, end)` cache-time window at
/// their respective sampling rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCachePart {
    pub start: f64,
    pub end: f64,
    pub signals: Vec<CacheSignal>,
}

impl SignalCachePart {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            start,
            end,
            signals: Vec::new(),
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Channel selection for signal queries; include wins when both are given
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub include: Option<Vec<usize>>,
    pub exclude: Option<Vec<usize>>,
}

impl ChannelFilter {
    pub fn accepts(&self, channel: usize) -> bool {
        if let Some(include) = &self.include {
            return include.contains(&channel);
        }
        if let Some(exclude) = &self.exclude {
            return !exclude.contains(&channel);
        }
        true
    }
}

/// Progress event emitted after each successful chunk insert.
///
/// Gaps are always resent in full because they can be revised retroactively
/// as more of a discontinuous file is discovered.
#[derive(Debug, Clone)]
pub struct CacheUpdate {
    pub range: TimeRange,
    pub annotations: Vec<Annotation>,
    pub gaps: Vec<Gap>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_contains() {
        let outer = TimeRange::new(0.0, 10.0);
        assert!(outer.contains(&TimeRange::new(2.0, 8.0)));
        assert!(outer.contains(&TimeRange::new(0.0, 10.0)));
        assert!(!outer.contains(&TimeRange::new(5.0, 11.0)));
    }

    #[test]
    fn test_range_intersect() {
        let a = TimeRange::new(0.0, 5.0);
        let b = TimeRange::new(3.0, 8.0);
        assert_eq!(a.intersect(&b), Some(TimeRange::new(3.0, 5.0)));
        // Abutting ranges do not intersect
        assert_eq!(a.intersect(&TimeRange::new(5.0, 8.0)), None);
    }

    #[test]
    fn test_filter_include_wins() {
        let filter = ChannelFilter {
            include: Some(vec![0, 2]),
            exclude: Some(vec![0]),
        };
        assert!(filter.accepts(0));
        assert!(!filter.accepts(1));
        assert!(filter.accepts(2));
    }
}
