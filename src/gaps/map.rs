use log::warn;

use crate::core::Gap;

/// Sorted map of recording interruptions, keyed by cache-time position.
///
/// Gaps can be discovered in any order while a discontinuous file is read, so
/// additions append and resort. Positions are unique and strictly ascending;
/// durations are always positive. Gaps already registered are immutable.
#[derive(Debug, Clone, Default)]
pub struct GapMap {
    /// (cache position, duration) pairs, sorted by position
    entries: Vec<(f64, f64)>,
}

impl GapMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly discovered gap. Non-positive durations and duplicate
    /// positions are rejected.
    pub fn insert(&mut self, position: f64, duration: f64) -> bool {
        if duration <= 0.0 {
            warn!(
                "ignoring gap with non-positive duration {} at position {}",
                duration, position
            );
            return false;
        }
        if self.entries.iter().any(|(p, _)| *p == position) {
            // Re-reported by an overlapping chunk read; past gaps are immutable
            return false;
        }
        self.entries.push((position, duration));
        self.entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        true
    }

    pub fn merge(&mut self, gaps: &[Gap]) -> usize {
        gaps.iter()
            .filter(|g| self.insert(g.start, g.duration))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[(f64, f64)] {
        &self.entries
    }

    /// Sum of all registered gap durations
    pub fn total_duration(&self) -> f64 {
        self.entries.iter().map(|(_, d)| d).sum()
    }

    /// Total duration of gaps positioned at or before `cache_pos`.
    ///
    /// A gap positioned exactly at `cache_pos` precedes the sample acquired
    /// there, so it counts.
    pub fn total_at_or_before(&self, cache_pos: f64) -> f64 {
        self.entries
            .iter()
            .take_while(|(p, _)| *p <= cache_pos)
            .map(|(_, d)| d)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_resorts() {
        let mut map = GapMap::new();
        assert!(map.insert(7.0, 1.0));
        assert!(map.insert(2.0, 3.0));
        assert_eq!(map.entries(), &[(2.0, 3.0), (7.0, 1.0)]);
    }

    #[test]
    fn test_insert_rejects_duplicates_and_bad_durations() {
        let mut map = GapMap::new();
        assert!(map.insert(2.0, 3.0));
        assert!(!map.insert(2.0, 5.0));
        assert!(!map.insert(4.0, 0.0));
        assert!(!map.insert(4.0, -1.0));
        assert_eq!(map.len(), 1);
        assert_eq!(map.total_duration(), 3.0);
    }

    #[test]
    fn test_total_at_or_before_is_inclusive() {
        let mut map = GapMap::new();
        map.insert(2.0, 3.0);
        map.insert(6.0, 1.0);
        assert_eq!(map.total_at_or_before(1.0), 0.0);
        assert_eq!(map.total_at_or_before(2.0), 3.0);
        assert_eq!(map.total_at_or_before(10.0), 4.0);
    }
}
