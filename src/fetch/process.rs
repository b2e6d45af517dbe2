use serde::{Deserialize, Serialize};

use crate::core::TimeRange;

/// Which way an incremental load extends its covered window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadDirection {
    /// Always extend at the covered end
    Forward,
    /// Extend at the covered start, clamped at zero
    Backward,
    /// Grow outward in both directions from the initial request point,
    /// strictly alternating between the last forward point and the last
    /// backward point
    Alternate,
}

/// An in-flight incremental fetch targeting a specific unit window.
///
/// Lifecycle: created when a requested range is not fully covered, mutated as
/// each chunk lands, removed when the target is met or the process is
/// cancelled. Multiple processes may coexist for disjoint target windows.
#[derive(Debug, Clone)]
pub struct CacheProcess {
    pub id: u64,
    /// Target window in cache time, for reporting
    pub target: TimeRange,
    /// Target window as `[start, end)` data-unit indices
    pub target_units: (usize, usize),
    pub direction: LoadDirection,
    pub keep_going: bool,
    /// Next unit to load when stepping forward
    next_forward: usize,
    /// Exclusive end of the next backward step
    next_backward: usize,
    go_forward_next: bool,
}

impl CacheProcess {
    pub fn new(
        id: u64,
        target: TimeRange,
        target_units: (usize, usize),
        direction: LoadDirection,
        origin_unit: usize,
    ) -> Self {
        let origin = origin_unit.clamp(target_units.0, target_units.1);
        Self {
            id,
            target,
            target_units,
            direction,
            keep_going: true,
            next_forward: match direction {
                LoadDirection::Backward => target_units.1,
                LoadDirection::Forward => target_units.0,
                LoadDirection::Alternate => origin,
            },
            next_backward: match direction {
                LoadDirection::Forward => target_units.0,
                LoadDirection::Backward => target_units.1,
                LoadDirection::Alternate => origin,
            },
            go_forward_next: !matches!(direction, LoadDirection::Backward),
        }
    }

    pub fn cancel(&mut self) {
        self.keep_going = false;
    }

    pub fn is_complete(&self) -> bool {
        let forward_done = self.next_forward >= self.target_units.1;
        let backward_done = self.next_backward <= self.target_units.0;
        match self.direction {
            LoadDirection::Forward => forward_done,
            LoadDirection::Backward => backward_done,
            LoadDirection::Alternate => forward_done && backward_done,
        }
    }

    /// Plan the next chunk as `(start_unit, end_unit, forward)`, or None when
    /// there is nothing left to do.
    pub fn next_step(&self, chunk_units: usize) -> Option<(usize, usize, bool)> {
        if !self.keep_going || self.is_complete() || chunk_units == 0 {
            return None;
        }
        let forward_available = self.next_forward < self.target_units.1;
        let backward_available = self.next_backward > self.target_units.0;
        let forward = match self.direction {
            LoadDirection::Forward => true,
            LoadDirection::Backward => false,
            LoadDirection::Alternate => {
                if self.go_forward_next {
                    forward_available
                } else {
                    !backward_available
                }
            }
        };
        if forward {
            let start = self.next_forward;
            let end = (start + chunk_units).min(self.target_units.1);
            Some((start, end, true))
        } else {
            let end = self.next_backward;
            let start = end.saturating_sub(chunk_units).max(self.target_units.0);
            Some((start, end, false))
        }
    }

    /// Record a completed step. `reached` is the frontier unit actually
    /// covered after the insert, which may exceed the requested chunk when
    /// the store already held a neighboring part.
    pub fn record_step(&mut self, reached: usize, forward: bool) {
        if forward {
            self.next_forward = self.next_forward.max(reached.min(self.target_units.1));
        } else {
            self.next_backward = self.next_backward.min(reached.max(self.target_units.0));
        }
        if self.direction == LoadDirection::Alternate {
            self.go_forward_next = !forward;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(direction: LoadDirection, origin: usize) -> CacheProcess {
        CacheProcess::new(1, TimeRange::new(0.0, 10.0), (0, 10), direction, origin)
    }

    #[test]
    fn test_forward_steps_to_target() {
        let mut p = process(LoadDirection::Forward, 0);
        assert_eq!(p.next_step(4), Some((0, 4, true)));
        p.record_step(4, true);
        assert_eq!(p.next_step(4), Some((4, 8, true)));
        p.record_step(8, true);
        assert_eq!(p.next_step(4), Some((8, 10, true)));
        p.record_step(10, true);
        assert!(p.is_complete());
        assert_eq!(p.next_step(4), None);
    }

    #[test]
    fn test_backward_clamps_at_start() {
        let mut p = process(LoadDirection::Backward, 10);
        assert_eq!(p.next_step(6), Some((4, 10, false)));
        p.record_step(4, false);
        assert_eq!(p.next_step(6), Some((0, 4, false)));
        p.record_step(0, false);
        assert!(p.is_complete());
    }

    #[test]
    fn test_alternate_strictly_alternates() {
        let mut p = process(LoadDirection::Alternate, 5);
        assert_eq!(p.next_step(2), Some((5, 7, true)));
        p.record_step(7, true);
        assert_eq!(p.next_step(2), Some((3, 5, false)));
        p.record_step(3, false);
        assert_eq!(p.next_step(2), Some((7, 9, true)));
        p.record_step(9, true);
        assert_eq!(p.next_step(2), Some((1, 3, false)));
        p.record_step(1, false);
        assert_eq!(p.next_step(2), Some((9, 10, true)));
        p.record_step(10, true);
        // Forward side exhausted, keeps draining backward
        assert_eq!(p.next_step(2), Some((0, 1, false)));
        p.record_step(0, false);
        assert!(p.is_complete());
    }

    #[test]
    fn test_record_step_absorbs_neighboring_coverage() {
        let mut p = process(LoadDirection::Forward, 0);
        p.next_step(2);
        // Store already held [2, 6); the effective frontier jumps ahead
        p.record_step(6, true);
        assert_eq!(p.next_step(2), Some((6, 8, true)));
    }

    #[test]
    fn test_cancel_stops_stepping() {
        let mut p = process(LoadDirection::Forward, 0);
        p.cancel();
        assert_eq!(p.next_step(4), None);
    }
}
