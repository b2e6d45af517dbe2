use log::{debug, error};

use crate::core::{Gap, RecordingGeometry, TimeRange};

use super::GapMap;

/// Float correction applied before flooring a time into a unit index.
///
/// Recording times are often persisted at f32 precision; without the
/// correction an exact unit-boundary time can floor into the previous unit.
const TIME_EPSILON: f64 = f32::EPSILON as f64;

/// Translates between recording time (wall clock, gaps included) and cache
/// time (contiguous gap-removed sample stream) for one recording.
#[derive(Debug)]
pub struct Timeline {
    geometry: RecordingGeometry,
    gaps: GapMap,
    discontinuous: bool,
}

impl Timeline {
    pub fn new(geometry: RecordingGeometry, discontinuous: bool) -> Self {
        Self {
            geometry,
            gaps: GapMap::new(),
            discontinuous,
        }
    }

    pub fn geometry(&self) -> &RecordingGeometry {
        &self.geometry
    }

    pub fn is_discontinuous(&self) -> bool {
        self.discontinuous
    }

    /// Merge newly discovered gaps; marks the recording discontinuous once
    /// any gap is registered.
    pub fn add_gaps(&mut self, gaps: &[Gap]) -> usize {
        let added = self.gaps.merge(gaps);
        if !self.gaps.is_empty() {
            self.discontinuous = true;
        }
        added
    }

    pub fn total_gap_duration(&self) -> f64 {
        self.gaps.total_duration()
    }

    /// Convert a cache-time position to recording time.
    ///
    /// Identity for continuous recordings and for t == 0; otherwise re-adds
    /// every gap preceding the sample at `t`, resolved through the data-unit
    /// index so mid-unit times stay on the same unit as their unit start.
    pub fn cache_time_to_recording_time(&self, t: f64) -> Option<f64> {
        let total = self.geometry.total_cache_length();
        if t < 0.0 || t > total {
            error!("cache time {} outside valid extent [0, {}]", t, total);
            return None;
        }
        if !self.discontinuous || t == 0.0 {
            return Some(t);
        }
        let unit = ((t + TIME_EPSILON) / self.geometry.data_unit_duration).floor();
        let unit_start = unit * self.geometry.data_unit_duration;
        Some(t + self.gaps.total_at_or_before(unit_start))
    }

    /// Convert a recording-time position to cache time by removing the total
    /// gap duration between the recording start and `t`.
    pub fn recording_time_to_cache_time(&self, t: f64) -> Option<f64> {
        let total = self.geometry.total_recording_length;
        if t < 0.0 || t > total {
            error!("recording time {} outside valid extent [0, {}]", t, total);
            return None;
        }
        if !self.discontinuous || t == 0.0 {
            return Some(t);
        }
        Some(t - self.gap_time_between(0.0, t))
    }

    /// Data-unit index containing recording time `t`
    pub fn time_to_data_unit_index(&self, t: f64) -> Option<usize> {
        if t < 0.0 || t > self.geometry.total_recording_length {
            error!(
                "recording time {} outside valid extent [0, {}]",
                t, self.geometry.total_recording_length
            );
            return None;
        }
        let prior = self.gap_time_between(0.0, t);
        let index = ((t + TIME_EPSILON - prior) / self.geometry.data_unit_duration).floor();
        Some((index as usize).min(self.geometry.data_unit_count.saturating_sub(1)))
    }

    /// Recording time at which data unit `index` starts
    pub fn data_unit_index_to_time(&self, index: usize) -> Option<f64> {
        if index > self.geometry.data_unit_count {
            error!(
                "data unit index {} outside valid extent [0, {}]",
                index, self.geometry.data_unit_count
            );
            return None;
        }
        let unit_start = index as f64 * self.geometry.data_unit_duration;
        Some(unit_start + self.gaps.total_at_or_before(unit_start))
    }

    /// Total gap time inside the recording-time window `[start, end)`
    pub fn gap_time_between(&self, start: f64, end: f64) -> f64 {
        if !self.discontinuous {
            return 0.0;
        }
        self.data_gaps(TimeRange::new(start, end), false)
            .iter()
            .map(|g| g.duration)
            .sum()
    }

    /// Gaps overlapping `[range.start, range.end)`, clipped to the window.
    ///
    /// With `use_cache_time` the reported starts are the stored cache-time
    /// positions; otherwise the running prior-gap total converts them into
    /// recording time. A gap abutting the window start is excluded.
    pub fn data_gaps(&self, range: TimeRange, use_cache_time: bool) -> Vec<Gap> {
        let mut result = Vec::new();
        if range.start > range.end {
            error!(
                "invalid gap query range [{}, {}]",
                range.start, range.end
            );
            return result;
        }
        if range.start == range.end {
            // Legitimately happens during discontinuous-file setup
            debug!("empty gap query range at {}", range.start);
            return result;
        }

        let mut prior = 0.0;
        for &(position, duration) in self.gaps.entries() {
            if use_cache_time {
                // Cache-time gaps are points in the contiguous stream
                if position >= range.end {
                    break;
                }
                if position >= range.start {
                    result.push(Gap::new(position, duration));
                }
                continue;
            }

            let gap_start = position + prior;
            prior += duration;
            let gap_end = gap_start + duration;
            if gap_end <= range.start {
                continue;
            }
            if gap_start >= range.end {
                // Sorted map, nothing further can overlap
                break;
            }
            let clipped_start = gap_start.max(range.start);
            let clipped_end = gap_end.min(range.end);
            result.push(Gap::new(clipped_start, clipped_end - clipped_start));
            if gap_end > range.end {
                break;
            }
        }
        result
    }
}
