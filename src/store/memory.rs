use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};

use crate::core::{CacheSignal, SignalCachePart, TimeRange};

use super::{IntervalSet, SignalStore};

struct ChannelBuffer {
    sampling_rate: f64,
    data: Vec<f32>,
    covered: IntervalSet,
}

struct MemoryInner {
    /// Cache time of sample index 0 in every channel buffer
    window_start: f64,
    channels: Vec<ChannelBuffer>,
    released: bool,
}

/// Plain in-process signal store for a bounded duration window.
///
/// Channel buffers are anchored at a shared window start; interior holes are
/// zero until filled, with the covered-interval sets tracking what is real.
pub struct MemoryCache {
    inner: RwLock<MemoryInner>,
    capacity_secs: f64,
}

impl MemoryCache {
    pub fn new(sampling_rates: &[f64], capacity_secs: f64) -> Self {
        let channels = sampling_rates
            .iter()
            .map(|&rate| ChannelBuffer {
                sampling_rate: rate,
                data: Vec::new(),
                covered: IntervalSet::new(),
            })
            .collect();
        Self {
            inner: RwLock::new(MemoryInner {
                window_start: 0.0,
                channels,
                released: false,
            }),
            capacity_secs,
        }
    }

    pub fn capacity_secs(&self) -> f64 {
        self.capacity_secs
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sample_index(t: f64, anchor: f64, rate: f64) -> usize {
    (((t - anchor) * rate).round().max(0.0)) as usize
}

impl MemoryInner {
    fn common_coverage(&self) -> Option<TimeRange> {
        let mut result: Option<TimeRange> = None;
        for channel in &self.channels {
            if channel.sampling_rate <= 0.0 {
                continue;
            }
            let bounds = channel.covered.bounds()?;
            result = Some(match result {
                Some(acc) => TimeRange::new(acc.start.max(bounds.start), acc.end.min(bounds.end)),
                None => bounds,
            });
        }
        result.filter(|r| !r.is_empty())
    }
}

impl SignalStore for MemoryCache {
    fn output_range(&self) -> TimeRange {
        let inner = self.read();
        if inner.released {
            return TimeRange::new(0.0, 0.0);
        }
        let mut start = f64::MAX;
        let mut end = f64::MIN;
        for channel in &inner.channels {
            if let Some(bounds) = channel.covered.bounds() {
                start = start.min(bounds.start);
                end = end.max(bounds.end);
            }
        }
        if start > end {
            TimeRange::new(0.0, 0.0)
        } else {
            TimeRange::new(start, end)
        }
    }

    fn signal_ranges(&self) -> Vec<TimeRange> {
        self.read()
            .channels
            .iter()
            .map(|c| c.covered.bounds().unwrap_or(TimeRange::new(0.0, 0.0)))
            .collect()
    }

    fn sampling_rates(&self) -> Vec<f64> {
        self.read().channels.iter().map(|c| c.sampling_rate).collect()
    }

    fn common_coverage(&self) -> Option<TimeRange> {
        let inner = self.read();
        if inner.released {
            return None;
        }
        inner.common_coverage()
    }

    fn is_covered(&self, range: TimeRange) -> bool {
        let inner = self.read();
        if inner.released || range.is_empty() {
            return false;
        }
        inner
            .channels
            .iter()
            .filter(|c| c.sampling_rate > 0.0)
            .all(|c| c.covered.covers(range))
    }

    fn covered_interval_containing(&self, t: f64) -> Option<TimeRange> {
        let inner = self.read();
        if inner.released {
            return None;
        }
        let mut result: Option<TimeRange> = None;
        for channel in &inner.channels {
            if channel.sampling_rate <= 0.0 {
                continue;
            }
            let span = channel.covered.containing(t)?;
            result = Some(match result {
                Some(acc) => acc.intersect(&span)?,
                None => span,
            });
        }
        result
    }

    fn uncovered_within(&self, range: TimeRange) -> Vec<TimeRange> {
        let inner = self.read();
        if inner.released {
            return vec![range];
        }
        // Holes are computed against the intersection of channel coverage:
        // a range is only usable once every channel holds it
        let mut common = IntervalSet::new();
        let mut first = true;
        for channel in inner.channels.iter().filter(|c| c.sampling_rate > 0.0) {
            if first {
                common = channel.covered.clone();
                first = false;
                continue;
            }
            let mut intersected = IntervalSet::new();
            for span in channel.covered.spans() {
                for other in common.spans() {
                    if let Some(overlap) = span.intersect(other) {
                        intersected.insert(overlap);
                    }
                }
            }
            common = intersected;
        }
        common.holes_within(range)
    }

    fn insert_signals(&self, part: &SignalCachePart) -> Result<()> {
        let mut inner = self.write();
        if inner.released {
            bail!("insert into released cache");
        }
        if part.end < part.start {
            bail!("inverted cache part [{}, {}]", part.start, part.end);
        }
        if part.signals.len() != inner.channels.len() {
            bail!(
                "cache part has {} channels, store configured for {}",
                part.signals.len(),
                inner.channels.len()
            );
        }
        let window_start = inner.window_start;
        let window_end = window_start + self.capacity_secs;
        if part.start < window_start - 1e-9 || part.end > window_end + 1e-9 {
            bail!(
                "cache part [{}, {}] outside cache window [{}, {}]",
                part.start,
                part.end,
                window_start,
                window_end
            );
        }

        for (channel, signal) in inner.channels.iter_mut().zip(&part.signals) {
            if signal.sampling_rate <= 0.0 || signal.data.is_empty() {
                continue;
            }
            if channel.sampling_rate <= 0.0 {
                channel.sampling_rate = signal.sampling_rate;
            } else if (channel.sampling_rate - signal.sampling_rate).abs() > f64::EPSILON {
                warn!(
                    "sampling rate changed from {} to {}; keeping original",
                    channel.sampling_rate, signal.sampling_rate
                );
            }
            let rate = channel.sampling_rate;
            let index = sample_index(part.start, window_start, rate);
            let needed = index + signal.data.len();
            if channel.data.len() < needed {
                channel.data.resize(needed, 0.0);
            }
            channel.data[index..needed].copy_from_slice(&signal.data);
            let covered_end = part.start + signal.data.len() as f64 / rate;
            channel.covered.insert(TimeRange::new(part.start, covered_end));
        }
        Ok(())
    }

    fn as_cache_part(&self) -> Result<SignalCachePart> {
        let inner = self.read();
        if inner.released {
            bail!("cache already released");
        }
        let coverage = match inner.common_coverage() {
            Some(coverage) => coverage,
            None => return Ok(SignalCachePart::new(0.0, 0.0)),
        };
        let mut part = SignalCachePart::new(coverage.start, coverage.end);
        for channel in &inner.channels {
            let mut signal = CacheSignal::new(channel.sampling_rate);
            if channel.sampling_rate > 0.0 {
                let start = sample_index(coverage.start, inner.window_start, channel.sampling_rate);
                let count = (coverage.duration() * channel.sampling_rate).round() as usize;
                let end = (start + count).min(channel.data.len());
                signal.data = channel.data.get(start..end).map(|s| s.to_vec()).ok_or_else(
                    || anyhow!("coverage [{:?}] exceeds channel buffer", coverage),
                )?;
            }
            part.signals.push(signal);
        }
        Ok(part)
    }

    fn trim_to(&self, range: TimeRange) -> Result<()> {
        let mut inner = self.write();
        if inner.released {
            bail!("trim of released cache");
        }
        if range.is_empty() {
            bail!("empty trim range [{}, {}]", range.start, range.end);
        }
        let old_start = inner.window_start;
        let new_start = range.start.max(old_start);
        for channel in &mut inner.channels {
            if channel.sampling_rate <= 0.0 {
                continue;
            }
            let drop = sample_index(new_start, old_start, channel.sampling_rate);
            if drop > 0 {
                channel.data.drain(..drop.min(channel.data.len()));
            }
            let keep = (((range.end - new_start) * channel.sampling_rate).round()).max(0.0) as usize;
            channel.data.truncate(keep);
            channel.covered.clip_to(range);
        }
        inner.window_start = new_start;
        debug!("trimmed cache window to [{}, {}]", range.start, range.end);
        Ok(())
    }

    fn release(&self) {
        let mut inner = self.write();
        if inner.released {
            return;
        }
        for channel in &mut inner.channels {
            channel.data = Vec::new();
            channel.covered.clear();
        }
        inner.released = true;
    }

    fn is_released(&self) -> bool {
        self.read().released
    }
}
