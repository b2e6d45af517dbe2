use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use log::{debug, error, warn};
use memmap2::MmapMut;

use crate::core::{CacheSignal, SignalCachePart, TimeRange};

use super::{IntervalSet, SignalStore};

const MAGIC: &[u8; 8] = b"SIGCACHE";
const VERSION: u64 = 1;
const HEADER_SIZE: usize = 4096;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_CHANNEL_COUNT: usize = 16;
const OFF_CAPACITY_SECS: usize = 24;
const OFF_WINDOW_START: usize = 32;
const OFF_LOCK: usize = 40;
const CHANNEL_TABLE: usize = 64;
const CHANNEL_ENTRY: usize = 32;

const OFF_CH_RATE: usize = 0;
const OFF_CH_RANGE_START: usize = 8;
const OFF_CH_RANGE_END: usize = 16;
const OFF_CH_CAPACITY: usize = 24;

/// Lock waits are bounded; expiry is a hard error rather than leaving the
/// buffer state ambiguous.
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_micros(100);

/// Properties a consumer needs to attach to the shared region
#[derive(Debug, Clone)]
pub struct SharedCacheInfo {
    pub path: PathBuf,
    pub channel_count: usize,
    pub capacity_secs: f64,
    pub total_bytes: usize,
}

struct SharedChannel {
    sampling_rate: f64,
    sample_capacity: usize,
    data_offset: usize,
}

/// Shared-memory signal store backed by a memory-mapped region.
///
/// One producer (the fetch driver, typically in a worker) writes sample data
/// under a lock word; coverage metadata lives in atomic header fields so a
/// consumer can read the bounds without waiting on an in-flight insert.
pub struct SharedCache {
    _mmap: MmapMut,
    ptr: *mut u8,
    len: usize,
    channels: Vec<SharedChannel>,
    capacity_secs: f64,
    /// Producer-local per-channel merged coverage; the shared header only
    /// carries per-channel bounds
    covered: RwLock<Vec<IntervalSet>>,
    released: AtomicBool,
}

// All shared state behind the raw pointer is guarded by the lock word or
// accessed through atomics.
unsafe impl Send for SharedCache {}
unsafe impl Sync for SharedCache {}

struct LockGuard<'a> {
    word: &'a AtomicU64,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

impl SharedCache {
    /// Create a new shared region sized for `sampling_rates` over
    /// `capacity_secs` of cache time.
    pub fn create(
        path: impl AsRef<Path>,
        sampling_rates: &[f64],
        capacity_secs: f64,
    ) -> Result<Self> {
        if sampling_rates.is_empty() {
            bail!("shared cache needs at least one channel");
        }
        if capacity_secs <= 0.0 {
            bail!("invalid shared cache capacity {}", capacity_secs);
        }

        let mut channels = Vec::with_capacity(sampling_rates.len());
        let mut data_offset = HEADER_SIZE;
        for &rate in sampling_rates {
            let sample_capacity = (rate * capacity_secs).ceil() as usize;
            channels.push(SharedChannel {
                sampling_rate: rate,
                sample_capacity,
                data_offset,
            });
            data_offset += sample_capacity * 4;
        }
        let total_size = data_offset;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(total_size as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        mmap[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(MAGIC);
        mmap[OFF_VERSION..OFF_VERSION + 8].copy_from_slice(&VERSION.to_le_bytes());
        mmap[OFF_CHANNEL_COUNT..OFF_CHANNEL_COUNT + 8]
            .copy_from_slice(&(sampling_rates.len() as u64).to_le_bytes());
        mmap[OFF_CAPACITY_SECS..OFF_CAPACITY_SECS + 8]
            .copy_from_slice(&capacity_secs.to_bits().to_le_bytes());
        mmap[OFF_WINDOW_START..OFF_WINDOW_START + 8]
            .copy_from_slice(&0.0_f64.to_bits().to_le_bytes());
        mmap[OFF_LOCK..OFF_LOCK + 8].copy_from_slice(&0u64.to_le_bytes());

        for (index, channel) in channels.iter().enumerate() {
            let base = CHANNEL_TABLE + index * CHANNEL_ENTRY;
            mmap[base + OFF_CH_RATE..base + OFF_CH_RATE + 8]
                .copy_from_slice(&channel.sampling_rate.to_bits().to_le_bytes());
            mmap[base + OFF_CH_RANGE_START..base + OFF_CH_RANGE_START + 8]
                .copy_from_slice(&f64::MAX.to_bits().to_le_bytes());
            mmap[base + OFF_CH_RANGE_END..base + OFF_CH_RANGE_END + 8]
                .copy_from_slice(&f64::MIN.to_bits().to_le_bytes());
            mmap[base + OFF_CH_CAPACITY..base + OFF_CH_CAPACITY + 8]
                .copy_from_slice(&(channel.sample_capacity as u64).to_le_bytes());
        }

        let ptr = mmap.as_mut_ptr();
        let covered = vec![IntervalSet::new(); channels.len()];
        Ok(Self {
            _mmap: mmap,
            ptr,
            len: total_size,
            channels,
            capacity_secs,
            covered: RwLock::new(covered),
            released: AtomicBool::new(false),
        })
    }

    /// Attach to an existing shared region (the consumer side)
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() < HEADER_SIZE {
            bail!("shared cache region too small");
        }
        if &mmap[OFF_MAGIC..OFF_MAGIC + 8] != MAGIC {
            bail!("not a shared signal cache region");
        }
        let version = u64::from_le_bytes(mmap[OFF_VERSION..OFF_VERSION + 8].try_into()?);
        if version != VERSION {
            bail!("unsupported shared cache version {}", version);
        }
        let channel_count =
            u64::from_le_bytes(mmap[OFF_CHANNEL_COUNT..OFF_CHANNEL_COUNT + 8].try_into()?) as usize;
        let capacity_secs = f64::from_bits(u64::from_le_bytes(
            mmap[OFF_CAPACITY_SECS..OFF_CAPACITY_SECS + 8].try_into()?,
        ));

        let mut channels = Vec::with_capacity(channel_count);
        let mut data_offset = HEADER_SIZE;
        for index in 0..channel_count {
            let base = CHANNEL_TABLE + index * CHANNEL_ENTRY;
            let rate = f64::from_bits(u64::from_le_bytes(
                mmap[base + OFF_CH_RATE..base + OFF_CH_RATE + 8].try_into()?,
            ));
            let sample_capacity = u64::from_le_bytes(
                mmap[base + OFF_CH_CAPACITY..base + OFF_CH_CAPACITY + 8].try_into()?,
            ) as usize;
            channels.push(SharedChannel {
                sampling_rate: rate,
                sample_capacity,
                data_offset,
            });
            data_offset += sample_capacity * 4;
        }
        if data_offset > mmap.len() {
            bail!(
                "channel table describes {} bytes but region holds {}",
                data_offset,
                mmap.len()
            );
        }

        let ptr = mmap.as_mut_ptr();
        let covered = vec![IntervalSet::new(); channels.len()];
        Ok(Self {
            _mmap: mmap,
            ptr,
            len: data_offset,
            channels,
            capacity_secs,
            covered: RwLock::new(covered),
            released: AtomicBool::new(false),
        })
    }

    pub fn info(&self, path: impl Into<PathBuf>) -> SharedCacheInfo {
        SharedCacheInfo {
            path: path.into(),
            channel_count: self.channels.len(),
            capacity_secs: self.capacity_secs,
            total_bytes: self.len,
        }
    }

    fn atom(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset + 8 <= self.len && offset % 8 == 0);
        unsafe { &*(self.ptr.add(offset) as *const AtomicU64) }
    }

    fn channel_base(index: usize) -> usize {
        CHANNEL_TABLE + index * CHANNEL_ENTRY
    }

    fn load_f64(&self, offset: usize) -> f64 {
        f64::from_bits(self.atom(offset).load(Ordering::Acquire))
    }

    fn store_f64(&self, offset: usize, value: f64) {
        self.atom(offset).store(value.to_bits(), Ordering::Release);
    }

    fn window_start(&self) -> f64 {
        self.load_f64(OFF_WINDOW_START)
    }

    fn channel_range(&self, index: usize) -> Option<TimeRange> {
        let base = Self::channel_base(index);
        let start = self.load_f64(base + OFF_CH_RANGE_START);
        let end = self.load_f64(base + OFF_CH_RANGE_END);
        if start > end {
            None
        } else {
            Some(TimeRange::new(start, end))
        }
    }

    /// Bounded lock-word acquisition; times out hard after 5 seconds instead
    /// of hanging on a stalled peer.
    fn acquire_lock(&self) -> Result<LockGuard<'_>> {
        let word = self.atom(OFF_LOCK);
        let deadline = Instant::now() + LOCK_WAIT_TIMEOUT;
        loop {
            if word
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(LockGuard { word });
            }
            if Instant::now() >= deadline {
                error!(
                    "shared cache lock wait exceeded {} ms",
                    LOCK_WAIT_TIMEOUT.as_millis()
                );
                bail!("shared cache lock wait timed out");
            }
            std::thread::sleep(LOCK_RETRY);
        }
    }

    fn channel_samples(&self, index: usize, start: usize, count: usize) -> Result<Vec<f32>> {
        let channel = &self.channels[index];
        if start + count > channel.sample_capacity {
            bail!(
                "read of samples [{}, {}) exceeds channel capacity {}",
                start,
                start + count,
                channel.sample_capacity
            );
        }
        let slice = unsafe {
            std::slice::from_raw_parts(
                self.ptr.add(channel.data_offset + start * 4) as *const f32,
                count,
            )
        };
        Ok(slice.to_vec())
    }
}

impl SignalStore for SharedCache {
    fn output_range(&self) -> TimeRange {
        if self.released.load(Ordering::Acquire) {
            return TimeRange::new(0.0, 0.0);
        }
        let mut start = f64::MAX;
        let mut end = f64::MIN;
        for index in 0..self.channels.len() {
            if let Some(range) = self.channel_range(index) {
                start = start.min(range.start);
                end = end.max(range.end);
            }
        }
        if start > end {
            TimeRange::new(0.0, 0.0)
        } else {
            TimeRange::new(start, end)
        }
    }

    fn signal_ranges(&self) -> Vec<TimeRange> {
        (0..self.channels.len())
            .map(|i| self.channel_range(i).unwrap_or(TimeRange::new(0.0, 0.0)))
            .collect()
    }

    fn sampling_rates(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.sampling_rate).collect()
    }

    fn common_coverage(&self) -> Option<TimeRange> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        let mut result: Option<TimeRange> = None;
        for index in 0..self.channels.len() {
            if self.channels[index].sampling_rate <= 0.0 {
                continue;
            }
            let range = self.channel_range(index)?;
            result = Some(match result {
                Some(acc) => TimeRange::new(acc.start.max(range.start), acc.end.min(range.end)),
                None => range,
            });
        }
        result.filter(|r| !r.is_empty())
    }

    fn is_covered(&self, range: TimeRange) -> bool {
        if self.released.load(Ordering::Acquire) || range.is_empty() {
            return false;
        }
        let covered = self.covered.read().unwrap_or_else(|p| p.into_inner());
        if covered.iter().any(|set| !set.is_empty()) {
            // Channels fill at different granularities; a range only counts
            // once every channel holds it
            return self
                .channels
                .iter()
                .zip(covered.iter())
                .filter(|(channel, _)| channel.sampling_rate > 0.0)
                .all(|(_, set)| set.covers(range));
        }
        // Attached consumer side: only the shared bounds are visible
        self.common_coverage()
            .map(|c| c.contains(&range))
            .unwrap_or(false)
    }

    fn covered_interval_containing(&self, t: f64) -> Option<TimeRange> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        let covered = self.covered.read().unwrap_or_else(|p| p.into_inner());
        if covered.iter().any(|set| !set.is_empty()) {
            let mut result: Option<TimeRange> = None;
            for (channel, set) in self.channels.iter().zip(covered.iter()) {
                if channel.sampling_rate <= 0.0 {
                    continue;
                }
                let span = set.containing(t)?;
                result = Some(match result {
                    Some(acc) => acc.intersect(&span)?,
                    None => span,
                });
            }
            return result;
        }
        self.common_coverage().filter(|c| c.contains_time(t) || c.end == t)
    }

    fn uncovered_within(&self, range: TimeRange) -> Vec<TimeRange> {
        if self.released.load(Ordering::Acquire) {
            return vec![range];
        }
        let covered = self.covered.read().unwrap_or_else(|p| p.into_inner());
        if covered.iter().any(|set| !set.is_empty()) {
            let mut common: Option<IntervalSet> = None;
            for (channel, set) in self.channels.iter().zip(covered.iter()) {
                if channel.sampling_rate <= 0.0 {
                    continue;
                }
                common = Some(match common {
                    None => set.clone(),
                    Some(acc) => {
                        let mut intersected = IntervalSet::new();
                        for span in set.spans() {
                            for other in acc.spans() {
                                if let Some(overlap) = span.intersect(other) {
                                    intersected.insert(overlap);
                                }
                            }
                        }
                        intersected
                    }
                });
            }
            return match common {
                Some(common) => common.holes_within(range),
                None => vec![range],
            };
        }
        match self.common_coverage() {
            Some(bounds) => {
                let mut set = IntervalSet::new();
                set.insert(bounds);
                set.holes_within(range)
            }
            None => vec![range],
        }
    }

    fn insert_signals(&self, part: &SignalCachePart) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            bail!("insert into released shared cache");
        }
        if part.end < part.start {
            bail!("inverted cache part [{}, {}]", part.start, part.end);
        }
        if part.signals.len() != self.channels.len() {
            bail!(
                "cache part has {} channels, shared region holds {}",
                part.signals.len(),
                self.channels.len()
            );
        }
        let window_start = self.window_start();
        let window_end = window_start + self.capacity_secs;
        if part.start < window_start - 1e-9 || part.end > window_end + 1e-9 {
            bail!(
                "cache part [{}, {}] outside shared window [{}, {}]",
                part.start,
                part.end,
                window_start,
                window_end
            );
        }

        let _guard = self.acquire_lock()?;
        let mut covered = self.covered.write().unwrap_or_else(|p| p.into_inner());
        for (index, (channel, signal)) in self.channels.iter().zip(&part.signals).enumerate() {
            if channel.sampling_rate <= 0.0 || signal.data.is_empty() {
                continue;
            }
            let rate = channel.sampling_rate;
            let start = (((part.start - window_start) * rate).round().max(0.0)) as usize;
            let count = signal.data.len();
            if start + count > channel.sample_capacity {
                bail!(
                    "insert of {} samples at {} exceeds channel capacity {}",
                    count,
                    start,
                    channel.sample_capacity
                );
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    signal.data.as_ptr(),
                    self.ptr.add(channel.data_offset + start * 4) as *mut f32,
                    count,
                );
            }
            let base = Self::channel_base(index);
            let covered_end = part.start + count as f64 / rate;
            let new_start = self.load_f64(base + OFF_CH_RANGE_START).min(part.start);
            let new_end = self.load_f64(base + OFF_CH_RANGE_END).max(covered_end);
            self.store_f64(base + OFF_CH_RANGE_START, new_start);
            self.store_f64(base + OFF_CH_RANGE_END, new_end);
            covered[index].insert(TimeRange::new(part.start, covered_end));
        }
        Ok(())
    }

    fn as_cache_part(&self) -> Result<SignalCachePart> {
        if self.released.load(Ordering::Acquire) {
            bail!("shared cache already released");
        }
        let _guard = self.acquire_lock()?;
        let coverage = match self.common_coverage() {
            Some(coverage) => coverage,
            None => return Ok(SignalCachePart::new(0.0, 0.0)),
        };
        let window_start = self.window_start();
        let mut part = SignalCachePart::new(coverage.start, coverage.end);
        for index in 0..self.channels.len() {
            let rate = self.channels[index].sampling_rate;
            let mut signal = CacheSignal::new(rate);
            if rate > 0.0 {
                let start = (((coverage.start - window_start) * rate).round().max(0.0)) as usize;
                let count = (coverage.duration() * rate).round() as usize;
                signal.data = self
                    .channel_samples(index, start, count)
                    .map_err(|e| anyhow!("shared cache read failed: {}", e))?;
            }
            part.signals.push(signal);
        }
        Ok(part)
    }

    fn trim_to(&self, range: TimeRange) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            bail!("trim of released shared cache");
        }
        if range.is_empty() {
            bail!("empty trim range [{}, {}]", range.start, range.end);
        }
        let _guard = self.acquire_lock()?;
        let old_start = self.window_start();
        let new_start = range.start.max(old_start);
        for (index, channel) in self.channels.iter().enumerate() {
            if channel.sampling_rate <= 0.0 {
                continue;
            }
            let drop = (((new_start - old_start) * channel.sampling_rate).round().max(0.0)) as usize;
            if drop > 0 && drop < channel.sample_capacity {
                let keep = channel.sample_capacity - drop;
                unsafe {
                    std::ptr::copy(
                        self.ptr.add(channel.data_offset + drop * 4) as *const f32,
                        self.ptr.add(channel.data_offset) as *mut f32,
                        keep,
                    );
                }
            }
            let base = Self::channel_base(index);
            match self.channel_range(index).and_then(|r| r.intersect(&range)) {
                Some(clipped) => {
                    self.store_f64(base + OFF_CH_RANGE_START, clipped.start);
                    self.store_f64(base + OFF_CH_RANGE_END, clipped.end);
                }
                None => {
                    self.store_f64(base + OFF_CH_RANGE_START, f64::MAX);
                    self.store_f64(base + OFF_CH_RANGE_END, f64::MIN);
                }
            }
        }
        self.store_f64(OFF_WINDOW_START, new_start);
        for set in self
            .covered
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .iter_mut()
        {
            set.clip_to(range);
        }
        debug!("trimmed shared window to [{}, {}]", range.start, range.end);
        Ok(())
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.acquire_lock() {
            Ok(_guard) => {
                for index in 0..self.channels.len() {
                    let base = Self::channel_base(index);
                    self.store_f64(base + OFF_CH_RANGE_START, f64::MAX);
                    self.store_f64(base + OFF_CH_RANGE_END, f64::MIN);
                }
            }
            Err(e) => warn!("releasing shared cache without lock: {}", e),
        }
        for set in self
            .covered
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .iter_mut()
        {
            set.clear();
        }
        if let Err(e) = self._mmap.flush() {
            warn!("shared cache flush on release failed: {}", e);
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
