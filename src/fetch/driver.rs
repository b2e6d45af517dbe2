use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};
use crossbeam_channel::Sender;
use log::{debug, error, warn};
use tokio::sync::oneshot;
use tokio::task::yield_now;

use crate::core::{
    AnnotationRegistry, CacheConfig, CacheUpdate, SignalCachePart, SignalDecoder, TimeRange,
};
use crate::gaps::Timeline;
use crate::store::{IntervalSet, SignalStore};

use super::{CacheProcess, DataSource, LoadDirection};

/// Outcome of one incremental load step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStep {
    /// Step landed; the effective next unit index, derived from post-insert
    /// coverage rather than the chunk just requested
    Next(usize),
    /// Target reached, process retired
    Done,
    /// Coverage reached the end of the recording, nothing further to load
    Exhausted,
    /// Process cancelled or store released mid-step; nothing was inserted
    Cancelled,
    /// Read or decode failure, logged and absorbed at this boundary
    Failed,
}

/// A pending range request waiting for coverage
struct DataWaiter {
    range: TimeRange,
    notify: oneshot::Sender<()>,
}

/// Incremental fetch/decode driver.
///
/// Reads byte ranges from the injected source, decodes them into sample
/// arrays, and inserts the results into the active store. Multiple cache
/// processes may be in flight for disjoint windows; steps interleave at
/// cooperative yield points.
pub struct FetchDriver {
    source: Arc<dyn DataSource>,
    decoder: Arc<dyn SignalDecoder>,
    /// Active store; None until setup, None again after release. Loops that
    /// observe None exit rather than retry.
    store: RwLock<Option<Arc<dyn SignalStore>>>,
    timeline: Arc<RwLock<Timeline>>,
    annotations: Arc<RwLock<AnnotationRegistry>>,
    processes: Mutex<Vec<CacheProcess>>,
    waiters: Mutex<Vec<DataWaiter>>,
    update_senders: Mutex<Vec<Sender<CacheUpdate>>>,
    config: CacheConfig,
    next_process_id: AtomicU64,
}

impl FetchDriver {
    pub fn new(
        source: Arc<dyn DataSource>,
        decoder: Arc<dyn SignalDecoder>,
        timeline: Arc<RwLock<Timeline>>,
        annotations: Arc<RwLock<AnnotationRegistry>>,
        config: CacheConfig,
    ) -> Self {
        Self {
            source,
            decoder,
            store: RwLock::new(None),
            timeline,
            annotations,
            processes: Mutex::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            update_senders: Mutex::new(Vec::new()),
            config,
            next_process_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Install the active store. Exactly one store per driver; a second call
    /// is a setup error.
    pub fn set_store(&self, store: Arc<dyn SignalStore>) -> Result<()> {
        let mut slot = self.store.write().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            bail!("cache store already set up");
        }
        *slot = Some(store);
        Ok(())
    }

    pub fn store(&self) -> Option<Arc<dyn SignalStore>> {
        self.store.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Release the active store and wake every pending waiter
    pub fn release_store(&self) {
        self.cancel_all();
        let store = self.store.write().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(store) = store {
            store.release();
        }
        // Dropping the senders resolves the receivers with an error; callers
        // treat that the same as a timeout and proceed best-effort
        self.waiters.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn subscribe_updates(&self) -> crossbeam_channel::Receiver<CacheUpdate> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.update_senders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        rx
    }

    pub fn has_active_processes(&self) -> bool {
        self.processes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|p| p.keep_going)
    }

    pub fn cancel_all(&self) {
        let mut processes = self.processes.lock().unwrap_or_else(|p| p.into_inner());
        for process in processes.iter_mut() {
            process.cancel();
        }
    }

    /// Register a waiter resolved once coverage contains `range` (cache time)
    pub fn add_waiter(&self, range: TimeRange) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(DataWaiter { range, notify: tx });
        rx
    }

    /// Create a cache process for `target` (cache time). `origin` seeds the
    /// alternate direction's middle point.
    pub fn create_process(
        &self,
        target: TimeRange,
        direction: LoadDirection,
        origin: f64,
    ) -> Option<u64> {
        let (target_units, origin_unit) = {
            let timeline = self.timeline.read().unwrap_or_else(|p| p.into_inner());
            let geometry = timeline.geometry();
            if !geometry.is_valid() {
                error!("cannot create cache process without data unit geometry");
                return None;
            }
            let duration = geometry.data_unit_duration;
            let start = (target.start / duration).floor().max(0.0) as usize;
            let end = ((target.end / duration).ceil() as usize).min(geometry.data_unit_count);
            ((start, end), (origin / duration).floor().max(0.0) as usize)
        };
        if target_units.0 >= target_units.1 {
            debug!("skipping empty cache process target {:?}", target);
            return None;
        }
        let id = self.next_process_id.fetch_add(1, Ordering::Relaxed);
        let process = CacheProcess::new(id, target, target_units, direction, origin_unit);
        self.processes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(process);
        Some(id)
    }

    fn remove_process(&self, id: u64) {
        self.processes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|p| p.id != id);
    }

    fn process_step(&self, id: u64) -> Option<(usize, usize, bool)> {
        self.processes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|p| p.id == id)
            .and_then(|p| p.next_step(self.config.chunk_units))
    }

    fn process_alive(&self, id: u64) -> bool {
        self.processes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|p| p.id == id && p.keep_going)
    }

    /// Targets of every in-flight process, for deduplicating new work
    fn process_targets(&self) -> IntervalSet {
        let mut targets = IntervalSet::new();
        for process in self
            .processes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
        {
            targets.insert(process.target);
        }
        targets
    }

    fn fulfil_waiters(&self, store: &Arc<dyn SignalStore>) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|p| p.into_inner());
        let mut remaining = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if store.is_covered(waiter.range) {
                let _ = waiter.notify.send(());
            } else {
                remaining.push(waiter);
            }
        }
        *waiters = remaining;
    }

    fn emit_update(&self, cache_range: TimeRange) {
        let (range, gaps) = {
            let timeline = self.timeline.read().unwrap_or_else(|p| p.into_inner());
            let start = timeline
                .cache_time_to_recording_time(cache_range.start)
                .unwrap_or(cache_range.start);
            let end = timeline
                .cache_time_to_recording_time(cache_range.end)
                .unwrap_or(cache_range.end);
            let full = TimeRange::new(0.0, timeline.geometry().total_recording_length);
            (TimeRange::new(start, end), timeline.data_gaps(full, false))
        };
        let annotations = self
            .annotations
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .in_range(range);
        let update = CacheUpdate {
            range,
            annotations,
            gaps,
        };
        let mut senders = self.update_senders.lock().unwrap_or_else(|p| p.into_inner());
        senders.retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// One incremental load step over `[start_unit, end_unit)`.
    ///
    /// Never propagates an error: read and decode failures are logged with
    /// their time range and reported as `Failed`, so a failing step cannot
    /// abort sibling concurrent processes.
    pub async fn read_and_cache_part(
        &self,
        start_unit: usize,
        end_unit: usize,
        forward: bool,
        process_id: Option<u64>,
    ) -> LoadStep {
        // Setup preconditions first, fail fast
        let (unit_duration, unit_size, unit_count, header_size, total_cache, prior_gap_secs) = {
            let timeline = self.timeline.read().unwrap_or_else(|p| p.into_inner());
            let geometry = timeline.geometry();
            if !geometry.is_valid() {
                error!("load step without data unit geometry");
                return LoadStep::Failed;
            }
            let prior = timeline
                .data_unit_index_to_time(start_unit)
                .map(|t| t - start_unit as f64 * geometry.data_unit_duration)
                .unwrap_or(0.0);
            (
                geometry.data_unit_duration,
                geometry.data_unit_size,
                geometry.data_unit_count,
                geometry.header_size,
                geometry.total_cache_length(),
                prior,
            )
        };
        let store = match self.store() {
            Some(store) => store,
            None => {
                error!("load step without an active cache store");
                return LoadStep::Failed;
            }
        };
        let end_unit = end_unit.min(unit_count);
        if end_unit <= start_unit {
            return LoadStep::Done;
        }

        let offset = header_size + (start_unit * unit_size) as u64;
        let length = (end_unit - start_unit) * unit_size;
        let bytes = match self.source.read_range(offset, length).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    "read of units [{}, {}) ({}s..{}s) failed: {}",
                    start_unit,
                    end_unit,
                    start_unit as f64 * unit_duration,
                    end_unit as f64 * unit_duration,
                    e
                );
                return LoadStep::Failed;
            }
        };

        let chunk = match self
            .decoder
            .decode(&bytes, offset, start_unit, end_unit - start_unit, prior_gap_secs)
            .await
        {
            Ok(chunk) => chunk,
            Err(e) => {
                error!(
                    "decode of units [{}, {}) ({}s..{}s) failed: {}",
                    start_unit,
                    end_unit,
                    start_unit as f64 * unit_duration,
                    end_unit as f64 * unit_duration,
                    e
                );
                return LoadStep::Failed;
            }
        };

        // The process may have been cancelled or the store released while the
        // read was in flight; abandon without writing into a torn-down cache
        if let Some(id) = process_id {
            if !self.process_alive(id) {
                debug!("abandoning step for cancelled process {}", id);
                return LoadStep::Cancelled;
            }
        }
        let store = match self.store() {
            Some(current) if Arc::ptr_eq(&current, &store) && !current.is_released() => current,
            _ => {
                debug!("store released mid-step, abandoning insert");
                return LoadStep::Cancelled;
            }
        };

        // Merge side-channel discoveries before the insert so update events
        // carry the revised gap list
        if !chunk.gaps.is_empty() {
            let added = self
                .timeline
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .add_gaps(&chunk.gaps);
            if added > 0 {
                debug!("registered {} new gaps", added);
            }
        }
        if !chunk.annotations.is_empty() {
            self.annotations
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .add(chunk.annotations.clone());
        }

        let part_start = start_unit as f64 * unit_duration;
        let part_end = end_unit as f64 * unit_duration;
        let has_data = chunk.signals.iter().any(|s| !s.data.is_empty());
        let covered = if has_data {
            let part = SignalCachePart {
                start: part_start,
                end: part_end,
                signals: chunk.signals,
            };
            if let Err(e) = store.insert_signals(&part) {
                error!(
                    "insert of [{}, {}) failed: {}",
                    part_start, part_end, e
                );
                return LoadStep::Failed;
            }
            // The store may already have held a neighboring part, so the
            // effective covered range comes from post-insert coverage, not
            // from the chunk just requested
            store
                .covered_interval_containing(part_start)
                .unwrap_or(TimeRange::new(part_start, part_end))
        } else {
            warn!(
                "decoder produced no samples for units [{}, {})",
                start_unit, end_unit
            );
            TimeRange::new(part_start, part_end)
        };

        self.fulfil_waiters(&store);
        self.emit_update(TimeRange::new(part_start, part_end));

        let epsilon = f32::EPSILON as f64;
        let reached = if forward {
            (((covered.end + epsilon) / unit_duration).floor() as usize).max(end_unit)
        } else {
            (((covered.start + epsilon) / unit_duration).floor() as usize).min(start_unit)
        };

        if let Some(id) = process_id {
            let mut processes = self.processes.lock().unwrap_or_else(|p| p.into_inner());
            let Some(process) = processes.iter_mut().find(|p| p.id == id) else {
                return LoadStep::Cancelled;
            };
            process.record_step(reached, forward);
            if process.is_complete() {
                processes.retain(|p| p.id != id);
                return LoadStep::Done;
            }
        }

        // Exhaustion: coverage hit the end of the recording going forward, or
        // the start going backward
        if forward && covered.end + epsilon >= total_cache
            && (store.output_range().end - covered.end).abs() <= epsilon
        {
            return LoadStep::Exhausted;
        }
        if !forward && covered.start <= epsilon {
            return LoadStep::Exhausted;
        }

        LoadStep::Next(reached)
    }

    /// Drive one process to completion, yielding between steps so sibling
    /// work can interleave.
    pub async fn run_process(&self, id: u64) -> LoadStep {
        let mut last = LoadStep::Done;
        loop {
            let Some((start, end, forward)) = self.process_step(id) else {
                self.remove_process(id);
                break;
            };
            last = self.read_and_cache_part(start, end, forward, Some(id)).await;
            match last {
                LoadStep::Next(_) => yield_now().await,
                LoadStep::Done => break,
                LoadStep::Exhausted | LoadStep::Cancelled | LoadStep::Failed => {
                    self.remove_process(id);
                    break;
                }
            }
        }
        last
    }

    /// Synchronously load a specific cache-time range, bypassing the process
    /// mechanism, so an individual range request can always make progress.
    pub async fn load_range_now(&self, range: TimeRange) -> bool {
        let (unit_duration, unit_count) = {
            let timeline = self.timeline.read().unwrap_or_else(|p| p.into_inner());
            let geometry = timeline.geometry();
            if !geometry.is_valid() {
                error!("direct load without data unit geometry");
                return false;
            }
            (geometry.data_unit_duration, geometry.data_unit_count)
        };
        let mut unit = (range.start / unit_duration).floor().max(0.0) as usize;
        let end = ((range.end / unit_duration).ceil() as usize).min(unit_count);
        while unit < end {
            let chunk_end = (unit + self.config.chunk_units).min(end);
            match self.read_and_cache_part(unit, chunk_end, true, None).await {
                LoadStep::Next(next) => unit = next.max(unit + 1),
                LoadStep::Done | LoadStep::Exhausted => break,
                LoadStep::Cancelled | LoadStep::Failed => return false,
            }
        }
        true
    }

    /// Total converted sample size of the recording in bytes
    fn converted_size_bytes(&self, store: &Arc<dyn SignalStore>) -> u64 {
        let total_cache = self
            .timeline
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .geometry()
            .total_cache_length();
        store
            .sampling_rates()
            .iter()
            .map(|rate| (rate * total_cache * 4.0).ceil() as u64)
            .sum()
    }

    /// Background fill entry point: full-file strategy when the converted
    /// recording fits the configured budget, windowed strategy otherwise.
    pub async fn cache_from(&self, start_from: f64) -> Result<()> {
        let store = match self.store() {
            Some(store) => store,
            None => bail!("cannot cache without an active store"),
        };
        let within_budget = match self.config.max_cache_bytes {
            Some(budget) => self.converted_size_bytes(&store) <= budget,
            None => true,
        };
        if within_budget {
            self.cache_whole_recording(&store, start_from).await
        } else {
            self.cache_window_around(&store, start_from).await
        }
    }

    /// Schedule processes for every uncovered sub-range of the recording and
    /// drive them to completion sequentially.
    async fn cache_whole_recording(
        &self,
        store: &Arc<dyn SignalStore>,
        start_from: f64,
    ) -> Result<()> {
        let total_cache = self
            .timeline
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .geometry()
            .total_cache_length();
        let full = TimeRange::new(0.0, total_cache);
        let targets = self.process_targets();
        let mut holes = Vec::new();
        for hole in store.uncovered_within(full) {
            holes.extend(targets.holes_within(hole));
        }
        // Ahead of the playhead first, in order; behind it afterwards,
        // nearest first
        holes.sort_by(|a, b| {
            let a_behind = a.end <= start_from;
            let b_behind = b.end <= start_from;
            a_behind
                .cmp(&b_behind)
                .then_with(|| {
                    if a_behind {
                        b.end.total_cmp(&a.end)
                    } else {
                        a.start.total_cmp(&b.start)
                    }
                })
        });
        for hole in holes {
            let direction = if hole.end <= start_from {
                LoadDirection::Backward
            } else {
                LoadDirection::Forward
            };
            if let Some(id) = self.create_process(hole, direction, start_from) {
                self.run_process(id).await;
            }
            if self.store().is_none() {
                debug!("store released, stopping background fill");
                break;
            }
        }
        Ok(())
    }

    /// Sliding-window strategy for recordings exceeding the cache budget:
    /// a preceding third, active third and following third around the
    /// playhead. Regions outside the window are evicted, missing regions
    /// loaded nearest-first.
    async fn cache_window_around(
        &self,
        store: &Arc<dyn SignalStore>,
        playhead: f64,
    ) -> Result<()> {
        let total_cache = self
            .timeline
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .geometry()
            .total_cache_length();
        let bytes_per_sec: f64 = store.sampling_rates().iter().map(|r| r * 4.0).sum();
        let budget = self
            .config
            .max_cache_bytes
            .unwrap_or(u64::MAX);
        if bytes_per_sec <= 0.0 {
            bail!("cannot size cache window without channel sampling rates");
        }
        let window_secs = (budget as f64 / bytes_per_sec).min(total_cache);
        let third = window_secs / 3.0;

        let mut start = (playhead - third).max(0.0);
        let mut end = start + window_secs;
        if end > total_cache {
            end = total_cache;
            start = (end - window_secs).max(0.0);
        }
        let window = TimeRange::new(start, end);

        store.trim_to(window)?;

        let targets = self.process_targets();
        let mut holes = Vec::new();
        for hole in store.uncovered_within(window) {
            holes.extend(targets.holes_within(hole));
        }
        // Active third first, then following, then preceding
        holes.sort_by(|a, b| {
            let distance = |h: &TimeRange| {
                if h.contains_time(playhead) {
                    0.0
                } else if h.start > playhead {
                    h.start - playhead
                } else {
                    2.0 * (playhead - h.end).abs()
                }
            };
            distance(a).total_cmp(&distance(b))
        });
        for hole in holes {
            let direction = if hole.contains_time(playhead) {
                LoadDirection::Alternate
            } else if hole.end <= playhead {
                LoadDirection::Backward
            } else {
                LoadDirection::Forward
            };
            if let Some(id) = self.create_process(hole, direction, playhead) {
                self.run_process(id).await;
            }
            if self.store().is_none() {
                break;
            }
        }
        Ok(())
    }
}
