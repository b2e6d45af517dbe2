pub mod state;

pub use state::ProcessorState;

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Result};
use crossbeam_channel::Receiver;
use log::{debug, error, warn};
use tokio::task::JoinHandle;

use crate::core::{
    Annotation, AnnotationRegistry, CacheConfig, CacheSignal, CacheUpdate, ChannelFilter, Gap,
    RecordingGeometry, SignalCachePart, SignalDecoder, TimeRange,
};
use crate::fetch::{DataSource, FetchDriver};
use crate::gaps::Timeline;
use crate::store::{MemoryCache, SharedCache, SharedCacheInfo, SignalStore};

/// Range-request coordinator over one biosignal recording.
///
/// Owns the timeline, the registries and whichever store variant was selected
/// at setup; serves `get_signals` by checking coverage, triggering the fetch
/// driver when needed, and blocking with a bounded wait until the requested
/// sub-range becomes available.
pub struct SignalProcessor {
    config: CacheConfig,
    timeline: Option<Arc<RwLock<Timeline>>>,
    annotations: Option<Arc<RwLock<AnnotationRegistry>>>,
    sampling_rates: Vec<f64>,
    driver: Option<Arc<FetchDriver>>,
    state: Arc<Mutex<ProcessorState>>,
    cache_task: Option<JoinHandle<Result<()>>>,
    shared_info: Option<SharedCacheInfo>,
}

impl SignalProcessor {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            timeline: None,
            annotations: None,
            sampling_rates: Vec::new(),
            driver: None,
            state: Arc::new(Mutex::new(ProcessorState::Idle)),
            cache_task: None,
            shared_info: None,
        }
    }

    /// Record the recording constants and wire up the fetch driver. Called
    /// once; geometry is immutable afterward.
    pub fn setup(
        &mut self,
        geometry: RecordingGeometry,
        discontinuous: bool,
        sampling_rates: Vec<f64>,
        decoder: Arc<dyn SignalDecoder>,
        source: Arc<dyn DataSource>,
    ) -> Result<()> {
        if self.driver.is_some() {
            bail!("processor already set up");
        }
        if !geometry.is_valid() {
            bail!(
                "invalid data unit geometry: duration {}, size {}, count {}",
                geometry.data_unit_duration,
                geometry.data_unit_size,
                geometry.data_unit_count
            );
        }
        if sampling_rates.is_empty() {
            bail!("recording has no channels");
        }
        let timeline = Arc::new(RwLock::new(Timeline::new(geometry, discontinuous)));
        let annotations = Arc::new(RwLock::new(AnnotationRegistry::new()));
        self.driver = Some(Arc::new(FetchDriver::new(
            source,
            decoder,
            Arc::clone(&timeline),
            Arc::clone(&annotations),
            self.config.clone(),
        )));
        self.timeline = Some(timeline);
        self.annotations = Some(annotations);
        self.sampling_rates = sampling_rates;
        Ok(())
    }

    pub fn state(&self) -> ProcessorState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_set_up(&self) -> bool {
        self.driver.is_some()
    }

    /// Set up the plain in-process cache. Mutually exclusive with
    /// `setup_shared_cache`; selected once and never swapped.
    pub fn setup_cache(&mut self, duration_secs: f64) -> bool {
        let Some(driver) = &self.driver else {
            error!("setup_cache called before setup");
            return false;
        };
        if duration_secs <= 0.0 {
            error!("invalid cache duration {}", duration_secs);
            return false;
        }
        let store: Arc<dyn SignalStore> =
            Arc::new(MemoryCache::new(&self.sampling_rates, duration_secs));
        if let Err(e) = driver.set_store(store) {
            error!("{}", e);
            return false;
        }
        true
    }

    /// Set up the shared-memory cache at `path`, returning the properties a
    /// consumer needs to attach from another execution context.
    pub fn setup_shared_cache(
        &mut self,
        path: impl AsRef<Path>,
        duration_secs: f64,
    ) -> Option<SharedCacheInfo> {
        let Some(driver) = &self.driver else {
            error!("setup_shared_cache called before setup");
            return None;
        };
        if duration_secs <= 0.0 {
            error!("invalid cache duration {}", duration_secs);
            return None;
        }
        let shared = match SharedCache::create(path.as_ref(), &self.sampling_rates, duration_secs) {
            Ok(shared) => shared,
            Err(e) => {
                error!("shared cache creation failed: {}", e);
                return None;
            }
        };
        let info = shared.info(path.as_ref());
        if let Err(e) = driver.set_store(Arc::new(shared)) {
            error!("{}", e);
            return None;
        }
        self.shared_info = Some(info.clone());
        Some(info)
    }

    pub fn shared_cache_info(&self) -> Option<&SharedCacheInfo> {
        self.shared_info.as_ref()
    }

    /// Register gaps known ahead of decoding, e.g. from a header pre-scan
    pub fn set_data_gaps(&self, gaps: &[Gap]) -> bool {
        let Some(timeline) = &self.timeline else {
            error!("set_data_gaps called before setup");
            return false;
        };
        timeline
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .add_gaps(gaps);
        true
    }

    /// Gaps overlapping `range` (defaults to the whole recording)
    pub fn get_data_gaps(&self, range: Option<TimeRange>, use_cache_time: bool) -> Vec<Gap> {
        let Some(timeline) = &self.timeline else {
            error!("get_data_gaps called before setup");
            return Vec::new();
        };
        let timeline = timeline.read().unwrap_or_else(|p| p.into_inner());
        let full = if use_cache_time {
            TimeRange::new(0.0, timeline.geometry().total_cache_length())
        } else {
            TimeRange::new(0.0, timeline.geometry().total_recording_length)
        };
        timeline.data_gaps(range.unwrap_or(full), use_cache_time)
    }

    /// Annotations overlapping `range` (defaults to the whole recording)
    pub fn get_annotations(&self, range: Option<TimeRange>) -> Vec<Annotation> {
        let Some(annotations) = &self.annotations else {
            error!("get_annotations called before setup");
            return Vec::new();
        };
        let registry = annotations.read().unwrap_or_else(|p| p.into_inner());
        match range {
            Some(range) => registry.in_range(range),
            None => registry.all().to_vec(),
        }
    }

    /// Receive a `CacheUpdate` after every successful chunk insert
    pub fn subscribe_updates(&self) -> Option<Receiver<CacheUpdate>> {
        self.driver.as_ref().map(|d| d.subscribe_updates())
    }

    /// Start filling the cache in the background from `start_from`
    /// (recording time). Full-file or windowed strategy is selected by the
    /// configured byte budget.
    pub fn cache_recording(&mut self, start_from: f64) -> bool {
        let Some(driver) = &self.driver else {
            error!("cache_recording called before setup");
            return false;
        };
        if driver.store().is_none() {
            error!("cache_recording called before a cache was set up");
            return false;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let next = ProcessorState::Caching { start_from };
            if !state.can_transition_to(&next) {
                warn!(
                    "cannot start caching from state {}",
                    state.name()
                );
                return false;
            }
            *state = next;
        }
        let driver = Arc::clone(driver);
        let state = Arc::clone(&self.state);
        self.cache_task = Some(tokio::spawn(async move {
            let result = driver.cache_from(start_from).await;
            let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
            *state = match &result {
                Ok(()) => ProcessorState::Complete,
                Err(e) => {
                    error!("background caching failed: {}", e);
                    ProcessorState::Error {
                        message: e.to_string(),
                    }
                }
            };
            result
        }));
        true
    }

    /// Serve a recording-time range of signal data.
    ///
    /// Returns None on any unrecoverable condition (no cache set up, invalid
    /// range, decode failure), always logged first. Internal gaps in the
    /// window are closed up and the tail zero-padded, so the response never
    /// carries sample values for instants that were not acquired.
    pub async fn get_signals(
        &self,
        range: TimeRange,
        filter: Option<&ChannelFilter>,
    ) -> Option<SignalCachePart> {
        let Some(driver) = &self.driver else {
            error!("get_signals called before setup");
            return None;
        };
        let Some(timeline) = &self.timeline else {
            error!("get_signals called before setup");
            return None;
        };
        if range.start == range.end {
            error!("empty signal range at {}", range.start);
            return None;
        }
        if range.start > range.end {
            error!("inverted signal range [{}, {}]", range.start, range.end);
            return None;
        }
        let Some(store) = driver.store() else {
            error!("get_signals called before a cache was set up");
            return None;
        };

        let cache_range = {
            let timeline = timeline.read().unwrap_or_else(|p| p.into_inner());
            let start = timeline.recording_time_to_cache_time(range.start)?;
            let end = timeline.recording_time_to_cache_time(range.end)?;
            TimeRange::new(start, end)
        };

        if !store.is_covered(cache_range) {
            // Direct read for the missing span so this call can make
            // progress even with no background process in flight
            let loaded = driver.load_range_now(cache_range).await;
            if !loaded && !store.is_covered(cache_range) && !driver.has_active_processes() {
                error!(
                    "load of range [{}, {}] failed with no fill in flight",
                    range.start, range.end
                );
                return None;
            }
        }
        if !store.is_covered(cache_range) && driver.has_active_processes() {
            let receiver = driver.add_waiter(cache_range);
            // Soft timeout: proceed with whatever is available
            if tokio::time::timeout(self.config.await_data_timeout, receiver)
                .await
                .is_err()
            {
                warn!(
                    "wait for range [{}, {}] expired after {} ms",
                    range.start,
                    range.end,
                    self.config.await_data_timeout.as_millis()
                );
            }
        }

        let part = match store.as_cache_part() {
            Ok(part) => part,
            Err(e) => {
                error!("cache materialization failed: {}", e);
                return None;
            }
        };

        Some(assemble_response(&part, range, cache_range, filter))
    }

    /// Release the active store and cancel background work; idempotent
    pub fn release(&mut self) {
        if let Some(task) = self.cache_task.take() {
            task.abort();
        }
        if let Some(driver) = &self.driver {
            driver.release_store();
        }
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != ProcessorState::Idle {
            *state = ProcessorState::Idle;
        }
    }
}

impl Drop for SignalProcessor {
    fn drop(&mut self) {
        self.release();
    }
}

/// Slice the materialized coverage into the requested window, closing up
/// internal gaps and zero-padding the tail.
fn assemble_response(
    part: &SignalCachePart,
    range: TimeRange,
    cache_range: TimeRange,
    filter: Option<&ChannelFilter>,
) -> SignalCachePart {
    let mut response = SignalCachePart::new(range.start, range.end);
    for (index, signal) in part.signals.iter().enumerate() {
        let rate = signal.sampling_rate;
        let accepted = filter.map(|f| f.accepts(index)).unwrap_or(true);
        if !accepted || rate <= 0.0 {
            // Filtered-out channels keep their slot so indices stay aligned
            response.signals.push(CacheSignal::new(rate));
            continue;
        }
        let output_len = (range.duration() * rate).round() as usize;
        let mut data = vec![0.0f32; output_len];

        // Coverage can begin after the window start; those leading instants
        // were never acquired, so they stay zero and the real samples keep
        // their offset instead of shifting to the front
        let lead = (((part.start - cache_range.start) * rate).round().max(0.0)) as usize;
        let start_index =
            (((cache_range.start - part.start) * rate).round().max(0.0)) as usize;
        let end_index =
            ((((cache_range.end - part.start) * rate).round()).max(0.0) as usize).min(signal.data.len());
        if start_index < end_index && lead < output_len {
            let available = &signal.data[start_index..end_index];
            let copied = available.len().min(output_len - lead);
            data[lead..lead + copied].copy_from_slice(&available[..copied]);
            if lead + copied < output_len {
                debug!(
                    "zero-padded {} samples for window [{}, {}]",
                    output_len - lead - copied,
                    range.start,
                    range.end
                );
            }
        }
        response.signals.push(CacheSignal {
            data,
            sampling_rate: rate,
        });
    }
    response
}
