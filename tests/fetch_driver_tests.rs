use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

use sigcache::core::{
    AnnotationRegistry, CacheConfig, CacheSignal, DecodedChunk, Gap, RecordingGeometry,
    SignalDecoder, TimeRange,
};
use sigcache::fetch::{DataSource, FetchDriver, LoadDirection, LoadStep};
use sigcache::gaps::Timeline;
use sigcache::store::{MemoryCache, SignalStore};

const UNIT_SIZE: usize = 64;
const RATE: f64 = 10.0;

struct StaticSource {
    len: u64,
}

#[async_trait]
impl DataSource for StaticSource {
    async fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        if offset + length as u64 > self.len {
            bail!("read past end of source");
        }
        Ok(vec![0u8; length])
    }

    fn total_len(&self) -> u64 {
        self.len
    }
}

/// Emits a ramp where each sample equals its global sample index, so tests
/// can verify placement of decoded data without real file parsing.
struct RampDecoder;

#[async_trait]
impl SignalDecoder for RampDecoder {
    async fn decode(
        &self,
        _chunk: &[u8],
        _byte_offset: u64,
        unit_index: usize,
        unit_count: usize,
        _prior_gap_secs: f64,
    ) -> Result<DecodedChunk> {
        let samples_per_unit = RATE as usize;
        let first = unit_index * samples_per_unit;
        let data = (first..first + unit_count * samples_per_unit)
            .map(|i| i as f32)
            .collect();
        Ok(DecodedChunk {
            signals: vec![CacheSignal {
                data,
                sampling_rate: RATE,
            }],
            annotations: Vec::new(),
            gaps: Vec::new(),
        })
    }
}

/// Like RampDecoder but fails for any chunk at or past `fail_from_unit`
struct FailingDecoder {
    fail_from_unit: usize,
}

#[async_trait]
impl SignalDecoder for FailingDecoder {
    async fn decode(
        &self,
        chunk: &[u8],
        byte_offset: u64,
        unit_index: usize,
        unit_count: usize,
        prior_gap_secs: f64,
    ) -> Result<DecodedChunk> {
        if unit_index >= self.fail_from_unit {
            bail!("corrupt data unit {}", unit_index);
        }
        RampDecoder
            .decode(chunk, byte_offset, unit_index, unit_count, prior_gap_secs)
            .await
    }
}

/// Reports one gap discovered while decoding the first chunk
struct GapDecoder;

#[async_trait]
impl SignalDecoder for GapDecoder {
    async fn decode(
        &self,
        chunk: &[u8],
        byte_offset: u64,
        unit_index: usize,
        unit_count: usize,
        prior_gap_secs: f64,
    ) -> Result<DecodedChunk> {
        let mut decoded = RampDecoder
            .decode(chunk, byte_offset, unit_index, unit_count, prior_gap_secs)
            .await?;
        if unit_index == 0 {
            decoded.gaps.push(Gap::new(2.0, 1.5));
        }
        Ok(decoded)
    }
}

fn make_driver(
    unit_count: usize,
    chunk_units: usize,
    decoder: Arc<dyn SignalDecoder>,
) -> (Arc<FetchDriver>, Arc<dyn SignalStore>) {
    let geometry = RecordingGeometry {
        data_unit_duration: 1.0,
        data_unit_size: UNIT_SIZE,
        data_unit_count: unit_count,
        header_size: 0,
        total_recording_length: unit_count as f64 + 10.0,
    };
    let timeline = Arc::new(RwLock::new(Timeline::new(geometry, true)));
    let annotations = Arc::new(RwLock::new(AnnotationRegistry::new()));
    let source = Arc::new(StaticSource {
        len: (unit_count * UNIT_SIZE) as u64,
    });
    let config = CacheConfig {
        chunk_units,
        ..CacheConfig::default()
    };
    let driver = Arc::new(FetchDriver::new(
        source,
        decoder,
        timeline,
        annotations,
        config,
    ));
    let store: Arc<dyn SignalStore> = Arc::new(MemoryCache::new(&[RATE], unit_count as f64));
    driver.set_store(Arc::clone(&store)).unwrap();
    (driver, store)
}

#[tokio::test]
async fn test_direct_load_places_decoded_samples() {
    let (driver, store) = make_driver(10, 2, Arc::new(RampDecoder));

    assert!(driver.load_range_now(TimeRange::new(0.0, 3.0)).await);
    assert!(store.is_covered(TimeRange::new(0.0, 3.0)));

    let part = store.as_cache_part().unwrap();
    assert_eq!(part.start, 0.0);
    assert_eq!(part.signals[0].data.len(), 30);
    for (i, &v) in part.signals[0].data.iter().enumerate() {
        assert_eq!(v, i as f32);
    }
}

#[tokio::test]
async fn test_forward_process_runs_to_completion() {
    let (driver, store) = make_driver(10, 3, Arc::new(RampDecoder));

    let id = driver
        .create_process(TimeRange::new(0.0, 10.0), LoadDirection::Forward, 0.0)
        .unwrap();
    assert!(driver.has_active_processes());

    assert_eq!(driver.run_process(id).await, LoadStep::Done);
    assert!(!driver.has_active_processes());
    assert!(store.is_covered(TimeRange::new(0.0, 10.0)));
}

#[tokio::test]
async fn test_concurrent_processes_fill_disjoint_windows() {
    let (driver, store) = make_driver(20, 2, Arc::new(RampDecoder));

    let first = driver
        .create_process(TimeRange::new(0.0, 8.0), LoadDirection::Forward, 0.0)
        .unwrap();
    let second = driver
        .create_process(TimeRange::new(12.0, 20.0), LoadDirection::Forward, 12.0)
        .unwrap();

    let (a, b) = tokio::join!(driver.run_process(first), driver.run_process(second));
    assert_eq!(a, LoadStep::Done);
    assert_eq!(b, LoadStep::Done);

    assert!(store.is_covered(TimeRange::new(0.0, 8.0)));
    assert!(store.is_covered(TimeRange::new(12.0, 20.0)));
    // The untargeted middle stays a hole
    assert!(!store.is_covered(TimeRange::new(8.0, 12.0)));

    let part = store.as_cache_part().unwrap();
    for (i, &v) in part.signals[0].data.iter().take(80).enumerate() {
        assert_eq!(v, i as f32);
    }
}

#[tokio::test]
async fn test_decode_failure_stops_only_its_own_process() {
    let (driver, store) = make_driver(10, 2, Arc::new(FailingDecoder { fail_from_unit: 4 }));

    let failing = driver
        .create_process(TimeRange::new(0.0, 8.0), LoadDirection::Forward, 0.0)
        .unwrap();
    assert_eq!(driver.run_process(failing).await, LoadStep::Failed);
    assert!(!driver.has_active_processes());

    // The two chunks before the failure landed
    assert!(store.is_covered(TimeRange::new(0.0, 4.0)));
    assert!(!store.is_covered(TimeRange::new(4.0, 8.0)));
}

#[tokio::test]
async fn test_cancelled_process_does_not_load() {
    let (driver, store) = make_driver(10, 2, Arc::new(RampDecoder));

    let id = driver
        .create_process(TimeRange::new(0.0, 10.0), LoadDirection::Forward, 0.0)
        .unwrap();
    driver.cancel_all();
    assert!(!driver.has_active_processes());

    driver.run_process(id).await;
    assert_eq!(store.output_range(), TimeRange::new(0.0, 0.0));
}

#[tokio::test]
async fn test_waiter_resolves_when_coverage_lands() {
    let (driver, _store) = make_driver(10, 5, Arc::new(RampDecoder));

    let receiver = driver.add_waiter(TimeRange::new(1.0, 4.0));
    assert!(driver.load_range_now(TimeRange::new(0.0, 5.0)).await);
    assert!(receiver.await.is_ok());
}

#[tokio::test]
async fn test_update_event_carries_range_and_gap_list() {
    let (driver, _store) = make_driver(10, 5, Arc::new(GapDecoder));

    let updates = driver.subscribe_updates();
    assert!(driver.load_range_now(TimeRange::new(0.0, 5.0)).await);

    let update = updates.try_recv().unwrap();
    assert_eq!(update.range.start, 0.0);
    // The decoder-reported gap at cache time 2.0 maps to recording time 2.0
    // with nothing before it
    assert_eq!(update.gaps, vec![Gap::new(2.0, 1.5)]);
}

#[tokio::test]
async fn test_backward_process_extends_toward_zero() {
    let (driver, store) = make_driver(10, 3, Arc::new(RampDecoder));

    let id = driver
        .create_process(TimeRange::new(0.0, 6.0), LoadDirection::Backward, 6.0)
        .unwrap();
    assert_eq!(driver.run_process(id).await, LoadStep::Done);
    assert!(store.is_covered(TimeRange::new(0.0, 6.0)));
}
