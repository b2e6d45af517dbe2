use sigcache::core::{CacheSignal, SignalCachePart, TimeRange};
use sigcache::store::{SharedCache, SignalStore};

fn part(start: f64, end: f64, rates: &[f64], value: f32) -> SignalCachePart {
    SignalCachePart {
        start,
        end,
        signals: rates
            .iter()
            .map(|&rate| CacheSignal {
                data: vec![value; ((end - start) * rate).round() as usize],
                sampling_rate: rate,
            })
            .collect(),
    }
}

#[test]
fn test_create_and_reopen_region() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sig");

    let rates = [100.0, 50.0];
    let producer = SharedCache::create(&path, &rates, 10.0).unwrap();
    assert_eq!(producer.sampling_rates(), vec![100.0, 50.0]);
    assert_eq!(producer.output_range(), TimeRange::new(0.0, 0.0));

    let consumer = SharedCache::open(&path).unwrap();
    assert_eq!(consumer.sampling_rates(), vec![100.0, 50.0]);
}

#[test]
fn test_open_rejects_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not_a_cache");
    std::fs::write(&path, vec![0u8; 8192]).unwrap();
    assert!(SharedCache::open(&path).is_err());
}

#[test]
fn test_consumer_sees_producer_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sig");
    let rates = [100.0];

    let producer = SharedCache::create(&path, &rates, 10.0).unwrap();
    producer
        .insert_signals(&part(0.0, 2.0, &rates, 7.5))
        .unwrap();

    // Coverage metadata is readable from the attached side without any
    // producer cooperation
    let consumer = SharedCache::open(&path).unwrap();
    assert_eq!(consumer.output_range(), TimeRange::new(0.0, 2.0));
    assert!(consumer.is_covered(TimeRange::new(0.5, 1.5)));

    let materialized = consumer.as_cache_part().unwrap();
    assert_eq!(materialized.start, 0.0);
    assert_eq!(materialized.end, 2.0);
    assert_eq!(materialized.signals[0].data.len(), 200);
    assert!(materialized.signals[0].data.iter().all(|&v| v == 7.5));
}

#[test]
fn test_coverage_requires_every_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sig");
    let rates = [100.0, 50.0];

    let cache = SharedCache::create(&path, &rates, 10.0).unwrap();

    // First channel lands alone; the second reports no samples yet
    let mut first_only = part(0.0, 2.0, &rates, 1.0);
    first_only.signals[1].data.clear();
    cache.insert_signals(&first_only).unwrap();

    assert!(!cache.is_covered(TimeRange::new(0.0, 2.0)));
    assert_eq!(
        cache.uncovered_within(TimeRange::new(0.0, 2.0)),
        vec![TimeRange::new(0.0, 2.0)]
    );
    assert!(cache.covered_interval_containing(1.0).is_none());

    // The lagging channel catches up and the range becomes usable
    let mut second_only = part(0.0, 2.0, &rates, 2.0);
    second_only.signals[0].data.clear();
    cache.insert_signals(&second_only).unwrap();

    assert!(cache.is_covered(TimeRange::new(0.0, 2.0)));
    assert!(cache.uncovered_within(TimeRange::new(0.0, 2.0)).is_empty());
    assert_eq!(
        cache.covered_interval_containing(1.0),
        Some(TimeRange::new(0.0, 2.0))
    );
}

#[test]
fn test_insert_beyond_capacity_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sig");
    let rates = [100.0];

    let cache = SharedCache::create(&path, &rates, 5.0).unwrap();
    assert!(cache.insert_signals(&part(4.0, 6.0, &rates, 1.0)).is_err());
}

#[test]
fn test_release_clears_coverage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sig");
    let rates = [100.0];

    let cache = SharedCache::create(&path, &rates, 10.0).unwrap();
    cache.insert_signals(&part(0.0, 1.0, &rates, 1.0)).unwrap();
    cache.release();
    cache.release();
    assert!(cache.is_released());
    assert!(cache.insert_signals(&part(0.0, 1.0, &rates, 1.0)).is_err());

    // The shared header reflects the release for any attached peer
    let consumer = SharedCache::open(&path).unwrap();
    assert_eq!(consumer.output_range(), TimeRange::new(0.0, 0.0));
}

#[test]
fn test_concurrent_metadata_reads_during_inserts() {
    use std::sync::Arc;
    use std::thread;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sig");
    let rates = [100.0];

    let producer = Arc::new(SharedCache::create(&path, &rates, 120.0).unwrap());
    let writer = Arc::clone(&producer);
    let handle = thread::spawn(move || {
        for step in 0..100 {
            let start = step as f64;
            writer
                .insert_signals(&part(start, start + 1.0, &[100.0], step as f32))
                .unwrap();
        }
    });

    let consumer = SharedCache::open(&path).unwrap();
    for _ in 0..500 {
        // Bounds reads never block on the writer and never tear
        let range = consumer.output_range();
        assert!(range.start <= range.end);
        assert!(range.end <= 120.0);
    }
    handle.join().unwrap();
    assert_eq!(consumer.output_range(), TimeRange::new(0.0, 100.0));
}
