use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recording-level constants, set once at setup and immutable afterward.
///
/// All time/index conversions go through the data-unit geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordingGeometry {
    /// Duration of one native data unit in seconds (e.g. one EDF record)
    pub data_unit_duration: f64,
    /// Size of one data unit in bytes
    pub data_unit_size: usize,
    /// Number of data units in the recording
    pub data_unit_count: usize,
    /// Bytes preceding the first data unit in the source
    pub header_size: u64,
    /// Wall-clock length in seconds, including gaps
    pub total_recording_length: f64,
}

impl RecordingGeometry {
    /// Length of the contiguous, gap-removed sample stream in seconds
    pub fn total_cache_length(&self) -> f64 {
        self.data_unit_duration * self.data_unit_count as f64
    }

    pub fn is_valid(&self) -> bool {
        self.data_unit_duration > 0.0 && self.data_unit_size > 0 && self.data_unit_count > 0
    }
}

/// Cache tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Data units fetched per load step
    pub chunk_units: usize,
    /// Converted-size budget above which the windowed strategy is used;
    /// None means the whole recording is always cached
    pub max_cache_bytes: Option<u64>,
    /// Bounded wait for a pending range request
    #[serde(with = "duration_millis", default = "default_await_timeout")]
    pub await_data_timeout: Duration,
}

fn default_await_timeout() -> Duration {
    Duration::from_secs(5)
}

// Serialize the timeout as whole milliseconds
mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_units: 10,
            max_cache_bytes: None,
            await_data_timeout: default_await_timeout(),
        }
    }
}

impl CacheConfig {
    pub fn from_json(config: Value) -> Self {
        let defaults = Self::default();
        Self {
            chunk_units: config["chunk_units"]
                .as_u64()
                .map(|v| v as usize)
                .unwrap_or(defaults.chunk_units),
            max_cache_bytes: config["max_cache_bytes"].as_u64(),
            await_data_timeout: config["await_data_timeout_ms"]
                .as_u64()
                .map(Duration::from_millis)
                .unwrap_or(defaults.await_data_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        let config = CacheConfig::from_json(serde_json::json!({
            "chunk_units": 4,
            "max_cache_bytes": 1024,
        }));
        assert_eq!(config.chunk_units, 4);
        assert_eq!(config.max_cache_bytes, Some(1024));
        assert_eq!(config.await_data_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_defaults() {
        let config = CacheConfig::from_json(serde_json::json!({}));
        assert_eq!(config.chunk_units, 10);
        assert_eq!(config.max_cache_bytes, None);
    }

    #[test]
    fn test_geometry_cache_length() {
        let geometry = RecordingGeometry {
            data_unit_duration: 2.0,
            data_unit_size: 256,
            data_unit_count: 30,
            header_size: 512,
            total_recording_length: 75.0,
        };
        assert_eq!(geometry.total_cache_length(), 60.0);
        assert!(geometry.is_valid());
    }
}
