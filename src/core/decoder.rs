use anyhow::Result;
use async_trait::async_trait;

use super::{Annotation, CacheSignal, Gap};

/// Output of decoding one span of data units.
///
/// Discontinuous formats may discover gaps and annotations while decoding;
/// both are reported as a side channel and merged into the engine's
/// registries.
#[derive(Debug, Clone, Default)]
pub struct DecodedChunk {
    /// One entry per channel, full sample data for the decoded unit span
    pub signals: Vec<CacheSignal>,
    pub annotations: Vec<Annotation>,
    /// Newly discovered gaps, `start` in cache time
    pub gaps: Vec<Gap>,
}

/// Format-specific decoder injected into the fetch driver.
///
/// The engine does not define the byte-level contract; it only requires the
/// decoder to be deterministic for a given input.
#[async_trait]
pub trait SignalDecoder: Send + Sync {
    /// Decode `chunk`, which holds `unit_count` data units starting at
    /// `unit_index`. `byte_offset` is the chunk's absolute position in the
    /// source and `prior_gap_secs` the total gap time preceding the chunk.
    async fn decode(
        &self,
        chunk: &[u8],
        byte_offset: u64,
        unit_index: usize,
        unit_count: usize,
        prior_gap_secs: f64,
    ) -> Result<DecodedChunk>;
}
