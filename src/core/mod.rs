pub mod annotation;
pub mod config;
pub mod decoder;
pub mod part;

pub use annotation::{Annotation, AnnotationRegistry};
pub use config::{CacheConfig, RecordingGeometry};
pub use decoder::{DecodedChunk, SignalDecoder};
pub use part::{CacheSignal, CacheUpdate, ChannelFilter, Gap, SignalCachePart, TimeRange};
