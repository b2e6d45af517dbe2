pub mod map;
pub mod timeline;

pub use map::GapMap;
pub use timeline::Timeline;
