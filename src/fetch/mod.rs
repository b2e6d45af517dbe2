pub mod driver;
pub mod process;
pub mod source;

pub use driver::{FetchDriver, LoadStep};
pub use process::{CacheProcess, LoadDirection};
pub use source::{DataSource, FileSource};
