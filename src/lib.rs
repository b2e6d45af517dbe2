pub mod core;
pub mod fetch;
pub mod gaps;
pub mod processor;
pub mod store;
