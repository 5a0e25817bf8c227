//! The task processor and its configuration.

pub mod config;
pub mod counters;
pub mod processor;

pub use config::TaskProcessorConfig;
pub use counters::TaskCounter;
pub use processor::{ProcessorHandle, TaskProcessor};

pub(crate) use processor::ProcessorInner;
