//! Shared test helpers.

use std::sync::Once;
use weft::{TaskProcessor, TaskProcessorConfig};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging once; later calls are no-ops.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .try_init();
    });
}

/// A small processor for tests.
pub fn test_processor(worker_threads: usize) -> TaskProcessor {
    init_test_logging();
    TaskProcessor::new(TaskProcessorConfig {
        worker_threads,
        event_threads: 1,
        thread_name_prefix: "weft-test".to_owned(),
        coro_stack_size: 128 * 1024,
        ..TaskProcessorConfig::default()
    })
}
