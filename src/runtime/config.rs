//! Task processor configuration.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `event_threads` | 1 |
//! | `thread_name_prefix` | `"weft-worker"` |
//! | `coro_stack_size` | 256 KiB |
//! | `coro_cache_max` | 256 frames |
//! | `max_live_coroutines` | unlimited |
//! | `profiler_threshold` | `None` (disabled) |
//! | `task_trace_max_csw` | 0 (state-transition tracing disabled) |

use std::time::Duration;

/// Configuration for a [`TaskProcessor`](super::TaskProcessor).
#[derive(Debug, Clone)]
pub struct TaskProcessorConfig {
    /// Number of worker threads running task steps.
    pub worker_threads: usize,
    /// Number of event-loop threads serving timers.
    pub event_threads: usize,
    /// Name prefix for worker and event threads.
    pub thread_name_prefix: String,
    /// Stack size of each coroutine frame.
    pub coro_stack_size: usize,
    /// Maximum number of idle frames kept for reuse.
    pub coro_cache_max: usize,
    /// Hard cap on live coroutine frames; exceeding it fails `spawn`.
    pub max_live_coroutines: usize,
    /// Warn when a single task step runs longer than this without yielding.
    pub profiler_threshold: Option<Duration>,
    /// How many state transitions of a new task are logged before the
    /// budget runs out. Zero disables transition tracing.
    pub task_trace_max_csw: u32,
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            event_threads: 1,
            thread_name_prefix: "weft-worker".to_owned(),
            coro_stack_size: 256 * 1024,
            coro_cache_max: 256,
            max_live_coroutines: usize::MAX,
            profiler_threshold: None,
            task_trace_max_csw: 0,
        }
    }
}

impl TaskProcessorConfig {
    /// Clamps configuration values to safe minimums.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.event_threads == 0 {
            self.event_threads = 1;
        }
        // Room for the payload plus panic machinery on unwind.
        self.coro_stack_size = self.coro_stack_size.max(32 * 1024);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_already_normal() {
        let mut config = TaskProcessorConfig::default();
        let before = config.clone();
        config.normalize();
        assert_eq!(config.worker_threads, before.worker_threads);
        assert_eq!(config.coro_stack_size, before.coro_stack_size);
    }

    #[test]
    fn normalize_clamps_zeroes() {
        let mut config = TaskProcessorConfig {
            worker_threads: 0,
            event_threads: 0,
            coro_stack_size: 0,
            ..TaskProcessorConfig::default()
        };
        config.normalize();
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.event_threads, 1);
        assert!(config.coro_stack_size >= 32 * 1024);
    }
}
