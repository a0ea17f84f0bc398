//! Performance-focused tracing utilities
//!
//! Timing guards and structured recorders for the events the runtime cares
//! about: host/device transfers, device allocations and kernel launches.
//!
//! ```rust
//! use ezcu_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("mem_sync", Some(100));
//! record_transfer(4096, "H2D", 12);
//! drop(span); // logged only if it took longer than 100μs
//! ```

use std::time::Instant;
use tracing::Level;

/// RAII guard that measures span duration and conditionally logs based on threshold.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Create a new performance span with optional threshold filtering.
    ///
    /// * `name` - Name of the operation being measured
    /// * `threshold_us` - Minimum duration in microseconds to log (None = always log)
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Create a new performance span at the specified tracing level.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };

        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    /// Name given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Elapsed time since span creation.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();

        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a host/device transfer with bandwidth calculation.
///
/// * `direction` - `"H2D"` (host to device) or `"D2H"` (device to host)
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        mb = bytes as f64 / (1024.0 * 1024.0),
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Record a device-side allocation or host registration.
///
/// * `kind` - `"device"`, `"pinned"` or `"zero-copy"`
pub fn record_allocation(size_bytes: usize, kind: &str, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        size_bytes = size_bytes,
        size_mb = size_bytes as f64 / (1024.0 * 1024.0),
        kind = kind,
        duration_us = duration_us,
        "memory_allocation"
    );
}

/// Record a kernel launch.
pub fn record_launch(kernel: &str, total_threads: u64, duration_us: u64, synchronous: bool) {
    tracing::debug!(
        event = "launch",
        kernel = kernel,
        total_threads = total_threads,
        duration_us = duration_us,
        synchronous = synchronous,
        "kernel_launch"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_performance_span_creation() {
        let span = PerformanceSpan::new("test_span", None);
        assert_eq!(span.name(), "test_span");
        assert_eq!(span.threshold_us, None);
    }

    #[test]
    fn test_performance_span_elapsed() {
        let span = PerformanceSpan::new("test_span", Some(1000));
        thread::sleep(Duration::from_millis(10));
        assert!(span.elapsed_us() >= 10_000, "elapsed should be at least 10ms");
    }

    #[test]
    fn test_performance_span_with_level() {
        let span = PerformanceSpan::with_level(Level::INFO, "test_span", Some(100));
        assert_eq!(span.threshold_us, Some(100));
    }

    #[test]
    fn test_recorders_do_not_panic() {
        record_transfer(4096, "H2D", 250);
        record_transfer(4096, "D2H", 0);
        record_allocation(1024, "pinned", 3);
        record_launch("copy", 1024, 17, true);
    }
}
