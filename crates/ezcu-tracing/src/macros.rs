//! Convenience macros for performance tracing

/// Create a [`crate::performance::PerformanceSpan`] guard, optionally with fields.
///
/// ```rust
/// use ezcu_tracing::perf_span;
///
/// {
///     let _span = perf_span!("mem_wrap", bytes = 4096);
/// } // duration logged on drop
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Execute a block with timing, returning `(result, duration_us)`.
///
/// ```rust
/// use ezcu_tracing::timed_block;
///
/// let (sum, _duration_us) = timed_block!("sum", { (1..=100).sum::<i32>() });
/// assert_eq!(sum, 5050);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::debug!(
            operation = $name,
            duration_us = duration_us,
            "timed_block_complete"
        );
        (result, duration_us)
    }};
}
