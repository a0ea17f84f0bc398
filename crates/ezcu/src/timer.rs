//! Wall-clock timer with nested tick/read pairs

use std::time::{Duration, Instant};

use crate::config::TimeUnit;
use crate::error::{EzcuError, Result};

/// Maximum number of outstanding ticks. The oldest is dropped beyond it.
pub const MAX_NESTING: usize = 32;

/// Stack of start instants. Every [`Timer::tick`] pushes one and every
/// [`Timer::read`] pops the most recent, so pairs may nest.
#[derive(Debug, Clone)]
pub struct Timer {
    unit: TimeUnit,
    starts: Vec<Instant>,
}

impl Timer {
    pub fn new(unit: TimeUnit) -> Self {
        Self {
            unit,
            starts: Vec::with_capacity(MAX_NESTING),
        }
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    pub fn set_unit(&mut self, unit: TimeUnit) {
        self.unit = unit;
    }

    /// Seconds per unit.
    pub fn coef(&self) -> f64 {
        self.unit.convert(Duration::from_secs(1)).recip()
    }

    pub fn tick(&mut self) {
        if self.starts.len() == MAX_NESTING {
            self.starts.remove(0);
        }
        self.starts.push(Instant::now());
    }

    /// Elapsed time since the matching tick, in the timer unit.
    pub fn read(&mut self) -> Result<f64> {
        let start = self
            .starts
            .pop()
            .ok_or_else(|| EzcuError::InvalidConfig("timer read without a matching tick".to_string()))?;
        Ok(self.unit.convert(start.elapsed()))
    }

    pub fn depth(&self) -> usize {
        self.starts.len()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(TimeUnit::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_nested_reads() {
        let mut timer = Timer::new(TimeUnit::Microseconds);
        timer.tick();
        thread::sleep(Duration::from_millis(5));
        timer.tick();
        let inner = timer.read().unwrap();
        thread::sleep(Duration::from_millis(2));
        let outer = timer.read().unwrap();
        assert!(outer >= 7_000.0);
        assert!(inner < outer);
        assert_eq!(timer.depth(), 0);
    }

    #[test]
    fn test_read_without_tick() {
        let mut timer = Timer::default();
        assert!(timer.read().is_err());
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut timer = Timer::default();
        for _ in 0..MAX_NESTING + 5 {
            timer.tick();
        }
        assert_eq!(timer.depth(), MAX_NESTING);
    }

    #[test]
    fn test_coef() {
        assert_eq!(Timer::new(TimeUnit::Seconds).coef(), 1.0);
        assert!((Timer::new(TimeUnit::Milliseconds).coef() - 1e-3).abs() < 1e-15);
    }
}
