//! Environment configuration
//!
//! | variable             | meaning                                 | default |
//! |----------------------|-----------------------------------------|---------|
//! | `EZCU_NVCC`          | device compiler executable              | `nvcc`  |
//! | `EZCU_BUILD_OPTIONS` | extra compiler flags, read per compile  | (none)  |
//! | `EZCU_TIMER_UNIT`    | `ns`, `us`, `ms` or `s`                 | `ms`    |

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{EzcuError, Result};

pub const NVCC_ENV: &str = "EZCU_NVCC";
pub const BUILD_OPTIONS_ENV: &str = "EZCU_BUILD_OPTIONS";
pub const TIMER_UNIT_ENV: &str = "EZCU_TIMER_UNIT";

/// Minimum stream pool: one transfer stream and one compute stream.
pub const MIN_STREAMS_PER_DEVICE: usize = 2;

/// Unit for elapsed times reported by timed launches and [`crate::Timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    #[default]
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    pub fn convert(self, duration: Duration) -> f64 {
        match self {
            TimeUnit::Nanoseconds => duration.as_nanos() as f64,
            TimeUnit::Microseconds => duration.as_nanos() as f64 / 1e3,
            TimeUnit::Milliseconds => duration.as_nanos() as f64 / 1e6,
            TimeUnit::Seconds => duration.as_secs_f64(),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "ns",
            TimeUnit::Microseconds => "us",
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Seconds => "s",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = EzcuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ns" => Ok(TimeUnit::Nanoseconds),
            "us" => Ok(TimeUnit::Microseconds),
            "ms" => Ok(TimeUnit::Milliseconds),
            "s" => Ok(TimeUnit::Seconds),
            other => Err(EzcuError::InvalidConfig(format!(
                "unknown time unit '{other}', expected ns, us, ms or s"
            ))),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Device compiler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilerConfig {
    pub executable: PathBuf,
    /// Flags passed before the per-call options
    pub base_options: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("nvcc"),
            base_options: ["-v", "-fatbin", "-lineinfo", "-Xptxas", "-v,-Werror"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl CompilerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(executable) = env::var_os(NVCC_ENV).filter(|value| !value.is_empty()) {
            config.executable = PathBuf::from(executable);
        }
        config
    }

    /// Extra options from `EZCU_BUILD_OPTIONS`, split on whitespace.
    pub fn env_build_options() -> Vec<String> {
        env::var(BUILD_OPTIONS_ENV)
            .map(|value| value.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentConfig {
    pub compiler: CompilerConfig,
    pub time_unit: TimeUnit,
    /// Streams created per device; index 0 transfers, index 1 computes
    pub streams_per_device: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            time_unit: TimeUnit::default(),
            streams_per_device: MIN_STREAMS_PER_DEVICE,
        }
    }
}

impl EnvironmentConfig {
    pub fn from_env() -> Result<Self> {
        let time_unit = match env::var(TIMER_UNIT_ENV) {
            Ok(value) if !value.trim().is_empty() => value.parse()?,
            _ => TimeUnit::default(),
        };
        Ok(Self {
            compiler: CompilerConfig::from_env(),
            time_unit,
            ..Self::default()
        })
    }

    pub fn with_time_unit(mut self, unit: TimeUnit) -> Self {
        self.time_unit = unit;
        self
    }

    pub fn with_streams_per_device(mut self, streams: usize) -> Self {
        self.streams_per_device = streams;
        self
    }

    pub fn with_compiler(mut self, compiler: CompilerConfig) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams_per_device < MIN_STREAMS_PER_DEVICE {
            return Err(EzcuError::InvalidConfig(format!(
                "streams_per_device must be at least {MIN_STREAMS_PER_DEVICE}, got {}",
                self.streams_per_device
            )));
        }
        Ok(())
    }
}
