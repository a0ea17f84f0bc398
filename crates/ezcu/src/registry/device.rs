use std::fmt;

use ezcu_driver::{ContextFlags, ContextHandle, DeviceInfo, DeviceOrdinal, Driver, StreamHandle};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::MIN_STREAMS_PER_DEVICE;
use crate::error::{EzcuError, Result};

/// Stream used for host/device transfers.
pub const TRANSFER_STREAM: usize = 0;

/// Stream used for kernel launches.
pub const COMPUTE_STREAM: usize = 1;

/// An opened accelerator: its properties, context and stream pool.
#[derive(Debug)]
pub struct Device {
    info: DeviceInfo,
    ctx: ContextHandle,
    streams: Vec<StreamHandle>,
}

impl Device {
    /// Create the context and `stream_count` streams, then wait for the context to settle.
    ///
    /// At least [`MIN_STREAMS_PER_DEVICE`] streams are required. On failure
    /// every stream and the context created so far are destroyed.
    pub fn open(driver: &dyn Driver, info: DeviceInfo, stream_count: usize) -> Result<Self> {
        if stream_count < MIN_STREAMS_PER_DEVICE {
            return Err(EzcuError::InvalidConfig(format!(
                "device {} needs at least {MIN_STREAMS_PER_DEVICE} streams, got {stream_count}",
                info.ordinal
            )));
        }

        let ctx = driver.context_create(info.ordinal, ContextFlags::MAP_HOST | ContextFlags::SCHED_YIELD)?;
        let mut streams = Vec::with_capacity(stream_count);
        let opened = (0..stream_count)
            .try_for_each(|_| driver.stream_create(ctx).map(|stream| streams.push(stream)))
            .and_then(|()| driver.context_synchronize(ctx));
        if let Err(err) = opened {
            warn!(device = %info.ordinal, error = %err, created = streams.len(), "device open failed");
            for stream in &streams {
                let _ = driver.stream_destroy(ctx, *stream);
            }
            let _ = driver.context_destroy(ctx);
            return Err(err.into());
        }

        debug!(device = %info.ordinal, name = %info.name, %ctx, streams = streams.len(), "device opened");
        Ok(Self { info, ctx, streams })
    }

    /// Drain and destroy every stream, then the context.
    ///
    /// The context is destroyed even when a stream fails to drain; the first
    /// failure is returned.
    pub fn close(self, driver: &dyn Driver) -> Result<()> {
        let mut first_error = None;
        for stream in &self.streams {
            let closed = driver
                .stream_synchronize(self.ctx, *stream)
                .and_then(|()| driver.stream_destroy(self.ctx, *stream));
            if let Err(err) = closed {
                warn!(device = %self.info.ordinal, %stream, error = %err, "stream teardown failed");
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = driver.context_synchronize(self.ctx) {
            first_error.get_or_insert(err);
        }
        if let Err(err) = driver.context_destroy(self.ctx) {
            first_error.get_or_insert(err);
        }
        debug!(device = %self.info.ordinal, "device closed");
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Block until all queued work on the device completes.
    pub fn wait(&self, driver: &dyn Driver) -> Result<()> {
        driver.context_synchronize(self.ctx)?;
        Ok(())
    }

    pub fn ordinal(&self) -> DeviceOrdinal {
        self.info.ordinal
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn context(&self) -> ContextHandle {
        self.ctx
    }

    pub fn transfer_stream(&self) -> StreamHandle {
        self.streams[TRANSFER_STREAM]
    }

    pub fn compute_stream(&self) -> StreamHandle {
        self.streams[COMPUTE_STREAM]
    }

    pub fn streams(&self) -> &[StreamHandle] {
        &self.streams
    }

    pub fn summary(&self) -> DeviceSummary {
        let capability = self.info.capability;
        DeviceSummary {
            ordinal: self.info.ordinal.0,
            name: self.info.name.clone(),
            vendor: self.info.vendor.to_string(),
            capability: capability.to_string(),
            multiprocessors: self.info.multiprocessor_count,
            cores_per_multiprocessor: capability.cores_per_multiprocessor(),
            total_memory_bytes: self.info.total_memory,
            clock_rate_khz: self.info.clock_rate_khz,
            can_map_host_memory: self.info.can_map_host_memory,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, sm_{})", self.info.ordinal, self.info.name, self.info.capability.arch())
    }
}

/// Serializable description of an opened device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    pub ordinal: u32,
    pub name: String,
    pub vendor: String,
    pub capability: String,
    pub multiprocessors: u32,
    /// `None` for SM versions missing from the core table
    pub cores_per_multiprocessor: Option<u32>,
    pub total_memory_bytes: usize,
    pub clock_rate_khz: u32,
    pub can_map_host_memory: bool,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cores = match self.cores_per_multiprocessor {
            Some(cores) => (cores * self.multiprocessors).to_string(),
            None => "unknown".to_string(),
        };
        write!(
            f,
            "dev{} {} [{}] cc {}, {} SMs, {} cores, {} MiB, {} MHz, map host: {}",
            self.ordinal,
            self.name,
            self.vendor,
            self.capability,
            self.multiprocessors,
            cores,
            self.total_memory_bytes >> 20,
            self.clock_rate_khz / 1000,
            self.can_map_host_memory,
        )
    }
}
