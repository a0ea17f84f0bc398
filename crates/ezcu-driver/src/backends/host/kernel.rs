//! Kernel bodies executed by the host driver

use std::sync::Arc;

use bytemuck::Pod;

use super::memory::AddressSpace;
use crate::driver::{KernelArg, LaunchConfig, ScalarValue};
use crate::error::{DriverError, Result};

/// Host implementation of a device kernel, registered by function name.
pub type HostKernel = Arc<dyn Fn(&mut KernelContext<'_>) -> Result<()> + Send + Sync>;

/// Arguments and device memory visible to a kernel body during one launch.
pub struct KernelContext<'a> {
    name: &'a str,
    config: &'a LaunchConfig,
    args: &'a [KernelArg],
    memory: &'a mut AddressSpace,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        name: &'a str,
        config: &'a LaunchConfig,
        args: &'a [KernelArg],
        memory: &'a mut AddressSpace,
    ) -> Self {
        Self {
            name,
            config,
            args,
            memory,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn config(&self) -> &LaunchConfig {
        self.config
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Scalar argument at `index`.
    pub fn scalar(&self, index: usize) -> Result<ScalarValue> {
        match self.args.get(index) {
            Some(KernelArg::Scalar(value)) => Ok(*value),
            Some(KernelArg::Memory(_)) => Err(self.invalid(index, "expected a scalar, got a pointer")),
            None => Err(self.invalid(index, "argument missing")),
        }
    }

    /// Copy of the device array passed as pointer argument `index`.
    pub fn read<T: Pod>(&self, index: usize) -> Result<Vec<T>> {
        let ptr = self.pointer(index)?;
        let entry = self.memory.get(ptr)?;
        let count = entry.storage.len() / std::mem::size_of::<T>().max(1);
        let mut values = vec![T::zeroed(); count];
        entry.storage.read_into(bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }

    /// Overwrite the start of the device array passed as pointer argument `index`.
    pub fn write<T: Pod>(&mut self, index: usize, values: &[T]) -> Result<()> {
        let ptr = self.pointer(index)?;
        let entry = self.memory.get_mut(ptr)?;
        entry.storage.write_from(bytemuck::cast_slice(values))
    }

    /// Error to return from a kernel body that cannot proceed.
    pub fn fail(&self, reason: impl Into<String>) -> DriverError {
        DriverError::KernelFailed {
            kernel: self.name.to_string(),
            reason: reason.into(),
        }
    }

    fn pointer(&self, index: usize) -> Result<crate::driver::DevicePtr> {
        match self.args.get(index) {
            Some(KernelArg::Memory(ptr)) => Ok(*ptr),
            Some(KernelArg::Scalar(_)) => Err(self.invalid(index, "expected a pointer, got a scalar")),
            None => Err(self.invalid(index, "argument missing")),
        }
    }

    fn invalid(&self, index: usize, reason: &str) -> DriverError {
        DriverError::InvalidArgument {
            index,
            reason: reason.to_string(),
        }
    }
}
