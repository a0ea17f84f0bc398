//! # ezcu-driver
//!
//! Accelerator driver abstraction for the ezcu runtime.
//!
//! The [`Driver`] trait covers what the resource layer needs from a native
//! driver: device enumeration, contexts and streams, device memory and host
//! registration, module loading and kernel launches. Two implementations ship
//! with the crate:
//!
//! - [`HostDriver`]: simulated devices executing Rust kernel bodies in-process
//! - `CudaDriver`: the NVIDIA driver API through `cudarc` (feature `cuda`)
//!
//! ## Example
//!
//! ```rust
//! use ezcu_driver::{ContextFlags, DeviceOrdinal, Driver, HostDriver};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = HostDriver::default();
//! driver.init()?;
//!
//! let ctx = driver.context_create(DeviceOrdinal(0), ContextFlags::MAP_HOST)?;
//! let ptr = driver.mem_alloc(ctx, 16)?;
//! driver.memcpy_htod(ctx, ptr, &[1, 2, 3, 4], None)?;
//!
//! let mut out = [0u8; 4];
//! driver.memcpy_dtoh(ctx, &mut out, ptr)?;
//! assert_eq!(out, [1, 2, 3, 4]);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod driver;
pub mod error;
pub mod host;

#[cfg(feature = "cuda")]
pub use backends::CudaDriver;
pub use backends::{DriverStats, HostDriver, HostKernel, KernelContext, SimulatedDevice};
pub use driver::{
    BlockDim, ComputeCapability, ContextFlags, ContextHandle, DeviceInfo, DeviceOrdinal, DevicePtr, DeviceVendor,
    Driver, FunctionHandle, GridDim, HostRegisterFlags, KernelArg, LaunchConfig, ModuleHandle, ScalarValue,
    StreamHandle,
};
pub use error::{DriverError, Result};
pub use host::{HostBuffer, HostMemory, HostPtr};
