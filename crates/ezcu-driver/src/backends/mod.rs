//! Driver implementations
//!
//! - [`HostDriver`]: in-process simulation, always available
//! - [`CudaDriver`]: NVIDIA driver API (feature `cuda`)

pub mod cuda;
pub mod host;

#[cfg(feature = "cuda")]
pub use cuda::CudaDriver;
pub use host::{DriverStats, HostDriver, HostKernel, KernelContext, SimulatedDevice};
