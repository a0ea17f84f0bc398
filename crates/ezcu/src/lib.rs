//! # ezcu
//!
//! Resource management for accelerator programs: select devices with packed
//! flags, wrap host arrays as device memory objects that stay coherent
//! through dirty bits, and bind kernel arguments by slot.
//!
//! ## Architecture
//!
//! ```text
//! Environment
//! ├── DeviceRegistry   flags -> [type][tier][slot] lookup table -> Device
//! ├── MemoryTable      host address -> MemoryObject (refs, dirty bits)
//! ├── KernelTable      name -> KernelDescriptor (types, geometry, bindings)
//! └── Compiler         .cu source -> fatbin/cubin/ptx
//!         │
//!         ▼
//!   ezcu_driver::Driver  (HostDriver, or CudaDriver with feature `cuda`)
//! ```
//!
//! Launching a kernel uploads every bound object whose host copy is newer,
//! waits for those transfers, launches on the compute stream, and marks
//! writable objects as newer on the device. [`Environment::update`] brings
//! results back before the host reads them.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use ezcu::{AccessMode, Environment, Flags};
//! use ezcu_driver::{HostBuffer, HostDriver};
//!
//! # fn main() -> ezcu::Result<()> {
//! let driver = Arc::new(HostDriver::default());
//! let mut env = Environment::init(driver, Flags::DEFAULT)?;
//! let device = env.find(Flags::DEFAULT)?;
//!
//! let data = HostBuffer::from_vec(vec![1.0f32; 256]);
//! let ptr = env.wrap(device, &data, Flags::READ_WRITE | Flags::FLOAT)?;
//! assert_eq!(env.mem_count(), 1);
//!
//! env.update(ptr, AccessMode::ReadOnly)?;
//! env.release()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod environment;
pub mod error;
pub mod flags;
pub mod kernel;
pub mod memory;
pub mod registry;
pub mod timer;
pub mod toolchain;

pub use config::{CompilerConfig, EnvironmentConfig, TimeUnit};
pub use environment::{Environment, EnvironmentReport, OrAbort, Runtime};
pub use error::{ErrorCategory, EzcuError, Result};
pub use flags::{
    AccessMode, Category, DeviceIndex, DeviceQuery, DeviceType, ElementType, FlagValue, Flags, MemLocation,
    MemProperty, MemoryFlags, Tier, Vendor,
};
pub use kernel::{Arg, ArgType, KernelDescriptor, KernelSignature, KernelTable};
pub use memory::{MemoryObject, MemoryTable};
pub use registry::{Device, DeviceRegistry, LookupTable};
pub use timer::Timer;
pub use toolchain::{CompileRequest, Compiler, Nvcc};
