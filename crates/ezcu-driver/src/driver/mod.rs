//! Driver abstraction
//!
//! The [`Driver`] trait and the handle and value types exchanged through it.

mod traits;
mod types;

pub use traits::Driver;
pub use types::{
    BlockDim, ComputeCapability, ContextFlags, ContextHandle, DeviceInfo, DeviceOrdinal, DevicePtr, DeviceVendor,
    FunctionHandle, GridDim, HostRegisterFlags, KernelArg, LaunchConfig, ModuleHandle, ScalarValue, StreamHandle,
};
