//! Driver trait for accelerator access
//!
//! Everything the resource layer needs from a native accelerator driver, as
//! one object-safe trait. The layer above never talks to hardware directly.

use std::path::Path;
use std::sync::Arc;

use super::types::{
    ContextFlags, ContextHandle, DeviceInfo, DeviceOrdinal, DevicePtr, FunctionHandle, HostRegisterFlags, KernelArg,
    LaunchConfig, ModuleHandle, StreamHandle,
};
use crate::error::Result;
use crate::host::HostMemory;

/// Native accelerator driver
///
/// # Architecture
///
/// ```text
/// ┌──────────────────────────────────────────────┐
/// │                 Driver Trait                  │
/// │  - device enumeration and properties         │
/// │  - contexts and streams                      │
/// │  - device memory, host registration, copies  │
/// │  - modules, functions and launches           │
/// └──────────────────────┬───────────────────────┘
///                        │
///              ┌─────────┴─────────┐
///              ▼                   ▼
///        ┌───────────┐       ┌───────────┐
///        │   Host    │       │   CUDA    │
///        │  Driver   │       │  Driver   │
///        └───────────┘       └───────────┘
/// ```
///
/// Every call that touches device state takes the owning context; the
/// driver makes it current for the duration of the call.
pub trait Driver: Send + Sync {
    /// Driver name for logs and reports.
    fn name(&self) -> &str;

    /// Initialize the driver. Must be called before anything else.
    fn init(&self) -> Result<()>;

    /// Driver version as `major * 1000 + minor * 10`.
    fn version(&self) -> Result<u32>;

    // ============================================================================================
    // Devices
    // ============================================================================================

    fn device_count(&self) -> Result<u32>;

    fn device_info(&self, ordinal: DeviceOrdinal) -> Result<DeviceInfo>;

    // ============================================================================================
    // Contexts and Streams
    // ============================================================================================

    fn context_create(&self, ordinal: DeviceOrdinal, flags: ContextFlags) -> Result<ContextHandle>;

    /// Block until all work submitted to the context has completed.
    fn context_synchronize(&self, ctx: ContextHandle) -> Result<()>;

    fn context_destroy(&self, ctx: ContextHandle) -> Result<()>;

    fn stream_create(&self, ctx: ContextHandle) -> Result<StreamHandle>;

    fn stream_synchronize(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<()>;

    fn stream_destroy(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<()>;

    // ============================================================================================
    // Memory
    // ============================================================================================

    fn mem_alloc(&self, ctx: ContextHandle, size: usize) -> Result<DevicePtr>;

    fn mem_free(&self, ctx: ContextHandle, ptr: DevicePtr) -> Result<()>;

    /// Page-lock a host array. With [`HostRegisterFlags::DEVICE_MAP`] the
    /// array also becomes addressable from the device.
    fn host_register(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>, flags: HostRegisterFlags) -> Result<()>;

    fn host_unregister(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>) -> Result<()>;

    /// Device-side address of a host array registered with device mapping.
    fn host_device_pointer(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>) -> Result<DevicePtr>;

    /// Copy host bytes to device memory. Blocking when `stream` is `None`,
    /// otherwise queued on the stream.
    fn memcpy_htod(&self, ctx: ContextHandle, dst: DevicePtr, src: &[u8], stream: Option<StreamHandle>) -> Result<()>;

    /// Blocking copy from device memory into host bytes.
    fn memcpy_dtoh(&self, ctx: ContextHandle, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    // ============================================================================================
    // Modules and Launches
    // ============================================================================================

    /// Load a compiled binary (fatbin, cubin or ptx) into the context.
    fn module_load(&self, ctx: ContextHandle, path: &Path) -> Result<ModuleHandle>;

    fn module_unload(&self, ctx: ContextHandle, module: ModuleHandle) -> Result<()>;

    fn module_function(&self, ctx: ContextHandle, module: ModuleHandle, name: &str) -> Result<FunctionHandle>;

    /// Queue a kernel launch. Returns once the launch is submitted.
    fn launch(
        &self,
        ctx: ContextHandle,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: Option<StreamHandle>,
        args: &[KernelArg],
    ) -> Result<()>;
}
