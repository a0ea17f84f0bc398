//! Host driver: an in-process simulation of an accelerator driver
//!
//! Devices are described up front with [`SimulatedDevice`]. Device memory is
//! ordinary heap memory, host registration and zero-copy mapping alias the
//! caller's array, and kernels are Rust closures registered by function name.
//! Work is executed eagerly, so stream and context synchronization only
//! validate their handles.
//!
//! # Usage
//!
//! ```rust
//! use ezcu_driver::{ComputeCapability, Driver, HostDriver, SimulatedDevice};
//!
//! let driver = HostDriver::new(vec![SimulatedDevice::new("sim", ComputeCapability::new(3, 5))]);
//! driver.register_kernel("noop", |_ctx| Ok(()));
//! driver.init().unwrap();
//! assert_eq!(driver.device_count().unwrap(), 1);
//! ```

mod kernel;
mod memory;

pub use kernel::{HostKernel, KernelContext};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::driver::{
    ComputeCapability, ContextFlags, ContextHandle, DeviceInfo, DeviceOrdinal, DevicePtr, DeviceVendor, Driver,
    FunctionHandle, HostRegisterFlags, KernelArg, LaunchConfig, ModuleHandle, StreamHandle,
};
use crate::error::{DriverError, Result};
use crate::host::{HostMemory, HostPtr};
use memory::{AddressSpace, Allocation};

/// Version reported by the host driver (`major * 1000 + minor * 10`).
const HOST_DRIVER_VERSION: u32 = 8000;

/// Description of one simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDevice {
    pub name: String,
    pub vendor: DeviceVendor,
    pub capability: ComputeCapability,
    pub multiprocessor_count: u32,
    pub total_memory: usize,
    pub clock_rate_khz: u32,
    pub can_map_host_memory: bool,
    /// Streams one context may hold; `None` is unlimited.
    pub max_streams: Option<usize>,
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>, capability: ComputeCapability) -> Self {
        Self {
            name: name.into(),
            vendor: DeviceVendor::Nvidia,
            capability,
            multiprocessor_count: 8,
            total_memory: 2 << 30,
            clock_rate_khz: 1_000_000,
            can_map_host_memory: true,
            max_streams: None,
        }
    }

    pub fn with_vendor(mut self, vendor: DeviceVendor) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn with_multiprocessors(mut self, count: u32) -> Self {
        self.multiprocessor_count = count;
        self
    }

    pub fn with_total_memory(mut self, bytes: usize) -> Self {
        self.total_memory = bytes;
        self
    }

    pub fn with_map_host_memory(mut self, enabled: bool) -> Self {
        self.can_map_host_memory = enabled;
        self
    }

    pub fn with_max_streams(mut self, count: usize) -> Self {
        self.max_streams = Some(count);
        self
    }
}

/// Counters describing the work a [`HostDriver`] has performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub live_contexts: usize,
    pub live_streams: usize,
    pub live_allocations: usize,
    pub live_registrations: usize,
    pub live_modules: usize,
    pub allocations: u64,
    pub frees: u64,
    pub htod_copies: u64,
    pub htod_async_copies: u64,
    pub dtoh_copies: u64,
    pub bytes_htod: u64,
    pub bytes_dtoh: u64,
    pub launches: u64,
    pub context_syncs: u64,
    pub stream_syncs: u64,
}

#[derive(Debug)]
struct ContextState {
    ordinal: DeviceOrdinal,
    flags: ContextFlags,
}

#[derive(Debug)]
struct Registration {
    flags: HostRegisterFlags,
    mapped: Option<DevicePtr>,
}

#[derive(Debug)]
struct ModuleState {
    ctx: ContextHandle,
    path: PathBuf,
}

#[derive(Debug)]
struct FunctionState {
    ctx: ContextHandle,
    name: String,
}

#[derive(Debug, Default)]
struct DriverState {
    initialized: bool,
    next_handle: u64,
    contexts: HashMap<ContextHandle, ContextState>,
    streams: HashMap<StreamHandle, ContextHandle>,
    registrations: HashMap<HostPtr, Registration>,
    modules: HashMap<ModuleHandle, ModuleState>,
    functions: HashMap<FunctionHandle, FunctionState>,
    memory: AddressSpace,
    stats: DriverStats,
}

impl DriverState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(DriverError::Native {
                call: "driver",
                name: "NOT_INITIALIZED".to_string(),
                message: "driver has not been initialized".to_string(),
            })
        }
    }

    fn context(&self, ctx: ContextHandle) -> Result<&ContextState> {
        self.ensure_initialized()?;
        self.contexts.get(&ctx).ok_or(DriverError::InvalidHandle {
            kind: "context",
            id: ctx.id(),
        })
    }

    fn stream(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<()> {
        match self.streams.get(&stream) {
            Some(owner) if *owner == ctx => Ok(()),
            _ => Err(DriverError::InvalidHandle {
                kind: "stream",
                id: stream.id(),
            }),
        }
    }
}

/// Simulated accelerator driver running entirely on the host.
pub struct HostDriver {
    devices: Vec<SimulatedDevice>,
    kernels: RwLock<HashMap<String, HostKernel>>,
    state: RwLock<DriverState>,
}

impl HostDriver {
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        Self {
            devices,
            kernels: RwLock::new(HashMap::new()),
            state: RwLock::new(DriverState::default()),
        }
    }

    /// Register the body executed when a function called `name` is launched.
    pub fn register_kernel<F>(&self, name: impl Into<String>, kernel: F)
    where
        F: Fn(&mut KernelContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels.write().insert(name.into(), Arc::new(kernel));
    }

    /// Snapshot of the work counters.
    pub fn stats(&self) -> DriverStats {
        let state = self.state.read();
        DriverStats {
            live_contexts: state.contexts.len(),
            live_streams: state.streams.len(),
            live_allocations: state.memory.owned_count(),
            live_registrations: state.registrations.len(),
            live_modules: state.modules.len(),
            ..state.stats
        }
    }

    fn device(&self, ordinal: DeviceOrdinal) -> Result<&SimulatedDevice> {
        self.devices
            .get(ordinal.index())
            .ok_or(DriverError::InvalidDevice(ordinal.0))
    }
}

impl Default for HostDriver {
    /// One capability 3.5 device.
    fn default() -> Self {
        Self::new(vec![SimulatedDevice::new("Simulated Device", ComputeCapability::new(3, 5))])
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn init(&self) -> Result<()> {
        self.state.write().initialized = true;
        tracing::debug!(devices = self.devices.len(), "host driver initialized");
        Ok(())
    }

    fn version(&self) -> Result<u32> {
        self.state.read().ensure_initialized()?;
        Ok(HOST_DRIVER_VERSION)
    }

    // ============================================================================================
    // Devices
    // ============================================================================================

    fn device_count(&self) -> Result<u32> {
        self.state.read().ensure_initialized()?;
        Ok(self.devices.len() as u32)
    }

    fn device_info(&self, ordinal: DeviceOrdinal) -> Result<DeviceInfo> {
        self.state.read().ensure_initialized()?;
        let device = self.device(ordinal)?;
        Ok(DeviceInfo {
            ordinal,
            name: device.name.clone(),
            vendor: device.vendor,
            capability: device.capability,
            multiprocessor_count: device.multiprocessor_count,
            total_memory: device.total_memory,
            clock_rate_khz: device.clock_rate_khz,
            can_map_host_memory: device.can_map_host_memory,
        })
    }

    // ============================================================================================
    // Contexts and Streams
    // ============================================================================================

    fn context_create(&self, ordinal: DeviceOrdinal, flags: ContextFlags) -> Result<ContextHandle> {
        self.device(ordinal)?;
        let mut state = self.state.write();
        state.ensure_initialized()?;
        let ctx = ContextHandle::new(state.next_handle());
        state.contexts.insert(ctx, ContextState { ordinal, flags });
        tracing::trace!(%ctx, %ordinal, flags = flags.0, "context created");
        Ok(ctx)
    }

    fn context_synchronize(&self, ctx: ContextHandle) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        state.stats.context_syncs += 1;
        Ok(())
    }

    fn context_destroy(&self, ctx: ContextHandle) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        state.contexts.remove(&ctx);
        state.streams.retain(|_, owner| *owner != ctx);
        state.modules.retain(|_, module| module.ctx != ctx);
        state.functions.retain(|_, function| function.ctx != ctx);
        let leaked = state.memory.drop_context(ctx);
        if leaked > 0 {
            tracing::warn!(%ctx, leaked, "context destroyed with live allocations");
        }
        Ok(())
    }

    fn stream_create(&self, ctx: ContextHandle) -> Result<StreamHandle> {
        let mut state = self.state.write();
        let ordinal = state.context(ctx)?.ordinal;
        if let Some(limit) = self.device(ordinal)?.max_streams {
            let held = state.streams.values().filter(|owner| **owner == ctx).count();
            if held >= limit {
                return Err(DriverError::Native {
                    call: "stream_create",
                    name: "OUT_OF_RESOURCES".to_string(),
                    message: format!("context {ctx} already holds {held} streams"),
                });
            }
        }
        let stream = StreamHandle::new(state.next_handle());
        state.streams.insert(stream, ctx);
        Ok(stream)
    }

    fn stream_synchronize(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        state.stream(ctx, stream)?;
        state.stats.stream_syncs += 1;
        Ok(())
    }

    fn stream_destroy(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        state.stream(ctx, stream)?;
        state.streams.remove(&stream);
        Ok(())
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    fn mem_alloc(&self, ctx: ContextHandle, size: usize) -> Result<DevicePtr> {
        let mut state = self.state.write();
        let ordinal = state.context(ctx)?.ordinal;
        let capacity = self.device(ordinal)?.total_memory;
        if size > capacity {
            return Err(DriverError::Native {
                call: "mem_alloc",
                name: "OUT_OF_MEMORY".to_string(),
                message: format!("{size} bytes requested on a device with {capacity} bytes"),
            });
        }
        let ptr = state.memory.insert(ctx, Allocation::Owned(vec![0; size]));
        state.stats.allocations += 1;
        Ok(ptr)
    }

    fn mem_free(&self, ctx: ContextHandle, ptr: DevicePtr) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        match state.memory.get(ptr)?.storage {
            Allocation::Owned(_) => {}
            Allocation::Mapped(_) => {
                return Err(DriverError::InvalidHandle {
                    kind: "device allocation",
                    id: ptr.id(),
                })
            }
        }
        state.memory.remove(ptr)?;
        state.stats.frees += 1;
        Ok(())
    }

    fn host_register(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>, flags: HostRegisterFlags) -> Result<()> {
        let mut state = self.state.write();
        let ordinal = state.context(ctx)?.ordinal;
        let key = host.ptr();
        if state.registrations.contains_key(&key) {
            return Err(DriverError::AlreadyRegistered(key));
        }
        let mapped = if flags.contains(HostRegisterFlags::DEVICE_MAP) {
            let context_flags = state.context(ctx)?.flags;
            if !self.device(ordinal)?.can_map_host_memory || !context_flags.contains(ContextFlags::MAP_HOST) {
                return Err(DriverError::Unsupported(format!(
                    "device {ordinal} cannot map host memory"
                )));
            }
            Some(state.memory.insert(ctx, Allocation::Mapped(Arc::clone(host))))
        } else {
            None
        };
        state.registrations.insert(key, Registration { flags, mapped });
        Ok(())
    }

    fn host_unregister(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        let key = host.ptr();
        let registration = state
            .registrations
            .remove(&key)
            .ok_or(DriverError::NotRegistered(key))?;
        if let Some(mapped) = registration.mapped {
            state.memory.remove(mapped)?;
        }
        Ok(())
    }

    fn host_device_pointer(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>) -> Result<DevicePtr> {
        let state = self.state.read();
        state.context(ctx)?;
        let key = host.ptr();
        match state.registrations.get(&key) {
            Some(Registration {
                mapped: Some(ptr),
                flags,
            }) if flags.contains(HostRegisterFlags::DEVICE_MAP) => Ok(*ptr),
            _ => Err(DriverError::NotRegistered(key)),
        }
    }

    fn memcpy_htod(&self, ctx: ContextHandle, dst: DevicePtr, src: &[u8], stream: Option<StreamHandle>) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        if let Some(stream) = stream {
            state.stream(ctx, stream)?;
        }
        state.memory.get_mut(dst)?.storage.write_from(src)?;
        state.stats.bytes_htod += src.len() as u64;
        match stream {
            Some(_) => state.stats.htod_async_copies += 1,
            None => state.stats.htod_copies += 1,
        }
        Ok(())
    }

    fn memcpy_dtoh(&self, ctx: ContextHandle, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        state.memory.get(src)?.storage.read_into(dst)?;
        state.stats.dtoh_copies += 1;
        state.stats.bytes_dtoh += dst.len() as u64;
        Ok(())
    }

    // ============================================================================================
    // Modules and Launches
    // ============================================================================================

    fn module_load(&self, ctx: ContextHandle, path: &Path) -> Result<ModuleHandle> {
        let mut state = self.state.write();
        state.context(ctx)?;
        if !path.is_file() {
            return Err(DriverError::ModuleNotFound(path.to_path_buf()));
        }
        let module = ModuleHandle::new(state.next_handle());
        state.modules.insert(
            module,
            ModuleState {
                ctx,
                path: path.to_path_buf(),
            },
        );
        Ok(module)
    }

    fn module_unload(&self, ctx: ContextHandle, module: ModuleHandle) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        match state.modules.get(&module) {
            Some(loaded) if loaded.ctx == ctx => {}
            _ => {
                return Err(DriverError::InvalidHandle {
                    kind: "module",
                    id: module.id(),
                })
            }
        }
        state.modules.remove(&module);
        Ok(())
    }

    fn module_function(&self, ctx: ContextHandle, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        let mut state = self.state.write();
        state.context(ctx)?;
        let loaded = state
            .modules
            .get(&module)
            .filter(|loaded| loaded.ctx == ctx)
            .ok_or(DriverError::InvalidHandle {
                kind: "module",
                id: module.id(),
            })?;
        if !self.kernels.read().contains_key(name) {
            tracing::debug!(module = %loaded.path.display(), name, "no host kernel registered");
            return Err(DriverError::FunctionNotFound(name.to_string()));
        }
        let function = FunctionHandle::new(state.next_handle());
        state.functions.insert(
            function,
            FunctionState {
                ctx,
                name: name.to_string(),
            },
        );
        Ok(function)
    }

    fn launch(
        &self,
        ctx: ContextHandle,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: Option<StreamHandle>,
        args: &[KernelArg],
    ) -> Result<()> {
        let mut state = self.state.write();
        state.context(ctx)?;
        if let Some(stream) = stream {
            state.stream(ctx, stream)?;
        }
        let name = match state.functions.get(&function) {
            Some(resolved) if resolved.ctx == ctx => resolved.name.clone(),
            _ => {
                return Err(DriverError::InvalidHandle {
                    kind: "function",
                    id: function.id(),
                })
            }
        };
        let kernel = self
            .kernels
            .read()
            .get(&name)
            .cloned()
            .ok_or_else(|| DriverError::FunctionNotFound(name.clone()))?;

        for (index, arg) in args.iter().enumerate() {
            if let KernelArg::Memory(ptr) = arg {
                let owner = state.memory.get(*ptr)?.ctx;
                if owner != ctx && !matches!(state.memory.get(*ptr)?.storage, Allocation::Mapped(_)) {
                    return Err(DriverError::InvalidArgument {
                        index,
                        reason: format!("{ptr} belongs to another context"),
                    });
                }
            }
        }

        state.stats.launches += 1;
        let mut kernel_ctx = KernelContext::new(&name, config, args, &mut state.memory);
        kernel(&mut kernel_ctx)
    }
}

// ================================================================================================
// Tests
// ================================================================================================
