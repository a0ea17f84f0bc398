//! Environment: the owner of every runtime resource
//!
//! [`Environment`] holds the driver, the device registry, the memory table,
//! the kernel table and the loaded modules. [`Runtime`] wraps it for callers
//! that want idempotent init/release, and [`OrAbort`] turns any error into
//! logged teardown plus process exit.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use ezcu_driver::{
    BlockDim, ContextHandle, DeviceOrdinal, Driver, GridDim, HostBuffer, HostMemory, HostPtr, ModuleHandle,
    ScalarValue,
};
use ezcu_tracing::performance::record_launch;
use ezcu_tracing::{perf_span, timed_block};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{EnvironmentConfig, TimeUnit};
use crate::error::{EzcuError, Result};
use crate::flags::{AccessMode, Flags};
use crate::kernel::{parse_kernels, Arg, KernelDescriptor, KernelSummary, KernelTable};
use crate::memory::{MemoryObject, MemorySummary, MemoryTable};
use crate::registry::{Device, DeviceRegistry, DeviceSummary};
use crate::timer::Timer;
use crate::toolchain::{check_source, output_dir, CompileRequest, Compiler, Nvcc};

#[derive(Debug, Clone, Copy)]
struct LoadedModule {
    device: DeviceOrdinal,
    ctx: ContextHandle,
    module: ModuleHandle,
}

pub struct Environment {
    driver: Arc<dyn Driver>,
    config: EnvironmentConfig,
    compiler: Box<dyn Compiler>,
    registry: DeviceRegistry,
    memory: MemoryTable,
    kernels: KernelTable,
    modules: Vec<LoadedModule>,
    timer: Timer,
}

impl Environment {
    /// Initialize with the default configuration.
    pub fn init(driver: Arc<dyn Driver>, flags: Flags) -> Result<Self> {
        Self::with_config(driver, flags, EnvironmentConfig::default())
    }

    pub fn with_config(driver: Arc<dyn Driver>, flags: Flags, config: EnvironmentConfig) -> Result<Self> {
        config.validate()?;
        let registry = DeviceRegistry::init(driver.as_ref(), flags, config.streams_per_device)?;
        info!(
            driver = driver.name(),
            version = driver.version()?,
            time_unit = %config.time_unit,
            "environment initialized"
        );
        Ok(Self {
            compiler: Box::new(Nvcc::new(config.compiler.clone())),
            timer: Timer::new(config.time_unit),
            driver,
            config,
            registry,
            memory: MemoryTable::default(),
            kernels: KernelTable::default(),
            modules: Vec::new(),
        })
    }

    /// Replace the device compiler.
    pub fn with_compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn timer(&mut self) -> &mut Timer {
        &mut self.timer
    }

    // ============================================================================================
    // Devices
    // ============================================================================================

    /// Number of native devices.
    pub fn count(&self) -> Result<u32> {
        DeviceRegistry::count(self.driver.as_ref())
    }

    pub fn has(&self) -> Result<bool> {
        DeviceRegistry::has(self.driver.as_ref())
    }

    /// Resolve `flags` to one opened device.
    pub fn find(&self, flags: Flags) -> Result<DeviceOrdinal> {
        let device = self.registry.find(flags)?;
        debug!(flags = %flags.device_names(), device = %device, "dev find");
        Ok(device.ordinal())
    }

    pub fn device(&self, ordinal: DeviceOrdinal) -> Result<&Device> {
        self.registry.get(ordinal)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.registry.iter()
    }

    /// Block until all work queued on `device` completes.
    pub fn dev_wait(&self, device: DeviceOrdinal) -> Result<()> {
        self.registry.get(device)?.wait(self.driver.as_ref())
    }

    pub fn arch_options(&self) -> &str {
        self.registry.arch_options()
    }

    // ============================================================================================
    // Kernel sources
    // ============================================================================================

    /// Compile a `.cu` source, load it on every opened device and register its kernels.
    ///
    /// Returns the names of newly registered kernels. Names already known
    /// keep their existing descriptor.
    pub fn load(&mut self, path: impl AsRef<Path>, options: &str) -> Result<Vec<String>> {
        let path = path.as_ref();
        check_source(path)?;
        let _span = perf_span!("kernel_source_load");
        debug!(path = %path.display(), options, "start load file");

        let dir = output_dir(path);
        let binary = self.compiler.compile(&CompileRequest {
            source: path,
            output_dir: &dir,
            arch_options: self.registry.arch_options(),
            options,
        })?;

        let source = fs::read_to_string(path).map_err(|source| EzcuError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut descriptors: Vec<KernelDescriptor> = parse_kernels(&source)?
            .into_iter()
            .filter(|signature| !self.kernels.contains(&signature.name))
            .map(KernelDescriptor::new)
            .collect();

        let driver = self.driver.as_ref();
        for device in self.registry.iter() {
            let ctx = device.context();
            let module = driver.module_load(ctx, &binary)?;
            self.modules.push(LoadedModule {
                device: device.ordinal(),
                ctx,
                module,
            });
            for descriptor in &mut descriptors {
                let function = driver.module_function(ctx, module, descriptor.name())?;
                descriptor.add_function(device.ordinal(), function);
            }
        }

        let names: Vec<String> = descriptors.iter().map(|d| d.name().to_string()).collect();
        for descriptor in descriptors {
            self.kernels.insert(descriptor);
        }
        debug!(path = %path.display(), binary = %binary.display(), kernels = ?names, "end load file");
        Ok(names)
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    /// Wrap the whole of `buffer` for use on `device`.
    pub fn wrap<T: Pod + Send + Sync + 'static>(
        &mut self,
        device: DeviceOrdinal,
        buffer: &HostBuffer<T>,
        flags: Flags,
    ) -> Result<HostPtr> {
        self.wrap_count(device, buffer, buffer.len(), flags)
    }

    /// Wrap the first `count` elements of `buffer`.
    pub fn wrap_count<T: Pod + Send + Sync + 'static>(
        &mut self,
        device: DeviceOrdinal,
        buffer: &HostBuffer<T>,
        count: usize,
        flags: Flags,
    ) -> Result<HostPtr> {
        self.wrap_memory(device, buffer.as_host_memory(), count, flags)
    }

    pub fn wrap_memory(
        &mut self,
        device: DeviceOrdinal,
        host: Arc<dyn HostMemory>,
        count: usize,
        flags: Flags,
    ) -> Result<HostPtr> {
        let device = self.registry.get(device)?;
        self.memory.wrap(self.driver.as_ref(), device, host, count, flags)
    }

    /// Make the host copy of `ptr` current for `access`.
    pub fn update(&mut self, ptr: HostPtr, access: AccessMode) -> Result<()> {
        self.memory.update(self.driver.as_ref(), ptr, access)
    }

    /// Drop one reference to `ptr`. Objects still bound to a kernel are refused.
    pub fn release_memory(&mut self, ptr: HostPtr) -> Result<()> {
        let kernels = self.kernels.binding(ptr);
        if !kernels.is_empty() {
            return Err(EzcuError::MemoryInUse { ptr, kernels });
        }
        self.memory.release(self.driver.as_ref(), ptr)?;
        Ok(())
    }

    pub fn memory(&self, ptr: HostPtr) -> Result<&MemoryObject> {
        self.memory.get(ptr)
    }

    pub fn mem_count(&self) -> usize {
        self.memory.len()
    }

    // ============================================================================================
    // Kernel configuration
    // ============================================================================================

    pub fn kernel(&self, name: &str) -> Result<&KernelDescriptor> {
        self.kernels.get(name)
    }

    pub fn knl_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn set_wrk(&mut self, name: &str, grid: impl Into<GridDim>, block: impl Into<BlockDim>) -> Result<()> {
        self.kernels.set_wrk(name, grid.into(), block.into())
    }

    pub fn set_shared(&mut self, name: &str, bytes: u32) -> Result<()> {
        self.kernels.set_shared(name, bytes)
    }

    pub fn set_scalar(&mut self, name: &str, index: usize, value: impl Into<ScalarValue>) -> Result<()> {
        self.kernels.set_scalar(name, index, value)
    }

    pub fn set_char(&mut self, name: &str, index: usize, value: i8) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_short(&mut self, name: &str, index: usize, value: i16) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_int32(&mut self, name: &str, index: usize, value: i32) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_uint32(&mut self, name: &str, index: usize, value: u32) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_int64(&mut self, name: &str, index: usize, value: i64) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_uint64(&mut self, name: &str, index: usize, value: u64) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_size_t(&mut self, name: &str, index: usize, value: usize) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_float(&mut self, name: &str, index: usize, value: f32) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_double(&mut self, name: &str, index: usize, value: f64) -> Result<()> {
        self.set_scalar(name, index, value)
    }

    pub fn set_mem(&mut self, name: &str, index: usize, ptr: HostPtr) -> Result<()> {
        self.kernels
            .set_mem(&mut self.memory, self.driver.as_ref(), name, index, ptr)
    }

    pub fn set_args(&mut self, name: &str, args: &[Arg]) -> Result<()> {
        self.kernels
            .set_args(&mut self.memory, self.driver.as_ref(), name, args)
    }

    // ============================================================================================
    // Launches
    // ============================================================================================

    /// Launch `name` on `device` without waiting for completion.
    pub fn exec(&mut self, name: &str, device: DeviceOrdinal) -> Result<()> {
        self.launch(name, device, false)
    }

    /// Launch `name` on `device` and wait for the device to finish.
    pub fn sync_exec(&mut self, name: &str, device: DeviceOrdinal) -> Result<()> {
        self.launch(name, device, true)
    }

    /// Synchronous launch returning the elapsed time in the configured unit.
    pub fn timed_exec(&mut self, name: &str, device: DeviceOrdinal) -> Result<f64> {
        self.timer.tick();
        let launched = self.launch(name, device, true);
        let elapsed = self.timer.read()?;
        launched.map(|()| elapsed)
    }

    /// Rebind every argument, then [`Environment::exec`].
    pub fn run(&mut self, name: &str, device: DeviceOrdinal, args: &[Arg]) -> Result<()> {
        self.set_args(name, args)?;
        self.exec(name, device)
    }

    pub fn sync_run(&mut self, name: &str, device: DeviceOrdinal, args: &[Arg]) -> Result<()> {
        self.set_args(name, args)?;
        self.sync_exec(name, device)
    }

    pub fn timed_run(&mut self, name: &str, device: DeviceOrdinal, args: &[Arg]) -> Result<f64> {
        self.set_args(name, args)?;
        self.timed_exec(name, device)
    }

    /// Upload host-dirty arguments, launch on the compute stream, then mark
    /// writable arguments device-dirty.
    fn launch(&mut self, name: &str, device: DeviceOrdinal, synchronous: bool) -> Result<()> {
        let driver = self.driver.as_ref();
        let target = self.registry.get(device)?;
        let kernel = self.kernels.get(name)?;
        let function = kernel.function(device)?;
        let args = kernel.launch_args(&self.memory, device)?;
        let bound: Vec<HostPtr> = kernel.bound_memory().map(|(_, ptr)| ptr).collect();
        let config = *kernel.config();
        let ctx = target.context();
        debug!(kernel = name, %device, %config, synchronous, "start exec");

        let mut copied = false;
        for ptr in &bound {
            copied |= self.memory.sync_to_device(driver, *ptr)?;
        }
        if copied {
            driver.stream_synchronize(ctx, target.transfer_stream())?;
        }

        let ((), duration_us) = timed_block!("kernel_launch", {
            driver.launch(ctx, function, &config, Some(target.compute_stream()), &args)?;
            if synchronous {
                driver.context_synchronize(ctx)?;
            }
        });
        record_launch(name, config.total_threads(), duration_us, synchronous);

        for ptr in bound {
            self.memory.touch(ptr)?;
        }
        debug!(kernel = name, %device, "end exec");
        Ok(())
    }

    // ============================================================================================
    // Reporting
    // ============================================================================================

    pub fn report(&self) -> Result<EnvironmentReport> {
        Ok(EnvironmentReport {
            driver: self.driver.name().to_string(),
            driver_version: self.driver.version()?,
            time_unit: self.config.time_unit,
            arch_options: self.registry.arch_options().trim().to_string(),
            devices: self.registry.iter().map(Device::summary).collect(),
            memory: self.memory.iter().map(MemoryObject::summary).collect(),
            kernels: self.kernels.iter().map(KernelDescriptor::summary).collect(),
        })
    }

    pub fn report_json(&self) -> Result<String> {
        let report = self.report()?;
        serde_json::to_string_pretty(&report)
            .map_err(|err| EzcuError::InvalidConfig(format!("report serialization: {err}")))
    }

    /// Log devices, memory objects and kernels.
    pub fn info(&self) -> Result<()> {
        let report = self.report()?;
        info!(driver = %report.driver, version = report.driver_version, "ezcu environment");
        for device in &report.devices {
            info!("{device}");
        }
        for object in self.memory.iter() {
            info!("mem {object}");
        }
        for kernel in self.kernels.iter() {
            info!("knl {kernel}");
        }
        Ok(())
    }

    // ============================================================================================
    // Teardown
    // ============================================================================================

    /// Release kernels, memory objects, modules and devices, in that order.
    ///
    /// Every step runs even if an earlier one failed; the first error is returned.
    pub fn release(mut self) -> Result<()> {
        debug!("releasing resources");
        let driver = Arc::clone(&self.driver);
        let driver = driver.as_ref();
        let mut first_error: Option<EzcuError> = None;
        let mut note = |step: &str, result: Result<()>| {
            if let Err(err) = result {
                warn!(step, error = %err, "release step failed");
                first_error.get_or_insert(err);
            }
        };

        note("kernels", self.kernels.clear(&mut self.memory, driver));
        note("memory", self.memory.clear(driver));
        for loaded in self.modules.drain(..) {
            let result = driver.module_unload(loaded.ctx, loaded.module).map_err(EzcuError::from);
            if result.is_err() {
                debug!(device = %loaded.device, module = %loaded.module, "module unload failed");
            }
            note("modules", result);
        }
        note("devices", self.registry.release(driver));

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("resources released");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("driver", &self.driver.name())
            .field("devices", &self.registry.len())
            .field("memory", &self.memory.len())
            .field("kernels", &self.kernels.len())
            .field("modules", &self.modules.len())
            .finish()
    }
}

/// Serializable snapshot of an environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub driver: String,
    pub driver_version: u32,
    pub time_unit: TimeUnit,
    pub arch_options: String,
    pub devices: Vec<DeviceSummary>,
    pub memory: Vec<MemorySummary>,
    pub kernels: Vec<KernelSummary>,
}

// ================================================================================================
// Runtime
// ================================================================================================

/// Holder giving idempotent init and release around an [`Environment`].
#[derive(Debug, Default)]
pub struct Runtime {
    env: Option<Environment>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize once; later calls return the existing environment.
    pub fn init(&mut self, driver: Arc<dyn Driver>, flags: Flags) -> Result<&mut Environment> {
        self.init_with(driver, flags, EnvironmentConfig::default())
    }

    pub fn init_with(
        &mut self,
        driver: Arc<dyn Driver>,
        flags: Flags,
        config: EnvironmentConfig,
    ) -> Result<&mut Environment> {
        if self.env.is_none() {
            self.env = Some(Environment::with_config(driver, flags, config)?);
        } else {
            debug!("environment already initialized");
        }
        self.env.as_mut().ok_or(EzcuError::NotInitialized)
    }

    pub fn env(&mut self) -> Result<&mut Environment> {
        self.env.as_mut().ok_or(EzcuError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.env.is_some()
    }

    /// Release the environment if present. Safe to call repeatedly.
    pub fn release(&mut self) -> Result<()> {
        match self.env.take() {
            Some(env) => env.release(),
            None => Ok(()),
        }
    }
}

/// Fail-fast handling for `Result`s at the application boundary.
pub trait OrAbort<T> {
    /// Unwrap, or log the error, release `runtime` and exit with status 1.
    fn or_abort(self, runtime: &mut Runtime) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    #[track_caller]
    fn or_abort(self, runtime: &mut Runtime) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                let location = std::panic::Location::caller();
                error!(
                    category = ?err.category(),
                    file = location.file(),
                    line = location.line(),
                    "{err}"
                );
                if let Err(teardown) = runtime.release() {
                    error!(error = %teardown, "teardown after fatal error failed");
                }
                std::process::exit(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ezcu_driver::{ComputeCapability, HostDriver, SimulatedDevice};

    fn driver() -> Arc<HostDriver> {
        Arc::new(HostDriver::new(vec![
            SimulatedDevice::new("sim0", ComputeCapability::new(3, 5)),
            SimulatedDevice::new("sim1", ComputeCapability::new(6, 0)),
        ]))
    }

    #[test]
    fn test_runtime_init_is_idempotent() {
        let driver = driver();
        let mut runtime = Runtime::new();
        assert!(matches!(runtime.env(), Err(EzcuError::NotInitialized)));

        runtime.init(driver.clone(), Flags::GPU).unwrap();
        runtime.init(driver.clone(), Flags::DEFAULT).unwrap();
        assert_eq!(driver.stats().live_contexts, 2);

        runtime.release().unwrap();
        runtime.release().unwrap();
        assert!(!runtime.is_initialized());
        assert_eq!(driver.stats().live_contexts, 0);
    }

    #[test]
    fn test_invalid_stream_count() {
        let config = EnvironmentConfig::default().with_streams_per_device(1);
        let err = Environment::with_config(driver(), Flags::DEFAULT, config).unwrap_err();
        assert!(matches!(err, EzcuError::InvalidConfig(_)));
    }

    #[test]
    fn test_find_and_wait() {
        let env = Environment::init(driver(), Flags::GPU).unwrap();
        let second = env.find(Flags::GPU | Flags::SECOND).unwrap();
        assert_eq!(second, DeviceOrdinal(1));
        env.dev_wait(second).unwrap();
        assert_eq!(env.count().unwrap(), 2);
        assert!(env.has().unwrap());
        env.release().unwrap();
    }

    #[test]
    fn test_release_memory_refuses_unknown() {
        let mut env = Environment::init(driver(), Flags::DEFAULT).unwrap();
        let err = env.release_memory(HostPtr(0x42)).unwrap_err();
        assert!(matches!(err, EzcuError::MemoryNotFound(_)));
        env.release().unwrap();
    }

    #[test]
    fn test_report_json() {
        let mut env = Environment::init(driver(), Flags::GPU).unwrap();
        let device = env.find(Flags::GPU).unwrap();
        let buffer = HostBuffer::<f64>::new(16);
        env.wrap(device, &buffer, Flags::DOUBLE | Flags::READ_ONLY).unwrap();

        let report = env.report().unwrap();
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.memory.len(), 1);
        assert_eq!(report.memory[0].bytes, 128);

        let json: serde_json::Value = serde_json::from_str(&env.report_json().unwrap()).unwrap();
        assert_eq!(json["devices"][1]["capability"], "6.0");
        assert_eq!(json["memory"][0]["flags"], "HWA | READ_ONLY | DOUBLE");
        assert_eq!(json["time_unit"], "Milliseconds");
        env.info().unwrap();
        env.release().unwrap();
    }
}
