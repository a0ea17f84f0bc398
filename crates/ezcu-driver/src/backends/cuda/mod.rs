//! CUDA driver backed by the native driver API
//!
//! Thin layer over `cudarc::driver::sys`. Handles carry the raw driver
//! pointers, and every call that needs a context pushes it for the duration
//! of the call.
//!
//! ```rust,ignore
//! use ezcu_driver::{CudaDriver, Driver};
//!
//! let driver = CudaDriver::new()?;
//! driver.init()?;
//! println!("{} device(s)", driver.device_count()?);
//! ```

#[cfg(feature = "cuda")]
use std::ffi::{c_void, CStr, CString};
#[cfg(feature = "cuda")]
use std::path::Path;
#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::sys;

#[cfg(feature = "cuda")]
use crate::driver::{
    ComputeCapability, ContextFlags, ContextHandle, DeviceInfo, DeviceOrdinal, DevicePtr, DeviceVendor, Driver,
    FunctionHandle, HostRegisterFlags, KernelArg, LaunchConfig, ModuleHandle, StreamHandle,
};
#[cfg(feature = "cuda")]
use crate::error::{DriverError, Result};
#[cfg(feature = "cuda")]
use crate::host::HostMemory;

/// Convert a driver status code into a [`DriverError`].
#[cfg(feature = "cuda")]
fn check(call: &'static str, status: sys::CUresult) -> Result<()> {
    if status == sys::CUresult::CUDA_SUCCESS {
        return Ok(());
    }

    let mut name_ptr: *const std::os::raw::c_char = std::ptr::null();
    let mut message_ptr: *const std::os::raw::c_char = std::ptr::null();
    // SAFETY: both calls only write a pointer to a static string
    let (name, message) = unsafe {
        sys::lib().cuGetErrorName(status, &mut name_ptr);
        sys::lib().cuGetErrorString(status, &mut message_ptr);
        (c_string(name_ptr), c_string(message_ptr))
    };

    Err(DriverError::Native {
        call,
        name: name.unwrap_or_else(|| format!("{status:?}")),
        message: message.unwrap_or_else(|| "unknown error".to_string()),
    })
}

/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
#[cfg(feature = "cuda")]
unsafe fn c_string(ptr: *const std::os::raw::c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

#[cfg(feature = "cuda")]
fn raw_context(ctx: ContextHandle) -> sys::CUcontext {
    ctx.id() as usize as sys::CUcontext
}

#[cfg(feature = "cuda")]
fn raw_stream(stream: Option<StreamHandle>) -> sys::CUstream {
    stream.map_or(std::ptr::null_mut(), |s| s.id() as usize as sys::CUstream)
}

/// Accelerator driver for NVIDIA GPUs
#[cfg(feature = "cuda")]
pub struct CudaDriver {
    _private: (),
}

#[cfg(feature = "cuda")]
impl CudaDriver {
    /// Load the driver library.
    ///
    /// # Errors
    ///
    /// Returns an error if the CUDA driver library cannot be loaded.
    pub fn new() -> Result<Self> {
        std::panic::catch_unwind(sys::lib)
            .map_err(|_| DriverError::Unsupported("CUDA driver library not available".to_string()))?;
        Ok(Self { _private: () })
    }

    /// Check if a CUDA device is available on this system
    pub fn is_available() -> bool {
        match Self::new() {
            Ok(driver) => driver.init().and_then(|_| driver.device_count()).is_ok_and(|n| n > 0),
            Err(_) => false,
        }
    }

    /// Run `f` with `ctx` current on the calling thread.
    fn with_context<T>(&self, ctx: ContextHandle, f: impl FnOnce() -> Result<T>) -> Result<T> {
        // SAFETY: the handle was produced by `context_create`
        check("cuCtxPushCurrent", unsafe { sys::lib().cuCtxPushCurrent_v2(raw_context(ctx)) })?;
        let result = f();
        let mut popped: sys::CUcontext = std::ptr::null_mut();
        // SAFETY: pops the context pushed above
        let pop = check("cuCtxPopCurrent", unsafe { sys::lib().cuCtxPopCurrent_v2(&mut popped) });
        let value = result?;
        pop?;
        Ok(value)
    }

    fn device(&self, ordinal: DeviceOrdinal) -> Result<sys::CUdevice> {
        let mut device: sys::CUdevice = 0;
        // SAFETY: writes one device handle
        check("cuDeviceGet", unsafe { sys::lib().cuDeviceGet(&mut device, ordinal.0 as i32) })?;
        Ok(device)
    }

    fn attribute(&self, device: sys::CUdevice, attribute: sys::CUdevice_attribute) -> Result<i32> {
        let mut value = 0;
        // SAFETY: writes one integer
        check("cuDeviceGetAttribute", unsafe {
            sys::lib().cuDeviceGetAttribute(&mut value, attribute, device)
        })?;
        Ok(value)
    }
}

#[cfg(feature = "cuda")]
impl Driver for CudaDriver {
    fn name(&self) -> &str {
        "cuda"
    }

    fn init(&self) -> Result<()> {
        // SAFETY: flags must be zero
        check("cuInit", unsafe { sys::lib().cuInit(0) })
    }

    fn version(&self) -> Result<u32> {
        let mut version = 0;
        // SAFETY: writes one integer
        check("cuDriverGetVersion", unsafe { sys::lib().cuDriverGetVersion(&mut version) })?;
        Ok(version as u32)
    }

    // ============================================================================================
    // Devices
    // ============================================================================================

    fn device_count(&self) -> Result<u32> {
        let mut count = 0;
        // SAFETY: writes one integer
        check("cuDeviceGetCount", unsafe { sys::lib().cuDeviceGetCount(&mut count) })?;
        Ok(count as u32)
    }

    fn device_info(&self, ordinal: DeviceOrdinal) -> Result<DeviceInfo> {
        use sys::CUdevice_attribute as Attr;

        let device = self.device(ordinal)?;

        let mut name = [0 as std::os::raw::c_char; 256];
        // SAFETY: the buffer length is passed alongside the buffer
        check("cuDeviceGetName", unsafe {
            sys::lib().cuDeviceGetName(name.as_mut_ptr(), name.len() as i32, device)
        })?;
        // SAFETY: the driver NUL-terminates the name within the buffer
        let name = unsafe { c_string(name.as_ptr()) }.unwrap_or_default();

        let mut total_memory = 0usize;
        // SAFETY: writes one size
        check("cuDeviceTotalMem", unsafe {
            sys::lib().cuDeviceTotalMem_v2(&mut total_memory, device)
        })?;

        let major = self.attribute(device, Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = self.attribute(device, Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;

        Ok(DeviceInfo {
            ordinal,
            name,
            vendor: DeviceVendor::Nvidia,
            capability: ComputeCapability::new(major as u32, minor as u32),
            multiprocessor_count: self.attribute(device, Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)? as u32,
            total_memory,
            clock_rate_khz: self.attribute(device, Attr::CU_DEVICE_ATTRIBUTE_CLOCK_RATE)? as u32,
            can_map_host_memory: self.attribute(device, Attr::CU_DEVICE_ATTRIBUTE_CAN_MAP_HOST_MEMORY)? != 0,
        })
    }

    // ============================================================================================
    // Contexts and Streams
    // ============================================================================================

    fn context_create(&self, ordinal: DeviceOrdinal, flags: ContextFlags) -> Result<ContextHandle> {
        let device = self.device(ordinal)?;
        let mut ctx: sys::CUcontext = std::ptr::null_mut();
        // SAFETY: writes one context handle; the new context becomes current
        check("cuCtxCreate", unsafe { sys::lib().cuCtxCreate_v2(&mut ctx, flags.0, device) })?;
        let mut popped: sys::CUcontext = std::ptr::null_mut();
        // SAFETY: leave the calling thread's context stack as it was
        check("cuCtxPopCurrent", unsafe { sys::lib().cuCtxPopCurrent_v2(&mut popped) })?;
        Ok(ContextHandle::new(ctx as usize as u64))
    }

    fn context_synchronize(&self, ctx: ContextHandle) -> Result<()> {
        // SAFETY: context is current inside the closure
        self.with_context(ctx, || check("cuCtxSynchronize", unsafe { sys::lib().cuCtxSynchronize() }))
    }

    fn context_destroy(&self, ctx: ContextHandle) -> Result<()> {
        // SAFETY: the handle was produced by `context_create`
        check("cuCtxDestroy", unsafe { sys::lib().cuCtxDestroy_v2(raw_context(ctx)) })
    }

    fn stream_create(&self, ctx: ContextHandle) -> Result<StreamHandle> {
        self.with_context(ctx, || {
            let mut stream: sys::CUstream = std::ptr::null_mut();
            // SAFETY: writes one stream handle
            check("cuStreamCreate", unsafe { sys::lib().cuStreamCreate(&mut stream, 0) })?;
            Ok(StreamHandle::new(stream as usize as u64))
        })
    }

    fn stream_synchronize(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<()> {
        self.with_context(ctx, || {
            // SAFETY: the handle was produced by `stream_create`
            check("cuStreamSynchronize", unsafe {
                sys::lib().cuStreamSynchronize(raw_stream(Some(stream)))
            })
        })
    }

    fn stream_destroy(&self, ctx: ContextHandle, stream: StreamHandle) -> Result<()> {
        self.with_context(ctx, || {
            // SAFETY: the handle was produced by `stream_create`
            check("cuStreamDestroy", unsafe {
                sys::lib().cuStreamDestroy_v2(raw_stream(Some(stream)))
            })
        })
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    fn mem_alloc(&self, ctx: ContextHandle, size: usize) -> Result<DevicePtr> {
        self.with_context(ctx, || {
            let mut ptr: sys::CUdeviceptr = 0;
            // SAFETY: writes one device pointer
            check("cuMemAlloc", unsafe { sys::lib().cuMemAlloc_v2(&mut ptr, size) })?;
            Ok(DevicePtr::new(ptr as u64))
        })
    }

    fn mem_free(&self, ctx: ContextHandle, ptr: DevicePtr) -> Result<()> {
        self.with_context(ctx, || {
            // SAFETY: the pointer was produced by `mem_alloc`
            check("cuMemFree", unsafe { sys::lib().cuMemFree_v2(ptr.id() as sys::CUdeviceptr) })
        })
    }

    fn host_register(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>, flags: HostRegisterFlags) -> Result<()> {
        let base = host.bytes_mut().as_mut_ptr() as *mut c_void;
        let len = host.byte_len();
        self.with_context(ctx, || {
            // SAFETY: `base..base+len` stays allocated while `host` is alive,
            // and the caller unregisters before dropping it
            check("cuMemHostRegister", unsafe {
                sys::lib().cuMemHostRegister_v2(base, len, flags.0)
            })
        })
    }

    fn host_unregister(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>) -> Result<()> {
        let base = host.bytes_mut().as_mut_ptr() as *mut c_void;
        self.with_context(ctx, || {
            // SAFETY: `base` was registered by `host_register`
            check("cuMemHostUnregister", unsafe { sys::lib().cuMemHostUnregister(base) })
        })
    }

    fn host_device_pointer(&self, ctx: ContextHandle, host: &Arc<dyn HostMemory>) -> Result<DevicePtr> {
        let base = host.bytes_mut().as_mut_ptr() as *mut c_void;
        self.with_context(ctx, || {
            let mut ptr: sys::CUdeviceptr = 0;
            // SAFETY: writes one device pointer; flags must be zero
            check("cuMemHostGetDevicePointer", unsafe {
                sys::lib().cuMemHostGetDevicePointer_v2(&mut ptr, base, 0)
            })?;
            Ok(DevicePtr::new(ptr as u64))
        })
    }

    fn memcpy_htod(&self, ctx: ContextHandle, dst: DevicePtr, src: &[u8], stream: Option<StreamHandle>) -> Result<()> {
        self.with_context(ctx, || {
            let dst = dst.id() as sys::CUdeviceptr;
            let src_ptr = src.as_ptr() as *const c_void;
            // SAFETY: `src` is valid for `src.len()` bytes and `dst` was
            // allocated with at least that size
            match stream {
                Some(_) => check("cuMemcpyHtoDAsync", unsafe {
                    sys::lib().cuMemcpyHtoDAsync_v2(dst, src_ptr, src.len(), raw_stream(stream))
                }),
                None => check("cuMemcpyHtoD", unsafe {
                    sys::lib().cuMemcpyHtoD_v2(dst, src_ptr, src.len())
                }),
            }
        })
    }

    fn memcpy_dtoh(&self, ctx: ContextHandle, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let len = dst.len();
        let dst_ptr = dst.as_mut_ptr() as *mut c_void;
        self.with_context(ctx, || {
            // SAFETY: `dst` is valid for `len` bytes
            check("cuMemcpyDtoH", unsafe {
                sys::lib().cuMemcpyDtoH_v2(dst_ptr, src.id() as sys::CUdeviceptr, len)
            })
        })
    }

    // ============================================================================================
    // Modules and Launches
    // ============================================================================================

    fn module_load(&self, ctx: ContextHandle, path: &Path) -> Result<ModuleHandle> {
        if !path.is_file() {
            return Err(DriverError::ModuleNotFound(path.to_path_buf()));
        }
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| DriverError::ModuleNotFound(path.to_path_buf()))?;
        self.with_context(ctx, || {
            let mut module: sys::CUmodule = std::ptr::null_mut();
            // SAFETY: writes one module handle
            check("cuModuleLoad", unsafe { sys::lib().cuModuleLoad(&mut module, c_path.as_ptr()) })?;
            Ok(ModuleHandle::new(module as usize as u64))
        })
    }

    fn module_unload(&self, ctx: ContextHandle, module: ModuleHandle) -> Result<()> {
        self.with_context(ctx, || {
            // SAFETY: the handle was produced by `module_load`
            check("cuModuleUnload", unsafe {
                sys::lib().cuModuleUnload(module.id() as usize as sys::CUmodule)
            })
        })
    }

    fn module_function(&self, ctx: ContextHandle, module: ModuleHandle, name: &str) -> Result<FunctionHandle> {
        let c_name = CString::new(name).map_err(|_| DriverError::FunctionNotFound(name.to_string()))?;
        self.with_context(ctx, || {
            let mut function: sys::CUfunction = std::ptr::null_mut();
            // SAFETY: writes one function handle
            check("cuModuleGetFunction", unsafe {
                sys::lib().cuModuleGetFunction(&mut function, module.id() as usize as sys::CUmodule, c_name.as_ptr())
            })?;
            Ok(FunctionHandle::new(function as usize as u64))
        })
    }

    fn launch(
        &self,
        ctx: ContextHandle,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: Option<StreamHandle>,
        args: &[KernelArg],
    ) -> Result<()> {
        // One 8-byte slot per argument; every supported argument fits.
        let mut slots: Vec<u64> = args
            .iter()
            .map(|arg| {
                let mut slot = [0u8; 8];
                let bytes = arg.as_bytes();
                slot[..bytes.len()].copy_from_slice(bytes);
                u64::from_ne_bytes(slot)
            })
            .collect();
        let mut params: Vec<*mut c_void> = slots.iter_mut().map(|slot| slot as *mut u64 as *mut c_void).collect();

        self.with_context(ctx, || {
            // SAFETY: `params` points into `slots`, both outlive the call
            check("cuLaunchKernel", unsafe {
                sys::lib().cuLaunchKernel(
                    function.id() as usize as sys::CUfunction,
                    config.grid.x,
                    config.grid.y,
                    config.grid.z,
                    config.block.x,
                    config.block.y,
                    config.block.z,
                    config.shared_memory_bytes,
                    raw_stream(stream),
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            })
        })
    }
}
