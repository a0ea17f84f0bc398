//! Shared fixtures for ezcu integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ezcu::toolchain::find_binary;
use ezcu::{CompileRequest, Compiler, EzcuError, Result};
use ezcu_driver::{ComputeCapability, HostDriver, KernelContext, SimulatedDevice};

pub const KERNELS_CU: &str = r#"
extern "C" __global__ void copy(const float *a, float *b, const int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) { b[i] = a[i]; }
}

extern "C" __global__ void scale(float *x, const float alpha, const int n) {
    int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) { x[i] *= alpha; }
}
"#;

/// `b[i] = a[i]` for the first `n` elements.
pub fn copy_kernel(ctx: &mut KernelContext<'_>) -> ezcu_driver::Result<()> {
    let n = ctx.scalar(2)?.as_i64().unwrap_or(0) as usize;
    let a: Vec<f32> = ctx.read(0)?;
    let n = n.min(a.len());
    ctx.write(1, &a[..n])
}

/// `x[i] *= alpha` for the first `n` elements.
pub fn scale_kernel(ctx: &mut KernelContext<'_>) -> ezcu_driver::Result<()> {
    let alpha = ctx.scalar(1)?.as_f64() as f32;
    let n = ctx.scalar(2)?.as_i64().unwrap_or(0) as usize;
    let mut x: Vec<f32> = ctx.read(0)?;
    for value in x.iter_mut().take(n) {
        *value *= alpha;
    }
    ctx.write(0, &x)
}

/// Simulated driver with `capabilities.len()` devices and the test kernels registered.
pub fn driver_with(capabilities: &[(u32, u32)]) -> Arc<HostDriver> {
    ezcu_tracing::init_test_tracing();
    let devices = capabilities
        .iter()
        .enumerate()
        .map(|(i, (major, minor))| SimulatedDevice::new(format!("sim{i}"), ComputeCapability::new(*major, *minor)))
        .collect();
    let driver = HostDriver::new(devices);
    driver.register_kernel("copy", copy_kernel);
    driver.register_kernel("scale", scale_kernel);
    Arc::new(driver)
}

pub fn driver() -> Arc<HostDriver> {
    driver_with(&[(3, 5)])
}

/// Compiler that writes a placeholder binary next to the source.
#[derive(Debug, Default, Clone)]
pub struct StubCompiler {
    pub extension: &'static str,
    pub calls: Arc<AtomicUsize>,
    pub fail: bool,
}

impl StubCompiler {
    pub fn new() -> Self {
        Self {
            extension: "fatbin",
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Compiler for StubCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EzcuError::CompilerFailed {
                command: format!("stub {}", request.source.display()),
                status: "exit status: 1".to_string(),
                stderr: "error: expected a ';'".to_string(),
            });
        }
        let stem = request.source.file_stem().unwrap_or_default();
        let binary = request.output_dir.join(stem).with_extension(self.extension);
        fs::write(&binary, request.arch_options).map_err(|source| EzcuError::Io {
            path: binary.clone(),
            source,
        })?;
        find_binary(request.source, request.output_dir)
    }
}

/// Write `contents` to `<dir>/<name>` and return the path.
pub fn write_source(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write kernel source");
    path
}
