//! Environment benchmarks on the simulated driver
//!
//! - Flag decoding for device and memory words
//! - Registry construction and teardown
//! - Wrap, host write, launch and update cycles

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ezcu::toolchain::find_binary;
use ezcu::{
    AccessMode, Arg, CompileRequest, Compiler, DeviceQuery, DeviceRegistry, Environment, EzcuError, Flags, MemoryFlags,
};
use ezcu_driver::{ComputeCapability, HostBuffer, HostDriver, KernelContext, SimulatedDevice};

const CAPABILITIES: [(u32, u32); 4] = [(3, 5), (5, 0), (6, 1), (7, 0)];

const SOURCE: &str = "__global__ void scale(float *x, const float alpha, const int n) {}";

struct PlaceholderCompiler;

impl Compiler for PlaceholderCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> ezcu::Result<PathBuf> {
        let binary = request.output_dir.join("scale.fatbin");
        fs::write(&binary, b"fatbin").map_err(|source| EzcuError::Io { path: binary, source })?;
        find_binary(request.source, request.output_dir)
    }
}

fn scale_kernel(ctx: &mut KernelContext<'_>) -> ezcu_driver::Result<()> {
    let alpha = ctx.scalar(1)?.as_f64() as f32;
    let mut x: Vec<f32> = ctx.read(0)?;
    x.iter_mut().for_each(|v| *v *= alpha);
    ctx.write(0, &x)
}

fn simulated(count: usize) -> HostDriver {
    let devices = (0..count)
        .map(|i| {
            let (major, minor) = CAPABILITIES[i % CAPABILITIES.len()];
            SimulatedDevice::new(format!("sim{i}"), ComputeCapability::new(major, minor))
        })
        .collect();
    let driver = HostDriver::new(devices);
    driver.register_kernel("scale", scale_kernel);
    driver
}

fn benchmark_flag_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("flag_decode");

    group.bench_function("device_query", |b| {
        let flags = Flags::NVIDIA | Flags::GPU | Flags::CC35 | Flags::SECOND;
        b.iter(|| black_box(DeviceQuery::decode(black_box(flags)).unwrap()));
    });

    group.bench_function("memory_flags", |b| {
        let flags = Flags::HOST | Flags::ZERO_COPY | Flags::READ_ONLY | Flags::DOUBLE;
        b.iter(|| black_box(MemoryFlags::decode(black_box(flags)).unwrap()));
    });

    group.bench_function("parse_names", |b| {
        b.iter(|| black_box("GPU | CC50 | THIRD".parse::<Flags>().unwrap()));
    });

    group.finish();
}

fn benchmark_registry_init(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry_init");

    for devices in [1, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(devices), &devices, |b, &n| {
            let driver = simulated(n);
            b.iter(|| {
                let registry = DeviceRegistry::init(&driver, Flags::GPU | Flags::CC60, 2).unwrap();
                black_box(registry.len());
                registry.release(&driver).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_launch_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("launch_cycle");

    for size in [1_024, 65_536] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("scale.cu");
            fs::write(&source, SOURCE).unwrap();

            let mut env = Environment::init(Arc::new(simulated(1)), Flags::DEFAULT)
                .unwrap()
                .with_compiler(PlaceholderCompiler);
            env.load(&source, "").unwrap();
            let device = env.find(Flags::DEFAULT).unwrap();

            let data = HostBuffer::from_vec(vec![1.0f32; n]);
            let ptr = env.wrap(device, &data, Flags::READ_WRITE | Flags::FLOAT).unwrap();
            let args: [Arg; 3] = [ptr.into(), 1.0f32.into(), (n as i32).into()];

            b.iter(|| {
                env.update(ptr, AccessMode::ReadWrite).unwrap();
                env.sync_run("scale", device, &args).unwrap();
                black_box(env.memory(ptr).unwrap().is_device_dirty());
            });

            env.release().unwrap();
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_flag_decode, benchmark_registry_init, benchmark_launch_cycle);
criterion_main!(benches);
