//! Native driver checks; each test returns early when no CUDA device is present

#![cfg(feature = "cuda")]

use std::sync::Arc;

use ezcu::{AccessMode, Environment, Flags, Result};
use ezcu_driver::{CudaDriver, HostBuffer};

fn cuda_env(flags: Flags) -> Result<Option<Environment>> {
    if !CudaDriver::is_available() {
        eprintln!("no CUDA device, skipping");
        return Ok(None);
    }
    let driver = Arc::new(CudaDriver::new()?);
    Environment::init(driver, flags).map(Some)
}

#[test]
fn test_cuda_devices_are_opened() -> Result<()> {
    let Some(env) = cuda_env(Flags::DEFAULT)? else {
        return Ok(());
    };
    assert!(env.has()?);
    let device = env.find(Flags::DEFAULT)?;
    env.dev_wait(device)?;
    let report = env.report()?;
    assert!(!report.devices.is_empty());
    assert!(report.arch_options.contains("--generate-code"));
    env.release()
}

#[test]
fn test_cuda_memory_round_trip() -> Result<()> {
    let Some(mut env) = cuda_env(Flags::DEFAULT)? else {
        return Ok(());
    };
    let device = env.find(Flags::DEFAULT)?;

    let data = HostBuffer::from_vec((0..4096).map(|i| i as f64).collect());
    let ptr = env.wrap(device, &data, Flags::PINNED | Flags::READ_WRITE | Flags::DOUBLE)?;
    assert_eq!(env.memory(ptr)?.byte_len(), 4096 * 8);

    env.update(ptr, AccessMode::ReadWrite)?;
    assert!(env.memory(ptr)?.is_host_dirty());
    env.release_memory(ptr)?;
    assert_eq!(env.mem_count(), 0);
    env.release()
}
