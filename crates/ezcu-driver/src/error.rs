//! Error types for driver operations

use std::path::PathBuf;

use crate::host::HostPtr;

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors reported by a driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// A native driver call returned a non-success code
    #[error("{call} failed: {name}: {message}")]
    Native {
        call: &'static str,
        name: String,
        message: String,
    },

    /// Handle not known to the driver
    #[error("invalid {kind} handle: {id:#x}")]
    InvalidHandle { kind: &'static str, id: u64 },

    /// Device ordinal outside the enumerated range
    #[error("invalid device ordinal: {0}")]
    InvalidDevice(u32),

    /// Copy larger than the destination or source allocation
    #[error("copy out of bounds: {size} bytes against an allocation of {capacity} bytes")]
    OutOfBounds { size: usize, capacity: usize },

    /// Host range registered twice
    #[error("host memory {0} is already registered")]
    AlreadyRegistered(HostPtr),

    /// Host range not registered, or registered without device mapping
    #[error("host memory {0} is not registered for device access")]
    NotRegistered(HostPtr),

    /// Binary module path does not exist
    #[error("binary module not found: {}", .0.display())]
    ModuleNotFound(PathBuf),

    /// Function name absent from a loaded module
    #[error("function '{0}' not found in module")]
    FunctionNotFound(String),

    /// Launch argument rejected by the kernel
    #[error("kernel argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },

    /// Operation not available on this driver
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Failure raised by a simulated kernel body
    #[error("kernel '{kernel}' failed: {reason}")]
    KernelFailed { kernel: String, reason: String },
}

impl DriverError {
    /// Short symbolic name of the failure, in the driver's vocabulary.
    pub fn name(&self) -> &str {
        match self {
            DriverError::Native { name, .. } => name,
            DriverError::InvalidHandle { .. } => "INVALID_HANDLE",
            DriverError::InvalidDevice(_) => "INVALID_DEVICE",
            DriverError::OutOfBounds { .. } => "INVALID_VALUE",
            DriverError::AlreadyRegistered(_) => "HOST_MEMORY_ALREADY_REGISTERED",
            DriverError::NotRegistered(_) => "HOST_MEMORY_NOT_REGISTERED",
            DriverError::ModuleNotFound(_) => "FILE_NOT_FOUND",
            DriverError::FunctionNotFound(_) => "NOT_FOUND",
            DriverError::InvalidArgument { .. } => "INVALID_VALUE",
            DriverError::Unsupported(_) => "NOT_SUPPORTED",
            DriverError::KernelFailed { .. } => "LAUNCH_FAILED",
        }
    }
}
