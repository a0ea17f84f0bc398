//! Error types for ezcu operations

use std::path::PathBuf;

use ezcu_driver::{DeviceOrdinal, DriverError, HostPtr};

use crate::flags::{Category, Flags};

/// Result type for ezcu operations
pub type Result<T> = std::result::Result<T, EzcuError>;

/// Coarse classification of an [`EzcuError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorCategory {
    /// Caller passed inconsistent flags, arguments or configuration
    InvalidConfiguration,
    /// A requested device, kernel or memory object does not exist
    NotFound,
    /// Kernel compilation or module loading failed
    Toolchain,
    /// The native driver reported a failure
    Native,
}

/// Errors that can occur in ezcu operations
#[derive(Debug, thiserror::Error)]
pub enum EzcuError {
    /// Flag word inconsistent within one category
    #[error("invalid {category} flags {flags}: {help}")]
    InvalidFlags {
        category: Category,
        flags: Flags,
        help: &'static str,
    },

    /// Flag name not recognized while parsing
    #[error("unknown flag name '{0}'")]
    UnknownFlagName(String),

    /// Installed devices from an unsupported vendor
    #[error("unsupported vendor {0}: only NVIDIA devices are handled")]
    UnsupportedVendor(String),

    /// Lookup flags name more than one device index
    #[error("ambiguous device selection {0}: name at most one device index")]
    AmbiguousDeviceIndex(Flags),

    /// Host buffer cannot be wrapped with the requested flags
    #[error("invalid memory object {ptr}: {reason}")]
    InvalidMemory { ptr: HostPtr, reason: String },

    /// Kernel argument index outside the signature
    #[error("kernel '{kernel}': argument index {index} out of range (arity {arity})")]
    ArgumentIndex { kernel: String, index: usize, arity: usize },

    /// Argument value does not match the parameter type
    #[error("kernel '{kernel}': argument {index} expects {expected}, got {actual}")]
    ArgumentType {
        kernel: String,
        index: usize,
        expected: String,
        actual: String,
    },

    /// Argument list length differs from the kernel arity
    #[error("kernel '{kernel}': expected {expected} arguments, got {actual}")]
    ArgumentCount {
        kernel: String,
        expected: usize,
        actual: usize,
    },

    /// Kernel launched with an argument slot never set
    #[error("kernel '{kernel}': argument {index} is not bound")]
    UnboundArgument { kernel: String, index: usize },

    /// Bound memory object lives on another device
    #[error("memory object {ptr} belongs to {owner}, kernel launched on {target}")]
    DeviceMismatch {
        ptr: HostPtr,
        owner: DeviceOrdinal,
        target: DeviceOrdinal,
    },

    /// Inconsistent environment or launch configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Memory object still bound to kernels
    #[error("memory object {ptr} is still bound to kernel(s): {}", .kernels.join(", "))]
    MemoryInUse { ptr: HostPtr, kernels: Vec<String> },

    /// Driver enumerated no devices
    #[error("no devices found")]
    NoDevices,

    /// No device matches the selection
    #[error("no device matches {0}")]
    DeviceNotFound(String),

    /// Device selected but never opened
    #[error("device {0} is not open")]
    DeviceNotOpen(DeviceOrdinal),

    /// Kernel name not registered
    #[error("kernel '{0}' not found")]
    KernelNotFound(String),

    /// Host pointer not wrapped
    #[error("memory object {0} not found")]
    MemoryNotFound(HostPtr),

    /// Runtime used before init or after release
    #[error("environment is not initialized")]
    NotInitialized,

    /// Filesystem failure on a kernel source or binary
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Kernel source with an unsupported extension
    #[error("unsupported kernel source {}: expected a .cu file", .0.display())]
    UnsupportedSource(PathBuf),

    /// Device compiler exited unsuccessfully
    #[error("compiler failed ({status}): {command}\n{stderr}")]
    CompilerFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// Compiler ran but produced no loadable binary
    #[error("no binary produced for {}", .0.display())]
    BinaryNotFound(PathBuf),

    /// Kernel signature could not be parsed
    #[error("kernel '{kernel}' signature: {reason}")]
    Signature { kernel: String, reason: String },

    /// Native driver failure
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl EzcuError {
    pub(crate) fn invalid_flags(category: Category, flags: Flags) -> Self {
        EzcuError::InvalidFlags {
            category,
            flags,
            help: category.help(),
        }
    }

    pub(crate) fn invalid_memory(ptr: HostPtr, reason: impl Into<String>) -> Self {
        EzcuError::InvalidMemory {
            ptr,
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        use EzcuError::*;
        match self {
            InvalidFlags { .. }
            | UnknownFlagName(_)
            | UnsupportedVendor(_)
            | AmbiguousDeviceIndex(_)
            | InvalidMemory { .. }
            | ArgumentIndex { .. }
            | ArgumentType { .. }
            | ArgumentCount { .. }
            | UnboundArgument { .. }
            | DeviceMismatch { .. }
            | InvalidConfig(_)
            | MemoryInUse { .. } => ErrorCategory::InvalidConfiguration,
            NoDevices
            | DeviceNotFound(_)
            | DeviceNotOpen(_)
            | KernelNotFound(_)
            | MemoryNotFound(_)
            | NotInitialized => ErrorCategory::NotFound,
            Io { .. } | UnsupportedSource(_) | CompilerFailed { .. } | BinaryNotFound(_) | Signature { .. } => {
                ErrorCategory::Toolchain
            }
            Driver(_) => ErrorCategory::Native,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_flags_carries_help() {
        let err = EzcuError::invalid_flags(Category::Vendor, Flags::AMD | Flags::NVIDIA);
        let message = err.to_string();
        assert!(message.starts_with("invalid vendor flags 0x0900000000000003"));
        assert!(message.contains("only NVIDIA"));
        assert_eq!(err.category(), ErrorCategory::InvalidConfiguration);
    }

    #[test]
    fn test_driver_errors_are_native() {
        let err: EzcuError = DriverError::InvalidDevice(4).into();
        assert_eq!(err.category(), ErrorCategory::Native);
        assert_eq!(err.to_string(), "invalid device ordinal: 4");
    }

    #[test]
    fn test_memory_in_use_lists_kernels() {
        let err = EzcuError::MemoryInUse {
            ptr: HostPtr(0x1000),
            kernels: vec!["copy".into(), "scale".into()],
        };
        assert!(err.to_string().ends_with("copy, scale"));
    }
}
