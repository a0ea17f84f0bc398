//! Handles and value types exchanged with a driver

use std::fmt;
use std::ops::BitOr;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Create a new handle
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            /// Get the internal ID
            pub const fn id(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:#x}"), self.0)
            }
        }
    };
}

define_handle!(
    /// Execution context owned by one device
    ContextHandle,
    "ctx"
);
define_handle!(
    /// Command stream inside a context
    StreamHandle,
    "stream"
);
define_handle!(
    /// Loaded binary module
    ModuleHandle,
    "module"
);
define_handle!(
    /// Kernel entry point resolved from a module
    FunctionHandle,
    "fn"
);
define_handle!(
    /// Address in the device address space
    DevicePtr,
    "dptr"
);

/// Native device ordinal, as enumerated by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceOrdinal(pub u32);

impl DeviceOrdinal {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Compute capability of a device, ordered by (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Hex-coded form `0xMm`, comparable against tier ordinals.
    pub const fn coded(self) -> u32 {
        (self.major << 4) + self.minor
    }

    /// Decimal form `Mm` used in compiler architecture names (`sm_35`).
    pub const fn arch(self) -> u32 {
        self.major * 10 + self.minor
    }

    /// Cores per multiprocessor for known SM versions.
    pub fn cores_per_multiprocessor(self) -> Option<u32> {
        const SM_TO_CORES: [(u32, u32); 14] = [
            (0x20, 32),
            (0x21, 48),
            (0x30, 192),
            (0x32, 192),
            (0x35, 192),
            (0x37, 192),
            (0x50, 128),
            (0x52, 128),
            (0x53, 128),
            (0x60, 64),
            (0x61, 128),
            (0x62, 128),
            (0x70, 64),
            (0x75, 64),
        ];
        SM_TO_CORES
            .iter()
            .find(|(sm, _)| *sm == self.coded())
            .map(|(_, cores)| *cores)
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Hardware vendor reported for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceVendor {
    Amd,
    Apple,
    Intel,
    Nvidia,
}

impl fmt::Display for DeviceVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceVendor::Amd => "AMD",
            DeviceVendor::Apple => "APPLE",
            DeviceVendor::Intel => "INTEL",
            DeviceVendor::Nvidia => "NVIDIA",
        };
        f.write_str(name)
    }
}

/// Static properties queried from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ordinal: DeviceOrdinal,
    pub name: String,
    pub vendor: DeviceVendor,
    pub capability: ComputeCapability,
    pub multiprocessor_count: u32,
    pub total_memory: usize,
    pub clock_rate_khz: u32,
    pub can_map_host_memory: bool,
}

/// Context creation flags (bit values follow the native driver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextFlags(pub u32);

impl ContextFlags {
    pub const SCHED_YIELD: Self = Self(0x02);
    pub const MAP_HOST: Self = Self(0x08);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ContextFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Page-locking flags for host registration (bit values follow the native driver).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HostRegisterFlags(pub u32);

impl HostRegisterFlags {
    pub const PORTABLE: Self = Self(0x01);
    pub const DEVICE_MAP: Self = Self(0x02);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for HostRegisterFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Grid dimensions for kernel launch
///
/// Defines the 3D iteration space of blocks that execute the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GridDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_blocks(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl Default for GridDim {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl From<[u32; 3]> for GridDim {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for GridDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Block dimensions
///
/// Defines the 3D arrangement of threads within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDim {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl BlockDim {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(size: u32) -> Self {
        Self { x: size, y: 1, z: 1 }
    }

    pub const fn total_threads(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl Default for BlockDim {
    fn default() -> Self {
        Self { x: 1, y: 1, z: 1 }
    }
}

impl From<[u32; 3]> for BlockDim {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for BlockDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Launch configuration for kernel execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: GridDim,
    pub block: BlockDim,
    /// Dynamic shared memory per block in bytes
    pub shared_memory_bytes: u32,
}

impl LaunchConfig {
    pub const fn new(grid: GridDim, block: BlockDim, shared_memory_bytes: u32) -> Self {
        Self {
            grid,
            block,
            shared_memory_bytes,
        }
    }

    /// 1D configuration covering `total_elements` with blocks of `block_size`.
    pub const fn linear(total_elements: u32, block_size: u32) -> Self {
        let num_blocks = total_elements.div_ceil(block_size);
        Self {
            grid: GridDim::linear(num_blocks),
            block: BlockDim::linear(block_size),
            shared_memory_bytes: 0,
        }
    }

    pub const fn total_threads(&self) -> u64 {
        self.grid.total_blocks() * self.block.total_threads() as u64
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grid={}, block={}, shared_mem={}B",
            self.grid, self.block, self.shared_memory_bytes
        )
    }
}

/// A scalar kernel argument, tagged with its C type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    Char(i8),
    Short(i16),
    Int(i32),
    UnsignedInt(u32),
    Long(i64),
    UnsignedLong(u64),
    SizeT(u64),
    Float(f32),
    Double(f64),
}

impl ScalarValue {
    /// Native-endian bytes as passed to the launch call.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ScalarValue::Char(v) => bytemuck::bytes_of(v),
            ScalarValue::Short(v) => bytemuck::bytes_of(v),
            ScalarValue::Int(v) => bytemuck::bytes_of(v),
            ScalarValue::UnsignedInt(v) => bytemuck::bytes_of(v),
            ScalarValue::Long(v) => bytemuck::bytes_of(v),
            ScalarValue::UnsignedLong(v) => bytemuck::bytes_of(v),
            ScalarValue::SizeT(v) => bytemuck::bytes_of(v),
            ScalarValue::Float(v) => bytemuck::bytes_of(v),
            ScalarValue::Double(v) => bytemuck::bytes_of(v),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScalarValue::Char(_) => "char",
            ScalarValue::Short(_) => "short",
            ScalarValue::Int(_) => "int",
            ScalarValue::UnsignedInt(_) => "unsigned int",
            ScalarValue::Long(_) => "long",
            ScalarValue::UnsignedLong(_) => "unsigned long",
            ScalarValue::SizeT(_) => "size_t",
            ScalarValue::Float(_) => "float",
            ScalarValue::Double(_) => "double",
        }
    }

    /// Integer view of the value, if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            ScalarValue::Char(v) => Some(v as i64),
            ScalarValue::Short(v) => Some(v as i64),
            ScalarValue::Int(v) => Some(v as i64),
            ScalarValue::UnsignedInt(v) => Some(v as i64),
            ScalarValue::Long(v) => Some(v),
            ScalarValue::UnsignedLong(v) | ScalarValue::SizeT(v) => i64::try_from(v).ok(),
            ScalarValue::Float(_) | ScalarValue::Double(_) => None,
        }
    }

    /// Floating-point view of the value.
    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::Float(v) => v as f64,
            ScalarValue::Double(v) => v,
            other => other.as_i64().unwrap_or(i64::MAX) as f64,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Char(v) => write!(f, "{v}"),
            ScalarValue::Short(v) => write!(f, "{v}"),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::UnsignedInt(v) => write!(f, "{v}"),
            ScalarValue::Long(v) => write!(f, "{v}"),
            ScalarValue::UnsignedLong(v) | ScalarValue::SizeT(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Double(v) => write!(f, "{v}"),
        }
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for ScalarValue {
                fn from(value: $ty) -> Self {
                    ScalarValue::$variant(value)
                }
            }
        )+
    };
}

scalar_from!(
    i8 => Char,
    i16 => Short,
    i32 => Int,
    u32 => UnsignedInt,
    i64 => Long,
    u64 => UnsignedLong,
    f32 => Float,
    f64 => Double,
);

impl From<usize> for ScalarValue {
    fn from(value: usize) -> Self {
        ScalarValue::SizeT(value as u64)
    }
}

/// One resolved launch argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Scalar(ScalarValue),
    Memory(DevicePtr),
}

impl KernelArg {
    /// Bytes the parameter pointer refers to.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KernelArg::Scalar(value) => value.as_bytes(),
            KernelArg::Memory(ptr) => bytemuck::bytes_of(&ptr.0),
        }
    }
}

// ================================================================================================
// Tests
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_display() {
        assert_eq!(ContextHandle::new(1).to_string(), "ctx0x1");
        assert_eq!(DevicePtr::new(0x100).id(), 0x100);
        assert_eq!(DeviceOrdinal(3).to_string(), "dev3");
    }

    #[test]
    fn test_compute_capability() {
        let cc = ComputeCapability::new(3, 5);
        assert_eq!(cc.coded(), 0x35);
        assert_eq!(cc.arch(), 35);
        assert_eq!(cc.to_string(), "3.5");
        assert_eq!(cc.cores_per_multiprocessor(), Some(192));
        assert_eq!(ComputeCapability::new(9, 9).cores_per_multiprocessor(), None);
        assert!(ComputeCapability::new(5, 0) > ComputeCapability::new(3, 7));
    }

    #[test]
    fn test_flags_combine() {
        let flags = ContextFlags::MAP_HOST | ContextFlags::SCHED_YIELD;
        assert_eq!(flags.0, 0x0a);
        assert!(flags.contains(ContextFlags::MAP_HOST));
        assert!(!HostRegisterFlags::PORTABLE.contains(HostRegisterFlags::DEVICE_MAP));
    }

    #[test]
    fn test_launch_config() {
        let linear = LaunchConfig::linear(1000, 256);
        assert_eq!(linear.grid.x, 4);
        assert_eq!(linear.block.x, 256);
        assert_eq!(linear.total_threads(), 1024);

        let config = LaunchConfig::new(GridDim::from([2, 2, 1]), BlockDim::from([8, 8, 1]), 1024);
        assert_eq!(config.total_threads(), 256);
        assert_eq!(config.to_string(), "grid=(2, 2, 1), block=(8, 8, 1), shared_mem=1024B");
    }

    #[test]
    fn test_scalar_bytes() {
        assert_eq!(ScalarValue::from(7i32).as_bytes(), &7i32.to_ne_bytes());
        assert_eq!(ScalarValue::from(1.5f64).as_bytes(), &1.5f64.to_ne_bytes());
        assert_eq!(ScalarValue::from(3usize), ScalarValue::SizeT(3));
        assert_eq!(ScalarValue::Char(-1).type_name(), "char");
        assert_eq!(ScalarValue::UnsignedLong(u64::MAX).as_i64(), None);

        let arg = KernelArg::Memory(DevicePtr::new(0xdead));
        assert_eq!(arg.as_bytes(), &0xdeadu64.to_ne_bytes());
    }
}
