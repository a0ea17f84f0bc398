//! Kernel descriptors and argument binding
//!
//! A [`KernelDescriptor`] is created for every `__global__` function found in
//! a loaded source. It records the per-parameter type tags, the launch
//! geometry, one function handle per device, and the values bound to each
//! argument slot. Binding a memory object takes a reference on it; rebinding
//! a slot moves that reference.

mod signature;

pub use signature::{parse_kernels, ArgType, KernelSignature};

use std::collections::BTreeMap;
use std::fmt;

use ezcu_driver::{
    BlockDim, DeviceOrdinal, Driver, FunctionHandle, GridDim, HostPtr, KernelArg, LaunchConfig, ScalarValue,
};
use serde::Serialize;
use tracing::debug;

use crate::error::{EzcuError, Result};
use crate::memory::MemoryTable;

/// Value for one kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Scalar(ScalarValue),
    Memory(HostPtr),
}

impl Arg {
    fn type_name(&self) -> String {
        match self {
            Arg::Scalar(value) => ArgType::of_scalar(value).to_string(),
            Arg::Memory(_) => ArgType::Pointer.to_string(),
        }
    }
}

impl From<HostPtr> for Arg {
    fn from(ptr: HostPtr) -> Self {
        Arg::Memory(ptr)
    }
}

macro_rules! scalar_arg_from {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Scalar(value.into())
                }
            }
        )+
    };
}

scalar_arg_from!(ScalarValue, i8, i16, i32, u32, i64, u64, usize, f32, f64);

#[derive(Debug, Clone)]
pub struct KernelDescriptor {
    name: String,
    params: Vec<ArgType>,
    functions: BTreeMap<DeviceOrdinal, FunctionHandle>,
    config: LaunchConfig,
    scalars: BTreeMap<usize, ScalarValue>,
    mems: BTreeMap<usize, HostPtr>,
}

impl KernelDescriptor {
    pub fn new(signature: KernelSignature) -> Self {
        Self {
            name: signature.name,
            params: signature.params,
            functions: BTreeMap::new(),
            config: LaunchConfig::default(),
            scalars: BTreeMap::new(),
            mems: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[ArgType] {
        &self.params
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn add_function(&mut self, device: DeviceOrdinal, function: FunctionHandle) {
        self.functions.insert(device, function);
    }

    pub fn function(&self, device: DeviceOrdinal) -> Result<FunctionHandle> {
        self.functions
            .get(&device)
            .copied()
            .ok_or_else(|| EzcuError::KernelNotFound(format!("{} on {device}", self.name)))
    }

    /// Memory objects bound to this kernel, in slot order.
    pub fn bound_memory(&self) -> impl Iterator<Item = (usize, HostPtr)> + '_ {
        self.mems.iter().map(|(index, ptr)| (*index, *ptr))
    }

    pub fn binds(&self, ptr: HostPtr) -> bool {
        self.mems.values().any(|bound| *bound == ptr)
    }

    pub fn scalar(&self, index: usize) -> Option<ScalarValue> {
        self.scalars.get(&index).copied()
    }

    fn check_slot(&self, index: usize, actual: &Arg) -> Result<()> {
        let expected = self.params.get(index).ok_or_else(|| EzcuError::ArgumentIndex {
            kernel: self.name.clone(),
            index,
            arity: self.params.len(),
        })?;
        let matches = match actual {
            Arg::Scalar(value) => *expected == ArgType::of_scalar(value),
            Arg::Memory(_) => *expected == ArgType::Pointer,
        };
        if matches {
            Ok(())
        } else {
            Err(EzcuError::ArgumentType {
                kernel: self.name.clone(),
                index,
                expected: expected.to_string(),
                actual: actual.type_name(),
            })
        }
    }

    fn set_scalar(&mut self, index: usize, value: ScalarValue) -> Result<()> {
        self.check_slot(index, &Arg::Scalar(value))?;
        match self.scalars.insert(index, value) {
            None => debug!(kernel = %self.name, index, %value, "knl set {}", value.type_name()),
            Some(previous) if previous != value => {
                debug!(kernel = %self.name, index, %previous, %value, "knl modify {}", value.type_name())
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Resolve every slot to a launch argument for `device`.
    pub fn launch_args(&self, memory: &MemoryTable, device: DeviceOrdinal) -> Result<Vec<KernelArg>> {
        (0..self.params.len())
            .map(|index| {
                if let Some(ptr) = self.mems.get(&index) {
                    let object = memory.get(*ptr)?;
                    if object.device() != device {
                        return Err(EzcuError::DeviceMismatch {
                            ptr: *ptr,
                            owner: object.device(),
                            target: device,
                        });
                    }
                    Ok(KernelArg::Memory(object.device_ptr()))
                } else if let Some(value) = self.scalars.get(&index) {
                    Ok(KernelArg::Scalar(*value))
                } else {
                    Err(EzcuError::UnboundArgument {
                        kernel: self.name.clone(),
                        index,
                    })
                }
            })
            .collect()
    }

    pub fn summary(&self) -> KernelSummary {
        KernelSummary {
            name: self.name.clone(),
            params: self.params.iter().map(ToString::to_string).collect(),
            devices: self.functions.keys().map(|device| device.0).collect(),
            grid: [self.config.grid.x, self.config.grid.y, self.config.grid.z],
            block: [self.config.block.x, self.config.block.y, self.config.block.z],
            shared_memory_bytes: self.config.shared_memory_bytes,
            bound_memory: self.mems.values().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Display for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        write!(f, "{}({}) {}", self.name, params.join(", "), self.config)
    }
}

/// Serializable view of a kernel descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSummary {
    pub name: String,
    pub params: Vec<String>,
    pub devices: Vec<u32>,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_memory_bytes: u32,
    pub bound_memory: Vec<String>,
}

/// Every known kernel, keyed by name.
#[derive(Debug, Default)]
pub struct KernelTable {
    kernels: BTreeMap<String, KernelDescriptor>,
}

impl KernelTable {
    /// Register a kernel. Returns `false` when the name is already known.
    pub fn insert(&mut self, descriptor: KernelDescriptor) -> bool {
        if self.kernels.contains_key(descriptor.name()) {
            return false;
        }
        debug!(kernel = %descriptor.name(), arity = descriptor.arity(), "create kernel");
        self.kernels.insert(descriptor.name().to_string(), descriptor);
        true
    }

    pub fn get(&self, name: &str) -> Result<&KernelDescriptor> {
        self.kernels.get(name).ok_or_else(|| EzcuError::KernelNotFound(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut KernelDescriptor> {
        self.kernels.get_mut(name).ok_or_else(|| EzcuError::KernelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.values()
    }

    pub fn set_wrk(&mut self, name: &str, grid: GridDim, block: BlockDim) -> Result<()> {
        let kernel = self.get_mut(name)?;
        kernel.config.grid = grid;
        kernel.config.block = block;
        debug!(kernel = name, %grid, %block, "knl set wrk");
        Ok(())
    }

    pub fn set_shared(&mut self, name: &str, bytes: u32) -> Result<()> {
        let kernel = self.get_mut(name)?;
        kernel.config.shared_memory_bytes = bytes;
        debug!(kernel = name, bytes, "knl set shared");
        Ok(())
    }

    pub fn set_scalar(&mut self, name: &str, index: usize, value: impl Into<ScalarValue>) -> Result<()> {
        self.get_mut(name)?.set_scalar(index, value.into())
    }

    /// Bind a wrapped memory object to slot `index`.
    ///
    /// The new object gains a reference and a previously bound, different
    /// object loses one. Rebinding the same object is a no-op.
    pub fn set_mem(
        &mut self,
        memory: &mut MemoryTable,
        driver: &dyn Driver,
        name: &str,
        index: usize,
        ptr: HostPtr,
    ) -> Result<()> {
        let kernel = self.kernels.get_mut(name).ok_or_else(|| EzcuError::KernelNotFound(name.to_string()))?;
        kernel.check_slot(index, &Arg::Memory(ptr))?;
        if !memory.contains(ptr) {
            return Err(EzcuError::MemoryNotFound(ptr));
        }

        let previous = kernel.mems.get(&index).copied();
        if previous == Some(ptr) {
            return Ok(());
        }
        let refs = memory.retain(ptr)?;
        kernel.mems.insert(index, ptr);
        debug!(kernel = name, index, host = %ptr, refs, "knl set mem");
        if let Some(old) = previous {
            let remaining = memory.release(driver, old)?;
            debug!(kernel = name, index, host = %old, refs = remaining, "knl unbind mem");
        }
        Ok(())
    }

    /// Bind every slot from `args`, which must cover the whole signature.
    pub fn set_args(&mut self, memory: &mut MemoryTable, driver: &dyn Driver, name: &str, args: &[Arg]) -> Result<()> {
        let kernel = self.get(name)?;
        if args.len() != kernel.arity() {
            return Err(EzcuError::ArgumentCount {
                kernel: name.to_string(),
                expected: kernel.arity(),
                actual: args.len(),
            });
        }
        for (index, arg) in args.iter().enumerate() {
            kernel.check_slot(index, arg)?;
        }
        for (index, arg) in args.iter().enumerate() {
            match *arg {
                Arg::Scalar(value) => self.set_scalar(name, index, value)?,
                Arg::Memory(ptr) => self.set_mem(memory, driver, name, index, ptr)?,
            }
        }
        Ok(())
    }

    /// Names of kernels with `ptr` bound to any slot.
    pub fn binding(&self, ptr: HostPtr) -> Vec<String> {
        self.kernels
            .values()
            .filter(|kernel| kernel.binds(ptr))
            .map(|kernel| kernel.name.clone())
            .collect()
    }

    /// Drop every kernel, returning the references its bindings held.
    pub fn clear(&mut self, memory: &mut MemoryTable, driver: &dyn Driver) -> Result<()> {
        let mut first_error = None;
        for (name, kernel) in std::mem::take(&mut self.kernels) {
            for ptr in kernel.mems.into_values() {
                if let Err(err) = memory.release(driver, ptr) {
                    debug!(kernel = %name, host = %ptr, error = %err, "knl release binding");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ezcu_driver::{ComputeCapability, HostBuffer, HostDriver, SimulatedDevice};

    use crate::flags::{ElementType, Flags};
    use crate::registry::DeviceRegistry;

    fn copy_kernel() -> KernelDescriptor {
        KernelDescriptor::new(KernelSignature {
            name: "copy".to_string(),
            params: vec![ArgType::Pointer, ArgType::Pointer, ArgType::Scalar(ElementType::Int)],
        })
    }

    struct Fixture {
        driver: HostDriver,
        registry: DeviceRegistry,
        memory: MemoryTable,
        kernels: KernelTable,
    }

    fn fixture() -> Fixture {
        let driver = HostDriver::new(vec![SimulatedDevice::new("sim", ComputeCapability::new(3, 5))]);
        let registry = DeviceRegistry::init(&driver, Flags::DEFAULT, 2).unwrap();
        let mut kernels = KernelTable::default();
        assert!(kernels.insert(copy_kernel()));
        Fixture {
            driver,
            registry,
            memory: MemoryTable::default(),
            kernels,
        }
    }

    impl Fixture {
        fn wrap(&mut self, buffer: &HostBuffer<f32>) -> HostPtr {
            let device = self.registry.find(Flags::DEFAULT).unwrap();
            self.memory
                .wrap(&self.driver, device, buffer.as_host_memory(), buffer.len(), Flags::FLOAT)
                .unwrap()
        }
    }

    #[test]
    fn test_insert_is_unique() {
        let mut kernels = KernelTable::default();
        assert!(kernels.insert(copy_kernel()));
        assert!(!kernels.insert(copy_kernel()));
        assert_eq!(kernels.len(), 1);
    }

    #[test]
    fn test_set_scalar_checks_index_and_type() {
        let mut fx = fixture();
        fx.kernels.set_scalar("copy", 2, 16i32).unwrap();
        assert_eq!(fx.kernels.get("copy").unwrap().scalar(2), Some(ScalarValue::Int(16)));
        fx.kernels.set_scalar("copy", 2, 32i32).unwrap();
        assert_eq!(fx.kernels.get("copy").unwrap().scalar(2), Some(ScalarValue::Int(32)));

        assert!(matches!(
            fx.kernels.set_scalar("copy", 3, 1i32),
            Err(EzcuError::ArgumentIndex { index: 3, arity: 3, .. })
        ));
        assert!(matches!(
            fx.kernels.set_scalar("copy", 2, 1.0f32),
            Err(EzcuError::ArgumentType { index: 2, .. })
        ));
        assert!(matches!(
            fx.kernels.set_scalar("copy", 0, 1i32),
            Err(EzcuError::ArgumentType { index: 0, .. })
        ));
        assert!(matches!(fx.kernels.set_scalar("nope", 0, 1i32), Err(EzcuError::KernelNotFound(_))));
    }

    #[test]
    fn test_rebinding_moves_references() {
        let mut fx = fixture();
        let a = HostBuffer::<f32>::new(4);
        let b = HostBuffer::<f32>::new(4);
        let pa = fx.wrap(&a);
        let pb = fx.wrap(&b);

        fx.kernels.set_mem(&mut fx.memory, &fx.driver, "copy", 0, pa).unwrap();
        assert_eq!(fx.memory.get(pa).unwrap().refs(), 2);

        // same object again is a no-op
        fx.kernels.set_mem(&mut fx.memory, &fx.driver, "copy", 0, pa).unwrap();
        assert_eq!(fx.memory.get(pa).unwrap().refs(), 2);

        fx.kernels.set_mem(&mut fx.memory, &fx.driver, "copy", 0, pb).unwrap();
        assert_eq!(fx.memory.get(pa).unwrap().refs(), 1);
        assert_eq!(fx.memory.get(pb).unwrap().refs(), 2);
        assert_eq!(fx.kernels.binding(pb), vec!["copy".to_string()]);
        assert!(fx.kernels.binding(pa).is_empty());
    }

    #[test]
    fn test_set_mem_unknown_pointer() {
        let mut fx = fixture();
        let err = fx
            .kernels
            .set_mem(&mut fx.memory, &fx.driver, "copy", 0, HostPtr(0x10))
            .unwrap_err();
        assert!(matches!(err, EzcuError::MemoryNotFound(_)));
    }

    #[test]
    fn test_set_args_validates_before_binding() {
        let mut fx = fixture();
        let a = HostBuffer::<f32>::new(4);
        let pa = fx.wrap(&a);

        let err = fx
            .kernels
            .set_args(&mut fx.memory, &fx.driver, "copy", &[Arg::from(pa), Arg::from(pa)])
            .unwrap_err();
        assert!(matches!(err, EzcuError::ArgumentCount { expected: 3, actual: 2, .. }));

        let err = fx
            .kernels
            .set_args(&mut fx.memory, &fx.driver, "copy", &[pa.into(), 1i32.into(), 4i32.into()])
            .unwrap_err();
        assert!(matches!(err, EzcuError::ArgumentType { index: 1, .. }));
        assert_eq!(fx.memory.get(pa).unwrap().refs(), 1);

        fx.kernels
            .set_args(&mut fx.memory, &fx.driver, "copy", &[pa.into(), pa.into(), 4i32.into()])
            .unwrap();
        assert_eq!(fx.memory.get(pa).unwrap().refs(), 3);
    }

    #[test]
    fn test_launch_args_require_every_slot() {
        let mut fx = fixture();
        let a = HostBuffer::<f32>::new(4);
        let pa = fx.wrap(&a);
        fx.kernels.set_mem(&mut fx.memory, &fx.driver, "copy", 0, pa).unwrap();
        fx.kernels.set_mem(&mut fx.memory, &fx.driver, "copy", 1, pa).unwrap();

        let kernel = fx.kernels.get("copy").unwrap();
        let err = kernel.launch_args(&fx.memory, DeviceOrdinal(0)).unwrap_err();
        assert!(matches!(err, EzcuError::UnboundArgument { index: 2, .. }));

        fx.kernels.set_scalar("copy", 2, 4i32).unwrap();
        let kernel = fx.kernels.get("copy").unwrap();
        let args = kernel.launch_args(&fx.memory, DeviceOrdinal(0)).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[2], KernelArg::Scalar(ScalarValue::Int(4)));

        let err = kernel.launch_args(&fx.memory, DeviceOrdinal(1)).unwrap_err();
        assert!(matches!(err, EzcuError::DeviceMismatch { .. }));
    }

    #[test]
    fn test_clear_returns_binding_references() {
        let mut fx = fixture();
        let a = HostBuffer::<f32>::new(4);
        let pa = fx.wrap(&a);
        fx.kernels.set_mem(&mut fx.memory, &fx.driver, "copy", 0, pa).unwrap();
        fx.kernels.set_mem(&mut fx.memory, &fx.driver, "copy", 1, pa).unwrap();
        assert_eq!(fx.memory.get(pa).unwrap().refs(), 3);

        fx.kernels.clear(&mut fx.memory, &fx.driver).unwrap();
        assert!(fx.kernels.is_empty());
        assert_eq!(fx.memory.get(pa).unwrap().refs(), 1);
    }

    #[test]
    fn test_geometry() {
        let mut fx = fixture();
        fx.kernels
            .set_wrk("copy", GridDim::new(4, 2, 1), BlockDim::new(32, 4, 1))
            .unwrap();
        fx.kernels.set_shared("copy", 1024).unwrap();
        let config = fx.kernels.get("copy").unwrap().config();
        assert_eq!(config.total_threads(), 8 * 128);
        assert_eq!(config.shared_memory_bytes, 1024);
        assert_eq!(fx.kernels.get("copy").unwrap().summary().grid, [4, 2, 1]);
    }
}
