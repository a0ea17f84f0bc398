//! Device address space of the host driver
//!
//! Owned allocations live in byte vectors. Mapped host arrays are entered
//! into the same table so a kernel resolves every device pointer the same way.

use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::{ContextHandle, DevicePtr};
use crate::error::{DriverError, Result};
use crate::host::HostMemory;

/// First simulated device address.
const BASE_ADDRESS: u64 = 0x7000_0000_0000;

/// Allocation granularity in bytes.
const ALIGNMENT: u64 = 256;

/// Backing storage for one device address range.
#[derive(Debug)]
pub(crate) enum Allocation {
    Owned(Vec<u8>),
    Mapped(Arc<dyn HostMemory>),
}

impl Allocation {
    pub(crate) fn len(&self) -> usize {
        match self {
            Allocation::Owned(bytes) => bytes.len(),
            Allocation::Mapped(host) => host.byte_len(),
        }
    }

    pub(crate) fn read_into(&self, dst: &mut [u8]) -> Result<()> {
        check_bounds(dst.len(), self.len())?;
        match self {
            Allocation::Owned(bytes) => dst.copy_from_slice(&bytes[..dst.len()]),
            Allocation::Mapped(host) => dst.copy_from_slice(&host.bytes()[..dst.len()]),
        }
        Ok(())
    }

    pub(crate) fn write_from(&mut self, src: &[u8]) -> Result<()> {
        check_bounds(src.len(), self.len())?;
        match self {
            Allocation::Owned(bytes) => bytes[..src.len()].copy_from_slice(src),
            Allocation::Mapped(host) => host.bytes_mut()[..src.len()].copy_from_slice(src),
        }
        Ok(())
    }
}

fn check_bounds(size: usize, capacity: usize) -> Result<()> {
    if size > capacity {
        return Err(DriverError::OutOfBounds { size, capacity });
    }
    Ok(())
}

#[derive(Debug)]
pub(crate) struct AllocationEntry {
    pub(crate) ctx: ContextHandle,
    pub(crate) storage: Allocation,
}

/// Simulated device address space shared by all contexts.
#[derive(Debug)]
pub(crate) struct AddressSpace {
    entries: HashMap<DevicePtr, AllocationEntry>,
    next_address: u64,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_address: BASE_ADDRESS,
        }
    }
}

impl AddressSpace {
    /// Reserve an address range and attach its storage.
    pub(crate) fn insert(&mut self, ctx: ContextHandle, storage: Allocation) -> DevicePtr {
        let ptr = DevicePtr::new(self.next_address);
        let span = (storage.len() as u64).max(1).div_ceil(ALIGNMENT) * ALIGNMENT;
        self.next_address += span;
        self.entries.insert(ptr, AllocationEntry { ctx, storage });
        ptr
    }

    pub(crate) fn remove(&mut self, ptr: DevicePtr) -> Result<AllocationEntry> {
        self.entries.remove(&ptr).ok_or(DriverError::InvalidHandle {
            kind: "device pointer",
            id: ptr.id(),
        })
    }

    pub(crate) fn get(&self, ptr: DevicePtr) -> Result<&AllocationEntry> {
        self.entries.get(&ptr).ok_or(DriverError::InvalidHandle {
            kind: "device pointer",
            id: ptr.id(),
        })
    }

    pub(crate) fn get_mut(&mut self, ptr: DevicePtr) -> Result<&mut AllocationEntry> {
        self.entries.get_mut(&ptr).ok_or(DriverError::InvalidHandle {
            kind: "device pointer",
            id: ptr.id(),
        })
    }

    /// Number of live owned allocations.
    pub(crate) fn owned_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.storage, Allocation::Owned(_)))
            .count()
    }

    /// Remove every owned allocation made in `ctx`, returning how many there were.
    pub(crate) fn drop_context(&mut self, ctx: ContextHandle) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !(entry.ctx == ctx && matches!(entry.storage, Allocation::Owned(_))));
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBuffer;

    #[test]
    fn test_addresses_are_aligned_and_distinct() {
        let mut space = AddressSpace::default();
        let ctx = ContextHandle::new(1);
        let a = space.insert(ctx, Allocation::Owned(vec![0; 10]));
        let b = space.insert(ctx, Allocation::Owned(vec![0; 300]));
        let c = space.insert(ctx, Allocation::Owned(vec![0; 1]));
        assert_eq!(b.id() - a.id(), 256);
        assert_eq!(c.id() - b.id(), 512);
        assert_eq!(space.owned_count(), 3);
    }

    #[test]
    fn test_copy_bounds() {
        let mut allocation = Allocation::Owned(vec![0; 4]);
        allocation.write_from(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 4];
        allocation.read_into(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 0]);

        assert!(matches!(
            allocation.write_from(&[0; 8]),
            Err(DriverError::OutOfBounds { size: 8, capacity: 4 })
        ));
    }

    #[test]
    fn test_mapped_storage_aliases_host() {
        let buffer = HostBuffer::<u8>::from_vec(vec![0; 4]);
        let mut allocation = Allocation::Mapped(buffer.as_host_memory());
        allocation.write_from(&[7, 7]).unwrap();
        assert_eq!(buffer.to_vec(), vec![7, 7, 0, 0]);
    }

    #[test]
    fn test_drop_context_keeps_mapped_ranges() {
        let mut space = AddressSpace::default();
        let ctx = ContextHandle::new(1);
        let buffer = HostBuffer::<u8>::new(8);
        space.insert(ctx, Allocation::Owned(vec![0; 8]));
        let mapped = space.insert(ctx, Allocation::Mapped(buffer.as_host_memory()));
        assert_eq!(space.drop_context(ctx), 1);
        assert!(space.get(mapped).is_ok());
    }
}
