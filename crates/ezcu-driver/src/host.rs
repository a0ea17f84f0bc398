//! Host arrays shared between the application and a driver
//!
//! A [`HostBuffer`] is the caller-owned array that memory objects wrap. Its
//! storage never moves once created, so its start address ([`HostPtr`]) is a
//! stable identity for the lifetime of the buffer and every clone of it.

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Start address of a host array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPtr(pub usize);

impl HostPtr {
    pub const fn addr(self) -> usize {
        self.0
    }
}

impl fmt::Display for HostPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Byte-level view of a host array, as seen by a driver.
pub trait HostMemory: Send + Sync + fmt::Debug {
    /// Start address of the array.
    fn ptr(&self) -> HostPtr;

    /// Size of the array in bytes.
    fn byte_len(&self) -> usize;

    /// Size of one element in bytes.
    fn element_size(&self) -> usize;

    /// Borrow the array contents as bytes.
    fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]>;

    /// Mutably borrow the array contents as bytes.
    fn bytes_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]>;
}

/// Shared, fixed-size host array of plain-old-data elements.
///
/// Cloning shares the storage.
pub struct HostBuffer<T: Pod + Send + Sync> {
    data: Arc<RwLock<Box<[T]>>>,
    addr: usize,
    len: usize,
}

impl<T: Pod + Send + Sync> HostBuffer<T> {
    /// Zero-initialized array of `len` elements.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![T::zeroed(); len])
    }

    pub fn from_vec(values: Vec<T>) -> Self {
        let boxed = values.into_boxed_slice();
        let addr = boxed.as_ptr() as usize;
        let len = boxed.len();
        Self {
            data: Arc::new(RwLock::new(boxed)),
            addr,
            len,
        }
    }

    pub fn ptr(&self) -> HostPtr {
        HostPtr(self.addr)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[T]>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[T]>> {
        self.data.write()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.read().to_vec()
    }

    /// Type-erased handle sharing the same storage.
    pub fn as_host_memory(&self) -> Arc<dyn HostMemory>
    where
        T: 'static,
    {
        Arc::new(self.clone())
    }
}

impl<T: Pod + Send + Sync> Clone for HostBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            addr: self.addr,
            len: self.len,
        }
    }
}

impl<T: Pod + Send + Sync> fmt::Debug for HostBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.ptr())
            .field("len", &self.len)
            .field("element_size", &std::mem::size_of::<T>())
            .finish()
    }
}

impl<T: Pod + Send + Sync> HostMemory for HostBuffer<T> {
    fn ptr(&self) -> HostPtr {
        HostBuffer::ptr(self)
    }

    fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn bytes(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.data.read(), |values| bytemuck::cast_slice::<T, u8>(&values[..]))
    }

    fn bytes_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.data.write(), |values| bytemuck::cast_slice_mut::<T, u8>(&mut values[..]))
    }
}
