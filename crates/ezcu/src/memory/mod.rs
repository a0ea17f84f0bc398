//! Memory objects and host/device coherence
//!
//! A [`MemoryObject`] pairs a caller-owned host array with its device-side
//! counterpart. Coherence is tracked with two dirty bits:
//!
//! | bit            | set when                                   | cleared when                |
//! |----------------|--------------------------------------------|-----------------------------|
//! | `host_dirty`   | [`MemoryTable::update`] with write access  | uploaded before a launch    |
//! | `device_dirty` | a launch that may write the object         | downloaded by `update`      |
//!
//! Objects are keyed by host address. Wrapping the same address again
//! returns the existing object and takes another reference.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ezcu_driver::{
    ContextHandle, DeviceOrdinal, DevicePtr, Driver, HostMemory, HostPtr, HostRegisterFlags, StreamHandle,
};
use ezcu_tracing::performance::{record_allocation, record_transfer};
use ezcu_tracing::timed_block;
use serde::Serialize;
use tracing::debug;

use crate::error::{EzcuError, Result};
use crate::flags::{AccessMode, Flags, MemLocation, MemProperty, MemoryFlags};
use crate::registry::Device;

/// Host array wrapped for device access.
#[derive(Debug)]
pub struct MemoryObject {
    host: Arc<dyn HostMemory>,
    device: DeviceOrdinal,
    ctx: ContextHandle,
    transfer_stream: StreamHandle,
    device_ptr: DevicePtr,
    flags: MemoryFlags,
    count: usize,
    refs: usize,
    host_dirty: bool,
    device_dirty: bool,
}

impl MemoryObject {
    pub fn host_ptr(&self) -> HostPtr {
        self.host.ptr()
    }

    pub fn device(&self) -> DeviceOrdinal {
        self.device
    }

    pub fn device_ptr(&self) -> DevicePtr {
        self.device_ptr
    }

    pub fn flags(&self) -> MemoryFlags {
        self.flags
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Bytes mirrored on the device.
    pub fn byte_len(&self) -> usize {
        self.count * self.flags.element.unit_size()
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn is_host_dirty(&self) -> bool {
        self.host_dirty
    }

    pub fn is_device_dirty(&self) -> bool {
        self.device_dirty
    }

    pub fn summary(&self) -> MemorySummary {
        MemorySummary {
            host_ptr: self.host_ptr().to_string(),
            device: self.device.0,
            device_ptr: self.device_ptr.to_string(),
            flags: self.flags.to_string(),
            count: self.count,
            bytes: self.byte_len(),
            refs: self.refs,
            host_dirty: self.host_dirty,
            device_dirty: self.device_dirty,
        }
    }

    fn upload(&self, driver: &dyn Driver, stream: Option<StreamHandle>) -> Result<()> {
        let len = self.byte_len();
        let ((), duration_us) = timed_block!("mem_upload", {
            let bytes = self.host.bytes();
            driver.memcpy_htod(self.ctx, self.device_ptr, &bytes[..len], stream)?;
        });
        record_transfer(len, "H2D", duration_us);
        Ok(())
    }

    fn download(&self, driver: &dyn Driver) -> Result<()> {
        let len = self.byte_len();
        let ((), duration_us) = timed_block!("mem_download", {
            let mut bytes = self.host.bytes_mut();
            driver.memcpy_dtoh(self.ctx, &mut bytes[..len], self.device_ptr)?;
        });
        record_transfer(len, "D2H", duration_us);
        Ok(())
    }

    fn free(self, driver: &dyn Driver) -> Result<()> {
        if self.flags.is_zero_copy() {
            driver.host_unregister(self.ctx, &self.host)?;
        } else {
            if self.flags.is_pinned() {
                driver.host_unregister(self.ctx, &self.host)?;
            }
            driver.mem_free(self.ctx, self.device_ptr)?;
        }
        debug!(host = %self.host_ptr(), device = %self.device, "mem freed");
        Ok(())
    }
}

impl fmt::Display for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{h={}, d={} on {}}} [{}] ({:.5} MB, refs={})",
            self.host_ptr(),
            self.device_ptr,
            self.device,
            self.flags,
            self.byte_len() as f64 / (1024.0 * 1024.0),
            self.refs
        )
    }
}

/// Serializable view of a memory object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySummary {
    pub host_ptr: String,
    pub device: u32,
    pub device_ptr: String,
    pub flags: String,
    pub count: usize,
    pub bytes: usize,
    pub refs: usize,
    pub host_dirty: bool,
    pub device_dirty: bool,
}

/// Every wrapped memory object, keyed by host address.
#[derive(Debug, Default)]
pub struct MemoryTable {
    objects: BTreeMap<HostPtr, MemoryObject>,
}

impl MemoryTable {
    /// Wrap `count` elements of `host` for use on `device`.
    ///
    /// An address already wrapped gains a reference and keeps its original
    /// flags and device.
    pub fn wrap(
        &mut self,
        driver: &dyn Driver,
        device: &Device,
        host: Arc<dyn HostMemory>,
        count: usize,
        flags: Flags,
    ) -> Result<HostPtr> {
        let ptr = host.ptr();
        if let Some(existing) = self.objects.get_mut(&ptr) {
            existing.refs += 1;
            debug!(host = %ptr, refs = existing.refs, "reuse mem wrap: found existing object");
            return Ok(ptr);
        }

        let decoded = MemoryFlags::decode(flags)?;
        debug!(host = %ptr, flags = %decoded, count, "start mem wrap");
        validate(device, host.as_ref(), count, &decoded)?;

        let size = count * decoded.element.unit_size();
        let ctx = device.context();
        let (device_ptr, duration_us) = timed_block!("mem_wrap", {
            allocate(driver, ctx, &host, size, &decoded)?
        });
        let kind = match decoded.property {
            Some(MemProperty::Pinned) => "pinned",
            Some(MemProperty::ZeroCopy) => "zero-copy",
            None => "device",
        };
        record_allocation(size, kind, duration_us);

        let object = MemoryObject {
            host,
            device: device.ordinal(),
            ctx,
            transfer_stream: device.transfer_stream(),
            device_ptr,
            flags: decoded,
            count,
            refs: 1,
            host_dirty: false,
            device_dirty: false,
        };
        debug!(object = %object, "end mem wrap");
        self.objects.insert(ptr, object);
        Ok(ptr)
    }

    /// Make the host copy current for `access`.
    ///
    /// Device results are downloaded when the device copy is newer and the
    /// host intends to read. Write access marks the host copy newer.
    pub fn update(&mut self, driver: &dyn Driver, ptr: HostPtr, access: AccessMode) -> Result<()> {
        let object = self.objects.get_mut(&ptr).ok_or(EzcuError::MemoryNotFound(ptr))?;
        debug!(
            host = %ptr,
            %access,
            host_dirty = object.host_dirty,
            device_dirty = object.device_dirty,
            "start mem update"
        );

        if object.device_dirty && access.reads() {
            if object.flags.is_zero_copy() {
                driver.context_synchronize(object.ctx)?;
            } else {
                object.download(driver)?;
            }
            object.device_dirty = false;
        }
        if access.writes() {
            object.host_dirty = true;
        }

        debug!(
            host = %ptr,
            host_dirty = object.host_dirty,
            device_dirty = object.device_dirty,
            "end mem update"
        );
        Ok(())
    }

    /// Queue an upload of `ptr` when the host copy is newer.
    ///
    /// Returns whether a transfer was queued on the object's transfer stream.
    /// Objects the device never reads keep their host-dirty bit.
    pub fn sync_to_device(&mut self, driver: &dyn Driver, ptr: HostPtr) -> Result<bool> {
        let object = self.objects.get_mut(&ptr).ok_or(EzcuError::MemoryNotFound(ptr))?;
        if !object.host_dirty || !object.flags.access.reads() {
            return Ok(false);
        }
        let copy = !object.flags.is_zero_copy();
        if copy {
            object.upload(driver, Some(object.transfer_stream))?;
        }
        object.host_dirty = false;
        debug!(host = %ptr, copied = copy, "mem sync");
        Ok(copy)
    }

    /// Mark `ptr` as possibly written by the device.
    pub fn touch(&mut self, ptr: HostPtr) -> Result<()> {
        let object = self.objects.get_mut(&ptr).ok_or(EzcuError::MemoryNotFound(ptr))?;
        if object.flags.access.writes() {
            object.device_dirty = true;
        }
        Ok(())
    }

    /// Take an additional reference.
    pub fn retain(&mut self, ptr: HostPtr) -> Result<usize> {
        let object = self.objects.get_mut(&ptr).ok_or(EzcuError::MemoryNotFound(ptr))?;
        object.refs += 1;
        Ok(object.refs)
    }

    /// Drop one reference, freeing the device side when none remain.
    ///
    /// Returns the remaining reference count.
    pub fn release(&mut self, driver: &dyn Driver, ptr: HostPtr) -> Result<usize> {
        let object = self.objects.get_mut(&ptr).ok_or(EzcuError::MemoryNotFound(ptr))?;
        object.refs = object.refs.saturating_sub(1);
        let refs = object.refs;
        debug!(host = %ptr, refs, "mem release");
        if refs == 0 {
            if let Some(object) = self.objects.remove(&ptr) {
                object.free(driver)?;
            }
        }
        Ok(refs)
    }

    /// Free every object. The first failure is returned after all were attempted.
    pub fn clear(&mut self, driver: &dyn Driver) -> Result<()> {
        let mut first_error = None;
        for (_, object) in std::mem::take(&mut self.objects) {
            if let Err(err) = object.free(driver) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn get(&self, ptr: HostPtr) -> Result<&MemoryObject> {
        self.objects.get(&ptr).ok_or(EzcuError::MemoryNotFound(ptr))
    }

    pub fn contains(&self, ptr: HostPtr) -> bool {
        self.objects.contains_key(&ptr)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryObject> {
        self.objects.values()
    }
}

fn validate(device: &Device, host: &dyn HostMemory, count: usize, flags: &MemoryFlags) -> Result<()> {
    let ptr = host.ptr();
    let unit = flags.element.unit_size();
    if host.element_size() != unit {
        return Err(EzcuError::invalid_memory(
            ptr,
            format!(
                "element size {} does not match {} ({} bytes)",
                host.element_size(),
                flags.element,
                unit
            ),
        ));
    }
    if count == 0 {
        return Err(EzcuError::invalid_memory(ptr, "empty buffers cannot be wrapped"));
    }
    if count * unit > host.byte_len() {
        return Err(EzcuError::invalid_memory(
            ptr,
            format!("{count} elements exceed the buffer of {} elements", host.byte_len() / unit),
        ));
    }
    match (flags.location, flags.is_zero_copy()) {
        (MemLocation::Hwa, true) => {
            return Err(EzcuError::invalid_memory(ptr, "device zero-copy buffers are not wrappable"));
        }
        (MemLocation::Host, false) => {
            return Err(EzcuError::invalid_memory(
                ptr,
                "host-resident buffers must be ZERO_COPY to be reachable from a device",
            ));
        }
        _ => {}
    }
    if flags.is_zero_copy() && !device.info().can_map_host_memory {
        return Err(EzcuError::invalid_memory(
            ptr,
            format!("{} cannot map host memory", device.ordinal()),
        ));
    }
    Ok(())
}

fn allocate(
    driver: &dyn Driver,
    ctx: ContextHandle,
    host: &Arc<dyn HostMemory>,
    size: usize,
    flags: &MemoryFlags,
) -> Result<DevicePtr> {
    if flags.is_zero_copy() {
        driver.host_register(ctx, host, HostRegisterFlags::DEVICE_MAP)?;
        return Ok(driver.host_device_pointer(ctx, host)?);
    }
    if flags.is_pinned() {
        driver.host_register(ctx, host, HostRegisterFlags::PORTABLE)?;
    }
    let device_ptr = driver.mem_alloc(ctx, size)?;
    let bytes = host.bytes();
    driver.memcpy_htod(ctx, device_ptr, &bytes[..size], None)?;
    Ok(device_ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ezcu_driver::{ComputeCapability, HostBuffer, HostDriver, SimulatedDevice};

    use crate::registry::DeviceRegistry;

    fn setup(map_host: bool) -> (HostDriver, DeviceRegistry) {
        let driver = HostDriver::new(vec![
            SimulatedDevice::new("sim", ComputeCapability::new(3, 5)).with_map_host_memory(map_host)
        ]);
        let registry = DeviceRegistry::init(&driver, Flags::DEFAULT, 2).unwrap();
        (driver, registry)
    }

    #[test]
    fn test_wrap_uploads_initial_contents() {
        let (driver, registry) = setup(true);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let buffer = HostBuffer::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);

        let ptr = table.wrap(&driver, device, buffer.as_host_memory(), 4, Flags::DEFAULT).unwrap();
        let object = table.get(ptr).unwrap();
        assert_eq!(object.refs(), 1);
        assert_eq!(object.byte_len(), 16);
        assert!(!object.is_host_dirty() && !object.is_device_dirty());

        let mut out = [0f32; 4];
        driver
            .memcpy_dtoh(device.context(), bytemuck::cast_slice_mut(&mut out), object.device_ptr())
            .unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(driver.stats().allocations, 1);
    }

    #[test]
    fn test_wrap_is_idempotent() {
        let (driver, registry) = setup(true);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let buffer = HostBuffer::<i32>::new(8);

        let a = table.wrap(&driver, device, buffer.as_host_memory(), 8, Flags::INT).unwrap();
        let b = table.wrap(&driver, device, buffer.as_host_memory(), 8, Flags::INT).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(a).unwrap().refs(), 2);
        assert_eq!(driver.stats().allocations, 1);

        assert_eq!(table.release(&driver, a).unwrap(), 1);
        assert_eq!(driver.stats().frees, 0);
        assert_eq!(table.release(&driver, a).unwrap(), 0);
        assert_eq!(driver.stats().frees, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_wrap_validation() {
        let (driver, registry) = setup(false);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let floats = HostBuffer::<f32>::new(4);
        let doubles = HostBuffer::<f64>::new(4);

        let cases = [
            (floats.as_host_memory(), 4, Flags::DOUBLE, "element size"),
            (doubles.as_host_memory(), 5, Flags::DOUBLE, "exceed"),
            (floats.as_host_memory(), 0, Flags::FLOAT, "empty"),
            (floats.as_host_memory(), 4, Flags::HWA | Flags::ZERO_COPY, "not wrappable"),
            (floats.as_host_memory(), 4, Flags::HOST, "ZERO_COPY"),
            (floats.as_host_memory(), 4, Flags::HOST | Flags::ZERO_COPY, "cannot map"),
        ];
        for (host, count, flags, needle) in cases {
            let err = table.wrap(&driver, device, host, count, flags).unwrap_err();
            assert!(err.to_string().contains(needle), "{err} should mention {needle}");
        }
        assert!(table.is_empty());
        assert_eq!(driver.stats().allocations, 0);
    }

    #[test]
    fn test_dirty_bit_transitions() {
        let (driver, registry) = setup(true);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let buffer = HostBuffer::from_vec(vec![0u32; 4]);
        let ptr = table
            .wrap(&driver, device, buffer.as_host_memory(), 4, Flags::READ_WRITE | Flags::UNSIGNED_INT)
            .unwrap();

        // host writes, then the next launch uploads
        table.update(&driver, ptr, AccessMode::WriteOnly).unwrap();
        assert!(table.get(ptr).unwrap().is_host_dirty());
        assert!(table.sync_to_device(&driver, ptr).unwrap());
        assert!(!table.get(ptr).unwrap().is_host_dirty());
        assert!(!table.sync_to_device(&driver, ptr).unwrap());

        // device writes, host reads back
        table.touch(ptr).unwrap();
        assert!(table.get(ptr).unwrap().is_device_dirty());
        let before = driver.stats().dtoh_copies;
        table.update(&driver, ptr, AccessMode::ReadOnly).unwrap();
        assert_eq!(driver.stats().dtoh_copies, before + 1);
        assert!(!table.get(ptr).unwrap().is_device_dirty());
        assert!(!table.get(ptr).unwrap().is_host_dirty());

        // a write-only update never downloads
        table.touch(ptr).unwrap();
        table.update(&driver, ptr, AccessMode::WriteOnly).unwrap();
        assert_eq!(driver.stats().dtoh_copies, before + 1);
        assert!(table.get(ptr).unwrap().is_device_dirty());
    }

    #[test]
    fn test_read_only_objects_are_never_device_dirty() {
        let (driver, registry) = setup(true);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let buffer = HostBuffer::<f32>::new(2);
        let ptr = table
            .wrap(&driver, device, buffer.as_host_memory(), 2, Flags::READ_ONLY)
            .unwrap();
        table.touch(ptr).unwrap();
        assert!(!table.get(ptr).unwrap().is_device_dirty());
    }

    #[test]
    fn test_write_only_objects_skip_upload() {
        let (driver, registry) = setup(true);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let buffer = HostBuffer::<f32>::new(2);
        let ptr = table
            .wrap(&driver, device, buffer.as_host_memory(), 2, Flags::WRITE_ONLY)
            .unwrap();
        table.update(&driver, ptr, AccessMode::ReadWrite).unwrap();
        assert!(!table.sync_to_device(&driver, ptr).unwrap());
        // host copy stays newer until something uploads it
        assert!(table.get(ptr).unwrap().is_host_dirty());
        assert_eq!(driver.stats().htod_async_copies, 0);
    }

    #[test]
    fn test_write_only_zero_copy_keeps_host_dirty() {
        let (driver, registry) = setup(true);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let buffer = HostBuffer::<f32>::new(2);
        let ptr = table
            .wrap(
                &driver,
                device,
                buffer.as_host_memory(),
                2,
                Flags::HOST | Flags::ZERO_COPY | Flags::WRITE_ONLY,
            )
            .unwrap();
        table.update(&driver, ptr, AccessMode::WriteOnly).unwrap();
        assert!(!table.sync_to_device(&driver, ptr).unwrap());
        assert!(table.get(ptr).unwrap().is_host_dirty());
    }

    #[test]
    fn test_pinned_and_zero_copy_release_paths() {
        let (driver, registry) = setup(true);
        let device = registry.find(Flags::DEFAULT).unwrap();
        let mut table = MemoryTable::default();
        let pinned = HostBuffer::<f64>::new(4);
        let mapped = HostBuffer::<f64>::new(4);

        let p = table
            .wrap(&driver, device, pinned.as_host_memory(), 4, Flags::PINNED | Flags::DOUBLE)
            .unwrap();
        let z = table
            .wrap(&driver, device, mapped.as_host_memory(), 4, Flags::HOST | Flags::ZERO_COPY | Flags::DOUBLE)
            .unwrap();
        assert_eq!(driver.stats().live_registrations, 2);
        assert_eq!(driver.stats().allocations, 1);
        assert!(table.get(z).unwrap().flags().is_zero_copy());

        table.release(&driver, z).unwrap();
        table.release(&driver, p).unwrap();
        assert_eq!(driver.stats().live_registrations, 0);
        assert_eq!(driver.stats().live_allocations, 0);
    }

    #[test]
    fn test_unknown_pointer() {
        let (driver, _registry) = setup(true);
        let mut table = MemoryTable::default();
        let err = table.update(&driver, HostPtr(0xdead), AccessMode::ReadOnly).unwrap_err();
        assert!(matches!(err, EzcuError::MemoryNotFound(_)));
    }
}
