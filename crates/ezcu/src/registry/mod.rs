//! Device registry
//!
//! Enumerates native devices once, filters them through a [`DeviceQuery`]
//! and records the result in a [`LookupTable`]. Later lookups resolve a flag
//! word to exactly one opened [`Device`].
//!
//! ## Table construction
//!
//! 1. Keep devices of the requested vendor (only NVIDIA is handled).
//! 2. For every requested type, tier and index, store the n-th device that
//!    matches the type and tier.
//! 3. Compact every `[type][tier]` row so present entries are contiguous.
//! 4. Unless requested explicitly, the ACCELERATOR row absorbs the GPU row
//!    and the ALL row absorbs the CPU and ACCELERATOR rows.
//! 5. Open every device referenced by the table.

mod device;
mod lookup;

pub use device::{Device, DeviceSummary, COMPUTE_STREAM, TRANSFER_STREAM};
pub use lookup::{LookupTable, INDEX_SLOTS, TIER_SLOTS, TYPE_SLOTS};

use std::collections::{BTreeMap, BTreeSet};

use ezcu_driver::{DeviceInfo, DeviceOrdinal, Driver};
use tracing::{debug, info, warn};

use crate::error::{EzcuError, Result};
use crate::flags::{DeviceIndex, DeviceQuery, DeviceType, Flags, Vendor};

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceOrdinal, Device>,
    table: LookupTable,
    arch_options: String,
}

impl DeviceRegistry {
    /// Number of devices the driver reports.
    pub fn count(driver: &dyn Driver) -> Result<u32> {
        driver.init()?;
        Ok(driver.device_count()?)
    }

    pub fn has(driver: &dyn Driver) -> Result<bool> {
        Ok(Self::count(driver)? > 0)
    }

    /// Select and open devices according to `flags`.
    pub fn init(driver: &dyn Driver, flags: Flags, streams_per_device: usize) -> Result<Self> {
        let query = DeviceQuery::decode(flags)?;
        debug!(flags = %flags.device_names(), %query, "registry init");

        driver.init()?;
        let count = driver.device_count()?;
        if count == 0 {
            return Err(EzcuError::NoDevices);
        }

        if query.vendor != Vendor::Nvidia {
            return Err(EzcuError::UnsupportedVendor(query.vendor.to_string()));
        }
        let candidates: Vec<DeviceInfo> = (0..count)
            .map(|ordinal| driver.device_info(DeviceOrdinal(ordinal)))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|info| query.vendor.matches(info.vendor))
            .collect();
        if candidates.is_empty() {
            return Err(EzcuError::DeviceNotFound(format!("vendor {}", query.vendor)));
        }

        let table = build_table(&query, flags, &candidates);

        let mut registry = Self {
            table,
            ..Self::default()
        };
        let selected = registry.table.devices();
        for info in candidates.into_iter().filter(|info| selected.contains(&info.ordinal)) {
            match Device::open(driver, info, streams_per_device) {
                Ok(device) => {
                    registry.devices.insert(device.ordinal(), device);
                }
                Err(err) => {
                    if let Err(teardown) = registry.release(driver) {
                        warn!(error = %teardown, "teardown after failed init");
                    }
                    return Err(err);
                }
            }
        }
        registry.arch_options = arch_options(registry.devices.values());

        info!(
            devices = registry.devices.len(),
            arch = %registry.arch_options.trim(),
            "{} device{} loaded",
            registry.devices.len(),
            if registry.devices.len() == 1 { "" } else { "s" },
        );
        for device in registry.devices.values() {
            info!("  {device}");
        }
        Ok(registry)
    }

    /// Resolve `flags` to one opened device.
    ///
    /// At most one explicit index may be named; without one the first
    /// device of the row is returned. The row is the highest requested tier
    /// of the widest requested type, ranked ALL, ACCELERATOR, GPU, CPU.
    /// ALL is used when no type is named.
    pub fn find(&self, flags: Flags) -> Result<&Device> {
        let explicit = DeviceQuery::explicit_indexes(flags)?;
        if explicit.len() > 1 {
            return Err(EzcuError::AmbiguousDeviceIndex(flags));
        }
        let query = DeviceQuery::decode(flags)?;
        let index = explicit.first().copied().unwrap_or(DeviceIndex::First);
        let ty = lookup_type(&query.types);
        let tier = query.top_tier();

        let ordinal = self
            .table
            .get(ty, tier, index)
            .ok_or_else(|| EzcuError::DeviceNotFound(format!("{ty} {tier} {index}")))?;
        self.devices.get(&ordinal).ok_or(EzcuError::DeviceNotOpen(ordinal))
    }

    pub fn get(&self, ordinal: DeviceOrdinal) -> Result<&Device> {
        self.devices.get(&ordinal).ok_or(EzcuError::DeviceNotOpen(ordinal))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    /// Compiler target options, one `--generate-code` per distinct architecture.
    pub fn arch_options(&self) -> &str {
        &self.arch_options
    }

    /// Close every device. The first failure is returned after all devices were attempted.
    pub fn release(self, driver: &dyn Driver) -> Result<()> {
        let mut first_error = None;
        for (ordinal, device) in self.devices {
            if let Err(err) = device.close(driver) {
                warn!(device = %ordinal, error = %err, "device teardown failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn build_table(query: &DeviceQuery, flags: Flags, candidates: &[DeviceInfo]) -> LookupTable {
    let mut table = LookupTable::default();

    for ty in &query.types {
        let typed: Vec<&DeviceInfo> = match ty {
            DeviceType::Cpu => Vec::new(),
            DeviceType::All | DeviceType::Gpu | DeviceType::Accelerator => candidates.iter().collect(),
        };
        if typed.is_empty() {
            debug!(device_type = %ty, "no devices of this type");
            continue;
        }

        for tier in &query.tiers {
            let tiered: Vec<&DeviceInfo> = typed.iter().copied().filter(|info| tier.admits(info.capability)).collect();
            if tiered.is_empty() {
                debug!(device_type = %ty, %tier, "no devices at this tier");
                continue;
            }

            for index in &query.indexes {
                match tiered.get(index.position()) {
                    Some(info) => table.set(*ty, *tier, *index, info.ordinal),
                    None => warn!(device_type = %ty, %tier, %index, "device index out of bound"),
                }
            }
        }
    }

    table.compact();

    if !flags.have(Flags::ACCELERATOR) {
        table.absorb(DeviceType::Accelerator, DeviceType::Gpu);
    }
    if !flags.have(Flags::ALL) {
        table.absorb(DeviceType::All, DeviceType::Cpu);
        table.absorb(DeviceType::All, DeviceType::Accelerator);
    }
    table
}

/// Row consulted by [`DeviceRegistry::find`] when several types are requested.
const LOOKUP_PRECEDENCE: [DeviceType; 4] = [DeviceType::All, DeviceType::Accelerator, DeviceType::Gpu, DeviceType::Cpu];

fn lookup_type(types: &[DeviceType]) -> DeviceType {
    LOOKUP_PRECEDENCE
        .into_iter()
        .find(|ty| types.contains(ty))
        .unwrap_or(DeviceType::All)
}

fn arch_options<'a>(devices: impl Iterator<Item = &'a Device>) -> String {
    let archs: BTreeSet<u32> = devices.map(|device| device.info().capability.arch()).collect();
    archs
        .into_iter()
        .map(|arch| format!(" --generate-code arch=compute_{arch},code=sm_{arch}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ezcu_driver::{ComputeCapability, DeviceVendor, HostDriver, SimulatedDevice};

    use crate::flags::Tier;

    fn driver(capabilities: &[(u32, u32)]) -> HostDriver {
        HostDriver::new(
            capabilities
                .iter()
                .enumerate()
                .map(|(i, (major, minor))| {
                    SimulatedDevice::new(format!("sim{i}"), ComputeCapability::new(*major, *minor))
                })
                .collect(),
        )
    }

    #[test]
    fn test_default_selects_first_device() {
        let driver = driver(&[(3, 5), (6, 0)]);
        let registry = DeviceRegistry::init(&driver, Flags::DEFAULT, 2).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(Flags::DEFAULT).unwrap().ordinal(), DeviceOrdinal(0));
        assert_eq!(registry.find(Flags::ALL).unwrap().ordinal(), DeviceOrdinal(0));
        assert!(matches!(registry.find(Flags::GPU), Err(EzcuError::DeviceNotFound(_))));
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_gpu_rows_are_absorbed() {
        let driver = driver(&[(3, 5), (6, 0)]);
        let registry = DeviceRegistry::init(&driver, Flags::GPU, 2).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.table().row(DeviceType::Gpu, Tier::Cc20).len(), 2);
        assert_eq!(registry.table().row(DeviceType::Accelerator, Tier::Cc20).len(), 2);
        assert_eq!(registry.table().row(DeviceType::All, Tier::Cc20).len(), 2);
        assert_eq!(registry.find(Flags::ACCELERATOR | Flags::SECOND).unwrap().ordinal(), DeviceOrdinal(1));
        assert_eq!(registry.find(Flags::ALL | Flags::SECOND).unwrap().ordinal(), DeviceOrdinal(1));
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_tier_filters_devices() {
        let driver = driver(&[(3, 0), (5, 2), (3, 7), (6, 1)]);
        let registry = DeviceRegistry::init(&driver, Flags::CC50, 2).unwrap();
        assert_eq!(
            registry.table().row(DeviceType::Gpu, Tier::Cc35),
            vec![DeviceOrdinal(1), DeviceOrdinal(2), DeviceOrdinal(3)]
        );
        assert_eq!(registry.table().row(DeviceType::Gpu, Tier::Cc50), vec![DeviceOrdinal(1), DeviceOrdinal(3)]);
        assert_eq!(registry.find(Flags::CC50 | Flags::SECOND).unwrap().ordinal(), DeviceOrdinal(3));
        assert!(registry.find(Flags::CC60).is_err());
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_higher_tier_devices_are_opened() {
        let driver = driver(&[(3, 0), (6, 0)]);
        let registry = DeviceRegistry::init(&driver, Flags::CC60 | Flags::FIRST, 2).unwrap();
        assert_eq!(registry.find(Flags::CC20).unwrap().ordinal(), DeviceOrdinal(0));
        assert_eq!(registry.find(Flags::CC60).unwrap().ordinal(), DeviceOrdinal(1));
        assert_eq!(registry.len(), 2);
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_index_out_of_bound_is_skipped() {
        let driver = driver(&[(3, 5)]);
        let registry = DeviceRegistry::init(&driver, Flags::GPU | Flags::FIRST | Flags::THIRD, 2).unwrap();
        assert_eq!(registry.table().row(DeviceType::Gpu, Tier::Cc20), vec![DeviceOrdinal(0)]);
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_find_rejects_two_indexes() {
        let driver = driver(&[(3, 5), (3, 5)]);
        let registry = DeviceRegistry::init(&driver, Flags::GPU, 2).unwrap();
        let err = registry.find(Flags::GPU | Flags::FIRST | Flags::SECOND).unwrap_err();
        assert!(matches!(err, EzcuError::AmbiguousDeviceIndex(_)));
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_init_errors() {
        let empty = HostDriver::new(Vec::new());
        assert!(matches!(DeviceRegistry::init(&empty, Flags::DEFAULT, 2), Err(EzcuError::NoDevices)));

        let driver = driver(&[(3, 5)]);
        assert!(matches!(
            DeviceRegistry::init(&driver, Flags::AMD, 2),
            Err(EzcuError::UnsupportedVendor(_))
        ));

        let intel = HostDriver::new(vec![
            SimulatedDevice::new("igpu", ComputeCapability::new(3, 0)).with_vendor(DeviceVendor::Intel)
        ]);
        assert!(matches!(
            DeviceRegistry::init(&intel, Flags::DEFAULT, 2),
            Err(EzcuError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_arch_options_deduplicate() {
        let driver = driver(&[(3, 5), (3, 5), (6, 0)]);
        let registry = DeviceRegistry::init(&driver, Flags::GPU, 2).unwrap();
        assert_eq!(
            registry.arch_options(),
            " --generate-code arch=compute_35,code=sm_35 --generate-code arch=compute_60,code=sm_60"
        );
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_release_closes_every_context() {
        let driver = driver(&[(3, 5), (5, 0)]);
        let registry = DeviceRegistry::init(&driver, Flags::GPU, 3).unwrap();
        assert_eq!(driver.stats().live_contexts, 2);
        assert_eq!(driver.stats().live_streams, 6);
        registry.release(&driver).unwrap();
        assert_eq!(driver.stats().live_contexts, 0);
        assert_eq!(driver.stats().live_streams, 0);
    }

    #[test]
    fn test_find_prefers_the_widest_type() {
        assert_eq!(lookup_type(&[DeviceType::Gpu, DeviceType::Accelerator]), DeviceType::Accelerator);
        assert_eq!(lookup_type(&[DeviceType::Cpu, DeviceType::Gpu]), DeviceType::Gpu);
        assert_eq!(lookup_type(&[]), DeviceType::All);

        let driver = driver(&[(3, 5), (6, 0)]);
        let registry = DeviceRegistry::init(&driver, Flags::GPU, 2).unwrap();
        assert_eq!(registry.find(Flags::CPU | Flags::GPU | Flags::SECOND).unwrap().ordinal(), DeviceOrdinal(1));
        assert!(matches!(registry.find(Flags::CPU), Err(EzcuError::DeviceNotFound(_))));
        registry.release(&driver).unwrap();
    }

    #[test]
    fn test_init_rejects_too_few_streams() {
        let driver = driver(&[(3, 5), (6, 0)]);
        for streams in [0, 1] {
            let err = DeviceRegistry::init(&driver, Flags::GPU, streams).unwrap_err();
            assert!(matches!(err, EzcuError::InvalidConfig(_)));
        }
        assert_eq!(driver.stats().live_contexts, 0);
    }

    #[test]
    fn test_failed_init_closes_opened_devices() {
        let driver = HostDriver::new(vec![
            SimulatedDevice::new("sim0", ComputeCapability::new(3, 5)),
            SimulatedDevice::new("sim1", ComputeCapability::new(6, 0)).with_max_streams(1),
        ]);
        let err = DeviceRegistry::init(&driver, Flags::GPU, 2).unwrap_err();
        assert!(matches!(err, EzcuError::Driver(_)));
        assert_eq!(driver.stats().live_contexts, 0);
        assert_eq!(driver.stats().live_streams, 0);
    }

    #[test]
    fn test_count_and_has() {
        assert_eq!(DeviceRegistry::count(&driver(&[(3, 5), (5, 0)])).unwrap(), 2);
        assert!(!DeviceRegistry::has(&HostDriver::new(Vec::new())).unwrap());
    }
}
