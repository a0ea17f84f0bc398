//! Device selection flags

use std::fmt;

use ezcu_driver::{ComputeCapability, DeviceVendor};

use super::{flag_value, Category, FlagValue, Flags};
use crate::error::Result;

/// Device vendor selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Amd,
    Apple,
    Intel,
    Nvidia,
}

flag_value!(Vendor, Category::Vendor, [Amd => AMD, Apple => APPLE, Intel => INTEL, Nvidia => NVIDIA]);

impl Vendor {
    pub fn matches(self, vendor: DeviceVendor) -> bool {
        matches!(
            (self, vendor),
            (Vendor::Amd, DeviceVendor::Amd)
                | (Vendor::Apple, DeviceVendor::Apple)
                | (Vendor::Intel, DeviceVendor::Intel)
                | (Vendor::Nvidia, DeviceVendor::Nvidia)
        )
    }
}

/// Device type selector. `All` covers every type, `Accelerator` covers `Gpu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    All,
    Cpu,
    Gpu,
    Accelerator,
}

flag_value!(DeviceType, Category::DeviceType, [All => ALL, Cpu => CPU, Gpu => GPU, Accelerator => ACCELERATOR]);

impl DeviceType {
    /// Row in the device lookup table.
    pub fn slot(self) -> usize {
        self.flag().lookup_index()
    }
}

/// Minimum compute capability tier. Each tier implies the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Cc20,
    Cc30,
    Cc35,
    Cc50,
    Cc60,
}

flag_value!(Tier, Category::Tier, [Cc20 => CC20, Cc30 => CC30, Cc35 => CC35, Cc50 => CC50, Cc60 => CC60]);

impl Tier {
    pub fn slot(self) -> usize {
        self.flag().lookup_index()
    }

    /// Coded capability `(major << 4) + minor` of the tier floor.
    pub fn coded(self) -> u32 {
        self.flag().ordinal()
    }

    pub fn admits(self, capability: ComputeCapability) -> bool {
        capability.coded() >= self.coded()
    }
}

/// Position among the devices matching a type and tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceIndex {
    First,
    Second,
    Third,
    Fourth,
    Fifth,
    Sixth,
    Seventh,
    Eighth,
}

flag_value!(DeviceIndex, Category::DeviceIndex, [
    First => FIRST,
    Second => SECOND,
    Third => THIRD,
    Fourth => FOURTH,
    Fifth => FIFTH,
    Sixth => SIXTH,
    Seventh => SEVENTH,
    Eighth => EIGHTH,
]);

impl DeviceIndex {
    pub fn slot(self) -> usize {
        self.flag().lookup_index()
    }

    /// Zero-based position in the filtered device list.
    pub fn position(self) -> usize {
        self.flag().ordinal() as usize
    }
}

/// Decoded device selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceQuery {
    pub vendor: Vendor,
    pub types: Vec<DeviceType>,
    pub tiers: Vec<Tier>,
    pub indexes: Vec<DeviceIndex>,
}

impl DeviceQuery {
    /// Validate and decode a device flag word.
    ///
    /// Missing axes fall back to: NVIDIA, every type (`ALL`), the lowest
    /// tier, and every index. `DEFAULT` alone selects the first device of
    /// any type.
    pub fn decode(flags: Flags) -> Result<Self> {
        let vendors = Vendor::checked(flags)?;
        let types = DeviceType::checked(flags)?;
        let mut indexes = DeviceIndex::checked(flags)?;
        let tiers = Tier::checked(flags)?;

        let vendor = vendors.first().copied().unwrap_or(Vendor::Nvidia);

        let types = if flags.have(Flags::DEFAULT) || types.is_empty() {
            vec![DeviceType::All]
        } else {
            types
        };

        if flags.have(Flags::DEFAULT) {
            indexes.push(DeviceIndex::First);
        }
        if indexes.is_empty() {
            indexes = DeviceIndex::VARIANTS.to_vec();
        }

        let tiers = if tiers.is_empty() { vec![Tier::Cc20] } else { tiers };

        Ok(Self {
            vendor,
            types,
            tiers,
            indexes,
        })
    }

    /// Explicit indexes in `flags`, ignoring the all-indexes fallback.
    pub fn explicit_indexes(flags: Flags) -> Result<Vec<DeviceIndex>> {
        let mut indexes = DeviceIndex::checked(flags)?;
        if flags.have(Flags::DEFAULT) {
            indexes.push(DeviceIndex::First);
        }
        Ok(indexes)
    }

    /// Re-pack into a flag word.
    pub fn encode(&self) -> Flags {
        let mut flags = self.vendor.flag();
        for ty in &self.types {
            flags |= ty.flag();
        }
        for tier in &self.tiers {
            flags |= tier.flag();
        }
        for index in &self.indexes {
            flags |= index.flag();
        }
        flags
    }

    /// Highest requested tier.
    pub fn top_tier(&self) -> Tier {
        self.tiers.last().copied().unwrap_or(Tier::Cc20)
    }
}

impl fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |names: Vec<&str>| names.join("|");
        write!(
            f,
            "vendor={} types={} tiers={} indexes={}",
            self.vendor,
            join(self.types.iter().map(|t| t.name()).collect()),
            join(self.tiers.iter().map(|t| t.name()).collect()),
            join(self.indexes.iter().map(|i| i.name()).collect()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EzcuError;

    #[test]
    fn test_decode_default() {
        let query = DeviceQuery::decode(Flags::DEFAULT).unwrap();
        assert_eq!(query.vendor, Vendor::Nvidia);
        assert_eq!(query.types, vec![DeviceType::All]);
        assert_eq!(query.tiers, vec![Tier::Cc20]);
        assert_eq!(query.indexes, vec![DeviceIndex::First]);
    }

    #[test]
    fn test_decode_empty_selects_everything() {
        let query = DeviceQuery::decode(Flags::NONE).unwrap();
        assert_eq!(query.types, vec![DeviceType::All]);
        assert_eq!(query.indexes.len(), 8);
    }

    #[test]
    fn test_decode_tier_is_inclusive() {
        let query = DeviceQuery::decode(Flags::CC35).unwrap();
        assert_eq!(query.tiers, vec![Tier::Cc20, Tier::Cc30, Tier::Cc35]);
        assert_eq!(query.types, vec![DeviceType::Gpu]);
        assert_eq!(query.top_tier(), Tier::Cc35);
    }

    #[test]
    fn test_decode_accelerator_implies_gpu() {
        let query = DeviceQuery::decode(Flags::ACCELERATOR).unwrap();
        assert_eq!(query.types, vec![DeviceType::Gpu, DeviceType::Accelerator]);

        let query = DeviceQuery::decode(Flags::ALL).unwrap();
        assert_eq!(query.types.len(), 4);
        assert_eq!(query.types[0], DeviceType::All);
    }

    #[test]
    fn test_decode_rejects_two_vendors() {
        let err = DeviceQuery::decode(Flags::AMD | Flags::NVIDIA).unwrap_err();
        assert!(matches!(
            err,
            EzcuError::InvalidFlags {
                category: Category::Vendor,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_default_with_others() {
        assert!(DeviceQuery::decode(Flags::DEFAULT | Flags::FIRST).is_err());
    }

    #[test]
    fn test_decode_rejects_stray_tier_bits() {
        // tier category bit with no matching tier
        let stray = Flags::from_bits(0x0000_0800_0000_0000);
        assert!(DeviceQuery::decode(stray).is_err());
    }

    #[test]
    fn test_encode_roundtrip() {
        let flags = Flags::NVIDIA | Flags::GPU | Flags::CC30 | Flags::THIRD;
        let query = DeviceQuery::decode(flags).unwrap();
        let again = DeviceQuery::decode(query.encode()).unwrap();
        assert_eq!(query, again);
    }

    #[test]
    fn test_tier_admits_capability() {
        assert!(Tier::Cc35.admits(ComputeCapability::new(3, 7)));
        assert!(!Tier::Cc35.admits(ComputeCapability::new(3, 0)));
        assert!(Tier::Cc20.admits(ComputeCapability::new(2, 1)));
        assert_eq!(Tier::Cc60.coded(), 0x60);
    }

    #[test]
    fn test_slots() {
        assert_eq!(DeviceType::All.slot(), 0);
        assert_eq!(DeviceType::Gpu.slot(), 3);
        assert_eq!(Tier::Cc60.slot(), 4);
        assert_eq!(DeviceIndex::Eighth.slot(), 7);
        assert_eq!(DeviceIndex::Third.position(), 2);
    }

    #[test]
    fn test_display() {
        let query = DeviceQuery::decode(Flags::GPU | Flags::SECOND).unwrap();
        assert_eq!(query.to_string(), "vendor=NVIDIA types=GPU tiers=CC20 indexes=SECOND");
    }
}
