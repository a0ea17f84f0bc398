//! Selection flags
//!
//! A [`Flags`] word packs several selection axes into 64 bits:
//!
//! ```text
//!  63            32 31          16 15     8 7      0
//! ┌────────────────┬──────────────┬────────┬────────┐
//! │ category bits  │   (unused)   │ordinal │ lookup │
//! └────────────────┴──────────────┴────────┴────────┘
//! ```
//!
//! The top 32 bits identify categories and are the only bits compared by
//! [`Flags::have`]. Bits 8-15 carry an ordinal (compute tier or device slot)
//! and bits 0-7 a per-category lookup index.
//!
//! The device family ([`DeviceQuery`]) and the memory family
//! ([`MemoryFlags`]) reuse the same bit positions, so a word is always read
//! within one family. For example `LONG` and `FIRST` share their category
//! bits.

mod device;
mod memory;

pub use device::{DeviceIndex, DeviceQuery, DeviceType, Tier, Vendor};
pub use memory::{AccessMode, ElementType, MemLocation, MemProperty, MemoryFlags};

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use crate::error::{EzcuError, Result};

/// Bits compared when testing category membership.
pub const CATEGORY_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Bits holding the embedded ordinal.
pub const VALUE_MASK: u64 = 0x0000_0000_0000_FF00;

/// Bits holding the per-category lookup index.
pub const LOOKUP_MASK: u64 = 0x0000_0000_0000_00FF;

/// Packed selection word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Flags(u64);

impl Flags {
    pub const NONE: Self = Self(0);
    pub const DEFAULT: Self = Self(0x1000_0000_0000_0000);

    // Vendors
    pub const AMD: Self = Self(0x0800_0000_0000_0000);
    pub const APPLE: Self = Self(0x0400_0000_0000_0001);
    pub const INTEL: Self = Self(0x0200_0000_0000_0002);
    pub const NVIDIA: Self = Self(0x0100_0000_0000_0003);

    // Device types
    pub const ALL: Self = Self(0x00F0_0000_0000_0000);
    pub const CPU: Self = Self(0x0080_0000_0000_0001);
    pub const ACCELERATOR: Self = Self(0x0070_0000_0000_0002);
    pub const GPU: Self = Self(0x0040_0000_0000_0003);

    // Device indexes
    pub const FIRST: Self = Self(0x0000_1000_0000_0000);
    pub const SECOND: Self = Self(0x0000_2000_0000_0101);
    pub const THIRD: Self = Self(0x0000_4000_0000_0202);
    pub const FOURTH: Self = Self(0x0000_8000_0000_0303);
    pub const FIFTH: Self = Self(0x0001_0000_0000_0404);
    pub const SIXTH: Self = Self(0x0002_0000_0000_0505);
    pub const SEVENTH: Self = Self(0x0004_0000_0000_0606);
    pub const EIGHTH: Self = Self(0x0008_0000_0000_0707);

    // Compute tiers (each implies the ones below it and GPU)
    pub const CC20: Self = Self(0x0040_00F0_0000_2000);
    pub const CC30: Self = Self(0x0040_01F0_0000_3001);
    pub const CC35: Self = Self(0x0040_03F0_0000_3502);
    pub const CC50: Self = Self(0x0040_07F0_0000_5003);
    pub const CC60: Self = Self(0x0040_0FF0_0000_6004);

    // Memory locations
    pub const HOST: Self = Self(0x0100_0000_0000_0000);
    pub const HWA: Self = Self(0x0200_0000_0000_0001);

    // Memory properties
    pub const PINNED: Self = Self(0x0010_0000_0000_0000);
    pub const ZERO_COPY: Self = Self(0x0020_0000_0000_0001);

    // Access modes (device perspective)
    pub const READ_ONLY: Self = Self(0x0001_0000_0000_0000);
    pub const WRITE_ONLY: Self = Self(0x0002_0000_0000_0001);
    pub const READ_WRITE: Self = Self(0x0004_0000_0000_0002);

    // Element types
    pub const CHAR: Self = Self(0x0000_0100_0000_0000);
    pub const INT: Self = Self(0x0000_0200_0000_0001);
    pub const UNSIGNED_INT: Self = Self(0x0000_0400_0000_0002);
    pub const FLOAT: Self = Self(0x0000_0800_0000_0003);
    pub const LONG: Self = Self(0x0000_1000_0000_0004);
    pub const UNSIGNED_LONG: Self = Self(0x0000_2000_0000_0005);
    pub const SIZET: Self = Self(0x0000_4000_0000_0006);
    pub const DOUBLE: Self = Self(0x0000_8000_0000_0007);
    pub const POINTER: Self = Self(0x0000_0010_0000_0008);
    pub const SHORT: Self = Self(0x0000_0020_0000_0009);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when every category bit of `mask` is set in `self`.
    pub const fn have(self, mask: Self) -> bool {
        let wanted = mask.0 & CATEGORY_MASK;
        self.0 & wanted == wanted
    }

    /// Embedded ordinal: compute tier (`0xMm`) or device slot.
    pub const fn ordinal(self) -> u32 {
        ((self.0 & VALUE_MASK) >> 8) as u32
    }

    /// Position of the flag within its category.
    pub const fn lookup_index(self) -> usize {
        (self.0 & LOOKUP_MASK) as usize
    }

    /// Category bits of `self` that fall inside `category`.
    pub const fn within(self, category: Category) -> u64 {
        self.0 & category.mask()
    }

    /// Reject a DEFAULT flag combined with anything else.
    pub fn check_default(self) -> Result<()> {
        if self.have(Self::DEFAULT) && self.0 & !Self::DEFAULT.0 != 0 {
            return Err(EzcuError::invalid_flags(Category::Default, self));
        }
        Ok(())
    }

    /// Render with names from the device family.
    pub fn device_names(self) -> String {
        render(self, NAMED_DEVICE_FLAGS)
    }

    /// Render with names from the memory family.
    pub fn memory_names(self) -> String {
        render(self, NAMED_MEMORY_FLAGS)
    }

    /// Look up a single flag by name.
    pub fn from_name(name: &str) -> Option<Self> {
        NAMED_DEVICE_FLAGS
            .iter()
            .chain(NAMED_MEMORY_FLAGS)
            .chain(std::iter::once(&(Self::POINTER, "POINTER")))
            .find(|(_, flag_name)| *flag_name == name)
            .map(|(flag, _)| *flag)
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#018x})", self.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl FromStr for Flags {
    type Err = EzcuError;

    /// Parse `NAME | NAME | ...`.
    fn from_str(s: &str) -> Result<Self> {
        s.split('|')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .try_fold(Flags::NONE, |acc, name| {
                Flags::from_name(name)
                    .map(|flag| acc | flag)
                    .ok_or_else(|| EzcuError::UnknownFlagName(name.to_string()))
            })
    }
}

fn render(flags: Flags, table: &[(Flags, &str)]) -> String {
    let names: Vec<&str> = table
        .iter()
        .filter(|(flag, _)| flags.have(*flag))
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "NONE".to_string()
    } else {
        names.join(" | ")
    }
}

const NAMED_DEVICE_FLAGS: &[(Flags, &str)] = &[
    (Flags::DEFAULT, "DEFAULT"),
    (Flags::AMD, "AMD"),
    (Flags::APPLE, "APPLE"),
    (Flags::INTEL, "INTEL"),
    (Flags::NVIDIA, "NVIDIA"),
    (Flags::ALL, "ALL"),
    (Flags::GPU, "GPU"),
    (Flags::CPU, "CPU"),
    (Flags::ACCELERATOR, "ACCELERATOR"),
    (Flags::FIRST, "FIRST"),
    (Flags::SECOND, "SECOND"),
    (Flags::THIRD, "THIRD"),
    (Flags::FOURTH, "FOURTH"),
    (Flags::FIFTH, "FIFTH"),
    (Flags::SIXTH, "SIXTH"),
    (Flags::SEVENTH, "SEVENTH"),
    (Flags::EIGHTH, "EIGHTH"),
    (Flags::CC20, "CC20"),
    (Flags::CC30, "CC30"),
    (Flags::CC35, "CC35"),
    (Flags::CC50, "CC50"),
    (Flags::CC60, "CC60"),
];

const NAMED_MEMORY_FLAGS: &[(Flags, &str)] = &[
    (Flags::DEFAULT, "DEFAULT"),
    (Flags::HWA, "HWA"),
    (Flags::HOST, "HOST"),
    (Flags::PINNED, "PINNED"),
    (Flags::ZERO_COPY, "ZERO_COPY"),
    (Flags::READ_WRITE, "READ_WRITE"),
    (Flags::READ_ONLY, "READ_ONLY"),
    (Flags::WRITE_ONLY, "WRITE_ONLY"),
    (Flags::CHAR, "CHAR"),
    (Flags::INT, "INT"),
    (Flags::UNSIGNED_INT, "UNSIGNED_INT"),
    (Flags::LONG, "LONG"),
    (Flags::UNSIGNED_LONG, "UNSIGNED_LONG"),
    (Flags::SIZET, "SIZET"),
    (Flags::SHORT, "SHORT"),
    (Flags::FLOAT, "FLOAT"),
    (Flags::DOUBLE, "DOUBLE"),
];

// ================================================================================================
// Categories
// ================================================================================================

/// One selection axis of the packed word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Default,
    Vendor,
    DeviceType,
    DeviceIndex,
    Tier,
    MemLocation,
    MemProperty,
    AccessMode,
    ElementType,
}

impl Category {
    /// Category bits owned by this axis.
    pub const fn mask(self) -> u64 {
        match self {
            Category::Default => Flags::DEFAULT.0 & CATEGORY_MASK,
            Category::Vendor => {
                (Flags::AMD.0 | Flags::APPLE.0 | Flags::INTEL.0 | Flags::NVIDIA.0) & 0x0F00_0000_0000_0000
            }
            Category::DeviceType => {
                (Flags::ALL.0 | Flags::CPU.0 | Flags::ACCELERATOR.0 | Flags::GPU.0) & 0x00F0_0000_0000_0000
            }
            Category::DeviceIndex => 0x000F_F000_0000_0000,
            // GPU bits are shared with device types and left out here
            Category::Tier => {
                (Flags::CC20.0 | Flags::CC30.0 | Flags::CC35.0 | Flags::CC50.0 | Flags::CC60.0)
                    & 0x00F0_0FF0_0000_0000
                    & !Flags::GPU.0
            }
            Category::MemLocation => (Flags::HWA.0 | Flags::HOST.0) & 0x0F00_0000_0000_0000,
            Category::MemProperty => (Flags::PINNED.0 | Flags::ZERO_COPY.0) & 0x00F0_0000_0000_0000,
            Category::AccessMode => {
                (Flags::READ_ONLY.0 | Flags::WRITE_ONLY.0 | Flags::READ_WRITE.0) & 0x000F_0000_0000_0000
            }
            Category::ElementType => {
                (Flags::CHAR.0
                    | Flags::INT.0
                    | Flags::UNSIGNED_INT.0
                    | Flags::LONG.0
                    | Flags::UNSIGNED_LONG.0
                    | Flags::SIZET.0
                    | Flags::FLOAT.0
                    | Flags::DOUBLE.0
                    | Flags::SHORT.0)
                    & 0x0000_FFF0_0000_0000
            }
        }
    }

    /// Whether several flags of this category may be combined.
    pub const fn is_inclusive(self) -> bool {
        matches!(self, Category::DeviceType | Category::DeviceIndex | Category::Tier)
    }

    pub const fn help(self) -> &'static str {
        match self {
            Category::Default => {
                "DEFAULT selects the default device, memory type or behavior; \
                 it cannot be combined with other flags"
            }
            Category::Vendor => {
                "vendors (exclusive): AMD | APPLE | INTEL | NVIDIA; only NVIDIA devices are supported"
            }
            Category::DeviceType => {
                "device types (inclusive): ALL (any device) | CPU | ACCELERATOR (any accelerator) | GPU"
            }
            Category::DeviceIndex => {
                "device indexes (inclusive): FIRST | SECOND | THIRD | FOURTH | FIFTH | SIXTH | SEVENTH | EIGHTH \
                 select the n-th matching device"
            }
            Category::Tier => {
                "compute tiers (inclusive, GPU only): CC20 | CC30 | CC35 | CC50 | CC60 \
                 select devices whose compute capability is at least the tier"
            }
            Category::MemLocation => {
                "memory locations (exclusive): HOST (data lives in host memory) | \
                 HWA (data lives in accelerator memory)"
            }
            Category::MemProperty => {
                "memory properties (exclusive): PINNED (page-locked host copy) | \
                 ZERO_COPY (device maps host memory directly)"
            }
            Category::AccessMode => {
                "access modes (exclusive, device perspective): READ_ONLY | WRITE_ONLY | READ_WRITE"
            }
            Category::ElementType => {
                "element types (exclusive): CHAR | SHORT | INT | UNSIGNED_INT | LONG | UNSIGNED_LONG | \
                 SIZET | FLOAT | DOUBLE"
            }
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Default => "default",
            Category::Vendor => "vendor",
            Category::DeviceType => "device type",
            Category::DeviceIndex => "device index",
            Category::Tier => "compute tier",
            Category::MemLocation => "memory location",
            Category::MemProperty => "memory property",
            Category::AccessMode => "memory access mode",
            Category::ElementType => "memory element type",
        };
        f.write_str(name)
    }
}

/// A typed selector backed by one packed flag.
pub trait FlagValue: Copy + Eq + 'static {
    const CATEGORY: Category;
    const VARIANTS: &'static [Self];

    fn flag(self) -> Flags;

    fn name(self) -> &'static str;

    /// Every variant whose category bits are present in `flags`, in declaration order.
    fn present_in(flags: Flags) -> Vec<Self> {
        Self::VARIANTS.iter().copied().filter(|v| flags.have(v.flag())).collect()
    }

    /// Validate the category and return the present variants.
    ///
    /// Exclusive categories allow zero or one variant; inclusive categories
    /// allow any non-empty combination. Stray bits inside the category mask
    /// with no matching variant are rejected either way.
    fn checked(flags: Flags) -> Result<Vec<Self>> {
        flags.check_default()?;
        let present = Self::present_in(flags);
        let touched = flags.within(Self::CATEGORY) != 0;
        let valid = if !touched {
            true
        } else if Self::CATEGORY.is_inclusive() {
            !present.is_empty()
        } else {
            present.len() == 1
        };
        if valid {
            Ok(present)
        } else {
            Err(EzcuError::invalid_flags(Self::CATEGORY, flags))
        }
    }
}

/// Implements [`FlagValue`], `Display` and `From<T> for Flags` for a selector enum.
macro_rules! flag_value {
    ($ty:ident, $category:expr, [$($variant:ident => $flag:ident),+ $(,)?]) => {
        impl $crate::flags::FlagValue for $ty {
            const CATEGORY: $crate::flags::Category = $category;
            const VARIANTS: &'static [Self] = &[$($ty::$variant),+];

            fn flag(self) -> $crate::flags::Flags {
                match self {
                    $($ty::$variant => $crate::flags::Flags::$flag),+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $($ty::$variant => stringify!($flag)),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($crate::flags::FlagValue::name(*self))
            }
        }

        impl From<$ty> for $crate::flags::Flags {
            fn from(value: $ty) -> Self {
                $crate::flags::FlagValue::flag(value)
            }
        }
    };
}

pub(crate) use flag_value;

// ================================================================================================
// Tests
// ================================================================================================
