//! Memory object flags

use std::fmt;

use super::{flag_value, Category, FlagValue, Flags};
use crate::error::Result;

/// Where the authoritative copy of a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemLocation {
    Host,
    Hwa,
}

flag_value!(MemLocation, Category::MemLocation, [Host => HOST, Hwa => HWA]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemProperty {
    Pinned,
    ZeroCopy,
}

flag_value!(MemProperty, Category::MemProperty, [Pinned => PINNED, ZeroCopy => ZERO_COPY]);

/// Access pattern of a buffer, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

flag_value!(AccessMode, Category::AccessMode, [
    ReadOnly => READ_ONLY,
    WriteOnly => WRITE_ONLY,
    ReadWrite => READ_WRITE,
]);

impl AccessMode {
    /// Whether the host side observes data the device produced.
    pub fn reads(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    /// Whether this side may modify the data.
    pub fn writes(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Element type of a buffer or scalar argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Char,
    Short,
    Int,
    UnsignedInt,
    Long,
    UnsignedLong,
    SizeT,
    Float,
    Double,
}

flag_value!(ElementType, Category::ElementType, [
    Char => CHAR,
    Short => SHORT,
    Int => INT,
    UnsignedInt => UNSIGNED_INT,
    Long => LONG,
    UnsignedLong => UNSIGNED_LONG,
    SizeT => SIZET,
    Float => FLOAT,
    Double => DOUBLE,
]);

impl ElementType {
    /// Size in bytes of one element.
    pub const fn unit_size(self) -> usize {
        match self {
            ElementType::Char => 1,
            ElementType::Short => 2,
            ElementType::Int | ElementType::UnsignedInt | ElementType::Float => 4,
            ElementType::Long | ElementType::UnsignedLong | ElementType::SizeT | ElementType::Double => 8,
        }
    }

    pub const fn is_floating(self) -> bool {
        matches!(self, ElementType::Float | ElementType::Double)
    }
}

/// Decoded memory flags with defaults applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryFlags {
    pub location: MemLocation,
    pub property: Option<MemProperty>,
    pub access: AccessMode,
    pub element: ElementType,
}

impl Default for MemoryFlags {
    fn default() -> Self {
        Self {
            location: MemLocation::Hwa,
            property: None,
            access: AccessMode::ReadWrite,
            element: ElementType::Float,
        }
    }
}

impl MemoryFlags {
    /// Validate and decode. Absent axes default to `HWA | READ_WRITE | FLOAT`.
    pub fn decode(flags: Flags) -> Result<Self> {
        let location = MemLocation::checked(flags)?;
        let property = MemProperty::checked(flags)?;
        let access = AccessMode::checked(flags)?;
        let element = ElementType::checked(flags)?;

        let defaults = Self::default();
        Ok(Self {
            location: location.first().copied().unwrap_or(defaults.location),
            property: property.first().copied(),
            access: access.first().copied().unwrap_or(defaults.access),
            element: element.first().copied().unwrap_or(defaults.element),
        })
    }

    pub fn encode(&self) -> Flags {
        let mut flags = self.location.flag() | self.access.flag() | self.element.flag();
        if let Some(property) = self.property {
            flags |= property.flag();
        }
        flags
    }

    pub fn is_zero_copy(&self) -> bool {
        self.property == Some(MemProperty::ZeroCopy)
    }

    pub fn is_pinned(&self) -> bool {
        self.property == Some(MemProperty::Pinned)
    }
}

impl fmt::Display for MemoryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.location)?;
        if let Some(property) = self.property {
            write!(f, " | {property}")?;
        }
        write!(f, " | {} | {}", self.access, self.element)
    }
}
