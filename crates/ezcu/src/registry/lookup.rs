//! Device lookup table
//!
//! Three-dimensional map `[type][tier][slot] -> device`, filled once at
//! registry initialization and read by every device lookup afterwards.

use std::collections::BTreeSet;

use ezcu_driver::DeviceOrdinal;

use crate::flags::{DeviceIndex, DeviceType, FlagValue, Tier};

pub const TYPE_SLOTS: usize = 4;
pub const TIER_SLOTS: usize = 5;
pub const INDEX_SLOTS: usize = 8;

type Row = [Option<DeviceOrdinal>; INDEX_SLOTS];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupTable {
    rows: [[Row; TIER_SLOTS]; TYPE_SLOTS],
}

impl Default for LookupTable {
    fn default() -> Self {
        Self {
            rows: [[[None; INDEX_SLOTS]; TIER_SLOTS]; TYPE_SLOTS],
        }
    }
}

impl LookupTable {
    pub fn get(&self, ty: DeviceType, tier: Tier, index: DeviceIndex) -> Option<DeviceOrdinal> {
        self.rows[ty.slot()][tier.slot()][index.slot()]
    }

    pub fn set(&mut self, ty: DeviceType, tier: Tier, index: DeviceIndex, device: DeviceOrdinal) {
        self.rows[ty.slot()][tier.slot()][index.slot()] = Some(device);
    }

    /// Present entries of one row, in slot order.
    pub fn row(&self, ty: DeviceType, tier: Tier) -> Vec<DeviceOrdinal> {
        self.rows[ty.slot()][tier.slot()].iter().flatten().copied().collect()
    }

    /// Shift present entries of every row to the front, keeping their order.
    pub fn compact(&mut self) {
        for row in self.rows.iter_mut().flatten() {
            let present: Vec<DeviceOrdinal> = row.iter().flatten().copied().collect();
            *row = [None; INDEX_SLOTS];
            for (slot, device) in row.iter_mut().zip(present) {
                *slot = Some(device);
            }
        }
    }

    /// Append the entries of `from` to the rows of `into`, tier by tier.
    ///
    /// Devices already present in the target row are skipped and the row is
    /// truncated at its capacity.
    pub fn absorb(&mut self, into: DeviceType, from: DeviceType) {
        for tier in Tier::VARIANTS {
            let source = self.row(from, *tier);
            let target = &mut self.rows[into.slot()][tier.slot()];
            for device in source {
                if target.contains(&Some(device)) {
                    continue;
                }
                match target.iter_mut().find(|slot| slot.is_none()) {
                    Some(slot) => *slot = Some(device),
                    None => break,
                }
            }
        }
    }

    /// Every distinct device referenced anywhere in the table.
    pub fn devices(&self) -> BTreeSet<DeviceOrdinal> {
        self.rows.iter().flatten().flatten().flatten().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.iter().flatten().flatten().all(Option::is_none)
    }
}
