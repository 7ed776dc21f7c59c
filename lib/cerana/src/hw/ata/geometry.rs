// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Record, Result, Serializer, KV};

use crate::hw::ata::bits::{DEFAULT_HEADS, DEFAULT_SECTORS};

/// Legacy CHS translation parameters for one device, as programmed by
/// INITIALIZE DEVICE PARAMETERS.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub heads_per_cylinder: u8,
    pub sectors_per_track: u8,
}

impl Geometry {
    /// Translate a cylinder/head/sector triple to a logical block address.
    ///
    /// Sector numbering is 1-based; an all-zero CHS triple therefore
    /// wraps, which real devices answer with ID Not Found on the first
    /// media access.
    pub fn chs_to_lba(&self, cylinder: u16, head: u8, sector: u8) -> u64 {
        let heads = self.heads_per_cylinder as u64;
        let sectors = self.sectors_per_track as u64;
        ((cylinder as u64 * heads) + head as u64) * sectors
            + sector as u64
            - 1
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            heads_per_cylinder: DEFAULT_HEADS,
            sectors_per_track: DEFAULT_SECTORS,
        }
    }
}

impl KV for Geometry {
    fn serialize(
        &self,
        _rec: &Record,
        serializer: &mut dyn Serializer,
    ) -> Result {
        serializer.emit_u8("heads", self.heads_per_cylinder)?;
        serializer.emit_u8("sectors", self.sectors_per_track)
    }
}
