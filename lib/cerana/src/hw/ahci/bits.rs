// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AHCI register offsets and wire structures.
//!
//! Command headers, FIS frames and PRD entries are decoded from guest (or
//! receive-area) memory with explicit wire structs; no in-place pointer
//! casting.

use bitstruct::bitstruct;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const NUM_PORTS: usize = 32;
pub const NUM_SLOTS: usize = 32;

// Global HBA registers.
pub const GLOBAL_CAP: usize = 0x00;
pub const GLOBAL_GHC: usize = 0x04;
pub const GLOBAL_PI: usize = 0x0c;

pub const GLOBAL_CAP_SNCQ: u32 = 1 << 30;
pub const GLOBAL_CAP_NCS_MASK: u32 = 0x1f00;
pub const GLOBAL_CAP_NCS_SHIFT: u32 = 8;
pub const GLOBAL_CAP_NP_MASK: u32 = 0x1f;
pub const GLOBAL_GHC_AE: u32 = 1 << 31;

// Per-port register frame.
pub const PORT_BASE: usize = 0x100;
pub const PORT_STRIDE: usize = 0x80;

pub const PX_CLB: usize = 0x00;
pub const PX_CLBU: usize = 0x04;
pub const PX_FB: usize = 0x08;
pub const PX_FBU: usize = 0x0c;
pub const PX_IS: usize = 0x10;
pub const PX_IE: usize = 0x14;
pub const PX_CMD: usize = 0x18;
pub const PX_SSTS: usize = 0x28;
pub const PX_SACT: usize = 0x34;
pub const PX_CI: usize = 0x38;

pub const PXCMD_ST: u32 = 1 << 0;
pub const PXCMD_FRE: u32 = 1 << 4;
pub const PXCMD_FR: u32 = 1 << 14;
pub const PXCMD_CR: u32 = 1 << 15;

pub const PXSSTS_DET_MASK: u32 = 0xf;
pub const PXSSTS_DET_NODEV: u32 = 0x0;

pub fn port_reg(port: usize, reg: usize) -> usize {
    PORT_BASE + port * PORT_STRIDE + reg
}

/// According to the AHCI 1.3 specification, bits 0-6 of CTBA are reserved,
/// but 88SE91xx parts use them.
pub const CTBA_MASK: u32 = 0x3f;

pub const CMD_HEADER_SIZE: usize = 32;
pub const CMD_LIST_SIZE: usize = NUM_SLOTS * CMD_HEADER_SIZE;

/// Offset of the PRD table inside a command table; everything before it is
/// the CFIS (64 bytes) plus the ATAPI command (16 bytes) plus reserved
/// space.
pub const CMD_TABLE_PRDT_OFFSET: usize = 0x80;
pub const CMD_TABLE_ACMD_OFFSET: usize = 0x40;
pub const PRDT_ENTRY_SIZE: usize = 16;

pub fn cmd_table_size(prdtl: u16) -> usize {
    CMD_TABLE_PRDT_OFFSET + prdtl as usize * PRDT_ENTRY_SIZE
}

/// Maximum total DMA size one shadowed command may describe.
pub const MAX_CMD_DMA_LEN: usize = 4 * 1024 * 1024;

bitstruct! {
    /// DW0 of a command header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct CmdHeaderDw0(pub u32) {
        /// Command FIS length, in dwords.
        pub cfl: u8 = 0..5;
        /// ATAPI: the command table carries a CDB.
        pub atapi: bool = 5;
        /// Write (host to device).
        pub w: bool = 6;
        pub prefetchable: bool = 7;
        pub reset: bool = 8;
        pub bist: bool = 9;
        pub clear_busy: bool = 10;
        reserved: bool = 11;
        pub pmp: u8 = 12..16;
        /// Number of PRD entries.
        pub prdtl: u16 = 16..32;
    }
}

/// One command-list entry as it appears in guest memory and in the shadow
/// list.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct CmdHeader {
    pub dw0: u32,
    /// PRD byte count: bytes actually transferred, updated by hardware.
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    pub reserved: [u32; 4],
}

impl CmdHeader {
    pub fn flags(&self) -> CmdHeaderDw0 {
        CmdHeaderDw0(self.dw0)
    }

    pub fn set_flags(&mut self, flags: CmdHeaderDw0) {
        self.dw0 = flags.0;
    }

    pub fn ctba_phys(&self) -> u64 {
        (((self.ctbau as u64) << 32) | self.ctba as u64)
            & !(CTBA_MASK as u64)
    }
}

bitstruct! {
    /// DW3 of a PRD entry.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PrdtDw3(pub u32) {
        /// Data byte count, 0-based, bit 0 always set.
        pub dbc: u32 = 0..22;
        reserved: u16 = 22..31;
        /// Interrupt on completion.
        pub intr: bool = 31;
    }
}

/// One Physical Region Descriptor Table entry.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct PrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    pub reserved: u32,
    pub dw3: u32,
}

impl PrdtEntry {
    pub fn new(phys: u64, len: usize, intr: bool) -> Self {
        assert!(len >= 2 && len <= MAX_CMD_DMA_LEN && len % 2 == 0);
        let mut dw3 = PrdtDw3(0);
        dw3.set_dbc((len - 1) as u32);
        dw3.set_intr(intr);
        Self {
            dba: phys as u32,
            dbau: (phys >> 32) as u32,
            reserved: 0,
            dw3: dw3.0,
        }
    }

    pub fn data_phys(&self) -> u64 {
        (((self.dbau as u64) << 32) | self.dba as u64) & !1
    }

    /// Bytes described by this entry (the dbc field is 0-based with bit 0
    /// hardwired).
    pub fn byte_count(&self) -> usize {
        ((PrdtDw3(self.dw3).dbc() as usize) & 0x3f_fffe) + 2
    }

    pub fn intr(&self) -> bool {
        PrdtDw3(self.dw3).intr()
    }
}

pub const FIS_TYPE_REG_H2D: u8 = 0x27;
pub const FIS_TYPE_REG_D2H: u8 = 0x34;

/// Register Host-to-Device FIS, the first 20 bytes of a command table's
/// CFIS area.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct RegH2DFis {
    pub fis_type: u8,
    /// Port-multiplier field plus the C bit (bit 7: command register
    /// update).
    pub pm_c: u8,
    pub command: u8,
    pub features: u8,

    pub sector_number: u8,
    pub cyl_low: u8,
    pub cyl_high: u8,
    pub dev_head: u8,

    pub sector_number_exp: u8,
    pub cyl_low_exp: u8,
    pub cyl_high_exp: u8,
    pub features_exp: u8,

    pub sector_count: u8,
    pub sector_count_exp: u8,
    pub reserved: u8,
    pub control: u8,

    pub reserved2: [u8; 4],
}

impl RegH2DFis {
    /// 48-bit LBA carried across both register banks.
    pub fn lba48(&self) -> u64 {
        ((self.cyl_high_exp as u64) << 40)
            | ((self.cyl_low_exp as u64) << 32)
            | ((self.sector_number_exp as u64) << 24)
            | ((self.cyl_high as u64) << 16)
            | ((self.cyl_low as u64) << 8)
            | self.sector_number as u64
    }

    /// 28-bit LBA: low 4 bits of the device register plus the low bank.
    pub fn lba28(&self) -> u64 {
        (((self.dev_head & 0xf) as u64) << 24)
            | ((self.cyl_high as u64) << 16)
            | ((self.cyl_low as u64) << 8)
            | self.sector_number as u64
    }
}

/// Register Device-to-Host FIS as found in the receive area.
#[repr(C)]
#[derive(
    Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
pub struct RegD2HFis {
    pub fis_type: u8,
    pub pm_i: u8,
    pub status: u8,
    pub error: u8,

    pub sector_number: u8,
    pub cyl_low: u8,
    pub cyl_high: u8,
    pub dev_head: u8,

    pub sector_number_exp: u8,
    pub cyl_low_exp: u8,
    pub cyl_high_exp: u8,
    pub reserved: u8,

    pub sector_count: u8,
    pub sector_count_exp: u8,
    pub reserved2: [u8; 2],

    pub reserved3: [u8; 4],
}

/// Offset of the D2H register FIS within the receive area.
pub const RECV_FIS_RFIS_OFFSET: usize = 0x40;
pub const RECV_FIS_SIZE: usize = 0x100;
