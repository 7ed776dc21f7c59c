// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub const LEN_CFG: usize = 0x100;

pub const OFF_CFG_VENDORID: usize = 0x00;
pub const OFF_CFG_DEVICEID: usize = 0x02;
pub const OFF_CFG_COMMAND: usize = 0x04;
pub const OFF_CFG_STATUS: usize = 0x06;
pub const OFF_CFG_REVISIONID: usize = 0x08;
pub const OFF_CFG_PROGIF: usize = 0x09;
pub const OFF_CFG_SUBCLASS: usize = 0x0a;
pub const OFF_CFG_CLASS: usize = 0x0b;
pub const OFF_CFG_HEADERTYPE: usize = 0x0e;
pub const OFF_CFG_BAR0: usize = 0x10;
pub const OFF_CFG_BAR1: usize = 0x14;
pub const OFF_CFG_BAR2: usize = 0x18;
pub const OFF_CFG_BAR3: usize = 0x1c;
pub const OFF_CFG_BAR4: usize = 0x20;
pub const OFF_CFG_BAR5: usize = 0x24;
pub const OFF_CFG_CAPPTR: usize = 0x34;
pub const OFF_CFG_INTRLINE: usize = 0x3c;

pub const COMMAND_IO_EN: u16 = 1 << 0;
pub const COMMAND_MEM_EN: u16 = 1 << 1;
pub const COMMAND_BUSMASTER_EN: u16 = 1 << 2;

pub const CLASS_STORAGE: u8 = 0x01;
pub const SUBCLASS_STORAGE_IDE: u8 = 0x01;
pub const SUBCLASS_STORAGE_SATA: u8 = 0x06;
pub const PROGIF_AHCI: u8 = 0x01;

/// Legacy (compatibility-mode) IDE port assignments.
pub const PORT_ATA0_CMD: u16 = 0x1f0;
pub const PORT_ATA0_CTL: u16 = 0x3f6;
pub const PORT_ATA1_CMD: u16 = 0x170;
pub const PORT_ATA1_CTL: u16 = 0x376;
