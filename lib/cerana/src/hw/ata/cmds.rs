// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ATA command classification.
//!
//! An 8-bit command opcode maps to a `{class, rw, ext}` triple which drives
//! both the legacy channel state machine and the AHCI overlay.  The mapping
//! is total: opcodes with no assigned behavior classify as
//! [CommandClass::Invalid], never anything undefined.

use lazy_static::lazy_static;

use crate::block::Direction;

/// Behavior class of an ATA command.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum CommandClass {
    /// Unassigned opcode.
    Invalid,
    /// No data transfer; safe to pass through.
    NonData,
    /// PIO data transfer through the Data register.
    Pio,
    /// Bus-master DMA transfer.
    Dma,
    /// Overlapped/queued DMA (tagged, completed via SERVICE).
    DmaQueued,
    /// ATAPI PACKET: a SCSI CDB follows through the Data register.
    Packet,
    /// SERVICE: resume a previously queued command.
    Service,
    /// IDENTIFY DEVICE / IDENTIFY PACKET DEVICE.
    Identify,
    /// INITIALIZE DEVICE PARAMETERS (CHS geometry).
    DevParam,
    /// Pass through without emulation.
    Through,
    /// Native Command Queuing (first-party DMA queued).
    Ncq,
}

/// Classification of a single opcode.
#[derive(Copy, Clone, Debug)]
pub struct CmdType {
    pub class: CommandClass,
    pub rw: Direction,
    /// 48-bit (extended) addressing: the HOB-shadowed registers carry the
    /// high halves.
    pub ext: bool,
}

const fn t(class: CommandClass, rw: Direction, ext: bool) -> CmdType {
    CmdType { class, rw, ext }
}

fn cmd_type(opcode: u8) -> CmdType {
    use CommandClass::*;
    use Direction::{Read, Write};

    match opcode {
        // Non-data mandatory
        0x40 => t(NonData, Read, false), // READ VERIFY SECTOR
        0xe0 => t(NonData, Read, false), // STANDBY IMMEDIATE
        0xe1 => t(NonData, Read, false), // IDLE IMMEDIATE
        0xe2 => t(NonData, Read, false), // STANDBY
        0xe3 => t(NonData, Read, false), // IDLE
        0xe5 => t(NonData, Read, false), // CHECK POWER MODE
        0xe6 => t(NonData, Read, false), // SLEEP
        0xe7 => t(NonData, Read, false), // FLUSH CACHE
        0xea => t(NonData, Read, false), // FLUSH CACHE EXT
        0xc6 => t(NonData, Read, false), // SET MULTIPLE MODE
        0xef => t(NonData, Read, false), // SET FEATURES

        // Non-data optional
        0x00 => t(NonData, Read, false), // NOP
        0x03 => t(NonData, Read, false), // CFA REQUEST EXTENDED ERROR
        0x27 => t(NonData, Read, false), // READ NATIVE MAX ADDRESS EXT
        0x37 => t(NonData, Read, false), // SET MAX ADDRESS EXT
        0x42 => t(NonData, Read, false), // READ VERIFY SECTOR EXT
        0x51 => t(NonData, Read, false), // CONFIGURE STREAM
        0xc0 => t(NonData, Read, false), // CFA ERASE SECTORS
        0xd1 => t(NonData, Read, false), // CHECK MEDIA CARD TYPE
        0xda => t(NonData, Read, false), // GET MEDIA STATUS
        0xde => t(NonData, Read, false), // MEDIA LOCK
        0xdf => t(NonData, Read, false), // MEDIA UNLOCK
        0xed => t(NonData, Read, false), // MEDIA EJECT
        0xf3 => t(NonData, Read, false), // SECURITY ERASE PREPARE
        0xf5 => t(NonData, Read, false), // SECURITY FREEZE LOCK
        0xf8 => t(NonData, Read, false), // READ NATIVE MAX ADDRESS
        0xf9 => t(NonData, Read, false), // SET MAX ADDRESS

        // Obsoleted
        0x10 => t(NonData, Read, false), // RECALIBRATE (until ATA-3)

        // PIO in
        0x20 => t(Pio, Read, false), // READ SECTOR
        0x21 => t(Pio, Read, false), // READ SECTOR NORETRY
        0xc4 => t(Pio, Read, false), // READ SECTOR MULTIPLE
        0x24 => t(Pio, Read, true),  // READ SECTOR EXT
        0x29 => t(Pio, Read, true),  // READ SECTOR MULTIPLE EXT

        // PIO out
        0x30 => t(Pio, Write, false), // WRITE SECTOR
        0xc5 => t(Pio, Write, false), // WRITE SECTOR MULTIPLE
        0x34 => t(Pio, Write, true),  // WRITE SECTOR EXT
        0x39 => t(Pio, Write, true),  // WRITE SECTOR MULTIPLE EXT

        // DMA
        0xc8 => t(Dma, Read, false),  // READ DMA
        0x25 => t(Dma, Read, true),   // READ DMA EXT
        0xca => t(Dma, Write, false), // WRITE DMA
        0x35 => t(Dma, Write, true),  // WRITE DMA EXT
        0x3d => t(Dma, Write, true),  // WRITE DMA FUA EXT

        // Queued DMA
        0xc7 => t(DmaQueued, Read, false),  // READ DMA QUEUED
        0xcc => t(DmaQueued, Write, false), // WRITE DMA QUEUED
        0x26 => t(DmaQueued, Read, true),   // READ DMA QUEUED EXT
        0x36 => t(DmaQueued, Write, true),  // WRITE DMA QUEUED EXT
        0x3e => t(DmaQueued, Write, true),  // WRITE DMA QUEUED FUA EXT

        // ATAPI
        0xa0 => t(Packet, Read, false),   // PACKET
        0xa1 => t(Identify, Read, true),  // IDENTIFY PACKET DEVICE
        0xa2 => t(Service, Read, false),  // SERVICE
        0x08 => t(NonData, Read, false),  // DEVICE RESET

        // Command specific
        0x91 => t(DevParam, Read, false), // INITIALIZE DEVICE PARAMETERS
        0xec => t(Identify, Read, false), // IDENTIFY DEVICE

        // Pass-through, PIO read side not reconstructed
        0xb0 => t(Through, Read, false), // SMART
        0x2f => t(Through, Read, false), // READ LOG EXT
        0x06 => t(Through, Read, false), // DATA SET MANAGEMENT (TRIM)

        // Pass-through DMA
        0x47 => t(Through, Read, false), // READ LOG DMA EXT

        // Native Command Queuing
        0x60 => t(Ncq, Read, false),  // READ FPDMA QUEUED
        0x61 => t(Ncq, Write, false), // WRITE FPDMA QUEUED

        _ => t(Invalid, Read, false),
    }
}

lazy_static! {
    static ref CMD_TYPES: [CmdType; 256] = {
        let mut table = [t(CommandClass::Invalid, Direction::Read, false); 256];
        let mut i = 0usize;
        while i < 256 {
            table[i] = cmd_type(i as u8);
            i += 1;
        }
        table
    };
}

/// Classify an ATA command opcode.  Pure; total over all 256 byte values.
pub fn classify(opcode: u8) -> CmdType {
    CMD_TYPES[opcode as usize]
}

// Opcodes referenced by name elsewhere in the crate.
pub const CMD_PACKET: u8 = 0xa0;
pub const CMD_IDENTIFY_PACKET_DEVICE: u8 = 0xa1;
pub const CMD_IDENTIFY_DEVICE: u8 = 0xec;
pub const CMD_FLUSH_CACHE: u8 = 0xe7;
