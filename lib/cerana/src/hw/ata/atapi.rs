// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ATAPI (packet) overlay on the legacy channel.
//!
//! A PACKET command turns the PIO engine into a CDB relay: the guest
//! writes a 12/16-byte SCSI CDB through the Data register, the CDB is
//! classified, and the reconstructed operation drives the same transfer
//! context the plain ATA commands use.

use slog::warn;

use crate::block::{Direction, Permission};
use crate::common::{IoDisposition, ReadOp};
use crate::hw::ata::bits::*;
use crate::hw::ata::channel::{
    AtaChannel, ChannelInner, ChannelState, PioHandler, QueuedCmd,
    StatusHook,
};
use crate::hw::ata::packet::{self, PacketClass};

impl AtaChannel {
    /// Intercept reads of the Interrupt Reason register (Sector Count by
    /// its ATA name) while a packet command is in flight.
    pub(crate) fn atapi_interrupt_reason(
        &self,
        inner: &mut ChannelInner,
        ro: &mut ReadOp,
    ) -> IoDisposition {
        if !inner.atapi_flag {
            return IoDisposition::Default;
        }

        let reason = self.read_interrupt_reason();
        if reason.cd() && reason.io() {
            // Status phase: the packet protocol is complete.
            inner.state = ChannelState::Ready;
        }
        ro.write_u8(reason.0);
        IoDisposition::Done
    }

    /// PACKET command: arm the PIO engine to collect the CDB.
    pub(crate) fn cmd_packet(
        &self,
        inner: &mut ChannelInner,
    ) -> IoDisposition {
        let low = self.read_reg(REG_BYTE_COUNT_LOW) as usize;
        let high = self.read_reg(REG_BYTE_COUNT_HIGH) as usize;
        inner.atapi_data_length = (high << 8) | low;

        inner.pio_block_size = inner.current_device().packet_length;
        inner.rw = Direction::Write;
        inner.lba = None;
        inner.sector_count = 1;
        inner.pio_handler = Some(PioHandler::PacketCdb);
        IoDisposition::Default
    }

    /// A complete CDB has been written through the Data register.
    pub(crate) fn pio_packet_cdb(
        &self,
        inner: &mut ChannelInner,
    ) -> IoDisposition {
        inner.atapi_flag = true;

        let cdb_len = inner.current_device().packet_length;
        let mut cdb = [0u8; 16];
        cdb[..cdb_len].copy_from_slice(&inner.pio_buf[..cdb_len]);
        let op = packet::classify(&cdb[..cdb_len.max(12)]);

        let features = AtapiFeatures(inner.features.cur());

        match op.class {
            PacketClass::Command => {
                if let Some(lba) = op.lba {
                    let device = inner.current_device();
                    if device.policy.check_lba(op.rw, lba, op.sector_count)
                        != Permission::Allow
                    {
                        inner.state = ChannelState::Error;
                        // Consume the CDB so the device never sees it.
                        return IoDisposition::Done;
                    }
                }
                inner.pio_handler = Some(PioHandler::AtapiData);
                inner.atapi_dma_state = if features.dma() {
                    ChannelState::DmaReady
                } else {
                    ChannelState::DmaThrough
                };
            }
            PacketClass::SectorSize | PacketClass::BufferLength => {
                inner.pio_handler = Some(PioHandler::ConfigData);
                inner.atapi_dma_state = ChannelState::DmaThrough;
            }
            PacketClass::NonData
            | PacketClass::Data
            | PacketClass::Through => {
                inner.pio_handler = None;
                inner.atapi_dma_state = ChannelState::DmaThrough;
            }
        }

        let data_state = match op.class {
            PacketClass::NonData => ChannelState::Ready,
            // Unclassified data flows through the Data register untouched.
            PacketClass::Data | PacketClass::Through => {
                ChannelState::PacketData
            }
            _ => ChannelState::PioReady,
        };

        if features.ovl() {
            // Overlapped: park the reconstructed operation under the tag
            // and wait for SERVICE.
            let tag = self.read_interrupt_reason().tag() as usize;
            let next_state = if features.dma() {
                ChannelState::DmaReady
            } else {
                data_state
            };
            let dma_state = inner.atapi_dma_state;
            let device = inner.current_device_mut();
            device.current_tag = tag;
            device.queue[tag] = Some(QueuedCmd {
                rw: op.rw,
                lba: op.lba,
                sector_count: op.sector_count,
                next_state,
                pio_block_size: op.sector_size,
                dma_state,
            });
            inner.status_hook = Some(StatusHook::Queued);
            inner.state = ChannelState::Queued;
        } else {
            inner.rw = op.rw;
            inner.lba = op.lba;
            inner.sector_count = op.sector_count;
            inner.state = if features.dma() {
                ChannelState::DmaReady
            } else {
                data_state
            };

            if !features.dma() {
                // A short allocation length truncates the PIO block.
                let data_length = inner.atapi_data_length;
                inner.pio_block_size = if op.sector_size > data_length
                    && data_length > 0
                {
                    data_length
                } else {
                    op.sector_size
                };
            }
        }
        IoDisposition::Default
    }

    /// Perform the real sector transfer behind an ATAPI PIO data block.
    pub(crate) fn pio_atapi_data(
        &self,
        inner: &mut ChannelInner,
        dir: Direction,
    ) -> IoDisposition {
        let Some(lba) = inner.lba else {
            return IoDisposition::Default;
        };
        let block = inner.pio_block_size;
        let device = inner.current_device();
        let backend = device.backend.clone();
        let sector_size = device.sector_size;
        if block < sector_size {
            // Truncated transfer (allocation length shorter than a
            // sector): leave the relayed bytes untouched.
            return IoDisposition::Default;
        }
        let res = match dir {
            Direction::Read => {
                backend.read(lba, sector_size, &mut inner.pio_buf[..block])
            }
            Direction::Write => {
                backend.write(lba, sector_size, &inner.pio_buf[..block])
            }
        };
        if let Err(e) = res {
            warn!(self.log, "backend ATAPI transfer failed";
                "lba" => lba, "error" => %e);
            inner.state = ChannelState::Error;
        }
        IoDisposition::Default
    }
}
