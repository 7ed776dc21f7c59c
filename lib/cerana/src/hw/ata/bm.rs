// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus-master (legacy IDE DMA) register handlers.
//!
//! The guest's PRD table is never handed to the controller.  Instead the
//! channel carries a fixed shadow buffer and a shadow PRD describing it;
//! guest memory is copied in or out around the physical transfer.

use slog::warn;

use crate::block::Direction;
use crate::common::{GuestAddr, IoDisposition, RWOp};
use crate::hw::ata::bits::*;
use crate::hw::ata::channel::{AtaChannel, ChannelInner, ChannelState};
use crate::hw::ata::{probes, RegBlock};

impl AtaChannel {
    /// Bus Master register handler.
    pub fn bm_rw(&self, mut rwo: RWOp) -> IoDisposition {
        let reg = rwo.offset();
        if reg < REG_BM_PRD_TABLE && rwo.len() != 1 {
            warn!(self.log, "unexpected bus-master access width";
                "reg" => reg, "len" => rwo.len());
            return IoDisposition::Block;
        }

        let _guard = self.guard();
        let mut inner = self.inner.lock().unwrap();

        match reg {
            REG_BM_COMMAND => self.bm_command(&mut inner, &mut rwo),
            REG_BM_STATUS => self.bm_status(&mut inner, &mut rwo),
            REG_BM_DS1 | REG_BM_DS3 => IoDisposition::Default,
            _ => self.bm_prd_table(&mut inner, &mut rwo),
        }
    }

    /// BM Command register: starting the engine is only legal from
    /// DMA_READY; anywhere else the access is blocked rather than allowed
    /// to start DMA at an unexpected point.
    fn bm_command(
        &self,
        inner: &mut ChannelInner,
        rwo: &mut RWOp,
    ) -> IoDisposition {
        let RWOp::Write(wo) = rwo else {
            return IoDisposition::Default;
        };
        let cmd = BmCommand(wo.read_u8());
        if !cmd.start() {
            return IoDisposition::Default;
        }
        if inner.state != ChannelState::DmaReady {
            return IoDisposition::Block;
        }

        let total = if cmd.rw() {
            // Device-to-memory: the data arrives once the controller has
            // run; size the shadow now, copy on completion.
            inner.state = ChannelState::DmaRead;
            self.guest_prd_total(inner)
        } else {
            // Memory-to-device: stage guest data and perform the backend
            // write before the controller sees the command.
            inner.state = ChannelState::DmaWrite;
            let total = self.copy_shadow(inner, Direction::Write);
            self.dma_rw_sectors(inner, Direction::Write);
            total
        };
        probes::ata_bm_start!(|| (
            self.id as u8,
            u8::from(!cmd.rw()),
            total as u32
        ));
        self.set_shadow_prd(total);
        IoDisposition::Default
    }

    /// BM Status register: completion is detected here once the hardware
    /// clears its `active` bit.
    fn bm_status(
        &self,
        inner: &mut ChannelInner,
        rwo: &mut RWOp,
    ) -> IoDisposition {
        if inner.state != ChannelState::DmaRead
            && inner.state != ChannelState::DmaWrite
        {
            return IoDisposition::Default;
        }

        // Forward the access first, mirroring what the guest would have
        // done, then look at the hardware state.
        let status = match rwo {
            RWOp::Read(ro) => {
                let val = self.io.read8(RegBlock::BusMaster, REG_BM_STATUS);
                ro.write_u8(val);
                BmStatus(val)
            }
            RWOp::Write(wo) => {
                let val = wo.read_u8();
                self.io.write8(RegBlock::BusMaster, REG_BM_STATUS, val);
                BmStatus(self.io.read8(RegBlock::BusMaster, REG_BM_STATUS))
            }
        };
        if status.active() {
            return IoDisposition::Done;
        }

        if inner.state == ChannelState::DmaRead {
            self.dma_rw_sectors(inner, Direction::Read);
            self.copy_shadow(inner, Direction::Read);
        }
        if inner.state != ChannelState::Error {
            inner.state = ChannelState::Ready;
        }
        IoDisposition::Done
    }

    /// PRD table pointer: the guest's value is stored, the hardware always
    /// receives the shadow table's address.
    fn bm_prd_table(
        &self,
        inner: &mut ChannelInner,
        rwo: &mut RWOp,
    ) -> IoDisposition {
        let off = rwo.offset() - REG_BM_PRD_TABLE;
        let bytes = inner.guest_prd_phys.to_le_bytes();
        // An access can reach at most the tail of the 4-byte pointer.
        let avail = bytes.len().saturating_sub(off);
        match rwo {
            RWOp::Read(ro) => {
                let len = ro.len().min(avail);
                ro.write_bytes(&bytes[off..off + len]);
                ro.fill(0);
            }
            RWOp::Write(wo) => {
                let mut bytes = bytes;
                let len = wo.len().min(avail);
                wo.read_bytes(&mut bytes[off..off + len]);
                inner.guest_prd_phys = u32::from_le_bytes(bytes);
                self.io.write32(
                    RegBlock::BusMaster,
                    REG_BM_PRD_TABLE,
                    self.shadow_prd.phys() as u32,
                );
            }
        }
        IoDisposition::Done
    }

    //
    // PRD walking.
    //

    /// Total byte count described by the guest's PRD chain.  Exceeding the
    /// shadow capacity is a configuration error: the caps are sized beyond
    /// any legitimate guest workload.
    pub(crate) fn guest_prd_total(&self, inner: &ChannelInner) -> usize {
        let mut total = 0usize;
        let mut prd_phys = inner.guest_prd_phys as u64;
        loop {
            let prd: PrdEntry = self
                .mem
                .read(GuestAddr(prd_phys))
                .expect("guest PRD table must be mapped");
            total += prd.byte_count();
            if total > BM_TOTAL_BUFSIZE {
                panic!("DMA buffer size too small");
            }
            if prd.eot() {
                break;
            }
            prd_phys += std::mem::size_of::<PrdEntry>() as u64;
        }
        total
    }

    /// Copy between the guest's PRD-described buffers and the shadow
    /// buffer.  `dir` is the storage direction: a `Write` stages guest
    /// memory into the shadow, a `Read` distributes the shadow back out.
    pub(crate) fn copy_shadow(
        &self,
        inner: &ChannelInner,
        dir: Direction,
    ) -> usize {
        let mut total = 0usize;
        let mut prd_phys = inner.guest_prd_phys as u64;
        loop {
            let prd: PrdEntry = self
                .mem
                .read(GuestAddr(prd_phys))
                .expect("guest PRD table must be mapped");
            let count = prd.byte_count();
            if total + count > BM_TOTAL_BUFSIZE {
                panic!("DMA buffer size too small");
            }

            let mut chunk = vec![0u8; count];
            match dir {
                Direction::Write => {
                    if !self
                        .mem
                        .read_into(GuestAddr(prd.base as u64), &mut chunk)
                    {
                        warn!(self.log, "unmapped guest DMA segment";
                            "base" => prd.base);
                    }
                    self.shadow_buf.copy_in(total, &chunk);
                }
                Direction::Read => {
                    self.shadow_buf.copy_out(total, &mut chunk);
                    if !self.mem.write_from(GuestAddr(prd.base as u64), &chunk)
                    {
                        warn!(self.log, "unmapped guest DMA segment";
                            "base" => prd.base);
                    }
                }
            }

            total += count;
            if prd.eot() {
                break;
            }
            prd_phys += std::mem::size_of::<PrdEntry>() as u64;
        }
        total
    }

    /// Describe `count` bytes of the shadow buffer in the shadow PRD
    /// table, chunked at the 64 KiB PRD granularity.  Only the final entry
    /// carries EOT.
    pub(crate) fn set_shadow_prd(&self, count: usize) {
        assert!(count > 0 && count <= BM_TOTAL_BUFSIZE);
        let mut remain = count;
        let mut index = 0usize;
        while remain > BM_BUFSIZE {
            let entry = PrdEntry::new(
                (self.shadow_buf.phys() + (index * BM_BUFSIZE) as u64) as u32,
                0, // zero count encodes the full 64 KiB
                false,
            );
            self.shadow_prd
                .write_obj(index * std::mem::size_of::<PrdEntry>(), &entry);
            remain -= BM_BUFSIZE;
            index += 1;
        }
        let entry = PrdEntry::new(
            (self.shadow_buf.phys() + (index * BM_BUFSIZE) as u64) as u32,
            // The full 64 KiB chunk size becomes count 0.
            (remain % BM_BUFSIZE) as u16,
            true,
        );
        self.shadow_prd
            .write_obj(index * std::mem::size_of::<PrdEntry>(), &entry);
    }

    /// Perform the backend transfer for the sectors covered by the current
    /// DMA command, operating on the shadow buffer.
    pub(crate) fn dma_rw_sectors(
        &self,
        inner: &mut ChannelInner,
        dir: Direction,
    ) {
        let Some(lba) = inner.lba else {
            return;
        };
        if inner.atapi_flag
            && inner.atapi_dma_state != ChannelState::DmaReady
        {
            return;
        }

        let device = inner.current_device();
        let backend = device.backend.clone();
        let sector_size = device.sector_size;
        let bytes = inner.sector_count as usize * sector_size;
        assert!(bytes <= BM_TOTAL_BUFSIZE);

        let mut buf = vec![0u8; bytes];
        let res = match dir {
            Direction::Read => {
                let r = backend.read(lba, sector_size, &mut buf);
                if r.is_ok() {
                    self.shadow_buf.copy_in(0, &buf);
                }
                r
            }
            Direction::Write => {
                self.shadow_buf.copy_out(0, &mut buf);
                backend.write(lba, sector_size, &buf)
            }
        };
        if let Err(e) = res {
            warn!(self.log, "backend DMA transfer failed";
                "lba" => lba, "error" => %e);
            inner.state = ChannelState::Error;
        }
        inner.atapi_dma_state = ChannelState::DmaThrough;
    }
}
