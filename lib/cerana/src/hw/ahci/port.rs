// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-port shadow command handling.
//!
//! The guest's command list never reaches the hardware.  Each port owns a
//! shadow list; when the guest sets PxCI bits, the referenced command
//! headers are copied, their scatter/gather tables collapsed into a single
//! shadow PRD entry, and the classified operation recorded per slot.
//! Retirement is detected by the hardware clearing its PxCI/PxSACT bits.

use std::sync::Arc;

use slog::{info, warn};

use crate::block::{Backend, Direction, ATAPI_SECTOR_SIZE};
use crate::common::{GuestAddr, PAGE_SIZE};
use crate::hw::ahci::bits::*;
use crate::hw::ahci::AhciData;
use crate::hw::ata::cmds::{self, CommandClass};
use crate::hw::ata::packet::{self, PacketClass};
use crate::vmm::{DmaArena, DmaBuffer};
use zerocopy::FromBytes;

/// Identify flavor dispatched through a slot, checked at completion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum IdentifyKind {
    None,
    Device,
    Packet,
}

/// Media access reconstructed from a slot's command.
#[derive(Copy, Clone, Debug)]
pub(crate) struct MediaOp {
    pub lba: u64,
    pub nsec: u32,
    pub ssiz: usize,
}

/// State of one dispatched-but-unretired slot.  The slot table entry being
/// `Some` *is* the shadow bit; `dmabuf` is `None` only for commands with
/// no data phase.
pub(crate) struct ShadowState {
    pub dmabuf: Option<DmaBuffer>,
    pub write: bool,
    pub media: Option<MediaOp>,
    pub identify: IdentifyKind,
}

pub(crate) struct Slot {
    /// Shadow command table (CFIS + ACMD + one PRD entry).
    pub cmdtbl: DmaBuffer,
    pub shadow: Option<ShadowState>,
}

/// Emulation state of one AHCI port.
pub struct AhciPortState {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) atapi: bool,
    /// Guest-programmed command list base; the hardware always sees the
    /// shadow list instead.
    pub(crate) clb: u32,
    pub(crate) clbu: u32,
    pub(crate) mylist: DmaBuffer,
    pub(crate) slots: Vec<Slot>,
}

impl AhciPortState {
    pub(crate) fn new(arena: &DmaArena, backend: Arc<dyn Backend>) -> Self {
        let mylist = arena.alloc(CMD_LIST_SIZE, 0x400);
        mylist.fill(0);
        let slots = (0..NUM_SLOTS)
            .map(|_| {
                let cmdtbl = arena.alloc(PAGE_SIZE, PAGE_SIZE);
                cmdtbl.fill(0);
                Slot { cmdtbl, shadow: None }
            })
            .collect();
        Self { backend, atapi: false, clb: 0, clbu: 0, mylist, slots }
    }

    pub(crate) fn clb_phys(&self) -> u64 {
        ((self.clbu as u64) << 32) | self.clb as u64
    }

    /// Bitmask view of the slot table: a set bit means the slot is
    /// dispatched to the shadow and not yet retired.
    pub fn shadow_mask(&self) -> u32 {
        self.slots.iter().enumerate().fold(0, |mask, (i, slot)| {
            if slot.shadow.is_some() {
                mask | (1 << i)
            } else {
                mask
            }
        })
    }

    /// PxCMD.ST was cleared with commands outstanding: drop every shadow
    /// allocation.
    pub(crate) fn cmd_cancel(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.shadow = None;
        }
    }
}

impl AhciData {
    /// Total byte count and merged interrupt flag of a guest PRD table.
    fn dmalen(
        &self,
        ctphys: u64,
        prdtl: u16,
    ) -> (usize, bool) {
        let mut total = 0usize;
        let mut intr = false;
        for i in 0..prdtl as usize {
            let entry: PrdtEntry = self
                .mem
                .read(GuestAddr(
                    ctphys
                        + (CMD_TABLE_PRDT_OFFSET + i * PRDT_ENTRY_SIZE)
                            as u64,
                ))
                .expect("guest command table must be mapped");
            total += entry.byte_count();
            intr |= entry.intr();
        }
        (total, intr)
    }

    /// Copy between the guest's PRD-described regions and a slot's shadow
    /// buffer.
    fn copy_dmabuf(
        &self,
        dmabuf: &DmaBuffer,
        wr: bool,
        ctphys: u64,
        prdtl: u16,
    ) {
        let mut remain = dmabuf.len();
        let mut off = 0usize;
        for i in 0..prdtl as usize {
            let entry: PrdtEntry = self
                .mem
                .read(GuestAddr(
                    ctphys
                        + (CMD_TABLE_PRDT_OFFSET + i * PRDT_ENTRY_SIZE)
                            as u64,
                ))
                .expect("guest command table must be mapped");
            let dbc = entry.byte_count();
            assert!(remain >= dbc);
            remain -= dbc;

            let mut chunk = vec![0u8; dbc];
            if wr {
                // Guest buffer to shadow buffer.
                if !self
                    .mem
                    .read_into(GuestAddr(entry.data_phys()), &mut chunk)
                {
                    warn!(self.log, "unmapped guest DMA segment";
                        "base" => entry.data_phys());
                }
                dmabuf.copy_in(off, &chunk);
            } else {
                // Shadow buffer to guest buffer.
                dmabuf.copy_out(off, &mut chunk);
                if !self.mem.write_from(GuestAddr(entry.data_phys()), &chunk)
                {
                    warn!(self.log, "unmapped guest DMA segment";
                        "base" => entry.data_phys());
                }
            }
            off += dbc;
        }
    }

    /// Guest wrote PxCI: shadow every newly issued slot.
    pub(crate) fn cmd_start(&self, port: &mut AhciPortState, pxci: u32) {
        for i in 0..NUM_SLOTS {
            if pxci & (1 << i) == 0 {
                continue;
            }
            let guest_hdr: CmdHeader = self
                .mem
                .read(GuestAddr(port.clb_phys() + (i * CMD_HEADER_SIZE) as u64))
                .expect("guest command list must be mapped");
            let mut hdr = guest_hdr;
            let prdtl = hdr.flags().prdtl();

            let shadow = if prdtl > 0 {
                let ctphys = hdr.ctba_phys();
                let mut cfis_area = [0u8; CMD_TABLE_PRDT_OFFSET];
                if !self.mem.read_into(GuestAddr(ctphys), &mut cfis_area) {
                    warn!(self.log, "unmapped guest command table";
                        "ctba" => ctphys);
                }
                let (totalsize, intr) = self.dmalen(ctphys, prdtl);
                assert!(totalsize <= MAX_CMD_DMA_LEN);

                let slot = &port.slots[i];
                if slot.shadow.is_some() {
                    panic!("slot {} already has a shadow allocation", i);
                }
                let alloc_len = (totalsize.max(2) + 1) & !1usize;
                let dmabuf = self.arena.alloc(alloc_len, 0x80);

                // One shadow PRD entry covers the whole transfer; the
                // interrupt flag is the OR of the guest's entries.
                slot.cmdtbl.copy_in(0, &cfis_area);
                slot.cmdtbl.write_obj(
                    CMD_TABLE_PRDT_OFFSET,
                    &PrdtEntry::new(dmabuf.phys(), totalsize, intr),
                );

                let mut flags = hdr.flags();
                flags.set_prdtl(1);
                hdr.set_flags(flags);
                hdr.ctba = slot.cmdtbl.phys() as u32;
                hdr.ctbau = (slot.cmdtbl.phys() >> 32) as u32;

                if hdr.flags().w() {
                    self.copy_dmabuf(&dmabuf, true, ctphys, prdtl);
                }

                self.cmd_prehook(port, &hdr, &cfis_area, dmabuf)
            } else {
                // Pure non-data command: nothing to shadow beyond the
                // dispatch itself.
                ShadowState {
                    dmabuf: None,
                    write: hdr.flags().w(),
                    media: None,
                    identify: IdentifyKind::None,
                }
            };

            port.mylist
                .write_obj(i * CMD_HEADER_SIZE, &hdr);
            port.slots[i].shadow = Some(shadow);
        }
    }

    /// Classify the slot's command and perform the storage side of writes
    /// before the hardware ever runs the command.
    fn cmd_prehook(
        &self,
        port: &AhciPortState,
        hdr: &CmdHeader,
        cfis_area: &[u8],
        dmabuf: DmaBuffer,
    ) -> ShadowState {
        let fis = RegH2DFis::read_from_bytes(&cfis_area[..20]).unwrap();
        assert_eq!(fis.fis_type, FIS_TYPE_REG_H2D, "unexpected FIS type");

        let w = hdr.flags().w();
        let mut shadow = ShadowState {
            dmabuf: None,
            write: w,
            media: None,
            identify: IdentifyKind::None,
        };

        if hdr.flags().atapi() {
            let acmd = &cfis_area
                [CMD_TABLE_ACMD_OFFSET..CMD_TABLE_ACMD_OFFSET + 16];
            let ty = cmds::classify(fis.command);
            assert_eq!(
                ty.class,
                CommandClass::Packet,
                "ATAPI header without PACKET command"
            );
            let op = packet::classify(&acmd[..12]);
            if op.class == PacketClass::Command {
                let lba = op.lba.unwrap_or(0);
                if dmabuf.len()
                    != op.sector_count as usize * op.sector_size
                {
                    panic!(
                        "ATAPI DMA length {} != {} sectors of {}",
                        dmabuf.len(),
                        op.sector_count,
                        op.sector_size
                    );
                }
                shadow.media = Some(MediaOp {
                    lba,
                    nsec: op.sector_count,
                    ssiz: op.sector_size,
                });
            }
        } else {
            let ty = cmds::classify(fis.command);
            match ty.class {
                CommandClass::Pio | CommandClass::Dma => {
                    shadow.media =
                        Some(self.media_op_dma(&fis, &dmabuf, w, ty.rw));
                }
                CommandClass::Ncq => {
                    shadow.media =
                        Some(self.media_op_ncq(&fis, &dmabuf, w, ty.rw));
                }
                CommandClass::Identify => {
                    shadow.identify = if ty.ext {
                        IdentifyKind::Packet
                    } else {
                        IdentifyKind::Device
                    };
                }
                CommandClass::NonData
                | CommandClass::DevParam
                | CommandClass::Through => {}
                CommandClass::Invalid => {
                    panic!(
                        "AHCI: invalid ATA command {:#04x}",
                        fis.command
                    );
                }
                CommandClass::Packet
                | CommandClass::DmaQueued
                | CommandClass::Service => {
                    panic!(
                        "AHCI: no handler for command {:#04x}",
                        fis.command
                    );
                }
            }
            assert!(
                shadow.media.is_none() || !port.atapi,
                "ATA media command on an ATAPI port"
            );
        }

        // Writes hit storage now, while the shadow buffer still holds the
        // guest's data; reads happen at completion.
        if let Some(media) = shadow.media {
            if w {
                let mut buf = vec![0u8; dmabuf.len()];
                dmabuf.copy_out(0, &mut buf);
                if let Err(e) =
                    port.backend.write(media.lba, media.ssiz, &buf)
                {
                    warn!(self.log, "backend AHCI write failed";
                        "lba" => media.lba, "error" => %e);
                }
            }
        }

        shadow.dmabuf = Some(dmabuf);
        shadow
    }

    fn media_op_dma(
        &self,
        fis: &RegH2DFis,
        dmabuf: &DmaBuffer,
        header_w: bool,
        rw: Direction,
    ) -> MediaOp {
        let ext = cmds::classify(fis.command).ext;
        assert!(fis.dev_head & 0x40 != 0, "DMA command without LBA mode");
        assert!(dmabuf.len() % 512 == 0);
        assert_eq!(
            header_w,
            rw == Direction::Write,
            "header W bit contradicts the command direction"
        );

        let (lba, mut nsec) = if ext {
            let nsec = ((fis.sector_count_exp as u32) << 8)
                | fis.sector_count as u32;
            (fis.lba48(), if nsec == 0 { 65536 } else { nsec })
        } else {
            let nsec = fis.sector_count as u32;
            (fis.lba28(), if nsec == 0 { 256 } else { nsec })
        };
        if (dmabuf.len() >> 9) as u32 != nsec {
            warn!(self.log, "DMA length disagrees with sector count";
                "bytes" => dmabuf.len(), "nsec" => nsec);
            nsec = (dmabuf.len() >> 9) as u32;
        }
        MediaOp { lba, nsec, ssiz: 512 }
    }

    fn media_op_ncq(
        &self,
        fis: &RegH2DFis,
        dmabuf: &DmaBuffer,
        header_w: bool,
        rw: Direction,
    ) -> MediaOp {
        assert!(fis.dev_head & 0x40 != 0, "NCQ command without LBA mode");
        assert!(dmabuf.len() % 512 == 0);
        assert_eq!(
            header_w,
            rw == Direction::Write,
            "header W bit contradicts the command direction"
        );

        // NCQ carries the sector count in the Features register pair.
        let nsec =
            ((fis.features_exp as u32) << 8) | fis.features as u32;
        let mut nsec = if nsec == 0 { 65536 } else { nsec };
        if (dmabuf.len() >> 9) as u32 != nsec {
            warn!(self.log, "NCQ length disagrees with sector count";
                "bytes" => dmabuf.len(), "nsec" => nsec);
            nsec = (dmabuf.len() >> 9) as u32;
        }
        MediaOp { lba: fis.lba48(), nsec, ssiz: 512 }
    }

    /// Detect retired slots (shadow set, hardware PxCI and PxSACT bits
    /// clear) and finish them: run the post-hook, copy read data back to
    /// the guest's buffers, and propagate the transferred byte count.
    pub(crate) fn cmd_complete(
        &self,
        port: &mut AhciPortState,
        pxsact: u32,
        pxci: u32,
    ) {
        for i in 0..NUM_SLOTS {
            if port.slots[i].shadow.is_none() {
                continue;
            }
            if pxci & (1 << i) != 0 || pxsact & (1 << i) != 0 {
                continue;
            }
            let shadow = port.slots[i].shadow.take().unwrap();

            // The guest may have rewritten its command table pointer; use
            // the live header for the copy-back, exactly as the transfer
            // would have.
            let hdr_addr =
                GuestAddr(port.clb_phys() + (i * CMD_HEADER_SIZE) as u64);
            let guest_hdr: CmdHeader = self
                .mem
                .read(hdr_addr)
                .expect("guest command list must be mapped");
            let prdtl = guest_hdr.flags().prdtl();

            if let Some(dmabuf) = shadow.dmabuf.as_ref() {
                match shadow.identify {
                    IdentifyKind::Packet => {
                        self.identity_check(port, dmabuf);
                    }
                    IdentifyKind::Device => {
                        info!(self.log, "AHCI IDENTIFY");
                    }
                    IdentifyKind::None => {
                        if let Some(media) = shadow.media {
                            if !shadow.write {
                                let mut buf = vec![0u8; dmabuf.len()];
                                if let Err(e) = port.backend.read(
                                    media.lba,
                                    media.ssiz,
                                    &mut buf,
                                ) {
                                    warn!(self.log,
                                        "backend AHCI read failed";
                                        "lba" => media.lba, "error" => %e);
                                } else {
                                    dmabuf.copy_in(0, &buf);
                                }
                            }
                        }
                    }
                }

                if !shadow.write && prdtl > 0 {
                    self.copy_dmabuf(
                        dmabuf,
                        false,
                        guest_hdr.ctba_phys(),
                        prdtl,
                    );
                }
            } else {
                assert!(
                    shadow.media.is_none(),
                    "media command without a shadow buffer"
                );
            }

            // Propagate the hardware-updated transfer count into the
            // guest's header.
            let myhdr: CmdHeader =
                port.mylist.read_obj(i * CMD_HEADER_SIZE);
            let mut hdr = guest_hdr;
            hdr.prdbc = myhdr.prdbc;
            self.mem.write(hdr_addr, &hdr);
        }
    }

    /// An IDENTIFY PACKET DEVICE retired: a packet device answered, so the
    /// port switches to ATAPI addressing.
    fn identity_check(&self, port: &mut AhciPortState, dmabuf: &DmaBuffer) {
        let mut word0 = [0u8; 2];
        dmabuf.copy_out(0, &mut word0);
        let word0 = u16::from_le_bytes(word0);
        info!(self.log, "AHCI IDENTIFY PACKET");
        if (word0 >> 14) == 2 && !port.atapi {
            info!(self.log, "port switches to ATAPI";
                "sector_size" => ATAPI_SECTOR_SIZE);
            port.atapi = true;
        }
    }
}
