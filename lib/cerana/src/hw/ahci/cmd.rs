// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hypervisor-initiated commands on an AHCI port.
//!
//! The same [AtaCmd] descriptor the legacy worker consumes is executed
//! here by borrowing a free command slot: the port's FIS receive area is
//! temporarily redirected to a hypervisor-owned page so the completion
//! registers can be read back, and the port's interrupt enables are masked
//! for the duration so the guest never observes the borrowed command.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, warn};

use crate::hw::ahci::bits::*;
use crate::hw::ahci::AhciData;
use crate::hw::ata::worker::{AtaCmd, CmdCallback};

pub(crate) struct Job {
    pub port: usize,
    pub cmd: AtaCmd,
    pub callback: CmdCallback,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub queue: VecDeque<Job>,
    pub thread_running: bool,
}

impl AhciData {
    /// Is the port physically present and ready to carry a command?
    pub fn port_ready(&self, port_num: usize) -> bool {
        if port_num >= NUM_PORTS {
            return false;
        }
        {
            let inner = self.inner.lock().unwrap();
            if !inner.enabled || inner.pi & (1 << port_num) == 0 {
                return false;
            }
        }
        let ssts = self.port_read32(port_num, PX_SSTS);
        (ssts & PXSSTS_DET_MASK) != PXSSTS_DET_NODEV
    }

    /// Queue a command for asynchronous execution against `port_num`,
    /// spawning the worker thread if none is running.
    pub fn queue_command(
        self: &Arc<Self>,
        port_num: usize,
        cmd: AtaCmd,
        callback: CmdCallback,
    ) -> bool {
        if !self.port_ready(port_num) {
            return false;
        }
        {
            let _guard = self.lock.guard();
            let mut inner = self.inner.lock().unwrap();
            self.ensure_port_init(&mut inner, port_num);
            if inner.ports[port_num].is_none() {
                return false;
            }
        }

        let spawn = {
            let mut qs = self.cmd_queue.lock().unwrap();
            qs.queue.push_back(Job { port: port_num, cmd, callback });
            if !qs.thread_running {
                qs.thread_running = true;
                true
            } else {
                false
            }
        };
        if spawn {
            let ad = self.clone();
            std::thread::Builder::new()
                .name("ahci-cmd".to_string())
                .spawn(move || ad.command_thread())
                .expect("worker thread spawn");
        }
        true
    }

    fn command_thread(self: Arc<Self>) {
        loop {
            let job = {
                let mut qs = self.cmd_queue.lock().unwrap();
                match qs.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        qs.thread_running = false;
                        return;
                    }
                }
            };
            self.command_do(job);
        }
    }

    fn command_do(&self, job: Job) {
        let mut cmd = job.cmd;
        let pno = job.port;

        let _guard = self.lock.guard_lowpri();

        // Phase 1: wait for the port to be idle from the guest's point of
        // view.  NCQ commands may share the wire with other NCQ commands,
        // but never with outstanding legacy ones.
        let deadline = Instant::now()
            + Duration::from_micros(cmd.timeout_ready.max(0) as u64);
        let slot = loop {
            let ready = {
                let mut inner = self.inner.lock().unwrap();
                let pxcmd = self.port_read32(pno, PX_CMD);
                if pxcmd & PXCMD_ST == 0 {
                    None
                } else {
                    let pxsact = self.port_read32(pno, PX_SACT);
                    let pxci = self.port_read32(pno, PX_CI);
                    let port = inner.ports[pno].as_mut().unwrap();
                    if port.shadow_mask() != 0 {
                        self.cmd_complete(port, pxsact, pxci);
                    }
                    if port.shadow_mask() == 0 && pxsact == 0 && pxci == 0 {
                        let ncs = inner.ncs;
                        Some(ncs as usize - 1)
                    } else {
                        None
                    }
                }
            };
            if let Some(slot) = ready {
                break slot;
            }
            if Instant::now() >= deadline {
                cmd.timeout_ready = -1;
                drop(_guard);
                (job.callback)(cmd);
                return;
            }
            std::thread::yield_now();
        };

        // Phase 2: take over the FIS receive area and mask the port
        // interrupts while the borrowed command runs.
        let saved_fb = self.port_read32(pno, PX_FB);
        let saved_fbu = self.port_read32(pno, PX_FBU);
        let saved_pxcmd = self.port_read32(pno, PX_CMD);
        let saved_pxie = self.port_read32(pno, PX_IE);
        let saved_pxis = self.port_read32(pno, PX_IS);
        self.port_write32(pno, PX_IE, 0);

        self.port_write32(pno, PX_CMD, saved_pxcmd & !PXCMD_ST);
        if !self.wait_for_pxcmd(pno, PXCMD_CR, 0) {
            warn!(self.log, "PxCMD.CR stuck high"; "port" => pno);
        }
        if saved_pxcmd & PXCMD_FRE != 0 {
            self.port_write32(
                pno,
                PX_CMD,
                saved_pxcmd & !PXCMD_ST & !PXCMD_FRE,
            );
            if !self.wait_for_pxcmd(pno, PXCMD_FR, 0) {
                warn!(self.log, "PxCMD.FR stuck high"; "port" => pno);
            }
        }

        let fis_page = self.arena.alloc(RECV_FIS_SIZE, 0x100);
        fis_page.fill(0);
        self.port_write32(pno, PX_FB, fis_page.phys() as u32);
        self.port_write32(pno, PX_FBU, (fis_page.phys() >> 32) as u32);
        self.port_write32(
            pno,
            PX_CMD,
            (saved_pxcmd & !PXCMD_ST) | PXCMD_FRE,
        );
        if !self.wait_for_pxcmd(pno, PXCMD_FR, PXCMD_FR) {
            warn!(self.log, "PxCMD.FR stuck low"; "port" => pno);
        }
        self.port_write32(pno, PX_CMD, saved_pxcmd | PXCMD_ST | PXCMD_FRE);
        if !self.wait_for_pxcmd(pno, PXCMD_CR, PXCMD_CR) {
            warn!(self.log, "PxCMD.CR stuck low"; "port" => pno);
        }

        // Phase 3: fill the shadow slot and issue.
        let dmabuf = {
            let inner = self.inner.lock().unwrap();
            let port = inner.ports[pno].as_ref().unwrap();
            self.command_fill(port, slot, &cmd)
        };
        if cmd.ncq > 0 {
            self.port_write32(pno, PX_SACT, 1 << slot);
        }
        self.port_write32(pno, PX_CI, 1 << slot);
        debug!(self.log, "hypervisor command issued";
            "port" => pno, "slot" => slot, "command" => cmd.command);

        // Phase 4: poll for completion.
        let deadline = Instant::now()
            + Duration::from_micros(cmd.timeout_complete.max(0) as u64);
        loop {
            let pxci = self.port_read32(pno, PX_CI);
            let pxsact = self.port_read32(pno, PX_SACT);
            if (pxci | pxsact) & (1 << slot) == 0 {
                break;
            }
            if Instant::now() >= deadline {
                cmd.timeout_complete = -1;
                break;
            }
            std::thread::yield_now();
        }

        if cmd.timeout_complete != -1 {
            if !cmd.write && !cmd.buf.is_empty() {
                let len = cmd.buf.len();
                dmabuf.copy_out(0, &mut cmd.buf[..len]);
            }
            // Read the completion registers out of the D2H FIS the device
            // sent to the borrowed receive area.
            let rfis: RegD2HFis = fis_page.read_obj(RECV_FIS_RFIS_OFFSET);
            if rfis.fis_type == FIS_TYPE_REG_D2H {
                cmd.status = rfis.status;
                cmd.error = rfis.error;
                cmd.sector_number = rfis.sector_number;
                cmd.cyl_low = rfis.cyl_low;
                cmd.cyl_high = rfis.cyl_high;
                cmd.dev_head = rfis.dev_head;
                cmd.sector_number_exp = rfis.sector_number_exp;
                cmd.cyl_low_exp = rfis.cyl_low_exp;
                cmd.cyl_high_exp = rfis.cyl_high_exp;
                cmd.sector_count = rfis.sector_count;
                cmd.sector_count_exp = rfis.sector_count_exp;
            }
        }

        // Phase 5: restore the port exactly as the guest left it.
        self.port_write32(pno, PX_CMD, (saved_pxcmd & !PXCMD_ST) | PXCMD_FRE);
        if !self.wait_for_pxcmd(pno, PXCMD_CR, 0) {
            warn!(self.log, "PxCMD.CR stuck high"; "port" => pno);
        }
        self.port_write32(pno, PX_CMD, saved_pxcmd & !PXCMD_ST & !PXCMD_FRE);
        if !self.wait_for_pxcmd(pno, PXCMD_FR, 0) {
            warn!(self.log, "PxCMD.FR stuck high"; "port" => pno);
        }
        let spurious = self.port_read32(pno, PX_IS) & !saved_pxis;
        if spurious != 0 {
            self.port_write32(pno, PX_IS, spurious);
        }
        self.port_write32(pno, PX_FB, saved_fb);
        self.port_write32(pno, PX_FBU, saved_fbu);
        if saved_pxcmd & PXCMD_FRE != 0 {
            self.port_write32(pno, PX_CMD, saved_pxcmd & !PXCMD_ST);
            if !self.wait_for_pxcmd(pno, PXCMD_FR, PXCMD_FR) {
                warn!(self.log, "PxCMD.FR stuck low"; "port" => pno);
            }
        }
        if saved_pxcmd & PXCMD_ST != 0 {
            self.port_write32(pno, PX_CMD, saved_pxcmd);
            if !self.wait_for_pxcmd(pno, PXCMD_CR, PXCMD_CR) {
                warn!(self.log, "PxCMD.CR stuck low"; "port" => pno);
            }
        }
        self.port_write32(pno, PX_IE, saved_pxie);

        drop(_guard);
        (job.callback)(cmd);
    }

    /// Build the slot's shadow header, command FIS and PRD for an
    /// [AtaCmd].
    fn command_fill(
        &self,
        port: &super::AhciPortState,
        slot: usize,
        cmd: &AtaCmd,
    ) -> crate::vmm::DmaBuffer {
        let slot_state = &port.slots[slot];

        let mut fis = RegH2DFis {
            fis_type: FIS_TYPE_REG_H2D,
            pm_c: 0x80, // command register update
            command: cmd.command,
            features: cmd.features,
            sector_number: cmd.sector_number,
            cyl_low: cmd.cyl_low,
            cyl_high: cmd.cyl_high,
            dev_head: cmd.dev_head,
            sector_number_exp: cmd.sector_number_exp,
            cyl_low_exp: cmd.cyl_low_exp,
            cyl_high_exp: cmd.cyl_high_exp,
            features_exp: cmd.features_exp,
            sector_count: cmd.sector_count,
            sector_count_exp: cmd.sector_count_exp,
            reserved: 0,
            control: cmd.control,
            reserved2: [0; 4],
        };
        if cmd.ncq > 0 {
            // NCQ carries the tag in the sector count register.
            fis.sector_count |= (slot as u8) << 3;
        }

        slot_state.cmdtbl.fill(0);
        slot_state.cmdtbl.write_obj(0, &fis);
        if cmd.atapi_len > 0 {
            slot_state
                .cmdtbl
                .copy_in(CMD_TABLE_ACMD_OFFSET, &cmd.atapi[..16]);
        }

        // Commands always run out of a hypervisor-owned bounce buffer;
        // the caller's Vec has no stable physical address.
        let alloc_len = (cmd.buf.len().max(2) + 1) & !1usize;
        let dmabuf = self.arena.alloc(alloc_len, 0x80);
        if cmd.write && !cmd.buf.is_empty() {
            dmabuf.copy_in(0, &cmd.buf);
        }
        slot_state.cmdtbl.write_obj(
            CMD_TABLE_PRDT_OFFSET,
            &PrdtEntry::new(dmabuf.phys(), alloc_len, false),
        );

        let mut flags = CmdHeaderDw0(0);
        flags.set_cfl(5);
        flags.set_w(cmd.write);
        flags.set_prdtl(1);
        if cmd.atapi_len > 0 {
            flags.set_atapi(true);
        }
        let hdr = CmdHeader {
            dw0: flags.0,
            prdbc: 0,
            ctba: slot_state.cmdtbl.phys() as u32,
            ctbau: (slot_state.cmdtbl.phys() >> 32) as u32,
            reserved: [0; 4],
        };
        port.mylist.write_obj(slot * CMD_HEADER_SIZE, &hdr);

        dmabuf
    }
}
