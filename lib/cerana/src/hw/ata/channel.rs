// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-channel register handlers and the protocol state machine.
//!
//! Guest accesses to the command-block and control-block registers land
//! here.  The channel tracks just enough state to reconstruct each storage
//! operation (saved registers, the HOB double buffer, the PIO transfer
//! cursor, queued-command tags) while the physical controller continues to
//! execute the command stream.

use std::sync::{Arc, Mutex};

use slog::{info, warn};

use crate::block::{Backend, Direction, Permission, SecurityPolicy};
use crate::common::{IoDisposition, ReadOp, RWOp, WriteOp, PAGE_SIZE};
use crate::hw::ata::bits::*;
use crate::hw::ata::cmds::{self, CommandClass};
use crate::hw::ata::geometry::Geometry;
use crate::hw::ata::{probes, ChannelIo, ChannelLock, LockGuard, RegBlock};
use crate::vmm::{DmaArena, DmaBuffer, MemCtx};

/// Strings reported in place of the physical device's identity.
pub const VIRTUAL_MODEL: &[u8; 40] =
    b"Cerana Virtual ATA Drive                ";
pub const VIRTUAL_ATAPI_MODEL: &[u8; 40] =
    b"Cerana Virtual ATAPI Drive              ";
pub const VIRTUAL_REVISION: &[u8; 8] = b"0.4     ";

/// Protocol state of one channel.
///
/// Exactly one of {PIO transfer, DMA transfer, no transfer} is in progress
/// at a time; the state encodes which.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// Idle; the only state from which a new command is accepted.
    Ready,
    /// Command rejected; the guest sees ERR on its next status read.
    Error,
    /// Pass-through, no emulation for the current command.
    Through,
    /// Command queued via the Overlapped feature, waiting on SERVICE.
    Queued,
    /// Armed for PIO, waiting for the first Data register touch.
    PioReady,
    /// PIO block transfer in progress.
    PioData,
    /// ATAPI packet data relayed untouched.
    PacketData,
    /// Armed for DMA, waiting for the bus master START bit.
    DmaReady,
    /// Bus master running a read (device to memory).
    DmaRead,
    /// Bus master running a write (memory to device).
    DmaWrite,
    /// Emulation already applied; remainder deferred to hardware.
    DmaThrough,
}

/// A command parked in a device's Overlapped/Queued slot.
#[derive(Copy, Clone, Debug)]
pub(crate) struct QueuedCmd {
    pub rw: Direction,
    pub lba: Option<u64>,
    pub sector_count: u32,
    pub next_state: ChannelState,
    pub pio_block_size: usize,
    pub dma_state: ChannelState,
}

/// One device position (master/slave) on a channel.
pub struct AtaDevice {
    pub backend: Arc<dyn Backend>,
    pub policy: Arc<dyn SecurityPolicy>,
    pub sector_size: usize,
    pub geometry: Geometry,
    /// ATAPI CDB length (12 or 16 bytes).
    pub packet_length: usize,
    pub atapi: bool,
    pub(crate) current_tag: usize,
    pub(crate) queue: [Option<QueuedCmd>; MAX_QUEUE_DEPTH],
}

impl AtaDevice {
    pub fn new(
        backend: Arc<dyn Backend>,
        policy: Arc<dyn SecurityPolicy>,
    ) -> Self {
        let sector_size = backend.info().block_size as usize;
        Self {
            backend,
            policy,
            sector_size,
            geometry: Geometry::default(),
            packet_length: 12,
            atapi: false,
            current_tag: 0,
            queue: [None; MAX_QUEUE_DEPTH],
        }
    }
}

/// One-shot hook run on the next status read, armed by the queued-command
/// path.  Consumed (`.take()`) when it fires.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum StatusHook {
    Queued,
    Service,
}

/// Handler run when a PIO block boundary is crossed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PioHandler {
    /// Post-process an IDENTIFY (PACKET) DEVICE sector.
    Identify { packet: bool },
    /// Perform the real sector I/O for READ/WRITE SECTOR commands.
    RwData,
    /// Perform the real sector I/O for ATAPI data blocks.
    AtapiData,
    /// Decode a completed packet CDB.
    PacketCdb,
    /// Capture READ CAPACITY / MODE SENSE response fields.
    ConfigData,
}

pub(crate) struct ChannelInner {
    pub state: ChannelState,

    // Saved register shadows.
    pub command: u8,
    pub features: HobReg,
    pub dev_ctl: DevCtl,
    pub device_reg: DeviceReg,

    // Current transfer.
    pub rw: Direction,
    pub lba: Option<u64>,
    pub sector_count: u32,

    // PIO context.
    pub pio_buf: Vec<u8>,
    pub pio_buf_index: usize,
    pub pio_block_size: usize,
    pub interrupt_disabled: bool,
    pub pio_handler: Option<PioHandler>,
    pub status_hook: Option<StatusHook>,

    // Bus master context.
    pub guest_prd_phys: u32,

    // ATAPI context.
    pub atapi_flag: bool,
    pub atapi_data_length: usize,
    pub atapi_dma_state: ChannelState,

    pub devices: [AtaDevice; 2],
}

impl ChannelInner {
    pub fn current_device(&self) -> &AtaDevice {
        &self.devices[usize::from(self.device_reg.dev())]
    }
    pub fn current_device_mut(&mut self) -> &mut AtaDevice {
        &mut self.devices[usize::from(self.device_reg.dev())]
    }
}

/// One legacy IDE channel (primary or secondary).
pub struct AtaChannel {
    pub(crate) log: slog::Logger,
    pub id: usize,
    pub(crate) lock: ChannelLock,
    pub(crate) inner: Mutex<ChannelInner>,
    pub(crate) io: Arc<dyn ChannelIo>,
    pub(crate) mem: MemCtx,
    /// Shadow scatter/gather table handed to the controller in place of
    /// the guest's PRD table.
    pub(crate) shadow_prd: DmaBuffer,
    /// Shadow data buffer the controller DMAs into/out of.
    pub(crate) shadow_buf: DmaBuffer,
}

impl AtaChannel {
    pub fn new(
        log: slog::Logger,
        id: usize,
        io: Arc<dyn ChannelIo>,
        mem: MemCtx,
        arena: &DmaArena,
        devices: [AtaDevice; 2],
    ) -> Self {
        let log = log.new(slog::o!("channel" => id));
        // Shadow DMA state is sized once for the life of the VM; the
        // arena asserts placement below 4 GiB and 64 KiB alignment.
        let shadow_buf = arena.alloc(BM_TOTAL_BUFSIZE, BM_BUFSIZE);
        let shadow_prd = arena.alloc(PAGE_SIZE, PAGE_SIZE);

        Self {
            log,
            id,
            lock: ChannelLock::new(),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Ready,
                command: 0,
                features: HobReg::default(),
                dev_ctl: DevCtl::default(),
                device_reg: DeviceReg::default(),
                rw: Direction::Read,
                lba: None,
                sector_count: 0,
                pio_buf: vec![0u8; PAGE_SIZE],
                pio_buf_index: 0,
                pio_block_size: 512,
                interrupt_disabled: false,
                pio_handler: None,
                status_hook: None,
                guest_prd_phys: 0,
                atapi_flag: false,
                atapi_data_length: 0,
                atapi_dma_state: ChannelState::DmaThrough,
                devices,
            }),
            io,
            mem,
            shadow_prd,
            shadow_buf,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn guard(&self) -> LockGuard<'_> {
        self.lock.guard()
    }

    pub(crate) fn guard_lowpri(&self) -> LockGuard<'_> {
        self.lock.guard_lowpri()
    }

    //
    // Physical register access helpers.
    //

    pub(crate) fn ctl_out(&self, dev_ctl: DevCtl) {
        self.io.write8(RegBlock::Ctl, REG_DEVICE_CONTROL, dev_ctl.0);
    }

    pub(crate) fn disable_intrq(&self, inner: &mut ChannelInner) {
        let mut dc = inner.dev_ctl;
        dc.set_nien(true);
        self.ctl_out(dc);
        inner.interrupt_disabled = true;
    }

    pub(crate) fn restore_intrq(&self, inner: &mut ChannelInner) {
        inner.interrupt_disabled = false;
        self.ctl_out(inner.dev_ctl);
    }

    pub(crate) fn set_hob(&self, inner: &ChannelInner, hob: bool) {
        let mut dc = inner.dev_ctl;
        dc.set_hob(hob);
        self.ctl_out(dc);
    }

    pub(crate) fn hw_status(&self) -> Status {
        Status(self.io.read8(RegBlock::Ctl, REG_ALT_STATUS))
    }

    pub(crate) fn read_reg(&self, reg: usize) -> u8 {
        self.io.read8(RegBlock::Cmd, reg)
    }

    pub(crate) fn write_reg(&self, reg: usize, data: u8) {
        self.io.write8(RegBlock::Cmd, reg, data);
    }

    pub(crate) fn read_device(&self, inner: &ChannelInner) -> DeviceReg {
        self.set_hob(inner, false);
        DeviceReg(self.read_reg(REG_DEVICE))
    }

    pub(crate) fn read_interrupt_reason(&self) -> InterruptReason {
        InterruptReason(self.read_reg(REG_INTERRUPT_REASON))
    }

    //
    // LBA and sector-count reconstruction.
    //
    // The registers are read back from the hardware just before command
    // execution, not from guest-write shadows, to avoid any inconsistency
    // between what the device will do and what the emulation believes.
    //

    pub(crate) fn read_lba(
        &self,
        inner: &mut ChannelInner,
        ext: bool,
    ) -> Option<u64> {
        self.set_hob(inner, false);
        let low = self.read_reg(REG_LBA_LOW) as u64;
        let mid = self.read_reg(REG_LBA_MID) as u64;
        let high = self.read_reg(REG_LBA_HIGH) as u64;
        let device = inner.device_reg;

        if ext {
            if device.is_lba() {
                // HOB is cleared again by the next command-block write.
                self.set_hob(inner, true);
                let low1 = self.read_reg(REG_LBA_LOW) as u64;
                let mid1 = self.read_reg(REG_LBA_MID) as u64;
                let high1 = self.read_reg(REG_LBA_HIGH) as u64;
                let lo24 = (high << 16) | (mid << 8) | low;
                let hi24 = (high1 << 16) | (mid1 << 8) | low1;
                Some((hi24 << 24) | lo24)
            } else {
                warn!(self.log, "invalid 48-bit CHS address";
                    "command" => inner.command);
                inner.state = ChannelState::Error;
                None
            }
        } else if device.is_lba() {
            Some(((device.head() as u64) << 24) | (high << 16) | (mid << 8)
                | low)
        } else {
            let cylinder = (mid as u16) | ((high as u16) << 8);
            let geometry = inner.current_device().geometry;
            Some(geometry.chs_to_lba(cylinder, device.head(), low as u8))
        }
    }

    pub(crate) fn read_sector_count(
        &self,
        inner: &ChannelInner,
        ext: bool,
    ) -> u32 {
        self.set_hob(inner, false);
        let low = self.read_reg(REG_SECTOR_COUNT);
        if ext {
            self.set_hob(inner, true);
            let high = self.read_reg(REG_SECTOR_COUNT);
            sector_count_16(((high as u16) << 8) | low as u16)
        } else {
            sector_count_8(low)
        }
    }

    /// With queued commands the Features registers carry the sector count.
    /// The saved shadow is rewritten into the hardware before the count is
    /// taken, because Features cannot be read back from the device.
    pub(crate) fn read_sector_count_queued(
        &self,
        inner: &ChannelInner,
        ext: bool,
    ) -> u32 {
        let count = if ext {
            self.write_reg(REG_FEATURES, inner.features.prev());
            sector_count_16(inner.features.value16())
        } else {
            sector_count_8(inner.features.cur())
        };
        self.write_reg(REG_FEATURES, inner.features.cur());
        count
    }

    //
    // Register access entry points.
    //

    /// Command Block register handler.
    pub fn cmdblk_rw(&self, mut rwo: RWOp) -> IoDisposition {
        let reg = rwo.offset();
        if reg != REG_DATA && rwo.len() != 1 {
            // Guest protocol violation: blocked, not emulated.
            warn!(self.log, "unexpected command-block access width";
                "reg" => reg, "len" => rwo.len());
            return IoDisposition::Block;
        }

        let _guard = self.guard();
        let mut inner = self.inner.lock().unwrap();

        // HOB is cleared on a write to any command-block register.
        if rwo.is_write() {
            inner.dev_ctl.set_hob(false);
        }

        match &mut rwo {
            RWOp::Read(ro) => match reg {
                REG_DATA => self.data_in(&mut inner, ro),
                REG_INTERRUPT_REASON => {
                    self.atapi_interrupt_reason(&mut inner, ro)
                }
                REG_STATUS => self.status_read(&mut inner, ro, RegBlock::Cmd),
                _ => IoDisposition::Default,
            },
            RWOp::Write(wo) => match reg {
                REG_DATA => self.data_out(&mut inner, wo),
                REG_FEATURES => {
                    let val = wo.read_u8();
                    inner.features.push(val);
                    IoDisposition::Default
                }
                REG_COMMAND => {
                    let cmd = wo.read_u8();
                    self.command_write(&mut inner, cmd)
                }
                _ => IoDisposition::Default,
            },
        }
    }

    /// Control Block register handler.
    pub fn ctlblk_rw(&self, mut rwo: RWOp) -> IoDisposition {
        if rwo.len() != 1 {
            warn!(self.log, "unexpected control-block access width";
                "len" => rwo.len());
            return IoDisposition::Block;
        }

        let _guard = self.guard();
        let mut inner = self.inner.lock().unwrap();

        match &mut rwo {
            RWOp::Read(ro) => {
                self.status_read(&mut inner, ro, RegBlock::Ctl)
            }
            RWOp::Write(wo) => {
                let val = wo.read_u8();
                self.device_control_write(&mut inner, val)
            }
        }
    }

    fn device_control_write(
        &self,
        inner: &mut ChannelInner,
        val: u8,
    ) -> IoDisposition {
        let mut dev_ctl = DevCtl(val);
        inner.dev_ctl = dev_ctl;
        if dev_ctl.srst() {
            inner.state = ChannelState::Ready;
        }
        if inner.interrupt_disabled {
            // Interrupts are being pended on behalf of a PIO transfer;
            // keep them masked until the transfer completes.
            dev_ctl.set_nien(true);
        }
        self.ctl_out(dev_ctl);
        IoDisposition::Done
    }

    //
    // Status register.
    //

    fn status_read(
        &self,
        inner: &mut ChannelInner,
        ro: &mut ReadOp,
        block: RegBlock,
    ) -> IoDisposition {
        let reg =
            if block == RegBlock::Cmd { REG_STATUS } else { REG_ALT_STATUS };
        let mut status = Status(self.io.read8(block, reg));

        if !status.bsy() {
            if let Some(hook) = inner.status_hook.take() {
                match hook {
                    StatusHook::Queued => {
                        self.hook_queued(inner, &mut status)
                    }
                    StatusHook::Service => {
                        self.hook_service(inner, &mut status)
                    }
                }
            }
            if inner.state == ChannelState::Error {
                status.set_err(true);
            }
        }
        ro.write_u8(status.0);
        IoDisposition::Done
    }

    fn hook_service(&self, inner: &mut ChannelInner, status: &mut Status) {
        if inner.state != ChannelState::PioReady || status.err() {
            return;
        }
        let low = self.read_reg(REG_BYTE_COUNT_LOW) as usize;
        let high = self.read_reg(REG_BYTE_COUNT_HIGH) as usize;
        let reason = self.read_interrupt_reason();
        // The device cannot push more than one staging buffer per DRQ.
        inner.pio_block_size =
            ((high << 8) | low).min(inner.pio_buf.len());
        inner.rw =
            if reason.io() { Direction::Read } else { Direction::Write };
    }

    fn hook_queued(&self, inner: &mut ChannelInner, status: &mut Status) {
        if inner.state != ChannelState::Queued || status.err() {
            return;
        }
        let reason = self.read_interrupt_reason();
        if !reason.rel() {
            // The device did not release the bus: the queued command is
            // being serviced immediately.
            self.cmd_service(inner);
            self.hook_service(inner, status);
        } else {
            inner.state = ChannelState::Ready;
        }
    }

    //
    // Data register.
    //

    fn data_in(
        &self,
        inner: &mut ChannelInner,
        ro: &mut ReadOp,
    ) -> IoDisposition {
        match inner.state {
            ChannelState::PioReady => {
                // Pend interrupts while the block is staged.
                self.disable_intrq(inner);
                let block = inner.pio_block_size;
                self.io.read_data_block(&mut inner.pio_buf[..block]);
                self.run_pio_handler(inner, Direction::Read);
                inner.pio_buf_index = 0;
                inner.state = ChannelState::PioData;
                self.pio_data_in(inner, ro)
            }
            ChannelState::PioData => self.pio_data_in(inner, ro),
            ChannelState::PacketData => IoDisposition::Default,
            ChannelState::Through => IoDisposition::Default,
            _ => {
                ro.fill(0xff);
                IoDisposition::Default
            }
        }
    }

    fn data_out(
        &self,
        inner: &mut ChannelInner,
        wo: &mut WriteOp,
    ) -> IoDisposition {
        match inner.state {
            ChannelState::PioReady => {
                inner.pio_buf_index = 0;
                inner.state = ChannelState::PioData;
                self.pio_data_out(inner, wo)
            }
            ChannelState::PioData => self.pio_data_out(inner, wo),
            ChannelState::PacketData => IoDisposition::Default,
            ChannelState::Through => IoDisposition::Default,
            _ => {
                warn!(self.log, "data write in invalid state";
                    "state" => ?inner.state);
                IoDisposition::Block
            }
        }
    }

    fn pio_data_in(
        &self,
        inner: &mut ChannelInner,
        ro: &mut ReadOp,
    ) -> IoDisposition {
        if inner.rw != Direction::Read {
            warn!(self.log, "data read during a write transfer");
            return IoDisposition::Block;
        }

        let len = ro.len();
        let idx = inner.pio_buf_index;
        ro.write_bytes(&inner.pio_buf[idx..idx + len]);
        inner.pio_buf_index += len;

        if inner.pio_buf_index >= inner.pio_block_size {
            self.pio_block_complete(inner, Direction::Read);
        }
        IoDisposition::Done
    }

    fn pio_data_out(
        &self,
        inner: &mut ChannelInner,
        wo: &mut WriteOp,
    ) -> IoDisposition {
        if inner.rw != Direction::Write {
            warn!(self.log, "data write during a read transfer");
            return IoDisposition::Block;
        }

        let len = wo.len();
        let idx = inner.pio_buf_index;
        wo.read_bytes(&mut inner.pio_buf[idx..idx + len]);
        inner.pio_buf_index += len;

        if inner.pio_buf_index >= inner.pio_block_size {
            self.pio_block_complete(inner, Direction::Write);
        }
        IoDisposition::Done
    }

    fn pio_block_complete(&self, inner: &mut ChannelInner, dir: Direction) {
        let block = inner.pio_block_size;
        inner.pio_buf_index = 0;
        inner.sector_count = inner.sector_count.saturating_sub(1);
        inner.state = if inner.sector_count > 0 {
            ChannelState::PioReady
        } else {
            ChannelState::Ready
        };

        match dir {
            Direction::Read => {
                if let Some(lba) = inner.lba {
                    inner.lba = Some(lba + 1);
                }
                // Deliver any interrupts pended during the block.
                self.restore_intrq(inner);
            }
            Direction::Write => {
                // The handler drains the block at its own LBA; only
                // advance afterwards, and only if the handler did not
                // rearm the transfer context (a packet CDB replaces it
                // wholesale).
                let armed = inner.pio_handler;
                let disp = self.run_pio_handler(inner, Direction::Write);
                if disp == IoDisposition::Default {
                    self.io.write_data_block(&inner.pio_buf[..block]);
                }
                if inner.pio_handler == armed {
                    if let Some(lba) = inner.lba {
                        inner.lba = Some(lba + 1);
                    }
                }
            }
        }
    }

    pub(crate) fn run_pio_handler(
        &self,
        inner: &mut ChannelInner,
        dir: Direction,
    ) -> IoDisposition {
        let Some(handler) = inner.pio_handler else {
            return IoDisposition::Default;
        };
        match handler {
            PioHandler::Identify { packet } => {
                self.pio_identify(inner, packet)
            }
            PioHandler::RwData => self.pio_rw_data(inner, dir),
            PioHandler::AtapiData => self.pio_atapi_data(inner, dir),
            PioHandler::PacketCdb => self.pio_packet_cdb(inner),
            PioHandler::ConfigData => IoDisposition::Default,
        }
    }

    /// Overwrite the identity strings of an IDENTIFY (PACKET) DEVICE
    /// response with the fixed virtual identity.
    fn pio_identify(
        &self,
        inner: &mut ChannelInner,
        packet: bool,
    ) -> IoDisposition {
        let mut serial = [0u8; 20];
        let mut revision = [0u8; 8];
        let mut model = [0u8; 40];
        convert_string(&inner.pio_buf[20..40], &mut serial);
        convert_string(&inner.pio_buf[46..54], &mut revision);
        convert_string(&inner.pio_buf[54..94], &mut model);
        info!(self.log, "ATA IDENTIFY";
            "model" => String::from_utf8_lossy(&model).into_owned(),
            "revision" => String::from_utf8_lossy(&revision).into_owned(),
            "serial" => String::from_utf8_lossy(&serial).into_owned(),
            "packet" => packet);

        if packet {
            let word0 =
                u16::from_le_bytes([inner.pio_buf[0], inner.pio_buf[1]]);
            let device = inner.current_device_mut();
            if (word0 >> 14) == 2 {
                // A packet device answered: the channel position turns
                // into a 2048-byte-sector ATAPI device.
                device.atapi = true;
                device.sector_size = crate::block::ATAPI_SECTOR_SIZE;
            }
            device.packet_length =
                if word0 & 0x3 == 0x1 { 16 } else { 12 };
        }

        let model_src = if inner.current_device().atapi {
            VIRTUAL_ATAPI_MODEL
        } else {
            VIRTUAL_MODEL
        };
        convert_string(model_src, &mut inner.pio_buf[54..94]);
        convert_string(VIRTUAL_REVISION, &mut inner.pio_buf[46..54]);
        IoDisposition::Default
    }

    /// Perform the real sector transfer behind a PIO READ/WRITE block.
    fn pio_rw_data(
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
        let res = match dir {
            Direction::Read => {
                backend.read(lba, sector_size, &mut inner.pio_buf[..block])
            }
            Direction::Write => {
                backend.write(lba, sector_size, &inner.pio_buf[..block])
            }
        };
        if let Err(e) = res {
            warn!(self.log, "backend PIO transfer failed";
                "lba" => lba, "error" => %e);
            inner.state = ChannelState::Error;
        }
        IoDisposition::Default
    }

    //
    // Command dispatch.
    //

    fn next_state(class: CommandClass) -> ChannelState {
        match class {
            CommandClass::Invalid => ChannelState::Error,
            CommandClass::NonData => ChannelState::Ready,
            CommandClass::Pio => ChannelState::PioReady,
            CommandClass::Dma => ChannelState::DmaReady,
            CommandClass::DmaQueued => ChannelState::Queued,
            CommandClass::Packet => ChannelState::PioReady,
            CommandClass::Service => ChannelState::DmaReady,
            CommandClass::Identify => ChannelState::PioReady,
            CommandClass::DevParam => ChannelState::Ready,
            CommandClass::Through => ChannelState::Through,
            CommandClass::Ncq => ChannelState::Through,
        }
    }

    fn command_write(
        &self,
        inner: &mut ChannelInner,
        cmd: u8,
    ) -> IoDisposition {
        let ty = cmds::classify(cmd);

        probes::ata_cmd!(|| (self.id as u8, cmd));
        inner.command = cmd;
        inner.device_reg = self.read_device(inner);
        inner.state = Self::next_state(ty.class);

        match ty.class {
            CommandClass::Invalid => {
                // Permissive toward unassigned opcodes: log and let the
                // device decide, but reflect ERR back to the guest.
                info!(self.log, "unknown ATA command"; "command" => cmd);
                IoDisposition::Default
            }
            CommandClass::NonData => IoDisposition::Default,
            CommandClass::Pio | CommandClass::Dma => {
                self.cmd_rw(inner, ty.rw, ty.ext)
            }
            CommandClass::DmaQueued => {
                self.cmd_rw_queued(inner, ty.rw, ty.ext)
            }
            CommandClass::Packet => self.cmd_packet(inner),
            CommandClass::Service => {
                let disp = self.cmd_service(inner);
                inner.status_hook = Some(StatusHook::Service);
                disp
            }
            CommandClass::Identify => self.cmd_identify(inner, ty.ext),
            CommandClass::DevParam => self.cmd_devparam(inner),
            CommandClass::Through | CommandClass::Ncq => {
                self.cmd_through(inner)
            }
        }
    }

    fn cmd_through(&self, inner: &mut ChannelInner) -> IoDisposition {
        // Check whether the command will be accepted before going to
        // "through" mode, or it may unexpectedly punch a hole.
        if self.hw_status().bsy() {
            inner.state = ChannelState::Error;
        }
        IoDisposition::Default
    }

    fn cmd_devparam(&self, inner: &mut ChannelInner) -> IoDisposition {
        // Reject if the device is not ready.
        if self.hw_status().bsy() {
            return IoDisposition::Done;
        }
        let heads = inner.device_reg.head() + 1;
        let sectors = self.read_reg(REG_SECTOR_COUNT);
        let device = inner.current_device_mut();
        device.geometry.heads_per_cylinder = heads;
        device.geometry.sectors_per_track = sectors;
        // An unsupported translation makes the device fail media accesses
        // with ID Not Found until a valid one is set; no error check is
        // needed here.
        IoDisposition::Default
    }

    fn cmd_identify(
        &self,
        inner: &mut ChannelInner,
        packet: bool,
    ) -> IoDisposition {
        inner.pio_block_size = 512;
        inner.pio_handler = Some(PioHandler::Identify { packet });
        inner.rw = Direction::Read;
        inner.lba = None;
        inner.sector_count = 1;
        IoDisposition::Default
    }

    fn cmd_rw(
        &self,
        inner: &mut ChannelInner,
        rw: Direction,
        ext: bool,
    ) -> IoDisposition {
        inner.pio_block_size = inner.current_device().sector_size;
        inner.pio_handler = Some(PioHandler::RwData);
        inner.rw = rw;
        inner.lba = self.read_lba(inner, ext);
        inner.sector_count = self.read_sector_count(inner, ext);

        if let Some(lba) = inner.lba {
            let device = inner.current_device();
            if device.policy.check_lba(rw, lba, inner.sector_count)
                != Permission::Allow
            {
                inner.state = ChannelState::Error;
                return IoDisposition::Done;
            }
        }
        IoDisposition::Default
    }

    fn cmd_rw_queued(
        &self,
        inner: &mut ChannelInner,
        rw: Direction,
        ext: bool,
    ) -> IoDisposition {
        let tag = self.read_interrupt_reason().tag() as usize;
        let lba = self.read_lba(inner, ext);
        let sector_count = self.read_sector_count_queued(inner, ext);
        let sector_size = inner.current_device().sector_size;

        if let Some(lba) = lba {
            let device = inner.current_device();
            if device.policy.check_lba(rw, lba, sector_count)
                != Permission::Allow
            {
                inner.state = ChannelState::Error;
                return IoDisposition::Done;
            }
        }

        let device = inner.current_device_mut();
        device.current_tag = tag;
        device.queue[tag] = Some(QueuedCmd {
            rw,
            lba,
            sector_count,
            next_state: ChannelState::DmaReady,
            pio_block_size: sector_size,
            dma_state: ChannelState::DmaThrough,
        });
        inner.status_hook = Some(StatusHook::Queued);
        IoDisposition::Default
    }

    fn cmd_service(&self, inner: &mut ChannelInner) -> IoDisposition {
        let tag = self.read_interrupt_reason().tag() as usize;
        let device = inner.current_device_mut();
        device.current_tag = tag;
        let Some(queued) = device.queue[tag] else {
            warn!(self.log, "SERVICE for empty queue slot"; "tag" => tag);
            inner.state = ChannelState::Error;
            return IoDisposition::Done;
        };

        inner.rw = queued.rw;
        inner.lba = queued.lba;
        inner.sector_count = queued.sector_count;
        inner.pio_block_size = queued.pio_block_size;
        inner.atapi_dma_state = queued.dma_state;
        inner.state = queued.next_state;
        IoDisposition::Default
    }
}
