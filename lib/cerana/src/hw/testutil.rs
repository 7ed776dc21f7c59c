// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated physical controllers backing the pass-through side in tests.
//!
//! [SimChannel] models one IDE channel with up to two drives: a register
//! file, a PIO data FIFO, and a bus-master engine that walks whatever PRD
//! table it is handed (the emulation under test is expected to hand it a
//! shadow).  [SimHba] models an AHCI controller the same way at the
//! command-list level.

use std::sync::{Arc, Mutex};

use crate::common::{GuestAddr, PAGE_SIZE};
use crate::hw::ahci::bits as ahci_bits;
use crate::hw::ahci::HbaIo;
use crate::hw::ata::bits::*;
use crate::hw::ata::{ChannelIo, RegBlock};
use crate::vmm::{DmaArena, MemCtx, PhysMap};

use zerocopy::{FromBytes, IntoBytes};

use crate::hw::ahci::bits::{CmdHeader, PrdtEntry, RegD2HFis, RegH2DFis};

pub const SIM_SECTOR_SIZE: usize = 512;

pub fn build_log() -> slog::Logger {
    use slog::Drain;

    let decorator = slog_term::PlainSyncDecorator::new(std::io::sink());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// A test VM: guest memory plus a DMA arena.
pub struct TestVm {
    pub physmem: PhysMap,
    pub arena: DmaArena,
}

impl TestVm {
    pub fn new(guest_pages: usize) -> Self {
        Self {
            physmem: PhysMap::new(guest_pages * PAGE_SIZE).unwrap(),
            arena: DmaArena::new(1024 * PAGE_SIZE).unwrap(),
        }
    }

    pub fn memctx(&self) -> MemCtx {
        self.physmem.memctx()
    }

    /// Resolve a "physical" address to either guest memory or the DMA
    /// arena, the way a real bus master would.
    fn dma_read(&self, phys: u64, buf: &mut [u8]) {
        if self.arena.contains(phys, buf.len()) {
            self.arena.read_phys(phys, buf).unwrap();
        } else {
            assert!(self.memctx().read_into(GuestAddr(phys), buf));
        }
    }

    fn dma_write(&self, phys: u64, buf: &[u8]) {
        if self.arena.contains(phys, buf.len()) {
            self.arena.write_phys(phys, buf).unwrap();
        } else {
            assert!(self.memctx().write_from(GuestAddr(phys), buf));
        }
    }
}

/// Fill an IDENTIFY DEVICE sector the way a real drive would, including
/// the byte-swapped identity strings the emulation is expected to rewrite.
pub fn sim_identify_sector(sectors: u64, packet_device: bool) -> Vec<u8> {
    let mut sector = vec![0u8; SIM_SECTOR_SIZE];

    if packet_device {
        // ATAPI device, 12-byte CDBs, removable.
        let word0: u16 = (2 << 14) | (1 << 7) | (0x05 << 8);
        sector[0..2].copy_from_slice(&word0.to_le_bytes());
    }

    convert_string(b"SIM0123456789       ", &mut sector[20..40]);
    convert_string(b"1.0     ", &mut sector[46..54]);
    convert_string(
        b"Simulated Physical Drive                ",
        &mut sector[54..94],
    );

    let lba28 = (sectors as u32).min(0x0fff_ffff);
    sector[120..124].copy_from_slice(&lba28.to_le_bytes());
    sector[200..208].copy_from_slice(&sectors.to_le_bytes());
    sector
}

struct SimDrive {
    present: bool,
    packet_device: bool,
    disk: Vec<u8>,
}

impl SimDrive {
    fn sectors(&self) -> u64 {
        (self.disk.len() / SIM_SECTOR_SIZE) as u64
    }
}

#[derive(Default)]
struct SimTaskFile {
    features: [u8; 2],
    sector_count: [u8; 2],
    lba_low: [u8; 2],
    lba_mid: [u8; 2],
    lba_high: [u8; 2],
}

impl SimTaskFile {
    fn push(bank: &mut [u8; 2], val: u8) {
        bank[1] = bank[0];
        bank[0] = val;
    }

    fn lba28(&self, device: u8) -> u64 {
        (((device & 0xf) as u64) << 24)
            | ((self.lba_high[0] as u64) << 16)
            | ((self.lba_mid[0] as u64) << 8)
            | self.lba_low[0] as u64
    }

    fn lba48(&self) -> u64 {
        ((self.lba_high[1] as u64) << 40)
            | ((self.lba_mid[1] as u64) << 32)
            | ((self.lba_low[1] as u64) << 24)
            | ((self.lba_high[0] as u64) << 16)
            | ((self.lba_mid[0] as u64) << 8)
            | self.lba_low[0] as u64
    }

    fn count(&self, ext: bool) -> u32 {
        if ext {
            sector_count_16(
                ((self.sector_count[1] as u16) << 8)
                    | self.sector_count[0] as u16,
            )
        } else {
            sector_count_8(self.sector_count[0])
        }
    }
}

enum SimXfer {
    None,
    PioIn,
    PioOut { lba: u64 },
    PacketCdb,
    AtapiIn,
}

enum SimDma {
    None,
    Read { lba: u64, count: u32 },
    Write { lba: u64, count: u32 },
}

struct SimChannelState {
    drives: [SimDrive; 2],
    selected: usize,
    tf: SimTaskFile,
    device: u8,
    dev_ctl: u8,
    status: u8,
    error: u8,
    interrupt_reason: u8,
    byte_count: u16,

    data_buf: Vec<u8>,
    data_idx: usize,
    xfer: SimXfer,
    dma: SimDma,

    bm_cmd: u8,
    bm_status: u8,
    bm_prd: u32,

    /// Test hook: the device never leaves BSY.
    stuck_busy: bool,
}

const SIM_STATUS_READY: u8 = 0x40; // DRDY
const SIM_STATUS_DRQ: u8 = 0x08;
const SIM_STATUS_ERR: u8 = 0x01;
const SIM_STATUS_BSY: u8 = 0x80;

/// Simulated physical IDE channel.
pub struct SimChannel {
    vm: Arc<TestVm>,
    state: Mutex<SimChannelState>,
}

impl SimChannel {
    pub fn new(vm: Arc<TestVm>, disk_sectors: [usize; 2]) -> Arc<Self> {
        let drives = disk_sectors.map(|sectors| SimDrive {
            present: sectors > 0,
            packet_device: false,
            disk: vec![0u8; sectors * SIM_SECTOR_SIZE],
        });
        Arc::new(Self {
            vm,
            state: Mutex::new(SimChannelState {
                drives,
                selected: 0,
                tf: SimTaskFile::default(),
                device: 0xa0,
                dev_ctl: 0,
                status: SIM_STATUS_READY,
                error: 0,
                interrupt_reason: 0,
                byte_count: 0,
                data_buf: Vec::new(),
                data_idx: 0,
                xfer: SimXfer::None,
                dma: SimDma::None,
                bm_cmd: 0,
                bm_status: 0,
                bm_prd: 0,
                stuck_busy: false,
            }),
        })
    }

    /// Make the secondary position an ATAPI drive.
    pub fn set_packet_device(&self, slot: usize) {
        let mut st = self.state.lock().unwrap();
        st.drives[slot].packet_device = true;
    }

    /// Wedge or unwedge the device (BSY never clears).
    pub fn set_stuck_busy(&self, stuck: bool) {
        let mut st = self.state.lock().unwrap();
        st.stuck_busy = stuck;
        if stuck {
            st.status |= SIM_STATUS_BSY;
        } else {
            st.status = SIM_STATUS_READY;
        }
    }

    /// Direct disk access for test setup and verification.
    pub fn disk_write(&self, slot: usize, lba: u64, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let off = lba as usize * SIM_SECTOR_SIZE;
        st.drives[slot].disk[off..off + data.len()].copy_from_slice(data);
    }

    pub fn disk_read(&self, slot: usize, lba: u64, len: usize) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        let off = lba as usize * SIM_SECTOR_SIZE;
        st.drives[slot].disk[off..off + len].to_vec()
    }

    fn exec_command(&self, st: &mut SimChannelState, cmd: u8) {
        st.error = 0;
        st.status = SIM_STATUS_READY;
        st.xfer = SimXfer::None;
        st.dma = SimDma::None;

        let selected = st.selected;
        if !st.drives[selected].present {
            st.status = SIM_STATUS_READY | SIM_STATUS_ERR;
            st.error = 0x04;
            return;
        }

        match cmd {
            0xec => {
                // IDENTIFY DEVICE
                if st.drives[selected].packet_device {
                    st.status = SIM_STATUS_READY | SIM_STATUS_ERR;
                    st.error = 0x04;
                    return;
                }
                st.data_buf = sim_identify_sector(
                    st.drives[selected].sectors(),
                    false,
                );
                st.data_idx = 0;
                st.xfer = SimXfer::PioIn;
                st.status = SIM_STATUS_READY | SIM_STATUS_DRQ;
            }
            0xa1 => {
                // IDENTIFY PACKET DEVICE
                if !st.drives[selected].packet_device {
                    st.status = SIM_STATUS_READY | SIM_STATUS_ERR;
                    st.error = 0x04;
                    return;
                }
                st.data_buf = sim_identify_sector(0, true);
                st.data_idx = 0;
                st.xfer = SimXfer::PioIn;
                st.status = SIM_STATUS_READY | SIM_STATUS_DRQ;
            }
            0x20 | 0x24 => {
                // READ SECTORS (EXT)
                let ext = cmd == 0x24;
                let lba = if ext {
                    st.tf.lba48()
                } else {
                    st.tf.lba28(st.device)
                };
                let count = st.tf.count(ext) as usize;
                let off = lba as usize * SIM_SECTOR_SIZE;
                let len = count * SIM_SECTOR_SIZE;
                st.data_buf =
                    st.drives[selected].disk[off..off + len].to_vec();
                st.data_idx = 0;
                st.xfer = SimXfer::PioIn;
                st.status = SIM_STATUS_READY | SIM_STATUS_DRQ;
            }
            0x30 | 0x34 => {
                // WRITE SECTORS (EXT)
                let ext = cmd == 0x34;
                let lba = if ext {
                    st.tf.lba48()
                } else {
                    st.tf.lba28(st.device)
                };
                let count = st.tf.count(ext) as usize;
                st.data_buf = vec![0u8; count * SIM_SECTOR_SIZE];
                st.data_idx = 0;
                st.xfer = SimXfer::PioOut { lba };
                st.status = SIM_STATUS_READY | SIM_STATUS_DRQ;
            }
            0xc8 | 0x25 => {
                // READ DMA (EXT)
                let ext = cmd == 0x25;
                let lba = if ext {
                    st.tf.lba48()
                } else {
                    st.tf.lba28(st.device)
                };
                st.dma = SimDma::Read { lba, count: st.tf.count(ext) };
                self.maybe_run_dma(st);
            }
            0xca | 0x35 => {
                // WRITE DMA (EXT)
                let ext = cmd == 0x35;
                let lba = if ext {
                    st.tf.lba48()
                } else {
                    st.tf.lba28(st.device)
                };
                st.dma = SimDma::Write { lba, count: st.tf.count(ext) };
                self.maybe_run_dma(st);
            }
            0xc7 | 0x26 => {
                // READ DMA QUEUED (EXT): the sector count arrives in the
                // Features register pair.
                let ext = cmd == 0x26;
                let lba = if ext {
                    st.tf.lba48()
                } else {
                    st.tf.lba28(st.device)
                };
                let count = if ext {
                    sector_count_16(
                        ((st.tf.features[1] as u16) << 8)
                            | st.tf.features[0] as u16,
                    )
                } else {
                    sector_count_8(st.tf.features[0])
                };
                st.dma = SimDma::Read { lba, count };
                st.interrupt_reason = 0; // tag 0, bus not released
                self.maybe_run_dma(st);
            }
            0xa0 => {
                // PACKET
                if !st.drives[selected].packet_device {
                    st.status = SIM_STATUS_READY | SIM_STATUS_ERR;
                    st.error = 0x04;
                    return;
                }
                st.data_buf = vec![0u8; 12];
                st.data_idx = 0;
                st.xfer = SimXfer::PacketCdb;
                st.interrupt_reason = 0x01; // CoD=1, IO=0: awaiting CDB
                st.status = SIM_STATUS_READY | SIM_STATUS_DRQ;
            }
            0xe7 | 0xea | 0x91 | 0xef | 0x00 => {
                // FLUSH CACHE (EXT) / INITIALIZE DEVICE PARAMETERS /
                // SET FEATURES / NOP
                st.status = SIM_STATUS_READY;
            }
            _ => {
                st.status = SIM_STATUS_READY | SIM_STATUS_ERR;
                st.error = 0x04;
            }
        }
    }

    fn packet_cdb_complete(&self, st: &mut SimChannelState) {
        let cdb: Vec<u8> = st.data_buf.clone();
        let selected = st.selected;
        match cdb[0] {
            0x00 => {
                // TEST UNIT READY
                st.xfer = SimXfer::None;
                st.interrupt_reason = 0x03; // IO=1, CoD=1: status
                st.status = SIM_STATUS_READY;
            }
            0x28 => {
                // READ(10): 2048-byte sectors out of the same media.
                let lba = u32::from_be_bytes(cdb[2..6].try_into().unwrap())
                    as usize;
                let count =
                    u16::from_be_bytes(cdb[7..9].try_into().unwrap())
                        as usize;
                let off = lba * 2048;
                let len = count * 2048;
                st.data_buf =
                    st.drives[selected].disk[off..off + len].to_vec();
                st.data_idx = 0;
                st.xfer = SimXfer::AtapiIn;
                st.interrupt_reason = 0x02; // IO=1, CoD=0: data
                st.byte_count = len.min(0xfffe) as u16;
                st.status = SIM_STATUS_READY | SIM_STATUS_DRQ;
            }
            _ => {
                st.xfer = SimXfer::None;
                st.interrupt_reason = 0x03;
                st.status = SIM_STATUS_READY | SIM_STATUS_ERR;
                st.error = 0x04;
            }
        }
    }

    /// Run the bus-master transfer if both a DMA command and the start
    /// bit are pending.
    fn maybe_run_dma(&self, st: &mut SimChannelState) {
        if st.bm_cmd & 0x01 == 0 {
            return;
        }
        let (lba, count, write) = match st.dma {
            SimDma::Read { lba, count } => (lba, count, false),
            SimDma::Write { lba, count } => (lba, count, true),
            SimDma::None => return,
        };

        let bytes = count as usize * SIM_SECTOR_SIZE;
        let mut remain = bytes;
        let mut disk_off = lba as usize * SIM_SECTOR_SIZE;
        let mut prd_phys = st.bm_prd as u64;
        let selected = st.selected;

        while remain > 0 {
            let mut raw = [0u8; 8];
            self.vm.dma_read(prd_phys, &mut raw);
            let base =
                u32::from_le_bytes(raw[0..4].try_into().unwrap()) as u64;
            let count_field =
                u16::from_le_bytes(raw[4..6].try_into().unwrap());
            let eot = raw[7] & 0x80 != 0;
            let seg = if count_field == 0 {
                BM_BUFSIZE
            } else {
                count_field as usize
            };
            let seg = seg.min(remain);

            if write {
                let mut chunk = vec![0u8; seg];
                self.vm.dma_read(base, &mut chunk);
                st.drives[selected].disk[disk_off..disk_off + seg]
                    .copy_from_slice(&chunk);
            } else {
                let chunk =
                    st.drives[selected].disk[disk_off..disk_off + seg]
                        .to_vec();
                self.vm.dma_write(base, &chunk);
            }
            disk_off += seg;
            remain -= seg;
            if eot {
                break;
            }
            prd_phys += 8;
        }
        assert_eq!(remain, 0, "PRD table shorter than the transfer");

        st.dma = SimDma::None;
        st.bm_status &= !0x01; // engine idle
        st.bm_status |= 0x04; // interrupt
        st.status = SIM_STATUS_READY;
    }
}

impl ChannelIo for SimChannel {
    fn read8(&self, block: RegBlock, reg: usize) -> u8 {
        let mut st = self.state.lock().unwrap();
        match block {
            RegBlock::Cmd => match reg {
                REG_ERROR => st.error,
                REG_SECTOR_COUNT => {
                    if st.drives[st.selected].packet_device
                        && st.interrupt_reason != 0
                    {
                        st.interrupt_reason
                    } else {
                        let hob = st.dev_ctl & 0x80 != 0;
                        st.tf.sector_count[usize::from(hob)]
                    }
                }
                REG_LBA_LOW => {
                    let hob = st.dev_ctl & 0x80 != 0;
                    st.tf.lba_low[usize::from(hob)]
                }
                REG_LBA_MID => {
                    if matches!(st.xfer, SimXfer::AtapiIn) {
                        (st.byte_count & 0xff) as u8
                    } else {
                        let hob = st.dev_ctl & 0x80 != 0;
                        st.tf.lba_mid[usize::from(hob)]
                    }
                }
                REG_LBA_HIGH => {
                    if matches!(st.xfer, SimXfer::AtapiIn) {
                        (st.byte_count >> 8) as u8
                    } else {
                        let hob = st.dev_ctl & 0x80 != 0;
                        st.tf.lba_high[usize::from(hob)]
                    }
                }
                REG_DEVICE => st.device,
                REG_STATUS => st.status,
                _ => 0xff,
            },
            RegBlock::Ctl => st.status,
            RegBlock::BusMaster => match reg {
                REG_BM_COMMAND => st.bm_cmd,
                REG_BM_STATUS => st.bm_status,
                _ => 0,
            },
        }
    }

    fn write8(&self, block: RegBlock, reg: usize, data: u8) {
        let mut st = self.state.lock().unwrap();
        match block {
            RegBlock::Cmd => match reg {
                REG_FEATURES => SimTaskFile::push(&mut st.tf.features, data),
                REG_SECTOR_COUNT => {
                    SimTaskFile::push(&mut st.tf.sector_count, data)
                }
                REG_LBA_LOW => SimTaskFile::push(&mut st.tf.lba_low, data),
                REG_LBA_MID => SimTaskFile::push(&mut st.tf.lba_mid, data),
                REG_LBA_HIGH => SimTaskFile::push(&mut st.tf.lba_high, data),
                REG_DEVICE => {
                    st.device = data;
                    st.selected = usize::from(data & 0x10 != 0);
                }
                REG_COMMAND => {
                    if !st.stuck_busy {
                        self.exec_command(&mut st, data);
                    }
                }
                _ => {}
            },
            RegBlock::Ctl => {
                let prev = st.dev_ctl;
                st.dev_ctl = data;
                if prev & 0x04 == 0 && data & 0x04 != 0 && !st.stuck_busy {
                    // Software reset edge.
                    st.status = SIM_STATUS_READY;
                    st.error = 0;
                    st.xfer = SimXfer::None;
                    st.dma = SimDma::None;
                }
            }
            RegBlock::BusMaster => match reg {
                REG_BM_COMMAND => {
                    let was_started = st.bm_cmd & 0x01 != 0;
                    st.bm_cmd = data & 0x09;
                    if !was_started && data & 0x01 != 0 {
                        st.bm_status |= 0x01;
                        self.maybe_run_dma(&mut st);
                    }
                    if data & 0x01 == 0 {
                        st.bm_status &= !0x01;
                    }
                }
                REG_BM_STATUS => {
                    // Write-one-to-clear bits.
                    st.bm_status &= !(data & 0x06);
                }
                _ => {}
            },
        }
    }

    fn read16(&self, block: RegBlock, reg: usize) -> u16 {
        if block == RegBlock::Cmd && reg == REG_DATA {
            let mut st = self.state.lock().unwrap();
            let idx = st.data_idx;
            if idx + 2 <= st.data_buf.len() {
                let val = u16::from_le_bytes(
                    st.data_buf[idx..idx + 2].try_into().unwrap(),
                );
                st.data_idx += 2;
                if st.data_idx >= st.data_buf.len() {
                    st.status &= !SIM_STATUS_DRQ;
                    if matches!(st.xfer, SimXfer::AtapiIn) {
                        st.interrupt_reason = 0x03;
                    }
                }
                val
            } else {
                0xffff
            }
        } else {
            self.read8(block, reg) as u16
        }
    }

    fn write16(&self, block: RegBlock, reg: usize, data: u16) {
        if block == RegBlock::Cmd && reg == REG_DATA {
            let mut st = self.state.lock().unwrap();
            let idx = st.data_idx;
            if idx + 2 <= st.data_buf.len() {
                st.data_buf[idx..idx + 2]
                    .copy_from_slice(&data.to_le_bytes());
                st.data_idx += 2;
                if st.data_idx >= st.data_buf.len() {
                    st.status &= !SIM_STATUS_DRQ;
                    match std::mem::replace(&mut st.xfer, SimXfer::None) {
                        SimXfer::PioOut { lba } => {
                            let data = std::mem::take(&mut st.data_buf);
                            let off = lba as usize * SIM_SECTOR_SIZE;
                            let selected = st.selected;
                            st.drives[selected].disk
                                [off..off + data.len()]
                                .copy_from_slice(&data);
                        }
                        SimXfer::PacketCdb => {
                            self.packet_cdb_complete(&mut st);
                        }
                        other => st.xfer = other,
                    }
                }
            }
        } else {
            self.write8(block, reg, data as u8);
        }
    }

    fn read32(&self, block: RegBlock, reg: usize) -> u32 {
        if block == RegBlock::BusMaster && reg == REG_BM_PRD_TABLE {
            let st = self.state.lock().unwrap();
            st.bm_prd
        } else {
            let low = self.read16(block, reg) as u32;
            let high = self.read16(block, reg) as u32;
            (high << 16) | low
        }
    }

    fn write32(&self, block: RegBlock, reg: usize, data: u32) {
        if block == RegBlock::BusMaster && reg == REG_BM_PRD_TABLE {
            let mut st = self.state.lock().unwrap();
            st.bm_prd = data & 0xffff_fffc;
        } else {
            self.write16(block, reg, data as u16);
            self.write16(block, reg, (data >> 16) as u16);
        }
    }

    fn read_data_block(&self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(2) {
            let val = self.read16(RegBlock::Cmd, REG_DATA);
            let bytes = val.to_le_bytes();
            chunk[0] = bytes[0];
            if chunk.len() > 1 {
                chunk[1] = bytes[1];
            }
        }
    }

    fn write_data_block(&self, buf: &[u8]) {
        for chunk in buf.chunks(2) {
            let val = if chunk.len() > 1 {
                u16::from_le_bytes([chunk[0], chunk[1]])
            } else {
                chunk[0] as u16
            };
            self.write16(RegBlock::Cmd, REG_DATA, val);
        }
    }
}

//
// Simulated AHCI HBA.
//

struct SimPort {
    disk: Option<Vec<u8>>,
    packet_device: bool,
    clb: u32,
    clbu: u32,
    fb: u32,
    fbu: u32,
    is: u32,
    ie: u32,
    cmd: u32,
    sact: u32,
    ci: u32,
}

struct SimHbaState {
    ghc: u32,
    pi: u32,
    ports: Vec<SimPort>,
    /// Test hook: leave issued commands in flight instead of completing
    /// them synchronously.
    hold_commands: bool,
}

/// Simulated physical AHCI controller.
pub struct SimHba {
    vm: Arc<TestVm>,
    state: Mutex<SimHbaState>,
}

impl SimHba {
    pub const MAPLEN: usize = 0x100 + 32 * 0x80;

    pub fn new(vm: Arc<TestVm>, disk_sectors: &[usize]) -> Arc<Self> {
        assert!(disk_sectors.len() <= 32);
        let mut pi = 0u32;
        let ports = (0..32)
            .map(|i| {
                let sectors = disk_sectors.get(i).copied().unwrap_or(0);
                if sectors > 0 {
                    pi |= 1 << i;
                }
                SimPort {
                    disk: (sectors > 0)
                        .then(|| vec![0u8; sectors * SIM_SECTOR_SIZE]),
                    packet_device: false,
                    clb: 0,
                    clbu: 0,
                    fb: 0,
                    fbu: 0,
                    is: 0,
                    ie: 0,
                    cmd: 0,
                    sact: 0,
                    ci: 0,
                }
            })
            .collect();
        Arc::new(Self {
            vm,
            state: Mutex::new(SimHbaState {
                ghc: ahci_bits::GLOBAL_GHC_AE,
                pi,
                ports,
                hold_commands: false,
            }),
        })
    }

    pub fn set_packet_device(&self, port: usize) {
        let mut st = self.state.lock().unwrap();
        st.ports[port].packet_device = true;
    }

    /// Leave issued commands pending (the in-flight bits stay set).
    pub fn set_hold_commands(&self, hold: bool) {
        let mut st = self.state.lock().unwrap();
        st.hold_commands = hold;
    }

    pub fn disk_write(&self, port: usize, lba: u64, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let off = lba as usize * SIM_SECTOR_SIZE;
        let disk = st.ports[port].disk.as_mut().unwrap();
        disk[off..off + data.len()].copy_from_slice(data);
    }

    pub fn disk_read(&self, port: usize, lba: u64, len: usize) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        let off = lba as usize * SIM_SECTOR_SIZE;
        let disk = st.ports[port].disk.as_ref().unwrap();
        disk[off..off + len].to_vec()
    }

    fn process_slot(&self, st: &mut SimHbaState, port_num: usize, slot: usize) {
        use ahci_bits::*;

        let port = &st.ports[port_num];
        let clb = ((port.clbu as u64) << 32) | port.clb as u64;
        let mut hdr_raw = [0u8; CMD_HEADER_SIZE];
        self.vm
            .dma_read(clb + (slot * CMD_HEADER_SIZE) as u64, &mut hdr_raw);
        let mut hdr = CmdHeader::read_from_bytes(&hdr_raw[..]).unwrap();
        let ctba = hdr.ctba_phys();

        let mut cfis = [0u8; 20];
        self.vm.dma_read(ctba, &mut cfis);
        let fis = RegH2DFis::read_from_bytes(&cfis[..]).unwrap();

        let prdtl = hdr.flags().prdtl();
        let mut prds = Vec::new();
        for i in 0..prdtl as usize {
            let mut raw = [0u8; PRDT_ENTRY_SIZE];
            self.vm.dma_read(
                ctba + (CMD_TABLE_PRDT_OFFSET + i * PRDT_ENTRY_SIZE) as u64,
                &mut raw,
            );
            prds.push(PrdtEntry::read_from_bytes(&raw[..]).unwrap());
        }

        let disk_data: Option<Vec<u8>>;
        let mut status = 0x50u8; // DRDY | DSC
        let mut error = 0u8;
        let mut prdbc = 0u32;

        if hdr.flags().atapi() {
            let mut acmd = [0u8; 16];
            self.vm.dma_read(ctba + CMD_TABLE_ACMD_OFFSET as u64, &mut acmd);
            disk_data = self.atapi_data(st, port_num, &acmd);
        } else {
            disk_data = self.ata_data(st, port_num, &fis, &prds, &mut status, &mut error);
        }

        // Scatter read data (or gather write data) across the PRDs.
        let port = &mut st.ports[port_num];
        if let Some(data) = disk_data {
            let mut off = 0usize;
            for prd in &prds {
                let seg = prd.byte_count().min(data.len() - off);
                self.vm
                    .dma_write(prd.data_phys(), &data[off..off + seg]);
                off += seg;
                prdbc += seg as u32;
                if off >= data.len() {
                    break;
                }
            }
        } else if hdr.flags().w() {
            prdbc =
                prds.iter().map(|p| p.byte_count() as u32).sum::<u32>();
        }

        // Update the transferred byte count in the command header.
        hdr.prdbc = prdbc;
        let mut out = [0u8; CMD_HEADER_SIZE];
        out.copy_from_slice(hdr.as_bytes());
        self.vm
            .dma_write(clb + (slot * CMD_HEADER_SIZE) as u64, &out);

        // Post a D2H register FIS to the receive area.
        if port.cmd & PXCMD_FRE != 0 {
            let fb = ((port.fbu as u64) << 32) | port.fb as u64;
            let rfis = RegD2HFis {
                fis_type: FIS_TYPE_REG_D2H,
                pm_i: 0x40,
                status,
                error,
                sector_number: fis.sector_number,
                cyl_low: fis.cyl_low,
                cyl_high: fis.cyl_high,
                dev_head: fis.dev_head,
                sector_number_exp: fis.sector_number_exp,
                cyl_low_exp: fis.cyl_low_exp,
                cyl_high_exp: fis.cyl_high_exp,
                reserved: 0,
                sector_count: fis.sector_count,
                sector_count_exp: fis.sector_count_exp,
                reserved2: [0; 2],
                reserved3: [0; 4],
            };
            self.vm.dma_write(
                fb + RECV_FIS_RFIS_OFFSET as u64,
                rfis.as_bytes(),
            );
        }

        port.ci &= !(1 << slot);
        port.sact &= !(1 << slot);
        port.is |= 1;
    }

    /// Execute the ATA side of a slot; returns data to scatter for reads.
    fn ata_data(
        &self,
        st: &mut SimHbaState,
        port_num: usize,
        fis: &ahci_bits::RegH2DFis,
        prds: &[ahci_bits::PrdtEntry],
        status: &mut u8,
        error: &mut u8,
    ) -> Option<Vec<u8>> {
        let total: usize = prds.iter().map(|p| p.byte_count()).sum();
        match fis.command {
            0xec => {
                let sectors = st.ports[port_num]
                    .disk
                    .as_ref()
                    .map(|d| (d.len() / SIM_SECTOR_SIZE) as u64)
                    .unwrap_or(0);
                if st.ports[port_num].packet_device {
                    *status |= 0x01;
                    *error = 0x04;
                    return None;
                }
                Some(sim_identify_sector(sectors, false))
            }
            0xa1 => Some(sim_identify_sector(0, true)),
            0xc8 | 0x25 | 0x60 => {
                // READ DMA (EXT) / READ FPDMA QUEUED
                let lba = if fis.command == 0xc8 {
                    fis.lba28()
                } else {
                    fis.lba48()
                };
                let off = lba as usize * SIM_SECTOR_SIZE;
                let disk = st.ports[port_num].disk.as_ref().unwrap();
                Some(disk[off..off + total].to_vec())
            }
            0xca | 0x35 | 0x61 => {
                // WRITE DMA (EXT) / WRITE FPDMA QUEUED: gather from PRDs.
                let lba = if fis.command == 0xca {
                    fis.lba28()
                } else {
                    fis.lba48()
                };
                let mut data = vec![0u8; total];
                let mut off = 0usize;
                for prd in prds {
                    let seg = prd.byte_count();
                    self.vm
                        .dma_read(prd.data_phys(), &mut data[off..off + seg]);
                    off += seg;
                }
                let doff = lba as usize * SIM_SECTOR_SIZE;
                let disk = st.ports[port_num].disk.as_mut().unwrap();
                disk[doff..doff + total].copy_from_slice(&data);
                None
            }
            0xe7 | 0xea => None,
            _ => {
                *status |= 0x01;
                *error = 0x04;
                None
            }
        }
    }

    fn atapi_data(
        &self,
        st: &mut SimHbaState,
        port_num: usize,
        acmd: &[u8],
    ) -> Option<Vec<u8>> {
        match acmd[0] {
            0x28 => {
                let lba = u32::from_be_bytes(acmd[2..6].try_into().unwrap())
                    as usize;
                let count =
                    u16::from_be_bytes(acmd[7..9].try_into().unwrap())
                        as usize;
                let disk = st.ports[port_num].disk.as_ref().unwrap();
                Some(disk[lba * 2048..(lba + count) * 2048].to_vec())
            }
            _ => None,
        }
    }
}

impl HbaIo for SimHba {
    fn read32(&self, off: usize) -> u32 {
        use ahci_bits::*;
        let st = self.state.lock().unwrap();
        match off {
            GLOBAL_CAP => {
                // 32 slots, 32 ports, NCQ.
                GLOBAL_CAP_SNCQ | (31 << GLOBAL_CAP_NCS_SHIFT) | 31
            }
            GLOBAL_GHC => st.ghc,
            GLOBAL_PI => st.pi,
            _ if off >= PORT_BASE => {
                let port_num = (off - PORT_BASE) / PORT_STRIDE;
                let reg = (off - PORT_BASE) % PORT_STRIDE;
                let port = &st.ports[port_num];
                match reg {
                    PX_CLB => port.clb,
                    PX_CLBU => port.clbu,
                    PX_FB => port.fb,
                    PX_FBU => port.fbu,
                    PX_IS => port.is,
                    PX_IE => port.ie,
                    PX_CMD => port.cmd,
                    PX_SSTS => {
                        if port.disk.is_some() {
                            0x133 // device present, PHY established
                        } else {
                            0
                        }
                    }
                    PX_SACT => port.sact,
                    PX_CI => port.ci,
                    _ => 0,
                }
            }
            _ => 0,
        }
    }

    fn write32(&self, off: usize, val: u32) {
        use ahci_bits::*;
        let mut st = self.state.lock().unwrap();
        match off {
            GLOBAL_GHC => {
                st.ghc = val | GLOBAL_GHC_AE;
            }
            _ if off >= PORT_BASE => {
                let port_num = (off - PORT_BASE) / PORT_STRIDE;
                let reg = (off - PORT_BASE) % PORT_STRIDE;
                match reg {
                    PX_CLB => st.ports[port_num].clb = val & !0x3ff,
                    PX_CLBU => st.ports[port_num].clbu = val,
                    PX_FB => st.ports[port_num].fb = val & !0xff,
                    PX_FBU => st.ports[port_num].fbu = val,
                    PX_IS => st.ports[port_num].is &= !val,
                    PX_IE => st.ports[port_num].ie = val,
                    PX_CMD => {
                        let mut cmd = val;
                        // CR and FR mirror ST and FRE immediately.
                        if cmd & PXCMD_ST != 0 {
                            cmd |= PXCMD_CR;
                        } else {
                            cmd &= !PXCMD_CR;
                        }
                        if cmd & PXCMD_FRE != 0 {
                            cmd |= PXCMD_FR;
                        } else {
                            cmd &= !PXCMD_FR;
                        }
                        st.ports[port_num].cmd = cmd;
                    }
                    PX_SACT => st.ports[port_num].sact |= val,
                    PX_CI => {
                        st.ports[port_num].ci |= val;
                        if !st.hold_commands
                            && st.ports[port_num].cmd & PXCMD_ST != 0
                        {
                            for slot in 0..NUM_SLOTS {
                                if st.ports[port_num].ci & (1 << slot) != 0 {
                                    self.process_slot(
                                        &mut st, port_num, slot,
                                    );
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn read_buf(&self, off: usize, buf: &mut [u8]) {
        assert!(off % 4 == 0 || buf.len() < 4, "unaligned HBA read");
        let val = self.read32(off & !3);
        let bytes = val.to_le_bytes();
        let shift = off & 3;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *bytes.get(shift + i).unwrap_or(&0);
        }
    }

    fn write_buf(&self, off: usize, buf: &[u8]) {
        if buf.len() == 4 && off % 4 == 0 {
            self.write32(
                off,
                u32::from_le_bytes(buf.try_into().unwrap()),
            );
        }
        // Sub-dword writes to uninteresting registers are dropped, which
        // is close enough to real HBA behavior for the tests.
    }
}

