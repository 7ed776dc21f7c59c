// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous command execution against the physical channel.
//!
//! Commands the hypervisor itself needs to run (as opposed to commands it
//! observes the guest running) are queued per host and executed by a
//! worker thread outside the intercept path.  The worker is created lazily
//! on the first push and exits once the queue drains; there is no
//! persistent pool.  It takes the channel lock at low priority so guest
//! register accesses are never starved behind it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, warn};

use crate::hw::ata::bits::*;
use crate::hw::ata::channel::AtaChannel;
use crate::hw::ata::cmds;
use crate::hw::ata::{probes, AtaHost, RegBlock};

/// Timeout granted to a device-select before the channel is reset.
const SELECT_TIMEOUT_US: i64 = 100_000;

/// One ATA command to run against the physical hardware: the register
/// image to program, the data buffer, and per-phase timeouts.  Results
/// (status/error and the register read-back) are reflected back into the
/// descriptor before the completion callback runs.
#[derive(Clone)]
pub struct AtaCmd {
    pub command: u8,
    pub features: u8,
    pub features_exp: u8,
    pub sector_count: u8,
    pub sector_count_exp: u8,
    pub sector_number: u8,
    pub cyl_low: u8,
    pub cyl_high: u8,
    pub sector_number_exp: u8,
    pub cyl_low_exp: u8,
    pub cyl_high_exp: u8,
    pub dev_head: u8,
    pub control: u8,

    /// ATAPI CDB length; zero for plain ATA commands.
    pub atapi_len: u8,
    pub atapi: [u8; 16],

    pub buf: Vec<u8>,
    pub write: bool,
    pub pio: bool,
    /// Native Command Queuing depth; zero for non-NCQ commands.
    pub ncq: u8,

    /// Timeout (µs) waiting for ready; -1 after expiry.
    pub timeout_ready: i64,
    /// Timeout (µs) waiting for completion; -1 after expiry.
    pub timeout_complete: i64,

    // Register read-back.
    pub status: u8,
    pub error: u8,
}

impl AtaCmd {
    pub fn new(command: u8) -> Self {
        Self {
            command,
            features: 0,
            features_exp: 0,
            sector_count: 0,
            sector_count_exp: 0,
            sector_number: 0,
            cyl_low: 0,
            cyl_high: 0,
            sector_number_exp: 0,
            cyl_low_exp: 0,
            cyl_high_exp: 0,
            dev_head: 0,
            control: 0,
            atapi_len: 0,
            atapi: [0; 16],
            buf: Vec::new(),
            write: false,
            pio: false,
            ncq: 0,
            timeout_ready: 1_000_000,
            timeout_complete: 10_000_000,
            status: 0,
            error: 0,
        }
    }
}

pub type CmdCallback = Box<dyn FnOnce(AtaCmd) + Send + 'static>;

pub(crate) struct Job {
    pub channel: usize,
    pub cmd: AtaCmd,
    pub callback: CmdCallback,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub queue: VecDeque<Job>,
    pub thread_running: bool,
}

impl AtaHost {
    /// Queue a command for asynchronous execution, spawning the worker
    /// thread if none is running.
    pub fn queue_command(
        self: &Arc<Self>,
        channel: usize,
        cmd: AtaCmd,
        callback: CmdCallback,
    ) {
        probes::ata_worker_queue!(|| (channel as u8, cmd.command));
        let spawn = {
            let mut qs = self.cmd_queue.lock().unwrap();
            qs.queue.push_back(Job { channel, cmd, callback });
            if !qs.thread_running {
                qs.thread_running = true;
                true
            } else {
                false
            }
        };
        if spawn {
            let host = self.clone();
            std::thread::Builder::new()
                .name("ata-cmd".to_string())
                .spawn(move || host.command_thread())
                .expect("worker thread spawn");
        }
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

    /// Run one command against the physical channel.  Any phase timeout
    /// writes the -1 sentinel into the matching field and falls through to
    /// cleanup; the worker itself always survives to run the next job.
    fn command_do(&self, job: Job) {
        let channel = &self.channels[job.channel];
        let mut cmd = job.cmd;

        let _guard = channel.guard_lowpri();

        let (saved_dev_ctl, saved_device_reg) = {
            let inner = channel.inner.lock().unwrap();
            (inner.dev_ctl, inner.device_reg)
        };

        let mut failed = false;

        // Phase 1: wait for the channel to go idle.  DMA commands also
        // require the bus-master engine to be quiescent.
        if !wait_ready(channel, cmd.timeout_ready, !cmd.pio) {
            cmd.timeout_ready = -1;
            recover(channel, saved_dev_ctl);
            failed = true;
        }

        // Phase 2: select the requested device if it differs from the
        // current selection.
        if !failed {
            let current = DeviceReg(channel.read_reg(REG_DEVICE));
            let want = DeviceReg(cmd.dev_head);
            if current.dev() != want.dev() {
                channel.write_reg(REG_DEVICE, cmd.dev_head);
                let timeout = cmd.timeout_ready.min(SELECT_TIMEOUT_US);
                if !wait_ready(channel, timeout, false) {
                    warn!(channel.log, "device select timed out";
                        "dev_head" => cmd.dev_head);
                    cmd.timeout_ready = -1;
                    recover(channel, saved_dev_ctl);
                    failed = true;
                }
            }
        }

        if !failed {
            self.issue_and_transfer(channel, &mut cmd, saved_dev_ctl);
        }

        // Register read-back: both HOB banks, then status/error.
        let mut hob_ctl = saved_dev_ctl;
        hob_ctl.set_hob(true);
        channel.ctl_out(hob_ctl);
        cmd.sector_count_exp = channel.read_reg(REG_SECTOR_COUNT);
        cmd.sector_number_exp = channel.read_reg(REG_LBA_LOW);
        cmd.cyl_low_exp = channel.read_reg(REG_LBA_MID);
        cmd.cyl_high_exp = channel.read_reg(REG_LBA_HIGH);
        hob_ctl.set_hob(false);
        channel.ctl_out(hob_ctl);
        cmd.sector_count = channel.read_reg(REG_SECTOR_COUNT);
        cmd.sector_number = channel.read_reg(REG_LBA_LOW);
        cmd.cyl_low = channel.read_reg(REG_LBA_MID);
        cmd.cyl_high = channel.read_reg(REG_LBA_HIGH);
        cmd.error = channel.read_reg(REG_ERROR);
        cmd.status = channel.hw_status().0;

        // Restore the original device selection and control state.
        channel.write_reg(REG_DEVICE, saved_device_reg.0);
        channel.ctl_out(saved_dev_ctl);

        probes::ata_worker_done!(|| (
            job.channel as u8,
            cmd.command,
            cmd.status
        ));
        drop(_guard);
        (job.callback)(cmd);
    }

    fn issue_and_transfer(
        &self,
        channel: &Arc<AtaChannel>,
        cmd: &mut AtaCmd,
        saved_dev_ctl: DevCtl,
    ) {
        let ext = cmds::classify(cmd.command).ext;

        // Program the task file; the HOB bank goes first so the low bytes
        // end up in the foreground registers.
        if ext || cmd.ncq > 0 {
            channel.write_reg(REG_FEATURES, cmd.features_exp);
            channel.write_reg(REG_SECTOR_COUNT, cmd.sector_count_exp);
            channel.write_reg(REG_LBA_LOW, cmd.sector_number_exp);
            channel.write_reg(REG_LBA_MID, cmd.cyl_low_exp);
            channel.write_reg(REG_LBA_HIGH, cmd.cyl_high_exp);
        }
        channel.write_reg(REG_FEATURES, cmd.features);
        channel.write_reg(REG_SECTOR_COUNT, cmd.sector_count);
        channel.write_reg(REG_LBA_LOW, cmd.sector_number);
        channel.write_reg(REG_LBA_MID, cmd.cyl_low);
        channel.write_reg(REG_LBA_HIGH, cmd.cyl_high);
        channel.write_reg(REG_DEVICE, cmd.dev_head);

        // Stage the DMA shadow before the command is issued.  The caller's
        // buffer may be odd-sized, which a PRD entry cannot express; round
        // up by one byte, matching what the hardware will transfer.
        if !cmd.pio && !cmd.buf.is_empty() {
            let mut buf_len = cmd.buf.len();
            if buf_len <= 1 || buf_len & 1 == 1 {
                buf_len += 1;
            }
            if cmd.write {
                channel.shadow_buf.copy_in(0, &cmd.buf);
            }
            channel.set_shadow_prd(buf_len);
            channel.io.write32(
                RegBlock::BusMaster,
                REG_BM_PRD_TABLE,
                channel.shadow_prd.phys() as u32,
            );
        }

        channel.write_reg(REG_COMMAND, cmd.command);

        // ATAPI: relay the CDB once the device raises DRQ.
        if cmd.atapi_len > 0 {
            if !wait_drq(channel, cmd.timeout_complete) {
                cmd.timeout_complete = -1;
                recover(channel, saved_dev_ctl);
                return;
            }
            channel
                .io
                .write_data_block(&cmd.atapi[..cmd.atapi_len as usize]);
        }

        if cmd.pio {
            self.pio_transfer(channel, cmd, saved_dev_ctl);
        } else if !cmd.buf.is_empty() {
            self.dma_transfer(channel, cmd, saved_dev_ctl);
        } else if !wait_ready(channel, cmd.timeout_complete, false) {
            // Non-data command: just wait for completion.
            cmd.timeout_complete = -1;
            recover(channel, saved_dev_ctl);
        }
    }

    /// Byte-wise PIO relay of the command's buffer, one 512-byte block at
    /// a time.
    fn pio_transfer(
        &self,
        channel: &Arc<AtaChannel>,
        cmd: &mut AtaCmd,
        saved_dev_ctl: DevCtl,
    ) {
        let block = 512usize.min(cmd.buf.len().max(1));
        let mut off = 0;
        while off < cmd.buf.len() {
            let end = (off + block).min(cmd.buf.len());
            if !wait_drq(channel, cmd.timeout_complete) {
                cmd.timeout_complete = -1;
                recover(channel, saved_dev_ctl);
                return;
            }
            if cmd.write {
                channel.io.write_data_block(&cmd.buf[off..end]);
            } else {
                channel.io.read_data_block(&mut cmd.buf[off..end]);
            }
            off = end;
        }
        if !wait_ready(channel, cmd.timeout_complete, false) {
            cmd.timeout_complete = -1;
            recover(channel, saved_dev_ctl);
        }
    }

    /// Start the bus master and poll it to completion.
    fn dma_transfer(
        &self,
        channel: &Arc<AtaChannel>,
        cmd: &mut AtaCmd,
        saved_dev_ctl: DevCtl,
    ) {
        let mut bm = BmCommand(0);
        bm.set_rw(!cmd.write);
        bm.set_start(true);
        channel.io.write8(RegBlock::BusMaster, REG_BM_COMMAND, bm.0);

        let deadline = deadline_for(cmd.timeout_complete);
        loop {
            let bm_status = BmStatus(
                channel.io.read8(RegBlock::BusMaster, REG_BM_STATUS),
            );
            let status = channel.hw_status();
            if !bm_status.active() && !status.bsy() {
                break;
            }
            if Instant::now() >= deadline {
                cmd.timeout_complete = -1;
                bm.set_start(false);
                channel.io.write8(RegBlock::BusMaster, REG_BM_COMMAND, bm.0);
                recover(channel, saved_dev_ctl);
                return;
            }
            std::thread::yield_now();
        }

        bm.set_start(false);
        channel.io.write8(RegBlock::BusMaster, REG_BM_COMMAND, bm.0);

        if !cmd.write {
            let len = cmd.buf.len();
            channel.shadow_buf.copy_out(0, &mut cmd.buf[..len]);
        }
    }
}

fn deadline_for(timeout_us: i64) -> Instant {
    Instant::now() + Duration::from_micros(timeout_us.max(0) as u64)
}

/// Poll the channel until it is ready to accept a command.
fn wait_ready(
    channel: &Arc<AtaChannel>,
    timeout_us: i64,
    check_bm: bool,
) -> bool {
    let deadline = deadline_for(timeout_us);
    loop {
        let status = channel.hw_status();
        let bm_busy = check_bm
            && BmStatus(channel.io.read8(RegBlock::BusMaster, REG_BM_STATUS))
                .active();
        if !status.bsy() && status.drdy() && !bm_busy {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::yield_now();
    }
}

/// Poll for a data-request phase.
fn wait_drq(channel: &Arc<AtaChannel>, timeout_us: i64) -> bool {
    let deadline = deadline_for(timeout_us);
    loop {
        let status = channel.hw_status();
        if !status.bsy() && status.drq() {
            return true;
        }
        if status.err() {
            return false;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::yield_now();
    }
}

/// Hardware-level recovery after a timeout: software reset followed by a
/// cache flush, the only way to un-stick a wedged device.
fn recover(channel: &Arc<AtaChannel>, saved_dev_ctl: DevCtl) {
    debug!(channel.log, "channel recovery: soft reset + cache flush");

    let mut ctl = saved_dev_ctl;
    ctl.set_srst(true);
    channel.ctl_out(ctl);
    std::thread::sleep(Duration::from_micros(50));
    ctl.set_srst(false);
    channel.ctl_out(ctl);
    let _ = wait_ready(channel, SELECT_TIMEOUT_US, false);

    channel.write_reg(REG_COMMAND, cmds::CMD_FLUSH_CACHE);
    let _ = wait_ready(channel, SELECT_TIMEOUT_US, false);
}
