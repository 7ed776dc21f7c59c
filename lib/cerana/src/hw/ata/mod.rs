// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generic ATA/ATAPI para-pass-through emulation.
//!
//! One [AtaHost] models a PCI IDE function: two channels, each carrying up
//! to two devices.  Guest accesses to the command-block, control-block and
//! bus-master register ranges are intercepted and dispatched into the
//! channel state machine; whatever the emulation does not consume is
//! forwarded to the physical controller through [ChannelIo].

use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

pub mod bits;
pub mod channel;
pub mod cmds;
pub mod geometry;
pub mod packet;
pub mod pci;
pub mod worker;

mod atapi;
mod bm;


pub use channel::{AtaChannel, AtaDevice, ChannelState};
pub use worker::{AtaCmd, CmdCallback};

#[derive(Debug, Error)]
pub enum AtaError {
    #[error("no device")]
    NoDevice,

    #[error("device is busy")]
    DeviceBusy,

    #[error("device not ready")]
    DeviceNotReady,

    #[error("unknown command code ({0:#04x})")]
    UnknownCommandCode(u8),

    #[error("invalid 48-bit CHS address (command {0:#04x})")]
    Invalid48BitChs(u8),
}

impl slog::KV for AtaError {
    fn serialize(
        &self,
        _rec: &slog::Record,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_str("error", &self.to_string())
    }
}

#[usdt::provider(provider = "cerana")]
pub(crate) mod probes {
    fn ata_cmd(channel: u8, cmd: u8) {}
    fn ata_bm_start(channel: u8, write: u8, bytes: u32) {}
    fn ata_worker_queue(channel: u8, cmd: u8) {}
    fn ata_worker_done(channel: u8, cmd: u8, status: u8) {}
}

/// The three register blocks of one physical channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegBlock {
    Cmd,
    Ctl,
    BusMaster,
}

/// Access to the physical registers of one IDE channel: the pass-through
/// target.  Implementations translate these into real port I/O (or, under
/// test, into a simulated drive).
pub trait ChannelIo: Send + Sync + 'static {
    fn read8(&self, block: RegBlock, reg: usize) -> u8;
    fn write8(&self, block: RegBlock, reg: usize, data: u8);
    fn read16(&self, block: RegBlock, reg: usize) -> u16;
    fn write16(&self, block: RegBlock, reg: usize, data: u16);
    fn read32(&self, block: RegBlock, reg: usize) -> u32;
    fn write32(&self, block: RegBlock, reg: usize, data: u32);

    /// String transfer of a whole block through the Data register
    /// (`insw`-style).
    fn read_data_block(&self, buf: &mut [u8]);
    /// String transfer of a whole block into the Data register
    /// (`outsw`-style).
    fn write_data_block(&self, buf: &[u8]);
}

/// Mutual exclusion over one channel's emulation state.
///
/// `lock` blocks until the channel is free; `lock_lowpri` additionally
/// yields to any foreground waiter, so register-access handlers are never
/// starved by the background command worker.  This is not a ticket lock:
/// ordering among foreground waiters is not guaranteed.
pub struct ChannelLock {
    state: Mutex<LockWait>,
    cv: Condvar,
}

#[derive(Default)]
struct LockWait {
    locked: bool,
    waiting: u32,
}

impl ChannelLock {
    pub fn new() -> Self {
        Self { state: Mutex::new(LockWait::default()), cv: Condvar::new() }
    }

    pub fn lock(&self) {
        let mut st = self.state.lock().unwrap();
        if st.locked {
            st.waiting += 1;
            while st.locked {
                st = self.cv.wait(st).unwrap();
            }
            st.waiting -= 1;
        }
        st.locked = true;
    }

    pub fn lock_lowpri(&self) {
        let mut st = self.state.lock().unwrap();
        while st.locked || st.waiting > 0 {
            st = self.cv.wait(st).unwrap();
        }
        st.locked = true;
    }

    pub fn unlock(&self) {
        let mut st = self.state.lock().unwrap();
        assert!(st.locked, "unlock of unheld channel lock");
        st.locked = false;
        drop(st);
        self.cv.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    pub fn guard(&self) -> LockGuard<'_> {
        self.lock();
        LockGuard { lock: self }
    }

    pub fn guard_lowpri(&self) -> LockGuard<'_> {
        self.lock_lowpri();
        LockGuard { lock: self }
    }
}

impl Default for ChannelLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LockGuard<'a> {
    lock: &'a ChannelLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// One PCI IDE function: two channels plus the asynchronous command queue
/// shared by both.
pub struct AtaHost {
    pub log: slog::Logger,
    pub channels: [Arc<AtaChannel>; 2],
    pub(crate) cmd_queue: Mutex<worker::QueueState>,
}

impl AtaHost {
    pub fn new(log: slog::Logger, channels: [Arc<AtaChannel>; 2]) -> Arc<Self> {
        Arc::new(Self {
            log,
            channels,
            cmd_queue: Mutex::new(worker::QueueState::default()),
        })
    }
}
