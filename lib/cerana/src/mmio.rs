// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MMIO intercept bus.
//!
//! The AHCI overlay registers its HBA frame here.  Unlike the port-I/O bus,
//! MMIO handlers perform their own pass-through (they own a mapping of the
//! physical registers), so a handler's `Done` is the common case.

use std::sync::{Arc, Mutex};

use crate::common::*;
use crate::util::aspace::ASpace;
pub use crate::util::aspace::{Error, Result};

pub type MmioFn =
    dyn Fn(usize, RWOp<'_, '_>) -> IoDisposition + Send + Sync + 'static;

/// MMIO bus.
pub struct MmioBus {
    map: Mutex<ASpace<Arc<MmioFn>>>,
    log: slog::Logger,
}

impl MmioBus {
    pub fn new(log: slog::Logger, max: usize) -> Self {
        Self { map: Mutex::new(ASpace::new(0, max)), log }
    }

    pub fn register(
        &self,
        base: usize,
        len: usize,
        func: Arc<MmioFn>,
    ) -> Result<()> {
        self.map.lock().unwrap().register(base, len, func)
    }

    pub fn unregister(&self, base: usize) -> Result<()> {
        self.map.lock().unwrap().unregister(base).map(|_| ())
    }

    pub fn handle_write(
        &self,
        addr: usize,
        bytes: u8,
        val: u64,
    ) -> IoDisposition {
        let buf = val.to_le_bytes();
        let data = match bytes {
            1 => &buf[0..1],
            2 => &buf[0..2],
            4 => &buf[0..4],
            8 => &buf[0..],
            _ => panic!("invalid mmio width {}", bytes),
        };
        let handled = self.do_mmio(addr, |base, off, func| {
            let mut wo = WriteOp::from_buf(off, data);
            func(base, RWOp::Write(&mut wo))
        });
        handled.unwrap_or_else(|| {
            slog::info!(self.log, "unhandled MMIO";
                "op" => "write", "addr" => addr, "bytes" => bytes);
            IoDisposition::Default
        })
    }

    pub fn handle_read(
        &self,
        addr: usize,
        bytes: u8,
    ) -> (u64, IoDisposition) {
        let mut buf = [0xffu8; 8];
        let data = match bytes {
            1 => &mut buf[0..1],
            2 => &mut buf[0..2],
            4 => &mut buf[0..4],
            8 => &mut buf[0..],
            _ => panic!("invalid mmio width {}", bytes),
        };
        let handled = self.do_mmio(addr, |base, off, func| {
            let mut ro = ReadOp::from_buf(off, data);
            func(base, RWOp::Read(&mut ro))
        });
        let disp = handled.unwrap_or_else(|| {
            slog::info!(self.log, "unhandled MMIO";
                "op" => "read", "addr" => addr, "bytes" => bytes);
            IoDisposition::Default
        });
        (u64::from_le_bytes(buf), disp)
    }

    fn do_mmio<F>(&self, addr: usize, f: F) -> Option<IoDisposition>
    where
        F: FnOnce(usize, usize, &Arc<MmioFn>) -> IoDisposition,
    {
        let map = self.map.lock().unwrap();
        if let Ok((start, _len, func)) = map.region_at(addr) {
            let func = Arc::clone(func);
            // unlock map before entering handler
            drop(map);
            Some(f(start, addr - start, &func))
        } else {
            None
        }
    }
}
