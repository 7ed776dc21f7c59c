// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Port I/O intercept bus.
//!
//! Guest `in`/`out` instructions reaching an intercepted port range are
//! turned into [RWOp]s and dispatched to the registered handler.  A handler
//! returning [IoDisposition::Default] asks the bus to forward the access to
//! the physical port (the para-pass-through path); `Done` consumes the
//! access; `Block` leaves it unresolved.

use std::sync::{Arc, Mutex};

use crate::common::*;
use crate::util::aspace::ASpace;
pub use crate::util::aspace::{Error, Result};

use byteorder::{ByteOrder, LE};

/// Physical port-I/O target used to fulfill pass-through dispositions.
pub trait PortIo: Send + Sync + 'static {
    /// Perform the access described by `rwo` against physical port `port`.
    fn io(&self, port: u16, rwo: RWOp);
}

pub type PioFn =
    dyn Fn(u16, RWOp<'_, '_>) -> IoDisposition + Send + Sync + 'static;

struct PioEntry {
    func: Arc<PioFn>,
    passthru: Option<Arc<dyn PortIo>>,
}

/// Port IO bus.
pub struct PioBus {
    map: Mutex<ASpace<PioEntry>>,
    log: slog::Logger,
}

impl PioBus {
    pub fn new(log: slog::Logger) -> Self {
        Self { map: Mutex::new(ASpace::new(0, u16::MAX as usize)), log }
    }

    /// Register `func` for ports [`start`, `start + len`).  When the
    /// handler requests pass-through, the access is replayed against
    /// `passthru` if one is provided.
    pub fn register(
        &self,
        start: u16,
        len: u16,
        func: Arc<PioFn>,
        passthru: Option<Arc<dyn PortIo>>,
    ) -> Result<()> {
        self.map.lock().unwrap().register(
            start as usize,
            len as usize,
            PioEntry { func, passthru },
        )
    }

    pub fn unregister(&self, start: u16) -> Result<()> {
        self.map.lock().unwrap().unregister(start as usize).map(|_| ())
    }

    pub fn handle_out(
        &self,
        port: u16,
        bytes: u8,
        val: u32,
    ) -> IoDisposition {
        let buf = val.to_le_bytes();
        let data = match bytes {
            1 => &buf[0..1],
            2 => &buf[0..2],
            4 => &buf[0..],
            _ => panic!("invalid pio width {}", bytes),
        };
        let handled = self.do_pio(port, |base, off, ent| {
            let mut wo = WriteOp::from_buf(off as usize, data);
            let disp = (ent.func)(base, RWOp::Write(&mut wo));
            if disp == IoDisposition::Default {
                if let Some(pt) = ent.passthru.as_ref() {
                    let mut fwd = WriteOp::from_buf(off as usize, data);
                    pt.io(port, RWOp::Write(&mut fwd));
                }
            }
            disp
        });
        match handled {
            Some(disp) => disp,
            None => {
                slog::info!(self.log, "unhandled PIO";
                    "op" => "out", "port" => port, "bytes" => bytes);
                IoDisposition::Default
            }
        }
    }

    pub fn handle_in(&self, port: u16, bytes: u8) -> (u32, IoDisposition) {
        let mut buf = [0xffu8; 4];
        let data = match bytes {
            1 => &mut buf[0..1],
            2 => &mut buf[0..2],
            4 => &mut buf[0..],
            _ => panic!("invalid pio width {}", bytes),
        };
        let handled = self.do_pio(port, |base, off, ent| {
            let mut ro = ReadOp::from_buf(off as usize, &mut *data);
            let disp = (ent.func)(base, RWOp::Read(&mut ro));
            drop(ro);
            if disp == IoDisposition::Default {
                if let Some(pt) = ent.passthru.as_ref() {
                    let mut fwd = ReadOp::from_buf(off as usize, &mut *data);
                    pt.io(port, RWOp::Read(&mut fwd));
                }
            }
            disp
        });
        let disp = match handled {
            Some(disp) => disp,
            None => {
                slog::info!(self.log, "unhandled PIO";
                    "op" => "in", "port" => port, "bytes" => bytes);
                IoDisposition::Default
            }
        };
        (LE::read_u32(&buf), disp)
    }

    fn do_pio<F>(&self, port: u16, f: F) -> Option<IoDisposition>
    where
        F: FnOnce(u16, u16, &PioEntry) -> IoDisposition,
    {
        let map = self.map.lock().unwrap();
        if let Ok((start, _len, ent)) = map.region_at(port as usize) {
            let ent = PioEntry {
                func: Arc::clone(&ent.func),
                passthru: ent.passthru.clone(),
            };
            // unlock map before entering handler
            drop(map);
            Some(f(start as u16, port - start as u16, &ent))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn dispatch_and_offsets() {
        let bus = PioBus::new(test_log());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hc = hits.clone();
        bus.register(
            0x1f0,
            8,
            Arc::new(move |base, rwo| {
                hc.lock().unwrap().push((base, rwo.offset(), rwo.len()));
                IoDisposition::Done
            }),
            None,
        )
        .unwrap();

        bus.handle_out(0x1f7, 1, 0xec);
        let (_, disp) = bus.handle_in(0x1f0, 2);
        assert_eq!(disp, IoDisposition::Done);
        assert_eq!(
            *hits.lock().unwrap(),
            vec![(0x1f0u16, 7usize, 1usize), (0x1f0, 0, 2)]
        );
    }

    #[test]
    fn unhandled_reads_float_high() {
        let bus = PioBus::new(test_log());
        let (val, disp) = bus.handle_in(0x900, 2);
        assert_eq!(val, 0xffff);
        assert_eq!(disp, IoDisposition::Default);
    }

    #[test]
    fn default_forwards_to_passthru() {
        struct FixedPort;
        impl PortIo for FixedPort {
            fn io(&self, _port: u16, rwo: RWOp) {
                if let RWOp::Read(ro) = rwo {
                    ro.write_u8(0x42);
                }
            }
        }

        let bus = PioBus::new(test_log());
        bus.register(
            0x170,
            8,
            Arc::new(|_base, _rwo| IoDisposition::Default),
            Some(Arc::new(FixedPort)),
        )
        .unwrap();

        let (val, disp) = bus.handle_in(0x170, 1);
        assert_eq!(disp, IoDisposition::Default);
        assert_eq!(val & 0xff, 0x42);
    }
}
