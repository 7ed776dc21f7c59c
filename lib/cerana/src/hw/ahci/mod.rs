// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AHCI-mode para-pass-through overlay.
//!
//! Structurally parallel to the legacy channel emulation but protocol
//! different: instead of a per-channel state enum, every port carries a
//! 32-entry shadow command list whose slot table tracks dispatched-but-
//! unretired commands.  Interception happens on the HBA's MMIO frame (and
//! the optional SATA index/data port pair) rather than on port I/O.

use std::sync::{Arc, Mutex};

use slog::{info, warn};

use crate::block::Backend;
use crate::common::{IoDisposition, RWOp};
use crate::hw::ata::ChannelLock;
use crate::vmm::{DmaArena, MemCtx};

pub mod bits;
pub mod cmd;
pub mod port;


use bits::*;
pub use port::AhciPortState;

/// Access to the physical HBA's register frame: the pass-through target
/// for everything the overlay does not rewrite.
pub trait HbaIo: Send + Sync + 'static {
    fn read32(&self, off: usize) -> u32;
    fn write32(&self, off: usize, val: u32);
    fn read_buf(&self, off: usize, buf: &mut [u8]);
    fn write_buf(&self, off: usize, buf: &[u8]);
}

pub(crate) struct AhciInner {
    pub enabled: bool,
    pub not_ahci: bool,
    pub pi: u32,
    /// Number of command slots the HBA implements.
    pub ncs: u32,
    pub idp_index: u32,
    pub ports: Vec<Option<AhciPortState>>,
    /// Backends waiting to be bound to a port on first guest touch.
    pub backends: Vec<Option<Arc<dyn Backend>>>,
}

/// One AHCI host controller.
pub struct AhciData {
    pub(crate) log: slog::Logger,
    /// Host-wide lock: all port completion scanning and register access
    /// is serialized, coarser-grained than the per-channel legacy path.
    pub(crate) lock: ChannelLock,
    pub(crate) hw: Arc<dyn HbaIo>,
    pub(crate) mem: MemCtx,
    pub(crate) arena: DmaArena,
    pub(crate) inner: Mutex<AhciInner>,
    pub(crate) cmd_queue: Mutex<cmd::QueueState>,
    /// Size of the physical register frame, bounding the probe.
    maplen: usize,
}

impl AhciData {
    pub fn new(
        log: slog::Logger,
        hw: Arc<dyn HbaIo>,
        mem: MemCtx,
        arena: DmaArena,
        backends: Vec<Option<Arc<dyn Backend>>>,
        maplen: usize,
    ) -> Arc<Self> {
        assert_eq!(backends.len(), NUM_PORTS);
        let ad = Arc::new(Self {
            log,
            lock: ChannelLock::new(),
            hw,
            mem,
            arena,
            inner: Mutex::new(AhciInner {
                enabled: false,
                not_ahci: false,
                pi: 0,
                ncs: 1,
                idp_index: 0,
                ports: (0..NUM_PORTS).map(|_| None).collect(),
                backends,
            }),
            cmd_queue: Mutex::new(cmd::QueueState::default()),
            maplen,
        });
        {
            let mut inner = ad.inner.lock().unwrap();
            ad.probe(&mut inner, false, 0);
        }
        ad
    }

    /// Whether the device turned out to be a working AHCI controller.
    pub fn enabled(&self) -> bool {
        self.inner.lock().unwrap().enabled
    }

    pub fn is_ahci(&self) -> bool {
        !self.inner.lock().unwrap().not_ahci
    }

    pub(crate) fn port_read32(&self, port: usize, reg: usize) -> u32 {
        self.hw.read32(port_reg(port, reg))
    }

    pub(crate) fn port_write32(&self, port: usize, reg: usize, val: u32) {
        self.hw.write32(port_reg(port, reg), val);
    }

    pub(crate) fn wait_for_pxcmd(
        &self,
        port: usize,
        mask: u32,
        value: u32,
    ) -> bool {
        for _ in 0..1_500_000 {
            if self.port_read32(port, PX_CMD) & mask == value {
                return true;
            }
        }
        false
    }

    /// Validate the GHC.AE handshake and the CAP/PI consistency of the
    /// controller.  A device which fails here is left in raw pass-through
    /// mode for good.
    pub(crate) fn probe(
        &self,
        inner: &mut AhciInner,
        wrote_ghc: bool,
        value: u32,
    ) -> bool {
        if self.maplen < 0x180 {
            warn!(self.log, "AHCI: memory space too small");
            inner.not_ahci = true;
            return false;
        }
        if wrote_ghc && inner.enabled && (value & GLOBAL_GHC_AE) != 0 {
            return true; // fast path
        }
        let ghc = self.hw.read32(GLOBAL_GHC);
        if wrote_ghc
            && (value & GLOBAL_GHC_AE) != 0
            && (ghc & GLOBAL_GHC_AE) == 0
        {
            // AE must be able to be set.
            warn!(self.log, "AHCI: cannot set GHC.AE");
            inner.not_ahci = true;
            return false;
        }
        if inner.enabled {
            if (ghc & GLOBAL_GHC_AE) == 0 {
                info!(self.log, "AHCI disabled");
                inner.enabled = false;
            }
            return true;
        }
        if (ghc & GLOBAL_GHC_AE) == 0 {
            return true;
        }

        let cap = self.hw.read32(GLOBAL_CAP);
        let num_ports = (cap & GLOBAL_CAP_NP_MASK) as usize + 1;
        if self.maplen < PORT_BASE + PORT_STRIDE * num_ports {
            warn!(self.log, "AHCI: memory space too small for ports");
            inner.not_ahci = true;
            return false;
        }
        let pi = self.hw.read32(GLOBAL_PI);
        let implemented = pi.count_ones() as usize;
        if implemented == 0 {
            warn!(self.log, "AHCI: no ports implemented");
            inner.not_ahci = true;
            return false;
        }
        if implemented > num_ports {
            warn!(self.log, "AHCI: PI and NP inconsistency detected");
            inner.not_ahci = true;
            return false;
        }

        inner.pi = pi;
        inner.ncs = ((cap & GLOBAL_CAP_NCS_MASK) >> GLOBAL_CAP_NCS_SHIFT) + 1;
        inner.enabled = true;
        info!(self.log, "AHCI enabled";
            "ports" => num_ports, "ncs" => inner.ncs,
            "ncq" => (cap & GLOBAL_CAP_SNCQ) != 0);
        true
    }

    fn raw_access(&self, offset: usize, wr: bool, buf: &mut [u8]) {
        if wr {
            self.hw.write_buf(offset, buf);
        } else {
            self.hw.read_buf(offset, buf);
        }
    }

    /// MMIO intercept entry point.
    pub fn mmio_rw(&self, mut rwo: RWOp) -> IoDisposition {
        let _guard = self.lock.guard();
        let mut inner = self.inner.lock().unwrap();

        match &mut rwo {
            RWOp::Read(ro) => {
                let mut buf = vec![0u8; ro.len()];
                let off = ro.offset();
                self.mm_access(&mut inner, off, false, &mut buf);
                ro.write_bytes(&buf);
            }
            RWOp::Write(wo) => {
                let mut buf = vec![0u8; wo.len()];
                let off = wo.offset();
                wo.read_bytes(&mut buf);
                self.mm_access(&mut inner, off, true, &mut buf);
            }
        }
        IoDisposition::Done
    }

    fn mm_access(
        &self,
        inner: &mut AhciInner,
        offset: usize,
        wr: bool,
        buf: &mut [u8],
    ) {
        if inner.not_ahci {
            self.raw_access(offset, wr, buf);
            return;
        }
        // 64-bit access support.
        if buf.len() == 8 {
            let (lo, hi) = buf.split_at_mut(4);
            self.mm_access(inner, offset, wr, lo);
            self.mm_access(inner, offset + 4, wr, hi);
            return;
        }
        if !inner.enabled {
            self.raw_access(offset, wr, buf);
            if wr {
                if offset == GLOBAL_GHC && buf.len() >= 4 {
                    let val = u32::from_le_bytes(buf[..4].try_into().unwrap());
                    self.probe(inner, true, val);
                } else if offset < GLOBAL_GHC + 4
                    && offset + buf.len() > GLOBAL_GHC
                {
                    self.probe(inner, false, 0);
                }
            }
            return;
        }

        let len = buf.len();
        let port_num = (offset >> 7) as isize - 2;
        let port_off = offset & 0x7f;
        assert!(port_num >= -2 && port_num < NUM_PORTS as isize);

        // Retire any finished shadowed commands on every access, and
        // answer PxSACT/PxCI reads from the values sampled during the
        // scan.
        let mut answered = false;
        for i in 0..NUM_PORTS {
            if inner.ports[i]
                .as_ref()
                .map(|p| p.shadow_mask() != 0)
                .unwrap_or(false)
            {
                let pxsact = self.port_read32(i, PX_SACT);
                let pxci = self.port_read32(i, PX_CI);
                {
                    let port = inner.ports[i].as_mut().unwrap();
                    self.cmd_complete(port, pxsact, pxci);
                }
                if !wr && port_num == i as isize {
                    if port_eq(port_off, len, PX_SACT) {
                        buf.copy_from_slice(&pxsact.to_le_bytes());
                        answered = true;
                    } else if port_eq(port_off, len, PX_CI) {
                        buf.copy_from_slice(&pxci.to_le_bytes());
                        answered = true;
                    }
                }
            }
        }
        if answered {
            return;
        }

        assert!(port_off + len <= PORT_STRIDE);
        let pn = if port_num >= 0 { Some(port_num as usize) } else { None };

        if wr {
            let val = if len == 4 {
                u32::from_le_bytes(buf[..4].try_into().unwrap())
            } else {
                0
            };
            if let Some(n) = pn {
                if port_eq(port_off, len, PX_CLB) {
                    self.ensure_port_init(inner, n);
                    if let Some(port) = inner.ports[n].as_mut() {
                        port.clb = val & !0x3ff;
                        let myclb = port.mylist.phys() as u32;
                        self.port_write32(n, PX_CLB, myclb);
                        return;
                    }
                }
                if port_eq(port_off, len, PX_CLBU) {
                    self.ensure_port_init(inner, n);
                    if let Some(port) = inner.ports[n].as_mut() {
                        port.clbu = val;
                        let myclbu = (port.mylist.phys() >> 32) as u32;
                        self.port_write32(n, PX_CLBU, myclbu);
                        return;
                    }
                }
                if port_eq(port_off, len, PX_CMD) {
                    if let Some(port) = inner.ports[n].as_mut() {
                        if port.shadow_mask() != 0 && (val & PXCMD_ST) == 0 {
                            let pxcmd = self.port_read32(n, PX_CMD);
                            if pxcmd & PXCMD_ST != 0 {
                                port.cmd_cancel();
                            }
                        } else if val & PXCMD_ST != 0 {
                            let pxcmd = self.port_read32(n, PX_CMD);
                            if pxcmd & PXCMD_ST == 0 {
                                // PxCLB may only be changed while ST is
                                // clear; make sure the shadow list is in
                                // place before the engine starts.
                                let myclb = port.mylist.phys() as u32;
                                let myclbu =
                                    (port.mylist.phys() >> 32) as u32;
                                self.port_write32(n, PX_CLB, myclb);
                                self.port_write32(n, PX_CLBU, myclbu);
                            }
                        }
                    }
                }
                if port_eq(port_off, len, PX_SACT) {
                    // PxSACT is cleared when PxCMD.ST is cleared during
                    // port takeover, so the port must be initialized
                    // before the guest relies on it.
                    self.ensure_port_init(inner, n);
                }
                if port_eq(port_off, len, PX_CI) {
                    // Some BIOSes write PxCI before setting PxCMD.ST.
                    self.ensure_port_init(inner, n);
                    if let Some(port) = inner.ports[n].as_mut() {
                        self.cmd_start(port, val);
                    }
                }
            }
            if port_eq_global(offset, len, GLOBAL_GHC) {
                self.hw.write32(GLOBAL_GHC, val);
                self.probe(inner, true, val);
                return;
            }
        } else if let Some(n) = pn {
            if port_eq(port_off, len, PX_CLB) {
                self.ensure_port_init(inner, n);
                if let Some(port) = inner.ports[n].as_ref() {
                    buf.copy_from_slice(&port.clb.to_le_bytes());
                    return;
                }
            }
            if port_eq(port_off, len, PX_CLBU) {
                self.ensure_port_init(inner, n);
                if let Some(port) = inner.ports[n].as_ref() {
                    buf.copy_from_slice(&port.clbu.to_le_bytes());
                    return;
                }
            }
        }
        self.raw_access(offset, wr, buf);
    }

    /// Lazily take over a port the guest is starting to use: allocate the
    /// shadow command list and swap it in under the engine's feet.
    pub(crate) fn ensure_port_init(
        &self,
        inner: &mut AhciInner,
        port_num: usize,
    ) {
        if inner.ports[port_num].is_some() {
            return;
        }
        let Some(backend) = inner.backends[port_num].take() else {
            return;
        };
        let port = AhciPortState::new(&self.arena, backend);

        let myclb = port.mylist.phys() as u32;
        let myclbu = (port.mylist.phys() >> 32) as u32;
        let mut port = port;
        port.clb = self.port_read32(port_num, PX_CLB);
        port.clbu = self.port_read32(port_num, PX_CLBU);

        let pxcmd = self.port_read32(port_num, PX_CMD);
        if pxcmd & PXCMD_ST != 0 {
            self.port_write32(port_num, PX_CMD, pxcmd & !PXCMD_ST);
            // PxCMD.CR should be cleared by hardware after clearing
            // PxCMD.ST.
            if !self.wait_for_pxcmd(port_num, PXCMD_CR, 0) {
                warn!(self.log, "PxCMD.CR stuck high"; "port" => port_num);
            }
            self.port_write32(port_num, PX_CLB, myclb);
            self.port_write32(port_num, PX_CLBU, myclbu);
            self.port_write32(port_num, PX_CMD, pxcmd);
            if !self.wait_for_pxcmd(port_num, PXCMD_CR, PXCMD_CR) {
                warn!(self.log, "PxCMD.CR stuck low"; "port" => port_num);
            }
        } else {
            self.port_write32(port_num, PX_CLB, myclb);
            self.port_write32(port_num, PX_CLBU, myclbu);
        }

        info!(self.log, "AHCI port initialized"; "port" => port_num);
        inner.ports[port_num] = Some(port);
    }

    /// SATA Index-Data Pair: a legacy I/O window onto the MMIO frame.
    pub fn idp_rw(&self, mut rwo: RWOp) -> IoDisposition {
        let off = rwo.offset();
        match off {
            0 => {
                let mut inner = self.inner.lock().unwrap();
                match &mut rwo {
                    RWOp::Read(ro) => {
                        let len = ro.len().min(4);
                        ro.write_bytes(&inner.idp_index.to_le_bytes()[..len]);
                    }
                    RWOp::Write(wo) => {
                        let mut bytes = inner.idp_index.to_le_bytes();
                        let len = wo.len().min(4);
                        wo.read_bytes(&mut bytes[..len]);
                        inner.idp_index = u32::from_le_bytes(bytes);
                    }
                }
                IoDisposition::Done
            }
            4 => {
                let index = {
                    let inner = self.inner.lock().unwrap();
                    inner.idp_index
                };
                assert!(index & 3 == 0, "misaligned IDP index");
                assert!((index as usize) < self.maplen);
                let _guard = self.lock.guard();
                let mut inner = self.inner.lock().unwrap();
                match &mut rwo {
                    RWOp::Read(ro) => {
                        let mut buf = vec![0u8; ro.len()];
                        self.mm_access(
                            &mut inner,
                            index as usize,
                            false,
                            &mut buf,
                        );
                        ro.write_bytes(&buf);
                    }
                    RWOp::Write(wo) => {
                        let mut buf = vec![0u8; wo.len()];
                        wo.read_bytes(&mut buf);
                        self.mm_access(
                            &mut inner,
                            index as usize,
                            true,
                            &mut buf,
                        );
                    }
                }
                IoDisposition::Done
            }
            _ => panic!("IDP access at offset {}", off),
        }
    }
}

/// Does an access of `len` bytes at `port_off` line up with the 4-byte
/// register at `eq_port_off`?  Partial overlap of an intercepted register
/// is a protocol violation the emulation cannot safely continue past.
pub(crate) fn port_eq(
    port_off: usize,
    len: usize,
    eq_port_off: usize,
) -> bool {
    if port_off == eq_port_off {
        if len == 4 {
            return true;
        }
    } else if port_off > eq_port_off {
        if port_off >= eq_port_off + 4 {
            return false;
        }
    } else if port_off + len <= eq_port_off {
        return false;
    }
    panic!(
        "AHCI port_off={:#x} len={} eq_port_off={:#x}",
        port_off, len, eq_port_off
    );
}

fn port_eq_global(offset: usize, len: usize, reg: usize) -> bool {
    if offset >= PORT_BASE {
        return false;
    }
    port_eq(offset, len, reg)
}
