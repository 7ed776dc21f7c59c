// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI driver glue: wires the channel and AHCI emulation into the
//! intercept buses and keeps the hooks in sync with the guest's BAR and
//! addressing-mode programming.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use slog::info;

use crate::common::{IoDisposition, ReadOp, RWOp, WriteOp};
use crate::hw::ahci::AhciData;
use crate::hw::ata::bits::{BM_PORT_COUNT, BM_SECONDARY_OFFSET, CMD_PORT_COUNT};
use crate::hw::ata::{AtaHost, ChannelIo, RegBlock};
use crate::hw::pci::bits::*;
use crate::hw::pci::{BarKind, CfgSpace};
use crate::mmio::MmioBus;
use crate::pio::{PioBus, PortIo};

/// Pass-through adapter: replays a guest port access against the physical
/// channel registers.
struct ChanPassthru {
    io: Arc<dyn ChannelIo>,
    block: RegBlock,
}

impl PortIo for ChanPassthru {
    fn io(&self, _port: u16, rwo: RWOp) {
        let reg = rwo.offset();
        match rwo {
            RWOp::Read(ro) => match ro.len() {
                1 => ro.write_u8(self.io.read8(self.block, reg)),
                2 => ro.write_u16(self.io.read16(self.block, reg)),
                4 => {
                    if self.block == RegBlock::BusMaster {
                        ro.write_u32(self.io.read32(self.block, reg));
                    } else {
                        // A dword Data register read is two word reads.
                        let low = self.io.read16(self.block, reg) as u32;
                        let high = self.io.read16(self.block, reg) as u32;
                        ro.write_u32((high << 16) | low);
                    }
                }
                _ => ro.fill(0xff),
            },
            RWOp::Write(wo) => match wo.len() {
                1 => self.io.write8(self.block, reg, wo.read_u8()),
                2 => self.io.write16(self.block, reg, wo.read_u16()),
                4 => {
                    if self.block == RegBlock::BusMaster {
                        self.io.write32(self.block, reg, wo.read_u32());
                    } else {
                        let val = wo.read_u32();
                        self.io.write16(self.block, reg, val as u16);
                        self.io.write16(
                            self.block,
                            reg,
                            (val >> 16) as u16,
                        );
                    }
                }
                _ => {}
            },
        }
    }
}

#[derive(Default)]
struct Installed {
    cmd: [Option<u16>; 2],
    ctl: [Option<u16>; 2],
    bm: [Option<u16>; 2],
    mmio: Option<usize>,
    idp: Option<u16>,
}

/// Location of the SATA Index-Data Pair window, from the function's SATA
/// capability.
#[derive(Copy, Clone, Debug)]
pub struct IdpLocation {
    pub bar: usize,
    pub offset: usize,
}

/// A PCI IDE/SATA function under para-pass-through control.
pub struct PciAtaController {
    log: slog::Logger,
    pub host: Arc<AtaHost>,
    pio: Arc<PioBus>,
    mmio: Arc<MmioBus>,
    pub cfg: Mutex<CfgSpace>,
    ahci: Option<Arc<AhciData>>,
    ahci_mode: AtomicBool,
    idp: Option<IdpLocation>,
    installed: Mutex<Installed>,
}

impl PciAtaController {
    pub fn new(
        log: slog::Logger,
        host: Arc<AtaHost>,
        pio: Arc<PioBus>,
        mmio: Arc<MmioBus>,
        cfg: CfgSpace,
        ahci: Option<Arc<AhciData>>,
        idp: Option<IdpLocation>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            log,
            host,
            pio,
            mmio,
            cfg: Mutex::new(cfg),
            ahci,
            ahci_mode: AtomicBool::new(false),
            idp,
            installed: Mutex::new(Installed::default()),
        });

        // Initialize primary and secondary channels, the bus master, and
        // (for SATA functions) the MMIO/IDP hooks.
        for ch in 0..2 {
            this.attach_cmdblk(ch);
            this.attach_ctlblk(ch);
        }
        this.attach_bm();
        this.attach_mmio();
        this.attach_idp();
        if let Some(ad) = this.ahci.as_ref() {
            if ad.enabled() {
                this.set_ahci_mode(true);
            }
        }
        this
    }

    /// Toggle which emulation is authoritative for this function.
    pub fn set_ahci_mode(&self, enabled: bool) {
        info!(self.log, "addressing mode switch"; "ahci" => enabled);
        self.ahci_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn ahci_mode(&self) -> bool {
        self.ahci_mode.load(Ordering::SeqCst)
    }

    fn cmdblk_base(&self, ch: usize) -> u16 {
        let cfg = self.cfg.lock().unwrap();
        let compat =
            if ch == 0 { PORT_ATA0_CMD } else { PORT_ATA1_CMD };
        let native = (cfg.progif() >> (ch * 2)) & 1 != 0;
        if native {
            cfg.bar_info(ch * 2)
                .map(|bar| bar.base as u16)
                .unwrap_or(compat)
        } else {
            compat
        }
    }

    fn ctlblk_base(&self, ch: usize) -> u16 {
        let cfg = self.cfg.lock().unwrap();
        let compat =
            if ch == 0 { PORT_ATA0_CTL } else { PORT_ATA1_CTL };
        let native = (cfg.progif() >> (ch * 2)) & 1 != 0;
        if native {
            // The control block BAR points two bytes below the
            // alternate-status register.
            cfg.bar_info(ch * 2 + 1)
                .map(|bar| bar.base as u16 + 2)
                .unwrap_or(compat)
        } else {
            compat
        }
    }

    fn attach_cmdblk(&self, ch: usize) {
        let base = self.cmdblk_base(ch);
        let mut installed = self.installed.lock().unwrap();
        if let Some(old) = installed.cmd[ch].take() {
            let _ = self.pio.unregister(old);
        }
        let channel = self.host.channels[ch].clone();
        let passthru = Arc::new(ChanPassthru {
            io: channel.io.clone(),
            block: RegBlock::Cmd,
        });
        self.pio
            .register(
                base,
                CMD_PORT_COUNT as u16,
                Arc::new(move |_base, rwo| channel.cmdblk_rw(rwo)),
                Some(passthru),
            )
            .expect("command block registration");
        installed.cmd[ch] = Some(base);
    }

    fn attach_ctlblk(&self, ch: usize) {
        let base = self.ctlblk_base(ch);
        let mut installed = self.installed.lock().unwrap();
        if let Some(old) = installed.ctl[ch].take() {
            let _ = self.pio.unregister(old);
        }
        let channel = self.host.channels[ch].clone();
        let passthru = Arc::new(ChanPassthru {
            io: channel.io.clone(),
            block: RegBlock::Ctl,
        });
        self.pio
            .register(
                base,
                1,
                Arc::new(move |_base, rwo| channel.ctlblk_rw(rwo)),
                Some(passthru),
            )
            .expect("control block registration");
        installed.ctl[ch] = Some(base);
    }

    fn attach_bm(&self) {
        let bar = {
            let cfg = self.cfg.lock().unwrap();
            cfg.bar_info(4)
        };
        let Some(bar) = bar else {
            return;
        };
        let mut installed = self.installed.lock().unwrap();
        for ch in 0..2 {
            if let Some(old) = installed.bm[ch].take() {
                let _ = self.pio.unregister(old);
            }
            let base =
                bar.base as u16 + ch as u16 * BM_SECONDARY_OFFSET;
            let channel = self.host.channels[ch].clone();
            let passthru = Arc::new(ChanPassthru {
                io: channel.io.clone(),
                block: RegBlock::BusMaster,
            });
            self.pio
                .register(
                    base,
                    BM_PORT_COUNT as u16,
                    Arc::new(move |_base, rwo| channel.bm_rw(rwo)),
                    Some(passthru),
                )
                .expect("bus master registration");
            installed.bm[ch] = Some(base);
        }
    }

    fn attach_mmio(&self) {
        let Some(ad) = self.ahci.as_ref() else {
            return;
        };
        let bar = {
            let cfg = self.cfg.lock().unwrap();
            cfg.bar_info(5)
        };
        let Some(bar) = bar else {
            return;
        };
        if bar.kind != BarKind::Mem || bar.base == 0 {
            return;
        }
        let mut installed = self.installed.lock().unwrap();
        if let Some(old) = installed.mmio.take() {
            let _ = self.mmio.unregister(old);
        }
        let ad = ad.clone();
        self.mmio
            .register(
                bar.base as usize,
                bar.len as usize,
                Arc::new(move |_base, rwo| ad.mmio_rw(rwo)),
            )
            .expect("AHCI MMIO registration");
        installed.mmio = Some(bar.base as usize);
    }

    fn attach_idp(&self) {
        let (Some(ad), Some(idp)) = (self.ahci.as_ref(), self.idp) else {
            return;
        };
        let bar = {
            let cfg = self.cfg.lock().unwrap();
            cfg.bar_info(idp.bar)
        };
        let Some(bar) = bar else {
            return;
        };
        if bar.kind != BarKind::Io
            || (bar.len as usize) < idp.offset + 8
        {
            return;
        }
        let mut installed = self.installed.lock().unwrap();
        if let Some(old) = installed.idp.take() {
            let _ = self.pio.unregister(old);
        }
        let base = bar.base as u16 + idp.offset as u16;
        let ad = ad.clone();
        self.pio
            .register(
                base,
                8,
                Arc::new(move |_base, rwo| ad.idp_rw(rwo)),
                None,
            )
            .expect("IDP registration");
        installed.idp = Some(base);
    }

    /// Configuration-space read intercept.
    pub fn config_read(&self, ro: &mut ReadOp) -> IoDisposition {
        let offset = ro.offset();
        let cfg = self.cfg.lock().unwrap();
        let mut buf = vec![0u8; ro.len()];
        cfg.read(offset, &mut buf);
        ro.write_bytes(&buf);
        IoDisposition::Done
    }

    /// Configuration-space write intercept.  The channels stay locked
    /// across the update so a concurrently running register access cannot
    /// observe a half-moved handler (time-of-check vs. time-of-use).
    pub fn config_write(&self, wo: &mut WriteOp) -> IoDisposition {
        let offset = wo.offset();
        let mut buf = vec![0u8; wo.len()];
        wo.read_bytes(&mut buf);

        let _guard0 = self.host.channels[0].lock.guard();
        let _guard1 = self.host.channels[1].lock.guard();

        let modified_bar = {
            let mut cfg = self.cfg.lock().unwrap();
            let bar = cfg.modified_bar(offset, buf.len());
            cfg.write(offset, &buf);
            bar
        };

        // The addressing mode may have switched between compatibility and
        // native, moving the command/control blocks.
        if (offset & !3) == 0x08 {
            for ch in 0..2 {
                self.attach_cmdblk(ch);
                self.attach_ctlblk(ch);
            }
        }
        match modified_bar {
            Some(0) => self.attach_cmdblk(0),
            Some(1) => self.attach_ctlblk(0),
            Some(2) => self.attach_cmdblk(1),
            Some(3) => self.attach_ctlblk(1),
            Some(4) => self.attach_bm(),
            Some(5) => self.attach_mmio(),
            _ => {}
        }
        if let Some(idp) = self.idp {
            if modified_bar == Some(idp.bar) {
                self.attach_idp();
            }
        }
        IoDisposition::Done
    }
}
