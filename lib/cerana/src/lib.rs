// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ATA/AHCI para-pass-through storage subsystem for a thin hypervisor.
//!
//! The crate intercepts a guest's storage-controller register accesses
//! (legacy IDE port I/O, bus-master DMA registers, AHCI MMIO), reconstructs
//! the intended storage operation, performs it against a [`block::Backend`],
//! and reflects the result back into guest-visible registers and DMA
//! buffers.  Everything the emulation does not need to see is forwarded to
//! the physical controller through [`hw::ata::ChannelIo`] /
//! [`hw::ahci::HbaIo`].

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod block;
pub mod common;
pub mod hw;
pub mod intr_pins;
pub mod mmio;
pub mod pio;
pub mod util;
pub mod vmm;

pub use common::{GuestAddr, GuestRegion, IoDisposition};
