// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module for managing guest memory mappings and hypervisor DMA memory.
//!
//! Guest physical memory is backed by an anonymous `mmap(2)` arena.  All
//! access goes through [MemCtx] / [SubMapping]: a mapping guard is created
//! for exactly one copy operation and dropped afterwards, so no component
//! ever retains a long-lived pointer into guest memory.

use std::collections::BTreeMap;
use std::io::{Error, ErrorKind, Result};
use std::marker::PhantomData;
use std::ptr::{copy_nonoverlapping, NonNull};
use std::sync::{Arc, Mutex};

use crate::common::{GuestAddr, GuestRegion, PAGE_SIZE};

use zerocopy::{FromBytes, Immutable, IntoBytes};

bitflags! {
    /// Bitflags representing memory protections.
    #[derive(Debug, Copy, Clone)]
    pub struct Prot: u8 {
        const NONE = 0;
        const READ = 0b01;
        const WRITE = 0b10;
        const RW = 0b11;
    }
}

struct RawMap {
    ptr: NonNull<u8>,
    len: usize,
}

// The raw mapping is only ever accessed through bounds-checked copy
// operations below.
unsafe impl Send for RawMap {}
unsafe impl Sync for RawMap {}

impl RawMap {
    fn new(len: usize) -> Result<Self> {
        assert!(len != 0 && len % PAGE_SIZE == 0, "len must be page-aligned");
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(Self { ptr: NonNull::new(ptr as *mut u8).unwrap(), len })
    }

    /// Copy `buf.len()` bytes out of the mapping at `off`.
    fn read_into(&self, off: usize, buf: &mut [u8]) -> Result<()> {
        if off.checked_add(buf.len()).map(|end| end > self.len).unwrap_or(true)
        {
            return Err(Error::new(ErrorKind::InvalidInput, "out of range"));
        }
        unsafe {
            copy_nonoverlapping(
                self.ptr.as_ptr().add(off),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy `buf` into the mapping at `off`.
    fn write_from(&self, off: usize, buf: &[u8]) -> Result<()> {
        if off.checked_add(buf.len()).map(|end| end > self.len).unwrap_or(true)
        {
            return Err(Error::new(ErrorKind::InvalidInput, "out of range"));
        }
        unsafe {
            copy_nonoverlapping(
                buf.as_ptr(),
                self.ptr.as_ptr().add(off),
                buf.len(),
            );
        }
        Ok(())
    }
}

impl Drop for RawMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

/// The guest physical address space, backed by an anonymous mapping which
/// stands in for guest DRAM.
pub struct PhysMap {
    map: Arc<RawMap>,
}

impl PhysMap {
    pub fn new(size: usize) -> Result<Self> {
        Ok(Self { map: Arc::new(RawMap::new(size)?) })
    }

    pub fn len(&self) -> usize {
        self.map.len
    }
    pub fn is_empty(&self) -> bool {
        self.map.len == 0
    }

    /// Acquire a [MemCtx] through which guest memory can be accessed.
    pub fn memctx(&self) -> MemCtx {
        MemCtx { map: self.map.clone() }
    }
}

/// Short-lived handle for guest memory access.
#[derive(Clone)]
pub struct MemCtx {
    map: Arc<RawMap>,
}

impl MemCtx {
    /// Reads a generic value from a specified guest address.
    pub fn read<T: FromBytes>(&self, addr: GuestAddr) -> Option<T> {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.map.read_into(addr.0 as usize, &mut buf).ok()?;
        T::read_from_bytes(&buf).ok()
    }

    /// Writes a generic value to a specified guest address.
    pub fn write<T: IntoBytes + Immutable>(
        &self,
        addr: GuestAddr,
        val: &T,
    ) -> bool {
        self.map.write_from(addr.0 as usize, val.as_bytes()).is_ok()
    }

    pub fn read_into(&self, addr: GuestAddr, buf: &mut [u8]) -> bool {
        self.map.read_into(addr.0 as usize, buf).is_ok()
    }

    pub fn write_from(&self, addr: GuestAddr, buf: &[u8]) -> bool {
        self.map.write_from(addr.0 as usize, buf).is_ok()
    }

    /// Like `read_region`, but only valid for reads from the guest.
    pub fn readable_region(
        &self,
        region: &GuestRegion,
    ) -> Option<SubMapping<'_>> {
        self.region(region, Prot::READ)
    }

    /// Like `read_region`, but only valid for writes to the guest.
    pub fn writable_region(
        &self,
        region: &GuestRegion,
    ) -> Option<SubMapping<'_>> {
        self.region(region, Prot::WRITE)
    }

    fn region(
        &self,
        region: &GuestRegion,
        prot: Prot,
    ) -> Option<SubMapping<'_>> {
        let GuestRegion(addr, len) = *region;
        let end = (addr.0 as usize).checked_add(len)?;
        if end > self.map.len {
            return None;
        }
        Some(SubMapping {
            map: &self.map,
            off: addr.0 as usize,
            len,
            prot,
            _phantom: PhantomData,
        })
    }
}

/// A bounds-checked window into guest memory, valid for one copy operation
/// sequence and no longer than the borrow of its [MemCtx].
pub struct SubMapping<'a> {
    map: &'a RawMap,
    off: usize,
    len: usize,
    prot: Prot,
    _phantom: PhantomData<&'a ()>,
}

impl<'a> SubMapping<'a> {
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Constrain this mapping to a subregion.
    pub fn subregion(
        &self,
        offset: usize,
        length: usize,
    ) -> Option<SubMapping<'a>> {
        let end = offset.checked_add(length)?;
        if end > self.len {
            return None;
        }
        Some(SubMapping {
            map: self.map,
            off: self.off + offset,
            len: length,
            prot: self.prot,
            _phantom: PhantomData,
        })
    }

    /// Copy bytes out of the guest region.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.prot.contains(Prot::READ) {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "mapping not readable",
            ));
        }
        let to_copy = usize::min(buf.len(), self.len);
        self.map.read_into(self.off, &mut buf[..to_copy])?;
        Ok(to_copy)
    }

    /// Copy bytes into the guest region.
    pub fn write_bytes(&self, buf: &[u8]) -> Result<usize> {
        if !self.prot.contains(Prot::WRITE) {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "mapping not writable",
            ));
        }
        let to_copy = usize::min(buf.len(), self.len);
        self.map.write_from(self.off, &buf[..to_copy])?;
        Ok(to_copy)
    }
}

/// Synthetic physical base address of the hypervisor DMA arena.  Chosen
/// below 4 GiB (legacy bus-master PRD entries carry 32-bit base addresses)
/// and above any guest DRAM this crate is asked to model.
pub const DMA_PHYS_BASE: u64 = 0xC000_0000;

/// Alignment required of the bus-master shadow buffer.
pub const DMA_BUF_ALIGN: usize = 0x1_0000;

struct ArenaInner {
    map: RawMap,
    phys_base: u64,
    // Free ranges by offset.
    free: Mutex<BTreeMap<usize, usize>>,
}

/// Hypervisor-owned DMA-safe memory, used for shadow PRD tables, shadow
/// bus-master buffers, and AHCI shadow command structures.  The physical
/// controller is only ever handed addresses inside this arena, never guest
/// physical addresses.
pub struct DmaArena {
    inner: Arc<ArenaInner>,
}

impl DmaArena {
    pub fn new(len: usize) -> Result<Self> {
        let map = RawMap::new(len)?;
        let mut free = BTreeMap::new();
        free.insert(0, len);
        Ok(Self {
            inner: Arc::new(ArenaInner {
                map,
                phys_base: DMA_PHYS_BASE,
                free: Mutex::new(free),
            }),
        })
    }

    pub fn phys_base(&self) -> u64 {
        self.inner.phys_base
    }
    pub fn contains(&self, phys: u64, len: usize) -> bool {
        phys >= self.inner.phys_base
            && (phys - self.inner.phys_base) as usize + len
                <= self.inner.map.len
    }

    /// Allocate `len` bytes aligned to `align`.
    ///
    /// Exhaustion is a hypervisor configuration error, not a recoverable
    /// guest-triggerable condition.
    pub fn alloc(&self, len: usize, align: usize) -> DmaBuffer {
        assert!(align.is_power_of_two());
        let len = crate::common::round_up_p2(len.max(1), 8);
        let mut free = self.inner.free.lock().unwrap();
        let fit = free.iter().find_map(|(&off, &flen)| {
            let aligned = crate::common::round_up_p2(off, align);
            let pad = aligned - off;
            if flen >= pad + len {
                Some((off, flen, aligned, pad))
            } else {
                None
            }
        });
        let Some((off, flen, aligned, pad)) = fit else {
            panic!("DMA arena exhausted (len={}, align={})", len, align);
        };
        free.remove(&off);
        if pad > 0 {
            free.insert(off, pad);
        }
        if flen > pad + len {
            free.insert(aligned + len, flen - pad - len);
        }
        DmaBuffer {
            arena: self.inner.clone(),
            off: aligned,
            len,
            phys: self.inner.phys_base + aligned as u64,
        }
    }

    /// Raw access by synthetic physical address, for the physical-hardware
    /// side (the device DMAs into/out of the arena).
    pub fn read_phys(&self, phys: u64, buf: &mut [u8]) -> Result<()> {
        assert!(self.contains(phys, buf.len()), "bad DMA arena address");
        self.inner.map.read_into((phys - self.inner.phys_base) as usize, buf)
    }

    pub fn write_phys(&self, phys: u64, buf: &[u8]) -> Result<()> {
        assert!(self.contains(phys, buf.len()), "bad DMA arena address");
        self.inner.map.write_from((phys - self.inner.phys_base) as usize, buf)
    }
}

impl Clone for DmaArena {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

/// An exclusively-owned allocation from a [DmaArena].  Freed (and returned
/// to the arena) on drop.
pub struct DmaBuffer {
    arena: Arc<ArenaInner>,
    off: usize,
    len: usize,
    phys: u64,
}

impl DmaBuffer {
    pub fn phys(&self) -> u64 {
        self.phys
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn copy_in(&self, off: usize, data: &[u8]) {
        assert!(off + data.len() <= self.len);
        self.arena.map.write_from(self.off + off, data).unwrap();
    }

    pub fn copy_out(&self, off: usize, data: &mut [u8]) {
        assert!(off + data.len() <= self.len);
        self.arena.map.read_into(self.off + off, data).unwrap();
    }

    pub fn write_obj<T: IntoBytes + Immutable>(&self, off: usize, val: &T) {
        self.copy_in(off, val.as_bytes());
    }

    pub fn read_obj<T: FromBytes>(&self, off: usize) -> T {
        let mut buf = vec![0u8; std::mem::size_of::<T>()];
        self.copy_out(off, &mut buf);
        T::read_from_bytes(&buf).unwrap()
    }

    pub fn fill(&self, val: u8) {
        self.arena.map.write_from(self.off, &vec![val; self.len]).unwrap();
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let mut free = self.arena.free.lock().unwrap();
        let mut off = self.off;
        let mut len = self.len;
        // Coalesce with the next free range.
        if let Some(&next_len) = free.get(&(off + len)) {
            free.remove(&(off + len));
            len += next_len;
        }
        // Coalesce with the previous free range.
        let prev = free.range(..off).next_back().map(|(&a, &b)| (a, b));
        if let Some((prev_off, prev_len)) = prev {
            if prev_off + prev_len == off {
                free.remove(&prev_off);
                off = prev_off;
                len += prev_len;
            }
        }
        free.insert(off, len);
    }
}
