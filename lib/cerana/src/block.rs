// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implements an interface to virtualized block devices.
//!
//! The storage back-end is an opaque sector-addressed device; the ATA/AHCI
//! emulation only ever reads or writes whole sectors by LBA through the
//! [`Backend`] trait.  Sector size is carried per-access because ATAPI
//! devices switch the same channel position between 512- and 2048-byte
//! sectors.

use std::fs::{metadata, File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Direction of a storage access, from the device's point of view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn is_write(&self) -> bool {
        matches!(self, Direction::Write)
    }
}

/// When a backend does not dictate one, sectors default to 512 bytes.
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// ATAPI (packet) devices address 2048-byte sectors.
pub const ATAPI_SECTOR_SIZE: usize = 2048;

/// Metadata regarding a virtualized block device.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceInfo {
    /// Size (in bytes) per sector
    pub block_size: u32,
    /// Device size in sectors (see above)
    pub total_size: u64,
    /// Is the device read-only
    pub read_only: bool,
}

/// Sector-addressed storage back-end.
///
/// `buf.len()` must be a multiple of `sector_size`; the sector count of the
/// access is implied by the buffer length.
pub trait Backend: Send + Sync + 'static {
    fn info(&self) -> DeviceInfo;
    fn read(&self, lba: u64, sector_size: usize, buf: &mut [u8])
        -> Result<()>;
    fn write(&self, lba: u64, sector_size: usize, buf: &[u8]) -> Result<()>;
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn check_access(
    info: &DeviceInfo,
    lba: u64,
    sector_size: usize,
    len: usize,
) -> Result<(usize, usize)> {
    if sector_size == 0 || len % sector_size != 0 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "buffer not sector-sized",
        ));
    }
    let dev_bytes = info.total_size * info.block_size as u64;
    let start = lba
        .checked_mul(sector_size as u64)
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "lba overflow"))?;
    let end = start.checked_add(len as u64).ok_or_else(|| {
        Error::new(ErrorKind::InvalidInput, "length overflow")
    })?;
    if end > dev_bytes {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "access beyond end of device",
        ));
    }
    Ok((start as usize, end as usize))
}

/// A block backend holding its contents in memory; the primary test
/// backend.
pub struct InMemoryBackend {
    bytes: Mutex<Vec<u8>>,
    info: DeviceInfo,
}

impl InMemoryBackend {
    pub fn create(bytes: Vec<u8>, block_size: u32) -> Result<Arc<Self>> {
        let len = bytes.len();
        if len == 0 {
            return Err(Error::new(ErrorKind::Other, "size cannot be 0"));
        } else if (len % block_size as usize) != 0 {
            return Err(Error::new(
                ErrorKind::Other,
                format!(
                    "size {} not multiple of block size {}!",
                    len, block_size,
                ),
            ));
        }

        Ok(Arc::new(Self {
            bytes: Mutex::new(bytes),
            info: DeviceInfo {
                block_size,
                total_size: len as u64 / u64::from(block_size),
                read_only: false,
            },
        }))
    }
}

impl Backend for InMemoryBackend {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn read(
        &self,
        lba: u64,
        sector_size: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let (start, end) =
            check_access(&self.info, lba, sector_size, buf.len())?;
        let bytes = self.bytes.lock().unwrap();
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write(&self, lba: u64, sector_size: usize, buf: &[u8]) -> Result<()> {
        let (start, end) =
            check_access(&self.info, lba, sector_size, buf.len())?;
        let mut bytes = self.bytes.lock().unwrap();
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }
}

/// A block backend over a host file.
pub struct FileBackend {
    fp: File,
    info: DeviceInfo,
}

impl FileBackend {
    pub fn create(
        path: impl AsRef<Path>,
        readonly: bool,
    ) -> Result<Arc<Self>> {
        let p: &Path = path.as_ref();

        let meta = metadata(p)?;
        let read_only = readonly || meta.permissions().readonly();

        let fp = OpenOptions::new().read(true).write(!read_only).open(p)?;
        let len = fp.metadata()?.len();
        if len % DEFAULT_SECTOR_SIZE as u64 != 0 {
            return Err(Error::new(
                ErrorKind::Other,
                "file length not sector-aligned",
            ));
        }

        Ok(Arc::new(Self {
            fp,
            info: DeviceInfo {
                block_size: DEFAULT_SECTOR_SIZE as u32,
                total_size: len / DEFAULT_SECTOR_SIZE as u64,
                read_only,
            },
        }))
    }
}

impl Backend for FileBackend {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn read(
        &self,
        lba: u64,
        sector_size: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        let (start, _) =
            check_access(&self.info, lba, sector_size, buf.len())?;
        self.fp.read_exact_at(buf, start as u64)
    }

    fn write(&self, lba: u64, sector_size: usize, buf: &[u8]) -> Result<()> {
        if self.info.read_only {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "backend is read-only",
            ));
        }
        let (start, _) =
            check_access(&self.info, lba, sector_size, buf.len())?;
        self.fp.write_all_at(buf, start as u64)
    }

    fn flush(&self) -> Result<()> {
        self.fp.sync_data()
    }
}

/// Result of a [SecurityPolicy] check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Permission {
    Allow,
    Deny,
}

/// Per-device access-control policy consulted before any guest-initiated
/// sector access is carried out.
pub trait SecurityPolicy: Send + Sync + 'static {
    fn check_lba(&self, rw: Direction, lba: u64, count: u32) -> Permission;
}

/// The default policy: every access is permitted.
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn check_lba(&self, _rw: Direction, _lba: u64, _count: u32) -> Permission {
        Permission::Allow
    }
}
