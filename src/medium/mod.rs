//! Byte-addressable storage media.
//!
//! A [`Medium`] is the only thing the superblock engine reads from or writes
//! to.  Every address that crosses this interface is *relative to the base
//! address*: once a user block has been detected or reserved, address 0
//! names the first byte after it.
//!
//! # End of allocation
//!
//! Each medium tracks an end-of-allocation (EOA) marker separately from its
//! physical end of file (EOF).  Reads and writes that reach past the EOA are
//! rejected as address overflows; reads past the EOF but below the EOA
//! return zeros.  The built-in media keep a single EOA shared by all memory
//! classes.

use std::io;
use bitflags::bitflags;
use serde::{Serialize, Deserialize};

mod file;
mod memory;

pub use file::FileMedium;
pub use memory::MemoryMedium;

/// The "undefined address" sentinel.
pub const ADDR_UNDEF: u64 = u64::MAX;

/// Largest address the built-in media accept.
pub const MAX_ADDR: u64 = (1 << 63) - 1;

#[inline]
pub fn addr_defined(addr: u64) -> bool {
    addr != ADDR_UNDEF
}

// ── Memory classes ───────────────────────────────────────────────────────────

/// Kind of metadata an allocation or I/O request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemClass {
    Super = 1,
    Btree = 2,
    Draw  = 3,
    Gheap = 4,
    Lheap = 5,
    Ohdr  = 6,
}

impl MemClass {
    pub const ALL: [MemClass; 6] = [
        MemClass::Super,
        MemClass::Btree,
        MemClass::Draw,
        MemClass::Gheap,
        MemClass::Lheap,
        MemClass::Ohdr,
    ];

    /// Zero-based slot of this class in per-class tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

bitflags! {
    /// Capabilities and quirks a medium reports to the engine.
    pub struct DriverFeatures: u32 {
        /// The superblock must be rewritten whenever it is loaded for writing.
        const DIRTY_SUPERBLOCK_ON_LOAD = 0x0001;
        /// The medium aggregates small metadata allocations.
        const AGGREGATE_METADATA       = 0x0002;
    }
}

/// Driver-specific data persisted alongside the superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    /// Eight-byte ASCII driver identifier, NUL padded.
    pub name: [u8; 8],
    pub data: Vec<u8>,
}

impl DriverInfo {
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        let mut id = [0u8; 8];
        let n = name.len().min(8);
        id[..n].copy_from_slice(&name.as_bytes()[..n]);
        Self { name: id, data }
    }

    /// Driver identifier with NUL padding stripped (diagnostics only).
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

// ── Medium trait ─────────────────────────────────────────────────────────────

pub trait Medium {
    /// Fill `buf` from relative address `addr`.
    fn read_at(&mut self, mem: MemClass, addr: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` at relative address `addr`.
    fn write_at(&mut self, mem: MemClass, addr: u64, buf: &[u8]) -> io::Result<()>;

    /// Physical end of file, relative to the base address.
    fn eof(&self) -> io::Result<u64>;

    /// End of allocation for `mem`, relative to the base address.
    fn eoa(&self, mem: MemClass) -> u64;

    fn set_eoa(&mut self, mem: MemClass, addr: u64) -> io::Result<()>;

    /// Absolute offset that relative address 0 maps to.
    fn base_addr(&self) -> u64;

    fn set_base_addr(&mut self, addr: u64) -> io::Result<()>;

    /// Make the physical end of file match the end of allocation.
    fn truncate(&mut self) -> io::Result<()>;

    fn max_addr(&self) -> u64 {
        MAX_ADDR
    }

    fn features(&self) -> DriverFeatures {
        DriverFeatures::empty()
    }

    /// Encoded size of this driver's superblock data; 0 when it has none.
    fn sb_size(&self) -> usize {
        0
    }

    fn sb_encode(&self) -> io::Result<Option<DriverInfo>> {
        Ok(None)
    }

    /// Accept driver data read back from an existing file.
    fn sb_decode(&mut self, _info: &DriverInfo) -> io::Result<()> {
        Ok(())
    }
}

impl<M: Medium + ?Sized> Medium for &mut M {
    fn read_at(&mut self, mem: MemClass, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(mem, addr, buf)
    }
    fn write_at(&mut self, mem: MemClass, addr: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write_at(mem, addr, buf)
    }
    fn eof(&self) -> io::Result<u64>                        { (**self).eof() }
    fn eoa(&self, mem: MemClass) -> u64                     { (**self).eoa(mem) }
    fn set_eoa(&mut self, mem: MemClass, addr: u64) -> io::Result<()> {
        (**self).set_eoa(mem, addr)
    }
    fn base_addr(&self) -> u64                              { (**self).base_addr() }
    fn set_base_addr(&mut self, addr: u64) -> io::Result<()> { (**self).set_base_addr(addr) }
    fn truncate(&mut self) -> io::Result<()>                { (**self).truncate() }
    fn max_addr(&self) -> u64                               { (**self).max_addr() }
    fn features(&self) -> DriverFeatures                    { (**self).features() }
    fn sb_size(&self) -> usize                              { (**self).sb_size() }
    fn sb_encode(&self) -> io::Result<Option<DriverInfo>>   { (**self).sb_encode() }
    fn sb_decode(&mut self, info: &DriverInfo) -> io::Result<()> { (**self).sb_decode(info) }
}

// ── Shared address bookkeeping ───────────────────────────────────────────────

/// Base address and absolute end of allocation, shared by the built-in media.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AddrSpace {
    base:    u64,
    eoa_abs: u64,
    max:     u64,
}

impl AddrSpace {
    pub(crate) fn new(max: u64) -> Self {
        Self { base: 0, eoa_abs: 0, max }
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    pub(crate) fn max(&self) -> u64 {
        self.max
    }

    pub(crate) fn eoa(&self) -> u64 {
        self.eoa_abs.saturating_sub(self.base)
    }

    pub(crate) fn eoa_abs(&self) -> u64 {
        self.eoa_abs
    }

    pub(crate) fn set_eoa(&mut self, addr: u64) -> io::Result<()> {
        let abs = addr
            .checked_add(self.base)
            .filter(|&a| a <= self.max)
            .ok_or_else(|| overflow(addr, 0))?;
        self.eoa_abs = abs;
        Ok(())
    }

    pub(crate) fn set_base(&mut self, addr: u64) -> io::Result<()> {
        if addr > self.max {
            return Err(overflow(addr, 0));
        }
        self.base = addr;
        Ok(())
    }

    /// Translate a relative request into an absolute offset, rejecting any
    /// byte at or beyond the end of allocation.
    pub(crate) fn resolve(&self, addr: u64, len: usize) -> io::Result<u64> {
        let end = addr
            .checked_add(len as u64)
            .ok_or_else(|| overflow(addr, len))?;
        if end > self.eoa() {
            return Err(overflow(addr, len));
        }
        Ok(self.base + addr)
    }
}

fn overflow(addr: u64, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("address overflow: {len} bytes at {addr:#x}"),
    )
}
