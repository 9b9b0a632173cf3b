//! File-space allocation.
//!
//! New space is carved from the end of allocation.  Freed extents go on a
//! free list and are reused first-fit; an extent freed at the end of
//! allocation shrinks it instead.

use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

use crate::medium::{MemClass, Medium};

#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("no space for {size} bytes: end of allocation would pass {max:#x}")]
    NoSpace { size: u64, max: u64 },

    #[error("zero-sized allocation")]
    ZeroSize,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SpaceError>;

#[derive(Debug, Clone)]
pub struct FileSpace {
    alignment: u64,
    threshold: u64,
    /// Free extents, address → length.
    free:      BTreeMap<u64, u64>,
}

impl FileSpace {
    /// Requests of at least `threshold` bytes start on an `alignment` boundary.
    pub fn new(alignment: u64, threshold: u64) -> Self {
        Self { alignment: alignment.max(1), threshold, free: BTreeMap::new() }
    }

    fn align(&self, addr: u64, size: u64) -> u64 {
        if self.alignment > 1 && size >= self.threshold {
            (addr + self.alignment - 1) / self.alignment * self.alignment
        } else {
            addr
        }
    }

    pub fn alloc(&mut self, medium: &mut dyn Medium, mem: MemClass, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(SpaceError::ZeroSize);
        }

        if let Some(addr) = self.take_free(size) {
            tracing::trace!(?mem, addr, size, "allocated from free list");
            return Ok(addr);
        }

        let eoa = medium.eoa(mem);
        let addr = self.align(eoa, size);
        let max = medium.max_addr();
        let end = addr
            .checked_add(size)
            .filter(|&end| end.checked_add(medium.base_addr()).map_or(false, |abs| abs <= max))
            .ok_or(SpaceError::NoSpace { size, max })?;
        medium.set_eoa(mem, end)?;
        if addr > eoa {
            self.free.insert(eoa, addr - eoa);
        }
        tracing::trace!(?mem, addr, size, "allocated at end of allocation");
        Ok(addr)
    }

    fn take_free(&mut self, size: u64) -> Option<u64> {
        let (start, len, addr) = self.free.iter().find_map(|(&start, &len)| {
            let addr = self.align(start, size);
            (addr + size <= start + len).then_some((start, len, addr))
        })?;
        self.free.remove(&start);
        if addr > start {
            self.free.insert(start, addr - start);
        }
        let end = addr + size;
        if end < start + len {
            self.free.insert(end, start + len - end);
        }
        Some(addr)
    }

    pub fn free(&mut self, medium: &mut dyn Medium, mem: MemClass, addr: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let (mut start, mut len) = (addr, size);

        // Coalesce with the extent before and the extent after.
        if let Some((&prev, &plen)) = self.free.range(..start).next_back() {
            if prev + plen == start {
                self.free.remove(&prev);
                start = prev;
                len += plen;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        if start + len == medium.eoa(mem) {
            medium.set_eoa(mem, start)?;
            tracing::trace!(?mem, addr, size, eoa = start, "end of allocation shrunk");
        } else {
            self.free.insert(start, len);
        }
        Ok(())
    }

    /// Bytes currently on the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;

    #[test]
    fn allocations_extend_end_of_allocation() {
        let mut m = MemoryMedium::new();
        let mut fs = FileSpace::new(1, 1);
        assert_eq!(fs.alloc(&mut m, MemClass::Super, 48).unwrap(), 0);
        assert_eq!(fs.alloc(&mut m, MemClass::Ohdr, 272).unwrap(), 48);
        assert_eq!(m.eoa(MemClass::Super), 320);
    }

    #[test]
    fn aligned_allocation_leaves_a_reusable_gap() {
        let mut m = MemoryMedium::new();
        let mut fs = FileSpace::new(512, 256);
        assert_eq!(fs.alloc(&mut m, MemClass::Super, 96).unwrap(), 0);
        assert_eq!(fs.alloc(&mut m, MemClass::Ohdr, 272).unwrap(), 512);
        assert_eq!(fs.free_bytes(), 512 - 96);
        // Small requests are not aligned and fit in the gap.
        assert_eq!(fs.alloc(&mut m, MemClass::Draw, 100).unwrap(), 96);
    }

    #[test]
    fn freeing_the_tail_shrinks_end_of_allocation() {
        let mut m = MemoryMedium::new();
        let mut fs = FileSpace::new(1, 1);
        fs.alloc(&mut m, MemClass::Super, 48).unwrap();
        let a = fs.alloc(&mut m, MemClass::Ohdr, 100).unwrap();
        let b = fs.alloc(&mut m, MemClass::Ohdr, 100).unwrap();

        fs.free(&mut m, MemClass::Ohdr, a, 100).unwrap();
        assert_eq!(fs.free_bytes(), 100);
        fs.free(&mut m, MemClass::Ohdr, b, 100).unwrap();
        assert_eq!(fs.free_bytes(), 0);
        assert_eq!(m.eoa(MemClass::Super), 48);
    }

    #[test]
    fn allocation_past_maximum_address_fails() {
        let mut m = MemoryMedium::new().with_max_addr(200);
        let mut fs = FileSpace::new(1, 1);
        fs.alloc(&mut m, MemClass::Super, 48).unwrap();
        assert!(matches!(
            fs.alloc(&mut m, MemClass::Ohdr, 272),
            Err(SpaceError::NoSpace { size: 272, max: 200 })
        ));
        assert_eq!(m.eoa(MemClass::Super), 48);
        assert!(matches!(fs.alloc(&mut m, MemClass::Ohdr, 0), Err(SpaceError::ZeroSize)));
    }
}
