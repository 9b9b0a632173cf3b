//! A small metadata cache keyed by file address.
//!
//! Entries are loaded through [`CacheEntry::load`] when first protected and
//! written back through [`CacheEntry::flush`].  Callers hold typed tokens:
//! a [`ProtectedEntry`] while an entry is being read or modified, and a
//! [`PinnedEntry`] for as long as the entry must stay resident.  Neither
//! token is `Clone`, so an entry can only be unprotected or unpinned once.

use std::collections::BTreeMap;
use bitflags::bitflags;
use thiserror::Error;

use crate::medium::Medium;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Superblock,
}

/// Why an entry is being protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
}

bitflags! {
    pub struct InsertFlags: u32 {
        const PIN                = 0x01;
        /// Write this entry after every other entry during a flush.
        const FLUSH_LAST         = 0x02;
        /// In a parallel file, this entry is flushed by all ranks together.
        const FLUSH_COLLECTIVELY = 0x04;
    }
}

bitflags! {
    pub struct UnprotectFlags: u32 {
        const DIRTIED = 0x01;
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry already cached at {addr:#x}")]
    Duplicate { addr: u64 },

    #[error("no cached entry at {addr:#x}")]
    Missing { addr: u64 },

    #[error("entry at {addr:#x} is already protected")]
    AlreadyProtected { addr: u64 },

    #[error("entry at {addr:#x} is not protected")]
    NotProtected { addr: u64 },

    #[error("entry at {addr:#x} is already pinned")]
    AlreadyPinned { addr: u64 },

    #[error("entry at {addr:#x} is not pinned")]
    NotPinned { addr: u64 },

    #[error("cannot expunge pinned entry at {addr:#x}")]
    PinnedExpunge { addr: u64 },

    #[error("cannot expunge or flush protected entry at {addr:#x}")]
    ProtectedExpunge { addr: u64 },

    #[error("cannot dirty entry at {addr:#x} in a read-only cache")]
    ReadOnlyDirty { addr: u64 },
}

/// Outcome of loading an entry from the medium.
#[derive(Debug)]
pub struct Loaded<E> {
    pub entry:   E,
    /// The load changed the entry, so it must be written back.
    pub dirtied: bool,
}

/// A kind of metadata the cache can hold.
pub trait CacheEntry: Sized {
    type Error: From<CacheError>;

    const TYPE: EntryType;

    fn load(medium: &mut dyn Medium, addr: u64, intent: Intent) -> Result<Loaded<Self>, Self::Error>;

    fn flush(&mut self, medium: &mut dyn Medium, addr: u64) -> Result<(), Self::Error>;
}

/// Token for an entry between protect and unprotect.
#[must_use = "a protected entry must be unprotected"]
#[derive(Debug)]
pub struct ProtectedEntry {
    addr: u64,
}

impl ProtectedEntry {
    pub fn addr(&self) -> u64 {
        self.addr
    }
}

/// Token for a resident entry.  Released with [`MetadataCache::unpin`].
#[must_use = "a pinned entry must be unpinned"]
#[derive(Debug, PartialEq, Eq)]
pub struct PinnedEntry {
    addr: u64,
}

impl PinnedEntry {
    pub fn addr(&self) -> u64 {
        self.addr
    }
}

#[derive(Debug)]
struct Slot<E> {
    entry:     E,
    flags:     InsertFlags,
    dirty:     bool,
    pinned:    bool,
    protected: bool,
}

#[derive(Debug)]
pub struct MetadataCache<E> {
    slots:    BTreeMap<u64, Slot<E>>,
    writable: bool,
}

impl<E: CacheEntry> MetadataCache<E> {
    pub fn new(writable: bool) -> Self {
        Self { slots: BTreeMap::new(), writable }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Load (if needed) and protect the entry at `addr`.
    pub fn protect(
        &mut self,
        medium: &mut dyn Medium,
        addr: u64,
        intent: Intent,
    ) -> Result<ProtectedEntry, E::Error> {
        if let Some(slot) = self.slots.get_mut(&addr) {
            if slot.protected {
                return Err(CacheError::AlreadyProtected { addr }.into());
            }
            slot.protected = true;
            return Ok(ProtectedEntry { addr });
        }

        let loaded = E::load(medium, addr, intent)?;
        let dirty = loaded.dirtied && intent == Intent::Write && self.writable;
        tracing::debug!(ty = ?E::TYPE, addr, dirty, "cache entry loaded");
        self.slots.insert(addr, Slot {
            entry:     loaded.entry,
            flags:     InsertFlags::empty(),
            dirty,
            pinned:    false,
            protected: true,
        });
        Ok(ProtectedEntry { addr })
    }

    pub fn protected_mut(&mut self, token: &ProtectedEntry) -> Result<&mut E, CacheError> {
        let slot = self.slot_mut(token.addr)?;
        if !slot.protected {
            return Err(CacheError::NotProtected { addr: token.addr });
        }
        Ok(&mut slot.entry)
    }

    pub fn pin_protected(&mut self, token: &ProtectedEntry) -> Result<PinnedEntry, CacheError> {
        let slot = self.slot_mut(token.addr)?;
        if !slot.protected {
            return Err(CacheError::NotProtected { addr: token.addr });
        }
        if slot.pinned {
            return Err(CacheError::AlreadyPinned { addr: token.addr });
        }
        slot.pinned = true;
        Ok(PinnedEntry { addr: token.addr })
    }

    pub fn unprotect(&mut self, token: ProtectedEntry, flags: UnprotectFlags) -> Result<(), CacheError> {
        let writable = self.writable;
        let slot = self.slot_mut(token.addr)?;
        if !slot.protected {
            return Err(CacheError::NotProtected { addr: token.addr });
        }
        slot.protected = false;
        if flags.contains(UnprotectFlags::DIRTIED) {
            if !writable {
                return Err(CacheError::ReadOnlyDirty { addr: token.addr });
            }
            slot.dirty = true;
        }
        Ok(())
    }

    /// Add a new, dirty entry.  Returns its pin when `flags` has `PIN`.
    pub fn insert(&mut self, addr: u64, entry: E, flags: InsertFlags) -> Result<Option<PinnedEntry>, CacheError> {
        if self.slots.contains_key(&addr) {
            return Err(CacheError::Duplicate { addr });
        }
        let pinned = flags.contains(InsertFlags::PIN);
        self.slots.insert(addr, Slot { entry, flags, dirty: true, pinned, protected: false });
        Ok(pinned.then(|| PinnedEntry { addr }))
    }

    pub fn mark_dirty(&mut self, pin: &PinnedEntry) -> Result<(), CacheError> {
        if !self.writable {
            return Err(CacheError::ReadOnlyDirty { addr: pin.addr });
        }
        self.slot_mut(pin.addr)?.dirty = true;
        Ok(())
    }

    pub fn get(&self, pin: &PinnedEntry) -> Result<&E, CacheError> {
        self.slots
            .get(&pin.addr)
            .map(|s| &s.entry)
            .ok_or(CacheError::Missing { addr: pin.addr })
    }

    pub fn get_mut(&mut self, pin: &PinnedEntry) -> Result<&mut E, CacheError> {
        Ok(&mut self.slot_mut(pin.addr)?.entry)
    }

    pub fn unpin(&mut self, pin: PinnedEntry) -> Result<(), CacheError> {
        let slot = self.slot_mut(pin.addr)?;
        if !slot.pinned {
            return Err(CacheError::NotPinned { addr: pin.addr });
        }
        slot.pinned = false;
        Ok(())
    }

    /// Drop the entry at `addr` without writing it back.
    pub fn expunge(&mut self, addr: u64) -> Result<Option<E>, CacheError> {
        match self.slots.get(&addr) {
            None => return Ok(None),
            Some(s) if s.pinned => return Err(CacheError::PinnedExpunge { addr }),
            Some(s) if s.protected => return Err(CacheError::ProtectedExpunge { addr }),
            Some(_) => {}
        }
        Ok(self.slots.remove(&addr).map(|s| s.entry))
    }

    /// Write every dirty entry back; `FLUSH_LAST` entries go after the rest.
    pub fn flush(&mut self, medium: &mut dyn Medium) -> Result<(), E::Error> {
        for last in [false, true] {
            for (&addr, slot) in self.slots.iter_mut() {
                if slot.flags.contains(InsertFlags::FLUSH_LAST) != last || !slot.dirty {
                    continue;
                }
                if slot.protected {
                    return Err(CacheError::ProtectedExpunge { addr }.into());
                }
                slot.entry.flush(medium, addr)?;
                slot.dirty = false;
                tracing::trace!(ty = ?E::TYPE, addr, "cache entry flushed");
            }
        }
        Ok(())
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.slots.contains_key(&addr)
    }

    pub fn is_dirty(&self, addr: u64) -> bool {
        self.slots.get(&addr).map_or(false, |s| s.dirty)
    }

    pub fn is_pinned(&self, addr: u64) -> bool {
        self.slots.get(&addr).map_or(false, |s| s.pinned)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot_mut(&mut self, addr: u64) -> Result<&mut Slot<E>, CacheError> {
        self.slots.get_mut(&addr).ok_or(CacheError::Missing { addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use crate::medium::{MemClass, MemoryMedium};

    /// One byte stored at its address; loading with write intent bumps it.
    #[derive(Debug)]
    struct Counter(u8);

    impl CacheEntry for Counter {
        type Error = io::Error;
        const TYPE: EntryType = EntryType::Superblock;

        fn load(medium: &mut dyn Medium, addr: u64, intent: Intent) -> io::Result<Loaded<Self>> {
            let mut b = [0u8; 1];
            medium.read_at(MemClass::Super, addr, &mut b)?;
            let dirtied = intent == Intent::Write;
            Ok(Loaded { entry: Counter(b[0] + dirtied as u8), dirtied })
        }

        fn flush(&mut self, medium: &mut dyn Medium, addr: u64) -> io::Result<()> {
            medium.write_at(MemClass::Super, addr, &[self.0])
        }
    }

    impl From<CacheError> for io::Error {
        fn from(e: CacheError) -> Self {
            io::Error::new(io::ErrorKind::Other, e)
        }
    }

    fn medium() -> MemoryMedium {
        let mut m = MemoryMedium::from_bytes(vec![10, 20, 30, 40]);
        m.set_eoa(MemClass::Super, 4).unwrap();
        m
    }

    #[test]
    fn protect_pin_unprotect_cycle() {
        let mut m = medium();
        let mut cache: MetadataCache<Counter> = MetadataCache::new(true);

        let token = cache.protect(&mut m, 1, Intent::Write).unwrap();
        assert_eq!(cache.protected_mut(&token).unwrap().0, 21);
        assert!(cache.is_dirty(1));

        let pin = cache.pin_protected(&token).unwrap();
        assert!(matches!(cache.pin_protected(&token), Err(CacheError::AlreadyPinned { addr: 1 })));
        cache.unprotect(token, UnprotectFlags::empty()).unwrap();

        assert!(matches!(cache.expunge(1), Err(CacheError::PinnedExpunge { addr: 1 })));
        cache.flush(&mut m).unwrap();
        assert_eq!(m.as_bytes()[1], 21);
        assert!(!cache.is_dirty(1));

        cache.unpin(pin).unwrap();
        assert_eq!(cache.expunge(1).unwrap().map(|c| c.0), Some(21));
        assert!(cache.is_empty());
    }

    #[test]
    fn double_protect_is_refused() {
        let mut m = medium();
        let mut cache: MetadataCache<Counter> = MetadataCache::new(true);
        let token = cache.protect(&mut m, 0, Intent::Read).unwrap();
        assert!(cache.protect(&mut m, 0, Intent::Read).is_err());
        assert!(matches!(cache.expunge(0), Err(CacheError::ProtectedExpunge { addr: 0 })));
        cache.unprotect(token, UnprotectFlags::empty()).unwrap();
    }

    #[test]
    fn read_only_cache_refuses_dirty() {
        let mut m = medium();
        let mut cache: MetadataCache<Counter> = MetadataCache::new(false);
        let token = cache.protect(&mut m, 2, Intent::Read).unwrap();
        let pin = cache.pin_protected(&token).unwrap();
        assert!(matches!(
            cache.unprotect(token, UnprotectFlags::DIRTIED),
            Err(CacheError::ReadOnlyDirty { addr: 2 })
        ));
        assert!(matches!(cache.mark_dirty(&pin), Err(CacheError::ReadOnlyDirty { addr: 2 })));
        cache.unpin(pin).unwrap();
    }

    #[test]
    fn flush_writes_every_dirty_entry() {
        let mut m = medium();
        let mut cache: MetadataCache<Counter> = MetadataCache::new(true);
        cache.insert(0, Counter(1), InsertFlags::FLUSH_LAST).unwrap();
        cache.insert(3, Counter(2), InsertFlags::empty()).unwrap();
        assert!(matches!(
            cache.insert(3, Counter(9), InsertFlags::empty()),
            Err(CacheError::Duplicate { addr: 3 })
        ));

        cache.flush(&mut m).unwrap();
        assert_eq!(m.as_bytes(), &[1, 20, 30, 2]);
        assert!(!cache.is_dirty(0) && !cache.is_dirty(3));
    }

    #[test]
    fn insert_with_pin_returns_token() {
        let mut cache: MetadataCache<Counter> = MetadataCache::new(true);
        let pin = cache.insert(8, Counter(0), InsertFlags::PIN | InsertFlags::FLUSH_LAST).unwrap();
        let pin = pin.expect("PIN flag yields a token");
        assert!(cache.is_pinned(8));
        cache.get_mut(&pin).unwrap().0 = 5;
        assert_eq!(cache.get(&pin).unwrap().0, 5);
        cache.unpin(pin).unwrap();
        assert!(!cache.is_pinned(8));
    }
}
