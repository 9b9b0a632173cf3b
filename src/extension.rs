//! The superblock extension: an object header holding optional file-level
//! messages.
//!
//! An extension only exists for superblock version 2 and later.  It is
//! created on first need, opened and closed around every operation, and
//! deleted once its last message is removed.  Its address is recorded in
//! the superblock, which is the only place that decides whether an
//! extension is present.

use crate::error::{FileError, Result};
use crate::file::ContainerFile;
use crate::medium::{addr_defined, MemClass, Medium};
use crate::message::{ExtensionMessage, MessageFlags, MessageId};
use crate::ohdr::{ObjectHeaders, HEADER_PREFIX, MIN_HEADER_SIZE};

/// An open superblock extension.  Consumed by
/// [`ContainerFile::ext_close`] or by deleting the extension.
#[must_use = "an open extension must be closed"]
#[derive(Debug)]
pub struct ExtensionHandle {
    addr:    u64,
    created: bool,
}

impl ExtensionHandle {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The extension was created by the operation that opened it.
    pub fn created(&self) -> bool {
        self.created
    }
}

/// Counts an object as open for as long as it lives.
struct OpenObjectGuard<'a>(&'a mut u32);

impl<'a> OpenObjectGuard<'a> {
    fn new(count: &'a mut u32) -> Self {
        *count += 1;
        Self(count)
    }
}

impl Drop for OpenObjectGuard<'_> {
    fn drop(&mut self) {
        *self.0 -= 1;
    }
}

impl<M: Medium, O: ObjectHeaders> ContainerFile<M, O> {
    /// Allocate a new extension header and record it in the superblock.
    pub fn ext_create(&mut self) -> Result<ExtensionHandle> {
        let sb = self.superblock()?;
        if !sb.supports_extension() {
            return Err(FileError::ExtensionNotPermitted { version: sb.version() });
        }
        if sb.has_extension() {
            return Err(FileError::ExtensionExists { addr: sb.ext_addr() });
        }

        let size = MIN_HEADER_SIZE + HEADER_PREFIX;
        let addr = self.space.alloc(&mut self.medium, MemClass::Ohdr, size as u64)?;
        if let Err(e) = self.headers.create(addr, size) {
            if let Err(free) = self.space.free(&mut self.medium, MemClass::Ohdr, addr, size as u64) {
                tracing::warn!(addr, error = %free, "unable to free extension space");
            }
            return Err(e.into());
        }
        self.superblock_mut()?.set_ext_addr(addr)?;
        tracing::debug!(addr, size, "superblock extension created");
        Ok(ExtensionHandle { addr, created: true })
    }

    pub fn ext_open(&mut self, addr: u64) -> Result<ExtensionHandle> {
        self.headers
            .open(addr)
            .map_err(|source| FileError::CantOpenExtension { addr, source })?;
        Ok(ExtensionHandle { addr, created: false })
    }

    /// Close an extension.  A newly created one gains the link from the
    /// superblock and drops the reference its creation took.
    pub fn ext_close(&mut self, ext: ExtensionHandle) -> Result<()> {
        let mut result = Ok(());
        if ext.created {
            self.headers.link(ext.addr, 1)?;
            if let Err(e) = self.headers.dec_rc(ext.addr) {
                tracing::warn!(addr = ext.addr, error = %e, "unable to drop extension reference");
                result = Err(e.into());
            }
        }

        // Closing the extension must not look like closing the last object.
        let _open = OpenObjectGuard::new(&mut self.nopen_objs);
        self.headers.close(ext.addr)?;
        result
    }

    /// Delete the extension entirely and forget its address.
    fn ext_delete(&mut self, ext: ExtensionHandle) -> Result<()> {
        let size = self.headers.delete(ext.addr)?;
        self.space.free(&mut self.medium, MemClass::Ohdr, ext.addr, size as u64)?;
        self.superblock_mut()?.clear_ext_addr();
        self.mark_dirty()?;
        tracing::debug!(addr = ext.addr, "superblock extension deleted");
        Ok(())
    }

    /// Create (`may_create`) or overwrite message `id` in the extension.
    ///
    /// Creating requires the message to be absent and makes the extension
    /// if there is none yet; overwriting requires it to be present.
    pub fn write_message(&mut self, id: MessageId, raw: &[u8], flags: MessageFlags, may_create: bool) -> Result<()> {
        let ext_addr = self.superblock()?.ext_addr();
        let ext = if addr_defined(ext_addr) {
            self.ext_open(ext_addr)?
        } else if may_create {
            self.ext_create()?
        } else {
            return Err(FileError::MessageAbsent(id));
        };

        let created = ext.created;
        let outcome = self.put_message(ext.addr, id, raw, flags, may_create);
        let closed = self.ext_close(ext);
        // Only a new extension changes the superblock itself.
        let dirtied = if created { self.mark_dirty() } else { Ok(()) };
        outcome.and(closed).and(dirtied)
    }

    fn put_message(&mut self, addr: u64, id: MessageId, raw: &[u8], flags: MessageFlags, may_create: bool) -> Result<()> {
        let exists = self.headers.msg_exists(addr, id)?;
        if may_create {
            if exists {
                return Err(FileError::MessageExists(id));
            }
            self.headers.msg_create(addr, id, flags, true, raw)?;
        } else {
            if !exists {
                return Err(FileError::MessageAbsent(id));
            }
            self.headers.msg_write(addr, id, flags, true, raw)?;
        }
        Ok(())
    }

    /// Raw payload of message `id`.
    pub fn read_message(&mut self, id: MessageId) -> Result<Vec<u8>> {
        let ext_addr = self.superblock()?.ext_addr();
        if !addr_defined(ext_addr) {
            return Err(FileError::MessageAbsent(id));
        }

        let ext = self.ext_open(ext_addr)?;
        let outcome = match self.headers.msg_exists(ext.addr, id) {
            Ok(true) => self.headers.msg_read(ext.addr, id).map_err(FileError::from),
            Ok(false) => Err(FileError::MessageAbsent(id)),
            Err(e) => Err(e.into()),
        };
        let closed = self.ext_close(ext);
        let raw = outcome?;
        closed?;
        Ok(raw)
    }

    /// Remove message `id` if present.  An extension left holding nothing
    /// but null messages in a single chunk is deleted.
    ///
    /// Calling this on a file without an extension is a caller bug and
    /// reported as [`FileError::Invariant`].
    pub fn remove_message(&mut self, id: MessageId) -> Result<()> {
        let ext_addr = self.superblock()?.ext_addr();
        if !addr_defined(ext_addr) {
            return Err(FileError::Invariant("removing a message from a missing superblock extension"));
        }

        let ext = self.ext_open(ext_addr)?;
        match self.drop_message(ext.addr, id) {
            Ok(true) => self.ext_delete(ext),
            Ok(false) => self.ext_close(ext),
            Err(e) => {
                if let Err(close) = self.ext_close(ext) {
                    tracing::warn!(error = %close, "unable to close superblock extension");
                }
                Err(e)
            }
        }
    }

    /// Remove `id` and report whether the extension is now empty.
    fn drop_message(&mut self, addr: u64, id: MessageId) -> Result<bool> {
        if self.headers.msg_exists(addr, id)? {
            self.headers.msg_remove(addr, id)?;
        }
        let info = self.headers.hdr_info(addr)?;
        if info.nchunks != 1 {
            return Ok(false);
        }
        let nulls = self.headers.msg_count(addr, MessageId::NULL)?;
        Ok(nulls == info.nmesgs)
    }

    // ── Typed helpers ────────────────────────────────────────────────────────

    pub fn write_typed<T: ExtensionMessage>(&mut self, msg: &T, may_create: bool) -> Result<()> {
        let raw = msg.encode(self.superblock()?.sizes)?;
        self.write_message(T::ID, &raw, T::FLAGS, may_create)
    }

    pub fn read_typed<T: ExtensionMessage>(&mut self) -> Result<T> {
        let raw = self.read_message(T::ID)?;
        T::decode(&raw, self.superblock()?.sizes)
    }
}
