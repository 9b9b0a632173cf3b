//! An open container file.

use crate::cache::{Intent, MetadataCache, PinnedEntry};
use crate::config::{AccessConfig, CreateConfig, FreeSpaceSettings};
use crate::error::{FileError, Result};
use crate::lifecycle::LifecycleState;
use crate::medium::Medium;
use crate::ohdr::{MemoryObjectHeaders, ObjectHeaders};
use crate::space::FileSpace;
use crate::superblock::{StatusFlags, Superblock};

/// The shared state of one open file: its medium, metadata cache and the
/// pinned superblock.
///
/// A file is obtained from [`ContainerFile::create`] or
/// [`ContainerFile::open`] and handed back with [`ContainerFile::close`],
/// which returns the medium and the object-header store.  Dropping a file
/// without closing it discards unflushed metadata.
#[derive(Debug)]
pub struct ContainerFile<M: Medium, O: ObjectHeaders = MemoryObjectHeaders> {
    pub(crate) medium:     M,
    pub(crate) headers:    O,
    pub(crate) cache:      MetadataCache<Superblock>,
    pub(crate) space:      FileSpace,
    pub(crate) sblock:     Option<PinnedEntry>,
    pub(crate) create:     CreateConfig,
    pub(crate) access:     AccessConfig,
    pub(crate) fs:         FreeSpaceSettings,
    pub(crate) intent:     Intent,
    pub(crate) nopen_objs: u32,
    pub(crate) state:      LifecycleState,
}

impl<M: Medium, O: ObjectHeaders> ContainerFile<M, O> {
    /// A file with no superblock yet.  Follow with
    /// [`init_superblock`](Self::init_superblock) or
    /// [`read_superblock`](Self::read_superblock).
    pub fn new(medium: M, headers: O, create: CreateConfig, access: AccessConfig, intent: Intent) -> Self {
        Self {
            medium,
            headers,
            cache:      MetadataCache::new(intent == Intent::Write),
            space:      FileSpace::new(access.alignment, access.threshold),
            sblock:     None,
            create,
            access,
            fs:         FreeSpaceSettings::default(),
            intent,
            nopen_objs: 0,
            state:      LifecycleState::Unloaded,
        }
    }

    /// Create a new file on `medium`.
    pub fn create(medium: M, headers: O, create: CreateConfig, access: AccessConfig) -> Result<Self> {
        let mut file = Self::new(medium, headers, create, access, Intent::Write);
        file.init_superblock()?;
        Ok(file)
    }

    /// Open an existing file on `medium`.
    pub fn open(medium: M, headers: O, access: AccessConfig, writable: bool) -> Result<Self> {
        let intent = if writable { Intent::Write } else { Intent::Read };
        let mut file = Self::new(medium, headers, CreateConfig::default(), access, intent);
        file.read_superblock()?;
        Ok(file)
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn superblock(&self) -> Result<&Superblock> {
        let pin = self.sblock.as_ref().ok_or(FileError::Invariant("no superblock loaded"))?;
        Ok(self.cache.get(pin)?)
    }

    pub(crate) fn superblock_mut(&mut self) -> Result<&mut Superblock> {
        let pin = self.sblock.as_ref().ok_or(FileError::Invariant("no superblock loaded"))?;
        Ok(self.cache.get_mut(pin)?)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_writable(&self) -> bool {
        self.intent == Intent::Write
    }

    /// Creation settings, including values resolved when the file was
    /// created or read back when it was opened.
    pub fn create_config(&self) -> &CreateConfig {
        &self.create
    }

    pub fn access_config(&self) -> &AccessConfig {
        &self.access
    }

    pub fn fs_settings(&self) -> &FreeSpaceSettings {
        &self.fs
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn headers(&self) -> &O {
        &self.headers
    }

    /// Objects currently open in this file.
    pub fn nopen_objs(&self) -> u32 {
        self.nopen_objs
    }

    pub fn is_superblock_dirty(&self) -> bool {
        self.sblock.as_ref().map_or(false, |pin| self.cache.is_dirty(pin.addr()))
    }

    // ── Flush / close ────────────────────────────────────────────────────────

    /// Write dirty metadata and size the medium to the end of allocation.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush(&mut self.medium)?;
        if self.is_writable() {
            self.medium.truncate()?;
        }
        Ok(())
    }

    /// Flush, release the superblock and hand back the medium and headers.
    pub fn close(mut self) -> Result<(M, O)> {
        if self.is_writable() {
            if let Some(pin) = &self.sblock {
                let sb = self.cache.get_mut(pin)?;
                if sb.supports_extension() && sb.status.contains(StatusFlags::WRITE_ACCESS) {
                    sb.status.remove(StatusFlags::WRITE_ACCESS);
                    self.cache.mark_dirty(pin)?;
                }
            }
            self.flush()?;
        }
        self.release_superblock()?;
        self.state = LifecycleState::Closed;
        tracing::debug!("file closed");
        Ok((self.medium, self.headers))
    }
}
