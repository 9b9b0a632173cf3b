//! Creating, loading and releasing the superblock of a file.

use crate::cache::{InsertFlags, Intent, UnprotectFlags};
use crate::config::{AccessConfig, CreateConfig, FreeSpaceSettings};
use crate::error::{FileError, Result};
use crate::extension::ExtensionHandle;
use crate::file::ContainerFile;
use crate::fields::Sizes;
use crate::medium::{DriverFeatures, MemClass, Medium};
use crate::message::{BtreeKMessage, DriverInfoMessage, ExtensionMessage, FsInfoMessage, SharedTableMessage};
use crate::ohdr::ObjectHeaders;
use crate::signature::{locate_signature, userblock_locatable};
use crate::superblock::{
    BtreeK, StatusFlags, Superblock, DRIVER_BLOCK_HEADER_SIZE, MAX_DRIVER_BLOCK_SIZE,
    SYM_LEAF_K_DEFAULT, VERSION_1, VERSION_2, VERSION_DEFAULT, VERSION_LATEST,
};

/// Superblock address, relative to the base address.
const SUPERBLOCK_ADDR: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Initialized,
    Failed,
    Closed,
}

/// Space a file's superblock and its extension occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuperblockSize {
    pub superblock: u64,
    /// Zero when the file has no extension.
    pub extension:  u64,
}

/// Lowest superblock version able to record the requested features.
pub fn select_version(create: &CreateConfig, access: &AccessConfig, fs: &FreeSpaceSettings) -> u8 {
    if access.latest_format {
        VERSION_LATEST
    } else if create.shared_indexes > 0 || !fs.is_default() {
        VERSION_2
    } else if create.btree_k.chunk != BtreeK::default().chunk {
        VERSION_1
    } else {
        VERSION_DEFAULT
    }
}

impl<M: Medium, O: ObjectHeaders> ContainerFile<M, O> {
    // ── Init path ────────────────────────────────────────────────────────────

    /// Build, cache and allocate a fresh superblock, plus its extension when
    /// any setting needs one.  On failure nothing stays reachable from the
    /// file; bytes already written to the medium are left as they are.
    pub fn init_superblock(&mut self) -> Result<()> {
        self.state = LifecycleState::Initializing;
        let mut ext = None;
        match self.init_steps(&mut ext) {
            Ok(()) => {
                self.state = LifecycleState::Initialized;
                tracing::debug!(version = self.create.superblock_version, "superblock initialized");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "superblock initialization failed, rolling back");
                if let Some(ext) = ext {
                    if let Err(close) = self.ext_close(ext) {
                        tracing::warn!(error = %close, "unable to close superblock extension");
                    }
                }
                self.discard_superblock();
                self.state = LifecycleState::Failed;
                Err(e)
            }
        }
    }

    fn init_steps(&mut self, ext: &mut Option<ExtensionHandle>) -> Result<()> {
        let fs = FreeSpaceSettings::resolve(&mut self.create, &self.access);
        self.fs = fs;
        let sizes = self.create.sizes()?;

        let version = select_version(&self.create, &self.access, &fs);
        if let Some(allowed) = self.access.max_superblock_version {
            if version > allowed {
                return Err(FileError::VersionConflict { required: version, allowed });
            }
        }
        if version > VERSION_DEFAULT {
            self.create.superblock_version = version;
        }

        let userblock = self.create.userblock_size;
        let alignment = fs.userblock_alignment(&self.access);
        if !userblock_locatable(userblock)
            || (userblock > 0 && (userblock < alignment || userblock % alignment != 0))
        {
            return Err(FileError::BadUserBlockSize { size: userblock, alignment });
        }

        let mut sb = Superblock::new(version, sizes)?;
        sb.base_addr = userblock;
        sb.sym_leaf_k = self.create.sym_leaf_k;
        sb.btree_k = self.create.btree_k;
        if sb.supports_extension() {
            sb.status.insert(StatusFlags::WRITE_ACCESS);
        }

        // Reserve the user block, then make addresses relative to its end.
        self.medium.set_eoa(MemClass::Super, userblock)?;
        self.medium.set_base_addr(userblock)?;

        let sblock_size = Superblock::encoded_size(version, sizes)? as u64;
        let driver_size = self.medium.sb_size();
        let mut footprint = sblock_size;
        if !sb.supports_extension() && driver_size > 0 {
            sb.set_driver_addr(sblock_size);
            footprint += (DRIVER_BLOCK_HEADER_SIZE + driver_size) as u64;
        }

        let flags = InsertFlags::PIN | InsertFlags::FLUSH_LAST | InsertFlags::FLUSH_COLLECTIVELY;
        let pin = self
            .cache
            .insert(SUPERBLOCK_ADDR, sb, flags)?
            .ok_or(FileError::Invariant("pinned insert returned no pin"))?;
        self.sblock = Some(pin);

        let addr = self.space.alloc(&mut self.medium, MemClass::Super, footprint)?;
        if addr != SUPERBLOCK_ADDR {
            return Err(FileError::Invariant("superblock not allocated at the base address"));
        }

        let nondefault_k = self.create.btree_k != BtreeK::default()
            || self.create.sym_leaf_k != SYM_LEAF_K_DEFAULT;
        let need_ext = self.create.shared_indexes > 0
            || !fs.is_default()
            || (version >= VERSION_2 && (nondefault_k || driver_size > 0));
        if !need_ext {
            return Ok(());
        }

        let handle = self.ext_create()?;
        let ext_addr = handle.addr();
        *ext = Some(handle);

        if self.create.shared_indexes > 0 {
            self.sohm_init(ext_addr)?;
        }
        if nondefault_k {
            let msg = BtreeKMessage { btree_k: self.create.btree_k, sym_leaf_k: self.create.sym_leaf_k };
            self.create_message(ext_addr, sizes, &msg)?;
        }
        if driver_size > 0 {
            assert!(
                DRIVER_BLOCK_HEADER_SIZE + driver_size <= MAX_DRIVER_BLOCK_SIZE,
                "driver info of {driver_size} bytes exceeds the driver block limit"
            );
            if let Some(info) = self.medium.sb_encode()? {
                self.create_message(ext_addr, sizes, &DriverInfoMessage(info))?;
            }
        }
        if !fs.is_default() {
            let msg = FsInfoMessage::new(fs.strategy, fs.persist, fs.threshold, fs.page_size);
            self.create_message(ext_addr, sizes, &msg)?;
        }

        if let Some(handle) = ext.take() {
            self.ext_close(handle)?;
        }
        Ok(())
    }

    pub(crate) fn create_message<T: ExtensionMessage>(&mut self, ext_addr: u64, sizes: Sizes, msg: &T) -> Result<()> {
        let raw = msg.encode(sizes)?;
        let id = T::ID;
        self.headers.msg_create(ext_addr, id, T::FLAGS, true, &raw)?;
        tracing::trace!(%id, len = raw.len(), "extension message created");
        Ok(())
    }

    // ── Load path ────────────────────────────────────────────────────────────

    /// Locate, load and pin the superblock of an existing file, then apply
    /// the settings stored in its extension.
    pub fn read_superblock(&mut self) -> Result<()> {
        self.state = LifecycleState::Loading;
        match self.read_steps() {
            Ok(()) => {
                self.state = LifecycleState::Loaded;
                Ok(())
            }
            Err(e) => {
                self.discard_superblock();
                self.state = LifecycleState::Failed;
                Err(e)
            }
        }
    }

    fn read_steps(&mut self) -> Result<()> {
        let located = locate_signature(&mut self.medium)?;
        if located != 0 {
            self.medium.set_base_addr(located)?;
        }

        let intent = self.intent;
        let token = self
            .cache
            .protect(&mut self.medium, SUPERBLOCK_ADDR, intent)
            .map_err(|e| match e {
                FileError::Cache(c) => FileError::CantProtect(c),
                other => other,
            })?;

        let mut flags = UnprotectFlags::empty();
        if intent == Intent::Write
            && self.medium.features().contains(DriverFeatures::DIRTY_SUPERBLOCK_ON_LOAD)
        {
            flags |= UnprotectFlags::DIRTIED;
        }

        let pin = match self.cache.pin_protected(&token) {
            Ok(pin) => pin,
            Err(e) => {
                if let Err(release) = self.cache.unprotect(token, UnprotectFlags::empty()) {
                    tracing::warn!(error = %release, "unable to release superblock");
                }
                return Err(FileError::CantProtect(e));
            }
        };
        // From here on the pin is owned by the file and released on failure.
        self.sblock = Some(pin);
        self.cache.unprotect(token, flags).map_err(FileError::CantProtect)?;

        let sb = self.superblock()?;
        tracing::debug!(
            version = sb.version(),
            base = sb.base_addr,
            eoa = sb.eoa,
            extension = sb.has_extension(),
            "superblock loaded"
        );
        let (sizes, sym_leaf_k, btree_k) = (sb.sizes, sb.sym_leaf_k, sb.btree_k);
        let (version, base_addr) = (sb.version(), sb.base_addr);

        self.create.sizeof_addr = sizes.addr;
        self.create.sizeof_size = sizes.len;
        self.create.sym_leaf_k = sym_leaf_k;
        self.create.btree_k = btree_k;
        self.create.superblock_version = version;
        self.create.userblock_size = base_addr;

        self.load_extension()
    }

    /// Apply the B-tree, free-space and driver settings kept in the extension.
    fn load_extension(&mut self) -> Result<()> {
        let sb = self.superblock()?;
        if !sb.has_extension() {
            return Ok(());
        }
        let (addr, sizes) = (sb.ext_addr(), sb.sizes);

        let ext = self.ext_open(addr)?;
        let outcome = self.apply_extension(addr, sizes);
        let closed = self.ext_close(ext);
        outcome.and(closed)
    }

    fn apply_extension(&mut self, addr: u64, sizes: Sizes) -> Result<()> {
        if let Some(k) = self.stored_message::<BtreeKMessage>(addr, sizes)? {
            let sb = self.superblock_mut()?;
            sb.btree_k = k.btree_k;
            sb.sym_leaf_k = k.sym_leaf_k;
            self.create.btree_k = k.btree_k;
            self.create.sym_leaf_k = k.sym_leaf_k;
        }
        if let Some(info) = self.stored_message::<FsInfoMessage>(addr, sizes)? {
            self.fs = FreeSpaceSettings {
                strategy:  info.strategy,
                persist:   info.persist,
                threshold: info.threshold,
                page_size: info.page_size,
            };
            self.create.fs_strategy = Some(info.strategy);
            self.create.fs_persist = Some(info.persist);
            self.create.fs_threshold = info.threshold;
            self.create.fs_page_size = info.page_size;
        }
        if let Some(DriverInfoMessage(info)) = self.stored_message::<DriverInfoMessage>(addr, sizes)? {
            self.medium.sb_decode(&info)?;
        }
        if let Some(table) = self.stored_message::<SharedTableMessage>(addr, sizes)? {
            self.create.shared_indexes = table.nindexes;
        }
        Ok(())
    }

    fn stored_message<T: ExtensionMessage>(&self, addr: u64, sizes: Sizes) -> Result<Option<T>> {
        if !self.headers.msg_exists(addr, T::ID)? {
            return Ok(None);
        }
        let raw = self.headers.msg_read(addr, T::ID)?;
        T::decode(&raw, sizes).map(Some)
    }

    // ── Auxiliary ────────────────────────────────────────────────────────────

    /// Schedule the superblock to be written at the next flush.
    pub fn mark_dirty(&mut self) -> Result<()> {
        let pin = self
            .sblock
            .as_ref()
            .ok_or(FileError::Invariant("no superblock to mark dirty"))?;
        self.cache.mark_dirty(pin).map_err(FileError::CantMarkDirty)
    }

    /// Encoded superblock size and the total size of its extension header.
    pub fn size_query(&self) -> Result<SuperblockSize> {
        let sb = self.superblock()?;
        let superblock = sb.encoded_len() as u64;
        let extension = if sb.has_extension() {
            self.headers.hdr_info(sb.ext_addr())?.total
        } else {
            0
        };
        Ok(SuperblockSize { superblock, extension })
    }

    /// Unpin, expunge and free the superblock.
    pub(crate) fn release_superblock(&mut self) -> Result<()> {
        let Some(pin) = self.sblock.take() else { return Ok(()) };
        let addr = pin.addr();
        self.cache.unpin(pin)?;
        if let Some(sb) = self.cache.expunge(addr)? {
            sb.free();
        }
        Ok(())
    }

    /// Release the superblock during rollback, logging what cannot be undone.
    fn discard_superblock(&mut self) {
        if let Err(e) = self.release_superblock() {
            tracing::warn!(error = %e, "unable to release superblock");
        }
        // A superblock protected but never pinned is still cached.
        if let Ok(Some(sb)) = self.cache.expunge(SUPERBLOCK_ADDR) {
            sb.free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FsStrategy;

    fn version_for(create: CreateConfig, access: AccessConfig) -> u8 {
        let mut create = create;
        let fs = FreeSpaceSettings::resolve(&mut create, &access);
        select_version(&create, &access, &fs)
    }

    #[test]
    fn defaults_select_default_version() {
        assert_eq!(version_for(CreateConfig::default(), AccessConfig::default()), VERSION_DEFAULT);
    }

    #[test]
    fn version_rules_apply_in_order() {
        let latest = AccessConfig { latest_format: true, ..Default::default() };
        assert_eq!(version_for(CreateConfig::default(), latest), VERSION_LATEST);

        let shared = CreateConfig { shared_indexes: 2, ..Default::default() };
        assert_eq!(version_for(shared, AccessConfig::default()), VERSION_2);

        let paged = CreateConfig { fs_strategy: Some(FsStrategy::Page), ..Default::default() };
        assert_eq!(version_for(paged, AccessConfig::default()), VERSION_2);

        let threshold = CreateConfig { fs_threshold: 64, ..Default::default() };
        assert_eq!(version_for(threshold, AccessConfig::default()), VERSION_2);

        let chunk = CreateConfig { btree_k: BtreeK { chunk: 64, ..Default::default() }, ..Default::default() };
        assert_eq!(version_for(chunk, AccessConfig::default()), VERSION_1);

        let snode = CreateConfig { btree_k: BtreeK { snode: 64, ..Default::default() }, ..Default::default() };
        assert_eq!(version_for(snode, AccessConfig::default()), VERSION_DEFAULT);
    }
}
