//! File creation and access settings.
//!
//! Both configs serialize to JSON; any field missing from the input takes
//! its default.

use serde::{Serialize, Deserialize};

use crate::error::Result;
use crate::fields::Sizes;
use crate::message::FsStrategy;
use crate::superblock::{BtreeK, SYM_LEAF_K_DEFAULT, VERSION_DEFAULT};

pub const FS_PERSIST_DEFAULT: bool   = false;
pub const FS_THRESHOLD_DEFAULT: u64  = 1;
pub const FS_PAGE_SIZE_DEFAULT: u64  = 4096;

/// Settings fixed when a file is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateConfig {
    /// Bytes reserved ahead of the superblock for application use.
    pub userblock_size:     u64,
    pub sizeof_addr:        u8,
    pub sizeof_size:        u8,
    pub sym_leaf_k:         u16,
    pub btree_k:            BtreeK,
    /// `None` leaves the choice to the library.
    pub fs_strategy:        Option<FsStrategy>,
    /// `None` leaves the choice to the library.
    pub fs_persist:         Option<bool>,
    pub fs_threshold:       u64,
    pub fs_page_size:       u64,
    /// Number of shared object-header message indexes.
    pub shared_indexes:     u8,
    /// Superblock version chosen at creation; written back by the engine.
    pub superblock_version: u8,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self {
            userblock_size:     0,
            sizeof_addr:        8,
            sizeof_size:        8,
            sym_leaf_k:         SYM_LEAF_K_DEFAULT,
            btree_k:            BtreeK::default(),
            fs_strategy:        None,
            fs_persist:         None,
            fs_threshold:       FS_THRESHOLD_DEFAULT,
            fs_page_size:       FS_PAGE_SIZE_DEFAULT,
            shared_indexes:     0,
            superblock_version: VERSION_DEFAULT,
        }
    }
}

impl CreateConfig {
    pub fn sizes(&self) -> Result<Sizes> {
        Sizes::new(self.sizeof_addr, self.sizeof_size)
    }

    pub fn to_json(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Settings that apply to one open of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// File allocations of at least `threshold` bytes are aligned to this.
    pub alignment:              u64,
    pub threshold:              u64,
    /// Write the newest format version and defaults.
    pub latest_format:          bool,
    /// Refuse to create files needing a newer superblock than this.
    pub max_superblock_version: Option<u8>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            alignment:              1,
            threshold:              1,
            latest_format:          false,
            max_superblock_version: None,
        }
    }
}

impl AccessConfig {
    pub fn to_json(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ── Free-space settings ──────────────────────────────────────────────────────

/// Effective free-space handling of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpaceSettings {
    pub strategy:  FsStrategy,
    pub persist:   bool,
    pub threshold: u64,
    pub page_size: u64,
}

impl Default for FreeSpaceSettings {
    fn default() -> Self {
        Self {
            strategy:  FsStrategy::default(),
            persist:   FS_PERSIST_DEFAULT,
            threshold: FS_THRESHOLD_DEFAULT,
            page_size: FS_PAGE_SIZE_DEFAULT,
        }
    }
}

impl FreeSpaceSettings {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Apply library defaults to `create` and write back any value the
    /// latest-format flag upgraded.
    ///
    /// An unset strategy becomes paged aggregation and an unset persist flag
    /// becomes `true` under the latest format.  Explicit requests, including
    /// explicit defaults, are kept.
    pub fn resolve(create: &mut CreateConfig, access: &AccessConfig) -> Self {
        let strategy = create.fs_strategy.unwrap_or(if access.latest_format {
            FsStrategy::Page
        } else {
            FsStrategy::default()
        });
        if create.fs_strategy.is_none() && strategy != FsStrategy::default() {
            create.fs_strategy = Some(strategy);
        }

        let persist = create.fs_persist.unwrap_or(access.latest_format || FS_PERSIST_DEFAULT);
        if create.fs_persist.is_none() && persist != FS_PERSIST_DEFAULT {
            create.fs_persist = Some(persist);
        }

        Self {
            strategy,
            persist,
            threshold: create.fs_threshold,
            page_size: create.fs_page_size,
        }
    }

    /// Alignment a user block must respect under these settings.
    pub fn userblock_alignment(&self, access: &AccessConfig) -> u64 {
        let alignment = if self.strategy == FsStrategy::Page { self.page_size } else { access.alignment };
        alignment.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_library_defaults() {
        let mut create = CreateConfig::default();
        let fs = FreeSpaceSettings::resolve(&mut create, &AccessConfig::default());
        assert!(fs.is_default());
        assert_eq!(create, CreateConfig::default());
    }

    #[test]
    fn latest_format_upgrades_unset_settings_and_writes_back() {
        let mut create = CreateConfig::default();
        let access = AccessConfig { latest_format: true, ..Default::default() };
        let fs = FreeSpaceSettings::resolve(&mut create, &access);
        assert_eq!(fs.strategy, FsStrategy::Page);
        assert!(fs.persist);
        assert_eq!(create.fs_strategy, Some(FsStrategy::Page));
        assert_eq!(create.fs_persist, Some(true));
    }

    #[test]
    fn explicit_defaults_survive_latest_format() {
        let mut create = CreateConfig {
            fs_strategy: Some(FsStrategy::FsmAggr),
            fs_persist: Some(false),
            ..Default::default()
        };
        let access = AccessConfig { latest_format: true, ..Default::default() };
        assert!(FreeSpaceSettings::resolve(&mut create, &access).is_default());
    }

    #[test]
    fn paged_strategy_aligns_user_block_to_page() {
        let fs = FreeSpaceSettings { strategy: FsStrategy::Page, page_size: 8192, ..Default::default() };
        let access = AccessConfig { alignment: 512, ..Default::default() };
        assert_eq!(fs.userblock_alignment(&access), 8192);
        assert_eq!(FreeSpaceSettings::default().userblock_alignment(&access), 512);
    }

    #[test]
    fn missing_json_fields_take_defaults() {
        let create = CreateConfig::from_json(br#"{"userblock_size": 1024, "fs_strategy": "aggr"}"#).unwrap();
        assert_eq!(create.userblock_size, 1024);
        assert_eq!(create.fs_strategy, Some(FsStrategy::Aggr));
        assert_eq!(create.btree_k, BtreeK::default());

        let access = AccessConfig::from_json(&AccessConfig::default().to_json().unwrap()).unwrap();
        assert_eq!(access, AccessConfig::default());
    }
}
