//! The superblock: the fixed-position root record of every container file.
//!
//! # Versions
//!
//! | Version | Layout  | Carries                                                   |
//! |---------|---------|-----------------------------------------------------------|
//! | 0       | legacy  | B-tree K values, driver-info address, root symbol entry  |
//! | 1       | legacy  | version 0 plus the indexed-storage internal K            |
//! | 2       | compact | extension address, root object header address, CRC32     |
//! | 3       | compact | as version 2; written when the newest format is requested |
//!
//! The version byte always sits right after the 8-byte signature, so
//! decoding dispatches on it before touching any other field.  All integers
//! are little-endian; address and length fields use the widths recorded in
//! the superblock itself.
//!
//! ```text
//! legacy:  sig(8) ver(1) fs_ver(1) root_ver(1) 0(1) shm_ver(1) sizeof_addr(1)
//!          sizeof_size(1) 0(1) sym_leaf_k(2) snode_k(2) flags(4)
//!          [v1: chunk_k(2) 0(2)] base unused eoa driver root_entry
//! compact: sig(8) ver(1) sizeof_addr(1) sizeof_size(1) flags(1)
//!          base ext eoa root crc32(4)
//! ```

use std::io::Cursor;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use serde::{Serialize, Deserialize};

use crate::error::{FileError, Result};
use crate::fields::{read_addr, read_len, write_addr, write_len, Sizes};
use crate::medium::{addr_defined, ADDR_UNDEF};
use crate::signature::{SIGNATURE, SIGNATURE_LEN};

mod driver;
mod load;

pub use driver::{
    decode_driver_block, encode_driver_block, DRIVER_BLOCK_HEADER_SIZE, MAX_DRIVER_BLOCK_SIZE,
};

pub const VERSION_0: u8 = 0;
pub const VERSION_1: u8 = 1;
pub const VERSION_2: u8 = 2;
pub const VERSION_3: u8 = 3;
pub const VERSION_DEFAULT: u8 = VERSION_0;
pub const VERSION_LATEST: u8 = VERSION_3;

/// Signature plus version byte.
pub const FIXED_SIZE: usize = SIGNATURE_LEN + 1;

/// Bytes needed to learn a superblock's full encoded length.
pub const PROBE_LEN: usize = FIXED_SIZE + 6;

pub const SYM_LEAF_K_DEFAULT: u16     = 4;
pub const BTREE_SNODE_IK_DEFAULT: u16 = 16;
pub const BTREE_CHUNK_IK_DEFAULT: u16 = 32;

const FREESPACE_VERSION: u8  = 0;
const ROOT_SYM_VERSION: u8   = 0;
const SHARED_HDR_VERSION: u8 = 0;
const CHECKSUM_SIZE: usize   = 4;

/// Bytes between the version byte and the first address of a legacy record.
const LEGACY_VARLEN: usize    = 15;
const LEGACY_V1_EXTRA: usize  = 4;
/// Bytes between the version byte and the first address of a compact record.
const COMPACT_VARLEN: usize   = 3;

bitflags! {
    /// File consistency flags.
    #[derive(Default)]
    pub struct StatusFlags: u8 {
        const WRITE_ACCESS      = 0x01;
        const FILE_OK           = 0x02;
        const SWMR_WRITE_ACCESS = 0x04;
    }
}

/// Internal-node fan-out of the two v1 B-tree kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeK {
    /// Group symbol-table nodes.
    pub snode: u16,
    /// Indexed (chunked) storage nodes.
    pub chunk: u16,
}

impl Default for BtreeK {
    fn default() -> Self {
        Self { snode: BTREE_SNODE_IK_DEFAULT, chunk: BTREE_CHUNK_IK_DEFAULT }
    }
}

// ── Root symbol-table entry ──────────────────────────────────────────────────

/// Root group entry embedded in legacy superblocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name_offset: u64,
    pub header_addr: u64,
    pub cache_type:  u32,
    pub scratch:     [u8; 16],
}

impl SymbolEntry {
    pub fn undefined() -> Self {
        Self { name_offset: 0, header_addr: ADDR_UNDEF, cache_type: 0, scratch: [0; 16] }
    }

    pub fn encoded_size(sizes: Sizes) -> usize {
        sizes.len as usize + sizes.addr as usize + 4 + 4 + 16
    }

    fn encode(&self, out: &mut Vec<u8>, sizes: Sizes) -> Result<()> {
        write_len(out, self.name_offset, sizes.len)?;
        write_addr(out, self.header_addr, sizes.addr)?;
        out.write_u32::<LittleEndian>(self.cache_type)?;
        out.write_u32::<LittleEndian>(0)?;
        out.extend_from_slice(&self.scratch);
        Ok(())
    }

    fn decode(cur: &mut Cursor<&[u8]>, sizes: Sizes) -> Result<Self> {
        let name_offset = read_len(cur, sizes.len)?;
        let header_addr = read_addr(cur, sizes.addr)?;
        let cache_type  = cur.read_u32::<LittleEndian>()?;
        let _reserved   = cur.read_u32::<LittleEndian>()?;
        let mut scratch = [0u8; 16];
        std::io::Read::read_exact(cur, &mut scratch)?;
        Ok(Self { name_offset, header_addr, cache_type, scratch })
    }
}

// ── Version-specific layout ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFields {
    pub driver_addr: u64,
    pub root_entry:  SymbolEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactFields {
    pub ext_addr:  u64,
    pub root_addr: u64,
}

/// Fields that exist only in some versions, tagged by version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    V0(LegacyFields),
    V1(LegacyFields),
    V2(CompactFields),
    V3(CompactFields),
}

impl Layout {
    /// Fresh layout for `version` with every address undefined.
    pub fn new(version: u8) -> Result<Self> {
        let legacy = || LegacyFields { driver_addr: ADDR_UNDEF, root_entry: SymbolEntry::undefined() };
        let compact = CompactFields { ext_addr: ADDR_UNDEF, root_addr: ADDR_UNDEF };
        match version {
            VERSION_0 => Ok(Layout::V0(legacy())),
            VERSION_1 => Ok(Layout::V1(legacy())),
            VERSION_2 => Ok(Layout::V2(compact)),
            VERSION_3 => Ok(Layout::V3(compact)),
            v => Err(FileError::UnsupportedVersion(v)),
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            Layout::V0(_) => VERSION_0,
            Layout::V1(_) => VERSION_1,
            Layout::V2(_) => VERSION_2,
            Layout::V3(_) => VERSION_3,
        }
    }
}

// ── Superblock ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub sizes:      Sizes,
    /// Absolute offset of the superblock (the user-block size).
    pub base_addr:  u64,
    /// End of allocation; refreshed from the medium whenever it is flushed.
    pub eoa:        u64,
    pub status:     StatusFlags,
    pub sym_leaf_k: u16,
    pub btree_k:    BtreeK,
    pub layout:     Layout,
}

/// Result of decoding a superblock at a located address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub superblock:    Superblock,
    /// The stored base address disagreed with where the signature was found
    /// and has been replaced by the located address.
    pub base_adjusted: bool,
}

impl Superblock {
    /// An in-memory superblock with every address undefined and default
    /// fan-out parameters.
    pub fn new(version: u8, sizes: Sizes) -> Result<Self> {
        Ok(Self {
            sizes,
            base_addr:  ADDR_UNDEF,
            eoa:        ADDR_UNDEF,
            status:     StatusFlags::empty(),
            sym_leaf_k: SYM_LEAF_K_DEFAULT,
            btree_k:    BtreeK::default(),
            layout:     Layout::new(version)?,
        })
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.layout.version()
    }

    pub fn supports_extension(&self) -> bool {
        self.compact().is_some()
    }

    pub fn legacy(&self) -> Option<&LegacyFields> {
        match &self.layout {
            Layout::V0(l) | Layout::V1(l) => Some(l),
            Layout::V2(_) | Layout::V3(_) => None,
        }
    }

    pub fn compact(&self) -> Option<&CompactFields> {
        match &self.layout {
            Layout::V2(c) | Layout::V3(c) => Some(c),
            Layout::V0(_) | Layout::V1(_) => None,
        }
    }

    fn compact_mut(&mut self) -> Option<&mut CompactFields> {
        match &mut self.layout {
            Layout::V2(c) | Layout::V3(c) => Some(c),
            Layout::V0(_) | Layout::V1(_) => None,
        }
    }

    /// Extension object header address; undefined for legacy versions.
    pub fn ext_addr(&self) -> u64 {
        self.compact().map_or(ADDR_UNDEF, |c| c.ext_addr)
    }

    pub fn has_extension(&self) -> bool {
        addr_defined(self.ext_addr())
    }

    /// Record a newly created extension.  Only the absent → present
    /// transition is accepted.
    pub fn set_ext_addr(&mut self, addr: u64) -> Result<()> {
        let version = self.version();
        let c = self
            .compact_mut()
            .ok_or(FileError::ExtensionNotPermitted { version })?;
        if addr_defined(c.ext_addr) {
            return Err(FileError::ExtensionExists { addr: c.ext_addr });
        }
        c.ext_addr = addr;
        Ok(())
    }

    /// Forget the extension after it has been deleted.
    pub fn clear_ext_addr(&mut self) {
        if let Some(c) = self.compact_mut() {
            c.ext_addr = ADDR_UNDEF;
        }
    }

    /// Address of the inline driver-info block; undefined for compact versions.
    pub fn driver_addr(&self) -> u64 {
        self.legacy().map_or(ADDR_UNDEF, |l| l.driver_addr)
    }

    /// Compact versions keep driver info in the extension, so this is a
    /// no-op for them.
    pub fn set_driver_addr(&mut self, addr: u64) {
        if let Layout::V0(l) | Layout::V1(l) = &mut self.layout {
            l.driver_addr = addr;
        }
    }

    pub fn root_addr(&self) -> u64 {
        match &self.layout {
            Layout::V0(l) | Layout::V1(l) => l.root_entry.header_addr,
            Layout::V2(c) | Layout::V3(c) => c.root_addr,
        }
    }

    /// Encoded length of a superblock of `version` with the given widths.
    pub fn encoded_size(version: u8, sizes: Sizes) -> Result<usize> {
        let addrs = 4 * sizes.addr as usize;
        let varlen = match version {
            VERSION_0 => LEGACY_VARLEN + addrs + SymbolEntry::encoded_size(sizes),
            VERSION_1 => LEGACY_VARLEN + LEGACY_V1_EXTRA + addrs + SymbolEntry::encoded_size(sizes),
            VERSION_2 | VERSION_3 => COMPACT_VARLEN + addrs + CHECKSUM_SIZE,
            v => return Err(FileError::UnsupportedVersion(v)),
        };
        Ok(FIXED_SIZE + varlen)
    }

    pub fn encoded_len(&self) -> usize {
        // Every constructed layout has a known version.
        Self::encoded_size(self.version(), self.sizes).unwrap_or(0)
    }

    /// Full encoded length of the superblock whose first [`PROBE_LEN`] bytes
    /// are `prefix`.
    pub fn required_len(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < PROBE_LEN {
            return Err(FileError::Malformed(format!(
                "superblock prefix: {} bytes, need {PROBE_LEN}",
                prefix.len()
            )));
        }
        if &prefix[..SIGNATURE_LEN] != SIGNATURE {
            return Err(FileError::NotAContainerFile);
        }
        let version = prefix[SIGNATURE_LEN];
        let (addr, len) = match version {
            VERSION_0 | VERSION_1 => (prefix[FIXED_SIZE + 4], prefix[FIXED_SIZE + 5]),
            VERSION_2 | VERSION_3 => (prefix[FIXED_SIZE], prefix[FIXED_SIZE + 1]),
            v => return Err(FileError::UnsupportedVersion(v)),
        };
        Self::encoded_size(version, Sizes::new(addr, len)?)
    }

    // ── Encode ───────────────────────────────────────────────────────────────

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(SIGNATURE);
        out.write_u8(self.version())?;

        match &self.layout {
            Layout::V0(l) | Layout::V1(l) => self.encode_legacy(&mut out, l)?,
            Layout::V2(c) | Layout::V3(c) => self.encode_compact(&mut out, c)?,
        }
        debug_assert_eq!(out.len(), self.encoded_len());
        Ok(out)
    }

    fn encode_legacy(&self, out: &mut Vec<u8>, l: &LegacyFields) -> Result<()> {
        let s = self.sizes;
        out.write_u8(FREESPACE_VERSION)?;
        out.write_u8(ROOT_SYM_VERSION)?;
        out.write_u8(0)?;
        out.write_u8(SHARED_HDR_VERSION)?;
        out.write_u8(s.addr)?;
        out.write_u8(s.len)?;
        out.write_u8(0)?;
        out.write_u16::<LittleEndian>(self.sym_leaf_k)?;
        out.write_u16::<LittleEndian>(self.btree_k.snode)?;
        out.write_u32::<LittleEndian>(self.status.bits() as u32)?;
        if let Layout::V1(_) = self.layout {
            out.write_u16::<LittleEndian>(self.btree_k.chunk)?;
            out.write_u16::<LittleEndian>(0)?;
        }
        write_addr(out, self.base_addr, s.addr)?;
        // Free-space info slot: never used by legacy files.
        write_addr(out, ADDR_UNDEF, s.addr)?;
        write_addr(out, self.eoa, s.addr)?;
        write_addr(out, l.driver_addr, s.addr)?;
        l.root_entry.encode(out, s)
    }

    fn encode_compact(&self, out: &mut Vec<u8>, c: &CompactFields) -> Result<()> {
        let s = self.sizes;
        out.write_u8(s.addr)?;
        out.write_u8(s.len)?;
        out.write_u8(self.status.bits())?;
        write_addr(out, self.base_addr, s.addr)?;
        write_addr(out, c.ext_addr, s.addr)?;
        write_addr(out, self.eoa, s.addr)?;
        write_addr(out, c.root_addr, s.addr)?;

        let mut hasher = Hasher::new();
        hasher.update(out);
        out.write_u32::<LittleEndian>(hasher.finalize())?;
        Ok(())
    }

    // ── Decode ───────────────────────────────────────────────────────────────

    /// Decode the superblock in `buf`, which starts at absolute address
    /// `located`.
    pub fn decode(buf: &[u8], located: u64) -> Result<Decoded> {
        let needed = Self::required_len(buf)?;
        if buf.len() < needed {
            return Err(FileError::Malformed(format!(
                "superblock: {} bytes, need {needed}",
                buf.len()
            )));
        }
        let buf = &buf[..needed];
        let mut cur = Cursor::new(buf);
        cur.set_position(SIGNATURE_LEN as u64);
        let version = cur.read_u8()?;

        let mut superblock = match version {
            VERSION_0 | VERSION_1 => Self::decode_legacy(&mut cur, version)?,
            VERSION_2 | VERSION_3 => Self::decode_compact(&mut cur, version, buf)?,
            v => return Err(FileError::UnsupportedVersion(v)),
        };

        let base_adjusted = superblock.base_addr != located;
        if base_adjusted {
            tracing::debug!(
                stored = superblock.base_addr,
                located,
                "superblock base address differs from its location"
            );
            superblock.base_addr = located;
        }
        Ok(Decoded { superblock, base_adjusted })
    }

    fn decode_legacy(cur: &mut Cursor<&[u8]>, version: u8) -> Result<Self> {
        let fs_vers   = cur.read_u8()?;
        let root_vers = cur.read_u8()?;
        let _         = cur.read_u8()?;
        let shm_vers  = cur.read_u8()?;
        if fs_vers != FREESPACE_VERSION {
            return Err(FileError::Malformed(format!("free-space version {fs_vers}")));
        }
        if root_vers != ROOT_SYM_VERSION {
            return Err(FileError::Malformed(format!("root group version {root_vers}")));
        }
        if shm_vers != SHARED_HDR_VERSION {
            return Err(FileError::Malformed(format!("shared header version {shm_vers}")));
        }
        let sizes = Sizes::new(cur.read_u8()?, cur.read_u8()?)?;
        let _ = cur.read_u8()?;

        let sym_leaf_k = cur.read_u16::<LittleEndian>()?;
        if sym_leaf_k == 0 {
            return Err(FileError::Malformed("symbol table leaf K of 0".into()));
        }
        let snode = cur.read_u16::<LittleEndian>()?;
        if snode == 0 {
            return Err(FileError::Malformed("symbol table internal K of 0".into()));
        }
        let status = StatusFlags::from_bits_truncate(cur.read_u32::<LittleEndian>()? as u8);

        let mut btree_k = BtreeK { snode, ..BtreeK::default() };
        if version == VERSION_1 {
            btree_k.chunk = cur.read_u16::<LittleEndian>()?;
            let _ = cur.read_u16::<LittleEndian>()?;
            if btree_k.chunk == 0 {
                return Err(FileError::Malformed("indexed storage internal K of 0".into()));
            }
        }

        let base_addr   = read_addr(cur, sizes.addr)?;
        let _unused     = read_addr(cur, sizes.addr)?;
        let eoa         = read_addr(cur, sizes.addr)?;
        let driver_addr = read_addr(cur, sizes.addr)?;
        let root_entry  = SymbolEntry::decode(cur, sizes)?;

        let fields = LegacyFields { driver_addr, root_entry };
        let layout = if version == VERSION_0 { Layout::V0(fields) } else { Layout::V1(fields) };
        Ok(Self { sizes, base_addr, eoa, status, sym_leaf_k, btree_k, layout })
    }

    fn decode_compact(cur: &mut Cursor<&[u8]>, version: u8, buf: &[u8]) -> Result<Self> {
        let body = buf.len() - CHECKSUM_SIZE;
        let mut hasher = Hasher::new();
        hasher.update(&buf[..body]);
        let computed = hasher.finalize();
        let stored = (&buf[body..]).read_u32::<LittleEndian>()?;
        if stored != computed {
            return Err(FileError::ChecksumMismatch { stored, computed });
        }

        let sizes     = Sizes::new(cur.read_u8()?, cur.read_u8()?)?;
        let status    = StatusFlags::from_bits_truncate(cur.read_u8()?);
        let base_addr = read_addr(cur, sizes.addr)?;
        let ext_addr  = read_addr(cur, sizes.addr)?;
        let eoa       = read_addr(cur, sizes.addr)?;
        let root_addr = read_addr(cur, sizes.addr)?;

        let fields = CompactFields { ext_addr, root_addr };
        let layout = if version == VERSION_2 { Layout::V2(fields) } else { Layout::V3(fields) };
        Ok(Self {
            sizes,
            base_addr,
            eoa,
            status,
            sym_leaf_k: SYM_LEAF_K_DEFAULT,
            btree_k: BtreeK::default(),
            layout,
        })
    }

    /// Release the in-memory superblock, root symbol entry included.
    pub fn free(self) {
        tracing::trace!(version = self.version(), "superblock freed");
    }
}
