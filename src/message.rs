//! Messages stored in the superblock extension.
//!
//! Each message type knows its identifier, the header flags it is written
//! with, and its own payload encoding.  Integers are little-endian; address
//! and length fields use the file's widths.

use std::fmt;
use std::io::{Cursor, Read};
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Serialize, Deserialize};

use crate::error::{FileError, Result};
use crate::fields::{read_addr, read_len, write_addr, write_len, Sizes};
use crate::medium::{DriverInfo, ADDR_UNDEF};
use crate::superblock::BtreeK;

/// Object-header message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u16);

impl MessageId {
    pub const NULL: MessageId         = MessageId(0x00);
    pub const SHARED_TABLE: MessageId = MessageId(0x0F);
    pub const BTREE_K: MessageId      = MessageId(0x13);
    pub const DRIVER_INFO: MessageId  = MessageId(0x14);
    pub const FS_INFO: MessageId      = MessageId(0x17);

    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::NULL         => Some("null"),
            Self::SHARED_TABLE => Some("shared message table"),
            Self::BTREE_K      => Some("B-tree 'K' values"),
            Self::DRIVER_INFO  => Some("driver info"),
            Self::FS_INFO      => Some("free-space info"),
            _ => None,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({:#04x})", self.0),
            None => write!(f, "{:#04x}", self.0),
        }
    }
}

bitflags! {
    /// Per-message header flags.
    pub struct MessageFlags: u8 {
        const CONSTANT              = 0x01;
        const SHARED                = 0x02;
        const DONT_SHARE            = 0x04;
        const FAIL_IF_UNKNOWN_WRITE = 0x08;
        const MARK_IF_UNKNOWN       = 0x10;
    }
}

// ── Free-space strategy ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FsStrategy {
    /// Free-space managers with aggregators.
    FsmAggr = 0,
    /// Paged aggregation.
    Page    = 1,
    /// Aggregators only.
    Aggr    = 2,
    /// No free-space tracking.
    None    = 3,
}

impl Default for FsStrategy {
    fn default() -> Self {
        FsStrategy::FsmAggr
    }
}

impl TryFrom<u8> for FsStrategy {
    type Error = FileError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(FsStrategy::FsmAggr),
            1 => Ok(FsStrategy::Page),
            2 => Ok(FsStrategy::Aggr),
            3 => Ok(FsStrategy::None),
            n => Err(FileError::Malformed(format!("free-space strategy {n}"))),
        }
    }
}

// ── Message trait ────────────────────────────────────────────────────────────

/// A typed superblock-extension message.
pub trait ExtensionMessage: Sized {
    const ID: MessageId;
    const FLAGS: MessageFlags;

    fn encode(&self, sizes: Sizes) -> Result<Vec<u8>>;

    fn decode(raw: &[u8], sizes: Sizes) -> Result<Self>;
}

fn check_version(id: MessageId, got: u8, want: u8) -> Result<()> {
    if got != want {
        return Err(FileError::Malformed(format!("{id} message version {got}")));
    }
    Ok(())
}

// ── B-tree K ─────────────────────────────────────────────────────────────────

const BTREE_K_VERSION: u8 = 0;

/// Non-default B-tree fan-out parameters of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtreeKMessage {
    pub btree_k:    BtreeK,
    pub sym_leaf_k: u16,
}

impl ExtensionMessage for BtreeKMessage {
    const ID: MessageId = MessageId::BTREE_K;
    const FLAGS: MessageFlags = MessageFlags::from_bits_truncate(
        MessageFlags::CONSTANT.bits() | MessageFlags::DONT_SHARE.bits(),
    );

    fn encode(&self, _sizes: Sizes) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(7);
        out.write_u8(BTREE_K_VERSION)?;
        out.write_u16::<LittleEndian>(self.btree_k.snode)?;
        out.write_u16::<LittleEndian>(self.btree_k.chunk)?;
        out.write_u16::<LittleEndian>(self.sym_leaf_k)?;
        Ok(out)
    }

    fn decode(raw: &[u8], _sizes: Sizes) -> Result<Self> {
        let mut cur = Cursor::new(raw);
        check_version(Self::ID, cur.read_u8()?, BTREE_K_VERSION)?;
        let snode      = cur.read_u16::<LittleEndian>()?;
        let chunk      = cur.read_u16::<LittleEndian>()?;
        let sym_leaf_k = cur.read_u16::<LittleEndian>()?;
        Ok(Self { btree_k: BtreeK { snode, chunk }, sym_leaf_k })
    }
}

// ── Driver info ──────────────────────────────────────────────────────────────

const DRIVER_INFO_VERSION: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfoMessage(pub DriverInfo);

impl ExtensionMessage for DriverInfoMessage {
    const ID: MessageId = MessageId::DRIVER_INFO;
    const FLAGS: MessageFlags = MessageFlags::DONT_SHARE;

    fn encode(&self, _sizes: Sizes) -> Result<Vec<u8>> {
        let data = &self.0.data;
        let len = u16::try_from(data.len()).map_err(|_| FileError::FieldOverflow {
            value: data.len() as u64,
            width: 2,
        })?;
        let mut out = Vec::with_capacity(11 + data.len());
        out.write_u8(DRIVER_INFO_VERSION)?;
        out.extend_from_slice(&self.0.name);
        out.write_u16::<LittleEndian>(len)?;
        out.extend_from_slice(data);
        Ok(out)
    }

    fn decode(raw: &[u8], _sizes: Sizes) -> Result<Self> {
        let mut cur = Cursor::new(raw);
        check_version(Self::ID, cur.read_u8()?, DRIVER_INFO_VERSION)?;
        let mut name = [0u8; 8];
        cur.read_exact(&mut name)?;
        let len = cur.read_u16::<LittleEndian>()? as usize;
        let mut data = vec![0u8; len];
        cur.read_exact(&mut data)?;
        Ok(Self(DriverInfo { name, data }))
    }
}

// ── Free-space info ──────────────────────────────────────────────────────────

const FS_INFO_VERSION: u8 = 1;

/// Free-space manager addresses persisted per file, one per memory class.
pub const FS_MANAGER_SLOTS: usize = 6;

/// Free-space strategy and parameters of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfoMessage {
    pub strategy:           FsStrategy,
    pub persist:            bool,
    pub threshold:          u64,
    pub page_size:          u64,
    pub page_end_threshold: u16,
    /// End of allocation before the free-space managers were written.
    pub eoa_pre_fsm:        u64,
    /// Manager addresses; only stored when `persist` is set.
    pub fs_addrs:           [u64; FS_MANAGER_SLOTS],
}

impl FsInfoMessage {
    pub fn new(strategy: FsStrategy, persist: bool, threshold: u64, page_size: u64) -> Self {
        Self {
            strategy,
            persist,
            threshold,
            page_size,
            page_end_threshold: 0,
            eoa_pre_fsm: ADDR_UNDEF,
            fs_addrs: [ADDR_UNDEF; FS_MANAGER_SLOTS],
        }
    }
}

impl ExtensionMessage for FsInfoMessage {
    const ID: MessageId = MessageId::FS_INFO;
    const FLAGS: MessageFlags = MessageFlags::from_bits_truncate(
        MessageFlags::DONT_SHARE.bits() | MessageFlags::MARK_IF_UNKNOWN.bits(),
    );

    fn encode(&self, sizes: Sizes) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u8(FS_INFO_VERSION)?;
        out.write_u8(self.strategy as u8)?;
        out.write_u8(self.persist as u8)?;
        write_len(&mut out, self.threshold, sizes.len)?;
        write_len(&mut out, self.page_size, sizes.len)?;
        out.write_u16::<LittleEndian>(self.page_end_threshold)?;
        write_addr(&mut out, self.eoa_pre_fsm, sizes.addr)?;
        if self.persist {
            for &addr in &self.fs_addrs {
                write_addr(&mut out, addr, sizes.addr)?;
            }
        }
        Ok(out)
    }

    fn decode(raw: &[u8], sizes: Sizes) -> Result<Self> {
        let mut cur = Cursor::new(raw);
        check_version(Self::ID, cur.read_u8()?, FS_INFO_VERSION)?;
        let strategy  = FsStrategy::try_from(cur.read_u8()?)?;
        let persist   = cur.read_u8()? != 0;
        let threshold = read_len(&mut cur, sizes.len)?;
        let page_size = read_len(&mut cur, sizes.len)?;
        let page_end_threshold = cur.read_u16::<LittleEndian>()?;
        let eoa_pre_fsm = read_addr(&mut cur, sizes.addr)?;
        let mut fs_addrs = [ADDR_UNDEF; FS_MANAGER_SLOTS];
        if persist {
            for slot in fs_addrs.iter_mut() {
                *slot = read_addr(&mut cur, sizes.addr)?;
            }
        }
        Ok(Self { strategy, persist, threshold, page_size, page_end_threshold, eoa_pre_fsm, fs_addrs })
    }
}

// ── Shared message table ─────────────────────────────────────────────────────

const SHARED_TABLE_VERSION: u8 = 0;

/// Location of the shared object-header message master table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedTableMessage {
    pub table_addr: u64,
    pub nindexes:   u8,
}

impl ExtensionMessage for SharedTableMessage {
    const ID: MessageId = MessageId::SHARED_TABLE;
    const FLAGS: MessageFlags = MessageFlags::from_bits_truncate(
        MessageFlags::CONSTANT.bits() | MessageFlags::DONT_SHARE.bits(),
    );

    fn encode(&self, sizes: Sizes) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u8(SHARED_TABLE_VERSION)?;
        write_addr(&mut out, self.table_addr, sizes.addr)?;
        out.write_u8(self.nindexes)?;
        Ok(out)
    }

    fn decode(raw: &[u8], sizes: Sizes) -> Result<Self> {
        let mut cur = Cursor::new(raw);
        check_version(Self::ID, cur.read_u8()?, SHARED_TABLE_VERSION)?;
        let table_addr = read_addr(&mut cur, sizes.addr)?;
        let nindexes = cur.read_u8()?;
        Ok(Self { table_addr, nindexes })
    }
}
