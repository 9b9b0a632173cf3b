//! Shared object-header message master table.
//!
//! Only table creation is handled here: the table is allocated with empty
//! list-form indexes and its location is recorded in the superblock
//! extension.
//!
//! ```text
//! "SMTB" then per index:
//!   version(1) type(1) mesg_types(2) min_size(4) list_max(2) btree_min(2)
//!   num_messages(2) index_addr heap_addr
//! crc32(4)
//! ```

use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::Result;
use crate::fields::{write_addr, Sizes};
use crate::file::ContainerFile;
use crate::medium::{MemClass, Medium, ADDR_UNDEF};
use crate::message::SharedTableMessage;
use crate::ohdr::ObjectHeaders;

pub const TABLE_SIGNATURE: &[u8; 4] = b"SMTB";

const INDEX_VERSION: u8    = 0;
const INDEX_TYPE_LIST: u8  = 0;
/// Messages smaller than this are never shared.
const MIN_MESSAGE_SIZE: u32 = 250;
const LIST_MAX: u16        = 50;
const BTREE_MIN: u16       = 40;

/// Encoded size of a master table with `nindexes` indexes.
pub fn table_size(nindexes: u8, sizes: Sizes) -> usize {
    let index = 14 + 2 * sizes.addr as usize;
    TABLE_SIGNATURE.len() + nindexes as usize * index + 4
}

/// A master table whose indexes are all empty lists.
pub fn encode_table(nindexes: u8, sizes: Sizes) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(table_size(nindexes, sizes));
    out.extend_from_slice(TABLE_SIGNATURE);
    for _ in 0..nindexes {
        out.write_u8(INDEX_VERSION)?;
        out.write_u8(INDEX_TYPE_LIST)?;
        out.write_u16::<LittleEndian>(0)?;
        out.write_u32::<LittleEndian>(MIN_MESSAGE_SIZE)?;
        out.write_u16::<LittleEndian>(LIST_MAX)?;
        out.write_u16::<LittleEndian>(BTREE_MIN)?;
        out.write_u16::<LittleEndian>(0)?;
        write_addr(&mut out, ADDR_UNDEF, sizes.addr)?;
        write_addr(&mut out, ADDR_UNDEF, sizes.addr)?;
    }
    let mut hasher = Hasher::new();
    hasher.update(&out);
    out.write_u32::<LittleEndian>(hasher.finalize())?;
    Ok(out)
}

impl<M: Medium, O: ObjectHeaders> ContainerFile<M, O> {
    /// Allocate and write the master table, then record it in the open
    /// extension at `ext_addr`.
    pub(crate) fn sohm_init(&mut self, ext_addr: u64) -> Result<()> {
        let nindexes = self.create.shared_indexes;
        let sizes = self.superblock()?.sizes;
        let table = encode_table(nindexes, sizes)?;

        let table_addr = self.space.alloc(&mut self.medium, MemClass::Ohdr, table.len() as u64)?;
        self.medium.write_at(MemClass::Ohdr, table_addr, &table)?;
        self.create_message(ext_addr, sizes, &SharedTableMessage { table_addr, nindexes })?;
        tracing::debug!(table_addr, nindexes, "shared message table created");
        Ok(())
    }
}
