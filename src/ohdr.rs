//! Object headers: the message containers the superblock extension lives in.
//!
//! [`ObjectHeaders`] is the interface the engine drives.  The in-memory
//! [`MemoryObjectHeaders`] models the parts of a header the engine can
//! observe: chunks with a fixed byte budget, null messages covering unused
//! space, continuation chunks when a message does not fit, and the link,
//! reference and open counts.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::message::{MessageFlags, MessageId};

/// Fixed prefix at the start of a header's first chunk.
pub const HEADER_PREFIX: usize = 16;
/// Per-message header inside a chunk.
pub const MESSAGE_HEADER: usize = 8;
/// Default message space of a new header.
pub const MIN_HEADER_SIZE: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OhdrError {
    #[error("no object header at {addr:#x}")]
    NotFound { addr: u64 },

    #[error("object header already exists at {addr:#x}")]
    AlreadyExists { addr: u64 },

    #[error("object header at {addr:#x} is not open")]
    NotOpen { addr: u64 },

    #[error("object header at {addr:#x} is too small: {size} bytes")]
    TooSmall { addr: u64, size: usize },

    #[error("message {id} not found in object header at {addr:#x}")]
    MessageNotFound { addr: u64, id: MessageId },

    #[error("cannot store a null message explicitly")]
    NullMessage,

    #[error("{what} count underflow in object header at {addr:#x}")]
    Underflow { addr: u64, what: &'static str },
}

pub type Result<T> = std::result::Result<T, OhdrError>;

/// Layout summary of one header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub nchunks: usize,
    /// Messages of every type, null messages included.
    pub nmesgs:  usize,
    /// Bytes occupied by all chunks.
    pub total:   u64,
    /// Bytes held by null messages, their headers included.
    pub free:    u64,
}

pub trait ObjectHeaders {
    /// Create a header whose first chunk spans `size` bytes at `addr`.
    /// The new header is open and holds one reference.
    fn create(&mut self, addr: u64, size: usize) -> Result<()>;

    fn open(&mut self, addr: u64) -> Result<()>;

    fn close(&mut self, addr: u64) -> Result<()>;

    /// Adjust the persistent link count; returns the new count.
    fn link(&mut self, addr: u64, adjust: i32) -> Result<u32>;

    /// Drop one in-memory reference.
    fn dec_rc(&mut self, addr: u64) -> Result<()>;

    fn msg_exists(&self, addr: u64, id: MessageId) -> Result<bool>;

    fn msg_create(
        &mut self,
        addr: u64,
        id: MessageId,
        flags: MessageFlags,
        update_time: bool,
        raw: &[u8],
    ) -> Result<()>;

    fn msg_write(
        &mut self,
        addr: u64,
        id: MessageId,
        flags: MessageFlags,
        update_time: bool,
        raw: &[u8],
    ) -> Result<()>;

    fn msg_read(&self, addr: u64, id: MessageId) -> Result<Vec<u8>>;

    fn msg_remove(&mut self, addr: u64, id: MessageId) -> Result<()>;

    fn msg_count(&self, addr: u64, id: MessageId) -> Result<usize>;

    fn hdr_info(&self, addr: u64) -> Result<HeaderInfo>;

    /// Destroy the header.  Returns the size of the first chunk, which the
    /// caller allocated and must free.
    fn delete(&mut self, addr: u64) -> Result<usize>;
}

impl<O: ObjectHeaders + ?Sized> ObjectHeaders for &mut O {
    fn create(&mut self, addr: u64, size: usize) -> Result<()> { (**self).create(addr, size) }
    fn open(&mut self, addr: u64) -> Result<()>                { (**self).open(addr) }
    fn close(&mut self, addr: u64) -> Result<()>               { (**self).close(addr) }
    fn link(&mut self, addr: u64, adjust: i32) -> Result<u32>  { (**self).link(addr, adjust) }
    fn dec_rc(&mut self, addr: u64) -> Result<()>              { (**self).dec_rc(addr) }
    fn msg_exists(&self, addr: u64, id: MessageId) -> Result<bool> {
        (**self).msg_exists(addr, id)
    }
    fn msg_create(&mut self, addr: u64, id: MessageId, flags: MessageFlags, update_time: bool, raw: &[u8]) -> Result<()> {
        (**self).msg_create(addr, id, flags, update_time, raw)
    }
    fn msg_write(&mut self, addr: u64, id: MessageId, flags: MessageFlags, update_time: bool, raw: &[u8]) -> Result<()> {
        (**self).msg_write(addr, id, flags, update_time, raw)
    }
    fn msg_read(&self, addr: u64, id: MessageId) -> Result<Vec<u8>> { (**self).msg_read(addr, id) }
    fn msg_remove(&mut self, addr: u64, id: MessageId) -> Result<()> { (**self).msg_remove(addr, id) }
    fn msg_count(&self, addr: u64, id: MessageId) -> Result<usize>  { (**self).msg_count(addr, id) }
    fn hdr_info(&self, addr: u64) -> Result<HeaderInfo>            { (**self).hdr_info(addr) }
    fn delete(&mut self, addr: u64) -> Result<usize>               { (**self).delete(addr) }
}

// ── In-memory headers ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Message {
    id:    MessageId,
    flags: MessageFlags,
    raw:   Vec<u8>,
    /// Payload bytes reserved in the chunk; at least `raw.len()`.
    slot:  usize,
}

impl Message {
    fn null(slot: usize) -> Self {
        Self { id: MessageId::NULL, flags: MessageFlags::empty(), raw: Vec::new(), slot }
    }

    fn is_null(&self) -> bool {
        self.id == MessageId::NULL
    }
}

#[derive(Debug, Clone)]
struct Chunk {
    size:     usize,
    messages: Vec<Message>,
}

impl Chunk {
    /// A chunk whose message space is one null message.
    fn empty(size: usize, prefix: usize) -> Self {
        Self { size, messages: vec![Message::null(size - prefix - MESSAGE_HEADER)] }
    }

    /// Place `msg` in the first null slot large enough, splitting off the
    /// remainder when it can hold another null message.
    fn place(&mut self, msg: Message) -> Option<Message> {
        let need = msg.raw.len();
        let pos = self.messages.iter().position(|m| {
            m.is_null() && (m.slot == need || m.slot >= need + MESSAGE_HEADER)
        });
        let Some(pos) = pos else { return Some(msg) };
        let spare = self.messages[pos].slot - need;
        let slot = if spare >= MESSAGE_HEADER { need } else { need + spare };
        self.messages[pos] = Message { slot, ..msg };
        if spare >= MESSAGE_HEADER {
            self.messages.insert(pos + 1, Message::null(spare - MESSAGE_HEADER));
        }
        None
    }

    /// Turn the message at `pos` into a null and merge it with null neighbours.
    fn release(&mut self, pos: usize) {
        let slot = self.messages[pos].slot;
        self.messages[pos] = Message::null(slot);
        if pos + 1 < self.messages.len() && self.messages[pos + 1].is_null() {
            let next = self.messages.remove(pos + 1);
            self.messages[pos].slot += MESSAGE_HEADER + next.slot;
        }
        if pos > 0 && self.messages[pos - 1].is_null() {
            let this = self.messages.remove(pos);
            self.messages[pos - 1].slot += MESSAGE_HEADER + this.slot;
        }
    }

    fn all_null(&self) -> bool {
        self.messages.iter().all(Message::is_null)
    }
}

#[derive(Debug, Clone)]
struct Header {
    chunks: Vec<Chunk>,
    nlink:  u32,
    rc:     u32,
    nopen:  u32,
    mtime:  DateTime<Utc>,
}

impl Header {
    fn find(&self, id: MessageId) -> Option<(usize, usize)> {
        self.chunks.iter().enumerate().find_map(|(c, chunk)| {
            chunk.messages.iter().position(|m| m.id == id).map(|m| (c, m))
        })
    }

    fn insert(&mut self, msg: Message) {
        let mut msg = msg;
        for chunk in &mut self.chunks {
            match chunk.place(msg) {
                None => return,
                Some(back) => msg = back,
            }
        }
        let size = MIN_HEADER_SIZE.max(msg.raw.len() + 2 * MESSAGE_HEADER);
        let mut chunk = Chunk::empty(size, 0);
        let placed = chunk.place(msg);
        debug_assert!(placed.is_none());
        self.chunks.push(chunk);
    }

    /// Drop continuation chunks that no longer hold anything.
    fn condense(&mut self) {
        while self.chunks.len() > 1 && self.chunks.last().map_or(false, Chunk::all_null) {
            self.chunks.pop();
        }
    }
}

/// Object headers held entirely in memory, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectHeaders {
    headers: BTreeMap<u64, Header>,
}

impl MemoryObjectHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.headers.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn nlink(&self, addr: u64) -> Option<u32> {
        self.headers.get(&addr).map(|h| h.nlink)
    }

    pub fn refcount(&self, addr: u64) -> Option<u32> {
        self.headers.get(&addr).map(|h| h.rc)
    }

    pub fn open_count(&self, addr: u64) -> Option<u32> {
        self.headers.get(&addr).map(|h| h.nopen)
    }

    pub fn mtime(&self, addr: u64) -> Option<DateTime<Utc>> {
        self.headers.get(&addr).map(|h| h.mtime)
    }

    /// Message identifiers in storage order, null messages excluded.
    pub fn message_ids(&self, addr: u64) -> Option<Vec<MessageId>> {
        self.headers.get(&addr).map(|h| {
            h.chunks
                .iter()
                .flat_map(|c| c.messages.iter())
                .filter(|m| !m.is_null())
                .map(|m| m.id)
                .collect()
        })
    }

    fn header(&self, addr: u64) -> Result<&Header> {
        self.headers.get(&addr).ok_or(OhdrError::NotFound { addr })
    }

    fn open_header(&mut self, addr: u64) -> Result<&mut Header> {
        let h = self.headers.get_mut(&addr).ok_or(OhdrError::NotFound { addr })?;
        if h.nopen == 0 {
            return Err(OhdrError::NotOpen { addr });
        }
        Ok(h)
    }
}

impl ObjectHeaders for MemoryObjectHeaders {
    fn create(&mut self, addr: u64, size: usize) -> Result<()> {
        if self.headers.contains_key(&addr) {
            return Err(OhdrError::AlreadyExists { addr });
        }
        if size < HEADER_PREFIX + MESSAGE_HEADER {
            return Err(OhdrError::TooSmall { addr, size });
        }
        self.headers.insert(addr, Header {
            chunks: vec![Chunk::empty(size, HEADER_PREFIX)],
            nlink:  0,
            rc:     1,
            nopen:  1,
            mtime:  Utc::now(),
        });
        tracing::trace!(addr, size, "object header created");
        Ok(())
    }

    fn open(&mut self, addr: u64) -> Result<()> {
        let h = self.headers.get_mut(&addr).ok_or(OhdrError::NotFound { addr })?;
        h.nopen += 1;
        Ok(())
    }

    fn close(&mut self, addr: u64) -> Result<()> {
        let h = self.open_header(addr)?;
        h.nopen -= 1;
        Ok(())
    }

    fn link(&mut self, addr: u64, adjust: i32) -> Result<u32> {
        let h = self.headers.get_mut(&addr).ok_or(OhdrError::NotFound { addr })?;
        let n = i64::from(h.nlink) + i64::from(adjust);
        h.nlink = u32::try_from(n).map_err(|_| OhdrError::Underflow { addr, what: "link" })?;
        Ok(h.nlink)
    }

    fn dec_rc(&mut self, addr: u64) -> Result<()> {
        let h = self.headers.get_mut(&addr).ok_or(OhdrError::NotFound { addr })?;
        h.rc = h.rc.checked_sub(1).ok_or(OhdrError::Underflow { addr, what: "reference" })?;
        Ok(())
    }

    fn msg_exists(&self, addr: u64, id: MessageId) -> Result<bool> {
        Ok(self.header(addr)?.find(id).is_some())
    }

    fn msg_create(
        &mut self,
        addr: u64,
        id: MessageId,
        flags: MessageFlags,
        update_time: bool,
        raw: &[u8],
    ) -> Result<()> {
        if id == MessageId::NULL {
            return Err(OhdrError::NullMessage);
        }
        let h = self.open_header(addr)?;
        h.insert(Message { id, flags, raw: raw.to_vec(), slot: raw.len() });
        if update_time {
            h.mtime = Utc::now();
        }
        Ok(())
    }

    fn msg_write(
        &mut self,
        addr: u64,
        id: MessageId,
        flags: MessageFlags,
        update_time: bool,
        raw: &[u8],
    ) -> Result<()> {
        let h = self.open_header(addr)?;
        let (c, m) = h.find(id).ok_or(OhdrError::MessageNotFound { addr, id })?;
        let chunk = &mut h.chunks[c];
        let slot = chunk.messages[m].slot;
        if raw.len() <= slot {
            let spare = slot - raw.len();
            let msg = &mut chunk.messages[m];
            msg.raw = raw.to_vec();
            msg.flags = flags;
            if spare >= MESSAGE_HEADER {
                msg.slot = raw.len();
                chunk.messages.insert(m + 1, Message::null(spare - MESSAGE_HEADER));
                // Merge the new null with a following one.
                chunk.release(m + 1);
            }
        } else {
            chunk.release(m);
            h.insert(Message { id, flags, raw: raw.to_vec(), slot: raw.len() });
            h.condense();
        }
        if update_time {
            h.mtime = Utc::now();
        }
        Ok(())
    }

    fn msg_read(&self, addr: u64, id: MessageId) -> Result<Vec<u8>> {
        let h = self.header(addr)?;
        let (c, m) = h.find(id).ok_or(OhdrError::MessageNotFound { addr, id })?;
        Ok(h.chunks[c].messages[m].raw.clone())
    }

    fn msg_remove(&mut self, addr: u64, id: MessageId) -> Result<()> {
        let h = self.open_header(addr)?;
        let (c, m) = h.find(id).ok_or(OhdrError::MessageNotFound { addr, id })?;
        h.chunks[c].release(m);
        h.condense();
        Ok(())
    }

    fn msg_count(&self, addr: u64, id: MessageId) -> Result<usize> {
        let h = self.header(addr)?;
        Ok(h.chunks.iter().flat_map(|c| c.messages.iter()).filter(|m| m.id == id).count())
    }

    fn hdr_info(&self, addr: u64) -> Result<HeaderInfo> {
        let h = self.header(addr)?;
        let messages = || h.chunks.iter().flat_map(|c| c.messages.iter());
        Ok(HeaderInfo {
            nchunks: h.chunks.len(),
            nmesgs:  messages().count(),
            total:   h.chunks.iter().map(|c| c.size as u64).sum(),
            free:    messages()
                .filter(|m| m.is_null())
                .map(|m| (MESSAGE_HEADER + m.slot) as u64)
                .sum(),
        })
    }

    fn delete(&mut self, addr: u64) -> Result<usize> {
        let h = self.headers.remove(&addr).ok_or(OhdrError::NotFound { addr })?;
        tracing::trace!(addr, nlink = h.nlink, "object header deleted");
        Ok(h.chunks[0].size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: u64 = 96;
    const SIZE: usize = MIN_HEADER_SIZE + HEADER_PREFIX;

    fn with_header() -> MemoryObjectHeaders {
        let mut oh = MemoryObjectHeaders::new();
        oh.create(ADDR, SIZE).unwrap();
        oh
    }

    fn create(oh: &mut MemoryObjectHeaders, id: u16, raw: &[u8]) {
        oh.msg_create(ADDR, MessageId(id), MessageFlags::empty(), false, raw).unwrap();
    }

    #[test]
    fn new_header_is_one_null_message() {
        let oh = with_header();
        let info = oh.hdr_info(ADDR).unwrap();
        assert_eq!(info, HeaderInfo {
            nchunks: 1,
            nmesgs:  1,
            total:   SIZE as u64,
            free:    MIN_HEADER_SIZE as u64,
        });
        assert_eq!(oh.msg_count(ADDR, MessageId::NULL).unwrap(), 1);
        assert_eq!(oh.refcount(ADDR), Some(1));
        assert_eq!(oh.open_count(ADDR), Some(1));
    }

    #[test]
    fn removing_every_message_leaves_only_nulls() {
        let mut oh = with_header();
        create(&mut oh, 0x13, &[1; 7]);
        create(&mut oh, 0x17, &[2; 30]);
        assert_eq!(oh.message_ids(ADDR).unwrap(), vec![MessageId(0x13), MessageId(0x17)]);

        oh.msg_remove(ADDR, MessageId(0x13)).unwrap();
        let info = oh.hdr_info(ADDR).unwrap();
        assert_eq!(info.nmesgs, 3);
        assert_eq!(oh.msg_count(ADDR, MessageId::NULL).unwrap(), 2);

        oh.msg_remove(ADDR, MessageId(0x17)).unwrap();
        let info = oh.hdr_info(ADDR).unwrap();
        assert_eq!(info.nmesgs, 1, "adjacent nulls merge");
        assert_eq!(info.free, MIN_HEADER_SIZE as u64);
    }

    #[test]
    fn overflow_goes_to_a_continuation_chunk_and_is_condensed_away() {
        let mut oh = with_header();
        create(&mut oh, 1, &[0; 200]);
        create(&mut oh, 2, &[0; 100]);
        assert_eq!(oh.hdr_info(ADDR).unwrap().nchunks, 2);

        oh.msg_remove(ADDR, MessageId(2)).unwrap();
        assert_eq!(oh.hdr_info(ADDR).unwrap().nchunks, 1);
        assert!(oh.msg_exists(ADDR, MessageId(1)).unwrap());
    }

    #[test]
    fn write_replaces_payload_in_place_or_moves_it() {
        let mut oh = with_header();
        create(&mut oh, 5, b"first payload");
        oh.msg_write(ADDR, MessageId(5), MessageFlags::empty(), true, b"second").unwrap();
        assert_eq!(oh.msg_read(ADDR, MessageId(5)).unwrap(), b"second");

        let big = vec![9u8; 120];
        oh.msg_write(ADDR, MessageId(5), MessageFlags::empty(), true, &big).unwrap();
        assert_eq!(oh.msg_read(ADDR, MessageId(5)).unwrap(), big);
        assert_eq!(oh.msg_count(ADDR, MessageId(5)).unwrap(), 1);
        assert_eq!(oh.hdr_info(ADDR).unwrap().nchunks, 1);
    }

    #[test]
    fn missing_message_and_closed_header_are_errors() {
        let mut oh = with_header();
        assert!(matches!(
            oh.msg_write(ADDR, MessageId(3), MessageFlags::empty(), false, b"x"),
            Err(OhdrError::MessageNotFound { id: MessageId(3), .. })
        ));
        oh.close(ADDR).unwrap();
        assert!(matches!(oh.msg_remove(ADDR, MessageId(3)), Err(OhdrError::NotOpen { addr: ADDR })));
        assert!(matches!(oh.open(7), Err(OhdrError::NotFound { addr: 7 })));
    }

    #[test]
    fn link_and_reference_counts() {
        let mut oh = with_header();
        assert_eq!(oh.link(ADDR, 1).unwrap(), 1);
        assert!(matches!(oh.link(ADDR, -2), Err(OhdrError::Underflow { .. })));
        oh.dec_rc(ADDR).unwrap();
        assert!(oh.dec_rc(ADDR).is_err());
        assert_eq!(oh.delete(ADDR).unwrap(), SIZE);
        assert!(oh.is_empty());
    }
}
