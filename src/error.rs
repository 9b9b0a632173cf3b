use std::io;
use thiserror::Error;

use crate::cache::CacheError;
use crate::message::MessageId;
use crate::ohdr::OhdrError;
use crate::space::SpaceError;

/// Every failure the superblock engine reports to its caller.
///
/// Opening and creating a file abort on any of these. Extension operations
/// on an already-open file surface them without closing the file.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("not a valid container file: signature not found")]
    NotAContainerFile,

    #[error("unsupported superblock version: {0}")]
    UnsupportedVersion(u8),

    #[error("file features require superblock version {required}, but at most {allowed} is permitted")]
    VersionConflict { required: u8, allowed: u8 },

    #[error("superblock extension not permitted with version {version} of superblock")]
    ExtensionNotPermitted { version: u8 },

    #[error("superblock extension already exists at {addr:#x}")]
    ExtensionExists { addr: u64 },

    #[error("unable to open superblock extension at {addr:#x}: {source}")]
    CantOpenExtension {
        addr:   u64,
        #[source]
        source: OhdrError,
    },

    #[error("message {0} does not exist in the superblock extension")]
    MessageAbsent(MessageId),

    #[error("message {0} already exists in the superblock extension")]
    MessageExists(MessageId),

    #[error("user block size {size} must be zero, or a power of two of at least 512 that is a multiple of the file alignment {alignment}")]
    BadUserBlockSize { size: u64, alignment: u64 },

    #[error("file allocation failed: {0}")]
    NoSpace(#[from] SpaceError),

    #[error("unable to load superblock: {0}")]
    CantProtect(#[source] CacheError),

    #[error("unable to mark superblock as dirty: {0}")]
    CantMarkDirty(#[source] CacheError),

    #[error("metadata cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("object header error: {0}")]
    ObjectHeader(#[from] OhdrError),

    #[error("superblock checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("unsupported {field} width: {width} bytes")]
    BadFieldWidth { field: &'static str, width: u8 },

    #[error("value {value:#x} does not fit in a {width}-byte field")]
    FieldOverflow { value: u64, width: u8 },

    #[error("truncated file: end of file {eof:#x} precedes end of allocation {eoa:#x}")]
    Truncated { eof: u64, eoa: u64 },

    #[error("malformed {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FileError>;
