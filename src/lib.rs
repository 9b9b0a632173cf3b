pub mod error;
pub mod medium;
pub mod signature;
pub mod fields;
pub mod superblock;
pub mod message;
pub mod config;
pub mod cache;
pub mod ohdr;
pub mod space;
pub mod file;
pub mod lifecycle;
pub mod extension;
pub mod sohm;

pub use error::{FileError, Result};
pub use medium::{Medium, MemoryMedium, FileMedium, MemClass, DriverInfo, DriverFeatures, ADDR_UNDEF};
pub use signature::{locate_signature, userblock_locatable, SIGNATURE};
pub use fields::Sizes;
pub use superblock::{Superblock, Layout, BtreeK, StatusFlags};
pub use message::{MessageId, MessageFlags, FsStrategy, ExtensionMessage};
pub use config::{CreateConfig, AccessConfig, FreeSpaceSettings};
pub use ohdr::{ObjectHeaders, MemoryObjectHeaders};
pub use file::ContainerFile;
pub use lifecycle::{LifecycleState, SuperblockSize, select_version};
pub use extension::ExtensionHandle;
