//! NiFAT is a FAT32-derived file system that keeps working on media
//! suffering random bit flips.
//! No permissions, timestamps or long names.
//!
//! NiFAT's on-disk layout:
//! - Reserved sectors
//! - FAT copies (plain 32-bit entries, repaired by majority vote)
//! - Data clusters, starting with the root directory
//!
//! Boot sector copies and journal copies are scattered through the data
//! region at hashed positions; the clusters they occupy are reserved in the FAT.
//! Boot sectors, directory entries and journal records are Hamming (15,11)
//! coded, doubling their size on disk. File data is stored as is.
//!
//! NiFAT's layers (from bottom to top):
//! 1. Block Device: Sector access to the medium.                     | User implemented (hardware-specific)
//! 2. Codec/Cluster: Hamming coding and raw cluster I/O.             | Fs implemented
//! 3. FAT/Allocator: Voted FAT access, free map, cluster allocation. | Fs implemented
//! 4. Journal: Redundant ring of pending directory edits.            | Fs implemented
//! 5. Directory/Path: Entry search, edit and 8.3 path resolution.    | Fs implemented
//! 6. Content table: Open handles with optional directory caches.    | Fs implemented
//! 7. FileSystem: The interface handed to users.                     | Fs implemented

extern crate alloc;

mod config;
mod block_dev;
mod lock;
mod hamming;
mod structs;
mod bootsector;
mod fat;
mod bitmap;
mod allocator;
mod cluster;
mod journal;
mod ecache;
mod ctable;
mod directory;
mod path;
mod file;
mod fs;
mod error;

pub use block_dev::BlockDevice;
pub use config::*;
pub use lock::{LockWord, Locked, ReadGuard, WriteGuard};
pub use hamming::{decode, decode_byte, encode, encode_byte};
pub use structs::*;
pub use bootsector::{bootsector_sector, VolumeInfo};
pub use fat::{majority_vote, Fat};
pub use bitmap::FreeMap;
pub use allocator::Allocator;
pub use journal::{journal_sector, Journal, JournalOp, JournalRecord};
pub use ecache::{Ecache, EntryKind};
pub use ctable::{ContentKind, ContentTable, Handle, OpenContent, OpenMode};
pub use directory::{EntryHit, Walk};
pub use path::{components, from_fatname, to_fatname, Create, Resolved};
pub use fs::*;
pub use error::FsError as Error;
pub use error::Result;
