//! Table of open contents.
//!
//! A fixed number of slots; each one is empty or owns one open file or
//! directory. Slot lifecycle changes take the table-wide write lock.

use bitflags::bitflags;
use log::debug;

use crate::config::*;
use crate::ecache::{Ecache, EntryKind};
use crate::error::{FsError, Result};
use crate::lock::Locked;
use crate::structs::DirEntry;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const CREATE = 0x04;
        /// Target must be a file.
        const FILE = 0x08;
        /// Target must be a directory.
        const DIRECTORY = 0x10;
    }
}

/// Index of an open content in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    File { name: [u8; BASE_LEN], extension: [u8; EXT_LEN] },
    Directory { name: [u8; NAME_LEN] },
    Unknown,
}

impl ContentKind {
    pub fn from_entry(entry: &DirEntry) -> Self {
        if entry.is_dir() {
            return Self::Directory { name: entry.name };
        }
        let mut name = [0u8; BASE_LEN];
        let mut extension = [0u8; EXT_LEN];
        name.copy_from_slice(&entry.name[..BASE_LEN]);
        extension.copy_from_slice(&entry.name[BASE_LEN..]);
        Self::File { name, extension }
    }

    pub fn entry_kind(&self) -> Option<EntryKind> {
        match self {
            Self::File { .. } => Some(EntryKind::File),
            Self::Directory { .. } => Some(EntryKind::Directory),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenContent {
    pub kind: ContentKind,
    pub mode: OpenMode,
    /// First cluster of the directory holding this content's entry.
    pub parent_cluster: u32,
    pub data_cluster: u32,
    pub meta: DirEntry,
    pub index: Option<Ecache>,
}

impl OpenContent {
    pub fn new(meta: DirEntry, parent_cluster: u32, mode: OpenMode) -> Self {
        Self {
            kind: ContentKind::from_entry(&meta),
            mode,
            parent_cluster,
            data_cluster: meta.cluster,
            meta,
            index: None,
        }
    }
}

#[derive(Debug)]
enum Slot {
    Empty,
    Reserved,
    Open(Box<OpenContent>),
}

#[derive(Debug)]
pub struct ContentTable {
    slots: Locked<Vec<Slot>>,
}

impl ContentTable {
    pub fn new(capacity: usize, lock_retries: u32) -> Self {
        Self {
            slots: Locked::new((0..capacity).map(|_| Slot::Empty).collect(), lock_retries),
        }
    }

    /// Reserves an empty slot.
    pub fn alloc(&self) -> Result<Handle> {
        let mut slots = self.slots.write()?;
        let index = slots
            .iter()
            .position(|s| matches!(s, Slot::Empty))
            .ok_or(FsError::TableFull)?;
        slots[index] = Slot::Reserved;
        Ok(Handle(index))
    }

    /// Fills a reserved slot.
    pub fn setup(&self, handle: Handle, content: OpenContent) -> Result<()> {
        let mut slots = self.slots.write()?;
        match slots.get_mut(handle.0) {
            Some(slot @ Slot::Reserved) => {
                debug!("ctable: slot {} holds cluster {}", handle.0, content.data_cluster);
                *slot = Slot::Open(Box::new(content));
                Ok(())
            }
            _ => Err(FsError::InvalidHandle),
        }
    }

    /// Empties a slot, dropping its index.
    pub fn destroy(&self, handle: Handle) -> Result<()> {
        let mut slots = self.slots.write()?;
        match slots.get_mut(handle.0) {
            Some(slot @ (Slot::Open(_) | Slot::Reserved)) => {
                *slot = Slot::Empty;
                Ok(())
            }
            _ => Err(FsError::InvalidHandle),
        }
    }

    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&OpenContent) -> R) -> Result<R> {
        let slots = self.slots.read()?;
        match slots.get(handle.0) {
            Some(Slot::Open(content)) => Ok(f(content)),
            _ => Err(FsError::InvalidHandle),
        }
    }

    pub fn with_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut OpenContent) -> R) -> Result<R> {
        let mut slots = self.slots.write()?;
        match slots.get_mut(handle.0) {
            Some(Slot::Open(content)) => Ok(f(content)),
            _ => Err(FsError::InvalidHandle),
        }
    }

    /// Copy of the slot without its index.
    pub fn get(&self, handle: Handle) -> Result<OpenContent> {
        self.with(handle, |c| OpenContent { index: None, ..c.clone() })
    }

    pub fn meta(&self, handle: Handle) -> Result<DirEntry> {
        self.with(handle, |c| c.meta)
    }

    pub fn data_cluster(&self, handle: Handle) -> Result<u32> {
        self.with(handle, |c| c.data_cluster)
    }

    pub fn set_meta(&self, handle: Handle, meta: DirEntry) -> Result<()> {
        self.with_mut(handle, |c| {
            c.kind = ContentKind::from_entry(&meta);
            c.data_cluster = meta.cluster;
            c.meta = meta;
        })
    }

    pub fn set_index(&self, handle: Handle, index: Option<Ecache>) -> Result<()> {
        self.with_mut(handle, |c| c.index = index)
    }

    /// Takes the index of an open handle on directory `ca` for the duration
    /// of a mutation. Other handles on that directory lose their index, as
    /// it would go stale.
    pub fn take_dir_index(&self, ca: u32) -> Result<Option<(Handle, Ecache)>> {
        let mut slots = self.slots.write()?;
        let mut taken = None;
        for (i, slot) in slots.iter_mut().enumerate() {
            if let Slot::Open(content) = slot {
                if content.data_cluster == ca && content.index.is_some() {
                    let index = content.index.take();
                    if taken.is_none() {
                        taken = index.map(|idx| (Handle(i), idx));
                    }
                }
            }
        }
        Ok(taken)
    }

    /// Handles currently open.
    pub fn handles(&self) -> Result<Vec<Handle>> {
        let slots = self.slots.read()?;
        Ok(slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Slot::Open(_)))
            .map(|(i, _)| Handle(i))
            .collect())
    }

    pub fn capacity(&self) -> Result<usize> {
        Ok(self.slots.read()?.len())
    }
}
