//! Directory entry layer.
//!
//! Directories are cluster chains of Hamming-coded 32-byte records. Every
//! mutation is staged in the journal first, written in place, then committed.

use core::ops::ControlFlow;

use log::{debug, error, warn};

use crate::cluster;
use crate::config::*;
use crate::ecache::{Ecache, EntryKind};
use crate::error::{FsError, Result};
use crate::fat;
use crate::hamming;
use crate::journal::JournalOp;
use crate::structs::{name_hash, DirEntry};
use crate::{BlockDevice, FileSystem};

/// Where a directory walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// The handler asked to stop.
    Stopped,
    /// The chain ended. `slot` is the End marker of `cluster`, or the
    /// entries-per-cluster count when the last cluster has no free tail.
    End { cluster: u32, slot: usize },
}

/// A located directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHit {
    pub entry: DirEntry,
    /// Cluster and slot of the record, unless the hit came from a cache.
    pub location: Option<(u32, usize)>,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Walks the directory chain starting at `ca`, handing every record
    /// before the End marker to `handler` together with its cluster and slot.
    ///
    /// Each visited cluster is written back when the codec corrected any of
    /// its words or the handler changed a record.
    pub fn entry_iterate<F>(&self, ca: u32, mut handler: F) -> Result<Walk>
    where
        F: FnMut(&mut DirEntry, u32, usize) -> ControlFlow<()>,
    {
        let device = &*self.device;
        let per_cluster = self.info.entries_per_cluster();
        let mut ca = ca;
        let mut visited = 0u32;
        loop {
            if !self.info.is_data_cluster(ca) {
                return Err(FsError::BadCluster);
            }
            let raw = cluster::read_cluster(device, &self.info, ca)?;
            let (mut decoded, corrected) = hamming::decode(&raw);

            let mut changed = false;
            let mut stop = None;
            for slot in 0..per_cluster {
                let bytes = &mut decoded[slot * ENTRY_SIZE..(slot + 1) * ENTRY_SIZE];
                let mut entry = DirEntry::from_bytes(bytes);
                if entry.is_end() {
                    stop = Some(Walk::End { cluster: ca, slot });
                    break;
                }
                let before = entry;
                let flow = handler(&mut entry, ca, slot);
                if entry != before {
                    bytes.copy_from_slice(&entry.to_bytes());
                    changed = true;
                }
                if flow.is_break() {
                    stop = Some(Walk::Stopped);
                    break;
                }
            }

            if (corrected > 0 || changed) && !self.options.read_only {
                if corrected > 0 {
                    warn!("entry_iterate: {} corrected words in cluster {}, writing back", corrected, ca);
                }
                cluster::write_cluster(device, &self.info, ca, &hamming::encode(&decoded))?;
            }
            if let Some(walk) = stop {
                return Ok(walk);
            }

            let next = self.fat.read_fat(device, ca);
            if fat::is_end(next) {
                return Ok(Walk::End { cluster: ca, slot: per_cluster });
            }
            if !self.info.is_data_cluster(next) {
                warn!("entry_iterate: chain of cluster {} broken at {:#x}", ca, next);
                return Err(FsError::BadCluster);
            }
            visited += 1;
            if visited >= self.info.total_clusters {
                warn!("entry_iterate: cycle in directory chain at cluster {}", ca);
                return Err(FsError::Corrupted);
            }
            ca = next;
        }
    }

    /// Finds `name` in the directory at `ca`. A cache hit on a directory is
    /// answered from the cache; anything else scans the chain.
    pub fn entry_search(&self, name: &[u8; NAME_LEN], ca: u32, cache: Option<&Ecache>) -> Result<EntryHit> {
        debug!("entry_search(name={:?}, ca={})", String::from_utf8_lossy(name), ca);
        let hash = name_hash(name);
        if let Some((cluster, EntryKind::Directory)) = cache.and_then(|c| c.find(name)) {
            return Ok(EntryHit {
                entry: DirEntry::create(name, true, cluster, 0),
                location: None,
            });
        }

        let mut found = None;
        self.entry_iterate(ca, |entry, cluster, slot| {
            if entry.is_free() || entry.name_hash != hash || entry.name != *name {
                return ControlFlow::Continue(());
            }
            if !entry.is_valid() {
                debug!("entry_search: corrupt record at cluster {} slot {}", cluster, slot);
                return ControlFlow::Continue(());
            }
            found = Some(EntryHit {
                entry: *entry,
                location: Some((cluster, slot)),
            });
            ControlFlow::Break(())
        })?;
        found.ok_or(FsError::NotFound)
    }

    fn locate(&self, name: &[u8; NAME_LEN], ca: u32) -> Result<(DirEntry, u32, usize)> {
        let hit = self.entry_search(name, ca, None)?;
        let (cluster, slot) = hit.location.ok_or(FsError::NotFound)?;
        Ok((hit.entry, cluster, slot))
    }

    fn write_entry(&self, ca: u32, slot: usize, entry: &DirEntry) -> Result<()> {
        let encoded = hamming::encode(&entry.to_bytes());
        cluster::writeoff_cluster(&*self.device, &self.info, ca, slot * ENCODED_ENTRY_SIZE, &encoded)?;
        Ok(())
    }

    /// Clears a staged record whose mutation never reached the directory.
    fn abandon(&self, staged: Option<usize>) {
        if let Err(e) = self.journal.journal_solve_operation(&*self.device, staged) {
            error!("abandon: journal slot {:?} left pending: {}", staged, e);
        }
    }

    /// Allocates a zeroed cluster and marks it End.
    pub(crate) fn alloc_zeroed(&self) -> Result<u32> {
        let device = &*self.device;
        let ca = self.allocator.alloc_cluster(device, &self.fat)?;
        let zeroed = vec![0u8; self.info.cluster_size as usize];
        let result = cluster::write_cluster(device, &self.info, ca, &zeroed)
            .and_then(|_| self.fat.set_cluster_end(device, ca));
        if let Err(e) = result {
            let _ = self.allocator.dealloc_cluster(device, &self.fat, ca);
            return Err(e);
        }
        Ok(ca)
    }

    /// Appends a zeroed cluster after `last`, which must end its chain.
    pub(crate) fn extend_chain(&self, last: u32) -> Result<u32> {
        let device = &*self.device;
        let new = self.alloc_zeroed()?;
        if let Err(e) = self.fat.write_fat(device, last, new) {
            let _ = self.allocator.dealloc_cluster(device, &self.fat, new);
            return Err(e);
        }
        Ok(new)
    }

    /// Stores `entry` in the first free or End slot of the directory at `ca`,
    /// growing the chain by one cluster when it is full.
    /// Returns the cluster and slot written.
    pub fn entry_add(&self, ca: u32, cache: Option<&mut Ecache>, entry: &DirEntry) -> Result<(u32, usize)> {
        if self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        if entry.is_end() || entry.is_free() {
            return Err(FsError::InvalidFileName);
        }
        match self.entry_search(&entry.name, ca, None) {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let mut free = None;
        let walk = self.entry_iterate(ca, |e, cluster, slot| {
            if e.is_free() {
                free = Some((cluster, slot));
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        let (target, slot) = match (free, walk) {
            (Some(pos), _) => pos,
            (None, Walk::End { cluster, slot }) if slot < self.info.entries_per_cluster() => (cluster, slot),
            (None, Walk::End { cluster, .. }) => (self.extend_chain(cluster)?, 0),
            (None, Walk::Stopped) => return Err(FsError::NotFound),
        };

        let entry = entry.normalized();
        let device = &*self.device;
        let staged = self.journal.journal_add_operation(device, JournalOp::Add, target, slot, &entry)?;
        if let Err(e) = self.write_entry(target, slot, &entry) {
            self.abandon(staged);
            return Err(e);
        }
        if let Some(cache) = cache {
            cache.insert(&entry.name, entry.cluster, kind_of(&entry));
        }
        self.journal.journal_solve_operation(device, staged)?;
        debug!("entry_add: {:?} at cluster {} slot {}", String::from_utf8_lossy(&entry.name), target, slot);
        Ok((target, slot))
    }

    /// Replaces the record named `name` with `new`.
    pub fn entry_edit(
        &self,
        ca: u32,
        cache: Option<&mut Ecache>,
        name: &[u8; NAME_LEN],
        new: &DirEntry,
    ) -> Result<DirEntry> {
        if self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        if new.is_end() || new.is_free() {
            return Err(FsError::InvalidFileName);
        }
        let (old, target, slot) = self.locate(name, ca)?;
        let new = new.normalized();

        let device = &*self.device;
        let staged = self.journal.journal_add_operation(device, JournalOp::Edit, target, slot, &new)?;
        if let Err(e) = self.write_entry(target, slot, &new) {
            self.abandon(staged);
            return Err(e);
        }
        if let Some(cache) = cache {
            cache.delete(&old.name);
            cache.insert(&new.name, new.cluster, kind_of(&new));
        }
        self.journal.journal_solve_operation(device, staged)?;
        Ok(new)
    }

    /// Removes the record named `name` and frees everything it owns.
    ///
    /// Once storage has started to be freed the staged delete is kept on
    /// failure, so the next mount tombstones the record instead of leaving it
    /// pointing at free clusters.
    pub fn entry_remove(&self, ca: u32, cache: Option<&mut Ecache>, name: &[u8; NAME_LEN]) -> Result<DirEntry> {
        if self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        let (old, target, slot) = self.locate(name, ca)?;
        let old = old.normalized();

        let device = &*self.device;
        let staged = self.journal.journal_add_operation(device, JournalOp::Delete, target, slot, &old)?;
        if old.is_dir() {
            self.erase_directory(old.cluster, 0)?;
        }
        self.free_chain(old.cluster)?;
        self.write_entry(target, slot, &old.tombstone())?;
        if let Some(cache) = cache {
            cache.delete(&old.name);
        }
        self.journal.journal_solve_operation(device, staged)?;
        debug!("entry_remove: {:?} from cluster {}", String::from_utf8_lossy(&old.name), target);
        Ok(old)
    }

    pub(crate) fn free_chain(&self, ca: u32) -> Result<()> {
        if self.info.is_data_cluster(ca) && ca != self.info.root_cluster {
            self.allocator.dealloc_chain(&*self.device, &self.fat, ca)?;
        }
        Ok(())
    }

    /// Frees the storage of every child of the directory at `ca`.
    /// The directory's own chain is left to the caller.
    pub(crate) fn erase_directory(&self, ca: u32, depth: u32) -> Result<()> {
        if depth >= self.info.total_clusters {
            return Err(FsError::DepthExceeded);
        }
        if !self.info.is_data_cluster(ca) || ca == self.info.root_cluster {
            return Ok(());
        }
        for child in self.read_dir(ca)? {
            if child.name[0] == b'.' {
                continue;
            }
            if child.is_dir() {
                self.erase_directory(child.cluster, depth + 1)?;
            }
            self.free_chain(child.cluster)?;
        }
        Ok(())
    }

    /// Valid, live records of the directory at `ca`.
    pub fn read_dir(&self, ca: u32) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        self.entry_iterate(ca, |entry, _, _| {
            if !entry.is_free() && entry.is_valid() {
                entries.push(*entry);
            }
            ControlFlow::Continue(())
        })?;
        Ok(entries)
    }

    /// Builds a cache of the directory at `ca`.
    pub fn index_content(&self, ca: u32) -> Result<Ecache> {
        let mut cache = Ecache::new();
        for entry in self.read_dir(ca)? {
            cache.insert(&entry.name, entry.cluster, kind_of(&entry));
        }
        Ok(cache)
    }
}

pub(crate) fn kind_of(entry: &DirEntry) -> EntryKind {
    if entry.is_dir() { EntryKind::Directory } else { EntryKind::File }
}
