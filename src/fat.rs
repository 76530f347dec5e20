//! Redundant FAT access.
//!
//! Every FAT copy holds the same table of little-endian `u32` values. Reads
//! vote across the copies and rewrite any copy that disagrees with the winner.
//! Writes go to every copy.

use core::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, warn};

use crate::bootsector::VolumeInfo;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::BlockDevice;

const UNCACHED: u32 = 0xFFFF_FFFF;

pub fn is_free(value: u32) -> bool {
    value == FAT_ENTRY_FREE
}

pub fn is_end(value: u32) -> bool {
    value == FAT_ENTRY_END
}

pub fn is_bad(value: u32) -> bool {
    value == FAT_ENTRY_BAD
}

pub fn is_reserved(value: u32) -> bool {
    value == FAT_ENTRY_RESERVED
}

/// Streaming majority vote.
///
/// A sample equal to the candidate raises its confidence, any other sample
/// lowers it; once confidence drops below zero the current sample takes over.
pub fn majority_vote<T: PartialEq + Copy>(samples: impl IntoIterator<Item = T>) -> Option<T> {
    let mut candidate = None;
    let mut confidence = 0i32;
    for sample in samples {
        match candidate {
            Some(c) if c == sample => confidence += 1,
            Some(_) => {
                confidence -= 1;
                if confidence < 0 {
                    candidate = Some(sample);
                    confidence = 0;
                }
            }
            None => candidate = Some(sample),
        }
    }
    candidate
}

#[derive(Debug)]
pub struct Fat {
    info: VolumeInfo,
    mirror: Option<Box<[AtomicU32]>>,
    read_only: bool,
}

impl Fat {
    pub fn new(info: VolumeInfo, with_mirror: bool, read_only: bool) -> Self {
        let mirror = with_mirror.then(|| (0..info.total_clusters).map(|_| AtomicU32::new(UNCACHED)).collect());
        Self { info, mirror, read_only }
    }

    fn cached(&self, ca: u32) -> Option<u32> {
        let value = self.mirror.as_ref()?.get(ca as usize)?.load(Ordering::Relaxed);
        (value != UNCACHED).then_some(value)
    }

    fn remember(&self, ca: u32, value: u32) {
        if let Some(slot) = self.mirror.as_ref().and_then(|m| m.get(ca as usize)) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    fn read_copy<D: BlockDevice + ?Sized>(&self, device: &D, copy: u32, ca: u32) -> Result<u32> {
        let (sector, offset) = self.info.fat_location(copy, ca);
        let mut buf = [0u8; FAT_ENTRY_SIZE];
        device.read_sector(sector as usize, offset as usize, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Voted FAT value of `ca`. Out-of-range or unreadable clusters read as Bad.
    pub fn read_fat<D: BlockDevice + ?Sized>(&self, device: &D, ca: u32) -> u32 {
        if ca >= self.info.total_clusters {
            return FAT_ENTRY_BAD;
        }
        if let Some(value) = self.cached(ca) {
            return value;
        }

        let samples: Vec<Option<u32>> = (0..self.info.fat_count)
            .map(|copy| self.read_copy(device, copy, ca).ok())
            .collect();
        let Some(value) = majority_vote(samples.iter().flatten().copied()) else {
            error!("read_fat: no FAT copy of cluster {} is readable", ca);
            return FAT_ENTRY_BAD;
        };

        if samples.iter().any(|s| *s != Some(value)) && !self.read_only {
            warn!("read_fat: copies of cluster {} disagree, healing to {:#x}", ca, value);
            if let Err(e) = self.write_copies(device, ca, value) {
                warn!("read_fat: healing cluster {} failed: {}", ca, e);
            }
        }
        self.remember(ca, value);
        value
    }

    fn write_copies<D: BlockDevice + ?Sized>(&self, device: &D, ca: u32, value: u32) -> Result<()> {
        let mut result = Ok(());
        for copy in 0..self.info.fat_count {
            let (sector, offset) = self.info.fat_location(copy, ca);
            if let Err(e) = device.write_sector(sector as usize, offset as usize, &value.to_le_bytes()) {
                error!("write_fat: copy {} of cluster {} failed: {}", copy, ca, e);
                result = Err(e);
            }
        }
        result
    }

    /// Writes `value` to every copy. A failed copy does not stop the others.
    pub fn write_fat<D: BlockDevice + ?Sized>(&self, device: &D, ca: u32, value: u32) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        if ca >= self.info.total_clusters {
            return Err(FsError::OutOfBounds);
        }
        debug!("write_fat(ca={}, value={:#x})", ca, value);
        self.remember(ca, value);
        self.write_copies(device, ca, value)
    }

    pub fn set_cluster_free<D: BlockDevice + ?Sized>(&self, device: &D, ca: u32) -> Result<()> {
        self.write_fat(device, ca, FAT_ENTRY_FREE)
    }

    pub fn set_cluster_end<D: BlockDevice + ?Sized>(&self, device: &D, ca: u32) -> Result<()> {
        self.write_fat(device, ca, FAT_ENTRY_END)
    }

    pub fn set_cluster_bad<D: BlockDevice + ?Sized>(&self, device: &D, ca: u32) -> Result<()> {
        self.write_fat(device, ca, FAT_ENTRY_BAD)
    }

    /// Reads the whole table at once, voting entry by entry and healing
    /// disagreeing copies. Fills the mirror when there is one.
    pub fn load_fat_mirror<D: BlockDevice + ?Sized>(&self, device: &D) -> Result<Vec<u32>> {
        let table_bytes = self.info.fat_size as usize * self.info.bytes_per_sector as usize;
        let mut copies = Vec::with_capacity(self.info.fat_count as usize);
        for copy in 0..self.info.fat_count {
            let (sector, _) = self.info.fat_location(copy, 0);
            let mut buf = vec![0u8; table_bytes];
            match device.read_sector(sector as usize, 0, &mut buf) {
                Ok(()) => copies.push(buf),
                Err(e) => warn!("load_fat_mirror: FAT copy {} unreadable: {}", copy, e),
            }
        }
        if copies.is_empty() {
            return Err(FsError::IoError);
        }

        let entry = |buf: &[u8], ca: usize| {
            let at = ca * FAT_ENTRY_SIZE;
            u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        };
        let mut table = Vec::with_capacity(self.info.total_clusters as usize);
        let mut healed = 0usize;
        for ca in 0..self.info.total_clusters as usize {
            let samples = copies.iter().map(|c| entry(c.as_slice(), ca));
            let value = majority_vote(samples.clone()).unwrap_or(FAT_ENTRY_BAD);
            if samples.clone().any(|s| s != value) && !self.read_only {
                if let Err(e) = self.write_copies(device, ca as u32, value) {
                    warn!("load_fat_mirror: healing cluster {} failed: {}", ca, e);
                }
                healed += 1;
            }
            self.remember(ca as u32, value);
            table.push(value);
        }
        if healed > 0 {
            warn!("load_fat_mirror: healed {} FAT entries", healed);
        }
        Ok(table)
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vote_majority() {
        assert_eq!(majority_vote([7, 7, 3]), Some(7));
        assert_eq!(majority_vote([3, 7, 7]), Some(7));
        assert_eq!(majority_vote([7, 3, 7]), Some(7));
        assert_eq!(majority_vote([1, 2, 2, 2, 1]), Some(2));
        assert_eq!(majority_vote::<u32>([]), None);
    }

    #[test]
    fn test_predicates() {
        assert!(is_free(0));
        assert!(is_end(0x0FFF_FFFF));
        assert!(is_bad(0x0FFF_FFF7));
        assert!(is_reserved(0x0FFF_FFF8));
        assert!(!is_end(0xFFFF_FFFF));
    }
}
