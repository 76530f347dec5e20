//! Redo journal for directory mutations.
//!
//! The journal is a ring of fixed-size slots. Each copy of the ring occupies
//! one cluster-sized area at a scattered sector of the volume, and every slot
//! is Hamming-coded. A mutation is staged in a slot before the directory
//! cluster is touched and the slot is cleared once the cluster is written, so
//! a staged slot found at mount is replayed.

use log::{debug, info, warn};

use crate::bootsector::VolumeInfo;
use crate::cluster;
use crate::config::*;
use crate::error::{FsError, Result};
use crate::fat::majority_vote;
use crate::hamming;
use crate::lock::Locked;
use crate::structs::{DirEntry, SqueezedEntry};
use crate::BlockDevice;

const JOURNAL_MULTIPLIER: u64 = 12_345_625_789;

/// First sector of journal copy `n`.
pub fn journal_sector(n: u32, total_sectors: u32) -> u32 {
    (((n as u64 + 63).wrapping_mul(JOURNAL_MULTIPLIER) >> 15) % total_sectors as u64) as u32
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    None = 0,
    Add = 1,
    Edit = 2,
    Delete = 3,
}

impl JournalOp {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Add),
            2 => Some(Self::Edit),
            3 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One journal slot.
///
/// Layout: `op u8 | cluster u32 | slot u16 | squeezed entry [20] | checksum u32 | pad`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRecord {
    pub op: u8,
    pub cluster: u32,
    pub slot: u16,
    pub entry: SqueezedEntry,
    pub checksum: u32,
}

impl JournalRecord {
    const PAYLOAD: usize = 27;

    pub fn new(op: JournalOp, cluster: u32, slot: u16, entry: &DirEntry) -> Self {
        let mut record = Self {
            op: op as u8,
            cluster,
            slot,
            entry: entry.squeeze(),
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    pub fn cleared() -> Self {
        Self::new(JournalOp::None, 0, 0, &DirEntry::NULL)
    }

    fn payload(&self) -> [u8; JOURNAL_RECORD_SIZE] {
        let mut buf = [0u8; JOURNAL_RECORD_SIZE];
        buf[0] = self.op;
        buf[1..5].copy_from_slice(&self.cluster.to_le_bytes());
        buf[5..7].copy_from_slice(&self.slot.to_le_bytes());
        self.entry.write_to(&mut buf[7..Self::PAYLOAD]);
        buf
    }

    fn compute_checksum(&self) -> u32 {
        crc32c::crc32c(&self.payload()[..Self::PAYLOAD])
    }

    pub fn is_valid(&self) -> bool {
        JournalOp::from_u8(self.op).is_some() && self.checksum == self.compute_checksum()
    }

    pub fn op(&self) -> Option<JournalOp> {
        JournalOp::from_u8(self.op)
    }

    /// Whether the slot carries a mutation that still has to be applied.
    pub fn is_pending(&self) -> bool {
        self.is_valid() && self.op() != Some(JournalOp::None)
    }

    pub fn to_bytes(&self) -> [u8; JOURNAL_RECORD_SIZE] {
        let mut buf = self.payload();
        buf[Self::PAYLOAD..Self::PAYLOAD + 4].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            op: buf[0],
            cluster: u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
            slot: u16::from_le_bytes([buf[5], buf[6]]),
            entry: SqueezedEntry::read_from(&buf[7..Self::PAYLOAD]),
            checksum: u32::from_le_bytes([buf[27], buf[28], buf[29], buf[30]]),
        }
    }

    /// Directory record this journal slot asks to be written.
    pub fn target_entry(&self) -> DirEntry {
        let entry = self.entry.unsqueeze();
        match self.op() {
            Some(JournalOp::Delete) => entry.tombstone(),
            _ => entry,
        }
    }
}

#[derive(Debug)]
pub struct Journal {
    info: VolumeInfo,
    cursor: Locked<usize>,
    read_only: bool,
}

impl Journal {
    pub fn new(info: VolumeInfo, lock_retries: u32, read_only: bool) -> Self {
        Self {
            info,
            cursor: Locked::new(0, lock_retries),
            read_only,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.info.journal_copies > 0
    }

    /// Number of slots in the ring.
    pub fn capacity(&self) -> usize {
        self.info.cluster_size as usize / ENCODED_JOURNAL_RECORD_SIZE
    }

    fn location(&self, copy: u32, index: usize) -> (usize, usize) {
        let base = journal_sector(copy, self.info.total_sectors) as usize;
        let byte = index * ENCODED_JOURNAL_RECORD_SIZE;
        let ss = self.info.bytes_per_sector as usize;
        (base + byte / ss, byte % ss)
    }

    fn write_slot<D: BlockDevice + ?Sized>(&self, device: &D, index: usize, record: &JournalRecord) -> Result<()> {
        let encoded = hamming::encode(&record.to_bytes());
        let mut result = Ok(());
        for copy in 0..self.info.journal_copies {
            let (sector, offset) = self.location(copy, index);
            if let Err(e) = device.write_sector(sector, offset, &encoded) {
                warn!("journal: copy {} of slot {} not written: {}", copy, index, e);
                result = Err(e);
            }
        }
        result
    }

    /// Reads slot `index` from every copy and votes on the checksum of the
    /// valid ones. Copies that disagree with the winner are rewritten.
    pub fn read_slot<D: BlockDevice + ?Sized>(&self, device: &D, index: usize) -> Result<Option<JournalRecord>> {
        let mut records = Vec::with_capacity(self.info.journal_copies as usize);
        let mut raw = [0u8; ENCODED_JOURNAL_RECORD_SIZE];
        for copy in 0..self.info.journal_copies {
            let (sector, offset) = self.location(copy, index);
            match device.read_sector(sector, offset, &mut raw) {
                Ok(()) => {
                    let (bytes, _) = hamming::decode(&raw);
                    records.push(Some(JournalRecord::from_bytes(&bytes)));
                }
                Err(_) => records.push(None),
            }
        }

        let valid = records.iter().flatten().filter(|r| r.is_valid());
        let Some(checksum) = majority_vote(valid.clone().map(|r| r.checksum)) else {
            return Ok(None);
        };
        let Some(winner) = valid.clone().find(|r| r.checksum == checksum).copied() else {
            return Ok(None);
        };
        if records.iter().any(|r| *r != Some(winner)) && !self.read_only {
            debug!("journal: healing slot {}", index);
            self.write_slot(device, index, &winner)?;
        }
        Ok(Some(winner))
    }

    /// Stages a mutation. Returns the slot index, or `None` when the journal
    /// is disabled.
    pub fn journal_add_operation<D: BlockDevice + ?Sized>(
        &self,
        device: &D,
        op: JournalOp,
        ca: u32,
        slot: usize,
        entry: &DirEntry,
    ) -> Result<Option<usize>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let capacity = self.capacity();
        let mut cursor = self.cursor.write()?;
        for _ in 0..capacity {
            let index = *cursor % capacity;
            *cursor = (index + 1) % capacity;
            if let Some(record) = self.read_slot(device, index)? {
                if record.is_pending() {
                    warn!("journal: slot {} still holds a pending operation, skipping", index);
                    continue;
                }
            }
            let record = JournalRecord::new(op, ca, slot as u16, entry);
            self.write_slot(device, index, &record)?;
            debug!("journal_add_operation(op={:?}, ca={}, slot={}) -> {}", op, ca, slot, index);
            return Ok(Some(index));
        }
        Err(FsError::JournalFull)
    }

    /// Clears slot `index`, committing its mutation.
    pub fn journal_solve_operation<D: BlockDevice + ?Sized>(&self, device: &D, index: Option<usize>) -> Result<()> {
        let Some(index) = index else {
            return Ok(());
        };
        debug!("journal_solve_operation({})", index);
        self.write_slot(device, index, &JournalRecord::cleared())
    }

    /// Replays every pending slot into its directory cluster and clears it.
    /// Returns the number of replayed operations.
    pub fn restore_from_journal<D: BlockDevice + ?Sized>(&self, device: &D) -> Result<usize> {
        if !self.is_enabled() || self.read_only {
            return Ok(0);
        }
        let per_cluster = self.info.entries_per_cluster();
        let mut replayed = 0;
        for index in 0..self.capacity() {
            let Some(record) = self.read_slot(device, index)? else {
                continue;
            };
            if !record.is_pending() {
                continue;
            }
            if !self.info.is_data_cluster(record.cluster) || record.slot as usize >= per_cluster {
                warn!("journal: slot {} targets cluster {} slot {}, dropping", index, record.cluster, record.slot);
            } else {
                let encoded = hamming::encode(&record.target_entry().to_bytes());
                cluster::writeoff_cluster(
                    device,
                    &self.info,
                    record.cluster,
                    record.slot as usize * ENCODED_ENTRY_SIZE,
                    &encoded,
                )?;
                replayed += 1;
            }
            self.journal_solve_operation(device, Some(index))?;
        }
        if replayed > 0 {
            info!("restore_from_journal: replayed {} operations", replayed);
        }
        Ok(replayed)
    }

    /// Zeroes every copy of the ring.
    pub fn wipe<D: BlockDevice + ?Sized>(&self, device: &D) -> Result<()> {
        let zeros = vec![0u8; self.info.cluster_size as usize];
        for copy in 0..self.info.journal_copies {
            device.write_sector(journal_sector(copy, self.info.total_sectors) as usize, 0, &zeros)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_journal_sector_spread() {
        let sectors: Vec<u32> = (0..3).map(|n| journal_sector(n, 16384)).collect();
        assert_eq!(sectors, vec![11759, 11686, 11612]);
    }

    #[test]
    fn test_record_checksum() {
        let entry = DirEntry::create(b"FILE    TXT", false, 10, 4);
        let record = JournalRecord::new(JournalOp::Edit, 2, 3, &entry);
        assert!(record.is_pending());
        let parsed = JournalRecord::from_bytes(&record.to_bytes());
        assert_eq!(parsed, record);
        assert_eq!(parsed.target_entry(), entry);

        let mut broken = parsed;
        broken.slot = 4;
        assert!(!broken.is_valid());
        assert!(!JournalRecord::cleared().is_pending());
        assert!(!JournalRecord::from_bytes(&[0u8; JOURNAL_RECORD_SIZE]).is_valid());
    }

    #[test]
    fn test_delete_targets_tombstone() {
        let entry = DirEntry::create(b"OLD        ", true, 7, 0);
        let record = JournalRecord::new(JournalOp::Delete, 2, 0, &entry);
        assert_eq!(record.target_entry(), entry.tombstone());
    }
}
