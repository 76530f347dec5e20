use bitflags::bitflags;

use crate::config::*;
use crate::error::{FsError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// 32-byte directory record.
///
/// Layout (little-endian):
/// `name[11] | name_hash u32 | attributes u8 | cluster u32 | size u32 | checksum u32 | reserved[4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; NAME_LEN],
    pub name_hash: u32,
    pub attributes: Attributes,
    pub cluster: u32,
    pub size: u32,
    pub checksum: u32,
}

impl DirEntry {
    pub const NULL: Self = Self {
        name: [0; NAME_LEN],
        name_hash: 0,
        attributes: Attributes::empty(),
        cluster: 0,
        size: 0,
        checksum: 0,
    };

    /// Builds a sealed entry. No I/O.
    pub fn create(name: &[u8; NAME_LEN], is_dir: bool, cluster: u32, size: u32) -> Self {
        let attributes = if is_dir { Attributes::DIRECTORY } else { Attributes::ARCHIVE };
        let mut entry = Self {
            name: *name,
            name_hash: 0,
            attributes,
            cluster,
            size,
            checksum: 0,
        };
        entry.seal();
        entry
    }

    /// Recomputes the name hash and the record checksum.
    pub fn seal(&mut self) {
        self.name_hash = name_hash(&self.name);
        self.checksum = 0;
        self.checksum = crc32c::crc32c(&self.to_bytes());
    }

    pub fn is_valid(&self) -> bool {
        let mut copy = *self;
        copy.checksum = 0;
        copy.name_hash == name_hash(&copy.name) && crc32c::crc32c(&copy.to_bytes()) == self.checksum
    }

    pub fn is_end(&self) -> bool {
        self.name[0] == ENTRY_END
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == ENTRY_FREE
    }

    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    /// The same record with its name marked free.
    pub fn tombstone(&self) -> Self {
        let mut entry = *self;
        entry.name[0] = ENTRY_FREE;
        entry.seal();
        entry
    }

    /// Drops every field the journal does not carry.
    pub fn squeeze(&self) -> SqueezedEntry {
        SqueezedEntry {
            name: self.name,
            attributes: self.attributes.bits(),
            cluster: self.cluster,
            size: self.size,
        }
    }

    /// Canonical form written to disk, so that a journal replay reproduces
    /// the bytes of the original write.
    pub fn normalized(&self) -> Self {
        self.squeeze().unsqueeze()
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..11].copy_from_slice(&self.name);
        buf[11..15].copy_from_slice(&self.name_hash.to_le_bytes());
        buf[15] = self.attributes.bits();
        buf[16..20].copy_from_slice(&self.cluster.to_le_bytes());
        buf[20..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&buf[0..11]);
        Self {
            name,
            name_hash: le_u32(buf, 11),
            attributes: Attributes::from_bits_retain(buf[15]),
            cluster: le_u32(buf, 16),
            size: le_u32(buf, 20),
            checksum: le_u32(buf, 24),
        }
    }
}

pub fn name_hash(name: &[u8; NAME_LEN]) -> u32 {
    crc32c::crc32c(name)
}

/// Reduced entry carried by journal records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqueezedEntry {
    pub name: [u8; NAME_LEN],
    pub attributes: u8,
    pub cluster: u32,
    pub size: u32,
}

impl SqueezedEntry {
    pub const SIZE: usize = 20;

    pub fn unsqueeze(&self) -> DirEntry {
        let mut entry = DirEntry {
            name: self.name,
            name_hash: 0,
            attributes: Attributes::from_bits_retain(self.attributes),
            cluster: self.cluster,
            size: self.size,
            checksum: 0,
        };
        entry.seal();
        entry
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..11].copy_from_slice(&self.name);
        buf[11] = self.attributes;
        buf[12..16].copy_from_slice(&self.cluster.to_le_bytes());
        buf[16..20].copy_from_slice(&self.size.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&buf[0..11]);
        Self {
            name,
            attributes: buf[11],
            cluster: le_u32(buf, 12),
            size: le_u32(buf, 16),
        }
    }
}

/// Boot sector with its extended FAT32 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media_type: u8,
    pub table_size_16: u16,
    pub sectors_per_track: u16,
    pub head_side_count: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub ext: ExtBootSector,
    pub checksum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtBootSector {
    pub table_size_32: u32,
    pub extended_flags: u16,
    pub fat_version: u16,
    pub root_cluster: u32,
    pub fat_info: u16,
    pub backup_bs_sector: u16,
    pub reserved_0: [u8; 12],
    pub drive_number: u8,
    pub reserved_1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fat_type_label: [u8; 8],
    pub checksum: u32,
}

impl ExtBootSector {
    pub const SIZE: usize = 58;

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.table_size_32.to_le_bytes());
        b[4..6].copy_from_slice(&self.extended_flags.to_le_bytes());
        b[6..8].copy_from_slice(&self.fat_version.to_le_bytes());
        b[8..12].copy_from_slice(&self.root_cluster.to_le_bytes());
        b[12..14].copy_from_slice(&self.fat_info.to_le_bytes());
        b[14..16].copy_from_slice(&self.backup_bs_sector.to_le_bytes());
        b[16..28].copy_from_slice(&self.reserved_0);
        b[28] = self.drive_number;
        b[29] = self.reserved_1;
        b[30] = self.boot_signature;
        b[31..35].copy_from_slice(&self.volume_id.to_le_bytes());
        b[35..46].copy_from_slice(&self.volume_label);
        b[46..54].copy_from_slice(&self.fat_type_label);
        b[54..58].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> Self {
        let mut reserved_0 = [0u8; 12];
        reserved_0.copy_from_slice(&b[16..28]);
        let mut volume_label = [0u8; 11];
        volume_label.copy_from_slice(&b[35..46]);
        let mut fat_type_label = [0u8; 8];
        fat_type_label.copy_from_slice(&b[46..54]);
        Self {
            table_size_32: le_u32(b, 0),
            extended_flags: le_u16(b, 4),
            fat_version: le_u16(b, 6),
            root_cluster: le_u32(b, 8),
            fat_info: le_u16(b, 12),
            backup_bs_sector: le_u16(b, 14),
            reserved_0,
            drive_number: b[28],
            reserved_1: b[29],
            boot_signature: b[30],
            volume_id: le_u32(b, 31),
            volume_label,
            fat_type_label,
            checksum: le_u32(b, 54),
        }
    }

    pub fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;
        crc32c::crc32c(&copy.to_bytes())
    }
}

impl BootSector {
    const EXT_OFFSET: usize = 36;

    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut b = [0u8; BOOT_SECTOR_SIZE];
        b[0..3].copy_from_slice(&self.jump);
        b[3..11].copy_from_slice(&self.oem_name);
        b[11..13].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        b[13] = self.sectors_per_cluster;
        b[14..16].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        b[16] = self.fat_count;
        b[17..19].copy_from_slice(&self.root_entry_count.to_le_bytes());
        b[19..21].copy_from_slice(&self.total_sectors_16.to_le_bytes());
        b[21] = self.media_type;
        b[22..24].copy_from_slice(&self.table_size_16.to_le_bytes());
        b[24..26].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        b[26..28].copy_from_slice(&self.head_side_count.to_le_bytes());
        b[28..32].copy_from_slice(&self.hidden_sectors.to_le_bytes());
        b[32..36].copy_from_slice(&self.total_sectors_32.to_le_bytes());
        b[Self::EXT_OFFSET..Self::EXT_OFFSET + ExtBootSector::SIZE].copy_from_slice(&self.ext.to_bytes());
        b[94..98].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() < BOOT_SECTOR_SIZE {
            return Err(FsError::InvalidBootSector);
        }
        let mut jump = [0u8; 3];
        jump.copy_from_slice(&b[0..3]);
        let mut oem_name = [0u8; 8];
        oem_name.copy_from_slice(&b[3..11]);
        Ok(Self {
            jump,
            oem_name,
            bytes_per_sector: le_u16(b, 11),
            sectors_per_cluster: b[13],
            reserved_sectors: le_u16(b, 14),
            fat_count: b[16],
            root_entry_count: le_u16(b, 17),
            total_sectors_16: le_u16(b, 19),
            media_type: b[21],
            table_size_16: le_u16(b, 22),
            sectors_per_track: le_u16(b, 24),
            head_side_count: le_u16(b, 26),
            hidden_sectors: le_u32(b, 28),
            total_sectors_32: le_u32(b, 32),
            ext: ExtBootSector::from_bytes(&b[Self::EXT_OFFSET..Self::EXT_OFFSET + ExtBootSector::SIZE]),
            checksum: le_u32(b, 94),
        })
    }

    pub fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;
        crc32c::crc32c(&copy.to_bytes())
    }

    /// Fills both checksums, inner first.
    pub fn seal(&mut self) {
        self.ext.checksum = self.ext.compute_checksum();
        self.checksum = self.compute_checksum();
    }

    pub fn is_valid(&self) -> bool {
        self.ext.checksum == self.ext.compute_checksum() && self.checksum == self.compute_checksum()
    }

    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 { self.total_sectors_16 as u32 } else { self.total_sectors_32 }
    }

    pub fn fat_size(&self) -> u32 {
        if self.table_size_16 != 0 { self.table_size_16 as u32 } else { self.ext.table_size_32 }
    }

    /// Journal copies and boot sector slots the volume was formatted with.
    /// Stored in the first two reserved bytes of the extended block.
    pub fn redundancy(&self) -> (u32, u32) {
        (self.ext.reserved_0[0] as u32, self.ext.reserved_0[1] as u32)
    }

    pub fn set_redundancy(&mut self, journal_copies: u32, bootsector_backups: u32) -> Result<()> {
        let journal = u8::try_from(journal_copies).map_err(|_| FsError::InvalidGeometry)?;
        let backups = u8::try_from(bootsector_backups).map_err(|_| FsError::InvalidGeometry)?;
        self.ext.reserved_0[0] = journal;
        self.ext.reserved_0[1] = backups;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_entry_checksum() {
        let mut e = DirEntry::create(b"TEST    TXT", false, 5, 70);
        assert!(e.is_valid());
        assert!(!e.is_dir());
        e.size = 71;
        assert!(!e.is_valid());
        e.seal();
        assert!(e.is_valid());
        assert_eq!(DirEntry::from_bytes(&e.to_bytes()), e);
    }

    #[test]
    fn test_tombstone_stays_valid() {
        let e = DirEntry::create(b"DIR        ", true, 9, 0);
        let t = e.tombstone();
        assert!(t.is_free());
        assert!(t.is_valid());
        assert_eq!(t.cluster, 9);
    }

    #[test]
    fn test_squeeze_normalizes() {
        let mut e = DirEntry::create(b"A       B  ", false, 3, 1);
        e.attributes |= Attributes::HIDDEN;
        e.seal();
        let mut buf = [0u8; SqueezedEntry::SIZE];
        e.squeeze().write_to(&mut buf);
        assert_eq!(SqueezedEntry::read_from(&buf).unsqueeze(), e);
    }

    #[test]
    fn test_boot_sector_checksums() {
        let mut bs = BootSector {
            jump: [0xEB, 0x58, 0x90],
            oem_name: *OEM_NAME,
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            fat_count: 3,
            root_entry_count: 0,
            total_sectors_16: 0,
            media_type: MEDIA_TYPE,
            table_size_16: 0,
            sectors_per_track: 63,
            head_side_count: 255,
            hidden_sectors: 0,
            total_sectors_32: 16384,
            ext: ExtBootSector {
                table_size_32: 16,
                extended_flags: 0,
                fat_version: 0,
                root_cluster: ROOT_CLUSTER,
                fat_info: 1,
                backup_bs_sector: 0,
                reserved_0: [0; 12],
                drive_number: DRIVE_NUMBER,
                reserved_1: 0,
                boot_signature: BOOT_SIGNATURE,
                volume_id: VOLUME_ID,
                volume_label: *DEFAULT_VOLUME_LABEL,
                fat_type_label: *FS_TYPE_LABEL,
                checksum: 0,
            },
            checksum: 0,
        };
        bs.seal();
        assert!(bs.is_valid());
        let parsed = BootSector::from_bytes(&bs.to_bytes()).unwrap();
        assert_eq!(parsed, bs);
        bs.ext.root_cluster = 3;
        assert!(!bs.is_valid());
    }
}
