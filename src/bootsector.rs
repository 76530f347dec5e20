//! Boot sector placement, validation and the volume geometry derived from it.

use log::{debug, info, warn};

use crate::config::*;
use crate::error::{FsError, Result};
use crate::hamming;
use crate::structs::{BootSector, ExtBootSector};
use crate::BlockDevice;

const SLOT_PRIME_1: u32 = 73_856_093;
const SLOT_PRIME_2: u32 = 19_349_663;
const SLOT_PRIME_3: u32 = 83_492_791;

/// Sector holding boot sector copy `index`.
pub fn bootsector_sector(index: u32, total_sectors: u32) -> u32 {
    index
        .wrapping_mul(SLOT_PRIME_1)
        .wrapping_add(SLOT_PRIME_2)
        .wrapping_mul(SLOT_PRIME_3)
        % total_sectors
}

/// Volume geometry, fixed for the lifetime of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub fat_count: u32,
    /// Sectors per FAT copy.
    pub fat_size: u32,
    pub first_data_sector: u32,
    pub total_sectors: u32,
    pub total_clusters: u32,
    pub root_cluster: u32,
    pub cluster_size: u32,
    pub journal_copies: u32,
    pub bootsector_backups: u32,
}

impl VolumeInfo {
    pub fn from_boot_sector(bs: &BootSector, journal_copies: u32, bootsector_backups: u32) -> Result<Self> {
        let bytes_per_sector = bs.bytes_per_sector as u32;
        let sectors_per_cluster = bs.sectors_per_cluster as u32;
        let total_sectors = bs.total_sectors();
        if bytes_per_sector == 0 || sectors_per_cluster == 0 || bs.fat_count == 0 || total_sectors == 0 {
            return Err(FsError::InvalidGeometry);
        }
        let fat_size = bs.fat_size();
        let first_data_sector = bs.reserved_sectors as u32 + bs.fat_count as u32 * fat_size;
        if first_data_sector >= total_sectors {
            return Err(FsError::InvalidGeometry);
        }
        let root_cluster = bs.ext.root_cluster;
        let total_clusters = (total_sectors - first_data_sector) / sectors_per_cluster + root_cluster;
        if (total_clusters as u64) * FAT_ENTRY_SIZE as u64 > fat_size as u64 * bytes_per_sector as u64 {
            return Err(FsError::InvalidGeometry);
        }
        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors: bs.reserved_sectors as u32,
            fat_count: bs.fat_count as u32,
            fat_size,
            first_data_sector,
            total_sectors,
            total_clusters,
            root_cluster,
            cluster_size: bytes_per_sector * sectors_per_cluster,
            journal_copies,
            bootsector_backups,
        })
    }

    pub fn cluster_to_sector(&self, ca: u32) -> u32 {
        (ca - self.root_cluster) * self.sectors_per_cluster + self.first_data_sector
    }

    /// Sector and in-sector offset of `ca`'s entry in FAT copy `copy`.
    pub fn fat_location(&self, copy: u32, ca: u32) -> (u32, u32) {
        let fat_start = self.reserved_sectors + copy * self.fat_size;
        let byte = ca * FAT_ENTRY_SIZE as u32;
        (fat_start + byte / self.bytes_per_sector, byte % self.bytes_per_sector)
    }

    /// Whether `ca` addresses a data cluster of this volume.
    pub fn is_data_cluster(&self, ca: u32) -> bool {
        ca >= self.root_cluster && ca < self.total_clusters
    }

    /// Directory entries held by one cluster once encoded.
    pub fn entries_per_cluster(&self) -> usize {
        self.cluster_size as usize / ENCODED_ENTRY_SIZE
    }
}

fn read_copy<D: BlockDevice + ?Sized>(device: &D, sector: u32) -> Result<(BootSector, Vec<u8>, usize)> {
    let mut raw = vec![0u8; ENCODED_BOOT_SECTOR_SIZE];
    device.read_sector(sector as usize, 0, &mut raw)?;
    let (decoded, dirty) = hamming::decode(&raw);
    let bs = BootSector::from_bytes(&decoded)?;
    Ok((bs, raw, dirty))
}

pub fn write_boot_sector<D: BlockDevice + ?Sized>(device: &D, bs: &BootSector, sector: u32) -> Result<()> {
    let encoded = hamming::encode(&bs.to_bytes());
    let mut padded = vec![0u8; device.sector_size().max(encoded.len())];
    padded[..encoded.len()].copy_from_slice(&encoded);
    device.write_sector(sector as usize, 0, &padded)
}

/// Walks the backup slots and returns the first copy whose checksums hold.
/// The copy must record the same slot count as `backups`.
///
/// With `repair`, every slot that does not already hold the exact encoding
/// of that copy is rewritten with it.
pub fn load_boot_sector<D: BlockDevice + ?Sized>(
    device: &D,
    total_sectors: u32,
    backups: u32,
    repair: bool,
) -> Result<BootSector> {
    let mut found = None;
    for index in 0..backups.max(1) {
        let sector = bootsector_sector(index, total_sectors);
        match read_copy(device, sector) {
            Ok((bs, _, dirty)) if bs.is_valid() => {
                debug!("load_boot_sector: slot {} at sector {} valid, {} corrected words", index, sector, dirty);
                found = Some(bs);
                break;
            }
            Ok(_) => warn!("load_boot_sector: slot {} at sector {} failed checksum", index, sector),
            Err(e) => warn!("load_boot_sector: slot {} at sector {} unreadable: {}", index, sector, e),
        }
    }
    let bs = found.ok_or(FsError::InvalidBootSector)?;
    let (_, recorded) = bs.redundancy();
    if recorded != backups {
        warn!("load_boot_sector: volume has {} slots, asked to use {}", recorded, backups);
        return Err(FsError::InvalidGeometry);
    }

    if repair {
        let expected = hamming::encode(&bs.to_bytes());
        for index in 0..backups {
            let sector = bootsector_sector(index, total_sectors);
            let intact = read_copy(device, sector).map(|(_, raw, _)| raw == expected).unwrap_or(false);
            if !intact {
                warn!("load_boot_sector: restoring slot {} at sector {}", index, sector);
                write_boot_sector(device, &bs, sector)?;
            }
        }
    }
    Ok(bs)
}

/// Builds the boot sector for a fresh volume of `total_sectors` sectors.
pub fn layout_boot_sector(options: &FormatOptions, total_sectors: u32, sector_size: u32) -> Result<BootSector> {
    let spc = options.sectors_per_cluster as u32;
    let reserved = options.reserved_sectors as u32;
    let fat_count = options.fat_count as u32;
    if spc == 0 || fat_count == 0 || sector_size == 0 || total_sectors <= reserved {
        return Err(FsError::InvalidGeometry);
    }

    // FAT size and cluster count depend on each other; iterate to a fixed point.
    let data_sectors = total_sectors - reserved;
    let mut fat_size = 0u32;
    for _ in 0..32 {
        let used = fat_count * fat_size;
        if used >= data_sectors {
            return Err(FsError::InvalidGeometry);
        }
        let clusters = (data_sectors - used) / spc + ROOT_CLUSTER;
        let next = (clusters * FAT_ENTRY_SIZE as u32).div_ceil(sector_size);
        if next == fat_size {
            break;
        }
        fat_size = next;
    }
    if reserved + fat_count * fat_size + spc > total_sectors {
        return Err(FsError::InvalidGeometry);
    }

    let mut bs = BootSector {
        jump: [0xEB, 0x58, 0x90],
        oem_name: *OEM_NAME,
        bytes_per_sector: sector_size as u16,
        sectors_per_cluster: options.sectors_per_cluster,
        reserved_sectors: options.reserved_sectors,
        fat_count: options.fat_count,
        root_entry_count: 0,
        total_sectors_16: 0,
        media_type: MEDIA_TYPE,
        table_size_16: 0,
        sectors_per_track: 63,
        head_side_count: 255,
        hidden_sectors: 0,
        total_sectors_32: total_sectors,
        ext: ExtBootSector {
            table_size_32: fat_size,
            extended_flags: 0,
            fat_version: 0,
            root_cluster: ROOT_CLUSTER,
            fat_info: 0,
            backup_bs_sector: 0,
            reserved_0: [0; 12],
            drive_number: DRIVE_NUMBER,
            reserved_1: 0,
            boot_signature: BOOT_SIGNATURE,
            volume_id: VOLUME_ID,
            volume_label: options.volume_label,
            fat_type_label: *FS_TYPE_LABEL,
            checksum: 0,
        },
        checksum: 0,
    };
    bs.set_redundancy(options.journal_copies, options.bootsector_backups)?;
    bs.seal();
    info!(
        "layout_boot_sector: {} sectors, fat_size={}, spc={}, fats={}",
        total_sectors, fat_size, spc, fat_count
    );
    Ok(bs)
}
