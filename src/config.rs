//! On-disk constants and mount/format options.

pub const SECTOR_SIZE: usize = 512;

// Cluster values with special meaning in the FAT.
pub const FAT_ENTRY_FREE: u32 = 0x0000_0000;
pub const FAT_ENTRY_END: u32 = 0x0FFF_FFFF;
pub const FAT_ENTRY_BAD: u32 = 0x0FFF_FFF7;
pub const FAT_ENTRY_RESERVED: u32 = 0x0FFF_FFF8;
pub const FAT_ENTRY_SIZE: usize = 4;

pub const ROOT_CLUSTER: u32 = 2;

// Directory entries.
pub const ENTRY_END: u8 = 0x00;
pub const ENTRY_FREE: u8 = 0xE5;
pub const ENTRY_SIZE: usize = 32;
pub const ENCODED_ENTRY_SIZE: usize = ENTRY_SIZE * 2;
pub const NAME_LEN: usize = 11;
pub const BASE_LEN: usize = 8;
pub const EXT_LEN: usize = 3;

// Journal records.
pub const JOURNAL_RECORD_SIZE: usize = 32;
pub const ENCODED_JOURNAL_RECORD_SIZE: usize = JOURNAL_RECORD_SIZE * 2;

// Boot sector.
pub const BOOT_SECTOR_SIZE: usize = 98;
pub const ENCODED_BOOT_SECTOR_SIZE: usize = BOOT_SECTOR_SIZE * 2;
pub const OEM_NAME: &[u8; 8] = b"NIFAT 32";
pub const FS_TYPE_LABEL: &[u8; 8] = b"NIFAT32 ";
pub const DEFAULT_VOLUME_LABEL: &[u8; 11] = b"ROOT_LABEL ";
pub const VOLUME_ID: u32 = 0x1234_5678;
pub const MEDIA_TYPE: u8 = 0xF8;
pub const DRIVE_NUMBER: u8 = 0x80;
pub const BOOT_SIGNATURE: u8 = 0x29;

pub const DEFAULT_BOOTSECTOR_BACKUPS: u32 = 5;
pub const DEFAULT_JOURNAL_COPIES: u32 = 3;
pub const DEFAULT_CTABLE_SIZE: usize = 50;
pub const DEFAULT_LOCK_RETRIES: u32 = 100_000;

/// Options consulted once at mount.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Volume size in sectors. `None` asks the device.
    pub total_sectors: Option<u32>,
    pub bootsector_backups: u32,
    pub journal_copies: u32,
    /// Hard-load every FAT entry into memory.
    pub fat_cache: bool,
    /// Build the free-cluster bitmap at mount.
    pub free_map: bool,
    pub ctable_size: usize,
    pub lock_retries: u32,
    pub read_only: bool,
    /// Rewrite every boot sector slot with the copy that validated.
    pub repair_bootsectors: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            total_sectors: None,
            bootsector_backups: DEFAULT_BOOTSECTOR_BACKUPS,
            journal_copies: DEFAULT_JOURNAL_COPIES,
            fat_cache: false,
            free_map: true,
            ctable_size: DEFAULT_CTABLE_SIZE,
            lock_retries: DEFAULT_LOCK_RETRIES,
            read_only: false,
            repair_bootsectors: true,
        }
    }
}

/// Geometry used when laying out a fresh volume.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub total_sectors: Option<u32>,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub bootsector_backups: u32,
    pub journal_copies: u32,
    pub volume_label: [u8; 11],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            total_sectors: None,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            fat_count: 3,
            bootsector_backups: DEFAULT_BOOTSECTOR_BACKUPS,
            journal_copies: DEFAULT_JOURNAL_COPIES,
            volume_label: *DEFAULT_VOLUME_LABEL,
        }
    }
}
