#![allow(unused)]

use std::sync::Arc;

mod common;

use common::{formatted, formatted_with, pattern, FaultyDisk, RamDisk};
use nifat::bootsector_sector;
use nifat::journal_sector;
use nifat::DirEntry;
use nifat::Error;
use nifat::FileSystem;
use nifat::FormatOptions;
use nifat::JournalOp;
use nifat::MountOptions;
use nifat::OpenMode;
use nifat::FAT_ENTRY_BAD;
use nifat::FAT_ENTRY_END;
use nifat::FAT_ENTRY_FREE;

const ROOT_POS: usize = 80 * 512;

fn create_file() -> OpenMode {
    OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE | OpenMode::FILE
}

fn mount(rd: &RamDisk) -> FileSystem<RamDisk> {
    FileSystem::mount(Arc::new(rd.clone()), MountOptions::default()).unwrap()
}

/// Mounts `rd` behind a disk that can refuse writes to the root cluster.
fn mount_faulty(rd: &RamDisk) -> (FaultyDisk, FileSystem<FaultyDisk>) {
    let disk = FaultyDisk::new(rd.clone(), 80..88);
    let fs = FileSystem::mount(Arc::new(disk.clone()), MountOptions::default()).unwrap();
    (disk, fs)
}

/// Stages `op` on root slot 0, remounts and returns the root cluster.
fn replayed_root(rd: &RamDisk, op: JournalOp, entry: &DirEntry) -> Vec<u8> {
    let fs = mount(rd);
    fs.journal().journal_add_operation(&*fs.device(), op, 2, 0, entry).unwrap();
    drop(fs);
    let _fs = mount(rd);
    rd.read_raw(ROOT_POS, 4096)
}

#[test]
fn test_entry_bit_flip_is_corrected() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "a.txt", create_file()).unwrap();
    fs.close(h).unwrap();
    let clean = rd.read_raw(ROOT_POS, 4096);

    // One flip per codeword across the first record.
    for word in 0..32 {
        rd.flip_bit(ROOT_POS + word * 2 + word % 2, (word % 7) as u8);
    }
    assert!(fs.exists("a.txt"));
    assert_eq!(rd.read_raw(ROOT_POS, 4096), clean);
}

#[test]
fn test_uncorrectable_entry_is_absent() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "a.txt", create_file()).unwrap();
    fs.close(h).unwrap();

    // Two parity flips in the first codeword point the decoder at a data bit.
    rd.flip_bit(ROOT_POS, 0);
    rd.flip_bit(ROOT_POS, 1);
    assert!(!fs.exists("a.txt"));
}

#[test]
fn test_fat_majority_vote_heals() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "a.txt", create_file()).unwrap();
    let ca = fs.stat(h).unwrap().cluster;
    let info = *fs.info();
    let (sector, offset) = info.fat_location(0, ca);
    let pos = RamDisk::sector_pos(sector) + offset as usize;

    rd.write_raw(pos, &0x1234u32.to_le_bytes());
    assert_eq!(fs.fat().read_fat(&*fs.device(), ca), FAT_ENTRY_END);
    assert_eq!(rd.read_raw(pos, 4), FAT_ENTRY_END.to_le_bytes());
}

#[test]
fn test_fat_healed_at_mount() {
    let (rd, fs) = formatted();
    let info = *fs.info();
    fs.unmount().unwrap();

    let (sector, offset) = info.fat_location(2, info.root_cluster);
    let pos = RamDisk::sector_pos(sector) + offset as usize;
    rd.write_raw(pos, &0u32.to_le_bytes());
    let fs = mount(&rd);
    assert_eq!(rd.read_raw(pos, 4), FAT_ENTRY_END.to_le_bytes());
    assert!(fs.exists(""));
}

#[test]
fn test_boot_sector_self_heal() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "a.txt", create_file()).unwrap();
    fs.unmount().unwrap();

    let ts = common::TEST_SECTORS as u32;
    let first = RamDisk::sector_pos(bootsector_sector(0, ts));
    let second = RamDisk::sector_pos(bootsector_sector(1, ts));
    rd.write_raw(first, &[0xAA; 512]);
    rd.flip_bit(second + 7, 3);

    let fs = mount(&rd);
    assert!(fs.exists("a.txt"));
    let third = RamDisk::sector_pos(bootsector_sector(2, ts));
    assert_eq!(rd.read_raw(first, 512), rd.read_raw(third, 512));
    assert_eq!(rd.read_raw(second, 512), rd.read_raw(third, 512));
}

#[test]
fn test_read_only_mount_does_not_repair() {
    let (rd, fs) = formatted();
    fs.unmount().unwrap();
    let first = RamDisk::sector_pos(bootsector_sector(0, common::TEST_SECTORS as u32));
    rd.write_raw(first, &[0x55; 512]);

    let options = MountOptions {
        read_only: true,
        ..MountOptions::default()
    };
    let fs = FileSystem::mount(Arc::new(rd.clone()), options).unwrap();
    assert!(fs.exists(""));
    assert_eq!(rd.read_raw(first, 512), vec![0x55; 512]);
}

#[test]
fn test_all_boot_sectors_lost() {
    let (rd, fs) = formatted();
    fs.unmount().unwrap();
    for i in 0..5 {
        rd.write_raw(RamDisk::sector_pos(bootsector_sector(i, common::TEST_SECTORS as u32)), &[0; 512]);
    }
    let err = FileSystem::mount(Arc::new(rd), MountOptions::default()).unwrap_err();
    assert_eq!(err, Error::InvalidBootSector);
}

#[test]
fn test_journal_replays_staged_edit() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "a.txt", create_file()).unwrap();
    let ca = fs.stat(h).unwrap().cluster;

    // Stage an edit of root slot 0 and "crash" before applying it.
    let edited = DirEntry::create(b"B       TXT", false, ca, 5);
    let staged = fs
        .journal()
        .journal_add_operation(&*fs.device(), JournalOp::Edit, 2, 0, &edited)
        .unwrap();
    assert!(staged.is_some());
    drop(fs);

    let fs = mount(&rd);
    assert!(!fs.exists("a.txt"));
    let h = fs.open(None, "b.txt", OpenMode::READ).unwrap();
    assert_eq!(fs.stat(h).unwrap().size, 5);
    let slot = fs.journal().read_slot(&*fs.device(), staged.unwrap()).unwrap().unwrap();
    assert!(!slot.is_pending());
    let replayed = rd.read_raw(ROOT_POS, 4096);
    fs.unmount().unwrap();

    // Replaying again changes nothing.
    let fs = mount(&rd);
    assert_eq!(rd.read_raw(ROOT_POS, 4096), replayed);
    assert!(fs.exists("b.txt"));
}

#[test]
fn test_journal_replays_staged_delete() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "gone.txt", create_file()).unwrap();
    let meta = fs.ctable().meta(h).unwrap();
    fs.journal()
        .journal_add_operation(&*fs.device(), JournalOp::Delete, 2, 0, &meta)
        .unwrap();
    drop(fs);

    let fs = mount(&rd);
    assert!(!fs.exists("gone.txt"));
    let root = fs.info().root_cluster;
    assert!(fs.read_dir(root).unwrap().is_empty());
}

#[test]
fn test_replay_writes_what_the_operation_writes() {
    let (rd, fs) = formatted();
    let replica = rd.duplicate();

    let h = fs.open(None, "a.txt", create_file()).unwrap();
    let created = fs.ctable().meta(h).unwrap();
    assert_eq!(replayed_root(&replica, JournalOp::Add, &created), rd.read_raw(ROOT_POS, 4096));

    let mut info = fs.stat(h).unwrap();
    info.full_name = "b.txt".into();
    fs.change_meta(h, &info).unwrap();
    let renamed = fs.ctable().meta(h).unwrap();
    assert_eq!(renamed.name, *b"B       TXT");
    assert_eq!(replayed_root(&replica, JournalOp::Edit, &renamed), rd.read_raw(ROOT_POS, 4096));

    fs.delete(h).unwrap();
    assert_eq!(replayed_root(&replica, JournalOp::Delete, &renamed), rd.read_raw(ROOT_POS, 4096));
}

#[test]
fn test_failed_add_is_not_replayed() {
    let (rd, fs) = formatted();
    fs.unmount().unwrap();
    let (disk, fs) = mount_faulty(&rd);

    disk.arm(true);
    assert_eq!(fs.open(None, "a.txt", create_file()), Err(Error::IoError));
    assert_eq!(fs.free_clusters().unwrap(), Some(2026));
    disk.arm(false);
    drop(fs);

    let fs = mount(&rd);
    assert!(!fs.exists("a.txt"));
    assert_eq!(fs.free_clusters().unwrap(), Some(2026));
    let h = fs.open(None, "b.txt", create_file()).unwrap();
    fs.write(h, 0, b"BBBB").unwrap();
    let root = fs.info().root_cluster;
    assert_eq!(fs.read_dir(root).unwrap().len(), 1);
}

#[test]
fn test_failed_edit_is_not_replayed() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "a.txt", create_file()).unwrap();
    fs.unmount().unwrap();
    let (disk, fs) = mount_faulty(&rd);
    let h = fs.open(None, "a.txt", OpenMode::READ | OpenMode::WRITE).unwrap();

    let mut info = fs.stat(h).unwrap();
    info.full_name = "b.txt".into();
    disk.arm(true);
    assert_eq!(fs.change_meta(h, &info), Err(Error::IoError));
    disk.arm(false);
    drop(fs);

    let fs = mount(&rd);
    assert!(fs.exists("a.txt"));
    assert!(!fs.exists("b.txt"));
}

#[test]
fn test_failed_delete_completes_at_mount() {
    let (rd, fs) = formatted();
    let h = fs.open(None, "a.txt", create_file()).unwrap();
    fs.write(h, 0, &pattern(5000)).unwrap();
    fs.unmount().unwrap();
    let (disk, fs) = mount_faulty(&rd);
    let h = fs.open(None, "a.txt", OpenMode::READ | OpenMode::WRITE).unwrap();

    // The clusters are already free when the tombstone write fails.
    disk.arm(true);
    assert_eq!(fs.delete(h), Err(Error::IoError));
    disk.arm(false);
    drop(fs);

    let fs = mount(&rd);
    assert!(!fs.exists("a.txt"));
    assert_eq!(fs.free_clusters().unwrap(), Some(2026));
}

#[test]
fn test_journal_copy_heals() {
    let (rd, fs) = formatted();
    let entry = DirEntry::create(b"X          ", false, 5, 0);
    let dev = fs.device();
    let index = fs
        .journal()
        .journal_add_operation(&*dev, JournalOp::Add, 2, 3, &entry)
        .unwrap()
        .unwrap();
    assert_eq!(index, 0);

    let ts = common::TEST_SECTORS as u32;
    let copy0 = RamDisk::sector_pos(journal_sector(0, ts));
    let copy1 = RamDisk::sector_pos(journal_sector(1, ts));
    rd.write_raw(copy0, &[0x5A; 64]);
    let record = fs.journal().read_slot(&*dev, 0).unwrap().unwrap();
    assert!(record.is_pending());
    assert_eq!(record.target_entry(), entry.normalized());
    assert_eq!(rd.read_raw(copy0, 64), rd.read_raw(copy1, 64));
}

#[test]
fn test_journal_full() {
    let (_, fs) = formatted();
    let dev = fs.device();
    let entry = DirEntry::create(b"X          ", false, 5, 0);
    let capacity = fs.journal().capacity();
    assert_eq!(capacity, 64);
    for _ in 0..capacity {
        fs.journal().journal_add_operation(&*dev, JournalOp::Edit, 2, 0, &entry).unwrap();
    }
    assert_eq!(
        fs.journal().journal_add_operation(&*dev, JournalOp::Edit, 2, 0, &entry),
        Err(Error::JournalFull)
    );
    let free = fs.free_clusters().unwrap();
    assert_eq!(fs.open(None, "new.txt", create_file()), Err(Error::JournalFull));
    assert_eq!(fs.free_clusters().unwrap(), free);
}

#[test]
fn test_journal_disabled() {
    let options = FormatOptions {
        journal_copies: 0,
        ..FormatOptions::default()
    };
    let (rd, fs) = formatted_with(&options);
    assert!(!fs.journal().is_enabled());
    let h = fs.open(None, "dir/file.txt", create_file()).unwrap();
    fs.write(h, 0, b"no journal").unwrap();
    assert_eq!(fs.stat(h).unwrap().size, 10);
    fs.unmount().unwrap();

    // The volume remembers how it was formatted.
    let err = FileSystem::mount(Arc::new(rd.clone()), MountOptions::default()).unwrap_err();
    assert_eq!(err, Error::InvalidGeometry);
    let matching = MountOptions {
        journal_copies: 0,
        ..MountOptions::default()
    };
    let fs = FileSystem::mount(Arc::new(rd), matching).unwrap();
    assert!(fs.exists("dir/file.txt"));
}

#[test]
fn test_boot_sector_slot_count_must_match() {
    let (rd, fs) = formatted();
    fs.unmount().unwrap();
    let fewer = MountOptions {
        bootsector_backups: 3,
        ..MountOptions::default()
    };
    let err = FileSystem::mount(Arc::new(rd.clone()), fewer).unwrap_err();
    assert_eq!(err, Error::InvalidGeometry);
    assert!(mount(&rd).exists(""));
}

#[test]
fn test_allocator_skips_bad_clusters() {
    let (rd, fs) = formatted();
    let dev = fs.device();
    let first = fs.allocator().alloc_cluster(&*dev, fs.fat()).unwrap();
    fs.fat().set_cluster_end(&*dev, first).unwrap();
    fs.fat().set_cluster_bad(&*dev, first + 1).unwrap();

    let second = fs.allocator().alloc_cluster(&*dev, fs.fat()).unwrap();
    assert_ne!(second, first + 1);
    assert_eq!(fs.fat().read_fat(&*dev, first + 1), FAT_ENTRY_BAD);
    assert!(nifat::FAT_ENTRY_FREE == fs.fat().read_fat(&*dev, second));
}

#[test]
fn test_fat_scan_steps_over_reserved_clusters() {
    let (rd, fs) = formatted();
    fs.unmount().unwrap();
    let options = MountOptions {
        free_map: false,
        ..MountOptions::default()
    };
    let fs = FileSystem::mount(Arc::new(rd), options).unwrap();
    assert_eq!(fs.free_clusters().unwrap(), None);

    let dev = fs.device();
    let mut allocated = 0;
    while let Ok(ca) = fs.allocator().alloc_cluster(&*dev, fs.fat()) {
        fs.fat().set_cluster_end(&*dev, ca).unwrap();
        allocated += 1;
    }
    // Every reserved cluster lengthens the step, so free clusters right
    // behind the later ones are jumped over.
    assert_eq!(allocated, 2001);
    for ca in [590, 779, 1151, 1445, 1467, 1714] {
        assert_eq!(fs.fat().read_fat(&*dev, ca), FAT_ENTRY_FREE);
    }
    // The scan restarts at the root and steps the same way.
    assert_eq!(fs.allocator().alloc_cluster(&*dev, fs.fat()), Err(Error::NoSpace));
}

#[test]
fn test_allocator_exhaustion() {
    let (_, fs) = formatted();
    let dev = fs.device();
    let mut allocated = Vec::new();
    loop {
        match fs.allocator().alloc_cluster(&*dev, fs.fat()) {
            Ok(ca) => {
                fs.fat().set_cluster_end(&*dev, ca).unwrap();
                allocated.push(ca);
            }
            Err(e) => {
                assert_eq!(e, Error::NoSpace);
                break;
            }
        }
    }
    assert_eq!(allocated.len(), 2026);
    assert_eq!(fs.free_clusters().unwrap(), Some(0));
    assert_eq!(fs.open(None, "full.txt", create_file()), Err(Error::NoSpace));

    let freed = allocated[100];
    fs.allocator().dealloc_cluster(&*dev, fs.fat(), freed).unwrap();
    assert_eq!(fs.allocator().alloc_cluster(&*dev, fs.fat()), Ok(freed));
}
