//! Common utilities for tests
#![allow(dead_code)]

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nifat::{BlockDevice, Error, FileSystem, FormatOptions, SECTOR_SIZE};

pub const ORANGE: &str = "\x1b[38;5;214m";
pub const RESET: &str = "\x1b[0m";

/// Sectors of the volume most tests run on: 8 MiB, 2040 clusters of 4 KiB.
pub const TEST_SECTORS: usize = 16384;

/// Provides a macro for logging messages during tests.
/// e.g. log!("placeholder") -> println!("[test] placeholder");
#[macro_export]
macro_rules! log {
    ($msg:expr, $($arg:tt)*) => {
        println!("{}[test] {}{}", crate::common::ORANGE, format!($msg, $($arg)*), crate::common::RESET)
    };
}

/// In-memory disk. Clones share the same storage, so a volume can be
/// mounted again after the previous `FileSystem` is gone.
#[derive(Clone, Debug)]
pub struct RamDisk {
    inner: Arc<Mutex<Vec<u8>>>,
    num_sectors: usize,
}

impl RamDisk {
    /// Creates a zeroed RamDisk of `num_sectors` sectors.
    pub fn new(num_sectors: usize) -> Self {
        RamDisk {
            inner: Arc::new(Mutex::new(vec![0u8; num_sectors * SECTOR_SIZE])),
            num_sectors,
        }
    }

    pub fn read_raw(&self, pos: usize, len: usize) -> Vec<u8> {
        self.inner.lock().unwrap()[pos..pos + len].to_vec()
    }

    pub fn write_raw(&self, pos: usize, data: &[u8]) {
        self.inner.lock().unwrap()[pos..pos + data.len()].copy_from_slice(data);
    }

    pub fn flip_bit(&self, pos: usize, bit: u8) {
        self.inner.lock().unwrap()[pos] ^= 1 << bit;
    }

    pub fn sector_pos(sector: u32) -> usize {
        sector as usize * SECTOR_SIZE
    }

    /// Copy of the current contents that no longer shares storage.
    pub fn duplicate(&self) -> Self {
        RamDisk {
            inner: Arc::new(Mutex::new(self.inner.lock().unwrap().clone())),
            num_sectors: self.num_sectors,
        }
    }
}

impl BlockDevice for RamDisk {
    fn num_sectors(&self) -> usize {
        self.num_sectors
    }

    fn read_sector(&self, sector: usize, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        let start = sector * SECTOR_SIZE + offset;
        let data = self.inner.lock().unwrap();
        if start + buf.len() > data.len() {
            return Err(Error::IoError);
        }
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_sector(&self, sector: usize, offset: usize, buf: &[u8]) -> Result<(), Error> {
        let start = sector * SECTOR_SIZE + offset;
        let mut data = self.inner.lock().unwrap();
        if start + buf.len() > data.len() {
            return Err(Error::IoError);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<(), Error> {
        // In a RAM disk, flushing is a no-op since data is already in memory.
        Ok(())
    }
}

/// RamDisk whose writes into `sectors` fail while armed.
#[derive(Clone)]
pub struct FaultyDisk {
    disk: RamDisk,
    sectors: Range<usize>,
    armed: Arc<AtomicBool>,
}

impl FaultyDisk {
    pub fn new(disk: RamDisk, sectors: Range<usize>) -> Self {
        FaultyDisk {
            disk,
            sectors,
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn arm(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }
}

impl BlockDevice for FaultyDisk {
    fn num_sectors(&self) -> usize {
        self.disk.num_sectors()
    }

    fn read_sector(&self, sector: usize, offset: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.disk.read_sector(sector, offset, buf)
    }

    fn write_sector(&self, sector: usize, offset: usize, buf: &[u8]) -> Result<(), Error> {
        if self.armed.load(Ordering::SeqCst) && self.sectors.contains(&sector) {
            return Err(Error::IoError);
        }
        self.disk.write_sector(sector, offset, buf)
    }

    fn flush(&self) -> Result<(), Error> {
        self.disk.flush()
    }
}

/// Formats a fresh test volume with default options.
pub fn formatted() -> (RamDisk, FileSystem<RamDisk>) {
    formatted_with(&FormatOptions::default())
}

pub fn formatted_with(options: &FormatOptions) -> (RamDisk, FileSystem<RamDisk>) {
    let rd = RamDisk::new(TEST_SECTORS);
    let fs = FileSystem::format(Arc::new(rd.clone()), options).unwrap();
    (rd, fs)
}

/// Byte pattern that differs from one cluster to the next.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ (i / 4096) as u8).collect()
}
