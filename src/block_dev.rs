use crate::error::FsError;

pub trait BlockDevice: Send + Sync {
    /// Returns the number of sectors on the device.
    fn num_sectors(&self) -> usize;

    /// Reads `buf.len()` bytes starting at `offset` inside `sector`.
    /// The range may run past the end of the sector into the following ones.
    fn read_sector(&self, sector: usize, offset: usize, buf: &mut [u8]) -> Result<(), FsError>;

    /// Writes `buf` starting at `offset` inside `sector`.
    fn write_sector(&self, sector: usize, offset: usize, buf: &[u8]) -> Result<(), FsError>;

    /// Flushes any cached data to the device.
    fn flush(&self) -> Result<(), FsError>;

    /// Returns the size of each sector in bytes.
    fn sector_size(&self) -> usize {
        crate::config::SECTOR_SIZE
    }
}
