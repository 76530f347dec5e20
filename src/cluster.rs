//! Cluster addressing and raw cluster I/O.

use crate::bootsector::VolumeInfo;
use crate::error::{FsError, Result};
use crate::BlockDevice;

fn clamp(info: &VolumeInfo, offset: usize, len: usize) -> usize {
    let cluster_size = info.cluster_size as usize;
    if offset >= cluster_size { 0 } else { len.min(cluster_size - offset) }
}

/// Reads from `ca` starting `offset` bytes in. Never crosses the cluster end.
/// Returns the number of bytes read.
pub fn readoff_cluster<D: BlockDevice + ?Sized>(
    device: &D,
    info: &VolumeInfo,
    ca: u32,
    offset: usize,
    buf: &mut [u8],
) -> Result<usize> {
    if !info.is_data_cluster(ca) {
        return Err(FsError::BadCluster);
    }
    let len = clamp(info, offset, buf.len());
    if len == 0 {
        return Ok(0);
    }
    let ss = info.bytes_per_sector as usize;
    let first = info.cluster_to_sector(ca) as usize;
    let mut done = 0;
    while done < len {
        let pos = offset + done;
        let in_sector = pos % ss;
        let chunk = (ss - in_sector).min(len - done);
        device.read_sector(first + pos / ss, in_sector, &mut buf[done..done + chunk])?;
        done += chunk;
    }
    Ok(len)
}

/// Writes into `ca` starting `offset` bytes in. Never crosses the cluster end.
/// Returns the number of bytes written.
pub fn writeoff_cluster<D: BlockDevice + ?Sized>(
    device: &D,
    info: &VolumeInfo,
    ca: u32,
    offset: usize,
    data: &[u8],
) -> Result<usize> {
    if !info.is_data_cluster(ca) {
        return Err(FsError::BadCluster);
    }
    let len = clamp(info, offset, data.len());
    if len == 0 {
        return Ok(0);
    }
    let ss = info.bytes_per_sector as usize;
    let first = info.cluster_to_sector(ca) as usize;
    let mut done = 0;
    while done < len {
        let pos = offset + done;
        let in_sector = pos % ss;
        let chunk = (ss - in_sector).min(len - done);
        device.write_sector(first + pos / ss, in_sector, &data[done..done + chunk])?;
        done += chunk;
    }
    Ok(len)
}

pub fn read_cluster<D: BlockDevice + ?Sized>(device: &D, info: &VolumeInfo, ca: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; info.cluster_size as usize];
    readoff_cluster(device, info, ca, 0, &mut buf)?;
    Ok(buf)
}

pub fn write_cluster<D: BlockDevice + ?Sized>(device: &D, info: &VolumeInfo, ca: u32, data: &[u8]) -> Result<usize> {
    writeoff_cluster(device, info, ca, 0, data)
}

/// Copies `src` into `dst` sector by sector through `scratch`, which must
/// hold at least one sector.
pub fn copy_cluster<D: BlockDevice + ?Sized>(
    device: &D,
    info: &VolumeInfo,
    src: u32,
    dst: u32,
    scratch: &mut [u8],
) -> Result<()> {
    let ss = info.bytes_per_sector as usize;
    if scratch.len() < ss {
        return Err(FsError::OutOfBounds);
    }
    if !info.is_data_cluster(src) || !info.is_data_cluster(dst) {
        return Err(FsError::BadCluster);
    }
    let (src_start, dst_start) = (info.cluster_to_sector(src) as usize, info.cluster_to_sector(dst) as usize);
    let sector = &mut scratch[..ss];
    for i in 0..info.sectors_per_cluster as usize {
        device.read_sector(src_start + i, 0, sector)?;
        device.write_sector(dst_start + i, 0, sector)?;
    }
    Ok(())
}
