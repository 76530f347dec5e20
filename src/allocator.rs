//! Cluster allocation on top of the FAT.

use log::{debug, warn};

use crate::bitmap::FreeMap;
use crate::error::{FsError, Result};
use crate::fat::{self, Fat};
use crate::lock::Locked;
use crate::BlockDevice;

#[derive(Debug)]
struct AllocState {
    cursor: u32,
    skip_step: u32,
    free_map: Option<FreeMap>,
}

#[derive(Debug)]
pub struct Allocator {
    state: Locked<AllocState>,
}

impl Allocator {
    pub fn new(root_cluster: u32, free_map: Option<FreeMap>, lock_retries: u32) -> Self {
        Self {
            state: Locked::new(
                AllocState {
                    cursor: root_cluster,
                    skip_step: 1,
                    free_map,
                },
                lock_retries,
            ),
        }
    }

    /// Reserves a free cluster and returns it.
    ///
    /// The FAT entry is left Free; the caller marks it End or links it.
    /// Bad and reserved clusters push the scan forward by a step that grows
    /// with every hit and only falls back to one when the volume is exhausted.
    pub fn alloc_cluster<D: BlockDevice + ?Sized>(&self, device: &D, fat: &Fat) -> Result<u32> {
        let info = *fat.info();
        let mut state = self.state.write()?;
        let state = &mut *state;

        if let Some(map) = state.free_map.as_mut() {
            while let Some(ca) = map.set_first_fit_bit(state.cursor) {
                state.cursor = ca + 1;
                if fat::is_free(fat.read_fat(device, ca)) {
                    debug!("alloc_cluster: bitmap hit {}", ca);
                    return Ok(ca);
                }
                warn!("alloc_cluster: bitmap claimed {} free but the FAT disagrees", ca);
            }
        }

        let mut ca = state.cursor.max(info.root_cluster);
        while ca < info.total_clusters {
            let value = fat.read_fat(device, ca);
            if fat::is_free(value) {
                state.cursor = ca + 1;
                if let Some(map) = state.free_map.as_mut() {
                    map.set_bit_at(ca, true);
                }
                debug!("alloc_cluster: FAT scan hit {}", ca);
                return Ok(ca);
            }
            if fat::is_bad(value) || fat::is_reserved(value) {
                ca = ca.saturating_add(state.skip_step);
                state.skip_step += 1;
            } else {
                ca += 1;
            }
        }

        state.cursor = info.root_cluster;
        state.skip_step = 1;
        warn!("alloc_cluster: volume exhausted");
        Err(FsError::NoSpace)
    }

    /// Frees one cluster. Freeing an already free cluster succeeds.
    pub fn dealloc_cluster<D: BlockDevice + ?Sized>(&self, device: &D, fat: &Fat, ca: u32) -> Result<()> {
        if !fat.info().is_data_cluster(ca) {
            return Err(FsError::BadCluster);
        }
        let mut state = self.state.write()?;
        if !fat::is_free(fat.read_fat(device, ca)) {
            fat.set_cluster_free(device, ca)?;
        }
        if let Some(map) = state.free_map.as_mut() {
            map.set_bit_at(ca, false);
        }
        Ok(())
    }

    /// Frees every cluster of the chain starting at `ca`.
    /// Stops at End, at a Free link and at anything that is not a data cluster.
    pub fn dealloc_chain<D: BlockDevice + ?Sized>(&self, device: &D, fat: &Fat, ca: u32) -> Result<u32> {
        let info = *fat.info();
        let mut ca = ca;
        let mut freed = 0;
        while info.is_data_cluster(ca) && freed < info.total_clusters {
            let next = fat.read_fat(device, ca);
            if fat::is_free(next) {
                break;
            }
            self.dealloc_cluster(device, fat, ca)?;
            freed += 1;
            if fat::is_end(next) {
                break;
            }
            ca = next;
        }
        debug!("dealloc_chain: freed {} clusters", freed);
        Ok(freed)
    }

    /// Free clusters according to the bitmap, if one is kept.
    pub fn free_count(&self) -> Result<Option<u32>> {
        Ok(self.state.read()?.free_map.as_ref().map(FreeMap::free_count))
    }
}
