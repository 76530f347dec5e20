//! In-memory free-cluster bitmap.
//! A set bit means the cluster is in use (or unusable); a clear bit means the
//! FAT holds Free for it. The FAT stays authoritative, the bitmap only spares
//! the allocator a scan.

use crate::fat;

const BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone)]
pub struct FreeMap {
    words: Vec<u64>,
    total: u32,
}

impl FreeMap {
    /// Builds the map from a full FAT table. Clusters below `first` are marked used.
    pub fn from_table(table: &[u32], first: u32) -> Self {
        let total = table.len() as u32;
        let mut map = Self {
            words: vec![0; table.len().div_ceil(BITS)],
            total,
        };
        for (ca, value) in table.iter().enumerate() {
            if (ca as u32) < first || !fat::is_free(*value) {
                map.set_bit_at(ca as u32, true);
            }
        }
        map
    }

    pub fn is_used(&self, ca: u32) -> bool {
        if ca >= self.total {
            return true;
        }
        let ca = ca as usize;
        self.words[ca / BITS] & (1 << (ca % BITS)) != 0
    }

    /// Sets or clears the bit of `ca`. Returns the previous state.
    pub fn set_bit_at(&mut self, ca: u32, used: bool) -> bool {
        if ca >= self.total {
            return true;
        }
        let pre = self.is_used(ca);
        let (word, bit) = (ca as usize / BITS, ca as usize % BITS);
        if used {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
        pre
    }

    /// Finds the first clear bit at or after `start`, sets it and returns its cluster.
    pub fn set_first_fit_bit(&mut self, start: u32) -> Option<u32> {
        let mut ca = start as usize;
        while ca < self.total as usize {
            let word = self.words[ca / BITS] | ((1u64 << (ca % BITS)) - 1);
            if word == u64::MAX {
                ca = (ca / BITS + 1) * BITS;
                continue;
            }
            let found = (ca / BITS) * BITS + word.trailing_ones() as usize;
            if found >= self.total as usize {
                return None;
            }
            self.set_bit_at(found as u32, true);
            return Some(found as u32);
        }
        None
    }

    pub fn free_count(&self) -> u32 {
        (0..self.total).filter(|ca| !self.is_used(*ca)).count() as u32
    }
}
