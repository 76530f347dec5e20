//! Path resolution and 8.3 name conversion.

use log::debug;

use crate::config::*;
use crate::ecache::Ecache;
use crate::error::{FsError, Result};
use crate::structs::DirEntry;
use crate::{BlockDevice, FileSystem};

pub const PATH_SEPARATOR: char = '/';

fn valid_char(c: u8) -> bool {
    c.is_ascii_graphic() && !matches!(c, b'"' | b'*' | b'+' | b',' | b'/' | b':' | b';' | b'<' | b'=' | b'>' | b'?' | b'[' | b'\\' | b']' | b'|')
}

/// Converts `test.txt` into `TEST    TXT`.
pub fn to_fatname(name: &str) -> Result<[u8; NAME_LEN]> {
    let mut out = [b' '; NAME_LEN];
    match name {
        "." => {
            out[0] = b'.';
            return Ok(out);
        }
        ".." => {
            out[..2].copy_from_slice(b"..");
            return Ok(out);
        }
        _ => {}
    }

    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) => (base, ext),
        None => (name, ""),
    };
    if base.is_empty() || base.len() > BASE_LEN || ext.len() > EXT_LEN {
        return Err(FsError::InvalidFileName);
    }
    for (dst, src) in out[..BASE_LEN].iter_mut().zip(base.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    for (dst, src) in out[BASE_LEN..].iter_mut().zip(ext.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    if !base.bytes().chain(ext.bytes()).all(valid_char) || out[0] == ENTRY_FREE {
        return Err(FsError::InvalidFileName);
    }
    Ok(out)
}

/// Converts `TEST    TXT` back into `TEST.TXT`.
pub fn from_fatname(fatname: &[u8; NAME_LEN]) -> String {
    let base = trim_padding(&fatname[..BASE_LEN]);
    let ext = trim_padding(&fatname[BASE_LEN..]);
    if ext.is_empty() { base } else { format!("{}.{}", base, ext) }
}

pub(crate) fn trim_padding(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&c| c != b' ' && c != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Splits a path into its non-empty components.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(PATH_SEPARATOR).filter(|s| !s.is_empty() && *s != ".")
}

/// Result of a path walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub entry: DirEntry,
    /// First cluster of the directory holding `entry`.
    pub parent: u32,
}

/// What to create when a component is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Create {
    No,
    /// Missing components become directories, the last one a file.
    File,
    /// Every missing component becomes a directory.
    Directory,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Pseudo entry describing the root directory.
    pub fn root_entry(&self) -> DirEntry {
        DirEntry::create(b"/          ", true, self.info.root_cluster, 0)
    }

    /// Walks `path` from the directory at `start`.
    /// `start_cache` accelerates the lookup of the first component.
    pub fn resolve(
        &self,
        start: DirEntry,
        start_cache: Option<&mut Ecache>,
        path: &str,
        create: Create,
    ) -> Result<Resolved> {
        let names = components(path).map(to_fatname).collect::<Result<Vec<_>>>()?;
        let mut current = Resolved {
            entry: start,
            parent: start.cluster,
        };
        let mut cache = start_cache;

        for (i, name) in names.iter().enumerate() {
            if !current.entry.is_dir() {
                return Err(FsError::NotDirectory);
            }
            if name[0] == b'.' {
                return Err(FsError::InvalidPath);
            }
            let dir = current.entry.cluster;
            let last = i + 1 == names.len();
            let entry = match self.entry_search(name, dir, cache.as_deref()) {
                Ok(hit) => hit.entry,
                Err(FsError::NotFound) if create != Create::No => {
                    let is_dir = !last || create == Create::Directory;
                    self.create_entry(dir, cache.as_deref_mut(), name, is_dir)?
                }
                Err(e) => return Err(e),
            };
            debug!("resolve: {:?} -> cluster {}", String::from_utf8_lossy(name), entry.cluster);
            current = Resolved { entry, parent: dir };
            cache = None;
        }
        Ok(current)
    }

    fn create_entry(
        &self,
        dir: u32,
        cache: Option<&mut Ecache>,
        name: &[u8; NAME_LEN],
        is_dir: bool,
    ) -> Result<DirEntry> {
        let ca = self.alloc_zeroed()?;
        let entry = DirEntry::create(name, is_dir, ca, 0);
        let result = match cache {
            Some(cache) => self.entry_add(dir, Some(cache), &entry),
            None => self.with_dir_cache(dir, |c| self.entry_add(dir, c, &entry)),
        };
        if let Err(e) = result {
            let _ = self.allocator.dealloc_cluster(&*self.device, &self.fat, ca);
            return Err(e);
        }
        Ok(entry.normalized())
    }
}
