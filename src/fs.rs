use alloc::sync::Arc;

use log::{debug, info, warn};

use crate::allocator::Allocator;
use crate::bitmap::FreeMap;
use crate::bootsector::{self, VolumeInfo};
use crate::config::*;
use crate::ctable::{ContentKind, ContentTable, Handle, OpenContent, OpenMode};
use crate::ecache::{Ecache, EntryKind};
use crate::error::{FsError, Result};
use crate::fat::Fat;
use crate::journal::{journal_sector, Journal};
use crate::path::{components, from_fatname, to_fatname, trim_padding, Create};
use crate::structs::DirEntry;
use crate::{cluster, BlockDevice};

/// How `copy` treats the data of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// The destination gets its own copy of every cluster.
    Deep,
    /// The destination points at the source's clusters.
    Shallow,
}

/// Description of an open content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    /// `NAME.EXT`
    pub full_name: String,
    pub name: String,
    pub extension: String,
    pub size: u32,
    pub kind: EntryKind,
    pub cluster: u32,
}

#[derive(Debug)]
pub struct FileSystem<D: BlockDevice> {
    pub(crate) device: Arc<D>,
    pub(crate) info: VolumeInfo,
    pub(crate) options: MountOptions,
    pub(crate) fat: Fat,
    pub(crate) allocator: Allocator,
    pub(crate) journal: Journal,
    pub(crate) ctable: ContentTable,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Lays out an empty volume on `device` and mounts it.
    pub fn format(device: Arc<D>, options: &FormatOptions) -> Result<Self> {
        let total_sectors = match options.total_sectors {
            Some(ts) => ts,
            None => u32::try_from(device.num_sectors()).map_err(|_| FsError::InvalidGeometry)?,
        };
        let bs = bootsector::layout_boot_sector(options, total_sectors, device.sector_size() as u32)?;
        let info = VolumeInfo::from_boot_sector(&bs, options.journal_copies, options.bootsector_backups)?;

        // Boot sector copies and journal areas sit inside the data region.
        let mut areas: Vec<(u32, u32)> = (0..options.bootsector_backups)
            .map(|i| (bootsector::bootsector_sector(i, total_sectors), 1))
            .collect();
        areas.extend((0..options.journal_copies).map(|n| (journal_sector(n, total_sectors), info.sectors_per_cluster)));
        let fat_region = (info.reserved_sectors, info.first_data_sector + info.sectors_per_cluster);
        for (i, &(start, len)) in areas.iter().enumerate() {
            let end = start + len;
            let overlaps = |a: u32, b: u32| start < b && a < end;
            if end > total_sectors
                || overlaps(fat_region.0, fat_region.1)
                || areas[..i].iter().any(|&(s, l)| overlaps(s, s + l))
            {
                return Err(FsError::InvalidGeometry);
            }
        }

        let mut table = vec![FAT_ENTRY_FREE; info.total_clusters as usize];
        table[0] = FAT_ENTRY_RESERVED;
        table[1] = FAT_ENTRY_END;
        table[info.root_cluster as usize] = FAT_ENTRY_END;
        for &(start, len) in &areas {
            for sector in (start..start + len).filter(|s| *s >= info.first_data_sector) {
                let ca = (sector - info.first_data_sector) / info.sectors_per_cluster + info.root_cluster;
                if let Some(slot) = table.get_mut(ca as usize) {
                    *slot = FAT_ENTRY_RESERVED;
                }
            }
        }

        let dev = &*device;
        let mut fat_bytes = vec![0u8; info.fat_size as usize * info.bytes_per_sector as usize];
        for (chunk, value) in fat_bytes.chunks_exact_mut(FAT_ENTRY_SIZE).zip(&table) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        for copy in 0..info.fat_count {
            let (sector, _) = info.fat_location(copy, 0);
            dev.write_sector(sector as usize, 0, &fat_bytes)?;
        }
        cluster::write_cluster(dev, &info, info.root_cluster, &vec![0u8; info.cluster_size as usize])?;
        Journal::new(info, DEFAULT_LOCK_RETRIES, false).wipe(dev)?;
        for i in 0..options.bootsector_backups {
            bootsector::write_boot_sector(dev, &bs, bootsector::bootsector_sector(i, total_sectors))?;
        }
        dev.flush()?;
        info!(
            "format: {} sectors, {} clusters, {} reserved for boot sectors and journal",
            total_sectors,
            info.total_clusters,
            table.iter().skip(info.root_cluster as usize).filter(|v| **v == FAT_ENTRY_RESERVED).count()
        );

        Self::mount(
            device,
            MountOptions {
                total_sectors: Some(total_sectors),
                bootsector_backups: options.bootsector_backups,
                journal_copies: options.journal_copies,
                ..MountOptions::default()
            },
        )
    }

    /// Loads the boot sector, replays the journal and prepares the content table.
    pub fn mount(device: Arc<D>, options: MountOptions) -> Result<Self> {
        let total_sectors = match options.total_sectors {
            Some(ts) => ts,
            None => u32::try_from(device.num_sectors()).map_err(|_| FsError::InvalidGeometry)?,
        };
        if total_sectors == 0 {
            return Err(FsError::InvalidGeometry);
        }
        let repair = options.repair_bootsectors && !options.read_only;
        let bs = bootsector::load_boot_sector(&*device, total_sectors, options.bootsector_backups, repair)?;
        if bs.total_sectors() != total_sectors || bs.bytes_per_sector as usize != device.sector_size() {
            return Err(FsError::InvalidGeometry);
        }
        let (journal_copies, _) = bs.redundancy();
        if journal_copies != options.journal_copies {
            warn!("mount: volume has {} journal copies, asked to use {}", journal_copies, options.journal_copies);
            return Err(FsError::InvalidGeometry);
        }
        let info = VolumeInfo::from_boot_sector(&bs, options.journal_copies, options.bootsector_backups)?;

        let fat = Fat::new(info, options.fat_cache, options.read_only);
        let free_map = if options.fat_cache || options.free_map {
            let table = fat.load_fat_mirror(&*device)?;
            options.free_map.then(|| FreeMap::from_table(&table, info.root_cluster))
        } else {
            None
        };

        let fs = Self {
            allocator: Allocator::new(info.root_cluster, free_map, options.lock_retries),
            journal: Journal::new(info, options.lock_retries, options.read_only),
            ctable: ContentTable::new(options.ctable_size, options.lock_retries),
            device,
            info,
            options,
            fat,
        };
        let replayed = fs.journal.restore_from_journal(&*fs.device)?;
        info!(
            "mount: {} clusters of {} bytes, {} journal operations replayed",
            info.total_clusters, info.cluster_size, replayed
        );
        Ok(fs)
    }

    /// Releases every handle and flushes the device.
    pub fn unmount(self) -> Result<()> {
        for handle in self.ctable.handles()? {
            self.ctable.destroy(handle)?;
        }
        self.device.flush()?;
        info!("unmount");
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(self.root_entry(), None, path, Create::No).is_ok()
    }

    /// Opens `path` relative to `parent`, or to the root when `parent` is `None`.
    /// An empty path opens the starting directory itself.
    pub fn open(&self, parent: Option<Handle>, path: &str, mode: OpenMode) -> Result<Handle> {
        let handle = self.ctable.alloc()?;
        match self.open_content(parent, path, mode) {
            Ok(content) => {
                self.ctable.setup(handle, content)?;
                debug!("open({:?}) -> {:?}", path, handle);
                Ok(handle)
            }
            Err(e) => {
                self.ctable.destroy(handle)?;
                Err(e)
            }
        }
    }

    fn open_content(&self, parent: Option<Handle>, path: &str, mode: OpenMode) -> Result<OpenContent> {
        let create = if !mode.contains(OpenMode::CREATE) {
            Create::No
        } else if self.options.read_only {
            return Err(FsError::ReadOnly);
        } else if mode.contains(OpenMode::DIRECTORY) {
            Create::Directory
        } else {
            Create::File
        };

        let resolved = match parent {
            None => self.resolve(self.root_entry(), None, path, create)?,
            Some(p) => {
                let start = self.ctable.get(p)?;
                if !start.meta.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                let mut index = self.ctable.with_mut(p, |c| c.index.take())?;
                let resolved = self.resolve(start.meta, index.as_mut(), path, create);
                if index.is_some() {
                    let _ = self.ctable.set_index(p, index);
                }
                let mut resolved = resolved?;
                if components(path).next().is_none() {
                    resolved.parent = start.parent_cluster;
                }
                resolved
            }
        };

        let entry = resolved.entry;
        if mode.contains(OpenMode::FILE) && entry.is_dir() {
            return Err(FsError::NotFile);
        }
        if mode.contains(OpenMode::DIRECTORY) && !entry.is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok(OpenContent::new(entry, resolved.parent, mode))
    }

    pub fn close(&self, handle: Handle) -> Result<()> {
        self.ctable.destroy(handle)
    }

    /// Builds the lookup cache of an open directory, replacing any previous one.
    pub fn index(&self, handle: Handle) -> Result<()> {
        let content = self.ctable.get(handle)?;
        if !content.meta.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let index = self.index_content(content.data_cluster)?;
        debug!("index: {} entries in cluster {}", index.len(), content.data_cluster);
        self.ctable.set_index(handle, Some(index))
    }

    pub fn stat(&self, handle: Handle) -> Result<ContentInfo> {
        let content = self.ctable.get(handle)?;
        let (name, extension) = match &content.kind {
            ContentKind::File { name, extension } => (trim_padding(name), trim_padding(extension)),
            ContentKind::Directory { name } => (from_fatname(name), String::new()),
            ContentKind::Unknown => (String::new(), String::new()),
        };
        Ok(ContentInfo {
            full_name: from_fatname(&content.meta.name),
            name,
            extension,
            size: content.meta.size,
            kind: content.kind.entry_kind().unwrap_or(EntryKind::File),
            cluster: content.data_cluster,
        })
    }

    /// Renames an open content to `info.full_name`.
    pub fn change_meta(&self, handle: Handle, info: &ContentInfo) -> Result<()> {
        if self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        let content = self.ctable.get(handle)?;
        if self.is_root(&content) {
            return Err(FsError::AccessDenied);
        }
        let name = to_fatname(&info.full_name)?;
        if name == content.meta.name {
            return Ok(());
        }
        match self.entry_search(&name, content.parent_cluster, None) {
            Ok(_) => return Err(FsError::AlreadyExists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let mut meta = content.meta;
        meta.name = name;
        meta.seal();
        self.update_meta(handle, &content, meta)
    }

    /// Removes an open content with everything below it and closes the handle.
    pub fn delete(&self, handle: Handle) -> Result<()> {
        if self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        let content = self.ctable.get(handle)?;
        if self.is_root(&content) {
            return Err(FsError::AccessDenied);
        }
        let parent = content.parent_cluster;
        self.with_dir_cache(parent, |cache| self.entry_remove(parent, cache, &content.meta.name))?;
        self.ctable.destroy(handle)
    }

    pub(crate) fn is_root(&self, content: &OpenContent) -> bool {
        content.data_cluster == self.info.root_cluster
    }

    /// Writes `meta` over the entry of an open content and refreshes the handle.
    pub(crate) fn update_meta(&self, handle: Handle, content: &OpenContent, meta: DirEntry) -> Result<()> {
        let parent = content.parent_cluster;
        let written = self.with_dir_cache(parent, |cache| self.entry_edit(parent, cache, &content.meta.name, &meta))?;
        self.ctable.set_meta(handle, written)
    }

    /// Runs `f` with the cache of directory `ca` if an open handle built one.
    /// The cache is handed back only when `f` succeeds.
    pub(crate) fn with_dir_cache<R>(&self, ca: u32, f: impl FnOnce(Option<&mut Ecache>) -> Result<R>) -> Result<R> {
        match self.ctable.take_dir_index(ca)? {
            Some((handle, mut index)) => {
                let result = f(Some(&mut index));
                if result.is_ok() {
                    let _ = self.ctable.set_index(handle, Some(index));
                }
                result
            }
            None => f(None),
        }
    }

    /// Free clusters as tracked by the free map, when one is kept.
    pub fn free_clusters(&self) -> Result<Option<u32>> {
        self.allocator.free_count()
    }

    pub fn info(&self) -> &VolumeInfo {
        &self.info
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn fat(&self) -> &Fat {
        &self.fat
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn ctable(&self) -> &ContentTable {
        &self.ctable
    }

    pub fn device(&self) -> Arc<D> {
        Arc::clone(&self.device)
    }
}
