//! Content data access: reading, writing, truncating and copying.

use log::{debug, warn};

use crate::cluster;
use crate::ctable::{Handle, OpenContent, OpenMode};
use crate::error::{FsError, Result};
use crate::fat;
use crate::fs::CopyMode;
use crate::{BlockDevice, FileSystem};

impl<D: BlockDevice> FileSystem<D> {
    /// Next cluster of a chain, or `None` at its end.
    fn next_cluster(&self, ca: u32) -> Result<Option<u32>> {
        let next = self.fat.read_fat(&*self.device, ca);
        if fat::is_end(next) {
            return Ok(None);
        }
        if !self.info.is_data_cluster(next) {
            warn!("chain broken after cluster {}: {:#x}", ca, next);
            return Err(FsError::BadCluster);
        }
        Ok(Some(next))
    }

    /// Like `next_cluster`, growing the chain when it ends.
    fn next_or_extend(&self, ca: u32) -> Result<u32> {
        match self.next_cluster(ca)? {
            Some(next) => Ok(next),
            None => self.extend_chain(ca),
        }
    }

    fn writable_file(&self, handle: Handle) -> Result<OpenContent> {
        if self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        let content = self.ctable.get(handle)?;
        if content.meta.is_dir() {
            return Err(FsError::NotFile);
        }
        if !content.mode.contains(OpenMode::WRITE) {
            return Err(FsError::AccessDenied);
        }
        Ok(content)
    }

    /// Reads from an open file at `offset`. Stops at the file size.
    /// Returns the number of bytes read.
    pub fn read(&self, handle: Handle, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let content = self.ctable.get(handle)?;
        if content.meta.is_dir() {
            return Err(FsError::NotFile);
        }
        if !content.mode.contains(OpenMode::READ) {
            return Err(FsError::AccessDenied);
        }
        if offset >= content.meta.size {
            return Ok(0);
        }
        let len = buf.len().min((content.meta.size - offset) as usize);
        self.read_chain(content.data_cluster, offset, &mut buf[..len])
    }

    fn read_chain(&self, head: u32, offset: u32, buf: &mut [u8]) -> Result<usize> {
        let cluster_size = self.info.cluster_size;
        let mut ca = head;
        for _ in 0..offset / cluster_size {
            match self.next_cluster(ca)? {
                Some(next) => ca = next,
                None => return Ok(0),
            }
        }

        let mut in_cluster = (offset % cluster_size) as usize;
        let mut done = 0;
        while done < buf.len() {
            done += cluster::readoff_cluster(&*self.device, &self.info, ca, in_cluster, &mut buf[done..])?;
            in_cluster = 0;
            if done == buf.len() {
                break;
            }
            match self.next_cluster(ca)? {
                Some(next) => ca = next,
                None => break,
            }
        }
        Ok(done)
    }

    /// Writes `data` into an open file at `offset`, growing it as needed.
    /// Returns the number of bytes written.
    pub fn write(&self, handle: Handle, offset: u32, data: &[u8]) -> Result<usize> {
        let content = self.writable_file(handle)?;
        let end = offset as u64 + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(FsError::FileTooLarge);
        }
        if data.is_empty() {
            return Ok(0);
        }

        self.write_at(content.data_cluster, offset, data)?;

        let end = end as u32;
        if end > content.meta.size {
            let mut meta = content.meta;
            meta.size = end;
            meta.seal();
            self.update_meta(handle, &content, meta)?;
        }
        debug!("write: {} bytes at {} into cluster {}", data.len(), offset, content.data_cluster);
        Ok(data.len())
    }

    /// Keeps `size` bytes of an open file starting at `offset`, moved to
    /// the front. Clusters past the new end are released; the first one
    /// always stays.
    pub fn truncate(&self, handle: Handle, offset: u32, size: u32) -> Result<()> {
        let content = self.writable_file(handle)?;
        let old_size = content.meta.size;
        if offset > old_size {
            return Err(FsError::OutOfBounds);
        }
        let new_size = size.min(old_size - offset);
        let head = content.data_cluster;

        if offset > 0 && new_size > 0 {
            let mut chunk = vec![0u8; self.info.cluster_size as usize];
            let mut moved = 0u32;
            while moved < new_size {
                let len = chunk.len().min((new_size - moved) as usize);
                let read = self.read_chain(head, offset + moved, &mut chunk[..len])?;
                self.write_at(head, moved, &chunk[..read])?;
                if read < len {
                    break;
                }
                moved += read as u32;
            }
        }

        let keep = new_size.div_ceil(self.info.cluster_size).max(1);
        let mut last = head;
        let mut short = false;
        for _ in 1..keep {
            match self.next_cluster(last)? {
                Some(next) => last = next,
                None => {
                    short = true;
                    break;
                }
            }
        }
        if !short {
            if let Some(rest) = self.next_cluster(last)? {
                self.fat.set_cluster_end(&*self.device, last)?;
                self.free_chain(rest)?;
            }
        }

        if new_size != old_size {
            let mut meta = content.meta;
            meta.size = new_size;
            meta.seal();
            self.update_meta(handle, &content, meta)?;
        }
        debug!("truncate: cluster {} now {} bytes", head, new_size);
        Ok(())
    }

    /// Writes into the chain at `head`, growing it as needed. No entry is touched.
    fn write_at(&self, head: u32, offset: u32, data: &[u8]) -> Result<()> {
        let cluster_size = self.info.cluster_size;
        let mut ca = head;
        for _ in 0..offset / cluster_size {
            ca = self.next_or_extend(ca)?;
        }
        let mut in_cluster = (offset % cluster_size) as usize;
        let mut done = 0;
        while done < data.len() {
            done += cluster::writeoff_cluster(&*self.device, &self.info, ca, in_cluster, &data[done..])?;
            in_cluster = 0;
            if done < data.len() {
                ca = self.next_or_extend(ca)?;
            }
        }
        Ok(())
    }

    /// Replaces the content of `dst` with the content of `src`.
    pub fn copy(&self, src: Handle, dst: Handle, mode: CopyMode) -> Result<()> {
        if self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        let source = self.ctable.get(src)?;
        let target = self.ctable.get(dst)?;
        if !target.mode.contains(OpenMode::WRITE) {
            return Err(FsError::AccessDenied);
        }
        match (source.meta.is_dir(), target.meta.is_dir()) {
            (true, false) => return Err(FsError::NotDirectory),
            (false, true) => return Err(FsError::NotFile),
            _ => {}
        }
        if self.is_root(&target) {
            return Err(FsError::AccessDenied);
        }
        if source.data_cluster == target.data_cluster {
            return Ok(());
        }

        let head = match mode {
            CopyMode::Shallow => source.data_cluster,
            CopyMode::Deep if source.meta.is_dir() => self.deep_copy_directory(source.data_cluster, 0)?,
            CopyMode::Deep => self.deep_copy_chain(source.data_cluster)?,
        };

        let mut meta = target.meta;
        meta.cluster = head;
        meta.size = source.meta.size;
        meta.seal();
        if let Err(e) = self.update_meta(dst, &target, meta) {
            if mode == CopyMode::Deep {
                let _ = self.release(head, source.meta.is_dir());
            }
            return Err(e);
        }
        self.ctable.set_index(dst, None)?;
        self.release(target.data_cluster, target.meta.is_dir())?;
        debug!("copy({:?}): cluster {} -> {}", mode, source.data_cluster, head);
        Ok(())
    }

    fn release(&self, head: u32, is_dir: bool) -> Result<()> {
        if is_dir {
            self.erase_directory(head, 0)?;
        }
        self.free_chain(head)
    }

    /// Duplicates the chain at `head` cluster by cluster.
    fn deep_copy_chain(&self, head: u32) -> Result<u32> {
        let new_head = self.alloc_zeroed()?;
        let result = self.copy_chain_into(head, new_head);
        if let Err(e) = result {
            let _ = self.free_chain(new_head);
            return Err(e);
        }
        Ok(new_head)
    }

    fn copy_chain_into(&self, src: u32, dst: u32) -> Result<()> {
        let device = &*self.device;
        let mut scratch = vec![0u8; self.info.bytes_per_sector as usize];
        let (mut src, mut dst) = (src, dst);
        let mut copied = 0u32;
        loop {
            cluster::copy_cluster(device, &self.info, src, dst, &mut scratch)?;
            copied += 1;
            match self.next_cluster(src)? {
                Some(_) if copied >= self.info.total_clusters => return Err(FsError::Corrupted),
                Some(next) => {
                    src = next;
                    dst = self.extend_chain(dst)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Duplicates a directory and, recursively, everything below it.
    fn deep_copy_directory(&self, head: u32, depth: u32) -> Result<u32> {
        if depth >= self.info.total_clusters {
            return Err(FsError::DepthExceeded);
        }
        let new_head = self.deep_copy_chain(head)?;
        let mut copies = Vec::new();
        let result = self.copy_children(new_head, depth, &mut copies);
        if let Err(e) = result {
            // Children not yet rewritten still point at the source.
            for (cluster, is_dir) in copies {
                let _ = self.release(cluster, is_dir);
            }
            let _ = self.free_chain(new_head);
            return Err(e);
        }
        Ok(new_head)
    }

    fn copy_children(&self, dir: u32, depth: u32, copies: &mut Vec<(u32, bool)>) -> Result<()> {
        for child in self.read_dir(dir)? {
            if child.name[0] == b'.' || !self.info.is_data_cluster(child.cluster) {
                continue;
            }
            let cluster = if child.is_dir() {
                self.deep_copy_directory(child.cluster, depth + 1)?
            } else {
                self.deep_copy_chain(child.cluster)?
            };
            copies.push((cluster, child.is_dir()));
            let mut updated = child;
            updated.cluster = cluster;
            updated.seal();
            self.entry_edit(dir, None, &child.name, &updated)?;
        }
        Ok(())
    }
}
