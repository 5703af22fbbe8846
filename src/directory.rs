//! Directories as inode-backed entry tables.
//!
//! Mirrors `original_source/filesys/directory.c`: a directory's content is
//! an array of fixed-size entries, grown by [`crate::DIR_GROW_STEP`] when
//! full, with `.`/`..` self-reference entries created only by `mkdir`
//! (the root, formatted directly, has neither — see `SPEC_FULL.md` §9).

use std::sync::Arc;

use log::warn;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::inode::{InodeHandle, InodeRegistry};
use crate::{DIR_GROW_STEP, NAME_MAX, ROOT_DIR_SECTOR};

pub(crate) const ENTRY_SIZE: usize = 4 + (NAME_MAX + 1) + 1 + 3; // inode sector + name + in_use + padding

struct DirEntry {
    in_use: bool,
    inode_sector: u32,
    name: String,
}

impl DirEntry {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.inode_sector.to_le_bytes());
        let name_bytes = self.name.as_bytes();
        buf[4..4 + name_bytes.len()].copy_from_slice(name_bytes);
        buf[4 + NAME_MAX + 1] = self.in_use as u8;
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let inode_sector = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let name_region = &buf[4..4 + NAME_MAX + 1];
        let nul = name_region.iter().position(|&b| b == 0).unwrap_or(name_region.len());
        let name = String::from_utf8_lossy(&name_region[..nul]).into_owned();
        let in_use = buf[4 + NAME_MAX + 1] != 0;
        Self {
            in_use,
            inode_sector,
            name,
        }
    }
}

/// A live handle onto a directory's entry table, with its own readdir
/// cursor (independent of any other opener's cursor).
pub struct DirHandle<D: BlockDevice> {
    inode: Arc<InodeHandle<D>>,
    registry: Arc<InodeRegistry<D>>,
    position: Mutex<u32>,
}

impl<D: BlockDevice> DirHandle<D> {
    /// Format a fresh directory inode at `sector` with room for
    /// `entry_capacity` entries, all initially unused.
    pub fn format(
        sector: u32,
        entry_capacity: usize,
        cache: &crate::buffer_cache::BufferCache<D>,
        allocator: &dyn crate::freemap::FreeSpaceAllocator,
    ) -> FsResult<()> {
        InodeHandle::format(sector, (entry_capacity * ENTRY_SIZE) as u32, true, cache, allocator)
    }

    /// Wrap an already-open directory inode handle.
    pub fn open(inode: Arc<InodeHandle<D>>, registry: Arc<InodeRegistry<D>>) -> FsResult<Self> {
        if !inode.is_directory() {
            return Err(FsError::InvalidArgument);
        }
        Ok(Self {
            inode,
            registry,
            position: Mutex::new(0),
        })
    }

    /// Open the root directory.
    pub fn open_root(registry: &Arc<InodeRegistry<D>>, cache: &Arc<crate::buffer_cache::BufferCache<D>>, allocator: &Arc<dyn crate::freemap::FreeSpaceAllocator>) -> FsResult<Self> {
        let inode = registry.open(ROOT_DIR_SECTOR, cache, allocator)?;
        Self::open(inode, registry.clone())
    }

    /// Produce a second handle to the same underlying directory inode with
    /// its own independent readdir cursor.
    pub fn reopen(&self) -> Self {
        Self {
            inode: self.inode.reopen(),
            registry: self.registry.clone(),
            position: Mutex::new(0),
        }
    }

    pub fn close(self) {
        self.registry.close(self.inode);
    }

    pub fn inode_sector(&self) -> u32 {
        self.inode.sector()
    }

    pub fn inode(&self) -> &Arc<InodeHandle<D>> {
        &self.inode
    }

    pub fn is_root(&self) -> bool {
        self.inode.sector() == ROOT_DIR_SECTOR
    }

    fn entry_count(&self) -> usize {
        self.inode.len() as usize / ENTRY_SIZE
    }

    fn read_entry(&self, index: usize) -> DirEntry {
        let mut buf = vec![0u8; ENTRY_SIZE];
        let offset = (index * ENTRY_SIZE) as u32;
        let mut pos = 0usize;
        while pos < ENTRY_SIZE {
            let n = self.inode.read_at(&mut buf[pos..], offset + pos as u32);
            if n == 0 {
                break;
            }
            pos += n;
        }
        DirEntry::decode(&buf)
    }

    fn write_entry(&self, index: usize, entry: &DirEntry) {
        let buf = entry.encode();
        self.inode.write_at(&buf, (index * ENTRY_SIZE) as u32);
    }

    /// Look up `name`, returning the inode sector it points to.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        for i in 0..self.entry_count() {
            let entry = self.read_entry(i);
            if entry.in_use && entry.name == name {
                return Some(entry.inode_sector);
            }
        }
        None
    }

    /// Add `name -> inode_sector`, growing the directory if no free slot
    /// remains. Fails if the name already exists or is invalid.
    pub fn add(&self, name: &str, inode_sector: u32) -> FsResult<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::InvalidArgument);
        }
        if self.lookup(name).is_some() {
            return Err(FsError::InvalidArgument);
        }

        let count = self.entry_count();
        for i in 0..count {
            if !self.read_entry(i).in_use {
                self.write_entry(
                    i,
                    &DirEntry {
                        in_use: true,
                        inode_sector,
                        name: name.to_string(),
                    },
                );
                return Ok(());
            }
        }

        let new_count = count + DIR_GROW_STEP;
        self.inode.resize((new_count * ENTRY_SIZE) as u32)?;
        self.write_entry(
            count,
            &DirEntry {
                in_use: true,
                inode_sector,
                name: name.to_string(),
            },
        );
        Ok(())
    }

    /// Remove `name`. Refuses to remove a non-empty directory, the root,
    /// or a directory with other live openers.
    pub fn remove(&self, name: &str, cache: &Arc<crate::buffer_cache::BufferCache<D>>, allocator: &Arc<dyn crate::freemap::FreeSpaceAllocator>) -> FsResult<()> {
        let (index, target_sector) = self
            .find_entry(name)
            .ok_or(FsError::NotFound)?;

        let target = self.registry.open(target_sector, cache, allocator)?;

        if target.is_directory() {
            let target_dir = DirHandle::open(target.clone(), self.registry.clone())?;
            let empty = target_dir.is_empty();
            let is_root = target_dir.is_root();
            let sole_opener = target.open_count() == 1;
            if !empty || is_root || !sole_opener {
                warn!("refusing to remove directory {name}: empty={empty} root={is_root} sole_opener={sole_opener}");
                self.registry.close(target_dir.inode.clone());
                return Err(FsError::Busy);
            }
            let mut entry = self.read_entry(index);
            entry.in_use = false;
            self.write_entry(index, &entry);
            target.mark_removed();
            target_dir.close();
            return Ok(());
        }

        let mut entry = self.read_entry(index);
        entry.in_use = false;
        self.write_entry(index, &entry);
        target.mark_removed();
        self.registry.close(target);
        Ok(())
    }

    fn find_entry(&self, name: &str) -> Option<(usize, u32)> {
        for i in 0..self.entry_count() {
            let entry = self.read_entry(i);
            if entry.in_use && entry.name == name {
                return Some((i, entry.inode_sector));
            }
        }
        None
    }

    /// True if the directory has no entries besides `.`/`..`.
    pub fn is_empty(&self) -> bool {
        for i in 0..self.entry_count() {
            let entry = self.read_entry(i);
            if entry.in_use && entry.name != "." && entry.name != ".." {
                return false;
            }
        }
        true
    }

    /// Number of in-use entries, excluding `.`/`..`.
    pub fn active_entries(&self) -> usize {
        let mut n = 0;
        for i in 0..self.entry_count() {
            let entry = self.read_entry(i);
            if entry.in_use && entry.name != "." && entry.name != ".." {
                n += 1;
            }
        }
        n
    }

    /// Advance the cursor and return the next non-`.`/`..` name, if any.
    pub fn read_next(&self) -> Option<String> {
        let mut pos = self.position.lock();
        let mut offset = *pos;
        let result = read_next_name(&self.inode, &mut offset);
        *pos = offset;
        result
    }
}

/// Advance `position` (a byte offset into the directory's entry table) and
/// return the next non-`.`/`..` name, if any. Shared by [`DirHandle`]'s
/// own cursor and by the filesystem façade's `readdir`, which walks a
/// directory inode without holding a full `DirHandle`.
pub(crate) fn read_next_name<D: BlockDevice>(inode: &Arc<InodeHandle<D>>, position: &mut u32) -> Option<String> {
    loop {
        if *position as usize >= inode.len() as usize {
            return None;
        }
        let mut buf = vec![0u8; ENTRY_SIZE];
        let mut filled = 0usize;
        while filled < ENTRY_SIZE {
            let n = inode.read_at(&mut buf[filled..], *position + filled as u32);
            if n == 0 {
                break;
            }
            filled += n;
        }
        *position += ENTRY_SIZE as u32;
        let entry = DirEntry::decode(&buf);
        if entry.in_use && entry.name != "." && entry.name != ".." {
            return Some(entry.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_cache::BufferCache;
    use crate::device::MemBlockDevice;
    use crate::freemap::{BitmapAllocator, FreeSpaceAllocator};
    use crate::DIR_DEFAULT_ENTRIES;

    fn setup() -> (
        Arc<BufferCache<MemBlockDevice>>,
        Arc<dyn FreeSpaceAllocator>,
        Arc<InodeRegistry<MemBlockDevice>>,
    ) {
        let dev = Arc::new(MemBlockDevice::new(100_000));
        let cache = Arc::new(BufferCache::new(dev.clone()));
        let allocator: Arc<dyn FreeSpaceAllocator> = Arc::new(BitmapAllocator::format(dev, &[0, 1]));
        let registry = Arc::new(InodeRegistry::new());
        (cache, allocator, registry)
    }

    #[test]
    fn add_lookup_and_capacity_extension() {
        let (cache, allocator, registry) = setup();
        DirHandle::format(1, DIR_DEFAULT_ENTRIES, &cache, allocator.as_ref()).unwrap();
        let root = DirHandle::open_root(&registry, &cache, &allocator).unwrap();

        for i in 0..30u32 {
            let sector = allocator.allocate(1).unwrap();
            InodeHandle::format(sector, 0, false, &cache, allocator.as_ref()).unwrap();
            root.add(&format!("f{i}"), sector).unwrap();
        }

        let mut seen = Vec::new();
        while let Some(name) = root.read_next() {
            seen.push(name);
        }
        assert_eq!(seen.len(), 30);
        for i in 0..30 {
            assert!(seen.contains(&format!("f{i}")));
        }

        root.close();
    }

    #[test]
    fn non_empty_directory_rejects_removal() {
        let (cache, allocator, registry) = setup();
        DirHandle::format(1, DIR_DEFAULT_ENTRIES, &cache, allocator.as_ref()).unwrap();
        let root = DirHandle::open_root(&registry, &cache, &allocator).unwrap();

        let child_sector = allocator.allocate(1).unwrap();
        DirHandle::format(child_sector, DIR_DEFAULT_ENTRIES, &cache, allocator.as_ref()).unwrap();
        root.add("d", child_sector).unwrap();

        let child = registry.open(child_sector, &cache, &allocator).unwrap();
        let child_dir = DirHandle::open(child, registry.clone()).unwrap();
        let file_sector = allocator.allocate(1).unwrap();
        InodeHandle::format(file_sector, 0, false, &cache, allocator.as_ref()).unwrap();
        child_dir.add("x", file_sector).unwrap();
        child_dir.close();

        assert!(matches!(root.remove("d", &cache, &allocator), Err(FsError::Busy)));

        let child2 = registry.open(child_sector, &cache, &allocator).unwrap();
        let child_dir2 = DirHandle::open(child2, registry.clone()).unwrap();
        child_dir2.remove("x", &cache, &allocator).unwrap();
        child_dir2.close();

        root.remove("d", &cache, &allocator).unwrap();
        root.close();
    }
}
