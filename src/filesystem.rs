//! The path-level façade: `create`, `open`, `remove`, `mkdir`, `chdir`,
//! `readdir`, plus the open-file handle's `read`/`write`/`seek`/`tell`.
//!
//! Mirrors `original_source/filesys/filesys.c` (`filesys_init`,
//! `filesys_create`, `filesys_open`, `filesys_remove`, `filesys_search`,
//! `do_format`); the supplemented `seek`/`tell`/`inumber`/`isdir` file
//! operations come from `original_source/userprog/syscall_file.c`.

use std::sync::Arc;

use log::debug;
use spin::Mutex;

use crate::buffer_cache::BufferCache;
use crate::cwd::Cwd;
use crate::device::BlockDevice;
use crate::directory::{self, DirHandle};
use crate::error::{FsError, FsResult};
use crate::freemap::{BitmapAllocator, FreeSpaceAllocator};
use crate::inode::{InodeHandle, InodeRegistry};
use crate::path;
use crate::{DIR_DEFAULT_ENTRIES, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

/// What kind of node a search is allowed to resolve to.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    File,
    Directory,
    Any,
}

/// The filesystem as a whole: one block device, its buffer cache, its
/// free-space allocator, and the registry of live in-memory inodes.
pub struct Filesystem<D: BlockDevice> {
    cache: Arc<BufferCache<D>>,
    allocator: Arc<dyn FreeSpaceAllocator>,
    registry: Arc<InodeRegistry<D>>,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Format a fresh filesystem: free-space bitmap at sector 0, an empty
    /// root directory at sector 1.
    pub fn format(device: Arc<D>) -> Self {
        debug!("formatting filesystem");
        let cache = Arc::new(BufferCache::new(device.clone()));
        let allocator: Arc<dyn FreeSpaceAllocator> =
            Arc::new(BitmapAllocator::format(device, &[FREE_MAP_SECTOR, ROOT_DIR_SECTOR]));
        DirHandle::<D>::format(ROOT_DIR_SECTOR, DIR_DEFAULT_ENTRIES, &cache, allocator.as_ref())
            .expect("formatting the root directory cannot fail on a freshly allocated device");
        Self {
            cache,
            allocator,
            registry: Arc::new(InodeRegistry::new()),
        }
    }

    /// Open an already-formatted filesystem.
    pub fn open(device: Arc<D>) -> Self {
        let cache = Arc::new(BufferCache::new(device.clone()));
        let allocator: Arc<dyn FreeSpaceAllocator> = Arc::new(BitmapAllocator::open(device));
        Self {
            cache,
            allocator,
            registry: Arc::new(InodeRegistry::new()),
        }
    }

    /// A working-directory handle rooted at `/`, for a new task.
    pub fn root_cwd(&self) -> FsResult<Cwd<D>> {
        let dir = DirHandle::open_root(&self.registry, &self.cache, &self.allocator)?;
        Ok(Cwd::new(dir))
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache.hit_count()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache.miss_count()
    }

    pub fn cache_reset(&self) {
        self.cache.reset();
    }

    /// Flush all dirty cache entries and persist the allocator's state.
    /// Call before dropping the filesystem.
    pub fn shutdown(&self) {
        self.allocator.sync();
        self.cache.flush();
    }

    fn resolve_parent_dir(&self, cwd: &Cwd<D>, parent_path: Option<&str>) -> FsResult<DirHandle<D>> {
        match parent_path {
            None => Ok(cwd.dir.reopen()),
            Some(p) => {
                let inode = self.search(cwd, p, SearchKind::Directory)?;
                DirHandle::open(inode, self.registry.clone())
            }
        }
    }

    /// Resolve `path` to its target inode, trying the root first and
    /// falling back to `cwd` (§4.3.3 of SPEC_FULL.md).
    pub fn search(&self, cwd: &Cwd<D>, path: &str, want: SearchKind) -> FsResult<Arc<InodeHandle<D>>> {
        if path.trim_end_matches('/').is_empty() {
            let inode = self.registry.open(ROOT_DIR_SECTOR, &self.cache, &self.allocator)?;
            return Self::check_kind(inode, want);
        }

        let parts = path::components(path)?;

        let root_dir = DirHandle::open_root(&self.registry, &self.cache, &self.allocator)?;
        if let Ok(inode) = self.walk(root_dir, &parts) {
            return Self::check_kind(inode, want);
        }

        if cwd.inode_sector() != ROOT_DIR_SECTOR {
            let cwd_dir = cwd.dir.reopen();
            let inode = self.walk(cwd_dir, &parts)?;
            return Self::check_kind(inode, want);
        }

        Err(FsError::NotFound)
    }

    fn check_kind(inode: Arc<InodeHandle<D>>, want: SearchKind) -> FsResult<Arc<InodeHandle<D>>> {
        match want {
            SearchKind::Any => Ok(inode),
            SearchKind::Directory if inode.is_directory() => Ok(inode),
            SearchKind::File if !inode.is_directory() => Ok(inode),
            _ => Err(FsError::NotFound),
        }
    }

    fn walk(&self, start: DirHandle<D>, parts: &[&str]) -> FsResult<Arc<InodeHandle<D>>> {
        let mut current = start;
        if parts.is_empty() {
            let inode = current.inode().clone();
            current.close();
            return Ok(inode);
        }
        for (i, comp) in parts.iter().enumerate() {
            let sector = match current.lookup(comp) {
                Some(s) => s,
                None => {
                    current.close();
                    return Err(FsError::NotFound);
                }
            };
            let inode = match self.registry.open(sector, &self.cache, &self.allocator) {
                Ok(h) => h,
                Err(e) => {
                    current.close();
                    return Err(e);
                }
            };
            let is_last = i == parts.len() - 1;
            if is_last {
                current.close();
                return Ok(inode);
            }
            if !inode.is_directory() {
                current.close();
                self.registry.close(inode);
                return Err(FsError::NotFound);
            }
            let next = match DirHandle::open(inode, self.registry.clone()) {
                Ok(d) => d,
                Err(e) => {
                    current.close();
                    return Err(e);
                }
            };
            current.close();
            current = next;
        }
        unreachable!("loop always returns for a non-empty component list")
    }

    /// Create a regular file of `size` bytes at `path`.
    pub fn create(&self, cwd: &Cwd<D>, path: &str, size: u32) -> FsResult<()> {
        let (parent_path, name) = path::split_parent(path)?;
        let parent = self.resolve_parent_dir(cwd, parent_path)?;
        if parent.lookup(name).is_some() {
            parent.close();
            return Err(FsError::InvalidArgument);
        }

        let sector = match self.allocator.allocate(1) {
            Ok(s) => s,
            Err(e) => {
                parent.close();
                return Err(e);
            }
        };
        if let Err(e) = InodeHandle::format(sector, size, false, &self.cache, self.allocator.as_ref()) {
            self.allocator.release(sector, 1);
            parent.close();
            return Err(e);
        }

        let handle = match self.registry.open(sector, &self.cache, &self.allocator) {
            Ok(h) => h,
            Err(e) => {
                self.allocator.release(sector, 1);
                parent.close();
                return Err(e);
            }
        };
        let result = parent.add(name, sector);
        if result.is_err() {
            handle.mark_removed();
        }
        self.registry.close(handle);
        parent.close();
        result
    }

    /// Create a directory at `path`, with `.` and `..` self-reference
    /// entries (the root, formatted directly, has neither — see
    /// SPEC_FULL.md §9).
    pub fn mkdir(&self, cwd: &Cwd<D>, path: &str) -> FsResult<()> {
        let (parent_path, name) = path::split_parent(path)?;
        let parent = self.resolve_parent_dir(cwd, parent_path)?;
        if parent.lookup(name).is_some() {
            parent.close();
            return Err(FsError::InvalidArgument);
        }

        let sector = match self.allocator.allocate(1) {
            Ok(s) => s,
            Err(e) => {
                parent.close();
                return Err(e);
            }
        };
        if let Err(e) = DirHandle::format(sector, DIR_DEFAULT_ENTRIES, &self.cache, self.allocator.as_ref()) {
            self.allocator.release(sector, 1);
            parent.close();
            return Err(e);
        }

        let inode = match self.registry.open(sector, &self.cache, &self.allocator) {
            Ok(h) => h,
            Err(e) => {
                self.allocator.release(sector, 1);
                parent.close();
                return Err(e);
            }
        };
        let new_dir = match DirHandle::open(inode.clone(), self.registry.clone()) {
            Ok(d) => d,
            Err(e) => {
                inode.mark_removed();
                self.registry.close(inode);
                parent.close();
                return Err(e);
            }
        };

        let result = new_dir
            .add(".", sector)
            .and_then(|_| new_dir.add("..", parent.inode_sector()))
            .and_then(|_| parent.add(name, sector));

        if result.is_err() {
            inode.mark_removed();
        }
        new_dir.close();
        parent.close();
        result
    }

    /// Remove the entry at `path`.
    pub fn remove(&self, cwd: &Cwd<D>, path: &str) -> FsResult<()> {
        let (parent_path, name) = path::split_parent(path)?;
        let parent = self.resolve_parent_dir(cwd, parent_path)?;
        let result = parent.remove(name, &self.cache, &self.allocator);
        parent.close();
        result
    }

    /// Change `cwd` to `path`, closing the previous working directory.
    pub fn chdir(&self, cwd: &mut Cwd<D>, path: &str) -> FsResult<()> {
        let inode = self.search(cwd, path, SearchKind::Directory)?;
        let new_dir = DirHandle::open(inode, self.registry.clone())?;
        let old = std::mem::replace(&mut cwd.dir, new_dir);
        old.close();
        Ok(())
    }

    /// Open `path` (file or directory) for I/O.
    pub fn open_file(&self, cwd: &Cwd<D>, path: &str) -> FsResult<OpenFile<D>> {
        let inode = self.search(cwd, path, SearchKind::Any)?;
        Ok(OpenFile::new(inode, self.registry.clone()))
    }
}

/// An open file or directory, with its own byte cursor.
///
/// Supplements spec.md with `seek`/`tell`/`isdir`/`inumber`, grounded on
/// `original_source/userprog/syscall_file.c`'s thin syscall wrappers,
/// implemented directly here since the syscall dispatch layer itself is
/// out of scope.
pub struct OpenFile<D: BlockDevice> {
    inode: Arc<InodeHandle<D>>,
    registry: Arc<InodeRegistry<D>>,
    position: Mutex<u32>,
}

impl<D: BlockDevice> OpenFile<D> {
    fn new(inode: Arc<InodeHandle<D>>, registry: Arc<InodeRegistry<D>>) -> Self {
        Self {
            inode,
            registry,
            position: Mutex::new(0),
        }
    }

    /// Read at the current cursor, advancing it by the number of bytes
    /// actually read.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut pos = self.position.lock();
        let n = self.inode.read_at(dst, *pos);
        *pos += n as u32;
        n
    }

    /// Write at the current cursor, advancing it by the number of bytes
    /// actually written.
    pub fn write(&self, src: &[u8]) -> usize {
        let mut pos = self.position.lock();
        let n = self.inode.write_at(src, *pos);
        *pos += n as u32;
        n
    }

    /// Read `dst.len()` bytes at `offset`, independent of the cursor.
    pub fn read_at_offset(&self, dst: &mut [u8], offset: u32) -> usize {
        self.inode.read_at(dst, offset)
    }

    /// Write `src.len()` bytes at `offset`, independent of the cursor.
    pub fn write_at_offset(&self, src: &[u8], offset: u32) -> usize {
        self.inode.write_at(src, offset)
    }

    pub fn seek(&self, offset: u32) {
        *self.position.lock() = offset;
    }

    pub fn tell(&self) -> u32 {
        *self.position.lock()
    }

    pub fn length(&self) -> u32 {
        self.inode.len()
    }

    pub fn isdir(&self) -> bool {
        self.inode.is_directory()
    }

    pub fn inumber(&self) -> u32 {
        self.inode.sector()
    }

    pub fn deny_write(&self) {
        self.inode.deny_write();
    }

    pub fn allow_write(&self) {
        self.inode.allow_write();
    }

    /// Read the next directory entry name, skipping `.`/`..`. Only
    /// meaningful if [`OpenFile::isdir`] is true.
    pub fn readdir(&self) -> Option<String> {
        let mut pos = self.position.lock();
        let mut offset = *pos;
        let result = directory::read_next_name(&self.inode, &mut offset);
        *pos = offset;
        result
    }

    pub fn close(self) {
        self.registry.close(self.inode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn new_fs() -> Filesystem<MemBlockDevice> {
        let dev = Arc::new(MemBlockDevice::new(200_000));
        Filesystem::format(dev)
    }

    #[test]
    fn create_open_write_read_and_remove() {
        let fs = new_fs();
        let cwd = fs.root_cwd().unwrap();

        fs.create(&cwd, "/hello.txt", 0).unwrap();
        let file = fs.open_file(&cwd, "/hello.txt").unwrap();
        assert_eq!(file.write(b"hi there"), 8);
        file.seek(0);
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf), 8);
        assert_eq!(&buf, b"hi there");
        file.close();

        fs.remove(&cwd, "/hello.txt").unwrap();
        assert!(fs.open_file(&cwd, "/hello.txt").is_err());

        cwd.close();
    }

    #[test]
    fn mkdir_chdir_and_relative_paths() {
        let fs = new_fs();
        let mut cwd = fs.root_cwd().unwrap();

        fs.mkdir(&cwd, "/sub").unwrap();
        fs.chdir(&mut cwd, "/sub").unwrap();
        fs.create(&cwd, "rel.txt", 0).unwrap();

        let file = fs.open_file(&cwd, "/sub/rel.txt").unwrap();
        assert_eq!(file.inumber(), file.inumber());
        file.close();

        cwd.close();
    }

    #[test]
    fn readdir_skips_dot_entries() {
        let fs = new_fs();
        let cwd = fs.root_cwd().unwrap();
        fs.mkdir(&cwd, "/d").unwrap();
        fs.create(&cwd, "/d/a", 0).unwrap();
        fs.create(&cwd, "/d/b", 0).unwrap();

        let dir = fs.open_file(&cwd, "/d").unwrap();
        let mut names = Vec::new();
        while let Some(n) = dir.readdir() {
            names.push(n);
        }
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        dir.close();
        cwd.close();
    }

    #[test]
    fn shutdown_flushes_dirty_sectors() {
        let fs = new_fs();
        let cwd = fs.root_cwd().unwrap();
        fs.create(&cwd, "/x", 4096).unwrap();
        fs.shutdown();
        cwd.close();
    }
}
