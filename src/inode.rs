//! On-disk inode layout, block mapping, and the in-memory inode handle.
//!
//! Mirrors `original_source/filesys/inode.c`: direct blocks plus two-level
//! (doubly-indirect) indirect addressing, grow-only resize with rollback on
//! partial allocation failure, deferred free-on-close, and deny-write.

use std::sync::Arc;

use log::{debug, warn};
use spin::{Mutex, RwLock};

use crate::buffer_cache::BufferCache;
use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::freemap::FreeSpaceAllocator;
use crate::{DIRECT_POINTERS, INODE_MAGIC, L2_POINTERS, POINTERS_PER_INDEX_SECTOR, SECTOR_SIZE};

const NO_SECTOR: u32 = u32::MAX;

/// In-memory mirror of the on-disk inode layout (`§6` of SPEC_FULL.md).
///
/// `is_directory` and `size` are mutated only while holding the owning
/// handle's size writer lock; `direct`/`l2` change only during resize,
/// under the same lock.
#[derive(Clone)]
struct InodeInner {
    is_directory: bool,
    size: u32,
    direct: [u32; DIRECT_POINTERS],
    l2: [u32; L2_POINTERS],
}

impl InodeInner {
    fn empty(is_directory: bool) -> Self {
        Self {
            is_directory,
            size: 0,
            direct: [NO_SECTOR; DIRECT_POINTERS],
            l2: [NO_SECTOR; L2_POINTERS],
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        buf[0] = self.is_directory as u8;
        buf[1..5].copy_from_slice(&self.size.to_le_bytes());
        let mut off = 5;
        for &s in &self.l2 {
            buf[off..off + 4].copy_from_slice(&s.to_le_bytes());
            off += 4;
        }
        for &s in &self.direct {
            buf[off..off + 4].copy_from_slice(&s.to_le_bytes());
            off += 4;
        }
        buf[off..off + 4].copy_from_slice(&INODE_MAGIC.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> FsResult<Self> {
        let is_directory = buf[0] != 0;
        let size = u32::from_le_bytes(buf[1..5].try_into().unwrap());
        let mut off = 5;
        let mut l2 = [NO_SECTOR; L2_POINTERS];
        for slot in l2.iter_mut() {
            *slot = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        let mut direct = [NO_SECTOR; DIRECT_POINTERS];
        for slot in direct.iter_mut() {
            *slot = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        let magic = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        if magic != INODE_MAGIC {
            warn!("inode sector has bad magic {magic:#x}, expected {INODE_MAGIC:#x}");
            return Err(FsError::InvalidArgument);
        }
        Ok(Self {
            is_directory,
            size,
            direct,
            l2,
        })
    }
}

/// Metadata guarded independently of the size/block-map lock, matching the
/// lock-ordering discipline in `SPEC_FULL.md` §5.
struct Metadata {
    open_count: u32,
    removed: bool,
}

/// A live, shared handle to one on-disk inode.
///
/// At most one `InodeHandle` exists per on-disk sector at any time; callers
/// obtain additional references via [`InodeRegistry::open`] or
/// [`InodeHandle::reopen`], never by constructing their own.
pub struct InodeHandle<D: BlockDevice> {
    sector: u32,
    cache: Arc<BufferCache<D>>,
    allocator: Arc<dyn FreeSpaceAllocator>,
    metadata: Mutex<Metadata>,
    deny_write: RwLock<u32>,
    inner: RwLock<InodeInner>,
}

/// Per-filesystem registry deduplicating in-memory inode handles by sector.
///
/// Its lock is never held across any other lock (§5, rule 1).
pub struct InodeRegistry<D: BlockDevice> {
    entries: Mutex<Vec<Arc<InodeHandle<D>>>>,
}

impl<D: BlockDevice> InodeRegistry<D> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Open the inode at `sector`, reusing an existing in-memory handle if
    /// one is already live.
    pub fn open(
        self: &Arc<Self>,
        sector: u32,
        cache: &Arc<BufferCache<D>>,
        allocator: &Arc<dyn FreeSpaceAllocator>,
    ) -> FsResult<Arc<InodeHandle<D>>> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter().find(|h| h.sector == sector) {
            existing.metadata.lock().open_count += 1;
            debug!("inode {sector} reopened via registry");
            return Ok(existing.clone());
        }

        let mut buf = vec![0u8; SECTOR_SIZE];
        cache.read(sector, &mut buf, 0, SECTOR_SIZE);
        let inner = InodeInner::decode(&buf)?;
        let handle = Arc::new(InodeHandle {
            sector,
            cache: cache.clone(),
            allocator: allocator.clone(),
            metadata: Mutex::new(Metadata {
                open_count: 1,
                removed: false,
            }),
            deny_write: RwLock::new(0),
            inner: RwLock::new(inner),
        });
        entries.push(handle.clone());
        debug!("inode {sector} opened fresh");
        Ok(handle)
    }

    /// Close `handle`. If this was the last opener, the handle is removed
    /// from the registry and, if it was marked removed, every sector it
    /// owns (data, L1, L2, and the inode sector itself) is released.
    pub fn close(self: &Arc<Self>, handle: Arc<InodeHandle<D>>) {
        let last = {
            let mut meta = handle.metadata.lock();
            assert!(meta.open_count > 0, "closing an inode with no openers");
            meta.open_count -= 1;
            meta.open_count == 0
        };
        if !last {
            return;
        }

        {
            let mut entries = self.entries.lock();
            entries.retain(|h| h.sector != handle.sector);
        }

        let should_free = handle.metadata.lock().removed;
        if should_free {
            debug!("inode {} had no remaining openers and was removed, freeing blocks", handle.sector);
            handle.free_all_blocks();
        }
    }
}

impl<D: BlockDevice> InodeHandle<D> {
    /// Format a brand-new inode of `length` bytes at `sector` and write it
    /// to disk. Used by `create`/`mkdir` before any handle exists for it.
    pub fn format(
        sector: u32,
        length: u32,
        is_directory: bool,
        cache: &BufferCache<D>,
        allocator: &dyn FreeSpaceAllocator,
    ) -> FsResult<()> {
        let mut inner = InodeInner::empty(is_directory);
        grow(&mut inner, length, cache, allocator)?;
        let buf = inner.encode();
        cache.write(sector, &buf, 0, SECTOR_SIZE);
        Ok(())
    }

    /// Increment the open count, producing another strong reference to the
    /// same in-memory handle.
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        self.metadata.lock().open_count += 1;
        self.clone()
    }

    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn is_directory(&self) -> bool {
        self.inner.read().is_directory
    }

    pub fn len(&self) -> u32 {
        self.inner.read().size
    }

    pub fn open_count(&self) -> u32 {
        self.metadata.lock().open_count
    }

    /// Mark the inode for deletion. Blocks are released on the last close.
    pub fn mark_removed(&self) {
        self.metadata.lock().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.metadata.lock().removed
    }

    /// Forbid writers (used while an executable image is in use).
    pub fn deny_write(&self) {
        let mut count = self.deny_write.write();
        *count += 1;
        let open = self.metadata.lock().open_count;
        assert!(*count <= open, "deny_write count exceeds open count");
    }

    /// Undo one [`InodeHandle::deny_write`].
    pub fn allow_write(&self) {
        let mut count = self.deny_write.write();
        assert!(*count > 0, "allow_write with no matching deny_write");
        *count -= 1;
    }

    /// Read `dst.len()` bytes starting at `offset`. Returns 0, copying
    /// nothing, if `offset + dst.len()` extends past the current size — no
    /// partial reads past EOF.
    pub fn read_at(&self, dst: &mut [u8], offset: u32) -> usize {
        let inner = self.inner.read();
        let size = inner.size;
        if offset as u64 + dst.len() as u64 > size as u64 {
            return 0;
        }
        let mut remaining = dst.len();
        let mut pos = offset;
        let mut written = 0usize;
        while remaining > 0 {
            let Some(sector) = byte_to_sector(&inner, pos, &self.cache) else {
                break;
            };
            let in_sector = (pos as usize) % SECTOR_SIZE;
            let chunk = remaining.min(SECTOR_SIZE - in_sector);
            self.cache.read(sector, &mut dst[written..written + chunk], in_sector, chunk);
            pos += chunk as u32;
            written += chunk;
            remaining -= chunk;
        }
        written
    }

    /// Write `src.len()` bytes starting at `offset`, growing the file first
    /// if necessary. Returns 0 if growth fails or a deny-write is active.
    pub fn write_at(&self, src: &[u8], offset: u32) -> usize {
        let needed_end = offset as u64 + src.len() as u64;
        {
            let mut inner = self.inner.write();
            if needed_end > inner.size as u64 {
                if needed_end > u32::MAX as u64 {
                    return 0;
                }
                if grow(&mut inner, needed_end as u32, &self.cache, self.allocator.as_ref()).is_err() {
                    return 0;
                }
                let buf = inner.encode();
                self.cache.write(self.sector, &buf, 0, SECTOR_SIZE);
            }
        }

        let deny = self.deny_write.read();
        if *deny > 0 {
            return 0;
        }

        let inner = self.inner.read();
        let mut pos = offset;
        let mut remaining = src.len();
        let mut consumed = 0usize;
        while remaining > 0 {
            let Some(sector) = byte_to_sector(&inner, pos, &self.cache) else {
                break;
            };
            let in_sector = (pos as usize) % SECTOR_SIZE;
            let chunk = remaining.min(SECTOR_SIZE - in_sector);
            self.cache.write(sector, &src[consumed..consumed + chunk], in_sector, chunk);
            pos += chunk as u32;
            consumed += chunk;
            remaining -= chunk;
        }
        consumed
    }

    /// Grow-only resize, e.g. for directories extending their capacity.
    pub fn resize(&self, new_size: u32) -> FsResult<()> {
        let mut inner = self.inner.write();
        if new_size < inner.size {
            return Err(FsError::InvalidArgument);
        }
        grow(&mut inner, new_size, &self.cache, self.allocator.as_ref())?;
        let buf = inner.encode();
        self.cache.write(self.sector, &buf, 0, SECTOR_SIZE);
        Ok(())
    }

    fn free_all_blocks(&self) {
        let inner = self.inner.read();
        let sectors_used = div_ceil(inner.size, SECTOR_SIZE as u32);
        for i in 0..sectors_used {
            if (i as usize) < DIRECT_POINTERS {
                let s = inner.direct[i as usize];
                if s != NO_SECTOR {
                    self.allocator.release(s, 1);
                }
            } else {
                let j = i as usize - DIRECT_POINTERS;
                let l2_idx = j / (POINTERS_PER_INDEX_SECTOR * POINTERS_PER_INDEX_SECTOR);
                let l1_idx = (j / POINTERS_PER_INDEX_SECTOR) % POINTERS_PER_INDEX_SECTOR;
                let data_idx = j % POINTERS_PER_INDEX_SECTOR;
                let l2_sector = inner.l2[l2_idx];
                if l2_sector == NO_SECTOR {
                    continue;
                }
                let l1_sector = read_index_entry(&self.cache, l2_sector, l1_idx);
                if l1_sector == NO_SECTOR {
                    continue;
                }
                let data_sector = read_index_entry(&self.cache, l1_sector, data_idx);
                if data_sector != NO_SECTOR {
                    self.allocator.release(data_sector, 1);
                }
            }
        }
        for l2_idx in 0..L2_POINTERS {
            let l2_sector = inner.l2[l2_idx];
            if l2_sector == NO_SECTOR {
                continue;
            }
            for l1_idx in 0..POINTERS_PER_INDEX_SECTOR {
                let l1_sector = read_index_entry(&self.cache, l2_sector, l1_idx);
                if l1_sector != NO_SECTOR {
                    self.allocator.release(l1_sector, 1);
                }
            }
            self.allocator.release(l2_sector, 1);
        }
        self.allocator.release(self.sector, 1);
    }
}

fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

fn read_index_entry<D: BlockDevice>(cache: &BufferCache<D>, sector: u32, idx: usize) -> u32 {
    let mut buf = [0u8; 4];
    cache.read(sector, &mut buf, idx * 4, 4);
    u32::from_le_bytes(buf)
}

fn write_index_entry<D: BlockDevice>(cache: &BufferCache<D>, sector: u32, idx: usize, value: u32) {
    cache.write(sector, &value.to_le_bytes(), idx * 4, 4);
}

/// Map a byte offset within an already-sized file to its backing sector,
/// following direct, then doubly-indirect, addressing. Returns `None` if
/// `offset` falls outside any mapped region (should not happen for
/// `offset < size`, but growth races are guarded against defensively).
fn byte_to_sector<D: BlockDevice>(inner: &InodeInner, offset: u32, cache: &BufferCache<D>) -> Option<u32> {
    if offset >= inner.size {
        return None;
    }
    let index = (offset as usize) / SECTOR_SIZE;
    if index < DIRECT_POINTERS {
        let s = inner.direct[index];
        return if s == NO_SECTOR { None } else { Some(s) };
    }
    let j = index - DIRECT_POINTERS;
    let l2_idx = j / (POINTERS_PER_INDEX_SECTOR * POINTERS_PER_INDEX_SECTOR);
    let l1_idx = (j / POINTERS_PER_INDEX_SECTOR) % POINTERS_PER_INDEX_SECTOR;
    let data_idx = j % POINTERS_PER_INDEX_SECTOR;
    if l2_idx >= L2_POINTERS {
        return None;
    }
    let l2_sector = inner.l2[l2_idx];
    if l2_sector == NO_SECTOR {
        return None;
    }
    let l1_sector = read_index_entry(cache, l2_sector, l1_idx);
    if l1_sector == NO_SECTOR {
        return None;
    }
    let data_sector = read_index_entry(cache, l1_sector, data_idx);
    if data_sector == NO_SECTOR {
        None
    } else {
        Some(data_sector)
    }
}

/// Grow `inner` to `new_size`, allocating and zeroing whatever sectors and
/// index blocks are needed. On any allocation failure, every sector
/// allocated during this call is released and the inode is left exactly
/// as it was on entry.
fn grow<D: BlockDevice>(
    inner: &mut InodeInner,
    new_size: u32,
    cache: &BufferCache<D>,
    allocator: &dyn FreeSpaceAllocator,
) -> FsResult<()> {
    let old_sectors = div_ceil(inner.size, SECTOR_SIZE as u32) as usize;
    let new_sectors = div_ceil(new_size, SECTOR_SIZE as u32) as usize;
    if new_sectors == old_sectors {
        inner.size = new_size;
        return Ok(());
    }

    let mut allocated: Vec<u32> = Vec::new();
    let zero = vec![0u8; SECTOR_SIZE];

    let result: FsResult<()> = (|| {
        for i in old_sectors..new_sectors {
            let data_sector = allocator.allocate(1)?;
            allocated.push(data_sector);
            cache.write(data_sector, &zero, 0, SECTOR_SIZE);

            if i < DIRECT_POINTERS {
                inner.direct[i] = data_sector;
                continue;
            }

            let j = i - DIRECT_POINTERS;
            let l2_idx = j / (POINTERS_PER_INDEX_SECTOR * POINTERS_PER_INDEX_SECTOR);
            let l1_idx = (j / POINTERS_PER_INDEX_SECTOR) % POINTERS_PER_INDEX_SECTOR;
            let data_idx = j % POINTERS_PER_INDEX_SECTOR;
            if l2_idx >= L2_POINTERS {
                return Err(FsError::InvalidArgument);
            }

            if inner.l2[l2_idx] == NO_SECTOR {
                let l2_sector = allocator.allocate(1)?;
                allocated.push(l2_sector);
                cache.write(l2_sector, &zero, 0, SECTOR_SIZE);
                inner.l2[l2_idx] = l2_sector;
            }
            let l2_sector = inner.l2[l2_idx];

            let mut l1_sector = read_index_entry(cache, l2_sector, l1_idx);
            if l1_sector == NO_SECTOR {
                l1_sector = allocator.allocate(1)?;
                allocated.push(l1_sector);
                cache.write(l1_sector, &zero, 0, SECTOR_SIZE);
                write_index_entry(cache, l2_sector, l1_idx, l1_sector);
            }

            write_index_entry(cache, l1_sector, data_idx, data_sector);
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            inner.size = new_size;
            Ok(())
        }
        Err(e) => {
            for sector in allocated {
                allocator.release(sector, 1);
            }
            warn!("inode grow to {new_size} bytes failed and was rolled back");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::freemap::BitmapAllocator;

    fn setup(sectors: u32) -> (Arc<BufferCache<MemBlockDevice>>, Arc<dyn FreeSpaceAllocator>) {
        let dev = Arc::new(MemBlockDevice::new(sectors));
        let cache = Arc::new(BufferCache::new(dev.clone()));
        let allocator: Arc<dyn FreeSpaceAllocator> = Arc::new(BitmapAllocator::format(dev, &[0, 1]));
        (cache, allocator)
    }

    #[test]
    fn create_open_write_read_round_trips() {
        let (cache, allocator) = setup(4096);
        InodeHandle::format(2, 0, false, &cache, allocator.as_ref()).unwrap();
        let registry: Arc<InodeRegistry<MemBlockDevice>> = Arc::new(InodeRegistry::new());
        let handle = registry.open(2, &cache, &allocator).unwrap();

        let payload = b"hello, educational filesystem";
        let written = handle.write_at(payload, 100);
        assert_eq!(written, payload.len());

        let mut buf = vec![0u8; payload.len()];
        let read = handle.read_at(&mut buf, 100);
        assert_eq!(read, payload.len());
        assert_eq!(&buf, payload);

        registry.close(handle);
    }

    #[test]
    fn growth_through_double_indirection_zero_fills() {
        let (cache, allocator) = setup(200_000);
        InodeHandle::format(2, 0, false, &cache, allocator.as_ref()).unwrap();
        let registry: Arc<InodeRegistry<MemBlockDevice>> = Arc::new(InodeRegistry::new());
        let handle = registry.open(2, &cache, &allocator).unwrap();

        let far_offset = 10 * 1024 * 1024u32;
        let written = handle.write_at(&[0x7Eu8], far_offset);
        assert_eq!(written, 1);
        assert_eq!(handle.len(), far_offset + 1);

        let mut zero_check = [0xFFu8; 1];
        handle.read_at(&mut zero_check, far_offset - 1024);
        assert_eq!(zero_check[0], 0);

        let mut value_check = [0u8; 1];
        handle.read_at(&mut value_check, far_offset);
        assert_eq!(value_check[0], 0x7E);

        registry.close(handle);
    }

    #[test]
    fn deny_write_blocks_writers_not_readers() {
        let (cache, allocator) = setup(4096);
        InodeHandle::format(2, 16, false, &cache, allocator.as_ref()).unwrap();
        let registry: Arc<InodeRegistry<MemBlockDevice>> = Arc::new(InodeRegistry::new());
        let handle = registry.open(2, &cache, &allocator).unwrap();

        handle.deny_write();
        let written = handle.write_at(b"nope", 0);
        assert_eq!(written, 0);

        let mut buf = [0u8; 4];
        let read = handle.read_at(&mut buf, 0);
        assert_eq!(read, 4);

        handle.allow_write();
        let written = handle.write_at(b"yes!", 0);
        assert_eq!(written, 4);

        registry.close(handle);
    }

    #[test]
    fn remove_while_open_defers_block_release() {
        let dev = Arc::new(MemBlockDevice::new(10));
        let cache = Arc::new(BufferCache::new(dev.clone()));
        let allocator: Arc<dyn FreeSpaceAllocator> = Arc::new(BitmapAllocator::format(dev, &[0, 1, 2]));
        InodeHandle::format(2, SECTOR_SIZE as u32 * 3, false, &cache, allocator.as_ref()).unwrap();
        let registry: Arc<InodeRegistry<MemBlockDevice>> = Arc::new(InodeRegistry::new());
        let handle_a = registry.open(2, &cache, &allocator).unwrap();
        let handle_b = registry.open(2, &cache, &allocator).unwrap();

        handle_b.mark_removed();
        registry.close(handle_b);

        // still open via handle_a, blocks must remain allocated: only 4 of
        // 10 sectors are free (3 reserved + 3 used by the file's data).
        assert!(allocator.allocate(5).is_err());

        registry.close(handle_a);
        // closing the last opener frees the 3 data sectors plus the inode
        // sector itself.
        assert!(allocator.allocate(8).is_ok());
    }
}
