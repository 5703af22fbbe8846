//! Fixed-size write-back buffer cache with LRU eviction.
//!
//! Two lock tiers, same as the original design: a single cache-wide lock
//! protects entry identity (which sector an entry holds) and the hit/miss
//! counters; each entry additionally has its own reader/writer lock over
//! its data bytes and dirty flag. A caller never holds the cache-wide lock
//! while copying user data in or out.

use std::sync::Arc;

use log::{debug, trace};
use spin::{Mutex, RwLock};

use crate::device::BlockDevice;
use crate::{CACHE_ENTRIES, SECTOR_SIZE};

const UNUSED: u32 = u32::MAX;

struct EntryData {
    dirty: bool,
    bytes: Vec<u8>,
}

struct Entry {
    sector: Mutex<u32>,
    last_accessed: Mutex<i64>,
    data: RwLock<EntryData>,
}

impl Entry {
    fn unused() -> Self {
        Self {
            sector: Mutex::new(UNUSED),
            last_accessed: Mutex::new(i64::MIN),
            data: RwLock::new(EntryData {
                dirty: false,
                bytes: vec![0u8; SECTOR_SIZE],
            }),
        }
    }
}

/// A bounded cache of disk sectors backed by a [`BlockDevice`].
pub struct BufferCache<D: BlockDevice> {
    device: Arc<D>,
    /// Guards entry identity assignment and eviction selection; never held
    /// while the caller copies data.
    identity_lock: Mutex<()>,
    entries: Vec<Entry>,
    clock: Mutex<i64>,
    hits: Mutex<u64>,
    misses: Mutex<u64>,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Build an empty cache of [`CACHE_ENTRIES`] entries over `device`.
    pub fn new(device: Arc<D>) -> Self {
        let mut entries = Vec::with_capacity(CACHE_ENTRIES);
        entries.resize_with(CACHE_ENTRIES, Entry::unused);
        Self {
            device,
            identity_lock: Mutex::new(()),
            entries,
            clock: Mutex::new(0),
            hits: Mutex::new(0),
            misses: Mutex::new(0),
        }
    }

    fn tick(&self) -> i64 {
        let mut clock = self.clock.lock();
        *clock += 1;
        *clock
    }

    /// Find (or fault in) the entry caching `sector`, returning its index.
    ///
    /// `load_data` controls whether a faulted-in entry is populated from
    /// disk; callers that are about to overwrite the whole sector can pass
    /// `false` to skip the read.
    fn fetch(&self, sector: u32, load_data: bool) -> usize {
        let _guard = self.identity_lock.lock();

        let mut victim = 0usize;
        let mut victim_time = i64::MAX;
        for (i, entry) in self.entries.iter().enumerate() {
            let s = *entry.sector.lock();
            if s == sector {
                trace!("buffer cache hit sector {sector}");
                *self.hits.lock() += 1;
                *entry.last_accessed.lock() = self.tick();
                return i;
            }
            let t = *entry.last_accessed.lock();
            if t < victim_time {
                victim_time = t;
                victim = i;
            }
        }

        trace!("buffer cache miss sector {sector}, evicting slot {victim}");
        *self.misses.lock() += 1;
        let entry = &self.entries[victim];
        {
            let mut data = entry.data.write();
            if data.dirty {
                let old_sector = *entry.sector.lock();
                debug!("writing back dirty sector {old_sector} from slot {victim}");
                self.device.write_sector(old_sector, &data.bytes);
                data.dirty = false;
            }
            *entry.sector.lock() = sector;
            if load_data {
                self.device.read_sector(sector, &mut data.bytes);
            }
        }
        *entry.last_accessed.lock() = self.tick();
        victim
    }

    /// Copy `len` bytes from `sector` at `offset` into `dst`.
    pub fn read(&self, sector: u32, dst: &mut [u8], offset: usize, len: usize) {
        assert!(offset + len <= SECTOR_SIZE);
        let idx = self.fetch(sector, true);
        let data = self.entries[idx].data.read();
        dst[..len].copy_from_slice(&data.bytes[offset..offset + len]);
    }

    /// Copy `len` bytes from `src` into `sector` at `offset`, marking it
    /// dirty. A full-sector write at offset 0 skips the read-before-write.
    pub fn write(&self, sector: u32, src: &[u8], offset: usize, len: usize) {
        assert!(offset + len <= SECTOR_SIZE);
        let whole_sector = offset == 0 && len == SECTOR_SIZE;
        let idx = self.fetch(sector, !whole_sector);
        let mut data = self.entries[idx].data.write();
        data.bytes[offset..offset + len].copy_from_slice(&src[..len]);
        data.dirty = true;
    }

    /// Write back every dirty entry, leaving them clean.
    pub fn flush(&self) {
        let _guard = self.identity_lock.lock();
        for entry in &self.entries {
            let mut data = entry.data.write();
            if data.dirty {
                let sector = *entry.sector.lock();
                self.device.write_sector(sector, &data.bytes);
                data.dirty = false;
            }
        }
    }

    /// Flush, mark every entry unused, and zero the hit/miss counters.
    pub fn reset(&self) {
        self.flush();
        let _guard = self.identity_lock.lock();
        for entry in &self.entries {
            *entry.sector.lock() = UNUSED;
            *entry.last_accessed.lock() = i64::MIN;
        }
        *self.hits.lock() = 0;
        *self.misses.lock() = 0;
    }

    pub fn hit_count(&self) -> u64 {
        *self.hits.lock()
    }

    pub fn miss_count(&self) -> u64 {
        *self.misses.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn write_then_read_round_trips_through_cache() {
        let dev = Arc::new(MemBlockDevice::new(8));
        let cache = BufferCache::new(dev);
        let src = [0xAAu8; 16];
        cache.write(3, &src, 10, 16);
        let mut dst = [0u8; 16];
        cache.read(3, &mut dst, 10, 16);
        assert_eq!(src, dst);
    }

    #[test]
    fn eviction_writes_back_dirty_entries() {
        let dev = Arc::new(MemBlockDevice::new((CACHE_ENTRIES + 2) as u32));
        let cache = BufferCache::new(dev.clone());
        let payload = [0x42u8; SECTOR_SIZE];
        cache.write(0, &payload, 0, SECTOR_SIZE);
        for s in 1..=CACHE_ENTRIES as u32 {
            let mut buf = [0u8; SECTOR_SIZE];
            cache.read(s, &mut buf, 0, SECTOR_SIZE);
        }
        let mut on_disk = vec![0u8; SECTOR_SIZE];
        dev.read_sector(0, &mut on_disk);
        assert_eq!(on_disk, payload.to_vec());
    }

    #[test]
    fn full_sector_write_skips_initial_read() {
        let dev = Arc::new(MemBlockDevice::new(4));
        let cache = BufferCache::new(dev);
        let payload = [0x11u8; SECTOR_SIZE];
        cache.write(0, &payload, 0, SECTOR_SIZE);
        assert_eq!(cache.miss_count(), 1);
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(0, &mut out, 0, SECTOR_SIZE);
        assert_eq!(out, payload);
        assert_eq!(cache.hit_count(), 1);
    }

    #[test]
    fn reset_clears_dirty_and_identity() {
        let dev = Arc::new(MemBlockDevice::new(4));
        let cache = BufferCache::new(dev.clone());
        let payload = [0x55u8; SECTOR_SIZE];
        cache.write(1, &payload, 0, SECTOR_SIZE);
        cache.reset();
        let mut on_disk = vec![0u8; SECTOR_SIZE];
        dev.read_sector(1, &mut on_disk);
        assert_eq!(on_disk, payload.to_vec());
    }
}
