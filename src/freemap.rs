//! Free-space allocator contract.
//!
//! Like the block device, the allocator is an external collaborator as
//! far as the core spec is concerned: only its `allocate`/`release`
//! contract matters to the inode and filesystem layers. A first-fit
//! sector-bitmap implementation is shipped so the crate is runnable
//! end-to-end without a real allocator.

use std::sync::Arc;

use log::warn;
use spin::Mutex;

use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SECTOR_SIZE};

/// First sector holding the bitmap's actual payload bytes.
///
/// `FREE_MAP_SECTOR` and `ROOT_DIR_SECTOR` are fixed, single-sector
/// metadata locations (§6 of SPEC_FULL.md). A bitmap spanning more than one
/// sector — true for any device with more than `SECTOR_SIZE * 8` sectors —
/// cannot be laid out contiguously starting at `FREE_MAP_SECTOR` without
/// overrunning `ROOT_DIR_SECTOR`, so the payload is placed immediately
/// after the root directory instead; `FREE_MAP_SECTOR` itself stays
/// reserved but holds no payload bytes.
const BITMAP_DATA_SECTOR: u32 = ROOT_DIR_SECTOR + 1;

/// Allocates and releases ranges of contiguous sectors.
///
/// Implementations are assumed to be internally synchronized; the core
/// never wraps calls to this trait in its own locks.
pub trait FreeSpaceAllocator: Send + Sync {
    /// Allocate `count` contiguous free sectors, returning the first
    /// sector index on success.
    fn allocate(&self, count: u32) -> FsResult<u32>;

    /// Return `count` sectors starting at `first` to the free pool.
    fn release(&self, first: u32, count: u32);

    /// Persist the allocator's in-memory state to disk, if it has any.
    /// Called on filesystem shutdown alongside the buffer cache flush.
    fn sync(&self) {}
}

/// A first-fit bitmap allocator whose payload is persisted starting at
/// [`BITMAP_DATA_SECTOR`].
///
/// Bit `i` set means sector `i` is free. `FREE_MAP_SECTOR`, `ROOT_DIR_SECTOR`,
/// the bitmap's own payload sectors, and the sectors named in `reserved` are
/// marked in-use by [`BitmapAllocator::format`].
pub struct BitmapAllocator<D: BlockDevice> {
    device: Arc<D>,
    bits: Mutex<Vec<bool>>,
}

impl<D: BlockDevice> BitmapAllocator<D> {
    /// Load the bitmap for an already-formatted filesystem.
    pub fn open(device: Arc<D>) -> Self {
        let sector_count = device.sector_count();
        let mut bits = vec![false; sector_count as usize];
        let mut buf = vec![0u8; SECTOR_SIZE];
        let sectors_for_bitmap = bitmap_sectors(sector_count);
        for s in 0..sectors_for_bitmap {
            device.read_sector(BITMAP_DATA_SECTOR + s, &mut buf);
            for (byte_idx, byte) in buf.iter().enumerate() {
                for bit in 0..8u32 {
                    let sector = s as usize * SECTOR_SIZE * 8 + byte_idx * 8 + bit as usize;
                    if sector < bits.len() {
                        bits[sector] = (byte >> bit) & 1 != 0;
                    }
                }
            }
        }
        Self {
            device,
            bits: Mutex::new(bits),
        }
    }

    /// Initialize a fresh bitmap: every sector free except `FREE_MAP_SECTOR`,
    /// the bitmap's own payload sectors, and the sectors named in `reserved`.
    pub fn format(device: Arc<D>, reserved: &[u32]) -> Self {
        let sector_count = device.sector_count();
        let mut bits = vec![true; sector_count as usize];
        bits[FREE_MAP_SECTOR as usize] = false;
        let sectors_for_bitmap = bitmap_sectors(sector_count);
        for s in 0..sectors_for_bitmap {
            bits[(BITMAP_DATA_SECTOR + s) as usize] = false;
        }
        for &r in reserved {
            bits[r as usize] = false;
        }
        let allocator = Self {
            device,
            bits: Mutex::new(bits),
        };
        allocator.flush(sectors_for_bitmap);
        allocator
    }

    /// Write the in-memory bitmap back to its payload sectors.
    pub fn flush(&self, sectors_for_bitmap: u32) {
        let bits = self.bits.lock();
        let mut buf = vec![0u8; SECTOR_SIZE];
        for s in 0..sectors_for_bitmap {
            buf.iter_mut().for_each(|b| *b = 0);
            for byte_idx in 0..SECTOR_SIZE {
                let mut byte = 0u8;
                for bit in 0..8u32 {
                    let sector = s as usize * SECTOR_SIZE * 8 + byte_idx * 8 + bit as usize;
                    if sector < bits.len() && bits[sector] {
                        byte |= 1 << bit;
                    }
                }
                buf[byte_idx] = byte;
            }
            self.device.write_sector(BITMAP_DATA_SECTOR + s, &buf);
        }
    }
}

fn bitmap_sectors(sector_count: u32) -> u32 {
    let bits_per_sector = (SECTOR_SIZE * 8) as u32;
    (sector_count + bits_per_sector - 1) / bits_per_sector
}

impl<D: BlockDevice> FreeSpaceAllocator for BitmapAllocator<D> {
    fn allocate(&self, count: u32) -> FsResult<u32> {
        let mut bits = self.bits.lock();
        let mut run_start = None;
        let mut run_len = 0u32;
        for i in 0..bits.len() {
            if bits[i] {
                if run_start.is_none() {
                    run_start = Some(i as u32);
                }
                run_len += 1;
                if run_len == count {
                    let start = run_start.unwrap();
                    for s in start..start + count {
                        bits[s as usize] = false;
                    }
                    return Ok(start);
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        warn!("free-space allocator exhausted requesting {count} sectors");
        Err(FsError::NoSpace)
    }

    fn release(&self, first: u32, count: u32) {
        let mut bits = self.bits.lock();
        for s in first..first + count {
            bits[s as usize] = true;
        }
    }

    fn sync(&self) {
        let sector_count = self.device.sector_count();
        self.flush(bitmap_sectors(sector_count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn allocate_and_release_round_trip() {
        let dev = Arc::new(MemBlockDevice::new(64));
        let alloc = BitmapAllocator::format(dev, &[0, 1]);
        let a = alloc.allocate(3).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, 1);
        let b = alloc.allocate(2).unwrap();
        assert!(b < a || b >= a + 3);
        alloc.release(a, 3);
        let c = alloc.allocate(3).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn exhaustion_reports_no_space() {
        // 5 sectors: 0 (free map) and 2 (bitmap payload) reserved, leaving
        // free runs {1} and {3, 4} — long enough for a 2-sector allocation
        // but not a 3-sector one.
        let dev = Arc::new(MemBlockDevice::new(5));
        let alloc = BitmapAllocator::format(dev, &[0]);
        assert!(alloc.allocate(3).is_err());
        assert!(alloc.allocate(2).is_ok());
    }
}
