//! Swap store
//!
//! Two pieces live here:
//!
//! - A first-fit bitmap allocator over the raw swap disk. Slots are
//!   runs of eight consecutive sectors, one page each. A configurable
//!   prefix of the disk is reserved for fixed metadata and never
//!   handed out.
//! - The swap-out/swap-in engine that moves a frame between physical
//!   memory and its backing store: file-system sectors for MMAP and
//!   EXEC frames, swap slots for anonymous ones.
//!
//! Both run under the page-fault lock; disk I/O is synchronous and the
//! lock is held across the transfer.

use bit_field::BitField;

use alloc::vec;
use alloc::vec::Vec;

use crate::addr::{SectorNo, PGSIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use crate::disk::BlockDevice;
use crate::frame::{select_victim, FrameFlags, FrameId};
use crate::{PhysAddr, VmError, VmState};

// ============================================================================
// Swap bitmap
// ============================================================================

/// Free map of swap-disk sectors. Bit set = sector allocated.
pub struct SwapMap {
    words: Vec<u64>,
    sectors: u32,
    used: u32,
}

impl SwapMap {
    /// Create a map over SECTORS sectors with the first RESERVED of
    /// them permanently marked allocated.
    pub fn new(sectors: u32, reserved: u32) -> Self {
        assert!(reserved <= sectors);
        let mut map = Self {
            words: vec![0; (sectors as usize).div_ceil(64)],
            sectors,
            used: 0,
        };
        for sector in 0..reserved {
            map.set(sector, true);
        }
        map
    }

    fn get(&self, sector: SectorNo) -> bool {
        self.words[sector as usize / 64].get_bit(sector as usize % 64)
    }

    fn set(&mut self, sector: SectorNo, value: bool) {
        let old = self.get(sector);
        self.words[sector as usize / 64].set_bit(sector as usize % 64, value);
        match (old, value) {
            (false, true) => self.used += 1,
            (true, false) => self.used -= 1,
            _ => {}
        }
    }

    /// Claim the first run of eight consecutive free sectors.
    pub fn reserve(&mut self) -> Result<SectorNo, VmError> {
        let mut run = 0u32;
        for sector in 0..self.sectors {
            if self.get(sector) {
                run = 0;
                continue;
            }
            run += 1;
            if run == SECTORS_PER_PAGE {
                let start = sector + 1 - SECTORS_PER_PAGE;
                for s in start..start + SECTORS_PER_PAGE {
                    self.set(s, true);
                }
                return Ok(start);
            }
        }
        Err(VmError::OutOfSwap)
    }

    /// Release the eight sectors starting at SECTOR.
    pub fn release(&mut self, sector: SectorNo) {
        for s in sector..sector + SECTORS_PER_PAGE {
            debug_assert!(self.get(s), "releasing free swap sector {s}");
            self.set(s, false);
        }
    }

    pub fn sector_count(&self) -> u32 {
        self.sectors
    }

    /// Number of allocated sectors, reserved prefix included.
    pub fn used_sectors(&self) -> u32 {
        self.used
    }

    /// Mark every sector allocated. Exercises the out-of-swap path.
    #[cfg(test)]
    pub(crate) fn mark_all_used(&mut self) {
        for sector in 0..self.sectors {
            self.set(sector, true);
        }
    }
}

// ============================================================================
// Swap-out / swap-in engine
// ============================================================================

fn write_page(disk: &mut dyn BlockDevice, sector: SectorNo, page: &[u8], bytes: usize) {
    let mut buf = [0u8; SECTOR_SIZE];
    let sectors = bytes.div_ceil(SECTOR_SIZE) as u32;
    for i in 0..sectors.min(SECTORS_PER_PAGE) {
        let start = i as usize * SECTOR_SIZE;
        buf.copy_from_slice(&page[start..start + SECTOR_SIZE]);
        disk.write(sector + i, &buf);
    }
}

fn read_page(disk: &mut dyn BlockDevice, sector: SectorNo, page: &mut [u8], bytes: usize) {
    let mut buf = [0u8; SECTOR_SIZE];
    let sectors = bytes.div_ceil(SECTOR_SIZE) as u32;
    for i in 0..sectors.min(SECTORS_PER_PAGE) {
        disk.read(sector + i, &mut buf);
        let start = i as usize * SECTOR_SIZE;
        page[start..start + SECTOR_SIZE].copy_from_slice(&buf);
    }
}

impl VmState {
    /// Evict FRAME from memory.
    ///
    /// A dirty page that was installed all-zero gets its meaningful
    /// byte count recomputed, scanning tail-first, so a page that is
    /// still all zero skips the swap slot entirely. A dirtied page no
    /// longer matches its executable image, so EXEC is dropped and the
    /// page continues life as an anonymous one.
    pub(crate) fn evict(&mut self, id: FrameId) -> Result<(), VmError> {
        let frame = self.frames.get(id).expect("evicting unknown frame");
        if frame.flags.contains(FrameFlags::DIRTY) && !frame.flags.contains(FrameFlags::MMAP) {
            // The dirtied page no longer matches any executable image;
            // from here on the page itself is the content of record.
            let page = self.pool.page(frame.frame_addr);
            let meaningful = page.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            let frame = self.frames.get_mut(id).unwrap();
            frame.read_bytes = meaningful;
            frame.flags.remove(FrameFlags::EXEC);
        }
        self.swap_out(id)?;
        self.evictions += 1;
        Ok(())
    }

    /// Move a resident frame out to its backing store and release its
    /// physical page.
    ///
    /// Clean frames are dropped without a write. Dirty MMAP frames go
    /// back to their file sectors; dirty anonymous frames claim a swap
    /// slot first. If no slot is free the frame is left fully resident
    /// and `OutOfSwap` is returned, so a later attempt can pick a
    /// different victim.
    pub(crate) fn swap_out(&mut self, id: FrameId) -> Result<(), VmError> {
        let frame = self.frames.get(id).expect("swapping out unknown frame");
        debug_assert!(frame.is_resident(), "swap_out of non-resident frame");
        debug_assert!(!frame.flags.contains(FrameFlags::IO));

        let dirty = frame.flags.contains(FrameFlags::DIRTY);
        let mmap = frame.flags.contains(FrameFlags::MMAP);
        let anonymous = frame.is_anonymous();
        let bytes = frame.read_bytes.min(PGSIZE);
        let frame_addr = frame.frame_addr;

        // Pick the target sectors before touching any PTE, so a failed
        // reservation leaves the victim untouched.
        enum Target {
            None,
            Filesys(SectorNo),
            Swap(SectorNo),
        }
        let target = if !dirty || bytes == 0 {
            Target::None
        } else if mmap {
            Target::Filesys(frame.sector_no)
        } else {
            debug_assert!(anonymous, "dirty EXEC frame reached swap_out");
            let sector = match self.swap.reserve() {
                Ok(sector) => sector,
                Err(e) => {
                    log::warn!("out of virtual memory: no swap slot for frame at {frame_addr:#x}");
                    return Err(e);
                }
            };
            self.frames.get_mut(id).unwrap().sector_no = sector;
            Target::Swap(sector)
        };

        // Detach all aliases: keep their flag bits, drop the frame
        // address, clear present. On hardware this runs with
        // interrupts off; here the page-fault lock covers the MMU.
        let frame = self.frames.get_mut(id).unwrap();
        frame.flags.insert(FrameFlags::SWAP);
        let aliases = frame.aliases.clone();
        for slot in aliases {
            if let Some(pte) = self.dirs.pte_mut(slot) {
                pte.make_not_present();
            }
        }

        match target {
            Target::None => {}
            Target::Filesys(sector) => {
                let Self { pool, fs, .. } = self;
                write_page(fs.disk_mut(), sector, pool.page(frame_addr), bytes);
            }
            Target::Swap(sector) => {
                let Self { pool, swap_disk, .. } = self;
                write_page(swap_disk.as_mut(), sector, pool.page(frame_addr), bytes);
            }
        }

        self.pool.free(frame_addr);
        self.frames.get_mut(id).unwrap().frame_addr = 0;
        Ok(())
    }

    /// Bring a swapped-out frame back into memory and reattach all of
    /// its aliases.
    pub(crate) fn swap_in(&mut self, id: FrameId) -> Result<(), VmError> {
        let page_addr = self.alloc_user_page()?;

        let frame = self.frames.get_mut(id).expect("swapping in unknown frame");
        debug_assert!(frame.flags.contains(FrameFlags::SWAP));
        frame.frame_addr = page_addr;

        let bytes = frame.read_bytes.min(PGSIZE);
        let sector = frame.sector_no;
        let anonymous = frame.is_anonymous();

        if bytes > 0 {
            if anonymous {
                let Self { pool, swap_disk, .. } = self;
                read_page(swap_disk.as_mut(), sector, pool.page_mut(page_addr), bytes);
                self.swap.release(sector);
                self.frames.get_mut(id).unwrap().sector_no = 0;
            } else {
                let Self { pool, fs, .. } = self;
                read_page(fs.disk_mut(), sector, pool.page_mut(page_addr), bytes);
            }
            // The last sector read may extend past the meaningful
            // bytes; the tail of the page must read as zeros.
            if bytes < PGSIZE {
                self.pool.page_mut(page_addr)[bytes..].fill(0);
            }
        }

        let frame = self.frames.get_mut(id).unwrap();
        let aliases = frame.aliases.clone();
        for slot in aliases {
            if let Some(pte) = self.dirs.pte_mut(slot) {
                pte.make_present(page_addr);
            }
        }
        self.frames.get_mut(id).unwrap().flags.remove(FrameFlags::SWAP);
        Ok(())
    }

    /// Allocate a zero-filled user frame, evicting as needed.
    ///
    /// Each failed attempt advanced the clock hand, so a victim whose
    /// eviction failed for want of swap space is not retried
    /// immediately; when no eviction can free a page the request dies
    /// with `OutOfMemory`.
    pub(crate) fn alloc_user_page(&mut self) -> Result<PhysAddr, VmError> {
        if let Some(pa) = self.pool.alloc(true) {
            return Ok(pa);
        }
        let attempts = self.frames.len() + 1;
        for _ in 0..attempts {
            let Some(victim) = select_victim(&mut self.frames, &mut self.dirs) else {
                break;
            };
            match self.evict(victim) {
                Ok(()) => {
                    if let Some(pa) = self.pool.alloc(true) {
                        return Ok(pa);
                    }
                }
                Err(VmError::OutOfSwap) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VmError::OutOfMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_is_first_fit() {
        let mut map = SwapMap::new(64, 0);
        assert_eq!(map.reserve().unwrap(), 0);
        assert_eq!(map.reserve().unwrap(), 8);

        map.release(0);
        assert_eq!(map.reserve().unwrap(), 0);
    }

    #[test]
    fn test_reserved_prefix_is_off_limits() {
        let mut map = SwapMap::new(32, 10);
        assert_eq!(map.reserve().unwrap(), 10);
        assert_eq!(map.used_sectors(), 18);
    }

    #[test]
    fn test_reserve_needs_a_full_run() {
        // 15 free sectors split 7 + 8 around an allocated one.
        let mut map = SwapMap::new(16, 0);
        map.set(7, true);
        assert_eq!(map.reserve().unwrap(), 8);
        assert!(map.reserve().is_err());
    }

    #[test]
    fn test_out_of_swap() {
        let mut map = SwapMap::new(8, 0);
        assert_eq!(map.reserve().unwrap(), 0);
        assert_eq!(map.reserve(), Err(VmError::OutOfSwap));

        map.release(0);
        assert_eq!(map.used_sectors(), 0);
        assert!(map.reserve().is_ok());
    }
}
