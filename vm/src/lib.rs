//! Virtual memory subsystem
//!
//! The pager of a small teaching OS: it binds user virtual pages to
//! physical frames, backs them with executables, memory-mapped files
//! or a dedicated swap device, shares read-only frames across address
//! spaces, and reclaims memory under pressure with a second-chance
//! clock.
//!
//! # Structure
//!
//! - `frame`: the frame table, alias lists and the clock
//! - `swap`: the swap bitmap and the swap-out/swap-in engine
//! - `pagedir`: mapping installation and teardown
//! - `fault`: the page-fault handler and user memory access
//! - `mmap`: the memory-mapped file surface
//! - `pte`, `addr`: page tables and geometry
//! - `palloc`, `disk`, `filesys`: collaborator interfaces the pager
//!   drives (frame pool, block devices, contiguous files)
//!
//! # Locking
//!
//! One page-fault lock serialises everything: frame-table mutation,
//! alias edits, clock scans and swap I/O. `VmCore` wraps the whole
//! mutable state in that single mutex; each public operation takes it
//! once. Invariants on frames and aliases hold whenever the lock is
//! free.

#![no_std]

extern crate alloc;

pub mod addr;
pub mod disk;
pub mod fault;
pub mod filesys;
pub mod frame;
pub mod mmap;
pub mod pagedir;
pub mod palloc;
pub mod pte;
pub mod swap;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;
use thiserror::Error;

pub use addr::{PhysAddr, SectorNo, VirtAddr, PGSIZE, SECTORS_PER_PAGE, SECTOR_SIZE, USER_TOP};
pub use disk::{BlockDevice, RamDisk};
pub use filesys::{FileSys, InodeId};
pub use frame::{FrameFlags, FrameId};
pub use mmap::MapId;
pub use pte::{PdId, PteSlot};

use frame::FrameTable;
use mmap::Mapping;
use palloc::PagePool;
use pte::DirTable;
use swap::SwapMap;

/// Errors surfaced by the pager.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The swap bitmap has no free slot left.
    #[error("swap disk is full")]
    OutOfSwap,
    /// No physical frame available, even after eviction.
    #[error("no physical frame available")]
    OutOfMemory,
    /// An mmap argument failed validation.
    #[error("bad mapping argument")]
    MapBadArg,
    /// A target page of an mmap request is already mapped.
    #[error("mapping conflicts with an existing page")]
    MapConflict,
    /// An access no mapping, growth rule or lazy page can satisfy.
    #[error("illegal user memory access")]
    BadUserAccess,
}

/// Pager configuration, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Physical frames in the user pool.
    pub user_pages: usize,
    /// Leading swap-disk sectors kept off-limits for fixed metadata.
    pub swap_reserved_sectors: u32,
    /// Hard limit on user stack size, in bytes.
    pub max_stack: usize,
    /// How far below the stack pointer an access may land and still
    /// count as stack growth.
    pub stack_slack: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_pages: 256,
            swap_reserved_sectors: 8,
            max_stack: 0x0080_0000,
            stack_slack: 32,
        }
    }
}

/// Point-in-time counters, readable without touching pager state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub frames: usize,
    pub resident_frames: usize,
    pub aliases: usize,
    pub faults: u64,
    pub evictions: u64,
    pub swap_sectors_used: u32,
    pub free_pool_pages: usize,
}

/// Everything the page-fault lock protects.
pub(crate) struct VmState {
    pub(crate) config: VmConfig,
    pub(crate) dirs: DirTable,
    pub(crate) frames: FrameTable,
    pub(crate) pool: PagePool,
    pub(crate) swap: SwapMap,
    pub(crate) swap_disk: Box<dyn BlockDevice + Send>,
    pub(crate) fs: FileSys,
    pub(crate) mappings: Vec<Mapping>,
    pub(crate) fd_tables: BTreeMap<PdId, Vec<(i32, InodeId)>>,
    pub(crate) faults: u64,
    pub(crate) evictions: u64,
}

/// The virtual memory subsystem.
///
/// Constructed once at boot and handed to collaborators; all state
/// lives behind the single page-fault lock.
pub struct VmCore {
    pub(crate) state: Mutex<VmState>,
}

impl VmCore {
    pub fn new(
        config: VmConfig,
        swap_disk: Box<dyn BlockDevice + Send>,
        fs_disk: Box<dyn BlockDevice + Send>,
    ) -> Self {
        let swap = SwapMap::new(swap_disk.sector_count(), config.swap_reserved_sectors);
        log::info!(
            "vm: {} user frames, swap {} sectors ({} reserved), fs {} sectors",
            config.user_pages,
            swap_disk.sector_count(),
            config.swap_reserved_sectors,
            fs_disk.sector_count()
        );
        Self {
            state: Mutex::new(VmState {
                config,
                dirs: DirTable::new(),
                frames: FrameTable::new(),
                pool: PagePool::new(config.user_pages),
                swap,
                swap_disk,
                fs: FileSys::new(fs_disk),
                mappings: Vec::new(),
                fd_tables: BTreeMap::new(),
                faults: 0,
                evictions: 0,
            }),
        }
    }

    /// Create an empty user address space.
    pub fn create_address_space(&self) -> PdId {
        self.state.lock().dirs.create()
    }

    /// Tear an address space down, releasing every page, swap slot and
    /// mapping it holds.
    pub fn destroy_address_space(&self, pd: PdId) -> Result<(), VmError> {
        self.state.lock().destroy_pd(pd)
    }

    /// Install a virtual-to-physical binding. See the installer for
    /// the flag conventions.
    #[allow(clippy::too_many_arguments)]
    pub fn install(
        &self,
        pd: PdId,
        upage: VirtAddr,
        kpage: PhysAddr,
        writable: bool,
        flags: FrameFlags,
        sector_no: SectorNo,
        read_bytes: usize,
    ) -> Result<(), VmError> {
        self.state
            .lock()
            .install(pd, upage, kpage, writable, flags, sector_no, read_bytes)
    }

    /// Allocate a zero-filled frame from the user pool, evicting if
    /// the pool is dry. For callers installing resident pages.
    pub fn alloc_page(&self) -> Result<PhysAddr, VmError> {
        self.state.lock().alloc_user_page()
    }

    /// Resolve a page fault at VA with user stack pointer ESP.
    pub fn handle_fault(&self, pd: PdId, va: VirtAddr, esp: VirtAddr) -> Result<(), VmError> {
        self.state.lock().handle_fault(pd, va, esp)
    }

    /// Copy user memory into OUT, paging in as needed.
    pub fn read_user(&self, pd: PdId, va: VirtAddr, out: &mut [u8]) -> Result<(), VmError> {
        self.state.lock().read_user(pd, va, out)
    }

    /// Copy DATA into user memory, paging in as needed.
    pub fn write_user(&self, pd: PdId, va: VirtAddr, data: &[u8]) -> Result<(), VmError> {
        self.state.lock().write_user(pd, va, data)
    }

    /// Map the file behind FD at ADDR.
    pub fn mmap(&self, pd: PdId, fd: i32, addr: VirtAddr) -> Result<MapId, VmError> {
        self.state.lock().mmap(pd, fd, addr)
    }

    /// Remove a mapping, flushing dirty pages to the file.
    pub fn munmap(&self, pd: PdId, mapping: MapId) -> Result<(), VmError> {
        self.state.lock().munmap(pd, mapping)
    }

    /// Create a file on the file-system disk and open it once.
    pub fn create_file(&self, data: &[u8], writable: bool) -> InodeId {
        self.state.lock().fs.create(data, writable)
    }

    /// Open a descriptor on INODE in PD's descriptor table.
    pub fn open_fd(&self, pd: PdId, inode: InodeId) -> i32 {
        self.state.lock().open_fd(pd, inode)
    }

    pub fn file_length(&self, inode: InodeId) -> usize {
        self.state.lock().fs.length(inode)
    }

    /// Sector holding byte OFFSET of the file; loaders use this to
    /// install executable pages.
    pub fn file_sector(&self, inode: InodeId, offset: usize) -> SectorNo {
        self.state.lock().fs.byte_to_sector(inode, offset)
    }

    pub fn file_open_count(&self, inode: InodeId) -> u32 {
        self.state.lock().fs.open_count(inode)
    }

    /// Read the file straight off the disk, bypassing any mapping.
    pub fn file_read_at(&self, inode: InodeId, offset: usize, out: &mut [u8]) {
        self.state.lock().fs.read_at(inode, offset, out)
    }

    pub fn stats(&self) -> VmStats {
        let state = self.state.lock();
        VmStats {
            frames: state.frames.len(),
            resident_frames: state.frames.resident_count(),
            aliases: state.frames.alias_count(),
            faults: state.faults,
            evictions: state.evictions,
            swap_sectors_used: state.swap.used_sectors(),
            free_pool_pages: state.pool.free_pages(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_core;

    #[test]
    fn test_swap_slot_accounting_over_a_full_cycle() {
        // One anonymous page: eviction takes exactly eight sectors,
        // swap-in gives exactly eight back.
        let core = test_core(2);
        let pd = core.create_address_space();
        let esp = USER_TOP - 4;
        let page = addr::pg_round_down(esp);

        core.handle_fault(pd, page, esp).unwrap();
        core.write_user(pd, page, b"x").unwrap();

        let used_start = core.stats().swap_sectors_used;
        {
            let mut state = core.state.lock();
            let (id, _) = state.frames.lookup_by_pte(PteSlot::of(pd, page)).unwrap();
            state.evict_for_test(id);
        }
        assert_eq!(core.stats().swap_sectors_used, used_start + SECTORS_PER_PAGE);

        let mut b = [0u8; 1];
        core.read_user(pd, page, &mut b).unwrap();
        assert_eq!(core.stats().swap_sectors_used, used_start);
    }

    #[test]
    fn test_all_zero_page_takes_no_swap_slot() {
        // Dirtied but still all zero: eviction drops the page without
        // claiming a slot, and it faults back in as zeros.
        let core = test_core(2);
        let pd = core.create_address_space();
        let esp = USER_TOP - 4;
        let page = addr::pg_round_down(esp);

        core.handle_fault(pd, page, esp).unwrap();
        core.write_user(pd, page, &[0u8; 64]).unwrap();

        {
            let mut state = core.state.lock();
            let (id, _) = state.frames.lookup_by_pte(PteSlot::of(pd, page)).unwrap();
            state.evict_for_test(id);
        }
        assert_eq!(core.stats().swap_sectors_used, 0);

        let mut b = [1u8; 32];
        core.read_user(pd, page + 2000, &mut b).unwrap();
        assert_eq!(b, [0u8; 32]);
    }

    #[test]
    fn test_alias_invariants_after_operations() {
        // Every present PTE agrees with its frame, and no descriptor
        // is ever left with an empty alias list.
        let core = test_core(4);
        let pd1 = core.create_address_space();
        let pd2 = core.create_address_space();

        let image = alloc::vec![0x42u8; 2 * PGSIZE];
        let inode = core.create_file(&image, false);
        let sector = core.file_sector(inode, 0);
        let flags = FrameFlags::EXEC | FrameFlags::SWAP;
        for pd in [pd1, pd2] {
            core.install(pd, 0x10000, 0, false, flags, sector, PGSIZE).unwrap();
        }
        core.handle_fault(pd1, 0x10000, USER_TOP).unwrap();

        let state = core.state.lock();
        for frame in state.frames.iter() {
            assert!(!frame.aliases.is_empty());
            for slot in &frame.aliases {
                let pte = state.dirs.pte(*slot).unwrap();
                if pte.is_present() {
                    assert_eq!(pte.frame_addr(), frame.frame_addr);
                    assert!(!frame.flags.contains(FrameFlags::SWAP));
                }
            }
        }
        assert_eq!(state.frames.alias_count(), 2);
    }

    #[test]
    fn test_stats_snapshot() {
        let core = test_core(4);
        let pd = core.create_address_space();
        let esp = USER_TOP - 4;

        assert_eq!(core.stats().frames, 0);
        core.handle_fault(pd, esp - 4, esp).unwrap();

        let stats = core.stats();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.resident_frames, 1);
        assert_eq!(stats.aliases, 1);
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.free_pool_pages, 3);
    }
}
