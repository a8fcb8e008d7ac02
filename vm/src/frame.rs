//! Frame table
//!
//! The frame table is the authoritative record of every user page the
//! pager tracks, resident or not. Each descriptor carries:
//! - The physical frame address (zero while the page is out of memory)
//! - The alias list: every PTE slot mapping this frame
//! - Flags describing the backing store and the coalesced status bits
//! - The backing sector and the meaningful byte count of the page
//!
//! A second-chance clock scans the table to pick eviction victims. The
//! hand is a stable frame id, advanced eagerly before the descriptor it
//! names can be removed.
//!
//! All mutation happens under the page-fault lock; the table itself
//! carries no locking.

use alloc::vec::Vec;

use crate::addr::{PhysAddr, SectorNo};
use crate::pte::{DirTable, PteSlot};

bitflags::bitflags! {
    /// Frame descriptor flags.
    ///
    /// MMAP, EXEC and the absence of both disambiguate the backing
    /// store; SWAP, DIRTY, ACCESSED and IO are orthogonal status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        /// Page of a memory-mapped file; backed by file-system sectors.
        const MMAP     = 0o01;
        /// Page of an executable image; backed by read-only file sectors.
        const EXEC     = 0o02;
        /// Page is not resident.
        const SWAP     = 0o04;
        /// Coalesced dirty bit of all aliases.
        const DIRTY    = 0o10;
        /// Coalesced accessed bit of all aliases.
        const ACCESSED = 0o20;
        /// Page is mid-transfer and must not be selected for eviction.
        const IO       = 0o40;
    }
}

/// Stable identifier of a frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(u32);

/// One tracked frame.
pub struct Frame {
    pub id: FrameId,
    /// Physical frame address; zero while the page is not resident.
    pub frame_addr: PhysAddr,
    /// Every PTE slot mapping this frame. Never empty outside a
    /// guarded critical section.
    pub aliases: Vec<PteSlot>,
    pub flags: FrameFlags,
    /// File-system sector for MMAP/EXEC frames, swap sector for
    /// anonymous frames while swapped out, meaningless otherwise.
    pub sector_no: SectorNo,
    /// For file-backed frames, the byte count read from the file.
    /// For anonymous frames, the count of meaningful (non-zero) bytes,
    /// so an all-zero page never needs a swap slot.
    pub read_bytes: usize,
}

impl Frame {
    pub fn is_resident(&self) -> bool {
        !self.flags.contains(FrameFlags::SWAP)
    }

    /// Anonymous frames are those backed by the swap disk when paged
    /// out, as opposed to file sectors.
    pub fn is_anonymous(&self) -> bool {
        !self.flags.intersects(FrameFlags::MMAP | FrameFlags::EXEC)
    }
}

/// The table of all tracked frames, in insertion order, plus the clock
/// hand.
pub struct FrameTable {
    frames: Vec<Frame>,
    hand: Option<FrameId>,
    next_id: u32,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            hand: None,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.iter().find(|f| f.id == id)
    }

    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|f| f.id == id)
    }

    pub fn hand(&self) -> Option<FrameId> {
        self.hand
    }

    fn pos(&self, id: FrameId) -> Option<usize> {
        self.frames.iter().position(|f| f.id == id)
    }

    /// Append a new descriptor with a single alias. Existing
    /// descriptors are never reordered.
    pub fn insert(
        &mut self,
        frame_addr: PhysAddr,
        alias: PteSlot,
        flags: FrameFlags,
        sector_no: SectorNo,
        read_bytes: usize,
    ) -> FrameId {
        let id = FrameId(self.next_id);
        self.next_id += 1;
        let mut aliases = Vec::with_capacity(1);
        aliases.push(alias);
        self.frames.push(Frame {
            id,
            frame_addr,
            aliases,
            flags,
            sector_no,
            read_bytes,
        });
        id
    }

    /// Append ALIAS to the alias list of frame ID.
    pub fn install_alias(&mut self, id: FrameId, alias: PteSlot) {
        let frame = self.get_mut(id).expect("alias install on unknown frame");
        debug_assert!(!frame.aliases.contains(&alias));
        frame.aliases.push(alias);
    }

    /// Find the frame and alias index tracking SLOT. Linear scan.
    pub fn lookup_by_pte(&self, slot: PteSlot) -> Option<(FrameId, usize)> {
        for frame in &self.frames {
            if let Some(i) = frame.aliases.iter().position(|a| *a == slot) {
                return Some((frame.id, i));
            }
        }
        None
    }

    /// Unlink descriptor ID. If the hand names it, the hand moves to
    /// the next descriptor first.
    pub fn remove(&mut self, id: FrameId) -> Frame {
        let idx = self.pos(id).expect("remove of unknown frame");
        if self.hand == Some(id) {
            self.hand = if self.frames.len() == 1 {
                None
            } else {
                Some(self.frames[(idx + 1) % self.frames.len()].id)
            };
        }
        self.frames.remove(idx)
    }

    /// Number of frames currently resident.
    pub fn resident_count(&self) -> usize {
        self.frames.iter().filter(|f| f.is_resident()).count()
    }

    /// Total alias count across all frames.
    pub fn alias_count(&self) -> usize {
        self.frames.iter().map(|f| f.aliases.len()).sum()
    }
}

// ============================================================================
// Status synchronization
// ============================================================================

/// Fold the per-PTE accessed and dirty bits into per-frame bits.
///
/// Each frame's DIRTY and ACCESSED flags are recomputed as the OR over
/// its aliases; the scan of one frame stops as soon as both bits are
/// known set. Must run before the clock inspects the table.
pub fn collect_status_bits(frames: &mut FrameTable, dirs: &DirTable) {
    for frame in &mut frames.frames {
        frame.flags.remove(FrameFlags::DIRTY | FrameFlags::ACCESSED);
        for slot in &frame.aliases {
            let Some(pte) = dirs.pte(*slot) else { continue };
            if pte.is_dirty() {
                frame.flags.insert(FrameFlags::DIRTY);
            }
            if pte.is_accessed() {
                frame.flags.insert(FrameFlags::ACCESSED);
            }
            if frame.flags.contains(FrameFlags::DIRTY | FrameFlags::ACCESSED) {
                break;
            }
        }
    }
}

/// Force every alias's D and A bits to match its frame's coalesced
/// DIRTY and ACCESSED flags. Runs after the clock advances so aliases
/// agree with the state the policy saw.
pub fn sync_aliases(frames: &FrameTable, dirs: &mut DirTable) {
    for frame in &frames.frames {
        let dirty = frame.flags.contains(FrameFlags::DIRTY);
        let accessed = frame.flags.contains(FrameFlags::ACCESSED);
        for slot in &frame.aliases {
            if let Some(pte) = dirs.pte_mut(*slot) {
                pte.set_dirty(dirty);
                pte.set_accessed(accessed);
            }
        }
    }
}

// ============================================================================
// Clock victim selection
// ============================================================================

/// Select an eviction victim with the second-chance policy.
///
/// Swapped-out and mid-I/O frames are skipped; a recently referenced
/// frame loses its ACCESSED bit and is passed over once. The scan is
/// bounded at two full passes, which suffices whenever at least one
/// resident non-IO frame exists; otherwise None is returned and the
/// caller reports out-of-memory.
pub fn select_victim(frames: &mut FrameTable, dirs: &mut DirTable) -> Option<FrameId> {
    collect_status_bits(frames, dirs);

    if frames.frames.is_empty() {
        return None;
    }

    let len = frames.frames.len();
    let mut idx = frames
        .hand
        .and_then(|h| frames.pos(h))
        .unwrap_or(0);

    for _ in 0..2 * len + 1 {
        let frame = &mut frames.frames[idx];

        if frame.flags.intersects(FrameFlags::SWAP | FrameFlags::IO) {
            idx = (idx + 1) % len;
            continue;
        }

        if frame.flags.contains(FrameFlags::ACCESSED) {
            frame.flags.remove(FrameFlags::ACCESSED);
            idx = (idx + 1) % len;
            continue;
        }

        let victim = frame.id;
        frames.hand = Some(frames.frames[(idx + 1) % len].id);
        sync_aliases(frames, dirs);
        return Some(victim);
    }

    None
}
