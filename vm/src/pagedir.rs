//! Mapping installation and teardown
//!
//! Installing a virtual-to-physical binding writes the PTE and then
//! connects it to the frame table: either as a new alias of an
//! existing shareable frame, or as the single alias of a fresh
//! descriptor. Tearing a PTE down is the reverse; when the last alias
//! goes, the frame's resources are released exactly once.
//!
//! Sharing is only ever offered for file-backed frames. Two writable
//! views of the same executable page would diverge, so a writable
//! request for an EXEC frame always gets its own descriptor.

use alloc::vec::Vec;

use crate::addr::{is_page_aligned, is_user_vaddr, PhysAddr, SectorNo, VirtAddr, PGSIZE};
use crate::frame::{collect_status_bits, FrameFlags};
use crate::pte::{PdId, Pte, PteSlot};
use crate::{VmError, VmState};

impl VmState {
    /// Bind UPAGE in address space PD to the frame at KPAGE.
    ///
    /// FLAGS, SECTOR_NO and READ_BYTES describe the backing store; a
    /// request carrying SWAP installs the mapping lazily, to be
    /// materialised by the first fault. KPAGE is zero in that case.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn install(
        &mut self,
        pd: PdId,
        upage: VirtAddr,
        kpage: PhysAddr,
        writable: bool,
        flags: FrameFlags,
        sector_no: SectorNo,
        read_bytes: usize,
    ) -> Result<(), VmError> {
        if !is_page_aligned(upage) || !is_user_vaddr(upage) {
            return Err(VmError::MapBadArg);
        }
        if kpage as usize % PGSIZE != 0 {
            return Err(VmError::MapBadArg);
        }
        let Some(dir) = self.dirs.dir_mut(pd) else {
            return Err(VmError::MapBadArg);
        };

        let pte = dir
            .lookup_mut(upage, true)
            .expect("page table creation cannot fail");
        *pte = Pte::user(kpage, writable);

        // A lazy install starts out not present; the frame address
        // field (zero here) and the flag bits are kept.
        if flags.contains(FrameFlags::SWAP) {
            pte.set_present(false);
        }

        let slot = PteSlot::of(pd, upage);

        // Look for a shareable frame: same file backing, same sectors,
        // covering at least as many meaningful bytes.
        let backing = flags & (FrameFlags::MMAP | FrameFlags::EXEC);
        let mut shared = None;
        for frame in self.frames.iter() {
            if frame.flags.intersects(backing)
                && frame.sector_no == sector_no
                && frame.read_bytes >= read_bytes
            {
                if flags.contains(FrameFlags::EXEC) && writable {
                    break;
                }
                shared = Some(frame.id);
                break;
            }
        }

        if let Some(id) = shared {
            let frame = self.frames.get(id).unwrap();
            if frame.is_resident() {
                let frame_addr = frame.frame_addr;
                self.dirs.pte_mut(slot).unwrap().make_present(frame_addr);
            }

            // The new alias must agree with the coalesced status bits
            // its siblings have accumulated.
            collect_status_bits(&mut self.frames, &self.dirs);
            let frame = self.frames.get(id).unwrap();
            let dirty = frame.flags.contains(FrameFlags::DIRTY);
            let accessed = frame.flags.contains(FrameFlags::ACCESSED);
            let pte = self.dirs.pte_mut(slot).unwrap();
            if dirty {
                pte.set_dirty(true);
            }
            if accessed {
                pte.set_accessed(true);
            }

            self.frames.install_alias(id, slot);
            return Ok(());
        }

        let frame_addr = self.dirs.pte(slot).unwrap().frame_addr();
        self.frames.insert(frame_addr, slot, flags, sector_no, read_bytes);
        Ok(())
    }

    /// Tear down the mapping at SLOT. If this was the frame's last
    /// alias, release its backing resources and drop the descriptor.
    pub(crate) fn pte_destroy(&mut self, slot: PteSlot) -> Result<(), VmError> {
        collect_status_bits(&mut self.frames, &self.dirs);

        let Some((id, alias_idx)) = self.frames.lookup_by_pte(slot) else {
            if let Some(pte) = self.dirs.pte_mut(slot) {
                *pte = Pte::empty();
            }
            return Ok(());
        };

        let frame = self.frames.get_mut(id).unwrap();
        frame.aliases.remove(alias_idx);

        if frame.aliases.is_empty() {
            let flags = frame.flags;
            let sector_no = frame.sector_no;
            let anonymous = frame.is_anonymous();
            let read_bytes = frame.read_bytes;

            if flags.contains(FrameFlags::SWAP) {
                // Only anonymous frames hold swap slots; file-backed
                // sectors belong to the file system.
                if anonymous && read_bytes > 0 {
                    self.swap.release(sector_no);
                }
            } else {
                // Dirty contents are dropped unless a file is behind
                // them; swap_out then flushes and frees the page.
                if !flags.contains(FrameFlags::MMAP) {
                    self.frames.get_mut(id).unwrap().flags.remove(FrameFlags::DIRTY);
                }
                self.swap_out(id)?;
            }

            self.frames.remove(id);
        }

        if let Some(pte) = self.dirs.pte_mut(slot) {
            *pte = Pte::empty();
        }
        Ok(())
    }

    /// Destroy address space PD: every tracked PTE is torn down, any
    /// mapping records are settled, and the directory is dropped.
    pub(crate) fn destroy_pd(&mut self, pd: PdId) -> Result<(), VmError> {
        let Some(dir) = self.dirs.dir(pd) else {
            return Err(VmError::MapBadArg);
        };

        let mut slots = Vec::new();
        for (pde, table) in dir.present_tables() {
            for (pte_idx, pte) in table.entries.iter().enumerate() {
                if pte.raw() != 0 {
                    slots.push(PteSlot {
                        pd,
                        pde: pde as u16,
                        pte: pte_idx as u16,
                    });
                }
            }
        }
        for slot in slots {
            self.pte_destroy(slot)?;
        }

        // Mappings the process never unmapped settle their inode
        // references here, as munmap would have.
        let mut i = 0;
        while i < self.mappings.len() {
            if self.mappings[i].pd == pd {
                let m = self.mappings.remove(i);
                self.fs.close(m.inode);
                self.fs.close(m.inode);
            } else {
                i += 1;
            }
        }
        self.fd_tables.remove(&pd);

        self.dirs.remove(pd);
        log::debug!("address space {} destroyed", pd.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::SECTORS_PER_PAGE;
    use crate::test_support::test_core;

    #[test]
    fn test_install_resident_anonymous_page() {
        let core = test_core(8);
        let pd = core.create_address_space();
        let mut state = core.state.lock();

        let kpage = state.alloc_user_page().unwrap();
        state.install(pd, 0x1000, kpage, true, FrameFlags::empty(), 0, 0).unwrap();

        let slot = PteSlot::of(pd, 0x1000);
        let pte = state.dirs.pte(slot).unwrap();
        assert!(pte.is_present());
        assert!(pte.is_writable());
        assert_eq!(pte.frame_addr(), kpage);

        let (id, _) = state.frames.lookup_by_pte(slot).unwrap();
        let frame = state.frames.get(id).unwrap();
        assert_eq!(frame.frame_addr, kpage);
        assert_eq!(frame.aliases.len(), 1);
    }

    #[test]
    fn test_install_rejects_bad_arguments() {
        let core = test_core(4);
        let pd = core.create_address_space();
        let mut state = core.state.lock();

        assert_eq!(
            state.install(pd, 0x1001, 0, true, FrameFlags::SWAP, 0, 0),
            Err(VmError::MapBadArg)
        );
        assert_eq!(
            state.install(pd, 0xC000_0000, 0, true, FrameFlags::SWAP, 0, 0),
            Err(VmError::MapBadArg)
        );
        assert_eq!(
            state.install(PdId(999), 0x1000, 0, true, FrameFlags::SWAP, 0, 0),
            Err(VmError::MapBadArg)
        );
    }

    #[test]
    fn test_read_only_installs_share_one_frame() {
        // Two read-only views of the same executable page coalesce
        // onto a single descriptor with two aliases.
        let core = test_core(8);
        let pd1 = core.create_address_space();
        let pd2 = core.create_address_space();
        let mut state = core.state.lock();

        let flags = FrameFlags::EXEC | FrameFlags::SWAP;
        state.install(pd1, 0x8000, 0, false, flags, 40, PGSIZE).unwrap();
        state.install(pd2, 0x8000, 0, false, flags, 40, PGSIZE).unwrap();

        assert_eq!(state.frames.len(), 1);
        let (id, _) = state.frames.lookup_by_pte(PteSlot::of(pd1, 0x8000)).unwrap();
        assert_eq!(state.frames.get(id).unwrap().aliases.len(), 2);

        // Swap-in reaches every alias.
        state.swap_in(id).unwrap();
        let pa1 = state.dirs.pte(PteSlot::of(pd1, 0x8000)).unwrap();
        let pa2 = state.dirs.pte(PteSlot::of(pd2, 0x8000)).unwrap();
        assert!(pa1.is_present() && pa2.is_present());
        assert_eq!(pa1.frame_addr(), pa2.frame_addr());
    }

    #[test]
    fn test_writable_exec_is_never_shared() {
        let core = test_core(8);
        let pd1 = core.create_address_space();
        let pd2 = core.create_address_space();
        let mut state = core.state.lock();

        let flags = FrameFlags::EXEC | FrameFlags::SWAP;
        state.install(pd1, 0x8000, 0, false, flags, 40, PGSIZE).unwrap();
        state.install(pd2, 0x8000, 0, true, flags, 40, PGSIZE).unwrap();

        assert_eq!(state.frames.len(), 2);
    }

    #[test]
    fn test_sharing_requires_covering_read_bytes() {
        let core = test_core(8);
        let pd1 = core.create_address_space();
        let pd2 = core.create_address_space();
        let pd3 = core.create_address_space();
        let mut state = core.state.lock();

        let flags = FrameFlags::EXEC | FrameFlags::SWAP;
        state.install(pd1, 0x8000, 0, false, flags, 40, 800).unwrap();
        // Wants more of the page than the existing frame holds.
        state.install(pd2, 0x8000, 0, false, flags, 40, PGSIZE).unwrap();
        assert_eq!(state.frames.len(), 2);

        // The smaller request rides along with a covering frame.
        state.install(pd3, 0x8000, 0, false, flags, 40, 100).unwrap();
        assert_eq!(state.frames.len(), 2);
    }

    #[test]
    fn test_teardown_releases_swap_run() {
        let core = test_core(2);
        let pd = core.create_address_space();
        let mut state = core.state.lock();

        let kpage = state.alloc_user_page().unwrap();
        state.install(pd, 0x1000, kpage, true, FrameFlags::empty(), 0, 0).unwrap();

        // Dirty the page and force it out so it claims a swap slot.
        let slot = PteSlot::of(pd, 0x1000);
        state.dirs.pte_mut(slot).unwrap().set_dirty(true);
        state.pool.page_mut(kpage)[0] = 7;
        let (id, _) = state.frames.lookup_by_pte(slot).unwrap();
        let used_before = state.swap.used_sectors();
        let st = &mut *state;
        crate::frame::collect_status_bits(&mut st.frames, &st.dirs);
        state.evict(id).unwrap();
        assert_eq!(state.swap.used_sectors(), used_before + SECTORS_PER_PAGE);

        drop(state);
        core.destroy_address_space(pd).unwrap();
        let state = core.state.lock();
        assert_eq!(state.swap.used_sectors(), used_before);
        assert_eq!(state.frames.len(), 0);
    }

    #[test]
    fn test_last_alias_frees_the_frame_once() {
        let core = test_core(8);
        let pd1 = core.create_address_space();
        let pd2 = core.create_address_space();
        let mut state = core.state.lock();

        let flags = FrameFlags::EXEC | FrameFlags::SWAP;
        state.install(pd1, 0x8000, 0, false, flags, 40, PGSIZE).unwrap();
        state.install(pd2, 0x8000, 0, false, flags, 40, PGSIZE).unwrap();

        state.pte_destroy(PteSlot::of(pd1, 0x8000)).unwrap();
        assert_eq!(state.frames.len(), 1);
        state.pte_destroy(PteSlot::of(pd2, 0x8000)).unwrap();
        assert_eq!(state.frames.len(), 0);
    }
}
