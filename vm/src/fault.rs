//! Page-fault handling
//!
//! Entry point from the CPU trap. A fault at a user address resolves
//! one of three ways:
//! - The page is tracked and swapped out: bring it back in.
//! - The access looks like stack growth: install a fresh zeroed,
//!   writable, anonymous page.
//! - Anything else is an illegal access and the process dies.
//!
//! The kernel-side user memory helpers live here too. They walk the
//! page table the way the MMU would, faulting pages in on demand and
//! setting the accessed and dirty bits the hardware would set.

use crate::addr::{is_user_vaddr, pg_ofs, pg_round_down, VirtAddr, PGSIZE, USER_TOP};
use crate::frame::FrameFlags;
use crate::pte::{PdId, PteSlot};
use crate::{VmError, VmState};

impl VmState {
    /// Resolve a fault at VA in PD. ESP is the faulting thread's user
    /// stack pointer, used by the growth heuristic.
    pub(crate) fn handle_fault(
        &mut self,
        pd: PdId,
        va: VirtAddr,
        esp: VirtAddr,
    ) -> Result<(), VmError> {
        if !is_user_vaddr(va) || !self.dirs.contains(pd) {
            return Err(VmError::BadUserAccess);
        }
        self.faults += 1;

        let page = pg_round_down(va);
        let slot = PteSlot::of(pd, page);

        if let Some((id, _)) = self.frames.lookup_by_pte(slot) {
            let frame = self.frames.get(id).unwrap();
            if frame.flags.contains(FrameFlags::SWAP) {
                log::trace!("fault {va:#x}: swapping frame back in");
                return self.swap_in(id);
            }
            // Resident and still faulting: a protection violation.
            return Err(VmError::BadUserAccess);
        }

        if self.is_stack_access(va, esp) {
            log::trace!("fault {va:#x}: growing user stack");
            let kpage = self.alloc_user_page()?;
            return self.install(pd, page, kpage, true, FrameFlags::empty(), 0, 0);
        }

        Err(VmError::BadUserAccess)
    }

    /// An access just below the stack pointer, within the growth
    /// window and above the hard stack limit, grows the stack.
    fn is_stack_access(&self, va: VirtAddr, esp: VirtAddr) -> bool {
        let limit = USER_TOP - self.config.max_stack as u32;
        va >= limit && va >= esp.saturating_sub(self.config.stack_slack)
    }

    /// Make the page holding PAGE_VA resident, without growing the
    /// stack. Kernel accesses on behalf of the user come through here.
    fn ensure_resident(&mut self, pd: PdId, page_va: VirtAddr) -> Result<PteSlot, VmError> {
        let slot = PteSlot::of(pd, page_va);
        if let Some(pte) = self.dirs.pte(slot) {
            if pte.is_present() {
                return Ok(slot);
            }
        }
        if let Some((id, _)) = self.frames.lookup_by_pte(slot) {
            let frame = self.frames.get(id).unwrap();
            if frame.flags.contains(FrameFlags::SWAP) {
                self.faults += 1;
                self.swap_in(id)?;
                return Ok(slot);
            }
        }
        Err(VmError::BadUserAccess)
    }

    /// Copy user memory at VA into OUT, faulting pages in as needed.
    pub(crate) fn read_user(
        &mut self,
        pd: PdId,
        va: VirtAddr,
        out: &mut [u8],
    ) -> Result<(), VmError> {
        self.user_span_ok(va, out.len())?;
        let mut done = 0;
        while done < out.len() {
            let cur = va + done as u32;
            let ofs = pg_ofs(cur);
            let n = (PGSIZE - ofs).min(out.len() - done);

            let slot = self.ensure_resident(pd, pg_round_down(cur))?;
            let pte = self.dirs.pte_mut(slot).unwrap();
            pte.set_accessed(true);
            let pa = pte.frame_addr();
            out[done..done + n].copy_from_slice(&self.pool.page(pa)[ofs..ofs + n]);
            done += n;
        }
        Ok(())
    }

    /// Copy DATA into user memory at VA, faulting pages in as needed.
    /// Writing through a read-only mapping is an illegal access.
    pub(crate) fn write_user(
        &mut self,
        pd: PdId,
        va: VirtAddr,
        data: &[u8],
    ) -> Result<(), VmError> {
        self.user_span_ok(va, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let cur = va + done as u32;
            let ofs = pg_ofs(cur);
            let n = (PGSIZE - ofs).min(data.len() - done);

            let slot = self.ensure_resident(pd, pg_round_down(cur))?;
            let pte = self.dirs.pte_mut(slot).unwrap();
            if !pte.is_writable() {
                return Err(VmError::BadUserAccess);
            }
            pte.set_accessed(true);
            pte.set_dirty(true);
            let pa = pte.frame_addr();
            self.pool.page_mut(pa)[ofs..ofs + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn user_span_ok(&self, va: VirtAddr, len: usize) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let end = (va as u64) + (len as u64);
        if end > USER_TOP as u64 {
            return Err(VmError::BadUserAccess);
        }
        Ok(())
    }
}
