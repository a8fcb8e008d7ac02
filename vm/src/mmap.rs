//! Memory-mapped files
//!
//! `mmap` installs one lazy page per file page, backed directly by the
//! file's sectors, and takes an extra reference on the inode so the
//! backing store outlives the file descriptor. `munmap` walks the
//! whole mapping, flushing dirty pages back to the file as each PTE is
//! torn down, then drops both inode references: the one taken here and
//! the one the original open held.
//!
//! The mapping id is the base virtual address of the mapping.

use crate::addr::{is_page_aligned, VirtAddr, PGSIZE, SECTORS_PER_PAGE, USER_TOP};
use crate::filesys::InodeId;
use crate::frame::FrameFlags;
use crate::pte::{PdId, PteSlot};
use crate::{VmError, VmState};

/// Identifier of an active mapping; the mapping's base address.
pub type MapId = VirtAddr;

/// One active file mapping.
pub(crate) struct Mapping {
    pub(crate) pd: PdId,
    pub(crate) base: VirtAddr,
    pub(crate) length: usize,
    pub(crate) inode: InodeId,
}

impl VmState {
    /// Open FD on INODE in address space PD. Descriptors 0 and 1 are
    /// the console and are never handed out.
    pub(crate) fn open_fd(&mut self, pd: PdId, inode: InodeId) -> i32 {
        let table = self.fd_tables.entry(pd).or_default();
        let fd = 2 + table.len() as i32;
        table.push((fd, inode));
        fd
    }

    fn resolve_fd(&self, pd: PdId, fd: i32) -> Option<InodeId> {
        self.fd_tables
            .get(&pd)?
            .iter()
            .find(|(n, _)| *n == fd)
            .map(|(_, inode)| *inode)
    }

    /// Map the file behind FD at ADDR. Returns the mapping id.
    pub(crate) fn mmap(&mut self, pd: PdId, fd: i32, addr: VirtAddr) -> Result<MapId, VmError> {
        // Console descriptors cannot be mapped, page zero is never
        // mapped, and the base must be page-aligned.
        if fd == 0 || fd == 1 {
            return Err(VmError::MapBadArg);
        }
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::MapBadArg);
        }
        let inode = self.resolve_fd(pd, fd).ok_or(VmError::MapBadArg)?;

        let flength = self.fs.length(inode);
        if flength == 0 {
            return Err(VmError::MapBadArg);
        }
        if addr as u64 + flength as u64 > USER_TOP as u64 {
            return Err(VmError::MapBadArg);
        }

        // Every target page must be free before anything is installed.
        let dir = self.dirs.dir(pd).ok_or(VmError::MapBadArg)?;
        let mut page = addr;
        while (page as u64) < addr as u64 + flength as u64 {
            if let Some(pte) = dir.lookup(page) {
                if pte.is_user() {
                    return Err(VmError::MapConflict);
                }
            }
            page += PGSIZE as u32;
        }

        let writable = self.fs.writable(inode);
        let base_sector = self.fs.byte_to_sector(inode, 0);

        let mut offset = 0usize;
        while offset < flength {
            let read_bytes = (flength - offset).min(PGSIZE);
            self.install(
                pd,
                addr + offset as u32,
                0,
                writable,
                FrameFlags::MMAP | FrameFlags::SWAP,
                base_sector + (offset / PGSIZE) as u32 * SECTORS_PER_PAGE,
                read_bytes,
            )?;
            offset += PGSIZE;
        }

        // Keep the backing store alive even if the file is removed
        // while mapped.
        self.fs.reopen(inode);
        self.mappings.push(Mapping {
            pd,
            base: addr,
            length: flength,
            inode,
        });
        log::debug!("mmap: {flength} bytes at {addr:#x} in pd {}", pd.0);
        Ok(addr)
    }

    /// Unmap MAPPING, flushing dirty pages back to the file.
    pub(crate) fn munmap(&mut self, pd: PdId, mapping: MapId) -> Result<(), VmError> {
        let idx = self
            .mappings
            .iter()
            .position(|m| m.pd == pd && m.base == mapping)
            .ok_or(VmError::MapBadArg)?;
        let m = self.mappings.remove(idx);

        let mut offset = 0usize;
        while offset < m.length {
            self.pte_destroy(PteSlot::of(pd, m.base + offset as u32))?;
            offset += PGSIZE;
        }

        // Once for the reference mmap took, once for the original
        // open.
        self.fs.close(m.inode);
        self.fs.close(m.inode);
        Ok(())
    }
}
