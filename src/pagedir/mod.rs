use crate::frame_table::FrameId;
use crate::vaddr::VirtAddr;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Pte {
    frame: FrameId,
    present: bool,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// The architectural page directory of one process, modelled as a map
/// from page-aligned user address to a software PTE. Clearing a
/// mapping only drops the present bit; the accessed and dirty bits
/// stay readable, which the eviction path depends on.
#[derive(Debug, Default)]
pub(crate) struct PageDir {
    entries: Mutex<HashMap<VirtAddr, Pte>>,
}

impl PageDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a mapping from `vaddr` to `frame`. A fresh mapping
    /// starts with clear accessed and dirty bits.
    pub fn set_page(&self, vaddr: VirtAddr, frame: FrameId, writable: bool) {
        self.entries.lock().insert(
            vaddr,
            Pte {
                frame,
                present: true,
                writable,
                accessed: false,
                dirty: false,
            },
        );
    }

    /// Marks `vaddr` not present, forcing later accesses to fault.
    pub fn clear_page(&self, vaddr: VirtAddr) {
        if let Some(pte) = self.entries.lock().get_mut(&vaddr) {
            pte.present = false;
        }
    }

    pub fn get_page(&self, vaddr: VirtAddr) -> Option<FrameId> {
        let entries = self.entries.lock();
        let pte = entries.get(&vaddr)?;
        pte.present.then_some(pte.frame)
    }

    #[allow(unused)]
    pub fn is_writable(&self, vaddr: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .is_some_and(|pte| pte.present && pte.writable)
    }

    pub fn is_accessed(&self, vaddr: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .is_some_and(|pte| pte.accessed)
    }

    pub fn set_accessed(&self, vaddr: VirtAddr, accessed: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&vaddr) {
            pte.accessed = accessed;
        }
    }

    pub fn is_dirty(&self, vaddr: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&vaddr)
            .is_some_and(|pte| pte.dirty)
    }

    pub fn set_dirty(&self, vaddr: VirtAddr, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&vaddr) {
            pte.dirty = dirty;
        }
    }
}
