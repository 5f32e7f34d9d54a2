use crate::frame_table::{ArcFrameManager, Frame, FrameId, FrameManager};
use crate::fs::DiskFile;
use crate::pagedir::PageDir;
use crate::printdbg;
use crate::swap::SwapManager;
use crate::vaddr::{self, VirtAddr, PAGE_SIZE, PHYS_BASE, STACK_MAX};
use anyhow::{anyhow, bail, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// Faults within this many bytes below the stack pointer grow the
/// stack; it covers the widest push the architecture can issue.
const STACK_SLOP: usize = 32;

/// Where a page's contents live when it is not resident. A resident
/// page keeps its `File` backing so eviction can route by it; `Swap`
/// and `Zero` describe non-resident contents only.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Materialises as an all-zero page.
    Zero,
    /// `bytes` bytes at `offset` in `file`; the tail of the page is
    /// zero-filled. Dirty private pages evict to swap so the file is
    /// never written; shared pages write back to the file.
    File {
        file: Arc<DiskFile>,
        offset: u64,
        bytes: usize,
        private: bool,
    },
    /// Paged out to the given swap slot.
    Swap { slot: usize },
}

#[derive(Debug)]
pub struct PageState {
    pub(crate) frame: Option<FrameId>,
    pub(crate) backing: Backing,
}

/// One user virtual page of one process. The descriptor is shared with
/// the frame table while resident; the frame lock serialises every
/// state transition, and the inner mutex is a leaf that is never held
/// across I/O or another lock.
pub struct Page {
    addr: VirtAddr,
    read_only: bool,
    pagedir: Arc<PageDir>,
    state: Mutex<PageState>,
}

impl Page {
    pub(crate) fn new(addr: VirtAddr, read_only: bool, pagedir: Arc<PageDir>) -> Self {
        Self {
            addr,
            read_only,
            pagedir,
            state: Mutex::new(PageState {
                frame: None,
                backing: Backing::Zero,
            }),
        }
    }

    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn frame_id(&self) -> Option<FrameId> {
        self.state.lock().frame
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }

    /// Retargets a zero-fill page at a file extent. Only valid before
    /// the page is ever materialised.
    pub(crate) fn set_file_backing(
        &self,
        file: Arc<DiskFile>,
        offset: u64,
        bytes: usize,
        private: bool,
    ) {
        assert!(bytes <= PAGE_SIZE);
        let mut state = self.state.lock();
        assert!(state.frame.is_none(), "page already materialised");
        state.backing = Backing::File {
            file,
            offset,
            bytes,
            private,
        };
    }

    /// Reports and clears the architectural accessed bit. Caller holds
    /// the page's frame lock.
    pub(crate) fn accessed_recently(&self) -> bool {
        let was_accessed = self.pagedir.is_accessed(self.addr);
        if was_accessed {
            self.pagedir.set_accessed(self.addr, false);
        }
        was_accessed
    }
}

/// Evicts `page` from `frame`. Caller holds the frame's latch.
///
/// The mapping is cleared before the dirty bit is read; reading first
/// would let the process dirty the page between the read and the
/// unmap, losing the write.
pub(crate) fn page_out(page: &Arc<Page>, frame: &Frame, swap: &SwapManager) -> Result<()> {
    assert!(frame.held_by_current_thread());
    assert_eq!(page.frame_id(), Some(frame.id()));

    page.pagedir.clear_page(page.addr);
    let dirty = page.pagedir.is_dirty(page.addr);

    let backing = page.state().backing.clone();
    match backing {
        Backing::File {
            file,
            offset,
            bytes,
            private,
        } => {
            if dirty && private {
                // a dirty private mapping must not reach the file
                let slot = frame.with_data(|data| swap.swap_out(data))?;
                page.state().backing = Backing::Swap { slot };
            } else if dirty {
                frame.with_data(|data| file.write_at(&data[..bytes], offset))?;
            }
            // a clean file page is discarded, the file copy is
            // authoritative
        }
        Backing::Zero => {
            let slot = frame.with_data(|data| swap.swap_out(data))?;
            page.state().backing = Backing::Swap { slot };
        }
        Backing::Swap { .. } => unreachable!("resident page cannot be swap backed"),
    }

    page.state().frame = None;
    Ok(())
}

/// Materialises `page` into a freshly allocated frame. On success the
/// frame is bound both ways and its latch is held by the caller.
pub(crate) fn do_page_in(page: &Arc<Page>, fm: &FrameManager) -> Result<()> {
    let id = fm.alloc_and_lock(page)?;
    let frame = fm.frame(id);

    let backing = page.state().backing.clone();
    let populated = populate(page, frame, fm, backing);
    if let Err(err) = populated {
        frame.free();
        return Err(err);
    }

    page.state().frame = Some(id);
    Ok(())
}

fn populate(page: &Arc<Page>, frame: &Frame, fm: &FrameManager, backing: Backing) -> Result<()> {
    match backing {
        Backing::Swap { slot } => {
            frame.with_data(|data| fm.swap().swap_in(slot, data))?;
            // the swapped copy was authoritative and is now gone
            page.state().backing = Backing::Zero;
        }
        Backing::File {
            file,
            offset,
            bytes,
            ..
        } => {
            let read = frame.with_data(|data| -> Result<usize> {
                let read = file.read_at(&mut data[..bytes], offset)?;
                data[read..].fill(0);
                Ok(read)
            })?;
            if read != bytes {
                eprintln!("bytes read ({read}) != bytes requested ({bytes})");
            }
        }
        Backing::Zero => {
            frame.with_data(|data| data.fill(0));
        }
    }
    Ok(())
}

/// The supplemental page table of one process: a hash keyed by
/// page-aligned user address carrying the backing-store descriptor for
/// every addressable page.
pub struct PageTable {
    fm: ArcFrameManager,
    pagedir: Arc<PageDir>,
    pages: HashMap<VirtAddr, Arc<Page>>,
    user_esp: Option<VirtAddr>,
}

impl PageTable {
    pub fn new(fm: ArcFrameManager) -> Self {
        Self {
            fm,
            pagedir: Arc::new(PageDir::new()),
            pages: HashMap::new(),
            user_esp: None,
        }
    }

    pub(crate) fn pagedir(&self) -> &Arc<PageDir> {
        &self.pagedir
    }

    /// Records the user stack pointer at the moment of the fault; the
    /// growth heuristic consults it.
    pub fn set_user_stack_pointer(&mut self, esp: VirtAddr) {
        self.user_esp = Some(esp);
    }

    /// Adds a zero-fill mapping for the page containing `vaddr`.
    /// Returns `None` if the address is already mapped.
    pub fn allocate(&mut self, vaddr: VirtAddr, read_only: bool) -> Option<Arc<Page>> {
        let addr = vaddr::round_down(vaddr);
        if self.pages.contains_key(&addr) {
            return None;
        }

        let page = Arc::new(Page::new(addr, read_only, self.pagedir.clone()));
        self.pages.insert(addr, page.clone());
        Some(page)
    }

    pub fn get(&self, vaddr: VirtAddr) -> Option<Arc<Page>> {
        self.pages.get(&vaddr::round_down(vaddr)).cloned()
    }

    /// Returns the page containing `addr`, allocating a stack page if
    /// the address is a plausible stack access: above the stack floor
    /// and at most [`STACK_SLOP`] bytes below the stack pointer.
    pub fn for_addr(&mut self, addr: VirtAddr) -> Option<Arc<Page>> {
        if !vaddr::is_user_vaddr(addr) {
            return None;
        }

        let key = vaddr::round_down(addr);
        if let Some(page) = self.pages.get(&key) {
            return Some(page.clone());
        }

        let esp = self.user_esp?;
        if key > PHYS_BASE - STACK_MAX && addr + STACK_SLOP >= esp {
            return self.allocate(addr, false);
        }

        None
    }

    /// Services a fault at `fault_addr`: resolves the page, brings it
    /// into a frame if needed, and installs the architectural mapping.
    /// An error means the fault cannot be served and the process
    /// should be terminated.
    pub fn page_in(&mut self, fault_addr: VirtAddr) -> Result<()> {
        let page = self
            .for_addr(fault_addr)
            .ok_or_else(|| anyhow!("fault at unmapped address {fault_addr:#x}"))?;

        self.fm.lock_frame(&page);
        if page.frame_id().is_none() {
            do_page_in(&page, &self.fm)?;
        }

        let id = page.frame_id().expect("paged-in page has a frame");
        let frame = self.fm.frame(id);
        assert!(frame.held_by_current_thread());

        self.pagedir.set_page(page.addr(), id, !page.read_only());
        frame.unlock();
        Ok(())
    }

    /// Pins the page containing `addr` into memory: on success its
    /// frame latch is held by the caller and the page cannot be
    /// evicted until [`Self::unpin`]. The kernel wraps dereferences of
    /// user buffers in a pin/unpin pair.
    pub fn pin(&mut self, addr: VirtAddr, will_write: bool) -> Result<()> {
        let page = self
            .for_addr(addr)
            .ok_or_else(|| anyhow!("pin of unmapped address {addr:#x}"))?;
        if page.read_only() && will_write {
            bail!("write to read-only page {:#x}", page.addr());
        }

        self.fm.lock_frame(&page);
        if page.frame_id().is_none() {
            do_page_in(&page, &self.fm)?;
        }

        let id = page.frame_id().expect("pinned page has a frame");
        if self.pagedir.get_page(page.addr()).is_none() {
            self.pagedir.set_page(page.addr(), id, !page.read_only());
        }
        Ok(())
    }

    pub fn unpin(&mut self, addr: VirtAddr) {
        let page = self.get(addr).expect("unpinning unmapped address");
        let id = page.frame_id().expect("unpinning page with no frame");
        self.fm.frame(id).unlock();
    }

    /// Drops the page containing `vaddr`, writing a resident shared
    /// file page back first so mapped-file contents survive the unmap.
    pub fn deallocate(&mut self, vaddr: VirtAddr) {
        let addr = vaddr::round_down(vaddr);
        let page = self
            .pages
            .remove(&addr)
            .expect("deallocating unmapped address");

        self.fm.lock_frame(&page);
        if let Some(id) = page.frame_id() {
            let frame = self.fm.frame(id);
            let shared_file = matches!(
                page.state().backing,
                Backing::File { private: false, .. }
            );
            if shared_file && page_out(&page, frame, self.fm.swap()).is_err() {
                printdbg!("write-back of page {addr:#x} failed on unmap");
            }
            frame.free();
        } else if let Backing::Swap { slot } = page.state().backing {
            self.fm.swap().release(slot);
        }

        self.pagedir.clear_page(addr);
    }

    /// Destroys every descriptor in the table, freeing held frames and
    /// swap slots. Contents are not written back; mappings must be
    /// torn down before this runs.
    pub fn exit(&mut self) {
        for (_, page) in self.pages.drain() {
            self.fm.lock_frame(&page);
            if let Some(id) = page.frame_id() {
                self.fm.frame(id).free();
            } else if let Backing::Swap { slot } = page.state().backing {
                self.fm.swap().release(slot);
            }
        }
    }
}
