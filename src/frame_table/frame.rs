use crate::latch::Latch;
use crate::page_table::Page;
use crate::vaddr::PAGE_SIZE;
use std::cell::UnsafeCell;
use std::sync::Arc;

use super::FrameId;

/// One physical page of user memory. The binding and the contents are
/// only touchable while the latch is held, which every accessor
/// asserts.
pub struct Frame {
    id: FrameId,
    latch: Latch,
    page: UnsafeCell<Option<Arc<Page>>>,
    data: UnsafeCell<Box<[u8]>>,
}

// The latch serialises every access to the cells.
unsafe impl Sync for Frame {}

impl Frame {
    pub(super) fn new(id: FrameId) -> Self {
        Self {
            id,
            latch: Latch::new(),
            page: UnsafeCell::new(None),
            data: UnsafeCell::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn lock(&self) {
        self.latch.lock();
    }

    pub fn try_lock(&self) -> bool {
        self.latch.try_lock()
    }

    /// Releases the frame without unbinding it, allowing eviction.
    pub fn unlock(&self) {
        self.latch.unlock();
    }

    /// Unbinds the frame for use by another page and releases it. Any
    /// data in the frame is lost.
    pub fn free(&self) {
        self.set_page(None);
        self.latch.unlock();
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.latch.held_by_current_thread()
    }

    pub(crate) fn page(&self) -> Option<Arc<Page>> {
        assert!(self.latch.held_by_current_thread());
        unsafe { (*self.page.get()).clone() }
    }

    pub(crate) fn set_page(&self, page: Option<Arc<Page>>) {
        assert!(self.latch.held_by_current_thread());
        unsafe { *self.page.get() = page };
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        assert!(self.latch.held_by_current_thread());
        f(unsafe { &mut *self.data.get() })
    }

    pub(crate) fn copy_to(&self, ofs: usize, dst: &mut [u8]) {
        self.with_data(|data| dst.copy_from_slice(&data[ofs..ofs + dst.len()]));
    }

    pub(crate) fn copy_from(&self, ofs: usize, src: &[u8]) {
        self.with_data(|data| data[ofs..ofs + src.len()].copy_from_slice(src));
    }
}
