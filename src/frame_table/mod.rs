mod frame;

use crate::page_table::{page_out, Page};
use crate::swap::SwapManager;
use crate::{get_caller_name, printdbg};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub use frame::Frame;

pub type FrameId = usize;
pub type ArcFrameManager = Arc<FrameManager>;

const ALLOC_RETRIES: usize = 3;
const ALLOC_BACKOFF: Duration = Duration::from_secs(1);

/// The global frame table: a fixed array of physical frames plus the
/// clock state. Victim selection is serialised by the scan lock, which
/// also guards the hand and is never held across eviction I/O.
pub struct FrameManager {
    frames: Box<[Frame]>,
    hand: Mutex<usize>,
    swap: Arc<SwapManager>,
}

impl FrameManager {
    pub fn new(frame_cnt: usize, swap: Arc<SwapManager>) -> Self {
        let frames = (0..frame_cnt).map(Frame::new).collect::<Vec<_>>();

        Self {
            frames: frames.into_boxed_slice(),
            hand: Mutex::new(0),
            swap,
        }
    }

    pub fn frame(&self, id: FrameId) -> &Frame {
        &self.frames[id]
    }

    pub fn frame_cnt(&self) -> usize {
        self.frames.len()
    }

    pub fn swap(&self) -> &SwapManager {
        &self.swap
    }

    /// Tries really hard to allocate and lock a frame for `page`. On
    /// return the frame is bound to `page` and its latch is held by
    /// the caller; `page.frame` is still the caller's to set.
    pub(crate) fn alloc_and_lock(&self, page: &Arc<Page>) -> Result<FrameId> {
        for _try in 0..ALLOC_RETRIES {
            if let Some(id) = self.try_alloc_and_lock(page) {
                assert!(self.frames[id].held_by_current_thread());
                printdbg!(
                    "{} got frame {id} for page {:#x}",
                    get_caller_name!(),
                    page.addr()
                );
                return Ok(id);
            }
            std::thread::sleep(ALLOC_BACKOFF);
        }

        bail!("no frame available for page {:#x}", page.addr());
    }

    fn try_alloc_and_lock(&self, page: &Arc<Page>) -> Option<FrameId> {
        let mut hand = self.hand.lock();

        // Pass one: look for a frame that is outright free.
        for f in self.frames.iter() {
            if !f.try_lock() {
                continue;
            }
            if f.page().is_none() {
                f.set_page(Some(page.clone()));
                return Some(f.id());
            }
            f.unlock();
        }

        // Pass two: the clock. Two sweeps guarantee every accessed bit
        // cleared by the first sweep is seen again by the second.
        for _ in 0..self.frames.len() * 2 {
            let f = &self.frames[*hand];
            *hand += 1;
            if *hand >= self.frames.len() {
                *hand = 0;
            }

            if !f.try_lock() {
                continue;
            }

            if f.page().is_none() {
                f.set_page(Some(page.clone()));
                return Some(f.id());
            }

            let victim = f.page().expect("occupied frame has a page");
            if victim.accessed_recently() {
                f.unlock();
                continue;
            }

            // Eviction does I/O; let other allocators scan meanwhile.
            drop(hand);

            return match page_out(&victim, f, &self.swap) {
                Ok(()) => {
                    f.set_page(Some(page.clone()));
                    Some(f.id())
                }
                Err(err) => {
                    printdbg!("eviction of page {:#x} failed: {err}", victim.addr());
                    f.unlock();
                    None
                }
            };
        }

        None
    }

    /// Locks `page`'s frame into memory, if it has one. Frames are
    /// unbound asynchronously by eviction but only ever bound by their
    /// owner, so a stale read can only mean the frame went away. Upon
    /// return `page.frame` is stable until the caller unlocks.
    pub(crate) fn lock_frame(&self, page: &Page) {
        let Some(id) = page.frame_id() else {
            return;
        };

        let f = &self.frames[id];
        f.lock();
        if page.frame_id() != Some(id) {
            f.unlock();
            assert!(page.frame_id().is_none());
        }
    }
}
