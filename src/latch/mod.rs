use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: u64 = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
}

fn current_tag() -> u64 {
    THREAD_TAG.with(|tag| *tag)
}

/// A lock/unlock-by-convention mutex for frames. Unlike a guard-based
/// mutex it can be acquired in one function and released in another,
/// which the pinning protocol needs, and it remembers its holder so
/// callers can assert the discipline.
pub struct Latch {
    raw: RawMutex,
    holder: AtomicU64,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            holder: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) {
        self.raw.lock();
        self.holder.store(current_tag(), Ordering::Relaxed);
    }

    pub fn try_lock(&self) -> bool {
        if self.raw.try_lock() {
            self.holder.store(current_tag(), Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn unlock(&self) {
        assert!(
            self.held_by_current_thread(),
            "latch released by a thread that does not hold it"
        );
        self.holder.store(0, Ordering::Relaxed);
        unsafe { self.raw.unlock() };
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == current_tag()
    }

    #[allow(unused)]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}
