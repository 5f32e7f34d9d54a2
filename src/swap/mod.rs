mod bitmap;

use crate::block::BlockDevice;
use crate::printdbg;
use crate::vaddr::{PAGE_SECTORS, PAGE_SIZE, SECTOR_SIZE};
use anyhow::{anyhow, Result};
use bitmap::Bitmap;
use parking_lot::Mutex;

/// Allocates page-sized slots on the swap device. Slot `i` occupies
/// sectors `[i * PAGE_SECTORS, (i + 1) * PAGE_SECTORS)`. The bitmap is
/// the only shared state; sector traffic for a slot is gated by the
/// frame lock of the page that owns it.
pub struct SwapManager {
    device: Box<dyn BlockDevice>,
    bitmap: Mutex<Bitmap>,
}

impl SwapManager {
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() / PAGE_SECTORS;
        Self {
            device,
            bitmap: Mutex::new(Bitmap::new(slots)),
        }
    }

    /// Writes a page image out to a fresh slot and returns the slot.
    /// Fails when the device is full. Caller holds the frame lock of
    /// the page being evicted.
    pub(crate) fn swap_out(&self, data: &[u8]) -> Result<usize> {
        assert_eq!(data.len(), PAGE_SIZE);

        let slot = self
            .bitmap
            .lock()
            .scan_and_flip()
            .ok_or_else(|| anyhow!("swap device is full"))?;

        if let Err(err) = self.write_slot(slot, data) {
            self.bitmap.lock().reset(slot);
            return Err(err);
        }

        printdbg!("swapped a page out to slot {slot}");
        Ok(slot)
    }

    /// Reads a slot back into a page image and releases the slot.
    /// Caller holds the frame lock of the page being brought in; only
    /// that lock gates re-use of the slot, so the bitmap update does
    /// not need to be atomic with the read.
    pub(crate) fn swap_in(&self, slot: usize, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), PAGE_SIZE);
        assert!(self.bitmap.lock().test(slot), "swapping in a free slot");

        for i in 0..PAGE_SECTORS {
            self.device.read(
                slot * PAGE_SECTORS + i,
                &mut data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            )?;
        }

        self.bitmap.lock().reset(slot);
        printdbg!("swapped a page in from slot {slot}");
        Ok(())
    }

    /// Returns an unread slot to the bitmap. Used when the page that
    /// owned it is destroyed while paged out.
    pub(crate) fn release(&self, slot: usize) {
        self.bitmap.lock().reset(slot);
    }

    pub fn slots_in_use(&self) -> usize {
        self.bitmap.lock().count()
    }

    fn write_slot(&self, slot: usize, data: &[u8]) -> Result<()> {
        for i in 0..PAGE_SECTORS {
            self.device.write(
                slot * PAGE_SECTORS + i,
                &data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE],
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlockDevice;
    use crate::fs::test_path;
    use rand::Rng;

    fn test_swap(slots: usize) -> Result<(SwapManager, String)> {
        let path = test_path();
        let device = FileBlockDevice::create(&format!("{path}swap.disk"), slots * PAGE_SECTORS)?;
        Ok((SwapManager::new(Box::new(device)), path))
    }

    #[test]
    fn test_out_then_in_restores_image() -> Result<()> {
        let (swap, path) = test_swap(4)?;

        let mut image = vec![0u8; PAGE_SIZE];
        rand::thread_rng().fill(&mut image[..]);

        let slot = swap.swap_out(&image)?;
        assert_eq!(swap.slots_in_use(), 1);

        let mut back = vec![0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut back)?;
        assert_eq!(image, back);
        assert_eq!(swap.slots_in_use(), 0);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    #[test]
    fn test_exhaustion_and_release() -> Result<()> {
        let (swap, path) = test_swap(2)?;

        let image = vec![0u8; PAGE_SIZE];
        let first = swap.swap_out(&image)?;
        swap.swap_out(&image)?;
        assert!(swap.swap_out(&image).is_err());

        swap.release(first);
        assert_eq!(swap.swap_out(&image)?, first);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}
