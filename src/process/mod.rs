use crate::frame_table::ArcFrameManager;
use crate::fs::{DiskFile, FileSystem};
use crate::page_table::PageTable;
use crate::vaddr::{self, VirtAddr, PAGE_SIZE};
use anyhow::{anyhow, bail, ensure, Result};
use std::collections::HashMap;
use std::mem::take;
use std::sync::Arc;

/// Binds a mapping handle to a region of memory and a reopened file.
struct Mapping {
    handle: usize,
    base: VirtAddr,
    page_cnt: usize,
}

/// One user process as the memory core sees it: a supplemental page
/// table, an fd table, and the list of active file mappings.
pub struct Process {
    fm: ArcFrameManager,
    fs: Arc<FileSystem>,
    pt: PageTable,
    files: HashMap<usize, Arc<DiskFile>>,
    mappings: Vec<Mapping>,
    next_fd: usize,
    next_handle: usize,
}

impl Process {
    pub fn new(fm: ArcFrameManager, fs: Arc<FileSystem>) -> Self {
        Self {
            pt: PageTable::new(fm.clone()),
            fm,
            fs,
            files: HashMap::new(),
            mappings: Vec::new(),
            next_fd: 2,
            next_handle: 0,
        }
    }

    pub fn page_table(&mut self) -> &mut PageTable {
        &mut self.pt
    }

    pub fn set_user_stack_pointer(&mut self, esp: VirtAddr) {
        self.pt.set_user_stack_pointer(esp);
    }

    pub fn open(&mut self, name: &str) -> Result<usize> {
        let file = self.fs.open(name)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.files.insert(fd, Arc::new(file));
        Ok(fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<()> {
        self.files
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| anyhow!("close of unknown fd {fd}"))
    }

    /// Installs one segment of the executable: `read_bytes` from the
    /// file starting at `file_offset`, then `zero_bytes` of zeros,
    /// starting at page-aligned `vaddr`. Writable segments are private
    /// mappings, so their dirty pages go to swap and never reach the
    /// executable on disk.
    pub fn install_segment(
        &mut self,
        fd: usize,
        file_offset: u64,
        vaddr: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        read_only: bool,
    ) -> Result<()> {
        ensure!(vaddr::page_ofs(vaddr) == 0, "segment must be page aligned");
        ensure!(
            (read_bytes + zero_bytes) % PAGE_SIZE == 0,
            "segment must cover whole pages"
        );

        let file = self.files.get(&fd).ok_or_else(|| anyhow!("bad fd {fd}"))?;
        let file = Arc::new(file.reopen()?);

        let mut addr = vaddr;
        let mut offset = file_offset;
        let mut remaining = read_bytes;
        let mut pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        while pages > 0 {
            let page_bytes = remaining.min(PAGE_SIZE);
            let page = self
                .pt
                .allocate(addr, read_only)
                .ok_or_else(|| anyhow!("segment collides with a mapping at {addr:#x}"))?;
            if page_bytes > 0 {
                page.set_file_backing(file.clone(), offset, page_bytes, !read_only);
            }

            addr += PAGE_SIZE;
            offset += page_bytes as u64;
            remaining -= page_bytes;
            pages -= 1;
        }
        Ok(())
    }

    /// Maps the file open on `fd` at page-aligned `addr` and returns
    /// the mapping handle. A collision with an existing page unwinds
    /// whatever was installed.
    pub fn mmap(&mut self, fd: usize, addr: VirtAddr) -> Result<usize> {
        ensure!(
            addr != 0 && vaddr::page_ofs(addr) == 0,
            "mapping address must be nonzero and page aligned"
        );

        let file = self.files.get(&fd).ok_or_else(|| anyhow!("bad fd {fd}"))?;
        let file = Arc::new(file.reopen()?);
        let length = file.length()?;

        let handle = self.next_handle;
        self.next_handle += 1;
        let mut mapping = Mapping {
            handle,
            base: addr,
            page_cnt: 0,
        };

        let mut offset = 0u64;
        let mut remaining = length as usize;
        while remaining > 0 {
            let bytes = remaining.min(PAGE_SIZE);
            match self.pt.allocate(addr + offset as usize, false) {
                Some(page) => page.set_file_backing(file.clone(), offset, bytes, false),
                None => {
                    self.unmap(mapping);
                    bail!("mapping collides with an existing page at {addr:#x}");
                }
            }

            mapping.page_cnt += 1;
            offset += bytes as u64;
            remaining -= bytes;
        }

        self.mappings.push(mapping);
        Ok(handle)
    }

    /// Removes the mapping for `handle`, writing dirty pages back to
    /// the file. An unknown handle is a contract violation that must
    /// terminate the process.
    pub fn munmap(&mut self, handle: usize) -> Result<()> {
        let idx = self
            .mappings
            .iter()
            .position(|m| m.handle == handle)
            .ok_or_else(|| anyhow!("munmap of unknown mapping {handle}"))?;

        let mapping = self.mappings.remove(idx);
        self.unmap(mapping);
        Ok(())
    }

    /// Deallocation routes each dirty shared page back to the file at
    /// its own offset and length; non-dirty pages leave the file
    /// untouched.
    fn unmap(&mut self, mapping: Mapping) {
        for i in 0..mapping.page_cnt {
            self.pt.deallocate(mapping.base + i * PAGE_SIZE);
        }
    }

    /// Copies user memory at `addr` into `buf`, faulting pages in as
    /// needed. Each touched page is pinned for the duration of its
    /// copy so eviction cannot pull it out from under the kernel.
    pub fn read_user(&mut self, addr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let cur = addr + pos;
            let ofs = vaddr::page_ofs(cur);
            let chunk = (PAGE_SIZE - ofs).min(buf.len() - pos);

            self.pt.pin(cur, false)?;
            let page = self.pt.get(cur).expect("pinned page is mapped");
            let id = page.frame_id().expect("pinned page is resident");
            self.fm.frame(id).copy_to(ofs, &mut buf[pos..pos + chunk]);
            self.pt.pagedir().set_accessed(page.addr(), true);
            self.pt.unpin(cur);

            pos += chunk;
        }
        Ok(())
    }

    /// Copies `buf` into user memory at `addr`. Marks the touched
    /// pages accessed and dirty the way the hardware would.
    pub fn write_user(&mut self, addr: VirtAddr, buf: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let cur = addr + pos;
            let ofs = vaddr::page_ofs(cur);
            let chunk = (PAGE_SIZE - ofs).min(buf.len() - pos);

            self.pt.pin(cur, true)?;
            let page = self.pt.get(cur).expect("pinned page is mapped");
            let id = page.frame_id().expect("pinned page is resident");
            self.fm.frame(id).copy_from(ofs, &buf[pos..pos + chunk]);
            self.pt.pagedir().set_accessed(page.addr(), true);
            self.pt.pagedir().set_dirty(page.addr(), true);
            self.pt.unpin(cur);

            pos += chunk;
        }
        Ok(())
    }

    /// Tears the process down: closes every descriptor, unmaps every
    /// mapping (writing dirty pages back), then destroys the page
    /// table.
    pub fn exit(&mut self) {
        self.files.clear();
        for mapping in take(&mut self.mappings) {
            self.unmap(mapping);
        }
        self.pt.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::FileBlockDevice;
    use crate::frame_table::FrameManager;
    use crate::fs::test_path;
    use crate::page_table::Backing;
    use crate::swap::SwapManager;
    use crate::vaddr::{PAGE_SECTORS, PHYS_BASE};
    use rand::Rng;

    const V: VirtAddr = 0x1000_0000;

    struct TestEnv {
        fm: ArcFrameManager,
        fs: Arc<FileSystem>,
        path: String,
    }

    impl TestEnv {
        fn new(frame_cnt: usize, slots: usize) -> Result<Self> {
            let path = test_path();
            let device =
                FileBlockDevice::create(&format!("{path}swap.disk"), slots * PAGE_SECTORS)?;
            let swap = Arc::new(SwapManager::new(Box::new(device)));
            Ok(Self {
                fm: Arc::new(FrameManager::new(frame_cnt, swap)),
                fs: Arc::new(FileSystem::new(&format!("{path}fs"))?),
                path,
            })
        }

        fn process(&self) -> Process {
            Process::new(self.fm.clone(), self.fs.clone())
        }
    }

    impl Drop for TestEnv {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn page_image() -> Vec<u8> {
        let mut image = vec![0u8; PAGE_SIZE];
        rand::thread_rng().fill(&mut image[..]);
        image
    }

    #[test]
    fn test_cold_fault_zero_fill() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        let mut proc = env.process();
        proc.page_table().allocate(V, false).unwrap();

        let mut byte = [0xFFu8];
        proc.read_user(V + 100, &mut byte)?;
        assert_eq!(byte[0], 0);

        proc.write_user(V + 100, &[0x5A])?;
        proc.read_user(V + 100, &mut byte)?;
        assert_eq!(byte[0], 0x5A);

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_eviction_round_trip() -> Result<()> {
        let env = TestEnv::new(2, 8)?;
        let mut proc = env.process();
        let (a, b, c) = (V, V + PAGE_SIZE, V + 2 * PAGE_SIZE);
        for addr in [a, b, c] {
            proc.page_table().allocate(addr, false).unwrap();
        }

        let a_image = page_image();
        let b_image = page_image();
        let c_image = page_image();
        proc.write_user(a, &a_image)?;
        proc.write_user(b, &b_image)?;
        proc.write_user(c, &c_image)?;

        // two frames, three pages: exactly one page is out on swap
        assert_eq!(env.fm.swap().slots_in_use(), 1);

        let mut back = vec![0u8; PAGE_SIZE];
        proc.read_user(a, &mut back)?;
        assert_eq!(back, a_image);
        assert!(proc.page_table().get(a).unwrap().frame_id().is_some());

        proc.read_user(b, &mut back)?;
        assert_eq!(back, b_image);
        proc.read_user(c, &mut back)?;
        assert_eq!(back, c_image);

        proc.exit();
        assert_eq!(env.fm.swap().slots_in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_dirty_mapping_writes_back_on_munmap() -> Result<()> {
        let env = TestEnv::new(4, 4)?;
        let contents: Vec<u8> = (0..100u8).collect();
        env.fs.create("m.txt", &contents)?;

        let mut proc = env.process();
        let fd = proc.open("m.txt")?;
        let handle = proc.mmap(fd, V)?;

        proc.write_user(V + 50, &[0xAA])?;
        proc.munmap(handle)?;

        let file = env.fs.open("m.txt")?;
        assert_eq!(file.length()?, 100);
        let mut back = vec![0u8; 100];
        file.read_at(&mut back, 0)?;

        let mut expected = contents;
        expected[50] = 0xAA;
        assert_eq!(back, expected);

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_clean_mapping_is_discarded() -> Result<()> {
        let env = TestEnv::new(2, 8)?;
        let image = page_image();
        env.fs.create("r.bin", &image)?;

        let mut proc = env.process();
        let fd = proc.open("r.bin")?;
        proc.mmap(fd, V)?;

        let mut byte = [0u8];
        proc.read_user(V, &mut byte)?;
        assert_eq!(byte[0], image[0]);

        // force the clean file page out by touching two anonymous pages
        let (x, y) = (V + 0x10_0000, V + 0x10_1000);
        proc.page_table().allocate(x, false).unwrap();
        proc.page_table().allocate(y, false).unwrap();
        proc.write_user(x, &[1])?;
        proc.write_user(y, &[2])?;

        let page = proc.page_table().get(V).unwrap();
        assert!(page.frame_id().is_none());
        assert!(matches!(page.state().backing, Backing::File { .. }));
        assert_eq!(env.fm.swap().slots_in_use(), 0);

        // a refault reads the file again
        proc.read_user(V + 1, &mut byte)?;
        assert_eq!(byte[0], image[1]);

        let file = env.fs.open("r.bin")?;
        let mut back = vec![0u8; PAGE_SIZE];
        file.read_at(&mut back, 0)?;
        assert_eq!(back, image);

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_mapping_tail_is_zero_filled() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        env.fs.create("tail.txt", b"abc")?;

        let mut proc = env.process();
        let fd = proc.open("tail.txt")?;
        proc.mmap(fd, V)?;

        let mut buf = [0xFFu8; 8];
        proc.read_user(V, &mut buf)?;
        assert_eq!(&buf, b"abc\0\0\0\0\0");

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_mmap_rejects_bad_addresses() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        env.fs.create("f.txt", b"x")?;

        let mut proc = env.process();
        let fd = proc.open("f.txt")?;
        assert!(proc.mmap(fd, 0).is_err());
        assert!(proc.mmap(fd, V + 1).is_err());
        assert!(proc.mmap(99, V).is_err());

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_mmap_collision_unwinds() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        let mut proc = env.process();
        env.fs.create("big.bin", &vec![7u8; 3 * PAGE_SIZE])?;

        // the second page of the mapping is already taken
        proc.page_table().allocate(V + PAGE_SIZE, false).unwrap();

        let fd = proc.open("big.bin")?;
        assert!(proc.mmap(fd, V).is_err());

        // the partial install was unwound, the old page survived
        assert!(proc.page_table().get(V).is_none());
        assert!(proc.page_table().get(V + PAGE_SIZE).is_some());
        assert!(proc.page_table().get(V + 2 * PAGE_SIZE).is_none());

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_munmap_unknown_handle_fails() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        let mut proc = env.process();
        assert!(proc.munmap(42).is_err());
        proc.exit();
        Ok(())
    }

    #[test]
    fn test_close_is_benign() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        env.fs.create("f.txt", b"x")?;

        let mut proc = env.process();
        let fd = proc.open("f.txt")?;
        proc.close(fd)?;
        assert!(proc.close(fd).is_err());
        assert!(proc.close(99).is_err());

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_mapping_survives_fd_close() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        env.fs.create("f.txt", b"persistent")?;

        let mut proc = env.process();
        let fd = proc.open("f.txt")?;
        let handle = proc.mmap(fd, V)?;
        proc.close(fd)?;

        let mut buf = [0u8; 10];
        proc.read_user(V, &mut buf)?;
        assert_eq!(&buf, b"persistent");

        proc.munmap(handle)?;
        proc.exit();
        Ok(())
    }

    #[test]
    fn test_stack_growth_via_fault() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        let esp = PHYS_BASE - 4 * PAGE_SIZE;

        let mut proc = env.process();
        proc.set_user_stack_pointer(esp);
        proc.write_user(esp - 32, &[9])?;

        let mut byte = [0u8];
        proc.read_user(esp - 32, &mut byte)?;
        assert_eq!(byte[0], 9);
        proc.exit();

        // one byte beyond the slop kills the access
        let mut proc = env.process();
        proc.set_user_stack_pointer(esp);
        assert!(proc.write_user(esp - 33, &[9]).is_err());
        proc.exit();
        Ok(())
    }

    #[test]
    fn test_segment_dirty_pages_stay_private() -> Result<()> {
        let env = TestEnv::new(2, 8)?;
        let image: Vec<u8> = (0..PAGE_SIZE).map(|i| i as u8).collect();
        env.fs.create("prog", &image)?;

        let mut proc = env.process();
        let fd = proc.open("prog")?;
        proc.install_segment(fd, 0, V, PAGE_SIZE, PAGE_SIZE, false)?;

        // data page loads from the file, bss page is zero
        let mut byte = [0u8];
        proc.read_user(V + 5, &mut byte)?;
        assert_eq!(byte[0], image[5]);
        proc.read_user(V + PAGE_SIZE + 5, &mut byte)?;
        assert_eq!(byte[0], 0);

        proc.write_user(V, &[0xEE])?;

        // force the dirty segment page out
        let (x, y) = (V + 0x10_0000, V + 0x10_1000);
        proc.page_table().allocate(x, false).unwrap();
        proc.page_table().allocate(y, false).unwrap();
        proc.write_user(x, &[1])?;
        proc.write_user(y, &[2])?;

        let page = proc.page_table().get(V).unwrap();
        assert!(page.frame_id().is_none());
        assert!(matches!(page.state().backing, Backing::Swap { .. }));

        // the executable on disk is untouched
        let file = env.fs.open("prog")?;
        let mut back = vec![0u8; PAGE_SIZE];
        file.read_at(&mut back, 0)?;
        assert_eq!(back, image);

        // and the modification survives the round trip
        proc.read_user(V, &mut byte)?;
        assert_eq!(byte[0], 0xEE);

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_read_only_segment_pages() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        env.fs.create("code", &vec![0x90u8; PAGE_SIZE])?;

        let mut proc = env.process();
        let fd = proc.open("code")?;
        proc.install_segment(fd, 0, V, PAGE_SIZE, 0, true)?;

        let mut byte = [0u8];
        proc.read_user(V, &mut byte)?;
        assert_eq!(byte[0], 0x90);
        assert!(proc.write_user(V, &[0]).is_err());

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_exit_writes_mappings_back() -> Result<()> {
        let env = TestEnv::new(2, 4)?;
        env.fs.create("m.txt", &[0u8; 64])?;

        let mut proc = env.process();
        let fd = proc.open("m.txt")?;
        proc.mmap(fd, V)?;
        proc.write_user(V + 10, &[0xBB])?;

        proc.exit();

        let file = env.fs.open("m.txt")?;
        let mut back = vec![0u8; 64];
        file.read_at(&mut back, 0)?;
        assert_eq!(back[10], 0xBB);
        assert_eq!(env.fm.swap().slots_in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_cross_buffer_copy_spans_pages() -> Result<()> {
        let env = TestEnv::new(4, 4)?;
        let mut proc = env.process();
        proc.page_table().allocate(V, false).unwrap();
        proc.page_table().allocate(V + PAGE_SIZE, false).unwrap();

        let data: Vec<u8> = (0..64u8).collect();
        proc.write_user(V + PAGE_SIZE - 32, &data)?;

        let mut back = vec![0u8; 64];
        proc.read_user(V + PAGE_SIZE - 32, &mut back)?;
        assert_eq!(back, data);

        proc.exit();
        Ok(())
    }

    #[test]
    fn test_processes_contend_for_frames() -> Result<()> {
        let env = TestEnv::new(4, 64)?;

        let worker = |seed: u8| -> Result<Vec<u8>> {
            let mut proc = env.process();
            let base = V + (seed as usize) * 0x100_0000;
            let image: Vec<u8> = (0..PAGE_SIZE).map(|i| (i as u8).wrapping_add(seed)).collect();

            for i in 0..3 {
                proc.page_table().allocate(base + i * PAGE_SIZE, false).unwrap();
            }
            for _ in 0..16 {
                for i in 0..3 {
                    proc.write_user(base + i * PAGE_SIZE, &image)?;
                }
            }

            let mut back = vec![0u8; PAGE_SIZE];
            proc.read_user(base + PAGE_SIZE, &mut back)?;
            proc.exit();
            Ok(back)
        };

        let (first, second) = std::thread::scope(|s| {
            let one = s.spawn(|| worker(1));
            let two = s.spawn(|| worker(2));
            (one.join().unwrap(), two.join().unwrap())
        });

        let image1: Vec<u8> = (0..PAGE_SIZE).map(|i| (i as u8).wrapping_add(1)).collect();
        let image2: Vec<u8> = (0..PAGE_SIZE).map(|i| (i as u8).wrapping_add(2)).collect();
        assert_eq!(first?, image1);
        assert_eq!(second?, image2);
        assert_eq!(env.fm.swap().slots_in_use(), 0);
        Ok(())
    }
}
