use std::collections::HashMap;

use log::trace;

use crate::errors::BufferError;
use crate::storage::disk::DiskManager;
use crate::storage::{PageId, PAGE_SIZE};

/// Default number of frames in the pool.
pub const DEFAULT_POOL_SIZE: usize = 50;

/// A pinned page: a private copy of the frame bytes plus the pin itself.
///
/// The pin is released by handing the page back to
/// [`BufferManager::unpin`]; passing `dirty = true` copies the payload back
/// into the frame. Dropping a `PinnedPage` without unpinning leaks the pin,
/// so the owner must route every exit path through `unpin`.
#[derive(Debug)]
pub struct PinnedPage {
    pid: PageId,
    data: Vec<u8>,
}

impl PinnedPage {
    pub fn page_id(&self) -> PageId {
        self.pid
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug)]
struct Frame {
    pid: PageId,
    data: Vec<u8>,
    dirty: bool,
    pin_count: u32,
    referenced: bool,
}

/// Pin/unpin statistics: total pin calls and how many missed the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub pins: u64,
    pub misses: u64,
}

/// A fixed pool of page frames over the disk manager.
///
/// Pages are pinned into frames and unpinned with a dirty flag; dirty
/// frames are written back on eviction or flush. Replacement is the clock
/// policy: each pin sets a reference bit, and the hand evicts the first
/// unpinned frame whose bit is already clear, clearing bits as it sweeps.
#[derive(Debug)]
pub struct BufferManager {
    disk: DiskManager,
    frames: Vec<Option<Frame>>,
    page_table: HashMap<PageId, usize>,
    hand: usize,
    stats: BufferStats,
}

impl BufferManager {
    pub fn new(disk: DiskManager, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one frame");
        Self {
            disk,
            frames: (0..capacity).map(|_| None).collect(),
            page_table: HashMap::new(),
            hand: 0,
            stats: BufferStats::default(),
        }
    }

    pub fn disk_mut(&mut self) -> &mut DiskManager {
        &mut self.disk
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Number of distinct pages currently held by at least one pin.
    pub fn pinned_pages(&self) -> usize {
        self.frames
            .iter()
            .flatten()
            .filter(|f| f.pin_count > 0)
            .count()
    }

    /// Pins `pid`, reading it from disk if it is not resident.
    pub fn pin(&mut self, pid: PageId) -> Result<PinnedPage, BufferError> {
        self.stats.pins += 1;
        if let Some(&idx) = self.page_table.get(&pid) {
            let frame = self.frames[idx].as_mut().expect("mapped frame");
            frame.pin_count += 1;
            frame.referenced = true;
            return Ok(PinnedPage {
                pid,
                data: frame.data.clone(),
            });
        }

        self.stats.misses += 1;
        let idx = self.take_frame()?;
        let mut data = vec![0u8; PAGE_SIZE];
        if let Err(e) = self.disk.read_page(pid, &mut data) {
            return Err(e.into());
        }
        self.install(idx, pid, data.clone(), false);
        Ok(PinnedPage { pid, data })
    }

    /// Releases one pin. With `dirty`, the payload replaces the frame
    /// contents and the frame is marked for write-back.
    pub fn unpin(&mut self, page: PinnedPage, dirty: bool) -> Result<(), BufferError> {
        let PinnedPage { pid, data } = page;
        let &idx = self
            .page_table
            .get(&pid)
            .ok_or(BufferError::NotResident(pid))?;
        let frame = self.frames[idx].as_mut().expect("mapped frame");
        if frame.pin_count == 0 {
            return Err(BufferError::PinUnderflow(pid));
        }
        if dirty {
            frame.data = data;
            frame.dirty = true;
        }
        frame.pin_count -= 1;
        Ok(())
    }

    /// Allocates a fresh page and returns it pinned and zeroed.
    pub fn new_page(&mut self) -> Result<PinnedPage, BufferError> {
        let pid = self.disk.allocate_page()?;
        let idx = match self.take_frame() {
            Ok(idx) => idx,
            Err(e) => {
                // Give the page back rather than leak it.
                let _ = self.disk.deallocate_page(pid);
                return Err(e);
            }
        };
        self.stats.pins += 1;
        let data = vec![0u8; PAGE_SIZE];
        self.install(idx, pid, data.clone(), true);
        Ok(PinnedPage { pid, data })
    }

    /// Returns `pid` to the free space map. The page must be unpinned.
    pub fn free_page(&mut self, pid: PageId) -> Result<(), BufferError> {
        if let Some(&idx) = self.page_table.get(&pid) {
            let frame = self.frames[idx].as_ref().expect("mapped frame");
            if frame.pin_count > 0 {
                return Err(BufferError::StillPinned(pid));
            }
            self.frames[idx] = None;
            self.page_table.remove(&pid);
        }
        self.disk.deallocate_page(pid)?;
        Ok(())
    }

    pub fn flush_page(&mut self, pid: PageId) -> Result<(), BufferError> {
        let &idx = self
            .page_table
            .get(&pid)
            .ok_or(BufferError::NotResident(pid))?;
        let frame = self.frames[idx].as_mut().expect("mapped frame");
        if frame.dirty {
            self.disk.write_page(frame.pid, &frame.data)?;
            frame.dirty = false;
        }
        Ok(())
    }

    /// Writes back every dirty frame and syncs the underlying file.
    pub fn flush_all(&mut self) -> Result<(), BufferError> {
        for frame in self.frames.iter_mut().flatten() {
            if frame.dirty {
                self.disk.write_page(frame.pid, &frame.data)?;
                frame.dirty = false;
            }
        }
        self.disk.sync()?;
        Ok(())
    }

    fn install(&mut self, idx: usize, pid: PageId, data: Vec<u8>, dirty: bool) {
        self.frames[idx] = Some(Frame {
            pid,
            data,
            dirty,
            pin_count: 1,
            referenced: true,
        });
        self.page_table.insert(pid, idx);
    }

    /// Finds a frame to load into, evicting with the clock policy if the
    /// pool is full.
    fn take_frame(&mut self) -> Result<usize, BufferError> {
        if let Some(idx) = self.frames.iter().position(Option::is_none) {
            return Ok(idx);
        }

        // Two sweeps: the first clears reference bits, the second is
        // guaranteed to find any unpinned frame.
        for _ in 0..2 * self.frames.len() {
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.frames.len();
            let frame = self.frames[idx].as_mut().expect("full pool");
            if frame.pin_count > 0 {
                continue;
            }
            if frame.referenced {
                frame.referenced = false;
                continue;
            }
            if frame.dirty {
                self.disk.write_page(frame.pid, &frame.data)?;
            }
            trace!("evicting page {}", frame.pid);
            let old = self.frames[idx].take().expect("full pool");
            self.page_table.remove(&old.pid);
            return Ok(idx);
        }
        Err(BufferError::PoolExhausted)
    }
}
