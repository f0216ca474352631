use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use log::trace;

use crate::errors::StoreError;
use crate::storage::{PageId, INVALID_PAGE, PAGE_SIZE};

const MAGIC: [u8; 8] = *b"KVTREE01";
const VERSION: u16 = 1;

// Page 0 header layout: magic (8), version (2), num_pages (4), crc32 (4).
const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 8;
const HDR_NUM_PAGES: usize = 10;
const HDR_CRC: usize = 14;
const HEADER_SIZE: usize = 40;

/// Maximum length of a file entry name, in bytes.
pub const MAX_NAME: usize = 50;

// Directory region layout: next directory page id (4), then fixed-width
// entries of (start page id (4), name length (1), name bytes (MAX_NAME)).
// The first directory region is embedded in page 0 after the header;
// overflow directory pages use the whole page.
const ENTRY_SIZE: usize = 4 + 1 + MAX_NAME;
const DIR_NEXT: usize = 0;
const DIR_ENTRIES: usize = 4;

/// Default number of pages in a newly created store.
pub const DEFAULT_NUM_PAGES: u32 = 4096;

const BITS_PER_PAGE: u32 = (PAGE_SIZE * 8) as u32;

/// The paged store: a single file of `PAGE_SIZE` frames.
///
/// Page 0 carries the store header and the first directory of named file
/// entries; the following pages hold the space map, a bitmap with one bit
/// per page. Data pages come after the space map. The space map and the
/// directory are written through on every mutation.
#[derive(Debug)]
pub struct DiskManager {
    file: File,
    path: PathBuf,
    num_pages: u32,
    map_pages: u32,
    space_map: Vec<u8>,
}

impl DiskManager {
    pub fn create<P: AsRef<Path>>(path: P, num_pages: u32) -> Result<Self, StoreError> {
        let map_pages = num_pages.div_ceil(BITS_PER_PAGE);
        if num_pages < map_pages + 2 {
            return Err(StoreError::Corrupt(format!(
                "store too small: {num_pages} pages"
            )));
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        file.set_len(num_pages as u64 * PAGE_SIZE as u64)?;

        let mut mgr = Self {
            file,
            path: path.as_ref().to_path_buf(),
            num_pages,
            map_pages,
            space_map: vec![0u8; (map_pages as usize) * PAGE_SIZE],
        };

        // Page 0 and the space map pages are permanently allocated. Bits
        // past num_pages are set so they can never be handed out.
        for pid in 0..=map_pages {
            mgr.set_bit(pid, true);
        }
        for bit in num_pages..(map_pages * BITS_PER_PAGE) {
            mgr.set_bit(bit, true);
        }
        mgr.write_map_range(0, map_pages * BITS_PER_PAGE)?;

        let mut page0 = vec![0u8; PAGE_SIZE];
        page0[HDR_MAGIC..HDR_MAGIC + 8].copy_from_slice(&MAGIC);
        LittleEndian::write_u16(&mut page0[HDR_VERSION..], VERSION);
        LittleEndian::write_u32(&mut page0[HDR_NUM_PAGES..], num_pages);
        LittleEndian::write_u32(&mut page0[HDR_CRC..], header_crc(num_pages));
        init_dir_region(&mut page0[HEADER_SIZE..]);
        mgr.write_page_unchecked(0, &page0)?;
        mgr.file.sync_all()?;

        trace!("created store {:?}: {} pages", mgr.path, num_pages);
        Ok(mgr)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        let mut page0 = vec![0u8; PAGE_SIZE];
        read_at(&file, 0, &mut page0)?;
        if page0[HDR_MAGIC..HDR_MAGIC + 8] != MAGIC {
            return Err(StoreError::Corrupt("bad magic".into()));
        }
        let version = LittleEndian::read_u16(&page0[HDR_VERSION..]);
        if version != VERSION {
            return Err(StoreError::Corrupt(format!("unsupported version {version}")));
        }
        let num_pages = LittleEndian::read_u32(&page0[HDR_NUM_PAGES..]);
        if LittleEndian::read_u32(&page0[HDR_CRC..]) != header_crc(num_pages) {
            return Err(StoreError::Corrupt("header checksum mismatch".into()));
        }

        let map_pages = num_pages.div_ceil(BITS_PER_PAGE);
        let mut space_map = vec![0u8; (map_pages as usize) * PAGE_SIZE];
        read_at(&file, PAGE_SIZE as u64, &mut space_map)?;

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            num_pages,
            map_pages,
            space_map,
        })
    }

    pub fn open_or_create<P: AsRef<Path>>(path: P, num_pages: u32) -> Result<Self, StoreError> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path, num_pages)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_pages(&self) -> u32 {
        self.num_pages
    }

    /// First page id usable for data.
    pub fn first_data_page(&self) -> PageId {
        self.map_pages + 1
    }

    pub fn read_page(&mut self, pid: PageId, frame: &mut [u8]) -> Result<(), StoreError> {
        self.check_pid(pid)?;
        debug_assert_eq!(frame.len(), PAGE_SIZE);
        read_at(&self.file, pid as u64 * PAGE_SIZE as u64, frame)
    }

    pub fn write_page(&mut self, pid: PageId, frame: &[u8]) -> Result<(), StoreError> {
        self.check_pid(pid)?;
        self.write_page_unchecked(pid, frame)
    }

    fn write_page_unchecked(&mut self, pid: PageId, frame: &[u8]) -> Result<(), StoreError> {
        debug_assert_eq!(frame.len(), PAGE_SIZE);
        self.file.seek(SeekFrom::Start(pid as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(frame)?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn allocate_page(&mut self) -> Result<PageId, StoreError> {
        self.allocate_run(1)
    }

    /// First-fit allocation of `run_size` consecutive pages.
    pub fn allocate_run(&mut self, run_size: u32) -> Result<PageId, StoreError> {
        if run_size == 0 {
            return Err(StoreError::Corrupt("zero run size".into()));
        }
        let mut start = self.first_data_page();
        while start + run_size <= self.num_pages {
            match (start..start + run_size).find(|&p| self.bit(p)) {
                None => {
                    for p in start..start + run_size {
                        self.set_bit(p, true);
                    }
                    self.write_map_range(start, run_size)?;
                    trace!("allocated pages {}..{}", start, start + run_size);
                    return Ok(start);
                }
                Some(taken) => start = taken + 1,
            }
        }
        Err(StoreError::Full)
    }

    pub fn deallocate_page(&mut self, pid: PageId) -> Result<(), StoreError> {
        self.deallocate_run(pid, 1)
    }

    pub fn deallocate_run(&mut self, pid: PageId, run_size: u32) -> Result<(), StoreError> {
        for p in pid..pid + run_size {
            self.check_pid(p)?;
            if p <= self.map_pages || !self.bit(p) {
                return Err(StoreError::BadPage(p));
            }
        }
        for p in pid..pid + run_size {
            self.set_bit(p, false);
        }
        self.write_map_range(pid, run_size)?;
        trace!("deallocated pages {}..{}", pid, pid + run_size);
        Ok(())
    }

    pub fn is_allocated(&self, pid: PageId) -> bool {
        pid < self.num_pages && self.bit(pid)
    }

    /// Registers `name` as starting at `pid`.
    pub fn add_file_entry(&mut self, name: &str, pid: PageId) -> Result<(), StoreError> {
        if name.len() > MAX_NAME {
            return Err(StoreError::NameTooLong(name.len()));
        }
        if self.find_entry(name)?.is_some() {
            return Err(StoreError::DuplicateEntry(name.to_string()));
        }

        // Walk the directory chain looking for a free slot, extending the
        // chain if every page is full.
        let mut dir_pid: PageId = 0;
        loop {
            let mut frame = vec![0u8; PAGE_SIZE];
            self.read_page(dir_pid, &mut frame)?;
            let base = dir_base(dir_pid);
            for slot in 0..dir_capacity(dir_pid) {
                let off = base + DIR_ENTRIES + slot * ENTRY_SIZE;
                if LittleEndian::read_u32(&frame[off..]) == INVALID_PAGE {
                    write_entry(&mut frame[off..off + ENTRY_SIZE], name, pid);
                    self.write_page(dir_pid, &frame)?;
                    return Ok(());
                }
            }
            let next = LittleEndian::read_u32(&frame[base + DIR_NEXT..]);
            if next != INVALID_PAGE {
                dir_pid = next;
                continue;
            }
            let new_pid = self.allocate_page()?;
            let mut new_frame = vec![0u8; PAGE_SIZE];
            init_dir_region(&mut new_frame);
            write_entry(
                &mut new_frame[DIR_ENTRIES..DIR_ENTRIES + ENTRY_SIZE],
                name,
                pid,
            );
            self.write_page(new_pid, &new_frame)?;
            LittleEndian::write_u32(&mut frame[base + DIR_NEXT..], new_pid);
            self.write_page(dir_pid, &frame)?;
            return Ok(());
        }
    }

    pub fn get_file_entry(&mut self, name: &str) -> Result<Option<PageId>, StoreError> {
        Ok(self.find_entry(name)?.map(|(_, _, pid)| pid))
    }

    pub fn delete_file_entry(&mut self, name: &str) -> Result<(), StoreError> {
        let Some((dir_pid, off, _)) = self.find_entry(name)? else {
            return Err(StoreError::UnknownEntry(name.to_string()));
        };
        let mut frame = vec![0u8; PAGE_SIZE];
        self.read_page(dir_pid, &mut frame)?;
        frame[off..off + ENTRY_SIZE].fill(0);
        LittleEndian::write_u32(&mut frame[off..], INVALID_PAGE);
        self.write_page(dir_pid, &frame)?;
        Ok(())
    }

    fn find_entry(&mut self, name: &str) -> Result<Option<(PageId, usize, PageId)>, StoreError> {
        let mut dir_pid: PageId = 0;
        loop {
            let mut frame = vec![0u8; PAGE_SIZE];
            self.read_page(dir_pid, &mut frame)?;
            let base = dir_base(dir_pid);
            for slot in 0..dir_capacity(dir_pid) {
                let off = base + DIR_ENTRIES + slot * ENTRY_SIZE;
                let pid = LittleEndian::read_u32(&frame[off..]);
                if pid == INVALID_PAGE {
                    continue;
                }
                let len = frame[off + 4] as usize;
                if len <= MAX_NAME && &frame[off + 5..off + 5 + len] == name.as_bytes() {
                    return Ok(Some((dir_pid, off, pid)));
                }
            }
            let next = LittleEndian::read_u32(&frame[base + DIR_NEXT..]);
            if next == INVALID_PAGE {
                return Ok(None);
            }
            dir_pid = next;
        }
    }

    fn check_pid(&self, pid: PageId) -> Result<(), StoreError> {
        if pid >= self.num_pages {
            return Err(StoreError::BadPage(pid));
        }
        Ok(())
    }

    fn bit(&self, pid: u32) -> bool {
        self.space_map[(pid / 8) as usize] & (1 << (pid % 8)) != 0
    }

    fn set_bit(&mut self, pid: u32, on: bool) {
        let byte = &mut self.space_map[(pid / 8) as usize];
        if on {
            *byte |= 1 << (pid % 8);
        } else {
            *byte &= !(1 << (pid % 8));
        }
    }

    /// Writes back every space-map page covering bits `[start, start + n)`.
    fn write_map_range(&mut self, start: u32, n: u32) -> Result<(), StoreError> {
        let first = start / BITS_PER_PAGE;
        let last = (start + n - 1) / BITS_PER_PAGE;
        for map_page in first..=last {
            let from = (map_page as usize) * PAGE_SIZE;
            let frame: Vec<u8> = self.space_map[from..from + PAGE_SIZE].to_vec();
            self.write_page_unchecked(1 + map_page, &frame)?;
        }
        Ok(())
    }
}

fn header_crc(num_pages: u32) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&MAGIC);
    let mut buf = [0u8; 6];
    LittleEndian::write_u16(&mut buf[0..], VERSION);
    LittleEndian::write_u32(&mut buf[2..], num_pages);
    hasher.update(&buf);
    hasher.finalize()
}

fn dir_base(dir_pid: PageId) -> usize {
    if dir_pid == 0 {
        HEADER_SIZE
    } else {
        0
    }
}

fn dir_capacity(dir_pid: PageId) -> usize {
    (PAGE_SIZE - dir_base(dir_pid) - DIR_ENTRIES) / ENTRY_SIZE
}

fn init_dir_region(region: &mut [u8]) {
    LittleEndian::write_u32(&mut region[DIR_NEXT..], INVALID_PAGE);
    let capacity = region[DIR_ENTRIES..].len() / ENTRY_SIZE;
    for slot in 0..capacity {
        let off = DIR_ENTRIES + slot * ENTRY_SIZE;
        LittleEndian::write_u32(&mut region[off..], INVALID_PAGE);
    }
}

fn write_entry(entry: &mut [u8], name: &str, pid: PageId) {
    LittleEndian::write_u32(&mut entry[0..], pid);
    entry[4] = name.len() as u8;
    entry[5..5 + name.len()].copy_from_slice(name.as_bytes());
}

fn read_at(mut file: &File, offset: u64, buf: &mut [u8]) -> Result<(), StoreError> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(buf)?;
    Ok(())
}
