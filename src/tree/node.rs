use std::fmt::Write as _;
use std::marker::PhantomData;

use byteorder::{ByteOrder, LittleEndian};

use crate::errors::PageError;
use crate::storage::{PageId, INVALID_PAGE, PAGE_SIZE};
use crate::tree::cursor::PageCursor;

// Frame header layout, shared by both node kinds.
const HDR_NUM_SLOTS: usize = 0;
const HDR_FREE_PTR: usize = 2;
const HDR_FREE_SPACE: usize = 4;
const HDR_KIND: usize = 6;
const HDR_PID: usize = 8;
const HDR_NEXT: usize = 12;
const HDR_PREV: usize = 16;
pub(crate) const HEADER_SIZE: usize = 20;

/// Usable bytes of the data region: records grow up from its start, the
/// slot directory grows down from its end.
pub const DATA_SIZE: usize = PAGE_SIZE - HEADER_SIZE;

pub(crate) const SLOT_SIZE: usize = 4;
const EMPTY_SLOT: i16 = -1;

/// Maximum key length in bytes, including the NUL terminator.
pub const MAX_KEY_LENGTH: usize = 128;

/// Discriminates the two node kinds sharing the page format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Index,
    Leaf,
}

impl PageKind {
    fn as_i16(self) -> i16 {
        match self {
            PageKind::Index => 0,
            PageKind::Leaf => 1,
        }
    }

    fn from_i16(raw: i16) -> Result<Self, PageError> {
        match raw {
            0 => Ok(PageKind::Index),
            1 => Ok(PageKind::Leaf),
            other => Err(PageError::Corrupt(format!("unknown page kind {other}"))),
        }
    }
}

/// Reads the node kind out of a raw frame.
pub fn frame_kind(frame: &[u8]) -> Result<PageKind, PageError> {
    if frame.len() != PAGE_SIZE {
        return Err(PageError::Corrupt(format!("bad frame size {}", frame.len())));
    }
    PageKind::from_i16(LittleEndian::read_i16(&frame[HDR_KIND..]))
}

/// A fixed-width value stored alongside keys on a page. The width and the
/// page-kind discriminant travel with the type, so leaf pages (record ids)
/// and index pages (child pointers) share one page implementation.
pub trait NodeValue: Copy + PartialEq + std::fmt::Debug {
    const SIZE: usize;
    const KIND: PageKind;

    fn write_to(&self, buf: &mut [u8]);
    fn read_from(buf: &[u8]) -> Self;
}

/// Identifies a record in some data file: the page it lives on and its
/// slot within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId {
    pub page: PageId,
    pub slot: i32,
}

impl RecordId {
    pub fn new(page: PageId, slot: i32) -> Self {
        Self { page, slot }
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.page, self.slot)
    }
}

impl NodeValue for RecordId {
    const SIZE: usize = 8;
    const KIND: PageKind = PageKind::Leaf;

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.page);
        LittleEndian::write_i32(&mut buf[4..8], self.slot);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            page: LittleEndian::read_u32(&buf[0..4]),
            slot: LittleEndian::read_i32(&buf[4..8]),
        }
    }
}

impl NodeValue for PageId {
    const SIZE: usize = 4;
    const KIND: PageKind = PageKind::Index;

    fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], *self);
    }

    fn read_from(buf: &[u8]) -> Self {
        LittleEndian::read_u32(&buf[0..4])
    }
}

/// Outcome of a key lookup on one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    /// Exact match at this slot.
    Found(usize),
    /// No match; this slot holds the greatest key less than the argument.
    LessThan(usize),
    /// Every key on the page is greater, or the page is empty.
    BelowMin,
}

/// A sorted key-multivalue page: a typed view over one pinned frame.
///
/// Each record is `[key bytes, NUL, value0, value1, ...]` with fixed-width
/// values. Records are packed from the start of the data region upward and
/// addressed through a slot directory growing down from its end; slot
/// order is key order. Duplicate keys are merged into a single record with
/// the values appended, unordered.
#[derive(Debug)]
pub struct SortedPage<'a, V: NodeValue> {
    buf: &'a mut [u8],
    _values: PhantomData<V>,
}

impl<'a, V: NodeValue> SortedPage<'a, V> {
    /// Formats `buf` as a fresh, empty page: one empty sentinel slot and an
    /// untouched record area.
    pub fn init(buf: &'a mut [u8], pid: PageId) -> Result<Self, PageError> {
        if buf.len() != PAGE_SIZE {
            return Err(PageError::Corrupt(format!("bad frame size {}", buf.len())));
        }
        buf.fill(0);
        let mut page = Self {
            buf,
            _values: PhantomData,
        };
        page.set_i16(HDR_NUM_SLOTS, 1);
        page.set_i16(HDR_FREE_PTR, 0);
        page.set_i16(HDR_FREE_SPACE, (DATA_SIZE - SLOT_SIZE) as i16);
        page.set_i16(HDR_KIND, V::KIND.as_i16());
        page.set_u32(HDR_PID, pid);
        page.set_u32(HDR_NEXT, INVALID_PAGE);
        page.set_u32(HDR_PREV, INVALID_PAGE);
        page.set_slot(0, 0, EMPTY_SLOT);
        Ok(page)
    }

    /// Opens an existing frame, checking that it holds a page of this kind.
    pub fn open(buf: &'a mut [u8]) -> Result<Self, PageError> {
        let kind = frame_kind(buf)?;
        if kind != V::KIND {
            return Err(PageError::Corrupt(format!(
                "expected {:?} page, found {:?}",
                V::KIND,
                kind
            )));
        }
        let page = Self {
            buf,
            _values: PhantomData,
        };
        let num_slots = page.i16(HDR_NUM_SLOTS);
        let free_ptr = page.i16(HDR_FREE_PTR);
        let free_space = page.i16(HDR_FREE_SPACE);
        if num_slots < 1
            || free_ptr < 0
            || free_space < 0
            || free_ptr as usize + num_slots as usize * SLOT_SIZE + free_space as usize
                > DATA_SIZE
        {
            return Err(PageError::Corrupt(format!(
                "inconsistent header: slots={num_slots} free_ptr={free_ptr} free={free_space}"
            )));
        }
        Ok(page)
    }

    pub fn pid(&self) -> PageId {
        self.u32(HDR_PID)
    }

    pub fn next_page(&self) -> PageId {
        self.u32(HDR_NEXT)
    }

    pub fn set_next_page(&mut self, pid: PageId) {
        self.set_u32(HDR_NEXT, pid);
    }

    /// For leaves this is the left sibling; for index nodes it holds the
    /// leftmost child pointer.
    pub fn prev_page(&self) -> PageId {
        self.u32(HDR_PREV)
    }

    pub fn set_prev_page(&mut self, pid: PageId) {
        self.set_u32(HDR_PREV, pid);
    }

    pub fn free_space(&self) -> usize {
        self.i16(HDR_FREE_SPACE).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.i16(HDR_NUM_SLOTS) == 1 && self.slot_len_raw(0) == EMPTY_SLOT
    }

    /// Number of live records (distinct keys) on the page.
    pub fn record_count(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.i16(HDR_NUM_SLOTS) as usize
        }
    }

    /// The key stored at `slot`, without its terminator.
    pub fn key_at(&self, slot: usize) -> Result<&[u8], PageError> {
        let rec = self.record_bytes(slot)?;
        let nul = rec
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PageError::Corrupt("unterminated key".into()))?;
        Ok(&rec[..nul])
    }

    /// Number of values stored with the key at `slot`.
    pub fn value_count_at(&self, slot: usize) -> Result<usize, PageError> {
        let key_len = self.key_at(slot)?.len();
        let rec_len = self.record_bytes(slot)?.len();
        let val_bytes = rec_len - key_len - 1;
        if val_bytes % V::SIZE != 0 {
            return Err(PageError::Corrupt(format!(
                "record length {rec_len} does not divide into values"
            )));
        }
        Ok(val_bytes / V::SIZE)
    }

    pub fn value_at(&self, slot: usize, index: usize) -> Result<V, PageError> {
        if index >= self.value_count_at(slot)? {
            return Err(PageError::InvalidSlot(index as i32));
        }
        let key_len = self.key_at(slot)?.len();
        let rec = self.record_bytes(slot)?;
        let start = key_len + 1 + index * V::SIZE;
        Ok(V::read_from(&rec[start..start + V::SIZE]))
    }

    pub fn first_value_at(&self, slot: usize) -> Result<V, PageError> {
        self.value_at(slot, 0)
    }

    /// Locates `key`, or the greatest key below it.
    pub fn find_key(&self, key: &[u8]) -> Result<FindResult, PageError> {
        let n = self.record_count();
        if n == 0 || self.key_at(0)? > key {
            return Ok(FindResult::BelowMin);
        }
        for slot in 0..n {
            let k = self.key_at(slot)?;
            if k == key {
                return Ok(FindResult::Found(slot));
            }
            if k > key {
                return Ok(FindResult::LessThan(slot - 1));
            }
        }
        Ok(FindResult::LessThan(n - 1))
    }

    /// Whether one more value under `key` fits: appending to an existing
    /// record costs `V::SIZE` bytes, a new record costs the record plus a
    /// directory slot.
    pub fn has_space_for(&self, key: &[u8]) -> Result<bool, PageError> {
        Ok(match self.find_key(key)? {
            FindResult::Found(_) => self.free_space() >= V::SIZE,
            _ => self.free_space() >= key.len() + 1 + V::SIZE + SLOT_SIZE,
        })
    }

    /// Inserts one key/value pair, merging into an existing record when the
    /// key is already present.
    pub fn insert(&mut self, key: &[u8], value: V) -> Result<(), PageError> {
        if key.len() + 1 > MAX_KEY_LENGTH {
            return Err(PageError::KeyTooLong(key.len()));
        }
        match self.find_key(key)? {
            FindResult::Found(slot) => self.append_value(slot, value),
            FindResult::LessThan(slot) => self.insert_record(key, value, slot + 1),
            FindResult::BelowMin => self.insert_record(key, value, 0),
        }
    }

    /// Removes one value under `key`. A record holding a single value is
    /// removed whole.
    pub fn delete(&mut self, key: &[u8], value: V) -> Result<(), PageError> {
        let FindResult::Found(slot) = self.find_key(key)? else {
            return Err(PageError::NotFound);
        };
        let nvals = self.value_count_at(slot)?;
        if nvals == 1 {
            return self.delete_record_at(slot);
        }
        for index in 0..nvals {
            if self.value_at(slot, index)? == value {
                return self.cut_value_at(slot, index);
            }
        }
        Err(PageError::NotFound)
    }

    /// Removes a key and every value stored with it.
    pub fn delete_key(&mut self, key: &[u8]) -> Result<(), PageError> {
        let FindResult::Found(slot) = self.find_key(key)? else {
            return Err(PageError::NotFound);
        };
        self.delete_record_at(slot)
    }

    /// Resets the page to its freshly initialised, empty state.
    pub fn delete_all(&mut self) {
        self.set_i16(HDR_NUM_SLOTS, 1);
        self.set_i16(HDR_FREE_PTR, 0);
        self.set_i16(HDR_FREE_SPACE, (DATA_SIZE - SLOT_SIZE) as i16);
        self.set_slot(0, 0, EMPTY_SLOT);
    }

    pub fn min_key(&self) -> Result<Option<&[u8]>, PageError> {
        if self.record_count() == 0 {
            return Ok(None);
        }
        self.key_at(0).map(Some)
    }

    pub fn min_key_value(&self) -> Result<Option<(&[u8], V)>, PageError> {
        if self.record_count() == 0 {
            return Ok(None);
        }
        Ok(Some((self.key_at(0)?, self.first_value_at(0)?)))
    }

    pub fn max_key(&self) -> Result<Option<&[u8]>, PageError> {
        let n = self.record_count();
        if n == 0 {
            return Ok(None);
        }
        self.key_at(n - 1).map(Some)
    }

    /// The greatest key together with its last value.
    pub fn max_key_value(&self) -> Result<Option<(&[u8], V)>, PageError> {
        let n = self.record_count();
        if n == 0 {
            return Ok(None);
        }
        let last = self.value_count_at(n - 1)? - 1;
        Ok(Some((self.key_at(n - 1)?, self.value_at(n - 1, last)?)))
    }

    /// A cursor positioned before the first key.
    pub fn open_cursor(&self) -> PageCursor {
        PageCursor::start()
    }

    /// Positions `cursor` so the next read yields the exact match, or the
    /// first value of the greatest key at or below `key`, or the page start
    /// when every key is greater.
    pub fn search(&self, key: &[u8], cursor: &mut PageCursor) -> Result<FindResult, PageError> {
        let found = self.find_key(key)?;
        match found {
            FindResult::Found(slot) | FindResult::LessThan(slot) => cursor.seek_slot(slot),
            FindResult::BelowMin => cursor.seek_slot(0),
        }
        Ok(found)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool, PageError> {
        Ok(matches!(self.find_key(key)?, FindResult::Found(_)))
    }

    pub fn contains(&self, key: &[u8], value: V) -> Result<bool, PageError> {
        let FindResult::Found(slot) = self.find_key(key)? else {
            return Ok(false);
        };
        for index in 0..self.value_count_at(slot)? {
            if self.value_at(slot, index)? == value {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of values stored under `key`; zero when absent.
    pub fn value_count_for_key(&self, key: &[u8]) -> Result<usize, PageError> {
        match self.find_key(key)? {
            FindResult::Found(slot) => self.value_count_at(slot),
            _ => Ok(0),
        }
    }

    /// Raw bytes of the record at `slot` (key, terminator and values).
    pub fn record_bytes(&self, slot: usize) -> Result<&[u8], PageError> {
        if slot >= self.record_count() {
            return Err(PageError::InvalidSlot(slot as i32));
        }
        let off = self.slot_offset_raw(slot) as usize;
        let len = self.slot_len_raw(slot);
        if len < 0 {
            return Err(PageError::InvalidSlot(slot as i32));
        }
        let start = HEADER_SIZE + off;
        Ok(&self.buf[start..start + len as usize])
    }

    /// Appends a pre-built record after the current maximum key. The caller
    /// guarantees key order; page rebuilds during splits feed records back
    /// in slot order.
    pub(crate) fn append_record_raw(&mut self, rec: &[u8]) -> Result<(), PageError> {
        let needed = if self.is_empty() {
            rec.len()
        } else {
            rec.len() + SLOT_SIZE
        };
        if self.free_space() < needed {
            return Err(PageError::Full);
        }

        let free_ptr = self.i16(HDR_FREE_PTR) as usize;
        let start = HEADER_SIZE + free_ptr;
        self.buf[start..start + rec.len()].copy_from_slice(rec);

        if self.is_empty() {
            self.set_slot(0, free_ptr as i16, rec.len() as i16);
            self.set_i16(HDR_FREE_SPACE, (self.free_space() - rec.len()) as i16);
        } else {
            let n = self.i16(HDR_NUM_SLOTS);
            self.set_slot(n as usize, free_ptr as i16, rec.len() as i16);
            self.set_i16(HDR_NUM_SLOTS, n + 1);
            self.set_i16(
                HDR_FREE_SPACE,
                (self.free_space() - rec.len() - SLOT_SIZE) as i16,
            );
        }
        self.set_i16(HDR_FREE_PTR, (free_ptr + rec.len()) as i16);
        Ok(())
    }

    /// Removes the whole record at `slot`, compacting the record area and
    /// the slot directory.
    pub(crate) fn delete_record_at(&mut self, slot: usize) -> Result<(), PageError> {
        let n = self.record_count();
        if slot >= n {
            return Err(PageError::InvalidSlot(slot as i32));
        }
        let off = self.slot_offset_raw(slot) as usize;
        let len = self.slot_len_raw(slot) as usize;
        let free_ptr = self.i16(HDR_FREE_PTR) as usize;

        self.buf
            .copy_within(HEADER_SIZE + off + len..HEADER_SIZE + free_ptr, HEADER_SIZE + off);
        self.shift_offsets_above(off as i16, -(len as i16));
        self.set_i16(HDR_FREE_PTR, (free_ptr - len) as i16);

        if n == 1 {
            self.delete_all();
            return Ok(());
        }

        if slot + 1 < n {
            let src_start = PAGE_SIZE - n * SLOT_SIZE;
            let src_end = PAGE_SIZE - (slot + 1) * SLOT_SIZE;
            self.buf.copy_within(src_start..src_end, src_start + SLOT_SIZE);
        }
        self.set_i16(HDR_NUM_SLOTS, (n - 1) as i16);
        self.set_i16(
            HDR_FREE_SPACE,
            (self.free_space() + len + SLOT_SIZE) as i16,
        );
        Ok(())
    }

    /// Cuts the value at `index` out of the record at `slot`; the record is
    /// removed whole when it holds a single value.
    pub(crate) fn cut_value_at(&mut self, slot: usize, index: usize) -> Result<(), PageError> {
        let nvals = self.value_count_at(slot)?;
        if index >= nvals {
            return Err(PageError::InvalidSlot(index as i32));
        }
        if nvals == 1 {
            return self.delete_record_at(slot);
        }
        let key_len = self.key_at(slot)?.len();
        self.cut_from_record(slot, key_len + 1 + index * V::SIZE, V::SIZE)
    }

    fn cut_from_record(&mut self, slot: usize, rel: usize, cut: usize) -> Result<(), PageError> {
        let off = self.slot_offset_raw(slot) as usize;
        let len = self.slot_len_raw(slot) as usize;
        if rel + cut > len {
            return Err(PageError::Corrupt(format!(
                "cut of {cut} at {rel} exceeds record length {len}"
            )));
        }
        let free_ptr = self.i16(HDR_FREE_PTR) as usize;
        self.buf.copy_within(
            HEADER_SIZE + off + rel + cut..HEADER_SIZE + free_ptr,
            HEADER_SIZE + off + rel,
        );
        self.set_slot(slot, off as i16, (len - cut) as i16);
        self.shift_offsets_above(off as i16, -(cut as i16));
        self.set_i16(HDR_FREE_PTR, (free_ptr - cut) as i16);
        self.set_i16(HDR_FREE_SPACE, (self.free_space() + cut) as i16);
        Ok(())
    }

    fn append_value(&mut self, slot: usize, value: V) -> Result<(), PageError> {
        if self.free_space() < V::SIZE {
            return Err(PageError::Full);
        }
        let off = self.slot_offset_raw(slot) as usize;
        let len = self.slot_len_raw(slot) as usize;
        let end = off + len;
        let free_ptr = self.i16(HDR_FREE_PTR) as usize;

        // Shift everything after this record up to make room at its tail.
        self.buf.copy_within(
            HEADER_SIZE + end..HEADER_SIZE + free_ptr,
            HEADER_SIZE + end + V::SIZE,
        );
        value.write_to(&mut self.buf[HEADER_SIZE + end..HEADER_SIZE + end + V::SIZE]);
        self.set_slot(slot, off as i16, (len + V::SIZE) as i16);
        self.shift_offsets_above(off as i16, V::SIZE as i16);
        self.set_i16(HDR_FREE_PTR, (free_ptr + V::SIZE) as i16);
        self.set_i16(HDR_FREE_SPACE, (self.free_space() - V::SIZE) as i16);
        Ok(())
    }

    fn insert_record(&mut self, key: &[u8], value: V, pos: usize) -> Result<(), PageError> {
        let rec_len = key.len() + 1 + V::SIZE;
        let mut rec = vec![0u8; rec_len];
        rec[..key.len()].copy_from_slice(key);
        value.write_to(&mut rec[key.len() + 1..]);
        self.append_record_raw(&rec)?;

        // Rotate the freshly appended slot down into sorted position.
        let n = self.record_count();
        if pos + 1 < n {
            let new_off = self.slot_offset_raw(n - 1);
            let new_len = self.slot_len_raw(n - 1);
            let src_start = PAGE_SIZE - (n - 1) * SLOT_SIZE;
            let src_end = PAGE_SIZE - pos * SLOT_SIZE;
            self.buf
                .copy_within(src_start..src_end, src_start - SLOT_SIZE);
            self.set_slot(pos, new_off, new_len);
        }
        Ok(())
    }

    /// Adds `delta` to the offset of every slot whose record lies after the
    /// record starting at `off`.
    fn shift_offsets_above(&mut self, off: i16, delta: i16) {
        for slot in 0..self.record_count() {
            let cur = self.slot_offset_raw(slot);
            if cur > off {
                let len = self.slot_len_raw(slot);
                self.set_slot(slot, cur + delta, len);
            }
        }
    }

    /// One-line description plus the record table, for diagnostics.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "page {} kind={:?} records={} free={} prev={} next={}",
            self.pid(),
            V::KIND,
            self.record_count(),
            self.free_space(),
            fmt_pid(self.prev_page()),
            fmt_pid(self.next_page()),
        );
        for slot in 0..self.record_count() {
            let key = self.key_at(slot).unwrap_or(b"<corrupt>");
            let _ = write!(out, "\n  {}: {:?} [", slot, String::from_utf8_lossy(key));
            if let Ok(nvals) = self.value_count_at(slot) {
                for index in 0..nvals {
                    if index > 0 {
                        out.push(' ');
                    }
                    match self.value_at(slot, index) {
                        Ok(v) => {
                            let _ = write!(out, "{v:?}");
                        }
                        Err(_) => out.push('?'),
                    }
                }
            }
            out.push(']');
        }
        out
    }

    fn slot_base(slot: usize) -> usize {
        PAGE_SIZE - (slot + 1) * SLOT_SIZE
    }

    fn slot_offset_raw(&self, slot: usize) -> i16 {
        LittleEndian::read_i16(&self.buf[Self::slot_base(slot)..])
    }

    fn slot_len_raw(&self, slot: usize) -> i16 {
        LittleEndian::read_i16(&self.buf[Self::slot_base(slot) + 2..])
    }

    fn set_slot(&mut self, slot: usize, off: i16, len: i16) {
        let base = Self::slot_base(slot);
        LittleEndian::write_i16(&mut self.buf[base..], off);
        LittleEndian::write_i16(&mut self.buf[base + 2..], len);
    }

    fn i16(&self, at: usize) -> i16 {
        LittleEndian::read_i16(&self.buf[at..])
    }

    fn set_i16(&mut self, at: usize, v: i16) {
        LittleEndian::write_i16(&mut self.buf[at..], v);
    }

    fn u32(&self, at: usize) -> PageId {
        LittleEndian::read_u32(&self.buf[at..])
    }

    fn set_u32(&mut self, at: usize, v: PageId) {
        LittleEndian::write_u32(&mut self.buf[at..], v);
    }
}

fn fmt_pid(pid: PageId) -> String {
    if pid == INVALID_PAGE {
        "-".to_string()
    } else {
        pid.to_string()
    }
}
