use std::fmt::Write as _;
use std::path::Path;

use log::{debug, trace};

use crate::errors::{PageError, TreeError};
use crate::storage::buffer::{BufferManager, PinnedPage, DEFAULT_POOL_SIZE};
use crate::storage::disk::{DiskManager, DEFAULT_NUM_PAGES};
use crate::storage::{PageId, INVALID_PAGE};
use crate::tree::header::HeaderPage;
use crate::tree::node::{
    frame_kind, FindResult, NodeValue, PageKind, RecordId, SortedPage, MAX_KEY_LENGTH,
};
use crate::tree::scan::TreeScan;

pub mod cursor;
pub mod header;
pub mod node;
pub mod scan;

#[cfg(test)]
mod tests;

/// Result of a recursive insert below some page: either the subtree
/// absorbed the pair, or it split and the parent must add a separator for
/// the new right sibling.
#[derive(Debug)]
enum InsertOutcome {
    Clean,
    Split { key: Vec<u8>, right: PageId },
}

/// A disk-backed B+-tree mapping string keys to record ids.
///
/// Keys are byte strings of up to `MAX_KEY_LENGTH - 1` bytes; a key may be
/// inserted many times, with the duplicate record ids kept unordered.
/// Leaves form a doubly-linked chain in key order, which range scans walk.
///
/// The tree lives in a named file entry of the paged store; its header
/// page, naming the current root, stays pinned for the tree's lifetime.
#[derive(Debug)]
pub struct BTree {
    buf: BufferManager,
    name: String,
    header_pid: PageId,
    header_pin: Option<PinnedPage>,
}

impl BTree {
    /// Opens the index `name` inside the store at `path`, creating the
    /// store, the file entry and the header page as needed.
    pub fn open<P: AsRef<Path>>(path: P, name: &str) -> Result<Self, TreeError> {
        let disk = DiskManager::open_or_create(path, DEFAULT_NUM_PAGES)?;
        let mut buf = BufferManager::new(disk, DEFAULT_POOL_SIZE);

        let header_pid = match buf.disk_mut().get_file_entry(name)? {
            Some(pid) => pid,
            None => {
                let mut page = buf.new_page()?;
                let pid = page.page_id();
                HeaderPage::init(page.data_mut());
                buf.unpin(page, true)?;
                buf.disk_mut().add_file_entry(name, pid)?;
                debug!("created index {name:?} with header page {pid}");
                pid
            }
        };

        let header_pin = buf.pin(header_pid)?;
        Ok(Self {
            buf,
            name: name.to_string(),
            header_pid,
            header_pin: Some(header_pin),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the header pin and writes everything back.
    pub fn close(mut self) -> Result<(), TreeError> {
        if let Some(pin) = self.header_pin.take() {
            self.buf.unpin(pin, false)?;
        }
        self.buf.flush_all()?;
        Ok(())
    }

    /// Frees every page of the tree and removes its file entry. Reopening
    /// the same name afterwards yields an empty index.
    pub fn destroy(mut self) -> Result<(), TreeError> {
        let root = self.root()?;
        if root != INVALID_PAGE {
            self.free_subtree(root)?;
            self.buf.free_page(root)?;
        }
        if let Some(pin) = self.header_pin.take() {
            self.buf.unpin(pin, false)?;
        }
        self.buf.free_page(self.header_pid)?;
        self.buf.disk_mut().delete_file_entry(&self.name)?;
        self.buf.flush_all()?;
        debug!("destroyed index {:?}", self.name);
        Ok(())
    }

    /// Inserts one key → record id pair. Duplicate keys and duplicate full
    /// pairs are both allowed.
    pub fn insert(&mut self, key: &[u8], rid: RecordId) -> Result<(), TreeError> {
        validate_key(key)?;
        let root = self.root()?;

        if root == INVALID_PAGE {
            let mut page = self.buf.new_page()?;
            let pid = page.page_id();
            let seeded = SortedPage::<RecordId>::init(page.data_mut(), pid)
                .and_then(|mut leaf| leaf.insert(key, rid));
            match seeded {
                Ok(()) => {
                    self.buf.unpin(page, true)?;
                    self.set_root(pid)?;
                    debug!("created root leaf {pid}");
                    Ok(())
                }
                Err(e) => {
                    let _ = self.buf.unpin(page, false);
                    Err(e.into())
                }
            }
        } else {
            match self.insert_at(root, key, rid)? {
                InsertOutcome::Clean => Ok(()),
                InsertOutcome::Split { key: sep, right } => self.grow_root(root, &sep, right),
            }
        }
    }

    /// Opens a range scan over `[low, high]`; either bound may be absent.
    pub fn open_scan(
        &mut self,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<TreeScan<'_>, TreeError> {
        TreeScan::open(self, low, high)
    }

    /// Renders the whole tree, pre-order, for diagnostics.
    pub fn dump(&mut self) -> Result<String, TreeError> {
        let root = self.root()?;
        let mut out = String::new();
        if root == INVALID_PAGE {
            out.push_str("<empty tree>");
        } else {
            self.dump_page(root, 0, &mut out)?;
        }
        Ok(out)
    }

    pub(crate) fn root(&mut self) -> Result<PageId, TreeError> {
        let mut page = self.buf.pin(self.header_pid)?;
        let root = HeaderPage::open(page.data_mut()).root();
        self.buf.unpin(page, false)?;
        Ok(root)
    }

    fn set_root(&mut self, pid: PageId) -> Result<(), TreeError> {
        let mut page = self.buf.pin(self.header_pid)?;
        HeaderPage::open(page.data_mut()).set_root(pid);
        self.buf.unpin(page, true)?;
        Ok(())
    }

    pub(crate) fn buffer(&mut self) -> &mut BufferManager {
        &mut self.buf
    }

    /// The first leaf in key order, found by following leftmost-child
    /// pointers down from the root.
    pub(crate) fn leftmost_leaf(&mut self) -> Result<PageId, TreeError> {
        let mut pid = self.root()?;
        while pid != INVALID_PAGE {
            let mut page = self.buf.pin(pid)?;
            let step = frame_kind(page.data()).and_then(|kind| match kind {
                PageKind::Leaf => Ok(None),
                PageKind::Index => {
                    SortedPage::<PageId>::open(page.data_mut()).map(|idx| Some(idx.prev_page()))
                }
            });
            match step {
                Ok(None) => {
                    self.buf.unpin(page, false)?;
                    return Ok(pid);
                }
                Ok(Some(child)) => {
                    self.buf.unpin(page, false)?;
                    pid = child;
                }
                Err(e) => {
                    let _ = self.buf.unpin(page, false);
                    return Err(e.into());
                }
            }
        }
        Ok(INVALID_PAGE)
    }

    fn insert_at(&mut self, pid: PageId, key: &[u8], rid: RecordId) -> Result<InsertOutcome, TreeError> {
        let mut page = self.buf.pin(pid)?;
        match self.insert_in_page(&mut page, key, rid) {
            Ok((outcome, dirty)) => {
                self.buf.unpin(page, dirty)?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = self.buf.unpin(page, false);
                Err(e)
            }
        }
    }

    fn insert_in_page(
        &mut self,
        page: &mut PinnedPage,
        key: &[u8],
        rid: RecordId,
    ) -> Result<(InsertOutcome, bool), TreeError> {
        match frame_kind(page.data())? {
            PageKind::Leaf => {
                let mut leaf = SortedPage::<RecordId>::open(page.data_mut())?;
                if leaf.has_space_for(key)? {
                    leaf.insert(key, rid)?;
                    Ok((InsertOutcome::Clean, true))
                } else {
                    let outcome = self.split_leaf(page, key, rid)?;
                    Ok((outcome, true))
                }
            }
            PageKind::Index => {
                let child = {
                    let idx = SortedPage::<PageId>::open(page.data_mut())?;
                    route_to_child(&idx, key)?
                };
                match self.insert_at(child, key, rid)? {
                    InsertOutcome::Clean => Ok((InsertOutcome::Clean, false)),
                    InsertOutcome::Split { key: sep, right } => {
                        let mut idx = SortedPage::<PageId>::open(page.data_mut())?;
                        if idx.has_space_for(&sep)? {
                            idx.insert(&sep, right)?;
                            Ok((InsertOutcome::Clean, true))
                        } else {
                            let outcome = self.split_index(page, &sep, right)?;
                            Ok((outcome, true))
                        }
                    }
                }
            }
        }
    }

    /// Splits a full leaf: the new right sibling takes the upper part of
    /// the entries, the chain is respliced around it, and the right page's
    /// minimum key is promoted.
    fn split_leaf(
        &mut self,
        page: &mut PinnedPage,
        key: &[u8],
        rid: RecordId,
    ) -> Result<InsertOutcome, TreeError> {
        let mut right = self.buf.new_page()?;
        let right_pid = right.page_id();

        let split = (|| -> Result<(Vec<u8>, PageId), TreeError> {
            let mut old = SortedPage::<RecordId>::open(page.data_mut())?;
            let mut new = SortedPage::<RecordId>::init(right.data_mut(), right_pid)?;
            redistribute(&mut old, &mut new, key, rid)?;

            let after = old.next_page();
            old.set_next_page(right_pid);
            new.set_prev_page(old.pid());
            new.set_next_page(after);

            let promoted = new
                .min_key()?
                .ok_or_else(|| PageError::Corrupt("split produced an empty right page".into()))?
                .to_vec();
            Ok((promoted, after))
        })();

        let (promoted, after) = match split {
            Ok(v) => v,
            Err(e) => {
                let _ = self.buf.unpin(right, false);
                return Err(e);
            }
        };
        self.buf.unpin(right, true)?;

        if after != INVALID_PAGE {
            let mut successor = self.buf.pin(after)?;
            let spliced = SortedPage::<RecordId>::open(successor.data_mut())
                .map(|mut succ| succ.set_prev_page(right_pid));
            match spliced {
                Ok(()) => self.buf.unpin(successor, true)?,
                Err(e) => {
                    let _ = self.buf.unpin(successor, false);
                    return Err(e.into());
                }
            }
        }

        debug!("leaf {} split, new right sibling {}", page.page_id(), right_pid);
        Ok(InsertOutcome::Split {
            key: promoted,
            right: right_pid,
        })
    }

    /// Splits a full index page. The right page's minimum entry is popped
    /// into its leftmost-child pointer and its key promoted to the parent.
    fn split_index(
        &mut self,
        page: &mut PinnedPage,
        sep: &[u8],
        child: PageId,
    ) -> Result<InsertOutcome, TreeError> {
        let mut right = self.buf.new_page()?;
        let right_pid = right.page_id();

        let split = (|| -> Result<Vec<u8>, TreeError> {
            let mut old = SortedPage::<PageId>::open(page.data_mut())?;
            let mut new = SortedPage::<PageId>::init(right.data_mut(), right_pid)?;
            redistribute(&mut old, &mut new, sep, child)?;

            let (min_key, min_child) = {
                let (k, p) = new
                    .min_key_value()?
                    .ok_or_else(|| PageError::Corrupt("split produced an empty right page".into()))?;
                (k.to_vec(), p)
            };
            new.delete(&min_key, min_child)?;
            new.set_prev_page(min_child);
            Ok(min_key)
        })();

        match split {
            Ok(promoted) => {
                self.buf.unpin(right, true)?;
                debug!("index {} split, new right sibling {}", page.page_id(), right_pid);
                Ok(InsertOutcome::Split {
                    key: promoted,
                    right: right_pid,
                })
            }
            Err(e) => {
                let _ = self.buf.unpin(right, false);
                Err(e)
            }
        }
    }

    /// Installs a fresh index root above a split root: it carries the old
    /// root under its leftmost pointer and the promoted key as its only
    /// record.
    fn grow_root(&mut self, old_root: PageId, sep: &[u8], right: PageId) -> Result<(), TreeError> {
        let mut old = self.buf.pin(old_root)?;
        let min = (|| -> Result<Vec<u8>, TreeError> {
            let key = match frame_kind(old.data())? {
                PageKind::Leaf => SortedPage::<RecordId>::open(old.data_mut())?
                    .min_key()?
                    .map(<[u8]>::to_vec),
                PageKind::Index => SortedPage::<PageId>::open(old.data_mut())?
                    .min_key()?
                    .map(<[u8]>::to_vec),
            };
            key.ok_or_else(|| PageError::Corrupt("split root has no keys".into()).into())
        })();
        let min_key = match min {
            Ok(k) => {
                self.buf.unpin(old, false)?;
                k
            }
            Err(e) => {
                let _ = self.buf.unpin(old, false);
                return Err(e);
            }
        };

        let mut root_page = self.buf.new_page()?;
        let new_root = root_page.page_id();
        let seeded = (|| -> Result<(), TreeError> {
            let mut idx = SortedPage::<PageId>::init(root_page.data_mut(), new_root)?;
            idx.insert(&min_key, old_root)?;
            idx.insert(sep, right)?;

            // The minimum entry becomes the leftmost-child pointer.
            let (first_key, first_child) = {
                let (k, p) = idx
                    .min_key_value()?
                    .ok_or_else(|| PageError::Corrupt("new root lost its entries".into()))?;
                (k.to_vec(), p)
            };
            idx.delete(&first_key, first_child)?;
            idx.set_prev_page(first_child);
            Ok(())
        })();

        match seeded {
            Ok(()) => {
                self.buf.unpin(root_page, true)?;
                self.set_root(new_root)?;
                debug!("root split: {old_root} -> new root {new_root}");
                Ok(())
            }
            Err(e) => {
                let _ = self.buf.unpin(root_page, false);
                Err(e)
            }
        }
    }

    /// Post-order walk freeing every page below `pid`; the caller frees
    /// `pid` itself.
    fn free_subtree(&mut self, pid: PageId) -> Result<(), TreeError> {
        let mut page = self.buf.pin(pid)?;
        let children = (|| -> Result<Vec<PageId>, TreeError> {
            match frame_kind(page.data())? {
                PageKind::Leaf => Ok(Vec::new()),
                PageKind::Index => {
                    let idx = SortedPage::<PageId>::open(page.data_mut())?;
                    let mut out = vec![idx.prev_page()];
                    for slot in 0..idx.record_count() {
                        for i in 0..idx.value_count_at(slot)? {
                            out.push(idx.value_at(slot, i)?);
                        }
                    }
                    Ok(out)
                }
            }
        })();

        match children {
            Ok(children) => {
                self.buf.unpin(page, false)?;
                for child in children {
                    self.free_subtree(child)?;
                    self.buf.free_page(child)?;
                    trace!("freed page {child}");
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.buf.unpin(page, false);
                Err(e)
            }
        }
    }

    fn dump_page(&mut self, pid: PageId, depth: usize, out: &mut String) -> Result<(), TreeError> {
        let mut page = self.buf.pin(pid)?;
        let children = (|| -> Result<Vec<PageId>, TreeError> {
            match frame_kind(page.data())? {
                PageKind::Leaf => {
                    let leaf = SortedPage::<RecordId>::open(page.data_mut())?;
                    let _ = writeln!(out, "{:indent$}{}", "", leaf.describe(), indent = depth * 2);
                    Ok(Vec::new())
                }
                PageKind::Index => {
                    let idx = SortedPage::<PageId>::open(page.data_mut())?;
                    let _ = writeln!(out, "{:indent$}{}", "", idx.describe(), indent = depth * 2);
                    let mut out_children = vec![idx.prev_page()];
                    for slot in 0..idx.record_count() {
                        for i in 0..idx.value_count_at(slot)? {
                            out_children.push(idx.value_at(slot, i)?);
                        }
                    }
                    Ok(out_children)
                }
            }
        })();

        match children {
            Ok(children) => {
                self.buf.unpin(page, false)?;
                for child in children {
                    self.dump_page(child, depth + 1, out)?;
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.buf.unpin(page, false);
                Err(e)
            }
        }
    }
}

impl Drop for BTree {
    fn drop(&mut self) {
        if let Some(pin) = self.header_pin.take() {
            let _ = self.buf.unpin(pin, false);
            let _ = self.buf.flush_all();
        }
    }
}

/// Index descent rule: follow the separator at or below `key`, or the
/// leftmost-child pointer when every separator is greater.
pub(crate) fn route_to_child(
    idx: &SortedPage<'_, PageId>,
    key: &[u8],
) -> Result<PageId, PageError> {
    match idx.find_key(key)? {
        FindResult::Found(slot) | FindResult::LessThan(slot) => idx.first_value_at(slot),
        FindResult::BelowMin => Ok(idx.prev_page()),
    }
}

/// Rebalances a full `left` page against an empty `right` sibling while
/// placing one incoming pair.
///
/// Everything moves to `right` first; entries then stream back into `left`
/// in key order while it has more free space. The incoming pair drops into
/// `left` the moment a strictly greater key shows up, otherwise it ends up
/// in `right` — so a key equal to the final pivot always lands right.
fn redistribute<V: NodeValue>(
    left: &mut SortedPage<'_, V>,
    right: &mut SortedPage<'_, V>,
    key: &[u8],
    value: V,
) -> Result<(), PageError> {
    let records: Vec<Vec<u8>> = (0..left.record_count())
        .map(|slot| left.record_bytes(slot).map(<[u8]>::to_vec))
        .collect::<Result<_, _>>()?;
    for rec in &records {
        right.append_record_raw(rec)?;
    }
    left.delete_all();

    let mut placed = false;
    while left.free_space() > right.free_space() {
        let Some((k, v)) = right.min_key_value()? else {
            break;
        };
        let k = k.to_vec();
        if !placed && k.as_slice() > key {
            left.insert(key, value)?;
            placed = true;
        } else {
            left.insert(&k, v)?;
            right.delete(&k, v)?;
        }
    }
    if !placed {
        right.insert(key, value)?;
    }
    Ok(())
}

fn validate_key(key: &[u8]) -> Result<(), TreeError> {
    if key.is_empty() {
        return Err(TreeError::InvalidKey("empty key".into()));
    }
    if key.len() + 1 > MAX_KEY_LENGTH {
        return Err(TreeError::InvalidKey(format!(
            "key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_KEY_LENGTH - 1
        )));
    }
    if key.contains(&0) {
        return Err(TreeError::InvalidKey("key contains a NUL byte".into()));
    }
    Ok(())
}
