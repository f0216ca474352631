use log::warn;

use crate::errors::TreeError;
use crate::storage::buffer::PinnedPage;
use crate::storage::{PageId, INVALID_PAGE};
use crate::tree::cursor::PageCursor;
use crate::tree::node::{frame_kind, PageKind, RecordId, SortedPage};
use crate::tree::{route_to_child, BTree};

/// A forward range scan over the leaf chain, with both bounds inclusive.
///
/// The scan pins exactly one leaf between calls (none once finished) and
/// walks sibling pointers. `delete_current` removes the entry most
/// recently yielded, in place, with no rebalancing; the scan then resumes
/// at the entry that followed it.
#[derive(Debug)]
pub struct TreeScan<'a> {
    tree: &'a mut BTree,
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
    leaf: Option<PinnedPage>,
    cursor: PageCursor,
    leaf_dirty: bool,
    current_valid: bool,
    done: bool,
}

enum Step {
    Pair(Vec<u8>, RecordId),
    Advance(PageId),
    Fail,
}

impl<'a> TreeScan<'a> {
    pub(crate) fn open(
        tree: &'a mut BTree,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<Self, TreeError> {
        let mut scan = Self {
            tree,
            low: low.map(<[u8]>::to_vec),
            high: high.map(<[u8]>::to_vec),
            leaf: None,
            cursor: PageCursor::start(),
            leaf_dirty: false,
            current_valid: false,
            done: false,
        };

        let root = scan.tree.root()?;
        if root == INVALID_PAGE {
            scan.done = true;
            return Ok(scan);
        }

        match scan.low.clone() {
            None => {
                let pid = scan.tree.leftmost_leaf()?;
                if pid == INVALID_PAGE {
                    scan.done = true;
                } else {
                    scan.leaf = Some(scan.tree.buffer().pin(pid)?);
                    scan.cursor = PageCursor::start();
                }
            }
            Some(low) => scan.seek(root, &low)?,
        }
        Ok(scan)
    }

    /// Descends to the leaf that covers `low` and aims the cursor at the
    /// greatest key at or below it.
    fn seek(&mut self, root: PageId, low: &[u8]) -> Result<(), TreeError> {
        let mut pid = root;
        loop {
            let mut page = self.tree.buffer().pin(pid)?;
            let step = frame_kind(page.data()).and_then(|kind| match kind {
                PageKind::Leaf => Ok(None),
                PageKind::Index => {
                    let idx = SortedPage::<PageId>::open(page.data_mut())?;
                    route_to_child(&idx, low).map(Some)
                }
            });
            match step {
                Ok(Some(child)) => {
                    self.tree.buffer().unpin(page, false)?;
                    pid = child;
                }
                Ok(None) => {
                    let mut cursor = PageCursor::start();
                    let positioned = SortedPage::<RecordId>::open(page.data_mut())
                        .and_then(|leaf| leaf.search(low, &mut cursor).map(|_| ()));
                    return match positioned {
                        Ok(()) => {
                            self.cursor = cursor;
                            self.leaf = Some(page);
                            Ok(())
                        }
                        Err(e) => {
                            let _ = self.tree.buffer().unpin(page, false);
                            Err(e.into())
                        }
                    };
                }
                Err(e) => {
                    let _ = self.tree.buffer().unpin(page, false);
                    return Err(e.into());
                }
            }
        }
    }

    /// Deletes the pair most recently returned by `next`.
    ///
    /// Fails with [`TreeError::ScanNotStarted`] before the first `next`,
    /// after `next` has returned `None`, and after a previous delete that
    /// was not followed by another `next`. Leaves are never merged; an
    /// emptied leaf simply stays in the chain.
    pub fn delete_current(&mut self) -> Result<(), TreeError> {
        if !self.current_valid {
            return Err(TreeError::ScanNotStarted);
        }
        let Some(page) = self.leaf.as_mut() else {
            return Err(TreeError::ScanNotStarted);
        };
        let mut view = SortedPage::<RecordId>::open(page.data_mut())?;
        self.cursor.delete_current(&mut view)?;
        self.leaf_dirty = true;
        self.current_valid = false;
        Ok(())
    }

    /// Unpins the held leaf, writing it back if a delete touched it.
    fn release_leaf(&mut self) {
        if let Some(page) = self.leaf.take() {
            if let Err(e) = self.tree.buffer().unpin(page, self.leaf_dirty) {
                warn!("scan failed to unpin leaf: {e}");
            }
            self.leaf_dirty = false;
        }
    }

    fn finish(&mut self) -> Option<(Box<[u8]>, RecordId)> {
        self.release_leaf();
        self.done = true;
        self.current_valid = false;
        None
    }
}

impl Iterator for TreeScan<'_> {
    type Item = (Box<[u8]>, RecordId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            let Some(page) = self.leaf.as_mut() else {
                return self.finish();
            };
            let pid = page.page_id();

            let step = match SortedPage::<RecordId>::open(page.data_mut()) {
                Ok(view) => match self.cursor.next(&view) {
                    Ok(Some((key, rid))) => Step::Pair(key.to_vec(), rid),
                    Ok(None) => Step::Advance(view.next_page()),
                    Err(e) => {
                        warn!("scan failed reading leaf {pid}: {e}");
                        Step::Fail
                    }
                },
                Err(e) => {
                    warn!("scan cannot open leaf {pid}: {e}");
                    Step::Fail
                }
            };

            match step {
                Step::Fail => return self.finish(),
                Step::Pair(key, rid) => {
                    if let Some(high) = &self.high {
                        if key.as_slice() > high.as_slice() {
                            return self.finish();
                        }
                    }
                    if let Some(low) = &self.low {
                        // Only the first leaf can hold keys below the
                        // window; skip them.
                        if key.as_slice() < low.as_slice() {
                            continue;
                        }
                    }
                    self.current_valid = true;
                    return Some((key.into_boxed_slice(), rid));
                }
                Step::Advance(next_pid) => {
                    self.release_leaf();
                    if next_pid == INVALID_PAGE {
                        self.done = true;
                        self.current_valid = false;
                        return None;
                    }
                    match self.tree.buffer().pin(next_pid) {
                        Ok(page) => {
                            self.leaf = Some(page);
                            self.cursor = PageCursor::start();
                        }
                        Err(e) => {
                            warn!("scan cannot pin leaf {next_pid}: {e}");
                            return self.finish();
                        }
                    }
                }
            }
        }
    }
}

impl Drop for TreeScan<'_> {
    fn drop(&mut self) {
        self.release_leaf();
    }
}
