use crate::errors::PageError;
use crate::tree::node::{NodeValue, SortedPage};

/// A cursor over one sorted key-multivalue page, stepping at key/value
/// granularity.
///
/// The cursor is a gap position between elements plus the element most
/// recently handed out. It borrows nothing: every call takes the page view,
/// so a cursor survives the page being re-opened over a repinned frame.
///
/// States: before the first element (`last` unset), just-read (`last` set),
/// after-delete (`last` cleared until the next step), and exhausted.
/// `delete_current` removes the just-read element and re-aims the gap so
/// the following `next` yields the element that followed it.
#[derive(Debug, Clone, Default)]
pub struct PageCursor {
    next_slot: usize,
    next_val: usize,
    last: Option<(usize, usize)>,
}

impl PageCursor {
    /// A cursor positioned before the first element of the page.
    pub fn start() -> Self {
        Self::default()
    }

    /// Re-aims the cursor at the first value of `slot`.
    pub fn seek_slot(&mut self, slot: usize) {
        self.next_slot = slot;
        self.next_val = 0;
        self.last = None;
    }

    /// Yields the element at the gap and advances past it, or `None` when
    /// the page is exhausted.
    pub fn next<'b, V: NodeValue>(
        &mut self,
        page: &'b SortedPage<'_, V>,
    ) -> Result<Option<(&'b [u8], V)>, PageError> {
        loop {
            if self.next_slot >= page.record_count() {
                self.last = None;
                return Ok(None);
            }
            if self.next_val >= page.value_count_at(self.next_slot)? {
                self.next_slot += 1;
                self.next_val = 0;
                continue;
            }
            break;
        }
        let key = page.key_at(self.next_slot)?;
        let value = page.value_at(self.next_slot, self.next_val)?;
        self.last = Some((self.next_slot, self.next_val));
        self.next_val += 1;
        Ok(Some((key, value)))
    }

    /// Steps the gap back one element and yields it, or `None` at the page
    /// start. `next` after `prev` re-reads the same element.
    pub fn prev<'b, V: NodeValue>(
        &mut self,
        page: &'b SortedPage<'_, V>,
    ) -> Result<Option<(&'b [u8], V)>, PageError> {
        // Clamp a gap that points past shrunken data before stepping.
        let n = page.record_count();
        if self.next_slot > n {
            self.next_slot = n;
            self.next_val = 0;
        }
        if self.next_val > 0 {
            self.next_val -= 1;
        } else {
            loop {
                if self.next_slot == 0 {
                    self.last = None;
                    return Ok(None);
                }
                self.next_slot -= 1;
                let nvals = page.value_count_at(self.next_slot)?;
                if nvals > 0 {
                    self.next_val = nvals - 1;
                    break;
                }
            }
        }
        let key = page.key_at(self.next_slot)?;
        let value = page.value_at(self.next_slot, self.next_val)?;
        self.last = Some((self.next_slot, self.next_val));
        Ok(Some((key, value)))
    }

    /// Removes the element most recently returned by `next`/`prev`.
    ///
    /// Afterwards there is no current element until the cursor steps again;
    /// the following `next` yields the element that would have come after
    /// the deleted one.
    pub fn delete_current<V: NodeValue>(
        &mut self,
        page: &mut SortedPage<'_, V>,
    ) -> Result<(), PageError> {
        let Some((slot, val)) = self.last.take() else {
            return Err(PageError::NotFound);
        };
        let nvals = page.value_count_at(slot)?;
        if nvals == 1 {
            page.delete_record_at(slot)?;
            self.next_slot = slot;
            self.next_val = 0;
        } else {
            page.cut_value_at(slot, val)?;
            self.next_slot = slot;
            self.next_val = val;
        }
        Ok(())
    }

    /// Whether the last `next`/`prev` produced an element that has not been
    /// deleted since.
    pub fn has_current(&self) -> bool {
        self.last.is_some()
    }
}
