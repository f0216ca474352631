use byteorder::{ByteOrder, LittleEndian};

use crate::storage::{PageId, INVALID_PAGE};

/// The tree's header page: its first four bytes name the current root.
///
/// The root id changes when the first root leaf is created, on every root
/// split, and back to `INVALID_PAGE` when the index is destroyed.
#[derive(Debug)]
pub struct HeaderPage<'a> {
    buf: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn init(buf: &'a mut [u8]) -> Self {
        buf.fill(0);
        let mut page = Self { buf };
        page.set_root(INVALID_PAGE);
        page
    }

    pub fn open(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    pub fn root(&self) -> PageId {
        LittleEndian::read_u32(&self.buf[0..4])
    }

    pub fn set_root(&mut self, pid: PageId) {
        LittleEndian::write_u32(&mut self.buf[0..4], pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    #[test]
    fn init_sets_no_root() {
        let mut buf = vec![0xFFu8; PAGE_SIZE];
        let header = HeaderPage::init(&mut buf);
        assert_eq!(header.root(), INVALID_PAGE);
    }

    #[test]
    fn root_round_trips() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut header = HeaderPage::init(&mut buf);
        header.set_root(17);
        drop(header);
        let header = HeaderPage::open(&mut buf);
        assert_eq!(header.root(), 17);
    }
}
