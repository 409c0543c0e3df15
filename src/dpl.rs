//! Dirty-page list: the set of pages a write transaction has copied or
//! allocated this round, keyed by page number.
//!
//! Entries are appended in whatever order pages are touched and sorted only
//! when a lookup actually needs it, so a transaction that only ever walks
//! forward (bulk load, append) never pays a sort it doesn't need.

use crate::error::{Error, PageId, Result};
use crate::page::Page;

/// Soft cap on the number of distinct dirty pages a single transaction may
/// hold before it is refused further writes.
pub const DPL_TXNFULL: usize = 1 << 18;

struct Entry {
    pgno: PageId,
    page: Box<Page>,
    seq: u64,
}

pub struct DirtyList {
    entries: Vec<Entry>,
    sorted: bool,
    next_seq: u64,
}

impl DirtyList {
    pub fn new() -> Self {
        Self { entries: Vec::new(), sorted: true, next_seq: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sort by pgno ascending, breaking ties by insertion order descending
    /// so the most recently appended copy of a page wins, then collapse
    /// duplicate pgnos.
    fn ensure_sorted(&mut self) {
        if self.sorted {
            return;
        }
        self.entries.sort_by(|a, b| a.pgno.0.cmp(&b.pgno.0).then(b.seq.cmp(&a.seq)));
        self.entries.dedup_by_key(|e| e.pgno.0);
        self.sorted = true;
    }

    /// Binary search for `pgno`, sorting first if entries were appended
    /// since the last lookup.
    pub fn search(&mut self, pgno: PageId) -> Option<usize> {
        self.ensure_sorted();
        self.entries.binary_search_by_key(&pgno.0, |e| e.pgno.0).ok()
    }

    /// Immutable lookup that never re-sorts, for call sites that only hold
    /// a shared borrow of the owning transaction (e.g. generic code shared
    /// between read and write transactions). A plain linear scan since
    /// dirty lists are small relative to the whole database.
    pub fn get(&self, pgno: PageId) -> Option<&Page> {
        self.entries.iter().rev().find(|e| e.pgno == pgno).map(|e| e.page.as_ref())
    }

    pub fn find(&mut self, pgno: PageId) -> Option<&Page> {
        let idx = self.search(pgno)?;
        Some(&self.entries[idx].page)
    }

    pub fn find_mut(&mut self, pgno: PageId) -> Option<&mut Page> {
        let idx = self.search(pgno)?;
        Some(&mut self.entries[idx].page)
    }

    pub fn contains(&mut self, pgno: PageId) -> bool {
        self.search(pgno).is_some()
    }

    /// Record `page` as dirty for `pgno`. Pushed unsorted; a later
    /// `search`/`find` call pays the sort-and-dedup cost once. If `pgno`
    /// was already dirty this round, the new copy wins.
    pub fn append(&mut self, pgno: PageId, page: Box<Page>) -> Result<()> {
        if self.entries.len() >= DPL_TXNFULL {
            return Err(Error::TxnListFull { what: "dirty page list", limit: DPL_TXNFULL });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry { pgno, page, seq });
        self.sorted = false;
        Ok(())
    }

    pub fn remove(&mut self, pgno: PageId) -> Option<Box<Page>> {
        let idx = self.search(pgno)?;
        Some(self.entries.remove(idx).page)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageId, &Page)> {
        self.entries.iter().map(|e| (e.pgno, e.page.as_ref()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PageId, &mut Page)> {
        self.entries.iter_mut().map(|e| (e.pgno, e.page.as_mut()))
    }

    pub fn pgnos(&self) -> impl Iterator<Item = PageId> + '_ {
        self.entries.iter().map(|e| e.pgno)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.sorted = true;
        self.next_seq = 0;
    }

    /// Drain all entries, e.g. to merge into a parent transaction's list.
    pub fn drain(&mut self) -> Vec<(PageId, Box<Page>)> {
        self.ensure_sorted();
        self.sorted = true;
        std::mem::take(&mut self.entries).into_iter().map(|e| (e.pgno, e.page)).collect()
    }

    /// Merge in entries drained from a child transaction, with the child's
    /// version of a page overwriting anything the parent already holds for
    /// that page number.
    pub fn merge_from_child(&mut self, child: Vec<(PageId, Box<Page>)>) -> Result<()> {
        for (pgno, page) in child {
            self.append(pgno, page)?;
        }
        Ok(())
    }
}

impl Default for DirtyList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageFlags;

    fn leaf(pgno: u64) -> Box<Page> {
        Page::new(PageId(pgno), PageFlags::LEAF)
    }

    #[test]
    fn append_then_find_after_lazy_sort() {
        let mut dpl = DirtyList::new();
        dpl.append(PageId(5), leaf(5)).unwrap();
        dpl.append(PageId(1), leaf(1)).unwrap();
        dpl.append(PageId(3), leaf(3)).unwrap();
        assert!(dpl.find(PageId(3)).is_some());
        assert!(dpl.find(PageId(9)).is_none());
    }

    #[test]
    fn append_replaces_existing_entry() {
        let mut dpl = DirtyList::new();
        dpl.append(PageId(1), leaf(1)).unwrap();
        dpl.append(PageId(1), leaf(1)).unwrap();
        assert_eq!(dpl.len(), 1);
    }

    #[test]
    fn remove_drops_entry() {
        let mut dpl = DirtyList::new();
        dpl.append(PageId(2), leaf(2)).unwrap();
        assert!(dpl.remove(PageId(2)).is_some());
        assert!(dpl.find(PageId(2)).is_none());
    }

    #[test]
    fn merge_from_child_prefers_childs_page() {
        let mut parent = DirtyList::new();
        parent.append(PageId(1), leaf(1)).unwrap();
        let mut child = DirtyList::new();
        child.append(PageId(1), leaf(1)).unwrap();
        child.append(PageId(2), leaf(2)).unwrap();
        parent.merge_from_child(child.drain()).unwrap();
        assert_eq!(parent.len(), 2);
    }
}
