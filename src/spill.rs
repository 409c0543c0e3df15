//! Dirty-page spilling: when a write transaction's dirty-page list grows
//! past the environment's memory budget, a fraction of it is flushed to
//! disk early (but not yet made visible — the meta page still points at
//! the old root) so the transaction can keep growing without holding
//! everything in memory until commit.

use crate::dpl::DirtyList;
use crate::error::{PageId, Result};
use crate::page::PageFlags;
use crate::pnl::{new_pnl, IdList};
use tracing::debug;

/// Spill roughly one eighth of the dirty list once it crosses the budget,
/// matching the teacher's existing dirty-page accounting granularity.
pub const SPILL_FRACTION_DENOM: usize = 8;

/// Pages a transaction has asked never to be spilled this round: active
/// cursor stack pages and the current root, since unspilling them mid
/// traversal would invalidate in-flight cursors.
#[derive(Debug, Clone)]
pub struct KeepSet {
    pages: IdList,
}

impl KeepSet {
    pub fn new() -> Self {
        Self { pages: new_pnl("pages_xkeep") }
    }

    pub fn mark(&mut self, pgno: PageId) -> Result<()> {
        self.pages.insert(pgno.0)
    }

    pub fn contains(&self, pgno: PageId) -> bool {
        self.pages.exist(pgno.0)
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Record of pages flushed to disk early, kept so a subsequent write to the
/// same page number can notice it needs to be pulled back before being
/// mutated again ("unspilled"), and so abort can discard them without
/// corrupting the environment.
#[derive(Debug)]
pub struct SpillList {
    pages: IdList,
}

impl SpillList {
    pub fn new() -> Self {
        Self { pages: new_pnl("spill_pages") }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, pgno: PageId) -> bool {
        self.pages.exist(pgno.0)
    }

    pub fn mark_spilled(&mut self, pgno: PageId) -> Result<()> {
        self.pages.insert(pgno.0)
    }

    /// A page that was spilled is being touched again; it must be written
    /// through a fresh copy-on-write rather than mutated in place, since
    /// the on-disk copy may still be referenced by an in-flight write of
    /// the previous spill batch.
    pub fn unspill(&mut self, pgno: PageId) -> bool {
        self.pages.remove(pgno.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = PageId> + '_ {
        self.pages.iter().map(PageId)
    }
}

/// Decide whether the dirty list needs spilling and, if so, which page
/// numbers to flush. Pages in `keep` are skipped even if chosen by the
/// fraction, since spilling them would pull the rug out from under a live
/// cursor.
pub fn plan_spill(dirty: &DirtyList, budget_pages: usize, keep: &KeepSet) -> Vec<PageId> {
    if dirty.len() <= budget_pages {
        return Vec::new();
    }
    let target = dirty.len() / SPILL_FRACTION_DENOM.max(1);
    let target = target.max(dirty.len() - budget_pages);

    let mut candidates: Vec<PageId> = dirty
        .iter()
        .filter(|(pgno, page)| !keep.contains(*pgno) && !page.header.flags.contains(PageFlags::LOOSE))
        .map(|(pgno, _)| pgno)
        .collect();
    candidates.truncate(target);
    debug!(dirty = dirty.len(), planned = candidates.len(), "spill: selected pages to flush early");
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;

    #[test]
    fn keep_set_protects_marked_pages_from_spill_plan() {
        let mut dirty = DirtyList::new();
        for i in 1..=16u64 {
            dirty.append(PageId(i), Page::new(PageId(i), PageFlags::LEAF)).unwrap();
        }
        let mut keep = KeepSet::new();
        keep.mark(PageId(1)).unwrap();
        let plan = plan_spill(&dirty, 4, &keep);
        assert!(!plan.contains(&PageId(1)));
        assert!(!plan.is_empty());
    }

    #[test]
    fn under_budget_plans_nothing() {
        let mut dirty = DirtyList::new();
        dirty.append(PageId(1), Page::new(PageId(1), PageFlags::LEAF)).unwrap();
        let plan = plan_spill(&dirty, 100, &KeepSet::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn unspill_removes_from_spill_list() {
        let mut spilled = SpillList::new();
        spilled.mark_spilled(PageId(5)).unwrap();
        assert!(spilled.contains(PageId(5)));
        assert!(spilled.unspill(PageId(5)));
        assert!(!spilled.contains(PageId(5)));
    }
}
