//! Integrity checking: a page walker plus the accounting identity every
//! consistent snapshot must satisfy.
//!
//! `pending + used_in_dbs + NUM_METAS == next_pgno` — every page number
//! below the allocation frontier is either retired-and-awaiting-reclaim,
//! live in some database's tree, or one of the fixed meta pages. A mismatch
//! means a page was leaked (never retired, never reachable) or double
//! counted (reachable from two places at once).

use crate::branch::BranchPage;
use crate::error::{Error, PageId, Result};
use crate::gc;
use crate::meta::{MetaPage, NUM_METAS};
use crate::page::PageFlags;
use crate::txn::{mode, Transaction};
use std::collections::HashSet;

/// Page-level counts gathered while walking a single database's tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalkStats {
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
}

impl WalkStats {
    pub fn total(&self) -> u64 {
        self.branch_pages + self.leaf_pages + self.overflow_pages
    }
}

/// Walk every page reachable from `root`, visiting overflow chains too, and
/// fail on any page number visited twice (a cycle or a page shared between
/// two trees, both of which indicate corruption).
pub fn walk<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
    seen: &mut HashSet<u64>,
) -> Result<WalkStats> {
    let mut stats = WalkStats::default();
    walk_inner(txn, root, seen, &mut stats)?;
    Ok(stats)
}

fn walk_inner<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    pgno: PageId,
    seen: &mut HashSet<u64>,
    stats: &mut WalkStats,
) -> Result<()> {
    if !seen.insert(pgno.0) {
        return Err(Error::Corruption {
            details: format!("page {} reachable from more than one place", pgno.0),
            page_id: Some(pgno),
        });
    }

    let page = txn.get_page(pgno)?;
    let num_keys = page.header.num_keys as usize;

    if page.header.flags.contains(PageFlags::BRANCH) {
        stats.branch_pages += 1;
        walk_inner(txn, BranchPage::get_leftmost_child(page)?, seen, stats)?;
        for i in 0..num_keys {
            let child = page.node(i)?.page_number()?;
            walk_inner(txn, child, seen, stats)?;
        }
    } else if page.header.flags.contains(PageFlags::LEAF) {
        stats.leaf_pages += 1;
        for i in 0..num_keys {
            let node = page.node(i)?;
            if let Some(overflow_root) = node.overflow_page()? {
                walk_overflow_chain(txn, overflow_root, seen, stats)?;
            }
        }
    } else {
        return Err(Error::Corruption {
            details: format!("page {} has neither BRANCH nor LEAF flag", pgno.0),
            page_id: Some(pgno),
        });
    }
    Ok(())
}

fn walk_overflow_chain<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    mut pgno: PageId,
    seen: &mut HashSet<u64>,
    stats: &mut WalkStats,
) -> Result<()> {
    loop {
        if !seen.insert(pgno.0) {
            return Err(Error::Corruption {
                details: format!("overflow page {} reachable from more than one place", pgno.0),
                page_id: Some(pgno),
            });
        }
        let page = txn.get_page(pgno)?;
        stats.overflow_pages += 1;
        if page.header.next_pgno == 0 {
            return Ok(());
        }
        pgno = PageId(page.header.next_pgno);
    }
}

/// Full snapshot audit: walk the main database, the gc database, and any
/// catalog-registered named databases, then check the accounting identity
/// against `meta.next_pgno`.
pub fn verify<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    meta: &MetaPage,
    named_roots: &[PageId],
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut used = 0u64;

    used += walk(txn, meta.main_db.root, &mut seen)?.total();
    used += walk(txn, meta.gc_db.root, &mut seen)?.total();
    for root in named_roots {
        used += walk(txn, *root, &mut seen)?.total();
    }

    let pending = gc::pending_count(txn, meta.gc_db.root)?;
    let expected_next = pending + used + NUM_METAS as u64;

    if expected_next != meta.next_pgno.0 {
        return Err(Error::Corruption {
            details: format!(
                "accounting identity violated: pending({pending}) + used({used}) + metas({}) = {} != next_pgno({})",
                NUM_METAS,
                expected_next,
                meta.next_pgno.0
            ),
            page_id: None,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvBuilder;

    #[test]
    fn fresh_environment_satisfies_the_accounting_identity() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
        let txn = env.read_txn().unwrap();
        let meta = env.inner().meta().unwrap();
        verify(&txn, &meta, &[]).unwrap();
    }
}
