//! Free-space manager: pages retired by finished write transactions are
//! recorded here, keyed by the committing transaction's id, and later
//! reclaimed by a future write transaction once no reader can still see
//! them.
//!
//! The manager is itself a B+tree subtree (the "gc database") living
//! alongside the main data tree, rooted at its own [`DbInfo`]. Each entry's
//! key is a big-endian transaction id; its value is a serialized, sorted
//! [`IdList`] of page numbers that transaction retired.

use crate::btree::BTree;
use crate::comparator::LexicographicComparator;
use crate::error::{Error, PageId, Result, TransactionId};
use crate::meta::DbInfo;
use crate::pnl::{new_pnl, IdList};
use crate::txn::{mode, Transaction, Write};
use tracing::debug;

/// Bound on the commit-time GC update loop (`crate::txn::Transaction::commit`'s
/// convergence pass): each iteration can in principle retire more pages than
/// the one before it (storing the gc entry itself dirties gc-tree pages), so
/// the loop needs a hard stop rather than looping until a fixed point that
/// might not exist.
pub const MAX_GC_UPDATE_ITERS: u32 = 42;

/// How retired page ranges are pulled back out for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Reuse the oldest retired extent first (default; minimizes the time a
    /// page spends unused before going back into circulation).
    Fifo,
    /// Reuse the most recently retired extent first, tracked via a
    /// `lifo_reclaimed` marker so the walk doesn't re-offer an extent that
    /// was already handed out and is still live in some transaction's
    /// dirty list.
    Lifo,
}

fn encode_txnid(id: TransactionId) -> [u8; 8] {
    id.0.to_be_bytes()
}

fn decode_txnid(bytes: &[u8]) -> Result<TransactionId> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Corruption { details: "malformed gc key".into(), page_id: None })?;
    Ok(TransactionId(u64::from_be_bytes(arr)))
}

fn encode_pages(pages: &IdList) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + pages.len() * 8);
    buf.extend_from_slice(&(pages.len() as u64).to_le_bytes());
    for pgno in pages.iter() {
        buf.extend_from_slice(&pgno.to_le_bytes());
    }
    buf
}

fn decode_pages(bytes: &[u8]) -> Result<IdList> {
    if bytes.len() < 8 {
        return Err(Error::Corruption { details: "truncated gc value".into(), page_id: None });
    }
    let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
    if bytes.len() != 8 + count * 8 {
        return Err(Error::Corruption { details: "gc value length mismatch".into(), page_id: None });
    }
    let mut list = new_pnl("gc-entry");
    for chunk in bytes[8..].chunks_exact(8) {
        list.append(u64::from_le_bytes(chunk.try_into().unwrap()))?;
    }
    Ok(list)
}

/// Record the pages a just-finished write transaction retired, so a future
/// transaction can reclaim them once they're no longer visible to readers.
pub fn retire(
    txn: &mut Transaction<'_, Write>,
    gc_root: &mut PageId,
    gc_info: &mut DbInfo,
    txnid: TransactionId,
    pages: &IdList,
) -> Result<()> {
    if pages.is_empty() {
        return Ok(());
    }
    let key = encode_txnid(txnid);
    let value = encode_pages(pages);
    debug!(txnid = txnid.0, count = pages.len(), "gc: retiring page extent");
    BTree::<LexicographicComparator>::insert(txn, gc_root, gc_info, &key, &value)?;
    Ok(())
}

/// The leftmost (smallest key) entry of a B+tree, descending via leftmost
/// branch children down to the first leaf node. Used for FIFO reclaiming.
fn leftmost_entry<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
) -> Result<Option<(TransactionId, IdList)>> {
    use crate::branch::BranchPage;
    use crate::page::PageFlags;

    let mut pgno = root;
    loop {
        let page = txn.get_page(pgno)?;
        if page.header.flags.contains(PageFlags::BRANCH) {
            pgno = BranchPage::get_leftmost_child(page)?;
        } else {
            if page.header.num_keys == 0 {
                return Ok(None);
            }
            let node = page.node(0)?;
            let txnid = decode_txnid(node.key()?)?;
            let pages = decode_pages(&node.value()?)?;
            return Ok(Some((txnid, pages)));
        }
    }
}

/// The rightmost (largest key) entry, used for LIFO reclaiming.
fn rightmost_entry<M: mode::Mode>(
    txn: &Transaction<'_, M>,
    root: PageId,
) -> Result<Option<(TransactionId, IdList)>> {
    use crate::page::PageFlags;

    let mut pgno = root;
    loop {
        let page = txn.get_page(pgno)?;
        let num_keys = page.header.num_keys as usize;
        if num_keys == 0 {
            return Ok(None);
        }
        if page.header.flags.contains(PageFlags::BRANCH) {
            pgno = page.node(num_keys - 1)?.page_number()?;
        } else {
            let node = page.node(num_keys - 1)?;
            let txnid = decode_txnid(node.key()?)?;
            let pages = decode_pages(&node.value()?)?;
            return Ok(Some((txnid, pages)));
        }
    }
}

/// Outcome of one reclaim attempt.
pub struct Reclaimed {
    /// Pages now available for immediate reuse by the caller's transaction.
    pub pages: IdList,
    /// Transaction ids whose extents were fully consumed and removed from
    /// the gc database.
    pub consumed: Vec<TransactionId>,
}

/// Pull enough retired pages to satisfy `want` page allocations, stopping
/// once the budget is met or no further entry is eligible (its retiring
/// transaction is still newer than `oldest_reader`, i.e. some reader could
/// still be looking at it). Consumed entries are deleted from the gc tree
/// immediately so a later candidate within the same call can't be offered
/// twice; under `ReclaimPolicy::Lifo` the consumed txnid is also recorded
/// into `lifo_reclaimed` so the commit-time update loop can re-assert the
/// deletion once more before this transaction's own retired-page entry is
/// stored (see `Transaction::run_gc_update_loop`).
pub fn reclaim(
    txn: &mut Transaction<'_, Write>,
    gc_root: &mut PageId,
    gc_info: &mut DbInfo,
    oldest_reader: TransactionId,
    policy: ReclaimPolicy,
    want: usize,
    lifo_reclaimed: &mut IdList,
) -> Result<Reclaimed> {
    let mut out = Reclaimed { pages: new_pnl("reclaimed"), consumed: Vec::new() };

    loop {
        if out.pages.len() >= want {
            break;
        }
        let candidate = match policy {
            ReclaimPolicy::Fifo => leftmost_entry(txn, *gc_root)?,
            ReclaimPolicy::Lifo => rightmost_entry(txn, *gc_root)?,
        };
        let Some((txnid, pages)) = candidate else { break };

        // A reader older than this transaction's retirement may still be
        // walking pages that belonged to the pre-retirement snapshot.
        if oldest_reader.0 != 0 && txnid.0 >= oldest_reader.0 {
            break;
        }

        let key = encode_txnid(txnid);
        BTree::<LexicographicComparator>::delete(txn, gc_root, gc_info, &key)?;
        debug!(txnid = txnid.0, count = pages.len(), ?policy, "gc: reclaimed page extent");
        out.pages.merge(&pages)?;
        out.consumed.push(txnid);
        if policy == ReclaimPolicy::Lifo {
            // Recorded so the commit-time update loop can replay (re-assert)
            // this deletion once more before storing the final retired-page
            // entry, since a nested transaction folding its parent's gc
            // bookkeeping back in could otherwise resurrect a stale key.
            lifo_reclaimed.append(txnid.0)?;
        }
    }

    Ok(out)
}

/// Re-assert that every txnid this transaction consumed under LIFO reclaim
/// is actually gone from the gc tree, clearing the list once done. Returns
/// whether any deletion actually did something, meaning the gc tree still
/// held a key the in-memory bookkeeping thought was already gone — the
/// commit loop treats that as a sign it needs another convergence pass.
pub fn replay_lifo_reclaimed(
    txn: &mut Transaction<'_, Write>,
    gc_root: &mut PageId,
    gc_info: &mut DbInfo,
    lifo_reclaimed: &mut IdList,
) -> Result<bool> {
    let mut replayed_something = false;
    for txnid in lifo_reclaimed.iter() {
        let key = encode_txnid(TransactionId(txnid));
        match BTree::<LexicographicComparator>::delete(txn, gc_root, gc_info, &key) {
            Ok(Some(_)) => {
                debug!(txnid, "gc: lifo replay found a stale entry still present");
                replayed_something = true;
            }
            Ok(None) => {}
            Err(Error::KeyNotFound) => {}
            Err(e) => return Err(e),
        }
    }
    lifo_reclaimed.clear();
    Ok(replayed_something)
}

/// Sum of all pages still pending reclaim across every retired extent;
/// used by [`crate::audit`] to verify the page-accounting identity.
pub fn pending_count<M: mode::Mode>(txn: &Transaction<'_, M>, gc_root: PageId) -> Result<u64> {
    use crate::page::PageFlags;

    fn walk<M: mode::Mode>(txn: &Transaction<'_, M>, pgno: PageId, total: &mut u64) -> Result<()> {
        let page = txn.get_page(pgno)?;
        let num_keys = page.header.num_keys as usize;
        if page.header.flags.contains(PageFlags::BRANCH) {
            use crate::branch::BranchPage;
            walk(txn, BranchPage::get_leftmost_child(page)?, total)?;
            for i in 0..num_keys {
                walk(txn, page.node(i)?.page_number()?, total)?;
            }
        } else {
            for i in 0..num_keys {
                let value = page.node(i)?.value()?;
                *total += decode_pages(&value)?.len() as u64;
            }
        }
        Ok(())
    }

    let mut total = 0u64;
    walk(txn, gc_root, &mut total)?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut pages = new_pnl("t");
        for p in [3, 7, 9] {
            pages.append(p).unwrap();
        }
        let bytes = encode_pages(&pages);
        let decoded = decode_pages(&bytes).unwrap();
        assert_eq!(decoded.as_slice(), pages.as_slice());
    }

    #[test]
    fn txnid_key_roundtrip_is_order_preserving() {
        let a = encode_txnid(TransactionId(1));
        let b = encode_txnid(TransactionId(2));
        assert!(a < b);
        assert_eq!(decode_txnid(&a).unwrap(), TransactionId(1));
    }
}
