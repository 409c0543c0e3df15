//! Transaction management with compile-time safety.
//!
//! A [`Transaction`] is generic over [`mode::Read`] or [`mode::Write`], so the
//! compiler rejects `alloc_page`/`commit`/`free_page` calls against a read
//! snapshot rather than failing at runtime. A write transaction owns the
//! environment's single write lock for its lifetime; readers never block it
//! and it never blocks them (see [`crate::reader`]).

use crate::dpl::DirtyList;
use crate::env::{DurabilityMode, EnvFlags, Environment};
use crate::error::{ConflictDetails, Error, Operation, PageId, Result, TransactionId};
use crate::gc::{self, ReclaimPolicy};
use crate::meta::{DbInfo, DurabilitySign, NUM_METAS};
use crate::page::{Page, PageFlags};
use crate::pnl::{new_pnl, IdList};
use crate::spill::{self, KeepSet, SpillList};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use tracing::{debug, instrument};

/// Transaction mode markers.
pub mod mode {
    mod sealed {
        pub trait Sealed {}
    }

    /// A transaction mode: [`Read`] or [`Write`]. Sealed so only this crate
    /// can define new modes.
    pub trait Mode: sealed::Sealed {
        /// Whether this mode may mutate pages.
        const IS_WRITE: bool;
    }

    /// A read-only snapshot transaction.
    #[derive(Debug)]
    pub struct Read;
    impl sealed::Sealed for Read {}
    impl Mode for Read {
        const IS_WRITE: bool = false;
    }

    /// A write transaction; the environment allows only one at a time.
    #[derive(Debug)]
    pub struct Write;
    impl sealed::Sealed for Write {}
    impl Mode for Write {
        const IS_WRITE: bool = true;
    }
}

pub use mode::{Read, Write};

/// Soft limit on how many distinct pages a single top-level transaction may
/// dirty before it is refused further writes (separate from `DPL_TXNFULL`,
/// which bounds the list's raw storage).
pub const MAX_TXN_PAGES: usize = 1 << 20;

pub(crate) struct TxnData<'env> {
    pub(crate) env: &'env Environment<crate::env::state::Open>,
    pub(crate) id: TransactionId,
    pub(crate) databases: HashMap<Option<String>, DbInfo>,
}

struct WriteState<'env> {
    _write_guard: parking_lot::MutexGuard<'env, ()>,
    dirty: DirtyList,
    /// Pages replaced or freed this round; handed to the gc database at
    /// commit so a future writer can reclaim them once no reader can still
    /// see the snapshot that last used them.
    retired: IdList,
    /// Pages already pulled out of the gc database this round, ready for
    /// immediate reuse before falling back to tail-bump allocation.
    reclaimed: IdList,
    spill_keep: KeepSet,
    spilled: SpillList,
    gc_root: PageId,
    gc_info: DbInfo,
    /// Under `ReclaimPolicy::Lifo`, the txnids this transaction has already
    /// consumed out of the gc tree, kept so the commit-time GC update loop
    /// can replay (re-assert) those deletions before writing the final
    /// retired-page entry. Unused under FIFO, whose walk-from-the-front
    /// order never needs to revisit an entry.
    lifo_reclaimed: IdList,
    /// `next_pgno` at the moment this transaction acquired the write lock;
    /// rolled back to on abort, since the write lock's exclusivity means
    /// every pgno handed out since then belongs to this transaction alone.
    pgno_floor: u64,
    committed: bool,
    /// Reentrancy guard around `refill_reclaimed`: pulling pages out of the
    /// gc subtree can itself dirty gc-tree pages, which would otherwise
    /// recurse back into the allocator.
    refilling: bool,
}

enum ModeData<'env> {
    ReadOnly { reader_slot: Option<usize> },
    ReadWrite(WriteState<'env>),
}

/// A transaction over a snapshot of the database.
pub struct Transaction<'env, M: mode::Mode> {
    pub(crate) data: TxnData<'env>,
    mode_data: ModeData<'env>,
    _mode: PhantomData<M>,
}

impl<'env> Transaction<'env, Read> {
    pub(crate) fn new_read(env: &'env Environment<crate::env::state::Open>) -> Result<Self> {
        let inner = env.inner();
        let slot = inner
            .readers
            .begin_read(|| inner.meta().map(|m| m.txnid_fluid()).unwrap_or(TransactionId(0)))?;
        let meta = inner.meta()?;
        let mut databases = HashMap::new();
        databases.insert(None, meta.main_db);
        Ok(Transaction {
            data: TxnData { env, id: meta.txnid_fluid(), databases },
            mode_data: ModeData::ReadOnly { reader_slot: Some(slot) },
            _mode: PhantomData,
        })
    }

    /// Upgrade to a write transaction. The read snapshot is dropped first,
    /// so this fails with `Error::Conflict` only if another writer already
    /// holds the write lock at the moment of the attempt.
    pub fn upgrade(self) -> Result<Transaction<'env, Write>> {
        let env = self.data.env;
        let id = self.data.id;
        if env.inner().write_lock.try_lock().is_none() {
            return Err(Error::Conflict(ConflictDetails {
                txn_id: id,
                conflicting_page: PageId(0),
                operation: Operation::Write,
            }));
        }
        drop(self);
        Transaction::new_write(env)
    }
}

impl<'env> Transaction<'env, Write> {
    pub(crate) fn new_write(env: &'env Environment<crate::env::state::Open>) -> Result<Self> {
        let inner = env.inner();
        let guard = inner.write_lock.lock();
        let meta = inner.meta()?;
        let last_committed = inner.txn_id.load(Ordering::SeqCst).max(meta.txnid_fluid().0);
        let id = TransactionId(last_committed + 1);

        let floor = meta.next_pgno.0.max(inner.next_pgno.load(Ordering::SeqCst));
        inner.next_pgno.store(floor, Ordering::SeqCst);

        let mut databases = HashMap::new();
        databases.insert(None, meta.main_db);

        Ok(Transaction {
            data: TxnData { env, id, databases },
            mode_data: ModeData::ReadWrite(WriteState {
                _write_guard: guard,
                dirty: DirtyList::new(),
                retired: new_pnl("retired"),
                reclaimed: new_pnl("reclaimed"),
                spill_keep: KeepSet::new(),
                spilled: SpillList::new(),
                gc_root: meta.gc_db.root,
                gc_info: meta.gc_db,
                lifo_reclaimed: crate::pnl::new_txl_lifo("lifo-reclaimed"),
                pgno_floor: floor,
                committed: false,
                refilling: false,
            }),
            _mode: PhantomData,
        })
    }

    fn write_state(&self) -> &WriteState<'env> {
        match &self.mode_data {
            ModeData::ReadWrite(ws) => ws,
            ModeData::ReadOnly { .. } => unreachable!("write transaction always carries write state"),
        }
    }

    fn write_state_mut(&mut self) -> &mut WriteState<'env> {
        match &mut self.mode_data {
            ModeData::ReadWrite(ws) => ws,
            ModeData::ReadOnly { .. } => unreachable!("write transaction always carries write state"),
        }
    }

    /// Protect `pgno` from being selected by `maybe_spill`, e.g. because a
    /// live cursor is parked on it.
    pub fn mark_keep(&mut self, pgno: PageId) -> Result<()> {
        self.write_state_mut().spill_keep.mark(pgno)
    }

    fn alloc_pgno(&mut self) -> Result<PageId> {
        if let Some(pgno) = self.write_state_mut().reclaimed.pop_front() {
            return Ok(PageId(pgno));
        }

        if !self.write_state().refilling {
            self.write_state_mut().refilling = true;
            let result = self.refill_reclaimed(8);
            self.write_state_mut().refilling = false;
            result?;
            if let Some(pgno) = self.write_state_mut().reclaimed.pop_front() {
                return Ok(PageId(pgno));
            }
        }

        self.grow_for_tail_bump()?;
        if let Some(pgno) = self.write_state_mut().reclaimed.pop_front() {
            return Ok(PageId(pgno));
        }
        let pgno = self.data.env.inner().next_pgno.fetch_add(1, Ordering::SeqCst);
        Ok(PageId(pgno))
    }

    /// Ensure the mapping is large enough to hand out the next tail pgno,
    /// growing it within `geometry.upper` if needed. If growth is exhausted
    /// and no reclaimed page is available, give the environment's
    /// [`crate::oom::OomHandler`] a chance to evict a laggard reader that is
    /// pinning reclaimable space before giving up with `Error::MapFull`.
    fn grow_for_tail_bump(&mut self) -> Result<()> {
        let inner = self.data.env.inner();
        let next = inner.next_pgno.load(Ordering::SeqCst);
        let page_size = inner.geometry.page_size as u64;
        let needed_bytes = (next + 1) * page_size;

        if needed_bytes <= inner.io.size_in_pages() * page_size {
            return Ok(());
        }

        if needed_bytes <= inner.geometry.upper {
            inner.io.grow(needed_bytes)?;
            return Ok(());
        }

        for retry in 0u32.. {
            let Some(oldest) = inner.readers.find_oldest() else {
                return Err(Error::MapFull);
            };
            let Some(laggard) = inner
                .readers
                .enumerate_readers()
                .into_iter()
                .find(|r| r.txnid == oldest)
            else {
                return Err(Error::MapFull);
            };

            let action = inner.oom_handler.on_laggard(&crate::oom::LaggardReader {
                slot_index: laggard.slot_index,
                pid: laggard.pid,
                tid: laggard.tid,
                txnid: laggard.txnid,
                lag: self.data.id.0.saturating_sub(laggard.txnid.0),
                space_lost: 0,
                retry,
            });

            match action {
                crate::oom::OomAction::Abort | crate::oom::OomAction::Stop => {
                    return Err(Error::MapFull);
                }
                crate::oom::OomAction::InvalidateSlot => {
                    inner.readers.force_invalidate(laggard.slot_index);
                }
                crate::oom::OomAction::ForceReleaseSlot => {
                    inner.readers.force_release(laggard.slot_index);
                }
            }

            self.refill_reclaimed(8)?;
            if !self.write_state().reclaimed.is_empty() {
                return Ok(());
            }
            if retry >= 8 {
                return Err(Error::MapFull);
            }
        }
        unreachable!()
    }

    /// Pull up to `want` reusable pages out of the gc database, consulting
    /// the oldest live reader so nothing still-visible is handed back out.
    fn refill_reclaimed(&mut self, want: usize) -> Result<()> {
        let inner = self.data.env.inner();
        let oldest_reader = inner.readers.find_oldest().unwrap_or(TransactionId(0));
        let policy = inner.reclaim_policy();

        let mut gc_root = self.write_state().gc_root;
        let mut gc_info = self.write_state().gc_info;
        let mut lifo_reclaimed =
            std::mem::replace(&mut self.write_state_mut().lifo_reclaimed, crate::pnl::new_txl_lifo("lifo-reclaimed"));
        let outcome =
            gc::reclaim(self, &mut gc_root, &mut gc_info, oldest_reader, policy, want, &mut lifo_reclaimed)?;

        let ws = self.write_state_mut();
        ws.gc_root = gc_root;
        ws.gc_info = gc_info;
        ws.lifo_reclaimed = lifo_reclaimed;
        for pgno in outcome.pages.iter() {
            ws.reclaimed.append(pgno)?;
        }
        Ok(())
    }

    /// Spec step 2 of the GC update loop ("refund tail pages"): a page this
    /// transaction reclaimed but never handed out that happens to sit right
    /// at the current allocation frontier can be dropped for free by
    /// shrinking the frontier past it, instead of paying to write it back
    /// into a gc entry only for the next transaction to tail-bump past it
    /// anyway.
    fn refund_tail_pages(&mut self) {
        let inner = self.data.env.inner();
        loop {
            let next = inner.next_pgno.load(Ordering::SeqCst);
            let tail = match self.write_state().reclaimed.last() {
                Some(pgno) if pgno + 1 == next => pgno,
                _ => break,
            };
            self.write_state_mut().reclaimed.remove(tail);
            inner.next_pgno.store(tail, Ordering::SeqCst);
        }
    }

    /// Commit-time GC update loop (spec's "subtlest loop"): replay deferred
    /// LIFO bookkeeping, refund reclaimed-but-unused tail pages, fold any
    /// other leftover reclaimed pages back into the retired set, and store
    /// the result as a single gc entry keyed by this txnid — restarting the
    /// whole pass if any of those steps themselves retired more pages than
    /// the previous pass saw, since writing the gc entry dirties gc-tree
    /// pages like any other B+tree mutation. Bounded by
    /// `gc::MAX_GC_UPDATE_ITERS`, since a policy that never stabilizes is a
    /// bug, not a case to loop on forever.
    fn run_gc_update_loop(&mut self) -> Result<()> {
        let txnid = self.data.id;
        let policy = self.data.env.inner().reclaim_policy();

        for attempt in 0..gc::MAX_GC_UPDATE_ITERS {
            if policy == ReclaimPolicy::Lifo && !self.write_state().lifo_reclaimed.is_empty() {
                let mut lifo = std::mem::replace(
                    &mut self.write_state_mut().lifo_reclaimed,
                    crate::pnl::new_txl_lifo("lifo-reclaimed"),
                );
                let mut gc_root = self.write_state().gc_root;
                let mut gc_info = self.write_state().gc_info;
                let before = self.write_state().retired.len();
                let found_stale = gc::replay_lifo_reclaimed(self, &mut gc_root, &mut gc_info, &mut lifo)?;
                let ws = self.write_state_mut();
                ws.gc_root = gc_root;
                ws.gc_info = gc_info;
                ws.lifo_reclaimed = lifo;
                if found_stale || ws.retired.len() != before {
                    continue;
                }
            }

            self.refund_tail_pages();

            let leftover =
                std::mem::replace(&mut self.write_state_mut().reclaimed, new_pnl("reclaimed"));
            if !leftover.is_empty() {
                self.write_state_mut().retired.merge(&leftover)?;
                continue;
            }

            if self.write_state().retired.is_empty() {
                return Ok(());
            }

            let before = self.write_state().retired.len();
            let retired_snapshot = self.write_state().retired.clone();
            let mut gc_root = self.write_state().gc_root;
            let mut gc_info = self.write_state().gc_info;
            gc::retire(self, &mut gc_root, &mut gc_info, txnid, &retired_snapshot)?;
            let ws = self.write_state_mut();
            ws.gc_root = gc_root;
            ws.gc_info = gc_info;
            if ws.retired.len() != before {
                continue;
            }

            debug!(attempt, stored = retired_snapshot.len(), "gc: update loop converged");
            return Ok(());
        }

        Err(Error::GcNotConverged { attempts: gc::MAX_GC_UPDATE_ITERS })
    }

    /// Copy-on-write: return a mutable dirty copy of `page_id`, allocating a
    /// fresh page number for it unless it is already dirty this round.
    pub fn get_page_cow(&mut self, page_id: PageId) -> Result<(PageId, &mut Page)> {
        let inner = self.data.env.inner();
        if page_id.0 >= inner.io.size_in_pages() {
            return Err(Error::InvalidPageId(page_id));
        }

        if self.write_state_mut().dirty.contains(page_id) {
            self.write_state_mut().spilled.unspill(page_id);
            let page = self.write_state_mut().dirty.find_mut(page_id).expect("checked above");
            return Ok((page_id, page));
        }

        let old = inner.io.read_page(page_id)?;
        let new_pgno = self.alloc_pgno()?;
        let mut new_page = Page::new(new_pgno, old.header.flags);
        new_page.header.num_keys = old.header.num_keys;
        new_page.header.lower = old.header.lower;
        new_page.header.upper = old.header.upper;
        new_page.header.overflow = old.header.overflow;
        new_page.header.next_pgno = old.header.next_pgno;
        new_page.header.prev_pgno = old.header.prev_pgno;
        new_page.data.copy_from_slice(&old.data);

        if page_id.0 >= NUM_METAS as u64 {
            self.write_state_mut().retired.insert(page_id.0)?;
        }

        {
            let ws = self.write_state_mut();
            if ws.dirty.len() >= MAX_TXN_PAGES {
                return Err(Error::TxnListFull { what: "transaction page budget", limit: MAX_TXN_PAGES });
            }
            ws.dirty.append(new_pgno, new_page)?;
        }
        let page = self.write_state_mut().dirty.find_mut(new_pgno).expect("just inserted");
        Ok((new_pgno, page))
    }

    /// Allocate a fresh page, not a copy of anything.
    pub fn alloc_page(&mut self, flags: PageFlags) -> Result<(PageId, &mut Page)> {
        if self.write_state().dirty.len() >= MAX_TXN_PAGES {
            return Err(Error::TxnListFull { what: "transaction page budget", limit: MAX_TXN_PAGES });
        }
        let pgno = self.alloc_pgno()?;
        let page = Page::new(pgno, flags);
        self.write_state_mut().dirty.append(pgno, page)?;
        let page = self.write_state_mut().dirty.find_mut(pgno).expect("just inserted");
        Ok((pgno, page))
    }

    /// Mutable access to a page already known to be dirty this round (e.g.
    /// patching a pointer in a page just returned by `alloc_page`). Falls
    /// back to `get_page_cow` for a page that isn't dirty yet.
    pub fn get_page_mut(&mut self, page_id: PageId) -> Result<&mut Page> {
        if self.write_state_mut().dirty.contains(page_id) {
            return Ok(self.write_state_mut().dirty.find_mut(page_id).expect("checked above"));
        }
        let (_, page) = self.get_page_cow(page_id)?;
        Ok(page)
    }

    /// Free a single page: meta pages may never be freed, and a page
    /// allocated earlier in this same transaction is simply dropped from
    /// the dirty list rather than round-tripped through the gc database.
    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if page_id.0 < NUM_METAS as u64 {
            return Err(Error::InvalidOperation("cannot free a meta page"));
        }
        let inner = self.data.env.inner();
        if page_id.0 >= inner.io.size_in_pages() && !self.write_state_mut().dirty.contains(page_id) {
            return Err(Error::InvalidPageId(page_id));
        }
        self.write_state_mut().dirty.remove(page_id);
        self.write_state_mut().spilled.unspill(page_id);
        self.write_state_mut().retired.insert(page_id.0)?;
        Ok(())
    }

    /// Free `count` consecutively numbered pages starting at `start_page_id`.
    pub fn free_pages(&mut self, start_page_id: PageId, count: u64) -> Result<()> {
        for i in 0..count {
            self.free_page(PageId(start_page_id.0 + i))?;
        }
        Ok(())
    }

    /// Flush roughly one eighth of the dirty list to disk early once it
    /// exceeds `budget_pages`, without yet making the pages visible (the
    /// meta page still points at the pre-spill root). Returns how many
    /// pages were spilled.
    pub fn maybe_spill(&mut self, budget_pages: usize) -> Result<usize> {
        let inner = self.data.env.inner();
        let plan = {
            let ws = self.write_state();
            spill::plan_spill(&ws.dirty, budget_pages, &ws.spill_keep)
        };
        for pgno in &plan {
            let ws = self.write_state_mut();
            if let Some(page) = ws.dirty.find(*pgno) {
                inner.io.write_page(page)?;
            }
            ws.spilled.mark_spilled(*pgno)?;
        }
        Ok(plan.len())
    }

    /// Begin a nested write transaction layered on top of this one. Only
    /// one may be open at a time, enforced by the exclusive `&mut` borrow
    /// it holds of `self`; its writes are invisible to this transaction
    /// until `commit()`, and vanish entirely if dropped without committing.
    pub fn begin_nested(&mut self) -> NestedTransaction<'_, 'env> {
        let pgno_floor = self.data.env.inner().next_pgno.load(Ordering::SeqCst);
        NestedTransaction {
            parent: self,
            dirty: DirtyList::new(),
            retired: new_pnl("nested-retired"),
            pgno_floor,
            committed: false,
        }
    }

    /// Commit this transaction: retire freed/replaced pages into the gc
    /// database, flush dirty pages, and write a new meta page into the
    /// most-ancient of the three rotating slots.
    #[instrument(skip(self), fields(txn = self.data.id.0))]
    pub fn commit(mut self) -> Result<()> {
        let inner = self.data.env.inner();

        if self.write_state().dirty.is_empty()
            && self.write_state().retired.is_empty()
            && self.write_state().reclaimed.is_empty()
            && self.write_state().lifo_reclaimed.is_empty()
        {
            debug!("commit: nothing to do, releasing write lock");
            self.write_state_mut().committed = true;
            return Ok(());
        }

        let txnid = self.data.id;
        self.run_gc_update_loop()?;
        let retired = self.write_state().retired.clone();

        let main_info = *self.data.databases.get(&None).ok_or(Error::InvalidDatabase)?;

        let metas = inner.read_metas()?;
        let policy = inner.meta_select_policy;
        let base = metas[crate::meta::select(&metas, policy)];
        let write_slot = crate::meta::ancient(&metas, policy);

        let mut new_meta = base;
        new_meta.main_db = main_info;
        new_meta.gc_db = self.write_state().gc_info;
        new_meta.next_pgno = PageId(inner.next_pgno.load(Ordering::SeqCst));
        new_meta.pages_retired = base.pages_retired + retired.len() as u64;
        new_meta.begin_write(txnid);

        for (_, page) in self.write_state().dirty.iter() {
            inner.io.write_page(page)?;
        }

        let data_synced = match inner.durability {
            DurabilityMode::NoSync => false,
            _ => {
                inner.io.sync()?;
                true
            }
        };

        let sign = if !data_synced {
            DurabilitySign::None
        } else if inner.flags.contains(EnvFlags::NOMETASYNC) || inner.durability == DurabilityMode::AsyncFlush {
            DurabilitySign::Weak
        } else {
            DurabilitySign::Steady
        };
        new_meta.end_write(sign);

        let meta_page = new_meta.to_page(PageId(write_slot as u64));
        inner.io.write_page(&meta_page)?;
        if sign == DurabilitySign::Steady {
            inner.io.sync()?;
        }

        inner.txn_id.store(txnid.0, Ordering::SeqCst);
        if let Ok(mut dbs) = inner.databases.write() {
            *dbs = self.data.databases.clone();
        }

        debug!(slot = write_slot, ?sign, "commit: meta page written");
        self.write_state_mut().committed = true;
        Ok(())
    }
}

impl<'env, M: mode::Mode> Transaction<'env, M> {
    /// This transaction's id: the snapshot it reads for a read transaction,
    /// or the id it will commit under for a write transaction.
    pub fn id(&self) -> TransactionId {
        self.data.id
    }

    /// Abandon this transaction. A no-op beyond what `Drop` already does;
    /// offered so callers can make the intent explicit at a call site.
    pub fn abort(self) {}

    /// Read a page, preferring this transaction's own dirty copy if one
    /// exists (write mode only; read transactions never have one).
    pub fn get_page(&self, page_id: PageId) -> Result<&Page> {
        let inner = self.data.env.inner();
        if page_id.0 >= inner.io.size_in_pages() {
            return Err(Error::InvalidPageId(page_id));
        }
        if let ModeData::ReadWrite(ws) = &self.mode_data {
            if let Some(page) = ws.dirty.get(page_id) {
                return Ok(page);
            }
        }
        unsafe { inner.io.get_page_ref(page_id) }
    }

    /// Look up a named (or default, `None`) database's root/stats as this
    /// transaction currently sees them.
    pub fn db_info(&self, name: Option<&str>) -> Result<&DbInfo> {
        self.data.databases.get(&name.map(str::to_string)).ok_or(Error::InvalidDatabase)
    }

    /// Record a new root/stats for a named database, visible to this
    /// transaction from now on and persisted at commit.
    pub fn update_db_info(&mut self, name: Option<&str>, info: DbInfo) -> Result<()> {
        self.data.databases.insert(name.map(|s| s.to_string()), info);
        Ok(())
    }
}

impl<'env, M: mode::Mode> Drop for Transaction<'env, M> {
    fn drop(&mut self) {
        match &mut self.mode_data {
            ModeData::ReadOnly { reader_slot } => {
                if let Some(slot) = reader_slot.take() {
                    self.data.env.inner().readers.release(slot);
                }
            }
            ModeData::ReadWrite(ws) => {
                if !ws.committed {
                    let inner = self.data.env.inner();
                    inner.next_pgno.store(ws.pgno_floor, Ordering::SeqCst);
                    if !ws.dirty.is_empty() {
                        debug!(dirty = ws.dirty.len(), "write transaction aborted, discarding dirty pages");
                    }
                }
            }
        }
    }
}

/// A write transaction layered on top of a parent [`Transaction<Write>`].
///
/// Its writes are only visible through its own `get_page`/`get_page_cow`
/// until [`NestedTransaction::commit`] folds them into the parent; the
/// parent itself is still not durable until it, in turn, commits.
pub struct NestedTransaction<'p, 'env> {
    parent: &'p mut Transaction<'env, Write>,
    dirty: DirtyList,
    retired: IdList,
    pgno_floor: u64,
    committed: bool,
}

impl<'p, 'env> NestedTransaction<'p, 'env> {
    pub fn id(&self) -> TransactionId {
        self.parent.id()
    }

    pub fn get_page(&self, page_id: PageId) -> Result<&Page> {
        if let Some(page) = self.dirty.get(page_id) {
            return Ok(page);
        }
        self.parent.get_page(page_id)
    }

    fn alloc_pgno(&mut self) -> Result<PageId> {
        let pgno = self.parent.data.env.inner().next_pgno.fetch_add(1, Ordering::SeqCst);
        Ok(PageId(pgno))
    }

    pub fn get_page_cow(&mut self, page_id: PageId) -> Result<(PageId, &mut Page)> {
        if self.dirty.contains(page_id) {
            let page = self.dirty.find_mut(page_id).expect("checked above");
            return Ok((page_id, page));
        }

        let (header, data) = {
            let source = self.get_page(page_id)?;
            (source.header, source.data)
        };
        let new_pgno = self.alloc_pgno()?;
        let mut new_page = Page::new(new_pgno, header.flags);
        new_page.header = header;
        new_page.header.pgno = new_pgno.0;
        new_page.data = data;

        if page_id.0 >= NUM_METAS as u64 {
            self.retired.insert(page_id.0)?;
        }
        self.dirty.append(new_pgno, new_page)?;
        let page = self.dirty.find_mut(new_pgno).expect("just inserted");
        Ok((new_pgno, page))
    }

    pub fn alloc_page(&mut self, flags: PageFlags) -> Result<(PageId, &mut Page)> {
        let pgno = self.alloc_pgno()?;
        let page = Page::new(pgno, flags);
        self.dirty.append(pgno, page)?;
        let page = self.dirty.find_mut(pgno).expect("just inserted");
        Ok((pgno, page))
    }

    pub fn free_page(&mut self, page_id: PageId) -> Result<()> {
        if page_id.0 < NUM_METAS as u64 {
            return Err(Error::InvalidOperation("cannot free a meta page"));
        }
        self.dirty.remove(page_id);
        self.retired.insert(page_id.0)?;
        Ok(())
    }

    pub fn db_info(&self, name: Option<&str>) -> Result<&DbInfo> {
        self.parent.db_info(name)
    }

    pub fn update_db_info(&mut self, name: Option<&str>, info: DbInfo) -> Result<()> {
        self.parent.update_db_info(name, info)
    }

    /// Fold this nested transaction's dirty pages and retired list into the
    /// parent. The parent does not become durable until it, in turn,
    /// commits.
    pub fn commit(mut self) -> Result<()> {
        let child_dirty = self.dirty.drain();
        let child_retired = std::mem::replace(&mut self.retired, new_pnl("nested-retired"));
        self.parent.write_state_mut().dirty.merge_from_child(child_dirty)?;
        self.parent.write_state_mut().retired.merge(&child_retired)?;
        self.committed = true;
        Ok(())
    }

    /// Discard every page this nested transaction touched.
    pub fn abort(self) {}
}

impl<'p, 'env> Drop for NestedTransaction<'p, 'env> {
    fn drop(&mut self) {
        if !self.committed {
            // No other allocation could have interleaved with ours: the
            // exclusive `&mut Transaction<Write>` borrow this struct holds
            // means the parent could not itself allocate while we're alive.
            let inner = self.parent.data.env.inner();
            inner.next_pgno.store(self.pgno_floor, Ordering::SeqCst);
            if !self.dirty.is_empty() {
                debug!(dirty = self.dirty.len(), "nested transaction aborted, discarding writes");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvBuilder;

    fn open_env() -> (tempfile::TempDir, Environment<crate::env::state::Open>) {
        let dir = tempfile::TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(1 << 20).open(dir.path()).unwrap();
        (dir, env)
    }

    #[test]
    fn read_and_write_transactions_can_be_created() {
        let (_dir, env) = open_env();
        let read = env.read_txn().unwrap();
        let read_id = read.id();
        drop(read);

        let write = env.write_txn().unwrap();
        assert!(write.id().0 > read_id.0);
    }

    #[test]
    fn only_one_write_transaction_at_a_time() {
        let (_dir, env) = open_env();
        let write = env.write_txn().unwrap();
        assert!(env.inner().write_lock.try_lock().is_none());
        drop(write);
        assert!(env.inner().write_lock.try_lock().is_some());
    }

    #[test]
    fn a_read_snapshot_does_not_see_a_later_writers_allocations() {
        let (_dir, env) = open_env();
        let reader = env.read_txn().unwrap();

        let mut writer = env.write_txn().unwrap();
        let (pgno, _) = writer.alloc_page(PageFlags::LEAF).unwrap();
        writer.commit().unwrap();

        assert!(reader.get_page(pgno).is_err());
    }

    #[test]
    fn aborting_a_write_transaction_rolls_back_its_allocations() {
        let (_dir, env) = open_env();
        let before = env.inner().next_pgno.load(Ordering::SeqCst);

        {
            let mut txn = env.write_txn().unwrap();
            txn.alloc_page(PageFlags::LEAF).unwrap();
            txn.alloc_page(PageFlags::LEAF).unwrap();
            // dropped without commit
        }

        assert_eq!(env.inner().next_pgno.load(Ordering::SeqCst), before);
    }

    #[test]
    fn committing_persists_across_a_fresh_read_transaction() {
        let (_dir, env) = open_env();
        let mut txn = env.write_txn().unwrap();
        let (pgno, page) = txn.alloc_page(PageFlags::LEAF).unwrap();
        page.header.num_keys = 0;
        txn.commit().unwrap();

        let read = env.read_txn().unwrap();
        assert!(read.get_page(pgno).is_ok());
    }

    #[test]
    fn nested_transaction_commit_folds_into_parent() {
        let (_dir, env) = open_env();
        let mut parent = env.write_txn().unwrap();

        let pgno = {
            let mut nested = parent.begin_nested();
            let (pgno, _) = nested.alloc_page(PageFlags::LEAF).unwrap();
            nested.commit().unwrap();
            pgno
        };

        assert!(parent.get_page(pgno).is_ok());
        parent.commit().unwrap();

        let read = env.read_txn().unwrap();
        assert!(read.get_page(pgno).is_ok());
    }

    #[test]
    fn nested_transaction_abort_discards_its_allocations() {
        let (_dir, env) = open_env();
        let mut parent = env.write_txn().unwrap();
        let before = env.inner().next_pgno.load(Ordering::SeqCst);

        {
            let mut nested = parent.begin_nested();
            nested.alloc_page(PageFlags::LEAF).unwrap();
            // dropped without commit
        }

        assert_eq!(env.inner().next_pgno.load(Ordering::SeqCst), before);
    }

    #[test]
    fn retired_pages_become_reclaimable_after_a_free_and_commit() {
        let (_dir, env) = open_env();

        let mut txn = env.write_txn().unwrap();
        let (pgno, _) = txn.alloc_page(PageFlags::LEAF).unwrap();
        txn.commit().unwrap();

        let mut txn = env.write_txn().unwrap();
        txn.free_page(pgno).unwrap();
        txn.commit().unwrap();

        let mut txn = env.write_txn().unwrap();
        txn.refill_reclaimed(1).unwrap();
        assert_eq!(txn.write_state().reclaimed.as_slice(), &[pgno.0]);
        txn.commit().unwrap();

        env.audit().unwrap();
    }

    /// A page pulled out of the gc tree by `refill_reclaimed` but never
    /// actually handed out before commit must not simply vanish: the GC
    /// update loop has to fold it back in (either as a tail refund or a
    /// fresh gc entry), or `env.audit()`'s page-accounting identity would
    /// drift with every such commit.
    #[test]
    fn unused_reclaimed_pages_are_not_leaked_at_commit() {
        let (_dir, env) = open_env();

        let mut freed = Vec::new();
        {
            let mut txn = env.write_txn().unwrap();
            for _ in 0..4 {
                let (pgno, _) = txn.alloc_page(PageFlags::LEAF).unwrap();
                freed.push(pgno);
            }
            txn.commit().unwrap();
        }
        {
            let mut txn = env.write_txn().unwrap();
            for pgno in &freed {
                txn.free_page(*pgno).unwrap();
            }
            txn.commit().unwrap();
        }

        {
            let mut txn = env.write_txn().unwrap();
            // Pull every retired page into `reclaimed` but allocate nothing,
            // leaving the whole batch unused at commit time.
            txn.refill_reclaimed(4).unwrap();
            assert_eq!(txn.write_state().reclaimed.len(), 4);
            txn.commit().unwrap();
        }

        env.audit().unwrap();

        // The pages must still be visible to the gc subtree or the
        // allocation frontier — not silently dropped on the floor.
        let txn = env.write_txn().unwrap();
        let pending = crate::gc::pending_count(&txn, txn.write_state().gc_root).unwrap();
        let frontier = env.inner().next_pgno.load(Ordering::SeqCst);
        assert!(pending > 0 || frontier < 3 + freed.len() as u64 + 1);
    }

    #[test]
    fn gc_update_loop_converges_under_lifo_policy() {
        let dir = tempfile::TempDir::new().unwrap();
        let env = EnvBuilder::new()
            .map_size(1 << 20)
            .flags(EnvFlags::LIFORECLAIM)
            .open(dir.path())
            .unwrap();

        let mut freed = Vec::new();
        {
            let mut txn = env.write_txn().unwrap();
            for _ in 0..3 {
                let (pgno, _) = txn.alloc_page(PageFlags::LEAF).unwrap();
                freed.push(pgno);
            }
            txn.commit().unwrap();
        }
        {
            let mut txn = env.write_txn().unwrap();
            for pgno in &freed {
                txn.free_page(*pgno).unwrap();
            }
            txn.commit().unwrap();
        }

        {
            let mut txn = env.write_txn().unwrap();
            let (_, _) = txn.alloc_page(PageFlags::LEAF).unwrap();
            txn.commit().unwrap();
        }

        env.audit().unwrap();
    }
}
