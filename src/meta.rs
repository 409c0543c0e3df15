//! Meta-page manager: three rotating control pages and MVCC root selection
//!
//! Every commit writes exactly one meta-page (never the one most recently
//! read as "head"), so a crash mid-write always leaves at least one older,
//! intact meta-page to recover from. Selection among the three is driven
//! purely by (durability, txnid-consistency, txnid) — see
//! [`DurabilitySign`] and [`select`].

use crate::error::{Error, PageId, Result, TransactionId};
use crate::page::{Page, PageFlags, PAGE_SIZE};
use static_assertions::const_assert;
use std::mem::size_of;

/// Number of meta-pages that rotate at the head of the file.
pub const NUM_METAS: usize = 3;

/// Database format version.
pub const DB_VERSION: u32 = 1;

/// Magic word; also encodes host endianness so a mismatched-endian file is
/// rejected as `VERSION_MISMATCH` rather than silently misread.
pub const MAGIC: u32 = 0xBEEF_C0DE;

/// Canary quadruple written into every meta-page; a corrupted meta-page
/// whose canary doesn't match byte-for-byte across its two copies is
/// rejected before any of its root pointers are trusted.
pub const CANARY: [u64; 4] = [0x9E37_79B9_7F4A_7C15, 0xC2B2_AE3D_27D4_EB4F, 0x1656_67B1_9E37_79F9, 0xFF51_AFD7_ED55_8CCD];

/// Statistics for a single B+tree (subdb or built-in).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
    /// Page size this tree was built with.
    pub psize: u32,
    /// Depth of the tree (1 == root is a leaf).
    pub depth: u32,
    /// Branch page count.
    pub branch_pages: u64,
    /// Leaf page count.
    pub leaf_pages: u64,
    /// Overflow page count.
    pub overflow_pages: u64,
    /// Entry count.
    pub entries: u64,
}

/// Root pointer and counters for one named B+tree, as stored either inline
/// in a meta-page (maindb, GC) or as a catalog record (§3.1).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DbInfo {
    /// Database flags (`DatabaseFlags` bits).
    pub flags: u32,
    /// Tree depth.
    pub depth: u32,
    /// Branch page count.
    pub branch_pages: u64,
    /// Leaf page count.
    pub leaf_pages: u64,
    /// Overflow page count.
    pub overflow_pages: u64,
    /// Entry count.
    pub entries: u64,
    /// Root page number.
    pub root: PageId,
    /// Last-touched leaf, cached for append-mode inserts (0 == unset).
    pub last_key_page: PageId,
}

impl Default for DbInfo {
    fn default() -> Self {
        Self {
            flags: 0,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: PageId(0),
            last_key_page: PageId(0),
        }
    }
}

/// Durability state of a meta-page (GLOSSARY: Steady / weak / none).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DurabilitySign {
    /// Crash-visible inconsistency; never trusted as head.
    None = 0,
    /// Written but not fsynced.
    Weak = 1,
    /// Durably on disk.
    Steady = 2,
}

/// One of the three rotating control pages.
///
/// `txnid_a`/`txnid_b` are the header and trailer copies of the same
/// value (invariant 4 in §3.2: `meta_txnid_fluid` is only trusted when
/// they agree). `sign` is recomputed over geometry+roots+canary at the end
/// of a write and compared against the stored value to detect a torn body.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MetaPage {
    /// Magic word.
    pub magic: u32,
    /// Format version.
    pub version: u32,
    /// Header copy of the committing txnid.
    pub txnid_a: u64,
    /// Durability sign as of the last `end` step.
    pub sign: DurabilitySign,
    /// Database-wide flags.
    pub flags: u32,
    /// Page size this environment was opened with.
    pub psize: u32,
    /// Configured reader-slot capacity.
    pub maxreaders: u32,
    /// Lower geometry bound, in pages.
    pub geo_lower: u64,
    /// Current mapped size, in pages.
    pub geo_now: u64,
    /// Upper geometry bound, in pages.
    pub geo_upper: u64,
    /// Growth step, in pages.
    pub geo_grow: u64,
    /// Shrink threshold, in pages (0 == shrink disabled).
    pub geo_shrink: u64,
    /// One past the highest in-use page number.
    pub next_pgno: PageId,
    /// Root + stats of the main database.
    pub main_db: DbInfo,
    /// Root + stats of the GC (free-space manager) subtree.
    pub gc_db: DbInfo,
    /// Canary, validated byte-for-byte.
    pub canary: [u64; 4],
    /// Count of pages retired as of this snapshot (monotonic, informational).
    pub pages_retired: u64,
    /// Trailer copy of the committing txnid.
    pub txnid_b: u64,
}

impl MetaPage {
    /// Build a fresh, empty-database meta-page for initial format.
    pub fn new(psize: u32, maxreaders: u32) -> Self {
        Self {
            magic: MAGIC,
            version: DB_VERSION,
            txnid_a: 0,
            sign: DurabilitySign::Steady,
            flags: 0,
            psize,
            maxreaders,
            geo_lower: 0,
            geo_now: 0,
            geo_upper: 0,
            geo_grow: 0,
            geo_shrink: 0,
            next_pgno: PageId(NUM_METAS as u64),
            main_db: DbInfo::default(),
            gc_db: DbInfo::default(),
            canary: CANARY,
            pages_retired: 0,
            txnid_b: 0,
        }
    }

    /// Header/trailer txnid if they agree, else `0` (a torn write; §4.4).
    pub fn txnid_fluid(&self) -> TransactionId {
        if self.txnid_a == self.txnid_b {
            TransactionId(self.txnid_a)
        } else {
            TransactionId(0)
        }
    }

    pub(crate) fn format_ok(&self) -> bool {
        self.magic == MAGIC && self.version == DB_VERSION && self.canary == CANARY
    }

    /// Validate static format fields (magic/version/page size/canary); does
    /// not judge durability, which `select` handles across all three metas.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Corruption {
                details: format!("bad meta magic: 0x{:x}", self.magic),
                page_id: None,
            });
        }
        if self.version != DB_VERSION {
            return Err(Error::VersionMismatch { expected: DB_VERSION, found: self.version });
        }
        if self.canary != CANARY {
            return Err(Error::Corruption { details: "meta canary mismatch".into(), page_id: None });
        }
        Ok(())
    }

    /// Step 1 of a two-step meta write: bump the header txnid and mark the
    /// page weak before any content is copied in (§4.4).
    pub fn begin_write(&mut self, txnid: TransactionId) {
        self.txnid_a = txnid.0;
        self.sign = DurabilitySign::None;
    }

    /// Step 2: content has been copied in; mark durability and close the
    /// write by bumping the trailer txnid. A memory fence must separate
    /// this from any reader that might observe the page concurrently.
    pub fn end_write(&mut self, sign: DurabilitySign) {
        self.sign = sign;
        self.txnid_b = self.txnid_a;
    }

    /// Render into a page buffer for writing.
    pub fn to_page(&self, pgno: PageId) -> Box<Page> {
        let mut page = Page::new(pgno, PageFlags::META);
        unsafe {
            let meta_ptr = page.data.as_mut_ptr() as *mut MetaPage;
            std::ptr::write_unaligned(meta_ptr, *self);
        }
        page
    }

    /// Read out of a page buffer without requiring alignment.
    pub fn from_page(page: &Page) -> Result<Self> {
        if !page.header.flags.contains(PageFlags::META) {
            return Err(Error::InvalidPageType {
                expected: crate::error::PageType::Meta,
                found: page.header.page_type(),
            });
        }
        let meta = unsafe { std::ptr::read_unaligned(page.data.as_ptr() as *const MetaPage) };
        meta.validate()?;
        Ok(meta)
    }
}

const_assert!(size_of::<MetaPage>() < PAGE_SIZE - size_of::<crate::page::PageHeader>());

/// Meta-page selection policy (§4.4). Each compares two candidates and
/// returns the preferred one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    /// Highest txnid wins regardless of durability (`head`).
    PreferLast,
    /// Steady+weak beats weak+only, else highest txnid.
    PreferNoWeak,
    /// Steady beats weak beats none, else highest txnid (`steady`).
    PreferSteady,
}

fn rank(meta: &MetaPage) -> (u32, u64) {
    let fluid = meta.txnid_fluid();
    let sign_rank = if fluid.0 == 0 { 0 } else { meta.sign as u32 + 1 };
    (sign_rank, fluid.0)
}

fn prefer(policy: SelectPolicy, a: &MetaPage, b: &MetaPage) -> bool {
    let (ra, ta) = rank(a);
    let (rb, tb) = rank(b);
    match policy {
        SelectPolicy::PreferLast => ta >= tb,
        SelectPolicy::PreferNoWeak => {
            let weak_a = a.sign == DurabilitySign::Weak;
            let weak_b = b.sign == DurabilitySign::Weak;
            if weak_a != weak_b {
                !weak_a
            } else {
                ta >= tb
            }
        }
        SelectPolicy::PreferSteady => {
            if ra != rb {
                ra > rb
            } else {
                ta >= tb
            }
        }
    }
}

/// Choose the preferred meta among all three slots under `policy`.
///
/// `head` is `select(metas, SelectPolicy::PreferLast)`; `steady` is
/// `select(metas, SelectPolicy::PreferSteady)`.
pub fn select(metas: &[MetaPage; NUM_METAS], policy: SelectPolicy) -> usize {
    let mut best = 0;
    for i in 1..NUM_METAS {
        if prefer(policy, &metas[i], &metas[best]) {
            best = i;
        }
    }
    best
}

/// Index of the oldest meta under `policy` — the natural target to
/// overwrite on the next commit so at least two older copies always
/// survive a crash mid-write.
pub fn ancient(metas: &[MetaPage; NUM_METAS], policy: SelectPolicy) -> usize {
    let mut worst = 0;
    for i in 1..NUM_METAS {
        if prefer(policy, &metas[worst], &metas[i]) {
            worst = i;
        }
    }
    worst
}

/// 3-bit mask of which meta-page pairs carry identical `(sign, txnid)`.
/// Any non-zero result across committed state indicates that a write was
/// duplicated onto two slots instead of rotating, a corruption signal.
pub fn eq_mask(metas: &[MetaPage; NUM_METAS]) -> u8 {
    let mut mask = 0u8;
    for (bit, (i, j)) in [(0, 1), (1, 2), (0, 2)].into_iter().enumerate() {
        if rank(&metas[i]) == rank(&metas[j]) && metas[i].txnid_fluid().0 != 0 {
            mask |= 1 << bit;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_at(txnid: u64, sign: DurabilitySign) -> MetaPage {
        let mut m = MetaPage::new(PAGE_SIZE as u32, 126);
        m.begin_write(TransactionId(txnid));
        m.end_write(sign);
        m
    }

    #[test]
    fn round_trips_through_a_page() {
        let meta = meta_at(5, DurabilitySign::Steady);
        let page = meta.to_page(PageId(0));
        let back = MetaPage::from_page(&page).unwrap();
        assert_eq!(back.txnid_fluid(), TransactionId(5));
    }

    #[test]
    fn torn_write_reports_txnid_zero() {
        let mut m = meta_at(5, DurabilitySign::Steady);
        m.txnid_a = 6; // simulate a crash between begin_write and end_write
        assert_eq!(m.txnid_fluid(), TransactionId(0));
    }

    #[test]
    fn head_prefers_highest_txnid_regardless_of_durability() {
        let metas = [meta_at(1, DurabilitySign::Steady), meta_at(3, DurabilitySign::Weak), meta_at(2, DurabilitySign::Steady)];
        assert_eq!(select(&metas, SelectPolicy::PreferLast), 1);
    }

    #[test]
    fn steady_skips_a_newer_weak_meta() {
        let metas = [meta_at(1, DurabilitySign::Steady), meta_at(3, DurabilitySign::Weak), meta_at(2, DurabilitySign::Steady)];
        assert_eq!(select(&metas, SelectPolicy::PreferSteady), 2);
    }

    #[test]
    fn ancient_picks_the_lowest_ranked_slot_for_overwrite() {
        let metas = [meta_at(1, DurabilitySign::Steady), meta_at(3, DurabilitySign::Weak), meta_at(2, DurabilitySign::Steady)];
        assert_eq!(ancient(&metas, SelectPolicy::PreferSteady), 0);
    }
}
