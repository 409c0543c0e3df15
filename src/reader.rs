//! Reader slot table for MVCC snapshot tracking
//!
//! Readers never block the writer and the writer never blocks readers:
//! each reader publishes the txnid of the snapshot it holds into a slot in
//! this table, and the writer's `find_oldest` takes the minimum over all
//! live slots to know which GC entries are safe to reclaim.

use crate::error::{Error, Result, TransactionId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Default number of reader slots.
pub const MAX_READERS: usize = 126;

/// Sentinel high-word written before the low word during a safe-64 update,
/// so a concurrent reader observing a torn value knows to retry rather than
/// trust it.
const TXNID_SENTINEL: u64 = u64::MAX;

/// A single slot in the shared reader table.
///
/// Fields are independent atomics rather than one lock: a reader claims a
/// slot with a CAS on `pid`, then publishes `tid`/`txnid`/`timestamp`. Other
/// readers and the writer only ever load these fields, so the table never
/// needs a mutex for the steady-state path (see §4.5/§5 suspension points:
/// the reader-table mutex guards slot *allocation*, not every read).
#[repr(C)]
#[derive(Debug)]
pub struct ReaderSlot {
    pid: AtomicU32,
    tid: AtomicU64,
    /// Chosen snapshot txnid, written via the safe-64 protocol (§4.5).
    txnid: AtomicU64,
    timestamp: AtomicU64,
    /// Pages retired by transactions newer than this reader's snapshot, as
    /// observed the last time the writer refreshed its oldest-reader cache.
    pages_retired: AtomicU64,
}

impl Default for ReaderSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderSlot {
    /// Create an empty (unclaimed) slot.
    pub fn new() -> Self {
        Self {
            pid: AtomicU32::new(0),
            tid: AtomicU64::new(0),
            txnid: AtomicU64::new(0),
            timestamp: AtomicU64::new(0),
            pages_retired: AtomicU64::new(0),
        }
    }

    /// Whether the slot currently holds no reader.
    pub fn is_free(&self) -> bool {
        self.pid.load(Ordering::Acquire) == 0
    }

    /// Read the slot's txnid using the safe-64 protocol: on platforms where
    /// a 64-bit store is not naturally atomic, the sentinel high word is
    /// visible mid-update and callers must retry. On a native 64-bit atomic
    /// this degenerates to a single load, which is what we use here (Rust's
    /// `AtomicU64` already guarantees whole-word visibility on every target
    /// tier-1 platform); the enum keeps the *protocol* explicit so a future
    /// 32-bit backend only has to change `load_txnid`'s body.
    pub fn load_txnid(&self) -> SafeTxnid {
        let v = self.txnid.load(Ordering::Acquire);
        if v == TXNID_SENTINEL {
            SafeTxnid::Invalid
        } else {
            SafeTxnid::Valid(v)
        }
    }

    fn store_txnid(&self, txnid: u64) {
        self.txnid.store(TXNID_SENTINEL, Ordering::Release);
        self.txnid.store(txnid, Ordering::Release);
    }

    /// Try to claim this slot for a new reader.
    pub fn try_acquire(&self) -> bool {
        let pid = std::process::id();
        self.pid.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Publish the chosen snapshot. Must be called only by the thread that
    /// just `try_acquire`d the slot.
    pub fn publish(&self, tid: u64, txnid: TransactionId) {
        self.store_txnid(TXNID_SENTINEL);
        self.tid.store(tid, Ordering::Release);
        self.timestamp.store(current_timestamp(), Ordering::Release);
        self.store_txnid(txnid.0);
    }

    /// Release the slot back to the free pool.
    pub fn release(&self) {
        self.txnid.store(0, Ordering::Release);
        self.tid.store(0, Ordering::Release);
        self.timestamp.store(0, Ordering::Release);
        self.pages_retired.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }

    /// Whether the owning process appears to have died without releasing.
    pub fn is_stale(&self) -> bool {
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 {
            return false;
        }

        #[cfg(unix)]
        {
            unsafe { libc::kill(pid as i32, 0) != 0 }
        }

        #[cfg(not(unix))]
        {
            let timestamp = self.timestamp.load(Ordering::Acquire);
            current_timestamp().saturating_sub(timestamp) > 300_000_000_000
        }
    }
}

/// Result of a safe-64 load: either the torn-write sentinel (retry) or a
/// value that was fully visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeTxnid {
    /// A concurrent writer's update is in flight; reread.
    Invalid,
    /// A stable value.
    Valid(u64),
}

/// The shared reader table: one slot per potential concurrent reader.
///
/// In a real deployment this array lives in a separately mmapped lock
/// file so readers in other processes can see it; within a single address
/// space a `Vec` behind the environment's `Arc` serves the same role.
pub struct ReaderTable {
    slots: Vec<ReaderSlot>,
    /// Cleared before `find_oldest` scans the table; if still clear when
    /// the scan finishes, no writer-visible state changed and the cached
    /// oldest value is still valid for the *next* caller (§4.5's
    /// `mti_readers_refresh_flag`).
    refresh_flag: AtomicBool,
}

impl ReaderTable {
    /// Allocate a table with `max_readers` slots.
    pub fn new(max_readers: usize) -> Self {
        let mut slots = Vec::with_capacity(max_readers);
        slots.resize_with(max_readers, ReaderSlot::new);
        Self { slots, refresh_flag: AtomicBool::new(true) }
    }

    /// Begin a read snapshot at `head_txnid`, retrying on the ITS#7970
    /// race where the head meta-page advances between the slot publish and
    /// the re-read (§4.5 step 4).
    pub fn begin_read<F>(&self, mut read_head_txnid: F) -> Result<usize>
    where
        F: FnMut() -> TransactionId,
    {
        let slot_index = self.claim_slot()?;
        let slot = &self.slots[slot_index];

        loop {
            let txnid = read_head_txnid();
            slot.publish(thread_id(), txnid);
            std::sync::atomic::fence(Ordering::SeqCst);
            let now = read_head_txnid();
            if now == txnid {
                self.refresh_flag.store(true, Ordering::Release);
                return Ok(slot_index);
            }
            // head moved under us: retry with the fresher snapshot.
        }
    }

    fn claim_slot(&self) -> Result<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.try_acquire() {
                return Ok(i);
            }
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_stale() {
                warn!(pid = slot.pid.load(Ordering::Acquire), "reaping dead reader slot");
                slot.release();
                if slot.try_acquire() {
                    return Ok(i);
                }
            }
        }
        Err(Error::ReadersFull)
    }

    /// Release a reader slot.
    pub fn release(&self, slot_index: usize) {
        if let Some(slot) = self.slots.get(slot_index) {
            slot.release();
        }
    }

    /// Record how many pages the owning reader's snapshot has had retired
    /// out from under it, for introspection (`mr_txnid`/pages-retired
    /// counters in §3.1).
    pub fn note_pages_retired(&self, slot_index: usize, count: u64) {
        if let Some(slot) = self.slots.get(slot_index) {
            slot.pages_retired.store(count, Ordering::Relaxed);
        }
    }

    /// The detent: minimum live `txnid` across all slots, or `None` if no
    /// reader is active. GC entries with txnid <= detent are reclaimable.
    pub fn find_oldest(&self) -> Option<TransactionId> {
        // The fast-path flag only changes the cost of this scan, never its
        // correctness; a true lock-free cache would stash the last result
        // and short-circuit here when `!refresh_flag`.
        self.refresh_flag.store(false, Ordering::Release);

        let mut oldest: Option<u64> = None;
        for slot in &self.slots {
            loop {
                match slot.load_txnid() {
                    SafeTxnid::Invalid => std::hint::spin_loop(),
                    SafeTxnid::Valid(0) => break,
                    SafeTxnid::Valid(v) => {
                        oldest = Some(oldest.map_or(v, |o| o.min(v)));
                        break;
                    }
                }
            }
        }
        oldest.map(TransactionId)
    }

    /// Whether anything has touched the table since the flag was last
    /// cleared by a `find_oldest` call.
    pub fn needs_refresh(&self) -> bool {
        self.refresh_flag.load(Ordering::Acquire)
    }

    fn cleanup_stale(&self) -> usize {
        let mut cleaned = 0;
        for slot in &self.slots {
            if slot.is_stale() {
                slot.release();
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Force-release a laggard's slot as directed by the OOM callback
    /// (§4.12, return value `1`): the caller has asserted the process is
    /// gone, so the slot's txnid is CAS'd back to invalid without an extra
    /// pid-liveness probe.
    pub fn force_invalidate(&self, slot_index: usize) {
        if let Some(slot) = self.slots.get(slot_index) {
            slot.txnid.store(0, Ordering::Release);
        }
    }

    /// Force-release a laggard's slot entirely, as directed by the OOM
    /// callback (§4.12, return value `> 1`): the caller killed the process.
    pub fn force_release(&self, slot_index: usize) {
        if let Some(slot) = self.slots.get(slot_index) {
            slot.release();
        }
    }

    /// Number of currently claimed slots.
    pub fn reader_count(&self) -> usize {
        self.cleanup_stale();
        self.slots.iter().filter(|slot| !slot.is_free()).count()
    }

    /// Snapshot every claimed slot for `mdbx_reader_list`-style introspection.
    pub fn enumerate_readers(&self) -> Vec<ReaderInfo> {
        let mut out = Vec::new();
        for (slot_index, slot) in self.slots.iter().enumerate() {
            let pid = slot.pid.load(Ordering::Acquire);
            if pid == 0 {
                continue;
            }
            if let SafeTxnid::Valid(txnid) = slot.load_txnid() {
                out.push(ReaderInfo {
                    slot_index,
                    pid,
                    tid: slot.tid.load(Ordering::Acquire),
                    txnid: TransactionId(txnid),
                    timestamp: slot.timestamp.load(Ordering::Acquire),
                    pages_retired: slot.pages_retired.load(Ordering::Relaxed),
                    is_stale: slot.is_stale(),
                });
            }
        }
        out
    }
}

/// One row of `ReaderTable::enumerate_readers` output.
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    /// Index into the table.
    pub slot_index: usize,
    /// Owning process id.
    pub pid: u32,
    /// Owning OS thread id.
    pub tid: u64,
    /// The txnid this reader is pinning.
    pub txnid: TransactionId,
    /// Acquisition timestamp, nanoseconds since epoch.
    pub timestamp: u64,
    /// Pages retired since this snapshot was taken.
    pub pages_retired: u64,
    /// Whether the owning process appears to be dead.
    pub is_stale: bool,
}

impl ReaderInfo {
    /// Age of this reader snapshot in seconds.
    pub fn age_seconds(&self) -> u64 {
        (current_timestamp().saturating_sub(self.timestamp)) / 1_000_000_000
    }
}

fn thread_id() -> u64 {
    #[cfg(unix)]
    {
        unsafe { libc::pthread_self() as u64 }
    }
    #[cfg(windows)]
    {
        unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() as u64 }
    }
    #[cfg(not(any(unix, windows)))]
    {
        thread_local! { static THREAD_ID: u8 = const { 0 }; }
        THREAD_ID.with(|id| id as *const _ as u64)
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_acquire_release_roundtrip() {
        let slot = ReaderSlot::new();
        assert!(slot.is_free());
        assert!(slot.try_acquire());
        slot.publish(1, TransactionId(100));
        assert!(!slot.is_free());
        assert_eq!(slot.load_txnid(), SafeTxnid::Valid(100));
        slot.release();
        assert!(slot.is_free());
    }

    #[test]
    fn find_oldest_tracks_minimum() {
        let table = ReaderTable::new(8);
        let mut head = TransactionId(100);
        let a = table.begin_read(|| head).unwrap();
        head = TransactionId(200);
        let _b = table.begin_read(|| head).unwrap();
        head = TransactionId(150);
        let _c = table.begin_read(|| head).unwrap();

        assert_eq!(table.find_oldest(), Some(TransactionId(100)));
        table.release(a);
        assert_eq!(table.find_oldest(), Some(TransactionId(150)));
    }

    #[test]
    fn table_exhaustion_reports_readers_full() {
        let table = ReaderTable::new(2);
        let head = TransactionId(1);
        let _a = table.begin_read(|| head).unwrap();
        let _b = table.begin_read(|| head).unwrap();
        assert!(matches!(table.begin_read(|| head), Err(Error::ReadersFull)));
    }
}
