//! Environment management with type-state pattern

use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{Error, PageId, Result, TransactionId};
use crate::gc::ReclaimPolicy;
use crate::io::{IoBackend, MmapBackend};
use crate::meta::{DbInfo, MetaPage, SelectPolicy, NUM_METAS};
use crate::oom::{NoIntervention, OomHandler};
use crate::page::Page;
use crate::reader::ReaderTable;
use crate::txn::{Read, Transaction, Write};

/// Environment state marker traits
pub mod state {
    /// Sealed trait for environment states
    mod sealed {
        pub trait Sealed {}
    }

    /// Environment state trait
    pub trait State: sealed::Sealed {}

    /// Closed environment state
    #[derive(Debug)]
    pub struct Closed;
    impl sealed::Sealed for Closed {}
    impl State for Closed {}

    /// Open environment state
    #[derive(Debug)]
    pub struct Open;
    impl sealed::Sealed for Open {}
    impl State for Open {}

    /// Read-only environment state
    #[derive(Debug)]
    pub struct ReadOnly;
    impl sealed::Sealed for ReadOnly {}
    impl State for ReadOnly {}
}

use state::*;

/// Maximum number of named databases
pub const MAX_DBS: u32 = 128;

/// Default map size (1GB)
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;

bitflags! {
    /// Environment-wide feature flags, mirroring the bit-per-behavior style
    /// real embedded engines expose instead of a grab-bag of booleans.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Never fsync after a commit; durability is left to the OS.
        const NOSYNC = 0x01;
        /// Sync data pages but skip the meta-page fsync (steady vs weak
        /// durability sign, see `DurabilitySign`).
        const NOMETASYNC = 0x02;
        /// Environment is opened read-only; write_txn() always fails.
        const RDONLY = 0x04;
        /// Use LIFO page reclaiming instead of the FIFO default.
        const LIFORECLAIM = 0x08;
        /// Coalesce adjacent reclaimed page extents during GC update.
        const COALESCE = 0x10;
    }
}

/// Durability modes for write transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// No sync - fastest but no durability guarantees
    NoSync,
    /// Async sync - data is flushed asynchronously (default)
    AsyncFlush,
    /// Sync data pages only - metadata might be lost
    SyncData,
    /// Full sync - both data and metadata are synced (safest)
    FullSync,
}

/// Storage geometry: how large the mapping may grow/shrink and by how much
/// at a time. Bytes throughout, matching the abstract configuration this
/// crate exposes rather than tying callers to page counts.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub lower: u64,
    pub now: u64,
    pub upper: u64,
    pub grow_step: u64,
    pub shrink_threshold: u64,
    pub page_size: u32,
}

impl Geometry {
    pub fn fixed(size: u64, page_size: u32) -> Self {
        Self { lower: size, now: size, upper: size, grow_step: 0, shrink_threshold: 0, page_size }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAP_SIZE as u64, crate::page::PAGE_SIZE as u32)
    }
}

fn meta_page_id(slot: usize) -> PageId {
    PageId(slot as u64)
}

/// Shared environment data
pub(crate) struct EnvInner {
    /// Path to the database
    pub(crate) path: PathBuf,
    /// I/O backend
    pub(crate) io: Box<dyn IoBackend>,
    /// Storage geometry
    pub(crate) geometry: Geometry,
    /// Current (last committed) transaction id
    pub(crate) txn_id: AtomicU64,
    /// Write lock: only one write transaction (including its nested
    /// children) may be in flight at a time
    pub(crate) write_lock: Mutex<()>,
    /// Reader table
    pub(crate) readers: ReaderTable,
    /// Named databases, refreshed from the catalog as they're opened
    pub(crate) databases: RwLock<HashMap<Option<String>, DbInfo>>,
    /// Durability mode
    pub(crate) durability: DurabilityMode,
    /// Feature flags
    pub(crate) flags: EnvFlags,
    /// Next page number to allocate via tail-bump, once GC has nothing left
    pub(crate) next_pgno: AtomicU64,
    /// Which of the three meta slots holds the current head, refreshed on
    /// every commit
    pub(crate) meta_select_policy: SelectPolicy,
    /// FIFO or LIFO page reclaiming
    pub(crate) reclaim_policy: ReclaimPolicy,
    /// Caller-supplied policy for resolving space pressure from a lagging
    /// reader
    pub(crate) oom_handler: Box<dyn OomHandler>,
}

// Safety: EnvInner is Send/Sync because IoBackend is Send/Sync
unsafe impl Send for EnvInner {}
unsafe impl Sync for EnvInner {}

impl EnvInner {
    /// Read all three meta slots and pick the current head per policy.
    pub(crate) fn read_metas(&self) -> Result<[MetaPage; NUM_METAS]> {
        let mut metas = Vec::with_capacity(NUM_METAS);
        for slot in 0..NUM_METAS {
            let page = self.io.read_page(meta_page_id(slot))?;
            metas.push(MetaPage::from_page(&page)?);
        }
        Ok(metas.try_into().unwrap_or_else(|_| unreachable!()))
    }

    /// Get the current meta page (the selected head).
    pub(crate) fn meta(&self) -> Result<MetaPage> {
        let metas = self.read_metas()?;
        let head = crate::meta::select(&metas, self.meta_select_policy);
        Ok(metas[head])
    }

    /// Which physical slot a new commit should write into: the
    /// lowest-ranked ("most ancient") of the three.
    pub(crate) fn next_meta_slot(&self) -> Result<usize> {
        let metas = self.read_metas()?;
        Ok(crate::meta::ancient(&metas, self.meta_select_policy))
    }

    pub(crate) fn reclaim_policy(&self) -> ReclaimPolicy {
        if self.flags.contains(EnvFlags::LIFORECLAIM) {
            ReclaimPolicy::Lifo
        } else {
            self.reclaim_policy
        }
    }
}

/// Database environment
pub struct Environment<S: State = Closed> {
    inner: Option<Arc<EnvInner>>,
    _state: PhantomData<S>,
}

/// Builder for creating environments
pub struct EnvBuilder {
    geometry: Geometry,
    max_readers: u32,
    max_dbs: u32,
    durability: DurabilityMode,
    flags: EnvFlags,
    meta_select_policy: SelectPolicy,
    reclaim_policy: ReclaimPolicy,
    oom_handler: Option<Box<dyn OomHandler>>,
}

impl EnvBuilder {
    /// Create a new environment builder
    pub fn new() -> Self {
        Self {
            geometry: Geometry::default(),
            max_readers: 126,
            max_dbs: MAX_DBS,
            durability: DurabilityMode::AsyncFlush,
            flags: EnvFlags::empty(),
            meta_select_policy: SelectPolicy::PreferLast,
            reclaim_policy: ReclaimPolicy::Fifo,
            oom_handler: None,
        }
    }

    /// Set the map size (fixes lower = now = upper at `size` bytes)
    pub fn map_size(mut self, size: usize) -> Self {
        self.geometry = Geometry::fixed(size as u64, self.geometry.page_size);
        self
    }

    /// Configure growable/shrinkable geometry directly
    pub fn geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Set the maximum number of readers
    pub fn max_readers(mut self, readers: u32) -> Self {
        self.max_readers = readers;
        self
    }

    /// Set the maximum number of named databases
    pub fn max_dbs(mut self, dbs: u32) -> Self {
        self.max_dbs = dbs.min(MAX_DBS);
        self
    }

    /// Set the durability mode
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Set feature flags (NOSYNC, NOMETASYNC, LIFORECLAIM, COALESCE, ...)
    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Choose how a torn or ambiguous meta-page set resolves to a head
    pub fn meta_select_policy(mut self, policy: SelectPolicy) -> Self {
        self.meta_select_policy = policy;
        self
    }

    /// Install a handler invoked when space reclaiming is blocked by a
    /// lagging reader
    pub fn oom_handler(mut self, handler: Box<dyn OomHandler>) -> Self {
        self.oom_handler = Some(handler);
        self
    }

    /// Build and open the environment
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment<Open>> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let data_path = path.join("data.mdb");

        let map_size = self.geometry.now.max(self.geometry.lower) as u64;
        let mut io: Box<dyn IoBackend> = Box::new(MmapBackend::with_options(&data_path, map_size)?);

        let is_new_db = match io.read_page(meta_page_id(0)) {
            Ok(page) => MetaPage::from_page(&page).map(|m| !m.format_ok()).unwrap_or(true),
            Err(_) => true,
        };

        let reclaim_policy = if self.flags.contains(EnvFlags::LIFORECLAIM) {
            ReclaimPolicy::Lifo
        } else {
            self.reclaim_policy
        };

        if is_new_db {
            info!(path = %path.display(), "env: initializing new database");
            let mut meta = MetaPage::new(self.geometry.page_size, self.max_readers);
            meta.geo_lower = self.geometry.lower;
            meta.geo_now = self.geometry.now;
            meta.geo_upper = self.geometry.upper;
            meta.geo_grow = self.geometry.grow_step;
            meta.geo_shrink = self.geometry.shrink_threshold;
            meta.gc_db.root = PageId(NUM_METAS as u64);
            meta.main_db.root = PageId(NUM_METAS as u64 + 1);
            meta.next_pgno = PageId(NUM_METAS as u64 + 2);

            for slot in 0..NUM_METAS {
                meta.begin_write(TransactionId(slot as u64));
                meta.end_write(crate::meta::DurabilitySign::Steady);
                io.write_page(&meta.to_page(meta_page_id(slot)))?;
            }

            let gc_page = Page::new(meta.gc_db.root, crate::page::PageFlags::LEAF);
            io.write_page(&gc_page)?;
            let main_page = Page::new(meta.main_db.root, crate::page::PageFlags::LEAF);
            io.write_page(&main_page)?;
            io.sync()?;
        }

        let readers = ReaderTable::new(self.max_readers as usize);
        let inner_probe = Arc::new(EnvInner {
            path: path.to_path_buf(),
            io,
            geometry: self.geometry,
            txn_id: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            readers,
            databases: RwLock::new(HashMap::new()),
            durability: self.durability,
            flags: self.flags,
            next_pgno: AtomicU64::new(0),
            meta_select_policy: self.meta_select_policy,
            reclaim_policy,
            oom_handler: self.oom_handler.unwrap_or_else(|| Box::new(NoIntervention)),
        });

        let meta_info = inner_probe.meta()?;
        inner_probe.txn_id.store(meta_info.txnid_a, Ordering::SeqCst);
        inner_probe.next_pgno.store(meta_info.next_pgno.0, Ordering::SeqCst);
        {
            let mut dbs = inner_probe
                .databases
                .write()
                .map_err(|_| Error::Custom("database registry poisoned".into()))?;
            dbs.insert(None, meta_info.main_db);
        }

        Ok(Environment { inner: Some(inner_probe), _state: PhantomData })
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for Environment<Closed> {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment<Closed> {
    /// Create a new closed environment
    pub fn new() -> Self {
        Self { inner: None, _state: PhantomData }
    }

    /// Open the environment
    pub fn open(self, path: impl AsRef<Path>) -> Result<Environment<Open>> {
        EnvBuilder::new().open(path)
    }
}

impl Environment<Open> {
    /// Begin a read transaction
    pub fn read_txn(&self) -> Result<Transaction<'_, Read>> {
        Transaction::new_read(self)
    }

    /// Begin a write transaction
    pub fn write_txn(&self) -> Result<Transaction<'_, Write>> {
        if self.inner().flags.contains(EnvFlags::RDONLY) {
            return Err(Error::InvalidOperation("environment opened read-only"));
        }
        Transaction::new_write(self)
    }

    /// Get inner reference (for internal use)
    pub(crate) fn inner(&self) -> &Arc<EnvInner> {
        self.inner.as_ref().expect("Environment not open")
    }

    /// Get inner reference (for testing)
    #[cfg(test)]
    #[allow(dead_code)]
    pub(crate) fn inner_test(&self) -> &Arc<EnvInner> {
        self.inner()
    }

    /// Sync data to disk
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner();
        match inner.durability {
            DurabilityMode::NoSync => Ok(()),
            DurabilityMode::AsyncFlush | DurabilityMode::SyncData | DurabilityMode::FullSync => {
                inner.io.sync()?;
                Ok(())
            }
        }
    }

    /// Force a full synchronous sync regardless of durability mode
    pub fn force_sync(&self) -> Result<()> {
        self.inner().io.sync()?;
        Ok(())
    }

    /// Get current space usage information
    pub fn space_info(&self) -> Result<crate::space_info::SpaceInfo> {
        let inner = self.inner();
        let total_pages = inner.io.size_in_pages();
        let next_pgno = inner.next_pgno.load(Ordering::Acquire);
        let meta = inner.meta()?;
        let pending = {
            let txn = self.read_txn()?;
            crate::gc::pending_count(&txn, meta.gc_db.root).unwrap_or(0)
        };
        let free_pages = total_pages.saturating_sub(next_pgno) + pending;
        Ok(crate::space_info::SpaceInfo::new(
            total_pages,
            next_pgno,
            free_pages,
            inner.geometry.upper.max(inner.geometry.now),
        ))
    }

    /// Get environment statistics
    pub fn stat(&self) -> Result<crate::meta::DbStats> {
        let meta = self.inner().meta()?;
        Ok(crate::meta::DbStats {
            psize: meta.psize,
            depth: meta.main_db.depth,
            branch_pages: meta.main_db.branch_pages,
            leaf_pages: meta.main_db.leaf_pages,
            overflow_pages: meta.main_db.overflow_pages,
            entries: meta.main_db.entries,
        })
    }

    /// Run the page-walker audit against the currently selected snapshot.
    pub fn audit(&self) -> Result<()> {
        let meta = self.inner().meta()?;
        let txn = self.read_txn()?;
        crate::audit::verify(&txn, &meta, &[])
    }
}

impl<S: State> Drop for Environment<S> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if inner.readers.reader_count() > 0 {
                warn!(count = inner.readers.reader_count(), "env: closing with readers still registered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_SIZE;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_env_creation() {
        let dir = TempDir::new().unwrap();
        let env = EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap();

        let stats = env.stat().unwrap();
        assert_eq!(stats.psize, PAGE_SIZE as u32);
    }

    #[test]
    fn test_env_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let env = EnvBuilder::new().open(dir.path()).unwrap();
            let _txn = env.write_txn().unwrap();
        }

        {
            let env = EnvBuilder::new().open(dir.path()).unwrap();
            let stats = env.stat().unwrap();
            assert_eq!(stats.psize, PAGE_SIZE as u32);
        }
    }

    #[test]
    fn test_durability_modes() {
        use crate::db::Database;
        let dir = TempDir::new().unwrap();

        {
            let env = Arc::new(
                EnvBuilder::new()
                    .map_size(10 * 1024 * 1024)
                    .durability(DurabilityMode::FullSync)
                    .open(dir.path())
                    .unwrap(),
            );

            let db: Database<String, String> = {
                let mut txn = env.write_txn().unwrap();
                let db = env.create_database(&mut txn, None).unwrap();

                db.put(&mut txn, "key1".to_string(), "value1".to_string()).unwrap();
                db.put(&mut txn, "key2".to_string(), "value2".to_string()).unwrap();

                txn.commit().unwrap();
                db
            };

            drop(db);
            drop(env);
        }

        {
            let env =
                Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());

            let txn = env.read_txn().unwrap();
            let db: Database<String, String> = env.open_database(&txn, None).unwrap();

            assert_eq!(db.get(&txn, &"key1".to_string()).unwrap(), Some("value1".to_string()));
            assert_eq!(db.get(&txn, &"key2".to_string()).unwrap(), Some("value2".to_string()));
        }
    }

    #[test]
    fn test_no_sync_mode() {
        let dir = TempDir::new().unwrap();

        let env = Arc::new(
            EnvBuilder::new()
                .map_size(10 * 1024 * 1024)
                .durability(DurabilityMode::NoSync)
                .open(dir.path())
                .unwrap(),
        );

        for _ in 0..20 {
            let mut txn = env.write_txn().unwrap();
            let _ = txn.alloc_page(crate::page::PageFlags::LEAF).unwrap();
            txn.commit().unwrap();
        }

        env.audit().unwrap();
    }
}
