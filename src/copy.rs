//! Environment copying and backup functionality.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::env::{state, Environment};
use crate::error::{PageId, Result};
use crate::meta::{MetaPage, NUM_METAS};
use crate::page::{Page, PAGE_SIZE};
use crate::txn::{Read, Transaction};

/// Options for copying an environment
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Copy with compaction (skip free pages)
    pub compact: bool,
    /// Exclude transaction metadata
    pub exclude_txn_metadata: bool,
}

impl CopyOptions {
    /// Create options for a compact copy
    pub fn compact() -> Self {
        Self { compact: true, exclude_txn_metadata: false }
    }
}

/// Copy an environment to a file
pub fn copy_to_file(
    env: &Environment<state::Open>,
    path: impl AsRef<Path>,
    options: CopyOptions,
) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
    let txn = env.read_txn()?;
    copy_env_internal(env, &txn, &mut file, options)?;
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Copy environment to a writer
pub fn copy_to_writer<W: Write>(
    env: &Environment<state::Open>,
    writer: &mut W,
    options: CopyOptions,
) -> Result<()> {
    let txn = env.read_txn()?;
    copy_env_internal(env, &txn, writer, options)
}

fn copy_env_internal<W: Write>(
    env: &Environment<state::Open>,
    txn: &Transaction<'_, Read>,
    writer: &mut W,
    options: CopyOptions,
) -> Result<()> {
    let inner = env.inner();
    let meta = inner.meta()?;

    if options.compact {
        copy_compact(env, txn, writer, &meta)
    } else {
        copy_full(env, writer, &meta)
    }
}

/// Full copy - copies every page below the allocation frontier, used or not.
fn copy_full<W: Write>(env: &Environment<state::Open>, writer: &mut W, meta: &MetaPage) -> Result<()> {
    let inner = env.inner();
    for page_id in 0..meta.next_pgno.0 {
        let page = inner.io.read_page(PageId(page_id))?;
        write_page(writer, &page)?;
    }
    Ok(())
}

/// Compact copy - walks the main database (plus any named databases
/// registered in its catalog) and the gc database, writes only pages
/// actually reachable, and remaps page numbers to be contiguous.
fn copy_compact<W: Write>(
    env: &Environment<state::Open>,
    txn: &Transaction<'_, Read>,
    writer: &mut W,
    meta: &MetaPage,
) -> Result<()> {
    let inner = env.inner();
    let mut used_pages = std::collections::BTreeSet::new();
    for slot in 0..NUM_METAS as u64 {
        used_pages.insert(slot);
    }

    if meta.main_db.root.0 != 0 {
        collect_used_pages(txn, meta.main_db.root, &mut used_pages)?;
    }
    if meta.gc_db.root.0 != 0 {
        collect_used_pages(txn, meta.gc_db.root, &mut used_pages)?;
    }

    if meta.main_db.root.0 != 0 {
        collect_named_database_pages(txn, meta.main_db.root, &mut used_pages)?;
    }

    let mut page_map = std::collections::HashMap::new();
    let mut new_page_id = NUM_METAS as u64;
    for &old_page_id in used_pages.iter().filter(|&&p| p >= NUM_METAS as u64) {
        page_map.insert(old_page_id, new_page_id);
        new_page_id += 1;
    }

    let mut new_meta = *meta;
    if let Some(&new_root) = page_map.get(&meta.main_db.root.0) {
        new_meta.main_db.root = PageId(new_root);
    }
    if let Some(&new_root) = page_map.get(&meta.gc_db.root.0) {
        new_meta.gc_db.root = PageId(new_root);
    }
    new_meta.next_pgno = PageId(new_page_id);
    // A compact copy carries no retired pages forward: there is nothing left
    // to reclaim once the gc database itself has been remapped or dropped.
    new_meta.pages_retired = 0;

    for slot in 0..NUM_METAS {
        let meta_page = new_meta.to_page(PageId(slot as u64));
        write_page(writer, &meta_page)?;
    }

    let mut old_page_ids: Vec<u64> = page_map.keys().copied().collect();
    old_page_ids.sort_unstable();
    for old_page_id in old_page_ids {
        let new_id = page_map[&old_page_id];
        let mut page_data = vec![0u8; PAGE_SIZE];
        {
            let page = inner.io.read_page(PageId(old_page_id))?;
            page_data.copy_from_slice(page.as_bytes());
        }

        let page = unsafe { Page::from_raw_mut(&mut page_data) };
        page.header.pgno = new_id;

        if page.header.flags.contains(crate::page::PageFlags::BRANCH) {
            if let Some(&new_child) =
                page_map.get(&crate::branch::BranchPage::get_leftmost_child(page)?.0)
            {
                unsafe {
                    let header_ptr = page.data.as_mut_ptr() as *mut crate::branch::BranchHeader;
                    (*header_ptr).leftmost_child = PageId(new_child);
                }
            }
            for i in 0..page.header.num_keys as usize {
                let child_id = page.node(i)?.page_number()?;
                if let Some(&new_child) = page_map.get(&child_id.0) {
                    let ptr = page.ptrs()[i];
                    let node_offset = ptr as usize - crate::page::PageHeader::SIZE;
                    let val_offset =
                        node_offset + crate::page::NodeHeader::SIZE + page.node(i)?.header.ksize as usize;
                    unsafe {
                        let child_ptr = page.data.as_mut_ptr().add(val_offset) as *mut u64;
                        *child_ptr = new_child;
                    }
                }
            }
        }

        writer.write_all(&page_data)?;
    }

    Ok(())
}

/// Walk the main database's catalog entries (each a named sub-database) and
/// collect the pages reachable from each one too.
fn collect_named_database_pages(
    txn: &Transaction<'_, Read>,
    main_root: PageId,
    used_pages: &mut std::collections::BTreeSet<u64>,
) -> Result<()> {
    let mut stack = vec![main_root];
    while let Some(pgno) = stack.pop() {
        let page = txn.get_page(pgno)?;
        let num_keys = page.header.num_keys as usize;
        if page.header.flags.contains(crate::page::PageFlags::BRANCH) {
            stack.push(crate::branch::BranchPage::get_leftmost_child(page)?);
            for i in 0..num_keys {
                stack.push(page.node(i)?.page_number()?);
            }
        } else {
            for i in 0..num_keys {
                let node = page.node(i)?;
                if let Ok(value) = node.value() {
                    if let Ok(db_info) = crate::catalog::Catalog::deserialize_db_info(&value) {
                        if db_info.root.0 != 0 {
                            collect_used_pages(txn, db_info.root, used_pages)?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Collect every page reachable from `root`, including overflow chains.
fn collect_used_pages(
    txn: &Transaction<'_, Read>,
    root: PageId,
    used_pages: &mut std::collections::BTreeSet<u64>,
) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    crate::audit::walk(txn, root, &mut seen)?;
    used_pages.extend(seen);
    Ok(())
}

fn write_page<W: Write>(writer: &mut W, page: &Page) -> Result<()> {
    writer.write_all(page.as_bytes())?;
    Ok(())
}

/// Backup status callback
pub trait BackupCallback {
    /// Called periodically during backup with progress
    fn progress(&mut self, pages_copied: u64, total_pages: u64);
    /// Called when backup is complete
    fn complete(&mut self, pages_copied: u64);
}

/// Copy with progress callback
pub fn copy_with_callback<C: BackupCallback>(
    env: &Environment<state::Open>,
    path: impl AsRef<Path>,
    _options: CopyOptions,
    callback: &mut C,
) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;

    let _txn = env.read_txn()?;
    let inner = env.inner();
    let meta = inner.meta()?;

    let total_pages = meta.next_pgno.0;
    let mut pages_copied = 0;

    for page_id in 0..meta.next_pgno.0 {
        let page = inner.io.read_page(PageId(page_id))?;
        file.write_all(page.as_bytes())?;
        pages_copied += 1;
        if pages_copied % 100 == 0 {
            callback.progress(pages_copied, total_pages);
        }
    }

    file.flush()?;
    file.sync_all()?;
    callback.complete(pages_copied);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::env::EnvBuilder;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_copy_empty_env() {
        let dir = TempDir::new().unwrap();
        let backup_path = dir.path().join("backup.db");

        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());
        copy_to_file(&env, &backup_path, CopyOptions::default()).unwrap();
        assert!(backup_path.exists());

        let metadata = std::fs::metadata(&backup_path).unwrap();
        assert!(metadata.len() >= PAGE_SIZE as u64 * NUM_METAS as u64);
    }

    #[test]
    fn test_copy_with_data() {
        let dir = TempDir::new().unwrap();
        let backup_path = dir.path().join("backup.db");

        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());
        {
            let mut txn = env.write_txn().unwrap();
            let db: Database<String, String> = env.create_database(&mut txn, None).unwrap();
            for i in 0..100 {
                db.put(&mut txn, format!("key{}", i), format!("value{}", i)).unwrap();
            }
            txn.commit().unwrap();
        }

        copy_to_file(&env, &backup_path, CopyOptions::default()).unwrap();
        assert!(backup_path.exists());
        let metadata = std::fs::metadata(&backup_path).unwrap();
        assert!(metadata.len() > PAGE_SIZE as u64 * NUM_METAS as u64);
    }

    #[test]
    fn test_compact_copy_with_data() {
        let dir = TempDir::new().unwrap();
        let backup_path = dir.path().join("backup.db");

        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());
        {
            let mut txn = env.write_txn().unwrap();
            let db: Database<String, String> = env.create_database(&mut txn, None).unwrap();
            for i in 0..50 {
                db.put(&mut txn, format!("key{}", i), format!("value{}", i)).unwrap();
            }
            txn.commit().unwrap();
        }

        copy_to_file(&env, &backup_path, CopyOptions::compact()).unwrap();
        assert!(backup_path.exists());
    }

    struct TestCallback {
        progress_called: bool,
        complete_called: bool,
    }

    impl BackupCallback for TestCallback {
        fn progress(&mut self, _pages_copied: u64, _total_pages: u64) {
            self.progress_called = true;
        }
        fn complete(&mut self, _pages_copied: u64) {
            self.complete_called = true;
        }
    }

    #[test]
    fn test_copy_with_callback() {
        let dir = TempDir::new().unwrap();
        let backup_path = dir.path().join("backup.db");

        let env = Arc::new(EnvBuilder::new().map_size(10 * 1024 * 1024).open(dir.path()).unwrap());
        {
            let mut txn = env.write_txn().unwrap();
            let db: Database<Vec<u8>, Vec<u8>> = env.create_database(&mut txn, None).unwrap();
            for i in 0..1000 {
                let key = format!("key_{:04}", i).into_bytes();
                let value = vec![0u8; 100];
                db.put(&mut txn, key, value).unwrap();
            }
            txn.commit().unwrap();
        }

        let mut callback = TestCallback { progress_called: false, complete_called: false };
        copy_with_callback(&env, &backup_path, CopyOptions::default(), &mut callback).unwrap();
        assert!(callback.complete_called);
    }
}
