use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::btree::BTree;
use crate::config::Ptr;
use crate::freelist::FreeList;
use crate::master::{self, Master};
use crate::pager::Pager;

// A disk-backed key-value store. Keys and values are opaque byte
// strings; every update commits a new revision of a copy-on-write
// B+Tree through the master page.
//
// The store is strictly single-threaded: one thread both reads and
// writes, and callers serialize access externally.
pub struct KV {
    path: PathBuf,
    pager: Pager,
    tree: BTree,
}

impl std::fmt::Debug for KV {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KV").field("path", &self.path).finish()
    }
}

impl KV {
    ///
    /// Open a database file, creating it if it does not exist. The file
    /// is locked exclusively until the store is dropped.
    ///
    pub fn open<P: AsRef<Path>>(path: P) -> Result<KV> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("open file {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("lock file {}", path.display()))?;

        let mut pager = Pager::open(file)?;
        let mut tree = BTree::default();

        if pager.file_size() == 0 {
            // empty file; the master page is created by the first commit
            pager.flushed = 1; // page 0 is reserved for the master page
        } else {
            let master = master::load(pager.master_page(), pager.file_pages())
                .context("load master page")?;
            tree.root = master.root;
            pager.flushed = master.used;
            pager.free.head = master.free_head;
        }

        if pager.free.head == 0 {
            // Seed the initial free-list head. It stays in the pending
            // updates until the next commit persists it.
            pager.free = FreeList::seed(&mut pager);
        }

        Ok(KV {
            path: path.to_path_buf(),
            pager,
            tree,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Number of pages recorded by the last commit, including free-list
    // pages holding reclaimed entries.
    pub fn pages_used(&self) -> u64 {
        self.pager.flushed
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tree.get(&self.pager, key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(&mut self.pager, key, value);
        self.flush_pages()
    }

    // Remove a key, reporting whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let deleted = self.tree.delete(&mut self.pager, key);
        self.flush_pages()?;
        Ok(deleted)
    }

    ///
    /// Close the store, unmapping the file and releasing the lock.
    /// Committed revisions are already durable.
    ///
    pub fn close(self) {}

    // persist the pending page images as a new revision
    fn flush_pages(&mut self) -> Result<()> {
        self.write_pages()?;
        self.sync_pages()
    }

    fn write_pages(&mut self) -> Result<()> {
        // hand the freed pages to the free list
        let freed: Vec<Ptr> = self
            .pager
            .updates
            .iter()
            .filter_map(|(&ptr, page)| page.is_none().then_some(ptr))
            .collect();
        let nfree = self.pager.nfree;
        let mut free = self.pager.free;
        free.update(&mut self.pager, nfree, freed);
        self.pager.free = free;

        // grow the file and the mapping to cover the appended pages
        let npages = self.pager.flushed as usize + self.pager.nappend;
        self.pager.extend_file(npages)?;
        self.pager.extend_mmap(npages)?;

        // copy the new images into the mapping
        let pending: Vec<(Ptr, Vec<u8>)> = self
            .pager
            .updates
            .iter()
            .filter_map(|(&ptr, page)| page.clone().map(|data| (ptr, data)))
            .collect();
        for (ptr, data) in pending {
            self.pager.write_mapped(ptr, &data);
        }
        Ok(())
    }

    fn sync_pages(&mut self) -> Result<()> {
        // make the data pages durable before the master page points at them
        self.pager.file().sync_all().context("fsync")?;

        self.pager.flushed += self.pager.nappend as u64;
        self.pager.nfree = 0;
        self.pager.nappend = 0;
        self.pager.updates.clear();

        master::store(
            self.pager.file(),
            &Master {
                root: self.tree.root,
                used: self.pager.flushed,
                free_head: self.pager.free.head,
            },
        )?;
        self.pager.file().sync_all().context("fsync")?;
        Ok(())
    }
}
