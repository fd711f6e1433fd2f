use std::collections::HashMap;
use std::fs::File;

use anyhow::{ensure, Context, Result};
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};

use crate::btree::PageStore;
use crate::config::{PAGE_SIZE, Ptr};
use crate::freelist::{FreeList, FreeListStore};
use crate::node::Node;

// initial size of the mapped address space; doubled on each extension
const MMAP_MIN: usize = 64 << 20;

// The pager owns the file and its memory mappings and stages the page
// images of the pending commit.
//
// The mapped space is a sequence of chunks covering [0, mmap_total);
// it can run ahead of the file, which itself can run ahead of the
// `flushed` pages recorded by the last commit. Pages at or above
// `flushed` exist only in `updates` until the commit writes them out.
pub(crate) struct Pager {
    file: File,
    file_size: usize,  // bytes, always a multiple of the page size
    mmap_total: usize, // mapped bytes, may exceed the file size
    chunks: Vec<MmapMut>,

    // number of pages durably committed
    pub flushed: u64,
    // free-list pointers consumed so far this commit
    pub nfree: usize,
    // pages appended so far this commit
    pub nappend: usize,
    // pending page images keyed by pointer; None marks a freed page
    pub updates: HashMap<Ptr, Option<Vec<u8>>>,

    pub free: FreeList,
}

impl Pager {
    pub fn open(file: File) -> Result<Pager> {
        let size = file.metadata().context("stat")?.len() as usize;
        ensure!(
            size % PAGE_SIZE == 0,
            "file size is not a multiple of page size"
        );

        let mut total = MMAP_MIN;
        while total < size {
            total *= 2;
        }
        // SAFETY: the file is held under an exclusive lock for the life
        // of the store, so no other process mutates it underneath the
        // mapping. The mapping intentionally runs past the end of the
        // file; only pages below the file size are ever dereferenced.
        let chunk = unsafe {
            MmapOptions::new()
                .len(total)
                .map_mut(&file)
                .context("mmap init")?
        };

        Ok(Pager {
            file,
            file_size: size,
            mmap_total: total,
            chunks: vec![chunk],
            flushed: 0,
            nfree: 0,
            nappend: 0,
            updates: HashMap::new(),
            free: FreeList::default(),
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn file_pages(&self) -> u64 {
        (self.file_size / PAGE_SIZE) as u64
    }

    pub fn master_page(&self) -> &[u8] {
        &self.chunks[0][..crate::master::MASTER_SIZE]
    }

    // resolve a committed page through the mapping
    fn page_get_mapped(&self, ptr: Ptr) -> Node {
        let mut start = 0u64;
        for chunk in &self.chunks {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if ptr < end {
                let offset = PAGE_SIZE * (ptr - start) as usize;
                return Node::from_bytes(chunk[offset..offset + PAGE_SIZE].to_vec());
            }
            start = end;
        }
        panic!("bad ptr");
    }

    // copy a pending image into the mapping at its page number
    pub fn write_mapped(&mut self, ptr: Ptr, data: &[u8]) {
        let mut start = 0u64;
        for chunk in &mut self.chunks {
            let end = start + (chunk.len() / PAGE_SIZE) as u64;
            if ptr < end {
                let offset = PAGE_SIZE * (ptr - start) as usize;
                chunk[offset..offset + data.len()].copy_from_slice(data);
                return;
            }
            start = end;
        }
        panic!("bad ptr");
    }

    // Grow the file to cover at least `npages`, in exponential steps so
    // the file is not extended on every update.
    pub fn extend_file(&mut self, npages: usize) -> Result<()> {
        let mut file_pages = self.file_size / PAGE_SIZE;
        if file_pages >= npages {
            return Ok(());
        }
        while file_pages < npages {
            let inc = (file_pages / 8).max(1);
            file_pages += inc;
        }

        let file_size = file_pages * PAGE_SIZE;
        self.file
            .allocate(file_size as u64)
            .context("fallocate")?;
        self.file_size = file_size;
        Ok(())
    }

    // Double the mapped address space by mapping one more chunk of the
    // current total size right behind the existing ones.
    pub fn extend_mmap(&mut self, npages: usize) -> Result<()> {
        while self.mmap_total < npages * PAGE_SIZE {
            // SAFETY: same exclusive-access argument as the initial
            // mapping; the new chunk starts exactly where the mapped
            // range ends, keeping page numbers contiguous.
            let chunk = unsafe {
                MmapOptions::new()
                    .offset(self.mmap_total as u64)
                    .len(self.mmap_total)
                    .map_mut(&self.file)
                    .context("mmap extend")?
            };
            self.mmap_total += chunk.len();
            self.chunks.push(chunk);
        }
        Ok(())
    }
}

impl PageStore for Pager {
    fn page_get(&self, ptr: Ptr) -> Node {
        if let Some(page) = self.updates.get(&ptr) {
            let data = page.as_ref().expect("bad ptr"); // freed this commit
            return Node::from_bytes(data.clone());
        }
        self.page_get_mapped(ptr)
    }

    // Allocate a page for a tree node, preferring a reclaimed page from
    // the free list over growing the file.
    fn page_new(&mut self, node: Node) -> Ptr {
        assert!(node.data().len() <= PAGE_SIZE, "bad node!");

        let free = self.free;
        if (self.nfree as u64) < free.total(self) {
            let ptr = free.get(self, self.nfree);
            self.nfree += 1;
            self.page_use(ptr, node);
            ptr
        } else {
            self.page_append(node)
        }
    }

    fn page_del(&mut self, ptr: Ptr) {
        self.updates.insert(ptr, None);
    }
}

impl FreeListStore for Pager {
    fn page_get(&self, ptr: Ptr) -> Node {
        PageStore::page_get(self, ptr)
    }

    fn page_append(&mut self, node: Node) -> Ptr {
        assert!(node.data().len() <= PAGE_SIZE, "bad node!");

        let ptr = self.flushed + self.nappend as u64;
        self.nappend += 1;
        self.updates.insert(ptr, Some(node.into_data()));
        ptr
    }

    fn page_use(&mut self, ptr: Ptr, node: Node) {
        self.updates.insert(ptr, Some(node.into_data()));
    }
}
