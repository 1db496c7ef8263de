//! Fixed in-memory page pool
//!
//! A preallocated arena of 8 KiB pages with a free list for split
//! siblings and a usage-count map feeding the (external) eviction policy.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::btree::page_state::INITIAL_PAGE_STATE;
use crate::error::{Error, Result};
use crate::page::{Blkno, Page, INVALID_BLKNO, INVALID_RIGHT_LINK};

pub struct PagePool {
    pages: Box<[Page]>,
    usage: Box<[AtomicU32]>,
    free: Mutex<Vec<Blkno>>,
}

impl PagePool {
    pub fn new(pool_pages: usize) -> Self {
        let pages: Box<[Page]> = (0..pool_pages)
            .map(|_| Page::new(INITIAL_PAGE_STATE))
            .collect();
        let usage: Box<[AtomicU32]> = (0..pool_pages).map(|_| AtomicU32::new(0)).collect();
        // Hand out high page numbers first so low ones stay free for
        // direct use by embedding code.
        let free: Vec<Blkno> = (0..pool_pages as Blkno).collect();
        Self {
            pages,
            usage,
            free: Mutex::new(free),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, blkno: Blkno) -> &Page {
        assert!(blkno_in_range(blkno, self.pages.len()), "blkno {} out of range", blkno);
        &self.pages[blkno as usize]
    }

    /// Allocate a page for a new right sibling. The page comes back with
    /// its lock bit set by construction and a fresh reuse generation;
    /// register it with `declare_page_as_locked`.
    pub fn alloc_page(&self) -> Result<Blkno> {
        let blkno = {
            let mut free = self.free.lock();
            free.pop().ok_or(Error::PoolExhausted(self.pages.len()))?
        };
        let page = &self.pages[blkno as usize];
        page.header.page_change_count.fetch_add(1, Ordering::AcqRel);
        page.header.flags.store(0, Ordering::Release);
        page.header.right_link.store(INVALID_RIGHT_LINK, Ordering::Release);
        page.header.left_blkno.store(INVALID_BLKNO, Ordering::Release);
        page.header.undo_location.store(0, Ordering::Release);
        page.header.csn.store(0, Ordering::Release);
        page.header.dirty.store(false, Ordering::Release);
        unsafe {
            // Free pages have no holder and no waiters.
            page.contents_mut().init(0);
        }
        let state = page.header.state.load(Ordering::Acquire);
        page.header
            .state
            .store(crate::btree::page_state::allocated_state(state), Ordering::Release);
        Ok(blkno)
    }

    /// Return a page to the free list, advancing its reuse generation so
    /// stale right-links and tuple waiters no longer match it.
    pub fn free_page(&self, blkno: Blkno) {
        let page = self.page(blkno);
        page.header.page_change_count.fetch_add(1, Ordering::AcqRel);
        page.header
            .state
            .store(INITIAL_PAGE_STATE, Ordering::Release);
        self.free.lock().push(blkno);
    }

    /// Eviction hint. `hot` weights the bump for pages known to be reused
    /// immediately.
    pub fn inc_usage(&self, blkno: Blkno, hot: bool) {
        let bump = if hot { 8 } else { 1 };
        self.usage[blkno as usize].fetch_add(bump, Ordering::Relaxed);
    }

    pub fn usage_count(&self, blkno: Blkno) -> u32 {
        self.usage[blkno as usize].load(Ordering::Relaxed)
    }
}

fn blkno_in_range(blkno: Blkno, len: usize) -> bool {
    (blkno as usize) < len
}
