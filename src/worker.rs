//! Engine and per-worker state
//!
//! The [`Engine`] owns everything shared: the page pool, the waiter slot
//! table, and one semaphore per worker. A [`Worker`] is the per-thread
//! handle; it carries the strictly-local registries (locked pages,
//! staged splits, critical-section depth, undo reservations) that crash
//! unwind drains.

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::btree::page_state::WaiterSlot;
use crate::btree::UndoKind;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::page::Blkno;
use crate::pool::PagePool;

/// Maximum pages one worker may hold at once.
pub const MAX_PAGES_PER_WORKER: usize = 8;

/// Counting semaphore each worker parks on.
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    pub(crate) fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        *self.count.lock()
    }
}

pub struct Engine {
    settings: Settings,
    pool: PagePool,
    slots: Box<[CachePadded<WaiterSlot>]>,
    sems: Box<[Semaphore]>,
    registered: AtomicUsize,
}

impl Engine {
    pub fn new(settings: Settings) -> Result<Arc<Self>> {
        settings.validate()?;
        let slots: Box<[CachePadded<WaiterSlot>]> = (0..settings.max_workers)
            .map(|_| CachePadded::new(WaiterSlot::new()))
            .collect();
        let sems: Box<[Semaphore]> = (0..settings.max_workers).map(|_| Semaphore::new()).collect();
        Ok(Arc::new(Self {
            pool: PagePool::new(settings.pool_pages),
            slots,
            sems,
            registered: AtomicUsize::new(0),
            settings,
        }))
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(Settings::default()).expect("default settings are valid")
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub(crate) fn slot(&self, procno: u32) -> &WaiterSlot {
        &self.slots[procno as usize]
    }

    pub(crate) fn sem(&self, procno: u32) -> &Semaphore {
        &self.sems[procno as usize]
    }

    /// Claim a worker slot. The slot index doubles as the procno encoded
    /// in page state words.
    pub fn register_worker(self: &Arc<Self>) -> Result<Worker> {
        let mut current = self.registered.load(Ordering::Acquire);
        loop {
            if current >= self.settings.max_workers {
                return Err(Error::WorkersExhausted(self.settings.max_workers));
            }
            match self.registered.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        Ok(Worker {
            engine: Arc::clone(self),
            procno: current as u32,
            locked: LockedPages::new(),
            splits: Vec::with_capacity(2 * self.settings.max_tree_depth),
            max_splits: 2 * self.settings.max_tree_depth,
            crit_depth: Cell::new(0),
            undo_reserved: [0; 2],
        })
    }
}

#[derive(Clone, Copy)]
struct LockedPage {
    blkno: Blkno,
    state: u64,
}

struct LockedPages {
    entries: [LockedPage; MAX_PAGES_PER_WORKER],
    count: usize,
}

impl LockedPages {
    fn new() -> Self {
        Self {
            entries: [LockedPage { blkno: 0, state: 0 }; MAX_PAGES_PER_WORKER],
            count: 0,
        }
    }
}

pub struct Worker {
    pub(crate) engine: Arc<Engine>,
    pub(crate) procno: u32,
    locked: LockedPages,
    splits: Vec<Blkno>,
    max_splits: usize,
    crit_depth: Cell<u32>,
    undo_reserved: [u64; 2],
}

impl Worker {
    pub fn procno(&self) -> u32 {
        self.procno
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // Locked-page registry (strictly local).

    pub(crate) fn locked_page_index(&self, blkno: Blkno) -> Option<usize> {
        (0..self.locked.count).find(|&i| self.locked.entries[i].blkno == blkno)
    }

    pub(crate) fn locked_pages_add(&mut self, blkno: Blkno, state: u64) {
        assert!(
            self.locked_page_index(blkno).is_none(),
            "page {} is already locked by this worker",
            blkno
        );
        assert!(
            self.locked.count < MAX_PAGES_PER_WORKER,
            "locked-page registry overflow"
        );
        self.locked.entries[self.locked.count] = LockedPage { blkno, state };
        self.locked.count += 1;
    }

    pub(crate) fn locked_pages_del(&mut self, blkno: Blkno) -> u64 {
        let index = self
            .locked_page_index(blkno)
            .expect("releasing a page this worker does not hold");
        let state = self.locked.entries[index].state;
        self.locked.count -= 1;
        self.locked.entries[index] = self.locked.entries[self.locked.count];
        state
    }

    pub(crate) fn locked_page_state(&self, blkno: Blkno) -> u64 {
        let index = self
            .locked_page_index(blkno)
            .expect("page is not held by this worker");
        self.locked.entries[index].state
    }

    pub(crate) fn locked_page_set_state(&mut self, blkno: Blkno, state: u64) {
        let index = self
            .locked_page_index(blkno)
            .expect("page is not held by this worker");
        self.locked.entries[index].state = state;
    }

    pub(crate) fn oldest_locked_page(&self) -> Option<Blkno> {
        (self.locked.count > 0).then(|| self.locked.entries[0].blkno)
    }

    /// Is this page held by this worker?
    pub fn page_is_locked(&self, blkno: Blkno) -> bool {
        self.locked_page_index(blkno).is_some()
    }

    pub fn have_locked_pages(&self) -> bool {
        self.locked.count > 0
    }

    // Critical sections. The host guarantees no interrupts inside; here
    // the counter only backs the assertions around split staging.

    pub fn start_critical_section(&self) {
        self.crit_depth.set(self.crit_depth.get() + 1);
    }

    pub fn end_critical_section(&self) {
        let depth = self.crit_depth.get();
        assert!(depth > 0, "not inside a critical section");
        self.crit_depth.set(depth - 1);
    }

    pub fn in_critical_section(&self) -> bool {
        self.crit_depth.get() > 0
    }

    // In-progress split registry.

    /// Register a staged split. Unless unregistered before error cleanup,
    /// the right sibling is marked broken during unwind.
    ///
    /// Must be called inside a critical section.
    pub fn register_inprogress_split(&mut self, right_blkno: Blkno) {
        debug_assert!(!self.splits.contains(&right_blkno));
        assert!(
            self.in_critical_section(),
            "split staged outside a critical section"
        );
        assert!(
            self.splits.len() < self.max_splits,
            "in-progress split registry overflow"
        );
        self.splits.push(right_blkno);
    }

    /// Must be called inside a critical section.
    pub fn unregister_inprogress_split(&mut self, right_blkno: Blkno) {
        assert!(self.in_critical_section());
        let index = self
            .splits
            .iter()
            .position(|&b| b == right_blkno)
            .expect("split was not registered");
        self.splits.swap_remove(index);
    }

    pub(crate) fn take_inprogress_splits(&mut self) -> Vec<Blkno> {
        std::mem::take(&mut self.splits)
    }

    pub fn inprogress_split_count(&self) -> usize {
        self.splits.len()
    }

    // Undo reservation bookkeeping.

    fn undo_index(kind: UndoKind) -> usize {
        match kind {
            UndoKind::None => panic!("no undo reservation for UndoKind::None"),
            UndoKind::RowLevel => 0,
            UndoKind::PageLevel => 1,
        }
    }

    /// Pre-reserve undo space for an upcoming modification.
    pub fn reserve_undo(&mut self, kind: UndoKind) {
        self.undo_reserved[Self::undo_index(kind)] = kind.reserve_size();
    }

    /// Size of the current reservation; the reservation must exist.
    pub fn reserved_undo_size(&self, kind: UndoKind) -> u64 {
        let size = self.undo_reserved[Self::undo_index(kind)];
        assert!(size > 0, "undo space was not reserved");
        size
    }

    /// Release a reservation that will not be consumed.
    pub fn giveup_reserved_undo(&mut self, kind: UndoKind) {
        self.undo_reserved[Self::undo_index(kind)] = 0;
    }

    pub fn has_reserved_undo(&self, kind: UndoKind) -> bool {
        self.undo_reserved[Self::undo_index(kind)] > 0
    }

    pub(crate) fn repost_absorbed(&self, extra_waits: u32) {
        let sem = self.engine.sem(self.procno);
        for _ in 0..extra_waits {
            sem.post();
        }
    }
}
