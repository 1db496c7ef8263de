//! Page locking, waiting and reading
//!
//! Every page carries a 64-bit state word combining the lock bit, the
//! reader-block bit, a monotonic change count and the head of an
//! intrusive waiter list threaded through the per-worker slot table.
//! All transitions are single CAS operations on that word; blocked
//! workers enqueue themselves and park on their own semaphore.
//!
//! Release is the delicate side: in one CAS it clears the lock, ticks
//! the change count when a no-read episode ends, and rewrites the
//! waiter list so that every waiter it wakes is unlinked atomically
//! with respect to racing enqueues. Only the list head can move under
//! the releaser; links past it belong to parked workers and are stable.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::btree::{KeyKind, LeafTupleHeader, TreeDescr, UndoKind, LEAF_TUPHDR_SIZE, MAX_SPLIT_ITEMS};
use crate::metrics;
use crate::page::{
    blkno_is_valid, maxalign, right_link_blkno, right_link_change_count, right_link_is_valid,
    Blkno, Page, PageImage, INVALID_BLKNO, PAGE_PAYLOAD_SIZE,
};
use crate::worker::{Engine, Worker};

// State word layout: low 12 bits waiter head, bit 12 lock, bit 13
// no-read, the rest the change count.
const WAITER_BITS: u32 = 12;

/// Sentinel procno terminating the waiter chain.
pub const INVALID_PROCNO: u32 = (1 << WAITER_BITS) - 1;

const LIST_TAIL_MASK: u64 = INVALID_PROCNO as u64;
const LOCKED_FLAG: u64 = 1 << WAITER_BITS;
const NO_READ_FLAG: u64 = 1 << (WAITER_BITS + 1);
const CHANGE_COUNT_ONE: u64 = 1 << (WAITER_BITS + 2);
const CHANGE_COUNT_MASK: u64 = !(LIST_TAIL_MASK | LOCKED_FLAG | NO_READ_FLAG);

/// Everything but the waiter list; what a holder may compare across its
/// own critical operations.
const NON_WAITER_MASK: u64 = !LIST_TAIL_MASK;

/// State of a page nobody holds and nobody waits on.
pub const INITIAL_PAGE_STATE: u64 = LIST_TAIL_MASK;

pub fn state_is_locked(state: u64) -> bool {
    state & LOCKED_FLAG != 0
}

pub fn state_read_blocked(state: u64) -> bool {
    state & NO_READ_FLAG != 0
}

pub fn state_change_count(state: u64) -> u64 {
    (state & CHANGE_COUNT_MASK) >> (WAITER_BITS + 2)
}

pub fn state_waiter_head(state: u64) -> u32 {
    (state & LIST_TAIL_MASK) as u32
}

fn state_with_lock(state: u64) -> u64 {
    state | LOCKED_FLAG
}

/// State the pool installs on a freshly allocated page: locked by
/// construction, empty waiter list, change count preserved.
pub(crate) fn allocated_state(old_state: u64) -> u64 {
    (old_state & CHANGE_COUNT_MASK) | LOCKED_FLAG | LIST_TAIL_MASK
}

/// Largest tuple (with framing) a waiter slot can carry.
pub const MAX_TUPLE_SIZE: usize = 512;
const SLOT_TUPLE_CAP: usize = LEAF_TUPHDR_SIZE + MAX_TUPLE_SIZE;

/// Per-worker shared slot linking the worker into page wait lists.
///
/// The slot is owned by its worker. Foreign writers are confined to
/// `next` (while enqueued), `page_waiting`, `inserted` and `split`, and
/// all foreign writes happen before the semaphore post that releases
/// the owner.
pub struct WaiterSlot {
    pub(crate) next: AtomicU32,
    pub(crate) page_waiting: AtomicBool,
    pub(crate) wait_exclusive: AtomicBool,
    pub(crate) inserted: AtomicBool,
    pub(crate) split: AtomicBool,
    pub(crate) blkno: AtomicU32,
    pub(crate) page_change_count: AtomicU32,
    pub(crate) tree_id: AtomicU64,
    pub(crate) tuple_flags: AtomicU8,
    pub(crate) tuple_len: AtomicU16,
    pub(crate) reserved_undo: AtomicU64,
    tuple_data: UnsafeCell<[u8; SLOT_TUPLE_CAP]>,
}

// `tuple_data` is written by the owner before the enqueueing CAS
// (Release) and read by lock holders only after observing the slot in
// the chain (Acquire), so the accesses never overlap.
unsafe impl Sync for WaiterSlot {}

impl WaiterSlot {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU32::new(INVALID_PROCNO),
            page_waiting: AtomicBool::new(false),
            wait_exclusive: AtomicBool::new(false),
            inserted: AtomicBool::new(false),
            split: AtomicBool::new(false),
            blkno: AtomicU32::new(INVALID_BLKNO),
            page_change_count: AtomicU32::new(0),
            tree_id: AtomicU64::new(0),
            tuple_flags: AtomicU8::new(0),
            tuple_len: AtomicU16::new(0),
            reserved_undo: AtomicU64::new(0),
            tuple_data: UnsafeCell::new([0u8; SLOT_TUPLE_CAP]),
        }
    }
}

/// Outcome of [`Worker::lock_page_with_tuple`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleLockOutcome {
    /// The target page is locked; the caller performs the insert.
    Locked,
    /// The holder inserted the tuple on the caller's behalf. No lock is
    /// owned and the undo reservation has been released.
    Inserted,
    /// The key moved past a split and the right sibling is not in
    /// memory; re-descend from the parent.
    SplitDetected,
}

/// A queued waiter's serialized insert, as read by the lock holder.
pub struct WaiterTuple {
    /// Leaf tuple framing plus tuple bytes, alignment-padded.
    pub bytes: Vec<u8>,
    pub flags: u8,
    pub procno: u32,
}

impl WaiterTuple {
    pub fn header(&self) -> LeafTupleHeader {
        LeafTupleHeader::read_from(&self.bytes)
    }

    pub fn tuple(&self) -> &[u8] {
        &self.bytes[LEAF_TUPHDR_SIZE..]
    }
}

/// One pass of the lock-or-enqueue CAS loop. Returns the pre-transition
/// state: if it was unlocked the lock is now ours, otherwise we are
/// enqueued at the head of the waiter list.
fn lock_or_enqueue(engine: &Engine, blkno: Blkno, procno: u32) -> u64 {
    let header = &engine.pool().page(blkno).header;
    let slot = engine.slot(procno);

    let mut state = header.state.load(Ordering::Acquire);
    loop {
        let new_state = if !state_is_locked(state) {
            state_with_lock(state)
        } else {
            assert_ne!(state_waiter_head(state), procno, "worker already enqueued");
            slot.next.store(state_waiter_head(state), Ordering::Relaxed);
            slot.wait_exclusive.store(true, Ordering::Relaxed);
            slot.page_waiting.store(true, Ordering::Relaxed);
            (state & !LIST_TAIL_MASK) | procno as u64
        };

        match header
            .state
            .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return state,
            Err(seen) => state = seen,
        }
    }
}

/// Enqueue as a non-exclusive waiter unless reads are already enabled.
fn read_enabled_or_enqueue(engine: &Engine, blkno: Blkno, procno: u32) -> u64 {
    let header = &engine.pool().page(blkno).header;
    let slot = engine.slot(procno);

    let mut state = header.state.load(Ordering::Acquire);
    loop {
        if !state_read_blocked(state) {
            return state;
        }
        assert_ne!(state_waiter_head(state), procno, "worker already enqueued");
        slot.next.store(state_waiter_head(state), Ordering::Relaxed);
        slot.wait_exclusive.store(false, Ordering::Relaxed);
        slot.page_waiting.store(true, Ordering::Relaxed);
        let new_state = (state & !LIST_TAIL_MASK) | procno as u64;

        match header
            .state
            .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return state,
            Err(seen) => state = seen,
        }
    }
}

/// Enqueue as a non-exclusive waiter unless the change count already
/// differs from `snapshot`.
fn state_changed_or_enqueue(engine: &Engine, blkno: Blkno, procno: u32, snapshot: u64) -> u64 {
    let header = &engine.pool().page(blkno).header;
    let slot = engine.slot(procno);

    let mut state = header.state.load(Ordering::Acquire);
    loop {
        if state & CHANGE_COUNT_MASK != snapshot & CHANGE_COUNT_MASK {
            return state;
        }
        assert_ne!(state_waiter_head(state), procno, "worker already enqueued");
        slot.next.store(state_waiter_head(state), Ordering::Relaxed);
        slot.wait_exclusive.store(false, Ordering::Relaxed);
        slot.page_waiting.store(true, Ordering::Relaxed);
        let new_state = (state & !LIST_TAIL_MASK) | procno as u64;

        match header
            .state
            .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return state,
            Err(seen) => state = seen,
        }
    }
}

enum LockAttempt {
    Locked(u64),
    Queued,
    SplitDetected,
}

/// Verify the item directory before giving the page up. A page that no
/// longer describes itself consistently cannot be released safely.
fn unlock_check_page(page: &Page, blkno: Blkno) {
    // We still hold the lock, so the payload is stable.
    let view = unsafe { page.view() };
    let data_size = view.data_size();
    if data_size > crate::page::ITEM_HEAP_SIZE {
        panic!(
            "broken page: blkno {}, data size {} exceeds heap",
            blkno, data_size
        );
    }
    let count = view.items_count();
    if count > 0 {
        let last = view.item(count - 1);
        if last.offset + last.size > data_size {
            panic!(
                "broken page: blkno {}, item end {} past data size {}",
                blkno,
                last.offset + last.size,
                data_size
            );
        }
    }
}

impl Worker {
    /// Place an exclusive lock on the page. Readers are not blocked
    /// until `page_block_reads` is called.
    pub fn lock_page(&mut self, blkno: Blkno) {
        assert!(
            !self.page_is_locked(blkno),
            "page {} is already locked by this worker",
            blkno
        );
        let engine = Arc::clone(&self.engine);
        engine.pool().inc_usage(blkno, false);

        let mut extra_waits = 0u32;
        let prev_state = loop {
            let prev = lock_or_enqueue(&engine, blkno, self.procno);
            if !state_is_locked(prev) {
                break prev;
            }

            trace!(blkno, procno = self.procno, "parking for page lock");
            let timer = metrics::wait_start();
            let slot = engine.slot(self.procno);
            loop {
                engine.sem(self.procno).acquire();
                if !slot.page_waiting.load(Ordering::Acquire) {
                    break;
                }
                extra_waits += 1;
            }
            drop(timer);
        };

        self.locked_pages_add(blkno, state_with_lock(prev_state));
        self.repost_absorbed(extra_waits);
    }

    /// Try to lock the page without queueing. Returns true on success.
    pub fn try_lock_page(&mut self, blkno: Blkno) -> bool {
        let engine = Arc::clone(&self.engine);
        let header = &engine.pool().page(blkno).header;
        let state = header.state.fetch_or(LOCKED_FLAG, Ordering::AcqRel);
        if state_is_locked(state) {
            return false;
        }
        self.locked_pages_add(blkno, state_with_lock(state));
        true
    }

    /// Register a freshly allocated page whose lock bit is set by
    /// construction.
    pub fn declare_page_as_locked(&mut self, blkno: Blkno) {
        let engine = Arc::clone(&self.engine);
        let state = engine.pool().page(blkno).header.state.load(Ordering::Acquire);
        assert!(state_is_locked(state));
        self.locked_pages_add(blkno, state);
    }

    /// Block readers on a page this worker holds. The change count will
    /// advance when the page is unlocked.
    pub fn page_block_reads(&mut self, blkno: Blkno) {
        let engine = Arc::clone(&self.engine);
        let header = &engine.pool().page(blkno).header;
        let recorded = self.locked_page_state(blkno);
        debug_assert_eq!(
            recorded & NON_WAITER_MASK,
            header.state.load(Ordering::Acquire) & NON_WAITER_MASK,
            "page changed under its holder"
        );
        let state = header.state.fetch_or(NO_READ_FLAG, Ordering::AcqRel);
        assert!(state_is_locked(state), "blocking reads on an unlocked page");
        self.locked_page_set_state(blkno, state | NO_READ_FLAG);
    }

    /// Unlock the page, waking waiters per the selection policy.
    pub fn unlock_page(&mut self, blkno: Blkno) {
        self.unlock_page_internal(blkno, false);
    }

    /// Unlock the left page of a just-performed split. Waiters that
    /// still name a live target page are woken with their `split` flag
    /// set so they re-locate the key.
    pub fn unlock_page_after_split(&mut self, blkno: Blkno) {
        self.unlock_page_internal(blkno, true);
    }

    fn unlock_page_internal(&mut self, blkno: Blkno, split: bool) {
        let engine = Arc::clone(&self.engine);
        let page = engine.pool().page(blkno);
        let header = &page.header;

        unlock_check_page(page, blkno);

        let mut wakeup_tail: u32 = INVALID_PROCNO;
        let mut prev_tail: u32 = INVALID_PROCNO;
        let mut prev_tail_replace: u32 = INVALID_PROCNO;
        let mut exclusive: u32 = INVALID_PROCNO;
        let mut exclusive_prev: u32 = INVALID_PROCNO;
        let mut woke_exclusive = false;

        let mut state = header.state.load(Ordering::Acquire);
        loop {
            let tail = state_waiter_head(state);
            let mut new_tail = tail;
            let mut procno = tail;
            let mut prev_procno = INVALID_PROCNO;

            // Walk the fresh part of the list (down to the head we saw on
            // the previous CAS attempt). Waiters that only need the
            // change-count tick, waiters already satisfied by an insert
            // on their behalf, and, in split mode, waiters still aimed at
            // a live page are unlinked onto the local wakeup list.
            while procno != prev_tail {
                let slot = engine.slot(procno);
                let inserted = slot.inserted.load(Ordering::Acquire);
                let wait_exclusive = slot.wait_exclusive.load(Ordering::Acquire);
                let slot_blkno = slot.blkno.load(Ordering::Acquire);

                if inserted || !wait_exclusive || (split && blkno_is_valid(slot_blkno)) {
                    let next = slot.next.load(Ordering::Acquire);

                    if !inserted && split && blkno_is_valid(slot_blkno) {
                        slot.split.store(true, Ordering::Release);
                    }

                    // Remove from the waiter list.
                    if prev_procno == INVALID_PROCNO {
                        new_tail = next;
                    } else {
                        engine.slot(prev_procno).next.store(next, Ordering::Release);
                    }

                    // Push onto the wakeup list.
                    assert_ne!(procno, wakeup_tail, "waiter chain cycle");
                    slot.next.store(wakeup_tail, Ordering::Release);
                    wakeup_tail = procno;

                    procno = next;
                } else {
                    if !woke_exclusive {
                        exclusive = procno;
                        exclusive_prev = prev_procno;
                    }
                    prev_procno = procno;
                    procno = slot.next.load(Ordering::Acquire);
                }
            }

            // Wake at most one exclusive waiter: the oldest eligible one,
            // which the walk above left in `exclusive`.
            if exclusive != INVALID_PROCNO && !woke_exclusive {
                woke_exclusive = true;

                let excl_slot = engine.slot(exclusive);
                let excl_next = excl_slot.next.load(Ordering::Acquire);
                if exclusive_prev == INVALID_PROCNO {
                    new_tail = excl_next;
                } else {
                    assert_ne!(exclusive_prev, excl_next, "waiter chain cycle");
                    engine
                        .slot(exclusive_prev)
                        .next
                        .store(excl_next, Ordering::Release);
                }

                assert_ne!(exclusive, wakeup_tail, "waiter chain cycle");
                excl_slot.next.store(wakeup_tail, Ordering::Release);
                wakeup_tail = exclusive;

                if prev_procno == exclusive {
                    prev_procno = exclusive_prev;
                }
            }

            // Redo the previous replacement of the head: splice the
            // survivors computed on the failed attempt behind the fresh
            // prefix we just processed.
            if prev_tail != prev_tail_replace {
                assert_ne!(prev_tail, INVALID_PROCNO);
                if prev_procno == INVALID_PROCNO {
                    new_tail = prev_tail_replace;
                } else {
                    assert_ne!(prev_procno, prev_tail_replace, "waiter chain cycle");
                    engine
                        .slot(prev_procno)
                        .next
                        .store(prev_tail_replace, Ordering::Release);
                }
            }

            let mut new_state = state & !(LIST_TAIL_MASK | LOCKED_FLAG | NO_READ_FLAG);
            if state_read_blocked(state) {
                new_state += CHANGE_COUNT_ONE;
            }
            new_state |= new_tail as u64;

            match header
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(seen) => {
                    state = seen;
                    prev_tail = tail;
                    prev_tail_replace = new_tail;
                }
            }
        }

        self.locked_pages_del(blkno);

        // Wake everyone we unlinked. Clearing `page_waiting` must come
        // before the post and after our last read of the slot, so the
        // owner never observes stale slot fields once it sees the clear.
        let mut procno = wakeup_tail;
        while procno != INVALID_PROCNO {
            let slot = engine.slot(procno);
            let next = slot.next.load(Ordering::Acquire);
            slot.page_waiting.store(false, Ordering::Release);
            engine.sem(procno).post();
            trace!(blkno, woken = procno, "woke page waiter");
            procno = next;
        }
    }

    /// Record the held state, unlock, wait for the page to change, then
    /// lock it again.
    pub fn relock_page(&mut self, blkno: Blkno) {
        let engine = Arc::clone(&self.engine);
        let snapshot = self.locked_page_state(blkno);
        self.unlock_page(blkno);
        engine.pool().inc_usage(blkno, false);
        self.wait_for_changecount(blkno, snapshot);
        self.lock_page(blkno);
    }

    /// Release every page this worker still holds, oldest first. Used by
    /// error unwind.
    pub fn release_all_page_locks(&mut self) {
        std::sync::atomic::fence(Ordering::Release);
        while let Some(blkno) = self.oldest_locked_page() {
            self.unlock_page(blkno);
        }
    }

    /// Wait until reads are enabled on the page.
    pub fn wait_for_read_enable(&self, blkno: Blkno) {
        let engine = Arc::clone(&self.engine);
        let slot = engine.slot(self.procno);

        let mut extra_waits = 0u32;
        loop {
            let prev = read_enabled_or_enqueue(&engine, blkno, self.procno);
            if !state_read_blocked(prev) {
                break;
            }

            let timer = metrics::wait_start();
            loop {
                engine.sem(self.procno).acquire();
                if !slot.page_waiting.load(Ordering::Acquire) {
                    break;
                }
                extra_waits += 1;
            }
            drop(timer);
        }
        self.repost_absorbed(extra_waits);
    }

    /// Wait until the page's change count differs from `snapshot`'s.
    /// Returns the fresh state word.
    pub fn wait_for_changecount(&self, blkno: Blkno, snapshot: u64) -> u64 {
        let engine = Arc::clone(&self.engine);
        let header = &engine.pool().page(blkno).header;
        let slot = engine.slot(self.procno);

        let mut extra_waits = 0u32;
        let current = 'outer: loop {
            let current = state_changed_or_enqueue(&engine, blkno, self.procno, snapshot);
            if current & CHANGE_COUNT_MASK != snapshot & CHANGE_COUNT_MASK {
                break current;
            }

            let timer = metrics::wait_start();
            loop {
                engine.sem(self.procno).acquire();
                if !slot.page_waiting.load(Ordering::Acquire) {
                    // A wakeup may arrive before the tick it announces is
                    // visible here; recheck the live word.
                    let live = header.state.load(Ordering::Acquire);
                    if live & CHANGE_COUNT_MASK != snapshot & CHANGE_COUNT_MASK {
                        drop(timer);
                        break 'outer live;
                    }
                    break;
                }
                extra_waits += 1;
            }
        };
        self.repost_absorbed(extra_waits);
        current
    }

    /// Take a consistent snapshot of the page at the given reuse
    /// generation. Fails when the page was recycled.
    pub fn read_page_image(&self, blkno: Blkno, expected_change_count: u32) -> Option<PageImage> {
        let engine = Arc::clone(&self.engine);
        let page = engine.pool().page(blkno);
        let header = &page.header;

        let mut payload = Box::new([0u8; PAGE_PAYLOAD_SIZE]);
        loop {
            let before = header.state.load(Ordering::Acquire);
            if header.page_change_count.load(Ordering::Acquire) != expected_change_count {
                return None;
            }
            if state_read_blocked(before) {
                self.wait_for_read_enable(blkno);
                continue;
            }

            page.copy_payload_into(&mut payload);
            let flags = header.flags.load(Ordering::Acquire);
            let right_link = header.right_link.load(Ordering::Acquire);
            let generation = header.page_change_count.load(Ordering::Acquire);
            let after = header.state.load(Ordering::Acquire);

            if generation == expected_change_count
                && !state_read_blocked(after)
                && state_change_count(after) == state_change_count(before)
            {
                return Some(PageImage {
                    state: after,
                    flags,
                    right_link,
                    payload,
                });
            }
            // The copy raced a modification; retry.
        }
    }

    /// Exclusive lock with a pending insert the holder may satisfy.
    ///
    /// On entry `blkno`/`page_change_count` name the leaf the descent
    /// found; on a [`TupleLockOutcome::Locked`] return they name the
    /// page actually locked, which may be a right sibling reached
    /// through in-memory right-links.
    pub fn lock_page_with_tuple(
        &mut self,
        desc: &TreeDescr,
        blkno: &mut Blkno,
        page_change_count: &mut u32,
        xact_csn: u64,
        tuple: &[u8],
        tuple_flags: u8,
    ) -> TupleLockOutcome {
        assert!(!self.page_is_locked(*blkno));
        let engine = Arc::clone(&self.engine);
        let slot = engine.slot(self.procno);

        let mut image: Option<PageImage> = None;
        let mut serialized = false;
        let mut extra_waits = 0u32;

        let prev_state = loop {
            slot.blkno.store(*blkno, Ordering::Relaxed);
            slot.page_change_count
                .store(*page_change_count, Ordering::Relaxed);
            slot.split.store(false, Ordering::Relaxed);
            slot.inserted.store(false, Ordering::Relaxed);

            if !serialized {
                let header = LeafTupleHeader {
                    xact_csn,
                    deleted: false,
                };
                slot.tree_id.store(desc.id.0, Ordering::Relaxed);
                let reserved = if desc.undo_kind != UndoKind::None {
                    self.reserved_undo_size(desc.undo_kind)
                } else {
                    0
                };
                slot.reserved_undo.store(reserved, Ordering::Relaxed);
                slot.tuple_flags.store(tuple_flags, Ordering::Relaxed);

                let total = LEAF_TUPHDR_SIZE + maxalign(tuple.len());
                assert!(total <= SLOT_TUPLE_CAP, "tuple exceeds slot capacity");
                // Owner-side write; published by the enqueueing CAS.
                unsafe {
                    let buf = &mut *slot.tuple_data.get();
                    header.write_to(&mut buf[..LEAF_TUPHDR_SIZE]);
                    buf[LEAF_TUPHDR_SIZE..LEAF_TUPHDR_SIZE + tuple.len()].copy_from_slice(tuple);
                    buf[LEAF_TUPHDR_SIZE + tuple.len()..total].fill(0);
                }
                slot.tuple_len.store(total as u16, Ordering::Relaxed);
                serialized = true;
            }

            match self.lock_or_enqueue_or_detect(desc, blkno, page_change_count, &mut image, tuple)
            {
                LockAttempt::Locked(prev) => break prev,
                LockAttempt::SplitDetected => {
                    slot.blkno.store(INVALID_BLKNO, Ordering::Release);
                    self.repost_absorbed(extra_waits);
                    return TupleLockOutcome::SplitDetected;
                }
                LockAttempt::Queued => {}
            }

            let timer = metrics::wait_start();
            loop {
                engine.sem(self.procno).acquire();
                if !slot.page_waiting.load(Ordering::Acquire) {
                    break;
                }
                extra_waits += 1;
            }
            drop(timer);

            if slot.inserted.load(Ordering::Acquire) {
                slot.blkno.store(INVALID_BLKNO, Ordering::Release);
                slot.inserted.store(false, Ordering::Release);
                if desc.undo_kind != UndoKind::None {
                    self.giveup_reserved_undo(desc.undo_kind);
                }
                self.repost_absorbed(extra_waits);
                trace!(procno = self.procno, "insert satisfied by lock holder");
                return TupleLockOutcome::Inserted;
            }

            if slot.split.load(Ordering::Acquire) {
                // The target was split under us; re-locate the key.
                self.repost_absorbed(extra_waits);
                extra_waits = 0;
                image = None;
            }
            // Otherwise the lock was released; retry the acquisition.
        };

        slot.blkno.store(INVALID_BLKNO, Ordering::Release);
        engine.pool().inc_usage(*blkno, false);
        self.locked_pages_add(*blkno, state_with_lock(prev_state));
        self.repost_absorbed(extra_waits);
        TupleLockOutcome::Locked
    }

    /// The combined primitive behind `lock_page_with_tuple`: refresh the
    /// page image when stale, follow the right-link when the key moved
    /// past the hikey, then fall through to lock-or-enqueue.
    fn lock_or_enqueue_or_detect(
        &self,
        desc: &TreeDescr,
        blkno: &mut Blkno,
        page_change_count: &mut u32,
        image: &mut Option<PageImage>,
        tuple: &[u8],
    ) -> LockAttempt {
        let engine = Arc::clone(&self.engine);
        let slot = engine.slot(self.procno);

        let mut header = &engine.pool().page(*blkno).header;
        let mut state = header.state.load(Ordering::Acquire);
        loop {
            let stale = match image {
                Some(img) => state_change_count(state) != state_change_count(img.state),
                None => true,
            };
            if stale {
                match self.read_page_image(*blkno, *page_change_count) {
                    Some(img) => *image = Some(img),
                    None => return LockAttempt::SplitDetected,
                }
                let img = image.as_ref().unwrap();
                if !img.is_rightmost() {
                    let img_view = img.view();
                    let (hikey, _hikey_flags) = img_view.hikey();
                    if desc
                        .ops
                        .cmp(tuple, KeyKind::LeafTuple, hikey, KeyKind::NonLeafKey)
                        != std::cmp::Ordering::Less
                    {
                        let link = img.right_link;
                        if right_link_is_valid(link) && blkno_is_valid(right_link_blkno(link)) {
                            *blkno = right_link_blkno(link);
                            *page_change_count = right_link_change_count(link);
                            slot.blkno.store(*blkno, Ordering::Relaxed);
                            slot.page_change_count
                                .store(*page_change_count, Ordering::Relaxed);
                            assert!(!self.page_is_locked(*blkno));
                            *image = None;
                            header = &engine.pool().page(*blkno).header;
                            state = header.state.load(Ordering::Acquire);
                            continue;
                        } else {
                            return LockAttempt::SplitDetected;
                        }
                    }
                }
                // Re-read the live word: the image read may have waited.
                state = header.state.load(Ordering::Acquire);
            }

            let new_state = if !state_is_locked(state) {
                state_with_lock(state)
            } else {
                assert_ne!(state_waiter_head(state), self.procno, "worker already enqueued");
                slot.next.store(state_waiter_head(state), Ordering::Relaxed);
                slot.wait_exclusive.store(true, Ordering::Relaxed);
                slot.page_waiting.store(true, Ordering::Relaxed);
                (state & !LIST_TAIL_MASK) | self.procno as u64
            };

            match header
                .state
                .compare_exchange(state, new_state, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return if !state_is_locked(state) {
                        LockAttempt::Locked(state)
                    } else {
                        LockAttempt::Queued
                    };
                }
                Err(seen) => state = seen,
            }
        }
    }

    /// Collect queued exclusive waiters whose pending insert targets
    /// this page at its current generation. Capped at
    /// [`MAX_SPLIT_ITEMS`]. The caller must hold the page lock.
    pub fn get_waiters_with_tuples(&self, desc: &TreeDescr, blkno: Blkno) -> Vec<u32> {
        let engine = Arc::clone(&self.engine);
        let header = &engine.pool().page(blkno).header;
        let generation = header.page_change_count.load(Ordering::Acquire);

        let mut result = Vec::new();
        let mut procno = state_waiter_head(header.state.load(Ordering::Acquire));
        while procno != INVALID_PROCNO {
            let slot = engine.slot(procno);
            if slot.wait_exclusive.load(Ordering::Acquire)
                && slot.blkno.load(Ordering::Acquire) == blkno
                && slot.page_change_count.load(Ordering::Acquire) == generation
                && slot.tree_id.load(Ordering::Acquire) == desc.id.0
            {
                result.push(procno);
                if result.len() >= MAX_SPLIT_ITEMS {
                    break;
                }
            }
            procno = slot.next.load(Ordering::Acquire);
        }
        result
    }

    /// Mark the waiters' inserts as performed. The actual wakeups happen
    /// at the next release, where `inserted` makes them eligible.
    pub fn wakeup_waiters_with_tuples(&self, procnos: &[u32]) {
        assert!(!procnos.is_empty());
        for &procno in procnos {
            self.engine.slot(procno).inserted.store(true, Ordering::Release);
        }
        metrics::INSERTS_ON_BEHALF.inc_by(procnos.len() as u64);
    }

    /// Run `f` over the payload of a page this worker holds.
    pub fn with_locked_page_view<R>(
        &self,
        blkno: Blkno,
        f: impl FnOnce(&crate::page::PageView<'_>) -> R,
    ) -> R {
        assert!(self.page_is_locked(blkno), "page is not held by this worker");
        let page = self.engine.pool().page(blkno);
        // Holding the lock keeps every other writer out.
        let view = unsafe { page.view() };
        f(&view)
    }

    /// Run `f` over the mutable payload of a page this worker holds with
    /// reads blocked.
    pub fn with_locked_page_mut<R>(
        &mut self,
        blkno: Blkno,
        f: impl FnOnce(&mut crate::page::PageMut<'_>) -> R,
    ) -> R {
        assert!(self.page_is_locked(blkno), "page is not held by this worker");
        let page = self.engine.pool().page(blkno);
        let state = page.header.state.load(Ordering::Acquire);
        assert!(
            state_read_blocked(state),
            "mutating a page requires page_block_reads"
        );
        let mut contents = unsafe { page.contents_mut() };
        f(&mut contents)
    }

    /// Read a queued waiter's serialized tuple. The caller must hold the
    /// lock on the waiter's target page, which keeps the waiter parked.
    pub fn waiter_tuple(&self, procno: u32) -> WaiterTuple {
        let slot = self.engine.slot(procno);
        let len = slot.tuple_len.load(Ordering::Acquire) as usize;
        let flags = slot.tuple_flags.load(Ordering::Acquire);
        // The owner published these bytes before enqueueing and will not
        // touch them again until woken.
        let bytes = unsafe { (&*slot.tuple_data.get())[..len].to_vec() };
        WaiterTuple {
            bytes,
            flags,
            procno,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use proptest::prelude::*;

    fn small_engine() -> Arc<Engine> {
        Engine::new(Settings {
            max_workers: 4,
            pool_pages: 8,
            ..Settings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_lock_unlock_uncontended() {
        let engine = small_engine();
        let mut worker = engine.register_worker().unwrap();

        worker.lock_page(0);
        assert!(worker.page_is_locked(0));
        let state = engine.pool().page(0).header.state.load(Ordering::Acquire);
        assert!(state_is_locked(state));

        worker.unlock_page(0);
        assert!(!worker.page_is_locked(0));
        let state = engine.pool().page(0).header.state.load(Ordering::Acquire);
        assert!(!state_is_locked(state));
        assert_eq!(state_waiter_head(state), INVALID_PROCNO);
    }

    #[test]
    fn test_try_lock_behavior() {
        let engine = small_engine();
        let mut w0 = engine.register_worker().unwrap();
        let mut w1 = engine.register_worker().unwrap();

        assert!(w0.try_lock_page(1));
        let before = engine.pool().page(1).header.state.load(Ordering::Acquire);
        assert!(!w1.try_lock_page(1));
        let after = engine.pool().page(1).header.state.load(Ordering::Acquire);
        // A failed try-lock does not touch the queue.
        assert_eq!(before, after);
        w0.unlock_page(1);
        assert!(w1.try_lock_page(1));
        w1.unlock_page(1);
    }

    #[test]
    fn test_block_reads_ticks_change_count_on_unlock() {
        let engine = small_engine();
        let mut worker = engine.register_worker().unwrap();
        let header = &engine.pool().page(2).header;

        let count_before = state_change_count(header.state.load(Ordering::Acquire));
        worker.lock_page(2);
        worker.unlock_page(2);
        // No no-read episode, no tick.
        assert_eq!(
            state_change_count(header.state.load(Ordering::Acquire)),
            count_before
        );

        worker.lock_page(2);
        worker.page_block_reads(2);
        let state = header.state.load(Ordering::Acquire);
        assert!(state_read_blocked(state) && state_is_locked(state));
        worker.unlock_page(2);
        let state = header.state.load(Ordering::Acquire);
        assert!(!state_read_blocked(state) && !state_is_locked(state));
        assert_eq!(state_change_count(state), count_before + 1);
    }

    #[test]
    fn test_relock_after_own_modification() {
        let engine = small_engine();
        let mut worker = engine.register_worker().unwrap();
        worker.lock_page(3);
        worker.page_block_reads(3);
        // Our own unlock ticks the count, so relock does not park.
        worker.relock_page(3);
        assert!(worker.page_is_locked(3));
        worker.unlock_page(3);
    }

    #[test]
    fn test_declare_allocated_page() {
        let engine = small_engine();
        let mut worker = engine.register_worker().unwrap();
        let blkno = engine.pool().alloc_page().unwrap();
        worker.declare_page_as_locked(blkno);
        assert!(worker.page_is_locked(blkno));
        worker.unlock_page(blkno);
    }

    #[test]
    fn test_release_all_page_locks() {
        let engine = small_engine();
        let mut worker = engine.register_worker().unwrap();
        worker.lock_page(0);
        worker.lock_page(1);
        worker.lock_page(2);
        worker.release_all_page_locks();
        assert!(!worker.have_locked_pages());
        for blkno in 0..3 {
            let state = engine.pool().page(blkno).header.state.load(Ordering::Acquire);
            assert!(!state_is_locked(state));
        }
    }

    #[test]
    fn test_read_page_image_fails_on_recycled_page() {
        let engine = small_engine();
        let worker = engine.register_worker().unwrap();
        let generation = engine
            .pool()
            .page(4)
            .header
            .page_change_count
            .load(Ordering::Acquire);
        assert!(worker.read_page_image(4, generation).is_some());
        assert!(worker.read_page_image(4, generation + 1).is_none());
    }

    #[test]
    fn test_semaphore_count_conserved_under_contention() {
        // Exclusive lockers and change-count waiters share one page; the
        // absorbed-wakeup repair must leave every semaphore drained.
        let engine = Engine::new(Settings {
            max_workers: 6,
            pool_pages: 4,
            ..Settings::default()
        })
        .unwrap();

        let stop = Arc::new(AtomicBool::new(false));

        let mut writers = Vec::new();
        for _ in 0..3 {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            writers.push(std::thread::spawn(move || {
                let mut worker = engine.register_worker().unwrap();
                while !stop.load(Ordering::Acquire) {
                    worker.lock_page(0);
                    worker.page_block_reads(0);
                    worker.unlock_page(0);
                }
            }));
        }
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let engine = Arc::clone(&engine);
            waiters.push(std::thread::spawn(move || {
                let worker = engine.register_worker().unwrap();
                let header = &worker.engine().pool().page(0).header;
                for _ in 0..100 {
                    let snapshot = header.state.load(Ordering::Acquire);
                    worker.wait_for_changecount(0, snapshot);
                }
            }));
        }
        for handle in waiters {
            handle.join().unwrap();
        }
        stop.store(true, Ordering::Release);
        for handle in writers {
            handle.join().unwrap();
        }

        for procno in 0..5 {
            assert_eq!(engine.sem(procno).pending(), 0, "semaphore {} leaked", procno);
        }
    }

    proptest! {
        #[test]
        fn prop_state_fields_are_disjoint(head in 0u32..INVALID_PROCNO, count in 0u64..1_000_000) {
            let state = (count << (WAITER_BITS + 2)) | LOCKED_FLAG | head as u64;
            prop_assert!(state_is_locked(state));
            prop_assert!(!state_read_blocked(state));
            prop_assert_eq!(state_waiter_head(state), head);
            prop_assert_eq!(state_change_count(state), count);
        }

        #[test]
        fn prop_tick_preserves_head_and_lock_clear(head in 0u32..=INVALID_PROCNO, count in 0u64..1_000_000) {
            // Model of the release transition from a no-read state.
            let state = (count << (WAITER_BITS + 2)) | LOCKED_FLAG | NO_READ_FLAG | head as u64;
            let mut new_state = state & !(LIST_TAIL_MASK | LOCKED_FLAG | NO_READ_FLAG);
            new_state += CHANGE_COUNT_ONE;
            new_state |= head as u64;
            prop_assert!(!state_is_locked(new_state));
            prop_assert!(!state_read_blocked(new_state));
            prop_assert_eq!(state_waiter_head(new_state), head);
            prop_assert_eq!(state_change_count(new_state), count + 1);
        }
    }
}
