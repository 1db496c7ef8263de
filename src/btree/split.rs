//! Page splitting
//!
//! Splitting a page is a two-phase protocol. The split itself runs under
//! the left page's lock: extract the items (plus the incoming tuple),
//! pick the split point, materialize the right sibling, and publish it
//! through the left page's right-link. Completion happens later, after
//! the parent downlink exists: `split_mark_finished` commits the
//! two-page state, or the error-unwind path poisons the right sibling
//! with the broken-split flag so recovery can find it.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::btree::{
    LeafTupleHeader, TreeDescr, TreeKind, CSN_FROZEN, CSN_INPROGRESS, LEAF_TUPHDR_SIZE,
};
use crate::error::Result;
use crate::metrics;
use crate::page::{
    blkno_is_valid, make_right_link, maxalign, right_link_blkno, right_link_is_valid, Blkno,
    PageView, INVALID_BLKNO, INVALID_RIGHT_LINK, ITEM_HEAP_SIZE, MAX_KEY_LEN, NO_PREV_INSERT,
    PAGE_FLAG_BROKEN_SPLIT, PAGE_FLAG_LEFTMOST, PAGE_FLAG_RIGHTMOST,
};
use crate::worker::Worker;

/// Bytes one item costs on a page: its aligned body plus the directory
/// entry.
const ITEM_ENTRY_COST: usize = 4;

pub struct SplitItem {
    pub bytes: Vec<u8>,
    pub flags: u8,
}

impl SplitItem {
    fn cost(&self) -> i64 {
        (maxalign(self.bytes.len()) + ITEM_ENTRY_COST) as i64
    }
}

/// Flat extraction of a page's items, ready for redistribution.
pub struct SplitItems {
    pub items: Vec<SplitItem>,
    /// High key of the source page; `None` when it is rightmost.
    pub hikey: Option<(Vec<u8>, u8)>,
    pub max_key_len: usize,
    pub leaf: bool,
}

/// Extract the page's items with the incoming tuple placed (or replacing)
/// at `offset`. On leaf pages, tuples deleted by transactions finished
/// for everybody are reclaimed here, shifting `offset` when they precede
/// it.
pub fn make_split_items(
    desc: &TreeDescr,
    view: &PageView<'_>,
    offset: &mut usize,
    tuple_header: &LeafTupleHeader,
    tuple: &[u8],
    tuple_flags: u8,
    replace: bool,
    csn: u64,
) -> SplitItems {
    let leaf = view.level() == 0;
    let count = view.items_count();
    let mut items = Vec::with_capacity(count + 1);
    let mut max_key_len = 0usize;

    let mut index = 0usize;
    let mut loc = 0usize;
    while loc < count || index == *offset {
        if index == *offset {
            let mut bytes = vec![0u8; LEAF_TUPHDR_SIZE + maxalign(tuple.len())];
            tuple_header.write_to(&mut bytes[..LEAF_TUPHDR_SIZE]);
            bytes[LEAF_TUPHDR_SIZE..LEAF_TUPHDR_SIZE + tuple.len()].copy_from_slice(tuple);
            items.push(SplitItem {
                bytes,
                flags: tuple_flags,
            });
            max_key_len = max_key_len.max(desc.ops.tuple_key_len(tuple));
            index += 1;
            if replace {
                loc += 1;
                continue;
            }
        }

        if loc >= count {
            break;
        }

        let bytes = view.item_bytes(loc);
        let flags = view.item(loc).flags;
        if leaf {
            let header = LeafTupleHeader::read_from(bytes);
            let finished = if csn == CSN_FROZEN {
                false
            } else {
                header.finished()
            };
            // Reclaim tuples deleted by finished transactions.
            if finished
                && header.deleted
                && (csn == CSN_INPROGRESS || header.xact_csn < csn)
            {
                if index < *offset {
                    *offset -= 1;
                }
                loc += 1;
                continue;
            }
            max_key_len = max_key_len.max(desc.ops.tuple_key_len(&bytes[LEAF_TUPHDR_SIZE..]));
        }
        items.push(SplitItem {
            bytes: bytes.to_vec(),
            flags,
        });
        index += 1;
        loc += 1;
    }

    let (hikey, hikey_flags) = view.hikey();
    SplitItems {
        items,
        hikey: (!hikey.is_empty()).then(|| (hikey.to_vec(), hikey_flags)),
        max_key_len,
        leaf,
    }
}

/// Choose the number of items for the left page. Keeps as close as
/// possible to `target` when it is nonzero, otherwise balances free
/// space per `space_ratio`. Each side always receives at least one item
/// and is guaranteed to fit.
pub fn split_location(items: &SplitItems, target: usize, space_ratio: f32) -> usize {
    assert!((0.0..=1.0).contains(&space_ratio));
    assert!(items.items.len() >= 2, "cannot split fewer than two items");
    assert!(items.max_key_len <= MAX_KEY_LEN);

    let mut left_space = ITEM_HEAP_SIZE as i64;
    let mut right_space = ITEM_HEAP_SIZE as i64;
    let mut min_left = 1usize;
    let mut max_left = items.items.len() - 1;

    left_space -= items.items[0].cost();
    right_space -= items.items[items.items.len() - 1].cost();
    assert!(left_space >= 0 && right_space >= 0);

    // Narrow the bounds until they meet, preferring whichever side still
    // has space, then the target location or the space ratio.
    while min_left != max_left {
        debug_assert!(min_left < max_left);

        let prefer_left = right_space <= 0
            || (left_space > 0
                && (if target == 0 {
                    left_space as f32 * space_ratio > right_space as f32 * (1.0 - space_ratio)
                } else {
                    min_left < target
                }));

        if prefer_left {
            debug_assert!(left_space > 0);
            left_space -= items.items[min_left].cost();
            if left_space < 0 {
                continue;
            }
            min_left += 1;
        } else {
            debug_assert!(right_space > 0);
            right_space -= items.items[max_left - 1].cost();
            if right_space < 0 {
                continue;
            }
            max_left -= 1;
        }
    }

    min_left
}

/// Pick the left item count and the split key, autodetecting ordered
/// inserts from the page's previous-insert marker.
pub fn split_left_count(
    desc: &TreeDescr,
    view: &PageView<'_>,
    offset: usize,
    replace: bool,
    items: &SplitItems,
    rightmost: bool,
) -> (usize, Vec<u8>, u8) {
    let fillfactor = desc.fillfactor as f32 / 100.0;
    let count = view.items_count().max(1);
    let prev = view.prev_insert_offset();

    // Default: split the page 50%/50%.
    let mut target = 0usize;
    let mut ratio = 0.5f32;

    let filled = offset as f32 / count as f32;
    if prev != NO_PREV_INSERT && offset == prev as usize + 1 {
        // Ascending inserts right behind the previous one. Near the page
        // end, split the settled data away from the insertion point when
        // that still yields good utilization.
        if filled > fillfactor {
            ratio = fillfactor;
        } else if filled >= 0.9 {
            target = offset;
        } else {
            target = offset + 1;
        }
    } else if prev != NO_PREV_INSERT
        && ((!replace && offset == prev as usize) || (replace && offset + 1 == prev as usize))
    {
        // Descending inserts.
        if filled < 1.0 - fillfactor {
            ratio = 1.0 - fillfactor;
        } else if filled <= 0.1 {
            target = offset + 1;
        } else {
            target = offset;
        }
    } else if (desc.kind == TreeKind::Toast && items.leaf) || rightmost {
        // TOAST leaves and rightmost pages see ascending inserts.
        ratio = fillfactor;
    }

    let left_count = split_location(items, target, ratio);

    let first_right = &items.items[left_count];
    let (key, flags) = if items.leaf {
        (
            desc.ops.tuple_to_key(&first_right.bytes[LEAF_TUPHDR_SIZE..]),
            first_right.flags,
        )
    } else {
        let body = &first_right.bytes[crate::btree::NONLEAF_TUPHDR_SIZE..];
        (
            body[..desc.ops.key_len(body)].to_vec(),
            first_right.flags,
        )
    };
    (left_count, key, flags)
}

/// Split the locked page `blkno` into itself and the freshly allocated
/// `new_blkno`. The right page is materialized first; then reads are
/// blocked on the left page, links and metadata flip, and the left page
/// is reorganized down to its left half.
#[allow(clippy::too_many_arguments)]
pub fn perform_page_split(
    worker: &mut Worker,
    desc: &TreeDescr,
    blkno: Blkno,
    new_blkno: Blkno,
    items: &SplitItems,
    left_count: usize,
    split_key: &[u8],
    split_key_flags: u8,
    csn: u64,
    undo_location: u64,
) {
    assert!(worker.page_is_locked(blkno));
    assert!(worker.page_is_locked(new_blkno));
    assert!(left_count > 0 && left_count < items.items.len());

    let engine = Arc::clone(worker.engine());
    let left = engine.pool().page(blkno);
    let right = engine.pool().page(new_blkno);

    let old_right_link = left.header.right_link.load(Ordering::Acquire);
    let left_flags = left.header.flags.load(Ordering::Acquire);
    right
        .header
        .flags
        .store(left_flags & !PAGE_FLAG_LEFTMOST, Ordering::Release);

    // We hold the right page's lock and nothing links to it yet.
    {
        let mut contents = unsafe { right.contents_mut() };
        let level = unsafe { left.view() }.level();
        contents.init(level);
        let right_items: Vec<(Vec<u8>, u8)> = items.items[left_count..]
            .iter()
            .map(|item| (item.bytes.clone(), item.flags))
            .collect();
        contents.reorg(
            &right_items,
            items.hikey.as_ref().map(|(key, flags)| (key.as_slice(), *flags)),
        );
    }

    // Start the left page's modification episode.
    worker.page_block_reads(blkno);

    left.header.undo_location.store(undo_location, Ordering::Release);
    right.header.undo_location.store(undo_location, Ordering::Release);

    // The undo location must be visible before the commit seqno.
    fence(Ordering::Release);

    left.header.csn.store(csn, Ordering::Release);
    right.header.csn.store(csn, Ordering::Release);
    right.header.right_link.store(old_right_link, Ordering::Release);
    left.header.right_link.store(
        make_right_link(
            new_blkno,
            right.header.page_change_count.load(Ordering::Acquire),
        ),
        Ordering::Release,
    );
    left.clear_flag(PAGE_FLAG_RIGHTMOST);

    if right_link_is_valid(old_right_link) {
        engine
            .pool()
            .page(right_link_blkno(old_right_link))
            .header
            .left_blkno
            .store(new_blkno, Ordering::Release);
    }
    right.header.left_blkno.store(blkno, Ordering::Release);

    {
        let mut contents = unsafe { left.contents_mut() };
        let left_items: Vec<(Vec<u8>, u8)> = items.items[..left_count]
            .iter()
            .map(|item| (item.bytes.clone(), item.flags))
            .collect();
        contents.reorg(&left_items, Some((split_key, split_key_flags)));
    }

    left.header.dirty.store(true, Ordering::Release);
    right.header.dirty.store(true, Ordering::Release);

    metrics::PAGE_SPLITS.inc();
    debug!(
        left = blkno,
        right = new_blkno,
        left_count,
        total = items.items.len(),
        tree = desc.id.0,
        "performed page split"
    );
}

/// Defragment a locked leaf page in place. `undo` carries the location
/// and commit seqno of a freshly written page-level undo image.
pub fn perform_page_compaction(
    worker: &mut Worker,
    _desc: &TreeDescr,
    blkno: Blkno,
    items: &SplitItems,
    undo: Option<(u64, u64)>,
) {
    assert!(worker.page_is_locked(blkno));
    let engine = Arc::clone(worker.engine());
    let page = engine.pool().page(blkno);

    worker.start_critical_section();
    assert!(items.leaf);

    worker.page_block_reads(blkno);
    if let Some((undo_location, csn)) = undo {
        page.header.undo_location.store(undo_location, Ordering::Release);
        // The undo location must be visible before the commit seqno.
        fence(Ordering::Release);
        page.header.csn.store(csn, Ordering::Release);
    }

    {
        let mut contents = unsafe { page.contents_mut() };
        let flat: Vec<(Vec<u8>, u8)> = items
            .items
            .iter()
            .map(|item| (item.bytes.clone(), item.flags))
            .collect();
        contents.reorg(
            &flat,
            items.hikey.as_ref().map(|(key, flags)| (key.as_slice(), *flags)),
        );
        assert!(contents.data_size() <= ITEM_HEAP_SIZE);
    }

    worker.end_critical_section();
}

/// Run the staged split protocol for a locked leaf: extract items with
/// the incoming tuple, split, and release both pages. The left page is
/// released in split mode so redirected waiters re-locate their key.
/// The split stays registered; call [`finish_split`] once the parent
/// downlink is in place, or let error unwind poison it.
#[allow(clippy::too_many_arguments)]
pub fn split_leaf_page(
    worker: &mut Worker,
    desc: &TreeDescr,
    blkno: Blkno,
    mut offset: usize,
    tuple_header: &LeafTupleHeader,
    tuple: &[u8],
    tuple_flags: u8,
    replace: bool,
    csn: u64,
    undo_location: u64,
) -> Result<Blkno> {
    assert!(worker.page_is_locked(blkno));
    let engine = Arc::clone(worker.engine());
    let page = engine.pool().page(blkno);
    let rightmost = page.has_flag(PAGE_FLAG_RIGHTMOST);

    let (items, left_count, split_key, split_key_flags) = {
        // We hold the lock, so the payload is stable under us.
        let view = unsafe { page.view() };
        let items = make_split_items(
            desc,
            &view,
            &mut offset,
            tuple_header,
            tuple,
            tuple_flags,
            replace,
            csn,
        );
        let (left_count, split_key, split_key_flags) =
            split_left_count(desc, &view, offset, replace, &items, rightmost);
        (items, left_count, split_key, split_key_flags)
    };

    let right_blkno = engine.pool().alloc_page()?;
    worker.declare_page_as_locked(right_blkno);

    worker.start_critical_section();
    worker.register_inprogress_split(right_blkno);
    perform_page_split(
        worker,
        desc,
        blkno,
        right_blkno,
        &items,
        left_count,
        &split_key,
        split_key_flags,
        csn,
        undo_location,
    );
    worker.end_critical_section();

    worker.unlock_page(right_blkno);
    worker.unlock_page_after_split(blkno);

    Ok(right_blkno)
}

/// Commit a finished split and drop it from the in-progress registry.
pub fn finish_split(worker: &mut Worker, right_blkno: Blkno) {
    worker.split_mark_finished(right_blkno, true, true);
    worker.start_critical_section();
    worker.unregister_inprogress_split(right_blkno);
    worker.end_critical_section();
}

impl Worker {
    /// Mark the split that produced `right_blkno` as finished.
    ///
    /// On success, clears the broken-split flag and the transient links
    /// (the left page's right-link and the right page's back-pointer).
    /// On failure, sets the broken-split flag so the split stays
    /// discoverable for recovery.
    pub fn split_mark_finished(&mut self, right_blkno: Blkno, use_lock: bool, success: bool) {
        let engine = Arc::clone(&self.engine);
        let right = engine.pool().page(right_blkno);

        let mut left_blkno = right.header.left_blkno.load(Ordering::Acquire);
        assert!(blkno_is_valid(left_blkno));

        // The left page must be locked even when we only set the broken
        // flag: its release notifies waiters that the split they queued
        // behind is resolved.
        if use_lock {
            loop {
                self.lock_page(left_blkno);
                if right.header.left_blkno.load(Ordering::Acquire) == left_blkno {
                    self.page_block_reads(left_blkno);
                    break;
                }
                // A concurrent split of the left page moved our neighbor.
                self.unlock_page(left_blkno);
                left_blkno = right.header.left_blkno.load(Ordering::Acquire);
                assert!(blkno_is_valid(left_blkno));
            }
        }

        self.lock_page(right_blkno);
        self.page_block_reads(right_blkno);

        self.start_critical_section();

        let left = engine.pool().page(left_blkno);
        assert!(right_link_is_valid(
            left.header.right_link.load(Ordering::Acquire)
        ));
        assert!(use_lock || success);

        if success {
            right.clear_flag(PAGE_FLAG_BROKEN_SPLIT);
            left.header
                .right_link
                .store(INVALID_RIGHT_LINK, Ordering::Release);
            right.header.left_blkno.store(INVALID_BLKNO, Ordering::Release);
        } else {
            assert!(!right.has_flag(PAGE_FLAG_BROKEN_SPLIT));
            right.set_flag(PAGE_FLAG_BROKEN_SPLIT);
            metrics::BROKEN_SPLITS.inc();
            warn!(left = left_blkno, right = right_blkno, "marked split broken");
        }

        self.end_critical_section();

        self.unlock_page(right_blkno);
        if use_lock {
            self.unlock_page(left_blkno);
        }
    }

    /// Poison every staged split this worker never finished. Called from
    /// error unwind, after `release_all_page_locks`.
    pub fn mark_incomplete_splits(&mut self) {
        for right_blkno in self.take_inprogress_splits() {
            self.split_mark_finished(right_blkno, true, false);
        }
    }
}
