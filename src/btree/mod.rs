//! B+tree descriptor and tuple model
//!
//! The core treats keys and tuples as opaque byte strings. The host
//! supplies the comparator and length predicates through [`TupleOps`];
//! everything else here is the minimal leaf/non-leaf tuple framing the
//! page-state machinery needs.

pub mod page_state;
pub mod split;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::page::PageView;

/// Identifies one tree; waiter slots match on it to reject wrong-page
/// wakeups after a page got recycled for another tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Regular,
    /// TOAST trees see strictly ascending leaf inserts.
    Toast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    None,
    RowLevel,
    PageLevel,
}

impl UndoKind {
    /// Bytes a worker pre-reserves before attempting an insert.
    pub fn reserve_size(self) -> u64 {
        match self {
            UndoKind::None => 0,
            UndoKind::RowLevel => 256,
            UndoKind::PageLevel => 8448,
        }
    }
}

/// What a byte string passed to the comparator represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    LeafTuple,
    NonLeafKey,
}

/// Host-supplied tuple predicates.
pub trait TupleOps: Send + Sync {
    fn cmp(&self, a: &[u8], a_kind: KeyKind, b: &[u8], b_kind: KeyKind) -> Ordering;

    /// Length of the key part of a leaf tuple.
    fn tuple_key_len(&self, tuple: &[u8]) -> usize;

    /// Extract the key of a leaf tuple.
    fn tuple_to_key(&self, tuple: &[u8]) -> Vec<u8>;

    /// Length of a non-leaf key at the start of `buf` (which may carry
    /// alignment padding behind it).
    fn key_len(&self, buf: &[u8]) -> usize;
}

/// Descriptor of one tree.
#[derive(Clone)]
pub struct TreeDescr {
    pub id: TreeId,
    pub kind: TreeKind,
    pub undo_kind: UndoKind,
    pub fillfactor: u8,
    pub ops: Arc<dyn TupleOps>,
}

impl TreeDescr {
    pub fn new(id: TreeId, ops: Arc<dyn TupleOps>) -> Self {
        Self {
            id,
            kind: TreeKind::Regular,
            undo_kind: UndoKind::None,
            fillfactor: 90,
            ops,
        }
    }
}

/// Commit sequence number of a transaction still in progress.
pub const CSN_INPROGRESS: u64 = u64::MAX;
/// Frozen snapshot marker: nothing may be reclaimed under it.
pub const CSN_FROZEN: u64 = 0;

pub const LEAF_TUPHDR_SIZE: usize = 16;
pub const NONLEAF_TUPHDR_SIZE: usize = 8;

/// Fixed framing in front of every leaf tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafTupleHeader {
    pub xact_csn: u64,
    pub deleted: bool,
}

impl LeafTupleHeader {
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.xact_csn.to_le_bytes());
        buf[8] = self.deleted as u8;
        buf[9..LEAF_TUPHDR_SIZE].fill(0);
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            xact_csn: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            deleted: buf[8] != 0,
        }
    }

    /// The owning transaction finished for everybody.
    pub fn finished(&self) -> bool {
        self.xact_csn != CSN_INPROGRESS
    }
}

/// Cap on waiters a splitting holder may adopt, and on items one split
/// redistributes.
pub const MAX_SPLIT_ITEMS: usize = 64;

/// Find the insertion offset for a leaf tuple by scanning the item
/// directory. Returns `(offset, exact_match)`.
pub fn leaf_find_offset(view: &PageView<'_>, ops: &dyn TupleOps, tuple: &[u8]) -> (usize, bool) {
    let count = view.items_count();
    for index in 0..count {
        let bytes = view.item_bytes(index);
        let existing = &bytes[LEAF_TUPHDR_SIZE..];
        match ops.cmp(tuple, KeyKind::LeafTuple, existing, KeyKind::LeafTuple) {
            Ordering::Less => return (index, false),
            Ordering::Equal => return (index, true),
            Ordering::Greater => {}
        }
    }
    (count, false)
}

/// Tuples whose first 8 bytes are a big-endian key; the rest is payload.
/// Non-leaf keys are the bare 8 key bytes.
pub struct FixedKeyOps;

impl FixedKeyOps {
    fn key_of<'a>(bytes: &'a [u8], kind: KeyKind) -> &'a [u8] {
        match kind {
            KeyKind::LeafTuple => &bytes[..8],
            KeyKind::NonLeafKey => &bytes[..8],
        }
    }
}

impl TupleOps for FixedKeyOps {
    fn cmp(&self, a: &[u8], a_kind: KeyKind, b: &[u8], b_kind: KeyKind) -> Ordering {
        Self::key_of(a, a_kind).cmp(Self::key_of(b, b_kind))
    }

    fn tuple_key_len(&self, _tuple: &[u8]) -> usize {
        8
    }

    fn tuple_to_key(&self, tuple: &[u8]) -> Vec<u8> {
        tuple[..8].to_vec()
    }

    fn key_len(&self, _buf: &[u8]) -> usize {
        8
    }
}

/// Encode a `FixedKeyOps` tuple from a numeric key and payload.
pub fn fixed_key_tuple(key: u64, payload: &[u8]) -> Vec<u8> {
    let mut tuple = key.to_be_bytes().to_vec();
    tuple.extend_from_slice(payload);
    tuple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_tuple_header_roundtrip() {
        let header = LeafTupleHeader {
            xact_csn: 12345,
            deleted: true,
        };
        let mut buf = [0u8; LEAF_TUPHDR_SIZE];
        header.write_to(&mut buf);
        assert_eq!(LeafTupleHeader::read_from(&buf), header);
        assert!(header.finished());
        assert!(!LeafTupleHeader {
            xact_csn: CSN_INPROGRESS,
            deleted: false
        }
        .finished());
    }

    #[test]
    fn test_fixed_key_ordering() {
        let ops = FixedKeyOps;
        let small = fixed_key_tuple(10, b"a");
        let large = fixed_key_tuple(300, b"b");
        assert_eq!(
            ops.cmp(&small, KeyKind::LeafTuple, &large, KeyKind::LeafTuple),
            Ordering::Less
        );
        let key = 300u64.to_be_bytes();
        assert_eq!(
            ops.cmp(&large, KeyKind::LeafTuple, &key, KeyKind::NonLeafKey),
            Ordering::Equal
        );
    }
}
