//! Seam toward the shadow-memory storage engine.
//!
//! The storage engine itself (byte-granular label arrays, sparse
//! directories) lives outside this crate; the control plane drives it
//! through [`ShadowMemory`]. [`InMemoryShadow`] is a reference
//! implementation backed by plain maps, used by the test suite and by
//! embedders that do not link the native engine.

use core::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
};
use std::{collections::BTreeSet, rc::Rc};

use hashbrown::{HashMap, HashSet};

use crate::addr::TaintAddr;

/// Interned contents of one label set. Immutable once created.
#[derive(Debug, PartialEq, Eq)]
pub struct LabelSet {
    labels: BTreeSet<u32>,
}

impl LabelSet {
    fn new(labels: BTreeSet<u32>) -> Self {
        Self { labels }
    }
}

/// Opaque handle into the interned label-set pool.
///
/// Two handles compare equal iff they point at the same interned contents;
/// the interning guarantee is owned by the [`ShadowMemory`] implementation.
/// The handle is read-only: the control plane never mutates a set through
/// it, it only walks the labels and takes the cardinality.
#[derive(Clone)]
pub struct LabelSetRef(Rc<LabelSet>);

impl LabelSetRef {
    /// Number of distinct labels in the set.
    #[must_use]
    pub fn cardinality(&self) -> u32 {
        u32::try_from(self.0.labels.len()).unwrap_or(u32::MAX)
    }

    /// The labels of this set, in ascending order. Restartable: calling
    /// again yields a fresh iterator over the same interned contents.
    pub fn labels(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.labels.iter().copied()
    }

    /// Stable opaque identifier used to back-reference this set from log
    /// records. Derived from the interned allocation, so it is identical
    /// for every handle to the same set.
    #[must_use]
    pub fn id(&self) -> u64 {
        Rc::as_ptr(&self.0) as usize as u64
    }
}

impl PartialEq for LabelSetRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LabelSetRef {}

impl Hash for LabelSetRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl Debug for LabelSetRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LabelSetRef")
            .field(&self.0.labels)
            .finish()
    }
}

/// Byte-granular label storage, as seen from the control plane.
///
/// Every operation is total: labeling overwrites, querying untouched bytes
/// yields the canonical empty set (`None`), deleting untouched bytes is a
/// no-op. Cost accounting is the implementation's business; the control
/// plane treats each call as O(1) amortized.
pub trait ShadowMemory: Debug {
    /// Overwrite the label set at `addr` with the singleton `{label}`.
    fn label(&mut self, addr: TaintAddr, label: u32);

    /// The label set at `addr`, or `None` if the byte is untainted.
    fn query(&self, addr: TaintAddr) -> Option<LabelSetRef>;

    /// The taint-compute-number at `addr` (0 for untouched bytes).
    fn query_tcn(&self, addr: TaintAddr) -> u32;

    /// Clear the labeling at `addr`.
    fn delete(&mut self, addr: TaintAddr);

    /// How many distinct labels have ever been applied to this shadow.
    fn num_labels_applied(&self) -> u32;
}

#[derive(Debug, Clone)]
struct Cell {
    set: LabelSetRef,
    tcn: u32,
}

/// Map-backed [`ShadowMemory`] with a real interning pool, so that
/// [`LabelSetRef`] identity behaves exactly as the native engine's.
#[derive(Debug, Default)]
pub struct InMemoryShadow {
    cells: HashMap<TaintAddr, Cell>,
    pool: HashMap<Vec<u32>, Rc<LabelSet>>,
    applied: HashSet<u32>,
}

impl InMemoryShadow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, labels: BTreeSet<u32>) -> LabelSetRef {
        let key: Vec<u32> = labels.iter().copied().collect();
        let rc = self
            .pool
            .entry(key)
            .or_insert_with(|| Rc::new(LabelSet::new(labels)));
        LabelSetRef(Rc::clone(rc))
    }
}

impl ShadowMemory for InMemoryShadow {
    fn label(&mut self, addr: TaintAddr, label: u32) {
        let set = self.intern(BTreeSet::from([label]));
        self.applied.insert(label);
        self.cells.insert(addr, Cell { set, tcn: 0 });
    }

    fn query(&self, addr: TaintAddr) -> Option<LabelSetRef> {
        self.cells.get(&addr).map(|cell| cell.set.clone())
    }

    fn query_tcn(&self, addr: TaintAddr) -> u32 {
        self.cells.get(&addr).map_or(0, |cell| cell.tcn)
    }

    fn delete(&mut self, addr: TaintAddr) {
        self.cells.remove(&addr);
    }

    fn num_labels_applied(&self) -> u32 {
        u32::try_from(self.applied.len()).unwrap_or(u32::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_label_round_trip() {
        let mut shadow = InMemoryShadow::new();
        shadow.label(TaintAddr::Ram(0x1000), 42);

        let set = shadow.query(TaintAddr::Ram(0x1000)).unwrap();
        assert_eq!(set.cardinality(), 1);
        assert_eq!(set.labels().collect::<Vec<_>>(), vec![42]);
    }

    #[test]
    fn delete_clears() {
        let mut shadow = InMemoryShadow::new();
        shadow.label(TaintAddr::Ram(0x1000), 7);
        shadow.delete(TaintAddr::Ram(0x1000));

        assert!(shadow.query(TaintAddr::Ram(0x1000)).is_none());
        assert_eq!(shadow.query_tcn(TaintAddr::Ram(0x1000)), 0);
    }

    #[test]
    fn interning_gives_pointer_identity() {
        let mut shadow = InMemoryShadow::new();
        shadow.label(TaintAddr::Ram(0x1000), 5);
        shadow.label(TaintAddr::Ram(0x2000), 5);

        let a = shadow.query(TaintAddr::Ram(0x1000)).unwrap();
        let b = shadow.query(TaintAddr::Ram(0x2000)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());

        shadow.label(TaintAddr::Ram(0x3000), 6);
        let c = shadow.query(TaintAddr::Ram(0x3000)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn applied_labels_counted_once() {
        let mut shadow = InMemoryShadow::new();
        shadow.label(TaintAddr::Ram(0), 1);
        shadow.label(TaintAddr::Ram(1), 1);
        shadow.label(TaintAddr::guest_reg(0, 0), 2);
        assert_eq!(shadow.num_labels_applied(), 2);
    }

    #[test]
    fn label_overwrites() {
        let mut shadow = InMemoryShadow::new();
        shadow.label(TaintAddr::Ram(0x40), 1);
        shadow.label(TaintAddr::Ram(0x40), 2);

        let set = shadow.query(TaintAddr::Ram(0x40)).unwrap();
        assert_eq!(set.labels().collect::<Vec<_>>(), vec![2]);
    }
}
