//! Memoization caches for the recursive decision-diagram operators.
//!
//! All caches are direct-mapped with a fixed slot count: any colliding insert
//! overwrites, and a lookup only answers when both stored operands match
//! exactly. Entries are *not* reference-counted; soundness instead relies on
//! every cache being wiped whenever garbage collection runs, since collected
//! node and float slots may be reused immediately afterwards.

use std::hash::Hasher;
use rustc_hash::FxHasher;
use crate::edge::{ CachedEdge, Control, ControlKind, Edge, MEdge, Qubit, QubitCount };

/// Slots per compute table. Power of two.
pub const CT_SLOTS: usize = 16384;
const CT_MASK: usize = CT_SLOTS - 1;

/// Slots in the Toffoli table. Power of two.
pub const TT_SLOTS: usize = 2048;
const TT_MASK: usize = TT_SLOTS - 1;

/// Slots in the noise-operation table. Power of two.
pub const OPERATION_SLOTS: usize = 2048;
const OPERATION_MASK: usize = OPERATION_SLOTS - 1;

/// Key fingerprinting for compute-table operands.
pub trait CtKey: Copy + PartialEq {
    fn ct_hash(&self) -> u64;
}

fn mix(h: u64, word: u64) -> u64 {
    (h.rotate_left(5) ^ word).wrapping_mul(0x51_7c_c1_b7_27_22_0a_95)
}

impl<const N: usize> CtKey for Edge<N> {
    fn ct_hash(&self) -> u64 {
        let mut h = FxHasher::default();
        h.write_u32(self.p.bits());
        h.write_u32(self.w.re.bits());
        h.write_u32(self.w.im.bits());
        h.finish()
    }
}

impl<const N: usize> CtKey for CachedEdge<N> {
    fn ct_hash(&self) -> u64 {
        let mut h = FxHasher::default();
        h.write_u32(self.p.bits());
        h.write_u64(self.w.re.to_bits());
        h.write_u64(self.w.im.to_bits());
        h.finish()
    }
}

struct CtEntry<L, R, Res> {
    left: L,
    right: R,
    result: Res,
}

/// Direct-mapped memo cache for a binary operator.
pub struct ComputeTable<L, R, Res> {
    table: Vec<Option<CtEntry<L, R, Res>>>,
    lookups: usize,
    hits: usize,
}

impl<L, R, Res> ComputeTable<L, R, Res>
where
    L: CtKey,
    R: CtKey,
    Res: Copy,
{
    pub fn new() -> Self {
        Self {
            table: (0..CT_SLOTS).map(|_| None).collect(),
            lookups: 0,
            hits: 0,
        }
    }

    fn slot(left: &L, right: &R) -> usize {
        (mix(left.ct_hash(), right.ct_hash()) as usize) & CT_MASK
    }

    /// Store a result, overwriting whatever occupied the slot.
    pub fn insert(&mut self, left: L, right: R, result: Res) {
        let slot = Self::slot(&left, &right);
        self.table[slot] = Some(CtEntry { left, right, result });
    }

    /// Retrieve the stored result for exactly these operands, if present.
    pub fn lookup(&mut self, left: L, right: R) -> Option<Res> {
        self.lookups += 1;
        let slot = Self::slot(&left, &right);
        let entry = self.table[slot].as_ref()?;
        if entry.left == left && entry.right == right {
            self.hits += 1;
            Some(entry.result)
        } else {
            None
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        for slot in self.table.iter_mut() {
            *slot = None;
        }
    }

    /// Fraction of lookups answered from the cache.
    pub fn hit_ratio(&self) -> f64 { self.hits as f64 / self.lookups as f64 }
}

impl<L: CtKey, R: CtKey, Res: Copy> Default for ComputeTable<L, R, Res> {
    fn default() -> Self { Self::new() }
}

struct UnaryEntry<K, Res> {
    key: K,
    result: Res,
}

/// Direct-mapped memo cache for a unary operator.
pub struct UnaryComputeTable<K, Res> {
    table: Vec<Option<UnaryEntry<K, Res>>>,
    lookups: usize,
    hits: usize,
}

impl<K, Res> UnaryComputeTable<K, Res>
where
    K: CtKey,
    Res: Copy,
{
    pub fn new() -> Self {
        Self {
            table: (0..CT_SLOTS).map(|_| None).collect(),
            lookups: 0,
            hits: 0,
        }
    }

    fn slot(key: &K) -> usize { (key.ct_hash() as usize) & CT_MASK }

    pub fn insert(&mut self, key: K, result: Res) {
        let slot = Self::slot(&key);
        self.table[slot] = Some(UnaryEntry { key, result });
    }

    pub fn lookup(&mut self, key: K) -> Option<Res> {
        self.lookups += 1;
        let slot = Self::slot(&key);
        let entry = self.table[slot].as_ref()?;
        if entry.key == key {
            self.hits += 1;
            Some(entry.result)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        for slot in self.table.iter_mut() {
            *slot = None;
        }
    }

    pub fn hit_ratio(&self) -> f64 { self.hits as f64 / self.lookups as f64 }
}

impl<K: CtKey, Res: Copy> Default for UnaryComputeTable<K, Res> {
    fn default() -> Self { Self::new() }
}

struct ToffoliEntry {
    n: QubitCount,
    controls: Vec<Control>,
    target: Qubit,
    e: MEdge,
}

/// Direct-mapped cache of Toffoli gate diagrams, keyed by
/// `(n, control set, target)`.
pub struct ToffoliTable {
    table: Vec<Option<ToffoliEntry>>,
    lookups: usize,
    hits: usize,
}

impl ToffoliTable {
    pub fn new() -> Self {
        Self {
            table: (0..TT_SLOTS).map(|_| None).collect(),
            lookups: 0,
            hits: 0,
        }
    }

    fn canonical(controls: &[Control]) -> Vec<Control> {
        let mut sorted = controls.to_vec();
        sorted.sort();
        sorted
    }

    fn slot(controls: &[Control], target: Qubit) -> usize {
        let mut key = target as u8 as usize;
        for control in controls.iter() {
            let factor = match control.kind {
                ControlKind::Pos => 29,
                ControlKind::Neg => 71,
            };
            key = key.wrapping_mul(factor * control.qubit as usize);
        }
        key & TT_MASK
    }

    pub fn insert(
        &mut self,
        n: QubitCount,
        controls: &[Control],
        target: Qubit,
        e: MEdge,
    ) {
        let controls = Self::canonical(controls);
        let slot = Self::slot(&controls, target);
        self.table[slot] = Some(ToffoliEntry { n, controls, target, e });
    }

    pub fn lookup(
        &mut self,
        n: QubitCount,
        controls: &[Control],
        target: Qubit,
    ) -> Option<MEdge> {
        self.lookups += 1;
        let controls = Self::canonical(controls);
        let slot = Self::slot(&controls, target);
        let entry = self.table[slot].as_ref()?;
        if entry.n == n && entry.target == target && entry.controls == controls {
            self.hits += 1;
            Some(entry.e)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        for slot in self.table.iter_mut() {
            *slot = None;
        }
        self.lookups = 0;
        self.hits = 0;
    }

    pub fn hit_ratio(&self) -> f64 { self.hits as f64 / self.lookups as f64 }
}

impl Default for ToffoliTable {
    fn default() -> Self { Self::new() }
}

struct OperationEntry {
    kind: u32,
    qubits: Vec<Qubit>,
    n: QubitCount,
    e: MEdge,
}

/// Direct-mapped cache of noise-operation diagrams, keyed by
/// `(operation kind, qubit set, n)`. The kind is an opaque discriminant
/// chosen by the caller.
pub struct OperationTable {
    table: Vec<Option<OperationEntry>>,
    lookups: usize,
    hits: usize,
}

impl OperationTable {
    pub fn new() -> Self {
        Self {
            table: (0..OPERATION_SLOTS).map(|_| None).collect(),
            lookups: 0,
            hits: 0,
        }
    }

    fn slot(kind: u32, qubits: &[Qubit], n: QubitCount) -> usize {
        let mut h = FxHasher::default();
        h.write_u32(kind);
        for q in qubits.iter() {
            h.write_i8(*q);
        }
        h.write_usize(n);
        (h.finish() as usize) & OPERATION_MASK
    }

    pub fn insert(
        &mut self,
        kind: u32,
        qubits: &[Qubit],
        n: QubitCount,
        e: MEdge,
    ) {
        let slot = Self::slot(kind, qubits, n);
        self.table[slot] =
            Some(OperationEntry { kind, qubits: qubits.to_vec(), n, e });
    }

    pub fn lookup(
        &mut self,
        kind: u32,
        qubits: &[Qubit],
        n: QubitCount,
    ) -> Option<MEdge> {
        self.lookups += 1;
        let slot = Self::slot(kind, qubits, n);
        let entry = self.table[slot].as_ref()?;
        if entry.kind == kind && entry.n == n && entry.qubits == qubits {
            self.hits += 1;
            Some(entry.e)
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        for slot in self.table.iter_mut() {
            *slot = None;
        }
        self.lookups = 0;
        self.hits = 0;
    }

    pub fn hit_ratio(&self) -> f64 { self.hits as f64 / self.lookups as f64 }
}

impl Default for OperationTable {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64 as C64;
    use crate::edge::{ NodeIx, VCachedEdge, VEdge };

    fn ve(idx: usize) -> VEdge {
        VEdge { p: NodeIx::new(idx), w: crate::complex::Complex::ONE }
    }

    #[test]
    fn lookup_misses_then_hits() {
        let mut ct: ComputeTable<VEdge, VEdge, VCachedEdge> =
            ComputeTable::new();
        let (a, b) = (ve(1), ve(2));
        assert!(ct.lookup(a, b).is_none());
        let res = VCachedEdge::new(NodeIx::new(3), C64::new(0.5, 0.0));
        ct.insert(a, b, res);
        assert_eq!(ct.lookup(a, b), Some(res));
        // operand order matters
        assert!(ct.lookup(b, a).is_none());
    }

    #[test]
    fn clear_drops_entries() {
        let mut ct: ComputeTable<VEdge, VEdge, VCachedEdge> =
            ComputeTable::new();
        let (a, b) = (ve(1), ve(2));
        ct.insert(a, b, VCachedEdge::new(NodeIx::new(3), C64::new(1.0, 0.0)));
        ct.clear();
        assert!(ct.lookup(a, b).is_none());
    }

    #[test]
    fn unary_roundtrip() {
        let mut ct: UnaryComputeTable<VEdge, VEdge> = UnaryComputeTable::new();
        let a = ve(1);
        assert!(ct.lookup(a).is_none());
        ct.insert(a, ve(5));
        assert_eq!(ct.lookup(a), Some(ve(5)));
    }

    #[test]
    fn toffoli_key_includes_everything() {
        let mut tt = ToffoliTable::new();
        let controls = [Control::pos(2), Control::neg(1)];
        let e = MEdge::ONE;
        tt.insert(3, &controls, 0, e);
        // control order is canonicalized away
        let shuffled = [Control::neg(1), Control::pos(2)];
        assert_eq!(tt.lookup(3, &shuffled, 0), Some(e));
        assert!(tt.lookup(4, &controls, 0).is_none());
        assert!(tt.lookup(3, &controls, 2).is_none());
        assert!(tt.lookup(3, &[Control::pos(2)], 0).is_none());
    }

    #[test]
    fn operation_table_roundtrip() {
        let mut ot = OperationTable::new();
        let e = MEdge::ONE;
        ot.insert(7, &[0, 2], 3, e);
        assert_eq!(ot.lookup(7, &[0, 2], 3), Some(e));
        assert!(ot.lookup(7, &[0, 1], 3).is_none());
        assert!(ot.lookup(8, &[0, 2], 3).is_none());
    }
}
