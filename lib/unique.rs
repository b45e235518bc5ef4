//! Hash-consing unique tables for decision-diagram nodes.
//!
//! One table exists per node kind (vector, matrix). Each table owns a chunked
//! node arena plus one bucket array per variable level; looking up a freshly
//! built node either finds the canonical representative already stored for
//! its `(v, edges)` tuple or links the candidate in as that representative.
//! Reference counts are maintained per node and propagated recursively on
//! first acquisition / last release; unreferenced nodes are swept back onto a
//! free list by garbage collection.

use std::hash::Hasher;
use rustc_hash::FxHasher;
use tracing::{ debug, warn };
use crate::{
    complex::{ ComplexNumbers, RefCount },
    edge::{ DdNode, Edge, NodeIx, Qubit },
};

/// Buckets per variable level. Power of two.
pub const NBUCKET: usize = 32768;
const BUCKET_MASK: usize = NBUCKET - 1;

/// Nodes allocated per arena chunk.
pub const ALLOCATION_SIZE: usize = 2000;

const INITIAL_GC_LIMIT: usize = 250_000;
const GC_INCREMENT: usize = 50_000;

/// Unique table for nodes of radix `N`.
pub struct UniqueTable<const N: usize> {
    nvars: usize,
    tables: Vec<Vec<NodeIx>>,
    nodes: Vec<DdNode<N>>,
    avail: NodeIx,
    allocations: usize,
    node_count: usize,
    peak_node_count: usize,
    lookups: usize,
    hits: usize,
    collisions: usize,
    active: Vec<usize>,
    active_node_count: usize,
    max_active: usize,
    gc_calls: usize,
    gc_runs: usize,
    gc_limit: usize,
}

impl<const N: usize> UniqueTable<N> {
    pub fn new(nvars: usize) -> Self {
        let mut nodes = Vec::with_capacity(ALLOCATION_SIZE);
        nodes.push(DdNode::terminal());
        Self {
            nvars,
            tables: vec![vec![NodeIx::NONE; NBUCKET]; nvars],
            nodes,
            avail: NodeIx::NONE,
            allocations: ALLOCATION_SIZE,
            node_count: 0,
            peak_node_count: 0,
            lookups: 0,
            hits: 0,
            collisions: 0,
            active: vec![0; nvars],
            active_node_count: 0,
            max_active: 0,
            gc_calls: 0,
            gc_runs: 0,
            gc_limit: INITIAL_GC_LIMIT,
        }
    }

    /// Grow the table to cover `nvars` variable levels.
    pub fn resize(&mut self, nvars: usize) {
        self.nvars = nvars;
        self.tables.resize_with(nvars, || vec![NodeIx::NONE; NBUCKET]);
        self.active.resize(nvars, 0);
        self.active_node_count = self.active.iter().sum();
    }

    /// Number of variable levels covered.
    pub fn nvars(&self) -> usize { self.nvars }

    /// Borrow a node by index.
    pub fn node(&self, ix: NodeIx) -> &DdNode<N> { &self.nodes[ix.idx()] }

    pub(crate) fn node_mut(&mut self, ix: NodeIx) -> &mut DdNode<N> {
        &mut self.nodes[ix.idx()]
    }

    /// Variable level of an edge's target; `-1` for zero edges and the
    /// terminal.
    pub fn v_of(&self, e: Edge<N>) -> Qubit {
        if e.p.is_none() { -1 } else { self.nodes[e.p.idx()].v }
    }

    /// Number of nodes currently stored in buckets.
    pub fn node_count(&self) -> usize { self.node_count }

    /// Peak of [`node_count`][Self::node_count] over the table's lifetime.
    pub fn peak_node_count(&self) -> usize { self.peak_node_count }

    /// Total number of arena slots ever allocated.
    pub fn allocations(&self) -> usize { self.allocations }

    /// Number of nodes with a nonzero reference count.
    pub fn active_node_count(&self) -> usize { self.active_node_count }

    /// Number of referenced nodes at the given variable level.
    pub fn active_count(&self, v: Qubit) -> usize { self.active[v as usize] }

    /// Fraction of lookups answered by an existing node.
    pub fn hit_ratio(&self) -> f64 { self.hits as f64 / self.lookups as f64 }

    /// Fraction of lookups that walked past a non-matching bucket entry.
    pub fn collision_ratio(&self) -> f64 {
        self.collisions as f64 / self.lookups as f64
    }

    fn hash_edges(edges: &[Edge<N>; N]) -> usize {
        let mut h = FxHasher::default();
        for e in edges.iter() {
            h.write_u32(e.p.bits());
            h.write_u32(e.w.re.bits());
            h.write_u32(e.w.im.bits());
        }
        (h.finish() as usize) & BUCKET_MASK
    }

    /// Look up the canonical node for `e.p`'s `(v, edges)` tuple.
    ///
    /// On a hit the candidate node is returned to the free list unless
    /// `keep_node` is set (callers that need the candidate's address to stay
    /// valid, e.g. to `inc_ref` it afterwards, pass `true`). On a miss the
    /// candidate becomes the canonical representative. Only normalized nodes
    /// may be stored; refcounting is the caller's responsibility.
    pub fn lookup(&mut self, e: Edge<N>, keep_node: bool) -> Edge<N> {
        let v = self.nodes[e.p.idx()].v;
        if v == -1 {
            // the terminal is unique by construction
            return e;
        }
        self.lookups += 1;

        let edges = self.nodes[e.p.idx()].edges;
        debug_assert!(edges.iter().all(|c| {
            c.p.is_none() || self.nodes[c.p.idx()].v == v - 1 || c.is_terminal()
        }));

        let key = Self::hash_edges(&edges);
        let mut p = self.tables[v as usize][key];
        while !p.is_none() {
            if self.nodes[p.idx()].edges == edges {
                if e.p != p && !keep_node {
                    self.return_node(e.p);
                }
                self.hits += 1;
                debug_assert_eq!(self.nodes[p.idx()].v, v);
                return Edge { p, w: e.w };
            }
            self.collisions += 1;
            p = self.nodes[p.idx()].next;
        }

        // not found: the candidate goes in at the bucket head
        self.nodes[e.p.idx()].next = self.tables[v as usize][key];
        self.tables[v as usize][key] = e.p;
        self.node_count += 1;
        self.peak_node_count = self.peak_node_count.max(self.node_count);
        e
    }

    /// Take a blank node from the free list, or allocate one.
    pub fn get_node(&mut self) -> NodeIx {
        if !self.avail.is_none() {
            let ix = self.avail;
            self.avail = self.nodes[ix.idx()].next;
            let node = &mut self.nodes[ix.idx()];
            node.next = NodeIx::NONE;
            // recycled nodes may carry a stale count
            node.ref_count = 0;
            return ix;
        }
        if self.nodes.len() == self.nodes.capacity() {
            self.nodes.reserve(ALLOCATION_SIZE);
            self.allocations += ALLOCATION_SIZE;
        }
        self.nodes.push(DdNode::blank());
        NodeIx::new(self.nodes.len() - 1)
    }

    /// Push a node onto the free list.
    pub fn return_node(&mut self, ix: NodeIx) {
        debug_assert!(!ix.is_terminal());
        self.nodes[ix.idx()].next = self.avail;
        self.avail = ix;
    }

    /// Increment the reference count of `e`'s weight and target node; on the
    /// node's first acquisition, recursively acquire all of its edges.
    pub fn inc_ref(&mut self, e: Edge<N>, cn: &mut ComplexNumbers) {
        cn.inc_ref(e.w);
        if e.p.is_none() || e.is_terminal() {
            return;
        }
        if self.nodes[e.p.idx()].ref_count == RefCount::MAX {
            warn!(
                node = e.p.idx(),
                "max refcount reached; node will never be collected"
            );
            return;
        }
        self.nodes[e.p.idx()].ref_count += 1;

        if self.nodes[e.p.idx()].ref_count == 1 {
            let edges = self.nodes[e.p.idx()].edges;
            for child in edges {
                if !child.p.is_none() {
                    self.inc_ref(child, cn);
                }
            }
            let v = self.nodes[e.p.idx()].v as usize;
            self.active[v] += 1;
            self.active_node_count += 1;
            self.max_active = self.max_active.max(self.active_node_count);
        }
    }

    /// Decrement the reference count of `e`'s weight and target node; on the
    /// node's last release, recursively release all of its edges.
    ///
    /// *Panics if the node's count is already zero.*
    pub fn dec_ref(&mut self, e: Edge<N>, cn: &mut ComplexNumbers) {
        cn.dec_ref(e.w);
        if e.p.is_none() || e.is_terminal() {
            return;
        }
        if self.nodes[e.p.idx()].ref_count == RefCount::MAX {
            return;
        }
        assert!(
            self.nodes[e.p.idx()].ref_count > 0,
            "node refcount underflow",
        );
        self.nodes[e.p.idx()].ref_count -= 1;

        if self.nodes[e.p.idx()].ref_count == 0 {
            let edges = self.nodes[e.p.idx()].edges;
            for child in edges {
                if !child.p.is_none() {
                    self.dec_ref(child, cn);
                }
            }
            let v = self.nodes[e.p.idx()].v as usize;
            self.active[v] -= 1;
            self.active_node_count -= 1;
        }
    }

    /// Sweep every bucket of every level, returning unreferenced nodes to the
    /// free list.
    ///
    /// A no-op while the stored population is below the collection limit,
    /// unless `force` is set. The limit is raised additively when most nodes
    /// survive and lowered when the survivors drop far below it.
    pub fn garbage_collect(&mut self, force: bool) -> usize {
        self.gc_calls += 1;
        if !force && self.node_count < self.gc_limit {
            return 0;
        }
        self.gc_runs += 1;

        let mut collected = 0;
        let mut remaining = 0;
        for table in 0..self.tables.len() {
            for key in 0..NBUCKET {
                let mut last = NodeIx::NONE;
                let mut p = self.tables[table][key];
                while !p.is_none() {
                    let next = self.nodes[p.idx()].next;
                    if self.nodes[p.idx()].ref_count == 0 {
                        assert!(!p.is_terminal(), "tried to collect a terminal");
                        if last.is_none() {
                            self.tables[table][key] = next;
                        } else {
                            self.nodes[last.idx()].next = next;
                        }
                        self.return_node(p);
                        collected += 1;
                    } else {
                        last = p;
                        remaining += 1;
                    }
                    p = next;
                }
            }
        }
        if remaining > self.gc_limit * 9 / 10 {
            self.gc_limit = remaining + GC_INCREMENT;
        } else if remaining < self.gc_limit / 16 {
            self.gc_limit = (self.gc_limit / 8).max(INITIAL_GC_LIMIT);
        }
        self.node_count = remaining;
        debug!(collected, remaining, limit = self.gc_limit, "unique table gc");
        collected
    }

    /// Return every stored node to the free list and reset all statistics.
    pub fn clear(&mut self) {
        for table in 0..self.tables.len() {
            for key in 0..NBUCKET {
                let mut p = self.tables[table][key];
                while !p.is_none() {
                    let next = self.nodes[p.idx()].next;
                    self.return_node(p);
                    p = next;
                }
                self.tables[table][key] = NodeIx::NONE;
            }
        }
        self.node_count = 0;
        self.peak_node_count = 0;
        self.lookups = 0;
        self.hits = 0;
        self.collisions = 0;
        for a in self.active.iter_mut() {
            *a = 0;
        }
        self.active_node_count = 0;
        self.max_active = 0;
        self.gc_calls = 0;
        self.gc_runs = 0;
        self.gc_limit = INITIAL_GC_LIMIT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::complex::Complex;
    use crate::edge::VEdge;

    fn make_candidate(
        table: &mut UniqueTable<2>,
        v: Qubit,
        edges: [VEdge; 2],
    ) -> VEdge {
        let p = table.get_node();
        let node = table.node_mut(p);
        node.v = v;
        node.edges = edges;
        VEdge { p, w: Complex::ONE }
    }

    #[test]
    fn lookup_canonicalizes() {
        let mut table: UniqueTable<2> = UniqueTable::new(2);
        let a = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let a = table.lookup(a, false);
        let b = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let b = table.lookup(b, false);
        assert_eq!(a.p, b.p);
        assert_eq!(table.node_count(), 1);
        // a structurally different node gets its own slot
        let c = make_candidate(&mut table, 0, [VEdge::ZERO, VEdge::ONE]);
        let c = table.lookup(c, false);
        assert_ne!(a.p, c.p);
        assert_eq!(table.node_count(), 2);
    }

    #[test]
    fn duplicate_candidate_is_recycled() {
        let mut table: UniqueTable<2> = UniqueTable::new(1);
        let a = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let a = table.lookup(a, false);
        let b = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let dup = b.p;
        let _ = table.lookup(b, false);
        // the duplicate slot comes straight back from the free list
        assert_eq!(table.get_node(), dup);
        assert_ne!(a.p, dup);
    }

    #[test]
    fn keep_node_preserves_candidate() {
        let mut table: UniqueTable<2> = UniqueTable::new(1);
        let a = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let _ = table.lookup(a, false);
        let b = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let kept = b.p;
        let _ = table.lookup(b, true);
        // candidate not recycled: a fresh allocation goes elsewhere
        assert_ne!(table.get_node(), kept);
    }

    #[test]
    fn refcounting_recurses() {
        let mut cn = ComplexNumbers::new();
        let mut table: UniqueTable<2> = UniqueTable::new(2);
        let lo = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let lo = table.lookup(lo, false);
        let hi = make_candidate(&mut table, 1, [lo, VEdge::ZERO]);
        let hi = table.lookup(hi, false);

        table.inc_ref(hi, &mut cn);
        assert_eq!(table.node(hi.p).ref_count(), 1);
        assert_eq!(table.node(lo.p).ref_count(), 1);
        assert_eq!(table.active_node_count(), 2);
        assert_eq!(table.active_count(0), 1);
        assert_eq!(table.active_count(1), 1);

        table.inc_ref(hi, &mut cn);
        assert_eq!(table.node(hi.p).ref_count(), 2);
        // children only follow the first acquisition
        assert_eq!(table.node(lo.p).ref_count(), 1);

        table.dec_ref(hi, &mut cn);
        table.dec_ref(hi, &mut cn);
        assert_eq!(table.node(hi.p).ref_count(), 0);
        assert_eq!(table.node(lo.p).ref_count(), 0);
        assert_eq!(table.active_node_count(), 0);
    }

    #[test]
    fn gc_collects_unreferenced() {
        let mut cn = ComplexNumbers::new();
        let mut table: UniqueTable<2> = UniqueTable::new(2);
        let lo = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let lo = table.lookup(lo, false);
        let hi = make_candidate(&mut table, 1, [lo, VEdge::ZERO]);
        let hi = table.lookup(hi, false);
        let dead = make_candidate(&mut table, 1, [VEdge::ZERO, lo]);
        let _ = table.lookup(dead, false);
        assert_eq!(table.node_count(), 3);

        table.inc_ref(hi, &mut cn);
        let collected = table.garbage_collect(true);
        assert_eq!(collected, 1);
        assert_eq!(table.node_count(), 2);

        // the surviving structure is still canonical
        let again = make_candidate(&mut table, 1, [lo, VEdge::ZERO]);
        let again = table.lookup(again, false);
        assert_eq!(again.p, hi.p);
    }

    #[test]
    fn forced_gc_is_noop_below_limit_unless_forced() {
        let mut table: UniqueTable<2> = UniqueTable::new(1);
        let a = make_candidate(&mut table, 0, [VEdge::ONE, VEdge::ZERO]);
        let _ = table.lookup(a, false);
        assert_eq!(table.garbage_collect(false), 0);
        assert_eq!(table.node_count(), 1);
        assert_eq!(table.garbage_collect(true), 1);
        assert_eq!(table.node_count(), 0);
    }
}
