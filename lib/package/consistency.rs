//! Structural and reference-count audits over live diagrams, used by tests
//! and debugging sessions.
//!
//! The local check walks a diagram verifying levels, nonzero node counts, and
//! weight-entry liveness edge by edge. The global check snapshots the whole
//! DAG, recomputes how often every node and float entry is referenced, and
//! compares against the stored counts. Both expect to be called on an edge
//! the caller has acquired via `inc_ref`.

use rustc_hash::FxHashMap;
use crate::{
    complex::Complex,
    edge::{ MEdge, NodeIx, VEdge },
    package::Package,
};

impl Package {
    /// Check levels, refcounts, and weight liveness along every path under a
    /// vector edge.
    pub fn is_locally_consistent_vector(&self, e: VEdge) -> bool {
        self.local_vector(e)
    }

    /// Check levels, refcounts, and weight liveness along every path under a
    /// matrix edge.
    pub fn is_locally_consistent_matrix(&self, e: MEdge) -> bool {
        self.local_matrix(e)
    }

    fn weight_alive(&self, w: Complex) -> bool {
        if w == Complex::ONE || w == Complex::ZERO {
            return true;
        }
        let re = w.re.aligned().idx();
        let im = w.im.aligned().idx();
        self.cn.table.ref_at(re) > 0 && self.cn.table.ref_at(im) > 0
    }

    fn local_vector(&self, e: VEdge) -> bool {
        if !self.weight_alive(e.w) {
            return false;
        }
        if e.p.is_none() || e.is_terminal() {
            return true;
        }
        let node = self.v_unique.node(e.p);
        if node.ref_count() == 0 {
            return false;
        }
        let v = node.v;
        for child in node.edges {
            if child.p.is_none() {
                continue;
            }
            if !child.is_terminal() && self.v_unique.node(child.p).v + 1 != v {
                return false;
            }
            if !child.is_terminal()
                && self.v_unique.node(child.p).ref_count() == 0
            {
                return false;
            }
            if !self.local_vector(child) {
                return false;
            }
        }
        true
    }

    fn local_matrix(&self, e: MEdge) -> bool {
        if !self.weight_alive(e.w) {
            return false;
        }
        if e.p.is_none() || e.is_terminal() {
            return true;
        }
        let node = self.m_unique.node(e.p);
        if node.ref_count() == 0 {
            return false;
        }
        let v = node.v;
        for child in node.edges {
            if child.p.is_none() {
                continue;
            }
            if !child.is_terminal() && self.m_unique.node(child.p).v + 1 != v {
                return false;
            }
            if !child.is_terminal()
                && self.m_unique.node(child.p).ref_count() == 0
            {
                return false;
            }
            if !self.local_matrix(child) {
                return false;
            }
        }
        true
    }

    /// Recount every node and weight reference under a vector edge and
    /// compare against the stored counts.
    pub fn is_globally_consistent_vector(&self, e: VEdge) -> bool {
        let mut weights: FxHashMap<usize, usize> = FxHashMap::default();
        let mut nodes: FxHashMap<NodeIx, usize> = FxHashMap::default();
        self.fill_vector_counters(e, &mut weights, &mut nodes);
        self.check_counters(&weights, &nodes, true)
    }

    /// Recount every node and weight reference under a matrix edge and
    /// compare against the stored counts.
    pub fn is_globally_consistent_matrix(&self, e: MEdge) -> bool {
        let mut weights: FxHashMap<usize, usize> = FxHashMap::default();
        let mut nodes: FxHashMap<NodeIx, usize> = FxHashMap::default();
        self.fill_matrix_counters(e, &mut weights, &mut nodes);
        self.check_counters(&weights, &nodes, false)
    }

    fn count_weight(weights: &mut FxHashMap<usize, usize>, w: Complex) {
        *weights.entry(w.re.aligned().idx()).or_insert(0) += 1;
        *weights.entry(w.im.aligned().idx()).or_insert(0) += 1;
    }

    fn fill_vector_counters(
        &self,
        e: VEdge,
        weights: &mut FxHashMap<usize, usize>,
        nodes: &mut FxHashMap<NodeIx, usize>,
    ) {
        Self::count_weight(weights, e.w);
        if e.p.is_none() || e.is_terminal() {
            return;
        }
        *nodes.entry(e.p).or_insert(0) += 1;
        for child in self.v_unique.node(e.p).edges {
            if child.p.is_none() {
                continue;
            }
            if nodes.get(&child.p).copied().unwrap_or(0) == 0 {
                self.fill_vector_counters(child, weights, nodes);
            } else {
                *nodes.entry(child.p).or_insert(0) += 1;
                Self::count_weight(weights, child.w);
            }
        }
    }

    fn fill_matrix_counters(
        &self,
        e: MEdge,
        weights: &mut FxHashMap<usize, usize>,
        nodes: &mut FxHashMap<NodeIx, usize>,
    ) {
        Self::count_weight(weights, e.w);
        if e.p.is_none() || e.is_terminal() {
            return;
        }
        *nodes.entry(e.p).or_insert(0) += 1;
        for child in self.m_unique.node(e.p).edges {
            if child.p.is_none() {
                continue;
            }
            if nodes.get(&child.p).copied().unwrap_or(0) == 0 {
                self.fill_matrix_counters(child, weights, nodes);
            } else {
                *nodes.entry(child.p).or_insert(0) += 1;
                Self::count_weight(weights, child.w);
            }
        }
    }

    fn check_counters(
        &self,
        weights: &FxHashMap<usize, usize>,
        nodes: &FxHashMap<NodeIx, usize>,
        vector: bool,
    ) -> bool {
        for (&idx, &count) in weights.iter() {
            // the immortal 0/1 entries are exempt
            if idx <= 1 {
                continue;
            }
            if count > self.cn.table.ref_at(idx) as usize {
                return false;
            }
        }
        for (&p, &count) in nodes.iter() {
            let stored = if vector {
                self.v_unique.node(p).ref_count()
            } else {
                self.m_unique.node(p).ref_count()
            };
            if count != stored as usize {
                return false;
            }
        }
        true
    }
}
