//! Reading amplitudes and dense representations back out of a diagram.

use ndarray::{ Array1, Array2 };
use num_complex::Complex64 as C64;
use rustc_hash::FxHashSet;
use crate::{
    complex::Complex,
    edge::{ MEdge, NodeIx, VEdge },
    package::Package,
};

impl Package {
    /// The amplitude at index `i` of the vector under `e`, following one path
    /// down the diagram.
    pub fn get_vector_amplitude(&mut self, e: VEdge, i: usize) -> C64 {
        if e.is_zero() {
            return C64::new(0.0, 0.0);
        }
        if e.is_terminal() {
            return self.cn.value_of(e.w);
        }
        self.vector_amplitude_rec(e, Complex::ONE, i)
    }

    fn vector_amplitude_rec(&mut self, e: VEdge, amp: Complex, i: usize) -> C64 {
        let c = self.cn.mul_cached(e.w, amp);
        if e.is_terminal() {
            self.cn.release_cached(c);
            return self.cn.value_of(c);
        }

        let node = self.v_unique.node(e.p);
        let one = i & (1usize << node.v) != 0;
        let edges = node.edges;

        let mut r = C64::new(0.0, 0.0);
        if !one && !self.cn.equals_zero(edges[0].w) {
            r = self.vector_amplitude_rec(edges[0], c, i);
        } else if one && !self.cn.equals_zero(edges[1].w) {
            r = self.vector_amplitude_rec(edges[1], c, i);
        }
        self.cn.release_cached(c);
        r
    }

    /// The entry at row `i`, column `j` of the matrix under `e`.
    pub fn get_matrix_entry(&mut self, e: MEdge, i: usize, j: usize) -> C64 {
        if e.is_zero() {
            return C64::new(0.0, 0.0);
        }
        if e.is_terminal() {
            return self.cn.value_of(e.w);
        }
        self.matrix_entry_rec(e, Complex::ONE, i, j)
    }

    fn matrix_entry_rec(
        &mut self,
        e: MEdge,
        amp: Complex,
        i: usize,
        j: usize,
    ) -> C64 {
        let c = self.cn.mul_cached(e.w, amp);
        if e.is_terminal() {
            self.cn.release_cached(c);
            return self.cn.value_of(c);
        }

        let node = self.m_unique.node(e.p);
        let row = i & (1usize << node.v) != 0;
        let col = j & (1usize << node.v) != 0;
        let k = (row as usize) * 2 + col as usize;
        let edges = node.edges;

        let mut r = C64::new(0.0, 0.0);
        if !self.cn.equals_zero(edges[k].w) {
            r = self.matrix_entry_rec(edges[k], c, i, j);
        }
        self.cn.release_cached(c);
        r
    }

    /// Materialize the full state vector under `e`, of length `2^(v+1)`.
    pub fn get_vector(&mut self, e: VEdge) -> Array1<C64> {
        let v = self.v_unique.v_of(e);
        let dim = 1usize << (v + 1);
        let mut vec = Array1::zeros(dim);
        if !e.is_zero() {
            self.fill_vector(e, Complex::ONE, 0, &mut vec);
        }
        vec
    }

    fn fill_vector(
        &mut self,
        e: VEdge,
        amp: Complex,
        i: usize,
        vec: &mut Array1<C64>,
    ) {
        let c = self.cn.mul_cached(e.w, amp);
        if e.is_terminal() {
            vec[i] = self.cn.value_of(c);
            self.cn.release_cached(c);
            return;
        }

        let node = self.v_unique.node(e.p);
        let x = i | (1usize << node.v);
        let edges = node.edges;

        if !self.cn.equals_zero(edges[0].w) {
            self.fill_vector(edges[0], c, i, vec);
        }
        if !self.cn.equals_zero(edges[1].w) {
            self.fill_vector(edges[1], c, x, vec);
        }
        self.cn.release_cached(c);
    }

    /// Materialize the full matrix under `e`, of shape `2^(v+1) × 2^(v+1)`.
    pub fn get_matrix(&mut self, e: MEdge) -> Array2<C64> {
        let v = self.m_unique.v_of(e);
        let dim = 1usize << (v + 1);
        let mut mat = Array2::zeros((dim, dim));
        if !e.is_zero() {
            self.fill_matrix(e, Complex::ONE, 0, 0, &mut mat);
        }
        mat
    }

    fn fill_matrix(
        &mut self,
        e: MEdge,
        amp: Complex,
        i: usize,
        j: usize,
        mat: &mut Array2<C64>,
    ) {
        let c = self.cn.mul_cached(e.w, amp);
        if e.is_terminal() {
            mat[[i, j]] = self.cn.value_of(c);
            self.cn.release_cached(c);
            return;
        }

        let node = self.m_unique.node(e.p);
        let x = i | (1usize << node.v);
        let y = j | (1usize << node.v);
        let edges = node.edges;

        if !self.cn.equals_zero(edges[0].w) {
            self.fill_matrix(edges[0], c, i, j, mat);
        }
        if !self.cn.equals_zero(edges[1].w) {
            self.fill_matrix(edges[1], c, i, y, mat);
        }
        if !self.cn.equals_zero(edges[2].w) {
            self.fill_matrix(edges[2], c, x, j, mat);
        }
        if !self.cn.equals_zero(edges[3].w) {
            self.fill_matrix(edges[3], c, x, y, mat);
        }
        self.cn.release_cached(c);
    }

    /// Number of distinct nodes in the vector diagram under `e`, terminal
    /// included.
    pub fn vector_node_count(&self, e: VEdge) -> usize {
        let mut visited: FxHashSet<NodeIx> = FxHashSet::default();
        self.count_vector_nodes(e, &mut visited)
    }

    /// Number of distinct nodes in the matrix diagram under `e`, terminal
    /// included.
    pub fn matrix_node_count(&self, e: MEdge) -> usize {
        let mut visited: FxHashSet<NodeIx> = FxHashSet::default();
        self.count_matrix_nodes(e, &mut visited)
    }

    fn count_vector_nodes(
        &self,
        e: VEdge,
        visited: &mut FxHashSet<NodeIx>,
    ) -> usize {
        visited.insert(e.p);
        let mut sum = 1;
        if !e.is_terminal() && !e.p.is_none() {
            for child in self.v_unique.node(e.p).edges {
                if !child.p.is_none() && !visited.contains(&child.p) {
                    sum += self.count_vector_nodes(child, visited);
                }
            }
        }
        sum
    }

    fn count_matrix_nodes(
        &self,
        e: MEdge,
        visited: &mut FxHashSet<NodeIx>,
    ) -> usize {
        visited.insert(e.p);
        let mut sum = 1;
        if !e.is_terminal() && !e.p.is_none() {
            for child in self.m_unique.node(e.p).edges {
                if !child.p.is_none() && !visited.contains(&child.p) {
                    sum += self.count_matrix_nodes(child, visited);
                }
            }
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_1_SQRT_2 as ONRT2;
    use crate::edge::{ BasisState, Control, GateMatrix };

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    #[test]
    fn amplitude_follows_paths() {
        let mut dd = Package::new(2).unwrap();
        let e = dd
            .make_general_basis_state(2, &[BasisState::Plus, BasisState::One])
            .unwrap();
        // |1> on qubit 1, |+> on qubit 0: indices 2 and 3
        assert_eq!(dd.get_vector_amplitude(e, 0), c(0.0, 0.0));
        assert!((dd.get_vector_amplitude(e, 2).re - ONRT2).abs() < 1e-12);
        assert!((dd.get_vector_amplitude(e, 3).re - ONRT2).abs() < 1e-12);
    }

    #[test]
    fn dense_vector_matches_amplitudes() {
        let mut dd = Package::new(3).unwrap();
        let e = dd
            .make_general_basis_state(
                3,
                &[BasisState::Plus, BasisState::Zero, BasisState::Minus],
            )
            .unwrap();
        let v = dd.get_vector(e);
        assert_eq!(v.len(), 8);
        for i in 0..8 {
            let a = dd.get_vector_amplitude(e, i);
            assert!((v[i] - a).norm() < 1e-12);
        }
        // total norm is one
        let norm: f64 = v.iter().map(|a| a.norm_sqr()).sum();
        assert!((norm - 1.0).abs() < 1e-12);
    }

    #[test]
    fn dense_matrix_of_identity() {
        let mut dd = Package::new(2).unwrap();
        let id = dd.make_ident(2);
        let m = dd.get_matrix(id);
        for i in 0..4 {
            for j in 0..4 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert!((m[[i, j]] - c(want, 0.0)).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn matrix_entries_by_index() {
        let mut dd = Package::new(2).unwrap();
        let xm: GateMatrix =
            [c(0.0, 0.0), c(1.0, 0.0), c(1.0, 0.0), c(0.0, 0.0)];
        let cx = dd.make_gate_dd(&xm, 2, &[Control::pos(1)], 0).unwrap();
        assert!((dd.get_matrix_entry(cx, 3, 2).re - 1.0).abs() < 1e-12);
        assert!((dd.get_matrix_entry(cx, 0, 0).re - 1.0).abs() < 1e-12);
        assert_eq!(dd.get_matrix_entry(cx, 3, 3), c(0.0, 0.0));
    }

    #[test]
    fn node_counts() {
        let mut dd = Package::new(3).unwrap();
        let zero = dd.make_zero_state(3);
        // a product state is a chain: 3 nodes plus the terminal
        assert_eq!(dd.vector_node_count(zero), 4);
        let id = dd.make_ident(3);
        assert_eq!(dd.matrix_node_count(id), 4);
        assert_eq!(dd.vector_node_count(VEdge::ZERO), 1);
    }

    #[test]
    fn zero_edge_extracts_to_zeros() {
        let mut dd = Package::new(1).unwrap();
        let v = dd.get_vector(VEdge::ZERO);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0], c(0.0, 0.0));
        assert_eq!(dd.get_vector_amplitude(VEdge::ZERO, 0), c(0.0, 0.0));
    }
}
