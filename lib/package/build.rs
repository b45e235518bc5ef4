//! Construction of elementary states and gates: the all-zero state,
//! computational and general basis states, single-gate matrices with
//! arbitrary control lines, identities, and Toffoli gates.

use std::f64::consts::FRAC_1_SQRT_2 as ONRT2;
use num_complex::Complex64 as C64;
use crate::{
    edge::{
        BasisState, Control, ControlKind, GateMatrix, MEdge, NEDGE, Qubit,
        QubitCount, RADIX, VEdge,
    },
    package::{ DdError, DdResult, Package },
};

// per-level tag of a gate's control line
const LINE_FREE: i8 = -1;
const LINE_NEG: i8 = 0;
const LINE_POS: i8 = 1;
const LINE_TARGET: i8 = 2;

impl Package {
    /// Build the `n`-qubit all-zero state `|0…0⟩`.
    pub fn make_zero_state(&mut self, n: QubitCount) -> VEdge {
        let mut f = VEdge::ONE;
        for p in 0..n {
            f = self.make_vector_node(p as Qubit, [f, VEdge::ZERO], false);
        }
        f
    }

    /// Build the computational basis state selected by `bits`, where
    /// `bits[q]` is the value of qubit `q`.
    pub fn make_basis_state(
        &mut self,
        n: QubitCount,
        bits: &[bool],
    ) -> DdResult<VEdge> {
        if bits.len() < n {
            return Err(DdError::InsufficientQubitStates {
                requested: n,
                provided: bits.len(),
            });
        }
        let mut f = VEdge::ONE;
        for p in 0..n {
            f = if bits[p] {
                self.make_vector_node(p as Qubit, [VEdge::ZERO, f], false)
            } else {
                self.make_vector_node(p as Qubit, [f, VEdge::ZERO], false)
            };
        }
        Ok(f)
    }

    /// Build a product state with an arbitrary single-qubit basis state on
    /// each line.
    pub fn make_general_basis_state(
        &mut self,
        n: QubitCount,
        state: &[BasisState],
    ) -> DdResult<VEdge> {
        if state.len() < n {
            return Err(DdError::InsufficientQubitStates {
                requested: n,
                provided: state.len(),
            });
        }
        let mut f = VEdge::ONE;
        for p in 0..n {
            let v = p as Qubit;
            f = match state[p] {
                BasisState::Zero => {
                    self.make_vector_node(v, [f, VEdge::ZERO], false)
                }
                BasisState::One => {
                    self.make_vector_node(v, [VEdge::ZERO, f], false)
                }
                BasisState::Plus => {
                    let w = self.cn.lookup(ONRT2, 0.0);
                    let edges = [VEdge { p: f.p, w }, VEdge { p: f.p, w }];
                    self.make_vector_node(v, edges, false)
                }
                BasisState::Minus => {
                    let wp = self.cn.lookup(ONRT2, 0.0);
                    let wm = self.cn.lookup(-ONRT2, 0.0);
                    let edges = [VEdge { p: f.p, w: wp }, VEdge { p: f.p, w: wm }];
                    self.make_vector_node(v, edges, false)
                }
                BasisState::Right => {
                    let wp = self.cn.lookup(ONRT2, 0.0);
                    let wi = self.cn.lookup(0.0, ONRT2);
                    let edges = [VEdge { p: f.p, w: wp }, VEdge { p: f.p, w: wi }];
                    self.make_vector_node(v, edges, false)
                }
                BasisState::Left => {
                    let wp = self.cn.lookup(ONRT2, 0.0);
                    let wi = self.cn.lookup(0.0, -ONRT2);
                    let edges = [VEdge { p: f.p, w: wp }, VEdge { p: f.p, w: wi }];
                    self.make_vector_node(v, edges, false)
                }
            };
        }
        Ok(f)
    }

    /// Build the `n`-qubit diagram of a single 2×2 gate applied to `target`,
    /// with the given (possibly empty) set of positive/negative controls.
    pub fn make_gate_dd(
        &mut self,
        mat: &GateMatrix,
        n: QubitCount,
        controls: &[Control],
        target: Qubit,
    ) -> DdResult<MEdge> {
        if n > self.qubits() {
            return Err(DdError::InsufficientCapacity {
                needed: n,
                have: self.qubits(),
            });
        }
        let mut line = vec![LINE_FREE; n];
        if target < 0 || target as usize >= n {
            return Err(DdError::LineOutOfRange { qubit: target, n });
        }
        line[target as usize] = LINE_TARGET;
        for control in controls.iter() {
            if control.qubit < 0 || control.qubit as usize >= n {
                return Err(DdError::LineOutOfRange { qubit: control.qubit, n });
            }
            line[control.qubit as usize] = match control.kind {
                ControlKind::Pos => LINE_POS,
                ControlKind::Neg => LINE_NEG,
            };
        }
        Ok(self.gate_dd_from_line(mat, n, &line))
    }

    fn gate_dd_from_line(
        &mut self,
        mat: &GateMatrix,
        n: QubitCount,
        line: &[i8],
    ) -> MEdge {
        let mut em = [MEdge::ZERO; NEDGE];
        for i in 0..NEDGE {
            if mat[i].re == 0.0 && mat[i].im == 0.0 {
                em[i] = MEdge::ZERO;
            } else {
                let w = self.cn.lookup(mat[i].re, mat[i].im);
                em[i] = MEdge::terminal(w);
            }
        }

        // expand the four matrix entries through the lines below the target
        let mut z: usize = 0;
        while line[z] != LINE_TARGET {
            for i1 in 0..RADIX {
                for i2 in 0..RADIX {
                    let i = i1 * RADIX + i2;
                    let v = z as Qubit;
                    em[i] = match line[z] {
                        LINE_NEG => {
                            let lower = if i1 == i2 {
                                self.make_ident_range(0, v - 1)
                            } else {
                                MEdge::ZERO
                            };
                            self.make_matrix_node(
                                v,
                                [em[i], MEdge::ZERO, MEdge::ZERO, lower],
                                false,
                            )
                        }
                        LINE_POS => {
                            let upper = if i1 == i2 {
                                self.make_ident_range(0, v - 1)
                            } else {
                                MEdge::ZERO
                            };
                            self.make_matrix_node(
                                v,
                                [upper, MEdge::ZERO, MEdge::ZERO, em[i]],
                                false,
                            )
                        }
                        _ => self.make_matrix_node(
                            v,
                            [em[i], MEdge::ZERO, MEdge::ZERO, em[i]],
                            false,
                        ),
                    };
                }
            }
            z += 1;
        }

        // fold the four entries at the target level
        let mut e = self.make_matrix_node(z as Qubit, em, false);

        // wrap through the lines above the target
        z += 1;
        while z < n {
            let v = z as Qubit;
            e = match line[z] {
                LINE_NEG => {
                    let lower = self.make_ident_range(0, v - 1);
                    self.make_matrix_node(
                        v,
                        [e, MEdge::ZERO, MEdge::ZERO, lower],
                        false,
                    )
                }
                LINE_POS => {
                    let upper = self.make_ident_range(0, v - 1);
                    self.make_matrix_node(
                        v,
                        [upper, MEdge::ZERO, MEdge::ZERO, e],
                        false,
                    )
                }
                _ => self.make_matrix_node(
                    v,
                    [e, MEdge::ZERO, MEdge::ZERO, e],
                    false,
                ),
            };
            z += 1;
        }
        e
    }

    /// The `n`-qubit identity diagram.
    pub fn make_ident(&mut self, n: QubitCount) -> MEdge {
        self.make_ident_range(0, (n as isize - 1) as Qubit)
    }

    /// The identity over qubit levels `lsq..=msq`. Identities starting at
    /// level 0 are memoized; the memo table is dropped with the compute
    /// tables.
    pub fn make_ident_range(&mut self, lsq: Qubit, msq: Qubit) -> MEdge {
        if msq < 0 {
            return MEdge::ONE;
        }
        if lsq == 0 {
            if !self.id_table[msq as usize].is_zero() {
                return self.id_table[msq as usize];
            }
            if msq >= 1 && !self.id_table[msq as usize - 1].is_zero() {
                let below = self.id_table[msq as usize - 1];
                let e = self.make_matrix_node(
                    msq,
                    [below, MEdge::ZERO, MEdge::ZERO, below],
                    false,
                );
                self.id_table[msq as usize] = e;
                return e;
            }
        }
        let mut e = self.make_matrix_node(
            lsq,
            [MEdge::ONE, MEdge::ZERO, MEdge::ZERO, MEdge::ONE],
            false,
        );
        for k in (lsq + 1)..=msq {
            e = self.make_matrix_node(k, [e, MEdge::ZERO, MEdge::ZERO, e], false);
        }
        if lsq == 0 {
            self.id_table[msq as usize] = e;
        }
        e
    }

    /// Build (or fetch from the Toffoli cache) the multiply-controlled NOT
    /// with the given control set and target.
    pub fn make_toffoli_dd(
        &mut self,
        n: QubitCount,
        controls: &[Control],
        target: Qubit,
    ) -> DdResult<MEdge> {
        if let Some(e) = self.toffoli_table.lookup(n, controls, target) {
            return Ok(e);
        }
        let not_mat: GateMatrix = [
            C64::new(0.0, 0.0),
            C64::new(1.0, 0.0),
            C64::new(1.0, 0.0),
            C64::new(0.0, 0.0),
        ];
        let e = self.make_gate_dd(&not_mat, n, controls, target)?;
        self.toffoli_table.insert(n, controls, target, e);
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64 as C64;

    fn x_mat() -> GateMatrix {
        [
            C64::new(0.0, 0.0),
            C64::new(1.0, 0.0),
            C64::new(1.0, 0.0),
            C64::new(0.0, 0.0),
        ]
    }

    fn h_mat() -> GateMatrix {
        [
            C64::new(ONRT2, 0.0),
            C64::new(ONRT2, 0.0),
            C64::new(ONRT2, 0.0),
            C64::new(-ONRT2, 0.0),
        ]
    }

    #[test]
    fn zero_state_amplitudes() {
        let mut dd = Package::new(3).unwrap();
        let e = dd.make_zero_state(3);
        assert!((dd.get_vector_amplitude(e, 0).re - 1.0).abs() < 1e-12);
        for i in 1..8 {
            assert_eq!(dd.get_vector_amplitude(e, i), C64::new(0.0, 0.0));
        }
    }

    #[test]
    fn basis_state_selects_index() {
        let mut dd = Package::new(3).unwrap();
        // |q2 q1 q0> = |101> -> index 5
        let e = dd.make_basis_state(3, &[true, false, true]).unwrap();
        assert!((dd.get_vector_amplitude(e, 5).re - 1.0).abs() < 1e-12);
        assert_eq!(dd.get_vector_amplitude(e, 2), C64::new(0.0, 0.0));
    }

    #[test]
    fn short_basis_state_is_rejected() {
        let mut dd = Package::new(3).unwrap();
        assert!(matches!(
            dd.make_basis_state(3, &[true, false]),
            Err(DdError::InsufficientQubitStates { requested: 3, provided: 2 }),
        ));
        assert!(matches!(
            dd.make_general_basis_state(2, &[BasisState::Plus]),
            Err(DdError::InsufficientQubitStates { .. }),
        ));
    }

    #[test]
    fn plus_state_is_uniform() {
        let mut dd = Package::new(2).unwrap();
        let e = dd
            .make_general_basis_state(2, &[BasisState::Plus, BasisState::Plus])
            .unwrap();
        for i in 0..4 {
            assert!((dd.get_vector_amplitude(e, i).re - 0.5).abs() < 1e-12);
        }
        let f = dd.fidelity(e, e);
        assert!((f - 1.0).abs() < 1e-12);
    }

    #[test]
    fn left_right_states_carry_phase() {
        let mut dd = Package::new(1).unwrap();
        let r = dd.make_general_basis_state(1, &[BasisState::Right]).unwrap();
        let amp = dd.get_vector_amplitude(r, 1);
        assert!(amp.re.abs() < 1e-12);
        assert!((amp.im - ONRT2).abs() < 1e-12);
        let l = dd.make_general_basis_state(1, &[BasisState::Left]).unwrap();
        let amp = dd.get_vector_amplitude(l, 1);
        assert!((amp.im + ONRT2).abs() < 1e-12);
    }

    #[test]
    fn uncontrolled_x_is_a_permutation() {
        let mut dd = Package::new(1).unwrap();
        let x = dd.make_gate_dd(&x_mat(), 1, &[], 0).unwrap();
        let m = dd.get_matrix(x);
        assert_eq!(m[[0, 0]], C64::new(0.0, 0.0));
        assert!((m[[0, 1]].re - 1.0).abs() < 1e-12);
        assert!((m[[1, 0]].re - 1.0).abs() < 1e-12);
        assert_eq!(m[[1, 1]], C64::new(0.0, 0.0));
    }

    #[test]
    fn cnot_matrix() {
        let mut dd = Package::new(2).unwrap();
        // control on qubit 1, target on qubit 0
        let cx = dd
            .make_gate_dd(&x_mat(), 2, &[Control::pos(1)], 0)
            .unwrap();
        let m = dd.get_matrix(cx);
        let expect = [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        for i in 0..4 {
            for j in 0..4 {
                assert!((m[[i, j]].re - expect[i][j]).abs() < 1e-12);
                assert!(m[[i, j]].im.abs() < 1e-12);
            }
        }
    }

    #[test]
    fn negative_control_fires_on_zero() {
        let mut dd = Package::new(2).unwrap();
        let cx = dd
            .make_gate_dd(&x_mat(), 2, &[Control::neg(1)], 0)
            .unwrap();
        let m = dd.get_matrix(cx);
        // block for q1 = 0 is X, block for q1 = 1 is I
        assert!((m[[0, 1]].re - 1.0).abs() < 1e-12);
        assert!((m[[1, 0]].re - 1.0).abs() < 1e-12);
        assert!((m[[2, 2]].re - 1.0).abs() < 1e-12);
        assert!((m[[3, 3]].re - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gate_line_bounds_are_checked() {
        let mut dd = Package::new(2).unwrap();
        assert!(matches!(
            dd.make_gate_dd(&x_mat(), 2, &[], 2),
            Err(DdError::LineOutOfRange { .. }),
        ));
        assert!(matches!(
            dd.make_gate_dd(&x_mat(), 2, &[Control::pos(5)], 0),
            Err(DdError::LineOutOfRange { .. }),
        ));
        assert!(matches!(
            dd.make_gate_dd(&x_mat(), 3, &[], 0),
            Err(DdError::InsufficientCapacity { .. }),
        ));
    }

    #[test]
    fn identity_is_memoized() {
        let mut dd = Package::new(4).unwrap();
        let a = dd.make_ident(4);
        let b = dd.make_ident(4);
        assert_eq!(a, b);
        // built iteratively: the 3-qubit identity is its diagonal child
        let sub = dd.make_ident(3);
        let edges = dd.matrix_unique_table().node(a.p).edges;
        assert_eq!(edges[0], sub);
        assert_eq!(edges[3], sub);
        assert!(edges[1].is_zero() && edges[2].is_zero());
    }

    #[test]
    fn hadamard_gate_builds_uniform_column() {
        let mut dd = Package::new(1).unwrap();
        let h = dd.make_gate_dd(&h_mat(), 1, &[], 0).unwrap();
        let m = dd.get_matrix(h);
        assert!((m[[0, 0]].re - ONRT2).abs() < 1e-12);
        assert!((m[[1, 1]].re + ONRT2).abs() < 1e-12);
    }

    #[test]
    fn toffoli_is_cached() {
        let mut dd = Package::new(3).unwrap();
        let controls = [Control::pos(2), Control::pos(1)];
        let a = dd.make_toffoli_dd(3, &controls, 0).unwrap();
        let b = dd.make_toffoli_dd(3, &controls, 0).unwrap();
        assert_eq!(a, b);
        let m = dd.get_matrix(a);
        // |110> <-> |111>
        assert!((m[[6, 7]].re - 1.0).abs() < 1e-12);
        assert!((m[[7, 6]].re - 1.0).abs() < 1e-12);
        assert!((m[[0, 0]].re - 1.0).abs() < 1e-12);
        assert_eq!(m[[6, 6]], C64::new(0.0, 0.0));
    }
}
