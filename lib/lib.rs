//! A decision-diagram engine for quantum computing.
//!
//! Quantum state vectors and operator matrices over `n` qubits are stored as
//! rooted, ordered, reduced DAGs whose edges carry complex weights:
//!
//! - [`complex`] holds the deduplicating float pool and the cache lane of
//! scratch weights that all edge weights are drawn from.
//! - [`edge`] defines the shared node/edge data model for the radix-2
//! (vector) and radix-4 (matrix) diagrams.
//! - [`unique`] hash-conses nodes so that structurally equal subgraphs are
//! physically shared, with reference counting and garbage collection.
//! - [`compute`] memoizes the recursive operators in fixed-size caches.
//! - [`package`] ties everything together into a [`Package`]: state and gate
//! builders, addition, multiplication, Kronecker products, inner products,
//! traces, ancilla/garbage reduction, dense extraction, and snapshot
//! serialization.
//!
//! ```
//! use qdd::{ Control, Package };
//! use num_complex::Complex64 as C64;
//! use std::f64::consts::FRAC_1_SQRT_2;
//!
//! let mut dd = Package::new(2).unwrap();
//!
//! // |00>, then a Hadamard on qubit 1 and a CNOT onto qubit 0
//! let h = [
//!     C64::new(FRAC_1_SQRT_2, 0.0), C64::new(FRAC_1_SQRT_2, 0.0),
//!     C64::new(FRAC_1_SQRT_2, 0.0), C64::new(-FRAC_1_SQRT_2, 0.0),
//! ];
//! let x = [
//!     C64::new(0.0, 0.0), C64::new(1.0, 0.0),
//!     C64::new(1.0, 0.0), C64::new(0.0, 0.0),
//! ];
//! let zero = dd.make_zero_state(2);
//! let h1 = dd.make_gate_dd(&h, 2, &[], 1).unwrap();
//! let cx = dd.make_gate_dd(&x, 2, &[Control::pos(1)], 0).unwrap();
//! let state = dd.multiply_matrix_vector(h1, zero);
//! let bell = dd.multiply_matrix_vector(cx, state);
//!
//! let amps = dd.get_vector(bell);
//! assert!((amps[0].re - FRAC_1_SQRT_2).abs() < 1e-12);
//! assert!((amps[3].re - FRAC_1_SQRT_2).abs() < 1e-12);
//! assert!((dd.fidelity(bell, bell) - 1.0).abs() < 1e-12);
//! ```
//!
//! A package is strictly single-threaded; shard at the package boundary to
//! parallelize.

pub mod complex;
pub mod edge;
pub mod unique;
pub mod compute;
pub mod package;

pub use complex::{ Complex, ComplexNumbers, ComplexTable, CxRef };
pub use edge::{
    BasisState, CachedEdge, Control, ControlKind, DdNode, Edge, GateMatrix,
    MCachedEdge, MEdge, NodeIx, Qubit, QubitCount, VCachedEdge, VEdge,
};
pub use package::{
    DdError, DdResult, Package, MAX_POSSIBLE_QUBITS, SERIALIZATION_VERSION,
};

pub extern crate num_complex;
