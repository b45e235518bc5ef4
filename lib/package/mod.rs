//! The package: one self-contained decision-diagram engine instance.
//!
//! A [`Package`] owns the float pool, the vector and matrix unique tables,
//! every compute table, and the identity cache. All graph construction funnels
//! through [`make_vector_node`][Package::make_vector_node] /
//! [`make_matrix_node`][Package::make_matrix_node]: a freshly assembled node
//! is normalized (pushing a canonical scalar out onto the incoming edge) and
//! then hash-consed through the unique table, so equal subgraphs are always
//! represented by the same node.
//!
//! Running a package from multiple threads concurrently is not supported;
//! separate packages are fully independent.

use thiserror::Error;
use crate::{
    complex::{ Complex, ComplexNumbers },
    compute::{
        ComputeTable, OperationTable, ToffoliTable, UnaryComputeTable,
    },
    edge::{
        MCachedEdge, MEdge, NEDGE, NodeIx, Qubit, RADIX, VCachedEdge, VEdge,
    },
    unique::UniqueTable,
};

mod build;
mod ops;
mod extract;
mod serialize;
mod consistency;

pub use serialize::SERIALIZATION_VERSION;

/// Maximum number of qubits a package can be created with, bounded by the
/// [`Qubit`] index type.
pub const MAX_POSSIBLE_QUBITS: usize = Qubit::MAX as usize + 1;

/// Default register size for [`Package::default`].
pub const DEFAULT_QUBITS: usize = 128;

#[derive(Debug, Error)]
pub enum DdError {
    #[error("requested {requested} qubits, but the package supports at most {max}")]
    TooManyQubits { requested: usize, max: usize },

    #[error("cannot shrink a package from {current} to {requested} qubits")]
    ShrinkingResize { current: usize, requested: usize },

    #[error("insufficient qubit states provided: requested {requested}, but received {provided}")]
    InsufficientQubitStates { requested: usize, provided: usize },

    #[error("qubit line {qubit} outside the {n}-qubit register")]
    LineOutOfRange { qubit: Qubit, n: usize },

    #[error("operation needs {needed} qubits, but the package holds {have}")]
    InsufficientCapacity { needed: usize, have: usize },

    #[error("unsupported serialization version {found}; current version is {current}")]
    SerializationVersion { found: f64, current: f64 },

    #[error("malformed serialization input: {0}")]
    MalformedSerialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DdResult<T> = Result<T, DdError>;

/// A complete decision-diagram engine over a fixed-size qubit register.
pub struct Package {
    /// Complex-number handling: float pool, cache lane, weight arithmetic.
    pub cn: ComplexNumbers,
    nqubits: usize,
    pub(crate) v_unique: UniqueTable<RADIX>,
    pub(crate) m_unique: UniqueTable<NEDGE>,
    pub(crate) vector_add: ComputeTable<VCachedEdge, VCachedEdge, VCachedEdge>,
    pub(crate) matrix_add: ComputeTable<MCachedEdge, MCachedEdge, MCachedEdge>,
    pub(crate) matrix_transpose: UnaryComputeTable<MEdge, MEdge>,
    pub(crate) conjugate_matrix_transpose: UnaryComputeTable<MEdge, MEdge>,
    pub(crate) matrix_multiplication: ComputeTable<MEdge, MEdge, MCachedEdge>,
    pub(crate) matrix_vector_multiplication: ComputeTable<MEdge, VEdge, VCachedEdge>,
    pub(crate) vector_inner_product: ComputeTable<VEdge, VEdge, VCachedEdge>,
    pub(crate) vector_kronecker: ComputeTable<VEdge, VEdge, VCachedEdge>,
    pub(crate) matrix_kronecker: ComputeTable<MEdge, MEdge, MCachedEdge>,
    pub(crate) toffoli_table: ToffoliTable,
    pub(crate) operation_table: OperationTable,
    pub(crate) id_table: Vec<MEdge>,
}

impl Default for Package {
    /// A package with the default register size of [`DEFAULT_QUBITS`].
    fn default() -> Self {
        Package::new(DEFAULT_QUBITS).expect("default register size is valid")
    }
}

impl Package {
    /// Create a package covering `nqubits` variable levels.
    pub fn new(nqubits: usize) -> DdResult<Self> {
        if nqubits > MAX_POSSIBLE_QUBITS {
            return Err(DdError::TooManyQubits {
                requested: nqubits,
                max: MAX_POSSIBLE_QUBITS,
            });
        }
        Ok(Self {
            cn: ComplexNumbers::new(),
            nqubits,
            v_unique: UniqueTable::new(nqubits),
            m_unique: UniqueTable::new(nqubits),
            vector_add: ComputeTable::new(),
            matrix_add: ComputeTable::new(),
            matrix_transpose: UnaryComputeTable::new(),
            conjugate_matrix_transpose: UnaryComputeTable::new(),
            matrix_multiplication: ComputeTable::new(),
            matrix_vector_multiplication: ComputeTable::new(),
            vector_inner_product: ComputeTable::new(),
            vector_kronecker: ComputeTable::new(),
            matrix_kronecker: ComputeTable::new(),
            toffoli_table: ToffoliTable::new(),
            operation_table: OperationTable::new(),
            id_table: vec![MEdge::ZERO; nqubits],
        })
    }

    /// Number of qubit levels covered by this package.
    pub fn qubits(&self) -> usize { self.nqubits }

    /// Grow the package to cover `nqubits` levels.
    pub fn resize(&mut self, nqubits: usize) -> DdResult<()> {
        if nqubits > MAX_POSSIBLE_QUBITS {
            return Err(DdError::TooManyQubits {
                requested: nqubits,
                max: MAX_POSSIBLE_QUBITS,
            });
        }
        if nqubits < self.nqubits {
            return Err(DdError::ShrinkingResize {
                current: self.nqubits,
                requested: nqubits,
            });
        }
        self.nqubits = nqubits;
        self.v_unique.resize(nqubits);
        self.m_unique.resize(nqubits);
        self.id_table.resize(nqubits, MEdge::ZERO);
        self.operation_table.clear();
        Ok(())
    }

    /// Clear all tables, preserving the immortal constants and terminals.
    pub fn reset(&mut self) {
        self.clear_unique_tables();
        self.clear_compute_tables();
        self.cn.clear();
    }

    /// Borrow the vector unique table.
    pub fn vector_unique_table(&self) -> &UniqueTable<RADIX> { &self.v_unique }

    /// Borrow the matrix unique table.
    pub fn matrix_unique_table(&self) -> &UniqueTable<NEDGE> { &self.m_unique }

    /// Borrow the noise-operation side table.
    pub fn operation_table_mut(&mut self) -> &mut OperationTable {
        &mut self.operation_table
    }

    ///
    /// reference counting
    ///

    /// Acquire a vector edge for the caller; recursive on first acquisition.
    pub fn inc_ref_vector(&mut self, e: VEdge) {
        self.v_unique.inc_ref(e, &mut self.cn);
    }

    /// Release a vector edge; recursive on last release.
    pub fn dec_ref_vector(&mut self, e: VEdge) {
        self.v_unique.dec_ref(e, &mut self.cn);
    }

    /// Acquire a matrix edge for the caller; recursive on first acquisition.
    pub fn inc_ref_matrix(&mut self, e: MEdge) {
        self.m_unique.inc_ref(e, &mut self.cn);
    }

    /// Release a matrix edge; recursive on last release.
    pub fn dec_ref_matrix(&mut self, e: MEdge) {
        self.m_unique.dec_ref(e, &mut self.cn);
    }

    ///
    /// garbage collection
    ///

    /// Collect unreferenced nodes and float entries, then wipe every compute
    /// table (their entries may reference slots that are reused immediately).
    ///
    /// Must only be called while no cached weights are outstanding and no
    /// half-built node is in flight; in practice, between top-level
    /// operations. Returns the number of objects collected.
    pub fn garbage_collect(&mut self, force: bool) -> usize {
        let v = self.v_unique.garbage_collect(force);
        let m = self.m_unique.garbage_collect(force);
        let c = self.cn.garbage_collect(force);
        self.clear_compute_tables();
        v + m + c
    }

    pub(crate) fn clear_unique_tables(&mut self) {
        self.v_unique.clear();
        self.m_unique.clear();
    }

    pub(crate) fn clear_compute_tables(&mut self) {
        self.vector_add.clear();
        self.matrix_add.clear();
        self.matrix_transpose.clear();
        self.conjugate_matrix_transpose.clear();
        self.matrix_multiplication.clear();
        self.matrix_vector_multiplication.clear();
        self.vector_inner_product.clear();
        self.vector_kronecker.clear();
        self.matrix_kronecker.clear();
        self.toffoli_table.clear();
        self.operation_table.clear();
        for entry in self.id_table.iter_mut() {
            *entry = MEdge::ZERO;
        }
    }

    ///
    /// node construction
    ///

    /// Build a normalized, canonical vector node over `edges` and return the
    /// edge pointing at it. `cached` marks the child weights as cache-lane
    /// weights to be subsumed by normalization.
    pub(crate) fn make_vector_node(
        &mut self,
        v: Qubit,
        edges: [VEdge; RADIX],
        cached: bool,
    ) -> VEdge {
        let p = self.v_unique.get_node();
        {
            let node = self.v_unique.node_mut(p);
            node.v = v;
            node.edges = edges;
        }
        debug_assert_eq!(self.v_unique.node(p).ref_count(), 0);
        debug_assert!(edges.iter().all(|c| {
            c.p.is_none() || c.is_terminal() || self.v_unique.v_of(*c) == v - 1
        }));

        let e = self.normalize_vector(VEdge { p, w: Complex::ONE }, cached);
        if e.is_zero() {
            return e;
        }
        debug_assert_eq!(self.v_unique.node(e.p).v, v);
        self.v_unique.lookup(e, false)
    }

    /// Build a normalized, canonical matrix node over `edges` and return the
    /// edge pointing at it. Freshly stored nodes get their symmetry/identity
    /// flags computed.
    pub(crate) fn make_matrix_node(
        &mut self,
        v: Qubit,
        edges: [MEdge; NEDGE],
        cached: bool,
    ) -> MEdge {
        let p = self.m_unique.get_node();
        {
            let node = self.m_unique.node_mut(p);
            node.v = v;
            node.edges = edges;
        }
        debug_assert_eq!(self.m_unique.node(p).ref_count(), 0);
        debug_assert!(edges.iter().all(|c| {
            c.p.is_none() || c.is_terminal() || self.m_unique.v_of(*c) == v - 1
        }));

        let e = self.normalize_matrix(MEdge { p, w: Complex::ONE }, cached);
        if e.is_zero() {
            return e;
        }
        debug_assert_eq!(self.m_unique.node(e.p).v, v);
        let l = self.m_unique.lookup(e, false);
        if l.p == e.p {
            self.check_special_matrices(l.p);
        }
        l
    }

    ///
    /// normalization
    ///

    /// Canonicalize a freshly built vector node: snap near-zero child weights
    /// to the structural zero, pull the pivot scale out onto the parent edge,
    /// and leave the node's weights unit-normalized (the squared child
    /// magnitudes sum to one).
    fn normalize_vector(&mut self, e: VEdge, cached: bool) -> VEdge {
        let p = e.p;
        let mut edges = self.v_unique.node(p).edges;

        let zero = [
            self.cn.equals_zero(edges[0].w),
            self.cn.equals_zero(edges[1].w),
        ];
        for i in 0..RADIX {
            if zero[i] && edges[i].w != Complex::ZERO {
                self.cn.release_cached(edges[i].w);
                edges[i] = VEdge::ZERO;
            }
        }

        let mut argmax: isize = -1;
        let mut sum = 0.0;
        let mut div = 0.0;
        for i in 0..RADIX {
            if edges[i].p.is_none() || zero[i] {
                continue;
            }
            if argmax == -1 {
                argmax = i as isize;
                div = self.cn.mag2(edges[i].w);
                sum = div;
            } else {
                sum += self.cn.mag2(edges[i].w);
            }
        }

        if argmax == -1 {
            if cached {
                for edge in edges.iter() {
                    if edge.p.is_none() && edge.w != Complex::ZERO {
                        self.cn.release_cached(edge.w);
                    }
                }
            }
            if !p.is_terminal() {
                self.v_unique.return_node(p);
            }
            return VEdge::ZERO;
        }
        let argmax = argmax as usize;

        let norm = (sum / div).sqrt();

        let mut r = e;
        let max_w = edges[argmax].w;
        if cached && max_w != Complex::ONE {
            r.w = max_w;
            let re = self.cn.val(r.w.re) * norm;
            let im = self.cn.val(r.w.im) * norm;
            self.cn.set_cached(r.w, re, im);
        } else {
            let re = self.cn.val(max_w.re) * norm;
            let im = self.cn.val(max_w.im) * norm;
            r.w = self.cn.lookup(re, im);
            if self.cn.equals_zero(r.w) {
                self.v_unique.return_node(p);
                return VEdge::ZERO;
            }
        }
        edges[argmax].w = self.cn.lookup(1.0 / norm, 0.0);
        if edges[argmax].w == Complex::ZERO {
            edges[argmax] = VEdge::ZERO;
        }

        let argmin = (argmax + 1) % RADIX;
        if !zero[argmin] {
            if cached {
                let min_w = edges[argmin].w;
                self.cn.release_cached(min_w);
                // the released slots still hold the operand
                self.cn.div(min_w, min_w, r.w);
                edges[argmin].w = self.cn.lookup_complex(min_w);
            } else {
                let t = self.cn.get_temp_cached();
                self.cn.div(t, edges[argmin].w, r.w);
                edges[argmin].w = self.cn.lookup_complex(t);
            }
            if edges[argmin].w == Complex::ZERO {
                edges[argmin] = VEdge::ZERO;
            }
        }

        self.v_unique.node_mut(p).edges = edges;
        r
    }

    /// Canonicalize a freshly built matrix node: snap near-zero child weights,
    /// pull the strictly-largest-magnitude weight out onto the parent edge
    /// (ties broken toward the lowest index), and divide the remaining child
    /// weights by it.
    fn normalize_matrix(&mut self, e: MEdge, cached: bool) -> MEdge {
        let p = e.p;
        let mut edges = self.m_unique.node(p).edges;

        let zero = [
            self.cn.equals_zero(edges[0].w),
            self.cn.equals_zero(edges[1].w),
            self.cn.equals_zero(edges[2].w),
            self.cn.equals_zero(edges[3].w),
        ];
        for i in 0..NEDGE {
            if zero[i] && edges[i].w != Complex::ZERO {
                self.cn.release_cached(edges[i].w);
                edges[i] = MEdge::ZERO;
            }
        }

        let mut argmax: isize = -1;
        let mut max_mag = 0.0;
        let mut max_w = Complex::ONE;
        for i in 0..NEDGE {
            if zero[i] {
                continue;
            }
            if argmax == -1 {
                argmax = i as isize;
                max_mag = self.cn.mag2(edges[i].w);
                max_w = edges[i].w;
            } else {
                let mag = self.cn.mag2(edges[i].w);
                if mag - max_mag > self.cn.tolerance() {
                    argmax = i as isize;
                    max_mag = mag;
                    max_w = edges[i].w;
                }
            }
        }

        if argmax == -1 {
            if cached {
                for edge in edges.iter() {
                    if edge.w != Complex::ZERO {
                        self.cn.release_cached(edge.w);
                    }
                }
            }
            if !p.is_terminal() {
                self.m_unique.return_node(p);
            }
            return MEdge::ZERO;
        }
        let argmax = argmax as usize;

        let mut r = e;
        for i in 0..NEDGE {
            if i == argmax {
                if cached {
                    if r.w == Complex::ONE {
                        r.w = max_w;
                    } else {
                        self.cn.mul(r.w, r.w, max_w);
                    }
                } else if r.w == Complex::ONE {
                    r.w = max_w;
                } else {
                    let t = self.cn.get_temp_cached();
                    self.cn.mul(t, r.w, max_w);
                    r.w = self.cn.lookup_complex(t);
                }
                edges[i].w = Complex::ONE;
            } else {
                if zero[i] {
                    if cached && edges[i].w != Complex::ZERO {
                        self.cn.release_cached(edges[i].w);
                    }
                    edges[i] = MEdge::ZERO;
                    continue;
                }
                if cached && edges[i].w != Complex::ONE {
                    self.cn.release_cached(edges[i].w);
                }
                if self.cn.equals_one(edges[i].w) {
                    edges[i].w = Complex::ONE;
                }
                let t = self.cn.get_temp_cached();
                self.cn.div(t, edges[i].w, max_w);
                edges[i].w = self.cn.lookup_complex(t);
                if edges[i].w == Complex::ZERO {
                    edges[i] = MEdge::ZERO;
                }
            }
        }

        self.m_unique.node_mut(p).edges = edges;
        r
    }

    /// Compute the symmetry and identity flags of a freshly stored matrix
    /// node from its children.
    fn check_special_matrices(&mut self, p: NodeIx) {
        if self.m_unique.node(p).v == -1 {
            return;
        }
        {
            let node = self.m_unique.node_mut(p);
            node.ident = false;
            node.symm = false;
        }
        let edges = self.m_unique.node(p).edges;

        // symmetric iff both diagonal blocks are and the off-diagonal blocks
        // are transposes of each other
        let symm0 = edges[0].p.is_none() || self.m_unique.node(edges[0].p).symm;
        let symm3 = edges[3].p.is_none() || self.m_unique.node(edges[3].p).symm;
        if !symm0 || !symm3 {
            return;
        }
        if self.transpose(edges[1]) != edges[2] {
            return;
        }
        self.m_unique.node_mut(p).symm = true;

        if edges[0].w != Complex::ONE
            || edges[3].w != Complex::ONE
            || edges[1].w != Complex::ZERO
            || edges[2].w != Complex::ZERO
        {
            return;
        }
        let ident0 =
            !edges[0].p.is_none() && self.m_unique.node(edges[0].p).ident;
        let ident3 =
            !edges[3].p.is_none() && self.m_unique.node(edges[3].p).ident;
        if !ident0 || !ident3 {
            return;
        }
        self.m_unique.node_mut(p).ident = true;
    }
}
