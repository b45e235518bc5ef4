//! Versioned snapshot format for decision diagrams, in a text and a binary
//! flavor.
//!
//! A snapshot starts with the format version and the root edge's weight,
//! followed by one record per node in bottom-up order: the node's index, its
//! variable, and for each outgoing edge the child index plus the edge weight.
//! Child index `-1` denotes the terminal and `-2` the structural zero edge
//! (written as an empty group in the text form). Deserialization rebuilds the
//! diagram through the normalizing node constructors, so a reloaded snapshot
//! lands on canonical nodes.

use std::io::{ BufRead, ErrorKind, Read, Write };
use itertools::Itertools;
use num_complex::Complex64 as C64;
use rustc_hash::FxHashMap;
use crate::{
    complex::Complex,
    edge::{ MEdge, NEDGE, NodeIx, Qubit, RADIX, VEdge },
    package::{ DdError, DdResult, Package },
};

/// Version constant written into (and required of) every snapshot.
pub const SERIALIZATION_VERSION: f64 = 0.1;

fn format_complex(v: C64) -> String {
    let im = if v.im == 0.0 { 0.0 } else { v.im };
    if im < 0.0 {
        format!("{}-{}i", v.re, -im)
    } else {
        format!("{}+{}i", v.re, im)
    }
}

fn parse_f64(s: &str) -> DdResult<f64> {
    s.trim().parse::<f64>().map_err(|_| {
        DdError::MalformedSerialization(format!("invalid float: {:?}", s))
    })
}

fn parse_complex(s: &str) -> DdResult<C64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(C64::new(0.0, 0.0));
    }
    let stripped = s.strip_suffix('i').or_else(|| s.strip_suffix('I'));
    let Some(stripped) = stripped else {
        return Ok(C64::new(parse_f64(s)?, 0.0));
    };
    let stripped = stripped.trim();
    // split the imaginary term off at the last sign not part of an exponent
    let bytes = stripped.as_bytes();
    let mut split = None;
    for k in (1..bytes.len()).rev() {
        if (bytes[k] == b'+' || bytes[k] == b'-')
            && bytes[k - 1] != b'e'
            && bytes[k - 1] != b'E'
        {
            split = Some(k);
            break;
        }
    }
    match split {
        Some(k) => {
            let re = parse_f64(&stripped[..k])?;
            let im_str = stripped[k..].trim();
            let im = match im_str {
                "+" => 1.0,
                "-" => -1.0,
                _ => parse_f64(im_str)?,
            };
            Ok(C64::new(re, im))
        }
        None => {
            let im = match stripped {
                "" | "+" => 1.0,
                "-" => -1.0,
                _ => parse_f64(stripped)?,
            };
            Ok(C64::new(0.0, im))
        }
    }
}

fn read_f64<R: Read>(input: &mut R) -> std::io::Result<f64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_i64<R: Read>(input: &mut R) -> std::io::Result<i64> {
    let mut buf = [0u8; 8];
    input.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_i8<R: Read>(input: &mut R) -> std::io::Result<i8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(i8::from_le_bytes(buf))
}

type EdgeSpec = Option<(i64, C64)>;

fn parse_node_line(
    line: &str,
    n_edges: usize,
) -> DdResult<(i64, Qubit, Vec<EdgeSpec>)> {
    let head_end = line.find('(').unwrap_or(line.len());
    let mut head = line[..head_end].split_whitespace();
    let malformed =
        || DdError::MalformedSerialization(format!("bad node line: {:?}", line));
    let idx: i64 =
        head.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;
    let v: Qubit =
        head.next().ok_or_else(malformed)?.parse().map_err(|_| malformed())?;

    let mut specs = Vec::with_capacity(n_edges);
    let mut rest = &line[head_end..];
    while let Some(open) = rest.find('(') {
        let close =
            rest[open..].find(')').ok_or_else(malformed)? + open;
        let inner = rest[open + 1..close].trim();
        if inner.is_empty() {
            specs.push(None);
        } else {
            let mut parts = inner.splitn(2, char::is_whitespace);
            let cidx: i64 = parts
                .next()
                .ok_or_else(malformed)?
                .parse()
                .map_err(|_| malformed())?;
            let w = parse_complex(parts.next().unwrap_or(""))?;
            specs.push(Some((cidx, w)));
        }
        rest = &rest[close + 1..];
    }
    if specs.len() != n_edges {
        return Err(malformed());
    }
    Ok((idx, v, specs))
}

fn check_version(found: f64) -> DdResult<()> {
    if found != SERIALIZATION_VERSION {
        return Err(DdError::SerializationVersion {
            found,
            current: SERIALIZATION_VERSION,
        });
    }
    Ok(())
}

impl Package {
    /// Write a snapshot of the vector diagram under `e`.
    pub fn serialize_vector<W: Write>(
        &self,
        e: VEdge,
        out: &mut W,
        binary: bool,
    ) -> DdResult<()> {
        let root_w = self.cn.value_of(e.w);
        if binary {
            out.write_all(&SERIALIZATION_VERSION.to_le_bytes())?;
            out.write_all(&root_w.re.to_le_bytes())?;
            out.write_all(&root_w.im.to_le_bytes())?;
        } else {
            writeln!(out, "{}", SERIALIZATION_VERSION)?;
            writeln!(out, "{}", format_complex(root_w))?;
        }
        if !e.p.is_none() && !e.is_terminal() {
            let mut indices: FxHashMap<NodeIx, i64> = FxHashMap::default();
            let mut next = 0;
            self.write_vector_nodes(e.p, &mut indices, &mut next, out, binary)?;
        }
        Ok(())
    }

    /// Write a snapshot of the matrix diagram under `e`.
    pub fn serialize_matrix<W: Write>(
        &self,
        e: MEdge,
        out: &mut W,
        binary: bool,
    ) -> DdResult<()> {
        let root_w = self.cn.value_of(e.w);
        if binary {
            out.write_all(&SERIALIZATION_VERSION.to_le_bytes())?;
            out.write_all(&root_w.re.to_le_bytes())?;
            out.write_all(&root_w.im.to_le_bytes())?;
        } else {
            writeln!(out, "{}", SERIALIZATION_VERSION)?;
            writeln!(out, "{}", format_complex(root_w))?;
        }
        if !e.p.is_none() && !e.is_terminal() {
            let mut indices: FxHashMap<NodeIx, i64> = FxHashMap::default();
            let mut next = 0;
            self.write_matrix_nodes(e.p, &mut indices, &mut next, out, binary)?;
        }
        Ok(())
    }

    fn write_vector_nodes<W: Write>(
        &self,
        p: NodeIx,
        indices: &mut FxHashMap<NodeIx, i64>,
        next: &mut i64,
        out: &mut W,
        binary: bool,
    ) -> DdResult<i64> {
        if let Some(&ix) = indices.get(&p) {
            return Ok(ix);
        }
        let v = self.v_unique.node(p).v;
        let edges = self.v_unique.node(p).edges;

        let mut child_ix = [-2i64; RADIX];
        for i in 0..RADIX {
            child_ix[i] = if edges[i].p.is_none() {
                -2
            } else if edges[i].is_terminal() {
                -1
            } else {
                self.write_vector_nodes(edges[i].p, indices, next, out, binary)?
            };
        }

        let ix = *next;
        *next += 1;
        indices.insert(p, ix);

        if binary {
            out.write_all(&ix.to_le_bytes())?;
            out.write_all(&v.to_le_bytes())?;
            for i in 0..RADIX {
                out.write_all(&child_ix[i].to_le_bytes())?;
                let w = self.cn.value_of(edges[i].w);
                out.write_all(&w.re.to_le_bytes())?;
                out.write_all(&w.im.to_le_bytes())?;
            }
        } else {
            let groups = (0..RADIX)
                .map(|i| {
                    if child_ix[i] == -2 {
                        "()".to_string()
                    } else {
                        let w = self.cn.value_of(edges[i].w);
                        format!("({} {})", child_ix[i], format_complex(w))
                    }
                })
                .join(" ");
            writeln!(out, "{} {} {}", ix, v, groups)?;
        }
        Ok(ix)
    }

    fn write_matrix_nodes<W: Write>(
        &self,
        p: NodeIx,
        indices: &mut FxHashMap<NodeIx, i64>,
        next: &mut i64,
        out: &mut W,
        binary: bool,
    ) -> DdResult<i64> {
        if let Some(&ix) = indices.get(&p) {
            return Ok(ix);
        }
        let v = self.m_unique.node(p).v;
        let edges = self.m_unique.node(p).edges;

        let mut child_ix = [-2i64; NEDGE];
        for i in 0..NEDGE {
            child_ix[i] = if edges[i].p.is_none() {
                -2
            } else if edges[i].is_terminal() {
                -1
            } else {
                self.write_matrix_nodes(edges[i].p, indices, next, out, binary)?
            };
        }

        let ix = *next;
        *next += 1;
        indices.insert(p, ix);

        if binary {
            out.write_all(&ix.to_le_bytes())?;
            out.write_all(&v.to_le_bytes())?;
            for i in 0..NEDGE {
                out.write_all(&child_ix[i].to_le_bytes())?;
                let w = self.cn.value_of(edges[i].w);
                out.write_all(&w.re.to_le_bytes())?;
                out.write_all(&w.im.to_le_bytes())?;
            }
        } else {
            let groups = (0..NEDGE)
                .map(|i| {
                    if child_ix[i] == -2 {
                        "()".to_string()
                    } else {
                        let w = self.cn.value_of(edges[i].w);
                        format!("({} {})", child_ix[i], format_complex(w))
                    }
                })
                .join(" ");
            writeln!(out, "{} {} {}", ix, v, groups)?;
        }
        Ok(ix)
    }

    /// Read a vector-diagram snapshot, rebuilding it in this package.
    pub fn deserialize_vector<R: BufRead>(
        &mut self,
        input: &mut R,
        binary: bool,
    ) -> DdResult<VEdge> {
        let mut nodes: FxHashMap<i64, NodeIx> = FxHashMap::default();
        let mut result = VEdge::ONE;
        let rootweight;

        if binary {
            check_version(read_f64(input)?)?;
            rootweight = match read_f64(input) {
                Ok(re) => C64::new(re, read_f64(input)?),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    C64::new(0.0, 0.0)
                }
                Err(e) => return Err(e.into()),
            };
            loop {
                let idx = match read_i64(input) {
                    Ok(idx) => idx,
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                };
                let v = read_i8(input)?;
                let mut specs = Vec::with_capacity(RADIX);
                for _ in 0..RADIX {
                    let cidx = read_i64(input)?;
                    let re = read_f64(input)?;
                    let im = read_f64(input)?;
                    specs.push(if cidx == -2 {
                        None
                    } else {
                        Some((cidx, C64::new(re, im)))
                    });
                }
                let e = self.build_vector_node(v, &specs, &nodes)?;
                nodes.insert(idx, e.p);
                result = e;
            }
        } else {
            let mut version_line = String::new();
            if input.read_line(&mut version_line)? == 0 {
                return Err(DdError::MalformedSerialization(
                    "missing version line".into(),
                ));
            }
            check_version(parse_f64(&version_line)?)?;

            let mut root_line = String::new();
            rootweight = if input.read_line(&mut root_line)? == 0 {
                C64::new(0.0, 0.0)
            } else {
                parse_complex(&root_line)?
            };

            for line in input.lines() {
                let line = line?;
                if line.trim().len() <= 1 {
                    continue;
                }
                let (idx, v, specs) = parse_node_line(&line, RADIX)?;
                let e = self.build_vector_node(v, &specs, &nodes)?;
                nodes.insert(idx, e.p);
                result = e;
            }
        }

        Ok(self.apply_root_weight_vector(result, rootweight))
    }

    /// Read a matrix-diagram snapshot, rebuilding it in this package.
    pub fn deserialize_matrix<R: BufRead>(
        &mut self,
        input: &mut R,
        binary: bool,
    ) -> DdResult<MEdge> {
        let mut nodes: FxHashMap<i64, NodeIx> = FxHashMap::default();
        let mut result = MEdge::ONE;
        let rootweight;

        if binary {
            check_version(read_f64(input)?)?;
            rootweight = match read_f64(input) {
                Ok(re) => C64::new(re, read_f64(input)?),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    C64::new(0.0, 0.0)
                }
                Err(e) => return Err(e.into()),
            };
            loop {
                let idx = match read_i64(input) {
                    Ok(idx) => idx,
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                };
                let v = read_i8(input)?;
                let mut specs = Vec::with_capacity(NEDGE);
                for _ in 0..NEDGE {
                    let cidx = read_i64(input)?;
                    let re = read_f64(input)?;
                    let im = read_f64(input)?;
                    specs.push(if cidx == -2 {
                        None
                    } else {
                        Some((cidx, C64::new(re, im)))
                    });
                }
                let e = self.build_matrix_node(v, &specs, &nodes)?;
                nodes.insert(idx, e.p);
                result = e;
            }
        } else {
            let mut version_line = String::new();
            if input.read_line(&mut version_line)? == 0 {
                return Err(DdError::MalformedSerialization(
                    "missing version line".into(),
                ));
            }
            check_version(parse_f64(&version_line)?)?;

            let mut root_line = String::new();
            rootweight = if input.read_line(&mut root_line)? == 0 {
                C64::new(0.0, 0.0)
            } else {
                parse_complex(&root_line)?
            };

            for line in input.lines() {
                let line = line?;
                if line.trim().len() <= 1 {
                    continue;
                }
                let (idx, v, specs) = parse_node_line(&line, NEDGE)?;
                let e = self.build_matrix_node(v, &specs, &nodes)?;
                nodes.insert(idx, e.p);
                result = e;
            }
        }

        Ok(self.apply_root_weight_matrix(result, rootweight))
    }

    fn build_vector_node(
        &mut self,
        v: Qubit,
        specs: &[EdgeSpec],
        nodes: &FxHashMap<i64, NodeIx>,
    ) -> DdResult<VEdge> {
        let mut edges = [VEdge::ZERO; RADIX];
        for (i, spec) in specs.iter().enumerate() {
            let Some((cidx, w)) = *spec else { continue };
            let p = match cidx {
                -1 => NodeIx::TERMINAL,
                _ => *nodes.get(&cidx).ok_or_else(|| {
                    DdError::MalformedSerialization(format!(
                        "unknown child index {}", cidx,
                    ))
                })?,
            };
            edges[i] = VEdge { p, w: self.cn.lookup_value(w) };
        }
        Ok(self.make_vector_node(v, edges, false))
    }

    fn build_matrix_node(
        &mut self,
        v: Qubit,
        specs: &[EdgeSpec],
        nodes: &FxHashMap<i64, NodeIx>,
    ) -> DdResult<MEdge> {
        let mut edges = [MEdge::ZERO; NEDGE];
        for (i, spec) in specs.iter().enumerate() {
            let Some((cidx, w)) = *spec else { continue };
            let p = match cidx {
                -1 => NodeIx::TERMINAL,
                _ => *nodes.get(&cidx).ok_or_else(|| {
                    DdError::MalformedSerialization(format!(
                        "unknown child index {}", cidx,
                    ))
                })?,
            };
            edges[i] = MEdge { p, w: self.cn.lookup_value(w) };
        }
        Ok(self.make_matrix_node(v, edges, false))
    }

    fn apply_root_weight_vector(&mut self, mut result: VEdge, root: C64) -> VEdge {
        let w = self.cn.get_cached_value(root);
        self.cn.mul(w, result.w, w);
        result.w = self.cn.lookup_complex(w);
        self.cn.release_cached(w);
        if result.w == Complex::ZERO {
            return VEdge::ZERO;
        }
        result
    }

    fn apply_root_weight_matrix(&mut self, mut result: MEdge, root: C64) -> MEdge {
        let w = self.cn.get_cached_value(root);
        self.cn.mul(w, result.w, w);
        result.w = self.cn.lookup_complex(w);
        self.cn.release_cached(w);
        if result.w == Complex::ZERO {
            return MEdge::ZERO;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_1_SQRT_2 as ONRT2;
    use std::io::Cursor;
    use crate::edge::{ BasisState, Control, GateMatrix };

    fn c(re: f64, im: f64) -> C64 { C64::new(re, im) }

    fn x_mat() -> GateMatrix {
        [c(0.0, 0.0), c(1.0, 0.0), c(1.0, 0.0), c(0.0, 0.0)]
    }

    fn h_mat() -> GateMatrix {
        [c(ONRT2, 0.0), c(ONRT2, 0.0), c(ONRT2, 0.0), c(-ONRT2, 0.0)]
    }

    #[test]
    fn complex_parsing() {
        assert_eq!(parse_complex("1+0i").unwrap(), c(1.0, 0.0));
        assert_eq!(parse_complex("0.5-0.25i").unwrap(), c(0.5, -0.25));
        assert_eq!(parse_complex("-0.5i").unwrap(), c(0.0, -0.5));
        assert_eq!(parse_complex("2").unwrap(), c(2.0, 0.0));
        assert_eq!(parse_complex("1e-5+2e-7i").unwrap(), c(1e-5, 2e-7));
        assert_eq!(parse_complex("").unwrap(), c(0.0, 0.0));
        assert_eq!(parse_complex("0.5+i").unwrap(), c(0.5, 1.0));
        assert!(parse_complex("wat").is_err());
    }

    #[test]
    fn complex_format_roundtrip() {
        for v in [
            c(0.0, 0.0),
            c(1.0, 0.0),
            c(-ONRT2, ONRT2),
            c(0.25, -0.125),
            c(1e-12, -1e-12),
        ] {
            let s = format_complex(v);
            assert_eq!(parse_complex(&s).unwrap(), v);
        }
    }

    #[test]
    fn vector_roundtrip_text_and_binary() {
        let mut dd = Package::new(2).unwrap();
        let zero = dd.make_zero_state(2);
        let h1 = dd.make_gate_dd(&h_mat(), 2, &[], 1).unwrap();
        let cx = dd.make_gate_dd(&x_mat(), 2, &[Control::pos(1)], 0).unwrap();
        let s = dd.multiply_matrix_vector(h1, zero);
        let bell = dd.multiply_matrix_vector(cx, s);

        for binary in [false, true] {
            let mut buf: Vec<u8> = Vec::new();
            dd.serialize_vector(bell, &mut buf, binary).unwrap();
            let mut cursor = Cursor::new(buf);
            let back = dd.deserialize_vector(&mut cursor, binary).unwrap();
            assert_eq!(back, bell);
        }
    }

    #[test]
    fn matrix_roundtrip_text_and_binary() {
        let mut dd = Package::new(2).unwrap();
        let cx = dd.make_gate_dd(&x_mat(), 2, &[Control::pos(1)], 0).unwrap();
        for binary in [false, true] {
            let mut buf: Vec<u8> = Vec::new();
            dd.serialize_matrix(cx, &mut buf, binary).unwrap();
            let mut cursor = Cursor::new(buf);
            let back = dd.deserialize_matrix(&mut cursor, binary).unwrap();
            assert_eq!(back, cx);
        }
    }

    #[test]
    fn complex_weights_survive_roundtrip() {
        let mut dd = Package::new(2).unwrap();
        let s = dd
            .make_general_basis_state(2, &[BasisState::Right, BasisState::Minus])
            .unwrap();
        let mut buf: Vec<u8> = Vec::new();
        dd.serialize_vector(s, &mut buf, false).unwrap();
        let mut cursor = Cursor::new(buf);
        let back = dd.deserialize_vector(&mut cursor, false).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn terminal_and_zero_edges_roundtrip() {
        let mut dd = Package::new(1).unwrap();
        let one = VEdge::ONE;
        let mut buf: Vec<u8> = Vec::new();
        dd.serialize_vector(one, &mut buf, false).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(dd.deserialize_vector(&mut cursor, false).unwrap(), one);

        let mut buf: Vec<u8> = Vec::new();
        dd.serialize_vector(VEdge::ZERO, &mut buf, true).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(
            dd.deserialize_vector(&mut cursor, true).unwrap(),
            VEdge::ZERO,
        );
    }

    #[test]
    fn version_mismatch_is_an_error() {
        let mut dd = Package::new(1).unwrap();
        let mut cursor = Cursor::new(b"0.2\n1+0i\n".to_vec());
        assert!(matches!(
            dd.deserialize_vector(&mut cursor, false),
            Err(DdError::SerializationVersion { .. }),
        ));
        let mut bad = Vec::new();
        bad.extend_from_slice(&0.25f64.to_le_bytes());
        let mut cursor = Cursor::new(bad);
        assert!(matches!(
            dd.deserialize_matrix(&mut cursor, true),
            Err(DdError::SerializationVersion { .. }),
        ));
    }

    #[test]
    fn malformed_text_is_an_error() {
        let mut dd = Package::new(1).unwrap();
        let mut cursor = Cursor::new(b"0.1\n1+0i\nnot a node line\n".to_vec());
        assert!(matches!(
            dd.deserialize_vector(&mut cursor, false),
            Err(DdError::MalformedSerialization(_)),
        ));
    }
}
