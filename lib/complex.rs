//! Hash-consed storage and arithmetic for the complex weights carried on
//! decision-diagram edges.
//!
//! Every weight in a stored node is a [`Complex`]: a pair of [`CxRef`]s into a
//! deduplicating table of nonnegative floats. The sign of each component is
//! carried in a tag bit of the reference itself, so a number and its negation
//! share a single table entry. During recursive operations, intermediate
//! weights instead live in a small fixed "cache lane" of mutable scratch
//! slots; only a top-level operation interns its final weight into the table.
//!
//! [`ComplexTable`] is the float pool proper (buckets, arena, free list,
//! refcounted garbage collection); [`ComplexNumbers`] wraps it together with
//! the cache lane and provides all weight arithmetic.

use num_complex::Complex64 as C64;
use tracing::{ debug, warn };

/// Reference-count storage for table entries and nodes.
pub type RefCount = u32;

const NBUCKET: usize = 32768;
const BUCKET_MASK: usize = NBUCKET - 1;
const INITIAL_ALLOCATION_SIZE: usize = 2048;
const GROWTH_FACTOR: usize = 2;
const INITIAL_GC_LIMIT: usize = 100_000;

/// Number of scalar slots in the cache lane; each transient complex weight
/// occupies two.
pub const CACHE_SIZE: usize = 1800;

const NIL: u32 = u32::MAX;

/// A tagged reference to a single real scalar.
///
/// Bit 0 carries the sign of the referred value, bit 1 selects between the
/// interned table and the cache lane, and the remaining bits are the slot
/// index. Dereferencing goes through [`ComplexNumbers::val`], which masks the
/// tags; two references are the same scalar iff they are bit-identical.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CxRef(u32);

const SIGN_BIT: u32 = 0b01;
const CACHE_BIT: u32 = 0b10;
const IDX_SHIFT: u32 = 2;

impl CxRef {
    /// The immortal table entry for 0.0. Never sign-tagged.
    pub const ZERO: Self = CxRef(0);

    /// The immortal table entry for 1.0.
    pub const ONE: Self = CxRef(1 << IDX_SHIFT);

    pub(crate) fn table(idx: usize) -> Self { CxRef((idx as u32) << IDX_SHIFT) }

    pub(crate) fn cached(idx: usize) -> Self {
        CxRef(((idx as u32) << IDX_SHIFT) | CACHE_BIT)
    }

    /// Return `true` if the sign tag is set.
    pub fn is_negative(self) -> bool { self.0 & SIGN_BIT != 0 }

    /// Return `true` if this reference points into the cache lane rather than
    /// the interned table.
    pub fn is_cached(self) -> bool { self.0 & CACHE_BIT != 0 }

    /// Strip the sign tag, keeping the storage designation.
    pub fn aligned(self) -> Self { CxRef(self.0 & !SIGN_BIT) }

    /// Set the sign tag.
    pub fn negative(self) -> Self { CxRef(self.0 | SIGN_BIT) }

    /// Flip the sign tag.
    pub fn flipped(self) -> Self { CxRef(self.0 ^ SIGN_BIT) }

    pub(crate) fn idx(self) -> usize { (self.0 >> IDX_SHIFT) as usize }

    pub(crate) fn bits(self) -> u32 { self.0 }
}

/// An edge weight: an ordered pair of scalar references.
///
/// Equality is reference equality on both components, which thanks to
/// deduplication coincides with approximate value equality for interned
/// weights.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Complex {
    pub re: CxRef,
    pub im: CxRef,
}

impl Complex {
    /// The scalar 0.
    pub const ZERO: Self = Complex { re: CxRef::ZERO, im: CxRef::ZERO };

    /// The scalar 1.
    pub const ONE: Self = Complex { re: CxRef::ONE, im: CxRef::ZERO };
}

struct CtEntry {
    value: f64,
    next: u32,
    ref_count: RefCount,
}

/// Deduplicating table of nonnegative floats (the "float pool").
///
/// Entries live in an append-only arena addressed by index; a bucketed hash
/// over the value provides tolerance-aware lookup, and a free list recycles
/// entries released by garbage collection. Slots 0 and 1 hold the immortal
/// constants 0.0 and 1.0.
pub struct ComplexTable {
    buckets: Vec<u32>,
    entries: Vec<CtEntry>,
    avail: u32,
    tolerance: f64,
    allocation_size: usize,
    allocations: usize,
    count: usize,
    peak_count: usize,
    lookups: usize,
    hits: usize,
    collisions: usize,
    gc_calls: usize,
    gc_runs: usize,
    gc_limit: usize,
}

impl ComplexTable {
    pub fn new() -> Self {
        let mut table = Self {
            buckets: vec![NIL; NBUCKET],
            entries: Vec::with_capacity(INITIAL_ALLOCATION_SIZE),
            avail: NIL,
            tolerance: 1e-13,
            allocation_size: INITIAL_ALLOCATION_SIZE * GROWTH_FACTOR,
            allocations: INITIAL_ALLOCATION_SIZE,
            count: 0,
            peak_count: 0,
            lookups: 0,
            hits: 0,
            collisions: 0,
            gc_calls: 0,
            gc_runs: 0,
            gc_limit: INITIAL_GC_LIMIT,
        };
        // immortal constants; never linked into a bucket, never collected
        table.entries.push(CtEntry {
            value: 0.0, next: NIL, ref_count: RefCount::MAX,
        });
        table.entries.push(CtEntry {
            value: 1.0, next: NIL, ref_count: RefCount::MAX,
        });
        // pin 1/2 and 1/sqrt(2) so they survive every collection
        let half = table.lookup(0.5);
        table.entries[half].ref_count += 1;
        let onrt2 = table.lookup(std::f64::consts::FRAC_1_SQRT_2);
        table.entries[onrt2].ref_count += 1;
        table
    }

    /// Numerical tolerance used for all value comparisons.
    pub fn tolerance(&self) -> f64 { self.tolerance }

    /// Set the numerical tolerance.
    pub fn set_tolerance(&mut self, tol: f64) { self.tolerance = tol; }

    /// Number of interned entries beyond the two immortal constants.
    pub fn count(&self) -> usize { self.count }

    /// Peak value of [`count`][Self::count] over the table's lifetime.
    pub fn peak_count(&self) -> usize { self.peak_count }

    /// Total number of arena slots ever allocated.
    pub fn allocations(&self) -> usize { self.allocations }

    /// Fraction of lookups answered by an existing entry.
    pub fn hit_ratio(&self) -> f64 { self.hits as f64 / self.lookups as f64 }

    fn hash(&self, val: f64) -> usize {
        debug_assert!(val >= 0.0);
        let key = (val * BUCKET_MASK as f64) as usize;
        key.min(BUCKET_MASK)
    }

    fn find(&mut self, key: usize, val: f64) -> Option<usize> {
        let mut p = self.buckets[key];
        while p != NIL {
            if (self.entries[p as usize].value - val).abs() < self.tolerance {
                self.hits += 1;
                return Some(p as usize);
            }
            self.collisions += 1;
            p = self.entries[p as usize].next;
        }
        None
    }

    /// Look up a nonnegative value, interning it if it is not yet present.
    ///
    /// Values within tolerance of 0 or 1 resolve to the immortal constants.
    /// Besides the intended bucket, the buckets of `val - tol` and
    /// `val + tol` are searched to tolerate boundary rounding.
    ///
    /// *Panics if `val` is NaN.*
    pub fn lookup(&mut self, val: f64) -> usize {
        assert!(!val.is_nan(), "NaN reached the float pool");

        if val.abs() < self.tolerance {
            return 0;
        }
        if (val - 1.0).abs() < self.tolerance {
            return 1;
        }

        self.lookups += 1;

        let key = self.hash(val);
        if let Some(p) = self.find(key, val) {
            return p;
        }
        if val - self.tolerance >= 0.0 {
            let lower = self.hash(val - self.tolerance);
            if lower != key {
                if let Some(p) = self.find(lower, val) {
                    return p;
                }
            }
        }
        let upper = self.hash(val + self.tolerance);
        if upper != key {
            if let Some(p) = self.find(upper, val) {
                return p;
            }
        }

        let entry = self.get_entry();
        self.entries[entry].value = val;
        self.entries[entry].next = self.buckets[key];
        self.buckets[key] = entry as u32;
        self.count += 1;
        self.peak_count = self.peak_count.max(self.count);
        entry
    }

    fn get_entry(&mut self) -> usize {
        if self.avail != NIL {
            let entry = self.avail as usize;
            self.avail = self.entries[entry].next;
            self.entries[entry].ref_count = 0;
            return entry;
        }
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve(self.allocation_size);
            self.allocations += self.allocation_size;
            self.allocation_size *= GROWTH_FACTOR;
        }
        self.entries.push(CtEntry { value: 0.0, next: NIL, ref_count: 0 });
        self.entries.len() - 1
    }

    fn return_entry(&mut self, entry: usize) {
        self.entries[entry].next = self.avail;
        self.avail = entry as u32;
    }

    pub(crate) fn value_at(&self, idx: usize) -> f64 { self.entries[idx].value }

    pub(crate) fn ref_at(&self, idx: usize) -> RefCount {
        self.entries[idx].ref_count
    }

    /// Increment the reference count of the entry behind `r`.
    ///
    /// Saturated counts pin the entry forever; a single warning is logged.
    pub fn inc_ref(&mut self, r: CxRef) {
        debug_assert!(!r.is_cached());
        let idx = r.aligned().idx();
        if idx <= 1 {
            return;
        }
        let entry = &mut self.entries[idx];
        if entry.ref_count == RefCount::MAX {
            warn!(
                value = entry.value,
                "max refcount reached; entry will never be collected"
            );
            return;
        }
        entry.ref_count += 1;
    }

    /// Decrement the reference count of the entry behind `r`.
    ///
    /// *Panics if the count is already zero.*
    pub fn dec_ref(&mut self, r: CxRef) {
        debug_assert!(!r.is_cached());
        let idx = r.aligned().idx();
        if idx <= 1 {
            return;
        }
        let entry = &mut self.entries[idx];
        if entry.ref_count == RefCount::MAX {
            return;
        }
        assert!(entry.ref_count > 0, "float pool refcount underflow");
        entry.ref_count -= 1;
    }

    /// Sweep the table, returning unreferenced entries to the free list.
    ///
    /// A no-op while the population is below the collection limit, unless
    /// `force` is set. The limit is raised toward the surviving population
    /// when most entries survive and lowered when the survivors drop far
    /// below it.
    pub fn garbage_collect(&mut self, force: bool) -> usize {
        self.gc_calls += 1;
        if (!force && self.count < self.gc_limit) || self.count == 0 {
            return 0;
        }
        self.gc_runs += 1;

        let mut collected = 0;
        let mut remaining = 0;
        for key in 0..NBUCKET {
            let mut last: u32 = NIL;
            let mut p = self.buckets[key];
            while p != NIL {
                let next = self.entries[p as usize].next;
                if self.entries[p as usize].ref_count == 0 {
                    if last == NIL {
                        self.buckets[key] = next;
                    } else {
                        self.entries[last as usize].next = next;
                    }
                    self.return_entry(p as usize);
                    collected += 1;
                } else {
                    last = p;
                    remaining += 1;
                }
                p = next;
            }
        }
        if remaining > self.gc_limit * 9 / 10 {
            self.gc_limit = remaining + INITIAL_GC_LIMIT;
        } else if remaining < self.gc_limit / 16 {
            self.gc_limit /= 8;
        }
        self.count = remaining;
        debug!(collected, remaining, limit = self.gc_limit, "float pool gc");
        collected
    }

    /// Drop every interned entry except the immortal and pinned constants.
    pub fn clear(&mut self) {
        for bucket in self.buckets.iter_mut() {
            *bucket = NIL;
        }
        self.avail = NIL;
        self.entries.truncate(2);
        let half = self.lookup(0.5);
        self.entries[half].ref_count += 1;
        let onrt2 = self.lookup(std::f64::consts::FRAC_1_SQRT_2);
        self.entries[onrt2].ref_count += 1;
        self.count = 2;
        self.peak_count = 2;
        self.lookups = 0;
        self.hits = 0;
        self.collisions = 0;
        self.gc_calls = 0;
        self.gc_runs = 0;
        self.gc_limit = INITIAL_GC_LIMIT;
    }
}

impl Default for ComplexTable {
    fn default() -> Self { Self::new() }
}

/// The float pool together with the cache lane and all weight arithmetic.
///
/// Arithmetic destinations must be cache-lane weights; sources may be interned
/// or cached. Every recursive operator must release exactly as many cached
/// weights as it acquires, which top-level operations assert via
/// [`cache_count`][Self::cache_count].
pub struct ComplexNumbers {
    pub(crate) table: ComplexTable,
    cache: Vec<f64>,
    cache_avail: Vec<u32>,
}

impl ComplexNumbers {
    pub fn new() -> Self {
        Self {
            table: ComplexTable::new(),
            cache: vec![0.0; CACHE_SIZE],
            cache_avail: (0..CACHE_SIZE as u32).rev().collect(),
        }
    }

    /// Number of free scalar slots left in the cache lane.
    pub fn cache_count(&self) -> usize { self.cache_avail.len() }

    /// Numerical tolerance used for all comparisons.
    pub fn tolerance(&self) -> f64 { self.table.tolerance() }

    /// Set the numerical tolerance.
    pub fn set_tolerance(&mut self, tol: f64) { self.table.set_tolerance(tol); }

    /// The signed value behind a scalar reference.
    pub fn val(&self, r: CxRef) -> f64 {
        let raw = if r.is_cached() {
            self.cache[r.idx()]
        } else {
            self.table.value_at(r.idx())
        };
        if r.is_negative() { -raw } else { raw }
    }

    /// The value form of a weight.
    pub fn value_of(&self, c: Complex) -> C64 {
        C64::new(self.val(c.re), self.val(c.im))
    }

    fn write(&mut self, r: CxRef, v: f64) {
        debug_assert!(r.is_cached());
        let idx = r.aligned().idx();
        self.cache[idx] = if r.is_negative() { -v } else { v };
    }

    /// Overwrite the components of a cached weight in place.
    pub fn set_cached(&mut self, c: Complex, re: f64, im: f64) {
        self.write(c.re, re);
        self.write(c.im, im);
    }

    fn lookup_component(&mut self, v: f64) -> CxRef {
        let idx = self.table.lookup(v.abs());
        if idx == 0 {
            return CxRef::ZERO;
        }
        let r = CxRef::table(idx);
        if v < 0.0 { r.negative() } else { r }
    }

    /// Intern a complex value, splitting each component into magnitude and
    /// sign tag. Zero components are always untagged.
    pub fn lookup(&mut self, re: f64, im: f64) -> Complex {
        Complex {
            re: self.lookup_component(re),
            im: self.lookup_component(im),
        }
    }

    /// Intern the value currently behind `c` (typically a cached weight).
    pub fn lookup_complex(&mut self, c: Complex) -> Complex {
        let re = self.val(c.re);
        let im = self.val(c.im);
        self.lookup(re, im)
    }

    /// Intern a value-form complex number.
    pub fn lookup_value(&mut self, v: C64) -> Complex { self.lookup(v.re, v.im) }

    /// Increment the reference counts of both components.
    pub fn inc_ref(&mut self, c: Complex) {
        self.table.inc_ref(c.re);
        self.table.inc_ref(c.im);
    }

    /// Decrement the reference counts of both components.
    pub fn dec_ref(&mut self, c: Complex) {
        self.table.dec_ref(c.re);
        self.table.dec_ref(c.im);
    }

    /// Collect unreferenced float-pool entries. See
    /// [`ComplexTable::garbage_collect`].
    pub fn garbage_collect(&mut self, force: bool) -> usize {
        self.table.garbage_collect(force)
    }

    /// Drop all interned entries and reset the cache lane.
    pub fn clear(&mut self) {
        self.table.clear();
        self.cache_avail = (0..CACHE_SIZE as u32).rev().collect();
    }

    ///
    /// cache lane
    ///

    /// Acquire a cached weight. Must be balanced by
    /// [`release_cached`][Self::release_cached].
    ///
    /// *Panics if the lane is exhausted, which indicates an unbalanced
    /// acquire/release pair somewhere up the call stack.*
    pub fn get_cached(&mut self) -> Complex {
        let re = self.cache_avail.pop().expect("cache lane exhausted");
        let im = self.cache_avail.pop().expect("cache lane exhausted");
        Complex {
            re: CxRef::cached(re as usize),
            im: CxRef::cached(im as usize),
        }
    }

    /// Acquire a cached weight holding the given components.
    pub fn get_cached_from(&mut self, re: f64, im: f64) -> Complex {
        let c = self.get_cached();
        self.write(c.re, re);
        self.write(c.im, im);
        c
    }

    /// Acquire a cached copy of (the current value of) an existing weight.
    pub fn get_cached_copy(&mut self, c: Complex) -> Complex {
        let re = self.val(c.re);
        let im = self.val(c.im);
        self.get_cached_from(re, im)
    }

    /// Acquire a cached weight holding a value-form complex number.
    pub fn get_cached_value(&mut self, v: C64) -> Complex {
        self.get_cached_from(v.re, v.im)
    }

    /// Borrow the top of the cache lane without acquiring it.
    ///
    /// The returned weight is valid only until the next acquisition.
    pub fn get_temp_cached(&mut self) -> Complex {
        let n = self.cache_avail.len();
        debug_assert!(n >= 2, "cache lane exhausted");
        Complex {
            re: CxRef::cached(self.cache_avail[n - 1] as usize),
            im: CxRef::cached(self.cache_avail[n - 2] as usize),
        }
    }

    /// Borrow the top of the cache lane, preloaded with the given components.
    pub fn get_temp_cached_from(&mut self, re: f64, im: f64) -> Complex {
        let c = self.get_temp_cached();
        self.write(c.re, re);
        self.write(c.im, im);
        c
    }

    /// Return a cached weight to the lane.
    pub fn release_cached(&mut self, c: Complex) {
        debug_assert!(c.re.is_cached() && c.im.is_cached());
        self.cache_avail.push(c.im.aligned().idx() as u32);
        self.cache_avail.push(c.re.aligned().idx() as u32);
        debug_assert!(self.cache_avail.len() <= CACHE_SIZE);
    }

    ///
    /// comparisons
    ///

    /// Approximate equality of two weights.
    pub fn approx_eq(&self, a: Complex, b: Complex) -> bool {
        let tol = self.tolerance();
        (self.val(a.re) - self.val(b.re)).abs() < tol
            && (self.val(a.im) - self.val(b.im)).abs() < tol
    }

    /// Return `true` if the weight is (approximately) zero.
    pub fn equals_zero(&self, c: Complex) -> bool {
        c == Complex::ZERO
            || (self.val(c.re).abs() < self.tolerance()
                && self.val(c.im).abs() < self.tolerance())
    }

    /// Return `true` if the weight is (approximately) one.
    pub fn equals_one(&self, c: Complex) -> bool {
        c == Complex::ONE
            || ((self.val(c.re) - 1.0).abs() < self.tolerance()
                && self.val(c.im).abs() < self.tolerance())
    }

    /// Return `true` if the value-form number is (approximately) zero.
    pub fn equals_zero_value(&self, v: C64) -> bool {
        v.re.abs() < self.tolerance() && v.im.abs() < self.tolerance()
    }

    ///
    /// arithmetic
    ///

    /// `r <- a + b`; `r` must be cached.
    pub fn add(&mut self, r: Complex, a: Complex, b: Complex) {
        let re = self.val(a.re) + self.val(b.re);
        let im = self.val(a.im) + self.val(b.im);
        self.write(r.re, re);
        self.write(r.im, im);
    }

    /// `r <- a - b`; `r` must be cached.
    pub fn sub(&mut self, r: Complex, a: Complex, b: Complex) {
        let re = self.val(a.re) - self.val(b.re);
        let im = self.val(a.im) - self.val(b.im);
        self.write(r.re, re);
        self.write(r.im, im);
    }

    /// `r <- a * b`; `r` must be cached.
    pub fn mul(&mut self, r: Complex, a: Complex, b: Complex) {
        if self.equals_one(a) {
            let (re, im) = (self.val(b.re), self.val(b.im));
            self.write(r.re, re);
            self.write(r.im, im);
        } else if self.equals_one(b) {
            let (re, im) = (self.val(a.re), self.val(a.im));
            self.write(r.re, re);
            self.write(r.im, im);
        } else if self.equals_zero(a) || self.equals_zero(b) {
            self.write(r.re, 0.0);
            self.write(r.im, 0.0);
        } else {
            let (ar, ai) = (self.val(a.re), self.val(a.im));
            let (br, bi) = (self.val(b.re), self.val(b.im));
            self.write(r.re, ar * br - ai * bi);
            self.write(r.im, ar * bi + ai * br);
        }
    }

    /// `r <- a / b`; `r` must be cached.
    pub fn div(&mut self, r: Complex, a: Complex, b: Complex) {
        if a == b {
            self.write(r.re, 1.0);
            self.write(r.im, 0.0);
        } else if self.equals_zero(a) {
            self.write(r.re, 0.0);
            self.write(r.im, 0.0);
        } else if self.equals_one(b) {
            let (re, im) = (self.val(a.re), self.val(a.im));
            self.write(r.re, re);
            self.write(r.im, im);
        } else {
            let (ar, ai) = (self.val(a.re), self.val(a.im));
            let (br, bi) = (self.val(b.re), self.val(b.im));
            let norm = br * br + bi * bi;
            self.write(r.re, (ar * br + ai * bi) / norm);
            self.write(r.im, (ai * br - ar * bi) / norm);
        }
    }

    /// Acquire a cached weight holding `a + b`.
    pub fn add_cached(&mut self, a: Complex, b: Complex) -> Complex {
        let c = self.get_cached();
        self.add(c, a, b);
        c
    }

    /// Acquire a cached weight holding `a - b`.
    pub fn sub_cached(&mut self, a: Complex, b: Complex) -> Complex {
        let c = self.get_cached();
        self.sub(c, a, b);
        c
    }

    /// Acquire a cached weight holding `a * b`.
    pub fn mul_cached(&mut self, a: Complex, b: Complex) -> Complex {
        let c = self.get_cached();
        self.mul(c, a, b);
        c
    }

    /// Acquire a cached weight holding `a / b`.
    pub fn div_cached(&mut self, a: Complex, b: Complex) -> Complex {
        let c = self.get_cached();
        self.div(c, a, b);
        c
    }

    /// Complex conjugate; flips the sign tag of the imaginary component.
    pub fn conj(a: Complex) -> Complex {
        Complex {
            re: a.re,
            im: if a.im == CxRef::ZERO { a.im } else { a.im.flipped() },
        }
    }

    /// Negation; flips the sign tags of both components.
    pub fn neg(a: Complex) -> Complex {
        Complex {
            re: if a.re == CxRef::ZERO { a.re } else { a.re.flipped() },
            im: if a.im == CxRef::ZERO { a.im } else { a.im.flipped() },
        }
    }

    /// Squared magnitude of a weight.
    pub fn mag2(&self, a: Complex) -> f64 {
        let ar = self.val(a.re);
        let ai = self.val(a.im);
        ar * ar + ai * ai
    }

    /// Magnitude of a weight.
    pub fn mag(&self, a: Complex) -> f64 { self.mag2(a).sqrt() }

    /// Argument (phase angle) of a weight.
    pub fn arg(&self, a: Complex) -> f64 {
        self.val(a.im).atan2(self.val(a.re))
    }
}

impl Default for ComplexNumbers {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_1_SQRT_2 as ONRT2;

    #[test]
    fn statics() {
        let mut cn = ComplexNumbers::new();
        assert_eq!(cn.val(CxRef::ZERO), 0.0);
        assert_eq!(cn.val(CxRef::ONE), 1.0);
        assert_eq!(cn.lookup(0.0, 0.0), Complex::ZERO);
        assert_eq!(cn.lookup(1.0, 0.0), Complex::ONE);
        // within tolerance of the constants
        assert_eq!(cn.lookup(1e-14, -1e-14), Complex::ZERO);
        assert_eq!(cn.lookup(1.0 + 1e-14, 0.0), Complex::ONE);
    }

    #[test]
    fn dedup_and_sign_tags() {
        let mut cn = ComplexNumbers::new();
        let a = cn.lookup(ONRT2, 0.0);
        let b = cn.lookup(-ONRT2, 0.0);
        assert_eq!(a.re.aligned(), b.re.aligned());
        assert!(b.re.is_negative());
        assert!(!a.re.is_negative());
        assert_eq!(cn.val(b.re), -ONRT2);
        // negative zero is still the untagged zero
        let z = cn.lookup(-0.0, -1e-20);
        assert_eq!(z, Complex::ZERO);
    }

    #[test]
    fn tolerance_merging() {
        let mut cn = ComplexNumbers::new();
        let a = cn.lookup(0.25, 0.0);
        let b = cn.lookup(0.25 + 1e-14, 0.0);
        assert_eq!(a, b);
        let c = cn.lookup(0.25 + 1.0e-3, 0.0);
        assert_ne!(a, c);
    }

    #[test]
    fn conj_and_neg() {
        let mut cn = ComplexNumbers::new();
        let a = cn.lookup(0.5, 0.25);
        let ac = ComplexNumbers::conj(a);
        assert_eq!(cn.val(ac.re), 0.5);
        assert_eq!(cn.val(ac.im), -0.25);
        let an = ComplexNumbers::neg(a);
        assert_eq!(cn.val(an.re), -0.5);
        assert_eq!(cn.val(an.im), -0.25);
        // zero components stay untagged
        assert_eq!(ComplexNumbers::conj(Complex::ONE), Complex::ONE);
        assert_eq!(ComplexNumbers::neg(Complex::ZERO), Complex::ZERO);
    }

    #[test]
    fn cached_arithmetic_balances() {
        let mut cn = ComplexNumbers::new();
        let before = cn.cache_count();
        let a = cn.lookup(0.5, 0.5);
        let b = cn.lookup(0.25, -0.75);
        let s = cn.add_cached(a, b);
        assert_eq!(cn.val(s.re), 0.75);
        assert_eq!(cn.val(s.im), -0.25);
        let p = cn.mul_cached(a, b);
        assert!((cn.val(p.re) - (0.5 * 0.25 + 0.5 * 0.75)).abs() < 1e-15);
        assert!((cn.val(p.im) - (-0.5 * 0.75 + 0.5 * 0.25)).abs() < 1e-15);
        let q = cn.div_cached(p, b);
        assert!((cn.val(q.re) - 0.5).abs() < 1e-12);
        assert!((cn.val(q.im) - 0.5).abs() < 1e-12);
        cn.release_cached(q);
        cn.release_cached(p);
        cn.release_cached(s);
        assert_eq!(cn.cache_count(), before);
    }

    #[test]
    fn div_by_self_is_one() {
        let mut cn = ComplexNumbers::new();
        let a = cn.lookup(0.3, 0.4);
        let r = cn.div_cached(a, a);
        assert_eq!(cn.val(r.re), 1.0);
        assert_eq!(cn.val(r.im), 0.0);
        cn.release_cached(r);
    }

    #[test]
    fn refcount_gc() {
        let mut cn = ComplexNumbers::new();
        let kept = cn.lookup(0.123, 0.0);
        cn.inc_ref(kept);
        let dropped = cn.lookup(0.456, 0.0);
        let count_before = cn.table.count();
        let collected = cn.garbage_collect(true);
        assert!(collected >= 1);
        assert!(cn.table.count() < count_before);
        // the kept entry survived with its value intact
        assert_eq!(cn.val(kept.re), 0.123);
        // the dropped entry's slot is recycled on the next lookup
        let again = cn.lookup(0.456, 0.0);
        assert_eq!(again.re.aligned().idx(), dropped.re.aligned().idx());
    }

    #[test]
    fn pinned_constants_survive_forced_gc() {
        let mut cn = ComplexNumbers::new();
        cn.garbage_collect(true);
        let half = cn.lookup(0.5, 0.0);
        let onrt2 = cn.lookup(ONRT2, 0.0);
        assert_eq!(cn.val(half.re), 0.5);
        assert_eq!(cn.val(onrt2.re), ONRT2);
    }

    #[test]
    fn temp_cached_is_transient() {
        let mut cn = ComplexNumbers::new();
        let before = cn.cache_count();
        let t = cn.get_temp_cached_from(0.5, -0.5);
        assert_eq!(cn.val(t.re), 0.5);
        assert_eq!(cn.val(t.im), -0.5);
        assert_eq!(cn.cache_count(), before);
    }

    #[test]
    #[should_panic]
    fn nan_is_rejected() {
        let mut cn = ComplexNumbers::new();
        cn.lookup(f64::NAN, 0.0);
    }
}
