//! The instruction algebra (component B): an immutable sum type over
//! {Pattern, Concatenated, Repeated, Ramp} representing a time-sampled
//! per-channel waveform with structural sharing.
//!
//! Instructions are value objects built exclusively through smart
//! constructors ([`pattern`], [`concat`], [`repeat`], [`ramp`]) that
//! restore the invariants below; there is no public mutator. Children are
//! shared via [`Rc`] so cloning a sub-tree is a refcount bump, not a copy.
//!
//! Invariant violations (empty concat, dtype mismatch inside a single
//! `Concatenated`, out-of-range slice) are programmer bugs and panic;
//! [`AlgebraError`] is only for recoverable, caller-triggered failures
//! (`slice`/`repeat`/`concat`/`merge` of mismatched shapes coming from user
//! input further up the stack).

use std::rc::Rc;

use num::integer::lcm;

/// The element type of an instruction: either a scalar, or a named-field
/// struct of scalars (a "channel stack").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dtype {
    Bool,
    F64,
    Struct(Vec<(String, Dtype)>),
}

impl Dtype {
    fn field(&self, name: &str) -> Option<&Dtype> {
        match self {
            Dtype::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, d)| d),
            _ => None,
        }
    }
}

/// Dense sample storage matching a [`Dtype`] shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Bool(Rc<Vec<bool>>),
    F64(Rc<Vec<f64>>),
    Struct(Vec<(String, Buffer)>),
}

impl Buffer {
    pub fn len(&self) -> usize {
        match self {
            Buffer::Bool(v) => v.len(),
            Buffer::F64(v) => v.len(),
            Buffer::Struct(fields) => fields.first().map(|(_, b)| b.len()).unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Buffer::Bool(_) => Dtype::Bool,
            Buffer::F64(_) => Dtype::F64,
            Buffer::Struct(fields) => {
                Dtype::Struct(fields.iter().map(|(n, b)| (n.clone(), b.dtype())).collect())
            }
        }
    }

    fn slice(&self, a: usize, b: usize) -> Buffer {
        match self {
            Buffer::Bool(v) => Buffer::Bool(Rc::new(v[a..b].to_vec())),
            Buffer::F64(v) => Buffer::F64(Rc::new(v[a..b].to_vec())),
            Buffer::Struct(fields) => {
                Buffer::Struct(fields.iter().map(|(n, buf)| (n.clone(), buf.slice(a, b))).collect())
            }
        }
    }

    /// Concatenates same-dtype buffers with a single allocation per leaf.
    fn concat(parts: &[&Buffer]) -> Buffer {
        assert!(!parts.is_empty());
        match parts[0] {
            Buffer::Bool(_) => {
                let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
                for p in parts {
                    match p {
                        Buffer::Bool(v) => out.extend_from_slice(v),
                        _ => panic!("concat: dtype mismatch inside Buffer::concat"),
                    }
                }
                Buffer::Bool(Rc::new(out))
            }
            Buffer::F64(_) => {
                let mut out = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
                for p in parts {
                    match p {
                        Buffer::F64(v) => out.extend_from_slice(v),
                        _ => panic!("concat: dtype mismatch inside Buffer::concat"),
                    }
                }
                Buffer::F64(Rc::new(out))
            }
            Buffer::Struct(first_fields) => {
                let names: Vec<String> = first_fields.iter().map(|(n, _)| n.clone()).collect();
                let mut out_fields = Vec::with_capacity(names.len());
                for name in names {
                    let sub: Vec<&Buffer> = parts
                        .iter()
                        .map(|p| match p {
                            Buffer::Struct(fields) => {
                                fields.iter().find(|(n, _)| *n == name).map(|(_, b)| b).unwrap()
                            }
                            _ => panic!("concat: dtype mismatch inside Buffer::concat"),
                        })
                        .collect();
                    out_fields.push((name, Buffer::concat(&sub)));
                }
                Buffer::Struct(out_fields)
            }
        }
    }

    fn get_field(&self, name: &str) -> Option<Buffer> {
        match self {
            Buffer::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, b)| b.clone()),
            _ => None,
        }
    }

    /// Element-wise application of an `f64 -> f64` function; only valid on
    /// analog (F64 / struct-of-F64) buffers.
    fn map_f64(&self, f: &dyn Fn(f64) -> f64) -> Buffer {
        match self {
            Buffer::F64(v) => Buffer::F64(Rc::new(v.iter().map(|x| f(*x)).collect())),
            Buffer::Struct(fields) => {
                Buffer::Struct(fields.iter().map(|(n, b)| (n.clone(), b.map_f64(f))).collect())
            }
            Buffer::Bool(_) => panic!("map_f64 called on a boolean buffer"),
        }
    }

    fn named(name: &str, value: Buffer) -> Buffer {
        Buffer::Struct(vec![(name.to_string(), value)])
    }

    /// Merges two same-length buffers into a struct dtype, flattening
    /// operands that are already structs rather than nesting them.
    fn merge_named(a: &Buffer, name_a: &str, b: &Buffer, name_b: &str) -> Buffer {
        let mut fields = Vec::new();
        match a {
            Buffer::Struct(f) => fields.extend(f.iter().cloned()),
            other => fields.push((name_a.to_string(), other.clone())),
        }
        match b {
            Buffer::Struct(f) => fields.extend(f.iter().cloned()),
            other => fields.push((name_b.to_string(), other.clone())),
        }
        Buffer::Struct(fields)
    }
}

/// Error returned by operations that can legitimately fail on caller-
/// supplied shapes (as opposed to internal invariant violations, which
/// panic).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlgebraError {
    #[error("slice [{a}:{b}) out of range for instruction of length {length}")]
    SliceOutOfRange { a: u64, b: u64, length: u64 },
    #[error("cannot concatenate zero instructions")]
    EmptyJoin,
    #[error("dtype mismatch: {left:?} vs {right:?}")]
    DtypeMismatch { left: Dtype, right: Dtype },
    #[error("repeat count must be non-negative, got {0}")]
    BadRepeat(i64),
    #[error("length mismatch: {a} vs {b}")]
    LengthMismatch { a: u64, b: u64 },
    #[error("field `{0}` not found on this instruction's dtype")]
    NoSuchField(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    buffer: Buffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Concatenated {
    children: Vec<Rc<Instruction>>,
    length: u64,
    dtype: Dtype,
    depth: u32,
}

impl Concatenated {
    pub fn children(&self) -> &[Rc<Instruction>] {
        &self.children
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Repeated {
    n: u64,
    child: Rc<Instruction>,
    length: u64,
    depth: u32,
}

impl Repeated {
    pub fn child(&self) -> &Instruction {
        &self.child
    }

    pub fn n(&self) -> u64 {
        self.n
    }
}

/// Linear interpolation from `start` to `stop` over `length` samples:
/// sample `i = start + i*(stop-start)/length`. `start`/`stop` are
/// single-sample buffers (possibly struct-of-f64) carrying the dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct Ramp {
    start: Buffer,
    stop: Buffer,
    length: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Pattern(Pattern),
    Concatenated(Concatenated),
    Repeated(Repeated),
    Ramp(Ramp),
}

impl Instruction {
    pub fn len(&self) -> u64 {
        match self {
            Instruction::Pattern(p) => p.buffer.len() as u64,
            Instruction::Concatenated(c) => c.length,
            Instruction::Repeated(r) => r.length,
            Instruction::Ramp(r) => r.length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            Instruction::Pattern(p) => p.buffer.dtype(),
            Instruction::Concatenated(c) => c.dtype.clone(),
            Instruction::Repeated(r) => r.child.dtype(),
            Instruction::Ramp(r) => r.start.dtype(),
        }
    }

    pub fn depth(&self) -> u32 {
        match self {
            Instruction::Pattern(_) => 0,
            Instruction::Concatenated(c) => c.depth,
            Instruction::Repeated(r) => r.depth,
            Instruction::Ramp(_) => 1,
        }
    }

    /// Exposes a `Ramp` node's endpoints for callers outside this module
    /// (the §6.2 wire format needs the endpoints, not the materialised
    /// samples). `None` for every other variant.
    pub fn as_ramp_endpoints(&self) -> Option<(&Buffer, &Buffer, u64)> {
        match self {
            Instruction::Ramp(r) => Some((&r.start, &r.stop, r.length)),
            _ => None,
        }
    }

    /// Flattens the instruction to a single dense buffer.
    pub fn to_pattern(&self) -> Buffer {
        match self {
            Instruction::Pattern(p) => p.buffer.clone(),
            Instruction::Concatenated(c) => {
                let parts: Vec<Buffer> = c.children.iter().map(|ch| ch.to_pattern()).collect();
                let refs: Vec<&Buffer> = parts.iter().collect();
                Buffer::concat(&refs)
            }
            Instruction::Repeated(r) => {
                let child_buf = r.child.to_pattern();
                let refs: Vec<&Buffer> = std::iter::repeat(&child_buf).take(r.n as usize).collect();
                Buffer::concat(&refs)
            }
            Instruction::Ramp(r) => ramp_to_pattern(r),
        }
    }

    /// Structural slice `[a, b)`, pushed through the tree without
    /// flattening.
    pub fn slice(&self, a: u64, b: u64) -> Result<Instruction, AlgebraError> {
        let length = self.len();
        if a > b || b > length {
            return Err(AlgebraError::SliceOutOfRange { a, b, length });
        }
        if a == b {
            return Ok(empty_like(&self.dtype()));
        }
        Ok(match self {
            Instruction::Pattern(p) => {
                Instruction::Pattern(Pattern { buffer: p.buffer.slice(a as usize, b as usize) })
            }
            Instruction::Concatenated(c) => slice_concatenated(c, a, b),
            Instruction::Repeated(r) => slice_repeated(r, a, b),
            Instruction::Ramp(r) => slice_ramp(r, a, b),
        })
    }

    /// Pushes a struct-field projection through the tree.
    pub fn get_field(&self, name: &str) -> Result<Instruction, AlgebraError> {
        if self.dtype().field(name).is_none() {
            return Err(AlgebraError::NoSuchField(name.to_string()));
        }
        Ok(match self {
            Instruction::Pattern(p) => {
                Instruction::Pattern(Pattern { buffer: p.buffer.get_field(name).unwrap() })
            }
            Instruction::Concatenated(c) => {
                let children: Vec<Rc<Instruction>> = c
                    .children
                    .iter()
                    .map(|ch| Rc::new(ch.get_field(name).unwrap()))
                    .collect();
                let dtype = children[0].dtype();
                let depth = 1 + children.iter().map(|ch| ch.depth()).max().unwrap_or(0);
                Instruction::Concatenated(Concatenated { children, length: c.length, dtype, depth })
            }
            Instruction::Repeated(r) => {
                let child = Rc::new(r.child.get_field(name).unwrap());
                let depth = 1 + child.depth();
                Instruction::Repeated(Repeated { n: r.n, child, length: r.length, depth })
            }
            Instruction::Ramp(r) => Instruction::Ramp(Ramp {
                start: r.start.get_field(name).unwrap(),
                stop: r.stop.get_field(name).unwrap(),
                length: r.length,
            }),
        })
    }

    /// Element-wise application of `f` to an analog instruction. `Pattern`
    /// applies directly; `Concatenated`/`Repeated` push through; `Ramp`
    /// materialises first, which is O(length) rather than O(1) — documented
    /// in §4.B as an accepted performance cost of combinators like
    /// `CalibratedMapping` acting on a ramp segment.
    pub fn apply(&self, f: &dyn Fn(f64) -> f64) -> Instruction {
        match self {
            Instruction::Pattern(p) => Instruction::Pattern(Pattern { buffer: p.buffer.map_f64(f) }),
            Instruction::Concatenated(c) => {
                let children: Vec<Rc<Instruction>> =
                    c.children.iter().map(|ch| Rc::new(ch.apply(f))).collect();
                Instruction::Concatenated(Concatenated {
                    dtype: children[0].dtype(),
                    depth: 1 + children.iter().map(|ch| ch.depth()).max().unwrap_or(0),
                    length: c.length,
                    children,
                })
            }
            Instruction::Repeated(r) => {
                let child = Rc::new(r.child.apply(f));
                Instruction::Repeated(Repeated { n: r.n, depth: 1 + child.depth(), length: r.length, child })
            }
            Instruction::Ramp(_) => {
                let buf = self.to_pattern().map_f64(f);
                Instruction::Pattern(Pattern { buffer: buf })
            }
        }
    }
}

fn ramp_to_pattern(r: &Ramp) -> Buffer {
    match (&r.start, &r.stop) {
        (Buffer::F64(s0), Buffer::F64(s1)) => {
            let (start, stop) = (s0[0], s1[0]);
            let n = r.length as usize;
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                out.push(ramp_sample(start, stop, i as u64, r.length));
            }
            Buffer::F64(Rc::new(out))
        }
        (Buffer::Struct(f0), Buffer::Struct(f1)) => Buffer::Struct(
            f0.iter()
                .zip(f1.iter())
                .map(|((name, s0), (_, s1))| {
                    let sub_ramp = Ramp { start: s0.clone(), stop: s1.clone(), length: r.length };
                    (name.clone(), ramp_to_pattern(&sub_ramp))
                })
                .collect(),
        ),
        _ => panic!("Ramp endpoints of mismatched dtype"),
    }
}

/// `sample(i) = start + i*(stop-start)/length`
fn ramp_sample(start: f64, stop: f64, i: u64, length: u64) -> f64 {
    start + (i as f64) * (stop - start) / (length as f64)
}

fn slice_concatenated(c: &Concatenated, a: u64, b: u64) -> Instruction {
    let mut bounds = Vec::with_capacity(c.children.len() + 1);
    let mut acc = 0u64;
    bounds.push(0u64);
    for ch in &c.children {
        acc += ch.len();
        bounds.push(acc);
    }
    // index of first child touched by `a`, last child touched by `b`
    let first = bounds.partition_point(|&bound| bound <= a).saturating_sub(1);
    let last = bounds.partition_point(|&bound| bound < b).saturating_sub(1);
    let mut pieces = Vec::new();
    for idx in first..=last {
        let child = &c.children[idx];
        let child_start = bounds[idx];
        let child_end = bounds[idx + 1];
        let lo = a.max(child_start) - child_start;
        let hi = b.min(child_end) - child_start;
        if lo == hi {
            continue;
        }
        pieces.push(child.slice(lo, hi).expect("interior slice is in range by construction"));
    }
    concat(pieces).expect("non-empty slice pieces of matching dtype")
}

fn slice_repeated(r: &Repeated, a: u64, b: u64) -> Instruction {
    let clen = r.child.len();
    let head_a = a % clen;
    let head_b_reps = a / clen;
    let tail_b = b % clen;
    let tail_reps = b / clen;

    if head_b_reps == tail_reps {
        // entirely inside a single repetition
        return r.child.slice(head_a, tail_b).expect("in-range slice of repeated child");
    }

    let mut pieces = Vec::new();
    if head_a != 0 {
        pieces.push(r.child.slice(head_a, clen).expect("suffix slice of repeated child"));
    }
    let full_reps_start = if head_a == 0 { head_b_reps } else { head_b_reps + 1 };
    let full_reps = tail_reps - full_reps_start;
    if full_reps > 0 {
        pieces.push(repeat((*r.child).clone(), full_reps).expect("non-negative repeat count"));
    }
    if tail_b != 0 {
        pieces.push(r.child.slice(0, tail_b).expect("prefix slice of repeated child"));
    }
    concat(pieces).expect("non-empty slice pieces of matching dtype")
}

fn slice_ramp(r: &Ramp, a: u64, b: u64) -> Instruction {
    match (&r.start, &r.stop) {
        (Buffer::F64(s0), Buffer::F64(s1)) => {
            let (start, stop) = (s0[0], s1[0]);
            let new_start = ramp_sample(start, stop, a, r.length);
            let new_stop = ramp_sample(start, stop, b, r.length);
            Instruction::Ramp(Ramp {
                start: Buffer::F64(Rc::new(vec![new_start])),
                stop: Buffer::F64(Rc::new(vec![new_stop])),
                length: b - a,
            })
        }
        (Buffer::Struct(_), Buffer::Struct(_)) => {
            // Slice field-by-field and re-merge; struct ramps are rare
            // enough (only produced by merge()) that this path trades a
            // little allocation for far simpler code.
            let full = Instruction::Ramp(r.clone());
            let buf = full.to_pattern().slice(a as usize, b as usize);
            Instruction::Pattern(Pattern { buffer: buf })
        }
        _ => panic!("Ramp endpoints of mismatched dtype"),
    }
}

/// Smart constructor: wraps a dense buffer as a `Pattern`. Always succeeds;
/// an empty buffer of any dtype is the canonical representation of the
/// empty instruction.
pub fn pattern(buffer: Buffer) -> Instruction {
    Instruction::Pattern(Pattern { buffer })
}

pub fn empty_like(dtype: &Dtype) -> Instruction {
    pattern(empty_buffer(dtype))
}

fn empty_buffer(dtype: &Dtype) -> Buffer {
    match dtype {
        Dtype::Bool => Buffer::Bool(Rc::new(Vec::new())),
        Dtype::F64 => Buffer::F64(Rc::new(Vec::new())),
        Dtype::Struct(fields) => {
            Buffer::Struct(fields.iter().map(|(n, d)| (n.clone(), empty_buffer(d))).collect())
        }
    }
}

/// Smart constructor: concatenates instructions left to right. Drops
/// empties, flattens nested `Concatenated`, and merges adjacent `Pattern`s
/// with a single buffer copy. All non-empty operands must share a dtype.
pub fn concat(xs: Vec<Instruction>) -> Result<Instruction, AlgebraError> {
    if xs.is_empty() {
        return Err(AlgebraError::EmptyJoin);
    }
    let dtype = xs.iter().find(|x| !x.is_empty()).map(|x| x.dtype()).unwrap_or_else(|| xs[0].dtype());
    for x in &xs {
        if !x.is_empty() && x.dtype() != dtype {
            return Err(AlgebraError::DtypeMismatch { left: dtype, right: x.dtype() });
        }
    }

    let mut flat: Vec<Instruction> = Vec::with_capacity(xs.len());
    for x in xs {
        if x.is_empty() {
            continue;
        }
        match x {
            Instruction::Concatenated(c) => {
                for ch in c.children {
                    flat.push((*ch).clone());
                }
            }
            other => flat.push(other),
        }
    }

    if flat.is_empty() {
        return Ok(empty_like(&dtype));
    }
    if flat.len() == 1 {
        return Ok(flat.into_iter().next().unwrap());
    }

    // merge runs of adjacent Patterns into one buffer copy each
    let mut merged: Vec<Instruction> = Vec::with_capacity(flat.len());
    let mut run: Vec<Buffer> = Vec::new();
    for item in flat {
        match item {
            Instruction::Pattern(p) => run.push(p.buffer),
            other => {
                flush_pattern_run(&mut run, &mut merged);
                merged.push(other);
            }
        }
    }
    flush_pattern_run(&mut run, &mut merged);

    if merged.len() == 1 {
        return Ok(merged.into_iter().next().unwrap());
    }

    let length = merged.iter().map(|i| i.len()).sum();
    let depth = 1 + merged.iter().map(|i| i.depth()).max().unwrap_or(0);
    Ok(Instruction::Concatenated(Concatenated {
        children: merged.into_iter().map(Rc::new).collect(),
        length,
        dtype,
        depth,
    }))
}

fn flush_pattern_run(run: &mut Vec<Buffer>, merged: &mut Vec<Instruction>) {
    if run.is_empty() {
        return;
    }
    let refs: Vec<&Buffer> = run.iter().collect();
    merged.push(Instruction::Pattern(Pattern { buffer: Buffer::concat(&refs) }));
    run.clear();
}

/// Smart constructor: repeats `x` `n` times, collapsing `Repeated(Repeated)`
/// into a single node with the product of counts.
pub fn repeat(x: Instruction, n: u64) -> Result<Instruction, AlgebraError> {
    if n == 0 {
        return Ok(empty_like(&x.dtype()));
    }
    if n == 1 {
        return Ok(x);
    }
    Ok(match x {
        Instruction::Repeated(r) => {
            let total_n = r.n * n;
            Instruction::Repeated(Repeated {
                n: total_n,
                depth: r.depth,
                length: r.child.len() * total_n,
                child: r.child,
            })
        }
        other => {
            let length = other.len() * n;
            let depth = 1 + other.depth();
            Instruction::Repeated(Repeated { n, length, depth, child: Rc::new(other) })
        }
    })
}

pub fn repeat_checked(x: Instruction, n: i64) -> Result<Instruction, AlgebraError> {
    if n < 0 {
        return Err(AlgebraError::BadRepeat(n));
    }
    repeat(x, n as u64)
}

/// Smart constructor: a linear ramp over `length` samples. A zero-length
/// ramp is the empty pattern of the ramp's dtype.
pub fn ramp(start: Buffer, stop: Buffer, length: u64) -> Instruction {
    assert_eq!(start.dtype(), stop.dtype(), "Ramp endpoints must share a dtype");
    assert_eq!(start.len(), 1, "Ramp start must be a single sample");
    assert_eq!(stop.len(), 1, "Ramp stop must be a single sample");
    if length == 0 {
        return empty_like(&start.dtype());
    }
    Instruction::Ramp(Ramp { start, stop, length })
}

/// Merges two equal-length instructions into one whose dtype is the
/// combined struct of both (channel stacking). `name_a`/`name_b` name the
/// new top-level fields when an operand's own dtype isn't already a
/// struct (if it is, its existing field names are kept instead of
/// nesting).
pub fn merge(a: &Instruction, name_a: &str, b: &Instruction, name_b: &str) -> Result<Instruction, AlgebraError> {
    if a.len() != b.len() {
        return Err(AlgebraError::LengthMismatch { a: a.len(), b: b.len() });
    }
    if a.is_empty() {
        let dtype = merged_dtype(&a.dtype(), name_a, &b.dtype(), name_b);
        return Ok(empty_like(&dtype));
    }
    Ok(merge_inner(a, name_a, b, name_b))
}

fn merged_dtype(da: &Dtype, name_a: &str, db: &Dtype, name_b: &str) -> Dtype {
    let mut fields = Vec::new();
    match da {
        Dtype::Struct(f) => fields.extend(f.iter().cloned()),
        other => fields.push((name_a.to_string(), other.clone())),
    }
    match db {
        Dtype::Struct(f) => fields.extend(f.iter().cloned()),
        other => fields.push((name_b.to_string(), other.clone())),
    }
    Dtype::Struct(fields)
}

fn merge_inner(a: &Instruction, name_a: &str, b: &Instruction, name_b: &str) -> Instruction {
    use Instruction::*;
    match (a, b) {
        (Pattern(pa), Pattern(pb)) => {
            Instruction::Pattern(Pattern { buffer: Buffer::merge_named(&pa.buffer, name_a, &pb.buffer, name_b) })
        }
        (Ramp(ra), Ramp(rb)) if ra.length == rb.length => Instruction::Ramp(Ramp {
            start: Buffer::merge_named(&ra.start, name_a, &rb.start, name_b),
            stop: Buffer::merge_named(&ra.stop, name_a, &rb.stop, name_b),
            length: ra.length,
        }),
        (Ramp(ra), Repeated(rb)) if rb.child.len() == 1 => {
            merge_ramp_with_singleton(ra, name_a, &rb.child, name_b, true)
        }
        (Repeated(ra), Ramp(rb)) if ra.child.len() == 1 => {
            merge_ramp_with_singleton(rb, name_b, &ra.child, name_a, false)
        }
        (Repeated(ra), Repeated(rb)) => merge_repeated_repeated(ra, name_a, rb, name_b),
        (Concatenated(ca), Concatenated(cb)) => merge_concatenated_concatenated(ca, name_a, cb, name_b),
        (Concatenated(ca), _) => merge_concatenated_other(ca, name_a, b, name_b, true),
        (_, Concatenated(cb)) => merge_concatenated_other(cb, name_b, a, name_a, false),
        _ => {
            // documented fallback: flatten both and merge as Patterns
            let buf = Buffer::merge_named(&a.to_pattern(), name_a, &b.to_pattern(), name_b);
            Instruction::Pattern(Pattern { buffer: buf })
        }
    }
}

fn merge_ramp_with_singleton(
    ramp_side: &Ramp,
    ramp_name: &str,
    singleton: &Rc<Instruction>,
    singleton_name: &str,
    ramp_is_a: bool,
) -> Instruction {
    let value = singleton.to_pattern();
    let (start, stop) = if ramp_is_a {
        (
            Buffer::merge_named(&ramp_side.start, ramp_name, &value, singleton_name),
            Buffer::merge_named(&ramp_side.stop, ramp_name, &value, singleton_name),
        )
    } else {
        (
            Buffer::merge_named(&value, singleton_name, &ramp_side.start, ramp_name),
            Buffer::merge_named(&value, singleton_name, &ramp_side.stop, ramp_name),
        )
    };
    Instruction::Ramp(Ramp { start, stop, length: ramp_side.length })
}

fn merge_repeated_repeated(ra: &Repeated, name_a: &str, rb: &Repeated, name_b: &str) -> Instruction {
    let block = lcm(ra.child.len(), rb.child.len());
    let tiled_a = tile_to(&ra.child, block);
    let tiled_b = tile_to(&rb.child, block);
    let merged_block = merge_inner(&tiled_a, name_a, &tiled_b, name_b);
    let total = ra.length;
    let reps = total / block;
    repeat(merged_block, reps).expect("non-negative repeat count")
}

fn tile_to(child: &Rc<Instruction>, target_len: u64) -> Instruction {
    let clen = child.len();
    if clen == target_len {
        return (**child).clone();
    }
    let reps = target_len / clen;
    repeat((**child).clone(), reps).expect("non-negative repeat count")
}

fn merge_concatenated_concatenated(ca: &Concatenated, name_a: &str, cb: &Concatenated, name_b: &str) -> Instruction {
    let bounds_a = cumulative_bounds(&ca.children);
    let bounds_b = cumulative_bounds(&cb.children);
    let mut union: Vec<u64> = bounds_a.iter().chain(bounds_b.iter()).copied().collect();
    union.sort_unstable();
    union.dedup();

    let whole_a = Instruction::Concatenated(ca.clone());
    let whole_b = Instruction::Concatenated(cb.clone());
    let mut pieces = Vec::with_capacity(union.len().saturating_sub(1));
    for w in union.windows(2) {
        let (lo, hi) = (w[0], w[1]);
        let slice_a = whole_a.slice(lo, hi).expect("union bound is in range");
        let slice_b = whole_b.slice(lo, hi).expect("union bound is in range");
        pieces.push(merge_inner(&slice_a, name_a, &slice_b, name_b));
    }
    concat(pieces).expect("non-empty merged pieces of matching dtype")
}

fn merge_concatenated_other(
    c: &Concatenated,
    c_name: &str,
    other: &Instruction,
    other_name: &str,
    c_is_a: bool,
) -> Instruction {
    let bounds = cumulative_bounds(&c.children);
    let mut pieces = Vec::with_capacity(c.children.len());
    for (idx, child) in c.children.iter().enumerate() {
        let lo = bounds[idx];
        let hi = bounds[idx + 1];
        let other_slice = other.slice(lo, hi).expect("boundary slice of matching length");
        let merged = if c_is_a {
            merge_inner(child, c_name, &other_slice, other_name)
        } else {
            merge_inner(&other_slice, other_name, child, c_name)
        };
        pieces.push(merged);
    }
    concat(pieces).expect("non-empty merged pieces of matching dtype")
}

fn cumulative_bounds(children: &[Rc<Instruction>]) -> Vec<u64> {
    let mut bounds = Vec::with_capacity(children.len() + 1);
    let mut acc = 0u64;
    bounds.push(0);
    for ch in children {
        acc += ch.len();
        bounds.push(acc);
    }
    bounds
}

#[cfg(test)]
mod test {
    use super::*;

    fn bool_pattern(vals: &[bool]) -> Instruction {
        pattern(Buffer::Bool(Rc::new(vals.to_vec())))
    }

    fn f64_pattern(vals: &[f64]) -> Instruction {
        pattern(Buffer::F64(Rc::new(vals.to_vec())))
    }

    #[test]
    fn length_matches_to_pattern() {
        let x = repeat(bool_pattern(&[true, false]), 3).unwrap();
        assert_eq!(x.len(), x.to_pattern().len() as u64);
    }

    #[test]
    fn slice_full_range_is_identity_on_flatten() {
        let x = concat(vec![f64_pattern(&[1.0, 2.0]), f64_pattern(&[3.0])]).unwrap();
        let full = x.slice(0, x.len()).unwrap();
        assert_eq!(full.to_pattern(), x.to_pattern());
    }

    #[test]
    fn slice_matches_flatten_slice() {
        let x = repeat(f64_pattern(&[1.0, 2.0, 3.0]), 3).unwrap();
        let sliced = x.slice(2, 7).unwrap();
        let Buffer::F64(expected_full) = x.to_pattern() else { panic!() };
        let expected: Vec<f64> = expected_full[2..7].to_vec();
        let Buffer::F64(got) = sliced.to_pattern() else { panic!() };
        assert_eq!(*got, expected);
    }

    #[test]
    fn repeat_collapse() {
        let x = f64_pattern(&[1.0, 2.0]);
        let a = repeat(repeat(x.clone(), 3).unwrap(), 2).unwrap();
        let b = repeat(x, 6).unwrap();
        assert_eq!(a.to_pattern(), b.to_pattern());
    }

    #[test]
    fn concat_associativity_on_flatten() {
        let a = f64_pattern(&[1.0]);
        let b = f64_pattern(&[2.0]);
        let c = f64_pattern(&[3.0]);
        let left = concat(vec![a.clone(), concat(vec![b.clone(), c.clone()]).unwrap()]).unwrap();
        let right = concat(vec![concat(vec![a, b]).unwrap(), c]).unwrap();
        assert_eq!(left.to_pattern(), right.to_pattern());
    }

    #[test]
    fn merge_pattern_pattern_preserves_fields() {
        let a = bool_pattern(&[true, false]);
        let b = f64_pattern(&[1.0, 2.0]);
        let merged = merge(&a, "digital", &b, "analog").unwrap();
        assert_eq!(merged.len(), 2);
        let x = merged.get_field("digital").unwrap();
        let y = merged.get_field("analog").unwrap();
        assert_eq!(x.to_pattern(), a.to_pattern());
        assert_eq!(y.to_pattern(), b.to_pattern());
    }

    #[test]
    fn merge_repeated_repeated_via_lcm() {
        let a = repeat(bool_pattern(&[true, false]), 3).unwrap(); // len 6
        let b = repeat(bool_pattern(&[false, false, true]), 2).unwrap(); // len 6
        let merged = merge(&a, "a", &b, "b").unwrap();
        assert_eq!(merged.get_field("a").unwrap().to_pattern(), a.to_pattern());
        assert_eq!(merged.get_field("b").unwrap().to_pattern(), b.to_pattern());
    }

    #[test]
    fn ramp_sampling_formula() {
        let x = ramp(Buffer::F64(Rc::new(vec![0.0])), Buffer::F64(Rc::new(vec![10.0])), 10);
        let Buffer::F64(samples) = x.to_pattern() else { panic!() };
        for i in 0..10 {
            assert!((samples[i] - ramp_sample(0.0, 10.0, i as u64, 10)).abs() < 1e-12);
        }
    }

    #[test]
    fn repeat_zero_preserves_dtype() {
        let x = f64_pattern(&[1.0, 2.0]);
        let empty = repeat(x, 0).unwrap();
        assert_eq!(empty.len(), 0);
        assert_eq!(empty.dtype(), Dtype::F64);
    }

    #[test]
    fn concat_dtype_mismatch_fails() {
        let a = bool_pattern(&[true]);
        let b = f64_pattern(&[1.0]);
        assert!(matches!(concat(vec![a, b]), Err(AlgebraError::DtypeMismatch { .. })));
    }

    #[test]
    fn slice_out_of_range_fails() {
        let a = bool_pattern(&[true, false]);
        assert!(matches!(a.slice(0, 5), Err(AlgebraError::SliceOutOfRange { .. })));
    }
}
