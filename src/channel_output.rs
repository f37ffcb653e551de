//! Channel-output combinators (component E): a small expression tree over
//! instructions, each node transforming its input while preserving length
//! and dtype invariants. Grounded in the `broaden.py` bleed-propagation
//! algorithm for [`ChannelOutput::BroadenLeft`].

use std::rc::Rc;

use crate::error::{EvaluationError, ShotCompileError};
use crate::expr::Expression;
use crate::instruction::{self, Buffer, Instruction};
use crate::shot::ShotContext;
use crate::timing::{self, TimeStep};
use crate::units::{self, Unit};

/// `(instruction, unit)`; `unit` is `None` for boolean/digital results.
pub struct DimensionedSeries {
    pub instruction: Instruction,
    pub unit: Option<Unit>,
}

/// A point of a piecewise-linear calibration curve.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationPoint {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone)]
pub enum ChannelOutput {
    Constant(Expression),
    LaneRef { name: String, default: Option<Expression> },
    CalibratedMapping { input: Box<ChannelOutput>, points: Vec<CalibrationPoint>, out_unit: Option<String> },
    Advance { input: Box<ChannelOutput>, expr: Expression },
    Delay { input: Box<ChannelOutput>, expr: Expression },
    BroadenLeft { input: Box<ChannelOutput>, width: Expression },
}

impl ChannelOutput {
    /// `len(result) == prepend + number_ticks(0, shot_duration, delta) + append`.
    pub fn evaluate(
        &self,
        delta: TimeStep,
        prepend: u64,
        append: u64,
        ctx: &mut ShotContext,
        channel: &str,
    ) -> Result<DimensionedSeries, ShotCompileError> {
        let wrap_eval = |e: EvaluationError| ShotCompileError::Evaluation {
            device: ctx.device_name.clone(),
            channel: channel.to_string(),
            source: e,
        };
        match self {
            ChannelOutput::Constant(expr) => {
                let full_length = prepend + ctx.number_ticks(delta) + append;
                let q = expr.evaluate_quantity(&ctx.variables).map_err(wrap_eval)?;
                let instr = instruction::repeat(
                    instruction::pattern(Buffer::F64(Rc::new(vec![q.magnitude]))),
                    full_length,
                )
                .expect("non-negative repeat count");
                Ok(DimensionedSeries { instruction: instr, unit: Some(q.unit) })
            }
            ChannelOutput::LaneRef { name, default } => {
                self.evaluate_lane_ref(name, default.as_ref(), delta, prepend, append, ctx, channel)
            }
            ChannelOutput::CalibratedMapping { input, points, out_unit } => {
                let series = input.evaluate(delta, prepend, append, ctx, channel)?;
                let mapped_unit = match out_unit {
                    Some(symbol) => {
                        let (unit, _scale) = units::lookup(symbol).ok_or_else(|| {
                            wrap_eval(EvaluationError::UnitMismatch {
                                expression: format!("<calibrated mapping output unit `{symbol}`>"),
                                expected: "a known unit".to_string(),
                                found: series.unit.unwrap_or(Unit::DIMENSIONLESS),
                            })
                        })?;
                        unit
                    }
                    None => Unit::DIMENSIONLESS,
                };
                let points = points.clone();
                let mapped = series.instruction.apply(&move |x| piecewise_linear(&points, x));
                Ok(DimensionedSeries { instruction: mapped, unit: Some(mapped_unit) })
            }
            ChannelOutput::Advance { input, expr } => {
                let k = ticks_from_expr(expr, delta, ctx).map_err(wrap_eval)?;
                if k < 0 || k as u64 > prepend {
                    return Err(ShotCompileError::NegativeShift {
                        channel: channel.to_string(),
                        requested: k,
                        budget: prepend,
                    });
                }
                input.evaluate(delta, prepend - k as u64, append + k as u64, ctx, channel)
            }
            ChannelOutput::Delay { input, expr } => {
                let k = ticks_from_expr(expr, delta, ctx).map_err(wrap_eval)?;
                if k < 0 || k as u64 > append {
                    return Err(ShotCompileError::NegativeShift {
                        channel: channel.to_string(),
                        requested: k,
                        budget: append,
                    });
                }
                input.evaluate(delta, prepend + k as u64, append - k as u64, ctx, channel)
            }
            ChannelOutput::BroadenLeft { input, width } => {
                let series = input.evaluate(delta, prepend, append, ctx, channel)?;
                let w = ticks_from_expr(width, delta, ctx).map_err(wrap_eval)?;
                if w < 0 {
                    return Err(ShotCompileError::NegativeShift { channel: channel.to_string(), requested: w, budget: 0 });
                }
                let (broadened, _bleed) = broaden_left(&series.instruction, w as u64);
                Ok(DimensionedSeries { instruction: broadened, unit: series.unit })
            }
        }
    }

    fn evaluate_lane_ref(
        &self,
        name: &str,
        default: Option<&Expression>,
        delta: TimeStep,
        prepend: u64,
        append: u64,
        ctx: &mut ShotContext,
        channel: &str,
    ) -> Result<DimensionedSeries, ShotCompileError> {
        let wrap_eval = |e: EvaluationError| ShotCompileError::Evaluation {
            device: ctx.device_name.clone(),
            channel: channel.to_string(),
            source: e,
        };
        let core = if ctx.has_lane(name) {
            ctx.mark_consumed(name);
            ctx.compile_lane(name).map_err(wrap_eval)?
        } else if let Some(default_expr) = default {
            let full_length = ctx.number_ticks(delta);
            let q = default_expr.evaluate_quantity(&ctx.variables).map_err(wrap_eval)?;
            let instr = instruction::repeat(
                instruction::pattern(Buffer::F64(Rc::new(vec![q.magnitude]))),
                full_length,
            )
            .expect("non-negative repeat count");
            return Ok(DimensionedSeries { instruction: extend(&instr, prepend, append), unit: Some(q.unit) });
        } else {
            return Err(ShotCompileError::UnknownLane { lane: name.to_string() });
        };
        Ok(DimensionedSeries { instruction: extend(&core, prepend, append), unit: None })
    }
}

/// Extends a core shot-duration instruction by repeating its boundary
/// samples into the prepend/append budget.
fn extend(core: &Instruction, prepend: u64, append: u64) -> Instruction {
    if prepend == 0 && append == 0 {
        return core.clone();
    }
    let mut pieces = Vec::new();
    if prepend > 0 {
        let first = core.slice(0, 1).expect("core instruction is non-empty");
        pieces.push(instruction::repeat(first, prepend).expect("non-negative repeat count"));
    }
    pieces.push(core.clone());
    if append > 0 {
        let last = core.slice(core.len() - 1, core.len()).expect("core instruction is non-empty");
        pieces.push(instruction::repeat(last, append).expect("non-negative repeat count"));
    }
    instruction::concat(pieces).expect("prepend/core/append share a dtype")
}

fn ticks_from_expr(expr: &Expression, delta: TimeStep, ctx: &ShotContext) -> Result<i64, EvaluationError> {
    let q = expr.evaluate_quantity(&ctx.variables)?;
    let seconds = q.magnitude_in_unit("s").ok_or_else(|| EvaluationError::UnitMismatch {
        expression: expr.source().to_string(),
        expected: "s".to_string(),
        found: q.unit,
    })?;
    let step_seconds = delta.seconds();
    let ticks = seconds / step_seconds.to_f64_lossy();
    Ok(ticks.round() as i64)
}

trait RatioLossy {
    fn to_f64_lossy(&self) -> f64;
}
impl RatioLossy for num::rational::Ratio<i64> {
    fn to_f64_lossy(&self) -> f64 {
        *self.numer() as f64 / *self.denom() as f64
    }
}

fn piecewise_linear(points: &[CalibrationPoint], x: f64) -> f64 {
    if points.is_empty() {
        return x;
    }
    if x <= points[0].input {
        return points[0].output;
    }
    if x >= points[points.len() - 1].input {
        return points[points.len() - 1].output;
    }
    for w in points.windows(2) {
        let (a, b) = (w[0], w[1]);
        if x >= a.input && x <= b.input {
            let t = (x - a.input) / (b.input - a.input);
            return a.output + t * (b.output - a.output);
        }
    }
    points[points.len() - 1].output
}

/// Widens every boolean high pulse leftward by `width` ticks, per
/// `broaden.py`. Returns the broadened instruction and the "bleed" —
/// samples before the left edge that must be forced high to preserve
/// semantics across an enclosing concatenation boundary.
pub fn broaden_left(instr: &Instruction, width: u64) -> (Instruction, u64) {
    match instr {
        Instruction::Pattern(_) => broaden_pattern(instr, width),
        Instruction::Concatenated(c) => broaden_concatenated(c, width),
        Instruction::Repeated(r) => broaden_repeated(r, width),
        Instruction::Ramp(_) => panic!("BroadenLeft requires a boolean instruction"),
    }
}

fn broaden_pattern(instr: &Instruction, width: u64) -> (Instruction, u64) {
    let Buffer::Bool(values) = instr.to_pattern() else { panic!("BroadenLeft requires a boolean instruction") };
    let n = values.len();
    let mut out = vec![false; n];
    let mut first_raw_high: Option<usize> = None;
    for i in 0..n {
        let hi = (i as u64 + width + 1).min(n as u64) as usize;
        out[i] = values[i..hi].iter().any(|&v| v);
        if values[i] && first_raw_high.is_none() {
            first_raw_high = Some(i);
        }
    }
    // Bleed is owed to a preceding sibling only when an original (unwidened)
    // high sample sits within `width` ticks of this instruction's own start
    // — its lookback window reaches past our left edge.
    let bleed = match first_raw_high {
        Some(j) if (j as u64) < width => width - j as u64,
        _ => 0,
    };
    (instruction::pattern(Buffer::Bool(Rc::new(out))), bleed)
}

fn broaden_concatenated(c: &crate::instruction::Concatenated, width: u64) -> (Instruction, u64) {
    let children = c.children();
    let mut expanded_rev: Vec<Instruction> = Vec::with_capacity(children.len());
    // `carry` is bleed owed by a later child that its own broadening
    // couldn't absorb; it must be forced high at the tail of this child.
    let mut carry = 0u64;
    for child in children.iter().rev() {
        let (mut expanded, own_bleed) = broaden_left(child, width);
        let len = expanded.len();
        if carry > 0 {
            expanded = force_high_tail(&expanded, carry.min(len));
        }
        carry = own_bleed.max(carry.saturating_sub(len));
        expanded_rev.push(expanded);
    }
    expanded_rev.reverse();
    (instruction::concat(expanded_rev).expect("broadened children share dtype"), carry)
}

fn force_high_tail(instr: &Instruction, count: u64) -> Instruction {
    let len = instr.len();
    if count == 0 {
        return instr.clone();
    }
    if count >= len {
        return instruction::pattern(Buffer::Bool(Rc::new(vec![true; len as usize])));
    }
    let head = instr.slice(0, len - count).expect("count < len");
    let tail_len = count;
    let true_tail = instruction::pattern(Buffer::Bool(Rc::new(vec![true; tail_len as usize])));
    instruction::concat(vec![head, true_tail]).expect("same dtype")
}

fn broaden_repeated(r: &crate::instruction::Repeated, width: u64) -> (Instruction, u64) {
    let (expanded, bleed) = broaden_left(r.child(), width);
    let n = r.n();
    let expanded_len = expanded.len();
    if bleed == 0 {
        return (instruction::repeat(expanded, n).expect("non-negative repeat count"), 0);
    }
    if n == 1 {
        return (expanded, bleed);
    }
    if bleed >= expanded_len {
        // Every earlier copy lies fully inside the pulse's lookback window.
        let all_true = instruction::pattern(Buffer::Bool(Rc::new(vec![true; expanded_len as usize])));
        let head = instruction::repeat(all_true, n - 1).expect("non-negative repeat count");
        return (instruction::concat(vec![head, expanded]).expect("same dtype"), bleed);
    }
    // Every earlier copy is identical, so the same tail-forced variant of
    // `expanded` repeats (n - 1) times before the final, unmodified copy.
    let left_instr = force_high_tail(&expanded, bleed);
    if left_instr == expanded {
        return (instruction::repeat(expanded, n).expect("non-negative repeat count"), bleed);
    }
    let head = instruction::repeat(left_instr, n - 1).expect("non-negative repeat count");
    (instruction::concat(vec![head, expanded]).expect("same dtype"), bleed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn s4_broaden_pattern() {
        let instr = instruction::pattern(Buffer::Bool(Rc::new(vec![false, false, false, true])));
        let (out, bleed) = broaden_left(&instr, 2);
        let Buffer::Bool(values) = out.to_pattern() else { panic!() };
        assert_eq!(*values, vec![false, true, true, true]);
        assert_eq!(bleed, 0);
    }

    #[test]
    fn s4_broaden_bleeds_into_preceding_sibling() {
        // A pulse one tick into the second child must bleed one tick back
        // into the tail of the first child.
        let first = instruction::pattern(Buffer::Bool(Rc::new(vec![false, false, false])));
        let second = instruction::pattern(Buffer::Bool(Rc::new(vec![false, true, false])));
        let whole = instruction::concat(vec![first, second]).unwrap();
        let (out, bleed) = broaden_left(&whole, 2);
        let Buffer::Bool(values) = out.to_pattern() else { panic!() };
        assert_eq!(*values, vec![false, false, true, true, true, false]);
        assert_eq!(bleed, 0);
    }

    #[test]
    fn piecewise_linear_clamps_outside_range() {
        let points = vec![CalibrationPoint { input: 0.0, output: 0.0 }, CalibrationPoint { input: 1.0, output: 10.0 }];
        assert_eq!(piecewise_linear(&points, -1.0), 0.0);
        assert_eq!(piecewise_linear(&points, 2.0), 10.0);
        assert!((piecewise_linear(&points, 0.5) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn calibrated_mapping_retargets_the_unit() {
        use crate::expr::{Env, Expression};
        use crate::shot::ShotContext;
        use std::collections::HashMap;

        let delta = TimeStep::from_nanos(1);
        let durations = vec![Expression::parse("5 ns").unwrap()];
        let mut ctx = ShotContext::new("source", Env::new(), HashMap::new(), &durations, delta).unwrap();

        let input = ChannelOutput::Constant(Expression::parse("0.5 V").unwrap());
        let points = vec![CalibrationPoint { input: 0.0, output: 0.0 }, CalibrationPoint { input: 1.0, output: 10.0 }];
        let mapping = ChannelOutput::CalibratedMapping {
            input: Box::new(input),
            points,
            out_unit: Some("A".to_string()),
        };

        let series = mapping.evaluate(delta, 0, 0, &mut ctx, "out").unwrap();
        assert_eq!(series.unit, Some(Unit::AMPERE));
        let Buffer::F64(values) = series.instruction.to_pattern() else { panic!() };
        assert!(values.iter().all(|&v| (v - 5.0).abs() < 1e-9));
    }
}
