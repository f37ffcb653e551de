//! Lane compilers (component D): turn a digital or analog time lane into
//! a single [`Instruction`] over a step schedule.

use std::rc::Rc;

use crate::error::EvaluationError;
use crate::expr::{Env, Expression, ScalarValue, TIME_VARIABLE};
use crate::instruction::{self, Buffer, Instruction};
use crate::timing::{self, Time, TimeStep};
use crate::units::{self, Quantity};

/// One cell of a digital lane: a literal boolean or an expression that
/// must evaluate (time-independently, or time-dependently per §9) to a
/// boolean.
#[derive(Debug, Clone, PartialEq)]
pub enum DigitalCell {
    Constant(bool),
    Expr(Expression),
}

#[derive(Debug, Clone)]
pub struct DigitalLane {
    /// One cell per step; must be the same length as the step schedule.
    pub cells: Vec<DigitalCell>,
}

/// One cell of an analog lane: an expression, or a ramp marker whose
/// endpoints are derived from the neighbouring cells.
#[derive(Debug, Clone)]
pub enum AnalogCell {
    Expr(Expression),
    Ramp,
}

#[derive(Debug, Clone)]
pub struct AnalogLane {
    pub cells: Vec<AnalogCell>,
    /// Output unit symbol; `None` means the lane is dimensionless.
    pub unit: Option<String>,
}

/// Evaluates a list of per-step duration expressions against `env`,
/// producing exact `Time`s.
pub fn evaluate_step_durations(step_durations: &[Expression], env: &Env) -> Result<Vec<Time>, EvaluationError> {
    let seconds: Result<Vec<f64>, EvaluationError> = step_durations
        .iter()
        .map(|expr| {
            let q = expr.evaluate_quantity(env)?;
            q.magnitude_in_unit("s").ok_or_else(|| EvaluationError::UnitMismatch {
                expression: expr.source().to_string(),
                expected: "s".to_string(),
                found: q.unit,
            })
        })
        .collect();
    let seconds = seconds?;
    timing::durations_from_seconds(&seconds).map_err(|cause| EvaluationError::Syntax {
        expression: "<step durations>".to_string(),
        cause: cause.to_string(),
    })
}

/// Groups a sequence of cells (compared structurally) into maximal runs of
/// adjacent equal cells — the "blocks" of §4.D.
fn blocks<T: PartialEq>(cells: &[T]) -> Vec<(usize, usize)> {
    let mut result = Vec::new();
    let mut start = 0;
    for i in 1..=cells.len() {
        if i == cells.len() || cells[i] != cells[i - 1] {
            result.push((start, i));
            start = i;
        }
    }
    result
}

impl DigitalLane {
    pub fn compile(&self, step_bounds: &[Time], delta: TimeStep, env: &Env) -> Result<Instruction, EvaluationError> {
        assert_eq!(self.cells.len() + 1, step_bounds.len());
        let mut pieces = Vec::new();
        for (start, stop) in blocks(&self.cells) {
            let length = timing::number_ticks(step_bounds[start], step_bounds[stop], delta);
            let instr = match &self.cells[start] {
                DigitalCell::Constant(b) => {
                    instruction::pattern(Buffer::Bool(Rc::new(vec![*b; length as usize])))
                }
                DigitalCell::Expr(expr) => expr.evaluate_digital_series(env, length)?,
            };
            pieces.push(instr);
        }
        Ok(instruction::concat(pieces).expect("digital lane blocks share a dtype and are non-empty"))
    }
}

impl AnalogLane {
    pub fn compile(
        &self,
        step_bounds: &[Time],
        delta: TimeStep,
        env: &Env,
    ) -> Result<Instruction, EvaluationError> {
        assert_eq!(self.cells.len() + 1, step_bounds.len());
        let mut pieces = Vec::new();
        for (index, cell) in self.cells.iter().enumerate() {
            let start = step_bounds[index];
            let stop = step_bounds[index + 1];
            let instr = match cell {
                AnalogCell::Expr(expr) => self.compile_expression_cell(expr, start, stop, delta, env)?,
                AnalogCell::Ramp => self.compile_ramp_cell(index, step_bounds, delta, env)?,
            };
            pieces.push(instr);
        }
        Ok(instruction::concat(pieces).expect("analog lane blocks share a dtype and are non-empty"))
    }

    fn compile_expression_cell(
        &self,
        expr: &Expression,
        start: Time,
        stop: Time,
        delta: TimeStep,
        env: &Env,
    ) -> Result<Instruction, EvaluationError> {
        let length = timing::number_ticks(start, stop, delta);
        if expr.is_time_independent() {
            let q = expr.evaluate_quantity(env)?;
            let value = self.magnitude_in_lane_unit(q, expr)?;
            let repeated = instruction::repeat(
                instruction::pattern(Buffer::F64(Rc::new(vec![value]))),
                length,
            )
            .expect("non-negative repeat count");
            return Ok(repeated);
        }
        let (instr, unit) = expr.evaluate_analog_series(env, start, stop, delta)?;
        let converted = convert_to_unit(instr, unit, self.unit.as_deref(), expr.source())?;
        if converted.len() != length {
            return Err(EvaluationError::LengthMismatch {
                expression: expr.source().to_string(),
                expected: length as usize,
                found: converted.len() as usize,
            });
        }
        Ok(converted)
    }

    fn compile_ramp_cell(
        &self,
        index: usize,
        step_bounds: &[Time],
        delta: TimeStep,
        env: &Env,
    ) -> Result<Instruction, EvaluationError> {
        let prev_expr = match self.cells.get(index.wrapping_sub(1)) {
            Some(AnalogCell::Expr(e)) if index > 0 => e,
            _ => panic!("ramp cell at index {index} has no preceding expression cell"),
        };
        let next_expr = match self.cells.get(index + 1) {
            Some(AnalogCell::Expr(e)) => e,
            _ => panic!("ramp cell at index {index} has no following expression cell"),
        };
        let previous_step_duration = step_bounds[index] - step_bounds[index - 1];

        let mut env_at_prev = env.clone();
        env_at_prev.insert(TIME_VARIABLE.to_string(), ScalarValue::Number(Quantity::from_literal(previous_step_duration.to_f64(), "s").unwrap()));
        let ramp_start = prev_expr.evaluate_quantity(&env_at_prev)?;

        let mut env_at_zero = env.clone();
        env_at_zero.insert(TIME_VARIABLE.to_string(), ScalarValue::Number(Quantity::dimensionless(0.0)));
        let ramp_end = next_expr.evaluate_quantity(&env_at_zero)?;

        let start_mag = self.magnitude_in_lane_unit(ramp_start, prev_expr)?;
        let stop_mag = self.magnitude_in_lane_unit(ramp_end, next_expr)?;

        let length = timing::number_ticks(step_bounds[index], step_bounds[index + 1], delta);
        Ok(instruction::ramp(
            Buffer::F64(Rc::new(vec![start_mag])),
            Buffer::F64(Rc::new(vec![stop_mag])),
            length,
        ))
    }

    fn magnitude_in_lane_unit(&self, q: Quantity, expr: &Expression) -> Result<f64, EvaluationError> {
        let symbol = self.unit.as_deref().unwrap_or("");
        q.magnitude_in_unit(symbol).ok_or_else(|| EvaluationError::UnitMismatch {
            expression: expr.source().to_string(),
            expected: symbol.to_string(),
            found: q.unit,
        })
    }
}

fn convert_to_unit(
    instr: Instruction,
    from: units::Unit,
    to_symbol: Option<&str>,
    expression: &str,
) -> Result<Instruction, EvaluationError> {
    let symbol = to_symbol.unwrap_or("");
    let (target, scale) = units::lookup(symbol).ok_or_else(|| EvaluationError::UnitMismatch {
        expression: expression.to_string(),
        expected: symbol.to_string(),
        found: from,
    })?;
    if from.dimension == units::Dimension::Decibel && target.dimension == units::Dimension::Dimensionless {
        return Ok(instr.apply(&move |x| 10f64.powf(x / 10.0) / scale));
    }
    if target.dimension != from.dimension {
        return Err(EvaluationError::UnitMismatch {
            expression: expression.to_string(),
            expected: symbol.to_string(),
            found: from,
        });
    }
    Ok(instr.apply(&move |x| x / scale))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::Expression;

    fn schedule(ns: &[i64]) -> Vec<Time> {
        let durations: Vec<Time> = ns.iter().map(|&n| Time::from_nanos(n)).collect();
        timing::step_bounds(&durations)
    }

    #[test]
    fn s1_digital_pattern() {
        let lane = DigitalLane {
            cells: vec![DigitalCell::Constant(true), DigitalCell::Constant(false)],
        };
        let bounds = schedule(&[10, 10]);
        let delta = TimeStep::from_nanos(1);
        let instr = lane.compile(&bounds, delta, &Env::new()).unwrap();
        assert_eq!(instr.len(), 20);
        let Buffer::Bool(samples) = instr.to_pattern() else { panic!() };
        assert!(samples[0..10].iter().all(|&b| b));
        assert!(samples[10..20].iter().all(|&b| !b));
    }

    #[test]
    fn s2_decibel_ramp_bridges_into_dimensionless_linear() {
        let lane = AnalogLane {
            cells: vec![
                AnalogCell::Expr(Expression::parse("0 dB").unwrap()),
                AnalogCell::Ramp,
                AnalogCell::Expr(Expression::parse("10 dB").unwrap()),
            ],
            unit: None,
        };
        let bounds = schedule(&[10, 10, 10]);
        let delta = TimeStep::from_nanos(1);
        let instr = lane.compile(&bounds, delta, &Env::new()).unwrap();
        assert_eq!(instr.len(), 30);
        let Buffer::F64(samples) = instr.to_pattern() else { panic!() };
        assert!(samples[0..10].iter().all(|&v| (v - 1.0).abs() < 1e-9));
        assert!((samples[29] - 10.0).abs() < 1e-9);
        assert!(samples[10] < samples[19]);
    }

    #[test]
    fn analog_lane_ramp_interpolates_between_flat_blocks() {
        let lane = AnalogLane {
            cells: vec![
                AnalogCell::Expr(Expression::parse("1 V").unwrap()),
                AnalogCell::Ramp,
                AnalogCell::Expr(Expression::parse("10 V").unwrap()),
            ],
            unit: Some("V".to_string()),
        };
        let bounds = schedule(&[10, 10, 10]);
        let delta = TimeStep::from_nanos(1);
        let instr = lane.compile(&bounds, delta, &Env::new()).unwrap();
        assert_eq!(instr.len(), 30);
        let Buffer::F64(samples) = instr.to_pattern() else { panic!() };
        assert!(samples[0..10].iter().all(|&v| (v - 1.0).abs() < 1e-9));
        assert!((samples[29] - 10.0).abs() < 1e-9);
        assert!(samples[10] < samples[19]);
    }
}
