//! The shot-compiler facade (component F): orchestrates lane compilation
//! (component D) and channel-output evaluation (component E) into the
//! per-device parameter maps a sequencer driver consumes.
//!
//! `DeviceCompiler` is the trait boundary named in spec.md §9's
//! "duck-typing → traits" redesign flag: device drivers/RPC transport are
//! out of scope (§1), this crate only defines the two operations a real
//! driver must implement.

use std::cell::RefCell;
use std::collections::HashMap;

use log::{debug, warn};

use crate::channel_output::ChannelOutput;
use crate::error::{DeviceCompileError, EvaluationError, ShotCompileError};
use crate::expr::{Env, Expression};
use crate::instruction::Instruction;
use crate::lane::{AnalogLane, DigitalLane};
use crate::timing::{self, Time, TimeStep};

/// A device's compiled output: one [`Instruction`] per named channel.
pub type ParameterMap = HashMap<String, Instruction>;

#[derive(Debug, Clone)]
pub enum Lane {
    Digital(DigitalLane),
    Analog(AnalogLane),
}

impl Lane {
    fn compile(&self, step_bounds: &[Time], delta: TimeStep, env: &Env) -> Result<Instruction, EvaluationError> {
        match self {
            Lane::Digital(lane) => lane.compile(step_bounds, delta, env),
            Lane::Analog(lane) => lane.compile(step_bounds, delta, env),
        }
    }
}

/// Context shared across an entire experiment sequence, independent of any
/// one shot — the constants and parameters available to
/// `DeviceCompiler::compile_init`.
#[derive(Debug, Clone)]
pub struct SequenceContext {
    pub variables: Env,
}

/// One device's view onto one compiled shot: its time lanes, the shared
/// variable environment, and the bookkeeping needed to enforce that every
/// declared lane is consumed by at least one channel output (§8 property
/// 8 / scenario S6).
pub struct ShotContext {
    pub device_name: String,
    pub variables: Env,
    lanes: HashMap<String, Lane>,
    consumed: RefCell<HashMap<String, bool>>,
    compiled: RefCell<HashMap<String, Instruction>>,
    step_bounds: Vec<Time>,
    delta: TimeStep,
}

impl ShotContext {
    pub fn new(
        device_name: impl Into<String>,
        variables: Env,
        lanes: HashMap<String, Lane>,
        step_durations: &[Expression],
        delta: TimeStep,
    ) -> Result<ShotContext, EvaluationError> {
        let durations = crate::lane::evaluate_step_durations(step_durations, &variables)?;
        let step_bounds = timing::step_bounds(&durations);
        let consumed = lanes.keys().map(|name| (name.clone(), false)).collect();
        Ok(ShotContext {
            device_name: device_name.into(),
            variables,
            lanes,
            consumed: RefCell::new(consumed),
            compiled: RefCell::new(HashMap::new()),
            step_bounds,
            delta,
        })
    }

    pub fn shot_duration(&self) -> Time {
        *self.step_bounds.last().expect("step_bounds always has at least one entry")
    }

    pub fn number_ticks(&self, delta: TimeStep) -> u64 {
        timing::number_ticks(Time::ZERO, self.shot_duration(), delta)
    }

    pub fn has_lane(&self, name: &str) -> bool {
        self.lanes.contains_key(name)
    }

    pub fn mark_consumed(&self, name: &str) {
        self.consumed.borrow_mut().insert(name.to_string(), true);
    }

    /// Compiles (and caches) the named lane over this context's step
    /// schedule. Does not itself mark the lane consumed; callers that
    /// reference a lane through [`ChannelOutput::LaneRef`] do that via
    /// [`ShotContext::mark_consumed`].
    pub fn compile_lane(&self, name: &str) -> Result<Instruction, EvaluationError> {
        if let Some(instr) = self.compiled.borrow().get(name) {
            return Ok(instr.clone());
        }
        let lane = self.lanes.get(name).unwrap_or_else(|| panic!("compile_lane called on unknown lane `{name}`"));
        let instr = lane.compile(&self.step_bounds, self.delta, &self.variables)?;
        self.compiled.borrow_mut().insert(name.to_string(), instr.clone());
        Ok(instr)
    }

    /// Every declared lane must be consumed by some channel output;
    /// otherwise the shot silently drops a waveform the user declared.
    fn unused_lanes(&self) -> Vec<String> {
        self.consumed
            .borrow()
            .iter()
            .filter(|(_, &used)| !used)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// An object-safe boundary: the two operations a real sequencer driver
/// must implement to plug into this crate (device drivers and RPC
/// transport themselves are out of scope, §1).
pub trait DeviceCompiler {
    fn compile_init(&self, ctx: &SequenceContext) -> Result<ParameterMap, DeviceCompileError>;
    fn compile_shot(&self, ctx: &ShotContext) -> Result<ParameterMap, DeviceCompileError>;
}

/// One channel's declared output expression, paired with its name for
/// logging and error messages.
pub struct ChannelDeclaration {
    pub name: String,
    pub output: ChannelOutput,
}

/// Compiles every declared channel of one device for one shot, enforcing
/// that every lane the device declares is consumed by some channel and
/// logging each phase transition per SPEC_FULL.md §4.F.
pub fn compile_device_shot(
    channels: &[ChannelDeclaration],
    ctx: &mut ShotContext,
    delta: TimeStep,
    prepend: u64,
    append: u64,
) -> Result<ParameterMap, ShotCompileError> {
    debug!("compiling shot for device `{}`", ctx.device_name);
    let mut out = ParameterMap::new();
    for decl in channels {
        let series = decl.output.evaluate(delta, prepend, append, ctx, &decl.name)?;
        out.insert(decl.name.clone(), series.instruction);
    }
    let unused = ctx.unused_lanes();
    if !unused.is_empty() {
        warn!("device `{}` has unused lanes: {unused:?}", ctx.device_name);
        return Err(ShotCompileError::UnusedLane { lane: unused[0].clone() });
    }
    debug!("finished compiling shot for device `{}`", ctx.device_name);
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel_output::ChannelOutput;
    use crate::lane::DigitalCell;
    use crate::timing::TimeStep;

    fn step_ns(values: &[i64]) -> Vec<Expression> {
        values.iter().map(|n| Expression::parse(&format!("{n} ns")).unwrap()).collect()
    }

    #[test]
    fn s6_unused_lane_fails_compilation() {
        let mut lanes = HashMap::new();
        lanes.insert(
            "shutter".to_string(),
            Lane::Digital(DigitalLane { cells: vec![DigitalCell::Constant(true)] }),
        );
        let durations = step_ns(&[10]);
        let mut ctx = ShotContext::new("camera", Env::new(), lanes, &durations, TimeStep::from_nanos(1)).unwrap();
        let channels = vec![ChannelDeclaration {
            name: "trigger".to_string(),
            output: ChannelOutput::Constant(Expression::parse("1 V").unwrap()),
        }];
        let err = compile_device_shot(&channels, &mut ctx, TimeStep::from_nanos(1), 0, 0).unwrap_err();
        assert!(matches!(err, ShotCompileError::UnusedLane { lane } if lane == "shutter"));
    }

    #[test]
    fn consumed_lane_compiles_cleanly() {
        let mut lanes = HashMap::new();
        lanes.insert(
            "shutter".to_string(),
            Lane::Digital(DigitalLane { cells: vec![DigitalCell::Constant(true)] }),
        );
        let durations = step_ns(&[10]);
        let mut ctx = ShotContext::new("camera", Env::new(), lanes, &durations, TimeStep::from_nanos(1)).unwrap();
        let channels = vec![ChannelDeclaration {
            name: "shutter_out".to_string(),
            output: ChannelOutput::LaneRef { name: "shutter".to_string(), default: None },
        }];
        let out = compile_device_shot(&channels, &mut ctx, TimeStep::from_nanos(1), 0, 0).unwrap();
        assert_eq!(out["shutter_out"].len(), 10);
    }
}
