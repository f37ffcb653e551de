//! Error taxonomy for the instruction algebra and shot compiler.
//!
//! Invariant violations (malformed trees, dtype mismatches at construction,
//! out-of-range slices) are programmer bugs and propagate as panics, never
//! as a `Result` variant here — see the smart constructors in
//! [`crate::instruction`]. Everything in this module is a *recoverable*
//! error: something a caller fed us that we can name and hand back.

use thiserror::Error;

use crate::units::Unit;

/// Failures evaluating step durations or converting times to ticks.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimingError {
    #[error("step duration at index {index} evaluates to a negative time ({seconds} s)")]
    NegativeDuration { index: usize, seconds: f64 },
    #[error("step duration at index {index} is not dimensioned as a time: {cause}")]
    NotATime { index: usize, cause: String },
}

/// Failures evaluating an expression AST against an environment.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("in `{expression}`: undefined symbol `{name}`")]
    UndefinedSymbol { expression: String, name: String },
    #[error("in `{expression}`: expected unit compatible with {expected}, found {found}")]
    UnitMismatch {
        expression: String,
        expected: String,
        found: Unit,
    },
    #[error("in `{expression}`: expected an analog (numeric) value, found a boolean")]
    NonAnalogValue { expression: String },
    #[error("in `{expression}`: expected a boolean value in a digital context")]
    NonBooleanValue { expression: String },
    #[error("in `{expression}`: division by zero")]
    DivisionByZero { expression: String },
    #[error("in `{expression}`: unknown function `{name}`")]
    UnknownFunction { expression: String, name: String },
    #[error("in `{expression}`: `{name}` expects {expected} argument(s), got {found}")]
    ArityMismatch {
        expression: String,
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("could not parse `{expression}`: {cause}")]
    Syntax { expression: String, cause: String },
    #[error(
        "expression `{expression}` evaluates to an array of length {found} \
         while the expected length is {expected}"
    )]
    LengthMismatch {
        expression: String,
        expected: usize,
        found: usize,
    },
    #[error("time-dependent digital expression `{expression}` uses unsupported operator {op}")]
    UnsupportedDigitalOperator { expression: String, op: String },
}

/// Failures raised by a [`crate::shot::DeviceCompiler`] implementation.
#[derive(Debug, Error)]
pub enum DeviceCompileError {
    #[error("device `{device}` failed to compile: {cause}")]
    Failed { device: String, cause: String },
}

/// Errors that can escape the shot-compiler facade.
#[derive(Debug, Error)]
pub enum ShotCompileError {
    #[error("lane `{lane}` is required but was never consumed by any channel output")]
    UnusedLane { lane: String },
    #[error("channel output references lane `{lane}`, which this device never declared")]
    UnknownLane { lane: String },
    #[error("channel `{device}.{channel}`: {source}")]
    Evaluation {
        device: String,
        channel: String,
        #[source]
        source: EvaluationError,
    },
    #[error("device `{device}` compile error: {source}")]
    Device {
        device: String,
        #[source]
        source: DeviceCompileError,
    },
    #[error("invalid step durations: {source}")]
    Timing {
        #[source]
        source: TimingError,
    },
    #[error("negative advance/delay on channel `{channel}`: requested {requested} ticks, budget {budget}")]
    NegativeShift {
        channel: String,
        requested: i64,
        budget: u64,
    },
}

/// Failures of the shot worker pool / ordering orchestrator.
///
/// Retry policy lives only here (§5 / §7): the allow-list names causes that
/// are safe to retry with backoff; anything else is surfaced immediately.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("shot {index} worker crashed on attempt {attempt}: {cause}")]
    WorkerCrashed {
        index: u64,
        attempt: u32,
        cause: String,
    },
    #[error("shot {index} exhausted {attempts} retries: {last_cause}")]
    RetriesExhausted {
        index: u64,
        attempts: u32,
        last_cause: String,
    },
}

impl ResourceError {
    /// Causes considered transient and safe to retry with backoff.
    const RETRYABLE_CAUSES: &'static [&'static str] = &["timeout", "channel closed", "allocation"];

    pub fn is_retryable(&self) -> bool {
        match self {
            ResourceError::WorkerCrashed { cause, .. } => Self::RETRYABLE_CAUSES
                .iter()
                .any(|allowed| cause.contains(allowed)),
            ResourceError::RetriesExhausted { .. } => false,
        }
    }
}
