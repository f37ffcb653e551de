//! Exact-rational time and tick arithmetic.
//!
//! `Time` and `TimeStep` are kept as exact rationals of seconds rather than
//! floats so that adjacent steps share a tick boundary without rounding
//! drift; only the final sample value (§4.D) touches floating point.

use num::rational::Ratio;
use num::ToPrimitive;
use std::fmt;
use std::ops::Sub;

use crate::error::TimingError;

/// An exact, non-negative duration in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Time(Ratio<i64>);

/// An exact, strictly-positive duration in seconds: the hardware quantum of
/// a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TimeStep(Ratio<i64>);

impl Time {
    pub const ZERO: Time = Time(Ratio::new_raw(0, 1));

    /// Constructs a `Time` from whole nanoseconds.
    pub fn from_nanos(nanos: i64) -> Time {
        Time(Ratio::new(nanos, 1_000_000_000))
    }

    pub fn seconds(self) -> Ratio<i64> {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(f64::NAN)
    }

    pub fn checked_sub(self, rhs: Time) -> Option<Time> {
        if self.0 >= rhs.0 {
            Some(Time(self.0 - rhs.0))
        } else {
            None
        }
    }
}

impl TimeStep {
    /// Constructs a `TimeStep` from whole nanoseconds; panics if non-positive
    /// — a zero or negative sequencer quantum is an invariant violation, not
    /// a recoverable user error.
    pub fn from_nanos(nanos: i64) -> TimeStep {
        assert!(nanos > 0, "TimeStep must be strictly positive, got {nanos} ns");
        TimeStep(Ratio::new(nanos, 1_000_000_000))
    }

    pub fn seconds(self) -> Ratio<i64> {
        self.0
    }
}

impl Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        self.checked_sub(rhs).expect("Time subtraction underflow: rhs is later than self")
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}s", self.to_f64())
    }
}

impl fmt::Display for TimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.9}s", self.0.to_f64().unwrap_or(f64::NAN))
    }
}

/// `start_tick(t, Δ) = ⌈t/Δ⌉`
pub fn start_tick(t: Time, step: TimeStep) -> i64 {
    ceil_div(t.0, step.0)
}

/// `stop_tick(t, Δ) = ⌈t/Δ⌉` — semantically the excluded tick one past the
/// last sample of a window ending at `t`; the formula is identical to
/// `start_tick`, only the interpretation differs at call sites.
pub fn stop_tick(t: Time, step: TimeStep) -> i64 {
    ceil_div(t.0, step.0)
}

/// `number_ticks(t0, t1, Δ) = stop_tick(t1, Δ) - start_tick(t0, Δ)`
pub fn number_ticks(t0: Time, t1: Time, step: TimeStep) -> u64 {
    let n = stop_tick(t1, step) - start_tick(t0, step);
    assert!(n >= 0, "number_ticks produced a negative count: {t0} .. {t1} at {step}");
    n as u64
}

fn ceil_div(value: Ratio<i64>, step: Ratio<i64>) -> i64 {
    let q = value / step;
    q.ceil().to_integer()
}

/// `step_bounds([d0..dn-1]) = [0, d0, d0+d1, .., sum di]`
pub fn step_bounds(durations: &[Time]) -> Vec<Time> {
    let mut bounds = Vec::with_capacity(durations.len() + 1);
    let mut acc = Ratio::new(0i64, 1);
    bounds.push(Time(acc));
    for d in durations {
        acc += d.0;
        bounds.push(Time(acc));
    }
    bounds
}

/// Evaluates a list of step-duration expressions against `env`, failing on
/// negative or non-time-dimensioned results.
///
/// The expression evaluator itself lives in [`crate::expr`]; this function
/// only validates the dimension/sign of each already-evaluated magnitude,
/// mirroring `evaluate_step_durations` in the lane-compiler family.
pub fn durations_from_seconds(values: &[f64]) -> Result<Vec<Time>, TimingError> {
    values
        .iter()
        .enumerate()
        .map(|(index, &seconds)| {
            if seconds < 0.0 {
                return Err(TimingError::NegativeDuration { index, seconds });
            }
            // f64 seconds -> exact rational via nanosecond rounding; the
            // sequencer's own tick grid is always coarser than a nanosecond
            // in every device config we compile for.
            let nanos = (seconds * 1e9).round() as i64;
            Ok(Time::from_nanos(nanos))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn start_stop_tick_share_boundary() {
        let step = TimeStep::from_nanos(1);
        let a = Time::from_nanos(10);
        assert_eq!(start_tick(a, step), 10);
        assert_eq!(stop_tick(a, step), 10);
    }

    #[test]
    fn number_ticks_adjacent_steps_no_gap() {
        let step = TimeStep::from_nanos(1);
        let t0 = Time::from_nanos(0);
        let t1 = Time::from_nanos(10);
        let t2 = Time::from_nanos(20);
        assert_eq!(number_ticks(t0, t1, step), 10);
        assert_eq!(number_ticks(t1, t2, step), 10);
        assert_eq!(number_ticks(t0, t2, step), 20);
    }

    #[test]
    fn step_bounds_cumulative() {
        let step = TimeStep::from_nanos(1);
        let durations = vec![Time::from_nanos(10), Time::from_nanos(5), Time::from_nanos(20)];
        let bounds = step_bounds(&durations);
        assert_eq!(bounds.len(), 4);
        assert_eq!(number_ticks(bounds[0], bounds[1], step), 10);
        assert_eq!(number_ticks(bounds[1], bounds[2], step), 5);
        assert_eq!(number_ticks(bounds[2], bounds[3], step), 20);
    }

    #[test]
    fn rejects_negative_duration() {
        let err = durations_from_seconds(&[1e-9, -1e-9]).unwrap_err();
        assert!(matches!(err, TimingError::NegativeDuration { index: 1, .. }));
    }
}
