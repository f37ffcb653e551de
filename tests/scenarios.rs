//! End-to-end scenario tests for spec.md §8's S5 (advance); S1-S4 and S6
//! are covered by inline unit tests in their owning modules
//! (`lane.rs`, `expr.rs`, `channel_output.rs`, `shot.rs`).

use std::collections::HashMap;

use shot_compiler::channel_output::ChannelOutput;
use shot_compiler::expr::{Env, Expression};
use shot_compiler::instruction::Buffer;
use shot_compiler::shot::ShotContext;
use shot_compiler::timing::TimeStep;

fn step_ns(values: &[i64]) -> Vec<Expression> {
    values.iter().map(|n| Expression::parse(&format!("{n} ns")).unwrap()).collect()
}

#[test]
fn s5_advance_shifts_the_prepend_append_budget_not_the_values() {
    let delta = TimeStep::from_nanos(1);
    let durations = step_ns(&[5]);
    let mut ctx = ShotContext::new("source", Env::new(), HashMap::new(), &durations, delta).unwrap();

    let base = ChannelOutput::Constant(Expression::parse("1 V").unwrap());
    let advanced = ChannelOutput::Advance { input: Box::new(base.clone()), expr: Expression::parse("2 ns").unwrap() };

    let advanced_series = advanced.evaluate(delta, 3, 0, &mut ctx, "out").unwrap();
    assert_eq!(advanced_series.instruction.len(), 8);
    let Buffer::F64(advanced_values) = advanced_series.instruction.to_pattern() else { panic!() };
    assert!(advanced_values.iter().all(|&v| v == 1.0));

    let mut ctx2 = ShotContext::new("source", Env::new(), HashMap::new(), &durations, delta).unwrap();
    let plain_series = base.evaluate(delta, 1, 2, &mut ctx2, "out").unwrap();
    let Buffer::F64(plain_values) = plain_series.instruction.to_pattern() else { panic!() };
    assert_eq!(*advanced_values, *plain_values);
}
