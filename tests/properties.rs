//! Property-based tests for the instruction algebra (spec.md §8,
//! properties 1-4, 6). `proptest` is a dev-dependency only, mirroring how
//! the teacher keeps its own reference-vs-implementation checks out of
//! the library build.

use proptest::prelude::*;
use shot_compiler::instruction::{self, Buffer};

fn f64_pattern(vals: Vec<f64>) -> shot_compiler::Instruction {
    instruction::pattern(Buffer::F64(std::rc::Rc::new(vals)))
}

fn bool_pattern(vals: Vec<bool>) -> shot_compiler::Instruction {
    instruction::pattern(Buffer::Bool(std::rc::Rc::new(vals)))
}

fn f64_samples(instr: &shot_compiler::Instruction) -> Vec<f64> {
    match instr.to_pattern() {
        Buffer::F64(v) => (*v).clone(),
        _ => panic!("expected an F64 buffer"),
    }
}

fn bool_samples(instr: &shot_compiler::Instruction) -> Vec<bool> {
    match instr.to_pattern() {
        Buffer::Bool(v) => (*v).clone(),
        _ => panic!("expected a Bool buffer"),
    }
}

proptest! {
    // Property 1: len(x.to_pattern()) == len(x).
    #[test]
    fn length_matches_flatten(vals in proptest::collection::vec(-1.0e6f64..1.0e6f64, 0..32)) {
        let x = f64_pattern(vals);
        prop_assert_eq!(x.len() as usize, f64_samples(&x).len());
    }

    // Property 2: x.slice(0, len(x)).to_pattern() == x.to_pattern(), and
    // x.slice(a, b).to_pattern() == x.to_pattern()[a..b].
    #[test]
    fn slice_matches_flatten_slice(
        vals in proptest::collection::vec(-1.0e6f64..1.0e6f64, 1..32),
        a_raw in 0usize..32,
        b_raw in 0usize..32,
    ) {
        let n = vals.len();
        let x = f64_pattern(vals.clone());
        let full = x.slice(0, x.len()).unwrap();
        prop_assert_eq!(f64_samples(&full), vals.clone());

        let a = a_raw.min(n);
        let b = b_raw.min(n).max(a);
        let sliced = x.slice(a as u64, b as u64).unwrap();
        prop_assert_eq!(f64_samples(&sliced), vals[a..b].to_vec());
    }

    // Property 3: concat is associative under flattening.
    #[test]
    fn concat_associative_on_flatten(
        a in proptest::collection::vec(-1.0e6f64..1.0e6f64, 1..8),
        b in proptest::collection::vec(-1.0e6f64..1.0e6f64, 1..8),
        c in proptest::collection::vec(-1.0e6f64..1.0e6f64, 1..8),
    ) {
        let (xa, xb, xc) = (f64_pattern(a), f64_pattern(b), f64_pattern(c));
        let left = instruction::concat(vec![xa.clone(), instruction::concat(vec![xb.clone(), xc.clone()]).unwrap()]).unwrap();
        let right = instruction::concat(vec![instruction::concat(vec![xa, xb]).unwrap(), xc]).unwrap();
        prop_assert_eq!(f64_samples(&left), f64_samples(&right));
    }

    // Property 4: repeat(repeat(x, m), n) == repeat(x, m*n) under flattening.
    #[test]
    fn repeat_collapse(
        vals in proptest::collection::vec(-1.0e6f64..1.0e6f64, 1..6),
        m in 1u64..5,
        n in 1u64..5,
    ) {
        let x = f64_pattern(vals);
        let nested = instruction::repeat(instruction::repeat(x.clone(), m).unwrap(), n).unwrap();
        let flat = instruction::repeat(x, m * n).unwrap();
        prop_assert_eq!(f64_samples(&nested), f64_samples(&flat));
    }

    // Property 6: broaden_left(x, w).to_pattern()[i] == OR x.to_pattern()[i..min(i+w+1, len)].
    #[test]
    fn broaden_left_matches_brute_force_or(
        vals in proptest::collection::vec(any::<bool>(), 1..24),
        width in 0u64..6,
    ) {
        let x = bool_pattern(vals.clone());
        let (broadened, _bleed) = shot_compiler::channel_output::broaden_left(&x, width);
        let got = bool_samples(&broadened);
        let n = vals.len();
        let expected: Vec<bool> = (0..n)
            .map(|i| {
                let hi = (i as u64 + width + 1).min(n as u64) as usize;
                vals[i..hi].iter().any(|&v| v)
            })
            .collect();
        prop_assert_eq!(got, expected);
    }
}
