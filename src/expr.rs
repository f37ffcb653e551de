//! Expression parsing and evaluation (component C): the grammar in §6.3,
//! a small recursive-descent parser, and three evaluation modes —
//! time-independent, time-dependent digital, time-dependent analog.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::EvaluationError;
use crate::instruction::{self, Buffer, Instruction};
use crate::timing::{self, Time, TimeStep};
use crate::units::{self, Quantity, Unit};

pub const TIME_VARIABLE: &str = "t";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Pos,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Number(f64, Option<String>),
    Ident(String),
    Unary(UnOp, Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

/// A parsed expression. Keeps the original source around for error
/// messages and for logging/serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Ast,
}

/// The value an expression evaluates to in a non-array context: either a
/// boolean (digital) or a numeric quantity (analog).
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    Number(Quantity),
}

pub type Env = HashMap<String, ScalarValue>;

impl Expression {
    pub fn parse(source: &str) -> Result<Expression, EvaluationError> {
        let tokens = tokenize(source).map_err(|cause| EvaluationError::Syntax {
            expression: source.to_string(),
            cause,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_expr().map_err(|cause| EvaluationError::Syntax {
            expression: source.to_string(),
            cause,
        })?;
        if parser.pos != parser.tokens.len() {
            return Err(EvaluationError::Syntax {
                expression: source.to_string(),
                cause: "trailing tokens after expression".to_string(),
            });
        }
        Ok(Expression { source: source.to_string(), ast })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The set of identifiers this expression reads, including `t` if
    /// present.
    pub fn upstream_variables(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        collect_idents(&self.ast, &mut names);
        names
    }

    pub fn is_time_independent(&self) -> bool {
        !self.upstream_variables().contains(TIME_VARIABLE)
    }

    /// Evaluates the expression against an environment where every
    /// identifier (including `t`, if bound) resolves to a scalar.
    pub fn evaluate_scalar(&self, env: &Env) -> Result<ScalarValue, EvaluationError> {
        eval_scalar(&self.ast, env, &self.source)
    }

    /// Evaluates a time-independent expression to a quantity, failing if
    /// the result is boolean.
    pub fn evaluate_quantity(&self, env: &Env) -> Result<Quantity, EvaluationError> {
        match self.evaluate_scalar(env)? {
            ScalarValue::Number(q) => Ok(q),
            ScalarValue::Bool(_) => Err(EvaluationError::NonAnalogValue { expression: self.source.clone() }),
        }
    }

    /// Evaluates a digital (boolean) expression over a sample window.
    /// Per §9's open question, any use of `t` in a digital expression is
    /// rejected today rather than sampled — extending to comparisons like
    /// `t > 5 ms` is future work.
    pub fn evaluate_digital_series(&self, env: &Env, length: u64) -> Result<Instruction, EvaluationError> {
        if self.upstream_variables().contains(TIME_VARIABLE) {
            return Err(EvaluationError::UnsupportedDigitalOperator {
                expression: self.source.clone(),
                op: "t".to_string(),
            });
        }
        let value = match eval_scalar(&self.ast, env, &self.source)? {
            ScalarValue::Bool(b) => b,
            ScalarValue::Number(_) => {
                return Err(EvaluationError::NonBooleanValue { expression: self.source.clone() })
            }
        };
        let buf = Buffer::Bool(Rc::new(vec![value; length as usize]));
        Ok(instruction::pattern(buf))
    }

    /// Evaluates an analog expression over a sample window `[t0, t1)` at
    /// step `delta`, binding `t` to a shifted ramp (relative to `t0`).
    /// Returns an instruction in base units together with the result
    /// dimension.
    pub fn evaluate_analog_series(
        &self,
        env: &Env,
        t0: Time,
        t1: Time,
        delta: TimeStep,
    ) -> Result<(Instruction, Unit), EvaluationError> {
        let length = timing::number_ticks(t0, t1, delta);
        if self.is_time_independent() {
            let q = self.evaluate_quantity(env)?;
            let buf = Buffer::F64(Rc::new(vec![q.magnitude; length.max(1) as usize]));
            let instr = if length == 0 {
                instruction::empty_like(&crate::instruction::Dtype::F64)
            } else {
                instruction::pattern(buf)
            };
            return Ok((instr, q.unit));
        }
        let series = eval_series(&self.ast, env, t0, t1, delta, &self.source)?;
        let (instr, unit) = series.into_instruction();
        if instr.len() != length {
            return Err(EvaluationError::LengthMismatch {
                expression: self.source.clone(),
                expected: length as usize,
                found: instr.len() as usize,
            });
        }
        Ok((instr, unit))
    }
}

fn collect_idents(ast: &Ast, out: &mut HashSet<String>) {
    match ast {
        Ast::Number(..) => {}
        Ast::Ident(name) => {
            out.insert(name.clone());
        }
        Ast::Unary(_, a) => collect_idents(a, out),
        Ast::Binary(_, a, b) => {
            collect_idents(a, out);
            collect_idents(b, out);
        }
        Ast::Call(_, args) => args.iter().for_each(|a| collect_idents(a, out)),
    }
}

fn eval_scalar(ast: &Ast, env: &Env, source: &str) -> Result<ScalarValue, EvaluationError> {
    match ast {
        Ast::Number(mag, unit) => {
            let symbol = unit.as_deref().unwrap_or("");
            let q = Quantity::from_literal(*mag, symbol).ok_or_else(|| EvaluationError::UnitMismatch {
                expression: source.to_string(),
                expected: "known unit".to_string(),
                found: Unit::DIMENSIONLESS,
            })?;
            Ok(ScalarValue::Number(q))
        }
        Ast::Ident(name) => env.get(name).cloned().ok_or_else(|| EvaluationError::UndefinedSymbol {
            expression: source.to_string(),
            name: name.clone(),
        }),
        Ast::Unary(op, a) => {
            let v = eval_scalar(a, env, source)?;
            apply_unary_scalar(*op, v, source)
        }
        Ast::Binary(op, a, b) => {
            let va = eval_scalar(a, env, source)?;
            let vb = eval_scalar(b, env, source)?;
            apply_binary_scalar(*op, va, vb, source)
        }
        Ast::Call(name, args) => {
            let values: Result<Vec<Quantity>, EvaluationError> = args
                .iter()
                .map(|a| match eval_scalar(a, env, source)? {
                    ScalarValue::Number(q) => Ok(q),
                    ScalarValue::Bool(_) => Err(EvaluationError::NonAnalogValue { expression: source.to_string() }),
                })
                .collect();
            let result = call_builtin(name, &values?, source)?;
            Ok(ScalarValue::Number(result))
        }
    }
}

fn apply_unary_scalar(op: UnOp, v: ScalarValue, source: &str) -> Result<ScalarValue, EvaluationError> {
    match (op, v) {
        (UnOp::Pos, v) => Ok(v),
        (UnOp::Neg, ScalarValue::Number(q)) => Ok(ScalarValue::Number(-q)),
        (UnOp::Neg, ScalarValue::Bool(_)) => {
            Err(EvaluationError::NonAnalogValue { expression: source.to_string() })
        }
    }
}

fn apply_binary_scalar(op: BinOp, a: ScalarValue, b: ScalarValue, source: &str) -> Result<ScalarValue, EvaluationError> {
    let (a, b) = match (a, b) {
        (ScalarValue::Number(a), ScalarValue::Number(b)) => (a, b),
        _ => return Err(EvaluationError::NonAnalogValue { expression: source.to_string() }),
    };
    let result = match op {
        BinOp::Add => (a + b).ok_or_else(|| unit_mismatch(source, a.unit, b.unit))?,
        BinOp::Sub => (a - b).ok_or_else(|| unit_mismatch(source, a.unit, b.unit))?,
        BinOp::Mul => Quantity { magnitude: a.magnitude * b.magnitude, unit: combine_mul(a.unit, b.unit) },
        BinOp::Div => {
            if b.magnitude == 0.0 {
                return Err(EvaluationError::DivisionByZero { expression: source.to_string() });
            }
            Quantity { magnitude: a.magnitude / b.magnitude, unit: combine_div(a.unit, b.unit) }
        }
        BinOp::Pow => Quantity { magnitude: a.magnitude.powf(b.magnitude), unit: Unit::DIMENSIONLESS },
    };
    Ok(ScalarValue::Number(result))
}

fn unit_mismatch(source: &str, expected: Unit, found: Unit) -> EvaluationError {
    EvaluationError::UnitMismatch {
        expression: source.to_string(),
        expected: expected.to_string(),
        found,
    }
}

/// This crate's unit system does not track full dimensional analysis for
/// products/quotients (only a closed set of base dimensions, §4.I); a
/// product/quotient of two dimensioned quantities that both participate in
/// time-dependent arithmetic is always immediately consumed (divided back
/// to dimensionless or seconds) by the caller, so it is enough to keep the
/// more "interesting" operand's dimension and fall back to dimensionless
/// otherwise.
fn combine_mul(a: Unit, b: Unit) -> Unit {
    if a.dimension == units::Dimension::Dimensionless {
        b
    } else {
        a
    }
}

fn combine_div(a: Unit, b: Unit) -> Unit {
    if b.dimension == units::Dimension::Dimensionless {
        a
    } else if a.dimension == b.dimension {
        Unit::DIMENSIONLESS
    } else {
        a
    }
}

fn call_builtin(name: &str, args: &[Quantity], source: &str) -> Result<Quantity, EvaluationError> {
    let unary = |f: fn(f64) -> f64| -> Result<Quantity, EvaluationError> {
        if args.len() != 1 {
            return Err(EvaluationError::ArityMismatch {
                expression: source.to_string(),
                name: name.to_string(),
                expected: 1,
                found: args.len(),
            });
        }
        Ok(Quantity::dimensionless(f(args[0].magnitude)))
    };
    match name {
        "abs" => unary(f64::abs),
        "sqrt" => unary(f64::sqrt),
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "exp" => unary(f64::exp),
        "min" | "max" => {
            if args.len() != 2 {
                return Err(EvaluationError::ArityMismatch {
                    expression: source.to_string(),
                    name: name.to_string(),
                    expected: 2,
                    found: args.len(),
                });
            }
            let m = if name == "min" { args[0].magnitude.min(args[1].magnitude) } else { args[0].magnitude.max(args[1].magnitude) };
            Ok(Quantity { magnitude: m, unit: args[0].unit })
        }
        _ => Err(EvaluationError::UnknownFunction { expression: source.to_string(), name: name.to_string() }),
    }
}

/// An intermediate analog evaluation result: either a still-scalar
/// quantity (a sub-expression that happened not to touch `t`) or a
/// time-dependent series carried with its unit.
enum Series {
    Scalar(Quantity),
    Values(Instruction, Unit),
}

impl Series {
    fn into_instruction(self) -> (Instruction, Unit) {
        match self {
            Series::Values(instr, unit) => (instr, unit),
            Series::Scalar(_) => unreachable!("top-level analog series must depend on t"),
        }
    }

}

fn eval_series(ast: &Ast, env: &Env, t0: Time, t1: Time, delta: TimeStep, source: &str) -> Result<Series, EvaluationError> {
    match ast {
        Ast::Ident(name) if name == TIME_VARIABLE => {
            let length = timing::number_ticks(t0, t1, delta);
            let start = 0.0;
            let stop = (t1.to_f64() - t0.to_f64()).max(0.0);
            let instr = instruction::ramp(
                Buffer::F64(Rc::new(vec![start])),
                Buffer::F64(Rc::new(vec![stop])),
                length,
            );
            Ok(Series::Values(instr, Unit::SECOND))
        }
        Ast::Number(..) | Ast::Ident(_) => {
            let scalar = eval_scalar(ast, env, source)?;
            match scalar {
                ScalarValue::Number(q) => Ok(Series::Scalar(q)),
                ScalarValue::Bool(_) => Err(EvaluationError::NonAnalogValue { expression: source.to_string() }),
            }
        }
        Ast::Unary(op, a) => {
            let va = eval_series(a, env, t0, t1, delta, source)?;
            match (op, va) {
                (UnOp::Pos, v) => Ok(v),
                (UnOp::Neg, Series::Scalar(q)) => Ok(Series::Scalar(-q)),
                (UnOp::Neg, Series::Values(instr, unit)) => Ok(Series::Values(negate_series(&instr), unit)),
            }
        }
        Ast::Binary(op, a, b) => {
            let va = eval_series(a, env, t0, t1, delta, source)?;
            let vb = eval_series(b, env, t0, t1, delta, source)?;
            eval_series_binary(*op, va, vb, source)
        }
        Ast::Call(name, args) => {
            // Builtins operate on already-materialised series, sample by
            // sample; any argument that is still a bare scalar is broadcast.
            let evaluated: Result<Vec<Series>, EvaluationError> =
                args.iter().map(|a| eval_series(a, env, t0, t1, delta, source)).collect();
            let evaluated = evaluated?;
            if evaluated.iter().all(|s| matches!(s, Series::Scalar(_))) {
                let scalars: Vec<Quantity> = evaluated
                    .into_iter()
                    .map(|s| match s {
                        Series::Scalar(q) => q,
                        Series::Values(..) => unreachable!(),
                    })
                    .collect();
                return Ok(Series::Scalar(call_builtin(name, &scalars, source)?));
            }
            let length = timing::number_ticks(t0, t1, delta);
            let arrays: Vec<Vec<f64>> = evaluated
                .iter()
                .map(|s| match s {
                    Series::Scalar(q) => vec![q.magnitude; length as usize],
                    Series::Values(instr, _) => match instr.to_pattern() {
                        Buffer::F64(v) => v.to_vec(),
                        _ => panic!("analog series must be float-valued"),
                    },
                })
                .collect();
            let op = unary_builtin_fn(name, source)?;
            let out: Vec<f64> = (0..length as usize)
                .map(|i| op(arrays.iter().map(|a| a[i]).collect()))
                .collect();
            Ok(Series::Values(instruction::pattern(Buffer::F64(Rc::new(out))), Unit::DIMENSIONLESS))
        }
    }
}

fn unary_builtin_fn(name: &str, source: &str) -> Result<fn(Vec<f64>) -> f64, EvaluationError> {
    match name {
        "abs" => Ok(|v| v[0].abs()),
        "sqrt" => Ok(|v| v[0].sqrt()),
        "sin" => Ok(|v| v[0].sin()),
        "cos" => Ok(|v| v[0].cos()),
        "exp" => Ok(|v| v[0].exp()),
        "min" => Ok(|v| v[0].min(v[1])),
        "max" => Ok(|v| v[0].max(v[1])),
        _ => Err(EvaluationError::UnknownFunction { expression: source.to_string(), name: name.to_string() }),
    }
}

fn negate_series(instr: &Instruction) -> Instruction {
    instr.apply(&|x| -x)
}

fn eval_series_binary(op: BinOp, a: Series, b: Series, source: &str) -> Result<Series, EvaluationError> {
    match (a, b) {
        (Series::Scalar(a), Series::Scalar(b)) => {
            Ok(Series::Scalar(match apply_binary_scalar(op, ScalarValue::Number(a), ScalarValue::Number(b), source)? {
                ScalarValue::Number(q) => q,
                ScalarValue::Bool(_) => unreachable!(),
            }))
        }
        (Series::Scalar(s), Series::Values(instr, unit))
            if matches!(op, BinOp::Mul | BinOp::Div | BinOp::Add | BinOp::Sub) =>
        {
            scale_series(op, s, instr, unit, source, true)
        }
        (Series::Values(instr, unit), Series::Scalar(s))
            if matches!(op, BinOp::Mul | BinOp::Div | BinOp::Add | BinOp::Sub) =>
        {
            scale_series(op, s, instr, unit, source, false)
        }
        (Series::Values(ia, ua), Series::Values(ib, ub)) => {
            combine_two_series(op, ia, ua, ib, ub, source)
        }
        _ => Err(EvaluationError::UnsupportedDigitalOperator {
            expression: source.to_string(),
            op: format!("{op:?}"),
        }),
    }
}

/// A scalar combined with a time-dependent series never changes the
/// series's structural shape (it is a pure per-sample affine
/// transformation), so `Ramp`/`Concatenated`/`Repeated` are all pushed
/// through via [`Instruction::apply`] rather than flattened up front.
fn scale_series(
    op: BinOp,
    scalar: Quantity,
    instr: Instruction,
    unit: Unit,
    source: &str,
    scalar_is_lhs: bool,
) -> Result<Series, EvaluationError> {
    let m = scalar.magnitude;
    let (f, out_unit): (Box<dyn Fn(f64) -> f64>, Unit) = match op {
        BinOp::Add => (Box::new(move |x| x + m), unit),
        BinOp::Sub if scalar_is_lhs => (Box::new(move |x| m - x), unit),
        BinOp::Sub => (Box::new(move |x| x - m), unit),
        BinOp::Mul => (Box::new(move |x| x * m), combine_mul(scalar.unit, unit)),
        BinOp::Div if scalar_is_lhs => (Box::new(move |x| m / x), combine_div(scalar.unit, unit)),
        BinOp::Div => {
            if m == 0.0 {
                return Err(EvaluationError::DivisionByZero { expression: source.to_string() });
            }
            (Box::new(move |x| x / m), combine_div(unit, scalar.unit))
        }
        BinOp::Pow => {
            return Err(EvaluationError::UnsupportedDigitalOperator { expression: source.to_string(), op: "^".to_string() })
        }
    };
    Ok(Series::Values(instr.apply(&*f), out_unit))
}

/// Combines two time-dependent series of equal length. Two `Ramp`s
/// combined with `+`/`-` (always affine) or `*`/`/` when one side has zero
/// slope (still affine) stay a `Ramp`; every other combination flattens to
/// a dense `Pattern`, per §4.C.
fn combine_two_series(op: BinOp, a: Instruction, ua: Unit, b: Instruction, ub: Unit, source: &str) -> Result<Series, EvaluationError> {
    if a.len() != b.len() {
        return Err(EvaluationError::LengthMismatch {
            expression: source.to_string(),
            expected: a.len() as usize,
            found: b.len() as usize,
        });
    }
    let out_unit = match op {
        BinOp::Mul => combine_mul(ua, ub),
        BinOp::Div => combine_div(ua, ub),
        _ => ua,
    };
    if let (Instruction::Ramp(ra), Instruction::Ramp(rb)) = (&a, &b) {
        if let (Buffer::F64(sa), Buffer::F64(ea), Buffer::F64(sb), Buffer::F64(eb)) =
            (&ra.start, &ra.stop, &rb.start, &rb.stop)
        {
            let (sa, ea, sb, eb) = (sa[0], ea[0], sb[0], eb[0]);
            let len = ra.length;
            match op {
                BinOp::Add => return Ok(Series::Values(instruction::ramp(f64_buf(sa + sb), f64_buf(ea + eb), len), out_unit)),
                BinOp::Sub => return Ok(Series::Values(instruction::ramp(f64_buf(sa - sb), f64_buf(ea - eb), len), out_unit)),
                BinOp::Mul if sa == ea => {
                    return Ok(Series::Values(instruction::ramp(f64_buf(sa * sb), f64_buf(sa * eb), len), out_unit))
                }
                BinOp::Mul if sb == eb => {
                    return Ok(Series::Values(instruction::ramp(f64_buf(sa * sb), f64_buf(ea * sb), len), out_unit))
                }
                BinOp::Div if sb == eb && sb != 0.0 => {
                    return Ok(Series::Values(instruction::ramp(f64_buf(sa / sb), f64_buf(ea / sb), len), out_unit))
                }
                _ => {}
            }
        }
    }
    let Buffer::F64(va) = a.to_pattern() else { panic!("analog series must be float-valued") };
    let Buffer::F64(vb) = b.to_pattern() else { panic!("analog series must be float-valued") };
    let out: Vec<f64> = va
        .iter()
        .zip(vb.iter())
        .map(|(&x, &y)| match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Pow => x.powf(y),
        })
        .collect();
    Ok(Series::Values(instruction::pattern(Buffer::F64(Rc::new(out))), out_unit))
}

fn f64_buf(x: f64) -> Buffer {
    Buffer::F64(Rc::new(vec![x]))
}

// --- tokenizer & recursive-descent parser (§6.3) ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64, Option<String>),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    i += 1;
                    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                        i += 1;
                    }
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let number: String = chars[start..i].iter().collect();
                let value: f64 = number.parse().map_err(|_| format!("invalid number literal `{number}`"))?;
                let unit_start = i;
                while i < chars.len() && (chars[i].is_alphabetic() || chars[i] == '\u{00b5}' || chars[i] == '\u{00b0}') {
                    i += 1;
                }
                let unit: Option<String> = if i > unit_start {
                    Some(chars[unit_start..i].iter().collect())
                } else {
                    None
                };
                tokens.push(Token::Number(value, unit));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> Result<Ast, String> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.advance();
                    left = Ast::Binary(BinOp::Add, Box::new(left), Box::new(self.parse_term()?));
                }
                Some(Token::Minus) => {
                    self.advance();
                    left = Ast::Binary(BinOp::Sub, Box::new(left), Box::new(self.parse_term()?));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Ast, String> {
        let mut left = self.parse_factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.advance();
                    left = Ast::Binary(BinOp::Mul, Box::new(left), Box::new(self.parse_factor()?));
                }
                Some(Token::Slash) => {
                    self.advance();
                    left = Ast::Binary(BinOp::Div, Box::new(left), Box::new(self.parse_factor()?));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Ast, String> {
        match self.peek() {
            Some(Token::Plus) => {
                self.advance();
                Ok(Ast::Unary(UnOp::Pos, Box::new(self.parse_power()?)))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Ast::Unary(UnOp::Neg, Box::new(self.parse_power()?)))
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Ast, String> {
        let base = self.parse_atom()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.advance();
            let exp = self.parse_factor()?;
            Ok(Ast::Binary(BinOp::Pow, Box::new(base), Box::new(exp)))
        } else {
            Ok(base)
        }
    }

    fn parse_atom(&mut self) -> Result<Ast, String> {
        match self.advance() {
            Some(Token::Number(v, unit)) => Ok(Ast::Number(v, unit)),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        args.push(self.parse_expr()?);
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.advance();
                            args.push(self.parse_expr()?);
                        }
                    }
                    match self.advance() {
                        Some(Token::RParen) => {}
                        _ => return Err("expected `)` after call arguments".to_string()),
                    }
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected `)`".to_string()),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn env_with(pairs: &[(&str, ScalarValue)]) -> Env {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn parses_and_evaluates_arithmetic() {
        let e = Expression::parse("1 + 2 * 3").unwrap();
        let v = e.evaluate_quantity(&Env::new()).unwrap();
        assert_eq!(v.magnitude, 7.0);
    }

    #[test]
    fn literal_units_scale_to_base() {
        let e = Expression::parse("10 ns").unwrap();
        let v = e.evaluate_quantity(&Env::new()).unwrap();
        assert!((v.magnitude - 10e-9).abs() < 1e-18);
    }

    #[test]
    fn undefined_symbol_errors() {
        let e = Expression::parse("missing").unwrap();
        assert!(matches!(e.evaluate_quantity(&Env::new()), Err(EvaluationError::UndefinedSymbol { .. })));
    }

    #[test]
    fn s3_time_expression_samples() {
        // "t / (10 ns) * 1 Hz" over one 10 ns step at 1 ns resolution
        let e = Expression::parse("t / (10 ns) * 1 Hz").unwrap();
        let (instr, _unit) = e
            .evaluate_analog_series(&Env::new(), Time::from_nanos(0), Time::from_nanos(10), TimeStep::from_nanos(1))
            .unwrap();
        let Buffer::F64(samples) = instr.to_pattern() else { panic!() };
        assert_eq!(samples.len(), 10);
        for (i, s) in samples.iter().enumerate() {
            assert!((s - (i as f64) * 0.1).abs() < 1e-9, "sample {i} = {s}");
        }
    }

    #[test]
    fn digital_rejects_time_dependence() {
        let e = Expression::parse("t").unwrap();
        assert!(matches!(
            e.evaluate_digital_series(&Env::new(), 10),
            Err(EvaluationError::UnsupportedDigitalOperator { .. })
        ));
    }

    #[test]
    fn upstream_variables_finds_t() {
        let e = Expression::parse("sin(t) + offset").unwrap();
        let names = e.upstream_variables();
        assert!(names.contains("t"));
        assert!(names.contains("offset"));
    }

    #[test]
    fn division_by_zero_errors() {
        let e = Expression::parse("1 / 0").unwrap();
        assert!(matches!(e.evaluate_quantity(&Env::new()), Err(EvaluationError::DivisionByZero { .. })));
        let _ = env_with(&[]);
    }
}
