//! Scalar expression trees for constitutive laws.
//!
//! This module defines the scalar expressions a [`crate::law::CompiledLaw`] is written in.
//! An expression refers to the components of the law's operands by variable index and can be:
//! - Symbolically differentiated with respect to any variable
//! - Simplified using algebraic rules that are exact for every real input
//! - Evaluated directly (interpreted backend)
//! - Compiled to machine code with Cranelift (JIT backend)
//!
//! Supported operations include:
//! - Basic arithmetic (+, -, *, /) and negation
//! - Absolute value
//! - Integer and floating point exponentiation
//! - Transcendental functions (exp, ln, sqrt, sin, cos)

use std::collections::HashMap;

use cranelift::prelude::*;
use cranelift_codegen::ir::{immediates::Offset32, FuncRef};

/// Reference to a variable: its name and its position in the input array.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub index: u32,
}

/// An expression tree node representing mathematical operations.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A reference to a variable
    Var(VarRef),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Sine of an expression (argument in radians)
    Sin(Box<Expr>),
    /// Cosine of an expression (argument in radians)
    Cos(Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

/// Host math functions imported into a function under construction.
pub(crate) struct MathImports {
    pub exp: FuncRef,
    pub ln: FuncRef,
    pub sin: FuncRef,
    pub cos: FuncRef,
    pub powf: FuncRef,
}

/// Per-function code generation state: the input pointer, imported math functions and the
/// variables already loaded in the entry block.
pub(crate) struct CodegenContext {
    pub input_ptr: Value,
    pub imports: MathImports,
    pub loaded: HashMap<u32, Value>,
}

fn boxed(e: Expr) -> Box<Expr> {
    Box::new(e)
}

impl Expr {
    pub fn var(name: &str, index: u32) -> Self {
        Expr::Var(VarRef {
            name: name.to_string(),
            index,
        })
    }

    /// Computes the symbolic derivative of this expression with respect to a variable.
    ///
    /// Recursively applies the rules of differentiation:
    /// - d/dx(c) = 0, d/dx(x) = 1, d/dx(y) = 0
    /// - Sum, product and quotient rules
    /// - Chain rule for abs, powers, exp, ln, sqrt, sin and cos
    ///
    /// The result is not simplified.
    pub fn derivative(&self, with_respect_to: &str) -> Box<Expr> {
        let d = |e: &Expr| e.derivative(with_respect_to);
        match self {
            Expr::Const(_) => boxed(Expr::Const(0.0)),
            Expr::Var(var_ref) => boxed(Expr::Const(if var_ref.name == with_respect_to {
                1.0
            } else {
                0.0
            })),
            Expr::Add(left, right) => boxed(Expr::Add(d(left), d(right))),
            Expr::Sub(left, right) => boxed(Expr::Sub(d(left), d(right))),
            // d/dx(f * g) = f * dg/dx + g * df/dx
            Expr::Mul(left, right) => boxed(Expr::Add(
                boxed(Expr::Mul(left.clone(), d(right))),
                boxed(Expr::Mul(right.clone(), d(left))),
            )),
            // d/dx(f/g) = (g * df/dx - f * dg/dx) / g^2
            Expr::Div(left, right) => boxed(Expr::Div(
                boxed(Expr::Sub(
                    boxed(Expr::Mul(right.clone(), d(left))),
                    boxed(Expr::Mul(left.clone(), d(right))),
                )),
                boxed(Expr::Pow(right.clone(), 2)),
            )),
            // d/dx|f| = f/|f| * df/dx
            Expr::Abs(expr) => boxed(Expr::Mul(
                boxed(Expr::Div(expr.clone(), boxed(Expr::Abs(expr.clone())))),
                d(expr),
            )),
            Expr::Pow(base, exp) => boxed(Expr::Mul(
                boxed(Expr::Mul(
                    boxed(Expr::Const(*exp as f64)),
                    boxed(Expr::Pow(base.clone(), exp - 1)),
                )),
                d(base),
            )),
            Expr::PowFloat(base, exp) => boxed(Expr::Mul(
                boxed(Expr::Mul(
                    boxed(Expr::Const(*exp)),
                    boxed(Expr::PowFloat(base.clone(), exp - 1.0)),
                )),
                d(base),
            )),
            Expr::Exp(expr) => boxed(Expr::Mul(boxed(Expr::Exp(expr.clone())), d(expr))),
            Expr::Ln(expr) => boxed(Expr::Div(d(expr), expr.clone())),
            // d/dx(sqrt(f)) = df/dx / (2*sqrt(f))
            Expr::Sqrt(expr) => boxed(Expr::Div(
                d(expr),
                boxed(Expr::Mul(
                    boxed(Expr::Const(2.0)),
                    boxed(Expr::Sqrt(expr.clone())),
                )),
            )),
            Expr::Sin(expr) => boxed(Expr::Mul(boxed(Expr::Cos(expr.clone())), d(expr))),
            Expr::Cos(expr) => boxed(Expr::Mul(
                boxed(Expr::Neg(boxed(Expr::Sin(expr.clone())))),
                d(expr),
            )),
            Expr::Neg(expr) => boxed(Expr::Neg(d(expr))),
        }
    }

    /// Simplifies the expression by folding constants and applying identity rules.
    ///
    /// Only rewrites that hold for every real input are applied, so a simplified
    /// expression evaluates to exactly the same IEEE value class (finite, infinite, NaN)
    /// wherever the original is finite:
    /// - Constant folding: 2 + 3 → 5
    /// - Identities: x + 0 → x, x * 1 → x, x / 1 → x, x - 0 → x
    /// - Annihilation by zero: x * 0 → 0, 0 / x → 0
    /// - Exponents: x^0 → 1, x^1 → x, (x^a)^b → x^(a*b) for integer a, b
    /// - Double negation: -(-x) → x, negated constants
    pub fn simplify(&self) -> Box<Expr> {
        match self {
            Expr::Const(_) | Expr::Var(_) => boxed(self.clone()),

            Expr::Add(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => boxed(Expr::Const(a + b)),
                    (expr, Expr::Const(c)) | (Expr::Const(c), expr) if *c == 0.0 => {
                        boxed(expr.clone())
                    }
                    (expr, Expr::Neg(inner)) => boxed(Expr::Sub(boxed(expr.clone()), inner.clone())),
                    _ => boxed(Expr::Add(l, r)),
                }
            }

            Expr::Sub(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => boxed(Expr::Const(a - b)),
                    (expr, Expr::Const(c)) if *c == 0.0 => boxed(expr.clone()),
                    (Expr::Const(c), expr) if *c == 0.0 => boxed(Expr::Neg(boxed(expr.clone()))),
                    (expr, Expr::Neg(inner)) => boxed(Expr::Add(boxed(expr.clone()), inner.clone())),
                    _ => boxed(Expr::Sub(l, r)),
                }
            }

            Expr::Mul(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) => boxed(Expr::Const(a * b)),
                    (_, Expr::Const(c)) | (Expr::Const(c), _) if *c == 0.0 => {
                        boxed(Expr::Const(0.0))
                    }
                    (expr, Expr::Const(c)) | (Expr::Const(c), expr) if *c == 1.0 => {
                        boxed(expr.clone())
                    }
                    (expr, Expr::Const(c)) | (Expr::Const(c), expr) if *c == -1.0 => {
                        boxed(Expr::Neg(boxed(expr.clone())))
                    }
                    // Keep constants in front: x * c -> c * x
                    (expr, Expr::Const(c)) => {
                        boxed(Expr::Mul(boxed(Expr::Const(*c)), boxed(expr.clone())))
                    }
                    // c1 * (c2 * x) -> (c1 * c2) * x
                    (Expr::Const(c1), Expr::Mul(inner, x)) => match &**inner {
                        Expr::Const(c2) => boxed(Expr::Mul(boxed(Expr::Const(c1 * c2)), x.clone())),
                        _ => boxed(Expr::Mul(l, r)),
                    },
                    _ => boxed(Expr::Mul(l, r)),
                }
            }

            Expr::Div(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match (&*l, &*r) {
                    (Expr::Const(a), Expr::Const(b)) if *b != 0.0 => boxed(Expr::Const(a / b)),
                    (Expr::Const(c), _) if *c == 0.0 => boxed(Expr::Const(0.0)),
                    (expr, Expr::Const(c)) if *c == 1.0 => boxed(expr.clone()),
                    (expr, Expr::Const(c)) if *c == -1.0 => boxed(Expr::Neg(boxed(expr.clone()))),
                    _ => boxed(Expr::Div(l, r)),
                }
            }

            Expr::Abs(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => boxed(Expr::Const(a.abs())),
                    Expr::Abs(_) => e,
                    _ => boxed(Expr::Abs(e)),
                }
            }

            Expr::Pow(base, exp) => {
                let b = base.simplify();
                match (&*b, *exp) {
                    (_, 0) => boxed(Expr::Const(1.0)),
                    (expr, 1) => boxed(expr.clone()),
                    (Expr::Const(a), exp) => boxed(Expr::Const(a.powi(exp as i32))),
                    (Expr::Pow(inner, inner_exp), exp) => boxed(Expr::Pow(inner.clone(), inner_exp * exp)),
                    _ => boxed(Expr::Pow(b, *exp)),
                }
            }

            Expr::PowFloat(base, exp) => {
                let b = base.simplify();
                match &*b {
                    Expr::Const(a) => boxed(Expr::Const(a.powf(*exp))),
                    _ if *exp == 0.0 => boxed(Expr::Const(1.0)),
                    _ if *exp == 1.0 => b,
                    _ if exp.fract() == 0.0 && exp.abs() < 64.0 => boxed(Expr::Pow(b, *exp as i64)),
                    _ => boxed(Expr::PowFloat(b, *exp)),
                }
            }

            Expr::Exp(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => boxed(Expr::Const(a.exp())),
                    _ => boxed(Expr::Exp(e)),
                }
            }

            Expr::Ln(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) if *a > 0.0 => boxed(Expr::Const(a.ln())),
                    _ => boxed(Expr::Ln(e)),
                }
            }

            Expr::Sqrt(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) if *a >= 0.0 => boxed(Expr::Const(a.sqrt())),
                    _ => boxed(Expr::Sqrt(e)),
                }
            }

            Expr::Sin(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => boxed(Expr::Const(a.sin())),
                    _ => boxed(Expr::Sin(e)),
                }
            }

            Expr::Cos(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => boxed(Expr::Const(a.cos())),
                    _ => boxed(Expr::Cos(e)),
                }
            }

            Expr::Neg(expr) => {
                let e = expr.simplify();
                match &*e {
                    Expr::Const(a) => boxed(Expr::Const(-a)),
                    Expr::Neg(inner) => inner.clone(),
                    Expr::Mul(c, x) => match &**c {
                        Expr::Const(c) => boxed(Expr::Mul(boxed(Expr::Const(-c)), x.clone())),
                        _ => boxed(Expr::Neg(e)),
                    },
                    _ => boxed(Expr::Neg(e)),
                }
            }
        }
    }

    /// Whether the expression is the constant zero.
    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Const(c) if *c == 0.0)
    }

    /// Evaluates the expression with `inputs[i]` bound to the variable with index `i`.
    pub fn eval(&self, inputs: &[f64]) -> f64 {
        match self {
            Expr::Const(c) => *c,
            Expr::Var(v) => inputs.get(v.index as usize).copied().unwrap_or(f64::NAN),
            Expr::Add(l, r) => l.eval(inputs) + r.eval(inputs),
            Expr::Sub(l, r) => l.eval(inputs) - r.eval(inputs),
            Expr::Mul(l, r) => l.eval(inputs) * r.eval(inputs),
            Expr::Div(l, r) => l.eval(inputs) / r.eval(inputs),
            Expr::Abs(e) => e.eval(inputs).abs(),
            Expr::Pow(b, n) => b.eval(inputs).powi(*n as i32),
            Expr::PowFloat(b, p) => b.eval(inputs).powf(*p),
            Expr::Exp(e) => e.eval(inputs).exp(),
            Expr::Ln(e) => e.eval(inputs).ln(),
            Expr::Sqrt(e) => e.eval(inputs).sqrt(),
            Expr::Sin(e) => e.eval(inputs).sin(),
            Expr::Cos(e) => e.eval(inputs).cos(),
            Expr::Neg(e) => -e.eval(inputs),
        }
    }

    /// Generates Cranelift IR computing this expression.
    ///
    /// Variables are loaded from `ctx.input_ptr` once per function and reused afterwards.
    pub(crate) fn codegen(&self, builder: &mut FunctionBuilder, ctx: &mut CodegenContext) -> Value {
        match self {
            Expr::Const(c) => builder.ins().f64const(*c),
            Expr::Var(v) => {
                if let Some(value) = ctx.loaded.get(&v.index) {
                    return *value;
                }
                let offset = Offset32::new(v.index as i32 * 8);
                let value = builder
                    .ins()
                    .load(types::F64, MemFlags::trusted(), ctx.input_ptr, offset);
                ctx.loaded.insert(v.index, value);
                value
            }
            Expr::Add(l, r) => {
                let (a, b) = (l.codegen(builder, ctx), r.codegen(builder, ctx));
                builder.ins().fadd(a, b)
            }
            Expr::Sub(l, r) => {
                let (a, b) = (l.codegen(builder, ctx), r.codegen(builder, ctx));
                builder.ins().fsub(a, b)
            }
            Expr::Mul(l, r) => {
                let (a, b) = (l.codegen(builder, ctx), r.codegen(builder, ctx));
                builder.ins().fmul(a, b)
            }
            Expr::Div(l, r) => {
                let (a, b) = (l.codegen(builder, ctx), r.codegen(builder, ctx));
                builder.ins().fdiv(a, b)
            }
            Expr::Abs(e) => {
                let v = e.codegen(builder, ctx);
                builder.ins().fabs(v)
            }
            Expr::Neg(e) => {
                let v = e.codegen(builder, ctx);
                builder.ins().fneg(v)
            }
            Expr::Sqrt(e) => {
                let v = e.codegen(builder, ctx);
                builder.ins().sqrt(v)
            }
            Expr::Pow(b, n) => {
                let v = b.codegen(builder, ctx);
                integer_power(builder, v, *n)
            }
            Expr::PowFloat(b, p) => {
                let v = b.codegen(builder, ctx);
                let p = builder.ins().f64const(*p);
                call(builder, ctx.imports.powf, &[v, p])
            }
            Expr::Exp(e) => {
                let v = e.codegen(builder, ctx);
                call(builder, ctx.imports.exp, &[v])
            }
            Expr::Ln(e) => {
                let v = e.codegen(builder, ctx);
                call(builder, ctx.imports.ln, &[v])
            }
            Expr::Sin(e) => {
                let v = e.codegen(builder, ctx);
                call(builder, ctx.imports.sin, &[v])
            }
            Expr::Cos(e) => {
                let v = e.codegen(builder, ctx);
                call(builder, ctx.imports.cos, &[v])
            }
        }
    }
}

fn call(builder: &mut FunctionBuilder, func: FuncRef, args: &[Value]) -> Value {
    let inst = builder.ins().call(func, args);
    builder.inst_results(inst)[0]
}

/// Binary exponentiation by repeated squaring.
fn integer_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    match exp {
        0 => builder.ins().f64const(1.0),
        1 => base,
        2 => builder.ins().fmul(base, base),
        _ => {
            let mut result = None;
            let mut current = base;
            let mut remaining = exp.unsigned_abs();
            while remaining > 0 {
                if remaining & 1 == 1 {
                    result = Some(match result {
                        Some(r) => builder.ins().fmul(r, current),
                        None => current,
                    });
                }
                remaining >>= 1;
                if remaining > 0 {
                    current = builder.ins().fmul(current, current);
                }
            }
            let result = result.unwrap_or_else(|| builder.ins().f64const(1.0));
            if exp < 0 {
                let one = builder.ins().f64const(1.0);
                builder.ins().fdiv(one, result)
            } else {
                result
            }
        }
    }
}

/// Implements string formatting for expressions.
///
/// Binary operations are wrapped in parentheses, functions use call notation, absolute
/// values use |x| and exponents use ^.
impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Var(var_ref) => write!(f, "{}", var_ref.name),
            Expr::Add(left, right) => write!(f, "({left} + {right})"),
            Expr::Mul(left, right) => write!(f, "({left} * {right})"),
            Expr::Sub(left, right) => write!(f, "({left} - {right})"),
            Expr::Div(left, right) => write!(f, "({left} / {right})"),
            Expr::Abs(expr) => write!(f, "|{expr}|"),
            Expr::Pow(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowFloat(base, exp) => write!(f, "({base}^{exp})"),
            Expr::Exp(expr) => write!(f, "exp({expr})"),
            Expr::Ln(expr) => write!(f, "ln({expr})"),
            Expr::Sqrt(expr) => write!(f, "sqrt({expr})"),
            Expr::Sin(expr) => write!(f, "sin({expr})"),
            Expr::Cos(expr) => write!(f, "cos({expr})"),
            Expr::Neg(expr) => write!(f, "-({expr})"),
        }
    }
}
