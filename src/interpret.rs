//! Pointwise evaluation of form expressions.
//!
//! Evaluation happens at one quadrature point of one cell, with up to two local basis
//! functions bound to the test and trial arguments. Every subexpression evaluates to a dense
//! tensor in row-major order.

use std::sync::Arc;

use ndarray::{arr0, Array2, ArrayD, IxDyn};

use crate::errors::FormError;
use crate::form::{contracted_shape, FormExpr};
use crate::mesh::{Mesh, P1Basis, QuadratureRule};
use crate::types::shape_size;

/// Everything known about the point at which an expression is evaluated.
#[derive(Debug, Clone, Copy)]
pub struct PointContext<'a> {
    pub mesh: &'a Arc<Mesh>,
    pub rule: &'a QuadratureRule,
    pub cell: usize,
    /// Index of the point in the global quadrature numbering
    pub point: usize,
    /// Physical coordinates
    pub x: [f64; 2],
    pub basis: &'a P1Basis,
    /// Local basis function bound to argument 0
    pub test: Option<usize>,
    /// Local basis function bound to argument 1
    pub trial: Option<usize>,
}

impl PointContext<'_> {
    fn bound(&self, number: usize) -> Result<usize, FormError> {
        match number {
            0 => self.test,
            1 => self.trial,
            _ => None,
        }
        .ok_or(FormError::UnboundArgument(number))
    }
}

fn tensor(shape: &[usize], data: Vec<f64>) -> Result<ArrayD<f64>, FormError> {
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| FormError::TensorSize {
        shape: shape.to_vec(),
        len,
    })
}

fn flat(a: &ArrayD<f64>) -> Vec<f64> {
    a.iter().copied().collect()
}

fn scalar_of(operation: &'static str, a: &ArrayD<f64>) -> Result<f64, FormError> {
    if a.ndim() != 0 {
        return Err(FormError::ExpectedScalar {
            operation,
            shape: a.shape().to_vec(),
        });
    }
    Ok(a.iter().copied().next().unwrap_or(0.0))
}

fn same_shape(operation: &'static str, a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<(), FormError> {
    if a.shape() != b.shape() {
        return Err(FormError::IncompatibleShapes {
            operation,
            left: a.shape().to_vec(),
            right: b.shape().to_vec(),
        });
    }
    Ok(())
}

/// Evaluates `expr` at the point described by `ctx`.
///
/// # Errors
/// Fails on shape errors, unbound arguments, unreplaced external operators and quadrature
/// coefficients that do not live on the points of `ctx`.
pub fn evaluate(expr: &FormExpr, ctx: &PointContext) -> Result<ArrayD<f64>, FormError> {
    match expr {
        FormExpr::Scalar(v) => Ok(arr0(*v).into_dyn()),
        FormExpr::Constant(c) => Ok(c.clone()),
        FormExpr::Identity(n) => Ok(Array2::eye(*n).into_dyn()),
        FormExpr::SpatialCoordinate => tensor(&[2], ctx.x.to_vec()),
        FormExpr::Coefficient(f) => {
            let bs = f.space().value_size();
            let values = f.values();
            let vertices = ctx.mesh.cells()[ctx.cell];
            let data = (0..bs)
                .map(|c| {
                    vertices
                        .iter()
                        .zip(ctx.basis.values)
                        .map(|(v, phi)| phi * values[v * bs + c])
                        .sum()
                })
                .collect();
            tensor(f.space().value_shape(), data)
        }
        FormExpr::Argument(a) => {
            let bs = a.space.value_size();
            let local = ctx.bound(a.number)?;
            let mut data = vec![0.0; bs];
            data[local % bs] = ctx.basis.values[local / bs];
            tensor(a.space.value_shape(), data)
        }
        FormExpr::Grad(inner) => evaluate_grad(inner, ctx),
        FormExpr::QuadratureCoefficient(q) => {
            let space = q.space();
            if !Arc::ptr_eq(space.mesh(), ctx.mesh) || **space.rule() != *ctx.rule {
                return Err(FormError::QuadratureMismatch);
            }
            tensor(space.value_shape(), q.point_values(ctx.point))
        }
        FormExpr::External(node) => Err(FormError::UnreplacedExternalOperator(node.to_string())),
        FormExpr::Add(a, b) => {
            let (a, b) = (evaluate(a, ctx)?, evaluate(b, ctx)?);
            same_shape("add", &a, &b)?;
            Ok(a + b)
        }
        FormExpr::Neg(a) => Ok(-evaluate(a, ctx)?),
        FormExpr::Mul(a, b) => {
            let (a, b) = (evaluate(a, ctx)?, evaluate(b, ctx)?);
            if a.ndim() == 0 {
                let s = scalar_of("mul", &a)?;
                Ok(b * s)
            } else if b.ndim() == 0 {
                let s = scalar_of("mul", &b)?;
                Ok(a * s)
            } else {
                Err(FormError::IncompatibleShapes {
                    operation: "mul",
                    left: a.shape().to_vec(),
                    right: b.shape().to_vec(),
                })
            }
        }
        FormExpr::Div(a, b) => {
            let a = evaluate(a, ctx)?;
            let s = scalar_of("div", &evaluate(b, ctx)?)?;
            Ok(a / s)
        }
        FormExpr::Pow(a, n) => unary(a, ctx, "pow", |v| v.powi(*n)),
        FormExpr::Exp(a) => unary(a, ctx, "exp", f64::exp),
        FormExpr::Ln(a) => unary(a, ctx, "ln", f64::ln),
        FormExpr::Sqrt(a) => unary(a, ctx, "sqrt", f64::sqrt),
        FormExpr::Inner(a, b) => {
            let (a, b) = (evaluate(a, ctx)?, evaluate(b, ctx)?);
            same_shape("inner", &a, &b)?;
            let value = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum::<f64>();
            Ok(arr0(value).into_dyn())
        }
        FormExpr::Dot(a, b) => {
            let (a, b) = (evaluate(a, ctx)?, evaluate(b, ctx)?);
            dot(&a, &b)
        }
        FormExpr::Contract {
            tensor: t,
            operand,
            axis,
        } => {
            let (t, o) = (evaluate(t, ctx)?, evaluate(operand, ctx)?);
            contract(&t, &o, *axis)
        }
    }
}

fn unary<F>(
    a: &FormExpr,
    ctx: &PointContext,
    operation: &'static str,
    f: F,
) -> Result<ArrayD<f64>, FormError>
where
    F: Fn(f64) -> f64,
{
    let value = scalar_of(operation, &evaluate(a, ctx)?)?;
    Ok(arr0(f(value)).into_dyn())
}

fn evaluate_grad(inner: &FormExpr, ctx: &PointContext) -> Result<ArrayD<f64>, FormError> {
    let gdim = ctx.mesh.gdim();
    match inner {
        FormExpr::Coefficient(f) => {
            let bs = f.space().value_size();
            let values = f.values();
            let vertices = ctx.mesh.cells()[ctx.cell];
            let mut data = vec![0.0; bs * gdim];
            for (k, v) in vertices.iter().enumerate() {
                for c in 0..bs {
                    for d in 0..gdim {
                        data[c * gdim + d] += values[v * bs + c] * ctx.basis.gradients[k][d];
                    }
                }
            }
            let mut shape = f.space().value_shape().to_vec();
            shape.push(gdim);
            tensor(&shape, data)
        }
        FormExpr::Argument(a) => {
            let bs = a.space.value_size();
            let local = ctx.bound(a.number)?;
            let (node, component) = (local / bs, local % bs);
            let mut data = vec![0.0; bs * gdim];
            for d in 0..gdim {
                data[component * gdim + d] = ctx.basis.gradients[node][d];
            }
            let mut shape = a.space.value_shape().to_vec();
            shape.push(gdim);
            tensor(&shape, data)
        }
        other => Err(FormError::UnsupportedGradient(other.to_string())),
    }
}

/// Contracts the last axis of `a` with the first axis of `b`.
pub(crate) fn dot(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<ArrayD<f64>, FormError> {
    let (sa, sb) = (a.shape(), b.shape());
    let k = match (sa.last(), sb.first()) {
        (Some(l), Some(r)) if l == r => *l,
        _ => {
            return Err(FormError::IncompatibleShapes {
                operation: "dot",
                left: sa.to_vec(),
                right: sb.to_vec(),
            })
        }
    };
    let m = shape_size(&sa[..sa.len() - 1]);
    let n = shape_size(&sb[1..]);
    let (fa, fb) = (flat(a), flat(b));
    let mut data = vec![0.0; m * n];
    for i in 0..m {
        for l in 0..k {
            let x = fa[i * k + l];
            for j in 0..n {
                data[i * n + j] += x * fb[l * n + j];
            }
        }
    }
    let mut shape = sa[..sa.len() - 1].to_vec();
    shape.extend_from_slice(&sb[1..]);
    tensor(&shape, data)
}

/// Contracts all axes of `o` against the axes of `t` starting at `axis`.
pub(crate) fn contract(
    t: &ArrayD<f64>,
    o: &ArrayD<f64>,
    axis: usize,
) -> Result<ArrayD<f64>, FormError> {
    let shape = contracted_shape(t.shape(), o.shape(), axis)?;
    let left = shape_size(&t.shape()[..axis]);
    let mid = o.len();
    let right = shape_size(&t.shape()[axis + o.ndim()..]);
    let (ft, fo) = (flat(t), flat(o));
    let mut data = vec![0.0; left * right];
    for l in 0..left {
        for m in 0..mid {
            let w = fo[m];
            let base = (l * mid + m) * right;
            for r in 0..right {
                data[l * right + r] += ft[base + r] * w;
            }
        }
    }
    tensor(&shape, data)
}
