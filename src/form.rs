//! Tensor-valued form language.
//!
//! This module defines the symbolic expressions that finite element forms are written in.
//! An expression evaluates to a tensor at every quadrature point; a [`Form`] is a sum of
//! integrals of such expressions. Forms are linear in their [`Argument`]s: argument 0 is
//! the test function, argument 1 the trial function.
//!
//! The tree supports:
//! - Leaves: scalar and tensor constants, the identity, spatial coordinates, finite element
//!   coefficients, arguments, quadrature coefficients and external operators
//! - Algebra: sums, negation, scalar products and quotients, integer powers, `exp`, `ln`, `sqrt`
//! - Tensor products: full contraction (`inner`), single-index contraction (`dot`) and the
//!   block contraction [`FormExpr::Contract`] used by the chain rule
//! - Gradients of coefficients and arguments
//!
//! Shapes are checked statically by [`FormExpr::shape`]; the term replacement pass
//! [`FormExpr::map`] rebuilds a tree with selected nodes substituted.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use ndarray::{arr1, ArrayD, IxDyn};

use crate::buffer::QuadratureFunction;
use crate::errors::FormError;
use crate::external::ExternalOperator;
use crate::mesh::QuadratureRule;
use crate::space::{Function, FunctionSpace};

/// Test (number 0) or trial (number 1) function of a form.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub number: usize,
    pub space: FunctionSpace,
}

/// An expression tree node of the form language.
#[derive(Debug, Clone, PartialEq)]
pub enum FormExpr {
    /// A scalar constant
    Scalar(f64),
    /// A tensor constant
    Constant(ArrayD<f64>),
    /// The `n × n` identity
    Identity(usize),
    /// Physical coordinates of the evaluation point
    SpatialCoordinate,
    /// A finite element function
    Coefficient(Function),
    /// A test or trial function
    Argument(Argument),
    /// Per-point values stored in a quadrature buffer
    QuadratureCoefficient(QuadratureFunction),
    /// A node whose values are computed by external code
    External(ExternalOperator),
    /// Spatial gradient, appends one axis of length `gdim`
    Grad(Box<FormExpr>),
    /// Sum of two tensors of equal shape
    Add(Box<FormExpr>, Box<FormExpr>),
    /// Negation
    Neg(Box<FormExpr>),
    /// Product where at least one factor is a scalar
    Mul(Box<FormExpr>, Box<FormExpr>),
    /// Division of a tensor by a scalar
    Div(Box<FormExpr>, Box<FormExpr>),
    /// Integer power of a scalar
    Pow(Box<FormExpr>, i32),
    /// Exponential of a scalar
    Exp(Box<FormExpr>),
    /// Natural logarithm of a scalar
    Ln(Box<FormExpr>),
    /// Square root of a scalar
    Sqrt(Box<FormExpr>),
    /// Contraction over all indices of two tensors of equal shape
    Inner(Box<FormExpr>, Box<FormExpr>),
    /// Contraction of the last index of the left with the first index of the right tensor
    Dot(Box<FormExpr>, Box<FormExpr>),
    /// Contraction of all indices of `operand` against the axes of `tensor` starting at `axis`
    Contract {
        tensor: Box<FormExpr>,
        operand: Box<FormExpr>,
        axis: usize,
    },
}

impl FormExpr {
    pub fn coefficient(function: &Function) -> Self {
        FormExpr::Coefficient(function.clone())
    }

    pub fn constant(value: ArrayD<f64>) -> Self {
        FormExpr::Constant(value)
    }

    /// A constant vector.
    pub fn vector(values: &[f64]) -> Self {
        FormExpr::Constant(arr1(values).into_dyn())
    }

    /// The zero tensor of a given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        if shape.is_empty() {
            FormExpr::Scalar(0.0)
        } else {
            FormExpr::Constant(ArrayD::zeros(IxDyn(shape)))
        }
    }

    pub fn pow(self, exponent: i32) -> Self {
        FormExpr::Pow(Box::new(self), exponent)
    }

    pub fn exp(self) -> Self {
        FormExpr::Exp(Box::new(self))
    }

    pub fn ln(self) -> Self {
        FormExpr::Ln(Box::new(self))
    }

    pub fn sqrt(self) -> Self {
        FormExpr::Sqrt(Box::new(self))
    }

    /// Block contraction, see [`FormExpr::Contract`].
    pub fn contract(self, operand: FormExpr, axis: usize) -> Self {
        FormExpr::Contract {
            tensor: Box::new(self),
            operand: Box::new(operand),
            axis,
        }
    }

    /// Infers the value shape of the expression at a point.
    ///
    /// # Errors
    /// Returns `FormError` if the tree combines incompatible shapes or takes the gradient
    /// of an expression other than a coefficient or argument.
    pub fn shape(&self) -> Result<Vec<usize>, FormError> {
        match self {
            FormExpr::Scalar(_) => Ok(Vec::new()),
            FormExpr::Constant(value) => Ok(value.shape().to_vec()),
            FormExpr::Identity(n) => Ok(vec![*n, *n]),
            FormExpr::SpatialCoordinate => Ok(vec![2]),
            FormExpr::Coefficient(f) => Ok(f.space().value_shape().to_vec()),
            FormExpr::Argument(a) => Ok(a.space.value_shape().to_vec()),
            FormExpr::QuadratureCoefficient(q) => Ok(q.value_shape().to_vec()),
            FormExpr::External(node) => Ok(node.value_shape().to_vec()),
            FormExpr::Grad(inner) => match &**inner {
                FormExpr::Coefficient(_) | FormExpr::Argument(_) => {
                    let mut shape = inner.shape()?;
                    shape.push(2);
                    Ok(shape)
                }
                other => Err(FormError::UnsupportedGradient(other.to_string())),
            },
            FormExpr::Add(a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                if sa != sb {
                    return Err(FormError::IncompatibleShapes {
                        operation: "add",
                        left: sa,
                        right: sb,
                    });
                }
                Ok(sa)
            }
            FormExpr::Neg(a) => a.shape(),
            FormExpr::Mul(a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                match (sa.is_empty(), sb.is_empty()) {
                    (true, _) => Ok(sb),
                    (_, true) => Ok(sa),
                    _ => Err(FormError::IncompatibleShapes {
                        operation: "mul",
                        left: sa,
                        right: sb,
                    }),
                }
            }
            FormExpr::Div(a, b) => {
                expect_scalar("div", b)?;
                a.shape()
            }
            FormExpr::Pow(a, _) => expect_scalar("pow", a),
            FormExpr::Exp(a) => expect_scalar("exp", a),
            FormExpr::Ln(a) => expect_scalar("ln", a),
            FormExpr::Sqrt(a) => expect_scalar("sqrt", a),
            FormExpr::Inner(a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                if sa != sb {
                    return Err(FormError::IncompatibleShapes {
                        operation: "inner",
                        left: sa,
                        right: sb,
                    });
                }
                Ok(Vec::new())
            }
            FormExpr::Dot(a, b) => {
                let (sa, sb) = (a.shape()?, b.shape()?);
                match (sa.last(), sb.first()) {
                    (Some(l), Some(r)) if l == r => {
                        let mut shape = sa[..sa.len() - 1].to_vec();
                        shape.extend_from_slice(&sb[1..]);
                        Ok(shape)
                    }
                    _ => Err(FormError::IncompatibleShapes {
                        operation: "dot",
                        left: sa,
                        right: sb,
                    }),
                }
            }
            FormExpr::Contract {
                tensor,
                operand,
                axis,
            } => contracted_shape(&tensor.shape()?, &operand.shape()?, *axis),
        }
    }

    /// Rebuilds the tree, replacing every node for which `f` returns `Some`.
    ///
    /// Replaced nodes are not traversed further. Operands held inside external operator
    /// nodes are not visited.
    pub fn map<F>(&self, f: &mut F) -> FormExpr
    where
        F: FnMut(&FormExpr) -> Option<FormExpr>,
    {
        if let Some(replacement) = f(self) {
            return replacement;
        }
        let un = |e: &FormExpr, f: &mut F| Box::new(e.map(f));
        match self {
            FormExpr::Scalar(_)
            | FormExpr::Constant(_)
            | FormExpr::Identity(_)
            | FormExpr::SpatialCoordinate
            | FormExpr::Coefficient(_)
            | FormExpr::Argument(_)
            | FormExpr::QuadratureCoefficient(_)
            | FormExpr::External(_) => self.clone(),
            FormExpr::Grad(a) => FormExpr::Grad(un(a, f)),
            FormExpr::Neg(a) => FormExpr::Neg(un(a, f)),
            FormExpr::Pow(a, n) => FormExpr::Pow(un(a, f), *n),
            FormExpr::Exp(a) => FormExpr::Exp(un(a, f)),
            FormExpr::Ln(a) => FormExpr::Ln(un(a, f)),
            FormExpr::Sqrt(a) => FormExpr::Sqrt(un(a, f)),
            FormExpr::Add(a, b) => FormExpr::Add(un(a, f), un(b, f)),
            FormExpr::Mul(a, b) => FormExpr::Mul(un(a, f), un(b, f)),
            FormExpr::Div(a, b) => FormExpr::Div(un(a, f), un(b, f)),
            FormExpr::Inner(a, b) => FormExpr::Inner(un(a, f), un(b, f)),
            FormExpr::Dot(a, b) => FormExpr::Dot(un(a, f), un(b, f)),
            FormExpr::Contract {
                tensor,
                operand,
                axis,
            } => FormExpr::Contract {
                tensor: un(tensor, f),
                operand: un(operand, f),
                axis: *axis,
            },
        }
    }

    /// Visits every node in pre-order, left to right.
    pub fn visit<F>(&self, f: &mut F)
    where
        F: FnMut(&FormExpr),
    {
        f(self);
        match self {
            FormExpr::Grad(a)
            | FormExpr::Neg(a)
            | FormExpr::Pow(a, _)
            | FormExpr::Exp(a)
            | FormExpr::Ln(a)
            | FormExpr::Sqrt(a) => a.visit(f),
            FormExpr::Add(a, b)
            | FormExpr::Mul(a, b)
            | FormExpr::Div(a, b)
            | FormExpr::Inner(a, b)
            | FormExpr::Dot(a, b) => {
                a.visit(f);
                b.visit(f);
            }
            FormExpr::Contract {
                tensor, operand, ..
            } => {
                tensor.visit(f);
                operand.visit(f);
            }
            _ => {}
        }
    }

    /// External operator nodes in first-occurrence order, without duplicates.
    pub fn external_operators(&self) -> Vec<ExternalOperator> {
        let mut nodes: Vec<ExternalOperator> = Vec::new();
        self.visit(&mut |e| {
            if let FormExpr::External(node) = e {
                if !nodes.contains(node) {
                    nodes.push(node.clone());
                }
            }
        });
        nodes
    }

    /// Arguments appearing in the expression.
    pub fn arguments(&self) -> Vec<Argument> {
        let mut arguments: Vec<Argument> = Vec::new();
        self.visit(&mut |e| {
            if let FormExpr::Argument(a) = e {
                if !arguments.iter().any(|b| b.number == a.number) {
                    arguments.push(a.clone());
                }
            }
        });
        arguments.sort_by_key(|a| a.number);
        arguments
    }
}

fn expect_scalar(operation: &'static str, e: &FormExpr) -> Result<Vec<usize>, FormError> {
    let shape = e.shape()?;
    if !shape.is_empty() {
        return Err(FormError::ExpectedScalar { operation, shape });
    }
    Ok(shape)
}

/// Shape left after contracting `operand` into `tensor` at `axis`.
pub(crate) fn contracted_shape(
    tensor: &[usize],
    operand: &[usize],
    axis: usize,
) -> Result<Vec<usize>, FormError> {
    let end = axis + operand.len();
    if end > tensor.len() || tensor[axis..end] != *operand {
        return Err(FormError::InvalidContraction {
            tensor: tensor.to_vec(),
            operand: operand.to_vec(),
            axis,
        });
    }
    let mut shape = tensor[..axis].to_vec();
    shape.extend_from_slice(&tensor[end..]);
    Ok(shape)
}

/// Test function on `space`.
pub fn test_function(space: &FunctionSpace) -> FormExpr {
    FormExpr::Argument(Argument {
        number: 0,
        space: space.clone(),
    })
}

/// Trial function on `space`.
pub fn trial_function(space: &FunctionSpace) -> FormExpr {
    FormExpr::Argument(Argument {
        number: 1,
        space: space.clone(),
    })
}

/// Spatial gradient.
///
/// The gradient is pushed through sums, negations and constant scalings so that it always
/// lands on a coefficient or an argument; gradients of constants vanish.
pub fn grad(e: FormExpr) -> FormExpr {
    match e {
        FormExpr::Add(a, b) => grad(*a) + grad(*b),
        FormExpr::Neg(a) => -grad(*a),
        FormExpr::Mul(a, b) if matches!(*a, FormExpr::Scalar(_)) => {
            FormExpr::Mul(a, Box::new(grad(*b)))
        }
        FormExpr::Scalar(_) => FormExpr::zeros(&[2]),
        FormExpr::Constant(ref c) => {
            let mut shape = c.shape().to_vec();
            shape.push(2);
            FormExpr::zeros(&shape)
        }
        other => FormExpr::Grad(Box::new(other)),
    }
}

pub fn inner(a: FormExpr, b: FormExpr) -> FormExpr {
    FormExpr::Inner(Box::new(a), Box::new(b))
}

pub fn dot(a: FormExpr, b: FormExpr) -> FormExpr {
    FormExpr::Dot(Box::new(a), Box::new(b))
}

impl From<f64> for FormExpr {
    fn from(value: f64) -> Self {
        FormExpr::Scalar(value)
    }
}

impl From<&Function> for FormExpr {
    fn from(function: &Function) -> Self {
        FormExpr::Coefficient(function.clone())
    }
}

impl From<&ExternalOperator> for FormExpr {
    fn from(node: &ExternalOperator) -> Self {
        FormExpr::External(node.clone())
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $build:expr) => {
        impl $trait<FormExpr> for FormExpr {
            type Output = FormExpr;

            fn $method(self, rhs: FormExpr) -> FormExpr {
                $build(self, rhs)
            }
        }

        impl $trait<f64> for FormExpr {
            type Output = FormExpr;

            fn $method(self, rhs: f64) -> FormExpr {
                $build(self, FormExpr::Scalar(rhs))
            }
        }

        impl $trait<FormExpr> for f64 {
            type Output = FormExpr;

            fn $method(self, rhs: FormExpr) -> FormExpr {
                $build(FormExpr::Scalar(self), rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, |a, b| FormExpr::Add(Box::new(a), Box::new(b)));
impl_binary_op!(Sub, sub, |a, b: FormExpr| FormExpr::Add(
    Box::new(a),
    Box::new(FormExpr::Neg(Box::new(b)))
));
impl_binary_op!(Mul, mul, |a, b| FormExpr::Mul(Box::new(a), Box::new(b)));
impl_binary_op!(Div, div, |a, b| FormExpr::Div(Box::new(a), Box::new(b)));

impl Neg for FormExpr {
    type Output = FormExpr;

    fn neg(self) -> FormExpr {
        FormExpr::Neg(Box::new(self))
    }
}

impl fmt::Display for FormExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormExpr::Scalar(v) => write!(f, "{}", v),
            FormExpr::Constant(c) => write!(f, "const{:?}", c.shape()),
            FormExpr::Identity(n) => write!(f, "I{}", n),
            FormExpr::SpatialCoordinate => write!(f, "x"),
            FormExpr::Coefficient(c) => write!(f, "{}", c.name()),
            FormExpr::Argument(a) => write!(f, "v_{}", a.number),
            FormExpr::QuadratureCoefficient(q) => write!(f, "w_{}", q.id()),
            FormExpr::External(node) => write!(f, "{}", node),
            FormExpr::Grad(a) => write!(f, "grad({})", a),
            FormExpr::Add(a, b) => write!(f, "({} + {})", a, b),
            FormExpr::Neg(a) => write!(f, "-{}", a),
            FormExpr::Mul(a, b) => write!(f, "{} * {}", a, b),
            FormExpr::Div(a, b) => write!(f, "{} / {}", a, b),
            FormExpr::Pow(a, n) => write!(f, "{}^{}", a, n),
            FormExpr::Exp(a) => write!(f, "exp({})", a),
            FormExpr::Ln(a) => write!(f, "ln({})", a),
            FormExpr::Sqrt(a) => write!(f, "sqrt({})", a),
            FormExpr::Inner(a, b) => write!(f, "inner({}, {})", a, b),
            FormExpr::Dot(a, b) => write!(f, "dot({}, {})", a, b),
            FormExpr::Contract {
                tensor,
                operand,
                axis,
            } => write!(f, "contract({}, {}, {})", tensor, operand, axis),
        }
    }
}

/// Cell integration measure with a fixed quadrature degree.
#[derive(Debug, Clone, PartialEq)]
pub struct Measure {
    rule: Arc<QuadratureRule>,
}

impl Measure {
    pub fn new(degree: usize) -> Result<Self, FormError> {
        Ok(Self {
            rule: Arc::new(QuadratureRule::triangle(degree)?),
        })
    }

    pub fn rule(&self) -> &QuadratureRule {
        &self.rule
    }
}

/// One integrand integrated over all cells with a measure.
#[derive(Debug, Clone, PartialEq)]
pub struct Integral {
    pub integrand: FormExpr,
    pub measure: Measure,
}

/// A sum of cell integrals.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Form {
    integrals: Vec<Integral>,
}

impl Form {
    pub fn new(integrand: FormExpr, measure: &Measure) -> Self {
        Self {
            integrals: vec![Integral {
                integrand,
                measure: measure.clone(),
            }],
        }
    }

    pub fn from_integrals(integrals: Vec<Integral>) -> Self {
        Self { integrals }
    }

    pub fn integrals(&self) -> &[Integral] {
        &self.integrals
    }

    pub fn is_empty(&self) -> bool {
        self.integrals.is_empty()
    }

    /// Applies the term replacement pass to every integrand.
    pub fn map<F>(&self, f: &mut F) -> Form
    where
        F: FnMut(&FormExpr) -> Option<FormExpr>,
    {
        Form {
            integrals: self
                .integrals
                .iter()
                .map(|i| Integral {
                    integrand: i.integrand.map(f),
                    measure: i.measure.clone(),
                })
                .collect(),
        }
    }

    /// External operator nodes over all integrals, first-occurrence order, no duplicates.
    pub fn external_operators(&self) -> Vec<ExternalOperator> {
        let mut nodes: Vec<ExternalOperator> = Vec::new();
        for integral in &self.integrals {
            for node in integral.integrand.external_operators() {
                if !nodes.contains(&node) {
                    nodes.push(node);
                }
            }
        }
        nodes
    }

    /// The argument with the given number, if the form has one.
    pub fn argument(&self, number: usize) -> Option<Argument> {
        self.integrals
            .iter()
            .flat_map(|i| i.integrand.arguments())
            .find(|a| a.number == number)
    }
}

impl Mul<&Measure> for FormExpr {
    type Output = Form;

    fn mul(self, measure: &Measure) -> Form {
        Form::new(self, measure)
    }
}

impl Add for Form {
    type Output = Form;

    fn add(mut self, rhs: Form) -> Form {
        self.integrals.extend(rhs.integrals);
        self
    }
}

impl Neg for Form {
    type Output = Form;

    fn neg(self) -> Form {
        Form {
            integrals: self
                .integrals
                .into_iter()
                .map(|i| Integral {
                    integrand: -i.integrand,
                    measure: i.measure,
                })
                .collect(),
        }
    }
}

impl Sub for Form {
    type Output = Form;

    fn sub(self, rhs: Form) -> Form {
        self + (-rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Mesh;

    fn scalar_space() -> FunctionSpace {
        FunctionSpace::scalar(&Arc::new(Mesh::unit_square(1, 1)))
    }

    #[test]
    fn test_shape_inference() {
        let space = scalar_space();
        let u = Function::new(&space, "u");
        let sigma = grad(FormExpr::coefficient(&u));
        assert_eq!(sigma.shape().unwrap(), vec![2]);

        let flux = -(FormExpr::Scalar(1.0) / (FormExpr::coefficient(&u) + 1.0)) * sigma.clone();
        assert_eq!(flux.shape().unwrap(), vec![2]);

        let v = test_function(&space);
        assert_eq!(inner(flux, grad(v)).shape().unwrap(), Vec::<usize>::new());
        assert_eq!(
            dot(FormExpr::Identity(2), sigma).shape().unwrap(),
            vec![2]
        );
    }

    #[test]
    fn test_shape_errors() {
        let space = scalar_space();
        let u = FormExpr::coefficient(&Function::new(&space, "u"));
        let add = u.clone() + grad(u.clone());
        assert!(matches!(
            add.shape(),
            Err(FormError::IncompatibleShapes {
                operation: "add",
                ..
            })
        ));
        let div = u.clone() / grad(u.clone());
        assert!(matches!(div.shape(), Err(FormError::ExpectedScalar { .. })));
        let nested = FormExpr::Grad(Box::new(grad(u)));
        assert!(matches!(
            nested.shape(),
            Err(FormError::UnsupportedGradient(_))
        ));
    }

    #[test]
    fn test_contract_shape() {
        assert_eq!(contracted_shape(&[2, 3, 2], &[3], 1).unwrap(), vec![2, 2]);
        assert_eq!(contracted_shape(&[2, 2], &[], 2).unwrap(), vec![2, 2]);
        assert!(contracted_shape(&[2, 3], &[2], 1).is_err());
    }

    #[test]
    fn test_grad_is_pushed_to_leaves() {
        let space = scalar_space();
        let v = trial_function(&space);
        let g = grad(-(2.0 * v.clone()));
        assert_eq!(
            g,
            -FormExpr::Mul(
                Box::new(FormExpr::Scalar(2.0)),
                Box::new(FormExpr::Grad(Box::new(v)))
            )
        );
    }

    #[test]
    fn test_map_replaces_nodes() {
        let space = scalar_space();
        let u = Function::new(&space, "u");
        let e = FormExpr::coefficient(&u) * 3.0 + FormExpr::coefficient(&u);
        let replaced = e.map(&mut |node| match node {
            FormExpr::Coefficient(_) => Some(FormExpr::Scalar(1.0)),
            _ => None,
        });
        assert_eq!(
            replaced,
            FormExpr::Scalar(1.0) * 3.0 + FormExpr::Scalar(1.0)
        );
    }

    #[test]
    fn test_form_arguments() {
        let space = scalar_space();
        let dx = Measure::new(1).unwrap();
        let form = inner(grad(trial_function(&space)), grad(test_function(&space))) * &dx;
        assert_eq!(form.argument(0).map(|a| a.number), Some(0));
        assert_eq!(form.argument(1).map(|a| a.number), Some(1));
        assert!(form.argument(2).is_none());
    }
}
