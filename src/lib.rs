//! External operators for symbolic finite element forms.
//!
//! This crate lets a finite element form contain operators whose values are not given
//! symbolically but computed by outside numerical code: constitutive laws, return mappings
//! or any pointwise function of fields evaluated at quadrature points. It provides:
//!
//! - A small tensor-valued form language over P1 triangles ([`form`], [`assembly`])
//! - [`ExternalOperator`] nodes that take part in Gateaux differentiation through the
//!   multivariate chain rule ([`derivative`])
//! - Replacement of nodes by quadrature buffers and evaluation of those buffers through
//!   user-registered kernels ([`replace`], [`dispatch`], [`operands`])
//! - [`CompiledLaw`], a kernel provider built from scalar formulas, differentiated
//!   symbolically and JIT-compiled with [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use extop_jit::prelude::*;
//!
//! let mesh = Arc::new(Mesh::unit_square(4, 4));
//! let space = FunctionSpace::scalar(&mesh);
//! let t = Function::new(&space, "T");
//! t.interpolate_scalar(|x| x[0] * x[0] + x[1]).unwrap();
//!
//! // q(T, ∇T) = -∇T / (1 + T)
//! let qspace = QuadratureSpace::new(&mesh, 2, &[2]).unwrap();
//! let temperature = FormExpr::coefficient(&t);
//! let q = ExternalOperator::new("q", vec![temperature.clone(), grad(temperature)], &qspace).unwrap();
//! let law = CompiledLaw::builder("q")
//!     .operand("T", &[])
//!     .operand("sigma", &[2])
//!     .value_shape(&[2])
//!     .components(&["-sigma_0 / (1 + T)", "-sigma_1 / (1 + T)"])
//!     .build()
//!     .unwrap();
//! q.set_external_function(law);
//!
//! let dx = Measure::new(2).unwrap();
//! let f = inner(FormExpr::from(&q), grad(test_function(&space))) * &dx;
//! let j = f.derivative(&t, &trial_function(&space)).unwrap();
//!
//! let (j_numeric, nodes) = replace_external_operators(&j);
//! let operands = evaluate_operands(&nodes).unwrap();
//! evaluate_external_operators(&nodes, &operands).unwrap();
//! let jacobian = assemble_matrix(&j_numeric).unwrap();
//! ```

pub use dispatch::{ExternalFunction, KernelTable};
pub use external::{set_external_function, ExternalOperator};
pub use law::{Backend, CompiledLaw, LawOptions};

pub mod prelude {
    pub use crate::assembly::{assemble_matrix, assemble_scalar, assemble_vector};
    pub use crate::buffer::{pack, update, QuadratureFunction};
    pub use crate::dispatch::{resolve, ExternalFunction, KernelTable};
    pub use crate::external::{set_external_function, ExternalOperator};
    pub use crate::form::{
        dot, grad, inner, test_function, trial_function, Form, FormExpr, Measure,
    };
    pub use crate::law::{Backend, CompiledLaw, LawOptions};
    pub use crate::mesh::Mesh;
    pub use crate::operands::{evaluate_operands, evaluate_operands_with, OperandValueSet};
    pub use crate::replace::{evaluate_external_operators, replace_external_operators};
    pub use crate::space::{Function, FunctionSpace, QuadratureSpace};
    pub use crate::types::{kernel, Kernel, KernelOutput};
}

/// Dense assembly of scalar, vector and matrix forms
pub mod assembly;
/// Quadrature buffers and result packing
pub mod buffer;
/// JIT compilation functionality using Cranelift
pub mod builder;
/// Conversion from parsed formulas to scalar expression trees
pub mod convert;
/// Gateaux derivatives and the chain rule through external operators
pub mod derivative;
/// Kernel providers and resolution
pub mod dispatch;
/// Error types for the various failure modes
pub mod errors;
/// Scalar expression trees and symbolic differentiation
pub mod expr;
/// External operator nodes and their families
pub mod external;
/// The symbolic form language
pub mod form;
/// Pointwise evaluation of form expressions
pub mod interpret;
/// Constitutive laws compiled from formulas
pub mod law;
/// Triangle meshes and quadrature rules
pub mod mesh;
/// Operand evaluation at quadrature points
pub mod operands;
/// Replacement and evaluation of external operators
pub mod replace;
/// Function spaces, functions and quadrature spaces
pub mod space;
/// Multi-indices, kernels and compiled function types
pub mod types;
