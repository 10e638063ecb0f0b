//! Error types for the extop-jit crate.
//!
//! The error types mirror the stages of the external operator pipeline:
//!
//! - `FormError`: Shape inference and pointwise evaluation failures of the host form language
//! - `OperatorError`: Buffer binding, dispatch, result packing and local solver failures
//! - `ConvertError`: Errors during conversion from evalexpr AST to the scalar expression tree
//! - `BuilderError`: Errors during JIT compilation with Cranelift
//! - `LawError`: High-level errors when declaring a compiled constitutive law
//!
//! None of these errors is retried by the pipeline. A failed evaluation never leaves a
//! half-written quadrature buffer behind.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use evalexpr::{DefaultNumericTypes, EvalexprError};
use thiserror::Error;

use crate::types::MultiIndex;

/// Errors raised by the host form language.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormError {
    /// Two operands of a binary operation have incompatible shapes
    #[error("shape mismatch in {operation}: {left:?} vs {right:?}")]
    IncompatibleShapes {
        operation: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    /// An operation that only accepts scalars received a tensor
    #[error("{operation} expects a scalar operand, got shape {shape:?}")]
    ExpectedScalar {
        operation: &'static str,
        shape: Vec<usize>,
    },
    /// The gradient is only defined for coefficients and arguments
    #[error("gradient of {0} is not supported")]
    UnsupportedGradient(String),
    /// A contraction axis lies outside the tensor
    #[error("cannot contract shape {operand:?} into {tensor:?} at axis {axis}")]
    InvalidContraction {
        tensor: Vec<usize>,
        operand: Vec<usize>,
        axis: usize,
    },
    /// An external operator node reached pointwise evaluation without being replaced
    #[error("external operator {0} must be replaced before evaluation")]
    UnreplacedExternalOperator(String),
    /// An argument was evaluated without a basis function bound to it
    #[error("argument {0} has no basis function bound in this context")]
    UnboundArgument(usize),
    /// The requested quadrature degree has no rule
    #[error("no triangle quadrature rule of degree {0}")]
    UnsupportedQuadratureDegree(usize),
    /// A quadrature coefficient lives on different points than the integration measure
    #[error("quadrature coefficient is not defined on the integration points")]
    QuadratureMismatch,
    /// A form does not contain the argument needed for the requested assembly
    #[error("form has no argument number {0}")]
    MissingArgument(usize),
    /// The Gateaux direction does not have the shape of the differentiated field
    #[error("direction shape {direction:?} does not match field shape {field:?}")]
    DirectionShape {
        field: Vec<usize>,
        direction: Vec<usize>,
    },
    /// A form references no function, argument or buffer that fixes its mesh
    #[error("form has no mesh to integrate over")]
    UndefinedDomain,
    /// Values written into a function do not match the size of its space
    #[error("expected {expected} values, got {got}")]
    InterpolationSize { expected: usize, got: usize },
    /// A flat value array does not fill a tensor of the given shape
    #[error("{len} values do not form a tensor of shape {shape:?}")]
    TensorSize { shape: Vec<usize>, len: usize },
}

/// Errors raised while binding, dispatching, evaluating and packing external operators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperatorError {
    /// Declared value shape disagrees with the value shape of the quadrature space
    #[error("declared value shape {declared:?} does not match space value shape {actual:?}")]
    ShapeMismatch {
        declared: Vec<usize>,
        actual: Vec<usize>,
    },
    /// The external function has no kernel for the requested derivative
    #[error("external operator {operator} does not implement derivative {derivatives:?}")]
    UnsupportedDerivative {
        operator: String,
        derivatives: MultiIndex,
    },
    /// No external function was attached to the operator family
    #[error("no external function attached to external operator {0}")]
    MissingExternalFunction(String),
    /// A kernel returned data of the wrong length
    #[error("external operator {operator} produced {got} values, expected {expected}")]
    ResultShape {
        operator: String,
        expected: usize,
        got: usize,
    },
    /// A local (per-point) nonlinear solve inside a kernel did not converge
    #[error("local solve did not converge at point {point} after {iterations} iterations (residual {residual:e})")]
    NonConvergence {
        point: usize,
        iterations: usize,
        residual: f64,
    },
    /// An operand required by a node is absent from the operand value set
    #[error("operand {0} has not been evaluated")]
    MissingOperand(String),
    /// A derivative multi-index does not have one entry per operand
    #[error("multi-index {derivatives:?} does not match {operands} operands")]
    OperandCount {
        derivatives: MultiIndex,
        operands: usize,
    },
    /// A kernel received an operand array whose length does not fit the point count
    #[error("operand {operand} has {got} values, expected {expected}")]
    OperandLength {
        operand: usize,
        expected: usize,
        got: usize,
    },
    /// Error from the host form language
    #[error("form error: {0}")]
    Form(#[from] FormError),
}

/// Errors that can occur during conversion from evalexpr AST to our internal AST representation.
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Error when trying to convert an exponent that is not a numeric constant
    #[error("Could not convert exponent in power operator: {0}")]
    ExpOperator(String),
    /// Error when encountering an operator that is not supported by our implementation
    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),
    /// Error when encountering a function that is not supported by our implementation
    #[error("Unsupported function: {0}")]
    UnsupportedFunction(String),
    /// Error when the root node does not have exactly one child
    #[error("Expected single child for root node: {0}")]
    RootNode(String),
    /// Error when a constant value is not numeric
    #[error("Expected numeric constant: {0}")]
    ConstOperator(String),
    /// Error when a variable is neither an operand component nor a named constant
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
}

/// Errors that can occur during JIT compilation of expressions.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Error when the target machine architecture is not supported
    #[error("host machine is not supported: {0}")]
    HostMachineNotSupported(String),
    /// Error when a Cranelift setting is rejected
    #[error("invalid compiler setting: {0}")]
    SettingError(String),
    /// Error during Cranelift code generation
    #[error("codegen error: {0}")]
    CodegenError(CodegenError),
    /// Error in the Cranelift JIT module
    #[error("module error: {0}")]
    ModuleError(ModuleError),
    /// Error when defining the JIT function
    #[error("function error: {0}")]
    FunctionError(String),
    /// Error when declaring the JIT function or one of its imports
    #[error("declaration error: {0}")]
    DeclarationError(String),
}

/// High-level errors when declaring or compiling a constitutive law.
#[derive(Debug, Error)]
pub enum LawError {
    /// Error when parsing a component formula with evalexpr
    #[error("Failed to parse component formula")]
    Parse(#[from] EvalexprError<DefaultNumericTypes>),
    /// Error when converting from evalexpr AST to the scalar expression tree
    #[error("Failed to build expression tree")]
    Convert(#[from] ConvertError),
    /// Error when JIT compiling a kernel
    #[error("Failed to build JIT kernel")]
    Build(#[from] BuilderError),
    /// The number of component formulas does not match the declared value shape
    #[error("Invalid component count: expected {expected}, got {got}")]
    ComponentCount { expected: usize, got: usize },
    /// Two operands were declared with the same name
    #[error("Duplicate operand name: {0}")]
    DuplicateOperand(String),
    /// A derivative multi-index does not have one entry per declared operand
    #[error("Multi-index {derivatives:?} does not match {operands} operands")]
    MultiIndex {
        derivatives: MultiIndex,
        operands: usize,
    },
    /// A law needs at least one operand to know its number of points
    #[error("Law {0} declares no operands")]
    NoOperands(String),
}
