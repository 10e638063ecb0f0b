//! Constitutive laws written as scalar formulas and compiled to kernels.
//!
//! A [`CompiledLaw`] declares its operands with their shapes and gives one formula per
//! component of its value. It acts as an [`ExternalFunction`] for any derivative
//! multi-index: the formulas are differentiated symbolically, simplified and compiled into
//! one native function per multi-index, which is then evaluated at every quadrature point.
//!
//! Operand components are addressed by name: a scalar operand `T` is the variable `T`, a
//! vector operand `sigma` provides `sigma_0`, `sigma_1`, ... and a matrix operand `eps`
//! provides `eps_0_0`, `eps_0_1`, ... in row-major order.
//!
//! ```no_run
//! use extop_jit::law::CompiledLaw;
//!
//! // Heat flux q(T, σ) = -σ / (A + B T)
//! let law = CompiledLaw::builder("q")
//!     .operand("T", &[])
//!     .operand("sigma", &[2])
//!     .constant("A", 1.0)
//!     .constant("B", 1.0)
//!     .value_shape(&[2])
//!     .components(&["-sigma_0 / (A + B * T)", "-sigma_1 / (A + B * T)"])
//!     .build()
//!     .unwrap();
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use colored::Colorize;
use evalexpr::{build_operator_tree, DefaultNumericTypes};
use itertools::Itertools;
use log::{debug, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::builder::{build_combined_function, interpret_combined_function};
use crate::convert::build_ast;
use crate::dispatch::ExternalFunction;
use crate::errors::{LawError, OperatorError};
use crate::expr::Expr;
use crate::types::{shape_size, CombinedJITFunction, Kernel, KernelOutput, MultiIndex};

/// How compiled laws evaluate their expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Native code generated with Cranelift
    #[default]
    Jit,
    /// Tree-walking evaluation, no compilation step
    Interpreted,
}

/// Evaluation settings of a [`CompiledLaw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LawOptions {
    pub backend: Backend,
    /// Evaluate points in parallel with rayon
    pub parallel: bool,
    /// Smallest number of points handed to one parallel task
    pub min_points_per_task: usize,
}

impl Default for LawOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Jit,
            parallel: true,
            min_points_per_task: 64,
        }
    }
}

#[derive(Debug, Clone)]
struct LawOperand {
    name: String,
    shape: Vec<usize>,
    /// Position of the operand's first component in the per-point input vector
    offset: usize,
}

impl LawOperand {
    fn size(&self) -> usize {
        shape_size(&self.shape)
    }
}

/// Names of the scalar components of an operand, row-major.
fn component_names(name: &str, shape: &[usize]) -> Vec<String> {
    if shape.is_empty() {
        return vec![name.to_string()];
    }
    shape
        .iter()
        .map(|&n| 0..n)
        .multi_cartesian_product()
        .map(|index| format!("{}_{}", name, index.iter().join("_")))
        .collect()
}

/// Collects the declaration of a [`CompiledLaw`].
#[derive(Debug, Clone)]
pub struct LawBuilder {
    name: String,
    operands: Vec<(String, Vec<usize>)>,
    constants: HashMap<String, f64>,
    value_shape: Vec<usize>,
    components: Vec<String>,
    options: LawOptions,
    max_order: Option<usize>,
}

impl LawBuilder {
    /// Appends an operand. Operands are matched to the node's operands by position.
    pub fn operand(mut self, name: &str, shape: &[usize]) -> Self {
        self.operands.push((name.to_string(), shape.to_vec()));
        self
    }

    /// Defines a named constant, substituted into every formula.
    pub fn constant(mut self, name: &str, value: f64) -> Self {
        self.constants.insert(name.to_string(), value);
        self
    }

    /// Value shape of the law itself. Defaults to scalar.
    pub fn value_shape(mut self, shape: &[usize]) -> Self {
        self.value_shape = shape.to_vec();
        self
    }

    pub fn component(mut self, formula: &str) -> Self {
        self.components.push(formula.to_string());
        self
    }

    /// Appends one formula per value component, in row-major order.
    pub fn components(mut self, formulas: &[&str]) -> Self {
        self.components.extend(formulas.iter().map(|f| f.to_string()));
        self
    }

    pub fn options(mut self, options: LawOptions) -> Self {
        self.options = options;
        self
    }

    /// Caps the total derivative order the law provides.
    pub fn max_order(mut self, order: usize) -> Self {
        self.max_order = Some(order);
        self
    }

    /// Parses and converts all formulas.
    ///
    /// # Errors
    /// Returns `LawError::NoOperands`, `LawError::DuplicateOperand` or
    /// `LawError::ComponentCount` for an inconsistent declaration, and `LawError::Parse` or
    /// `LawError::Convert` if a formula cannot be read.
    pub fn build(self) -> Result<CompiledLaw, LawError> {
        if self.operands.is_empty() {
            return Err(LawError::NoOperands(self.name));
        }
        if let Some((name, _)) = self.operands.iter().duplicates_by(|(name, _)| name).next() {
            return Err(LawError::DuplicateOperand(name.clone()));
        }
        let expected = shape_size(&self.value_shape);
        if self.components.len() != expected {
            return Err(LawError::ComponentCount {
                expected,
                got: self.components.len(),
            });
        }

        let mut operands = Vec::with_capacity(self.operands.len());
        let mut variables = Vec::new();
        for (name, shape) in self.operands {
            operands.push(LawOperand {
                offset: variables.len(),
                name: name.clone(),
                shape: shape.clone(),
            });
            variables.extend(component_names(&name, &shape));
        }
        let var_map: HashMap<String, u32> = variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u32))
            .collect();

        let components = self
            .components
            .iter()
            .map(|formula| {
                let node = build_operator_tree::<DefaultNumericTypes>(formula)?;
                Ok(*build_ast(&node, &var_map, &self.constants)?.simplify())
            })
            .collect::<Result<Vec<Expr>, LawError>>()?;

        Ok(CompiledLaw {
            name: self.name,
            operands,
            variables,
            value_shape: self.value_shape,
            formulas: self.components,
            components,
            options: self.options,
            max_order: self.max_order,
            kernels: Mutex::new(HashMap::new()),
        })
    }
}

/// An external function defined by scalar formulas, differentiable to any order.
///
/// Kernels are compiled on first request and cached per multi-index.
pub struct CompiledLaw {
    name: String,
    operands: Vec<LawOperand>,
    variables: Vec<String>,
    value_shape: Vec<usize>,
    formulas: Vec<String>,
    components: Vec<Expr>,
    options: LawOptions,
    max_order: Option<usize>,
    kernels: Mutex<HashMap<MultiIndex, Kernel>>,
}

impl std::fmt::Debug for CompiledLaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{{\n")?;
        writeln!(f, "    {}: {}\n", "Law".cyan(), self.name)?;
        writeln!(f, "    {}: {:?}\n", "Variables".cyan(), self.variables)?;
        writeln!(f, "    {}: {:?}\n", "Value Shape".cyan(), self.value_shape)?;
        writeln!(f, "    {}: {:?}\n", "Options".cyan(), self.options)?;
        writeln!(f, "}}")?;
        Ok(())
    }
}

impl std::fmt::Display for CompiledLaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let operands = self
            .operands
            .iter()
            .map(|o| format!("{}{:?}", o.name, o.shape))
            .join(", ");
        writeln!(f, "{}({})", self.name.cyan(), operands)?;
        for (i, formula) in self.formulas.iter().enumerate() {
            writeln!(f, "    [{}] {}", i, formula)?;
        }
        Ok(())
    }
}

impl CompiledLaw {
    pub fn builder(name: &str) -> LawBuilder {
        LawBuilder {
            name: name.to_string(),
            operands: Vec::new(),
            constants: HashMap::new(),
            value_shape: Vec::new(),
            components: Vec::new(),
            options: LawOptions::default(),
            max_order: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_shape(&self) -> &[usize] {
        &self.value_shape
    }

    pub fn operand_shapes(&self) -> Vec<Vec<usize>> {
        self.operands.iter().map(|o| o.shape.clone()).collect()
    }

    /// Component variable names in input order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn options(&self) -> &LawOptions {
        &self.options
    }

    /// Simplified expressions of the derivative tensor `derivatives`, flattened row-major
    /// over the root shape followed by `d_i` copies of each operand shape.
    ///
    /// # Errors
    /// Returns `LawError::MultiIndex` if `derivatives` does not have one entry per operand.
    pub fn derivative_exprs(&self, derivatives: &[usize]) -> Result<Vec<Expr>, LawError> {
        if derivatives.len() != self.operands.len() {
            return Err(LawError::MultiIndex {
                derivatives: derivatives.to_vec(),
                operands: self.operands.len(),
            });
        }
        let mut exprs = self.components.clone();
        for (operand, d) in self.operands.iter().zip(derivatives) {
            let names = component_names(&operand.name, &operand.shape);
            for _ in 0..*d {
                exprs = exprs
                    .iter()
                    .flat_map(|e| names.iter().map(move |name| *e.derivative(name).simplify()))
                    .collect();
            }
        }
        Ok(exprs)
    }

    /// Kernel computing the derivative `derivatives` with the configured backend.
    ///
    /// # Errors
    /// Returns `LawError::MultiIndex` for a malformed multi-index and `LawError::Build` if
    /// JIT compilation fails.
    pub fn compile(&self, derivatives: &[usize]) -> Result<Kernel, LawError> {
        self.compile_with(derivatives, self.options.backend)
    }

    fn compile_with(&self, derivatives: &[usize], backend: Backend) -> Result<Kernel, LawError> {
        if let Some(kernel) = self.kernels.lock().get(derivatives) {
            return Ok(Arc::clone(kernel));
        }

        let exprs = self.derivative_exprs(derivatives)?;
        let num_inputs = self.variables.len();
        let function = match backend {
            Backend::Jit => build_combined_function(&exprs, num_inputs)?,
            Backend::Interpreted => interpret_combined_function(&exprs),
        };
        debug!(
            "compiled law {} derivative {:?} ({:?}, {} outputs)",
            self.name,
            derivatives,
            backend,
            exprs.len()
        );
        let kernel = self.point_kernel(function, exprs.len(), derivatives);
        Ok(Arc::clone(
            self.kernels
                .lock()
                .entry(derivatives.to_vec())
                .or_insert(kernel),
        ))
    }

    /// Wraps a per-point function into a kernel over all quadrature points.
    fn point_kernel(
        &self,
        function: CombinedJITFunction,
        num_outputs: usize,
        derivatives: &[usize],
    ) -> Kernel {
        let layout: Vec<(usize, usize)> = self
            .operands
            .iter()
            .map(|o| (o.offset, o.size()))
            .collect();
        let num_inputs = self.variables.len();
        let options = self.options;
        let derivatives = derivatives.to_vec();

        Arc::new(move |ops: &[&[f64]]| -> Result<KernelOutput, OperatorError> {
            if ops.len() != layout.len() {
                return Err(OperatorError::OperandCount {
                    derivatives: derivatives.clone(),
                    operands: ops.len(),
                });
            }
            let num_points = ops[0].len() / layout[0].1.max(1);
            for (i, (op, (_, size))) in ops.iter().zip(&layout).enumerate() {
                if op.len() != num_points * size {
                    return Err(OperatorError::OperandLength {
                        operand: i,
                        expected: num_points * size,
                        got: op.len(),
                    });
                }
            }

            let mut values = vec![0.0; num_points * num_outputs];
            if num_outputs == 0 {
                return Ok(values.into());
            }

            let evaluate_chunk = |first_point: usize, chunk: &mut [f64]| {
                let mut inputs = vec![0.0; num_inputs];
                for (k, out) in chunk.chunks_mut(num_outputs).enumerate() {
                    let point = first_point + k;
                    for (op, &(offset, size)) in ops.iter().zip(&layout) {
                        inputs[offset..offset + size]
                            .copy_from_slice(&op[point * size..(point + 1) * size]);
                    }
                    function(&inputs, out);
                }
            };

            let per_task = options.min_points_per_task.max(1);
            if options.parallel && num_points >= per_task {
                values
                    .par_chunks_mut(per_task * num_outputs)
                    .enumerate()
                    .for_each(|(task, chunk)| evaluate_chunk(task * per_task, chunk));
            } else {
                evaluate_chunk(0, &mut values);
            }
            Ok(values.into())
        })
    }
}

impl ExternalFunction for CompiledLaw {
    fn kernel(&self, derivatives: &[usize]) -> Option<Kernel> {
        if let Some(max) = self.max_order {
            if derivatives.iter().sum::<usize>() > max {
                return None;
            }
        }
        match self.compile(derivatives) {
            Ok(kernel) => Some(kernel),
            Err(LawError::Build(e)) => {
                warn!("law {}: JIT compilation failed ({e}), interpreting", self.name);
                self.compile_with(derivatives, Backend::Interpreted).ok()
            }
            Err(e) => {
                debug!("law {}: no kernel for {:?}: {e}", self.name, derivatives);
                None
            }
        }
    }
}
