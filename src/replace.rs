//! Bridge between symbolic forms and assembly.
//!
//! [`replace_external_operators`] swaps every external operator node of a form for its
//! quadrature buffer; [`evaluate_external_operators`] fills those buffers. The usual Newton
//! step is:
//!
//! ```text
//! let (j_numeric, nodes) = replace_external_operators(&j);
//! let operands = evaluate_operands(&nodes)?;
//! evaluate_external_operators(&nodes, &operands)?;
//! let matrix = assemble_matrix(&j_numeric)?;
//! ```

use log::debug;
use ndarray::ArrayD;

use crate::buffer::{pack, update};
use crate::dispatch::resolve;
use crate::errors::OperatorError;
use crate::external::ExternalOperator;
use crate::form::{Form, FormExpr};
use crate::operands::OperandValueSet;
use crate::types::Kernel;

/// Result of evaluating one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Values written to the node's buffer, shaped `(#points, *value_shape)`
    pub value: ArrayD<f64>,
    /// Auxiliary output of the kernel, if it produced any
    pub aux: Option<Vec<f64>>,
}

/// Replaces every external operator node by its buffer.
///
/// Returns the numeric form and the replaced nodes in first-occurrence order without
/// duplicates. A form without external operators comes back unchanged with no nodes.
pub fn replace_external_operators(form: &Form) -> (Form, Vec<ExternalOperator>) {
    let nodes = form.external_operators();
    let numeric = form.map(&mut |e| match e {
        FormExpr::External(node) => Some(FormExpr::QuadratureCoefficient(node.buffer().clone())),
        _ => None,
    });
    debug!("replaced {} external operators", nodes.len());
    (numeric, nodes)
}

/// Computes the values of `nodes` from `operands` and writes them into the node buffers.
///
/// All kernels are resolved before any of them runs, and all results are computed and
/// validated before any buffer is written. On error no buffer is modified.
///
/// # Errors
/// Returns `OperatorError::MissingExternalFunction` or `OperatorError::UnsupportedDerivative`
/// if a node cannot be resolved, `OperatorError::MissingOperand` if an operand was not
/// evaluated, `OperatorError::ResultShape` if a kernel returns the wrong number of values and
/// any error raised by a kernel itself.
pub fn evaluate_external_operators(
    nodes: &[ExternalOperator],
    operands: &OperandValueSet,
) -> Result<Vec<Evaluation>, OperatorError> {
    let kernels = nodes
        .iter()
        .map(resolve)
        .collect::<Result<Vec<Kernel>, _>>()?;

    let mut results = Vec::with_capacity(nodes.len());
    for (node, kernel) in nodes.iter().zip(&kernels) {
        let values = operands.for_node(node)?;
        let inputs: Vec<&[f64]> = values.iter().map(|v| v.as_slice()).collect();
        let output = kernel(&inputs)?;
        pack(node, &output.value)?;
        results.push(output);
    }

    nodes
        .iter()
        .zip(results)
        .map(|(node, output)| {
            Ok(Evaluation {
                value: update(node, &output.value)?,
                aux: output.aux,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::KernelTable;
    use crate::form::{grad, inner, test_function, Measure};
    use crate::mesh::Mesh;
    use crate::operands::evaluate_operands;
    use crate::space::{Function, FunctionSpace, QuadratureSpace};
    use crate::types::kernel;

    struct Setup {
        space: FunctionSpace,
        t: Function,
        qspace: QuadratureSpace,
        dx: Measure,
    }

    fn setup() -> Setup {
        let mesh = Arc::new(Mesh::unit_square(2, 2));
        let space = FunctionSpace::scalar(&mesh);
        let t = Function::new(&space, "T");
        t.interpolate_scalar(|x| x[0] + x[1]).unwrap();
        Setup {
            qspace: QuadratureSpace::new(&mesh, 2, &[2]).unwrap(),
            space,
            t,
            dx: Measure::new(2).unwrap(),
        }
    }

    #[test]
    fn test_replacement_is_idempotent() {
        let s = setup();
        let sigma = grad(FormExpr::coefficient(&s.t));
        let q = ExternalOperator::new("q", vec![sigma], &s.qspace).unwrap();
        let v = grad(test_function(&s.space));
        let form = inner(FormExpr::from(&q), v.clone()) * &s.dx
            + inner(FormExpr::from(&q) * 2.0, v) * &s.dx;

        let (numeric, nodes) = replace_external_operators(&form);
        assert_eq!(nodes, vec![q.clone()]);
        assert!(numeric.external_operators().is_empty());

        let (again, none) = replace_external_operators(&numeric);
        assert!(none.is_empty());
        assert_eq!(again, numeric);
    }

    #[test]
    fn test_scalar_root_with_vector_operand() {
        // N(σ) = |σ|², dN/dσ = 2σ
        let s = setup();
        let scalar_space = s.qspace.with_value_shape(&[]);
        let sigma = grad(FormExpr::coefficient(&s.t));
        let n = ExternalOperator::new("N", vec![sigma], &scalar_space).unwrap();
        n.set_external_function(
            KernelTable::new()
                .with(
                    &[0],
                    kernel(|ops: &[&[f64]]| {
                        Ok(ops[0].chunks(2).map(|g| g[0] * g[0] + g[1] * g[1]).collect::<Vec<_>>())
                    }),
                )
                .with(
                    &[1],
                    kernel(|ops: &[&[f64]]| Ok(ops[0].iter().map(|g| 2.0 * g).collect::<Vec<_>>())),
                ),
        );
        let dn = n.partial(0).unwrap();
        let nodes = vec![n.clone(), dn.clone()];
        let operands = evaluate_operands(&nodes).unwrap();
        let results = evaluate_external_operators(&nodes, &operands).unwrap();

        let points = s.qspace.num_points();
        assert_eq!(results[0].value.shape(), &[points]);
        assert_eq!(results[1].value.shape(), &[points, 2]);
        assert_eq!(dn.buffer().values().len(), points * 2);
        assert!((n.buffer().point_values(0)[0] - 2.0).abs() < 1e-12);
        assert_eq!(dn.buffer().point_values(3), vec![2.0, 2.0]);
    }

    #[test]
    fn test_unsupported_derivative_writes_nothing() {
        let s = setup();
        let t = FormExpr::coefficient(&s.t);
        let q = ExternalOperator::new("q", vec![t], &s.qspace).unwrap();
        q.set_external_function(
            KernelTable::new().with(&[0], kernel(|ops: &[&[f64]]| Ok(vec![1.0; 2 * ops[0].len()]))),
        );
        let dq = q.partial(0).unwrap();
        let nodes = vec![q.clone(), dq];
        let operands = evaluate_operands(&nodes).unwrap();
        let err = evaluate_external_operators(&nodes, &operands).unwrap_err();
        assert_eq!(
            err,
            OperatorError::UnsupportedDerivative {
                operator: "q".to_string(),
                derivatives: vec![1],
            }
        );
        assert!(q.buffer().values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_bad_result_length_writes_nothing() {
        let s = setup();
        let t = FormExpr::coefficient(&s.t);
        let q = ExternalOperator::new("q", vec![t.clone()], &s.qspace).unwrap();
        let p = ExternalOperator::new("p", vec![t], &s.qspace).unwrap();
        q.set_external_function(
            KernelTable::new().with(&[0], kernel(|ops: &[&[f64]]| Ok(vec![1.0; 2 * ops[0].len()]))),
        );
        p.set_external_function(
            KernelTable::new().with(&[0], kernel(|ops: &[&[f64]]| Ok(vec![1.0; ops[0].len()]))),
        );
        let nodes = vec![q.clone(), p.clone()];
        let operands = evaluate_operands(&nodes).unwrap();
        let err = evaluate_external_operators(&nodes, &operands).unwrap_err();
        assert!(matches!(err, OperatorError::ResultShape { .. }));
        assert!(q.buffer().values().iter().all(|v| *v == 0.0));
        assert!(p.buffer().values().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_buffer_update_reaches_numeric_form() {
        let s = setup();
        let scalar_space = s.qspace.with_value_shape(&[]);
        let n = ExternalOperator::new("N", vec![FormExpr::coefficient(&s.t)], &scalar_space).unwrap();
        n.set_external_function(
            KernelTable::new().with(&[0], kernel(|ops: &[&[f64]]| Ok(vec![3.0; ops[0].len()]))),
        );
        let form = FormExpr::from(&n) * test_function(&s.space) * &s.dx;
        let (numeric, nodes) = replace_external_operators(&form);
        let before = crate::assembly::assemble_vector(&numeric).unwrap();
        assert_eq!(before.sum(), 0.0);

        let operands = evaluate_operands(&nodes).unwrap();
        evaluate_external_operators(&nodes, &operands).unwrap();
        let after = crate::assembly::assemble_vector(&numeric).unwrap();
        assert!((after.sum() - 3.0).abs() < 1e-12);
    }
}
