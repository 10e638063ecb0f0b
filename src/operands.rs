//! Evaluation of external operator operands at quadrature points.
//!
//! [`evaluate_operands`] evaluates every distinct operand expression of a batch of nodes
//! exactly once. Nodes of one family, and unrelated nodes that happen to share an operand,
//! receive the same array.

use std::sync::Arc;

use log::debug;
use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;

use crate::errors::{FormError, OperatorError};
use crate::external::ExternalOperator;
use crate::form::FormExpr;
use crate::interpret::{evaluate, PointContext};
use crate::space::QuadratureSpace;

/// Evaluates a form expression at every point of a quadrature space.
pub trait QuadratureEvaluator {
    /// Returns a flat array laid out as `(#points, *space.value_shape())`.
    fn evaluate(&self, expr: &FormExpr, space: &QuadratureSpace) -> Result<Vec<f64>, FormError>;
}

/// Interpolates expressions pointwise, in parallel over cells.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointwiseEvaluator;

impl QuadratureEvaluator for PointwiseEvaluator {
    fn evaluate(&self, expr: &FormExpr, space: &QuadratureSpace) -> Result<Vec<f64>, FormError> {
        let shape = expr.shape()?;
        if shape != space.value_shape() {
            return Err(FormError::IncompatibleShapes {
                operation: "interpolate",
                left: shape,
                right: space.value_shape().to_vec(),
            });
        }
        let mesh = space.mesh();
        let rule = space.rule();
        let cells = (0..mesh.num_cells())
            .into_par_iter()
            .map(|cell| {
                let geometry = mesh.cell_geometry(cell);
                let mut values = Vec::with_capacity(rule.len() * space.value_size());
                for (q, xi) in rule.points().iter().enumerate() {
                    let basis = geometry.p1_basis(xi);
                    let ctx = PointContext {
                        mesh,
                        rule,
                        cell,
                        point: cell * rule.len() + q,
                        x: geometry.map_point(xi),
                        basis: &basis,
                        test: None,
                        trial: None,
                    };
                    values.extend(evaluate(expr, &ctx)?.iter().copied());
                }
                Ok(values)
            })
            .collect::<Result<Vec<_>, FormError>>()?;
        Ok(cells.concat())
    }
}

#[derive(Debug, Clone)]
struct OperandEntry {
    expr: FormExpr,
    space: QuadratureSpace,
    values: Arc<Vec<f64>>,
}

/// Evaluated operands of one evaluation round.
#[derive(Debug, Clone, Default)]
pub struct OperandValueSet {
    entries: Vec<OperandEntry>,
}

impl OperandValueSet {
    /// Values of `expr` on `space`, if evaluated.
    pub fn get(&self, expr: &FormExpr, space: &QuadratureSpace) -> Option<Arc<Vec<f64>>> {
        self.entries
            .iter()
            .find(|e| e.expr == *expr && e.space == *space)
            .map(|e| Arc::clone(&e.values))
    }

    /// Values of `expr` on `space` shaped `(#points, *value_shape)`.
    pub fn get_array(&self, expr: &FormExpr, space: &QuadratureSpace) -> Option<ArrayD<f64>> {
        let values = self.get(expr, space)?;
        let mut shape = vec![space.num_points()];
        shape.extend_from_slice(space.value_shape());
        ArrayD::from_shape_vec(IxDyn(&shape), values.to_vec()).ok()
    }

    /// The operand arrays of `node`, in declared operand order.
    pub fn for_node(&self, node: &ExternalOperator) -> Result<Vec<Arc<Vec<f64>>>, OperatorError> {
        node.operands()
            .iter()
            .zip(node.operand_shapes())
            .map(|(expr, shape)| {
                self.get(expr, &node.space().with_value_shape(shape))
                    .ok_or_else(|| OperatorError::MissingOperand(expr.to_string()))
            })
            .collect()
    }

    /// Number of distinct evaluated expressions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Evaluates the operands of `nodes` by pointwise interpolation.
pub fn evaluate_operands(nodes: &[ExternalOperator]) -> Result<OperandValueSet, OperatorError> {
    evaluate_operands_with(nodes, &PointwiseEvaluator)
}

/// Evaluates every distinct operand of `nodes` once with `evaluator`.
pub fn evaluate_operands_with<E>(
    nodes: &[ExternalOperator],
    evaluator: &E,
) -> Result<OperandValueSet, OperatorError>
where
    E: QuadratureEvaluator + ?Sized,
{
    let mut set = OperandValueSet::default();
    for node in nodes {
        for (expr, shape) in node.operands().iter().zip(node.operand_shapes()) {
            let space = node.space().with_value_shape(shape);
            if set.get(expr, &space).is_some() {
                debug!("operand {} of {} already evaluated", expr, node);
                continue;
            }
            let values = evaluator.evaluate(expr, &space)?;
            set.entries.push(OperandEntry {
                expr: expr.clone(),
                space,
                values: Arc::new(values),
            });
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::form::grad;
    use crate::mesh::Mesh;
    use crate::space::{Function, FunctionSpace};

    struct CountingEvaluator {
        calls: AtomicUsize,
    }

    impl QuadratureEvaluator for CountingEvaluator {
        fn evaluate(&self, expr: &FormExpr, space: &QuadratureSpace) -> Result<Vec<f64>, FormError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PointwiseEvaluator.evaluate(expr, space)
        }
    }

    fn setup() -> (Function, QuadratureSpace) {
        let mesh = Arc::new(Mesh::unit_square(2, 2));
        let t = Function::new(&FunctionSpace::scalar(&mesh), "T");
        t.interpolate_scalar(|x| x[0] * x[0] + x[1]).unwrap();
        let space = QuadratureSpace::new(&mesh, 2, &[2]).unwrap();
        (t, space)
    }

    #[test]
    fn test_shared_operands_are_evaluated_once() {
        let (t, space) = setup();
        let operands = vec![FormExpr::coefficient(&t), grad(FormExpr::coefficient(&t))];
        let q = ExternalOperator::new("q", operands.clone(), &space).unwrap();
        let p = ExternalOperator::new("p", operands, &space).unwrap();
        let nodes = vec![q.clone(), q.partial(0).unwrap(), q.partial(1).unwrap(), p.clone()];

        let evaluator = CountingEvaluator {
            calls: AtomicUsize::new(0),
        };
        let set = evaluate_operands_with(&nodes, &evaluator).unwrap();
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 2);
        assert_eq!(set.len(), 2);

        let for_q = set.for_node(&q).unwrap();
        let for_p = set.for_node(&p).unwrap();
        assert!(Arc::ptr_eq(&for_q[0], &for_p[0]));
        assert!(Arc::ptr_eq(&for_q[1], &for_p[1]));
        assert_eq!(for_q[0].len(), space.num_points());
        assert_eq!(for_q[1].len(), 2 * space.num_points());
    }

    #[test]
    fn test_operand_values_follow_field() {
        let (t, space) = setup();
        let q = ExternalOperator::new("q", vec![grad(FormExpr::coefficient(&t))], &space).unwrap();
        let set = evaluate_operands(&[q.clone()]).unwrap();
        let sigma = set
            .get_array(&q.operands()[0], &space)
            .unwrap();
        assert_eq!(sigma.shape(), &[space.num_points(), 2]);
        // d/dy (x² + y) = 1 exactly for the P1 interpolant
        for row in sigma.outer_iter() {
            assert!((row[1] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_missing_operand() {
        let (t, space) = setup();
        let q = ExternalOperator::new("q", vec![FormExpr::coefficient(&t)], &space).unwrap();
        let set = OperandValueSet::default();
        assert_eq!(
            set.for_node(&q),
            Err(OperatorError::MissingOperand("T".to_string()))
        );
    }
}
