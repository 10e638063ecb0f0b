//! External operator nodes.
//!
//! An [`ExternalOperator`] is a node of the form language whose value at each quadrature
//! point is computed by user code. Every node belongs to a family: the operator the user
//! declared (the root, multi-index all zero) together with all partial derivatives the
//! chain rule introduces while differentiating forms. Family members share operands, the
//! quadrature layout and the external function provider, and differ only in their
//! derivative multi-index.
//!
//! Each multi-index of a family owns exactly one quadrature buffer. Two nodes with the same
//! family and multi-index are equal and alias the same buffer, so a value written for one of
//! them is seen by every form that references the other.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::buffer::QuadratureFunction;
use crate::dispatch::ExternalFunction;
use crate::errors::OperatorError;
use crate::form::FormExpr;
use crate::space::{next_id, QuadratureSpace};
use crate::types::{shape_size, MultiIndex};

struct Family {
    id: usize,
    name: String,
    operands: Vec<FormExpr>,
    operand_shapes: Vec<Vec<usize>>,
    root_space: QuadratureSpace,
    provider: RwLock<Option<Arc<dyn ExternalFunction>>>,
    buffers: Mutex<HashMap<MultiIndex, QuadratureFunction>>,
}

impl fmt::Debug for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("operands", &self.operands.len())
            .field("operand_shapes", &self.operand_shapes)
            .field("root_shape", &self.root_space.value_shape())
            .field("has_provider", &self.provider.read().is_some())
            .finish()
    }
}

/// A symbolic node whose values and derivatives are supplied by external code.
#[derive(Debug, Clone)]
pub struct ExternalOperator {
    family: Arc<Family>,
    derivatives: MultiIndex,
    buffer: QuadratureFunction,
}

impl PartialEq for ExternalOperator {
    fn eq(&self, other: &Self) -> bool {
        self.family.id == other.family.id && self.derivatives == other.derivatives
    }
}

impl ExternalOperator {
    /// Declares an operator on `space`, taking its value shape from the space.
    ///
    /// # Errors
    /// Returns `OperatorError::Form` if an operand expression is ill-shaped.
    pub fn new(
        name: &str,
        operands: Vec<FormExpr>,
        space: &QuadratureSpace,
    ) -> Result<Self, OperatorError> {
        Self::with_shape(name, operands, space, space.value_shape())
    }

    /// Declares an operator with an explicit value shape.
    ///
    /// # Errors
    /// Returns `OperatorError::ShapeMismatch` if `value_shape` differs from the value shape
    /// of `space`, and `OperatorError::Form` if an operand expression is ill-shaped.
    pub fn with_shape(
        name: &str,
        operands: Vec<FormExpr>,
        space: &QuadratureSpace,
        value_shape: &[usize],
    ) -> Result<Self, OperatorError> {
        let buffer = QuadratureFunction::bind(space, value_shape)?;
        let operand_shapes = operands
            .iter()
            .map(FormExpr::shape)
            .collect::<Result<Vec<_>, _>>()?;
        let derivatives = vec![0; operands.len()];
        let family = Family {
            id: next_id(),
            name: name.to_string(),
            operands,
            operand_shapes,
            root_space: space.clone(),
            provider: RwLock::new(None),
            buffers: Mutex::new(HashMap::from([(derivatives.clone(), buffer.clone())])),
        };
        Ok(Self {
            family: Arc::new(family),
            derivatives,
            buffer,
        })
    }

    /// The member of this family with the given multi-index.
    ///
    /// # Errors
    /// Returns `OperatorError::OperandCount` if the multi-index does not have one entry per
    /// operand.
    pub fn derivative(&self, derivatives: &[usize]) -> Result<Self, OperatorError> {
        if derivatives.len() != self.family.operands.len() {
            return Err(OperatorError::OperandCount {
                derivatives: derivatives.to_vec(),
                operands: self.family.operands.len(),
            });
        }
        let space = self
            .family
            .root_space
            .with_value_shape(&self.value_shape_for(derivatives));
        let buffer = self
            .family
            .buffers
            .lock()
            .entry(derivatives.to_vec())
            .or_insert_with(|| QuadratureFunction::zeros(&space))
            .clone();
        Ok(Self {
            family: Arc::clone(&self.family),
            derivatives: derivatives.to_vec(),
            buffer,
        })
    }

    /// The partial derivative with respect to operand `operand`, or `None` if there is no
    /// such operand.
    pub fn partial(&self, operand: usize) -> Option<Self> {
        let mut derivatives = self.derivatives.clone();
        *derivatives.get_mut(operand)? += 1;
        self.derivative(&derivatives).ok()
    }

    /// The user-declared member of the family.
    pub fn root(&self) -> Self {
        Self {
            family: Arc::clone(&self.family),
            derivatives: vec![0; self.family.operands.len()],
            buffer: self.root_buffer(),
        }
    }

    fn root_buffer(&self) -> QuadratureFunction {
        let zero = vec![0; self.family.operands.len()];
        self.family
            .buffers
            .lock()
            .get(&zero)
            .cloned()
            .unwrap_or_else(|| self.buffer.clone())
    }

    /// Value shape of the family member with multi-index `derivatives`: the root shape
    /// followed, for every operand `i`, by `derivatives[i]` copies of the operand shape.
    pub fn value_shape_for(&self, derivatives: &[usize]) -> Vec<usize> {
        let mut shape = self.family.root_space.value_shape().to_vec();
        for (d, operand_shape) in derivatives.iter().zip(&self.family.operand_shapes) {
            for _ in 0..*d {
                shape.extend_from_slice(operand_shape);
            }
        }
        shape
    }

    /// First axis of this node's value that pairs with the newest derivative with respect to
    /// `operand`.
    pub fn contraction_axis(&self, operand: usize) -> usize {
        let mut axis = self.family.root_space.value_shape().len();
        for (i, (d, shape)) in self
            .derivatives
            .iter()
            .zip(&self.family.operand_shapes)
            .enumerate()
        {
            if i == operand {
                return axis + d.saturating_sub(1) * shape.len();
            }
            axis += d * shape.len();
        }
        axis
    }

    /// Attaches the provider to the whole family.
    pub fn set_external_function<P>(&self, provider: P)
    where
        P: ExternalFunction + 'static,
    {
        self.set_shared_external_function(Arc::new(provider));
    }

    pub fn set_shared_external_function(&self, provider: Arc<dyn ExternalFunction>) {
        *self.family.provider.write() = Some(provider);
    }

    pub fn external_function(&self) -> Option<Arc<dyn ExternalFunction>> {
        self.family.provider.read().clone()
    }

    pub fn name(&self) -> &str {
        &self.family.name
    }

    pub fn derivatives(&self) -> &[usize] {
        &self.derivatives
    }

    pub fn is_root(&self) -> bool {
        self.derivatives.iter().all(|&d| d == 0)
    }

    pub fn operands(&self) -> &[FormExpr] {
        &self.family.operands
    }

    pub fn operand_shapes(&self) -> &[Vec<usize>] {
        &self.family.operand_shapes
    }

    pub fn value_shape(&self) -> &[usize] {
        self.buffer.value_shape()
    }

    pub fn value_size(&self) -> usize {
        shape_size(self.value_shape())
    }

    /// Quadrature space of this node's values.
    pub fn space(&self) -> &QuadratureSpace {
        self.buffer.space()
    }

    pub fn buffer(&self) -> &QuadratureFunction {
        &self.buffer
    }

    pub fn num_points(&self) -> usize {
        self.family.root_space.num_points()
    }

    pub fn is_same_family(&self, other: &ExternalOperator) -> bool {
        Arc::ptr_eq(&self.family, &other.family)
    }
}

/// Attaches `provider` to the family of `node`.
pub fn set_external_function<P>(node: &ExternalOperator, provider: P)
where
    P: ExternalFunction + 'static,
{
    node.set_external_function(provider);
}

impl fmt::Display for ExternalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "{}", self.family.name)
        } else {
            write!(f, "{}{:?}", self.family.name, self.derivatives)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::KernelTable;
    use crate::form::grad;
    use crate::mesh::Mesh;
    use crate::space::{Function, FunctionSpace};

    fn heat_operator() -> ExternalOperator {
        let mesh = Arc::new(Mesh::unit_square(2, 2));
        let t = Function::new(&FunctionSpace::scalar(&mesh), "T");
        let space = QuadratureSpace::new(&mesh, 2, &[2]).unwrap();
        ExternalOperator::new(
            "q",
            vec![FormExpr::coefficient(&t), grad(FormExpr::coefficient(&t))],
            &space,
        )
        .unwrap()
    }

    #[test]
    fn test_declared_shape_mismatch() {
        let mesh = Arc::new(Mesh::unit_square(1, 1));
        let space = QuadratureSpace::new(&mesh, 1, &[2]).unwrap();
        let result = ExternalOperator::with_shape("q", vec![FormExpr::Scalar(1.0)], &space, &[3]);
        assert!(matches!(result, Err(OperatorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_derivative_shapes() {
        let q = heat_operator();
        assert_eq!(q.derivatives(), &[0, 0]);
        assert_eq!(q.value_shape(), &[2]);
        let dq_dt = q.partial(0).unwrap();
        assert_eq!(dq_dt.value_shape(), &[2]);
        let dq_dsigma = q.partial(1).unwrap();
        assert_eq!(dq_dsigma.value_shape(), &[2, 2]);
        let mixed = dq_dt.partial(1).unwrap();
        assert_eq!(mixed.derivatives(), &[1, 1]);
        assert_eq!(mixed.buffer().values().len(), 24 * 4);
        assert!(q.partial(2).is_none());
    }

    #[test]
    fn test_family_members_alias_buffers() {
        let q = heat_operator();
        let a = q.partial(1).unwrap();
        let b = q.derivative(&[0, 1]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.buffer(), b.buffer());
        assert_ne!(a, q);
        assert!(a.is_same_family(&q));
        assert_eq!(a.root(), q);
        assert_eq!(a.root().buffer(), q.buffer());
    }

    #[test]
    fn test_contraction_axis() {
        let q = heat_operator();
        assert_eq!(q.partial(0).unwrap().contraction_axis(0), 1);
        assert_eq!(q.partial(1).unwrap().contraction_axis(1), 1);
        let mixed = q.derivative(&[2, 1]).unwrap();
        assert_eq!(mixed.value_shape(), &[2, 2]);
        assert_eq!(mixed.contraction_axis(0), 1);
        assert_eq!(mixed.contraction_axis(1), 1);
        let second = q.derivative(&[0, 2]).unwrap();
        assert_eq!(second.value_shape(), &[2, 2, 2]);
        assert_eq!(second.contraction_axis(1), 2);
    }

    #[test]
    fn test_provider_is_shared_by_family() {
        let q = heat_operator();
        let dq = q.partial(0).unwrap();
        assert!(dq.external_function().is_none());
        q.set_external_function(KernelTable::new());
        assert!(dq.external_function().is_some());
    }

    #[test]
    fn test_operand_count() {
        let q = heat_operator();
        assert_eq!(
            q.derivative(&[1]),
            Err(OperatorError::OperandCount {
                derivatives: vec![1],
                operands: 2
            })
        );
    }
}
