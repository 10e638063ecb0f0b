//! Quadrature buffers: the numeric stand-ins for external operator nodes.
//!
//! A [`QuadratureFunction`] is a flat array of `#points × value_size` entries living on a
//! [`QuadratureSpace`]. Clones are handles to the same storage, so a buffer written through
//! one handle is observed by every form that references it. Nothing here decides when a
//! buffer is recomputed.

use std::sync::Arc;

use log::trace;
use ndarray::{ArrayD, IxDyn};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::errors::OperatorError;
use crate::external::ExternalOperator;
use crate::space::{next_id, QuadratureSpace};

/// Flat per-point values bound to a quadrature space.
#[derive(Debug, Clone)]
pub struct QuadratureFunction {
    id: usize,
    space: QuadratureSpace,
    values: Arc<RwLock<Vec<f64>>>,
}

impl PartialEq for QuadratureFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }
}

impl QuadratureFunction {
    /// Allocates a zeroed buffer for values of `declared_shape` on `space`.
    ///
    /// # Errors
    /// Returns `OperatorError::ShapeMismatch` if the declared shape differs from the value
    /// shape of the space.
    pub fn bind(space: &QuadratureSpace, declared_shape: &[usize]) -> Result<Self, OperatorError> {
        if space.value_shape() != declared_shape {
            return Err(OperatorError::ShapeMismatch {
                declared: declared_shape.to_vec(),
                actual: space.value_shape().to_vec(),
            });
        }
        Ok(Self::zeros(space))
    }

    /// Allocates a zeroed buffer with the value shape of `space`.
    pub fn zeros(space: &QuadratureSpace) -> Self {
        Self {
            id: next_id(),
            space: space.clone(),
            values: Arc::new(RwLock::new(vec![0.0; space.buffer_len()])),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn space(&self) -> &QuadratureSpace {
        &self.space
    }

    pub fn value_shape(&self) -> &[usize] {
        self.space.value_shape()
    }

    pub fn values(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.values.read()
    }

    /// Values at one global quadrature point.
    pub fn point_values(&self, point: usize) -> Vec<f64> {
        let size = self.space.value_size();
        self.values.read()[point * size..(point + 1) * size].to_vec()
    }

    /// Current contents reshaped to `(#points, *value_shape)`.
    ///
    /// # Errors
    /// Returns `OperatorError::ResultShape` if the stored values do not fill that shape.
    pub fn to_array(&self) -> Result<ArrayD<f64>, OperatorError> {
        let mut shape = vec![self.space.num_points()];
        shape.extend_from_slice(self.space.value_shape());
        let values = self.values.read().clone();
        let got = values.len();
        ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| OperatorError::ResultShape {
            operator: format!("buffer {}", self.id),
            expected: self.space.buffer_len(),
            got,
        })
    }

    /// Overwrites the buffer in place.
    ///
    /// The length is validated before the lock is taken, so a rejected write leaves the
    /// previous contents untouched.
    pub fn write(&self, values: &[f64]) -> Result<(), OperatorError> {
        let expected = self.space.buffer_len();
        if values.len() != expected {
            return Err(OperatorError::ResultShape {
                operator: format!("buffer {}", self.id),
                expected,
                got: values.len(),
            });
        }
        self.values.write().copy_from_slice(values);
        Ok(())
    }
}

/// Reshapes a raw kernel result to `(#points, *value_shape)` of `node`.
///
/// # Errors
/// Returns `OperatorError::ResultShape` if `raw` does not hold one value of the node's shape
/// per quadrature point.
pub fn pack(node: &ExternalOperator, raw: &[f64]) -> Result<ArrayD<f64>, OperatorError> {
    let mut shape = vec![node.num_points()];
    shape.extend_from_slice(node.value_shape());
    let expected = node.num_points() * node.value_size();
    if raw.len() != expected {
        return Err(OperatorError::ResultShape {
            operator: node.to_string(),
            expected,
            got: raw.len(),
        });
    }
    ArrayD::from_shape_vec(IxDyn(&shape), raw.to_vec()).map_err(|_| OperatorError::ResultShape {
        operator: node.to_string(),
        expected,
        got: raw.len(),
    })
}

/// Validates `raw` and writes it into the buffer of `node`, returning the packed values.
///
/// Every form holding the node, or its replacement coefficient, observes the new values.
pub fn update(node: &ExternalOperator, raw: &[f64]) -> Result<ArrayD<f64>, OperatorError> {
    let packed = pack(node, raw)?;
    node.buffer().write(raw)?;
    trace!("updated buffer of {} ({} values)", node, raw.len());
    Ok(packed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::FormExpr;
    use crate::mesh::Mesh;

    fn space(shape: &[usize]) -> QuadratureSpace {
        QuadratureSpace::new(&Arc::new(Mesh::unit_square(1, 1)), 2, shape).unwrap()
    }

    #[test]
    fn test_bind_allocates_points_times_shape() {
        let buffer = QuadratureFunction::bind(&space(&[2]), &[2]).unwrap();
        assert_eq!(buffer.values().len(), 6 * 2);
    }

    #[test]
    fn test_bind_shape_mismatch() {
        let result = QuadratureFunction::bind(&space(&[2]), &[3]);
        assert_eq!(
            result,
            Err(OperatorError::ShapeMismatch {
                declared: vec![3],
                actual: vec![2],
            })
        );
    }

    #[test]
    fn test_write_is_shared_between_handles() {
        let buffer = QuadratureFunction::zeros(&space(&[]));
        let alias = buffer.clone();
        buffer.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(alias.point_values(4), vec![5.0]);
        assert_eq!(alias, buffer);
    }

    #[test]
    fn test_rejected_write_keeps_values() {
        let buffer = QuadratureFunction::zeros(&space(&[]));
        buffer.write(&[1.0; 6]).unwrap();
        assert!(buffer.write(&[2.0; 5]).is_err());
        assert_eq!(*buffer.values(), vec![1.0; 6]);
    }

    #[test]
    fn test_update_node() {
        let s = space(&[2]);
        let node = ExternalOperator::new("q", vec![FormExpr::Scalar(1.0)], &s).unwrap();
        let raw: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let packed = update(&node, &raw).unwrap();
        assert_eq!(packed.shape(), &[6, 2]);
        assert_eq!(node.buffer().point_values(5), vec![10.0, 11.0]);

        let err = update(&node, &raw[..11]).unwrap_err();
        assert_eq!(
            err,
            OperatorError::ResultShape {
                operator: "q".to_string(),
                expected: 12,
                got: 11
            }
        );
        assert_eq!(node.buffer().point_values(5), vec![10.0, 11.0]);
    }

    #[test]
    fn test_to_array_shape() {
        let buffer = QuadratureFunction::zeros(&space(&[2, 2]));
        let array = buffer.to_array().unwrap();
        assert_eq!(array.shape(), &[6, 2, 2]);
    }
}
