//! Function spaces, finite element functions and quadrature spaces.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::errors::FormError;
use crate::mesh::{Mesh, QuadratureRule};
use crate::types::shape_size;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Hands out process-wide unique identities for spaces, functions and buffers.
pub(crate) fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Continuous linear Lagrange space with scalar or vector values.
///
/// Degrees of freedom are blocked per vertex: dof `vertex * value_size + component`.
#[derive(Debug, Clone)]
pub struct FunctionSpace {
    id: usize,
    mesh: Arc<Mesh>,
    value_shape: Vec<usize>,
}

impl PartialEq for FunctionSpace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl FunctionSpace {
    /// Scalar-valued P1 space.
    pub fn scalar(mesh: &Arc<Mesh>) -> Self {
        Self::with_value_shape(mesh, Vec::new())
    }

    /// Vector-valued P1 space with `components` entries per vertex.
    pub fn vector(mesh: &Arc<Mesh>, components: usize) -> Self {
        Self::with_value_shape(mesh, vec![components])
    }

    fn with_value_shape(mesh: &Arc<Mesh>, value_shape: Vec<usize>) -> Self {
        Self {
            id: next_id(),
            mesh: Arc::clone(mesh),
            value_shape,
        }
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn value_shape(&self) -> &[usize] {
        &self.value_shape
    }

    pub fn value_size(&self) -> usize {
        shape_size(&self.value_shape)
    }

    pub fn num_dofs(&self) -> usize {
        self.mesh.num_vertices() * self.value_size()
    }

    /// Number of local basis functions per cell.
    pub fn local_dimension(&self) -> usize {
        3 * self.value_size()
    }

    /// Global dofs of a cell in local basis order (vertex-major, component-minor).
    pub fn cell_dofs(&self, cell: usize) -> Vec<usize> {
        let bs = self.value_size();
        self.mesh.cells()[cell]
            .iter()
            .flat_map(|&v| (0..bs).map(move |c| v * bs + c))
            .collect()
    }
}

/// A finite element function: a dof vector on a [`FunctionSpace`].
///
/// Clones share the same dof storage and compare equal; two separately created functions
/// never compare equal, even with identical values.
#[derive(Debug, Clone)]
pub struct Function {
    id: usize,
    name: String,
    space: FunctionSpace,
    values: Arc<RwLock<Vec<f64>>>,
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Function {
    pub fn new(space: &FunctionSpace, name: &str) -> Self {
        Self {
            id: next_id(),
            name: name.to_string(),
            space: space.clone(),
            values: Arc::new(RwLock::new(vec![0.0; space.num_dofs()])),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> &FunctionSpace {
        &self.space
    }

    pub fn values(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.values.read()
    }

    /// Overwrites all dofs with a constant.
    pub fn fill(&self, value: f64) {
        self.values.write().iter_mut().for_each(|v| *v = value);
    }

    /// Adds `alpha * update` to the dof vector.
    ///
    /// # Errors
    /// Returns `FormError::InterpolationSize` if `update` does not hold one value per dof.
    pub fn axpy(&self, alpha: f64, update: &[f64]) -> Result<(), FormError> {
        let mut values = self.values.write();
        if update.len() != values.len() {
            return Err(FormError::InterpolationSize {
                expected: values.len(),
                got: update.len(),
            });
        }
        values
            .iter_mut()
            .zip(update)
            .for_each(|(v, u)| *v += alpha * u);
        Ok(())
    }

    /// Nodal interpolation of a closure returning `value_size` entries per point.
    pub fn interpolate<F>(&self, f: F) -> Result<(), FormError>
    where
        F: Fn([f64; 2]) -> Vec<f64>,
    {
        let bs = self.space.value_size();
        let mut values = Vec::with_capacity(self.space.num_dofs());
        for x in self.space.mesh().vertices() {
            let v = f(*x);
            if v.len() != bs {
                return Err(FormError::InterpolationSize {
                    expected: bs,
                    got: v.len(),
                });
            }
            values.extend(v);
        }
        *self.values.write() = values;
        Ok(())
    }

    /// Nodal interpolation of a scalar closure.
    pub fn interpolate_scalar<F>(&self, f: F) -> Result<(), FormError>
    where
        F: Fn([f64; 2]) -> f64,
    {
        self.interpolate(|x| vec![f(x)])
    }
}

/// The discrete space on which external operators live: a fixed value shape attached to
/// every quadrature point of every cell.
///
/// Global point numbering is `cell * points_per_cell + local_point`, identical for all
/// spaces sharing a mesh and rule.
#[derive(Debug, Clone)]
pub struct QuadratureSpace {
    mesh: Arc<Mesh>,
    rule: Arc<QuadratureRule>,
    value_shape: Vec<usize>,
}

impl PartialEq for QuadratureSpace {
    fn eq(&self, other: &Self) -> bool {
        self.same_points(other) && self.value_shape == other.value_shape
    }
}

impl QuadratureSpace {
    pub fn new(mesh: &Arc<Mesh>, degree: usize, value_shape: &[usize]) -> Result<Self, FormError> {
        Ok(Self {
            mesh: Arc::clone(mesh),
            rule: Arc::new(QuadratureRule::triangle(degree)?),
            value_shape: value_shape.to_vec(),
        })
    }

    /// Same points, different value shape.
    pub fn with_value_shape(&self, value_shape: &[usize]) -> Self {
        Self {
            mesh: Arc::clone(&self.mesh),
            rule: Arc::clone(&self.rule),
            value_shape: value_shape.to_vec(),
        }
    }

    /// Whether both spaces share mesh and quadrature rule, hence point layout.
    pub fn same_points(&self, other: &QuadratureSpace) -> bool {
        Arc::ptr_eq(&self.mesh, &other.mesh) && *self.rule == *other.rule
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn rule(&self) -> &Arc<QuadratureRule> {
        &self.rule
    }

    pub fn value_shape(&self) -> &[usize] {
        &self.value_shape
    }

    pub fn value_size(&self) -> usize {
        shape_size(&self.value_shape)
    }

    pub fn points_per_cell(&self) -> usize {
        self.rule.len()
    }

    pub fn num_points(&self) -> usize {
        self.mesh.num_cells() * self.rule.len()
    }

    /// Length of a flat buffer holding one value per point.
    pub fn buffer_len(&self) -> usize {
        self.num_points() * self.value_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_space_dofs() {
        let mesh = Arc::new(Mesh::unit_square(1, 1));
        let space = FunctionSpace::vector(&mesh, 2);
        assert_eq!(space.num_dofs(), 8);
        assert_eq!(space.cell_dofs(0), vec![0, 1, 2, 3, 6, 7]);
    }

    #[test]
    fn test_interpolate() {
        let mesh = Arc::new(Mesh::unit_square(2, 2));
        let space = FunctionSpace::scalar(&mesh);
        let u = Function::new(&space, "u");
        u.interpolate_scalar(|x| x[0] + 2.0 * x[1]).unwrap();
        assert_eq!(u.values()[4], 1.5);
    }

    #[test]
    fn test_interpolate_wrong_size() {
        let mesh = Arc::new(Mesh::unit_square(1, 1));
        let u = Function::new(&FunctionSpace::vector(&mesh, 2), "u");
        let result = u.interpolate(|x| vec![x[0]]);
        assert_eq!(
            result,
            Err(FormError::InterpolationSize {
                expected: 2,
                got: 1
            })
        );
    }

    #[test]
    fn test_axpy_checks_length() {
        let mesh = Arc::new(Mesh::unit_square(1, 1));
        let u = Function::new(&FunctionSpace::scalar(&mesh), "u");
        u.fill(1.0);
        u.axpy(2.0, &[1.0, 0.0, 0.0, 0.5]).unwrap();
        assert_eq!(*u.values(), vec![3.0, 1.0, 1.0, 2.0]);
        assert_eq!(
            u.axpy(1.0, &[1.0; 3]),
            Err(FormError::InterpolationSize {
                expected: 4,
                got: 3
            })
        );
        assert_eq!(*u.values(), vec![3.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_function_identity() {
        let mesh = Arc::new(Mesh::unit_square(1, 1));
        let space = FunctionSpace::scalar(&mesh);
        let u = Function::new(&space, "u");
        let v = Function::new(&space, "u");
        assert_eq!(u, u.clone());
        assert_ne!(u, v);
    }

    #[test]
    fn test_quadrature_space_layout() {
        let mesh = Arc::new(Mesh::unit_square(3, 3));
        let space = QuadratureSpace::new(&mesh, 2, &[2]).unwrap();
        assert_eq!(space.num_points(), 54);
        assert_eq!(space.buffer_len(), 108);
        let tensor = space.with_value_shape(&[2, 2]);
        assert!(tensor.same_points(&space));
        assert_ne!(tensor, space);
    }
}
