//! Triangle meshes, reference quadrature rules and the linear Lagrange basis.
//!
//! This is the minimal finite element infrastructure the external operator machinery runs
//! on: it supplies quadrature points, cell-to-vertex maps and basis function values.

use nalgebra::{Matrix2, Vector2};

use crate::errors::FormError;

/// A conforming triangulation of a planar domain.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    vertices: Vec<[f64; 2]>,
    cells: Vec<[usize; 3]>,
}

impl Mesh {
    /// Creates a mesh from raw vertex coordinates and counter-clockwise triangles.
    pub fn new(vertices: Vec<[f64; 2]>, cells: Vec<[usize; 3]>) -> Self {
        Self { vertices, cells }
    }

    /// Structured triangulation of the unit square with `nx × ny` squares, each split
    /// along its diagonal into two triangles.
    pub fn unit_square(nx: usize, ny: usize) -> Self {
        let mut vertices = Vec::with_capacity((nx + 1) * (ny + 1));
        for j in 0..=ny {
            for i in 0..=nx {
                vertices.push([i as f64 / nx as f64, j as f64 / ny as f64]);
            }
        }

        let vertex = |i: usize, j: usize| j * (nx + 1) + i;
        let mut cells = Vec::with_capacity(2 * nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                let (v00, v10) = (vertex(i, j), vertex(i + 1, j));
                let (v01, v11) = (vertex(i, j + 1), vertex(i + 1, j + 1));
                cells.push([v00, v10, v11]);
                cells.push([v00, v11, v01]);
            }
        }

        Self { vertices, cells }
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.vertices
    }

    pub fn cells(&self) -> &[[usize; 3]] {
        &self.cells
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Geometric dimension of the mesh.
    pub fn gdim(&self) -> usize {
        2
    }

    /// Affine map of a cell: origin and Jacobian of the reference-to-physical map.
    pub fn cell_geometry(&self, cell: usize) -> CellGeometry {
        let [a, b, c] = self.cells[cell].map(|v| Vector2::from(self.vertices[v]));
        CellGeometry {
            origin: a,
            jacobian: Matrix2::from_columns(&[b - a, c - a]),
        }
    }
}

/// Affine geometry of a single triangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellGeometry {
    pub origin: Vector2<f64>,
    pub jacobian: Matrix2<f64>,
}

impl CellGeometry {
    /// Maps a reference point to physical coordinates.
    pub fn map_point(&self, xi: &[f64; 2]) -> [f64; 2] {
        let x = self.origin + self.jacobian * Vector2::from(*xi);
        [x[0], x[1]]
    }

    pub fn abs_det(&self) -> f64 {
        self.jacobian.determinant().abs()
    }

    /// Values and physical gradients of the three P1 basis functions at a reference point.
    pub fn p1_basis(&self, xi: &[f64; 2]) -> P1Basis {
        let values = [1.0 - xi[0] - xi[1], xi[0], xi[1]];
        let reference = [
            Vector2::new(-1.0, -1.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, 1.0),
        ];
        // Degenerate cells yield zero gradients rather than NaN
        let inverse_transpose = self
            .jacobian
            .try_inverse()
            .map(|inv| inv.transpose())
            .unwrap_or_else(Matrix2::zeros);
        let gradients = reference.map(|g| {
            let g = inverse_transpose * g;
            [g[0], g[1]]
        });
        P1Basis { values, gradients }
    }
}

/// Linear Lagrange basis evaluated at one point of one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct P1Basis {
    pub values: [f64; 3],
    pub gradients: [[f64; 2]; 3],
}

/// Quadrature rule on the reference triangle `{(ξ, η) : ξ, η ≥ 0, ξ + η ≤ 1}`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadratureRule {
    degree: usize,
    points: Vec<[f64; 2]>,
    weights: Vec<f64>,
}

impl QuadratureRule {
    /// Returns the lowest-order symmetric rule that integrates polynomials of `degree` exactly.
    pub fn triangle(degree: usize) -> Result<Self, FormError> {
        let (points, weights) = match degree {
            0 | 1 => (vec![[1.0 / 3.0, 1.0 / 3.0]], vec![0.5]),
            2 => (
                vec![
                    [1.0 / 6.0, 1.0 / 6.0],
                    [2.0 / 3.0, 1.0 / 6.0],
                    [1.0 / 6.0, 2.0 / 3.0],
                ],
                vec![1.0 / 6.0; 3],
            ),
            _ => return Err(FormError::UnsupportedQuadratureDegree(degree)),
        };
        Ok(Self {
            degree,
            points,
            weights,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of points per cell.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
