//! Dense global assembly of functionals, linear forms and bilinear forms.
//!
//! Element contributions are computed in parallel over cells and scattered serially into the
//! global vector or matrix. Argument 0 indexes rows, argument 1 indexes columns.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::errors::FormError;
use crate::form::{Argument, Form, FormExpr, Integral};
use crate::interpret::{evaluate, PointContext};
use crate::mesh::Mesh;

/// Mesh the form is defined on, taken from the first function, argument or buffer found.
fn form_mesh(form: &Form) -> Result<Arc<Mesh>, FormError> {
    let mut mesh = None;
    for integral in form.integrals() {
        integral.integrand.visit(&mut |e| {
            if mesh.is_some() {
                return;
            }
            mesh = match e {
                FormExpr::Coefficient(f) => Some(Arc::clone(f.space().mesh())),
                FormExpr::Argument(a) => Some(Arc::clone(a.space.mesh())),
                FormExpr::QuadratureCoefficient(q) => Some(Arc::clone(q.space().mesh())),
                FormExpr::External(node) => Some(Arc::clone(node.space().mesh())),
                _ => None,
            };
        });
    }
    mesh.ok_or(FormError::UndefinedDomain)
}

fn check_integrand(integral: &Integral) -> Result<(), FormError> {
    let shape = integral.integrand.shape()?;
    if !shape.is_empty() {
        return Err(FormError::ExpectedScalar {
            operation: "integrand",
            shape,
        });
    }
    Ok(())
}

fn has_argument(integral: &Integral, number: usize) -> bool {
    integral
        .integrand
        .arguments()
        .iter()
        .any(|a| a.number == number)
}

/// Integrates `integral` over one cell, calling `sink` with the weighted integrand for every
/// combination of bound basis functions.
fn integrate_cell<F>(
    mesh: &Arc<Mesh>,
    integral: &Integral,
    cell: usize,
    test_dim: usize,
    trial_dim: usize,
    mut sink: F,
) -> Result<(), FormError>
where
    F: FnMut(usize, usize, f64),
{
    let rule = integral.measure.rule();
    let geometry = mesh.cell_geometry(cell);
    let det = geometry.abs_det();
    for (q, (xi, w)) in rule.points().iter().zip(rule.weights()).enumerate() {
        let basis = geometry.p1_basis(xi);
        for i in 0..test_dim.max(1) {
            for j in 0..trial_dim.max(1) {
                let ctx = PointContext {
                    mesh,
                    rule,
                    cell,
                    point: cell * rule.len() + q,
                    x: geometry.map_point(xi),
                    basis: &basis,
                    test: (test_dim > 0).then_some(i),
                    trial: (trial_dim > 0).then_some(j),
                };
                let value = evaluate(&integral.integrand, &ctx)?;
                let value = value.iter().copied().next().unwrap_or(0.0);
                sink(i, j, w * det * value);
            }
        }
    }
    Ok(())
}

/// Assembles a form without arguments into a number.
pub fn assemble_scalar(form: &Form) -> Result<f64, FormError> {
    let mesh = form_mesh(form)?;
    let mut total = 0.0;
    for integral in form.integrals() {
        check_integrand(integral)?;
        let contributions = (0..mesh.num_cells())
            .into_par_iter()
            .map(|cell| {
                let mut sum = 0.0;
                integrate_cell(&mesh, integral, cell, 0, 0, |_, _, v| sum += v)?;
                Ok(sum)
            })
            .collect::<Result<Vec<f64>, FormError>>()?;
        total += contributions.iter().sum::<f64>();
    }
    Ok(total)
}

/// Assembles a linear form into a dense vector indexed by the test space dofs.
pub fn assemble_vector(form: &Form) -> Result<DVector<f64>, FormError> {
    let test = form.argument(0).ok_or(FormError::MissingArgument(0))?;
    let mesh = Arc::clone(test.space.mesh());
    let mut global = DVector::zeros(test.space.num_dofs());
    for integral in form.integrals() {
        check_integrand(integral)?;
        if !has_argument(integral, 0) {
            return Err(FormError::MissingArgument(0));
        }
        let n = test.space.local_dimension();
        let elements = (0..mesh.num_cells())
            .into_par_iter()
            .map(|cell| {
                let mut local = vec![0.0; n];
                integrate_cell(&mesh, integral, cell, n, 0, |i, _, v| local[i] += v)?;
                Ok((cell, local))
            })
            .collect::<Result<Vec<_>, FormError>>()?;
        for (cell, local) in elements {
            for (i, dof) in test.space.cell_dofs(cell).into_iter().enumerate() {
                global[dof] += local[i];
            }
        }
    }
    Ok(global)
}

/// Assembles a bilinear form into a dense matrix with test dofs as rows and trial dofs as
/// columns.
pub fn assemble_matrix(form: &Form) -> Result<DMatrix<f64>, FormError> {
    let test = form.argument(0).ok_or(FormError::MissingArgument(0))?;
    let trial = form.argument(1).ok_or(FormError::MissingArgument(1))?;
    let mesh = Arc::clone(test.space.mesh());
    let mut global = DMatrix::zeros(test.space.num_dofs(), trial.space.num_dofs());
    for integral in form.integrals() {
        check_integrand(integral)?;
        if !has_argument(integral, 0) {
            return Err(FormError::MissingArgument(0));
        }
        if !has_argument(integral, 1) {
            return Err(FormError::MissingArgument(1));
        }
        let (m, n) = (test.space.local_dimension(), trial.space.local_dimension());
        let elements = (0..mesh.num_cells())
            .into_par_iter()
            .map(|cell| {
                let mut local = DMatrix::zeros(m, n);
                integrate_cell(&mesh, integral, cell, m, n, |i, j, v| local[(i, j)] += v)?;
                Ok((cell, local))
            })
            .collect::<Result<Vec<_>, FormError>>()?;
        scatter(&mut global, &test, &trial, elements);
    }
    Ok(global)
}

fn scatter(
    global: &mut DMatrix<f64>,
    test: &Argument,
    trial: &Argument,
    elements: Vec<(usize, DMatrix<f64>)>,
) {
    for (cell, local) in elements {
        let rows = test.space.cell_dofs(cell);
        let cols = trial.space.cell_dofs(cell);
        for (i, &r) in rows.iter().enumerate() {
            for (j, &c) in cols.iter().enumerate() {
                global[(r, c)] += local[(i, j)];
            }
        }
    }
}
