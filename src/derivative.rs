//! Gateaux derivatives of forms, including the chain rule through external operators.
//!
//! Derivatives are taken eagerly: the result is a new expression tree. Terms that vanish
//! identically are dropped, so `None` stands for the zero derivative.
//!
//! An external operator `N(o_1, …, o_k)` is never looked into. Its derivative along `δ` is
//!
//! ```text
//! Σ_i  ∂N/∂o_i : (∂o_i/∂u)[δ]
//! ```
//!
//! where `∂N/∂o_i` is the family member with the multi-index incremented at position `i`
//! and `:` contracts all axes of the operand derivative. Operands independent of the field
//! contribute nothing.

use log::trace;

use crate::errors::FormError;
use crate::form::{grad, Form, FormExpr, Integral};
use crate::space::Function;

fn sum(a: Option<FormExpr>, b: Option<FormExpr>) -> Option<FormExpr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

fn product<F, G>(da: Option<FormExpr>, db: Option<FormExpr>, left: F, right: G) -> Option<FormExpr>
where
    F: FnOnce(FormExpr) -> FormExpr,
    G: FnOnce(FormExpr) -> FormExpr,
{
    sum(da.map(left), db.map(right))
}

impl FormExpr {
    /// Derivative of the expression with respect to `field` in the direction `direction`.
    ///
    /// # Errors
    /// Propagates shape errors of operands of external operators.
    pub fn gateaux(
        &self,
        field: &Function,
        direction: &FormExpr,
    ) -> Result<Option<FormExpr>, FormError> {
        let d = |e: &FormExpr| e.gateaux(field, direction);
        let derivative = match self {
            FormExpr::Scalar(_)
            | FormExpr::Constant(_)
            | FormExpr::Identity(_)
            | FormExpr::SpatialCoordinate
            | FormExpr::Argument(_)
            | FormExpr::QuadratureCoefficient(_) => None,
            FormExpr::Coefficient(f) => (f == field).then(|| direction.clone()),
            FormExpr::Grad(a) => d(a)?.map(grad),
            FormExpr::Add(a, b) => sum(d(a)?, d(b)?),
            FormExpr::Neg(a) => d(a)?.map(|da| -da),
            FormExpr::Mul(a, b) => product(
                d(a)?,
                d(b)?,
                |da| da * (**b).clone(),
                |db| (**a).clone() * db,
            ),
            FormExpr::Div(a, b) => product(
                d(a)?,
                d(b)?,
                |da| da / (**b).clone(),
                |db| -(((**a).clone() * db) / (**b).clone().pow(2)),
            ),
            FormExpr::Pow(a, n) => match n {
                0 => None,
                _ => d(a)?.map(|da| (*n as f64) * ((**a).clone().pow(n - 1) * da)),
            },
            FormExpr::Exp(a) => d(a)?.map(|da| self.clone() * da),
            FormExpr::Ln(a) => d(a)?.map(|da| da / (**a).clone()),
            FormExpr::Sqrt(a) => d(a)?.map(|da| da / (2.0 * self.clone())),
            FormExpr::Inner(a, b) => product(
                d(a)?,
                d(b)?,
                |da| crate::form::inner(da, (**b).clone()),
                |db| crate::form::inner((**a).clone(), db),
            ),
            FormExpr::Dot(a, b) => product(
                d(a)?,
                d(b)?,
                |da| crate::form::dot(da, (**b).clone()),
                |db| crate::form::dot((**a).clone(), db),
            ),
            FormExpr::Contract {
                tensor,
                operand,
                axis,
            } => product(
                d(tensor)?,
                d(operand)?,
                |dt| dt.contract((**operand).clone(), *axis),
                |dop| (**tensor).clone().contract(dop, *axis),
            ),
            FormExpr::External(node) => {
                let mut total = None;
                for (i, operand) in node.operands().iter().enumerate() {
                    let Some(d_operand) = d(operand)? else {
                        continue;
                    };
                    let Some(partial) = node.partial(i) else {
                        continue;
                    };
                    trace!("chain rule: {} -> {}", node, partial);
                    let axis = partial.contraction_axis(i);
                    let term = FormExpr::External(partial).contract(d_operand, axis);
                    total = sum(total, Some(term));
                }
                total
            }
        };
        Ok(derivative)
    }
}

impl Form {
    /// Gateaux derivative of the form with respect to `field` along `direction`.
    ///
    /// Integrals whose derivative vanishes are dropped.
    ///
    /// # Errors
    /// Returns `FormError::DirectionShape` if the direction does not have the value shape of
    /// the field.
    pub fn derivative(&self, field: &Function, direction: &FormExpr) -> Result<Form, FormError> {
        let direction_shape = direction.shape()?;
        if direction_shape != field.space().value_shape() {
            return Err(FormError::DirectionShape {
                field: field.space().value_shape().to_vec(),
                direction: direction_shape,
            });
        }
        let mut integrals = Vec::new();
        for integral in self.integrals() {
            if let Some(integrand) = integral.integrand.gateaux(field, direction)? {
                integrals.push(Integral {
                    integrand,
                    measure: integral.measure.clone(),
                });
            }
        }
        Ok(Form::from_integrals(integrals))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::assembly::{assemble_matrix, assemble_vector};
    use crate::external::ExternalOperator;
    use crate::form::{inner, test_function, trial_function, Measure};
    use crate::mesh::Mesh;
    use crate::space::{FunctionSpace, QuadratureSpace};

    struct Setup {
        space: FunctionSpace,
        u: Function,
        dx: Measure,
    }

    fn setup() -> Setup {
        let mesh = Arc::new(Mesh::unit_square(3, 3));
        let space = FunctionSpace::scalar(&mesh);
        let u = Function::new(&space, "u");
        u.interpolate_scalar(|x| 1.0 + x[0] * x[0] + x[1]).unwrap();
        Setup {
            space,
            u,
            dx: Measure::new(2).unwrap(),
        }
    }

    #[test]
    fn test_derivative_of_constant_form_is_empty() {
        let s = setup();
        let other = Function::new(&s.space, "w");
        let form = FormExpr::coefficient(&other) * test_function(&s.space) * &s.dx;
        let j = form.derivative(&s.u, &trial_function(&s.space)).unwrap();
        assert!(j.is_empty());
    }

    #[test]
    fn test_direction_shape() {
        let s = setup();
        let form = FormExpr::coefficient(&s.u) * test_function(&s.space) * &s.dx;
        let wrong = grad(trial_function(&s.space));
        assert!(matches!(
            form.derivative(&s.u, &wrong),
            Err(FormError::DirectionShape { .. })
        ));
    }

    #[test]
    fn test_product_and_quotient_rules() {
        // F = (u² + 1/u) v, dF = (2u - 1/u²) du v
        let s = setup();
        let u = FormExpr::coefficient(&s.u);
        let v = test_function(&s.space);
        let du = trial_function(&s.space);
        let f = (u.clone() * u.clone() + FormExpr::Scalar(1.0) / u.clone()) * v.clone() * &s.dx;
        let j = assemble_matrix(&f.derivative(&s.u, &du).unwrap()).unwrap();
        let expected = (2.0 * u.clone() - FormExpr::Scalar(1.0) / u.pow(2)) * du * v * &s.dx;
        let expected = assemble_matrix(&expected).unwrap();
        assert!((j - expected).norm() < 1e-12);
    }

    #[test]
    fn test_chain_rule_produces_contractions() {
        let s = setup();
        let qspace = QuadratureSpace::new(s.space.mesh(), 2, &[]).unwrap();
        let u = FormExpr::coefficient(&s.u);
        let operands = vec![u.clone(), grad(u), FormExpr::Scalar(1.0)];
        let n = ExternalOperator::new("N", operands, &qspace).unwrap();
        let du = trial_function(&s.space);
        let d = FormExpr::External(n.clone())
            .gateaux(&s.u, &du)
            .unwrap()
            .unwrap();
        let nodes = d.external_operators();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].derivatives(), &[1, 0, 0]);
        assert_eq!(nodes[1].derivatives(), &[0, 1, 0]);
        assert_eq!(d.shape().unwrap(), Vec::<usize>::new());

        // Second derivative reaches the mixed and pure second-order members
        let second = d.gateaux(&s.u, &du).unwrap().unwrap();
        let mut indices: Vec<Vec<usize>> = second
            .external_operators()
            .iter()
            .map(|n| n.derivatives().to_vec())
            .collect();
        indices.sort();
        assert_eq!(indices, vec![vec![0, 2, 0], vec![1, 1, 0], vec![2, 0, 0]]);
    }

    #[test]
    fn test_vector_field_derivative() {
        let mesh = Arc::new(Mesh::unit_square(2, 2));
        let space = FunctionSpace::vector(&mesh, 2);
        let u = Function::new(&space, "u");
        u.interpolate(|x| vec![x[0], x[0] * x[1]]).unwrap();
        let dx = Measure::new(1).unwrap();
        let uu = FormExpr::coefficient(&u);
        let v = test_function(&space);
        // F = inner(u, u) inner(u, v), dF = 2 inner(u, du) inner(u, v) + inner(u, u) inner(du, v)
        let f = inner(uu.clone(), uu.clone()) * inner(uu.clone(), v.clone()) * &dx;
        let du = trial_function(&space);
        let j = assemble_matrix(&f.derivative(&u, &du).unwrap()).unwrap();
        let expected = 2.0 * inner(uu.clone(), du.clone()) * inner(uu.clone(), v.clone())
            + inner(uu.clone(), uu.clone()) * inner(du.clone(), v.clone());
        let expected = assemble_matrix(&(expected * &dx)).unwrap();
        assert!((j - expected).norm() < 1e-12);
        let residual = assemble_vector(&f).unwrap();
        assert_eq!(residual.len(), 18);
    }
}
