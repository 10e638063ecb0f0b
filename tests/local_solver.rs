//! Kernels with an inner Newton solve per quadrature point.
//!
//! N(s) is the root y of y + y³ = s. Its derivative dN/ds = 1 / (1 + 3 y²) needs y as well,
//! so the derivative kernel returns y as auxiliary output, which is then written into the
//! root buffer.

use std::sync::Arc;

use extop_jit::errors::OperatorError;
use extop_jit::prelude::*;

const TOL: f64 = 1e-12;

struct Newton {
    max_iterations: usize,
}

impl Newton {
    fn solve(&self, point: usize, s: f64) -> Result<f64, OperatorError> {
        let mut y = 0.0;
        let mut residual = y + y * y * y - s;
        for _ in 0..self.max_iterations {
            if residual.abs() < TOL {
                return Ok(y);
            }
            y -= residual / (1.0 + 3.0 * y * y);
            residual = y + y * y * y - s;
        }
        if residual.abs() < TOL {
            return Ok(y);
        }
        Err(OperatorError::NonConvergence {
            point,
            iterations: self.max_iterations,
            residual: residual.abs(),
        })
    }

    fn solve_all(&self, s: &[f64]) -> Result<Vec<f64>, OperatorError> {
        s.iter()
            .enumerate()
            .map(|(point, s)| self.solve(point, *s))
            .collect()
    }
}

fn cubic_root_kernels(max_iterations: usize) -> KernelTable {
    let newton = Arc::new(Newton { max_iterations });
    let for_value = Arc::clone(&newton);
    KernelTable::new()
        .with(&[0], kernel(move |ops: &[&[f64]]| for_value.solve_all(ops[0])))
        .with(
            &[1],
            kernel(move |ops: &[&[f64]]| {
                let y = newton.solve_all(ops[0])?;
                let dy: Vec<f64> = y.iter().map(|y| 1.0 / (1.0 + 3.0 * y * y)).collect();
                Ok((dy, y))
            }),
        )
}

struct Setup {
    space: FunctionSpace,
    u: Function,
    n: ExternalOperator,
    dx: Measure,
}

fn setup(max_iterations: usize) -> Setup {
    let mesh = Arc::new(Mesh::unit_square(4, 4));
    let space = FunctionSpace::scalar(&mesh);
    let u = Function::new(&space, "u");
    u.interpolate_scalar(|x| 1.0 + x[0] + 2.0 * x[1]).unwrap();
    let qspace = QuadratureSpace::new(&mesh, 2, &[]).unwrap();
    let n = ExternalOperator::new("N", vec![FormExpr::coefficient(&u)], &qspace).unwrap();
    n.set_external_function(cubic_root_kernels(max_iterations));
    Setup {
        space,
        u,
        n,
        dx: Measure::new(2).unwrap(),
    }
}

#[test]
fn test_auxiliary_output_fills_root_buffer() {
    let s = setup(50);
    let f = FormExpr::from(&s.n) * test_function(&s.space) * &s.dx;
    let j = f.derivative(&s.u, &trial_function(&s.space)).unwrap();

    let (_, nodes) = replace_external_operators(&j);
    assert_eq!(nodes.len(), 1);
    let operands = evaluate_operands(&nodes).unwrap();
    let results = evaluate_external_operators(&nodes, &operands).unwrap();
    let aux = results[0].aux.clone().unwrap();

    assert!(s.n.buffer().values().iter().all(|v| *v == 0.0));
    update(&nodes[0].root(), &aux).unwrap();

    let source = operands.get(&s.n.operands()[0], s.n.space()).unwrap();
    let y = s.n.buffer().values().clone();
    for (y, s) in y.iter().zip(source.iter()) {
        assert!((y + y * y * y - s).abs() < 1e-10);
    }
    for (dy, y) in nodes[0].buffer().values().iter().zip(&y) {
        assert!((dy * (1.0 + 3.0 * y * y) - 1.0).abs() < 1e-12);
    }
}

#[test]
fn test_residual_uses_solved_values() {
    let s = setup(50);
    let f = FormExpr::from(&s.n) * test_function(&s.space) * &s.dx;
    let (f_numeric, nodes) = replace_external_operators(&f);
    let operands = evaluate_operands(&nodes).unwrap();
    evaluate_external_operators(&nodes, &operands).unwrap();

    // Σ_i ∫ N φ_i = ∫ N, and 0.68 < N < 1.38 for 1 <= u <= 4
    let total = assemble_vector(&f_numeric).unwrap().sum();
    assert!(total > 0.68 && total < 1.38);
}

#[test]
fn test_non_convergence_leaves_buffers_untouched() {
    let s = setup(1);
    let dn = s.n.partial(0).unwrap();
    let nodes = vec![s.n.clone(), dn.clone()];
    let operands = evaluate_operands(&nodes).unwrap();
    let err = evaluate_external_operators(&nodes, &operands).unwrap_err();
    match err {
        OperatorError::NonConvergence {
            point,
            iterations,
            residual,
        } => {
            assert_eq!(point, 0);
            assert_eq!(iterations, 1);
            assert!(residual > TOL);
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(s.n.buffer().values().iter().all(|v| *v == 0.0));
    assert!(dn.buffer().values().iter().all(|v| *v == 0.0));
}
