//! External Operator Evaluation Benchmarks
//!
//! Measures the cost of one evaluation round of a heat flux law
//! q(T, σ) = -σ / (1 + T) on meshes of growing size.
//!
//! ## Benchmark Structure
//!
//! ### 1. Kernel Evaluation (`benchmark_kernels`)
//! Compares the Jacobian kernel ∂q/∂σ computed by:
//! - **Direct**: a hand-written Rust closure
//! - **JIT**: the law compiled with Cranelift
//! - **Interpreted**: the same law evaluated by walking the expression tree
//!
//! ### 2. Compilation Time (`benchmark_compilation_time`)
//! Time to differentiate, simplify and compile the law for a fresh multi-index.
//!
//! ### 3. Full Round (`benchmark_round`)
//! Operand evaluation, kernel evaluation and buffer update for all nodes of the Jacobian.
//!
//! ## Usage
//!
//! Run with: `cargo bench --bench evaluation`

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use extop_jit::prelude::*;

fn law(backend: Backend) -> CompiledLaw {
    CompiledLaw::builder("q")
        .operand("T", &[])
        .operand("sigma", &[2])
        .value_shape(&[2])
        .components(&["-sigma_0 / (1 + T)", "-sigma_1 / (1 + T)"])
        .options(LawOptions {
            backend,
            ..LawOptions::default()
        })
        .build()
        .unwrap()
}

fn direct_kernel() -> Kernel {
    kernel(|ops: &[&[f64]]| {
        Ok(ops[0]
            .iter()
            .flat_map(|t| {
                let k = 1.0 / (1.0 + t);
                [-k, 0.0, 0.0, -k]
            })
            .collect::<Vec<_>>())
    })
}

fn operands(points: usize) -> (Vec<f64>, Vec<f64>) {
    let t = (0..points).map(|p| (p % 17) as f64 * 0.1).collect();
    let sigma = (0..2 * points).map(|i| (i % 13) as f64 - 6.0).collect();
    (t, sigma)
}

fn benchmark_kernels(c: &mut Criterion) {
    let mut group = c.benchmark_group("Kernel Evaluation");
    let jit = law(Backend::Jit);
    let interpreted = law(Backend::Interpreted);
    let kernels = [
        ("Direct", direct_kernel()),
        ("JIT", jit.compile(&[0, 1]).unwrap()),
        ("Interpreted", interpreted.compile(&[0, 1]).unwrap()),
    ];

    for points in [1_000, 100_000] {
        let (t, sigma) = operands(points);
        for (name, kernel) in &kernels {
            group.bench_with_input(BenchmarkId::new(*name, points), &points, |b, _| {
                b.iter(|| black_box(kernel(&[t.as_slice(), sigma.as_slice()]).unwrap()))
            });
        }
    }
    group.finish();
}

fn benchmark_compilation_time(c: &mut Criterion) {
    let mut group = c.benchmark_group("Compilation Time");
    for derivatives in [[0, 0], [1, 1], [2, 1]] {
        let id = format!("{derivatives:?}");
        group.bench_function(BenchmarkId::new("JIT", &id), |b| {
            b.iter(|| {
                // A fresh law per iteration so the kernel cache is empty
                let fresh = law(Backend::Jit);
                black_box(fresh.compile(&derivatives).unwrap())
            })
        });
    }
    group.finish();
}

fn benchmark_round(c: &mut Criterion) {
    let mut group = c.benchmark_group("Full Round");
    for n in [8, 32] {
        let mesh = Arc::new(Mesh::unit_square(n, n));
        let space = FunctionSpace::scalar(&mesh);
        let t = Function::new(&space, "T");
        t.interpolate_scalar(|x| x[0] * x[0] + x[1]).unwrap();
        let qspace = QuadratureSpace::new(&mesh, 2, &[2]).unwrap();
        let temperature = FormExpr::coefficient(&t);
        let q = ExternalOperator::new("q", vec![temperature.clone(), grad(temperature)], &qspace)
            .unwrap();
        q.set_external_function(law(Backend::Jit));

        let dx = Measure::new(2).unwrap();
        let f = inner(FormExpr::from(&q), grad(test_function(&space))) * &dx;
        let j = f.derivative(&t, &trial_function(&space)).unwrap();
        let (_, nodes) = replace_external_operators(&j);

        group.bench_with_input(BenchmarkId::new("Jacobian nodes", n), &n, |b, _| {
            b.iter(|| {
                let operands = evaluate_operands(&nodes).unwrap();
                black_box(evaluate_external_operators(&nodes, &operands).unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_kernels,
    benchmark_compilation_time,
    benchmark_round
);
criterion_main!(benches);
