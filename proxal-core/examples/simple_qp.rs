//! Simple QP example demonstrating the Proxal solver.
//!
//! Solves:
//!   minimize    1/2 (x1^2 + x2^2) - 3 x1 - 3 x2
//!   subject to  x1 + x2 = 1
//!               0 <= x1, x2 <= 1
//!
//! Optimal solution: x1 = 0.5, x2 = 0.5 (the equality pins the iterate to
//! the diagonal of the box).

use nalgebra::{DMatrix, DVector};
use proxal_core::{PreconditionerStatus, QpSolver, SolverSettings};

fn main() {
    println!("Proxal Solver - Simple QP Example");
    println!("=================================");
    println!();

    let h = DMatrix::identity(2, 2);
    let g = DVector::from_column_slice(&[-3.0, -3.0]);
    let a = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
    let b = DVector::from_column_slice(&[1.0]);
    let c = DMatrix::identity(2, 2);
    let u = DVector::from_column_slice(&[1.0, 1.0]);
    let l = DVector::from_column_slice(&[0.0, 0.0]);

    let mut settings = SolverSettings::default();
    settings.verbose = true;

    let mut qp = QpSolver::new(2, 1, 2, settings);
    qp.setup(&h, &g, &a, &b, &c, &u, &l, PreconditionerStatus::Execute)
        .expect("setup failed");
    qp.solve();

    println!();
    println!("status        : {}", qp.results.info.status);
    println!("x             : {:?}", qp.results.x);
    println!("y             : {:?}", qp.results.y);
    println!("z             : {:?}", qp.results.z);
    println!("objective     : {:.6}", qp.results.info.objective_value);
    println!("outer iters   : {}", qp.results.info.n_ext);
    println!("inner iters   : {}", qp.results.info.n_tot);
    println!("mu changes    : {}", qp.results.info.n_mu_change);
}
