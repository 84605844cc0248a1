//! Proxal: a dense convex quadratic-program solver
//!
//! This library implements a primal-dual **proximal augmented-Lagrangian**
//! method for dense convex QPs of the form:
//!
//! ```text
//! minimize    (1/2) x^T H x + g^T x
//! subject to  A x = b
//!             l <= C x <= u
//! ```
//!
//! where H is symmetric positive semidefinite.
//!
//! # Algorithm
//!
//! The solver factorizes a regularized KKT system once and then keeps the
//! factorization **incrementally up to date** as the method progresses:
//!
//! - **In-place dense LDL^T** with rank-one updates, symmetric row/column
//!   insertion and deletion (active-set changes touch only the affected
//!   columns, never the whole factorization)
//! - **BCL outer loop** adapting the penalty parameters (mu_eq, mu_in) and
//!   inner/outer tolerances from observed primal-residual progress
//! - **Two inner strategies**: a saddle-point initial guess reusing the
//!   previous multipliers, and a semismooth Newton correction, each with an
//!   exact line search
//! - **Iterative refinement** on every KKT solve, with a from-scratch
//!   refactorization fallback when the residual stalls
//! - **Ruiz equilibration** of the problem data (optional, reusable across
//!   solves)
//!
//! # Example
//!
//! ```
//! use nalgebra::{DMatrix, DVector};
//! use proxal_core::{solve_qp, SolverSettings, SolveStatus};
//!
//! // min 1/2 x^T x - [3, 3]^T x  s.t.  0 <= x <= 1
//! let h = DMatrix::identity(2, 2);
//! let g = DVector::from_column_slice(&[-3.0, -3.0]);
//! let a = DMatrix::zeros(0, 2);
//! let b = DVector::zeros(0);
//! let c = DMatrix::identity(2, 2);
//! let u = DVector::from_column_slice(&[1.0, 1.0]);
//! let l = DVector::from_column_slice(&[0.0, 0.0]);
//!
//! let results = solve_qp(&h, &g, &a, &b, &c, &u, &l, &SolverSettings::default()).unwrap();
//! assert_eq!(results.info.status, SolveStatus::Solved);
//! assert!((results.x[0] - 1.0).abs() < 1e-4);
//! ```
//!
//! # References
//!
//! - Bambade, El-Kazdadi, Taylor, Carpentier: "PROX-QP: Yet another quadratic
//!   programming solver for robotics and beyond"
//! - Conn, Gould, Toint: "A globally convergent augmented Lagrangian
//!   algorithm" (the BCL update rule)
//! - Gill, Golub, Murray, Saunders: "Methods for modifying matrix
//!   factorizations"

#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)] // saddle-point plumbing needs many parameters

pub mod alm;
pub mod linalg;
pub mod precond;
pub mod problem;
pub mod solver;

/// Scalar type governing every buffer in the crate.
///
/// There is no runtime polymorphism on the scalar: retargeting the solver at
/// another floating-point width is a recompile.
pub type Scalar = f64;

pub use problem::{
    InitialGuess, PreconditionerStatus, ProblemData, ProblemUpdate, Results, SetupError,
    SolveInfo, SolveStatus, SolverSettings,
};
pub use solver::QpSolver;

use nalgebra::{DMatrix, DVector};

/// One-shot solve entry point.
///
/// Builds a [`QpSolver`], runs `setup` with the given settings and the Ruiz
/// preconditioner, solves, and returns the results. For repeated solves with
/// warm starts or in-place data updates, hold a [`QpSolver`] instead.
pub fn solve_qp(
    h: &DMatrix<Scalar>,
    g: &DVector<Scalar>,
    a: &DMatrix<Scalar>,
    b: &DVector<Scalar>,
    c: &DMatrix<Scalar>,
    u: &DVector<Scalar>,
    l: &DVector<Scalar>,
    settings: &SolverSettings,
) -> Result<Results, SetupError> {
    let mut qp = QpSolver::new(h.nrows(), a.nrows(), c.nrows(), settings.clone());
    qp.setup(h, g, a, b, c, u, l, PreconditionerStatus::Execute)?;
    qp.solve();
    Ok(qp.results.clone())
}
