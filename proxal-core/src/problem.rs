//! Problem data, settings, and result types.
//!
//! This module defines the canonical QP representation and all user-facing
//! configuration and output structures.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::linalg::dense::Mat;
use crate::Scalar;

/// Setup-time errors. All of these are fatal: the solver state is left
/// untouched and no solve can run until a successful `setup`.
#[derive(Error, Debug)]
pub enum SetupError {
    /// Input dimensions are inconsistent
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which input was inconsistent
        what: &'static str,
        /// Expected dimension
        expected: usize,
        /// Actual dimension
        actual: usize,
    },

    /// NaN or infinity in the scaled problem data after preconditioning
    /// (bound vectors may be infinite, but never NaN)
    #[error("non-finite value in scaled problem data ({what})")]
    NonFinite {
        /// Which buffer contained the non-finite value
        what: &'static str,
    },

    /// The regularized KKT factorization failed even after retrying with the
    /// refactorization value of rho
    #[error("KKT factorization failed: {0}")]
    FactorizationFailure(#[from] crate::linalg::ldlt::LdltError),
}

/// QP model in canonical form.
///
/// ```text
/// minimize    (1/2) x^T H x + g^T x
/// subject to  A x = b
///             l <= C x <= u
/// ```
///
/// All matrices are stored dense row-major: mat-vec with the matrix and its
/// transpose both stream rows, which is what the residual evaluation and the
/// KKT assembly spend their time on.
///
/// # Dimensions
///
/// - `n`: number of primal variables
/// - `n_eq`: number of equality constraints (rows of A)
/// - `n_in`: number of two-sided inequality constraints (rows of C)
#[derive(Debug, Clone)]
pub struct ProblemData {
    /// Number of primal variables
    pub n: usize,
    /// Number of equality constraints
    pub n_eq: usize,
    /// Number of inequality constraints
    pub n_in: usize,

    /// Quadratic cost matrix H (n x n, PSD)
    pub h: Mat,
    /// Linear cost vector g (length n)
    pub g: Vec<Scalar>,
    /// Equality constraint matrix A (n_eq x n)
    pub a: Mat,
    /// Equality right-hand side b (length n_eq)
    pub b: Vec<Scalar>,
    /// Inequality constraint matrix C (n_in x n)
    pub c: Mat,
    /// Inequality upper bounds u (length n_in, entries may be +inf)
    pub u: Vec<Scalar>,
    /// Inequality lower bounds l (length n_in, entries may be -inf)
    pub l: Vec<Scalar>,
}

impl ProblemData {
    /// Create a zero-initialized model of the given dimensions.
    pub fn zeros(n: usize, n_eq: usize, n_in: usize) -> Self {
        Self {
            n,
            n_eq,
            n_in,
            h: Mat::zeros(n, n),
            g: vec![0.0; n],
            a: Mat::zeros(n_eq, n),
            b: vec![0.0; n_eq],
            c: Mat::zeros(n_in, n),
            u: vec![0.0; n_in],
            l: vec![0.0; n_in],
        }
    }

    /// Check the dimensions of a full set of user inputs against this model.
    pub fn check_dimensions(
        &self,
        h: &DMatrix<Scalar>,
        g: &DVector<Scalar>,
        a: &DMatrix<Scalar>,
        b: &DVector<Scalar>,
        c: &DMatrix<Scalar>,
        u: &DVector<Scalar>,
        l: &DVector<Scalar>,
    ) -> Result<(), SetupError> {
        let expect = |what: &'static str, expected: usize, actual: usize| {
            if expected == actual {
                Ok(())
            } else {
                Err(SetupError::DimensionMismatch {
                    what,
                    expected,
                    actual,
                })
            }
        };
        expect("H rows", self.n, h.nrows())?;
        expect("H cols", self.n, h.ncols())?;
        expect("g", self.n, g.len())?;
        expect("A rows", self.n_eq, a.nrows())?;
        expect("A cols", self.n, a.ncols())?;
        expect("b", self.n_eq, b.len())?;
        expect("C rows", self.n_in, c.nrows())?;
        expect("C cols", self.n, c.ncols())?;
        expect("u", self.n_in, u.len())?;
        expect("l", self.n_in, l.len())?;
        Ok(())
    }
}

/// Initial-guess policy applied at `setup` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialGuess {
    /// Clear everything, then solve the equality-only KKT system for a
    /// starting (x, y). The default.
    EqualityConstrainedInitialGuess,

    /// Keep only (x, y, z) from the previous solve; statistics and penalties
    /// are reset, the workspace is rebuilt.
    ColdStartWithPreviousResult,

    /// Clear everything and start from zero.
    NoInitialGuess,

    /// Clear everything; the caller supplies (x, y, z) through
    /// [`crate::QpSolver::warm_start`] before solving.
    WarmStart,

    /// Keep the workspace (including the factorization) and the previous
    /// (x, y, z); only statistics are reset.
    WarmStartWithPreviousResult,
}

/// What to do with the preconditioner at `setup` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionerStatus {
    /// Run Ruiz equilibration on the new data
    Execute,
    /// Do not equilibrate (identity scaling)
    Identity,
    /// Reuse the scaling computed by a previous `setup`
    Keep,
}

/// Per-field replacement directives for [`crate::QpSolver::update`].
///
/// Absent fields leave the corresponding model data unchanged. Replacing any
/// matrix forces a refactorization on the next solve.
#[derive(Debug, Clone, Default)]
pub struct ProblemUpdate {
    /// Replacement quadratic cost
    pub h: Option<DMatrix<Scalar>>,
    /// Replacement linear cost
    pub g: Option<DVector<Scalar>>,
    /// Replacement equality matrix
    pub a: Option<DMatrix<Scalar>>,
    /// Replacement equality right-hand side
    pub b: Option<DVector<Scalar>>,
    /// Replacement inequality matrix
    pub c: Option<DMatrix<Scalar>>,
    /// Replacement upper bounds
    pub u: Option<DVector<Scalar>>,
    /// Replacement lower bounds
    pub l: Option<DVector<Scalar>>,
}

/// Solver settings.
///
/// Penalty convention: `mu_eq` and `mu_in` are penalties (they grow when the
/// BCL loop is unhappy); the KKT matrix carries `-1/mu` on the corresponding
/// diagonal blocks.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Absolute termination tolerance
    pub eps_abs: Scalar,
    /// Relative termination tolerance (0 disables the relative test)
    pub eps_rel: Scalar,

    /// Maximum outer (BCL) iterations
    pub max_iter: usize,
    /// Maximum inner (correction-guess) iterations per outer iteration
    pub max_iter_in: usize,

    /// BCL exponent used when resetting the outer tolerance after a bad step
    pub alpha_bcl: Scalar,
    /// BCL exponent used when tightening the outer tolerance after a good step
    pub beta_bcl: Scalar,

    /// Upper bound on the equality penalty
    pub mu_max_eq: Scalar,
    /// Upper bound on the inequality penalty
    pub mu_max_in: Scalar,
    /// Multiplicative penalty increase applied on a bad BCL step
    pub mu_update_factor: Scalar,

    /// Initial primal proximal parameter
    pub default_rho: Scalar,
    /// Initial equality penalty
    pub default_mu_eq: Scalar,
    /// Initial inequality penalty
    pub default_mu_in: Scalar,

    /// Primal-residual threshold below which the initial-guess strategy runs
    pub eps_ig: Scalar,
    /// Residual threshold above which the refinement loop rebuilds the
    /// factorization from scratch
    pub eps_refact: Scalar,
    /// Value of rho installed by the dual-feasibility refactorization trigger
    /// and by the singular-factorization recovery path
    pub refactor_rho_threshold: Scalar,
    /// Dual-residual level that arms the rho-retuning refactorization once
    /// the primal residual has converged
    pub refactor_dual_feasibility_threshold: Scalar,

    /// Equality penalty installed by a cold restart
    pub cold_reset_mu_eq: Scalar,
    /// Inequality penalty installed by a cold restart
    pub cold_reset_mu_in: Scalar,

    /// Iterative-refinement iteration bound per KKT solve
    pub nb_iterative_refinement: usize,

    /// Initial-guess policy applied at setup
    pub initial_guess: InitialGuess,

    /// Print per-iteration diagnostics to stderr
    pub verbose: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            eps_abs: 1e-5,
            eps_rel: 0.0,
            max_iter: 10_000,
            max_iter_in: 1_500,
            alpha_bcl: 0.1,
            beta_bcl: 0.9,
            mu_max_eq: 1e9,
            mu_max_in: 1e8,
            mu_update_factor: 10.0,
            default_rho: 1e-6,
            default_mu_eq: 1e3,
            default_mu_in: 1e1,
            eps_ig: 1e-2,
            eps_refact: 1e-6,
            refactor_rho_threshold: 1e-7,
            refactor_dual_feasibility_threshold: 1e-2,
            cold_reset_mu_eq: 1.1,
            cold_reset_mu_in: 1.1,
            nb_iterative_refinement: 10,
            initial_guess: InitialGuess::EqualityConstrainedInitialGuess,
            verbose: false,
        }
    }
}

/// Solve status reported on the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// The solver has not reached a terminal state
    Iterating,
    /// Both feasibility tests passed
    Solved,
    /// The outer iteration budget ran out; the best iterate is kept
    MaxIterReached,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Iterating => write!(f, "Iterating"),
            SolveStatus::Solved => write!(f, "Solved"),
            SolveStatus::MaxIterReached => write!(f, "MaxIterReached"),
        }
    }
}

/// Solve diagnostics and the current proximal parameters.
#[derive(Debug, Clone)]
pub struct SolveInfo {
    /// Primal proximal parameter
    pub rho: Scalar,
    /// Equality penalty
    pub mu_eq: Scalar,
    /// Reciprocal of the equality penalty (the KKT diagonal holds its negative)
    pub mu_eq_inv: Scalar,
    /// Inequality penalty
    pub mu_in: Scalar,
    /// Reciprocal of the inequality penalty
    pub mu_in_inv: Scalar,

    /// Outer (BCL) iterations
    pub n_ext: usize,
    /// Total inner iterations
    pub n_tot: usize,
    /// Number of penalty changes
    pub n_mu_change: usize,

    /// Objective value at the reported iterate (unscaled)
    pub objective_value: Scalar,
    /// Terminal status
    pub status: SolveStatus,
}

/// Primal-dual solution and diagnostics.
#[derive(Debug, Clone)]
pub struct Results {
    /// Primal solution x (length n)
    pub x: Vec<Scalar>,
    /// Equality multipliers y (length n_eq)
    pub y: Vec<Scalar>,
    /// Inequality multipliers z (length n_in)
    pub z: Vec<Scalar>,
    /// Diagnostics and proximal parameters
    pub info: SolveInfo,
}

impl Results {
    /// Allocate zeroed results with parameters taken from the settings.
    pub fn new(n: usize, n_eq: usize, n_in: usize, settings: &SolverSettings) -> Self {
        Self {
            x: vec![0.0; n],
            y: vec![0.0; n_eq],
            z: vec![0.0; n_in],
            info: SolveInfo {
                rho: settings.default_rho,
                mu_eq: settings.default_mu_eq,
                mu_eq_inv: 1.0 / settings.default_mu_eq,
                mu_in: settings.default_mu_in,
                mu_in_inv: 1.0 / settings.default_mu_in,
                n_ext: 0,
                n_tot: 0,
                n_mu_change: 0,
                objective_value: 0.0,
                status: SolveStatus::Iterating,
            },
        }
    }

    /// Full reset: zero the iterate and restore default parameters.
    pub fn cleanup(&mut self, settings: &SolverSettings) {
        self.x.fill(0.0);
        self.y.fill(0.0);
        self.z.fill(0.0);
        self.cold_start(settings);
    }

    /// Keep (x, y, z), restore default parameters and clear statistics.
    pub fn cold_start(&mut self, settings: &SolverSettings) {
        self.info.rho = settings.default_rho;
        self.info.mu_eq = settings.default_mu_eq;
        self.info.mu_eq_inv = 1.0 / settings.default_mu_eq;
        self.info.mu_in = settings.default_mu_in;
        self.info.mu_in_inv = 1.0 / settings.default_mu_in;
        self.cleanup_statistics();
    }

    /// Keep everything except the iteration counters, objective, and status.
    pub fn cleanup_statistics(&mut self) {
        self.info.n_ext = 0;
        self.info.n_tot = 0;
        self.info.n_mu_change = 0;
        self.info.objective_value = 0.0;
        self.info.status = SolveStatus::Iterating;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let s = SolverSettings::default();
        assert_eq!(s.eps_abs, 1e-5);
        assert_eq!(s.eps_rel, 0.0);
        assert_eq!(s.default_mu_eq, 1e3);
        assert_eq!(s.default_mu_in, 1e1);
        assert_eq!(
            s.initial_guess,
            InitialGuess::EqualityConstrainedInitialGuess
        );
    }

    #[test]
    fn test_dimension_check() {
        let model = ProblemData::zeros(2, 1, 1);
        let h = DMatrix::identity(2, 2);
        let g = DVector::zeros(2);
        let a = DMatrix::zeros(1, 2);
        let b = DVector::zeros(1);
        let c = DMatrix::zeros(1, 2);
        let u = DVector::zeros(1);
        let l = DVector::zeros(1);

        assert!(model.check_dimensions(&h, &g, &a, &b, &c, &u, &l).is_ok());

        let bad_g = DVector::zeros(3);
        let err = model
            .check_dimensions(&h, &bad_g, &a, &b, &c, &u, &l)
            .unwrap_err();
        assert!(matches!(
            err,
            SetupError::DimensionMismatch { what: "g", .. }
        ));
    }

    #[test]
    fn test_results_lifecycle() {
        let settings = SolverSettings::default();
        let mut results = Results::new(2, 1, 1, &settings);
        results.x[0] = 3.0;
        results.info.mu_in = 1e6;
        results.info.mu_in_inv = 1e-6;
        results.info.n_ext = 7;
        results.info.status = SolveStatus::Solved;

        results.cleanup_statistics();
        assert_eq!(results.x[0], 3.0);
        assert_eq!(results.info.mu_in, 1e6);
        assert_eq!(results.info.n_ext, 0);
        assert_eq!(results.info.status, SolveStatus::Iterating);

        results.cold_start(&settings);
        assert_eq!(results.x[0], 3.0);
        assert_eq!(results.info.mu_in, settings.default_mu_in);

        results.cleanup(&settings);
        assert_eq!(results.x[0], 0.0);
    }
}
