//! The stateful solver object: setup, data updates, warm starts, and solve.
//!
//! A [`QpSolver`] is allocated once for a set of dimensions and reused across
//! solves. `setup` installs problem data under an initial-guess policy and a
//! preconditioner directive, performs the first regularized-KKT
//! factorization, and optionally computes the equality-constrained starting
//! point; `solve` runs the BCL loop in [`crate::alm`].

use nalgebra::{DMatrix, DVector};

use crate::alm::refine::iterative_solve_with_permut_fact;
use crate::alm::workspace::Workspace;
use crate::alm::qp_solve;
use crate::linalg::dense::{inf_norm, Mat};
use crate::precond::{Preconditioner, RuizEquilibration};
use crate::problem::{
    InitialGuess, PreconditionerStatus, ProblemData, ProblemUpdate, Results, SetupError,
    SolverSettings,
};
use crate::Scalar;

/// Dense QP solver with reusable state.
#[derive(Debug)]
pub struct QpSolver {
    /// Solver settings; `warm_start` mutates the initial-guess policy
    pub settings: SolverSettings,
    /// The unscaled model
    pub model: ProblemData,
    /// Solution, multipliers, and diagnostics
    pub results: Results,
    /// Scratch, scaled data, and the factorization
    pub work: Workspace,
}

impl QpSolver {
    /// Allocate a solver for problems with `n` variables, `n_eq` equalities,
    /// and `n_in` inequalities.
    pub fn new(n: usize, n_eq: usize, n_in: usize, settings: SolverSettings) -> Self {
        Self {
            model: ProblemData::zeros(n, n_eq, n_in),
            results: Results::new(n, n_eq, n_in, &settings),
            work: Workspace::new(n, n_eq, n_in),
            settings,
        }
    }

    /// Install problem data and prepare the first factorization.
    ///
    /// The initial-guess policy in the settings decides what survives from a
    /// previous solve; `precond` decides whether the Ruiz scaling is
    /// recomputed, reused, or replaced by the identity.
    pub fn setup(
        &mut self,
        h: &DMatrix<Scalar>,
        g: &DVector<Scalar>,
        a: &DMatrix<Scalar>,
        b: &DVector<Scalar>,
        c: &DMatrix<Scalar>,
        u: &DVector<Scalar>,
        l: &DVector<Scalar>,
        precond: PreconditionerStatus,
    ) -> Result<(), SetupError> {
        self.model.check_dimensions(h, g, a, b, c, u, l)?;

        match self.settings.initial_guess {
            InitialGuess::EqualityConstrainedInitialGuess
            | InitialGuess::NoInitialGuess
            | InitialGuess::WarmStart => {
                self.work.cleanup();
                self.results.cleanup(&self.settings);
            }
            InitialGuess::ColdStartWithPreviousResult => {
                self.work.cleanup();
                self.results.cold_start(&self.settings);
            }
            InitialGuess::WarmStartWithPreviousResult => {
                self.results.cleanup_statistics();
            }
        }

        self.model.h = Mat::from_dmatrix(h);
        self.model.g = g.as_slice().to_vec();
        self.model.a = Mat::from_dmatrix(a);
        self.model.b = b.as_slice().to_vec();
        self.model.c = Mat::from_dmatrix(c);
        self.model.u = u.as_slice().to_vec();
        self.model.l = l.as_slice().to_vec();

        self.refresh_scaled_data(precond)?;

        match self.settings.initial_guess {
            InitialGuess::ColdStartWithPreviousResult
            | InitialGuess::WarmStartWithPreviousResult => {
                self.work.ruiz.scale_primal_in_place(&mut self.results.x);
                self.work.ruiz.scale_dual_in_place_eq(&mut self.results.y);
                self.work.ruiz.scale_dual_in_place_in(&mut self.results.z);
            }
            _ => {}
        }

        if self.settings.initial_guess != InitialGuess::WarmStartWithPreviousResult {
            self.setup_factorization()?;
        }
        if self.settings.initial_guess == InitialGuess::EqualityConstrainedInitialGuess {
            self.compute_equality_constrained_initial_guess()?;
        }
        Ok(())
    }

    /// Replace individual pieces of the model. Vector updates are cheap;
    /// replacing any matrix flags the factorization for a rebuild on the
    /// next solve. The stored scaling is reused.
    pub fn update(&mut self, update: ProblemUpdate) -> Result<(), SetupError> {
        let matrices_changed =
            update.h.is_some() || update.a.is_some() || update.c.is_some();

        if let Some(h) = &update.h {
            if h.nrows() != self.model.n || h.ncols() != self.model.n {
                return Err(SetupError::DimensionMismatch {
                    what: "H",
                    expected: self.model.n,
                    actual: h.nrows(),
                });
            }
            self.model.h = Mat::from_dmatrix(h);
        }
        if let Some(g) = &update.g {
            if g.len() != self.model.n {
                return Err(SetupError::DimensionMismatch {
                    what: "g",
                    expected: self.model.n,
                    actual: g.len(),
                });
            }
            self.model.g = g.as_slice().to_vec();
        }
        if let Some(a) = &update.a {
            if a.nrows() != self.model.n_eq || a.ncols() != self.model.n {
                return Err(SetupError::DimensionMismatch {
                    what: "A",
                    expected: self.model.n_eq,
                    actual: a.nrows(),
                });
            }
            self.model.a = Mat::from_dmatrix(a);
        }
        if let Some(b) = &update.b {
            if b.len() != self.model.n_eq {
                return Err(SetupError::DimensionMismatch {
                    what: "b",
                    expected: self.model.n_eq,
                    actual: b.len(),
                });
            }
            self.model.b = b.as_slice().to_vec();
        }
        if let Some(c) = &update.c {
            if c.nrows() != self.model.n_in || c.ncols() != self.model.n {
                return Err(SetupError::DimensionMismatch {
                    what: "C",
                    expected: self.model.n_in,
                    actual: c.nrows(),
                });
            }
            self.model.c = Mat::from_dmatrix(c);
        }
        if let Some(u) = &update.u {
            if u.len() != self.model.n_in {
                return Err(SetupError::DimensionMismatch {
                    what: "u",
                    expected: self.model.n_in,
                    actual: u.len(),
                });
            }
            self.model.u = u.as_slice().to_vec();
        }
        if let Some(l) = &update.l {
            if l.len() != self.model.n_in {
                return Err(SetupError::DimensionMismatch {
                    what: "l",
                    expected: self.model.n_in,
                    actual: l.len(),
                });
            }
            self.model.l = l.as_slice().to_vec();
        }

        self.refresh_scaled_data(PreconditionerStatus::Keep)?;
        if matrices_changed {
            // the factor no longer matches the data; rebuild the (n + n_eq)
            // block now and let the next solve refactorize
            self.build_kkt_buffer();
            self.work.needs_refactorization = true;
        }
        Ok(())
    }

    /// Provide a starting point (unscaled). Zero-dimension components are
    /// ignored. Switches the initial-guess policy to `WarmStart`; call after
    /// `setup` so the iterate is stored in the scaled space.
    pub fn warm_start(
        &mut self,
        x: Option<&[Scalar]>,
        y: Option<&[Scalar]>,
        z: Option<&[Scalar]>,
    ) -> Result<(), SetupError> {
        let need_y = self.model.n_eq != 0;
        let need_z = self.model.n_in != 0;
        let have = |v: &Option<&[Scalar]>| v.is_some();

        if have(&x) && (!need_y || have(&y)) && (!need_z || have(&z)) {
            let check = |what: &'static str, expected: usize, actual: usize| {
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
            let x = x.unwrap();
            check("x", self.model.n, x.len())?;
            self.results.x.copy_from_slice(x);
            self.work.ruiz.scale_primal_in_place(&mut self.results.x);
            if need_y {
                let y = y.unwrap();
                check("y", self.model.n_eq, y.len())?;
                self.results.y.copy_from_slice(y);
                self.work.ruiz.scale_dual_in_place_eq(&mut self.results.y);
            }
            if need_z {
                let z = z.unwrap();
                check("z", self.model.n_in, z.len())?;
                self.results.z.copy_from_slice(z);
                self.work.ruiz.scale_dual_in_place_in(&mut self.results.z);
            }
        }
        self.settings.initial_guess = InitialGuess::WarmStart;
        Ok(())
    }

    /// Replace any of the proximal parameters; reciprocals are recomputed and
    /// the factorization is flagged for a rebuild.
    pub fn update_proximal_parameters(
        &mut self,
        rho: Option<Scalar>,
        mu_eq: Option<Scalar>,
        mu_in: Option<Scalar>,
    ) {
        if let Some(rho) = rho {
            // keep the kkt buffer carrying the current rho diagonal
            for i in 0..self.work.n {
                self.work.kkt[(i, i)] += rho - self.results.info.rho;
            }
            self.results.info.rho = rho;
            self.work.needs_refactorization = true;
        }
        if let Some(mu_eq) = mu_eq {
            self.results.info.mu_eq = mu_eq;
            self.results.info.mu_eq_inv = 1.0 / mu_eq;
            self.work.needs_refactorization = true;
        }
        if let Some(mu_in) = mu_in {
            self.results.info.mu_in = mu_in;
            self.results.info.mu_in_inv = 1.0 / mu_in;
            self.work.needs_refactorization = true;
        }
    }

    /// Solve the installed problem; results land on `self.results`.
    pub fn solve(&mut self) {
        qp_solve(&self.settings, &self.model, &mut self.results, &mut self.work);
    }

    /// Copy the model into the scaled buffers, run the preconditioner per the
    /// directive, refresh the norm constants, and validate finiteness.
    fn refresh_scaled_data(&mut self, precond: PreconditionerStatus) -> Result<(), SetupError> {
        self.work.h_scaled.copy_from(&self.model.h);
        self.work.g_scaled.copy_from_slice(&self.model.g);
        self.work.a_scaled.copy_from(&self.model.a);
        self.work.b_scaled.copy_from_slice(&self.model.b);
        self.work.c_scaled.copy_from(&self.model.c);
        self.work.u_scaled.copy_from_slice(&self.model.u);
        self.work.l_scaled.copy_from_slice(&self.model.l);

        self.work.primal_feasibility_rhs_1_eq = inf_norm(&self.model.b);
        self.work.primal_feasibility_rhs_1_in_u = inf_norm(&self.model.u);
        self.work.primal_feasibility_rhs_1_in_l = inf_norm(&self.model.l);
        self.work.dual_feasibility_rhs_2 = inf_norm(&self.model.g);

        let execute = match precond {
            PreconditionerStatus::Execute => {
                self.work.ruiz = Preconditioner::Ruiz(RuizEquilibration::new(
                    self.model.n,
                    self.model.n_eq,
                    self.model.n_in,
                ));
                true
            }
            PreconditionerStatus::Identity => {
                self.work.ruiz = Preconditioner::Identity;
                false
            }
            PreconditionerStatus::Keep => false,
        };
        let (ruiz, view) = self.work.scaled_qp_parts();
        ruiz.scale_qp_in_place(view, execute);

        self.check_scaled_finite()?;
        self.work.correction_guess_rhs_g = inf_norm(&self.work.g_scaled);
        Ok(())
    }

    fn check_scaled_finite(&self) -> Result<(), SetupError> {
        if !self.work.h_scaled.is_finite() {
            return Err(SetupError::NonFinite { what: "H" });
        }
        if !self.work.g_scaled.iter().all(|v| v.is_finite()) {
            return Err(SetupError::NonFinite { what: "g" });
        }
        if !self.work.a_scaled.is_finite() {
            return Err(SetupError::NonFinite { what: "A" });
        }
        if !self.work.b_scaled.iter().all(|v| v.is_finite()) {
            return Err(SetupError::NonFinite { what: "b" });
        }
        if !self.work.c_scaled.is_finite() {
            return Err(SetupError::NonFinite { what: "C" });
        }
        // bounds may be infinite, never NaN
        if self.work.u_scaled.iter().any(|v| v.is_nan()) {
            return Err(SetupError::NonFinite { what: "u" });
        }
        if self.work.l_scaled.iter().any(|v| v.is_nan()) {
            return Err(SetupError::NonFinite { what: "l" });
        }
        Ok(())
    }

    /// Assemble the (n + n_eq) KKT block from the scaled data and the current
    /// proximal parameters.
    fn build_kkt_buffer(&mut self) {
        let n = self.work.n;
        let n_eq = self.work.n_eq;
        for i in 0..n {
            for j in 0..n {
                self.work.kkt[(i, j)] = self.work.h_scaled[(i, j)];
            }
            self.work.kkt[(i, i)] += self.results.info.rho;
        }
        for e in 0..n_eq {
            for j in 0..n {
                self.work.kkt[(n + e, j)] = self.work.a_scaled[(e, j)];
                self.work.kkt[(j, n + e)] = self.work.a_scaled[(e, j)];
            }
            for e2 in 0..n_eq {
                self.work.kkt[(n + e, n + e2)] = 0.0;
            }
            self.work.kkt[(n + e, n + e)] = -self.results.info.mu_eq_inv;
        }
    }

    /// First factorization of the regularized KKT matrix. A singular pivot is
    /// retried once at the refactorization value of rho before surfacing.
    fn setup_factorization(&mut self) -> Result<(), SetupError> {
        let n = self.work.n;
        self.build_kkt_buffer();

        if let Err(first) = self
            .work
            .ldl
            .factorize(&self.work.kkt, &mut self.work.ldl_scratch)
        {
            let rho_new = self.settings.refactor_rho_threshold;
            for i in 0..n {
                self.work.kkt[(i, i)] += rho_new - self.results.info.rho;
            }
            self.results.info.rho = rho_new;
            if self
                .work
                .ldl
                .factorize(&self.work.kkt, &mut self.work.ldl_scratch)
                .is_err()
            {
                return Err(SetupError::FactorizationFailure(first));
            }
        }
        Ok(())
    }

    /// Solve the equality-only KKT system for a starting (x, y).
    fn compute_equality_constrained_initial_guess(&mut self) -> Result<(), SetupError> {
        let n = self.work.n;
        let n_eq = self.work.n_eq;

        self.work.rhs.fill(0.0);
        for i in 0..n {
            self.work.rhs[i] = -self.work.g_scaled[i];
        }
        self.work.rhs[n..n + n_eq].copy_from_slice(&self.work.b_scaled);
        iterative_solve_with_permut_fact(
            &self.settings,
            &self.results,
            &mut self.work,
            1.0,
            n + n_eq,
        )
        .map_err(SetupError::FactorizationFailure)?;

        self.results.x.copy_from_slice(&self.work.dw_aug[..n]);
        self.results
            .y
            .copy_from_slice(&self.work.dw_aug[n..n + n_eq]);
        self.work.dw_aug.fill(0.0);
        self.work.rhs.fill(0.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::SolveStatus;

    fn box_qp_inputs() -> (
        DMatrix<Scalar>,
        DVector<Scalar>,
        DMatrix<Scalar>,
        DVector<Scalar>,
        DMatrix<Scalar>,
        DVector<Scalar>,
        DVector<Scalar>,
    ) {
        (
            DMatrix::identity(2, 2),
            DVector::from_column_slice(&[-3.0, -3.0]),
            DMatrix::zeros(0, 2),
            DVector::zeros(0),
            DMatrix::identity(2, 2),
            DVector::from_column_slice(&[1.0, 1.0]),
            DVector::from_column_slice(&[0.0, 0.0]),
        )
    }

    #[test]
    fn test_setup_rejects_bad_dimensions() {
        let (h, g, a, b, c, u, _l) = box_qp_inputs();
        let bad_l = DVector::zeros(3);
        let mut qp = QpSolver::new(2, 0, 2, SolverSettings::default());
        let err = qp
            .setup(&h, &g, &a, &b, &c, &u, &bad_l, PreconditionerStatus::Execute)
            .unwrap_err();
        assert!(matches!(err, SetupError::DimensionMismatch { what: "l", .. }));
    }

    #[test]
    fn test_setup_rejects_nan() {
        let (h, mut g, a, b, c, u, l) = box_qp_inputs();
        g[0] = Scalar::NAN;
        let mut qp = QpSolver::new(2, 0, 2, SolverSettings::default());
        let err = qp
            .setup(&h, &g, &a, &b, &c, &u, &l, PreconditionerStatus::Identity)
            .unwrap_err();
        assert!(matches!(err, SetupError::NonFinite { what: "g" }));
    }

    #[test]
    fn test_setup_allows_infinite_bounds() {
        let (h, g, a, b, c, mut u, l) = box_qp_inputs();
        u[1] = Scalar::INFINITY;
        let mut qp = QpSolver::new(2, 0, 2, SolverSettings::default());
        qp.setup(&h, &g, &a, &b, &c, &u, &l, PreconditionerStatus::Execute)
            .unwrap();
    }

    #[test]
    fn test_warm_start_switches_policy() {
        let (h, g, a, b, c, u, l) = box_qp_inputs();
        let mut qp = QpSolver::new(2, 0, 2, SolverSettings::default());
        qp.setup(&h, &g, &a, &b, &c, &u, &l, PreconditionerStatus::Identity)
            .unwrap();
        qp.warm_start(Some(&[0.5, 0.5]), None, Some(&[0.0, 0.0]))
            .unwrap();
        assert_eq!(qp.settings.initial_guess, InitialGuess::WarmStart);
        assert_eq!(qp.results.x, vec![0.5, 0.5]);
    }

    #[test]
    fn test_update_proximal_parameters_recomputes_inverses() {
        let mut qp = QpSolver::new(2, 0, 2, SolverSettings::default());
        qp.update_proximal_parameters(Some(1e-4), Some(2e3), None);
        assert_eq!(qp.results.info.rho, 1e-4);
        assert_eq!(qp.results.info.mu_eq, 2e3);
        assert_eq!(qp.results.info.mu_eq_inv, 1.0 / 2e3);
        assert_eq!(qp.results.info.mu_in, qp.settings.default_mu_in);
        assert!(qp.work.needs_refactorization);
    }

    #[test]
    fn test_vector_update_keeps_factorization() {
        let (h, g, a, b, c, u, l) = box_qp_inputs();
        let mut qp = QpSolver::new(2, 0, 2, SolverSettings::default());
        qp.setup(&h, &g, &a, &b, &c, &u, &l, PreconditionerStatus::Identity)
            .unwrap();

        qp.update(ProblemUpdate {
            g: Some(DVector::from_column_slice(&[-1.0, -1.0])),
            ..Default::default()
        })
        .unwrap();
        assert!(!qp.work.needs_refactorization);
        assert_eq!(qp.model.g, vec![-1.0, -1.0]);

        qp.update(ProblemUpdate {
            h: Some(DMatrix::identity(2, 2) * 2.0),
            ..Default::default()
        })
        .unwrap();
        assert!(qp.work.needs_refactorization);
        qp.solve();
        assert_eq!(qp.results.info.status, SolveStatus::Solved);
        // min x^T x - [1 1] x on the box: optimum at x = (0.5, 0.5)
        assert!((qp.results.x[0] - 0.5).abs() < 1e-4);
        assert!((qp.results.x[1] - 0.5).abs() < 1e-4);
    }
}
