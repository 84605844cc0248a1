//! Residual evaluation.
//!
//! Residuals are assembled in the scaled space and unscaled through the
//! preconditioner for the norms handed to termination and to the BCL update.
//! The buffers are left in the state the step strategies expect:
//!
//! - `primal_residual_eq_scaled` holds the scaled `A x - b`
//! - `primal_residual_in_scaled_up` holds the **unscaled** `C x`
//! - `primal_residual_in_scaled_low` holds the unscaled violation
//!   `[C x - u]_+ + [C x - l]_-`
//! - `dual_residual_scaled` holds the scaled `H x + g + A^T y + C^T z`

use crate::alm::workspace::Workspace;
use crate::linalg::dense::{inf_norm, negative_part, positive_part};
use crate::problem::{ProblemData, Results};
use crate::Scalar;

/// Unscaled primal-residual norms.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimalResidualInfo {
    /// max of the equality and inequality violation norms
    pub lhs: Scalar,
    /// ||A x||_inf
    pub eq_rhs_0: Scalar,
    /// ||C x||_inf
    pub in_rhs_0: Scalar,
    /// ||A x - b||_inf
    pub eq_lhs: Scalar,
    /// ||[C x - u]_+ + [C x - l]_-||_inf
    pub in_lhs: Scalar,
}

/// Unscaled dual-residual norms.
#[derive(Debug, Clone, Copy, Default)]
pub struct DualResidualInfo {
    /// ||H x + g + A^T y + C^T z||_inf
    pub lhs: Scalar,
    /// ||H x||_inf
    pub rhs_0: Scalar,
    /// ||A^T y||_inf
    pub rhs_1: Scalar,
    /// ||C^T z||_inf
    pub rhs_3: Scalar,
}

/// Evaluate the primal residual at the current iterate.
pub fn global_primal_residual(
    model: &ProblemData,
    results: &Results,
    work: &mut Workspace,
) -> PrimalResidualInfo {
    let mut out = PrimalResidualInfo::default();

    work.a_scaled
        .mul_vec(&results.x, 1.0, &mut work.primal_residual_eq_scaled);
    work.c_scaled
        .mul_vec(&results.x, 1.0, &mut work.primal_residual_in_scaled_up);

    work.ruiz
        .unscale_primal_residual_in_place_eq(&mut work.primal_residual_eq_scaled);
    out.eq_rhs_0 = inf_norm(&work.primal_residual_eq_scaled);
    work.ruiz
        .unscale_primal_residual_in_place_in(&mut work.primal_residual_in_scaled_up);
    out.in_rhs_0 = inf_norm(&work.primal_residual_in_scaled_up);

    for i in 0..work.n_in {
        let cx = work.primal_residual_in_scaled_up[i];
        work.primal_residual_in_scaled_low[i] =
            positive_part(cx - model.u[i]) + negative_part(cx - model.l[i]);
    }
    for (r, bi) in work
        .primal_residual_eq_scaled
        .iter_mut()
        .zip(model.b.iter())
    {
        *r -= bi;
    }

    out.in_lhs = inf_norm(&work.primal_residual_in_scaled_low);
    out.eq_lhs = inf_norm(&work.primal_residual_eq_scaled);
    out.lhs = out.eq_lhs.max(out.in_lhs);

    work.ruiz
        .scale_primal_residual_in_place_eq(&mut work.primal_residual_eq_scaled);
    out
}

/// Evaluate the dual residual at the current iterate.
pub fn global_dual_residual(results: &Results, work: &mut Workspace) -> DualResidualInfo {
    let mut out = DualResidualInfo::default();

    work.dual_residual_scaled.copy_from_slice(&work.g_scaled);

    work.h_scaled.mul_vec(&results.x, 1.0, &mut work.ctz);
    for (d, t) in work.dual_residual_scaled.iter_mut().zip(work.ctz.iter()) {
        *d += t;
    }
    work.ruiz.unscale_dual_residual_in_place(&mut work.ctz);
    out.rhs_0 = inf_norm(&work.ctz);

    work.a_scaled.tr_mul_vec(&results.y, 1.0, &mut work.ctz);
    for (d, t) in work.dual_residual_scaled.iter_mut().zip(work.ctz.iter()) {
        *d += t;
    }
    work.ruiz.unscale_dual_residual_in_place(&mut work.ctz);
    out.rhs_1 = inf_norm(&work.ctz);

    work.c_scaled.tr_mul_vec(&results.z, 1.0, &mut work.ctz);
    for (d, t) in work.dual_residual_scaled.iter_mut().zip(work.ctz.iter()) {
        *d += t;
    }
    work.ruiz.unscale_dual_residual_in_place(&mut work.ctz);
    out.rhs_3 = inf_norm(&work.ctz);

    work.ruiz
        .unscale_dual_residual_in_place(&mut work.dual_residual_scaled);
    out.lhs = inf_norm(&work.dual_residual_scaled);
    work.ruiz
        .scale_dual_residual_in_place(&mut work.dual_residual_scaled);

    out
}

/// Saddle-point error of the proximal subproblem at the post-step iterate.
///
/// Called right after the initial-guess step, with the residual buffers
/// positioned as that step leaves them (`up`/`low` hold the shifted
/// `C x - u + z_e/mu_in` residuals and `dual_residual_scaled` excludes
/// `C^T z`). The buffers are consumed.
pub fn saddle_point_error(results: &Results, work: &mut Workspace) -> Scalar {
    let mu_in_inv = results.info.mu_in_inv;

    for (r, zi) in work
        .primal_residual_in_scaled_up
        .iter_mut()
        .zip(results.z.iter())
    {
        *r -= zi * mu_in_inv;
    }
    for (r, zi) in work
        .primal_residual_in_scaled_low
        .iter_mut()
        .zip(results.z.iter())
    {
        *r -= zi * mu_in_inv;
    }

    let prim_eq_e = inf_norm(&work.primal_residual_eq_scaled);
    work.c_scaled
        .tr_mul_vec_acc(&results.z, 1.0, &mut work.dual_residual_scaled);
    let dual_e = inf_norm(&work.dual_residual_scaled);
    let mut err = prim_eq_e.max(dual_e);

    for i in 0..work.n_in {
        work.primal_residual_in_scaled_up_plus_alpha_cdx[i] =
            positive_part(work.primal_residual_in_scaled_up[i])
                + negative_part(work.primal_residual_in_scaled_low[i]);
    }
    for i in 0..work.n_in {
        work.active_set_up[i] = results.z[i] > 0.0;
        work.active_set_low[i] = results.z[i] < 0.0;
        work.active_part_z[i] = if work.active_set_up[i] {
            work.primal_residual_in_scaled_up[i]
        } else if work.active_set_low[i] {
            work.primal_residual_in_scaled_low[i]
        } else {
            work.primal_residual_in_scaled_up_plus_alpha_cdx[i]
        };
    }
    err = err.max(inf_norm(&work.active_part_z));
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::dense::Mat;
    use crate::problem::SolverSettings;
    use nalgebra::DMatrix;

    fn simple_setup() -> (ProblemData, Results, Workspace) {
        // H = I, g = (-1, -1), A = [1 1], b = (1), C = I, u = (2, 2), l = (0, 0)
        let mut model = ProblemData::zeros(2, 1, 2);
        model.h = Mat::from_dmatrix(&DMatrix::identity(2, 2));
        model.g = vec![-1.0, -1.0];
        model.a = Mat::from_dmatrix(&DMatrix::from_row_slice(1, 2, &[1.0, 1.0]));
        model.b = vec![1.0];
        model.c = Mat::from_dmatrix(&DMatrix::identity(2, 2));
        model.u = vec![2.0, 2.0];
        model.l = vec![0.0, 0.0];

        let mut work = Workspace::new(2, 1, 2);
        work.h_scaled.copy_from(&model.h);
        work.g_scaled.copy_from_slice(&model.g);
        work.a_scaled.copy_from(&model.a);
        work.b_scaled.copy_from_slice(&model.b);
        work.c_scaled.copy_from(&model.c);
        work.u_scaled.copy_from_slice(&model.u);
        work.l_scaled.copy_from_slice(&model.l);

        let results = Results::new(2, 1, 2, &SolverSettings::default());
        (model, results, work)
    }

    #[test]
    fn test_primal_residual_values() {
        let (model, mut results, mut work) = simple_setup();
        results.x = vec![3.0, -1.0];

        let info = global_primal_residual(&model, &results, &mut work);

        // A x = 2, violation |2 - 1| = 1
        assert_eq!(info.eq_rhs_0, 2.0);
        assert_eq!(info.eq_lhs, 1.0);
        // C x = (3, -1): above u by 1 on row 0, below l by 1 on row 1
        assert_eq!(info.in_rhs_0, 3.0);
        assert_eq!(info.in_lhs, 1.0);
        assert_eq!(info.lhs, 1.0);
        assert_eq!(work.primal_residual_in_scaled_low, vec![1.0, -1.0]);
        // buffer state: up holds C x, eq holds A x - b
        assert_eq!(work.primal_residual_in_scaled_up, vec![3.0, -1.0]);
        assert_eq!(work.primal_residual_eq_scaled, vec![1.0]);
    }

    #[test]
    fn test_dual_residual_values() {
        let (_model, mut results, mut work) = simple_setup();
        results.x = vec![1.0, 0.0];
        results.y = vec![2.0];
        results.z = vec![0.5, 0.0];

        let info = global_dual_residual(&results, &mut work);

        // H x = (1, 0), A^T y = (2, 2), C^T z = (0.5, 0), g = (-1, -1)
        assert_eq!(info.rhs_0, 1.0);
        assert_eq!(info.rhs_1, 2.0);
        assert_eq!(info.rhs_3, 0.5);
        // residual = (1 + 2 + 0.5 - 1, 0 + 2 + 0 - 1) = (2.5, 1.0)
        assert_eq!(info.lhs, 2.5);
        assert_eq!(work.dual_residual_scaled, vec![2.5, 1.0]);
    }

    #[test]
    fn test_zero_at_optimum() {
        let (model, mut results, mut work) = simple_setup();
        // unconstrained-in-the-interior optimum of this model: x = (0.5, 0.5),
        // y = 0.5 satisfies stationarity: x + g + A^T y = 0
        results.x = vec![0.5, 0.5];
        results.y = vec![0.5];
        results.z = vec![0.0, 0.0];

        let p = global_primal_residual(&model, &results, &mut work);
        let d = global_dual_residual(&results, &mut work);
        assert!(p.lhs < 1e-15);
        assert!(d.lhs < 1e-15);
    }
}
