//! Inner step strategies.
//!
//! Two ways of producing a step from the current iterate:
//!
//! - [`initial_guess`] solves the saddle-point equations once with the active
//!   set predicted from the previous multipliers, takes an exact line search
//!   on the full (dx, dy, dz) direction, and reports the post-step
//!   saddle-point error so the outer loop can decide whether to fall through
//!   to the correction loop.
//! - [`correction_guess`] runs semismooth Newton iterations on the primal
//!   proximal subproblem, each followed by an exact line search on dx, until
//!   the projected gradient is small relative to the problem scale.

use crate::alm::active_set::active_set_change;
use crate::alm::line_search::{correction_guess_ls, initial_guess_ls};
use crate::alm::refine::iterative_solve_with_permut_fact;
use crate::alm::residuals::saddle_point_error;
use crate::alm::workspace::Workspace;
use crate::linalg::dense::{inf_norm, negative_part, positive_part};
use crate::linalg::ldlt::LdltError;
use crate::problem::{ProblemData, Results, SolverSettings};
use crate::Scalar;

/// One semismooth Newton solve: refresh the active set from the shifted
/// residual signs, reconcile the factorization, and solve with rhs
/// `(-dual_residual, 0, 0)`.
pub fn newton_step(
    settings: &SolverSettings,
    results: &Results,
    work: &mut Workspace,
    eps: Scalar,
) -> Result<(), LdltError> {
    let n = work.n;
    let n_eq = work.n_eq;

    for i in 0..work.n_in {
        work.active_set_up[i] = work.primal_residual_in_scaled_up[i] > 0.0;
        work.active_set_low[i] = work.primal_residual_in_scaled_low[i] < 0.0;
        work.active_inequalities[i] = work.active_set_up[i] || work.active_set_low[i];
    }
    let num_active = work.active_inequalities.iter().filter(|&&a| a).count();
    let inner_pb_dim = n + n_eq + num_active;

    work.rhs.fill(0.0);
    work.dw_aug.fill(0.0);
    for i in 0..n {
        work.rhs[i] = -work.dual_residual_scaled[i];
    }

    active_set_change(results, work);
    iterative_solve_with_permut_fact(settings, results, work, eps, inner_pb_dim)
}

/// Newton correction loop on the primal proximal subproblem.
///
/// Returns the final projected-gradient norm. Exits when the damped step is
/// negligible or when the gradient passes `eps_int` relative to the problem
/// scale.
pub fn correction_guess(
    settings: &SolverSettings,
    results: &mut Results,
    work: &mut Workspace,
    eps_int: Scalar,
) -> Result<Scalar, LdltError> {
    let n = work.n;
    let mut err_in: Scalar = 1e6;

    for iter in 0..=settings.max_iter_in {
        if iter == settings.max_iter_in {
            results.info.n_tot += settings.max_iter_in;
            break;
        }

        newton_step(settings, results, work, eps_int)?;

        work.h_scaled.mul_vec(&work.dw_aug[..n], 1.0, &mut work.hdx);
        work.a_scaled.mul_vec(&work.dw_aug[..n], 1.0, &mut work.adx);
        work.c_scaled.mul_vec(&work.dw_aug[..n], 1.0, &mut work.cdx);

        if work.n_in > 0 {
            correction_guess_ls(results, work);
        } else {
            work.alpha = 1.0;
        }

        let mut step_norm: Scalar = 0.0;
        for d in &work.dw_aug[..n] {
            step_norm = step_norm.max((work.alpha * d).abs());
        }
        if step_norm < 1e-11 {
            results.info.n_tot += iter + 1;
            if settings.verbose {
                eprintln!("correction: |alpha dx|_inf = {step_norm:.3e}, stopping");
            }
            break;
        }

        let alpha = work.alpha;
        for (xi, di) in results.x.iter_mut().zip(work.dw_aug[..n].iter()) {
            *xi += alpha * di;
        }
        for (r, c) in work
            .primal_residual_in_scaled_up
            .iter_mut()
            .zip(work.cdx.iter())
        {
            *r += alpha * c;
        }
        for (r, c) in work
            .primal_residual_in_scaled_low
            .iter_mut()
            .zip(work.cdx.iter())
        {
            *r += alpha * c;
        }
        for (r, a) in work
            .primal_residual_eq_scaled
            .iter_mut()
            .zip(work.adx.iter())
        {
            *r += alpha * a;
        }
        // multiplier updates from the shifted residuals
        for (yi, r) in results
            .y
            .iter_mut()
            .zip(work.primal_residual_eq_scaled.iter())
        {
            *yi = results.info.mu_eq * r;
        }
        for i in 0..work.n_in {
            results.z[i] = results.info.mu_in
                * (positive_part(work.primal_residual_in_scaled_up[i])
                    + negative_part(work.primal_residual_in_scaled_low[i]));
        }

        // projected gradient of the subproblem and its scale
        work.h_scaled
            .mul_vec(&results.x, 1.0, &mut work.dual_residual_scaled);
        let mut rhs_c = work
            .correction_guess_rhs_g
            .max(inf_norm(&work.dual_residual_scaled));
        work.a_scaled.tr_mul_vec(&results.y, 1.0, &mut work.ctz);
        for (d, t) in work.dual_residual_scaled.iter_mut().zip(work.ctz.iter()) {
            *d += t;
        }
        rhs_c = rhs_c.max(inf_norm(&work.ctz));
        work.c_scaled.tr_mul_vec(&results.z, 1.0, &mut work.ctz);
        for (d, t) in work.dual_residual_scaled.iter_mut().zip(work.ctz.iter()) {
            *d += t;
        }
        rhs_c = rhs_c.max(inf_norm(&work.ctz));
        for i in 0..n {
            work.dual_residual_scaled[i] +=
                work.g_scaled[i] + results.info.rho * (results.x[i] - work.x_prev[i]);
        }
        rhs_c += 1.0;

        err_in = inf_norm(&work.dual_residual_scaled);
        if settings.verbose {
            eprintln!(
                "correction: it {iter} |grad|_inf {err_in:.3e} alpha {alpha:.3e} rhs {:.3e}",
                eps_int * rhs_c
            );
        }
        if err_in <= eps_int * rhs_c {
            results.info.n_tot += iter + 1;
            break;
        }
    }

    Ok(err_in)
}

/// Saddle-point step with the active set predicted from the previous
/// multipliers. Returns the post-step saddle-point error.
///
/// On entry, `primal_residual_in_scaled_up` holds the unscaled `C x` and
/// `primal_residual_eq_scaled` the scaled `A x - b`, exactly as
/// `global_primal_residual` leaves them.
pub fn initial_guess(
    settings: &SolverSettings,
    model: &ProblemData,
    results: &mut Results,
    work: &mut Workspace,
    eps_int: Scalar,
) -> Result<Scalar, LdltError> {
    let n = work.n;
    let n_eq = work.n_eq;
    let n_in = work.n_in;
    let mu_in_inv = results.info.mu_in_inv;
    let mu_eq_inv = results.info.mu_eq_inv;

    // candidate active set from the unscaled shifted residuals
    work.ruiz.unscale_dual_in_place_in(&mut work.z_prev);
    for i in 0..n_in {
        work.primal_residual_in_scaled_up[i] += work.z_prev[i] * mu_in_inv;
    }
    work.primal_residual_in_scaled_low
        .copy_from_slice(&work.primal_residual_in_scaled_up);
    for i in 0..n_in {
        work.primal_residual_in_scaled_up[i] -= model.u[i];
        work.primal_residual_in_scaled_low[i] -= model.l[i];
    }
    for i in 0..n_in {
        work.active_set_up[i] = work.primal_residual_in_scaled_up[i] >= 0.0;
        work.active_set_low[i] = work.primal_residual_in_scaled_low[i] <= 0.0;
        work.active_inequalities[i] = work.active_set_up[i] || work.active_set_low[i];
    }
    for i in 0..n_in {
        work.primal_residual_in_scaled_up[i] -= work.z_prev[i] * mu_in_inv;
        work.primal_residual_in_scaled_low[i] -= work.z_prev[i] * mu_in_inv;
    }
    work.ruiz
        .scale_primal_residual_in_place_in(&mut work.primal_residual_in_scaled_up);
    work.ruiz
        .scale_primal_residual_in_place_in(&mut work.primal_residual_in_scaled_low);
    work.ruiz.scale_dual_in_place_in(&mut work.z_prev);

    let num_active = work.active_inequalities.iter().filter(|&&a| a).count();
    let inner_pb_dim = n + n_eq + num_active;

    work.rhs.fill(0.0);
    work.active_part_z.fill(0.0);
    active_set_change(results, work);

    for i in 0..n {
        work.rhs[i] = -work.dual_residual_scaled[i];
    }
    for i in 0..n_eq {
        work.rhs[n + i] = -work.primal_residual_eq_scaled[i];
    }
    for i in 0..n_in {
        let j = work.current_bijection_map[i];
        if j < work.n_c {
            if work.active_set_up[i] {
                work.rhs[n + n_eq + j] = -work.primal_residual_in_scaled_up[i];
            } else if work.active_set_low[i] {
                work.rhs[n + n_eq + j] = -work.primal_residual_in_scaled_low[i];
            }
        } else {
            // inactive columns are not in the factorization; move their
            // multiplier contribution to the right-hand side
            let zi = results.z[i];
            for (r, c) in work.rhs[..n].iter_mut().zip(work.c_scaled.row(i).iter()) {
                *r += zi * c;
            }
        }
    }

    iterative_solve_with_permut_fact(settings, results, work, eps_int, inner_pb_dim)?;

    // permute the step back through the bijection; inactive multipliers are
    // pushed to -z
    for j in 0..n_in {
        let i = work.current_bijection_map[j];
        work.active_part_z[j] = if i < work.n_c {
            work.dw_aug[n + n_eq + i]
        } else {
            -results.z[j]
        };
    }
    work.dw_aug[n + n_eq..n + n_eq + n_in].copy_from_slice(&work.active_part_z);

    for i in 0..n_in {
        work.primal_residual_in_scaled_up[i] += work.z_prev[i] * mu_in_inv;
        work.primal_residual_in_scaled_low[i] += work.z_prev[i] * mu_in_inv;
    }

    // directional derivatives of the saddle-point residual
    work.a_scaled.mul_vec(&work.dw_aug[..n], 1.0, &mut work.adx);
    for (a, dy) in work.adx.iter_mut().zip(work.dw_aug[n..n + n_eq].iter()) {
        *a -= dy * mu_eq_inv;
    }
    work.h_scaled.mul_vec(&work.dw_aug[..n], 1.0, &mut work.hdx);
    {
        let (head, tail) = work.dw_aug.split_at(n);
        work.a_scaled
            .tr_mul_vec_acc(&tail[..n_eq], 1.0, &mut work.hdx);
        for (h, d) in work.hdx.iter_mut().zip(head.iter()) {
            *h += results.info.rho * d;
        }
    }
    work.c_scaled.mul_vec(&work.dw_aug[..n], 1.0, &mut work.cdx);
    work.c_scaled
        .tr_mul_vec_acc(&work.z_prev, -1.0, &mut work.dual_residual_scaled);

    initial_guess_ls(results, work);
    if settings.verbose {
        eprintln!("initial guess: alpha = {:.3e}", work.alpha);
    }

    let alpha = work.alpha;
    for (r, c) in work
        .primal_residual_in_scaled_up
        .iter_mut()
        .zip(work.cdx.iter())
    {
        *r += alpha * c;
    }
    for (r, c) in work
        .primal_residual_in_scaled_low
        .iter_mut()
        .zip(work.cdx.iter())
    {
        *r += alpha * c;
    }
    for i in 0..n_in {
        work.active_set_up[i] = work.primal_residual_in_scaled_up[i] >= 0.0;
        work.active_set_low[i] = work.primal_residual_in_scaled_low[i] <= 0.0;
        work.active_inequalities[i] = work.active_set_up[i] || work.active_set_low[i];
    }
    for (xi, di) in results.x.iter_mut().zip(work.dw_aug[..n].iter()) {
        *xi += alpha * di;
    }
    for (yi, di) in results.y.iter_mut().zip(work.dw_aug[n..n + n_eq].iter()) {
        *yi += alpha * di;
    }
    for i in 0..n_in {
        work.active_part_z[i] = results.z[i] + alpha * work.dw_aug[n + n_eq + i];
        work.primal_residual_in_scaled_up_plus_alpha_cdx[i] =
            positive_part(work.active_part_z[i]);
        work.primal_residual_in_scaled_low_plus_alpha_cdx[i] =
            negative_part(work.active_part_z[i]);
    }
    for i in 0..n_in {
        results.z[i] = if work.active_set_up[i] {
            work.primal_residual_in_scaled_up_plus_alpha_cdx[i]
        } else if work.active_set_low[i] {
            work.primal_residual_in_scaled_low_plus_alpha_cdx[i]
        } else {
            work.active_part_z[i]
        };
    }
    for (r, a) in work
        .primal_residual_eq_scaled
        .iter_mut()
        .zip(work.adx.iter())
    {
        *r += alpha * a;
    }
    for (d, h) in work
        .dual_residual_scaled
        .iter_mut()
        .zip(work.hdx.iter())
    {
        *d += alpha * h;
    }
    work.dw_aug.fill(0.0);

    let mut err_saddle_point = saddle_point_error(results, work);
    if work.alpha.abs() < 1e-10 {
        err_saddle_point = 1.0;
    }
    Ok(err_saddle_point)
}
