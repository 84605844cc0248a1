//! The BCL outer loop.
//!
//! Each iteration evaluates the unscaled residual norms, checks the two-sided
//! termination test, picks a step strategy, and lets the BCL rule adapt the
//! penalties and inner/outer tolerances from the observed primal-residual
//! progress. Penalty changes reach the factorization as rank-one diagonal
//! shifts; a near-feasible iterate with a lagging dual residual retunes rho
//! and refactorizes.

use crate::alm::inner::{correction_guess, initial_guess};
use crate::alm::refine::{mu_update, refactorize};
use crate::alm::residuals::{global_dual_residual, global_primal_residual};
use crate::alm::workspace::Workspace;
use crate::linalg::dense::{dot, negative_part, positive_part};
use crate::problem::{ProblemData, Results, SolveStatus, SolverSettings};
use crate::Scalar;

/// Penalty level at which a stalled iterate triggers a cold restart.
const COLD_RESTART_MU_THRESHOLD: Scalar = 1e5;

/// New penalty values proposed by one BCL update.
struct BclProposal {
    mu_eq: Scalar,
    mu_in: Scalar,
    mu_eq_inv: Scalar,
    mu_in_inv: Scalar,
}

/// The BCL rule. A good step (primal progress within `bcl_eta_ext`) tightens
/// both tolerances and keeps the penalties; a bad step rolls the multipliers
/// back and increases the penalties.
#[allow(clippy::too_many_arguments)]
fn bcl_update(
    settings: &SolverSettings,
    results: &mut Results,
    work: &mut Workspace,
    primal_feasibility_lhs: Scalar,
    bcl_eta_ext: &mut Scalar,
    bcl_eta_in: &mut Scalar,
    bcl_eta_ext_init: Scalar,
    eps_in_min: Scalar,
    proposal: &mut BclProposal,
) {
    if primal_feasibility_lhs <= *bcl_eta_ext {
        if settings.verbose {
            eprintln!("bcl: good step");
        }
        *bcl_eta_ext *= results.info.mu_in_inv.powf(settings.beta_bcl);
        *bcl_eta_in = (*bcl_eta_in * results.info.mu_in_inv).max(eps_in_min);
    } else {
        if settings.verbose {
            eprintln!("bcl: bad step");
        }
        results.y.copy_from_slice(&work.y_prev);
        results.z.copy_from_slice(&work.z_prev);

        proposal.mu_in =
            (results.info.mu_in * settings.mu_update_factor).min(settings.mu_max_in);
        proposal.mu_eq =
            (results.info.mu_eq * settings.mu_update_factor).min(settings.mu_max_eq);
        proposal.mu_in_inv =
            (results.info.mu_in_inv / settings.mu_update_factor).max(1.0 / settings.mu_max_in);
        proposal.mu_eq_inv =
            (results.info.mu_eq_inv / settings.mu_update_factor).max(1.0 / settings.mu_max_eq);

        *bcl_eta_ext = bcl_eta_ext_init * proposal.mu_in_inv.powf(settings.alpha_bcl);
        *bcl_eta_in = proposal.mu_in_inv.max(eps_in_min);
    }
}

/// A cold restart fires when neither residual improved on the previous
/// primal residual and the inequality penalty has already grown large.
fn cold_restart_needed(
    primal_lhs_new: Scalar,
    dual_lhs_new: Scalar,
    primal_lhs_prev: Scalar,
    mu_in: Scalar,
) -> bool {
    let scale = primal_lhs_prev.max(Scalar::EPSILON);
    primal_lhs_new / scale >= 1.0
        && dual_lhs_new / scale >= 1.0
        && mu_in >= COLD_RESTART_MU_THRESHOLD
}

/// Refactorize at `rho_new`; on a singular pivot, retry once at the
/// refactorization threshold. Returns false when both attempts fail.
fn refactorize_or_bump(
    settings: &SolverSettings,
    results: &mut Results,
    work: &mut Workspace,
    rho_new: Scalar,
) -> bool {
    let ok = refactorize(results, work, rho_new).is_ok();
    // the kkt buffer carries rho_new from here on, even on failure
    results.info.rho = rho_new;
    if ok {
        return true;
    }
    let bumped = settings.refactor_rho_threshold;
    if bumped != rho_new {
        let ok = refactorize(results, work, bumped).is_ok();
        results.info.rho = bumped;
        if ok {
            return true;
        }
    }
    false
}

fn unscale_and_finish(
    model: &ProblemData,
    results: &mut Results,
    work: &mut Workspace,
    status: SolveStatus,
) {
    work.ruiz.unscale_primal_in_place(&mut results.x);
    work.ruiz.unscale_dual_in_place_eq(&mut results.y);
    work.ruiz.unscale_dual_in_place_in(&mut results.z);

    model.h.mul_vec(&results.x, 0.5, &mut work.ctz);
    for (t, gi) in work.ctz.iter_mut().zip(model.g.iter()) {
        *t += gi;
    }
    results.info.objective_value = dot(&work.ctz, &results.x);
    results.info.status = status;
}

/// Run the solver to a terminal status. The iterate, multipliers, objective,
/// and status land on `results`.
pub fn qp_solve(
    settings: &SolverSettings,
    model: &ProblemData,
    results: &mut Results,
    work: &mut Workspace,
) {
    let bcl_eta_ext_init = Scalar::powf(0.1, settings.alpha_bcl);
    let mut bcl_eta_ext = bcl_eta_ext_init;
    let mut bcl_eta_in: Scalar = 1.0;
    let eps_in_min = settings.eps_abs.min(1e-9);

    if work.needs_refactorization {
        if !refactorize_or_bump(settings, results, work, results.info.rho) {
            unscale_and_finish(model, results, work, SolveStatus::MaxIterReached);
            return;
        }
        work.needs_refactorization = false;
    }

    for iter in 0..=settings.max_iter {
        results.info.n_ext += 1;
        if iter == settings.max_iter {
            break;
        }

        let p = global_primal_residual(model, results, work);
        let d = global_dual_residual(results, work);

        let mut proposal = BclProposal {
            mu_eq: results.info.mu_eq,
            mu_in: results.info.mu_in,
            mu_eq_inv: results.info.mu_eq_inv,
            mu_in_inv: results.info.mu_in_inv,
        };

        let mut rhs_pri = settings.eps_abs;
        if settings.eps_rel != 0.0 {
            rhs_pri += settings.eps_rel
                * p.eq_rhs_0
                    .max(p.in_rhs_0)
                    .max(work.primal_feasibility_rhs_1_eq)
                    .max(work.primal_feasibility_rhs_1_in_u)
                    .max(work.primal_feasibility_rhs_1_in_l);
        }
        let is_primal_feasible = p.lhs <= rhs_pri;

        let mut rhs_dua = settings.eps_abs;
        if settings.eps_rel != 0.0 {
            rhs_dua += settings.eps_rel
                * d.rhs_3
                    .max(d.rhs_0)
                    .max(d.rhs_1)
                    .max(work.dual_feasibility_rhs_2);
        }
        let is_dual_feasible = d.lhs <= rhs_dua;

        if settings.verbose {
            eprintln!(
                "it {iter}: primal {:.3e} dual {:.3e} eta_ext {bcl_eta_ext:.3e} \
                 eta_in {bcl_eta_in:.3e} rho {:.3e} mu_eq {:.3e} mu_in {:.3e}",
                p.lhs, d.lhs, results.info.rho, results.info.mu_eq, results.info.mu_in
            );
        }

        if is_primal_feasible {
            if d.lhs >= settings.refactor_dual_feasibility_threshold
                && results.info.rho != settings.refactor_rho_threshold
            {
                if !refactorize_or_bump(settings, results, work, settings.refactor_rho_threshold)
                {
                    break;
                }
            }
            if is_dual_feasible {
                unscale_and_finish(model, results, work, SolveStatus::Solved);
                return;
            }
        }

        work.x_prev.copy_from_slice(&results.x);
        work.y_prev.copy_from_slice(&results.y);
        work.z_prev.copy_from_slice(&results.z);

        let do_initial_guess_fact = p.lhs < settings.eps_ig || work.n_in == 0;

        let mut err_in: Scalar = 0.0;
        if do_initial_guess_fact {
            match initial_guess(settings, model, results, work, bcl_eta_in) {
                Ok(err) => err_in = err,
                Err(_) => break,
            }
            results.info.n_tot += 1;
        }

        let do_correction_guess = (!do_initial_guess_fact && work.n_in != 0)
            || (do_initial_guess_fact && err_in >= bcl_eta_in && work.n_in != 0);
        if settings.verbose && do_initial_guess_fact {
            eprintln!("initial guess: err {err_in:.3e} eta_in {bcl_eta_in:.3e}");
        }

        if do_initial_guess_fact && err_in >= bcl_eta_in && work.n_in != 0 {
            // rebuild grad_phi from the post-guess buffers: the guess already
            // moved (x, y, z) and left the shifted residuals behind
            work.c_scaled
                .tr_mul_vec_acc(&results.z, -1.0, &mut work.dual_residual_scaled);
            work.a_scaled.tr_mul_vec_acc(
                &work.primal_residual_eq_scaled,
                results.info.mu_eq,
                &mut work.dual_residual_scaled,
            );
            for (r, yi) in work
                .primal_residual_eq_scaled
                .iter_mut()
                .zip(results.y.iter())
            {
                *r += yi * results.info.mu_eq_inv;
            }
            for i in 0..work.n_in {
                work.primal_residual_in_scaled_up[i] +=
                    results.z[i] * results.info.mu_in_inv;
                work.primal_residual_in_scaled_low[i] +=
                    results.z[i] * results.info.mu_in_inv;
            }
            for i in 0..work.n_in {
                work.active_part_z[i] = results.info.mu_in
                    * (positive_part(work.primal_residual_in_scaled_up[i])
                        + negative_part(work.primal_residual_in_scaled_low[i]));
            }
            work.c_scaled.tr_mul_vec_acc(
                &work.active_part_z,
                1.0,
                &mut work.dual_residual_scaled,
            );
        }
        if !do_initial_guess_fact && work.n_in != 0 {
            // x, y, z still sit at the previous iterate; shift the residual
            // buffers into subproblem form
            work.ruiz
                .scale_primal_residual_in_place_in(&mut work.primal_residual_in_scaled_up);
            for i in 0..work.n_in {
                work.primal_residual_in_scaled_up[i] +=
                    work.z_prev[i] * results.info.mu_in_inv;
            }
            work.primal_residual_in_scaled_low
                .copy_from_slice(&work.primal_residual_in_scaled_up);
            for i in 0..work.n_in {
                work.primal_residual_in_scaled_up[i] -= work.u_scaled[i];
                work.primal_residual_in_scaled_low[i] -= work.l_scaled[i];
            }
            work.a_scaled.tr_mul_vec_acc(
                &work.primal_residual_eq_scaled,
                results.info.mu_eq,
                &mut work.dual_residual_scaled,
            );
            for (r, yi) in work
                .primal_residual_eq_scaled
                .iter_mut()
                .zip(results.y.iter())
            {
                *r += yi * results.info.mu_eq_inv;
            }
            for i in 0..work.n_in {
                work.active_part_z[i] = results.info.mu_in
                    * (positive_part(work.primal_residual_in_scaled_up[i])
                        + negative_part(work.primal_residual_in_scaled_low[i]))
                    - results.z[i];
            }
            work.c_scaled.tr_mul_vec_acc(
                &work.active_part_z,
                1.0,
                &mut work.dual_residual_scaled,
            );
        }

        if do_correction_guess {
            match correction_guess(settings, results, work, bcl_eta_in) {
                Ok(err) => err_in = err,
                Err(_) => break,
            }
            if settings.verbose {
                eprintln!("correction guess: err {err_in:.3e}");
            }
        }

        let p_new = global_primal_residual(model, results, work);
        let mut rhs_pri_new = settings.eps_abs;
        if settings.eps_rel != 0.0 {
            rhs_pri_new += settings.eps_rel
                * p_new
                    .eq_rhs_0
                    .max(p_new.in_rhs_0)
                    .max(work.primal_feasibility_rhs_1_eq)
                    .max(work.primal_feasibility_rhs_1_in_u)
                    .max(work.primal_feasibility_rhs_1_in_l);
        }
        if p_new.lhs <= rhs_pri_new {
            let d_new = global_dual_residual(results, work);
            let mut rhs_dua_new = settings.eps_abs;
            if settings.eps_rel != 0.0 {
                rhs_dua_new += settings.eps_rel
                    * d_new
                        .rhs_3
                        .max(d_new.rhs_0)
                        .max(d_new.rhs_1)
                        .max(work.dual_feasibility_rhs_2);
            }
            if d_new.lhs <= rhs_dua_new {
                unscale_and_finish(model, results, work, SolveStatus::Solved);
                return;
            }
        }

        bcl_update(
            settings,
            results,
            work,
            p_new.lhs,
            &mut bcl_eta_ext,
            &mut bcl_eta_in,
            bcl_eta_ext_init,
            eps_in_min,
            &mut proposal,
        );

        // the BCL rollback may have moved y and z; re-evaluate the dual
        // residual before judging progress
        let d_post = global_dual_residual(results, work);
        if cold_restart_needed(p_new.lhs, d_post.lhs, p.lhs, results.info.mu_in) {
            if settings.verbose {
                eprintln!("cold restart");
            }
            proposal.mu_in = settings.cold_reset_mu_in;
            proposal.mu_eq = settings.cold_reset_mu_eq;
            proposal.mu_in_inv = 1.0 / settings.cold_reset_mu_in;
            proposal.mu_eq_inv = 1.0 / settings.cold_reset_mu_eq;
        }

        if results.info.mu_in != proposal.mu_in || results.info.mu_eq != proposal.mu_eq {
            results.info.n_mu_change += 1;
        }
        if mu_update(results, work, proposal.mu_eq_inv, proposal.mu_in_inv).is_err() {
            // the factors are stale; rebuild them at the new penalties
            results.info.mu_eq = proposal.mu_eq;
            results.info.mu_in = proposal.mu_in;
            results.info.mu_eq_inv = proposal.mu_eq_inv;
            results.info.mu_in_inv = proposal.mu_in_inv;
            if !refactorize_or_bump(settings, results, work, results.info.rho) {
                break;
            }
        } else {
            results.info.mu_eq = proposal.mu_eq;
            results.info.mu_in = proposal.mu_in;
            results.info.mu_eq_inv = proposal.mu_eq_inv;
            results.info.mu_in_inv = proposal.mu_in_inv;
        }
    }

    unscale_and_finish(model, results, work, SolveStatus::MaxIterReached);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (SolverSettings, Results, Workspace) {
        let settings = SolverSettings::default();
        let results = Results::new(2, 1, 2, &settings);
        let work = Workspace::new(2, 1, 2);
        (settings, results, work)
    }

    #[test]
    fn test_bcl_good_step_tightens_tolerances() {
        let (settings, mut results, mut work) = fixture();
        results.info.mu_in = 10.0;
        results.info.mu_in_inv = 0.1;
        let mut eta_ext = 0.5;
        let mut eta_in = 1.0;
        let mut proposal = BclProposal {
            mu_eq: results.info.mu_eq,
            mu_in: results.info.mu_in,
            mu_eq_inv: results.info.mu_eq_inv,
            mu_in_inv: results.info.mu_in_inv,
        };

        bcl_update(
            &settings,
            &mut results,
            &mut work,
            0.1, // within eta_ext: good
            &mut eta_ext,
            &mut eta_in,
            0.5,
            1e-9,
            &mut proposal,
        );

        // eta_ext strictly decreases whenever mu_in > 1
        assert!(eta_ext < 0.5);
        assert!((eta_ext - 0.5 * Scalar::powf(0.1, settings.beta_bcl)).abs() < 1e-15);
        assert!((eta_in - 0.1).abs() < 1e-15);
        // penalties untouched
        assert_eq!(proposal.mu_in, 10.0);
        assert_eq!(proposal.mu_eq, results.info.mu_eq);
    }

    #[test]
    fn test_bcl_bad_step_rolls_back_and_grows_mu() {
        let (settings, mut results, mut work) = fixture();
        results.y = vec![5.0];
        results.z = vec![3.0, -3.0];
        work.y_prev = vec![1.0];
        work.z_prev = vec![0.5, -0.5];
        let mut eta_ext = 1e-4;
        let mut eta_in = 1e-4;
        let mut proposal = BclProposal {
            mu_eq: results.info.mu_eq,
            mu_in: results.info.mu_in,
            mu_eq_inv: results.info.mu_eq_inv,
            mu_in_inv: results.info.mu_in_inv,
        };

        bcl_update(
            &settings,
            &mut results,
            &mut work,
            1.0, // way above eta_ext: bad
            &mut eta_ext,
            &mut eta_in,
            0.5,
            1e-9,
            &mut proposal,
        );

        assert_eq!(results.y, vec![1.0]);
        assert_eq!(results.z, vec![0.5, -0.5]);
        assert_eq!(proposal.mu_in, settings.default_mu_in * settings.mu_update_factor);
        assert_eq!(proposal.mu_eq, settings.default_mu_eq * settings.mu_update_factor);
        assert!((proposal.mu_in_inv - 1.0 / proposal.mu_in).abs() < 1e-18);
    }

    #[test]
    fn test_bcl_mu_saturates_at_bounds() {
        let (settings, mut results, mut work) = fixture();
        results.info.mu_eq = settings.mu_max_eq;
        results.info.mu_eq_inv = 1.0 / settings.mu_max_eq;
        results.info.mu_in = settings.mu_max_in;
        results.info.mu_in_inv = 1.0 / settings.mu_max_in;
        let mut eta_ext = 1e-12;
        let mut eta_in = 1e-12;
        let mut proposal = BclProposal {
            mu_eq: results.info.mu_eq,
            mu_in: results.info.mu_in,
            mu_eq_inv: results.info.mu_eq_inv,
            mu_in_inv: results.info.mu_in_inv,
        };

        bcl_update(
            &settings,
            &mut results,
            &mut work,
            1.0,
            &mut eta_ext,
            &mut eta_in,
            0.5,
            1e-9,
            &mut proposal,
        );

        assert_eq!(proposal.mu_eq, settings.mu_max_eq);
        assert_eq!(proposal.mu_in, settings.mu_max_in);
    }

    #[test]
    fn test_cold_restart_trigger() {
        // no progress on either residual and mu_in past the threshold
        assert!(cold_restart_needed(1.0, 1.0, 0.5, 1e5));
        assert!(cold_restart_needed(0.5, 0.5, 0.5, 1e6));
        // progress on the primal side holds the restart off
        assert!(!cold_restart_needed(0.4, 1.0, 0.5, 1e6));
        // small mu never restarts
        assert!(!cold_restart_needed(1.0, 1.0, 0.5, 1e4));
        // a zero previous residual is floored at machine epsilon
        assert!(cold_restart_needed(1.0, 1.0, 0.0, 1e6));
    }
}
