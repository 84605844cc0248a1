//! The permuted KKT solve: iterative refinement, refactorization, and the
//! rank-one penalty updates.
//!
//! The factorization is the only approximate object in the solver; everything
//! here defends against its drift. `iterative_solve_with_permut_fact` refines
//! the direct solve against the *explicit* KKT operator (problem data plus
//! diagonal shifts, never the factors), and falls back to a from-scratch
//! refactorization exactly once when refinement stalls above the
//! refactorization tolerance.

use crate::alm::workspace::Workspace;
use crate::linalg::dense::{dot, inf_norm};
use crate::linalg::ldlt::LdltError;
use crate::problem::{Results, SolverSettings};
use crate::Scalar;

/// Apply the explicit KKT operator: `err[..dim] = rhs[..dim] - M * dw[..dim]`.
///
/// M is assembled on the fly from the scaled data, the proximal/penalty
/// diagonals, and the bijection map; the factors are never consulted.
pub fn iterative_residual(results: &Results, work: &mut Workspace, inner_pb_dim: usize) {
    let n = work.n;
    let n_eq = work.n_eq;
    let n_in = work.n_in;
    let n_c = work.n_c;
    let Workspace {
        err,
        rhs,
        dw_aug,
        h_scaled,
        a_scaled,
        c_scaled,
        current_bijection_map,
        ..
    } = work;

    err[..inner_pb_dim].copy_from_slice(&rhs[..inner_pb_dim]);

    let (dx, dtail) = dw_aug[..inner_pb_dim].split_at(n);
    let dy = &dtail[..n_eq];

    h_scaled.mul_vec_acc(dx, -1.0, &mut err[..n]);
    for (e, d) in err[..n].iter_mut().zip(dx.iter()) {
        *e -= results.info.rho * d;
    }
    a_scaled.tr_mul_vec_acc(dy, -1.0, &mut err[..n]);

    for i in 0..n_in {
        let j = current_bijection_map[i];
        if j < n_c {
            let dz_j = dw_aug[n + n_eq + j];
            let row = c_scaled.row(i);
            for (e, cij) in err[..n].iter_mut().zip(row.iter()) {
                *e -= dz_j * cij;
            }
            err[n + n_eq + j] -=
                dot(row, &dw_aug[..n]) - dz_j * results.info.mu_in_inv;
        }
    }

    for (i, e) in err[n..n + n_eq].iter_mut().enumerate() {
        *e -= dot(a_scaled.row(i), &dw_aug[..n])
            - dw_aug[n + i] * results.info.mu_eq_inv;
    }
}

/// Rebuild the factorization from scratch at the proximal parameter
/// `rho_new`: refresh the (n + n_eq) KKT block, factorize it, and re-insert
/// the active inequality rows in ascending slot order.
pub fn refactorize(
    results: &Results,
    work: &mut Workspace,
    rho_new: Scalar,
) -> Result<(), LdltError> {
    let n = work.n;
    let n_eq = work.n_eq;

    work.dw_aug.fill(0.0);
    for i in 0..n {
        work.kkt[(i, i)] += rho_new - results.info.rho;
    }
    for i in 0..n_eq {
        work.kkt[(n + i, n + i)] = -results.info.mu_eq_inv;
    }
    work.ldl.factorize(&work.kkt, &mut work.ldl_scratch)?;

    for j in 0..work.n_c {
        for i in 0..work.n_in {
            if j == work.current_bijection_map[i] {
                let dim = n + n_eq + j;
                work.dw_aug[..n].copy_from_slice(work.c_scaled.row(i));
                work.dw_aug[dim] = -results.info.mu_in_inv;
                work.ldl
                    .insert_at(dim, &work.dw_aug[..dim + 1], &mut work.ldl_scratch)?;
                work.dw_aug[dim] = 0.0;
            }
        }
    }
    work.dw_aug.fill(0.0);
    Ok(())
}

/// Shift the penalty diagonals of the factorization to new values.
///
/// A diagonal shift is a sum of rank-one updates along basis vectors: one per
/// equality row, one per active inequality slot.
pub fn mu_update(
    results: &Results,
    work: &mut Workspace,
    mu_eq_new_inv: Scalar,
    mu_in_new_inv: Scalar,
) -> Result<(), LdltError> {
    let n = work.n;
    let n_eq = work.n_eq;
    let dim = n + n_eq + work.n_c;
    work.dw_aug[..dim].fill(0.0);

    if n_eq > 0 {
        let diff = results.info.mu_eq_inv - mu_eq_new_inv;
        for i in 0..n_eq {
            work.dw_aug[n + i] = 1.0;
            work.ldl
                .rank_one_update(&work.dw_aug[..dim], diff, &mut work.ldl_scratch)?;
            work.dw_aug[n + i] = 0.0;
        }
    }
    if work.n_c > 0 {
        let diff = results.info.mu_in_inv - mu_in_new_inv;
        for i in 0..work.n_c {
            work.dw_aug[n + n_eq + i] = 1.0;
            work.ldl
                .rank_one_update(&work.dw_aug[..dim], diff, &mut work.ldl_scratch)?;
            work.dw_aug[n + n_eq + i] = 0.0;
        }
    }
    Ok(())
}

/// Solve the permuted KKT system for `dw_aug[..inner_pb_dim]` given
/// `rhs[..inner_pb_dim]`, refining until the residual drops below `eps`.
///
/// Refinement stops early after two consecutive non-decreasing residuals.
/// If the residual still exceeds `max(eps, eps_refact)`, the factorization is
/// rebuilt from scratch and the refinement loop restarts once.
pub fn iterative_solve_with_permut_fact(
    settings: &SolverSettings,
    results: &Results,
    work: &mut Workspace,
    eps: Scalar,
    inner_pb_dim: usize,
) -> Result<(), LdltError> {
    work.err.fill(0.0);

    let refine_loop = |work: &mut Workspace| -> Scalar {
        work.dw_aug[..inner_pb_dim].copy_from_slice(&work.rhs[..inner_pb_dim]);
        work.ldl.solve_in_place(&mut work.dw_aug[..inner_pb_dim]);
        iterative_residual(results, work, inner_pb_dim);

        let mut it = 1;
        let mut it_stability = 0;
        let mut preverr = inf_norm(&work.err[..inner_pb_dim]);
        if settings.verbose {
            eprintln!("refine: |res|_inf = {preverr:.3e}");
        }
        while inf_norm(&work.err[..inner_pb_dim]) >= eps {
            if it >= settings.nb_iterative_refinement {
                break;
            }
            it += 1;
            work.ldl.solve_in_place(&mut work.err[..inner_pb_dim]);
            for i in 0..inner_pb_dim {
                work.dw_aug[i] += work.err[i];
            }
            work.err[..inner_pb_dim].fill(0.0);
            iterative_residual(results, work, inner_pb_dim);

            let cur = inf_norm(&work.err[..inner_pb_dim]);
            if cur > preverr {
                it_stability += 1;
            } else {
                it_stability = 0;
            }
            if it_stability == 2 {
                break;
            }
            preverr = cur;
            if settings.verbose {
                eprintln!("refine: |res|_inf = {cur:.3e}");
            }
        }
        inf_norm(&work.err[..inner_pb_dim])
    };

    let residual = refine_loop(work);
    if residual >= eps.max(settings.eps_refact) {
        refactorize(results, work, results.info.rho)?;
        refine_loop(work);
    }
    work.rhs[..inner_pb_dim].fill(0.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::dense::Mat;
    use crate::problem::SolverSettings;
    use nalgebra::DMatrix;

    /// A hand-assembled workspace for a 2-variable, 1-equality, 2-inequality
    /// problem with inequality row 0 active.
    fn kkt_setup() -> (Results, Workspace) {
        let (n, n_eq, n_in) = (2, 1, 2);
        let mut work = Workspace::new(n, n_eq, n_in);
        work.h_scaled = Mat::from_dmatrix(&DMatrix::from_row_slice(2, 2, &[
            2.0, 0.5, //
            0.5, 1.5,
        ]));
        work.a_scaled = Mat::from_dmatrix(&DMatrix::from_row_slice(1, 2, &[1.0, -1.0]));
        work.c_scaled = Mat::from_dmatrix(&DMatrix::from_row_slice(2, 2, &[
            1.0, 1.0, //
            0.0, 1.0,
        ]));

        let mut results = Results::new(n, n_eq, n_in, &SolverSettings::default());
        results.info.rho = 1e-6;
        results.info.mu_eq = 1e3;
        results.info.mu_eq_inv = 1e-3;
        results.info.mu_in = 1e1;
        results.info.mu_in_inv = 1e-1;

        // (n + n_eq) block
        for i in 0..n {
            for j in 0..n {
                work.kkt[(i, j)] = work.h_scaled[(i, j)];
            }
            work.kkt[(i, i)] += results.info.rho;
            work.kkt[(i, n)] = work.a_scaled[(0, i)];
            work.kkt[(n, i)] = work.a_scaled[(0, i)];
        }
        work.kkt[(n, n)] = -results.info.mu_eq_inv;

        // activate inequality row 0
        work.n_c = 1;
        work.current_bijection_map.copy_from_slice(&[0, 1]);
        refactorize(&results, &mut work, results.info.rho).unwrap();
        (results, work)
    }

    /// Dense copy of the active KKT operator for cross-checking.
    fn explicit_kkt(results: &Results, work: &Workspace) -> Mat {
        let dim = work.n + work.n_eq + work.n_c;
        let mut m = Mat::zeros(dim, dim);
        for i in 0..work.n {
            for j in 0..work.n {
                m[(i, j)] = work.h_scaled[(i, j)];
            }
            m[(i, i)] += results.info.rho;
        }
        for e in 0..work.n_eq {
            for j in 0..work.n {
                m[(work.n + e, j)] = work.a_scaled[(e, j)];
                m[(j, work.n + e)] = work.a_scaled[(e, j)];
            }
            m[(work.n + e, work.n + e)] = -results.info.mu_eq_inv;
        }
        for i in 0..work.n_in {
            let slot = work.current_bijection_map[i];
            if slot < work.n_c {
                let k = work.n + work.n_eq + slot;
                for j in 0..work.n {
                    m[(k, j)] = work.c_scaled[(i, j)];
                    m[(j, k)] = work.c_scaled[(i, j)];
                }
                m[(k, k)] = -results.info.mu_in_inv;
            }
        }
        m
    }

    #[test]
    fn test_iterative_solve_residual_bound() {
        let (results, mut work) = kkt_setup();
        let settings = SolverSettings::default();
        let dim = work.n + work.n_eq + work.n_c;

        work.rhs[..dim].copy_from_slice(&[1.0, -2.0, 0.5, 0.25]);
        let m = explicit_kkt(&results, &work);
        let rhs_copy: Vec<Scalar> = work.rhs[..dim].to_vec();

        iterative_solve_with_permut_fact(&settings, &results, &mut work, 1e-12, dim).unwrap();

        let mut r = rhs_copy.clone();
        m.mul_vec_acc(&work.dw_aug[..dim], -1.0, &mut r);
        assert!(
            inf_norm(&r) <= settings.eps_refact.max(1e-12).max(1e-10),
            "KKT solve residual too large: {}",
            inf_norm(&r)
        );
        // rhs is consumed
        assert!(work.rhs[..dim].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_mu_update_shifts_diagonals() {
        let (mut results, mut work) = kkt_setup();
        let dim = work.n + work.n_eq + work.n_c;

        let new_eq_inv = 1e-4;
        let new_in_inv = 1e-2;
        mu_update(&results, &mut work, new_eq_inv, new_in_inv).unwrap();
        results.info.mu_eq_inv = new_eq_inv;
        results.info.mu_in_inv = new_in_inv;
        results.info.mu_eq = 1.0 / new_eq_inv;
        results.info.mu_in = 1.0 / new_in_inv;
        // the kkt buffer is refreshed lazily by refactorize; patch it here so
        // the explicit operator matches the shifted factors
        work.kkt[(work.n, work.n)] = -new_eq_inv;

        let m = explicit_kkt(&results, &work);
        let recon = work.ldl.reconstructed_matrix();
        let mut diff: Scalar = 0.0;
        for i in 0..dim {
            for j in 0..dim {
                diff = diff.max((m[(i, j)] - recon[(i, j)]).abs());
            }
        }
        assert!(diff < 1e-10, "mu shift drifted from the operator: {diff}");
    }

    #[test]
    fn test_refactorize_matches_incremental_state() {
        let (results, mut work) = kkt_setup();
        let dim = work.n + work.n_eq + work.n_c;
        let before = work.ldl.reconstructed_matrix();

        refactorize(&results, &mut work, results.info.rho).unwrap();
        let after = work.ldl.reconstructed_matrix();

        let mut diff: Scalar = 0.0;
        for i in 0..dim {
            for j in 0..dim {
                diff = diff.max((before[(i, j)] - after[(i, j)]).abs());
            }
        }
        assert!(diff < 1e-12);
    }
}
