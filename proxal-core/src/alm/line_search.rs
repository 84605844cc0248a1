//! Exact line searches for the two step strategies.
//!
//! Both merits are piecewise polynomials of the step length whose breakpoints
//! are the step lengths at which a shifted inequality residual or a
//! multiplier changes sign. Between breakpoints the correction-guess merit
//! derivative is linear and the initial-guess merit is quadratic, so the
//! minimizers are computed exactly: a linear root for the first, a
//! per-interval quadratic vertex for the second. Ties go to the smaller step.

use crate::alm::workspace::Workspace;
use crate::linalg::dense::{dot, negative_part, positive_part};
use crate::problem::Results;
use crate::Scalar;

/// Line search of the correction (Newton) step.
///
/// Minimizes the primal proximal augmented-Lagrangian objective along `dx`
/// over (0, 1]. Its derivative
///
/// ```text
/// phi'(a) = dx . grad_phi(x) + a * (dx.H dx + rho |dx|^2 + mu_eq |A dx|^2)
///         + mu_in * ( sum_i [s_up_i + a Cdx_i]_+ Cdx_i
///                   + sum_i [s_low_i + a Cdx_i]_- Cdx_i
///                   - (value of the same sums at a = 0) )
/// ```
///
/// is piecewise linear and nondecreasing; `dual_residual_scaled` holds
/// `grad_phi(x)` on entry, so the constant term needs no extra mat-vec.
/// Stores the chosen step in `work.alpha`.
pub fn correction_guess_ls(results: &Results, work: &mut Workspace) {
    let n = work.n;
    let mu_in = results.info.mu_in;

    let mut alphas = std::mem::take(&mut work.alphas);
    alphas.clear();
    for i in 0..work.n_in {
        let cdx = work.cdx[i];
        if cdx == 0.0 {
            continue;
        }
        for s in [
            work.primal_residual_in_scaled_up[i],
            work.primal_residual_in_scaled_low[i],
        ] {
            let bp = -s / cdx;
            if bp.is_finite() && bp > 0.0 {
                alphas.push(bp);
            }
        }
    }
    alphas.sort_unstable_by(Scalar::total_cmp);

    let dx = &work.dw_aug[..n];
    let d0 = dot(dx, &work.dual_residual_scaled);
    let a1 = dot(dx, &work.hdx)
        + results.info.rho * dot(dx, dx)
        + results.info.mu_eq * dot(&work.adx, &work.adx);

    let p_of = |alpha: Scalar| -> Scalar {
        let mut acc = 0.0;
        for i in 0..work.n_in {
            let cdx = work.cdx[i];
            if cdx == 0.0 {
                continue;
            }
            acc += positive_part(work.primal_residual_in_scaled_up[i] + alpha * cdx) * cdx;
            acc += negative_part(work.primal_residual_in_scaled_low[i] + alpha * cdx) * cdx;
        }
        acc
    };
    let p0 = p_of(0.0);
    let dphi = |alpha: Scalar| d0 + alpha * a1 + mu_in * (p_of(alpha) - p0);

    // walk the segments until the derivative turns nonnegative, then take the
    // exact linear root inside that segment
    let mut lo = 0.0;
    let mut d_lo = dphi(0.0);
    let mut root = None;
    if d_lo >= 0.0 {
        root = Some(0.0);
    } else {
        for &hi in alphas.iter() {
            if hi <= lo {
                continue;
            }
            let d_hi = dphi(hi);
            if d_hi >= 0.0 {
                root = Some(linear_root(lo, d_lo, hi, d_hi));
                break;
            }
            lo = hi;
            d_lo = d_hi;
        }
    }
    let alpha = root.unwrap_or_else(|| {
        // last (unbounded) segment: the derivative is linear there, so two
        // samples pin the root
        let hi = lo + 1.0;
        let d_hi = dphi(hi);
        if d_hi > d_lo {
            linear_root(lo, d_lo, hi, d_hi)
        } else {
            1.0
        }
    });
    work.alphas = alphas;
    work.alpha = alpha.min(1.0);
}

#[inline]
fn linear_root(lo: Scalar, d_lo: Scalar, hi: Scalar, d_hi: Scalar) -> Scalar {
    if d_hi > d_lo {
        (lo - d_lo * (hi - lo) / (d_hi - d_lo)).clamp(lo, hi)
    } else {
        hi
    }
}

/// Line search of the initial-guess step.
///
/// Minimizes the squared saddle-point residual of the proximal subproblem
/// along the full direction (dx, dy, dz). The residual is piecewise affine in
/// the step, with breakpoints wherever a shifted inequality residual or a
/// candidate multiplier changes sign; the merit is therefore piecewise
/// quadratic and each piece is minimized exactly. Stores the result in
/// `work.alpha`; the caller treats |alpha| < 1e-10 as a failed guess.
pub fn initial_guess_ls(results: &Results, work: &mut Workspace) {
    let n = work.n;
    let n_eq = work.n_eq;
    let n_in = work.n_in;

    work.alphas.clear();
    for i in 0..n_in {
        let cdx = work.cdx[i];
        if cdx != 0.0 {
            for s in [
                work.primal_residual_in_scaled_up[i],
                work.primal_residual_in_scaled_low[i],
            ] {
                let bp = -s / cdx;
                if bp.is_finite() && bp > 0.0 {
                    work.alphas.push(bp);
                }
            }
        }
        let dz = work.dw_aug[n + n_eq + i];
        if dz != 0.0 {
            let bp = -results.z[i] / dz;
            if bp.is_finite() && bp > 0.0 {
                work.alphas.push(bp);
            }
        }
    }
    work.alphas.sort_unstable_by(Scalar::total_cmp);

    // seed with the zero step so that a flat merit resolves to the smaller
    // alpha (the caller turns a vanishing step into a correction-guess pass)
    let mut best_alpha = 0.0;
    let mut best_merit = saddle_merit(results, work, 0.0);
    {
        let mut consider = |alpha: Scalar, work: &mut Workspace| {
            let merit = saddle_merit(results, work, alpha);
            if merit < best_merit {
                best_merit = merit;
                best_alpha = alpha;
            }
        };

        // segment endpoints
        for k in 0..work.alphas.len() {
            let bp = work.alphas[k];
            consider(bp, work);
        }

        // per-segment quadratic vertices; the segment past the last
        // breakpoint (or the whole axis when there is none) is handled with a
        // unit-length probe, which is exact for a quadratic piece
        let mut lo = 0.0;
        for k in 0..=work.alphas.len() {
            let hi = if k < work.alphas.len() {
                work.alphas[k]
            } else {
                lo + 1.0
            };
            if hi <= lo {
                continue;
            }
            let h = hi - lo;
            let t1 = lo + 0.25 * h;
            let t2 = lo + 0.5 * h;
            let t3 = lo + 0.75 * h;
            let m1 = saddle_merit(results, work, t1);
            let m2 = saddle_merit(results, work, t2);
            let m3 = saddle_merit(results, work, t3);
            if m1.is_finite() && m2.is_finite() && m3.is_finite() {
                let step = 0.25 * h;
                let curv = (m3 - 2.0 * m2 + m1) / (step * step);
                let slope = (m3 - m1) / (2.0 * step);
                if curv > 0.0 {
                    let vertex = t2 - slope / curv;
                    if vertex.is_finite() {
                        // interior segments clamp to their interval; the last
                        // segment extends to +inf, the first down to 0 only
                        let upper = if k < work.alphas.len() {
                            hi
                        } else {
                            Scalar::INFINITY
                        };
                        consider(vertex.clamp(lo, upper), work);
                    }
                } else {
                    consider(t2, work);
                }
            }
            lo = hi;
        }

        // no breakpoints at all: the merit is one global quadratic and the
        // unconstrained vertex may sit at negative alpha
        if work.alphas.is_empty() {
            let m0 = saddle_merit(results, work, 0.0);
            let m_pos = saddle_merit(results, work, 1.0);
            let m_neg = saddle_merit(results, work, -1.0);
            let curv = m_pos - 2.0 * m0 + m_neg;
            let slope = (m_pos - m_neg) / 2.0;
            if curv > 0.0 {
                let vertex = -slope / curv;
                if vertex.is_finite() {
                    consider(vertex, work);
                }
            }
        }
    }
    work.alpha = best_alpha;
}

/// Squared 2-norm of the proximal saddle-point residual at step `alpha`.
///
/// Mirrors the post-step update rules and the outer saddle-point error: the
/// candidate multiplier is projected by the active side, and the
/// complementarity rows follow the sign of the projected multiplier.
fn saddle_merit(results: &Results, work: &mut Workspace, alpha: Scalar) -> Scalar {
    let n = work.n;
    let n_eq = work.n_eq;
    let n_in = work.n_in;
    let mu_in_inv = results.info.mu_in_inv;
    let mut acc = 0.0;

    // inequality complementarity rows, and the projected multiplier z(alpha)
    // (stashed in active_part_z for the dual matvec below)
    for i in 0..n_in {
        let s_up = work.primal_residual_in_scaled_up[i] + alpha * work.cdx[i];
        let s_low = work.primal_residual_in_scaled_low[i] + alpha * work.cdx[i];
        let zt = results.z[i] + alpha * work.dw_aug[n + n_eq + i];
        let z_a = if s_up >= 0.0 {
            positive_part(zt)
        } else if s_low <= 0.0 {
            negative_part(zt)
        } else {
            zt
        };
        work.active_part_z[i] = z_a;

        let r = if z_a > 0.0 {
            s_up - z_a * mu_in_inv
        } else if z_a < 0.0 {
            s_low - z_a * mu_in_inv
        } else {
            positive_part(s_up) + negative_part(s_low)
        };
        acc += r * r;
    }

    // dual rows: dual_residual_scaled excludes C^T z here
    work.err[..n].copy_from_slice(&work.dual_residual_scaled);
    for (e, h) in work.err[..n].iter_mut().zip(work.hdx.iter()) {
        *e += alpha * h;
    }
    let (err_head, _) = work.err.split_at_mut(n);
    work.c_scaled
        .tr_mul_vec_acc(&work.active_part_z, 1.0, err_head);
    for e in err_head.iter() {
        acc += e * e;
    }

    // equality rows
    for i in 0..n_eq {
        let r = work.primal_residual_eq_scaled[i] + alpha * work.adx[i];
        acc += r * r;
    }
    acc
}
