//! Solver workspace.
//!
//! Owns every scratch buffer, the scaled problem copy, the preconditioner,
//! and the LDL^T factorization together with its scratch slab. Everything is
//! allocated once at construction; the hot path never allocates.
//!
//! Invariants maintained between outer iterations:
//!
//! - the factorization covers the (n + n_eq + n_c) KKT system: H_scaled +
//!   rho*I on the primal block, A_scaled^T / A_scaled on the equality
//!   borders, -1/mu_eq on the equality diagonal, and one appended row/column
//!   per active inequality with diagonal -1/mu_in
//! - `current_bijection_map` is a permutation of `0..n_in`; entries < n_c
//!   name the factorization slot of an active row, entries >= n_c mark
//!   inactive rows

use crate::linalg::dense::Mat;
use crate::linalg::ldlt::{LdltFactor, LdltScratch};
use crate::precond::{Preconditioner, QpViewMut};
use crate::Scalar;

/// All solver state that is neither the model nor the results.
#[derive(Debug)]
pub struct Workspace {
    /// Number of primal variables
    pub n: usize,
    /// Number of equality constraints
    pub n_eq: usize,
    /// Number of inequality constraints
    pub n_in: usize,

    /// Scaled quadratic cost
    pub h_scaled: Mat,
    /// Scaled linear cost
    pub g_scaled: Vec<Scalar>,
    /// Scaled equality matrix
    pub a_scaled: Mat,
    /// Scaled equality right-hand side
    pub b_scaled: Vec<Scalar>,
    /// Scaled inequality matrix
    pub c_scaled: Mat,
    /// Scaled upper bounds
    pub u_scaled: Vec<Scalar>,
    /// Scaled lower bounds
    pub l_scaled: Vec<Scalar>,

    /// The scaling object (survives `cleanup`, so KEEP can reuse it)
    pub ruiz: Preconditioner,

    /// KKT buffer for the (n + n_eq) block; active inequality rows live only
    /// inside the factorization
    pub kkt: Mat,
    /// The factorization engine
    pub ldl: LdltFactor,
    /// Scratch slab passed into every engine call
    pub ldl_scratch: LdltScratch,

    /// Number of currently active inequalities (factored rows)
    pub n_c: usize,
    /// Inequality row -> factorization slot (permutation of 0..n_in)
    pub current_bijection_map: Vec<usize>,
    /// Rows whose upper side is active
    pub active_set_up: Vec<bool>,
    /// Rows whose lower side is active
    pub active_set_low: Vec<bool>,
    /// Union of the two active sides
    pub active_inequalities: Vec<bool>,

    /// Right-hand side of the permuted KKT system (n + n_eq + n_in)
    pub rhs: Vec<Scalar>,
    /// Step / scratch vector (n + n_eq + n_in)
    pub dw_aug: Vec<Scalar>,
    /// Refinement residual (n + n_eq + n_in)
    pub err: Vec<Scalar>,

    /// Scaled equality residual buffer (n_eq)
    pub primal_residual_eq_scaled: Vec<Scalar>,
    /// Upper inequality residual buffer (n_in)
    pub primal_residual_in_scaled_up: Vec<Scalar>,
    /// Lower inequality residual buffer (n_in)
    pub primal_residual_in_scaled_low: Vec<Scalar>,
    /// Line-search scratch: shifted upper residual (n_in)
    pub primal_residual_in_scaled_up_plus_alpha_cdx: Vec<Scalar>,
    /// Line-search scratch: shifted lower residual (n_in)
    pub primal_residual_in_scaled_low_plus_alpha_cdx: Vec<Scalar>,
    /// Scaled dual residual buffer (n)
    pub dual_residual_scaled: Vec<Scalar>,
    /// Dual-sized scratch for H x / A^T y / C^T z terms (n)
    pub ctz: Vec<Scalar>,
    /// Active multiplier scratch (n_in)
    pub active_part_z: Vec<Scalar>,

    /// Previous outer iterate
    pub x_prev: Vec<Scalar>,
    /// Previous equality multipliers
    pub y_prev: Vec<Scalar>,
    /// Previous inequality multipliers
    pub z_prev: Vec<Scalar>,

    /// H * dx (+ proximal and equality terms, strategy-dependent)
    pub hdx: Vec<Scalar>,
    /// A * dx (possibly with the dual correction folded in)
    pub adx: Vec<Scalar>,
    /// C * dx
    pub cdx: Vec<Scalar>,
    /// Step length chosen by the last line search
    pub alpha: Scalar,
    /// Line-search breakpoint scratch (capacity 3 * n_in, reused)
    pub alphas: Vec<Scalar>,

    /// ||b||_inf on the unscaled model
    pub primal_feasibility_rhs_1_eq: Scalar,
    /// ||u||_inf on the unscaled model
    pub primal_feasibility_rhs_1_in_u: Scalar,
    /// ||l||_inf on the unscaled model
    pub primal_feasibility_rhs_1_in_l: Scalar,
    /// ||g||_inf on the unscaled model
    pub dual_feasibility_rhs_2: Scalar,
    /// ||g_scaled||_inf, the inner-loop stopping constant
    pub correction_guess_rhs_g: Scalar,

    /// A matrix update invalidated the factorization; the next solve rebuilds
    /// it before iterating
    pub needs_refactorization: bool,
}

impl Workspace {
    /// Allocate a workspace for the given dimensions.
    pub fn new(n: usize, n_eq: usize, n_in: usize) -> Self {
        let full = n + n_eq + n_in;
        let mut ws = Self {
            n,
            n_eq,
            n_in,
            h_scaled: Mat::zeros(n, n),
            g_scaled: vec![0.0; n],
            a_scaled: Mat::zeros(n_eq, n),
            b_scaled: vec![0.0; n_eq],
            c_scaled: Mat::zeros(n_in, n),
            u_scaled: vec![0.0; n_in],
            l_scaled: vec![0.0; n_in],
            ruiz: Preconditioner::Identity,
            kkt: Mat::zeros(n + n_eq, n + n_eq),
            ldl: LdltFactor::new(full),
            ldl_scratch: LdltScratch::new(full),
            n_c: 0,
            current_bijection_map: (0..n_in).collect(),
            active_set_up: vec![false; n_in],
            active_set_low: vec![false; n_in],
            active_inequalities: vec![false; n_in],
            rhs: vec![0.0; full],
            dw_aug: vec![0.0; full],
            err: vec![0.0; full],
            primal_residual_eq_scaled: vec![0.0; n_eq],
            primal_residual_in_scaled_up: vec![0.0; n_in],
            primal_residual_in_scaled_low: vec![0.0; n_in],
            primal_residual_in_scaled_up_plus_alpha_cdx: vec![0.0; n_in],
            primal_residual_in_scaled_low_plus_alpha_cdx: vec![0.0; n_in],
            dual_residual_scaled: vec![0.0; n],
            ctz: vec![0.0; n],
            active_part_z: vec![0.0; n_in],
            x_prev: vec![0.0; n],
            y_prev: vec![0.0; n_eq],
            z_prev: vec![0.0; n_in],
            hdx: vec![0.0; n],
            adx: vec![0.0; n_eq],
            cdx: vec![0.0; n_in],
            alpha: 1.0,
            alphas: Vec::with_capacity(3 * n_in),
            primal_feasibility_rhs_1_eq: 0.0,
            primal_feasibility_rhs_1_in_u: 0.0,
            primal_feasibility_rhs_1_in_l: 0.0,
            dual_feasibility_rhs_2: 0.0,
            correction_guess_rhs_g: 0.0,
            needs_refactorization: false,
        };
        ws.cleanup();
        ws
    }

    /// Reset every buffer to its post-construction state. The preconditioner
    /// is deliberately left alone so a later KEEP directive can reuse it.
    pub fn cleanup(&mut self) {
        self.h_scaled.fill_zero();
        self.g_scaled.fill(0.0);
        self.a_scaled.fill_zero();
        self.b_scaled.fill(0.0);
        self.c_scaled.fill_zero();
        self.u_scaled.fill(0.0);
        self.l_scaled.fill(0.0);
        self.kkt.fill_zero();
        self.n_c = 0;
        for (i, slot) in self.current_bijection_map.iter_mut().enumerate() {
            *slot = i;
        }
        self.active_set_up.fill(false);
        self.active_set_low.fill(false);
        self.active_inequalities.fill(false);
        self.rhs.fill(0.0);
        self.dw_aug.fill(0.0);
        self.err.fill(0.0);
        self.primal_residual_eq_scaled.fill(0.0);
        self.primal_residual_in_scaled_up.fill(0.0);
        self.primal_residual_in_scaled_low.fill(0.0);
        self.primal_residual_in_scaled_up_plus_alpha_cdx.fill(0.0);
        self.primal_residual_in_scaled_low_plus_alpha_cdx.fill(0.0);
        self.dual_residual_scaled.fill(0.0);
        self.ctz.fill(0.0);
        self.active_part_z.fill(0.0);
        self.x_prev.fill(0.0);
        self.y_prev.fill(0.0);
        self.z_prev.fill(0.0);
        self.hdx.fill(0.0);
        self.adx.fill(0.0);
        self.cdx.fill(0.0);
        self.alpha = 1.0;
        self.alphas.clear();
        self.primal_feasibility_rhs_1_eq = 0.0;
        self.primal_feasibility_rhs_1_in_u = 0.0;
        self.primal_feasibility_rhs_1_in_l = 0.0;
        self.dual_feasibility_rhs_2 = 0.0;
        self.correction_guess_rhs_g = 0.0;
        self.needs_refactorization = false;
    }

    /// Borrow the scaled problem buffers for the preconditioner, splitting
    /// around the `ruiz` field.
    pub fn scaled_qp_parts(&mut self) -> (&mut Preconditioner, QpViewMut<'_>) {
        (
            &mut self.ruiz,
            QpViewMut {
                h: &mut self.h_scaled,
                g: &mut self.g_scaled,
                a: &mut self.a_scaled,
                b: &mut self.b_scaled,
                c: &mut self.c_scaled,
                u: &mut self.u_scaled,
                l: &mut self.l_scaled,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_restores_identity_bijection() {
        let mut ws = Workspace::new(3, 1, 4);
        ws.n_c = 2;
        ws.current_bijection_map.copy_from_slice(&[2, 0, 3, 1]);
        ws.active_set_up[1] = true;
        ws.alpha = 0.25;

        ws.cleanup();

        assert_eq!(ws.n_c, 0);
        assert_eq!(ws.current_bijection_map, vec![0, 1, 2, 3]);
        assert!(!ws.active_set_up[1]);
        assert_eq!(ws.alpha, 1.0);
    }
}
