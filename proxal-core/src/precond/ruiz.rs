//! Ruiz equilibration.
//!
//! Iteratively scales rows and columns of the stacked constraint data so that
//! their sup-norms approach 1. Each sweep:
//!
//! 1. For every primal column j: the sup-norm over column j of H, A, and C
//!    gives the column factor `1/sqrt(norm)`.
//! 2. For every constraint row: the sup-norm of the A (resp. C) row gives the
//!    row factor.
//! 3. Apply the factors, accumulate them into `delta`, and normalize the
//!    objective by `1 / max(1, mean column sup-norm of H, ||g||_inf)`,
//!    accumulated into the cost scalar `c`.
//!
//! Sweeps stop when the largest deviation of any norm from 1 drops below
//! `epsilon`, or after `max_iter` sweeps.

use super::QpViewMut;
use crate::linalg::dense::inf_norm;
use crate::Scalar;

/// Stored Ruiz scaling state.
#[derive(Debug, Clone)]
pub struct RuizEquilibration {
    /// Accumulated diagonals, laid out [primal (n) | eq rows (n_eq) | in rows (n_in)]
    pub delta: Vec<Scalar>,
    /// Accumulated cost normalization
    pub c: Scalar,
    n: usize,
    n_eq: usize,
    n_in: usize,
    /// Sweep convergence tolerance on the sup-norm deviation from 1
    pub epsilon: Scalar,
    /// Maximum number of sweeps
    pub max_iter: usize,
}

impl RuizEquilibration {
    /// Identity-initialized scaling for the given dimensions.
    pub fn new(n: usize, n_eq: usize, n_in: usize) -> Self {
        Self {
            delta: vec![1.0; n + n_eq + n_in],
            c: 1.0,
            n,
            n_eq,
            n_in,
            epsilon: 1e-3,
            max_iter: 10,
        }
    }

    /// Primal section of the diagonal.
    pub fn delta_x(&self) -> &[Scalar] {
        &self.delta[..self.n]
    }

    /// Equality-row section of the diagonal.
    pub fn delta_eq(&self) -> &[Scalar] {
        &self.delta[self.n..self.n + self.n_eq]
    }

    /// Inequality-row section of the diagonal.
    pub fn delta_in(&self) -> &[Scalar] {
        &self.delta[self.n + self.n_eq..]
    }

    /// Recompute the scaling from the (unscaled) data in `qp` and scale it in
    /// place.
    pub fn equilibrate(&mut self, qp: QpViewMut<'_>) {
        let QpViewMut { h, g, a, b, c, u, l } = qp;
        let (n, n_eq, n_in) = (self.n, self.n_eq, self.n_in);

        self.delta.fill(1.0);
        self.c = 1.0;

        let mut col_norms: Vec<Scalar> = vec![0.0; n];
        let mut e = vec![0.0; n + n_eq + n_in];

        for _ in 0..self.max_iter {
            // column sup-norms over the stacked [H; A; C]
            col_norms.fill(0.0);
            for i in 0..n {
                for (j, &v) in h.row(i).iter().enumerate() {
                    col_norms[j] = col_norms[j].max(v.abs());
                }
            }
            for i in 0..n_eq {
                for (j, &v) in a.row(i).iter().enumerate() {
                    col_norms[j] = col_norms[j].max(v.abs());
                }
            }
            for i in 0..n_in {
                for (j, &v) in c.row(i).iter().enumerate() {
                    col_norms[j] = col_norms[j].max(v.abs());
                }
            }

            let mut err: Scalar = 0.0;
            for j in 0..n {
                err = err.max((1.0 - col_norms[j]).abs());
                e[j] = if col_norms[j] > 0.0 {
                    1.0 / col_norms[j].sqrt()
                } else {
                    1.0
                };
            }
            for i in 0..n_eq {
                let norm = inf_norm(a.row(i));
                err = err.max((1.0 - norm).abs());
                e[n + i] = if norm > 0.0 { 1.0 / norm.sqrt() } else { 1.0 };
            }
            for i in 0..n_in {
                let norm = inf_norm(c.row(i));
                err = err.max((1.0 - norm).abs());
                e[n + n_eq + i] = if norm > 0.0 { 1.0 / norm.sqrt() } else { 1.0 };
            }

            if err <= self.epsilon {
                break;
            }

            // apply this sweep's factors
            for i in 0..n {
                let ei = e[i];
                for (j, v) in h.row_mut(i).iter_mut().enumerate() {
                    *v *= ei * e[j];
                }
                g[i] *= ei;
            }
            for i in 0..n_eq {
                let ei = e[n + i];
                for (j, v) in a.row_mut(i).iter_mut().enumerate() {
                    *v *= ei * e[j];
                }
                b[i] *= ei;
            }
            for i in 0..n_in {
                let ei = e[n + n_eq + i];
                for (j, v) in c.row_mut(i).iter_mut().enumerate() {
                    *v *= ei * e[j];
                }
                u[i] *= ei;
                l[i] *= ei;
            }
            for (dk, ek) in self.delta.iter_mut().zip(e.iter()) {
                *dk *= ek;
            }

            // objective normalization
            let mut h_col_sum = 0.0;
            for j in 0..n {
                let mut col_max: Scalar = 0.0;
                for i in 0..n {
                    col_max = col_max.max(h[(i, j)].abs());
                }
                h_col_sum += col_max;
            }
            let mean_h = if n > 0 { h_col_sum / n as Scalar } else { 0.0 };
            let gamma = 1.0 / mean_h.max(inf_norm(g)).max(1.0);
            if gamma != 1.0 {
                for i in 0..n {
                    for v in h.row_mut(i).iter_mut() {
                        *v *= gamma;
                    }
                    g[i] *= gamma;
                }
                self.c *= gamma;
            }
        }
    }

    /// Apply the stored scaling to freshly copied (unscaled) data.
    pub fn apply_stored(&self, qp: QpViewMut<'_>) {
        let QpViewMut { h, g, a, b, c, u, l } = qp;
        let (n, n_eq) = (self.n, self.n_eq);

        for i in 0..n {
            let di = self.delta[i];
            for (j, v) in h.row_mut(i).iter_mut().enumerate() {
                *v *= self.c * di * self.delta[j];
            }
            g[i] *= self.c * di;
        }
        for i in 0..n_eq {
            let di = self.delta[n + i];
            for (j, v) in a.row_mut(i).iter_mut().enumerate() {
                *v *= di * self.delta[j];
            }
            b[i] *= di;
        }
        for i in 0..self.n_in {
            let di = self.delta[n + n_eq + i];
            for (j, v) in c.row_mut(i).iter_mut().enumerate() {
                *v *= di * self.delta[j];
            }
            u[i] *= di;
            l[i] *= di;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::dense::Mat;
    use crate::precond::Preconditioner;
    use nalgebra::DMatrix;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    struct TestQp {
        h: Mat,
        g: Vec<Scalar>,
        a: Mat,
        b: Vec<Scalar>,
        c: Mat,
        u: Vec<Scalar>,
        l: Vec<Scalar>,
    }

    impl TestQp {
        fn random(n: usize, n_eq: usize, n_in: usize, rng: &mut ChaCha8Rng) -> Self {
            let mut rand_mat = |rows: usize, cols: usize, scale: Scalar| {
                let mut m = Mat::zeros(rows, cols);
                for i in 0..rows {
                    for j in 0..cols {
                        m[(i, j)] = scale * rng.gen_range(-1.0..1.0);
                    }
                }
                m
            };
            let mut h = rand_mat(n, n, 100.0);
            // symmetrize with a dominant diagonal
            for i in 0..n {
                for j in 0..i {
                    let v = 0.5 * (h[(i, j)] + h[(j, i)]);
                    h[(i, j)] = v;
                    h[(j, i)] = v;
                }
                h[(i, i)] = h[(i, i)].abs() + 100.0 * n as Scalar;
            }
            let a = rand_mat(n_eq, n, 0.01);
            let c = rand_mat(n_in, n, 10.0);
            Self {
                h,
                g: (0..n).map(|_| rng.gen_range(-5.0..5.0)).collect(),
                a,
                b: (0..n_eq).map(|_| rng.gen_range(-1.0..1.0)).collect(),
                c,
                u: (0..n_in).map(|_| rng.gen_range(0.0..1.0)).collect(),
                l: (0..n_in).map(|_| rng.gen_range(-1.0..0.0)).collect(),
            }
        }

        fn view(&mut self) -> QpViewMut<'_> {
            QpViewMut {
                h: &mut self.h,
                g: &mut self.g,
                a: &mut self.a,
                b: &mut self.b,
                c: &mut self.c,
                u: &mut self.u,
                l: &mut self.l,
            }
        }
    }

    #[test]
    fn test_identity_is_noop() {
        let p = Preconditioner::Identity;
        let mut x = vec![1.0, -2.0, 3.0];
        p.scale_primal_in_place(&mut x);
        p.unscale_dual_residual_in_place(&mut x);
        assert_eq!(x, vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_scale_unscale_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut qp = TestQp::random(4, 2, 3, &mut rng);
        let mut ruiz = RuizEquilibration::new(4, 2, 3);
        ruiz.equilibrate(qp.view());
        let p = Preconditioner::Ruiz(ruiz);

        let check = |orig: &[Scalar], v: &[Scalar]| {
            let bound = 10.0 * Scalar::EPSILON * inf_norm(orig);
            for (a, b) in orig.iter().zip(v.iter()) {
                assert!((a - b).abs() <= bound, "roundtrip drift: {a} vs {b}");
            }
        };

        let orig: Vec<Scalar> = (0..4).map(|_| rng.gen_range(-3.0..3.0)).collect();
        let mut v = orig.clone();
        p.unscale_primal_in_place(&mut v);
        p.scale_primal_in_place(&mut v);
        check(&orig, &v);

        let orig: Vec<Scalar> = (0..2).map(|_| rng.gen_range(-3.0..3.0)).collect();
        let mut v = orig.clone();
        p.unscale_dual_in_place_eq(&mut v);
        p.scale_dual_in_place_eq(&mut v);
        check(&orig, &v);

        let orig: Vec<Scalar> = (0..3).map(|_| rng.gen_range(-3.0..3.0)).collect();
        let mut v = orig.clone();
        p.unscale_primal_residual_in_place_in(&mut v);
        p.scale_primal_residual_in_place_in(&mut v);
        check(&orig, &v);

        let orig: Vec<Scalar> = (0..4).map(|_| rng.gen_range(-3.0..3.0)).collect();
        let mut v = orig.clone();
        p.scale_dual_residual_in_place(&mut v);
        p.unscale_dual_residual_in_place(&mut v);
        check(&orig, &v);
    }

    #[test]
    fn test_equilibration_balances_norms() {
        let n = 3;
        let mut h = Mat::from_dmatrix(&DMatrix::from_row_slice(n, n, &[
            1000.0, 1.0, 0.0, //
            1.0, 0.001, 0.0, //
            0.0, 0.0, 1.0,
        ]));
        let mut g = vec![1.0, 1.0, 1.0];
        let mut a = Mat::from_dmatrix(&DMatrix::from_row_slice(1, n, &[500.0, 0.002, 1.0]));
        let mut b = vec![1.0];
        let mut c = Mat::zeros(0, n);
        let mut u = vec![];
        let mut l = vec![];

        let mut ruiz = RuizEquilibration::new(n, 1, 0);
        ruiz.equilibrate(QpViewMut {
            h: &mut h,
            g: &mut g,
            a: &mut a,
            b: &mut b,
            c: &mut c,
            u: &mut u,
            l: &mut l,
        });

        let row_norm = inf_norm(a.row(0));
        assert!(
            (0.1..=10.0).contains(&row_norm),
            "A row norm not balanced: {row_norm}"
        );
        for j in 0..n {
            let mut col: Scalar = 0.0;
            for i in 0..n {
                col = col.max(h[(i, j)].abs());
            }
            col = col.max(a[(0, j)].abs());
            assert!(
                (0.01..=10.0).contains(&col),
                "column {j} norm not balanced: {col}"
            );
        }
    }

    #[test]
    fn test_scaled_dual_residual_identity() {
        // c*Dx*(Hx + g + A^T y + C^T z) must equal H_s x_s + g_s + A_s^T y_s + C_s^T z_s
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let (n, n_eq, n_in) = (4, 2, 3);
        let mut qp = TestQp::random(n, n_eq, n_in, &mut rng);
        let orig = TestQp {
            h: qp.h.clone(),
            g: qp.g.clone(),
            a: qp.a.clone(),
            b: qp.b.clone(),
            c: qp.c.clone(),
            u: qp.u.clone(),
            l: qp.l.clone(),
        };

        let mut ruiz = RuizEquilibration::new(n, n_eq, n_in);
        ruiz.equilibrate(qp.view());
        let p = Preconditioner::Ruiz(ruiz);

        let x: Vec<Scalar> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let y: Vec<Scalar> = (0..n_eq).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let z: Vec<Scalar> = (0..n_in).map(|_| rng.gen_range(-1.0..1.0)).collect();

        // unscaled dual residual, then scaled through the preconditioner
        let mut expected = orig.g.clone();
        orig.h.mul_vec_acc(&x, 1.0, &mut expected);
        orig.a.tr_mul_vec_acc(&y, 1.0, &mut expected);
        orig.c.tr_mul_vec_acc(&z, 1.0, &mut expected);
        p.scale_dual_residual_in_place(&mut expected);

        // dual residual assembled from scaled pieces
        let mut xs = x.clone();
        p.scale_primal_in_place(&mut xs);
        let mut ys = y.clone();
        p.scale_dual_in_place_eq(&mut ys);
        let mut zs = z.clone();
        p.scale_dual_in_place_in(&mut zs);

        let mut actual = qp.g.clone();
        qp.h.mul_vec_acc(&xs, 1.0, &mut actual);
        qp.a.tr_mul_vec_acc(&ys, 1.0, &mut actual);
        qp.c.tr_mul_vec_acc(&zs, 1.0, &mut actual);

        for (e, a) in expected.iter().zip(actual.iter()) {
            assert!((e - a).abs() < 1e-10 * (1.0 + e.abs()), "{e} vs {a}");
        }
    }
}
