//! In-place dense LDL^T engine.
//!
//! Maintains a factorization `M = L D L^T` (L unit lower triangular, D
//! diagonal and possibly indefinite) of a symmetric matrix that changes in
//! structured ways:
//!
//! - [`LdltFactor::rank_one_update`]: `M + sigma * u u^T` (Bennett's
//!   recurrence, valid for indefinite D)
//! - [`LdltFactor::insert_at`] / [`LdltFactor::remove_at`]: symmetric
//!   row/column insertion and deletion. Both reduce to a triangular solve
//!   against the leading block plus a rank-one correction of the trailing
//!   block.
//!
//! Storage is a flat row-major slab of `capacity^2` entries allocated once;
//! the live dimension moves inside it so that no edit operation allocates.
//! Scratch space is owned by the caller ([`LdltScratch`]) and passed into
//! every call.
//!
//! The engine does no pivoting: the caller guarantees quasi-definiteness
//! through regularization, and recovers from a singular pivot by increasing
//! the regularization and factorizing again.

use thiserror::Error;

use super::dense::Mat;
use crate::Scalar;

/// LDL^T engine errors.
#[derive(Error, Debug)]
pub enum LdltError {
    /// A pivot fell below the breakdown threshold; the matrix is numerically
    /// singular under the current regularization
    #[error("singular pivot {pivot:e} at index {index}")]
    SingularPivot {
        /// Pivot position
        index: usize,
        /// Offending pivot value
        pivot: Scalar,
    },

    /// Input dimension does not match the factored dimension
    #[error("dimension mismatch: factor has dimension {expected}, got {actual}")]
    DimensionMismatch {
        /// Factored dimension
        expected: usize,
        /// Supplied dimension
        actual: usize,
    },

    /// An insertion would exceed the preallocated capacity
    #[error("capacity exceeded: capacity {capacity}, requested {requested}")]
    CapacityExceeded {
        /// Preallocated maximum dimension
        capacity: usize,
        /// Requested dimension
        requested: usize,
    },
}

/// Caller-owned scratch slab for the engine.
///
/// Sized once for the maximum factor dimension; every factor/update/solve
/// call borrows it mutably instead of allocating.
#[derive(Debug)]
pub struct LdltScratch {
    w: Vec<Scalar>,
    v: Vec<Scalar>,
}

impl LdltScratch {
    /// Allocate scratch for factors up to `capacity` rows.
    pub fn new(capacity: usize) -> Self {
        Self {
            w: vec![0.0; capacity],
            v: vec![0.0; capacity],
        }
    }
}

/// Dense LDL^T factorization with in-place structural edits.
#[derive(Debug)]
pub struct LdltFactor {
    capacity: usize,
    dim: usize,
    /// Strictly lower triangle of L, row-major over the full slab
    l: Vec<Scalar>,
    /// Diagonal D
    d: Vec<Scalar>,
    /// Breakdown threshold, set from the diagonal scale at factorize time
    pivot_tol: Scalar,
}

impl LdltFactor {
    /// Allocate an engine for matrices up to `capacity` rows.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            dim: 0,
            l: vec![0.0; capacity * capacity],
            d: vec![0.0; capacity],
            pivot_tol: Scalar::EPSILON,
        }
    }

    /// Current factored dimension.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    fn l_at(&self, i: usize, j: usize) -> Scalar {
        self.l[i * self.capacity + j]
    }

    #[inline]
    fn l_at_mut(&mut self, i: usize, j: usize) -> &mut Scalar {
        &mut self.l[i * self.capacity + j]
    }

    /// Factorize the symmetric matrix `m` from scratch.
    ///
    /// Only the lower triangle of `m` is read. Fails with
    /// [`LdltError::SingularPivot`] when a pivot falls below the breakdown
    /// threshold; the caller recovers by increasing the regularization and
    /// retrying.
    pub fn factorize(&mut self, m: &Mat, _scratch: &mut LdltScratch) -> Result<(), LdltError> {
        let n = m.rows();
        if m.cols() != n {
            return Err(LdltError::DimensionMismatch {
                expected: n,
                actual: m.cols(),
            });
        }
        if n > self.capacity {
            return Err(LdltError::CapacityExceeded {
                capacity: self.capacity,
                requested: n,
            });
        }
        self.dim = n;

        let mut diag_scale: Scalar = 0.0;
        for j in 0..n {
            diag_scale = diag_scale.max(m[(j, j)].abs());
        }
        self.pivot_tol = Scalar::EPSILON * diag_scale.max(1e-30);

        for j in 0..n {
            let mut dj = m[(j, j)];
            for k in 0..j {
                let ljk = self.l_at(j, k);
                dj -= ljk * ljk * self.d[k];
            }
            if !(dj.abs() > self.pivot_tol) {
                return Err(LdltError::SingularPivot { index: j, pivot: dj });
            }
            self.d[j] = dj;
            for i in j + 1..n {
                let mut v = m[(i, j)];
                for k in 0..j {
                    v -= self.l_at(i, k) * self.l_at(j, k) * self.d[k];
                }
                *self.l_at_mut(i, j) = v / dj;
            }
        }
        Ok(())
    }

    /// Overwrite `v` with `M^{-1} v` via forward, diagonal, and backward
    /// substitution.
    pub fn solve_in_place(&self, v: &mut [Scalar]) {
        assert_eq!(v.len(), self.dim);
        let n = self.dim;
        // L w = v
        for i in 0..n {
            let mut vi = v[i];
            for k in 0..i {
                vi -= self.l_at(i, k) * v[k];
            }
            v[i] = vi;
        }
        // D s = w
        for i in 0..n {
            v[i] /= self.d[i];
        }
        // L^T x = s
        for i in (0..n).rev() {
            let mut vi = v[i];
            for k in i + 1..n {
                vi -= self.l_at(k, i) * v[k];
            }
            v[i] = vi;
        }
    }

    /// Update the factorization to represent `M + sigma * u u^T`.
    pub fn rank_one_update(
        &mut self,
        u: &[Scalar],
        sigma: Scalar,
        scratch: &mut LdltScratch,
    ) -> Result<(), LdltError> {
        if u.len() != self.dim {
            return Err(LdltError::DimensionMismatch {
                expected: self.dim,
                actual: u.len(),
            });
        }
        scratch.w[..self.dim].copy_from_slice(u);
        self.rank_one_update_from(0, sigma, &mut scratch.w)
    }

    /// Bennett's rank-one update on the trailing block `start..dim`.
    ///
    /// `w[start..dim]` holds the update vector on entry and is consumed.
    fn rank_one_update_from(
        &mut self,
        start: usize,
        sigma: Scalar,
        w: &mut [Scalar],
    ) -> Result<(), LdltError> {
        if sigma == 0.0 {
            return Ok(());
        }
        let n = self.dim;
        let mut a = sigma;
        for j in start..n {
            let p = w[j];
            let d_old = self.d[j];
            let d_new = d_old + a * p * p;
            if !(d_new.abs() > self.pivot_tol) {
                return Err(LdltError::SingularPivot {
                    index: j,
                    pivot: d_new,
                });
            }
            let gamma = p * a / d_new;
            self.d[j] = d_new;
            a *= d_old / d_new;
            for i in j + 1..n {
                w[i] -= p * self.l_at(i, j);
                let lij = self.l_at(i, j) + gamma * w[i];
                *self.l_at_mut(i, j) = lij;
            }
        }
        Ok(())
    }

    /// Insert a symmetric row/column at position `k`.
    ///
    /// `col` has length `dim + 1` and holds the new matrix column in the
    /// post-insertion indexing: `col[k]` is the diagonal entry, `col[i]` for
    /// `i != k` the off-diagonal entry shared by the new row and column.
    pub fn insert_at(
        &mut self,
        k: usize,
        col: &[Scalar],
        scratch: &mut LdltScratch,
    ) -> Result<(), LdltError> {
        let n = self.dim;
        assert!(k <= n);
        if col.len() != n + 1 {
            return Err(LdltError::DimensionMismatch {
                expected: n + 1,
                actual: col.len(),
            });
        }
        if n + 1 > self.capacity {
            return Err(LdltError::CapacityExceeded {
                capacity: self.capacity,
                requested: n + 1,
            });
        }

        // t = L11^{-1} c1, then l12 = D1^{-1} t
        let (t, l32) = {
            let (t, w) = (&mut scratch.v, &mut scratch.w);
            for i in 0..k {
                let mut ti = col[i];
                for j in 0..i {
                    ti -= self.l_at(i, j) * t[j];
                }
                t[i] = ti;
            }
            let mut d_new = col[k];
            for j in 0..k {
                let l12j = t[j] / self.d[j];
                d_new -= t[j] * l12j;
            }
            if !(d_new.abs() > self.pivot_tol) {
                return Err(LdltError::SingularPivot {
                    index: k,
                    pivot: d_new,
                });
            }
            // l32 in pre-shift row indices k..n
            for i in k..n {
                let mut v = col[i + 1];
                for j in 0..k {
                    v -= self.l_at(i, j) * t[j];
                }
                w[i - k] = v / d_new;
            }
            for j in 0..k {
                t[j] /= self.d[j];
            }
            t[k] = d_new;
            (t, w)
        };

        // open the slot: shift trailing rows/columns down-right
        for i in (k..n).rev() {
            for j in (k..i).rev() {
                self.l[(i + 1) * self.capacity + (j + 1)] = self.l[i * self.capacity + j];
            }
            for j in 0..k {
                self.l[(i + 1) * self.capacity + j] = self.l[i * self.capacity + j];
            }
            self.d[i + 1] = self.d[i];
        }

        // write the new row k (l12), column k (l32), and pivot
        let d_new = t[k];
        for j in 0..k {
            self.l[k * self.capacity + j] = t[j];
        }
        for i in k..n {
            self.l[(i + 1) * self.capacity + k] = l32[i - k];
        }
        self.d[k] = d_new;
        self.dim = n + 1;

        // the trailing block absorbed d_new * l32 l32^T; take it back out
        if k < n {
            let m = n - k;
            // shift the update vector to trailing-block coordinates
            for i in (0..m).rev() {
                scratch.w[k + 1 + i] = scratch.w[i];
            }
            self.rank_one_update_from(k + 1, -d_new, &mut scratch.w)?;
        }
        Ok(())
    }

    /// Delete the symmetric row/column at position `k`.
    pub fn remove_at(&mut self, k: usize, scratch: &mut LdltScratch) -> Result<(), LdltError> {
        let n = self.dim;
        assert!(k < n);

        let dk = self.d[k];
        for i in k + 1..n {
            scratch.w[i - 1] = self.l_at(i, k);
        }

        // close the slot: shift trailing rows/columns up-left
        for i in k + 1..n {
            for j in 0..k {
                self.l[(i - 1) * self.capacity + j] = self.l[i * self.capacity + j];
            }
            for j in k + 1..i {
                self.l[(i - 1) * self.capacity + (j - 1)] = self.l[i * self.capacity + j];
            }
            self.d[i - 1] = self.d[i];
        }
        self.dim = n - 1;

        // the deleted column carried dk * l32 l32^T into the trailing block
        if k < self.dim {
            self.rank_one_update_from(k, dk, &mut scratch.w)?;
        }
        Ok(())
    }

    /// Rebuild the dense matrix `L D L^T` currently represented by the
    /// factors. Debug aid: within `eps_refact` of the last factored matrix
    /// (plus the accumulated structural edits).
    pub fn reconstructed_matrix(&self) -> Mat {
        let n = self.dim;
        let mut out = Mat::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..=i.min(j) {
                    let lik = if i == k { 1.0 } else { self.l_at(i, k) };
                    let ljk = if j == k { 1.0 } else { self.l_at(j, k) };
                    sum += lik * self.d[k] * ljk;
                }
                out[(i, j)] = sum;
            }
        }
        out
    }
}
