//! Active-set bookkeeping.
//!
//! `current_bijection_map` is a permutation of `0..n_in`: entries below `n_c`
//! name the factorization slot of an active inequality row, entries at or
//! above `n_c` mark inactive rows. When the active set changes, the map emits
//! a minimal edit sequence to the LDL^T engine:
//!
//! - rows that left the set are deleted in **descending slot order**, so the
//!   remaining slots never shift under a pending deletion
//! - rows that entered the set are appended in **ascending row order**, each
//!   as a column [C_scaled row | zeros | -1/mu_in] at the end of the active
//!   block
//!
//! A failed edit (numerically singular trailing block) degrades to a full
//! refactorization with the new active set, which leaves the factorization
//! in the same state the edits would have produced.

use crate::alm::refine::refactorize;
use crate::alm::workspace::Workspace;
use crate::problem::Results;

/// Reconcile the factorization and the bijection map with
/// `work.active_inequalities`.
pub fn active_set_change(results: &Results, work: &mut Workspace) {
    let n = work.n;
    let n_eq = work.n_eq;
    let n_in = work.n_in;
    let mut edits_failed = false;

    // deletions, descending slot order
    let n_c_at_entry = work.n_c;
    for slot in (0..n_c_at_entry).rev() {
        let row = work
            .current_bijection_map
            .iter()
            .position(|&s| s == slot)
            .expect("bijection map must be a permutation");
        if work.active_inequalities[row] {
            continue;
        }
        if !edits_failed {
            if let Err(_e) = work
                .ldl
                .remove_at(n + n_eq + slot, &mut work.ldl_scratch)
            {
                edits_failed = true;
            }
        }
        for s in work.current_bijection_map.iter_mut() {
            if *s > slot {
                *s -= 1;
            }
        }
        work.current_bijection_map[row] = n_in - 1;
        work.n_c -= 1;
    }

    // insertions, ascending row order
    for row in 0..n_in {
        if !work.active_inequalities[row] || work.current_bijection_map[row] < work.n_c {
            continue;
        }
        if !edits_failed {
            let dim = n + n_eq + work.n_c;
            work.dw_aug[..n].copy_from_slice(work.c_scaled.row(row));
            work.dw_aug[n..dim].fill(0.0);
            work.dw_aug[dim] = -results.info.mu_in_inv;
            if let Err(_e) = work
                .ldl
                .insert_at(dim, &work.dw_aug[..dim + 1], &mut work.ldl_scratch)
            {
                edits_failed = true;
            }
            work.dw_aug[dim] = 0.0;
        }
        let old = work.current_bijection_map[row];
        for s in work.current_bijection_map.iter_mut() {
            if *s >= work.n_c && *s < old {
                *s += 1;
            }
        }
        work.current_bijection_map[row] = work.n_c;
        work.n_c += 1;
    }
    work.dw_aug.fill(0.0);

    if edits_failed {
        // the map already reflects the new active set; rebuilding from
        // scratch reproduces the state the incremental edits targeted
        refactorize(results, work, results.info.rho)
            .expect("refactorization after a failed active-set edit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alm::refine::refactorize;
    use crate::linalg::dense::Mat;
    use crate::problem::SolverSettings;
    use nalgebra::DMatrix;

    fn setup(n_in: usize) -> (Results, Workspace) {
        let n = 2;
        let n_eq = 1;
        let mut work = Workspace::new(n, n_eq, n_in);
        work.h_scaled = Mat::from_dmatrix(&DMatrix::from_row_slice(2, 2, &[
            2.0, 0.0, //
            0.0, 2.0,
        ]));
        work.a_scaled = Mat::from_dmatrix(&DMatrix::from_row_slice(1, 2, &[1.0, 1.0]));
        let mut c = Mat::zeros(n_in, n);
        for i in 0..n_in {
            c[(i, i % n)] = 1.0;
            c[(i, (i + 1) % n)] = 0.5;
        }
        work.c_scaled = c;
        let results = Results::new(n, n_eq, n_in, &SolverSettings::default());

        for i in 0..n {
            for j in 0..n {
                work.kkt[(i, j)] = work.h_scaled[(i, j)];
            }
            work.kkt[(i, i)] += results.info.rho;
            work.kkt[(i, n)] = work.a_scaled[(0, i)];
            work.kkt[(n, i)] = work.a_scaled[(0, i)];
        }
        work.kkt[(n, n)] = -results.info.mu_eq_inv;
        refactorize(&results, &mut work, results.info.rho).unwrap();
        (results, work)
    }

    fn assert_permutation(map: &[usize]) {
        let mut seen = vec![false; map.len()];
        for &s in map {
            assert!(s < map.len());
            assert!(!seen[s], "duplicate slot {s}");
            seen[s] = true;
        }
    }

    #[test]
    fn test_activation_assigns_ascending_slots() {
        let (results, mut work) = setup(4);
        work.active_inequalities.copy_from_slice(&[true, false, true, false]);
        active_set_change(&results, &mut work);

        assert_eq!(work.n_c, 2);
        assert_eq!(work.current_bijection_map[0], 0);
        assert_eq!(work.current_bijection_map[2], 1);
        assert!(work.current_bijection_map[1] >= work.n_c);
        assert!(work.current_bijection_map[3] >= work.n_c);
        assert_permutation(&work.current_bijection_map);
        assert_eq!(work.ldl.dim(), 2 + 1 + 2);
    }

    #[test]
    fn test_deactivation_then_reactivation() {
        let (results, mut work) = setup(4);
        work.active_inequalities.copy_from_slice(&[true, true, true, false]);
        active_set_change(&results, &mut work);
        assert_eq!(work.n_c, 3);

        // drop the middle one, pick up row 3
        work.active_inequalities.copy_from_slice(&[true, false, true, true]);
        active_set_change(&results, &mut work);

        assert_eq!(work.n_c, 3);
        assert_permutation(&work.current_bijection_map);
        assert!(work.current_bijection_map[1] >= work.n_c);
        for row in [0, 2, 3] {
            assert!(work.current_bijection_map[row] < work.n_c);
        }
        // surviving actives keep their relative order, the newcomer is last
        assert!(work.current_bijection_map[0] < work.current_bijection_map[2]);
        assert_eq!(work.current_bijection_map[3], 2);
        assert_eq!(work.ldl.dim(), 2 + 1 + 3);
    }

    #[test]
    fn test_edits_match_refactorization() {
        let (results, mut work) = setup(3);
        work.active_inequalities.copy_from_slice(&[true, true, false]);
        active_set_change(&results, &mut work);
        work.active_inequalities.copy_from_slice(&[false, true, true]);
        active_set_change(&results, &mut work);

        let incremental = work.ldl.reconstructed_matrix();
        refactorize(&results, &mut work, results.info.rho).unwrap();
        let fresh = work.ldl.reconstructed_matrix();

        let dim = work.ldl.dim();
        let mut diff: f64 = 0.0;
        for i in 0..dim {
            for j in 0..dim {
                diff = diff.max((incremental[(i, j)] - fresh[(i, j)]).abs());
            }
        }
        assert!(diff < 1e-9, "incremental edits drifted: {diff}");
    }
}
