//! The proximal augmented-Lagrangian method.
//!
//! Layout mirrors the control flow: the [`workspace`] owns every buffer and
//! the factorization, [`residuals`] evaluates the termination quantities,
//! [`active_set`] keeps the bijection map and the factorization in sync,
//! [`refine`] solves the permuted KKT system with iterative refinement,
//! [`inner`] produces steps (initial guess and Newton correction) using the
//! exact line searches in [`line_search`], and [`solve`] runs the BCL outer
//! loop.

pub mod active_set;
pub mod inner;
pub mod line_search;
pub mod refine;
pub mod residuals;
pub mod solve;
pub mod workspace;

pub use solve::qp_solve;
pub use workspace::Workspace;
