//! Problem scaling.
//!
//! A closed set of two preconditioners: [`Preconditioner::Identity`] (every
//! operation is a no-op) and [`Preconditioner::Ruiz`] (iterative sup-norm
//! equilibration with cost normalization). The solver core only ever talks to
//! the capability set below; there is no plug-in mechanism.
//!
//! Scaling conventions, with `Dx`, `De`, `Di` the stored diagonals and `c`
//! the cost scalar:
//!
//! ```text
//! H_s = c Dx H Dx    g_s = c Dx g
//! A_s = De A Dx      b_s = De b
//! C_s = Di C Dx      u_s = Di u    l_s = Di l
//! x_s = Dx^-1 x      y_s = c De^-1 y      z_s = c Di^-1 z
//! ```
//!
//! so primal residuals scale by `De`/`Di` and the dual residual by `c Dx`.
//! Scale and unscale are exact inverses of each other on every vector.

pub mod ruiz;

pub use ruiz::RuizEquilibration;

use crate::linalg::dense::Mat;
use crate::Scalar;

/// Mutable view of the scaled problem buffers handed to the preconditioner.
pub struct QpViewMut<'a> {
    /// Quadratic cost
    pub h: &'a mut Mat,
    /// Linear cost
    pub g: &'a mut [Scalar],
    /// Equality matrix
    pub a: &'a mut Mat,
    /// Equality right-hand side
    pub b: &'a mut [Scalar],
    /// Inequality matrix
    pub c: &'a mut Mat,
    /// Upper bounds
    pub u: &'a mut [Scalar],
    /// Lower bounds
    pub l: &'a mut [Scalar],
}

/// The scaling object consumed by the solver core.
#[derive(Debug, Clone)]
pub enum Preconditioner {
    /// No scaling; every operation is a no-op
    Identity,
    /// Ruiz sup-norm equilibration
    Ruiz(RuizEquilibration),
}

impl Preconditioner {
    /// Scale the problem buffers in place.
    ///
    /// With `execute`, a Ruiz preconditioner recomputes its scaling from the
    /// data; otherwise it applies the scaling stored by a previous run.
    pub fn scale_qp_in_place(&mut self, qp: QpViewMut<'_>, execute: bool) {
        match self {
            Preconditioner::Identity => {}
            Preconditioner::Ruiz(ruiz) => {
                if execute {
                    ruiz.equilibrate(qp);
                } else {
                    ruiz.apply_stored(qp);
                }
            }
        }
    }

    /// x -> Dx^-1 x
    pub fn scale_primal_in_place(&self, x: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (xi, di) in x.iter_mut().zip(r.delta_x()) {
                *xi /= di;
            }
        }
    }

    /// x_s -> Dx x_s
    pub fn unscale_primal_in_place(&self, x: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (xi, di) in x.iter_mut().zip(r.delta_x()) {
                *xi *= di;
            }
        }
    }

    /// y -> c De^-1 y
    pub fn scale_dual_in_place_eq(&self, y: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (yi, di) in y.iter_mut().zip(r.delta_eq()) {
                *yi *= r.c / di;
            }
        }
    }

    /// y_s -> De y_s / c
    pub fn unscale_dual_in_place_eq(&self, y: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (yi, di) in y.iter_mut().zip(r.delta_eq()) {
                *yi *= di / r.c;
            }
        }
    }

    /// z -> c Di^-1 z
    pub fn scale_dual_in_place_in(&self, z: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (zi, di) in z.iter_mut().zip(r.delta_in()) {
                *zi *= r.c / di;
            }
        }
    }

    /// z_s -> Di z_s / c
    pub fn unscale_dual_in_place_in(&self, z: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (zi, di) in z.iter_mut().zip(r.delta_in()) {
                *zi *= di / r.c;
            }
        }
    }

    /// r -> De r
    pub fn scale_primal_residual_in_place_eq(&self, r_eq: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (ri, di) in r_eq.iter_mut().zip(r.delta_eq()) {
                *ri *= di;
            }
        }
    }

    /// r_s -> De^-1 r_s
    pub fn unscale_primal_residual_in_place_eq(&self, r_eq: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (ri, di) in r_eq.iter_mut().zip(r.delta_eq()) {
                *ri /= di;
            }
        }
    }

    /// r -> Di r
    pub fn scale_primal_residual_in_place_in(&self, r_in: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (ri, di) in r_in.iter_mut().zip(r.delta_in()) {
                *ri *= di;
            }
        }
    }

    /// r_s -> Di^-1 r_s
    pub fn unscale_primal_residual_in_place_in(&self, r_in: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (ri, di) in r_in.iter_mut().zip(r.delta_in()) {
                *ri /= di;
            }
        }
    }

    /// r -> c Dx r
    pub fn scale_dual_residual_in_place(&self, r_d: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (ri, di) in r_d.iter_mut().zip(r.delta_x()) {
                *ri *= r.c * di;
            }
        }
    }

    /// r_s -> Dx^-1 r_s / c
    pub fn unscale_dual_residual_in_place(&self, r_d: &mut [Scalar]) {
        if let Preconditioner::Ruiz(r) = self {
            for (ri, di) in r_d.iter_mut().zip(r.delta_x()) {
                *ri /= r.c * di;
            }
        }
    }
}
