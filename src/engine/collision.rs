//! The collision kernels and their per-kind dispatch.
//!
//! Every kernel reads one site's distribution from the readable buffer and
//! writes the post-collision values through the stream map into the
//! writable buffer, so streaming (including routing into a neighbor's halo
//! window) costs nothing extra. Kernels also return the site's density,
//! momentum and non-equilibrium remainder for telemetry.

use crate::geometry::CollisionKind;
use crate::lattice::{self, Distribution, Q};

/// Per-site collision result, consumed by telemetry and convergence
/// tracking.
pub struct CollisionOutput {
    pub density: f64,
    pub momentum: [f64; 3],
    pub f_neq: Distribution,
}

/// Step-constant inputs shared by all kernels.
pub struct CollisionContext<'a> {
    /// Relaxation parameter (negative: `-1/tau`).
    pub omega: f64,
    /// Current per-boundary inlet densities, indexed by boundary id.
    pub inlet_density: &'a [f64],
    /// Current per-boundary outlet densities, indexed by boundary id.
    pub outlet_density: &'a [f64],
}

/// Collide one site and stream the result.
pub fn collide(
    kind: CollisionKind,
    ctx: &CollisionContext<'_>,
    site: usize,
    boundary_id: usize,
    current: &[f64],
    next: &mut [f64],
    stream_map: &[usize],
) -> CollisionOutput {
    let mut f = [0.0; Q];
    f.copy_from_slice(&current[site * Q..site * Q + Q]);

    // For bulk fluid the non-equilibrium remainder is measured against
    // equilibrium; for the reset/reconstruct kinds, against the output.
    let (density, momentum, post, f_neq) = match kind {
        CollisionKind::BulkFluid => {
            let (density, momentum) = lattice::density_and_momentum(&f);
            let mut f_eq = [0.0; Q];
            lattice::equilibrium(density, momentum, &mut f_eq);
            let mut post = [0.0; Q];
            let mut f_neq = [0.0; Q];
            for l in 0..Q {
                f_neq[l] = f[l] - f_eq[l];
                post[l] = f[l] + ctx.omega * f_neq[l];
            }
            (density, momentum, post, f_neq)
        }
        CollisionKind::WallFluid => {
            let density: f64 = f.iter().sum();
            (density, [0.0; 3], lattice::resting(density), [0.0; Q])
        }
        CollisionKind::InletReconstruct | CollisionKind::OutletReconstruct => {
            let density = boundary_density(kind, ctx, boundary_id);
            let (_, momentum) = lattice::density_and_momentum(&f);
            let mut post = [0.0; Q];
            lattice::equilibrium(density, momentum, &mut post);
            (density, momentum, post, [0.0; Q])
        }
        CollisionKind::InletReset | CollisionKind::OutletReset => {
            let density = boundary_density(kind, ctx, boundary_id);
            (density, [0.0; 3], lattice::resting(density), [0.0; Q])
        }
    };

    let mut f_neq = f_neq;
    for l in 0..Q {
        if kind != CollisionKind::BulkFluid {
            f_neq[l] = f[l] - post[l];
        }
        next[stream_map[site * Q + l]] = post[l];
    }

    CollisionOutput {
        density,
        momentum,
        f_neq,
    }
}

fn boundary_density(kind: CollisionKind, ctx: &CollisionContext<'_>, boundary_id: usize) -> f64 {
    match kind {
        CollisionKind::InletReconstruct | CollisionKind::InletReset => {
            ctx.inlet_density[boundary_id]
        }
        CollisionKind::OutletReconstruct | CollisionKind::OutletReset => {
            ctx.outlet_density[boundary_id]
        }
        _ => unreachable!("boundary density queried for a fluid kind"),
    }
}
