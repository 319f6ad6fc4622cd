//! The per-step overlapped collision-and-streaming cycle.
//!
//! [`CycleEngine`] owns the two distribution buffers and advances the
//! simulation one step per [`advance`](CycleEngine::advance) call:
//!
//! 1. post one non-blocking receive per neighbor,
//! 2. collide the inter (boundary) sites — their post-collision values
//!    stream straight into the halo send windows,
//! 3. post one non-blocking send per neighbor,
//! 4. collide the inner sites while the transfers are in flight,
//! 5. wait for every posted transfer,
//! 6. scatter the received values into the writable buffer,
//! 7. swap the buffer roles (a handle swap, no copy),
//! 8. agree globally on stability (and, when asked, convergence).
//!
//! Boundary collisions must finish before the sends are posted — a strict
//! data dependency. Inner collisions have no ordering constraint against
//! the in-flight transfers: the backends copy outgoing bytes when the send
//! is posted, so there is no shared mutable state to guard.
//!
//! The caller must pass the same `check_convergence` value on every rank
//! for a given step; the global reductions are collectives.

pub mod collision;
pub mod forcing;

use crate::comm::{CommTag, Communicator, ReduceOp, Wait};
use crate::flow_error::FlowError;
use crate::lattice::{self, Q};
use crate::topology::Topology;
use self::collision::{CollisionContext, CollisionOutput, collide};
use serde::{Deserialize, Serialize};

const HALO_TAG: CommTag = CommTag::new(0x0300);
const STABILITY_TAG: CommTag = CommTag::new(0x0310);
const CONVERGENCE_TAG: CommTag = CommTag::new(0x0318);
const EXTREMA_MIN_TAG: CommTag = CommTag::new(0x0320);
const EXTREMA_MAX_TAG: CommTag = CommTag::new(0x0330);

/// Global per-step verdict, consumed by the simulation driver.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StabilityCode {
    Stable,
    Unstable,
    StableAndConverged,
}

/// Running min/max of the derived flow fields, reset at period boundaries.
#[derive(Copy, Clone, Debug, Serialize)]
pub struct FieldExtrema {
    pub density_min: f64,
    pub density_max: f64,
    pub velocity_min: f64,
    pub velocity_max: f64,
    pub stress_min: f64,
    pub stress_max: f64,
}

impl Default for FieldExtrema {
    fn default() -> Self {
        Self {
            density_min: f64::INFINITY,
            density_max: f64::NEG_INFINITY,
            velocity_min: f64::INFINITY,
            velocity_max: f64::NEG_INFINITY,
            stress_min: f64::INFINITY,
            stress_max: f64::NEG_INFINITY,
        }
    }
}

impl FieldExtrema {
    fn fold(&mut self, density: f64, velocity: f64, stress: f64) {
        self.density_min = self.density_min.min(density);
        self.density_max = self.density_max.max(density);
        self.velocity_min = self.velocity_min.min(velocity);
        self.velocity_max = self.velocity_max.max(velocity);
        self.stress_min = self.stress_min.min(stress);
        self.stress_max = self.stress_max.max(stress);
    }
}

/// Engine construction knobs.
#[derive(Copy, Clone, Debug)]
pub struct EngineConfig {
    /// Scale applied to the von Mises stress in telemetry.
    pub stress_par: f64,
    /// Convergence tolerance on the global velocity-change ratio; `None`
    /// disables convergence tracking entirely.
    pub convergence_tolerance: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stress_par: 1.0,
            convergence_tolerance: None,
        }
    }
}

/// Per-step scalar inputs.
pub struct StepParams<'a> {
    /// Relaxation parameter handed to the collision kernels.
    pub omega: f64,
    /// Current inlet densities, indexed by boundary id.
    pub inlet_density: &'a [f64],
    /// Current outlet densities, indexed by boundary id.
    pub outlet_density: &'a [f64],
    /// Run the convergence check this step (same value on every rank).
    pub check_convergence: bool,
    /// When present, receives `[density, |velocity|, stress]` per site.
    pub aux_output: Option<&'a mut [f64]>,
}

struct ConvergenceMonitor {
    tolerance: f64,
    prev_velocity: Vec<[f64; 3]>,
}

struct ConvAccum<'a> {
    prev: &'a mut [[f64; 3]],
    diff_sq: f64,
    norm_sq: f64,
    tolerance: f64,
}

/// The distributed collision-and-streaming engine. Exclusive owner of the
/// two distribution buffers; nothing else reads or writes them outside the
/// documented step boundaries.
pub struct CycleEngine {
    topology: Topology,
    boundary_ids: Vec<usize>,
    current: Vec<f64>,
    next: Vec<f64>,
    stress_par: f64,
    extrema: FieldExtrema,
    convergence: Option<ConvergenceMonitor>,
    step_index: u64,
}

impl CycleEngine {
    /// Build an engine over a validated topology. `boundary_ids` holds one
    /// entry per site (ignored for fluid sites). Both buffers start at the
    /// unit-density resting equilibrium.
    pub fn new(
        topology: Topology,
        boundary_ids: Vec<usize>,
        config: EngineConfig,
    ) -> Result<Self, FlowError> {
        let site_count = topology.site_count();
        if boundary_ids.len() != site_count {
            return Err(FlowError::BufferLengthMismatch {
                context: "boundary id table",
                expected: site_count,
                found: boundary_ids.len(),
            });
        }
        let convergence = config.convergence_tolerance.map(|tolerance| ConvergenceMonitor {
            tolerance,
            prev_velocity: vec![[0.0; 3]; site_count],
        });
        let mut engine = Self {
            current: vec![0.0; topology.buffer_len()],
            next: vec![0.0; topology.buffer_len()],
            topology,
            boundary_ids,
            stress_par: config.stress_par,
            extrema: FieldExtrema::default(),
            convergence,
            step_index: 0,
        };
        engine.set_initial_conditions(1.0);
        Ok(engine)
    }

    /// Seed both buffers with the resting equilibrium at `density`.
    pub fn set_initial_conditions(&mut self, density: f64) {
        let rest = lattice::resting(density);
        for site in 0..self.topology.site_count() {
            self.current[site * Q..site * Q + Q].copy_from_slice(&rest);
            self.next[site * Q..site * Q + Q].copy_from_slice(&rest);
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// The readable distribution values (local sites only, halo excluded).
    pub fn distributions(&self) -> &[f64] {
        &self.current[..self.topology.site_count() * Q]
    }

    /// Mutable access to the readable distribution values, for checkpoint
    /// restore and tests. Only valid between steps.
    pub fn distributions_mut(&mut self) -> &mut [f64] {
        let local_len = self.topology.site_count() * Q;
        &mut self.current[..local_len]
    }

    /// Extrema accumulated since the last reset.
    pub fn extrema(&self) -> FieldExtrema {
        self.extrema
    }

    /// Reset the extrema accumulators (call at period boundaries).
    pub fn reset_extrema(&mut self) {
        self.extrema = FieldExtrema::default();
    }

    /// Combine the local extrema across all ranks. Collective.
    pub fn reduce_extrema<C: Communicator>(&self, comm: &C) -> Result<FieldExtrema, FlowError> {
        let mins = comm.all_reduce_scalars(
            &[
                self.extrema.density_min,
                self.extrema.velocity_min,
                self.extrema.stress_min,
            ],
            ReduceOp::Min,
            EXTREMA_MIN_TAG,
        )?;
        let maxes = comm.all_reduce_scalars(
            &[
                self.extrema.density_max,
                self.extrema.velocity_max,
                self.extrema.stress_max,
            ],
            ReduceOp::Max,
            EXTREMA_MAX_TAG,
        )?;
        Ok(FieldExtrema {
            density_min: mins[0],
            velocity_min: mins[1],
            stress_min: mins[2],
            density_max: maxes[0],
            velocity_max: maxes[1],
            stress_max: maxes[2],
        })
    }

    /// Advance the simulation by one step.
    pub fn advance<C: Communicator>(
        &mut self,
        comm: &C,
        params: StepParams<'_>,
    ) -> Result<StabilityCode, FlowError> {
        let StepParams {
            omega,
            inlet_density,
            outlet_density,
            check_convergence,
            mut aux_output,
        } = params;

        let site_count = self.topology.site_count();
        let local_len = site_count * Q;
        if let Some(aux) = aux_output.as_deref() {
            if aux.len() != 3 * site_count {
                return Err(FlowError::BufferLengthMismatch {
                    context: "auxiliary output",
                    expected: 3 * site_count,
                    found: aux.len(),
                });
            }
        }

        // Alternating tags keep a mailbox-backed comm from overwriting a
        // message the peer has not consumed yet; ranks are in lockstep
        // within one step, so two parities suffice.
        let halo_tag = HALO_TAG.as_u16() | (self.step_index & 1) as u16;

        let topo = &self.topology;
        let current = &mut self.current;
        let next = &mut self.next;
        let boundary_ids = &self.boundary_ids;
        let extrema = &mut self.extrema;
        let stress_par = self.stress_par;

        // 1. Post receives into the halo windows of the readable buffer.
        let mut recvs = Vec::with_capacity(topo.neighbors().len());
        for spec in topo.neighbors() {
            let mut buf = vec![0u8; spec.count() * std::mem::size_of::<f64>()];
            recvs.push(comm.irecv(spec.rank, halo_tag, &mut buf));
        }

        let ctx = CollisionContext {
            omega,
            inlet_density,
            outlet_density,
        };
        let mut conv = match (&mut self.convergence, check_convergence) {
            (Some(monitor), true) => Some(ConvAccum {
                prev: &mut monitor.prev_velocity,
                diff_sq: 0.0,
                norm_sq: 0.0,
                tolerance: monitor.tolerance,
            }),
            _ => None,
        };

        let mut record =
            |site: usize, out: &CollisionOutput, conv: &mut Option<ConvAccum<'_>>| {
                let momentum_mag = (out.momentum[0] * out.momentum[0]
                    + out.momentum[1] * out.momentum[1]
                    + out.momentum[2] * out.momentum[2])
                    .sqrt();
                let velocity = momentum_mag / out.density;
                let stress = lattice::shear_stress(&out.f_neq, stress_par);
                extrema.fold(out.density, velocity, stress);
                if let Some(aux) = aux_output.as_deref_mut() {
                    aux[3 * site] = out.density;
                    aux[3 * site + 1] = velocity;
                    aux[3 * site + 2] = stress;
                }
                if let Some(c) = conv.as_mut() {
                    let v = [
                        out.momentum[0] / out.density,
                        out.momentum[1] / out.density,
                        out.momentum[2] / out.density,
                    ];
                    let prev = c.prev[site];
                    c.diff_sq += (v[0] - prev[0]) * (v[0] - prev[0])
                        + (v[1] - prev[1]) * (v[1] - prev[1])
                        + (v[2] - prev[2]) * (v[2] - prev[2]);
                    c.norm_sq += v[0] * v[0] + v[1] * v[1] + v[2] * v[2];
                    c.prev[site] = v;
                }
            };

        // 2. Inter (boundary) sites: results land in the halo send windows
        // of the writable buffer, so they must finish before the sends.
        for (kind, range) in topo.ordering().inter_ranges() {
            for site in range {
                let out = collide(
                    kind,
                    &ctx,
                    site,
                    boundary_ids[site],
                    current,
                    next,
                    topo.stream_map(),
                );
                record(site, &out, &mut conv);
            }
        }

        // 3. Post sends of the windows just written.
        let mut sends = Vec::with_capacity(topo.neighbors().len());
        for spec in topo.neighbors() {
            let base = topo.halo_base(spec);
            let window: &[f64] = &next[base..base + spec.count()];
            sends.push(comm.isend(spec.rank, halo_tag, bytemuck::cast_slice(window)));
        }

        // 4. Inner sites, overlapped with the transfers in flight.
        for (kind, range) in topo.ordering().inner_ranges() {
            for site in range {
                let out = collide(
                    kind,
                    &ctx,
                    site,
                    boundary_ids[site],
                    current,
                    next,
                    topo.stream_map(),
                );
                record(site, &out, &mut conv);
            }
        }
        drop(record);

        // 5. Wait for every posted transfer of this step.
        for s in sends {
            let _ = s.wait();
        }
        for (spec, h) in topo.neighbors().iter().zip(recvs) {
            let data = h.wait().ok_or_else(|| FlowError::CommError {
                neighbor: spec.rank,
                source: format!("halo receive from rank {} failed", spec.rank).into(),
            })?;
            let base = topo.halo_base(spec);
            let window = &mut current[base..base + spec.count()];
            bytemuck::cast_slice_mut(window).copy_from_slice(&data);
        }

        // 6. Scatter the received values into the writable buffer.
        for spec in topo.neighbors() {
            let base = topo.halo_base(spec);
            for (k, &dst) in spec.recv_targets.iter().enumerate() {
                next[dst] = current[base + k];
            }
        }

        let conv_result = conv.map(|c| (c.diff_sq, c.norm_sq, c.tolerance));

        // 7. Swap the buffer roles; a handle exchange, no copy.
        std::mem::swap(&mut self.current, &mut self.next);
        self.step_index += 1;

        // 8. Stability, agreed globally even when only one rank misbehaves.
        let unstable_here = self.current[..local_len].iter().any(|&v| v < 0.0);
        let unstable = comm.all_reduce_or(unstable_here, STABILITY_TAG)?;
        if unstable {
            log::warn!(
                "rank {}: step {} unstable (negative distribution detected globally)",
                comm.rank(),
                self.step_index
            );
            return Ok(StabilityCode::Unstable);
        }

        if let Some((diff_sq, norm_sq, tolerance)) = conv_result {
            let sums =
                comm.all_reduce_scalars(&[diff_sq, norm_sq], ReduceOp::Sum, CONVERGENCE_TAG)?;
            let ratio = if sums[1] > 0.0 {
                (sums[0] / sums[1]).sqrt()
            } else {
                0.0
            };
            log::trace!("step {}: velocity-change ratio {ratio:.3e}", self.step_index);
            if ratio < tolerance {
                return Ok(StabilityCode::StableAndConverged);
            }
        }

        Ok(StabilityCode::Stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NoComm;
    use crate::topology::SiteOrdering;

    fn bulk_serial_engine(sites: usize) -> CycleEngine {
        let mut ordering = SiteOrdering::default();
        ordering.inner_counts[0] = sites;
        let stream_map = (0..sites * Q).collect();
        let topo = Topology::serial(ordering, stream_map).unwrap();
        CycleEngine::new(topo, vec![0; sites], EngineConfig::default()).unwrap()
    }

    fn params(omega: f64) -> StepParams<'static> {
        StepParams {
            omega,
            inlet_density: &[],
            outlet_density: &[],
            check_convergence: false,
            aux_output: None,
        }
    }

    #[test]
    fn initial_conditions_are_resting_equilibrium() {
        let engine = bulk_serial_engine(3);
        let rest = lattice::resting(1.0);
        for site in 0..3 {
            assert_eq!(&engine.distributions()[site * Q..site * Q + Q], &rest);
        }
    }

    #[test]
    fn serial_step_is_stable_at_equilibrium() {
        let mut engine = bulk_serial_engine(2);
        let code = engine.advance(&NoComm, params(-0.8)).unwrap();
        assert_eq!(code, StabilityCode::Stable);
        assert_eq!(engine.step_index(), 1);
    }

    #[test]
    fn negative_value_flags_instability() {
        let mut engine = bulk_serial_engine(2);
        engine.distributions_mut()[5] = -0.4;
        // The tainted value must survive collision into the scanned buffer;
        // with omega = 0 the kernels copy input to output.
        let code = engine.advance(&NoComm, params(0.0)).unwrap();
        assert_eq!(code, StabilityCode::Unstable);
    }

    #[test]
    fn aux_output_length_is_checked() {
        let mut engine = bulk_serial_engine(2);
        let mut aux = vec![0.0; 5];
        let err = engine
            .advance(
                &NoComm,
                StepParams {
                    omega: -0.8,
                    inlet_density: &[],
                    outlet_density: &[],
                    check_convergence: false,
                    aux_output: Some(&mut aux),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::BufferLengthMismatch {
                context: "auxiliary output",
                ..
            }
        ));
    }

    #[test]
    fn aux_output_reports_density_velocity_stress() {
        let mut engine = bulk_serial_engine(1);
        let mut aux = vec![0.0; 3];
        engine
            .advance(
                &NoComm,
                StepParams {
                    omega: -0.8,
                    inlet_density: &[],
                    outlet_density: &[],
                    check_convergence: false,
                    aux_output: Some(&mut aux),
                },
            )
            .unwrap();
        assert!((aux[0] - 1.0).abs() < 1e-9); // density
        assert!(aux[1].abs() < 1e-9); // at rest
        assert!(aux[2].abs() < 1e-9); // no shear
    }

    #[test]
    fn convergence_reported_once_flow_stops_changing() {
        let mut ordering = SiteOrdering::default();
        ordering.inner_counts[0] = 2;
        let stream_map = (0..2 * Q).collect();
        let topo = Topology::serial(ordering, stream_map).unwrap();
        let mut engine = CycleEngine::new(
            topo,
            vec![0; 2],
            EngineConfig {
                stress_par: 1.0,
                convergence_tolerance: Some(1e-9),
            },
        )
        .unwrap();
        let step = |engine: &mut CycleEngine| {
            engine
                .advance(
                    &NoComm,
                    StepParams {
                        omega: -0.8,
                        inlet_density: &[],
                        outlet_density: &[],
                        check_convergence: true,
                        aux_output: None,
                    },
                )
                .unwrap()
        };
        // At resting equilibrium the velocity field is identically zero, so
        // the change ratio is zero from the first checked step.
        assert_eq!(step(&mut engine), StabilityCode::StableAndConverged);
    }

    #[test]
    fn extrema_accumulate_and_reset() {
        let mut engine = bulk_serial_engine(2);
        engine.advance(&NoComm, params(-0.8)).unwrap();
        let extrema = engine.extrema();
        assert!((extrema.density_min - 1.0).abs() < 1e-9);
        assert!((extrema.density_max - 1.0).abs() < 1e-9);
        engine.reset_extrema();
        assert!(engine.extrema().density_min.is_infinite());
        let reduced = engine.reduce_extrema(&NoComm).unwrap();
        assert!(reduced.density_min.is_infinite());
    }
}
