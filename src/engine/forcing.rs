//! Time-varying boundary densities.
//!
//! Inlets and outlets carry a pulsatile density: average plus a cosine
//! term with per-boundary amplitude and phase. The driver recomputes the
//! tables once per step and the cycle engine only reads them.

use std::f64::consts::PI;

/// Per-boundary (average, amplitude, phase) triples for one family of
/// boundaries (all inlets, or all outlets).
#[derive(Debug, Clone, Default)]
pub struct BoundaryForcing {
    average: Vec<f64>,
    amplitude: Vec<f64>,
    phase: Vec<f64>,
}

impl BoundaryForcing {
    pub fn new(average: Vec<f64>, amplitude: Vec<f64>, phase: Vec<f64>) -> Self {
        assert_eq!(average.len(), amplitude.len());
        assert_eq!(average.len(), phase.len());
        Self {
            average,
            amplitude,
            phase,
        }
    }

    /// Steady boundaries at the given densities.
    pub fn steady(densities: Vec<f64>) -> Self {
        let n = densities.len();
        Self {
            average: densities,
            amplitude: vec![0.0; n],
            phase: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.average.len()
    }

    pub fn is_empty(&self) -> bool {
        self.average.is_empty()
    }

    /// Fill `out` with the densities at `time_step` of a period of
    /// `period` steps.
    pub fn densities_at(&self, time_step: u64, period: u64, out: &mut Vec<f64>) {
        let w = 2.0 * PI / period as f64;
        out.clear();
        out.extend(
            itertools::izip!(&self.average, &self.amplitude, &self.phase)
                .map(|(avg, amp, phs)| avg + amp * (w * time_step as f64 + phs).cos()),
        );
    }
}
