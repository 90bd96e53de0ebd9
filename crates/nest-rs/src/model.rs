//! Neuron capability traits and the reference precise-timing model.
//!
//! The event loop only ever talks to a neuron model through these traits:
//! exact subthreshold propagation, the distance to threshold, and (for the
//! lossless crossing mode) the closed-form position of the trajectory peak.

use crate::archive::TraceConstants;
use ndarray::{arr1, Array2};
use oldies_core::{StateVector, Step, Time, TimeGrid, Voltage};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// Exact evolution of the subthreshold state
pub trait Propagatable: Send + Sync {
    /// Advance `state` by `dt` ms with no input events.
    fn propagate(&self, state: &StateVector, dt: Time) -> StateVector;

    /// Advance while refractory. Defaults to free propagation.
    fn propagate_refractory(&self, state: &StateVector, dt: Time) -> StateVector {
        self.propagate(state, dt)
    }
}

/// Access to the state variable that is compared against threshold
pub trait ThresholdTestable: Propagatable {
    fn membrane(&self, state: &StateVector) -> Voltage;

    fn threshold(&self) -> Voltage;

    /// Positive while subthreshold, zero or negative at/above threshold.
    fn distance_to_threshold(&self, state: &StateVector) -> f64 {
        self.threshold() - self.membrane(state)
    }

    /// dV/dt at `state`, if the model can provide it (mV/ms).
    fn membrane_slope(&self, _state: &StateVector) -> Option<f64> {
        None
    }
}

/// Closed-form shape of the free trajectory, used by the lossless mode.
pub trait SubthresholdEnvelope: ThresholdTestable {
    /// Time until the free trajectory starting in `state` reaches its single
    /// interior maximum, or `None` if it never turns downwards.
    fn peak_time(&self, state: &StateVector) -> Option<Time>;
}

/// Everything the event-driven update loop needs from a neuron model
pub trait SpikingModel: SubthresholdEnvelope + Debug {
    fn name(&self) -> &'static str;

    fn initial_state(&self) -> StateVector;

    /// Effect of an incoming spike of the given weight
    fn apply_input(&self, state: &mut StateVector, weight: f64);

    /// Post-spike reset
    fn reset(&self, state: &mut StateVector);

    fn refractory_period(&self) -> Time;

    /// Refractory period in whole steps of `grid`
    fn refractory_steps(&self, grid: &TimeGrid) -> Step {
        grid.ms_to_steps(self.refractory_period())
    }

    /// Decay constants of the spike-history traces
    fn trace_constants(&self) -> TraceConstants;

    /// Whether [`SubthresholdEnvelope::peak_time`] is exact for this parameter set
    fn supports_state_space(&self) -> bool;
}

// ============================================================================
// IAF_PSC_EXP_PS
// ============================================================================

/// Parameters for iaf_psc_exp_ps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IafPscExpParams {
    pub c_m: f64,        // Membrane capacitance (pF)
    pub tau_m: f64,      // Membrane time constant (ms)
    pub tau_syn_ex: f64, // Excitatory synaptic time constant (ms)
    pub tau_syn_in: f64, // Inhibitory synaptic time constant (ms)
    pub t_ref: f64,      // Refractory period (ms)
    pub e_l: f64,        // Resting potential (mV)
    pub v_reset: f64,    // Reset potential (mV)
    pub v_th: f64,       // Spike threshold (mV)
    pub i_e: f64,        // External DC current (pA)
    pub tau_minus: f64,         // Post-synaptic trace time constant (ms)
    pub tau_minus_triplet: f64, // Triplet trace time constant (ms)
}

impl Default for IafPscExpParams {
    fn default() -> Self {
        Self {
            c_m: 250.0,
            tau_m: 10.0,
            tau_syn_ex: 2.0,
            tau_syn_in: 2.0,
            t_ref: 2.0,
            e_l: -70.0,
            v_reset: -70.0,
            v_th: -55.0,
            i_e: 0.0,
            tau_minus: 20.0,
            tau_minus_triplet: 110.0,
        }
    }
}

/// Leaky integrate-and-fire neuron with exponential PSCs and off-grid spikes.
///
/// State is homogeneous, `[1, I_ex, I_in, V]` with `V` relative to `E_L`,
/// so every propagator is a plain 4x4 matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IafPscExpPs {
    pub params: IafPscExpParams,
}

const ONE: usize = 0;
const I_EX: usize = 1;
const I_IN: usize = 2;
const V_M: usize = 3;

impl IafPscExpPs {
    pub fn new(params: IafPscExpParams) -> Self {
        Self { params }
    }

    /// Response of V to a unit current decaying with `tau_s`, after `dt`.
    fn psc_kernel(&self, tau_s: f64, dt: Time) -> f64 {
        let p = &self.params;
        let decay_m = (-dt / p.tau_m).exp();
        let rate_diff = 1.0 / p.tau_m - 1.0 / tau_s;
        if rate_diff.abs() * dt < 1e-12 {
            // tau_s == tau_m limit
            return dt / p.c_m * decay_m;
        }
        // tau_m tau_s / (C (tau_s - tau_m)) * (e^{-dt/tau_s} - e^{-dt/tau_m})
        decay_m * (rate_diff * dt).exp_m1() / (p.c_m * rate_diff)
    }

    /// Exact propagator over `dt` in homogeneous coordinates.
    pub fn propagator(&self, dt: Time, refractory: bool) -> Array2<f64> {
        let p = &self.params;
        let mut m = Array2::<f64>::zeros((4, 4));
        m[[ONE, ONE]] = 1.0;
        m[[I_EX, I_EX]] = (-dt / p.tau_syn_ex).exp();
        m[[I_IN, I_IN]] = (-dt / p.tau_syn_in).exp();
        if refractory {
            m[[V_M, V_M]] = 1.0;
        } else {
            m[[V_M, ONE]] = -p.i_e * p.tau_m / p.c_m * (-dt / p.tau_m).exp_m1();
            m[[V_M, I_EX]] = self.psc_kernel(p.tau_syn_ex, dt);
            m[[V_M, I_IN]] = self.psc_kernel(p.tau_syn_in, dt);
            m[[V_M, V_M]] = (-dt / p.tau_m).exp();
        }
        m
    }

    fn threshold_rel(&self) -> f64 {
        self.params.v_th - self.params.e_l
    }
}

impl Propagatable for IafPscExpPs {
    fn propagate(&self, state: &StateVector, dt: Time) -> StateVector {
        self.propagator(dt, false).dot(state)
    }

    fn propagate_refractory(&self, state: &StateVector, dt: Time) -> StateVector {
        self.propagator(dt, true).dot(state)
    }
}

impl ThresholdTestable for IafPscExpPs {
    fn membrane(&self, state: &StateVector) -> Voltage {
        state[V_M] + self.params.e_l
    }

    fn threshold(&self) -> Voltage {
        self.params.v_th
    }

    fn distance_to_threshold(&self, state: &StateVector) -> f64 {
        self.threshold_rel() - state[V_M]
    }

    fn membrane_slope(&self, state: &StateVector) -> Option<f64> {
        let p = &self.params;
        Some(-state[V_M] / p.tau_m + (state[I_EX] + state[I_IN] + p.i_e) / p.c_m)
    }
}

impl SubthresholdEnvelope for IafPscExpPs {
    fn peak_time(&self, state: &StateVector) -> Option<Time> {
        if !self.supports_state_space() {
            return None;
        }
        let p = &self.params;
        let tau_s = p.tau_syn_ex;
        let i_0 = state[I_EX] + state[I_IN];
        let v_inf = p.i_e * p.tau_m / p.c_m;
        // V(t) = v_inf + a e^{-t/tau_m} + k e^{-t/tau_s}
        let k = i_0 * p.tau_m * tau_s / (p.c_m * (tau_s - p.tau_m));
        let a = state[V_M] - v_inf - k;

        let slope_0 = -a / p.tau_m - k / tau_s;
        if slope_0 <= 0.0 || a == 0.0 {
            return None;
        }
        let ratio = -k * p.tau_m / (a * tau_s);
        if ratio <= 0.0 {
            return None;
        }
        let t_peak = ratio.ln() / (1.0 / tau_s - 1.0 / p.tau_m);
        (t_peak.is_finite() && t_peak > 0.0).then_some(t_peak)
    }
}

impl SpikingModel for IafPscExpPs {
    fn name(&self) -> &'static str {
        "iaf_psc_exp_ps"
    }

    fn initial_state(&self) -> StateVector {
        arr1(&[1.0, 0.0, 0.0, 0.0])
    }

    fn apply_input(&self, state: &mut StateVector, weight: f64) {
        if weight >= 0.0 {
            state[I_EX] += weight;
        } else {
            state[I_IN] += weight;
        }
    }

    fn reset(&self, state: &mut StateVector) {
        state[V_M] = self.params.v_reset - self.params.e_l;
    }

    fn refractory_period(&self) -> Time {
        self.params.t_ref
    }

    fn trace_constants(&self) -> TraceConstants {
        TraceConstants {
            tau_minus: self.params.tau_minus,
            tau_minus_triplet: self.params.tau_minus_triplet,
        }
    }

    /// The lossless envelope needs one synaptic time constant distinct from tau_m.
    fn supports_state_space(&self) -> bool {
        let p = &self.params;
        p.tau_syn_ex == p.tau_syn_in && (p.tau_syn_ex - p.tau_m).abs() > 1e-9 * p.tau_m
    }
}
