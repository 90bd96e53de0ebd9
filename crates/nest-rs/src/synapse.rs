//! Connections between nodes.
//!
//! A connection carries its delay already decomposed into whole steps and an
//! offset correction, so off-grid spikes keep their exact arrival time. A
//! plastic connection additionally reads the spike history of its target.

use crate::archive::{ArchiveError, ReaderId, SpikeHistoryArchive};
use crate::delay::ContinuousDelay;
use crate::NodeId;
use oldies_core::Time;
use serde::{Deserialize, Serialize};

// ============================================================================
// SYNAPSE MODELS
// ============================================================================

/// Synapse model of a new connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SynapseModel {
    /// Static synapse (fixed weight)
    #[default]
    Static,

    /// Pair-based STDP synapse
    Stdp(StdpParams),
}

/// STDP parameters (the depression time constant is the target's `tau_minus`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StdpParams {
    pub tau_plus: f64, // Time constant for potentiation (ms)
    pub lambda: f64,   // Step size for potentiation
    pub alpha: f64,    // Asymmetry parameter
    pub w_max: f64,    // Maximum weight
    pub mu_plus: f64,  // Weight dependence exponent for LTP
    pub mu_minus: f64, // Weight dependence exponent for LTD
}

impl Default for StdpParams {
    fn default() -> Self {
        Self {
            tau_plus: 20.0,
            lambda: 0.01,
            alpha: 1.0,
            w_max: 100.0,
            mu_plus: 1.0,
            mu_minus: 1.0,
        }
    }
}

impl StdpParams {
    fn facilitate(&self, w: f64, kplus: f64) -> f64 {
        let norm_w = w / self.w_max + self.lambda * (1.0 - w / self.w_max).powf(self.mu_plus) * kplus;
        norm_w.min(1.0) * self.w_max
    }

    fn depress(&self, w: f64, kminus: f64) -> f64 {
        let norm_w = w / self.w_max - self.alpha * self.lambda * (w / self.w_max).powf(self.mu_minus) * kminus;
        norm_w.max(0.0) * self.w_max
    }
}

// ============================================================================
// STDP STATE
// ============================================================================

/// Per-connection STDP state and its archive reader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdpState {
    pub params: StdpParams,
    reader: ReaderId,
    kplus: f64,
    t_last: Time,
    dendritic_delay: Time,
}

impl StdpState {
    /// Register with `archive`. No spike at or before `now - dendritic_delay`,
    /// nor any the archive has already erased, will ever be read.
    pub fn register(
        params: StdpParams,
        archive: &mut SpikeHistoryArchive,
        now: Time,
        dendritic_delay: Time,
    ) -> Self {
        let reader = archive.register_reader(now - dendritic_delay);
        Self {
            params,
            reader,
            kplus: 0.0,
            t_last: now,
            dendritic_delay,
        }
    }

    pub fn reader(&self) -> ReaderId {
        self.reader
    }

    /// Presynaptic trace just after the last presynaptic spike
    pub fn kplus(&self) -> f64 {
        self.kplus
    }

    /// Update `weight` for a presynaptic spike at `t_spike` and return it.
    pub fn on_presynaptic_spike(
        &mut self,
        weight: f64,
        t_spike: Time,
        archive: &mut SpikeHistoryArchive,
    ) -> Result<f64, ArchiveError> {
        let d = self.dendritic_delay;
        let mut w = weight;
        // `t_last - d`, or later if the archive had already erased spikes
        // when this connection was made
        let read_from = archive.watermark(self.reader)?;

        // potentiation by postsynaptic spikes since the last presynaptic one
        for post in archive.read_window(read_from, t_spike - d)? {
            let minus_dt = self.t_last - (post.t + d);
            w = self.params.facilitate(w, self.kplus * (minus_dt / self.params.tau_plus).exp());
        }
        w = self.params.depress(w, archive.value_at(t_spike - d));
        archive.unregister_reader(self.reader, (t_spike - d).max(read_from))?;

        self.kplus = self.kplus * ((self.t_last - t_spike) / self.params.tau_plus).exp() + 1.0;
        self.t_last = t_spike;
        Ok(w)
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// Connection (edge)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source: NodeId,
    pub target: NodeId,
    pub weight: f64,
    /// Delay as requested (ms)
    pub delay: f64,
    pub continuous_delay: ContinuousDelay,
    pub plasticity: Option<StdpState>,
}

impl Connection {
    pub fn is_plastic(&self) -> bool {
        self.plasticity.is_some()
    }

    /// Weight to deliver for a presynaptic spike at `t_spike`, updating
    /// plastic state on the way. `archive` is the target's history.
    pub fn transmit(
        &mut self,
        t_spike: Time,
        archive: Option<&mut SpikeHistoryArchive>,
    ) -> Result<f64, ArchiveError> {
        if let (Some(stdp), Some(archive)) = (self.plasticity.as_mut(), archive) {
            self.weight = stdp.on_presynaptic_spike(self.weight, t_spike, archive)?;
        }
        Ok(self.weight)
    }
}
