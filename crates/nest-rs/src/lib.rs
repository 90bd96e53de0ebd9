//! # NEST-RS: precise spike timing
//!
//! Event core of the NEST revival (https://www.nest-simulator.org/), for
//! neurons whose spikes are not confined to the simulation grid.
//!
//! Key pieces:
//! - Slice ring buffers delivering off-grid events in exact time order
//! - Threshold crossing resolvers (interpolation, bisection, state-space)
//! - Spike history archives with reader registration for plastic synapses
//! - Delay registry and continuous (non-grid) delays
//! - Event-driven update loop, parallel across nodes within a min-delay slice

use oldies_core::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod archive;
pub mod crossing;
pub mod delay;
pub mod model;
pub mod network;
pub mod neuron;
pub mod slice_ring_buffer;
pub mod synapse;

pub use archive::{ArchiveError, HistEntry, ReaderId, SpikeHistoryArchive, TraceConstants, STDP_EPS};
pub use crossing::{CrossingError, CrossingStrategy, Region};
pub use delay::{BadDelay, ContinuousDelay, DelayRegistry};
pub use model::{IafPscExpParams, IafPscExpPs, Propagatable, SpikingModel, SubthresholdEnvelope, ThresholdTestable};
pub use network::{ConnectionConfig, Network, NetworkConfig, NodeSpec};
pub use neuron::{EmittedSpike, Node, PreciseNeuron, SpikeGenerator, SpikeGeneratorParams};
pub use slice_ring_buffer::{Delivery, EventKind, SliceRingBuffer};
pub use synapse::{Connection, StdpParams, StdpState, SynapseModel};

#[derive(Error, Debug)]
pub enum NestError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error(transparent)]
    BadDelay(#[from] BadDelay),
    #[error(transparent)]
    Crossing(#[from] CrossingError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Time(#[from] CoreError),
    #[error("Missed spike in node {node} near {time} ms: {source}")]
    MissedSpike {
        node: NodeId,
        time: f64,
        source: CrossingError,
    },
    #[error("Simulation error: {0}")]
    SimulationError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid network description: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NestError>;

// ============================================================================
// NODE IDS (NEST's fundamental concept)
// ============================================================================

/// Global node identifier, starting at 1
pub type NodeId = usize;

/// Collection of node IDs (like NEST's NodeCollection)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCollection {
    pub ids: Vec<NodeId>,
}

impl NodeCollection {
    pub fn new(ids: Vec<NodeId>) -> Self {
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Slice of nodes
    pub fn slice(&self, start: usize, end: usize) -> Self {
        Self::new(self.ids[start..end].to_vec())
    }
}

// ============================================================================
// CONNECTION SPECIFICATION
// ============================================================================

/// Connection rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityRule {
    /// All-to-all connection
    #[default]
    AllToAll,

    /// One-to-one mapping (same indices)
    OneToOne,
}

/// Connection specification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSpec {
    pub rule: ConnectivityRule,
    pub weight: f64, // pA
    pub delay: f64,  // ms, need not be a multiple of the resolution
    pub synapse_model: SynapseModel,
    pub allow_autapses: bool,
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            rule: ConnectivityRule::AllToAll,
            weight: 1.0,
            delay: 1.0,
            synapse_model: SynapseModel::Static,
            allow_autapses: false,
        }
    }
}

// ============================================================================
// RECORDING
// ============================================================================

/// Recorded spike events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeData {
    pub times: Vec<f64>,
    pub senders: Vec<NodeId>,
}

impl SpikeData {
    pub fn new() -> Self {
        Self {
            times: vec![],
            senders: vec![],
        }
    }

    pub fn record(&mut self, time: f64, sender: NodeId) {
        self.times.push(time);
        self.senders.push(sender);
    }

    pub fn n_events(&self) -> usize {
        self.times.len()
    }

    /// Get spike trains organized by sender
    pub fn spike_trains(&self) -> HashMap<NodeId, Vec<f64>> {
        let mut trains: HashMap<NodeId, Vec<f64>> = HashMap::new();
        for (&time, &sender) in self.times.iter().zip(self.senders.iter()) {
            trains.entry(sender).or_default().push(time);
        }
        trains
    }
}

impl Default for SpikeData {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// KERNEL PARAMETERS
// ============================================================================

/// Simulation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelParams {
    pub resolution: f64,        // Time step (ms)
    pub min_delay: Option<f64>, // User-set minimum delay (ms)
    pub max_delay: Option<f64>, // User-set maximum delay (ms)
    pub num_threads: usize,     // Number of threads
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            resolution: 0.1,
            min_delay: None,
            max_delay: None,
            num_threads: 1,
        }
    }
}

// ============================================================================
// SPIKE TRAIN STATISTICS
// ============================================================================

/// Calculate mean firing rate (Hz) from spike data
pub fn mean_firing_rate(data: &SpikeData, n_neurons: usize, duration: f64) -> f64 {
    if n_neurons == 0 || duration <= 0.0 {
        return 0.0;
    }
    (data.n_events() as f64) / (n_neurons as f64) / (duration / 1000.0)
}

/// Calculate coefficient of variation of ISI
pub fn cv_isi(spike_train: &[f64]) -> f64 {
    if spike_train.len() < 2 {
        return 0.0;
    }

    let isis: Vec<f64> = spike_train.windows(2)
        .map(|w| w[1] - w[0])
        .collect();

    let mean = isis.iter().sum::<f64>() / isis.len() as f64;
    let variance = isis.iter()
        .map(|&x| (x - mean).powi(2))
        .sum::<f64>() / isis.len() as f64;

    variance.sqrt() / mean
}

// ============================================================================
// TESTS
// ============================================================================
