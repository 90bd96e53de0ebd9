//! Network driver.
//!
//! Time advances in slices of `min_delay` steps. At each slice boundary the
//! spikes emitted during the previous slice are routed into their targets'
//! ring buffers; this is also where plastic connections read and update
//! against their target's spike history. The nodes are then updated in
//! parallel, since no spike emitted inside a slice can reach any node
//! before the slice ends.

use crate::delay::DelayRegistry;
use crate::model::{IafPscExpParams, IafPscExpPs, SpikingModel};
use crate::neuron::{EmittedSpike, Node, PreciseNeuron, SpikeGenerator, SpikeGeneratorParams};
use crate::synapse::{Connection, StdpState, SynapseModel};
use crate::{
    ConnectionSpec, ConnectivityRule, CrossingStrategy, KernelParams, NestError, NodeCollection, NodeId,
    Result, SpikeData,
};
use oldies_core::{Step, Time, TimeGrid, TimeSeries};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Node population in a network description
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum NodeSpec {
    IafPscExpPs {
        #[serde(default)]
        params: IafPscExpParams,
        #[serde(default)]
        crossing: CrossingStrategy,
        #[serde(default = "default_count")]
        count: usize,
    },
    SpikeGenerator(SpikeGeneratorParams),
}

fn default_count() -> usize {
    1
}

/// Connections between two node lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub sources: Vec<NodeId>,
    pub targets: Vec<NodeId>,
    #[serde(flatten)]
    pub spec: ConnectionSpec,
}

/// Complete network description, loadable from JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub kernel: KernelParams,
    /// Created in order; ids are assigned from 1
    pub nodes: Vec<NodeSpec>,
    pub connections: Vec<ConnectionConfig>,
    pub record_membrane: Vec<NodeId>,
    pub simulation_time: f64, // ms
}

impl NetworkConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

// ============================================================================
// NETWORK
// ============================================================================

pub struct Network {
    params: KernelParams,
    grid: TimeGrid,
    delays: DelayRegistry,
    nodes: Vec<Node>,
    connections: Vec<Connection>,
    /// Connection indices by source node index
    outgoing: Vec<Vec<usize>>,
    /// Emitted during the last slice, routed at the next boundary
    pending: Vec<EmittedSpike>,
    clock: Step,
    spikes: SpikeData,
    pool: ThreadPool,
}

impl Network {
    pub fn new(params: KernelParams) -> Result<Self> {
        let grid = TimeGrid::new(params.resolution)?;
        let mut delays = DelayRegistry::new(grid);
        if let (Some(min), Some(max)) = (params.min_delay, params.max_delay) {
            delays.set_extrema(min, max)?;
        } else if params.min_delay.is_some() || params.max_delay.is_some() {
            return Err(NestError::InvalidParameter(
                "min_delay and max_delay must be set together".into(),
            ));
        }
        if params.num_threads == 0 {
            return Err(NestError::InvalidParameter("num_threads must be at least 1".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.num_threads)
            .build()
            .map_err(|e| NestError::SimulationError(e.to_string()))?;

        Ok(Self {
            params,
            grid,
            delays,
            nodes: Vec::new(),
            connections: Vec::new(),
            outgoing: Vec::new(),
            pending: Vec::new(),
            clock: 0,
            spikes: SpikeData::new(),
            pool,
        })
    }

    /// Build a network from a description; simulation is left to the caller.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        let mut net = Self::new(config.kernel.clone())?;
        for spec in &config.nodes {
            net.create(spec)?;
        }
        for conn in &config.connections {
            net.connect_spec(
                &NodeCollection::new(conn.sources.clone()),
                &NodeCollection::new(conn.targets.clone()),
                &conn.spec,
            )?;
        }
        for &id in &config.record_membrane {
            net.record_membrane(id)?;
        }
        Ok(net)
    }

    pub fn params(&self) -> &KernelParams {
        &self.params
    }

    pub fn grid(&self) -> TimeGrid {
        self.grid
    }

    pub fn delays(&self) -> &DelayRegistry {
        &self.delays
    }

    /// Current simulation time (ms)
    pub fn time(&self) -> Time {
        self.grid.steps_to_ms(self.clock)
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn spike_data(&self) -> &SpikeData {
        &self.spikes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        id.checked_sub(1)
            .and_then(|i| self.nodes.get(i))
            .ok_or(NestError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        id.checked_sub(1)
            .and_then(|i| self.nodes.get_mut(i))
            .ok_or(NestError::NodeNotFound(id))
    }

    pub fn neuron(&self, id: NodeId) -> Result<&PreciseNeuron> {
        self.node(id)?
            .as_neuron()
            .ok_or_else(|| NestError::InvalidParameter(format!("node {id} is not a neuron")))
    }

    pub fn neuron_mut(&mut self, id: NodeId) -> Result<&mut PreciseNeuron> {
        self.node_mut(id)?
            .as_neuron_mut()
            .ok_or_else(|| NestError::InvalidParameter(format!("node {id} is not a neuron")))
    }

    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    fn push_node(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.outgoing.push(Vec::new());
        self.nodes.len()
    }

    /// Create a population described by `spec`
    pub fn create(&mut self, spec: &NodeSpec) -> Result<NodeCollection> {
        match spec {
            NodeSpec::IafPscExpPs { params, crossing, count } => {
                let mut ids = Vec::with_capacity(*count);
                for _ in 0..*count {
                    ids.push(self.add_neuron(Box::new(IafPscExpPs::new(params.clone())), *crossing)?);
                }
                Ok(NodeCollection::new(ids))
            }
            NodeSpec::SpikeGenerator(params) => Ok(NodeCollection::new(vec![self.add_spike_generator(params)?])),
        }
    }

    pub fn add_neuron(&mut self, model: Box<dyn SpikingModel>, strategy: CrossingStrategy) -> Result<NodeId> {
        let t_ref = model.refractory_period();
        if !self.grid.is_on_grid(t_ref) || model.refractory_steps(&self.grid) < 1 {
            return Err(NestError::InvalidParameter(format!(
                "refractory period {t_ref} ms must be a positive multiple of the resolution {} ms",
                self.grid.resolution()
            )));
        }
        let mut neuron = PreciseNeuron::new(model, strategy)?;
        if self.delays.is_locked() {
            neuron
                .queue_mut()
                .resize(self.delays.min_delay_steps(), self.delays.max_delay_steps());
        }
        Ok(self.push_node(Node::Neuron(Box::new(neuron))))
    }

    pub fn add_spike_generator(&mut self, params: &SpikeGeneratorParams) -> Result<NodeId> {
        let id = self.nodes.len() + 1;
        let mut generator = SpikeGenerator::new(id, params, &self.grid)?;
        // drop times that already lie in the past
        generator.update(self.clock, 0, 0);
        Ok(self.push_node(Node::Generator(generator)))
    }

    pub fn record_membrane(&mut self, id: NodeId) -> Result<()> {
        self.neuron_mut(id)?.record_membrane();
        Ok(())
    }

    pub fn membrane_trace(&self, id: NodeId) -> Result<Option<&TimeSeries>> {
        Ok(self.neuron(id)?.membrane_trace())
    }

    /// Connect `source` to `target`. The delay need not be a multiple of the
    /// resolution; an unusable delay is reported as [`NestError::BadDelay`].
    pub fn connect(
        &mut self,
        source: NodeId,
        target: NodeId,
        weight: f64,
        delay: f64,
        synapse: &SynapseModel,
    ) -> Result<()> {
        self.node(source)?;
        if self.node(target)?.as_neuron().is_none() {
            return Err(NestError::ConnectionError(format!(
                "target {target} is a spike generator and accepts no input"
            )));
        }
        let continuous_delay = self.delays.decompose(delay)?;

        let now = self.time();
        let plasticity = match synapse {
            SynapseModel::Static => None,
            SynapseModel::Stdp(params) => {
                let archive = self.neuron_mut(target)?.archive_mut();
                Some(StdpState::register(params.clone(), archive, now, delay))
            }
        };

        self.outgoing[source - 1].push(self.connections.len());
        self.connections.push(Connection {
            source,
            target,
            weight,
            delay,
            continuous_delay,
            plasticity,
        });
        Ok(())
    }

    /// Connect two collections by rule; returns the number of connections made.
    pub fn connect_spec(
        &mut self,
        sources: &NodeCollection,
        targets: &NodeCollection,
        spec: &ConnectionSpec,
    ) -> Result<usize> {
        let pairs: Vec<(NodeId, NodeId)> = match spec.rule {
            ConnectivityRule::AllToAll => sources
                .ids
                .iter()
                .flat_map(|&src| targets.ids.iter().map(move |&tgt| (src, tgt)))
                .collect(),
            ConnectivityRule::OneToOne => {
                if sources.len() != targets.len() {
                    return Err(NestError::ConnectionError(
                        "OneToOne requires equal population sizes".into(),
                    ));
                }
                sources.ids.iter().copied().zip(targets.ids.iter().copied()).collect()
            }
        };

        let mut made = 0;
        for (src, tgt) in pairs {
            if !spec.allow_autapses && src == tgt {
                continue;
            }
            self.connect(src, tgt, spec.weight, spec.delay, &spec.synapse_model)?;
            made += 1;
        }
        Ok(made)
    }

    /// Remove every connection from `source` to `target`, releasing the
    /// archive readers of plastic ones. Returns how many were removed.
    pub fn disconnect(&mut self, source: NodeId, target: NodeId) -> Result<usize> {
        self.node(source)?;
        self.node(target)?;
        let (removed, kept): (Vec<Connection>, Vec<Connection>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|c| c.source == source && c.target == target);
        self.connections = kept;

        for conn in &removed {
            if let Some(stdp) = &conn.plasticity {
                self.neuron_mut(target)?.archive_mut().remove_reader(stdp.reader())?;
            }
        }

        for out in &mut self.outgoing {
            out.clear();
        }
        for (i, conn) in self.connections.iter().enumerate() {
            self.outgoing[conn.source - 1].push(i);
        }
        Ok(removed.len())
    }

    // ========================================================================
    // SIMULATION
    // ========================================================================

    pub fn simulate(&mut self, duration: Time) -> Result<()> {
        self.simulate_with_progress(duration, |_, _| {})
    }

    /// Run for `duration` ms, calling `progress(done, total)` in steps after
    /// every slice.
    pub fn simulate_with_progress<F>(&mut self, duration: Time, mut progress: F) -> Result<()>
    where
        F: FnMut(Step, Step),
    {
        if !(duration >= 0.0) || !self.grid.is_on_grid(duration) {
            return Err(NestError::InvalidParameter(format!(
                "simulation time {duration} ms must be a non-negative multiple of the resolution"
            )));
        }
        self.freeze_delays();

        let h = self.grid.resolution();
        let min_delay = self.delays.min_delay_steps();
        let total = self.grid.ms_to_steps(duration);
        let start = self.clock;
        let end = start + total;
        info!(
            t_start = self.time(),
            duration,
            nodes = self.nodes.len(),
            connections = self.connections.len(),
            min_delay = self.delays.min_delay(),
            threads = self.params.num_threads,
            "simulation started"
        );

        while self.clock < end {
            let origin = self.clock - self.clock.rem_euclid(min_delay);
            let from = self.clock - origin;
            let to = (end - origin).min(min_delay);

            for node in &mut self.nodes {
                if let Some(neuron) = node.as_neuron_mut() {
                    neuron.queue_mut().set_origin(origin);
                }
            }
            self.route(origin)?;

            let mut emitted = self.update_nodes(origin, from, to)?;
            emitted.sort_by(|a, b| a.time.cmp(&b.time).then(a.source.cmp(&b.source)));
            for spike in &emitted {
                self.spikes.record(spike.time.to_ms(h), spike.source);
            }
            debug!(origin, from, to, spikes = emitted.len(), "slice done");

            self.pending = emitted;
            self.clock = origin + to;
            progress(self.clock - start, total);
        }

        info!(t_end = self.time(), spikes = self.spikes.n_events(), "simulation finished");
        Ok(())
    }

    /// Lock the delay extrema and size every queue for them, once.
    fn freeze_delays(&mut self) {
        if self.delays.is_locked() {
            return;
        }
        self.delays.lock();
        let (min, max) = (self.delays.min_delay_steps(), self.delays.max_delay_steps());
        for node in &mut self.nodes {
            if let Some(neuron) = node.as_neuron_mut() {
                neuron.queue_mut().resize(min, max);
            }
        }
    }

    /// Deliver the spikes of the last slice into their targets' queues.
    fn route(&mut self, origin: Step) -> Result<()> {
        let h = self.grid.resolution();
        let pending = std::mem::take(&mut self.pending);
        for spike in &pending {
            let t_spike = spike.time.to_ms(h);
            for &ci in &self.outgoing[spike.source - 1] {
                let conn = &mut self.connections[ci];
                let Some(target) = self.nodes[conn.target - 1].as_neuron_mut() else {
                    continue;
                };
                let weight = conn.transmit(t_spike, Some(target.archive_mut()))? * spike.weight_scale;
                let arrival = conn.continuous_delay.apply(spike.time, h);
                target
                    .queue_mut()
                    .add_spike(arrival.step - 1 - origin, arrival.step, arrival.offset, weight);
            }
        }
        Ok(())
    }

    fn update_nodes(&mut self, origin: Step, from: Step, to: Step) -> Result<Vec<EmittedSpike>> {
        let grid = self.grid;
        let nodes = &mut self.nodes;
        let per_node: Vec<Vec<EmittedSpike>> = self.pool.install(|| {
            nodes
                .par_iter_mut()
                .enumerate()
                .map(|(i, node)| node.update(i + 1, origin, from, to, &grid))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(per_node.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(resolution: f64) -> KernelParams {
        KernelParams {
            resolution,
            ..Default::default()
        }
    }

    #[test]
    fn test_node_ids_start_at_one() {
        let mut net = Network::new(kernel(0.1)).unwrap();
        let pop = net
            .create(&NodeSpec::IafPscExpPs {
                params: IafPscExpParams::default(),
                crossing: CrossingStrategy::default(),
                count: 3,
            })
            .unwrap();
        assert_eq!(pop.ids, vec![1, 2, 3]);
        assert!(matches!(net.node(0), Err(NestError::NodeNotFound(0))));
        assert!(net.node(4).is_err());
    }

    #[test]
    fn test_generator_cannot_be_target() {
        let mut net = Network::new(kernel(0.1)).unwrap();
        let gen = net.add_spike_generator(&SpikeGeneratorParams::default()).unwrap();
        let err = net.connect(gen, gen, 1.0, 1.0, &SynapseModel::Static).unwrap_err();
        assert!(matches!(err, NestError::ConnectionError(_)));
    }

    #[test]
    fn test_refractory_period_must_fit_grid() {
        let mut net = Network::new(kernel(0.3)).unwrap();
        let model = IafPscExpPs::new(IafPscExpParams::default());
        assert!(net.add_neuron(Box::new(model), CrossingStrategy::Bisection).is_err());
    }

    #[test]
    fn test_one_to_one_requires_equal_sizes() {
        let mut net = Network::new(kernel(0.1)).unwrap();
        let spec = NodeSpec::IafPscExpPs {
            params: IafPscExpParams::default(),
            crossing: CrossingStrategy::default(),
            count: 3,
        };
        let a = net.create(&spec).unwrap();
        let conn = ConnectionSpec {
            rule: ConnectivityRule::OneToOne,
            ..Default::default()
        };
        assert!(net.connect_spec(&a, &a.slice(0, 2), &conn).is_err());
        // autapses are skipped by default
        assert_eq!(net.connect_spec(&a, &a, &ConnectionSpec::default()).unwrap(), 6);
    }

    #[test]
    fn test_simulation_time_must_fit_grid() {
        let mut net = Network::new(kernel(0.1)).unwrap();
        assert!(net.simulate(0.05).is_err());
        assert!(net.simulate(-1.0).is_err());
        net.simulate(1.0).unwrap();
        assert!((net.time() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_slices_resume() {
        let mut net = Network::new(kernel(0.1)).unwrap();
        let gen = net
            .add_spike_generator(&SpikeGeneratorParams {
                spike_times: vec![0.35, 1.05],
                spike_weights: vec![],
            })
            .unwrap();
        let pop = net
            .create(&NodeSpec::IafPscExpPs {
                params: IafPscExpParams::default(),
                crossing: CrossingStrategy::default(),
                count: 1,
            })
            .unwrap();
        net.connect(gen, pop.ids[0], 10.0, 0.5, &SynapseModel::Static).unwrap();

        // min delay is 5 steps; stop in the middle of slices
        net.simulate(0.3).unwrap();
        net.simulate(0.4).unwrap();
        net.simulate(0.8).unwrap();
        assert!((net.time() - 1.5).abs() < 1e-12);
        assert_eq!(net.spike_data().n_events(), 2);
        assert!((net.spike_data().times[0] - 0.35).abs() < 1e-12);
        // the first spike (arrives at 0.85) was consumed; the second, emitted
        // in the last slice, is routed only when the next slice starts
        assert_eq!(net.neuron(pop.ids[0]).unwrap().queue().len(), 0);
        net.simulate(0.1).unwrap();
        assert!(net.neuron(pop.ids[0]).unwrap().queue().is_empty());
        assert!(net.neuron(pop.ids[0]).unwrap().state()[1] > 0.0);
    }

    #[test]
    fn test_min_and_max_delay_set_together() {
        let params = KernelParams {
            min_delay: Some(1.0),
            ..Default::default()
        };
        assert!(Network::new(params).is_err());
    }
}
