//! Nodes of the network and the event-driven update loop.
//!
//! A [`PreciseNeuron`] never looks at the grid except to emit a spike or to
//! sample its membrane: between incoming events it propagates its state
//! exactly, and a threshold crossing inside any such mini-step is located to
//! floating-point precision by its [`CrossingStrategy`].

use crate::archive::SpikeHistoryArchive;
use crate::crossing::{CrossingError, CrossingStrategy};
use crate::model::SpikingModel;
use crate::slice_ring_buffer::{EventKind, SliceRingBuffer};
use crate::{NestError, NodeId, Result};
use oldies_core::{PreciseTime, StateVector, Step, Time, TimeGrid, TimeSeries};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Halvings of an unresolved mini-step before a crossing counts as missed.
pub const MAX_REFINEMENTS: usize = 8;

/// A spike produced during a slice, routed at the next slice boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmittedSpike {
    pub source: NodeId,
    pub time: PreciseTime,
    /// Multiplies the weight of every connection it travels along
    pub weight_scale: f64,
}

// ============================================================================
// PRECISE NEURON
// ============================================================================

#[derive(Debug)]
pub struct PreciseNeuron {
    model: Box<dyn SpikingModel>,
    strategy: CrossingStrategy,
    state: StateVector,
    refractory: bool,
    queue: SliceRingBuffer,
    archive: SpikeHistoryArchive,
    membrane_trace: Option<TimeSeries>,
}

impl PreciseNeuron {
    pub fn new(model: Box<dyn SpikingModel>, strategy: CrossingStrategy) -> Result<Self> {
        strategy.validate()?;
        if strategy == CrossingStrategy::StateSpace && !model.supports_state_space() {
            return Err(NestError::InvalidParameter(format!(
                "{} cannot use the state-space crossing mode with these parameters \
                 (needs tau_syn_ex == tau_syn_in != tau_m)",
                model.name()
            )));
        }
        let state = model.initial_state();
        let archive = SpikeHistoryArchive::new(model.trace_constants());
        Ok(Self {
            model,
            strategy,
            state,
            refractory: false,
            queue: SliceRingBuffer::new(1, 1),
            archive,
            membrane_trace: None,
        })
    }

    pub fn model(&self) -> &dyn SpikingModel {
        &*self.model
    }

    pub fn strategy(&self) -> CrossingStrategy {
        self.strategy
    }

    pub fn state(&self) -> &StateVector {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateVector {
        &mut self.state
    }

    /// Membrane potential (mV)
    pub fn membrane(&self) -> f64 {
        self.model.membrane(&self.state)
    }

    pub fn is_refractory(&self) -> bool {
        self.refractory
    }

    pub fn queue(&self) -> &SliceRingBuffer {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut SliceRingBuffer {
        &mut self.queue
    }

    pub fn archive(&self) -> &SpikeHistoryArchive {
        &self.archive
    }

    pub fn archive_mut(&mut self) -> &mut SpikeHistoryArchive {
        &mut self.archive
    }

    /// Sample the membrane potential at the end of every step from now on.
    pub fn record_membrane(&mut self) {
        if self.membrane_trace.is_none() {
            self.membrane_trace = Some(TimeSeries::new("V_m").with_units("mV"));
        }
    }

    pub fn membrane_trace(&self) -> Option<&TimeSeries> {
        self.membrane_trace.as_ref()
    }

    /// Update steps `origin + from .. origin + to` of the current slice.
    ///
    /// The queue must already carry `origin` and every event due in the slice.
    pub fn update(
        &mut self,
        node: NodeId,
        origin: Step,
        from: Step,
        to: Step,
        grid: &TimeGrid,
    ) -> Result<Vec<EmittedSpike>> {
        let h = grid.resolution();
        let mut emitted = Vec::new();
        self.queue.prepare_delivery();

        for lag in from..to {
            let stamp = origin + lag + 1;
            // time since the left edge of the step
            let mut t = 0.0;
            while let Some(event) = self.queue.get_next(stamp, false) {
                let t_event = h - event.offset;
                self.advance(node, stamp, t, t_event, grid, &mut emitted)?;
                t = t.max(t_event);
                match event.kind {
                    EventKind::Spike => self.model.apply_input(&mut self.state, event.weight),
                    EventKind::RefractoryReturn => self.refractory = false,
                }
            }
            self.advance(node, stamp, t, h, grid, &mut emitted)?;

            if let Some(trace) = self.membrane_trace.as_mut() {
                trace.push(grid.steps_to_ms(stamp), self.model.membrane(&self.state));
            }
        }
        Ok(emitted)
    }

    /// Propagate the mini-step `[t0, t1]` of step `stamp`, firing if the
    /// threshold is reached inside it.
    fn advance(
        &mut self,
        node: NodeId,
        stamp: Step,
        t0: Time,
        t1: Time,
        grid: &TimeGrid,
        emitted: &mut Vec<EmittedSpike>,
    ) -> Result<()> {
        let dt = t1 - t0;
        if dt <= 0.0 {
            return Ok(());
        }
        if self.refractory {
            self.state = self.model.propagate_refractory(&self.state, dt);
            return Ok(());
        }

        let after = self.model.propagate(&self.state, dt);
        let Some(theta) = self.locate(node, stamp, t0, &after, dt, grid)? else {
            self.state = after;
            return Ok(());
        };

        self.state = self.model.propagate(&self.state, theta);
        emitted.push(self.fire(node, stamp, t0 + theta, grid));
        self.state = self.model.propagate_refractory(&self.state, dt - theta);
        Ok(())
    }

    fn locate(
        &self,
        node: NodeId,
        stamp: Step,
        t0: Time,
        after: &StateVector,
        dt: Time,
        grid: &TimeGrid,
    ) -> Result<Option<Time>> {
        let error = match self.strategy.resolve(&*self.model, &self.state, after, dt) {
            Ok(found) => return Ok(found),
            Err(error) => error,
        };

        let time = grid.steps_to_ms(stamp - 1) + t0;
        let mut pieces = 2;
        for refinement in 1..=MAX_REFINEMENTS {
            warn!(node, time, refinement, %error, "crossing unresolved, refining mini-step");
            match self.scan(dt, pieces) {
                Ok(found) => return Ok(found),
                Err(_) => pieces *= 2,
            }
        }
        Err(NestError::MissedSpike {
            node,
            time,
            source: error,
        })
    }

    /// Resolve the mini-step as `pieces` equal sub-steps; first crossing wins.
    fn scan(&self, dt: Time, pieces: usize) -> std::result::Result<Option<Time>, CrossingError> {
        let sub = dt / pieces as f64;
        let mut state = self.state.clone();
        for i in 0..pieces {
            let next = self.model.propagate(&state, sub);
            if let Some(theta) = self.strategy.resolve(&*self.model, &state, &next, sub)? {
                return Ok(Some(i as f64 * sub + theta));
            }
            state = next;
        }
        Ok(None)
    }

    fn fire(&mut self, node: NodeId, stamp: Step, t_in_step: Time, grid: &TimeGrid) -> EmittedSpike {
        let h = grid.resolution();
        // the left edge belongs to the previous step; keep the spike in this one
        let offset = (h - t_in_step).clamp(0.0, h * (1.0 - f64::EPSILON));
        let time = PreciseTime::new(stamp, offset);

        self.model.reset(&mut self.state);
        self.refractory = true;
        self.queue
            .add_refractory(stamp + self.model.refractory_steps(grid), offset);
        self.archive.record_spike(time.to_ms(h));
        trace!(node, t = time.to_ms(h), "spike");

        EmittedSpike {
            source: node,
            time,
            weight_scale: 1.0,
        }
    }
}

// ============================================================================
// SPIKE GENERATOR
// ============================================================================

/// Spike generator parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpikeGeneratorParams {
    pub spike_times: Vec<f64>, // Spike times (ms)
    #[serde(default)]
    pub spike_weights: Vec<f64>, // Empty, or one factor per spike
}

/// Emits a fixed list of off-grid spike times
#[derive(Debug, Clone)]
pub struct SpikeGenerator {
    spikes: Vec<EmittedSpike>,
    next: usize,
}

impl SpikeGenerator {
    pub fn new(node: NodeId, params: &SpikeGeneratorParams, grid: &TimeGrid) -> Result<Self> {
        let weights = &params.spike_weights;
        if !weights.is_empty() && weights.len() != params.spike_times.len() {
            return Err(NestError::InvalidParameter(format!(
                "spike_weights has {} entries for {} spike times",
                weights.len(),
                params.spike_times.len()
            )));
        }
        if params.spike_times.windows(2).any(|w| w[1] < w[0]) {
            return Err(NestError::InvalidParameter(
                "spike_times must be sorted".into(),
            ));
        }

        let mut spikes = Vec::with_capacity(params.spike_times.len());
        for (i, &t) in params.spike_times.iter().enumerate() {
            if t <= 0.0 {
                return Err(NestError::InvalidParameter(format!(
                    "spike time {t} ms must be positive"
                )));
            }
            spikes.push(EmittedSpike {
                source: node,
                time: grid.precise(t)?,
                weight_scale: weights.get(i).copied().unwrap_or(1.0),
            });
        }
        Ok(Self { spikes, next: 0 })
    }

    pub fn remaining(&self) -> usize {
        self.spikes.len() - self.next
    }

    /// Spikes falling in steps `origin + from + 1 ..= origin + to`.
    pub fn update(&mut self, origin: Step, from: Step, to: Step) -> Vec<EmittedSpike> {
        let first = origin + from + 1;
        let last = origin + to;
        // times before `first` were scheduled into the past
        while self.next < self.spikes.len() && self.spikes[self.next].time.step < first {
            warn!(
                node = self.spikes[self.next].source,
                step = self.spikes[self.next].time.step,
                "spike generator time already passed, dropped"
            );
            self.next += 1;
        }
        let start = self.next;
        while self.next < self.spikes.len() && self.spikes[self.next].time.step <= last {
            self.next += 1;
        }
        self.spikes[start..self.next].to_vec()
    }
}

// ============================================================================
// NODE
// ============================================================================

#[derive(Debug)]
pub enum Node {
    Neuron(Box<PreciseNeuron>),
    Generator(SpikeGenerator),
}

impl Node {
    pub fn name(&self) -> &'static str {
        match self {
            Node::Neuron(n) => n.model().name(),
            Node::Generator(_) => "spike_generator",
        }
    }

    pub fn as_neuron(&self) -> Option<&PreciseNeuron> {
        match self {
            Node::Neuron(n) => Some(&**n),
            Node::Generator(_) => None,
        }
    }

    pub fn as_neuron_mut(&mut self) -> Option<&mut PreciseNeuron> {
        match self {
            Node::Neuron(n) => Some(&mut **n),
            Node::Generator(_) => None,
        }
    }

    pub fn update(
        &mut self,
        node: NodeId,
        origin: Step,
        from: Step,
        to: Step,
        grid: &TimeGrid,
    ) -> Result<Vec<EmittedSpike>> {
        match self {
            Node::Neuron(n) => n.update(node, origin, from, to, grid),
            Node::Generator(g) => Ok(g.update(origin, from, to)),
        }
    }
}
