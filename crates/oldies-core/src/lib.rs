//! # OldiesRules Core
//!
//! Shared time vocabulary for the precise-timing simulator crates.
//!
//! Simulation time lives on two granularities:
//!
//! | Granularity | Type | Meaning |
//! |-------------|------|---------|
//! | coarse | [`Step`] | integer multiples of the resolution `h` |
//! | exact  | [`PreciseTime`] | a step plus an offset in `[0, h)` |
//!
//! An offset is measured *backwards* from the right edge of its step, so
//! `PreciseTime { step, offset }` names the instant `step * h - offset`.
//! An on-grid time therefore always carries offset `0`.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid resolution: {0} ms (must be finite and positive)")]
    InvalidResolution(f64),

    #[error("Invalid time: {0} ms")]
    InvalidTime(f64),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Time point (ms)
pub type Time = f64;

/// Grid step count
pub type Step = i64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (pA)
pub type Current = f64;

/// State vector of a neuron model
pub type StateVector = Array1<f64>;

/// Times closer than this fraction of `h` to a grid point are snapped onto it.
pub const GRID_TOLERANCE: f64 = 1e-9;

// ============================================================================
// PRECISE TIME
// ============================================================================

/// Off-grid time stamp: the instant `step * h - offset`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PreciseTime {
    pub step: Step,
    pub offset: f64,
}

impl PreciseTime {
    pub fn new(step: Step, offset: f64) -> Self {
        Self { step, offset }
    }

    /// Time stamp exactly on the grid
    pub fn on_grid(step: Step) -> Self {
        Self { step, offset: 0.0 }
    }

    /// Convert to milliseconds given the resolution `h`
    pub fn to_ms(&self, h: Time) -> Time {
        self.step as f64 * h - self.offset
    }

    /// Shift by a whole number of steps, keeping the offset.
    pub fn shifted(&self, steps: Step) -> Self {
        Self::new(self.step + steps, self.offset)
    }
}

// Later step first by step, then larger offset = earlier within the same step.
impl Ord for PreciseTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.step
            .cmp(&other.step)
            .then_with(|| other.offset.total_cmp(&self.offset))
    }
}

impl PartialOrd for PreciseTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PreciseTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PreciseTime {}

// ============================================================================
// TIME GRID
// ============================================================================

/// Simulation resolution and the conversions that depend on it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeGrid {
    resolution: Time,
}

impl TimeGrid {
    pub fn new(resolution: Time) -> Result<Self> {
        if !resolution.is_finite() || resolution <= 0.0 {
            return Err(CoreError::InvalidResolution(resolution));
        }
        Ok(Self { resolution })
    }

    pub fn resolution(&self) -> Time {
        self.resolution
    }

    /// Nearest whole number of steps (used for delays)
    pub fn ms_to_steps(&self, ms: Time) -> Step {
        (ms / self.resolution).round() as Step
    }

    pub fn steps_to_ms(&self, steps: Step) -> Time {
        steps as f64 * self.resolution
    }

    /// True if `ms` is a whole multiple of the resolution within [`GRID_TOLERANCE`].
    pub fn is_on_grid(&self, ms: Time) -> bool {
        let ratio = ms / self.resolution;
        (ratio - ratio.round()).abs() < GRID_TOLERANCE
    }

    /// Split a time in ms into the step whose interval `((step-1)h, step*h]`
    /// contains it and the offset back from that step's right edge.
    pub fn precise(&self, ms: Time) -> Result<PreciseTime> {
        if !ms.is_finite() {
            return Err(CoreError::InvalidTime(ms));
        }
        let ratio = ms / self.resolution;
        if self.is_on_grid(ms) {
            return Ok(PreciseTime::on_grid(ratio.round() as Step));
        }
        let step = ratio.ceil() as Step;
        let offset = (self.steps_to_ms(step) - ms).clamp(0.0, self.resolution);
        // Rounding can leave the offset a hair below h; that instant is on grid.
        if offset >= self.resolution {
            return Ok(PreciseTime::on_grid(step - 1));
        }
        Ok(PreciseTime::new(step, offset))
    }
}

// ============================================================================
// RECORDING
// ============================================================================

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Last recorded value
    pub fn last(&self) -> Option<(Time, f64)> {
        Some((*self.time.last()?, *self.values.last()?))
    }
}
