//! Delay bookkeeping.
//!
//! [`DelayRegistry`] holds the network-wide delay extrema that size every
//! slice ring buffer and fix the slice length. [`ContinuousDelay`] splits a
//! delay that is not a multiple of the resolution into whole steps plus an
//! offset correction applied at delivery time.

use oldies_core::{PreciseTime, Step, Time, TimeGrid, GRID_TOLERANCE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A delay that is inconsistent with the resolution or the frozen extrema.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Bad delay {delay} ms: {reason}")]
pub struct BadDelay {
    pub delay: Time,
    pub reason: String,
}

impl BadDelay {
    fn new(delay: Time, reason: impl Into<String>) -> Self {
        Self {
            delay,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// DELAY REGISTRY
// ============================================================================

/// Network-wide minimum and maximum delay, in steps.
///
/// Before the first simulation step every admitted delay widens the bounds
/// (unless the user fixed them with [`DelayRegistry::set_extrema`]). After
/// [`DelayRegistry::lock`] the bounds are frozen and any delay outside them
/// is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayRegistry {
    grid: TimeGrid,
    min_delay: Option<Step>,
    max_delay: Option<Step>,
    user_set: bool,
    locked: bool,
}

impl DelayRegistry {
    pub fn new(grid: TimeGrid) -> Self {
        Self {
            grid,
            min_delay: None,
            max_delay: None,
            user_set: false,
            locked: false,
        }
    }

    pub fn grid(&self) -> TimeGrid {
        self.grid
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Minimum delay in steps; one step while no delay has been registered.
    pub fn min_delay_steps(&self) -> Step {
        self.min_delay.unwrap_or(1)
    }

    /// Maximum delay in steps, never below the minimum.
    pub fn max_delay_steps(&self) -> Step {
        self.max_delay
            .unwrap_or(1)
            .max(self.min_delay_steps())
    }

    pub fn min_delay(&self) -> Time {
        self.grid.steps_to_ms(self.min_delay_steps())
    }

    pub fn max_delay(&self) -> Time {
        self.grid.steps_to_ms(self.max_delay_steps())
    }

    /// Fix the extrema explicitly. Later delays outside them are rejected
    /// instead of widening the bounds.
    pub fn set_extrema(&mut self, min_ms: Time, max_ms: Time) -> Result<(), BadDelay> {
        if self.locked {
            return Err(BadDelay::new(
                min_ms,
                "min_delay and max_delay cannot be changed after simulation has started",
            ));
        }
        let min = self.grid.ms_to_steps(min_ms);
        let max = self.grid.ms_to_steps(max_ms);
        if min < 1 {
            return Err(BadDelay::new(
                min_ms,
                "min_delay must be greater than or equal to resolution",
            ));
        }
        if max < min {
            return Err(BadDelay::new(max_ms, "max_delay must not be smaller than min_delay"));
        }
        if self.min_delay.is_some_and(|m| m < min) || self.max_delay.is_some_and(|m| m > max) {
            return Err(BadDelay::new(
                min_ms,
                "existing connections have delays outside the requested extrema",
            ));
        }
        self.min_delay = Some(min);
        self.max_delay = Some(max);
        self.user_set = true;
        Ok(())
    }

    /// Freeze the current bounds. Called when simulation starts.
    pub fn lock(&mut self) {
        if !self.locked {
            self.min_delay = Some(self.min_delay_steps());
            self.max_delay = Some(self.max_delay_steps());
            self.locked = true;
            debug!(
                min_delay = self.min_delay(),
                max_delay = self.max_delay(),
                "delay extrema frozen"
            );
        }
    }

    /// Validate a delay given in ms and return it in steps.
    pub fn validate(&mut self, delay_ms: Time) -> Result<Step, BadDelay> {
        if !delay_ms.is_finite() {
            return Err(BadDelay::new(delay_ms, "delay must be finite"));
        }
        let h = self.grid.resolution();
        if delay_ms < h * (1.0 - GRID_TOLERANCE) {
            return Err(BadDelay::new(
                delay_ms,
                "delay must be greater than or equal to resolution",
            ));
        }
        if !self.grid.is_on_grid(delay_ms) {
            return Err(BadDelay::new(
                delay_ms,
                "delay is not a multiple of the resolution; use a continuous delay",
            ));
        }
        let steps = self.grid.ms_to_steps(delay_ms);
        self.admit(steps, steps, delay_ms)?;
        Ok(steps)
    }

    /// Validate two step counts as one change; both are admitted or neither.
    pub fn validate_step_pair(&mut self, first: Step, second: Step, delay_ms: Time) -> Result<(), BadDelay> {
        self.admit(first.min(second), first.max(second), delay_ms)
    }

    fn admit(&mut self, low: Step, high: Step, delay_ms: Time) -> Result<(), BadDelay> {
        if low < 1 {
            return Err(BadDelay::new(
                delay_ms,
                "delay must be greater than or equal to resolution",
            ));
        }
        if self.locked {
            if low < self.min_delay_steps() || high > self.max_delay_steps() {
                return Err(BadDelay::new(
                    delay_ms,
                    "minimum and maximum delay cannot be changed after simulation has started",
                ));
            }
            return Ok(());
        }

        let widens_min = self.min_delay.map_or(true, |m| low < m);
        let widens_max = self.max_delay.map_or(true, |m| high > m);
        if self.user_set && widens_min {
            return Err(BadDelay::new(delay_ms, "delay is smaller than user-set min_delay"));
        }
        if self.user_set && widens_max {
            return Err(BadDelay::new(delay_ms, "delay is larger than user-set max_delay"));
        }
        if widens_min {
            self.min_delay = Some(low);
        }
        if widens_max {
            self.max_delay = Some(high);
        }
        Ok(())
    }

    /// Decompose a delay that need not be a multiple of the resolution.
    ///
    /// Both candidate step counts are admitted, since the one used for a
    /// given spike depends on that spike's own offset.
    pub fn decompose(&mut self, delay_ms: Time) -> Result<ContinuousDelay, BadDelay> {
        if !delay_ms.is_finite() || delay_ms <= 0.0 {
            return Err(BadDelay::new(delay_ms, "delay must be finite and positive"));
        }
        if self.grid.is_on_grid(delay_ms) {
            let steps = self.validate(delay_ms)?;
            return Ok(ContinuousDelay {
                integer_steps: steps,
                offset_correction: 0.0,
            });
        }

        let lower = (delay_ms / self.grid.resolution()).floor() as Step;
        self.validate_step_pair(lower, lower + 1, delay_ms)?;
        Ok(ContinuousDelay {
            integer_steps: lower + 1,
            offset_correction: self.grid.steps_to_ms(lower + 1) - delay_ms,
        })
    }
}

// ============================================================================
// CONTINUOUS DELAY
// ============================================================================

/// `integer_steps * h - offset_correction == delay`, with the correction in `[0, h)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContinuousDelay {
    pub integer_steps: Step,
    pub offset_correction: f64,
}

impl ContinuousDelay {
    /// Delay that is an exact multiple of the resolution
    pub fn whole_steps(steps: Step) -> Self {
        Self {
            integer_steps: steps,
            offset_correction: 0.0,
        }
    }

    pub fn delay_ms(&self, h: Time) -> Time {
        self.integer_steps as f64 * h - self.offset_correction
    }

    /// Delivery stamp of a spike emitted at `spike`.
    ///
    /// The correction is added to the spike's own offset; if the sum spills
    /// over a full step the delivery moves one step earlier.
    pub fn apply(&self, spike: PreciseTime, h: Time) -> PreciseTime {
        let total = spike.offset + self.offset_correction;
        if total < h {
            PreciseTime::new(spike.step + self.integer_steps, total)
        } else {
            PreciseTime::new(spike.step + self.integer_steps - 1, total - h)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn registry(h: f64) -> DelayRegistry {
        DelayRegistry::new(TimeGrid::new(h).unwrap())
    }

    #[test]
    fn test_validate_widens_before_lock() {
        let mut reg = registry(0.1);
        assert_eq!(reg.validate(1.5).unwrap(), 15);
        assert_eq!(reg.validate(0.5).unwrap(), 5);
        assert_eq!(reg.validate(3.0).unwrap(), 30);
        assert_eq!(reg.min_delay_steps(), 5);
        assert_eq!(reg.max_delay_steps(), 30);
    }

    #[test]
    fn test_delay_below_resolution_rejected() {
        let mut reg = registry(1.0);
        let err = reg.validate(0.4).unwrap_err();
        assert!(err.reason.contains("resolution"));
        // would round up to a whole step
        assert!(reg.validate(0.6).unwrap_err().reason.contains("resolution"));
        assert!(reg.decompose(0.5).is_err());
        assert_eq!(reg.min_delay_steps(), 1);
        assert!(reg.max_delay.is_none());
    }

    #[test]
    fn test_validate_rejects_off_grid_delay() {
        let mut reg = registry(1.0);
        let err = reg.validate(1.4).unwrap_err();
        assert!(err.reason.contains("multiple"));
        assert!(reg.max_delay.is_none());
        // the same delay is fine as a continuous one
        let d = reg.decompose(1.4).unwrap();
        assert_eq!(d.integer_steps, 2);
        assert_eq!(reg.max_delay_steps(), 2);
    }

    #[test]
    fn test_locked_bounds() {
        let mut reg = registry(1.0);
        reg.validate(2.0).unwrap();
        reg.validate(4.0).unwrap();
        reg.lock();
        assert!(reg.validate(3.0).is_ok());
        assert!(reg.validate(1.0).is_err());
        assert!(reg.validate(5.0).is_err());
        assert_eq!(reg.min_delay_steps(), 2);
        assert_eq!(reg.max_delay_steps(), 4);
        assert!(reg.set_extrema(1.0, 10.0).is_err());
    }

    #[test]
    fn test_lock_without_connections_freezes_one_step() {
        let mut reg = registry(0.5);
        reg.lock();
        assert!(reg.validate(0.5).is_ok());
        assert!(reg.validate(1.0).is_err());
    }

    #[test]
    fn test_user_set_extrema() {
        let mut reg = registry(0.1);
        reg.set_extrema(1.0, 5.0).unwrap();
        assert!(reg.validate(2.0).is_ok());
        assert!(reg.validate(0.5).is_err());
        assert!(reg.validate(6.0).is_err());
        assert_eq!(reg.min_delay_steps(), 10);
        assert_eq!(reg.max_delay_steps(), 50);
    }

    #[test]
    fn test_set_extrema_conflicts_with_existing() {
        let mut reg = registry(0.1);
        reg.validate(0.5).unwrap();
        assert!(reg.set_extrema(1.0, 5.0).is_err());
    }

    #[test]
    fn test_decompose_off_grid() {
        let mut reg = registry(1.0);
        let d = reg.decompose(1.7).unwrap();
        assert_eq!(d.integer_steps, 2);
        assert!((d.offset_correction - 0.3).abs() < 1e-12);
        // both candidates registered
        assert_eq!(reg.min_delay_steps(), 1);
        assert_eq!(reg.max_delay_steps(), 2);
    }

    #[test]
    fn test_decompose_on_grid() {
        let mut reg = registry(0.1);
        let d = reg.decompose(0.3).unwrap();
        assert_eq!(d, ContinuousDelay::whole_steps(3));
    }

    #[test]
    fn test_apply_keeps_step_or_rolls_back() {
        let d = ContinuousDelay {
            integer_steps: 2,
            offset_correction: 0.3,
        };
        let a = d.apply(PreciseTime::new(2, 0.0), 1.0);
        assert_eq!(a.step, 4);
        assert!((a.offset - 0.3).abs() < 1e-12);

        let b = d.apply(PreciseTime::new(6, 0.5), 1.0);
        assert_eq!(b.step, 8);
        assert!((b.offset - 0.8).abs() < 1e-12);

        // 0.9 + 0.3 spills into the previous step
        let c = d.apply(PreciseTime::new(3, 0.9), 1.0);
        assert_eq!(c.step, 4);
        assert!((c.offset - 0.2).abs() < 1e-12);
        assert!((c.to_ms(1.0) - (2.1 + 1.7)).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_decompose_round_trip(h in prop::sample::select(vec![0.1, 0.25, 1.0]), k in 1.0f64..1000.0) {
            let delay = k * h;
            let mut reg = registry(h);
            let d = reg.decompose(delay).unwrap();
            prop_assert!((d.delay_ms(h) - delay).abs() < 1e-9);
            prop_assert!(d.offset_correction >= 0.0);
            prop_assert!(d.offset_correction < h);
        }

        #[test]
        fn prop_apply_preserves_arrival_time(
            step in 0i64..10_000,
            offset_frac in 0.0f64..1.0,
            k in 1.0f64..50.0,
        ) {
            let h = 0.1;
            let mut reg = registry(h);
            let d = reg.decompose(k * h).unwrap();
            let spike = PreciseTime::new(step, offset_frac * h);
            let arrival = d.apply(spike, h);
            prop_assert!((arrival.to_ms(h) - (spike.to_ms(h) + k * h)).abs() < 1e-9);
            prop_assert!(arrival.offset >= 0.0 && arrival.offset < h);
        }
    }
}
