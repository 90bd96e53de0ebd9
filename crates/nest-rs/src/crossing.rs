//! Location of threshold crossings inside a mini-step.
//!
//! Three interchangeable strategies, chosen per neuron:
//!
//! - **Interpolation** (order 0-3): fits a polynomial through the membrane
//!   values (and slopes, where the model provides them) at both ends of the
//!   mini-step. Cheap, with an error of order `dt^(order+1)`, but only looks
//!   at the end of the step, so an excursion above threshold that returns
//!   below within the step is not seen.
//! - **Bisection**: halves the bracket on the exact signed distance to
//!   threshold until it collapses to double precision.
//! - **StateSpace**: classifies the state with closed-form tests (end of step,
//!   initial slope, trajectory peak) before any root finding. It is the only
//!   mode that catches those short excursions.
//!
//! All strategies report `θ`, the crossing time measured from the start of
//! the mini-step, in `(0, dt]`.

use crate::model::{SubthresholdEnvelope, ThresholdTestable};
use oldies_core::{StateVector, Time};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use thiserror::Error;

/// Bisection stops once the signed distance is this close to zero (mV).
pub const BISECTION_DISTANCE_TOLERANCE: f64 = 1e-14;

const MAX_BISECTION_ITERATIONS: usize = 256;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrossingError {
    #[error("Threshold not bracketed on [{lo}, {hi}] ms (distances {d_lo} and {d_hi})")]
    Unbracketed { lo: Time, hi: Time, d_lo: f64, d_hi: f64 },

    #[error("State-space region {region} disagrees with the trajectory: {detail}")]
    InconsistentRegion { region: Region, detail: String },

    #[error("Interpolation order {0} not supported (0..=3)")]
    UnsupportedOrder(u8),
}

/// Crossing-time algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CrossingStrategy {
    Interpolation { order: u8 },
    Bisection,
    StateSpace,
}

impl Default for CrossingStrategy {
    fn default() -> Self {
        Self::Bisection
    }
}

impl fmt::Display for CrossingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interpolation { order } => write!(f, "interpolation (order {order})"),
            Self::Bisection => write!(f, "bisection"),
            Self::StateSpace => write!(f, "state-space"),
        }
    }
}

/// Outcome of the closed-form state-space tests for one mini-step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Region {
    /// At or above threshold at the end of the step
    SpikeByStepEnd,
    /// Never rising inside the step
    NoSpikeMonotone,
    /// Peak inside the step stays below threshold
    NoSpikeBelowPeak { peak: Time },
    /// Rises above threshold and falls back before the step ends
    MissedExcursion { peak: Time },
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpikeByStepEnd => write!(f, "spike-by-step-end"),
            Self::NoSpikeMonotone => write!(f, "no-spike-monotone"),
            Self::NoSpikeBelowPeak { peak } => write!(f, "no-spike-below-peak (peak at {peak} ms)"),
            Self::MissedExcursion { peak } => write!(f, "missed-excursion (peak at {peak} ms)"),
        }
    }
}

impl CrossingStrategy {
    pub fn validate(&self) -> Result<(), CrossingError> {
        match self {
            Self::Interpolation { order } if *order > 3 => Err(CrossingError::UnsupportedOrder(*order)),
            _ => Ok(()),
        }
    }

    /// Crossing time in `(0, dt]` after `before`, or `None` if the strategy
    /// sees no crossing. `after` must be `before` propagated by `dt`.
    ///
    /// A state that already sits at threshold crosses at `θ = 0`.
    pub fn resolve<M>(
        &self,
        model: &M,
        before: &StateVector,
        after: &StateVector,
        dt: Time,
    ) -> Result<Option<Time>, CrossingError>
    where
        M: SubthresholdEnvelope + ?Sized,
    {
        if model.distance_to_threshold(before) <= 0.0 {
            return Ok(Some(0.0));
        }
        let fires_by_end = model.distance_to_threshold(after) <= 0.0;
        match *self {
            Self::Interpolation { order } => {
                self.validate()?;
                Ok(fires_by_end.then(|| interpolate(order, model, before, after, dt)))
            }
            Self::Bisection => {
                if !fires_by_end {
                    return Ok(None);
                }
                bisect(model, before, 0.0, dt).map(Some)
            }
            Self::StateSpace => {
                let region = classify(model, before, after, dt);
                let hi = match region {
                    Region::SpikeByStepEnd => dt,
                    Region::MissedExcursion { peak } => peak,
                    Region::NoSpikeMonotone | Region::NoSpikeBelowPeak { .. } => return Ok(None),
                };
                bisect(model, before, 0.0, hi)
                    .map(Some)
                    .map_err(|e| CrossingError::InconsistentRegion {
                        region,
                        detail: e.to_string(),
                    })
            }
        }
    }
}

// ============================================================================
// STATE-SPACE CLASSIFICATION
// ============================================================================

/// Closed-form region of a subthreshold state for a mini-step of length `dt`.
pub fn classify<M>(model: &M, before: &StateVector, after: &StateVector, dt: Time) -> Region
where
    M: SubthresholdEnvelope + ?Sized,
{
    if model.distance_to_threshold(after) <= 0.0 {
        return Region::SpikeByStepEnd;
    }
    match model.peak_time(before) {
        Some(peak) if peak > 0.0 && peak < dt => {
            let at_peak = model.propagate(before, peak);
            if model.distance_to_threshold(&at_peak) <= 0.0 {
                Region::MissedExcursion { peak }
            } else {
                Region::NoSpikeBelowPeak { peak }
            }
        }
        _ => Region::NoSpikeMonotone,
    }
}

// ============================================================================
// BISECTION
// ============================================================================

/// First time in `[lo, hi]` at which the trajectory from `start` reaches
/// threshold. Requires subthreshold at `lo` and at/above threshold at `hi`.
pub fn bisect<M>(model: &M, start: &StateVector, lo: Time, hi: Time) -> Result<Time, CrossingError>
where
    M: ThresholdTestable + ?Sized,
{
    let distance = |t: Time| model.distance_to_threshold(&model.propagate(start, t));
    let d_lo = distance(lo);
    let d_hi = distance(hi);
    if !(d_lo > 0.0 && d_hi <= 0.0) {
        return Err(CrossingError::Unbracketed { lo, hi, d_lo, d_hi });
    }

    let width_tolerance = hi.abs().max(f64::MIN_POSITIVE) * f64::EPSILON;
    let (mut lo, mut hi) = (lo, hi);
    for _ in 0..MAX_BISECTION_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        if hi - lo <= width_tolerance || mid <= lo || mid >= hi {
            break;
        }
        let d = distance(mid);
        if d.abs() <= BISECTION_DISTANCE_TOLERANCE {
            return Ok(mid);
        }
        if d > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(hi)
}

// ============================================================================
// INTERPOLATION
// ============================================================================

fn interpolate<M>(order: u8, model: &M, before: &StateVector, after: &StateVector, dt: Time) -> Time
where
    M: ThresholdTestable + ?Sized,
{
    let th = model.threshold();
    let v0 = model.membrane(before);
    let v1 = model.membrane(after);
    let s0 = model.membrane_slope(before);
    let s1 = model.membrane_slope(after);

    let linear = || linear_root(v0, v1, th, dt);
    let quadratic = || s0.and_then(|s0| quadratic_root(v0, s0, v1, th, dt));
    match order {
        0 => dt,
        1 => linear(),
        2 => quadratic().unwrap_or_else(linear),
        _ => s0
            .zip(s1)
            .and_then(|(s0, s1)| cubic_root(v0, s0, v1, s1, th, dt))
            .or_else(quadratic)
            .unwrap_or_else(linear),
    }
}

fn linear_root(v0: f64, v1: f64, th: f64, dt: Time) -> Time {
    if v1 > v0 {
        ((th - v0) * dt / (v1 - v0)).clamp(0.0, dt)
    } else {
        dt
    }
}

/// Quadratic through `v0`, slope `s0` and `v1`
fn quadratic_root(v0: f64, s0: f64, v1: f64, th: f64, dt: Time) -> Option<Time> {
    let a = (v1 - v0 - s0 * dt) / (dt * dt);
    first_root_in(&real_roots(0.0, a, s0, v0 - th), dt)
}

/// Cubic Hermite through `(v0, s0)` and `(v1, s1)`
fn cubic_root(v0: f64, s0: f64, v1: f64, s1: f64, th: f64, dt: Time) -> Option<Time> {
    let dt2 = dt * dt;
    let w3 = 2.0 * (v0 - v1) / (dt2 * dt) + (s0 + s1) / dt2;
    let w2 = 3.0 * (v1 - v0) / dt2 - (2.0 * s0 + s1) / dt;
    first_root_in(&real_roots(w3, w2, s0, v0 - th), dt)
}

fn first_root_in(roots: &[f64], dt: Time) -> Option<Time> {
    let slack = dt * 1e-12;
    roots
        .iter()
        .copied()
        .filter(|t| t.is_finite() && *t >= -slack && *t <= dt + slack)
        .map(|t| t.clamp(0.0, dt))
        .min_by(|a, b| a.total_cmp(b))
}

/// Real roots of `a t^3 + b t^2 + c t + d`, degrading to lower degree when
/// leading coefficients vanish.
fn real_roots(a: f64, b: f64, c: f64, d: f64) -> Vec<f64> {
    let scale = b.abs() + c.abs() + d.abs();
    if a.abs() <= 1e-14 * scale {
        return quadratic_roots(b, c, d);
    }
    let r = b / a;
    let s = c / a;
    let t = d / a;
    // y = x + r/3 gives y^3 + p y + q = 0
    let p = s - r * r / 3.0;
    let q = 2.0 * r * r * r / 27.0 - r * s / 3.0 + t;
    let disc = (p / 3.0).powi(3) + (q / 2.0).powi(2);
    let shift = r / 3.0;

    if disc < 0.0 {
        let rho = (-(p * p * p) / 27.0).sqrt();
        let phi = (-q / (2.0 * rho)).clamp(-1.0, 1.0).acos();
        let m = 2.0 * rho.cbrt();
        (0..3)
            .map(|k| m * (phi / 3.0 + 2.0 * PI * k as f64 / 3.0).cos() - shift)
            .collect()
    } else {
        let sq = disc.sqrt();
        let u = (-q / 2.0 + sq).cbrt();
        let v = (-q / 2.0 - sq).cbrt();
        let mut roots = vec![u + v - shift];
        if disc == 0.0 {
            roots.push(-(u + v) / 2.0 - shift);
        }
        roots
    }
}

fn quadratic_roots(a: f64, b: f64, c: f64) -> Vec<f64> {
    if a.abs() <= 1e-14 * (b.abs() + c.abs()) {
        return if b != 0.0 { vec![-c / b] } else { Vec::new() };
    }
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return Vec::new();
    }
    // avoid cancellation
    let q = -0.5 * (b + b.signum() * disc.sqrt());
    let mut roots = vec![q / a];
    if q != 0.0 {
        roots.push(c / q);
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IafPscExpParams, IafPscExpPs, Propagatable, SpikingModel};
    use ndarray::arr1;

    /// dV/dt = (v_inf - V) / tau, no peak
    #[derive(Debug)]
    struct LinearDecay {
        tau: f64,
        v_inf: f64,
        theta: f64,
    }

    impl LinearDecay {
        fn analytic_crossing(&self, v0: f64) -> f64 {
            self.tau * ((self.v_inf - v0) / (self.v_inf - self.theta)).ln()
        }
    }

    impl Propagatable for LinearDecay {
        fn propagate(&self, state: &StateVector, dt: Time) -> StateVector {
            arr1(&[self.v_inf + (state[0] - self.v_inf) * (-dt / self.tau).exp()])
        }
    }

    impl ThresholdTestable for LinearDecay {
        fn membrane(&self, state: &StateVector) -> f64 {
            state[0]
        }

        fn threshold(&self) -> f64 {
            self.theta
        }

        fn membrane_slope(&self, state: &StateVector) -> Option<f64> {
            Some((self.v_inf - state[0]) / self.tau)
        }
    }

    impl SubthresholdEnvelope for LinearDecay {
        fn peak_time(&self, _state: &StateVector) -> Option<Time> {
            None
        }
    }

    fn decay() -> LinearDecay {
        LinearDecay {
            tau: 10.0,
            v_inf: 20.0,
            theta: 15.0,
        }
    }

    fn resolve(strategy: CrossingStrategy, m: &LinearDecay, v0: f64, dt: f64) -> Option<f64> {
        let before = arr1(&[v0]);
        let after = m.propagate(&before, dt);
        strategy.resolve(m, &before, &after, dt).unwrap()
    }

    #[test]
    fn test_exact_modes_match_analytic_crossing() {
        let m = decay();
        let exact = m.analytic_crossing(14.9);
        for strategy in [CrossingStrategy::Bisection, CrossingStrategy::StateSpace] {
            let theta = resolve(strategy, &m, 14.9, 0.5).unwrap();
            assert!((theta - exact).abs() < 1e-10, "{strategy}: {theta} vs {exact}");
        }
    }

    #[test]
    fn test_interpolation_error_shrinks_with_order() {
        let m = decay();
        let exact = m.analytic_crossing(14.9);
        let err = |order| (resolve(CrossingStrategy::Interpolation { order }, &m, 14.9, 0.5).unwrap() - exact).abs();
        assert_eq!(resolve(CrossingStrategy::Interpolation { order: 0 }, &m, 14.9, 0.5), Some(0.5));
        assert!(err(1) < 1e-2);
        assert!(err(2) < 1e-4);
        assert!(err(3) < 1e-6);
        assert!(err(3) < err(2) && err(2) < err(1));
    }

    #[test]
    fn test_no_crossing_reported_below_threshold() {
        let m = decay();
        for strategy in [
            CrossingStrategy::Interpolation { order: 3 },
            CrossingStrategy::Bisection,
            CrossingStrategy::StateSpace,
        ] {
            assert_eq!(resolve(strategy, &m, 10.0, 0.1), None);
        }
    }

    #[test]
    fn test_unsupported_order() {
        let m = decay();
        let before = arr1(&[14.9]);
        let after = m.propagate(&before, 0.5);
        let err = CrossingStrategy::Interpolation { order: 4 }
            .resolve(&m, &before, &after, 0.5)
            .unwrap_err();
        assert_eq!(err, CrossingError::UnsupportedOrder(4));
    }

    #[test]
    fn test_bisect_requires_bracket() {
        let m = decay();
        let err = bisect(&m, &arr1(&[10.0]), 0.0, 0.1).unwrap_err();
        assert!(matches!(err, CrossingError::Unbracketed { .. }));
    }

    /// Rises above threshold and is pulled back below it within 1 ms.
    fn excursion() -> (IafPscExpPs, StateVector) {
        let model = IafPscExpPs::new(IafPscExpParams {
            i_e: -6000.0,
            ..Default::default()
        });
        let mut state = model.initial_state();
        state[3] = 14.5;
        model.apply_input(&mut state, 8000.0);
        (model, state)
    }

    #[test]
    fn test_missed_excursion_regression() {
        let (model, before) = excursion();
        let dt = 1.0;
        let after = model.propagate(&before, dt);
        assert!(model.distance_to_threshold(&after) > 0.0);

        for order in 0..=1 {
            let got = CrossingStrategy::Interpolation { order }
                .resolve(&model, &before, &after, dt)
                .unwrap();
            assert_eq!(got, None, "order {order} should miss the excursion");
        }

        assert!(matches!(
            classify(&model, &before, &after, dt),
            Region::MissedExcursion { .. }
        ));
        let theta = CrossingStrategy::StateSpace
            .resolve(&model, &before, &after, dt)
            .unwrap()
            .unwrap();
        assert!(theta > 0.0 && theta < 0.45);
        let at_crossing = model.propagate(&before, theta);
        assert!(model.distance_to_threshold(&at_crossing).abs() < 1e-9);
    }

    #[test]
    fn test_peak_below_threshold_is_no_spike() {
        let (model, mut before) = excursion();
        before[3] = 13.0;
        let after = model.propagate(&before, 1.0);
        let region = classify(&model, &before, &after, 1.0);
        assert!(matches!(region, Region::NoSpikeBelowPeak { .. }));
        assert_eq!(
            CrossingStrategy::StateSpace.resolve(&model, &before, &after, 1.0).unwrap(),
            None
        );
    }

    #[test]
    fn test_cubic_roots() {
        // (t - 1)(t - 2)(t - 3)
        let mut roots = real_roots(1.0, -6.0, 11.0, -6.0);
        roots.sort_by(|a, b| a.total_cmp(b));
        for (got, want) in roots.iter().zip([1.0, 2.0, 3.0]) {
            assert!((got - want).abs() < 1e-9);
        }
        let single = real_roots(1.0, 0.0, 1.0, -2.0);
        assert_eq!(single.len(), 1);
        assert!((single[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_config_names() {
        let json = serde_json::to_string(&CrossingStrategy::Interpolation { order: 2 }).unwrap();
        assert_eq!(json, r#"{"mode":"interpolation","order":2}"#);
        let parsed: CrossingStrategy = serde_json::from_str(r#"{"mode":"state_space"}"#).unwrap();
        assert_eq!(parsed, CrossingStrategy::StateSpace);
    }
}
