//! Exponential heart-rate recovery model
//!
//! Fits `HR(t) = settle + amplitude · e^(−(t − t0)/τ)` to a run of samples by
//! least squares. For a fixed τ the model is linear in `settle` and
//! `amplitude`, so those are solved in closed form and only τ is searched:
//! a log-spaced grid followed by golden-section refinement in log-τ.
//!
//! `amplitude` is constrained to be non-negative: a rising segment is not a
//! recovery and fits as a flat line (R² = 0) rather than as an inverted curve.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::config::MetricsConfig;

const GRID_STEPS: usize = 48;
const REFINE_ITERATIONS: usize = 40;

/// Result of fitting the decay model to one window or interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayFit {
    /// Asymptotic heart rate the curve settles towards
    pub settle_bpm: f64,

    /// Height of the curve above `settle_bpm` at the first sample
    pub amplitude_bpm: f64,

    /// Time constant in seconds; `None` when no decay component was fitted
    pub tau_sec: Option<f64>,

    /// Coefficient of determination of the fit
    pub r_squared: f64,

    /// Offset of the first sample; the curve's time origin
    pub origin_sec: f64,
}

impl DecayFit {
    /// Model prediction at offset `t`
    pub fn predict(&self, t: f64) -> f64 {
        match self.tau_sec {
            Some(tau) => self.settle_bpm + self.amplitude_bpm * (-(t - self.origin_sec) / tau).exp(),
            None => self.settle_bpm,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Projection {
    settle: f64,
    amplitude: f64,
    ss_res: f64,
}

/// Least-squares fitter for the recovery model
#[derive(Debug, Clone, Copy)]
pub struct DecayFitter {
    tau_min_sec: f64,
    tau_max_sec: f64,
}

impl DecayFitter {
    pub fn new(tau_min_sec: f64, tau_max_sec: f64) -> Self {
        Self {
            tau_min_sec,
            tau_max_sec,
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Self {
        Self::new(config.tau_min_sec, config.tau_max_sec)
    }

    /// Fit `(offset_sec, bpm)` points, sorted by offset.
    ///
    /// Returns `None` for fewer than three points. A segment with no variance
    /// has no decay to explain and gets R² = 0.
    pub fn fit(&self, points: &[(f64, f64)]) -> Option<DecayFit> {
        if points.len() < 3 {
            return None;
        }

        let origin = points[0].0;
        let mean_y = points.iter().map(|p| p.1).mean();
        let ss_tot: f64 = points.iter().map(|p| (p.1 - mean_y).powi(2)).sum();

        if ss_tot < 1e-9 {
            return Some(DecayFit {
                settle_bpm: mean_y,
                amplitude_bpm: 0.0,
                tau_sec: None,
                r_squared: 0.0,
                origin_sec: origin,
            });
        }

        let ln_min = self.tau_min_sec.ln();
        let ln_max = self.tau_max_sec.ln();
        let step = (ln_max - ln_min) / (GRID_STEPS - 1) as f64;
        let evaluate = |ln_tau: f64| project(points, origin, ln_tau.exp()).ss_res;

        let mut best_k = 0;
        let mut best_ss = f64::INFINITY;
        for k in 0..GRID_STEPS {
            let ss = evaluate(ln_min + step * k as f64);
            if ss < best_ss {
                best_ss = ss;
                best_k = k;
            }
        }

        let lo = ln_min + step * best_k.saturating_sub(1) as f64;
        let hi = ln_min + step * (best_k + 1).min(GRID_STEPS - 1) as f64;
        let refined = golden_section(lo, hi, evaluate);

        let ln_tau = if evaluate(refined) < best_ss {
            refined
        } else {
            ln_min + step * best_k as f64
        };
        let tau = ln_tau.exp();
        let projection = project(points, origin, tau);

        let r_squared = (1.0 - projection.ss_res / ss_tot).min(1.0);

        Some(DecayFit {
            settle_bpm: projection.settle,
            amplitude_bpm: projection.amplitude,
            tau_sec: (projection.amplitude > 0.0).then_some(tau),
            r_squared,
            origin_sec: origin,
        })
    }
}

/// Closed-form settle/amplitude for a fixed τ, with amplitude clamped at zero
fn project(points: &[(f64, f64)], origin: f64, tau: f64) -> Projection {
    let n = points.len() as f64;
    let basis: Vec<f64> = points.iter().map(|p| (-(p.0 - origin) / tau).exp()).collect();

    let mean_basis = basis.iter().sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut s_bb = 0.0;
    let mut s_by = 0.0;
    for (b, p) in basis.iter().zip(points) {
        s_bb += (b - mean_basis) * (b - mean_basis);
        s_by += (b - mean_basis) * (p.1 - mean_y);
    }

    let amplitude = if s_bb > 1e-15 { (s_by / s_bb).max(0.0) } else { 0.0 };
    let settle = mean_y - amplitude * mean_basis;

    let ss_res = basis
        .iter()
        .zip(points)
        .map(|(b, p)| (p.1 - settle - amplitude * b).powi(2))
        .sum();

    Projection {
        settle,
        amplitude,
        ss_res,
    }
}

/// Minimize a unimodal function on `[lo, hi]`
fn golden_section<F: Fn(f64) -> f64>(lo: f64, hi: f64, f: F) -> f64 {
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (lo, hi);
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);

    for _ in 0..REFINE_ITERATIONS {
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = f(d);
        }
    }

    if fc < fd {
        c
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fitter() -> DecayFitter {
        DecayFitter::new(1.0, 600.0)
    }

    fn exponential(from: u32, to: u32, settle: f64, amplitude: f64, tau: f64) -> Vec<(f64, f64)> {
        (from..=to)
            .map(|t| (t as f64, settle + amplitude * (-(t as f64) / tau).exp()))
            .collect()
    }

    #[test]
    fn test_recovers_known_curve() {
        let points = exponential(0, 90, 110.0, 60.0, 25.0);
        let fit = fitter().fit(&points).unwrap();

        assert!(fit.r_squared > 0.9999);
        let tau = fit.tau_sec.unwrap();
        assert!((tau - 25.0).abs() < 0.5, "tau = {}", tau);
        assert!((fit.settle_bpm - 110.0).abs() < 0.5);
        assert!((fit.predict(0.0) - 170.0).abs() < 0.5);
    }

    #[test]
    fn test_window_away_from_origin() {
        let points = exponential(30, 60, 110.0, 60.0, 25.0);
        let fit = fitter().fit(&points).unwrap();
        assert!(fit.r_squared > 0.999);
        assert!((fit.tau_sec.unwrap() - 25.0).abs() < 1.0);
    }

    #[test]
    fn test_flat_segment_has_zero_r2() {
        let points: Vec<(f64, f64)> = (0..=30).map(|t| (t as f64, 150.0)).collect();
        let fit = fitter().fit(&points).unwrap();
        assert_eq!(fit.r_squared, 0.0);
        assert_eq!(fit.tau_sec, None);
    }

    #[test]
    fn test_alternating_noise_fits_poorly() {
        let points: Vec<(f64, f64)> = (0..=30)
            .map(|t| (t as f64, if t % 2 == 0 { 166.0 } else { 164.0 }))
            .collect();
        let fit = fitter().fit(&points).unwrap();
        assert!(fit.r_squared < 0.2, "r2 = {}", fit.r_squared);
    }

    #[test]
    fn test_rising_segment_is_not_a_decay() {
        let points: Vec<(f64, f64)> = (0..=30).map(|t| (t as f64, 110.0 + 0.4 * t as f64)).collect();
        let fit = fitter().fit(&points).unwrap();
        assert_eq!(fit.amplitude_bpm, 0.0);
        assert!(fit.r_squared.abs() < 1e-9);
        assert_eq!(fit.tau_sec, None);
    }

    #[test]
    fn test_too_few_points() {
        assert!(fitter().fit(&[(0.0, 150.0), (1.0, 149.0)]).is_none());
    }

    #[test]
    fn test_linear_decline_fits_well() {
        let points: Vec<(f64, f64)> = (0..=30).map(|t| (t as f64, 170.0 - 0.8 * t as f64)).collect();
        let fit = fitter().fit(&points).unwrap();
        assert!(fit.r_squared > 0.99);
    }
}
