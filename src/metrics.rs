use statrs::statistics::{Data, Median};
use std::collections::BTreeMap;

use crate::config::HrrConfig;
use crate::decay::DecayFitter;
use crate::models::{CandidateInterval, DetectionMethod, RecoveryWindow, SessionStream};
use crate::signal::{linear_slope, smoothed_slopes};

/// Numeric features of one candidate interval
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalMetrics {
    /// R² per configured window; `None` when the window has too few samples
    pub r2_by_window: BTreeMap<RecoveryWindow, Option<f64>>,

    /// Decay time constant fitted over the whole interval
    pub tau_sec: Option<f64>,

    /// Median heart rate over the interval's trailing settle window
    pub settle_hr_bpm: Option<f64>,

    /// Peak heart rate minus settle heart rate
    pub hr_reserve_bpm: Option<f64>,

    /// Onset delay by estimator
    pub onset_delay_estimates: BTreeMap<DetectionMethod, f64>,

    /// Reported onset delay: the max-HR estimate, else the slope estimate
    pub onset_delay_sec: Option<f64>,

    /// Least-squares slope over the late-rise window
    pub late_slope_bpm_per_sec: Option<f64>,

    pub duration_sec: f64,
}

impl IntervalMetrics {
    pub fn r2(&self, window: &RecoveryWindow) -> Option<f64> {
        self.r2_by_window.get(window).copied().flatten()
    }

    /// True when at least one window produced an R² value
    pub fn has_valid_r2(&self) -> bool {
        self.r2_by_window.values().any(Option::is_some)
    }

    /// R² keyed by window label, as exported
    pub fn r2_by_label(&self) -> BTreeMap<String, Option<f64>> {
        self.r2_by_window
            .iter()
            .map(|(window, r2)| (window.label(), *r2))
            .collect()
    }
}

/// Computes [`IntervalMetrics`] for candidate intervals
#[derive(Debug, Clone, Copy)]
pub struct MetricsEngine<'a> {
    config: &'a HrrConfig,
    fitter: DecayFitter,
}

impl<'a> MetricsEngine<'a> {
    pub fn new(config: &'a HrrConfig) -> Self {
        Self {
            config,
            fitter: DecayFitter::from_config(&config.metrics),
        }
    }

    pub fn compute(&self, stream: &SessionStream, candidate: &CandidateInterval) -> IntervalMetrics {
        let series = candidate.series(stream);
        let metrics = &self.config.metrics;

        let r2_by_window = metrics
            .r2_windows
            .iter()
            .map(|window| (*window, self.window_r2(&series, window)))
            .collect();

        let tau_sec = self.fitter.fit(&series).and_then(|fit| fit.tau_sec);

        let duration_sec = candidate.duration_sec(stream);
        let settle_hr_bpm = settle_heart_rate(&series, metrics.settle_window_sec);
        let hr_reserve_bpm = settle_hr_bpm.map(|settle| candidate.peak_hr() - settle);

        let mut onset_delay_estimates = BTreeMap::new();
        if let Some(onset) = hr_reserve_bpm.and_then(|reserve| {
            drop_onset(&series, candidate.peak_hr(), reserve, metrics.onset_drop_fraction)
        }) {
            onset_delay_estimates.insert(DetectionMethod::MaxHr, onset);
        }
        if let Some(onset) = steepest_descent(&series, self.config.detection.slope_window_samples) {
            onset_delay_estimates.insert(DetectionMethod::Slope, onset);
        }
        let onset_delay_sec = onset_delay_estimates
            .get(&DetectionMethod::MaxHr)
            .or_else(|| onset_delay_estimates.get(&DetectionMethod::Slope))
            .copied();

        let late_window = self.config.quality.late_rise_window;
        let late_points = window_points(&series, &late_window);
        let late_slope_bpm_per_sec = if late_points.len() >= metrics.min_samples_for(&late_window) {
            linear_slope(&late_points)
        } else {
            None
        };

        IntervalMetrics {
            r2_by_window,
            tau_sec,
            settle_hr_bpm,
            hr_reserve_bpm,
            onset_delay_estimates,
            onset_delay_sec,
            late_slope_bpm_per_sec,
            duration_sec,
        }
    }

    fn window_r2(&self, series: &[(f64, f64)], window: &RecoveryWindow) -> Option<f64> {
        let points = window_points(series, window);
        if points.len() < self.config.metrics.min_samples_for(window) {
            return None;
        }
        self.fitter.fit(&points).map(|fit| fit.r_squared)
    }
}

fn window_points(series: &[(f64, f64)], window: &RecoveryWindow) -> Vec<(f64, f64)> {
    series
        .iter()
        .copied()
        .filter(|(t, _)| window.contains(*t))
        .collect()
}

/// Median of the samples in the trailing `window_sec`; `None` for a bare peak
fn settle_heart_rate(series: &[(f64, f64)], window_sec: f64) -> Option<f64> {
    if series.len() < 2 {
        return None;
    }
    let end = series[series.len() - 1].0;
    let tail: Vec<f64> = series
        .iter()
        .filter(|(t, _)| *t >= end - window_sec)
        .map(|(_, hr)| *hr)
        .collect();
    Some(Data::new(tail).median())
}

/// Offset at which heart rate first falls `fraction` of the reserve below the peak
fn drop_onset(series: &[(f64, f64)], peak_hr: f64, reserve: f64, fraction: f64) -> Option<f64> {
    if reserve <= 0.0 {
        return None;
    }
    let threshold = peak_hr - fraction * reserve;
    series
        .iter()
        .find(|(_, hr)| *hr <= threshold)
        .map(|(t, _)| *t)
}

/// Offset of the most negative smoothed slope within the interval
fn steepest_descent(series: &[(f64, f64)], window: usize) -> Option<f64> {
    let offsets: Vec<f64> = series.iter().map(|p| p.0).collect();
    let values: Vec<f64> = series.iter().map(|p| p.1).collect();
    let slopes = smoothed_slopes(&offsets, &values, window);

    let mut steepest: Option<(f64, f64)> = None;
    for (t, slope) in offsets.iter().zip(&slopes) {
        if *slope < 0.0 && steepest.map_or(true, |(_, s)| *slope < s) {
            steepest = Some((*t, *slope));
        }
    }
    steepest.map(|(t, _)| t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectionResult, Sample};
    use chrono::{Duration, TimeZone, Utc};

    fn stream_with_step(hr: &[f64], step_sec: i64) -> SessionStream {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let samples = hr
            .iter()
            .enumerate()
            .map(|(i, &bpm)| Sample::new(start + Duration::seconds(i as i64 * step_sec), bpm))
            .collect();
        SessionStream::new("s1", samples).unwrap()
    }

    fn candidate_at(stream: &SessionStream, index: usize) -> CandidateInterval {
        let detection = DetectionResult::MaxHr {
            peak: stream.point(index),
        };
        CandidateInterval::new(stream, 0, detection, stream.len(), 120.0)
    }

    fn clean_recovery() -> Vec<f64> {
        let mut hr: Vec<f64> = (0..60).map(|t| 100.0 + 70.0 * t as f64 / 60.0).collect();
        hr.extend((0..130).map(|s| 110.0 + 60.0 * (-(s as f64) / 25.0).exp()));
        hr
    }

    #[test]
    fn test_clean_recovery_metrics() {
        let stream = stream_with_step(&clean_recovery(), 1);
        let candidate = candidate_at(&stream, 60);
        let config = HrrConfig::default();
        let metrics = MetricsEngine::new(&config).compute(&stream, &candidate);

        assert_eq!(metrics.duration_sec, 120.0);
        for label in [(0, 30), (30, 60), (15, 45), (0, 60), (90, 120)] {
            let r2 = metrics.r2(&RecoveryWindow::new(label.0, label.1)).unwrap();
            assert!(r2 > 0.99, "window {:?} r2 {}", label, r2);
        }

        let tau = metrics.tau_sec.unwrap();
        assert!((tau - 25.0).abs() < 1.0);

        let reserve = metrics.hr_reserve_bpm.unwrap();
        assert!(reserve > 55.0 && reserve < 60.0);

        assert_eq!(metrics.onset_delay_estimates[&DetectionMethod::MaxHr], 3.0);
        assert_eq!(metrics.onset_delay_estimates[&DetectionMethod::Slope], 0.0);
        assert_eq!(metrics.onset_delay_sec, Some(3.0));

        let late = metrics.late_slope_bpm_per_sec.unwrap();
        assert!(late < 0.0);
    }

    #[test]
    fn test_missing_windows_are_absent_not_zero() {
        // Stream ends 45s after the peak
        let hr: Vec<f64> = clean_recovery().into_iter().take(106).collect();
        let stream = stream_with_step(&hr, 1);
        let candidate = candidate_at(&stream, 60);
        let config = HrrConfig::default();
        let metrics = MetricsEngine::new(&config).compute(&stream, &candidate);

        assert!(metrics.r2(&RecoveryWindow::new(0, 30)).is_some());
        assert_eq!(metrics.r2_by_window[&RecoveryWindow::new(30, 60)], None);
        assert_eq!(metrics.r2_by_window[&RecoveryWindow::new(90, 120)], None);
        assert_eq!(metrics.late_slope_bpm_per_sec, None);
        assert!(metrics.has_valid_r2());
    }

    #[test]
    fn test_sparse_stream_has_no_valid_windows() {
        // One sample every 3s leaves every window under coverage
        let hr: Vec<f64> = (0..60)
            .map(|i| {
                let t = i as f64 * 3.0;
                if t <= 60.0 {
                    100.0 + 70.0 * t / 60.0
                } else {
                    110.0 + 60.0 * (-(t - 60.0) / 25.0).exp()
                }
            })
            .collect();
        let stream = stream_with_step(&hr, 3);
        let candidate = candidate_at(&stream, 20);
        let config = HrrConfig::default();
        let metrics = MetricsEngine::new(&config).compute(&stream, &candidate);

        assert!(!metrics.has_valid_r2());
        assert!(metrics.r2_by_label().values().all(Option::is_none));
        assert!(metrics.tau_sec.is_some());
    }

    #[test]
    fn test_settle_uses_trailing_median() {
        let series: Vec<(f64, f64)> = (0..=60).map(|t| (t as f64, if t < 40 { 150.0 } else { 120.0 })).collect();
        assert_eq!(settle_heart_rate(&series, 20.0), Some(120.0));
        assert_eq!(settle_heart_rate(&series[..1], 20.0), None);
    }

    #[test]
    fn test_drop_onset_needs_positive_reserve() {
        let series = vec![(0.0, 150.0), (1.0, 150.0)];
        assert_eq!(drop_onset(&series, 150.0, 0.0, 0.1), None);
    }
}
