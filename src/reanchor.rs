//! Plateau re-anchoring
//!
//! When the early windows fit poorly the interval usually starts on a plateau:
//! heart rate held near the peak for a while before it began to fall. The
//! anchor is moved forward to the first sustained decline and metrics are
//! recomputed, once.

use tracing::debug;

use crate::config::{HrrConfig, TriggerMode};
use crate::metrics::{IntervalMetrics, MetricsEngine};
use crate::models::{CandidateInterval, RecoveryWindow, ReanchorStatus, RevisionStage, SessionStream};
use crate::signal::smoothed_slopes;

/// Result of a re-anchoring attempt
#[derive(Debug, Clone)]
pub struct ReanchorOutcome {
    pub status: ReanchorStatus,

    /// Re-anchored interval and its metrics; only set when resolved
    pub replacement: Option<(CandidateInterval, IntervalMetrics)>,
}

impl ReanchorOutcome {
    fn unchanged(status: ReanchorStatus) -> Self {
        Self {
            status,
            replacement: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reanchorer<'a> {
    config: &'a HrrConfig,
}

impl<'a> Reanchorer<'a> {
    pub fn new(config: &'a HrrConfig) -> Self {
        Self { config }
    }

    /// Trigger windows whose R² is present and below the pass threshold
    pub fn failing_windows(&self, metrics: &IntervalMetrics) -> Vec<RecoveryWindow> {
        let threshold = self.config.quality.r2_pass_threshold;
        self.config
            .reanchor
            .trigger_windows
            .iter()
            .filter(|window| metrics.r2(window).is_some_and(|r2| r2 < threshold))
            .copied()
            .collect()
    }

    pub fn is_triggered(&self, metrics: &IntervalMetrics) -> bool {
        let failing = self.failing_windows(metrics);
        match self.config.reanchor.trigger_mode {
            TriggerMode::Any => !failing.is_empty(),
            TriggerMode::All => {
                !failing.is_empty() && failing.len() == self.config.reanchor.trigger_windows.len()
            }
        }
    }

    /// First sample after the anchor that starts a run of at least
    /// `min_negative_run_sec` with smoothed slope below `-negative_slope_bpm_per_sec`.
    /// The run must start within `max_shift_sec` of the anchor.
    pub fn find_onset(&self, stream: &SessionStream, candidate: &CandidateInterval) -> Option<usize> {
        let settings = &self.config.reanchor;
        let offsets = stream.offsets();
        let slopes = smoothed_slopes(
            offsets,
            stream.heart_rates(),
            self.config.detection.slope_window_samples,
        );

        let anchor_time = offsets[candidate.peak.index];
        let mut run_start: Option<usize> = None;

        for k in candidate.peak.index + 1..stream.len() {
            if slopes[k] < -settings.negative_slope_bpm_per_sec {
                let start = *run_start.get_or_insert(k);
                if offsets[k] - offsets[start] >= settings.min_negative_run_sec {
                    return Some(start);
                }
            } else {
                run_start = None;
            }

            if run_start.is_none() && offsets[k] - anchor_time >= settings.max_shift_sec {
                break;
            }
        }

        None
    }

    /// Attempt re-anchoring once; never repeats on an interval that was
    /// already re-anchored.
    pub fn attempt(
        &self,
        stream: &SessionStream,
        candidate: &CandidateInterval,
        metrics: &IntervalMetrics,
        engine: &MetricsEngine<'_>,
    ) -> ReanchorOutcome {
        if !self.config.reanchor.enabled || !self.is_triggered(metrics) {
            return ReanchorOutcome::unchanged(ReanchorStatus::NotTriggered);
        }
        if candidate.has_stage(RevisionStage::Reanchored) {
            return ReanchorOutcome::unchanged(ReanchorStatus::AlreadyAttempted);
        }

        let Some(onset) = self.find_onset(stream, candidate) else {
            debug!("{}: early windows fail but no sustained decline found", candidate.interval_id);
            return ReanchorOutcome::unchanged(ReanchorStatus::NoOnsetFound);
        };

        let moved = candidate.relocated(
            stream,
            onset,
            RevisionStage::Reanchored,
            self.config.detection.recovery_horizon_sec,
        );
        let shift = stream.seconds_between(candidate.peak.index, onset);

        if moved.duration_sec(stream) < self.config.quality.min_duration_sec {
            debug!(
                "{}: re-anchoring by {:.0}s leaves too short an interval",
                candidate.interval_id, shift
            );
            return ReanchorOutcome::unchanged(ReanchorStatus::Unresolved);
        }

        let threshold = self.config.quality.r2_pass_threshold;
        let new_metrics = engine.compute(stream, &moved);
        let resolved = self
            .failing_windows(metrics)
            .iter()
            .all(|window| new_metrics.r2(window).is_some_and(|r2| r2 >= threshold));

        if resolved {
            debug!("{}: plateau resolved, anchor moved {:.0}s", candidate.interval_id, shift);
            ReanchorOutcome {
                status: ReanchorStatus::Resolved,
                replacement: Some((moved, new_metrics)),
            }
        } else {
            debug!("{}: re-anchored fit still fails, keeping original", candidate.interval_id);
            ReanchorOutcome::unchanged(ReanchorStatus::Unresolved)
        }
    }
}
