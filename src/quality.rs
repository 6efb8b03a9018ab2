use std::collections::BTreeSet;

use crate::config::QualityConfig;
use crate::metrics::IntervalMetrics;
use crate::models::{
    CandidateInterval, DetectionMethod, FlagKind, QualityResult, QualityStatus, ReanchorStatus,
    RevisionStage,
};

/// Maps an interval's metrics and history to a status and flag set.
///
/// Rejection is decided first (too short, or no usable R² window). Otherwise
/// any warning flag demotes the interval to flagged. Informational flags
/// never change the status. Flags are computed for rejected intervals too.
#[derive(Debug, Clone, Copy)]
pub struct QualityAssessor<'a> {
    config: &'a QualityConfig,
}

impl<'a> QualityAssessor<'a> {
    pub fn new(config: &'a QualityConfig) -> Self {
        Self { config }
    }

    pub fn assess(
        &self,
        candidate: &CandidateInterval,
        metrics: &IntervalMetrics,
        reanchor: ReanchorStatus,
    ) -> QualityResult {
        let mut flags = self.warning_flags(metrics);

        if reanchor == ReanchorStatus::Resolved {
            flags.insert(FlagKind::PlateauResolved);
        }
        if candidate.has_stage(RevisionStage::BackwardShifted) {
            flags.insert(FlagKind::BackwardShifted);
        }
        if candidate.has_stage(RevisionStage::ManualAdjusted) {
            flags.insert(FlagKind::ManualAdjusted);
        }
        if metrics
            .onset_delay_sec
            .is_some_and(|delay| delay > self.config.onset_delay_flag_sec)
        {
            flags.insert(FlagKind::OnsetAdjusted);
        }

        let duration = metrics.duration_sec.max(0.0).floor() as u64;
        let rejection_reason = if metrics.duration_sec < self.config.min_duration_sec {
            Some(format!("insufficient_duration_{}s", duration))
        } else if !metrics.has_valid_r2() {
            Some(format!("no_valid_r2_windows_{}s", duration))
        } else {
            None
        };

        let status = if rejection_reason.is_some() {
            QualityStatus::Rejected
        } else if flags.iter().any(FlagKind::is_warning) {
            QualityStatus::Flagged
        } else {
            QualityStatus::Pass
        };

        QualityResult {
            status,
            flags,
            rejection_reason,
        }
    }

    fn warning_flags(&self, metrics: &IntervalMetrics) -> BTreeSet<FlagKind> {
        let mut flags = BTreeSet::new();

        if metrics
            .late_slope_bpm_per_sec
            .is_some_and(|slope| slope > self.config.late_rise_slope_bpm_per_sec)
        {
            flags.insert(FlagKind::LateRise);
        }

        let estimates = &metrics.onset_delay_estimates;
        if let (Some(by_max), Some(by_slope)) = (
            estimates.get(&DetectionMethod::MaxHr),
            estimates.get(&DetectionMethod::Slope),
        ) {
            if (by_max - by_slope).abs() > self.config.onset_disagreement_sec {
                flags.insert(FlagKind::OnsetDisagreement);
            }
        }

        // No reserve at all is as weak a signal as a small one
        if metrics
            .hr_reserve_bpm
            .map_or(true, |reserve| reserve < self.config.hr_reserve_floor_bpm)
        {
            flags.insert(FlagKind::LowSignal);
        }

        let [early, mid] = &self.config.r2_delta_windows;
        if let (Some(a), Some(b)) = (metrics.r2(early), metrics.r2(mid)) {
            if (a - b).abs() > self.config.max_r2_delta {
                flags.insert(FlagKind::HighR2Delta);
            }
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectionResult, RecoveryWindow, Sample, SessionStream};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn stream() -> SessionStream {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let samples = (0..200)
            .map(|i| Sample::new(start + Duration::seconds(i), 170.0 - i as f64 * 0.2))
            .collect();
        SessionStream::new("s1", samples).unwrap()
    }

    fn candidate(stream: &SessionStream) -> CandidateInterval {
        let detection = DetectionResult::MaxHr {
            peak: stream.point(0),
        };
        CandidateInterval::new(stream, 0, detection, stream.len(), 120.0)
    }

    fn good_metrics() -> IntervalMetrics {
        let mut r2_by_window = BTreeMap::new();
        r2_by_window.insert(RecoveryWindow::new(0, 30), Some(0.95));
        r2_by_window.insert(RecoveryWindow::new(30, 60), Some(0.93));
        r2_by_window.insert(RecoveryWindow::new(90, 120), None);

        let mut onset_delay_estimates = BTreeMap::new();
        onset_delay_estimates.insert(DetectionMethod::MaxHr, 3.0);
        onset_delay_estimates.insert(DetectionMethod::Slope, 1.0);

        IntervalMetrics {
            r2_by_window,
            tau_sec: Some(25.0),
            settle_hr_bpm: Some(112.0),
            hr_reserve_bpm: Some(58.0),
            onset_delay_estimates,
            onset_delay_sec: Some(3.0),
            late_slope_bpm_per_sec: None,
            duration_sec: 120.0,
        }
    }

    fn assess(metrics: &IntervalMetrics, reanchor: ReanchorStatus) -> QualityResult {
        let s = stream();
        let config = QualityConfig::default();
        QualityAssessor::new(&config).assess(&candidate(&s), metrics, reanchor)
    }

    #[test]
    fn test_clean_interval_passes() {
        let result = assess(&good_metrics(), ReanchorStatus::NotTriggered);
        assert_eq!(result.status, QualityStatus::Pass);
        assert!(result.flags.is_empty());
        assert_eq!(result.rejection_reason, None);
    }

    #[test]
    fn test_short_interval_rejected_with_duration() {
        let metrics = IntervalMetrics {
            duration_sec: 45.7,
            ..good_metrics()
        };
        let result = assess(&metrics, ReanchorStatus::NotTriggered);
        assert_eq!(result.status, QualityStatus::Rejected);
        assert_eq!(result.rejection_reason.as_deref(), Some("insufficient_duration_45s"));
    }

    #[test]
    fn test_no_valid_windows_rejected() {
        let mut metrics = good_metrics();
        for r2 in metrics.r2_by_window.values_mut() {
            *r2 = None;
        }
        let result = assess(&metrics, ReanchorStatus::NotTriggered);
        assert_eq!(result.status, QualityStatus::Rejected);
        assert_eq!(result.rejection_reason.as_deref(), Some("no_valid_r2_windows_120s"));
    }

    #[test]
    fn test_warning_flags_demote_to_flagged() {
        let metrics = IntervalMetrics {
            late_slope_bpm_per_sec: Some(0.3),
            ..good_metrics()
        };
        let result = assess(&metrics, ReanchorStatus::NotTriggered);
        assert_eq!(result.status, QualityStatus::Flagged);
        assert!(result.flags.contains(&FlagKind::LateRise));

        let mut metrics = good_metrics();
        metrics.onset_delay_estimates.insert(DetectionMethod::Slope, 20.0);
        metrics.hr_reserve_bpm = Some(6.0);
        metrics.r2_by_window.insert(RecoveryWindow::new(30, 60), Some(0.4));
        let result = assess(&metrics, ReanchorStatus::NotTriggered);
        assert_eq!(result.status, QualityStatus::Flagged);
        assert!(result.flags.contains(&FlagKind::OnsetDisagreement));
        assert!(result.flags.contains(&FlagKind::LowSignal));
        assert!(result.flags.contains(&FlagKind::HighR2Delta));
    }

    #[test]
    fn test_informational_flags_keep_pass() {
        let metrics = IntervalMetrics {
            onset_delay_sec: Some(18.0),
            ..good_metrics()
        };
        let mut onsets = metrics.onset_delay_estimates.clone();
        onsets.insert(DetectionMethod::MaxHr, 18.0);
        onsets.insert(DetectionMethod::Slope, 12.0);
        let metrics = IntervalMetrics {
            onset_delay_estimates: onsets,
            ..metrics
        };

        let result = assess(&metrics, ReanchorStatus::Resolved);
        assert_eq!(result.status, QualityStatus::Pass);
        assert!(result.flags.contains(&FlagKind::PlateauResolved));
        assert!(result.flags.contains(&FlagKind::OnsetAdjusted));
        assert!(!result.has_warnings());
    }

    #[test]
    fn test_rejected_interval_keeps_warnings() {
        let metrics = IntervalMetrics {
            duration_sec: 30.0,
            hr_reserve_bpm: Some(4.0),
            ..good_metrics()
        };
        let result = assess(&metrics, ReanchorStatus::NotTriggered);
        assert_eq!(result.status, QualityStatus::Rejected);
        assert!(result.flags.contains(&FlagKind::LowSignal));
    }

    #[test]
    fn test_history_flags() {
        let s = stream();
        let moved = candidate(&s)
            .relocated(&s, 5, RevisionStage::BackwardShifted, 120.0)
            .relocated(&s, 3, RevisionStage::ManualAdjusted, 120.0);
        let config = QualityConfig::default();
        let result = QualityAssessor::new(&config).assess(&moved, &good_metrics(), ReanchorStatus::NotTriggered);

        assert!(result.flags.contains(&FlagKind::BackwardShifted));
        assert!(result.flags.contains(&FlagKind::ManualAdjusted));
        assert_eq!(result.status, QualityStatus::Pass);
    }
}
