use chrono::{Duration, TimeZone, Utc};
use hrrs::{
    digest, FlagKind, HrrConfig, QualityOverride, QualityStatus, ReanchorStatus, RevisionStage,
    Sample, SessionOverrides, SessionPipeline, SessionStream,
};

/// End-to-end recovery scenarios through the session pipeline

#[cfg(test)]
mod integration_tests {
    use super::*;

    fn stream(session_id: &str, hr: &[f64]) -> SessionStream {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let samples = hr
            .iter()
            .enumerate()
            .map(|(i, &bpm)| Sample::new(start + Duration::seconds(i as i64), bpm))
            .collect();
        SessionStream::new(session_id, samples).unwrap()
    }

    fn decay(seconds: std::ops::Range<usize>, peak: f64) -> impl Iterator<Item = f64> {
        seconds.map(move |s| 110.0 + (peak - 110.0) * (-(s as f64) / 25.0).exp())
    }

    /// 100 → 170 over 60 s, then a smooth decline towards 110 by t=150
    fn clean_recovery() -> Vec<f64> {
        let mut hr: Vec<f64> = (0..60).map(|t| 100.0 + 70.0 * t as f64 / 60.0).collect();
        hr.extend(decay(0..90, 170.0));
        hr
    }

    /// Peak at t=60 followed by 40 s hovering around 165 before decay
    fn plateau_recovery() -> Vec<f64> {
        let mut hr: Vec<f64> = (0..60).map(|t| 100.0 + 65.0 * t as f64 / 60.0).collect();
        hr.extend((60..100).map(|t| if t % 2 == 0 { 166.0 } else { 164.0 }));
        hr.extend(decay(0..140, 165.0));
        hr
    }

    /// Clean decay that turns into a climb 90 s after the peak
    fn late_rise_recovery() -> Vec<f64> {
        let mut hr: Vec<f64> = (0..60).map(|t| 100.0 + 70.0 * t as f64 / 60.0).collect();
        let decayed: Vec<f64> = decay(0..91, 170.0).collect();
        let floor = decayed[90];
        hr.extend(decayed);
        hr.extend((1..36).map(|s| floor + 0.3 * s as f64));
        hr
    }

    fn pipeline() -> SessionPipeline {
        SessionPipeline::new(HrrConfig::default())
    }

    fn no_overrides() -> SessionOverrides {
        SessionOverrides::default()
    }

    #[test]
    fn test_clean_recovery_passes() {
        let features = pipeline().process(&stream("clean", &clean_recovery()), &no_overrides());

        assert_eq!(features.intervals.len(), 1);
        let interval = &features.intervals[0];
        assert_eq!(interval.status, QualityStatus::Pass);
        assert!(interval.r2_by_window["0-30"].unwrap() > 0.9);
        assert!(interval.r2_by_window["30-60"].unwrap() > 0.9);
        assert!(!interval.flags.iter().any(FlagKind::is_warning));
        assert!(interval.rejection_reason.is_none());
        assert_eq!(interval.peak_hr_bpm, 170.0);
    }

    #[test]
    fn test_plateau_is_reanchored() {
        let features = pipeline().process(&stream("plateau", &plateau_recovery()), &no_overrides());

        assert_eq!(features.intervals.len(), 1);
        let interval = &features.intervals[0];
        assert_eq!(interval.reanchor, ReanchorStatus::Resolved);
        assert!(interval.flags.contains(&FlagKind::PlateauResolved));
        assert_eq!(interval.status, QualityStatus::Pass);

        // The detected peak stays in the audit trail
        assert_eq!(interval.peak_history.first().map(|r| r.peak.index), Some(60));
        assert_eq!(
            interval.peak_history.last().map(|r| r.stage),
            Some(RevisionStage::Reanchored)
        );
    }

    #[test]
    fn test_late_rise_is_flagged() {
        let features = pipeline().process(&stream("late", &late_rise_recovery()), &no_overrides());

        let interval = &features.intervals[0];
        assert!(interval.flags.contains(&FlagKind::LateRise));
        assert_eq!(interval.status, QualityStatus::Flagged);
        assert!(interval.rejection_reason.is_none());
    }

    #[test]
    fn test_short_recovery_is_rejected_with_duration() {
        let mut hr: Vec<f64> = (0..60).map(|t| 100.0 + 70.0 * t as f64 / 60.0).collect();
        hr.extend(decay(0..41, 170.0));

        let features = pipeline().process(&stream("short", &hr), &no_overrides());

        let interval = &features.intervals[0];
        assert_eq!(interval.status, QualityStatus::Rejected);
        assert_eq!(
            interval.rejection_reason.as_deref(),
            Some("insufficient_duration_40s")
        );
    }

    #[test]
    fn test_flat_session_has_no_intervals() {
        let hr = vec![95.0; 300];
        let features = pipeline().process(&stream("rest", &hr), &no_overrides());
        assert!(features.intervals.is_empty());
        assert!(features.warnings.is_empty());
    }

    #[test]
    fn test_repeated_runs_are_byte_identical() {
        let stream = stream("plateau", &plateau_recovery());
        let first = pipeline().process(&stream, &no_overrides());
        let second = pipeline().process(&stream, &no_overrides());

        assert_eq!(digest(&first).unwrap(), digest(&second).unwrap());
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_session_wide_override_forces_every_interval() {
        let overrides = SessionOverrides {
            peak_adjustments: Vec::new(),
            quality_overrides: vec![QualityOverride {
                session_id: "late".to_string(),
                interval_index: None,
                forced_status: QualityStatus::Pass,
                reason: "coach reviewed".to_string(),
            }],
        };

        let features = pipeline().process(&stream("late", &late_rise_recovery()), &overrides);
        let interval = &features.intervals[0];

        assert_eq!(interval.status, QualityStatus::Pass);
        assert!(interval.flags.contains(&FlagKind::HumanOverride));
        assert!(interval.rejection_reason.is_none());
        assert_eq!(interval.override_reason.as_deref(), Some("coach reviewed"));

        let computed = interval.computed_quality.as_ref().unwrap();
        assert_eq!(computed.status, QualityStatus::Flagged);
        assert!(computed.flags.contains(&FlagKind::LateRise));
    }

    #[test]
    fn test_override_for_missing_interval_is_a_warning() {
        let overrides = SessionOverrides {
            peak_adjustments: Vec::new(),
            quality_overrides: vec![QualityOverride {
                session_id: "clean".to_string(),
                interval_index: Some(4),
                forced_status: QualityStatus::Rejected,
                reason: String::new(),
            }],
        };

        let features = pipeline().process(&stream("clean", &clean_recovery()), &overrides);

        assert_eq!(features.intervals.len(), 1);
        assert_eq!(features.intervals[0].status, QualityStatus::Pass);
        assert_eq!(features.warnings.len(), 1);
    }
}
