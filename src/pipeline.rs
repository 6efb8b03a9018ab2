//! Per-session orchestration
//!
//! detect → manual peak adjustment → metrics → re-anchoring → quality →
//! quality override, for every candidate of one session. The pipeline holds
//! only the configuration; each call owns its stream and candidates, so one
//! pipeline can serve many worker threads.

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn};

use crate::config::HrrConfig;
use crate::detector::PeakDetector;
use crate::error::Result;
use crate::metrics::{IntervalMetrics, MetricsEngine};
use crate::models::{
    CandidateInterval, IntervalFeatures, QualityStatus, ReanchorStatus, Sample, SessionFeatures,
    SessionStream,
};
use crate::overrides::{apply_peak_adjustments, finalize, FinalQuality, SessionOverrides};
use crate::quality::QualityAssessor;
use crate::reanchor::Reanchorer;

#[derive(Debug, Clone, Default)]
pub struct SessionPipeline {
    config: HrrConfig,
}

impl SessionPipeline {
    pub fn new(config: HrrConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HrrConfig {
        &self.config
    }

    /// Validate raw samples into a stream, then process it
    pub fn process_samples(
        &self,
        session_id: &str,
        samples: Vec<Sample>,
        overrides: &SessionOverrides,
    ) -> Result<SessionFeatures> {
        let stream = SessionStream::new(session_id, samples)?;
        Ok(self.process(&stream, overrides))
    }

    /// Compute the feature set of one session.
    ///
    /// A session without a detectable peak yields an empty feature set.
    /// Override records that cannot be applied are returned as warnings.
    pub fn process(&self, stream: &SessionStream, overrides: &SessionOverrides) -> SessionFeatures {
        let span = info_span!("session", session_id = stream.session_id());
        let _guard = span.enter();

        let config = &self.config;
        let candidates = PeakDetector::new(&config.detection).detect(stream);

        let (candidates, mut warnings) = apply_peak_adjustments(
            stream,
            candidates,
            &overrides.peak_adjustments,
            config.quality.manual_peak_match_tolerance_sec,
            config.detection.recovery_horizon_sec,
        );
        warnings.extend(overrides.check_quality_targets(stream.session_id(), candidates.len()));

        let engine = MetricsEngine::new(config);
        let reanchorer = Reanchorer::new(config);
        let assessor = QualityAssessor::new(&config.quality);

        let intervals: Vec<IntervalFeatures> = candidates
            .into_iter()
            .enumerate()
            .map(|(index, candidate)| {
                let metrics = engine.compute(stream, &candidate);
                let outcome = reanchorer.attempt(stream, &candidate, &metrics, &engine);
                let (candidate, metrics) = outcome.replacement.unwrap_or((candidate, metrics));

                let computed = assessor.assess(&candidate, &metrics, outcome.status);
                let quality = finalize(computed, overrides.quality_for(index));

                debug!(
                    "{}: {} ({} flags, reanchor {})",
                    candidate.interval_id,
                    quality.status,
                    quality.flags.len(),
                    outcome.status
                );

                build_features(index, candidate, &metrics, quality, outcome.status)
            })
            .collect();

        for warning in &warnings {
            warn!("{}", warning);
        }

        let features = SessionFeatures {
            session_id: stream.session_id().to_string(),
            intervals,
            warnings,
        };

        info!(
            "Session {}: {} intervals ({} pass, {} flagged, {} rejected)",
            features.session_id,
            features.intervals.len(),
            features.count_status(QualityStatus::Pass),
            features.count_status(QualityStatus::Flagged),
            features.count_status(QualityStatus::Rejected)
        );

        features
    }
}

fn build_features(
    index: usize,
    candidate: CandidateInterval,
    metrics: &IntervalMetrics,
    quality: FinalQuality,
    reanchor: ReanchorStatus,
) -> IntervalFeatures {
    let detection_method = candidate.detection.resolve().1;
    let peak_time: DateTime<Utc> = candidate.peak_time();

    IntervalFeatures {
        session_id: candidate.session_id,
        interval_id: candidate.interval_id,
        interval_index: index,
        peak_time,
        peak_hr_bpm: candidate.peak.heart_rate_bpm,
        interval_end_time: candidate.interval_end_time,
        duration_sec: metrics.duration_sec,
        detection_method,
        r2_by_window: metrics.r2_by_label(),
        tau_sec: metrics.tau_sec,
        hr_reserve_bpm: metrics.hr_reserve_bpm,
        settle_hr_bpm: metrics.settle_hr_bpm,
        onset_delay_sec: metrics.onset_delay_sec,
        onset_delay_estimates: metrics.onset_delay_estimates.clone(),
        status: quality.status,
        flags: quality.flags,
        rejection_reason: quality.rejection_reason,
        computed_quality: quality.computed,
        override_reason: quality.override_reason,
        reanchor,
        peak_history: candidate.history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlagKind;
    use crate::overrides::QualityOverride;
    use chrono::{Duration, TimeZone};

    fn samples(hr: &[f64]) -> Vec<Sample> {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        hr.iter()
            .enumerate()
            .map(|(i, &bpm)| Sample::new(start + Duration::seconds(i as i64), bpm))
            .collect()
    }

    fn clean_recovery() -> Vec<f64> {
        let mut hr: Vec<f64> = (0..60).map(|t| 100.0 + 70.0 * t as f64 / 60.0).collect();
        hr.extend((0..90).map(|s| 110.0 + 60.0 * (-(s as f64) / 25.0).exp()));
        hr
    }

    #[test]
    fn test_clean_session() {
        let pipeline = SessionPipeline::default();
        let features = pipeline
            .process_samples("s1", samples(&clean_recovery()), &SessionOverrides::default())
            .unwrap();

        assert_eq!(features.intervals.len(), 1);
        let interval = &features.intervals[0];
        assert_eq!(interval.status, QualityStatus::Pass);
        assert_eq!(interval.interval_id, "s1#0");
        assert_eq!(interval.reanchor, ReanchorStatus::NotTriggered);
        assert!(interval.r2_by_window["0-30"].unwrap() > 0.9);
        assert!(features.warnings.is_empty());
    }

    #[test]
    fn test_invalid_stream_is_an_error() {
        let pipeline = SessionPipeline::default();
        let result = pipeline.process_samples("s1", Vec::new(), &SessionOverrides::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_quality_override_applies() {
        let pipeline = SessionPipeline::default();
        let overrides = SessionOverrides {
            peak_adjustments: Vec::new(),
            quality_overrides: vec![QualityOverride {
                session_id: "s1".to_string(),
                interval_index: Some(0),
                forced_status: QualityStatus::Rejected,
                reason: "artifact".to_string(),
            }],
        };

        let features = pipeline
            .process_samples("s1", samples(&clean_recovery()), &overrides)
            .unwrap();
        let interval = &features.intervals[0];
        assert_eq!(interval.status, QualityStatus::Rejected);
        assert!(interval.flags.contains(&FlagKind::HumanOverride));
        assert_eq!(interval.rejection_reason.as_deref(), Some("human_override: artifact"));
        assert_eq!(
            interval.computed_quality.as_ref().map(|q| q.status),
            Some(QualityStatus::Pass)
        );
    }
}
