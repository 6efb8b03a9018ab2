//! Externally supplied corrections
//!
//! Two record kinds come back from the persistence side: manual peak
//! adjustments, applied to detected candidates before any metric is
//! computed, and quality overrides, merged into the assessor's verdict as the
//! very last step. Records that cannot be applied become [`OverrideWarning`]s;
//! they never fail a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::models::{
    CandidateInterval, FlagKind, QualityResult, QualityStatus, RevisionStage, SessionStream,
};

/// Manual relocation of a detected peak
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakAdjustment {
    pub session_id: String,
    pub original_peak_time: DateTime<Utc>,
    pub corrected_peak_time: DateTime<Utc>,
}

/// Manual status for one interval, or for every interval of a session when
/// `interval_index` is `None`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityOverride {
    pub session_id: String,
    pub interval_index: Option<usize>,
    pub forced_status: QualityStatus,
    pub reason: String,
}

/// Override record that could not be applied
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverrideWarning {
    #[error("Session {session_id}: no detected peak near {original_peak_time} to adjust")]
    UnmatchedPeakAdjustment {
        session_id: String,
        original_peak_time: DateTime<Utc>,
    },

    #[error("Session {session_id}: corrected peak {corrected_peak_time} is outside the sample stream")]
    CorrectedPeakOutOfRange {
        session_id: String,
        corrected_peak_time: DateTime<Utc>,
    },

    #[error("Session {session_id}: corrected peak {corrected_peak_time} crosses a neighbouring interval's peak")]
    CorrectedPeakCrossesInterval {
        session_id: String,
        corrected_peak_time: DateTime<Utc>,
    },

    #[error("Session {session_id}: quality override targets interval {interval_index}, but only {interval_count} detected")]
    IntervalOutOfRange {
        session_id: String,
        interval_index: usize,
        interval_count: usize,
    },

    #[error("Session {session_id}: quality override given but no intervals detected")]
    NoIntervals { session_id: String },

    #[error("Override references unknown session {session_id}")]
    UnknownSession { session_id: String },

    #[error("{file} line {line}: skipped override record ({reason})")]
    MalformedRecord {
        file: String,
        line: u64,
        session_id: String,
        reason: String,
    },
}

/// Override records for a single session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOverrides {
    pub peak_adjustments: Vec<PeakAdjustment>,
    pub quality_overrides: Vec<QualityOverride>,
}

impl SessionOverrides {
    pub fn is_empty(&self) -> bool {
        self.peak_adjustments.is_empty() && self.quality_overrides.is_empty()
    }

    /// Override applying to the interval at `index`. An interval-specific
    /// record beats a session-wide one; among equals the last record wins.
    pub fn quality_for(&self, index: usize) -> Option<&QualityOverride> {
        let specific = self
            .quality_overrides
            .iter()
            .rev()
            .find(|o| o.interval_index == Some(index));
        specific.or_else(|| {
            self.quality_overrides
                .iter()
                .rev()
                .find(|o| o.interval_index.is_none())
        })
    }

    /// Warnings for quality overrides that match no detected interval
    pub fn check_quality_targets(&self, session_id: &str, interval_count: usize) -> Vec<OverrideWarning> {
        let mut warnings = Vec::new();
        for record in &self.quality_overrides {
            match record.interval_index {
                Some(index) if index >= interval_count => {
                    warnings.push(OverrideWarning::IntervalOutOfRange {
                        session_id: session_id.to_string(),
                        interval_index: index,
                        interval_count,
                    });
                }
                None if interval_count == 0 => {
                    warnings.push(OverrideWarning::NoIntervals {
                        session_id: session_id.to_string(),
                    });
                }
                _ => {}
            }
        }
        warnings
    }
}

/// All override records of a run, grouped by session
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    sessions: BTreeMap<String, SessionOverrides>,
    /// Problems found while loading the records, e.g. malformed rows
    load_warnings: Vec<OverrideWarning>,
}

impl Overrides {
    pub fn new(peak_adjustments: Vec<PeakAdjustment>, quality_overrides: Vec<QualityOverride>) -> Self {
        let mut sessions: BTreeMap<String, SessionOverrides> = BTreeMap::new();
        for record in peak_adjustments {
            sessions
                .entry(record.session_id.clone())
                .or_default()
                .peak_adjustments
                .push(record);
        }
        for record in quality_overrides {
            sessions
                .entry(record.session_id.clone())
                .or_default()
                .quality_overrides
                .push(record);
        }
        Self {
            sessions,
            load_warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: impl IntoIterator<Item = OverrideWarning>) -> Self {
        self.load_warnings.extend(warnings);
        self
    }

    pub fn load_warnings(&self) -> &[OverrideWarning] {
        &self.load_warnings
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, session_id: &str) -> Option<&SessionOverrides> {
        self.sessions.get(session_id)
    }

    /// One warning per overridden session that is not among `known`
    pub fn unknown_sessions<'a>(&self, known: impl IntoIterator<Item = &'a str>) -> Vec<OverrideWarning> {
        let known: BTreeSet<&str> = known.into_iter().collect();
        self.sessions
            .keys()
            .filter(|id| !known.contains(id.as_str()))
            .map(|id| OverrideWarning::UnknownSession {
                session_id: id.clone(),
            })
            .collect()
    }
}

fn seconds_apart(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a - b).num_milliseconds().abs() as f64 / 1000.0
}

/// Move matching candidates to their manually corrected peaks.
///
/// A record matches the candidate whose detected (or current) peak lies
/// within `tolerance_sec` of `original_peak_time`; the nearest one wins.
/// The corrected peak has to stay between the previous candidate's peak and
/// the next one's, otherwise the record is skipped with a warning.
pub fn apply_peak_adjustments(
    stream: &SessionStream,
    mut candidates: Vec<CandidateInterval>,
    adjustments: &[PeakAdjustment],
    tolerance_sec: f64,
    horizon_sec: f64,
) -> (Vec<CandidateInterval>, Vec<OverrideWarning>) {
    let mut warnings = Vec::new();

    for adjustment in adjustments {
        let Some(corrected_index) = stream.nearest_index(adjustment.corrected_peak_time) else {
            warnings.push(OverrideWarning::CorrectedPeakOutOfRange {
                session_id: adjustment.session_id.clone(),
                corrected_peak_time: adjustment.corrected_peak_time,
            });
            continue;
        };

        let matched = candidates
            .iter()
            .enumerate()
            .map(|(position, candidate)| {
                let distance = seconds_apart(candidate.original_peak().time, adjustment.original_peak_time)
                    .min(seconds_apart(candidate.peak_time(), adjustment.original_peak_time));
                (position, distance)
            })
            .filter(|(_, distance)| *distance <= tolerance_sec)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match matched {
            Some((position, _)) if !within_neighbours(&candidates, position, corrected_index) => {
                warnings.push(OverrideWarning::CorrectedPeakCrossesInterval {
                    session_id: adjustment.session_id.clone(),
                    corrected_peak_time: adjustment.corrected_peak_time,
                });
            }
            Some((position, _)) => {
                tracing::debug!(
                    "{}: peak manually moved to {}",
                    candidates[position].interval_id,
                    adjustment.corrected_peak_time
                );
                candidates[position] = candidates[position].relocated(
                    stream,
                    corrected_index,
                    RevisionStage::ManualAdjusted,
                    horizon_sec,
                );
            }
            None => warnings.push(OverrideWarning::UnmatchedPeakAdjustment {
                session_id: adjustment.session_id.clone(),
                original_peak_time: adjustment.original_peak_time,
            }),
        }
    }

    (candidates, warnings)
}

fn within_neighbours(candidates: &[CandidateInterval], position: usize, index: usize) -> bool {
    let after_previous = position == 0 || candidates[position - 1].peak.index < index;
    after_previous && index < candidates[position].boundary_index
}

/// Final quality of an interval after any human override
#[derive(Debug, Clone, PartialEq)]
pub struct FinalQuality {
    pub status: QualityStatus,
    pub flags: BTreeSet<FlagKind>,
    pub rejection_reason: Option<String>,
    /// The assessor's verdict, present only when an override replaced it
    pub computed: Option<QualityResult>,
    pub override_reason: Option<String>,
}

/// Merge a computed verdict with an optional override.
///
/// The forced status replaces the computed one and `HUMAN_OVERRIDE` is added;
/// the computed result is kept for audit. A rejection reason is present
/// exactly when the final status is rejected.
pub fn finalize(computed: QualityResult, quality_override: Option<&QualityOverride>) -> FinalQuality {
    let Some(record) = quality_override else {
        return FinalQuality {
            status: computed.status,
            flags: computed.flags,
            rejection_reason: computed.rejection_reason,
            computed: None,
            override_reason: None,
        };
    };

    let mut flags = computed.flags.clone();
    flags.insert(FlagKind::HumanOverride);

    let rejection_reason = match record.forced_status {
        QualityStatus::Rejected => computed
            .rejection_reason
            .clone()
            .or_else(|| Some(format!("human_override: {}", record.reason))),
        _ => None,
    };

    FinalQuality {
        status: record.forced_status,
        flags,
        rejection_reason,
        computed: Some(computed),
        override_reason: Some(record.reason.clone()),
    }
}
