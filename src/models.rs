use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::StreamError;
use crate::overrides::OverrideWarning;

/// Single heart-rate reading in a session stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Absolute time of the reading
    pub timestamp: DateTime<Utc>,

    /// Heart rate in beats per minute
    pub heart_rate_bpm: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, heart_rate_bpm: f64) -> Self {
        Self {
            timestamp,
            heart_rate_bpm,
        }
    }
}

/// Validated, ordered sample stream belonging to exactly one session.
///
/// Construction enforces the stream invariants (non-empty, strictly
/// increasing timestamps, finite positive heart rates); every later stage
/// can rely on them without re-checking.
#[derive(Debug, Clone)]
pub struct SessionStream {
    session_id: String,
    samples: Vec<Sample>,
    heart_rates: Vec<f64>,
    /// Seconds elapsed since the first sample
    offsets: Vec<f64>,
}

impl SessionStream {
    pub fn new(session_id: impl Into<String>, samples: Vec<Sample>) -> Result<Self, StreamError> {
        let session_id = session_id.into();

        let first = match samples.first() {
            Some(sample) => sample.timestamp,
            None => return Err(StreamError::Empty { session_id }),
        };

        for (index, sample) in samples.iter().enumerate() {
            if !sample.heart_rate_bpm.is_finite() || sample.heart_rate_bpm <= 0.0 {
                return Err(StreamError::InvalidHeartRate {
                    session_id,
                    index,
                    value: sample.heart_rate_bpm,
                });
            }
            if index > 0 && sample.timestamp <= samples[index - 1].timestamp {
                return Err(StreamError::OutOfOrder { session_id, index });
            }
        }

        let heart_rates = samples.iter().map(|s| s.heart_rate_bpm).collect();
        let offsets = samples
            .iter()
            .map(|s| (s.timestamp - first).num_milliseconds() as f64 / 1000.0)
            .collect();

        Ok(Self {
            session_id,
            samples,
            heart_rates,
            offsets,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn heart_rates(&self) -> &[f64] {
        &self.heart_rates
    }

    pub fn offsets(&self) -> &[f64] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.samples[0].timestamp
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.samples[self.samples.len() - 1].timestamp
    }

    pub fn contains_time(&self, time: DateTime<Utc>) -> bool {
        time >= self.start_time() && time <= self.end_time()
    }

    /// Seconds between two sample indices
    pub fn seconds_between(&self, from: usize, to: usize) -> f64 {
        self.offsets[to] - self.offsets[from]
    }

    /// Index of the sample closest in time to `time`, if it lies within the stream
    pub fn nearest_index(&self, time: DateTime<Utc>) -> Option<usize> {
        if !self.contains_time(time) {
            return None;
        }
        let position = self.samples.partition_point(|s| s.timestamp < time);
        if position == 0 {
            return Some(0);
        }
        if position >= self.samples.len() {
            return Some(self.samples.len() - 1);
        }
        let before = time - self.samples[position - 1].timestamp;
        let after = self.samples[position].timestamp - time;
        if before <= after {
            Some(position - 1)
        } else {
            Some(position)
        }
    }

    pub fn point(&self, index: usize) -> PeakPoint {
        PeakPoint {
            index,
            time: self.samples[index].timestamp,
            heart_rate_bpm: self.heart_rates[index],
        }
    }
}

/// Recovery window relative to an interval's anchor, in whole seconds (inclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecoveryWindow {
    pub start_sec: u32,
    pub end_sec: u32,
}

impl RecoveryWindow {
    pub const fn new(start_sec: u32, end_sec: u32) -> Self {
        Self { start_sec, end_sec }
    }

    pub fn length_sec(&self) -> u32 {
        self.end_sec.saturating_sub(self.start_sec)
    }

    pub fn contains(&self, offset_sec: f64) -> bool {
        offset_sec >= f64::from(self.start_sec) && offset_sec <= f64::from(self.end_sec)
    }

    /// Stable key used in feature output, e.g. `0-30`
    pub fn label(&self) -> String {
        format!("{}-{}", self.start_sec, self.end_sec)
    }
}

impl fmt::Display for RecoveryWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]s", self.start_sec, self.end_sec)
    }
}

/// A located sample: position in the stream, its time and heart rate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakPoint {
    pub index: usize,
    pub time: DateTime<Utc>,
    pub heart_rate_bpm: f64,
}

/// Independent estimation strategies used for peaks and for decay onset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Geometric: highest heart rate / drop from the maximum
    MaxHr,
    /// Slope/valley: end of a sustained climb / steepest decline
    Slope,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::MaxHr => write!(f, "max_hr"),
            DetectionMethod::Slope => write!(f, "slope"),
        }
    }
}

/// What the two peak detectors said about one exertion peak
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionResult {
    /// Max-HR peak, with slope agreement or no slope counterpart
    MaxHr { peak: PeakPoint },
    /// Slope peak with no max-HR counterpart
    Slope { peak: PeakPoint },
    /// Both found the peak but disagree beyond tolerance
    Conflict { max_hr: PeakPoint, slope: PeakPoint },
}

impl DetectionResult {
    /// Authoritative peak. On conflict the slope/valley method wins: max-HR
    /// detection drifts late on long declining plateaus.
    pub fn resolve(&self) -> (PeakPoint, DetectionMethod) {
        match *self {
            DetectionResult::MaxHr { peak } => (peak, DetectionMethod::MaxHr),
            DetectionResult::Slope { peak } => (peak, DetectionMethod::Slope),
            DetectionResult::Conflict { slope, .. } => (slope, DetectionMethod::Slope),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DetectionResult::Conflict { .. })
    }
}

/// Why a peak location changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionStage {
    Detected,
    BackwardShifted,
    ManualAdjusted,
    Reanchored,
}

/// One entry of a candidate's peak audit trail
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakRevision {
    pub stage: RevisionStage,
    pub peak: PeakPoint,
}

/// A detected recovery interval: peak to end of the recovery horizon.
///
/// Peak relocation never edits a candidate in place; [`CandidateInterval::relocated`]
/// returns a new value whose `history` carries every earlier location.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateInterval {
    pub session_id: String,
    pub interval_id: String,
    /// Position in detection order within the session
    pub ordinal: usize,
    pub peak: PeakPoint,
    /// Last sample index included in the interval
    pub end_index: usize,
    pub interval_end_time: DateTime<Utc>,
    /// Exclusive sample bound (next candidate's peak or stream length)
    pub boundary_index: usize,
    pub detection: DetectionResult,
    pub history: Vec<PeakRevision>,
}

impl CandidateInterval {
    pub fn new(
        stream: &SessionStream,
        ordinal: usize,
        detection: DetectionResult,
        boundary_index: usize,
        horizon_sec: f64,
    ) -> Self {
        let (peak, _) = detection.resolve();
        let boundary_index = boundary_index.clamp(peak.index + 1, stream.len());
        let end_index = Self::end_index_for(stream, peak.index, boundary_index, horizon_sec);

        Self {
            session_id: stream.session_id().to_string(),
            interval_id: format!("{}#{}", stream.session_id(), ordinal),
            ordinal,
            peak,
            end_index,
            interval_end_time: stream.samples()[end_index].timestamp,
            boundary_index,
            detection,
            history: vec![PeakRevision {
                stage: RevisionStage::Detected,
                peak,
            }],
        }
    }

    fn end_index_for(
        stream: &SessionStream,
        peak_index: usize,
        boundary_index: usize,
        horizon_sec: f64,
    ) -> usize {
        let offsets = stream.offsets();
        let limit = offsets[peak_index] + horizon_sec;
        let mut end = peak_index;
        while end + 1 < boundary_index && offsets[end + 1] <= limit {
            end += 1;
        }
        end
    }

    /// New candidate anchored at `index`, with the move recorded in its history.
    ///
    /// The interval never extends past its old boundary; an anchor at or
    /// beyond it leaves a single-sample interval.
    pub fn relocated(
        &self,
        stream: &SessionStream,
        index: usize,
        stage: RevisionStage,
        horizon_sec: f64,
    ) -> Self {
        let peak = stream.point(index);
        let boundary_index = self.boundary_index.max(index + 1).min(stream.len());
        let end_index = Self::end_index_for(stream, index, boundary_index, horizon_sec);

        let mut history = self.history.clone();
        history.push(PeakRevision { stage, peak });

        Self {
            peak,
            end_index,
            interval_end_time: stream.samples()[end_index].timestamp,
            boundary_index,
            history,
            ..self.clone()
        }
    }

    pub fn peak_time(&self) -> DateTime<Utc> {
        self.peak.time
    }

    pub fn peak_hr(&self) -> f64 {
        self.peak.heart_rate_bpm
    }

    /// Peak as first reported by the detector, before any correction
    pub fn original_peak(&self) -> PeakPoint {
        self.history.first().map(|r| r.peak).unwrap_or(self.peak)
    }

    pub fn has_stage(&self, stage: RevisionStage) -> bool {
        self.history.iter().any(|r| r.stage == stage)
    }

    pub fn duration_sec(&self, stream: &SessionStream) -> f64 {
        stream.seconds_between(self.peak.index, self.end_index)
    }

    pub fn samples<'a>(&self, stream: &'a SessionStream) -> &'a [Sample] {
        &stream.samples()[self.peak.index..=self.end_index]
    }

    /// (seconds since anchor, heart rate) pairs for the interval
    pub fn series(&self, stream: &SessionStream) -> Vec<(f64, f64)> {
        let anchor = stream.offsets()[self.peak.index];
        (self.peak.index..=self.end_index)
            .map(|i| (stream.offsets()[i] - anchor, stream.heart_rates()[i]))
            .collect()
    }
}

/// Descriptive flags attached to an interval's quality result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagKind {
    /// Heart rate climbed again in the late window; recovery interrupted
    LateRise,
    /// Onset estimators diverged beyond tolerance
    OnsetDisagreement,
    /// Peak-to-settle reserve below the configured floor
    LowSignal,
    /// Early and mid window fits disagree on decay shape
    HighR2Delta,
    PlateauResolved,
    BackwardShifted,
    /// Decay onset later than the onset-delay threshold
    OnsetAdjusted,
    ManualAdjusted,
    HumanOverride,
}

impl FlagKind {
    /// Warning flags demote a pass to flagged; the rest are informational
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            FlagKind::LateRise
                | FlagKind::OnsetDisagreement
                | FlagKind::LowSignal
                | FlagKind::HighR2Delta
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagKind::LateRise => "LATE_RISE",
            FlagKind::OnsetDisagreement => "ONSET_DISAGREEMENT",
            FlagKind::LowSignal => "LOW_SIGNAL",
            FlagKind::HighR2Delta => "HIGH_R2_DELTA",
            FlagKind::PlateauResolved => "PLATEAU_RESOLVED",
            FlagKind::BackwardShifted => "BACKWARD_SHIFTED",
            FlagKind::OnsetAdjusted => "ONSET_ADJUSTED",
            FlagKind::ManualAdjusted => "MANUAL_ADJUSTED",
            FlagKind::HumanOverride => "HUMAN_OVERRIDE",
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final classification of an interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    Pass,
    Flagged,
    Rejected,
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityStatus::Pass => write!(f, "pass"),
            QualityStatus::Flagged => write!(f, "flagged"),
            QualityStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for QualityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" | "passed" => Ok(QualityStatus::Pass),
            "flagged" | "flag" => Ok(QualityStatus::Flagged),
            "rejected" | "reject" => Ok(QualityStatus::Rejected),
            _ => Err(format!("Invalid quality status: {}", s)),
        }
    }
}

/// Status, flags and (for rejections) a debuggable reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub status: QualityStatus,
    pub flags: BTreeSet<FlagKind>,
    pub rejection_reason: Option<String>,
}

impl QualityResult {
    pub fn has_warnings(&self) -> bool {
        self.flags.iter().any(FlagKind::is_warning)
    }
}

/// How re-anchoring went for an interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReanchorStatus {
    /// Early windows fit well enough; nothing to do
    NotTriggered,
    /// Interval was re-anchored before; never repeated
    AlreadyAttempted,
    /// Triggered, but no sustained decline found in the search range
    NoOnsetFound,
    /// Re-anchored metrics replaced the originals
    Resolved,
    /// Re-anchored metrics did not clear the threshold; originals kept
    Unresolved,
}

impl fmt::Display for ReanchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReanchorStatus::NotTriggered => "not_triggered",
            ReanchorStatus::AlreadyAttempted => "already_attempted",
            ReanchorStatus::NoOnsetFound => "no_onset_found",
            ReanchorStatus::Resolved => "resolved",
            ReanchorStatus::Unresolved => "unresolved",
        };
        f.write_str(label)
    }
}

/// Finalized feature record for one interval, as handed to the persistence sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalFeatures {
    pub session_id: String,
    pub interval_id: String,
    pub interval_index: usize,
    pub peak_time: DateTime<Utc>,
    pub peak_hr_bpm: f64,
    pub interval_end_time: DateTime<Utc>,
    pub duration_sec: f64,
    pub detection_method: DetectionMethod,
    /// R² per window label; `None` when the window lacks samples
    pub r2_by_window: BTreeMap<String, Option<f64>>,
    pub tau_sec: Option<f64>,
    pub hr_reserve_bpm: Option<f64>,
    pub settle_hr_bpm: Option<f64>,
    pub onset_delay_sec: Option<f64>,
    pub onset_delay_estimates: BTreeMap<DetectionMethod, f64>,
    pub status: QualityStatus,
    pub flags: BTreeSet<FlagKind>,
    pub rejection_reason: Option<String>,
    /// Assessor's own verdict, kept when a human override replaced it
    pub computed_quality: Option<QualityResult>,
    pub override_reason: Option<String>,
    pub reanchor: ReanchorStatus,
    pub peak_history: Vec<PeakRevision>,
}

/// Complete output of the pipeline for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFeatures {
    pub session_id: String,
    pub intervals: Vec<IntervalFeatures>,
    pub warnings: Vec<OverrideWarning>,
}

impl SessionFeatures {
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            intervals: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn count_status(&self, status: QualityStatus) -> usize {
        self.intervals.iter().filter(|i| i.status == status).count()
    }
}
