//! Exertion peak detection
//!
//! Two independent detectors look at the same stream:
//!
//! - **max-HR**: local maxima of the raw heart rate that dominate their
//!   neighbourhood and rise far enough above the surrounding troughs;
//! - **slope/valley**: sustained climbs in the smoothed slope, reported at the
//!   highest sample of the climb.
//!
//! Their findings are paired into [`DetectionResult`]s, peaks sitting at the
//! tail of a flat plateau are pulled back to where the plateau began, and each
//! surviving peak becomes a [`CandidateInterval`].

use tracing::debug;

use crate::config::DetectionConfig;
use crate::models::{
    CandidateInterval, DetectionResult, PeakPoint, RevisionStage, SessionStream,
};
use crate::signal::{slope_between, smoothed_slopes};

/// Peak/valley detector for one configuration
#[derive(Debug, Clone, Copy)]
pub struct PeakDetector<'a> {
    config: &'a DetectionConfig,
}

impl<'a> PeakDetector<'a> {
    pub fn new(config: &'a DetectionConfig) -> Self {
        Self { config }
    }

    /// Enumerate candidate recovery intervals in detection order.
    ///
    /// A stream without a sufficiently prominent peak yields no candidates.
    pub fn detect(&self, stream: &SessionStream) -> Vec<CandidateInterval> {
        let slopes = smoothed_slopes(
            stream.offsets(),
            stream.heart_rates(),
            self.config.slope_window_samples,
        );

        let max_peaks = self.max_hr_peaks(stream);
        let slope_peaks = self.slope_peaks(stream, &slopes);
        let detections = self.pair(stream, &max_peaks, &slope_peaks);

        debug!(
            "Session {}: {} max-HR peaks, {} slope peaks, {} detections",
            stream.session_id(),
            max_peaks.len(),
            slope_peaks.len(),
            detections.len()
        );

        let anchors: Vec<usize> = detections
            .iter()
            .map(|detection| {
                let index = detection.resolve().0.index;
                self.backward_target(stream, index).unwrap_or(index)
            })
            .collect();

        let horizon = self.config.recovery_horizon_sec;
        detections
            .iter()
            .enumerate()
            .map(|(ordinal, detection)| {
                let boundary = anchors.get(ordinal + 1).copied().unwrap_or(stream.len());
                let candidate =
                    CandidateInterval::new(stream, ordinal, *detection, boundary, horizon);

                let anchor = anchors[ordinal];
                if anchor == candidate.peak.index {
                    return candidate;
                }

                debug!(
                    "{}: peak moved back {:.0}s to plateau start",
                    candidate.interval_id,
                    stream.seconds_between(anchor, candidate.peak.index)
                );
                candidate.relocated(stream, anchor, RevisionStage::BackwardShifted, horizon)
            })
            .collect()
    }

    /// Local maxima that dominate `peak_separation_sec` on both sides and
    /// clear the prominence floor. Flat tops report their middle sample.
    pub fn max_hr_peaks(&self, stream: &SessionStream) -> Vec<PeakPoint> {
        let hr = stream.heart_rates();
        let offsets = stream.offsets();
        let n = hr.len();
        let separation = self.config.peak_separation_sec;

        let mut peaks = Vec::new();
        let mut first = 0;
        while first < n {
            let value = hr[first];
            let mut last = first;
            while last + 1 < n && hr[last + 1] == value {
                last += 1;
            }

            let left_from = offsets[first] - separation;
            let right_to = offsets[last] + separation;

            // Earlier equal values claim the peak; later ones may tie
            let dominates_left = (0..first)
                .rev()
                .take_while(|&k| offsets[k] >= left_from)
                .all(|k| hr[k] < value);
            let dominates_right = (last + 1..n)
                .take_while(|&k| offsets[k] <= right_to)
                .all(|k| hr[k] <= value);

            if dominates_left
                && dominates_right
                && self.prominence(stream, first, last) >= self.config.min_peak_prominence_bpm
            {
                peaks.push(stream.point((first + last) / 2));
            }

            first = last + 1;
        }

        peaks
    }

    /// Highest sample of every climb whose smoothed slope stays above
    /// `rise_slope_min_bpm_per_sec` and which gains at least the prominence
    /// floor over the valley since the previous accepted climb.
    pub fn slope_peaks(&self, stream: &SessionStream, slopes: &[f64]) -> Vec<PeakPoint> {
        let hr = stream.heart_rates();
        let n = hr.len().min(slopes.len());
        let threshold = self.config.rise_slope_min_bpm_per_sec;

        let mut peaks = Vec::new();
        let mut valley_from = 0;
        let mut i = 0;
        while i < n {
            if slopes[i] <= threshold {
                i += 1;
                continue;
            }

            let rise_end = (i + 1..n).find(|&k| slopes[k] < threshold).unwrap_or(n - 1);
            let peak = first_extreme(hr, i, rise_end, |a, b| a > b);
            let valley = first_extreme(hr, valley_from, peak, |a, b| a < b);

            if hr[peak] - hr[valley] >= self.config.min_peak_prominence_bpm {
                peaks.push(stream.point(peak));
                valley_from = rise_end;
            }

            i = rise_end + 1;
        }

        peaks
    }

    /// Pair max-HR peaks with their nearest slope peak and resolve each pair.
    fn pair(
        &self,
        stream: &SessionStream,
        max_peaks: &[PeakPoint],
        slope_peaks: &[PeakPoint],
    ) -> Vec<DetectionResult> {
        let offsets = stream.offsets();
        let mut paired = vec![false; slope_peaks.len()];
        let mut detections = Vec::with_capacity(max_peaks.len());

        for max_peak in max_peaks {
            let nearest = slope_peaks
                .iter()
                .enumerate()
                .filter(|(k, _)| !paired[*k])
                .map(|(k, p)| (k, (offsets[p.index] - offsets[max_peak.index]).abs()))
                .filter(|(_, distance)| *distance <= self.config.peak_separation_sec)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            let detection = match nearest {
                Some((k, distance)) => {
                    paired[k] = true;
                    if distance > self.config.method_disagreement_sec {
                        DetectionResult::Conflict {
                            max_hr: *max_peak,
                            slope: slope_peaks[k],
                        }
                    } else {
                        DetectionResult::MaxHr { peak: *max_peak }
                    }
                }
                None => DetectionResult::MaxHr { peak: *max_peak },
            };
            detections.push(detection);
        }

        for (k, slope_peak) in slope_peaks.iter().enumerate() {
            if !paired[k]
                && self.prominence(stream, slope_peak.index, slope_peak.index)
                    >= self.config.min_peak_prominence_bpm
            {
                detections.push(DetectionResult::Slope { peak: *slope_peak });
            }
        }

        detections.sort_by_key(|d| d.resolve().0.index);

        let mut kept: Vec<DetectionResult> = Vec::with_capacity(detections.len());
        for detection in detections {
            let index = detection.resolve().0.index;
            let too_close = kept.last().is_some_and(|previous| {
                offsets[index] - offsets[previous.resolve().0.index]
                    < self.config.peak_separation_sec
            });
            if !too_close {
                kept.push(detection);
            }
        }

        kept
    }

    /// Where a peak at `index` should move if it ends a flat plateau.
    ///
    /// Returns `None` when the lead-in is not flat or nothing earlier is at
    /// least as high. The result always lies within `backward_lookback_sec`
    /// before `index`.
    pub fn backward_target(&self, stream: &SessionStream, index: usize) -> Option<usize> {
        let hr = stream.heart_rates();
        let offsets = stream.offsets();
        let peak_time = offsets[index];

        let lead_in = slope_between(
            offsets,
            hr,
            peak_time - self.config.lead_in_window_sec,
            peak_time,
        )?;
        if lead_in.abs() > self.config.plateau_slope_max_bpm_per_sec {
            return None;
        }

        let floor = hr[index] - self.config.plateau_tolerance_bpm;
        let mut best = index;
        for k in (0..index).rev() {
            if peak_time - offsets[k] > self.config.backward_lookback_sec || hr[k] < floor {
                break;
            }
            if hr[k] >= hr[best] {
                best = k;
            }
        }

        (best != index).then_some(best)
    }

    /// Height of the top spanning `first..=last` above the higher of the
    /// troughs on either side. A top at the stream end has no right trough
    /// and so no prominence.
    fn prominence(&self, stream: &SessionStream, first: usize, last: usize) -> f64 {
        let hr = stream.heart_rates();
        let offsets = stream.offsets();
        let value = hr[first];

        let left_from = offsets[first] - self.config.prominence_lookback_sec;
        let left_min = (0..first)
            .rev()
            .take_while(|&k| offsets[k] >= left_from)
            .map(|k| hr[k])
            .fold(value, f64::min);

        let right_to = offsets[last] + self.config.recovery_horizon_sec;
        let right_min = (last + 1..hr.len())
            .take_while(|&k| offsets[k] <= right_to)
            .map(|k| hr[k])
            .fold(value, f64::min);

        value - left_min.max(right_min)
    }
}

/// First index in `from..=to` that wins every `better` comparison
fn first_extreme(values: &[f64], from: usize, to: usize, better: impl Fn(f64, f64) -> bool) -> usize {
    let mut best = from;
    for k in from..=to {
        if better(values[k], values[best]) {
            best = k;
        }
    }
    best
}
