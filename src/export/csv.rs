use csv::Writer;
use std::collections::BTreeSet;

use crate::error::ExportError;
use crate::models::{DetectionMethod, IntervalFeatures, SessionFeatures};

const FIXED_COLUMNS: [&str; 17] = [
    "session_id",
    "interval_id",
    "interval_index",
    "peak_time",
    "peak_hr_bpm",
    "interval_end_time",
    "duration_sec",
    "detection_method",
    "status",
    "flags",
    "rejection_reason",
    "tau_sec",
    "hr_reserve_bpm",
    "settle_hr_bpm",
    "onset_delay_sec",
    "onset_max_hr_sec",
    "onset_slope_sec",
];

fn optional(value: Option<f64>) -> String {
    value.map_or_else(String::new, |v| format!("{:.4}", v))
}

/// One row per interval, one `r2_<window>` column per window seen in the input
pub fn to_csv(sessions: &[SessionFeatures]) -> Result<String, ExportError> {
    let windows: BTreeSet<&str> = sessions
        .iter()
        .flat_map(|s| s.intervals.iter())
        .flat_map(|i| i.r2_by_window.keys().map(String::as_str))
        .collect();

    let mut writer = Writer::from_writer(Vec::new());

    let mut header: Vec<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(windows.iter().map(|w| format!("r2_{}", w)));
    header.push("reanchor".to_string());
    writer.write_record(&header)?;

    for interval in sessions.iter().flat_map(|s| s.intervals.iter()) {
        writer.write_record(row(interval, &windows))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Csv(csv::Error::from(e.into_error())))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn row(interval: &IntervalFeatures, windows: &BTreeSet<&str>) -> Vec<String> {
    let flags: Vec<&str> = interval.flags.iter().map(|f| f.as_str()).collect();
    let onset = |method| interval.onset_delay_estimates.get(&method).copied();

    let mut record = vec![
        interval.session_id.clone(),
        interval.interval_id.clone(),
        interval.interval_index.to_string(),
        interval.peak_time.to_rfc3339(),
        format!("{:.1}", interval.peak_hr_bpm),
        interval.interval_end_time.to_rfc3339(),
        format!("{:.1}", interval.duration_sec),
        interval.detection_method.to_string(),
        interval.status.to_string(),
        flags.join(";"),
        interval.rejection_reason.clone().unwrap_or_default(),
        optional(interval.tau_sec),
        optional(interval.hr_reserve_bpm),
        optional(interval.settle_hr_bpm),
        optional(interval.onset_delay_sec),
        optional(onset(DetectionMethod::MaxHr)),
        optional(onset(DetectionMethod::Slope)),
    ];
    record.extend(
        windows
            .iter()
            .map(|w| optional(interval.r2_by_window.get(*w).copied().flatten())),
    );
    record.push(interval.reanchor.to_string());
    record
}
