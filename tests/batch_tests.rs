//! Integration tests for multi-session batch processing
//!
//! Covers failure isolation, input ordering, override routing and the
//! load-time and unknown-session warnings.

use chrono::{Duration, TimeZone, Utc};
use hrrs::config::BatchConfig;
use hrrs::{
    BatchProcessor, CsvImporter, FlagKind, OverrideWarning, Overrides, QualityOverride,
    QualityStatus, Sample, SessionPipeline, SessionSamples,
};
use std::fmt::Write as _;
use std::path::Path;

fn session(id: &str, offset_days: i64, hr: &[f64]) -> SessionSamples {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap() + Duration::days(offset_days);
    let samples = hr
        .iter()
        .enumerate()
        .map(|(i, &bpm)| Sample::new(start + Duration::seconds(i as i64), bpm))
        .collect();
    SessionSamples::new(id, samples)
}

fn recovery() -> Vec<f64> {
    let mut hr: Vec<f64> = (0..60).map(|t| 100.0 + 70.0 * t as f64 / 60.0).collect();
    hr.extend((0..90).map(|s| 110.0 + 60.0 * (-(s as f64) / 25.0).exp()));
    hr
}

fn out_of_order(id: &str) -> SessionSamples {
    let mut broken = session(id, 0, &recovery());
    broken.samples.swap(10, 11);
    broken
}

fn processor(threads: Option<usize>) -> BatchProcessor {
    BatchProcessor::with_config(
        SessionPipeline::default(),
        BatchConfig {
            num_threads: threads,
            show_progress: false,
        },
    )
}

#[test]
fn test_bad_session_does_not_abort_batch() {
    let sessions = vec![
        session("mon", 0, &recovery()),
        out_of_order("tue"),
        SessionSamples::new("wed", Vec::new()),
        session("thu", 3, &recovery()),
    ];

    let report = processor(None).process(sessions, &Overrides::default()).unwrap();

    assert_eq!(report.summary.total_sessions, 4);
    assert_eq!(report.summary.successful_sessions, 2);
    assert_eq!(report.summary.failed_sessions, 2);

    let failed: Vec<&str> = report.failures.iter().map(|f| f.session_id.as_str()).collect();
    assert_eq!(failed, vec!["tue", "wed"]);
    assert!(report.failures[0].error.contains("out of order"));

    assert!(report.sessions.iter().all(|s| s.intervals.len() == 1));
    assert_eq!(report.summary.passed, 2);
}

#[test]
fn test_unparsable_row_fails_only_its_session() {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
    let mut csv = String::from("session_id,timestamp,heart_rate_bpm\n");
    writeln!(csv, "a,{},120", start.to_rfc3339()).unwrap();
    writeln!(csv, "a,{},abc", (start + Duration::seconds(1)).to_rfc3339()).unwrap();
    for (i, bpm) in recovery().iter().enumerate() {
        let ts = start + Duration::days(1) + Duration::seconds(i as i64);
        writeln!(csv, "b,{},{:.2}", ts.to_rfc3339(), bpm).unwrap();
    }

    let sessions = CsvImporter::new()
        .read_samples(csv.as_bytes(), Path::new("x.csv"))
        .unwrap();
    let report = processor(None).process(sessions, &Overrides::default()).unwrap();

    assert_eq!(report.summary.total_sessions, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].session_id, "a");
    assert!(report.failures[0].error.contains("line 3"));
    assert!(report.failures[0].error.contains("abc"));

    assert_eq!(report.sessions.len(), 1);
    assert_eq!(report.sessions[0].session_id, "b");
    assert_eq!(report.sessions[0].intervals[0].status, QualityStatus::Pass);
}

#[test]
fn test_malformed_override_rows_become_warnings() {
    let table = "\
session_id,interval_index,forced_status,reason
a,0,rejected,strap slipped
b,0,excellent,typo
";
    let loaded = CsvImporter::new()
        .read_quality_overrides(table.as_bytes(), Path::new("quality.csv"))
        .unwrap();
    let overrides = Overrides::new(Vec::new(), loaded.records).with_warnings(loaded.warnings);
    let sessions = vec![session("a", 0, &recovery()), session("b", 1, &recovery())];

    let report = processor(None).process(sessions, &overrides).unwrap();

    assert_eq!(report.sessions[0].intervals[0].status, QualityStatus::Rejected);
    assert_eq!(report.sessions[1].intervals[0].status, QualityStatus::Pass);
    assert_eq!(report.warnings.len(), 1);
    assert!(matches!(
        &report.warnings[0],
        OverrideWarning::MalformedRecord { line: 3, session_id, .. } if session_id == "b"
    ));
    assert_eq!(report.summary.warnings, 1);
}

#[test]
fn test_results_keep_input_order_across_threads() {
    let sessions: Vec<SessionSamples> = (0..24)
        .map(|i| session(&format!("session-{:02}", i), i, &recovery()))
        .collect();
    let expected: Vec<String> = sessions.iter().map(|s| s.session_id.clone()).collect();

    let report = processor(Some(4)).process(sessions, &Overrides::default()).unwrap();

    let actual: Vec<String> = report.sessions.iter().map(|s| s.session_id.clone()).collect();
    assert_eq!(actual, expected);
    assert!(report.summary.is_fully_successful());
}

#[test]
fn test_overrides_reach_their_session_only() {
    let overrides = Overrides::new(
        Vec::new(),
        vec![QualityOverride {
            session_id: "b".to_string(),
            interval_index: Some(0),
            forced_status: QualityStatus::Rejected,
            reason: "strap slipped".to_string(),
        }],
    );
    let sessions = vec![session("a", 0, &recovery()), session("b", 1, &recovery())];

    let report = processor(None).process(sessions, &overrides).unwrap();

    let a = &report.sessions[0].intervals[0];
    let b = &report.sessions[1].intervals[0];
    assert_eq!(a.status, QualityStatus::Pass);
    assert!(!a.flags.contains(&FlagKind::HumanOverride));
    assert_eq!(b.status, QualityStatus::Rejected);
    assert_eq!(b.rejection_reason.as_deref(), Some("human_override: strap slipped"));
    assert_eq!(report.summary.rejected, 1);
}

#[test]
fn test_override_for_unknown_session_is_reported() {
    let overrides = Overrides::new(
        Vec::new(),
        vec![QualityOverride {
            session_id: "ghost".to_string(),
            interval_index: None,
            forced_status: QualityStatus::Pass,
            reason: String::new(),
        }],
    );

    let report = processor(None)
        .process(vec![session("a", 0, &recovery())], &overrides)
        .unwrap();

    assert_eq!(
        report.warnings,
        vec![OverrideWarning::UnknownSession {
            session_id: "ghost".to_string()
        }]
    );
    assert_eq!(report.summary.warnings, 1);
    assert_eq!(report.sessions[0].intervals[0].status, QualityStatus::Pass);
}

#[test]
fn test_empty_batch() {
    let report = processor(None).process(Vec::new(), &Overrides::default()).unwrap();
    assert!(report.sessions.is_empty());
    assert_eq!(report.summary.total_sessions, 0);
    assert_eq!(report.summary.throughput_sessions_per_sec(), 0.0);
}
