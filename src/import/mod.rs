//! Loading sample streams and override tables

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::models::Sample;
use crate::overrides::OverrideWarning;

pub mod csv;

pub use self::csv::CsvImporter;

/// Input row that could not be parsed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub line: u64,
    pub reason: String,
}

/// Raw samples of one session, in file order and not yet validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSamples {
    pub session_id: String,
    pub samples: Vec<Sample>,
    /// First row of this session that failed to parse; the session is
    /// unusable but the rest of the file is not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreadable_row: Option<RowError>,
}

impl SessionSamples {
    pub fn new(session_id: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            session_id: session_id.into(),
            samples,
            unreadable_row: None,
        }
    }

    /// Fails if any of the session's rows could not be read
    pub fn check_rows(&self) -> std::result::Result<(), StreamError> {
        match &self.unreadable_row {
            Some(row) => Err(StreamError::UnreadableRow {
                session_id: self.session_id.clone(),
                line: row.line,
                reason: row.reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Date of the first sample, used for date-range selection
    pub fn start_date(&self) -> Option<NaiveDate> {
        self.samples.first().map(|s| s.timestamp.date_naive())
    }
}

/// Override records read from a file, and a warning per skipped row
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideRecords<T> {
    pub records: Vec<T>,
    pub warnings: Vec<OverrideWarning>,
}

/// Session selection by id and/or first-sample date range (inclusive)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilter {
    pub session_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl SessionFilter {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.from.is_none() && self.to.is_none()
    }

    pub fn matches(&self, session: &SessionSamples) -> bool {
        if let Some(id) = &self.session_id {
            if &session.session_id != id {
                return false;
            }
        }

        if self.from.is_none() && self.to.is_none() {
            return true;
        }

        // Empty sessions have no date; keep them so they fail visibly
        let Some(date) = session.start_date() else {
            return true;
        };
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    pub fn apply(&self, sessions: Vec<SessionSamples>) -> Vec<SessionSamples> {
        sessions.into_iter().filter(|s| self.matches(s)).collect()
    }
}

/// Parse a timestamp as RFC 3339, a common datetime layout, or epoch seconds
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%d/%m/%Y %H:%M:%S",
    ];
    for format in &formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }

    if let Ok(seconds) = value.parse::<i64>() {
        return DateTime::from_timestamp(seconds, 0);
    }

    None
}

/// Parse a `YYYY-MM-DD` date for range filters
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}
