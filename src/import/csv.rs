use csv::{ReaderBuilder, StringRecord};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{parse_timestamp, OverrideRecords, RowError, SessionSamples};
use crate::error::{ImportError, Result};
use crate::models::{QualityStatus, Sample};
use crate::overrides::{OverrideWarning, PeakAdjustment, QualityOverride};

/// CSV importer with flexible column naming
pub struct CsvImporter {
    column_mapping: HashMap<String, String>,
}

impl CsvImporter {
    pub fn new() -> Self {
        let mut column_mapping = HashMap::new();

        Self::add_mapping(&mut column_mapping, "session_id", &["session_id", "session", "sessionid"]);
        Self::add_mapping(
            &mut column_mapping,
            "timestamp",
            &["timestamp", "time", "datetime", "date_time"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "heart_rate_bpm",
            &["heart_rate_bpm", "heart_rate", "heartrate", "hr", "bpm"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "original_peak_time",
            &["original_peak_time", "original_peak", "detected_peak_time"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "corrected_peak_time",
            &["corrected_peak_time", "corrected_peak", "peak_time"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "interval_index",
            &["interval_index", "interval", "interval_number"],
        );
        Self::add_mapping(
            &mut column_mapping,
            "forced_status",
            &["forced_status", "status", "override_status"],
        );
        Self::add_mapping(&mut column_mapping, "reason", &["reason", "note", "notes"]);

        Self { column_mapping }
    }

    fn add_mapping(mapping: &mut HashMap<String, String>, standard: &str, variations: &[&str]) {
        for variation in variations {
            mapping.insert(variation.to_lowercase(), standard.to_string());
        }
    }

    fn normalize_column_name(&self, name: &str) -> String {
        let normalized = name.trim().to_lowercase().replace([' ', '-'], "_");

        self.column_mapping
            .get(&normalized)
            .cloned()
            .unwrap_or(normalized)
    }

    /// Samples CSV (`session_id,timestamp,heart_rate_bpm`), grouped per
    /// session in order of first appearance. Row order within a session is
    /// preserved; ordering is validated later, per session.
    ///
    /// A row that cannot be parsed marks its own session as unreadable and
    /// leaves every other session intact.
    pub fn import_samples(&self, path: &Path) -> Result<Vec<SessionSamples>> {
        let sessions = self.read_samples(open(path)?, path)?;
        info!(
            "Loaded {} sessions ({} samples) from {}",
            sessions.len(),
            sessions.iter().map(|s| s.samples.len()).sum::<usize>(),
            path.display()
        );
        Ok(sessions)
    }

    pub fn read_samples<R: Read>(&self, reader: R, source: &Path) -> Result<Vec<SessionSamples>> {
        let table = Table::new(self, reader, source)?;
        let session_col = table.require("session_id")?;
        let time_col = table.require("timestamp")?;
        let hr_col = table.require("heart_rate_bpm")?;

        let mut sessions: Vec<SessionSamples> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (line, record) in &table.rows {
            let session_id = field(record, session_col);
            let timestamp_text = field(record, time_col);
            let hr_text = field(record, hr_col);

            if session_id.is_empty() && timestamp_text.is_empty() && hr_text.is_empty() {
                continue;
            }

            let position = *positions.entry(session_id.to_string()).or_insert_with(|| {
                sessions.push(SessionSamples::new(session_id, Vec::new()));
                sessions.len() - 1
            });
            let session = &mut sessions[position];
            if session.unreadable_row.is_some() {
                continue;
            }

            let parsed = parse_timestamp(timestamp_text)
                .ok_or_else(|| format!("invalid timestamp '{}'", timestamp_text))
                .and_then(|timestamp| {
                    hr_text
                        .parse::<f64>()
                        .map(|bpm| Sample::new(timestamp, bpm))
                        .map_err(|_| format!("invalid heart rate '{}'", hr_text))
                });

            match parsed {
                Ok(sample) => session.samples.push(sample),
                Err(reason) => {
                    warn!("{} line {}: session {} unreadable: {}", source.display(), line, session_id, reason);
                    session.unreadable_row = Some(RowError { line: *line, reason });
                }
            }
        }

        debug!("Parsed {} sessions from {}", sessions.len(), source.display());
        Ok(sessions)
    }

    /// Peak adjustments CSV (`session_id,original_peak_time,corrected_peak_time`)
    pub fn import_peak_adjustments(&self, path: &Path) -> Result<OverrideRecords<PeakAdjustment>> {
        self.read_peak_adjustments(open(path)?, path)
    }

    pub fn read_peak_adjustments<R: Read>(
        &self,
        reader: R,
        source: &Path,
    ) -> Result<OverrideRecords<PeakAdjustment>> {
        let table = Table::new(self, reader, source)?;
        let session_col = table.require("session_id")?;
        let original_col = table.require("original_peak_time")?;
        let corrected_col = table.require("corrected_peak_time")?;

        let mut loaded = OverrideRecords {
            records: Vec::new(),
            warnings: Vec::new(),
        };
        for (line, record) in &table.rows {
            let session_id = field(record, session_col);
            let time_at = |col: usize| {
                let text = field(record, col);
                parse_timestamp(text).ok_or_else(|| format!("invalid timestamp '{}'", text))
            };

            let parsed = time_at(original_col)
                .and_then(|original| time_at(corrected_col).map(|corrected| (original, corrected)));
            match parsed {
                Ok((original_peak_time, corrected_peak_time)) => loaded.records.push(PeakAdjustment {
                    session_id: session_id.to_string(),
                    original_peak_time,
                    corrected_peak_time,
                }),
                Err(reason) => loaded.warnings.push(malformed(source, *line, session_id, reason)),
            }
        }

        info!(
            "Loaded {} peak adjustments from {} ({} skipped)",
            loaded.records.len(),
            source.display(),
            loaded.warnings.len()
        );
        Ok(loaded)
    }

    /// Quality overrides CSV (`session_id,interval_index,forced_status,reason`);
    /// an empty `interval_index` applies to every interval of the session.
    pub fn import_quality_overrides(&self, path: &Path) -> Result<OverrideRecords<QualityOverride>> {
        self.read_quality_overrides(open(path)?, path)
    }

    pub fn read_quality_overrides<R: Read>(
        &self,
        reader: R,
        source: &Path,
    ) -> Result<OverrideRecords<QualityOverride>> {
        let table = Table::new(self, reader, source)?;
        let session_col = table.require("session_id")?;
        let status_col = table.require("forced_status")?;
        let index_col = table.column("interval_index");
        let reason_col = table.column("reason");

        let mut loaded = OverrideRecords {
            records: Vec::new(),
            warnings: Vec::new(),
        };
        for (line, record) in &table.rows {
            let session_id = field(record, session_col);

            let interval_index = match index_col.map(|col| field(record, col)) {
                None | Some("") => Ok(None),
                Some(text) => text
                    .parse::<usize>()
                    .map(Some)
                    .map_err(|_| format!("invalid interval index '{}'", text)),
            };
            let parsed = interval_index.and_then(|index| {
                field(record, status_col)
                    .parse::<QualityStatus>()
                    .map(|status| (index, status))
            });

            match parsed {
                Ok((interval_index, forced_status)) => loaded.records.push(QualityOverride {
                    session_id: session_id.to_string(),
                    interval_index,
                    forced_status,
                    reason: reason_col
                        .map(|col| field(record, col).to_string())
                        .unwrap_or_default(),
                }),
                Err(reason) => loaded.warnings.push(malformed(source, *line, session_id, reason)),
            }
        }

        info!(
            "Loaded {} quality overrides from {} ({} skipped)",
            loaded.records.len(),
            source.display(),
            loaded.warnings.len()
        );
        Ok(loaded)
    }
}

impl Default for CsvImporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Header-mapped CSV contents with the line number of every record
struct Table {
    source: PathBuf,
    columns: HashMap<String, usize>,
    rows: Vec<(u64, StringRecord)>,
}

impl Table {
    fn new<R: Read>(importer: &CsvImporter, reader: R, source: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let columns = reader
            .headers()
            .map_err(ImportError::from)?
            .iter()
            .enumerate()
            .map(|(i, header)| (importer.normalize_column_name(header), i))
            .collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result.map_err(ImportError::from)?;
            let line = record.position().map_or(0, |p| p.line());
            rows.push((line, record));
        }

        Ok(Self {
            source: source.to_path_buf(),
            columns,
            rows,
        })
    }

    fn column(&self, name: &str) -> Option<usize> {
        self.columns.get(name).copied()
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.column(name).ok_or_else(|| {
            ImportError::MissingColumn {
                column: name.to_string(),
                path: self.source.clone(),
            }
            .into()
        })
    }
}

fn open(path: &Path) -> Result<File> {
    if !path.exists() {
        return Err(ImportError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    Ok(File::open(path)?)
}

fn field(record: &StringRecord, column: usize) -> &str {
    record.get(column).unwrap_or("")
}

fn malformed(source: &Path, line: u64, session_id: &str, reason: String) -> OverrideWarning {
    let warning = OverrideWarning::MalformedRecord {
        file: source.display().to_string(),
        line,
        session_id: session_id.to_string(),
        reason,
    };
    warn!("{}", warning);
    warning
}
