use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::models::SessionFeatures;

pub mod csv;
pub mod json;
pub mod text;

pub use json::digest;

/// Output format for feature sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Table,
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" | "text" => Ok(ExportFormat::Table),
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(format!("Unsupported format: {}", s)),
        }
    }
}

/// Render feature sets in the requested format
pub fn render(sessions: &[SessionFeatures], format: ExportFormat) -> Result<String> {
    let rendered = match format {
        ExportFormat::Table => text::render_table(sessions),
        ExportFormat::Json => json::to_json(sessions)?,
        ExportFormat::Csv => csv::to_csv(sessions)?,
    };
    Ok(rendered)
}

/// Write rendered output to `path`, creating parent directories
pub fn write_output(content: &str, path: &Path) -> Result<()> {
    let failed = |e: std::io::Error| ExportError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(failed)?;
        }
    }
    fs::write(path, content).map_err(failed)?;

    tracing::info!("Wrote {} bytes to {}", content.len(), path.display());
    Ok(())
}
