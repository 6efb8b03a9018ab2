use sha2::{Digest, Sha256};

use crate::error::ExportError;
use crate::models::SessionFeatures;

/// Pretty JSON array of session feature sets.
///
/// Maps are `BTreeMap`s and structs serialize in declaration order, so equal
/// inputs always produce byte-identical output.
pub fn to_json(sessions: &[SessionFeatures]) -> Result<String, ExportError> {
    Ok(serde_json::to_string_pretty(sessions)?)
}

/// SHA-256 (hex) of a session's canonical JSON
pub fn digest(features: &SessionFeatures) -> Result<String, ExportError> {
    let canonical = serde_json::to_vec(features)?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}
