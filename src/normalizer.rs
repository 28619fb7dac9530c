// Record Normalizer - flattens heterogeneous CRM rows into uniform
// text + metadata records for the sensitivity scanner.

use serde::{Deserialize, Serialize};

use crate::error::CrmError;
use crate::model::RawRecord;

/// Concatenation order: primary description first, then secondary notes,
/// then linked-activity text. Anything else follows in stable name order.
const FIELD_PRIORITY: [&str; 4] = ["description", "summary", "notes", "next_step"];

/// A CRM record flattened for scanning. Ephemeral, built per scan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub source_type: String,
    pub source_id: i64,
    pub text: String,
    pub owner: Option<String>,
    pub last_modified: Option<String>,
}

fn field_rank(name: &str) -> usize {
    FIELD_PRIORITY
        .iter()
        .position(|candidate| *candidate == name)
        .unwrap_or(FIELD_PRIORITY.len())
}

/// Flatten one raw CRM row into a `ScanRecord`.
///
/// Fails with `MissingSource` when the row carries no non-empty text field;
/// the caller should skip the record, not abort the scan.
pub fn normalize_record(record: &RawRecord) -> Result<ScanRecord, CrmError> {
    let mut fields: Vec<(&str, &str)> = record
        .fields
        .iter()
        .map(|(name, value)| (name.as_str(), value.trim()))
        .filter(|(_, value)| !value.is_empty())
        .collect();

    if fields.is_empty() {
        return Err(CrmError::MissingSource {
            source_type: record.source_type.clone(),
            source_id: record.id,
        });
    }

    fields.sort_by(|a, b| field_rank(a.0).cmp(&field_rank(b.0)).then(a.0.cmp(b.0)));

    let text = fields
        .iter()
        .map(|(_, value)| *value)
        .collect::<Vec<_>>()
        .join("\n");

    Ok(ScanRecord {
        source_type: record.source_type.clone(),
        source_id: record.id,
        text,
        owner: record.owner.clone(),
        last_modified: record.last_modified.clone(),
    })
}
