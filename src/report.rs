// Findings export - CSV output for compliance review handoff.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::scanner::Finding;

const FINDINGS_HEADER: [&str; 6] = [
    "source_type",
    "source_id",
    "detector",
    "severity",
    "confidence",
    "snippet",
];

/// Write findings in their scan order (severity first, confidence second).
pub fn write_findings_csv<W: Write>(writer: W, findings: &[Finding]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(FINDINGS_HEADER)?;
    for finding in findings {
        wtr.write_record([
            finding.source_type.as_str(),
            &finding.source_id.to_string(),
            finding.detector.as_str(),
            finding.severity.as_str(),
            &format!("{:.2}", finding.confidence),
            finding.snippet.as_str(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_findings_file(path: &Path, findings: &[Finding]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create report at {}", path.display()))?;
    write_findings_csv(file, findings)
}
