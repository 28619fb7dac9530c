// Sensitivity Scanner - heuristic detection of HIPAA-relevant content
// in free-text CRM fields. Pure function of input records + static rule
// tables; findings are derived data and never persisted.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CrmError;
use crate::model::RawRecord;
use crate::normalizer::{normalize_record, ScanRecord};

/// Hits from different families whose spans sit within this many characters
/// of each other count as co-located for the escalation rule.
const ADJACENCY_WINDOW: usize = 40;

/// Distinct medical terms needed before keyword density alone is Medium.
const DENSITY_MEDIUM_THRESHOLD: usize = 3;

// ============================================================================
// SEVERITY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// One tier up, saturating at Critical.
    pub fn escalate(&self) -> Severity {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High => Severity::Critical,
            Severity::Critical => Severity::Critical,
        }
    }
}

// ============================================================================
// DETECTORS
// ============================================================================

/// Independent detector families. Agreement between two families on the
/// same span (or adjacent context) escalates severity one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Detector {
    Ssn,
    DateOfBirth,
    MedicalRecordNumber,
    InsuranceIdentifier,
    ClinicalBillingCode,
    MedicalContext,
}

impl Detector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Detector::Ssn => "SSN",
            Detector::DateOfBirth => "Date of Birth",
            Detector::MedicalRecordNumber => "Medical Record Number",
            Detector::InsuranceIdentifier => "Insurance Identifier",
            Detector::ClinicalBillingCode => "Clinical Billing Code",
            Detector::MedicalContext => "Medical Context",
        }
    }

    /// Structural identifiers start High/Critical; contextual hits Low/Medium.
    fn base_severity(&self) -> Severity {
        match self {
            Detector::Ssn => Severity::Critical,
            Detector::DateOfBirth => Severity::High,
            Detector::MedicalRecordNumber => Severity::High,
            Detector::InsuranceIdentifier => Severity::High,
            Detector::ClinicalBillingCode => Severity::Medium,
            Detector::MedicalContext => Severity::Low,
        }
    }

    fn base_confidence(&self) -> f64 {
        match self {
            Detector::Ssn => 0.99,
            Detector::DateOfBirth => 0.92,
            Detector::MedicalRecordNumber => 0.94,
            Detector::InsuranceIdentifier => 0.90,
            Detector::ClinicalBillingCode => 0.82,
            Detector::MedicalContext => 0.74,
        }
    }
}

// ============================================================================
// FINDING
// ============================================================================

/// One detected instance of potentially sensitive content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub source_type: String,
    pub source_id: i64,
    pub detector: Detector,
    pub severity: Severity,
    /// 0.0 - 1.0, detector certainty that the match is a true positive.
    pub confidence: f64,
    /// Matched text, masked to first/last two characters.
    pub matched_text: String,
    /// Surrounding context excerpt.
    pub snippet: String,
}

/// Scan output: ranked findings plus the records that could not be scanned.
/// One bad record never aborts the batch.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub findings: Vec<Finding>,
    pub skipped: Vec<CrmError>,
}

#[derive(Debug, Clone)]
struct Hit {
    detector: Detector,
    start: usize,
    end: usize,
    matched: String,
    severity: Severity,
    confidence: f64,
}

// ============================================================================
// RULE SET
// ============================================================================

/// Immutable rule tables compiled once at startup and passed into the
/// scanner by reference. No ambient mutable state.
pub struct RuleSet {
    ssn: Regex,
    dob: Regex,
    mrn: Regex,
    insurance: Regex,
    coding: Regex,
    email: Regex,
    phone: Regex,
    address: Regex,
    medical_terms: Regex,
}

impl RuleSet {
    /// The built-in rule tables, compiled on first use.
    pub fn builtin() -> &'static RuleSet {
        static RULES: OnceLock<RuleSet> = OnceLock::new();
        RULES.get_or_init(RuleSet::compile)
    }

    #[allow(clippy::expect_used)]
    fn compile() -> RuleSet {
        // Longest first so compound terms win over their prefixes.
        let mut terms: Vec<String> = MEDICAL_TERMS.iter().map(|t| regex::escape(t)).collect();
        terms.sort_by_key(|t| std::cmp::Reverse(t.len()));
        let term_alternation = format!(r"(?i)\b(?:{})\b", terms.join("|"));

        RuleSet {
            ssn: Regex::new(r"\b(\d{3})[- ]?(\d{2})[- ]?(\d{4})\b")
                .expect("invalid SSN pattern"),
            dob: Regex::new(
                r"(?i)\b(?:dob|date\s*of\s*birth|born)\b[^\n\r]{0,28}?(?:\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}-\d{2}-\d{2}|[A-Za-z]{3,9}\s+\d{1,2},\s+\d{4})",
            )
            .expect("invalid DOB pattern"),
            mrn: Regex::new(
                r"(?i)\b(?:mrn|medical\s*record(?:\s*number)?|patient\s*id)\b[^\n\r]{0,20}?[:#-]?\s*[A-Z0-9-]{5,}",
            )
            .expect("invalid MRN pattern"),
            insurance: Regex::new(
                r"(?i)\b(?:member\s*id|policy\s*(?:id|number)|subscriber\s*id|group\s*number)\b[^\n\r]{0,20}?[:#-]?\s*[A-Z0-9-]{4,}",
            )
            .expect("invalid insurance pattern"),
            coding: Regex::new(
                r"(?i)\b(?:icd-?10|icd-?9|cpt)\b[^\n\r]{0,16}?\b[A-Z]?\d{2,4}(?:\.\d{1,4})?\b",
            )
            .expect("invalid coding pattern"),
            email: Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b")
                .expect("invalid email pattern"),
            phone: Regex::new(r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]\d{3}[-.\s]?\d{4}")
                .expect("invalid phone pattern"),
            address: Regex::new(
                r"(?i)\b\d{1,6}\s+[A-Za-z0-9.'-]+(?:\s+[A-Za-z0-9.'-]+){0,4}\s+(?:st|street|ave|avenue|rd|road|dr|drive|blvd|boulevard|lane|ln|way|ct|court)\b",
            )
            .expect("invalid address pattern"),
            medical_terms: Regex::new(&term_alternation).expect("invalid term table"),
        }
    }
}

/// Placeholder SSNs never issued by the SSA: any all-zero segment,
/// area 666 or 900-999, or nine identical digits.
fn is_placeholder_ssn(area: &str, group: &str, serial: &str) -> bool {
    if area == "000" || group == "00" || serial == "0000" {
        return true;
    }
    if area == "666" || area.starts_with('9') {
        return true;
    }
    let digits: String = format!("{area}{group}{serial}");
    let first = digits.chars().next().unwrap_or('0');
    digits.chars().all(|c| c == first)
}

fn mask_match_text(text: &str) -> String {
    let clean = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = clean.chars().collect();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}...{tail}")
}

fn excerpt(text: &str, start: usize, end: usize) -> String {
    const WINDOW: usize = 34;
    let left = start.saturating_sub(WINDOW);
    let right = (end + WINDOW).min(text.len());
    // Snap to char boundaries so slicing never panics on multibyte text.
    let left = (0..=left).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    let right = (right..=text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(text.len());

    let mut snippet = text[left..right].split_whitespace().collect::<Vec<_>>().join(" ");
    if left > 0 {
        snippet = format!("...{snippet}");
    }
    if right < text.len() {
        snippet = format!("{snippet}...");
    }
    snippet
}

// ============================================================================
// SCANNER
// ============================================================================

pub struct SensitivityScanner<'a> {
    rules: &'a RuleSet,
}

impl<'a> SensitivityScanner<'a> {
    pub fn new(rules: &'a RuleSet) -> Self {
        SensitivityScanner { rules }
    }

    /// Normalize and scan raw CRM rows. Records without reviewable text are
    /// collected in `skipped`; the rest of the batch is always scanned.
    pub fn scan_raw_records(&self, records: &[RawRecord]) -> ScanOutcome {
        let mut normalized = Vec::new();
        let mut skipped = Vec::new();

        for record in records {
            match normalize_record(record) {
                Ok(scan_record) => normalized.push(scan_record),
                Err(err) => skipped.push(err),
            }
        }

        let mut outcome = self.scan(&normalized);
        outcome.skipped = skipped;
        outcome
    }

    /// Scan normalized records and return ranked findings: severity
    /// descending, then confidence descending, stable on ties by the
    /// original record order.
    pub fn scan(&self, records: &[ScanRecord]) -> ScanOutcome {
        let mut findings = Vec::new();

        for record in records {
            let hits = self.collect_hits(&record.text);
            let merged = merge_hits(hits);

            for hit in merged {
                findings.push(Finding {
                    source_type: record.source_type.clone(),
                    source_id: record.source_id,
                    detector: hit.detector,
                    severity: hit.severity,
                    confidence: hit.confidence,
                    matched_text: mask_match_text(&hit.matched),
                    snippet: excerpt(&record.text, hit.start, hit.end),
                });
            }
        }

        // Stable sort keeps record order on full ties.
        findings.sort_by(|a, b| {
            b.severity
                .rank()
                .cmp(&a.severity.rank())
                .then(b.confidence.total_cmp(&a.confidence))
        });

        ScanOutcome {
            findings,
            skipped: Vec::new(),
        }
    }

    fn collect_hits(&self, text: &str) -> Vec<Hit> {
        let mut hits = Vec::new();

        for caps in self.rules.ssn.captures_iter(text) {
            if is_placeholder_ssn(&caps[1], &caps[2], &caps[3]) {
                continue;
            }
            if let Some(whole) = caps.get(0) {
                hits.push(raw_hit(Detector::Ssn, whole.start(), whole.end(), whole.as_str()));
            }
        }

        for m in self.rules.mrn.find_iter(text) {
            hits.push(raw_hit(Detector::MedicalRecordNumber, m.start(), m.end(), m.as_str()));
        }

        for m in self.rules.dob.find_iter(text) {
            hits.push(raw_hit(Detector::DateOfBirth, m.start(), m.end(), m.as_str()));
        }

        for m in self.rules.insurance.find_iter(text) {
            hits.push(raw_hit(Detector::InsuranceIdentifier, m.start(), m.end(), m.as_str()));
        }

        for m in self.rules.coding.find_iter(text) {
            hits.push(raw_hit(Detector::ClinicalBillingCode, m.start(), m.end(), m.as_str()));
        }

        hits.extend(self.medical_context_hit(text));
        hits
    }

    /// Keyword density of diagnosis/treatment/medication terms. Low on its
    /// own; Medium when dense or when a personal identifier co-occurs.
    fn medical_context_hit(&self, text: &str) -> Option<Hit> {
        // Matching on the original text keeps spans valid; lowercasing can
        // shift byte offsets on non-ASCII input.
        let mut distinct: Vec<String> = Vec::new();
        let mut first_span: Option<(usize, usize)> = None;

        for m in self.rules.medical_terms.find_iter(text) {
            if first_span.is_none() {
                first_span = Some((m.start(), m.end()));
            }
            let term = m.as_str().to_lowercase();
            if !distinct.contains(&term) {
                distinct.push(term);
            }
        }

        let (start, end) = first_span?;
        let has_identifier = self.rules.email.is_match(text)
            || self.rules.phone.is_match(text)
            || self.rules.address.is_match(text);

        let dense = distinct.len() >= DENSITY_MEDIUM_THRESHOLD;
        let (severity, confidence) = if has_identifier {
            (Severity::Medium, 0.89)
        } else if dense {
            (Severity::Medium, 0.80)
        } else {
            (Detector::MedicalContext.base_severity(), Detector::MedicalContext.base_confidence())
        };

        Some(Hit {
            detector: Detector::MedicalContext,
            start,
            end,
            matched: distinct.first().cloned().unwrap_or_default(),
            severity,
            confidence,
        })
    }
}

fn raw_hit(detector: Detector, start: usize, end: usize, matched: &str) -> Hit {
    Hit {
        detector,
        start,
        end,
        matched: matched.to_string(),
        severity: detector.base_severity(),
        confidence: detector.base_confidence(),
    }
}

fn spans_colocated(a: &Hit, b: &Hit) -> bool {
    let gap = if a.end <= b.start {
        b.start - a.end
    } else if b.end <= a.start {
        a.start - b.end
    } else {
        0 // overlapping
    };
    gap <= ADJACENCY_WINDOW
}

/// Merge per-record hits: when two or more independent detector families
/// agree on the same span or adjacent context, boost confidence (capped at
/// 1.0) and escalate severity one tier. No hit is ever dropped.
fn merge_hits(mut hits: Vec<Hit>) -> Vec<Hit> {
    let snapshot = hits.clone();

    for hit in &mut hits {
        let agreeing_families = snapshot
            .iter()
            .filter(|other| other.detector != hit.detector && spans_colocated(hit, other))
            .map(|other| other.detector)
            .fold(Vec::new(), |mut acc, family| {
                if !acc.contains(&family) {
                    acc.push(family);
                }
                acc
            })
            .len();

        if agreeing_families > 0 {
            hit.severity = hit.severity.escalate();
            hit.confidence = (hit.confidence + 0.05 * agreeing_families as f64).min(1.0);
        }
    }

    hits
}

// ============================================================================
// RULE TABLES
// ============================================================================

/// Diagnosis, treatment, and medication vocabulary used by the
/// medical-context detector. Matched case-insensitively on whole words.
const MEDICAL_TERMS: &[&str] = &[
    "addiction",
    "admission",
    "allergies",
    "allergy",
    "alzheimer's disease",
    "anemia",
    "aneurysm",
    "anxiety",
    "arrhythmia",
    "arthritis",
    "asthma",
    "atrial fibrillation",
    "autism",
    "autoimmune",
    "biopsy",
    "bipolar disorder",
    "blood pressure",
    "blood test",
    "cancer",
    "cardiac",
    "cardiology",
    "care plan",
    "chemotherapy",
    "chronic kidney disease",
    "chronic pain",
    "chronic",
    "clinical",
    "clinician",
    "cognitive impairment",
    "concussion",
    "condition",
    "congestive heart failure",
    "copd",
    "coronary artery disease",
    "covid-19",
    "ct scan",
    "dementia",
    "depression",
    "diabetes",
    "diagnosed",
    "diagnosis",
    "diagnostic",
    "dialysis",
    "disability",
    "discharge",
    "disease",
    "dosage",
    "dose",
    "echocardiogram",
    "emergency room",
    "epilepsy",
    "fibromyalgia",
    "fracture",
    "glucose",
    "heart attack",
    "heart failure",
    "hepatitis",
    "hiv",
    "hospital",
    "hypertension",
    "hypothyroidism",
    "imaging",
    "infection",
    "influenza",
    "infusion",
    "inpatient",
    "insomnia",
    "insulin",
    "intensive care",
    "injury",
    "kidney disease",
    "lab result",
    "leukemia",
    "lupus",
    "lymphoma",
    "mammogram",
    "medication",
    "medications",
    "mental health",
    "migraine",
    "multiple sclerosis",
    "myocardial infarction",
    "neurology",
    "neuropathy",
    "nurse",
    "obesity",
    "oncology",
    "opioid",
    "orthopedic",
    "osteoporosis",
    "outpatient",
    "pacemaker",
    "pain management",
    "paralysis",
    "pathology",
    "patient",
    "pediatric",
    "physical therapy",
    "physician",
    "pneumonia",
    "post-op",
    "postpartum",
    "prenatal",
    "prescription",
    "prescriptions",
    "primary care",
    "procedure",
    "prognosis",
    "psychiatric",
    "psychiatry",
    "ptsd",
    "pulmonary embolism",
    "pulmonary",
    "radiology",
    "radiotherapy",
    "rehab",
    "rehabilitation",
    "schizophrenia",
    "seizure",
    "sepsis",
    "sleep apnea",
    "specialist",
    "spinal cord injury",
    "spinal",
    "sprain",
    "stroke",
    "substance use disorder",
    "surgery",
    "symptom",
    "symptoms",
    "therapy",
    "thyroid",
    "transplant",
    "trauma",
    "traumatic brain injury",
    "treatment plan",
    "treatment",
    "triage",
    "tumor",
    "ulcer",
    "ultrasound",
    "urgent care",
    "ventilator",
    "vital signs",
    "wound",
    "x-ray",
];

// ============================================================================
// TESTS
// ============================================================================
