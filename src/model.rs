// Domain model - gifts, bank transactions, and supporting CRM entities
// Amounts are integer cents end to end; floats only appear at the edges.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// MONEY HELPERS
// ============================================================================

pub fn cents_from_amount(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn amount_from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

pub fn format_currency(cents: i64) -> String {
    format!("${:.2}", amount_from_cents(cents))
}

// ============================================================================
// GIFT STAGE
// ============================================================================

/// Pipeline stage of a gift/opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GiftStage {
    Prospecting,
    Committed,
    Posted,
    Reconciled,
    Lost,
}

impl GiftStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftStage::Prospecting => "Prospecting",
            GiftStage::Committed => "Committed",
            GiftStage::Posted => "Posted",
            GiftStage::Reconciled => "Reconciled",
            GiftStage::Lost => "Lost",
        }
    }

    pub fn parse(value: &str) -> Option<GiftStage> {
        match value {
            "Prospecting" => Some(GiftStage::Prospecting),
            "Committed" => Some(GiftStage::Committed),
            "Posted" => Some(GiftStage::Posted),
            "Reconciled" => Some(GiftStage::Reconciled),
            "Lost" => Some(GiftStage::Lost),
            _ => None,
        }
    }

    /// Pipeline rank for sorting and stage-gate checks.
    pub fn rank(&self) -> u8 {
        match self {
            GiftStage::Prospecting => 1,
            GiftStage::Committed => 2,
            GiftStage::Posted => 3,
            GiftStage::Reconciled => 4,
            GiftStage::Lost => 5,
        }
    }

    /// Stages the reconciliation matcher consumes.
    pub fn is_matchable(&self) -> bool {
        matches!(self, GiftStage::Committed | GiftStage::Posted)
    }

    /// Amount is frozen from Posted onward.
    pub fn amount_locked(&self) -> bool {
        matches!(self, GiftStage::Posted | GiftStage::Reconciled)
    }
}

/// Clamp a probability estimate into the 0-100 range.
pub fn clamp_probability(percent: i64) -> i64 {
    percent.clamp(0, 100)
}

// ============================================================================
// PERIOD (year + month)
// ============================================================================

/// A reconciliation period: one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Period> {
        if (1..=12).contains(&month) {
            Some(Period { year, month })
        } else {
            None
        }
    }

    /// Parse "YYYY-MM".
    pub fn parse(value: &str) -> Option<Period> {
        let (year, month) = value.split_once('-')?;
        Period::new(year.parse().ok()?, month.parse().ok()?)
    }

    /// First and last day of the month.
    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        let start = NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(self.year, 1, 1).unwrap_or_default());
        let next = if self.month == 12 {
            NaiveDate::from_ymd_opt(self.year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(self.year, self.month + 1, 1)
        };
        let end = next
            .and_then(|d| d.pred_opt())
            .unwrap_or(start);
        (start, end)
    }

    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

// ============================================================================
// CORE ENTITIES
// ============================================================================

/// A fundraising gift tracked through pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    pub id: i64,
    pub donor_id: i64,
    pub donation_date: NaiveDate,
    pub amount_cents: i64,
    pub currency: String,
    pub stage: GiftStage,
    pub probability_percent: i64,
    pub campaign_id: Option<i64>,
    pub fund: Option<String>,
    pub reference_code: Option<String>,
    pub bank_account_id: Option<i64>,
    pub ledger_entry_id: Option<i64>,
    pub bank_transaction_id: Option<i64>,
    pub notes: Option<String>,
}

impl Donation {
    pub fn is_matched(&self) -> bool {
        self.bank_transaction_id.is_some()
    }
}

/// An imported or manually entered bank-account movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: i64,
    pub bank_account_id: i64,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub amount_cents: i64,
    pub reference_code: Option<String>,
    pub donation_id: Option<i64>,
    pub ledger_entry_id: Option<i64>,
}

impl BankTransaction {
    pub fn is_matched(&self) -> bool {
        self.donation_id.is_some()
    }
}

// ============================================================================
// SUPPORTING ENTITIES (insert parameters)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DonorKind {
    Individual,
    Organization,
}

impl DonorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DonorKind::Individual => "Individual",
            DonorKind::Organization => "Organization",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewDonor {
    pub kind: Option<DonorKind>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub lifecycle_stage: Option<String>,
    pub relationship_manager: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewDonation {
    pub donor_id: i64,
    pub donation_date: NaiveDate,
    pub amount_cents: i64,
    pub currency: String,
    pub stage: GiftStage,
    pub probability_percent: i64,
    pub campaign_id: Option<i64>,
    pub fund: Option<String>,
    pub reference_code: Option<String>,
    pub bank_account_id: Option<i64>,
    pub ledger_entry_id: Option<i64>,
    pub notes: Option<String>,
}

impl NewDonation {
    /// A posted gift with the fields the matcher cares about.
    pub fn posted(
        donor_id: i64,
        donation_date: NaiveDate,
        amount_cents: i64,
        reference_code: Option<&str>,
        bank_account_id: Option<i64>,
    ) -> Self {
        NewDonation {
            donor_id,
            donation_date,
            amount_cents,
            currency: "USD".to_string(),
            stage: GiftStage::Posted,
            probability_percent: 100,
            campaign_id: None,
            fund: None,
            reference_code: reference_code.map(str::to_string),
            bank_account_id,
            ledger_entry_id: None,
            notes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub bank_account_id: i64,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub amount_cents: i64,
    pub reference_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub posted_date: NaiveDate,
    pub account_code: String,
    pub description: String,
    pub amount_cents: i64,
    pub reference_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub name: String,
    pub campaign_type: String,
    pub status: String,
    pub owner: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub goal_cents: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEngagement {
    pub donor_id: i64,
    pub engagement_date: NaiveDate,
    pub engagement_type: String,
    pub channel: Option<String>,
    pub summary: String,
    pub next_step: Option<String>,
    pub owner: Option<String>,
}

// ============================================================================
// SCAN INPUT
// ============================================================================

/// A raw CRM row prepared for sensitivity scanning: text fields only,
/// in the order they should be concatenated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_type: String,
    pub table: String,
    pub id: i64,
    pub fields: Vec<(String, String)>,
    pub owner: Option<String>,
    pub last_modified: Option<String>,
}
