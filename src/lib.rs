// DonorLedger - Fundraising CRM Core Library
// Exposes all modules for use in the CLI and tests

pub mod error;
pub mod matcher;
pub mod model;
pub mod normalizer;
pub mod report;
pub mod scanner;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use error::CrmError;
pub use matcher::{
    check_binding_invariants, normalize_reference, plan_exact_matches, MatchException, MatchPair,
    MatchPlan,
};
pub use model::{
    amount_from_cents, cents_from_amount, clamp_probability, format_currency, BankTransaction,
    Donation, DonorKind, GiftStage, NewBankTransaction, NewCampaign, NewDonation, NewDonor,
    NewEngagement, NewLedgerEntry, Period, RawRecord,
};
pub use normalizer::{normalize_record, ScanRecord};
pub use report::{write_findings_csv, write_findings_file};
pub use scanner::{
    Detector, Finding, RuleSet, ScanOutcome, SensitivityScanner, Severity,
};
pub use snapshot::{summarize, ReconciliationSnapshot};
pub use store::{CrmStore, Event, ImportSummary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
