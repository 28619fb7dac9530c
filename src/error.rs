// Error taxonomy for the matching and scanning cores.
// Store operations return anyhow::Result; these variants are raised with
// .into() so callers can downcast when they need to branch on the cause.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CrmError {
    /// Record has no reviewable text. Callers skip the record, not the batch.
    #[error("{source_type} record {source_id} has no reviewable text fields")]
    MissingSource {
        source_type: String,
        source_id: i64,
    },

    /// Exact-reference pass found more than one equally valid pairing.
    /// Surfaced as an exception row, never auto-resolved.
    #[error("reference '{reference}' has {donation_candidates} donation(s) and {transaction_candidates} transaction(s) with matching amounts")]
    AmbiguousMatch {
        reference: String,
        donation_candidates: usize,
        transaction_candidates: usize,
    },

    /// Manual pairing was attempted on a side that already holds a binding.
    #[error("{side} {id} is already matched; unmatch it first")]
    AlreadyMatched { side: &'static str, id: i64 },

    /// A donation or transaction is bound to two different counterparts.
    /// This is a corruption signal and halts the matching run.
    #[error("reconciliation invariant violated: {0}")]
    InvariantViolation(String),

    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Amount edits are frozen once a gift reaches Posted.
    #[error("donation {donation_id} is posted; its amount is immutable")]
    AmountImmutable { donation_id: i64 },
}
