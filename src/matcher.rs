// Reconciliation Matcher - pairs gifts with bank transactions by exact
// reference + exact amount. Ambiguity is never auto-resolved; residual
// pairs stay as exceptions for manual resolution.

use serde::{Deserialize, Serialize};

use crate::error::CrmError;
use crate::model::{BankTransaction, Donation};

// ============================================================================
// PLAN OUTPUT
// ============================================================================

/// One planned binding from the exact-reference pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchPair {
    pub donation_id: i64,
    pub bank_transaction_id: i64,
    pub reference: String,
    pub amount_cents: i64,
}

/// A pair the pass could not resolve. Collected, never silently dropped,
/// and never aborting the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchException {
    /// More than one equally valid candidate on either side.
    Ambiguous {
        reference: String,
        amount_cents: i64,
        donation_ids: Vec<i64>,
        transaction_ids: Vec<i64>,
    },
    /// In-scope gift left without a counterpart.
    UnmatchedDonation { donation_id: i64 },
    /// In-scope transaction left without a counterpart.
    UnmatchedTransaction { bank_transaction_id: i64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchPlan {
    pub bindings: Vec<MatchPair>,
    pub exceptions: Vec<MatchException>,
}

impl MatchPlan {
    pub fn ambiguous_count(&self) -> usize {
        self.exceptions
            .iter()
            .filter(|e| matches!(e, MatchException::Ambiguous { .. }))
            .count()
    }
}

// ============================================================================
// REFERENCE NORMALIZATION
// ============================================================================

/// Trimmed, lowercased reference; None when effectively blank.
pub fn normalize_reference(reference: &str) -> Option<String> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

// ============================================================================
// INVARIANT CHECK
// ============================================================================

/// Verify the 1:1 binding invariant across the input sets. A side bound to
/// two different counterparts is a corruption signal: the matching run must
/// halt, not patch around it.
pub fn check_binding_invariants(
    donations: &[Donation],
    transactions: &[BankTransaction],
) -> Result<(), CrmError> {
    let mut seen_donation_refs: Vec<i64> = Vec::new();
    for tx in transactions {
        if let Some(donation_id) = tx.donation_id {
            if seen_donation_refs.contains(&donation_id) {
                return Err(CrmError::InvariantViolation(format!(
                    "donation {donation_id} is claimed by two bank transactions"
                )));
            }
            seen_donation_refs.push(donation_id);
        }
    }

    let mut seen_transaction_refs: Vec<i64> = Vec::new();
    for donation in donations {
        if let Some(tx_id) = donation.bank_transaction_id {
            if seen_transaction_refs.contains(&tx_id) {
                return Err(CrmError::InvariantViolation(format!(
                    "bank transaction {tx_id} is claimed by two donations"
                )));
            }
            seen_transaction_refs.push(tx_id);
        }
    }

    // Cross-reference agreement, for pairs visible in both sets.
    for donation in donations {
        if let Some(tx_id) = donation.bank_transaction_id {
            if let Some(tx) = transactions.iter().find(|t| t.id == tx_id) {
                if tx.donation_id != Some(donation.id) {
                    return Err(CrmError::InvariantViolation(format!(
                        "donation {} points at bank transaction {} but the transaction points back at {:?}",
                        donation.id, tx_id, tx.donation_id
                    )));
                }
            }
        }
    }
    for tx in transactions {
        if let Some(donation_id) = tx.donation_id {
            if let Some(donation) = donations.iter().find(|d| d.id == donation_id) {
                if donation.bank_transaction_id != Some(tx.id) {
                    return Err(CrmError::InvariantViolation(format!(
                        "bank transaction {} points at donation {} but the donation points back at {:?}",
                        tx.id, donation_id, donation.bank_transaction_id
                    )));
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// EXACT-REFERENCE PASS
// ============================================================================

/// Plan the exact-reference pass over Committed/Posted gifts and unmatched
/// bank transactions.
///
/// Candidates are bucketed by normalized reference plus exact amount. A
/// bucket holding exactly one gift and one transaction produces a binding;
/// a bucket with more than one on either side produces an ambiguous-match
/// exception and zero bindings. Everything left over is surfaced as a
/// residual exception for manual pairing.
///
/// Idempotent: a fully matched input yields zero bindings, zero exceptions.
pub fn plan_exact_matches(
    donations: &[Donation],
    transactions: &[BankTransaction],
) -> Result<MatchPlan, CrmError> {
    check_binding_invariants(donations, transactions)?;

    let eligible_donations: Vec<&Donation> = donations
        .iter()
        .filter(|d| d.stage.is_matchable() && !d.is_matched())
        .collect();
    let eligible_transactions: Vec<&BankTransaction> = transactions
        .iter()
        .filter(|t| !t.is_matched())
        .collect();

    let mut plan = MatchPlan::default();
    let mut bound_donations: Vec<i64> = Vec::new();
    let mut bound_transactions: Vec<i64> = Vec::new();
    // Sides named inside an ambiguity report; they are not residuals too.
    let mut ambiguous_donations: Vec<i64> = Vec::new();
    let mut ambiguous_transactions: Vec<i64> = Vec::new();
    let mut visited_buckets: Vec<(String, i64)> = Vec::new();

    for donation in &eligible_donations {
        let reference = match donation.reference_code.as_deref().and_then(normalize_reference) {
            Some(reference) => reference,
            None => continue,
        };
        let bucket = (reference.clone(), donation.amount_cents);
        if visited_buckets.contains(&bucket) {
            continue;
        }
        visited_buckets.push(bucket);

        let donation_ids: Vec<i64> = eligible_donations
            .iter()
            .filter(|d| {
                d.amount_cents == donation.amount_cents
                    && d.reference_code.as_deref().and_then(normalize_reference).as_deref()
                        == Some(reference.as_str())
            })
            .map(|d| d.id)
            .collect();
        let transaction_ids: Vec<i64> = eligible_transactions
            .iter()
            .filter(|t| {
                t.amount_cents == donation.amount_cents
                    && t.reference_code.as_deref().and_then(normalize_reference).as_deref()
                        == Some(reference.as_str())
            })
            .map(|t| t.id)
            .collect();

        if transaction_ids.is_empty() {
            continue; // stays a residual
        }

        if donation_ids.len() == 1 && transaction_ids.len() == 1 {
            plan.bindings.push(MatchPair {
                donation_id: donation_ids[0],
                bank_transaction_id: transaction_ids[0],
                reference,
                amount_cents: donation.amount_cents,
            });
            bound_donations.push(donation_ids[0]);
            bound_transactions.push(transaction_ids[0]);
        } else {
            ambiguous_donations.extend_from_slice(&donation_ids);
            ambiguous_transactions.extend_from_slice(&transaction_ids);
            plan.exceptions.push(MatchException::Ambiguous {
                reference,
                amount_cents: donation.amount_cents,
                donation_ids,
                transaction_ids,
            });
        }
    }

    // Residual pass: whatever is still unbound goes to manual resolution.
    // Sides already reported as ambiguous are not listed a second time.
    for donation in &eligible_donations {
        if !bound_donations.contains(&donation.id)
            && !ambiguous_donations.contains(&donation.id)
        {
            plan.exceptions.push(MatchException::UnmatchedDonation {
                donation_id: donation.id,
            });
        }
    }
    for tx in &eligible_transactions {
        if !bound_transactions.contains(&tx.id) && !ambiguous_transactions.contains(&tx.id) {
            plan.exceptions.push(MatchException::UnmatchedTransaction {
                bank_transaction_id: tx.id,
            });
        }
    }

    Ok(plan)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GiftStage;
    use chrono::NaiveDate;

    fn donation(id: i64, amount_cents: i64, reference: Option<&str>) -> Donation {
        Donation {
            id,
            donor_id: 1,
            donation_date: NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
            amount_cents,
            currency: "USD".to_string(),
            stage: GiftStage::Posted,
            probability_percent: 100,
            campaign_id: None,
            fund: None,
            reference_code: reference.map(str::to_string),
            bank_account_id: Some(1),
            ledger_entry_id: None,
            bank_transaction_id: None,
            notes: None,
        }
    }

    fn transaction(id: i64, amount_cents: i64, reference: Option<&str>) -> BankTransaction {
        BankTransaction {
            id,
            bank_account_id: 1,
            transaction_date: NaiveDate::from_ymd_opt(2026, 2, 11).unwrap(),
            description: "Donor ACH".to_string(),
            amount_cents,
            reference_code: reference.map(str::to_string),
            donation_id: None,
            ledger_entry_id: None,
        }
    }

    #[test]
    fn test_unique_reference_and_amount_binds() {
        let donations = vec![donation(1, 50000, Some("WIRE-77"))];
        let transactions = vec![transaction(10, 50000, Some("WIRE-77"))];

        let plan = plan_exact_matches(&donations, &transactions).unwrap();

        assert_eq!(plan.bindings.len(), 1);
        assert_eq!(plan.bindings[0].donation_id, 1);
        assert_eq!(plan.bindings[0].bank_transaction_id, 10);
        assert!(plan.exceptions.is_empty());
    }

    #[test]
    fn test_reference_match_requires_exact_amount() {
        let donations = vec![donation(1, 9000, Some("REF-2"))];
        let transactions = vec![transaction(10, 8500, Some("REF-2"))];

        let plan = plan_exact_matches(&donations, &transactions).unwrap();

        assert!(plan.bindings.is_empty());
        assert!(plan
            .exceptions
            .contains(&MatchException::UnmatchedDonation { donation_id: 1 }));
        assert!(plan
            .exceptions
            .contains(&MatchException::UnmatchedTransaction { bank_transaction_id: 10 }));
    }

    #[test]
    fn test_two_transactions_one_donation_is_ambiguous() {
        let donations = vec![donation(1, 25000, Some("CHK-1002"))];
        let transactions = vec![
            transaction(10, 25000, Some("CHK-1002")),
            transaction(11, 25000, Some("CHK-1002")),
        ];

        let plan = plan_exact_matches(&donations, &transactions).unwrap();

        assert!(plan.bindings.is_empty());
        assert_eq!(plan.exceptions.len(), 1);
        match &plan.exceptions[0] {
            MatchException::Ambiguous {
                reference,
                donation_ids,
                transaction_ids,
                ..
            } => {
                assert_eq!(reference, "chk-1002");
                assert_eq!(donation_ids, &vec![1]);
                assert_eq!(transaction_ids, &vec![10, 11]);
            }
            other => panic!("expected ambiguous exception, got {other:?}"),
        }
    }

    #[test]
    fn test_two_donations_one_transaction_is_ambiguous() {
        let donations = vec![
            donation(1, 25000, Some("CHK-1002")),
            donation(2, 25000, Some("CHK-1002")),
        ];
        let transactions = vec![transaction(10, 25000, Some("CHK-1002"))];

        let plan = plan_exact_matches(&donations, &transactions).unwrap();
        assert!(plan.bindings.is_empty());
        assert_eq!(plan.ambiguous_count(), 1);
        assert_eq!(plan.exceptions.len(), 1);
    }

    #[test]
    fn test_ambiguous_sides_are_not_repeated_as_residuals() {
        let donations = vec![
            donation(1, 25000, Some("CHK-1002")),
            donation(2, 25000, Some("CHK-1002")),
            donation(3, 9000, Some("ACH-41")),
        ];
        let transactions = vec![transaction(10, 25000, Some("CHK-1002"))];

        let plan = plan_exact_matches(&donations, &transactions).unwrap();

        // One ambiguity, one genuine residual; nothing reported twice.
        assert_eq!(plan.ambiguous_count(), 1);
        assert_eq!(plan.exceptions.len(), 2);
        assert!(plan
            .exceptions
            .contains(&MatchException::UnmatchedDonation { donation_id: 3 }));
        assert!(!plan
            .exceptions
            .contains(&MatchException::UnmatchedDonation { donation_id: 1 }));
        assert!(!plan
            .exceptions
            .contains(&MatchException::UnmatchedTransaction { bank_transaction_id: 10 }));
    }

    #[test]
    fn test_reference_comparison_is_case_and_whitespace_insensitive() {
        let donations = vec![donation(1, 50000, Some("  Wire-77 "))];
        let transactions = vec![transaction(10, 50000, Some("wire-77"))];

        let plan = plan_exact_matches(&donations, &transactions).unwrap();
        assert_eq!(plan.bindings.len(), 1);
    }

    #[test]
    fn test_only_committed_or_posted_gifts_are_in_scope() {
        let mut prospect = donation(1, 50000, Some("WIRE-77"));
        prospect.stage = GiftStage::Prospecting;
        let mut lost = donation(2, 50000, Some("WIRE-78"));
        lost.stage = GiftStage::Lost;
        let committed = Donation {
            stage: GiftStage::Committed,
            ..donation(3, 40000, Some("ACH-5"))
        };

        let transactions = vec![
            transaction(10, 50000, Some("WIRE-77")),
            transaction(11, 40000, Some("ACH-5")),
        ];

        let plan = plan_exact_matches(&[prospect, lost, committed], &transactions).unwrap();
        assert_eq!(plan.bindings.len(), 1);
        assert_eq!(plan.bindings[0].donation_id, 3);
        assert!(plan
            .exceptions
            .contains(&MatchException::UnmatchedTransaction { bank_transaction_id: 10 }));
    }

    #[test]
    fn test_idempotent_on_fully_matched_set() {
        let mut d = donation(1, 50000, Some("WIRE-77"));
        d.bank_transaction_id = Some(10);
        let mut t = transaction(10, 50000, Some("WIRE-77"));
        t.donation_id = Some(1);

        let plan = plan_exact_matches(&[d], &[t]).unwrap();
        assert!(plan.bindings.is_empty());
        assert!(plan.exceptions.is_empty());
    }

    #[test]
    fn test_double_claim_halts_the_run() {
        let donations = vec![donation(1, 50000, Some("WIRE-77"))];
        let mut t1 = transaction(10, 50000, None);
        t1.donation_id = Some(1);
        let mut t2 = transaction(11, 50000, None);
        t2.donation_id = Some(1);

        let err = plan_exact_matches(&donations, &[t1, t2]).unwrap_err();
        assert!(matches!(err, CrmError::InvariantViolation(_)));
    }

    #[test]
    fn test_one_sided_binding_halts_the_run() {
        let mut d = donation(1, 50000, Some("WIRE-77"));
        d.bank_transaction_id = Some(10);
        // Transaction 10 exists but points nowhere: a dangling half-link.
        let t = transaction(10, 50000, Some("WIRE-77"));

        let err = plan_exact_matches(&[d], &[t]).unwrap_err();
        assert!(matches!(err, CrmError::InvariantViolation(_)));
    }

    #[test]
    fn test_blank_references_never_bucket_together() {
        let donations = vec![donation(1, 50000, Some("   "))];
        let transactions = vec![transaction(10, 50000, Some("   "))];

        let plan = plan_exact_matches(&donations, &transactions).unwrap();
        assert!(plan.bindings.is_empty());
        assert_eq!(plan.exceptions.len(), 2);
    }
}
