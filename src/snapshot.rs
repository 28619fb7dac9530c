// Reconciliation Snapshot - point-in-time rollup of how a period's gifts
// line up against the bank statement.

use serde::{Deserialize, Serialize};

use crate::model::{amount_from_cents, BankTransaction, Donation, Period};

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSnapshot {
    pub period: String,
    pub gift_count: usize,
    pub gift_total_cents: i64,
    pub bank_count: usize,
    pub bank_total_cents: i64,
    pub matched_count: usize,
    pub matched_total_cents: i64,
    pub unmatched_gift_count: usize,
    pub unmatched_bank_count: usize,
    /// Bank total minus gift total. Positive means the bank saw more money
    /// than the book of gifts expects.
    pub variance_cents: i64,
    /// Matched gift amount over total gift amount, 0.0 when no gift amount.
    pub completion: f64,
}

impl ReconciliationSnapshot {
    pub fn gift_total(&self) -> f64 {
        amount_from_cents(self.gift_total_cents)
    }

    pub fn bank_total(&self) -> f64 {
        amount_from_cents(self.bank_total_cents)
    }

    pub fn variance(&self) -> f64 {
        amount_from_cents(self.variance_cents)
    }
}

/// Summarize one account-period's gifts against its bank transactions.
///
/// A gift counts as matched only when its binding is mirrored by a
/// transaction in the same scope; a cross-reference pointing outside the
/// inputs contributes nothing to the matched totals.
pub fn summarize(
    period: &Period,
    donations: &[Donation],
    transactions: &[BankTransaction],
) -> ReconciliationSnapshot {
    let gift_total_cents: i64 = donations.iter().map(|d| d.amount_cents).sum();
    let bank_total_cents: i64 = transactions.iter().map(|t| t.amount_cents).sum();

    let mut matched_count = 0usize;
    let mut matched_total_cents = 0i64;
    for donation in donations {
        let Some(tx_id) = donation.bank_transaction_id else {
            continue;
        };
        let mirrored = transactions
            .iter()
            .any(|t| t.id == tx_id && t.donation_id == Some(donation.id));
        if mirrored {
            matched_count += 1;
            matched_total_cents += donation.amount_cents;
        }
    }

    let matched_transactions = transactions
        .iter()
        .filter(|t| {
            t.donation_id.is_some_and(|donation_id| {
                donations
                    .iter()
                    .any(|d| d.id == donation_id && d.bank_transaction_id == Some(t.id))
            })
        })
        .count();

    let completion = if gift_total_cents > 0 {
        matched_total_cents as f64 / gift_total_cents as f64
    } else {
        0.0
    };

    ReconciliationSnapshot {
        period: period.label(),
        gift_count: donations.len(),
        gift_total_cents,
        bank_count: transactions.len(),
        bank_total_cents,
        matched_count,
        matched_total_cents,
        unmatched_gift_count: donations.len() - matched_count,
        unmatched_bank_count: transactions.len() - matched_transactions,
        variance_cents: bank_total_cents - gift_total_cents,
        completion,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GiftStage;
    use chrono::NaiveDate;

    fn period() -> Period {
        Period::new(2026, 2).unwrap()
    }

    fn donation(id: i64, amount_cents: i64, bank_transaction_id: Option<i64>) -> Donation {
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
            reference_code: None,
            bank_account_id: Some(1),
            ledger_entry_id: None,
            bank_transaction_id,
            notes: None,
        }
    }

    fn transaction(id: i64, amount_cents: i64, donation_id: Option<i64>) -> BankTransaction {
        BankTransaction {
            id,
            bank_account_id: 1,
            transaction_date: NaiveDate::from_ymd_opt(2026, 2, 11).unwrap(),
            description: "ACH credit".to_string(),
            amount_cents,
            reference_code: None,
            donation_id,
            ledger_entry_id: None,
        }
    }

    #[test]
    fn test_single_matched_gift_reconciles_cleanly() {
        let donations = vec![donation(1, 50000, Some(10))];
        let transactions = vec![transaction(10, 50000, Some(1))];

        let snapshot = summarize(&period(), &donations, &transactions);

        assert_eq!(snapshot.period, "2026-02");
        assert_eq!(snapshot.matched_count, 1);
        assert_eq!(snapshot.matched_total_cents, 50000);
        assert_eq!(snapshot.variance_cents, 0);
        assert!((snapshot.completion - 1.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.unmatched_gift_count, 0);
        assert_eq!(snapshot.unmatched_bank_count, 0);
    }

    #[test]
    fn test_variance_is_bank_minus_gifts() {
        let donations = vec![donation(1, 40000, None)];
        let transactions = vec![transaction(10, 52500, None)];

        let snapshot = summarize(&period(), &donations, &transactions);

        assert_eq!(snapshot.variance_cents, 12500);
        assert_eq!(snapshot.variance(), 125.0);
    }

    #[test]
    fn test_completion_is_a_ratio_of_amounts_not_counts() {
        // One big matched gift and three small unmatched ones.
        let donations = vec![
            donation(1, 90000, Some(10)),
            donation(2, 1000, None),
            donation(3, 1000, None),
            donation(4, 1000, None),
        ];
        let transactions = vec![transaction(10, 90000, Some(1))];

        let snapshot = summarize(&period(), &donations, &transactions);

        assert_eq!(snapshot.matched_count, 1);
        assert!((snapshot.completion - 90000.0 / 93000.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_period_reports_zero_completion() {
        let snapshot = summarize(&period(), &[], &[]);
        assert_eq!(snapshot.gift_count, 0);
        assert_eq!(snapshot.variance_cents, 0);
        assert_eq!(snapshot.completion, 0.0);
    }

    #[test]
    fn test_binding_outside_the_scope_does_not_count_as_matched() {
        // Gift bound to transaction 99 which is not in this period's scope.
        let donations = vec![donation(1, 50000, Some(99))];
        let transactions = vec![transaction(10, 50000, None)];

        let snapshot = summarize(&period(), &donations, &transactions);

        assert_eq!(snapshot.matched_count, 0);
        assert_eq!(snapshot.matched_total_cents, 0);
        assert_eq!(snapshot.unmatched_gift_count, 1);
        assert_eq!(snapshot.unmatched_bank_count, 1);
    }

    #[test]
    fn test_totals_cover_matched_and_unmatched_alike() {
        let donations = vec![donation(1, 50000, Some(10)), donation(2, 20000, None)];
        let transactions = vec![transaction(10, 50000, Some(1)), transaction(11, 30000, None)];

        let snapshot = summarize(&period(), &donations, &transactions);

        assert_eq!(snapshot.gift_total_cents, 70000);
        assert_eq!(snapshot.bank_total_cents, 80000);
        assert_eq!(snapshot.matched_total_cents, 50000);
        assert_eq!(snapshot.variance_cents, 10000);
    }
}
