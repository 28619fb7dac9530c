// CRM store - SQLite persistence for donors, gifts, bank data, and the
// reconciliation cross-references. All writes that touch both sides of a
// gift/transaction binding happen inside one SQL transaction.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::CrmError;
use crate::matcher::{plan_exact_matches, MatchException, MatchPlan};
use crate::model::{
    cents_from_amount, clamp_probability, BankTransaction, Donation, DonorKind, GiftStage,
    NewBankTransaction, NewCampaign, NewDonation, NewDonor, NewEngagement, NewLedgerEntry, Period,
    RawRecord,
};
use crate::snapshot::{summarize, ReconciliationSnapshot};

const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Append-only audit record. Every binding change writes one.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// CSV IMPORT
// ============================================================================

#[derive(Debug, Deserialize)]
struct BankStatementRow {
    #[serde(rename = "Date")]
    date: String,

    #[serde(rename = "Description")]
    description: String,

    #[serde(rename = "Amount")]
    amount: f64,

    #[serde(rename = "Reference")]
    #[serde(default)]
    reference: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Idempotency hash for statement rows. Re-importing the same file, or an
/// overlapping export of the same account, inserts nothing new.
fn statement_row_hash(
    bank_account_id: i64,
    date: NaiveDate,
    amount_cents: i64,
    description: &str,
    reference: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{bank_account_id}|{date}|{amount_cents}|{description}|{reference}"
    ));
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// STORE
// ============================================================================

pub struct CrmStore {
    conn: Connection,
}

impl CrmStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL for crash recovery, foreign keys on for the cross-references.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        setup_schema(&conn)?;
        Ok(CrmStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // ENTITY INSERTS
    // ========================================================================

    pub fn add_donor(&self, donor: &NewDonor) -> Result<i64> {
        let kind = match donor.kind {
            Some(kind) => kind,
            None if donor.organization_name.is_some() => DonorKind::Organization,
            None => DonorKind::Individual,
        };
        match kind {
            DonorKind::Individual => {
                if donor.first_name.is_none() || donor.last_name.is_none() {
                    bail!("individual donors need both a first and a last name");
                }
            }
            DonorKind::Organization => {
                if donor.organization_name.is_none() {
                    bail!("organization donors need an organization name");
                }
            }
        }

        self.conn.execute(
            "INSERT INTO donors (
                donor_kind, first_name, last_name, organization_name,
                email, phone, lifecycle_stage, relationship_manager, notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                kind.as_str(),
                donor.first_name,
                donor.last_name,
                donor.organization_name,
                donor.email,
                donor.phone,
                donor.lifecycle_stage,
                donor.relationship_manager,
                donor.notes,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_bank_account(
        &self,
        name: &str,
        institution: &str,
        account_number_last4: &str,
        currency: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO bank_accounts (name, institution, account_number_last4, currency)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, institution, account_number_last4, currency],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_campaign(&self, campaign: &NewCampaign) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO campaigns (
                name, campaign_type, status, owner, start_date, end_date,
                goal_cents, description
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                campaign.name,
                campaign.campaign_type,
                campaign.status,
                campaign.owner,
                campaign.start_date.map(|d| d.format(DATE_FORMAT).to_string()),
                campaign.end_date.map(|d| d.format(DATE_FORMAT).to_string()),
                campaign.goal_cents,
                campaign.description,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_engagement(&self, engagement: &NewEngagement) -> Result<i64> {
        if engagement.summary.trim().is_empty() {
            bail!("engagements need a non-empty summary");
        }
        self.conn.execute(
            "INSERT INTO engagements (
                donor_id, engagement_date, engagement_type, channel,
                summary, next_step, owner
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                engagement.donor_id,
                engagement.engagement_date.format(DATE_FORMAT).to_string(),
                engagement.engagement_type,
                engagement.channel,
                engagement.summary,
                engagement.next_step,
                engagement.owner,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_ledger_entry(&self, entry: &NewLedgerEntry) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO ledger_entries (
                posted_date, account_code, description, amount_cents, reference_code
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.posted_date.format(DATE_FORMAT).to_string(),
                entry.account_code,
                entry.description,
                entry.amount_cents,
                entry.reference_code,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_donation(&self, donation: &NewDonation) -> Result<i64> {
        if donation.amount_cents <= 0 {
            bail!("donation amount must be positive");
        }
        self.conn.execute(
            "INSERT INTO donations (
                donor_id, donation_date, amount_cents, currency, stage,
                probability_percent, campaign_id, fund, reference_code,
                bank_account_id, ledger_entry_id, notes
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                donation.donor_id,
                donation.donation_date.format(DATE_FORMAT).to_string(),
                donation.amount_cents,
                donation.currency,
                donation.stage.as_str(),
                clamp_probability(donation.probability_percent),
                donation.campaign_id,
                donation.fund,
                donation.reference_code,
                donation.bank_account_id,
                donation.ledger_entry_id,
                donation.notes,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_bank_transaction(&self, tx: &NewBankTransaction) -> Result<i64> {
        let hash = statement_row_hash(
            tx.bank_account_id,
            tx.transaction_date,
            tx.amount_cents,
            &tx.description,
            tx.reference_code.as_deref().unwrap_or(""),
        );
        self.conn.execute(
            "INSERT INTO bank_transactions (
                bank_account_id, transaction_date, description, amount_cents,
                reference_code, idempotency_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tx.bank_account_id,
                tx.transaction_date.format(DATE_FORMAT).to_string(),
                tx.description,
                tx.amount_cents,
                tx.reference_code,
                hash,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    pub fn donation(&self, id: i64) -> Result<Donation> {
        let mut stmt = self.conn.prepare(&format!(
            "{DONATION_SELECT} WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], map_donation_row)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(CrmError::NotFound {
                entity: "donation",
                id,
            }
            .into()),
        }
    }

    pub fn bank_transaction(&self, id: i64) -> Result<BankTransaction> {
        let mut stmt = self.conn.prepare(&format!(
            "{BANK_TRANSACTION_SELECT} WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], map_bank_transaction_row)?;
        match rows.next() {
            Some(row) => Ok(row?),
            None => Err(CrmError::NotFound {
                entity: "bank transaction",
                id,
            }
            .into()),
        }
    }

    /// Gifts dated inside the period and attributed to the account.
    pub fn donations_in_scope(
        &self,
        bank_account_id: i64,
        period: &Period,
    ) -> Result<Vec<Donation>> {
        let (start, end) = period.bounds();
        let mut stmt = self.conn.prepare(&format!(
            "{DONATION_SELECT}
             WHERE bank_account_id = ?1 AND donation_date BETWEEN ?2 AND ?3
             ORDER BY donation_date, id"
        ))?;
        let donations = stmt
            .query_map(
                params![
                    bank_account_id,
                    start.format(DATE_FORMAT).to_string(),
                    end.format(DATE_FORMAT).to_string(),
                ],
                map_donation_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(donations)
    }

    pub fn bank_transactions_in_scope(
        &self,
        bank_account_id: i64,
        period: &Period,
    ) -> Result<Vec<BankTransaction>> {
        let (start, end) = period.bounds();
        let mut stmt = self.conn.prepare(&format!(
            "{BANK_TRANSACTION_SELECT}
             WHERE bank_account_id = ?1 AND transaction_date BETWEEN ?2 AND ?3
             ORDER BY transaction_date, id"
        ))?;
        let transactions = stmt
            .query_map(
                params![
                    bank_account_id,
                    start.format(DATE_FORMAT).to_string(),
                    end.format(DATE_FORMAT).to_string(),
                ],
                map_bank_transaction_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transactions)
    }

    // ========================================================================
    // GIFT LIFECYCLE
    // ========================================================================

    pub fn update_gift_stage(
        &self,
        donation_id: i64,
        stage: GiftStage,
        probability_percent: i64,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE donations SET stage = ?1, probability_percent = ?2 WHERE id = ?3",
            params![
                stage.as_str(),
                clamp_probability(probability_percent),
                donation_id,
            ],
        )?;
        if updated == 0 {
            return Err(CrmError::NotFound {
                entity: "donation",
                id: donation_id,
            }
            .into());
        }
        Ok(())
    }

    /// Amount edits are frozen once the gift reaches Posted.
    pub fn update_donation_amount(&self, donation_id: i64, amount_cents: i64) -> Result<()> {
        if amount_cents <= 0 {
            bail!("donation amount must be positive");
        }
        let donation = self.donation(donation_id)?;
        if donation.stage.amount_locked() {
            return Err(CrmError::AmountImmutable { donation_id }.into());
        }
        self.conn.execute(
            "UPDATE donations SET amount_cents = ?1 WHERE id = ?2",
            params![amount_cents, donation_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // MATCHING (both cross-references move together, or neither does)
    // ========================================================================

    /// Manually bind one gift to one bank transaction. Amounts are allowed
    /// to differ; a matcher exception is exactly what this call resolves.
    pub fn match_donation_to_bank_transaction(
        &mut self,
        donation_id: i64,
        bank_transaction_id: i64,
        actor: &str,
    ) -> Result<()> {
        let donation = self.donation(donation_id)?;
        let bank_tx = self.bank_transaction(bank_transaction_id)?;

        if donation.is_matched() {
            return Err(CrmError::AlreadyMatched {
                side: "donation",
                id: donation_id,
            }
            .into());
        }
        if bank_tx.is_matched() {
            return Err(CrmError::AlreadyMatched {
                side: "bank transaction",
                id: bank_transaction_id,
            }
            .into());
        }

        let sql_tx = self.conn.transaction()?;
        sql_tx.execute(
            "UPDATE donations SET bank_transaction_id = ?1 WHERE id = ?2",
            params![bank_transaction_id, donation_id],
        )?;
        sql_tx.execute(
            "UPDATE bank_transactions SET donation_id = ?1 WHERE id = ?2",
            params![donation_id, bank_transaction_id],
        )?;
        insert_event(
            &sql_tx,
            &Event::new(
                "donation_matched",
                "donation",
                &donation_id.to_string(),
                serde_json::json!({
                    "bank_transaction_id": bank_transaction_id,
                    "donation_amount_cents": donation.amount_cents,
                    "bank_amount_cents": bank_tx.amount_cents,
                }),
                actor,
            ),
        )?;
        sql_tx.commit()?;
        Ok(())
    }

    /// Undo a binding from either side. Clears both cross-references.
    pub fn unmatch_donation(&mut self, donation_id: i64, actor: &str) -> Result<()> {
        let donation = self.donation(donation_id)?;
        let Some(bank_transaction_id) = donation.bank_transaction_id else {
            return Err(CrmError::NotFound {
                entity: "binding for donation",
                id: donation_id,
            }
            .into());
        };

        let sql_tx = self.conn.transaction()?;
        sql_tx.execute(
            "UPDATE donations SET bank_transaction_id = NULL WHERE id = ?1",
            params![donation_id],
        )?;
        sql_tx.execute(
            "UPDATE bank_transactions SET donation_id = NULL WHERE id = ?1",
            params![bank_transaction_id],
        )?;
        insert_event(
            &sql_tx,
            &Event::new(
                "donation_unmatched",
                "donation",
                &donation_id.to_string(),
                serde_json::json!({ "bank_transaction_id": bank_transaction_id }),
                actor,
            ),
        )?;
        sql_tx.commit()?;
        Ok(())
    }

    /// Run the exact-reference pass over one account-period and persist the
    /// resulting bindings. Ambiguities and residuals come back as exceptions;
    /// a binding-invariant violation aborts before anything is written.
    pub fn auto_match_by_reference(
        &mut self,
        bank_account_id: i64,
        period: &Period,
        actor: &str,
    ) -> Result<MatchPlan> {
        let donations = self.donations_in_scope(bank_account_id, period)?;
        let transactions = self.bank_transactions_in_scope(bank_account_id, period)?;
        let plan = plan_exact_matches(&donations, &transactions)?;

        let sql_tx = self.conn.transaction()?;
        for pair in &plan.bindings {
            sql_tx.execute(
                "UPDATE donations SET bank_transaction_id = ?1 WHERE id = ?2",
                params![pair.bank_transaction_id, pair.donation_id],
            )?;
            sql_tx.execute(
                "UPDATE bank_transactions SET donation_id = ?1 WHERE id = ?2",
                params![pair.donation_id, pair.bank_transaction_id],
            )?;
            insert_event(
                &sql_tx,
                &Event::new(
                    "donation_matched",
                    "donation",
                    &pair.donation_id.to_string(),
                    serde_json::json!({
                        "bank_transaction_id": pair.bank_transaction_id,
                        "reference": pair.reference,
                        "amount_cents": pair.amount_cents,
                        "pass": "auto_reference",
                    }),
                    actor,
                ),
            )?;
        }
        for exception in &plan.exceptions {
            if let MatchException::Ambiguous {
                reference,
                amount_cents,
                donation_ids,
                transaction_ids,
            } = exception
            {
                let cause = CrmError::AmbiguousMatch {
                    reference: reference.clone(),
                    donation_candidates: donation_ids.len(),
                    transaction_candidates: transaction_ids.len(),
                };
                insert_event(
                    &sql_tx,
                    &Event::new(
                        "match_exception",
                        "reference",
                        reference,
                        serde_json::json!({
                            "detail": cause.to_string(),
                            "amount_cents": amount_cents,
                            "donation_ids": donation_ids,
                            "transaction_ids": transaction_ids,
                        }),
                        actor,
                    ),
                )?;
            }
        }
        sql_tx.commit()?;
        Ok(plan)
    }

    // ========================================================================
    // SNAPSHOT
    // ========================================================================

    pub fn reconciliation_snapshot(
        &self,
        bank_account_id: i64,
        period: &Period,
    ) -> Result<ReconciliationSnapshot> {
        let donations = self.donations_in_scope(bank_account_id, period)?;
        let transactions = self.bank_transactions_in_scope(bank_account_id, period)?;
        Ok(summarize(period, &donations, &transactions))
    }

    // ========================================================================
    // SCAN FEED
    // ========================================================================

    /// Free-text fields from every reviewable table, shaped for the
    /// sensitivity scanner. Structured columns (ids, dates, amounts) are
    /// deliberately excluded.
    pub fn records_for_scan(&self) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();

        let mut stmt = self.conn.prepare(
            "SELECT id, notes, relationship_manager, created_at FROM donors
             WHERE notes IS NOT NULL ORDER BY id",
        )?;
        let donor_rows = stmt.query_map([], |row| {
            let notes: Option<String> = row.get(1)?;
            Ok(RawRecord {
                source_type: "donor".to_string(),
                table: "donors".to_string(),
                id: row.get(0)?,
                fields: notes
                    .map(|n| vec![("notes".to_string(), n)])
                    .unwrap_or_default(),
                owner: row.get(2)?,
                last_modified: row.get(3)?,
            })
        })?;
        for row in donor_rows {
            records.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, summary, next_step, owner, created_at FROM engagements ORDER BY id",
        )?;
        let engagement_rows = stmt.query_map([], |row| {
            let summary: Option<String> = row.get(1)?;
            let next_step: Option<String> = row.get(2)?;
            let mut fields = Vec::new();
            if let Some(summary) = summary {
                fields.push(("summary".to_string(), summary));
            }
            if let Some(next_step) = next_step {
                fields.push(("next_step".to_string(), next_step));
            }
            Ok(RawRecord {
                source_type: "engagement".to_string(),
                table: "engagements".to_string(),
                id: row.get(0)?,
                fields,
                owner: row.get(3)?,
                last_modified: row.get(4)?,
            })
        })?;
        for row in engagement_rows {
            records.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, notes, created_at FROM donations
             WHERE notes IS NOT NULL ORDER BY id",
        )?;
        let donation_rows = stmt.query_map([], |row| {
            let notes: Option<String> = row.get(1)?;
            Ok(RawRecord {
                source_type: "donation".to_string(),
                table: "donations".to_string(),
                id: row.get(0)?,
                fields: notes
                    .map(|n| vec![("notes".to_string(), n)])
                    .unwrap_or_default(),
                owner: None,
                last_modified: row.get(2)?,
            })
        })?;
        for row in donation_rows {
            records.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, description, owner, created_at FROM campaigns
             WHERE description IS NOT NULL ORDER BY id",
        )?;
        let campaign_rows = stmt.query_map([], |row| {
            let description: Option<String> = row.get(1)?;
            Ok(RawRecord {
                source_type: "campaign".to_string(),
                table: "campaigns".to_string(),
                id: row.get(0)?,
                fields: description
                    .map(|d| vec![("description".to_string(), d)])
                    .unwrap_or_default(),
                owner: row.get(2)?,
                last_modified: row.get(3)?,
            })
        })?;
        for row in campaign_rows {
            records.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, description, reference_code, created_at FROM ledger_entries ORDER BY id",
        )?;
        let ledger_rows = stmt.query_map([], |row| {
            let description: Option<String> = row.get(1)?;
            let reference: Option<String> = row.get(2)?;
            let mut fields = Vec::new();
            if let Some(description) = description {
                fields.push(("description".to_string(), description));
            }
            if let Some(reference) = reference {
                fields.push(("reference_code".to_string(), reference));
            }
            Ok(RawRecord {
                source_type: "ledger_entry".to_string(),
                table: "ledger_entries".to_string(),
                id: row.get(0)?,
                fields,
                owner: None,
                last_modified: row.get(3)?,
            })
        })?;
        for row in ledger_rows {
            records.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT id, description, reference_code, created_at FROM bank_transactions
             ORDER BY id",
        )?;
        let bank_rows = stmt.query_map([], |row| {
            let description: Option<String> = row.get(1)?;
            let reference: Option<String> = row.get(2)?;
            let mut fields = Vec::new();
            if let Some(description) = description {
                fields.push(("description".to_string(), description));
            }
            if let Some(reference) = reference {
                fields.push(("reference_code".to_string(), reference));
            }
            Ok(RawRecord {
                source_type: "bank_transaction".to_string(),
                table: "bank_transactions".to_string(),
                id: row.get(0)?,
                fields,
                owner: None,
                last_modified: row.get(3)?,
            })
        })?;
        for row in bank_rows {
            records.push(row?);
        }

        Ok(records)
    }

    // ========================================================================
    // STATEMENT IMPORT
    // ========================================================================

    /// Import a bank statement CSV into one account. Rows are deduplicated
    /// by idempotency hash, so re-running an import is safe.
    pub fn import_bank_statement_csv(
        &self,
        bank_account_id: i64,
        csv_path: &Path,
    ) -> Result<ImportSummary> {
        let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open statement CSV")?;
        let mut summary = ImportSummary::default();

        for result in rdr.deserialize() {
            let row: BankStatementRow = result.context("Failed to deserialize statement row")?;
            let date = NaiveDate::parse_from_str(&row.date, DATE_FORMAT)
                .with_context(|| format!("Bad statement date '{}'", row.date))?;
            let amount_cents = cents_from_amount(row.amount);
            let reference = row.reference.trim();
            let hash = statement_row_hash(
                bank_account_id,
                date,
                amount_cents,
                &row.description,
                reference,
            );

            let outcome = self.conn.execute(
                "INSERT INTO bank_transactions (
                    bank_account_id, transaction_date, description, amount_cents,
                    reference_code, idempotency_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    bank_account_id,
                    date.format(DATE_FORMAT).to_string(),
                    row.description,
                    amount_cents,
                    if reference.is_empty() {
                        None
                    } else {
                        Some(reference)
                    },
                    hash,
                ],
            );

            match outcome {
                Ok(_) => {
                    summary.inserted += 1;
                    insert_event(
                        &self.conn,
                        &Event::new(
                            "bank_transaction_imported",
                            "bank_transaction",
                            &self.conn.last_insert_rowid().to_string(),
                            serde_json::json!({
                                "bank_account_id": bank_account_id,
                                "amount_cents": amount_cents,
                            }),
                            "statement_importer",
                        ),
                    )?;
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    summary.duplicates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(summary)
    }

    // ========================================================================
    // EVENT LOG
    // ========================================================================

    pub fn events_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY timestamp DESC",
        )?;
        let events = stmt
            .query_map(params![entity_type, entity_id], |row| {
                let timestamp_str: String = row.get(1)?;
                let data_json: String = row.get(5)?;
                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                        .map_err(|_| rusqlite::Error::InvalidQuery)?
                        .with_timezone(&Utc),
                    event_type: row.get(2)?,
                    entity_type: row.get(3)?,
                    entity_id: row.get(4)?,
                    data: serde_json::from_str(&data_json)
                        .map_err(|_| rusqlite::Error::InvalidQuery)?,
                    actor: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;
    Ok(())
}

// ============================================================================
// SCHEMA
// ============================================================================

fn setup_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS donors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            donor_kind TEXT NOT NULL,
            first_name TEXT,
            last_name TEXT,
            organization_name TEXT,
            email TEXT,
            phone TEXT,
            lifecycle_stage TEXT,
            relationship_manager TEXT,
            notes TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS engagements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            donor_id INTEGER NOT NULL REFERENCES donors(id),
            engagement_date TEXT NOT NULL,
            engagement_type TEXT NOT NULL,
            channel TEXT,
            summary TEXT NOT NULL,
            next_step TEXT,
            owner TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            institution TEXT NOT NULL,
            account_number_last4 TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            posted_date TEXT NOT NULL,
            account_code TEXT NOT NULL,
            description TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            reference_code TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS campaigns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            campaign_type TEXT NOT NULL,
            status TEXT NOT NULL,
            owner TEXT,
            start_date TEXT,
            end_date TEXT,
            goal_cents INTEGER NOT NULL DEFAULT 0,
            description TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS donations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            donor_id INTEGER NOT NULL REFERENCES donors(id),
            donation_date TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            stage TEXT NOT NULL,
            probability_percent INTEGER NOT NULL DEFAULT 0,
            campaign_id INTEGER REFERENCES campaigns(id),
            fund TEXT,
            reference_code TEXT,
            bank_account_id INTEGER REFERENCES bank_accounts(id),
            ledger_entry_id INTEGER REFERENCES ledger_entries(id),
            bank_transaction_id INTEGER REFERENCES bank_transactions(id),
            notes TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bank_account_id INTEGER NOT NULL REFERENCES bank_accounts(id),
            transaction_date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            reference_code TEXT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            donation_id INTEGER REFERENCES donations(id),
            ledger_entry_id INTEGER REFERENCES ledger_entries(id),
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_donations_scope
         ON donations(bank_account_id, donation_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_donations_reference ON donations(reference_code)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bank_tx_scope
         ON bank_transactions(bank_account_id, transaction_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

const DONATION_SELECT: &str = "SELECT id, donor_id, donation_date, amount_cents, currency, stage,
        probability_percent, campaign_id, fund, reference_code,
        bank_account_id, ledger_entry_id, bank_transaction_id, notes
 FROM donations";

const BANK_TRANSACTION_SELECT: &str = "SELECT id, bank_account_id, transaction_date, description,
        amount_cents, reference_code, donation_id, ledger_entry_id
 FROM bank_transactions";

fn parse_date(value: &str) -> std::result::Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| rusqlite::Error::InvalidQuery)
}

fn map_donation_row(row: &rusqlite::Row<'_>) -> std::result::Result<Donation, rusqlite::Error> {
    let date_str: String = row.get(2)?;
    let stage_str: String = row.get(5)?;
    Ok(Donation {
        id: row.get(0)?,
        donor_id: row.get(1)?,
        donation_date: parse_date(&date_str)?,
        amount_cents: row.get(3)?,
        currency: row.get(4)?,
        stage: GiftStage::parse(&stage_str).ok_or(rusqlite::Error::InvalidQuery)?,
        probability_percent: row.get(6)?,
        campaign_id: row.get(7)?,
        fund: row.get(8)?,
        reference_code: row.get(9)?,
        bank_account_id: row.get(10)?,
        ledger_entry_id: row.get(11)?,
        bank_transaction_id: row.get(12)?,
        notes: row.get(13)?,
    })
}

fn map_bank_transaction_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<BankTransaction, rusqlite::Error> {
    let date_str: String = row.get(2)?;
    Ok(BankTransaction {
        id: row.get(0)?,
        bank_account_id: row.get(1)?,
        transaction_date: parse_date(&date_str)?,
        description: row.get(3)?,
        amount_cents: row.get(4)?,
        reference_code: row.get(5)?,
        donation_id: row.get(6)?,
        ledger_entry_id: row.get(7)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_with_account() -> (CrmStore, i64, i64) {
        let store = CrmStore::open_in_memory().unwrap();
        let donor_id = store
            .add_donor(&NewDonor {
                first_name: Some("Maya".to_string()),
                last_name: Some("Okafor".to_string()),
                ..Default::default()
            })
            .unwrap();
        let account_id = store
            .add_bank_account("Operating", "First Community Bank", "4821", "USD")
            .unwrap();
        (store, donor_id, account_id)
    }

    fn feb(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, day).unwrap()
    }

    #[test]
    fn test_donor_validation() {
        let store = CrmStore::open_in_memory().unwrap();

        let err = store.add_donor(&NewDonor::default()).unwrap_err();
        assert!(err.to_string().contains("first and a last name"));

        let id = store
            .add_donor(&NewDonor {
                organization_name: Some("Riverside Foundation".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(id > 0);
    }

    #[test]
    fn test_donation_requires_positive_amount() {
        let (store, donor_id, account_id) = store_with_account();
        let err = store
            .add_donation(&NewDonation::posted(donor_id, feb(5), 0, None, Some(account_id)))
            .unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_manual_match_updates_both_sides_and_logs() {
        let (mut store, donor_id, account_id) = store_with_account();
        let donation_id = store
            .add_donation(&NewDonation::posted(
                donor_id,
                feb(10),
                50000,
                Some("WIRE-77"),
                Some(account_id),
            ))
            .unwrap();
        let tx_id = store
            .add_bank_transaction(&NewBankTransaction {
                bank_account_id: account_id,
                transaction_date: feb(11),
                description: "Incoming wire".to_string(),
                amount_cents: 49500, // manual pairing tolerates an amount gap
                reference_code: None,
            })
            .unwrap();

        store
            .match_donation_to_bank_transaction(donation_id, tx_id, "treasurer")
            .unwrap();

        let donation = store.donation(donation_id).unwrap();
        let bank_tx = store.bank_transaction(tx_id).unwrap();
        assert_eq!(donation.bank_transaction_id, Some(tx_id));
        assert_eq!(bank_tx.donation_id, Some(donation_id));

        let events = store
            .events_for_entity("donation", &donation_id.to_string())
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "donation_matched");
        assert_eq!(events[0].actor, "treasurer");
    }

    #[test]
    fn test_match_rejects_already_bound_sides() {
        let (mut store, donor_id, account_id) = store_with_account();
        let d1 = store
            .add_donation(&NewDonation::posted(donor_id, feb(10), 10000, None, Some(account_id)))
            .unwrap();
        let d2 = store
            .add_donation(&NewDonation::posted(donor_id, feb(12), 10000, None, Some(account_id)))
            .unwrap();
        let tx_id = store
            .add_bank_transaction(&NewBankTransaction {
                bank_account_id: account_id,
                transaction_date: feb(13),
                description: "ACH credit".to_string(),
                amount_cents: 10000,
                reference_code: None,
            })
            .unwrap();

        store
            .match_donation_to_bank_transaction(d1, tx_id, "treasurer")
            .unwrap();
        let err = store
            .match_donation_to_bank_transaction(d2, tx_id, "treasurer")
            .unwrap_err();
        match err.downcast_ref::<CrmError>() {
            Some(CrmError::AlreadyMatched { side, id }) => {
                assert_eq!(*side, "bank transaction");
                assert_eq!(*id, tx_id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unmatch_round_trip() {
        let (mut store, donor_id, account_id) = store_with_account();
        let donation_id = store
            .add_donation(&NewDonation::posted(donor_id, feb(10), 25000, None, Some(account_id)))
            .unwrap();
        let tx_id = store
            .add_bank_transaction(&NewBankTransaction {
                bank_account_id: account_id,
                transaction_date: feb(10),
                description: "Check deposit".to_string(),
                amount_cents: 25000,
                reference_code: None,
            })
            .unwrap();

        store
            .match_donation_to_bank_transaction(donation_id, tx_id, "treasurer")
            .unwrap();
        store.unmatch_donation(donation_id, "treasurer").unwrap();

        assert!(!store.donation(donation_id).unwrap().is_matched());
        assert!(!store.bank_transaction(tx_id).unwrap().is_matched());

        // Rematching restores the original binding state.
        store
            .match_donation_to_bank_transaction(donation_id, tx_id, "treasurer")
            .unwrap();
        assert_eq!(
            store.donation(donation_id).unwrap().bank_transaction_id,
            Some(tx_id)
        );
        assert_eq!(
            store.bank_transaction(tx_id).unwrap().donation_id,
            Some(donation_id)
        );

        store.unmatch_donation(donation_id, "treasurer").unwrap();
        // Unmatching again has nothing to undo.
        assert!(store.unmatch_donation(donation_id, "treasurer").is_err());
    }

    #[test]
    fn test_auto_match_persists_unique_pairs_and_reports_ambiguity() {
        let (mut store, donor_id, account_id) = store_with_account();
        let period = Period::new(2026, 2).unwrap();

        let wire_gift = store
            .add_donation(&NewDonation::posted(
                donor_id,
                feb(10),
                50000,
                Some("WIRE-77"),
                Some(account_id),
            ))
            .unwrap();
        store
            .add_donation(&NewDonation::posted(
                donor_id,
                feb(15),
                25000,
                Some("CHK-1002"),
                Some(account_id),
            ))
            .unwrap();

        for (day, reference) in [(11, "WIRE-77"), (16, "CHK-1002"), (17, "CHK-1002")] {
            store
                .add_bank_transaction(&NewBankTransaction {
                    bank_account_id: account_id,
                    transaction_date: feb(day),
                    description: format!("Deposit ref {reference}"),
                    amount_cents: if reference == "WIRE-77" { 50000 } else { 25000 },
                    reference_code: Some(reference.to_string()),
                })
                .unwrap();
        }

        let plan = store
            .auto_match_by_reference(account_id, &period, "nightly")
            .unwrap();

        assert_eq!(plan.bindings.len(), 1);
        assert_eq!(plan.bindings[0].donation_id, wire_gift);
        assert_eq!(plan.ambiguous_count(), 1);
        assert!(store.donation(wire_gift).unwrap().is_matched());

        // A second run finds nothing left to bind and the same ambiguity.
        let rerun = store
            .auto_match_by_reference(account_id, &period, "nightly")
            .unwrap();
        assert!(rerun.bindings.is_empty());
        assert_eq!(rerun.ambiguous_count(), 1);
    }

    #[test]
    fn test_snapshot_over_store_state() {
        let (mut store, donor_id, account_id) = store_with_account();
        let period = Period::new(2026, 2).unwrap();

        store
            .add_donation(&NewDonation::posted(
                donor_id,
                feb(10),
                50000,
                Some("WIRE-77"),
                Some(account_id),
            ))
            .unwrap();
        store
            .add_bank_transaction(&NewBankTransaction {
                bank_account_id: account_id,
                transaction_date: feb(11),
                description: "Incoming wire".to_string(),
                amount_cents: 50000,
                reference_code: Some("WIRE-77".to_string()),
            })
            .unwrap();
        store
            .auto_match_by_reference(account_id, &period, "nightly")
            .unwrap();

        let snapshot = store.reconciliation_snapshot(account_id, &period).unwrap();
        assert_eq!(snapshot.matched_total_cents, 50000);
        assert_eq!(snapshot.variance_cents, 0);
        assert!((snapshot.completion - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_amount_frozen_after_posting() {
        let (store, donor_id, account_id) = store_with_account();
        let committed = store
            .add_donation(&NewDonation {
                stage: GiftStage::Committed,
                probability_percent: 80,
                ..NewDonation::posted(donor_id, feb(5), 40000, None, Some(account_id))
            })
            .unwrap();

        store.update_donation_amount(committed, 45000).unwrap();
        assert_eq!(store.donation(committed).unwrap().amount_cents, 45000);

        store
            .update_gift_stage(committed, GiftStage::Posted, 100)
            .unwrap();
        let err = store.update_donation_amount(committed, 50000).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CrmError>(),
            Some(CrmError::AmountImmutable { .. })
        ));
    }

    #[test]
    fn test_stage_update_clamps_probability() {
        let (store, donor_id, account_id) = store_with_account();
        let donation_id = store
            .add_donation(&NewDonation::posted(donor_id, feb(5), 40000, None, Some(account_id)))
            .unwrap();

        store
            .update_gift_stage(donation_id, GiftStage::Committed, 250)
            .unwrap();
        assert_eq!(store.donation(donation_id).unwrap().probability_percent, 100);

        assert!(store
            .update_gift_stage(999, GiftStage::Lost, 0)
            .is_err());
    }

    #[test]
    fn test_statement_import_is_idempotent() {
        let (store, _donor_id, account_id) = store_with_account();

        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("statement.csv");
        let mut file = std::fs::File::create(&csv_path).unwrap();
        writeln!(file, "Date,Description,Amount,Reference").unwrap();
        writeln!(file, "2026-02-11,Incoming wire,500.00,WIRE-77").unwrap();
        writeln!(file, "2026-02-16,Check deposit,250.00,CHK-1002").unwrap();
        drop(file);

        let first = store
            .import_bank_statement_csv(account_id, &csv_path)
            .unwrap();
        assert_eq!(first, ImportSummary { inserted: 2, duplicates: 0 });

        let second = store
            .import_bank_statement_csv(account_id, &csv_path)
            .unwrap();
        assert_eq!(second, ImportSummary { inserted: 0, duplicates: 2 });

        let period = Period::new(2026, 2).unwrap();
        let transactions = store
            .bank_transactions_in_scope(account_id, &period)
            .unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].amount_cents, 50000);
        assert_eq!(transactions[0].reference_code.as_deref(), Some("WIRE-77"));
    }

    #[test]
    fn test_records_for_scan_skips_structured_only_rows() {
        let (store, donor_id, account_id) = store_with_account();

        // Donor has no notes: nothing to scan there.
        store
            .add_engagement(&NewEngagement {
                donor_id,
                engagement_date: feb(18),
                engagement_type: "call".to_string(),
                channel: Some("phone".to_string()),
                summary: "Spoke about the matching pledge".to_string(),
                next_step: Some("Send receipt".to_string()),
                owner: Some("A. Jordan".to_string()),
            })
            .unwrap();
        store
            .add_donation(&NewDonation {
                notes: Some("Donor asked to route through the hospital fund".to_string()),
                ..NewDonation::posted(donor_id, feb(10), 50000, None, Some(account_id))
            })
            .unwrap();

        let records = store.records_for_scan().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_type, "engagement");
        assert_eq!(records[0].fields.len(), 2);
        assert_eq!(records[1].source_type, "donation");
        assert_eq!(records[1].fields[0].0, "notes");
    }

    #[test]
    fn test_ledger_and_bank_text_feed_the_scan() {
        let (store, _donor_id, account_id) = store_with_account();

        store
            .add_ledger_entry(&NewLedgerEntry {
                posted_date: feb(12),
                account_code: "4000".to_string(),
                description: "Patient MRN: A-493021 dialysis treatment".to_string(),
                amount_cents: 50000,
                reference_code: Some("WIRE-77".to_string()),
            })
            .unwrap();
        store
            .add_bank_transaction(&NewBankTransaction {
                bank_account_id: account_id,
                transaction_date: feb(12),
                description: "Wire from clinic billing office".to_string(),
                amount_cents: 50000,
                reference_code: Some("WIRE-77".to_string()),
            })
            .unwrap();

        let records = store.records_for_scan().unwrap();

        let ledger = records
            .iter()
            .find(|r| r.table == "ledger_entries")
            .expect("ledger entry record");
        assert_eq!(ledger.source_type, "ledger_entry");
        assert_eq!(
            ledger.fields[0],
            (
                "description".to_string(),
                "Patient MRN: A-493021 dialysis treatment".to_string()
            )
        );

        let bank = records
            .iter()
            .find(|r| r.table == "bank_transactions")
            .expect("bank transaction record");
        assert!(bank
            .fields
            .iter()
            .any(|(name, value)| name == "description" && value.contains("clinic")));
    }
}
