use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use donorledger::{
    format_currency, CrmStore, MatchException, Period, RuleSet, SensitivityScanner,
    write_findings_file,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => run_init(),
        Some("import") => run_import(&args[2..]),
        Some("scan") => run_scan(&args[2..]),
        Some("auto-match") => run_auto_match(&args[2..]),
        Some("snapshot") => run_snapshot(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("DonorLedger - fundraising CRM core");
    println!();
    println!("Usage:");
    println!("  donorledger init");
    println!("  donorledger import <account-id> <statement.csv>");
    println!("  donorledger scan [--csv PATH]");
    println!("  donorledger auto-match <account-id> <YYYY-MM>");
    println!("  donorledger snapshot <account-id> <YYYY-MM>");
}

fn db_path() -> PathBuf {
    env::var("DONORLEDGER_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("donorledger.db"))
}

fn open_store() -> Result<CrmStore> {
    CrmStore::open(&db_path())
}

fn parse_account(arg: Option<&String>) -> Result<i64> {
    let value = arg.context("missing <account-id>")?;
    value
        .parse()
        .with_context(|| format!("'{value}' is not an account id"))
}

fn parse_period(arg: Option<&String>) -> Result<Period> {
    let value = arg.context("missing <YYYY-MM> period")?;
    match Period::parse(value) {
        Some(period) => Ok(period),
        None => bail!("'{value}' is not a YYYY-MM period"),
    }
}

fn run_init() -> Result<()> {
    let path = db_path();
    CrmStore::open(&path)?;
    println!("✓ Database initialized at {} (WAL mode)", path.display());
    Ok(())
}

fn run_import(args: &[String]) -> Result<()> {
    let account_id = parse_account(args.first())?;
    let csv_path = args.get(1).context("missing <statement.csv>")?;

    let store = open_store()?;
    let summary = store.import_bank_statement_csv(account_id, Path::new(csv_path))?;

    println!("✓ Inserted: {} transactions", summary.inserted);
    println!("✓ Skipped duplicates: {}", summary.duplicates);
    Ok(())
}

fn run_scan(args: &[String]) -> Result<()> {
    let csv_out = match args.first().map(String::as_str) {
        Some("--csv") => Some(args.get(1).context("--csv needs a PATH")?.clone()),
        Some(other) => bail!("unknown scan option '{other}'"),
        None => None,
    };

    let store = open_store()?;
    let records = store.records_for_scan()?;
    let scanner = SensitivityScanner::new(RuleSet::builtin());
    let outcome = scanner.scan_raw_records(&records);

    println!(
        "Scanned {} records: {} findings, {} skipped",
        records.len(),
        outcome.findings.len(),
        outcome.skipped.len()
    );
    for finding in &outcome.findings {
        println!(
            "  [{}] {} in {} {} ({:.2}): {}",
            finding.severity.as_str(),
            finding.detector.as_str(),
            finding.source_type,
            finding.source_id,
            finding.confidence,
            finding.snippet,
        );
    }
    for skipped in &outcome.skipped {
        println!("  (skipped) {skipped}");
    }

    if let Some(path) = csv_out {
        write_findings_file(Path::new(&path), &outcome.findings)?;
        println!("✓ Findings written to {path}");
    }
    Ok(())
}

fn run_auto_match(args: &[String]) -> Result<()> {
    let account_id = parse_account(args.first())?;
    let period = parse_period(args.get(1))?;

    let mut store = open_store()?;
    let plan = store.auto_match_by_reference(account_id, &period, "cli")?;

    println!("✓ Matched: {} pairs", plan.bindings.len());
    for pair in &plan.bindings {
        println!(
            "  donation {} <-> bank transaction {} ({}, {})",
            pair.donation_id,
            pair.bank_transaction_id,
            pair.reference,
            format_currency(pair.amount_cents),
        );
    }
    for exception in &plan.exceptions {
        match exception {
            MatchException::Ambiguous {
                reference,
                amount_cents,
                donation_ids,
                transaction_ids,
            } => println!(
                "  ! ambiguous '{}' at {}: {} donation(s), {} transaction(s)",
                reference,
                format_currency(*amount_cents),
                donation_ids.len(),
                transaction_ids.len(),
            ),
            MatchException::UnmatchedDonation { donation_id } => {
                println!("  ! unmatched donation {donation_id}")
            }
            MatchException::UnmatchedTransaction { bank_transaction_id } => {
                println!("  ! unmatched bank transaction {bank_transaction_id}")
            }
        }
    }
    Ok(())
}

fn run_snapshot(args: &[String]) -> Result<()> {
    let account_id = parse_account(args.first())?;
    let period = parse_period(args.get(1))?;

    let store = open_store()?;
    let snapshot = store.reconciliation_snapshot(account_id, &period)?;

    println!("Reconciliation snapshot for account {account_id}, {}", snapshot.period);
    println!(
        "  Gifts: {} totaling {}",
        snapshot.gift_count,
        format_currency(snapshot.gift_total_cents)
    );
    println!(
        "  Bank:  {} totaling {}",
        snapshot.bank_count,
        format_currency(snapshot.bank_total_cents)
    );
    println!(
        "  Matched: {} totaling {}",
        snapshot.matched_count,
        format_currency(snapshot.matched_total_cents)
    );
    println!(
        "  Unmatched: {} gifts, {} bank transactions",
        snapshot.unmatched_gift_count, snapshot.unmatched_bank_count
    );
    println!("  Variance: {}", format_currency(snapshot.variance_cents));
    println!("  Completion: {:.1}%", snapshot.completion * 100.0);
    Ok(())
}
