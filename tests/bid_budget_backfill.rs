use std::fs;
use std::path::Path;

use arp_backfill::{
    restore_missing_bid_budgets, BackfillOutcome, BackfillWindow, CsvReportSource,
    PartitionStore, RecordTable, SkipReason, SqlitePartitionStore, WritePolicy,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use tempfile::TempDir;

const CHANGE_HISTORY: &str = "\
change_date,campaign_id,old_budget_amount,new_budget_amount,old_target_cpa,new_target_cpa,old_target_roas,new_target_roas
2024-01-02 09:15:00,1,10,20,,,,
2024-01-02 17:40:00.250000,2,,,20,10,,
2023-12-20 08:00:00,1,5,10,,,,
";

const CAMPAIGNS: &str = "campaign_id\n1\n2\n";

const ACTIVE: &str = "\
campaign_id,budget_amount,target_cpa,target_roas
1,20,10,
2,20,10,
";

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).expect("valid test date")
}

fn write_reports(dir: &Path, include_history: bool) {
    if include_history {
        fs::write(dir.join("change_history.csv"), CHANGE_HISTORY).unwrap();
    }
    fs::write(dir.join("campaigns.csv"), CAMPAIGNS).unwrap();
    fs::write(dir.join("current_bid_budgets_active.csv"), ACTIVE).unwrap();
}

fn seed_partition(store: &mut SqlitePartitionStore, name: &str) {
    store
        .write_table(name, &RecordTable::from_bid_budgets(&[]), WritePolicy::CreateIfAbsent)
        .unwrap();
}

fn read_partition(path: &Path, table: &str) -> Vec<(String, i64, i64, i64, Option<f64>)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(&format!(
            "SELECT day, campaign_id, budget_amount, target_cpa, target_roas FROM `{table}` ORDER BY campaign_id"
        ))
        .unwrap();
    stmt.query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    })
    .unwrap()
    .collect::<Result<Vec<_>, _>>()
    .unwrap()
}

#[test]
fn restores_only_missing_days_from_change_history() {
    let tmp = TempDir::new().unwrap();
    let reports = tmp.path().join("reports");
    fs::create_dir_all(&reports).unwrap();
    write_reports(&reports, true);
    let store_path = tmp.path().join("warehouse/arp.sqlite");

    let mut store = SqlitePartitionStore::open(&store_path).unwrap();
    seed_partition(&mut store, "bid_budgets_20240102");

    let source = CsvReportSource::new(&reports);
    let window = BackfillWindow::new(date(1), date(3)).unwrap();
    let outcome = restore_missing_bid_budgets(&source, &mut store, &window, &[]).unwrap();

    let report = outcome.completed().expect("backfill should complete");
    assert_eq!(report.missing_days, vec![date(1), date(3)]);
    assert_eq!(report.campaigns, 2);
    assert_eq!(
        report.written,
        vec!["bid_budgets_20240101", "bid_budgets_20240103"]
    );

    // Day 1 precedes both changes: the old values apply.
    assert_eq!(
        read_partition(&store_path, "bid_budgets_20240101"),
        vec![
            ("2024-01-01".to_string(), 1, 10, 10, None),
            ("2024-01-01".to_string(), 2, 20, 20, None),
        ]
    );
    assert_eq!(
        read_partition(&store_path, "bid_budgets_20240103"),
        vec![
            ("2024-01-03".to_string(), 1, 20, 10, None),
            ("2024-01-03".to_string(), 2, 20, 10, None),
        ]
    );
    // The pre-existing partition is untouched.
    assert!(read_partition(&store_path, "bid_budgets_20240102").is_empty());
}

#[test]
fn rerun_after_backfill_has_nothing_to_do() {
    let tmp = TempDir::new().unwrap();
    write_reports(tmp.path(), true);
    let store_path = tmp.path().join("arp.sqlite");
    let mut store = SqlitePartitionStore::open(&store_path).unwrap();
    seed_partition(&mut store, "bid_budgets_20240103");

    let source = CsvReportSource::new(tmp.path());
    let window = BackfillWindow::new(date(1), date(3)).unwrap();

    let first = restore_missing_bid_budgets(&source, &mut store, &window, &[]).unwrap();
    assert_eq!(first.completed().map(|report| report.written.len()), Some(2));

    let second = restore_missing_bid_budgets(&source, &mut store, &window, &[]).unwrap();
    assert_eq!(second, BackfillOutcome::Skipped(SkipReason::NothingMissing));
}

#[test]
fn skips_without_partitions_or_change_history() {
    let tmp = TempDir::new().unwrap();
    write_reports(tmp.path(), false);
    let source = CsvReportSource::new(tmp.path());
    let window = BackfillWindow::new(date(1), date(3)).unwrap();

    let mut empty_store = SqlitePartitionStore::open_in_memory().unwrap();
    let outcome = restore_missing_bid_budgets(&source, &mut empty_store, &window, &[]).unwrap();
    assert!(matches!(
        outcome,
        BackfillOutcome::Skipped(SkipReason::SourceMissing { ref name }) if name == "bid_budgets_*"
    ));

    let mut store = SqlitePartitionStore::open_in_memory().unwrap();
    seed_partition(&mut store, "bid_budgets_20240102");
    let outcome = restore_missing_bid_budgets(&source, &mut store, &window, &[]).unwrap();
    match outcome {
        BackfillOutcome::Skipped(SkipReason::SourceMissing { name }) => {
            assert!(name.ends_with("change_history.csv"));
        }
        other => panic!("expected skip for missing change history, got {other:?}"),
    }
    assert_eq!(store.list_partitions("bid_budgets").unwrap().len(), 1);
}

#[test]
fn campaign_without_any_budget_fails_the_run() {
    let tmp = TempDir::new().unwrap();
    write_reports(tmp.path(), true);
    fs::write(tmp.path().join("campaigns.csv"), "campaign_id\n1\n2\n3\n").unwrap();

    let mut store = SqlitePartitionStore::open_in_memory().unwrap();
    seed_partition(&mut store, "bid_budgets_20240102");
    let source = CsvReportSource::new(tmp.path());
    let window = BackfillWindow::new(date(1), date(3)).unwrap();

    let err = restore_missing_bid_budgets(&source, &mut store, &window, &[]).unwrap_err();
    assert!(err.to_string().contains("budget_amount of entity 3"), "unexpected error: {err}");
    assert_eq!(store.list_partitions("bid_budgets").unwrap().len(), 1);
}
