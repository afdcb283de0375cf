use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use arp_backfill::{
    build_lag_adjustments, log_run_start, log_task_finish, log_task_selected,
    restore_missing_bid_budgets, restore_missing_cohorts, BackfillConfig, BackfillTask,
    BackfillWindow, CellValue, ChangeHistoryRow, CohortTableLayout, ColumnType,
    CurrentBidBudgetRow, EntityId, LagBucketMapping, LagCurveBuilder, LagCurveConfig,
    LagReportRow, LoggingConfig, MissingSnapshotMarker, PartitionStore, RecordColumn, RecordTable,
    ReportSource, SnapshotPartitionIndex, SqlitePartitionStore, StoreError, WritePolicy,
};
use chrono::NaiveDate;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).expect("valid test date")
}

/// Lists a stale partition index so every write lands on an existing table.
struct StaleIndexStore;

impl PartitionStore for StaleIndexStore {
    fn list_partitions(&self, _family: &str) -> Result<SnapshotPartitionIndex, StoreError> {
        Ok(SnapshotPartitionIndex::new([date(2)]))
    }

    fn write_table(
        &mut self,
        destination: &str,
        _table: &RecordTable,
        _policy: WritePolicy,
    ) -> Result<(), StoreError> {
        Err(StoreError::Conflict {
            destination: destination.to_string(),
        })
    }

    fn execute(&mut self, _sql: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn read_missing_marker(
        &self,
        _table: &str,
    ) -> Result<Option<MissingSnapshotMarker>, StoreError> {
        Ok(None)
    }
}

struct EmptyReports;

impl ReportSource for EmptyReports {
    fn change_history(
        &self,
        _window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<ChangeHistoryRow>, StoreError> {
        Ok(Vec::new())
    }

    fn campaigns_with_activity(
        &self,
        _window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<EntityId>, StoreError> {
        Ok(vec![7])
    }

    fn current_bid_budgets_active(
        &self,
        _accounts: &[String],
    ) -> Result<Vec<CurrentBidBudgetRow>, StoreError> {
        Ok(vec![CurrentBidBudgetRow {
            campaign_id: 7,
            budget_amount: Some(15.0),
            target_cpa: Some(4.0),
            target_roas: Some(2.5),
        }])
    }

    fn current_bid_budgets_inactive(
        &self,
        _window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<CurrentBidBudgetRow>, StoreError> {
        Ok(Vec::new())
    }

    fn conversion_lags(
        &self,
        _window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<LagReportRow>, StoreError> {
        Ok(Vec::new())
    }
}

#[test]
fn bid_budget_conflicts_are_logged_as_warnings() {
    let window = BackfillWindow::new(date(1), date(3)).unwrap();
    let logs = capture_logs(Level::WARN, || {
        let outcome =
            restore_missing_bid_budgets(&EmptyReports, &mut StaleIndexStore, &window, &[])
                .expect("conflicts should not abort the run");
        let report = outcome.completed().expect("missing days should be attempted");
        assert_eq!(
            report.conflicts,
            vec!["bid_budgets_20240101", "bid_budgets_20240103"]
        );
        assert!(report.written.is_empty());
    });

    assert!(logs.contains("\"event\":\"backfill.bid_budgets.partition_conflict\""));
    assert!(logs.contains("\"level\":\"WARN\""));
    assert!(!logs.contains("partition_written"));
}

#[test]
fn cohort_backfill_logs_gap_report_and_writes() {
    let mut store = SqlitePartitionStore::open_in_memory().unwrap();
    let mut table = RecordTable::new(vec![
        RecordColumn::new("day_of_interaction", ColumnType::Date),
        RecordColumn::new("lag", ColumnType::Integer),
    ]);
    table
        .push_row(vec![CellValue::Date(date(1)), CellValue::Integer(0)])
        .unwrap();
    for name in ["cohorts_20240101", "cohorts_20240103"] {
        store
            .write_table(name, &table, WritePolicy::CreateIfAbsent)
            .unwrap();
    }
    let layout = CohortTableLayout {
        family: "cohorts".to_string(),
        lag_column: "lag".to_string(),
        columns: vec!["day_of_interaction".to_string(), "lag".to_string()],
    };

    let logs = capture_logs(Level::INFO, || {
        let outcome = restore_missing_cohorts(&mut store, &layout).unwrap();
        assert_eq!(outcome.completed().map(|r| r.written.len()), Some(1));
    });

    assert!(logs.contains("\"event\":\"gaps.locate.finish\""));
    assert!(logs.contains("\"event\":\"backfill.cohorts.partition_written\""));
    assert!(logs.contains("cohorts_20240102"));
}

/// Hides one existing partition from the listing of a real SQLite store.
struct HiddenPartitionStore {
    inner: SqlitePartitionStore,
    hidden: NaiveDate,
}

impl PartitionStore for HiddenPartitionStore {
    fn list_partitions(&self, family: &str) -> Result<SnapshotPartitionIndex, StoreError> {
        let index = self.inner.list_partitions(family)?;
        Ok(SnapshotPartitionIndex::new(
            index.dates().iter().copied().filter(|day| *day != self.hidden),
        ))
    }

    fn write_table(
        &mut self,
        destination: &str,
        table: &RecordTable,
        policy: WritePolicy,
    ) -> Result<(), StoreError> {
        self.inner.write_table(destination, table, policy)
    }

    fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        self.inner.execute(sql)
    }

    fn read_missing_marker(
        &self,
        table: &str,
    ) -> Result<Option<MissingSnapshotMarker>, StoreError> {
        self.inner.read_missing_marker(table)
    }
}

#[test]
fn cohort_conflicts_are_logged_as_warnings() {
    let mut inner = SqlitePartitionStore::open_in_memory().unwrap();
    let mut table = RecordTable::new(vec![
        RecordColumn::new("day_of_interaction", ColumnType::Date),
        RecordColumn::new("lag", ColumnType::Integer),
    ]);
    table
        .push_row(vec![CellValue::Date(date(1)), CellValue::Integer(0)])
        .unwrap();
    for name in ["cohorts_20240101", "cohorts_20240102", "cohorts_20240104"] {
        inner
            .write_table(name, &table, WritePolicy::CreateIfAbsent)
            .unwrap();
    }
    let mut store = HiddenPartitionStore {
        inner,
        hidden: date(2),
    };
    let layout = CohortTableLayout {
        family: "cohorts".to_string(),
        lag_column: "lag".to_string(),
        columns: vec!["day_of_interaction".to_string(), "lag".to_string()],
    };

    let logs = capture_logs(Level::INFO, || {
        let outcome = restore_missing_cohorts(&mut store, &layout)
            .expect("conflicts should not abort the run");
        let report = outcome.completed().expect("gaps should be attempted");
        assert_eq!(report.conflicts, vec!["cohorts_20240102"]);
        assert_eq!(report.written, vec!["cohorts_20240103"]);
    });

    assert!(logs.contains("\"event\":\"backfill.cohorts.partition_conflict\""));
    assert!(logs.contains("\"level\":\"WARN\""));
    assert!(logs.contains("\"event\":\"backfill.cohorts.finish\""));
}

#[test]
fn empty_lag_report_logs_placeholder_warning() {
    let window = BackfillWindow::new(date(1), date(3)).unwrap();
    let builder = LagCurveBuilder::new(
        LagBucketMapping::embedded().unwrap(),
        LagCurveConfig::default(),
    );
    let mut store = SqlitePartitionStore::open_in_memory().unwrap();

    let logs = capture_logs(Level::INFO, || {
        let report =
            build_lag_adjustments(&EmptyReports, &mut store, &builder, &window, &[]).unwrap();
        assert!(report.placeholder);
    });

    assert!(logs.contains("\"event\":\"lag_curve.build.placeholder\""));
    assert!(logs.contains("\"event\":\"backfill.lag_adjustments.written\""));
}

#[test]
fn run_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        log_run_start(
            "backfill_snapshots",
            &LoggingConfig::default(),
            &BackfillConfig::default(),
        );
        log_task_selected(BackfillTask::Cohorts, Some("ARP_BACKFILL_TASKS"));
        log_task_finish("cohorts", "skipped");
    });

    assert!(logs.contains("\"event\":\"run.start\""));
    assert!(logs.contains("\"event\":\"task.selected\""));
    assert!(logs.contains("\"task\":\"cohorts\""));
    assert!(logs.contains("\"event\":\"task.finish\""));
}
