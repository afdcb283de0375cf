//! Report sources and dated-partition storage.
//!
//! `ReportSource` and `PartitionStore` are the seams to the ads reporting API
//! and the warehouse. The bundled implementations read reports from a
//! directory of CSV exports and keep partitions as SQLite tables named
//! `<family>_<YYYYMMDD>`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::change_events::{parse_change_timestamp, ChangeHistoryRow};
use crate::gaps::{
    missing_marker_table, parse_partition_name, MissingSnapshotMarker, SnapshotPartitionIndex,
};
use crate::grid::{BackfillWindow, EntityId};
use crate::history::{BidBudgetRow, CurrentBidBudgetRow};
use crate::lag_curve::{LagAdjustmentCurve, LagReportRow};

pub const CHANGE_HISTORY_FILE: &str = "change_history.csv";
pub const CAMPAIGNS_FILE: &str = "campaigns.csv";
pub const ACTIVE_BID_BUDGETS_FILE: &str = "current_bid_budgets_active.csv";
pub const INACTIVE_BID_BUDGETS_FILE: &str = "current_bid_budgets_inactive.csv";
pub const CONVERSION_LAGS_FILE: &str = "conversion_lags.csv";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {name}")]
    NotFound { name: String },
    #[error("destination already exists: {destination}")]
    Conflict { destination: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid report data: {0}")]
    InvalidData(String),
    #[error("invalid table name '{0}'")]
    InvalidTableName(String),
    #[error("row has {found} values, table has {expected} columns")]
    RowArity { expected: usize, found: usize },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// How a write treats an existing destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritePolicy {
    /// Fail with `StoreError::Conflict` if the destination exists.
    CreateIfAbsent,
    /// Replace the destination.
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Date,
}

impl ColumnType {
    fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text | Self::Date => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordColumn {
    pub name: String,
    pub column_type: ColumnType,
}

impl RecordColumn {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Date(NaiveDate),
}

impl ToSql for CellValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Self::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Date(day) => ToSqlOutput::Owned(Value::Text(day.format("%Y-%m-%d").to_string())),
        })
    }
}

/// Column-typed table handed to a `PartitionStore`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordTable {
    columns: Vec<RecordColumn>,
    rows: Vec<Vec<CellValue>>,
}

impl RecordTable {
    pub fn new(columns: Vec<RecordColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<CellValue>) -> Result<(), StoreError> {
        if row.len() != self.columns.len() {
            return Err(StoreError::RowArity {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[RecordColumn] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn from_bid_budgets(rows: &[BidBudgetRow]) -> Self {
        let mut table = Self::new(vec![
            RecordColumn::new("day", ColumnType::Date),
            RecordColumn::new("campaign_id", ColumnType::Integer),
            RecordColumn::new("budget_amount", ColumnType::Integer),
            RecordColumn::new("target_cpa", ColumnType::Integer),
            RecordColumn::new("target_roas", ColumnType::Real),
        ]);
        table.rows = rows
            .iter()
            .map(|row| {
                vec![
                    CellValue::Date(row.day),
                    CellValue::Integer(row.campaign_id),
                    CellValue::Integer(row.budget_amount),
                    CellValue::Integer(row.target_cpa),
                    row.target_roas.map(CellValue::Real).unwrap_or(CellValue::Null),
                ]
            })
            .collect();
        table
    }

    pub fn from_lag_curve(curve: &LagAdjustmentCurve) -> Self {
        let mut columns: Vec<RecordColumn> = curve
            .group_by
            .iter()
            .map(|name| RecordColumn::new(name, ColumnType::Text))
            .collect();
        columns.push(RecordColumn::new("lag_day", ColumnType::Integer));
        columns.push(RecordColumn::new("lag_adjustment", ColumnType::Real));

        let mut table = Self::new(columns);
        table.rows = curve
            .points
            .iter()
            .map(|point| {
                let mut row: Vec<CellValue> = point
                    .group_key
                    .iter()
                    .map(|value| CellValue::Text(value.clone()))
                    .collect();
                row.push(CellValue::Integer(i64::from(point.lag_day)));
                row.push(CellValue::Real(point.lag_adjustment));
                row
            })
            .collect();
        table
    }
}

/// Read side of the ads reporting API.
///
/// Every method may return `StoreError::NotFound` when the backing dataset
/// does not exist yet; callers treat that as nothing to backfill.
pub trait ReportSource {
    fn change_history(
        &self,
        window: &BackfillWindow,
        accounts: &[String],
    ) -> Result<Vec<ChangeHistoryRow>, StoreError>;

    /// Campaigns with impressions inside the window.
    fn campaigns_with_activity(
        &self,
        window: &BackfillWindow,
        accounts: &[String],
    ) -> Result<Vec<EntityId>, StoreError>;

    fn current_bid_budgets_active(
        &self,
        accounts: &[String],
    ) -> Result<Vec<CurrentBidBudgetRow>, StoreError>;

    /// Paused or removed campaigns that still had impressions in the window.
    fn current_bid_budgets_inactive(
        &self,
        window: &BackfillWindow,
        accounts: &[String],
    ) -> Result<Vec<CurrentBidBudgetRow>, StoreError>;

    fn conversion_lags(
        &self,
        window: &BackfillWindow,
        accounts: &[String],
    ) -> Result<Vec<LagReportRow>, StoreError>;
}

/// Warehouse holding dated partitions.
pub trait PartitionStore {
    /// Known partition dates of `family`; `NotFound` if the family has none.
    fn list_partitions(&self, family: &str) -> Result<SnapshotPartitionIndex, StoreError>;

    fn write_table(
        &mut self,
        destination: &str,
        table: &RecordTable,
        policy: WritePolicy,
    ) -> Result<(), StoreError>;

    /// Runs a create-table-as-select or drop statement.
    fn execute(&mut self, sql: &str) -> Result<(), StoreError>;

    fn read_missing_marker(&self, table: &str)
        -> Result<Option<MissingSnapshotMarker>, StoreError>;
}

#[derive(Debug, Deserialize)]
struct CampaignRecord {
    campaign_id: EntityId,
}

/// Reads report exports from a directory. Exports cover a single account,
/// so the account list is ignored.
#[derive(Debug, Clone)]
pub struct CsvReportSource {
    root: PathBuf,
}

impl CsvReportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_rows<T: DeserializeOwned>(&self, file_name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.root.join(file_name);
        if !path.exists() {
            return Err(StoreError::NotFound {
                name: path.display().to_string(),
            });
        }
        let file = File::open(&path)?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(file);

        let mut rows = Vec::new();
        for record in reader.deserialize::<T>() {
            rows.push(record.map_err(|source| StoreError::Csv {
                path: path.clone(),
                source,
            })?);
        }

        debug!(
            component = "store",
            event = "store.report.read",
            path = %path.display(),
            rows = rows.len()
        );
        Ok(rows)
    }
}

impl ReportSource for CsvReportSource {
    fn change_history(
        &self,
        window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<ChangeHistoryRow>, StoreError> {
        let rows: Vec<ChangeHistoryRow> = self.read_rows(CHANGE_HISTORY_FILE)?;
        let mut in_window = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp = parse_change_timestamp(&row.change_date)
                .map_err(|err| StoreError::InvalidData(err.to_string()))?;
            if window.contains(timestamp.date()) {
                in_window.push(row);
            }
        }
        Ok(in_window)
    }

    fn campaigns_with_activity(
        &self,
        _window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<EntityId>, StoreError> {
        let rows: Vec<CampaignRecord> = self.read_rows(CAMPAIGNS_FILE)?;
        Ok(rows.into_iter().map(|row| row.campaign_id).collect())
    }

    fn current_bid_budgets_active(
        &self,
        _accounts: &[String],
    ) -> Result<Vec<CurrentBidBudgetRow>, StoreError> {
        self.read_rows(ACTIVE_BID_BUDGETS_FILE)
    }

    fn current_bid_budgets_inactive(
        &self,
        _window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<CurrentBidBudgetRow>, StoreError> {
        match self.read_rows(INACTIVE_BID_BUDGETS_FILE) {
            Err(StoreError::NotFound { .. }) => Ok(Vec::new()),
            other => other,
        }
    }

    fn conversion_lags(
        &self,
        _window: &BackfillWindow,
        _accounts: &[String],
    ) -> Result<Vec<LagReportRow>, StoreError> {
        self.read_rows(CONVERSION_LAGS_FILE)
    }
}

pub struct SqlitePartitionStore {
    conn: Connection,
}

impl SqlitePartitionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;

        info!(
            component = "store",
            event = "store.open",
            store_path = %path.display()
        );
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1 LIMIT 1",
                params![table],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }

    fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

impl PartitionStore for SqlitePartitionStore {
    fn list_partitions(&self, family: &str) -> Result<SnapshotPartitionIndex, StoreError> {
        ensure_table_name(family)?;
        let dates: Vec<NaiveDate> = self
            .table_names()?
            .iter()
            .filter_map(|name| parse_partition_name(family, name))
            .collect();

        if dates.is_empty() {
            return Err(StoreError::NotFound {
                name: format!("{family}_*"),
            });
        }
        Ok(SnapshotPartitionIndex::new(dates))
    }

    fn write_table(
        &mut self,
        destination: &str,
        table: &RecordTable,
        policy: WritePolicy,
    ) -> Result<(), StoreError> {
        ensure_table_name(destination)?;
        for column in table.columns() {
            ensure_table_name(&column.name)?;
        }

        let exists = self.table_exists(destination)?;
        if exists && policy == WritePolicy::CreateIfAbsent {
            return Err(StoreError::Conflict {
                destination: destination.to_string(),
            });
        }

        let column_defs: Vec<String> = table
            .columns()
            .iter()
            .map(|column| format!("`{}` {}", column.name, column.column_type.sql_type()))
            .collect();
        let placeholders: Vec<String> = (1..=table.columns().len())
            .map(|idx| format!("?{idx}"))
            .collect();

        let tx = self.conn.transaction()?;
        if exists {
            tx.execute_batch(&format!("DROP TABLE `{destination}`;"))?;
        }
        tx.execute_batch(&format!(
            "CREATE TABLE `{destination}` ({});",
            column_defs.join(", ")
        ))
        .map_err(|err| classify_sqlite_error(err, destination))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO `{destination}` VALUES ({})",
                placeholders.join(", ")
            ))?;
            for row in table.rows() {
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;

        debug!(
            component = "store",
            event = "store.table.written",
            destination,
            rows = table.len(),
            policy = ?policy
        );
        Ok(())
    }

    fn execute(&mut self, sql: &str) -> Result<(), StoreError> {
        self.conn
            .execute_batch(sql)
            .map_err(|err| classify_sqlite_error(err, sql))
    }

    fn read_missing_marker(
        &self,
        table: &str,
    ) -> Result<Option<MissingSnapshotMarker>, StoreError> {
        let marker_table = missing_marker_table(table);
        ensure_table_name(&marker_table)?;

        let raw: Option<(String, String)> = self
            .conn
            .query_row(
                &format!("SELECT table_suffix, new_start_date FROM `{marker_table}` LIMIT 1"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| classify_sqlite_error(err, &marker_table))?;

        raw.map(|(table_suffix, new_start_date)| {
            let new_start_date = NaiveDate::parse_from_str(new_start_date.trim(), "%Y-%m-%d")
                .map_err(|_| {
                    StoreError::InvalidData(format!(
                        "{marker_table}.new_start_date '{new_start_date}' is not YYYY-MM-DD"
                    ))
                })?;
            Ok(MissingSnapshotMarker {
                table_suffix,
                new_start_date,
            })
        })
        .transpose()
    }
}

/// Maps SQLite's "already exists" / "no such table" failures onto the
/// conflict and not-found conditions. Statements rejected while preparing
/// surface as `SqlInputError`, those failing at step as `SqliteFailure`.
fn classify_sqlite_error(err: rusqlite::Error, name: &str) -> StoreError {
    let message = match &err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message.clone(),
        rusqlite::Error::SqlInputError { msg, .. } => msg.clone(),
        _ => return StoreError::Sqlite(err),
    };
    if message.contains("already exists") {
        StoreError::Conflict {
            destination: name.to_string(),
        }
    } else if message.contains("no such table") {
        StoreError::NotFound {
            name: name.to_string(),
        }
    } else {
        StoreError::Sqlite(err)
    }
}

fn ensure_table_name(raw: &str) -> Result<(), StoreError> {
    let valid = !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).expect("valid test date")
    }

    fn one_column_table(value: i64) -> RecordTable {
        let mut table = RecordTable::new(vec![RecordColumn::new("lag", ColumnType::Integer)]);
        table.push_row(vec![CellValue::Integer(value)]).unwrap();
        table
    }

    #[test]
    fn lists_only_dated_partitions_of_the_family() {
        let mut store = SqlitePartitionStore::open_in_memory().unwrap();
        for name in [
            "bid_budgets_20240103",
            "bid_budgets_20240101",
            "bid_budgets_missing",
            "other_20240102",
        ] {
            store
                .write_table(name, &one_column_table(1), WritePolicy::CreateIfAbsent)
                .unwrap();
        }

        let index = store.list_partitions("bid_budgets").unwrap();
        assert_eq!(index.dates(), &[date(1), date(3)]);

        let err = store.list_partitions("conversion_lags").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn create_if_absent_conflicts_and_truncate_replaces() {
        let mut store = SqlitePartitionStore::open_in_memory().unwrap();
        store
            .write_table("t_20240101", &one_column_table(1), WritePolicy::CreateIfAbsent)
            .unwrap();

        let err = store
            .write_table("t_20240101", &one_column_table(2), WritePolicy::CreateIfAbsent)
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .write_table("t_20240101", &one_column_table(3), WritePolicy::Truncate)
            .unwrap();
        let value: i64 = store
            .conn
            .query_row("SELECT lag FROM t_20240101", [], |row| row.get(0))
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn execute_maps_existing_destination_to_conflict() {
        let mut store = SqlitePartitionStore::open_in_memory().unwrap();
        store
            .write_table("src_20240101", &one_column_table(5), WritePolicy::CreateIfAbsent)
            .unwrap();
        let sql = "CREATE TABLE `dst_20240102` AS SELECT `lag` + 1 AS `lag` FROM `src_20240101`";

        store.execute(sql).unwrap();
        assert!(store.execute(sql).unwrap_err().is_conflict());

        let missing = store
            .execute("CREATE TABLE `x` AS SELECT * FROM `nope_20240101`")
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn prepare_and_step_failures_are_classified_alike() {
        let prepare_failure = |msg: &str| rusqlite::Error::SqlInputError {
            error: rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            msg: msg.to_string(),
            sql: "CREATE TABLE `dst` AS SELECT 1".to_string(),
            offset: 0,
        };
        let step_failure = |msg: &str| {
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(msg.to_string()),
            )
        };

        for err in [
            prepare_failure("table `dst` already exists"),
            step_failure("table dst already exists"),
        ] {
            assert!(matches!(
                classify_sqlite_error(err, "dst"),
                StoreError::Conflict { destination } if destination == "dst"
            ));
        }
        for err in [
            prepare_failure("no such table: src"),
            step_failure("no such table: src"),
        ] {
            assert!(classify_sqlite_error(err, "src").is_not_found());
        }
        assert!(matches!(
            classify_sqlite_error(prepare_failure("near \"SELEC\": syntax error"), "dst"),
            StoreError::Sqlite(_)
        ));
    }

    #[test]
    fn missing_marker_reads_or_reports_not_found() {
        let mut store = SqlitePartitionStore::open_in_memory().unwrap();
        assert!(store.read_missing_marker("assets").unwrap_err().is_not_found());

        store
            .execute(
                "CREATE TABLE assets_missing (table_suffix TEXT, new_start_date TEXT);
                 INSERT INTO assets_missing VALUES ('20240105', '2024-01-04');",
            )
            .unwrap();
        let marker = store.read_missing_marker("assets").unwrap().unwrap();
        assert_eq!(marker.table_suffix, "20240105");
        assert_eq!(marker.new_start_date, date(4));
    }

    #[test]
    fn record_table_checks_row_arity_and_names() {
        let mut table = RecordTable::new(vec![RecordColumn::new("a", ColumnType::Text)]);
        assert!(matches!(
            table.push_row(vec![CellValue::Null, CellValue::Null]),
            Err(StoreError::RowArity { expected: 1, found: 2 })
        ));

        let mut store = SqlitePartitionStore::open_in_memory().unwrap();
        let err = store
            .write_table("bad name", &table, WritePolicy::Truncate)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTableName(_)));
    }
}
