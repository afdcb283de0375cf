//! Missing dated-partition detection and copy-with-shift rebuild planning.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::grid::BackfillWindow;

pub const PARTITION_DATE_FORMAT: &str = "%Y%m%d";
pub const CONVERSION_LAGS_FAMILY: &str = "conversion_lags";
pub const MISSING_MARKER_SUFFIX: &str = "missing";

const CONVERSION_LAGS_COLUMNS: [&str; 10] = [
    "day_of_interaction",
    "lag",
    "ad_group_id",
    "asset_id",
    "field_type",
    "network",
    "installs",
    "inapps",
    "view_through_conversions",
    "conversions_value",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GapError {
    #[error("invalid partition suffix '{0}', expected YYYYMMDD")]
    InvalidSuffix(String),
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("cohort layout has no '{0}' column")]
    MissingLagColumn(String),
}

pub fn partition_name(family: &str, day: NaiveDate) -> String {
    format!("{family}_{}", day.format(PARTITION_DATE_FORMAT))
}

pub fn parse_partition_suffix(raw: &str) -> Result<NaiveDate, GapError> {
    let trimmed = raw.trim();
    if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GapError::InvalidSuffix(raw.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, PARTITION_DATE_FORMAT)
        .map_err(|_| GapError::InvalidSuffix(raw.to_string()))
}

/// Returns the partition date when `table` is `<family>_<YYYYMMDD>`.
pub fn parse_partition_name(family: &str, table: &str) -> Option<NaiveDate> {
    let suffix = table.strip_prefix(family)?.strip_prefix('_')?;
    parse_partition_suffix(suffix).ok()
}

/// Sorted, duplicate-free set of known partition dates for one table family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPartitionIndex {
    dates: Vec<NaiveDate>,
}

impl SnapshotPartitionIndex {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        let mut dates: Vec<NaiveDate> = dates.into_iter().collect();
        dates.sort_unstable();
        dates.dedup();
        Self { dates }
    }

    pub fn from_suffixes<'a>(
        suffixes: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, GapError> {
        let dates = suffixes
            .into_iter()
            .map(parse_partition_suffix)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(dates))
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.dates.binary_search(&day).is_ok()
    }

    pub fn insert(&mut self, day: NaiveDate) -> bool {
        match self.dates.binary_search(&day) {
            Ok(_) => false,
            Err(pos) => {
                self.dates.insert(pos, day);
                true
            }
        }
    }

    /// `min ..= max` of the known dates.
    pub fn observed_range(&self) -> Option<BackfillWindow> {
        let (first, last) = (self.dates.first()?, self.dates.last()?);
        Some(BackfillWindow {
            start: *first,
            end: *last,
        })
    }

    /// Nearest known date strictly before `day`.
    pub fn nearest_earlier(&self, day: NaiveDate) -> Option<NaiveDate> {
        let idx = self.dates.partition_point(|known| *known < day);
        if idx == 0 {
            None
        } else {
            Some(self.dates[idx - 1])
        }
    }

    pub fn missing_in(&self, window: &BackfillWindow) -> Vec<NaiveDate> {
        window
            .days()
            .into_iter()
            .filter(|day| !self.contains(*day))
            .collect()
    }
}

/// Build `missing_date` by copying `source_date` with `lag` shifted by
/// `offset_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftInstruction {
    pub missing_date: NaiveDate,
    pub source_date: NaiveDate,
    pub offset_days: i64,
}

impl ShiftInstruction {
    pub fn destination(&self, family: &str) -> String {
        partition_name(family, self.missing_date)
    }

    pub fn source(&self, family: &str) -> String {
        partition_name(family, self.source_date)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    pub expected_days: u64,
    pub existing_days: u64,
    pub missing: Vec<NaiveDate>,
    pub instructions: Vec<ShiftInstruction>,
    /// Missing dates with no earlier partition to copy from.
    pub unanchored: Vec<NaiveDate>,
}

impl GapReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Locates gaps between the earliest and latest known partitions.
pub fn locate_gaps(index: &SnapshotPartitionIndex) -> GapReport {
    match index.observed_range() {
        Some(window) => locate_gaps_in_range(index, &window),
        None => GapReport::default(),
    }
}

pub fn locate_gaps_in_range(index: &SnapshotPartitionIndex, window: &BackfillWindow) -> GapReport {
    let missing = index.missing_in(window);
    let mut instructions = Vec::with_capacity(missing.len());
    let mut unanchored = Vec::new();

    for day in &missing {
        match index.nearest_earlier(*day) {
            Some(source_date) => instructions.push(ShiftInstruction {
                missing_date: *day,
                source_date,
                offset_days: (*day - source_date).num_days(),
            }),
            None => {
                debug!(
                    component = "gaps",
                    event = "gaps.locate.unanchored",
                    missing_date = %day
                );
                unanchored.push(*day);
            }
        }
    }

    let expected_days = window.len_days() as u64;
    let report = GapReport {
        expected_days,
        existing_days: expected_days - missing.len() as u64,
        missing,
        instructions,
        unanchored,
    };

    info!(
        component = "gaps",
        event = "gaps.locate.finish",
        window_start = %window.start,
        window_end = %window.end,
        expected_days = report.expected_days,
        missing_days = report.missing.len(),
        instructions = report.instructions.len(),
        unanchored_days = report.unanchored.len()
    );

    report
}

/// Column layout of a lag-bearing cohort table family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortTableLayout {
    pub family: String,
    pub lag_column: String,
    /// Output columns in order; `lag_column` must be one of them.
    pub columns: Vec<String>,
}

impl Default for CohortTableLayout {
    fn default() -> Self {
        Self {
            family: CONVERSION_LAGS_FAMILY.to_string(),
            lag_column: "lag".to_string(),
            columns: CONVERSION_LAGS_COLUMNS
                .iter()
                .map(|column| column.to_string())
                .collect(),
        }
    }
}

/// `CREATE TABLE` (never `OR REPLACE`) so an existing destination surfaces
/// as a conflict.
pub fn render_copy_with_shift_sql(
    layout: &CohortTableLayout,
    instruction: &ShiftInstruction,
) -> Result<String, GapError> {
    ensure_identifier(&layout.family)?;
    ensure_identifier(&layout.lag_column)?;
    if !layout.columns.iter().any(|column| *column == layout.lag_column) {
        return Err(GapError::MissingLagColumn(layout.lag_column.clone()));
    }

    let mut select_list = Vec::with_capacity(layout.columns.len());
    for column in &layout.columns {
        ensure_identifier(column)?;
        if *column == layout.lag_column {
            select_list.push(format!(
                "`{column}` + {offset} AS `{column}`",
                offset = instruction.offset_days
            ));
        } else {
            select_list.push(format!("`{column}`"));
        }
    }

    Ok(format!(
        "CREATE TABLE `{destination}` AS SELECT {columns} FROM `{source}`",
        destination = instruction.destination(&layout.family),
        columns = select_list.join(", "),
        source = instruction.source(&layout.family),
    ))
}

/// Row of a `<table>_missing` marker recording a broken incremental snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSnapshotMarker {
    pub table_suffix: String,
    pub new_start_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalRestart {
    pub new_start_date: NaiveDate,
    pub stale_partition: String,
}

impl IncrementalRestart {
    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS `{}`", self.stale_partition)
    }
}

pub fn missing_marker_table(table: &str) -> String {
    format!("{table}_{MISSING_MARKER_SUFFIX}")
}

pub fn plan_incremental_restart(
    table: &str,
    marker: Option<&MissingSnapshotMarker>,
) -> Result<Option<IncrementalRestart>, GapError> {
    ensure_identifier(table)?;
    let Some(marker) = marker else {
        return Ok(None);
    };
    let suffix = marker.table_suffix.trim();
    ensure_identifier(suffix)?;

    Ok(Some(IncrementalRestart {
        new_start_date: marker.new_start_date,
        stale_partition: format!("{table}_{suffix}"),
    }))
}

fn ensure_identifier(raw: &str) -> Result<(), GapError> {
    let valid = !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(GapError::InvalidIdentifier(raw.to_string()))
    }
}
