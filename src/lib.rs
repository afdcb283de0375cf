//! ARP snapshot backfill crate.
//!
//! Current implemented scope:
//! - daily bid/budget history reconstruction from change events
//! - copy-with-shift repair of missing cohort partitions
//! - incremental snapshot restart from `<table>_missing` markers
//! - conversion-lag adjustment curves

mod backfill;
mod change_events;
mod config;
mod gaps;
mod grid;
mod history;
mod lag_curve;
mod observability;
mod store;

pub use backfill::{
    build_lag_adjustments, restart_incremental, restore_missing_bid_budgets,
    restore_missing_cohorts, run_backfill_tasks, BackfillError, BackfillOutcome,
    BidBudgetBackfillReport, CohortBackfillReport, LagAdjustmentReport, RunSummary, SkipReason,
    TaskReport, BID_BUDGETS_FAMILY,
};
pub use change_events::{
    explode_change_history, normalize_change_events, parse_change_timestamp, ChangeEvent,
    ChangeEventError, ChangeHistoryRow, NormalizedChange, NormalizedChanges, TrackedAttribute,
};
pub use config::{backfill_config_from_env, BackfillConfig, BackfillTask, ConfigError};
pub use gaps::{
    locate_gaps, locate_gaps_in_range, missing_marker_table, parse_partition_name,
    parse_partition_suffix, partition_name, plan_incremental_restart, render_copy_with_shift_sql,
    CohortTableLayout, GapError, GapReport, IncrementalRestart, MissingSnapshotMarker,
    ShiftInstruction, SnapshotPartitionIndex, CONVERSION_LAGS_FAMILY, MISSING_MARKER_SUFFIX,
    PARTITION_DATE_FORMAT,
};
pub use grid::{
    build_placeholder_grid, BackfillWindow, EntityId, GridCell, PlaceholderGrid, WindowError,
    DEFAULT_CHANGE_HISTORY_LOOKBACK_DAYS, DEFAULT_LAG_LOOKBACK_END_DAYS,
    DEFAULT_LAG_LOOKBACK_START_DAYS,
};
pub use history::{
    join_bid_budget_history, reconstruct_attribute, restore_bid_budget_history, split_by_day,
    AttributeValue, BidBudgetRow, CurrentBidBudgetRow, CurrentValue, CurrentValues, HistoryError,
    ReconstructedAttributeTable, ReconstructedRow,
};
pub use lag_curve::{
    placeholder_curve, LagAdjustmentCurve, LagBucketMapping, LagCurveBuilder, LagCurveConfig,
    LagCurveError, LagCurvePoint, LagObservation, LagReportRow, DEFAULT_LAG_MAPPING_CSV,
    LAG_ADJUSTMENTS_TABLE,
};
pub use observability::{
    init_logging, log_run_start, log_task_finish, log_task_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use store::{
    CellValue, ColumnType, CsvReportSource, PartitionStore, RecordColumn, RecordTable,
    ReportSource, SqlitePartitionStore, StoreError, WritePolicy, ACTIVE_BID_BUDGETS_FILE,
    CAMPAIGNS_FILE, CHANGE_HISTORY_FILE, CONVERSION_LAGS_FILE, INACTIVE_BID_BUDGETS_FILE,
};
