//! Backfill drivers wiring report sources, the core reconstruction logic and
//! the partition store together.
//!
//! Each driver returns `BackfillOutcome::Skipped` when the data it needs does
//! not exist yet. Destination conflicts are logged and skipped so a rerun
//! never overwrites a partition that already exists.

use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::change_events::{
    explode_change_history, normalize_change_events, ChangeEventError, NormalizedChanges,
    TrackedAttribute,
};
use crate::config::{BackfillConfig, BackfillTask, ConfigError};
use crate::gaps::{
    locate_gaps, partition_name, plan_incremental_restart, render_copy_with_shift_sql,
    CohortTableLayout, GapError, GapReport, IncrementalRestart,
};
use crate::grid::{build_placeholder_grid, BackfillWindow, WindowError};
use crate::history::{restore_bid_budget_history, split_by_day, CurrentValues, HistoryError};
use crate::lag_curve::{LagCurveBuilder, LagCurveError, LagObservation, LAG_ADJUSTMENTS_TABLE};
use crate::observability::{log_task_finish, log_task_selected};
use crate::store::{PartitionStore, RecordTable, ReportSource, StoreError, WritePolicy};

pub const BID_BUDGETS_FAMILY: &str = "bid_budgets";

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ChangeEvents(#[from] ChangeEventError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Gaps(#[from] GapError),
    #[error(transparent)]
    LagCurve(#[from] LagCurveError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Window(#[from] WindowError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A partition family or report the task reads from does not exist.
    SourceMissing { name: String },
    NothingMissing,
    /// No `<table>_missing` row; the incremental snapshot is intact.
    NoMarker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum BackfillOutcome<R> {
    Skipped(SkipReason),
    Completed(R),
}

impl<R> BackfillOutcome<R> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    pub fn completed(&self) -> Option<&R> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidBudgetBackfillReport {
    pub window: Option<BackfillWindow>,
    pub missing_days: Vec<NaiveDate>,
    pub campaigns: usize,
    pub written: Vec<String>,
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortBackfillReport {
    pub gaps: GapReport,
    pub written: Vec<String>,
    pub conflicts: Vec<String>,
}

/// One entry per task run by [`run_backfill_tasks`], serialized as
/// `{"task": ..., "outcome": {"status": ..., "detail": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "outcome", rename_all = "snake_case")]
pub enum TaskReport {
    BidBudgets(BackfillOutcome<BidBudgetBackfillReport>),
    Cohorts(BackfillOutcome<CohortBackfillReport>),
    Incremental(BackfillOutcome<IncrementalRestart>),
}

impl TaskReport {
    pub fn task(&self) -> BackfillTask {
        match self {
            Self::BidBudgets(_) => BackfillTask::BidBudgets,
            Self::Cohorts(_) => BackfillTask::Cohorts,
            Self::Incremental(_) => BackfillTask::Incremental,
        }
    }

    pub fn status(&self) -> &'static str {
        let skipped = match self {
            Self::BidBudgets(outcome) => outcome.is_skipped(),
            Self::Cohorts(outcome) => outcome.is_skipped(),
            Self::Incremental(outcome) => outcome.is_skipped(),
        };
        if skipped {
            "skipped"
        } else {
            "completed"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub today: NaiveDate,
    pub store_path: PathBuf,
    pub tasks: Vec<TaskReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagAdjustmentReport {
    pub destination: String,
    pub observations: usize,
    pub points: usize,
    pub placeholder: bool,
    pub mapping_fingerprint: String,
}

/// Reconstructs `bid_budgets_<YYYYMMDD>` partitions missing inside `window`.
///
/// Only dates absent from the store are written, each with
/// `WritePolicy::CreateIfAbsent`.
pub fn restore_missing_bid_budgets(
    source: &dyn ReportSource,
    store: &mut dyn PartitionStore,
    window: &BackfillWindow,
    accounts: &[String],
) -> Result<BackfillOutcome<BidBudgetBackfillReport>, BackfillError> {
    info!(
        component = "backfill",
        event = "backfill.bid_budgets.start",
        window_start = %window.start,
        window_end = %window.end,
        accounts = accounts.len()
    );

    let index = match store.list_partitions(BID_BUDGETS_FAMILY) {
        Ok(index) => index,
        Err(err) if err.is_not_found() => return Ok(skip_missing_source("bid_budgets", err)),
        Err(err) => return Err(err.into()),
    };

    let missing_days = index.missing_in(window);
    if missing_days.is_empty() {
        info!(
            component = "backfill",
            event = "backfill.bid_budgets.nothing_missing",
            existing_partitions = index.len()
        );
        return Ok(BackfillOutcome::Skipped(SkipReason::NothingMissing));
    }

    let history = match source.change_history(window, accounts) {
        Ok(rows) => rows,
        Err(err) if err.is_not_found() => return Ok(skip_missing_source("bid_budgets", err)),
        Err(err) => return Err(err.into()),
    };
    let events = explode_change_history(history)?;
    let changes: Vec<NormalizedChanges> = TrackedAttribute::ALL
        .iter()
        .map(|attribute| normalize_change_events(&events, *attribute))
        .collect();

    let campaigns = match source.campaigns_with_activity(window, accounts) {
        Ok(campaigns) => campaigns,
        Err(err) if err.is_not_found() => return Ok(skip_missing_source("bid_budgets", err)),
        Err(err) => return Err(err.into()),
    };

    let mut current_rows = source.current_bid_budgets_inactive(window, accounts)?;
    current_rows.extend(source.current_bid_budgets_active(accounts)?);
    let current = CurrentValues::from_rows(current_rows);

    let grid = build_placeholder_grid(&campaigns, &window.days());
    let restored = restore_bid_budget_history(&grid, &changes, &current)?;
    let mut by_day = split_by_day(restored);

    let mut report = BidBudgetBackfillReport {
        window: Some(*window),
        missing_days: missing_days.clone(),
        campaigns: grid.entities().len(),
        ..BidBudgetBackfillReport::default()
    };

    for day in missing_days {
        let rows = by_day.remove(&day).unwrap_or_default();
        let destination = partition_name(BID_BUDGETS_FAMILY, day);
        let table = RecordTable::from_bid_budgets(&rows);

        match store.write_table(&destination, &table, WritePolicy::CreateIfAbsent) {
            Ok(()) => {
                info!(
                    component = "backfill",
                    event = "backfill.bid_budgets.partition_written",
                    destination = %destination,
                    rows = table.len()
                );
                report.written.push(destination);
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    component = "backfill",
                    event = "backfill.bid_budgets.partition_conflict",
                    destination = %destination
                );
                report.conflicts.push(destination);
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!(
        component = "backfill",
        event = "backfill.bid_budgets.finish",
        written = report.written.len(),
        conflicts = report.conflicts.len()
    );
    Ok(BackfillOutcome::Completed(report))
}

/// Fills gaps in a cohort family by copying the nearest earlier partition
/// with its lag column shifted by the day offset.
pub fn restore_missing_cohorts(
    store: &mut dyn PartitionStore,
    layout: &CohortTableLayout,
) -> Result<BackfillOutcome<CohortBackfillReport>, BackfillError> {
    info!(
        component = "backfill",
        event = "backfill.cohorts.start",
        family = %layout.family
    );

    let index = match store.list_partitions(&layout.family) {
        Ok(index) => index,
        Err(err) if err.is_not_found() => return Ok(skip_missing_source("cohorts", err)),
        Err(err) => return Err(err.into()),
    };

    let gaps = locate_gaps(&index);
    if gaps.is_complete() {
        info!(
            component = "backfill",
            event = "backfill.cohorts.nothing_missing",
            existing_partitions = index.len()
        );
        return Ok(BackfillOutcome::Skipped(SkipReason::NothingMissing));
    }

    let mut written = Vec::new();
    let mut conflicts = Vec::new();
    for instruction in &gaps.instructions {
        let sql = render_copy_with_shift_sql(layout, instruction)?;
        let destination = instruction.destination(&layout.family);

        match store.execute(&sql) {
            Ok(()) => {
                info!(
                    component = "backfill",
                    event = "backfill.cohorts.partition_written",
                    destination = %destination,
                    source = %instruction.source(&layout.family),
                    offset_days = instruction.offset_days
                );
                written.push(destination);
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    component = "backfill",
                    event = "backfill.cohorts.partition_conflict",
                    destination = %destination
                );
                conflicts.push(destination);
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!(
        component = "backfill",
        event = "backfill.cohorts.finish",
        written = written.len(),
        conflicts = conflicts.len(),
        unanchored = gaps.unanchored.len()
    );
    Ok(BackfillOutcome::Completed(CohortBackfillReport {
        gaps,
        written,
        conflicts,
    }))
}

/// Rebuilds `conversion_lag_adjustments` from the conversion-lag report.
///
/// A missing or empty report still writes the single placeholder row.
pub fn build_lag_adjustments(
    source: &dyn ReportSource,
    store: &mut dyn PartitionStore,
    builder: &LagCurveBuilder,
    window: &BackfillWindow,
    accounts: &[String],
) -> Result<LagAdjustmentReport, BackfillError> {
    let rows = match source.conversion_lags(window, accounts) {
        Ok(rows) => rows,
        Err(err) if err.is_not_found() => {
            info!(
                component = "backfill",
                event = "backfill.lag_adjustments.source_missing",
                error = %err
            );
            Vec::new()
        }
        Err(err) => return Err(err.into()),
    };

    let observations: Vec<LagObservation> =
        rows.into_iter().map(|row| row.into_observation()).collect();
    let curve = builder.build(&observations)?;
    let table = RecordTable::from_lag_curve(&curve);
    store.write_table(LAG_ADJUSTMENTS_TABLE, &table, WritePolicy::Truncate)?;

    let report = LagAdjustmentReport {
        destination: LAG_ADJUSTMENTS_TABLE.to_string(),
        observations: observations.len(),
        points: curve.points.len(),
        placeholder: curve.is_placeholder(),
        mapping_fingerprint: curve.mapping_fingerprint.clone(),
    };
    info!(
        component = "backfill",
        event = "backfill.lag_adjustments.written",
        destination = %report.destination,
        points = report.points,
        placeholder = report.placeholder
    );
    Ok(report)
}

/// Drops the partition named by `<table>_missing` and returns the date the
/// incremental snapshot must be rebuilt from.
pub fn restart_incremental(
    store: &mut dyn PartitionStore,
    table: &str,
) -> Result<BackfillOutcome<IncrementalRestart>, BackfillError> {
    let marker = match store.read_missing_marker(table) {
        Ok(marker) => marker,
        Err(err) if err.is_not_found() => return Ok(skip_missing_source("incremental", err)),
        Err(err) => return Err(err.into()),
    };

    let Some(restart) = plan_incremental_restart(table, marker.as_ref())? else {
        info!(
            component = "backfill",
            event = "backfill.incremental.no_marker",
            table
        );
        return Ok(BackfillOutcome::Skipped(SkipReason::NoMarker));
    };

    match store.execute(&restart.drop_sql()) {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {
            info!(
                component = "backfill",
                event = "backfill.incremental.stale_partition_missing",
                stale_partition = %restart.stale_partition
            );
        }
        Err(err) => return Err(err.into()),
    }

    info!(
        component = "backfill",
        event = "backfill.incremental.restart",
        table,
        new_start_date = %restart.new_start_date,
        dropped_partition = %restart.stale_partition
    );
    Ok(BackfillOutcome::Completed(restart))
}

/// Runs `config.tasks` in order against one store. The first hard error
/// stops the run; skipped tasks are reported and the run continues.
pub fn run_backfill_tasks(
    config: &BackfillConfig,
    today: NaiveDate,
    source: &dyn ReportSource,
    store: &mut dyn PartitionStore,
) -> Result<RunSummary, BackfillError> {
    let mut tasks = Vec::with_capacity(config.tasks.len());
    for task in &config.tasks {
        log_task_selected(*task, Some("ARP_BACKFILL_TASKS"));

        let report = match task {
            BackfillTask::BidBudgets => {
                let window = config.change_history_window(today)?;
                TaskReport::BidBudgets(restore_missing_bid_budgets(
                    source,
                    store,
                    &window,
                    &config.accounts,
                )?)
            }
            BackfillTask::Cohorts => {
                TaskReport::Cohorts(restore_missing_cohorts(store, &CohortTableLayout::default())?)
            }
            BackfillTask::Incremental => {
                let table = config
                    .incremental_table
                    .as_deref()
                    .ok_or(ConfigError::MissingIncrementalTable)?;
                TaskReport::Incremental(restart_incremental(store, table)?)
            }
        };

        log_task_finish(task.as_str(), report.status());
        tasks.push(report);
    }

    Ok(RunSummary {
        today,
        store_path: config.store_path.clone(),
        tasks,
    })
}

fn skip_missing_source<R>(task: &str, err: StoreError) -> BackfillOutcome<R> {
    let name = match &err {
        StoreError::NotFound { name } => name.clone(),
        other => other.to_string(),
    };
    info!(
        component = "backfill",
        event = "backfill.source_missing",
        task,
        name = %name
    );
    BackfillOutcome::Skipped(SkipReason::SourceMissing { name })
}
