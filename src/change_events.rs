//! Change-event normalization: one (old, new) pair per entity and day.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::grid::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrackedAttribute {
    BudgetAmount,
    TargetCpa,
    TargetRoas,
}

impl TrackedAttribute {
    pub const ALL: [TrackedAttribute; 3] = [Self::BudgetAmount, Self::TargetCpa, Self::TargetRoas];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BudgetAmount => "budget_amount",
            Self::TargetCpa => "target_cpa",
            Self::TargetRoas => "target_roas",
        }
    }

    /// Ratio attributes keep their floating-point value; everything else is
    /// micros and gets cast to an integer.
    pub fn is_ratio(self) -> bool {
        matches!(self, Self::TargetRoas)
    }
}

impl fmt::Display for TrackedAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackedAttribute {
    type Err = ChangeEventError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "budget_amount" => Ok(Self::BudgetAmount),
            "target_cpa" => Ok(Self::TargetCpa),
            "target_roas" => Ok(Self::TargetRoas),
            other => Err(ChangeEventError::UnknownAttribute(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangeEventError {
    #[error("unknown tracked attribute: {0}")]
    UnknownAttribute(String),
    #[error("unparseable change timestamp: '{0}'")]
    InvalidTimestamp(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: EntityId,
    pub timestamp: NaiveDateTime,
    pub attribute: TrackedAttribute,
    pub old_value: Option<f64>,
    pub new_value: Option<f64>,
}

/// Change history as the report source returns it: one row per change event
/// carrying old/new values for every tracked attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeHistoryRow {
    pub change_date: String,
    pub campaign_id: EntityId,
    pub old_budget_amount: Option<f64>,
    pub new_budget_amount: Option<f64>,
    pub old_target_cpa: Option<f64>,
    pub new_target_cpa: Option<f64>,
    pub old_target_roas: Option<f64>,
    pub new_target_roas: Option<f64>,
}

impl ChangeHistoryRow {
    pub fn into_events(self) -> Result<Vec<ChangeEvent>, ChangeEventError> {
        let timestamp = parse_change_timestamp(&self.change_date)?;
        let pairs = [
            (
                TrackedAttribute::BudgetAmount,
                self.old_budget_amount,
                self.new_budget_amount,
            ),
            (
                TrackedAttribute::TargetCpa,
                self.old_target_cpa,
                self.new_target_cpa,
            ),
            (
                TrackedAttribute::TargetRoas,
                self.old_target_roas,
                self.new_target_roas,
            ),
        ];

        Ok(pairs
            .into_iter()
            .filter(|(_, old, new)| old.is_some() || new.is_some())
            .map(|(attribute, old_value, new_value)| ChangeEvent {
                entity_id: self.campaign_id,
                timestamp,
                attribute,
                old_value,
                new_value,
            })
            .collect())
    }
}

pub fn explode_change_history(
    rows: Vec<ChangeHistoryRow>,
) -> Result<Vec<ChangeEvent>, ChangeEventError> {
    let mut events = Vec::with_capacity(rows.len() * TrackedAttribute::ALL.len());
    for row in rows {
        events.extend(row.into_events()?);
    }
    Ok(events)
}

/// Accepts `YYYY-MM-DD HH:MM:SS[.ffffff]`, the `T`-separated form, or a bare
/// date (midnight).
pub fn parse_change_timestamp(raw: &str) -> Result<NaiveDateTime, ChangeEventError> {
    let trimmed = raw.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map(|day| day.and_time(NaiveTime::MIN))
        .map_err(|_| ChangeEventError::InvalidTimestamp(raw.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedChange {
    pub day: NaiveDate,
    pub entity_id: EntityId,
    pub value_old: f64,
    pub value_new: f64,
}

/// Normalized events for one attribute, ordered by `(day, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedChanges {
    pub attribute: TrackedAttribute,
    pub rows: Vec<NormalizedChange>,
}

impl NormalizedChanges {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Keeps events for `attribute` whose old and new values are both positive,
/// truncates them to calendar days and retains the last event per
/// `(entity_id, day)` in input order.
pub fn normalize_change_events(
    events: &[ChangeEvent],
    attribute: TrackedAttribute,
) -> NormalizedChanges {
    let mut last_per_day: BTreeMap<(NaiveDate, EntityId), (f64, f64)> = BTreeMap::new();

    for event in events.iter().filter(|event| event.attribute == attribute) {
        let (Some(old), Some(new)) = (event.old_value, event.new_value) else {
            continue;
        };
        if old > 0.0 && new > 0.0 {
            last_per_day.insert((event.timestamp.date(), event.entity_id), (old, new));
        }
    }

    let rows: Vec<NormalizedChange> = last_per_day
        .into_iter()
        .map(|((day, entity_id), (value_old, value_new))| NormalizedChange {
            day,
            entity_id,
            value_old,
            value_new,
        })
        .collect();

    if rows.is_empty() {
        info!(
            component = "change_events",
            event = "change_events.normalize.empty",
            attribute = attribute.as_str()
        );
    } else {
        info!(
            component = "change_events",
            event = "change_events.normalize.finish",
            attribute = attribute.as_str(),
            qualifying_days = rows.len()
        );
    }

    NormalizedChanges { attribute, rows }
}
