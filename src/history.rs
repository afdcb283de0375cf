//! Per-attribute history reconstruction over the placeholder grid.
//!
//! Fill policy for one attribute and one entity, scanning days in order:
//! 1. forward-fill `value_new` from the normalized change events,
//! 2. where nothing was set yet, backward-fill `value_old`,
//! 3. where both are empty, fall back to the entity's current value.
//!
//! With no qualifying events at all, every cell takes the current value.
//! Non-ratio attributes are truncated to integers.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::change_events::{NormalizedChanges, TrackedAttribute};
use crate::grid::{EntityId, PlaceholderGrid};

#[derive(Debug, Error, PartialEq)]
pub enum HistoryError {
    #[error("no value could be reconstructed for {attribute} of entity {entity_id} on {day}")]
    UnresolvedValue {
        attribute: TrackedAttribute,
        entity_id: EntityId,
        day: NaiveDate,
    },
    #[error("{attribute} table has no row for entity {entity_id} on {day}")]
    MissingJoinRow {
        attribute: TrackedAttribute,
        entity_id: EntityId,
        day: NaiveDate,
    },
    #[error("expected a {expected} table, got {actual}")]
    AttributeMismatch {
        expected: TrackedAttribute,
        actual: TrackedAttribute,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Integer(i64),
    Ratio(f64),
}

impl AttributeValue {
    /// Truncates toward zero for non-ratio attributes.
    pub fn cast(attribute: TrackedAttribute, raw: f64) -> Self {
        if attribute.is_ratio() {
            Self::Ratio(raw)
        } else {
            Self::Integer(raw as i64)
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Integer(value) => value as f64,
            Self::Ratio(value) => value,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(value),
            Self::Ratio(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentValue {
    pub entity_id: EntityId,
    pub attribute: TrackedAttribute,
    pub value: Option<f64>,
}

/// Current bids and budgets as the report source returns them, one row per
/// campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentBidBudgetRow {
    pub campaign_id: EntityId,
    pub budget_amount: Option<f64>,
    pub target_cpa: Option<f64>,
    pub target_roas: Option<f64>,
}

impl CurrentBidBudgetRow {
    pub fn into_values(self) -> [CurrentValue; 3] {
        [
            CurrentValue {
                entity_id: self.campaign_id,
                attribute: TrackedAttribute::BudgetAmount,
                value: self.budget_amount,
            },
            CurrentValue {
                entity_id: self.campaign_id,
                attribute: TrackedAttribute::TargetCpa,
                value: self.target_cpa,
            },
            CurrentValue {
                entity_id: self.campaign_id,
                attribute: TrackedAttribute::TargetRoas,
                value: self.target_roas,
            },
        ]
    }
}

/// Latest known values keyed by `(entity_id, attribute)`. The first present
/// value seen for a key wins, so feeding inactive campaigns before active ones
/// keeps the result independent of hash ordering. An empty row only counts
/// when no row for that key carries a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentValues {
    by_key: HashMap<(EntityId, TrackedAttribute), Option<f64>>,
}

impl CurrentValues {
    pub fn from_values(values: impl IntoIterator<Item = CurrentValue>) -> Self {
        let mut by_key: HashMap<(EntityId, TrackedAttribute), Option<f64>> = HashMap::new();
        let mut duplicates = 0usize;
        for value in values {
            match by_key.entry((value.entity_id, value.attribute)) {
                // An empty earlier row never hides a present later one.
                Entry::Occupied(mut slot) if slot.get().is_none() && value.value.is_some() => {
                    slot.insert(value.value);
                }
                Entry::Occupied(_) => duplicates += 1,
                Entry::Vacant(slot) => {
                    slot.insert(value.value);
                }
            }
        }
        if duplicates > 0 {
            debug!(
                component = "history",
                event = "history.current_values.deduplicated",
                duplicates_removed = duplicates
            );
        }
        Self { by_key }
    }

    pub fn from_rows(rows: impl IntoIterator<Item = CurrentBidBudgetRow>) -> Self {
        Self::from_values(rows.into_iter().flat_map(CurrentBidBudgetRow::into_values))
    }

    pub fn get(&self, entity_id: EntityId, attribute: TrackedAttribute) -> Option<f64> {
        self.by_key.get(&(entity_id, attribute)).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedRow {
    pub day: NaiveDate,
    pub entity_id: EntityId,
    pub value: Option<AttributeValue>,
}

/// One row per grid cell, in grid order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedAttributeTable {
    pub attribute: TrackedAttribute,
    pub rows: Vec<ReconstructedRow>,
}

impl ReconstructedAttributeTable {
    fn index(&self) -> HashMap<(NaiveDate, EntityId), Option<AttributeValue>> {
        self.rows
            .iter()
            .map(|row| ((row.day, row.entity_id), row.value))
            .collect()
    }
}

pub fn reconstruct_attribute(
    grid: &PlaceholderGrid,
    changes: &NormalizedChanges,
    current: &CurrentValues,
) -> Result<ReconstructedAttributeTable, HistoryError> {
    let attribute = changes.attribute;
    let days = grid.days();
    let mut rows = Vec::with_capacity(grid.len());

    let events: HashMap<(EntityId, NaiveDate), (f64, f64)> = changes
        .rows
        .iter()
        .map(|row| ((row.entity_id, row.day), (row.value_old, row.value_new)))
        .collect();

    for &entity_id in grid.entities() {
        let fallback = current.get(entity_id, attribute);
        let filled = if events.is_empty() {
            vec![fallback; days.len()]
        } else {
            let olds: Vec<Option<f64>> = days
                .iter()
                .map(|day| events.get(&(entity_id, *day)).map(|(old, _)| *old))
                .collect();
            let news: Vec<Option<f64>> = days
                .iter()
                .map(|day| events.get(&(entity_id, *day)).map(|(_, new)| *new))
                .collect();
            let backward = backward_fill(&olds);
            let forward = forward_fill(&news);

            forward
                .into_iter()
                .zip(backward)
                .map(|(fwd, bwd)| fwd.or(bwd).or(fallback))
                .collect()
        };

        for (day, value) in days.iter().zip(filled) {
            let value = match value {
                Some(raw) => Some(AttributeValue::cast(attribute, raw)),
                None if attribute.is_ratio() => None,
                None => {
                    return Err(HistoryError::UnresolvedValue {
                        attribute,
                        entity_id,
                        day: *day,
                    })
                }
            };
            rows.push(ReconstructedRow {
                day: *day,
                entity_id,
                value,
            });
        }
    }

    info!(
        component = "history",
        event = "history.reconstruct.finish",
        attribute = attribute.as_str(),
        change_days = changes.len(),
        used_events = !events.is_empty(),
        rows = rows.len()
    );

    Ok(ReconstructedAttributeTable { attribute, rows })
}

/// Wide per-day snapshot row written to `bid_budgets_<YYYYMMDD>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidBudgetRow {
    pub day: NaiveDate,
    pub campaign_id: EntityId,
    pub budget_amount: i64,
    pub target_cpa: i64,
    pub target_roas: Option<f64>,
}

/// Left-joins the three attribute tables on `(day, entity_id)`, keeping the
/// row order of the budget table.
pub fn join_bid_budget_history(
    budgets: &ReconstructedAttributeTable,
    target_cpas: &ReconstructedAttributeTable,
    target_roas: &ReconstructedAttributeTable,
) -> Result<Vec<BidBudgetRow>, HistoryError> {
    expect_attribute(budgets, TrackedAttribute::BudgetAmount)?;
    expect_attribute(target_cpas, TrackedAttribute::TargetCpa)?;
    expect_attribute(target_roas, TrackedAttribute::TargetRoas)?;

    let cpa_index = target_cpas.index();
    let roas_index = target_roas.index();

    budgets
        .rows
        .iter()
        .map(|row| {
            let key = (row.day, row.entity_id);
            Ok(BidBudgetRow {
                day: row.day,
                campaign_id: row.entity_id,
                budget_amount: integer_cell(TrackedAttribute::BudgetAmount, row.value, key)?,
                target_cpa: integer_cell(
                    TrackedAttribute::TargetCpa,
                    lookup(&cpa_index, TrackedAttribute::TargetCpa, key)?,
                    key,
                )?,
                target_roas: lookup(&roas_index, TrackedAttribute::TargetRoas, key)?
                    .map(AttributeValue::as_f64),
            })
        })
        .collect()
}

/// Runs every tracked attribute over the grid and joins the results.
pub fn restore_bid_budget_history(
    grid: &PlaceholderGrid,
    changes: &[NormalizedChanges],
    current: &CurrentValues,
) -> Result<Vec<BidBudgetRow>, HistoryError> {
    let table_for = |attribute: TrackedAttribute| {
        let empty = NormalizedChanges {
            attribute,
            rows: Vec::new(),
        };
        let normalized = changes
            .iter()
            .find(|candidate| candidate.attribute == attribute)
            .unwrap_or(&empty);
        reconstruct_attribute(grid, normalized, current)
    };

    let budgets = table_for(TrackedAttribute::BudgetAmount)?;
    let target_cpas = table_for(TrackedAttribute::TargetCpa)?;
    let target_roas = table_for(TrackedAttribute::TargetRoas)?;
    join_bid_budget_history(&budgets, &target_cpas, &target_roas)
}

pub fn split_by_day(rows: Vec<BidBudgetRow>) -> BTreeMap<NaiveDate, Vec<BidBudgetRow>> {
    let mut by_day: BTreeMap<NaiveDate, Vec<BidBudgetRow>> = BTreeMap::new();
    for row in rows {
        by_day.entry(row.day).or_default().push(row);
    }
    by_day
}

fn backward_fill(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    let mut carry = None;
    for (idx, value) in values.iter().enumerate().rev() {
        if value.is_some() {
            carry = *value;
        }
        out[idx] = carry;
    }
    out
}

fn forward_fill(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut carry = None;
    values
        .iter()
        .map(|value| {
            if value.is_some() {
                carry = *value;
            }
            carry
        })
        .collect()
}

fn expect_attribute(
    table: &ReconstructedAttributeTable,
    expected: TrackedAttribute,
) -> Result<(), HistoryError> {
    if table.attribute == expected {
        Ok(())
    } else {
        Err(HistoryError::AttributeMismatch {
            expected,
            actual: table.attribute,
        })
    }
}

fn lookup(
    index: &HashMap<(NaiveDate, EntityId), Option<AttributeValue>>,
    attribute: TrackedAttribute,
    key: (NaiveDate, EntityId),
) -> Result<Option<AttributeValue>, HistoryError> {
    index
        .get(&key)
        .copied()
        .ok_or(HistoryError::MissingJoinRow {
            attribute,
            entity_id: key.1,
            day: key.0,
        })
}

fn integer_cell(
    attribute: TrackedAttribute,
    value: Option<AttributeValue>,
    key: (NaiveDate, EntityId),
) -> Result<i64, HistoryError> {
    value
        .and_then(AttributeValue::as_i64)
        .ok_or(HistoryError::UnresolvedValue {
            attribute,
            entity_id: key.1,
            day: key.0,
        })
}
