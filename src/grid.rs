//! Backfill windows and the placeholder (entity x day) grid.

use std::collections::HashSet;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Campaign (or other entity) identifier as reported by the ads API.
pub type EntityId = i64;

pub const DEFAULT_CHANGE_HISTORY_LOOKBACK_DAYS: u64 = 28;
pub const DEFAULT_LAG_LOOKBACK_START_DAYS: u64 = 180;
pub const DEFAULT_LAG_LOOKBACK_END_DAYS: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("window start {start} is after window end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
    #[error("lookback of {days} days from {today} leaves the calendar range")]
    OutOfRange { today: NaiveDate, days: u64 },
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BackfillWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// `today - lookback_days ..= today - 1`.
    pub fn ending_yesterday(today: NaiveDate, lookback_days: u64) -> Result<Self, WindowError> {
        Self::days_ago(today, lookback_days, 1)
    }

    /// `today - start_days_ago ..= today - end_days_ago`.
    pub fn days_ago(
        today: NaiveDate,
        start_days_ago: u64,
        end_days_ago: u64,
    ) -> Result<Self, WindowError> {
        let start = today
            .checked_sub_days(Days::new(start_days_ago))
            .ok_or(WindowError::OutOfRange {
                today,
                days: start_days_ago,
            })?;
        let end = today
            .checked_sub_days(Days::new(end_days_ago))
            .ok_or(WindowError::OutOfRange {
                today,
                days: end_days_ago,
            })?;
        Self::new(start, end)
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        self.start.iter_days().take_while(|day| *day <= self.end).collect()
    }

    pub fn len_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub entity_id: EntityId,
    pub day: NaiveDate,
}

/// Entity-major cross product of entities and days.
///
/// Cells are ordered by the first appearance of each entity, then by
/// ascending day. Repeated entities or days are collapsed so every
/// `(entity_id, day)` pair appears exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderGrid {
    entities: Vec<EntityId>,
    days: Vec<NaiveDate>,
}

impl PlaceholderGrid {
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.entities.len() * self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        self.entities.iter().flat_map(move |entity_id| {
            self.days.iter().map(move |day| GridCell {
                entity_id: *entity_id,
                day: *day,
            })
        })
    }
}

pub fn build_placeholder_grid(entities: &[EntityId], days: &[NaiveDate]) -> PlaceholderGrid {
    let mut days = days.to_vec();
    days.sort_unstable();
    days.dedup();

    PlaceholderGrid {
        entities: unique_in_order(entities),
        days,
    }
}

fn unique_in_order(items: &[EntityId]) -> Vec<EntityId> {
    let mut seen = HashSet::with_capacity(items.len());
    items.iter().copied().filter(|item| seen.insert(*item)).collect()
}
