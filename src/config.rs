//! Runtime configuration for the backfill binaries.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::{
    BackfillWindow, WindowError, DEFAULT_CHANGE_HISTORY_LOOKBACK_DAYS,
    DEFAULT_LAG_LOOKBACK_END_DAYS, DEFAULT_LAG_LOOKBACK_START_DAYS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillTask {
    BidBudgets,
    Cohorts,
    Incremental,
}

impl BackfillTask {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BidBudgets => "bid_budgets",
            Self::Cohorts => "cohorts",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackfillTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackfillTask {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bid_budgets" => Ok(Self::BidBudgets),
            "cohorts" => Ok(Self::Cohorts),
            "incremental" => Ok(Self::Incremental),
            _ => Err(ConfigError::UnknownTask(raw.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown backfill task '{0}'")]
    UnknownTask(String),
    #[error("{key} must be a non-negative integer, got '{value}'")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be YYYY-MM-DD, got '{value}'")]
    InvalidDate { key: &'static str, value: String },
    #[error("lag lookback start ({start_days}) must be at least the end ({end_days})")]
    LagLookbackInverted { start_days: u64, end_days: u64 },
    #[error("incremental task requires ARP_INCREMENTAL_TABLE")]
    MissingIncrementalTable,
    #[error(transparent)]
    Window(#[from] WindowError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub store_path: PathBuf,
    pub reports_dir: PathBuf,
    pub tasks: Vec<BackfillTask>,
    pub incremental_table: Option<String>,
    pub change_history_lookback_days: u64,
    pub lag_lookback_start_days: u64,
    pub lag_lookback_end_days: u64,
    pub lag_mapping_path: Option<PathBuf>,
    pub accounts: Vec<String>,
    /// Overrides the current date when computing windows.
    pub today: Option<NaiveDate>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("data/arp_backfill.sqlite"),
            reports_dir: PathBuf::from("data/reports"),
            tasks: vec![BackfillTask::BidBudgets, BackfillTask::Cohorts],
            incremental_table: None,
            change_history_lookback_days: DEFAULT_CHANGE_HISTORY_LOOKBACK_DAYS,
            lag_lookback_start_days: DEFAULT_LAG_LOOKBACK_START_DAYS,
            lag_lookback_end_days: DEFAULT_LAG_LOOKBACK_END_DAYS,
            lag_mapping_path: None,
            accounts: Vec::new(),
            today: None,
        }
    }
}

impl BackfillConfig {
    pub fn change_history_window(&self, today: NaiveDate) -> Result<BackfillWindow, WindowError> {
        BackfillWindow::ending_yesterday(today, self.change_history_lookback_days)
    }

    pub fn lag_window(&self, today: NaiveDate) -> Result<BackfillWindow, WindowError> {
        BackfillWindow::days_ago(today, self.lag_lookback_start_days, self.lag_lookback_end_days)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lag_lookback_start_days < self.lag_lookback_end_days {
            return Err(ConfigError::LagLookbackInverted {
                start_days: self.lag_lookback_start_days,
                end_days: self.lag_lookback_end_days,
            });
        }
        if self.tasks.contains(&BackfillTask::Incremental) && self.incremental_table.is_none() {
            return Err(ConfigError::MissingIncrementalTable);
        }
        Ok(())
    }
}

/// Reads `ARP_*` variables over the defaults. Unset or blank variables keep
/// the default; set but malformed values are errors.
pub fn backfill_config_from_env() -> Result<BackfillConfig, ConfigError> {
    let mut config = BackfillConfig::default();

    if let Some(path) = non_empty_var("ARP_STORE_PATH") {
        config.store_path = PathBuf::from(path);
    }
    if let Some(path) = non_empty_var("ARP_REPORTS_DIR") {
        config.reports_dir = PathBuf::from(path);
    }
    if let Some(raw) = non_empty_var("ARP_BACKFILL_TASKS") {
        let mut tasks = Vec::new();
        for part in raw.split(',').filter(|part| !part.trim().is_empty()) {
            let task: BackfillTask = part.parse()?;
            if !tasks.contains(&task) {
                tasks.push(task);
            }
        }
        config.tasks = tasks;
    }
    config.incremental_table = non_empty_var("ARP_INCREMENTAL_TABLE");
    if let Some(raw) = non_empty_var("ARP_CHANGE_HISTORY_LOOKBACK_DAYS") {
        config.change_history_lookback_days =
            parse_days("ARP_CHANGE_HISTORY_LOOKBACK_DAYS", &raw)?;
    }
    if let Some(raw) = non_empty_var("ARP_LAG_LOOKBACK_START_DAYS") {
        config.lag_lookback_start_days = parse_days("ARP_LAG_LOOKBACK_START_DAYS", &raw)?;
    }
    if let Some(raw) = non_empty_var("ARP_LAG_LOOKBACK_END_DAYS") {
        config.lag_lookback_end_days = parse_days("ARP_LAG_LOOKBACK_END_DAYS", &raw)?;
    }
    config.lag_mapping_path = non_empty_var("ARP_LAG_MAPPING_PATH").map(PathBuf::from);
    if let Some(raw) = non_empty_var("ARP_ACCOUNTS") {
        config.accounts = raw
            .split(',')
            .map(str::trim)
            .filter(|account| !account.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(raw) = non_empty_var("ARP_TODAY") {
        let today = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
            ConfigError::InvalidDate {
                key: "ARP_TODAY",
                value: raw.clone(),
            }
        })?;
        config.today = Some(today);
    }

    config.validate()?;
    Ok(config)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_days(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: raw.to_string(),
    })
}
