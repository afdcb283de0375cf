//! Conversion-lag adjustment curves from bucketed lag counts.
//!
//! Buckets are mapped to a representative day, counts are summed per
//! `(group, day)`, and the cumulative share of conversions is spread evenly
//! over the days each bucket spans. The first bucket of a group contributes
//! its whole cumulative share on day one.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_LAG_MAPPING_CSV: &str = include_str!("../data/conversion_lag_mapping.csv");
pub const LAG_ADJUSTMENTS_TABLE: &str = "conversion_lag_adjustments";

#[derive(Debug, Error)]
pub enum LagCurveError {
    #[error("lag bucket '{0}' has no day mapping")]
    UnknownBucket(String),
    #[error("duplicate lag bucket '{0}' in mapping")]
    DuplicateBucket(String),
    #[error("lag bucket mapping is empty")]
    EmptyMapping,
    #[error("group key has {found} values, expected {expected}")]
    GroupKeyArity { expected: usize, found: usize },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct MappingRecord {
    conversion_lag_bucket: String,
    lag_number: u32,
}

/// Immutable bucket label -> representative day lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagBucketMapping {
    days: BTreeMap<String, u32>,
}

impl LagBucketMapping {
    pub fn embedded() -> Result<Self, LagCurveError> {
        Self::from_csv_reader(DEFAULT_LAG_MAPPING_CSV.as_bytes())
    }

    pub fn from_path(path: &Path) -> Result<Self, LagCurveError> {
        Self::from_csv_reader(File::open(path)?)
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, LagCurveError> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut pairs = Vec::new();
        for record in csv_reader.deserialize::<MappingRecord>() {
            let record = record?;
            pairs.push((record.conversion_lag_bucket, record.lag_number));
        }
        Self::from_pairs(pairs)
    }

    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (String, u32)>,
    ) -> Result<Self, LagCurveError> {
        let mut days = BTreeMap::new();
        for (label, day) in pairs {
            if days.insert(label.clone(), day).is_some() {
                return Err(LagCurveError::DuplicateBucket(label));
            }
        }
        if days.is_empty() {
            return Err(LagCurveError::EmptyMapping);
        }
        Ok(Self { days })
    }

    pub fn day_for(&self, label: &str) -> Result<u32, LagCurveError> {
        self.days
            .get(label)
            .copied()
            .ok_or_else(|| LagCurveError::UnknownBucket(label.to_string()))
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// SHA-256 over the sorted `label:day;` pairs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (label, day) in &self.days {
            hasher.update(format!("{label}:{day};"));
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagObservation {
    pub group_key: Vec<String>,
    pub lag_bucket: String,
    pub conversions: f64,
}

/// Conversion-lag report row grouped by network and conversion action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagReportRow {
    pub network: String,
    pub conversion_id: String,
    pub conversion_lag_bucket: String,
    pub all_conversions: f64,
}

impl LagReportRow {
    pub fn into_observation(self) -> LagObservation {
        LagObservation {
            group_key: vec![self.network, self.conversion_id],
            lag_bucket: self.conversion_lag_bucket,
            conversions: self.all_conversions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagCurveConfig {
    pub group_by: Vec<String>,
}

impl Default for LagCurveConfig {
    fn default() -> Self {
        Self {
            group_by: vec!["network".to_string(), "conversion_id".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagCurvePoint {
    pub group_key: Vec<String>,
    pub lag_day: u32,
    pub lag_adjustment: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagAdjustmentCurve {
    pub group_by: Vec<String>,
    pub points: Vec<LagCurvePoint>,
    pub mapping_fingerprint: String,
}

impl LagAdjustmentCurve {
    pub fn is_placeholder(&self) -> bool {
        self.points.len() == 1 && self.points[0].lag_day == 0
    }
}

/// Single zero row so downstream joins always have a default.
pub fn placeholder_curve(group_by: &[String], mapping_fingerprint: &str) -> LagAdjustmentCurve {
    LagAdjustmentCurve {
        group_by: group_by.to_vec(),
        points: vec![LagCurvePoint {
            group_key: vec![String::new(); group_by.len()],
            lag_day: 0,
            lag_adjustment: 0.0,
        }],
        mapping_fingerprint: mapping_fingerprint.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct LagCurveBuilder {
    mapping: LagBucketMapping,
    config: LagCurveConfig,
}

#[derive(Debug, Clone, Copy)]
struct BucketStep {
    lag_distance: u32,
    daily_incremental_lag: f64,
}

impl LagCurveBuilder {
    pub fn new(mapping: LagBucketMapping, config: LagCurveConfig) -> Self {
        Self { mapping, config }
    }

    pub fn mapping(&self) -> &LagBucketMapping {
        &self.mapping
    }

    pub fn build(
        &self,
        observations: &[LagObservation],
    ) -> Result<LagAdjustmentCurve, LagCurveError> {
        let fingerprint = self.mapping.fingerprint();
        info!(
            component = "lag_curve",
            event = "lag_curve.build.start",
            observations = observations.len(),
            group_by = ?self.config.group_by,
            mapping_fingerprint = %fingerprint
        );

        let grouped = self.sum_by_group_and_day(observations)?;
        let mut points = Vec::new();
        let mut groups_built = 0usize;

        for (group_key, counts) in grouped {
            let total: f64 = counts.values().sum();
            if total <= 0.0 {
                warn!(
                    component = "lag_curve",
                    event = "lag_curve.group.skipped",
                    group_key = ?group_key,
                    total_conversions = total,
                    reason = "non_positive_total"
                );
                continue;
            }

            let steps = bucket_steps(&counts, total);
            expand_steps(&group_key, &steps, &mut points);
            groups_built += 1;
        }

        if points.is_empty() {
            warn!(
                component = "lag_curve",
                event = "lag_curve.build.placeholder",
                observations = observations.len()
            );
            return Ok(placeholder_curve(&self.config.group_by, &fingerprint));
        }

        info!(
            component = "lag_curve",
            event = "lag_curve.build.finish",
            groups = groups_built,
            points = points.len(),
            mapping_fingerprint = %fingerprint
        );

        Ok(LagAdjustmentCurve {
            group_by: self.config.group_by.clone(),
            points,
            mapping_fingerprint: fingerprint,
        })
    }

    fn sum_by_group_and_day(
        &self,
        observations: &[LagObservation],
    ) -> Result<BTreeMap<Vec<String>, BTreeMap<u32, f64>>, LagCurveError> {
        let expected = self.config.group_by.len();
        let mut grouped: BTreeMap<Vec<String>, BTreeMap<u32, f64>> = BTreeMap::new();

        for observation in observations {
            if observation.group_key.len() != expected {
                return Err(LagCurveError::GroupKeyArity {
                    expected,
                    found: observation.group_key.len(),
                });
            }
            let day = self.mapping.day_for(&observation.lag_bucket)?;
            *grouped
                .entry(observation.group_key.clone())
                .or_default()
                .entry(day)
                .or_insert(0.0) += observation.conversions;
        }

        Ok(grouped)
    }
}

/// `counts` is ordered by representative day.
fn bucket_steps(counts: &BTreeMap<u32, f64>, total: f64) -> Vec<BucketStep> {
    let mut steps = Vec::with_capacity(counts.len());
    let mut cumsum = 0.0;
    let mut previous: Option<(u32, f64)> = None;

    for (&day, &count) in counts {
        cumsum += count;
        let pct_conv = cumsum / total;
        let (lag_distance, daily_incremental_lag) = match previous {
            Some((prev_day, prev_pct)) => (day - prev_day, pct_conv - prev_pct),
            None => (1, pct_conv),
        };
        steps.push(BucketStep {
            lag_distance,
            daily_incremental_lag,
        });
        previous = Some((day, pct_conv));
    }

    steps
}

fn expand_steps(group_key: &[String], steps: &[BucketStep], out: &mut Vec<LagCurvePoint>) {
    let mut lag_adjustment = 0.0;
    let mut lag_day = 0u32;

    for step in steps {
        let incremental_lag = step.daily_incremental_lag / f64::from(step.lag_distance);
        for _ in 0..step.lag_distance {
            lag_adjustment += incremental_lag;
            lag_day += 1;
            out.push(LagCurvePoint {
                group_key: group_key.to_vec(),
                lag_day,
                lag_adjustment,
            });
        }
    }
}
