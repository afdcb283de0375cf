use arp_backfill::{
    backfill_config_from_env, build_lag_adjustments, init_logging, log_run_start,
    log_task_finish, logging_config_from_env, CsvReportSource, LagBucketMapping, LagCurveBuilder,
    LagCurveConfig, SqlitePartitionStore,
};
use chrono::Utc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;

    let config = backfill_config_from_env()?;
    log_run_start("conv_lag_adjustment", &logging, &config);

    let mapping = match &config.lag_mapping_path {
        Some(path) => LagBucketMapping::from_path(path)?,
        None => LagBucketMapping::embedded()?,
    };
    let builder = LagCurveBuilder::new(mapping, LagCurveConfig::default());

    let today = config.today.unwrap_or_else(|| Utc::now().date_naive());
    let window = config.lag_window(today)?;
    let source = CsvReportSource::new(config.reports_dir.clone());
    let mut store = SqlitePartitionStore::open(&config.store_path)?;

    let report = build_lag_adjustments(&source, &mut store, &builder, &window, &config.accounts)?;
    log_task_finish(
        "lag_adjustments",
        if report.placeholder { "placeholder" } else { "completed" },
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
