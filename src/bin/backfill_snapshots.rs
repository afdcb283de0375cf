use arp_backfill::{
    backfill_config_from_env, init_logging, log_run_start, logging_config_from_env,
    run_backfill_tasks, CsvReportSource, SqlitePartitionStore,
};
use chrono::Utc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;

    let config = backfill_config_from_env()?;
    log_run_start("backfill_snapshots", &logging, &config);

    let today = config.today.unwrap_or_else(|| Utc::now().date_naive());
    let source = CsvReportSource::new(config.reports_dir.clone());
    let mut store = SqlitePartitionStore::open(&config.store_path)?;

    // Stdout carries only the JSON summary; progress goes to the log.
    let summary = run_backfill_tasks(&config, today, &source, &mut store)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
