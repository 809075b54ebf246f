use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use harvest_core::{
    load_crawler_config, AffinityToken, CancelToken, ChromiumSessionFactory,
    CollectionStateMachine, CouponKind, CrawlReport, CrawlerConfig, DealRecord, RunOutcome,
    SessionPool,
};

pub mod commands;

use commands::CollectArgs;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] harvest_core::ConfigError),
    #[error("session error: {0}")]
    Session(#[from] harvest_core::SessionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Coupon listing crawler control interface", long_about = None)]
pub struct Cli {
    /// Path to the crawler config file
    #[arg(long, default_value = "configs/crawler.toml")]
    pub config: PathBuf,
    /// Stdout rendering format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one collection pass
    Collect(CollectArgs),
    /// Load and validate the config, then print a summary
    ConfigCheck,
}

pub fn run(cli: Cli) -> Result<()> {
    init_tracing();

    match &cli.command {
        Commands::Collect(args) => {
            let config = load_crawler_config(&cli.config)?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let summary = runtime.block_on(run_collection(config, args))?;
            render(&summary, cli.format)?;
        }
        Commands::ConfigCheck => {
            let config = load_crawler_config(&cli.config)?;
            let report = config_report(&cli.config, &config);
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (e.g. from tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_collection(mut config: CrawlerConfig, args: &CollectArgs) -> Result<CollectSummary> {
    if let Some(max_items) = args.max_items {
        config.collection.max_items = max_items;
    }
    if args.no_headless {
        config.chromium.headless = false;
    }
    if let Some(seconds) = args.acquire_timeout {
        config.pool.max_wait_seconds = seconds;
    }
    config.validate()?;

    let factory = Arc::new(ChromiumSessionFactory::new(
        config.chromium.clone(),
        config.flags.clone(),
        &config.page,
    ));
    let pool = SessionPool::open(config.pool.clone(), factory).await?;
    pool.spawn_monitor(config.monitor.clone());

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing current iteration");
                cancel.cancel();
            }
        });
    }

    let machine = CollectionStateMachine::new(config.collection.clone(), config.page.clone());
    let token = AffinityToken::new();
    let lease = pool.acquire(config.pool.max_wait(), Some(&token)).await?;
    let run = machine.collect(lease.session(), &cancel).await;
    pool.release(lease);
    pool.close_all().await;
    let run = run?;

    let outputs = match &args.output_dir {
        Some(dir) => write_outputs(dir, &run.records, &run.report)?,
        None => Vec::new(),
    };

    Ok(CollectSummary {
        outcome: run.outcome,
        collected: run.records.len(),
        report: run.report,
        records: run.records,
        outputs,
    })
}

/// Persist one run as json, csv and plain text next to each other, stamped
/// with the run's finish time.
fn write_outputs(
    dir: &Path,
    records: &[DealRecord],
    report: &CrawlReport,
) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let base = dir.join(format!("coupons_{stamp}"));

    let json_path = base.with_extension("json");
    let payload = serde_json::json!({
        "report": report,
        "records": records,
    });
    fs::write(&json_path, serde_json::to_string_pretty(&payload)?)?;

    let csv_path = base.with_extension("csv");
    fs::write(&csv_path, records_to_csv(records)?)?;

    let txt_path = base.with_extension("txt");
    fs::write(&txt_path, records_to_text(records, report))?;

    Ok(vec![json_path, csv_path, txt_path])
}

fn records_to_csv(records: &[DealRecord]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "id",
        "url",
        "index",
        "coupon_kind",
        "coupon_value",
        "raw_text",
        "collected_at",
    ])?;
    for record in records {
        writer.write_record([
            record.id.as_str(),
            record.url.as_str(),
            &record.index.to_string(),
            kind_label(record.coupon.kind),
            &record.coupon.value.to_string(),
            record.coupon.raw_text.as_str(),
            &record.collected_at.to_rfc3339(),
        ])?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|err| AppError::Io(err.into_error()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn records_to_text(records: &[DealRecord], report: &CrawlReport) -> String {
    let mut lines = vec![format!(
        "{} unique, {} duplicates, {:.1}s",
        report.unique_count, report.duplicate_count, report.duration_secs
    )];
    for (n, record) in records.iter().enumerate() {
        lines.push(format!(
            "{}. {} | {} {} | {}",
            n + 1,
            record.id,
            record.coupon.value,
            kind_label(record.coupon.kind),
            record.url
        ));
    }
    lines.join("\n") + "\n"
}

fn kind_label(kind: CouponKind) -> &'static str {
    match kind {
        CouponKind::Percentage => "percentage",
        CouponKind::Fixed => "fixed",
    }
}

fn config_report(path: &Path, config: &CrawlerConfig) -> ConfigReport {
    ConfigReport {
        path: path.display().to_string(),
        pool_max_size: config.pool.max_size,
        pool_min_idle: config.pool.min_idle,
        max_items: config.collection.max_items,
        listing_url: config.page.listing_url.clone(),
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct CollectSummary {
    pub outcome: RunOutcome,
    pub collected: usize,
    pub report: CrawlReport,
    pub records: Vec<DealRecord>,
    pub outputs: Vec<PathBuf>,
}

impl DisplayFallback for CollectSummary {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Outcome: {} ({} items in {:.1}s)",
            self.outcome, self.collected, self.report.duration_secs
        )];
        lines.push(format!(
            "Seen: {} total, {} unique, {} duplicates",
            self.report.total_seen, self.report.unique_count, self.report.duplicate_count
        ));
        for (kind, stats) in &self.report.coupon_stats {
            lines.push(format!(
                "  - {}: {} items, avg {:.2}",
                kind_label(*kind),
                stats.count,
                stats.avg_value
            ));
        }
        for path in &self.outputs {
            lines.push(format!("Wrote {}", path.display()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub path: String,
    pub pool_max_size: usize,
    pub pool_min_idle: usize,
    pub max_items: usize,
    pub listing_url: String,
}

impl DisplayFallback for ConfigReport {
    fn display(&self) -> String {
        format!(
            "Config {} is valid\n  pool: max_size={} min_idle={}\n  collection: max_items={}\n  listing: {}",
            self.path, self.pool_max_size, self.pool_min_idle, self.max_items, self.listing_url
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::Coupon;
    use tempfile::TempDir;

    fn sample_record() -> DealRecord {
        DealRecord {
            id: "B0EXAMPLE1".to_string(),
            url: "https://www.amazon.com/dp/B0EXAMPLE1".to_string(),
            index: 0,
            coupon: Coupon {
                kind: CouponKind::Percentage,
                value: 20.0,
                raw_text: "Save 20%, limited".to_string(),
            },
            collected_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn sample_report() -> CrawlReport {
        CrawlReport {
            started_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            duration_secs: 12.5,
            total_seen: 1,
            unique_count: 1,
            duplicate_count: 0,
            duplicate_rate: 0.0,
            coupon_stats: Default::default(),
        }
    }

    #[test]
    fn csv_quotes_embedded_commas_and_quotes() {
        let csv = records_to_csv(&[sample_record()]).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,url,index"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"Save 20%, limited\""));
        assert!(row.contains("percentage"));
    }

    #[test]
    fn csv_quotes_carriage_returns_in_badge_text() {
        let mut record = sample_record();
        record.coupon.raw_text = "Save 20%\rlimited".to_string();
        let csv = records_to_csv(&[record]).unwrap();
        // The raw badge text flows in unfiltered; a stray CR must not be
        // able to break the row.
        assert!(csv.contains("\"Save 20%\rlimited\""));
        assert_eq!(csv.matches('\n').count(), 2);
    }

    #[test]
    fn output_files_are_written_in_all_three_formats() {
        let temp = TempDir::new().unwrap();
        let paths = write_outputs(temp.path(), &[sample_record()], &sample_report()).unwrap();
        assert_eq!(paths.len(), 3);
        for path in &paths {
            assert!(path.exists(), "{} missing", path.display());
        }
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths[0]).unwrap()).unwrap();
        assert_eq!(json["records"][0]["id"], "B0EXAMPLE1");
        assert_eq!(json["report"]["unique_count"], 1);
        let txt = fs::read_to_string(&paths[2]).unwrap();
        assert!(txt.contains("1. B0EXAMPLE1 | 20 percentage"));
    }

    #[test]
    fn config_report_reads_the_fixture() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/crawler.toml");
        let config = load_crawler_config(&path).unwrap();
        let report = config_report(&path, &config);
        assert_eq!(report.pool_max_size, 5);
        assert!(report.listing_url.starts_with("https://"));
    }

    #[test]
    fn collect_args_overrides_parse() {
        let cli = Cli::parse_from([
            "harvestctl",
            "collect",
            "-m",
            "25",
            "--no-headless",
            "--acquire-timeout",
            "10",
        ]);
        match cli.command {
            Commands::Collect(args) => {
                assert_eq!(args.max_items, Some(25));
                assert!(args.no_headless);
                assert_eq!(args.acquire_timeout, Some(10));
                assert!(args.output_dir.is_none());
            }
            _ => panic!("expected collect subcommand"),
        }
    }
}
