use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use lab_scraper::config::Config;
use lab_scraper::constants::{CONFIG_ENV_VAR, HARVEST_PREVIEW};
use lab_scraper::logging;
use lab_scraper::metrics;
use lab_scraper::pipeline::processing::aggregate::write_skip_report;
use lab_scraper::pipeline::processing::anonymize::{export_anonymized, Anonymizer};
use lab_scraper::pipeline::processing::harvest::{
    harvest_dir, merge_ranges, read_flat_entries, write_flat_entries,
};
use lab_scraper::pipeline::processing::reference::GenderPolicy;
use lab_scraper::{BatchRunner, RunOptions, Tables};

#[derive(Parser)]
#[command(name = "lab_scraper")]
#[command(about = "Lab report extractor: patient records with reference-range flags")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file (defaults to $LAB_SCRAPER_CONFIG, then config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, evaluate and tabulate every document in a directory
    Run {
        /// Directory of .pdf and/or .txt reports
        input: PathBuf,
        /// Output table path
        #[arg(long)]
        output: Option<PathBuf>,
        /// Skip report path
        #[arg(long)]
        skipped: Option<PathBuf>,
        /// Maximum documents processed at once
        #[arg(long)]
        workers: Option<usize>,
        /// Per-document deadline in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Date used to derive ages (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// CSV of patient_key,gender rows
        #[arg(long)]
        genders: Option<PathBuf>,
        /// fail_open or exclude
        #[arg(long, value_parser = parse_gender_policy)]
        gender_policy: Option<GenderPolicy>,
        /// Write a Prometheus text snapshot of the run's metrics here
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },
    /// Write anonymized text for every document in a directory
    Anonymize {
        input: PathBuf,
        /// Directory receiving <stem>.txt files
        #[arg(long, default_value = "anonymized")]
        out: PathBuf,
    },
    /// Collect the reference intervals printed in reports into a flat table
    Harvest {
        input: PathBuf,
        /// Where the merged table is written
        #[arg(long, default_value = "ref_values_updated.json")]
        out: PathBuf,
        /// Flat reference table to update instead of starting empty
        #[arg(long)]
        base: Option<PathBuf>,
    },
    /// Report test names present in one table but not the other
    Check {
        /// Exit with an error when the tables are misaligned
        #[arg(long)]
        strict: bool,
    },
}

fn parse_gender_policy(s: &str) -> std::result::Result<GenderPolicy, String> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
        "fail_open" => Ok(GenderPolicy::FailOpen),
        "exclude" => Ok(GenderPolicy::Exclude),
        other => Err(format!("unknown gender policy '{}' (expected fail_open or exclude)", other)),
    }
}

fn config_path(cli_path: Option<PathBuf>) -> Option<PathBuf> {
    cli_path.or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from))
}

#[allow(clippy::too_many_arguments)]
async fn run(
    mut config: Config,
    input: &Path,
    output: Option<PathBuf>,
    skipped: Option<PathBuf>,
    workers: Option<usize>,
    timeout_secs: Option<u64>,
    as_of: Option<NaiveDate>,
    genders: Option<PathBuf>,
    gender_policy: Option<GenderPolicy>,
    metrics_out: Option<PathBuf>,
) -> Result<()> {
    // CLI flags override the file
    if let Some(v) = output {
        config.output.table = v;
    }
    if let Some(v) = skipped {
        config.output.skipped = v;
    }
    if let Some(v) = workers {
        config.processing.workers = v.max(1);
    }
    if let Some(v) = timeout_secs {
        config.processing.document_timeout_secs = v;
    }
    if as_of.is_some() {
        config.processing.as_of = as_of;
    }
    if genders.is_some() {
        config.tables.genders = genders;
    }
    if let Some(v) = gender_policy {
        config.processing.gender_policy = v;
    }
    config.validate().context("Invalid configuration")?;

    let prometheus = metrics_out.as_ref().and_then(|_| metrics::install_recorder());

    let tables = Tables::load(&config).context("Failed to load configuration tables")?;
    let alignment = tables.alignment();
    if !alignment.is_aligned() {
        warn!(
            missing_references = ?alignment.missing_references,
            unused_references = ?alignment.unused_references,
            "Test and reference tables are not aligned"
        );
    }

    let runner = BatchRunner::new(Arc::new(tables), RunOptions::from_config(&config.processing));
    let outcome = runner
        .run_dir(input)
        .await
        .with_context(|| format!("Cannot process input '{}'", input.display()))?;

    let columns = outcome
        .batch
        .write_to_path(&config.output.table, config.output.delimiter as u8)
        .with_context(|| format!("Failed to write '{}'", config.output.table.display()))?;
    write_skip_report(&config.output.skipped, &outcome.run_id.to_string(), &outcome.skipped)
        .with_context(|| format!("Failed to write '{}'", config.output.skipped.display()))?;

    if let (Some(handle), Some(path)) = (prometheus.as_ref(), metrics_out.as_ref()) {
        metrics::write_snapshot(handle, path)
            .with_context(|| format!("Failed to write metrics snapshot '{}'", path.display()))?;
    }

    info!(run_id = %outcome.run_id, "Run finished");
    println!("\n📊 Run {}:", outcome.run_id);
    println!("   Documents: {}", outcome.documents);
    println!("   Rows: {}", outcome.batch.len());
    println!("   Skipped: {}", outcome.skipped.len());
    println!("   Columns: {}", columns);
    println!("   Output file: {}", config.output.table.display());
    if !outcome.skipped.is_empty() {
        println!("\n⚠️  Skipped documents (details in {}):", config.output.skipped.display());
        for skip in &outcome.skipped {
            println!("   - {} [{}]", skip.source_file, skip.reason);
        }
    }
    Ok(())
}

fn anonymize(config: &Config, input: &Path, out: &Path) -> Result<()> {
    let anonymizer =
        Anonymizer::from_config(&config.anonymizer).context("Invalid anonymizer configuration")?;
    let summary = export_anonymized(&anonymizer, input, out)
        .with_context(|| format!("Cannot anonymize input '{}'", input.display()))?;

    println!("✅ Wrote {} anonymized files to {}", summary.written.len(), out.display());
    for skip in &summary.skipped {
        println!("   ⚠️  {} [{}]", skip.source_file, skip.reason);
    }
    Ok(())
}

fn harvest(input: &Path, out: &Path, base: Option<&Path>) -> Result<()> {
    let harvest = harvest_dir(input)
        .with_context(|| format!("Cannot harvest input '{}'", input.display()))?;
    let base = match base {
        Some(path) => read_flat_entries(path)?,
        None => Vec::new(),
    };
    let merged = merge_ranges(base, &harvest.ranges);
    write_flat_entries(out, &merged)
        .with_context(|| format!("Failed to write '{}'", out.display()))?;

    println!(
        "✅ Harvested {} intervals from {} documents into {} ({} entries)",
        harvest.ranges.len(),
        harvest.documents,
        out.display(),
        merged.len()
    );
    for (name, info) in merged.iter().take(HARVEST_PREVIEW) {
        println!("   {:<35} {}", name, serde_json::Value::Object(info.clone()));
    }
    for skip in &harvest.skipped {
        println!("   ⚠️  {} [{}]", skip.source_file, skip.reason);
    }
    Ok(())
}

fn check(config: &Config, strict: bool) -> Result<bool> {
    let tables = Tables::load(config).context("Failed to load configuration tables")?;
    let alignment = tables.alignment();

    println!(
        "🔍 {} extraction rules, {} reference rule sets",
        tables.catalog.len(),
        tables.references.len()
    );
    for name in &alignment.missing_references {
        println!("   - no reference rules for '{}'", name);
    }
    for name in &alignment.unused_references {
        println!("   - reference rules for '{}' are never extracted", name);
    }
    if alignment.is_aligned() {
        println!("✅ Tables are aligned");
    }

    Ok(alignment.is_aligned() || !strict)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(config_path(cli.config).as_deref()).context("Failed to load configuration")?;
    let guard = logging::init_logging(&config.logging);

    match cli.command {
        Commands::Run {
            input,
            output,
            skipped,
            workers,
            timeout_secs,
            as_of,
            genders,
            gender_policy,
            metrics_out,
        } => {
            if let Err(e) = run(
                config,
                &input,
                output,
                skipped,
                workers,
                timeout_secs,
                as_of,
                genders,
                gender_policy,
                metrics_out,
            )
            .await
            {
                error!("Run failed: {:#}", e);
                return Err(e);
            }
        }
        Commands::Anonymize { input, out } => anonymize(&config, &input, &out)?,
        Commands::Harvest { input, out, base } => harvest(&input, &out, base.as_deref())?,
        Commands::Check { strict } => {
            if !check(&config, strict)? {
                // exit skips destructors; flush the log writer first
                drop(guard);
                std::process::exit(1);
            }
        }
    }

    drop(guard);
    Ok(())
}
