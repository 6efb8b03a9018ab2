use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::collections::HashSet;
use std::path::PathBuf;

use hrrs::export::{self, ExportFormat};
use hrrs::import::{parse_date, CsvImporter, SessionFilter};
use hrrs::logging::{init_logging, LogLevel};
use hrrs::{BatchProcessor, HrrConfig, Overrides, SessionPipeline};

/// hrrs - Heart Rate Recovery feature extraction
///
/// Detects exertion peaks in per-second heart-rate streams, fits the
/// exponential recovery that follows, and grades every interval.
#[derive(Parser)]
#[command(name = "hrrs")]
#[command(author = "hrrs Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Heart Rate Recovery analysis CLI", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute recovery features for every session in a samples file
    Analyze {
        /// Samples CSV (session_id, timestamp, heart_rate_bpm)
        #[arg(short, long)]
        samples: PathBuf,

        /// Manual peak adjustments CSV
        #[arg(long)]
        peak_adjustments: Option<PathBuf>,

        /// Manual quality overrides CSV
        #[arg(long)]
        quality_overrides: Option<PathBuf>,

        /// Only this session
        #[arg(long)]
        session: Option<String>,

        /// Date range start (YYYY-MM-DD)
        #[arg(short, long)]
        from: Option<String>,

        /// Date range end (YYYY-MM-DD)
        #[arg(short, long)]
        to: Option<String>,

        /// Output format (table, json, csv)
        #[arg(long, default_value = "table")]
        format: ExportFormat,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker threads
        #[arg(long)]
        threads: Option<usize>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Configure application settings
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,

        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,

        /// Validate a configuration file
        #[arg(long, value_name = "FILE")]
        validate: Option<PathBuf>,
    },
}

struct AnalyzeArgs {
    samples: PathBuf,
    peak_adjustments: Option<PathBuf>,
    quality_overrides: Option<PathBuf>,
    filter: SessionFilter,
    format: ExportFormat,
    output: Option<PathBuf>,
    threads: Option<usize>,
    progress: bool,
}

fn parse_date_arg(value: Option<String>, name: &str) -> Result<Option<chrono::NaiveDate>> {
    match value {
        None => Ok(None),
        Some(text) => parse_date(&text)
            .map(Some)
            .with_context(|| format!("Invalid --{} date '{}', expected YYYY-MM-DD", name, text)),
    }
}

fn analyze(mut config: HrrConfig, args: AnalyzeArgs) -> Result<()> {
    if args.threads.is_some() {
        config.batch.num_threads = args.threads;
    }
    config.batch.show_progress |= args.progress;
    config.validate()?;

    let importer = CsvImporter::new();
    let all_sessions = importer
        .import_samples(&args.samples)
        .with_context(|| format!("Failed to load samples from {}", args.samples.display()))?;

    let loaded: HashSet<String> = all_sessions.iter().map(|s| s.session_id.clone()).collect();
    let sessions = args.filter.apply(all_sessions);
    let selected: HashSet<String> = sessions.iter().map(|s| s.session_id.clone()).collect();
    // Records of sessions that were loaded but filtered out are not "unknown"
    let wanted = |id: &str| selected.contains(id) || !loaded.contains(id);

    // Malformed rows are reported whatever the selection
    let mut load_warnings = Vec::new();

    let mut adjustments = match &args.peak_adjustments {
        Some(path) => {
            let loaded = importer
                .import_peak_adjustments(path)
                .with_context(|| format!("Failed to load peak adjustments from {}", path.display()))?;
            load_warnings.extend(loaded.warnings);
            loaded.records
        }
        None => Vec::new(),
    };
    adjustments.retain(|a| wanted(&a.session_id));

    let mut quality_overrides = match &args.quality_overrides {
        Some(path) => {
            let loaded = importer
                .import_quality_overrides(path)
                .with_context(|| format!("Failed to load quality overrides from {}", path.display()))?;
            load_warnings.extend(loaded.warnings);
            loaded.records
        }
        None => Vec::new(),
    };
    quality_overrides.retain(|q| wanted(&q.session_id));

    let overrides = Overrides::new(adjustments, quality_overrides).with_warnings(load_warnings);

    if sessions.is_empty() {
        println!("{}", "No sessions match the selection".yellow());
        return Ok(());
    }

    eprintln!(
        "{}",
        format!("Analyzing {} sessions...", sessions.len()).green().bold()
    );

    let processor = BatchProcessor::new(SessionPipeline::new(config));
    let report = processor.process(sessions, &overrides)?;

    let rendered = export::render(&report.sessions, args.format)?;
    match &args.output {
        Some(path) => {
            export::write_output(&rendered, path)?;
            eprintln!("{} {}", "✓ Features written to".green(), path.display());
        }
        None => print!("{}", rendered),
    }

    for warning in &report.warnings {
        eprintln!("{} {}", "warning:".yellow().bold(), warning);
    }
    for failure in &report.failures {
        eprintln!(
            "{} session {}: {}",
            "✗".red().bold(),
            failure.session_id.bold(),
            failure.error
        );
    }

    let summary = &report.summary;
    let headline = format!(
        "{} sessions, {} intervals: {} pass, {} flagged, {} rejected",
        summary.successful_sessions,
        summary.total_intervals,
        summary.passed,
        summary.flagged,
        summary.rejected
    );
    if summary.is_fully_successful() {
        eprintln!("{}", headline.green());
    } else {
        eprintln!("{} ({} failed)", headline.yellow(), summary.failed_sessions);
    }

    Ok(())
}

fn manage_config(config: HrrConfig, show: bool, init: bool, validate: Option<PathBuf>) -> Result<()> {
    if let Some(path) = validate {
        HrrConfig::load_from_file(&path)?;
        println!("{} {}", "✓ Configuration is valid:".green(), path.display());
    }

    if init {
        let path = HrrConfig::default_config_path();
        if path.exists() {
            println!("{} {}", "Config already exists at".yellow(), path.display());
        } else {
            HrrConfig::default().save_to_file(&path)?;
            println!("{} {}", "✓ Wrote default configuration to".green(), path.display());
        }
    }

    if show {
        println!("{}", config.to_toml()?);
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HrrConfig::load_or_default(cli.config.as_deref())?;
    if cli.verbose > 0 {
        config.logging.level = LogLevel::from_verbosity(cli.verbose);
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Analyze {
            samples,
            peak_adjustments,
            quality_overrides,
            session,
            from,
            to,
            format,
            output,
            threads,
            progress,
        } => {
            let filter = SessionFilter {
                session_id: session,
                from: parse_date_arg(from, "from")?,
                to: parse_date_arg(to, "to")?,
            };
            let args = AnalyzeArgs {
                samples,
                peak_adjustments,
                quality_overrides,
                filter,
                format,
                output,
                threads,
                progress,
            };
            analyze(config, args)
        }

        Commands::Config { show, init, validate } => {
            let show = show || (!init && validate.is_none());
            manage_config(config, show, init, validate)
        }
    }
}
