//! fring - inspect and drive a faultring shared error ring.
//!
//! Every subcommand maps onto one `faultring-core` operation against the
//! region selected by `--region-dir` / `--name` (or the config file).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use faultring_core::capture::ErrorEvent;
use faultring_core::config::Config;
use faultring_core::logging::{LogLevel, init_logging};
use faultring_core::record::{Record, Severity};
use faultring_core::region::{Attachment, SharedRegion, region_path};
use faultring_core::ring::ErrorRing;
use faultring_core::ring_store::RingStats;

#[derive(Parser)]
#[command(name = "fring")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

#[derive(Args)]
struct GlobalOpts {
    /// Config file (default: $FAULTRING_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the shared region
    #[arg(long, global = true, env = "FAULTRING_REGION_DIR")]
    region_dir: Option<PathBuf>,

    /// Region name
    #[arg(long, global = true)]
    name: Option<String>,

    /// Ring capacity in records
    #[arg(long, global = true)]
    capacity: Option<usize>,

    /// Output format
    #[arg(long, short = 'f', global = true, value_enum, default_value_t = OutputFormat::Pretty)]
    format: OutputFormat,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the shared region, or attach to it if it already exists
    Init,

    /// Record one error event
    Capture {
        /// Error message text
        message: String,

        /// SQLSTATE-style status code
        #[arg(long)]
        status: Option<String>,

        /// Request text that triggered the error
        #[arg(long)]
        query: Option<String>,

        /// Severity of the event
        #[arg(long, default_value_t = Severity::Error)]
        severity: Severity,

        /// Origin id to stamp (default: this process id)
        #[arg(long)]
        origin: Option<i32>,
    },

    /// Show the most recent error from one origin
    Last {
        /// Origin id to look up. Required unless `ring.origin_id` is set in
        /// the config, since every fring run has its own process id.
        #[arg(long)]
        origin: Option<i32>,
    },

    /// List live records in slot order
    History {
        /// Maximum records to return (0 or less: all)
        #[arg(long, short = 'n', default_value_t = 0, allow_negative_numbers = true)]
        limit: i64,
    },

    /// Reset the ring to empty
    Clear,

    /// Show occupancy and counters
    Stats,

    /// Remove the shared region and its lock files
    Destroy,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(core) = err.downcast_ref::<faultring_core::Error>() {
                eprint!("{}", core.remediation().render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.global)?;

    let mut log_config = config.logging.clone();
    if cli.global.verbose > 0 {
        log_config.level = LogLevel::from_verbosity(cli.global.verbose)
            .as_str()
            .to_string();
    }
    init_logging(&log_config).context("initialize logging")?;
    tracing::debug!(
        region = %region_path(&config.ring.region_dir, &config.ring.region_name).display(),
        capacity = config.ring.capacity,
        "Resolved ring config"
    );

    let format = cli.global.format;
    let ring = ErrorRing::new();

    match cli.command {
        Commands::Init => {
            let attachment = ring.attach(&config.ring)?;
            let report = InitReport {
                attachment: match attachment {
                    Attachment::Created => "created",
                    Attachment::Attached => "attached",
                },
                region: region_path(&config.ring.region_dir, &config.ring.region_name),
                capacity: config.ring.capacity,
            };
            emit(format, &report, |r| {
                format!("{} {} (capacity {})", r.attachment, r.region.display(), r.capacity)
            })
        }
        Commands::Capture {
            message,
            status,
            query,
            severity,
            origin,
        } => {
            let mut ring_config = config.ring.clone();
            if origin.is_some() {
                ring_config.origin_id = origin;
            }
            ring.attach(&ring_config)?;

            let mut event = ErrorEvent::new(severity, message);
            event.status_code = status;
            event.query_text = query;
            let receipt = ring.try_capture(&event)?;
            emit(format, &receipt, |r| {
                format!("captured into slot {} (total written {})", r.slot, r.total_written)
            })
        }
        Commands::Last { origin } => {
            ring.attach_existing(&config.ring)?;
            let Some(origin) = origin.or(config.ring.origin_id) else {
                bail!(
                    "`fring last` needs --origin <ID> (or ring.origin_id in the config); \
                     a bare run would look up its own process id"
                );
            };
            let record = ring.query_last(origin)?;
            emit(format, &record, |r| match r {
                Some(record) => render_record(record),
                None => format!("no error recorded for origin {origin}"),
            })
        }
        Commands::History { limit } => {
            ring.attach_existing(&config.ring)?;
            let records: Vec<Record> = ring.query_history(limit)?.collect();
            emit(format, &records, |records| {
                if records.is_empty() {
                    return "no errors recorded".to_string();
                }
                records
                    .iter()
                    .map(render_record)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        Commands::Clear => {
            ring.attach_existing(&config.ring)?;
            ring.clear()?;
            emit(format, &serde_json::json!({ "cleared": true }), |_| {
                "ring cleared".to_string()
            })
        }
        Commands::Stats => {
            ring.attach_existing(&config.ring)?;
            let stats = ring.stats()?;
            emit(format, &stats, render_stats)
        }
        Commands::Destroy => {
            let removed =
                SharedRegion::destroy(&config.ring.region_dir, &config.ring.region_name)?;
            emit(format, &serde_json::json!({ "removed": removed }), |_| {
                if removed {
                    "region removed".to_string()
                } else {
                    "no region to remove".to_string()
                }
            })
        }
    }
}

fn load_config(global: &GlobalOpts) -> Result<Config> {
    let mut config = Config::resolve(global.config.as_deref()).context("load configuration")?;
    if let Some(dir) = &global.region_dir {
        config.ring.region_dir.clone_from(dir);
    }
    if let Some(name) = &global.name {
        config.ring.region_name.clone_from(name);
    }
    if let Some(capacity) = global.capacity {
        config.ring.capacity = capacity;
    }
    config
        .ring
        .validate()
        .context("invalid ring settings")?;
    Ok(config)
}

#[derive(Serialize)]
struct InitReport {
    attachment: &'static str,
    region: PathBuf,
    capacity: usize,
}

fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    pretty: impl FnOnce(&T) -> String,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let text = serde_json::to_string_pretty(value).context("serialize output")?;
            println!("{text}");
        }
        OutputFormat::Pretty => println!("{}", pretty(value)),
    }
    Ok(())
}

fn render_record(record: &Record) -> String {
    let when = record.captured_at_utc().map_or_else(
        || record.captured_at.to_string(),
        |ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
    );
    let severity = record
        .severity_level()
        .map_or_else(|| record.severity.to_string(), |s| s.to_string());
    let mut out = format!(
        "[{when}] origin={} severity={severity}",
        record.origin_id
    );
    if !record.status_code.is_empty() {
        out.push_str(&format!(" status={}", record.status_code));
    }
    out.push_str(&format!("\n  message: {}", record.error_message));
    if !record.query_text.is_empty() {
        out.push_str(&format!("\n  query:   {}", record.query_text));
    }
    out
}

fn render_stats(stats: &RingStats) -> String {
    format!(
        "capacity:      {}\n\
         live:          {}\n\
         write cursor:  {}\n\
         total written: {}\n\
         evicted:       {}\n\
         fill:          {:.1}%\n\
         created by:    origin {}",
        stats.capacity,
        stats.live,
        stats.write_cursor,
        stats.total_written,
        stats.total_evicted,
        stats.fill_ratio * 100.0,
        stats.creator_origin,
    )
}
