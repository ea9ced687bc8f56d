//! tiercache CLI
//!
//! Inspect and exercise a cache directory from the shell.
//!
//! ```text
//! tiercache --cache-dir ./cache set week:5:tasklist '{"tasks":[]}' --category task_lists --ttl 1h
//! tiercache --cache-dir ./cache get week:5:tasklist --category task_lists
//! tiercache --cache-dir ./cache stats
//! tiercache --cache-dir ./cache stats --report
//! ```

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::config::parse_duration;
use tiercache::{CacheConfig, CacheManager};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - local multi-tier cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the L2 database and L3 blobs (overrides the config file)
    #[arg(long, env = "TIERCACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a cached value to stdout
    Get {
        key: String,
        #[arg(long, default_value = "default")]
        category: String,
    },
    /// Store a value (from the argument, --file, or stdin)
    Set {
        key: String,
        value: Option<String>,
        #[arg(long, default_value = "default")]
        category: String,
        /// e.g. 30s, 5m, 1h30m
        #[arg(long, value_parser = parse_ttl)]
        ttl: Option<Duration>,
        #[arg(long, conflicts_with = "value")]
        file: Option<PathBuf>,
    },
    /// Remove one key from every tier
    Invalidate { key: String },
    /// Remove every key stored under a category
    InvalidateCategory { category: String },
    /// List keys, optionally only those containing a substring
    Keys {
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Print statistics as JSON
    Stats {
        /// Print the plain-text performance report instead
        #[arg(long)]
        report: bool,
    },
    /// Print tier health as JSON
    Health,
    /// Purge expired entries and enforce budgets now
    Sweep,
    /// Remove everything
    Clear,
}

fn parse_ttl(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &args.cache_dir {
        config = config.with_cache_dir(dir);
    }
    // One-shot process: maintenance only runs when asked for
    config.janitor.enabled = false;

    let cache = CacheManager::open(config).context("opening cache")?;
    let code = run(&cache, args.command)?;
    cache.shutdown().await;

    info!("Done");
    Ok(code)
}

fn run(cache: &CacheManager, command: Command) -> anyhow::Result<ExitCode> {
    let mut stdout = std::io::stdout().lock();

    match command {
        Command::Get { key, category } => match cache.get(&key, &category) {
            Some(value) => {
                stdout.write_all(&value)?;
                stdout.flush()?;
            }
            None => {
                eprintln!("miss: {}", key);
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::Set {
            key,
            value,
            category,
            ttl,
            file,
        } => {
            let value = match (value, file) {
                (Some(value), _) => value.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            if !cache.set(&key, value, &category, ttl) {
                eprintln!("not cached: {}", key);
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Invalidate { key } => {
            writeln!(stdout, "{}", cache.invalidate(&key))?;
        }
        Command::InvalidateCategory { category } => {
            writeln!(stdout, "{}", cache.invalidate_category(&category))?;
        }
        Command::Keys { pattern } => {
            for key in cache.keys() {
                if pattern.as_deref().map_or(true, |p| key.contains(p)) {
                    writeln!(stdout, "{}", key)?;
                }
            }
        }
        Command::Stats { report: true } => {
            write!(stdout, "{}", cache.stats().report())?;
        }
        Command::Stats { report: false } => {
            serde_json::to_writer_pretty(&mut stdout, &cache.stats())?;
            writeln!(stdout)?;
        }
        Command::Health => {
            let health = cache.health();
            serde_json::to_writer_pretty(&mut stdout, &health)?;
            writeln!(stdout)?;
            if !health.status.is_operational() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Sweep => {
            serde_json::to_writer_pretty(&mut stdout, &cache.run_maintenance())?;
            writeln!(stdout)?;
        }
        Command::Clear => cache.clear(),
    }

    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
