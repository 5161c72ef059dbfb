//! CAN Telemetry Daemon
//!
//! This is the always-on collector process for in-vehicle telemetry.
//! It uses the can-telemetry-core library and adds:
//! - SocketCAN frame acquisition
//! - SQLite persistence with busy retry
//! - An oldest-first drain command for upload pipelines

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

mod collector;
mod config;
mod source;
mod store;

/// CAN Telemetry Daemon - collect windowed vehicle telemetry from a CAN bus
#[derive(Parser, Debug)]
#[command(name = "can-telemetry-daemon")]
#[command(about = "Collect windowed vehicle telemetry from a CAN bus", long_about = None)]
#[command(version)]
struct Args {
    /// CAN interface to listen on (overrides config)
    #[arg(short, long, value_name = "IFACE")]
    interface: Option<String>,

    /// SQLite database file (overrides config)
    #[arg(short, long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Signal descriptor JSON to use instead of the embedded Model 3 table
    #[arg(long, value_name = "FILE")]
    descriptor: Option<PathBuf>,

    /// Stop collecting after this many seconds (default: run until killed)
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Print the oldest pending batch as JSON, remove it, and exit
    #[arg(long)]
    pull: bool,

    /// Verbosity level (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Telemetry Daemon v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using core library v{}", can_telemetry_core::VERSION);

    let config = match &args.config {
        Some(path) => config::load_config(path)?,
        None => config::AppConfig::default(),
    };
    let interface = args
        .interface
        .clone()
        .unwrap_or_else(|| config.can.interface.clone());
    let database = args
        .database
        .clone()
        .unwrap_or_else(|| config.storage.database.clone());

    let store = Arc::new(store::Store::open(&database)?);

    if args.pull {
        return pull_mode(&store);
    }

    let db = match &args.descriptor {
        Some(path) => {
            log::info!("loading signal descriptor from {:?}", path);
            can_telemetry_core::SignalDatabase::from_file(path)?
        }
        None => can_telemetry_core::model3()?,
    };
    run_collector(&interface, Arc::new(db), store, args.duration)
}

/// Drain mode: hand the oldest stored batch to stdout as JSON
fn pull_mode(store: &store::Store) -> Result<()> {
    match store.take_oldest()? {
        Some(batch) => println!("{}", serde_json::to_string_pretty(&batch)?),
        None => {
            log::info!("store is empty");
            println!("{{}}");
        }
    }
    Ok(())
}

/// Collector mode: sample the bus until the duration elapses
fn run_collector(
    interface: &str,
    db: Arc<can_telemetry_core::SignalDatabase>,
    store: Arc<store::Store>,
    duration: Option<u64>,
) -> Result<()> {
    log::info!(
        "signal database loaded: {} messages, {} signals",
        db.message_count(),
        db.signal_count()
    );

    let source = Box::new(source::SocketCanSource::open(interface)?);
    let collector = collector::Collector::start(db, source, Arc::clone(&store));

    match duration {
        Some(secs) => {
            log::info!("collecting for {} seconds", secs);
            thread::sleep(Duration::from_secs(secs));
            collector.stop()?;
            log::info!("{} records pending upload", store.record_count()?);
        }
        None => loop {
            thread::park();
        },
    }

    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
