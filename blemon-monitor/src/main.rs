//! blemon: BLE counter-surveillance monitor.
//!
//! Subcommands:
//! - `monitor`: live ingestion from a scanner serial port (or stdin) with an
//!   optional GPS receiver, periodic table, and operator commands
//! - `replay`: feed a captured record file through the same pipeline
//! - `config`: show or save the configuration file

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use blemon_core::config::{self, Config};
use blemon_core::export::{write_json, write_kml};
use blemon_core::{
    Aggregator, ConnectionState, GeoLocation, GpsStatus, LineOutcome, LocationState,
    RecordHandler,
};

mod alert;
mod commands;
mod display;
mod link;
mod supervisor;

use display::Display;
use link::SerialOpener;
use supervisor::{DataLinkSupervisor, GpsSupervisor};

/// How long shutdown waits for tasks blocked on terminal input.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "blemon", version, about = "BLE counter-surveillance monitor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a live scanner stream
    Monitor {
        /// Scanner serial port (omit to read records from stdin)
        #[arg(short, long, env = "BLEMON_PORT")]
        port: Option<String>,

        /// Scanner baud rate
        #[arg(short, long)]
        baud: Option<u32>,

        /// GPS serial port (baud rate is detected)
        #[arg(short, long, env = "BLEMON_GPS")]
        gps: Option<String>,

        /// Directory for JSON/KML exports
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// Print the device table on every refresh
        #[arg(short, long)]
        table: bool,

        /// Do not ring the terminal bell on alerts
        #[arg(long)]
        no_bell: bool,
    },

    /// Replay a captured record file (one JSON record per line, `-` for stdin)
    Replay {
        file: PathBuf,

        /// Tag every sighting with this latitude (requires --lon)
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,

        /// Tag every sighting with this longitude (requires --lat)
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,

        /// Write the JSON export to this path
        #[arg(long)]
        json: Option<PathBuf>,

        /// Write the KML export to this path
        #[arg(long)]
        kml: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Save it to ~/.ble-monitor/config.yaml
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Monitor {
            port,
            baud,
            gps,
            export_dir,
            table,
            no_bell,
        } => {
            let mut config = config::load_config();
            if port.is_some() {
                config.serial.port = port;
            }
            if let Some(baud) = baud {
                config.serial.baud = baud;
            }
            if gps.is_some() {
                config.gps.port = gps;
            }
            if let Some(dir) = export_dir {
                config.export.dir = dir.display().to_string();
            }
            cmd_monitor(config, table, !no_bell)
        }
        Commands::Replay {
            file,
            lat,
            lon,
            json,
            kml,
        } => cmd_replay(file, lat.zip(lon), json, kml),
        Commands::Config { write } => cmd_config(write),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Structured logs on stderr; `RUST_LOG` overrides the default `info`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

// ---------------------------------------------------------------------------
// monitor
// ---------------------------------------------------------------------------

fn cmd_monitor(config: Config, table: bool, bell: bool) -> blemon_core::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(monitor(config, table, bell));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn monitor(config: Config, table: bool, bell: bool) -> blemon_core::Result<()> {
    let aggregator = Arc::new(Aggregator::with_recent_threshold(TimeDelta::seconds(
        config.display.recent_secs,
    )));
    let location = Arc::new(LocationState::new());
    let connection = Arc::new(ConnectionState::new());
    let handler = Arc::new(RecordHandler::new(aggregator, location.clone()));
    let cancel = CancellationToken::new();

    let (alert_tx, alert_rx) = alert::channel();
    let mut tasks = vec![tokio::spawn(alert::run(alert_rx, bell, cancel.clone()))];

    // Operator commands only when stdin is not the record stream.
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    match &config.serial.port {
        Some(port) => {
            tasks.push(
                DataLinkSupervisor::new(
                    SerialOpener::new(port),
                    config.serial.baud,
                    handler.clone(),
                    connection.clone(),
                    alert_tx,
                    cancel.clone(),
                )
                .start(),
            );
            commands::spawn_reader(io::BufReader::new(io::stdin()), cmd_tx)?;
            tracing::info!("{}", commands::HELP);
        }
        None => {
            let supervisor = DataLinkSupervisor::fixed(
                handler.clone(),
                connection.clone(),
                alert_tx,
                cancel.clone(),
            );
            tasks.push(tokio::spawn(
                supervisor.run_fixed(Box::new(tokio::io::stdin())),
            ));
            drop(cmd_tx);
        }
    }

    match &config.gps.port {
        Some(port) => tasks.push(
            GpsSupervisor::new(SerialOpener::new(port), location.clone(), cancel.clone()).start(),
        ),
        None => tracing::info!("No GPS configured, sightings will not be geotagged"),
    }

    tasks.push(
        Display::new(
            handler,
            connection,
            PathBuf::from(&config.export.dir),
            Duration::from_millis(config.display.refresh_ms),
            table,
            cancel.clone(),
        )
        .start(cmd_rx),
    );

    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            }
            tracing::info!("Interrupted");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
    tracing::info!("Shutting down");

    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Task ended abnormally");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

fn cmd_replay(
    file: PathBuf,
    fixed: Option<(f64, f64)>,
    json: Option<PathBuf>,
    kml: Option<PathBuf>,
) -> blemon_core::Result<()> {
    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        Box::new(io::BufReader::new(std::fs::File::open(&file)?))
    };

    let location = Arc::new(LocationState::new());
    if let Some((lat, lon)) = fixed {
        location.set_status(GpsStatus::Detecting);
        location.set_fix(GeoLocation::new(lat, lon, 0.0, 0.0, Utc::now()), 1, 0, 0);
    }
    let handler = RecordHandler::new(Arc::new(Aggregator::new()), location);

    let (mut lines, mut sightings, mut notifications, mut malformed) = (0u64, 0u64, 0u64, 0u64);
    for line in reader.split(b'\n') {
        let line = line?;
        lines += 1;
        match handler.handle_line(&line) {
            LineOutcome::Sighting { .. } => sightings += 1,
            LineOutcome::Notification(text) => {
                notifications += 1;
                println!("notification: {text}");
            }
            LineOutcome::Malformed => malformed += 1,
            LineOutcome::Paused => {}
        }
    }

    let sorted = handler.aggregator().sorted();
    println!();
    println!(
        "Records: {lines} lines, {sightings} sightings, {notifications} notifications, \
         {malformed} malformed, {} devices",
        sorted.len()
    );
    if !sorted.is_empty() {
        println!();
        println!("{}", display::device_table(&sorted));
    }

    if let Some(path) = json {
        write_json(&path, &sorted)?;
        println!("JSON written to {}", path.display());
    }
    if let Some(path) = kml {
        let summary = write_kml(&path, &sorted, Local::now().naive_local())?;
        println!(
            "KML written to {} ({} points, {} paths, {} polygons{})",
            path.display(),
            summary.points,
            summary.paths,
            summary.polygons,
            if summary.session_area { ", session area" } else { "" }
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config(write: bool) -> blemon_core::Result<()> {
    let config = config::load_config();
    print!("{}", config::serialize_config(&config));
    if write {
        let path = config::save_config(&config)?;
        println!();
        println!("Saved to {}", path.display());
    }
    Ok(())
}
