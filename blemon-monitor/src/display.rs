//! Periodic snapshot view and operator command handling.
//!
//! One task waits on the next tick, the next operator command, or shutdown,
//! then pulls a fresh snapshot. With `--table` the snapshot is printed as a
//! table on stdout; otherwise a one-line summary goes to the debug log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use comfy_table::{Cell, Table};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use blemon_core::export::{export_path, write_json, write_kml};
use blemon_core::{
    Aggregator, ConnectionState, ConnectionStatus, GpsSnapshot, GpsStatus, RecordHandler,
    SortedDevices,
};

use crate::commands::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Json,
    Kml,
}

impl ExportKind {
    pub fn extension(self) -> &'static str {
        match self {
            ExportKind::Json => "json",
            ExportKind::Kml => "kml",
        }
    }
}

/// Write a timestamped export of the current snapshot into `dir`.
pub fn export_snapshot(
    aggregator: &Aggregator,
    kind: ExportKind,
    dir: &Path,
) -> blemon_core::Result<PathBuf> {
    let stamp = Local::now().naive_local();
    let path = export_path(dir, kind.extension(), stamp);
    let sorted = aggregator.sorted();
    match kind {
        ExportKind::Json => write_json(&path, &sorted)?,
        ExportKind::Kml => {
            let summary = write_kml(&path, &sorted, stamp)?;
            tracing::debug!(
                points = summary.points,
                paths = summary.paths,
                polygons = summary.polygons,
                session_area = summary.session_area,
                "KML built"
            );
        }
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Display task
// ---------------------------------------------------------------------------

pub struct Display {
    handler: Arc<RecordHandler>,
    connection: Arc<ConnectionState>,
    export_dir: PathBuf,
    refresh: Duration,
    table: bool,
    cancel: CancellationToken,
}

impl Display {
    pub fn new(
        handler: Arc<RecordHandler>,
        connection: Arc<ConnectionState>,
        export_dir: PathBuf,
        refresh: Duration,
        table: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            handler,
            connection,
            export_dir,
            refresh,
            table,
            cancel,
        }
    }

    pub fn start(self, commands: mpsc::Receiver<Command>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(commands).await;
        })
    }

    pub async fn run(self, mut commands: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(self.refresh);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(cmd) = commands.recv() => self.apply(cmd),
                _ = tick.tick() => {}
            }
            self.show_notices();
            self.render(Utc::now());
        }
        tracing::debug!("Display stopped");
    }

    /// Carry out one operator command.
    pub fn apply(&self, cmd: Command) {
        match cmd {
            Command::Pause => {
                let paused = self.handler.toggle_pause();
                tracing::info!(paused, "Ingestion {}", if paused { "paused" } else { "resumed" });
            }
            Command::Clear => {
                self.handler.aggregator().clear();
                tracing::info!("Device list cleared");
            }
            Command::ExportJson => self.export(ExportKind::Json),
            Command::ExportKml => self.export(ExportKind::Kml),
            Command::Quit => {
                tracing::info!("Quit requested");
                self.cancel.cancel();
            }
        }
    }

    fn export(&self, kind: ExportKind) {
        match export_snapshot(self.handler.aggregator(), kind, &self.export_dir) {
            Ok(path) => tracing::info!(path = %path.display(), "Exported {}", kind.extension()),
            Err(e) => tracing::error!(error = %e, "Export failed"),
        }
    }

    /// GPS notices are shown once per episode, then dismissed.
    fn show_notices(&self) {
        let location = self.handler.location();
        if location.should_show_failure_notice() {
            tracing::warn!("No GPS detected at any baud rate, continuing without location");
            location.dismiss_failure_notice();
        }
        if location.should_show_reconnect_notice() {
            tracing::warn!("GPS connection lost, reconnecting");
            location.dismiss_reconnect_notice();
        }
    }

    fn render(&self, now: DateTime<Utc>) {
        let sorted = self.handler.aggregator().sorted_at(now);
        let status = status_line(
            &self.connection.status(),
            &self.handler.location().snapshot_at(now),
            self.handler.is_paused(),
            &sorted,
        );
        if self.table {
            // Clear screen, cursor home
            print!("\x1b[2J\x1b[H");
            println!("{status}");
            println!("{}", device_table(&sorted));
        } else {
            tracing::debug!("{status}");
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn status_line(
    link: &ConnectionStatus,
    gps: &GpsSnapshot,
    paused: bool,
    sorted: &SortedDevices,
) -> String {
    let link_part = if link.connected {
        "link: connected".to_string()
    } else {
        format!("link: disconnected ({} attempts)", link.failed_attempts)
    };

    let gps_part = match gps.status {
        GpsStatus::Fix => {
            let (lat, lon) = gps
                .current
                .map(|c| (c.latitude, c.longitude))
                .unwrap_or_default();
            format!(
                "gps: fix q{} {}/{} sats {lat:.5}, {lon:.5}",
                gps.fix_quality, gps.satellites, gps.satellites_in_view
            )
        }
        _ if gps.reconnecting => format!(
            "gps: reconnecting ({} attempts, {}s)",
            gps.reconnect_attempts,
            gps.reconnect_elapsed.map_or(0, |d| d.num_seconds())
        ),
        other => format!("gps: {other}"),
    };

    let mut line = format!(
        "{link_part} | {gps_part} | devices: {} recent, {} stale",
        sorted.recent.len(),
        sorted.stale.len()
    );
    if paused {
        line.push_str(" | PAUSED");
    }
    line
}

fn dash_if_empty(s: &str) -> &str {
    if s.is_empty() {
        "-"
    } else {
        s
    }
}

/// Recent devices first, then stale.
pub fn device_table(sorted: &SortedDevices) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "Last Seen", "Count", "MAC", "RSSI", "Location", "Name", "Services", "Mfr ID",
        "Mfr Data",
    ]);

    for dev in sorted.iter() {
        table.add_row(vec![
            Cell::new(dev.last_seen.with_timezone(&Local).format("%H:%M:%S")),
            Cell::new(dev.count),
            Cell::new(&dev.mac_address),
            Cell::new(dev.rssi),
            Cell::new(
                dev.location()
                    .map(|l| format!("{:.5}, {:.5}", l.latitude, l.longitude))
                    .unwrap_or("-".into()),
            ),
            Cell::new(dash_if_empty(&dev.device_name)),
            Cell::new(dash_if_empty(&dev.service_uuids.join(", "))),
            Cell::new(if dev.mfr_code == 0 {
                "-".to_string()
            } else {
                dev.mfr_code.to_string()
            }),
            Cell::new(dash_if_empty(&dev.mfr_data)),
        ]);
    }

    table
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
