//! JSON and KML export of a registry snapshot.
//!
//! Both exports read a [`SortedDevices`] snapshot (recent first, then
//! stale). Each device's location history is copied once under its own lock
//! so point, path and area always come from the same set of samples.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::aggregator::{BleDevice, SortedDevices};
use crate::geo::GeoLocation;
use crate::geometry::{closed_ring, convex_hull, distinct_points, polygon_area, simplify_path};
use crate::types::{MonitorError, Result};

/// Prefix of timestamped export files.
pub const EXPORT_PREFIX: &str = "ble_devices";

/// `<dir>/ble_devices_YYYY-MM-DD_HH-MM-SS.<ext>`
pub fn export_path(dir: &Path, ext: &str, now: NaiveDateTime) -> PathBuf {
    dir.join(format!(
        "{EXPORT_PREFIX}_{}.{ext}",
        now.format("%Y-%m-%d_%H-%M-%S")
    ))
}

fn export_err(path: &Path, err: impl ToString) -> MonitorError {
    MonitorError::Export {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// One device as written to the JSON export.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceExport {
    pub mac_address: String,
    pub rssi: i32,
    pub device_name: String,
    pub mfr_code: u32,
    pub mfr_data: String,
    pub service_uuids: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub location: Option<GeoLocation>,
}

impl From<&BleDevice> for DeviceExport {
    fn from(dev: &BleDevice) -> Self {
        DeviceExport {
            mac_address: dev.mac_address.clone(),
            rssi: dev.rssi,
            device_name: dev.device_name.clone(),
            mfr_code: dev.mfr_code,
            mfr_data: dev.mfr_data.clone(),
            service_uuids: dev.service_uuids.clone(),
            last_seen: dev.last_seen,
            count: dev.count,
            location: dev.location(),
        }
    }
}

/// JSON document: `{"recent": [...], "stale": [...]}`.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotExport {
    pub recent: Vec<DeviceExport>,
    pub stale: Vec<DeviceExport>,
}

impl From<&SortedDevices> for SnapshotExport {
    fn from(sorted: &SortedDevices) -> Self {
        SnapshotExport {
            recent: sorted.recent.iter().map(DeviceExport::from).collect(),
            stale: sorted.stale.iter().map(DeviceExport::from).collect(),
        }
    }
}

pub fn to_json(sorted: &SortedDevices) -> Result<String> {
    Ok(serde_json::to_string_pretty(&SnapshotExport::from(sorted))?)
}

pub fn write_json(path: &Path, sorted: &SortedDevices) -> Result<()> {
    let file = File::create(path).map_err(|e| export_err(path, e))?;
    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, &SnapshotExport::from(sorted))
        .map_err(|e| export_err(path, e))?;
    out.write_all(b"\n").map_err(|e| export_err(path, e))?;
    out.flush().map_err(|e| export_err(path, e))
}

// ---------------------------------------------------------------------------
// KML
// ---------------------------------------------------------------------------

/// Placemark counts of a built KML document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KmlSummary {
    pub points: usize,
    pub paths: usize,
    pub polygons: usize,
    pub session_area: bool,
}

/// Build the KML document for `sorted`, named after `now`.
///
/// Folders, each emitted only when non-empty:
/// - `Points`: mean of each device's strongest-RSSI samples
/// - `Paths`: simplified polyline over all samples (2 or more)
/// - `Polygons`: convex hull over all samples (3 or more)
/// - `Session Boundary`: hull over every sample of every device
pub fn build_kml(sorted: &SortedDevices, now: NaiveDateTime) -> (String, KmlSummary) {
    let mut points = String::new();
    let mut paths = String::new();
    let mut polygons = String::new();
    let mut summary = KmlSummary::default();
    let mut session: Vec<GeoLocation> = Vec::new();

    for dev in sorted.iter() {
        let history = dev.geo.snapshot();
        let samples = history.samples();
        if samples.is_empty() {
            continue;
        }
        let description = device_description(dev, history.location());

        if let Some(loc) = history.location() {
            placemark(&mut points, &dev.mac_address, &description, |out| {
                let _ = writeln!(
                    out,
                    "<Point><coordinates>{}</coordinates></Point>",
                    coord(&loc)
                );
            });
            summary.points += 1;
        }

        if samples.len() >= 2 {
            let path = simplify_path(&samples);
            placemark(&mut paths, &dev.mac_address, &description, |out| {
                let _ = writeln!(
                    out,
                    "<LineString><coordinates>{}</coordinates></LineString>",
                    coords(&path)
                );
            });
            summary.paths += 1;
        }

        if samples.len() >= 3 {
            let ring = closed_ring(&convex_hull(&samples));
            placemark(&mut polygons, &dev.mac_address, &description, |out| {
                polygon(out, &ring);
            });
            summary.polygons += 1;
        }

        session.extend(samples);
    }

    let mut boundary = String::new();
    let unique = distinct_points(&session);
    if unique.len() >= 3 {
        let hull = convex_hull(&unique);
        if polygon_area(&hull) > 0.0 {
            let description = format!(
                "<ul><li><strong>Total Points:</strong> {}</li>\
                 <li><strong>Boundary Points:</strong> {}</li>\
                 <li><strong>Session Time:</strong> {}</li></ul>",
                session.len(),
                hull.len(),
                now.format("%Y-%m-%d %H:%M:%S"),
            );
            let ring = closed_ring(&hull);
            placemark(&mut boundary, "Session Area", &description, |out| {
                polygon(out, &ring);
            });
            summary.session_area = true;
        }
    }

    let mut doc = String::new();
    doc.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    doc.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n<Document>\n");
    let _ = writeln!(
        doc,
        "<name>BLE Devices - {}</name>",
        now.format("%Y-%m-%d %H:%M:%S")
    );
    for (name, body) in [
        ("Points", &points),
        ("Paths", &paths),
        ("Polygons", &polygons),
        ("Session Boundary", &boundary),
    ] {
        if !body.is_empty() {
            let _ = write!(doc, "<Folder>\n<name>{name}</name>\n{body}</Folder>\n");
        }
    }
    doc.push_str("</Document>\n</kml>\n");

    (doc, summary)
}

pub fn write_kml(path: &Path, sorted: &SortedDevices, now: NaiveDateTime) -> Result<KmlSummary> {
    let (doc, summary) = build_kml(sorted, now);
    std::fs::write(path, doc).map_err(|e| export_err(path, e))?;
    Ok(summary)
}

fn placemark(out: &mut String, name: &str, description: &str, geometry: impl FnOnce(&mut String)) {
    out.push_str("<Placemark>\n");
    let _ = writeln!(out, "<name>{}</name>", xml_escape(name));
    let _ = writeln!(out, "<description>{}</description>", xml_escape(description));
    geometry(out);
    out.push_str("</Placemark>\n");
}

fn polygon(out: &mut String, ring: &[GeoLocation]) {
    let _ = writeln!(
        out,
        "<Polygon><outerBoundaryIs><LinearRing><coordinates>{}</coordinates>\
         </LinearRing></outerBoundaryIs></Polygon>",
        coords(ring)
    );
}

/// KML coordinate tuple: `lon,lat,alt`.
fn coord(loc: &GeoLocation) -> String {
    format!("{:.7},{:.7},{:.1}", loc.longitude, loc.latitude, loc.elevation)
}

fn coords(locs: &[GeoLocation]) -> String {
    locs.iter().map(coord).collect::<Vec<_>>().join(" ")
}

fn or_none(s: &str) -> &str {
    if s.is_empty() {
        "(none)"
    } else {
        s
    }
}

/// HTML list shown in the placemark balloon.
fn device_description(dev: &BleDevice, location: Option<GeoLocation>) -> String {
    let mut html = String::from("<ul>");
    let _ = write!(
        html,
        "<li><strong>Last Seen:</strong> {}</li>",
        dev.last_seen.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = write!(html, "<li><strong>Count:</strong> {}</li>", dev.count);
    let _ = write!(html, "<li><strong>MAC Address:</strong> {}</li>", dev.mac_address);
    let _ = write!(html, "<li><strong>Signal:</strong> {} dBm</li>", dev.rssi);
    if let Some(loc) = location {
        let _ = write!(
            html,
            "<li><strong>Location:</strong> {:.5}, {:.5}</li>",
            loc.latitude, loc.longitude
        );
    }
    let name = if dev.device_name.is_empty() {
        "(unnamed)"
    } else {
        &dev.device_name
    };
    let _ = write!(html, "<li><strong>Device Name:</strong> {name}</li>");
    let _ = write!(
        html,
        "<li><strong>Service UUIDs:</strong> {}</li>",
        or_none(&dev.service_uuids.join(", "))
    );
    let mfr_id = if dev.mfr_code == 0 {
        "(none)".to_string()
    } else {
        dev.mfr_code.to_string()
    };
    let _ = write!(html, "<li><strong>Mfr ID:</strong> {mfr_id}</li>");
    let _ = write!(
        html,
        "<li><strong>Mfr Data:</strong> {}</li>",
        or_none(&dev.mfr_data)
    );
    html.push_str("</ul>");
    html
}

pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
