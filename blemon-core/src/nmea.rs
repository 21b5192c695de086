//! NMEA 0183 sentence parsing for the fields the monitor consumes.
//!
//! Only GGA (fix data), RMC (recommended minimum) and GSV (satellites in
//! view) are interpreted. Other well-formed sentences are recognised so baud
//! detection can count them, then ignored. A sentence must be `$`-framed and
//! carry a matching `*hh` XOR checksum.

use chrono::{DateTime, Utc};

use crate::geo::GeoLocation;
use crate::location::LocationState;

/// Sentence types accepted as valid NMEA (after the 2-char talker id).
const KNOWN_TYPES: &[&str] = &[
    "GGA", "RMC", "GSV", "GSA", "GLL", "VTG", "ZDA", "GNS", "GST", "TXT",
];

/// Talker ids accepted in the address field.
const KNOWN_TALKERS: &[&str] = &["GP", "GN", "GL", "GA", "GB", "BD", "GQ"];

// ---------------------------------------------------------------------------
// Sentence types
// ---------------------------------------------------------------------------

/// GGA: position, altitude, fix quality.
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub fix_quality: u8,
    pub satellites: u32,
    pub hdop: f64,
    pub altitude: f64,
}

/// RMC: position and validity.
#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub valid: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// GSV: one message of a satellites-in-view sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Gsv {
    pub total_messages: u32,
    pub message_number: u32,
    pub satellites_in_view: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(Gga),
    Rmc(Rmc),
    Gsv(Gsv),
    /// Valid but not interpreted; holds the 3-letter type.
    Other(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// XOR of every byte between `$` and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Parse one sentence. `None` for anything malformed or unrecognised.
pub fn parse_sentence(line: &str) -> Option<Sentence> {
    let line = line.trim();
    let framed = line.strip_prefix('$')?;
    let (body, sum) = framed.rsplit_once('*')?;
    // Line noise decoded lossily must never reach the byte-offset field splits.
    if !body.is_ascii() {
        return None;
    }
    if sum.len() != 2 || u8::from_str_radix(sum, 16).ok()? != checksum(body) {
        return None;
    }

    let fields: Vec<&str> = body.split(',').collect();
    let address = fields[0];
    let (talker, kind) = (address.get(..2)?, address.get(2..)?);
    if address.len() != 5 || !KNOWN_TALKERS.contains(&talker) {
        return None;
    }
    if !KNOWN_TYPES.contains(&kind) {
        return None;
    }

    match kind {
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        "GSV" => parse_gsv(&fields).map(Sentence::Gsv),
        other => Some(Sentence::Other(other.to_string())),
    }
}

fn parse_gga(f: &[&str]) -> Option<Gga> {
    if f.len() < 10 {
        return None;
    }
    Some(Gga {
        latitude: parse_coord(f[2], f[3], 2),
        longitude: parse_coord(f[4], f[5], 3),
        fix_quality: parse_or_zero(f[6]),
        satellites: parse_or_zero(f[7]),
        hdop: parse_or_zero(f[8]),
        altitude: parse_or_zero(f[9]),
    })
}

fn parse_rmc(f: &[&str]) -> Option<Rmc> {
    if f.len() < 7 {
        return None;
    }
    Some(Rmc {
        valid: f[2] == "A",
        latitude: parse_coord(f[3], f[4], 2),
        longitude: parse_coord(f[5], f[6], 3),
    })
}

fn parse_gsv(f: &[&str]) -> Option<Gsv> {
    if f.len() < 4 {
        return None;
    }
    Some(Gsv {
        total_messages: f[1].parse().ok()?,
        message_number: f[2].parse().ok()?,
        satellites_in_view: parse_or_zero(f[3]),
    })
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed decimal degrees.
fn parse_coord(value: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if value.len() <= degree_digits {
        return None;
    }
    let degrees: f64 = value.get(..degree_digits)?.parse().ok()?;
    let minutes: f64 = value.get(degree_digits..)?.parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

fn parse_or_zero<T: std::str::FromStr + Default>(s: &str) -> T {
    s.parse().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Interpretation
// ---------------------------------------------------------------------------

/// Applies parsed sentences to [`LocationState`].
///
/// Carries the satellites-in-view count between GSV and fix sentences.
#[derive(Debug, Default)]
pub struct NmeaInterpreter {
    satellites_in_view: u32,
}

impl NmeaInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and apply one line. Returns the parsed sentence, or `None` when
    /// the line was dropped as malformed.
    pub fn apply(&mut self, line: &str, state: &LocationState) -> Option<Sentence> {
        self.apply_at(line, state, Utc::now())
    }

    pub fn apply_at(
        &mut self,
        line: &str,
        state: &LocationState,
        now: DateTime<Utc>,
    ) -> Option<Sentence> {
        let sentence = parse_sentence(line)?;
        match &sentence {
            Sentence::Gga(gga) => match (gga.fix_quality, gga.latitude, gga.longitude) {
                (q, Some(lat), Some(lon)) if q > 0 => {
                    let fix = GeoLocation::new(lat, lon, gga.altitude, gga.hdop, now);
                    state.set_fix(fix, q, gga.satellites, self.satellites_in_view);
                }
                _ => state.mark_no_fix(),
            },
            Sentence::Rmc(rmc) => match (rmc.valid, rmc.latitude, rmc.longitude) {
                (true, Some(lat), Some(lon)) => {
                    let fix = GeoLocation::new(lat, lon, 0.0, 0.0, now);
                    state.set_fix(fix, 1, 0, self.satellites_in_view);
                }
                _ => state.mark_no_fix(),
            },
            Sentence::Gsv(gsv) => {
                // The first message of a sequence carries the total.
                if gsv.message_number == 1 {
                    self.satellites_in_view = gsv.satellites_in_view;
                    state.set_satellites_in_view(gsv.satellites_in_view);
                }
            }
            Sentence::Other(_) => {}
        }
        Some(sentence)
    }

    pub fn satellites_in_view(&self) -> u32 {
        self.satellites_in_view
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
