//! Newline-delimited JSON records from the scanner, and per-line handling.
//!
//! Each line is one JSON object. Every key is optional:
//!
//! ```text
//! {"notification":"scan started"}
//! {"protocol":"ble","mac_address":"AA:BB:CC:DD:EE:FF","rssi":-55,
//!  "mfr_code":76,"mfr_data":"TAYCAA==","device_name":"Tag","service_uuids":["180f"]}
//! ```
//!
//! Decoding is field-lenient: a field with the wrong JSON type reads as
//! missing instead of rejecting the whole record. Only lines that are not a
//! JSON object at all are malformed, and those are dropped without a trace
//! beyond the returned [`LineOutcome`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::aggregator::{Aggregator, Sighting};
use crate::location::LocationState;

// ---------------------------------------------------------------------------
// Decoded records
// ---------------------------------------------------------------------------

/// Device fields carried by a sighting record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SightingRecord {
    pub protocol: String,
    pub mac_address: String,
    pub rssi: i32,
    pub mfr_code: u32,
    pub mfr_data: String,
    pub device_name: String,
    pub service_uuids: Vec<String>,
}

impl SightingRecord {
    pub fn into_sighting(self, seen_at: DateTime<Utc>) -> Sighting {
        Sighting {
            mac_address: self.mac_address,
            rssi: self.rssi,
            device_name: self.device_name,
            mfr_code: self.mfr_code,
            mfr_data: self.mfr_data,
            service_uuids: self.service_uuids,
            seen_at,
        }
    }
}

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Alert text from the scanner. No state change.
    Notification(String),
    Sighting(SightingRecord),
}

/// Decode one line. `None` for malformed lines and for objects that carry
/// neither a notification nor an address.
pub fn decode_record(line: &[u8]) -> Option<Record> {
    let value: Value = serde_json::from_slice(trim_ascii(line)).ok()?;
    let obj = value.as_object()?;

    if let Some(text) = obj.get("notification").and_then(Value::as_str) {
        return Some(Record::Notification(text.to_string()));
    }

    let mac_address = str_field(obj, "mac_address");
    if mac_address.is_empty() {
        return None;
    }

    Some(Record::Sighting(SightingRecord {
        protocol: str_field(obj, "protocol"),
        mac_address,
        rssi: int_field(obj, "rssi"),
        mfr_code: int_field(obj, "mfr_code"),
        mfr_data: str_field(obj, "mfr_data"),
        device_name: str_field(obj, "device_name"),
        service_uuids: obj
            .get("service_uuids")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }))
}

fn str_field(obj: &Map<String, Value>, key: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn int_field<T: TryFrom<i64> + Default>(obj: &Map<String, Value>, key: &str) -> T {
    obj.get(key)
        .and_then(Value::as_i64)
        .and_then(|v| T::try_from(v).ok())
        .unwrap_or_default()
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &line[s..=e],
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Line handling
// ---------------------------------------------------------------------------

/// What happened to one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Ingestion is paused; the line was discarded undecoded.
    Paused,
    /// Not a record.
    Malformed,
    Notification(String),
    Sighting {
        mac_address: String,
        /// A location sample was recorded from the current GPS fix.
        tagged: bool,
    },
}

/// Routes decoded records into the registry, tagging sightings with the
/// current GPS fix.
pub struct RecordHandler {
    aggregator: Arc<Aggregator>,
    location: Arc<LocationState>,
    paused: AtomicBool,
}

impl RecordHandler {
    pub fn new(aggregator: Arc<Aggregator>, location: Arc<LocationState>) -> Self {
        RecordHandler {
            aggregator,
            location,
            paused: AtomicBool::new(false),
        }
    }

    pub fn handle_line(&self, line: &[u8]) -> LineOutcome {
        self.handle_line_at(line, Utc::now())
    }

    pub fn handle_line_at(&self, line: &[u8], now: DateTime<Utc>) -> LineOutcome {
        if self.is_paused() {
            return LineOutcome::Paused;
        }

        match decode_record(line) {
            None => LineOutcome::Malformed,
            Some(Record::Notification(text)) => LineOutcome::Notification(text),
            Some(Record::Sighting(rec)) => {
                let rssi = rec.rssi;
                let mac_address = rec.mac_address.clone();

                // Registry lock is released before the device's own lock.
                let geo = self.aggregator.add_or_update(rec.into_sighting(now));
                let tagged = match self.location.current() {
                    Some(fix) => {
                        geo.push(rssi, fix);
                        true
                    }
                    None => false,
                };

                LineOutcome::Sighting {
                    mac_address,
                    tagged,
                }
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Flip the pause flag. Returns the new value.
    pub fn toggle_pause(&self) -> bool {
        !self.paused.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn location(&self) -> &Arc<LocationState> {
        &self.location
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoLocation;
    use crate::location::GpsStatus;

    fn handler() -> RecordHandler {
        RecordHandler::new(Arc::new(Aggregator::new()), Arc::new(LocationState::new()))
    }

    fn with_fix(handler: &RecordHandler, lat: f64, lon: f64) {
        let loc = handler.location();
        loc.set_status(GpsStatus::Detecting);
        loc.set_fix(GeoLocation::new(lat, lon, 0.0, 1.0, Utc::now()), 1, 6, 10);
    }

    #[test]
    fn test_decode_full_sighting() {
        let line = br#"{"protocol":"ble","mac_address":"AA:BB:CC:DD:EE:FF","rssi":-55,"mfr_code":76,"mfr_data":"TAYCAA==","device_name":"Tag","service_uuids":["180f","fd6f"]}"#;
        match decode_record(line) {
            Some(Record::Sighting(rec)) => {
                assert_eq!(rec.protocol, "ble");
                assert_eq!(rec.mac_address, "AA:BB:CC:DD:EE:FF");
                assert_eq!(rec.rssi, -55);
                assert_eq!(rec.mfr_code, 76);
                assert_eq!(rec.mfr_data, "TAYCAA==");
                assert_eq!(rec.device_name, "Tag");
                assert_eq!(rec.service_uuids, vec!["180f", "fd6f"]);
            }
            other => panic!("expected sighting, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_notification() {
        let rec = decode_record(br#"{"notification":"scanner restarted"}"#);
        assert_eq!(rec, Some(Record::Notification("scanner restarted".into())));
    }

    #[test]
    fn test_notification_wins_over_address() {
        let rec = decode_record(br#"{"notification":"","mac_address":"AA"}"#);
        assert_eq!(rec, Some(Record::Notification(String::new())));
    }

    #[test]
    fn test_null_notification_is_absent() {
        let rec = decode_record(br#"{"notification":null,"mac_address":"AA","rssi":-40}"#);
        assert!(matches!(rec, Some(Record::Sighting(_))));
    }

    #[test]
    fn test_decode_malformed() {
        assert!(decode_record(b"not json").is_none());
        assert!(decode_record(b"").is_none());
        assert!(decode_record(b"[1,2,3]").is_none());
        assert!(decode_record(br#"{"rssi":-40}"#).is_none());
        assert!(decode_record(br#"{"mac_address":""}"#).is_none());
    }

    #[test]
    fn test_bad_field_reads_as_missing() {
        let line = br#"{"mac_address":"AA","rssi":"loud","mfr_code":-3,"service_uuids":"180f","device_name":7}"#;
        match decode_record(line) {
            Some(Record::Sighting(rec)) => {
                assert_eq!(rec.rssi, 0);
                assert_eq!(rec.mfr_code, 0);
                assert!(rec.service_uuids.is_empty());
                assert!(rec.device_name.is_empty());
            }
            other => panic!("expected sighting, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_trailing_whitespace() {
        assert!(decode_record(b"  {\"mac_address\":\"AA\"}\r\n").is_some());
    }

    #[test]
    fn test_merge_scenario() {
        let h = handler();
        h.handle_line(br#"{"mac_address":"AA:BB:CC:DD:EE:FF","rssi":-55,"device_name":"Test"}"#);
        h.handle_line(br#"{"mac_address":"AA:BB:CC:DD:EE:FF","rssi":-60,"device_name":""}"#);

        let agg = h.aggregator();
        assert_eq!(agg.len(), 1);
        let dev = agg.get("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(dev.rssi, -60);
        assert_eq!(dev.device_name, "Test");
        assert_eq!(dev.count, 2);
    }

    #[test]
    fn test_paused_discards() {
        let h = handler();
        assert!(h.toggle_pause());
        assert_eq!(
            h.handle_line(br#"{"mac_address":"AA","rssi":-50}"#),
            LineOutcome::Paused
        );
        assert!(h.aggregator().is_empty());

        assert!(!h.toggle_pause());
        assert!(matches!(
            h.handle_line(br#"{"mac_address":"AA","rssi":-50}"#),
            LineOutcome::Sighting { .. }
        ));
        assert_eq!(h.aggregator().len(), 1);
    }

    #[test]
    fn test_notification_changes_nothing() {
        let h = handler();
        let out = h.handle_line(br#"{"notification":"tracker nearby"}"#);
        assert_eq!(out, LineOutcome::Notification("tracker nearby".into()));
        assert!(h.aggregator().is_empty());
    }

    #[test]
    fn test_malformed_outcome() {
        let h = handler();
        assert_eq!(h.handle_line(b"{garbage"), LineOutcome::Malformed);
        assert!(h.aggregator().is_empty());
    }

    #[test]
    fn test_untagged_without_fix() {
        let h = handler();
        let out = h.handle_line(br#"{"mac_address":"AA","rssi":-50}"#);
        assert_eq!(
            out,
            LineOutcome::Sighting {
                mac_address: "AA".into(),
                tagged: false
            }
        );
        assert!(h.aggregator().get("AA").unwrap().geo.is_empty());
    }

    #[test]
    fn test_tagged_with_fix_keyed_by_sighting_rssi() {
        let h = handler();
        with_fix(&h, 35.0, -82.0);
        h.handle_line(br#"{"mac_address":"AA","rssi":-50}"#);
        h.handle_line(br#"{"mac_address":"AA","rssi":-70}"#);

        let dev = h.aggregator().get("AA").unwrap();
        let history = dev.geo.snapshot();
        assert_eq!(history.rssi_keys(), &[-50, -70]);
        assert_eq!(dev.location().unwrap().latitude, 35.0);
    }
}
