//! Device registry: one record per hardware address, merged across sightings.
//!
//! The registry map sits behind one `RwLock`. Each device's location history
//! has its own lock (see [`SharedLocationMap`]). The two are never held at the
//! same time: `add_or_update` releases the registry lock before handing back
//! the device's history, and snapshot readers clone the handle out first.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, TimeDelta, Utc};

use crate::geo::{GeoLocation, SharedLocationMap};
use crate::types::{read, write};

/// Devices seen within this many seconds are "recent".
pub const RECENT_THRESHOLD_SECS: i64 = 10;

// ---------------------------------------------------------------------------
// Sighting (input)
// ---------------------------------------------------------------------------

/// One observation of a device's advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub mac_address: String,
    pub rssi: i32,
    pub device_name: String,
    pub mfr_code: u32,
    pub mfr_data: String,
    pub service_uuids: Vec<String>,
    pub seen_at: DateTime<Utc>,
}

impl Sighting {
    /// A sighting with only address and signal strength set.
    pub fn new(mac_address: &str, rssi: i32, seen_at: DateTime<Utc>) -> Self {
        Sighting {
            mac_address: mac_address.to_string(),
            rssi,
            device_name: String::new(),
            mfr_code: 0,
            mfr_data: String::new(),
            service_uuids: Vec::new(),
            seen_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

/// Merged state for a single device.
#[derive(Debug, Clone)]
pub struct BleDevice {
    pub mac_address: String,
    pub rssi: i32,
    pub device_name: String,
    pub mfr_code: u32,
    pub mfr_data: String,
    pub service_uuids: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub geo: SharedLocationMap,
}

impl BleDevice {
    pub fn new(sighting: Sighting) -> Self {
        BleDevice {
            mac_address: sighting.mac_address,
            rssi: sighting.rssi,
            device_name: sighting.device_name,
            mfr_code: sighting.mfr_code,
            mfr_data: sighting.mfr_data,
            service_uuids: sighting.service_uuids,
            last_seen: sighting.seen_at,
            count: 1,
            geo: SharedLocationMap::new(),
        }
    }

    /// Fold a later sighting into this record.
    ///
    /// RSSI and last-seen always take the new value. Descriptive fields keep
    /// a non-empty existing value unless the sighting brings a non-empty one.
    pub fn merge(&mut self, sighting: Sighting) {
        self.rssi = sighting.rssi;
        self.last_seen = sighting.seen_at;
        self.count += 1;

        if self.device_name.is_empty() || !sighting.device_name.is_empty() {
            self.device_name = sighting.device_name;
        }
        if self.mfr_code == 0 || sighting.mfr_code != 0 {
            self.mfr_code = sighting.mfr_code;
        }
        if self.mfr_data.is_empty() || !sighting.mfr_data.is_empty() {
            self.mfr_data = sighting.mfr_data;
        }
        if self.service_uuids.is_empty() || !sighting.service_uuids.is_empty() {
            self.service_uuids = sighting.service_uuids;
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_seen
    }

    /// Current best location estimate (locks this device's history only).
    pub fn location(&self) -> Option<GeoLocation> {
        self.geo.location()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Registry snapshot split by recency.
///
/// `recent` is ordered by address; `stale` by last seen (whole seconds,
/// newest first) then address.
#[derive(Debug, Clone, Default)]
pub struct SortedDevices {
    pub recent: Vec<BleDevice>,
    pub stale: Vec<BleDevice>,
}

impl SortedDevices {
    /// Recent devices, then stale ones.
    pub fn iter(&self) -> impl Iterator<Item = &BleDevice> {
        self.recent.iter().chain(self.stale.iter())
    }

    pub fn len(&self) -> usize {
        self.recent.len() + self.stale.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Thread-safe device registry keyed by hardware address.
pub struct Aggregator {
    devices: RwLock<HashMap<String, BleDevice>>,
    recent_threshold: TimeDelta,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self::with_recent_threshold(TimeDelta::seconds(RECENT_THRESHOLD_SECS))
    }

    pub fn with_recent_threshold(recent_threshold: TimeDelta) -> Self {
        Aggregator {
            devices: RwLock::new(HashMap::new()),
            recent_threshold,
        }
    }

    /// Insert or merge a sighting. Returns the device's location history
    /// handle so the caller can push a sample without the registry lock.
    pub fn add_or_update(&self, sighting: Sighting) -> SharedLocationMap {
        let mut devices = write(&self.devices);
        match devices.get_mut(&sighting.mac_address) {
            Some(existing) => {
                existing.merge(sighting);
                existing.geo.clone()
            }
            None => {
                let device = BleDevice::new(sighting);
                let geo = device.geo.clone();
                devices.insert(device.mac_address.clone(), device);
                geo
            }
        }
    }

    /// Snapshot split against the current wall-clock time.
    pub fn sorted(&self) -> SortedDevices {
        self.sorted_at(Utc::now())
    }

    /// Snapshot split against `now`. Recency is never stored; it is
    /// recomputed on every call.
    pub fn sorted_at(&self, now: DateTime<Utc>) -> SortedDevices {
        let (mut recent, mut stale): (Vec<BleDevice>, Vec<BleDevice>) = read(&self.devices)
            .values()
            .cloned()
            .partition(|dev| dev.age(now) <= self.recent_threshold);

        recent.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        stale.sort_by(|a, b| {
            b.last_seen
                .timestamp()
                .cmp(&a.last_seen.timestamp())
                .then_with(|| a.mac_address.cmp(&b.mac_address))
        });

        SortedDevices { recent, stale }
    }

    /// Copy of a single device record.
    pub fn get(&self, mac_address: &str) -> Option<BleDevice> {
        read(&self.devices).get(mac_address).cloned()
    }

    /// Drop every device record.
    pub fn clear(&self) {
        write(&self.devices).clear();
    }

    pub fn len(&self) -> usize {
        read(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn recent_threshold(&self) -> TimeDelta {
        self.recent_threshold
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn named(mac: &str, rssi: i32, name: &str, ts: DateTime<Utc>) -> Sighting {
        Sighting {
            device_name: name.to_string(),
            ..Sighting::new(mac, rssi, ts)
        }
    }

    #[test]
    fn test_first_sighting_count_one() {
        let agg = Aggregator::new();
        agg.add_or_update(Sighting::new("AA:BB:CC:DD:EE:FF", -55, t(0)));
        let dev = agg.get("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(dev.count, 1);
        assert_eq!(dev.rssi, -55);
    }

    #[test]
    fn test_merge_keeps_name_overwrites_rssi() {
        let agg = Aggregator::new();
        agg.add_or_update(named("AA:BB:CC:DD:EE:FF", -55, "Test", t(0)));
        agg.add_or_update(named("AA:BB:CC:DD:EE:FF", -60, "", t(1)));

        assert_eq!(agg.len(), 1);
        let dev = agg.get("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(dev.rssi, -60);
        assert_eq!(dev.device_name, "Test");
        assert_eq!(dev.count, 2);
        assert_eq!(dev.last_seen, t(1));
    }

    #[test]
    fn test_merge_non_empty_replaces() {
        let agg = Aggregator::new();
        agg.add_or_update(named("11", -50, "Old", t(0)));
        agg.add_or_update(named("11", -50, "New", t(1)));
        assert_eq!(agg.get("11").unwrap().device_name, "New");
    }

    #[test]
    fn test_merge_all_sticky_fields() {
        let agg = Aggregator::new();
        let full = Sighting {
            mfr_code: 76,
            mfr_data: "TAYCAA==".into(),
            service_uuids: vec!["180f".into()],
            ..named("22", -70, "Tag", t(0))
        };
        agg.add_or_update(full);
        agg.add_or_update(Sighting::new("22", -71, t(1)));
        agg.add_or_update(Sighting::new("22", -72, t(2)));

        let dev = agg.get("22").unwrap();
        assert_eq!(dev.count, 3);
        assert_eq!(dev.rssi, -72);
        assert_eq!(dev.device_name, "Tag");
        assert_eq!(dev.mfr_code, 76);
        assert_eq!(dev.mfr_data, "TAYCAA==");
        assert_eq!(dev.service_uuids, vec!["180f".to_string()]);
    }

    #[test]
    fn test_empty_existing_takes_later_value() {
        let agg = Aggregator::new();
        agg.add_or_update(Sighting::new("33", -70, t(0)));
        agg.add_or_update(Sighting {
            mfr_code: 6,
            ..Sighting::new("33", -70, t(1))
        });
        assert_eq!(agg.get("33").unwrap().mfr_code, 6);
    }

    #[test]
    fn test_count_matches_calls() {
        let agg = Aggregator::new();
        for i in 0..25 {
            agg.add_or_update(Sighting::new("44", -60 - i as i32, t(i)));
        }
        assert_eq!(agg.get("44").unwrap().count, 25);
    }

    #[test]
    fn test_recent_sorted_by_address() {
        let agg = Aggregator::new();
        agg.add_or_update(Sighting::new("BB", -50, t(100)));
        agg.add_or_update(Sighting::new("AA", -50, t(99)));

        let sorted = agg.sorted_at(t(101));
        let macs: Vec<&str> = sorted.recent.iter().map(|d| d.mac_address.as_str()).collect();
        assert_eq!(macs, vec!["AA", "BB"]);
        assert!(sorted.stale.is_empty());
    }

    #[test]
    fn test_stale_sorted_newest_first() {
        let agg = Aggregator::new();
        agg.add_or_update(Sighting::new("AA", -50, t(0)));
        agg.add_or_update(Sighting::new("BB", -50, t(5)));

        let sorted = agg.sorted_at(t(60));
        let macs: Vec<&str> = sorted.stale.iter().map(|d| d.mac_address.as_str()).collect();
        assert_eq!(macs, vec!["BB", "AA"]);
        assert!(sorted.recent.is_empty());
    }

    #[test]
    fn test_stale_same_second_ties_by_address() {
        let agg = Aggregator::new();
        let base = t(0);
        agg.add_or_update(Sighting::new("CC", -50, base + TimeDelta::milliseconds(100)));
        agg.add_or_update(Sighting::new("AA", -50, base + TimeDelta::milliseconds(900)));
        agg.add_or_update(Sighting::new("BB", -50, base));

        let sorted = agg.sorted_at(t(60));
        let macs: Vec<&str> = sorted.stale.iter().map(|d| d.mac_address.as_str()).collect();
        assert_eq!(macs, vec!["AA", "BB", "CC"]);
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let agg = Aggregator::new();
        for i in 0..20 {
            agg.add_or_update(Sighting::new(&format!("D{i:02}"), -60, t(i * 2)));
        }
        let sorted = agg.sorted_at(t(40));
        assert_eq!(sorted.len(), 20);
        for dev in &sorted.recent {
            assert!(!sorted.stale.iter().any(|s| s.mac_address == dev.mac_address));
        }
        // Threshold is inclusive: t(30) is exactly 10s old
        assert!(sorted.recent.iter().any(|d| d.mac_address == "D15"));
        assert!(sorted.stale.iter().any(|d| d.mac_address == "D14"));
    }

    #[test]
    fn test_recency_recomputed_each_call() {
        let agg = Aggregator::new();
        agg.add_or_update(Sighting::new("AA", -50, t(0)));
        assert_eq!(agg.sorted_at(t(5)).recent.len(), 1);
        assert_eq!(agg.sorted_at(t(11)).stale.len(), 1);
    }

    #[test]
    fn test_clear() {
        let agg = Aggregator::new();
        agg.add_or_update(Sighting::new("AA", -50, t(0)));
        agg.add_or_update(Sighting::new("BB", -50, t(0)));
        agg.clear();
        assert!(agg.is_empty());
        assert!(agg.sorted_at(t(0)).is_empty());
    }

    #[test]
    fn test_location_pushed_through_handle() {
        let agg = Aggregator::new();
        let geo = agg.add_or_update(Sighting::new("AA", -42, t(0)));
        geo.push(-42, GeoLocation::point(35.0, -82.0));

        let dev = agg.get("AA").unwrap();
        assert_eq!(dev.location().unwrap().latitude, 35.0);

        // Second sighting returns the same history
        let geo = agg.add_or_update(Sighting::new("AA", -50, t(1)));
        geo.push(-50, GeoLocation::point(0.0, 0.0));
        assert_eq!(agg.get("AA").unwrap().geo.len(), 2);
    }

    #[test]
    fn test_concurrent_writers() {
        let agg = Arc::new(Aggregator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let geo = agg.add_or_update(Sighting::new("AA", -50, t(i)));
                        geo.push(-50 - (i % 5) as i32, GeoLocation::point(1.0, 1.0));
                        let _ = agg.sorted_at(t(i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let dev = agg.get("AA").unwrap();
        assert_eq!(dev.count, 1000);
        assert_eq!(dev.geo.snapshot().rssi_keys().len(), 5);
    }
}
