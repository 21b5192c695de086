//! Geolocation samples and the per-device RSSI-bucketed location history.
//!
//! Every sighting taken while a GPS fix is available becomes a sample keyed by
//! the RSSI reported in that sighting. Samples for one exact RSSI value live in
//! a bounded ring buffer, so memory per device is capped by the number of
//! distinct RSSI values times [`SAMPLES_PER_RSSI`].
//!
//! The point estimate always comes from the strongest bucket that has data.
//! Weaker buckets feed the path and area geometry on export.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{read, write};

/// Ring buffer capacity for each distinct RSSI value.
pub const SAMPLES_PER_RSSI: usize = 13;

// ---------------------------------------------------------------------------
// GeoLocation
// ---------------------------------------------------------------------------

/// A geographic position with a quality metric.
///
/// `accuracy` carries HDOP when the source provides it (0 otherwise).
/// Averaged estimates have no `timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub accuracy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl GeoLocation {
    /// A timestamped fix.
    pub fn new(
        latitude: f64,
        longitude: f64,
        elevation: f64,
        accuracy: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        GeoLocation {
            latitude,
            longitude,
            elevation,
            accuracy,
            timestamp: Some(timestamp),
        }
    }

    /// A bare coordinate with no elevation, accuracy, or timestamp.
    pub fn point(latitude: f64, longitude: f64) -> Self {
        GeoLocation {
            latitude,
            longitude,
            elevation: 0.0,
            accuracy: 0.0,
            timestamp: None,
        }
    }

    /// Arithmetic mean of position, elevation and accuracy. `None` for an empty slice.
    pub fn mean(samples: &[GeoLocation]) -> Option<GeoLocation> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let (lat, lon, el, acc) = samples.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, s| {
            (
                acc.0 + s.latitude,
                acc.1 + s.longitude,
                acc.2 + s.elevation,
                acc.3 + s.accuracy,
            )
        });
        Some(GeoLocation {
            latitude: lat / n,
            longitude: lon / n,
            elevation: el / n,
            accuracy: acc / n,
            timestamp: None,
        })
    }
}

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity FIFO that evicts the oldest element when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer. Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        RingBuffer {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Contents from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Snapshot of the contents, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// RssiLocationMap
// ---------------------------------------------------------------------------

/// One retained sample and its position in observation order.
#[derive(Debug, Clone, Copy)]
struct Sample {
    seq: u64,
    location: GeoLocation,
}

/// Location samples bucketed by exact RSSI value.
#[derive(Debug, Clone, Default)]
pub struct RssiLocationMap {
    buckets: HashMap<i32, RingBuffer<Sample>>,
    /// Every RSSI key seen, strongest first.
    rssi_keys: Vec<i32>,
    highest: Option<i32>,
    next_seq: u64,
}

impl RssiLocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample under `rssi`, creating its bucket on first use.
    pub fn push(&mut self, rssi: i32, location: GeoLocation) {
        if !self.buckets.contains_key(&rssi) {
            let pos = self.rssi_keys.partition_point(|&k| k > rssi);
            self.rssi_keys.insert(pos, rssi);
            if self.highest.map_or(true, |h| rssi > h) {
                self.highest = Some(rssi);
            }
        }
        let sample = Sample {
            seq: self.next_seq,
            location,
        };
        self.next_seq += 1;
        self.buckets
            .entry(rssi)
            .or_insert_with(|| RingBuffer::new(SAMPLES_PER_RSSI))
            .push(sample);
    }

    /// Mean of the strongest non-empty bucket, or `None` with no samples.
    pub fn location(&self) -> Option<GeoLocation> {
        GeoLocation::mean(&self.strongest_samples())
    }

    /// Samples of the strongest non-empty bucket, oldest first.
    pub fn strongest_samples(&self) -> Vec<GeoLocation> {
        self.rssi_keys
            .iter()
            .filter_map(|rssi| self.buckets.get(rssi))
            .find(|b| !b.is_empty())
            .map(|b| b.iter().map(|s| s.location).collect())
            .unwrap_or_default()
    }

    /// Every retained sample across all buckets in the order it was pushed.
    pub fn samples(&self) -> Vec<GeoLocation> {
        let mut all: Vec<Sample> = self
            .buckets
            .values()
            .flat_map(|b| b.iter().copied())
            .collect();
        all.sort_by_key(|s| s.seq);
        all.into_iter().map(|s| s.location).collect()
    }

    /// RSSI keys, strongest first.
    pub fn rssi_keys(&self) -> &[i32] {
        &self.rssi_keys
    }

    pub fn highest_rssi(&self) -> Option<i32> {
        self.highest
    }

    /// Samples held for exactly `rssi`, oldest first.
    pub fn bucket(&self, rssi: i32) -> Vec<GeoLocation> {
        self.buckets
            .get(&rssi)
            .map(|b| b.iter().map(|s| s.location).collect())
            .unwrap_or_default()
    }

    /// Total retained samples.
    pub fn len(&self) -> usize {
        self.buckets.values().map(RingBuffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A device's location history behind its own lock.
///
/// Cloning shares the same history; the registry lock is never needed to
/// read or write it.
#[derive(Debug, Clone, Default)]
pub struct SharedLocationMap(Arc<RwLock<RssiLocationMap>>);

impl SharedLocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, rssi: i32, location: GeoLocation) {
        write(&self.0).push(rssi, location);
    }

    pub fn location(&self) -> Option<GeoLocation> {
        read(&self.0).location()
    }

    /// Consistent copy of the whole history, taken under one read lock.
    pub fn snapshot(&self) -> RssiLocationMap {
        read(&self.0).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
