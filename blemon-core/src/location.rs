//! Current GPS fix and GPS-link status.
//!
//! Written only by the GPS supervisor; read by the ingestion path (to tag new
//! sightings) and by the display layer. The last known fix survives loss of
//! fix so it can still be shown.

use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::geo::GeoLocation;
use crate::types::{read, write};

// ---------------------------------------------------------------------------
// GpsStatus
// ---------------------------------------------------------------------------

/// GPS subsystem status.
///
/// Transitions:
/// - `NoGps -> Detecting` when a GPS port is configured
/// - `Detecting -> Failed | NoFix | Fix`
/// - `NoFix <-> Fix` while the link runs
/// - `Failed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsStatus {
    NoGps,
    Detecting,
    Failed,
    NoFix,
    Fix,
}

impl GpsStatus {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_become(self, next: GpsStatus) -> bool {
        use GpsStatus::*;
        match (self, next) {
            (Failed, _) => false,
            (a, b) if a == b => true,
            (NoGps, Detecting) => true,
            (NoGps, _) => false,
            (Detecting, Failed | NoFix | Fix) => true,
            (NoFix | Fix, NoFix | Fix) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GpsStatus::NoGps => "no_gps",
            GpsStatus::Detecting => "detecting",
            GpsStatus::Failed => "failed",
            GpsStatus::NoFix => "no_fix",
            GpsStatus::Fix => "fix",
        }
    }
}

impl fmt::Display for GpsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// LocationState
// ---------------------------------------------------------------------------

/// Point-in-time view of the GPS subsystem for the display layer.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsSnapshot {
    pub status: GpsStatus,
    pub current: Option<GeoLocation>,
    pub fix_quality: u8,
    pub satellites: u32,
    pub satellites_in_view: u32,
    pub last_update: Option<DateTime<Utc>>,
    pub connected: bool,
    pub reconnecting: bool,
    pub reconnect_attempts: u32,
    /// Time since the link dropped, while reconnecting.
    pub reconnect_elapsed: Option<TimeDelta>,
}

#[derive(Debug)]
struct LocationInner {
    status: GpsStatus,
    current: Option<GeoLocation>,
    fix_quality: u8,
    satellites: u32,
    satellites_in_view: u32,
    last_update: Option<DateTime<Utc>>,

    // Link bookkeeping
    connected: bool,
    reconnecting: bool,
    reconnect_attempts: u32,
    last_disconnect: Option<DateTime<Utc>>,

    // One-shot notices
    failure_dismissed: bool,
    reconnect_dismissed: bool,
}

impl Default for LocationInner {
    fn default() -> Self {
        LocationInner {
            status: GpsStatus::NoGps,
            current: None,
            fix_quality: 0,
            satellites: 0,
            satellites_in_view: 0,
            last_update: None,
            connected: false,
            reconnecting: false,
            reconnect_attempts: 0,
            last_disconnect: None,
            failure_dismissed: false,
            reconnect_dismissed: false,
        }
    }
}

impl LocationInner {
    fn transition(&mut self, next: GpsStatus) -> bool {
        if self.status.can_become(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Latest GPS fix plus GPS-link status.
#[derive(Debug, Default)]
pub struct LocationState {
    inner: RwLock<LocationInner>,
}

impl LocationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current fix, if one was ever obtained.
    pub fn current(&self) -> Option<GeoLocation> {
        read(&self.inner).current
    }

    pub fn status(&self) -> GpsStatus {
        read(&self.inner).status
    }

    /// Apply a status transition. Returns false (and changes nothing) if the
    /// transition is not allowed.
    pub fn set_status(&self, next: GpsStatus) -> bool {
        write(&self.inner).transition(next)
    }

    /// Store a new position. Quality 0 means "no fix": status becomes
    /// `NoFix` and the previous position is kept.
    pub fn set_fix(
        &self,
        location: GeoLocation,
        fix_quality: u8,
        satellites: u32,
        satellites_in_view: u32,
    ) {
        let mut inner = write(&self.inner);
        let next = if fix_quality > 0 {
            GpsStatus::Fix
        } else {
            GpsStatus::NoFix
        };
        if !inner.transition(next) {
            return;
        }
        if fix_quality > 0 {
            inner.current = Some(location);
        }
        inner.fix_quality = fix_quality;
        inner.satellites = satellites;
        inner.satellites_in_view = satellites_in_view;
        inner.last_update = Some(location.timestamp.unwrap_or_else(Utc::now));
    }

    /// Satellites-in-view count from GSV, independent of fix state.
    pub fn set_satellites_in_view(&self, count: u32) {
        write(&self.inner).satellites_in_view = count;
    }

    /// Fix lost; the last position stays available.
    pub fn mark_no_fix(&self) {
        write(&self.inner).transition(GpsStatus::NoFix);
    }

    /// Track GPS link up/down edges.
    ///
    /// Up -> down starts a reconnect episode (timestamped, counter reset,
    /// notice re-armed). Down -> up ends it.
    pub fn set_link_connected(&self, connected: bool) {
        self.set_link_connected_at(connected, Utc::now());
    }

    pub fn set_link_connected_at(&self, connected: bool, at: DateTime<Utc>) {
        let mut inner = write(&self.inner);
        let was_connected = std::mem::replace(&mut inner.connected, connected);

        if was_connected && !connected {
            inner.reconnecting = true;
            inner.last_disconnect = Some(at);
            inner.reconnect_attempts = 0;
            inner.reconnect_dismissed = false;
        } else if connected && !was_connected {
            inner.reconnecting = false;
            inner.reconnect_attempts = 0;
        }
    }

    pub fn record_reconnect_attempt(&self) {
        write(&self.inner).reconnect_attempts += 1;
    }

    /// Baud negotiation failed: GPS is permanently unavailable.
    pub fn should_show_failure_notice(&self) -> bool {
        let inner = read(&self.inner);
        inner.status == GpsStatus::Failed && !inner.failure_dismissed
    }

    pub fn dismiss_failure_notice(&self) {
        write(&self.inner).failure_dismissed = true;
    }

    pub fn should_show_reconnect_notice(&self) -> bool {
        let inner = read(&self.inner);
        inner.reconnecting && !inner.reconnect_dismissed
    }

    pub fn dismiss_reconnect_notice(&self) {
        write(&self.inner).reconnect_dismissed = true;
    }

    pub fn snapshot(&self) -> GpsSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> GpsSnapshot {
        let inner = read(&self.inner);
        GpsSnapshot {
            status: inner.status,
            current: inner.current,
            fix_quality: inner.fix_quality,
            satellites: inner.satellites,
            satellites_in_view: inner.satellites_in_view,
            last_update: inner.last_update,
            connected: inner.connected,
            reconnecting: inner.reconnecting,
            reconnect_attempts: inner.reconnect_attempts,
            reconnect_elapsed: if inner.reconnecting {
                inner.last_disconnect.map(|t| now - t)
            } else {
                None
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fix(lat: f64, lon: f64) -> GeoLocation {
        GeoLocation::new(lat, lon, 200.0, 0.9, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    fn running() -> LocationState {
        let state = LocationState::new();
        assert!(state.set_status(GpsStatus::Detecting));
        assert!(state.set_status(GpsStatus::NoFix));
        state
    }

    #[test]
    fn test_default_no_gps() {
        let state = LocationState::new();
        assert_eq!(state.status(), GpsStatus::NoGps);
        assert!(state.current().is_none());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(GpsStatus::NoFix.to_string(), "no_fix");
        assert_eq!(
            serde_json::to_string(&GpsStatus::NoGps).unwrap(),
            "\"no_gps\""
        );
    }

    #[test]
    fn test_failed_is_terminal() {
        let state = LocationState::new();
        state.set_status(GpsStatus::Detecting);
        assert!(state.set_status(GpsStatus::Failed));
        assert!(!state.set_status(GpsStatus::NoFix));
        state.set_fix(fix(1.0, 1.0), 1, 5, 9);
        assert_eq!(state.status(), GpsStatus::Failed);
        assert!(state.current().is_none());
    }

    #[test]
    fn test_no_gps_only_moves_to_detecting() {
        assert!(!GpsStatus::NoGps.can_become(GpsStatus::Fix));
        assert!(GpsStatus::NoGps.can_become(GpsStatus::Detecting));
        assert!(GpsStatus::Fix.can_become(GpsStatus::NoFix));
        assert!(!GpsStatus::Fix.can_become(GpsStatus::Detecting));
    }

    #[test]
    fn test_set_fix() {
        let state = running();
        state.set_fix(fix(35.5, -82.5), 1, 7, 12);

        let snap = state.snapshot();
        assert_eq!(snap.status, GpsStatus::Fix);
        assert_eq!(snap.fix_quality, 1);
        assert_eq!(snap.satellites, 7);
        assert_eq!(snap.satellites_in_view, 12);
        assert_eq!(snap.current.unwrap().latitude, 35.5);
        assert!(snap.last_update.is_some());
    }

    #[test]
    fn test_no_fix_keeps_last_location() {
        let state = running();
        state.set_fix(fix(35.5, -82.5), 2, 7, 12);
        state.mark_no_fix();
        assert_eq!(state.status(), GpsStatus::NoFix);
        assert_eq!(state.current().unwrap().longitude, -82.5);

        state.set_fix(fix(0.0, 0.0), 0, 0, 3);
        assert_eq!(state.status(), GpsStatus::NoFix);
        assert_eq!(state.current().unwrap().latitude, 35.5);
    }

    #[test]
    fn test_reconnect_episode() {
        let state = running();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        state.set_link_connected_at(true, t0);
        assert!(!state.should_show_reconnect_notice());

        state.set_link_connected_at(false, t0);
        state.record_reconnect_attempt();
        state.record_reconnect_attempt();
        assert!(state.should_show_reconnect_notice());

        let snap = state.snapshot_at(t0 + TimeDelta::seconds(7));
        assert!(snap.reconnecting);
        assert_eq!(snap.reconnect_attempts, 2);
        assert_eq!(snap.reconnect_elapsed, Some(TimeDelta::seconds(7)));

        state.dismiss_reconnect_notice();
        assert!(!state.should_show_reconnect_notice());

        state.set_link_connected_at(true, t0);
        let snap = state.snapshot_at(t0);
        assert!(!snap.reconnecting);
        assert_eq!(snap.reconnect_attempts, 0);
        assert!(snap.reconnect_elapsed.is_none());
    }

    #[test]
    fn test_reconnect_notice_rearmed_per_episode() {
        let state = running();
        state.set_link_connected(true);
        state.set_link_connected(false);
        state.dismiss_reconnect_notice();
        state.set_link_connected(true);
        state.set_link_connected(false);
        assert!(state.should_show_reconnect_notice());
    }

    #[test]
    fn test_failure_notice() {
        let state = LocationState::new();
        assert!(!state.should_show_failure_notice());
        state.set_status(GpsStatus::Detecting);
        state.set_status(GpsStatus::Failed);
        assert!(state.should_show_failure_notice());
        state.dismiss_failure_notice();
        assert!(!state.should_show_failure_notice());
    }
}
