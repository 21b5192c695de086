//! blemon-core: BLE sighting aggregation and geolocation library.
//!
//! No async, no serial I/O. Holds the device registry and its merge rule,
//! RSSI-bucketed location history, link state shared with the display,
//! record and NMEA decoding, and the geometry behind the KML export. The
//! `blemon` binary in `blemon-monitor` drives it from serial streams.

pub mod aggregator;
pub mod config;
pub mod connection;
pub mod export;
pub mod geo;
pub mod geometry;
pub mod location;
pub mod nmea;
pub mod record;
pub mod types;

// Re-export commonly used types at crate root
pub use aggregator::{Aggregator, BleDevice, Sighting, SortedDevices};
pub use connection::{ConnectionState, ConnectionStatus, RetryDelay};
pub use geo::{GeoLocation, RingBuffer, RssiLocationMap, SharedLocationMap};
pub use location::{GpsSnapshot, GpsStatus, LocationState};
pub use nmea::NmeaInterpreter;
pub use record::{decode_record, LineOutcome, Record, RecordHandler};
pub use types::*;
