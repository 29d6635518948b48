#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pulselink ❤️
//!
//! A Rust library for streaming live heart-rate data from Bluetooth Low
//! Energy chest straps and armbands.
//!
//! Pulselink speaks the standard Bluetooth SIG Heart Rate Profile, so it works
//! with any compliant monitor (Polar, Garmin, Wahoo, CooSpo and many more)
//! without per-vendor code. The library covers the whole connection
//! lifecycle:
//!
//! - **Scanning**: filtered device discovery with a grace fallback for straps
//!   that advertise nothing useful
//! - **Connecting**: service discovery, characteristic subscription, and a
//!   bounded connect timeout with precise failure classification
//! - **Streaming**: decoded heart-rate samples and best-effort battery levels
//!   fanned out to any number of subscribers
//! - **Reconnecting**: automatic recovery from dropped connections with
//!   exponential backoff and a terminal give-up state
//! - **Demo mode**: a synthetic device with the exact same lifecycle, for
//!   development and demos without hardware
//!
//! ## Quick Start
//!
//! ```no_run
//! use pulselink::{
//!     ble::BtleplugCentral,
//!     session::session_for,
//!     storage::MemorySettingsStore,
//!     types::{DeviceId, SessionConfig},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let central = Arc::new(BtleplugCentral::new().await?);
//!     let store = Arc::new(MemorySettingsStore::new());
//!
//!     // Connect to a strap by its platform identifier
//!     let id = DeviceId::new("AA:BB:CC:DD:EE:FF");
//!     let session = session_for(&id, central, store, SessionConfig::default()).await?;
//!     session.connect(&id).await?;
//!
//!     // Stream decoded samples
//!     let mut samples = session.subscribe_to_heart_rate();
//!     while let Ok(sample) = samples.recv().await {
//!         println!("{} bpm", sample.bpm);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Demo Mode
//!
//! Connecting to [`DeviceId::demo`](types::DeviceId::demo) yields a
//! [`DemoSession`](demo::DemoSession) that emits plausible synthetic samples
//! once per second. Everything built on top of [`HeartRateSession`] works
//! against it unchanged.

/// Bluetooth Low Energy transport traits and the btleplug-backed implementation
pub mod ble;
/// Heart Rate Profile and Battery Service payload decoding
pub mod codec;
/// Synthetic heart-rate session for development without hardware
pub mod demo;
/// Error types and handling
pub mod error;
/// Scriptable in-memory transport doubles for tests
pub mod mock;
/// Automatic reconnection with exponential backoff
pub mod reconnect;
/// Scan-result filtering and bookkeeping
pub mod registry;
/// Device session lifecycle and live data streams
pub mod session;
/// Small persisted-settings layer for device memory
pub mod storage;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use demo::DemoSession;
pub use error::{ConnectError, FormatError, HardwareError, StorageError};
pub use reconnect::ReconnectionController;
pub use session::{session_for, BleSession, HeartRateSession};
pub use types::{
    BackoffPolicy, BatteryLevel, ConnectivityState, DeviceId, HeartRateSample, ReconnectConfig,
    ReconnectionState, ScannedDevice, SessionConfig,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Expand a 16-bit SIG-assigned identifier to a full 128-bit UUID.
///
/// Bluetooth assigned numbers are published as 16-bit aliases of the SIG base
/// UUID `0000xxxx-0000-1000-8000-00805F9B34FB`. Peripherals may advertise
/// either form; comparisons in this crate always use the expanded one.
#[must_use]
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

/// Heart Rate service UUID (SIG-assigned `0x180D`)
///
/// Every compliant heart-rate monitor exposes this service. It is both the
/// scan-filter criterion and the container for the measurement
/// characteristic.
pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);

/// Heart Rate Measurement characteristic UUID (SIG-assigned `0x2A37`)
///
/// Notification-only characteristic carrying the flags-prefixed measurement
/// payload decoded by [`codec::parse_heart_rate`].
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A37);

/// Battery service UUID (SIG-assigned `0x180F`)
///
/// Optional on heart-rate monitors; sessions use it opportunistically and
/// never fail a connection over its absence.
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180F);

/// Battery Level characteristic UUID (SIG-assigned `0x2A19`)
///
/// Single-byte charge percentage, readable and usually notifiable.
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2A19);
