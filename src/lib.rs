#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Wearlink ⌚
//!
//! Connectivity layer for Bluetooth Low Energy fitness wearables.
//!
//! The crate is split in two layers:
//!
//! - A **device transport** ([`WearableService`], implemented for BLE by
//!   [`BleTransport`]) that discovers peripherals, opens sessions, decodes
//!   GATT notifications into [`FitnessData`] samples and reports sessions the
//!   hardware dropped on its own.
//! - A **connectivity controller** ([`ConnectivityController`]) that turns
//!   those operations into one observable [`ConnectionStatus`], keeps the
//!   collected samples, rejects overlapping operations and disconnects
//!   everything on teardown.
//!
//! Heart rate (service `0x180D`) is mandatory for a session. Battery level
//! and device information are read when the peripheral offers them.
//!
//! ## Quick Start
//!
//! ```no_run
//! use wearlink::{BleTransport, ConnectivityController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = ConnectivityController::new(BleTransport::new().await);
//!
//!     // Scan and let the chooser pick a heart rate monitor
//!     let device = controller.request_device().await?;
//!     controller.connect(&device.id).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     println!("{} samples", controller.fitness_data().await.len());
//!
//!     controller.disconnect(&device.id).await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Connection lifecycle and sample collection
pub mod controller;
/// Error types and handling
pub mod error;
/// GATT identifiers and characteristic decoding
pub mod protocol;
/// Transport contract shared by every implementation
pub mod service;
/// Listener registration handles
pub mod subscription;
/// Type definitions and data structures
pub mod types;

pub use ble::BleTransport;
pub use controller::{ConnectivityController, ControllerSnapshot};
pub use error::{Result, WearableError};
pub use service::{DeviceChooser, StrongestSignalChooser, WearableService};
pub use subscription::Subscription;
pub use types::{
    ConnectOptions, ConnectionStatus, ControllerConfig, Device, DeviceFilter, DeviceInformation,
    DeviceType, FitnessData, FitnessGoals, HeartRateMeasurement, TransportConfig, UserProfile,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
