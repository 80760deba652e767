//! The transport-independent wearable service contract.
//!
//! The connectivity controller only ever talks to a [`WearableService`]. The
//! Bluetooth implementation lives in [`crate::ble`]; tests and alternative
//! transports provide their own.

use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    error::Result,
    subscription::Subscription,
    types::{
        ConnectOptions, Device, DeviceFilter, FitnessData, FitnessGoals, HeartRateMeasurement,
        UserProfile,
    },
};

/// Receives every decoded sample for a subscribed device
pub type SampleCallback = dyn Fn(FitnessData) + Send + Sync;

/// Receives the id of a device whose session was lost without being asked
pub type SessionLostCallback = dyn Fn(&str) + Send + Sync;

/// Receives decoded heart rate measurements as `(device_id, measurement)`
pub type HeartRateCallback = dyn Fn(&str, &HeartRateMeasurement) + Send + Sync;

/// Receives battery level updates as `(device_id, level)`
pub type BatteryLevelCallback = dyn Fn(&str, u8) + Send + Sync;

/// Contract every wearable transport satisfies
#[async_trait]
pub trait WearableService: Send + Sync {
    /// True iff the host exposes the hardware API at all. Never fails.
    fn is_available(&self) -> bool;

    /// Run the host's device chooser, narrowed by `filter`
    ///
    /// # Errors
    ///
    /// [`crate::WearableError::NoDeviceSelected`] if the user cancels,
    /// [`crate::WearableError::TransportUnavailable`] if there is no hardware API.
    async fn request_device(&self, filter: Option<&DeviceFilter>) -> Result<Device>;

    /// Open a session to a previously discovered device
    ///
    /// Returns `true` once the mandatory data stream is live.
    ///
    /// # Errors
    ///
    /// Fails if the device is unknown, the link cannot be opened, or a
    /// required service is missing. No partial session is left behind.
    async fn connect(&self, device_id: &str, options: &ConnectOptions) -> Result<bool>;

    /// Close a session; a no-op for devices that are not connected
    ///
    /// No sample for `device_id` is delivered after this returns.
    ///
    /// # Errors
    ///
    /// Fails if the host refuses to close the link.
    async fn disconnect(&self, device_id: &str) -> Result<()>;

    /// Cached view of known devices
    async fn get_devices(&self) -> Vec<Device>;

    /// Deliver decoded samples for `device_id` until the subscription is dropped
    fn subscribe(&self, device_id: &str, callback: Arc<SampleCallback>) -> Subscription;

    /// Be told about every unsolicited session loss
    fn watch_sessions(&self, callback: Arc<SessionLostCallback>) -> Subscription;

    /// Store the user profile for the session
    async fn set_user_profile(&self, profile: UserProfile);

    /// Store the fitness goals for the session
    async fn set_fitness_goals(&self, goals: FitnessGoals);
}

/// Host hook standing in for the platform device chooser
#[async_trait]
pub trait DeviceChooser: Send + Sync {
    /// Pick one of `candidates` by id, or `None` if the user cancelled
    async fn choose(&self, candidates: &[Device]) -> Option<String>;
}

/// Picks the candidate with the strongest signal
#[derive(Debug, Clone, Copy, Default)]
pub struct StrongestSignalChooser;

#[async_trait]
impl DeviceChooser for StrongestSignalChooser {
    async fn choose(&self, candidates: &[Device]) -> Option<String> {
        candidates
            .iter()
            .max_by_key(|device| device.rssi.unwrap_or(i16::MIN))
            .map(|device| device.id.clone())
    }
}
