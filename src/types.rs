use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};
use uuid::Uuid;

use crate::protocol::{
    BODY_COMPOSITION_SERVICE_UUID, CYCLING_POWER_SERVICE_UUID, CYCLING_SPEED_CADENCE_SERVICE_UUID,
    FITNESS_MACHINE_SERVICE_UUID, HEART_RATE_SERVICE_UUID, RUNNING_SPEED_CADENCE_SERVICE_UUID,
    WEIGHT_SCALE_SERVICE_UUID,
};

/// Category of a wearable peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Chest strap or arm band heart-rate monitor
    HeartRateMonitor,
    /// Wrist-worn activity tracker
    FitnessBand,
    /// Smartwatch
    Smartwatch,
    /// Weight or body composition scale
    SmartScale,
    /// Cycling speed, cadence or power sensor
    CyclingSensor,
    /// Foot pod for running speed and cadence
    RunningPod,
    /// Gym equipment exposing the Fitness Machine service
    StrengthTrainer,
}

impl DeviceType {
    /// Infer the device category from its advertisement
    ///
    /// Specific fitness services win over name heuristics. Anything that
    /// only advertises Heart Rate is treated as a heart-rate monitor.
    #[must_use]
    pub fn from_advertisement(name: Option<&str>, services: &[Uuid]) -> Self {
        let advertises = |uuid: &Uuid| services.contains(uuid);

        if advertises(&CYCLING_SPEED_CADENCE_SERVICE_UUID)
            || advertises(&CYCLING_POWER_SERVICE_UUID)
        {
            return Self::CyclingSensor;
        }
        if advertises(&RUNNING_SPEED_CADENCE_SERVICE_UUID) {
            return Self::RunningPod;
        }
        if advertises(&WEIGHT_SCALE_SERVICE_UUID) || advertises(&BODY_COMPOSITION_SERVICE_UUID) {
            return Self::SmartScale;
        }
        if advertises(&FITNESS_MACHINE_SERVICE_UUID) {
            return Self::StrengthTrainer;
        }

        let name = name.map(str::to_lowercase).unwrap_or_default();
        if name.contains("watch") {
            Self::Smartwatch
        } else if name.contains("band") || name.contains("fit") {
            Self::FitnessBand
        } else {
            Self::HeartRateMonitor
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRateMonitor => write!(f, "Heart Rate Monitor"),
            Self::FitnessBand => write!(f, "Fitness Band"),
            Self::Smartwatch => write!(f, "Smartwatch"),
            Self::SmartScale => write!(f, "Smart Scale"),
            Self::CyclingSensor => write!(f, "Cycling Sensor"),
            Self::RunningPod => write!(f, "Running Pod"),
            Self::StrengthTrainer => write!(f, "Strength Trainer"),
        }
    }
}

/// Strings read from the Device Information service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    /// Manufacturer name
    pub manufacturer: Option<String>,
    /// Model number
    pub model: Option<String>,
    /// Serial number
    pub serial_number: Option<String>,
    /// Firmware revision
    pub firmware_version: Option<String>,
    /// Hardware revision
    pub hardware_version: Option<String>,
    /// Software revision
    pub software_version: Option<String>,
}

impl DeviceInformation {
    /// True when no field could be read
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.manufacturer.is_none()
            && self.model.is_none()
            && self.serial_number.is_none()
            && self.firmware_version.is_none()
            && self.hardware_version.is_none()
            && self.software_version.is_none()
    }
}

/// Identity and capability snapshot of one physical peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier assigned by the host transport
    pub id: String,
    /// Advertised display name
    pub name: Option<String>,
    /// Device category
    pub device_type: DeviceType,
    /// True only while a live session exists
    pub connected: bool,
    /// Battery percentage (0-100)
    pub battery_level: Option<u8>,
    /// Time of the most recent successful data receipt
    pub last_sync: Option<SystemTime>,
    /// Advertised signal strength
    pub rssi: Option<i16>,
    /// Device Information service strings
    pub information: DeviceInformation,
}

impl Device {
    /// Create a disconnected device with no metadata
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name,
            device_type,
            connected: false,
            battery_level: None,
            last_sync: None,
            rssi: None,
            information: DeviceInformation::default(),
        }
    }

    /// Name to show in a device list
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown device")
    }
}

/// Fully decoded Heart Rate Measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateMeasurement {
    /// Beats per minute
    pub bpm: u16,
    /// Skin contact, if the sensor reports it
    pub sensor_contact: Option<bool>,
    /// Cumulative energy expended in kilojoules
    pub energy_expended: Option<u16>,
    /// RR intervals in units of 1/1024 second
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    /// RR intervals converted to milliseconds
    #[must_use]
    pub fn rr_intervals_ms(&self) -> Vec<f32> {
        self.rr_intervals
            .iter()
            .map(|raw| f32::from(*raw) * 1000.0 / 1024.0)
            .collect()
    }
}

/// One decoded fitness observation
///
/// Metric fields are sparse: only what the peripheral supplied is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessData {
    /// When the observation was decoded
    pub timestamp: SystemTime,
    /// Device the observation came from
    pub device_id: String,
    /// Heart rate in beats per minute
    pub heart_rate: Option<u16>,
    /// RR intervals in milliseconds
    pub rr_intervals: Option<Vec<f32>>,
    /// Cumulative energy expended in kilojoules
    pub energy_expended: Option<u16>,
    /// Step count
    pub steps: Option<u32>,
    /// Calories burned (kcal)
    pub calories: Option<f64>,
    /// Distance in meters
    pub distance: Option<f64>,
    /// Active minutes
    pub active_minutes: Option<u32>,
    /// Blood oxygen saturation percentage
    pub blood_oxygen: Option<u8>,
    /// Body weight in kilograms
    pub weight: Option<f64>,
    /// Body fat percentage
    pub body_fat: Option<f64>,
}

impl FitnessData {
    /// Create an empty sample for a device, stamped now
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            device_id: device_id.into(),
            heart_rate: None,
            rr_intervals: None,
            energy_expended: None,
            steps: None,
            calories: None,
            distance: None,
            active_minutes: None,
            blood_oxygen: None,
            weight: None,
            body_fat: None,
        }
    }

    /// Build a sample from a heart rate measurement
    #[must_use]
    pub fn from_heart_rate(
        device_id: impl Into<String>,
        measurement: &HeartRateMeasurement,
    ) -> Self {
        let rr_intervals =
            (!measurement.rr_intervals.is_empty()).then(|| measurement.rr_intervals_ms());

        Self {
            heart_rate: Some(measurement.bpm),
            rr_intervals,
            energy_expended: measurement.energy_expended,
            ..Self::new(device_id)
        }
    }
}

/// Externally observable connection status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Nothing in progress
    #[default]
    Idle,
    /// Device chooser is open
    Searching,
    /// Session is being opened
    Connecting,
    /// Heart rate stream is live
    Connected,
    /// Session just ended; transient
    Disconnected,
    /// Last operation failed; see the retained error
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Searching => write!(f, "searching"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// User profile handed through from the host application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Age in years
    pub age: Option<u8>,
    /// Body weight in kilograms
    pub weight_kg: Option<f32>,
    /// Height in centimeters
    pub height_cm: Option<f32>,
    /// Free-form gender label
    pub gender: Option<String>,
    /// Resting heart rate
    pub resting_heart_rate: Option<u16>,
    /// Maximum heart rate
    pub max_heart_rate: Option<u16>,
}

/// Fitness goals handed through from the host application
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitnessGoals {
    /// Daily step target
    pub daily_steps: Option<u32>,
    /// Daily calorie target (kcal)
    pub daily_calories: Option<u32>,
    /// Daily active minutes target
    pub daily_active_minutes: Option<u32>,
    /// Workouts per week
    pub weekly_workouts: Option<u32>,
    /// Target heart rate zone as (low, high) bpm
    pub target_heart_rate_zone: Option<(u16, u16)>,
}

/// Narrows device discovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    /// Services a candidate must advertise, in addition to Heart Rate
    pub services: Vec<Uuid>,
    /// Case-insensitive name prefix
    pub name_prefix: Option<String>,
}

impl DeviceFilter {
    /// Service list for the scan, always including Heart Rate
    #[must_use]
    pub fn required_services(&self) -> Vec<Uuid> {
        let mut services = vec![HEART_RATE_SERVICE_UUID];
        for uuid in &self.services {
            if !services.contains(uuid) {
                services.push(*uuid);
            }
        }
        services
    }

    /// Check an advertisement against the filter
    #[must_use]
    pub fn matches(&self, name: Option<&str>, advertised: &[Uuid]) -> bool {
        let services_ok = self
            .required_services()
            .iter()
            .all(|uuid| advertised.contains(uuid));

        let name_ok = self.name_prefix.as_ref().is_none_or(|prefix| {
            name.is_some_and(|name| name.to_lowercase().starts_with(&prefix.to_lowercase()))
        });

        services_ok && name_ok
    }
}

/// Per-connection switches for the optional profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Subscribe to Battery Level if the service exists
    pub subscribe_battery: bool,
    /// Read the Device Information strings if the service exists
    pub read_device_information: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            subscribe_battery: true,
            read_device_information: true,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long discovery listens for advertisements, in milliseconds
    pub scan_duration_ms: u64,
    /// Default filter applied when `request_device` gets none
    pub default_filter: DeviceFilter,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scan_duration_ms: 10_000,
            default_filter: DeviceFilter::default(),
        }
    }
}

/// Connectivity controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long `Disconnected` is shown before returning to `Idle`, in milliseconds
    pub disconnect_settle_ms: u64,
    /// Options passed to every `connect`
    pub connect_options: ConnectOptions,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            disconnect_settle_ms: 1_000,
            connect_options: ConnectOptions::default(),
        }
    }
}
