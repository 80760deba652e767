use crate::{
    error::{Result, WearableError},
    types::HeartRateMeasurement,
};
use bytes::Buf;
use uuid::Uuid;

/// Expand a 16-bit SIG-assigned number into a full Bluetooth base UUID
#[must_use]
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = sig_uuid(0x180D);
/// Heart Rate Measurement characteristic (0x2A37), notify only
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = sig_uuid(0x2A37);

/// Battery service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid = sig_uuid(0x180F);
/// Battery Level characteristic (0x2A19), read + notify
pub const BATTERY_LEVEL_UUID: Uuid = sig_uuid(0x2A19);

/// Device Information service (0x180A)
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid = sig_uuid(0x180A);
/// Manufacturer Name String (0x2A29)
pub const MANUFACTURER_NAME_UUID: Uuid = sig_uuid(0x2A29);
/// Model Number String (0x2A24)
pub const MODEL_NUMBER_UUID: Uuid = sig_uuid(0x2A24);
/// Serial Number String (0x2A25)
pub const SERIAL_NUMBER_UUID: Uuid = sig_uuid(0x2A25);
/// Firmware Revision String (0x2A26)
pub const FIRMWARE_REVISION_UUID: Uuid = sig_uuid(0x2A26);
/// Hardware Revision String (0x2A27)
pub const HARDWARE_REVISION_UUID: Uuid = sig_uuid(0x2A27);
/// Software Revision String (0x2A28)
pub const SOFTWARE_REVISION_UUID: Uuid = sig_uuid(0x2A28);

/// Running Speed and Cadence service (0x1814)
pub const RUNNING_SPEED_CADENCE_SERVICE_UUID: Uuid = sig_uuid(0x1814);
/// Cycling Speed and Cadence service (0x1816)
pub const CYCLING_SPEED_CADENCE_SERVICE_UUID: Uuid = sig_uuid(0x1816);
/// Cycling Power service (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid = sig_uuid(0x1818);
/// Weight Scale service (0x181D)
pub const WEIGHT_SCALE_SERVICE_UUID: Uuid = sig_uuid(0x181D);
/// Body Composition service (0x181B)
pub const BODY_COMPOSITION_SERVICE_UUID: Uuid = sig_uuid(0x181B);
/// Fitness Machine service (0x1826)
pub const FITNESS_MACHINE_SERVICE_UUID: Uuid = sig_uuid(0x1826);

/// Heart Rate Measurement flag bits
///
/// Layout of byte 0 of the measurement, per the Heart Rate Profile:
/// - Bit 0: heart rate value format (0 = u8, 1 = u16 little-endian)
/// - Bit 1: sensor contact detected
/// - Bit 2: sensor contact feature supported
/// - Bit 3: energy expended field present (u16 LE, kilojoules)
/// - Bit 4: one or more RR intervals present (u16 LE each, 1/1024 s)
pub mod hr_flags {
    /// Heart rate is a 16-bit value
    pub const VALUE_FORMAT_U16: u8 = 0x01;
    /// Skin contact detected
    pub const SENSOR_CONTACT_DETECTED: u8 = 0x02;
    /// Sensor reports contact at all
    pub const SENSOR_CONTACT_SUPPORTED: u8 = 0x04;
    /// Energy expended field follows the heart rate
    pub const ENERGY_EXPENDED_PRESENT: u8 = 0x08;
    /// RR intervals fill the rest of the payload
    pub const RR_INTERVALS_PRESENT: u8 = 0x10;
}

/// Maximum battery percentage reported by the Battery Level characteristic
pub const MAX_BATTERY_LEVEL: u8 = 100;

/// Decode a Heart Rate Measurement notification
///
/// Only the heart rate itself is mandatory. Optional trailing fields that
/// are flagged but truncated are dropped rather than failing the sample.
///
/// # Errors
///
/// Returns [`WearableError::ParseError`] if the payload is empty or too short
/// for the heart rate format announced by the flags.
pub fn decode_heart_rate(data: &[u8]) -> Result<HeartRateMeasurement> {
    if data.is_empty() {
        return Err(WearableError::ParseError(
            "Heart rate payload is empty".to_string(),
        ));
    }

    let mut buf = data;
    let flags = buf.get_u8();

    let bpm = if flags & hr_flags::VALUE_FORMAT_U16 != 0 {
        if buf.remaining() < 2 {
            return Err(WearableError::ParseError(format!(
                "Heart rate payload too short for u16 value: {} bytes",
                data.len()
            )));
        }
        buf.get_u16_le()
    } else {
        if buf.remaining() < 1 {
            return Err(WearableError::ParseError(
                "Heart rate payload too short for u8 value".to_string(),
            ));
        }
        u16::from(buf.get_u8())
    };

    let sensor_contact = (flags & hr_flags::SENSOR_CONTACT_SUPPORTED != 0)
        .then_some(flags & hr_flags::SENSOR_CONTACT_DETECTED != 0);

    let energy_expended =
        if flags & hr_flags::ENERGY_EXPENDED_PRESENT != 0 && buf.remaining() >= 2 {
            Some(buf.get_u16_le())
        } else {
            None
        };

    let mut rr_intervals = Vec::new();
    if flags & hr_flags::RR_INTERVALS_PRESENT != 0 {
        while buf.remaining() >= 2 {
            rr_intervals.push(buf.get_u16_le());
        }
    }

    Ok(HeartRateMeasurement {
        bpm,
        sensor_contact,
        energy_expended,
        rr_intervals,
    })
}

/// Decode a Battery Level value, clamped to 0-100
///
/// # Errors
///
/// Returns [`WearableError::ParseError`] if the payload is empty.
pub fn decode_battery_level(data: &[u8]) -> Result<u8> {
    data.first()
        .map(|level| (*level).min(MAX_BATTERY_LEVEL))
        .ok_or_else(|| WearableError::ParseError("Battery payload is empty".to_string()))
}

/// Decode a Device Information string characteristic
///
/// Some firmware pads these fixed-size fields with NULs or spaces. Returns
/// `None` when nothing printable is left.
#[must_use]
pub fn decode_info_string(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    let trimmed = text.trim_end_matches('\0').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
