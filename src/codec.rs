use crate::{
    error::FormatError,
    types::BatteryLevel,
};
use bytes::Buf;
use std::time::Duration;

/// Flags bit 0: BPM is a u16 little-endian instead of a u8.
pub const FLAG_BPM_U16: u8 = 0x01;

/// Flags bit 1: skin contact detected (only meaningful when bit 2 is set).
pub const FLAG_CONTACT_DETECTED: u8 = 0x02;

/// Flags bit 2: the sensor reports skin contact at all.
pub const FLAG_CONTACT_SUPPORTED: u8 = 0x04;

/// Flags bit 3: an energy-expended field follows the BPM.
pub const FLAG_ENERGY_PRESENT: u8 = 0x08;

/// Flags bit 4: one or more RR-interval fields terminate the payload.
pub const FLAG_RR_PRESENT: u8 = 0x10;

/// RR-interval resolution: raw values count 1/1024ths of a second.
const RR_TICKS_PER_SEC: u64 = 1024;

/// Fully decoded Heart Rate Measurement notification.
///
/// [`parse_heart_rate`] is the hot path and extracts only the BPM;
/// this struct carries the optional fields for callers that want them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    /// Beats per minute.
    pub bpm: u16,
    /// Skin contact: `None` when the sensor does not report it.
    pub sensor_contact: Option<bool>,
    /// Cumulative energy expended in kilojoules, when reported.
    pub energy_expended: Option<u16>,
    /// Beat-to-beat intervals, oldest first.
    pub rr_intervals: Vec<Duration>,
}

/// Extract the BPM from a Heart Rate Measurement (0x2A37) payload.
///
/// Wire format per the Bluetooth SIG characteristic definition:
/// - Byte 0: flags; bit 0 selects the BPM width
/// - Bit 0 clear: byte 1 is the BPM as a u8
/// - Bit 0 set: bytes 1-2 are the BPM as a u16 little-endian
///
/// Trailing bytes past the BPM (energy, RR intervals) are ignored here;
/// use [`parse_measurement`] to decode them.
///
/// # Errors
///
/// [`FormatError::Empty`] for a zero-length payload,
/// [`FormatError::Truncated`] when the payload ends before the width the
/// flags demand.
pub fn parse_heart_rate(payload: &[u8]) -> Result<u16, FormatError> {
    if payload.is_empty() {
        return Err(FormatError::Empty);
    }

    let mut buf = payload;
    let flags = buf.get_u8();

    if flags & FLAG_BPM_U16 != 0 {
        if buf.remaining() < 2 {
            return Err(FormatError::Truncated {
                required: 3,
                actual: payload.len(),
            });
        }
        Ok(buf.get_u16_le())
    } else {
        if buf.remaining() < 1 {
            return Err(FormatError::Truncated {
                required: 2,
                actual: payload.len(),
            });
        }
        Ok(u16::from(buf.get_u8()))
    }
}

/// Decode a full Heart Rate Measurement (0x2A37) payload.
///
/// Field order after the BPM, each gated by its flags bit:
/// - Bits 1-2: sensor contact status (bit 2 = reported, bit 1 = detected)
/// - Bit 3: energy expended, u16 little-endian, kilojoules
/// - Bit 4: RR intervals, u16 little-endian each, 1/1024-second units,
///   repeated to the end of the payload
///
/// The BPM itself is parsed strictly, exactly as [`parse_heart_rate`] does.
/// Optional fields the flags advertise but the payload lacks are treated as
/// absent rather than rejected; some monitors truncate them mid-session.
///
/// # Errors
///
/// Same conditions as [`parse_heart_rate`].
pub fn parse_measurement(payload: &[u8]) -> Result<HeartRateMeasurement, FormatError> {
    if payload.is_empty() {
        return Err(FormatError::Empty);
    }

    let mut buf = payload;
    let flags = buf.get_u8();

    let bpm = if flags & FLAG_BPM_U16 != 0 {
        if buf.remaining() < 2 {
            return Err(FormatError::Truncated {
                required: 3,
                actual: payload.len(),
            });
        }
        buf.get_u16_le()
    } else {
        if buf.remaining() < 1 {
            return Err(FormatError::Truncated {
                required: 2,
                actual: payload.len(),
            });
        }
        u16::from(buf.get_u8())
    };

    let sensor_contact = if flags & FLAG_CONTACT_SUPPORTED != 0 {
        Some(flags & FLAG_CONTACT_DETECTED != 0)
    } else {
        None
    };

    let energy_expended = if flags & FLAG_ENERGY_PRESENT != 0 && buf.remaining() >= 2 {
        Some(buf.get_u16_le())
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flags & FLAG_RR_PRESENT != 0 {
        while buf.remaining() >= 2 {
            // Multiply first so whole tick counts convert exactly
            let raw = u64::from(buf.get_u16_le());
            rr_intervals.push(Duration::from_nanos(raw * 1_000_000_000 / RR_TICKS_PER_SEC));
        }
    }

    Ok(HeartRateMeasurement {
        bpm,
        sensor_contact,
        energy_expended,
        rr_intervals,
    })
}

/// Decode a Battery Level (0x2A19) payload.
///
/// A single byte, `0..=100` percent. The reserved `0xFF` byte and any other
/// out-of-range value decode to [`BatteryLevel::Unknown`].
///
/// # Errors
///
/// [`FormatError::Empty`] for a zero-length payload.
pub fn parse_battery_level(payload: &[u8]) -> Result<BatteryLevel, FormatError> {
    if payload.is_empty() {
        return Err(FormatError::Empty);
    }
    Ok(BatteryLevel::from(payload[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_one_byte_bpm() {
        assert_eq!(parse_heart_rate(&[0x00, 0]), Ok(0));
        assert_eq!(parse_heart_rate(&[0x00, 1]), Ok(1));
        assert_eq!(parse_heart_rate(&[0x00, 72]), Ok(72));
        assert_eq!(parse_heart_rate(&[0x00, 255]), Ok(255));
    }

    #[test]
    fn test_parse_two_byte_bpm_little_endian() {
        assert_eq!(parse_heart_rate(&[0x01, 0x00, 0x00]), Ok(0));
        assert_eq!(parse_heart_rate(&[0x01, 0x2C, 0x01]), Ok(300));
        assert_eq!(parse_heart_rate(&[0x01, 0x00, 0x01]), Ok(256));
        assert_eq!(parse_heart_rate(&[0x01, 0xFF, 0xFF]), Ok(65535));
    }

    #[test]
    fn test_flags_select_width() {
        assert_eq!(parse_heart_rate(&[0x00, 0x48]), Ok(72));
        assert_eq!(parse_heart_rate(&[0x01, 0x48, 0x00]), Ok(72));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        assert_eq!(parse_heart_rate(&[0x00, 80, 0x34, 0x12]), Ok(80));
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(parse_heart_rate(&[]), Err(FormatError::Empty));
        assert_eq!(parse_measurement(&[]), Err(FormatError::Empty));
        assert_eq!(parse_battery_level(&[]), Err(FormatError::Empty));
    }

    #[test]
    fn test_truncated_payloads() {
        assert_eq!(
            parse_heart_rate(&[0x00]),
            Err(FormatError::Truncated {
                required: 2,
                actual: 1
            })
        );
        assert_eq!(
            parse_heart_rate(&[0x01]),
            Err(FormatError::Truncated {
                required: 3,
                actual: 1
            })
        );
        assert_eq!(
            parse_heart_rate(&[0x01, 0x05]),
            Err(FormatError::Truncated {
                required: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_full_measurement() {
        // u16 BPM, contact detected, energy, two RR intervals
        let flags =
            FLAG_BPM_U16 | FLAG_CONTACT_SUPPORTED | FLAG_CONTACT_DETECTED | FLAG_ENERGY_PRESENT
                | FLAG_RR_PRESENT;
        let payload = [flags, 0x48, 0x00, 0x34, 0x12, 0x00, 0x04, 0x00, 0x02];

        let measurement = parse_measurement(&payload).unwrap();
        assert_eq!(measurement.bpm, 72);
        assert_eq!(measurement.sensor_contact, Some(true));
        assert_eq!(measurement.energy_expended, Some(0x1234));
        assert_eq!(
            measurement.rr_intervals,
            vec![Duration::from_secs(1), Duration::from_millis(500)]
        );
    }

    #[test]
    fn test_sensor_contact_states() {
        let none = parse_measurement(&[0x00, 70]).unwrap();
        assert_eq!(none.sensor_contact, None);

        // Detected bit without the supported bit is meaningless
        let unsupported = parse_measurement(&[FLAG_CONTACT_DETECTED, 70]).unwrap();
        assert_eq!(unsupported.sensor_contact, None);

        let off_skin = parse_measurement(&[FLAG_CONTACT_SUPPORTED, 70]).unwrap();
        assert_eq!(off_skin.sensor_contact, Some(false));

        let on_skin =
            parse_measurement(&[FLAG_CONTACT_SUPPORTED | FLAG_CONTACT_DETECTED, 70]).unwrap();
        assert_eq!(on_skin.sensor_contact, Some(true));
    }

    #[test]
    fn test_measurement_with_missing_advertised_fields() {
        // Flags promise energy and RR but the payload stops after the BPM
        let measurement =
            parse_measurement(&[FLAG_ENERGY_PRESENT | FLAG_RR_PRESENT, 64]).unwrap();
        assert_eq!(measurement.bpm, 64);
        assert_eq!(measurement.energy_expended, None);
        assert!(measurement.rr_intervals.is_empty());
    }

    #[test]
    fn test_measurement_bpm_still_strict() {
        assert_eq!(
            parse_measurement(&[FLAG_BPM_U16, 0x05]),
            Err(FormatError::Truncated {
                required: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_battery_level() {
        assert_eq!(parse_battery_level(&[0]), Ok(BatteryLevel::Level(0)));
        assert_eq!(parse_battery_level(&[73]), Ok(BatteryLevel::Level(73)));
        assert_eq!(parse_battery_level(&[100]), Ok(BatteryLevel::Level(100)));
        assert_eq!(parse_battery_level(&[101]), Ok(BatteryLevel::Unknown));
        assert_eq!(parse_battery_level(&[0xFF]), Ok(BatteryLevel::Unknown));
    }
}
