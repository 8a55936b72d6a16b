//! Decoding of the standard GATT heart rate and battery payloads.
//!
//! Heart Rate Measurement (0x2A37) layout:
//! - byte 0: flags (bit 0 = 16-bit bpm, bit 3 = energy expended present,
//!   bit 4 = RR intervals present)
//! - bpm as u8 or little-endian u16
//! - optional u16 energy expended (kJ)
//! - zero or more u16 RR intervals in 1/1024 s

use std::time::Duration;

const FLAG_HR_16BIT: u8 = 0x01;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    pub energy_expended: Option<u16>,
    pub rr_intervals: Vec<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasurementError {
    Empty,
    Truncated { needed: usize, got: usize },
}

impl std::fmt::Display for MeasurementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementError::Empty => write!(f, "empty heart rate payload"),
            MeasurementError::Truncated { needed, got } => {
                write!(f, "heart rate payload truncated: need {} bytes, got {}", needed, got)
            }
        }
    }
}

impl std::error::Error for MeasurementError {}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, MeasurementError> {
    match data.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
        None => Err(MeasurementError::Truncated {
            needed: offset + 2,
            got: data.len(),
        }),
    }
}

impl HeartRateMeasurement {
    pub fn parse(data: &[u8]) -> Result<Self, MeasurementError> {
        let flags = *data.first().ok_or(MeasurementError::Empty)?;
        let mut offset = 1;

        let bpm = if flags & FLAG_HR_16BIT != 0 {
            let value = read_u16(data, offset)?;
            offset += 2;
            value
        } else {
            let value = *data.get(offset).ok_or(MeasurementError::Truncated {
                needed: offset + 1,
                got: data.len(),
            })?;
            offset += 1;
            value as u16
        };

        let energy_expended = if flags & FLAG_ENERGY_EXPENDED != 0 {
            let value = read_u16(data, offset)?;
            offset += 2;
            Some(value)
        } else {
            None
        };

        let mut rr_intervals = Vec::new();
        if flags & FLAG_RR_INTERVALS != 0 {
            // A trailing odd byte is ignored
            while offset + 2 <= data.len() {
                let raw = read_u16(data, offset)?;
                rr_intervals.push(Duration::from_micros(raw as u64 * 1_000_000 / 1024));
                offset += 2;
            }
        }

        Ok(Self {
            bpm,
            energy_expended,
            rr_intervals,
        })
    }
}

/// Battery Level (0x2A19) is a single percentage byte
pub fn parse_battery_level(data: &[u8]) -> Option<u8> {
    data.first().map(|level| (*level).min(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eight_bit_bpm() {
        let hr = HeartRateMeasurement::parse(&[0x00, 72]).unwrap();
        assert_eq!(hr.bpm, 72);
        assert!(hr.energy_expended.is_none());
        assert!(hr.rr_intervals.is_empty());
    }

    #[test]
    fn test_sixteen_bit_bpm() {
        let hr = HeartRateMeasurement::parse(&[0x01, 0x2c, 0x01]).unwrap();
        assert_eq!(hr.bpm, 300);
    }

    #[test]
    fn test_rr_intervals_and_energy() {
        // flags: energy + rr, bpm 60, energy 10 kJ, rr 1024 and 512
        let data = [0x18, 60, 0x0a, 0x00, 0x00, 0x04, 0x00, 0x02];
        let hr = HeartRateMeasurement::parse(&data).unwrap();
        assert_eq!(hr.bpm, 60);
        assert_eq!(hr.energy_expended, Some(10));
        assert_eq!(
            hr.rr_intervals,
            vec![Duration::from_secs(1), Duration::from_millis(500)]
        );
    }

    #[test]
    fn test_truncated_payloads() {
        assert_eq!(HeartRateMeasurement::parse(&[]), Err(MeasurementError::Empty));
        assert!(matches!(
            HeartRateMeasurement::parse(&[0x01, 0x40]),
            Err(MeasurementError::Truncated { needed: 3, got: 2 })
        ));
        assert!(HeartRateMeasurement::parse(&[0x08, 70, 0x01]).is_err());
    }

    #[test]
    fn test_battery_level() {
        assert_eq!(parse_battery_level(&[87]), Some(87));
        assert_eq!(parse_battery_level(&[250]), Some(100));
        assert_eq!(parse_battery_level(&[]), None);
    }
}
