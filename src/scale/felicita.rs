//! Felicita Arc dialect.
//!
//! The Arc pushes 18-byte frames on its single data characteristic: a sign
//! byte (`+`/`-`) at offset 2, six ASCII digits of weight in hundredths of
//! a gram at offsets 3–8, and a battery byte at offset 15 spanning roughly
//! 129 (empty) to 158 (full). Commands are single ASCII bytes; tare is
//! `T`.

use uuid::{uuid, Uuid};

use super::{ScaleAdapter, ScaleEvent};
use crate::classify::ScaleKind;

const SERVICE_UUID: Uuid = uuid!("0000ffe0-0000-1000-8000-00805f9b34fb");
const DATA_CHAR_UUID: Uuid = uuid!("0000ffe1-0000-1000-8000-00805f9b34fb");

const FRAME_LEN: usize = 18;
const CMD_TARE: u8 = 0x54;

const BATTERY_MIN: u8 = 129;
const BATTERY_MAX: u8 = 158;

/// Felicita Arc adapter.
#[derive(Debug, Default)]
pub struct FelicitaScale;

impl FelicitaScale {
    /// Create the adapter
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ScaleAdapter for FelicitaScale {
    fn kind(&self) -> ScaleKind {
        ScaleKind::Felicita
    }

    fn parse_notification(&mut self, uuid: Uuid, data: &[u8]) -> Vec<ScaleEvent> {
        if uuid != DATA_CHAR_UUID {
            return vec![];
        }
        if data.len() != FRAME_LEN {
            tracing::debug!(len = data.len(), "dropping malformed felicita frame");
            return vec![ScaleEvent::Ignored];
        }

        let sign = match data[2] {
            0x2B => 1.0,
            0x2D => -1.0,
            _ => return vec![ScaleEvent::Ignored],
        };

        let mut hundredths: i64 = 0;
        for &digit in &data[3..9] {
            if !digit.is_ascii_digit() {
                return vec![ScaleEvent::Ignored];
            }
            hundredths = hundredths * 10 + i64::from(digit - b'0');
        }

        let battery = battery_percent(data[15]);

        vec![
            ScaleEvent::Weight {
                grams: sign * hundredths as f64 / 100.0,
            },
            ScaleEvent::Battery { percent: battery },
        ]
    }

    fn tare_command(&self) -> (Uuid, Vec<u8>) {
        (DATA_CHAR_UUID, vec![CMD_TARE])
    }

    fn primary_service_uuid(&self) -> Uuid {
        SERVICE_UUID
    }

    fn subscription_uuids(&self) -> Vec<Uuid> {
        vec![DATA_CHAR_UUID]
    }
}

fn battery_percent(raw: u8) -> u8 {
    let clamped = raw.clamp(BATTERY_MIN, BATTERY_MAX);
    let span = u32::from(BATTERY_MAX - BATTERY_MIN);
    ((u32::from(clamped - BATTERY_MIN) * 100 + span / 2) / span) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sign: u8, digits: &[u8; 6], battery: u8) -> [u8; 18] {
        let mut data = [0u8; 18];
        data[2] = sign;
        data[3..9].copy_from_slice(digits);
        data[15] = battery;
        data
    }

    #[test]
    fn test_positive_weight() {
        let mut adapter = FelicitaScale::new();
        let events =
            adapter.parse_notification(DATA_CHAR_UUID, &frame(0x2B, b"003650", BATTERY_MAX));
        assert_eq!(events[0], ScaleEvent::Weight { grams: 36.5 });
        assert_eq!(events[1], ScaleEvent::Battery { percent: 100 });
    }

    #[test]
    fn test_negative_weight() {
        let mut adapter = FelicitaScale::new();
        let events =
            adapter.parse_notification(DATA_CHAR_UUID, &frame(0x2D, b"000120", BATTERY_MIN));
        assert_eq!(events[0], ScaleEvent::Weight { grams: -1.2 });
        assert_eq!(events[1], ScaleEvent::Battery { percent: 0 });
    }

    #[test]
    fn test_non_digit_payload_ignored() {
        let mut adapter = FelicitaScale::new();
        let events =
            adapter.parse_notification(DATA_CHAR_UUID, &frame(0x2B, b"00a650", BATTERY_MAX));
        assert_eq!(events, vec![ScaleEvent::Ignored]);
    }

    #[test]
    fn test_battery_midpoint() {
        let midpoint = BATTERY_MIN + (BATTERY_MAX - BATTERY_MIN) / 2;
        let percent = battery_percent(midpoint);
        assert!((45..=55).contains(&percent));
        assert_eq!(battery_percent(0), 0);
        assert_eq!(battery_percent(255), 100);
    }

    #[test]
    fn test_tare_is_single_ascii_t() {
        let (uuid, bytes) = FelicitaScale::new().tare_command();
        assert_eq!(uuid, DATA_CHAR_UUID);
        assert_eq!(bytes, vec![b'T']);
    }
}
