//! Bookoo Themis scale dialect.
//!
//! The Themis streams a fixed 20-byte frame on its weight characteristic:
//! header `03 0B`, a 3-byte millisecond timer, signed weight and flow
//! (ASCII `+`/`-` sign byte followed by a big-endian magnitude in
//! centigrams), a battery percentage, and a trailing XOR checksum over the
//! preceding 19 bytes. Commands are 6-byte frames with the same checksum
//! rule.

use uuid::{uuid, Uuid};

use super::{ScaleAdapter, ScaleEvent};
use crate::classify::ScaleKind;

const SERVICE_UUID: Uuid = uuid!("00000ffe-0000-1000-8000-00805f9b34fb");
const WEIGHT_CHAR_UUID: Uuid = uuid!("0000ff11-0000-1000-8000-00805f9b34fb");
const COMMAND_CHAR_UUID: Uuid = uuid!("0000ff12-0000-1000-8000-00805f9b34fb");

const TARE_COMMAND: [u8; 6] = [0x03, 0x0A, 0x01, 0x00, 0x00, 0x08];

const FRAME_LEN: usize = 20;
const SIGN_PLUS: u8 = 0x2B;

/// Bookoo Themis adapter.
#[derive(Debug, Default)]
pub struct BookooScale;

impl BookooScale {
    /// Create the adapter
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &byte| acc ^ byte)
}

impl ScaleAdapter for BookooScale {
    fn kind(&self) -> ScaleKind {
        ScaleKind::Bookoo
    }

    fn parse_notification(&mut self, uuid: Uuid, data: &[u8]) -> Vec<ScaleEvent> {
        if uuid != WEIGHT_CHAR_UUID {
            return vec![];
        }
        if data.len() != FRAME_LEN || data[0] != 0x03 || data[1] != 0x0B {
            tracing::debug!(len = data.len(), "dropping malformed bookoo frame");
            return vec![ScaleEvent::Ignored];
        }
        if xor_checksum(&data[..FRAME_LEN - 1]) != data[FRAME_LEN - 1] {
            tracing::debug!("bookoo frame failed checksum");
            return vec![ScaleEvent::Ignored];
        }

        let weight_sign = if data[6] == SIGN_PLUS { 1.0 } else { -1.0 };
        let weight_raw =
            (u32::from(data[7]) << 16) | (u32::from(data[8]) << 8) | u32::from(data[9]);
        let grams = f64::from(weight_raw) / 100.0 * weight_sign;

        let flow_sign = if data[10] == SIGN_PLUS { 1.0 } else { -1.0 };
        let flow_raw = (u16::from(data[11]) << 8) | u16::from(data[12]);
        let grams_per_s = f64::from(flow_raw) / 100.0 * flow_sign;

        vec![
            ScaleEvent::Weight { grams },
            ScaleEvent::Flow { grams_per_s },
            ScaleEvent::Battery {
                percent: data[13].min(100),
            },
        ]
    }

    fn tare_command(&self) -> (Uuid, Vec<u8>) {
        (COMMAND_CHAR_UUID, TARE_COMMAND.to_vec())
    }

    fn primary_service_uuid(&self) -> Uuid {
        SERVICE_UUID
    }

    fn subscription_uuids(&self) -> Vec<Uuid> {
        vec![WEIGHT_CHAR_UUID]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(weight_cg: u32, flow_cg_s: u16, battery: u8) -> [u8; 20] {
        let mut data = [0u8; 20];
        data[0] = 0x03;
        data[1] = 0x0B;
        data[6] = SIGN_PLUS;
        data[7] = ((weight_cg >> 16) & 0xFF) as u8;
        data[8] = ((weight_cg >> 8) & 0xFF) as u8;
        data[9] = (weight_cg & 0xFF) as u8;
        data[10] = SIGN_PLUS;
        data[11] = (flow_cg_s >> 8) as u8;
        data[12] = (flow_cg_s & 0xFF) as u8;
        data[13] = battery;
        data[19] = xor_checksum(&data[..19]);
        data
    }

    #[test]
    fn test_parse_weight_flow_battery() {
        let mut adapter = BookooScale::new();
        let events = adapter.parse_notification(WEIGHT_CHAR_UUID, &frame(1850, 210, 87));
        assert_eq!(
            events,
            vec![
                ScaleEvent::Weight { grams: 18.5 },
                ScaleEvent::Flow { grams_per_s: 2.1 },
                ScaleEvent::Battery { percent: 87 },
            ]
        );
    }

    #[test]
    fn test_negative_weight_sign() {
        let mut adapter = BookooScale::new();
        let mut data = frame(250, 0, 50);
        data[6] = 0x2D;
        data[19] = xor_checksum(&data[..19]);
        let events = adapter.parse_notification(WEIGHT_CHAR_UUID, &data);
        assert_eq!(events[0], ScaleEvent::Weight { grams: -2.5 });
    }

    #[test]
    fn test_checksum_failure_is_ignored() {
        let mut adapter = BookooScale::new();
        let mut data = frame(1000, 0, 50);
        data[19] ^= 0xFF;
        assert_eq!(
            adapter.parse_notification(WEIGHT_CHAR_UUID, &data),
            vec![ScaleEvent::Ignored]
        );
    }

    #[test]
    fn test_wrong_characteristic_yields_nothing() {
        let mut adapter = BookooScale::new();
        assert!(adapter
            .parse_notification(COMMAND_CHAR_UUID, &frame(100, 0, 50))
            .is_empty());
    }

    #[test]
    fn test_tare_command_checksum() {
        let (uuid, bytes) = BookooScale::new().tare_command();
        assert_eq!(uuid, COMMAND_CHAR_UUID);
        assert_eq!(bytes, vec![0x03, 0x0A, 0x01, 0x00, 0x00, 0x08]);
        assert_eq!(xor_checksum(&bytes[..5]), bytes[5]);
    }
}
