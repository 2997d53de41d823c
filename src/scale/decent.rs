//! Decent Scale dialect.
//!
//! The Decent Scale frames everything as `03 <type> <payload> <xor>`,
//! seven bytes on firmware < 1.2 and ten bytes after, with the checksum
//! always the XOR of every preceding byte. Weight frames (type `0xCE`
//! settled, `0xCA` in motion) carry a signed 16-bit big-endian value in
//! tenths of a gram. Button frames are type `0xAA`.

use uuid::{uuid, Uuid};

use super::{ScaleAdapter, ScaleEvent};
use crate::classify::ScaleKind;

const SERVICE_UUID: Uuid = uuid!("0000fff0-0000-1000-8000-00805f9b34fb");
const READ_CHAR_UUID: Uuid = uuid!("0000fff4-0000-1000-8000-00805f9b34fb");
const WRITE_CHAR_UUID: Uuid = uuid!("000036f5-0000-1000-8000-00805f9b34fb");

const TYPE_WEIGHT_SETTLED: u8 = 0xCE;
const TYPE_WEIGHT_MOVING: u8 = 0xCA;
const TYPE_BUTTON: u8 = 0xAA;

/// Decent Scale adapter.
#[derive(Debug, Default)]
pub struct DecentScale;

impl DecentScale {
    /// Create the adapter
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &byte| acc ^ byte)
}

impl ScaleAdapter for DecentScale {
    fn kind(&self) -> ScaleKind {
        ScaleKind::Decent
    }

    fn parse_notification(&mut self, uuid: Uuid, data: &[u8]) -> Vec<ScaleEvent> {
        if uuid != READ_CHAR_UUID {
            return vec![];
        }
        // 7-byte frames pre-1.2 firmware, 10-byte after; both end in XOR.
        if !(data.len() == 7 || data.len() == 10) || data[0] != 0x03 {
            tracing::debug!(len = data.len(), "dropping malformed decent frame");
            return vec![ScaleEvent::Ignored];
        }
        let last = data.len() - 1;
        if xor_checksum(&data[..last]) != data[last] {
            tracing::debug!("decent frame failed checksum");
            return vec![ScaleEvent::Ignored];
        }

        match data[1] {
            TYPE_WEIGHT_SETTLED | TYPE_WEIGHT_MOVING => {
                let raw = i16::from_be_bytes([data[2], data[3]]);
                vec![ScaleEvent::Weight {
                    grams: f64::from(raw) / 10.0,
                }]
            }
            TYPE_BUTTON => vec![ScaleEvent::Button { id: data[2] }],
            _ => vec![ScaleEvent::Ignored],
        }
    }

    fn tare_command(&self) -> (Uuid, Vec<u8>) {
        let mut command = vec![0x03, 0x0F, 0x00, 0x00, 0x00];
        command.push(xor_checksum(&command));
        (WRITE_CHAR_UUID, command)
    }

    fn primary_service_uuid(&self) -> Uuid {
        SERVICE_UUID
    }

    fn subscription_uuids(&self) -> Vec<Uuid> {
        vec![READ_CHAR_UUID]
    }
}
