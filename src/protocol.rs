//! DE1 wire protocol: characteristic map, payload parsers, frame builders.
//!
//! The DE1 exposes one GATT service whose characteristics each carry a
//! fixed binary layout. This module owns those layouts end to end: raw
//! notification bytes in, typed messages out, and typed commands in, raw
//! write payloads out. The UUID table is the protocol contract; the
//! constants below must match the firmware exactly.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::{uuid, Uuid};

use crate::codec;
use crate::error::{BridgeError, Result};

/// The DE1 GATT service UUID advertised by every machine revision.
pub const DE1_SERVICE_UUID: Uuid = uuid!("0000a000-0000-1000-8000-00805f9b34fb");

/// DE1 characteristic UUIDs, one constant per slot the bridge touches.
pub mod characteristic {
    use super::{uuid, Uuid};

    /// Firmware version block (read).
    pub const VERSION: Uuid = uuid!("0000a001-0000-1000-8000-00805f9b34fb");
    /// One-byte state request (write).
    pub const REQUESTED_STATE: Uuid = uuid!("0000a002-0000-1000-8000-00805f9b34fb");
    /// Memory-mapped register read requests; replies arrive as
    /// notifications on this same characteristic.
    pub const READ_FROM_MMR: Uuid = uuid!("0000a005-0000-1000-8000-00805f9b34fb");
    /// Memory-mapped register writes.
    pub const WRITE_TO_MMR: Uuid = uuid!("0000a006-0000-1000-8000-00805f9b34fb");
    /// Boiler temperature block (notify only; body not parsed here).
    pub const TEMPERATURES: Uuid = uuid!("0000a00a-0000-1000-8000-00805f9b34fb");
    /// Steam / hot-water / shot targets, 9 bytes (read/notify/write).
    pub const SHOT_SETTINGS: Uuid = uuid!("0000a00b-0000-1000-8000-00805f9b34fb");
    /// Real-time shot telemetry (notify).
    pub const SHOT_SAMPLE: Uuid = uuid!("0000a00d-0000-1000-8000-00805f9b34fb");
    /// Machine state + substate (read/notify).
    pub const STATE_INFO: Uuid = uuid!("0000a00e-0000-1000-8000-00805f9b34fb");
    /// Profile header write, 20 bytes.
    pub const HEADER_WRITE: Uuid = uuid!("0000a00f-0000-1000-8000-00805f9b34fb");
    /// Profile frame write, 8 bytes each.
    pub const FRAME_WRITE: Uuid = uuid!("0000a010-0000-1000-8000-00805f9b34fb");
    /// Tank water level, current + start, u16 BE millimetres.
    pub const WATER_LEVELS: Uuid = uuid!("0000a011-0000-1000-8000-00805f9b34fb");
}

/// Memory-mapped register addresses the bridge touches.
pub mod mmr {
    /// Fan activation threshold in °C; 4-byte body, byte 0 meaningful.
    pub const FAN_THRESHOLD: u32 = 0x80_3808;
    /// Group head controller presence; nonzero low byte means installed.
    pub const GHC_INFO: u32 = 0x80_381C;
    /// USB charger enable; 4-byte body, byte 0 meaningful.
    pub const USB_CHARGER: u32 = 0x80_3834;
}

/// Machine states as enumerated by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum State {
    /// Deep sleep, heaters off
    Sleep = 0x00,
    /// Transitioning into sleep
    GoingToSleep = 0x01,
    /// Awake and heated, waiting for a command
    Idle = 0x02,
    /// Processing a request
    Busy = 0x03,
    /// Pulling a shot
    Espresso = 0x04,
    /// Steaming milk
    Steam = 0x05,
    /// Dispensing hot water
    HotWater = 0x06,
    /// Short calibration cycle
    ShortCal = 0x07,
    /// Self test
    SelfTest = 0x08,
    /// Long calibration cycle
    LongCal = 0x09,
    /// Descale cycle
    Descale = 0x0A,
    /// Unrecoverable firmware fault
    FatalError = 0x0B,
    /// Booting
    Init = 0x0C,
    /// No request pending
    NoRequest = 0x0D,
    /// Skip to the next profile frame
    SkipToNext = 0x0E,
    /// Group head rinse (flush)
    HotWaterRinse = 0x0F,
    /// Steam wand rinse
    SteamRinse = 0x10,
    /// Tank refill
    Refill = 0x11,
    /// Clean cycle
    Clean = 0x12,
    /// Bootloader active
    InBootloader = 0x13,
    /// Air purge
    AirPurge = 0x14,
    /// Scheduled idle
    SchedIdle = 0x15,
    /// Reserved by firmware
    Reserved = 0x16,
    /// Sentinel: leave the current state unchanged
    NoChange = 0xFF,
}

impl State {
    /// Convert from the firmware byte
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Sleep),
            0x01 => Some(Self::GoingToSleep),
            0x02 => Some(Self::Idle),
            0x03 => Some(Self::Busy),
            0x04 => Some(Self::Espresso),
            0x05 => Some(Self::Steam),
            0x06 => Some(Self::HotWater),
            0x07 => Some(Self::ShortCal),
            0x08 => Some(Self::SelfTest),
            0x09 => Some(Self::LongCal),
            0x0A => Some(Self::Descale),
            0x0B => Some(Self::FatalError),
            0x0C => Some(Self::Init),
            0x0D => Some(Self::NoRequest),
            0x0E => Some(Self::SkipToNext),
            0x0F => Some(Self::HotWaterRinse),
            0x10 => Some(Self::SteamRinse),
            0x11 => Some(Self::Refill),
            0x12 => Some(Self::Clean),
            0x13 => Some(Self::InBootloader),
            0x14 => Some(Self::AirPurge),
            0x15 => Some(Self::SchedIdle),
            0x16 => Some(Self::Reserved),
            0xFF => Some(Self::NoChange),
            _ => None,
        }
    }

    /// Resolve a user-facing state alias, as accepted by the REST surface.
    ///
    /// Only a subset of states is user-addressable; anything else returns
    /// `None` and the caller answers 400.
    #[must_use]
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias.to_lowercase().as_str() {
            "sleep" => Some(Self::Sleep),
            "idle" => Some(Self::Idle),
            "espresso" => Some(Self::Espresso),
            "steam" => Some(Self::Steam),
            "hotwater" => Some(Self::HotWater),
            "flush" => Some(Self::HotWaterRinse),
            "descale" => Some(Self::Descale),
            "clean" => Some(Self::Clean),
            _ => None,
        }
    }

    /// Human-readable state name used in JSON payloads
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sleep => "Sleep",
            Self::GoingToSleep => "GoingToSleep",
            Self::Idle => "Idle",
            Self::Busy => "Busy",
            Self::Espresso => "Espresso",
            Self::Steam => "Steam",
            Self::HotWater => "HotWater",
            Self::ShortCal => "ShortCal",
            Self::SelfTest => "SelfTest",
            Self::LongCal => "LongCal",
            Self::Descale => "Descale",
            Self::FatalError => "FatalError",
            Self::Init => "Init",
            Self::NoRequest => "NoRequest",
            Self::SkipToNext => "SkipToNext",
            Self::HotWaterRinse => "HotWaterRinse",
            Self::SteamRinse => "SteamRinse",
            Self::Refill => "Refill",
            Self::Clean => "Clean",
            Self::InBootloader => "InBootloader",
            Self::AirPurge => "AirPurge",
            Self::SchedIdle => "SchedIdle",
            Self::Reserved => "Reserved",
            Self::NoChange => "NoChange",
        }
    }
}

/// Machine substates. Unknown values pass through as raw integers rather
/// than failing the state parse; firmware revisions add substates freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubState {
    /// No activity
    Ready,
    /// Heating the water tank
    Heating,
    /// Heating the group head
    FinalHeating,
    /// Stabilising the mix temperature
    Stabilising,
    /// Pre-infusion phase of a shot
    PreInfusing,
    /// Main pour
    Pouring,
    /// Winding down a pour
    Ending,
    /// Producing steam
    Steaming,
    /// Waiting for a tank refill
    Refill,
    /// A substate this build does not know by name
    Other(u8),
}

impl SubState {
    /// Convert from the firmware byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::Ready,
            0x01 => Self::Heating,
            0x02 => Self::FinalHeating,
            0x03 => Self::Stabilising,
            0x04 => Self::PreInfusing,
            0x05 => Self::Pouring,
            0x06 => Self::Ending,
            0x07 => Self::Steaming,
            0x11 => Self::Refill,
            other => Self::Other(other),
        }
    }

    /// Human-readable substate name used in JSON payloads
    #[must_use]
    pub fn as_str(self) -> String {
        match self {
            Self::Ready => "Ready".to_string(),
            Self::Heating => "Heating".to_string(),
            Self::FinalHeating => "FinalHeating".to_string(),
            Self::Stabilising => "Stabilising".to_string(),
            Self::PreInfusing => "PreInfusing".to_string(),
            Self::Pouring => "Pouring".to_string(),
            Self::Ending => "Ending".to_string(),
            Self::Steaming => "Steaming".to_string(),
            Self::Refill => "Refill".to_string(),
            Self::Other(code) => format!("{code}"),
        }
    }
}

/// One decoded SHOT_SAMPLE notification.
///
/// Field layout per the firmware: timer in 0.01 s units, pressures and
/// flows U8P4, mix temperatures U8P1, head temperatures U8P4 with a
/// +73 °C bias, steam temperature a plain byte in °C. Bytes past offset
/// 12 are newer-firmware extensions and are preserved raw in `tail`.
#[derive(Debug, Clone, PartialEq)]
pub struct ShotSample {
    /// Shot clock in seconds
    pub timer_s: f64,
    /// Measured group pressure, bar
    pub group_pressure: f64,
    /// Measured group flow, ml/s
    pub group_flow: f64,
    /// Measured mix temperature, °C
    pub mix_temp: f64,
    /// Measured group-head temperature, °C
    pub head_temp: f64,
    /// Target mix temperature, °C
    pub set_mix_temp: f64,
    /// Target group-head temperature, °C
    pub set_head_temp: f64,
    /// Target pressure, bar
    pub set_pressure: f64,
    /// Target flow, ml/s
    pub set_flow: f64,
    /// Profile frame currently executing
    pub frame_number: u8,
    /// Steam heater temperature, °C
    pub steam_temp: f64,
    /// Undecoded trailing bytes, kept verbatim
    pub tail: Vec<u8>,
}

/// Additive bias applied to head-temperature bytes after U8P4 scaling.
pub const HEAD_TEMP_BIAS_C: f64 = 73.0;

/// Parse a STATE_INFO payload into `(state, substate)`.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] below two bytes and
/// [`BridgeError::BadEncoding`] for a state byte the firmware enumeration
/// does not contain.
pub fn parse_state_info(data: &[u8]) -> Result<(State, SubState)> {
    if data.len() < 2 {
        return Err(BridgeError::ShortBuffer {
            needed: 2,
            got: data.len(),
        });
    }
    let state = State::from_u8(data[0])
        .ok_or_else(|| BridgeError::BadEncoding(format!("unknown state byte {:#04x}", data[0])))?;
    Ok((state, SubState::from_u8(data[1])))
}

/// Parse a SHOT_SAMPLE payload.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] if the payload does not cover the
/// twelve decoded bytes.
pub fn parse_shot_sample(data: &[u8]) -> Result<ShotSample> {
    if data.len() < 12 {
        return Err(BridgeError::ShortBuffer {
            needed: 12,
            got: data.len(),
        });
    }

    let (timer_raw, _) = codec::read_u16_be(data, 0)?;

    Ok(ShotSample {
        timer_s: f64::from(timer_raw) / 100.0,
        group_pressure: codec::decode_u8p4(data[2]),
        group_flow: codec::decode_u8p4(data[3]),
        mix_temp: codec::decode_u8p1(data[4]),
        head_temp: codec::decode_u8p4(data[5]) + HEAD_TEMP_BIAS_C,
        set_mix_temp: codec::decode_u8p1(data[6]),
        set_head_temp: codec::decode_u8p4(data[7]) + HEAD_TEMP_BIAS_C,
        set_pressure: codec::decode_u8p4(data[8]),
        set_flow: codec::decode_u8p4(data[9]),
        frame_number: data[10],
        steam_temp: codec::decode_u8p0(data[11]),
        tail: data[12..].to_vec(),
    })
}

/// Tank water levels in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaterLevels {
    /// Current level
    pub current_mm: u16,
    /// Level recorded when the shot started
    pub start_mm: u16,
}

/// Parse a WATER_LEVELS payload: u16 BE current, u16 BE start.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] below four bytes.
pub fn parse_water_levels(data: &[u8]) -> Result<WaterLevels> {
    let (current_mm, off) = codec::read_u16_be(data, 0)?;
    let (start_mm, _) = codec::read_u16_be(data, off)?;
    Ok(WaterLevels {
        current_mm,
        start_mm,
    })
}

/// Decoded VERSION characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// BLE API level
    pub api: u8,
    /// Firmware major version
    pub major: u8,
    /// Firmware minor version
    pub minor: u8,
    /// Firmware build number
    pub build: u32,
}

impl Version {
    /// Render as the `major.minor` string the REST surface reports
    #[must_use]
    pub fn firmware_string(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

/// Parse the VERSION characteristic.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] below seven bytes.
pub fn parse_version(data: &[u8]) -> Result<Version> {
    if data.len() < 7 {
        return Err(BridgeError::ShortBuffer {
            needed: 7,
            got: data.len(),
        });
    }
    let (build, _) = codec::read_u32_be(data, 3)?;
    Ok(Version {
        api: data[0],
        major: data[1],
        minor: data[2],
        build,
    })
}

/// Steam, hot-water, and shot targets carried by the 9-byte SHOT_SETTINGS
/// characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShotSettings {
    /// Steam mode selector
    pub steam_setting: u8,
    /// Steam target temperature, °C
    pub target_steam_temp: u8,
    /// Steam duration, seconds
    pub target_steam_duration: u8,
    /// Hot-water target temperature, °C
    pub target_hot_water_temp: u8,
    /// Hot-water volume, ml
    pub target_hot_water_volume: u8,
    /// Hot-water duration, seconds
    pub target_hot_water_duration: u8,
    /// Shot volume, ml
    pub target_shot_volume: u8,
    /// Group target temperature, °C (U16P8 on the wire)
    pub group_temp: f64,
}

impl Default for ShotSettings {
    fn default() -> Self {
        Self {
            steam_setting: 0,
            target_steam_temp: 150,
            target_steam_duration: 30,
            target_hot_water_temp: 85,
            target_hot_water_volume: 100,
            target_hot_water_duration: 30,
            target_shot_volume: 0,
            group_temp: 93.0,
        }
    }
}

/// Parse a SHOT_SETTINGS payload.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] below nine bytes.
pub fn parse_shot_settings(data: &[u8]) -> Result<ShotSettings> {
    if data.len() < 9 {
        return Err(BridgeError::ShortBuffer {
            needed: 9,
            got: data.len(),
        });
    }
    let (group_raw, _) = codec::read_u16_be(data, 7)?;
    Ok(ShotSettings {
        steam_setting: data[0],
        target_steam_temp: data[1],
        target_steam_duration: data[2],
        target_hot_water_temp: data[3],
        target_hot_water_volume: data[4],
        target_hot_water_duration: data[5],
        target_shot_volume: data[6],
        group_temp: codec::decode_u16p8(group_raw),
    })
}

/// Build the 9-byte SHOT_SETTINGS write payload. Deterministic: identical
/// settings always produce identical bytes.
#[must_use]
pub fn shot_settings_payload(settings: &ShotSettings) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(settings.steam_setting);
    buf.put_u8(settings.target_steam_temp);
    buf.put_u8(settings.target_steam_duration);
    buf.put_u8(settings.target_hot_water_temp);
    buf.put_u8(settings.target_hot_water_volume);
    buf.put_u8(settings.target_hot_water_duration);
    buf.put_u8(settings.target_shot_volume);
    buf.put_u16(codec::encode_u16p8(settings.group_temp));
    buf.to_vec()
}

/// Build the one-byte REQUESTED_STATE payload.
#[must_use]
pub const fn state_request(state: State) -> [u8; 1] {
    [state as u8]
}

/// Build a READ_FROM_MMR request for one 32-bit word at `address`.
#[must_use]
pub fn mmr_read_request(address: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(4);
    buf.put_slice(&codec::u24_be_bytes(address));
    buf.to_vec()
}

/// Build a WRITE_TO_MMR request: `[len][u24 address][body]` with the length
/// byte counting the body only.
#[must_use]
pub fn mmr_write_request(address: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u8(body.len() as u8);
    buf.put_slice(&codec::u24_be_bytes(address));
    buf.put_slice(body);
    buf.to_vec()
}

/// Build the 4-byte MMR body for the fan threshold.
#[must_use]
pub const fn fan_threshold_body(celsius: u8) -> [u8; 4] {
    [celsius, 0, 0, 0]
}

/// Build the 4-byte MMR body for the USB charger toggle.
#[must_use]
pub const fn usb_charger_body(enabled: bool) -> [u8; 4] {
    [enabled as u8, 0, 0, 0]
}

/// A reply delivered by notification on READ_FROM_MMR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmrRead {
    /// Register address the data came from
    pub address: u32,
    /// Register contents
    pub data: Vec<u8>,
}

/// Parse an MMR read reply: `[len][u24 address][data…]`.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] if the header does not fit.
pub fn parse_mmr_read(data: &[u8]) -> Result<MmrRead> {
    let (address, off) = codec::read_u24_be(data, 1)?;
    Ok(MmrRead {
        address,
        data: data[off..].to_vec(),
    })
}

/// How a profile step drives the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpMode {
    /// Hold the target pressure
    Pressure,
    /// Hold the target flow
    Flow,
}

/// How a profile step transitions from its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    /// Interpolate from the previous value
    Smooth,
    /// Jump straight to the target
    Fast,
}

impl Transition {
    const fn fast() -> Self {
        Self::Fast
    }
}

/// One step of a brew profile, as supplied in the upload document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStep {
    /// Pump control mode
    pub pump: PumpMode,
    /// Transition style
    #[serde(default = "Transition::fast")]
    pub transition: Transition,
    /// Target pressure, bar (used when `pump` is pressure)
    #[serde(default)]
    pub pressure: f64,
    /// Target flow, ml/s (used when `pump` is flow)
    #[serde(default)]
    pub flow: f64,
    /// Water temperature, °C
    #[serde(default = "ProfileStep::default_temperature")]
    pub temperature: f64,
    /// Step duration, seconds
    #[serde(default)]
    pub seconds: f64,
    /// Optional early-exit condition
    #[serde(default)]
    pub exit: Option<ExitCondition>,
}

impl ProfileStep {
    const fn default_temperature() -> f64 {
        93.0
    }
}

/// Early-exit trigger for a profile step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCondition {
    /// Trigger kind, e.g. `pressure_above`
    pub kind: String,
    /// Trigger threshold in the kind's native unit
    pub value: f64,
}

/// A brew profile as uploaded over the REST surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Display title; not sent to the machine
    #[serde(default)]
    pub title: Option<String>,
    /// Stop-at volume in ml
    #[serde(default)]
    pub target_volume: Option<f64>,
    /// Stop-at weight in grams (requires a scale; not encoded in frames)
    #[serde(default)]
    pub target_weight: Option<f64>,
    /// Ordered steps
    pub steps: Vec<ProfileStep>,
}

/// Frame flag: pump is flow-controlled.
pub const FRAME_FLAG_CTRL_F: u8 = 0x20;
/// Frame flag: interpolate from the previous frame.
pub const FRAME_FLAG_INTERPOLATE: u8 = 0x10;

/// Build the 20-byte profile header.
///
/// # Errors
///
/// Returns [`BridgeError::BadRequest`] for an empty profile or one with
/// more steps than a u8 frame count can carry.
pub fn profile_header(profile: &Profile) -> Result<[u8; 20]> {
    if profile.steps.is_empty() {
        return Err(BridgeError::BadRequest("profile has no steps".to_string()));
    }
    let frame_count = u8::try_from(profile.steps.len())
        .map_err(|_| BridgeError::BadRequest("profile has too many steps".to_string()))?;

    let mut header = [0u8; 20];
    header[0] = 1;
    header[1] = frame_count;
    let volume = codec::encode_u10p0(profile.target_volume.unwrap_or(0.0));
    header[2] = (volume >> 8) as u8;
    header[3] = (volume & 0xFF) as u8;
    Ok(header)
}

/// Build one 8-byte profile frame.
#[must_use]
pub fn profile_frame(index: u8, step: &ProfileStep) -> [u8; 8] {
    let mut flags = 0u8;
    if step.pump == PumpMode::Flow {
        flags |= FRAME_FLAG_CTRL_F;
    }
    if step.transition == Transition::Smooth {
        flags |= FRAME_FLAG_INTERPOLATE;
    }

    let (exit_type, exit_value) = step.exit.as_ref().map_or((0, 0), encode_exit);

    [
        index,
        flags,
        codec::encode_u8p4(step.pressure),
        codec::encode_u8p4(step.flow),
        codec::encode_u8p1(step.temperature),
        codec::encode_f8_1_7(step.seconds),
        exit_type,
        exit_value,
    ]
}

// Unknown trigger kinds degrade to "no exit" rather than failing the
// upload; the machine then runs the frame to its full duration.
fn encode_exit(exit: &ExitCondition) -> (u8, u8) {
    let exit_type = match exit.kind.as_str() {
        "pressure_above" => 1,
        "pressure_below" => 2,
        "flow_above" => 3,
        "flow_below" => 4,
        _ => return (0, 0),
    };
    (exit_type, codec::encode_u8p4(exit.value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shot_sample_golden_vector() {
        let data = [
            0x00, 0x64, 0x50, 0x20, 0xA4, 0x3C, 0x00, 0x00, 0x48, 0x18, 0x02, 0x5E, 0x00, 0x00,
            0x00,
        ];
        let sample = parse_shot_sample(&data).unwrap();

        assert!((sample.timer_s - 1.0).abs() < f64::EPSILON);
        assert!((sample.group_pressure - 5.0).abs() < f64::EPSILON);
        assert!((sample.group_flow - 2.0).abs() < f64::EPSILON);
        assert!((sample.mix_temp - 82.0).abs() < f64::EPSILON);
        assert!((sample.head_temp - 76.75).abs() < f64::EPSILON);
        assert!((sample.set_pressure - 4.5).abs() < f64::EPSILON);
        assert!((sample.set_flow - 1.5).abs() < f64::EPSILON);
        assert_eq!(sample.frame_number, 2);
        assert!((sample.steam_temp - 94.0).abs() < f64::EPSILON);
        assert_eq!(sample.tail, vec![0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_shot_sample_too_short() {
        assert!(matches!(
            parse_shot_sample(&[0x00; 11]),
            Err(BridgeError::ShortBuffer { needed: 12, .. })
        ));
    }

    #[test]
    fn test_water_levels_golden_vector() {
        let levels = parse_water_levels(&[0x00, 0x32, 0x00, 0x5A]).unwrap();
        assert_eq!(levels.current_mm, 50);
        assert_eq!(levels.start_mm, 90);
    }

    #[test]
    fn test_state_info_parse() {
        let (state, substate) = parse_state_info(&[0x04, 0x05]).unwrap();
        assert_eq!(state, State::Espresso);
        assert_eq!(substate, SubState::Pouring);

        let (_, unknown) = parse_state_info(&[0x02, 0x42]).unwrap();
        assert_eq!(unknown, SubState::Other(0x42));
        assert_eq!(unknown.as_str(), "66");
    }

    #[test]
    fn test_state_info_rejects_garbage_state() {
        assert!(matches!(
            parse_state_info(&[0x42, 0x00]),
            Err(BridgeError::BadEncoding(_))
        ));
    }

    #[test]
    fn test_state_aliases() {
        assert_eq!(State::from_alias("espresso"), Some(State::Espresso));
        assert_eq!(State::from_alias("hotWater"), Some(State::HotWater));
        assert_eq!(State::from_alias("flush"), Some(State::HotWaterRinse));
        assert_eq!(State::from_alias("FLUSH"), Some(State::HotWaterRinse));
        assert_eq!(State::from_alias("overdrive"), None);
    }

    #[test]
    fn test_state_request_byte() {
        assert_eq!(state_request(State::Espresso), [0x04]);
        assert_eq!(state_request(State::Sleep), [0x00]);
    }

    #[test]
    fn test_version_parse() {
        let data = [0x04, 0x01, 0x03, 0x00, 0x00, 0x04, 0xD2];
        let version = parse_version(&data).unwrap();
        assert_eq!(version.api, 4);
        assert_eq!(version.firmware_string(), "1.3");
        assert_eq!(version.build, 1234);
    }

    #[test]
    fn test_shot_settings_round_trip() {
        let settings = ShotSettings {
            steam_setting: 2,
            target_steam_temp: 150,
            target_steam_duration: 40,
            target_hot_water_temp: 85,
            target_hot_water_volume: 120,
            target_hot_water_duration: 25,
            target_shot_volume: 36,
            group_temp: 92.5,
        };
        let payload = shot_settings_payload(&settings);
        assert_eq!(payload.len(), 9);

        let parsed = parse_shot_settings(&payload).unwrap();
        assert_eq!(parsed.steam_setting, 2);
        assert_eq!(parsed.target_shot_volume, 36);
        assert!((parsed.group_temp - 92.5).abs() <= 1.0 / 256.0);
    }

    #[test]
    fn test_shot_settings_payload_deterministic() {
        let settings = ShotSettings::default();
        assert_eq!(
            shot_settings_payload(&settings),
            shot_settings_payload(&settings)
        );
    }

    #[test]
    fn test_mmr_fan_threshold_golden_vector() {
        let payload = mmr_write_request(mmr::FAN_THRESHOLD, &fan_threshold_body(55));
        assert_eq!(
            payload,
            vec![0x04, 0x80, 0x38, 0x08, 0x37, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mmr_read_round_trip() {
        let request = mmr_read_request(mmr::GHC_INFO);
        assert_eq!(request, vec![0x04, 0x80, 0x38, 0x1C]);

        let reply = [0x04, 0x80, 0x38, 0x1C, 0x01, 0x00, 0x00, 0x00];
        let parsed = parse_mmr_read(&reply).unwrap();
        assert_eq!(parsed.address, mmr::GHC_INFO);
        assert_eq!(parsed.data, vec![0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_profile_golden_vectors() {
        let profile = Profile {
            title: Some("single flow step".to_string()),
            target_volume: Some(36.0),
            target_weight: None,
            steps: vec![ProfileStep {
                pump: PumpMode::Flow,
                transition: Transition::Smooth,
                pressure: 0.0,
                flow: 2.0,
                temperature: 93.0,
                seconds: 30.0,
                exit: None,
            }],
        };

        let header = profile_header(&profile).unwrap();
        assert_eq!(&header[..4], &[0x01, 0x01, 0x00, 0x24]);
        assert!(header[4..].iter().all(|&b| b == 0));

        let frame = profile_frame(0, &profile.steps[0]);
        assert_eq!(frame, [0x00, 0x30, 0x00, 0x20, 0xBA, 0x1E, 0x00, 0x00]);
    }

    #[test]
    fn test_profile_frame_exit_condition() {
        let step = ProfileStep {
            pump: PumpMode::Pressure,
            transition: Transition::Fast,
            pressure: 9.0,
            flow: 0.0,
            temperature: 92.0,
            seconds: 4.0,
            exit: Some(ExitCondition {
                kind: "pressure_above".to_string(),
                value: 4.0,
            }),
        };
        let frame = profile_frame(3, &step);
        assert_eq!(frame[0], 3);
        assert_eq!(frame[1], 0);
        assert_eq!(frame[6], 1);
        assert_eq!(frame[7], 0x40);
    }

    #[test]
    fn test_profile_frame_unknown_exit_degrades() {
        let step = ProfileStep {
            pump: PumpMode::Pressure,
            transition: Transition::Fast,
            pressure: 9.0,
            flow: 0.0,
            temperature: 92.0,
            seconds: 4.0,
            exit: Some(ExitCondition {
                kind: "lunar_phase".to_string(),
                value: 1.0,
            }),
        };
        let frame = profile_frame(0, &step);
        assert_eq!(frame[6], 0);
        assert_eq!(frame[7], 0);
    }

    #[test]
    fn test_profile_header_rejects_empty() {
        let profile = Profile {
            title: None,
            target_volume: None,
            target_weight: None,
            steps: vec![],
        };
        assert!(matches!(
            profile_header(&profile),
            Err(BridgeError::BadRequest(_))
        ));
    }

    #[test]
    fn test_profile_round_trip_within_resolution() {
        let step = ProfileStep {
            pump: PumpMode::Pressure,
            transition: Transition::Smooth,
            pressure: 8.6,
            flow: 0.0,
            temperature: 92.4,
            seconds: 6.3,
            exit: None,
        };
        let frame = profile_frame(0, &step);
        assert!((crate::codec::decode_u8p4(frame[2]) - 8.6).abs() <= 1.0 / 16.0);
        assert!((crate::codec::decode_u8p1(frame[4]) - 92.4).abs() <= 0.5);
        assert!((crate::codec::decode_f8_1_7(frame[5]) - 6.3).abs() <= 0.05);
    }

    #[test]
    fn test_profile_json_document_shape() {
        let json = r#"{
            "title": "flat 6 bar",
            "target_volume": 36,
            "steps": [
                {"pump": "pressure", "transition": "fast", "pressure": 6.0,
                 "temperature": 92.0, "seconds": 30.0}
            ]
        }"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.steps.len(), 1);
        assert_eq!(profile.steps[0].pump, PumpMode::Pressure);
        assert_eq!(profile.steps[0].transition, Transition::Fast);
        assert!(profile.steps[0].exit.is_none());
    }
}
