//! Auxiliary sensor dialects.
//!
//! Sensors are simpler than scales: each vendor exposes a set of named
//! numeric channels and pushes readings by notification. The only dialect
//! shipped today is the Bookoo espresso monitor, a group-head pressure
//! gauge.

use uuid::{uuid, Uuid};

use crate::classify::SensorKind;

/// Description of one numeric channel a sensor publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel key, e.g. `pressure`
    pub key: &'static str,
    /// Value type label for the REST surface
    pub value_type: &'static str,
    /// Unit label, e.g. `bar`
    pub unit: &'static str,
}

/// Capability record a sensor vendor implements.
pub trait SensorAdapter: Send {
    /// Sensor family this adapter speaks for
    fn kind(&self) -> SensorKind;

    /// Channels this sensor publishes
    fn channels(&self) -> Vec<ChannelSpec>;

    /// Decode one notification into `(channel key, value)` updates.
    /// Malformed payloads decode to nothing and never fail the session.
    fn parse_notification(&mut self, uuid: Uuid, data: &[u8]) -> Vec<(&'static str, f64)>;

    /// Service UUID the session must find after discovery
    fn primary_service_uuid(&self) -> Uuid;

    /// Characteristics the session subscribes to
    fn subscription_uuids(&self) -> Vec<Uuid>;
}

/// Look up the adapter for a classified sensor.
#[must_use]
pub fn sensor_adapter_for(kind: SensorKind) -> Box<dyn SensorAdapter> {
    match kind {
        SensorKind::BookooMonitor => Box::new(BookooMonitor::new()),
    }
}

/// Stable sensor identifier: lowercase type joined to the address with the
/// colons stripped, e.g. `bookoomonitor_aabbccddeeff`.
#[must_use]
pub fn sensor_id(kind: SensorKind, address: &str) -> String {
    format!(
        "{}_{}",
        kind.as_str().to_lowercase(),
        address.replace(':', "").to_lowercase()
    )
}

const BOOKOO_EM_SERVICE: Uuid = uuid!("0000ffe0-0000-1000-8000-00805f9b34fb");
const BOOKOO_EM_NOTIFY: Uuid = uuid!("0000ffe1-0000-1000-8000-00805f9b34fb");

/// Bookoo espresso monitor: u16 BE pressure in 0.1 bar units.
#[derive(Debug, Default)]
pub struct BookooMonitor;

impl BookooMonitor {
    /// Create the adapter
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl SensorAdapter for BookooMonitor {
    fn kind(&self) -> SensorKind {
        SensorKind::BookooMonitor
    }

    fn channels(&self) -> Vec<ChannelSpec> {
        vec![ChannelSpec {
            key: "pressure",
            value_type: "number",
            unit: "bar",
        }]
    }

    fn parse_notification(&mut self, uuid: Uuid, data: &[u8]) -> Vec<(&'static str, f64)> {
        if uuid != BOOKOO_EM_NOTIFY || data.len() < 2 {
            return vec![];
        }
        let raw = (u16::from(data[0]) << 8) | u16::from(data[1]);
        vec![("pressure", f64::from(raw) / 10.0)]
    }

    fn primary_service_uuid(&self) -> Uuid {
        BOOKOO_EM_SERVICE
    }

    fn subscription_uuids(&self) -> Vec<Uuid> {
        vec![BOOKOO_EM_NOTIFY]
    }
}
