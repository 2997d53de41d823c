//! Advertisement classification.
//!
//! Decides what a freshly discovered peripheral is from nothing but its
//! advertised name and service UUIDs. Scale detection runs before DE1
//! detection: several scales carry "decent" in their name and must never
//! be mistaken for the machine.

use uuid::Uuid;

use crate::protocol::DE1_SERVICE_UUID;

/// What a BLE advertisement was recognised as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// A DE1 espresso machine
    De1,
    /// A supported weighing scale
    Scale(ScaleKind),
    /// A supported auxiliary sensor
    Sensor(SensorKind),
    /// Nothing this bridge talks to
    Unknown,
}

/// Scale vendor families recognised by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaleKind {
    /// Decent Scale
    Decent,
    /// Acaia Lunar/Pearl family
    Acaia,
    /// Acaia Pyxis (different wire dialect from the rest of Acaia)
    AcaiaPyxis,
    /// Felicita Arc family
    Felicita,
    /// Atomax Skale
    Skale,
    /// Bookoo Themis
    Bookoo,
    /// Eureka Precisa
    Eureka,
    /// DiFluid Microbalance
    Difluid,
    /// Hiroia Jimmy
    Hiroia,
    /// Varia AKU
    Varia,
    /// SmartChef
    SmartChef,
}

impl ScaleKind {
    /// Vendor label used in JSON payloads
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Decent => "Decent",
            Self::Acaia => "Acaia",
            Self::AcaiaPyxis => "Acaia Pyxis",
            Self::Felicita => "Felicita",
            Self::Skale => "Skale",
            Self::Bookoo => "Bookoo",
            Self::Eureka => "Eureka",
            Self::Difluid => "DiFluid",
            Self::Hiroia => "Hiroia",
            Self::Varia => "Varia",
            Self::SmartChef => "SmartChef",
        }
    }
}

/// Sensor families recognised by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Bookoo espresso monitor (group-head pressure)
    BookooMonitor,
}

impl SensorKind {
    /// Type label used in JSON payloads and sensor ids
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BookooMonitor => "BookooMonitor",
        }
    }
}

/// Classify an advertisement from its name and service UUID list.
#[must_use]
pub fn classify(name: Option<&str>, service_uuids: &[Uuid]) -> DeviceClass {
    let name = name.unwrap_or("");

    if let Some(kind) = scale_kind(name) {
        return DeviceClass::Scale(kind);
    }

    if let Some(kind) = sensor_kind(name) {
        return DeviceClass::Sensor(kind);
    }

    let lower = name.to_lowercase();
    if lower.starts_with("de1")
        || lower.contains("decent")
        || service_uuids.contains(&DE1_SERVICE_UUID)
    {
        return DeviceClass::De1;
    }

    DeviceClass::Unknown
}

/// Match a name against the known scale vendor patterns.
///
/// "Decent Scale" is a case-sensitive prefix (the vendor never varies it);
/// everything else compares lowercase. Bookoo names are only scales when
/// they do not also look like an espresso monitor.
#[must_use]
pub fn scale_kind(name: &str) -> Option<ScaleKind> {
    if name.starts_with("Decent Scale") {
        return Some(ScaleKind::Decent);
    }

    let lower = name.to_lowercase();
    if lower.starts_with("acaia") || lower.starts_with("proch") {
        return Some(ScaleKind::Acaia);
    }
    if lower.starts_with("pyxis") {
        return Some(ScaleKind::AcaiaPyxis);
    }
    if lower.starts_with("felicita") {
        return Some(ScaleKind::Felicita);
    }
    if lower.starts_with("skale") {
        return Some(ScaleKind::Skale);
    }
    if lower.starts_with("bookoo") && !lower.contains("em") && !lower.contains("monitor") {
        return Some(ScaleKind::Bookoo);
    }
    if lower.starts_with("eureka") {
        return Some(ScaleKind::Eureka);
    }
    if lower.starts_with("difluid") {
        return Some(ScaleKind::Difluid);
    }
    if lower.starts_with("hiroia") || lower.starts_with("jimmy") {
        return Some(ScaleKind::Hiroia);
    }
    if lower.starts_with("varia") {
        return Some(ScaleKind::Varia);
    }
    if lower.starts_with("smartchef") {
        return Some(ScaleKind::SmartChef);
    }

    None
}

/// Match a name against the known sensor patterns.
#[must_use]
pub fn sensor_kind(name: &str) -> Option<SensorKind> {
    let lower = name.to_lowercase();
    if lower.starts_with("bookoo") && (lower.contains("em") || lower.contains("monitor")) {
        return Some(SensorKind::BookooMonitor);
    }
    None
}
