//! The bridge orchestrator.
//!
//! Owns the scanner, at most one DE1 session, at most one scale session,
//! and any number of sensor sessions. Applies the auto-connect policies,
//! reduces session events into snapshots, and fans them out as JSON to the
//! WebSocket channels. Sessions are owned exclusively here: nothing else
//! holds a handle that can mutate session state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::api::ws::{Channel, WsFanout};
use crate::classify::{classify, DeviceClass};
use crate::error::{BridgeError, Result};
use crate::protocol::{ShotSample, State, SubState, WaterLevels};
use crate::scale::adapter_for;
use crate::sensor::{sensor_adapter_for, sensor_id};
use crate::session::{
    now_ms, De1Event, De1Session, DeviceRole, MachineSnapshot, ScaleSession, ScaleSnapshot,
    SensorSession, SensorSnapshot, SessionEvent, SessionState, CONNECT_TIMEOUT,
};
use crate::settings::Settings;
use crate::transport::{Advertisement, BleLink, BleScanner};

/// Cloneable handle to the bridge; what the HTTP and WS layers hold.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    settings: RwLock<Settings>,
    settings_path: Option<PathBuf>,
    scanner: Option<BleScanner>,
    de1: RwLock<Option<Arc<De1Session>>>,
    scale: RwLock<Option<Arc<ScaleSession>>>,
    sensors: RwLock<HashMap<String, Arc<SensorSession>>>,
    discovered: RwLock<HashMap<String, Advertisement>>,
    fanout: WsFanout,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    running: AtomicBool,
}

impl BridgeHandle {
    /// Build a bridge. `scanner` is `None` only in tests, where sessions
    /// are injected directly.
    #[must_use]
    pub fn new(
        settings: Settings,
        settings_path: Option<PathBuf>,
        scanner: Option<BleScanner>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BridgeInner {
                settings: RwLock::new(settings),
                settings_path,
                scanner,
                de1: RwLock::new(None),
                scale: RwLock::new(None),
                sensors: RwLock::new(HashMap::new()),
                discovered: RwLock::new(HashMap::new()),
                fanout: WsFanout::new(),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// The fan-out registry shared with the WebSocket layer
    #[must_use]
    pub fn fanout(&self) -> &WsFanout {
        &self.inner.fanout
    }

    /// Start the event loop and, when a scanner is present, the scan task.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the initial scan cannot start.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let rx = self
            .inner
            .events_rx
            .lock()
            .await
            .take()
            .expect("bridge started twice");
        let events_bridge = self.clone();
        tokio::spawn(async move {
            events_bridge.event_loop(rx).await;
        });

        if let Some(scanner) = &self.inner.scanner {
            scanner.start().await?;
            let stream = scanner.advertisements().await?;
            let scan_bridge = self.clone();
            tokio::spawn(async move {
                scan_bridge.scan_loop(stream).await;
            });
        }

        info!("bridge started");
        Ok(())
    }

    /// Stop scanning and tear down every session.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(scanner) = &self.inner.scanner {
            let _ = scanner.stop().await;
        }
        if let Some(session) = self.inner.de1.write().await.take() {
            session.disconnect().await;
        }
        if let Some(session) = self.inner.scale.write().await.take() {
            session.disconnect().await;
        }
        for (_, session) in self.inner.sensors.write().await.drain() {
            session.disconnect().await;
        }
        info!("bridge stopped");
    }

    /// Current settings snapshot
    pub async fn settings(&self) -> Settings {
        self.inner.settings.read().await.clone()
    }

    /// Apply a partial settings document and persist the result.
    pub async fn update_settings(&self, patch: &serde_json::Value) -> Settings {
        let mut settings = self.inner.settings.write().await;
        let applied = settings.apply_partial(patch);
        if !applied.is_empty() {
            debug!(?applied, "settings updated");
            if let Some(path) = &self.inner.settings_path {
                settings.save_to_file(path);
            }
        }
        settings.clone()
    }

    /// Kick off a BLE scan.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the radio refuses, and
    /// [`BridgeError::NotFound`] when the bridge runs without one.
    pub async fn start_scan(&self) -> Result<()> {
        match &self.inner.scanner {
            Some(scanner) => scanner.start().await,
            None => Err(BridgeError::NotFound("no Bluetooth adapter".to_string())),
        }
    }

    /// The DE1 session, whatever its state
    pub async fn de1(&self) -> Option<Arc<De1Session>> {
        self.inner.de1.read().await.clone()
    }

    /// The DE1 session, only when `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] otherwise; the REST layer
    /// maps that to 503.
    pub async fn de1_ready(&self) -> Result<Arc<De1Session>> {
        match self.inner.de1.read().await.clone() {
            Some(session) if session.state().await == SessionState::Ready => Ok(session),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// The scale session, only when `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`]; the scale endpoints answer 404.
    pub async fn scale_ready(&self) -> Result<Arc<ScaleSession>> {
        match self.inner.scale.read().await.clone() {
            Some(session) if session.state().await == SessionState::Ready => Ok(session),
            _ => Err(BridgeError::NotFound("scale not connected".to_string())),
        }
    }

    /// Sensor session by id
    pub async fn sensor(&self, id: &str) -> Option<Arc<SensorSession>> {
        self.inner.sensors.read().await.get(id).cloned()
    }

    /// All sensor sessions
    pub async fn sensors(&self) -> Vec<Arc<SensorSession>> {
        self.inner.sensors.read().await.values().cloned().collect()
    }

    /// Connected devices, as the REST `/devices` array.
    pub async fn devices_json(&self) -> serde_json::Value {
        let mut devices = Vec::new();

        if let Some(session) = self.inner.de1.read().await.clone() {
            if session.state().await == SessionState::Ready {
                devices.push(json!({
                    "name": session.name(),
                    "id": session.address(),
                    "type": "machine",
                    "state": "connected",
                }));
            }
        }

        if let Some(session) = self.inner.scale.read().await.clone() {
            if session.state().await == SessionState::Ready {
                let snapshot = session.snapshot().await;
                devices.push(json!({
                    "name": session.name(),
                    "id": session.address(),
                    "type": "scale",
                    "scaleType": session.kind().as_str(),
                    "state": "connected",
                    "weight": snapshot.weight_g,
                }));
            }
        }

        for session in self.sensors().await {
            if session.state().await == SessionState::Ready {
                devices.push(json!({
                    "name": session.name(),
                    "id": session.address(),
                    "type": "sensor",
                    "sensorType": session.kind().as_str(),
                    "state": "connected",
                }));
            }
        }

        serde_json::Value::Array(devices)
    }

    /// Everything the scanner has seen, classified, as the REST
    /// `/devices/discovered` array.
    pub async fn discovered_json(&self) -> serde_json::Value {
        let discovered = self.inner.discovered.read().await;
        let mut devices = Vec::new();
        for advert in discovered.values() {
            devices.push(discovered_entry(advert));
        }
        serde_json::Value::Array(devices)
    }

    /// Connect to a previously discovered device by address.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`] for an unseen address or a vendor
    /// with no shipped dialect, [`BridgeError::BadRequest`] when the scale
    /// seat is busy.
    pub async fn connect_device(&self, address: &str) -> Result<()> {
        let advert = self
            .inner
            .discovered
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound("device not found".to_string()))?;

        match classify(advert.name.as_deref(), &advert.service_uuids) {
            DeviceClass::De1 => self.connect_de1(&advert).await,
            DeviceClass::Scale(kind) => self.connect_scale(&advert, kind).await,
            DeviceClass::Sensor(kind) => self.connect_sensor(&advert, kind).await,
            DeviceClass::Unknown => Err(BridgeError::NotFound("device not found".to_string())),
        }
    }

    /// Tare the connected scale.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`] with no ready scale.
    pub async fn tare_scale(&self) -> Result<()> {
        self.scale_ready().await?.tare().await
    }

    /// Disconnect and drop the scale session.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`] when no scale session exists.
    pub async fn disconnect_scale(&self) -> Result<()> {
        let session = self
            .inner
            .scale
            .write()
            .await
            .take()
            .ok_or_else(|| BridgeError::NotFound("no scale".to_string()))?;
        session.disconnect().await;
        Ok(())
    }

    /// Machine snapshot as the REST/WS JSON object, when the DE1 is ready.
    pub async fn machine_snapshot_json(&self) -> Option<String> {
        let session = self.de1_ready().await.ok()?;
        let snapshot = session.snapshot().await;
        Some(machine_state_json(&snapshot).to_string())
    }

    /// Scale snapshot as the WS JSON object, when the scale is ready.
    pub async fn scale_snapshot_json(&self) -> Option<String> {
        let session = self.scale_ready().await.ok()?;
        let snapshot = session.snapshot().await;
        Some(scale_snapshot_json(&snapshot).to_string())
    }

    async fn scan_loop(self, mut stream: futures::stream::BoxStream<'static, Advertisement>) {
        while let Some(advert) = stream.next().await {
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
            self.inner
                .discovered
                .write()
                .await
                .insert(advert.address.clone(), advert.clone());
            self.handle_advertisement(&advert).await;
        }
        debug!("scan loop ended");
    }

    async fn handle_advertisement(&self, advert: &Advertisement) {
        match classify(advert.name.as_deref(), &advert.service_uuids) {
            DeviceClass::De1 => {
                let settings = self.inner.settings.read().await;
                let pinned =
                    !settings.de1_address.is_empty() && advert.address == settings.de1_address;
                if !(settings.auto_connect || pinned) {
                    return;
                }
                drop(settings);

                if de1_seat_busy(self.de1_state().await) {
                    return;
                }
                if let Err(error) = self.connect_de1(advert).await {
                    warn!(%error, address = %advert.address, "DE1 auto-connect failed");
                }
            }
            DeviceClass::Scale(kind) => {
                if !self.inner.settings.read().await.auto_connect_scale {
                    return;
                }
                if let Err(error) = self.connect_scale(advert, kind).await {
                    debug!(%error, address = %advert.address, "scale auto-connect skipped");
                }
            }
            DeviceClass::Sensor(kind) => {
                if let Err(error) = self.connect_sensor(advert, kind).await {
                    debug!(%error, address = %advert.address, "sensor auto-connect skipped");
                }
            }
            DeviceClass::Unknown => {}
        }
    }

    async fn de1_state(&self) -> Option<SessionState> {
        match self.inner.de1.read().await.clone() {
            Some(session) => Some(session.state().await),
            None => None,
        }
    }

    async fn link_for(&self, address: &str) -> Result<Arc<dyn BleLink>> {
        let scanner = self
            .inner
            .scanner
            .as_ref()
            .ok_or_else(|| BridgeError::NotFound("device not found".to_string()))?;
        let link = scanner
            .link(address)
            .await
            .ok_or_else(|| BridgeError::NotFound("device not found".to_string()))?;
        Ok(Arc::new(link))
    }

    async fn connect_de1(&self, advert: &Advertisement) -> Result<()> {
        let link = self.link_for(&advert.address).await?;

        // One DE1 at a time: tear down any predecessor before connecting.
        if let Some(previous) = self.inner.de1.write().await.take() {
            previous.disconnect().await;
        }
        if let Some(scanner) = &self.inner.scanner {
            let _ = scanner.stop().await;
        }

        info!(address = %advert.address, "connecting DE1");
        let session = De1Session::spawn(
            advert.address.clone(),
            advert.name.clone().unwrap_or_else(|| "DE1".to_string()),
            link,
            self.inner.events_tx.clone(),
        );
        *self.inner.de1.write().await = Some(session);
        Ok(())
    }

    async fn connect_scale(&self, advert: &Advertisement, kind: crate::classify::ScaleKind) -> Result<()> {
        let adapter = adapter_for(kind).ok_or_else(|| {
            BridgeError::NotFound(format!("no adapter for {} scale", kind.as_str()))
        })?;

        {
            let mut seat = self.inner.scale.write().await;
            if let Some(existing) = seat.clone() {
                match existing.state().await {
                    SessionState::Ready => {
                        return Err(BridgeError::BadRequest(
                            "scale already connected".to_string(),
                        ));
                    }
                    SessionState::Connecting | SessionState::ServicesDiscovering
                        if existing.age() < CONNECT_TIMEOUT =>
                    {
                        return Err(BridgeError::BadRequest(
                            "scale connection in progress".to_string(),
                        ));
                    }
                    // Stuck or dead attempts are abandoned and replaced.
                    _ => {
                        existing.disconnect().await;
                        *seat = None;
                    }
                }
            }
        }

        let link = self.link_for(&advert.address).await?;
        let flow_multiplier = self.inner.settings.read().await.weight_flow_multiplier;

        info!(address = %advert.address, kind = kind.as_str(), "connecting scale");
        let session = ScaleSession::spawn(
            advert.address.clone(),
            advert.name.clone().unwrap_or_else(|| kind.as_str().to_string()),
            adapter,
            link,
            flow_multiplier,
            self.inner.events_tx.clone(),
        );
        *self.inner.scale.write().await = Some(session);
        Ok(())
    }

    async fn connect_sensor(&self, advert: &Advertisement, kind: crate::classify::SensorKind) -> Result<()> {
        let id = sensor_id(kind, &advert.address);
        if self.inner.sensors.read().await.contains_key(&id) {
            return Ok(());
        }

        let link = self.link_for(&advert.address).await?;
        let adapter = sensor_adapter_for(kind);

        info!(%id, "connecting sensor");
        let session = SensorSession::spawn(
            advert.address.clone(),
            advert.name.clone().unwrap_or_else(|| kind.as_str().to_string()),
            adapter,
            link,
            self.inner.events_tx.clone(),
        );
        self.inner.sensors.write().await.insert(id, session);
        Ok(())
    }

    async fn event_loop(self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            self.route_session_event(event).await;
        }
        debug!("event loop ended");
    }

    /// Reduce one session event into bridge state and fan it out.
    pub async fn route_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::De1(de1_event) => self.route_de1_event(de1_event).await,
            SessionEvent::Scale(snapshot) => {
                self.inner.fanout.broadcast(
                    &Channel::ScaleSnapshot,
                    scale_snapshot_json(&snapshot).to_string(),
                );
            }
            SessionEvent::ScaleButton { id } => {
                debug!(button = id, "scale button pressed");
            }
            SessionEvent::Sensor(snapshot) => {
                let channel = Channel::Sensor(snapshot.id.clone());
                self.inner
                    .fanout
                    .broadcast(&channel, sensor_snapshot_json(&snapshot).to_string());
            }
            SessionEvent::Connected { role, address } => {
                info!(?role, %address, "session connected");
            }
            SessionEvent::Disconnected { role, address } => {
                info!(?role, %address, "session disconnected");
                self.reap_session(role, &address).await;
                self.resume_scan_if_running().await;
            }
            SessionEvent::Failed {
                role,
                address,
                reason,
            } => {
                warn!(?role, %address, %reason, "session failed");
                // Failed sessions stay seated until replaced, but scanning
                // resumes so a replacement can be found.
                self.resume_scan_if_running().await;
            }
        }
    }

    async fn route_de1_event(&self, event: De1Event) {
        match event {
            De1Event::StateChange { state, substate } => {
                self.inner.fanout.broadcast(
                    &Channel::MachineSnapshot,
                    state_change_json(state, substate).to_string(),
                );
            }
            De1Event::ShotSample(sample) => {
                let (state, substate) = match self.inner.de1.read().await.clone() {
                    Some(session) => {
                        let snapshot = session.snapshot().await;
                        (snapshot.state, snapshot.substate)
                    }
                    None => (State::Sleep, SubState::Ready),
                };
                self.inner.fanout.broadcast(
                    &Channel::MachineSnapshot,
                    shot_sample_json(&sample, state, substate).to_string(),
                );
            }
            De1Event::WaterLevels(levels) => {
                self.inner
                    .fanout
                    .broadcast(&Channel::WaterLevels, water_levels_json(&levels).to_string());
            }
            De1Event::ShotSettings(settings) => {
                let payload =
                    serde_json::to_string(&settings).unwrap_or_else(|_| "{}".to_string());
                self.inner.fanout.broadcast(&Channel::ShotSettings, payload);
            }
            De1Event::Version(_) | De1Event::MmrRead(_) => {}
        }
    }

    /// Drop a terminal session from its seat, if it is still the occupant.
    async fn reap_session(&self, role: DeviceRole, address: &str) {
        match role {
            DeviceRole::De1 => {
                let mut seat = self.inner.de1.write().await;
                if let Some(session) = seat.clone() {
                    if session.address() == address
                        && session.state().await == SessionState::Disconnected
                    {
                        *seat = None;
                    }
                }
            }
            DeviceRole::Scale => {
                let mut seat = self.inner.scale.write().await;
                if let Some(session) = seat.clone() {
                    if session.address() == address
                        && session.state().await == SessionState::Disconnected
                    {
                        *seat = None;
                    }
                }
            }
            DeviceRole::Sensor => {
                let mut sensors = self.inner.sensors.write().await;
                sensors.retain(|_, session| session.address() != address);
            }
        }
    }

    async fn resume_scan_if_running(&self) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(scanner) = &self.inner.scanner {
            if let Err(error) = scanner.start().await {
                warn!(%error, "failed to resume scanning");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_discovered(&self, advert: Advertisement) {
        self.inner
            .discovered
            .write()
            .await
            .insert(advert.address.clone(), advert);
    }
}

/// Whether the DE1 seat blocks a new auto-connect.
#[must_use]
pub fn de1_seat_busy(state: Option<SessionState>) -> bool {
    matches!(
        state,
        Some(
            SessionState::Connecting | SessionState::ServicesDiscovering | SessionState::Ready
        )
    )
}

fn discovered_entry(advert: &Advertisement) -> serde_json::Value {
    let name = advert.name.clone().unwrap_or_default();
    match classify(advert.name.as_deref(), &advert.service_uuids) {
        DeviceClass::De1 => json!({
            "name": name,
            "address": advert.address,
            "type": "machine",
        }),
        DeviceClass::Scale(kind) => json!({
            "name": name,
            "address": advert.address,
            "type": "scale",
            "scaleType": kind.as_str(),
        }),
        DeviceClass::Sensor(kind) => json!({
            "name": name,
            "address": advert.address,
            "type": "sensor",
            "sensorType": kind.as_str(),
        }),
        DeviceClass::Unknown => json!({
            "name": name,
            "address": advert.address,
            "type": "unknown",
        }),
    }
}

/// `{state, substate}` message for the machine snapshot channel.
#[must_use]
pub fn state_change_json(state: State, substate: SubState) -> serde_json::Value {
    json!({
        "state": state.as_str(),
        "substate": substate.as_str(),
    })
}

/// Shot-sample message for the machine snapshot channel.
#[must_use]
pub fn shot_sample_json(sample: &ShotSample, state: State, substate: SubState) -> serde_json::Value {
    json!({
        "timestamp": now_ms(),
        "pressure": sample.group_pressure,
        "flow": sample.group_flow,
        "mixTemperature": sample.mix_temp,
        "groupTemperature": sample.head_temp,
        "targetPressure": sample.set_pressure,
        "targetFlow": sample.set_flow,
        "steamTemperature": sample.steam_temp,
        "profileFrame": sample.frame_number,
        "state": {
            "state": state.as_str(),
            "substate": substate.as_str(),
        },
    })
}

/// Water-levels message for the water-levels channel and REST endpoint.
#[must_use]
pub fn water_levels_json(levels: &WaterLevels) -> serde_json::Value {
    json!({
        "currentLevel": levels.current_mm,
        "startLevel": levels.start_mm,
    })
}

/// Machine-state object for `GET /machine/state` and the WS greeting.
#[must_use]
pub fn machine_state_json(snapshot: &MachineSnapshot) -> serde_json::Value {
    json!({
        "timestamp": now_ms(),
        "state": {
            "state": snapshot.state.as_str(),
            "substate": snapshot.substate.as_str(),
        },
        "pressure": snapshot.pressure,
        "flow": snapshot.flow,
        "mixTemperature": snapshot.mix_temp,
        "groupTemperature": snapshot.head_temp,
        "targetPressure": snapshot.target_pressure,
        "targetFlow": snapshot.target_flow,
        "steamTemperature": snapshot.steam_temp,
    })
}

/// Scale snapshot message for the scale channel.
#[must_use]
pub fn scale_snapshot_json(snapshot: &ScaleSnapshot) -> serde_json::Value {
    let mut value = json!({
        "timestamp": snapshot.timestamp_ms,
        "weight": snapshot.weight_g,
        "weightFlow": snapshot.flow_g_s,
    });
    if let Some(battery) = snapshot.battery_pct {
        value["batteryLevel"] = json!(battery);
    }
    value
}

/// Sensor snapshot message for a per-sensor channel.
#[must_use]
pub fn sensor_snapshot_json(snapshot: &SensorSnapshot) -> serde_json::Value {
    json!({
        "timestamp": snapshot.timestamp_ms,
        "id": snapshot.id,
        "values": snapshot.channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_de1_seat_busy_policy() {
        assert!(!de1_seat_busy(None));
        assert!(!de1_seat_busy(Some(SessionState::Idle)));
        assert!(!de1_seat_busy(Some(SessionState::Disconnected)));
        assert!(!de1_seat_busy(Some(SessionState::Failed)));
        assert!(de1_seat_busy(Some(SessionState::Connecting)));
        assert!(de1_seat_busy(Some(SessionState::ServicesDiscovering)));
        assert!(de1_seat_busy(Some(SessionState::Ready)));
    }

    #[test]
    fn test_water_levels_json_shape() {
        let value = water_levels_json(&WaterLevels {
            current_mm: 50,
            start_mm: 90,
        });
        assert_eq!(value["currentLevel"], 50);
        assert_eq!(value["startLevel"], 90);
    }

    #[test]
    fn test_scale_snapshot_json_omits_missing_battery() {
        let without = scale_snapshot_json(&ScaleSnapshot {
            weight_g: 18.5,
            flow_g_s: 2.1,
            battery_pct: None,
            timestamp_ms: 7,
        });
        assert!(without.get("batteryLevel").is_none());
        assert_eq!(without["weight"], 18.5);
        assert_eq!(without["weightFlow"], 2.1);

        let with = scale_snapshot_json(&ScaleSnapshot {
            weight_g: 0.0,
            flow_g_s: 0.0,
            battery_pct: Some(80),
            timestamp_ms: 7,
        });
        assert_eq!(with["batteryLevel"], 80);
    }

    #[test]
    fn test_shot_sample_json_shape() {
        let sample = ShotSample {
            timer_s: 1.0,
            group_pressure: 5.0,
            group_flow: 2.0,
            mix_temp: 82.0,
            head_temp: 76.75,
            set_mix_temp: 0.0,
            set_head_temp: 73.0,
            set_pressure: 4.5,
            set_flow: 1.5,
            frame_number: 2,
            steam_temp: 94.0,
            tail: vec![],
        };
        let value = shot_sample_json(&sample, State::Espresso, SubState::Pouring);
        assert_eq!(value["pressure"], 5.0);
        assert_eq!(value["groupTemperature"], 76.75);
        assert_eq!(value["profileFrame"], 2);
        assert_eq!(value["state"]["state"], "Espresso");
        assert_eq!(value["state"]["substate"], "Pouring");
    }

    #[test]
    fn test_sensor_snapshot_json_shape() {
        let mut channels = std::collections::BTreeMap::new();
        channels.insert("pressure".to_string(), 9.2);
        let value = sensor_snapshot_json(&SensorSnapshot {
            id: "bookoomonitor_aabb".to_string(),
            channels,
            timestamp_ms: 1,
        });
        assert_eq!(value["id"], "bookoomonitor_aabb");
        assert_eq!(value["values"]["pressure"], 9.2);
    }

    #[tokio::test]
    async fn test_bridge_routes_events_to_fanout() {
        let bridge = BridgeHandle::new(Settings::default(), None, None);
        let mut machine_rx = bridge.fanout().subscribe(&Channel::MachineSnapshot);
        let mut water_rx = bridge.fanout().subscribe(&Channel::WaterLevels);

        bridge
            .route_session_event(SessionEvent::De1(De1Event::StateChange {
                state: State::Espresso,
                substate: SubState::PreInfusing,
            }))
            .await;
        bridge
            .route_session_event(SessionEvent::De1(De1Event::WaterLevels(WaterLevels {
                current_mm: 42,
                start_mm: 90,
            })))
            .await;

        let state_msg: serde_json::Value =
            serde_json::from_str(&machine_rx.recv().await.unwrap()).unwrap();
        assert_eq!(state_msg["state"], "Espresso");
        assert_eq!(state_msg["substate"], "PreInfusing");

        let water_msg: serde_json::Value =
            serde_json::from_str(&water_rx.recv().await.unwrap()).unwrap();
        assert_eq!(water_msg["currentLevel"], 42);
    }

    #[tokio::test]
    async fn test_scale_events_reach_scale_channel() {
        let bridge = BridgeHandle::new(Settings::default(), None, None);
        let mut rx = bridge.fanout().subscribe(&Channel::ScaleSnapshot);

        bridge
            .route_session_event(SessionEvent::Scale(ScaleSnapshot {
                weight_g: 12.3,
                flow_g_s: 1.1,
                battery_pct: Some(70),
                timestamp_ms: 99,
            }))
            .await;

        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["weight"], 12.3);
        assert_eq!(msg["batteryLevel"], 70);
    }

    #[tokio::test]
    async fn test_endpoints_fail_without_devices() {
        let bridge = BridgeHandle::new(Settings::default(), None, None);
        assert!(matches!(
            bridge.de1_ready().await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            bridge.scale_ready().await,
            Err(BridgeError::NotFound(_))
        ));
        assert!(matches!(
            bridge.disconnect_scale().await,
            Err(BridgeError::NotFound(_))
        ));
        assert!(bridge.machine_snapshot_json().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_unknown_address_is_not_found() {
        let bridge = BridgeHandle::new(Settings::default(), None, None);
        assert!(matches!(
            bridge.connect_device("11:22:33:44:55:66").await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_scale_vendor_without_adapter() {
        let bridge = BridgeHandle::new(Settings::default(), None, None);
        bridge
            .insert_discovered(Advertisement {
                address: "77:88:99:AA:BB:CC".to_string(),
                name: Some("VARIA AKU".to_string()),
                service_uuids: vec![],
                rssi: None,
            })
            .await;

        // Classified as a Varia scale, but no dialect ships for it.
        assert!(matches!(
            bridge.connect_device("77:88:99:AA:BB:CC").await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_discovered_json_classifies_entries() {
        let bridge = BridgeHandle::new(Settings::default(), None, None);
        bridge
            .insert_discovered(Advertisement {
                address: "AA:AA:AA:AA:AA:AA".to_string(),
                name: Some("Decent Scale".to_string()),
                service_uuids: vec![],
                rssi: None,
            })
            .await;
        bridge
            .insert_discovered(Advertisement {
                address: "BB:BB:BB:BB:BB:BB".to_string(),
                name: Some("DE1PROAB".to_string()),
                service_uuids: vec![],
                rssi: None,
            })
            .await;

        let devices = bridge.discovered_json().await;
        let entries = devices.as_array().unwrap();
        assert_eq!(entries.len(), 2);

        let scale = entries
            .iter()
            .find(|e| e["type"] == "scale")
            .expect("no scale entry");
        assert_eq!(scale["scaleType"], "Decent");

        let machine = entries
            .iter()
            .find(|e| e["type"] == "machine")
            .expect("no machine entry");
        assert_eq!(machine["address"], "BB:BB:BB:BB:BB:BB");
    }

    #[tokio::test]
    async fn test_settings_update_applies_patch() {
        let bridge = BridgeHandle::new(Settings::default(), None, None);
        let updated = bridge
            .update_settings(&json!({"autoConnect": true, "bridgeName": "bar"}))
            .await;
        assert!(updated.auto_connect);
        assert_eq!(updated.bridge_name, "bar");
        assert_eq!(bridge.settings().await.bridge_name, "bar");
    }
}
