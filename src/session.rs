//! Per-device sessions: the connection state machine over a [`BleLink`].
//!
//! Every active BLE link is owned by exactly one session object. A session
//! runs a background task that walks the machine through
//! `Connecting → ServicesDiscovering → Ready`, then pumps notifications
//! into snapshot updates and semantic events until the link drops or the
//! bridge tears it down. `Disconnected` and `Failed` are terminal: a dead
//! session object is replaced, never revived.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{ScaleKind, SensorKind};
use crate::error::{BridgeError, Result};
use crate::protocol::{
    self, characteristic, mmr, MmrRead, Profile, ShotSample, ShotSettings, State, SubState,
    Version, WaterLevels, DE1_SERVICE_UUID,
};
use crate::scale::{FlowEstimator, ScaleAdapter, ScaleEvent};
use crate::sensor::{sensor_id, SensorAdapter};
use crate::transport::{BleLink, LinkNotification};

/// Connection budget for a single attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Lifecycle of one session object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet started
    Idle,
    /// BLE connect in flight
    Connecting,
    /// Connected, walking GATT discovery
    ServicesDiscovering,
    /// Subscribed and streaming
    Ready,
    /// Link closed; terminal
    Disconnected,
    /// Setup failed; terminal
    Failed,
}

/// Which seat a session occupies in the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// The espresso machine
    De1,
    /// The weighing scale
    Scale,
    /// An auxiliary sensor
    Sensor,
}

/// Events a session emits toward the bridge.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A DE1 characteristic produced a typed message
    De1(De1Event),
    /// The scale snapshot changed
    Scale(ScaleSnapshot),
    /// A physical scale button was pressed
    ScaleButton {
        /// Vendor button index
        id: u8,
    },
    /// A sensor pushed new channel values
    Sensor(SensorSnapshot),
    /// Session reached `Ready`
    Connected {
        /// Seat the session occupies
        role: DeviceRole,
        /// Peripheral address
        address: String,
    },
    /// Session ended
    Disconnected {
        /// Seat the session occupied
        role: DeviceRole,
        /// Peripheral address
        address: String,
    },
    /// Session setup failed
    Failed {
        /// Seat the session was meant to occupy
        role: DeviceRole,
        /// Peripheral address
        address: String,
        /// Human-readable cause
        reason: String,
    },
}

/// Typed messages decoded from DE1 characteristics.
#[derive(Debug, Clone)]
pub enum De1Event {
    /// STATE_INFO changed
    StateChange {
        /// Machine state
        state: State,
        /// Machine substate
        substate: SubState,
    },
    /// A SHOT_SAMPLE notification
    ShotSample(ShotSample),
    /// WATER_LEVELS changed
    WaterLevels(WaterLevels),
    /// SHOT_SETTINGS read back or changed
    ShotSettings(ShotSettings),
    /// VERSION read completed
    Version(Version),
    /// An MMR read reply arrived
    MmrRead(MmrRead),
}

/// Milliseconds since the Unix epoch; the timestamp unit of every JSON
/// payload the bridge publishes.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Most recent coherent values observed from the machine.
///
/// Each characteristic handler writes its own named subset; no cross-field
/// atomicity is promised and readers take the latest value per field.
#[derive(Debug, Clone)]
pub struct MachineSnapshot {
    /// Machine state
    pub state: State,
    /// Machine substate
    pub substate: SubState,
    /// Group pressure, bar
    pub pressure: f64,
    /// Group flow, ml/s
    pub flow: f64,
    /// Mix temperature, °C
    pub mix_temp: f64,
    /// Group-head temperature, °C
    pub head_temp: f64,
    /// Steam heater temperature, °C
    pub steam_temp: f64,
    /// Target pressure, bar
    pub target_pressure: f64,
    /// Target flow, ml/s
    pub target_flow: f64,
    /// Profile frame currently executing
    pub frame_number: u8,
    /// Tank level, mm
    pub water_level_mm: u16,
    /// Tank level at shot start, mm
    pub water_start_level_mm: u16,
    /// Firmware version block, once read
    pub firmware: Option<Version>,
    /// Machine model label
    pub model: String,
    /// Group head controller installed
    pub has_ghc: bool,
    /// Machine serial number, when known
    pub serial: String,
    /// USB charger enabled
    pub usb_charger_on: bool,
    /// Fan activation threshold, °C
    pub fan_threshold_c: u8,
    /// Steam / hot-water / shot targets
    pub shot_settings: ShotSettings,
}

impl Default for MachineSnapshot {
    fn default() -> Self {
        Self {
            state: State::Sleep,
            substate: SubState::Ready,
            pressure: 0.0,
            flow: 0.0,
            mix_temp: 0.0,
            head_temp: 0.0,
            steam_temp: 0.0,
            target_pressure: 0.0,
            target_flow: 0.0,
            frame_number: 0,
            water_level_mm: 0,
            water_start_level_mm: 0,
            firmware: None,
            model: "DE1".to_string(),
            has_ghc: false,
            serial: String::new(),
            usb_charger_on: false,
            fan_threshold_c: 50,
            shot_settings: ShotSettings::default(),
        }
    }
}

/// Most recent scale reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleSnapshot {
    /// Grams on the platform
    pub weight_g: f64,
    /// Flow rate, g/s (native or derived)
    pub flow_g_s: f64,
    /// Battery percentage, when the vendor reports one
    pub battery_pct: Option<u8>,
    /// Capture time, ms since epoch
    pub timestamp_ms: u64,
}

impl Default for ScaleSnapshot {
    fn default() -> Self {
        Self {
            weight_g: 0.0,
            flow_g_s: 0.0,
            battery_pct: None,
            timestamp_ms: 0,
        }
    }
}

/// Most recent sensor channel values.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSnapshot {
    /// Stable sensor id, `<type>_<address-without-colons>`
    pub id: String,
    /// Channel key → latest value
    pub channels: BTreeMap<String, f64>,
    /// Capture time, ms since epoch
    pub timestamp_ms: u64,
}

/// Session for the DE1 espresso machine.
pub struct De1Session {
    address: String,
    name: String,
    link: Arc<dyn BleLink>,
    state: RwLock<SessionState>,
    snapshot: RwLock<MachineSnapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    profile_upload_active: AtomicBool,
}

impl De1Session {
    /// Create the session and start its connection task.
    pub fn spawn(
        address: String,
        name: String,
        link: Arc<dyn BleLink>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            address,
            name,
            link,
            state: RwLock::new(SessionState::Idle),
            snapshot: RwLock::new(MachineSnapshot::default()),
            events,
            cancel: CancellationToken::new(),
            profile_upload_active: AtomicBool::new(false),
        });

        let runner = Arc::clone(&session);
        tokio::spawn(async move {
            runner.run().await;
        });

        session
    }

    /// Peripheral address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Copy of the machine snapshot
    pub async fn snapshot(&self) -> MachineSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Tear the session down. Terminal; the object cannot reconnect.
    pub async fn disconnect(&self) {
        self.set_state(SessionState::Disconnected).await;
        self.cancel.cancel();
        let _ = self.link.disconnect().await;
    }

    /// Request a machine state by its REST alias.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BadRequest`] for an unknown alias and
    /// [`BridgeError::NotReady`] outside `Ready`.
    pub async fn request_state_by_alias(&self, alias: &str) -> Result<()> {
        let state = State::from_alias(alias)
            .ok_or_else(|| BridgeError::BadRequest(format!("invalid state: {alias}")))?;
        self.request_state(state).await
    }

    /// Write a one-byte state request.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] outside `Ready`,
    /// [`BridgeError::Transport`] on write failure.
    pub async fn request_state(&self, state: State) -> Result<()> {
        self.ensure_ready().await?;
        info!(state = state.as_str(), "requesting machine state");
        self.link
            .write(
                characteristic::REQUESTED_STATE,
                &protocol::state_request(state),
                true,
            )
            .await
    }

    /// Write the 9-byte shot settings and update the cache.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] outside `Ready`,
    /// [`BridgeError::Transport`] on write failure.
    pub async fn set_shot_settings(&self, settings: ShotSettings) -> Result<()> {
        self.ensure_ready().await?;
        let payload = protocol::shot_settings_payload(&settings);
        self.link
            .write(characteristic::SHOT_SETTINGS, &payload, true)
            .await?;
        self.snapshot.write().await.shot_settings = settings;
        info!("shot settings updated");
        Ok(())
    }

    /// Upload a brew profile: one header write, then one write per frame.
    ///
    /// Only one upload may be in flight per session; a second call while
    /// busy is rejected so a partial upload can never interleave with
    /// another.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BadRequest`] for an empty profile or a
    /// concurrent upload, [`BridgeError::NotReady`] outside `Ready`,
    /// [`BridgeError::Transport`] on write failure.
    pub async fn upload_profile(&self, profile: &Profile) -> Result<()> {
        if self.profile_upload_active.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::BadRequest(
                "profile upload already in progress".to_string(),
            ));
        }
        let result = self.do_upload_profile(profile).await;
        self.profile_upload_active.store(false, Ordering::SeqCst);
        result
    }

    async fn do_upload_profile(&self, profile: &Profile) -> Result<()> {
        self.ensure_ready().await?;
        let header = protocol::profile_header(profile)?;
        self.link
            .write(characteristic::HEADER_WRITE, &header, true)
            .await?;
        debug!(frames = profile.steps.len(), "profile header written");

        for (index, step) in profile.steps.iter().enumerate() {
            let frame = protocol::profile_frame(index as u8, step);
            self.link
                .write(characteristic::FRAME_WRITE, &frame, true)
                .await?;
        }

        info!(
            title = profile.title.as_deref().unwrap_or(""),
            frames = profile.steps.len(),
            "profile uploaded"
        );
        Ok(())
    }

    /// Toggle the USB charger via MMR and update the cache.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] outside `Ready`,
    /// [`BridgeError::Transport`] on write failure.
    pub async fn set_usb_charger(&self, enabled: bool) -> Result<()> {
        self.ensure_ready().await?;
        self.write_mmr(mmr::USB_CHARGER, &protocol::usb_charger_body(enabled))
            .await?;
        self.snapshot.write().await.usb_charger_on = enabled;
        Ok(())
    }

    /// Set the fan threshold via MMR and update the cache.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] outside `Ready`,
    /// [`BridgeError::Transport`] on write failure.
    pub async fn set_fan_threshold(&self, celsius: u8) -> Result<()> {
        self.ensure_ready().await?;
        self.write_mmr(mmr::FAN_THRESHOLD, &protocol::fan_threshold_body(celsius))
            .await?;
        self.snapshot.write().await.fan_threshold_c = celsius;
        Ok(())
    }

    /// Request an MMR read; the reply surfaces later as
    /// [`De1Event::MmrRead`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] outside `Ready`,
    /// [`BridgeError::Transport`] on write failure.
    pub async fn read_mmr(&self, address: u32) -> Result<()> {
        self.ensure_ready().await?;
        self.link
            .write(
                characteristic::READ_FROM_MMR,
                &protocol::mmr_read_request(address),
                true,
            )
            .await
    }

    async fn write_mmr(&self, address: u32, body: &[u8]) -> Result<()> {
        self.link
            .write(
                characteristic::WRITE_TO_MMR,
                &protocol::mmr_write_request(address, body),
                true,
            )
            .await
    }

    async fn ensure_ready(&self) -> Result<()> {
        if *self.state.read().await == SessionState::Ready {
            Ok(())
        } else {
            Err(BridgeError::NotReady)
        }
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    async fn fail(&self, error: &BridgeError) {
        warn!(address = %self.address, %error, "DE1 session failed");
        self.set_state(SessionState::Failed).await;
        let _ = self.events.send(SessionEvent::Failed {
            role: DeviceRole::De1,
            address: self.address.clone(),
            reason: error.to_string(),
        });
    }

    async fn run(self: Arc<Self>) {
        self.set_state(SessionState::Connecting).await;
        info!(address = %self.address, name = %self.name, "connecting to DE1");

        match timeout(CONNECT_TIMEOUT, self.link.connect()).await {
            Err(_) => {
                self.fail(&BridgeError::Timeout {
                    budget_ms: CONNECT_TIMEOUT.as_millis() as u64,
                })
                .await;
                return;
            }
            Ok(Err(error)) => {
                self.fail(&error).await;
                return;
            }
            Ok(Ok(())) => {}
        }

        self.set_state(SessionState::ServicesDiscovering).await;
        if let Err(error) = self.link.discover_services().await {
            self.fail(&error).await;
            return;
        }
        if !self.link.service_uuids().await.contains(&DE1_SERVICE_UUID) {
            self.fail(&BridgeError::ServiceMissing(DE1_SERVICE_UUID)).await;
            return;
        }

        // Open the stream before enabling notifications so nothing is lost
        // between the CCCD write and the first poll.
        let mut notifications = match self.link.notifications().await {
            Ok(stream) => stream,
            Err(error) => {
                self.fail(&error).await;
                return;
            }
        };

        for uuid in [
            characteristic::STATE_INFO,
            characteristic::SHOT_SAMPLE,
            characteristic::WATER_LEVELS,
            characteristic::TEMPERATURES,
            characteristic::SHOT_SETTINGS,
            characteristic::READ_FROM_MMR,
        ] {
            if let Err(error) = self.link.subscribe(uuid).await {
                self.fail(&error).await;
                return;
            }
        }

        // Initial reads resolve through the same parsers as notifications.
        for uuid in [
            characteristic::STATE_INFO,
            characteristic::VERSION,
            characteristic::WATER_LEVELS,
            characteristic::SHOT_SETTINGS,
        ] {
            match self.link.read(uuid).await {
                Ok(data) => self.handle_payload(uuid, &data).await,
                Err(error) => warn!(%uuid, %error, "initial read failed"),
            }
        }

        // GHC presence lives behind an MMR; the reply arrives by
        // notification on READ_FROM_MMR.
        if let Err(error) = self
            .link
            .write(
                characteristic::READ_FROM_MMR,
                &protocol::mmr_read_request(mmr::GHC_INFO),
                true,
            )
            .await
        {
            warn!(%error, "GHC info request failed");
        }

        self.set_state(SessionState::Ready).await;
        info!(address = %self.address, "DE1 ready");
        let _ = self.events.send(SessionEvent::Connected {
            role: DeviceRole::De1,
            address: self.address.clone(),
        });

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                notification = notifications.next() => match notification {
                    Some(LinkNotification { uuid, value }) => {
                        self.handle_payload(uuid, &value).await;
                    }
                    None => break,
                },
            }
        }

        if *self.state.read().await != SessionState::Failed {
            self.set_state(SessionState::Disconnected).await;
        }
        let _ = self.link.disconnect().await;
        info!(address = %self.address, "DE1 session ended");
        let _ = self.events.send(SessionEvent::Disconnected {
            role: DeviceRole::De1,
            address: self.address.clone(),
        });
    }

    async fn handle_payload(&self, uuid: Uuid, data: &[u8]) {
        let result = match uuid {
            u if u == characteristic::STATE_INFO => self.handle_state_info(data).await,
            u if u == characteristic::SHOT_SAMPLE => self.handle_shot_sample(data).await,
            u if u == characteristic::WATER_LEVELS => self.handle_water_levels(data).await,
            u if u == characteristic::SHOT_SETTINGS => self.handle_shot_settings(data).await,
            u if u == characteristic::VERSION => self.handle_version(data).await,
            u if u == characteristic::READ_FROM_MMR => self.handle_mmr_read(data).await,
            u if u == characteristic::TEMPERATURES => Ok(()),
            _ => Ok(()),
        };

        // Parse errors never tear the session down.
        if let Err(error) = result {
            warn!(%uuid, %error, "dropping unparseable payload");
        }
    }

    async fn handle_state_info(&self, data: &[u8]) -> Result<()> {
        let (state, substate) = protocol::parse_state_info(data)?;
        {
            let mut snapshot = self.snapshot.write().await;
            if snapshot.state != state {
                info!(
                    state = state.as_str(),
                    substate = %substate.as_str(),
                    "machine state changed"
                );
            }
            snapshot.state = state;
            snapshot.substate = substate;
        }
        let _ = self
            .events
            .send(SessionEvent::De1(De1Event::StateChange { state, substate }));
        Ok(())
    }

    async fn handle_shot_sample(&self, data: &[u8]) -> Result<()> {
        let sample = protocol::parse_shot_sample(data)?;
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.pressure = sample.group_pressure;
            snapshot.flow = sample.group_flow;
            snapshot.mix_temp = sample.mix_temp;
            snapshot.head_temp = sample.head_temp;
            snapshot.steam_temp = sample.steam_temp;
            snapshot.target_pressure = sample.set_pressure;
            snapshot.target_flow = sample.set_flow;
            snapshot.frame_number = sample.frame_number;
        }
        let _ = self
            .events
            .send(SessionEvent::De1(De1Event::ShotSample(sample)));
        Ok(())
    }

    async fn handle_water_levels(&self, data: &[u8]) -> Result<()> {
        let levels = protocol::parse_water_levels(data)?;
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.water_level_mm = levels.current_mm;
            snapshot.water_start_level_mm = levels.start_mm;
        }
        let _ = self
            .events
            .send(SessionEvent::De1(De1Event::WaterLevels(levels)));
        Ok(())
    }

    async fn handle_shot_settings(&self, data: &[u8]) -> Result<()> {
        let settings = protocol::parse_shot_settings(data)?;
        self.snapshot.write().await.shot_settings = settings;
        let _ = self
            .events
            .send(SessionEvent::De1(De1Event::ShotSettings(settings)));
        Ok(())
    }

    async fn handle_version(&self, data: &[u8]) -> Result<()> {
        let version = protocol::parse_version(data)?;
        info!(firmware = %version.firmware_string(), build = version.build, "firmware version");
        self.snapshot.write().await.firmware = Some(version.clone());
        let _ = self
            .events
            .send(SessionEvent::De1(De1Event::Version(version)));
        Ok(())
    }

    async fn handle_mmr_read(&self, data: &[u8]) -> Result<()> {
        let read = protocol::parse_mmr_read(data)?;
        if read.address == mmr::GHC_INFO {
            let has_ghc = read.data.first().copied().unwrap_or(0) != 0;
            self.snapshot.write().await.has_ghc = has_ghc;
            debug!(has_ghc, "GHC info read");
        }
        let _ = self.events.send(SessionEvent::De1(De1Event::MmrRead(read)));
        Ok(())
    }
}

/// Session for a weighing scale, generic over the vendor dialect.
pub struct ScaleSession {
    address: String,
    name: String,
    kind: ScaleKind,
    link: Arc<dyn BleLink>,
    adapter: Mutex<Box<dyn ScaleAdapter>>,
    state: RwLock<SessionState>,
    snapshot: RwLock<ScaleSnapshot>,
    estimator: Mutex<FlowEstimator>,
    native_flow: AtomicBool,
    started_at: Instant,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl ScaleSession {
    /// Create the session and start its connection task.
    pub fn spawn(
        address: String,
        name: String,
        adapter: Box<dyn ScaleAdapter>,
        link: Arc<dyn BleLink>,
        flow_multiplier: f64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let kind = adapter.kind();
        let session = Arc::new(Self {
            address,
            name,
            kind,
            link,
            adapter: Mutex::new(adapter),
            state: RwLock::new(SessionState::Idle),
            snapshot: RwLock::new(ScaleSnapshot::default()),
            estimator: Mutex::new(FlowEstimator::new(flow_multiplier)),
            native_flow: AtomicBool::new(false),
            started_at: Instant::now(),
            events,
            cancel: CancellationToken::new(),
        });

        let runner = Arc::clone(&session);
        tokio::spawn(async move {
            runner.run().await;
        });

        session
    }

    /// Peripheral address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vendor family
    #[must_use]
    pub const fn kind(&self) -> ScaleKind {
        self.kind
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// How long this session object has existed; the bridge uses this to
    /// abandon attempts stuck in `Connecting`.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Copy of the scale snapshot
    pub async fn snapshot(&self) -> ScaleSnapshot {
        *self.snapshot.read().await
    }

    /// Tear the session down. Terminal.
    pub async fn disconnect(&self) {
        self.set_state(SessionState::Disconnected).await;
        self.cancel.cancel();
        let _ = self.link.disconnect().await;
    }

    /// Send the vendor tare command and zero the derived-flow estimate.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotReady`] outside `Ready`,
    /// [`BridgeError::Transport`] on write failure.
    pub async fn tare(&self) -> Result<()> {
        if *self.state.read().await != SessionState::Ready {
            return Err(BridgeError::NotReady);
        }
        let (uuid, payload) = self.adapter.lock().await.tare_command();
        self.link.write(uuid, &payload, false).await?;
        self.estimator.lock().await.reset();
        info!(address = %self.address, "scale tared");
        Ok(())
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    async fn fail(&self, error: &BridgeError) {
        warn!(address = %self.address, %error, "scale session failed");
        self.set_state(SessionState::Failed).await;
        let _ = self.events.send(SessionEvent::Failed {
            role: DeviceRole::Scale,
            address: self.address.clone(),
            reason: error.to_string(),
        });
    }

    async fn run(self: Arc<Self>) {
        self.set_state(SessionState::Connecting).await;
        info!(address = %self.address, name = %self.name, kind = self.kind.as_str(), "connecting to scale");

        match timeout(CONNECT_TIMEOUT, self.link.connect()).await {
            Err(_) => {
                self.fail(&BridgeError::Timeout {
                    budget_ms: CONNECT_TIMEOUT.as_millis() as u64,
                })
                .await;
                return;
            }
            Ok(Err(error)) => {
                self.fail(&error).await;
                return;
            }
            Ok(Ok(())) => {}
        }

        self.set_state(SessionState::ServicesDiscovering).await;
        if let Err(error) = self.link.discover_services().await {
            self.fail(&error).await;
            return;
        }

        let (service, subscriptions) = {
            let adapter = self.adapter.lock().await;
            (adapter.primary_service_uuid(), adapter.subscription_uuids())
        };
        if !self.link.service_uuids().await.contains(&service) {
            self.fail(&BridgeError::ServiceMissing(service)).await;
            return;
        }

        let mut notifications = match self.link.notifications().await {
            Ok(stream) => stream,
            Err(error) => {
                self.fail(&error).await;
                return;
            }
        };

        for uuid in subscriptions {
            if let Err(error) = self.link.subscribe(uuid).await {
                self.fail(&error).await;
                return;
            }
        }

        self.set_state(SessionState::Ready).await;
        info!(address = %self.address, "scale ready");
        let _ = self.events.send(SessionEvent::Connected {
            role: DeviceRole::Scale,
            address: self.address.clone(),
        });

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                notification = notifications.next() => match notification {
                    Some(LinkNotification { uuid, value }) => {
                        self.handle_notification(uuid, &value).await;
                    }
                    None => break,
                },
            }
        }

        if *self.state.read().await != SessionState::Failed {
            self.set_state(SessionState::Disconnected).await;
        }
        let _ = self.link.disconnect().await;
        info!(address = %self.address, "scale session ended");
        let _ = self.events.send(SessionEvent::Disconnected {
            role: DeviceRole::Scale,
            address: self.address.clone(),
        });
    }

    async fn handle_notification(&self, uuid: Uuid, data: &[u8]) {
        let events = self.adapter.lock().await.parse_notification(uuid, data);
        let mut changed = false;

        for event in events {
            match event {
                ScaleEvent::Weight { grams } => {
                    let derived = self
                        .estimator
                        .lock()
                        .await
                        .update(grams, Instant::now());
                    let mut snapshot = self.snapshot.write().await;
                    snapshot.weight_g = grams;
                    if !self.native_flow.load(Ordering::Relaxed) {
                        snapshot.flow_g_s = derived;
                    }
                    snapshot.timestamp_ms = now_ms();
                    changed = true;
                }
                ScaleEvent::Flow { grams_per_s } => {
                    self.native_flow.store(true, Ordering::Relaxed);
                    let mut snapshot = self.snapshot.write().await;
                    snapshot.flow_g_s = grams_per_s;
                    snapshot.timestamp_ms = now_ms();
                    changed = true;
                }
                ScaleEvent::Battery { percent } => {
                    self.snapshot.write().await.battery_pct = Some(percent);
                }
                ScaleEvent::Button { id } => {
                    let _ = self.events.send(SessionEvent::ScaleButton { id });
                }
                ScaleEvent::Ignored => {}
            }
        }

        if changed {
            let snapshot = *self.snapshot.read().await;
            let _ = self.events.send(SessionEvent::Scale(snapshot));
        }
    }
}

/// Session for an auxiliary sensor.
pub struct SensorSession {
    id: String,
    address: String,
    name: String,
    kind: SensorKind,
    link: Arc<dyn BleLink>,
    adapter: Mutex<Box<dyn SensorAdapter>>,
    state: RwLock<SessionState>,
    channels: RwLock<BTreeMap<String, f64>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

impl SensorSession {
    /// Create the session and start its connection task.
    pub fn spawn(
        address: String,
        name: String,
        adapter: Box<dyn SensorAdapter>,
        link: Arc<dyn BleLink>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let kind = adapter.kind();
        let id = sensor_id(kind, &address);
        let channels = adapter
            .channels()
            .into_iter()
            .map(|c| (c.key.to_string(), 0.0))
            .collect();

        let session = Arc::new(Self {
            id,
            address,
            name,
            kind,
            link,
            adapter: Mutex::new(adapter),
            state: RwLock::new(SessionState::Idle),
            channels: RwLock::new(channels),
            events,
            cancel: CancellationToken::new(),
        });

        let runner = Arc::clone(&session);
        tokio::spawn(async move {
            runner.run().await;
        });

        session
    }

    /// Stable sensor id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peripheral address
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Advertised device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sensor family
    #[must_use]
    pub const fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Channel descriptions, for the REST surface
    pub async fn channel_specs(&self) -> Vec<crate::sensor::ChannelSpec> {
        self.adapter.lock().await.channels()
    }

    /// Copy of the latest channel values
    pub async fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            id: self.id.clone(),
            channels: self.channels.read().await.clone(),
            timestamp_ms: now_ms(),
        }
    }

    /// Tear the session down. Terminal.
    pub async fn disconnect(&self) {
        self.set_state(SessionState::Disconnected).await;
        self.cancel.cancel();
        let _ = self.link.disconnect().await;
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    async fn fail(&self, error: &BridgeError) {
        warn!(address = %self.address, %error, "sensor session failed");
        self.set_state(SessionState::Failed).await;
        let _ = self.events.send(SessionEvent::Failed {
            role: DeviceRole::Sensor,
            address: self.address.clone(),
            reason: error.to_string(),
        });
    }

    async fn run(self: Arc<Self>) {
        self.set_state(SessionState::Connecting).await;
        info!(address = %self.address, id = %self.id, "connecting to sensor");

        match timeout(CONNECT_TIMEOUT, self.link.connect()).await {
            Err(_) => {
                self.fail(&BridgeError::Timeout {
                    budget_ms: CONNECT_TIMEOUT.as_millis() as u64,
                })
                .await;
                return;
            }
            Ok(Err(error)) => {
                self.fail(&error).await;
                return;
            }
            Ok(Ok(())) => {}
        }

        self.set_state(SessionState::ServicesDiscovering).await;
        if let Err(error) = self.link.discover_services().await {
            self.fail(&error).await;
            return;
        }

        let (service, subscriptions) = {
            let adapter = self.adapter.lock().await;
            (adapter.primary_service_uuid(), adapter.subscription_uuids())
        };
        if !self.link.service_uuids().await.contains(&service) {
            self.fail(&BridgeError::ServiceMissing(service)).await;
            return;
        }

        let mut notifications = match self.link.notifications().await {
            Ok(stream) => stream,
            Err(error) => {
                self.fail(&error).await;
                return;
            }
        };

        for uuid in subscriptions {
            if let Err(error) = self.link.subscribe(uuid).await {
                self.fail(&error).await;
                return;
            }
        }

        self.set_state(SessionState::Ready).await;
        info!(id = %self.id, "sensor ready");
        let _ = self.events.send(SessionEvent::Connected {
            role: DeviceRole::Sensor,
            address: self.address.clone(),
        });

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                notification = notifications.next() => match notification {
                    Some(LinkNotification { uuid, value }) => {
                        self.handle_notification(uuid, &value).await;
                    }
                    None => break,
                },
            }
        }

        if *self.state.read().await != SessionState::Failed {
            self.set_state(SessionState::Disconnected).await;
        }
        let _ = self.link.disconnect().await;
        info!(id = %self.id, "sensor session ended");
        let _ = self.events.send(SessionEvent::Disconnected {
            role: DeviceRole::Sensor,
            address: self.address.clone(),
        });
    }

    async fn handle_notification(&self, uuid: Uuid, data: &[u8]) {
        let updates = self.adapter.lock().await.parse_notification(uuid, data);
        if updates.is_empty() {
            return;
        }
        {
            let mut channels = self.channels.write().await;
            for (key, value) in &updates {
                channels.insert((*key).to_string(), *value);
            }
        }
        let _ = self.events.send(SessionEvent::Sensor(self.snapshot().await));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BleLink;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::sync::Mutex as StdMutex;

    /// How the fake link answers `connect()`.
    enum ConnectScript {
        Succeed,
        Hang,
    }

    struct FakeLink {
        connect: ConnectScript,
        services: Vec<Uuid>,
        reads: StdMutex<std::collections::HashMap<Uuid, Vec<u8>>>,
        writes: StdMutex<Vec<(Uuid, Vec<u8>)>>,
        subscriptions: StdMutex<Vec<Uuid>>,
        notify_rx: StdMutex<Option<mpsc::UnboundedReceiver<LinkNotification>>>,
    }

    impl FakeLink {
        fn new(
            connect: ConnectScript,
            services: Vec<Uuid>,
        ) -> (Arc<Self>, mpsc::UnboundedSender<LinkNotification>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let link = Arc::new(Self {
                connect,
                services,
                reads: StdMutex::new(std::collections::HashMap::new()),
                writes: StdMutex::new(Vec::new()),
                subscriptions: StdMutex::new(Vec::new()),
                notify_rx: StdMutex::new(Some(rx)),
            });
            (link, tx)
        }

        fn stub_read(&self, uuid: Uuid, data: Vec<u8>) {
            self.reads.lock().unwrap().insert(uuid, data);
        }

        fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
            self.writes.lock().unwrap().clone()
        }

        fn subscriptions(&self) -> Vec<Uuid> {
            self.subscriptions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BleLink for FakeLink {
        async fn connect(&self) -> Result<()> {
            match self.connect {
                ConnectScript::Succeed => Ok(()),
                ConnectScript::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn discover_services(&self) -> Result<()> {
            Ok(())
        }

        async fn service_uuids(&self) -> Vec<Uuid> {
            self.services.clone()
        }

        async fn subscribe(&self, uuid: Uuid) -> Result<()> {
            self.subscriptions.lock().unwrap().push(uuid);
            Ok(())
        }

        async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
            self.reads
                .lock()
                .unwrap()
                .get(&uuid)
                .cloned()
                .ok_or(BridgeError::ServiceMissing(uuid))
        }

        async fn write(&self, uuid: Uuid, data: &[u8], _with_response: bool) -> Result<()> {
            self.writes.lock().unwrap().push((uuid, data.to_vec()));
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn notifications(&self) -> Result<BoxStream<'static, LinkNotification>> {
            let rx = self
                .notify_rx
                .lock()
                .unwrap()
                .take()
                .expect("notifications requested twice");
            Ok(Box::pin(
                tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
            ))
        }
    }

    fn de1_fake() -> (Arc<FakeLink>, mpsc::UnboundedSender<LinkNotification>) {
        let (link, tx) = FakeLink::new(ConnectScript::Succeed, vec![DE1_SERVICE_UUID]);
        link.stub_read(characteristic::STATE_INFO, vec![0x02, 0x00]);
        link.stub_read(
            characteristic::VERSION,
            vec![0x04, 0x01, 0x03, 0x00, 0x00, 0x04, 0xD2],
        );
        link.stub_read(characteristic::WATER_LEVELS, vec![0x00, 0x32, 0x00, 0x5A]);
        link.stub_read(
            characteristic::SHOT_SETTINGS,
            protocol::shot_settings_payload(&ShotSettings::default()),
        );
        (link, tx)
    }

    async fn spawn_ready_de1(
        link: Arc<FakeLink>,
    ) -> (Arc<De1Session>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = De1Session::spawn(
            "AA:BB:CC:DD:EE:FF".to_string(),
            "DE1PRO".to_string(),
            link,
            events_tx,
        );

        // Drain until the Connected event confirms Ready.
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
                Ok(Some(SessionEvent::Connected { .. })) => break,
                Ok(Some(_)) => {}
                _ => panic!("session never reached Ready"),
            }
        }
        (session, events_rx)
    }

    #[tokio::test]
    async fn test_de1_session_reaches_ready_and_issues_initial_io() {
        let (link, _notify) = de1_fake();
        let (session, _events) = spawn_ready_de1(link.clone()).await;

        assert_eq!(session.state().await, SessionState::Ready);

        let subscriptions = link.subscriptions();
        for uuid in [
            characteristic::STATE_INFO,
            characteristic::SHOT_SAMPLE,
            characteristic::WATER_LEVELS,
            characteristic::TEMPERATURES,
            characteristic::SHOT_SETTINGS,
        ] {
            assert!(subscriptions.contains(&uuid), "missing subscription {uuid}");
        }

        // The GHC info request went out over READ_FROM_MMR.
        let writes = link.writes();
        assert!(writes
            .iter()
            .any(|(uuid, data)| *uuid == characteristic::READ_FROM_MMR
                && data == &protocol::mmr_read_request(mmr::GHC_INFO)));

        // Initial reads populated the snapshot.
        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.state, State::Idle);
        assert_eq!(snapshot.water_level_mm, 50);
        assert_eq!(
            snapshot.firmware.as_ref().map(Version::firmware_string),
            Some("1.3".to_string())
        );
    }

    #[tokio::test]
    async fn test_de1_shot_sample_notification_updates_snapshot() {
        let (link, notify) = de1_fake();
        let (session, mut events) = spawn_ready_de1(link).await;

        notify
            .send(LinkNotification {
                uuid: characteristic::SHOT_SAMPLE,
                value: vec![
                    0x00, 0x64, 0x50, 0x20, 0xA4, 0x3C, 0x00, 0x00, 0x48, 0x18, 0x02, 0x5E, 0x00,
                    0x00, 0x00,
                ],
            })
            .unwrap();

        let event = loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(SessionEvent::De1(De1Event::ShotSample(sample)))) => break sample,
                Ok(Some(_)) => {}
                _ => panic!("no shot sample event"),
            }
        };
        assert!((event.group_pressure - 5.0).abs() < f64::EPSILON);

        let snapshot = session.snapshot().await;
        assert!((snapshot.pressure - 5.0).abs() < f64::EPSILON);
        assert!((snapshot.head_temp - 76.75).abs() < f64::EPSILON);
        assert_eq!(snapshot.frame_number, 2);
    }

    #[tokio::test]
    async fn test_de1_garbage_notification_keeps_session_alive() {
        let (link, notify) = de1_fake();
        let (session, _events) = spawn_ready_de1(link).await;

        notify
            .send(LinkNotification {
                uuid: characteristic::SHOT_SAMPLE,
                value: vec![0x01, 0x02],
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn test_commands_fail_before_ready() {
        let (link, _tx) = FakeLink::new(ConnectScript::Hang, vec![DE1_SERVICE_UUID]);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let session = De1Session::spawn(
            "AA:BB:CC:DD:EE:FF".to_string(),
            "DE1".to_string(),
            link,
            events_tx,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.state().await, SessionState::Connecting);
        assert!(matches!(
            session.request_state(State::Espresso).await,
            Err(BridgeError::NotReady)
        ));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_commands_fail_after_disconnect() {
        let (link, _notify) = de1_fake();
        let (session, _events) = spawn_ready_de1(link).await;

        session.disconnect().await;
        assert!(matches!(
            session.request_state(State::Idle).await,
            Err(BridgeError::NotReady)
        ));
        assert!(matches!(
            session
                .set_shot_settings(ShotSettings::default())
                .await,
            Err(BridgeError::NotReady)
        ));
    }

    #[tokio::test]
    async fn test_de1_missing_service_fails_session() {
        let (link, _tx) = FakeLink::new(ConnectScript::Succeed, vec![]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = De1Session::spawn(
            "AA:BB:CC:DD:EE:FF".to_string(),
            "NotADE1".to_string(),
            link,
            events_tx,
        );

        match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
            Ok(Some(SessionEvent::Failed { role, .. })) => assert_eq!(role, DeviceRole::De1),
            other => panic!("expected Failed event, got {other:?}"),
        }
        assert_eq!(session.state().await, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_state_request_writes_one_byte() {
        let (link, _notify) = de1_fake();
        let (session, _events) = spawn_ready_de1(link.clone()).await;

        session.request_state_by_alias("espresso").await.unwrap();

        let writes = link.writes();
        let (uuid, data) = writes.last().unwrap();
        assert_eq!(*uuid, characteristic::REQUESTED_STATE);
        assert_eq!(data, &vec![0x04]);
    }

    #[tokio::test]
    async fn test_invalid_state_alias_is_bad_request() {
        let (link, _notify) = de1_fake();
        let (session, _events) = spawn_ready_de1(link).await;
        assert!(matches!(
            session.request_state_by_alias("warp9").await,
            Err(BridgeError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_profile_upload_writes_header_then_frames() {
        let (link, _notify) = de1_fake();
        let (session, _events) = spawn_ready_de1(link.clone()).await;

        let profile: Profile = serde_json::from_str(
            r#"{"target_volume": 36, "steps": [
                {"pump": "flow", "transition": "smooth", "flow": 2.0,
                 "temperature": 93.0, "seconds": 30.0}
            ]}"#,
        )
        .unwrap();

        session.upload_profile(&profile).await.unwrap();

        let writes = link.writes();
        let header = writes
            .iter()
            .find(|(uuid, _)| *uuid == characteristic::HEADER_WRITE)
            .expect("no header write");
        assert_eq!(&header.1[..4], &[0x01, 0x01, 0x00, 0x24]);

        let frame = writes
            .iter()
            .find(|(uuid, _)| *uuid == characteristic::FRAME_WRITE)
            .expect("no frame write");
        assert_eq!(frame.1, vec![0x00, 0x30, 0x00, 0x20, 0xBA, 0x1E, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_fan_threshold_command_payload() {
        let (link, _notify) = de1_fake();
        let (session, _events) = spawn_ready_de1(link.clone()).await;

        session.set_fan_threshold(55).await.unwrap();

        let writes = link.writes();
        let (uuid, data) = writes.last().unwrap();
        assert_eq!(*uuid, characteristic::WRITE_TO_MMR);
        assert_eq!(data, &vec![0x04, 0x80, 0x38, 0x08, 0x37, 0x00, 0x00, 0x00]);
        assert_eq!(session.snapshot().await.fan_threshold_c, 55);
    }

    #[tokio::test]
    async fn test_ghc_reply_sets_snapshot_flag() {
        let (link, notify) = de1_fake();
        let (session, mut events) = spawn_ready_de1(link).await;

        notify
            .send(LinkNotification {
                uuid: characteristic::READ_FROM_MMR,
                value: vec![0x04, 0x80, 0x38, 0x1C, 0x01, 0x00, 0x00, 0x00],
            })
            .unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(SessionEvent::De1(De1Event::MmrRead(read)))) => {
                    assert_eq!(read.address, mmr::GHC_INFO);
                    break;
                }
                Ok(Some(_)) => {}
                _ => panic!("no MMR read event"),
            }
        }
        assert!(session.snapshot().await.has_ghc);
    }

    fn bookoo_frame(weight_cg: u32, flow_cg_s: u16, battery: u8) -> Vec<u8> {
        let mut data = vec![0u8; 20];
        data[0] = 0x03;
        data[1] = 0x0B;
        data[6] = 0x2B;
        data[7] = ((weight_cg >> 16) & 0xFF) as u8;
        data[8] = ((weight_cg >> 8) & 0xFF) as u8;
        data[9] = (weight_cg & 0xFF) as u8;
        data[10] = 0x2B;
        data[11] = (flow_cg_s >> 8) as u8;
        data[12] = (flow_cg_s & 0xFF) as u8;
        data[13] = battery;
        data[19] = data[..19].iter().fold(0, |acc, &b| acc ^ b);
        data
    }

    #[tokio::test]
    async fn test_scale_session_streams_snapshots() {
        let bookoo = crate::scale::BookooScale::new();
        let service = crate::scale::ScaleAdapter::primary_service_uuid(&bookoo);
        let weight_char = crate::scale::ScaleAdapter::subscription_uuids(&bookoo)[0];

        let (link, notify) = FakeLink::new(ConnectScript::Succeed, vec![service]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = ScaleSession::spawn(
            "11:22:33:44:55:66".to_string(),
            "BOOKOO_SC".to_string(),
            Box::new(bookoo),
            link.clone(),
            1.0,
            events_tx,
        );

        loop {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
                Ok(Some(SessionEvent::Connected { role, .. })) => {
                    assert_eq!(role, DeviceRole::Scale);
                    break;
                }
                Ok(Some(_)) => {}
                _ => panic!("scale never connected"),
            }
        }

        notify
            .send(LinkNotification {
                uuid: weight_char,
                value: bookoo_frame(1850, 210, 87),
            })
            .unwrap();

        let snapshot = loop {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
                Ok(Some(SessionEvent::Scale(snapshot))) => break snapshot,
                Ok(Some(_)) => {}
                _ => panic!("no scale snapshot event"),
            }
        };
        assert!((snapshot.weight_g - 18.5).abs() < f64::EPSILON);
        // Bookoo reports native flow; the derived estimate must not
        // overwrite it.
        assert!((snapshot.flow_g_s - 2.1).abs() < f64::EPSILON);
        assert_eq!(snapshot.battery_pct, Some(87));
        assert_eq!(session.snapshot().await.battery_pct, Some(87));
    }

    #[tokio::test]
    async fn test_scale_tare_writes_vendor_command() {
        let bookoo = crate::scale::BookooScale::new();
        let service = crate::scale::ScaleAdapter::primary_service_uuid(&bookoo);

        let (link, _notify) = FakeLink::new(ConnectScript::Succeed, vec![service]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = ScaleSession::spawn(
            "11:22:33:44:55:66".to_string(),
            "BOOKOO_SC".to_string(),
            Box::new(bookoo),
            link.clone(),
            1.0,
            events_tx,
        );

        loop {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
                Ok(Some(SessionEvent::Connected { .. })) => break,
                Ok(Some(_)) => {}
                _ => panic!("scale never connected"),
            }
        }

        session.tare().await.unwrap();
        let writes = link.writes();
        let (_, data) = writes.last().unwrap();
        assert_eq!(data, &vec![0x03, 0x0A, 0x01, 0x00, 0x00, 0x08]);
    }

    #[tokio::test]
    async fn test_sensor_session_publishes_channel_values() {
        let monitor = crate::sensor::BookooMonitor::new();
        let service = crate::sensor::SensorAdapter::primary_service_uuid(&monitor);
        let notify_char = crate::sensor::SensorAdapter::subscription_uuids(&monitor)[0];

        let (link, notify) = FakeLink::new(ConnectScript::Succeed, vec![service]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = SensorSession::spawn(
            "AA:00:BB:11:CC:22".to_string(),
            "BOOKOO_EM_01".to_string(),
            Box::new(monitor),
            link,
            events_tx,
        );
        assert_eq!(session.id(), "bookoomonitor_aa00bb11cc22");

        loop {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
                Ok(Some(SessionEvent::Connected { role, .. })) => {
                    assert_eq!(role, DeviceRole::Sensor);
                    break;
                }
                Ok(Some(_)) => {}
                _ => panic!("sensor never connected"),
            }
        }

        notify
            .send(LinkNotification {
                uuid: notify_char,
                value: vec![0x00, 0x5C],
            })
            .unwrap();

        let snapshot = loop {
            match tokio::time::timeout(Duration::from_secs(1), events_rx.recv()).await {
                Ok(Some(SessionEvent::Sensor(snapshot))) => break snapshot,
                Ok(Some(_)) => {}
                _ => panic!("no sensor snapshot event"),
            }
        };
        assert_eq!(snapshot.channels.get("pressure"), Some(&9.2));
    }
}
