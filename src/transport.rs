//! BLE central abstraction.
//!
//! Sessions never touch `btleplug` directly: they speak to a [`BleLink`],
//! an object-safe view of one connected peripheral. That keeps the whole
//! state machine testable against a scripted in-memory link, and confines
//! the platform BLE stack to this module.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// A discovery record built from one advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Peripheral address, colon-separated hex on most platforms
    pub address: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// Signal strength at discovery time
    pub rssi: Option<i16>,
}

/// One value notification delivered by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkNotification {
    /// Characteristic the value arrived on
    pub uuid: Uuid,
    /// Raw payload
    pub value: Vec<u8>,
}

/// Minimal surface of a connected BLE peripheral.
///
/// Implemented by [`PeripheralLink`] for real hardware and by scripted
/// fakes in tests.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Establish the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the platform stack refuses.
    async fn connect(&self) -> Result<()>;

    /// Run GATT service discovery.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] on failure.
    async fn discover_services(&self) -> Result<()>;

    /// Service UUIDs known after discovery
    async fn service_uuids(&self) -> Vec<Uuid>;

    /// Enable notifications on a characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ServiceMissing`] if the characteristic is
    /// absent, [`BridgeError::Transport`] on stack failure.
    async fn subscribe(&self, uuid: Uuid) -> Result<()>;

    /// Read a characteristic value.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ServiceMissing`] if the characteristic is
    /// absent, [`BridgeError::Transport`] on stack failure.
    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ServiceMissing`] if the characteristic is
    /// absent, [`BridgeError::Transport`] on stack failure.
    async fn write(&self, uuid: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Tear the connection down.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] on stack failure.
    async fn disconnect(&self) -> Result<()>;

    /// Stream of value notifications for the life of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the stream cannot be opened.
    async fn notifications(&self) -> Result<BoxStream<'static, LinkNotification>>;
}

/// [`BleLink`] over a real `btleplug` peripheral.
pub struct PeripheralLink {
    peripheral: Peripheral,
}

impl PeripheralLink {
    /// Wrap a peripheral handle
    #[must_use]
    pub const fn new(peripheral: Peripheral) -> Self {
        Self { peripheral }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<btleplug::api::Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BridgeError::ServiceMissing(uuid))
    }
}

#[async_trait]
impl BleLink for PeripheralLink {
    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.peripheral.discover_services().await?;
        Ok(())
    }

    async fn service_uuids(&self) -> Vec<Uuid> {
        self.peripheral.services().iter().map(|s| s.uuid).collect()
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn write(&self, uuid: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, data, write_type)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, LinkNotification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| LinkNotification {
                uuid: n.uuid,
                value: n.value,
            })
            .boxed())
    }
}

/// The process-global BLE central: scanning and peripheral lookup.
///
/// At most one scan runs at a time; `start`/`stop` are serialised through
/// internal state so racing callers cannot double-start the radio.
pub struct BleScanner {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    scanning: Arc<Mutex<bool>>,
}

impl BleScanner {
    /// Initialise the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotFound`] when no adapter exists and
    /// [`BridgeError::Transport`] for stack failures.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| BridgeError::NotFound("no Bluetooth adapter".to_string()))?;

        info!(
            adapter = %adapter.adapter_info().await.unwrap_or_else(|_| "unknown".to_string()),
            "using Bluetooth adapter"
        );

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scanning: Arc::new(Mutex::new(false)),
        })
    }

    /// Start scanning for advertisements. A no-op if already scanning.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the radio refuses.
    pub async fn start(&self) -> Result<()> {
        let mut scanning = self.scanning.lock().await;
        if *scanning {
            return Ok(());
        }
        self.adapter.start_scan(ScanFilter::default()).await?;
        *scanning = true;
        info!("BLE scan started");
        Ok(())
    }

    /// Stop scanning. A no-op if not scanning.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the radio refuses.
    pub async fn stop(&self) -> Result<()> {
        let mut scanning = self.scanning.lock().await;
        if !*scanning {
            return Ok(());
        }
        if let Err(error) = self.adapter.stop_scan().await {
            warn!(%error, "failed to stop scan cleanly");
        }
        *scanning = false;
        info!("BLE scan stopped");
        Ok(())
    }

    /// Whether a scan is currently active
    pub async fn is_scanning(&self) -> bool {
        *self.scanning.lock().await
    }

    /// Stream of advertisements from the central event bus.
    ///
    /// Each discovered or updated peripheral is cached by address so a
    /// later [`Self::link`] call can connect to it.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the event stream cannot be
    /// opened.
    pub async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok().flatten()?;
                let address = properties.address.to_string();
                peripherals.lock().await.insert(address.clone(), peripheral);
                debug!(%address, name = ?properties.local_name, "advertisement");
                Some(Advertisement {
                    address,
                    name: properties.local_name,
                    service_uuids: properties.services,
                    rssi: properties.rssi,
                })
            }
        });

        Ok(stream.boxed())
    }

    /// Snapshot of every peripheral seen so far, as advertisements.
    pub async fn discovered(&self) -> Vec<Advertisement> {
        let peripherals = self.peripherals.lock().await;
        let mut result = Vec::with_capacity(peripherals.len());
        for (address, peripheral) in peripherals.iter() {
            if let Ok(Some(properties)) = peripheral.properties().await {
                result.push(Advertisement {
                    address: address.clone(),
                    name: properties.local_name,
                    service_uuids: properties.services,
                    rssi: properties.rssi,
                });
            }
        }
        result
    }

    /// Build a connectable link for a previously seen address.
    pub async fn link(&self, address: &str) -> Option<PeripheralLink> {
        self.peripherals
            .lock()
            .await
            .get(address)
            .cloned()
            .map(PeripheralLink::new)
    }
}
