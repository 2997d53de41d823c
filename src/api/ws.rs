//! WebSocket fan-out.
//!
//! Subscribers attach to one of a fixed set of channels; every device
//! event the bridge routes is broadcast as one compact JSON text frame per
//! message. Delivery is best-effort: a subscriber that stops draining its
//! queue lags the broadcast channel and is dropped without holding anyone
//! else up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::bridge::BridgeHandle;

/// Queue depth per channel before slow subscribers start lagging out.
const CHANNEL_CAPACITY: usize = 64;

/// The fixed fan-out channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Shot samples and state transitions
    MachineSnapshot,
    /// Shot-settings changes
    ShotSettings,
    /// Water-level changes
    WaterLevels,
    /// Scale weight/flow snapshots
    ScaleSnapshot,
    /// Per-sensor channel values, keyed by sensor id
    Sensor(String),
}

/// Channel-keyed subscriber registry.
///
/// Each channel is a tokio broadcast sender; subscribing hands out a
/// receiver and broadcasting never blocks on any subscriber.
#[derive(Clone)]
pub struct WsFanout {
    channels: Arc<Mutex<HashMap<Channel, broadcast::Sender<String>>>>,
}

impl Default for WsFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl WsFanout {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self, channel: &Channel) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().expect("fanout lock poisoned");
        channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Register a subscriber on a channel
    #[must_use]
    pub fn subscribe(&self, channel: &Channel) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    /// Broadcast one JSON message to every subscriber of a channel.
    /// Channels with no subscribers drop the message silently.
    pub fn broadcast(&self, channel: &Channel, payload: String) {
        let _ = self.sender(channel).send(payload);
    }

    /// Number of live subscribers on a channel
    #[must_use]
    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.sender(channel).receiver_count()
    }
}

/// Build the WebSocket router served on the dedicated WS port.
pub fn router(bridge: BridgeHandle) -> Router {
    Router::new()
        .route("/ws/v1/machine/snapshot", get(machine_snapshot_handler))
        .route("/ws/v1/machine/shotSettings", get(shot_settings_handler))
        .route("/ws/v1/machine/waterLevels", get(water_levels_handler))
        .route("/ws/v1/scale/snapshot", get(scale_snapshot_handler))
        .route("/ws/v1/sensors/:id/snapshot", get(sensor_snapshot_handler))
        .with_state(bridge)
}

async fn machine_snapshot_handler(
    State(bridge): State<BridgeHandle>,
    ws: WebSocketUpgrade,
) -> Response {
    // New machine subscribers get the cached snapshot before the stream.
    let initial = bridge.machine_snapshot_json().await;
    let rx = bridge.fanout().subscribe(&Channel::MachineSnapshot);
    ws.on_upgrade(move |socket| pump(socket, rx, initial))
}

async fn shot_settings_handler(
    State(bridge): State<BridgeHandle>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = bridge.fanout().subscribe(&Channel::ShotSettings);
    ws.on_upgrade(move |socket| pump(socket, rx, None))
}

async fn water_levels_handler(
    State(bridge): State<BridgeHandle>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = bridge.fanout().subscribe(&Channel::WaterLevels);
    ws.on_upgrade(move |socket| pump(socket, rx, None))
}

async fn scale_snapshot_handler(
    State(bridge): State<BridgeHandle>,
    ws: WebSocketUpgrade,
) -> Response {
    let initial = bridge.scale_snapshot_json().await;
    let rx = bridge.fanout().subscribe(&Channel::ScaleSnapshot);
    ws.on_upgrade(move |socket| pump(socket, rx, initial))
}

async fn sensor_snapshot_handler(
    State(bridge): State<BridgeHandle>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = bridge.fanout().subscribe(&Channel::Sensor(id));
    ws.on_upgrade(move |socket| pump(socket, rx, None))
}

/// Forward broadcast messages to one socket until it closes or lags out.
async fn pump(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<String>,
    initial: Option<String>,
) {
    if let Some(snapshot) = initial {
        if socket.send(Message::Text(snapshot)).await.is_err() {
            return;
        }
    }

    loop {
        match rx.recv().await {
            Ok(payload) => {
                if socket.send(Message::Text(payload)).await.is_err() {
                    debug!("subscriber went away");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Slow consumer; drop it rather than stall the channel.
                warn!(skipped, "dropping lagging subscriber");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    let _ = socket.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber_once() {
        let fanout = WsFanout::new();
        let mut rx1 = fanout.subscribe(&Channel::MachineSnapshot);
        let mut rx2 = fanout.subscribe(&Channel::MachineSnapshot);
        let mut other = fanout.subscribe(&Channel::WaterLevels);

        fanout.broadcast(&Channel::MachineSnapshot, "{\"a\":1}".to_string());
        fanout.broadcast(&Channel::MachineSnapshot, "{\"a\":2}".to_string());

        assert_eq!(rx1.recv().await.unwrap(), "{\"a\":1}");
        assert_eq!(rx1.recv().await.unwrap(), "{\"a\":2}");
        assert_eq!(rx2.recv().await.unwrap(), "{\"a\":1}");
        assert_eq!(rx2.recv().await.unwrap(), "{\"a\":2}");

        // Cross-channel isolation.
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_silent() {
        let fanout = WsFanout::new();
        fanout.broadcast(&Channel::ShotSettings, "{}".to_string());
        assert_eq!(fanout.subscriber_count(&Channel::ShotSettings), 0);
    }

    #[tokio::test]
    async fn test_sensor_channels_are_keyed_by_id() {
        let fanout = WsFanout::new();
        let mut a = fanout.subscribe(&Channel::Sensor("bookoomonitor_aa".to_string()));
        let mut b = fanout.subscribe(&Channel::Sensor("bookoomonitor_bb".to_string()));

        fanout.broadcast(
            &Channel::Sensor("bookoomonitor_aa".to_string()),
            "{\"pressure\":9.0}".to_string(),
        );

        assert_eq!(a.recv().await.unwrap(), "{\"pressure\":9.0}");
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_per_subscriber_order_is_preserved() {
        let fanout = WsFanout::new();
        let mut rx = fanout.subscribe(&Channel::ScaleSnapshot);
        for i in 0..10 {
            fanout.broadcast(&Channel::ScaleSnapshot, format!("{{\"n\":{i}}}"));
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap(), format!("{{\"n\":{i}}}"));
        }
    }
}
