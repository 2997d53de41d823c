//! REST surface under `/api/v1`.
//!
//! Every endpoint is a thin translation: query/body in, bridge call,
//! JSON snapshot out. Endpoints that need the machine answer 503 while no
//! DE1 session is `Ready`; malformed bodies answer 400 with an
//! `{"error": …}` object.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::bridge::{machine_state_json, BridgeHandle};
use crate::error::BridgeError;
use crate::protocol::{Profile, ShotSettings};

/// Fixed refill threshold reported alongside the current level, mm.
const REFILL_LEVEL_MM: u16 = 5;

/// Error wrapper mapping [`BridgeError`] onto HTTP responses.
#[derive(Debug)]
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(error: BridgeError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the REST router served on the HTTP port.
pub fn router(bridge: BridgeHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/v1/devices", get(get_devices))
        .route("/api/v1/devices/scan", get(scan_devices))
        .route("/api/v1/devices/discovered", get(get_discovered))
        .route("/api/v1/devices/connect", put(connect_device))
        .route("/api/v1/machine/info", get(get_machine_info))
        .route("/api/v1/machine/state", get(get_machine_state))
        .route("/api/v1/machine/state/:name", put(set_machine_state))
        .route("/api/v1/machine/profile", post(post_profile))
        .route(
            "/api/v1/machine/settings",
            get(get_machine_settings).post(post_machine_settings),
        )
        .route(
            "/api/v1/machine/shotSettings",
            get(get_shot_settings).post(post_shot_settings),
        )
        .route("/api/v1/machine/waterLevels", get(get_water_levels))
        .route("/api/v1/sensors", get(get_sensors))
        .route("/api/v1/sensors/:id", get(get_sensor_by_id))
        .route("/api/v1/scale/tare", put(tare_scale))
        .route("/api/v1/scale/disconnect", put(disconnect_scale))
        .route(
            "/api/v1/settings",
            get(get_settings).post(post_settings),
        )
        .layer(cors)
        .with_state(bridge)
}

async fn get_devices(State(bridge): State<BridgeHandle>) -> Json<Value> {
    Json(bridge.devices_json().await)
}

#[derive(Deserialize)]
struct ScanParams {
    #[serde(default)]
    quick: Option<String>,
}

async fn scan_devices(
    State(bridge): State<BridgeHandle>,
    Query(params): Query<ScanParams>,
) -> ApiResult<Json<Value>> {
    debug!(quick = ?params.quick, "scan requested");
    bridge.start_scan().await?;
    // Scan results are polled from /devices/discovered.
    Ok(Json(json!([])))
}

async fn get_discovered(State(bridge): State<BridgeHandle>) -> Json<Value> {
    Json(bridge.discovered_json().await)
}

#[derive(Deserialize)]
struct ConnectParams {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

async fn connect_device(
    State(bridge): State<BridgeHandle>,
    Query(params): Query<ConnectParams>,
) -> ApiResult<Json<Value>> {
    let device_id = params
        .device_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| BridgeError::BadRequest("deviceId required".to_string()))?;
    bridge.connect_device(&device_id).await?;
    Ok(Json(json!({})))
}

async fn get_machine_info(State(bridge): State<BridgeHandle>) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    let snapshot = session.snapshot().await;
    Ok(Json(json!({
        "version": snapshot
            .firmware
            .as_ref()
            .map(crate::protocol::Version::firmware_string)
            .unwrap_or_default(),
        "model": snapshot.model,
        "serialNumber": snapshot.serial,
        "GHC": snapshot.has_ghc,
    })))
}

async fn get_machine_state(State(bridge): State<BridgeHandle>) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    let snapshot = session.snapshot().await;
    Ok(Json(machine_state_json(&snapshot)))
}

async fn set_machine_state(
    State(bridge): State<BridgeHandle>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    session.request_state_by_alias(&name).await?;
    Ok(Json(json!({})))
}

async fn post_profile(
    State(bridge): State<BridgeHandle>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    let Json(body) = body.map_err(bad_json)?;
    let profile: Profile = serde_json::from_value(body)
        .map_err(|e| BridgeError::BadRequest(format!("invalid profile: {e}")))?;
    session.upload_profile(&profile).await?;
    Ok(Json(json!({})))
}

async fn get_machine_settings(State(bridge): State<BridgeHandle>) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    let snapshot = session.snapshot().await;
    Ok(Json(json!({
        "usb": snapshot.usb_charger_on,
        "fan": snapshot.fan_threshold_c,
    })))
}

async fn post_machine_settings(
    State(bridge): State<BridgeHandle>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Response> {
    let session = bridge.de1_ready().await?;
    let Json(body) = body.map_err(bad_json)?;

    if let Some(usb) = body.get("usb").and_then(Value::as_bool) {
        session.set_usb_charger(usb).await?;
    }
    if let Some(fan) = body.get("fan").and_then(Value::as_u64) {
        let celsius = u8::try_from(fan)
            .map_err(|_| BridgeError::BadRequest("fan threshold out of range".to_string()))?;
        session.set_fan_threshold(celsius).await?;
    }

    Ok((StatusCode::ACCEPTED, Json(json!({}))).into_response())
}

async fn get_shot_settings(State(bridge): State<BridgeHandle>) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    let settings = session.snapshot().await.shot_settings;
    Ok(Json(serde_json::to_value(settings).unwrap_or_default()))
}

async fn post_shot_settings(
    State(bridge): State<BridgeHandle>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    let Json(body) = body.map_err(bad_json)?;

    let merged = merge_shot_settings(session.snapshot().await.shot_settings, &body)?;
    session.set_shot_settings(merged).await?;
    Ok(Json(serde_json::to_value(merged).unwrap_or_default()))
}

async fn get_water_levels(State(bridge): State<BridgeHandle>) -> ApiResult<Json<Value>> {
    let session = bridge.de1_ready().await?;
    let snapshot = session.snapshot().await;
    Ok(Json(json!({
        "currentLevel": snapshot.water_level_mm,
        "refillLevel": REFILL_LEVEL_MM,
    })))
}

async fn get_sensors(State(bridge): State<BridgeHandle>) -> Json<Value> {
    let mut sensors = Vec::new();
    for session in bridge.sensors().await {
        if session.state().await == crate::session::SessionState::Ready {
            sensors.push(sensor_descriptor(&session).await);
        }
    }
    Json(Value::Array(sensors))
}

async fn get_sensor_by_id(
    State(bridge): State<BridgeHandle>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = bridge
        .sensor(&id)
        .await
        .ok_or_else(|| BridgeError::NotFound("sensor not found".to_string()))?;
    if session.state().await != crate::session::SessionState::Ready {
        return Err(BridgeError::NotFound("sensor not found".to_string()).into());
    }
    Ok(Json(sensor_descriptor(&session).await))
}

async fn sensor_descriptor(session: &crate::session::SensorSession) -> Value {
    let channels: Vec<Value> = session
        .channel_specs()
        .await
        .into_iter()
        .map(|c| {
            json!({
                "key": c.key,
                "type": c.value_type,
                "unit": c.unit,
            })
        })
        .collect();
    json!({
        "id": session.id(),
        "name": session.name(),
        "type": session.kind().as_str(),
        "dataChannels": channels,
    })
}

async fn tare_scale(State(bridge): State<BridgeHandle>) -> ApiResult<Json<Value>> {
    bridge.tare_scale().await?;
    Ok(Json(json!({})))
}

async fn disconnect_scale(State(bridge): State<BridgeHandle>) -> ApiResult<Json<Value>> {
    bridge.disconnect_scale().await?;
    Ok(Json(json!({})))
}

async fn get_settings(State(bridge): State<BridgeHandle>) -> Json<Value> {
    Json(serde_json::to_value(bridge.settings().await).unwrap_or_default())
}

async fn post_settings(
    State(bridge): State<BridgeHandle>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body.map_err(bad_json)?;
    let settings = bridge.update_settings(&body).await;
    Ok(Json(serde_json::to_value(settings).unwrap_or_default()))
}

fn bad_json(rejection: JsonRejection) -> BridgeError {
    BridgeError::BadRequest(format!("invalid JSON: {rejection}"))
}

/// Overlay a partial settings document on the cached values.
fn merge_shot_settings(
    mut current: ShotSettings,
    patch: &Value,
) -> Result<ShotSettings, BridgeError> {
    let byte_field = |value: &Value, name: &str| -> Result<u8, BridgeError> {
        value
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| BridgeError::BadRequest(format!("{name} out of range")))
    };

    if let Some(value) = patch.get("steamSetting") {
        current.steam_setting = byte_field(value, "steamSetting")?;
    }
    if let Some(value) = patch.get("targetSteamTemp") {
        current.target_steam_temp = byte_field(value, "targetSteamTemp")?;
    }
    if let Some(value) = patch.get("targetSteamDuration") {
        current.target_steam_duration = byte_field(value, "targetSteamDuration")?;
    }
    if let Some(value) = patch.get("targetHotWaterTemp") {
        current.target_hot_water_temp = byte_field(value, "targetHotWaterTemp")?;
    }
    if let Some(value) = patch.get("targetHotWaterVolume") {
        current.target_hot_water_volume = byte_field(value, "targetHotWaterVolume")?;
    }
    if let Some(value) = patch.get("targetHotWaterDuration") {
        current.target_hot_water_duration = byte_field(value, "targetHotWaterDuration")?;
    }
    if let Some(value) = patch.get("targetShotVolume") {
        current.target_shot_volume = byte_field(value, "targetShotVolume")?;
    }
    if let Some(value) = patch.get("groupTemp") {
        current.group_temp = value
            .as_f64()
            .ok_or_else(|| BridgeError::BadRequest("groupTemp must be a number".to_string()))?;
    }

    Ok(current)
}
