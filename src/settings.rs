//! Persisted bridge settings.
//!
//! A flat JSON document loaded once at startup from the path given on the
//! command line. There is no file watcher; callers that mutate settings at
//! runtime write the file back themselves.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Bridge configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Name announced over discovery
    pub bridge_name: String,
    /// REST listener port
    pub http_port: u16,
    /// WebSocket listener port
    pub web_socket_port: u16,
    /// Connect to any discovered DE1 automatically
    pub auto_connect: bool,
    /// Connect to any discovered scale automatically
    pub auto_connect_scale: bool,
    /// Pinned DE1 address; connected to even when auto-connect is off
    pub de1_address: String,
    /// Stop-at weight for shots, grams
    pub target_weight: f64,
    /// Gain applied to the derived weight-flow estimate
    pub weight_flow_multiplier: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bridge_name: "DecentBridge".to_string(),
            http_port: 8080,
            web_socket_port: 8081,
            auto_connect: false,
            auto_connect_scale: false,
            de1_address: String::new(),
            target_weight: 36.0,
            weight_flow_multiplier: 1.0,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file; missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BridgeError::Io`] when the file cannot be
    /// read and [`crate::error::BridgeError::BadRequest`] when it is not
    /// valid JSON.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)
            .map_err(|e| crate::error::BridgeError::BadRequest(format!("invalid config: {e}")))?;
        info!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Write settings to a JSON file, pretty-printed.
    pub fn save_to_file(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(error) = std::fs::write(path, json) {
                    warn!(path = %path.display(), %error, "failed to write settings");
                } else {
                    info!(path = %path.display(), "saved settings");
                }
            }
            Err(error) => warn!(%error, "failed to serialise settings"),
        }
    }

    /// Merge a partial JSON document into this settings value, returning
    /// which keys were applied. Unknown keys are ignored.
    pub fn apply_partial(&mut self, patch: &serde_json::Value) -> Vec<&'static str> {
        let mut applied = Vec::new();

        if let Some(name) = patch.get("bridgeName").and_then(|v| v.as_str()) {
            self.bridge_name = name.to_string();
            applied.push("bridgeName");
        }
        if let Some(auto) = patch.get("autoConnect").and_then(|v| v.as_bool()) {
            self.auto_connect = auto;
            applied.push("autoConnect");
        }
        if let Some(auto) = patch.get("autoConnectScale").and_then(|v| v.as_bool()) {
            self.auto_connect_scale = auto;
            applied.push("autoConnectScale");
        }
        if let Some(address) = patch.get("de1Address").and_then(|v| v.as_str()) {
            self.de1_address = address.to_string();
            applied.push("de1Address");
        }
        if let Some(weight) = patch.get("targetWeight").and_then(serde_json::Value::as_f64) {
            self.target_weight = weight;
            applied.push("targetWeight");
        }
        if let Some(gain) = patch
            .get("weightFlowMultiplier")
            .and_then(serde_json::Value::as_f64)
        {
            self.weight_flow_multiplier = gain;
            applied.push("weightFlowMultiplier");
        }

        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.http_port, 8080);
        assert_eq!(settings.web_socket_port, 8081);
        assert_eq!(settings.bridge_name, "DecentBridge");
        assert!(!settings.auto_connect);
        assert!((settings.weight_flow_multiplier - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_document_takes_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"httpPort": 9000, "autoConnect": true}"#).unwrap();
        assert_eq!(settings.http_port, 9000);
        assert!(settings.auto_connect);
        assert_eq!(settings.web_socket_port, 8081);
        assert_eq!(settings.bridge_name, "DecentBridge");
    }

    #[test]
    fn test_camel_case_round_trip() {
        let settings = Settings {
            de1_address: "AA:BB:CC:DD:EE:FF".to_string(),
            ..Settings::default()
        };
        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["de1Address"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["webSocketPort"], 8081);

        let back: Settings = serde_json::from_value(json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_apply_partial() {
        let mut settings = Settings::default();
        let patch = serde_json::json!({
            "bridgeName": "kitchen",
            "autoConnectScale": true,
            "weightFlowMultiplier": 1.2,
            "bogusKey": 7,
        });
        let applied = settings.apply_partial(&patch);

        assert_eq!(settings.bridge_name, "kitchen");
        assert!(settings.auto_connect_scale);
        assert!((settings.weight_flow_multiplier - 1.2).abs() < f64::EPSILON);
        assert!(applied.contains(&"bridgeName"));
        assert!(!applied.contains(&"bogusKey"));
        // Ports are CLI/file concerns, never patched over the API.
        assert_eq!(settings.http_port, 8080);
    }
}
