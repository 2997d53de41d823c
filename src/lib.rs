#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

//! # decent-bridge ☕
//!
//! A headless network bridge for the Decent DE1 espresso machine and its
//! companion BLE devices. The bridge connects to a DE1, at most one
//! weighing scale, and any number of auxiliary sensors over Bluetooth Low
//! Energy, then republishes their data and control surface to the local
//! network over HTTP REST and WebSocket.
//!
//! The heart of the crate is the DE1 protocol engine: the machine packs
//! its telemetry into reverse-engineered fixed-point characteristics
//! ([`codec`], [`protocol`]), and the bridge turns those bit-exact
//! payloads into JSON streams any client on the LAN can consume.
//!
//! ## Architecture
//!
//! ```text
//! BLE advertisements ─▶ classify ─▶ bridge policy ─▶ sessions
//! sessions ─▶ snapshots + events ─▶ bridge routing ─▶ WebSocket fan-out
//! HTTP requests ─▶ bridge calls ─▶ session commands ─▶ BLE writes
//! ```
//!
//! - [`codec`] — the DE1 fixed-point number formats
//! - [`protocol`] — characteristic UUIDs, parsers, and frame builders
//! - [`classify`] — advertisement → DE1 / scale / sensor
//! - [`scale`] — vendor scale dialects behind one adapter trait
//! - [`sensor`] — auxiliary sensor dialects
//! - [`transport`] — the BLE central and the per-peripheral link trait
//! - [`session`] — per-device connection state machines
//! - [`bridge`] — the orchestrator owning every session
//! - [`api`] — the REST surface and WebSocket fan-out
//! - [`discovery`] — UDP probe replies and mDNS advertisement
//!
//! ## Quick start
//!
//! ```no_run
//! use decent_bridge::bridge::BridgeHandle;
//! use decent_bridge::settings::Settings;
//! use decent_bridge::transport::BleScanner;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scanner = BleScanner::new().await?;
//!     let bridge = BridgeHandle::new(Settings::default(), None, Some(scanner));
//!     bridge.start().await?;
//!
//!     let http = decent_bridge::api::http::router(bridge.clone());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, http).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bridge;
pub mod classify;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod scale;
pub mod sensor;
pub mod session;
pub mod settings;
pub mod transport;

pub use bridge::BridgeHandle;
pub use error::{BridgeError, Result};
pub use protocol::{Profile, ShotSettings, State, SubState, DE1_SERVICE_UUID};
pub use settings::Settings;

/// Crate version, announced over discovery and `/machine/info`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
