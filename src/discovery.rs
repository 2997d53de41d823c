//! LAN discovery: UDP probe replies and mDNS service advertisement.
//!
//! Clients find the bridge two ways. The zero-dependency way is a UDP
//! datagram `DECENTBRIDGE_DISCOVER` to port 19741, answered with a compact
//! JSON object naming the HTTP and WebSocket ports. The polished way is
//! the `_decentbridge._tcp.local.` mDNS service registration.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};

use mdns_sd::{ServiceDaemon, ServiceInfo};
use serde_json::json;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::bridge::BridgeHandle;
use crate::error::{BridgeError, Result};

/// Fixed UDP discovery port.
pub const DISCOVERY_PORT: u16 = 19741;

/// The probe payload, after ASCII-whitespace trimming.
pub const DISCOVERY_REQUEST: &[u8] = b"DECENTBRIDGE_DISCOVER";

/// mDNS service type.
pub const MDNS_SERVICE_TYPE: &str = "_decentbridge._tcp.local.";

/// Build the reply for one datagram, or `None` for foreign payloads.
#[must_use]
pub fn discovery_reply(
    payload: &[u8],
    bridge_name: &str,
    http_port: u16,
    ws_port: u16,
    version: &str,
) -> Option<Vec<u8>> {
    if payload.trim_ascii() != DISCOVERY_REQUEST {
        return None;
    }
    let reply = json!({
        "name": bridge_name,
        "httpPort": http_port,
        "wsPort": ws_port,
        "version": version,
    });
    Some(reply.to_string().into_bytes())
}

/// Bind the discovery socket with `SO_REUSEADDR` and, where the platform
/// has it, `SO_REUSEPORT`, so the bridge coexists with other listeners on
/// the well-known port.
///
/// # Errors
///
/// Returns [`BridgeError::BindFailed`] when the port cannot be claimed.
pub fn bind_discovery_socket(port: u16) -> Result<UdpSocket> {
    let bind = || -> std::io::Result<StdUdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        Ok(socket.into())
    };

    let socket = bind().map_err(|source| BridgeError::BindFailed { port, source })?;
    let socket = UdpSocket::from_std(socket).map_err(|source| BridgeError::BindFailed {
        port,
        source,
    })?;
    Ok(socket)
}

/// Answer discovery probes until the socket dies.
pub async fn run_udp_responder(socket: UdpSocket, bridge: BridgeHandle, version: String) {
    info!(port = DISCOVERY_PORT, "discovery responder listening");
    let mut buf = [0u8; 512];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                warn!(%error, "discovery socket error");
                continue;
            }
        };

        let settings = bridge.settings().await;
        let Some(reply) = discovery_reply(
            &buf[..len],
            &settings.bridge_name,
            settings.http_port,
            settings.web_socket_port,
            &version,
        ) else {
            continue;
        };

        debug!(%peer, "discovery request");
        if let Err(error) = socket.send_to(&reply, peer).await {
            warn!(%peer, %error, "discovery reply failed");
        }
    }
}

/// Best-effort local IPv4 address, for the mDNS TXT record.
#[must_use]
pub fn local_ip() -> Option<Ipv4Addr> {
    // Routing-table probe; no packet is actually sent.
    let socket = StdUdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        std::net::SocketAddr::V6(_) => None,
    }
}

/// Register the mDNS service. Returns the daemon handle, which must stay
/// alive for the registration to remain visible. Failure is logged and
/// tolerated; the UDP responder still covers discovery.
pub fn advertise_mdns(
    bridge_name: &str,
    http_port: u16,
    ws_port: u16,
    version: &str,
) -> Option<ServiceDaemon> {
    let daemon = match ServiceDaemon::new() {
        Ok(daemon) => daemon,
        Err(error) => {
            warn!(%error, "mDNS daemon unavailable");
            return None;
        }
    };

    let ip = local_ip().map(|ip| ip.to_string()).unwrap_or_default();
    let ws = ws_port.to_string();
    let port = http_port.to_string();
    let properties = [
        ("version", version),
        ("ip", ip.as_str()),
        ("port", port.as_str()),
        ("ws", ws.as_str()),
    ];

    let host = format!("{}.local.", bridge_name.to_lowercase().replace(' ', "-"));
    let service = match ServiceInfo::new(
        MDNS_SERVICE_TYPE,
        bridge_name,
        &host,
        ip.as_str(),
        http_port,
        &properties[..],
    ) {
        Ok(service) => service.enable_addr_auto(),
        Err(error) => {
            warn!(%error, "mDNS service record invalid");
            return None;
        }
    };

    match daemon.register(service) {
        Ok(()) => {
            info!(service = MDNS_SERVICE_TYPE, "mDNS service registered");
            Some(daemon)
        }
        Err(error) => {
            warn!(%error, "mDNS registration failed");
            None
        }
    }
}
