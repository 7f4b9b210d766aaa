//! Runtime configuration for the relay engine.
//!
//! The binary deserializes this from YAML and hands it to the engine as-is.
//! Listener endpoints use `udp://host:port` / `tcp://host:port` URIs so one
//! list can mix both transports.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// How the upstream leg toward the media server is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamMode {
    /// Negotiate a full ICE session with the media server.
    Ice,
    /// Dial one of the server's host candidates directly.
    #[default]
    Direct,
}

/// Upstream leg settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub mode: UpstreamMode,
    /// Prefer TCP-passive candidates over UDP when dialing directly.
    #[serde(default)]
    pub prefer_tcp: bool,
}

/// TLS material for the sniffing TCP listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// ICE data-plane listeners and the candidates advertised for them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IceListenerConfig {
    /// Listener URIs, e.g. `udp://0.0.0.0:5551`, `tcp://0.0.0.0:5552`.
    #[serde(default)]
    pub addrs: Vec<String>,
    /// Public hosts to advertise in generated candidate lines. Each host is
    /// paired with every listener port above.
    #[serde(default)]
    pub candidate_hosts: Vec<String>,
    /// Fully spelled-out candidate lines, appended after the generated ones.
    #[serde(default)]
    pub candidates: Vec<String>,
}

/// HTTP signaling listeners.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Plain `host:port` listen addresses.
    #[serde(default)]
    pub addrs: Vec<String>,
    /// Header to stamp a generated request id into, when set.
    #[serde(default)]
    pub request_id_header: Option<String>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub ice: IceListenerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// MaxMind City database path; optional, absence disables geo routing.
    #[serde(default)]
    pub geoip_db: Option<PathBuf>,
    /// Pending-session TTL in milliseconds; 0 keeps the default.
    #[serde(default)]
    pub cache_ttl_ms: u64,
}

/// One parsed listener endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerUri {
    Udp(SocketAddr),
    Tcp(SocketAddr),
}

/// Split `udp://host:port` / `tcp://host:port`.
pub fn parse_listener_uri(uri: &str) -> Result<ListenerUri> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("listener uri without scheme: {uri:?}")))?;
    let addr: SocketAddr = rest
        .parse()
        .map_err(|_| Error::Config(format!("bad listener address: {uri:?}")))?;
    match scheme {
        "udp" => Ok(ListenerUri::Udp(addr)),
        "tcp" => Ok(ListenerUri::Tcp(addr)),
        other => Err(Error::Config(format!("unknown listener scheme: {other:?}"))),
    }
}

// Priorities browsers assign to host candidates; reused verbatim so the
// generated lines look like everyone else's.
const UDP_HOST_PRIORITY: u32 = 2113937151;
const TCP_HOST_PRIORITY: u32 = 1518280447;

impl RelayConfig {
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_ms > 0).then(|| Duration::from_millis(self.cache_ttl_ms))
    }

    /// Parse and validate the ICE listener endpoints.
    pub fn ice_listeners(&self) -> Result<Vec<ListenerUri>> {
        self.ice.addrs.iter().map(|a| parse_listener_uri(a)).collect()
    }

    /// The candidate lines this proxy advertises: one per
    /// (candidate host, ICE listener) pair, then the literal extras.
    pub fn proxy_candidates(&self) -> Result<Vec<String>> {
        let listeners = self.ice_listeners()?;
        let mut lines = Vec::new();
        let mut foundation = 1u32;
        for host in &self.ice.candidate_hosts {
            for listener in &listeners {
                let line = match listener {
                    ListenerUri::Udp(addr) => format!(
                        "a=candidate:{foundation} 1 udp {UDP_HOST_PRIORITY} {host} {} typ host",
                        addr.port()
                    ),
                    ListenerUri::Tcp(addr) => format!(
                        "a=candidate:{foundation} 1 tcp {TCP_HOST_PRIORITY} {host} {} typ host tcptype passive",
                        addr.port()
                    ),
                };
                lines.push(line);
                foundation += 1;
            }
        }
        lines.extend(self.ice.candidates.iter().cloned());
        Ok(lines)
    }
}
