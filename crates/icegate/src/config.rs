//! Config file loading.
//!
//! One YAML file selected with `-f` describes the whole deployment:
//!
//! ```yaml
//! log:
//!   level: info
//! relay:
//!   ice:
//!     addrs: ["udp://0.0.0.0:5551", "tcp://0.0.0.0:5552"]
//!     candidate_hosts: ["198.51.100.7"]
//!   http:
//!     addrs: ["0.0.0.0:8080"]
//!   tls:
//!     cert: /etc/icegate/cert.pem
//!     key: /etc/icegate/key.pem
//!   geoip_db: /usr/share/GeoIP/GeoLite2-City.mmdb
//! ```

use std::path::Path;

use serde::Deserialize;

use icegate_relay_core::RelayConfig;

use crate::logging::LogSettings;

/// The whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Read and parse the config file. Any failure here is fatal to startup.
pub fn load(path: &Path) -> Result<FileConfig, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
    serde_yaml::from_str(&text).map_err(|e| format!("cannot parse config {}: {e}", path.display()))
}
