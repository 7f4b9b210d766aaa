//! Geographic routing oracle.
//!
//! The relay only inserts itself into the media path when that is likely to
//! help: the client sits in the proxy's country while the media server does
//! not. Countries come from a MaxMind City database opened read-only at
//! startup; without a database every query answers "direct".

use std::net::IpAddr;
use std::path::Path;

use maxminddb::geoip2;
use tracing::{debug, info, warn};

/// Answers the one routing question signaling asks.
pub trait RouteOracle: Send + Sync {
    /// True when the client should reach the media server through this
    /// proxy instead of directly.
    fn route_via_proxy(&self, client: IpAddr, proxy: IpAddr, server: IpAddr) -> bool;
}

/// [`RouteOracle`] backed by a MaxMind City database.
pub struct GeoOracle {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoOracle {
    /// Open the database at `path`. A missing or unreadable database is
    /// logged and degrades to the disabled oracle rather than failing
    /// startup.
    pub fn open(path: &Path) -> Self {
        match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => {
                info!(path = %path.display(), "geoip database loaded");
                Self { reader: Some(reader) }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "geoip database unavailable, routing everything direct");
                Self { reader: None }
            }
        }
    }

    /// An oracle with no database: every query routes direct.
    pub fn disabled() -> Self {
        Self { reader: None }
    }

    fn country(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        let city: geoip2::City = reader.lookup(ip).ok()?;
        city.country
            .and_then(|c| c.iso_code)
            .map(|code| code.to_string())
    }
}

impl RouteOracle for GeoOracle {
    fn route_via_proxy(&self, client: IpAddr, proxy: IpAddr, server: IpAddr) -> bool {
        let client_country = self.country(client);
        let proxy_country = self.country(proxy);
        let server_country = self.country(server);
        let relay = decide(
            client_country.as_deref(),
            proxy_country.as_deref(),
            server_country.as_deref(),
        );
        debug!(
            %client, ?client_country, %proxy, ?proxy_country, %server, ?server_country, relay,
            "geo routing decision"
        );
        relay
    }
}

/// The decision rule over resolved country codes.
///
/// Unknown client or server country means one of them is probably a private
/// address next to us, so the default path stays. The proxy helps only when
/// it shares the client's country and the server does not.
pub fn decide(client: Option<&str>, proxy: Option<&str>, server: Option<&str>) -> bool {
    let (Some(client), Some(server)) = (client, server) else {
        return false;
    };
    let Some(proxy) = proxy else {
        return false;
    };
    client != server && client == proxy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table() {
        // client=HK proxy=US server=US -> direct
        assert!(!decide(Some("HK"), Some("US"), Some("US")));
        // client=HK proxy=HK server=US -> relay
        assert!(decide(Some("HK"), Some("HK"), Some("US")));
        // client=HK proxy=US server=HK -> direct
        assert!(!decide(Some("HK"), Some("US"), Some("HK")));
        // unknown client -> direct
        assert!(!decide(None, Some("HK"), Some("US")));
        // unknown server -> direct
        assert!(!decide(Some("HK"), Some("HK"), None));
        // unknown proxy -> direct
        assert!(!decide(Some("HK"), None, Some("US")));
        // same country everywhere -> direct
        assert!(!decide(Some("US"), Some("US"), Some("US")));
    }

    #[test]
    fn disabled_oracle_routes_direct() {
        let oracle = GeoOracle::disabled();
        assert!(!oracle.route_via_proxy(
            "203.0.113.10".parse().unwrap(),
            "198.51.100.7".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
        ));
    }

    #[test]
    fn missing_database_degrades_to_disabled() {
        let oracle = GeoOracle::open(Path::new("/nonexistent/geoip.mmdb"));
        assert!(!oracle.route_via_proxy(
            "203.0.113.10".parse().unwrap(),
            "198.51.100.7".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
        ));
    }
}
