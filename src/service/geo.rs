//! HTTP geolocation via the ip-api JSON service

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::traits::HopLocator;
use crate::core::types::HopLocation;

use super::config::GeoSettings;

/// Response body of `GET {endpoint}/{ip}`
#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    lat: Option<f64>,
    lon: Option<f64>,
    city: Option<String>,
    country: Option<String>,
    org: Option<String>,
    query: Option<String>,
}

/// Decode an ip-api body; anything but a complete success is `None`
fn parse_ip_api(body: &str) -> Option<HopLocation> {
    let resp: IpApiResponse = serde_json::from_str(body).ok()?;
    if resp.status != "success" {
        return None;
    }
    Some(HopLocation {
        lat: resp.lat?,
        lon: resp.lon?,
        city: resp.city,
        country: resp.country,
        org: resp.org,
        query: resp.query,
    })
}

#[derive(Debug, Deserialize)]
struct PublicIpResponse {
    ip: Option<String>,
}

/// The caller's own public address and where it is
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicLocation {
    pub ip: String,
    #[serde(flatten)]
    pub location: HopLocation,
}

pub struct IpApiLocator {
    client: Option<reqwest::blocking::Client>,
    endpoint: String,
    public_ip_endpoint: String,
}

impl IpApiLocator {
    pub fn new(settings: &GeoSettings) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .build();
        let client = match client {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "[GEO] HTTP client unavailable, lookups disabled");
                None
            }
        };
        Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            public_ip_endpoint: settings.public_ip_endpoint.clone(),
        }
    }

    fn get_text(&self, url: &str) -> Option<String> {
        let client = self.client.as_ref()?;
        let resp = match client.get(url).send() {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url, error = %e, "[GEO] Request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!(url, status = %resp.status(), "[GEO] Lookup rejected");
            return None;
        }
        resp.text().ok()
    }

    /// Look up the caller's public IP, then geolocate it
    pub fn public_location(&self) -> Option<PublicLocation> {
        let body = self.get_text(&self.public_ip_endpoint)?;
        let ip = serde_json::from_str::<PublicIpResponse>(&body)
            .ok()?
            .ip
            .filter(|ip| !ip.is_empty())?;
        let location = self.locate(&ip)?;
        Some(PublicLocation { ip, location })
    }
}

impl HopLocator for IpApiLocator {
    fn locate(&self, address: &str) -> Option<HopLocation> {
        let url = format!("{}/{}", self.endpoint, address);
        let location = self.get_text(&url).and_then(|body| parse_ip_api(&body));
        debug!(address, found = location.is_some(), "[GEO] Lookup");
        location
    }
}
