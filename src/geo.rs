//! Best-effort geolocation.
//!
//! Detection events carry a human-readable place string. The default
//! `IpGeolocator` resolves the host's network-observed IP to coordinates and
//! reverse-geocodes them. Every failure degrades to a sentinel and every call
//! is bounded by a single deadline, so a dead network can delay a detection by
//! at most the configured timeout and can never drop it.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use url::Url;

use crate::config::GeoSettings;

/// The host's coordinates could not be determined.
pub const UNKNOWN_LOCATION: &str = "Unknown location";

/// Coordinates were found but no place name could be attached to them.
pub const UNKNOWN: &str = "Unknown";

/// Upper bound on any geolocation timeout.
pub const MAX_GEO_TIMEOUT: Duration = Duration::from_secs(10);

pub trait Geolocator: Send + Sync {
    /// Never fails; returns `UNKNOWN_LOCATION` or `UNKNOWN` when resolution fails.
    fn resolve_location(&self) -> String;
}

pub fn is_sentinel(location: &str) -> bool {
    location == UNKNOWN_LOCATION || location == UNKNOWN
}

/// Build the geolocator described by the settings.
pub fn from_settings(settings: &GeoSettings) -> Result<Box<dyn Geolocator>> {
    if !settings.enabled {
        return Ok(Box::new(DisabledGeolocator));
    }
    let ip = IpGeolocator::new(settings)?;
    if settings.cache_ttl.is_zero() {
        Ok(Box::new(ip))
    } else {
        Ok(Box::new(CachingGeolocator::new(ip, settings.cache_ttl)))
    }
}

// ----------------------------------------------------------------------------
// Simple geolocators
// ----------------------------------------------------------------------------

/// Geolocation turned off; always the sentinel.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledGeolocator;

impl Geolocator for DisabledGeolocator {
    fn resolve_location(&self) -> String {
        UNKNOWN_LOCATION.to_string()
    }
}

/// A configured place string.
#[derive(Clone, Debug)]
pub struct FixedLocation(pub String);

impl Geolocator for FixedLocation {
    fn resolve_location(&self) -> String {
        self.0.clone()
    }
}

/// Caches non-sentinel answers for `ttl`.
pub struct CachingGeolocator<G> {
    inner: G,
    ttl: Duration,
    cached: Mutex<Option<(Instant, String)>>,
}

impl<G: Geolocator> CachingGeolocator<G> {
    pub fn new(inner: G, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cached: Mutex::new(None),
        }
    }
}

impl<G: Geolocator> Geolocator for CachingGeolocator<G> {
    fn resolve_location(&self) -> String {
        if let Ok(guard) = self.cached.lock() {
            if let Some((at, location)) = guard.as_ref() {
                if at.elapsed() < self.ttl {
                    return location.clone();
                }
            }
        }
        // Resolve without holding the lock so a slow provider only delays this caller.
        let location = self.inner.resolve_location();
        if !is_sentinel(&location) {
            if let Ok(mut guard) = self.cached.lock() {
                *guard = Some((Instant::now(), location.clone()));
            }
        }
        location
    }
}

// ----------------------------------------------------------------------------
// IP-based geolocation
// ----------------------------------------------------------------------------

/// Two-stage lookup: IP → coordinates, then coordinates → place name.
pub struct IpGeolocator {
    agent: ureq::Agent,
    ip_lookup_url: Url,
    reverse_url: Url,
    timeout: Duration,
}

#[derive(Debug, PartialEq)]
enum GeoFailure {
    /// IP lookup failed; maps to `UNKNOWN_LOCATION`.
    NoCoordinates(String),
    /// Reverse geocoding failed or was empty; maps to `UNKNOWN`.
    NoPlaceName(String),
}

impl IpGeolocator {
    pub fn new(settings: &GeoSettings) -> Result<Self> {
        if settings.timeout.is_zero() || settings.timeout > MAX_GEO_TIMEOUT {
            return Err(anyhow!(
                "geolocation timeout must be within (0, {}s]",
                MAX_GEO_TIMEOUT.as_secs()
            ));
        }
        let ip_lookup_url = Url::parse(&settings.ip_lookup_url)
            .with_context(|| format!("invalid ip lookup url {}", settings.ip_lookup_url))?;
        let reverse_url = Url::parse(&settings.reverse_url)
            .with_context(|| format!("invalid reverse geocoding url {}", settings.reverse_url))?;
        let agent = ureq::AgentBuilder::new()
            .timeout(settings.timeout)
            .user_agent(&settings.user_agent)
            .build();
        Ok(Self {
            agent,
            ip_lookup_url,
            reverse_url,
            timeout: settings.timeout,
        })
    }

    fn try_resolve(&self) -> std::result::Result<String, GeoFailure> {
        let deadline = Instant::now() + self.timeout;

        let body = self
            .get(&self.ip_lookup_url, deadline)
            .map_err(|e| GeoFailure::NoCoordinates(e.to_string()))?;
        let (lat, lon) = parse_ip_lookup(&body)
            .ok_or_else(|| GeoFailure::NoCoordinates("ip lookup returned no coordinates".into()))?;

        let url = reverse_query(&self.reverse_url, lat, lon);
        let body = self
            .get(&url, deadline)
            .map_err(|e| GeoFailure::NoPlaceName(e.to_string()))?;
        parse_reverse(&body)
            .ok_or_else(|| GeoFailure::NoPlaceName("reverse geocoding returned no address".into()))
    }

    fn get(&self, url: &Url, deadline: Instant) -> Result<String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("geolocation deadline exceeded"));
        }
        let response = self
            .agent
            .request_url("GET", url)
            .timeout(remaining)
            .call()
            .map_err(|e| anyhow!("GET {}: {}", url, e))?;
        response
            .into_string()
            .with_context(|| format!("read body of {}", url))
    }
}

impl Geolocator for IpGeolocator {
    fn resolve_location(&self) -> String {
        match self.try_resolve() {
            Ok(place) => place,
            Err(GeoFailure::NoCoordinates(reason)) => {
                log::warn!("geolocation unavailable: {}", reason);
                UNKNOWN_LOCATION.to_string()
            }
            Err(GeoFailure::NoPlaceName(reason)) => {
                log::warn!("reverse geocoding unavailable: {}", reason);
                UNKNOWN.to_string()
            }
        }
    }
}

/// ip-api.com style body: `{"status":"success","lat":..,"lon":..}`.
#[derive(Debug, Deserialize)]
struct IpLookupBody {
    status: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
}

fn parse_ip_lookup(body: &str) -> Option<(f64, f64)> {
    let parsed: IpLookupBody = serde_json::from_str(body).ok()?;
    if parsed.status.as_deref().is_some_and(|s| s != "success") {
        return None;
    }
    match (parsed.lat, parsed.lon) {
        (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
        _ => None,
    }
}

/// Nominatim style body: `{"display_name": "..."}`.
#[derive(Debug, Deserialize)]
struct ReverseBody {
    display_name: Option<String>,
}

fn parse_reverse(body: &str) -> Option<String> {
    let parsed: ReverseBody = serde_json::from_str(body).ok()?;
    parsed
        .display_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn reverse_query(base: &Url, lat: f64, lon: f64) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("format", "jsonv2")
        .append_pair("lat", &lat.to_string())
        .append_pair("lon", &lon.to_string())
        .append_pair("accept-language", "en");
    url
}
