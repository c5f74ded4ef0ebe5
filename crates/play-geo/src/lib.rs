//! Geocoding and geodesic distance for the placement optimizer.
//!
//! The geocoder resolves `(city, region, country)` triples against an
//! external gazetteer and memoizes results (including misses) for the
//! process lifetime. Distance is great-circle Haversine.

#![forbid(unsafe_code)]

use parking_lot::RwLock;
use play_proto::Coord;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("coordinate out of range: ({lat}, {lon})")]
    BadCoord { lat: f64, lon: f64 },
}

/// Great-circle distance in kilometers between two coordinates.
///
/// Fails with [`GeoError::BadCoord`] for inputs outside the valid
/// latitude/longitude domain.
pub fn distance_km(a: Coord, b: Coord) -> Result<f64, GeoError> {
    for c in [a, b] {
        if !c.is_valid() {
            return Err(GeoError::BadCoord { lat: c.lat, lon: c.lon });
        }
    }

    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    Ok(2.0 * EARTH_RADIUS_KM * h.sqrt().asin())
}

// ─── Geocoder ─────────────────────────────────────────────────────────────────

/// Row shape of the gazetteer's JSON search response.
#[derive(Debug, Deserialize)]
struct GazetteerHit {
    lat: String,
    lon: String,
}

/// Gazetteer-backed geocoder with a process-local cache.
///
/// A lookup failure is not an error to callers: the place is treated as
/// unresolvable, cached as such, and ranking degrades gracefully.
pub struct Geocoder {
    endpoint: String,
    client: reqwest::Client,
    cache: RwLock<HashMap<String, Option<Coord>>>,
}

impl Geocoder {
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .user_agent("playops-control-plane")
            .build()
            .expect("failed to build HTTP client");
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a place triple to a coordinate. `None` means the place is
    /// unknown to the gazetteer (or the lookup failed); both outcomes are
    /// cached so repeat lookups stay local.
    pub async fn resolve(
        &self,
        city: &str,
        region: Option<&str>,
        country: Option<&str>,
    ) -> Option<Coord> {
        let key = cache_key(city, region, country);
        if let Some(cached) = self.cache.read().get(&key) {
            return *cached;
        }

        let resolved = self.lookup(&key).await;
        match resolved {
            Some(coord) => debug!(place = %key, lat = coord.lat, lon = coord.lon, "geocoded"),
            None => warn!(place = %key, "gazetteer could not resolve place"),
        }
        self.cache.write().insert(key, resolved);
        resolved
    }

    async fn lookup(&self, query: &str) -> Option<Coord> {
        let url = format!("{}/search", self.endpoint);
        let resp = self
            .client
            .get(&url)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(place = %query, error = %e, "gazetteer request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(place = %query, status = %resp.status(), "gazetteer returned error status");
            return None;
        }

        let hits: Vec<GazetteerHit> = match resp.json().await {
            Ok(h) => h,
            Err(e) => {
                warn!(place = %query, error = %e, "failed to parse gazetteer response");
                return None;
            }
        };

        let hit = hits.into_iter().next()?;
        let lat: f64 = hit.lat.parse().ok()?;
        let lon: f64 = hit.lon.parse().ok()?;
        let coord = Coord::new(lat, lon);
        coord.is_valid().then_some(coord)
    }

    /// Number of cached entries (hits and misses).
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Seed the cache directly. Used at startup for well-known places and
    /// by tests to avoid network lookups.
    pub fn seed(&self, city: &str, region: Option<&str>, country: Option<&str>, coord: Option<Coord>) {
        self.cache.write().insert(cache_key(city, region, country), coord);
    }
}

fn cache_key(city: &str, region: Option<&str>, country: Option<&str>) -> String {
    let mut parts = vec![city.trim().to_lowercase()];
    if let Some(r) = region {
        if !r.trim().is_empty() {
            parts.push(r.trim().to_lowercase());
        }
    }
    if let Some(c) = country {
        if !c.trim().is_empty() {
            parts.push(c.trim().to_lowercase());
        }
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NYC: Coord = Coord { lat: 40.7128, lon: -74.0060 };
    const BOSTON: Coord = Coord { lat: 42.3601, lon: -71.0589 };
    const DALLAS: Coord = Coord { lat: 32.7767, lon: -96.7970 };

    #[test]
    fn test_distance_zero_on_identical_points() {
        assert_eq!(distance_km(NYC, NYC).expect("distance"), 0.0);
    }

    #[test]
    fn test_distance_symmetric() {
        let ab = distance_km(NYC, BOSTON).expect("distance");
        let ba = distance_km(BOSTON, NYC).expect("distance");
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn test_distance_known_pair() {
        // New York to Boston is roughly 306 km great-circle.
        let d = distance_km(NYC, BOSTON).expect("distance");
        assert!((d - 306.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn test_triangle_inequality() {
        let ab = distance_km(NYC, BOSTON).expect("distance");
        let bc = distance_km(BOSTON, DALLAS).expect("distance");
        let ac = distance_km(NYC, DALLAS).expect("distance");
        assert!(ac <= ab + bc + 0.5);
    }

    #[test]
    fn test_bad_coord_rejected() {
        let bad = Coord::new(91.0, 0.0);
        assert!(matches!(distance_km(bad, NYC), Err(GeoError::BadCoord { .. })));
        assert!(matches!(distance_km(NYC, bad), Err(GeoError::BadCoord { .. })));
    }

    #[test]
    fn test_cache_key_normalization() {
        assert_eq!(cache_key("Boston", Some("MA"), Some("US")), "boston, ma, us");
        assert_eq!(cache_key(" Boston ", None, Some("US")), "boston, us");
        assert_eq!(cache_key("Boston", Some(""), None), "boston");
    }

    #[tokio::test]
    async fn test_seeded_cache_hit_skips_network() {
        // Endpoint is unroutable; a cache hit must not touch it.
        let geocoder = Geocoder::new("http://127.0.0.1:1/nominatim");
        geocoder.seed("Boston", Some("MA"), Some("US"), Some(BOSTON));

        let coord = geocoder.resolve("Boston", Some("MA"), Some("US")).await;
        assert_eq!(coord, Some(BOSTON));
        assert_eq!(geocoder.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_gazetteer_caches_miss() {
        let geocoder = Geocoder::new("http://127.0.0.1:1/nominatim");
        let coord = geocoder.resolve("Nowhereville", None, None).await;
        assert_eq!(coord, None);
        // The miss is cached; a second resolve is answered locally.
        assert_eq!(geocoder.cache_len(), 1);
        assert_eq!(geocoder.resolve("Nowhereville", None, None).await, None);
        assert_eq!(geocoder.cache_len(), 1);
    }
}
