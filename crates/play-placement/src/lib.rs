//! Location optimizer for the PlayOps control plane.
//!
//! Ranks Voltgrid inventory nodes by distance from the user (price as
//! tiebreak) and picks a Nimbus region via the remote region locator,
//! falling back to a built-in static table when the locator is down.
//!
//! Pure queries: the only side effect is filling the geocoder cache.

#![forbid(unsafe_code)]

use play_geo::{distance_km, Geocoder};
use play_proto::Coord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no inventory node satisfies the requested capabilities")]
    NoCandidate,
}

// ─── Voltgrid inventory ranking ──────────────────────────────────────────────

/// One node from Voltgrid's `GET /inventory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryNode {
    pub id: String,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    pub country: String,
    pub vcpu: u32,
    pub memory_gib: u32,
    pub gpu_count: u32,
    pub price_per_hour: f64,
    pub dedicated_ip: bool,
}

/// Minimum capabilities a candidate node must offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CapabilityMinima {
    pub min_vcpu: u32,
    pub min_memory_gib: u32,
    pub min_gpu_count: u32,
}

/// An inventory node with its computed distance from the user.
/// `distance_km: None` means the node's location did not geocode; such
/// nodes sort to the tail of the ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedNode {
    pub node: InventoryNode,
    pub distance_km: Option<f64>,
}

// ─── Nimbus regions ──────────────────────────────────────────────────────────

/// Built-in Nimbus region table used when the remote locator is
/// unavailable. Coordinates are the published data-center locations.
pub const NIMBUS_REGIONS: &[(&str, &str, f64, f64)] = &[
    ("na-central", "North America Central", 41.2619, -95.8608),
    ("na-east", "North America East", 39.0300, -77.4700),
    ("na-west", "North America West", 45.6046, -121.1794),
    ("eu-west", "Europe West", 50.4501, 3.8186),
    ("eu-central", "Europe Central", 50.1109, 8.6821),
    ("ap-southeast", "Asia Pacific Southeast", 1.3521, 103.8198),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionSource {
    /// Chosen by the remote region locator.
    Remote,
    /// Chosen from the static table by geodesic distance.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionChoice {
    pub code: String,
    pub display_name: String,
    pub distance_km: Option<f64>,
    pub source: RegionSource,
}

#[derive(Debug, Deserialize)]
struct LocatorResponse {
    regions: Vec<LocatorRegion>,
}

#[derive(Debug, Deserialize)]
struct LocatorRegion {
    code: String,
}

// ─── Placement service ───────────────────────────────────────────────────────

pub struct PlacementService {
    geocoder: Arc<Geocoder>,
    locator_endpoint: String,
    locator_project: String,
    client: reqwest::Client,
}

impl PlacementService {
    pub fn new(geocoder: Arc<Geocoder>, locator_endpoint: &str, locator_project: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");
        Self {
            geocoder,
            locator_endpoint: locator_endpoint.trim_end_matches('/').to_string(),
            locator_project: locator_project.to_string(),
            client,
        }
    }

    /// Rank Voltgrid inventory for a session. The head of the returned
    /// list is the recommended placement.
    ///
    /// With a user coordinate, ordering is `(distance, price)`; without
    /// one, price alone. An empty post-filter candidate set fails with
    /// [`PlacementError::NoCandidate`] before any geocoding happens.
    pub async fn rank_inventory(
        &self,
        user: Option<Coord>,
        nodes: Vec<InventoryNode>,
        minima: CapabilityMinima,
    ) -> Result<Vec<RankedNode>, PlacementError> {
        let candidates: Vec<InventoryNode> = nodes
            .into_iter()
            .filter(|n| {
                n.dedicated_ip
                    && n.vcpu >= minima.min_vcpu
                    && n.memory_gib >= minima.min_memory_gib
                    && n.gpu_count >= minima.min_gpu_count
            })
            .collect();

        if candidates.is_empty() {
            return Err(PlacementError::NoCandidate);
        }

        let mut ranked = Vec::with_capacity(candidates.len());
        for node in candidates {
            let distance = match user {
                Some(user_coord) => self.node_distance(user_coord, &node).await,
                None => None,
            };
            ranked.push(RankedNode { node, distance_km: distance });
        }

        if user.is_some() {
            ranked.sort_by(|a, b| {
                let da = a.distance_km.unwrap_or(f64::INFINITY);
                let db = b.distance_km.unwrap_or(f64::INFINITY);
                da.total_cmp(&db)
                    .then(a.node.price_per_hour.total_cmp(&b.node.price_per_hour))
            });
        } else {
            ranked.sort_by(|a, b| a.node.price_per_hour.total_cmp(&b.node.price_per_hour));
        }

        Ok(ranked)
    }

    async fn node_distance(&self, user: Coord, node: &InventoryNode) -> Option<f64> {
        let coord = self
            .geocoder
            .resolve(&node.city, node.region.as_deref(), Some(&node.country))
            .await?;
        match distance_km(user, coord) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(node = %node.id, error = %e, "distance computation failed");
                None
            }
        }
    }

    /// Pick the Nimbus region for a user: remote locator first, static
    /// distance ranking on any failure.
    pub async fn pick_nimbus_region(&self, user: Option<Coord>) -> RegionChoice {
        if let Some(coord) = user {
            match self.locate_remote(coord).await {
                Ok(choice) => return choice,
                Err(e) => {
                    warn!(error = %e, "region locator unavailable, falling back to static table");
                }
            }
            return self
                .nimbus_candidates(Some(coord))
                .into_iter()
                .next()
                .unwrap_or_else(default_region);
        }

        default_region()
    }

    /// All Nimbus regions ranked by distance from the user (static table).
    pub fn nimbus_candidates(&self, user: Option<Coord>) -> Vec<RegionChoice> {
        let mut choices: Vec<RegionChoice> = NIMBUS_REGIONS
            .iter()
            .map(|(code, name, lat, lon)| {
                let distance = user.and_then(|u| distance_km(u, Coord::new(*lat, *lon)).ok());
                RegionChoice {
                    code: (*code).to_string(),
                    display_name: (*name).to_string(),
                    distance_km: distance,
                    source: RegionSource::Local,
                }
            })
            .collect();
        if user.is_some() {
            choices.sort_by(|a, b| {
                a.distance_km
                    .unwrap_or(f64::INFINITY)
                    .total_cmp(&b.distance_km.unwrap_or(f64::INFINITY))
            });
        }
        choices
    }

    async fn locate_remote(&self, user: Coord) -> Result<RegionChoice, String> {
        let url = format!("{}/regions", self.locator_endpoint);
        let proximity = format!("{},{}", user.lat, user.lon);
        let resp = self
            .client
            .get(&url)
            .query(&[("proximity", proximity.as_str()), ("project", self.locator_project.as_str())])
            .send()
            .await
            .map_err(|e| format!("locator request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(format!("locator returned {}", resp.status()));
        }

        let body: LocatorResponse = resp
            .json()
            .await
            .map_err(|e| format!("locator response parse failed: {e}"))?;

        let first = body
            .regions
            .into_iter()
            .next()
            .ok_or_else(|| "locator returned no regions".to_string())?;

        let known = NIMBUS_REGIONS
            .iter()
            .find(|(code, ..)| *code == first.code)
            .ok_or_else(|| format!("locator returned unknown region '{}'", first.code))?;

        info!(region = %known.0, "region locator selected Nimbus region");
        Ok(RegionChoice {
            code: known.0.to_string(),
            display_name: known.1.to_string(),
            distance_km: distance_km(user, Coord::new(known.2, known.3)).ok(),
            source: RegionSource::Remote,
        })
    }
}

fn default_region() -> RegionChoice {
    let (code, name, ..) = NIMBUS_REGIONS[0];
    RegionChoice {
        code: code.to_string(),
        display_name: name.to_string(),
        distance_km: None,
        source: RegionSource::Local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, city: &str, country: &str, vcpu: u32, price: f64) -> InventoryNode {
        InventoryNode {
            id: id.to_string(),
            city: city.to_string(),
            region: None,
            country: country.to_string(),
            vcpu,
            memory_gib: 16,
            gpu_count: 1,
            price_per_hour: price,
            dedicated_ip: true,
        }
    }

    fn minima() -> CapabilityMinima {
        CapabilityMinima { min_vcpu: 4, min_memory_gib: 8, min_gpu_count: 1 }
    }

    /// Geocoder with an unroutable endpoint; tests must pre-seed it.
    fn offline_service() -> PlacementService {
        let geocoder = Arc::new(Geocoder::new("http://127.0.0.1:1/gazetteer"));
        PlacementService::new(geocoder, "http://127.0.0.1:1/locator", "proj-test")
    }

    fn seeded_service() -> PlacementService {
        let geocoder = Arc::new(Geocoder::new("http://127.0.0.1:1/gazetteer"));
        geocoder.seed("Boston", None, Some("US"), Some(Coord::new(42.3601, -71.0589)));
        geocoder.seed("Dallas", None, Some("US"), Some(Coord::new(32.7767, -96.7970)));
        geocoder.seed("Frankfurt", None, Some("DE"), Some(Coord::new(50.1109, 8.6821)));
        PlacementService::new(geocoder, "http://127.0.0.1:1/locator", "proj-test")
    }

    #[tokio::test]
    async fn test_rank_by_distance_for_us_east_user() {
        let svc = seeded_service();
        let user = Coord::new(40.7128, -74.0060); // New York
        let nodes = vec![
            node("n-dallas", "Dallas", "US", 8, 0.30),
            node("n-boston", "Boston", "US", 8, 0.50),
        ];

        let ranked = svc.rank_inventory(Some(user), nodes, minima()).await.expect("rank");
        assert_eq!(ranked[0].node.id, "n-boston");
        assert!(ranked[0].distance_km.expect("distance") < ranked[1].distance_km.expect("distance"));
    }

    #[tokio::test]
    async fn test_price_tiebreak_without_user_coord() {
        let svc = seeded_service();
        let nodes = vec![
            node("n-expensive", "Boston", "US", 8, 0.90),
            node("n-cheap", "Dallas", "US", 8, 0.25),
        ];

        let ranked = svc.rank_inventory(None, nodes, minima()).await.expect("rank");
        assert_eq!(ranked[0].node.id, "n-cheap");
        assert!(ranked[0].distance_km.is_none());
    }

    #[tokio::test]
    async fn test_minima_filter_and_dedicated_ip() {
        let svc = seeded_service();
        let mut no_ip = node("n-no-ip", "Boston", "US", 8, 0.10);
        no_ip.dedicated_ip = false;
        let nodes = vec![
            no_ip,
            node("n-small", "Boston", "US", 2, 0.10),
            node("n-fit", "Dallas", "US", 8, 0.40),
        ];

        let ranked = svc
            .rank_inventory(Some(Coord::new(40.7, -74.0)), nodes, minima())
            .await
            .expect("rank");
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].node.id, "n-fit");
    }

    #[tokio::test]
    async fn test_empty_inventory_skips_geocoder() {
        let svc = offline_service();
        let result = svc.rank_inventory(Some(Coord::new(0.0, 0.0)), vec![], minima()).await;
        assert!(matches!(result, Err(PlacementError::NoCandidate)));
        assert_eq!(svc.geocoder.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_node_sinks_to_tail() {
        let svc = seeded_service();
        let user = Coord::new(40.7128, -74.0060);
        let nodes = vec![
            node("n-mystery", "Atlantis", "XX", 8, 0.01),
            node("n-boston", "Boston", "US", 8, 0.50),
        ];

        let ranked = svc.rank_inventory(Some(user), nodes, minima()).await.expect("rank");
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].node.id, "n-boston");
        assert_eq!(ranked[1].node.id, "n-mystery");
        assert!(ranked[1].distance_km.is_none());
    }

    #[tokio::test]
    async fn test_origin_coordinate_still_ranks() {
        let svc = seeded_service();
        let nodes = vec![
            node("n-boston", "Boston", "US", 8, 0.50),
            node("n-frankfurt", "Frankfurt", "DE", 8, 0.40),
        ];

        let ranked = svc
            .rank_inventory(Some(Coord::new(0.0, 0.0)), nodes, minima())
            .await
            .expect("rank");
        // Frankfurt is closer to (0, 0) than Boston.
        assert_eq!(ranked[0].node.id, "n-frankfurt");
    }

    #[tokio::test]
    async fn test_nimbus_fallback_when_locator_down() {
        let svc = offline_service();
        let frankfurt = Coord::new(50.1109, 8.6821);

        let choice = svc.pick_nimbus_region(Some(frankfurt)).await;
        assert_eq!(choice.source, RegionSource::Local);
        assert_eq!(choice.code, "eu-central");
    }

    #[tokio::test]
    async fn test_nimbus_default_without_user_coord() {
        let svc = offline_service();
        let choice = svc.pick_nimbus_region(None).await;
        assert_eq!(choice.source, RegionSource::Local);
        assert_eq!(choice.code, NIMBUS_REGIONS[0].0);
    }

    #[test]
    fn test_nimbus_candidates_sorted_by_distance() {
        let svc = offline_service();
        let singapore = Coord::new(1.29, 103.85);
        let candidates = svc.nimbus_candidates(Some(singapore));
        assert_eq!(candidates[0].code, "ap-southeast");
        let distances: Vec<f64> = candidates.iter().filter_map(|c| c.distance_km).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }
}
