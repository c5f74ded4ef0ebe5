//! Shared fixtures for PlayOps scenario tests: an in-memory provider
//! driver with scripted behavior and a fully wired control-plane stack
//! backed by temp-dir stores and offline (seeded) geo services.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use play_billing::RateTable;
use play_geo::Geocoder;
use play_orchestrator::{Orchestrator, OrchestratorConfig};
use play_persist::{HostStore, ProfileStore};
use play_placement::{InventoryNode, PlacementService};
use play_proto::{
    Codec, Coord, HostProvider, PlatformProfile, ProviderPreference, ProviderState, Tier,
};
use play_provision::{
    CreateOutcome, CreateSpec, DriverError, DriverRegistry, HostDescription, HostDriver,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Scripted in-memory provider driver.
#[derive(Debug)]
pub struct FakeDriver {
    pub provider: HostProvider,
    pub inventory: Vec<InventoryNode>,
    /// When set, `describe` reports this instead of a running host.
    pub describe_error: Mutex<Option<&'static str>>,
    pub create_calls: Mutex<u32>,
    pub stop_calls: Mutex<u32>,
    pub start_calls: Mutex<u32>,
    pub destroy_calls: Mutex<u32>,
    pub last_spec: Mutex<Option<CreateSpec>>,
}

impl FakeDriver {
    pub fn voltgrid(inventory: Vec<InventoryNode>) -> Arc<Self> {
        Arc::new(Self {
            provider: HostProvider::Voltgrid,
            inventory,
            describe_error: Mutex::new(None),
            create_calls: Mutex::new(0),
            stop_calls: Mutex::new(0),
            start_calls: Mutex::new(0),
            destroy_calls: Mutex::new(0),
            last_spec: Mutex::new(None),
        })
    }

    pub fn nimbus() -> Arc<Self> {
        Arc::new(Self {
            provider: HostProvider::Nimbus,
            inventory: Vec::new(),
            describe_error: Mutex::new(None),
            create_calls: Mutex::new(0),
            stop_calls: Mutex::new(0),
            start_calls: Mutex::new(0),
            destroy_calls: Mutex::new(0),
            last_spec: Mutex::new(None),
        })
    }

    /// Make `describe` report the host as missing (orphan simulation).
    pub fn lose_host(&self) {
        *self.describe_error.lock() = Some("not_found");
    }
}

#[async_trait]
impl HostDriver for FakeDriver {
    fn provider(&self) -> HostProvider {
        self.provider
    }

    async fn list_inventory(&self) -> Result<Vec<InventoryNode>, DriverError> {
        Ok(self.inventory.clone())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<CreateOutcome, DriverError> {
        *self.create_calls.lock() += 1;
        *self.last_spec.lock() = Some(spec.clone());
        Ok(CreateOutcome {
            provider_handle: format!("fake-{}", spec.name),
            provider_metadata: HashMap::new(),
        })
    }

    async fn describe(&self, _handle: &str) -> Result<HostDescription, DriverError> {
        if self.describe_error.lock().is_some() {
            return Err(DriverError::NotFound);
        }
        Ok(HostDescription {
            provider_state: ProviderState::Running,
            address: Some("127.0.0.1".to_string()),
        })
    }

    async fn start(&self, _handle: &str) -> Result<(), DriverError> {
        *self.start_calls.lock() += 1;
        Ok(())
    }

    async fn stop(&self, _handle: &str) -> Result<(), DriverError> {
        *self.stop_calls.lock() += 1;
        Ok(())
    }

    async fn destroy(&self, _handle: &str) -> Result<(), DriverError> {
        *self.destroy_calls.lock() += 1;
        Ok(())
    }

    async fn wait_ready(&self, _handle: &str, _max_wait: Duration) -> Result<HostDescription, DriverError> {
        Ok(HostDescription {
            provider_state: ProviderState::Running,
            address: Some("127.0.0.1".to_string()),
        })
    }

    fn translate(&self, s: &str) -> ProviderState {
        match s {
            "running" => ProviderState::Running,
            "stopped" => ProviderState::Stopped,
            _ => ProviderState::Unknown,
        }
    }
}

// ─── Stack fixture ───────────────────────────────────────────────────────────

pub struct Stack {
    pub orch: Arc<Orchestrator>,
    pub hosts: Arc<HostStore>,
    pub profiles: Arc<ProfileStore>,
    pub drivers: Arc<DriverRegistry>,
    pub rates: Arc<RateTable>,
    _dir: tempfile::TempDir,
}

pub fn inventory_node(id: &str, city: &str, price: f64) -> InventoryNode {
    InventoryNode {
        id: id.to_string(),
        city: city.to_string(),
        region: None,
        country: "US".to_string(),
        vcpu: 8,
        memory_gib: 16,
        gpu_count: 1,
        price_per_hour: price,
        dedicated_ip: true,
    }
}

pub fn profile(platform: &str, provider: HostProvider) -> PlatformProfile {
    PlatformProfile {
        platform: platform.to_string(),
        display_name: platform.to_uppercase(),
        platform_family: "retro".to_string(),
        preferred_providers: vec![ProviderPreference {
            provider,
            priority: 1,
            enabled: true,
            tier_override: None,
            hourly_cost_cap: None,
        }],
        default_tier: Tier::Basic,
        min_vcpu: 2,
        min_memory_gib: 4,
        min_gpu_count: 0,
        requires_gpu: false,
        max_session_hours: 8,
        app_image: "registry.playops.io/emu/retro:3".to_string(),
        default_app_config: serde_json::json!({}),
        firmware_ref: None,
        resolution: "1920x1080".to_string(),
        fps: 60,
        codec: Codec::H264,
        dual_screen: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Wire a full stack around the given drivers. The geocoder and region
/// locator point at unroutable endpoints; common US cities are seeded so
/// ranking works offline.
pub fn build_stack(drivers: Vec<Arc<FakeDriver>>, profiles: Vec<PlatformProfile>) -> Stack {
    let dir = tempfile::tempdir().expect("tempdir");
    let hosts = Arc::new(HostStore::open(dir.path(), "hosts"));
    let profile_store = Arc::new(ProfileStore::open(dir.path(), "platforms"));
    for p in profiles {
        profile_store.upsert(p).expect("profile");
    }

    let mut registry = DriverRegistry::new();
    for d in drivers {
        registry.register(d);
    }
    let registry = Arc::new(registry);

    let geocoder = Arc::new(Geocoder::new("http://127.0.0.1:1/gazetteer"));
    geocoder.seed("Boston", None, Some("US"), Some(Coord::new(42.3601, -71.0589)));
    geocoder.seed("Dallas", None, Some("US"), Some(Coord::new(32.7767, -96.7970)));
    let placement = Arc::new(PlacementService::new(
        geocoder,
        "http://127.0.0.1:1/locator",
        "proj-test",
    ));

    let rates = Arc::new(RateTable::builtin());
    let orch = Arc::new(Orchestrator::new(
        hosts.clone(),
        profile_store.clone(),
        registry.clone(),
        placement,
        rates.clone(),
        OrchestratorConfig {
            create_backoff_initial: Duration::from_millis(5),
            create_backoff_cap: Duration::from_millis(20),
            client_cert_pem: "-----BEGIN CERTIFICATE-----\nit\n-----END CERTIFICATE-----".to_string(),
            ..OrchestratorConfig::default()
        },
    ));

    Stack { orch, hosts, profiles: profile_store, drivers: registry, rates, _dir: dir }
}

/// Poll the store until the host reaches `state` (or panic after ~3 s).
pub async fn wait_for_state(
    hosts: &HostStore,
    host_id: &str,
    state: play_proto::HostState,
) -> play_proto::Host {
    for _ in 0..300 {
        if let Some(host) = hosts.get(host_id) {
            if host.state == state {
                return host;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("host {host_id} never reached {state}");
}
